//! Runtime settings loaded from environment variables
//!
//! Every value has a default, so an empty environment yields a working
//! configuration apart from `TELEGRAM_BOT_TOKEN`, which is only demanded when
//! the Telegram channel is built. `main` loads a `.env` file with `dotenvy`
//! before calling [`Settings::from_env`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::threshold::ThresholdPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

/// Scan depth of a category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryTier {
    HighTraffic,
    Standard,
}

/// One catalog category to scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryConfig {
    pub name: String,
    pub node_id: String,
    pub pages: u32,
    pub emoji: String,
}

const HIGH_TRAFFIC_CATEGORIES: &[(&str, &str, &str)] = &[
    ("Electronics & Gadgets", "976420031", "⚡"),
    ("Fashion & Apparel", "1571272031", "👗"),
    ("Beauty", "1355017031", "💄"),
    ("Health & Personal Care", "1350385031", "💊"),
    ("Jewellery", "1951046031", "💎"),
    ("Sports, Fitness & Outdoors", "1984444031", "🏋️"),
];

const STANDARD_CATEGORIES: &[(&str, &str, &str)] = &[
    ("Biscuits & Cookies", "2899877031", "🍪"),
    ("Snacks & Nuts (General)", "2899879031", "🥜"),
    ("Namkeen & Savory Snacks", "2899881031", "🍿"),
    ("Headphones", "1388921031", "🎧"),
    ("Luxury Beauty", "5311359031", "🧴"),
    ("Chocolates & Confectionery", "2899882031", "🍫"),
];

const DEFAULT_EMOJI: &str = "🔥";

pub const DEFAULT_TIPS: &[&str] = &[
    "Pro tip: Combine bank cashback + coupon codes for extra savings.",
    "Shopping hack: Check Subscribe & Save for extra discounts.",
    "Sale alert: Big sale seasons are usually Jan and Oct.",
    "Gift card trick: Buy gift cards during sales for extra value.",
    "Free shipping: Add items totaling ₹499+ for free delivery (eligible orders).",
];

#[derive(Debug, Clone)]
pub struct Settings {
    // Telegram
    pub telegram_bot_token: Option<String>,
    pub telegram_channel_id: String,
    pub telegram_api_base: String,
    pub associate_id: String,

    // Catalog
    pub categories: Vec<CategoryConfig>,
    pub sort: String,
    pub max_candidates_per_category: usize,
    pub max_detail_lookups: usize,
    pub stop_on_captcha: bool,

    // Deal selection
    pub minimum_discount: u8,
    pub dynamic_discount: bool,
    pub target_deals_per_run: usize,
    pub lowest_discount_floor: u8,
    pub discount_fallback_step: u8,
    pub max_posts_per_run: usize,

    // Fetching
    pub request_timeout: Duration,
    pub max_request_attempts: u32,
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    // Dedup store
    pub db_path: String,
    pub retention_days: i64,
    pub cooldown_hours: i64,
    pub repost_price_drop_percent: f64,
    pub legacy_json_path: Option<PathBuf>,

    // Dispatch
    pub dispatch_attempts: u32,
    pub dispatch_retry_delay: Duration,
    pub value_add_frequency: usize,
    pub tips: Vec<String>,

    pub run_schedule: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let pages_high = 2;
        let pages_standard = 1;

        Self {
            telegram_bot_token: None,
            telegram_channel_id: "@SEMMAOFFERS".to_string(),
            telegram_api_base: "https://api.telegram.org".to_string(),
            associate_id: "semmaoffers-21".to_string(),
            categories: default_categories(pages_high, pages_standard),
            sort: "discount-rank".to_string(),
            max_candidates_per_category: 35,
            max_detail_lookups: 10,
            stop_on_captcha: true,
            minimum_discount: 60,
            dynamic_discount: true,
            target_deals_per_run: 12,
            lowest_discount_floor: 40,
            discount_fallback_step: 5,
            max_posts_per_run: 8,
            request_timeout: Duration::from_secs(20),
            max_request_attempts: 4,
            min_sleep: Duration::from_millis(800),
            max_sleep: Duration::from_millis(2200),
            backoff_base: Duration::from_millis(1500),
            backoff_max: Duration::from_secs(20),
            db_path: "database/deals.db".to_string(),
            retention_days: 14,
            cooldown_hours: 72,
            repost_price_drop_percent: 8.0,
            legacy_json_path: None,
            dispatch_attempts: 3,
            dispatch_retry_delay: Duration::from_secs(2),
            value_add_frequency: 10,
            tips: DEFAULT_TIPS.iter().map(ToString::to_string).collect(),
            run_schedule: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let d = Self::default();

        let pages_high = parse_or(&get, "PAGES_PER_HIGH_TRAFFIC_CATEGORY", 2u32)?;
        let pages_standard = parse_or(&get, "PAGES_PER_STANDARD_CATEGORY", 1u32)?;
        let categories = match get("CATEGORIES") {
            Some(raw) => parse_categories(&raw, pages_standard)?,
            None => default_categories(pages_high, pages_standard),
        };

        let settings = Self {
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_channel_id: get("TELEGRAM_CHANNEL_ID").unwrap_or(d.telegram_channel_id),
            telegram_api_base: get("TELEGRAM_API_BASE")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.telegram_api_base),
            associate_id: lookup("AMAZON_ASSOCIATE_ID")
                .map(|s| s.trim().to_string())
                .unwrap_or(d.associate_id),
            categories,
            sort: get("AMAZON_SORT").unwrap_or(d.sort),
            max_candidates_per_category: parse_or(
                &get,
                "MAX_CANDIDATES_PER_CATEGORY",
                d.max_candidates_per_category,
            )?,
            max_detail_lookups: parse_or(&get, "MAX_DETAIL_LOOKUPS", d.max_detail_lookups)?,
            stop_on_captcha: flag_or(&get, "STOP_ON_CAPTCHA", d.stop_on_captcha),
            minimum_discount: parse_or(&get, "MINIMUM_DISCOUNT", d.minimum_discount)?,
            dynamic_discount: flag_or(&get, "ENABLE_DYNAMIC_DISCOUNT", d.dynamic_discount),
            target_deals_per_run: parse_or(&get, "TARGET_DEALS_PER_RUN", d.target_deals_per_run)?,
            lowest_discount_floor: parse_or(
                &get,
                "LOWEST_DISCOUNT_FLOOR",
                d.lowest_discount_floor,
            )?,
            discount_fallback_step: parse_or(
                &get,
                "DISCOUNT_FALLBACK_STEP",
                d.discount_fallback_step,
            )?,
            max_posts_per_run: parse_or(&get, "MAX_POSTS_PER_RUN", d.max_posts_per_run)?,
            request_timeout: seconds_or(&get, "REQUEST_TIMEOUT_SECONDS", d.request_timeout)?,
            max_request_attempts: parse_or(&get, "MAX_REQUEST_RETRIES", d.max_request_attempts)?
                .max(1),
            min_sleep: seconds_or(&get, "MIN_SLEEP_SECONDS", d.min_sleep)?,
            max_sleep: seconds_or(&get, "MAX_SLEEP_SECONDS", d.max_sleep)?,
            backoff_base: seconds_or(&get, "RETRY_BACKOFF_BASE_SECONDS", d.backoff_base)?,
            backoff_max: seconds_or(&get, "RETRY_BACKOFF_MAX_SECONDS", d.backoff_max)?,
            db_path: get("DB_PATH").unwrap_or(d.db_path),
            retention_days: parse_or(&get, "DB_RETENTION_DAYS", d.retention_days)?,
            cooldown_hours: parse_or(&get, "POST_COOLDOWN_HOURS", d.cooldown_hours)?,
            repost_price_drop_percent: parse_or(
                &get,
                "REPOST_PRICE_DROP_PERCENT",
                d.repost_price_drop_percent,
            )?,
            legacy_json_path: get("LEGACY_JSON_PATH").map(PathBuf::from),
            dispatch_attempts: parse_or(&get, "DISPATCH_ATTEMPTS", d.dispatch_attempts)?.max(1),
            dispatch_retry_delay: seconds_or(
                &get,
                "DISPATCH_RETRY_DELAY_SECONDS",
                d.dispatch_retry_delay,
            )?,
            value_add_frequency: parse_or(
                &get,
                "VALUE_ADD_CONTENT_FREQUENCY",
                d.value_add_frequency,
            )?,
            tips: d.tips,
            run_schedule: get("RUN_SCHEDULE"),
            log_level: get("LOG_LEVEL")
                .map(|s| s.to_lowercase())
                .unwrap_or(d.log_level),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_sleep > self.max_sleep {
            return Err(ConfigError::Inconsistent(format!(
                "MIN_SLEEP_SECONDS ({:?}) exceeds MAX_SLEEP_SECONDS ({:?})",
                self.min_sleep, self.max_sleep
            )));
        }
        if self.minimum_discount > 100 || self.lowest_discount_floor > 100 {
            return Err(ConfigError::Inconsistent(
                "discount thresholds must be within 0..=100".to_string(),
            ));
        }
        if self.retention_days < 0 || self.cooldown_hours < 0 {
            return Err(ConfigError::Inconsistent(
                "retention and cooldown windows must not be negative".to_string(),
            ));
        }
        self.retention()?;
        if chrono::TimeDelta::try_hours(self.cooldown_hours).is_none() {
            return Err(ConfigError::Invalid {
                key: "POST_COOLDOWN_HOURS",
                value: self.cooldown_hours.to_string(),
            });
        }
        Ok(())
    }

    /// Dedup retention window.
    pub fn retention(&self) -> Result<chrono::TimeDelta, ConfigError> {
        chrono::TimeDelta::try_days(self.retention_days).ok_or_else(|| ConfigError::Invalid {
            key: "DB_RETENTION_DAYS",
            value: self.retention_days.to_string(),
        })
    }

    /// Settings that are accepted but probably a mistake.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self
            .retention_days
            .checked_mul(24)
            .is_some_and(|hours| hours < self.cooldown_hours)
        {
            warnings.push(format!(
                "DB_RETENTION_DAYS ({}) is shorter than POST_COOLDOWN_HOURS ({}); records may be pruned mid-cooldown",
                self.retention_days, self.cooldown_hours
            ));
        }
        if self.value_add_frequency > 0 && self.tips.is_empty() {
            warnings.push("VALUE_ADD_CONTENT_FREQUENCY is set but no tips are configured".to_string());
        }
        warnings
    }

    pub fn bot_token(&self) -> Result<&str, ConfigError> {
        self.telegram_bot_token
            .as_deref()
            .ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))
    }

    pub fn threshold_policy(&self) -> ThresholdPolicy {
        ThresholdPolicy {
            dynamic: self.dynamic_discount,
            base: self.minimum_discount,
            floor: self.lowest_discount_floor,
            step: self.discount_fallback_step,
            target_count: self.target_deals_per_run,
        }
    }

    /// Lowest cutoff a run may end up using, sent to the catalog as a pre-filter.
    pub fn lowest_possible_threshold(&self) -> u8 {
        if self.dynamic_discount {
            self.lowest_discount_floor.min(self.minimum_discount)
        } else {
            self.minimum_discount
        }
    }

    pub fn emoji_for(&self, category: &str) -> &str {
        self.categories
            .iter()
            .find(|c| c.name == category)
            .map_or(DEFAULT_EMOJI, |c| c.emoji.as_str())
    }

    /// Outbound link carrying the associate tag, if one is configured.
    pub fn affiliate_link(&self, source_url: &str) -> String {
        if self.associate_id.is_empty() {
            source_url.to_string()
        } else {
            format!(
                "{source_url}?tag={}",
                urlencoding::encode(&self.associate_id)
            )
        }
    }
}

fn default_categories(pages_high: u32, pages_standard: u32) -> Vec<CategoryConfig> {
    let tiers = [
        (HIGH_TRAFFIC_CATEGORIES, CategoryTier::HighTraffic),
        (STANDARD_CATEGORIES, CategoryTier::Standard),
    ];

    tiers
        .iter()
        .flat_map(|(set, tier)| {
            let pages = match tier {
                CategoryTier::HighTraffic => pages_high,
                CategoryTier::Standard => pages_standard,
            };
            set.iter().map(move |(name, node, emoji)| CategoryConfig {
                name: (*name).to_string(),
                node_id: (*node).to_string(),
                pages,
                emoji: (*emoji).to_string(),
            })
        })
        .collect()
}

/// Parses `Name=node[:pages]` entries separated by `|`.
fn parse_categories(raw: &str, default_pages: u32) -> Result<Vec<CategoryConfig>, ConfigError> {
    let known_emoji: HashMap<&str, &str> = HIGH_TRAFFIC_CATEGORIES
        .iter()
        .chain(STANDARD_CATEGORIES)
        .map(|(name, _, emoji)| (*name, *emoji))
        .collect();

    let invalid = || ConfigError::Invalid {
        key: "CATEGORIES",
        value: raw.to_string(),
    };

    let mut categories = Vec::new();
    for entry in raw.split('|').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, spec) = entry.rsplit_once('=').ok_or_else(invalid)?;
        let (node_id, pages) = match spec.split_once(':') {
            Some((node, pages)) => (node.trim(), pages.trim().parse().map_err(|_| invalid())?),
            None => (spec.trim(), default_pages),
        };
        let name = name.trim();
        if name.is_empty() || node_id.is_empty() || !node_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        categories.push(CategoryConfig {
            name: name.to_string(),
            node_id: node_id.to_string(),
            pages,
            emoji: known_emoji.get(name).copied().unwrap_or(DEFAULT_EMOJI).to_string(),
        });
    }

    if categories.is_empty() {
        return Err(invalid());
    }
    Ok(categories)
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn flag_or<G>(get: &G, key: &str, default: bool) -> bool
where
    G: Fn(&str) -> Option<String>,
{
    get(key).map_or(default, |v| v != "0")
}

fn seconds_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(value) = get(key) else {
        return Ok(default);
    };
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or(ConfigError::Invalid { key, value })
}
