//! Data models for discovered deals, dedup records and Telegram Bot API payloads

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalog host every detail link is derived from.
pub const CATALOG_BASE_URL: &str = "https://www.amazon.in";

const ITEM_ID_LEN: usize = 10;

/// Catalog item identifier (ASIN): exactly ten ASCII alphanumerics, upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Validates and normalizes a raw identifier. Returns `None` for anything
    /// that is not a fixed-length alphanumeric code.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != ITEM_ID_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A discovered deal, not yet validated for posting.
///
/// Prices are optional because listing pages frequently omit one or both;
/// `original_price` is only ever held when it is strictly above `deal_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ItemId,
    pub title: String,
    pub category: String,
    deal_price: Option<f64>,
    original_price: Option<f64>,
    badge_discount: Option<u8>,
    pub image_url: Option<String>,
    pub limited_time: bool,
}

impl Candidate {
    /// Returns `None` when the title is blank after whitespace normalization.
    pub fn new(id: ItemId, title: &str, category: &str) -> Option<Self> {
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if title.is_empty() {
            return None;
        }

        Some(Self {
            id,
            title,
            category: category.to_string(),
            deal_price: None,
            original_price: None,
            badge_discount: None,
            image_url: None,
            limited_time: false,
        })
    }

    pub fn deal_price(&self) -> Option<f64> {
        self.deal_price
    }

    pub fn original_price(&self) -> Option<f64> {
        self.original_price
    }

    pub fn badge_discount(&self) -> Option<u8> {
        self.badge_discount
    }

    /// Sets both prices. A non-positive deal price is dropped, and the
    /// original price is kept only if it exceeds the deal price.
    pub fn set_prices(&mut self, deal: Option<f64>, original: Option<f64>) {
        self.deal_price = deal.filter(|p| p.is_finite() && *p > 0.0);
        self.original_price = match (self.deal_price, original) {
            (Some(deal), Some(orig)) if orig.is_finite() && orig > deal => Some(orig),
            _ => None,
        };
    }

    /// Stores a page-displayed percentage if it lies in 0..=100.
    pub fn set_badge_discount(&mut self, percent: Option<u32>) {
        self.badge_discount = percent.filter(|p| *p <= 100).map(|p| p as u8);
    }

    /// Discount computed from the two prices, when they are meaningful.
    pub fn computed_discount(&self) -> Option<u8> {
        compute_discount(self.deal_price?, self.original_price?)
    }

    /// Effective discount. The badge value is only trusted when no deal
    /// price could be extracted at all.
    pub fn discount_percent(&self) -> Option<u8> {
        match self.deal_price {
            Some(_) => self.computed_discount(),
            None => self.badge_discount,
        }
    }

    /// `id`, `title` and `deal_price` are all present.
    pub fn is_well_formed(&self) -> bool {
        self.deal_price.is_some()
    }

    /// Postable at `threshold`: well-formed with a discount at or above it.
    pub fn qualifies_at(&self, threshold: u8) -> bool {
        self.is_well_formed() && self.discount_percent().is_some_and(|d| d >= threshold)
    }

    /// Missing price or discount data that a detail page might supply.
    pub fn needs_enrichment(&self) -> bool {
        self.deal_price.is_none() || self.computed_discount().is_none()
    }

    /// Canonical detail page, derived from the identifier only.
    pub fn source_url(&self) -> String {
        detail_url(&self.id)
    }

    /// Fills fields that are still empty from a detail-page parse.
    /// Populated fields are never overwritten. Returns whether anything changed.
    pub fn backfill(&mut self, detail: &Candidate) -> bool {
        let mut changed = false;

        if self.deal_price.is_none() && detail.deal_price.is_some() {
            let original = self.original_price.or(detail.original_price);
            self.set_prices(detail.deal_price, original);
            changed = true;
        } else if self.original_price.is_none()
            && let (Some(deal), Some(orig)) = (self.deal_price, detail.original_price)
            && orig > deal
        {
            self.original_price = Some(orig);
            changed = true;
        }

        if self.badge_discount.is_none() && detail.badge_discount.is_some() {
            self.badge_discount = detail.badge_discount;
            changed = true;
        }

        if self.image_url.is_none() && detail.image_url.is_some() {
            self.image_url.clone_from(&detail.image_url);
            changed = true;
        }

        if !self.limited_time && detail.limited_time {
            self.limited_time = true;
            changed = true;
        }

        changed
    }
}

/// `round((original - deal) / original * 100)` when `original > deal > 0`.
pub fn compute_discount(deal: f64, original: f64) -> Option<u8> {
    if !(deal > 0.0 && original > deal) {
        return None;
    }
    let percent = ((original - deal) / original * 100.0).round();
    Some(percent.clamp(0.0, 100.0) as u8)
}

pub fn detail_url(id: &ItemId) -> String {
    format!("{CATALOG_BASE_URL}/dp/{id}")
}

/// Dedup entry for one item, as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub last_price: Option<f64>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_posted_at: Option<DateTime<Utc>>,
}

impl PostRecord {
    /// Most recent timestamp known for the record.
    pub fn best_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_posted_at.or(self.first_seen_at)
    }
}

/// Inline button attached to a Telegram post
#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub url: String,
}

/// Telegram `reply_markup` holding one row of buttons
#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    pub fn single(text: &str, url: &str) -> Self {
        Self {
            inline_keyboard: vec![vec![InlineKeyboardButton {
                text: text.to_string(),
                url: url.to_string(),
            }]],
        }
    }
}

/// `sendPhoto` request body
#[derive(Debug, Clone, Serialize)]
pub struct SendPhoto {
    pub chat_id: String,
    pub photo: String,
    pub caption: String,
    pub parse_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<InlineKeyboardMarkup>,
}

/// `sendMessage` request body
#[derive(Debug, Clone, Serialize)]
pub struct SendMessage {
    pub chat_id: String,
    pub text: String,
    pub parse_mode: &'static str,
    pub disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<InlineKeyboardMarkup>,
}
