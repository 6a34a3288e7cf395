use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::config::{CategoryConfig, Settings};
use crate::database::{DedupPolicy, DedupStore};
use crate::enricher;
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::models::{CATALOG_BASE_URL, Candidate};
use crate::parser;
use crate::telegram::{Dispatcher, TelegramChannel};
use crate::threshold::select_threshold;

/// Counters for one run, logged when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    pub enriched: usize,
    pub threshold: u8,
    pub eligible: usize,
    pub skipped: usize,
    pub posted: usize,
    pub failed: usize,
    pub tips: usize,
    pub bot_wall: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "discovered {}, enriched {}, {} eligible at {}%, posted {}, skipped {}, failed {}, tips {}",
            self.discovered,
            self.enriched,
            self.eligible,
            self.threshold,
            self.posted,
            self.skipped,
            self.failed,
            self.tips
        )?;
        if self.bot_wall {
            write!(f, " (stopped at bot wall)")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct DealFinder {
    settings: Arc<Settings>,
    fetcher: Fetcher,
    store: DedupStore,
    dispatcher: Dispatcher,
}

impl DealFinder {
    pub async fn new(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        let channel = TelegramChannel::new(&settings)?;
        let fetcher = Fetcher::new(&settings)?;
        let store = DedupStore::open(&settings.db_path, DedupPolicy::from_settings(&settings)).await?;
        let dispatcher = Dispatcher::new(Arc::new(channel), settings.clone());

        Ok(Self::with_parts(settings, fetcher, store, dispatcher))
    }

    pub fn with_parts(
        settings: Arc<Settings>,
        fetcher: Fetcher,
        store: DedupStore,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            settings,
            fetcher,
            store,
            dispatcher,
        }
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// Drops dedup records past the retention window.
    pub async fn prune(&self) -> Result<u64> {
        let retention = self.settings.retention()?;
        self.store.prune_older_than(retention).await
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        let (mut candidates, bot_wall) = self.discover().await;
        summary.discovered = candidates.len();
        summary.bot_wall = bot_wall;

        if bot_wall && self.settings.stop_on_captcha {
            warn!("Skipping detail lookups after bot wall");
        } else {
            let report =
                enricher::enrich(&self.fetcher, &mut candidates, self.settings.max_detail_lookups).await;
            summary.enriched = report.filled;
            summary.bot_wall |= report.bot_wall;
        }

        summary.threshold = select_threshold(&candidates, &self.settings.threshold_policy());
        let eligible = filter_candidates(candidates, summary.threshold);
        summary.eligible = eligible.len();
        info!(
            "{} of {} candidates at or above {}%",
            summary.eligible, summary.discovered, summary.threshold
        );

        for candidate in &eligible {
            if summary.posted >= self.settings.max_posts_per_run {
                info!("Reached {} posts for this run", summary.posted);
                break;
            }
            let Some(price) = candidate.deal_price() else {
                continue;
            };

            match self.store.should_skip(&candidate.id, price).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!("{} posted recently; skipping", candidate.id);
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Dedup lookup for {} failed, skipping: {}", candidate.id, e);
                    summary.skipped += 1;
                    continue;
                }
            }

            if !self.dispatcher.dispatch(candidate).await {
                summary.failed += 1;
                continue;
            }
            summary.posted += 1;
            info!(
                "Posted {} - {} ({}% off)",
                candidate.id,
                candidate.title,
                candidate.discount_percent().unwrap_or_default()
            );

            if let Err(e) = self.store.record(candidate).await {
                error!("Failed to record post for {}: {}", candidate.id, e);
            }

            if self.tip_due(summary.posted) {
                let tip = &self.settings.tips[summary.tips % self.settings.tips.len()];
                if self.dispatcher.post_tip(tip).await {
                    summary.tips += 1;
                }
            }
        }

        if summary.posted > 0 {
            info!("Run finished: {}", summary);
        } else {
            info!("Run finished with no new posts: {}", summary);
        }

        Ok(summary)
    }

    fn tip_due(&self, posted: usize) -> bool {
        let every = self.settings.value_add_frequency;
        every > 0 && !self.settings.tips.is_empty() && posted % every == 0
    }

    /// Walks every configured category page by page. Returns the candidates
    /// found and whether a bot wall was hit.
    async fn discover(&self) -> (Vec<Candidate>, bool) {
        let cap = self.settings.max_candidates_per_category;
        let min_discount = self.settings.lowest_possible_threshold();
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut bot_wall = false;

        for category in &self.settings.categories {
            let mut taken = 0;

            for page in 1..=category.pages {
                if taken >= cap {
                    break;
                }

                let url = listing_url(category, &self.settings.sort, page, min_discount);
                let html = match self.fetcher.fetch(&url).await {
                    FetchOutcome::Ok(html) => html,
                    FetchOutcome::BotWall => {
                        bot_wall = true;
                        if self.settings.stop_on_captcha {
                            warn!("Bot wall on {} page {}; stopping discovery", category.name, page);
                            return (found, bot_wall);
                        }
                        warn!("Bot wall on {} page {}; next category", category.name, page);
                        break;
                    }
                    other => {
                        warn!("Skipping {} page {}: {:?}", category.name, page, other);
                        continue;
                    }
                };

                let parsed = parser::parse_listing(&html, &category.name);
                if parsed.is_empty() {
                    debug!("No results on {} page {}", category.name, page);
                    break;
                }

                for candidate in parsed {
                    if taken >= cap {
                        break;
                    }
                    if seen.insert(candidate.id.clone()) {
                        found.push(candidate);
                        taken += 1;
                    }
                }
            }

            info!("Found {} candidates in {}", taken, category.name);
        }

        (found, bot_wall)
    }
}

/// Listing URL for one category page, pre-filtered to `min_discount` and up.
pub fn listing_url(category: &CategoryConfig, sort: &str, page: u32, min_discount: u8) -> String {
    format!(
        "{CATALOG_BASE_URL}/s?rh=n%3A{}&s={}&page={}&pct-off={}-",
        category.node_id,
        urlencoding::encode(sort),
        page,
        min_discount
    )
}

/// Well-formed candidates at or above `threshold`, best discount first.
pub fn filter_candidates(candidates: Vec<Candidate>, threshold: u8) -> Vec<Candidate> {
    let mut eligible: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.qualifies_at(threshold))
        .collect();
    eligible.sort_by_key(|c| std::cmp::Reverse(c.discount_percent()));
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tests::{ScriptedTransport, instant_policy, ok, status};
    use crate::models::ItemId;
    use crate::telegram::tests::{FakeChannel, Sent};
    use crate::telegram::Delivery;
    use std::time::Duration;

    const LISTING: &str = include_str!("../tests/fixtures/listing.html");
    const PAIR: &str = include_str!("../tests/fixtures/listing_pair.html");
    const CAPTCHA: &str = include_str!("../tests/fixtures/captcha.html");

    fn category(name: &str, pages: u32) -> CategoryConfig {
        CategoryConfig {
            name: name.to_string(),
            node_id: "1355017031".to_string(),
            pages,
            emoji: "💄".to_string(),
        }
    }

    fn settings(categories: Vec<CategoryConfig>) -> Settings {
        Settings {
            categories,
            minimum_discount: 50,
            dynamic_discount: false,
            max_detail_lookups: 0,
            dispatch_retry_delay: Duration::ZERO,
            value_add_frequency: 0,
            ..Settings::default()
        }
    }

    async fn finder(
        settings: Settings,
        transport: Arc<ScriptedTransport>,
        channel: Arc<FakeChannel>,
    ) -> DealFinder {
        let settings = Arc::new(settings);
        let fetcher = Fetcher::with_transport(transport, instant_policy(1));
        let store = DedupStore::in_memory(DedupPolicy::from_settings(&settings)).await.unwrap();
        let dispatcher = Dispatcher::new(channel, settings.clone());
        DealFinder::with_parts(settings, fetcher, store, dispatcher)
    }

    fn deal(id: &str, deal: f64, original: f64) -> Candidate {
        let mut c = Candidate::new(ItemId::parse(id).unwrap(), "Item", "Beauty").unwrap();
        c.set_prices(Some(deal), Some(original));
        c
    }

    #[test]
    fn listing_url_carries_node_sort_page_and_floor() {
        assert_eq!(
            listing_url(&category("Beauty", 1), "discount-rank", 2, 40),
            "https://www.amazon.in/s?rh=n%3A1355017031&s=discount-rank&page=2&pct-off=40-"
        );
    }

    #[test]
    fn filter_keeps_qualifying_deals_best_first() {
        let mut badge_only = Candidate::new(ItemId::parse("B0BADGEONL").unwrap(), "Item", "Beauty").unwrap();
        badge_only.set_badge_discount(Some(90));

        let picked = filter_candidates(
            vec![
                deal("B0DEAL0055", 45.0, 100.0),
                deal("B0DEAL0070", 30.0, 100.0),
                deal("B0DEAL0040", 60.0, 100.0),
                badge_only,
            ],
            50,
        );

        let ids: Vec<_> = picked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["B0DEAL0070", "B0DEAL0055"]);
    }

    #[tokio::test]
    async fn posts_only_deals_above_minimum() {
        let transport = ScriptedTransport::new(vec![ok(PAIR)]);
        let channel = FakeChannel::scripted(vec![]);
        let finder = finder(settings(vec![category("Beauty", 1)]), transport, channel.clone()).await;

        let summary = finder.run_once().await.unwrap();

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.posted, 1);
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Photo { caption, .. } if caption.contains("60% OFF")));
    }

    #[tokio::test]
    async fn second_run_is_deduplicated() {
        let transport = ScriptedTransport::new(vec![ok(PAIR), ok(PAIR)]);
        let channel = FakeChannel::scripted(vec![]);
        let finder = finder(settings(vec![category("Beauty", 1)]), transport, channel.clone()).await;

        assert_eq!(finder.run_once().await.unwrap().posted, 1);
        let second = finder.run_once().await.unwrap();
        assert_eq!(second.posted, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_is_not_recorded() {
        let transport = ScriptedTransport::new(vec![ok(PAIR)]);
        let channel = FakeChannel::scripted(vec![
            Delivery::Rejected("Bad Request".to_string()),
            Delivery::Rejected("Bad Request".to_string()),
        ]);
        let finder = finder(settings(vec![category("Beauty", 1)]), transport, channel).await;

        let summary = finder.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.posted, 0);
        assert_eq!(finder.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bot_wall_stops_discovery() {
        let transport = ScriptedTransport::new(vec![ok(CAPTCHA), ok(PAIR)]);
        let channel = FakeChannel::scripted(vec![]);
        let finder = finder(
            settings(vec![category("Beauty", 1), category("Jewellery", 1)]),
            transport.clone(),
            channel.clone(),
        )
        .await;

        let summary = finder.run_once().await.unwrap();

        assert!(summary.bot_wall);
        assert_eq!(transport.calls(), 1);
        assert_eq!(summary.posted, 0);
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_page_moves_on_and_ids_are_unique_per_run() {
        let transport = ScriptedTransport::new(vec![status(404, ""), ok(PAIR), ok(PAIR)]);
        let channel = FakeChannel::scripted(vec![]);
        let finder = finder(
            settings(vec![category("Beauty", 2), category("Jewellery", 1)]),
            transport.clone(),
            channel,
        )
        .await;

        let summary = finder.run_once().await.unwrap();
        assert_eq!(transport.calls(), 3);
        assert_eq!(summary.discovered, 2);
    }

    #[tokio::test]
    async fn per_category_cap_and_post_limit() {
        let transport = ScriptedTransport::new(vec![ok(LISTING)]);
        let channel = FakeChannel::scripted(vec![]);
        let finder = finder(
            Settings {
                max_candidates_per_category: 3,
                minimum_discount: 0,
                max_posts_per_run: 1,
                ..settings(vec![category("Snacks", 1)])
            },
            transport,
            channel.clone(),
        )
        .await;

        let summary = finder.run_once().await.unwrap();
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.posted, 1);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn tips_follow_every_nth_post() {
        let transport = ScriptedTransport::new(vec![ok(LISTING)]);
        let channel = FakeChannel::scripted(vec![]);
        let finder = finder(
            Settings {
                minimum_discount: 40,
                value_add_frequency: 2,
                tips: vec!["Check coupons".to_string()],
                ..settings(vec![category("Snacks", 1)])
            },
            transport,
            channel.clone(),
        )
        .await;

        let summary = finder.run_once().await.unwrap();
        assert_eq!(summary.posted, 3);
        assert_eq!(summary.tips, 1);

        let sent = channel.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(
            sent[2],
            Sent::Text {
                text: "💡 Check coupons".to_string()
            }
        );
    }
}
