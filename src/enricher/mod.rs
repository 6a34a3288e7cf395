//! Detail-page backfill for candidates with missing price data

use tracing::{debug, info, warn};

use crate::fetcher::{FetchOutcome, Fetcher};
use crate::models::Candidate;
use crate::parser;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub lookups: usize,
    pub filled: usize,
    pub bot_wall: bool,
}

/// Fetches detail pages for candidates lacking a deal price or a computable
/// discount, spending at most `max_lookups` fetches. Only empty fields are
/// filled. Stops at the first bot wall.
pub async fn enrich(fetcher: &Fetcher, candidates: &mut [Candidate], max_lookups: usize) -> EnrichReport {
    let mut report = EnrichReport::default();

    for candidate in candidates.iter_mut().filter(|c| c.needs_enrichment()) {
        if report.lookups >= max_lookups {
            debug!("Detail lookup quota of {} reached", max_lookups);
            break;
        }
        report.lookups += 1;

        let url = candidate.source_url();
        match fetcher.fetch(&url).await {
            FetchOutcome::Ok(html) => {
                if let Some(detail) = parser::parse_detail(&html, &candidate.id)
                    && candidate.backfill(&detail)
                {
                    report.filled += 1;
                }
            }
            FetchOutcome::BotWall => {
                warn!("Bot wall while enriching {}; stopping lookups", candidate.id);
                report.bot_wall = true;
                break;
            }
            other => {
                debug!("Detail lookup for {} failed: {:?}", candidate.id, other);
            }
        }
    }

    if report.lookups > 0 {
        info!(
            "Enriched {} of {} looked-up candidates",
            report.filled, report.lookups
        );
    }
    report
}
