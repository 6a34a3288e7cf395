//! Discount cutoff selection for a run

use tracing::info;

use crate::models::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    pub dynamic: bool,
    pub base: u8,
    pub floor: u8,
    pub step: u8,
    pub target_count: usize,
}

/// Picks the discount cutoff for this run.
///
/// With dynamic adjustment off this is always `base`. Otherwise the cutoff
/// starts at `base` and relaxes by `step` until at least `target_count`
/// postable candidates clear it, never going below `floor`.
pub fn select_threshold(candidates: &[Candidate], policy: &ThresholdPolicy) -> u8 {
    if !policy.dynamic {
        return policy.base;
    }

    let step = policy.step.max(1);
    let floor = policy.floor;
    let mut threshold = policy.base.max(floor);

    let count_at = |cutoff: u8| {
        candidates
            .iter()
            .filter(|c| c.qualifies_at(cutoff))
            .count()
    };

    while count_at(threshold) < policy.target_count && threshold > floor {
        threshold = threshold.saturating_sub(step).max(floor);
    }

    if threshold != policy.base {
        info!(
            "Relaxed discount threshold from {}% to {}% ({} candidates qualify)",
            policy.base,
            threshold,
            count_at(threshold)
        );
    }

    threshold
}
