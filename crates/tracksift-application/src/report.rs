// SPDX-License-Identifier: GPL-3.0-or-later

use serde::Serialize;
use tracksift_domain::{MixInfo, RunContext, Tracklist};

use crate::orchestrator::{AttemptOutcome, SegmentOutcome};

/// Everything a run produced: the tracklist plus the per-segment trail of
/// providers consulted, for troubleshooting gaps.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub context: RunContext,
    pub mix_info: MixInfo,
    pub tracklist: Tracklist,
    pub diagnostics: Vec<SegmentOutcome>,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub segments: usize,
    pub identified: usize,
    pub unidentified: usize,
    pub cache_hits: usize,
    /// Provider answers reused from another segment's in-flight call.
    pub joined_calls: usize,
    pub fingerprint_failures: usize,
}

impl RunStats {
    pub fn from_outcomes(outcomes: &[SegmentOutcome]) -> Self {
        let mut stats = Self {
            segments: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            if outcome.result().is_some() {
                stats.identified += 1;
            } else {
                stats.unidentified += 1;
            }
            if outcome.fingerprint_error.is_some() {
                stats.fingerprint_failures += 1;
            }
            for attempt in &outcome.attempts {
                if matches!(attempt.outcome, AttemptOutcome::CacheHit { .. }) {
                    stats.cache_hits += 1;
                }
                if attempt.joined {
                    stats.joined_calls += 1;
                }
            }
        }
        stats
    }
}
