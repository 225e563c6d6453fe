// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use tracing::{debug, trace};
use tracksift_config::MergeConfig;
use tracksift_domain::{TrackEntry, Tracklist, TracklistError};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::orchestrator::SegmentOutcome;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSettings {
    /// Largest gap bridged when two neighbouring entries name the same track.
    pub max_gap_ms: u64,
}

impl From<&MergeConfig> for MergeSettings {
    fn from(config: &MergeConfig) -> Self {
        Self {
            max_gap_ms: config.max_gap_ms,
        }
    }
}

/// Fold a title or artist into the form used to decide whether two entries
/// name the same track: accents stripped, lowercased, punctuation dropped and
/// whitespace collapsed.
pub fn normalize_for_match(value: &str) -> String {
    value
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn same_track(left: &TrackEntry, right: &TrackEntry) -> bool {
    normalize_for_match(&left.track_title) == normalize_for_match(&right.track_title)
        && normalize_for_match(&left.artist) == normalize_for_match(&right.artist)
}

/// Extend `into` over `other`, keeping the stronger of the two identifications.
fn absorb(into: &mut TrackEntry, other: &TrackEntry) {
    into.start_ms = into.start_ms.min(other.start_ms);
    into.end_ms = into.end_ms.max(other.end_ms);
    if other.confidence > into.confidence {
        into.confidence = other.confidence;
        into.source_provider_id = other.source_provider_id.clone();
    }
}

fn enqueue(queue: &mut VecDeque<TrackEntry>, entry: TrackEntry) {
    let at = queue.partition_point(|queued| queued.start_ms <= entry.start_ms);
    queue.insert(at, entry);
}

/// Stitch per-segment outcomes into an ordered, non-overlapping tracklist.
///
/// Same-track entries that overlap, touch or sit within `max_gap_ms` of each
/// other become one entry. Where different tracks overlap, the higher
/// confidence entry keeps the contested range and the other is trimmed, split
/// around it, or dropped; on equal confidence the earlier-starting entry wins.
/// Unidentified segments leave gaps.
pub fn merge(
    outcomes: &[SegmentOutcome],
    settings: &MergeSettings,
) -> Result<Tracklist, TracklistError> {
    let mut candidates: Vec<TrackEntry> = outcomes
        .iter()
        .filter(|outcome| outcome.duration_ms > 0)
        .filter_map(|outcome| {
            outcome.result().map(|result| TrackEntry {
                start_ms: outcome.start_ms,
                end_ms: outcome.end_ms(),
                track_title: result.track_title.clone(),
                artist: result.artist.clone(),
                confidence: result.confidence,
                source_provider_id: result.provider_id.clone(),
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.start_ms
            .cmp(&b.start_ms)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });

    let mut queue: VecDeque<TrackEntry> = candidates.into();
    let mut placed: Vec<TrackEntry> = Vec::with_capacity(queue.len());

    while let Some(mut next) = queue.pop_front() {
        let Some(last) = placed.last_mut() else {
            placed.push(next);
            continue;
        };

        if same_track(last, &next) && next.start_ms <= last.end_ms.saturating_add(settings.max_gap_ms) {
            absorb(last, &next);
            continue;
        }

        if next.start_ms >= last.end_ms {
            placed.push(next);
            continue;
        }

        if next.confidence > last.confidence {
            trace!(
                target: "merger",
                winner = %next.track_title,
                loser = %last.track_title,
                "overlap resolved in favour of later entry"
            );
            if last.end_ms > next.end_ms {
                let mut tail = last.clone();
                tail.start_ms = next.end_ms;
                enqueue(&mut queue, tail);
            }
            last.end_ms = next.start_ms;
            if last.end_ms <= last.start_ms {
                placed.pop();
            }
            // Re-examine against whatever now precedes it.
            queue.push_front(next);
        } else {
            trace!(
                target: "merger",
                winner = %last.track_title,
                loser = %next.track_title,
                "overlap resolved in favour of earlier entry"
            );
            next.start_ms = last.end_ms;
            if next.end_ms > next.start_ms {
                enqueue(&mut queue, next);
            }
        }
    }

    // Trimming can leave pieces of one track side by side.
    let mut entries: Vec<TrackEntry> = Vec::with_capacity(placed.len());
    for entry in placed {
        if let Some(last) = entries.last_mut() {
            if same_track(last, &entry)
                && entry.start_ms <= last.end_ms.saturating_add(settings.max_gap_ms)
            {
                absorb(last, &entry);
                continue;
            }
        }
        entries.push(entry);
    }

    debug!(
        target: "merger",
        segments = outcomes.len(),
        entries = entries.len(),
        "segments merged into tracklist"
    );
    Tracklist::from_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Identification;
    use tracksift_domain::{ProviderId, RecognitionResult, SegmentId, SourceId};

    fn outcome(start_ms: u64, duration_ms: u64, hit: Option<(&str, &str, f32)>) -> SegmentOutcome {
        let identification = match hit {
            Some((title, artist, confidence)) => Identification::Identified(RecognitionResult::new(
                title,
                artist,
                confidence,
                ProviderId::from("acoustid"),
            )),
            None => Identification::Unidentified,
        };
        SegmentOutcome {
            segment: SegmentId {
                source_id: SourceId::from("mix"),
                start_ms,
            },
            start_ms,
            duration_ms,
            identification,
            attempts: Vec::new(),
            fingerprint_error: None,
            task_error: None,
        }
    }

    fn spans(list: &Tracklist) -> Vec<(u64, u64, &str)> {
        list.iter()
            .map(|e| (e.start_ms, e.end_ms, e.track_title.as_str()))
            .collect()
    }

    #[test]
    fn normalization_ignores_case_accents_and_punctuation() {
        assert_eq!(normalize_for_match("  Café   del Mar! "), "cafe del mar");
        assert_eq!(
            normalize_for_match("BEYONCÉ"),
            normalize_for_match("Beyonce")
        );
    }

    #[test]
    fn overlapping_segments_of_one_track_become_one_entry() {
        let list = merge(
            &[
                outcome(25_000, 30_000, Some(("Track A", "Artist", 0.85))),
                outcome(0, 30_000, Some(("Track A", "Artist", 0.9))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();

        assert_eq!(spans(&list), vec![(0, 55_000, "Track A")]);
        assert_eq!(list.entries()[0].confidence, 0.9);
    }

    #[test]
    fn matching_is_case_and_accent_insensitive() {
        let list = merge(
            &[
                outcome(0, 30_000, Some(("Café Noir", "DJ Été", 0.8))),
                outcome(25_000, 30_000, Some(("cafe noir", "dj ete", 0.7))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries()[0].track_title, "Café Noir");
    }

    #[test]
    fn conflicting_overlap_prefers_higher_confidence() {
        let list = merge(
            &[
                outcome(0, 30_000, Some(("Track A", "Artist", 0.6))),
                outcome(25_000, 30_000, Some(("Track B", "Artist", 0.9))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(
            spans(&list),
            vec![(0, 25_000, "Track A"), (25_000, 55_000, "Track B")]
        );
    }

    #[test]
    fn equal_confidence_overlap_prefers_earlier_start() {
        let list = merge(
            &[
                outcome(25_000, 30_000, Some(("Track B", "Artist", 0.8))),
                outcome(0, 30_000, Some(("Track A", "Artist", 0.8))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(
            spans(&list),
            vec![(0, 30_000, "Track A"), (30_000, 55_000, "Track B")]
        );
    }

    #[test]
    fn stronger_entry_inside_a_longer_one_splits_it() {
        let list = merge(
            &[
                outcome(0, 60_000, Some(("Track A", "Artist", 0.6))),
                outcome(20_000, 10_000, Some(("Track B", "Artist", 0.9))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(
            spans(&list),
            vec![
                (0, 20_000, "Track A"),
                (20_000, 30_000, "Track B"),
                (30_000, 60_000, "Track A"),
            ]
        );
    }

    #[test]
    fn fully_covered_weaker_entry_is_dropped() {
        let list = merge(
            &[
                outcome(0, 30_000, Some(("Track A", "Artist", 0.9))),
                outcome(10_000, 15_000, Some(("Track B", "Artist", 0.5))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(spans(&list), vec![(0, 30_000, "Track A")]);
    }

    #[test]
    fn unidentified_segments_leave_gaps() {
        let list = merge(
            &[
                outcome(0, 30_000, Some(("Track A", "Artist", 0.9))),
                outcome(25_000, 30_000, None),
                outcome(50_000, 30_000, None),
                outcome(75_000, 30_000, Some(("Track B", "Artist", 0.9))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(
            spans(&list),
            vec![(0, 30_000, "Track A"), (75_000, 105_000, "Track B")]
        );
    }

    #[test]
    fn gap_is_bridged_only_within_max_gap() {
        let outcomes = [
            outcome(0, 30_000, Some(("Track A", "Artist", 0.9))),
            outcome(40_000, 30_000, Some(("Track A", "Artist", 0.9))),
        ];

        let strict = merge(&outcomes, &MergeSettings::default()).unwrap();
        assert_eq!(strict.len(), 2);

        let lenient = merge(&outcomes, &MergeSettings { max_gap_ms: 10_000 }).unwrap();
        assert_eq!(spans(&lenient), vec![(0, 70_000, "Track A")]);
    }

    #[test]
    fn pieces_of_one_track_rejoin_after_a_weaker_interloper_is_removed() {
        let list = merge(
            &[
                outcome(0, 30_000, Some(("Track A", "Artist", 0.9))),
                outcome(20_000, 20_000, Some(("Track B", "Artist", 0.4))),
                outcome(25_000, 30_000, Some(("Track A", "Artist", 0.85))),
            ],
            &MergeSettings::default(),
        )
        .unwrap();
        assert_eq!(spans(&list), vec![(0, 55_000, "Track A")]);
    }

    #[test]
    fn no_outcomes_give_an_empty_tracklist() {
        assert!(merge(&[], &MergeSettings::default()).unwrap().is_empty());
    }
}
