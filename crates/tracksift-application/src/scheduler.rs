// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::RunError;
use crate::fingerprinter::{MediaSource, SegmentFingerprinter, Window};
use crate::orchestrator::{FallbackOrchestrator, SegmentOutcome};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracksift_config::AppConfig;
use tracksift_domain::{ProviderId, SegmentId};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub window_ms: u64,
    pub stride_ms: u64,
    pub max_concurrent_segments: usize,
    pub run_timeout: Option<Duration>,
}

impl From<&AppConfig> for SchedulerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            window_ms: config.segmentation.window_secs * 1000,
            stride_ms: config.segmentation.stride_secs * 1000,
            max_concurrent_segments: config.scheduler.max_concurrent_segments,
            run_timeout: config
                .identification
                .run_timeout_secs
                .map(Duration::from_secs),
        }
    }
}

/// Overlapping windows covering `[0, total_ms)`.
///
/// Windows start every `stride_ms`; the last one is truncated at the end of
/// the source, and no window is emitted once an earlier one reaches the end.
pub fn plan_windows(total_ms: u64, window_ms: u64, stride_ms: u64) -> Vec<Window> {
    if total_ms == 0 || window_ms == 0 {
        return Vec::new();
    }
    let stride_ms = if stride_ms == 0 { window_ms } else { stride_ms };

    let mut windows = Vec::new();
    let mut start_ms = 0;
    while start_ms < total_ms {
        let end_ms = start_ms.saturating_add(window_ms).min(total_ms);
        windows.push(Window {
            start_ms,
            duration_ms: end_ms - start_ms,
        });
        if end_ms == total_ms {
            break;
        }
        start_ms += stride_ms;
    }
    windows
}

/// Splits a source into windows and identifies them concurrently.
pub struct SegmentScheduler {
    orchestrator: Arc<FallbackOrchestrator>,
    fingerprinter: Arc<dyn SegmentFingerprinter>,
    settings: SchedulerSettings,
}

impl SegmentScheduler {
    pub fn new(
        orchestrator: Arc<FallbackOrchestrator>,
        fingerprinter: Arc<dyn SegmentFingerprinter>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            orchestrator,
            fingerprinter,
            settings,
        }
    }

    /// Identify every window of `source`, returning outcomes ordered by start.
    ///
    /// A segment that cannot be identified yields an `Unidentified` outcome;
    /// only cancellation or the run timeout fail the run.
    pub async fn run(
        &self,
        source: &MediaSource,
        order: &[ProviderId],
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentOutcome>, RunError> {
        if order.is_empty() {
            return Err(RunError::NoProviders);
        }
        if let Some(unknown) = order.iter().find(|id| !self.orchestrator.has_provider(id)) {
            return Err(RunError::UnknownProvider(unknown.clone()));
        }

        let windows = plan_windows(
            source.duration_ms,
            self.settings.window_ms,
            self.settings.stride_ms,
        );
        info!(
            target: "scheduler",
            source = %source.id,
            segments = windows.len(),
            max_concurrent = self.settings.max_concurrent_segments,
            "starting identification run"
        );

        let run_token = cancel.child_token();
        let drive = self.drive(source, order, windows, run_token.clone());
        let mut outcomes = match self.settings.run_timeout {
            Some(limit) => match timeout(limit, drive).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    run_token.cancel();
                    warn!(target: "scheduler", ?limit, "run timed out, abandoning in-flight segments");
                    return Err(RunError::TimedOut(limit));
                }
            },
            None => drive.await,
        };

        if cancel.is_cancelled() {
            warn!(target: "scheduler", completed = outcomes.len(), "run cancelled");
            return Err(RunError::Cancelled);
        }

        outcomes.sort_by_key(|outcome| outcome.start_ms);
        info!(target: "scheduler", segments = outcomes.len(), "identification run finished");
        Ok(outcomes)
    }

    async fn drive(
        &self,
        source: &MediaSource,
        order: &[ProviderId],
        windows: Vec<Window>,
        token: CancellationToken,
    ) -> Vec<SegmentOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_segments.max(1)));
        let order: Arc<[ProviderId]> = order.into();
        let source = Arc::new(source.clone());
        let mut tasks = JoinSet::new();

        for window in windows {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(target: "scheduler", start_ms = window.start_ms, "cancelled before segment start");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let orchestrator = self.orchestrator.clone();
            let fingerprinter = self.fingerprinter.clone();
            let order = order.clone();
            let source = source.clone();
            let token = token.clone();
            let segment = SegmentId {
                source_id: source.id.clone(),
                start_ms: window.start_ms,
            };

            tasks.spawn(async move {
                let _permit = permit;
                // The inner task isolates a panicking segment so it still gets a record.
                let work = tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        outcome = identify_window(&orchestrator, fingerprinter.as_ref(), &source, window, &order) => Some(outcome),
                    }
                });
                match work.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(target: "scheduler", %segment, error = %err, "segment task failed");
                        Some(SegmentOutcome::task_failed(segment, window.duration_ms, err.to_string()))
                    }
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => error!(target: "scheduler", error = %err, "segment task aborted"),
            }
        }
        outcomes
    }
}

async fn identify_window(
    orchestrator: &FallbackOrchestrator,
    fingerprinter: &dyn SegmentFingerprinter,
    source: &MediaSource,
    window: Window,
    order: &[ProviderId],
) -> SegmentOutcome {
    match fingerprinter.fingerprint(source, window).await {
        Ok(segment) => orchestrator.identify_segment(&segment, order).await,
        Err(err) => {
            warn!(
                target: "scheduler",
                start_ms = window.start_ms,
                error = %err,
                "could not fingerprint segment"
            );
            SegmentOutcome::fingerprint_failed(
                SegmentId {
                    source_id: source.id.clone(),
                    start_ms: window.start_ms,
                },
                window.duration_ms,
                err.to_string(),
            )
        }
    }
}
