// SPDX-License-Identifier: GPL-3.0-or-later

//! Identification pipeline: windows are fingerprinted, each one is pushed
//! through the provider fallback chain, and the per-segment answers are
//! stitched into a tracklist.

pub mod error;
pub mod fingerprinter;
pub mod merger;
pub mod orchestrator;
pub mod report;
pub mod scheduler;
pub mod service;

pub use error::RunError;
pub use fingerprinter::{FingerprintError, FpcalcFingerprinter, MediaSource, SegmentFingerprinter, Window};
pub use merger::{merge, normalize_for_match, MergeSettings};
pub use orchestrator::{
    AttemptOutcome, FallbackOrchestrator, Identification, OrchestratorSettings, ProviderAttempt,
    ProviderCall, RecognitionCache, SegmentOutcome,
};
pub use report::{RunReport, RunStats};
pub use scheduler::{plan_windows, SchedulerSettings, SegmentScheduler};
pub use service::IdentificationService;
