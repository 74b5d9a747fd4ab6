//! Backfill of stale or skipped documents

pub mod scheduler;

pub use scheduler::{
    BackfillProgress, BackfillReason, BackfillReport, BackfillScheduler, BackfillTrigger,
    ExtractionDriver, ProgressSnapshot,
};
