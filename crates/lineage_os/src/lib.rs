#![forbid(unsafe_code)]

pub mod config;
pub mod lineage;
pub mod worker;

pub use config::LineageWiringConfig;
pub use lineage::{ClaimDecision, FinalizeDecision, MigrationLineageRuntime, SkipReason};
pub use worker::{
    CanonicalEntityMaterializer, MigrationOutcome, MigrationWorker, MonotonicClock, SystemClock,
};
