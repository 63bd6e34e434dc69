#![forbid(unsafe_code)]

pub mod common;
pub mod lineage;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
