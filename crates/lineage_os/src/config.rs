#![forbid(unsafe_code)]

use lineage_kernel_contracts::lineage::{validate_expiry_threshold_ms, BULK_RESERVE_MAX_ITEMS};
use lineage_kernel_contracts::{ContractViolation, Validate};

pub const ENV_EXPIRY_THRESHOLD_MS: &str = "LINEAGE_EXPIRY_THRESHOLD_MS";
pub const ENV_BULK_MAX_ITEMS: &str = "LINEAGE_BULK_MAX_ITEMS";
pub const ENV_RECLAIM_ON_CONTENTION: &str = "LINEAGE_RECLAIM_ON_CONTENTION";
pub const ENV_FENCED_COMMIT: &str = "LINEAGE_FENCED_COMMIT";

const MAX_ENV_VALUE_LENGTH: usize = 64;

/// Knobs for the orchestrator-facing lineage runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineageWiringConfig {
    /// A reservation this old without a commit is presumed abandoned.
    pub expiry_threshold_ms: u64,
    pub bulk_max_items: usize,
    /// Try a reclaim when a reservation attempt loses to an existing row.
    pub reclaim_on_contention: bool,
    /// Commit and abandon with the full ownership fence instead of by id alone.
    pub fenced_commit: bool,
}

impl LineageWiringConfig {
    pub fn mvp_v1() -> Self {
        Self {
            expiry_threshold_ms: 30 * 60 * 1_000,
            bulk_max_items: 500,
            reclaim_on_contention: true,
            fenced_commit: true,
        }
    }

    /// Defaults overridden by `LINEAGE_*` environment variables. Unset or empty variables keep
    /// the default; anything unparseable is rejected.
    pub fn from_env() -> Result<Self, ContractViolation> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ContractViolation> {
        let read = |var: &'static str| -> Result<Option<String>, ContractViolation> {
            match lookup(var) {
                None => Ok(None),
                Some(v) if v.trim().is_empty() => Ok(None),
                Some(v) if v.len() > MAX_ENV_VALUE_LENGTH => Err(ContractViolation::InvalidValue {
                    field: var,
                    reason: "value too long",
                }),
                Some(v) => Ok(Some(v.trim().to_string())),
            }
        };

        let mut config = Self::mvp_v1();
        if let Some(v) = read(ENV_EXPIRY_THRESHOLD_MS)? {
            config.expiry_threshold_ms = v.parse().map_err(|_| ContractViolation::InvalidValue {
                field: ENV_EXPIRY_THRESHOLD_MS,
                reason: "must be an unsigned integer",
            })?;
        }
        if let Some(v) = read(ENV_BULK_MAX_ITEMS)? {
            config.bulk_max_items = v.parse().map_err(|_| ContractViolation::InvalidValue {
                field: ENV_BULK_MAX_ITEMS,
                reason: "must be an unsigned integer",
            })?;
        }
        if let Some(v) = read(ENV_RECLAIM_ON_CONTENTION)? {
            config.reclaim_on_contention = parse_flag(ENV_RECLAIM_ON_CONTENTION, &v)?;
        }
        if let Some(v) = read(ENV_FENCED_COMMIT)? {
            config.fenced_commit = parse_flag(ENV_FENCED_COMMIT, &v)?;
        }
        config.validate()?;
        Ok(config)
    }
}

impl Default for LineageWiringConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl Validate for LineageWiringConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_expiry_threshold_ms(
            "lineage_wiring_config.expiry_threshold_ms",
            self.expiry_threshold_ms,
        )?;
        if self.bulk_max_items == 0 || self.bulk_max_items > BULK_RESERVE_MAX_ITEMS {
            return Err(ContractViolation::InvalidValue {
                field: "lineage_wiring_config.bulk_max_items",
                reason: "must be within 1..=2000",
            });
        }
        Ok(())
    }
}

fn parse_flag(field: &'static str, v: &str) -> Result<bool, ContractViolation> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ContractViolation::InvalidValue {
            field,
            reason: "must be a boolean flag",
        }),
    }
}
