#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::ms_to_ns;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const LINEAGE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const LINEAGE_ID_PREFIX: &str = "lin_";
pub const DEDUPE_KEY_PREFIX: &str = "dk1_";
const DEDUPE_KEY_DOMAIN: &[u8] = b"migration_lineage.dedupe_key.v1";

/// Upper bound accepted by the contract layer; wiring config may lower it.
pub const BULK_RESERVE_MAX_ITEMS: usize = 2_000;
pub const RECLAIM_EXPIRY_THRESHOLD_MAX_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

fn validate_id(field: &'static str, value: &str, max_len: usize) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

macro_rules! lineage_string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal, $max_len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
                let v = v.into();
                validate_id($field, &v, $max_len)?;
                Ok(Self(v))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                validate_id($field, &self.0, $max_len)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

lineage_string_id!(
    /// Kernel-assigned identifier of one lineage row.
    LineageId,
    "lineage_id",
    128
);
lineage_string_id!(OrgId, "org_id", 128);
lineage_string_id!(EntityType, "entity_type", 96);
lineage_string_id!(LegacySystem, "legacy_system", 96);
lineage_string_id!(LegacyId, "legacy_id", 256);
lineage_string_id!(MigrationJobId, "migration_job_id", 128);
lineage_string_id!(
    /// The `reserved_by` owner of a reservation.
    WorkerId,
    "reserved_by",
    128
);
lineage_string_id!(
    /// Identifier of the materialized entity in the canonical store.
    CanonicalId,
    "canonical_id",
    256
);

/// The four fields naming one legacy record inside one organization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LegacyRecordIdentity {
    pub org_id: OrgId,
    pub entity_type: EntityType,
    pub legacy_system: LegacySystem,
    pub legacy_id: LegacyId,
}

impl LegacyRecordIdentity {
    pub fn v1(
        org_id: OrgId,
        entity_type: EntityType,
        legacy_system: LegacySystem,
        legacy_id: LegacyId,
    ) -> Result<Self, ContractViolation> {
        let identity = Self {
            org_id,
            entity_type,
            legacy_system,
            legacy_id,
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::derive(self)
    }
}

impl Validate for LegacyRecordIdentity {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.org_id.validate()?;
        self.entity_type.validate()?;
        self.legacy_system.validate()?;
        self.legacy_id.validate()?;
        Ok(())
    }
}

/// Stable identity string for a legacy record; the single uniqueness constraint of the lineage
/// table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    pub fn derive(identity: &LegacyRecordIdentity) -> Self {
        Self(deterministic_dedupe_key(
            identity.org_id.as_str(),
            identity.entity_type.as_str(),
            identity.legacy_system.as_str(),
            identity.legacy_id.as_str(),
        ))
    }

    /// Re-wraps a key read back from storage.
    pub fn from_stored(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let key = Self(v.into());
        key.validate()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for DedupeKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        let Some(hex) = self.0.strip_prefix(DEDUPE_KEY_PREFIX) else {
            return Err(ContractViolation::InvalidValue {
                field: "dedupe_key",
                reason: "missing dk1_ prefix",
            });
        };
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ContractViolation::InvalidValue {
                field: "dedupe_key",
                reason: "must be 64 lowercase hex chars after the prefix",
            });
        }
        Ok(())
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain-tagged SHA-256 over the length-prefixed identity fields.
///
/// Length prefixing keeps the encoding injective: no value of one field can spill into the next,
/// whatever delimiters it contains.
pub fn deterministic_dedupe_key(
    org_id: &str,
    entity_type: &str,
    legacy_system: &str,
    legacy_id: &str,
) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut hasher = Sha256::new();
    hasher.update(DEDUPE_KEY_DOMAIN);
    for field in [org_id, entity_type, legacy_system, legacy_id] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();

    let mut out = String::with_capacity(DEDUPE_KEY_PREFIX.len() + digest.len() * 2);
    out.push_str(DEDUPE_KEY_PREFIX);
    for b in digest {
        out.push(char::from(HEX[usize::from(b >> 4)]));
        out.push(char::from(HEX[usize::from(b & 0x0f)]));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineageState {
    Reserved,
    Committed,
}

impl LineageState {
    pub fn as_str(self) -> &'static str {
        match self {
            LineageState::Reserved => "reserved",
            LineageState::Committed => "committed",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v {
            "reserved" => Some(LineageState::Reserved),
            "committed" => Some(LineageState::Committed),
            _ => None,
        }
    }
}

/// What a worker holds after a successful reserve or reclaim.
///
/// `reclaim_epoch` is bumped by every reclaim, so a claim taken before a reclaim no longer
/// matches the row and fenced commit/delete calls made with it affect nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationClaim {
    pub lineage_id: LineageId,
    pub reserved_by: WorkerId,
    pub migration_job_id: MigrationJobId,
    pub reclaim_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub schema_version: SchemaVersion,
    pub lineage_id: LineageId,
    pub org_id: OrgId,
    pub entity_type: EntityType,
    pub legacy_system: LegacySystem,
    pub legacy_id: LegacyId,
    pub dedupe_key: DedupeKey,
    pub canonical_id: Option<CanonicalId>,
    pub state: LineageState,
    pub reserved_at: MonotonicTimeNs,
    pub reserved_by: WorkerId,
    pub migration_job_id: MigrationJobId,
    pub reclaim_epoch: u64,
    pub committed_at: Option<MonotonicTimeNs>,
}

impl LineageRecord {
    /// A fresh row in `reserved` state for `req`, owned by its worker at epoch 0.
    pub fn reserved_v1(
        lineage_id: LineageId,
        req: &ReservationRequest,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let identity = &req.identity;
        let rec = Self {
            schema_version: LINEAGE_CONTRACT_VERSION,
            lineage_id,
            org_id: identity.org_id.clone(),
            entity_type: identity.entity_type.clone(),
            legacy_system: identity.legacy_system.clone(),
            legacy_id: identity.legacy_id.clone(),
            dedupe_key: identity.dedupe_key(),
            canonical_id: None,
            state: LineageState::Reserved,
            reserved_at: now,
            reserved_by: req.reserved_by.clone(),
            migration_job_id: req.migration_job_id.clone(),
            reclaim_epoch: 0,
            committed_at: None,
        };
        rec.validate()?;
        Ok(rec)
    }

    pub fn identity(&self) -> LegacyRecordIdentity {
        LegacyRecordIdentity {
            org_id: self.org_id.clone(),
            entity_type: self.entity_type.clone(),
            legacy_system: self.legacy_system.clone(),
            legacy_id: self.legacy_id.clone(),
        }
    }

    /// The current ownership claim; `None` once committed.
    pub fn claim(&self) -> Option<ReservationClaim> {
        (self.state == LineageState::Reserved).then(|| ReservationClaim {
            lineage_id: self.lineage_id.clone(),
            reserved_by: self.reserved_by.clone(),
            migration_job_id: self.migration_job_id.clone(),
            reclaim_epoch: self.reclaim_epoch,
        })
    }

    pub fn is_owned_by(&self, claim: &ReservationClaim) -> bool {
        self.lineage_id == claim.lineage_id
            && self.reserved_by == claim.reserved_by
            && self.migration_job_id == claim.migration_job_id
            && self.reclaim_epoch == claim.reclaim_epoch
    }

    /// Reclaim eligibility: reserved, no canonical id, and `now - reserved_at >= threshold`.
    pub fn is_stale(&self, now: MonotonicTimeNs, expiry_threshold_ms: u64) -> bool {
        self.state == LineageState::Reserved
            && self.canonical_id.is_none()
            && self.reserved_at.0 <= now.0
            && now.0 - self.reserved_at.0 >= ms_to_ns(expiry_threshold_ms)
    }
}

impl Validate for LineageRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LINEAGE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "lineage_record.schema_version",
                reason: "must match LINEAGE_CONTRACT_VERSION",
            });
        }
        self.lineage_id.validate()?;
        self.identity().validate()?;
        self.dedupe_key.validate()?;
        if self.dedupe_key != self.identity().dedupe_key() {
            return Err(ContractViolation::InvalidValue {
                field: "lineage_record.dedupe_key",
                reason: "must be derived from the identity fields",
            });
        }
        self.reserved_by.validate()?;
        self.migration_job_id.validate()?;
        if self.reserved_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "lineage_record.reserved_at",
                reason: "must be > 0",
            });
        }
        let committed = self.state == LineageState::Committed;
        if committed != self.canonical_id.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "lineage_record.canonical_id",
                reason: "must be present iff state is committed",
            });
        }
        if committed != self.committed_at.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "lineage_record.committed_at",
                reason: "must be present iff state is committed",
            });
        }
        if let Some(canonical_id) = &self.canonical_id {
            canonical_id.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub schema_version: SchemaVersion,
    pub identity: LegacyRecordIdentity,
    pub migration_job_id: MigrationJobId,
    pub reserved_by: WorkerId,
}

impl ReservationRequest {
    pub fn v1(
        org_id: OrgId,
        migration_job_id: MigrationJobId,
        entity_type: EntityType,
        legacy_id: LegacyId,
        legacy_system: LegacySystem,
        reserved_by: WorkerId,
    ) -> Result<Self, ContractViolation> {
        let identity = LegacyRecordIdentity::v1(org_id, entity_type, legacy_system, legacy_id)?;
        Self::for_identity(identity, migration_job_id, reserved_by)
    }

    pub fn for_identity(
        identity: LegacyRecordIdentity,
        migration_job_id: MigrationJobId,
        reserved_by: WorkerId,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: LINEAGE_CONTRACT_VERSION,
            identity,
            migration_job_id,
            reserved_by,
        };
        req.validate()?;
        Ok(req)
    }

    /// The claim handed back when this request inserts `lineage_id`.
    pub fn initial_claim(&self, lineage_id: LineageId) -> ReservationClaim {
        ReservationClaim {
            lineage_id,
            reserved_by: self.reserved_by.clone(),
            migration_job_id: self.migration_job_id.clone(),
            reclaim_epoch: 0,
        }
    }
}

impl Validate for ReservationRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LINEAGE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "reservation_request.schema_version",
                reason: "must match LINEAGE_CONTRACT_VERSION",
            });
        }
        self.identity.validate()?;
        self.migration_job_id.validate()?;
        self.reserved_by.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimRequest {
    pub schema_version: SchemaVersion,
    pub identity: LegacyRecordIdentity,
    pub migration_job_id: MigrationJobId,
    pub reserved_by: WorkerId,
    pub expiry_threshold_ms: u64,
}

impl ReclaimRequest {
    pub fn v1(
        identity: LegacyRecordIdentity,
        migration_job_id: MigrationJobId,
        reserved_by: WorkerId,
        expiry_threshold_ms: u64,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: LINEAGE_CONTRACT_VERSION,
            identity,
            migration_job_id,
            reserved_by,
            expiry_threshold_ms,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for ReclaimRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LINEAGE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "reclaim_request.schema_version",
                reason: "must match LINEAGE_CONTRACT_VERSION",
            });
        }
        self.identity.validate()?;
        self.migration_job_id.validate()?;
        self.reserved_by.validate()?;
        validate_expiry_threshold_ms(
            "reclaim_request.expiry_threshold_ms",
            self.expiry_threshold_ms,
        )
    }
}

pub fn validate_expiry_threshold_ms(
    field: &'static str,
    expiry_threshold_ms: u64,
) -> Result<(), ContractViolation> {
    if expiry_threshold_ms == 0 || expiry_threshold_ms > RECLAIM_EXPIRY_THRESHOLD_MAX_MS {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be within 1..=7 days in ms",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReservationRequest {
    pub schema_version: SchemaVersion,
    pub migration_job_id: MigrationJobId,
    pub reserved_by: WorkerId,
    pub items: Vec<LegacyRecordIdentity>,
}

impl BulkReservationRequest {
    pub fn v1(
        migration_job_id: MigrationJobId,
        reserved_by: WorkerId,
        items: Vec<LegacyRecordIdentity>,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: LINEAGE_CONTRACT_VERSION,
            migration_job_id,
            reserved_by,
            items,
        };
        req.validate()?;
        Ok(req)
    }

    /// The per-item request a bulk call is equivalent to.
    pub fn item_request(&self, identity: &LegacyRecordIdentity) -> ReservationRequest {
        ReservationRequest {
            schema_version: LINEAGE_CONTRACT_VERSION,
            identity: identity.clone(),
            migration_job_id: self.migration_job_id.clone(),
            reserved_by: self.reserved_by.clone(),
        }
    }
}

impl Validate for BulkReservationRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LINEAGE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "bulk_reservation_request.schema_version",
                reason: "must match LINEAGE_CONTRACT_VERSION",
            });
        }
        self.migration_job_id.validate()?;
        self.reserved_by.validate()?;
        if self.items.len() > BULK_RESERVE_MAX_ITEMS {
            return Err(ContractViolation::InvalidCount {
                field: "bulk_reservation_request.items",
                max: BULK_RESERVE_MAX_ITEMS,
                got: self.items.len(),
            });
        }
        for item in &self.items {
            item.validate()?;
        }
        Ok(())
    }
}

/// Result of reserve and reclaim. Losing the race is `NotClaimed`, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ReservationClaim),
    NotClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn claim(&self) -> Option<&ReservationClaim> {
        match self {
            ClaimOutcome::Claimed(claim) => Some(claim),
            ClaimOutcome::NotClaimed => None,
        }
    }

    pub fn into_claim(self) -> Option<ReservationClaim> {
        match self {
            ClaimOutcome::Claimed(claim) => Some(claim),
            ClaimOutcome::NotClaimed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Unknown id, already committed, or (fenced) no longer owned by the caller.
    NotCommitted,
}

impl CommitOutcome {
    pub fn is_committed(self) -> bool {
        self == CommitOutcome::Committed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NoOp,
}

impl DeleteOutcome {
    pub fn is_deleted(self) -> bool {
        self == DeleteOutcome::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkClaim {
    pub legacy_id: LegacyId,
    pub dedupe_key: DedupeKey,
    pub claim: ReservationClaim,
}

/// Only the newly inserted subset of a bulk reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReserveOutcome {
    pub claimed: Vec<BulkClaim>,
}

impl BulkReserveOutcome {
    /// Input identities that did not get a row, in input order.
    pub fn unclaimed(&self, req: &BulkReservationRequest) -> Vec<LegacyRecordIdentity> {
        let claimed: BTreeSet<&DedupeKey> = self.claimed.iter().map(|c| &c.dedupe_key).collect();
        let mut seen = BTreeSet::new();
        req.items
            .iter()
            .filter(|item| {
                let key = item.dedupe_key();
                !claimed.contains(&key) && seen.insert(key)
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineageStateCounts {
    pub reserved: u64,
    pub committed: u64,
}
