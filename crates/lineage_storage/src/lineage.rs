#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use lineage_kernel_contracts::lineage::{
    validate_expiry_threshold_ms, BulkClaim, BulkReservationRequest, BulkReserveOutcome,
    CanonicalId, ClaimOutcome, CommitOutcome, DedupeKey, DeleteOutcome, LegacyRecordIdentity,
    LineageId, LineageRecord, LineageState, LineageStateCounts, ReclaimRequest,
    ReservationClaim, ReservationRequest, LINEAGE_ID_PREFIX,
};
use lineage_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
    #[error("lineage store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt lineage row '{key}': {reason}")]
    CorruptRow { key: String, reason: String },
}

/// Fresh kernel-assigned id for a reservation attempt.
pub(crate) fn next_lineage_id() -> Result<LineageId, StorageError> {
    Ok(LineageId::new(format!(
        "{LINEAGE_ID_PREFIX}{}",
        Uuid::new_v4().simple()
    ))?)
}

pub(crate) fn validate_now(now: MonotonicTimeNs) -> Result<(), StorageError> {
    if now.0 == 0 {
        return Err(StorageError::ContractViolation(
            ContractViolation::InvalidValue {
                field: "migration_lineage.now",
                reason: "must be > 0",
            },
        ));
    }
    Ok(())
}

/// A stale scan takes the same threshold bounds as a reclaim.
pub(crate) fn validate_stale_scan(
    now: MonotonicTimeNs,
    expiry_threshold_ms: u64,
) -> Result<(), StorageError> {
    validate_now(now)?;
    validate_expiry_threshold_ms("migration_lineage.expiry_threshold_ms", expiry_threshold_ms)?;
    Ok(())
}

pub(crate) fn validate_claim(claim: &ReservationClaim) -> Result<(), StorageError> {
    claim.lineage_id.validate()?;
    claim.reserved_by.validate()?;
    claim.migration_job_id.validate()?;
    Ok(())
}

#[derive(Debug, Default)]
struct LineageTables {
    rows: BTreeMap<LineageId, LineageRecord>,
    // Unique index over every row regardless of state: dedupe_key -> lineage_id.
    dedupe_index: BTreeMap<DedupeKey, LineageId>,
}

impl LineageTables {
    fn insert_if_absent(&mut self, rec: LineageRecord) -> bool {
        if self.dedupe_index.contains_key(&rec.dedupe_key) {
            return false;
        }
        self.dedupe_index
            .insert(rec.dedupe_key.clone(), rec.lineage_id.clone());
        self.rows.insert(rec.lineage_id.clone(), rec);
        true
    }

    fn row_by_dedupe_key_mut(&mut self, key: &DedupeKey) -> Option<&mut LineageRecord> {
        let id = self.dedupe_index.get(key)?;
        self.rows.get_mut(id)
    }

    fn commit(
        &mut self,
        now: MonotonicTimeNs,
        lineage_id: &LineageId,
        canonical_id: &CanonicalId,
        fence: Option<&ReservationClaim>,
    ) -> CommitOutcome {
        let Some(rec) = self.rows.get_mut(lineage_id) else {
            return CommitOutcome::NotCommitted;
        };
        if rec.state != LineageState::Reserved {
            return CommitOutcome::NotCommitted;
        }
        if fence.is_some_and(|claim| !rec.is_owned_by(claim)) {
            return CommitOutcome::NotCommitted;
        }
        rec.state = LineageState::Committed;
        rec.canonical_id = Some(canonical_id.clone());
        rec.committed_at = Some(now);
        CommitOutcome::Committed
    }

    fn delete_reserved(
        &mut self,
        lineage_id: &LineageId,
        fence: Option<&ReservationClaim>,
    ) -> DeleteOutcome {
        let deletable = self.rows.get(lineage_id).is_some_and(|rec| {
            rec.state == LineageState::Reserved && fence.map_or(true, |c| rec.is_owned_by(c))
        });
        if !deletable {
            return DeleteOutcome::NoOp;
        }
        match self.rows.remove(lineage_id) {
            Some(rec) => {
                self.dedupe_index.remove(&rec.dedupe_key);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NoOp,
        }
    }
}

/// Process-local lineage store.
///
/// Every operation runs inside a single critical section over the tables, which gives it the
/// same all-or-nothing shape as the one-statement SQL implementation. Shared between worker
/// threads behind an `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryLineageStore {
    tables: Mutex<LineageTables>,
}

impl InMemoryLineageStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, LineageTables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("lineage tables lock poisoned".to_string()))
    }

    pub fn reserve(
        &self,
        now: MonotonicTimeNs,
        req: &ReservationRequest,
    ) -> Result<ClaimOutcome, StorageError> {
        validate_now(now)?;
        req.validate()?;

        let rec = LineageRecord::reserved_v1(next_lineage_id()?, req, now)?;
        let claim = req.initial_claim(rec.lineage_id.clone());
        if self.tables()?.insert_if_absent(rec) {
            Ok(ClaimOutcome::Claimed(claim))
        } else {
            Ok(ClaimOutcome::NotClaimed)
        }
    }

    pub fn reclaim_stale(
        &self,
        now: MonotonicTimeNs,
        req: &ReclaimRequest,
    ) -> Result<ClaimOutcome, StorageError> {
        validate_now(now)?;
        req.validate()?;

        let key = req.identity.dedupe_key();
        let mut tables = self.tables()?;
        let Some(rec) = tables.row_by_dedupe_key_mut(&key) else {
            return Ok(ClaimOutcome::NotClaimed);
        };
        if !rec.is_stale(now, req.expiry_threshold_ms) {
            return Ok(ClaimOutcome::NotClaimed);
        }

        rec.reserved_at = now;
        rec.reserved_by = req.reserved_by.clone();
        rec.migration_job_id = req.migration_job_id.clone();
        rec.reclaim_epoch = rec.reclaim_epoch.saturating_add(1);
        Ok(rec
            .claim()
            .map_or(ClaimOutcome::NotClaimed, ClaimOutcome::Claimed))
    }

    pub fn commit(
        &self,
        now: MonotonicTimeNs,
        lineage_id: &LineageId,
        canonical_id: &CanonicalId,
    ) -> Result<CommitOutcome, StorageError> {
        validate_now(now)?;
        lineage_id.validate()?;
        canonical_id.validate()?;
        Ok(self.tables()?.commit(now, lineage_id, canonical_id, None))
    }

    pub fn commit_fenced(
        &self,
        now: MonotonicTimeNs,
        claim: &ReservationClaim,
        canonical_id: &CanonicalId,
    ) -> Result<CommitOutcome, StorageError> {
        validate_now(now)?;
        validate_claim(claim)?;
        canonical_id.validate()?;
        Ok(self
            .tables()?
            .commit(now, &claim.lineage_id, canonical_id, Some(claim)))
    }

    pub fn delete_reservation(
        &self,
        lineage_id: &LineageId,
    ) -> Result<DeleteOutcome, StorageError> {
        lineage_id.validate()?;
        Ok(self.tables()?.delete_reserved(lineage_id, None))
    }

    pub fn delete_reservation_fenced(
        &self,
        claim: &ReservationClaim,
    ) -> Result<DeleteOutcome, StorageError> {
        validate_claim(claim)?;
        Ok(self.tables()?.delete_reserved(&claim.lineage_id, Some(claim)))
    }

    pub fn bulk_reserve(
        &self,
        now: MonotonicTimeNs,
        req: &BulkReservationRequest,
    ) -> Result<BulkReserveOutcome, StorageError> {
        validate_now(now)?;
        req.validate()?;
        if req.items.is_empty() {
            return Ok(BulkReserveOutcome::default());
        }

        let mut pending = Vec::with_capacity(req.items.len());
        for item in &req.items {
            let item_req = req.item_request(item);
            let rec = LineageRecord::reserved_v1(next_lineage_id()?, &item_req, now)?;
            let claim = item_req.initial_claim(rec.lineage_id.clone());
            pending.push((rec, claim));
        }

        let mut tables = self.tables()?;
        let mut claimed = Vec::new();
        for (rec, claim) in pending {
            let bulk_claim = BulkClaim {
                legacy_id: rec.legacy_id.clone(),
                dedupe_key: rec.dedupe_key.clone(),
                claim,
            };
            if tables.insert_if_absent(rec) {
                claimed.push(bulk_claim);
            }
        }
        Ok(BulkReserveOutcome { claimed })
    }

    pub fn get(&self, lineage_id: &LineageId) -> Result<Option<LineageRecord>, StorageError> {
        Ok(self.tables()?.rows.get(lineage_id).cloned())
    }

    pub fn get_by_identity(
        &self,
        identity: &LegacyRecordIdentity,
    ) -> Result<Option<LineageRecord>, StorageError> {
        let key = identity.dedupe_key();
        let tables = self.tables()?;
        Ok(tables
            .dedupe_index
            .get(&key)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    pub fn stale_reservations(
        &self,
        now: MonotonicTimeNs,
        expiry_threshold_ms: u64,
        limit: usize,
    ) -> Result<Vec<LineageRecord>, StorageError> {
        validate_stale_scan(now, expiry_threshold_ms)?;
        let tables = self.tables()?;
        let mut stale = tables
            .rows
            .values()
            .filter(|rec| rec.is_stale(now, expiry_threshold_ms))
            .cloned()
            .collect::<Vec<_>>();
        stale.sort_by(|a, b| {
            a.reserved_at
                .cmp(&b.reserved_at)
                .then_with(|| a.lineage_id.cmp(&b.lineage_id))
        });
        stale.truncate(limit);
        Ok(stale)
    }

    pub fn state_counts(&self) -> Result<LineageStateCounts, StorageError> {
        let tables = self.tables()?;
        let mut counts = LineageStateCounts::default();
        for rec in tables.rows.values() {
            match rec.state {
                LineageState::Reserved => counts.reserved += 1,
                LineageState::Committed => counts.committed += 1,
            }
        }
        Ok(counts)
    }
}
