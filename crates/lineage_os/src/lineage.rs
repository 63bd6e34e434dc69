#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use lineage_kernel_contracts::lineage::{
    BulkReservationRequest, CanonicalId, ClaimOutcome, CommitOutcome, DedupeKey, DeleteOutcome,
    LegacyRecordIdentity, LineageRecord, LineageState, LineageStateCounts, MigrationJobId,
    ReclaimRequest, ReservationClaim, ReservationRequest, WorkerId,
};
use lineage_kernel_contracts::{ContractViolation, MonotonicTimeNs, ReasonCodeId, Validate};
use lineage_storage::lineage::StorageError;
use lineage_storage::repo::MigrationLineageRepo;
use tracing::{debug, info, warn};

use crate::config::LineageWiringConfig;

pub mod reason_codes {
    use lineage_kernel_contracts::ReasonCodeId;

    // Lineage OS wiring reason-code namespace.
    pub const LINEAGE_RESERVED: ReasonCodeId = ReasonCodeId(0x4C4E_0101);
    pub const LINEAGE_RECLAIMED: ReasonCodeId = ReasonCodeId(0x4C4E_0102);
    pub const LINEAGE_ALREADY_COMMITTED: ReasonCodeId = ReasonCodeId(0x4C4E_0111);
    pub const LINEAGE_IN_FLIGHT_ELSEWHERE: ReasonCodeId = ReasonCodeId(0x4C4E_0112);
    pub const LINEAGE_COMMITTED: ReasonCodeId = ReasonCodeId(0x4C4E_0201);
    pub const LINEAGE_ALREADY_FINALIZED: ReasonCodeId = ReasonCodeId(0x4C4E_0202);
    pub const LINEAGE_DISPLACED: ReasonCodeId = ReasonCodeId(0x4C4E_0203);
    pub const LINEAGE_ABANDONED: ReasonCodeId = ReasonCodeId(0x4C4E_0301);
    pub const LINEAGE_RETRY_LATER: ReasonCodeId = ReasonCodeId(0x4C4E_01F1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A canonical entity already exists for this record.
    AlreadyCommitted,
    /// Another worker holds a reservation that has not expired yet.
    InFlightElsewhere,
}

impl SkipReason {
    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            SkipReason::AlreadyCommitted => reason_codes::LINEAGE_ALREADY_COMMITTED,
            SkipReason::InFlightElsewhere => reason_codes::LINEAGE_IN_FLIGHT_ELSEWHERE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    Proceed {
        claim: ReservationClaim,
        reclaimed: bool,
    },
    Skip(SkipReason),
}

impl ClaimDecision {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            ClaimDecision::Proceed {
                reclaimed: false, ..
            } => reason_codes::LINEAGE_RESERVED,
            ClaimDecision::Proceed { reclaimed: true, .. } => reason_codes::LINEAGE_RECLAIMED,
            ClaimDecision::Skip(reason) => reason.reason_code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeDecision {
    Committed,
    /// The row was already committed with this canonical id, e.g. a retried finalize.
    AlreadyFinalized,
    /// Ownership moved to another worker before the commit landed.
    Displaced,
}

impl FinalizeDecision {
    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            FinalizeDecision::Committed => reason_codes::LINEAGE_COMMITTED,
            FinalizeDecision::AlreadyFinalized => reason_codes::LINEAGE_ALREADY_FINALIZED,
            FinalizeDecision::Displaced => reason_codes::LINEAGE_DISPLACED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchClaimEntry {
    pub identity: LegacyRecordIdentity,
    pub claim: ReservationClaim,
    pub reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSkipEntry {
    pub identity: LegacyRecordIdentity,
    pub reason: SkipReason,
}

/// Dispositions for one batch. `claimed` lists fresh reservations in input order, then
/// reclaims; `skipped` is in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchClaimReport {
    pub claimed: Vec<BatchClaimEntry>,
    pub skipped: Vec<BatchSkipEntry>,
}

/// Orchestrator-facing decisions on top of a lineage repo.
///
/// Every call is a thin sequence of atomic kernel operations. Reads that follow a losing
/// operation only classify the loss for logs and reason codes; they never gate a write.
#[derive(Debug, Clone)]
pub struct MigrationLineageRuntime<R>
where
    R: MigrationLineageRepo,
{
    config: LineageWiringConfig,
    repo: R,
}

impl<R> MigrationLineageRuntime<R>
where
    R: MigrationLineageRepo,
{
    pub fn new(config: LineageWiringConfig, repo: R) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self { config, repo })
    }

    pub fn config(&self) -> &LineageWiringConfig {
        &self.config
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Reserve the record, or take over an expired reservation when configured to.
    pub fn claim(
        &self,
        now: MonotonicTimeNs,
        identity: &LegacyRecordIdentity,
        migration_job_id: &MigrationJobId,
        worker_id: &WorkerId,
    ) -> Result<ClaimDecision, StorageError> {
        let req = ReservationRequest::for_identity(
            identity.clone(),
            migration_job_id.clone(),
            worker_id.clone(),
        )?;
        if let ClaimOutcome::Claimed(claim) = self.repo.reserve_lineage_row(now, &req)? {
            debug!(
                lineage_id = %claim.lineage_id,
                migration_job_id = %migration_job_id,
                reserved_by = %worker_id,
                "lineage reservation taken"
            );
            return Ok(ClaimDecision::Proceed {
                claim,
                reclaimed: false,
            });
        }

        if self.config.reclaim_on_contention {
            if let Some(claim) = self.try_reclaim(now, identity, migration_job_id, worker_id)? {
                return Ok(ClaimDecision::Proceed {
                    claim,
                    reclaimed: true,
                });
            }
        }

        let reason = self.classify_contention(identity)?;
        log_skip(identity, migration_job_id, worker_id, reason);
        Ok(ClaimDecision::Skip(reason))
    }

    /// Record the canonical entity for a claim the caller still holds.
    ///
    /// Call only after the canonical entity is durably created.
    pub fn finalize(
        &self,
        now: MonotonicTimeNs,
        claim: &ReservationClaim,
        canonical_id: &CanonicalId,
    ) -> Result<FinalizeDecision, StorageError> {
        let outcome = if self.config.fenced_commit {
            self.repo
                .commit_lineage_row_fenced(now, claim, canonical_id)?
        } else {
            self.repo
                .commit_lineage_row(now, &claim.lineage_id, canonical_id)?
        };
        if outcome == CommitOutcome::Committed {
            info!(
                lineage_id = %claim.lineage_id,
                canonical_id = %canonical_id,
                migration_job_id = %claim.migration_job_id,
                reserved_by = %claim.reserved_by,
                reason_code = reason_codes::LINEAGE_COMMITTED.0,
                "lineage committed"
            );
            return Ok(FinalizeDecision::Committed);
        }

        let current = self.repo.lineage_row(&claim.lineage_id)?;
        let decision = match current {
            Some(rec)
                if rec.state == LineageState::Committed
                    && rec.canonical_id.as_ref() == Some(canonical_id) =>
            {
                FinalizeDecision::AlreadyFinalized
            }
            _ => FinalizeDecision::Displaced,
        };
        if decision == FinalizeDecision::Displaced {
            warn!(
                lineage_id = %claim.lineage_id,
                canonical_id = %canonical_id,
                migration_job_id = %claim.migration_job_id,
                reserved_by = %claim.reserved_by,
                reclaim_epoch = claim.reclaim_epoch,
                reason_code = reason_codes::LINEAGE_DISPLACED.0,
                "lineage commit rejected, reservation no longer owned"
            );
        } else {
            info!(
                lineage_id = %claim.lineage_id,
                reason_code = reason_codes::LINEAGE_ALREADY_FINALIZED.0,
                "lineage already committed with this canonical id"
            );
        }
        Ok(decision)
    }

    /// Release a reservation so another attempt can take the record right away.
    pub fn abandon(&self, claim: &ReservationClaim) -> Result<DeleteOutcome, StorageError> {
        let outcome = if self.config.fenced_commit {
            self.repo.delete_reserved_lineage_row_fenced(claim)?
        } else {
            self.repo.delete_reserved_lineage_row(&claim.lineage_id)?
        };
        debug!(
            lineage_id = %claim.lineage_id,
            reserved_by = %claim.reserved_by,
            deleted = outcome.is_deleted(),
            "lineage reservation released"
        );
        Ok(outcome)
    }

    /// Bulk-reserve `items`, then route every item that lost to an existing row through
    /// reclaim (when enabled) or into the skip list.
    pub fn claim_batch(
        &self,
        now: MonotonicTimeNs,
        migration_job_id: &MigrationJobId,
        worker_id: &WorkerId,
        items: Vec<LegacyRecordIdentity>,
    ) -> Result<BatchClaimReport, StorageError> {
        if items.len() > self.config.bulk_max_items {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidCount {
                    field: "lineage_wiring.claim_batch.items",
                    max: self.config.bulk_max_items,
                    got: items.len(),
                },
            ));
        }
        let req = BulkReservationRequest::v1(migration_job_id.clone(), worker_id.clone(), items)?;
        let bulk = self.repo.bulk_reserve_lineage_rows(now, &req)?;
        let unclaimed = bulk.unclaimed(&req);
        debug!(
            migration_job_id = %migration_job_id,
            requested = req.items.len(),
            claimed = bulk.claimed.len(),
            unclaimed = unclaimed.len(),
            "lineage batch reserved"
        );

        let by_key = req
            .items
            .iter()
            .map(|identity| (identity.dedupe_key(), identity))
            .collect::<BTreeMap<DedupeKey, &LegacyRecordIdentity>>();
        let mut report = BatchClaimReport::default();
        for entry in bulk.claimed {
            let Some(identity) = by_key.get(&entry.dedupe_key) else {
                continue;
            };
            report.claimed.push(BatchClaimEntry {
                identity: (*identity).clone(),
                claim: entry.claim,
                reclaimed: false,
            });
        }

        for identity in unclaimed {
            if self.config.reclaim_on_contention {
                if let Some(claim) =
                    self.try_reclaim(now, &identity, migration_job_id, worker_id)?
                {
                    report.claimed.push(BatchClaimEntry {
                        identity,
                        claim,
                        reclaimed: true,
                    });
                    continue;
                }
            }
            let reason = self.classify_contention(&identity)?;
            log_skip(&identity, migration_job_id, worker_id, reason);
            report.skipped.push(BatchSkipEntry { identity, reason });
        }
        Ok(report)
    }

    /// Identities of reservations that are currently reclaimable, oldest first.
    pub fn stale_candidates(
        &self,
        now: MonotonicTimeNs,
        limit: usize,
    ) -> Result<Vec<LegacyRecordIdentity>, StorageError> {
        let rows = self.repo.stale_reserved_lineage_rows(
            now,
            self.config.expiry_threshold_ms,
            limit,
        )?;
        Ok(rows.iter().map(LineageRecord::identity).collect())
    }

    pub fn progress(&self) -> Result<LineageStateCounts, StorageError> {
        self.repo.lineage_state_counts()
    }

    fn try_reclaim(
        &self,
        now: MonotonicTimeNs,
        identity: &LegacyRecordIdentity,
        migration_job_id: &MigrationJobId,
        worker_id: &WorkerId,
    ) -> Result<Option<ReservationClaim>, StorageError> {
        let req = ReclaimRequest::v1(
            identity.clone(),
            migration_job_id.clone(),
            worker_id.clone(),
            self.config.expiry_threshold_ms,
        )?;
        let claim = self.repo.reclaim_stale_lineage_row(now, &req)?.into_claim();
        debug!(
            dedupe_key = %identity.dedupe_key(),
            migration_job_id = %migration_job_id,
            reserved_by = %worker_id,
            reclaimed = claim.is_some(),
            reclaim_epoch = claim.as_ref().map(|c| c.reclaim_epoch),
            "stale lineage reclaim attempted"
        );
        Ok(claim)
    }

    fn classify_contention(
        &self,
        identity: &LegacyRecordIdentity,
    ) -> Result<SkipReason, StorageError> {
        // A row that vanished since the losing write was released by its owner; the next pass
        // picks the record up, so it counts as in flight for now.
        let reason = match self.repo.lineage_row_by_identity(identity)? {
            Some(rec) if rec.state == LineageState::Committed => SkipReason::AlreadyCommitted,
            _ => SkipReason::InFlightElsewhere,
        };
        Ok(reason)
    }
}

fn log_skip(
    identity: &LegacyRecordIdentity,
    migration_job_id: &MigrationJobId,
    worker_id: &WorkerId,
    reason: SkipReason,
) {
    match reason {
        SkipReason::AlreadyCommitted => info!(
            dedupe_key = %identity.dedupe_key(),
            legacy_id = %identity.legacy_id,
            migration_job_id = %migration_job_id,
            reserved_by = %worker_id,
            reason_code = reason.reason_code().0,
            "record already migrated, skipping"
        ),
        SkipReason::InFlightElsewhere => info!(
            dedupe_key = %identity.dedupe_key(),
            legacy_id = %identity.legacy_id,
            migration_job_id = %migration_job_id,
            reserved_by = %worker_id,
            reason_code = reason.reason_code().0,
            "record reserved by another worker, skipping"
        ),
    }
}
