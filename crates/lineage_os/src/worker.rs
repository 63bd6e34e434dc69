#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use lineage_kernel_contracts::lineage::{
    CanonicalId, DeleteOutcome, LegacyRecordIdentity, LineageId, MigrationJobId,
    ReservationClaim, WorkerId,
};
use lineage_kernel_contracts::{ContractViolation, MonotonicTimeNs, ReasonCodeId};
use lineage_storage::lineage::StorageError;
use lineage_storage::repo::MigrationLineageRepo;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::lineage::{
    reason_codes, BatchClaimEntry, ClaimDecision, FinalizeDecision, MigrationLineageRuntime,
    SkipReason,
};

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("legacy record could not be transformed: {0}")]
    Transform(String),
    #[error("canonical store rejected the entity: {0}")]
    CanonicalStore(String),
}

/// Transforms one legacy record and durably creates its canonical entity.
///
/// Returning `Ok` means the entity exists in the canonical store; the worker commits the lineage
/// row only after that.
pub trait CanonicalEntityMaterializer {
    fn materialize(
        &self,
        identity: &LegacyRecordIdentity,
        claim: &ReservationClaim,
    ) -> Result<CanonicalId, MaterializeError>;
}

pub trait MonotonicClock {
    fn now(&self) -> MonotonicTimeNs;
}

/// Nanoseconds since the Unix epoch.
///
/// Every worker and every process reads the same time base, so a reservation stamped by one
/// worker ages the same way for all of them, including a successor after a crash.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now(&self) -> MonotonicTimeNs {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(1);
        MonotonicTimeNs(nanos.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Migrated {
        lineage_id: LineageId,
        canonical_id: CanonicalId,
        reclaimed: bool,
    },
    AlreadyMigrated,
    InFlightElsewhere,
    /// Another worker took the reservation over while this one was working on it.
    Displaced { lineage_id: LineageId },
    /// Materialization failed and the reservation was released.
    Abandoned { lineage_id: LineageId, error: String },
    RetryLater { error: String },
}

impl MigrationOutcome {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            MigrationOutcome::Migrated { .. } => reason_codes::LINEAGE_COMMITTED,
            MigrationOutcome::AlreadyMigrated => reason_codes::LINEAGE_ALREADY_COMMITTED,
            MigrationOutcome::InFlightElsewhere => reason_codes::LINEAGE_IN_FLIGHT_ELSEWHERE,
            MigrationOutcome::Displaced { .. } => reason_codes::LINEAGE_DISPLACED,
            MigrationOutcome::Abandoned { .. } => reason_codes::LINEAGE_ABANDONED,
            MigrationOutcome::RetryLater { .. } => reason_codes::LINEAGE_RETRY_LATER,
        }
    }
}

impl From<SkipReason> for MigrationOutcome {
    fn from(reason: SkipReason) -> Self {
        match reason {
            SkipReason::AlreadyCommitted => MigrationOutcome::AlreadyMigrated,
            SkipReason::InFlightElsewhere => MigrationOutcome::InFlightElsewhere,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMigrationEntry {
    pub identity: LegacyRecordIdentity,
    pub outcome: MigrationOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationTally {
    pub migrated: usize,
    pub already_migrated: usize,
    pub in_flight_elsewhere: usize,
    pub displaced: usize,
    pub abandoned: usize,
    pub retry_later: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchMigrationReport {
    pub entries: Vec<BatchMigrationEntry>,
}

impl BatchMigrationReport {
    pub fn tally(&self) -> MigrationTally {
        let mut t = MigrationTally::default();
        for entry in &self.entries {
            match entry.outcome {
                MigrationOutcome::Migrated { .. } => t.migrated += 1,
                MigrationOutcome::AlreadyMigrated => t.already_migrated += 1,
                MigrationOutcome::InFlightElsewhere => t.in_flight_elsewhere += 1,
                MigrationOutcome::Displaced { .. } => t.displaced += 1,
                MigrationOutcome::Abandoned { .. } => t.abandoned += 1,
                MigrationOutcome::RetryLater { .. } => t.retry_later += 1,
            }
        }
        t
    }
}

/// One stateless migration worker: claim, materialize, then commit or release.
pub struct MigrationWorker<R, M, C>
where
    R: MigrationLineageRepo,
    M: CanonicalEntityMaterializer,
    C: MonotonicClock,
{
    runtime: MigrationLineageRuntime<R>,
    materializer: M,
    clock: C,
    migration_job_id: MigrationJobId,
    worker_id: WorkerId,
}

impl<R, M, C> MigrationWorker<R, M, C>
where
    R: MigrationLineageRepo,
    M: CanonicalEntityMaterializer,
    C: MonotonicClock,
{
    pub fn new(
        runtime: MigrationLineageRuntime<R>,
        materializer: M,
        clock: C,
        migration_job_id: MigrationJobId,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            runtime,
            materializer,
            clock,
            migration_job_id,
            worker_id,
        }
    }

    pub fn runtime(&self) -> &MigrationLineageRuntime<R> {
        &self.runtime
    }

    /// Claims and migrates one record.
    ///
    /// Same error split as `migrate_batch`: invalid input is an error, a store failure is
    /// `RetryLater`.
    pub fn migrate_one(
        &self,
        identity: &LegacyRecordIdentity,
    ) -> Result<MigrationOutcome, ContractViolation> {
        let decision = self.runtime.claim(
            self.clock.now(),
            identity,
            &self.migration_job_id,
            &self.worker_id,
        );
        let outcome = match decision {
            Ok(ClaimDecision::Proceed { claim, reclaimed }) => {
                self.complete(identity, &claim, reclaimed)
            }
            Ok(ClaimDecision::Skip(reason)) => reason.into(),
            Err(StorageError::ContractViolation(violation)) => return Err(violation),
            Err(err) => self.retry_later(identity, None, &err),
        };
        Ok(outcome)
    }

    /// Claims `items` with one bulk reservation and migrates every claimed record.
    ///
    /// Only an invalid batch is an error. A store failure during the claim marks every item
    /// `RetryLater`.
    pub fn migrate_batch(
        &self,
        items: Vec<LegacyRecordIdentity>,
    ) -> Result<BatchMigrationReport, ContractViolation> {
        let report = match self.runtime.claim_batch(
            self.clock.now(),
            &self.migration_job_id,
            &self.worker_id,
            items.clone(),
        ) {
            Ok(report) => report,
            Err(StorageError::ContractViolation(violation)) => return Err(violation),
            Err(err) => {
                let entries = items
                    .into_iter()
                    .map(|identity| {
                        let outcome = self.retry_later(&identity, None, &err);
                        BatchMigrationEntry { identity, outcome }
                    })
                    .collect();
                return Ok(BatchMigrationReport { entries });
            }
        };

        let mut entries = Vec::with_capacity(report.claimed.len() + report.skipped.len());
        for BatchClaimEntry {
            identity,
            claim,
            reclaimed,
        } in report.claimed
        {
            let outcome = self.complete(&identity, &claim, reclaimed);
            entries.push(BatchMigrationEntry { identity, outcome });
        }
        for skip in report.skipped {
            entries.push(BatchMigrationEntry {
                identity: skip.identity,
                outcome: skip.reason.into(),
            });
        }
        Ok(BatchMigrationReport { entries })
    }

    fn complete(
        &self,
        identity: &LegacyRecordIdentity,
        claim: &ReservationClaim,
        reclaimed: bool,
    ) -> MigrationOutcome {
        let canonical_id = match self.materializer.materialize(identity, claim) {
            Ok(canonical_id) => canonical_id,
            Err(err) => return self.release(identity, claim, &err),
        };

        // A failed commit leaves the reservation to expire; the next owner materializes again.
        match self
            .runtime
            .finalize(self.clock.now(), claim, &canonical_id)
        {
            Ok(FinalizeDecision::Committed) | Ok(FinalizeDecision::AlreadyFinalized) => {
                MigrationOutcome::Migrated {
                    lineage_id: claim.lineage_id.clone(),
                    canonical_id,
                    reclaimed,
                }
            }
            Ok(FinalizeDecision::Displaced) => MigrationOutcome::Displaced {
                lineage_id: claim.lineage_id.clone(),
            },
            Err(err) => self.retry_later(identity, Some(claim), &err),
        }
    }

    fn release(
        &self,
        identity: &LegacyRecordIdentity,
        claim: &ReservationClaim,
        err: &MaterializeError,
    ) -> MigrationOutcome {
        match self.runtime.abandon(claim) {
            Ok(DeleteOutcome::Deleted) => {
                info!(
                    lineage_id = %claim.lineage_id,
                    legacy_id = %identity.legacy_id,
                    migration_job_id = %claim.migration_job_id,
                    reserved_by = %claim.reserved_by,
                    reason_code = reason_codes::LINEAGE_ABANDONED.0,
                    error = %err,
                    "materialization failed, reservation released"
                );
                MigrationOutcome::Abandoned {
                    lineage_id: claim.lineage_id.clone(),
                    error: err.to_string(),
                }
            }
            Ok(DeleteOutcome::NoOp) => MigrationOutcome::Displaced {
                lineage_id: claim.lineage_id.clone(),
            },
            Err(store_err) => self.retry_later(identity, Some(claim), &store_err),
        }
    }

    fn retry_later(
        &self,
        identity: &LegacyRecordIdentity,
        claim: Option<&ReservationClaim>,
        err: &StorageError,
    ) -> MigrationOutcome {
        warn!(
            lineage_id = claim.map(|c| c.lineage_id.as_str()),
            dedupe_key = %identity.dedupe_key(),
            migration_job_id = %self.migration_job_id,
            reserved_by = %self.worker_id,
            reason_code = reason_codes::LINEAGE_RETRY_LATER.0,
            error = %err,
            "migration attempt failed, will retry"
        );
        MigrationOutcome::RetryLater {
            error: err.to_string(),
        }
    }
}
