#![forbid(unsafe_code)]

use lineage_kernel_contracts::lineage::{
    BulkReservationRequest, BulkReserveOutcome, CanonicalId, ClaimOutcome, CommitOutcome,
    DeleteOutcome, LegacyRecordIdentity, LineageId, LineageRecord, LineageStateCounts,
    ReclaimRequest, ReservationClaim, ReservationRequest,
};
use lineage_kernel_contracts::MonotonicTimeNs;

use crate::lineage::{InMemoryLineageStore, StorageError};
use crate::sqlite::SqliteLineageStore;

/// Typed repository interface for the `migration_lineage` table.
///
/// Each mutating method is one atomic store operation that checks its own precondition.
/// Contention (`NotClaimed`, `NotCommitted`, `NoOp`) is an `Ok` outcome; `Err` means the
/// input was invalid or the store itself failed.
pub trait MigrationLineageRepo: Send + Sync {
    /// Insert-if-absent on the dedupe key.
    fn reserve_lineage_row(
        &self,
        now: MonotonicTimeNs,
        req: &ReservationRequest,
    ) -> Result<ClaimOutcome, StorageError>;

    /// Take over a reservation whose owner has been silent for at least the threshold.
    fn reclaim_stale_lineage_row(
        &self,
        now: MonotonicTimeNs,
        req: &ReclaimRequest,
    ) -> Result<ClaimOutcome, StorageError>;

    /// `reserved -> committed`, guarded only by state.
    fn commit_lineage_row(
        &self,
        now: MonotonicTimeNs,
        lineage_id: &LineageId,
        canonical_id: &CanonicalId,
    ) -> Result<CommitOutcome, StorageError>;

    /// `reserved -> committed`, guarded by state and by the caller still owning the claim.
    fn commit_lineage_row_fenced(
        &self,
        now: MonotonicTimeNs,
        claim: &ReservationClaim,
        canonical_id: &CanonicalId,
    ) -> Result<CommitOutcome, StorageError>;

    fn delete_reserved_lineage_row(
        &self,
        lineage_id: &LineageId,
    ) -> Result<DeleteOutcome, StorageError>;

    fn delete_reserved_lineage_row_fenced(
        &self,
        claim: &ReservationClaim,
    ) -> Result<DeleteOutcome, StorageError>;

    fn bulk_reserve_lineage_rows(
        &self,
        now: MonotonicTimeNs,
        req: &BulkReservationRequest,
    ) -> Result<BulkReserveOutcome, StorageError>;

    fn lineage_row(&self, lineage_id: &LineageId) -> Result<Option<LineageRecord>, StorageError>;

    fn lineage_row_by_identity(
        &self,
        identity: &LegacyRecordIdentity,
    ) -> Result<Option<LineageRecord>, StorageError>;

    /// Reclaim candidates, oldest reservation first.
    fn stale_reserved_lineage_rows(
        &self,
        now: MonotonicTimeNs,
        expiry_threshold_ms: u64,
        limit: usize,
    ) -> Result<Vec<LineageRecord>, StorageError>;

    fn lineage_state_counts(&self) -> Result<LineageStateCounts, StorageError>;
}

macro_rules! impl_migration_lineage_repo {
    ($store:ty) => {
        impl MigrationLineageRepo for $store {
            fn reserve_lineage_row(
                &self,
                now: MonotonicTimeNs,
                req: &ReservationRequest,
            ) -> Result<ClaimOutcome, StorageError> {
                self.reserve(now, req)
            }

            fn reclaim_stale_lineage_row(
                &self,
                now: MonotonicTimeNs,
                req: &ReclaimRequest,
            ) -> Result<ClaimOutcome, StorageError> {
                self.reclaim_stale(now, req)
            }

            fn commit_lineage_row(
                &self,
                now: MonotonicTimeNs,
                lineage_id: &LineageId,
                canonical_id: &CanonicalId,
            ) -> Result<CommitOutcome, StorageError> {
                self.commit(now, lineage_id, canonical_id)
            }

            fn commit_lineage_row_fenced(
                &self,
                now: MonotonicTimeNs,
                claim: &ReservationClaim,
                canonical_id: &CanonicalId,
            ) -> Result<CommitOutcome, StorageError> {
                self.commit_fenced(now, claim, canonical_id)
            }

            fn delete_reserved_lineage_row(
                &self,
                lineage_id: &LineageId,
            ) -> Result<DeleteOutcome, StorageError> {
                self.delete_reservation(lineage_id)
            }

            fn delete_reserved_lineage_row_fenced(
                &self,
                claim: &ReservationClaim,
            ) -> Result<DeleteOutcome, StorageError> {
                self.delete_reservation_fenced(claim)
            }

            fn bulk_reserve_lineage_rows(
                &self,
                now: MonotonicTimeNs,
                req: &BulkReservationRequest,
            ) -> Result<BulkReserveOutcome, StorageError> {
                self.bulk_reserve(now, req)
            }

            fn lineage_row(
                &self,
                lineage_id: &LineageId,
            ) -> Result<Option<LineageRecord>, StorageError> {
                self.get(lineage_id)
            }

            fn lineage_row_by_identity(
                &self,
                identity: &LegacyRecordIdentity,
            ) -> Result<Option<LineageRecord>, StorageError> {
                self.get_by_identity(identity)
            }

            fn stale_reserved_lineage_rows(
                &self,
                now: MonotonicTimeNs,
                expiry_threshold_ms: u64,
                limit: usize,
            ) -> Result<Vec<LineageRecord>, StorageError> {
                self.stale_reservations(now, expiry_threshold_ms, limit)
            }

            fn lineage_state_counts(&self) -> Result<LineageStateCounts, StorageError> {
                self.state_counts()
            }
        }
    };
}

impl_migration_lineage_repo!(InMemoryLineageStore);
impl_migration_lineage_repo!(SqliteLineageStore);

impl<R: MigrationLineageRepo + ?Sized> MigrationLineageRepo for std::sync::Arc<R> {
    fn reserve_lineage_row(
        &self,
        now: MonotonicTimeNs,
        req: &ReservationRequest,
    ) -> Result<ClaimOutcome, StorageError> {
        (**self).reserve_lineage_row(now, req)
    }

    fn reclaim_stale_lineage_row(
        &self,
        now: MonotonicTimeNs,
        req: &ReclaimRequest,
    ) -> Result<ClaimOutcome, StorageError> {
        (**self).reclaim_stale_lineage_row(now, req)
    }

    fn commit_lineage_row(
        &self,
        now: MonotonicTimeNs,
        lineage_id: &LineageId,
        canonical_id: &CanonicalId,
    ) -> Result<CommitOutcome, StorageError> {
        (**self).commit_lineage_row(now, lineage_id, canonical_id)
    }

    fn commit_lineage_row_fenced(
        &self,
        now: MonotonicTimeNs,
        claim: &ReservationClaim,
        canonical_id: &CanonicalId,
    ) -> Result<CommitOutcome, StorageError> {
        (**self).commit_lineage_row_fenced(now, claim, canonical_id)
    }

    fn delete_reserved_lineage_row(
        &self,
        lineage_id: &LineageId,
    ) -> Result<DeleteOutcome, StorageError> {
        (**self).delete_reserved_lineage_row(lineage_id)
    }

    fn delete_reserved_lineage_row_fenced(
        &self,
        claim: &ReservationClaim,
    ) -> Result<DeleteOutcome, StorageError> {
        (**self).delete_reserved_lineage_row_fenced(claim)
    }

    fn bulk_reserve_lineage_rows(
        &self,
        now: MonotonicTimeNs,
        req: &BulkReservationRequest,
    ) -> Result<BulkReserveOutcome, StorageError> {
        (**self).bulk_reserve_lineage_rows(now, req)
    }

    fn lineage_row(&self, lineage_id: &LineageId) -> Result<Option<LineageRecord>, StorageError> {
        (**self).lineage_row(lineage_id)
    }

    fn lineage_row_by_identity(
        &self,
        identity: &LegacyRecordIdentity,
    ) -> Result<Option<LineageRecord>, StorageError> {
        (**self).lineage_row_by_identity(identity)
    }

    fn stale_reserved_lineage_rows(
        &self,
        now: MonotonicTimeNs,
        expiry_threshold_ms: u64,
        limit: usize,
    ) -> Result<Vec<LineageRecord>, StorageError> {
        (**self).stale_reserved_lineage_rows(now, expiry_threshold_ms, limit)
    }

    fn lineage_state_counts(&self) -> Result<LineageStateCounts, StorageError> {
        (**self).lineage_state_counts()
    }
}
