#![forbid(unsafe_code)]

use lineage_kernel_contracts::lineage::{
    BulkReservationRequest, CanonicalId, ClaimOutcome, CommitOutcome, DeleteOutcome, EntityType,
    LegacyId, LegacyRecordIdentity, LegacySystem, LineageId, LineageState, LineageStateCounts,
    MigrationJobId, OrgId, ReclaimRequest, ReservationClaim, ReservationRequest, WorkerId,
    RECLAIM_EXPIRY_THRESHOLD_MAX_MS,
};
use lineage_kernel_contracts::{ContractViolation, MonotonicTimeNs, SchemaVersion};
use lineage_storage::lineage::{InMemoryLineageStore, StorageError};
use lineage_storage::repo::MigrationLineageRepo;
use lineage_storage::sqlite::SqliteLineageStore;

const MIN_MS: u64 = 60_000;
const THIRTY_MIN_MS: u64 = 30 * MIN_MS;

fn stores() -> Vec<(&'static str, Box<dyn MigrationLineageRepo>)> {
    let in_memory: Box<dyn MigrationLineageRepo> = Box::new(InMemoryLineageStore::new_in_memory());
    let sqlite: Box<dyn MigrationLineageRepo> =
        Box::new(SqliteLineageStore::open_in_memory().unwrap());
    vec![("in_memory", in_memory), ("sqlite", sqlite)]
}

/// Minutes since an arbitrary non-zero epoch.
fn at_min(minutes: u64) -> MonotonicTimeNs {
    MonotonicTimeNs::from_ms(1_000 + minutes * MIN_MS)
}

fn identity(legacy_id: &str) -> LegacyRecordIdentity {
    LegacyRecordIdentity::v1(
        OrgId::new("org1").unwrap(),
        EntityType::new("Customer").unwrap(),
        LegacySystem::new("LEGACY_ERP").unwrap(),
        LegacyId::new(legacy_id).unwrap(),
    )
    .unwrap()
}

fn reserve_req(legacy_id: &str, job: &str, worker: &str) -> ReservationRequest {
    ReservationRequest::for_identity(
        identity(legacy_id),
        MigrationJobId::new(job).unwrap(),
        WorkerId::new(worker).unwrap(),
    )
    .unwrap()
}

fn reclaim_req(legacy_id: &str, job: &str, worker: &str, threshold_ms: u64) -> ReclaimRequest {
    ReclaimRequest::v1(
        identity(legacy_id),
        MigrationJobId::new(job).unwrap(),
        WorkerId::new(worker).unwrap(),
        threshold_ms,
    )
    .unwrap()
}

fn canonical(id: &str) -> CanonicalId {
    CanonicalId::new(id).unwrap()
}

fn claimed(outcome: ClaimOutcome, store: &str) -> ReservationClaim {
    match outcome {
        ClaimOutcome::Claimed(claim) => claim,
        ClaimOutcome::NotClaimed => panic!("{store}: expected a claim"),
    }
}

#[test]
fn at_lineage_db_01_duplicate_reservation_is_not_claimed() {
    for (name, s) in stores() {
        let first = s
            .reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
            .unwrap();
        assert!(first.is_claimed(), "{name}");

        let second = s
            .reserve_lineage_row(at_min(1), &reserve_req("CUST-100", "job9", "worker_z"))
            .unwrap();
        assert_eq!(second, ClaimOutcome::NotClaimed, "{name}");

        assert_eq!(
            s.lineage_state_counts().unwrap(),
            LineageStateCounts {
                reserved: 1,
                committed: 0
            },
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_02_identity_fields_each_distinguish_records() {
    for (name, s) in stores() {
        let base = identity("CUST-100");
        let variants = [
            base.clone(),
            LegacyRecordIdentity {
                org_id: OrgId::new("org2").unwrap(),
                ..base.clone()
            },
            LegacyRecordIdentity {
                entity_type: EntityType::new("Vendor").unwrap(),
                ..base.clone()
            },
            LegacyRecordIdentity {
                legacy_system: LegacySystem::new("LEGACY_CRM").unwrap(),
                ..base.clone()
            },
        ];
        for v in variants {
            let req = ReservationRequest::for_identity(
                v,
                MigrationJobId::new("job1").unwrap(),
                WorkerId::new("worker_a").unwrap(),
            )
            .unwrap();
            assert!(s.reserve_lineage_row(at_min(0), &req).unwrap().is_claimed(), "{name}");
        }
        assert_eq!(s.lineage_state_counts().unwrap().reserved, 4, "{name}");
    }
}

#[test]
fn at_lineage_db_03_reservation_after_commit_is_blocked() {
    for (name, s) in stores() {
        let claim = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        assert_eq!(
            s.commit_lineage_row(at_min(1), &claim.lineage_id, &canonical("entity-55"))
                .unwrap(),
            CommitOutcome::Committed,
            "{name}"
        );

        let again = s
            .reserve_lineage_row(at_min(2), &reserve_req("CUST-100", "job2", "worker_b"))
            .unwrap();
        assert_eq!(again, ClaimOutcome::NotClaimed, "{name}");
        let counts = s.lineage_state_counts().unwrap();
        assert_eq!(counts.reserved + counts.committed, 1, "{name}");
    }
}

#[test]
fn at_lineage_db_04_reclaim_precondition_boundaries() {
    for (name, s) in stores() {
        // reserved and stale
        s.reserve_lineage_row(at_min(0), &reserve_req("STALE", "job1", "worker_a"))
            .unwrap();
        let stale = reclaim_req("STALE", "job2", "worker_b", THIRTY_MIN_MS);
        assert!(
            s.reclaim_stale_lineage_row(at_min(45), &stale)
                .unwrap()
                .is_claimed(),
            "{name}"
        );

        // reserved and too recent
        s.reserve_lineage_row(at_min(0), &reserve_req("FRESH", "job1", "worker_a"))
            .unwrap();
        assert_eq!(
            s.reclaim_stale_lineage_row(
                at_min(29),
                &reclaim_req("FRESH", "job2", "worker_b", THIRTY_MIN_MS),
            )
            .unwrap(),
            ClaimOutcome::NotClaimed,
            "{name}"
        );

        // committed, however old
        let committed = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("DONE", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        s.commit_lineage_row(at_min(1), &committed.lineage_id, &canonical("entity-1"))
            .unwrap();
        assert_eq!(
            s.reclaim_stale_lineage_row(
                at_min(500),
                &reclaim_req("DONE", "job2", "worker_b", THIRTY_MIN_MS),
            )
            .unwrap(),
            ClaimOutcome::NotClaimed,
            "{name}"
        );

        // exactly at the threshold
        s.reserve_lineage_row(at_min(0), &reserve_req("EDGE", "job1", "worker_a"))
            .unwrap();
        let edge = reclaim_req("EDGE", "job2", "worker_b", THIRTY_MIN_MS);
        assert!(
            s.reclaim_stale_lineage_row(at_min(30), &edge)
                .unwrap()
                .is_claimed(),
            "{name}"
        );

        // nothing to reclaim
        assert_eq!(
            s.reclaim_stale_lineage_row(
                at_min(500),
                &reclaim_req("NEVER", "job2", "worker_b", THIRTY_MIN_MS),
            )
            .unwrap(),
            ClaimOutcome::NotClaimed,
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_05_reclaim_refreshes_ownership_and_blocks_second_reclaimer() {
    for (name, s) in stores() {
        let original = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        let taken = claimed(
            s.reclaim_stale_lineage_row(
                at_min(45),
                &reclaim_req("CUST-100", "job2", "worker_b", THIRTY_MIN_MS),
            )
            .unwrap(),
            name,
        );
        assert_eq!(taken.lineage_id, original.lineage_id, "{name}");
        assert_eq!(taken.reclaim_epoch, original.reclaim_epoch + 1, "{name}");

        let rec = s.lineage_row(&taken.lineage_id).unwrap().unwrap();
        assert_eq!(rec.state, LineageState::Reserved, "{name}");
        assert_eq!(rec.reserved_at, at_min(45), "{name}");
        assert_eq!(rec.reserved_by.as_str(), "worker_b", "{name}");
        assert_eq!(rec.migration_job_id.as_str(), "job2", "{name}");

        // The refreshed reserved_at makes the row fresh again for a third worker.
        assert_eq!(
            s.reclaim_stale_lineage_row(
                at_min(46),
                &reclaim_req("CUST-100", "job3", "worker_c", THIRTY_MIN_MS),
            )
            .unwrap(),
            ClaimOutcome::NotClaimed,
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_06_commit_is_idempotent_and_keeps_first_canonical_id() {
    for (name, s) in stores() {
        let claim = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        assert_eq!(
            s.commit_lineage_row(at_min(1), &claim.lineage_id, &canonical("X"))
                .unwrap(),
            CommitOutcome::Committed,
            "{name}"
        );
        assert_eq!(
            s.commit_lineage_row(at_min(2), &claim.lineage_id, &canonical("Y"))
                .unwrap(),
            CommitOutcome::NotCommitted,
            "{name}"
        );

        let rec = s.lineage_row(&claim.lineage_id).unwrap().unwrap();
        assert_eq!(rec.state, LineageState::Committed, "{name}");
        assert_eq!(rec.canonical_id, Some(canonical("X")), "{name}");
        assert_eq!(rec.committed_at, Some(at_min(1)), "{name}");
    }
}

#[test]
fn at_lineage_db_07_commit_of_unknown_id_is_not_committed() {
    for (name, s) in stores() {
        let unknown = LineageId::new("lin_does_not_exist").unwrap();
        assert_eq!(
            s.commit_lineage_row(at_min(1), &unknown, &canonical("X"))
                .unwrap(),
            CommitOutcome::NotCommitted,
            "{name}"
        );
        assert!(s.lineage_row(&unknown).unwrap().is_none(), "{name}");
    }
}

#[test]
fn at_lineage_db_08_delete_of_committed_row_is_a_no_op() {
    for (name, s) in stores() {
        let claim = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        s.commit_lineage_row(at_min(1), &claim.lineage_id, &canonical("entity-55"))
            .unwrap();
        let before = s.lineage_row(&claim.lineage_id).unwrap().unwrap();

        assert_eq!(
            s.delete_reserved_lineage_row(&claim.lineage_id).unwrap(),
            DeleteOutcome::NoOp,
            "{name}"
        );
        assert_eq!(
            s.delete_reserved_lineage_row_fenced(&claim).unwrap(),
            DeleteOutcome::NoOp,
            "{name}"
        );

        let after = s.lineage_row(&claim.lineage_id).unwrap().unwrap();
        assert_eq!(before, after, "{name}");
    }
}

#[test]
fn at_lineage_db_09_delete_of_reserved_row_frees_the_dedupe_key() {
    for (name, s) in stores() {
        let claim = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        assert_eq!(
            s.delete_reserved_lineage_row(&claim.lineage_id).unwrap(),
            DeleteOutcome::Deleted,
            "{name}"
        );
        assert_eq!(
            s.delete_reserved_lineage_row(&claim.lineage_id).unwrap(),
            DeleteOutcome::NoOp,
            "{name}"
        );
        assert!(s.lineage_row_by_identity(&identity("CUST-100")).unwrap().is_none(), "{name}");

        let retry = claimed(
            s.reserve_lineage_row(at_min(1), &reserve_req("CUST-100", "job2", "worker_b"))
                .unwrap(),
            name,
        );
        assert_ne!(retry.lineage_id, claim.lineage_id, "{name}");
    }
}

#[test]
fn at_lineage_db_10_bulk_reserve_returns_only_new_rows() {
    for (name, s) in stores() {
        s.reserve_lineage_row(at_min(0), &reserve_req("C-2", "job0", "worker_x"))
            .unwrap();
        let done = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("C-4", "job0", "worker_x"))
                .unwrap(),
            name,
        );
        s.commit_lineage_row(at_min(1), &done.lineage_id, &canonical("entity-4"))
            .unwrap();

        let req = BulkReservationRequest::v1(
            MigrationJobId::new("job1").unwrap(),
            WorkerId::new("worker_a").unwrap(),
            ["C-1", "C-2", "C-3", "C-4", "C-5"]
                .into_iter()
                .map(identity)
                .collect(),
        )
        .unwrap();
        let out = s.bulk_reserve_lineage_rows(at_min(2), &req).unwrap();

        let got = out
            .claimed
            .iter()
            .map(|c| c.legacy_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(got, vec!["C-1", "C-3", "C-5"], "{name}");

        let skipped = out
            .unclaimed(&req)
            .into_iter()
            .map(|i| i.legacy_id.as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(skipped, vec!["C-2".to_string(), "C-4".to_string()], "{name}");

        for c in &out.claimed {
            let rec = s.lineage_row(&c.claim.lineage_id).unwrap().unwrap();
            assert_eq!(rec.legacy_id, c.legacy_id, "{name}");
            assert_eq!(rec.dedupe_key, c.dedupe_key, "{name}");
            assert_eq!(rec.reserved_by.as_str(), "worker_a", "{name}");
            assert_eq!(rec.migration_job_id.as_str(), "job1", "{name}");
            assert_eq!(rec.claim(), Some(c.claim.clone()), "{name}");
        }
        assert_eq!(
            s.lineage_state_counts().unwrap(),
            LineageStateCounts {
                reserved: 4,
                committed: 1
            },
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_11_bulk_reserve_collapses_in_batch_duplicates() {
    for (name, s) in stores() {
        let req = BulkReservationRequest::v1(
            MigrationJobId::new("job1").unwrap(),
            WorkerId::new("worker_a").unwrap(),
            vec![identity("C-1"), identity("C-1"), identity("C-2")],
        )
        .unwrap();
        let out = s.bulk_reserve_lineage_rows(at_min(0), &req).unwrap();
        assert_eq!(out.claimed.len(), 2, "{name}");
        assert!(out.unclaimed(&req).is_empty(), "{name}");

        let empty = BulkReservationRequest::v1(
            MigrationJobId::new("job1").unwrap(),
            WorkerId::new("worker_a").unwrap(),
            Vec::new(),
        )
        .unwrap();
        assert!(
            s.bulk_reserve_lineage_rows(at_min(0), &empty)
                .unwrap()
                .claimed
                .is_empty(),
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_12_crashed_worker_scenario_end_to_end() {
    for (name, s) in stores() {
        let a = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );

        let b = claimed(
            s.reclaim_stale_lineage_row(
                at_min(45),
                &reclaim_req("CUST-100", "job2", "worker_b", THIRTY_MIN_MS),
            )
            .unwrap(),
            name,
        );
        assert_eq!(b.lineage_id, a.lineage_id, "{name}");

        assert_eq!(
            s.commit_lineage_row_fenced(at_min(46), &b, &canonical("entity-55"))
                .unwrap(),
            CommitOutcome::Committed,
            "{name}"
        );
        let rec = s.lineage_row(&b.lineage_id).unwrap().unwrap();
        assert_eq!(rec.state, LineageState::Committed, "{name}");
        assert_eq!(rec.reserved_by.as_str(), "worker_b", "{name}");
        assert_eq!(rec.canonical_id, Some(canonical("entity-55")), "{name}");

        assert_eq!(
            s.reserve_lineage_row(at_min(60), &reserve_req("CUST-100", "job3", "worker_c"))
                .unwrap(),
            ClaimOutcome::NotClaimed,
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_13_displaced_worker_cannot_commit_fenced() {
    for (name, s) in stores() {
        let a = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        let b = claimed(
            s.reclaim_stale_lineage_row(
                at_min(45),
                &reclaim_req("CUST-100", "job2", "worker_b", THIRTY_MIN_MS),
            )
            .unwrap(),
            name,
        );

        // A was slow, not dead.
        assert_eq!(
            s.commit_lineage_row_fenced(at_min(47), &a, &canonical("entity-stale"))
                .unwrap(),
            CommitOutcome::NotCommitted,
            "{name}"
        );
        assert_eq!(
            s.delete_reserved_lineage_row_fenced(&a).unwrap(),
            DeleteOutcome::NoOp,
            "{name}"
        );
        assert_eq!(
            s.commit_lineage_row_fenced(at_min(48), &b, &canonical("entity-55"))
                .unwrap(),
            CommitOutcome::Committed,
            "{name}"
        );
        let rec = s.lineage_row(&a.lineage_id).unwrap().unwrap();
        assert_eq!(rec.canonical_id, Some(canonical("entity-55")), "{name}");
    }
}

#[test]
fn at_lineage_db_14_same_worker_reclaiming_its_own_row_still_gets_a_new_fence() {
    for (name, s) in stores() {
        let first = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        let second = claimed(
            s.reclaim_stale_lineage_row(
                at_min(31),
                &reclaim_req("CUST-100", "job1", "worker_a", THIRTY_MIN_MS),
            )
            .unwrap(),
            name,
        );
        assert_ne!(first, second, "{name}");
        assert_eq!(
            s.commit_lineage_row_fenced(at_min(32), &first, &canonical("X"))
                .unwrap(),
            CommitOutcome::NotCommitted,
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_15_unfenced_commit_checks_state_only() {
    for (name, s) in stores() {
        let a = claimed(
            s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        s.reclaim_stale_lineage_row(
            at_min(45),
            &reclaim_req("CUST-100", "job2", "worker_b", THIRTY_MIN_MS),
        )
        .unwrap();

        // The plain id-based commit does not know about owners; the row is still reserved.
        assert_eq!(
            s.commit_lineage_row(at_min(46), &a.lineage_id, &canonical("entity-a"))
                .unwrap(),
            CommitOutcome::Committed,
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_16_stale_scan_orders_oldest_first_and_skips_committed() {
    for (name, s) in stores() {
        s.reserve_lineage_row(at_min(10), &reserve_req("C-10", "job1", "worker_a"))
            .unwrap();
        s.reserve_lineage_row(at_min(0), &reserve_req("C-00", "job1", "worker_a"))
            .unwrap();
        s.reserve_lineage_row(at_min(5), &reserve_req("C-05", "job1", "worker_a"))
            .unwrap();
        s.reserve_lineage_row(at_min(50), &reserve_req("C-50", "job1", "worker_a"))
            .unwrap();
        let committed = claimed(
            s.reserve_lineage_row(at_min(1), &reserve_req("C-01", "job1", "worker_a"))
                .unwrap(),
            name,
        );
        s.commit_lineage_row(at_min(2), &committed.lineage_id, &canonical("entity-1"))
            .unwrap();

        let stale = s
            .stale_reserved_lineage_rows(at_min(60), THIRTY_MIN_MS, 10)
            .unwrap();
        let ids = stale
            .iter()
            .map(|r| r.legacy_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["C-00", "C-05", "C-10"], "{name}");

        let limited = s
            .stale_reserved_lineage_rows(at_min(60), THIRTY_MIN_MS, 2)
            .unwrap();
        assert_eq!(limited.len(), 2, "{name}");
        assert!(limited.iter().all(|r| r.state == LineageState::Reserved), "{name}");
    }
}

#[test]
fn at_lineage_db_17_invalid_inputs_fail_before_reaching_the_store() {
    for (name, s) in stores() {
        let err = s
            .reserve_lineage_row(
                MonotonicTimeNs(0),
                &reserve_req("CUST-100", "job1", "worker_a"),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::ContractViolation(_)), "{name}");

        let mut bad = reserve_req("CUST-100", "job1", "worker_a");
        bad.schema_version = SchemaVersion(99);
        let err = s.reserve_lineage_row(at_min(0), &bad).unwrap_err();
        assert!(matches!(err, StorageError::ContractViolation(_)), "{name}");

        assert!(
            s.lineage_row_by_identity(&identity("CUST-100"))
                .unwrap()
                .is_none(),
            "{name}"
        );
    }
}

#[test]
fn at_lineage_db_18_stale_scan_rejects_out_of_range_threshold() {
    for (name, s) in stores() {
        s.reserve_lineage_row(at_min(0), &reserve_req("CUST-100", "job1", "worker_a"))
            .unwrap();

        for threshold_ms in [0, RECLAIM_EXPIRY_THRESHOLD_MAX_MS + 1] {
            let err = s
                .stale_reserved_lineage_rows(at_min(1), threshold_ms, 10)
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    StorageError::ContractViolation(ContractViolation::InvalidValue {
                        field: "migration_lineage.expiry_threshold_ms",
                        ..
                    })
                ),
                "{name}: {threshold_ms}"
            );
        }

        let err = s
            .stale_reserved_lineage_rows(MonotonicTimeNs(0), THIRTY_MIN_MS, 10)
            .unwrap_err();
        assert!(matches!(err, StorageError::ContractViolation(_)), "{name}");

        // The row is only one minute old, so a valid threshold finds nothing.
        assert!(
            s.stale_reserved_lineage_rows(at_min(1), THIRTY_MIN_MS, 10)
                .unwrap()
                .is_empty(),
            "{name}"
        );
    }
}
