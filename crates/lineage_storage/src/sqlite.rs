#![forbid(unsafe_code)]

// SQLite stores timestamps and counters as i64; every conversion below is range-checked.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lineage_kernel_contracts::lineage::{
    BulkClaim, BulkReservationRequest, BulkReserveOutcome, CanonicalId, ClaimOutcome,
    CommitOutcome, DedupeKey, DeleteOutcome, EntityType, LegacyId, LegacyRecordIdentity,
    LegacySystem, LineageId, LineageRecord, LineageState, LineageStateCounts, MigrationJobId,
    OrgId, ReclaimRequest, ReservationClaim, ReservationRequest, WorkerId,
    LINEAGE_CONTRACT_VERSION,
};
use lineage_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use tracing::debug;

use crate::lineage::{
    next_lineage_id, validate_claim, validate_now, validate_stale_scan, StorageError,
};

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Schema for the lineage table.
///
/// `dedupe_key` is the one uniqueness constraint the exactly-once guarantee rests on. The CHECKs
/// and triggers make committed rows permanent for any writer, not only for this crate.
const LINEAGE_SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS migration_lineage (
    id TEXT PRIMARY KEY NOT NULL,
    org_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    legacy_system TEXT NOT NULL,
    legacy_id TEXT NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE,
    canonical_id TEXT,
    state TEXT NOT NULL CHECK (state IN ('reserved', 'committed')),
    reserved_at_ns INTEGER NOT NULL CHECK (reserved_at_ns > 0),
    reserved_by TEXT NOT NULL,
    migration_job_id TEXT NOT NULL,
    reclaim_epoch INTEGER NOT NULL DEFAULT 0 CHECK (reclaim_epoch >= 0),
    committed_at_ns INTEGER,
    CHECK ((state = 'committed') = (canonical_id IS NOT NULL)),
    CHECK ((state = 'committed') = (committed_at_ns IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_migration_lineage_stale
    ON migration_lineage(state, reserved_at_ns);

CREATE TRIGGER IF NOT EXISTS trg_migration_lineage_committed_no_delete
BEFORE DELETE ON migration_lineage
WHEN OLD.state = 'committed'
BEGIN
    SELECT RAISE(ABORT, 'committed lineage rows are permanent');
END;

CREATE TRIGGER IF NOT EXISTS trg_migration_lineage_committed_no_update
BEFORE UPDATE ON migration_lineage
WHEN OLD.state = 'committed'
BEGIN
    SELECT RAISE(ABORT, 'committed lineage rows are immutable');
END;
";

const LINEAGE_COLUMNS: &str = "id, org_id, entity_type, legacy_system, legacy_id, dedupe_key, \
     canonical_id, state, reserved_at_ns, reserved_by, migration_job_id, reclaim_epoch, \
     committed_at_ns";

fn ns_to_sql(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| {
        StorageError::ContractViolation(ContractViolation::InvalidValue {
            field,
            reason: "exceeds i64 range",
        })
    })
}

fn threshold_cutoff(now: MonotonicTimeNs, expiry_threshold_ms: u64) -> Result<i64, StorageError> {
    ns_to_sql(
        "migration_lineage.stale_cutoff",
        now.saturating_sub_ms(expiry_threshold_ms).0,
    )
}

/// A row exactly as SQLite hands it back, before contract decoding.
struct RawLineageRow {
    id: String,
    org_id: String,
    entity_type: String,
    legacy_system: String,
    legacy_id: String,
    dedupe_key: String,
    canonical_id: Option<String>,
    state: String,
    reserved_at_ns: i64,
    reserved_by: String,
    migration_job_id: String,
    reclaim_epoch: i64,
    committed_at_ns: Option<i64>,
}

impl RawLineageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            entity_type: row.get(2)?,
            legacy_system: row.get(3)?,
            legacy_id: row.get(4)?,
            dedupe_key: row.get(5)?,
            canonical_id: row.get(6)?,
            state: row.get(7)?,
            reserved_at_ns: row.get(8)?,
            reserved_by: row.get(9)?,
            migration_job_id: row.get(10)?,
            reclaim_epoch: row.get(11)?,
            committed_at_ns: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<LineageRecord, StorageError> {
        let corrupt = |reason: String| StorageError::CorruptRow {
            key: self.id.clone(),
            reason,
        };
        let state = LineageState::parse(&self.state)
            .ok_or_else(|| corrupt(format!("unknown state '{}'", self.state)))?;
        let reserved_at = u64::try_from(self.reserved_at_ns)
            .map_err(|_| corrupt("negative reserved_at_ns".to_string()))?;
        let reclaim_epoch = u64::try_from(self.reclaim_epoch)
            .map_err(|_| corrupt("negative reclaim_epoch".to_string()))?;
        let committed_at = self
            .committed_at_ns
            .map(u64::try_from)
            .transpose()
            .map_err(|_| corrupt("negative committed_at_ns".to_string()))?;
        let decode = |v: ContractViolation| corrupt(v.to_string());

        let rec = LineageRecord {
            schema_version: LINEAGE_CONTRACT_VERSION,
            lineage_id: LineageId::new(self.id.clone()).map_err(decode)?,
            org_id: OrgId::new(self.org_id.clone()).map_err(decode)?,
            entity_type: EntityType::new(self.entity_type.clone()).map_err(decode)?,
            legacy_system: LegacySystem::new(self.legacy_system.clone()).map_err(decode)?,
            legacy_id: LegacyId::new(self.legacy_id.clone()).map_err(decode)?,
            dedupe_key: DedupeKey::from_stored(self.dedupe_key.clone()).map_err(decode)?,
            canonical_id: self
                .canonical_id
                .clone()
                .map(CanonicalId::new)
                .transpose()
                .map_err(decode)?,
            state,
            reserved_at: MonotonicTimeNs(reserved_at),
            reserved_by: WorkerId::new(self.reserved_by.clone()).map_err(decode)?,
            migration_job_id: MigrationJobId::new(self.migration_job_id.clone())
                .map_err(decode)?,
            reclaim_epoch,
            committed_at: committed_at.map(MonotonicTimeNs),
        };
        rec.validate().map_err(decode)?;
        Ok(rec)
    }
}

/// Lineage store backed by a SQLite database file.
///
/// Every mutating operation is exactly one SQL statement whose WHERE clause (or conflict
/// target) carries the precondition. Several stores may open the same file; SQLite serializes
/// their writers and the uniqueness constraint decides every race.
pub struct SqliteLineageStore {
    conn: Mutex<Connection>,
}

impl SqliteLineageStore {
    /// Opens or creates a lineage database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(LINEAGE_SCHEMA)?;
        debug!(busy_timeout_ms = BUSY_TIMEOUT_MS, "migration_lineage schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("lineage connection lock poisoned".to_string()))
    }

    pub fn reserve(
        &self,
        now: MonotonicTimeNs,
        req: &ReservationRequest,
    ) -> Result<ClaimOutcome, StorageError> {
        validate_now(now)?;
        req.validate()?;

        let lineage_id = next_lineage_id()?;
        let identity = &req.identity;
        let inserted = self.conn()?.execute(
            "INSERT INTO migration_lineage
             (id, org_id, entity_type, legacy_system, legacy_id, dedupe_key,
              state, reserved_at_ns, reserved_by, migration_job_id, reclaim_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'reserved', ?7, ?8, ?9, 0)
             ON CONFLICT(dedupe_key) DO NOTHING",
            params![
                lineage_id.as_str(),
                identity.org_id.as_str(),
                identity.entity_type.as_str(),
                identity.legacy_system.as_str(),
                identity.legacy_id.as_str(),
                identity.dedupe_key().as_str(),
                ns_to_sql("migration_lineage.reserved_at", now.0)?,
                req.reserved_by.as_str(),
                req.migration_job_id.as_str(),
            ],
        )?;

        if inserted == 1 {
            Ok(ClaimOutcome::Claimed(req.initial_claim(lineage_id)))
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

        let cutoff = threshold_cutoff(now, req.expiry_threshold_ms)?;
        let reclaimed: Option<(String, i64)> = self
            .conn()?
            .query_row(
                "UPDATE migration_lineage
                 SET reserved_at_ns = ?1,
                     reserved_by = ?2,
                     migration_job_id = ?3,
                     reclaim_epoch = reclaim_epoch + 1
                 WHERE dedupe_key = ?4
                   AND state = 'reserved'
                   AND canonical_id IS NULL
                   AND reserved_at_ns <= ?5
                 RETURNING id, reclaim_epoch",
                params![
                    ns_to_sql("migration_lineage.reserved_at", now.0)?,
                    req.reserved_by.as_str(),
                    req.migration_job_id.as_str(),
                    req.identity.dedupe_key().as_str(),
                    cutoff,
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, epoch)) = reclaimed else {
            return Ok(ClaimOutcome::NotClaimed);
        };
        let corrupt = |reason: String| StorageError::CorruptRow {
            key: id.clone(),
            reason,
        };
        Ok(ClaimOutcome::Claimed(ReservationClaim {
            lineage_id: LineageId::new(id.clone()).map_err(|v| corrupt(v.to_string()))?,
            reserved_by: req.reserved_by.clone(),
            migration_job_id: req.migration_job_id.clone(),
            reclaim_epoch: u64::try_from(epoch)
                .map_err(|_| corrupt("negative reclaim_epoch".to_string()))?,
        }))
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

        let updated = self.conn()?.execute(
            "UPDATE migration_lineage
             SET state = 'committed', canonical_id = ?2, committed_at_ns = ?3
             WHERE id = ?1 AND state = 'reserved'",
            params![
                lineage_id.as_str(),
                canonical_id.as_str(),
                ns_to_sql("migration_lineage.committed_at", now.0)?,
            ],
        )?;
        Ok(commit_outcome(updated))
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

        let updated = self.conn()?.execute(
            "UPDATE migration_lineage
             SET state = 'committed', canonical_id = ?2, committed_at_ns = ?3
             WHERE id = ?1
               AND state = 'reserved'
               AND reserved_by = ?4
               AND migration_job_id = ?5
               AND reclaim_epoch = ?6",
            params![
                claim.lineage_id.as_str(),
                canonical_id.as_str(),
                ns_to_sql("migration_lineage.committed_at", now.0)?,
                claim.reserved_by.as_str(),
                claim.migration_job_id.as_str(),
                ns_to_sql("reservation_claim.reclaim_epoch", claim.reclaim_epoch)?,
            ],
        )?;
        Ok(commit_outcome(updated))
    }

    pub fn delete_reservation(
        &self,
        lineage_id: &LineageId,
    ) -> Result<DeleteOutcome, StorageError> {
        lineage_id.validate()?;

        let deleted = self.conn()?.execute(
            "DELETE FROM migration_lineage WHERE id = ?1 AND state = 'reserved'",
            params![lineage_id.as_str()],
        )?;
        Ok(delete_outcome(deleted))
    }

    pub fn delete_reservation_fenced(
        &self,
        claim: &ReservationClaim,
    ) -> Result<DeleteOutcome, StorageError> {
        validate_claim(claim)?;

        let deleted = self.conn()?.execute(
            "DELETE FROM migration_lineage
             WHERE id = ?1
               AND state = 'reserved'
               AND reserved_by = ?2
               AND migration_job_id = ?3
               AND reclaim_epoch = ?4",
            params![
                claim.lineage_id.as_str(),
                claim.reserved_by.as_str(),
                claim.migration_job_id.as_str(),
                ns_to_sql("reservation_claim.reclaim_epoch", claim.reclaim_epoch)?,
            ],
        )?;
        Ok(delete_outcome(deleted))
    }

    /// One multi-row `INSERT ... ON CONFLICT DO NOTHING RETURNING`, so the whole batch is a
    /// single statement and a single round trip.
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

        let reserved_at = ns_to_sql("migration_lineage.reserved_at", now.0)?;
        let mut pending = Vec::with_capacity(req.items.len());
        let mut values = Vec::with_capacity(req.items.len() * 9);
        for item in &req.items {
            let lineage_id = next_lineage_id()?;
            let dedupe_key = item.dedupe_key();
            values.extend([
                Value::Text(lineage_id.as_str().to_string()),
                Value::Text(item.org_id.as_str().to_string()),
                Value::Text(item.entity_type.as_str().to_string()),
                Value::Text(item.legacy_system.as_str().to_string()),
                Value::Text(item.legacy_id.as_str().to_string()),
                Value::Text(dedupe_key.as_str().to_string()),
                Value::Integer(reserved_at),
                Value::Text(req.reserved_by.as_str().to_string()),
                Value::Text(req.migration_job_id.as_str().to_string()),
            ]);
            pending.push(BulkClaim {
                legacy_id: item.legacy_id.clone(),
                dedupe_key,
                claim: req.item_request(item).initial_claim(lineage_id),
            });
        }

        let tuples = vec!["(?, ?, ?, ?, ?, ?, 'reserved', ?, ?, ?, 0)"; pending.len()].join(", ");
        let sql = format!(
            "INSERT INTO migration_lineage
             (id, org_id, entity_type, legacy_system, legacy_id, dedupe_key,
              state, reserved_at_ns, reserved_by, migration_job_id, reclaim_epoch)
             VALUES {tuples}
             ON CONFLICT(dedupe_key) DO NOTHING
             RETURNING id"
        );

        let inserted_ids = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<BTreeSet<_>, _>>()?
        };

        let claimed = pending
            .into_iter()
            .filter(|c| inserted_ids.contains(c.claim.lineage_id.as_str()))
            .collect::<Vec<_>>();
        debug!(
            migration_job_id = %req.migration_job_id,
            requested = req.items.len(),
            claimed = claimed.len(),
            "bulk reservation applied"
        );
        Ok(BulkReserveOutcome { claimed })
    }

    pub fn get(&self, lineage_id: &LineageId) -> Result<Option<LineageRecord>, StorageError> {
        self.select_one(
            &format!("SELECT {LINEAGE_COLUMNS} FROM migration_lineage WHERE id = ?1"),
            lineage_id.as_str(),
        )
    }

    pub fn get_by_identity(
        &self,
        identity: &LegacyRecordIdentity,
    ) -> Result<Option<LineageRecord>, StorageError> {
        self.select_one(
            &format!("SELECT {LINEAGE_COLUMNS} FROM migration_lineage WHERE dedupe_key = ?1"),
            identity.dedupe_key().as_str(),
        )
    }

    fn select_one(&self, sql: &str, key: &str) -> Result<Option<LineageRecord>, StorageError> {
        let raw = self
            .conn()?
            .query_row(sql, params![key], RawLineageRow::from_row)
            .optional()?;
        raw.map(RawLineageRow::into_record).transpose()
    }

    pub fn stale_reservations(
        &self,
        now: MonotonicTimeNs,
        expiry_threshold_ms: u64,
        limit: usize,
    ) -> Result<Vec<LineageRecord>, StorageError> {
        validate_stale_scan(now, expiry_threshold_ms)?;
        let cutoff = threshold_cutoff(now, expiry_threshold_ms)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let raw_rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {LINEAGE_COLUMNS} FROM migration_lineage
                 WHERE state = 'reserved'
                   AND canonical_id IS NULL
                   AND reserved_at_ns <= ?1
                 ORDER BY reserved_at_ns ASC, id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![cutoff, limit], RawLineageRow::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raw_rows.into_iter().map(RawLineageRow::into_record).collect()
    }

    pub fn state_counts(&self) -> Result<LineageStateCounts, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM migration_lineage GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = LineageStateCounts::default();
        for row in rows {
            let (state, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match LineageState::parse(&state) {
                Some(LineageState::Reserved) => counts.reserved = count,
                Some(LineageState::Committed) => counts.committed = count,
                None => {
                    return Err(StorageError::CorruptRow {
                        key: "migration_lineage.state".to_string(),
                        reason: format!("unknown state '{state}'"),
                    })
                }
            }
        }
        Ok(counts)
    }
}

fn commit_outcome(rows_affected: usize) -> CommitOutcome {
    if rows_affected == 1 {
        CommitOutcome::Committed
    } else {
        CommitOutcome::NotCommitted
    }
}

fn delete_outcome(rows_affected: usize) -> DeleteOutcome {
    if rows_affected == 1 {
        DeleteOutcome::Deleted
    } else {
        DeleteOutcome::NoOp
    }
}
