//! Snapshotter (spec §4.3, component D).
//!
//! Turns pending, not-yet-timestamped oplog rows into a committed shadow
//! update in one SQLite transaction, then exposes the newly-timestamped
//! rows as outbound `Transaction`s for the Replication Client. Throttled
//! and made re-entrant-safe by `SnapshotScheduler`, used by the lifecycle
//! controller (spec §5: "mutex + throttle guarded snapshot triggering").

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::client::{Change, DataChange, RecordType, Transaction};
use crate::config::SatelliteConfig;
use crate::error::Result;
use crate::oplog::{OplogEntry, OplogStore};
use crate::tag::{Tag, TagSet};

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap())
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotResult {
    pub timestamp_ms: i64,
    pub touched_keys: usize,
}

pub struct Snapshotter<'a> {
    conn: &'a Connection,
    cfg: &'a SatelliteConfig,
}

impl<'a> Snapshotter<'a> {
    pub fn new(conn: &'a Connection, cfg: &'a SatelliteConfig) -> Self {
        Self { conn, cfg }
    }

    /// Run the four-step procedure (spec §4.3):
    /// 1. stamp every pending row with `timestamp_ms`;
    /// 2. for each distinct key touched, set the first touched row's
    ///    `clearTags` to the shadow tags observed before this batch;
    /// 3. update the shadow table per key, from each key's last op;
    /// 4. (left to the caller, via `outbound_transactions_since`) emit the
    ///    newly-timestamped rows as outbound transactions.
    ///
    /// Returns `Ok(None)` if there was nothing pending.
    pub fn take_snapshot(
        &self,
        since_rowid: i64,
        timestamp_ms: i64,
        local_client_id: &str,
    ) -> Result<Option<SnapshotResult>> {
        let store = OplogStore::new(self.conn, self.cfg);
        let tx = self.conn.unchecked_transaction()?;

        let stamped = store.stamp_pending_entries(since_rowid, timestamp_ms)?;
        if stamped.is_empty() {
            tx.commit()?;
            return Ok(None);
        }

        let mut groups: BTreeMap<(String, String, String), Vec<&OplogEntry>> = BTreeMap::new();
        for entry in &stamped {
            let pk = entry.primary_key_string()?;
            groups
                .entry((entry.namespace.clone(), entry.tablename.clone(), pk))
                .or_default()
                .push(entry);
        }

        let new_tag = Tag::generate(local_client_id, ms_to_datetime(timestamp_ms));
        let touched_keys = groups.len();

        for ((namespace, tablename, pk), rows) in groups {
            let prior_shadow = store.shadow_tags(&namespace, &tablename, &pk)?;
            if let Some(first) = rows.first().and_then(|r| r.rowid) {
                store.set_clear_tags(first, &prior_shadow)?;
            }

            let last = rows.last().expect("group is never empty");
            if last.optype.is_delete() {
                store.delete_shadow(&namespace, &tablename, &pk)?;
            } else {
                store.upsert_shadow(&namespace, &tablename, &pk, &TagSet::single(new_tag.clone()))?;
            }
        }

        tx.commit()?;
        Ok(Some(SnapshotResult { timestamp_ms, touched_keys }))
    }
}

/// Group rows stamped with `timestamp > last_sent_rowid` into outbound
/// `Transaction`s, one per distinct timestamp (each snapshot call's batch
/// becomes a single logical transaction on the wire).
pub fn outbound_transactions_since(
    store: &OplogStore,
    last_sent_rowid: i64,
    origin: &str,
) -> Result<Vec<Transaction>> {
    let entries = store.unsent_entries(last_sent_rowid)?;
    let mut by_ts: BTreeMap<i64, Vec<DataChange>> = BTreeMap::new();
    let mut max_rowid_by_ts: BTreeMap<i64, i64> = BTreeMap::new();

    for entry in &entries {
        let ts = entry.timestamp.unwrap_or(0);
        let record_type = match entry.optype {
            crate::oplog::OpType::Insert => RecordType::Insert,
            crate::oplog::OpType::Update | crate::oplog::OpType::Compensation => RecordType::Update,
            crate::oplog::OpType::Delete => RecordType::Delete,
        };
        let change = DataChange {
            schema: entry.namespace.clone(),
            table: entry.tablename.clone(),
            record_type,
            new_record: entry.new_row.clone(),
            old_record: entry.old_row.clone(),
            tags: TagSet::new(),
        };
        by_ts.entry(ts).or_default().push(change);
        let rowid = entry.rowid.unwrap_or(0);
        max_rowid_by_ts
            .entry(ts)
            .and_modify(|r| *r = (*r).max(rowid))
            .or_insert(rowid);
    }

    let mut out = Vec::with_capacity(by_ts.len());
    for (ts, changes) in by_ts {
        let rowid = max_rowid_by_ts.get(&ts).copied().unwrap_or(0);
        out.push(Transaction {
            origin: origin.to_string(),
            commit_timestamp_ms: ts,
            lsn: rowid.to_be_bytes().to_vec(),
            changes: changes.into_iter().map(Change::Data).collect(),
        });
    }
    Ok(out)
}

/// Throttle + re-entrancy guard around `Snapshotter::take_snapshot` (spec
/// §5, §9). Only one snapshot may run at a time, and snapshots are spaced
/// at least `min_window` apart.
pub struct SnapshotScheduler {
    last_run: Mutex<Option<Instant>>,
    running: AtomicBool,
    min_window: Duration,
}

impl SnapshotScheduler {
    pub fn new(min_window: Duration) -> Self {
        Self {
            last_run: Mutex::new(None),
            running: AtomicBool::new(false),
            min_window,
        }
    }

    /// Attempt to enter the snapshot section. Returns `false` if a snapshot
    /// is already in flight or the minimum window has not elapsed since the
    /// last run; the caller should simply skip this tick.
    pub async fn try_enter(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let last_run = self.last_run.lock().await;
        if let Some(last) = *last_run {
            if last.elapsed() < self.min_window {
                drop(last_run);
                self.running.store(false, Ordering::SeqCst);
                return false;
            }
        }
        true
    }

    pub async fn mark_done(&self) {
        let mut last_run = self.last_run.lock().await;
        *last_run = Some(Instant::now());
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OplogStore;

    fn setup() -> (Connection, SatelliteConfig) {
        let conn = Connection::open_in_memory().unwrap();
        let cfg = SatelliteConfig::default();
        let store = OplogStore::new(&conn, &cfg);
        store.init_schema().unwrap();
        conn.execute_batch("CREATE TABLE main.parent(id INTEGER PRIMARY KEY, value TEXT);")
            .unwrap();
        store.install_triggers("main", "parent", &["id", "value"], &["id"]).unwrap();
        (conn, cfg)
    }

    #[test]
    fn snapshot_stamps_rows_and_sets_shadow_tag() {
        let (conn, cfg) = setup();
        conn.execute("INSERT INTO main.parent(id, value) VALUES (1, 'local')", []).unwrap();

        let snapshotter = Snapshotter::new(&conn, &cfg);
        let result = snapshotter.take_snapshot(0, 1_000, "client-a").unwrap().unwrap();
        assert_eq!(result.touched_keys, 1);

        let store = OplogStore::new(&conn, &cfg);
        let tags = store.shadow_tags("main", "parent", "[1]").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.iter().next().unwrap().client_id(), "client-a");
    }

    #[test]
    fn snapshot_with_no_pending_rows_returns_none() {
        let (conn, cfg) = setup();
        let snapshotter = Snapshotter::new(&conn, &cfg);
        assert!(snapshotter.take_snapshot(0, 1_000, "client-a").unwrap().is_none());
    }

    #[test]
    fn delete_after_insert_in_one_window_clears_shadow() {
        let (conn, cfg) = setup();
        conn.execute("INSERT INTO main.parent(id, value) VALUES (1, 'local')", []).unwrap();
        conn.execute("DELETE FROM main.parent WHERE id = 1", []).unwrap();

        let snapshotter = Snapshotter::new(&conn, &cfg);
        snapshotter.take_snapshot(0, 1_000, "client-a").unwrap();

        let store = OplogStore::new(&conn, &cfg);
        assert_eq!(store.shadow_row_count("main", "parent").unwrap(), 0);
    }

    #[test]
    fn outbound_transactions_group_by_timestamp() {
        let (conn, cfg) = setup();
        conn.execute("INSERT INTO main.parent(id, value) VALUES (1, 'local')", []).unwrap();
        let snapshotter = Snapshotter::new(&conn, &cfg);
        snapshotter.take_snapshot(0, 1_000, "client-a").unwrap();

        let store = OplogStore::new(&conn, &cfg);
        let txs = outbound_transactions_since(&store, 0, "client-a").unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].commit_timestamp_ms, 1_000);
        assert_eq!(txs[0].changes.len(), 1);
    }

    #[tokio::test]
    async fn scheduler_rejects_reentrant_and_too_soon_runs() {
        let scheduler = SnapshotScheduler::new(Duration::from_millis(50));
        assert!(scheduler.try_enter().await);
        assert!(!scheduler.try_enter().await, "reentrant call must be rejected");
        scheduler.mark_done().await;
        assert!(!scheduler.try_enter().await, "too soon after last run");
    }
}
