//! Oplog & Shadow Store (spec §4.1, component B).
//!
//! Owns the on-disk `_electric_oplog` / `_electric_shadow` / `_electric_triggers`
//! tables and the per-table triggers that populate the oplog on every user
//! write. Generalizes the teacher crate's `SyncEngine::init_schema` /
//! `log_local_change` (`examples/Dominik7787-Sync-Engine-Client-Side/src/oplog.rs`)
//! from a single flat `local_changes` table into the oplog+shadow+triggers
//! split the spec requires.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SatelliteConfig;
use crate::error::Result;
use crate::tag::TagSet;

/// `optype ∈ {INSERT, UPDATE, DELETE, COMPENSATION}` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Compensation,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::Compensation => "COMPENSATION",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "INSERT" => OpType::Insert,
            "UPDATE" => OpType::Update,
            "DELETE" => OpType::Delete,
            "COMPENSATION" => OpType::Compensation,
            other => {
                return Err(crate::error::SatelliteError::Internal(format!(
                    "unknown optype: {other}"
                )))
            }
        })
    }

    pub fn is_delete(self) -> bool {
        matches!(self, OpType::Delete)
    }
}

/// An oplog row (spec §3). `timestamp` is `None` until a snapshot promotes
/// it; `rowid` is `None` before the row has been inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    pub rowid: Option<i64>,
    pub namespace: String,
    pub tablename: String,
    pub optype: OpType,
    pub primary_key: Value,
    pub new_row: Option<Value>,
    pub old_row: Option<Value>,
    pub timestamp: Option<i64>,
    pub clear_tags: TagSet,
}

impl OplogEntry {
    /// Canonical JSON encoding of the primary key, in declared column order.
    pub fn primary_key_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.primary_key)?)
    }
}

/// A row in `_electric_shadow`: the tag set observed for one user row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowRow {
    pub namespace: String,
    pub tablename: String,
    pub primary_key: Value,
    pub tags: TagSet,
}

/// Schema + trigger management, plus direct oplog/shadow CRUD helpers used
/// by the snapshotter and the applier.
pub struct OplogStore<'a> {
    conn: &'a Connection,
    cfg: &'a SatelliteConfig,
}

impl<'a> OplogStore<'a> {
    pub fn new(conn: &'a Connection, cfg: &'a SatelliteConfig) -> Self {
        Self { conn, cfg }
    }

    /// Create `_electric_oplog`, `_electric_shadow`, `_electric_triggers`
    /// and `_electric_migrations` if they do not already exist. Safe to call
    /// multiple times (mirrors the teacher's `init_schema`).
    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS main.{oplog} (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    tablename TEXT NOT NULL,
    optype TEXT NOT NULL CHECK(optype IN ('INSERT','UPDATE','DELETE','COMPENSATION')),
    primaryKey TEXT NOT NULL,
    newRow TEXT,
    oldRow TEXT,
    timestamp TEXT,
    clearTags TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_{oplog}_timestamp ON main.{oplog}(timestamp);
CREATE INDEX IF NOT EXISTS idx_{oplog}_key ON main.{oplog}(namespace, tablename, primaryKey);

CREATE TABLE IF NOT EXISTS main.{shadow} (
    namespace TEXT NOT NULL,
    tablename TEXT NOT NULL,
    primaryKey TEXT NOT NULL,
    tags TEXT NOT NULL,
    PRIMARY KEY(namespace, tablename, primaryKey)
);

CREATE TABLE IF NOT EXISTS main.{triggers} (
    tablename TEXT PRIMARY KEY,
    flag INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS main.{migrations} (
    version TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#,
            oplog = self.cfg.oplog_table(),
            shadow = self.cfg.shadow_table(),
            triggers = self.cfg.triggers_table(),
            migrations = self.cfg.migrations_table(),
        ))?;
        Ok(())
    }

    /// Install the INSERT/UPDATE/DELETE oplog triggers for `table`, gated
    /// by the `_electric_triggers.flag` column so the applier can disable
    /// them while writing remote changes back (spec §4.1). `columns` is the
    /// table's full column list (from `pragma_table_info`), used to build
    /// the `newRow`/`oldRow` full-row JSON snapshots and the `primaryKey`
    /// JSON in declared column order.
    pub fn install_triggers(
        &self,
        namespace: &str,
        table: &str,
        columns: &[&str],
        pk_columns: &[&str],
    ) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO main.{triggers}(tablename, flag) VALUES (?1, 1)
                 ON CONFLICT(tablename) DO NOTHING",
                triggers = self.cfg.triggers_table()
            ),
            params![table],
        )?;

        let pk_new = json_object_expr(pk_columns, "NEW");
        let pk_old = json_object_expr(pk_columns, "OLD");
        let new_row = json_object_expr(columns, "NEW");
        let old_row = json_object_expr(columns, "OLD");

        self.conn.execute_batch(&format!(
            r#"
DROP TRIGGER IF EXISTS {prefix}_insert_{table};
CREATE TRIGGER {prefix}_insert_{table}
AFTER INSERT ON main.{table}
WHEN (SELECT flag FROM main.{triggers} WHERE tablename = '{table}') = 1
BEGIN
  INSERT INTO main.{oplog}(namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags)
  VALUES ('{namespace}', '{table}', 'INSERT', {pk_new}, {new_row}, NULL, NULL, '[]');
END;

DROP TRIGGER IF EXISTS {prefix}_update_{table};
CREATE TRIGGER {prefix}_update_{table}
AFTER UPDATE ON main.{table}
WHEN (SELECT flag FROM main.{triggers} WHERE tablename = '{table}') = 1
BEGIN
  INSERT INTO main.{oplog}(namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags)
  VALUES ('{namespace}', '{table}', 'UPDATE', {pk_new}, {new_row}, {old_row}, NULL, '[]');
END;

DROP TRIGGER IF EXISTS {prefix}_delete_{table};
CREATE TRIGGER {prefix}_delete_{table}
AFTER DELETE ON main.{table}
WHEN (SELECT flag FROM main.{triggers} WHERE tablename = '{table}') = 1
BEGIN
  INSERT INTO main.{oplog}(namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags)
  VALUES ('{namespace}', '{table}', 'DELETE', {pk_old}, NULL, {old_row}, NULL, '[]');
END;
"#,
            prefix = self.cfg.table_prefix,
            table = table,
            namespace = namespace,
            triggers = self.cfg.triggers_table(),
            oplog = self.cfg.oplog_table(),
            pk_new = pk_new,
            pk_old = pk_old,
            new_row = new_row,
            old_row = old_row,
        ))?;
        Ok(())
    }

    /// Disable triggers for `table` (used by the applier while writing
    /// remote changes, so remote writes do not themselves produce oplog
    /// rows).
    pub fn set_trigger_flag(&self, table: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO main.{triggers}(tablename, flag) VALUES (?1, ?2)
                 ON CONFLICT(tablename) DO UPDATE SET flag = excluded.flag",
                triggers = self.cfg.triggers_table()
            ),
            params![table, enabled as i64],
        )?;
        Ok(())
    }

    /// Oplog rows with `rowid > since`, ordered by rowid (spec §4.3 step 1's
    /// selection predicate, also used by the applier to read pending local
    /// state before a merge).
    pub fn entries_since(&self, since_rowid: i64) -> Result<Vec<OplogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT rowid, namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags
             FROM main.{oplog}
             WHERE rowid > ?1
             ORDER BY rowid ASC",
            oplog = self.cfg.oplog_table()
        ))?;
        let rows = stmt.query_map(params![since_rowid], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Pending (unacknowledged) oplog rows for one key, used by the applier
    /// to build the local side of a merge fold (spec §4.4 step 4).
    pub fn pending_entries_for_key(
        &self,
        since_rowid: i64,
        namespace: &str,
        tablename: &str,
        pk: &str,
    ) -> Result<Vec<OplogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT rowid, namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags
             FROM main.{oplog}
             WHERE rowid > ?1 AND namespace = ?2 AND tablename = ?3 AND primaryKey = ?4
             ORDER BY rowid ASC",
            oplog = self.cfg.oplog_table()
        ))?;
        let rows = stmt.query_map(params![since_rowid, namespace, tablename, pk], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn unsent_entries(&self, last_sent_rowid: i64) -> Result<Vec<OplogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT rowid, namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags
             FROM main.{oplog}
             WHERE rowid > ?1 AND timestamp IS NOT NULL
             ORDER BY rowid ASC",
            oplog = self.cfg.oplog_table()
        ))?;
        let rows = stmt.query_map(params![last_sent_rowid], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Assign `timestamp` to every oplog row where `timestamp IS NULL AND
    /// rowid > since`, returning the written rows (spec §4.3 step 1).
    pub fn stamp_pending_entries(&self, since_rowid: i64, timestamp_ms: i64) -> Result<Vec<OplogEntry>> {
        self.conn.execute(
            &format!(
                "UPDATE main.{oplog} SET timestamp = ?1 WHERE timestamp IS NULL AND rowid > ?2",
                oplog = self.cfg.oplog_table()
            ),
            params![timestamp_ms.to_string(), since_rowid],
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT rowid, namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp, clearTags
             FROM main.{oplog}
             WHERE timestamp = ?1 AND rowid > ?2
             ORDER BY rowid ASC",
            oplog = self.cfg.oplog_table()
        ))?;
        let rows = stmt.query_map(params![timestamp_ms.to_string(), since_rowid], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Overwrite `clearTags` for a specific oplog row (spec §4.3 step 2).
    pub fn set_clear_tags(&self, rowid: i64, tags: &TagSet) -> Result<()> {
        self.conn.execute(
            &format!(
                "UPDATE main.{oplog} SET clearTags = ?1 WHERE rowid = ?2",
                oplog = self.cfg.oplog_table()
            ),
            params![tags.encode()?, rowid],
        )?;
        Ok(())
    }

    /// Delete oplog rows whose `timestamp` equals `commit_ts` (spec §4.4
    /// step 8: garbage-collecting acknowledged local writes).
    pub fn delete_entries_with_timestamp(&self, commit_ts: i64) -> Result<usize> {
        let n = self.conn.execute(
            &format!(
                "DELETE FROM main.{oplog} WHERE timestamp = ?1",
                oplog = self.cfg.oplog_table()
            ),
            params![commit_ts.to_string()],
        )?;
        Ok(n)
    }

    /// Delete the oplog rows for a set of primary keys (used by compensating
    /// delete-acknowledgement paths in the applier).
    pub fn delete_entries_for_rowids(&self, rowids: &[i64]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for rowid in rowids {
            tx.execute(
                &format!("DELETE FROM main.{oplog} WHERE rowid = ?1", oplog = self.cfg.oplog_table()),
                params![rowid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn max_rowid(&self) -> Result<i64> {
        let max: Option<i64> = self.conn.query_row(
            &format!("SELECT MAX(rowid) FROM main.{oplog}", oplog = self.cfg.oplog_table()),
            [],
            |r| r.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    pub fn shadow_tags(&self, namespace: &str, tablename: &str, pk: &str) -> Result<TagSet> {
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT tags FROM main.{shadow} WHERE namespace = ?1 AND tablename = ?2 AND primaryKey = ?3",
                    shadow = self.cfg.shadow_table()
                ),
                params![namespace, tablename, pk],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => TagSet::decode(&s),
            None => Ok(TagSet::new()),
        }
    }

    pub fn upsert_shadow(&self, namespace: &str, tablename: &str, pk: &str, tags: &TagSet) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO main.{shadow}(namespace, tablename, primaryKey, tags) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, tablename, primaryKey) DO UPDATE SET tags = excluded.tags",
                shadow = self.cfg.shadow_table()
            ),
            params![namespace, tablename, pk, tags.encode()?],
        )?;
        Ok(())
    }

    pub fn delete_shadow(&self, namespace: &str, tablename: &str, pk: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                "DELETE FROM main.{shadow} WHERE namespace = ?1 AND tablename = ?2 AND primaryKey = ?3",
                shadow = self.cfg.shadow_table()
            ),
            params![namespace, tablename, pk],
        )?;
        Ok(())
    }

    /// Clear every shadow row for a table (used when resetting subscription
    /// state after an unrecoverable subscription error, spec §4.5).
    pub fn delete_shadow_for_table(&self, namespace: &str, tablename: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                "DELETE FROM main.{shadow} WHERE namespace = ?1 AND tablename = ?2",
                shadow = self.cfg.shadow_table()
            ),
            params![namespace, tablename],
        )?;
        Ok(())
    }

    pub fn shadow_row_count(&self, namespace: &str, tablename: &str) -> Result<i64> {
        self.conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM main.{shadow} WHERE namespace = ?1 AND tablename = ?2",
                    shadow = self.cfg.shadow_table()
                ),
                params![namespace, tablename],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }
}

fn row_to_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<OplogEntry> {
    let optype: String = r.get(3)?;
    let pk_raw: String = r.get(4)?;
    let new_row_raw: Option<String> = r.get(5)?;
    let old_row_raw: Option<String> = r.get(6)?;
    let timestamp_raw: Option<String> = r.get(7)?;
    let clear_tags_raw: String = r.get(8)?;

    Ok(OplogEntry {
        rowid: r.get(0)?,
        namespace: r.get(1)?,
        tablename: r.get(2)?,
        optype: OpType::parse(&optype).unwrap_or(OpType::Update),
        primary_key: serde_json::from_str(&pk_raw).unwrap_or(Value::Null),
        new_row: new_row_raw.map(|s| serde_json::from_str(&s).unwrap_or(Value::Null)),
        old_row: old_row_raw.map(|s| serde_json::from_str(&s).unwrap_or(Value::Null)),
        timestamp: timestamp_raw.and_then(|s| s.parse::<i64>().ok()),
        clear_tags: TagSet::decode(&clear_tags_raw).unwrap_or_default(),
    })
}

/// `json_object('col', NEW.col, ...)` for the given columns and row alias.
fn json_object_expr(columns: &[&str], alias: &str) -> String {
    let parts: Vec<String> = columns
        .iter()
        .map(|c| format!("'{c}', {alias}.{c}"))
        .collect();
    format!("json_object({})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Connection, SatelliteConfig) {
        let conn = Connection::open_in_memory().unwrap();
        let cfg = SatelliteConfig::default();
        let store = OplogStore::new(&conn, &cfg);
        store.init_schema().unwrap();
        (conn, cfg)
    }

    #[test]
    fn init_schema_is_idempotent() {
        let (conn, cfg) = setup();
        let store = OplogStore::new(&conn, &cfg);
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }

    #[test]
    fn shadow_upsert_and_delete_round_trip() {
        let (conn, cfg) = setup();
        let store = OplogStore::new(&conn, &cfg);
        let mut tags = TagSet::new();
        tags.insert(crate::tag::Tag::generate(
            "client-a",
            chrono::DateTime::from_timestamp_millis(1).unwrap(),
        ));

        store.upsert_shadow("main", "parent", "[1]", &tags).unwrap();
        assert_eq!(store.shadow_row_count("main", "parent").unwrap(), 1);
        let fetched = store.shadow_tags("main", "parent", "[1]").unwrap();
        assert_eq!(fetched, tags);

        store.delete_shadow("main", "parent", "[1]").unwrap();
        assert_eq!(store.shadow_row_count("main", "parent").unwrap(), 0);
    }

    #[test]
    fn entries_since_orders_by_rowid_and_respects_floor() {
        let (conn, cfg) = setup();
        let store = OplogStore::new(&conn, &cfg);
        conn.execute(
            &format!(
                "INSERT INTO main.{oplog}(namespace, tablename, optype, primaryKey) VALUES ('main','parent','INSERT','[1]')",
                oplog = cfg.oplog_table()
            ),
            [],
        )
        .unwrap();
        conn.execute(
            &format!(
                "INSERT INTO main.{oplog}(namespace, tablename, optype, primaryKey) VALUES ('main','parent','UPDATE','[1]')",
                oplog = cfg.oplog_table()
            ),
            [],
        )
        .unwrap();

        let entries = store.entries_since(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].rowid.unwrap() < entries[1].rowid.unwrap());

        let entries = store.entries_since(entries[0].rowid.unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn triggers_populate_oplog_on_user_writes() {
        let (conn, cfg) = setup();
        let store = OplogStore::new(&conn, &cfg);
        conn.execute_batch("CREATE TABLE main.parent(id INTEGER PRIMARY KEY, value TEXT);")
            .unwrap();
        store
            .install_triggers("main", "parent", &["id", "value"], &["id"])
            .unwrap();

        conn.execute("INSERT INTO main.parent(id, value) VALUES (1, 'local')", [])
            .unwrap();
        let entries = store.entries_since(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].optype, OpType::Insert);
        assert!(entries[0].timestamp.is_none());

        conn.execute("UPDATE main.parent SET value = 'local1' WHERE id = 1", [])
            .unwrap();
        let entries = store.entries_since(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].optype, OpType::Update);

        store.set_trigger_flag("parent", false).unwrap();
        conn.execute("DELETE FROM main.parent WHERE id = 1", []).unwrap();
        let entries = store.entries_since(0).unwrap();
        assert_eq!(entries.len(), 2, "disabled trigger must not append to oplog");
    }
}
