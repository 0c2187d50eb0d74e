//! Applier (spec §4.4, component E — the other half of the Merger/Applier
//! pair in `merge.rs`): applies an incoming `Transaction` to the local
//! database in one atomic write, merging against any still-pending local
//! oplog rows and regenerating triggers after DDL.

use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::Value;

use crate::client::{Change, MigrationType, Transaction};
use crate::config::SatelliteConfig;
use crate::error::{Result, SatelliteError};
use crate::merge::{self, Resolved};
use crate::oplog::OplogStore;
use crate::relation::RelationCache;

/// Notified after each applied transaction commits (spec's ambient
/// change-listener plumbing). Kept deliberately narrow: callers that want
/// richer payloads can look the transaction back up from `lsn`.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, namespace: &str, table: &str);
}

/// A `ChangeNotifier` that does nothing, for callers that don't need one.
pub struct NoopNotifier;
impl ChangeNotifier for NoopNotifier {
    fn notify(&self, _namespace: &str, _table: &str) {}
}

fn json_to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(serde_json::to_string(other).unwrap_or_default()),
    }
}

fn decode_lsn_rowid(lsn: &[u8]) -> Option<i64> {
    if lsn.len() != 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(lsn);
    Some(i64::from_be_bytes(buf))
}

pub struct Applier<'a> {
    conn: &'a Connection,
    cfg: &'a SatelliteConfig,
}

impl<'a> Applier<'a> {
    pub fn new(conn: &'a Connection, cfg: &'a SatelliteConfig) -> Self {
        Self { conn, cfg }
    }

    /// Apply one incoming transaction (spec §4.4 steps 1-8), atomically.
    pub fn apply_transaction(
        &self,
        tx: &Transaction,
        local_client_id: &str,
        last_ackd_rowid: i64,
        relations: &mut RelationCache,
        notifier: &dyn ChangeNotifier,
    ) -> Result<()> {
        let store = OplogStore::new(self.conn, self.cfg);
        let sqltx = self.conn.unchecked_transaction()?;

        self.conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

        let mut touched_tables: Vec<(String, String)> = Vec::new();
        for change in &tx.changes {
            if let Change::Data(d) = change {
                let pair = (d.schema.clone(), d.table.clone());
                if !touched_tables.contains(&pair) {
                    touched_tables.push(pair);
                }
            }
        }
        for (_, table) in &touched_tables {
            store.set_trigger_flag(table, false)?;
        }

        // Chunk consecutive same-kind changes so DML touching the same key
        // within one chunk folds together, without DDL in between reordering
        // semantics (spec: "DML/DDL chunk splitting").
        let mut i = 0;
        while i < tx.changes.len() {
            match &tx.changes[i] {
                Change::Data(_) => {
                    let start = i;
                    while i < tx.changes.len() && matches!(tx.changes[i], Change::Data(_)) {
                        i += 1;
                    }
                    let chunk: Vec<_> = tx.changes[start..i]
                        .iter()
                        .filter_map(|c| match c {
                            Change::Data(d) => Some(d.clone()),
                            _ => None,
                        })
                        .collect();
                    self.apply_dml_chunk(&store, tx, &chunk, local_client_id, last_ackd_rowid, relations, notifier)?;
                }
                Change::Schema(_) => {
                    let start = i;
                    while i < tx.changes.len() && matches!(tx.changes[i], Change::Schema(_)) {
                        i += 1;
                    }
                    let chunk: Vec<_> = tx.changes[start..i]
                        .iter()
                        .filter_map(|c| match c {
                            Change::Schema(s) => Some(s.clone()),
                            _ => None,
                        })
                        .collect();
                    for ddl in chunk {
                        self.conn.execute_batch(&ddl.sql)?;
                        if matches!(ddl.migration_type, MigrationType::Create | MigrationType::Alter) {
                            relations.rebuild_from_pragma(self.conn, &self.cfg.table_prefix)?;
                            if let Some(rel) = relations.get("main", &ddl.table).cloned() {
                                let columns: Vec<&str> = rel.columns.iter().map(|c| c.name.as_str()).collect();
                                let pks = rel.primary_key_columns();
                                store.install_triggers("main", &ddl.table, &columns, &pks)?;
                            }
                        }
                    }
                }
            }
        }

        for (_, table) in &touched_tables {
            store.set_trigger_flag(table, true)?;
        }

        let meta = crate::meta::MetaStore::new(self.conn, self.cfg);
        meta.set(crate::meta::KEY_LSN, &hex_encode(&tx.lsn))?;

        if tx.origin == local_client_id {
            if let Some(rowid) = decode_lsn_rowid(&tx.lsn) {
                self.conn.execute(
                    &format!("DELETE FROM main.{oplog} WHERE rowid <= ?1", oplog = self.cfg.oplog_table()),
                    rusqlite::params![rowid],
                )?;
            }
        }

        sqltx.commit()?;

        for (schema, table) in &touched_tables {
            notifier.notify(schema, table);
        }
        Ok(())
    }

    fn apply_dml_chunk(
        &self,
        store: &OplogStore,
        tx: &Transaction,
        chunk: &[crate::client::DataChange],
        local_client_id: &str,
        last_ackd_rowid: i64,
        relations: &RelationCache,
        _notifier: &dyn ChangeNotifier,
    ) -> Result<()> {
        let incoming_folds = merge::fold_incoming(tx, chunk, |schema, table, row| {
            pk_value_from_row(relations, schema, table, row)
        });

        for (key, incoming) in &incoming_folds {
            let local_entries = store.pending_entries_for_key(
                last_ackd_rowid,
                &key.namespace,
                &key.tablename,
                &key.primary_key,
            )?;
            let local_folds = merge::fold_local(&local_entries, local_client_id);
            let local = local_folds.get(key);

            match merge::resolve(local, Some(incoming)) {
                Resolved::Delete => {
                    self.delete_row(relations, &key.namespace, &key.tablename, &key.primary_key)?;
                    store.delete_shadow(&key.namespace, &key.tablename, &key.primary_key)?;
                }
                Resolved::Upsert { row, tags } => {
                    self.upsert_row(relations, &key.namespace, &key.tablename, &row)?;
                    store.upsert_shadow(&key.namespace, &key.tablename, &key.primary_key, &tags)?;
                }
            }
        }
        Ok(())
    }

    fn upsert_row(&self, relations: &RelationCache, schema: &str, table: &str, row: &Value) -> Result<()> {
        let relation = relations
            .get(schema, table)
            .ok_or_else(|| SatelliteError::Internal(format!("unknown relation {schema}.{table}")))?;
        let pk_cols = relation.primary_key_columns();
        if pk_cols.len() > 1 {
            return Err(SatelliteError::CompoundForeignKeyUnsupported(table.to_string()));
        }
        let columns = relation.column_names();
        let obj = row.as_object().ok_or_else(|| SatelliteError::Internal("row is not an object".to_string()))?;

        let col_list = columns.join(", ");
        let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("?{n}")).collect();
        let update_set: Vec<String> = columns
            .iter()
            .filter(|c| !pk_cols.contains(c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        let sql = if update_set.is_empty() {
            format!(
                "INSERT INTO main.{table}({cols}) VALUES ({ph}) ON CONFLICT({pk}) DO NOTHING",
                table = table,
                cols = col_list,
                ph = placeholders.join(", "),
                pk = pk_cols.join(", ")
            )
        } else {
            format!(
                "INSERT INTO main.{table}({cols}) VALUES ({ph}) ON CONFLICT({pk}) DO UPDATE SET {set}",
                table = table,
                cols = col_list,
                ph = placeholders.join(", "),
                pk = pk_cols.join(", "),
                set = update_set.join(", ")
            )
        };

        let values: Vec<SqlValue> = columns
            .iter()
            .map(|c| obj.get(*c).map(json_to_sql).unwrap_or(SqlValue::Null))
            .collect();
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        self.conn.execute(&sql, params.as_slice())?;
        Ok(())
    }

    fn delete_row(&self, relations: &RelationCache, schema: &str, table: &str, pk_json: &str) -> Result<()> {
        let relation = relations
            .get(schema, table)
            .ok_or_else(|| SatelliteError::Internal(format!("unknown relation {schema}.{table}")))?;
        let pk_cols = relation.primary_key_columns();
        let pk_value: Value = serde_json::from_str(pk_json)?;
        let obj = pk_value.as_object().ok_or_else(|| SatelliteError::Internal("primary key is not an object".to_string()))?;

        let where_clause: Vec<String> = pk_cols.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 1)).collect();
        let sql = format!("DELETE FROM main.{table} WHERE {}", where_clause.join(" AND "));
        let values: Vec<SqlValue> = pk_cols.iter().map(|c| obj.get(*c).map(json_to_sql).unwrap_or(SqlValue::Null)).collect();
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        self.conn.execute(&sql, params.as_slice())?;
        Ok(())
    }
}

fn pk_value_from_row(relations: &RelationCache, schema: &str, table: &str, row: &Value) -> Value {
    let Some(relation) = relations.get(schema, table) else {
        return row.clone();
    };
    let pk_cols = relation.primary_key_columns();
    let Some(obj) = row.as_object() else {
        return row.clone();
    };
    let mut out = serde_json::Map::new();
    for col in pk_cols {
        if let Some(v) = obj.get(col) {
            out.insert(col.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DataChange, RecordType};
    use crate::oplog::OplogStore;
    use crate::relation::{Column, Relation, TableType};
    use crate::tag::TagSet;

    fn setup() -> (Connection, SatelliteConfig, RelationCache) {
        let conn = Connection::open_in_memory().unwrap();
        let cfg = SatelliteConfig::default();
        let store = OplogStore::new(&conn, &cfg);
        store.init_schema().unwrap();
        crate::meta::MetaStore::new(&conn, &cfg).init_schema().unwrap();
        conn.execute_batch("CREATE TABLE main.parent(id INTEGER PRIMARY KEY, value TEXT);")
            .unwrap();
        store.install_triggers("main", "parent", &["id", "value"], &["id"]).unwrap();

        let mut relations = RelationCache::new();
        relations.patch(Relation {
            id: 1,
            schema: "main".to_string(),
            table: "parent".to_string(),
            table_type: TableType::Table,
            columns: vec![
                Column { name: "id".to_string(), sql_type: "INTEGER".to_string(), is_nullable: false, primary_key: true },
                Column { name: "value".to_string(), sql_type: "TEXT".to_string(), is_nullable: true, primary_key: false },
            ],
        });
        (conn, cfg, relations)
    }

    #[test]
    fn applies_remote_insert_with_no_local_conflict() {
        let (conn, cfg, mut relations) = setup();
        let applier = Applier::new(&conn, &cfg);

        let tx = Transaction {
            origin: "remote".to_string(),
            commit_timestamp_ms: 100,
            lsn: 1i64.to_be_bytes().to_vec(),
            changes: vec![Change::Data(DataChange {
                schema: "main".to_string(),
                table: "parent".to_string(),
                record_type: RecordType::Insert,
                new_record: Some(serde_json::json!({"id": 1, "value": "remote"})),
                old_record: None,
                tags: TagSet::new(),
            })],
        };

        applier.apply_transaction(&tx, "local-client", 0, &mut relations, &NoopNotifier).unwrap();

        let value: String = conn
            .query_row("SELECT value FROM main.parent WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, "remote");
    }

    #[test]
    fn remote_delete_removes_local_row() {
        let (conn, cfg, mut relations) = setup();
        conn.execute("INSERT INTO main.parent(id, value) VALUES (1, 'seed')", []).unwrap();
        // clear oplog noise from the seed write for this isolated test
        conn.execute_batch(&format!("DELETE FROM main.{}", cfg.oplog_table())).unwrap();

        let applier = Applier::new(&conn, &cfg);
        let tx = Transaction {
            origin: "remote".to_string(),
            commit_timestamp_ms: 200,
            lsn: 2i64.to_be_bytes().to_vec(),
            changes: vec![Change::Data(DataChange {
                schema: "main".to_string(),
                table: "parent".to_string(),
                record_type: RecordType::Delete,
                new_record: None,
                old_record: Some(serde_json::json!({"id": 1, "value": "seed"})),
                tags: TagSet::new(),
            })],
        };
        applier.apply_transaction(&tx, "local-client", 0, &mut relations, &NoopNotifier).unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM main.parent WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn applying_own_origin_transaction_garbage_collects_local_oplog() {
        let (conn, cfg, mut relations) = setup();
        conn.execute("INSERT INTO main.parent(id, value) VALUES (1, 'local')", []).unwrap();
        let store = OplogStore::new(&conn, &cfg);
        assert_eq!(store.entries_since(0).unwrap().len(), 1);

        let applier = Applier::new(&conn, &cfg);
        let rowid = store.max_rowid().unwrap();
        let tx = Transaction {
            origin: "local-client".to_string(),
            commit_timestamp_ms: 300,
            lsn: rowid.to_be_bytes().to_vec(),
            changes: vec![],
        };
        applier.apply_transaction(&tx, "local-client", 0, &mut relations, &NoopNotifier).unwrap();
        assert!(store.entries_since(0).unwrap().is_empty(), "own round-tripped tx must GC local oplog");
    }
}
