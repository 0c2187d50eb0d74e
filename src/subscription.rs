//! Subscription Manager (spec §4.5, component F).
//!
//! Whole-table "shape" subscriptions only (spec §1 Non-goals rule out
//! partial/where-clause shapes). Dedupes by exact shape definition, tracks
//! one completion future per subscription id, and bulk-inserts delivered
//! rows in batches sized to stay under SQLite's bound-parameter limit.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use rusqlite::{types::Value as SqlValue, Connection};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::client::{ShapeDefinition, ShapeRequest, SubscriptionData, SubscriptionDataRow};
use crate::config::SatelliteConfig;
use crate::error::{Result, SatelliteError};
use crate::meta::{self, MetaStore};
use crate::oplog::OplogStore;
use crate::relation::RelationCache;

/// Pre-3.32 SQLite caps bound parameters at 999; 3.32+ raises it to 32766
/// (spec §4.5, §9).
pub fn max_sql_parameters() -> usize {
    if rusqlite::version_number() >= 3_032_000 {
        32_766
    } else {
        999
    }
}

#[derive(Debug)]
pub struct SubscribeOutcome {
    pub subscription_id: String,
    /// `None` when this exact shape set was already subscribed; the caller
    /// should not re-send a request to the server.
    pub new_request: Option<(Vec<ShapeRequest>, oneshot::Receiver<std::result::Result<(), String>>)>,
}

#[derive(Default)]
struct State {
    by_definition: HashMap<Vec<ShapeDefinition>, String>,
    shapes: HashMap<String, Vec<ShapeDefinition>>,
    completers: HashMap<String, oneshot::Sender<std::result::Result<(), String>>>,
}

pub struct SubscriptionManager {
    state: StdMutex<State>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self { state: StdMutex::new(State::default()) }
    }

    /// Request a subscription for a set of whole-table shapes (spec §4.5).
    /// Returns the existing subscription id with no new request if this
    /// exact definition set is already subscribed.
    pub fn subscribe(&self, definitions: Vec<ShapeDefinition>) -> SubscribeOutcome {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.by_definition.get(&definitions) {
            return SubscribeOutcome { subscription_id: existing.clone(), new_request: None };
        }

        let subscription_id = Uuid::new_v4().to_string();
        let shape_requests: Vec<ShapeRequest> = definitions
            .iter()
            .map(|d| ShapeRequest { request_id: Uuid::new_v4().to_string(), definition: d.clone() })
            .collect();

        let (tx, rx) = oneshot::channel();
        state.completers.insert(subscription_id.clone(), tx);
        state.shapes.insert(subscription_id.clone(), definitions.clone());
        state.by_definition.insert(definitions, subscription_id.clone());

        SubscribeOutcome { subscription_id, new_request: Some((shape_requests, rx)) }
    }

    /// Apply delivered subscription rows (spec §4.5): bulk-insert in batches
    /// bounded by `max_sql_parameters`, update shadow tags per row, then
    /// atomically record `(subscriptions, lsn)` in `_electric_meta`.
    pub fn apply_data(
        &self,
        conn: &Connection,
        cfg: &SatelliteConfig,
        relations: &RelationCache,
        data: SubscriptionData,
    ) -> Result<()> {
        let store = OplogStore::new(conn, cfg);
        let sqltx = conn.unchecked_transaction()?;

        let mut by_table: HashMap<(String, String), Vec<SubscriptionDataRow>> = HashMap::new();
        for row in data.rows {
            by_table.entry((row.schema.clone(), row.table.clone())).or_default().push(row);
        }

        for ((schema, table), rows) in &by_table {
            store.set_trigger_flag(table, false)?;
            self.bulk_insert(conn, relations, schema, table, rows)?;
            for row in rows {
                let relation = relations
                    .get(schema, table)
                    .ok_or_else(|| SatelliteError::Internal(format!("unknown relation {schema}.{table}")))?;
                let pk_cols = relation.primary_key_columns();
                let obj = row.record.as_object().ok_or_else(|| SatelliteError::Internal("row is not an object".to_string()))?;
                let mut pk = serde_json::Map::new();
                for col in pk_cols {
                    if let Some(v) = obj.get(col) {
                        pk.insert(col.to_string(), v.clone());
                    }
                }
                let pk_str = serde_json::to_string(&serde_json::Value::Object(pk))?;
                store.upsert_shadow(schema, table, &pk_str, &row.tags)?;
            }
            store.set_trigger_flag(table, true)?;
        }

        let meta = MetaStore::new(conn, cfg);
        meta.set(meta::KEY_LSN, &hex_encode(&data.lsn))?;
        let mut subs = load_subscriptions(&meta)?;
        if !subs.contains(&data.subscription_id) {
            subs.push(data.subscription_id.clone());
        }
        save_subscriptions(&meta, &subs)?;

        sqltx.commit()?;

        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.completers.remove(&data.subscription_id) {
            let _ = tx.send(Ok(()));
        }
        Ok(())
    }

    fn bulk_insert(
        &self,
        conn: &Connection,
        relations: &RelationCache,
        schema: &str,
        table: &str,
        rows: &[SubscriptionDataRow],
    ) -> Result<()> {
        let relation = relations
            .get(schema, table)
            .ok_or_else(|| SatelliteError::Internal(format!("unknown relation {schema}.{table}")))?;
        let columns = relation.column_names();
        if columns.is_empty() || rows.is_empty() {
            return Ok(());
        }

        let max_params = max_sql_parameters();
        let rows_per_batch = (max_params / columns.len()).max(1);

        for batch in rows.chunks(rows_per_batch) {
            let mut placeholders = Vec::with_capacity(batch.len());
            let mut values: Vec<SqlValue> = Vec::with_capacity(batch.len() * columns.len());
            let mut param_n = 1;
            for row in batch {
                let obj = row.record.as_object().ok_or_else(|| SatelliteError::Internal("row is not an object".to_string()))?;
                let ph: Vec<String> = (0..columns.len()).map(|_| { let p = format!("?{param_n}"); param_n += 1; p }).collect();
                placeholders.push(format!("({})", ph.join(", ")));
                for col in &columns {
                    values.push(obj.get(*col).map(json_to_sql).unwrap_or(SqlValue::Null));
                }
            }

            let pk_cols = relation.primary_key_columns();
            let update_set: Vec<String> = columns
                .iter()
                .filter(|c| !pk_cols.contains(c))
                .map(|c| format!("{c} = excluded.{c}"))
                .collect();
            let conflict_clause = if update_set.is_empty() {
                format!("ON CONFLICT({}) DO NOTHING", pk_cols.join(", "))
            } else {
                format!("ON CONFLICT({}) DO UPDATE SET {}", pk_cols.join(", "), update_set.join(", "))
            };

            let sql = format!(
                "INSERT INTO main.{table}({cols}) VALUES {values} {conflict}",
                table = table,
                cols = columns.join(", "),
                values = placeholders.join(", "),
                conflict = conflict_clause,
            );
            let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params.as_slice())?;
        }
        Ok(())
    }

    /// Every currently-tracked shape definition set, keyed by nothing in
    /// particular — used by behind-window recovery to re-subscribe after a
    /// `_resetClientState` (spec §4.7, §9).
    pub fn subscribed_definitions(&self) -> Vec<Vec<ShapeDefinition>> {
        self.state.lock().unwrap().shapes.values().cloned().collect()
    }

    /// `_resetClientState()` (spec §7): clear `lsn`, drop all subscriptions
    /// from memory and meta, and reject every pending completer. Also
    /// garbage-collects the now-unsubscribed shapes' table and shadow rows
    /// (spec §4.5's per-shape GC), rather than leaving them orphaned with no
    /// subscription to ever reconcile them against.
    pub fn reset_client_state(&self, conn: &Connection, cfg: &SatelliteConfig, error: &str) -> Result<()> {
        let store = OplogStore::new(conn, cfg);
        let mut state = self.state.lock().unwrap();

        for (_, definitions) in state.shapes.drain() {
            for def in definitions {
                store.set_trigger_flag(&def.table, false)?;
                conn.execute(&format!("DELETE FROM main.{}", def.table), [])?;
                store.set_trigger_flag(&def.table, true)?;
                store.delete_shadow_for_table(&def.schema, &def.table)?;
            }
        }
        state.by_definition.clear();
        for (_, tx) in state.completers.drain() {
            let _ = tx.send(Err(error.to_string()));
        }

        let meta = MetaStore::new(conn, cfg);
        meta.delete(meta::KEY_SUBSCRIPTIONS)?;
        meta.delete(meta::KEY_LSN)?;
        Ok(())
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn load_subscriptions(meta: &MetaStore) -> Result<Vec<String>> {
    match meta.get(meta::KEY_SUBSCRIPTIONS)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

fn save_subscriptions(meta: &MetaStore, subs: &[String]) -> Result<()> {
    meta.set(meta::KEY_SUBSCRIPTIONS, &serde_json::to_string(subs)?)
}

fn json_to_sql(v: &serde_json::Value) -> SqlValue {
    match v {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(serde_json::to_string(other).unwrap_or_default()),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OplogStore;
    use crate::relation::{Column, Relation, TableType};
    use crate::tag::{Tag, TagSet};

    fn setup() -> (Connection, SatelliteConfig, RelationCache) {
        let conn = Connection::open_in_memory().unwrap();
        let cfg = SatelliteConfig::default();
        let store = OplogStore::new(&conn, &cfg);
        store.init_schema().unwrap();
        MetaStore::new(&conn, &cfg).init_schema().unwrap();
        conn.execute_batch("CREATE TABLE main.widgets(id INTEGER PRIMARY KEY, name TEXT);").unwrap();
        store.install_triggers("main", "widgets", &["id", "name"], &["id"]).unwrap();

        let mut relations = RelationCache::new();
        relations.patch(Relation {
            id: 1,
            schema: "main".to_string(),
            table: "widgets".to_string(),
            table_type: TableType::Table,
            columns: vec![
                Column { name: "id".to_string(), sql_type: "INTEGER".to_string(), is_nullable: false, primary_key: true },
                Column { name: "name".to_string(), sql_type: "TEXT".to_string(), is_nullable: true, primary_key: false },
            ],
        });
        (conn, cfg, relations)
    }

    #[test]
    fn subscribe_dedupes_identical_shape_sets() {
        let mgr = SubscriptionManager::new();
        let shapes = vec![ShapeDefinition { schema: "main".to_string(), table: "widgets".to_string() }];
        let first = mgr.subscribe(shapes.clone());
        assert!(first.new_request.is_some());

        let second = mgr.subscribe(shapes);
        assert_eq!(second.subscription_id, first.subscription_id);
        assert!(second.new_request.is_none());
    }

    #[test]
    fn apply_data_inserts_rows_and_records_subscription() {
        let (conn, cfg, relations) = setup();
        let mgr = SubscriptionManager::new();
        let shapes = vec![ShapeDefinition { schema: "main".to_string(), table: "widgets".to_string() }];
        let outcome = mgr.subscribe(shapes);
        let (_, mut rx) = outcome.new_request.unwrap();

        let tags = TagSet::single(Tag::generate("server", chrono::DateTime::from_timestamp_millis(1).unwrap()));
        let data = SubscriptionData {
            subscription_id: outcome.subscription_id.clone(),
            lsn: vec![1, 2, 3],
            rows: vec![SubscriptionDataRow {
                schema: "main".to_string(),
                table: "widgets".to_string(),
                record: serde_json::json!({"id": 1, "name": "gadget"}),
                tags,
            }],
        };
        mgr.apply_data(&conn, &cfg, &relations, data).unwrap();

        let name: String = conn.query_row("SELECT name FROM main.widgets WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "gadget");

        let meta = MetaStore::new(&conn, &cfg);
        let subs: Vec<String> = serde_json::from_str(&meta.get(meta::KEY_SUBSCRIPTIONS).unwrap().unwrap()).unwrap();
        assert_eq!(subs, vec![outcome.subscription_id]);

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn reset_client_state_clears_table_and_rejects_pending() {
        let (conn, cfg, _relations) = setup();
        let store = OplogStore::new(&conn, &cfg);
        conn.execute("INSERT INTO main.widgets(id, name) VALUES (1, 'gadget')", []).unwrap();

        let mgr = SubscriptionManager::new();
        let shapes = vec![ShapeDefinition { schema: "main".to_string(), table: "widgets".to_string() }];
        let outcome = mgr.subscribe(shapes);
        let (_, mut rx) = outcome.new_request.unwrap();

        mgr.reset_client_state(&conn, &cfg, "subscription failed").unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM main.widgets", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        assert_eq!(store.shadow_row_count("main", "widgets").unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), Err("subscription failed".to_string()));
    }
}
