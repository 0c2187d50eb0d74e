//! Relation cache (spec §3, §4.7 step 5): `(id, schema, table, tableType,
//! columns)`, rebuilt from `pragma_table_info` on startup and patched by
//! inbound relation messages.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub is_nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub schema: String,
    pub table: String,
    pub table_type: TableType,
    pub columns: Vec<Column>,
}

impl Relation {
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// In-memory cache of all known relations, keyed by `(schema, table)`.
/// Global and process-wide per Satellite instance (spec §9).
#[derive(Debug, Default)]
pub struct RelationCache {
    by_name: HashMap<(String, String), Relation>,
    next_id: i64,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from `pragma_table_info` for every user table in `main`
    /// (spec §4.7 step 5). Electric's own tables (the configured prefix)
    /// are excluded.
    pub fn rebuild_from_pragma(&mut self, conn: &Connection, exclude_prefix: &str) -> Result<()> {
        self.by_name.clear();

        let mut table_stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE ?1 || '%'",
        )?;
        let table_names: Vec<String> = table_stmt
            .query_map([exclude_prefix], |r| r.get(0))?
            .filter_map(std::result::Result::ok)
            .collect();

        for table in table_names {
            let mut col_stmt = conn.prepare(&format!("PRAGMA table_info('{table}')"))?;
            let columns: Vec<Column> = col_stmt
                .query_map([], |r| {
                    let name: String = r.get(1)?;
                    let sql_type: String = r.get(2)?;
                    let notnull: i64 = r.get(3)?;
                    let pk: i64 = r.get(5)?;
                    Ok(Column {
                        name,
                        sql_type,
                        is_nullable: notnull == 0,
                        primary_key: pk > 0,
                    })
                })?
                .filter_map(std::result::Result::ok)
                .collect();

            if columns.is_empty() {
                continue;
            }

            self.next_id += 1;
            self.by_name.insert(
                ("main".to_string(), table.clone()),
                Relation {
                    id: self.next_id,
                    schema: "main".to_string(),
                    table,
                    table_type: TableType::Table,
                    columns,
                },
            );
        }
        Ok(())
    }

    /// Patch (insert or replace) a relation from an inbound `Relation`
    /// message.
    pub fn patch(&mut self, relation: Relation) {
        self.by_name
            .insert((relation.schema.clone(), relation.table.clone()), relation);
    }

    pub fn get(&self, schema: &str, table: &str) -> Option<&Relation> {
        self.by_name.get(&(schema.to_string(), table.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Relation> {
        self.by_name.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_skips_electric_tables_and_picks_up_pk() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE parent(id INTEGER PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE _electric_meta(key TEXT PRIMARY KEY, value TEXT);",
        )
        .unwrap();

        let mut cache = RelationCache::new();
        cache.rebuild_from_pragma(&conn, "_electric").unwrap();

        assert!(cache.get("main", "_electric_meta").is_none());
        let rel = cache.get("main", "parent").unwrap();
        assert_eq!(rel.primary_key_columns(), vec!["id"]);
        assert_eq!(rel.column_names(), vec!["id", "value"]);
    }

    #[test]
    fn patch_overwrites_cached_relation() {
        let mut cache = RelationCache::new();
        cache.patch(Relation {
            id: 1,
            schema: "main".to_string(),
            table: "parent".to_string(),
            table_type: TableType::Table,
            columns: vec![],
        });
        cache.patch(Relation {
            id: 1,
            schema: "main".to_string(),
            table: "parent".to_string(),
            table_type: TableType::Table,
            columns: vec![Column {
                name: "id".to_string(),
                sql_type: "INTEGER".to_string(),
                is_nullable: false,
                primary_key: true,
            }],
        });
        assert_eq!(cache.get("main", "parent").unwrap().columns.len(), 1);
    }
}
