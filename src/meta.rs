//! `_electric_meta` key/value store (spec §3, §6): `lsn`, `lastAckdRowId`,
//! `lastSentRowId`, `clientId`, `subscriptions`.

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::SatelliteConfig;
use crate::error::Result;

pub const KEY_CLIENT_ID: &str = "clientId";
pub const KEY_LSN: &str = "lsn";
pub const KEY_LAST_ACKD_ROW_ID: &str = "lastAckdRowId";
pub const KEY_LAST_SENT_ROW_ID: &str = "lastSentRowId";
pub const KEY_SUBSCRIPTIONS: &str = "subscriptions";
pub const KEY_LAST_MIGRATION: &str = "lastMigration";

pub struct MetaStore<'a> {
    conn: &'a Connection,
    cfg: &'a SatelliteConfig,
}

impl<'a> MetaStore<'a> {
    pub fn new(conn: &'a Connection, cfg: &'a SatelliteConfig) -> Self {
        Self { conn, cfg }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS main.{meta} (key TEXT PRIMARY KEY, value TEXT);",
            meta = self.cfg.meta_table()
        ))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let v = self
            .conn
            .query_row(
                &format!("SELECT value FROM main.{meta} WHERE key = ?1", meta = self.cfg.meta_table()),
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO main.{meta}(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                meta = self.cfg.meta_table()
            ),
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM main.{meta} WHERE key = ?1", meta = self.cfg.meta_table()),
            params![key],
        )?;
        Ok(())
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        Ok(self.get(key)?.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0))
    }

    pub fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, &value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_delete_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        let cfg = SatelliteConfig::default();
        let meta = MetaStore::new(&conn, &cfg);
        meta.init_schema().unwrap();

        assert_eq!(meta.get(KEY_CLIENT_ID).unwrap(), None);
        meta.set(KEY_CLIENT_ID, "abc-123").unwrap();
        assert_eq!(meta.get(KEY_CLIENT_ID).unwrap(), Some("abc-123".to_string()));

        meta.set_i64(KEY_LAST_ACKD_ROW_ID, 42).unwrap();
        assert_eq!(meta.get_i64(KEY_LAST_ACKD_ROW_ID).unwrap(), 42);

        meta.delete(KEY_CLIENT_ID).unwrap();
        assert_eq!(meta.get(KEY_CLIENT_ID).unwrap(), None);
    }
}
