use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Auth configuration passed into `start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Console (token service) endpoint, used by external auth glue — the core
/// only threads it through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
}

fn default_polling_interval_ms() -> u64 {
    2_000
}

fn default_min_snapshot_window_ms() -> u64 {
    40
}

fn default_clear_on_behind_window() -> bool {
    true
}

fn default_table_prefix() -> String {
    "_electric".to_string()
}

/// Recognized Satellite configuration keys (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub url: String,

    #[serde(default)]
    pub console: Option<ConsoleConfig>,

    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    #[serde(default = "default_min_snapshot_window_ms")]
    pub min_snapshot_window_ms: u64,

    #[serde(default = "default_clear_on_behind_window")]
    pub clear_on_behind_window: bool,

    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

impl SatelliteConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn min_snapshot_window(&self) -> Duration {
        Duration::from_millis(self.min_snapshot_window_ms)
    }

    pub fn meta_table(&self) -> String {
        format!("{}_meta", self.table_prefix)
    }

    pub fn oplog_table(&self) -> String {
        format!("{}_oplog", self.table_prefix)
    }

    pub fn shadow_table(&self) -> String {
        format!("{}_shadow", self.table_prefix)
    }

    pub fn migrations_table(&self) -> String {
        format!("{}_migrations", self.table_prefix)
    }

    pub fn triggers_table(&self) -> String {
        format!("{}_triggers", self.table_prefix)
    }
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            console: None,
            polling_interval_ms: default_polling_interval_ms(),
            min_snapshot_window_ms: default_min_snapshot_window_ms(),
            clear_on_behind_window: default_clear_on_behind_window(),
            table_prefix: default_table_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SatelliteConfig::default();
        assert_eq!(cfg.polling_interval_ms, 2_000);
        assert_eq!(cfg.min_snapshot_window_ms, 40);
        assert!(cfg.clear_on_behind_window);
        assert_eq!(cfg.meta_table(), "_electric_meta");
        assert_eq!(cfg.oplog_table(), "_electric_oplog");
        assert_eq!(cfg.shadow_table(), "_electric_shadow");
    }
}
