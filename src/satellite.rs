//! Top-level entry point (spec §1, §4.7). Wires the database adapter
//! (`rusqlite::Connection`), the oplog/shadow store, the relation cache, the
//! Merger/Applier, the Subscription Manager and a Replication Client behind
//! one Lifecycle Controller, the way the teacher crate's `SyncEngine`
//! (`examples/Dominik7787-Sync-Engine-Client-Side/src/lib.rs`) wires its
//! connection and sync client together.

use std::sync::Arc;

use rusqlite::Connection;

use crate::client::{ReplicationClient, ShapeDefinition};
use crate::config::{AuthConfig, SatelliteConfig};
use crate::error::Result;
use crate::lifecycle::{ConnectivityState, LifecycleController};
use crate::wire::TcpReplicationClient;

/// A single local database's replication session. One `Satellite` owns one
/// SQLite connection; multiple tabs/processes sharing a database are out of
/// scope (spec §1 Non-goals).
pub struct Satellite {
    lifecycle: LifecycleController,
}

impl Satellite {
    /// Open a Satellite instance that replicates over `cfg.url` via TCP.
    pub fn open(cfg: SatelliteConfig, conn: Connection, local_client_id: impl Into<String>) -> Self {
        let client: Arc<dyn ReplicationClient> = Arc::new(TcpReplicationClient::new(cfg.url.clone()));
        Self::with_client(cfg, conn, client, local_client_id)
    }

    /// Open a Satellite instance against a caller-supplied `ReplicationClient`
    /// (tests, or a transport other than the bundled TCP/JSON one).
    pub fn with_client(
        cfg: SatelliteConfig,
        conn: Connection,
        client: Arc<dyn ReplicationClient>,
        local_client_id: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle: LifecycleController::new(cfg, conn, client, local_client_id.into()),
        }
    }

    /// Run the start sequence (spec §4.7): ensure schema, connect,
    /// authenticate, start replication, and begin the snapshot/polling loop.
    pub async fn start(&self, auth: AuthConfig) -> Result<()> {
        self.lifecycle.start(auth).await
    }

    /// Stop the event loop and close the replication connection.
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.stop().await
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.lifecycle.connectivity_state()
    }

    /// Wake the snapshot loop immediately instead of waiting for the next
    /// polling tick. Database adapters that know when a local write just
    /// landed should call this after the write commits (spec §5).
    pub fn notify_write(&self) {
        self.lifecycle.notify_write()
    }

    /// Request a whole-table shape subscription (spec §4.5).
    pub async fn subscribe(
        &self,
        shapes: Vec<ShapeDefinition>,
    ) -> Result<tokio::sync::oneshot::Receiver<std::result::Result<(), String>>> {
        self.lifecycle.subscribe(shapes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        OutboundLogPositions, ReplicationCallbacks, ShapeRequest, StartReplicationOutcome, Transaction,
    };
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl ReplicationClient for NullClient {
        async fn connect(&self, _callbacks: Arc<dyn ReplicationCallbacks>) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn is_closed(&self) -> bool {
            true
        }
        async fn authenticate(&self, _token: &str) -> Result<()> {
            Ok(())
        }
        async fn start_replication(
            &self,
            _lsn: Option<Vec<u8>>,
            _schema_version: &str,
            _resume_subscriptions: Option<Vec<String>>,
        ) -> Result<StartReplicationOutcome> {
            Ok(StartReplicationOutcome { error: None })
        }
        async fn reset_outbound_log_positions(&self, _ack_bytes: i64, _sent_bytes: i64) -> Result<()> {
            Ok(())
        }
        async fn enqueue_transaction(&self, _tx: Transaction) -> Result<()> {
            Ok(())
        }
        async fn get_outbound_log_positions(&self) -> OutboundLogPositions {
            Default::default()
        }
        async fn subscribe(&self, _sub_id: String, _shape_requests: Vec<ShapeRequest>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_stop_round_trips_connectivity_state() {
        let conn = Connection::open_in_memory().unwrap();
        let satellite = Satellite::with_client(SatelliteConfig::default(), conn, Arc::new(NullClient), "client-a");

        satellite.start(AuthConfig { token: "t".to_string(), client_id: None }).await.unwrap();
        assert_eq!(satellite.connectivity_state(), ConnectivityState::Connected);

        satellite.stop().await.unwrap();
        assert_eq!(satellite.connectivity_state(), ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn subscribe_dedupes_across_repeated_calls() {
        let conn = Connection::open_in_memory().unwrap();
        let satellite = Satellite::with_client(SatelliteConfig::default(), conn, Arc::new(NullClient), "client-a");
        satellite.start(AuthConfig { token: "t".to_string(), client_id: None }).await.unwrap();

        let shapes = vec![ShapeDefinition { schema: "main".to_string(), table: "widgets".to_string() }];
        let first = satellite.subscribe(shapes.clone()).await.unwrap();
        let second = satellite.subscribe(shapes).await.unwrap();
        assert_eq!(second.await.unwrap(), Ok(()));
        drop(first);
    }
}
