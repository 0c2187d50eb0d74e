//! Lifecycle Controller (spec §4.7, §5, component H).
//!
//! Drives the single-threaded cooperative event loop: a connectivity state
//! machine, a snapshot timer, an immediate-snapshot channel fed by local
//! writes, and the `start()`/`stop()` sequence. Grounded on the
//! `tokio::select!` + `mpsc` + `watch` + `interval` loop pattern in
//! `other_examples/146c3bdf_Mooncake-Labs-moonlink__src-moonlink-src-table_handler.rs.rs`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};

use crate::applier::{Applier, NoopNotifier};
use crate::client::{AckKind, ReplicationCallbacks, ReplicationClient, ReplicationErrorCode, Transaction};
use crate::config::{AuthConfig, SatelliteConfig};
use crate::error::{Result, SatelliteError};
use crate::meta::{self, MetaStore};
use crate::oplog::OplogStore;
use crate::relation::{Relation, RelationCache};
use crate::snapshot::{outbound_transactions_since, SnapshotScheduler, Snapshotter};
use crate::subscription::SubscriptionManager;

pub use crate::client::ShapeDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityState {
    Available,
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

struct Shared {
    cfg: SatelliteConfig,
    conn: AsyncMutex<Connection>,
    relations: StdMutex<RelationCache>,
    subscriptions: SubscriptionManager,
    local_client_id: String,
    last_ackd_rowid: AtomicI64,
    last_sent_rowid: AtomicI64,
}

struct Callbacks {
    shared: Arc<Shared>,
    state: watch::Sender<ConnectivityState>,
}

#[async_trait]
impl ReplicationCallbacks for Callbacks {
    async fn on_relation(&self, relation: Relation) {
        self.shared.relations.lock().unwrap().patch(relation);
    }

    async fn on_transaction(&self, tx: Transaction) {
        let conn = self.shared.conn.lock().await;

        // Snapshot any still-pending local writes first (spec §4.4 step 3),
        // so they carry a real timestamp before merge::fold_local folds them
        // against this incoming transaction — an un-timestamped local row
        // would otherwise always lose tag-set arithmetic against the remote
        // write.
        let since = self.shared.last_sent_rowid.load(Ordering::SeqCst);
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        if let Err(e) = Snapshotter::new(&conn, &self.shared.cfg).take_snapshot(since, timestamp_ms, &self.shared.local_client_id) {
            tracing::warn!(error = %e, "failed to snapshot pending local writes before applying incoming transaction");
        }

        let mut relations = self.shared.relations.lock().unwrap();
        let last_ackd = self.shared.last_ackd_rowid.load(Ordering::SeqCst);
        let applier = Applier::new(&conn, &self.shared.cfg);
        if let Err(e) = applier.apply_transaction(&tx, &self.shared.local_client_id, last_ackd, &mut relations, &NoopNotifier) {
            tracing::warn!(error = %e, "failed to apply incoming transaction");
        }
    }

    async fn on_ack(&self, lsn: Vec<u8>, kind: AckKind) {
        if kind != AckKind::RemoteCommit {
            return;
        }
        if lsn.len() == 8 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&lsn);
            self.shared.last_ackd_rowid.store(i64::from_be_bytes(buf), Ordering::SeqCst);
        }
    }

    async fn on_outbound_start(&self) {
        let _ = self.state.send(ConnectivityState::Connected);
    }

    async fn on_subscription_data(&self, data: crate::client::SubscriptionData) {
        let conn = self.shared.conn.lock().await;
        let relations = self.shared.relations.lock().unwrap();
        if let Err(e) = self.shared.subscriptions.apply_data(&conn, &self.shared.cfg, &relations, data) {
            tracing::warn!(error = %e, "failed to apply subscription data");
        }
    }

    async fn on_subscription_error(&self, subscription_id: Option<String>, error: String) {
        tracing::warn!(subscription_id = ?subscription_id, %error, "subscription error; resetting client state");
        let conn = self.shared.conn.lock().await;
        if let Err(e) = self.shared.subscriptions.reset_client_state(&conn, &self.shared.cfg, &error) {
            tracing::warn!(error = %e, "failed to reset client state");
        }
        let _ = self.state.send(ConnectivityState::Error(error));
    }
}

/// Orchestrates one Satellite instance's connectivity and snapshot loop.
pub struct LifecycleController {
    shared: Arc<Shared>,
    client: Arc<dyn ReplicationClient>,
    snapshot_scheduler: Arc<SnapshotScheduler>,
    state_tx: watch::Sender<ConnectivityState>,
    state_rx: watch::Receiver<ConnectivityState>,
    snapshot_kick: mpsc::Sender<()>,
    snapshot_kick_rx: AsyncMutex<Option<mpsc::Receiver<()>>>,
    shutdown: Arc<Notify>,
}

impl LifecycleController {
    pub fn new(cfg: SatelliteConfig, conn: Connection, client: Arc<dyn ReplicationClient>, local_client_id: String) -> Self {
        let shared = Arc::new(Shared {
            conn: AsyncMutex::new(conn),
            relations: StdMutex::new(RelationCache::new()),
            subscriptions: SubscriptionManager::new(),
            local_client_id,
            last_ackd_rowid: AtomicI64::new(0),
            last_sent_rowid: AtomicI64::new(0),
            cfg,
        });
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Available);
        let (snapshot_kick, snapshot_kick_rx) = mpsc::channel(64);
        let min_window = shared.cfg.min_snapshot_window();
        Self {
            shared,
            client,
            snapshot_scheduler: Arc::new(SnapshotScheduler::new(min_window)),
            state_tx,
            state_rx,
            snapshot_kick,
            snapshot_kick_rx: AsyncMutex::new(Some(snapshot_kick_rx)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.state_rx.borrow().clone()
    }

    /// Ask the event loop to attempt a snapshot as soon as possible, instead
    /// of waiting for the next polling tick (spec §5).
    pub fn notify_write(&self) {
        let _ = self.snapshot_kick.try_send(());
    }

    /// The eight-step start sequence (spec §4.7): ensure schema, rebuild the
    /// relation cache, connect, authenticate, reset the outbound log
    /// position counters, read replication position from meta, start
    /// replication, spawn the event loop, mark connected.
    pub async fn start(&self, auth: AuthConfig) -> Result<()> {
        let _ = self.state_tx.send(ConnectivityState::Connecting);

        {
            let conn = self.shared.conn.lock().await;
            OplogStore::new(&conn, &self.shared.cfg).init_schema()?;
            MetaStore::new(&conn, &self.shared.cfg).init_schema()?;
            self.shared
                .relations
                .lock()
                .unwrap()
                .rebuild_from_pragma(&conn, &self.shared.cfg.table_prefix)?;

            let meta = MetaStore::new(&conn, &self.shared.cfg);
            self.shared.last_ackd_rowid.store(meta.get_i64(meta::KEY_LAST_ACKD_ROW_ID)?, Ordering::SeqCst);
            self.shared.last_sent_rowid.store(meta.get_i64(meta::KEY_LAST_SENT_ROW_ID)?, Ordering::SeqCst);
        }

        let callbacks = Arc::new(Callbacks { shared: self.shared.clone(), state: self.state_tx.clone() });
        self.client.connect(callbacks).await?;
        self.client.authenticate(&auth.token).await?;
        self.client
            .reset_outbound_log_positions(
                self.shared.last_ackd_rowid.load(Ordering::SeqCst),
                self.shared.last_sent_rowid.load(Ordering::SeqCst),
            )
            .await?;

        let lsn = {
            let conn = self.shared.conn.lock().await;
            let raw = MetaStore::new(&conn, &self.shared.cfg).get(meta::KEY_LSN)?;
            raw.map(hex_decode).transpose()?
        };
        let subs = {
            let conn = self.shared.conn.lock().await;
            let raw = MetaStore::new(&conn, &self.shared.cfg).get(meta::KEY_SUBSCRIPTIONS)?;
            match raw {
                Some(s) => Some(serde_json::from_str::<Vec<String>>(&s)?),
                None => None,
            }
        };

        let outcome = self
            .client
            .start_replication(lsn, env!("CARGO_PKG_VERSION"), subs)
            .await?;
        if let Some(code) = outcome.error {
            if code == ReplicationErrorCode::BehindWindow && self.shared.cfg.clear_on_behind_window {
                tracing::warn!("replication behind window; resetting client state and re-subscribing");
                self.recover_from_behind_window(&auth).await?;
            } else {
                let err = replication_error(code);
                if err.is_start_replication_fatal() {
                    let _ = self.state_tx.send(ConnectivityState::Error(err.to_string()));
                    return Err(err);
                }
                tracing::warn!(error = %err, "start_replication returned a non-fatal error; continuing");
            }
        }

        let loop_shared = self.shared.clone();
        let loop_client = self.client.clone();
        let loop_scheduler = self.snapshot_scheduler.clone();
        let shutdown = self.shutdown.clone();
        let polling_interval = self.shared.cfg.polling_interval();
        let mut kick_rx = self.snapshot_kick_rx.lock().await.take().ok_or_else(|| {
            SatelliteError::Internal("lifecycle controller already started".to_string())
        })?;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(polling_interval);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        run_snapshot_cycle(&loop_shared, &loop_client, &loop_scheduler).await;
                    }
                    Some(()) = kick_rx.recv() => {
                        run_snapshot_cycle(&loop_shared, &loop_client, &loop_scheduler).await;
                    }
                }
            }
        });

        let _ = self.state_tx.send(ConnectivityState::Connected);
        Ok(())
    }

    /// `behindWindow` recovery (spec §4.7, §7, §9): `_resetClientState()`,
    /// reconnect, `startReplication` fresh (no `lsn`, no resume list), then
    /// fire-and-forget re-subscribe to every shape that was fulfilled before
    /// the reset. A second error from the fresh `startReplication` is fatal —
    /// there is no recovery from a recovery.
    async fn recover_from_behind_window(&self, auth: &AuthConfig) -> Result<()> {
        let definitions = self.shared.subscriptions.subscribed_definitions();
        {
            let conn = self.shared.conn.lock().await;
            self.shared
                .subscriptions
                .reset_client_state(&conn, &self.shared.cfg, "behind replication window")?;
        }

        self.client.close().await?;
        let callbacks = Arc::new(Callbacks { shared: self.shared.clone(), state: self.state_tx.clone() });
        self.client.connect(callbacks).await?;
        self.client.authenticate(&auth.token).await?;
        self.client
            .reset_outbound_log_positions(
                self.shared.last_ackd_rowid.load(Ordering::SeqCst),
                self.shared.last_sent_rowid.load(Ordering::SeqCst),
            )
            .await?;

        let outcome = self.client.start_replication(None, env!("CARGO_PKG_VERSION"), None).await?;
        if let Some(code) = outcome.error {
            let err = replication_error(code);
            let _ = self.state_tx.send(ConnectivityState::Error(err.to_string()));
            return Err(err);
        }

        for defs in definitions {
            let sub_outcome = self.shared.subscriptions.subscribe(defs);
            if let Some((requests, _rx)) = sub_outcome.new_request {
                if let Err(e) = self.client.subscribe(sub_outcome.subscription_id, requests).await {
                    tracing::warn!(error = %e, "failed to re-subscribe shape after behind-window recovery");
                }
            }
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        self.client.close().await?;
        let _ = self.state_tx.send(ConnectivityState::Disconnected);
        Ok(())
    }

    /// Request a whole-table shape subscription (spec §4.5). Returns a
    /// future that resolves once the server has delivered the subscription's
    /// data (or rejects with the server's error string). If this exact shape
    /// set is already subscribed, the returned future resolves immediately —
    /// the Subscription Manager only keeps one completer per definition set,
    /// so a still-pending duplicate cannot be distinguished from a finished
    /// one here.
    pub async fn subscribe(
        &self,
        definitions: Vec<ShapeDefinition>,
    ) -> Result<tokio::sync::oneshot::Receiver<std::result::Result<(), String>>> {
        let outcome = self.shared.subscriptions.subscribe(definitions);
        match outcome.new_request {
            Some((requests, rx)) => {
                self.client.subscribe(outcome.subscription_id, requests).await?;
                Ok(rx)
            }
            None => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                let _ = tx.send(Ok(()));
                Ok(rx)
            }
        }
    }
}

async fn run_snapshot_cycle(shared: &Arc<Shared>, client: &Arc<dyn ReplicationClient>, scheduler: &Arc<SnapshotScheduler>) {
    if !scheduler.try_enter().await {
        return;
    }

    let result = {
        let conn = shared.conn.lock().await;
        let since = shared.last_sent_rowid.load(Ordering::SeqCst);
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let snapshotter = Snapshotter::new(&conn, &shared.cfg);
        snapshotter
            .take_snapshot(since, timestamp_ms, &shared.local_client_id)
            .map(|r| (r, since))
    };

    scheduler.mark_done().await;

    match result {
        Ok((Some(_), since)) => {
            let conn = shared.conn.lock().await;
            let store = OplogStore::new(&conn, &shared.cfg);
            match outbound_transactions_since(&store, since, &shared.local_client_id) {
                Ok(transactions) => {
                    let mut max_rowid = since;
                    for tx in transactions {
                        if let Some(rowid) = tx.lsn.get(..8).and_then(|b| b.try_into().ok()).map(i64::from_be_bytes) {
                            max_rowid = max_rowid.max(rowid);
                        }
                        if let Err(e) = client.enqueue_transaction(tx).await {
                            tracing::warn!(error = %e, "failed to enqueue outbound transaction");
                        }
                    }
                    if max_rowid > since {
                        shared.last_sent_rowid.store(max_rowid, Ordering::SeqCst);
                        let meta = MetaStore::new(&conn, &shared.cfg);
                        let _ = meta.set_i64(meta::KEY_LAST_SENT_ROW_ID, max_rowid);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to collect outbound transactions"),
            }
        }
        Ok((None, _)) => {}
        Err(e) => tracing::warn!(error = %e, "snapshot failed"),
    }
}

fn replication_error(code: crate::client::ReplicationErrorCode) -> SatelliteError {
    use crate::client::ReplicationErrorCode as E;
    match code {
        E::ConnectionFailed => SatelliteError::ConnectionFailed("server reported connection failure".to_string()),
        E::InvalidPosition => SatelliteError::InvalidPosition,
        E::BehindWindow => SatelliteError::BehindWindow,
        E::SubscriptionError => SatelliteError::SubscriptionError("start_replication subscription error".to_string()),
        E::Internal => SatelliteError::Internal("server reported an internal replication error".to_string()),
    }
}

fn hex_decode(s: String) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(SatelliteError::Internal(format!("malformed lsn hex: {s}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| SatelliteError::Internal(e.to_string())))
        .collect()
}
