//! Replication Client interface (spec §4.6, §6, component G).
//!
//! The wire bytes are thin glue, out of core scope (spec §1); this module
//! defines the logical message/transaction types and the `ReplicationClient`
//! trait the core consumes. `wire::TcpReplicationClient` is one concrete
//! implementation; tests use an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::relation::Relation;
use crate::tag::TagSet;

/// `Transaction` (spec §3): `(origin, commitTimestamp, lsn, changes)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub origin: String,
    pub commit_timestamp_ms: i64,
    pub lsn: Vec<u8>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Change {
    Data(DataChange),
    Schema(SchemaChange),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChange {
    pub schema: String,
    pub table: String,
    pub record_type: RecordType,
    pub new_record: Option<serde_json::Value>,
    pub old_record: Option<serde_json::Value>,
    pub tags: TagSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationType {
    Create,
    Alter,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    pub sql: String,
    pub table: String,
    pub migration_type: MigrationType,
    pub version: String,
}

/// A whole-table shape subscription request (spec §3, §4.5). Only whole-table
/// shapes are in scope (spec §1 Non-goals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct ShapeDefinition {
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeRequest {
    pub request_id: String,
    pub definition: ShapeDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDataRow {
    pub schema: String,
    pub table: String,
    pub record: serde_json::Value,
    pub tags: TagSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscription_id: String,
    pub lsn: Vec<u8>,
    pub rows: Vec<SubscriptionDataRow>,
}

/// Ack kind distinguishes "we flushed bytes to the socket" from "the server
/// committed the remote transaction we are acking" (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    LocalSend,
    RemoteCommit,
}

/// Error codes carried on the wire (spec §6, §7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationErrorCode {
    ConnectionFailed,
    InvalidPosition,
    BehindWindow,
    Internal,
    SubscriptionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReplicationOutcome {
    pub error: Option<ReplicationErrorCode>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundLogPositions {
    pub enqueued: i64,
    pub ack: i64,
}

/// Callbacks installed by Satellite on the Replication Client (spec §4.6,
/// §9: "Client takes a set of `on*` handlers installed by Satellite" —
/// breaks the Satellite/Client/Notifier cycle through an interface instead
/// of a back-reference).
#[async_trait]
pub trait ReplicationCallbacks: Send + Sync {
    async fn on_relation(&self, relation: Relation);
    async fn on_transaction(&self, tx: Transaction);
    async fn on_ack(&self, lsn: Vec<u8>, kind: AckKind);
    async fn on_outbound_start(&self);
    async fn on_subscription_data(&self, data: SubscriptionData);
    async fn on_subscription_error(&self, subscription_id: Option<String>, error: String);
}

/// The Replication Client interface consumed by the core (spec §4.6).
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    async fn connect(&self, callbacks: std::sync::Arc<dyn ReplicationCallbacks>) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn is_closed(&self) -> bool;
    async fn authenticate(&self, token: &str) -> Result<()>;

    async fn start_replication(
        &self,
        lsn: Option<Vec<u8>>,
        schema_version: &str,
        resume_subscriptions: Option<Vec<String>>,
    ) -> Result<StartReplicationOutcome>;

    async fn reset_outbound_log_positions(&self, ack_bytes: i64, sent_bytes: i64) -> Result<()>;
    async fn enqueue_transaction(&self, tx: Transaction) -> Result<()>;
    async fn get_outbound_log_positions(&self) -> OutboundLogPositions;
    async fn subscribe(
        &self,
        sub_id: String,
        shape_requests: Vec<ShapeRequest>,
    ) -> Result<()>;
}
