pub mod applier;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod meta;
pub mod oplog;
pub mod relation;
pub mod satellite;
pub mod snapshot;
pub mod subscription;
pub mod tag;
pub mod wire;

pub use client::{
    AckKind, Change, DataChange, MigrationType, ReplicationCallbacks, ReplicationClient,
    ReplicationErrorCode, SchemaChange, ShapeDefinition, ShapeRequest, SubscriptionData,
    SubscriptionDataRow, Transaction,
};
pub use config::{AuthConfig, ConsoleConfig, SatelliteConfig};
pub use error::{Result, SatelliteError};
pub use lifecycle::ConnectivityState;
pub use relation::{Column, Relation, RelationCache, TableType};
pub use satellite::Satellite;
pub use tag::{Tag, TagSet};
pub use wire::TcpReplicationClient;
