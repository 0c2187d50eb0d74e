use thiserror::Error;

/// Error kinds produced by the Satellite core.
///
/// Variants map onto the error kinds in the design: `Internal` is an
/// invariant violation and is always fatal; `ConnectionFailed`,
/// `InvalidPosition` and `BehindWindow` are re-thrown to the caller of
/// `start()`; `SubscriptionError` is delivered only to the affected
/// subscription's `synced` future. Everything else is logged and
/// swallowed by the lifecycle controller.
#[derive(Error, Debug)]
pub enum SatelliteError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid replication position")]
    InvalidPosition,

    #[error("behind replication window")]
    BehindWindow,

    #[error("subscription error: {0}")]
    SubscriptionError(String),

    #[error("compensating write required for compound foreign key on {0}")]
    CompoundForeignKeyUnsupported(String),
}

impl SatelliteError {
    /// Whether `start()` must propagate this error rather than retry on the
    /// next connectivity-available transition (spec §7: start-replication
    /// error policy).
    pub fn is_start_replication_fatal(&self) -> bool {
        matches!(
            self,
            SatelliteError::ConnectionFailed(_)
                | SatelliteError::InvalidPosition
                | SatelliteError::BehindWindow
        )
    }
}

pub type Result<T> = std::result::Result<T, SatelliteError>;
