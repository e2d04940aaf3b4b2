use thiserror::Error;

/// Main error type for freshet operations
#[derive(Error, Debug)]
pub enum FreshetError {
    #[error("flush did not complete within {elapsed_ms}ms")]
    FlushTimeout { elapsed_ms: u64 },

    #[error("reader cache refresh did not complete within {elapsed_ms}ms")]
    RefreshTimeout { elapsed_ms: u64 },

    #[error("version {version} not absorbed within {elapsed_ms}ms")]
    SyncTimeout { elapsed_ms: u64, version: u64 },

    #[error("consumer is shut down - cannot accept events")]
    ConsumerClosed,

    #[error("engine I/O error: {0}")]
    Engine(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for freshet operations
pub type Result<T> = std::result::Result<T, FreshetError>;

impl FreshetError {
    /// Check if this error is a barrier timeout. Timeouts leave pipeline
    /// state unchanged; the operation may simply be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FreshetError::FlushTimeout { .. }
                | FreshetError::RefreshTimeout { .. }
                | FreshetError::SyncTimeout { .. }
        )
    }
}
