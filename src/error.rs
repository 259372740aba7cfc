use crate::types::Rank;

pub type Result<T> = std::result::Result<T, MeshReduceError>;

#[derive(Debug, thiserror::Error)]
pub enum MeshReduceError {
    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("broadcast source rank {source_rank} supplied no value")]
    MissingBroadcastValue { source_rank: Rank },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("invalid device index {index}: only {visible} devices are visible")]
    InvalidDevice { index: usize, visible: usize },

    #[error("device allocation of {size_bytes} bytes failed: {reason}")]
    AllocationFailed { size_bytes: usize, reason: String },

    #[error("device runtime error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("reduction engine {operation} failed: {reason}")]
    Engine {
        operation: &'static str,
        reason: String,
    },

    #[error("topology query error: {reason}")]
    Topology { reason: String },
}

impl MeshReduceError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}
