// rust/runtime-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset error: {message}")]
    Dataset {
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint generation {generation} is corrupt: {message}")]
    CheckpointCorrupt {
        generation: u64,
        message: String,
    },

    #[error("Collective round for step {step} timed out waiting for workers {missing:?}")]
    Timeout {
        step: u64,
        missing: Vec<usize>,
    },

    #[error("Lost peer {peer} during step {step}")]
    PeerLost {
        peer: usize,
        step: u64,
    },

    #[error("Step skew: local step {local_step}, worker {peer} presented step {peer_step}")]
    StepSkew {
        local_step: u64,
        peer: usize,
        peer_step: u64,
    },

    #[error("Cluster unavailable after {waited_ms}ms; workers {unavailable:?} never became live")]
    ClusterUnavailable {
        waited_ms: u64,
        unavailable: Vec<usize>,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Collective error: {message}")]
    Collective {
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// Convenience constructors
impl RuntimeError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn corrupt(generation: u64, message: impl Into<String>) -> Self {
        Self::CheckpointCorrupt {
            generation,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the training coordinator can recover from this error without
    /// surfacing it to the caller.
    ///
    /// `Timeout`, `PeerLost` and `StepSkew` are handled by pausing or
    /// resynchronizing from the last checkpoint; `CheckpointCorrupt` falls
    /// back to an older generation. Everything else is fatal for the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::PeerLost { .. }
                | Self::StepSkew { .. }
                | Self::CheckpointCorrupt { .. }
        )
    }
}
