use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    DuplicateToken,
    SerializeRecord(serde_json::Error),
    DeserializeRecord(serde_json::Error),
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    WorkerSpawn {
        operation: &'static str,
        source: std::io::Error,
    },
    WorkerLost {
        operation: &'static str,
    },
    Sled(sled::Error),
}

impl StorageError {
    /// Transient failures a caller may retry without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WorkerSpawn { .. } | Self::WorkerLost { .. }
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; allowed values: sled, memory"
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::DuplicateToken => write!(f, "token is already assigned to another record"),
            Self::SerializeRecord(source) => {
                write!(f, "failed to serialize record for storage: {source}")
            }
            Self::DeserializeRecord(source) => {
                write!(f, "failed to deserialize record from storage: {source}")
            }
            Self::Timeout {
                operation,
                timeout_ms,
            } => write!(
                f,
                "storage operation '{operation}' did not finish within {timeout_ms}ms"
            ),
            Self::WorkerSpawn { operation, source } => write!(
                f,
                "failed to spawn worker for storage operation '{operation}': {source}"
            ),
            Self::WorkerLost { operation } => {
                write!(f, "worker for storage operation '{operation}' exited without a result")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}
