//! Error types for the catch-up pipeline

use super::config::ConfigError;
use super::types::EntityId;

/// Failures of the staging handoff (file queue or in-memory channel)
#[derive(Debug)]
pub enum HandoffError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    ChannelClosed,
}

impl From<std::io::Error> for HandoffError {
    fn from(err: std::io::Error) -> Self {
        HandoffError::Io(err)
    }
}

impl From<serde_json::Error> for HandoffError {
    fn from(err: serde_json::Error) -> Self {
        HandoffError::Serialization(err)
    }
}

impl std::fmt::Display for HandoffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffError::Io(e) => write!(f, "Staging IO error: {}", e),
            HandoffError::Serialization(e) => write!(f, "Staging serialization error: {}", e),
            HandoffError::ChannelClosed => write!(f, "Staging channel closed"),
        }
    }
}

impl std::error::Error for HandoffError {}

#[derive(Debug)]
pub enum PipelineError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Handoff(HandoffError),
    Config(ConfigError),
    /// Neither the liquid nor the tracked entities have any 5-minute data
    NoSourceData,
    WorkerPanicked(usize),
    TaskJoin(String),
    /// A batch with unapplied rows could neither be imported nor kept on disk
    BatchLost {
        entity_id: EntityId,
        rows: usize,
        cause: HandoffError,
    },
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err)
    }
}

impl From<HandoffError> for PipelineError {
    fn from(err: HandoffError) -> Self {
        PipelineError::Handoff(err)
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::TaskJoin(err.to_string())
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Database(e) => write!(f, "Database error: {}", e),
            PipelineError::Io(e) => write!(f, "IO error: {}", e),
            PipelineError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PipelineError::Handoff(e) => write!(f, "Handoff error: {}", e),
            PipelineError::Config(e) => write!(f, "Configuration error: {}", e),
            PipelineError::NoSourceData => {
                write!(f, "No 5-minute observations found to anchor the catch-up window")
            }
            PipelineError::WorkerPanicked(index) => write!(f, "Worker {} panicked", index),
            PipelineError::TaskJoin(e) => write!(f, "Task join error: {}", e),
            PipelineError::BatchLost { entity_id, rows, cause } => write!(
                f,
                "Lost batch of {} rows for entity {}: {}",
                rows, entity_id, cause
            ),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Database(e) => Some(e),
            PipelineError::Io(e) => Some(e),
            PipelineError::Serialization(e) => Some(e),
            PipelineError::Handoff(e) => Some(e),
            PipelineError::Config(e) => Some(e),
            PipelineError::BatchLost { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// True when SQLite rejected a statement because its table does not exist
pub fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("no such table")
    )
}

/// True when SQLite ran out of disk (or temp) space
pub fn is_disk_full(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull
    )
}
