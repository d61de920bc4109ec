use orbit_core::DocumentError;
use thiserror::Error;

/// Storage adapter failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid store id: {0:?}")]
    InvalidId(String),
    #[error("Storage adapter has been disposed")]
    Disposed,
}

/// Wire protocol and connection failures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

/// Errors surfaced by the synchronization coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Coordinator has been disposed")]
    Disposed,
}
