//! Storage error types.
//!
//! Defines errors that can occur during snapshot storage operations:
//! - `NotFound`: Restore found no snapshot for the connection
//! - `Serialization`: Failed to encode/decode a snapshot
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No snapshot for this connection and user
    #[error("snapshot not found: connection {connect_id}, user {user_id}")]
    NotFound {
        /// Connection that was looked up
        connect_id: u32,
        /// Owning user
        user_id: u64,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, keychain, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
