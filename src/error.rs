//! Error types for instance coordination

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during instance coordination
#[derive(Error, Debug)]
pub enum CoordError {
    /// Coordination segment can neither be created nor attached
    #[error("Coordination segment unavailable: {name}: {source}")]
    StorageUnavailable {
        /// Segment name
        name: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Primary endpoint cannot be bound
    #[error("Listener unavailable at {path}: {source}")]
    ListenerUnavailable {
        /// Endpoint path
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Blocking operation exceeded its caller-supplied timeout
    #[error("Operation timed out: {operation}")]
    TimedOut {
        /// Operation that timed out
        operation: String,
    },

    /// Connection to the primary endpoint was refused
    #[error("Connection to primary refused")]
    Refused,

    /// Malformed or unrecognized frame on a connection
    #[error("Invalid frame: {reason}")]
    InvalidFrame {
        /// What made the frame invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;
