use std::io;

use thiserror::Error;

/// Failure to bring a child process up on a fresh pseudo-terminal.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("session was already started")]
    AlreadyStarted,

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("PTY allocation failed: {0}")]
    PtyAllocation(#[source] nix::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to exec {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error during spawn: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("invalid terminal geometry {rows}x{cols}")]
    InvalidGeometry { rows: i64, cols: i64 },

    #[error("window size change failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum KioskTermError {
    #[error("Spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Resize rejected: {0}")]
    Resize(#[from] ResizeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KioskTermError>;
