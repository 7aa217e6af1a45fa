use std::io;

/// Crate-wide error type.
///
/// The variants mirror the propagation policy: transient I/O is retried at
/// the call site, `Protocol`/`State` travel back to the IPC caller as
/// `{ok:false, error}`, `FatalInit` terminates the owning task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// Malformed request, unknown command, bad argument.
    #[error("{0}")]
    Protocol(String),

    /// Command rejected by the mode state machine.
    #[error("{0}")]
    State(String),

    /// Recording / config name failed path validation.
    #[error("invalid path component: {0:?}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Startup failure that should take the daemon down.
    #[error("{0}")]
    FatalInit(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    /// Stable machine-readable kind for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Protocol(_) => "protocol",
            Error::State(_) => "state",
            Error::InvalidPath(_) => "invalid_path",
            Error::NotFound(_) => "not_found",
            Error::FatalInit(_) => "fatal_init",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
