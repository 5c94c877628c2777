//! Error types for the child session.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Listener, TLS or framing failure. Fatal to the session.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// One tag could not be copied. Recovered at the per-job boundary.
    #[error("copy of tag {tag:?} failed: {message}")]
    CopyJob { tag: String, message: String },

    /// Malformed inbound control line. Fatal to the event reader only.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] serde_json::Error),

    /// The overall session deadline fired.
    #[error("session deadline of {}s exceeded", .0.as_secs())]
    DeadlineExceeded(Duration),

    /// Bad command line input.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The private key could not be used.
    #[error("credential error for {}: {message}", path.display())]
    Credential { path: PathBuf, message: String },

    /// Private key readable or writable by group/others.
    #[error("private key {} has insecure permissions {mode:04o}; expected 0600 or stricter", path.display())]
    CredentialPermissions { path: PathBuf, mode: u32 },

    /// Misuse of a completion latch.
    #[error("completion signal error: {0}")]
    Signal(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub fn copy_job(tag: &str, message: impl Into<String>) -> Self {
        Error::CopyJob {
            tag: tag.to_string(),
            message: message.into(),
        }
    }

    pub fn credential(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Credential {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Full cause chain, one cause per line, for `Error` event tracebacks.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\nCaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::transport(format!("tls: {e}"))
    }
}
