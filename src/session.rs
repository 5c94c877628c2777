//! Child session entry point
//!
//! Short-circuits when every destination already exists, otherwise
//! prepares directories, loads the credential, and runs the reverse
//! listener and handshake under the overall deadline.

use crate::error::{Error, Result};
use crate::files::{create_destination_dirs, validate_paths, TaggedFiles};
use crate::handshake::{Handshake, HandshakeSignals};
use crate::listener::ReverseListener;
use crate::message::{Event, MessageHandler};
use crate::protocol::timeouts::DEFAULT_SESSION_SECS;
use crate::tls::Credential;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, info_span};

#[derive(Debug, Clone)]
pub struct ChildConfig {
    pub private_key: PathBuf,
    pub port: u16,
    pub files: TaggedFiles,
    pub timeout: Duration,
}

impl ChildConfig {
    pub fn new(private_key: PathBuf, port: u16, files: TaggedFiles) -> Self {
        Self {
            private_key,
            port,
            files,
            timeout: Duration::from_secs(DEFAULT_SESSION_SECS),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

/// Overall session budget, fixed when the listener starts.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    /// Report expiry and return the error that ends the session.
    pub fn expire(&self, handler: &MessageHandler) -> Error {
        let err = Error::DeadlineExceeded(self.budget);
        info!(parent: handler.span(), "{err}");
        handler.emit(&Event::Timeout {
            duration: self.budget.as_secs(),
        });
        err
    }
}

/// Run the child session and return the process exit code.
pub async fn run(config: &ChildConfig) -> i32 {
    let span = info_span!("child", port = config.port, file_tags = ?config.files.tags());
    let handler = MessageHandler::new(span);
    match try_run(config, &handler).await {
        Ok(code) => code,
        Err(e) => {
            handler.emit_error(&e);
            1
        }
    }
}

async fn try_run(config: &ChildConfig, handler: &MessageHandler) -> Result<i32> {
    let paths = config.files.paths();
    if validate_paths(&paths) {
        handler.emit(&Event::FilesAlreadyExist { paths });
        return Ok(0);
    }

    create_destination_dirs(&config.files)?;

    let credential = Credential::load(&config.private_key)?;
    info!(
        parent: handler.span(),
        key = %credential.path().display(),
        fingerprint = %credential.fingerprint(),
        "loaded child credential"
    );

    let listener = ReverseListener::bind(config.bind_addr(), &credential).await?;
    Ok(listen(listener, &config.files, config.timeout, handler).await)
}

/// Drive an already bound listener until the handshake succeeds or the
/// deadline fires. The listener is closed on every path out.
pub async fn listen(
    listener: ReverseListener,
    files: &TaggedFiles,
    timeout: Duration,
    handler: &MessageHandler,
) -> i32 {
    if let Ok(addr) = listener.local_addr() {
        info!(parent: handler.span(), %addr, "waiting for parent");
    }
    handler.emit(&Event::Listening);

    let deadline = Deadline::after(timeout);
    let signals = HandshakeSignals::new();
    let cycles = Handshake::new(&signals, files, handler);
    let handshake = async {
        match tokio::time::timeout_at(deadline.at(), cycles.run()).await {
            Ok(outcome) => outcome,
            // expiry is reported by the listener
            Err(_) => std::future::pending::<Result<i32>>().await,
        }
    };

    let outcome = tokio::select! {
        code = handshake => code,
        err = listener.serve(files, handler, &signals, &deadline) => Err(err),
    };
    let exit_code = match outcome {
        Ok(code) => code,
        Err(Error::DeadlineExceeded(_)) => 1,
        Err(e) => {
            handler.emit_error(&e);
            1
        }
    };
    drop(listener);
    exit_code
}
