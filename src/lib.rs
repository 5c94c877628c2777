//! Afterglow child
//!
//! Opens a reverse listener, lets the parent dial in, pulls a fixed set of
//! tagged files over the session and negotiates a clean shutdown.

pub mod cli;
pub mod connection;
pub mod error;
pub mod files;
pub mod handshake;
pub mod listener;
pub mod logger;
pub mod message;
pub mod mux;
pub mod protocol;
pub mod protocol_core;
pub mod session;
pub mod tls;
pub mod transfer;

pub use error::{Error, Result};
pub use session::{run, ChildConfig};
