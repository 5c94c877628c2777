//! Command line surface

use crate::error::Result;
use crate::files::TaggedFiles;
use crate::protocol::timeouts::DEFAULT_SESSION_SECS;
use crate::session::ChildConfig;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(author, version, about = "Afterglow - one-shot reverse file pull")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write diagnostics to this file instead of stdout
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Listen for the parent and pull the declared files
    Child(ChildOpts),
}

/// Options for the listening child
#[derive(Clone, Debug, Parser)]
pub struct ChildOpts {
    /// Path to private key file (PEM, PKCS#8)
    #[arg(long = "private-key")]
    pub private_key: PathBuf,

    /// The port on which the child will listen
    #[arg(long)]
    pub port: u16,

    /// Colon separated tag:path mapping
    #[arg(long, num_args = 1.., required = true)]
    pub files: Vec<String>,

    /// Seconds the whole session may take before giving up
    #[arg(long, default_value_t = DEFAULT_SESSION_SECS)]
    pub timeout: u64,
}

impl ChildOpts {
    pub fn into_config(self) -> Result<ChildConfig> {
        let files = TaggedFiles::parse(&self.files)?;
        let mut config = ChildConfig::new(self.private_key, self.port, files);
        config.timeout = Duration::from_secs(self.timeout);
        Ok(config)
    }
}
