use anyhow::{Context, Result};
use clap::Parser;

use afterglow::cli::{Cli, Command};
use afterglow::logger::init_logging;
use afterglow::message::{Event, MessageHandler};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let code = match cli.command {
        Command::Child(opts) => match opts.into_config() {
            Ok(config) => {
                // One thread: every session task is cooperatively scheduled
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("Failed to build tokio runtime")?;
                rt.block_on(afterglow::run(&config))
            }
            Err(e) => {
                MessageHandler::new(tracing::Span::current()).emit(&Event::error(&e));
                1
            }
        },
    };
    std::process::exit(code);
}
