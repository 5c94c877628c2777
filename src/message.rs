//! Control message channel: event encoding, outbound sink and inbound reader
//!
//! Events travel as one JSON document per line. Outbound writes are fire and
//! forget: until a connection attaches its sink, events only reach the log.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn, Span};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Listening,
    RequestFile {
        tag: String,
    },
    ProgressUpdate {
        tag: String,
        sent: u64,
        total: u64,
    },
    Terminate {
        exit_code: i32,
    },
    TerminateAck(i32),
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    Timeout {
        duration: u64,
    },
    FilesAlreadyExist {
        paths: Vec<PathBuf>,
    },
}

impl Event {
    pub fn error(err: &Error) -> Self {
        let chain = err.chain();
        Event::Error {
            message: err.to_string(),
            traceback: (chain != err.to_string()).then_some(chain),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode one inbound line.
///
/// Invalid JSON is an error; well-formed JSON of an unknown shape is `None`.
pub fn decode_line(line: &str) -> Result<Option<Event>> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    Ok(serde_json::from_value(value).ok())
}

/// Destination for encoded event lines.
pub trait EventSink: Send + Sync {
    fn send_line(&self, line: &str) -> std::io::Result<()>;
}

/// Sink used while no control stream is attached.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn send_line(&self, _line: &str) -> std::io::Result<()> {
        Ok(())
    }
}

/// Per-session event emitter.
///
/// Holds the bound log context and the outbound sink. The sink is attached
/// once per accepted connection and detached when that connection ends.
pub struct MessageHandler {
    span: Span,
    sink: RefCell<Arc<dyn EventSink>>,
    attached: Cell<bool>,
}

impl MessageHandler {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            sink: RefCell::new(Arc::new(NoopSink)),
            attached: Cell::new(false),
        }
    }

    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        if self.attached.replace(true) {
            warn!(parent: &self.span, "control sink attached twice; replacing");
        }
        *self.sink.borrow_mut() = sink;
    }

    pub fn detach(&self) {
        self.attached.set(false);
        *self.sink.borrow_mut() = Arc::new(NoopSink);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn emit(&self, event: &Event) {
        let line = match event.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(parent: &self.span, error = %e, "dropping unencodable event");
                return;
            }
        };
        info!(target: "afterglow::event", parent: &self.span, "{line}");
        let sink = Arc::clone(&self.sink.borrow());
        if let Err(e) = sink.send_line(&line) {
            debug!(parent: &self.span, error = %e, "control sink rejected event");
        }
    }

    pub fn emit_error(&self, err: &Error) {
        self.emit(&Event::error(err));
    }
}

/// Read control lines until the source is exhausted, dispatching each event.
///
/// Blank lines are skipped. A line that is not JSON ends the loop with
/// [`Error::ProtocolDecode`].
pub async fn read_events<R, F>(source: R, mut dispatch: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Event),
{
    let mut lines = source.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_line(line)? {
            Some(event) => dispatch(event),
            None => debug!(line, "ignoring unknown control message"),
        }
    }
    Ok(())
}
