//! Transfer coordinator: one concurrent pull per tag, throttled progress,
//! and a single aggregated exit code.

use crate::connection::Connection;
use crate::error::Error;
use crate::files::{TaggedFile, TaggedFiles};
use crate::message::{Event, MessageHandler};
use crate::protocol::timeouts::PROGRESS_INTERVAL;
use futures::future::join_all;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Per-tag rate limiter for progress events.
///
/// An update passes when more than `interval` has elapsed since the last
/// emitted one for that tag, or when it completes the file.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: HashMap<String, Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Set the baseline for `tag`, normally when its file is requested.
    pub fn start(&mut self, tag: &str, now: Instant) {
        self.last.insert(tag.to_string(), now);
    }

    pub fn should_emit(&mut self, tag: &str, sent: u64, total: u64, now: Instant) -> bool {
        let due = match self.last.get(tag) {
            Some(prev) => now.saturating_duration_since(*prev) > self.interval,
            None => true,
        };
        if due || sent == total {
            self.last.insert(tag.to_string(), now);
            true
        } else {
            false
        }
    }
}

struct CoordinatorState {
    throttle: RefCell<ProgressThrottle>,
    failed: Cell<bool>,
    first_error: RefCell<Option<String>>,
}

impl CoordinatorState {
    fn new(interval: Duration) -> Self {
        Self {
            throttle: RefCell::new(ProgressThrottle::new(interval)),
            failed: Cell::new(false),
            first_error: RefCell::new(None),
        }
    }

    fn record_failure(&self, err: &Error) {
        self.failed.set(true);
        let mut first = self.first_error.borrow_mut();
        if first.is_none() {
            *first = Some(err.to_string());
        }
    }

    fn exit_code(&self) -> i32 {
        i32::from(self.failed.get())
    }
}

/// Pull every tagged file over `conn`, then call `on_complete` exactly once
/// with 0 (all succeeded) or 1 (any failure).
pub async fn copy_files<C, F>(conn: &C, files: &TaggedFiles, handler: &MessageHandler, on_complete: F)
where
    C: Connection,
    F: FnOnce(i32),
{
    let state = CoordinatorState::new(PROGRESS_INTERVAL);
    join_all(files.iter().map(|file| copy_one(conn, file, handler, &state))).await;

    if let Some(first) = state.first_error.borrow().as_deref() {
        warn!(parent: handler.span(), first_error = first, "transfer finished with failures");
    }
    on_complete(state.exit_code());
}

async fn copy_one<C: Connection>(
    conn: &C,
    file: &TaggedFile,
    handler: &MessageHandler,
    state: &CoordinatorState,
) {
    let tag = file.tag.as_str();
    state.throttle.borrow_mut().start(tag, Instant::now());
    handler.emit(&Event::RequestFile {
        tag: tag.to_string(),
    });

    let result = conn
        .copy(tag, &file.path, |sent, total| {
            let emit = state
                .throttle
                .borrow_mut()
                .should_emit(tag, sent, total, Instant::now());
            if emit {
                handler.emit(&Event::ProgressUpdate {
                    tag: tag.to_string(),
                    sent,
                    total,
                });
            }
            Ok(())
        })
        .await;

    match result {
        Ok(bytes) => info!(parent: handler.span(), tag, bytes, path = %file.path.display(), "file received"),
        Err(e) => {
            let err = match e {
                e @ Error::CopyJob { .. } => e,
                other => Error::copy_job(tag, other.to_string()),
            };
            handler.emit_error(&err);
            state.record_failure(&err);
        }
    }
}
