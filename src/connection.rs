//! The seam between session logic and the secure transport

use crate::error::Result;
use crate::message::EventSink;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufRead;

/// Control stream of an established connection.
pub struct ControlChannel {
    /// Inbound control lines from the parent.
    pub reader: Box<dyn AsyncBufRead + Unpin + Send>,
    /// Outbound event lines to the parent.
    pub sink: Arc<dyn EventSink>,
}

/// An established reverse session.
///
/// `copy` pulls the file the parent serves under `tag` into `dest`,
/// calling `progress(sent, total)` as bytes land. An error returned by
/// `progress` aborts that copy.
#[allow(async_fn_in_trait)]
pub trait Connection {
    async fn open_control(&self) -> Result<ControlChannel>;

    async fn copy<F>(&self, tag: &str, dest: &Path, progress: F) -> Result<u64>
    where
        F: FnMut(u64, u64) -> Result<()>;
}
