//! Frame multiplexer carrying the control stream and concurrent file pulls
//! over one byte stream (normally the TLS session).

use crate::connection::{ControlChannel, Connection};
use crate::error::{Error, Result};
use crate::message::EventSink;
use crate::protocol::timeouts::SHUTDOWN_GRACE;
use crate::protocol::{frame, CONTROL_STREAM, STREAM_QUEUE_DEPTH};
use crate::protocol_core::{read_frame, write_frame, Frame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
enum StreamEvent {
    Start(u64),
    Data(Vec<u8>),
    End,
    Failed(String),
}

#[derive(Default)]
struct Routes {
    streams: HashMap<u32, mpsc::Sender<StreamEvent>>,
    control: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closed: bool,
}

impl Routes {
    /// Resolve the file stream `frame` belongs to. Control bytes are handed
    /// over directly; a terminal frame releases its stream's route.
    fn route(&mut self, frame: Frame) -> Option<(mpsc::Sender<StreamEvent>, StreamEvent)> {
        let event = match frame.kind {
            frame::CONTROL => {
                if let Some(tx) = &self.control {
                    let _ = tx.send(frame.payload);
                }
                return None;
            }
            frame::FILE_START => match <[u8; 8]>::try_from(frame.payload.as_slice()) {
                Ok(raw) => StreamEvent::Start(u64::from_le_bytes(raw)),
                Err(_) => StreamEvent::Failed("malformed FILE_START payload".into()),
            },
            frame::FILE_DATA => StreamEvent::Data(frame.payload),
            frame::FILE_END => StreamEvent::End,
            frame::FILE_ERROR => {
                StreamEvent::Failed(String::from_utf8_lossy(&frame.payload).into_owned())
            }
            other => {
                debug!(kind = other, stream = frame.stream, "ignoring unexpected frame");
                return None;
            }
        };
        let tx = if matches!(event, StreamEvent::End | StreamEvent::Failed(_)) {
            self.streams.remove(&frame.stream)
        } else {
            self.streams.get(&frame.stream).cloned()
        };
        if tx.is_none() {
            debug!(stream = frame.stream, "frame for unknown stream");
        }
        tx.map(|tx| (tx, event))
    }

    fn close(&mut self) {
        self.closed = true;
        self.streams.clear();
        self.control = None;
    }
}

/// Child end of a multiplexed session.
pub struct MuxConnection {
    outbound: mpsc::UnboundedSender<Frame>,
    routes: Arc<Mutex<Routes>>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    next_stream: AtomicU32,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MuxConnection {
    pub fn new<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rd, mut wr) = tokio::io::split(io);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let routes = Arc::new(Mutex::new(Routes {
            control: Some(control_tx),
            ..Routes::default()
        }));

        let reader_routes = Arc::clone(&routes);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut rd).await {
                    Ok(Some(frame)) => {
                        let routed = reader_routes.lock().route(frame);
                        // a full queue stalls the whole session until that copy catches up
                        if let Some((tx, event)) = routed {
                            let _ = tx.send(event).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "session read failed");
                        break;
                    }
                }
            }
            reader_routes.lock().close();
        });

        let (outbound, mut rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut wr, &frame).await {
                    warn!(error = %e, "session write failed");
                    break;
                }
            }
            let _ = wr.shutdown().await;
        });

        Self {
            outbound,
            routes,
            control_rx: Mutex::new(Some(control_rx)),
            next_stream: AtomicU32::new(CONTROL_STREAM + 1),
            reader,
            writer,
        }
    }
}

impl MuxConnection {
    /// Stop taking new frames and give the queued ones `SHUTDOWN_GRACE` to
    /// reach the peer. Control sinks handed out by [`Connection::open_control`]
    /// keep the writer open, so release them first.
    pub async fn shutdown(&mut self) {
        self.shutdown_within(SHUTDOWN_GRACE).await
    }

    async fn shutdown_within(&mut self, grace: Duration) {
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outbound, closed));
        if tokio::time::timeout(grace, &mut self.writer).await.is_err() {
            warn!("session writer did not drain before shutdown");
        }
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct StreamGuard<'a> {
    routes: &'a Mutex<Routes>,
    id: u32,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.routes.lock().streams.remove(&self.id);
    }
}

impl Connection for MuxConnection {
    async fn open_control(&self) -> Result<ControlChannel> {
        let rx = self
            .control_rx
            .lock()
            .take()
            .ok_or_else(|| Error::transport("control stream already opened"))?;
        Ok(ControlChannel {
            reader: Box::new(BufReader::new(ControlReader::new(rx))),
            sink: Arc::new(ControlSink {
                outbound: self.outbound.clone(),
            }),
        })
    }

    async fn copy<F>(&self, tag: &str, dest: &Path, mut progress: F) -> Result<u64>
    where
        F: FnMut(u64, u64) -> Result<()>,
    {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        {
            let mut routes = self.routes.lock();
            if routes.closed {
                return Err(Error::copy_job(tag, "connection closed"));
            }
            routes.streams.insert(id, tx);
        }
        let _guard = StreamGuard {
            routes: &self.routes,
            id,
        };

        self.outbound
            .send(Frame::new(frame::OPEN, id, tag.as_bytes()))
            .map_err(|_| Error::copy_job(tag, "connection closed"))?;

        let total = match rx.recv().await {
            Some(StreamEvent::Start(total)) => total,
            Some(StreamEvent::Failed(msg)) => return Err(Error::copy_job(tag, msg)),
            Some(other) => {
                return Err(Error::copy_job(tag, format!("expected FILE_START, got {other:?}")))
            }
            None => return Err(Error::copy_job(tag, "connection closed before transfer")),
        };

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::copy_job(tag, format!("create {}: {e}", dest.display())))?;
        let mut sent = 0u64;
        loop {
            match rx.recv().await {
                Some(StreamEvent::Data(chunk)) => {
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| Error::copy_job(tag, format!("write {}: {e}", dest.display())))?;
                    sent += chunk.len() as u64;
                    if sent > total {
                        return Err(Error::copy_job(
                            tag,
                            format!("received {sent} bytes, announced {total}"),
                        ));
                    }
                    progress(sent, total)?;
                }
                Some(StreamEvent::End) => break,
                Some(StreamEvent::Failed(msg)) => return Err(Error::copy_job(tag, msg)),
                Some(StreamEvent::Start(_)) => {
                    return Err(Error::copy_job(tag, "duplicate FILE_START"))
                }
                None => return Err(Error::copy_job(tag, "connection closed mid-transfer")),
            }
        }
        file.flush()
            .await
            .map_err(|e| Error::copy_job(tag, format!("flush {}: {e}", dest.display())))?;

        if sent != total {
            return Err(Error::copy_job(
                tag,
                format!("short transfer: {sent} of {total} bytes"),
            ));
        }
        if total == 0 {
            progress(0, 0)?;
        }
        Ok(sent)
    }
}

/// Outbound control lines, framed onto the session.
struct ControlSink {
    outbound: mpsc::UnboundedSender<Frame>,
}

impl EventSink for ControlSink {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        self.outbound
            .send(Frame::new(frame::CONTROL, CONTROL_STREAM, payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))
    }
}

/// Byte view over inbound CONTROL frames. EOF once the session closes.
struct ControlReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ControlReader {
    fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl AsyncRead for ControlReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pos >= this.buf.len() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.buf = chunk;
                    this.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = (this.buf.len() - this.pos).min(out.remaining());
        out.put_slice(&this.buf[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, DuplexStream};

    async fn expect_open(peer: &mut DuplexStream) -> (u32, String) {
        loop {
            let f = read_frame(peer).await.unwrap().expect("frame");
            if f.kind == frame::OPEN {
                return (f.stream, String::from_utf8(f.payload).unwrap());
            }
        }
    }

    async fn serve(peer: &mut DuplexStream, id: u32, chunks: &[&[u8]]) {
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        write_frame(peer, &Frame::new(frame::FILE_START, id, total.to_le_bytes().to_vec()))
            .await
            .unwrap();
        for c in chunks {
            write_frame(peer, &Frame::new(frame::FILE_DATA, id, c.to_vec()))
                .await
                .unwrap();
        }
        write_frame(peer, &Frame::new(frame::FILE_END, id, Vec::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn copy_writes_file_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let (child, mut parent) = tokio::io::duplex(64 * 1024);
        let conn = MuxConnection::new(child);

        let remote = async {
            let (id, tag) = expect_open(&mut parent).await;
            assert_eq!(tag, "alpha");
            serve(&mut parent, id, &[b"hello ", b"world"]).await;
        };
        let mut seen = Vec::new();
        let local = conn.copy("alpha", &dest, |sent, total| {
            seen.push((sent, total));
            Ok(())
        });
        let (_, copied) = tokio::join!(remote, local);

        assert_eq!(copied.unwrap(), 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(seen, vec![(6, 11), (11, 11)]);
    }

    #[tokio::test]
    async fn empty_file_reports_final_progress() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty");
        let (child, mut parent) = tokio::io::duplex(4096);
        let conn = MuxConnection::new(child);

        let remote = async {
            let (id, _) = expect_open(&mut parent).await;
            serve(&mut parent, id, &[]).await;
        };
        let mut seen = Vec::new();
        let local = conn.copy("e", &dest, |s, t| {
            seen.push((s, t));
            Ok(())
        });
        let (_, copied) = tokio::join!(remote, local);

        assert_eq!(copied.unwrap(), 0);
        assert!(dest.exists());
        assert_eq!(seen, vec![(0, 0)]);
    }

    #[tokio::test]
    async fn remote_error_and_handler_error_fail_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (child, mut parent) = tokio::io::duplex(4096);
        let conn = MuxConnection::new(child);

        let remote = async {
            let (id, _) = expect_open(&mut parent).await;
            write_frame(&mut parent, &Frame::new(frame::FILE_ERROR, id, b"no such tag".to_vec()))
                .await
                .unwrap();
            let (id, _) = expect_open(&mut parent).await;
            serve(&mut parent, id, &[b"abc"]).await;
        };
        let local = async {
            let missing = conn.copy("missing", &dir.path().join("m"), |_, _| Ok(())).await;
            let refused = conn
                .copy("refused", &dir.path().join("r"), |_, _| {
                    Err(Error::transport("handler refused"))
                })
                .await;
            (missing, refused)
        };
        let (_, (missing, refused)) = tokio::join!(remote, local);

        match missing {
            Err(Error::CopyJob { tag, message }) => {
                assert_eq!(tag, "missing");
                assert_eq!(message, "no such tag");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn dropped_peer_fails_pending_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (child, mut parent) = tokio::io::duplex(4096);
        let conn = MuxConnection::new(child);

        let remote = async {
            let (id, _) = expect_open(&mut parent).await;
            write_frame(&mut parent, &Frame::new(frame::FILE_START, id, 100u64.to_le_bytes().to_vec()))
                .await
                .unwrap();
            drop(parent);
        };
        let dest = dir.path().join("x");
        let local = conn.copy("x", &dest, |_, _| Ok(()));
        let (_, copied) = tokio::join!(remote, local);
        assert!(matches!(copied, Err(Error::CopyJob { .. })));
    }

    #[tokio::test]
    async fn slow_consumer_backpressures_the_session() {
        let (child, mut parent) = tokio::io::duplex(4096);
        let conn = MuxConnection::new(child);
        let (tx, mut rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        conn.routes.lock().streams.insert(7, tx);

        let chunk = vec![0u8; 1024];
        let flood = async {
            for _ in 0..STREAM_QUEUE_DEPTH * 8 {
                write_frame(&mut parent, &Frame::new(frame::FILE_DATA, 7, chunk.clone()))
                    .await
                    .unwrap();
            }
        };
        // nothing drains stream 7, so the parent's writes stall
        assert!(tokio::time::timeout(Duration::from_millis(200), flood).await.is_err());

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, STREAM_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_control_lines() {
        let (child, mut parent) = tokio::io::duplex(4096);
        let mut conn = MuxConnection::new(child);
        let control = conn.open_control().await.unwrap();
        control.sink.send_line(r#"{"timeout":{"duration":5}}"#).unwrap();
        drop(control);
        conn.shutdown_within(Duration::from_secs(1)).await;

        let f = read_frame(&mut parent).await.unwrap().unwrap();
        assert_eq!(f.payload, b"{\"timeout\":{\"duration\":5}}\n");
        assert!(read_frame(&mut parent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn control_lines_flow_both_ways() {
        let (child, mut parent) = tokio::io::duplex(4096);
        let conn = MuxConnection::new(child);
        let control = conn.open_control().await.unwrap();
        assert!(conn.open_control().await.is_err());

        control.sink.send_line(r#"{"terminate":{"exit_code":0}}"#).unwrap();
        let f = read_frame(&mut parent).await.unwrap().unwrap();
        assert_eq!(f.kind, frame::CONTROL);
        assert_eq!(f.payload, b"{\"terminate\":{\"exit_code\":0}}\n");

        // a line split across two frames is reassembled
        write_frame(&mut parent, &Frame::new(frame::CONTROL, 0, b"{\"terminate_".to_vec()))
            .await
            .unwrap();
        write_frame(&mut parent, &Frame::new(frame::CONTROL, 0, b"ack\": 0}\n".to_vec()))
            .await
            .unwrap();
        drop(parent);

        let mut lines = control.reader.lines();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("{\"terminate_ack\": 0}")
        );
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
