//! Frame encoding shared by the child transport and any peer speaking to it
//!
//! Both directions use the same header, so the parent side (and the test
//! harness standing in for it) can reuse these functions unchanged.

use crate::error::{Error, Result};
use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub stream: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: u8, stream: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            stream,
            payload: payload.into(),
        }
    }
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(Error::transport(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build frame header (15 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | STREAM (4) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, stream: u32, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&stream.to_le_bytes());
    header[11..15].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, stream, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32, u32)> {
    if &header[0..4] != MAGIC {
        return Err(Error::transport("invalid magic in frame header"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(Error::transport(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let frame_type = header[6];
    let stream = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    let payload_len = u32::from_le_bytes([header[11], header[12], header[13], header[14]]);
    Ok((frame_type, stream, payload_len))
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Frame>>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (kind, id, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok(Some(Frame {
        kind,
        stream: id,
        payload,
    }))
}

pub async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    validate_frame_size(frame.payload.len())?;
    let hdr = build_frame_header(frame.kind, frame.stream, frame.payload.len() as u32);
    stream.write_all(&hdr).await?;
    if !frame.payload.is_empty() {
        stream.write_all(&frame.payload).await?;
    }
    stream.flush().await?;
    Ok(())
}
