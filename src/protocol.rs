//! Shared protocol constants for the afterglow session transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"AGLW";
pub const VERSION: u16 = 1;

// Header layout: MAGIC (4) | VERSION (2) | TYPE (1) | STREAM (4) | LENGTH (4)
pub const HEADER_LEN: usize = 15;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Frames buffered per file stream before the session reader waits
pub const STREAM_QUEUE_DEPTH: usize = 32;

// Stream id reserved for the control line channel
pub const CONTROL_STREAM: u32 = 0;

// Frame type IDs (keep numeric stable, the parent speaks the same table)
pub mod frame {
    // Control line bytes, both directions, always on CONTROL_STREAM
    pub const CONTROL: u8 = 1;
    // Child asks for a tag: payload is the tag bytes
    pub const OPEN: u8 = 2;
    // Parent accepted the request: payload is the total size (u64 LE)
    pub const FILE_START: u8 = 3;
    pub const FILE_DATA: u8 = 4;
    pub const FILE_END: u8 = 5;
    // Parent could not serve the tag: payload is a UTF-8 message
    pub const FILE_ERROR: u8 = 6;
}

// Centralized timing constants for the session
pub mod timeouts {
    use std::time::Duration;

    // Minimum gap between two progress events for the same tag
    pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

    // How long one handshake cycle waits for terminate_ack
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

    // How long queued frames get to reach the parent when a session is torn down
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

    // Overall session deadline when --timeout is not given (seconds)
    pub const DEFAULT_SESSION_SECS: u64 = 300;
}
