//! Terminate handshake run after each transfer pass
//!
//! Two single-resolution latches connect the handshake to the connection
//! handler: `finished` (transfer exit code) and `ack` (parent's
//! terminate_ack). `finished` is replaced the moment the handshake consumes
//! it, so a pass that completes mid-cycle is kept for the next one. `ack`
//! only exists while a terminate is outstanding; acks arriving outside that
//! window are dropped.

use crate::error::{Error, Result};
use crate::files::{validate_paths, TaggedFiles};
use crate::message::{Event, MessageHandler};
use crate::protocol::timeouts::ACK_TIMEOUT;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Single-resolution value slot, awaitable once.
pub struct Latch {
    tx: RefCell<Option<oneshot::Sender<i32>>>,
    rx: RefCell<Option<oneshot::Receiver<i32>>>,
}

impl Latch {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: RefCell::new(Some(tx)),
            rx: RefCell::new(Some(rx)),
        }
    }

    /// Resolve with `value`. Returns false if already resolved.
    pub fn resolve(&self, value: i32) -> bool {
        match self.tx.borrow_mut().take() {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Wait for the value. A second call on the same latch fails fast.
    pub async fn wait(&self) -> Result<i32> {
        let rx = self
            .rx
            .borrow_mut()
            .take()
            .ok_or(Error::Signal("latch awaited twice"))?;
        rx.await
            .map_err(|_| Error::Signal("latch dropped without resolution"))
    }
}

/// Latches shared by the connection handler (which resolves them) and the
/// handshake (which arms and waits on them).
pub struct HandshakeSignals {
    finished: RefCell<Rc<Latch>>,
    ack: RefCell<Option<Rc<Latch>>>,
    cycle: Cell<u32>,
}

impl Default for HandshakeSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeSignals {
    pub fn new() -> Self {
        Self {
            finished: RefCell::new(Rc::new(Latch::new())),
            ack: RefCell::new(None),
            cycle: Cell::new(0),
        }
    }

    pub fn cycle(&self) -> u32 {
        self.cycle.get()
    }

    /// Latch the next transfer pass will resolve.
    pub fn finished(&self) -> Rc<Latch> {
        Rc::clone(&self.finished.borrow())
    }

    /// Wait for a transfer pass, then immediately arm a fresh latch for the
    /// pass after it.
    pub async fn next_pass(&self) -> Result<i32> {
        let code = self.finished().wait().await?;
        *self.finished.borrow_mut() = Rc::new(Latch::new());
        Ok(code)
    }

    /// Transfer pass finished with `exit_code`.
    ///
    /// False when an earlier pass is still waiting to be consumed.
    pub fn finish(&self, exit_code: i32) -> bool {
        self.finished().resolve(exit_code)
    }

    /// Open the acknowledgment window for a terminate about to be sent.
    pub fn arm_ack(&self) -> Rc<Latch> {
        let latch = Rc::new(Latch::new());
        *self.ack.borrow_mut() = Some(Rc::clone(&latch));
        latch
    }

    pub fn disarm_ack(&self) {
        self.ack.borrow_mut().take();
    }

    pub fn awaiting_ack(&self) -> bool {
        self.ack.borrow().as_ref().is_some_and(|l| !l.is_resolved())
    }

    /// Parent acknowledged termination. False outside the window or when
    /// this terminate was already acknowledged.
    pub fn acknowledge(&self, exit_code: i32) -> bool {
        match self.ack.borrow().as_ref() {
            Some(latch) => latch.resolve(exit_code),
            None => false,
        }
    }

    fn next_cycle(&self) -> u32 {
        let cycle = self.cycle.get() + 1;
        self.cycle.set(cycle);
        cycle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingTransfer,
    ComputeExitCode,
    TerminateSent,
    AwaitingAck,
    Retry,
    Done,
}

/// Transfer result, downgraded to failure when the filesystem disagrees.
pub fn final_exit_code(transfer_code: i32, paths_complete: bool) -> i32 {
    if transfer_code != 0 {
        transfer_code
    } else {
        i32::from(!paths_complete)
    }
}

pub struct Handshake<'a> {
    signals: &'a HandshakeSignals,
    files: &'a TaggedFiles,
    handler: &'a MessageHandler,
    ack_timeout: Duration,
}

impl<'a> Handshake<'a> {
    pub fn new(signals: &'a HandshakeSignals, files: &'a TaggedFiles, handler: &'a MessageHandler) -> Self {
        Self {
            signals,
            files,
            handler,
            ack_timeout: ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Drive cycles until one ends with exit code 0.
    ///
    /// Never returns on its own while cycles keep failing; the caller bounds
    /// it with the session deadline.
    pub async fn run(&self) -> Result<i32> {
        let paths = self.files.paths();
        let mut state = HandshakeState::AwaitingTransfer;
        let mut transfer_code = 1;
        let mut exit_code = 1;
        let mut ack = None;

        loop {
            debug!(parent: self.handler.span(), cycle = self.signals.cycle(), ?state, "handshake");
            state = match state {
                HandshakeState::AwaitingTransfer => {
                    transfer_code = self.signals.next_pass().await?;
                    HandshakeState::ComputeExitCode
                }
                HandshakeState::ComputeExitCode => {
                    exit_code = final_exit_code(transfer_code, validate_paths(&paths));
                    HandshakeState::TerminateSent
                }
                HandshakeState::TerminateSent => {
                    ack = Some(self.signals.arm_ack());
                    self.handler.emit(&Event::Terminate { exit_code });
                    HandshakeState::AwaitingAck
                }
                HandshakeState::AwaitingAck => {
                    if let Some(latch) = ack.take() {
                        match tokio::time::timeout(self.ack_timeout, latch.wait()).await {
                            Ok(Ok(acked)) => debug!(parent: self.handler.span(), acked, "terminate acknowledged"),
                            Ok(Err(e)) => debug!(parent: self.handler.span(), error = %e, "ack unavailable"),
                            Err(_) => debug!(parent: self.handler.span(), "no terminate_ack before timeout"),
                        }
                    }
                    self.signals.disarm_ack();
                    if exit_code == 0 {
                        HandshakeState::Done
                    } else {
                        HandshakeState::Retry
                    }
                }
                HandshakeState::Retry => {
                    let cycle = self.signals.next_cycle();
                    info!(parent: self.handler.span(), cycle, exit_code, "transfer incomplete; waiting for another pass");
                    HandshakeState::AwaitingTransfer
                }
                HandshakeState::Done => return Ok(exit_code),
            };
        }
    }
}
