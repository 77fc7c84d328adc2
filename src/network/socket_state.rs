use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const SENDING: u32 = 1;
const SEND_COMPLETE: u32 = 1 << 1;
const RECEIVING: u32 = 1 << 2;
const RECV_COMPLETE: u32 = 1 << 3;
const CLOSING: u32 = 1 << 4;
const CLOSE_COMPLETE: u32 = 1 << 5;

/// One of the two socket operations that may be in flight on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOp {
    Send,
    Recv,
}

impl SocketOp {
    fn busy_bit(self) -> u32 {
        match self {
            SocketOp::Send => SENDING,
            SocketOp::Recv => RECEIVING,
        }
    }

    fn complete_bit(self) -> u32 {
        match self {
            SocketOp::Send => SEND_COMPLETE,
            SocketOp::Recv => RECV_COMPLETE,
        }
    }
}

/// Tracks the per-socket operation bits as a single atomic word.
///
/// Send and receive proceed concurrently, so the state is a bitmask rather
/// than a single enum: {sending, send-complete, receiving, recv-complete,
/// closing, close-complete}, plus a separate connected flag. All transitions
/// are compare-and-swap on one word; there is no read-then-write anywhere.
///
/// The close sequence is two-phase: [`begin_close`](Self::begin_close) marks
/// the intent, and [`try_finalize_close`](Self::try_finalize_close) succeeds
/// for exactly one caller once no operation is in flight. The socket must
/// not be disposed while a completion is still pending, so every completion
/// path re-checks finalization after clearing its busy bit.
#[derive(Debug)]
pub struct SocketStateMachine {
    state: AtomicU32,
    connected: AtomicBool,
}

impl SocketStateMachine {
    /// State machine for a freshly established socket.
    pub fn connected() -> SocketStateMachine {
        SocketStateMachine {
            state: AtomicU32::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// Marks `op` as in flight.
    ///
    /// Fails if the same operation is already posted (guards against a
    /// double-post) or if any closing bit is present.
    pub fn try_begin(&self, op: SocketOp) -> bool {
        let busy = op.busy_bit();
        let complete = op.complete_bit();
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if cur & (CLOSING | CLOSE_COMPLETE) != 0 || cur & busy != 0 {
                    None
                } else {
                    Some((cur | busy) & !complete)
                }
            })
            .is_ok()
    }

    /// Marks `op` as finished, recording its completion bit.
    pub fn end(&self, op: SocketOp) {
        let busy = op.busy_bit();
        let complete = op.complete_bit();
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur & !busy) | complete)
            });
    }

    /// Sets the closing bit. Returns false if a close was already requested,
    /// making every later close request a no-op.
    pub fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if cur & (CLOSING | CLOSE_COMPLETE) != 0 {
                    None
                } else {
                    Some(cur | CLOSING)
                }
            })
            .is_ok()
    }

    /// Finalizes the close once no send/receive is in flight.
    ///
    /// Returns true for exactly one caller; everyone else either sees an
    /// operation still pending or the close already finalized.
    pub fn try_finalize_close(&self) -> bool {
        let finalized = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let closable = cur & CLOSING != 0
                    && cur & CLOSE_COMPLETE == 0
                    && cur & (SENDING | RECEIVING) == 0;
                if closable {
                    Some(cur | CLOSE_COMPLETE)
                } else {
                    None
                }
            })
            .is_ok();
        if finalized {
            self.connected.store(false, Ordering::Release);
        }
        finalized
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) & (CLOSING | CLOSE_COMPLETE) != 0
    }

    pub fn is_close_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSE_COMPLETE != 0
    }

    pub fn is_in_flight(&self, op: SocketOp) -> bool {
        self.state.load(Ordering::Acquire) & op.busy_bit() != 0
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
