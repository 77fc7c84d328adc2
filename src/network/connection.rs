use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::buffer::{Pooled, PooledBuffer};
use crate::network::{
    DispatchRegistry, Frame, FrameCodec, HandlerContext, SocketOp, SocketStateMachine,
};
use crate::{AppError, AppResult};

/// Whether the connection was accepted or initiated by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why a connection was closed, delivered exactly once to the close callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// the peer shut down its side gracefully
    PeerClosed,
    /// a read or write failed at the transport level
    SocketError,
    /// no bytes arrived within the configured idle window
    Timeout,
    /// the byte stream violated the framing protocol
    ProtocolViolation,
    /// the application asked for the close
    Requested,
    /// the engine is shutting down
    EngineShutdown,
}

/// Invoked exactly once when the close sequence finalizes.
pub type CloseCallback = Box<dyn FnOnce(u64, CloseReason) + Send>;

/// Construction-time knobs shared by every connection of an engine.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub codec: FrameCodec,
    pub send_queue_max_bytes: usize,
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct ConnectionStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    send_batches: AtomicU64,
}

#[derive(Debug, Default)]
struct SendQueue {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    in_flight: bool,
}

enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut,
    Closed,
    Failed(AppError),
}

/// One peer: the socket state machine, the receive loop, and the ordered
/// send queue.
///
/// The receive loop keeps at most one read posted (the state machine's
/// receiving bit), decodes every complete frame in stream order and hands it
/// to the dispatch registry. The send path keeps at most one write posted:
/// the queue and the in-flight decision live under a single lock, so two
/// callers can never both observe "not sending" and double-post, and a
/// completion either drains what queued up meanwhile as one batched write or
/// clears the sending bit.
///
/// Closing is two-phase. Any trigger (transport error, protocol violation,
/// explicit request, engine shutdown) marks the state machine closing,
/// clears queued-but-unposted sends and wakes the receive loop; the last
/// in-flight completion finalizes, so a close deferred by an in-flight
/// operation always completes. Finalization disposes the socket, fires the
/// close callback exactly once and lets the receive buffer flow back to its
/// pool.
pub struct Connection {
    id: u64,
    direction: Direction,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: SocketStateMachine,
    codec: FrameCodec,
    send_queue_max_bytes: usize,
    idle_timeout: Option<Duration>,
    send_queue: Mutex<SendQueue>,
    writer: tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    close_notify: Notify,
    close_reason: Mutex<Option<CloseReason>>,
    close_callback: Mutex<Option<CloseCallback>>,
    stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        direction: Direction,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        writer: OwnedWriteHalf,
        settings: ConnectionSettings,
        close_callback: CloseCallback,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            direction,
            local_addr,
            remote_addr,
            state: SocketStateMachine::connected(),
            codec: settings.codec,
            send_queue_max_bytes: settings.send_queue_max_bytes,
            idle_timeout: settings.idle_timeout,
            send_queue: Mutex::new(SendQueue::default()),
            writer: tokio::sync::Mutex::new(Some(BufWriter::new(writer))),
            close_notify: Notify::new(),
            close_reason: Mutex::new(None),
            close_callback: Mutex::new(Some(close_callback)),
            stats: ConnectionStats::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    /// The reason recorded by the close trigger, if the close began.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.stats.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.stats.frames_sent.load(Ordering::Relaxed)
    }

    /// How many write operations the send path posted; queued frames that
    /// pile up behind an in-flight write share one batch.
    pub fn send_batches(&self) -> u64 {
        self.stats.send_batches.load(Ordering::Relaxed)
    }

    /// Encodes a frame for `message_id` around `body` and queues it.
    pub fn send(self: &Arc<Self>, message_id: u16, body: &[u8]) -> AppResult<()> {
        self.send_frame(Frame::new(message_id, Bytes::copy_from_slice(body)))
    }

    pub fn send_frame(self: &Arc<Self>, frame: Frame) -> AppResult<()> {
        let encoded = self.codec.encode_to_bytes(&frame)?;
        self.send_encoded(encoded)
    }

    /// Queues an already-encoded chunk, kicking off a write if none is in
    /// flight.
    ///
    /// The push and the "must a write be posted now" decision happen under
    /// one critical section. Queued chunks are flushed in strict enqueue
    /// order; at most one write operation is ever in flight.
    pub fn send_encoded(self: &Arc<Self>, payload: Bytes) -> AppResult<()> {
        let payload_len = payload.len();
        let kick = {
            let mut sq = self.send_queue.lock();
            // checked under the lock: the close path clears the queue under
            // this same lock after setting the bit, so a payload can never
            // slip in behind the clear
            if self.state.is_closing() {
                return Err(AppError::ConnectionClosing(self.id));
            }
            if sq.queued_bytes + payload_len > self.send_queue_max_bytes {
                return Err(AppError::CapacityExceeded(format!(
                    "send queue of connection {} exceeds {} bytes",
                    self.id, self.send_queue_max_bytes
                )));
            }
            sq.queued_bytes += payload_len;
            sq.queue.push_back(payload);
            if sq.in_flight {
                false
            } else {
                if !self.state.try_begin(SocketOp::Send) {
                    // a close raced in; the close path clears the queue
                    sq.queue.pop_back();
                    sq.queued_bytes -= payload_len;
                    return Err(AppError::ConnectionClosing(self.id));
                }
                sq.in_flight = true;
                true
            }
        };
        if kick {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                conn.flush_send_queue().await;
            });
        }
        Ok(())
    }

    /// Drains the send queue until it stays empty under the lock.
    ///
    /// Each iteration takes everything queued so far as one batch, so sends
    /// that piled up behind an in-flight write coalesce into a single
    /// further write, in original order.
    async fn flush_send_queue(self: Arc<Self>) {
        loop {
            let batch: Vec<Bytes> = {
                let mut sq = self.send_queue.lock();
                if sq.queue.is_empty() {
                    sq.in_flight = false;
                    self.state.end(SocketOp::Send);
                    break;
                }
                sq.queued_bytes = 0;
                sq.queue.drain(..).collect()
            };
            self.stats.send_batches.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.write_batch(&batch).await {
                {
                    let mut sq = self.send_queue.lock();
                    sq.in_flight = false;
                    self.state.end(SocketOp::Send);
                }
                warn!("connection {}: send failed: {}", self.id, e);
                self.close(CloseReason::SocketError);
                break;
            }
        }
        self.maybe_finalize_close();
    }

    async fn write_batch(&self, batch: &[Bytes]) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(AppError::ConnectionClosing(self.id))?;
        for chunk in batch {
            writer.write_all(chunk).await?;
            self.stats
                .bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        writer.flush().await?;
        self.stats
            .frames_sent
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Requests the close sequence. Every trigger past the first is a no-op;
    /// the callback still fires exactly once, after in-flight operations
    /// drain.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        if !self.state.begin_close() {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        {
            let mut sq = self.send_queue.lock();
            let dropped = sq.queue.len();
            sq.queue.clear();
            sq.queued_bytes = 0;
            if dropped > 0 {
                debug!(
                    "connection {}: discarded {} queued sends at close",
                    self.id, dropped
                );
            }
        }
        self.close_notify.notify_one();
        self.maybe_finalize_close();
    }

    /// Finalizes if this caller wins the close race; called after every
    /// completion so a deferred close always finishes.
    fn maybe_finalize_close(self: &Arc<Self>) {
        if !self.state.try_finalize_close() {
            return;
        }
        let reason = self.close_reason().unwrap_or(CloseReason::Requested);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.finalize_close(reason).await;
        });
    }

    async fn finalize_close(self: Arc<Self>, reason: CloseReason) {
        // dispose the socket: from here the write half is gone
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("connection {}: socket shutdown: {}", self.id, e);
            }
        }
        let callback = self.close_callback.lock().take();
        if let Some(callback) = callback {
            callback(self.id, reason);
        }
        debug!(
            "connection {} ({:?} {}) closed: {:?}",
            self.id, self.direction, self.remote_addr, reason
        );
    }

    /// Spawns the receive loop, moving the read half and the pooled buffer
    /// into it. The buffer flows back to its pool when the loop exits.
    pub(crate) fn start_receive_loop(
        self: &Arc<Self>,
        reader: OwnedReadHalf,
        buffer: Pooled<PooledBuffer>,
        dispatch: Arc<DispatchRegistry>,
        close_on_unknown_message: bool,
    ) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.receive_loop(reader, buffer, dispatch, close_on_unknown_message)
                .await;
        });
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut buffer: Pooled<PooledBuffer>,
        dispatch: Arc<DispatchRegistry>,
        close_on_unknown_message: bool,
    ) {
        let close_reason = loop {
            // at most one receive in flight, and none once closing
            if !self.state.try_begin(SocketOp::Recv) {
                break None;
            }
            let outcome = self.read_into(&mut reader, &mut buffer).await;
            self.state.end(SocketOp::Recv);
            match outcome {
                ReadOutcome::Data(n) => {
                    self.stats
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    if let Err(reason) =
                        self.drain_frames(&mut buffer, &dispatch, close_on_unknown_message)
                    {
                        break Some(reason);
                    }
                    buffer.compact();
                }
                ReadOutcome::Eof => break Some(CloseReason::PeerClosed),
                ReadOutcome::TimedOut => {
                    warn!(
                        "connection {}: no data from {} within the idle window",
                        self.id, self.remote_addr
                    );
                    break Some(CloseReason::Timeout);
                }
                ReadOutcome::Closed => break None,
                ReadOutcome::Failed(e) => {
                    warn!("connection {}: receive failed: {}", self.id, e);
                    break Some(CloseReason::SocketError);
                }
            }
        };
        if let Some(reason) = close_reason {
            self.close(reason);
        }
        self.maybe_finalize_close();
        debug!("connection {}: receive loop exited", self.id);
    }

    async fn read_into(&self, reader: &mut OwnedReadHalf, buffer: &mut PooledBuffer) -> ReadOutcome {
        let free = buffer.free_len();
        if free == 0 {
            // cannot happen while max_frame_size <= buffer capacity
            return ReadOutcome::Failed(AppError::IllegalStateError(format!(
                "receive buffer of connection {} has no free space",
                self.id
            )));
        }
        let read = async {
            let space = match buffer.open(free) {
                Ok(space) => space,
                Err(e) => return ReadOutcome::Failed(e),
            };
            match reader.read(space).await {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => match buffer.commit(n) {
                    Ok(()) => ReadOutcome::Data(n),
                    Err(e) => ReadOutcome::Failed(e),
                },
                Err(e) => ReadOutcome::Failed(e.into()),
            }
        };
        // notify_one leaves a permit behind, so a close that fires before
        // this select is entered still wakes it
        match self.idle_timeout {
            Some(window) => {
                tokio::select! {
                    outcome = tokio::time::timeout(window, read) => match outcome {
                        Ok(outcome) => outcome,
                        Err(_) => ReadOutcome::TimedOut,
                    },
                    _ = self.close_notify.notified() => ReadOutcome::Closed,
                }
            }
            None => {
                tokio::select! {
                    outcome = read => outcome,
                    _ = self.close_notify.notified() => ReadOutcome::Closed,
                }
            }
        }
    }

    /// Decodes and dispatches every complete frame in the unread region, in
    /// byte-stream order, advancing the read cursor by each consumed size.
    fn drain_frames(
        self: &Arc<Self>,
        buffer: &mut PooledBuffer,
        dispatch: &DispatchRegistry,
        close_on_unknown_message: bool,
    ) -> Result<(), CloseReason> {
        loop {
            let consumed = match self.codec.decode(buffer.unread_bytes()) {
                Ok(Some((view, consumed))) => {
                    self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    let ctx = HandlerContext {
                        connection: self,
                        message_id: view.message_id,
                        send_timestamp: view.send_timestamp,
                        body: view.body,
                    };
                    match dispatch.dispatch(&ctx) {
                        Ok(()) => {}
                        Err(AppError::UnknownMessageId(id)) => {
                            warn!(
                                "connection {}: no handler registered for message id {}",
                                self.id, id
                            );
                            if close_on_unknown_message {
                                return Err(CloseReason::ProtocolViolation);
                            }
                        }
                        Err(e) => {
                            // an application failure is not a stream failure
                            error!(
                                "connection {}: handler for message {} failed: {}",
                                self.id, view.message_id, e
                            );
                        }
                    }
                    consumed
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(
                        "connection {}: protocol violation from {}: {}",
                        self.id, self.remote_addr, e
                    );
                    return Err(CloseReason::ProtocolViolation);
                }
            };
            if buffer.take(consumed).is_err() {
                return Err(CloseReason::ProtocolViolation);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("connection {} dropped", self.id);
    }
}
