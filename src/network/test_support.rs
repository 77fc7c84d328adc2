//! Shared fixtures for the network unit tests: loopback socket pairs, a
//! close-callback probe, and helpers wrapping a raw stream into a running
//! `Connection`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::buffer::{BufferPoolPolicy, ObjectPool};
use crate::network::{
    CloseCallback, Connection, ConnectionSettings, Direction, DispatchRegistry, FrameCodec,
};

static NEXT_TEST_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

/// Counts close-callback invocations for one connection.
#[derive(Clone)]
pub(crate) struct CloseCounter {
    count: Arc<AtomicUsize>,
}

impl CloseCounter {
    pub(crate) fn new() -> CloseCounter {
        CloseCounter {
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn callback(&self) -> CloseCallback {
        let count = self.count.clone();
        Box::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_close(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.count() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "close callback never fired"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Wraps an established stream into a `Connection` with a running receive
/// loop, using a tiny dedicated buffer pool.
pub(crate) fn wrap_stream(
    stream: TcpStream,
    dispatch: Arc<DispatchRegistry>,
    close_on_unknown_message: bool,
    idle_timeout: Option<Duration>,
    close_callback: CloseCallback,
) -> Arc<Connection> {
    let local_addr = stream.local_addr().unwrap();
    let remote_addr = stream.peer_addr().unwrap();
    let (reader, writer) = stream.into_split();

    let conn = Connection::new(
        NEXT_TEST_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        Direction::Inbound,
        local_addr,
        remote_addr,
        writer,
        ConnectionSettings {
            codec: FrameCodec::new(1024),
            send_queue_max_bytes: 1024 * 1024,
            idle_timeout,
        },
        close_callback,
    );

    let pool = ObjectPool::new("test-buffers", 2, 2, BufferPoolPolicy::new(4096));
    conn.start_receive_loop(reader, pool.get(), dispatch, close_on_unknown_message);
    conn
}

pub(crate) async fn established_connection() -> (Arc<Connection>, TcpStream, CloseCounter) {
    established_connection_with(Arc::new(DispatchRegistry::new()), false).await
}

pub(crate) async fn established_connection_with(
    dispatch: Arc<DispatchRegistry>,
    close_on_unknown_message: bool,
) -> (Arc<Connection>, TcpStream, CloseCounter) {
    let (client, server) = tcp_pair().await;
    let counter = CloseCounter::new();
    let conn = wrap_stream(
        server,
        dispatch,
        close_on_unknown_message,
        None,
        counter.callback(),
    );
    (conn, client, counter)
}
