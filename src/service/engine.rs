use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, BufferPoolPolicy, ObjectPool};
use crate::network::{
    Acceptor, CloseCallback, CloseReason, Connection, ConnectionRegistry, ConnectionSettings,
    Connector, Direction, DispatchRegistry, Frame, FrameCodec,
};
use crate::utils::{OutboundWorkerPool, PoolHandler, WorkerPoolConfig};
use crate::{AppResult, EngineConfig, SocketConfig};

/// Observer invoked after the engine's own close bookkeeping for every
/// closed connection.
pub type CloseHook = Arc<dyn Fn(u64, CloseReason) + Send + Sync>;

/// A send decoupled from the calling thread, routed through the outbound
/// worker queues.
#[derive(Debug)]
pub struct OutboundTask {
    pub connection: Arc<Connection>,
    pub frame: Frame,
}

#[derive(Clone)]
struct OutboundSendHandler;

impl PoolHandler<OutboundTask> for OutboundSendHandler {
    fn handle(&self, task: OutboundTask) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = task.connection.send_frame(task.frame) {
                warn!(
                    "outbound worker could not queue send on connection {}: {}",
                    task.connection.id(),
                    e
                );
            }
        }
    }
}

/// State shared between the engine, its acceptors and its connector.
///
/// The close callback installed on every connection captures a weak handle
/// back to this struct, so connections never keep the engine alive.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) dispatch: Arc<DispatchRegistry>,
    pub(crate) buffer_pool: BufferPool,
    pub(crate) connection_permits: Arc<Semaphore>,
    next_connection_id: AtomicU64,
    close_hook: RwLock<Option<CloseHook>>,
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("registry", &self.registry)
            .field("next_connection_id", &self.next_connection_id)
            .finish()
    }
}

impl EngineShared {
    fn next_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The single establishment path for both directions.
    ///
    /// Accept and connect completions, whether they finished synchronously
    /// or not, all funnel through here: socket options, duplicate-peer
    /// policy, id assignment, registration and the receive-loop start happen
    /// in exactly one place.
    pub(crate) fn install_connection(
        self: &Arc<Self>,
        socket: TcpStream,
        direction: Direction,
    ) -> AppResult<Arc<Connection>> {
        configure_socket(&socket, &self.config.socket)?;

        let local_addr = socket.local_addr()?;
        let remote_addr = socket.peer_addr()?;

        if direction == Direction::Inbound
            && self.config.network.reject_duplicate_peers
            && self.registry.has_duplicate_peer(remote_addr.ip())
        {
            return Err(crate::AppError::DuplicatePeer(remote_addr.to_string()));
        }

        let id = self.next_id();
        let (reader, writer) = socket.into_split();

        let weak = Arc::downgrade(self);
        let close_callback: CloseCallback = Box::new(move |id, reason| {
            if let Some(shared) = weak.upgrade() {
                shared.registry.remove(id);
                shared.connection_permits.add_permits(1);
                info!("connection {} closed: {:?}", id, reason);
                let hook = shared.close_hook.read().clone();
                if let Some(hook) = hook {
                    hook(id, reason);
                }
            }
        });

        let settings = ConnectionSettings {
            codec: FrameCodec::new(self.config.network.max_frame_size),
            send_queue_max_bytes: self.config.network.send_queue_max_bytes,
            idle_timeout: self.config.network.idle_timeout(),
        };
        let conn = Connection::new(
            id,
            direction,
            local_addr,
            remote_addr,
            writer,
            settings,
            close_callback,
        );
        self.registry.add(conn.clone())?;
        conn.start_receive_loop(
            reader,
            self.buffer_pool.get(),
            self.dispatch.clone(),
            self.config.network.close_on_unknown_message,
        );
        Ok(conn)
    }
}

fn configure_socket(socket: &TcpStream, config: &SocketConfig) -> AppResult<()> {
    socket.set_nodelay(config.nodelay)?;
    let sock_ref = SockRef::from(socket);
    if config.keepalive_secs > 0 {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(config.keepalive_secs))
            .with_interval(Duration::from_secs(config.keepalive_interval_secs));
        sock_ref.set_tcp_keepalive(&keepalive)?;
    }
    if let Some(linger_secs) = config.linger_secs {
        sock_ref.set_linger(Some(Duration::from_secs(linger_secs)))?;
    }
    if config.recv_buffer_size > 0 {
        sock_ref.set_recv_buffer_size(config.recv_buffer_size)?;
    }
    if config.send_buffer_size > 0 {
        sock_ref.set_send_buffer_size(config.send_buffer_size)?;
    }
    Ok(())
}

/// The top-level server object: owns the pools, the registry, the dispatch
/// table, the acceptors and the outbound worker queues.
///
/// Everything is explicitly constructed and passed in; one process can run
/// several independent engines side by side.
#[derive(Debug)]
pub struct NetworkEngine {
    shared: Arc<EngineShared>,
    connector: Connector,
    outbound_pool: OutboundWorkerPool<OutboundTask>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    listen_addrs: Vec<SocketAddr>,
}

impl NetworkEngine {
    /// Builds an engine from an immutable configuration snapshot and a fully
    /// populated dispatch registry.
    pub fn new(config: EngineConfig, dispatch: DispatchRegistry) -> AppResult<NetworkEngine> {
        config.validate()?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let buffer_pool = ObjectPool::new(
            "recv-buffers",
            config.pool.max_retained,
            config.pool.preallocate,
            BufferPoolPolicy::new(config.pool.buffer_capacity),
        );

        let shared = Arc::new(EngineShared {
            registry: ConnectionRegistry::new(config.network.max_connection),
            dispatch: Arc::new(dispatch),
            buffer_pool,
            connection_permits: Arc::new(Semaphore::new(config.network.max_connection)),
            next_connection_id: AtomicU64::new(1),
            close_hook: RwLock::new(None),
            config,
        });

        let connector = Connector::new(
            shared.clone(),
            shared.config.network.connect_timeout(),
        );

        let worker_pool_config = WorkerPoolConfig {
            channel_capacity: shared.config.outbound.channel_capacity,
            num_channels: shared.config.outbound.resolved_num_channels(),
            monitor_interval: Duration::from_secs(shared.config.outbound.monitor_interval),
            worker_check_timeout: Duration::from_millis(
                shared.config.outbound.worker_check_timeout,
            ),
        };
        let outbound_pool = OutboundWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            OutboundSendHandler,
            worker_pool_config,
        );

        Ok(NetworkEngine {
            shared,
            connector,
            outbound_pool,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
            listen_addrs: Vec::new(),
        })
    }

    /// Installs an observer for connection closes. Set this before
    /// [`start`](Self::start); closes that finalize earlier are not replayed.
    pub fn set_close_hook(&self, hook: CloseHook) {
        *self.shared.close_hook.write() = Some(hook);
    }

    /// Binds every configured listener and spawns its accept loop.
    pub async fn start(&mut self) -> AppResult<()> {
        for endpoint in &self.shared.config.network.listeners {
            let acceptor = Acceptor::bind(
                &endpoint.address(),
                self.shared.clone(),
                self.notify_shutdown.clone(),
                self.shutdown_complete_tx.clone(),
            )
            .await?;
            self.listen_addrs.push(acceptor.local_addr());
            tokio::spawn(async move {
                if let Err(e) = acceptor.run().await {
                    warn!("acceptor exited with error: {}", e);
                }
            });
        }
        info!(
            "engine started with {} listener(s), connection ceiling {}",
            self.listen_addrs.len(),
            self.shared.config.network.max_connection
        );
        Ok(())
    }

    /// The addresses the acceptors actually bound, resolved after
    /// [`start`](Self::start); useful when a listener was configured on
    /// port 0.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Opens an outbound connection through the connector.
    pub async fn connect(&self, endpoint: SocketAddr) -> AppResult<Arc<Connection>> {
        self.connector.connect(endpoint).await
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }

    /// Requests a close of one connection; the callback carries
    /// [`CloseReason::Requested`].
    pub fn close_connection(&self, id: u64) -> bool {
        match self.shared.registry.get(id) {
            Some(conn) => {
                conn.close(CloseReason::Requested);
                true
            }
            None => false,
        }
    }

    /// Queues a send on the worker channel owned by this connection,
    /// awaiting space when the channel is full.
    pub async fn queue_send(&self, connection: Arc<Connection>, frame: Frame) -> AppResult<()> {
        let channel = self.outbound_pool.channel_for(connection.id());
        self.outbound_pool
            .send(OutboundTask { connection, frame }, channel)
            .await
    }

    /// Queues a send without waiting; a full channel surfaces as an error.
    pub fn try_queue_send(&self, connection: Arc<Connection>, frame: Frame) -> AppResult<()> {
        let channel = self.outbound_pool.channel_for(connection.id());
        self.outbound_pool
            .try_send(OutboundTask { connection, frame }, channel)
    }

    /// Stops accepting, closes every active connection and waits for the
    /// teardown to complete.
    pub async fn shutdown(self) {
        let NetworkEngine {
            shared,
            connector,
            outbound_pool,
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
            ..
        } = self;

        let _ = notify_shutdown.send(());
        connector.stop();

        for conn in shared.registry.snapshot() {
            conn.close(CloseReason::EngineShutdown);
        }

        // connections finalize through their close callbacks; give them a
        // bounded window to drain
        let deadline = time::Instant::now() + Duration::from_secs(5);
        while shared.registry.count() > 0 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        if shared.registry.count() > 0 {
            warn!(
                "{} connection(s) still registered at shutdown deadline",
                shared.registry.count()
            );
        }

        drop(outbound_pool);
        drop(shutdown_complete_tx);
        debug!("waiting for engine tasks to exit...");
        let _ = shutdown_complete_rx.recv().await;
        info!("engine shutdown complete");
    }
}
