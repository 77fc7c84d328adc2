use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{Direction, Lifecycle, LifecycleState};
use crate::service::engine::EngineShared;
use crate::{AppError, AppResult, Shutdown};

/// Owns one listening socket and turns accept completions into connections.
///
/// The accept loop acquires an admission permit before accepting, so at the
/// connection ceiling newly arriving sockets are held in the backlog rather
/// than accepted and torn down; the loop resumes as soon as a close frees a
/// slot. Every accepted socket goes through the engine's single
/// establishment path shared with the connector.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<EngineShared>,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    lifecycle: Lifecycle,
}

impl Acceptor {
    /// Binds the listener. A bind failure is unrecoverable and aborts
    /// engine startup.
    pub(crate) async fn bind(
        listen_address: &str,
        shared: Arc<EngineShared>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Acceptor> {
        let bind_result = TcpListener::bind(listen_address).await;
        if let Err(err) = &bind_result {
            let error_msg = format!(
                "Failed to bind listener to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            return Err(AppError::IllegalStateError(error_msg));
        }
        let listener = bind_result?;
        let local_addr = listener.local_addr()?;
        info!("acceptor binding to {} for listening", local_addr);

        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Uninitialized, LifecycleState::Initialized);
        Ok(Acceptor {
            listener,
            local_addr,
            shared,
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
            lifecycle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until the shutdown signal arrives or accepting
    /// fails past the retry budget.
    pub(crate) async fn run(self) -> AppResult<()> {
        self.lifecycle
            .advance(LifecycleState::Initialized, LifecycleState::Running);
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());

        let result = loop {
            // hold new arrivals in the backlog while at the ceiling
            let permit = tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                permit = self.shared.connection_permits.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break Ok(()),
                    }
                }
            };

            let socket = tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                res = self.accept() => match res {
                    Ok(socket) => socket,
                    Err(e) => break Err(e),
                }
            };

            match self.shared.install_connection(socket, Direction::Inbound) {
                Ok(conn) => {
                    // the permit is now owned by the connection slot and
                    // handed back by its close callback
                    permit.forget();
                    debug!(
                        "accepted connection {} from {}",
                        conn.id(),
                        conn.remote_addr()
                    );
                }
                Err(e) => {
                    warn!("rejecting accepted socket: {}", e);
                }
            }
        };

        self.lifecycle
            .advance(LifecycleState::Running, LifecycleState::Stopping);
        self.lifecycle
            .advance(LifecycleState::Stopping, LifecycleState::StopComplete);
        info!("acceptor on {} stopped", self.local_addr);
        result
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}
