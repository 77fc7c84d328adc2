use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::network::{Connection, Direction, Lifecycle, LifecycleState};
use crate::service::engine::EngineShared;
use crate::{AppError, AppResult};

/// Initiates outbound connections, mirroring the acceptor for the other
/// direction.
///
/// A completed connect funnels into the same engine establishment path as an
/// accepted socket, so both directions share one setup code path. Outbound
/// connects count against the same connection ceiling, and a second connect
/// to an endpoint that is already connected is refused.
#[derive(Debug)]
pub struct Connector {
    shared: Arc<EngineShared>,
    connect_timeout: Duration,
    lifecycle: Lifecycle,
}

impl Connector {
    pub(crate) fn new(shared: Arc<EngineShared>, connect_timeout: Duration) -> Connector {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Uninitialized, LifecycleState::Initialized);
        Connector {
            shared,
            connect_timeout,
            lifecycle,
        }
    }

    /// Posts a single connect to `endpoint` and builds the connection from
    /// the completed socket.
    pub async fn connect(&self, endpoint: SocketAddr) -> AppResult<Arc<Connection>> {
        self.lifecycle
            .advance(LifecycleState::Initialized, LifecycleState::Running);

        let permit = self
            .shared
            .connection_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                AppError::CapacityExceeded(format!(
                    "connection ceiling reached, cannot connect to {}",
                    endpoint
                ))
            })?;

        if self.shared.registry.has_endpoint(&endpoint) {
            return Err(AppError::DuplicatePeer(endpoint.to_string()));
        }

        debug!("connecting to {}", endpoint);
        let socket = match timeout(self.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(AppError::ConnectTimeout(endpoint.to_string())),
        };

        let conn = self
            .shared
            .install_connection(socket, Direction::Outbound)?;
        permit.forget();
        info!("connection {} established to {}", conn.id(), endpoint);
        Ok(conn)
    }

    /// Marks the connector stopped; in-flight connects finish on their own.
    pub(crate) fn stop(&self) {
        self.lifecycle
            .advance(LifecycleState::Initialized, LifecycleState::Stopping);
        self.lifecycle
            .advance(LifecycleState::Running, LifecycleState::Stopping);
        self.lifecycle
            .advance(LifecycleState::Stopping, LifecycleState::StopComplete);
    }
}
