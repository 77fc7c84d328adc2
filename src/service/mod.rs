pub use app_error::{AppError, AppResult};
pub use config::{
    EndpointConfig, EngineConfig, NetworkConfig, OutboundConfig, PoolConfig, SocketConfig,
};
pub use engine::{CloseHook, NetworkEngine, OutboundTask};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
pub(crate) mod engine;
mod shutdown;
mod tracing_config;
