mod buffer;
mod network;
mod service;
mod utils;

pub use buffer::{BufferPool, BufferPoolPolicy, ObjectPool, PoolPolicy, Pooled, PooledBuffer};
pub use network::{
    Acceptor, CloseCallback, CloseReason, Connection, ConnectionRegistry, Connector, Direction,
    DispatchRegistry, Frame, FrameCodec, FrameView, HandlerContext, MessageHandler,
    SocketOp, SocketStateMachine, FRAME_HEADER_SIZE,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CloseHook, EndpointConfig,
    EngineConfig, LogGuard, NetworkConfig, NetworkEngine, OutboundConfig, OutboundTask,
    PoolConfig, Shutdown, SocketConfig,
};
pub use utils::{OutboundWorkerPool, PoolHandler, WorkerPoolConfig};
