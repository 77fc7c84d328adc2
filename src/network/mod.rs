//! Network Module Implementation
//!
//! This module provides the core networking functionality for the engine,
//! handling TCP connections, frame parsing, and message dispatch.
//!
//! # Architecture
//!
//! The network module is built on tokio's async I/O primitives and consists of:
//! - A per-socket state machine guarding in-flight operations and the close sequence
//! - Frame encoding/decoding for the length-prefixed wire envelope
//! - Connection management for the receive/send loops
//! - A registry tracking active connections against the configured ceiling
//! - Acceptor/Connector setup paths for both connection directions
//!
//! # Components
//!
//! - `SocketStateMachine`: Atomic bitmask of in-flight socket operations
//! - `FrameCodec` / `Frame` / `FrameView`: Wire envelope handling
//! - `DispatchRegistry` / `MessageHandler`: message-id based dispatch
//! - `Connection`: Manages one TCP connection end to end
//! - `ConnectionRegistry`: Connection tracking and admission limits
//! - `Acceptor` / `Connector`: Turn accept/connect completions into connections

pub use acceptor::Acceptor;
pub(crate) use connection::ConnectionSettings;
pub use connection::{CloseCallback, CloseReason, Connection, Direction};
pub use connector::Connector;
pub use dispatch::{DispatchRegistry, HandlerContext, MessageHandler};
pub use frame::{Frame, FrameCodec, FrameView, FRAME_HEADER_SIZE};
pub(crate) use lifecycle::{Lifecycle, LifecycleState};
pub use registry::ConnectionRegistry;
pub use socket_state::{SocketOp, SocketStateMachine};

mod acceptor;
mod connection;
mod connector;
mod dispatch;
mod frame;
mod lifecycle;
mod registry;
mod socket_state;

#[cfg(test)]
pub(crate) mod test_support;
