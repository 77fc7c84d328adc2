//! Buffer And Pool Module Implementation
//!
//! This module provides the pooled memory primitives for the engine,
//! keeping steady-state allocation near zero on the receive and send paths.
//!
//! # Components
//!
//! - `PooledBuffer`: A fixed-capacity byte buffer with read/write cursors
//! - `ObjectPool`: A generic bounded pool of reusable resources
//! - `Pooled`: An RAII guard returning the resource to its pool on drop
//!
//! # Features
//!
//! - Cursor-based reserve/commit/consume buffer protocol
//! - Pluggable creation and reset policy per pool
//! - Fresh-allocation fallback when a pool runs dry
//! - Bounded retention, excess returns are discarded

pub use object_pool::{ObjectPool, PoolPolicy, Pooled};
pub use pooled_buffer::{BufferPool, BufferPoolPolicy, PooledBuffer};
mod object_pool;
mod pooled_buffer;
