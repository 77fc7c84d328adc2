pub use worker_pool::{OutboundWorkerPool, PoolHandler, WorkerPoolConfig};
mod worker_pool;
