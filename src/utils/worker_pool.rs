use std::any::type_name;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult, Shutdown};

/// Handler trait for processing queued tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Channel Capacity
    pub channel_capacity: usize,
    /// Channel Number
    pub num_channels: i8,
    /// Monitor Interval
    pub monitor_interval: Duration,
    /// Worker Check Timeout param
    pub worker_check_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 4,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// A pool of bounded per-worker queues decoupling producers from the socket
/// send path.
///
/// Each channel has its own dedicated worker, so tasks routed to one channel
/// are processed sequentially; routing by connection id keeps the per
/// connection order. The bounded channels are the engine's backpressure
/// boundary: [`send`](OutboundWorkerPool::send) awaits space while
/// [`try_send`](OutboundWorkerPool::try_send) fails fast, caller's choice.
#[derive(Debug)]
pub struct OutboundWorkerPool<T> {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    channels: Arc<HashMap<i8, TaskChannel<T>>>,
    config: WorkerPoolConfig,
}

/// represent a task channel
#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: i8,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> OutboundWorkerPool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) -> Self {
        let channels =
            Self::spawn_channels_with_monitor(config.clone(), notify_shutdown.clone(), handler);

        Self {
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
            channels,
            config,
        }
    }

    /// Queues a task on the given channel, awaiting space when it is full.
    pub async fn send(&self, task: T, channel_id: i8) -> AppResult<()> {
        self.channel(channel_id)?
            .sender
            .send(task)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }

    /// Queues a task without waiting; a full channel is an error the caller
    /// handles, this is the explicit backpressure signal.
    pub fn try_send(&self, task: T, channel_id: i8) -> AppResult<()> {
        self.channel(channel_id)?.sender.try_send(task).map_err(|e| {
            AppError::ChannelSendError(format!("outbound channel {}: {}", channel_id, e))
        })
    }

    /// The channel a routing key lands on.
    pub fn channel_for(&self, key: u64) -> i8 {
        (key % self.channels.len() as u64) as i8
    }

    pub fn get_pool_config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Get channel count
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, channel_id: i8) -> AppResult<&TaskChannel<T>> {
        self.channels.get(&channel_id).ok_or_else(|| {
            AppError::InvalidValue(format!("outbound channel id: {}", channel_id))
        })
    }

    fn spawn_channels_with_monitor<H: PoolHandler<T>>(
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
    ) -> Arc<HashMap<i8, TaskChannel<T>>> {
        let mut workers = Vec::with_capacity(config.num_channels as usize);
        let mut channels = HashMap::with_capacity(config.num_channels as usize);

        // Create a dedicated worker for each channel
        for id in 0..config.num_channels {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity);
            let worker = Self::spawn_worker(
                id,
                handler.clone(),
                notify_shutdown.clone(),
                receiver.clone(),
            );
            workers.push(worker);
            channels.insert(id, TaskChannel { sender, receiver });
        }

        let channels = Arc::new(channels);

        // Start monitor
        Self::spawn_monitor(
            workers,
            channels.clone(),
            notify_shutdown,
            handler,
            config,
        );

        channels
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: i8,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        let handle = tokio::spawn(async move {
            debug!("outbound worker {id} started");

            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        handler.handle(task).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("outbound worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    /// Restarts any worker that panicked so a poison task cannot silence its
    /// channel; the channel itself, and the backlog in it, survive the
    /// restart.
    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<HashMap<i8, TaskChannel<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("outbound worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("outbound worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                Self::log_worker_panic(worker.id, err);
                                            } else {
                                                error!("outbound worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    warn!("outbound worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        channels.get(&worker.id).expect("channel not found").receiver.clone(),
                                    );
                                    debug!("outbound worker {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("outbound worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("outbound worker monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: i8, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("outbound worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("outbound worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "outbound worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    #[derive(Clone)]
    struct TestHandler {
        counter: Arc<AtomicI32>,
    }

    impl PoolHandler<i32> for TestHandler {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let counter = self.counter.clone();
            async move {
                counter.fetch_add(task, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_worker_pool() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };

        let config = WorkerPoolConfig {
            channel_capacity: 10,
            num_channels: 2,
            monitor_interval: Duration::from_millis(100),
            worker_check_timeout: Duration::from_millis(50),
        };

        let pool = OutboundWorkerPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            handler.clone(),
            config,
        );

        pool.send(1, 0).await.unwrap();
        pool.send(2, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_try_send_reports_full_channel() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        #[derive(Clone)]
        struct StallHandler;

        impl PoolHandler<i32> for StallHandler {
            fn handle(&self, _task: i32) -> impl Future<Output = ()> + Send {
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        }

        let config = WorkerPoolConfig {
            channel_capacity: 1,
            num_channels: 1,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(50),
        };

        let pool =
            OutboundWorkerPool::new(notify_shutdown, shutdown_complete_tx, StallHandler, config);

        // the first task stalls its worker, the second fills the channel
        pool.send(1, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.send(2, 0).await.unwrap();

        let err = pool.try_send(3, 0).unwrap_err();
        assert!(matches!(err, AppError::ChannelSendError(_)));

        assert!(pool.try_send(4, 99).is_err());
    }

    #[tokio::test]
    async fn test_worker_panic_recovery() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        #[derive(Clone)]
        struct PanicHandler;

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                async move {
                    if should_panic {
                        panic!("Test panic");
                    }
                }
            }
        }

        let config = WorkerPoolConfig {
            channel_capacity: 10,
            num_channels: 1,
            monitor_interval: Duration::from_millis(100),
            worker_check_timeout: Duration::from_millis(50),
        };

        let pool = OutboundWorkerPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            PanicHandler,
            config,
        );

        pool.send(true, 0).await.unwrap();

        // wait for the monitor to restart the worker
        tokio::time::sleep(Duration::from_millis(300)).await;

        // the restarted worker keeps draining its channel
        pool.send(false, 0).await.unwrap();
    }

    #[test]
    fn test_channel_routing_is_stable() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();

        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };
        let config = WorkerPoolConfig {
            num_channels: 4,
            ..WorkerPoolConfig::default()
        };
        let pool =
            OutboundWorkerPool::new(notify_shutdown, shutdown_complete_tx, handler, config);

        assert_eq!(pool.channel_count(), 4);
        assert_eq!(pool.channel_for(7), pool.channel_for(7));
        assert!((pool.channel_for(u64::MAX) as usize) < pool.channel_count());
    }
}
