use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Creation and reset policy for a pooled resource.
///
/// `create` builds a fresh instance when the pool is primed or runs dry.
/// `reset` is applied to every returned item before it can be handed out
/// again.
pub trait PoolPolicy<T>: Send + Sync + 'static {
    fn create(&self) -> T;
    fn reset(&self, item: &mut T);
}

/// A bounded pool of reusable resources.
///
/// Items are handed out wrapped in a [`Pooled`] guard and flow back on drop.
/// A pool that runs dry falls back to allocating a fresh instance (logged as
/// a warning) instead of failing the caller; returns beyond `max_retained`
/// are discarded so the pool never grows past its bound.
#[derive(Debug)]
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        ObjectPool {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<T> {
    name: &'static str,
    retained: Mutex<Vec<T>>,
    max_retained: usize,
    policy: Box<dyn PoolPolicy<T>>,
    fresh_allocations: AtomicU64,
}

impl<T> std::fmt::Debug for PoolInner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("name", &self.name)
            .field("max_retained", &self.max_retained)
            .finish()
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Creates a pool retaining at most `max_retained` idle items, primed
    /// with `preallocate` instances built by the policy.
    pub fn new<P: PoolPolicy<T>>(
        name: &'static str,
        max_retained: usize,
        preallocate: usize,
        policy: P,
    ) -> ObjectPool<T> {
        let primed = preallocate.min(max_retained);
        let mut retained = Vec::with_capacity(max_retained);
        for _ in 0..primed {
            retained.push(policy.create());
        }
        debug!("pool {} primed with {} instances", name, primed);
        ObjectPool {
            inner: Arc::new(PoolInner {
                name,
                retained: Mutex::new(retained),
                max_retained,
                policy: Box::new(policy),
                fresh_allocations: AtomicU64::new(0),
            }),
        }
    }

    /// Hands out an item, allocating a fresh one if the pool is empty.
    pub fn get(&self) -> Pooled<T> {
        let item = self.inner.retained.lock().pop();
        let item = match item {
            Some(item) => item,
            None => {
                self.inner.fresh_allocations.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "pool {} exhausted, allocating a fresh instance",
                    self.inner.name
                );
                self.inner.policy.create()
            }
        };
        Pooled {
            item: Some(item),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Number of idle items currently retained.
    pub fn retained_len(&self) -> usize {
        self.inner.retained.lock().len()
    }

    /// How many times the pool fell back to a fresh allocation.
    pub fn fresh_allocations(&self) -> u64 {
        self.inner.fresh_allocations.load(Ordering::Relaxed)
    }
}

/// RAII guard around a pooled item.
///
/// Dropping the guard resets the item via the pool policy and returns it to
/// the pool. If the pool itself is gone, the item is simply dropped.
#[derive(Debug)]
pub struct Pooled<T: Send + 'static> {
    item: Option<T>,
    pool: Weak<PoolInner<T>>,
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item already released")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item already released")
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        let item = self.item.take();
        let pool = self.pool.upgrade();
        if let (Some(mut item), Some(pool)) = (item, pool) {
            pool.policy.reset(&mut item);
            let mut retained = pool.retained.lock();
            if retained.len() < pool.max_retained {
                retained.push(item);
            }
        }
    }
}
