//! Bounded pool of reusable execution contexts.
//!
//! Contexts are created lazily, up to the pool capacity, and recycled after
//! each run. When every context is busy, [`ContextPool::acquire`] waits for
//! one to be released (backpressure instead of unbounded interpreter
//! creation).
//!
//! A [`PooledContext`] is exclusively owned by one run. The run hands the
//! context back with [`PooledContext::recycle`] once the engine returned,
//! whatever the result. A guard dropped without recycling (the engine
//! panicked, or the run was abandoned) discards its context. The slot is
//! freed on every path, so a fresh context can take its place.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::engine::EngineFault;

/// Bounded context pool.
#[derive(Debug)]
pub struct ContextPool<C> {
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<C>>>,
    capacity: usize,
    created: AtomicUsize,
}

impl<C: Send + 'static> ContextPool<C> {
    /// Create an empty pool holding at most `capacity` contexts (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
            created: AtomicUsize::new(0),
        }
    }

    /// Maximum number of concurrently checked-out contexts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contexts currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Contexts created over the pool's lifetime.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Check out a context, waiting while the pool is exhausted.
    ///
    /// Reuses an idle context when one exists, otherwise calls `create`.
    /// If `create` fails the slot is released again.
    pub async fn acquire<F>(&self, create: F) -> Result<PooledContext<C>, EngineFault>
    where
        F: FnOnce() -> Result<C, EngineFault>,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| EngineFault::Context(format!("context pool closed: {e}")))?;

        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let context = match reused {
            Some(context) => context,
            None => {
                let context = create()?;
                let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Created execution context {}/{}", total, self.capacity);
                context
            }
        };

        Ok(PooledContext {
            context,
            idle: Arc::clone(&self.idle),
            permit,
        })
    }
}

/// A context checked out of a [`ContextPool`].
///
/// Dereferences to the context. The pool slot is held until this guard is
/// recycled or dropped.
#[derive(Debug)]
pub struct PooledContext<C> {
    context: C,
    idle: Arc<Mutex<Vec<C>>>,
    permit: OwnedSemaphorePermit,
}

impl<C> PooledContext<C> {
    /// Park the context for the next run and release the slot.
    pub fn recycle(self) {
        let Self {
            context,
            idle,
            permit,
        } = self;
        idle.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(context);
        drop(permit);
    }
}

impl<C> Deref for PooledContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.context
    }
}

impl<C> DerefMut for PooledContext<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.context
    }
}
