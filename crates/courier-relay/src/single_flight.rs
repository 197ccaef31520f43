//! Single-flight execution.
//!
//! Several relay operations (pre-write sync, heartbeat report) must have at
//! most one instance in flight; callers arriving while one runs join its
//! result instead of starting another. This is expressed as a shared-future
//! handle rather than ad-hoc flags, which race under backpressure.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, Shared};

/// At most one instance of an operation in flight; concurrent callers share
/// the in-progress result.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<(u64, Shared<BoxFuture<'static, T>>)>>,
    next_generation: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Create an idle cell.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run `make()` unless an instance is already in flight, in which case
    /// await and return that instance's result.
    pub async fn run<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, future) = {
            let mut slot = self.slot.lock().expect("single-flight lock poisoned");
            match slot.as_ref() {
                Some((generation, in_flight)) => (*generation, in_flight.clone()),
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let shared = make().boxed().shared();
                    *slot = Some((generation, shared.clone()));
                    (generation, shared)
                }
            }
        };

        let result = future.await;

        // Whoever finishes first retires this flight; later finishers see a
        // different generation (or an empty slot) and leave it alone.
        let mut slot = self.slot.lock().expect("single-flight lock poisoned");
        if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
            *slot = None;
        }
        result
    }

    /// Whether an instance is currently in flight.
    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .expect("single-flight lock poisoned")
            .is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let cell = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                cell.run(move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    42u32
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_execute_again() {
        let cell = SingleFlight::new();
        let executions = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&executions);
            cell.run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert!(!cell.in_flight());
    }
}
