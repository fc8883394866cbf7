//! Bridge for blocking work: a bounded set of worker threads with a one-shot result slot.

use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("blocking bridge is shut down")]
    Closed,
    #[error("blocking task panicked")]
    Panicked,
}

/// Runs closures on tokio's blocking pool, at most `workers` at a time.
#[derive(Clone)]
pub struct BlockingBridge {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingBridge {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers not currently busy.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a worker thread and wait for its result without blocking the runtime.
    pub async fn run<F, T>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::Closed)?;
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let out = f();
            drop(permit);
            let _ = tx.send(out);
        });
        rx.await.map_err(|_| BridgeError::Panicked)
    }

    /// Refuse further work. Calls already running finish.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn returns_closure_result() {
        let bridge = BlockingBridge::new(2);
        let v = bridge.run(|| 6 * 7).await.unwrap();
        assert_eq!(v, 42);
        assert_eq!(bridge.idle(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrency_is_bounded() {
        let bridge = BlockingBridge::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let bridge = bridge.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                bridge
                    .run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(30));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panic_is_reported() {
        let bridge = BlockingBridge::new(1);
        let res: Result<(), _> = bridge.run(|| panic!("boom")).await;
        assert_eq!(res, Err(BridgeError::Panicked));
        // the permit was released during unwinding
        assert_eq!(bridge.run(|| 1).await, Ok(1));
    }

    #[tokio::test]
    async fn closed_bridge_refuses_work() {
        let bridge = BlockingBridge::new(1);
        bridge.close();
        assert_eq!(bridge.run(|| ()).await, Err(BridgeError::Closed));
    }
}
