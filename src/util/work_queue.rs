use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A bounded queue with a single consumer task. Producers wait for capacity when the consumer
///  falls behind, which gives backpressure all the way back to whoever pushes work.
///
/// Items are handled strictly one at a time and in submission order. Handlers that want
///  concurrency (e.g. fan-out) spawn internally.
pub struct WorkQueue<T> {
    name: &'static str,
    sender: mpsc::Sender<T>,
    worker: JoinHandle<()>,
}

impl <T: Send + 'static> WorkQueue<T> {
    pub fn spawn<F, Fut>(name: &'static str, capacity: usize, handler: F) -> WorkQueue<T>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<T>(capacity.max(1));
        let handler = Arc::new(handler);

        let worker = tokio::spawn(async move {
            info!("starting work queue {}", name);
            while let Some(item) = receiver.recv().await {
                handler(item).await;
            }
            debug!("work queue {} drained", name);
        });

        WorkQueue {
            name,
            sender,
            worker,
        }
    }

    /// waits for queue capacity, fails only if the consumer is gone
    pub async fn submit(&self, item: T) -> anyhow::Result<()> {
        self.sender.send(item).await
            .map_err(|_| anyhow!("work queue {} is shut down", self.name))
    }

    /// stops the consumer; items still queued are discarded
    pub fn shutdown(self) {
        info!("shutting down work queue {}", self.name);
        self.worker.abort();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::sync::Mutex;
    use super::*;

    #[tokio::test]
    async fn test_processes_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let queue = WorkQueue::spawn("test", 2, move |n: u32| {
            let seen = seen_in_handler.clone();
            async move {
                seen.lock().await.push(n);
            }
        });

        for n in 0..10 {
            queue.submit(n).await.unwrap();
        }

        for _ in 0..100 {
            if seen.lock().await.len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().await, (0..10).collect::<Vec<_>>());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let queue = WorkQueue::spawn("test", 1, |_: u32| async {});
        let sender = queue.sender.clone();
        queue.shutdown();
        tokio::task::yield_now().await;

        // the receiver is dropped together with the aborted worker
        for _ in 0..100 {
            if sender.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sender.send(1).await.is_err());
    }
}
