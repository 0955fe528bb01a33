use std::future::Future;
use tokio::sync::Mutex;

/// FIFO sequencer for async operations.
///
/// At most one task runs at a time and tasks start in the order they first
/// reached [`TaskQueue::add_task`]. The guard is released whether a task
/// succeeds or fails, so a failing task never blocks the ones behind it.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tail: Mutex<()>,
}

impl TaskQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after every previously queued task has settled
    pub async fn add_task<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.tail.lock().await;
        task.await
    }

    /// Wait until everything queued before this call has settled
    pub async fn barrier(&self) {
        self.add_task(async {}).await;
    }

    /// Whether a task currently holds the queue
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.tail.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StrapError};
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_tasks_complete_in_submission_order() {
        let queue = TaskQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let latencies = [30u64, 5, 20, 0, 10];

        let tasks = latencies.iter().enumerate().map(|(i, &ms)| {
            let log = log.clone();
            let queue = &queue;
            async move {
                queue
                    .add_task(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        log.lock().unwrap().push(i);
                    })
                    .await;
            }
        });
        futures::future::join_all(tasks).await;

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_queue() {
        let queue = TaskQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let tasks = (0..4).map(|i| {
            let log = log.clone();
            let queue = &queue;
            async move {
                queue
                    .add_task(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        log.lock().unwrap().push(i);
                        if i == 1 {
                            Err(StrapError::NotConnected)
                        } else {
                            Ok(i)
                        }
                    })
                    .await
            }
        });
        let results: Vec<Result<i32>> = futures::future::join_all(tasks).await;

        assert!(results[1].is_err());
        assert_eq!(results[0].as_ref().unwrap(), &0);
        assert_eq!(results[3].as_ref().unwrap(), &3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let queue = Arc::new(TaskQueue::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .add_task(async move {
                        let _ = release_rx.await;
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_busy());

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert!(!queue.is_busy());
        queue.barrier().await;
    }
}
