//! Hands validated search requests to a bounded pool of background workers.
//!
//! `dispatch` never waits for a task: it allocates the id, spawns the job and
//! returns. At most `pool_size` tasks run at once; the rest wait for a permit
//! in an unbounded queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::Broker;
use crate::distance::Algorithm;
use crate::errors::DispatchError;
use crate::worker::{SearchTask, TaskWorker};

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub requester_id: i64,
    pub word: String,
    pub algorithm: String,
    /// Already resolved from the corpus store.
    pub corpus_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub scan_delay: Duration,
}

pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    settings: PoolSettings,
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>, settings: PoolSettings) -> Self {
        let pool_size = settings.pool_size.max(1);
        tracing::info!("Worker pool ready with {} slots", pool_size);
        Self {
            broker,
            permits: Arc::new(Semaphore::new(pool_size)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            settings,
        }
    }

    pub fn dispatch(&self, request: SearchRequest) -> Result<TaskHandle, DispatchError> {
        if self.tracker.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        let algorithm: Algorithm = request.algorithm.parse()?;
        let task = SearchTask::new(
            request.requester_id,
            request.word,
            algorithm,
            request.corpus_text,
        );
        let handle = TaskHandle {
            task_id: task.id.clone(),
        };

        let worker = TaskWorker::new(
            Arc::clone(&self.broker),
            self.settings.scan_delay,
            self.shutdown.child_token(),
        );
        let permits = Arc::clone(&self.permits);

        tracing::info!("Task {} queued for user {}", task.id, task.owner_id);
        self.tracker.spawn(async move {
            // A task still queued at shutdown runs without a slot and fails as cancelled
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = worker.cancel_token().cancelled() => None,
            };
            worker.run(task).await;
        });

        Ok(handle)
    }

    /// Tasks spawned and not yet finished, queued ones included.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work, cancel every task still running and wait until
    /// all of them have published their terminal event.
    pub async fn shutdown(&self) {
        tracing::info!("Stopping worker pool, {} tasks in flight", self.in_flight());
        self.tracker.close();
        self.shutdown.cancel();
        self.tracker.wait().await;
        tracing::info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{LocalBroker, Topic};
    use crate::errors::ValidationError;
    use crate::events::{EventPayload, NotificationEvent};
    use std::collections::HashSet;

    fn dispatcher(broker: &LocalBroker, pool_size: usize, scan_delay: Duration) -> TaskDispatcher {
        TaskDispatcher::new(
            Arc::new(broker.clone()),
            PoolSettings {
                pool_size,
                scan_delay,
            },
        )
    }

    fn request(algorithm: &str) -> SearchRequest {
        SearchRequest {
            requester_id: 5,
            word: "test".to_string(),
            algorithm: algorithm.to_string(),
            corpus_text: "test tent text".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejects_unsupported_algorithm() {
        let broker = LocalBroker::new(16);
        let dispatcher = dispatcher(&broker, 2, Duration::ZERO);

        let err = dispatcher.dispatch(request("soundex")).unwrap_err();
        assert_eq!(
            err,
            DispatchError::Validation(ValidationError::UnsupportedAlgorithm(
                "soundex".to_string()
            ))
        );
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_task_ids_are_unique() {
        let broker = LocalBroker::new(16);
        let dispatcher = dispatcher(&broker, 4, Duration::ZERO);

        let ids: HashSet<String> = (0..50)
            .map(|_| dispatcher.dispatch(request("levenshtein")).unwrap().task_id)
            .collect();
        assert_eq!(ids.len(), 50);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_returns_before_task_finishes() {
        let broker = LocalBroker::new(64);
        let mut sub = broker.subscribe(&Topic::for_user(5)).unwrap();
        let dispatcher = dispatcher(&broker, 1, Duration::from_millis(20));

        let handle = dispatcher.dispatch(request("damerau-levenshtein")).unwrap();
        assert_eq!(dispatcher.in_flight(), 1);

        let mut statuses = Vec::new();
        loop {
            let message = sub.recv().await.unwrap();
            let event: NotificationEvent = serde_json::from_str(&message).unwrap();
            assert_eq!(event.task_id, handle.task_id);
            let terminal = event.status().is_terminal();
            statuses.push(event.status());
            if terminal {
                assert!(matches!(event.payload, EventPayload::Completed { .. }));
                break;
            }
        }
        assert_eq!(statuses.len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_and_queued_tasks() {
        let broker = LocalBroker::new(256);
        let mut sub = broker.subscribe(&Topic::for_user(5)).unwrap();
        let dispatcher = dispatcher(&broker, 1, Duration::from_millis(200));

        let first = dispatcher.dispatch(request("levenshtein")).unwrap();
        let second = dispatcher.dispatch(request("levenshtein")).unwrap();

        // Let the first task get picked up before stopping the pool
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.in_flight(), 0);

        let mut failed = HashSet::new();
        while failed.len() < 2 {
            let message = sub.recv().await.unwrap();
            let event: NotificationEvent = serde_json::from_str(&message).unwrap();
            if let EventPayload::Failed { error } = &event.payload {
                assert_eq!(error, "Cancelled");
                failed.insert(event.task_id.clone());
            }
        }
        assert!(failed.contains(&first.task_id));
        assert!(failed.contains(&second.task_id));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_refused() {
        let broker = LocalBroker::new(16);
        let mut sub = broker.subscribe(&Topic::for_user(5)).unwrap();
        let dispatcher = dispatcher(&broker, 2, Duration::ZERO);
        dispatcher.shutdown().await;

        let err = dispatcher.dispatch(request("levenshtein")).unwrap_err();
        assert_eq!(err, DispatchError::ShuttingDown);
        assert_eq!(dispatcher.in_flight(), 0);

        // Nothing was spawned, so nothing is published
        let silent = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(silent.is_err());
    }
}
