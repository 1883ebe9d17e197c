use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Topic};
use crate::distance::{rank, Algorithm, RankedWord, MAX_RESULTS};
use crate::errors::TaskError;
use crate::events::{EventPayload, NotificationEvent, TaskStatus};

/// A token-count interval at which the scan reports progress.
pub const PROGRESS_STEP: usize = 10;

/// One fuzzy-search job. The corpus is a snapshot taken at submission.
#[derive(Debug, Clone)]
pub struct SearchTask {
    pub id: String,
    pub owner_id: i64,
    pub word: String,
    pub algorithm: Algorithm,
    pub corpus_text: Arc<str>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl SearchTask {
    pub fn new(owner_id: i64, word: String, algorithm: Algorithm, corpus_text: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            word,
            algorithm,
            corpus_text: Arc::from(corpus_text),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
        }
    }
}

/// Percent to report after `processed` of `total` tokens, if this token is a
/// reporting point: every [`PROGRESS_STEP`] tokens and always on the last one.
pub fn progress_checkpoint(processed: usize, total: usize) -> Option<u8> {
    if total == 0 || processed == 0 || processed > total {
        return None;
    }
    if processed % PROGRESS_STEP == 0 || processed == total {
        Some((processed * 100 / total) as u8)
    } else {
        None
    }
}

/// Runs a single task from pickup to a terminal state, publishing every
/// lifecycle event to the owner's topic in order.
pub struct TaskWorker {
    broker: Arc<dyn Broker>,
    scan_delay: Duration,
    cancel: CancellationToken,
}

impl TaskWorker {
    pub fn new(broker: Arc<dyn Broker>, scan_delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            broker,
            scan_delay,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn run(&self, mut task: SearchTask) -> SearchTask {
        tracing::info!(
            "Task {} started for user {} (word={}, algorithm={})",
            task.id,
            task.owner_id,
            task.word,
            task.algorithm
        );

        task.status = TaskStatus::Started;
        self.emit(
            &task,
            EventPayload::Started {
                word: task.word.clone(),
                algorithm: task.algorithm,
            },
        );

        match self.scan_and_rank(&mut task).await {
            Ok((execution_time, results)) => {
                task.status = TaskStatus::Completed;
                tracing::info!(
                    "Task {} completed in {:.6}s with {} results",
                    task.id,
                    execution_time,
                    results.len()
                );
                self.emit(
                    &task,
                    EventPayload::Completed {
                        execution_time,
                        results,
                    },
                );
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                tracing::error!("Task {} failed: {}", task.id, error);
                self.emit(
                    &task,
                    EventPayload::Failed {
                        error: error.to_string(),
                    },
                );
            }
        }

        task
    }

    async fn scan_and_rank(
        &self,
        task: &mut SearchTask,
    ) -> Result<(f64, Vec<RankedWord>), TaskError> {
        let total = task.corpus_text.split_whitespace().count();
        if total == 0 {
            return Err(TaskError::WorkerFailure(
                "Corpus contains no words".to_string(),
            ));
        }

        task.status = TaskStatus::Running;
        for processed in 1..=total {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if !self.scan_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
                    _ = tokio::time::sleep(self.scan_delay) => {}
                }
            }

            if let Some(progress) = progress_checkpoint(processed, total) {
                self.emit(
                    task,
                    EventPayload::Progress {
                        progress,
                        current_word: format!("processing word {}/{}", processed, total),
                    },
                );
            }
        }

        let word = task.word.clone();
        let corpus = Arc::clone(&task.corpus_text);
        let algorithm = task.algorithm;

        let started = Instant::now();
        let results = tokio::task::spawn_blocking(move || {
            let mut ranked = rank(&word, &corpus, algorithm);
            ranked.truncate(MAX_RESULTS);
            ranked
        })
        .await
        .map_err(|e| TaskError::WorkerFailure(format!("Ranking aborted: {}", e)))?;
        let execution_time = started.elapsed().as_secs_f64();

        Ok((execution_time, results))
    }

    fn emit(&self, task: &SearchTask, payload: EventPayload) {
        let event = NotificationEvent::new(&task.id, payload);
        match event.to_json() {
            Ok(message) => {
                tracing::debug!("Task {} -> {:?}", task.id, event.status());
                self.broker.publish(&Topic::for_user(task.owner_id), message);
            }
            Err(e) => tracing::error!("Failed to encode event for task {}: {}", task.id, e),
        }
    }
}
