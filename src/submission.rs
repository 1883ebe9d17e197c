use serde::{Deserialize, Serialize};

use crate::corpus::CorpusStore;
use crate::dispatcher::{SearchRequest, TaskDispatcher};
use crate::distance::Algorithm;
use crate::errors::{NotFoundError, SubmitError};

pub const SUBMITTED_MESSAGE: &str =
    "Search task started. Connect to WebSocket to receive updates.";

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub word: String,
    pub algorithm: String,
    pub corpus_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub message: String,
}

/// Validate a search for an already authenticated caller, resolve its
/// corpus and hand it to the dispatcher. Results only ever travel over the
/// caller's notification stream.
pub fn submit(
    dispatcher: &TaskDispatcher,
    corpora: &dyn CorpusStore,
    requester_id: i64,
    request: SubmitRequest,
) -> Result<SubmitResponse, SubmitError> {
    // Reject a bad selector before touching storage
    request.algorithm.parse::<Algorithm>()?;

    let corpus = corpora
        .fetch_corpus(request.corpus_id)?
        .ok_or(NotFoundError::CorpusNotFound(request.corpus_id))?;

    let handle = dispatcher.dispatch(SearchRequest {
        requester_id,
        word: request.word,
        algorithm: request.algorithm,
        corpus_text: corpus.text,
    })?;

    Ok(SubmitResponse {
        task_id: handle.task_id,
        message: SUBMITTED_MESSAGE.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::corpus::Corpus;
    use crate::dispatcher::PoolSettings;
    use crate::errors::{StoreError, ValidationError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct OneCorpus {
        lookups: AtomicUsize,
    }

    impl CorpusStore for OneCorpus {
        fn fetch_corpus(&self, corpus_id: i64) -> Result<Option<Corpus>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok((corpus_id == 1).then(|| Corpus {
                id: 1,
                name: "sample".to_string(),
                text: "test tent text".to_string(),
            }))
        }
    }

    fn dispatcher() -> TaskDispatcher {
        TaskDispatcher::new(
            Arc::new(LocalBroker::new(16)),
            PoolSettings {
                pool_size: 1,
                scan_delay: Duration::ZERO,
            },
        )
    }

    fn request(algorithm: &str, corpus_id: i64) -> SubmitRequest {
        SubmitRequest {
            word: "test".to_string(),
            algorithm: algorithm.to_string(),
            corpus_id,
        }
    }

    #[tokio::test]
    async fn test_unsupported_algorithm_skips_corpus_lookup() {
        let store = OneCorpus::default();
        let err = submit(&dispatcher(), &store, 1, request("jaro", 1)).unwrap_err();

        assert!(matches!(
            err,
            SubmitError::Validation(ValidationError::UnsupportedAlgorithm(ref a)) if a == "jaro"
        ));
        assert_eq!(err.reason(), "UnsupportedAlgorithm");
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_corpus() {
        let store = OneCorpus::default();
        let err = submit(&dispatcher(), &store, 1, request("levenshtein", 99)).unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(NotFoundError::CorpusNotFound(99))));
        assert_eq!(err.reason(), "CorpusNotFound");
    }

    #[tokio::test]
    async fn test_accepted_submission_returns_task_id() {
        let store = OneCorpus::default();
        let response = submit(&dispatcher(), &store, 1, request("damerau-levenshtein", 1)).unwrap();
        assert!(uuid::Uuid::parse_str(&response.task_id).is_ok());
        assert_eq!(response.message, SUBMITTED_MESSAGE);
    }

    #[tokio::test]
    async fn test_submission_refused_while_shutting_down() {
        let store = OneCorpus::default();
        let dispatcher = dispatcher();
        dispatcher.shutdown().await;

        let err = submit(&dispatcher, &store, 1, request("levenshtein", 1)).unwrap_err();
        assert!(matches!(err, SubmitError::ShuttingDown));
        assert_eq!(err.reason(), "ShuttingDown");
    }
}
