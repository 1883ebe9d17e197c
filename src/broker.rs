//! Per-user publish/subscribe.
//!
//! Publishing is fire-and-forget and at-most-once: a message published to a
//! topic nobody listens on is gone. A [`Subscription`] detaches itself from
//! its topic when dropped, so whoever holds one cannot leak it on an error
//! path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::errors::TransportError;

/// Logical channel shared by every task of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn for_user(user_id: i64) -> Self {
        Topic(format!("ws_notifications:{}", user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Broker: Send + Sync {
    /// Deliver `message` to whoever is subscribed to `topic` right now.
    fn publish(&self, topic: &Topic, message: String);

    fn subscribe(&self, topic: &Topic) -> Result<Subscription, TransportError>;
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Live receive handle on one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    rx: Option<broadcast::Receiver<String>>,
    release: Option<Release>,
}

impl Subscription {
    pub fn new(topic: Topic, rx: broadcast::Receiver<String>, release: Release) -> Self {
        Self {
            topic,
            rx: Some(rx),
            release: Some(release),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next message on the topic.
    ///
    /// A receiver that falls behind skips what it missed; there is no
    /// redelivery. Returns `BrokerUnavailable` once the topic is closed.
    pub async fn recv(&mut self) -> Result<String, TransportError> {
        let rx = self.rx.as_mut().ok_or(TransportError::BrokerUnavailable)?;
        loop {
            match rx.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Subscriber on {} lagged, {} messages lost",
                        self.topic,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransportError::BrokerUnavailable);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver has to go first so the release hook sees the new count
        drop(self.rx.take());
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("topic", &self.topic).finish()
    }
}

type TopicMap = HashMap<Topic, broadcast::Sender<String>>;

/// In-process broker: one broadcast channel per topic that has listeners.
#[derive(Clone)]
pub struct LocalBroker {
    topics: Arc<Mutex<TopicMap>>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        lock_topics(&self.topics)
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        lock_topics(&self.topics).len()
    }

    /// Refuse new subscribers and close every open topic.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut topics = lock_topics(&self.topics);
            topics.drain().count()
        };
        tracing::info!("Broker shut down, closed {} topics", dropped);
    }
}

fn lock_topics(topics: &Mutex<TopicMap>) -> MutexGuard<'_, TopicMap> {
    // Map operations cannot leave it half-updated, so a poisoned lock is still usable
    topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Broker for LocalBroker {
    fn publish(&self, topic: &Topic, message: String) {
        let sender = lock_topics(&self.topics).get(topic).cloned();
        match sender {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::debug!("No live subscriber on {}, message dropped", topic);
                }
            }
            None => tracing::debug!("No subscriber on {}, message dropped", topic),
        }
    }

    fn subscribe(&self, topic: &Topic) -> Result<Subscription, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::BrokerUnavailable);
        }

        let rx = {
            let mut topics = lock_topics(&self.topics);
            topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let topics = Arc::clone(&self.topics);
        let key = topic.clone();
        let release: Release = Box::new(move || {
            let mut topics = lock_topics(&topics);
            let idle = topics
                .get(&key)
                .map(|tx| tx.receiver_count() == 0)
                .unwrap_or(false);
            if idle {
                topics.remove(&key);
                tracing::debug!("Topic {} has no subscribers left, removed", key);
            }
        });

        tracing::debug!("Subscribed to {}", topic);
        Ok(Subscription::new(topic.clone(), rx, release))
    }
}
