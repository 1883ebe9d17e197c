//! Per-connection relay from a user's broker topic to their client.
//!
//! A gateway subscribes when the connection is accepted and runs a single
//! cooperative loop that wakes on whichever comes first: a broker message,
//! the heartbeat timer, a frame from the client, or server shutdown. Nothing
//! is buffered for absent clients and nothing is replayed on reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Subscription, Topic};
use crate::errors::TransportError;

/// Liveness heartbeat text. Clients ignore anything that is not a JSON event.
pub const HEARTBEAT_MESSAGE: &str = "ping";

/// What a client may send: acknowledgements, or a request to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Pong,
    Close,
}

/// The duplex connection a gateway writes to.
#[async_trait]
pub trait ClientChannel: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next frame from the client; `None` once the connection is gone.
    async fn next_frame(&mut self) -> Option<Result<ClientFrame, TransportError>>;

    async fn close(&mut self);
}

#[async_trait]
impl ClientChannel for WebSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text))
            .await
            .map_err(|_| TransportError::ConnectionDropped)
    }

    async fn next_frame(&mut self) -> Option<Result<ClientFrame, TransportError>> {
        loop {
            let frame = match self.recv().await? {
                Ok(Message::Text(text)) => ClientFrame::Text(text),
                Ok(Message::Pong(_)) => ClientFrame::Pong,
                Ok(Message::Close(_)) => ClientFrame::Close,
                // axum answers protocol pings itself
                Ok(Message::Ping(_)) | Ok(Message::Binary(_)) => continue,
                Err(_) => return Some(Err(TransportError::ConnectionDropped)),
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) {
        let _ = self.send(Message::Close(None)).await;
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub heartbeat_interval: Duration,
    pub resubscribe_attempts: u32,
    pub resubscribe_delay: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            resubscribe_attempts: 3,
            resubscribe_delay: Duration::from_millis(500),
        }
    }
}

pub struct NotificationGateway {
    broker: Arc<dyn Broker>,
    user_id: i64,
    settings: GatewaySettings,
    shutdown: CancellationToken,
}

impl NotificationGateway {
    pub fn new(
        broker: Arc<dyn Broker>,
        user_id: i64,
        settings: GatewaySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            user_id,
            settings,
            shutdown,
        }
    }

    /// Serve `client` until it disconnects, the transport fails, or the
    /// server shuts down. The client is closed and the subscription dropped
    /// on every exit path.
    pub async fn run<C: ClientChannel>(self, mut client: C) -> Result<(), TransportError> {
        let topic = Topic::for_user(self.user_id);
        let subscription = match self.broker.subscribe(&topic) {
            Ok(sub) => sub,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };
        tracing::info!("Gateway connected for user {} on {}", self.user_id, topic);

        let outcome = self.relay(subscription, &mut client).await;
        client.close().await;

        match &outcome {
            Ok(()) => tracing::info!("Gateway for user {} closed", self.user_id),
            Err(e) => tracing::warn!("Gateway for user {} ended: {}", self.user_id, e),
        }
        outcome
    }

    async fn relay<C: ClientChannel>(
        &self,
        mut subscription: Subscription,
        client: &mut C,
    ) -> Result<(), TransportError> {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),

                received = subscription.recv() => match received {
                    Ok(message) => {
                        tracing::debug!("Relaying to user {}: {}", self.user_id, message);
                        client.send_text(message).await?;
                    }
                    Err(TransportError::BrokerUnavailable) => {
                        subscription = self.reattach(subscription.topic().clone()).await?;
                    }
                    Err(e) => return Err(e),
                },

                _ = heartbeat.tick() => {
                    client.send_text(HEARTBEAT_MESSAGE.to_string()).await?;
                }

                frame = client.next_frame() => match frame {
                    None | Some(Ok(ClientFrame::Close)) => return Ok(()),
                    Some(Ok(ClientFrame::Pong)) | Some(Ok(ClientFrame::Text(_))) => {
                        tracing::trace!("Acknowledgement from user {}", self.user_id);
                    }
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    async fn reattach(&self, topic: Topic) -> Result<Subscription, TransportError> {
        for attempt in 1..=self.settings.resubscribe_attempts {
            tracing::warn!(
                "Broker subscription for {} lost, reattaching (attempt {})",
                topic,
                attempt
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TransportError::BrokerUnavailable),
                _ = tokio::time::sleep(self.settings.resubscribe_delay) => {}
            }
            if let Ok(subscription) = self.broker.subscribe(&topic) {
                return Ok(subscription);
            }
        }
        Err(TransportError::BrokerUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use tokio::sync::mpsc;

    struct FakeClient {
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<ClientFrame>,
        fail_sends: bool,
    }

    #[async_trait]
    impl ClientChannel for FakeClient {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::ConnectionDropped);
            }
            self.outgoing
                .send(text)
                .map_err(|_| TransportError::ConnectionDropped)
        }

        async fn next_frame(&mut self) -> Option<Result<ClientFrame, TransportError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) {}
    }

    fn fake_client(
        fail_sends: bool,
    ) -> (
        FakeClient,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<ClientFrame>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            FakeClient {
                outgoing: out_tx,
                incoming: in_rx,
                fail_sends,
            },
            out_rx,
            in_tx,
        )
    }

    fn settings(heartbeat_ms: u64) -> GatewaySettings {
        GatewaySettings {
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            resubscribe_attempts: 2,
            resubscribe_delay: Duration::from_millis(10),
        }
    }

    async fn wait_for_subscribers(broker: &LocalBroker, topic: &Topic, count: usize) {
        for _ in 0..200 {
            if broker.subscriber_count(topic) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("topic {} never reached {} subscribers", topic, count);
    }

    #[tokio::test]
    async fn test_relays_messages_verbatim_and_unsubscribes_on_close() {
        let broker = LocalBroker::new(16);
        let topic = Topic::for_user(1);
        let (client, mut sent, frames) = fake_client(false);
        let gateway = NotificationGateway::new(
            Arc::new(broker.clone()),
            1,
            settings(60_000),
            CancellationToken::new(),
        );
        let running = tokio::spawn(gateway.run(client));

        wait_for_subscribers(&broker, &topic, 1).await;
        broker.publish(&topic, r#"{"status":"STARTED"}"#.to_string());
        assert_eq!(sent.recv().await.unwrap(), r#"{"status":"STARTED"}"#);

        frames.send(ClientFrame::Close).unwrap();
        assert_eq!(running.await.unwrap(), Ok(()));
        assert_eq!(broker.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_sends_heartbeats_without_traffic() {
        let broker = LocalBroker::new(16);
        let (client, mut sent, _frames) = fake_client(false);
        let shutdown = CancellationToken::new();
        let gateway =
            NotificationGateway::new(Arc::new(broker.clone()), 2, settings(20), shutdown.clone());
        let running = tokio::spawn(gateway.run(client));

        for _ in 0..3 {
            assert_eq!(sent.recv().await.unwrap(), HEARTBEAT_MESSAGE);
        }

        shutdown.cancel();
        assert_eq!(running.await.unwrap(), Ok(()));
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_acknowledgements_do_not_end_session() {
        let broker = LocalBroker::new(16);
        let topic = Topic::for_user(3);
        let (client, mut sent, frames) = fake_client(false);
        let gateway = NotificationGateway::new(
            Arc::new(broker.clone()),
            3,
            settings(60_000),
            CancellationToken::new(),
        );
        let running = tokio::spawn(gateway.run(client));
        wait_for_subscribers(&broker, &topic, 1).await;

        frames.send(ClientFrame::Pong).unwrap();
        frames.send(ClientFrame::Text("pong".to_string())).unwrap();
        broker.publish(&topic, "after-ack".to_string());
        assert_eq!(sent.recv().await.unwrap(), "after-ack");

        drop(frames);
        assert_eq!(running.await.unwrap(), Ok(()));
        assert_eq!(broker.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_send_failure_releases_subscription() {
        let broker = LocalBroker::new(16);
        let topic = Topic::for_user(4);
        let (client, _sent, _frames) = fake_client(true);
        let gateway = NotificationGateway::new(
            Arc::new(broker.clone()),
            4,
            settings(60_000),
            CancellationToken::new(),
        );
        let running = tokio::spawn(gateway.run(client));
        wait_for_subscribers(&broker, &topic, 1).await;

        broker.publish(&topic, "boom".to_string());
        assert_eq!(running.await.unwrap(), Err(TransportError::ConnectionDropped));
        assert_eq!(broker.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_broker_shutdown_ends_after_reattach_attempts() {
        let broker = LocalBroker::new(16);
        let topic = Topic::for_user(5);
        let (client, _sent, _frames) = fake_client(false);
        let gateway = NotificationGateway::new(
            Arc::new(broker.clone()),
            5,
            settings(60_000),
            CancellationToken::new(),
        );
        let running = tokio::spawn(gateway.run(client));
        wait_for_subscribers(&broker, &topic, 1).await;

        broker.shutdown();
        assert_eq!(running.await.unwrap(), Err(TransportError::BrokerUnavailable));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let broker = LocalBroker::new(16);
        broker.shutdown();
        let (client, _sent, _frames) = fake_client(false);
        let gateway = NotificationGateway::new(
            Arc::new(broker),
            6,
            settings(60_000),
            CancellationToken::new(),
        );
        assert_eq!(gateway.run(client).await, Err(TransportError::BrokerUnavailable));
    }
}
