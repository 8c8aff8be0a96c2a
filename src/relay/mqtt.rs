//! MQTT broker client built on `rumqttc`.
//!
//! Each [`Broker::connect`] builds a new client with a fresh ephemeral
//! identity and a clean session. The `rumqttc` event loop is driven by a
//! background task that forwards publishes into a channel, so
//! [`Broker::next_message`] stays cancel-safe.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::relay::broker::{Broker, BrokerMessage};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Default prefix for generated client identifiers.
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "servolink";

/// Default request queue capacity of the MQTT client.
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Configuration for [`MqttBroker`].
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Prefix of the per-session client identifier.
    pub client_id_prefix: String,
    /// Request queue capacity.
    pub capacity: usize,
}

impl MqttConfig {
    /// Creates a configuration for the given host with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            client_id_prefix: DEFAULT_CLIENT_ID_PREFIX.into(),
            capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub const fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the client identifier prefix.
    #[must_use]
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = prefix.into();
        self
    }

    /// Sets the request queue capacity.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Generates an ephemeral client identifier: the prefix followed by hex of
/// the current time and a process-wide session counter.
#[must_use]
pub fn ephemeral_client_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos() ^ (d.as_secs() as u32));
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&nanos.to_be_bytes());
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    format!("{prefix}-{}", hex::encode(bytes))
}

struct Session {
    client: AsyncClient,
    rx: mpsc::UnboundedReceiver<Result<BrokerMessage>>,
    poller: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// [`Broker`] backed by an MQTT 3.1.1 connection.
pub struct MqttBroker {
    config: MqttConfig,
    session: Option<Session>,
}

impl MqttBroker {
    /// Creates a broker client. Nothing is opened until `connect`.
    #[must_use]
    pub const fn new(config: MqttConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.session
            .as_ref()
            .map(|s| &s.client)
            .ok_or(Error::NotConnected)
    }
}

/// Polls until the broker accepts the connection.
async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await? {
            MqttEvent::Incoming(Packet::ConnAck(ack)) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(Error::Broker {
                        message: format!("connection refused: {:?}", ack.code),
                    })
                };
            }
            other => tracing::trace!("mqtt pre-connect event: {other:?}"),
        }
    }
}

async fn poll_loop(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<Result<BrokerMessage>>) {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if tx.send(Ok(message)).is_err() {
                    break;
                }
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                let _ = tx.send(Err(Error::Broker {
                    message: "broker closed the session".into(),
                }));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("mqtt event loop ended: {e}");
                let _ = tx.send(Err(e.into()));
                break;
            }
        }
    }
}

impl Broker for MqttBroker {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.session = None;

            let client_id = ephemeral_client_id(&self.config.client_id_prefix);
            let mut options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
            options.set_keep_alive(self.config.keep_alive);
            options.set_clean_session(true);

            tracing::info!(
                "connecting to mqtt broker {}:{} as {client_id}",
                self.config.host,
                self.config.port
            );
            let (client, mut eventloop) = AsyncClient::new(options, self.config.capacity);
            await_connack(&mut eventloop).await?;

            let (tx, rx) = mpsc::unbounded_channel();
            let poller = tokio::spawn(poll_loop(eventloop, tx));
            self.session = Some(Session { client, rx, poller });
            Ok(())
        })
    }

    fn subscribe(&mut self, topic: &str) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_owned();
        Box::pin(async move {
            self.client()?.subscribe(topic, QoS::AtLeastOnce).await?;
            Ok(())
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_owned();
        Box::pin(async move {
            self.client()?.unsubscribe(topic).await?;
            Ok(())
        })
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_owned();
        Box::pin(async move {
            self.client()?
                .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
                .await?;
            Ok(())
        })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<BrokerMessage>> {
        Box::pin(async move {
            let session = self.session.as_mut().ok_or(Error::NotConnected)?;
            match session.rx.recv().await {
                Some(message) => message,
                None => Err(Error::ChannelClosed),
            }
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(session) = self.session.take() {
                session.client.disconnect().await?;
                // Give the event loop a moment to flush the DISCONNECT
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MqttConfig::new("broker.local")
            .port(1884)
            .keep_alive(Duration::from_secs(30))
            .client_id_prefix("bench")
            .capacity(8);
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1884);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert_eq!(config.client_id_prefix, "bench");
        assert_eq!(config.capacity, 8);
    }

    #[test]
    fn test_config_defaults() {
        let config = MqttConfig::new("localhost");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
        assert_eq!(config.client_id_prefix, DEFAULT_CLIENT_ID_PREFIX);
    }

    #[test]
    fn test_ephemeral_client_ids_are_unique() {
        let a = ephemeral_client_id("craft");
        let b = ephemeral_client_id("craft");
        assert!(a.starts_with("craft-"));
        assert_eq!(a.len(), "craft-".len() + 16);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let mut broker = MqttBroker::new(MqttConfig::new("localhost"));
        assert!(matches!(
            broker.subscribe("x").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            broker.publish("x", Bytes::new()).await,
            Err(Error::NotConnected)
        ));
        assert!(broker.disconnect().await.is_ok());
    }
}
