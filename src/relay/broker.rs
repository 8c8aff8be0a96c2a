//! Broker abstraction used by the relay.

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;

/// Topic filter matching every topic.
pub const WILDCARD_ALL: &str = "#";

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Trait for publish/subscribe broker clients.
///
/// A broker value represents one session at a time: `connect` starts a
/// fresh session (with a fresh client identity) and drops whatever the
/// previous one held.
pub trait Broker: Send {
    /// Starts a new session.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Subscribes the current session to a topic filter.
    fn subscribe(&mut self, topic: &str) -> BoxFuture<'_, Result<()>>;

    /// Removes a topic filter from the current session.
    fn unsubscribe(&mut self, topic: &str) -> BoxFuture<'_, Result<()>>;

    /// Publishes a payload.
    fn publish(&mut self, topic: &str, payload: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Waits for the next inbound message.
    ///
    /// An error means the session is lost. Must be cancel-safe.
    fn next_message(&mut self) -> BoxFuture<'_, Result<BrokerMessage>>;

    /// Ends the current session.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Checks an MQTT-style topic filter (`+` single level, `#` trailing
/// multi-level) against a topic.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (expected, Some(actual)) if expected == actual => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}
