//! Local event bus.
//!
//! Components never call each other directly: the device link, coalescer,
//! relay and stabilizer each hold a clone of one [`EventDispatcher`] and
//! exchange named [`Event`]s carrying an optional text payload. The relay
//! forwards selected names to the peer device, so payloads are plain text
//! (usually a serialized packet) rather than Rust values.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::types::ConfigPacket;

/// Well-known event names.
pub mod names {
    /// Serial link connected/disconnected (`true`/`false` payload).
    pub const DEVICE_CONNECTION: &str = "device_connection";
    /// Relay connected/disconnected (`true`/`false` payload).
    pub const RELAY_CONNECTION: &str = "relay_connection";
    /// Configuration packet to write to the device.
    pub const DEVICE_COMMAND: &str = "device_command";
    /// Configuration content received from the device.
    pub const DEVICE_PACKET: &str = "device_packet";
    /// Device reported `ready`.
    pub const DEVICE_READY: &str = "device_ready";
    /// Device reported an error; payload is the message as a JSON string.
    pub const DEVICE_ERROR: &str = "device_error";
    /// The link stopped working; payload is the reason as a JSON string.
    pub const DEVICE_FAULT: &str = "device_fault";
    /// Coalesced channel values from the device.
    pub const CHANNEL_VALUES: &str = "channel_values";
    /// Telemetry packet from the craft sensors.
    pub const TELEMETRY: &str = "telemetry";
}

/// Where an event entered this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Origin {
    /// Produced by a component in this process.
    #[default]
    Local,
    /// Delivered by the relay from the peer device.
    Remote,
}

/// A named event with an optional text payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Optional structured-text payload.
    pub payload: Option<String>,
    /// Where the event came from.
    pub origin: Origin,
}

impl Event {
    /// Creates a local event without payload.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
            origin: Origin::Local,
        }
    }

    /// Creates a local event with a text payload.
    #[must_use]
    pub fn with_payload(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::new(name)
        }
    }

    /// Creates a local event whose payload is `value` as JSON.
    pub fn with_json<T: Serialize>(name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::with_payload(name, serde_json::to_string(value)?))
    }

    /// Creates a local event carrying a configuration packet.
    pub fn with_packet(name: impl Into<String>, packet: &ConfigPacket) -> Result<Self> {
        Ok(Self::with_payload(name, packet.to_text()?))
    }

    /// Creates a connection-state event.
    #[must_use]
    pub fn connection(name: impl Into<String>, connected: bool) -> Self {
        Self::with_payload(name, connected.to_string())
    }

    /// Marks the event as delivered from the peer.
    #[must_use]
    pub fn into_remote(mut self) -> Self {
        self.origin = Origin::Remote;
        self
    }

    /// Returns true if the event has the given name.
    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Decodes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .as_deref()
            .ok_or(Error::MissingField { field: "payload" })?;
        Ok(serde_json::from_str(payload)?)
    }

    /// Decodes the payload as a configuration packet.
    pub fn packet(&self) -> Result<ConfigPacket> {
        self.decode()
    }
}

/// Subscription filter for specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event names.
    pub names: Option<Vec<String>>,
    /// Filter by origin.
    pub origin: Option<Origin>,
}

impl EventFilter {
    /// Creates a filter for one event name.
    #[must_use]
    pub fn name(name: &str) -> Self {
        Self::names(&[name])
    }

    /// Creates a filter for several event names.
    #[must_use]
    pub fn names(names: &[&str]) -> Self {
        Self {
            names: Some(names.iter().map(|n| (*n).to_owned()).collect()),
            origin: None,
        }
    }

    /// Restricts the filter to one origin.
    #[must_use]
    pub const fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref names) = self.names {
            if !names.iter().any(|n| *n == event.name) {
                return false;
            }
        }

        if let Some(origin) = self.origin {
            if event.origin != origin {
                return false;
            }
        }

        true
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Receives the next matching event.
    ///
    /// Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event that is already queued, without
    /// waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged, {} events skipped", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Default broadcast buffer size.
pub const DEFAULT_CAPACITY: usize = 256;

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        tracing::trace!("dispatching {}", event.name);
        // No receivers is fine
        let _ = self.inner.sender.send(event);
    }

    /// Dispatches a local event with an optional payload.
    pub fn send(&self, name: &str, payload: Option<String>) {
        self.dispatch(Event {
            payload,
            ..Event::new(name)
        });
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter: filter.unwrap_or_default(),
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        timeout: std::time::Duration,
    ) -> Option<Event> {
        let mut subscription = self.subscribe(Some(filter));
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}
