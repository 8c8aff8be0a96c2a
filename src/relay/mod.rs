//! Broker relay between paired devices.
//!
//! The relay bridges a fixed set of local event names to the peer device
//! through a publish/subscribe broker. A device plays one [`Role`]; it
//! publishes on the peer's topic namespace (`<peer>/<event>`) and listens on
//! its own (`<role>/<event>`). Events received from the broker re-enter the
//! local bus marked [`Origin::Remote`] and are never forwarded again.
//!
//! Every successful connection starts from a clean slate: all previous
//! subscriptions are dropped and exactly the configured inbound list is
//! subscribed. Lost connections are retried at a fixed interval until the
//! relay is stopped.

mod broker;
mod memory;
mod mqtt;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::event::{Event, EventDispatcher, EventFilter, Origin, Subscription, names};

pub use broker::{Broker, BrokerMessage, WILDCARD_ALL, topic_matches};
pub use memory::{MemoryBroker, MemoryHub};
pub use mqtt::{
    DEFAULT_CLIENT_ID_PREFIX, DEFAULT_KEEP_ALIVE, DEFAULT_PORT, DEFAULT_REQUEST_CAPACITY,
    MqttBroker, MqttConfig, ephemeral_client_id,
};

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Which end of the pair this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The device mounted in the craft, driving the servos.
    Craft,
    /// The handheld device the pilot uses.
    Controller,
}

impl Role {
    /// Returns the peer's role.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Craft => Self::Controller,
            Self::Controller => Self::Craft,
        }
    }

    /// Returns the topic namespace of this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Craft => "craft",
            Self::Controller => "controller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic an outbound event is published on: the peer's namespace.
#[must_use]
pub fn outbound_topic(role: Role, name: &str) -> String {
    format!("{}/{name}", role.opposite())
}

/// Topic an inbound event is received on: this role's namespace.
#[must_use]
pub fn inbound_topic(role: Role, name: &str) -> String {
    format!("{role}/{name}")
}

/// Extracts the event name from a topic in this role's namespace.
#[must_use]
pub fn event_name(role: Role, topic: &str) -> Option<&str> {
    topic
        .strip_prefix(role.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|name| !name.is_empty())
}

/// Connection state of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Not running, or stopped.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and bridging events.
    Connected,
    /// Waiting to retry after a failure or lost connection.
    Reconnecting,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Configuration for a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Role of this device.
    pub role: Role,
    /// Local event names forwarded to the peer.
    pub outbound: Vec<String>,
    /// Event names accepted from the peer.
    pub inbound: Vec<String>,
    /// Delay between reconnect attempts.
    pub retry_interval: Duration,
}

impl RelayConfig {
    /// Creates a configuration with empty event lists.
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            outbound: Vec::new(),
            inbound: Vec::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Default configuration for the craft: telemetry, device state and the
    /// coalesced channel values go out, servo commands come in.
    #[must_use]
    pub fn craft() -> Self {
        Self::new(Role::Craft)
            .outbound(&[
                names::TELEMETRY,
                names::DEVICE_PACKET,
                names::DEVICE_READY,
                names::DEVICE_ERROR,
                names::DEVICE_FAULT,
                names::DEVICE_CONNECTION,
                names::CHANNEL_VALUES,
            ])
            .inbound(&[names::DEVICE_COMMAND])
    }

    /// Default configuration for the controller: the mirror of [`Self::craft`].
    #[must_use]
    pub fn controller() -> Self {
        let craft = Self::craft();
        Self {
            role: Role::Controller,
            outbound: craft.inbound,
            inbound: craft.outbound,
            retry_interval: craft.retry_interval,
        }
    }

    /// Sets the outbound event names.
    #[must_use]
    pub fn outbound(mut self, names: &[&str]) -> Self {
        self.outbound = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    /// Sets the inbound event names.
    #[must_use]
    pub fn inbound(mut self, names: &[&str]) -> Self {
        self.inbound = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    /// Sets the reconnect interval.
    #[must_use]
    pub const fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Topics subscribed on every connection.
    #[must_use]
    pub fn inbound_topics(&self) -> BTreeSet<String> {
        self.inbound
            .iter()
            .map(|name| inbound_topic(self.role, name))
            .collect()
    }
}

type Subscriptions = Arc<Mutex<BTreeSet<String>>>;

fn lock(subscriptions: &Subscriptions) -> MutexGuard<'_, BTreeSet<String>> {
    subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running relay.
///
/// Dropping the handle stops the relay without waiting for it to
/// unsubscribe; use [`Relay::stop`] for an orderly shutdown.
pub struct Relay {
    role: Role,
    state: watch::Receiver<RelayState>,
    subscriptions: Subscriptions,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Relay {
    /// Starts the relay on the current runtime.
    pub fn start<B>(config: RelayConfig, broker: B, dispatcher: EventDispatcher) -> Self
    where
        B: Broker + 'static,
    {
        let (state_tx, state_rx) = watch::channel(RelayState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscriptions = Subscriptions::default();
        let role = config.role;

        let session = Session {
            config,
            broker,
            dispatcher,
            state: state_tx,
            subscriptions: subscriptions.clone(),
            connected: false,
        };
        let task = tokio::spawn(session.run(shutdown_rx));

        Self {
            role,
            state: state_rx,
            subscriptions,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    /// Returns the role of this relay.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Returns true while connected and bridging.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == RelayState::Connected
    }

    /// Returns a receiver for state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    /// Waits until the relay reaches `state`.
    ///
    /// Returns false if the timeout expires first.
    pub async fn wait_for_state(&self, state: RelayState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Returns the topics subscribed in the current session.
    #[must_use]
    pub fn subscriptions(&self) -> BTreeSet<String> {
        lock(&self.subscriptions).clone()
    }

    /// Stops the relay: unsubscribes, disconnects, and waits for the task.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum Exit {
    Shutdown,
    Lost,
}

struct Session<B> {
    config: RelayConfig,
    broker: B,
    dispatcher: EventDispatcher,
    state: watch::Sender<RelayState>,
    subscriptions: Subscriptions,
    connected: bool,
}

impl<B: Broker> Session<B> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let role = self.config.role;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.open() => result,
            };

            match attempt {
                Ok(()) => {
                    tracing::info!("relay connected as {role}");
                    // Subscribe before announcing the connection so replies
                    // to `relay_connection` are bridged
                    let local = self.local_events();
                    self.set_connected(true);
                    match self.bridge(local, &mut shutdown).await {
                        Exit::Shutdown => break,
                        Exit::Lost => {
                            self.state.send_replace(RelayState::Reconnecting);
                            self.set_connected(false);
                        }
                    }
                }
                Err(e) => tracing::warn!("relay connect failed: {e}"),
            }

            self.state.send_replace(RelayState::Reconnecting);
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }

        self.close().await;
    }

    /// Connects and replaces every subscription with the inbound list.
    async fn open(&mut self) -> Result<()> {
        self.broker.connect().await?;

        let stale: Vec<String> = std::mem::take(&mut *lock(&self.subscriptions))
            .into_iter()
            .collect();
        self.broker.unsubscribe(WILDCARD_ALL).await?;
        for topic in &stale {
            self.broker.unsubscribe(topic).await?;
        }

        for topic in self.config.inbound_topics() {
            self.broker.subscribe(&topic).await?;
            tracing::debug!("relay subscribed to {topic}");
            lock(&self.subscriptions).insert(topic);
        }
        Ok(())
    }

    fn local_events(&self) -> Subscription {
        self.dispatcher.subscribe(Some(EventFilter {
            names: Some(self.config.outbound.clone()),
            origin: Some(Origin::Local),
        }))
    }

    /// Forwards events both ways until the connection drops or shutdown.
    async fn bridge(
        &mut self,
        mut local: Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        self.state.send_replace(RelayState::Connected);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Exit::Shutdown,
                message = self.broker.next_message() => match message {
                    Ok(message) => self.deliver(message),
                    Err(e) => {
                        tracing::warn!("relay connection lost: {e}");
                        return Exit::Lost;
                    }
                },
                event = local.recv() => {
                    let Some(event) = event else {
                        return Exit::Shutdown;
                    };
                    if let Err(e) = self.forward(event).await {
                        tracing::warn!("relay publish failed: {e}");
                        return Exit::Lost;
                    }
                }
            }
        }
    }

    fn deliver(&self, message: BrokerMessage) {
        let role = self.config.role;
        let Some(name) = event_name(role, &message.topic) else {
            tracing::debug!("ignoring message on foreign topic {}", message.topic);
            return;
        };
        if !self.config.inbound.iter().any(|n| n == name) {
            tracing::debug!("ignoring unlisted inbound event {name}");
            return;
        }

        let payload = match String::from_utf8(message.payload.to_vec()) {
            Ok(text) if text.is_empty() => None,
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("dropping non-text payload on {}: {e}", message.topic);
                return;
            }
        };

        tracing::trace!("relay received {name}");
        self.dispatcher.dispatch(Event {
            name: name.to_owned(),
            payload,
            origin: Origin::Remote,
        });
    }

    async fn forward(&mut self, event: Event) -> Result<()> {
        let topic = outbound_topic(self.config.role, &event.name);
        let payload = event.payload.map(Bytes::from).unwrap_or_default();
        tracing::trace!("relay publishing {topic}");
        self.broker.publish(&topic, payload).await
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.dispatcher
                .dispatch(Event::connection(names::RELAY_CONNECTION, connected));
        }
    }

    async fn close(&mut self) {
        if self.connected {
            let topics = std::mem::take(&mut *lock(&self.subscriptions));
            for topic in &topics {
                if let Err(e) = self.broker.unsubscribe(topic).await {
                    tracing::debug!("unsubscribe {topic} on shutdown failed: {e}");
                }
            }
            if let Err(e) = self.broker.disconnect().await {
                tracing::debug!("disconnect on shutdown failed: {e}");
            }
            self.set_connected(false);
        } else {
            lock(&self.subscriptions).clear();
            let _ = self.broker.disconnect().await;
        }
        self.state.send_replace(RelayState::Disconnected);
        tracing::info!("relay stopped");
    }
}
