//! In-process broker.
//!
//! [`MemoryHub`] plays the broker; each [`MemoryBroker`] is one client of
//! it. Two relays sharing a hub talk to each other exactly as they would
//! through a real broker, and the hub can be taken offline or made to drop
//! every session to exercise reconnects.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::relay::broker::{Broker, BrokerMessage, topic_matches};

type Delivery = Result<BrokerMessage>;

struct Session {
    subscriptions: BTreeSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct HubState {
    online: bool,
    next_id: u64,
    sessions: HashMap<u64, Session>,
}

/// Shared in-memory broker.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    /// Creates an online hub with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                online: true,
                next_id: 1,
                sessions: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a new client of this hub.
    #[must_use]
    pub fn client(&self) -> MemoryBroker {
        MemoryBroker {
            hub: self.clone(),
            session: None,
            rx: None,
        }
    }

    /// Takes the hub on- or offline. Connects fail while offline.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Ends every session as if the network dropped.
    pub fn drop_sessions(&self) {
        let sessions = std::mem::take(&mut self.lock().sessions);
        for session in sessions.into_values() {
            let _ = session.tx.send(Err(Error::Broker {
                message: "connection lost".into(),
            }));
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Subscriptions of every live session, ordered by session age.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<BTreeSet<String>> {
        let state = self.lock();
        let mut ids: Vec<_> = state.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .map(|id| state.sessions[id].subscriptions.clone())
            .collect()
    }

    fn publish(&self, topic: &str, payload: &Bytes) {
        let state = self.lock();
        for session in state.sessions.values() {
            if session
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, topic))
            {
                let _ = session.tx.send(Ok(BrokerMessage {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                }));
            }
        }
    }
}

/// One client session on a [`MemoryHub`].
pub struct MemoryBroker {
    hub: MemoryHub,
    session: Option<u64>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl MemoryBroker {
    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let id = self.session.ok_or(Error::NotConnected)?;
        let mut state = self.hub.lock();
        let session = state.sessions.get_mut(&id).ok_or(Error::NotConnected)?;
        Ok(f(session))
    }

    fn end_session(&mut self) {
        if let Some(id) = self.session.take() {
            self.hub.lock().sessions.remove(&id);
        }
        self.rx = None;
    }
}

impl Broker for MemoryBroker {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.end_session();

            let mut state = self.hub.lock();
            if !state.online {
                return Err(Error::Broker {
                    message: "broker unreachable".into(),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            state.sessions.insert(
                id,
                Session {
                    subscriptions: BTreeSet::new(),
                    tx,
                },
            );
            drop(state);

            self.session = Some(id);
            self.rx = Some(rx);
            Ok(())
        })
    }

    fn subscribe(&mut self, topic: &str) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_owned();
        Box::pin(async move {
            self.with_session(|s| {
                s.subscriptions.insert(topic);
            })
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_owned();
        Box::pin(async move {
            self.with_session(|s| {
                s.subscriptions.remove(&topic);
            })
        })
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_owned();
        Box::pin(async move {
            self.with_session(|_| ())?;
            self.hub.publish(&topic, &payload);
            Ok(())
        })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<BrokerMessage>> {
        Box::pin(async move {
            let rx = self.rx.as_mut().ok_or(Error::NotConnected)?;
            match rx.recv().await {
                Some(delivery) => delivery,
                None => Err(Error::ChannelClosed),
            }
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.end_session();
            Ok(())
        })
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.end_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_only() {
        let hub = MemoryHub::new();
        let mut a = hub.client();
        let mut b = hub.client();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        b.subscribe("controller/x").await.unwrap();
        a.publish("controller/x", Bytes::from_static(b"1"))
            .await
            .unwrap();
        a.publish("craft/x", Bytes::from_static(b"2")).await.unwrap();

        let msg = b.next_message().await.unwrap();
        assert_eq!(msg.topic, "controller/x");
        assert_eq!(msg.payload, Bytes::from_static(b"1"));
        assert_eq!(hub.session_count(), 2);
    }

    #[tokio::test]
    async fn test_offline_hub_refuses_connect() {
        let hub = MemoryHub::new();
        hub.set_online(false);
        let mut client = hub.client();
        assert!(client.connect().await.is_err());
        assert!(matches!(
            client.subscribe("x").await,
            Err(Error::NotConnected)
        ));

        hub.set_online(true);
        client.connect().await.unwrap();
        client.subscribe("x").await.unwrap();
        assert_eq!(hub.subscriptions(), vec![BTreeSet::from(["x".to_owned()])]);
    }

    #[tokio::test]
    async fn test_drop_sessions_fails_pending_receive() {
        let hub = MemoryHub::new();
        let mut client = hub.client();
        client.connect().await.unwrap();

        hub.drop_sessions();
        assert!(client.next_message().await.is_err());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_starts_clean_session() {
        let hub = MemoryHub::new();
        let mut client = hub.client();
        client.connect().await.unwrap();
        client.subscribe("a").await.unwrap();

        client.connect().await.unwrap();
        assert_eq!(hub.session_count(), 1);
        assert_eq!(hub.subscriptions(), vec![BTreeSet::new()]);

        drop(client);
        assert_eq!(hub.session_count(), 0);
    }
}
