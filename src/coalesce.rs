//! Coalescing of rapid channel value updates.
//!
//! The device reports channel values far more often than downstream
//! consumers need them. Values are merged into one pending packet on the
//! link's read path and flushed at most once per tick by a separate task,
//! so the downstream rate is bounded by the tick regardless of how chatty
//! the device is. The pending packet is swapped out under a lock that is
//! never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::event::{Event, EventDispatcher};
use crate::types::{Channel, ConfigPacket};

/// Default flush interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Configuration for the coalescer.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Flush interval.
    pub tick: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { tick: DEFAULT_TICK }
    }
}

impl CoalescerConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flush interval.
    #[must_use]
    pub const fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Accumulates channel values between flushes.
#[derive(Debug, Clone, Default)]
pub struct Coalescer {
    pending: Arc<Mutex<ConfigPacket>>,
}

impl Coalescer {
    /// Creates an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ConfigPacket> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the latest value of one channel.
    pub fn record(&self, channel: Channel, value: u16) {
        self.lock().set_value(channel, value);
    }

    /// Records every value carried by `packet`; other fields are ignored.
    pub fn absorb(&self, packet: &ConfigPacket) {
        let values = packet.values_only();
        if values.is_empty() {
            return;
        }
        self.lock().merge(&values);
    }

    /// Swaps the pending packet for an empty one.
    ///
    /// Returns `None` if no value was recorded since the last call.
    #[must_use]
    pub fn take(&self) -> Option<ConfigPacket> {
        let packet = std::mem::take(&mut *self.lock());
        packet.has_values().then_some(packet)
    }

    /// Spawns the flush task, dispatching one `event_name` event per tick
    /// that has pending values.
    #[must_use]
    pub fn spawn(
        &self,
        tick: Duration,
        dispatcher: EventDispatcher,
        event_name: &'static str,
    ) -> JoinHandle<()> {
        let coalescer = self.clone();
        tokio::spawn(async move { coalescer.run(tick, &dispatcher, event_name).await })
    }

    async fn run(self, tick: Duration, dispatcher: &EventDispatcher, event_name: &str) {
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(packet) = self.take() else {
                continue;
            };
            match Event::with_packet(event_name, &packet) {
                Ok(event) => dispatcher.dispatch(event),
                Err(e) => tracing::warn!("failed to encode coalesced values: {}", e),
            }
        }
    }
}
