//! Command handlers for device operations.
//!
//! Commands are `device_command` events on the local bus. On the craft the
//! device link writes them to the board; on the controller the relay
//! carries them to the craft. Either way the handler does not care which
//! side it runs on.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, names};
use crate::types::{Channel, ConfigPacket};

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Command handler for device operations.
#[derive(Clone)]
pub struct CommandHandler {
    dispatcher: EventDispatcher,
    timeout: Duration,
}

impl CommandHandler {
    /// Creates a new command handler.
    #[must_use]
    pub const fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            dispatcher,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the command timeout.
    pub const fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Returns the command timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_error(&self) -> Error {
        Error::Timeout {
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Sends a raw configuration packet.
    pub fn send(&self, packet: &ConfigPacket) -> Result<()> {
        let event = Event::with_packet(names::DEVICE_COMMAND, packet)?;
        self.dispatcher.dispatch(event);
        Ok(())
    }

    /// Sends each packet in order, returning how many were sent.
    fn send_all(&self, packets: &[ConfigPacket]) -> Result<usize> {
        for packet in packets {
            self.send(packet)?;
        }
        Ok(packets.len())
    }

    // ========== Device state ==========

    /// Asks the device to report its status.
    pub fn request_status(&self) -> Result<()> {
        self.send(&ConfigPacket::new_status_request())
    }

    /// Requests the device status and waits until it reports ready.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device reports an error first, or
    /// `Error::Timeout` if nothing arrives in time.
    pub async fn wait_for_ready(&self) -> Result<()> {
        // Subscribe before sending; a fast reply would otherwise be missed
        let mut subscription = self.dispatcher.subscribe(Some(EventFilter::names(&[
            names::DEVICE_READY,
            names::DEVICE_ERROR,
        ])));
        self.request_status()?;

        let event = tokio::time::timeout(self.timeout, subscription.recv())
            .await
            .map_err(|_| self.timeout_error())?
            .ok_or(Error::ChannelClosed)?;

        if event.is(names::DEVICE_ERROR) {
            let message = event
                .decode::<String>()
                .unwrap_or_else(|_| event.payload.clone().unwrap_or_default());
            return Err(Error::Device { message });
        }
        Ok(())
    }

    /// Spawns a task that requests the device status whenever the relay
    /// (re)connects, so the peer learns the device state after a gap.
    #[must_use]
    pub fn spawn_resync(&self) -> JoinHandle<()> {
        let handler = self.clone();
        let mut events = self
            .dispatcher
            .subscribe(Some(EventFilter::name(names::RELAY_CONNECTION)));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !event.decode::<bool>().unwrap_or(false) {
                    continue;
                }
                tracing::debug!("relay up, requesting device status");
                if let Err(e) = handler.request_status() {
                    tracing::warn!("status request failed: {}", e);
                }
            }
        })
    }

    // ========== Outputs ==========

    /// Drives one channel's servo to `value`.
    pub fn set_servo(&self, channel: Channel, value: u16) -> Result<()> {
        let mut packet = ConfigPacket::new();
        packet.set_value(channel, value);
        self.send(&packet)
    }

    /// Turns calibration mode on or off.
    pub fn set_calibration_mode(&self, enabled: bool) -> Result<()> {
        self.send(&ConfigPacket::new_calibration_mode(enabled))
    }

    /// Hands the outputs to the receiver (`true`) or takes them back.
    pub fn set_receiver_control(&self, enabled: bool) -> Result<()> {
        self.send(&ConfigPacket::new_receiver_control(enabled))
    }

    // ========== Profiles ==========

    /// Sends a full channel profile, one small packet at a time.
    ///
    /// Advisory warnings are logged; the profile is sent regardless.
    /// Returns the number of packets sent.
    pub fn push_profile(&self, profile: &ConfigPacket) -> Result<usize> {
        for warning in profile.validate() {
            tracing::warn!("profile warning: {}", warning);
        }
        self.send_all(&profile.channel_packets())
    }

    /// Sends only what changed between the saved and the edited profile.
    ///
    /// Control fields go first, in their own packets. Returns the number of
    /// packets sent; zero when nothing changed.
    pub fn push_changes(&self, saved: &ConfigPacket, edited: &ConfigPacket) -> Result<usize> {
        let changes = saved.diff(edited);
        if changes.is_empty() {
            tracing::debug!("profile unchanged, nothing to send");
            return Ok(0);
        }
        for warning in edited.validate() {
            tracing::warn!("profile warning: {}", warning);
        }

        let mut packets = Vec::new();
        if let Some(enabled) = changes.calibration_mode() {
            packets.push(ConfigPacket::new_calibration_mode(enabled));
        }
        if let Some(enabled) = changes.receiver_control() {
            packets.push(ConfigPacket::new_receiver_control(enabled));
        }
        packets.extend(changes.channel_packets());
        self.send_all(&packets)
    }
}
