//! Configuration packet exchanged with the device and between peers.
//!
//! The packet is sparse: a field that is absent means "unknown / no-op",
//! never zero. The text form is a flat JSON object with one member per
//! configured channel plus the optional control fields:
//!
//! ```text
//! {"aileron":{"output":{"pin":5,"range":{"min":60,"max":120}}},"receiverControl":false}
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::types::channel::{Channel, ChannelConfig, InputConfig, OutputConfig, Range};

/// Highest output pin accepted by the device.
pub const MAX_OUTPUT_PIN: u8 = 12;

/// Upper bound for servo output ranges, in degrees.
pub const MAX_OUTPUT_DEGREES: u16 = 180;

/// Device status marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device finished booting and accepts configuration.
    Ready,
}

/// Advisory problems found in a configuration.
///
/// None of these stop a configuration from being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigWarning {
    /// The same pin is assigned more than once.
    #[error("pin {pin} is assigned more than once")]
    DuplicatePin { pin: u8 },

    /// An output pin the device does not have.
    #[error("{channel} output pin {pin} is outside 0-{max}", max = MAX_OUTPUT_PIN)]
    PinOutOfRange { channel: Channel, pin: u8 },

    /// An output range beyond the servo's travel.
    #[error(
        "{channel} output range {}-{} exceeds {max} degrees",
        .range.min,
        .range.max,
        max = MAX_OUTPUT_DEGREES
    )]
    OutputRangeOutOfBounds { channel: Channel, range: Range },

    /// A range whose minimum is above its maximum.
    #[error("{channel} has a range with min above max")]
    InvertedRange { channel: Channel },
}

/// Device configuration, status and command packet.
///
/// Parsing skips top-level members that are neither a control field nor a
/// channel key, so newer firmware can add fields without losing frames. A
/// channel member that is present but malformed still fails the parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawConfigPacket")]
pub struct ConfigPacket {
    #[serde(skip_serializing_if = "Option::is_none")]
    status_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<DeviceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calibration_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    receiver_control: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    channels: BTreeMap<Channel, ChannelConfig>,
}

/// Wire shape of [`ConfigPacket`] before channel keys are recognized.
#[derive(Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawConfigPacket {
    status_request: Option<bool>,
    status: Option<DeviceStatus>,
    calibration_mode: Option<bool>,
    receiver_control: Option<bool>,
    error: Option<String>,
    #[serde(flatten)]
    members: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawConfigPacket> for ConfigPacket {
    type Error = serde_json::Error;

    fn try_from(raw: RawConfigPacket) -> std::result::Result<Self, Self::Error> {
        let mut channels = BTreeMap::new();
        for (key, value) in raw.members {
            match Channel::from_key(&key) {
                Some(channel) => {
                    channels.insert(channel, serde_json::from_value(value)?);
                }
                None => tracing::debug!("ignoring unknown packet member {key:?}"),
            }
        }
        Ok(Self {
            status_request: raw.status_request,
            status: raw.status,
            calibration_mode: raw.calibration_mode,
            receiver_control: raw.receiver_control,
            error: raw.error,
            channels,
        })
    }
}

impl ConfigPacket {
    /// Creates an empty packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Packet asking the device to report its status.
    #[must_use]
    pub fn new_status_request() -> Self {
        Self {
            status_request: Some(true),
            ..Self::default()
        }
    }

    /// Packet announcing the device is ready.
    #[must_use]
    pub fn new_ready() -> Self {
        Self {
            status: Some(DeviceStatus::Ready),
            ..Self::default()
        }
    }

    /// Packet carrying an error message.
    #[must_use]
    pub fn new_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Packet switching calibration mode on or off.
    #[must_use]
    pub fn new_calibration_mode(enabled: bool) -> Self {
        Self {
            calibration_mode: Some(enabled),
            ..Self::default()
        }
    }

    /// Packet switching exclusive receiver control on or off.
    #[must_use]
    pub fn new_receiver_control(enabled: bool) -> Self {
        Self {
            receiver_control: Some(enabled),
            ..Self::default()
        }
    }

    /// Parses a packet from its text form.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses a packet from raw frame bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes the packet to its text form.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns true if no field at all is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status_request.is_none()
            && self.status.is_none()
            && self.calibration_mode.is_none()
            && self.receiver_control.is_none()
            && self.error.is_none()
            && self.channels.values().all(ChannelConfig::is_empty)
    }

    // ==================== Top-level fields ====================

    #[must_use]
    pub const fn has_status_request(&self) -> bool {
        self.status_request.is_some()
    }

    #[must_use]
    pub const fn status_request(&self) -> Option<bool> {
        self.status_request
    }

    #[must_use]
    pub const fn has_status(&self) -> bool {
        self.status.is_some()
    }

    #[must_use]
    pub const fn status(&self) -> Option<DeviceStatus> {
        self.status
    }

    /// Returns true if the packet carries the `ready` status marker.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == Some(DeviceStatus::Ready)
    }

    #[must_use]
    pub const fn has_calibration_mode(&self) -> bool {
        self.calibration_mode.is_some()
    }

    #[must_use]
    pub const fn calibration_mode(&self) -> Option<bool> {
        self.calibration_mode
    }

    #[must_use]
    pub const fn has_receiver_control(&self) -> bool {
        self.receiver_control.is_some()
    }

    #[must_use]
    pub const fn receiver_control(&self) -> Option<bool> {
        self.receiver_control
    }

    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the error text, treating its absence as a caller error.
    pub fn require_error(&self) -> Result<&str> {
        self.error().ok_or(Error::MissingField { field: "error" })
    }

    pub fn set_status_request(&mut self, requested: bool) -> &mut Self {
        self.status_request = Some(requested);
        self
    }

    pub fn set_calibration_mode(&mut self, enabled: bool) -> &mut Self {
        self.calibration_mode = Some(enabled);
        self
    }

    pub fn set_receiver_control(&mut self, enabled: bool) -> &mut Self {
        self.receiver_control = Some(enabled);
        self
    }

    // ==================== Channels ====================

    #[must_use]
    pub fn has_channel(&self, channel: Channel) -> bool {
        self.channels.contains_key(&channel)
    }

    #[must_use]
    pub fn channel(&self, channel: Channel) -> Option<&ChannelConfig> {
        self.channels.get(&channel)
    }

    /// Returns the channel record, treating its absence as a caller error.
    pub fn require_channel(&self, channel: Channel) -> Result<&ChannelConfig> {
        self.channel(channel).ok_or(Error::MissingField {
            field: channel.key(),
        })
    }

    /// Iterates over present channel records in wire order.
    pub fn channels(&self) -> impl Iterator<Item = (Channel, &ChannelConfig)> {
        self.channels.iter().map(|(c, cfg)| (*c, cfg))
    }

    /// Replaces the whole record of one channel.
    pub fn set_channel(&mut self, channel: Channel, config: ChannelConfig) -> &mut Self {
        self.channels.insert(channel, config);
        self
    }

    pub fn set_output_pin(&mut self, channel: Channel, pin: u8) -> &mut Self {
        self.output_mut(channel).pin = Some(pin);
        self
    }

    pub fn set_output_range(&mut self, channel: Channel, range: Range) -> &mut Self {
        self.output_mut(channel).range = Some(range);
        self
    }

    pub fn set_value(&mut self, channel: Channel, value: u16) -> &mut Self {
        self.output_mut(channel).value = Some(value);
        self
    }

    pub fn set_input_pin(&mut self, channel: Channel, pin: u8) -> &mut Self {
        self.input_mut(channel).pin = Some(pin);
        self
    }

    pub fn set_input_range(&mut self, channel: Channel, range: Range) -> &mut Self {
        self.input_mut(channel).range = Some(range);
        self
    }

    pub fn set_receiver_only(&mut self, channel: Channel, receiver_only: bool) -> &mut Self {
        self.input_mut(channel).receiver_only = Some(receiver_only);
        self
    }

    fn output_mut(&mut self, channel: Channel) -> &mut OutputConfig {
        self.channels
            .entry(channel)
            .or_default()
            .output
            .get_or_insert_with(OutputConfig::default)
    }

    fn input_mut(&mut self, channel: Channel) -> &mut InputConfig {
        self.channels
            .entry(channel)
            .or_default()
            .input
            .get_or_insert_with(InputConfig::default)
    }

    /// Returns true if any channel carries an output value.
    #[must_use]
    pub fn has_values(&self) -> bool {
        self.channels.values().any(|c| c.value().is_some())
    }

    /// Removes and returns the status marker.
    pub fn take_status(&mut self) -> Option<DeviceStatus> {
        self.status.take()
    }

    /// Removes and returns the status request flag.
    pub fn take_status_request(&mut self) -> Option<bool> {
        self.status_request.take()
    }

    /// Removes and returns the error message.
    pub fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }

    /// Moves every output value into a separate packet.
    ///
    /// Channel records left empty afterwards are removed from `self`.
    pub fn take_values(&mut self) -> Self {
        let mut values = Self::new();
        for (channel, config) in &mut self.channels {
            if let Some(value) = config.output.as_mut().and_then(|o| o.value.take()) {
                values.set_value(*channel, value);
            }
            if config.output.is_some_and(|o| o.is_empty()) {
                config.output = None;
            }
        }
        self.channels.retain(|_, config| !config.is_empty());
        values
    }

    // ==================== Validation ====================

    /// Returns true if any present input or output pin is used twice.
    #[must_use]
    pub fn has_duplicate_pins(&self) -> bool {
        let mut seen = HashSet::new();
        self.pins().any(|pin| !seen.insert(pin))
    }

    fn pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels
            .values()
            .flat_map(|c| [c.output_pin(), c.input_pin()])
            .flatten()
    }

    /// Collects advisory warnings about this configuration.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for pin in self.pins() {
            if !seen.insert(pin) && reported.insert(pin) {
                warnings.push(ConfigWarning::DuplicatePin { pin });
            }
        }

        for (channel, config) in self.channels() {
            if let Some(pin) = config.output_pin() {
                if pin > MAX_OUTPUT_PIN {
                    warnings.push(ConfigWarning::PinOutOfRange { channel, pin });
                }
            }
            if let Some(range) = config.output_range() {
                if range.max > MAX_OUTPUT_DEGREES {
                    warnings.push(ConfigWarning::OutputRangeOutOfBounds { channel, range });
                }
            }
            let inverted = [config.output_range(), config.input_range()]
                .into_iter()
                .flatten()
                .any(|r| r.min > r.max);
            if inverted {
                warnings.push(ConfigWarning::InvertedRange { channel });
            }
        }

        warnings
    }

    // ==================== Sub-packets ====================

    /// Narrows the packet to one channel's full configuration.
    ///
    /// The current value is never included. With `include_calibration`
    /// false the input range is left out so the packet fits a small link
    /// MTU; send it separately with [`Self::calibration_only`].
    #[must_use]
    pub fn channel_config(&self, channel: Channel, include_calibration: bool) -> Self {
        let mut packet = Self::new();
        let Some(config) = self.channel(channel) else {
            return packet;
        };

        let output = config
            .output
            .map(|o| OutputConfig { value: None, ..o })
            .filter(|o| !o.is_empty());
        let input = config
            .input
            .map(|i| InputConfig {
                range: if include_calibration { i.range } else { None },
                ..i
            })
            .filter(|i| !i.is_empty());

        if output.is_some() || input.is_some() {
            packet.set_channel(channel, ChannelConfig { output, input });
        }
        packet
    }

    /// Narrows the packet to one channel's calibration range.
    #[must_use]
    pub fn calibration_only(&self, channel: Channel) -> Self {
        let mut packet = Self::new();
        if let Some(range) = self.channel(channel).and_then(ChannelConfig::input_range) {
            packet.set_input_range(channel, range);
        }
        packet
    }

    /// Splits the channel configuration into link-sized packets: per
    /// channel, the configuration without calibration, then the calibration
    /// range on its own. Values and control fields are left out.
    #[must_use]
    pub fn channel_packets(&self) -> Vec<Self> {
        let mut packets = Vec::new();
        for channel in Channel::ALL {
            for packet in [
                self.channel_config(channel, false),
                self.calibration_only(channel),
            ] {
                if !packet.is_empty() {
                    packets.push(packet);
                }
            }
        }
        packets
    }

    /// Keeps only the output values of every channel.
    #[must_use]
    pub fn values_only(&self) -> Self {
        let mut packet = Self::new();
        for (channel, config) in self.channels() {
            if let Some(value) = config.value() {
                packet.set_value(channel, value);
            }
        }
        packet
    }

    // ==================== Partial update ====================

    /// Overlays every present field of `other` onto `self`.
    ///
    /// Applying the same packet more than once leaves `self` unchanged
    /// after the first application.
    pub fn merge(&mut self, other: &Self) {
        if other.status_request.is_some() {
            self.status_request = other.status_request;
        }
        if other.status.is_some() {
            self.status = other.status;
        }
        if other.calibration_mode.is_some() {
            self.calibration_mode = other.calibration_mode;
        }
        if other.receiver_control.is_some() {
            self.receiver_control = other.receiver_control;
        }
        if other.error.is_some() {
            self.error.clone_from(&other.error);
        }
        for (channel, config) in &other.channels {
            self.channels.entry(*channel).or_default().merge(config);
        }
    }

    /// Returns the fields present in `newer` whose value differs from `self`.
    #[must_use]
    pub fn diff(&self, newer: &Self) -> Self {
        fn changed<T: Clone + PartialEq>(old: &Option<T>, new: &Option<T>) -> Option<T> {
            if old == new { None } else { new.clone() }
        }

        let channels = newer
            .channels
            .iter()
            .filter_map(|(channel, config)| {
                let diff = self
                    .channel(*channel)
                    .copied()
                    .unwrap_or_default()
                    .diff(config);
                (!diff.is_empty()).then_some((*channel, diff))
            })
            .collect();

        Self {
            status_request: changed(&self.status_request, &newer.status_request),
            status: changed(&self.status, &newer.status),
            calibration_mode: changed(&self.calibration_mode, &newer.calibration_mode),
            receiver_control: changed(&self.receiver_control, &newer.receiver_control),
            error: changed(&self.error, &newer.error),
            channels,
        }
    }
}
