//! Actuator channel types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Actuator channel driven by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Roll control surface.
    Aileron,
    /// Pitch control surface.
    Elevator,
    /// Yaw control surface.
    Rudder,
    /// Motor throttle.
    Throttle,
    /// Cutover / auxiliary switch channel.
    Cutover,
}

impl Channel {
    /// Every channel, in wire order.
    pub const ALL: [Self; 5] = [
        Self::Aileron,
        Self::Elevator,
        Self::Rudder,
        Self::Throttle,
        Self::Cutover,
    ];

    /// Returns the stable string key used on the wire.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Aileron => "aileron",
            Self::Elevator => "elevator",
            Self::Rudder => "rudder",
            Self::Throttle => "throttle",
            Self::Cutover => "cutover",
        }
    }

    /// Looks up a channel by its wire key.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.key() == key)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Inclusive `(min, max)` range.
///
/// Output ranges are servo degrees (0-180); input ranges are raw receiver
/// units captured during calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Lower bound.
    pub min: u16,
    /// Upper bound.
    pub max: u16,
}

impl Range {
    /// Creates a new range.
    #[must_use]
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Midpoint of the range, rounded toward `min`.
    #[must_use]
    pub fn neutral(self) -> i32 {
        (i32::from(self.max) - i32::from(self.min)) / 2 + i32::from(self.min)
    }

    /// Clamps a value into the range.
    #[must_use]
    pub fn clamp(self, value: i32) -> u16 {
        let clamped = value.clamp(i32::from(self.min), i32::from(self.max));
        u16::try_from(clamped).unwrap_or(self.min)
    }
}

/// Servo output side of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output pin (0-12).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    /// Output range in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    /// Current output value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u16>,
}

impl OutputConfig {
    /// Returns true if no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pin.is_none() && self.range.is_none() && self.value.is_none()
    }

    fn merge(&mut self, other: &Self) {
        overlay(&mut self.pin, other.pin);
        overlay(&mut self.range, other.range);
        overlay(&mut self.value, other.value);
    }

    fn diff(&self, newer: &Self) -> Self {
        Self {
            pin: changed(self.pin, newer.pin),
            range: changed(self.range, newer.range),
            value: changed(self.value, newer.value),
        }
    }
}

/// Receiver input side of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InputConfig {
    /// Input pin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    /// Calibrated raw input range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    /// When set, the receiver drives this channel exclusively.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_only: Option<bool>,
}

impl InputConfig {
    /// Returns true if no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pin.is_none() && self.range.is_none() && self.receiver_only.is_none()
    }

    fn merge(&mut self, other: &Self) {
        overlay(&mut self.pin, other.pin);
        overlay(&mut self.range, other.range);
        overlay(&mut self.receiver_only, other.receiver_only);
    }

    fn diff(&self, newer: &Self) -> Self {
        Self {
            pin: changed(self.pin, newer.pin),
            range: changed(self.range, newer.range),
            receiver_only: changed(self.receiver_only, newer.receiver_only),
        }
    }
}

/// Sparse configuration record for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Servo output configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
    /// Receiver input configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputConfig>,
}

impl ChannelConfig {
    /// Returns true if the record carries no field at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.output.is_none_or(|o| o.is_empty()) && self.input.is_none_or(|i| i.is_empty())
    }

    /// Overlays every present field of `other` onto `self`.
    pub fn merge(&mut self, other: &Self) {
        if let Some(out) = &other.output {
            self.output.get_or_insert_with(OutputConfig::default).merge(out);
        }
        if let Some(inp) = &other.input {
            self.input.get_or_insert_with(InputConfig::default).merge(inp);
        }
    }

    /// Returns the fields of `newer` that differ from `self`.
    #[must_use]
    pub fn diff(&self, newer: &Self) -> Self {
        let output = newer.output.map(|n| self.output.unwrap_or_default().diff(&n));
        let input = newer.input.map(|n| self.input.unwrap_or_default().diff(&n));
        Self {
            output: output.filter(|o| !o.is_empty()),
            input: input.filter(|i| !i.is_empty()),
        }
    }

    /// Output pin, if configured.
    #[must_use]
    pub fn output_pin(&self) -> Option<u8> {
        self.output.and_then(|o| o.pin)
    }

    /// Output range, if configured.
    #[must_use]
    pub fn output_range(&self) -> Option<Range> {
        self.output.and_then(|o| o.range)
    }

    /// Current output value, if reported.
    #[must_use]
    pub fn value(&self) -> Option<u16> {
        self.output.and_then(|o| o.value)
    }

    /// Input pin, if configured.
    #[must_use]
    pub fn input_pin(&self) -> Option<u8> {
        self.input.and_then(|i| i.pin)
    }

    /// Calibrated input range, if configured.
    #[must_use]
    pub fn input_range(&self) -> Option<Range> {
        self.input.and_then(|i| i.range)
    }

    /// Receiver-only flag, if configured.
    #[must_use]
    pub fn receiver_only(&self) -> Option<bool> {
        self.input.and_then(|i| i.receiver_only)
    }
}

fn overlay<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn changed<T: Copy + PartialEq>(old: Option<T>, new: Option<T>) -> Option<T> {
    match (old, new) {
        (Some(o), Some(n)) if o == n => None,
        (_, n) => n,
    }
}
