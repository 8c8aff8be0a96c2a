//! Data types for the device and peer packet model.
//!
//! This module contains the core data structures used throughout the library:
//! - Actuator channels and their sparse configuration records
//! - Configuration packets (commands, status, configuration)
//! - Telemetry packets and derived craft attitude

pub mod channel;
pub mod config;
pub mod telemetry;

pub use channel::{Channel, ChannelConfig, InputConfig, OutputConfig, Range};
pub use config::{ConfigPacket, ConfigWarning, DeviceStatus, MAX_OUTPUT_DEGREES, MAX_OUTPUT_PIN};
pub use telemetry::{Attitude, Location, Mounting, Quaternion, Rates, TelemetryPacket, Vector3};
