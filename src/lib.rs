//! # servolink
//!
//! Link layer for phone-driven servo controllers.
//!
//! A phone in the craft talks to an actuator board over USB/Serial and to a
//! second phone (the controller) through an MQTT broker. This library
//! provides the pieces between them.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Framed JSON packets over serial with resynchronization on noise
//! - Rate-limited channel value updates
//! - Role-based broker relay with reconnect and echo suppression
//! - Roll stabilization from phone telemetry
//!
//! ## Quick Start
//!
//! ```no_run
//! use servolink::{
//!     Channel, CommandHandler, DeviceLink, EventDispatcher, MqttBroker, MqttConfig, Relay,
//!     RelayConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), servolink::Error> {
//!     let dispatcher = EventDispatcher::default();
//!
//!     // Talk to the actuator board
//!     let mut link = DeviceLink::serial("/dev/ttyUSB0", dispatcher.clone());
//!     link.connect().await?;
//!
//!     // Bridge the bus to the controller phone
//!     let broker = MqttBroker::new(MqttConfig::new("broker.local"));
//!     let mut relay = Relay::start(RelayConfig::craft(), broker, dispatcher.clone());
//!
//!     let commands = CommandHandler::new(dispatcher);
//!     commands.wait_for_ready().await?;
//!     commands.set_servo(Channel::Elevator, 90)?;
//!
//!     relay.stop().await;
//!     link.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`types`] - Packet model (channels, configuration, telemetry)
//! - [`protocol`] - Frame codec and inbound packet classification
//! - [`transport`] - Transport implementations (USB/Serial, in-memory)
//! - [`link`] - Device link tasks over a transport
//! - [`coalesce`] - Rate limiting of channel value updates
//! - [`event`] - Local event bus shared by every component
//! - [`relay`] - Broker relay between craft and controller
//! - [`stabilizer`] - Roll stabilization loop
//! - [`commands`] - Command handler for device operations

pub mod coalesce;
pub mod commands;
pub mod error;
pub mod event;
pub mod link;
pub mod protocol;
pub mod relay;
pub mod stabilizer;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use coalesce::{Coalescer, CoalescerConfig};
pub use commands::CommandHandler;
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, Origin, Subscription, names};
pub use link::{DeviceLink, LinkConfig};
pub use protocol::{FrameDecoder, Inbound};
pub use relay::{
    Broker, MemoryBroker, MemoryHub, MqttBroker, MqttConfig, Relay, RelayConfig, RelayState, Role,
};
pub use stabilizer::{Stabilizer, StabilizerGains};
pub use transport::{MemoryTransport, SerialConfig, SerialTransport, Transport, serial::list_ports};
pub use types::{
    Attitude, Channel, ChannelConfig, ConfigPacket, ConfigWarning, DeviceStatus, Mounting, Range,
    Rates, TelemetryPacket,
};
