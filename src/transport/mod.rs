//! Transport layer for the device link.
//!
//! A transport only opens the byte stream; framing, ordering and task
//! management live in [`crate::link`]. USB/Serial is the production
//! transport, and an in-memory transport backs tests and simulations.

pub mod memory;
pub mod serial;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Read half of an open link.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open link.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Trait for transport implementations.
pub trait Transport: Send {
    /// Opens the link and returns its read and write halves.
    fn open(&mut self) -> BoxFuture<'_, Result<(BoxReader, BoxWriter)>>;

    /// Human-readable name of the endpoint, for logs.
    fn describe(&self) -> String;
}

pub use memory::MemoryTransport;
pub use serial::{SerialConfig, SerialTransport};
