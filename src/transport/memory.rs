//! In-memory transport.
//!
//! One end of a [`tokio::io::duplex`] pipe plays the serial port; the other
//! end is handed to whoever simulates the device.

use std::io;

use futures::future::BoxFuture;
use tokio::io::DuplexStream;

use crate::error::{Error, Result};
use crate::transport::{BoxReader, BoxWriter, Transport};

/// Transport backed by an in-memory pipe. Can be opened once.
#[derive(Debug)]
pub struct MemoryTransport {
    stream: Option<DuplexStream>,
}

impl MemoryTransport {
    /// Creates a transport and the device end of its pipe.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, DuplexStream) {
        let (host, device) = tokio::io::duplex(buffer);
        (Self { stream: Some(host) }, device)
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> BoxFuture<'_, Result<(BoxReader, BoxWriter)>> {
        let stream = self.stream.take();
        Box::pin(async move {
            let stream = stream.ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "memory transport already opened",
                ))
            })?;
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader) as BoxReader, Box::new(writer) as BoxWriter))
        })
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
