//! Device link: the serial framing engine.
//!
//! This module provides [`DeviceLink`], which owns the transport and runs
//! one task per execution context:
//!
//! - read loop: raw chunks → [`FrameDecoder`] → payload queue
//! - process loop: payload → [`ConfigPacket`] → events / coalescer
//! - write loop: the only writer, so frames never interleave on the wire
//! - command forwarder: `device_command` events → write queue
//! - coalescer ticker: pending values → `channel_values` events

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coalesce::{Coalescer, CoalescerConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, Subscription, names};
use crate::protocol::{FrameDecoder, Inbound, classify, decode_payload, encode_packet};
use crate::transport::{BoxReader, BoxWriter, SerialConfig, SerialTransport, Transport};
use crate::types::ConfigPacket;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_WRITE_QUEUE: usize = 64;

/// Configuration for a device link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Coalescing of inbound channel values.
    pub coalescer: CoalescerConfig,
    /// Outbound frame queue capacity; zero is treated as one.
    pub write_queue: usize,
    /// Whether `device_command` events are written to the device.
    pub forward_commands: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            coalescer: CoalescerConfig::default(),
            write_queue: DEFAULT_WRITE_QUEUE,
            forward_commands: true,
        }
    }
}

impl LinkConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the coalescer configuration.
    #[must_use]
    pub const fn coalescer(mut self, coalescer: CoalescerConfig) -> Self {
        self.coalescer = coalescer;
        self
    }

    /// Sets the outbound queue capacity.
    #[must_use]
    pub const fn write_queue(mut self, capacity: usize) -> Self {
        self.write_queue = capacity;
        self
    }

    /// Enables or disables forwarding of `device_command` events.
    #[must_use]
    pub const fn forward_commands(mut self, enabled: bool) -> Self {
        self.forward_commands = enabled;
        self
    }
}

/// Link to the actuator board.
pub struct DeviceLink<T> {
    transport: T,
    config: LinkConfig,
    dispatcher: EventDispatcher,
    coalescer: Coalescer,
    connected: Arc<AtomicBool>,
    write_tx: Option<mpsc::Sender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceLink<SerialTransport> {
    /// Creates a new link for a serial port.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `dispatcher` - Event bus shared with the rest of the application
    #[must_use]
    pub fn serial(port: impl Into<String>, dispatcher: EventDispatcher) -> Self {
        Self::with_serial_config(SerialConfig::new(port), dispatcher)
    }

    /// Creates a new link with custom serial configuration.
    #[must_use]
    pub fn with_serial_config(config: SerialConfig, dispatcher: EventDispatcher) -> Self {
        Self::new(SerialTransport::new(config), dispatcher)
    }
}

impl<T: Transport> DeviceLink<T> {
    /// Creates a new link with the given transport (not yet connected).
    #[must_use]
    pub fn new(transport: T, dispatcher: EventDispatcher) -> Self {
        Self::with_config(transport, dispatcher, LinkConfig::default())
    }

    /// Creates a new link with the given transport and configuration.
    #[must_use]
    pub fn with_config(transport: T, dispatcher: EventDispatcher, config: LinkConfig) -> Self {
        Self {
            transport,
            config,
            dispatcher,
            coalescer: Coalescer::new(),
            connected: Arc::new(AtomicBool::new(false)),
            write_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Opens the link and starts all background tasks.
    ///
    /// This will:
    /// 1. Open the transport
    /// 2. Start the read, process, write, forwarder and coalescer tasks
    /// 3. Announce `device_connection = true`
    /// 4. Send a status request so an already running board reports in
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened or the status
    /// request cannot be queued.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.stop_tasks();

        tracing::info!("connecting to device on {}", self.transport.describe());
        let (reader, writer) = self.transport.open().await?;

        let (write_tx, write_rx) = mpsc::channel::<Bytes>(self.config.write_queue.max(1));
        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(256);

        // Subscribe before anything can dispatch a command
        let commands = self
            .config
            .forward_commands
            .then(|| self.dispatcher.subscribe(Some(EventFilter::name(names::DEVICE_COMMAND))));

        self.connected.store(true, Ordering::SeqCst);

        let dispatcher = self.dispatcher.clone();
        let connected = Arc::clone(&self.connected);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = run_read_loop(reader, FrameDecoder::new(), frame_tx).await {
                tracing::warn!("read loop ended: {}", e);
                mark_disconnected(&connected, &dispatcher, &e.to_string());
            }
        }));

        let dispatcher = self.dispatcher.clone();
        let coalescer = self.coalescer.clone();
        self.tasks.push(tokio::spawn(async move {
            run_process_loop(frame_rx, &dispatcher, &coalescer).await;
        }));

        let dispatcher = self.dispatcher.clone();
        let connected = Arc::clone(&self.connected);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = run_write_loop(writer, write_rx).await {
                tracing::error!("write loop failed: {}", e);
                mark_disconnected(&connected, &dispatcher, &e.to_string());
            }
        }));

        if let Some(commands) = commands {
            let write_tx = write_tx.clone();
            self.tasks.push(tokio::spawn(async move {
                run_command_forwarder(commands, write_tx).await;
            }));
        }

        self.tasks.push(self.coalescer.spawn(
            self.config.coalescer.tick,
            self.dispatcher.clone(),
            names::CHANNEL_VALUES,
        ));

        self.write_tx = Some(write_tx);
        self.dispatcher
            .dispatch(Event::connection(names::DEVICE_CONNECTION, true));
        tracing::info!("device link up");

        self.send(&ConfigPacket::new_status_request()).await
    }

    /// Closes the link.
    ///
    /// Background tasks are cancelled and any partial inbound frame is
    /// discarded.
    pub async fn close(&mut self) -> Result<()> {
        self.stop_tasks();
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("device link closed");
            self.dispatcher
                .dispatch(Event::connection(names::DEVICE_CONNECTION, false));
        }
        Ok(())
    }

    fn stop_tasks(&mut self) {
        self.write_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Queues a packet for the device.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` if the link is down, or a packet/frame
    /// error if the packet cannot be encoded.
    pub async fn send(&self, packet: &ConfigPacket) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let writer = self.write_tx.as_ref().ok_or(Error::NotConnected)?;
        let frame = encode_packet(packet)?;
        writer.send(frame).await.map_err(|_| Error::ChannelSend)
    }

    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the value coalescer fed by this link.
    #[must_use]
    pub const fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        self.dispatcher.subscribe(filter)
    }
}

impl<T> Drop for DeviceLink<T> {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn mark_disconnected(connected: &AtomicBool, dispatcher: &EventDispatcher, reason: &str) {
    if connected.swap(false, Ordering::SeqCst) {
        match Event::with_json(names::DEVICE_FAULT, &reason) {
            Ok(event) => dispatcher.dispatch(event),
            Err(e) => tracing::warn!("failed to encode fault: {}", e),
        }
        dispatcher.dispatch(Event::connection(names::DEVICE_CONNECTION, false));
    }
}

/// Reads chunks and forwards every completed frame payload, in order.
async fn run_read_loop(
    mut reader: BoxReader,
    mut decoder: FrameDecoder,
    frame_tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("device link closed by peer");
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "device link closed",
                )));
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("device read error: {}", e);
                return Err(Error::Io(e));
            }
        };

        tracing::trace!("received {} bytes", n);
        for frame in decoder.feed(&buf[..n]) {
            tracing::trace!("decoded frame: {} bytes", frame.len());
            if frame_tx.send(frame).await.is_err() {
                tracing::debug!("frame receiver dropped");
                return Ok(());
            }
        }
    }
}

/// Writes queued frames one at a time.
async fn run_write_loop(mut writer: BoxWriter, mut write_rx: mpsc::Receiver<Bytes>) -> Result<()> {
    while let Some(frame) = write_rx.recv().await {
        tracing::trace!("sending frame: {} bytes", frame.len());
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Parses payloads and routes their content.
async fn run_process_loop(
    mut frame_rx: mpsc::Receiver<Bytes>,
    dispatcher: &EventDispatcher,
    coalescer: &Coalescer,
) {
    while let Some(frame) = frame_rx.recv().await {
        match decode_payload(&frame) {
            Ok(packet) => process_packet(packet, dispatcher, coalescer),
            Err(e) => tracing::warn!(
                "dropping malformed frame ({} bytes): {}",
                frame.len(),
                e
            ),
        }
    }
}

fn process_packet(packet: ConfigPacket, dispatcher: &EventDispatcher, coalescer: &Coalescer) {
    for part in classify(packet) {
        let event = match part {
            Inbound::Ready => {
                tracing::info!("device ready");
                Ok(Event::new(names::DEVICE_READY))
            }
            Inbound::Error(message) => {
                tracing::warn!("device error: {}", message);
                Event::with_json(names::DEVICE_ERROR, &message)
            }
            Inbound::Values(values) => {
                coalescer.absorb(&values);
                continue;
            }
            Inbound::Config(config) => Event::with_packet(names::DEVICE_PACKET, &config),
        };

        match event {
            Ok(event) => dispatcher.dispatch(event),
            Err(e) => tracing::warn!("failed to encode device event: {}", e),
        }
    }
}

/// Writes `device_command` events to the device.
async fn run_command_forwarder(mut commands: Subscription, write_tx: mpsc::Sender<Bytes>) {
    while let Some(event) = commands.recv().await {
        let frame = event.packet().and_then(|packet| encode_packet(&packet));
        match frame {
            Ok(frame) => {
                if write_tx.send(frame).await.is_err() {
                    tracing::debug!("write queue closed");
                    return;
                }
            }
            Err(e) => tracing::warn!("dropping device command: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::coalesce::DEFAULT_TICK;
    use crate::transport::MemoryTransport;
    use crate::types::Channel;

    const WAIT: Duration = Duration::from_secs(1);

    /// Device side of the pipe, decoding what the link writes.
    struct Device {
        stream: DuplexStream,
        decoder: FrameDecoder,
        pending: VecDeque<Bytes>,
    }

    impl Device {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: FrameDecoder::new(),
                pending: VecDeque::new(),
            }
        }

        async fn next_packet(&mut self) -> ConfigPacket {
            let mut buf = [0u8; 256];
            while self.pending.is_empty() {
                let n = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "link closed");
                self.pending.extend(self.decoder.feed(&buf[..n]));
            }
            let frame = self.pending.pop_front().unwrap();
            decode_payload(&frame).unwrap()
        }

        async fn write(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }
    }

    async fn next(sub: &mut Subscription) -> Event {
        tokio::time::timeout(WAIT, sub.recv()).await.unwrap().unwrap()
    }

    async fn connected_link() -> (DeviceLink<MemoryTransport>, Device, EventDispatcher) {
        let dispatcher = EventDispatcher::new(64);
        let (transport, device) = MemoryTransport::pair(4096);
        let mut link = DeviceLink::new(transport, dispatcher.clone());
        link.connect().await.unwrap();
        (link, Device::new(device), dispatcher)
    }

    #[tokio::test]
    async fn test_connect_sends_status_request() {
        let dispatcher = EventDispatcher::new(64);
        let mut sub = dispatcher.subscribe(Some(EventFilter::name(names::DEVICE_CONNECTION)));
        let (transport, device) = MemoryTransport::pair(4096);
        let mut device = Device::new(device);
        let mut link = DeviceLink::new(transport, dispatcher.clone());

        link.connect().await.unwrap();
        assert!(link.is_connected());
        assert!(next(&mut sub).await.decode::<bool>().unwrap());
        assert_eq!(device.next_packet().await, ConfigPacket::new_status_request());
    }

    #[tokio::test]
    async fn test_inbound_frames_become_events() {
        let (_link, mut device, dispatcher) = connected_link().await;
        let mut sub = dispatcher.subscribe(Some(EventFilter::names(&[
            names::DEVICE_READY,
            names::DEVICE_ERROR,
            names::DEVICE_PACKET,
        ])));

        // Split mid-frame, with a malformed frame in between
        device.write(b"@{\"status\":\"re").await;
        device
            .write(b"ady\"}#@not json#@{\"error\":\"servo stalled\"}#")
            .await;
        device
            .write(b"@{\"aileron\":{\"input\":{\"range\":{\"min\":1000,\"max\":2000}}}}#")
            .await;

        assert!(next(&mut sub).await.is(names::DEVICE_READY));

        let error = next(&mut sub).await;
        assert!(error.is(names::DEVICE_ERROR));
        assert_eq!(error.decode::<String>().unwrap(), "servo stalled");

        let packet = next(&mut sub).await.packet().unwrap();
        assert_eq!(
            packet.channel(Channel::Aileron).unwrap().input_range(),
            Some(crate::types::Range::new(1000, 2000))
        );
    }

    #[tokio::test]
    async fn test_values_are_coalesced() {
        let (_link, mut device, dispatcher) = connected_link().await;
        let mut sub = dispatcher.subscribe(Some(EventFilter::name(names::CHANNEL_VALUES)));

        device
            .write(
                b"@{\"elevator\":{\"output\":{\"value\":10}}}#\
                  @{\"elevator\":{\"output\":{\"value\":11}}}#\
                  @{\"elevator\":{\"output\":{\"value\":12}}}#",
            )
            .await;

        let packet = next(&mut sub).await.packet().unwrap();
        assert_eq!(packet.channel(Channel::Elevator).unwrap().value(), Some(12));
        assert!(
            tokio::time::timeout(DEFAULT_TICK * 3, sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_send_and_forward_commands_in_order() {
        let (link, mut device, dispatcher) = connected_link().await;
        assert!(device.next_packet().await.has_status_request());

        let mut servo = ConfigPacket::new();
        servo.set_value(Channel::Rudder, 70);
        link.send(&servo).await.unwrap();

        dispatcher.dispatch(
            Event::with_packet(names::DEVICE_COMMAND, &ConfigPacket::new_receiver_control(true))
                .unwrap(),
        );

        assert_eq!(device.next_packet().await, servo);
        assert_eq!(
            device.next_packet().await,
            ConfigPacket::new_receiver_control(true)
        );
    }

    #[tokio::test]
    async fn test_device_hangup_reports_disconnect() {
        let (link, device, dispatcher) = connected_link().await;
        let mut sub = dispatcher.subscribe(Some(EventFilter::names(&[
            names::DEVICE_FAULT,
            names::DEVICE_CONNECTION,
        ])));

        drop(device);

        assert!(next(&mut sub).await.is(names::DEVICE_FAULT));
        let state = next(&mut sub).await;
        assert!(state.is(names::DEVICE_CONNECTION));
        assert!(!state.decode::<bool>().unwrap());
        assert!(!link.is_connected());
        assert!(matches!(
            link.send(&ConfigPacket::new_status_request()).await,
            Err(Error::NotConnected)
        ));
    }

    /// Reads pend on a live pipe; writes hit a pipe whose far end is gone.
    struct BrokenWriteTransport {
        halves: Option<(DuplexStream, DuplexStream)>,
    }

    impl Transport for BrokenWriteTransport {
        fn open(&mut self) -> BoxFuture<'_, Result<(BoxReader, BoxWriter)>> {
            let halves = self.halves.take();
            Box::pin(async move {
                let (reader, writer) = halves.ok_or(Error::NotConnected)?;
                Ok((Box::new(reader) as BoxReader, Box::new(writer) as BoxWriter))
            })
        }

        fn describe(&self) -> String {
            "broken-write".into()
        }
    }

    #[tokio::test]
    async fn test_write_failure_reports_fault() {
        let (reader, _device) = tokio::io::duplex(64);
        let (writer, gone) = tokio::io::duplex(64);
        drop(gone);

        let dispatcher = EventDispatcher::new(64);
        let mut sub = dispatcher.subscribe(Some(EventFilter::names(&[
            names::DEVICE_FAULT,
            names::DEVICE_CONNECTION,
        ])));
        let transport = BrokenWriteTransport {
            halves: Some((reader, writer)),
        };
        let mut link = DeviceLink::new(transport, dispatcher.clone());

        // The status request is queued before the write loop can fail
        link.connect().await.unwrap();

        let up = next(&mut sub).await;
        assert!(up.is(names::DEVICE_CONNECTION));
        assert!(up.decode::<bool>().unwrap());
        let fault = next(&mut sub).await;
        assert!(fault.is(names::DEVICE_FAULT));
        assert!(!fault.decode::<String>().unwrap().is_empty());
        let down = next(&mut sub).await;
        assert!(down.is(names::DEVICE_CONNECTION));
        assert!(!down.decode::<bool>().unwrap());

        assert!(!link.is_connected());
        assert!(matches!(
            link.send(&ConfigPacket::new_status_request()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_zero_write_queue_is_usable() {
        let dispatcher = EventDispatcher::new(64);
        let (transport, device) = MemoryTransport::pair(4096);
        let config = LinkConfig::new().write_queue(0);
        let mut link = DeviceLink::with_config(transport, dispatcher, config);
        let mut device = Device::new(device);

        link.connect().await.unwrap();
        assert_eq!(
            device.next_packet().await,
            ConfigPacket::new_status_request()
        );
    }

    #[tokio::test]
    async fn test_close() {
        let (mut link, _device, dispatcher) = connected_link().await;
        let mut sub = dispatcher.subscribe(Some(EventFilter::name(names::DEVICE_CONNECTION)));

        link.close().await.unwrap();
        assert!(!link.is_connected());
        assert!(!next(&mut sub).await.decode::<bool>().unwrap());

        // Second close is a no-op
        link.close().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }
}
