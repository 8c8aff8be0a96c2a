//! Roll stabilization.
//!
//! A proportional-derivative loop holds the craft's roll near level by
//! driving the aileron channel. Each telemetry tick produces at most one
//! aileron value; nothing is emitted while the pilot's receiver has control
//! of the device or the aileron is wired receiver-only.

use tokio::task::JoinHandle;

use crate::event::{Event, EventDispatcher, EventFilter, names};
use crate::types::{Channel, ConfigPacket, Mounting, Range, TelemetryPacket};

/// Default proportional gain, per degree of roll.
pub const DEFAULT_KP: f64 = -1.0;

/// Default derivative gain, per degree/second of roll rate.
pub const DEFAULT_KD: f64 = -0.1;

/// Controller gains. Both are negative: a right roll commands left aileron.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizerGains {
    /// Proportional gain.
    pub kp: f64,
    /// Derivative gain.
    pub kd: f64,
}

impl Default for StabilizerGains {
    fn default() -> Self {
        Self {
            kp: DEFAULT_KP,
            kd: DEFAULT_KD,
        }
    }
}

impl StabilizerGains {
    /// Creates gains.
    #[must_use]
    pub const fn new(kp: f64, kd: f64) -> Self {
        Self { kp, kd }
    }
}

/// Roll stabilizer state.
#[derive(Debug, Clone, Default)]
pub struct Stabilizer {
    gains: StabilizerGains,
    mounting: Mounting,
    profile: ConfigPacket,
}

impl Stabilizer {
    /// Creates a stabilizer with the given gains and no known configuration.
    #[must_use]
    pub fn new(gains: StabilizerGains) -> Self {
        Self {
            gains,
            ..Self::default()
        }
    }

    /// Sets how the phone is mounted.
    #[must_use]
    pub const fn mounting(mut self, mounting: Mounting) -> Self {
        self.mounting = mounting;
        self
    }

    /// Seeds the known channel configuration.
    #[must_use]
    pub fn profile(mut self, profile: ConfigPacket) -> Self {
        self.profile = profile;
        self
    }

    /// Returns the gains.
    #[must_use]
    pub const fn gains(&self) -> StabilizerGains {
        self.gains
    }

    /// Returns the configuration known so far.
    #[must_use]
    pub const fn known_config(&self) -> &ConfigPacket {
        &self.profile
    }

    /// Neutral output of a range.
    #[must_use]
    pub fn neutral(range: Range) -> i32 {
        range.neutral()
    }

    /// Returns true while the device's receiver owns the outputs.
    #[must_use]
    pub fn receiver_control(&self) -> bool {
        self.profile.receiver_control() == Some(true)
    }

    /// Folds configuration reported by the device into the known state.
    pub fn observe(&mut self, packet: &ConfigPacket) {
        self.profile.merge(packet);
    }

    /// Folds a command sent to the device into the known state.
    ///
    /// Live values and one-shot markers are not configuration and are
    /// skipped; control flags and channel settings are kept, so a receiver
    /// handover or a pushed profile takes effect before the device echoes it.
    pub fn observe_command(&mut self, packet: &ConfigPacket) {
        let mut config = packet.clone();
        let _ = config.take_values();
        let _ = config.take_status_request();
        let _ = config.take_status();
        let _ = config.take_error();
        if !config.is_empty() {
            self.observe(&config);
        }
    }

    /// Computes the aileron command for one telemetry sample.
    ///
    /// Returns `None` when the sample lacks orientation or angular velocity,
    /// when no aileron output range is known, or when manual control must
    /// not be overridden.
    #[must_use]
    pub fn command(&self, telemetry: &TelemetryPacket) -> Option<ConfigPacket> {
        if self.receiver_control() {
            return None;
        }
        let aileron = self.profile.channel(Channel::Aileron)?;
        if aileron.receiver_only() == Some(true) {
            return None;
        }
        let range = aileron.output_range()?;

        let roll = telemetry.attitude(self.mounting)?.roll;
        let rate = telemetry.rates(self.mounting)?.roll;
        let correction = self.gains.kp.mul_add(roll, self.gains.kd * rate).round() as i32;
        let value = range.clamp(correction.saturating_add(Self::neutral(range)));

        let mut packet = ConfigPacket::new();
        packet.set_value(Channel::Aileron, value);
        Some(packet)
    }

    /// Packets that restore the known channel configuration on a freshly
    /// booted device.
    #[must_use]
    pub fn startup_packets(&self) -> Vec<ConfigPacket> {
        self.profile.channel_packets()
    }

    /// Spawns the control loop on the event bus.
    ///
    /// Consumes `telemetry`, `device_packet` and `device_ready` events,
    /// watches `device_command` events from any origin, and emits
    /// `device_command` events.
    #[must_use]
    pub fn spawn(self, dispatcher: EventDispatcher) -> JoinHandle<()> {
        tokio::spawn(self.run(dispatcher))
    }

    async fn run(mut self, dispatcher: EventDispatcher) {
        let mut events = dispatcher.subscribe(Some(EventFilter::names(&[
            names::TELEMETRY,
            names::DEVICE_PACKET,
            names::DEVICE_READY,
            names::DEVICE_COMMAND,
        ])));
        tracing::debug!("stabilizer running with {:?}", self.gains);

        while let Some(event) = events.recv().await {
            match event.name.as_str() {
                names::TELEMETRY => {
                    let telemetry = match event.decode::<TelemetryPacket>() {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!("ignoring malformed telemetry: {}", e);
                            continue;
                        }
                    };
                    if let Some(packet) = self.command(&telemetry) {
                        emit(&dispatcher, &packet);
                    }
                }
                names::DEVICE_PACKET => match event.packet() {
                    Ok(packet) => self.observe(&packet),
                    Err(e) => tracing::warn!("ignoring malformed device packet: {}", e),
                },
                names::DEVICE_COMMAND => match event.packet() {
                    Ok(packet) => self.observe_command(&packet),
                    Err(e) => tracing::debug!("ignoring malformed command: {}", e),
                },
                names::DEVICE_READY => {
                    let packets = self.startup_packets();
                    tracing::info!("device ready, restoring {} channel packets", packets.len());
                    for packet in &packets {
                        emit(&dispatcher, packet);
                    }
                }
                _ => {}
            }
        }
    }
}

fn emit(dispatcher: &EventDispatcher, packet: &ConfigPacket) {
    match Event::with_packet(names::DEVICE_COMMAND, packet) {
        Ok(event) => dispatcher.dispatch(event),
        Err(e) => tracing::warn!("failed to encode command: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::commands::CommandHandler;
    use crate::event::Subscription;
    use crate::types::{Quaternion, Vector3};

    fn rolled(degrees: f64, rate: f64) -> TelemetryPacket {
        TelemetryPacket {
            orientation: Some(Quaternion::from_axis_angle(
                Vector3::new(0.0, 1.0, 0.0),
                degrees,
            )),
            angular_velocity: Some(Vector3::new(0.0, rate.to_radians(), 0.0)),
            ..TelemetryPacket::default()
        }
    }

    fn profile(min: u16, max: u16) -> ConfigPacket {
        let mut packet = ConfigPacket::new();
        packet
            .set_output_pin(Channel::Aileron, 5)
            .set_output_range(Channel::Aileron, Range::new(min, max))
            .set_input_pin(Channel::Aileron, 2)
            .set_input_range(Channel::Aileron, Range::new(1000, 2000));
        packet
    }

    fn aileron(packet: &ConfigPacket) -> Option<u16> {
        packet.channel(Channel::Aileron).and_then(|c| c.value())
    }

    #[test]
    fn test_neutral() {
        assert_eq!(Stabilizer::neutral(Range::new(60, 120)), 90);
        assert_eq!(Stabilizer::neutral(Range::new(0, 180)), 90);
        assert_eq!(Stabilizer::neutral(Range::new(10, 15)), 12);
    }

    #[test]
    fn test_level_flight_commands_neutral() {
        let stabilizer = Stabilizer::default().profile(profile(60, 120));
        let packet = stabilizer.command(&rolled(0.0, 0.0)).unwrap();
        assert_eq!(aileron(&packet), Some(90));
    }

    #[test]
    fn test_proportional_and_derivative_terms() {
        let stabilizer =
            Stabilizer::new(StabilizerGains::new(-1.0, -0.5)).profile(profile(0, 180));

        // Right wing down: roll +10, rolling further right at 4 deg/s.
        let packet = stabilizer.command(&rolled(10.0, 4.0)).unwrap();
        assert_eq!(aileron(&packet), Some(90 - 10 - 2));

        let tail = stabilizer.clone().mounting(Mounting::FacingTail);
        let packet = tail.command(&rolled(10.0, 4.0)).unwrap();
        assert_eq!(aileron(&packet), Some(90 + 10 + 2));
    }

    #[test]
    fn test_command_is_clamped_to_output_range() {
        let stabilizer = Stabilizer::default().profile(profile(60, 120));

        let packet = stabilizer.command(&rolled(-80.0, -200.0)).unwrap();
        assert_eq!(aileron(&packet), Some(120));

        let packet = stabilizer.command(&rolled(80.0, 200.0)).unwrap();
        assert_eq!(aileron(&packet), Some(60));
    }

    #[test]
    fn test_receiver_control_silences_output() {
        let mut stabilizer = Stabilizer::default().profile(profile(60, 120));
        stabilizer.observe(&ConfigPacket::new_receiver_control(true));
        assert!(stabilizer.receiver_control());

        for roll in [-90.0, -30.0, 0.0, 30.0, 90.0] {
            assert!(stabilizer.command(&rolled(roll, 50.0)).is_none());
        }

        stabilizer.observe(&ConfigPacket::new_receiver_control(false));
        assert!(stabilizer.command(&rolled(0.0, 0.0)).is_some());
    }

    #[test]
    fn test_observe_command_keeps_configuration_only() {
        let mut stabilizer = Stabilizer::default();
        let mut command = profile(60, 120);
        command
            .set_value(Channel::Aileron, 150)
            .set_status_request(true)
            .set_receiver_control(true);
        stabilizer.observe_command(&command);

        assert!(stabilizer.receiver_control());
        let known = stabilizer.known_config();
        assert_eq!(known.status_request(), None);
        let aileron = known.channel(Channel::Aileron).unwrap();
        assert_eq!(aileron.output_range(), Some(Range::new(60, 120)));
        assert_eq!(aileron.value(), None);

        // A bare servo value changes nothing
        let before = stabilizer.known_config().clone();
        let mut value = ConfigPacket::new();
        value.set_value(Channel::Elevator, 45);
        stabilizer.observe_command(&value);
        assert_eq!(stabilizer.known_config(), &before);
    }

    #[test]
    fn test_receiver_only_aileron_is_left_alone() {
        let mut stabilizer = Stabilizer::default().profile(profile(60, 120));
        let mut update = ConfigPacket::new();
        update.set_receiver_only(Channel::Aileron, true);
        stabilizer.observe(&update);

        assert!(stabilizer.command(&rolled(20.0, 0.0)).is_none());
    }

    #[test]
    fn test_missing_inputs() {
        let stabilizer = Stabilizer::default();
        assert!(stabilizer.command(&rolled(10.0, 0.0)).is_none());

        let stabilizer = stabilizer.profile(profile(60, 120));
        let no_rates = TelemetryPacket {
            angular_velocity: None,
            ..rolled(10.0, 0.0)
        };
        assert!(stabilizer.command(&no_rates).is_none());
        assert!(stabilizer.command(&TelemetryPacket::default()).is_none());
    }

    #[test]
    fn test_startup_packets_split_calibration() {
        let stabilizer = Stabilizer::default().profile(profile(60, 120));
        let packets = stabilizer.startup_packets();
        assert_eq!(packets.len(), 2);

        let config = packets[0].channel(Channel::Aileron).unwrap();
        assert_eq!(config.output_pin(), Some(5));
        assert_eq!(config.output_range(), Some(Range::new(60, 120)));
        assert_eq!(config.input_range(), None);

        let calibration = packets[1].channel(Channel::Aileron).unwrap();
        assert_eq!(calibration.input_range(), Some(Range::new(1000, 2000)));
        assert_eq!(calibration.output_pin(), None);
    }

    #[tokio::test]
    async fn test_control_loop_on_event_bus() {
        let dispatcher = EventDispatcher::default();
        let mut commands = dispatcher.subscribe(Some(EventFilter::name(names::DEVICE_COMMAND)));
        let task = Stabilizer::default()
            .profile(profile(60, 120))
            .spawn(dispatcher.clone());
        let wait = Duration::from_millis(200);
        let telemetry = rolled(-80.0, 0.0).to_text().unwrap();

        // Samples sent before the loop subscribes are lost
        let mut reply = None;
        for _ in 0..10 {
            dispatcher.send(names::TELEMETRY, Some(telemetry.clone()));
            if let Ok(event) = tokio::time::timeout(Duration::from_millis(20), commands.recv()).await
            {
                reply = event;
                break;
            }
        }
        let packet = reply.unwrap().packet().unwrap();
        assert_eq!(aileron(&packet), Some(120));
        while tokio::time::timeout(Duration::from_millis(20), commands.recv())
            .await
            .is_ok()
        {}

        let takeover = Event::with_packet(
            names::DEVICE_PACKET,
            &ConfigPacket::new_receiver_control(true),
        )
        .unwrap();
        dispatcher.dispatch(takeover);
        dispatcher.send(names::TELEMETRY, Some(telemetry));
        assert!(tokio::time::timeout(wait, commands.recv()).await.is_err());

        dispatcher.send(names::DEVICE_READY, None);
        let first = tokio::time::timeout(wait, commands.recv())
            .await
            .unwrap()
            .unwrap();
        let first = first.packet().unwrap();
        assert_eq!(
            first.channel(Channel::Aileron).and_then(|c| c.output_pin()),
            Some(5)
        );

        task.abort();
    }

    async fn recv_within(sub: &mut Subscription, wait: Duration) -> Option<ConfigPacket> {
        tokio::time::timeout(wait, sub.recv())
            .await
            .ok()
            .flatten()
            .map(|event| event.packet().unwrap())
    }

    #[tokio::test]
    async fn test_commands_on_bus_update_known_state() {
        let dispatcher = EventDispatcher::default();
        let mut commands = dispatcher.subscribe(Some(EventFilter::name(names::DEVICE_COMMAND)));
        let handler = CommandHandler::new(dispatcher.clone());
        let wait = Duration::from_millis(200);

        // Only the throttle is known, so the loop can be probed via device_ready
        let mut seed = ConfigPacket::new();
        seed.set_output_pin(Channel::Throttle, 9);
        let task = Stabilizer::default().profile(seed).spawn(dispatcher.clone());

        let mut started = false;
        for _ in 0..10 {
            dispatcher.send(names::DEVICE_READY, None);
            if recv_within(&mut commands, Duration::from_millis(20)).await.is_some() {
                started = true;
                break;
            }
        }
        assert!(started);
        while recv_within(&mut commands, Duration::from_millis(20)).await.is_some() {}

        let telemetry = rolled(-80.0, 0.0).to_text().unwrap();
        let mut pushed = ConfigPacket::new();
        pushed
            .set_output_pin(Channel::Aileron, 5)
            .set_output_range(Channel::Aileron, Range::new(60, 120));
        assert_eq!(handler.push_profile(&pushed).unwrap(), 1);
        assert!(recv_within(&mut commands, wait).await.is_some());

        dispatcher.send(names::TELEMETRY, Some(telemetry.clone()));
        let packet = recv_within(&mut commands, wait).await.unwrap();
        assert_eq!(aileron(&packet), Some(120));

        handler.set_receiver_control(true).unwrap();
        assert!(recv_within(&mut commands, wait).await.is_some());
        dispatcher.send(names::TELEMETRY, Some(telemetry.clone()));
        assert!(recv_within(&mut commands, wait).await.is_none());

        // Handback from the controller arrives through the relay
        let handback = Event::with_packet(
            names::DEVICE_COMMAND,
            &ConfigPacket::new_receiver_control(false),
        )
        .unwrap()
        .into_remote();
        dispatcher.dispatch(handback);
        assert!(recv_within(&mut commands, wait).await.is_some());
        dispatcher.send(names::TELEMETRY, Some(telemetry));
        let packet = recv_within(&mut commands, wait).await.unwrap();
        assert_eq!(aileron(&packet), Some(120));

        dispatcher.send(names::DEVICE_READY, None);
        let restored = recv_within(&mut commands, wait).await.unwrap();
        let config = restored.channel(Channel::Aileron).unwrap();
        assert_eq!(config.output_pin(), Some(5));
        assert_eq!(config.output_range(), Some(Range::new(60, 120)));

        task.abort();
    }
}
