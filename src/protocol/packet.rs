//! Packet-level encoding and classification for the device link.
//!
//! A decoded frame carries one configuration packet, which may mix several
//! kinds of content. [`classify`] splits it so each kind can take its own
//! path: values go through the coalescer, status and errors are surfaced
//! immediately, and whatever configuration remains is forwarded as-is.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::frame;
use crate::types::{ConfigPacket, DeviceStatus};

/// One piece of inbound device content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Device reported `ready`.
    Ready,
    /// Device reported an error, verbatim.
    Error(String),
    /// Live channel values.
    Values(ConfigPacket),
    /// Remaining configuration (echoed settings, calibration ranges, flags).
    Config(ConfigPacket),
}

/// Serializes and frames a packet for the wire.
pub fn encode_packet(packet: &ConfigPacket) -> Result<Bytes> {
    let text = packet.to_text()?;
    Ok(frame::encode(text.as_bytes())?)
}

/// Parses a frame payload into a packet.
pub fn decode_payload(payload: &[u8]) -> Result<ConfigPacket> {
    ConfigPacket::from_slice(payload)
}

/// Splits an inbound packet by kind, in a fixed order: status, error,
/// values, remaining configuration. Empty parts are omitted.
#[must_use]
pub fn classify(mut packet: ConfigPacket) -> Vec<Inbound> {
    let mut parts = Vec::new();

    if packet.take_status() == Some(DeviceStatus::Ready) {
        parts.push(Inbound::Ready);
    }
    if let Some(message) = packet.take_error() {
        parts.push(Inbound::Error(message));
    }
    let values = packet.take_values();
    if !values.is_empty() {
        parts.push(Inbound::Values(values));
    }
    if !packet.is_empty() {
        parts.push(Inbound::Config(packet));
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    #[test]
    fn test_encode_packet() {
        let frame = encode_packet(&ConfigPacket::new_status_request()).unwrap();
        assert_eq!(&frame[..], b"@{\"statusRequest\":true}#");
    }

    #[test]
    fn test_encode_rejects_marker_in_text() {
        let packet = ConfigPacket::new_error("channel #3");
        assert!(matches!(
            encode_packet(&packet),
            Err(crate::Error::Frame(_))
        ));
    }

    #[test]
    fn test_classify_mixed_packet() {
        let packet = decode_payload(
            br#"{"status":"ready","error":"low battery","rudder":{"output":{"value":80,"pin":3}}}"#,
        )
        .unwrap();

        let mut values = ConfigPacket::new();
        values.set_value(Channel::Rudder, 80);
        let mut config = ConfigPacket::new();
        config.set_output_pin(Channel::Rudder, 3);

        assert_eq!(
            classify(packet),
            vec![
                Inbound::Ready,
                Inbound::Error("low battery".into()),
                Inbound::Values(values),
                Inbound::Config(config),
            ]
        );
    }

    #[test]
    fn test_classify_values_only() {
        let packet = decode_payload(br#"{"aileron":{"output":{"value":91}}}"#).unwrap();
        let parts = classify(packet);
        assert_eq!(parts.len(), 1);
        assert!(matches!(parts[0], Inbound::Values(_)));
    }

    #[test]
    fn test_classify_empty_packet() {
        assert!(classify(ConfigPacket::new()).is_empty());
    }

    #[test]
    fn test_decode_malformed_payload() {
        assert!(decode_payload(b"{\"aileron\":{").is_err());
        assert!(decode_payload(b"partial").is_err());
    }
}
