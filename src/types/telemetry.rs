//! Telemetry packet and derived craft attitude.
//!
//! The phone lies flat on the craft, screen up, with its top edge pointing
//! either at the nose or at the tail. Raw readings are kept in the phone's
//! sensor frame (x right, y toward the top edge, z out of the screen); craft
//! attitude and rates are derived on demand for a given [`Mounting`].

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Three-axis sensor reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    /// Creates a new vector.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Dot product.
    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x.mul_add(other.x, self.y.mul_add(other.y, self.z * other.z))
    }
}

/// Unit quaternion from a rotation-vector sensor (device to world frame).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    /// No rotation.
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Creates a new quaternion.
    #[must_use]
    pub const fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Rotation of `degrees` about a device axis.
    #[must_use]
    pub fn from_axis_angle(axis: Vector3, degrees: f64) -> Self {
        let half = degrees.to_radians() / 2.0;
        let norm = axis.dot(axis).sqrt();
        let s = half.sin() / norm;
        Self::new(half.cos(), axis.x * s, axis.y * s, axis.z * s)
    }

    /// Rotates a device-frame vector into the world frame.
    #[must_use]
    pub fn rotate(self, v: Vector3) -> Vector3 {
        let Self { w, x, y, z } = self;
        Vector3 {
            x: (1.0 - 2.0 * (y * y + z * z)) * v.x
                + 2.0 * (x * y - w * z) * v.y
                + 2.0 * (x * z + w * y) * v.z,
            y: 2.0 * (x * y + w * z) * v.x
                + (1.0 - 2.0 * (x * x + z * z)) * v.y
                + 2.0 * (y * z - w * x) * v.z,
            z: 2.0 * (x * z - w * y) * v.x
                + 2.0 * (y * z + w * x) * v.y
                + (1.0 - 2.0 * (x * x + y * y)) * v.z,
        }
    }
}

/// GPS fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    /// Bearing in degrees.
    pub bearing: f64,
    /// Altitude in meters.
    pub altitude: f64,
}

/// How the phone is mounted on the craft.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mounting {
    /// Top edge of the phone points at the nose.
    #[default]
    FacingNose,
    /// Top edge of the phone points at the tail.
    FacingTail,
}

impl Mounting {
    /// Maps the "phone faces nose" flag to a mounting.
    #[must_use]
    pub const fn from_facing_nose(facing_nose: bool) -> Self {
        if facing_nose {
            Self::FacingNose
        } else {
            Self::FacingTail
        }
    }

    /// Craft forward, right and up axes in the phone's frame.
    const fn axes(self) -> (Vector3, Vector3, Vector3) {
        let up = Vector3::new(0.0, 0.0, 1.0);
        match self {
            Self::FacingNose => (Vector3::new(0.0, 1.0, 0.0), Vector3::new(1.0, 0.0, 0.0), up),
            Self::FacingTail => (
                Vector3::new(0.0, -1.0, 0.0),
                Vector3::new(-1.0, 0.0, 0.0),
                up,
            ),
        }
    }
}

/// Craft attitude in degrees.
///
/// Roll is positive right wing down, pitch positive nose up, yaw is the
/// heading clockwise from north in `[0, 360)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Craft angular rates in degrees per second, same sign convention as
/// [`Attitude`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Sensor snapshot sent by the craft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryPacket {
    /// Angular velocity in rad/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angular_velocity: Option<Vector3>,
    /// Barometric pressure in hPa.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    /// Linear acceleration in m/s².
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<Vector3>,
    /// Magnetic field in µT.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnetic_field: Option<Vector3>,
    /// Raw orientation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Quaternion>,
    /// Location fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl TelemetryPacket {
    /// Parses a packet from its text form.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the packet to its text form.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Craft attitude, if orientation is present.
    #[must_use]
    pub fn attitude(&self, mounting: Mounting) -> Option<Attitude> {
        let q = self.orientation?;
        let (forward, right, up) = mounting.axes();
        let forward = q.rotate(forward);
        let right = q.rotate(right);
        let up = q.rotate(up);

        let yaw = forward.x.atan2(forward.y).to_degrees().rem_euclid(360.0);
        Some(Attitude {
            roll: (-right.z).atan2(up.z).to_degrees(),
            pitch: forward.z.clamp(-1.0, 1.0).asin().to_degrees(),
            yaw,
        })
    }

    /// Craft angular rates, if angular velocity is present.
    #[must_use]
    pub fn rates(&self, mounting: Mounting) -> Option<Rates> {
        let omega = self.angular_velocity?;
        let (forward, right, up) = mounting.axes();
        Some(Rates {
            roll: omega.dot(forward).to_degrees(),
            pitch: omega.dot(right).to_degrees(),
            yaw: -omega.dot(up).to_degrees(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn tilted(axis: Vector3, degrees: f64) -> TelemetryPacket {
        TelemetryPacket {
            orientation: Some(Quaternion::from_axis_angle(axis, degrees)),
            ..TelemetryPacket::default()
        }
    }

    #[test]
    fn test_level_attitude() {
        let packet = tilted(Vector3::new(0.0, 0.0, 1.0), 0.0);
        let attitude = packet.attitude(Mounting::FacingNose).unwrap();
        assert!(attitude.roll.abs() < EPS);
        assert!(attitude.pitch.abs() < EPS);
        assert!(attitude.yaw.abs() < EPS);
    }

    #[test]
    fn test_roll_sign_follows_mounting() {
        // Rotating about the phone's long axis drops its right edge.
        let packet = tilted(Vector3::new(0.0, 1.0, 0.0), 30.0);

        let nose = packet.attitude(Mounting::FacingNose).unwrap();
        assert!((nose.roll - 30.0).abs() < 1e-6);
        assert!(nose.pitch.abs() < 1e-6);

        let tail = packet.attitude(Mounting::FacingTail).unwrap();
        assert!((tail.roll + 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_pitch_and_yaw() {
        let nose_up = tilted(Vector3::new(1.0, 0.0, 0.0), 20.0);
        let attitude = nose_up.attitude(Mounting::FacingNose).unwrap();
        assert!((attitude.pitch - 20.0).abs() < 1e-6);
        assert!((nose_up.attitude(Mounting::FacingTail).unwrap().pitch + 20.0).abs() < 1e-6);

        // Turning counter-clockwise (seen from above) by 90 degrees faces west.
        let west = tilted(Vector3::new(0.0, 0.0, 1.0), 90.0);
        assert!((west.attitude(Mounting::FacingNose).unwrap().yaw - 270.0).abs() < 1e-6);
        assert!((west.attitude(Mounting::FacingTail).unwrap().yaw - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_rates() {
        let packet = TelemetryPacket {
            angular_velocity: Some(Vector3::new(0.0, 1.0, 0.5)),
            ..TelemetryPacket::default()
        };

        let nose = packet.rates(Mounting::FacingNose).unwrap();
        assert!((nose.roll - 1.0_f64.to_degrees()).abs() < EPS);
        assert!(nose.pitch.abs() < EPS);
        assert!((nose.yaw + 0.5_f64.to_degrees()).abs() < EPS);

        let tail = packet.rates(Mounting::FacingTail).unwrap();
        assert!((tail.roll + 1.0_f64.to_degrees()).abs() < EPS);
    }

    #[test]
    fn test_missing_readings() {
        let packet = TelemetryPacket::default();
        assert!(packet.attitude(Mounting::FacingNose).is_none());
        assert!(packet.rates(Mounting::FacingNose).is_none());
        assert_eq!(packet.to_text().unwrap(), "{}");
    }

    #[test]
    fn test_telemetry_text_round_trip() {
        let packet = TelemetryPacket {
            angular_velocity: Some(Vector3::new(0.1, -0.2, 0.3)),
            pressure: Some(1013.25),
            orientation: Some(Quaternion::IDENTITY),
            location: Some(Location {
                latitude: 52.5,
                longitude: 13.4,
                accuracy: 4.0,
                bearing: 90.0,
                altitude: 34.0,
            }),
            ..TelemetryPacket::default()
        };

        let text = packet.to_text().unwrap();
        assert!(text.contains("\"angularVelocity\""));
        assert!(!text.contains("magneticField"));
        assert_eq!(TelemetryPacket::parse(&text).unwrap(), packet);
    }
}
