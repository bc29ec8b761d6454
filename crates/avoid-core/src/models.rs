//! Core data models shared by the feed, predictor and engine.

use serde::{Deserialize, Serialize};

/// Engine clock in milliseconds. Only differences are meaningful.
pub type Millis = u64;

/// Surveillance identifier of a vehicle (ICAO address for ADS-B traffic).
pub type VehicleId = u32;

/// Geodetic position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64, altitude_m: f64) -> Self {
        Self { lat, lon, altitude_m }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.altitude_m.is_finite()
    }
}

/// Velocity in m/s: `x` east, `y` north, `z` up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn horizontal_speed(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Latest kinematic report for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleReport {
    pub id: VehicleId,
    /// Feed-supplied marker; equal values mean "same message", nothing more.
    #[serde(default)]
    pub timestamp: u64,
    pub location: Location,
    #[serde(default)]
    pub velocity: Vector3,
}

impl VehicleReport {
    pub fn new(id: VehicleId, timestamp: u64, location: Location, velocity: Vector3) -> Self {
        Self {
            id,
            timestamp,
            location,
            velocity,
        }
    }

    /// Convert decoded ADS-B vehicle fields into SI units.
    pub fn from_adsb(adsb: &AdsbVehicle) -> Self {
        let heading_rad = (f64::from(adsb.heading_cdeg) * 0.01).to_radians();
        let ground_speed = f64::from(adsb.hor_velocity_cms) * 0.01;

        Self {
            id: adsb.icao_address,
            timestamp: u64::from(adsb.last_update_ms),
            location: Location {
                lat: f64::from(adsb.lat_e7) * 1e-7,
                lon: f64::from(adsb.lon_e7) * 1e-7,
                altitude_m: f64::from(adsb.altitude_mm) * 0.001,
            },
            velocity: Vector3 {
                x: ground_speed * heading_rad.sin(),
                y: ground_speed * heading_rad.cos(),
                z: f64::from(adsb.ver_velocity_cms) * 0.01,
            },
        }
    }

    pub fn is_finite(&self) -> bool {
        self.location.is_finite() && self.velocity.is_finite()
    }
}

/// Decoded ADS-B vehicle report in wire units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdsbVehicle {
    pub icao_address: u32,
    /// Degrees * 1e7
    pub lat_e7: i32,
    /// Degrees * 1e7
    pub lon_e7: i32,
    pub altitude_mm: i32,
    /// Course over ground, centidegrees from north
    pub heading_cdeg: u16,
    pub hor_velocity_cms: u16,
    /// Positive up
    pub ver_velocity_cms: i16,
    pub last_update_ms: u32,
}
