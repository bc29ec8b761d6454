//! Tracked vehicle records and their conflict-zone timelines.

use crate::models::{Location, Millis, Vector3, VehicleId, VehicleReport};
use crate::zone::ZoneId;

/// A tracked aircraft: latest kinematic state plus its timeline.
///
/// `zones` is ordered by zone start and, outside of an active merge pass,
/// never holds two zones that overlap by a positive duration. The zone
/// graph owns the zones; the record only holds handles.
#[derive(Debug, Clone)]
pub struct VehicleRecord {
    pub id: VehicleId,
    /// Engine time the state was last refreshed.
    pub last_update: Millis,
    /// Feed marker of the report the state came from.
    pub marker: u64,
    pub position: Location,
    pub velocity: Vector3,
    pub(crate) zones: Vec<ZoneId>,
}

impl VehicleRecord {
    /// Create a record from a report with an empty timeline.
    pub fn from_report(report: &VehicleReport, now: Millis) -> Self {
        Self {
            id: report.id,
            last_update: now,
            marker: report.timestamp,
            position: report.location,
            velocity: report.velocity,
            zones: Vec::new(),
        }
    }

    /// Refresh kinematic state. The timeline is left untouched.
    pub fn update(&mut self, report: &VehicleReport, now: Millis) {
        self.last_update = now;
        self.marker = report.timestamp;
        self.position = report.location;
        self.velocity = report.velocity;
    }

    /// Zone handles in chronological order.
    pub fn zones(&self) -> &[ZoneId] {
        &self.zones
    }

    pub fn in_conflict(&self) -> bool {
        !self.zones.is_empty()
    }

    pub(crate) fn forget(&mut self, zone: ZoneId) {
        self.zones.retain(|z| *z != zone);
    }

    /// Rebuild the kinematic snapshot as a report, for the predictor.
    pub fn as_report(&self) -> VehicleReport {
        VehicleReport {
            id: self.id,
            timestamp: self.marker,
            location: self.position,
            velocity: self.velocity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_keeps_timeline() {
        let report = VehicleReport::new(7, 1, Location::new(33.0, -117.0, 50.0), Vector3::default());
        let mut record = VehicleRecord::from_report(&report, 100);
        record.zones.push(ZoneId::from_raw(3));

        let newer = VehicleReport::new(7, 2, Location::new(33.1, -117.0, 55.0), Vector3::new(1.0, 0.0, 0.0));
        record.update(&newer, 200);

        assert_eq!(record.last_update, 200);
        assert_eq!(record.marker, 2);
        assert_eq!(record.position.altitude_m, 55.0);
        assert_eq!(record.zones(), &[ZoneId::from_raw(3)]);
    }

    #[test]
    fn test_forget_removes_handle() {
        let report = VehicleReport::new(1, 0, Location::new(0.0, 0.0, 0.0), Vector3::default());
        let mut record = VehicleRecord::from_report(&report, 0);
        record.zones = vec![ZoneId::from_raw(1), ZoneId::from_raw(2)];
        record.forget(ZoneId::from_raw(1));
        assert_eq!(record.zones(), &[ZoneId::from_raw(2)]);
        assert!(record.in_conflict());
    }
}
