//! Latest-state handoff between surveillance ingestion and the engine.
//!
//! Ingestion writes whole reports; the engine reads snapshots once per tick.
//! Nothing here touches the zone graph.

use crate::models::{Millis, VehicleId, VehicleReport};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// The own vehicle's last self-reported state.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfReport {
    /// Bumped by the handoff on every publish
    pub generation: u64,
    pub report: VehicleReport,
}

/// Latest report for one other vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficEntry {
    pub report: VehicleReport,
    /// Engine time the report was deposited
    pub received_at: Millis,
}

/// Change markers for the traffic source as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestMarker {
    pub generation: u64,
    /// Raw timestamp of the most recent traffic message
    pub timestamp: u64,
    /// Bumped whenever vehicles stop being tracked
    pub removals: u64,
}

/// Read side of the surveillance feed as seen by the engine.
pub trait SurveillanceFeed {
    fn last_self_report(&self) -> Option<SelfReport>;

    fn last_ingest_marker(&self) -> IngestMarker;

    fn tracked_vehicles(&self) -> Vec<TrafficEntry>;
}

/// Single-writer/single-reader store of the latest state per vehicle.
#[derive(Debug, Default)]
pub struct SharedFeed {
    own: Mutex<Option<SelfReport>>,
    traffic: DashMap<VehicleId, TrafficEntry>,
    own_generation: AtomicU64,
    traffic_generation: AtomicU64,
    last_ingest_timestamp: AtomicU64,
    removals: AtomicU64,
}

impl SharedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the own vehicle's state. Returns the new generation.
    pub fn publish_own(&self, report: VehicleReport) -> u64 {
        let generation = self.own_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut own = self.own.lock().unwrap_or_else(PoisonError::into_inner);
        *own = Some(SelfReport { generation, report });
        generation
    }

    /// Replace one vehicle's state. Returns the new traffic generation.
    pub fn publish_traffic(&self, report: VehicleReport, received_at: Millis) -> u64 {
        self.last_ingest_timestamp
            .store(report.timestamp, Ordering::SeqCst);
        self.traffic
            .insert(report.id, TrafficEntry { report, received_at });
        self.traffic_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stop tracking a vehicle.
    pub fn remove_vehicle(&self, id: VehicleId) -> bool {
        let removed = self.traffic.remove(&id).is_some();
        if removed {
            self.removals.fetch_add(1, Ordering::SeqCst);
            self.traffic_generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Drop traffic not heard from since `cutoff`. Returns how many went.
    pub fn prune_older_than(&self, cutoff: Millis) -> usize {
        let before = self.traffic.len();
        self.traffic.retain(|_, entry| entry.received_at >= cutoff);
        let pruned = before.saturating_sub(self.traffic.len());
        if pruned > 0 {
            self.removals.fetch_add(1, Ordering::SeqCst);
            self.traffic_generation.fetch_add(1, Ordering::SeqCst);
        }
        pruned
    }

    pub fn traffic_count(&self) -> usize {
        self.traffic.len()
    }
}

impl SurveillanceFeed for SharedFeed {
    fn last_self_report(&self) -> Option<SelfReport> {
        self.own
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn last_ingest_marker(&self) -> IngestMarker {
        IngestMarker {
            generation: self.traffic_generation.load(Ordering::SeqCst),
            timestamp: self.last_ingest_timestamp.load(Ordering::SeqCst),
            removals: self.removals.load(Ordering::SeqCst),
        }
    }

    fn tracked_vehicles(&self) -> Vec<TrafficEntry> {
        let mut entries: Vec<TrafficEntry> = self.traffic.iter().map(|r| r.value().clone()).collect();
        entries.sort_by_key(|entry| entry.report.id);
        entries
    }
}
