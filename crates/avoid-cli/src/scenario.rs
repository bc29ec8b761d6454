//! Recorded scenarios for replay.

use anyhow::{bail, Context, Result};
use avoid_core::{AdsbVehicle, Millis, SharedFeed, VehicleId, VehicleReport};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_tick_ms() -> Millis {
    100
}

/// A recording of what one vehicle heard, frame by frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Id the replayed engine runs as
    pub own_id: VehicleId,
    /// Engine tick cadence
    #[serde(default = "default_tick_ms")]
    pub tick_ms: Millis,
    pub frames: Vec<Frame>,
}

/// Reports delivered at one instant of the recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    pub at_ms: Millis,
    #[serde(default)]
    pub own: Option<VehicleReport>,
    #[serde(default)]
    pub traffic: Vec<VehicleReport>,
    /// Traffic still in receiver wire units
    #[serde(default)]
    pub adsb: Vec<AdsbVehicle>,
    /// Vehicles the receiver stopped tracking
    #[serde(default)]
    pub lost: Vec<VehicleId>,
}

impl Frame {
    /// Deposit this frame into the handoff, stamped at `now`.
    pub fn publish(&self, feed: &SharedFeed, now: Millis) {
        if let Some(own) = &self.own {
            feed.publish_own(own.clone());
        }
        for report in &self.traffic {
            feed.publish_traffic(report.clone(), now);
        }
        for raw in &self.adsb {
            feed.publish_traffic(VehicleReport::from_adsb(raw), now);
        }
        for id in &self.lost {
            feed.remove_vehicle(*id);
        }
    }
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let scenario: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing scenario {}", path.display()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            bail!("tick_ms must be positive");
        }
        if self.frames.windows(2).any(|w| w[0].at_ms > w[1].at_ms) {
            bail!("frames must be ordered by at_ms");
        }
        let lists_own = |f: &Frame| {
            f.traffic.iter().any(|r| r.id == self.own_id) || f.adsb.iter().any(|r| r.icao_address == self.own_id)
        };
        if let Some(frame) = self.frames.iter().find(|f| lists_own(f)) {
            bail!("frame at {} ms lists the own vehicle as traffic", frame.at_ms);
        }
        Ok(())
    }

    /// Time of the last frame; replay runs one tick past it.
    pub fn end_ms(&self) -> Millis {
        self.frames.last().map_or(0, |f| f.at_ms)
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}
