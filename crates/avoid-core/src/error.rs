//! Error types for the deconfliction core.

use crate::interval::Interval;
use crate::models::VehicleId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeconflictError>;

#[derive(Debug, Error)]
pub enum DeconflictError {
    #[error("no own-vehicle state has been received yet")]
    NoOwnState,

    #[error("vehicle {0} is not tracked")]
    UnknownVehicle(VehicleId),

    #[error("stale data for vehicle {vehicle}: last received {age_ms} ms ago")]
    StaleData { vehicle: VehicleId, age_ms: u64 },

    #[error("prediction failed for pair {a}-{b}: {reason}")]
    Prediction {
        a: VehicleId,
        b: VehicleId,
        reason: String,
    },

    /// Another vehicle computed a different participant set for a window we
    /// also hold a zone for. Left unresolved; the caller decides what to do.
    #[error("participant sets disagree over {interval}: local {local:?}, peer {peer:?}")]
    InconsistentParticipants {
        interval: Interval,
        local: Vec<VehicleId>,
        peer: Vec<VehicleId>,
    },

    #[error("invalid avoidance rules: {0}")]
    InvalidRules(String),

    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rules file: {0}")]
    Json(#[from] serde_json::Error),
}
