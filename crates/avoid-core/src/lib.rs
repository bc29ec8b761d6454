pub mod engine;
pub mod error;
pub mod feed;
pub mod interval;
pub mod models;
pub mod predictor;
pub mod rules;
pub mod spatial;
pub mod vehicle;
pub mod zone;

pub use engine::{DeconflictionEngine, Diagnostic, LayerAdvisory, LayerSink, TickReport, TickStatus};
pub use error::{DeconflictError, Result};
pub use feed::{IngestMarker, SelfReport, SharedFeed, SurveillanceFeed, TrafficEntry};
pub use interval::Interval;
pub use models::{AdsbVehicle, Location, Millis, Vector3, VehicleId, VehicleReport};
pub use predictor::{LinearPredictor, TrajectoryPredictor};
pub use rules::{AvoidanceRules, ChangeMarker};
pub use spatial::haversine_distance;
pub use vehicle::VehicleRecord;
pub use zone::{ConflictZone, FlattenOutcome, ZoneGraph, ZoneId};
