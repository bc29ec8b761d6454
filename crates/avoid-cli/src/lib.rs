//! Replay tooling for the deconfliction engine.
//!
//! - `scenario`: recorded surveillance frames loaded from JSON
//! - `replay`: drives an engine over a scenario, inline or on a tokio clock

pub mod replay;
pub mod scenario;

pub use replay::{replay_inline, replay_realtime, LayerLog, ReplayLine, ReplaySummary};
pub use scenario::{Frame, Scenario};
