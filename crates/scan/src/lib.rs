pub mod engine;
pub mod params;
pub mod regime;
pub mod scheduler;

pub use engine::{detector_weight, to_candidate, ScanEngine, ScanEngineConfig};
pub use scheduler::Scheduler;
