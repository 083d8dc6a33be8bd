pub mod detectors;
pub mod pack;
pub mod registry;
pub mod resolver;

pub use pack::{into_strategy_pack, merge_reports, PatchSuggestion, StrategyLoadReport, StrategyPackLoader};
pub use registry::{global_registry, Detector, DetectorRegistry};
pub use resolver::{normalize, ratio, resolve_detector_names, ResolveResult};
