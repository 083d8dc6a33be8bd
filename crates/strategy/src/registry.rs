use std::collections::HashMap;
use std::sync::OnceLock;

use common::{DetectorHit, ScanContext};

/// Pure, stateless detector: given a fully-built `ScanContext`, either finds
/// a setup-worthy condition or doesn't. Detectors never fetch data, never
/// sleep, never touch the filesystem — everything they need is already on
/// `ScanContext`.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ctx: &ScanContext) -> Option<DetectorHit>;
}

type DetectorFactory = fn() -> Box<dyn Detector>;

/// Process-wide detector registry. Built once from the compiled-in detector
/// set; strategy packs reference detectors by name and are resolved against
/// this registry at load time.
pub struct DetectorRegistry {
    factories: HashMap<&'static str, DetectorFactory>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        DetectorRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, factory: DetectorFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().map(|s| s.to_string()).collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str) -> Option<Box<dyn Detector>> {
        self.factories.get(name).map(|f| f())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: OnceLock<DetectorRegistry> = OnceLock::new();

/// The process-wide registry, populated once with every built-in detector.
/// `DESIGN.md` records this as the deliberate choice over per-engine
/// registries: strategy packs only ever need to resolve names against one
/// fixed universe of compiled detectors.
pub fn global_registry() -> &'static DetectorRegistry {
    REGISTRY.get_or_init(|| {
        let mut reg = DetectorRegistry::new();
        crate::detectors::register_all(&mut reg);
        reg
    })
}
