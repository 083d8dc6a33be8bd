pub mod cache;
pub mod ingestor;
pub mod resample;

pub use cache::MarketDataCache;
pub use ingestor::{DataIngestor, IngestorConfig};
pub use resample::resample;
