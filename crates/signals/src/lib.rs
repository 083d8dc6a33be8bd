pub mod store;

pub use store::{PublicSignalRecord, SignalsStore};
