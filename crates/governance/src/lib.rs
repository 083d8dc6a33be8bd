pub mod selector;
pub mod state_store;

pub use selector::{rank, select, Candidate, SelectionResult};
pub use state_store::{make_daily_bucket, make_key, SignalStateStore};
