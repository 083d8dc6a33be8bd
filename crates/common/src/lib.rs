pub mod config;
pub mod error;
pub mod params;
pub mod provider;
pub mod types;

pub use config::{Config, NotifyMode};
pub use error::{Error, Result};
pub use params::{family_of, merge_params, param_f64, param_usize};
pub use provider::{Notifier, Provider};
pub use types::*;
