pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{Config, SharedConfig};
pub use error::{Error, Result};
