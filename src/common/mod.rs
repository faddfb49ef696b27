//! Common utilities and types shared across veilq

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Config, DelayConfig, ElectionConfig, InstanceConfig};
pub use error::{Error, Result};
pub use metrics::{Counter, Gauge, Metrics};
pub use utils::{machine_name, timestamp_now, timestamp_now_millis};
