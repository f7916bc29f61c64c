pub mod config;
pub mod types;

pub use config::{load_harvest_config, HarvestConfig};
