//! noteharvest: multi-tab collection of social-content notes and their
//! comments over one remote-controlled browser session.
//!
//! A run takes a validated link catalog, keeps up to a configured number of
//! detail tabs in flight, expands comments in bounded batches per tab, and
//! persists each note incrementally until a target number of notes is fully
//! complete on disk. Tab indices on the session are volatile, so note identity
//! is carried by the note id alone and indices are re-resolved before every
//! action.

pub mod browser;
pub mod collab;
pub mod core;
pub mod harvest;
pub mod persist;
pub mod platform;

pub use crate::core::types::HarvestReport;
pub use crate::core::{load_harvest_config, HarvestConfig};
pub use crate::harvest::{run_harvest, HarvestOptions, LinkCatalog, TaskScheduler};
