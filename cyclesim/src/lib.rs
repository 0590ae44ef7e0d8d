//! # cyclesim
//!
//! Per-cycle driver for a simulator taking part in a lockstep run. Before
//! each rising clock edge the driver meets the other simulators at a
//! `cyclebar` barrier through the [`cyclebar_dpi::Bridge`], then checks the
//! barrier's cycle count against its own.

pub mod config;
pub mod driver;
pub mod model;
pub mod plusargs;
pub mod summary;

pub use config::{DriverConfig, SimCli};
pub use driver::{check_cycle, Driver, DriverError, RunSummary, StopReason};
pub use model::{ClockedModel, CounterModel};

pub fn init_logging(max_level: &str) {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(max_level));
}
