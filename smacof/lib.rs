#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod anneal;
pub mod cg;
pub mod config;
pub mod distances;
pub mod io;
pub mod kernel;
pub mod partition;
pub mod runner;
pub mod stats;
pub mod timing;
pub mod types;

// Process, node and thread tiers of the collective layer
#[path = "../comm/mod.rs"]
pub mod comm;

pub use anneal::AnnealOutcome;
pub use config::{ConfigError, SolverConfig, WeightMode};
pub use io::InputSet;
pub use runner::run_local;
pub use types::{PointSet, SmacofError};
