//! Shared types for the inspection engine: persisted entities, configuration
//! and the cluster registry.

pub mod clusters;
pub mod config;
pub mod error;
pub mod model;

pub use config::Config;
pub use error::*;
pub use model::*;
