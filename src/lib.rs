//! Component scoring and composite aggregation for school accountability.
//!
//! Student records are grouped and measured per indicator, turned into points
//! by the indicator's scoring family, and combined into one composite per
//! school and model. Every rule (weights, grade bands, cut scores, subgroup
//! labels, N-counts) is configuration.

pub mod aggregate;
pub mod composite;
pub mod config;
pub mod error;
pub mod history;
pub mod indicator;
pub mod orchestrator;
pub mod output;
pub mod records;
pub mod stats;
pub mod store;
pub mod table;
pub mod telemetry;

pub use error::EngineError;
