//! GrowthBook SDK for Rust: condition evaluation, feature/experiment
//! evaluation with sticky bucketing, and a concurrent client with
//! polling/SSE background data sources.
pub mod client;
pub mod condition;
pub mod datasource;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod sticky_bucket;
pub mod util;
pub mod value;

pub use client::{DataSourceConfig, GrowthBookClient, GrowthBookClientBuilder};
pub use error::GrowthBookError;
pub use model::{Experiment, ExperimentResult, Feature, FeatureResult, Source};
