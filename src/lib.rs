pub mod checkpoint;
pub mod config;
pub mod error;
pub mod estimator;
pub mod freeze;
pub mod hooks;
pub mod metrics;
pub mod model;
pub mod session;
pub mod summary;

pub use config::Configuration;
pub use error::{EstimatorErr, Result};
pub use estimator::{Estimator, EstimatorBuilder, EvaluateOptions, Evaluation, Inference};
pub use session::{MonitoredSession, SessionState, Step};
