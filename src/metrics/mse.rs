use engine::{Graph, Output};

use super::{Metric, MetricOps, streaming_mean};
use crate::Result;

/// Streaming mean squared error.
#[derive(Debug, Clone)]
pub struct MeanSquaredError {
    name: String,
}

impl MeanSquaredError {
    /// Returns a new `MeanSquaredError` reported as `mse`.
    pub fn new() -> Self {
        Self::named("mse")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Default for MeanSquaredError {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for MeanSquaredError {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, graph: &mut Graph, labels: Output, predictions: Output) -> Result<MetricOps> {
        streaming_mean(graph, &self.name, labels, predictions, |d| d.powi(2))
    }
}
