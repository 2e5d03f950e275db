use engine::{Graph, Output};

use super::{Metric, MetricOps, streaming_mean};
use crate::Result;

/// Streaming mean absolute error.
#[derive(Debug, Clone)]
pub struct MeanAbsoluteError {
    name: String,
}

impl MeanAbsoluteError {
    /// Returns a new `MeanAbsoluteError` reported as `mae`.
    pub fn new() -> Self {
        Self::named("mae")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Default for MeanAbsoluteError {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, graph: &mut Graph, labels: Output, predictions: Output) -> Result<MetricOps> {
        streaming_mean(graph, &self.name, labels, predictions, f32::abs)
    }
}
