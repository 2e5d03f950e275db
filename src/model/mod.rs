mod linear;

pub use linear::LinearRegression;

use engine::{Graph, IteratorHandle, Op, Output};

use crate::{Result, metrics::Metric, metrics::MetricOps};

/// The mode a model instance was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Infer,
    Evaluate,
}

/// The metric ops of an evaluation instance, in the order the metrics were configured.
#[derive(Debug, Clone, Default)]
pub struct EvalOps {
    pub metrics: Vec<(String, MetricOps)>,
}

impl EvalOps {
    pub fn get(&self, name: &str) -> Option<&MetricOps> {
        self.metrics
            .iter()
            .find_map(|(metric, ops)| (metric == name).then_some(ops))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|(name, _)| name.as_str())
    }
}

/// The graph handles a model exposes for one mode.
///
/// Built once per mode when the estimator is constructed, then only read.
#[derive(Debug, Clone)]
pub struct ModelInstance {
    pub mode: Mode,
    /// The iterator feeding this mode, the estimator installs its initializer.
    pub iterator: IteratorHandle,
    pub input: Output,
    pub output: Output,
    pub target: Option<Output>,
    pub loss: Option<Output>,
    pub gradients: Vec<Output>,
    pub train_op: Option<Op>,
    pub eval: EvalOps,
}

/// Builds the graph of a model for every mode.
///
/// Variables are expected to be shared between modes, so implementations should
/// create them with `Graph::get_or_create_variable`.
pub trait Model: Send {
    /// Builds the ops used for training: the elements of the train iterator are
    /// `(features, targets)` pairs.
    fn build_train_ops(&self, graph: &mut Graph) -> Result<ModelInstance>;

    /// Builds the ops used for inference: the elements of the infer iterator only
    /// hold features.
    fn build_infer_ops(&self, graph: &mut Graph) -> Result<ModelInstance>;

    /// Builds the ops used for evaluation.
    ///
    /// # Arguments
    /// * `graph` - The graph to add the ops to.
    /// * `metrics` - The metrics to compute over `(targets, predictions)`.
    fn build_eval_ops(
        &self,
        graph: &mut Graph,
        metrics: &[Box<dyn Metric>],
    ) -> Result<ModelInstance>;
}
