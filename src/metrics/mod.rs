mod mae;
mod mse;

pub use mae::MeanAbsoluteError;
pub use mse::MeanSquaredError;

use engine::{Collection, EngineErr, Graph, Op, Output, Tensor};

use crate::Result;

/// The ops backing a streaming metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricOps {
    /// Reads the value accumulated so far.
    pub value: Output,
    /// Accumulates the current `(labels, predictions)` pair.
    pub update: Op,
    /// Clears the accumulators.
    pub reset: Op,
}

/// A metric accumulated over every step of an evaluation.
pub trait Metric: Send + Sync {
    /// The name the metric's value is reported under, unique per estimator.
    fn name(&self) -> &str;

    /// Adds the metric's accumulators and ops to the graph.
    ///
    /// # Arguments
    /// * `graph` - The graph to add the ops to.
    /// * `labels` - The expected values.
    /// * `predictions` - The values produced by the model.
    ///
    /// # Returns
    /// The metric ops, also registered in the metric collections of the graph.
    fn build(&self, graph: &mut Graph, labels: Output, predictions: Output) -> Result<MetricOps>;
}

/// Builds a metric averaging `error` over every value seen since the last reset.
pub(crate) fn streaming_mean(
    graph: &mut Graph,
    name: &str,
    labels: Output,
    predictions: Output,
    error: fn(f32) -> f32,
) -> Result<MetricOps> {
    let ops = graph.with_name_scope("metrics", |graph| {
        graph.with_name_scope(name, |graph| {
            let total = graph.variable("total", Tensor::scalar(0.0))?;
            let count = graph.variable("count", Tensor::scalar(0.0))?;

            let update = graph.op("update", move |scope| {
                let y = scope.eval(labels)?;
                let y_pred = scope.eval(predictions)?;
                let (y, y_pred) = (y.view2()?, y_pred.view2()?);

                if y.dim() != y_pred.dim() {
                    return Err(EngineErr::ShapeMismatch {
                        what: "metric update",
                        got: y_pred.shape().to_vec(),
                        expected: y.shape().to_vec(),
                    });
                }

                let diff = &y_pred - &y;

                let sum: f32 = diff.iter().map(|&d| error(d)).sum();
                let seen = scope.read(total)?.to_scalar()?;
                let n = scope.read(count)?.to_scalar()?;

                scope.assign(total, Tensor::scalar(seen + sum))?;
                scope.assign(count, Tensor::scalar(n + diff.len() as f32))
            })?;

            let reset = graph.op("reset", move |scope| {
                scope.assign(total, Tensor::scalar(0.0))?;
                scope.assign(count, Tensor::scalar(0.0))
            })?;

            let value = graph.output("value", move |scope| {
                let n = scope.read(count)?.to_scalar()?;
                if n == 0.0 {
                    return Ok(Tensor::scalar(0.0));
                }

                let seen = scope.read(total)?.to_scalar()?;
                Ok(Tensor::scalar(seen / n))
            })?;

            engine::Result::Ok(MetricOps {
                value,
                update,
                reset,
            })
        })
    })?;

    graph.add_to_collection(Collection::MetricUpdates, ops.update)?;
    graph.add_to_collection(Collection::MetricResets, ops.reset)?;
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use engine::{Dataset, Session};

    use super::*;

    fn evaluate(metric: &dyn Metric, pairs: Vec<(f32, f32)>) -> (Session, MetricOps, Op) {
        let mut graph = Graph::new();
        let it = graph.iterator("input", 2).unwrap();
        let next = graph.next_element(it).unwrap();
        let ops = metric.build(&mut graph, next[0], next[1]).unwrap();
        let dataset = Dataset::from_elements(
            pairs
                .into_iter()
                .map(|(y, y_pred)| vec![Tensor::scalar(y), Tensor::scalar(y_pred)])
                .collect(),
        );
        let init = graph.initializer(it).unwrap();

        let mut session = Session::new(graph);
        session.feed(it, dataset).unwrap();
        session.run(&[], &[init]).unwrap();
        (session, ops, init)
    }

    #[test]
    fn mean_squared_error_accumulates() {
        let (mut session, ops, _) = evaluate(
            &MeanSquaredError::new(),
            vec![(1.0, 2.0), (0.0, 3.0)],
        );

        session.run(&[], &[ops.update]).unwrap();
        session.run(&[], &[ops.update]).unwrap();
        let value = session.run(&[ops.value], &[]).unwrap();
        assert_eq!(value[0].to_scalar().unwrap(), 5.0);
    }

    #[test]
    fn reset_clears_the_accumulators() {
        let (mut session, ops, _) = evaluate(&MeanAbsoluteError::new(), vec![(1.0, -1.0)]);

        session.run(&[], &[ops.update]).unwrap();
        let value = session.run(&[ops.value], &[]).unwrap();
        assert_eq!(value[0].to_scalar().unwrap(), 2.0);

        session.run(&[], &[ops.reset]).unwrap();
        let value = session.run(&[ops.value], &[]).unwrap();
        assert_eq!(value[0].to_scalar().unwrap(), 0.0);
    }

    #[test]
    fn ops_are_registered_in_collections() {
        let (session, ops, _) = evaluate(&MeanSquaredError::new(), Vec::new());
        let graph = session.graph();

        assert_eq!(graph.collection(Collection::MetricUpdates), [ops.update]);
        assert_eq!(graph.collection(Collection::MetricResets), [ops.reset]);
        assert_eq!(graph.op_name(ops.update), "metrics/mse/update");
    }
}
