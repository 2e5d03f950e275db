use engine::{EngineErr, Graph, Output, Tensor, Variable};
use ndarray::{Array2, Axis};
use rand::Rng;

use super::{EvalOps, Mode, Model, ModelInstance};
use crate::{EstimatorErr, Result, metrics::Metric};

/// A single dense layer without activation, trained on the mean squared error
/// with plain gradient descent.
///
/// Features are `[batch, inputs]` matrices and targets `[batch, outputs]`
/// matrices. With a single input or output a `[batch]` vector works as well.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    inputs: usize,
    outputs: usize,
    learning_rate: f32,
}

impl LinearRegression {
    /// Creates a new `LinearRegression`.
    ///
    /// # Arguments
    /// * `inputs` - The amount of features of every sample.
    /// * `outputs` - The amount of values predicted for every sample.
    /// * `learning_rate` - The gradient descent step size.
    pub fn new(inputs: usize, outputs: usize, learning_rate: f32) -> Self {
        Self {
            inputs,
            outputs,
            learning_rate,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.inputs == 0 || self.outputs == 0 {
            return Err(EstimatorErr::InvalidConfig(format!(
                "linear regression dimensions must be positive, got ({}, {})",
                self.inputs, self.outputs
            )));
        }

        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(EstimatorErr::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }

        Ok(())
    }

    /// Returns the weights and biases shared by every mode.
    fn params(&self, graph: &mut Graph) -> Result<(Variable, Variable)> {
        let (inputs, outputs) = (self.inputs, self.outputs);
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();

        let params = graph.with_name_scope("linear", |graph| {
            let weights = graph.get_or_create_variable("weights", |graph| {
                let mut rng = graph.rng();
                let w = Array2::from_shape_fn((inputs, outputs), |_| {
                    rng.random_range(-limit..limit)
                });
                Tensor::from_array2(w)
            })?;

            let bias = graph.get_or_create_variable("bias", |_| {
                Tensor::vector(vec![0.0; outputs])
            })?;

            engine::Result::Ok((weights, bias))
        })?;

        Ok(params)
    }

    /// Adds the node computing `x · w + b`.
    fn forward(&self, graph: &mut Graph, x: Output) -> Result<Output> {
        let (weights, bias) = self.params(graph)?;

        let output = graph.output("linear/forward", move |scope| {
            let x = scope.eval(x)?;
            let w = scope.read(weights)?;
            let b = scope.read(bias)?;
            let (x, w) = (x.view2()?, w.view2()?);

            if x.ncols() != w.nrows() {
                return Err(EngineErr::ShapeMismatch {
                    what: "linear regression features",
                    got: x.shape().to_vec(),
                    expected: vec![x.nrows(), w.nrows()],
                });
            }

            let mut z = x.dot(&w);
            z += &b.view1();
            Ok(Tensor::from_array2(z))
        })?;

        Ok(output)
    }

    /// Adds the mean squared error between `y_pred` and `y`.
    fn loss(&self, graph: &mut Graph, y_pred: Output, y: Output) -> Result<Output> {
        let loss = graph.output("linear/loss", move |scope| {
            let y_pred = scope.eval(y_pred)?;
            let y = scope.eval(y)?;
            let (y_pred, y) = (y_pred.view2()?, y.view2()?);
            ensure_same_dim(y_pred.dim(), y.dim())?;

            let mse = (&y_pred - &y)
                .mapv(|x| x.powi(2))
                .mean()
                .unwrap_or_default();

            Ok(Tensor::scalar(mse))
        })?;

        Ok(loss)
    }

    /// Adds the gradients of the loss with respect to the weights and biases.
    fn gradients(
        &self,
        graph: &mut Graph,
        x: Output,
        y_pred: Output,
        y: Output,
    ) -> Result<(Output, Output)> {
        let delta = graph.output("linear/delta", move |scope| {
            let y_pred = scope.eval(y_pred)?;
            let y = scope.eval(y)?;
            let (y_pred, y) = (y_pred.view2()?, y.view2()?);
            ensure_same_dim(y_pred.dim(), y.dim())?;

            let d = (&y_pred - &y) * (2.0 / y_pred.len() as f32);
            Ok(Tensor::from_array2(d))
        })?;

        let grad_w = graph.output("linear/grad_weights", move |scope| {
            let x = scope.eval(x)?;
            let d = scope.eval(delta)?;
            let dw = x.view2()?.t().dot(&d.view2()?);
            Ok(Tensor::from_array2(dw))
        })?;

        let grad_b = graph.output("linear/grad_bias", move |scope| {
            let d = scope.eval(delta)?;
            let db = d.view2()?.sum_axis(Axis(0));
            Ok(Tensor::from_array1(db))
        })?;

        Ok((grad_w, grad_b))
    }
}

fn ensure_same_dim(got: (usize, usize), expected: (usize, usize)) -> engine::Result<()> {
    if got != expected {
        return Err(EngineErr::ShapeMismatch {
            what: "linear regression targets",
            got: vec![got.0, got.1],
            expected: vec![expected.0, expected.1],
        });
    }

    Ok(())
}

impl Model for LinearRegression {
    fn build_train_ops(&self, graph: &mut Graph) -> Result<ModelInstance> {
        self.validate()?;

        let iterator = graph.iterator("train_input", 2)?;
        let next = graph.next_element(iterator)?;
        let (x, y) = (next[0], next[1]);

        let y_pred = self.forward(graph, x)?;
        let loss = self.loss(graph, y_pred, y)?;
        let (grad_w, grad_b) = self.gradients(graph, x, y_pred, y)?;
        let (weights, bias) = self.params(graph)?;
        let lr = self.learning_rate;

        let train_op = graph.op("linear/apply_gradients", move |scope| {
            let dw = scope.eval(grad_w)?;
            let db = scope.eval(grad_b)?;

            let w = scope.read(weights)?;
            let w = &w.view2()? - &(&dw.view2()? * lr);
            scope.assign(weights, Tensor::from_array2(w))?;

            let b = scope.read(bias)?;
            let b = &b.view1() - &(&db.view1() * lr);
            scope.assign(bias, Tensor::from_array1(b))
        })?;

        Ok(ModelInstance {
            mode: Mode::Train,
            iterator,
            input: x,
            output: y_pred,
            target: Some(y),
            loss: Some(loss),
            gradients: vec![grad_w, grad_b],
            train_op: Some(train_op),
            eval: EvalOps::default(),
        })
    }

    fn build_infer_ops(&self, graph: &mut Graph) -> Result<ModelInstance> {
        self.validate()?;

        let iterator = graph.iterator("infer_input", 1)?;
        let x = graph.next_element(iterator)?[0];
        let y_pred = self.forward(graph, x)?;

        Ok(ModelInstance {
            mode: Mode::Infer,
            iterator,
            input: x,
            output: y_pred,
            target: None,
            loss: None,
            gradients: Vec::new(),
            train_op: None,
            eval: EvalOps::default(),
        })
    }

    fn build_eval_ops(
        &self,
        graph: &mut Graph,
        metrics: &[Box<dyn Metric>],
    ) -> Result<ModelInstance> {
        self.validate()?;

        let iterator = graph.iterator("eval_input", 2)?;
        let next = graph.next_element(iterator)?;
        let (x, y) = (next[0], next[1]);

        let y_pred = self.forward(graph, x)?;
        let loss = self.loss(graph, y_pred, y)?;

        let metrics = metrics
            .iter()
            .map(|metric| {
                let ops = metric.build(graph, y, y_pred)?;
                Ok((metric.name().to_string(), ops))
            })
            .collect::<Result<_>>()?;

        Ok(ModelInstance {
            mode: Mode::Evaluate,
            iterator,
            input: x,
            output: y_pred,
            target: Some(y),
            loss: Some(loss),
            gradients: Vec::new(),
            train_op: None,
            eval: EvalOps { metrics },
        })
    }
}

#[cfg(test)]
mod tests {
    use engine::{Dataset, Session};

    use super::*;
    use crate::metrics::MeanSquaredError;

    fn line() -> Dataset {
        let x = Tensor::vector(vec![0.0, 1.0, 2.0, 3.0]);
        let y = Tensor::vector(vec![1.0, 3.0, 5.0, 7.0]);
        Dataset::from_elements(vec![vec![x, y]]).repeat()
    }

    #[test]
    fn modes_share_variables() {
        let model = LinearRegression::new(1, 1, 0.1);
        let mut graph = Graph::new();

        model.build_train_ops(&mut graph).unwrap();
        model.build_infer_ops(&mut graph).unwrap();
        let metrics: Vec<Box<dyn Metric>> = vec![Box::new(MeanSquaredError::new())];
        let eval = model.build_eval_ops(&mut graph, &metrics).unwrap();

        let names: Vec<_> = graph.variables().map(|v| graph.variable_name(v)).collect();
        assert_eq!(
            names,
            [
                "linear/weights",
                "linear/bias",
                "metrics/mse/total",
                "metrics/mse/count"
            ]
        );
        assert!(eval.eval.get("mse").is_some());
    }

    #[test]
    fn gradient_descent_fits_a_line() {
        let model = LinearRegression::new(1, 1, 0.05);
        let mut graph = Graph::new();
        graph.set_random_seed(0);
        let train = model.build_train_ops(&mut graph).unwrap();
        let init = graph.initializer(train.iterator).unwrap();
        let train_op = train.train_op.unwrap();
        let loss = train.loss.unwrap();

        let mut session = Session::new(graph);
        session.feed(train.iterator, line()).unwrap();
        session.run(&[], &[init]).unwrap();
        let first = session.run(&[loss], &[train_op]).unwrap()[0].to_scalar().unwrap();
        let mut last = first;
        for _ in 0..500 {
            last = session.run(&[loss], &[train_op]).unwrap()[0].to_scalar().unwrap();
        }

        assert!(last < first);
        assert!(last < 1e-3, "loss did not converge: {last}");
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        let err = LinearRegression::new(0, 1, 0.1)
            .build_train_ops(&mut Graph::new())
            .unwrap_err();
        assert!(matches!(err, EstimatorErr::InvalidConfig(_)));
    }
}
