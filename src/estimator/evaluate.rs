use engine::{Collection, Counter, Dataset, Op, Output};
use log::{info, warn};

use super::Estimator;
use crate::{EstimatorErr, Result, hooks::StopCriteria, model::Mode};

/// Options of a single `Estimator::evaluate` call.
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    metrics: Option<Vec<String>>,
    max_steps: Option<u64>,
    save_summaries: bool,
    name: Option<String>,
}

impl EvaluateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only computes the metrics named in `metrics`, all of them by default.
    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = Some(metrics.into_iter().map(Into::into).collect());
        self
    }

    /// Stops after `steps` steps even if there is data left.
    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Hands the results to the summary writer, requires a working directory.
    pub fn with_summaries(mut self, save: bool) -> Self {
        self.save_summaries = save;
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The result of an evaluation.
///
/// An evaluation cut short by a recoverable engine signal is empty: it has no
/// step and no values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// The global step the model was evaluated at.
    pub step: Option<u64>,
    pub values: Vec<(String, f32)>,
}

impl Evaluation {
    pub fn get(&self, metric: &str) -> Option<f32> {
        self.values
            .iter()
            .find_map(|(name, value)| (name == metric).then_some(*value))
    }

    pub fn is_empty(&self) -> bool {
        self.step.is_none() && self.values.is_empty()
    }
}

/// The metric ops selected for one evaluation.
struct Selection {
    names: Vec<String>,
    values: Vec<Output>,
    updates: Vec<Op>,
}

impl Estimator {
    /// Evaluates the model on the dataset produced by `input_fn`.
    ///
    /// # Arguments
    /// * `input_fn` - Produces a fresh dataset of `(features, targets)` elements.
    /// * `options` - Selects the metrics and bounds the evaluation.
    ///
    /// # Returns
    /// The value of every selected metric at the current global step, an empty
    /// evaluation if the engine asked to stop midway, or an error. Invalid options
    /// fail before the session is touched.
    pub fn evaluate<F>(&mut self, input_fn: F, options: EvaluateOptions) -> Result<Evaluation>
    where
        F: FnOnce() -> Dataset,
    {
        if options.save_summaries && self.config.working_dir().is_none() {
            return Err(EstimatorErr::InvalidConfig(
                "saving summaries requires a working directory".into(),
            ));
        }

        let selection = self.select_metrics(options.metrics.as_deref())?;
        let removed = self.enter(Mode::Evaluate)?;
        info!(global_step = self.global_step(); "evaluation started");

        let values = match self.evaluate_loop(input_fn, options.max_steps, &selection) {
            Ok(values) => values,
            Err(e) if e.is_recoverable() => {
                warn!("evaluation interrupted, no results this round: {e}");
                self.restore_default_criteria();
                self.session.add_hooks(&removed);
                if let Err(e) = self.session.close() {
                    warn!("failed to close the session: {e}");
                }
                return Ok(Evaluation::default());
            }
            Err(e) => return Err(self.fail(e)),
        };

        self.restore_default_criteria();
        self.session.add_hooks(&removed);

        let step = self.global_step();
        let evaluation = Evaluation {
            step: Some(step),
            values: selection.names.into_iter().zip(values).collect(),
        };

        info!(step = step, values:? = evaluation.values; "evaluation finished");

        if options.save_summaries {
            if let Some(dir) = self.config.working_dir() {
                let (metrics, values): (Vec<&str>, Vec<f32>) = evaluation
                    .values
                    .iter()
                    .map(|(name, value)| (name.as_str(), *value))
                    .unzip();

                self.summary_writer
                    .save(dir, step, &metrics, &values, options.name.as_deref())?;
            }
        }

        Ok(evaluation)
    }

    fn select_metrics(&self, requested: Option<&[String]>) -> Result<Selection> {
        let names: Vec<String> = match requested {
            Some(requested) => requested.to_vec(),
            None => self.metric_names.clone(),
        };

        if names.is_empty() {
            return Err(EstimatorErr::InvalidConfig(
                "evaluation requires at least one metric".into(),
            ));
        }

        let eval = &self.eval.instance.eval;
        let mut selection = Selection {
            names: Vec::with_capacity(names.len()),
            values: Vec::with_capacity(names.len()),
            updates: Vec::with_capacity(names.len()),
        };

        for name in names {
            let ops = eval
                .get(&name)
                .ok_or_else(|| EstimatorErr::InvalidConfig(format!("unknown metric {name}")))?;

            if selection.names.contains(&name) {
                continue;
            }

            selection.values.push(ops.value);
            selection.updates.push(ops.update);
            selection.names.push(name);
        }

        Ok(selection)
    }

    fn evaluate_loop<F>(
        &mut self,
        input_fn: F,
        max_steps: Option<u64>,
        selection: &Selection,
    ) -> Result<Vec<f32>>
    where
        F: FnOnce() -> Dataset,
    {
        self.rebind(Mode::Evaluate)?;

        let mut resets = self.session.graph().collection(Collection::MetricResets).to_vec();
        resets.push(self.ops.eval_reset);
        let iterator = self.eval.instance.iterator;
        self.initialize(iterator, input_fn(), &resets)?;

        let criteria = max_steps.map_or_else(StopCriteria::none, StopCriteria::steps);
        self.reset_stop(criteria, Some(Counter::EvalStep), None);

        let mut targets = selection.updates.clone();
        targets.push(self.ops.eval_increment);
        self.run_loop(&targets)?;

        self.session
            .run_without_hooks(&selection.values, &[])?
            .iter()
            .map(|value| Ok(value.to_scalar()?))
            .collect()
    }
}
