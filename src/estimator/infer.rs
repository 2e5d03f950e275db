use std::iter::FusedIterator;

use engine::{Dataset, EngineErr, Tensor};
use log::{debug, info};

use super::Estimator;
use crate::{
    EstimatorErr, Result,
    hooks::{HookSet, StopCriteria},
    model::Mode,
    session::Step,
};

impl Estimator {
    /// Runs the model over the dataset produced by `input_fn`.
    ///
    /// # Arguments
    /// * `input_fn` - Produces a fresh dataset of single-feature elements.
    ///
    /// # Returns
    /// A lazy sequence of `(features, predictions)` pairs, one per element, or the
    /// failure that killed the session during setup.
    pub fn infer<F>(&mut self, input_fn: F) -> Result<Inference<'_>>
    where
        F: FnOnce() -> Dataset,
    {
        let removed = self.enter(Mode::Infer)?;

        if let Err(e) = self.infer_setup(input_fn) {
            return Err(self.fail(e));
        }

        self.session.add_hooks(&removed);
        info!(global_step = self.global_step(); "inference started");

        Ok(Inference {
            estimator: self,
            removed,
            done: false,
        })
    }

    fn infer_setup<F>(&mut self, input_fn: F) -> Result<()>
    where
        F: FnOnce() -> Dataset,
    {
        self.rebind(Mode::Infer)?;
        let iterator = self.infer.instance.iterator;
        self.initialize(iterator, input_fn(), &[])?;
        self.reset_stop(StopCriteria::none(), None, None);
        Ok(())
    }
}

/// The lazy, single pass sequence of predictions returned by `Estimator::infer`.
///
/// The other modes' hooks are removed around every pull. Dropping the sequence
/// early is fine, the next mode call starts over.
pub struct Inference<'a> {
    estimator: &'a mut Estimator,
    removed: HookSet,
    done: bool,
}

impl Inference<'_> {
    fn finish(&mut self) {
        self.done = true;
        self.estimator.session.set_should_stop(true);
        self.estimator.restore_default_criteria();
        debug!("inference finished");
    }

    /// Removes or re-adds the other modes' hooks while hooks are disabled.
    fn exclude_others(&mut self, exclude: bool) {
        let session = &mut self.estimator.session;
        session.disable_hooks();
        if exclude {
            session.remove_hooks(&self.removed);
        } else {
            session.add_hooks(&self.removed);
        }
        session.enable_hooks();
    }
}

impl Iterator for Inference<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.estimator.session.should_stop() {
            self.finish();
            return None;
        }

        let instance = &self.estimator.infer.instance;
        let fetches = [instance.input, instance.output];
        self.exclude_others(true);
        let step = self.estimator.session.step(&fetches, &[]);

        match step {
            Step::Continue(values) => {
                self.exclude_others(false);
                let mut values = values.into_iter();
                match (values.next(), values.next()) {
                    (Some(input), Some(output)) => Some(Ok((input, output))),
                    _ => {
                        self.done = true;
                        let err = EstimatorErr::Engine(EngineErr::Internal(
                            "inference run returned fewer values than fetched".into(),
                        ));
                        Some(Err(self.estimator.fail(err)))
                    }
                }
            }
            Step::Exhausted => {
                self.exclude_others(false);
                self.finish();
                None
            }
            Step::Fatal(e) => {
                self.done = true;
                Some(Err(self.estimator.fail(e)))
            }
        }
    }
}

impl FusedIterator for Inference<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EstimatorBuilder,
        hooks::{LoggingHook, SharedHook},
        metrics::MeanSquaredError,
        model::LinearRegression,
    };

    #[test]
    fn other_hooks_are_back_between_pulls() {
        let eval_hook = SharedHook::new(LoggingHook::new(1));
        let mut estimator = EstimatorBuilder::new(LinearRegression::new(1, 1, 0.1))
            .with_metric(MeanSquaredError::new())
            .with_eval_hook(eval_hook.clone())
            .build()
            .unwrap();

        let features = Dataset::from_tensors(vec![Tensor::vector(vec![1.0]); 2]);
        let mut predictions = estimator.infer(|| features).unwrap();

        while let Some(prediction) = predictions.next() {
            assert!(prediction.is_ok());
            let session = &predictions.estimator.session;
            assert!(session.hooks_enabled());
            assert!(session.hooks().contains(&eval_hook));
        }

        assert!(predictions.done);
        assert!(predictions.estimator.session.hooks_enabled());
    }
}
