use engine::{Counter, Dataset};
use log::info;

use super::Estimator;
use crate::{Result, hooks::StopCriteria, model::Mode};

impl Estimator {
    /// Trains the model on the dataset produced by `input_fn`.
    ///
    /// Training stops when the data is exhausted or the criteria hold, whichever
    /// comes first. Exhausting the data increments the global epoch.
    ///
    /// # Arguments
    /// * `input_fn` - Produces a fresh dataset of `(features, targets)` elements.
    /// * `criteria` - Overrides the default stop criteria for this call.
    ///
    /// # Returns
    /// The amount of steps run, or the failure that killed the session.
    pub fn train<F>(&mut self, input_fn: F, criteria: Option<StopCriteria>) -> Result<u64>
    where
        F: FnOnce() -> Dataset,
    {
        let removed = self.enter(Mode::Train)?;
        info!(global_step = self.global_step(); "training started");

        match self.train_loop(input_fn, criteria) {
            Ok(steps) => {
                self.restore_default_criteria();
                self.session.add_hooks(&removed);
                info!(steps = steps, global_step = self.global_step(); "training finished");
                Ok(steps)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn train_loop<F>(&mut self, input_fn: F, criteria: Option<StopCriteria>) -> Result<u64>
    where
        F: FnOnce() -> Dataset,
    {
        self.rebind(Mode::Train)?;
        let iterator = self.train.instance.iterator;
        self.initialize(iterator, input_fn(), &[])?;

        let criteria = criteria.unwrap_or_else(|| self.default_criteria.clone());
        let loss = self.train.instance.loss;
        self.reset_stop(criteria, Some(Counter::GlobalStep), loss);

        let train_step = self.ops.train_step;
        let outcome = self.run_loop(&[train_step])?;

        if outcome.exhausted {
            self.session
                .run_without_hooks(&[], &[self.ops.epoch_increment])?;
        }

        Ok(outcome.steps)
    }
}
