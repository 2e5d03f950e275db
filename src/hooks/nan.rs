use engine::{Counter, Output, Tensor};
use log::warn;

use super::{Hook, RunArgs, RunContext};
use crate::{EstimatorErr, Result, model::ModelInstance};

/// Watches the loss of the bound model for `NaN`s.
///
/// Either fails the run with `EstimatorErr::NanLoss` or only asks the loop to stop.
pub struct NanTensorHook {
    fail_on_nan: bool,
    loss: Option<Output>,
}

impl NanTensorHook {
    pub fn new(fail_on_nan: bool) -> Self {
        Self {
            fail_on_nan,
            loss: None,
        }
    }
}

impl Hook for NanTensorHook {
    fn name(&self) -> &str {
        "NanTensorHook"
    }

    fn bind(&mut self, instance: &ModelInstance) -> Result<()> {
        self.loss = instance.loss;
        Ok(())
    }

    fn before_run(&mut self, _ctx: &RunContext<'_>) -> Result<RunArgs> {
        Ok(self.loss.map(RunArgs::fetch).unwrap_or_default())
    }

    fn after_run(&mut self, ctx: &mut RunContext<'_>, values: &[Tensor]) -> Result<()> {
        if !values.first().is_some_and(Tensor::has_nan) {
            return Ok(());
        }

        let step = ctx.session().counter(Counter::GlobalStep);
        if self.fail_on_nan {
            return Err(EstimatorErr::NanLoss { step });
        }

        warn!(step = step; "model diverged with loss = NaN, stopping");
        ctx.request_stop();
        Ok(())
    }
}
