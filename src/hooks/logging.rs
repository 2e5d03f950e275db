use engine::{Counter, Output, Tensor};
use log::info;

use super::{Hook, RunArgs, RunContext};
use crate::{Result, model::ModelInstance};

/// Logs the loss of the bound model every `every_n_steps` global steps.
pub struct LoggingHook {
    every_n_steps: u64,
    loss: Option<Output>,
    logged: u64,
}

impl LoggingHook {
    pub fn new(every_n_steps: u64) -> Self {
        Self {
            every_n_steps: every_n_steps.max(1),
            loss: None,
            logged: 0,
        }
    }

    /// The amount of times the loss has been logged.
    pub fn logged(&self) -> u64 {
        self.logged
    }
}

impl Hook for LoggingHook {
    fn name(&self) -> &str {
        "LoggingHook"
    }

    fn bind(&mut self, instance: &ModelInstance) -> Result<()> {
        self.loss = instance.loss;
        Ok(())
    }

    fn before_run(&mut self, _ctx: &RunContext<'_>) -> Result<RunArgs> {
        Ok(self.loss.map(RunArgs::fetch).unwrap_or_default())
    }

    fn after_run(&mut self, ctx: &mut RunContext<'_>, values: &[Tensor]) -> Result<()> {
        let Some(loss) = values.first() else {
            return Ok(());
        };

        let step = ctx.session().counter(Counter::GlobalStep);
        if step % self.every_n_steps == 0 {
            let loss = loss.to_scalar()?;
            info!(step = step, loss = loss; "training loss");
            self.logged += 1;
        }

        Ok(())
    }
}
