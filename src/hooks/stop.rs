use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use engine::{Counter, Output, Session, Tensor};
use log::debug;

use super::{Hook, RunArgs, RunContext};
use crate::Result;

/// Stops once the loss stops moving for `patience` consecutive steps.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LossTolerance {
    abs: f32,
    rel: f32,
    patience: u64,
}

/// Describes when an iterative loop should halt.
///
/// Criteria are combined with a logical or: the loop stops as soon as any of
/// them holds. Replace criteria instead of mutating them.
#[derive(Debug, Clone)]
pub struct StopCriteria {
    max_steps: Option<u64>,
    max_duration: Option<Duration>,
    loss_tolerance: Option<LossTolerance>,
    signal: Option<Arc<AtomicBool>>,
    restart_counting: bool,
}

impl StopCriteria {
    /// Never stops on its own, the loop runs until its data is exhausted.
    pub fn none() -> Self {
        Self {
            max_steps: None,
            max_duration: None,
            loss_tolerance: None,
            signal: None,
            restart_counting: true,
        }
    }

    /// Stops after exactly `n` steps.
    pub fn steps(n: u64) -> Self {
        Self::none().with_max_steps(n)
    }

    pub fn with_max_steps(mut self, n: u64) -> Self {
        self.max_steps = Some(n);
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Stops once the loss changes by at most `abs`, or by at most `rel` relative to
    /// its previous value, for `patience` consecutive steps.
    pub fn with_loss_tolerance(mut self, abs: f32, rel: f32, patience: u64) -> Self {
        self.loss_tolerance = Some(LossTolerance { abs, rel, patience });
        self
    }

    /// Stops as soon as `signal` is raised by someone else.
    pub fn with_signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Whether steps are counted from the value of the counter at reset (the
    /// default) or from zero.
    pub fn with_restart_counting(mut self, restart: bool) -> Self {
        self.restart_counting = restart;
        self
    }

    pub fn max_steps(&self) -> Option<u64> {
        self.max_steps
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_steps.is_none()
            && self.max_duration.is_none()
            && self.loss_tolerance.is_none()
            && self.signal.is_none()
    }

    fn signalled(&self) -> bool {
        self.signal
            .as_ref()
            .is_some_and(|signal| signal.load(Ordering::Acquire))
    }
}

impl Default for StopCriteria {
    fn default() -> Self {
        Self::none()
    }
}

/// The hook evaluating the current `StopCriteria` after every run.
pub struct StopHook {
    criteria: StopCriteria,
    counter: Option<Counter>,
    loss: Option<Output>,
    start_step: u64,
    started: Instant,
    last_loss: Option<f32>,
    steps_below: u64,
}

impl StopHook {
    /// Creates a new `StopHook` that never stops.
    pub fn new() -> Self {
        Self {
            criteria: StopCriteria::none(),
            counter: None,
            loss: None,
            start_step: 0,
            started: Instant::now(),
            last_loss: None,
            steps_below: 0,
        }
    }

    pub fn criteria(&self) -> &StopCriteria {
        &self.criteria
    }

    pub fn update_criteria(&mut self, criteria: StopCriteria) {
        debug!(criteria:? = criteria; "updated stop criteria");
        self.criteria = criteria;
    }

    /// Selects what is read after every run.
    ///
    /// # Arguments
    /// * `counter` - The counter the step bound applies to.
    /// * `loss` - The loss the convergence tolerance applies to.
    pub fn observe(&mut self, counter: Option<Counter>, loss: Option<Output>) {
        self.counter = counter;
        self.loss = loss;
    }

    /// Re-synchronizes the hook against `session`.
    ///
    /// # Returns
    /// `true` if the criteria already hold, before any step is run.
    pub fn reset(&mut self, session: &Session) -> bool {
        self.start_step = match self.counter {
            Some(counter) if self.criteria.restart_counting => session.counter(counter),
            _ => 0,
        };
        self.started = Instant::now();
        self.last_loss = None;
        self.steps_below = 0;

        self.criteria.max_steps == Some(0) || self.criteria.signalled()
    }

    fn is_satisfied(&mut self, step: Option<u64>, loss: Option<f32>) -> bool {
        if let (Some(max), Some(step)) = (self.criteria.max_steps, step) {
            if step.saturating_sub(self.start_step) >= max {
                debug!(step = step, max = max; "step limit reached");
                return true;
            }
        }

        if let Some(max) = self.criteria.max_duration {
            if self.started.elapsed() >= max {
                debug!(max:? = max; "time limit reached");
                return true;
            }
        }

        if let (Some(tolerance), Some(loss)) = (self.criteria.loss_tolerance, loss) {
            if self.converged(tolerance, loss) {
                debug!(loss = loss; "loss converged");
                return true;
            }
        }

        self.criteria.signalled()
    }

    fn converged(&mut self, tolerance: LossTolerance, loss: f32) -> bool {
        let Some(last) = self.last_loss.replace(loss) else {
            return false;
        };

        let change = (loss - last).abs();
        let below = change <= tolerance.abs || (last != 0.0 && change / last.abs() <= tolerance.rel);
        self.steps_below = if below { self.steps_below + 1 } else { 0 };
        self.steps_below >= tolerance.patience
    }
}

impl Default for StopHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for StopHook {
    fn name(&self) -> &str {
        "StopHook"
    }

    fn before_run(&mut self, _ctx: &RunContext<'_>) -> Result<RunArgs> {
        let args = match self.loss {
            Some(loss) if self.criteria.loss_tolerance.is_some() => RunArgs::fetch(loss),
            _ => RunArgs::default(),
        };

        Ok(args)
    }

    fn after_run(&mut self, ctx: &mut RunContext<'_>, values: &[Tensor]) -> Result<()> {
        let step = self.counter.map(|counter| ctx.session().counter(counter));
        let loss = values.first().map(Tensor::to_scalar).transpose()?;

        if self.is_satisfied(step, loss) {
            ctx.request_stop();
        }

        Ok(())
    }
}
