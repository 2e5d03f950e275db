mod evaluate;
mod infer;
mod train;

pub use evaluate::{EvaluateOptions, Evaluation};
pub use infer::Inference;

use std::sync::Arc;

use engine::{Collection, Counter, Dataset, Graph, IteratorHandle, Op, Output, Session};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    EstimatorErr, Result,
    checkpoint::{Checkpointer, JsonCheckpointer},
    config::Configuration,
    freeze::Unfrozen,
    hooks::{
        CheckpointSaverHook, HookRegistry, HookSet, LoggingHook, SharedHook, StopCriteria,
        StopHook,
    },
    metrics::Metric,
    model::{Mode, Model, ModelInstance},
    session::{MonitoredSession, SessionState, Step},
    summary::{JsonSummaryWriter, SummaryWriter},
};

/// Builds an `Estimator`.
pub struct EstimatorBuilder {
    model: Box<dyn Model>,
    config: Configuration,
    metrics: Vec<Box<dyn Metric>>,
    train_hooks: HookRegistry,
    infer_hooks: HookRegistry,
    eval_hooks: HookRegistry,
    stop_criteria: StopCriteria,
    summary_writer: Box<dyn SummaryWriter>,
}

impl EstimatorBuilder {
    /// Creates a new `EstimatorBuilder` for `model` with the default configuration.
    pub fn new<M: Model + 'static>(model: M) -> Self {
        Self {
            model: Box::new(model),
            config: Configuration::default(),
            metrics: Vec::new(),
            train_hooks: HookRegistry::new(),
            infer_hooks: HookRegistry::new(),
            eval_hooks: HookRegistry::new(),
            stop_criteria: StopCriteria::none(),
            summary_writer: Box::new(JsonSummaryWriter::new()),
        }
    }

    pub fn with_config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Adds a metric computed by every evaluation.
    pub fn with_metric<T: Metric + 'static>(mut self, metric: T) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn with_train_hook(mut self, hook: SharedHook) -> Self {
        self.train_hooks.add_always(hook);
        self
    }

    /// Adds a training hook that only runs on the chief.
    pub fn with_chief_train_hook(mut self, hook: SharedHook) -> Self {
        self.train_hooks.add_chief_only(hook);
        self
    }

    pub fn with_infer_hook(mut self, hook: SharedHook) -> Self {
        self.infer_hooks.add_always(hook);
        self
    }

    pub fn with_eval_hook(mut self, hook: SharedHook) -> Self {
        self.eval_hooks.add_always(hook);
        self
    }

    /// Sets the criteria training uses when a call doesn't override them.
    pub fn with_stop_criteria(mut self, criteria: StopCriteria) -> Self {
        self.stop_criteria = criteria;
        self
    }

    pub fn with_summary_writer<W: SummaryWriter + 'static>(mut self, writer: W) -> Self {
        self.summary_writer = Box::new(writer);
        self
    }

    /// Builds the graph of every mode, freezes it and opens the session.
    ///
    /// The latest checkpoint in the working directory, if any, is restored.
    ///
    /// # Returns
    /// The estimator or an error if the configuration is invalid or the model
    /// can't be built.
    pub fn build(self) -> Result<Estimator> {
        let Self {
            model,
            config,
            metrics,
            mut train_hooks,
            mut infer_hooks,
            mut eval_hooks,
            stop_criteria,
            summary_writer,
        } = self;

        config.validate()?;
        let metric_names = validate_metrics(&metrics)?;

        let mut graph = Graph::new();
        if let Some(seed) = config.random_seed() {
            graph.set_random_seed(seed);
        }
        graph.set_device_fn(config.device_fn().cloned());

        for counter in [Counter::GlobalStep, Counter::GlobalEpoch, Counter::EvalStep] {
            graph.counter(counter)?;
        }

        let train = model.build_train_ops(&mut graph)?;
        let infer = model.build_infer_ops(&mut graph)?;
        let eval = model.build_eval_ops(&mut graph, &metrics)?;

        let Some(train_op) = train.train_op else {
            return Err(EstimatorErr::InvalidConfig(
                "the model didn't build a train op".into(),
            ));
        };

        for instance in [&train, &infer, &eval] {
            graph.initializer(instance.iterator)?;
        }

        let ops = graph.with_name_scope("estimator", |graph| {
            let increment = graph.increment(Counter::GlobalStep)?;
            engine::Result::Ok(ControlOps {
                train_step: graph.group("train_step", &[train_op, increment])?,
                epoch_increment: graph.increment(Counter::GlobalEpoch)?,
                eval_increment: graph.increment(Counter::EvalStep)?,
                eval_reset: graph.reset_counter(Counter::EvalStep)?,
            })
        })?;

        if let Some(every) = config.log_loss_steps() {
            train_hooks.add_always(SharedHook::new(LoggingHook::new(every)));
        }

        if let (Some(dir), Some(every)) = (config.working_dir(), config.save_checkpoint_steps()) {
            let saver = CheckpointSaverHook::new(JsonCheckpointer::new(dir), every);
            train_hooks.add_chief_only(SharedHook::new(saver));
        }

        let stop = Arc::new(Mutex::new(StopHook::new()));
        let stop_hook = SharedHook::from_arc(stop.clone());
        for registry in [&mut train_hooks, &mut infer_hooks, &mut eval_hooks] {
            registry.add_stopping(stop_hook.clone());
        }

        let is_chief = config.is_chief();
        let modes = [
            (&train_hooks, &train),
            (&infer_hooks, &infer),
            (&eval_hooks, &eval),
        ];
        for (registry, instance) in modes {
            bind(&registry.resolve(is_chief), instance)?;
        }

        graph.freeze();
        let mut session = Session::new(graph);

        if let Some(dir) = config.working_dir() {
            if let Some(snapshot) = JsonCheckpointer::new(dir).restore_latest()? {
                session.restore(&snapshot)?;
            }
        }

        let hooks = train_hooks
            .resolve(is_chief)
            .union(&infer_hooks.resolve(is_chief))
            .union(&eval_hooks.resolve(is_chief));
        let session = MonitoredSession::new(session, hooks)?;

        info!(
            global_step = session.session().counter(Counter::GlobalStep),
            nodes = session.graph().node_count();
            "estimator ready"
        );

        Ok(Estimator {
            config,
            session,
            stop,
            default_criteria: stop_criteria,
            train: ModeState {
                instance: train,
                hooks: train_hooks,
            },
            infer: ModeState {
                instance: infer,
                hooks: infer_hooks,
            },
            eval: ModeState {
                instance: eval,
                hooks: eval_hooks,
            },
            ops,
            metric_names,
            summary_writer,
        })
    }
}

fn validate_metrics(metrics: &[Box<dyn Metric>]) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::with_capacity(metrics.len());

    for metric in metrics {
        let name = metric.name();
        if name.is_empty() || names.iter().any(|n| n == name) {
            return Err(EstimatorErr::InvalidConfig(format!(
                "metric names must be unique and non-empty, got {name:?}"
            )));
        }
        names.push(name.to_string());
    }

    Ok(names)
}

fn bind(hooks: &HookSet, instance: &ModelInstance) -> Result<()> {
    for hook in hooks.iter() {
        hook.lock().bind(instance)?;
    }

    Ok(())
}

/// The ops the estimator adds around the model.
struct ControlOps {
    train_step: Op,
    epoch_increment: Op,
    eval_increment: Op,
    eval_reset: Op,
}

/// How a mode's loop ended.
struct LoopOutcome {
    steps: u64,
    exhausted: bool,
}

struct ModeState {
    instance: ModelInstance,
    hooks: HookRegistry,
}

/// Drives the training, inference and evaluation of a model over a single
/// long-lived session.
///
/// Every mode call borrows the estimator mutably, so only one mode drives the
/// session at a time.
pub struct Estimator {
    config: Configuration,
    session: MonitoredSession,
    stop: Arc<Mutex<StopHook>>,
    default_criteria: StopCriteria,
    train: ModeState,
    infer: ModeState,
    eval: ModeState,
    ops: ControlOps,
    metric_names: Vec<String>,
    summary_writer: Box<dyn SummaryWriter>,
}

impl Estimator {
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn global_step(&self) -> u64 {
        self.session.session().counter(Counter::GlobalStep)
    }

    /// The amount of times training exhausted its input.
    pub fn global_epoch(&self) -> u64 {
        self.session.session().counter(Counter::GlobalEpoch)
    }

    pub fn is_graph_frozen(&self) -> bool {
        self.session.graph().is_frozen()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// The names of the configured metrics.
    pub fn metric_names(&self) -> &[String] {
        &self.metric_names
    }

    /// Closes the session gracefully, the next mode call reopens it.
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    fn mode(&self, mode: Mode) -> &ModeState {
        match mode {
            Mode::Train => &self.train,
            Mode::Infer => &self.infer,
            Mode::Evaluate => &self.eval,
        }
    }

    /// The hooks of the other modes that must not run while `mode` drives the session.
    fn others_exclusive(&self, mode: Mode) -> HookSet {
        let is_chief = self.config.is_chief();
        let own = self.mode(mode).hooks.resolve(is_chief);

        [Mode::Train, Mode::Infer, Mode::Evaluate]
            .into_iter()
            .filter(|&other| other != mode)
            .map(|other| self.mode(other).hooks.exclusive(is_chief))
            .fold(HookSet::new(), |acc, set| acc.union(&set))
            .difference(&own)
    }

    /// Takes exclusive use of the session for `mode`.
    ///
    /// # Returns
    /// The hooks removed, to be added back once the mode is done.
    fn enter(&mut self, mode: Mode) -> Result<HookSet> {
        self.session.ensure_active()?;

        let others = self.others_exclusive(mode);
        self.session.remove_hooks(&others);
        debug!(mode:? = mode, removed = others.len(); "entered mode");
        Ok(others)
    }

    /// Rebinds the hooks of `mode`, a hook may be registered for several modes.
    fn rebind(&self, mode: Mode) -> Result<()> {
        let state = self.mode(mode);
        bind(&state.hooks.resolve(self.config.is_chief()), &state.instance)
    }

    /// Feeds `dataset` to `iterator`, installs its initializer as the only local
    /// init op and runs it.
    ///
    /// The initializer node is shared by every call, the previously fed dataset
    /// is dropped.
    ///
    /// # Arguments
    /// * `iterator` - The iterator of the mode.
    /// * `dataset` - The data of this call.
    /// * `extra` - Ops run along with the initializer, after it.
    fn initialize(
        &mut self,
        iterator: IteratorHandle,
        dataset: Dataset,
        extra: &[Op],
    ) -> Result<()> {
        let init_ops = {
            let mut graph = Unfrozen::new(self.session.graph_mut());
            let init = graph.initializer(iterator)?;
            graph.replace_collection(Collection::LocalInitOps, vec![init])?;
            graph.collection(Collection::LocalInitOps).to_vec()
        };

        self.session.feed(iterator, dataset)?;

        let targets: Vec<Op> = init_ops.into_iter().chain(extra.iter().copied()).collect();
        self.session.run_without_hooks(&[], &targets)?;
        debug!(ops = targets.len(); "ran local init ops");
        Ok(())
    }

    /// Points the stop hook at `criteria` and clears the stop flag.
    fn reset_stop(
        &mut self,
        criteria: StopCriteria,
        counter: Option<Counter>,
        loss: Option<Output>,
    ) {
        let done = {
            let mut stop = self.stop.lock();
            stop.update_criteria(criteria);
            stop.observe(counter, loss);
            stop.reset(self.session.session())
        };

        self.session.reset_should_stop();
        self.session.set_should_stop(done);
    }

    fn restore_default_criteria(&mut self) {
        let mut stop = self.stop.lock();
        stop.update_criteria(self.default_criteria.clone());
        stop.observe(None, None);
    }

    /// Runs `targets` until the stop hook asks to stop or the data is exhausted.
    fn run_loop(&mut self, targets: &[Op]) -> Result<LoopOutcome> {
        let mut steps = 0;

        while !self.session.should_stop() {
            match self.session.step(&[], targets) {
                Step::Continue(_) => steps += 1,
                Step::Exhausted => {
                    debug!(steps = steps; "input exhausted");
                    self.session.set_should_stop(true);
                    return Ok(LoopOutcome {
                        steps,
                        exhausted: true,
                    });
                }
                Step::Fatal(e) => return Err(e),
            }
        }

        Ok(LoopOutcome {
            steps,
            exhausted: false,
        })
    }

    /// Tears the session down after a fatal failure.
    fn fail(&mut self, err: EstimatorErr) -> EstimatorErr {
        warn!("fatal error, closing the session: {err}");
        self.restore_default_criteria();
        self.session.close_without_hook_end();
        err
    }
}

impl Drop for Estimator {
    fn drop(&mut self) {
        if self.session.state() != SessionState::Active {
            return;
        }

        if let Err(e) = self.session.close() {
            warn!("failed to close the session: {e}");
        }
    }
}
