use engine::{Dataset, Graph, IteratorHandle, Op, Output, Session, Tensor};
use log::{debug, warn};

use crate::{
    EstimatorErr, Result,
    hooks::{HookSet, RunArgs, RunContext, SharedHook},
};

/// The lifecycle state of a monitored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Closed gracefully, the next mode call reopens it.
    Closed,
    /// Closed abruptly after a fatal failure, it can't be used anymore.
    Dead,
}

/// The outcome of a single step.
#[derive(Debug)]
pub enum Step<T> {
    Continue(T),
    /// The input data is exhausted.
    Exhausted,
    Fatal(EstimatorErr),
}

/// A session wrapped with a mutable set of hooks and a stop flag.
pub struct MonitoredSession {
    session: Session,
    hooks: HookSet,
    disabled: usize,
    should_stop: bool,
    state: SessionState,
}

impl MonitoredSession {
    /// Creates a new `MonitoredSession`, calling `after_session_created` on every hook.
    ///
    /// # Arguments
    /// * `session` - The session to monitor, already restored if needed.
    /// * `hooks` - The hooks active when the session starts.
    pub fn new(session: Session, hooks: HookSet) -> Result<Self> {
        let mut monitored = Self {
            session,
            hooks,
            disabled: 0,
            should_stop: false,
            state: SessionState::Active,
        };

        monitored.notify_created()?;
        Ok(monitored)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn graph(&self) -> &Graph {
        self.session.graph()
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        self.session.graph_mut()
    }

    /// Feeds `dataset` to `iterator`, it is read once the iterator's initializer runs.
    pub fn feed(&mut self, iterator: IteratorHandle, dataset: Dataset) -> Result<()> {
        self.session.feed(iterator, dataset)?;
        Ok(())
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    /// Adds every hook in `hooks` that isn't active yet.
    pub fn add_hooks(&mut self, hooks: &HookSet) {
        self.hooks.extend(hooks.iter().cloned());
        debug!(added = hooks.len(), active = self.hooks.len(); "added hooks");
    }

    /// Removes every hook in `hooks` that is active.
    pub fn remove_hooks(&mut self, hooks: &HookSet) {
        self.hooks = self.hooks.difference(hooks);
        debug!(removed = hooks.len(), active = self.hooks.len(); "removed hooks");
    }

    /// Stops calling hooks during runs until the matching `enable_hooks`.
    pub fn disable_hooks(&mut self) {
        self.disabled += 1;
    }

    pub fn enable_hooks(&mut self) {
        self.disabled = self.disabled.saturating_sub(1);
    }

    pub fn hooks_enabled(&self) -> bool {
        self.disabled == 0
    }

    pub fn reset_should_stop(&mut self) {
        self.should_stop = false;
    }

    pub fn set_should_stop(&mut self, should_stop: bool) {
        self.should_stop = should_stop;
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop
    }

    /// Makes sure the session can be run, reopening it if it was closed gracefully.
    ///
    /// # Returns
    /// `EstimatorErr::SessionDead` if the session was closed abruptly.
    pub fn ensure_active(&mut self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Dead => Err(EstimatorErr::SessionDead),
            SessionState::Closed => {
                debug!("reopening session");
                self.session.reopen();
                self.state = SessionState::Active;
                self.notify_created()
            }
        }
    }

    /// Runs one step, merging in the fetches and targets requested by the hooks.
    ///
    /// # Arguments
    /// * `fetches` - The outputs whose values are returned.
    /// * `targets` - The ops run for their side effects.
    ///
    /// # Returns
    /// The values of `fetches` or the first error raised by the engine or a hook.
    pub fn run(&mut self, fetches: &[Output], targets: &[Op]) -> Result<Vec<Tensor>> {
        if self.state == SessionState::Dead {
            return Err(EstimatorErr::SessionDead);
        }

        if !self.hooks_enabled() || self.hooks.is_empty() {
            return Ok(self.session.run(fetches, targets)?);
        }

        let hooks: Vec<SharedHook> = self.hooks.iter().cloned().collect();
        let mut all_fetches = fetches.to_vec();
        let mut all_targets = targets.to_vec();
        let mut ranges = Vec::with_capacity(hooks.len());

        let ctx = RunContext::new(&self.session);
        for hook in &hooks {
            let RunArgs {
                fetches: extra,
                targets: extra_targets,
            } = hook.lock().before_run(&ctx)?;

            let start = all_fetches.len();
            all_fetches.extend(extra);
            ranges.push(start..all_fetches.len());
            all_targets.extend(extra_targets);
        }

        let mut values = self.session.run(&all_fetches, &all_targets)?;

        let mut ctx = RunContext::new(&self.session);
        for (hook, range) in hooks.iter().zip(ranges) {
            hook.lock().after_run(&mut ctx, &values[range])?;
        }

        if ctx.stop_requested() {
            self.should_stop = true;
        }

        values.truncate(fetches.len());
        Ok(values)
    }

    /// Runs one step without calling any hook, even if one of them fails.
    pub fn run_without_hooks(&mut self, fetches: &[Output], targets: &[Op]) -> Result<Vec<Tensor>> {
        self.disable_hooks();
        let values = self.run(fetches, targets);
        self.enable_hooks();
        values
    }

    /// Runs one step, telling exhaustion apart from failures.
    pub fn step(&mut self, fetches: &[Output], targets: &[Op]) -> Step<Vec<Tensor>> {
        match self.run(fetches, targets) {
            Ok(values) => Step::Continue(values),
            Err(e) if e.is_exhaustion() => Step::Exhausted,
            Err(e) => Step::Fatal(e),
        }
    }

    /// Closes the session gracefully, calling `end` on every active hook.
    ///
    /// # Returns
    /// The first error raised by a hook, every hook is still ended.
    pub fn close(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            return Ok(());
        }

        let mut result = Ok(());
        for hook in self.hooks.iter() {
            let mut hook = hook.lock();
            if let Err(e) = hook.end(&self.session) {
                warn!(hook = hook.name(); "hook failed while closing the session: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        self.session.close();
        self.state = SessionState::Closed;
        debug!("closed session");
        result
    }

    /// Closes the session without calling any hook, the session is dead afterwards.
    pub fn close_without_hook_end(&mut self) {
        self.session.close();
        self.state = SessionState::Dead;
        warn!("session closed abruptly");
    }

    fn notify_created(&mut self) -> Result<()> {
        for hook in self.hooks.iter() {
            hook.lock().after_session_created(&self.session)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use engine::{Counter, EngineErr};
    use parking_lot::Mutex;

    use super::*;
    use crate::hooks::Hook;

    #[derive(Default)]
    struct Recorder {
        created: usize,
        before: usize,
        after: Vec<Vec<Tensor>>,
        ended: usize,
        fetch: Option<Output>,
        stop: bool,
    }

    impl Hook for Recorder {
        fn after_session_created(&mut self, _session: &Session) -> Result<()> {
            self.created += 1;
            Ok(())
        }

        fn before_run(&mut self, _ctx: &RunContext<'_>) -> Result<RunArgs> {
            self.before += 1;
            Ok(self.fetch.map(RunArgs::fetch).unwrap_or_default())
        }

        fn after_run(&mut self, ctx: &mut RunContext<'_>, values: &[Tensor]) -> Result<()> {
            self.after.push(values.to_vec());
            if self.stop {
                ctx.request_stop();
            }
            Ok(())
        }

        fn end(&mut self, _session: &Session) -> Result<()> {
            self.ended += 1;
            Ok(())
        }
    }

    fn monitored(recorder: &Arc<Mutex<Recorder>>) -> (MonitoredSession, Output, Op) {
        let mut graph = Graph::new();
        let step = graph.counter(Counter::GlobalStep).unwrap();
        let increment = graph.increment(Counter::GlobalStep).unwrap();
        let hooks = [SharedHook::from_arc(recorder.clone())].into_iter().collect();
        let session = MonitoredSession::new(Session::new(graph), hooks).unwrap();
        (session, step, increment)
    }

    #[test]
    fn hook_fetches_are_routed_back() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let (mut session, step, increment) = monitored(&recorder);
        recorder.lock().fetch = Some(step);

        let values = session.run(&[], &[increment]).unwrap();
        assert!(values.is_empty());

        let recorder = recorder.lock();
        assert_eq!(recorder.created, 1);
        assert_eq!(recorder.after, [vec![Tensor::scalar(1.0)]]);
    }

    #[test]
    fn disabled_hooks_are_not_called() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let (mut session, step, increment) = monitored(&recorder);

        session.disable_hooks();
        session.disable_hooks();
        session.run(&[step], &[increment]).unwrap();
        session.enable_hooks();
        session.run(&[step], &[increment]).unwrap();
        assert_eq!(recorder.lock().before, 0);

        session.enable_hooks();
        session.run_without_hooks(&[step], &[increment]).unwrap();
        assert_eq!(recorder.lock().before, 0);
        assert!(session.hooks_enabled());

        session.run(&[step], &[increment]).unwrap();
        assert_eq!(recorder.lock().before, 1);
    }

    #[test]
    fn removed_hooks_are_not_called() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let (mut session, _, increment) = monitored(&recorder);
        let set = session.hooks().clone();

        session.remove_hooks(&set);
        session.remove_hooks(&set);
        session.run(&[], &[increment]).unwrap();
        assert_eq!(recorder.lock().before, 0);

        session.add_hooks(&set);
        session.add_hooks(&set);
        assert_eq!(session.hooks().len(), 1);
        session.run(&[], &[increment]).unwrap();
        assert_eq!(recorder.lock().before, 1);
    }

    #[test]
    fn hooks_can_request_a_stop() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let (mut session, _, increment) = monitored(&recorder);
        recorder.lock().stop = true;

        assert!(!session.should_stop());
        session.run(&[], &[increment]).unwrap();
        assert!(session.should_stop());

        session.reset_should_stop();
        assert!(!session.should_stop());
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        let mut graph = Graph::new();
        let it = graph.iterator("input", 1).unwrap();
        let next = graph.next_element(it).unwrap();
        let init = graph.initializer(it).unwrap();
        let fail = graph
            .op("fail", |_| Err(EngineErr::Internal("broken kernel".into())))
            .unwrap();
        let mut session = MonitoredSession::new(Session::new(graph), HookSet::new()).unwrap();

        session
            .feed(it, Dataset::from_tensors(vec![Tensor::scalar(1.0)]))
            .unwrap();
        session.run(&[], &[init]).unwrap();
        assert!(matches!(session.step(&next, &[]), Step::Continue(_)));
        assert!(matches!(session.step(&next, &[]), Step::Exhausted));
        assert!(matches!(session.step(&[], &[fail]), Step::Fatal(_)));
    }

    #[test]
    fn graceful_close_can_be_reopened() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let (mut session, step, increment) = monitored(&recorder);
        session.run(&[], &[increment]).unwrap();

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(recorder.lock().ended, 1);
        assert!(session.run(&[], &[increment]).is_err());

        session.ensure_active().unwrap();
        assert_eq!(recorder.lock().created, 2);
        assert_eq!(session.run(&[step], &[]).unwrap(), [Tensor::scalar(1.0)]);
    }

    #[test]
    fn abrupt_close_kills_the_session() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let (mut session, _, increment) = monitored(&recorder);

        session.close_without_hook_end();
        assert_eq!(session.state(), SessionState::Dead);
        assert_eq!(recorder.lock().ended, 0);
        assert!(matches!(
            session.run(&[], &[increment]),
            Err(EstimatorErr::SessionDead)
        ));
        assert!(matches!(
            session.ensure_active(),
            Err(EstimatorErr::SessionDead)
        ));
    }
}
