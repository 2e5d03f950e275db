mod checkpoint;
mod logging;
mod nan;
mod registry;
mod stop;

pub use checkpoint::CheckpointSaverHook;
pub use logging::LoggingHook;
pub use nan::NanTensorHook;
pub use registry::HookRegistry;
pub use stop::{StopCriteria, StopHook};

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use engine::{Op, Output, Session, Tensor};
use parking_lot::{Mutex, MutexGuard};

use crate::{Result, model::ModelInstance};

/// Extra work a hook asks to be merged into the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    pub fetches: Vec<Output>,
    pub targets: Vec<Op>,
}

impl RunArgs {
    pub fn fetch(output: Output) -> Self {
        Self {
            fetches: vec![output],
            targets: Vec::new(),
        }
    }
}

/// What a hook sees around a run.
pub struct RunContext<'a> {
    session: &'a Session,
    stop_requested: bool,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self {
            session,
            stop_requested: false,
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    /// Asks the loop driving the session to stop after the current step.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

/// A lifecycle callback attached to a monitored session.
///
/// Every method has a no-op default, hooks override only what they need.
pub trait Hook: Send {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called with the instance of every mode the hook is registered for, before
    /// the mode runs.
    fn bind(&mut self, _instance: &ModelInstance) -> Result<()> {
        Ok(())
    }

    /// Called whenever the session is (re)opened.
    fn after_session_created(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Called before every run, the returned fetches and targets are merged into it.
    fn before_run(&mut self, _ctx: &RunContext<'_>) -> Result<RunArgs> {
        Ok(RunArgs::default())
    }

    /// Called after every run with the values of the fetches requested in `before_run`.
    fn after_run(&mut self, _ctx: &mut RunContext<'_>, _values: &[Tensor]) -> Result<()> {
        Ok(())
    }

    /// Called when the session is closed gracefully.
    fn end(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

/// A shared handle to a hook.
///
/// Two handles are equal if they point to the same hook.
#[derive(Clone)]
pub struct SharedHook {
    hook: Arc<Mutex<dyn Hook>>,
}

impl SharedHook {
    pub fn new<H: Hook + 'static>(hook: H) -> Self {
        Self {
            hook: Arc::new(Mutex::new(hook)),
        }
    }

    /// Wraps a hook the caller keeps a typed handle to.
    pub fn from_arc<H: Hook + 'static>(hook: Arc<Mutex<H>>) -> Self {
        let hook: Arc<Mutex<dyn Hook>> = hook;
        Self { hook }
    }

    /// The identity of the hook behind this handle.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.hook) as *const () as usize
    }

    pub fn lock(&self) -> MutexGuard<'_, dyn Hook> {
        self.hook.lock()
    }
}

impl PartialEq for SharedHook {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for SharedHook {}

impl Hash for SharedHook {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for SharedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedHook({:#x})", self.id())
    }
}

/// An insertion ordered set of hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSet {
    hooks: Vec<SharedHook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `hook`, returns `false` if it was already present.
    pub fn insert(&mut self, hook: SharedHook) -> bool {
        if self.contains(&hook) {
            return false;
        }

        self.hooks.push(hook);
        true
    }

    /// Removes `hook`, returns `false` if it wasn't present.
    pub fn remove(&mut self, hook: &SharedHook) -> bool {
        let len = self.hooks.len();
        self.hooks.retain(|h| h != hook);
        self.hooks.len() != len
    }

    pub fn contains(&self, hook: &SharedHook) -> bool {
        self.hooks.contains(hook)
    }

    /// Every hook in `self` or `other`.
    pub fn union(&self, other: &HookSet) -> HookSet {
        let mut union = self.clone();
        union.extend(other.iter().cloned());
        union
    }

    /// Every hook in `self` but not in `other`.
    pub fn difference(&self, other: &HookSet) -> HookSet {
        self.iter().filter(|h| !other.contains(h)).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedHook> {
        self.hooks.iter()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Extend<SharedHook> for HookSet {
    fn extend<T: IntoIterator<Item = SharedHook>>(&mut self, iter: T) {
        for hook in iter {
            self.insert(hook);
        }
    }
}

impl FromIterator<SharedHook> for HookSet {
    fn from_iter<T: IntoIterator<Item = SharedHook>>(iter: T) -> Self {
        let mut set = HookSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Hook for Noop {}

    #[test]
    fn identity_follows_the_hook() {
        let hook = Arc::new(Mutex::new(Noop));
        let a = SharedHook::from_arc(hook.clone());
        let b = SharedHook::from_arc(hook);
        let c = SharedHook::new(Noop);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn set_operations_are_idempotent() {
        let (a, b, c) = (
            SharedHook::new(Noop),
            SharedHook::new(Noop),
            SharedHook::new(Noop),
        );
        let mut set: HookSet = [a.clone(), b.clone()].into_iter().collect();

        assert!(!set.insert(a.clone()));
        assert_eq!(set.len(), 2);

        let other: HookSet = [b.clone(), c.clone()].into_iter().collect();
        let union = set.union(&other);
        assert_eq!(union.iter().cloned().collect::<Vec<_>>(), [a.clone(), b.clone(), c]);
        assert_eq!(set.difference(&other).iter().collect::<Vec<_>>(), [&a]);

        assert!(set.remove(&b));
        assert!(!set.remove(&b));
    }

    #[test]
    fn hooks_default_to_their_type_name() {
        let hook = SharedHook::new(Noop);
        assert!(hook.lock().name().ends_with("Noop"));
    }
}
