use super::{HookSet, SharedHook};

/// The hooks registered for one mode.
///
/// `always` hooks run on every worker, `chief_only` hooks only on the chief and
/// `stopping` hooks decide when the mode's loop ends. Stopping hooks are shared
/// between modes, so they are never part of the exclusive set.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    always: HookSet,
    chief_only: HookSet,
    stopping: HookSet,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_always(&mut self, hook: SharedHook) {
        self.always.insert(hook);
    }

    pub fn add_chief_only(&mut self, hook: SharedHook) {
        self.chief_only.insert(hook);
    }

    pub fn add_stopping(&mut self, hook: SharedHook) {
        self.stopping.insert(hook);
    }

    /// The hooks that have to be removed while another mode drives the session.
    ///
    /// # Arguments
    /// * `is_chief` - Whether the chief only hooks are in effect.
    pub fn exclusive(&self, is_chief: bool) -> HookSet {
        if is_chief {
            self.always.union(&self.chief_only)
        } else {
            self.always.clone()
        }
    }

    /// Every hook in effect for this mode.
    pub fn resolve(&self, is_chief: bool) -> HookSet {
        self.exclusive(is_chief).union(&self.stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hook;

    struct Noop;

    impl Hook for Noop {}

    #[test]
    fn chief_only_hooks_are_dropped_on_workers() {
        let (always, chief, stop) = (
            SharedHook::new(Noop),
            SharedHook::new(Noop),
            SharedHook::new(Noop),
        );
        let mut registry = HookRegistry::new();
        registry.add_always(always.clone());
        registry.add_chief_only(chief.clone());
        registry.add_stopping(stop.clone());

        let exclusive = registry.exclusive(true);
        assert!(exclusive.contains(&always) && exclusive.contains(&chief));
        assert!(!exclusive.contains(&stop));

        let worker = registry.resolve(false);
        assert!(worker.contains(&always) && worker.contains(&stop));
        assert!(!worker.contains(&chief));

        assert_eq!(registry.resolve(true).len(), 3);
    }
}
