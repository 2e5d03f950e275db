use engine::{Counter, Session, Tensor};

use super::{Hook, RunContext};
use crate::{Result, checkpoint::Checkpointer};

/// Saves a checkpoint every `every_n_steps` global steps and once more when the
/// session ends.
pub struct CheckpointSaverHook {
    checkpointer: Box<dyn Checkpointer>,
    every_n_steps: u64,
    last_saved: Option<u64>,
}

impl CheckpointSaverHook {
    pub fn new<C: Checkpointer + 'static>(checkpointer: C, every_n_steps: u64) -> Self {
        Self {
            checkpointer: Box::new(checkpointer),
            every_n_steps: every_n_steps.max(1),
            last_saved: None,
        }
    }

    fn save(&mut self, session: &Session, step: u64) -> Result<()> {
        self.checkpointer.save(step, &session.snapshot())?;
        self.last_saved = Some(step);
        Ok(())
    }
}

impl Hook for CheckpointSaverHook {
    fn name(&self) -> &str {
        "CheckpointSaverHook"
    }

    fn after_session_created(&mut self, session: &Session) -> Result<()> {
        self.last_saved = Some(session.counter(Counter::GlobalStep));
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut RunContext<'_>, _values: &[Tensor]) -> Result<()> {
        let step = ctx.session().counter(Counter::GlobalStep);
        let last = self.last_saved.unwrap_or(0);

        if step >= last + self.every_n_steps {
            self.save(ctx.session(), step)?;
        }

        Ok(())
    }

    fn end(&mut self, session: &Session) -> Result<()> {
        let step = session.counter(Counter::GlobalStep);

        if self.last_saved != Some(step) {
            self.save(session, step)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use engine::Graph;
    use tempfile::tempdir;

    use super::*;
    use crate::checkpoint::JsonCheckpointer;

    #[test]
    fn saves_every_n_steps_and_at_the_end() {
        let dir = tempdir().unwrap();
        let mut graph = Graph::new();
        let increment = graph.increment(Counter::GlobalStep).unwrap();
        let mut session = Session::new(graph);
        let mut hook = CheckpointSaverHook::new(JsonCheckpointer::new(dir.path()), 2);
        hook.after_session_created(&session).unwrap();

        for _ in 0..3 {
            session.run(&[], &[increment]).unwrap();
            hook.after_run(&mut RunContext::new(&session), &[]).unwrap();
        }
        hook.end(&session).unwrap();

        let steps: Vec<_> = JsonCheckpointer::new(dir.path())
            .checkpoints()
            .unwrap()
            .into_iter()
            .map(|(step, _)| step)
            .collect();
        assert_eq!(steps, [2, 3]);
    }
}
