use std::ops::{Deref, DerefMut};

use engine::Graph;
use log::debug;

/// Keeps a graph unfrozen while alive.
///
/// A graph that was frozen when the guard was created is frozen again on drop,
/// even when the code holding the guard bails out early. A graph that was
/// already unfrozen is left untouched.
pub struct Unfrozen<'g> {
    graph: &'g mut Graph,
    refreeze: bool,
}

impl<'g> Unfrozen<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        let refreeze = graph.is_frozen();

        if refreeze {
            debug!("unfreezing graph");
            graph.unfreeze();
        }

        Self { graph, refreeze }
    }
}

impl Deref for Unfrozen<'_> {
    type Target = Graph;

    fn deref(&self) -> &Self::Target {
        self.graph
    }
}

impl DerefMut for Unfrozen<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.graph
    }
}

impl Drop for Unfrozen<'_> {
    fn drop(&mut self) {
        if self.refreeze {
            debug!("refreezing graph");
            self.graph.freeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use engine::{EngineErr, Tensor};

    use super::*;

    fn install(graph: &mut Graph, fail: bool) -> engine::Result<()> {
        let mut graph = Unfrozen::new(graph);
        graph.no_op("init")?;

        if fail {
            return Err(EngineErr::Internal("boom".into()));
        }

        graph.constant("c", Tensor::scalar(1.0))?;
        Ok(())
    }

    #[test]
    fn refreezes_on_every_exit() {
        let mut graph = Graph::new();
        graph.freeze();

        install(&mut graph, false).unwrap();
        assert!(graph.is_frozen());

        install(&mut graph, true).unwrap_err();
        assert!(graph.is_frozen());
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn unfrozen_graphs_stay_unfrozen() {
        let mut graph = Graph::new();
        install(&mut graph, false).unwrap();
        assert!(!graph.is_frozen());
    }
}
