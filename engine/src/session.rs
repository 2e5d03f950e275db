use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    Dataset, EngineErr, Graph, Result, Scope, Tensor,
    graph::{Counter, IteratorHandle, Op, Output},
    scope::State,
};

/// A serializable copy of every variable and counter of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub variables: Vec<(String, Tensor)>,
    pub counters: Vec<(Counter, u64)>,
}

/// Executes a graph while keeping its state alive between runs.
pub struct Session {
    graph: Graph,
    state: State,
    closed: bool,
}

impl Session {
    /// Creates a new `Session` owning `graph`.
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            state: State::default(),
            closed: false,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Runs one step.
    ///
    /// `targets` are run first, in order, then `fetches` are evaluated, so fetched
    /// values observe the effects of the targets.
    ///
    /// # Arguments
    /// * `fetches` - The outputs whose values are returned.
    /// * `targets` - The ops run for their side effects.
    ///
    /// # Returns
    /// One tensor per fetch, or the first error raised by a kernel.
    pub fn run(&mut self, fetches: &[Output], targets: &[Op]) -> Result<Vec<Tensor>> {
        if self.closed {
            return Err(EngineErr::SessionClosed);
        }

        let mut scope = Scope::new(&self.graph, &mut self.state);

        for &target in targets {
            scope.run(target)?;
        }

        fetches.iter().map(|&fetch| scope.eval(fetch)).collect()
    }

    /// Feeds `dataset` to `iterator`, replacing the previously fed one.
    ///
    /// The data is only read once the iterator's initializer runs.
    ///
    /// # Returns
    /// An error if the session is closed or the iterator belongs to another graph.
    pub fn feed(&mut self, iterator: IteratorHandle, dataset: Dataset) -> Result<()> {
        if self.closed {
            return Err(EngineErr::SessionClosed);
        }

        if iterator.id >= self.graph.iterators.len() {
            return Err(EngineErr::InvalidArgument(format!(
                "unknown iterator {}",
                iterator.id
            )));
        }

        let datasets = &mut self.state.datasets;
        if datasets.len() <= iterator.id {
            datasets.resize_with(iterator.id + 1, || None);
        }

        datasets[iterator.id] = Some(dataset);
        Ok(())
    }

    /// The current value of `counter`, zero if it was never touched.
    pub fn counter(&self, counter: Counter) -> u64 {
        self.state.counters.get(&counter).copied().unwrap_or(0)
    }

    /// Copies the current value of every variable and registered counter.
    pub fn snapshot(&self) -> Snapshot {
        let variables = self
            .graph
            .variables()
            .map(|var| {
                let name = self.graph.variable_name(var).to_string();
                (name, self.state.variable(&self.graph, var))
            })
            .collect();

        let mut counters: Vec<_> = self
            .graph
            .counters()
            .map(|counter| (counter, self.counter(counter)))
            .collect();
        counters.sort();

        Snapshot {
            variables,
            counters,
        }
    }

    /// Overwrites variables and counters with the values in `snapshot`.
    ///
    /// Variables missing from this graph are skipped.
    ///
    /// # Returns
    /// An error if a variable in the snapshot has a different shape than in this graph.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        for (name, value) in &snapshot.variables {
            let Some(var) = self.graph.find_variable(name) else {
                warn!(variable = name.as_str(); "skipping unknown variable while restoring");
                continue;
            };

            let expected = self.graph.initial_value(var).shape();
            if value.shape() != expected {
                return Err(EngineErr::ShapeMismatch {
                    what: "restored variable",
                    got: value.shape().to_vec(),
                    expected: expected.to_vec(),
                });
            }

            self.state.set_variable(var, value.clone());
        }

        for &(counter, value) in &snapshot.counters {
            self.state.counters.insert(counter, value);
        }

        debug!(
            variables = snapshot.variables.len(),
            counters = snapshot.counters.len();
            "restored session state"
        );
        Ok(())
    }

    /// Closes the session, dropping every live iterator and fed dataset.
    /// Variables are kept.
    pub fn close(&mut self) {
        self.state.iterators.clear();
        self.state.datasets.clear();
        self.closed = true;
    }

    /// Makes a closed session usable again.
    pub fn reopen(&mut self) {
        self.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn fetches_observe_targets() {
        let mut graph = Graph::new();
        let step = graph.counter(Counter::GlobalStep).unwrap();
        let increment = graph.increment(Counter::GlobalStep).unwrap();
        let mut session = Session::new(graph);

        let values = session.run(&[step], &[increment]).unwrap();
        assert_eq!(values, [Tensor::scalar(1.0)]);
        assert_eq!(session.counter(Counter::GlobalStep), 1);
    }

    #[test]
    fn components_share_the_same_element() {
        let mut graph = Graph::new();
        let it = graph.iterator("it", 2).unwrap();
        let next = graph.next_element(it).unwrap();
        let dataset = Dataset::from_elements(vec![
            vec![Tensor::scalar(1.0), Tensor::scalar(10.0)],
            vec![Tensor::scalar(2.0), Tensor::scalar(20.0)],
        ]);
        let init = graph.initializer(it).unwrap();
        let mut session = Session::new(graph);

        session.feed(it, dataset).unwrap();
        session.run(&[], &[init]).unwrap();
        let first = session.run(&next, &[]).unwrap();
        let second = session.run(&next, &[]).unwrap();
        assert_eq!(first, [Tensor::scalar(1.0), Tensor::scalar(10.0)]);
        assert_eq!(second, [Tensor::scalar(2.0), Tensor::scalar(20.0)]);

        let err = session.run(&next, &[]).unwrap_err();
        assert!(err.is_out_of_range());

        session.run(&[], &[init]).unwrap();
        assert_eq!(session.run(&next, &[]).unwrap(), first);
    }

    #[test]
    fn uninitialized_iterators_fail() {
        let mut graph = Graph::new();
        let it = graph.iterator("it", 1).unwrap();
        let next = graph.next_element(it).unwrap();
        let mut session = Session::new(graph);

        let err = session.run(&next, &[]).unwrap_err();
        assert!(matches!(err, EngineErr::FailedPrecondition(_)));
    }

    #[test]
    fn feeding_replaces_the_previous_dataset() {
        let mut graph = Graph::new();
        let it = graph.iterator("it", 1).unwrap();
        let next = graph.next_element(it).unwrap();
        let init = graph.initializer(it).unwrap();
        let mut session = Session::new(graph);

        let marker = Arc::new(());
        let held = marker.clone();
        let first = Dataset::new(move || {
            let _ = Arc::clone(&held);
            std::iter::once(vec![Tensor::scalar(1.0)])
        });
        session.feed(it, first).unwrap();
        session.run(&[], &[init]).unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);

        session
            .feed(it, Dataset::from_tensors(vec![Tensor::scalar(2.0)]))
            .unwrap();
        session.run(&[], &[init]).unwrap();
        assert_eq!(Arc::strong_count(&marker), 1);
        assert_eq!(session.run(&next, &[]).unwrap(), [Tensor::scalar(2.0)]);
    }

    #[test]
    fn initializers_need_a_fed_dataset() {
        let mut graph = Graph::new();
        let it = graph.iterator("it", 1).unwrap();
        let init = graph.initializer(it).unwrap();
        let mut session = Session::new(graph);

        let err = session.run(&[], &[init]).unwrap_err();
        assert!(matches!(err, EngineErr::FailedPrecondition(_)));

        session.close();
        assert_eq!(
            session
                .feed(it, Dataset::from_elements(Vec::new()))
                .unwrap_err(),
            EngineErr::SessionClosed
        );
    }

    #[test]
    fn variables_persist_across_runs() {
        let mut graph = Graph::new();
        let var = graph.variable("v", Tensor::scalar(1.0)).unwrap();
        let read = graph.read(var).unwrap();
        let double = graph
            .op("double", move |scope| {
                let value = scope.read(var)?.to_scalar()?;
                scope.assign(var, Tensor::scalar(value * 2.0))
            })
            .unwrap();
        let mut session = Session::new(graph);

        session.run(&[], &[double]).unwrap();
        session.run(&[], &[double]).unwrap();
        assert_eq!(session.run(&[read], &[]).unwrap(), [Tensor::scalar(4.0)]);
    }

    #[test]
    fn closed_sessions_refuse_to_run_until_reopened() {
        let mut graph = Graph::new();
        let noop = graph.no_op("noop").unwrap();
        let mut session = Session::new(graph);

        session.close();
        assert_eq!(
            session.run(&[], &[noop]).unwrap_err(),
            EngineErr::SessionClosed
        );

        session.reopen();
        assert!(session.run(&[], &[noop]).is_ok());
    }

    #[test]
    fn snapshots_round_trip_into_a_new_session() {
        let mut graph = Graph::new();
        let var = graph.variable("v", Tensor::vector(vec![0.0, 0.0])).unwrap();
        let step = graph.increment(Counter::GlobalStep).unwrap();
        let set = graph
            .op("set", move |scope| {
                scope.assign(var, Tensor::vector(vec![1.0, 2.0]))
            })
            .unwrap();
        let mut session = Session::new(graph);
        session.run(&[], &[set, step]).unwrap();
        let snapshot = session.snapshot();

        let mut graph = Graph::new();
        let var = graph.variable("v", Tensor::vector(vec![0.0, 0.0])).unwrap();
        let read = graph.read(var).unwrap();
        graph.counter(Counter::GlobalStep).unwrap();
        let mut restored = Session::new(graph);
        restored.restore(&snapshot).unwrap();

        assert_eq!(
            restored.run(&[read], &[]).unwrap(),
            [Tensor::vector(vec![1.0, 2.0])]
        );
        assert_eq!(restored.counter(Counter::GlobalStep), 1);
    }
}
