use std::collections::HashMap;

use crate::{
    Dataset, Element, EngineErr, Graph, Result, Tensor,
    graph::{Counter, IteratorHandle, Op, Output, Variable},
};

type ElementIter = Box<dyn Iterator<Item = Element> + Send>;

/// The mutable state of a session: variable values, iterator positions and counters.
#[derive(Default)]
pub(crate) struct State {
    pub(crate) variables: Vec<Option<Tensor>>,
    pub(crate) iterators: Vec<Option<ElementIter>>,
    pub(crate) datasets: Vec<Option<Dataset>>,
    pub(crate) counters: HashMap<Counter, u64>,
}

impl State {
    pub(crate) fn variable(&self, graph: &Graph, var: Variable) -> Tensor {
        match self.variables.get(var.0) {
            Some(Some(value)) => value.clone(),
            _ => graph.initial_value(var).clone(),
        }
    }

    pub(crate) fn set_variable(&mut self, var: Variable, value: Tensor) {
        if self.variables.len() <= var.0 {
            self.variables.resize(var.0 + 1, None);
        }

        self.variables[var.0] = Some(value);
    }
}

/// The evaluation context of a single run.
///
/// Every node is computed at most once per run: later reads of the same output
/// see the cached value, and every component of an iterator sees the same element.
pub struct Scope<'s> {
    graph: &'s Graph,
    state: &'s mut State,
    cache: HashMap<usize, Tensor>,
    pulled: HashMap<usize, Element>,
}

impl<'s> Scope<'s> {
    pub(crate) fn new(graph: &'s Graph, state: &'s mut State) -> Self {
        Self {
            graph,
            state,
            cache: HashMap::new(),
            pulled: HashMap::new(),
        }
    }

    /// Computes the value of `output`.
    pub fn eval(&mut self, output: Output) -> Result<Tensor> {
        self.eval_node(output.0)
    }

    /// Runs the op behind `op`.
    pub fn run(&mut self, op: Op) -> Result<()> {
        self.eval_node(op.0).map(|_| ())
    }

    /// Reads the current value of `var`.
    pub fn read(&self, var: Variable) -> Result<Tensor> {
        Ok(self.state.variable(self.graph, var))
    }

    /// Overwrites the value of `var`.
    ///
    /// # Returns
    /// An error if `value`'s shape doesn't match the variable's shape.
    pub fn assign(&mut self, var: Variable, value: Tensor) -> Result<()> {
        let expected = self.graph.initial_value(var).shape();

        if value.shape() != expected {
            return Err(EngineErr::ShapeMismatch {
                what: "variable assignment",
                got: value.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        self.state.set_variable(var, value);
        Ok(())
    }

    /// Pulls the next element of `iterator`, at most once per run.
    ///
    /// # Returns
    /// The element, `OutOfRange` once the iterator is exhausted or an error if it
    /// was never initialized.
    pub fn next_element(&mut self, iterator: IteratorHandle) -> Result<Element> {
        if let Some(element) = self.pulled.get(&iterator.id) {
            return Ok(element.clone());
        }

        let graph = self.graph;
        let name = &graph.iterators[iterator.id].name;
        let source = self
            .state
            .iterators
            .get_mut(iterator.id)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                EngineErr::FailedPrecondition(format!("iterator {name} has not been initialized"))
            })?;

        let element = source.next().ok_or_else(|| EngineErr::OutOfRange {
            iterator: name.clone(),
        })?;

        if element.len() != iterator.components() {
            return Err(EngineErr::InvalidArgument(format!(
                "iterator {name} expects {} components per element, got {}",
                iterator.components(),
                element.len()
            )));
        }

        self.pulled.insert(iterator.id, element.clone());
        Ok(element)
    }

    /// Starts a fresh pass over the dataset last fed to `iterator`.
    ///
    /// # Returns
    /// An error if no dataset was fed to the iterator.
    pub fn initialize(&mut self, iterator: IteratorHandle) -> Result<()> {
        let source = match self.state.datasets.get(iterator.id) {
            Some(Some(dataset)) => dataset.iter(),
            _ => {
                let name = &self.graph.iterators[iterator.id].name;
                return Err(EngineErr::FailedPrecondition(format!(
                    "no dataset was fed to iterator {name}"
                )));
            }
        };

        let iterators = &mut self.state.iterators;
        if iterators.len() <= iterator.id {
            iterators.resize_with(iterator.id + 1, || None);
        }

        iterators[iterator.id] = Some(source);
        self.pulled.remove(&iterator.id);
        Ok(())
    }

    /// The current value of `counter`, zero if it was never touched.
    pub fn counter(&self, counter: Counter) -> u64 {
        self.state.counters.get(&counter).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, counter: Counter, by: u64) {
        *self.state.counters.entry(counter).or_insert(0) += by;
    }

    pub fn set_counter(&mut self, counter: Counter, value: u64) {
        self.state.counters.insert(counter, value);
    }

    fn eval_node(&mut self, node: usize) -> Result<Tensor> {
        if let Some(value) = self.cache.get(&node) {
            return Ok(value.clone());
        }

        let graph = self.graph;
        let value = (graph.kernel(node)?)(self)?;
        self.cache.insert(node, value.clone());
        Ok(value)
    }
}
