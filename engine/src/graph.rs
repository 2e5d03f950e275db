use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use log::debug;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{EngineErr, Result, Scope, Tensor};

type Kernel = Box<dyn Fn(&mut Scope<'_>) -> Result<Tensor> + Send + Sync>;

/// Maps the full name of a node to the device it should be placed on.
pub type DeviceFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A handle to a node producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Output(pub(crate) usize);

/// A handle to a node that is only run for its side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op(pub(crate) usize);

/// A handle to a piece of mutable state living in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variable(pub(crate) usize);

/// A handle to a data iterator resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IteratorHandle {
    pub(crate) id: usize,
    components: usize,
}

impl IteratorHandle {
    /// The amount of tensors every element yielded by this iterator holds.
    pub fn components(&self) -> usize {
        self.components
    }
}

/// The well known counters a graph may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Counter {
    GlobalStep,
    GlobalEpoch,
    EvalStep,
}

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::GlobalStep => "global_step",
            Counter::GlobalEpoch => "global_epoch",
            Counter::EvalStep => "eval_step",
        }
    }
}

/// Well known groups of ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Ops run once whenever local state has to be (re)initialized.
    LocalInitOps,
    /// Ops resetting the accumulators of streaming metrics.
    MetricResets,
    /// Ops updating the accumulators of streaming metrics.
    MetricUpdates,
}

struct Node {
    name: String,
    device: Option<String>,
    kernel: Kernel,
}

struct VariableDef {
    name: String,
    initial: Tensor,
}

pub(crate) struct IteratorDef {
    pub(crate) name: String,
    initializer: Option<Op>,
}

/// A computation graph: a set of kernels wired together through handles.
///
/// Nodes can only reference nodes created before them, so the graph is acyclic
/// by construction. A frozen graph rejects every structural mutation.
pub struct Graph {
    nodes: Vec<Node>,
    variables: Vec<VariableDef>,
    pub(crate) iterators: Vec<IteratorDef>,
    counters: HashMap<Counter, Output>,
    collections: HashMap<Collection, Vec<Op>>,
    names: HashSet<String>,
    scopes: Vec<String>,
    device_fn: Option<DeviceFn>,
    seed: Option<u64>,
    op_seed: u64,
    frozen: bool,
}

impl Graph {
    /// Creates a new, empty and unfrozen `Graph`.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            variables: Vec::new(),
            iterators: Vec::new(),
            counters: HashMap::new(),
            collections: HashMap::new(),
            names: HashSet::new(),
            scopes: Vec::new(),
            device_fn: None,
            seed: None,
            op_seed: 0,
            frozen: false,
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Sets the graph level seed, every rng handed out afterwards derives from it.
    pub fn set_random_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
        self.op_seed = 0;
    }

    pub fn random_seed(&self) -> Option<u64> {
        self.seed
    }

    /// Returns a new random number generator.
    ///
    /// With a graph seed the sequence of generators handed out is deterministic.
    pub fn rng(&mut self) -> StdRng {
        match self.seed {
            Some(seed) => {
                let rng = StdRng::seed_from_u64(seed.wrapping_add(self.op_seed));
                self.op_seed += 1;
                rng
            }
            None => StdRng::from_os_rng(),
        }
    }

    /// Sets the function deciding the device of every node created afterwards.
    pub fn set_device_fn(&mut self, device_fn: Option<DeviceFn>) {
        self.device_fn = device_fn;
    }

    /// Runs `f` with every node it creates prefixed by `name`.
    pub fn with_name_scope<T, F>(&mut self, name: &str, f: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
    {
        self.scopes.push(name.to_string());
        let ret = f(self);
        self.scopes.pop();
        ret
    }

    /// Adds a node producing a value.
    ///
    /// # Arguments
    /// * `name` - The name of the node, made unique within the current scope.
    /// * `kernel` - Computes the value of the node on every run that needs it.
    ///
    /// # Returns
    /// The handle to the new node or an error if the graph is frozen.
    pub fn output<F>(&mut self, name: &str, kernel: F) -> Result<Output>
    where
        F: Fn(&mut Scope<'_>) -> Result<Tensor> + Send + Sync + 'static,
    {
        self.add_node(name, Box::new(kernel)).map(Output)
    }

    /// Adds a node that is only run for its side effects.
    pub fn op<F>(&mut self, name: &str, kernel: F) -> Result<Op>
    where
        F: Fn(&mut Scope<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let kernel = move |scope: &mut Scope<'_>| kernel(scope).map(|_| Tensor::empty());
        self.add_node(name, Box::new(kernel)).map(Op)
    }

    pub fn constant(&mut self, name: &str, value: Tensor) -> Result<Output> {
        self.output(name, move |_| Ok(value.clone()))
    }

    /// Adds an op running every op in `ops`, in order.
    pub fn group(&mut self, name: &str, ops: &[Op]) -> Result<Op> {
        let ops = ops.to_vec();
        self.op(name, move |scope| {
            for &op in &ops {
                scope.run(op)?;
            }
            Ok(())
        })
    }

    pub fn no_op(&mut self, name: &str) -> Result<Op> {
        self.op(name, |_| Ok(()))
    }

    /// Creates a new variable.
    ///
    /// # Arguments
    /// * `name` - The unique name of the variable.
    /// * `initial` - The value the variable holds until assigned.
    pub fn variable(&mut self, name: &str, initial: Tensor) -> Result<Variable> {
        self.ensure_mutable(name)?;
        let name = self.unique_name(name);
        debug!(variable = name.as_str(); "created variable");

        self.variables.push(VariableDef { name, initial });
        Ok(Variable(self.variables.len() - 1))
    }

    /// Finds a variable by its full name.
    pub fn find_variable(&self, name: &str) -> Option<Variable> {
        self.variables
            .iter()
            .position(|var| var.name == name)
            .map(Variable)
    }

    /// Returns the variable named `name` in the current scope, creating it if missing.
    pub fn get_or_create_variable<F>(&mut self, name: &str, initial: F) -> Result<Variable>
    where
        F: FnOnce(&mut Self) -> Tensor,
    {
        if let Some(var) = self.find_variable(&self.scoped_name(name)) {
            return Ok(var);
        }

        let initial = initial(self);
        self.variable(name, initial)
    }

    pub fn variable_name(&self, var: Variable) -> &str {
        &self.variables[var.0].name
    }

    pub(crate) fn initial_value(&self, var: Variable) -> &Tensor {
        &self.variables[var.0].initial
    }

    /// Iterates over every variable in creation order.
    pub fn variables(&self) -> impl Iterator<Item = Variable> + '_ {
        (0..self.variables.len()).map(Variable)
    }

    /// Adds a node reading the current value of `var`.
    pub fn read(&mut self, var: Variable) -> Result<Output> {
        let name = format!("{}/read", self.variables[var.0].name);
        self.output(&name, move |scope| scope.read(var))
    }

    /// Adds an op writing the value of `value` into `var`.
    pub fn assign(&mut self, var: Variable, value: Output) -> Result<Op> {
        let name = format!("{}/assign", self.variables[var.0].name);
        self.op(&name, move |scope| {
            let value = scope.eval(value)?;
            scope.assign(var, value)
        })
    }

    /// Creates a new data iterator resource.
    ///
    /// # Arguments
    /// * `name` - The name of the iterator.
    /// * `components` - The amount of tensors in every element.
    pub fn iterator(&mut self, name: &str, components: usize) -> Result<IteratorHandle> {
        self.ensure_mutable(name)?;
        let name = self.unique_name(name);
        self.iterators.push(IteratorDef {
            name,
            initializer: None,
        });

        Ok(IteratorHandle {
            id: self.iterators.len() - 1,
            components,
        })
    }

    /// Adds one node per component of the next element of `iterator`.
    ///
    /// Every component read within the same run sees the same element.
    pub fn next_element(&mut self, iterator: IteratorHandle) -> Result<Vec<Output>> {
        let base = format!("{}/next", self.iterators[iterator.id].name);

        (0..iterator.components)
            .map(|i| {
                self.output(&format!("{base}/{i}"), move |scope| {
                    let element = scope.next_element(iterator)?;
                    Ok(element[i].clone())
                })
            })
            .collect()
    }

    /// Returns the op starting a fresh pass over the dataset fed to `iterator`.
    ///
    /// Every iterator has a single initializer, created the first time it is asked
    /// for. Later calls return the same op, even on a frozen graph.
    pub fn initializer(&mut self, iterator: IteratorHandle) -> Result<Op> {
        if let Some(init) = self.iterators[iterator.id].initializer {
            return Ok(init);
        }

        let name = format!("{}/initializer", self.iterators[iterator.id].name);
        let init = self.op(&name, move |scope| scope.initialize(iterator))?;
        self.iterators[iterator.id].initializer = Some(init);
        Ok(init)
    }

    /// Returns a node reading `counter`, registering the counter if needed.
    pub fn counter(&mut self, counter: Counter) -> Result<Output> {
        if let Some(&read) = self.counters.get(&counter) {
            return Ok(read);
        }

        let read = self.output(counter.name(), move |scope| {
            Ok(Tensor::scalar(scope.counter(counter) as f32))
        })?;

        self.counters.insert(counter, read);
        Ok(read)
    }

    /// Returns `true` if `counter` has been registered in this graph.
    pub fn has_counter(&self, counter: Counter) -> bool {
        self.counters.contains_key(&counter)
    }

    /// Iterates over the registered counters.
    pub fn counters(&self) -> impl Iterator<Item = Counter> + '_ {
        self.counters.keys().copied()
    }

    /// Adds an op incrementing `counter` by one.
    pub fn increment(&mut self, counter: Counter) -> Result<Op> {
        self.counter(counter)?;
        let name = format!("{}/increment", counter.name());
        self.op(&name, move |scope| {
            scope.increment(counter, 1);
            Ok(())
        })
    }

    /// Adds an op setting `counter` back to zero.
    pub fn reset_counter(&mut self, counter: Counter) -> Result<Op> {
        self.counter(counter)?;
        let name = format!("{}/reset", counter.name());
        self.op(&name, move |scope| {
            scope.set_counter(counter, 0);
            Ok(())
        })
    }

    pub fn add_to_collection(&mut self, collection: Collection, op: Op) -> Result<()> {
        self.ensure_mutable(&format!("{collection:?} collection entry"))?;
        self.collections.entry(collection).or_default().push(op);
        Ok(())
    }

    /// Replaces every op in `collection` with `ops`.
    pub fn replace_collection(&mut self, collection: Collection, ops: Vec<Op>) -> Result<()> {
        self.ensure_mutable(&format!("{collection:?} collection"))?;
        self.collections.insert(collection, ops);
        Ok(())
    }

    pub fn collection(&self, collection: Collection) -> &[Op] {
        self.collections
            .get(&collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The full name of the node behind `output`.
    pub fn output_name(&self, output: Output) -> &str {
        &self.nodes[output.0].name
    }

    /// The full name of the node behind `op`.
    pub fn op_name(&self, op: Op) -> &str {
        &self.nodes[op.0].name
    }

    /// The device the node behind `op` was placed on.
    pub fn op_device(&self, op: Op) -> Option<&str> {
        self.nodes[op.0].device.as_deref()
    }

    /// The device the node behind `output` was placed on.
    pub fn output_device(&self, output: Output) -> Option<&str> {
        self.nodes[output.0].device.as_deref()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn kernel(&self, node: usize) -> Result<&Kernel> {
        self.nodes
            .get(node)
            .map(|node| &node.kernel)
            .ok_or_else(|| EngineErr::InvalidArgument(format!("unknown node {node}")))
    }

    fn add_node(&mut self, name: &str, kernel: Kernel) -> Result<usize> {
        self.ensure_mutable(name)?;
        let name = self.unique_name(name);
        let device = self.device_fn.as_ref().and_then(|device_fn| device_fn(&name));

        self.nodes.push(Node {
            name,
            device,
            kernel,
        });

        Ok(self.nodes.len() - 1)
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.frozen {
            return Err(EngineErr::GraphFrozen {
                node: self.scoped_name(what),
            });
        }

        Ok(())
    }

    fn scoped_name(&self, name: &str) -> String {
        if self.scopes.is_empty() {
            return name.to_string();
        }

        format!("{}/{name}", self.scopes.join("/"))
    }

    fn unique_name(&mut self, name: &str) -> String {
        let base = self.scoped_name(name);
        let mut candidate = base.clone();
        let mut suffix = 0;

        while self.names.contains(&candidate) {
            suffix += 1;
            candidate = format!("{base}_{suffix}");
        }

        self.names.insert(candidate.clone());
        candidate
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("variables", &self.variables.len())
            .field("iterators", &self.iterators.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn frozen_graphs_reject_mutations() {
        let mut graph = Graph::new();
        graph.freeze();

        assert!(matches!(
            graph.constant("c", Tensor::scalar(1.0)),
            Err(EngineErr::GraphFrozen { .. })
        ));
        assert!(graph.variable("v", Tensor::scalar(0.0)).is_err());
        assert!(graph.iterator("it", 1).is_err());
        assert!(graph.counter(Counter::GlobalStep).is_err());
        assert_eq!(graph.node_count(), 0);

        graph.unfreeze();
        assert!(graph.constant("c", Tensor::scalar(1.0)).is_ok());
    }

    #[test]
    fn collections_are_replaced_wholesale() {
        let mut graph = Graph::new();
        let a = graph.no_op("a").unwrap();
        let b = graph.no_op("b").unwrap();
        graph.add_to_collection(Collection::LocalInitOps, a).unwrap();
        graph.add_to_collection(Collection::LocalInitOps, b).unwrap();
        assert_eq!(graph.collection(Collection::LocalInitOps), [a, b]);

        graph
            .replace_collection(Collection::LocalInitOps, vec![b])
            .unwrap();
        assert_eq!(graph.collection(Collection::LocalInitOps), [b]);
        assert!(graph.collection(Collection::MetricResets).is_empty());

        graph.freeze();
        assert!(
            graph
                .replace_collection(Collection::LocalInitOps, Vec::new())
                .is_err()
        );
    }

    #[test]
    fn registered_counters_can_be_read_while_frozen() {
        let mut graph = Graph::new();
        let read = graph.counter(Counter::GlobalStep).unwrap();
        graph.freeze();

        assert_eq!(graph.counter(Counter::GlobalStep).unwrap(), read);
        assert!(graph.has_counter(Counter::GlobalStep));
        assert!(!graph.has_counter(Counter::EvalStep));
    }

    #[test]
    fn iterators_have_a_single_initializer() {
        let mut graph = Graph::new();
        let it = graph.iterator("input", 1).unwrap();
        let init = graph.initializer(it).unwrap();
        let nodes = graph.node_count();
        graph.freeze();

        assert_eq!(graph.initializer(it).unwrap(), init);
        assert_eq!(graph.node_count(), nodes);

        graph.unfreeze();
        let other = graph.iterator("other", 1).unwrap();
        graph.freeze();
        assert!(graph.initializer(other).is_err());
    }

    #[test]
    fn names_are_scoped_and_unique() {
        let mut graph = Graph::new();
        let a = graph.no_op("init").unwrap();
        let b = graph.no_op("init").unwrap();
        let c = graph.with_name_scope("train", |g| g.no_op("init")).unwrap();

        assert_eq!(graph.op_name(a), "init");
        assert_eq!(graph.op_name(b), "init_1");
        assert_eq!(graph.op_name(c), "train/init");
    }

    #[test]
    fn device_fn_places_new_nodes() {
        let mut graph = Graph::new();
        let before = graph.no_op("before").unwrap();
        graph.set_device_fn(Some(Arc::new(|name: &str| {
            name.starts_with("gpu").then(|| "/device:GPU:0".to_string())
        })));
        let gpu = graph.no_op("gpu_op").unwrap();
        let cpu = graph.no_op("cpu_op").unwrap();

        assert_eq!(graph.op_device(before), None);
        assert_eq!(graph.op_device(gpu), Some("/device:GPU:0"));
        assert_eq!(graph.op_device(cpu), None);
    }

    #[test]
    fn seeded_graphs_hand_out_deterministic_rngs() {
        let mut a = Graph::new();
        let mut b = Graph::new();
        a.set_random_seed(7);
        b.set_random_seed(7);

        let xa: f32 = a.rng().random();
        let xb: f32 = b.rng().random();
        assert_eq!(xa, xb);

        let ya: f32 = a.rng().random();
        assert_ne!(xa, ya);
    }

    #[test]
    fn scoped_variables_are_reused() {
        let mut graph = Graph::new();
        let first = graph
            .with_name_scope("linear", |g| {
                g.get_or_create_variable("weights", |_| Tensor::scalar(1.0))
            })
            .unwrap();
        let second = graph
            .with_name_scope("linear", |g| {
                g.get_or_create_variable("weights", |_| Tensor::scalar(2.0))
            })
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(graph.variable_name(first), "linear/weights");
        assert_eq!(graph.initial_value(first), &Tensor::scalar(1.0));
    }
}
