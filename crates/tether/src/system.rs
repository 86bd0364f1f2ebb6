// System — dependency-ordered execution of Nodes, optionally unrolled
//
// Ordering: node B depends on node A when B reads a key A writes. Kahn's
// algorithm picks, among the nodes whose producers have all run, the one
// declared first, so independent nodes keep declaration order and the
// order never depends on hashing. A node reading its own output is not a
// dependency; that pattern is how a node updates a key in place.
//
// Rollout: with more than one step the per-step order runs T times on a
// fresh dictionary each step. A step sees
//
//   - the caller's dictionary,
//   - step t of every sequence input (`x[:, t]`),
//   - for each state link (from → to), the previous step's `from` output
//     written under `to` (the caller supplies `to` for t = 0).
//
// Outputs are stacked over steps into trajectories along dim 1 (dim 0 for
// scalar outputs) and merged back under the output names.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use tether_core::{DataDict, Error, Result, Tensor, TensorId};

use crate::node::{KeyPolicy, Node};

/// How many steps a system runs per forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Steps {
    /// One pass, written straight into the caller's dictionary.
    #[default]
    Single,
    /// A fixed rollout horizon.
    Fixed(usize),
    /// The size of dim 1 of this input (`[batch, time, ...]`).
    FromKey(String),
}

/// Execution order over `nodes`.
fn execution_order(system: &str, nodes: &[Node]) -> Result<Vec<usize>> {
    let n = nodes.len();
    let mut producers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for key in node.outputs() {
            producers.entry(key.as_str()).or_default().push(i);
        }
    }

    let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut in_degree = vec![0usize; n];
    for (j, node) in nodes.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for key in node.inputs() {
            if let Some(ps) = producers.get(key.as_str()) {
                deps.extend(ps.iter().copied().filter(|&i| i != j));
            }
        }
        in_degree[j] = deps.len();
        for i in deps {
            dependents[i].insert(j);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() < n {
        let nodes = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].name().to_string())
            .collect();
        return Err(Error::CyclicGraph {
            system: system.to_string(),
            nodes,
        });
    }
    Ok(order)
}

/// Per-step dictionaries of one rollout.
#[derive(Debug, Clone)]
pub struct Rollout {
    steps: Vec<DataDict>,
}

impl Rollout {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[DataDict] {
        &self.steps
    }

    /// `key` at every step, stacked along dim 1 (dim 0 for scalars).
    pub fn trajectory(&self, key: &str) -> Result<Tensor> {
        let frames = self
            .steps
            .iter()
            .enumerate()
            .map(|(t, step)| step.require(key, &format!("rollout step {t}")).cloned())
            .collect::<Result<Vec<_>>>()?;
        let dim = frames.first().map_or(0, |f| f.rank().min(1));
        Tensor::stack(&frames, dim)
    }
}

/// A named, ordered collection of nodes.
#[derive(Debug, Clone)]
pub struct System {
    name: String,
    nodes: Vec<Node>,
    order: Vec<usize>,
    policy: KeyPolicy,
    steps: Steps,
    state_links: Vec<(String, String)>,
    sequence_inputs: Vec<String>,
}

impl System {
    /// Fails with `Error::CyclicGraph` when the nodes have no valid order.
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Result<Self> {
        let name = name.into();
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if !seen.insert(node.name()) {
                return Err(Error::msg(format!(
                    "system '{name}': duplicate node name '{}'",
                    node.name()
                )));
            }
        }
        let order = execution_order(&name, &nodes)?;
        tracing::debug!(
            system = %name,
            order = ?order.iter().map(|&i| nodes[i].name()).collect::<Vec<_>>(),
            "resolved execution order"
        );
        Ok(System {
            name,
            nodes,
            order,
            policy: KeyPolicy::default(),
            steps: Steps::default(),
            state_links: Vec::new(),
            sequence_inputs: Vec::new(),
        })
    }

    /// Rename keys in every node (`old → new`) and re-resolve the order.
    pub fn with_name_map(mut self, map: &BTreeMap<String, String>) -> Result<Self> {
        self.nodes = self
            .nodes
            .iter()
            .map(|n| n.renamed(map))
            .collect::<Result<Vec<_>>>()?;
        self.order = execution_order(&self.name, &self.nodes)?;
        Ok(self)
    }

    pub fn with_key_policy(mut self, policy: KeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_steps(mut self, steps: Steps) -> Self {
        self.steps = steps;
        self
    }

    /// Feed output `from` of step t into input `to` of step t + 1.
    pub fn with_state(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.state_links.push((from.into(), to.into()));
        self
    }

    /// Inputs shaped `[batch, time, ...]`, sliced to `[batch, ...]` per step.
    pub fn with_sequence_inputs<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.sequence_inputs.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn key_policy(&self) -> KeyPolicy {
        self.policy
    }

    /// Node names in the order they run.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].name()).collect()
    }

    /// Every key some node writes, in execution order.
    pub fn output_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for &i in &self.order {
            for k in self.nodes[i].outputs() {
                if !keys.contains(k) {
                    keys.push(k.clone());
                }
            }
        }
        keys
    }

    /// Whether this system unrolls over time.
    pub fn is_recurrent(&self) -> bool {
        self.steps != Steps::Single
    }

    fn num_steps(&self, dict: &DataDict) -> Result<usize> {
        let steps = match &self.steps {
            Steps::Single => 1,
            Steps::Fixed(n) => *n,
            Steps::FromKey(key) => {
                let context = format!("system '{}' (rollout length)", self.name);
                let t = dict.require(key, &context)?;
                if t.rank() < 2 {
                    return Err(Error::msg(format!(
                        "system '{}': rollout length key '{key}' needs a time dimension, got shape {}",
                        self.name,
                        t.shape()
                    )));
                }
                t.dims()[1]
            }
        };
        if steps == 0 {
            return Err(Error::msg(format!(
                "system '{}': rollout length must be at least 1",
                self.name
            )));
        }
        Ok(steps)
    }

    fn run_nodes(&self, dict: &mut DataDict) -> Result<()> {
        for &i in &self.order {
            self.nodes[i].execute_with_policy(dict, self.policy)?;
        }
        Ok(())
    }

    /// Unroll the system and keep every step's dictionary.
    pub fn rollout(&self, dict: &DataDict) -> Result<Rollout> {
        let t_max = self.num_steps(dict)?;
        let context = format!("system '{}'", self.name);
        let mut steps: Vec<DataDict> = Vec::with_capacity(t_max);

        for t in 0..t_max {
            let mut step = dict.clone();
            for key in &self.sequence_inputs {
                let seq = dict.require(key, &context)?;
                step.insert(key.clone(), seq.select(1, t)?);
            }
            if let Some(prev) = steps.last() {
                for (from, to) in &self.state_links {
                    step.insert(to.clone(), prev.require(from, &context)?.clone());
                }
            }
            self.run_nodes(&mut step)?;
            steps.push(step);
        }
        tracing::debug!(system = %self.name, steps = t_max, "rollout complete");
        Ok(Rollout { steps })
    }

    /// Run into `dict`.
    ///
    /// A single-step system writes its outputs directly. A rollout writes
    /// one trajectory per output key, replacing anything under that key.
    pub fn forward(&self, dict: &mut DataDict) -> Result<()> {
        if !self.is_recurrent() {
            return self.run_nodes(dict);
        }
        let rollout = self.rollout(dict)?;
        for key in self.output_keys() {
            dict.insert(key.clone(), rollout.trajectory(&key)?);
        }
        Ok(())
    }

    /// Parameters of every node, each tensor listed once.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut seen: BTreeSet<TensorId> = BTreeSet::new();
        let mut out = Vec::new();
        for node in &self.nodes {
            for p in node.parameters() {
                if seen.insert(p.id()) {
                    out.push(p);
                }
            }
        }
        out
    }

    /// Parameters prefixed `system.node.`, each tensor listed once.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut seen: BTreeSet<TensorId> = BTreeSet::new();
        let mut out = Vec::new();
        for node in &self.nodes {
            for (k, p) in node.named_parameters() {
                if seen.insert(p.id()) {
                    out.push((format!("{}.{k}", self.name), p));
                }
            }
        }
        out
    }

    /// A multi-line summary of nodes in execution order.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        let _ = write!(s, "system '{}'", self.name);
        match &self.steps {
            Steps::Single => {}
            Steps::Fixed(n) => {
                let _ = write!(s, " (rollout, {n} steps)");
            }
            Steps::FromKey(k) => {
                let _ = write!(s, " (rollout, steps from '{k}')");
            }
        }
        s.push('\n');
        for (pos, &i) in self.order.iter().enumerate() {
            let _ = writeln!(s, "  {pos}. {}", self.nodes[i]);
        }
        for (from, to) in &self.state_links {
            let _ = writeln!(s, "  state: {from} -> {to}");
        }
        s
    }
}
