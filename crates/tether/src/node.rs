// Node — a Block bound to named dictionary entries
//
// A node reads its declared inputs from the shared DataDict in order,
// calls the block positionally, and writes each returned tensor back under
// the matching declared output name. It never touches any other key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tether_core::{DataDict, Error, Result, Tensor};
use tether_nn::Block;

/// What happens when a node writes a key that is already in the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    /// Replace the existing value (logged at debug level).
    #[default]
    Overwrite,
    /// Fail with `Error::KeyCollision`.
    Strict,
}

fn check_keys(node: &str, what: &str, keys: &[String]) -> Result<()> {
    for (i, k) in keys.iter().enumerate() {
        if k.trim().is_empty() {
            return Err(Error::msg(format!("node '{node}': empty {what} key")));
        }
        if keys[..i].contains(k) {
            return Err(Error::msg(format!(
                "node '{node}': {what} key '{k}' declared twice"
            )));
        }
    }
    Ok(())
}

/// A named computation step with declared inputs and outputs.
#[derive(Clone)]
pub struct Node {
    name: String,
    block: Arc<dyn Block>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl Node {
    /// Wrap `block`, reading `inputs` and writing `outputs`.
    ///
    /// Keys must be non-empty and unique within each list.
    pub fn new<B, I, O>(
        name: impl Into<String>,
        block: B,
        inputs: impl IntoIterator<Item = I>,
        outputs: impl IntoIterator<Item = O>,
    ) -> Result<Self>
    where
        B: Block + 'static,
        I: Into<String>,
        O: Into<String>,
    {
        Self::from_shared(name, Arc::new(block), inputs, outputs)
    }

    /// Like [`Node::new`] for a block that is already shared.
    pub fn from_shared<I, O>(
        name: impl Into<String>,
        block: Arc<dyn Block>,
        inputs: impl IntoIterator<Item = I>,
        outputs: impl IntoIterator<Item = O>,
    ) -> Result<Self>
    where
        I: Into<String>,
        O: Into<String>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::msg("node name must not be empty"));
        }
        let inputs: Vec<String> = inputs.into_iter().map(Into::into).collect();
        let outputs: Vec<String> = outputs.into_iter().map(Into::into).collect();
        check_keys(&name, "input", &inputs)?;
        check_keys(&name, "output", &outputs)?;
        if outputs.is_empty() {
            return Err(Error::msg(format!("node '{name}' declares no outputs")));
        }
        Ok(Node {
            name,
            block,
            inputs,
            outputs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn block(&self) -> &Arc<dyn Block> {
        &self.block
    }

    /// Run once, overwriting existing keys.
    pub fn execute(&self, dict: &mut DataDict) -> Result<()> {
        self.execute_with_policy(dict, KeyPolicy::Overwrite)
    }

    pub fn execute_with_policy(&self, dict: &mut DataDict, policy: KeyPolicy) -> Result<()> {
        let context = format!("node '{}'", self.name);
        let args = self
            .inputs
            .iter()
            .map(|k| dict.require(k, &context).cloned())
            .collect::<Result<Vec<Tensor>>>()?;

        let results = self.block.apply(&args)?;
        if results.len() != self.outputs.len() {
            return Err(Error::OutputArity {
                node: self.name.clone(),
                expected: self.outputs.len(),
                got: results.len(),
            });
        }

        if policy == KeyPolicy::Strict {
            if let Some(k) = self.outputs.iter().find(|k| dict.contains_key(k)) {
                return Err(Error::KeyCollision {
                    key: k.clone(),
                    node: self.name.clone(),
                });
            }
        }

        for (key, value) in self.outputs.iter().zip(results) {
            if dict.insert(key.clone(), value).is_some() {
                tracing::debug!(node = %self.name, key = %key, "overwrote existing key");
            }
        }
        tracing::trace!(node = %self.name, block = %self.block.label(), "executed");
        Ok(())
    }

    /// A copy whose keys are renamed through `map`; unmapped keys stay.
    pub fn renamed(&self, map: &BTreeMap<String, String>) -> Result<Self> {
        let rename = |k: &String| map.get(k).cloned().unwrap_or_else(|| k.clone());
        Self::from_shared(
            self.name.clone(),
            self.block.clone(),
            self.inputs.iter().map(rename),
            self.outputs.iter().map(rename),
        )
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.block.parameters()
    }

    /// Block parameters prefixed with the node name.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.block
            .named_parameters()
            .into_iter()
            .map(|(k, p)| (format!("{}.{k}", self.name), p))
            .collect()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("block", &self.block.label())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: [{}] -> {} -> [{}]",
            self.name,
            self.inputs.join(", "),
            self.block.label(),
            self.outputs.join(", ")
        )
    }
}
