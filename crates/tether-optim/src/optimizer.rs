// Optimizer trait and serializable optimizer state
//
// An optimizer owns clones of the parameter tensors it updates. Since a
// parameter clone shares storage with the tensor held by its block, writing
// new values through `update_data_inplace` is visible to the block on the
// next forward pass.
//
// Gradients are not stored on tensors; each backward() returns a fresh
// GradStore which `step` consumes. Nothing carries over between steps, so
// `zero_grad` has no buffers to clear unless an implementation adds some.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tether_core::{GradStore, Result, Tensor};

/// A first-order update rule over a fixed list of parameters.
pub trait Optimizer: Send {
    /// Apply one update using the gradients in `grads`.
    ///
    /// Parameters with no gradient in the store are left untouched.
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    /// Reset any accumulated gradient buffers.
    fn zero_grad(&mut self) {}

    /// The parameters this optimizer updates.
    fn params(&self) -> &[Tensor];

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Snapshot the internal state (moments, step counters, hyperparameters).
    fn state(&self) -> OptimizerState;

    /// Restore internal state produced by [`Optimizer::state`].
    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Serializable optimizer state: named scalars plus named flat buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub optimizer_type: String,
    pub scalars: BTreeMap<String, f64>,
    pub buffers: BTreeMap<String, Vec<f64>>,
}

impl OptimizerState {
    pub fn new(optimizer_type: impl Into<String>) -> Self {
        OptimizerState {
            optimizer_type: optimizer_type.into(),
            scalars: BTreeMap::new(),
            buffers: BTreeMap::new(),
        }
    }

    pub fn set_scalar(&mut self, key: impl Into<String>, value: f64) {
        self.scalars.insert(key.into(), value);
    }

    pub fn get_scalar(&self, key: &str) -> Option<f64> {
        self.scalars.get(key).copied()
    }

    pub fn set_buffer(&mut self, key: impl Into<String>, data: Vec<f64>) {
        self.buffers.insert(key.into(), data);
    }

    pub fn get_buffer(&self, key: &str) -> Option<&Vec<f64>> {
        self.buffers.get(key)
    }

    /// Fail unless this state was written by an optimizer of type `expected`.
    pub(crate) fn check_type(&self, expected: &str) -> Result<()> {
        if self.optimizer_type != expected {
            tether_core::bail!(
                "optimizer state is for '{}', cannot load into '{}'",
                self.optimizer_type,
                expected
            );
        }
        Ok(())
    }
}

/// Load per-parameter buffers named `{prefix}.{i}` back into `slots`.
pub(crate) fn load_buffers(
    state: &OptimizerState,
    prefix: &str,
    slots: &mut [Vec<f64>],
) -> Result<()> {
    for (i, slot) in slots.iter_mut().enumerate() {
        if let Some(buf) = state.get_buffer(&format!("{prefix}.{i}")) {
            if buf.len() != slot.len() {
                tether_core::bail!(
                    "optimizer buffer {prefix}.{i} has {} values, parameter has {}",
                    buf.len(),
                    slot.len()
                );
            }
            slot.copy_from_slice(buf);
        }
    }
    Ok(())
}

pub(crate) fn store_buffers(state: &mut OptimizerState, prefix: &str, slots: &[Vec<f64>]) {
    for (i, slot) in slots.iter().enumerate() {
        state.set_buffer(format!("{prefix}.{i}"), slot.clone());
    }
}
