// Block — the capability interface a graph node wraps
//
// A Block takes an ordered slice of tensors and returns an ordered Vec of
// tensors. It exposes its parameters so the trainer can register them with
// an optimizer. Nodes never inspect a block beyond this interface.
//
// Three adapters cover the usual cases:
//
//   ModuleBlock — any single-tensor Module (Linear, Sequential, ...)
//   FnBlock     — a closure, optionally owning parameters
//   Arc<B>      — share one block between several nodes

use std::fmt;
use std::sync::Arc;

use tether_core::{Error, Result, Tensor};

use crate::module::Module;

/// A differentiable unit with fixed-arity ordered inputs and outputs.
pub trait Block: Send + Sync {
    /// Run the computation on positional inputs.
    fn apply(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;

    /// Trainable parameters owned by this block.
    fn parameters(&self) -> Vec<Tensor>;

    /// Parameters with readable names; positional by default.
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }

    /// Short label used in logs and graph descriptions.
    fn label(&self) -> String {
        "block".to_string()
    }
}

impl<B: Block + ?Sized> Block for Arc<B> {
    fn apply(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        (**self).apply(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        (**self).parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        (**self).named_parameters()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}

/// Adapts a one-in/one-out [`Module`] to the [`Block`] interface.
///
/// Inputs with more than two dimensions (e.g. `[batch, time, features]`)
/// are flattened to `[rows, features]` before the module runs and restored
/// afterwards, so dense layers apply per time step.
pub struct ModuleBlock<M: Module> {
    module: M,
    label: String,
}

impl<M: Module> ModuleBlock<M> {
    pub fn new(module: M) -> Self {
        ModuleBlock {
            module,
            label: "module".to_string(),
        }
    }

    /// Set the label shown in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn module(&self) -> &M {
        &self.module
    }
}

impl<M: Module> Block for ModuleBlock<M> {
    fn apply(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let x = match inputs {
            [x] => x,
            _ => {
                return Err(Error::msg(format!(
                    "{}: module blocks take exactly one input, got {}",
                    self.label,
                    inputs.len()
                )))
            }
        };
        if x.rank() <= 2 {
            return Ok(vec![self.module.forward(x)?]);
        }
        let dims = x.dims().to_vec();
        let features = dims[dims.len() - 1];
        let rows = x.elem_count() / features.max(1);
        let y = self.module.forward(&x.reshape((rows, features))?)?;
        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.extend_from_slice(&y.dims()[1..]);
        Ok(vec![y.reshape(out_dims)?])
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.module.parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.module.named_parameters()
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

type BlockFn = dyn Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync;

/// A block defined by a closure.
///
/// Parameters the closure captures must also be handed to
/// [`FnBlock::with_parameters`] so the optimizer can see them.
///
/// ```
/// use tether_core::Tensor;
/// use tether_nn::{Block, FnBlock};
///
/// let double = FnBlock::new("double", |xs| Ok(vec![xs[0].mul_scalar(2.0)?]));
/// let y = double.apply(&[Tensor::scalar(3.0)]).unwrap();
/// assert_eq!(y[0].to_scalar_f64().unwrap(), 6.0);
/// ```
#[derive(Clone)]
pub struct FnBlock {
    label: String,
    params: Vec<(String, Tensor)>,
    func: Arc<BlockFn>,
}

impl FnBlock {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        FnBlock {
            label: label.into(),
            params: Vec::new(),
            func: Arc::new(func),
        }
    }

    /// A closure block that owns named parameters.
    pub fn with_parameters<F>(
        label: impl Into<String>,
        params: Vec<(String, Tensor)>,
        func: F,
    ) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        FnBlock {
            label: label.into(),
            params,
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FnBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBlock")
            .field("label", &self.label)
            .field("params", &self.params.len())
            .finish()
    }
}

impl Block for FnBlock {
    fn apply(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        (self.func)(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.params.iter().map(|(_, p)| p.clone()).collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.params.clone()
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}
