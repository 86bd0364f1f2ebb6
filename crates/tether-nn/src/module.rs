// Module trait — single-tensor layers
//
// A Module maps one tensor to one tensor and owns its trainable parameters.
// Layers such as Linear and the activations implement it; Sequential chains
// them. To place a Module inside a graph node, wrap it in a ModuleBlock.

use tether_core::{Result, Tensor};

/// A layer with one input and one output.
///
/// # Example
/// ```
/// use tether_core::{Result, Tensor};
/// use tether_nn::{Linear, Module};
///
/// struct Residual {
///     inner: Linear,
/// }
///
/// impl Module for Residual {
///     fn forward(&self, x: &Tensor) -> Result<Tensor> {
///         x.add(&self.inner.forward(x)?)
///     }
///     fn parameters(&self) -> Vec<Tensor> {
///         self.inner.parameters()
///     }
/// }
/// ```
pub trait Module: Send + Sync {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// All trainable parameters of this module.
    fn parameters(&self) -> Vec<Tensor>;

    /// Total number of scalar parameters in this module.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Trainable parameters with readable names.
    ///
    /// Leaf layers override this with names like `"weight"` / `"bias"`.
    /// Composite modules prefix their children's names with a `"."`
    /// separator, e.g. `"layers.0.weight"`. The default uses positional
    /// indices (`param_0`, `param_1`, …).
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }
}

impl<M: Module + ?Sized> Module for Box<M> {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        (**self).forward(x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        (**self).parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        (**self).named_parameters()
    }
}
