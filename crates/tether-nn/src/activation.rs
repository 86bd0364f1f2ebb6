// Activation modules — tensor activations as parameter-free Modules,
// so they compose inside Sequential.

use tether_core::{Result, Tensor};

use crate::module::Module;

/// ReLU activation: max(0, x)
pub struct ReLU;

impl Module for ReLU {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.relu()
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// SiLU / Swish activation: x * σ(x)
pub struct SiLU;

impl Module for SiLU {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.mul(&x.sigmoid()?)
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// Sigmoid activation: 1 / (1 + e^(-x))
pub struct Sigmoid;

impl Module for Sigmoid {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.sigmoid()
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// Tanh activation
pub struct Tanh;

impl Module for Tanh {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.tanh()
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}
