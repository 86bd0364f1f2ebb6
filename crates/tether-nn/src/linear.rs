// Linear — Fully-connected (dense) layer: y = xW^T + b
//
// PARAMETER SHAPES:
//
//   weight: [out_features, in_features]
//   bias:   [1, out_features]            — broadcast across batch dimension
//
// Weights and bias start from Kaiming uniform U(-k, k), k = sqrt(1/in_features).

use rand::Rng;
use tether_core::{Error, Result, Tensor};

use crate::init;
use crate::module::Module;

/// A fully-connected layer.
///
/// ```
/// use tether_core::Tensor;
/// use tether_nn::{Linear, Module};
///
/// let linear = Linear::new(4, 2, true).unwrap();
/// let x = Tensor::rand((8, 4)).unwrap();
/// assert_eq!(linear.forward(&x).unwrap().dims(), &[8, 2]);
/// ```
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Create a layer with randomly initialized parameters.
    pub fn new(in_features: usize, out_features: usize, use_bias: bool) -> Result<Self> {
        Self::new_with(in_features, out_features, use_bias, &mut rand::thread_rng())
    }

    /// Create a layer drawing its initial parameters from `rng`.
    pub fn new_with<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let k = (1.0 / in_features.max(1) as f64).sqrt();
        let weight = init::uniform_with((out_features, in_features), -k, k, rng)?;
        let bias = if use_bias {
            Some(init::uniform_with((1, out_features), -k, k, rng)?)
        } else {
            None
        };
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Build a layer from existing weight and bias tensors.
    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: weight.rank(),
            });
        }
        let (out_features, in_features) = (weight.dims()[0], weight.dims()[1]);
        let bias = match bias {
            Some(b) => Some(b.reshape((1, out_features))?.set_variable()),
            None => None,
        };
        Ok(Linear {
            weight: weight.set_variable(),
            bias,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    /// Input shape:  [batch, in_features]
    /// Output shape: [batch, out_features]
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let output = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => output.add(bias),
            None => Ok(output),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut named = vec![("weight".to_string(), self.weight.clone())];
        if let Some(ref b) = self.bias {
            named.push(("bias".to_string(), b.clone()));
        }
        named
    }
}
