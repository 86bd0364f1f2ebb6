//! # tether-optim
//!
//! Update rules for Tether parameters.
//!
//! - [`SGD`] with momentum, [`Adam`], [`AdamW`]
//! - [`Optimizer`] — the interface the trainer drives
//! - [`OptimizerState`] — serializable snapshot for checkpoints
//! - gradient norm and clipping helpers

pub mod adam;
pub mod clip;
pub mod optimizer;
pub mod sgd;

pub use adam::{Adam, AdamConfig, AdamW};
pub use clip::{clip_grad_norm, clip_grad_value, grad_norm, grads_finite};
pub use optimizer::{Optimizer, OptimizerState};
pub use sgd::SGD;
