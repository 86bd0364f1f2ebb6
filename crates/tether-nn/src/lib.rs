//! # tether-nn
//!
//! Computation blocks for Tether graphs.
//!
//! 1. **Block trait** — the multi-input/multi-output interface nodes wrap
//! 2. **Module trait** — single-tensor layers, adapted by `ModuleBlock`
//! 3. **Linear / Sequential / activations** — reference layers
//! 4. **init** — parameter initializers
//! 5. **Loss functions** — `mse_loss`, `l1_loss`

pub mod activation;
pub mod block;
pub mod init;
pub mod linear;
pub mod loss;
pub mod module;
pub mod sequential;

pub use activation::{ReLU, SiLU, Sigmoid, Tanh};
pub use block::{Block, FnBlock, ModuleBlock};
pub use linear::Linear;
pub use loss::{l1_loss, l1_loss_with_reduction, mse_loss, mse_loss_with_reduction, Reduction};
pub use module::Module;
pub use sequential::Sequential;
