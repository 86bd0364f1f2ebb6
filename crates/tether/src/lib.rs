//! # Tether
//!
//! Constrained differentiable optimization over composable computation
//! graphs: physics-informed learning, system identification and
//! model-based control.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use tether::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `tether-core` | Tensor, Shape, autograd, DataDict, Error |
//! | `tether-nn` | Block/Module traits, Linear, Sequential, activations, losses |
//! | `tether-optim` | Optimizers (SGD, Adam, AdamW), gradient clipping |
//! | `tether-data` | BatchSource, DictDataset, DictLoader |
//!
//! ## Modules
//!
//! - [`variable`] — symbolic expressions over dictionary keys
//! - [`constraint`] — compiling expressions into objective/constraint terms
//! - [`node`] — a Block bound to named inputs and outputs
//! - [`system`] — dependency-ordered node graphs and rollouts
//! - [`problem`] — systems plus terms reduced to one loss
//! - [`trainer`] — the constrained-optimization loop
//! - [`config`] — trainer configuration
//! - [`checkpoint`] — save and load trainer state
//! - [`logging`] — tracing setup and metric sinks

/// Re-export core types.
pub use tether_core::{
    is_grad_enabled, no_grad, DataDict, Error, GradStore, Op, Result, Shape, Tensor, TensorId,
};

/// Re-export blocks, layers and losses.
pub mod nn {
    pub use tether_nn::*;
}

/// Re-export optimizers.
pub mod optim {
    pub use tether_optim::*;
}

/// Re-export data loading.
pub mod data {
    pub use tether_data::*;
}

pub mod checkpoint;
pub mod config;
pub mod constraint;
pub mod logging;
pub mod node;
pub mod problem;
pub mod system;
pub mod trainer;
pub mod variable;

pub use checkpoint::{ParamSnapshot, TrainerCheckpoint};
pub use config::{PenaltyConfig, TrainerConfig, ValidationMetric};
pub use constraint::{compile, Constraint, Expression, Metric, Objective, Term, TermKind, TermValue};
pub use logging::{init_tracing, MemorySink, MetricSink, TracingSink};
pub use node::{KeyPolicy, Node};
pub use problem::{Problem, ProblemOutput, TermReport, ViolationStats};
pub use system::{Rollout, Steps, System};
pub use trainer::{EpochLog, Termination, TrainOutcome, Trainer, TrainerState};
pub use variable::{Comparison, Relation, Variable};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::data::{random_split, BatchSource, DataLoaderConfig, DictDataset, DictLoader};
    pub use crate::nn::{l1_loss, mse_loss, Block, FnBlock, Module, ModuleBlock};
    pub use crate::nn::{Linear, ReLU, Sequential, SiLU, Sigmoid, Tanh};
    pub use crate::optim::{clip_grad_norm, grad_norm, Adam, AdamW, Optimizer, OptimizerState, SGD};
    pub use crate::{
        compile, Constraint, KeyPolicy, MemorySink, MetricSink, Node, Objective, PenaltyConfig,
        Problem, Steps, System, Term, Termination, Trainer, TrainerConfig, ValidationMetric,
        Variable,
    };
    pub use crate::{no_grad, DataDict, Error, GradStore, Result, Shape, Tensor};
}
