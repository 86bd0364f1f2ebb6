//! # tether-core
//!
//! Tensor primitives, reverse-mode autograd and the shared data dictionary
//! for Tether.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional `f64` array with automatic differentiation
//! - [`Shape`] — dimension sizes, strides and broadcasting rules
//! - [`GradStore`] — gradient storage returned by `backward()`
//! - [`no_grad`] — run a closure without recording a graph
//! - [`DataDict`] — the named-tensor context every node reads and writes
//! - [`Error`] / [`Result`] — the error type shared by every Tether crate

pub mod backprop;
pub mod dict;
pub mod error;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backprop::{is_grad_enabled, no_grad, GradStore};
pub use dict::DataDict;
pub use error::{Error, Result};
pub use op::{Op, TensorId};
pub use shape::Shape;
pub use tensor::Tensor;
