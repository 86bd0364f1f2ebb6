// Op — Computational graph node for automatic differentiation
//
// Every tensor that results from a computation records HOW it was created
// via the Op enum. This forms a directed acyclic graph that backward()
// traverses to compute gradients.
//
// Example: c = a + b
//   a.op = Op::None (leaf)
//   b.op = Op::None (leaf)
//   c.op = Op::Binary { lhs: a, rhs: b, op: Add }
//
// Each variant stores the actual input tensors. Tensors are Arc-wrapped, so
// this is cheap, and it lets backward() read input values directly (the
// gradient of a*b with respect to a needs the value of b). The graph keeps
// its inputs alive exactly as long as the output exists.
//
// Under `no_grad`, ops record Op::None instead and no graph is built.

use crate::shape::Shape;
use crate::tensor::Tensor;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Element-wise binary operations (with broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Relu,
    Sigmoid,
    Tanh,
    Sin,
    Cos,
}

impl UnaryOp {
    pub(crate) fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Square => x * x,
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
        }
    }
}

/// Reductions. A `dim` of `None` reduces over every element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

/// Records the operation that produced a tensor, storing references to inputs.
#[derive(Clone)]
pub enum Op {
    /// Leaf tensor (input data, parameter, or anything built under no_grad).
    None,

    /// Element-wise binary: result = op(lhs, rhs)
    Binary {
        lhs: Tensor,
        rhs: Tensor,
        op: BinaryOp,
    },

    /// Element-wise unary: result = op(input)
    Unary { input: Tensor, op: UnaryOp },

    /// Reduction over one dimension or over everything.
    Reduce {
        input: Tensor,
        op: ReduceOp,
        dim: Option<usize>,
        keep_dim: bool,
    },

    /// Matrix multiplication: result = lhs @ rhs (2-D operands).
    Matmul { lhs: Tensor, rhs: Tensor },

    /// 2-D transpose.
    Transpose { input: Tensor },

    /// Reshape (includes squeeze/unsqueeze). src_shape lets backward undo it.
    Reshape { input: Tensor, src_shape: Shape },

    /// Slice `len` entries starting at `start` along `dim`.
    Narrow {
        input: Tensor,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// Affine transform: result = input * mul + add
    Affine { input: Tensor, mul: f64, add: f64 },

    /// Concatenation along `dim`; `sizes` holds each input's extent there.
    Cat {
        inputs: Vec<Tensor>,
        dim: usize,
        sizes: Vec<usize>,
    },

    /// Element-wise power: result = input ^ exponent.
    Powf { input: Tensor, exponent: f64 },

    /// Element-wise clamp: result = clamp(input, min, max).
    Clamp { input: Tensor, min: f64, max: f64 },
}

impl Op {
    /// The input tensors of this op, in operand order.
    pub fn inputs(&self) -> Vec<&Tensor> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Transpose { input }
            | Op::Reshape { input, .. }
            | Op::Narrow { input, .. }
            | Op::Affine { input, .. }
            | Op::Powf { input, .. }
            | Op::Clamp { input, .. } => vec![input],
            Op::Cat { inputs, .. } => inputs.iter().collect(),
        }
    }

    /// Whether this is a leaf (no recorded computation).
    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { op, .. } => write!(f, "Binary({op:?})"),
            Op::Unary { op, .. } => write!(f, "Unary({op:?})"),
            Op::Reduce { op, dim, .. } => write!(f, "Reduce({op:?}, dim={dim:?})"),
            Op::Matmul { .. } => write!(f, "Matmul"),
            Op::Transpose { .. } => write!(f, "Transpose"),
            Op::Reshape { src_shape, .. } => write!(f, "Reshape(from {src_shape})"),
            Op::Narrow { dim, start, len, .. } => write!(f, "Narrow({dim}, {start}, {len})"),
            Op::Affine { mul, add, .. } => write!(f, "Affine({mul}, {add})"),
            Op::Cat { dim, .. } => write!(f, "Cat(dim={dim})"),
            Op::Powf { exponent, .. } => write!(f, "Powf({exponent})"),
            Op::Clamp { min, max, .. } => write!(f, "Clamp({min}, {max})"),
        }
    }
}
