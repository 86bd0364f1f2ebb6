// Backpropagation — Reverse-mode automatic differentiation
//
// backward() walks the graph recorded in each tensor's Op from a scalar
// loss down to the leaves, applying the chain rule.
//
//   1. Topologically sort the graph reachable from the root (leaves first).
//   2. Seed grad(root) = 1.
//   3. Visit tensors root-first, pushing each tensor's gradient into its
//      inputs according to the rule for its Op.
//
// GRADIENT RULES:
//
//   Binary Add:  grad_a += g,      grad_b += g
//   Binary Sub:  grad_a += g,      grad_b += -g
//   Binary Mul:  grad_a += g * b,  grad_b += g * a
//   Binary Div:  grad_a += g / b,  grad_b += -g * a / b²
//   Matmul:      grad_A += g @ Bᵀ, grad_B += Aᵀ @ g
//   Sum/Mean:    grad_in += broadcast(g) (divided by the count for Mean)
//   Max:         grad flows to the first maximal element only
//   Reshape:     grad_in += reshape(g, src_shape)
//   Narrow:      grad scattered back into zeros at the sliced position
//   Cat:         grad split by the recorded sizes
//
// Binary ops broadcast, so gradients are summed back down to each operand's
// shape. A tensor used several times receives the sum of its contributions.
//
// The whole backward pass runs with recording off; gradients are plain
// leaf tensors.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::op::{BinaryOp, Op, ReduceOp, TensorId, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Stores gradients for all tensors in a computation graph.
///
/// After calling `tensor.backward()`, you receive a GradStore.
/// Use `grads.get(&tensor)` to retrieve the gradient for any tensor.
#[derive(Clone, Default)]
pub struct GradStore {
    grads: HashMap<TensorId, Tensor>,
}

impl GradStore {
    /// Create a new empty GradStore.
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Get the gradient of a tensor (if it exists).
    pub fn get(&self, tensor: &Tensor) -> Option<&Tensor> {
        self.grads.get(&tensor.id())
    }

    /// Get a gradient by tensor id.
    pub fn get_by_id(&self, id: &TensorId) -> Option<&Tensor> {
        self.grads.get(id)
    }

    /// Replace the gradient stored for a tensor id.
    pub fn insert(&mut self, id: TensorId, grad: Tensor) {
        self.grads.insert(id, grad);
    }

    /// Accumulate gradient for a tensor.
    /// If a gradient already exists for this tensor, add the new one to it.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor) -> Result<()> {
        let merged = match self.grads.get(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, merged);
        Ok(())
    }

    /// Iterate over (id, gradient) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &Tensor)> {
        self.grads.iter()
    }

    /// Number of stored gradients.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

impl std::fmt::Debug for GradStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradStore")
            .field("len", &self.grads.len())
            .finish()
    }
}

// Recording switch

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether ops on this thread currently record their inputs.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|c| c.get())
}

/// Run `f` with graph recording switched off on this thread.
///
/// Tensors created inside are leaves. The previous setting is restored
/// afterwards, so calls nest.
pub fn no_grad<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let previous = GRAD_ENABLED.with(|c| c.replace(false));
    let result = f();
    GRAD_ENABLED.with(|c| c.set(previous));
    result
}

/// Build a topological ordering of the computation graph (leaves first).
///
/// Iterative post-order DFS; long rollouts produce graphs deep enough to
/// overflow a recursive walk.
fn build_topo(root: &Tensor) -> Vec<Tensor> {
    let mut visited: HashSet<TensorId> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Tensor, bool)> = vec![(root.clone(), false)];

    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.id()) {
            continue;
        }
        let inputs: Vec<Tensor> = t.op().inputs().into_iter().cloned().collect();
        stack.push((t, true));
        for input in inputs.into_iter().rev() {
            if !visited.contains(&input.id()) {
                stack.push((input, false));
            }
        }
    }
    order
}

/// Compute gradients of `root` with respect to all tensors in the graph.
///
/// `root` must hold a single element.
pub fn backward(root: &Tensor) -> Result<GradStore> {
    if root.elem_count() != 1 {
        return Err(Error::msg(format!(
            "backward() requires a single-element tensor, got shape {}; \
             reduce with sum_all() or mean_all() first",
            root.shape()
        )));
    }
    no_grad(|| backward_inner(root))
}

fn backward_inner(root: &Tensor) -> Result<GradStore> {
    let topo = build_topo(root);

    let mut grads = GradStore::new();
    grads.insert(root.id(), Tensor::ones(root.shape().clone())?);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                compute_unary_grad(*op, &grad_output, tensor, input, &mut grads)?;
            }

            Op::Reduce { input, op, dim, .. } => {
                // keep_dim only changes the gradient's shape, not its layout.
                compute_reduce_grad(*op, &grad_output, input, *dim, &mut grads)?;
            }

            Op::Matmul { lhs, rhs } => {
                let grad_lhs = grad_output.matmul(&rhs.t()?)?;
                let grad_rhs = lhs.t()?.matmul(&grad_output)?;
                grads.accumulate(lhs.id(), grad_lhs)?;
                grads.accumulate(rhs.id(), grad_rhs)?;
            }

            Op::Transpose { input } => {
                grads.accumulate(input.id(), grad_output.t()?)?;
            }

            Op::Reshape { input, src_shape } => {
                let grad = grad_output.reshape(src_shape.clone())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                compute_narrow_grad(&grad_output, input, *dim, *start, *len, &mut grads)?;
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), grad_output.affine(*mul, 0.0)?)?;
            }

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0usize;
                for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                    let grad_slice = grad_output.narrow(*dim, offset, sz)?;
                    grads.accumulate(inp.id(), grad_slice)?;
                    offset += sz;
                }
            }

            Op::Powf { input, exponent } => {
                // d(x^n)/dx = n * x^(n-1); for n < 1 this is unbounded at 0,
                // where the subgradient 0 is used instead
                let n = *exponent;
                let local: Vec<f64> = input
                    .to_f64_vec()?
                    .iter()
                    .map(|&v| if v == 0.0 && n < 1.0 { 0.0 } else { n * v.powf(n - 1.0) })
                    .collect();
                let local = Tensor::from_vec(local, input.shape().clone())?;
                let grad = grad_output.mul(&local)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Clamp { input, min, max } => {
                let x = input.to_f64_vec()?;
                let mask: Vec<f64> = x
                    .iter()
                    .map(|&v| if v >= *min && v <= *max { 1.0 } else { 0.0 })
                    .collect();
                let mask = Tensor::from_vec(mask, input.shape().clone())?;
                grads.accumulate(input.id(), grad_output.mul(&mask)?)?;
            }
        }
    }

    Ok(grads)
}

// Gradient rules for binary operations

fn compute_binary_grad(
    op: BinaryOp,
    grad_output: &Tensor,
    lhs: &Tensor,
    rhs: &Tensor,
    grads: &mut GradStore,
) -> Result<()> {
    let (raw_lhs, raw_rhs) = match op {
        BinaryOp::Add => (grad_output.clone(), grad_output.clone()),
        BinaryOp::Sub => (grad_output.clone(), grad_output.neg()?),
        BinaryOp::Mul => (grad_output.mul(rhs)?, grad_output.mul(lhs)?),
        BinaryOp::Div => {
            let b_sq = rhs.square()?;
            (
                grad_output.div(rhs)?,
                grad_output.neg()?.mul(lhs)?.div(&b_sq)?,
            )
        }
    };
    grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
    grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
    Ok(())
}

/// Sum a gradient over the dimensions that broadcasting expanded.
///
/// If lhs was [1, 4] broadcast to [3, 4], grad_output is [3, 4] and grad_lhs
/// must be [1, 4]: sum over dim 0. A [4] operand additionally drops the
/// leading dimension.
fn reduce_broadcast_grad(grad: &Tensor, target_shape: &Shape) -> Result<Tensor> {
    let grad_dims = grad.dims().to_vec();
    let target_dims = target_shape.dims();
    if grad_dims == target_dims {
        return Ok(grad.clone());
    }

    let grad_rank = grad_dims.len();
    let offset = grad_rank - target_dims.len();
    let mut padded_target = vec![1usize; grad_rank];
    padded_target[offset..].copy_from_slice(target_dims);

    let mut result = grad.clone();
    for d in (0..grad_rank).rev() {
        if padded_target[d] == 1 && grad_dims[d] > 1 {
            result = result.sum(d, true)?;
        }
    }
    result.reshape(target_shape.clone())
}

// Gradient rules for unary operations

fn compute_unary_grad(
    op: UnaryOp,
    grad_output: &Tensor,
    output: &Tensor,
    input: &Tensor,
    grads: &mut GradStore,
) -> Result<()> {
    let x = input.to_f64_vec()?;
    let y = output.to_f64_vec()?;
    let local: Vec<f64> = match op {
        UnaryOp::Neg => vec![-1.0; x.len()],
        UnaryOp::Abs => x
            .iter()
            .map(|&v| {
                if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            })
            .collect(),
        UnaryOp::Exp => y.clone(),
        UnaryOp::Log => x.iter().map(|&v| 1.0 / v).collect(),
        // d√x/dx = 1 / (2√x)
        UnaryOp::Sqrt => y.iter().map(|&s| 0.5 / s).collect(),
        UnaryOp::Square => x.iter().map(|&v| 2.0 * v).collect(),
        UnaryOp::Relu => x
            .iter()
            .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
            .collect(),
        UnaryOp::Sigmoid => y.iter().map(|&s| s * (1.0 - s)).collect(),
        UnaryOp::Tanh => y.iter().map(|&t| 1.0 - t * t).collect(),
        UnaryOp::Sin => x.iter().map(|&v| v.cos()).collect(),
        UnaryOp::Cos => x.iter().map(|&v| -v.sin()).collect(),
    };
    let local = Tensor::from_vec(local, input.shape().clone())?;
    grads.accumulate(input.id(), grad_output.mul(&local)?)
}

// Gradient rules for reductions

fn compute_reduce_grad(
    op: ReduceOp,
    grad_output: &Tensor,
    input: &Tensor,
    dim: Option<usize>,
    grads: &mut GradStore,
) -> Result<()> {
    let x = input.to_f64_vec()?;
    let g = grad_output.to_f64_vec()?;

    let grad: Vec<f64> = match dim {
        None => {
            let g0 = g[0];
            match op {
                ReduceOp::Sum => vec![g0; x.len()],
                ReduceOp::Mean => vec![g0 / x.len() as f64; x.len()],
                ReduceOp::Max => {
                    let mut out = vec![0.0; x.len()];
                    if let Some(arg) = first_argmax(x.iter().copied()) {
                        out[arg] = g0;
                    }
                    out
                }
            }
        }
        Some(d) => {
            let (outer, size, inner) = input.shape().split_at_dim(d)?;
            let mut out = vec![0.0; x.len()];
            for o in 0..outer {
                for i in 0..inner {
                    let gv = g[o * inner + i];
                    let at = |s: usize| (o * size + s) * inner + i;
                    match op {
                        ReduceOp::Sum => (0..size).for_each(|s| out[at(s)] = gv),
                        ReduceOp::Mean => (0..size).for_each(|s| out[at(s)] = gv / size as f64),
                        ReduceOp::Max => {
                            if let Some(arg) = first_argmax((0..size).map(|s| x[at(s)])) {
                                out[at(arg)] = gv;
                            }
                        }
                    }
                }
            }
            out
        }
    };
    grads.accumulate(input.id(), Tensor::from_vec(grad, input.shape().clone())?)
}

fn first_argmax(values: impl Iterator<Item = f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Scatter the gradient of a slice back into a zero tensor of the input's shape.
fn compute_narrow_grad(
    grad_output: &Tensor,
    input: &Tensor,
    dim: usize,
    start: usize,
    len: usize,
    grads: &mut GradStore,
) -> Result<()> {
    let (outer, size, inner) = input.shape().split_at_dim(dim)?;
    let g = grad_output.to_f64_vec()?;
    let mut out = vec![0.0; input.elem_count()];
    for o in 0..outer {
        let src = o * len * inner;
        let dst = (o * size + start) * inner;
        out[dst..dst + len * inner].copy_from_slice(&g[src..src + len * inner]);
    }
    grads.accumulate(input.id(), Tensor::from_vec(out, input.shape().clone())?)
}
