use std::sync::{Arc, RwLock, RwLockReadGuard};

use rand::Rng;

use crate::backprop::{self, GradStore};
use crate::error::{Error, Result};
use crate::op::{BinaryOp, Op, ReduceOp, TensorId, UnaryOp};
use crate::shape::Shape;

// Tensor — The value type that flows through every node
//
// A Tensor is an n-dimensional array of f64 values that optionally records
// the operation that created it, so a scalar loss built from many tensors can
// be differentiated with respect to the parameters that fed it.
//
// MEMORY MODEL:
//
//   Tensor is a handle around Arc<TensorInner>. Cloning is O(1). The element
//   buffer lives behind Arc<RwLock<Vec<f64>>> so that:
//     - reshape/squeeze/unsqueeze share storage with their input
//     - a block and the optimizer can hold clones of the same parameter, and
//       an in-place update by the optimizer is seen by the block
//
//   Storage is always contiguous row-major; the Shape determines strides.
//
// GRAPH RECORDING:
//
//   Every op stores an Op with its inputs unless recording is switched off
//   with `no_grad`, in which case results are leaves.

struct TensorInner {
    /// Unique identifier (used as the GradStore key).
    id: TensorId,
    /// Row-major element buffer.
    storage: Arc<RwLock<Vec<f64>>>,
    shape: Shape,
    /// The operation that created this tensor. Op::None for leaves.
    op: Op,
    /// Whether this tensor is a trainable parameter.
    is_variable: bool,
}

/// An n-dimensional array of `f64` values with reverse-mode autograd.
///
/// # Example
/// ```
/// use tether_core::Tensor;
///
/// let a = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
/// let b = Tensor::ones((2, 2)).unwrap();
/// let c = a.add(&b).unwrap();
/// assert_eq!(c.to_f64_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
/// ```
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, op={:?}, variable={})",
            self.inner.id, self.inner.shape, self.inner.op, self.inner.is_variable,
        )
    }
}

impl Tensor {
    // Internal constructors

    /// Create a tensor that owns `data`, recording `op` when grad is enabled.
    pub(crate) fn from_vec_op(data: Vec<f64>, shape: Shape, op: Op) -> Self {
        let op = if backprop::is_grad_enabled() {
            op
        } else {
            Op::None
        };
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(data)),
                shape,
                op,
                is_variable: false,
            }),
        }
    }

    /// Create a tensor sharing this tensor's storage under a new shape.
    fn view_with_shape(&self, shape: Shape, op: Op) -> Self {
        let op = if backprop::is_grad_enabled() {
            op
        } else {
            Op::None
        };
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                shape,
                op,
                is_variable: false,
            }),
        }
    }

    fn with_variable_flag(&self, is_variable: bool, op: Op) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                shape: self.inner.shape.clone(),
                op,
                is_variable,
            }),
        }
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    /// The dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    /// Whether this tensor is a trainable parameter.
    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op {
        &self.inner.op
    }

    /// Whether two handles point at the same element buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, Vec<f64>>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // In-place mutation

    /// Overwrite the element buffer in place.
    ///
    /// Every handle sharing this storage (a clone held by a block, a reshaped
    /// view) observes the new values. This is how optimizer updates and
    /// checkpoint restores reach the parameters owned by blocks.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::msg(format!(
                "update_data_inplace: expected {} elements, got {}",
                expected,
                new_data.len()
            )));
        }
        let mut guard = self
            .inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))?;
        guard.copy_from_slice(new_data);
        Ok(())
    }

    // Creation methods

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Result<Self> {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>) -> Result<Self> {
        Self::full(shape, 1.0)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: impl Into<Shape>, val: f64) -> Result<Self> {
        let shape = shape.into();
        let data = vec![val; shape.elem_count()];
        Ok(Self::from_vec_op(data, shape, Op::None))
    }

    /// Create a rank-0 tensor holding one value.
    pub fn scalar(val: f64) -> Self {
        Self::from_vec_op(vec![val], Shape::from(()), Op::None)
    }

    /// Create a tensor from a flat slice in row-major order.
    pub fn from_slice(data: &[f64], shape: impl Into<Shape>) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Create a tensor taking ownership of a flat row-major buffer.
    pub fn from_vec(data: Vec<f64>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_vec_op(data, shape, Op::None))
    }

    /// Uniform values in [0, 1) from the thread-local generator.
    pub fn rand(shape: impl Into<Shape>) -> Result<Self> {
        Self::rand_with(shape, &mut rand::thread_rng())
    }

    /// Uniform values in [0, 1) from the given generator.
    pub fn rand_with<R: Rng + ?Sized>(shape: impl Into<Shape>, rng: &mut R) -> Result<Self> {
        let shape = shape.into();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(Self::from_vec_op(data, shape, Op::None))
    }

    /// Standard normal values from the thread-local generator.
    pub fn randn(shape: impl Into<Shape>) -> Result<Self> {
        Self::randn_with(shape, &mut rand::thread_rng())
    }

    /// Standard normal values (Box-Muller) from the given generator.
    pub fn randn_with<R: Rng + ?Sized>(shape: impl Into<Shape>, rng: &mut R) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = rng.gen();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            data.push(r * theta.cos());
            if data.len() < n {
                data.push(r * theta.sin());
            }
        }
        Ok(Self::from_vec_op(data, shape, Op::None))
    }

    /// Zeros with the same shape as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone())
    }

    /// Ones with the same shape as `other`.
    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone())
    }

    /// A constant with the same shape as `other`.
    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape().clone(), val)
    }

    /// Mark this tensor as a trainable parameter.
    ///
    /// Parameters are leaves: any recorded history is dropped. The id and
    /// storage are kept, so existing clones still alias it.
    pub fn set_variable(self) -> Self {
        self.with_variable_flag(true, Op::None)
    }

    /// Same data and id, but no longer trainable.
    pub fn freeze(&self) -> Self {
        self.with_variable_flag(false, self.inner.op.clone())
    }

    /// Same data, fresh id, no recorded op: a constant for autograd.
    pub fn detach(&self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                shape: self.inner.shape.clone(),
                op: Op::None,
                is_variable: false,
            }),
        }
    }

    /// Deep copy of the current values into a fresh leaf tensor.
    pub fn copy(&self) -> Result<Self> {
        Self::from_vec(self.to_f64_vec()?, self.shape().clone())
    }

    // Shape manipulation

    /// Reshape to a new shape with the same element count (shares storage).
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if new_shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_shape(new_shape, op))
    }

    /// Insert a size-1 dimension at `dim`.
    ///
    /// unsqueeze(1) on [3, 4] → [3, 1, 4]
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut dims = self.dims().to_vec();
        dims.insert(dim, 1);
        self.reshape(dims)
    }

    /// Remove a size-1 dimension.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let size = self.shape().dim(dim)?;
        if size != 1 {
            return Err(Error::msg(format!(
                "squeeze: dimension {} has size {}, expected 1",
                dim, size
            )));
        }
        let mut dims = self.dims().to_vec();
        dims.remove(dim);
        self.reshape(dims)
    }

    /// Slice `len` entries along `dim` starting at `start`.
    ///
    /// narrow(1, 2, 3) on [4, 10] → [4, 3] holding columns 2..5.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let (outer, size, inner) = self.shape().split_at_dim(dim)?;
        if start + len > size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size: size,
            });
        }
        let data = self.read_storage()?;
        let mut out = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * size + start) * inner;
            out.extend_from_slice(&data[base..base + len * inner]);
        }
        drop(data);
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(Self::from_vec_op(out, Shape::new(dims), op))
    }

    /// Pick one index along `dim`, dropping that dimension.
    ///
    /// select(1, 0) on [32, 10, 4] → [32, 4]
    pub fn select(&self, dim: usize, index: usize) -> Result<Self> {
        self.narrow(dim, index, 1)?.squeeze(dim)
    }

    /// Transpose a 2-D tensor.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let (rows, cols) = (self.dims()[0], self.dims()[1]);
        let data = self.read_storage()?;
        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = data[r * cols + c];
            }
        }
        drop(data);
        let op = Op::Transpose {
            input: self.clone(),
        };
        Ok(Self::from_vec_op(out, Shape::from((cols, rows)), op))
    }

    /// Concatenate tensors along a dimension.
    ///
    /// All tensors must have the same shape except in the concatenation dimension.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cat: empty tensor list"))?;
        if tensors.len() == 1 {
            return Ok(first.clone());
        }
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        for (i, t) in tensors.iter().enumerate().skip(1) {
            if t.rank() != rank {
                return Err(Error::msg(format!(
                    "cat: tensor {} has rank {} but expected {}",
                    i,
                    t.rank(),
                    rank
                )));
            }
            for d in 0..rank {
                if d != dim && t.dims()[d] != first.dims()[d] {
                    return Err(Error::msg(format!(
                        "cat: tensor {} has size {} at dim {} but expected {}",
                        i,
                        t.dims()[d],
                        d,
                        first.dims()[d]
                    )));
                }
            }
        }

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();
        let (outer, _, inner) = first.shape().split_at_dim(dim)?;
        let total: usize = sizes.iter().sum();

        let guards = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for (guard, &size) in guards.iter().zip(sizes.iter()) {
                let chunk = size * inner;
                out.extend_from_slice(&guard[o * chunk..(o + 1) * chunk]);
            }
        }
        drop(guards);

        let mut dims = first.dims().to_vec();
        dims[dim] = total;
        let op = Op::Cat {
            inputs: tensors.to_vec(),
            dim,
            sizes,
        };
        Ok(Self::from_vec_op(out, Shape::new(dims), op))
    }

    /// Stack equally-shaped tensors along a new dimension.
    ///
    /// stack([a, b], 1) where a, b are [32, 4] → [32, 2, 4].
    pub fn stack(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("stack: empty tensor list"))?;
        for t in tensors.iter().skip(1) {
            if t.shape() != first.shape() {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }
        let unsqueezed = tensors
            .iter()
            .map(|t| t.unsqueeze(dim))
            .collect::<Result<Vec<_>>>()?;
        Self::cat(&unsqueezed, dim)
    }

    /// Gather entries along `dim` at the given positions.
    ///
    /// Used for batching and shuffling data; the result is a leaf, gradients
    /// do not flow through it.
    pub fn index_select(&self, dim: usize, indices: &[usize]) -> Result<Self> {
        let (outer, size, inner) = self.shape().split_at_dim(dim)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            return Err(Error::msg(format!(
                "index_select: index {} out of range for dim {} of size {}",
                bad, dim, size
            )));
        }
        let data = self.read_storage()?;
        let mut out = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            for &i in indices {
                let base = (o * size + i) * inner;
                out.extend_from_slice(&data[base..base + inner]);
            }
        }
        drop(data);
        let mut dims = self.dims().to_vec();
        dims[dim] = indices.len();
        Ok(Self::from_vec_op(out, Shape::new(dims), Op::None))
    }

    // Arithmetic operations

    /// Element-wise addition with broadcasting.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division with broadcasting.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    /// Add a constant to every element.
    pub fn add_scalar(&self, val: f64) -> Result<Self> {
        self.affine(1.0, val)
    }

    /// Multiply every element by a constant.
    pub fn mul_scalar(&self, val: f64) -> Result<Self> {
        self.affine(val, 0.0)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_data = self.read_storage()?;
        let rhs_data = rhs.read_storage()?;

        let out: Vec<f64> = if self.shape() == rhs.shape() {
            lhs_data
                .iter()
                .zip(rhs_data.iter())
                .map(|(&a, &b)| op.apply(a, b))
                .collect()
        } else {
            let ls = self.shape().broadcast_strides(&out_shape);
            let rs = rhs.shape().broadcast_strides(&out_shape);
            let dims = out_shape.dims();
            let n = out_shape.elem_count();
            let mut idx = vec![0usize; dims.len()];
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                let li: usize = idx.iter().zip(&ls).map(|(i, s)| i * s).sum();
                let ri: usize = idx.iter().zip(&rs).map(|(i, s)| i * s).sum();
                out.push(op.apply(lhs_data[li], rhs_data[ri]));
                for d in (0..dims.len()).rev() {
                    idx[d] += 1;
                    if idx[d] < dims[d] {
                        break;
                    }
                    idx[d] = 0;
                }
            }
            out
        };
        drop(lhs_data);
        drop(rhs_data);

        let result_op = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(Self::from_vec_op(out, out_shape, result_op))
    }

    // Unary operations

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    /// Element-wise absolute value.
    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    /// Element-wise e^x.
    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    /// Element-wise x².
    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    /// max(0, x).
    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    /// 1 / (1 + e^(-x)).
    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    /// Element-wise tanh.
    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    /// Element-wise sine.
    pub fn sin(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sin)
    }

    /// Element-wise cosine.
    pub fn cos(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Cos)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let data = self.read_storage()?;
        let out: Vec<f64> = data.iter().map(|&x| op.apply(x)).collect();
        drop(data);
        let result_op = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(Self::from_vec_op(out, self.shape().clone(), result_op))
    }

    /// Element-wise power: self^exponent.
    pub fn powf(&self, exponent: f64) -> Result<Self> {
        let data = self.read_storage()?;
        let out: Vec<f64> = data.iter().map(|&x| x.powf(exponent)).collect();
        drop(data);
        let op = Op::Powf {
            input: self.clone(),
            exponent,
        };
        Ok(Self::from_vec_op(out, self.shape().clone(), op))
    }

    /// Element-wise clamp to [min, max].
    pub fn clamp(&self, min: f64, max: f64) -> Result<Self> {
        if min > max {
            return Err(Error::msg(format!("clamp: min {min} exceeds max {max}")));
        }
        let data = self.read_storage()?;
        let out: Vec<f64> = data.iter().map(|&x| x.clamp(min, max)).collect();
        drop(data);
        let op = Op::Clamp {
            input: self.clone(),
            min,
            max,
        };
        Ok(Self::from_vec_op(out, self.shape().clone(), op))
    }

    /// result = self * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let data = self.read_storage()?;
        let out: Vec<f64> = data.iter().map(|&x| x * mul + add).collect();
        drop(data);
        let op = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(Self::from_vec_op(out, self.shape().clone(), op))
    }

    // Reductions

    /// Sum of all elements as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, None, false)
    }

    /// Mean of all elements as a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, None, false)
    }

    /// Largest element as a scalar tensor.
    pub fn max_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, None, false)
    }

    /// Sum along `dim`.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, Some(dim), keep_dim)
    }

    /// Mean along `dim`.
    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, Some(dim), keep_dim)
    }

    /// Max along `dim`.
    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, Some(dim), keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dim: Option<usize>, keep_dim: bool) -> Result<Self> {
        let data = self.read_storage()?;
        let (out, shape) = match dim {
            None => {
                let value = match op {
                    ReduceOp::Sum => data.iter().sum(),
                    ReduceOp::Mean => data.iter().sum::<f64>() / data.len() as f64,
                    ReduceOp::Max => data.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                let shape = if keep_dim {
                    Shape::new(vec![1; self.rank()])
                } else {
                    Shape::from(())
                };
                (vec![value], shape)
            }
            Some(d) => {
                let (outer, size, inner) = self.shape().split_at_dim(d)?;
                let mut out = vec![0.0; outer * inner];
                for o in 0..outer {
                    for i in 0..inner {
                        let mut acc = match op {
                            ReduceOp::Max => f64::NEG_INFINITY,
                            _ => 0.0,
                        };
                        for s in 0..size {
                            let v = data[(o * size + s) * inner + i];
                            acc = match op {
                                ReduceOp::Max => acc.max(v),
                                _ => acc + v,
                            };
                        }
                        if op == ReduceOp::Mean {
                            acc /= size as f64;
                        }
                        out[o * inner + i] = acc;
                    }
                }
                let mut dims = self.dims().to_vec();
                if keep_dim {
                    dims[d] = 1;
                } else {
                    dims.remove(d);
                }
                (out, Shape::new(dims))
            }
        };
        drop(data);
        let result_op = Op::Reduce {
            input: self.clone(),
            op,
            dim,
            keep_dim,
        };
        Ok(Self::from_vec_op(out, shape, result_op))
    }

    /// Matrix multiplication of 2-D tensors: [m, k] @ [k, n] → [m, n].
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() != 2 || rhs.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: if self.rank() != 2 {
                    self.rank()
                } else {
                    rhs.rank()
                },
            });
        }
        let (m, k1) = (self.dims()[0], self.dims()[1]);
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let a = self.read_storage()?;
        let b = rhs.read_storage()?;
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            let row = &mut out[i * n..(i + 1) * n];
            for p in 0..k1 {
                let aip = a[i * k1 + p];
                let brow = &b[p * n..(p + 1) * n];
                for (o, &bv) in row.iter_mut().zip(brow) {
                    *o += aip * bv;
                }
            }
        }
        drop(a);
        drop(b);
        let op = Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(Self::from_vec_op(out, Shape::from((m, n)), op))
    }

    // Data extraction

    /// Extract all elements as a flat row-major Vec<f64>.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.read_storage()?.clone())
    }

    /// Extract a scalar value (tensor must have exactly 1 element).
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.read_storage()?[0])
    }

    /// Whether every element is finite (no NaN or infinity).
    pub fn is_finite(&self) -> Result<bool> {
        Ok(self.read_storage()?.iter().all(|v| v.is_finite()))
    }

    // Autograd

    /// Compute gradients via reverse-mode automatic differentiation.
    ///
    /// This tensor must hold a single element.
    ///
    /// ```
    /// use tether_core::Tensor;
    ///
    /// let a = Tensor::from_slice(&[2.0], 1).unwrap().set_variable();
    /// let b = Tensor::from_slice(&[3.0], 1).unwrap().set_variable();
    /// let c = a.mul(&b).unwrap().sum_all().unwrap();
    /// let grads = c.backward().unwrap();
    /// assert_eq!(grads.get(&a).unwrap().to_f64_vec().unwrap(), vec![3.0]);
    /// ```
    pub fn backward(&self) -> Result<GradStore> {
        backprop::backward(self)
    }
}
