// Variable — symbolic references into the data dictionary
//
// A Variable never holds a value. It is an immutable expression tree whose
// leaves are dictionary keys or constants; `resolve` walks the tree against
// a DataDict and builds the corresponding tensor ops, so the result is
// differentiable with respect to whatever produced the referenced entries.
//
//   let x = Variable::new("x")?;
//   let y = Variable::new("y")?;
//   let residual = (&x * 2.0) - &y;        // nothing computed yet
//   let bound = x.abs().le(1.0);           // a Relation, not a value
//
// Comparison methods (`eq`, `le`, `ge`, `lt`, `gt`) return a Relation,
// which compiles into a constraint. Everything else stays a Variable and
// compiles into an objective.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use tether_core::{DataDict, Error, Result, Tensor};

use crate::constraint::{Constraint, Objective};

/// Element-wise functions available on expressions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryFn {
    Neg,
    Abs,
    Relu,
    Exp,
    Log,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Powf(f64),
}

impl UnaryFn {
    fn apply(self, t: &Tensor) -> Result<Tensor> {
        match self {
            UnaryFn::Neg => t.neg(),
            UnaryFn::Abs => t.abs(),
            UnaryFn::Relu => t.relu(),
            UnaryFn::Exp => t.exp(),
            UnaryFn::Log => t.log(),
            UnaryFn::Sqrt => t.sqrt(),
            UnaryFn::Square => t.square(),
            UnaryFn::Sin => t.sin(),
            UnaryFn::Cos => t.cos(),
            UnaryFn::Tanh => t.tanh(),
            UnaryFn::Sigmoid => t.sigmoid(),
            UnaryFn::Powf(p) => t.powf(p),
        }
    }

    fn name(self) -> &'static str {
        match self {
            UnaryFn::Neg => "neg",
            UnaryFn::Abs => "abs",
            UnaryFn::Relu => "relu",
            UnaryFn::Exp => "exp",
            UnaryFn::Log => "log",
            UnaryFn::Sqrt => "sqrt",
            UnaryFn::Square => "square",
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Tanh => "tanh",
            UnaryFn::Sigmoid => "sigmoid",
            UnaryFn::Powf(_) => "pow",
        }
    }
}

/// Arithmetic between two expressions (broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryFn {
    fn symbol(self) -> &'static str {
        match self {
            BinaryFn::Add => "+",
            BinaryFn::Sub => "-",
            BinaryFn::Mul => "*",
            BinaryFn::Div => "/",
        }
    }
}

/// Reductions over all elements or along one dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReduceFn {
    Sum,
    Mean,
    /// p-norm: (Σ|x|^p)^(1/p)
    Norm(f64),
}

#[derive(Debug)]
enum Expr {
    Key(String),
    Constant(f64),
    Unary {
        op: UnaryFn,
        arg: Variable,
    },
    Binary {
        op: BinaryFn,
        lhs: Variable,
        rhs: Variable,
    },
    Reduce {
        op: ReduceFn,
        arg: Variable,
        dim: Option<usize>,
    },
    Narrow {
        arg: Variable,
        dim: usize,
        start: usize,
        len: usize,
        squeeze: bool,
    },
}

/// A lazily evaluated expression over named dictionary entries.
///
/// Cloning is cheap; sub-expressions are shared.
#[derive(Clone, Debug)]
pub struct Variable {
    expr: Arc<Expr>,
}

impl Variable {
    /// A reference to the dictionary entry `name`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::msg("variable name must not be empty"));
        }
        Ok(Self::from_expr(Expr::Key(name)))
    }

    /// A constant scalar, broadcast against whatever it is combined with.
    pub fn constant(value: f64) -> Self {
        Self::from_expr(Expr::Constant(value))
    }

    fn from_expr(expr: Expr) -> Self {
        Variable {
            expr: Arc::new(expr),
        }
    }

    /// The key name when this is a plain reference.
    pub fn key(&self) -> Option<&str> {
        match &*self.expr {
            Expr::Key(name) => Some(name),
            _ => None,
        }
    }

    /// Every dictionary key this expression reads, in first-use order.
    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys(&self, out: &mut Vec<String>) {
        match &*self.expr {
            Expr::Key(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Constant(_) => {}
            Expr::Unary { arg, .. } | Expr::Reduce { arg, .. } | Expr::Narrow { arg, .. } => {
                arg.collect_keys(out)
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_keys(out);
                rhs.collect_keys(out);
            }
        }
    }

    // Element-wise functions

    fn unary(&self, op: UnaryFn) -> Self {
        Self::from_expr(Expr::Unary {
            op,
            arg: self.clone(),
        })
    }

    pub fn abs(&self) -> Self {
        self.unary(UnaryFn::Abs)
    }

    pub fn relu(&self) -> Self {
        self.unary(UnaryFn::Relu)
    }

    pub fn exp(&self) -> Self {
        self.unary(UnaryFn::Exp)
    }

    pub fn log(&self) -> Self {
        self.unary(UnaryFn::Log)
    }

    pub fn sqrt(&self) -> Self {
        self.unary(UnaryFn::Sqrt)
    }

    pub fn square(&self) -> Self {
        self.unary(UnaryFn::Square)
    }

    pub fn sin(&self) -> Self {
        self.unary(UnaryFn::Sin)
    }

    pub fn cos(&self) -> Self {
        self.unary(UnaryFn::Cos)
    }

    pub fn tanh(&self) -> Self {
        self.unary(UnaryFn::Tanh)
    }

    pub fn sigmoid(&self) -> Self {
        self.unary(UnaryFn::Sigmoid)
    }

    pub fn powf(&self, exponent: f64) -> Self {
        self.unary(UnaryFn::Powf(exponent))
    }

    // Reductions

    fn reduce(&self, op: ReduceFn, dim: Option<usize>) -> Self {
        Self::from_expr(Expr::Reduce {
            op,
            arg: self.clone(),
            dim,
        })
    }

    /// Sum of all elements.
    pub fn sum(&self) -> Self {
        self.reduce(ReduceFn::Sum, None)
    }

    /// Mean of all elements.
    pub fn mean(&self) -> Self {
        self.reduce(ReduceFn::Mean, None)
    }

    /// p-norm over all elements.
    pub fn norm(&self, p: f64) -> Self {
        self.reduce(ReduceFn::Norm(p), None)
    }

    pub fn sum_dim(&self, dim: usize) -> Self {
        self.reduce(ReduceFn::Sum, Some(dim))
    }

    pub fn mean_dim(&self, dim: usize) -> Self {
        self.reduce(ReduceFn::Mean, Some(dim))
    }

    /// p-norm along `dim`.
    pub fn norm_dim(&self, p: f64, dim: usize) -> Self {
        self.reduce(ReduceFn::Norm(p), Some(dim))
    }

    // Slicing

    /// Entries `start..start + len` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Self {
        Self::from_expr(Expr::Narrow {
            arg: self.clone(),
            dim,
            start,
            len,
            squeeze: false,
        })
    }

    /// Entry `index` along `dim`, dropping that dimension.
    pub fn select(&self, dim: usize, index: usize) -> Self {
        Self::from_expr(Expr::Narrow {
            arg: self.clone(),
            dim,
            start: index,
            len: 1,
            squeeze: true,
        })
    }

    // Relations

    fn relation(&self, kind: Comparison, rhs: impl Into<Variable>) -> Relation {
        Relation {
            kind,
            lhs: self.clone(),
            rhs: rhs.into(),
        }
    }

    /// `self == rhs`, penalized by |self − rhs|.
    #[allow(clippy::should_implement_trait)]
    pub fn eq(&self, rhs: impl Into<Variable>) -> Relation {
        self.relation(Comparison::Eq, rhs)
    }

    /// `self <= rhs`, penalized by max(0, self − rhs).
    #[allow(clippy::should_implement_trait)]
    pub fn le(&self, rhs: impl Into<Variable>) -> Relation {
        self.relation(Comparison::Le, rhs)
    }

    /// `self >= rhs`, penalized by max(0, rhs − self).
    #[allow(clippy::should_implement_trait)]
    pub fn ge(&self, rhs: impl Into<Variable>) -> Relation {
        self.relation(Comparison::Ge, rhs)
    }

    /// `self < rhs`; penalized like `le`.
    #[allow(clippy::should_implement_trait)]
    pub fn lt(&self, rhs: impl Into<Variable>) -> Relation {
        self.relation(Comparison::Lt, rhs)
    }

    /// `self > rhs`; penalized like `ge`.
    #[allow(clippy::should_implement_trait)]
    pub fn gt(&self, rhs: impl Into<Variable>) -> Relation {
        self.relation(Comparison::Gt, rhs)
    }

    /// Minimize this expression with the given weight.
    pub fn minimize(&self, weight: f64) -> Objective {
        Objective::new(self.clone()).weight(weight)
    }

    // Evaluation

    /// Evaluate against `dict`.
    ///
    /// Fails with `Error::Resolution` naming the whole expression and the
    /// absent key.
    pub fn resolve(&self, dict: &DataDict) -> Result<Tensor> {
        self.eval(dict, self)
    }

    fn eval(&self, dict: &DataDict, root: &dyn fmt::Display) -> Result<Tensor> {
        match &*self.expr {
            Expr::Key(name) => dict.get(name).cloned().ok_or_else(|| Error::Resolution {
                expr: root.to_string(),
                key: name.clone(),
            }),
            Expr::Constant(c) => Ok(Tensor::scalar(*c)),
            Expr::Unary { op, arg } => op.apply(&arg.eval(dict, root)?),
            Expr::Binary { op, lhs, rhs } => {
                let a = lhs.eval(dict, root)?;
                let b = rhs.eval(dict, root)?;
                match op {
                    BinaryFn::Add => a.add(&b),
                    BinaryFn::Sub => a.sub(&b),
                    BinaryFn::Mul => a.mul(&b),
                    BinaryFn::Div => a.div(&b),
                }
            }
            Expr::Reduce { op, arg, dim } => {
                let t = arg.eval(dict, root)?;
                match (op, dim) {
                    (ReduceFn::Sum, None) => t.sum_all(),
                    (ReduceFn::Sum, Some(d)) => t.sum(*d, false),
                    (ReduceFn::Mean, None) => t.mean_all(),
                    (ReduceFn::Mean, Some(d)) => t.mean(*d, false),
                    (ReduceFn::Norm(p), dim) => {
                        let powered = t.abs()?.powf(*p)?;
                        let summed = match dim {
                            None => powered.sum_all()?,
                            Some(d) => powered.sum(*d, false)?,
                        };
                        norm_root(&summed, *p)
                    }
                }
            }
            Expr::Narrow {
                arg,
                dim,
                start,
                len,
                squeeze,
            } => {
                let t = arg.eval(dict, root)?.narrow(*dim, *start, *len)?;
                if *squeeze {
                    t.squeeze(*dim)
                } else {
                    Ok(t)
                }
            }
        }
    }
}

/// `summed^(1/p)` with a zero subgradient where `summed` is 0.
///
/// Zero entries are shifted to 1 before the root and masked out after, so
/// the value stays 0 and no 0·∞ reaches the backward pass.
fn norm_root(summed: &Tensor, p: f64) -> Result<Tensor> {
    let zeros: Vec<f64> = summed
        .to_f64_vec()?
        .iter()
        .map(|&v| if v == 0.0 { 1.0 } else { 0.0 })
        .collect();
    if zeros.iter().all(|&z| z == 0.0) {
        return summed.powf(1.0 / p);
    }
    let mask = Tensor::from_vec(zeros, summed.shape().clone())?;
    summed
        .add(&mask)?
        .powf(1.0 / p)?
        .mul(&mask.affine(-1.0, 1.0)?)
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.expr {
            Expr::Key(name) => write!(f, "{name}"),
            Expr::Constant(c) => write!(f, "{c}"),
            Expr::Unary {
                op: UnaryFn::Neg,
                arg,
            } => write!(f, "-{arg}"),
            Expr::Unary {
                op: UnaryFn::Powf(p),
                arg,
            } => write!(f, "{arg}^{p}"),
            Expr::Unary { op, arg } => write!(f, "{}({arg})", op.name()),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Reduce { op, arg, dim } => {
                let name = match op {
                    ReduceFn::Sum => "sum".to_string(),
                    ReduceFn::Mean => "mean".to_string(),
                    ReduceFn::Norm(p) => format!("norm{p}"),
                };
                match dim {
                    None => write!(f, "{name}({arg})"),
                    Some(d) => write!(f, "{name}({arg}, dim={d})"),
                }
            }
            Expr::Narrow {
                arg,
                dim,
                start,
                len,
                squeeze,
            } => {
                if *squeeze {
                    write!(f, "{arg}[dim {dim}: {start}]")
                } else {
                    write!(f, "{arg}[dim {dim}: {start}..{}]", start + len)
                }
            }
        }
    }
}

impl From<f64> for Variable {
    fn from(value: f64) -> Self {
        Variable::constant(value)
    }
}

impl From<&Variable> for Variable {
    fn from(v: &Variable) -> Self {
        v.clone()
    }
}

// Operator overloading

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Variable>> $trait<R> for Variable {
            type Output = Variable;
            fn $method(self, rhs: R) -> Variable {
                Variable::from_expr(Expr::Binary {
                    op: $op,
                    lhs: self,
                    rhs: rhs.into(),
                })
            }
        }

        impl<R: Into<Variable>> $trait<R> for &Variable {
            type Output = Variable;
            fn $method(self, rhs: R) -> Variable {
                Variable::from_expr(Expr::Binary {
                    op: $op,
                    lhs: self.clone(),
                    rhs: rhs.into(),
                })
            }
        }

        impl $trait<Variable> for f64 {
            type Output = Variable;
            fn $method(self, rhs: Variable) -> Variable {
                Variable::constant(self).$method(rhs)
            }
        }

        impl $trait<&Variable> for f64 {
            type Output = Variable;
            fn $method(self, rhs: &Variable) -> Variable {
                Variable::constant(self).$method(rhs.clone())
            }
        }
    };
}

binary_operator!(Add, add, BinaryFn::Add);
binary_operator!(Sub, sub, BinaryFn::Sub);
binary_operator!(Mul, mul, BinaryFn::Mul);
binary_operator!(Div, div, BinaryFn::Div);

impl Neg for Variable {
    type Output = Variable;
    fn neg(self) -> Variable {
        self.unary(UnaryFn::Neg)
    }
}

impl Neg for &Variable {
    type Output = Variable;
    fn neg(self) -> Variable {
        self.unary(UnaryFn::Neg)
    }
}

/// The comparison a Relation expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Le,
    Ge,
    Lt,
    Gt,
}

impl Comparison {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::Le => "<=",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Gt => ">",
        }
    }
}

/// A comparison between two expressions; compiles into a constraint.
#[derive(Clone, Debug)]
pub struct Relation {
    kind: Comparison,
    lhs: Variable,
    rhs: Variable,
}

impl Relation {
    pub fn kind(&self) -> Comparison {
        self.kind
    }

    pub fn lhs(&self) -> &Variable {
        &self.lhs
    }

    pub fn rhs(&self) -> &Variable {
        &self.rhs
    }

    /// The un-reduced violation tensor: zero wherever the relation holds.
    ///
    /// Equalities use |lhs − rhs|; `<=`/`<` use max(0, lhs − rhs) and
    /// `>=`/`>` use max(0, rhs − lhs). Strict comparisons are penalized the
    /// same way as their non-strict forms.
    pub fn violation(&self, dict: &DataDict) -> Result<Tensor> {
        let lhs = self.lhs.eval(dict, self)?;
        let rhs = self.rhs.eval(dict, self)?;
        match self.kind {
            Comparison::Eq => lhs.sub(&rhs)?.abs(),
            Comparison::Le | Comparison::Lt => lhs.sub(&rhs)?.relu(),
            Comparison::Ge | Comparison::Gt => rhs.sub(&lhs)?.relu(),
        }
    }

    /// Every dictionary key either side reads.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.lhs.keys();
        for k in self.rhs.keys() {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }

    /// Compile with the given weight.
    pub fn weight(self, weight: f64) -> Constraint {
        Constraint::new(self).weight(weight)
    }

    /// Compile with the given norm degree.
    pub fn norm(self, p: f64) -> Constraint {
        Constraint::new(self).norm(p)
    }

    /// Compile under an explicit term name.
    pub fn named(self, name: impl Into<String>) -> Constraint {
        Constraint::new(self).named(name)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.kind.symbol(), self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_rejected() {
        assert!(Variable::new("").is_err());
        assert!(Variable::new("  ").is_err());
    }

    #[test]
    fn test_display() {
        let x = Variable::new("x").unwrap();
        let y = Variable::new("y").unwrap();
        assert_eq!((&x * 2.0 - &y).to_string(), "((x * 2) - y)");
        assert_eq!(x.abs().le(1.0).to_string(), "abs(x) <= 1");
        assert_eq!(x.select(1, 0).mean().to_string(), "mean(x[dim 1: 0])");
    }

    #[test]
    fn test_keys_deduplicated() {
        let x = Variable::new("x").unwrap();
        let y = Variable::new("y").unwrap();
        let e = (&x + &y) * &x;
        assert_eq!(e.keys(), vec!["x".to_string(), "y".to_string()]);
    }
}
