// Constraint / Objective — compiling expressions into weighted loss terms
//
// Two kinds of term feed the Problem:
//
//   Objective   — weight · mean(value^p) for a plain expression, or
//                 weight · metric(pred, target) for an mse/l1 objective
//   Constraint  — weight · mean(violation^p) for a Relation, where the
//                 violation is |lhs − rhs| for equalities and the positive
//                 part of the difference for inequalities
//
// Both evaluate against a DataDict into a scalar value tensor plus the
// un-reduced violation tensor, so the Problem can report a breakdown while
// the summed value stays differentiable.

use std::fmt;

use tether_core::{DataDict, Error, Result, Tensor};
use tether_nn::{l1_loss, mse_loss};

use crate::variable::{Relation, Variable};

/// Distance used by metric objectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Mean squared error.
    Mse,
    /// Mean absolute error.
    L1,
}

impl Metric {
    fn name(self) -> &'static str {
        match self {
            Metric::Mse => "mse",
            Metric::L1 => "l1",
        }
    }
}

/// Raise element-wise to `p`, using cheaper ops for the common degrees.
fn apply_norm(t: &Tensor, p: f64) -> Result<Tensor> {
    if p == 1.0 {
        Ok(t.clone())
    } else if p == 2.0 {
        t.square()
    } else {
        t.powf(p)
    }
}

fn check_weight(weight: f64, name: &str) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(Error::msg(format!(
            "term '{name}': weight must be finite and non-negative, got {weight}"
        )));
    }
    Ok(())
}

fn check_norm(p: f64, name: &str) -> Result<()> {
    if !p.is_finite() || p <= 0.0 {
        return Err(Error::msg(format!(
            "term '{name}': norm degree must be positive, got {p}"
        )));
    }
    Ok(())
}

/// The result of evaluating one term.
#[derive(Debug, Clone)]
pub struct TermValue {
    /// Weighted scalar contribution to the total loss.
    pub value: Tensor,
    /// Un-reduced violation (constraints) or residual (objectives).
    pub violation: Tensor,
}

// Constraint

/// A weighted penalty on a Relation.
#[derive(Debug, Clone)]
pub struct Constraint {
    relation: Relation,
    weight: f64,
    norm: f64,
    name: Option<String>,
}

impl Constraint {
    /// Weight 1, squared violations, named after the relation.
    pub fn new(relation: Relation) -> Self {
        Constraint {
            relation,
            weight: 1.0,
            norm: 2.0,
            name: None,
        }
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn norm(mut self, p: f64) -> Self {
        self.norm = p;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.relation.to_string())
    }

    pub fn base_weight(&self) -> f64 {
        self.weight
    }

    pub fn norm_degree(&self) -> f64 {
        self.norm
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// `weight · mean(violation^p)` with the supplied weight.
    pub fn evaluate_with_weight(&self, dict: &DataDict, weight: f64) -> Result<TermValue> {
        let violation = self.relation.violation(dict)?;
        let value = apply_norm(&violation, self.norm)?
            .mean_all()?
            .mul_scalar(weight)?;
        Ok(TermValue { value, violation })
    }
}

// Objective

#[derive(Debug, Clone)]
enum ObjectiveKind {
    Plain(Variable),
    Metric {
        metric: Metric,
        prediction: Variable,
        target: Variable,
    },
}

/// A weighted quantity to minimize.
#[derive(Debug, Clone)]
pub struct Objective {
    kind: ObjectiveKind,
    weight: f64,
    norm: f64,
    name: Option<String>,
}

impl Objective {
    /// Minimize `mean(expr)` with weight 1.
    pub fn new(expr: Variable) -> Self {
        Objective {
            kind: ObjectiveKind::Plain(expr),
            weight: 1.0,
            norm: 1.0,
            name: None,
        }
    }

    /// Minimize a distance between `prediction` and `target`.
    pub fn metric(metric: Metric, prediction: Variable, target: Variable) -> Self {
        Objective {
            kind: ObjectiveKind::Metric {
                metric,
                prediction,
                target,
            },
            weight: 1.0,
            norm: 1.0,
            name: None,
        }
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Norm degree applied to a plain expression before averaging.
    /// Metric objectives ignore it.
    pub fn norm(mut self, p: f64) -> Self {
        self.norm = p;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            ObjectiveKind::Plain(expr) => expr.to_string(),
            ObjectiveKind::Metric {
                metric,
                prediction,
                target,
            } => format!("{}({prediction}, {target})", metric.name()),
        }
    }

    pub fn base_weight(&self) -> f64 {
        self.weight
    }

    pub fn norm_degree(&self) -> f64 {
        self.norm
    }

    pub fn evaluate_with_weight(&self, dict: &DataDict, weight: f64) -> Result<TermValue> {
        match &self.kind {
            ObjectiveKind::Plain(expr) => {
                let residual = expr.resolve(dict)?;
                let value = apply_norm(&residual, self.norm)?
                    .mean_all()?
                    .mul_scalar(weight)?;
                Ok(TermValue {
                    value,
                    violation: residual,
                })
            }
            ObjectiveKind::Metric {
                metric,
                prediction,
                target,
            } => {
                let pred = prediction.resolve(dict)?;
                let tgt = target.resolve(dict)?;
                let loss = match metric {
                    Metric::Mse => mse_loss(&pred, &tgt)?,
                    Metric::L1 => l1_loss(&pred, &tgt)?,
                };
                Ok(TermValue {
                    value: loss.mul_scalar(weight)?,
                    violation: pred.sub(&tgt)?,
                })
            }
        }
    }
}

// Term

/// Whether a term is an objective or a constraint penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Objective,
    Constraint,
}

impl fmt::Display for TermKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermKind::Objective => write!(f, "objective"),
            TermKind::Constraint => write!(f, "constraint"),
        }
    }
}

/// A compiled loss term.
#[derive(Debug, Clone)]
pub enum Term {
    Objective(Objective),
    Constraint(Constraint),
}

impl Term {
    pub fn name(&self) -> String {
        match self {
            Term::Objective(o) => o.name(),
            Term::Constraint(c) => c.name(),
        }
    }

    pub fn kind(&self) -> TermKind {
        match self {
            Term::Objective(_) => TermKind::Objective,
            Term::Constraint(_) => TermKind::Constraint,
        }
    }

    /// The weight the term was declared with.
    pub fn weight(&self) -> f64 {
        match self {
            Term::Objective(o) => o.base_weight(),
            Term::Constraint(c) => c.base_weight(),
        }
    }

    /// Reject negative or non-finite weights and non-positive norms.
    pub fn validate(&self) -> Result<()> {
        let name = self.name();
        let (weight, norm) = match self {
            Term::Objective(o) => (o.base_weight(), o.norm_degree()),
            Term::Constraint(c) => (c.base_weight(), c.norm_degree()),
        };
        check_weight(weight, &name)?;
        check_norm(norm, &name)
    }

    /// Evaluate with the declared weight.
    pub fn evaluate(&self, dict: &DataDict) -> Result<TermValue> {
        self.evaluate_with_weight(dict, self.weight())
    }

    /// Evaluate with an overriding weight (penalty scheduling).
    pub fn evaluate_with_weight(&self, dict: &DataDict, weight: f64) -> Result<TermValue> {
        match self {
            Term::Objective(o) => o.evaluate_with_weight(dict, weight),
            Term::Constraint(c) => c.evaluate_with_weight(dict, weight),
        }
    }
}

impl From<Objective> for Term {
    fn from(o: Objective) -> Self {
        Term::Objective(o)
    }
}

impl From<Constraint> for Term {
    fn from(c: Constraint) -> Self {
        Term::Constraint(c)
    }
}

impl From<Relation> for Term {
    fn from(r: Relation) -> Self {
        Term::Constraint(Constraint::new(r))
    }
}

/// Anything `compile` accepts: a plain expression or a relation.
#[derive(Debug, Clone)]
pub enum Expression {
    Value(Variable),
    Relation(Relation),
}

impl From<Variable> for Expression {
    fn from(v: Variable) -> Self {
        Expression::Value(v)
    }
}

impl From<&Variable> for Expression {
    fn from(v: &Variable) -> Self {
        Expression::Value(v.clone())
    }
}

impl From<Relation> for Expression {
    fn from(r: Relation) -> Self {
        Expression::Relation(r)
    }
}

/// Compile an expression into a term.
///
/// Relations become constraints; everything else becomes an objective.
/// Without a name the term is named after the rendered expression.
pub fn compile(
    expression: impl Into<Expression>,
    weight: f64,
    norm: f64,
    name: Option<&str>,
) -> Result<Term> {
    let term: Term = match expression.into() {
        Expression::Value(v) => {
            let o = Objective::new(v).weight(weight).norm(norm);
            match name {
                Some(n) => o.named(n).into(),
                None => o.into(),
            }
        }
        Expression::Relation(r) => {
            let c = Constraint::new(r).weight(weight).norm(norm);
            match name {
                Some(n) => c.named(n).into(),
                None => c.into(),
            }
        }
    };
    term.validate()?;
    Ok(term)
}
