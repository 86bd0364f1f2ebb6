// Problem — systems plus loss terms, reduced to one differentiable scalar
//
// forward() copies the batch dictionary, runs every System in order, then
// evaluates every term against the result. The total loss is the plain sum
// of the weighted term values, so it is differentiable with respect to any
// parameter the systems' nodes touched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use tether_core::{DataDict, Error, Result, Tensor, TensorId};

use crate::constraint::{Term, TermKind};
use crate::system::System;

/// One term's contribution to a forward pass.
#[derive(Debug, Clone)]
pub struct TermReport {
    pub name: String,
    pub kind: TermKind,
    /// Weight actually applied (may differ from the declared weight under
    /// penalty scheduling).
    pub weight: f64,
    /// Weighted scalar contribution.
    pub value: Tensor,
    /// Un-reduced violation or residual.
    pub violation: Tensor,
}

/// Mean and maximum of a constraint's violation tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViolationStats {
    pub mean: f64,
    pub max: f64,
}

/// Everything a forward pass produced.
#[derive(Debug, Clone)]
pub struct ProblemOutput {
    /// The dictionary after every system ran.
    pub dict: DataDict,
    /// Sum of all term values.
    pub loss: Tensor,
    /// Terms in declaration order.
    pub terms: Vec<TermReport>,
    /// Violation statistics keyed by constraint name.
    pub violations: BTreeMap<String, ViolationStats>,
}

impl ProblemOutput {
    pub fn loss_value(&self) -> Result<f64> {
        self.loss.to_scalar_f64()
    }

    /// Term name → weighted value.
    pub fn term_breakdown(&self) -> Result<BTreeMap<String, f64>> {
        self.terms
            .iter()
            .map(|t| Ok((t.name.clone(), t.value.to_scalar_f64()?)))
            .collect()
    }

    /// A flat metric map: `{prefix}loss`, `{prefix}{term}` and
    /// `{prefix}violation/{constraint}` (mean violation).
    pub fn metrics(&self, prefix: &str) -> Result<BTreeMap<String, f64>> {
        let mut m = BTreeMap::new();
        m.insert(format!("{prefix}loss"), self.loss_value()?);
        for (name, value) in self.term_breakdown()? {
            m.insert(format!("{prefix}{name}"), value);
        }
        for (name, stats) in &self.violations {
            m.insert(format!("{prefix}violation/{name}"), stats.mean);
        }
        Ok(m)
    }
}

/// Systems and terms composed into a single loss.
#[derive(Debug, Clone)]
pub struct Problem {
    systems: Vec<System>,
    terms: Vec<Term>,
}

impl Problem {
    /// Fails when two terms share a name or a term fails validation.
    pub fn new(systems: Vec<System>, terms: Vec<Term>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for term in &terms {
            term.validate()?;
            let name = term.name();
            if !names.insert(name.clone()) {
                return Err(Error::msg(format!(
                    "duplicate term name '{name}'; name terms explicitly with .named()"
                )));
            }
        }
        Ok(Problem { systems, terms })
    }

    pub fn systems(&self) -> &[System] {
        &self.systems
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Names of the constraint terms, in declaration order.
    pub fn constraint_names(&self) -> Vec<String> {
        self.terms
            .iter()
            .filter(|t| t.kind() == TermKind::Constraint)
            .map(Term::name)
            .collect()
    }

    /// Evaluate with the declared weights.
    pub fn forward(&self, batch: &DataDict) -> Result<ProblemOutput> {
        self.forward_with_weights(batch, &BTreeMap::new())
    }

    /// Evaluate, taking each term's weight from `weights` when present.
    pub fn forward_with_weights(
        &self,
        batch: &DataDict,
        weights: &BTreeMap<String, f64>,
    ) -> Result<ProblemOutput> {
        let mut dict = batch.clone();
        for system in &self.systems {
            system.forward(&mut dict)?;
        }

        let mut loss = Tensor::scalar(0.0);
        let mut terms = Vec::with_capacity(self.terms.len());
        let mut violations = BTreeMap::new();
        for term in &self.terms {
            let name = term.name();
            let weight = weights.get(&name).copied().unwrap_or_else(|| term.weight());
            let tv = term.evaluate_with_weight(&dict, weight)?;
            loss = loss.add(&tv.value)?;
            if term.kind() == TermKind::Constraint {
                let v = tv.violation.to_f64_vec()?;
                let mean = if v.is_empty() {
                    0.0
                } else {
                    v.iter().sum::<f64>() / v.len() as f64
                };
                let max = v.iter().copied().fold(0.0, f64::max);
                violations.insert(name.clone(), ViolationStats { mean, max });
            }
            terms.push(TermReport {
                name,
                kind: term.kind(),
                weight,
                value: tv.value,
                violation: tv.violation,
            });
        }

        Ok(ProblemOutput {
            dict,
            loss,
            terms,
            violations,
        })
    }

    /// Every trainable parameter across all systems, each listed once.
    pub fn parameters(&self) -> Vec<Tensor> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut seen: BTreeSet<TensorId> = BTreeSet::new();
        let mut out = Vec::new();
        for system in &self.systems {
            for (k, p) in system.named_parameters() {
                if seen.insert(p.id()) {
                    out.push((k, p));
                }
            }
        }
        out
    }

    pub fn describe(&self) -> String {
        let mut s = String::new();
        for system in &self.systems {
            s.push_str(&system.describe());
        }
        let _ = writeln!(s, "terms:");
        for term in &self.terms {
            let _ = writeln!(
                s,
                "  [{}] {} (weight {})",
                term.kind(),
                term.name(),
                term.weight()
            );
        }
        let params = self.parameters();
        let _ = write!(
            s,
            "parameters: {} tensors, {} values",
            params.len(),
            params.iter().map(Tensor::elem_count).sum::<usize>()
        );
        s
    }
}
