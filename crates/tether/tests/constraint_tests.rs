// Integration tests for variables, relations and compiled terms

use tether::prelude::*;
use tether::{Metric, TermKind};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn var(name: &str) -> Variable {
    Variable::new(name).unwrap()
}

fn dict(pairs: &[(&str, Tensor)]) -> DataDict {
    pairs.iter().map(|(k, t)| (*k, t.clone())).collect()
}

fn value(term: &Term, d: &DataDict) -> f64 {
    term.evaluate(d).unwrap().value.to_scalar_f64().unwrap()
}

// Resolution

#[test]
fn test_expression_is_lazy_and_resolves() -> tether::Result<()> {
    let x = var("x");
    let y = var("y");
    let expr = (&x * 2.0 - &y).abs().sum();
    // building never touches a dictionary
    assert_eq!(expr.keys(), vec!["x".to_string(), "y".to_string()]);

    let d = dict(&[
        ("x", Tensor::from_vec(vec![1.0, 2.0], 2)?),
        ("y", Tensor::from_vec(vec![5.0, 1.0], 2)?),
    ]);
    // |2 - 5| + |4 - 1|
    assert!(approx_eq(expr.resolve(&d)?.to_scalar_f64()?, 6.0, 1e-12));
    Ok(())
}

#[test]
fn test_resolution_error_names_expression_and_key() -> tether::Result<()> {
    let expr = var("x") + var("missing");
    let d = dict(&[("x", Tensor::scalar(1.0))]);
    match expr.resolve(&d) {
        Err(Error::Resolution { expr, key }) => {
            assert_eq!(expr, "(x + missing)");
            assert_eq!(key, "missing");
        }
        other => panic!("expected Resolution, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_constant_on_either_side() -> tether::Result<()> {
    let x = var("x");
    let d = dict(&[("x", Tensor::scalar(4.0))]);
    assert!(approx_eq((1.0 - &x).resolve(&d)?.to_scalar_f64()?, -3.0, 1e-12));
    assert!(approx_eq((&x / 2.0).resolve(&d)?.to_scalar_f64()?, 2.0, 1e-12));
    assert!(approx_eq((-&x).resolve(&d)?.to_scalar_f64()?, -4.0, 1e-12));
    Ok(())
}

#[test]
fn test_norm_and_slicing() -> tether::Result<()> {
    let x = var("x");
    let d = dict(&[("x", Tensor::from_vec(vec![3.0, 4.0, 0.0, 1.0], (2, 2))?)]);
    // rows [3, 4] and [0, 1]
    assert!(approx_eq(x.select(0, 0).norm(2.0).resolve(&d)?.to_scalar_f64()?, 5.0, 1e-9));
    let col = x.narrow(1, 1, 1).resolve(&d)?;
    assert_eq!(col.dims(), &[2, 1]);
    assert_eq!(col.to_f64_vec()?, vec![4.0, 1.0]);
    let row_means = x.mean_dim(1).resolve(&d)?;
    assert_eq!(row_means.to_f64_vec()?, vec![3.5, 0.5]);
    Ok(())
}

#[test]
fn test_expression_gradient() -> tether::Result<()> {
    let w = Tensor::from_vec(vec![1.0, -2.0], 2)?.set_variable();
    let d = dict(&[("w", w.clone())]);
    let loss = var("w").square().sum().resolve(&d)?;
    let grads = loss.backward()?;
    assert_eq!(grads.get(&w).unwrap().to_f64_vec()?, vec![2.0, -4.0]);
    Ok(())
}

#[test]
fn test_norm_gradient_is_zero_at_perfect_fit() -> tether::Result<()> {
    let w = Tensor::from_vec(vec![1.0, 2.0], 2)?.set_variable();
    let d = dict(&[("w", w.clone()), ("target", Tensor::from_vec(vec![1.0, 2.0], 2)?)]);
    let loss = (var("w") - var("target")).norm(2.0).resolve(&d)?;
    assert_eq!(loss.to_scalar_f64()?, 0.0);
    let grads = loss.backward()?;
    assert_eq!(grads.get(&w).unwrap().to_f64_vec()?, vec![0.0, 0.0]);

    // away from zero the usual gradient x / ||x||
    let d = dict(&[("w", w.clone()), ("target", Tensor::from_vec(vec![-2.0, -2.0], 2)?)]);
    let grads = (var("w") - var("target")).norm(2.0).resolve(&d)?.backward()?;
    let g = grads.get(&w).unwrap().to_f64_vec()?;
    assert!(approx_eq(g[0], 0.6, 1e-12) && approx_eq(g[1], 0.8, 1e-12));
    Ok(())
}

#[test]
fn test_relation_resolution_error_names_relation() -> tether::Result<()> {
    let relation = var("x").le(var("limit"));
    let d = dict(&[("x", Tensor::scalar(1.0))]);
    match relation.violation(&d) {
        Err(Error::Resolution { expr, key }) => {
            assert_eq!(expr, "x <= limit");
            assert_eq!(key, "limit");
        }
        other => panic!("expected Resolution, got {other:?}"),
    }
    Ok(())
}

// Constraints

#[test]
fn test_equality_with_identical_sides_is_zero() -> tether::Result<()> {
    let x = var("x");
    let term = compile(x.eq(&x), 3.0, 2.0, None)?;
    let d = dict(&[("x", Tensor::from_vec(vec![1.5, -2.0, 7.0], 3)?)]);
    assert_eq!(value(&term, &d), 0.0);
    Ok(())
}

#[test]
fn test_equality_constant_residual_squared() -> tether::Result<()> {
    // residual 2 everywhere, p = 2, weight 1
    let term = compile(var("a").eq(var("b")), 1.0, 2.0, None)?;
    let d = dict(&[
        ("a", Tensor::from_vec(vec![3.0, 5.0], 2)?),
        ("b", Tensor::from_vec(vec![1.0, 3.0], 2)?),
    ]);
    assert!(approx_eq(value(&term, &d), 4.0, 1e-12));
    Ok(())
}

#[test]
fn test_inequality_penalizes_only_violation() -> tether::Result<()> {
    let x = var("x");
    let satisfied = dict(&[("x", Tensor::from_vec(vec![-1.0, 0.0, 0.5], 3)?)]);
    let violated = dict(&[("x", Tensor::full(4, 3.0)?)]);

    for &p in &[1.0, 2.0, 3.0] {
        let weight = 0.5;
        let term = compile(x.le(1.0), weight, p, None)?;
        assert_eq!(value(&term, &satisfied), 0.0);
        // constant difference c = 2
        let expected = weight * 2.0f64.powf(p);
        assert!(approx_eq(value(&term, &violated), expected, 1e-9), "p = {p}");
    }
    Ok(())
}

#[test]
fn test_ge_mirrors_le() -> tether::Result<()> {
    let x = var("x");
    let d = dict(&[("x", Tensor::from_vec(vec![-3.0, 2.0], 2)?)]);
    let ge = compile(x.ge(0.0), 1.0, 1.0, None)?;
    // only -3 violates: mean([3, 0])
    assert!(approx_eq(value(&ge, &d), 1.5, 1e-12));
    let gt = compile(x.gt(0.0), 1.0, 1.0, None)?;
    assert!(approx_eq(value(&gt, &d), 1.5, 1e-12));
    Ok(())
}

#[test]
fn test_violation_tensor_is_unreduced() -> tether::Result<()> {
    let term = Term::from(var("x").le(0.0).norm(2.0));
    let d = dict(&[("x", Tensor::from_vec(vec![-1.0, 2.0, 4.0], 3)?)]);
    let tv = term.evaluate(&d)?;
    assert_eq!(tv.violation.to_f64_vec()?, vec![0.0, 2.0, 4.0]);
    assert!(approx_eq(tv.value.to_scalar_f64()?, 20.0 / 3.0, 1e-12));
    Ok(())
}

#[test]
fn test_constraint_gradient_vanishes_when_satisfied() -> tether::Result<()> {
    let w = Tensor::from_vec(vec![0.5, 3.0], 2)?.set_variable();
    let d = dict(&[("w", w.clone())]);
    let term = compile(var("w").le(1.0), 1.0, 2.0, None)?;
    let grads = term.evaluate(&d)?.value.backward()?;
    // d/dw mean(relu(w - 1)²) = (w - 1) for the violated entry (mean over 2)
    assert_eq!(grads.get(&w).unwrap().to_f64_vec()?, vec![0.0, 2.0]);
    Ok(())
}

// Objectives

#[test]
fn test_plain_objective_and_minimize() -> tether::Result<()> {
    let x = var("x");
    let d = dict(&[("x", Tensor::from_vec(vec![1.0, 3.0], 2)?)]);
    let plain = compile(&x, 2.0, 1.0, Some("mean_x"))?;
    assert_eq!(plain.name(), "mean_x");
    assert_eq!(plain.kind(), TermKind::Objective);
    assert!(approx_eq(value(&plain, &d), 4.0, 1e-12));

    let squared = Term::from(x.minimize(1.0).norm(2.0));
    assert!(approx_eq(value(&squared, &d), 5.0, 1e-12));
    Ok(())
}

#[test]
fn test_metric_objective() -> tether::Result<()> {
    let d = dict(&[
        ("pred", Tensor::from_vec(vec![1.0, 2.0], 2)?),
        ("target", Tensor::from_vec(vec![0.0, 4.0], 2)?),
    ]);
    let mse = Term::from(Objective::metric(Metric::Mse, var("pred"), var("target")).weight(2.0));
    assert!(approx_eq(value(&mse, &d), 5.0, 1e-12));
    let l1 = Term::from(Objective::metric(Metric::L1, var("pred"), var("target")));
    assert!(approx_eq(value(&l1, &d), 1.5, 1e-12));
    Ok(())
}

#[test]
fn test_relation_chaining() -> tether::Result<()> {
    let c = var("x").ge(0.0).weight(10.0).norm(1.0).named("positive");
    assert_eq!(c.name(), "positive");
    assert_eq!(c.base_weight(), 10.0);
    assert_eq!(c.norm_degree(), 1.0);
    let term: Term = c.into();
    assert_eq!(term.kind(), TermKind::Constraint);
    Ok(())
}

#[test]
fn test_empty_variable_name_rejected() {
    assert!(Variable::new("").is_err());
}
