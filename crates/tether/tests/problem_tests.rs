// Integration tests for Problem: loss aggregation and breakdowns

use std::collections::BTreeMap;

use tether::prelude::*;
use tether::Metric;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn var(name: &str) -> Variable {
    Variable::new(name).unwrap()
}

fn dict(pairs: &[(&str, Tensor)]) -> DataDict {
    pairs.iter().map(|(k, t)| (*k, t.clone())).collect()
}

/// y = w * x with a scalar parameter w.
fn scaled_system(w: &Tensor) -> tether::Result<System> {
    let wc = w.clone();
    let block = FnBlock::with_parameters("scale", vec![("w".to_string(), w.clone())], move |xs| {
        Ok(vec![xs[0].mul(&wc)?])
    });
    System::new("model", vec![Node::new("scale", block, ["x"], ["y"])?])
}

#[test]
fn test_constant_residual_equality_loss() -> tether::Result<()> {
    // y = x + 2 against target x: residual 2 everywhere
    let shift = FnBlock::new("shift", |xs| Ok(vec![xs[0].add_scalar(2.0)?]));
    let system = System::new("s", vec![Node::new("shift", shift, ["x"], ["y"])?])?;
    let problem = Problem::new(vec![system], vec![var("y").eq(var("x")).into()])?;

    let out = problem.forward(&dict(&[("x", Tensor::from_vec(vec![0.0, 1.0, 5.0], 3)?)]))?;
    assert!(approx_eq(out.loss_value()?, 4.0, 1e-12));
    let stats = out.violations["y == x"];
    assert!(approx_eq(stats.mean, 2.0, 1e-12));
    assert!(approx_eq(stats.max, 2.0, 1e-12));
    Ok(())
}

#[test]
fn test_total_equals_sum_of_breakdown() -> tether::Result<()> {
    let w = Tensor::scalar(1.5).set_variable();
    let problem = Problem::new(
        vec![scaled_system(&w)?],
        vec![
            Objective::metric(Metric::Mse, var("y"), var("target")).into(),
            var("y").le(1.0).weight(3.0).into(),
            var("y").ge(-1.0).weight(0.5).named("lower").into(),
            var("y").abs().minimize(0.1).into(),
        ],
    )?;
    let batch = dict(&[
        ("x", Tensor::from_vec(vec![-2.0, 0.5, 1.0, 2.0], 4)?),
        ("target", Tensor::from_vec(vec![0.0, 0.0, 1.0, 1.0], 4)?),
    ]);
    let out = problem.forward(&batch)?;
    let breakdown = out.term_breakdown()?;
    assert_eq!(breakdown.len(), 4);
    let total: f64 = breakdown.values().sum();
    assert!(approx_eq(out.loss_value()?, total, 1e-12));
    assert!(breakdown["lower"] > 0.0);

    // the output dictionary holds system results
    assert_eq!(out.dict.get("y").unwrap().to_f64_vec()?, vec![-3.0, 0.75, 1.5, 3.0]);
    Ok(())
}

#[test]
fn test_loss_is_differentiable_in_parameters() -> tether::Result<()> {
    let w = Tensor::scalar(2.0).set_variable();
    let problem = Problem::new(
        vec![scaled_system(&w)?],
        vec![var("y").eq(var("target")).into()],
    )?;
    let batch = dict(&[
        ("x", Tensor::from_vec(vec![1.0, 2.0], 2)?),
        ("target", Tensor::from_vec(vec![1.0, 2.0], 2)?),
    ]);
    // loss = mean(((w - 1) x)²) = (w - 1)² · 2.5; d/dw = 5 (w - 1) = 5
    let out = problem.forward(&batch)?;
    assert!(approx_eq(out.loss_value()?, 2.5, 1e-12));
    let grads = out.loss.backward()?;
    assert!(approx_eq(grads.get(&w).unwrap().to_scalar_f64()?, 5.0, 1e-12));
    assert_eq!(problem.parameters().len(), 1);
    assert_eq!(problem.named_parameters()[0].0, "model.scale.w");
    assert!(problem.describe().ends_with("parameters: 1 tensors, 1 values"));
    Ok(())
}

#[test]
fn test_forward_does_not_mutate_batch() -> tether::Result<()> {
    let w = Tensor::scalar(1.0).set_variable();
    let problem = Problem::new(vec![scaled_system(&w)?], vec![var("y").minimize(1.0).into()])?;
    let batch = dict(&[("x", Tensor::scalar(1.0))]);
    problem.forward(&batch)?;
    assert!(!batch.contains_key("y"));
    Ok(())
}

#[test]
fn test_weight_override() -> tether::Result<()> {
    let problem = Problem::new(vec![], vec![var("x").le(0.0).named("c").into()])?;
    let batch = dict(&[("x", Tensor::scalar(1.0))]);
    let base = problem.forward(&batch)?;
    assert!(approx_eq(base.loss_value()?, 1.0, 1e-12));

    let weights: BTreeMap<String, f64> = [("c".to_string(), 8.0)].into_iter().collect();
    let boosted = problem.forward_with_weights(&batch, &weights)?;
    assert!(approx_eq(boosted.loss_value()?, 8.0, 1e-12));
    assert_eq!(boosted.terms[0].weight, 8.0);
    Ok(())
}

#[test]
fn test_duplicate_term_names_rejected() -> tether::Result<()> {
    let terms: Vec<Term> = vec![var("x").le(1.0).into(), var("x").le(1.0).into()];
    assert!(Problem::new(vec![], terms).is_err());

    let renamed: Vec<Term> = vec![
        var("x").le(1.0).into(),
        var("x").le(1.0).named("again").into(),
    ];
    assert!(Problem::new(vec![], renamed).is_ok());
    Ok(())
}

#[test]
fn test_negative_weight_rejected() {
    let terms: Vec<Term> = vec![var("x").minimize(-1.0).into()];
    assert!(Problem::new(vec![], terms).is_err());
}

#[test]
fn test_missing_variable_propagates() -> tether::Result<()> {
    let problem = Problem::new(vec![], vec![var("nowhere").minimize(1.0).into()])?;
    let err = problem.forward(&DataDict::new()).unwrap_err();
    assert!(matches!(err, Error::Resolution { .. }));
    assert!(err.is_structural());
    Ok(())
}

#[test]
fn test_metrics_and_describe() -> tether::Result<()> {
    let problem = Problem::new(vec![], vec![var("x").le(0.0).named("c").into()])?;
    let out = problem.forward(&dict(&[("x", Tensor::scalar(2.0))]))?;
    let m = out.metrics("train/")?;
    assert!(approx_eq(m["train/loss"], 4.0, 1e-12));
    assert!(approx_eq(m["train/c"], 4.0, 1e-12));
    assert!(approx_eq(m["train/violation/c"], 2.0, 1e-12));
    assert_eq!(problem.constraint_names(), vec!["c".to_string()]);
    assert!(problem.describe().contains("[constraint] c (weight 1)"));
    Ok(())
}
