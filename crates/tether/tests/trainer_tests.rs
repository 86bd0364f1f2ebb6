// Integration tests for the Trainer: termination, penalties, checkpoints

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tether::checkpoint;
use tether::prelude::*;
use tether::{compile, Metric, TrainerCheckpoint, TrainerState};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn var(name: &str) -> Variable {
    Variable::new(name).unwrap()
}

fn batch(x: &[f64], target: &[f64]) -> DataDict {
    let mut d = DataDict::new();
    d.insert("x", Tensor::from_vec(x.to_vec(), x.len()).unwrap());
    d.insert("target", Tensor::from_vec(target.to_vec(), target.len()).unwrap());
    d
}

/// pred = w * x with a scalar parameter starting at `init`.
fn model(init: f64) -> tether::Result<(Tensor, System)> {
    let w = Tensor::scalar(init).set_variable();
    let wc = w.clone();
    let block = FnBlock::with_parameters("scale", vec![("w".to_string(), w.clone())], move |xs| {
        Ok(vec![xs[0].mul(&wc)?])
    });
    let system = System::new("model", vec![Node::new("scale", block, ["x"], ["pred"])?])?;
    Ok((w, system))
}

fn regression(init: f64) -> tether::Result<(Tensor, Problem)> {
    let (w, system) = model(init)?;
    let fit = Objective::metric(Metric::Mse, var("pred"), var("target"));
    Ok((w, Problem::new(vec![system], vec![fit.into()])?))
}

fn sgd(problem: &Problem, lr: f64) -> Box<dyn Optimizer> {
    Box::new(SGD::new(problem.parameters(), lr, 0.0, 0.0))
}

// Termination

#[test]
fn test_early_stop_restores_best_parameters() -> tether::Result<()> {
    // train pulls w toward 1, dev scores against -1: dev worsens after epoch 0
    let (w, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let config = TrainerConfig::default().epochs(50).patience(0);
    let mut trainer = Trainer::new(problem, opt, config)?;

    let mut train = vec![batch(&[1.0], &[1.0])];
    let mut dev = vec![batch(&[1.0], &[-1.0])];
    let outcome = trainer.fit(&mut train, &mut dev)?;

    assert_eq!(outcome.termination, Termination::EarlyStopped);
    assert_eq!(outcome.epochs_run, 2);
    assert_eq!(outcome.best_epoch, Some(0));
    assert!(approx_eq(outcome.best_metric.unwrap(), 1.44, 1e-12));
    assert!(outcome.history[0].improved);
    assert!(!outcome.history[1].improved);
    // w after epoch 0 was 0.2; epoch 1 moved it to 0.36
    assert!(approx_eq(w.to_scalar_f64()?, 0.2, 1e-12));
    assert_eq!(trainer.state(), TrainerState::EarlyStopped);
    Ok(())
}

#[test]
fn test_warmup_defers_patience() -> tether::Result<()> {
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let config = TrainerConfig::default().epochs(50).patience(0).warmup(3);
    let mut trainer = Trainer::new(problem, opt, config)?;

    let outcome = trainer.fit(&mut vec![batch(&[1.0], &[1.0])], &mut vec![batch(&[1.0], &[-1.0])])?;
    assert_eq!(outcome.termination, Termination::EarlyStopped);
    assert_eq!(outcome.epochs_run, 4);
    assert_eq!(outcome.best_epoch, Some(0));
    Ok(())
}

#[test]
fn test_budget_exhaustion_converges() -> tether::Result<()> {
    let (w, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default().epochs(5))?;

    let data = vec![batch(&[1.0, 2.0], &[1.0, 2.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.termination, Termination::Converged);
    assert_eq!(outcome.epochs_run, 5);
    assert_eq!(outcome.best_epoch, Some(4));
    assert!(w.to_scalar_f64()? > 0.9);
    assert!(outcome.into_result().is_ok());
    Ok(())
}

#[test]
fn test_target_metric_converges_early() -> tether::Result<()> {
    // w halves its distance to 1 each epoch; dev metric (w - 1)²
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.25);
    let config = TrainerConfig::default().epochs(100).target_metric(1e-3);
    let mut trainer = Trainer::new(problem, opt, config)?;

    let data = vec![batch(&[1.0], &[1.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.termination, Termination::Converged);
    assert_eq!(outcome.epochs_run, 5);
    assert!(outcome.best_metric.unwrap() <= 1e-3);
    Ok(())
}

#[test]
fn test_eval_every_skips_validation() -> tether::Result<()> {
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let config = TrainerConfig::default().epochs(5).eval_every(2);
    let mut trainer = Trainer::new(problem, opt, config)?;
    let data = vec![batch(&[1.0], &[1.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    let validated: Vec<bool> = outcome.history.iter().map(|l| l.dev_metric.is_some()).collect();
    // epochs 1 and 3, plus the last
    assert_eq!(validated, vec![false, true, false, true, true]);
    Ok(())
}

#[test]
fn test_stop_handle() -> tether::Result<()> {
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default())?;
    trainer.stop_handle().store(true, Ordering::Relaxed);
    let data = vec![batch(&[1.0], &[1.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.termination, Termination::EarlyStopped);
    assert_eq!(outcome.epochs_run, 0);
    Ok(())
}

// Failure

#[test]
fn test_nan_loss_fails_and_keeps_parameters() -> tether::Result<()> {
    let (w, system) = model(1.0)?;
    let problem = Problem::new(vec![system], vec![var("pred").log().minimize(1.0).into()])?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default())?;

    let data = vec![batch(&[-1.0], &[0.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.termination, Termination::Failed);
    assert_eq!(outcome.epochs_run, 0);
    match &outcome.failure {
        Some(Error::NumericDivergence { quantity, epoch, batch, .. }) => {
            assert_eq!(quantity, "loss");
            assert_eq!((*epoch, *batch), (0, 0));
        }
        other => panic!("expected NumericDivergence, got {other:?}"),
    }
    assert_eq!(w.to_scalar_f64()?, 1.0);
    assert_eq!(trainer.state(), TrainerState::Failed);
    assert!(matches!(outcome.into_result(), Err(Error::NumericDivergence { .. })));
    Ok(())
}

#[test]
fn test_infinite_gradient_fails() -> tether::Result<()> {
    // sqrt at 0 is finite but its derivative is not
    let (_, system) = model(0.0)?;
    let problem = Problem::new(vec![system], vec![var("pred").sqrt().minimize(1.0).into()])?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default())?;
    let data = vec![batch(&[1.0], &[0.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.termination, Termination::Failed);
    assert!(matches!(
        outcome.failure,
        Some(Error::NumericDivergence { ref quantity, .. }) if quantity == "gradient"
    ));
    Ok(())
}

#[test]
fn test_block_error_restores_best_parameters() -> tether::Result<()> {
    // pred = w * x, failing on its fifth call: epoch 1, second training batch
    let w = Tensor::scalar(0.0).set_variable();
    let wc = w.clone();
    let counter = Arc::new(AtomicUsize::new(0));
    let block = FnBlock::with_parameters("scale", vec![("w".to_string(), w.clone())], move |xs| {
        if counter.fetch_add(1, Ordering::SeqCst) == 4 {
            return Err(Error::msg("sensor dropout"));
        }
        Ok(vec![xs[0].mul(&wc)?])
    });
    let system = System::new("model", vec![Node::new("scale", block, ["x"], ["pred"])?])?;
    let fit = Objective::metric(Metric::Mse, var("pred"), var("target"));
    let problem = Problem::new(vec![system], vec![fit.into()])?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default().epochs(5))?;

    let mut train = vec![batch(&[1.0], &[1.0]), batch(&[1.0], &[1.0])];
    let mut dev = vec![batch(&[1.0], &[1.0])];
    assert!(trainer.fit(&mut train, &mut dev).is_err());
    assert_eq!(trainer.state(), TrainerState::Failed);
    // epoch 0 ended at 0.36; the step on epoch 1's first batch (0.488) is undone
    assert!(approx_eq(w.to_scalar_f64()?, 0.36, 1e-12));
    Ok(())
}

#[test]
fn test_satisfied_fractional_norm_constraint_trains() -> tether::Result<()> {
    let (_, system) = model(0.5)?;
    let cap = compile(var("pred").le(10.0), 1.0, 0.5, Some("cap"))?;
    let problem = Problem::new(vec![system], vec![cap])?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default().epochs(3))?;
    let data = vec![batch(&[1.0], &[0.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.termination, Termination::Converged);
    assert!(outcome.failure.is_none());
    Ok(())
}

#[test]
fn test_structural_errors_propagate() -> tether::Result<()> {
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default())?;
    let mut missing = DataDict::new();
    missing.insert("x", Tensor::scalar(1.0));
    let result = trainer.fit(&mut vec![missing], &mut Vec::<DataDict>::new());
    assert!(matches!(result, Err(Error::Resolution { .. })));
    Ok(())
}

// Penalty scheduling

#[test]
fn test_penalty_weights_grow_monotonically_to_cap() -> tether::Result<()> {
    let (_, system) = model(0.0)?;
    let floor = var("pred").ge(5.0).named("floor");
    let problem = Problem::new(vec![system], vec![floor.into()])?;
    let opt = sgd(&problem, 1e-4);
    let config = TrainerConfig::default()
        .epochs(6)
        .patience(100)
        .penalty(PenaltyConfig {
            tolerance: 0.0,
            growth: 2.0,
            max_weight: 6.0,
        });
    let sink = MemorySink::new();
    let mut trainer = Trainer::new(problem, opt, config)?.with_sink(Box::new(sink.clone()));

    let data = vec![batch(&[1.0], &[0.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut Vec::<DataDict>::new())?;
    assert_eq!(outcome.epochs_run, 6);

    let series: Vec<f64> = sink.series("penalty/floor").into_iter().map(|(_, w)| w).collect();
    assert_eq!(series, vec![2.0, 4.0, 6.0, 6.0, 6.0, 6.0]);
    assert!(series.windows(2).all(|p| p[0] <= p[1]));
    assert_eq!(trainer.penalty_weights()["floor"], 6.0);
    Ok(())
}

#[test]
fn test_declared_weight_above_cap_is_clamped() -> tether::Result<()> {
    let (_, system) = model(0.0)?;
    let bound = var("pred").ge(5.0).weight(10.0).named("bound");
    let problem = Problem::new(vec![system], vec![bound.into()])?;
    let opt = sgd(&problem, 1e-4);
    let config = TrainerConfig::default().epochs(3).penalty(PenaltyConfig {
        tolerance: 0.0,
        growth: 2.0,
        max_weight: 5.0,
    });
    let mut trainer = Trainer::new(problem, opt, config)?;
    assert_eq!(trainer.penalty_weights()["bound"], 5.0);

    let data = vec![batch(&[1.0], &[0.0])];
    let outcome = trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert!(outcome.history.iter().all(|log| log.penalty_weights["bound"] <= 5.0));
    assert_eq!(trainer.penalty_weights()["bound"], 5.0);
    Ok(())
}

#[test]
fn test_satisfied_constraint_keeps_weight() -> tether::Result<()> {
    let (_, system) = model(10.0)?;
    let problem = Problem::new(vec![system], vec![var("pred").ge(5.0).named("floor").into()])?;
    let opt = sgd(&problem, 0.1);
    let config = TrainerConfig::default().epochs(3).penalty(PenaltyConfig::default());
    let mut trainer = Trainer::new(problem, opt, config)?;
    let data = vec![batch(&[1.0], &[0.0])];
    trainer.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(trainer.penalty_weights()["floor"], 1.0);
    Ok(())
}

// Metrics & evaluation

#[test]
fn test_sink_receives_epoch_metrics() -> tether::Result<()> {
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let sink = MemorySink::new();
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default().epochs(2))?
        .with_sink(Box::new(sink.clone()));
    let data = vec![batch(&[1.0], &[1.0])];
    trainer.fit(&mut data.clone(), &mut data.clone())?;

    let records = sink.records();
    assert_eq!(records.len(), 2);
    let (epoch, metrics) = &records[0];
    assert_eq!(*epoch, 0);
    assert!(approx_eq(metrics["train/loss"], 1.0, 1e-12));
    assert!(metrics.contains_key("train/mse(pred, target)"));
    assert!(metrics.contains_key("dev/metric"));
    assert!(approx_eq(metrics["lr"], 0.1, 1e-12));
    Ok(())
}

#[test]
fn test_validation_term_metric_and_test_pass() -> tether::Result<()> {
    let (_, system) = model(0.0)?;
    let problem = Problem::new(
        vec![system],
        vec![
            Objective::metric(Metric::Mse, var("pred"), var("target"))
                .named("fit")
                .into(),
            var("pred").le(10.0).named("cap").into(),
        ],
    )?;
    let opt = sgd(&problem, 0.1);
    let config = TrainerConfig::default()
        .epochs(2)
        .metric(ValidationMetric::Term("fit".to_string()));
    let mut trainer = Trainer::new(problem, opt, config)?;
    let data = vec![batch(&[1.0], &[1.0])];
    trainer.fit(&mut data.clone(), &mut data.clone())?;

    let report = trainer.test(&mut data.clone())?;
    assert!(report.contains_key("loss"));
    assert!(report.contains_key("fit"));
    assert!(approx_eq(report["violation/cap"], 0.0, 1e-12));
    assert!(trainer.test(&mut Vec::<DataDict>::new()).is_err());
    Ok(())
}

#[test]
fn test_unknown_validation_term_rejected() -> tether::Result<()> {
    let (_, problem) = regression(0.0)?;
    let opt = sgd(&problem, 0.1);
    let config = TrainerConfig::default().metric(ValidationMetric::Term("nope".to_string()));
    assert!(Trainer::new(problem, opt, config).is_err());
    Ok(())
}

#[test]
fn test_training_through_a_data_loader() -> tether::Result<()> {
    let xs: Vec<f64> = (0..16).map(|i| i as f64 / 8.0).collect();
    let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x).collect();
    let ds = DictDataset::from_pairs([
        ("x", Tensor::from_vec(xs, 16)?),
        ("target", Tensor::from_vec(ys, 16)?),
    ])?;
    let parts = random_split(&ds, &[12, 4], 7)?;
    let mut train = DictLoader::new(parts[0].clone(), DataLoaderConfig::default().batch_size(4).seed(1));
    let mut dev = DictLoader::new(parts[1].clone(), DataLoaderConfig::default().batch_size(4).shuffle(false));

    let (w, problem) = regression(0.0)?;
    let opt: Box<dyn Optimizer> = Box::new(Adam::new(problem.parameters(), 0.1));
    let mut trainer = Trainer::new(problem, opt, TrainerConfig::default().epochs(60).patience(60))?;
    trainer.fit(&mut train, &mut dev)?;
    assert!(approx_eq(w.to_scalar_f64()?, 3.0, 0.1), "w = {}", w.to_scalar_f64()?);
    Ok(())
}

// Checkpoints

fn adam_trainer(epochs: usize) -> tether::Result<(Tensor, Trainer)> {
    let (w, problem) = regression(0.0)?;
    let opt: Box<dyn Optimizer> = Box::new(Adam::new(problem.parameters(), 0.05));
    let trainer = Trainer::new(problem, opt, TrainerConfig::default().epochs(epochs))?;
    Ok((w, trainer))
}

#[test]
fn test_checkpoint_binary_roundtrip() -> tether::Result<()> {
    let (_, mut trainer) = adam_trainer(3)?;
    let data = vec![batch(&[1.0, 2.0], &[1.0, 2.0])];
    trainer.fit(&mut data.clone(), &mut data.clone())?;

    let ckpt = trainer.checkpoint()?;
    assert_eq!(ckpt.epoch, 3);
    assert_eq!(ckpt.params[0].name, "model.scale.w");
    assert_eq!(ckpt.optimizer.optimizer_type, "Adam");

    let bytes = checkpoint::to_bytes(&ckpt)?;
    assert_eq!(&bytes[..4], b"TTHR");
    assert_eq!(checkpoint::from_bytes(&bytes)?, ckpt);

    let json = serde_json::to_string(&ckpt).unwrap();
    let back: TrainerCheckpoint = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ckpt);
    Ok(())
}

#[test]
fn test_checkpoint_rejects_corrupt_input() -> tether::Result<()> {
    let (_, trainer) = adam_trainer(1)?;
    let mut bytes = checkpoint::to_bytes(&trainer.checkpoint()?)?;
    assert!(checkpoint::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    bytes[0] = b'X';
    assert!(checkpoint::from_bytes(&bytes).is_err());
    Ok(())
}

#[test]
fn test_checkpoint_rejects_oversized_lengths() {
    fn header() -> Vec<u8> {
        let mut b = b"TTHR".to_vec();
        b.extend(1u32.to_le_bytes());
        b
    }

    // optimizer buffer claiming u64::MAX values
    let mut buffer = header();
    buffer.push(0x02);
    buffer.extend(4u32.to_le_bytes());
    buffer.extend(b"Adam");
    buffer.extend(0u32.to_le_bytes());
    buffer.extend(1u32.to_le_bytes());
    buffer.extend(1u32.to_le_bytes());
    buffer.extend(b"m");
    buffer.extend(u64::MAX.to_le_bytes());
    buffer.extend(1.0f64.to_le_bytes());
    assert!(checkpoint::from_bytes(&buffer).is_err());

    // parameter section claiming u32::MAX entries
    let mut params = header();
    params.push(0x01);
    params.extend(u32::MAX.to_le_bytes());
    assert!(checkpoint::from_bytes(&params).is_err());

    // string claiming u32::MAX bytes
    let mut name = header();
    name.push(0x02);
    name.extend(u32::MAX.to_le_bytes());
    name.extend(b"Ad");
    assert!(checkpoint::from_bytes(&name).is_err());
}

#[test]
fn test_restore_resumes_identically() -> tether::Result<()> {
    let data = vec![batch(&[1.0, 2.0], &[1.0, 2.0])];

    // uninterrupted: 5 epochs
    let (w_full, mut full) = adam_trainer(5)?;
    full.fit(&mut data.clone(), &mut data.clone())?;

    // interrupted after 3, resumed in a fresh trainer
    let (_, mut first) = adam_trainer(3)?;
    first.fit(&mut data.clone(), &mut data.clone())?;
    let saved = checkpoint::from_bytes(&checkpoint::to_bytes(&first.checkpoint()?)?)?;

    let (w_resumed, mut resumed) = adam_trainer(5)?;
    resumed.restore(&saved)?;
    assert_eq!(resumed.epoch(), 3);
    assert_eq!(w_resumed.to_f64_vec()?, saved.params[0].data);
    let outcome = resumed.fit(&mut data.clone(), &mut data.clone())?;
    assert_eq!(outcome.epochs_run, 2);

    assert_eq!(w_resumed.to_scalar_f64()?, w_full.to_scalar_f64()?);
    Ok(())
}

#[test]
fn test_restore_rejects_other_layout() -> tether::Result<()> {
    let (_, trainer) = adam_trainer(1)?;
    let mut ckpt = trainer.checkpoint()?;
    ckpt.params[0].name = "other".to_string();
    let (_, mut fresh) = adam_trainer(1)?;
    assert!(fresh.restore(&ckpt).is_err());
    Ok(())
}

// Configuration

#[test]
fn test_config_from_json() -> tether::Result<()> {
    let config = TrainerConfig::from_json_str(
        r#"{
            "epochs": 20,
            "patience": 2,
            "metric": { "loss_plus_violation": { "factor": 10.0 } },
            "penalty": { "growth": 3.0 }
        }"#,
    )?;
    assert_eq!(config.epochs, 20);
    assert_eq!(config.patience, 2);
    assert_eq!(config.eval_every, 1);
    assert_eq!(config.metric, ValidationMetric::LossPlusViolation { factor: 10.0 });
    let penalty = config.penalty.unwrap();
    assert_eq!(penalty.growth, 3.0);
    assert_eq!(penalty.max_weight, PenaltyConfig::default().max_weight);

    let again = TrainerConfig::from_json_str(&config.to_json_string()?)?;
    assert_eq!(again, config);
    Ok(())
}

#[test]
fn test_config_validation() {
    assert!(TrainerConfig::from_json_str(r#"{ "epochs": 0 }"#).is_err());
    assert!(TrainerConfig::from_json_str(r#"{ "penalty": { "growth": 0.5 } }"#).is_err());
    assert!(TrainerConfig::from_json_str(r#"{ "clip_grad_norm": -1.0 }"#).is_err());
    assert!(TrainerConfig::from_json_str("not json").is_err());
    assert!(TrainerConfig::default().validate().is_ok());
}
