// Trainer — the constrained-optimization loop
//
// Each epoch walks the trainer through
//
//   TrainEpoch         forward, backward, optimizer step per batch
//   Validating         forward over the dev source under no_grad
//   CheckpointDecision keep the parameters if the dev metric improved,
//                      otherwise count a bad epoch; grow the weights of
//                      constraints still violated on the training data
//
// and ends in one of
//
//   Converged    epoch budget exhausted, or the target metric reached
//   EarlyStopped bad epochs exceeded the patience limit
//   Failed       a non-finite loss, gradient or metric appeared
//
// Every terminal state writes the best parameters seen back into the
// model. Divergence is reported through the outcome rather than as an
// error; errors raised by blocks or expressions propagate unchanged.
//
// Penalty weights only affect the training loss. Validation always scores
// the problem with its declared weights so metrics stay comparable across
// epochs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tether_core::{no_grad, DataDict, Error, Result, Tensor};
use tether_data::BatchSource;
use tether_optim::{clip_grad_norm, grad_norm, grads_finite, Optimizer};

use crate::checkpoint::{ParamSnapshot, TrainerCheckpoint};
use crate::config::{TrainerConfig, ValidationMetric};
use crate::constraint::TermKind;
use crate::logging::MetricSink;
use crate::problem::{Problem, ProblemOutput};

/// Where the training loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    TrainEpoch,
    Validating,
    CheckpointDecision,
    EarlyStopped,
    Converged,
    Failed,
}

/// How a `fit` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EarlyStopped,
    Converged,
    Failed,
}

impl From<Termination> for TrainerState {
    fn from(t: Termination) -> Self {
        match t {
            Termination::EarlyStopped => TrainerState::EarlyStopped,
            Termination::Converged => TrainerState::Converged,
            Termination::Failed => TrainerState::Failed,
        }
    }
}

/// One epoch's summary.
#[derive(Debug, Clone)]
pub struct EpochLog {
    /// Epoch number (0-indexed).
    pub epoch: usize,
    /// Mean training loss (under the penalty weights in force).
    pub train_loss: f64,
    /// Validation metric, if this epoch validated.
    pub dev_metric: Option<f64>,
    /// Whether the validation metric improved on the best so far.
    pub improved: bool,
    /// Constraint weights after this epoch's penalty update.
    pub penalty_weights: BTreeMap<String, f64>,
}

/// Result of [`Trainer::fit`].
#[derive(Debug)]
pub struct TrainOutcome {
    pub termination: Termination,
    /// Epochs completed during this call.
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_metric: Option<f64>,
    pub history: Vec<EpochLog>,
    /// The divergence that ended a failed run.
    pub failure: Option<Error>,
}

impl TrainOutcome {
    /// `Err` with the divergence for failed runs, the outcome otherwise.
    pub fn into_result(self) -> Result<Self> {
        match self.failure {
            Some(err) if self.termination == Termination::Failed => Err(err),
            failure => Ok(TrainOutcome { failure, ..self }),
        }
    }
}

impl fmt::Display for TrainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "training ended ({:?}) after {} epochs",
            self.termination, self.epochs_run
        )?;
        for log in &self.history {
            write!(f, "  epoch {}: train loss = {:.6}", log.epoch, log.train_loss)?;
            if let Some(m) = log.dev_metric {
                write!(f, ", dev metric = {m:.6}")?;
            }
            if log.improved {
                write!(f, " *")?;
            }
            writeln!(f)?;
        }
        match (self.best_epoch, self.best_metric) {
            (Some(e), Some(m)) => write!(f, "  best: epoch {e}, metric {m:.6}"),
            _ => write!(f, "  best: none"),
        }
    }
}

/// Per-pass means of the loss, term values and constraint violations.
#[derive(Debug, Clone, Default)]
struct PassStats {
    batches: usize,
    loss: f64,
    terms: BTreeMap<String, f64>,
    violations: BTreeMap<String, f64>,
}

impl PassStats {
    fn add(&mut self, out: &ProblemOutput) -> Result<()> {
        self.batches += 1;
        self.loss += out.loss_value()?;
        for (name, value) in out.term_breakdown()? {
            *self.terms.entry(name).or_default() += value;
        }
        for (name, stats) in &out.violations {
            *self.violations.entry(name.clone()).or_default() += stats.mean;
        }
        Ok(())
    }

    /// Turn sums into means.
    fn finish(mut self) -> Option<Self> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        self.loss /= n;
        self.terms.values_mut().for_each(|v| *v /= n);
        self.violations.values_mut().for_each(|v| *v /= n);
        Some(self)
    }

    fn metrics(&self, prefix: &str) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert(format!("{prefix}loss"), self.loss);
        for (name, v) in &self.terms {
            m.insert(format!("{prefix}{name}"), *v);
        }
        for (name, v) in &self.violations {
            m.insert(format!("{prefix}violation/{name}"), *v);
        }
        m
    }
}

/// Drives a [`Problem`] to a solution with an [`Optimizer`].
pub struct Trainer {
    problem: Problem,
    optimizer: Box<dyn Optimizer>,
    config: TrainerConfig,
    sinks: Vec<Box<dyn MetricSink>>,
    params: Vec<(String, Tensor)>,
    state: TrainerState,
    epoch: usize,
    best_epoch: Option<usize>,
    best_metric: Option<f64>,
    bad_epochs: usize,
    best_params: Vec<Vec<f64>>,
    penalty_weights: BTreeMap<String, f64>,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    /// Fails if the configuration is invalid or names an unknown term.
    pub fn new(
        problem: Problem,
        optimizer: Box<dyn Optimizer>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if let ValidationMetric::Term(name) = &config.metric {
            if !problem.terms().iter().any(|t| &t.name() == name) {
                return Err(Error::msg(format!(
                    "trainer config: validation metric names unknown term '{name}'"
                )));
            }
        }

        let params = problem.named_parameters();
        for (name, p) in &params {
            if !optimizer.params().iter().any(|q| q.id() == p.id()) {
                tracing::warn!(param = %name, "parameter is not registered with the optimizer");
            }
        }
        let best_params = params
            .iter()
            .map(|(_, p)| p.to_f64_vec())
            .collect::<Result<Vec<_>>>()?;
        let cap = config.penalty.map(|p| p.max_weight);
        let penalty_weights = problem
            .terms()
            .iter()
            .filter(|t| t.kind() == TermKind::Constraint)
            .map(|t| {
                let declared = t.weight();
                match cap {
                    Some(max) if declared > max => {
                        tracing::warn!(
                            constraint = %t.name(),
                            declared,
                            max_weight = max,
                            "declared weight exceeds the penalty cap, clamping"
                        );
                        (t.name(), max)
                    }
                    _ => (t.name(), declared),
                }
            })
            .collect();

        Ok(Trainer {
            problem,
            optimizer,
            config,
            sinks: Vec::new(),
            params,
            state: TrainerState::Initializing,
            epoch: 0,
            best_epoch: None,
            best_metric: None,
            bad_epochs: 0,
            best_params,
            penalty_weights,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Add a metric sink.
    pub fn with_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// The next epoch `fit` will run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    pub fn penalty_weights(&self) -> &BTreeMap<String, f64> {
        &self.penalty_weights
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// A flag that, once set, stops `fit` before the next epoch begins.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn set_state(&mut self, state: TrainerState) {
        if self.state != state {
            tracing::trace!(from = ?self.state, to = ?state, "trainer state");
        }
        self.state = state;
    }

    fn param_tensors(&self) -> Vec<Tensor> {
        self.params.iter().map(|(_, p)| p.clone()).collect()
    }

    fn snapshot(&self) -> Result<Vec<Vec<f64>>> {
        self.params.iter().map(|(_, p)| p.to_f64_vec()).collect()
    }

    fn restore_best(&self) -> Result<()> {
        for ((_, p), data) in self.params.iter().zip(&self.best_params) {
            p.update_data_inplace(data)?;
        }
        Ok(())
    }

    /// Train until a terminal state.
    ///
    /// Resumes from the trainer's current epoch, so a restored checkpoint
    /// continues where it left off. An empty `dev` source validates on the
    /// training statistics instead.
    pub fn fit<T, D>(&mut self, train: &mut T, dev: &mut D) -> Result<TrainOutcome>
    where
        T: BatchSource + ?Sized,
        D: BatchSource + ?Sized,
    {
        self.set_state(TrainerState::Initializing);
        let mut history = Vec::new();
        tracing::info!(
            start_epoch = self.epoch,
            epochs = self.config.epochs,
            params = self.params.len(),
            "training started"
        );

        let termination = loop {
            if self.epoch >= self.config.epochs {
                break Termination::Converged;
            }
            if self.stop.load(Ordering::Relaxed) {
                tracing::info!(epoch = self.epoch, "stop requested");
                break Termination::EarlyStopped;
            }

            match self.run_epoch(train, dev) {
                Ok(log) => history.push(log),
                Err(err @ Error::NumericDivergence { .. }) => {
                    tracing::warn!(error = %err, "training diverged");
                    self.restore_best()?;
                    self.set_state(TrainerState::Failed);
                    return Ok(TrainOutcome {
                        termination: Termination::Failed,
                        epochs_run: history.len(),
                        best_epoch: self.best_epoch,
                        best_metric: self.best_metric,
                        history,
                        failure: Some(err),
                    });
                }
                Err(err) => {
                    self.restore_best()?;
                    self.set_state(TrainerState::Failed);
                    return Err(err);
                }
            }
            self.epoch += 1;

            if let (Some(target), Some(best)) = (self.config.target_metric, self.best_metric) {
                if best <= target {
                    break Termination::Converged;
                }
            }
            if self.bad_epochs > self.config.patience {
                break Termination::EarlyStopped;
            }
        };

        self.restore_best()?;
        self.set_state(termination.into());
        tracing::info!(
            termination = ?termination,
            epochs = history.len(),
            best_epoch = ?self.best_epoch,
            best_metric = ?self.best_metric,
            "training finished"
        );
        Ok(TrainOutcome {
            termination,
            epochs_run: history.len(),
            best_epoch: self.best_epoch,
            best_metric: self.best_metric,
            history,
            failure: None,
        })
    }

    fn run_epoch<T, D>(&mut self, train: &mut T, dev: &mut D) -> Result<EpochLog>
    where
        T: BatchSource + ?Sized,
        D: BatchSource + ?Sized,
    {
        let epoch = self.epoch;
        self.set_state(TrainerState::TrainEpoch);
        let train_stats = self.train_epoch(train, epoch)?;

        let is_last = epoch + 1 == self.config.epochs;
        let mut dev_metric = None;
        let mut improved = false;
        let mut metrics = train_stats.metrics("train/");

        if is_last || (epoch + 1) % self.config.eval_every == 0 {
            self.set_state(TrainerState::Validating);
            let dev_stats = no_grad(|| self.evaluate(dev))?;
            let scored = dev_stats.as_ref().unwrap_or(&train_stats);
            let metric = self.score(scored)?;
            if !metric.is_finite() {
                return Err(Error::NumericDivergence {
                    quantity: "validation metric".to_string(),
                    value: metric,
                    epoch,
                    batch: 0,
                });
            }
            if let Some(stats) = &dev_stats {
                metrics.extend(stats.metrics("dev/"));
            }
            metrics.insert("dev/metric".to_string(), metric);
            dev_metric = Some(metric);

            self.set_state(TrainerState::CheckpointDecision);
            improved = self.best_metric.map_or(true, |best| metric < best);
            if improved {
                self.best_metric = Some(metric);
                self.best_epoch = Some(epoch);
                self.best_params = self.snapshot()?;
                self.bad_epochs = 0;
            } else if epoch >= self.config.warmup {
                self.bad_epochs += 1;
            }
        }

        self.update_penalties(&train_stats, epoch);
        for (name, w) in &self.penalty_weights {
            metrics.insert(format!("penalty/{name}"), *w);
        }
        metrics.insert("lr".to_string(), self.optimizer.learning_rate());

        tracing::info!(
            epoch,
            train_loss = train_stats.loss,
            dev_metric = ?dev_metric,
            improved,
            bad_epochs = self.bad_epochs,
            "epoch complete"
        );
        for sink in &mut self.sinks {
            sink.record(epoch, &metrics);
        }

        Ok(EpochLog {
            epoch,
            train_loss: train_stats.loss,
            dev_metric,
            improved,
            penalty_weights: self.penalty_weights.clone(),
        })
    }

    fn train_epoch<T>(&mut self, train: &mut T, epoch: usize) -> Result<PassStats>
    where
        T: BatchSource + ?Sized,
    {
        let params = self.param_tensors();
        let mut stats = PassStats::default();
        for (batch_idx, batch) in train.iter_batches()?.enumerate() {
            let batch = batch?;
            let out = self
                .problem
                .forward_with_weights(&batch, &self.penalty_weights)?;
            let loss = out.loss_value()?;
            if !loss.is_finite() {
                return Err(Error::NumericDivergence {
                    quantity: "loss".to_string(),
                    value: loss,
                    epoch,
                    batch: batch_idx,
                });
            }

            let grads = out.loss.backward()?;
            if !grads_finite(&grads, &params)? {
                return Err(Error::NumericDivergence {
                    quantity: "gradient".to_string(),
                    value: grad_norm(&grads, &params)?,
                    epoch,
                    batch: batch_idx,
                });
            }
            let grads = match self.config.clip_grad_norm {
                Some(max_norm) => clip_grad_norm(&grads, &params, max_norm)?.0,
                None => grads,
            };
            self.optimizer.zero_grad();
            self.optimizer.step(&grads)?;
            stats.add(&out)?;
        }
        stats
            .finish()
            .ok_or_else(|| Error::msg(format!("epoch {epoch}: training source produced no batches")))
    }

    /// Mean statistics over `source` with the declared weights, or `None`
    /// for an empty source.
    fn evaluate<S>(&self, source: &mut S) -> Result<Option<PassStats>>
    where
        S: BatchSource + ?Sized,
    {
        let mut stats = PassStats::default();
        for batch in source.iter_batches()? {
            let out = self.problem.forward(&batch?)?;
            stats.add(&out)?;
        }
        Ok(stats.finish())
    }

    fn score(&self, stats: &PassStats) -> Result<f64> {
        match &self.config.metric {
            ValidationMetric::Loss => Ok(stats.loss),
            ValidationMetric::Term(name) => stats
                .terms
                .get(name)
                .copied()
                .ok_or_else(|| Error::msg(format!("validation metric: no term named '{name}'"))),
            ValidationMetric::LossPlusViolation { factor } => {
                Ok(stats.loss + factor * stats.violations.values().sum::<f64>())
            }
        }
    }

    /// Grow the weight of every constraint whose mean training violation
    /// exceeds the tolerance, up to the cap.
    fn update_penalties(&mut self, stats: &PassStats, epoch: usize) {
        let Some(penalty) = self.config.penalty else {
            return;
        };
        for (name, weight) in self.penalty_weights.iter_mut() {
            let violation = stats.violations.get(name).copied().unwrap_or(0.0);
            if violation <= penalty.tolerance || *weight >= penalty.max_weight {
                continue;
            }
            let grown = (*weight * penalty.growth).min(penalty.max_weight);
            if grown > *weight {
                tracing::warn!(
                    epoch,
                    constraint = %name,
                    violation,
                    from = *weight,
                    to = grown,
                    "constraint violated, growing penalty weight"
                );
                *weight = grown;
            }
        }
    }

    /// Mean loss, term values and violations over a held-out source,
    /// under the declared weights.
    pub fn test<S>(&self, source: &mut S) -> Result<BTreeMap<String, f64>>
    where
        S: BatchSource + ?Sized,
    {
        let stats = no_grad(|| self.evaluate(source))?
            .ok_or_else(|| Error::msg("test source produced no batches"))?;
        Ok(stats.metrics(""))
    }

    /// Evaluate a single dictionary under the declared weights without
    /// recording gradients.
    pub fn predict(&self, batch: &DataDict) -> Result<ProblemOutput> {
        no_grad(|| self.problem.forward(batch))
    }

    /// The complete restorable state.
    pub fn checkpoint(&self) -> Result<TrainerCheckpoint> {
        let params = self
            .params
            .iter()
            .map(|(name, p)| {
                Ok(ParamSnapshot {
                    name: name.clone(),
                    shape: p.dims().to_vec(),
                    data: p.to_f64_vec()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let best_params = self
            .params
            .iter()
            .zip(&self.best_params)
            .map(|((name, p), data)| ParamSnapshot {
                name: name.clone(),
                shape: p.dims().to_vec(),
                data: data.clone(),
            })
            .collect();
        Ok(TrainerCheckpoint {
            epoch: self.epoch,
            best_epoch: self.best_epoch,
            best_metric: self.best_metric,
            bad_epochs: self.bad_epochs,
            penalty_weights: self.penalty_weights.clone(),
            params,
            best_params,
            optimizer: self.optimizer.state(),
        })
    }

    /// Load state produced by [`Trainer::checkpoint`].
    ///
    /// The checkpoint must describe the same parameters (names and shapes,
    /// in order) as this trainer's problem.
    pub fn restore(&mut self, ckpt: &TrainerCheckpoint) -> Result<()> {
        check_layout(&self.params, &ckpt.params)?;
        check_layout(&self.params, &ckpt.best_params)?;
        for name in ckpt.penalty_weights.keys() {
            if !self.penalty_weights.contains_key(name) {
                return Err(Error::msg(format!(
                    "checkpoint has a penalty weight for unknown constraint '{name}'"
                )));
            }
        }

        self.optimizer.load_state(&ckpt.optimizer)?;
        for ((_, p), snap) in self.params.iter().zip(&ckpt.params) {
            p.update_data_inplace(&snap.data)?;
        }
        self.best_params = ckpt.best_params.iter().map(|s| s.data.clone()).collect();
        self.penalty_weights.extend(ckpt.penalty_weights.clone());
        self.epoch = ckpt.epoch;
        self.best_epoch = ckpt.best_epoch;
        self.best_metric = ckpt.best_metric;
        self.bad_epochs = ckpt.bad_epochs;
        tracing::debug!(epoch = self.epoch, "restored trainer checkpoint");
        Ok(())
    }
}

fn check_layout(params: &[(String, Tensor)], snaps: &[ParamSnapshot]) -> Result<()> {
    if params.len() != snaps.len() {
        return Err(Error::msg(format!(
            "checkpoint holds {} parameters, problem has {}",
            snaps.len(),
            params.len()
        )));
    }
    for ((name, p), snap) in params.iter().zip(snaps) {
        if &snap.name != name || snap.shape != p.dims() {
            return Err(Error::msg(format!(
                "checkpoint parameter '{}' {:?} does not match '{name}' {:?}",
                snap.name,
                snap.shape,
                p.dims()
            )));
        }
    }
    Ok(())
}
