// Trainer configuration
//
// Plain structs with builder methods and serde support. Every field has a
// default, so a JSON file only needs the fields it changes:
//
//   {
//     "epochs": 200,
//     "patience": 10,
//     "metric": { "loss_plus_violation": { "factor": 10.0 } },
//     "penalty": { "tolerance": 1e-4, "growth": 2.0, "max_weight": 1e3 }
//   }

use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_core::{Error, Result};

/// What the validation pass is scored by (lower is better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMetric {
    /// Total loss under the declared term weights.
    #[default]
    Loss,
    /// The weighted value of one named term.
    Term(String),
    /// Loss plus `factor` times the summed mean constraint violations.
    LossPlusViolation { factor: f64 },
}

/// Penalty-weight growth for violated constraints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    /// Mean violation above which a constraint's weight grows.
    pub tolerance: f64,
    /// Multiplicative growth per epoch (≥ 1).
    pub growth: f64,
    /// Cap on any constraint weight.
    pub max_weight: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        PenaltyConfig {
            tolerance: 1e-4,
            growth: 2.0,
            max_weight: 1e4,
        }
    }
}

/// Settings for [`Trainer`](crate::Trainer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Epoch budget.
    pub epochs: usize,
    /// Non-improving validations tolerated before stopping.
    pub patience: usize,
    /// Leading epochs during which patience is not counted.
    pub warmup: usize,
    /// Validate every this many epochs (and always on the last).
    pub eval_every: usize,
    /// Stop as Converged once the best metric reaches this value.
    pub target_metric: Option<f64>,
    /// Clip the global gradient norm to this value.
    pub clip_grad_norm: Option<f64>,
    pub metric: ValidationMetric,
    /// Penalty scheduling; disabled when absent.
    pub penalty: Option<PenaltyConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            epochs: 100,
            patience: 5,
            warmup: 0,
            eval_every: 1,
            target_metric: None,
            clip_grad_norm: None,
            metric: ValidationMetric::Loss,
            penalty: None,
        }
    }
}

impl TrainerConfig {
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn eval_every(mut self, n: usize) -> Self {
        self.eval_every = n;
        self
    }

    pub fn target_metric(mut self, target: f64) -> Self {
        self.target_metric = Some(target);
        self
    }

    pub fn clip_grad_norm(mut self, max_norm: f64) -> Self {
        self.clip_grad_norm = Some(max_norm);
        self
    }

    pub fn metric(mut self, metric: ValidationMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn penalty(mut self, penalty: PenaltyConfig) -> Self {
        self.penalty = Some(penalty);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::msg("trainer config: epochs must be at least 1"));
        }
        if self.eval_every == 0 {
            return Err(Error::msg("trainer config: eval_every must be at least 1"));
        }
        if let Some(max) = self.clip_grad_norm {
            if !(max.is_finite() && max > 0.0) {
                return Err(Error::msg(format!(
                    "trainer config: clip_grad_norm must be positive, got {max}"
                )));
            }
        }
        if let ValidationMetric::LossPlusViolation { factor } = self.metric {
            if !(factor.is_finite() && factor >= 0.0) {
                return Err(Error::msg(format!(
                    "trainer config: violation factor must be non-negative, got {factor}"
                )));
            }
        }
        if let Some(p) = &self.penalty {
            if !(p.tolerance.is_finite() && p.tolerance >= 0.0) {
                return Err(Error::msg("trainer config: penalty tolerance must be non-negative"));
            }
            if !(p.growth.is_finite() && p.growth >= 1.0) {
                return Err(Error::msg(format!(
                    "trainer config: penalty growth must be at least 1, got {}",
                    p.growth
                )));
            }
            if !(p.max_weight.is_finite() && p.max_weight >= 0.0) {
                return Err(Error::msg("trainer config: penalty max_weight must be non-negative"));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: TrainerConfig = serde_json::from_str(s)
            .map_err(|e| Error::msg(format!("invalid trainer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::msg(format!("cannot serialize trainer config: {e}")))
    }
}
