// Adam and AdamW
//
// Both keep first and second moment estimates per parameter with bias
// correction on the global step count t:
//
//   m ← β1·m + (1 − β1)·g
//   v ← β2·v + (1 − β2)·g²
//   p ← p − lr · m̂ / (√v̂ + ε)
//
// They differ only in weight decay. Adam folds it into the gradient
// (L2 penalty, g ← g + λ·p); AdamW applies it directly to the parameter
// (p ← p − lr·λ·p), decoupled from the adaptive scaling.

use tether_core::{GradStore, Result, Tensor};

use crate::optimizer::{load_buffers, store_buffers, Optimizer, OptimizerState};

/// Adam hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment buffers and step counter shared by Adam and AdamW.
struct Moments {
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
    t: u64,
}

impl Moments {
    fn zeros(params: &[Tensor]) -> Self {
        Moments {
            m: params.iter().map(|p| vec![0.0; p.elem_count()]).collect(),
            v: params.iter().map(|p| vec![0.0; p.elem_count()]).collect(),
            t: 0,
        }
    }

    fn step(
        &mut self,
        params: &[Tensor],
        grads: &GradStore,
        lr: f64,
        cfg: &AdamConfig,
        decoupled: bool,
    ) -> Result<()> {
        self.t += 1;
        let bc1_inv = 1.0 / (1.0 - cfg.beta1.powi(self.t as i32));
        let bc2_inv = 1.0 / (1.0 - cfg.beta2.powi(self.t as i32));

        for (i, p) in params.iter().enumerate() {
            let grad = match grads.get(p) {
                Some(g) => g.to_f64_vec()?,
                None => continue,
            };
            let mut data = p.to_f64_vec()?;
            let (m, v) = (&mut self.m[i], &mut self.v[i]);
            for j in 0..data.len() {
                let mut g = grad[j];
                if !decoupled {
                    g += cfg.weight_decay * data[j];
                }
                m[j] = cfg.beta1 * m[j] + (1.0 - cfg.beta1) * g;
                v[j] = cfg.beta2 * v[j] + (1.0 - cfg.beta2) * g * g;
                let m_hat = m[j] * bc1_inv;
                let v_hat = v[j] * bc2_inv;
                let mut update = m_hat / (v_hat.sqrt() + cfg.eps);
                if decoupled {
                    update += cfg.weight_decay * data[j];
                }
                data[j] -= lr * update;
            }
            p.update_data_inplace(&data)?;
        }
        Ok(())
    }

    fn save(&self, state: &mut OptimizerState, lr: f64, cfg: &AdamConfig) {
        state.set_scalar("lr", lr);
        state.set_scalar("beta1", cfg.beta1);
        state.set_scalar("beta2", cfg.beta2);
        state.set_scalar("eps", cfg.eps);
        state.set_scalar("weight_decay", cfg.weight_decay);
        state.set_scalar("t", self.t as f64);
        store_buffers(state, "m", &self.m);
        store_buffers(state, "v", &self.v);
    }

    fn load(&mut self, state: &OptimizerState, lr: &mut f64, cfg: &mut AdamConfig) -> Result<()> {
        let scalar = |k: &str, slot: &mut f64| {
            if let Some(v) = state.get_scalar(k) {
                *slot = v;
            }
        };
        scalar("lr", lr);
        scalar("beta1", &mut cfg.beta1);
        scalar("beta2", &mut cfg.beta2);
        scalar("eps", &mut cfg.eps);
        scalar("weight_decay", &mut cfg.weight_decay);
        if let Some(t) = state.get_scalar("t") {
            self.t = t as u64;
        }
        load_buffers(state, "m", &mut self.m)?;
        load_buffers(state, "v", &mut self.v)
    }
}

macro_rules! adam_builder {
    ($ty:ident) => {
        impl $ty {
            pub fn beta1(mut self, beta1: f64) -> Self {
                self.config.beta1 = beta1;
                self
            }

            pub fn beta2(mut self, beta2: f64) -> Self {
                self.config.beta2 = beta2;
                self
            }

            pub fn epsilon(mut self, eps: f64) -> Self {
                self.config.eps = eps;
                self
            }

            pub fn weight_decay(mut self, weight_decay: f64) -> Self {
                self.config.weight_decay = weight_decay;
                self
            }

            pub fn config(&self) -> &AdamConfig {
                &self.config
            }

            /// Number of steps taken so far.
            pub fn step_count(&self) -> u64 {
                self.moments.t
            }
        }
    };
}

/// Adam with L2 weight decay folded into the gradient.
pub struct Adam {
    params: Vec<Tensor>,
    lr: f64,
    config: AdamConfig,
    moments: Moments,
}

impl Adam {
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        let moments = Moments::zeros(&params);
        Adam {
            params,
            lr,
            config: AdamConfig::default(),
            moments,
        }
    }
}

adam_builder!(Adam);

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.moments
            .step(&self.params, grads, self.lr, &self.config, false)
    }

    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new("Adam");
        self.moments.save(&mut state, self.lr, &self.config);
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        state.check_type("Adam")?;
        self.moments.load(state, &mut self.lr, &mut self.config)
    }
}

/// Adam with decoupled weight decay.
pub struct AdamW {
    params: Vec<Tensor>,
    lr: f64,
    config: AdamConfig,
    moments: Moments,
}

impl AdamW {
    /// Defaults to weight decay 0.01.
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        let moments = Moments::zeros(&params);
        AdamW {
            params,
            lr,
            config: AdamConfig {
                weight_decay: 0.01,
                ..AdamConfig::default()
            },
            moments,
        }
    }
}

adam_builder!(AdamW);

impl Optimizer for AdamW {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.moments
            .step(&self.params, grads, self.lr, &self.config, true)
    }

    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new("AdamW");
        self.moments.save(&mut state, self.lr, &self.config);
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        state.check_type("AdamW")?;
        self.moments.load(state, &mut self.lr, &mut self.config)
    }
}
