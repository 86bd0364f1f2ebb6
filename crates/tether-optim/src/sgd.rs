// SGD — stochastic gradient descent with optional momentum
//
//   g ← g + weight_decay · p
//   v ← momentum · v + g
//   p ← p − lr · v
//
// With momentum = 0 this is plain gradient descent.

use tether_core::{GradStore, Result, Tensor};

use crate::optimizer::{load_buffers, store_buffers, Optimizer, OptimizerState};

pub struct SGD {
    params: Vec<Tensor>,
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: Vec<Vec<f64>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f64, momentum: f64, weight_decay: f64) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.elem_count()]).collect();
        SGD {
            params,
            lr,
            momentum,
            weight_decay,
            velocity,
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (p, vel) in self.params.iter().zip(self.velocity.iter_mut()) {
            let grad = match grads.get(p) {
                Some(g) => g.to_f64_vec()?,
                None => continue,
            };
            let mut data = p.to_f64_vec()?;
            for ((x, v), g) in data.iter_mut().zip(vel.iter_mut()).zip(grad) {
                let g = g + self.weight_decay * *x;
                *v = self.momentum * *v + g;
                *x -= self.lr * *v;
            }
            p.update_data_inplace(&data)?;
        }
        Ok(())
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
        let mut state = OptimizerState::new("SGD");
        state.set_scalar("lr", self.lr);
        state.set_scalar("momentum", self.momentum);
        state.set_scalar("weight_decay", self.weight_decay);
        store_buffers(&mut state, "velocity", &self.velocity);
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        state.check_type("SGD")?;
        if let Some(lr) = state.get_scalar("lr") {
            self.lr = lr;
        }
        if let Some(m) = state.get_scalar("momentum") {
            self.momentum = m;
        }
        if let Some(wd) = state.get_scalar("weight_decay") {
            self.weight_decay = wd;
        }
        load_buffers(state, "velocity", &mut self.velocity)
    }
}
