// nn::init — Parameter initialization
//
//   uniform(shape, low, high)       — U(low, high)
//   normal(shape, mean, std)        — N(mean, std)
//   constant(shape, val)            — all elements = val
//   zeros(shape)                    — all zeros
//   xavier_uniform(shape, gain)     — Glorot uniform
//   kaiming_uniform(shape, a, mode) — He uniform (for ReLU)
//
// Every function returns a leaf tensor with `set_variable()` already
// applied. The `_with` variants take an explicit generator so a seeded run
// reproduces its initial parameters.

use rand::Rng;
use tether_core::{Result, Shape, Tensor};

/// Fan computation mode for Kaiming initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanMode {
    /// Use fan_in (input features).
    #[default]
    FanIn,
    /// Use fan_out (output features).
    FanOut,
}

/// Compute (fan_in, fan_out) from a shape.
///
/// - For 1-D: fan_in = fan_out = dims[0]
/// - For 2-D: fan_in = dims[1], fan_out = dims[0]
fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        _ => {
            let receptive_field: usize = dims[2..].iter().product();
            (
                (dims[1] * receptive_field) as f64,
                (dims[0] * receptive_field) as f64,
            )
        }
    }
}

/// Initialize from U(low, high).
pub fn uniform(shape: impl Into<Shape>, low: f64, high: f64) -> Result<Tensor> {
    uniform_with(shape, low, high, &mut rand::thread_rng())
}

/// Initialize from U(low, high) using the given generator.
pub fn uniform_with<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| low + (high - low) * rng.gen::<f64>())
        .collect();
    Ok(Tensor::from_vec(data, shape)?.set_variable())
}

/// Initialize from N(mean, std).
pub fn normal(shape: impl Into<Shape>, mean: f64, std: f64) -> Result<Tensor> {
    let t = Tensor::randn(shape)?;
    let data: Vec<f64> = t.to_f64_vec()?.iter().map(|z| mean + std * z).collect();
    Ok(Tensor::from_vec(data, t.shape().clone())?.set_variable())
}

/// Initialize with a constant value.
pub fn constant(shape: impl Into<Shape>, val: f64) -> Result<Tensor> {
    Ok(Tensor::full(shape, val)?.set_variable())
}

/// Initialize with all zeros.
pub fn zeros(shape: impl Into<Shape>) -> Result<Tensor> {
    constant(shape, 0.0)
}

/// Xavier (Glorot) uniform: U(-a, a) with a = gain * sqrt(6 / (fan_in + fan_out)).
pub fn xavier_uniform(shape: impl Into<Shape>, gain: f64) -> Result<Tensor> {
    let shape = shape.into();
    let (fan_in, fan_out) = compute_fans(&shape);
    let a = gain * (6.0 / (fan_in + fan_out)).sqrt();
    uniform(shape, -a, a)
}

/// Kaiming (He) uniform: U(-bound, bound) with bound = sqrt(3 * gain² / fan).
///
/// `a` is the negative slope of the rectifier (0 for ReLU).
pub fn kaiming_uniform(shape: impl Into<Shape>, a: f64, mode: FanMode) -> Result<Tensor> {
    kaiming_uniform_with(shape, a, mode, &mut rand::thread_rng())
}

pub fn kaiming_uniform_with<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    a: f64,
    mode: FanMode,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let (fan_in, fan_out) = compute_fans(&shape);
    let fan = match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    };
    let gain_sq = 2.0 / (1.0 + a * a);
    let bound = (3.0 * gain_sq / fan).sqrt();
    uniform_with(shape, -bound, bound, rng)
}
