// Loss functions
//
// Both losses compare a prediction with a target of a broadcast-compatible
// shape and, under the default reduction, return a scalar so backward()
// works directly.
//
//   MSE: mean((pred - target)²)
//   L1:  mean(|pred - target|)

use tether_core::{Result, Tensor};

/// How per-element losses are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// Mean of all per-element losses.
    #[default]
    Mean,
    /// Sum of all per-element losses.
    Sum,
    /// Per-element losses without reduction.
    None,
}

fn apply_reduction(loss: &Tensor, reduction: Reduction) -> Result<Tensor> {
    match reduction {
        Reduction::Mean => loss.mean_all(),
        Reduction::Sum => loss.sum_all(),
        Reduction::None => Ok(loss.clone()),
    }
}

/// Mean squared error.
pub fn mse_loss(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    mse_loss_with_reduction(prediction, target, Reduction::Mean)
}

pub fn mse_loss_with_reduction(
    prediction: &Tensor,
    target: &Tensor,
    reduction: Reduction,
) -> Result<Tensor> {
    let sq = prediction.sub(target)?.square()?;
    apply_reduction(&sq, reduction)
}

/// Mean absolute error.
pub fn l1_loss(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    l1_loss_with_reduction(prediction, target, Reduction::Mean)
}

pub fn l1_loss_with_reduction(
    prediction: &Tensor,
    target: &Tensor,
    reduction: Reduction,
) -> Result<Tensor> {
    let abs = prediction.sub(target)?.abs()?;
    apply_reduction(&abs, reduction)
}
