// Gradient utilities: global norm, norm clipping, value clipping.

use tether_core::{GradStore, Result, Tensor};

/// Global L2 norm of the gradients of `params`.
///
/// Parameters without a gradient contribute nothing.
pub fn grad_norm(grads: &GradStore, params: &[Tensor]) -> Result<f64> {
    let mut total = 0.0;
    for p in params {
        if let Some(g) = grads.get(p) {
            total += g.to_f64_vec()?.iter().map(|v| v * v).sum::<f64>();
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`.
///
/// Returns the clipped store together with the norm measured before
/// clipping. A non-finite norm is returned as-is with the store unchanged,
/// leaving the caller to decide how to treat divergence.
pub fn clip_grad_norm(
    grads: &GradStore,
    params: &[Tensor],
    max_norm: f64,
) -> Result<(GradStore, f64)> {
    let total = grad_norm(grads, params)?;
    if !total.is_finite() || total <= max_norm {
        return Ok((grads.clone(), total));
    }
    let scale = max_norm / (total + 1e-12);
    tracing::debug!(norm = total, max_norm, "clipping gradients");
    let mut clipped = grads.clone();
    for p in params {
        if let Some(g) = grads.get(p) {
            clipped.insert(p.id(), g.mul_scalar(scale)?);
        }
    }
    Ok((clipped, total))
}

/// Clamp every gradient element of `params` to [-max_value, max_value].
pub fn clip_grad_value(grads: &GradStore, params: &[Tensor], max_value: f64) -> Result<GradStore> {
    let mut clipped = grads.clone();
    for p in params {
        if let Some(g) = grads.get(p) {
            clipped.insert(p.id(), g.clamp(-max_value, max_value)?);
        }
    }
    Ok(clipped)
}

/// Whether every gradient of `params` is finite.
pub fn grads_finite(grads: &GradStore, params: &[Tensor]) -> Result<bool> {
    for p in params {
        if let Some(g) = grads.get(p) {
            if !g.is_finite()? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
