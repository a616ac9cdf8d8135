//! Log-space interpolation of model and retrieval distributions.
//!
//! `P = (1 - λ) · P_model + λ · P_retrieval` is evaluated as
//! `logsumexp(log P_model + ln(1 - λ), log P_retrieval + ln λ)` so that
//! neither term is ever exponentiated on its own.

use crate::error::{EvalError, Result};

/// Numerically stable `ln(Σ exp(xᵢ))`. Returns `-inf` for an empty or all `-inf` slice.
pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// `ln(exp(a) + exp(b))`.
pub fn log_add(a: f32, b: f32) -> f32 {
    let max = a.max(b);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Check that a mixing weight lies strictly inside `(0, 1)`.
pub fn validate_lambda(lambda: f32) -> Result<()> {
    if lambda > 0.0 && lambda < 1.0 {
        Ok(())
    } else {
        Err(EvalError::InvalidConfiguration(format!(
            "interpolation weight must be in (0, 1), got {}",
            lambda
        )))
    }
}

/// Interpolate one retrieval log-probability with one model log-probability.
pub fn combine_log_probs(retrieval: f32, model: f32, lambda: f32) -> f32 {
    log_add(model + (1.0 - lambda).ln(), retrieval + lambda.ln())
}

/// Interpolate elementwise, overwriting `model` with the mixture.
pub fn combine_in_place(model: &mut [f32], retrieval: &[f32], lambda: f32) -> Result<()> {
    if model.len() != retrieval.len() {
        return Err(EvalError::Shape(format!(
            "cannot combine {} model values with {} retrieval values",
            model.len(),
            retrieval.len()
        )));
    }
    let model_weight = (1.0 - lambda).ln();
    let retrieval_weight = lambda.ln();
    for (m, &r) in model.iter_mut().zip(retrieval) {
        *m = log_add(*m + model_weight, r + retrieval_weight);
    }
    Ok(())
}
