//! Log-space helpers for the numerator recursions.
//!
//! The denominator works in a rescaled linear domain and does not need
//! these; the numerator forward-backward runs fully in log space to
//! survive long products of sub-unit weights.

/// Numerically stable `log(exp(a) + exp(b))`.
///
/// Handles the cases where `a` or `b` are negative infinity.
#[inline]
pub(crate) fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Log-sum-exp over a slice.
pub(crate) fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}
