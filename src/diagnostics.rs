//! Objective accumulation for evaluation loops.
//!
//! Evaluation runs the drivers over a held-out set and averages the
//! returned terms; [`ObjectiveInfo`] does the bookkeeping. The
//! cross-entropy objective of a softmax-regularized output is the
//! elementwise product of that output with the numerator posterior the
//! driver wrote to the xent buffer.

use ndarray::Array2;

use crate::objective::ObjectiveResult;

/// Running totals over minibatches for one objective.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObjectiveInfo {
    /// Sum of minibatch weights (`weight` from the driver).
    pub tot_weight: f64,
    /// Sum of objective values.
    pub tot_like: f64,
    /// Sum of auxiliary (regularization) terms.
    pub tot_aux_objf: f64,
    /// Minibatches accumulated.
    pub minibatches: u64,
}

impl ObjectiveInfo {
    /// Fold in one driver result.
    pub fn accumulate(&mut self, result: &ObjectiveResult) {
        self.add(result.objf, result.l2_term, result.weight);
    }

    /// Fold in raw terms (for the SMBR driver, pass
    /// `objf + mmi_objf`).
    pub fn add(&mut self, objf: f32, aux_objf: f32, weight: f32) {
        self.tot_like += f64::from(objf);
        self.tot_aux_objf += f64::from(aux_objf);
        self.tot_weight += f64::from(weight);
        self.minibatches += 1;
    }

    /// Average objective per frame, including auxiliary terms, or
    /// `None` before any data arrived.
    #[must_use]
    pub fn objf_per_frame(&self) -> Option<f64> {
        (self.tot_weight > 0.0).then(|| (self.tot_like + self.tot_aux_objf) / self.tot_weight)
    }
}

/// Cross-entropy objective: the sum over entries of the (log-softmax)
/// xent output times the weighted numerator posterior. Both factors
/// carry the supervision weight consistently with the accumulated
/// `weight`.
#[must_use]
pub fn xent_objective(xent_output: &Array2<f32>, xent_deriv: &Array2<f32>) -> f32 {
    assert_eq!(
        xent_output.dim(),
        xent_deriv.dim(),
        "xent matrices shape mismatch"
    );
    let total: f64 = xent_output
        .iter()
        .zip(xent_deriv.iter())
        .map(|(&o, &p)| f64::from(o) * f64::from(p))
        .sum();
    total as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_accumulates_and_averages() {
        let mut info = ObjectiveInfo::default();
        assert_eq!(info.objf_per_frame(), None);

        info.accumulate(&ObjectiveResult {
            objf: -6.0,
            l2_term: -0.5,
            weight: 10.0,
        });
        info.accumulate(&ObjectiveResult {
            objf: -3.0,
            l2_term: -0.5,
            weight: 10.0,
        });
        assert_eq!(info.minibatches, 2);
        assert_relative_eq!(info.objf_per_frame().unwrap(), -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_xent_objective_is_weighted_trace() {
        let output = array![[-0.5, -1.5], [-2.0, -0.1]];
        let posterior = array![[1.0, 0.0], [0.0, 1.0]];
        assert_relative_eq!(
            xent_objective(&output, &posterior),
            -0.5 - 0.1,
            epsilon = 1e-6
        );
    }
}
