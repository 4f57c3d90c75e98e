//! SMBR denominator: forward-backward carrying per-arc accuracies.
//!
//! Every arc's accuracy is the numerator posterior of its pdf at that
//! frame (already silence-masked by the driver when requested). The
//! forward pass tracks, next to the plain alpha, an accuracy-weighted
//! companion accumulating expected accuracy along all paths; the
//! backward computes the gradient of the expected frame accuracy, plus
//! the MMI denominator term so the caller gets both objectives from a
//! single pass.

use ndarray::{Array1, Array2, Array3};
use tracing::warn;

use super::{DenominatorComputation, ALPHA_BETA_CHECK_TOLERANCE};
use crate::config::ChainTrainingOptions;
use crate::graph::DenominatorGraph;

/// Result of the SMBR forward pass.
#[derive(Debug, Clone, Copy)]
pub struct SmbrForward {
    /// Expected frame accuracy summed over sequences, scaled by
    /// `smbr_factor`.
    pub smbr_objf: f32,
    /// `-log Z_den` summed over sequences, so the caller can form the
    /// MMI term without a second denominator pass.
    pub neg_log_z: f32,
    pub ok: bool,
}

/// Per-minibatch SMBR denominator computation.
///
/// The accuracy-weighted tables share the plain tables' per-row scale
/// factors, so the stored ratios are the true ones; the weighted alpha
/// grows only linearly in `t` relative to the plain alpha (bounded by
/// the frame count), which keeps the shared rescaling sufficient.
pub struct DenominatorSmbrComputation<'a> {
    base: DenominatorComputation<'a>,
    /// Numerator posteriors consumed as per-arc accuracies, `(T*S, P)`.
    accuracies: &'a Array2<f32>,
    smbr_factor: f32,
    alpha_smbr: Array3<f32>,
    /// Per-sequence expected frame accuracy (unscaled).
    seq_objf: Array1<f32>,
}

impl<'a> DenominatorSmbrComputation<'a> {
    /// Set up the computation.
    ///
    /// # Panics
    ///
    /// Panics on shape mismatches between the score matrix, the
    /// accuracy matrix, and the graph.
    pub fn new(
        opts: &ChainTrainingOptions,
        graph: &'a DenominatorGraph,
        num_sequences: usize,
        x: &Array2<f32>,
        accuracies: &'a Array2<f32>,
    ) -> Self {
        assert_eq!(
            accuracies.dim(),
            x.dim(),
            "accuracy matrix shape mismatch"
        );
        let base = DenominatorComputation::new(opts, graph, num_sequences, x);
        let (t_count, s_count) = base.geometry();
        let n = graph.num_states();
        Self {
            base,
            accuracies,
            smbr_factor: opts.smbr_factor,
            alpha_smbr: Array3::zeros((t_count + 1, s_count, n)),
            seq_objf: Array1::zeros(s_count),
        }
    }

    /// Forward pass over both the plain and the accuracy-weighted
    /// tables.
    pub fn forward_smbr(&mut self) -> SmbrForward {
        let graph = self.base.graph;
        let (t_count, s_count) = self.base.geometry();
        let n = graph.num_states();
        let init = graph.initial_probs();
        let kappa = self.base.leaky_coefficient;
        let mut ok = true;

        for s in 0..s_count {
            for i in 0..n {
                self.base.alpha[[0, s, i]] = init[i];
                self.alpha_smbr[[0, s, i]] = 0.0;
            }
        }

        let mut next = vec![0.0f32; n];
        let mut next_smbr = vec![0.0f32; n];
        for t in 1..=t_count {
            for s in 0..s_count {
                let col = (t - 1) * s_count + s;
                for j in 0..n {
                    let mut sum = 0.0f32;
                    let mut sum_smbr = 0.0f32;
                    for tr in graph.arcs_into(j) {
                        let i = tr.state as usize;
                        let pe = tr.prob * self.base.exp_x_t[[tr.pdf as usize, col]];
                        let a_prev = self.base.alpha[[t - 1, s, i]];
                        let acc = self.accuracies[[col, tr.pdf as usize]];
                        sum += a_prev * pe;
                        sum_smbr += (self.alpha_smbr[[t - 1, s, i]] + a_prev * acc) * pe;
                    }
                    next[j] = sum;
                    next_smbr[j] = sum_smbr;
                }
                let tot: f32 = next.iter().zip(init.iter()).map(|(a, i)| a * i).sum();
                let tot_smbr: f32 = next_smbr.iter().zip(init.iter()).map(|(a, i)| a * i).sum();
                let mut row_sum = 0.0f32;
                for j in 0..n {
                    next[j] = (1.0 - kappa) * next[j] + kappa * tot * init[j];
                    next_smbr[j] = (1.0 - kappa) * next_smbr[j] + kappa * tot_smbr * init[j];
                    row_sum += next[j];
                }
                if !(row_sum > 0.0 && row_sum.is_finite()) {
                    ok = false;
                    self.base.scale[[t, s]] = 1.0;
                    continue;
                }
                let c = 1.0 / row_sum;
                self.base.scale[[t, s]] = c;
                for j in 0..n {
                    self.base.alpha[[t, s, j]] = next[j] * c;
                    self.alpha_smbr[[t, s, j]] = next_smbr[j] * c;
                }
            }
        }

        let mut log_z = 0.0f64;
        let mut tot_objf = 0.0f64;
        for s in 0..s_count {
            let tot: f32 = (0..n)
                .map(|j| self.base.alpha[[t_count, s, j]] * init[j])
                .sum();
            self.base.tot_prob[s] = tot;
            let objf_s = if tot > 0.0 {
                (0..n)
                    .map(|j| self.alpha_smbr[[t_count, s, j]] * init[j])
                    .sum::<f32>()
                    / tot
            } else {
                ok = false;
                0.0
            };
            self.seq_objf[s] = objf_s;
            tot_objf += f64::from(objf_s);
            let mut log_z_s = f64::from(tot.max(0.0).ln());
            for t in 1..=t_count {
                log_z_s -= f64::from(self.base.scale[[t, s]].ln());
            }
            if !log_z_s.is_finite() {
                ok = false;
            }
            log_z += log_z_s;
        }

        self.base.log_z = log_z;
        self.base.forward_ok = ok;
        self.base.forward_done = true;
        SmbrForward {
            smbr_objf: self.smbr_factor * tot_objf as f32,
            neg_log_z: -(log_z as f32),
            ok,
        }
    }

    /// Backward pass. Accumulates
    /// `weight * (smbr_factor * d(acc)/dX - d(log Z_den)/dX)` into
    /// `deriv`; the numerator MMI posterior is added by the driver.
    /// Returns false when the forward failed or a self-consistency
    /// check does not hold.
    pub fn backward_smbr(&mut self, weight: f32, deriv: &mut Array2<f32>) -> bool {
        assert!(self.base.forward_done, "backward called before forward");
        let (t_count, s_count) = self.base.geometry();
        assert_eq!(
            deriv.dim(),
            (t_count * s_count, self.base.graph.num_pdfs()),
            "derivative buffer shape mismatch"
        );
        if !self.base.forward_ok {
            return false;
        }

        let graph = self.base.graph;
        let n = graph.num_states();
        let init = graph.initial_probs();
        let kappa = self.base.leaky_coefficient;
        let smbr_factor = self.smbr_factor;

        let mut beta_dash = Array2::<f32>::zeros((s_count, n));
        let mut beta_dash_smbr = Array2::<f32>::zeros((s_count, n));
        let mut beta_dash_prev = Array2::<f32>::zeros((s_count, n));
        let mut beta_dash_smbr_prev = Array2::<f32>::zeros((s_count, n));
        let mut beta = vec![0.0f32; n];
        let mut beta_smbr = vec![0.0f32; n];
        for s in 0..s_count {
            if !(self.base.tot_prob[s] > 0.0) {
                return false;
            }
            let head = self.base.scale[[t_count, s]] / self.base.tot_prob[s];
            for i in 0..n {
                beta_dash[[s, i]] = init[i] * head;
            }
        }

        for t in (0..t_count).rev() {
            for s in 0..s_count {
                let col = t * s_count + s;
                let tot: f32 = (0..n).map(|j| beta_dash[[s, j]] * init[j]).sum();
                let tot_smbr: f32 = (0..n).map(|j| beta_dash_smbr[[s, j]] * init[j]).sum();
                for j in 0..n {
                    beta[j] = (1.0 - kappa) * beta_dash[[s, j]] + kappa * tot * init[j];
                    beta_smbr[j] =
                        (1.0 - kappa) * beta_dash_smbr[[s, j]] + kappa * tot_smbr * init[j];
                }
                let c = self.base.scale[[t, s]];
                let objf_s = self.seq_objf[s];
                for i in 0..n {
                    let a = self.base.alpha[[t, s, i]];
                    let r_alpha = if a > 0.0 {
                        self.alpha_smbr[[t, s, i]] / a
                    } else {
                        0.0
                    };
                    let mut sum = 0.0f32;
                    let mut sum_smbr = 0.0f32;
                    for tr in graph.arcs_from(i) {
                        let j = tr.state as usize;
                        let pdf = tr.pdf as usize;
                        let pe = tr.prob * self.base.exp_x_t[[pdf, col]];
                        let acc = self.accuracies[[col, pdf]];
                        let term = pe * beta[j];
                        let occupancy = a * term;
                        let r_beta = if beta[j] > 0.0 {
                            beta_smbr[j] / beta[j]
                        } else {
                            0.0
                        };
                        deriv[[col, pdf]] += weight
                            * (smbr_factor * occupancy * (r_alpha + acc + r_beta - objf_s)
                                - occupancy);
                        sum += term;
                        sum_smbr += pe * (beta_smbr[j] + acc * beta[j]);
                    }
                    beta_dash_prev[[s, i]] = sum * c;
                    beta_dash_smbr_prev[[s, i]] = sum_smbr * c;
                }
            }
            std::mem::swap(&mut beta_dash, &mut beta_dash_prev);
            std::mem::swap(&mut beta_dash_smbr, &mut beta_dash_smbr_prev);
        }

        // Frame-0 identities: the plain product is one per sequence and
        // the accuracy-weighted product recovers the sequence objective.
        let mut error = 0.0f64;
        for s in 0..s_count {
            let tot: f32 = (0..n)
                .map(|j| self.base.alpha[[0, s, j]] * beta_dash[[s, j]])
                .sum();
            if !(tot > 0.0 && tot.is_finite()) {
                warn!(sequence = s, total = tot, "SMBR alpha/beta product invalid");
                return false;
            }
            error += f64::from(tot.ln());
            let tot_smbr: f32 = (0..n)
                .map(|j| self.base.alpha[[0, s, j]] * beta_dash_smbr[[s, j]])
                .sum();
            let objf_s = self.seq_objf[s];
            let smbr_tolerance = ALPHA_BETA_CHECK_TOLERANCE * objf_s.abs().max(1.0);
            if (tot_smbr - objf_s).abs() > smbr_tolerance {
                warn!(
                    sequence = s,
                    recovered = tot_smbr,
                    expected = objf_s,
                    "SMBR accuracy consistency check failed"
                );
                return false;
            }
        }
        let tolerance = ALPHA_BETA_CHECK_TOLERANCE * (self.base.log_z.abs() as f32).max(1.0);
        if error.abs() as f32 > tolerance {
            warn!(
                error,
                tolerance, "SMBR alpha/beta consistency check failed"
            );
            return false;
        }
        true
    }
}
