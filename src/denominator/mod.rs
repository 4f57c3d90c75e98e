//! Denominator forward-backward with leaky-HMM smoothing.
//!
//! The recursion runs in a rescaled linear domain rather than log
//! space: every alpha row is renormalized to sum to one and the scale
//! factors are accumulated separately, which keeps the per-frame kernel
//! a plain multiply-add over the arc list (the GPU-friendly shape) with
//! no exp/log in the inner loop.
//!
//! The leaky-HMM transform is the symmetric rank-one mix
//! `L = (1-kappa) * I + kappa * init * init^T`: conceptually an
//! epsilon-arc from every state to a pivot with probability one and
//! from the pivot back to state `j` with probability
//! `kappa * init[j]`. The closed form assumes `kappa` is small enough
//! that epsilon self-loops are negligible; `kappa <= 0` is refused at
//! options validation.

mod smbr;

pub use smbr::{DenominatorSmbrComputation, SmbrForward};

use ndarray::{Array1, Array2, Array3};
use tracing::warn;

use crate::config::ChainTrainingOptions;
use crate::graph::DenominatorGraph;

/// Relative tolerance for the alpha/beta self-consistency check at the
/// end of the backward pass, applied as
/// `|error| <= tol * max(1, |log Z|)`.
pub const ALPHA_BETA_CHECK_TOLERANCE: f32 = 1e-4;

/// Per-minibatch denominator computation.
///
/// Owns the transposed exp-score scratch (`(P, T*S)`, the largest
/// transient of the whole objective computation), the alpha table, and
/// the per-row scale factors. All of it is released when the value is
/// dropped; the driver scopes the computation so this happens before
/// any cross-entropy buffer is written.
pub struct DenominatorComputation<'a> {
    graph: &'a DenominatorGraph,
    num_sequences: usize,
    frames_per_sequence: usize,
    leaky_coefficient: f32,
    /// `exp(X)` transposed to `(P, T*S)` so a frame/sequence pair is a
    /// contiguous column index for every pdf row.
    exp_x_t: Array2<f32>,
    /// Alpha, `(T+1, S, N)`, each row rescaled to sum to one.
    alpha: Array3<f32>,
    /// Per-row scale multipliers `c`, `(T+1, S)`; true alpha is the
    /// stored row divided by the running product of `c`.
    scale: Array2<f32>,
    /// Per-sequence final total `sum_j alpha(T, j) * init(j)`.
    tot_prob: Array1<f32>,
    log_z: f64,
    forward_ok: bool,
    forward_done: bool,
}

impl<'a> DenominatorComputation<'a> {
    /// Set up the computation and materialize the exp-score transpose.
    ///
    /// # Panics
    ///
    /// Panics if the score matrix columns do not match the graph's pdf
    /// count or its rows are not a multiple of `num_sequences`.
    pub fn new(
        opts: &ChainTrainingOptions,
        graph: &'a DenominatorGraph,
        num_sequences: usize,
        x: &Array2<f32>,
    ) -> Self {
        assert_eq!(
            x.ncols(),
            graph.num_pdfs(),
            "score matrix has {} columns, graph has {} pdfs",
            x.ncols(),
            graph.num_pdfs()
        );
        assert!(num_sequences > 0, "num_sequences must be > 0");
        assert_eq!(
            x.nrows() % num_sequences,
            0,
            "score matrix rows {} not a multiple of num_sequences {num_sequences}",
            x.nrows()
        );
        let frames_per_sequence = x.nrows() / num_sequences;
        let n = graph.num_states();
        Self {
            graph,
            num_sequences,
            frames_per_sequence,
            leaky_coefficient: opts.leaky_hmm_coefficient,
            exp_x_t: x.t().mapv(f32::exp),
            alpha: Array3::zeros((frames_per_sequence + 1, num_sequences, n)),
            scale: Array2::ones((frames_per_sequence + 1, num_sequences)),
            tot_prob: Array1::zeros(num_sequences),
            log_z: 0.0,
            forward_ok: false,
            forward_done: false,
        }
    }

    /// Forward pass. Returns `(log Z_den summed over sequences, ok)`;
    /// `ok` is false on underflow or non-finite alpha sums.
    pub fn forward(&mut self) -> (f32, bool) {
        let graph = self.graph;
        let s_count = self.num_sequences;
        let t_count = self.frames_per_sequence;
        let n = graph.num_states();
        let init = graph.initial_probs();
        let kappa = self.leaky_coefficient;
        let mut ok = true;

        for s in 0..s_count {
            for i in 0..n {
                self.alpha[[0, s, i]] = init[i];
            }
        }

        let mut next = vec![0.0f32; n];
        for t in 1..=t_count {
            for s in 0..s_count {
                let col = (t - 1) * s_count + s;
                for (j, slot) in next.iter_mut().enumerate() {
                    let mut sum = 0.0f32;
                    for tr in graph.arcs_into(j) {
                        sum += self.alpha[[t - 1, s, tr.state as usize]]
                            * tr.prob
                            * self.exp_x_t[[tr.pdf as usize, col]];
                    }
                    *slot = sum;
                }
                let tot: f32 = next.iter().zip(init.iter()).map(|(a, i)| a * i).sum();
                let mut row_sum = 0.0f32;
                for (j, slot) in next.iter_mut().enumerate() {
                    *slot = (1.0 - kappa) * *slot + kappa * tot * init[j];
                    row_sum += *slot;
                }
                if !(row_sum > 0.0 && row_sum.is_finite()) {
                    ok = false;
                    self.scale[[t, s]] = 1.0;
                    continue;
                }
                let c = 1.0 / row_sum;
                self.scale[[t, s]] = c;
                for (j, slot) in next.iter().enumerate() {
                    self.alpha[[t, s, j]] = slot * c;
                }
            }
        }

        let mut log_z = 0.0f64;
        for s in 0..s_count {
            let tot: f32 = (0..n).map(|j| self.alpha[[t_count, s, j]] * init[j]).sum();
            self.tot_prob[s] = tot;
            let mut log_z_s = f64::from(tot.max(0.0).ln());
            for t in 1..=t_count {
                log_z_s -= f64::from(self.scale[[t, s]].ln());
            }
            if !log_z_s.is_finite() {
                ok = false;
            }
            log_z += log_z_s;
        }

        self.log_z = log_z;
        self.forward_ok = ok;
        self.forward_done = true;
        (log_z as f32, ok)
    }

    /// Backward pass. Accumulates
    /// `deriv_weight * d(log Z_den)/dX` into `deriv` (the driver passes
    /// `-weight`), using a rolling two-frame beta. Returns false when
    /// the forward pass failed or the alpha/beta self-consistency check
    /// does not hold.
    pub fn backward(&mut self, deriv_weight: f32, deriv: &mut Array2<f32>) -> bool {
        assert!(self.forward_done, "backward called before forward");
        assert_eq!(
            deriv.dim(),
            (self.frames_per_sequence * self.num_sequences, self.graph.num_pdfs()),
            "derivative buffer shape mismatch"
        );
        if !self.forward_ok {
            return false;
        }

        let graph = self.graph;
        let s_count = self.num_sequences;
        let t_count = self.frames_per_sequence;
        let n = graph.num_states();
        let init = graph.initial_probs();
        let kappa = self.leaky_coefficient;

        // Stored beta is the pre-leaky ("dash") quantity; the leaky
        // transform is applied to frame t+1 before propagating arcs at
        // frame t, the exact adjoint of the forward order.
        let mut beta_dash = Array2::<f32>::zeros((s_count, n));
        let mut beta_dash_prev = Array2::<f32>::zeros((s_count, n));
        let mut beta = vec![0.0f32; n];
        for s in 0..s_count {
            if !(self.tot_prob[s] > 0.0) {
                return false;
            }
            let head = self.scale[[t_count, s]] / self.tot_prob[s];
            for i in 0..n {
                beta_dash[[s, i]] = init[i] * head;
            }
        }

        for t in (0..t_count).rev() {
            for s in 0..s_count {
                let col = t * s_count + s;
                let tot: f32 = (0..n).map(|j| beta_dash[[s, j]] * init[j]).sum();
                for (j, slot) in beta.iter_mut().enumerate() {
                    *slot = (1.0 - kappa) * beta_dash[[s, j]] + kappa * tot * init[j];
                }
                let c = self.scale[[t, s]];
                for i in 0..n {
                    let a = self.alpha[[t, s, i]];
                    let mut sum = 0.0f32;
                    for tr in graph.arcs_from(i) {
                        let term = tr.prob
                            * self.exp_x_t[[tr.pdf as usize, col]]
                            * beta[tr.state as usize];
                        sum += term;
                        deriv[[col, tr.pdf as usize]] += deriv_weight * a * term;
                    }
                    beta_dash_prev[[s, i]] = sum * c;
                }
            }
            std::mem::swap(&mut beta_dash, &mut beta_dash_prev);
        }

        // At frame 0 the product sum_j alpha(0,j) * beta_dash(0,j)
        // equals one per sequence when the recursions agree.
        let mut error = 0.0f64;
        for s in 0..s_count {
            let tot: f32 = (0..n).map(|j| self.alpha[[0, s, j]] * beta_dash[[s, j]]).sum();
            if !(tot > 0.0 && tot.is_finite()) {
                warn!(sequence = s, total = tot, "denominator alpha/beta product invalid");
                return false;
            }
            error += f64::from(tot.ln());
        }
        let tolerance = ALPHA_BETA_CHECK_TOLERANCE * (self.log_z.abs() as f32).max(1.0);
        if error.abs() as f32 > tolerance {
            warn!(
                error,
                tolerance, "denominator alpha/beta consistency check failed"
            );
            return false;
        }
        true
    }

    pub(crate) fn geometry(&self) -> (usize, usize) {
        (self.frames_per_sequence, self.num_sequences)
    }

    #[cfg(test)]
    pub(crate) fn alpha(&self) -> &Array3<f32> {
        &self.alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArc;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;

    fn opts(kappa: f32) -> ChainTrainingOptions {
        ChainTrainingOptions {
            leaky_hmm_coefficient: kappa,
            ..ChainTrainingOptions::default()
        }
    }

    fn single_state_graph() -> DenominatorGraph {
        let arcs = vec![GraphArc {
            src: 0,
            dst: 0,
            pdf: 0,
            log_prob: 0.0,
        }];
        DenominatorGraph::new(&arcs, 1, 1).unwrap()
    }

    /// Complete two-state graph: self and cross arcs from both states,
    /// unit transition probability, state-dependent pdfs.
    fn complete_ring() -> DenominatorGraph {
        let arcs = vec![
            GraphArc {
                src: 0,
                dst: 0,
                pdf: 0,
                log_prob: 0.0,
            },
            GraphArc {
                src: 0,
                dst: 1,
                pdf: 1,
                log_prob: 0.0,
            },
            GraphArc {
                src: 1,
                dst: 0,
                pdf: 0,
                log_prob: 0.0,
            },
            GraphArc {
                src: 1,
                dst: 1,
                pdf: 1,
                log_prob: 0.0,
            },
        ];
        DenominatorGraph::new(&arcs, 2, 2).unwrap()
    }

    #[test]
    fn test_single_state_uniform_scores() {
        let graph = single_state_graph();
        let x = Array2::<f32>::zeros((3, 1));
        let mut den = DenominatorComputation::new(&opts(1e-5), &graph, 1, &x);
        let (log_z, ok) = den.forward();
        assert!(ok);
        assert_abs_diff_eq!(log_z, 0.0, epsilon = 1e-6);

        let mut deriv = Array2::<f32>::zeros((3, 1));
        assert!(den.backward(-1.0, &mut deriv));
        // The only pdf has occupancy one at every frame.
        for row in deriv.rows() {
            assert_relative_eq!(row[0], -1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_ring_closed_form_and_stationary_alpha() {
        // Uniform scores: each alpha row stays at the stationary
        // distribution and every frame multiplies Z by (2 - kappa).
        let kappa = 0.1;
        let t_count = 10;
        let graph = complete_ring();
        let x = Array2::<f32>::zeros((t_count, 2));
        let mut den = DenominatorComputation::new(&opts(kappa), &graph, 1, &x);
        let (log_z, ok) = den.forward();
        assert!(ok);
        let expected = t_count as f32 * (2.0 - kappa).ln() + 0.5f32.ln();
        assert_relative_eq!(log_z, expected, epsilon = 1e-4);
        for t in 0..=t_count {
            assert_relative_eq!(den.alpha()[[t, 0, 0]], 0.5, epsilon = 1e-5);
            assert_relative_eq!(den.alpha()[[t, 0, 1]], 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_matches_brute_force_enumeration() {
        // With a tiny leaky coefficient the exact Z is the sum over all
        // state paths of init * prod(trans * exp(score)) * final.
        let arcs = vec![
            GraphArc {
                src: 0,
                dst: 0,
                pdf: 0,
                log_prob: 0.6f32.ln(),
            },
            GraphArc {
                src: 0,
                dst: 1,
                pdf: 1,
                log_prob: 0.4f32.ln(),
            },
            GraphArc {
                src: 1,
                dst: 0,
                pdf: 2,
                log_prob: 0.9f32.ln(),
            },
            GraphArc {
                src: 1,
                dst: 1,
                pdf: 1,
                log_prob: 0.1f32.ln(),
            },
        ];
        let graph = DenominatorGraph::new(&arcs, 2, 3).unwrap();
        let x = array![
            [0.3, -0.4, 0.1],
            [-0.2, 0.5, 0.0],
            [0.1, 0.1, -0.6],
            [0.0, -0.1, 0.4]
        ];
        let t_count = 4;
        let mut den = DenominatorComputation::new(&opts(1e-8), &graph, 1, &x);
        let (log_z, ok) = den.forward();
        assert!(ok);

        let init = graph.initial_probs();
        let mut z = 0.0f64;
        for path in 0..(1u32 << (t_count + 1)) {
            let states: Vec<usize> = (0..=t_count).map(|t| ((path >> t) & 1) as usize).collect();
            let mut p = f64::from(init[states[0]]);
            let mut valid = true;
            for t in 0..t_count {
                let arc = arcs
                    .iter()
                    .find(|a| a.src as usize == states[t] && a.dst as usize == states[t + 1]);
                match arc {
                    Some(a) => {
                        p *= f64::from(a.log_prob.exp())
                            * f64::from(x[[t, a.pdf as usize]].exp());
                    }
                    None => {
                        valid = false;
                        break;
                    }
                }
            }
            if valid {
                z += p * f64::from(init[states[t_count]]);
            }
        }
        assert_relative_eq!(log_z, z.ln() as f32, epsilon = 1e-4);
    }

    #[test]
    fn test_backward_consistency_and_posterior_normalization() {
        let graph = complete_ring();
        let x = array![
            [0.2, -0.3],
            [-0.5, 0.7],
            [0.0, 0.1],
            [0.4, -0.2],
            [-0.1, -0.1],
            [0.3, 0.6]
        ];
        // Two sequences, three frames each.
        let mut den = DenominatorComputation::new(&opts(0.05), &graph, 2, &x);
        let (_, ok) = den.forward();
        assert!(ok);
        let mut deriv = Array2::<f32>::zeros((6, 2));
        assert!(den.backward(-1.0, &mut deriv));
        // d(log Z)/dX sums to one per frame and sequence; with weight
        // -1 each row sums to -1.
        for row in deriv.rows() {
            assert_relative_eq!(row.sum(), -1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_forward_gradient_finite_difference() {
        let graph = complete_ring();
        let x = array![[0.1, -0.2], [0.3, 0.0], [-0.4, 0.25]];
        let mut den = DenominatorComputation::new(&opts(0.02), &graph, 1, &x);
        let (_, ok) = den.forward();
        assert!(ok);
        let mut deriv = Array2::<f32>::zeros((3, 2));
        assert!(den.backward(1.0, &mut deriv));

        let eps = 1e-3f32;
        for r in 0..3 {
            for c in 0..2 {
                let mut x_plus = x.clone();
                x_plus[[r, c]] += eps;
                let mut x_minus = x.clone();
                x_minus[[r, c]] -= eps;
                let (lz_plus, _) =
                    DenominatorComputation::new(&opts(0.02), &graph, 1, &x_plus).forward();
                let (lz_minus, _) =
                    DenominatorComputation::new(&opts(0.02), &graph, 1, &x_minus).forward();
                let numeric = (lz_plus - lz_minus) / (2.0 * eps);
                assert_abs_diff_eq!(deriv[[r, c]], numeric, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_underflow_reports_not_ok() {
        // Scores so negative that exp underflows to zero everywhere.
        let graph = single_state_graph();
        let x = Array2::<f32>::from_elem((4, 1), -1.0e30);
        let mut den = DenominatorComputation::new(&opts(1e-5), &graph, 1, &x);
        let (_, ok) = den.forward();
        assert!(!ok);
        let mut deriv = Array2::<f32>::zeros((4, 1));
        assert!(!den.backward(-1.0, &mut deriv));
    }

    #[test]
    fn test_alpha_rows_strictly_positive() {
        // Invariant: kappa > 0 keeps every alpha row sum strictly
        // positive for finite scores.
        let graph = complete_ring();
        let x = array![[30.0, -30.0], [-30.0, 30.0], [15.0, -15.0]];
        let mut den = DenominatorComputation::new(&opts(1e-5), &graph, 1, &x);
        let (_, ok) = den.forward();
        assert!(ok);
        for t in 0..=3 {
            for j in 0..2 {
                assert!(den.alpha()[[t, 0, j]] > 0.0);
            }
        }
    }
}
