//! Compact numerator: log-domain forward-backward over time-leveled
//! supervision FSTs.

use ndarray::Array2;

use crate::math::{log_add, log_sum_exp};
use crate::supervision::{LeveledFst, Supervision, SupervisionKind};

/// Forward-backward over the compact supervision of one minibatch.
///
/// Row `t*S + s` of the score matrix is frame `t` of sequence `s`. The
/// forward pass returns the supervision-weighted log-likelihood; the
/// backward pass accumulates the per-frame posterior matrix, whose rows
/// sum to the supervision weight.
pub struct NumeratorComputation<'a> {
    fsts: &'a [LeveledFst],
    x: &'a Array2<f32>,
    num_sequences: usize,
    weight: f32,
    /// Per-sequence log-domain alpha over FST states.
    alphas: Vec<Vec<f32>>,
    /// Per-sequence total log-likelihood.
    log_likes: Vec<f32>,
}

impl<'a> NumeratorComputation<'a> {
    /// Set up the computation.
    ///
    /// # Panics
    ///
    /// Panics if the supervision is not compact or the score matrix has
    /// the wrong number of rows: both are caller bugs, not data errors.
    pub fn new(supervision: &'a Supervision, x: &'a Array2<f32>) -> Self {
        let fsts = match supervision.kind() {
            SupervisionKind::Compact(fsts) => fsts,
            _ => panic!("compact numerator requires compact supervision"),
        };
        assert_eq!(
            x.nrows(),
            supervision.num_sequences() * supervision.frames_per_sequence(),
            "score matrix has {} rows, supervision implies {}",
            x.nrows(),
            supervision.num_sequences() * supervision.frames_per_sequence()
        );
        Self {
            fsts,
            x,
            num_sequences: supervision.num_sequences(),
            weight: supervision.weight(),
            alphas: Vec::new(),
            log_likes: Vec::new(),
        }
    }

    /// Forward pass: returns `weight * sum_s log P(supervision_s | X)`.
    pub fn forward(&mut self) -> f32 {
        let s_count = self.num_sequences;
        let mut total = 0.0f64;
        self.alphas.clear();
        self.log_likes.clear();
        for (s, leveled) in self.fsts.iter().enumerate() {
            let fst = &leveled.fst;
            let mut alpha = vec![f32::NEG_INFINITY; fst.num_states()];
            alpha[0] = 0.0;
            // States are processed in frame order; arcs always go one
            // frame forward, so each state is complete when visited.
            for &state in &leveled.time_order {
                let a = alpha[state as usize];
                if a == f32::NEG_INFINITY {
                    continue;
                }
                let t = leveled.state_times[state as usize] as usize;
                for arc in fst.arcs_from(state as usize) {
                    let score = a + arc.log_weight + self.x[[t * s_count + s, arc.pdf as usize]];
                    let dst = arc.dst as usize;
                    alpha[dst] = log_add(alpha[dst], score);
                }
            }
            let finals: Vec<f32> = (0..fst.num_states())
                .map(|i| alpha[i] + fst.final_log_weight(i))
                .collect();
            let log_like = log_sum_exp(&finals);
            total += f64::from(log_like);
            self.alphas.push(alpha);
            self.log_likes.push(log_like);
        }
        self.weight * total as f32
    }

    /// Backward pass: accumulates the weighted posterior into
    /// `posterior` (same shape as the score matrix). Must be called
    /// after [`forward`](Self::forward).
    pub fn backward(&self, posterior: &mut Array2<f32>) {
        assert_eq!(posterior.dim(), self.x.dim(), "posterior shape mismatch");
        assert_eq!(
            self.alphas.len(),
            self.fsts.len(),
            "backward called before forward"
        );
        let s_count = self.num_sequences;
        for (s, leveled) in self.fsts.iter().enumerate() {
            let log_like = self.log_likes[s];
            if !log_like.is_finite() {
                // Unsatisfiable supervision; the driver substitutes the
                // objective, so the posterior stays zero here.
                continue;
            }
            let fst = &leveled.fst;
            let alpha = &self.alphas[s];
            let mut beta: Vec<f32> = (0..fst.num_states())
                .map(|i| fst.final_log_weight(i))
                .collect();
            for &state in leveled.time_order.iter().rev() {
                let i = state as usize;
                let t = leveled.state_times[i] as usize;
                let mut b = beta[i];
                for arc in fst.arcs_from(i) {
                    let x_val = self.x[[t * s_count + s, arc.pdf as usize]];
                    let with_arc = arc.log_weight + x_val + beta[arc.dst as usize];
                    b = log_add(b, with_arc);
                    let occupancy = (alpha[i] + with_arc - log_like).exp();
                    posterior[[t * s_count + s, arc.pdf as usize]] += self.weight * occupancy;
                }
                beta[i] = b;
            }
        }
    }
}
