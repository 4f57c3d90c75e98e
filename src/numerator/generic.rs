//! Generic numerator: dense log-domain forward-backward over free
//! per-sequence FSTs (end-to-end supervision).

use ndarray::Array2;

use crate::math::{log_add, log_sum_exp};
use crate::supervision::{Supervision, SupervisionFst, SupervisionKind};

/// Forward-backward over generic (end-to-end) supervision.
///
/// Unlike the compact flavor, the FSTs are not time-leveled: they may
/// carry self-loops and cycles, and any state can be active at any
/// frame, so a dense `(frames+1, states)` alpha table is kept per
/// sequence. Each arc still consumes exactly one frame.
///
/// A sequence whose FST cannot accept any length-`T` path has a
/// non-finite log-likelihood; the forward pass reports this through its
/// `ok` flag and the driver treats it as a minibatch-wide failure.
pub struct GenericNumeratorComputation<'a> {
    fsts: &'a [SupervisionFst],
    x: &'a Array2<f32>,
    num_sequences: usize,
    frames_per_sequence: usize,
    weight: f32,
    alphas: Vec<Array2<f32>>,
    log_likes: Vec<f32>,
}

impl<'a> GenericNumeratorComputation<'a> {
    /// Set up the computation.
    ///
    /// # Panics
    ///
    /// Panics if the supervision is not generic or the score matrix has
    /// the wrong number of rows.
    pub fn new(supervision: &'a Supervision, x: &'a Array2<f32>) -> Self {
        let fsts = match supervision.kind() {
            SupervisionKind::Generic(fsts) => fsts,
            _ => panic!("generic numerator requires generic supervision"),
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
            frames_per_sequence: supervision.frames_per_sequence(),
            weight: supervision.weight(),
            alphas: Vec::new(),
            log_likes: Vec::new(),
        }
    }

    /// Forward pass: returns `(weight * sum_s log P(fst_s | X), ok)`.
    /// `ok` is false when any sequence's log-likelihood is non-finite.
    pub fn forward(&mut self) -> (f32, bool) {
        let s_count = self.num_sequences;
        let t_count = self.frames_per_sequence;
        let mut total = 0.0f64;
        let mut ok = true;
        self.alphas.clear();
        self.log_likes.clear();
        for (s, fst) in self.fsts.iter().enumerate() {
            let n = fst.num_states();
            let mut alpha = Array2::<f32>::from_elem((t_count + 1, n), f32::NEG_INFINITY);
            alpha[[0, 0]] = 0.0;
            for t in 0..t_count {
                for i in 0..n {
                    let a = alpha[[t, i]];
                    if a == f32::NEG_INFINITY {
                        continue;
                    }
                    for arc in fst.arcs_from(i) {
                        let score =
                            a + arc.log_weight + self.x[[t * s_count + s, arc.pdf as usize]];
                        let dst = arc.dst as usize;
                        alpha[[t + 1, dst]] = log_add(alpha[[t + 1, dst]], score);
                    }
                }
            }
            let finals: Vec<f32> = (0..n)
                .map(|i| alpha[[t_count, i]] + fst.final_log_weight(i))
                .collect();
            let log_like = log_sum_exp(&finals);
            if !log_like.is_finite() {
                ok = false;
            }
            total += f64::from(log_like);
            self.alphas.push(alpha);
            self.log_likes.push(log_like);
        }
        (self.weight * total as f32, ok)
    }

    /// Backward pass: accumulates the weighted posterior into
    /// `posterior`. Sequences with non-finite log-likelihood are
    /// skipped (their posterior stays zero). Must be called after
    /// [`forward`](Self::forward).
    pub fn backward(&self, posterior: &mut Array2<f32>) {
        assert_eq!(posterior.dim(), self.x.dim(), "posterior shape mismatch");
        assert_eq!(
            self.alphas.len(),
            self.fsts.len(),
            "backward called before forward"
        );
        let s_count = self.num_sequences;
        let t_count = self.frames_per_sequence;
        for (s, fst) in self.fsts.iter().enumerate() {
            let log_like = self.log_likes[s];
            if !log_like.is_finite() {
                continue;
            }
            let n = fst.num_states();
            let alpha = &self.alphas[s];
            let mut beta: Vec<f32> = (0..n).map(|i| fst.final_log_weight(i)).collect();
            let mut beta_prev = vec![f32::NEG_INFINITY; n];
            for t in (0..t_count).rev() {
                beta_prev.iter_mut().for_each(|b| *b = f32::NEG_INFINITY);
                for i in 0..n {
                    let a = alpha[[t, i]];
                    let mut b = f32::NEG_INFINITY;
                    for arc in fst.arcs_from(i) {
                        let x_val = self.x[[t * s_count + s, arc.pdf as usize]];
                        let with_arc = arc.log_weight + x_val + beta[arc.dst as usize];
                        b = log_add(b, with_arc);
                        if a != f32::NEG_INFINITY {
                            let occupancy = (a + with_arc - log_like).exp();
                            posterior[[t * s_count + s, arc.pdf as usize]] +=
                                self.weight * occupancy;
                        }
                    }
                    beta_prev[i] = b;
                }
                std::mem::swap(&mut beta, &mut beta_prev);
            }
        }
    }
}
