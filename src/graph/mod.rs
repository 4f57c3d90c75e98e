//! Denominator HMM graph.
//!
//! A compact, immutable representation of the shared denominator graph:
//! arcs annotated with `(pdf, transition probability)`, indexed both by
//! source state (for the alpha recursion) and by destination state (for
//! the beta recursion), plus the stationary distribution of the
//! transition matrix, which serves as both the initial and the final
//! probability vector.
//!
//! Built once per corpus and shared read-only across minibatches and
//! threads.

use ndarray::Array1;

use crate::error::{CadenaError, Result};

/// One arc of the denominator HMM, as supplied by the graph builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphArc {
    /// Source state.
    pub src: u32,
    /// Destination state.
    pub dst: u32,
    /// Emitted pdf class (column of the score matrix).
    pub pdf: u32,
    /// Log transition probability.
    pub log_prob: f32,
}

/// An arc as stored in the per-state indexes: the *other* endpoint, the
/// pdf, and the linear-domain transition probability (the recursions run
/// in a rescaled linear domain, so the exp is taken once here).
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    /// Destination state in the forward index, source state in the
    /// backward index.
    pub state: u32,
    /// Emitted pdf class.
    pub pdf: u32,
    /// Linear transition probability.
    pub prob: f32,
}

/// Immutable denominator graph shared across minibatches.
#[derive(Debug, Clone)]
pub struct DenominatorGraph {
    num_states: usize,
    num_pdfs: usize,
    fwd_offsets: Vec<usize>,
    fwd: Vec<Transition>,
    bwd_offsets: Vec<usize>,
    bwd: Vec<Transition>,
    initial_probs: Array1<f32>,
}

/// Convergence threshold for the stationary-distribution power iteration.
const POWER_ITERATION_TOLERANCE: f64 = 1e-10;
/// Iteration cap; graphs in practice converge in well under a hundred.
const POWER_ITERATION_MAX_ITERS: usize = 200;

impl DenominatorGraph {
    /// Build the graph from an arc list.
    ///
    /// Every state must have at least one outgoing arc (the forward
    /// recursion has nowhere to send probability otherwise). Transition
    /// probabilities need not be normalized per state; the stationary
    /// distribution is computed with a normalizing power iteration.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty arc list, out-of-range states or
    /// pdfs, non-finite log probabilities, or a state with no outgoing
    /// arcs.
    pub fn new(arcs: &[GraphArc], num_states: usize, num_pdfs: usize) -> Result<Self> {
        if num_states == 0 {
            return Err(CadenaError::Graph("num_states must be > 0".into()));
        }
        if num_pdfs == 0 {
            return Err(CadenaError::Graph("num_pdfs must be > 0".into()));
        }
        if arcs.is_empty() {
            return Err(CadenaError::Graph("graph has no arcs".into()));
        }
        for arc in arcs {
            if arc.src as usize >= num_states || arc.dst as usize >= num_states {
                return Err(CadenaError::Graph(format!(
                    "arc {} -> {} out of range (num_states = {num_states})",
                    arc.src, arc.dst
                )));
            }
            if arc.pdf as usize >= num_pdfs {
                return Err(CadenaError::Graph(format!(
                    "arc pdf {} out of range (num_pdfs = {num_pdfs})",
                    arc.pdf
                )));
            }
            if !arc.log_prob.is_finite() {
                return Err(CadenaError::Graph(format!(
                    "non-finite log_prob on arc {} -> {}",
                    arc.src, arc.dst
                )));
            }
        }

        let (fwd_offsets, fwd) = group_arcs(arcs, num_states, |a| (a.src, a.dst));
        let (bwd_offsets, bwd) = group_arcs(arcs, num_states, |a| (a.dst, a.src));

        for state in 0..num_states {
            if fwd_offsets[state] == fwd_offsets[state + 1] {
                return Err(CadenaError::Graph(format!(
                    "state {state} has no outgoing arcs"
                )));
            }
        }

        let initial_probs = stationary_distribution(arcs, num_states);

        Ok(Self {
            num_states,
            num_pdfs,
            fwd_offsets,
            fwd,
            bwd_offsets,
            bwd,
            initial_probs,
        })
    }

    /// Number of HMM states.
    #[must_use]
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Number of pdf classes (columns of the score matrix).
    #[must_use]
    pub fn num_pdfs(&self) -> usize {
        self.num_pdfs
    }

    /// Stationary distribution of the transition matrix; used as both
    /// the initial and the final probability vector. Sums to one.
    #[must_use]
    pub fn initial_probs(&self) -> &Array1<f32> {
        &self.initial_probs
    }

    /// Arcs leaving `state`; `Transition::state` is the destination.
    #[inline]
    pub fn arcs_from(&self, state: usize) -> &[Transition] {
        &self.fwd[self.fwd_offsets[state]..self.fwd_offsets[state + 1]]
    }

    /// Arcs entering `state`; `Transition::state` is the source.
    #[inline]
    pub fn arcs_into(&self, state: usize) -> &[Transition] {
        &self.bwd[self.bwd_offsets[state]..self.bwd_offsets[state + 1]]
    }

    /// Largest out-degree over all states. Bounds the per-state blocked
    /// layout a device kernel would use.
    #[must_use]
    pub fn max_out_degree(&self) -> usize {
        (0..self.num_states)
            .map(|s| self.fwd_offsets[s + 1] - self.fwd_offsets[s])
            .max()
            .unwrap_or(0)
    }

    /// Largest in-degree over all states.
    #[must_use]
    pub fn max_in_degree(&self) -> usize {
        (0..self.num_states)
            .map(|s| self.bwd_offsets[s + 1] - self.bwd_offsets[s])
            .max()
            .unwrap_or(0)
    }
}

/// Group arcs into a CSR index keyed by `key(arc).0`, storing the other
/// endpoint `key(arc).1` in the transition.
fn group_arcs(
    arcs: &[GraphArc],
    num_states: usize,
    key: impl Fn(&GraphArc) -> (u32, u32),
) -> (Vec<usize>, Vec<Transition>) {
    let mut counts = vec![0usize; num_states + 1];
    for arc in arcs {
        counts[key(arc).0 as usize + 1] += 1;
    }
    for i in 0..num_states {
        counts[i + 1] += counts[i];
    }
    let offsets = counts;
    let mut cursor = offsets.clone();
    let mut stored = vec![
        Transition {
            state: 0,
            pdf: 0,
            prob: 0.0
        };
        arcs.len()
    ];
    for arc in arcs {
        let (group, other) = key(arc);
        let slot = cursor[group as usize];
        cursor[group as usize] += 1;
        stored[slot] = Transition {
            state: other,
            pdf: arc.pdf,
            prob: arc.log_prob.exp(),
        };
    }
    (offsets, stored)
}

/// Stationary distribution of the state-transition matrix by power
/// iteration, normalized every round so unnormalized transition weights
/// are acceptable.
fn stationary_distribution(arcs: &[GraphArc], num_states: usize) -> Array1<f32> {
    let mut v = vec![1.0f64 / num_states as f64; num_states];
    let mut next = vec![0.0f64; num_states];
    for _ in 0..POWER_ITERATION_MAX_ITERS {
        next.iter_mut().for_each(|x| *x = 0.0);
        for arc in arcs {
            next[arc.dst as usize] += v[arc.src as usize] * f64::from(arc.log_prob.exp());
        }
        let total: f64 = next.iter().sum();
        // A graph that passed construction always moves some mass.
        debug_assert!(total > 0.0);
        let mut delta = 0.0f64;
        for (vi, ni) in v.iter_mut().zip(next.iter()) {
            let normalized = ni / total;
            delta = delta.max((normalized - *vi).abs());
            *vi = normalized;
        }
        if delta < POWER_ITERATION_TOLERANCE {
            break;
        }
    }
    Array1::from_iter(v.iter().map(|&x| x as f32))
}
