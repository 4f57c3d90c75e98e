//! Per-minibatch supervision.
//!
//! A supervision bundles the minibatch geometry (`num_sequences`,
//! `frames_per_sequence`, scalar weight) with one of three mutually
//! exclusive payloads:
//!
//! - **Compact**: one time-leveled constraint FST per sequence, for the
//!   compact numerator. Every arc advances time by exactly one frame,
//!   so each state belongs to a single frame.
//! - **Generic**: one free FST per sequence (self-loops and cycles
//!   allowed), for end-to-end training with no forced alignment.
//! - **Targets**: a fixed target-posterior matrix, replacing the
//!   numerator entirely (KL mode).
//!
//! FST construction itself is an external concern; this module only
//! validates what the forward-backward passes rely on.

use ndarray::Array2;

use crate::error::{CadenaError, Result};

/// One arc of a supervision FST, as supplied by the builder. The FST is
/// a weighted acceptor over pdf labels; state 0 is the start state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FstArc {
    pub src: u32,
    pub dst: u32,
    /// Emitted pdf class (column of the score matrix).
    pub pdf: u32,
    /// Log arc weight.
    pub log_weight: f32,
}

/// Stored arc: destination, pdf, log weight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoredArc {
    pub dst: u32,
    pub pdf: u32,
    pub log_weight: f32,
}

/// An epsilon-free weighted acceptor over pdf labels.
///
/// Arcs are CSR-indexed by source state; each arc consumes exactly one
/// frame. Final states carry a log final-weight
/// (`f32::NEG_INFINITY` marks a non-final state).
#[derive(Debug, Clone)]
pub struct SupervisionFst {
    num_states: usize,
    offsets: Vec<usize>,
    arcs: Vec<StoredArc>,
    final_log_weights: Vec<f32>,
}

impl SupervisionFst {
    /// Build an FST from an arc list and a `(state, log_weight)` final
    /// list. State 0 is the start state.
    ///
    /// # Errors
    ///
    /// Returns an error on out-of-range states, non-finite arc or final
    /// weights, or an empty final list.
    pub fn new(num_states: usize, arcs: &[FstArc], finals: &[(u32, f32)]) -> Result<Self> {
        if num_states == 0 {
            return Err(CadenaError::Supervision("num_states must be > 0".into()));
        }
        for arc in arcs {
            if arc.src as usize >= num_states || arc.dst as usize >= num_states {
                return Err(CadenaError::Supervision(format!(
                    "arc {} -> {} out of range (num_states = {num_states})",
                    arc.src, arc.dst
                )));
            }
            if !arc.log_weight.is_finite() {
                return Err(CadenaError::Supervision(format!(
                    "non-finite weight on arc {} -> {}",
                    arc.src, arc.dst
                )));
            }
        }
        if finals.is_empty() {
            return Err(CadenaError::Supervision("FST has no final states".into()));
        }
        let mut final_log_weights = vec![f32::NEG_INFINITY; num_states];
        for &(state, log_weight) in finals {
            if state as usize >= num_states {
                return Err(CadenaError::Supervision(format!(
                    "final state {state} out of range (num_states = {num_states})"
                )));
            }
            if !log_weight.is_finite() {
                return Err(CadenaError::Supervision(format!(
                    "non-finite final weight on state {state}"
                )));
            }
            final_log_weights[state as usize] = log_weight;
        }

        let mut counts = vec![0usize; num_states + 1];
        for arc in arcs {
            counts[arc.src as usize + 1] += 1;
        }
        for i in 0..num_states {
            counts[i + 1] += counts[i];
        }
        let offsets = counts.clone();
        let mut cursor = counts;
        let mut stored = vec![
            StoredArc {
                dst: 0,
                pdf: 0,
                log_weight: 0.0
            };
            arcs.len()
        ];
        for arc in arcs {
            let slot = cursor[arc.src as usize];
            cursor[arc.src as usize] += 1;
            stored[slot] = StoredArc {
                dst: arc.dst,
                pdf: arc.pdf,
                log_weight: arc.log_weight,
            };
        }

        Ok(Self {
            num_states,
            offsets,
            arcs: stored,
            final_log_weights,
        })
    }

    /// Number of states.
    #[must_use]
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Largest pdf label on any arc, or `None` for an arc-free FST.
    #[must_use]
    pub fn max_pdf(&self) -> Option<u32> {
        self.arcs.iter().map(|a| a.pdf).max()
    }

    #[inline]
    pub(crate) fn arcs_from(&self, state: usize) -> &[StoredArc] {
        &self.arcs[self.offsets[state]..self.offsets[state + 1]]
    }

    #[inline]
    pub(crate) fn final_log_weight(&self, state: usize) -> f32 {
        self.final_log_weights[state]
    }

    /// Assign a frame index to every state, requiring that each arc
    /// advances time by exactly one frame, state 0 sits at time 0, all
    /// states are reachable, and every final state sits at time
    /// `num_frames`. This is the leveling property the compact
    /// numerator exploits.
    pub(crate) fn state_times(&self, num_frames: usize) -> Result<Vec<u32>> {
        const UNSEEN: u32 = u32::MAX;
        let mut times = vec![UNSEEN; self.num_states];
        times[0] = 0;
        let mut queue = std::collections::VecDeque::from([0u32]);
        while let Some(state) = queue.pop_front() {
            let t = times[state as usize];
            if t as usize >= num_frames {
                continue;
            }
            for arc in self.arcs_from(state as usize) {
                let dst = arc.dst as usize;
                if times[dst] == UNSEEN {
                    times[dst] = t + 1;
                    queue.push_back(arc.dst);
                } else if times[dst] != t + 1 {
                    return Err(CadenaError::Supervision(format!(
                        "state {dst} reachable at times {} and {}; FST is not time-leveled",
                        times[dst],
                        t + 1
                    )));
                }
            }
        }
        for (state, &t) in times.iter().enumerate() {
            if t == UNSEEN {
                return Err(CadenaError::Supervision(format!(
                    "state {state} unreachable from the start state"
                )));
            }
            // Arcs out of a frame-T state were skipped above; such arcs
            // would overrun the sequence.
            if t as usize == num_frames && !self.arcs_from(state).is_empty() {
                return Err(CadenaError::Supervision(format!(
                    "state {state} at final frame {num_frames} has outgoing arcs"
                )));
            }
            if self.final_log_weights[state].is_finite() && t as usize != num_frames {
                return Err(CadenaError::Supervision(format!(
                    "final state {state} at time {t}, expected {num_frames}"
                )));
            }
        }
        Ok(times)
    }
}

/// A supervision FST validated as time-leveled, with its per-state
/// frame indexes and a time-sorted state order for the frame-by-frame
/// recursion.
#[derive(Debug, Clone)]
pub struct LeveledFst {
    pub(crate) fst: SupervisionFst,
    pub(crate) state_times: Vec<u32>,
    pub(crate) time_order: Vec<u32>,
}

impl LeveledFst {
    fn new(fst: SupervisionFst, num_frames: usize) -> Result<Self> {
        let state_times = fst.state_times(num_frames)?;
        let mut time_order: Vec<u32> = (0..fst.num_states() as u32).collect();
        time_order.sort_by_key(|&s| state_times[s as usize]);
        Ok(Self {
            fst,
            state_times,
            time_order,
        })
    }
}

/// The three mutually exclusive supervision payloads.
#[derive(Debug, Clone)]
pub enum SupervisionKind {
    /// Time-leveled constraint FSTs, one per sequence.
    Compact(Vec<LeveledFst>),
    /// Free per-sequence FSTs (end-to-end supervision).
    Generic(Vec<SupervisionFst>),
    /// Fixed target posteriors of shape `(T*S, P)` (KL mode).
    Targets(Array2<f32>),
}

/// Per-minibatch supervision: geometry, weight, and payload.
#[derive(Debug, Clone)]
pub struct Supervision {
    num_sequences: usize,
    frames_per_sequence: usize,
    weight: f32,
    kind: SupervisionKind,
}

impl Supervision {
    /// Compact supervision; validates that every FST is time-leveled
    /// over `frames_per_sequence` frames.
    pub fn compact(
        fsts: Vec<SupervisionFst>,
        frames_per_sequence: usize,
        weight: f32,
    ) -> Result<Self> {
        check_geometry(fsts.len(), frames_per_sequence, weight)?;
        let leveled = fsts
            .into_iter()
            .map(|fst| LeveledFst::new(fst, frames_per_sequence))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            num_sequences: leveled.len(),
            frames_per_sequence,
            weight,
            kind: SupervisionKind::Compact(leveled),
        })
    }

    /// Generic (end-to-end) supervision: one free FST per sequence.
    pub fn generic(
        fsts: Vec<SupervisionFst>,
        frames_per_sequence: usize,
        weight: f32,
    ) -> Result<Self> {
        check_geometry(fsts.len(), frames_per_sequence, weight)?;
        Ok(Self {
            num_sequences: fsts.len(),
            frames_per_sequence,
            weight,
            kind: SupervisionKind::Generic(fsts),
        })
    }

    /// KL-mode supervision: fixed target posteriors of shape `(T*S, P)`.
    pub fn targets(
        targets: Array2<f32>,
        num_sequences: usize,
        frames_per_sequence: usize,
        weight: f32,
    ) -> Result<Self> {
        check_geometry(num_sequences, frames_per_sequence, weight)?;
        if targets.nrows() != num_sequences * frames_per_sequence {
            return Err(CadenaError::Supervision(format!(
                "targets have {} rows, expected num_sequences * frames_per_sequence = {}",
                targets.nrows(),
                num_sequences * frames_per_sequence
            )));
        }
        Ok(Self {
            num_sequences,
            frames_per_sequence,
            weight,
            kind: SupervisionKind::Targets(targets),
        })
    }

    /// Sequences per minibatch.
    #[must_use]
    pub fn num_sequences(&self) -> usize {
        self.num_sequences
    }

    /// Frames per sequence.
    #[must_use]
    pub fn frames_per_sequence(&self) -> usize {
        self.frames_per_sequence
    }

    /// Scalar supervision weight.
    #[must_use]
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// The payload.
    #[must_use]
    pub fn kind(&self) -> &SupervisionKind {
        &self.kind
    }
}

fn check_geometry(num_sequences: usize, frames_per_sequence: usize, weight: f32) -> Result<()> {
    if num_sequences == 0 {
        return Err(CadenaError::Supervision("num_sequences must be > 0".into()));
    }
    if frames_per_sequence == 0 {
        return Err(CadenaError::Supervision(
            "frames_per_sequence must be > 0".into(),
        ));
    }
    if !(weight.is_finite() && weight > 0.0) {
        return Err(CadenaError::Supervision(format!(
            "weight must be finite and > 0, got {weight}"
        )));
    }
    Ok(())
}
