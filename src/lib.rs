//! Lattice-free sequence-discriminative ("chain") training objectives.
//!
//! Given the per-frame, per-class log-scores produced by an acoustic
//! model and a pair of graph supervisions — a numerator constraint
//! graph per utterance and a denominator phone-level graph shared
//! across the corpus — this crate computes a scalar training objective
//! and, optionally, its gradient with respect to the scores. Three
//! objective variants are supported: MMI (numerator minus denominator
//! log-likelihood), SMBR interpolated with MMI, and a KL mode where the
//! numerator is replaced by fixed target posteriors.
//!
//! The crate is purely in-memory and synchronous: no I/O, no FST
//! construction, no training-loop orchestration. The network executor
//! that produces the score matrix and consumes its derivative is an
//! external collaborator.
//!
//! # Example
//!
//! ```
//! use cadena::{
//!     compute_objf_and_deriv, ChainTrainingOptions, DenominatorGraph, FstArc, GraphArc,
//!     Supervision, SupervisionFst,
//! };
//! use ndarray::Array2;
//!
//! // Single-state denominator graph over one pdf.
//! let graph = DenominatorGraph::new(
//!     &[GraphArc { src: 0, dst: 0, pdf: 0, log_prob: 0.0 }],
//!     1,
//!     1,
//! )?;
//! // One sequence of three frames, forced to pdf 0 throughout.
//! let fst = SupervisionFst::new(
//!     4,
//!     &[
//!         FstArc { src: 0, dst: 1, pdf: 0, log_weight: 0.0 },
//!         FstArc { src: 1, dst: 2, pdf: 0, log_weight: 0.0 },
//!         FstArc { src: 2, dst: 3, pdf: 0, log_weight: 0.0 },
//!     ],
//!     &[(3, 0.0)],
//! )?;
//! let supervision = Supervision::compact(vec![fst], 3, 1.0)?;
//!
//! let scores = Array2::<f32>::zeros((3, 1));
//! let mut deriv = Array2::<f32>::zeros((3, 1));
//! let opts = ChainTrainingOptions::default();
//! let result = compute_objf_and_deriv(
//!     &opts, &graph, &supervision, &scores, Some(&mut deriv), None,
//! )?;
//! assert_eq!(result.weight, 3.0);
//! # Ok::<(), cadena::CadenaError>(())
//! ```

mod config;
mod denominator;
mod diagnostics;
mod error;
mod graph;
mod math;
mod numerator;
mod objective;
mod supervision;

pub use config::{build_silence_indices, parse_silence_pdfs, ChainTrainingOptions};
pub use denominator::{
    DenominatorComputation, DenominatorSmbrComputation, SmbrForward, ALPHA_BETA_CHECK_TOLERANCE,
};
pub use diagnostics::{xent_objective, ObjectiveInfo};
pub use error::{CadenaError, Result};
pub use graph::{DenominatorGraph, GraphArc, Transition};
pub use numerator::{GenericNumeratorComputation, NumeratorComputation};
pub use objective::{
    compute_objf_and_deriv, compute_smbr_objf_and_deriv, ObjectiveResult, SmbrObjectiveResult,
};
pub use supervision::{FstArc, LeveledFst, Supervision, SupervisionFst, SupervisionKind};
