//! Numerator forward-backward.
//!
//! Two flavors over the supervision constraint graphs, both fully in
//! log space:
//!
//! - [`NumeratorComputation`] for compact, time-leveled supervision
//!   FSTs (forced-alignment-style constraints);
//! - [`GenericNumeratorComputation`] for free per-sequence FSTs
//!   (end-to-end supervision), which may be unsatisfiable and therefore
//!   reports an `ok` flag.

mod compact;
mod generic;

pub use compact::NumeratorComputation;
pub use generic::GenericNumeratorComputation;
