//! Training options and the silence-pdf configuration boundary.
//!
//! Option parsing and CLI live outside this crate; callers fill
//! [`ChainTrainingOptions`] however they like (it derives serde for
//! config-file use) and must call [`ChainTrainingOptions::validate`]
//! before handing it to a driver.

use serde::{Deserialize, Serialize};

use crate::error::{CadenaError, Result};

/// Options controlling the chain objective computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainTrainingOptions {
    /// L2 regularization constant on the network output; the term added
    /// to the objective is `-0.5 * l2_regularize * ||output||^2`
    /// (e.g. try 0.0005).
    pub l2_regularize: f32,

    /// If true, the penalty becomes `-l2_regularize * sum(exp(output))`
    /// instead, pushing `exp(output)` towards small probability-like
    /// values. Documented use is with the SMBR objective.
    pub norm_regularize: bool,

    /// Coefficient for the leaky HMM: an epsilon-transition from each
    /// state to a pivot with probability one, and from the pivot back to
    /// each state `j` with probability `leaky_hmm_coefficient *
    /// initial_prob(j)`. Ensures gradual forgetting of context. Must be
    /// strictly positive; the closed-form recursion assumes it is small
    /// enough that epsilon self-loops are negligible.
    pub leaky_hmm_coefficient: f32,

    /// Cross-entropy regularization constant. Only used here to decide
    /// whether the cross-entropy derivative output is populated; the
    /// numeric value is consumed by the network-side code.
    pub xent_regularize: f32,

    /// Use the SMBR objective (interpolated with MMI) instead of plain MMI.
    pub use_smbr_objective: bool,

    /// Weight on the MMI term when the SMBR objective is in use.
    pub mmi_factor: f32,

    /// Weight on the SMBR term when the SMBR objective is in use.
    pub smbr_factor: f32,

    /// Exclude numerator posteriors of silence pdfs from the accuracy
    /// computation in SMBR training. Requires `silence_pdfs_str`.
    pub exclude_silence: bool,

    /// Treat all silence pdfs as a single class for the accuracy
    /// computation in SMBR training. Requires `silence_pdfs_str`.
    pub one_silence_class: bool,

    /// Colon- or comma-separated list of silence pdf indices. Makes
    /// sense only when the silence pdfs are context-independent.
    pub silence_pdfs_str: String,
}

impl Default for ChainTrainingOptions {
    fn default() -> Self {
        Self {
            l2_regularize: 0.0,
            norm_regularize: false,
            leaky_hmm_coefficient: 1.0e-5,
            xent_regularize: 0.0,
            use_smbr_objective: false,
            mmi_factor: 0.0,
            smbr_factor: 1.0,
            exclude_silence: false,
            one_silence_class: false,
            silence_pdfs_str: String::new(),
        }
    }
}

impl ChainTrainingOptions {
    /// Check option consistency.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `leaky_hmm_coefficient` is not strictly positive (the leaky
    ///   recursion is numerically unsafe at zero)
    /// - both `exclude_silence` and `one_silence_class` are set
    /// - a silence flag is set without a silence pdf list
    pub fn validate(&self) -> Result<()> {
        if !(self.leaky_hmm_coefficient > 0.0) {
            return Err(CadenaError::Config(format!(
                "leaky_hmm_coefficient must be > 0, got {}",
                self.leaky_hmm_coefficient
            )));
        }
        if self.exclude_silence && self.one_silence_class {
            return Err(CadenaError::Config(
                "exclude_silence and one_silence_class are mutually exclusive".into(),
            ));
        }
        if (self.exclude_silence || self.one_silence_class) && self.silence_pdfs_str.is_empty() {
            return Err(CadenaError::Config(
                "exclude_silence / one_silence_class require silence_pdfs_str".into(),
            ));
        }
        Ok(())
    }

    /// Build the length-`num_pdfs` silence index vector from
    /// `silence_pdfs_str`, or `None` when no silence treatment is
    /// requested.
    ///
    /// Entry `i` of the result is `-1` if pdf `i` is a silence pdf and
    /// `i` otherwise, the layout the SMBR driver's column-masking
    /// expects.
    pub fn silence_indices(&self, num_pdfs: usize) -> Result<Option<Vec<i32>>> {
        if !self.exclude_silence && !self.one_silence_class {
            return Ok(None);
        }
        let silence_pdfs = parse_silence_pdfs(&self.silence_pdfs_str)?;
        build_silence_indices(&silence_pdfs, num_pdfs).map(Some)
    }
}

/// Parse a colon- or comma-separated list of pdf indices.
pub fn parse_silence_pdfs(list: &str) -> Result<Vec<usize>> {
    let mut pdfs = Vec::new();
    for tok in list.split([':', ',']).filter(|t| !t.is_empty()) {
        let pdf = tok
            .parse::<usize>()
            .map_err(|_| CadenaError::Config(format!("bad silence pdf index '{tok}' in '{list}'")))?;
        pdfs.push(pdf);
    }
    if pdfs.is_empty() {
        return Err(CadenaError::Config(format!(
            "empty silence pdf list '{list}'"
        )));
    }
    Ok(pdfs)
}

/// Build the silence index vector: `-1` at silence columns, `i` elsewhere.
pub fn build_silence_indices(silence_pdfs: &[usize], num_pdfs: usize) -> Result<Vec<i32>> {
    let mut indices: Vec<i32> = (0..num_pdfs as i32).collect();
    for &pdf in silence_pdfs {
        if pdf >= num_pdfs {
            return Err(CadenaError::Config(format!(
                "silence pdf {pdf} out of range (num_pdfs = {num_pdfs})"
            )));
        }
        indices[pdf] = -1;
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ChainTrainingOptions::default();
        assert_eq!(opts.l2_regularize, 0.0);
        assert_eq!(opts.leaky_hmm_coefficient, 1.0e-5);
        assert_eq!(opts.mmi_factor, 0.0);
        assert_eq!(opts.smbr_factor, 1.0);
        assert!(!opts.use_smbr_objective);
        assert!(!opts.norm_regularize);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_rejects_nonpositive_leaky_coefficient() {
        let mut opts = ChainTrainingOptions::default();
        opts.leaky_hmm_coefficient = 0.0;
        assert!(opts.validate().is_err());
        opts.leaky_hmm_coefficient = -1.0e-5;
        assert!(opts.validate().is_err());
        opts.leaky_hmm_coefficient = f32::NAN;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_silence_flags_mutually_exclusive() {
        let mut opts = ChainTrainingOptions::default();
        opts.exclude_silence = true;
        opts.one_silence_class = true;
        opts.silence_pdfs_str = "0".into();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_silence_flag_requires_pdf_list() {
        let mut opts = ChainTrainingOptions::default();
        opts.exclude_silence = true;
        assert!(opts.validate().is_err());
        opts.silence_pdfs_str = "0:1".into();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_parse_silence_pdfs() {
        assert_eq!(parse_silence_pdfs("0:1:2").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_silence_pdfs("3,7").unwrap(), vec![3, 7]);
        assert!(parse_silence_pdfs("").is_err());
        assert!(parse_silence_pdfs("1:x").is_err());
    }

    #[test]
    fn test_build_silence_indices() {
        let idx = build_silence_indices(&[1, 3], 5).unwrap();
        assert_eq!(idx, vec![0, -1, 2, -1, 4]);
        assert!(build_silence_indices(&[5], 5).is_err());
    }

    #[test]
    fn test_silence_indices_none_when_unused() {
        let opts = ChainTrainingOptions::default();
        assert!(opts.silence_indices(10).unwrap().is_none());
    }

    #[test]
    fn test_silence_indices_from_options() {
        let mut opts = ChainTrainingOptions::default();
        opts.exclude_silence = true;
        opts.silence_pdfs_str = "0,2".into();
        let idx = opts.silence_indices(4).unwrap().unwrap();
        assert_eq!(idx, vec![-1, 1, -1, 3]);
    }
}
