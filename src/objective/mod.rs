//! Objective drivers: numerator plus denominator in one call.
//!
//! [`compute_objf_and_deriv`] handles the MMI and KL objectives;
//! [`compute_smbr_objf_and_deriv`] the SMBR objective interpolated with
//! MMI. Both are pure functions of `(options, graph, supervision,
//! scores)`: the gradient buffers are borrowed for the duration of the
//! call and a pathological minibatch never aborts the caller — the
//! objective is substituted, the gradients zeroed, and a warning
//! emitted, so a multi-day training run survives the occasional bad
//! example.

use ndarray::Array2;
use tracing::{debug, warn};

use crate::config::ChainTrainingOptions;
use crate::denominator::{DenominatorComputation, DenominatorSmbrComputation};
use crate::error::{CadenaError, Result};
use crate::graph::DenominatorGraph;
use crate::numerator::{GenericNumeratorComputation, NumeratorComputation};
use crate::supervision::{Supervision, SupervisionKind};

/// Default per-frame objective substituted when a minibatch fails
/// numerically.
const DEFAULT_OBJF_PER_FRAME: f32 = -10.0;

/// Scalar outputs of the MMI / KL driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveResult {
    /// `num_logprob_weighted - weight * log Z_den` (KL mode:
    /// `-weight * log Z_den`). Divide by `weight` for display.
    pub objf: f32,
    /// The L2 or norm regularization term, zero when unused.
    pub l2_term: f32,
    /// Normalizer: `supervision.weight * num_sequences *
    /// frames_per_sequence`.
    pub weight: f32,
}

/// Scalar outputs of the SMBR driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmbrObjectiveResult {
    /// `weight * smbr_factor * expected-frame-accuracy`.
    pub objf: f32,
    /// `weight * (-log Z_den) + mmi_factor * num_logprob_weighted`.
    pub mmi_objf: f32,
    /// The L2 or norm regularization term, zero when unused.
    pub l2_term: f32,
    /// Normalizer, as in [`ObjectiveResult`].
    pub weight: f32,
}

/// Compute the chain objective and, optionally, its gradient.
///
/// `x` has shape `(frames_per_sequence * num_sequences, num_pdfs)`;
/// row `t*S + s` is frame `t` of sequence `s`. `deriv` (same shape,
/// zeroed here) receives the full gradient; `xent_deriv` receives the
/// weighted numerator posterior, for cross-entropy regularization, and
/// is filled even when `deriv` is absent.
///
/// The denominator runs first so its exp-score scratch (the largest
/// transient) is freed before the cross-entropy buffer is written.
///
/// # Errors
///
/// Returns an error for inconsistent options. Shape mismatches panic
/// (caller bugs); numerical failures are substituted, not returned.
pub fn compute_objf_and_deriv(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    x: &Array2<f32>,
    mut deriv: Option<&mut Array2<f32>>,
    mut xent_deriv: Option<&mut Array2<f32>>,
) -> Result<ObjectiveResult> {
    opts.validate()?;
    check_shapes(den_graph, supervision, x, deriv.as_deref(), xent_deriv.as_deref());

    let s_count = supervision.num_sequences();
    let t_count = supervision.frames_per_sequence();
    let w = supervision.weight();
    let tot_weight = w * s_count as f32 * t_count as f32;

    if let Some(d) = deriv.as_deref_mut() {
        d.fill(0.0);
    }
    if let Some(xd) = xent_deriv.as_deref_mut() {
        xd.fill(0.0);
    }

    let (den_logprob, den_ok) = {
        let mut den = DenominatorComputation::new(opts, den_graph, s_count, x);
        let (log_z, forward_ok) = den.forward();
        let backward_ok = match deriv.as_deref_mut() {
            Some(d) => den.backward(-w, d),
            None => true,
        };
        (log_z, forward_ok && backward_ok)
    };

    let need_posterior = deriv.is_some() || xent_deriv.is_some();
    let mut num_logprob_weighted = 0.0f32;
    let mut num_ok = true;
    match supervision.kind() {
        SupervisionKind::Compact(_) => {
            let mut numerator = NumeratorComputation::new(supervision, x);
            num_logprob_weighted = numerator.forward();
            if need_posterior {
                let mut posterior = Array2::<f32>::zeros(x.raw_dim());
                numerator.backward(&mut posterior);
                if let Some(d) = deriv.as_deref_mut() {
                    *d += &posterior;
                }
                if let Some(xd) = xent_deriv.as_deref_mut() {
                    xd.assign(&posterior);
                }
            }
        }
        SupervisionKind::Generic(_) => {
            let mut numerator = GenericNumeratorComputation::new(supervision, x);
            let (logprob, ok) = numerator.forward();
            num_logprob_weighted = logprob;
            num_ok = ok;
            if need_posterior {
                let mut posterior = Array2::<f32>::zeros(x.raw_dim());
                numerator.backward(&mut posterior);
                if let Some(d) = deriv.as_deref_mut() {
                    *d += &posterior;
                }
                if let Some(xd) = xent_deriv.as_deref_mut() {
                    xd.assign(&posterior);
                }
            }
        }
        SupervisionKind::Targets(targets) => {
            // KL mode: the numerator log-likelihood is not defined; the
            // numerator-side gradient is the fixed target posterior.
            if let Some(d) = deriv.as_deref_mut() {
                d.scaled_add(w, targets);
            }
            if let Some(xd) = xent_deriv.as_deref_mut() {
                xd.fill(0.0);
                xd.scaled_add(w, targets);
            }
        }
    }

    let mut objf = num_logprob_weighted - w * den_logprob;
    if !objf.is_finite() || !den_ok || !num_ok {
        if let Some(d) = deriv.as_deref_mut() {
            d.fill(0.0);
        }
        if let Some(xd) = xent_deriv.as_deref_mut() {
            xd.fill(0.0);
        }
        warn!(
            objf,
            den_ok,
            num_ok,
            "objective not finite or forward-backward failed, \
             substituting {DEFAULT_OBJF_PER_FRAME} per frame"
        );
        objf = DEFAULT_OBJF_PER_FRAME * tot_weight;
    }

    log_deriv_norms_per_frame(deriv.as_deref(), t_count, s_count);

    let l2_term = apply_regularizer(opts, w, x, deriv.as_deref_mut());

    Ok(ObjectiveResult {
        objf,
        l2_term,
        weight: tot_weight,
    })
}

/// Compute the SMBR objective (interpolated with MMI) and, optionally,
/// its gradient.
///
/// The numerator posteriors feed the denominator backward as per-arc
/// accuracies, optionally silence-masked through `sil_indices`
/// (length-`P`, `-1` at silence columns, `i` elsewhere; see
/// [`ChainTrainingOptions::silence_indices`]). Requires compact
/// supervision.
///
/// # Errors
///
/// Returns an error for inconsistent options, non-compact supervision,
/// or a bad silence index vector.
pub fn compute_smbr_objf_and_deriv(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    x: &Array2<f32>,
    mut deriv: Option<&mut Array2<f32>>,
    mut xent_deriv: Option<&mut Array2<f32>>,
    sil_indices: Option<&[i32]>,
) -> Result<SmbrObjectiveResult> {
    opts.validate()?;
    check_shapes(den_graph, supervision, x, deriv.as_deref(), xent_deriv.as_deref());
    if !matches!(supervision.kind(), SupervisionKind::Compact(_)) {
        return Err(CadenaError::Config(
            "the SMBR objective requires compact supervision".into(),
        ));
    }
    if let Some(indices) = sil_indices {
        if indices.len() != den_graph.num_pdfs() {
            return Err(CadenaError::Config(format!(
                "silence index vector has length {}, expected num_pdfs = {}",
                indices.len(),
                den_graph.num_pdfs()
            )));
        }
    }

    let s_count = supervision.num_sequences();
    let t_count = supervision.frames_per_sequence();
    let w = supervision.weight();
    let tot_weight = w * s_count as f32 * t_count as f32;
    let mmi_factor = opts.mmi_factor;

    // Numerator first: its posteriors are the accuracy targets.
    let mut num_posteriors = Array2::<f32>::zeros(x.raw_dim());
    let num_logprob_weighted;
    {
        let mut numerator = NumeratorComputation::new(supervision, x);
        num_logprob_weighted = numerator.forward();
        numerator.backward(&mut num_posteriors);
    }

    if let Some(d) = deriv.as_deref_mut() {
        d.fill(0.0);
        if mmi_factor != 0.0 {
            d.scaled_add(mmi_factor, &num_posteriors);
        }
    }
    if let Some(xd) = xent_deriv.as_deref_mut() {
        xd.assign(&num_posteriors);
    }

    if let Some(indices) = sil_indices {
        if opts.exclude_silence {
            zero_silence_columns(&mut num_posteriors, indices);
        } else if opts.one_silence_class {
            merge_silence_columns(&mut num_posteriors, indices);
        }
    }

    let mut denominator =
        DenominatorSmbrComputation::new(opts, den_graph, s_count, x, &num_posteriors);
    let forward = denominator.forward_smbr();
    let mut ok = forward.ok;
    if let Some(d) = deriv.as_deref_mut() {
        ok = denominator.backward_smbr(w, d) && ok;
    }

    let mut objf = w * forward.smbr_objf;
    let mut mmi_objf = w * forward.neg_log_z + mmi_factor * num_logprob_weighted;
    let total_objf = objf + mmi_objf;
    if !total_objf.is_finite() || !ok {
        if let Some(d) = deriv.as_deref_mut() {
            d.fill(0.0);
        }
        if let Some(xd) = xent_deriv.as_deref_mut() {
            xd.fill(0.0);
        }
        warn!(
            total_objf,
            ok,
            "SMBR objective not finite or forward-backward failed, \
             substituting the default objective"
        );
        mmi_objf = DEFAULT_OBJF_PER_FRAME * mmi_factor * tot_weight;
        objf = 0.0;
    }

    log_deriv_norms_per_frame(deriv.as_deref(), t_count, s_count);

    let l2_term = apply_regularizer(opts, w, x, deriv.as_deref_mut());

    Ok(SmbrObjectiveResult {
        objf,
        mmi_objf,
        l2_term,
        weight: tot_weight,
    })
}

fn check_shapes(
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    x: &Array2<f32>,
    deriv: Option<&Array2<f32>>,
    xent_deriv: Option<&Array2<f32>>,
) {
    let rows = supervision.num_sequences() * supervision.frames_per_sequence();
    assert_eq!(
        x.dim(),
        (rows, den_graph.num_pdfs()),
        "score matrix shape {:?} does not match supervision/graph ({rows} x {})",
        x.dim(),
        den_graph.num_pdfs()
    );
    if let Some(d) = deriv {
        assert_eq!(d.dim(), x.dim(), "derivative buffer shape mismatch");
    }
    if let Some(xd) = xent_deriv {
        assert_eq!(xd.dim(), x.dim(), "xent derivative buffer shape mismatch");
    }
    if let SupervisionKind::Targets(targets) = supervision.kind() {
        assert_eq!(targets.dim(), x.dim(), "target posterior shape mismatch");
    }
}

/// Apply the L2 (or norm) regularizer; returns the penalty term.
fn apply_regularizer(
    opts: &ChainTrainingOptions,
    w: f32,
    x: &Array2<f32>,
    deriv: Option<&mut Array2<f32>>,
) -> f32 {
    if opts.l2_regularize == 0.0 {
        return 0.0;
    }
    let scale = w * opts.l2_regularize;
    if opts.norm_regularize {
        let term: f64 = x.iter().map(|&v| f64::from(v.exp())).sum();
        if let Some(d) = deriv {
            d.zip_mut_with(x, |dv, &xv| *dv -= scale * xv.exp());
        }
        -scale * term as f32
    } else {
        let norm_sq: f64 = x.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
        if let Some(d) = deriv {
            d.scaled_add(-scale, x);
        }
        -0.5 * scale * norm_sq as f32
    }
}

/// Zero the columns marked `-1` in the silence index vector.
fn zero_silence_columns(posteriors: &mut Array2<f32>, sil_indices: &[i32]) {
    for (pdf, &index) in sil_indices.iter().enumerate() {
        if index < 0 {
            posteriors.column_mut(pdf).fill(0.0);
        }
    }
}

/// Replace every silence column by the row-wise sum over all silence
/// columns, treating the silence pdfs as one class.
fn merge_silence_columns(posteriors: &mut Array2<f32>, sil_indices: &[i32]) {
    let silence: Vec<usize> = sil_indices
        .iter()
        .enumerate()
        .filter(|(_, &index)| index < 0)
        .map(|(pdf, _)| pdf)
        .collect();
    if silence.is_empty() {
        return;
    }
    for mut row in posteriors.rows_mut() {
        let total: f32 = silence.iter().map(|&pdf| row[pdf]).sum();
        for &pdf in &silence {
            row[pdf] = total;
        }
    }
}

/// Debug-level summary of gradient magnitudes per frame index. Row
/// `t*S + s` belongs to frame `t`, so row squared norms are pooled over
/// sequences; derivatives shrink towards the sequence edges.
fn log_deriv_norms_per_frame(deriv: Option<&Array2<f32>>, t_count: usize, s_count: usize) {
    let Some(deriv) = deriv else {
        return;
    };
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let mut per_frame = vec![0.0f32; t_count];
    for (row_index, row) in deriv.rows().into_iter().enumerate() {
        per_frame[row_index / s_count] += row.iter().map(|&v| v * v).sum::<f32>();
    }
    debug!(?per_frame, "derivative squared norms per frame");
}
