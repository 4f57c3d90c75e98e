//! End-to-end objective scenarios on small, hand-checkable graphs.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use cadena::{
    compute_objf_and_deriv, compute_smbr_objf_and_deriv, ChainTrainingOptions,
    DenominatorComputation, DenominatorGraph, DenominatorSmbrComputation, FstArc, GraphArc,
    Supervision, SupervisionFst,
};
use ndarray::Array2;

/// Single state, one pdf, unit self-loop.
fn single_state_graph() -> DenominatorGraph {
    DenominatorGraph::new(
        &[GraphArc {
            src: 0,
            dst: 0,
            pdf: 0,
            log_prob: 0.0,
        }],
        1,
        1,
    )
    .unwrap()
}

/// Two states, self and cross arcs with unit probability; pdf follows
/// the destination state.
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

/// Linear supervision path through the given pdf sequence.
fn linear_fst(pdfs: &[u32]) -> SupervisionFst {
    let arcs: Vec<FstArc> = pdfs
        .iter()
        .enumerate()
        .map(|(i, &pdf)| FstArc {
            src: i as u32,
            dst: i as u32 + 1,
            pdf,
            log_weight: 0.0,
        })
        .collect();
    SupervisionFst::new(pdfs.len() + 1, &arcs, &[(pdfs.len() as u32, 0.0)]).unwrap()
}

#[test]
fn s1_single_state_graph_is_exactly_neutral() {
    let graph = single_state_graph();
    let supervision = Supervision::compact(vec![linear_fst(&[0, 0, 0])], 3, 1.0).unwrap();
    let x = Array2::<f32>::zeros((3, 1));
    let mut deriv = Array2::<f32>::zeros((3, 1));
    let opts = ChainTrainingOptions::default();

    let result =
        compute_objf_and_deriv(&opts, &graph, &supervision, &x, Some(&mut deriv), None).unwrap();
    assert_abs_diff_eq!(result.objf, 0.0, epsilon = 1e-5);
    assert_eq!(result.l2_term, 0.0);
    assert_eq!(result.weight, 3.0);
    for v in &deriv {
        assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn s2_ring_log_z_tracks_per_frame_score_mass() {
    // Uniform scores on the complete ring: every frame multiplies Z by
    // (2 - kappa), i.e. by sum_pdf exp(score) up to the leaky mass.
    let kappa = 0.1f32;
    let t_count = 10;
    let graph = complete_ring();
    let x = Array2::<f32>::zeros((t_count, 2));
    let opts = ChainTrainingOptions {
        leaky_hmm_coefficient: kappa,
        ..ChainTrainingOptions::default()
    };
    let mut den = DenominatorComputation::new(&opts, &graph, 1, &x);
    let (log_z, ok) = den.forward();
    assert!(ok);
    let exact = t_count as f32 * (2.0 - kappa).ln() + 0.5f32.ln();
    assert_relative_eq!(log_z, exact, epsilon = 1e-4);
    // Dominated by T * log(sum_pdf exp(score)).
    let dominant = t_count as f32 * 2.0f32.ln();
    assert!((log_z - dominant).abs() < 0.2 * dominant);
}

#[test]
fn s3_non_finite_scores_substitute_default_objective() {
    let graph = complete_ring();
    let supervision = Supervision::compact(vec![linear_fst(&[0, 1, 0])], 3, 1.0).unwrap();
    let mut x = Array2::<f32>::zeros((3, 2));
    x[[2, 1]] = f32::INFINITY;
    let mut deriv = Array2::<f32>::from_elem((3, 2), 5.0);
    let mut xent = Array2::<f32>::from_elem((3, 2), 5.0);
    let opts = ChainTrainingOptions::default();

    let result = compute_objf_and_deriv(
        &opts,
        &graph,
        &supervision,
        &x,
        Some(&mut deriv),
        Some(&mut xent),
    )
    .unwrap();
    assert_eq!(result.objf, -10.0 * result.weight);
    assert!(deriv.iter().all(|&v| v == 0.0));
    assert!(xent.iter().all(|&v| v == 0.0));
}

#[test]
fn s4_smbr_objectives_decompose() {
    let graph = complete_ring();
    let supervision = Supervision::compact(vec![linear_fst(&[0, 1, 1, 0])], 4, 1.0).unwrap();
    let x = Array2::from_shape_fn((4, 2), |(r, c)| 0.2 * r as f32 - 0.3 * c as f32);
    let opts = ChainTrainingOptions {
        use_smbr_objective: true,
        mmi_factor: 0.0,
        smbr_factor: 1.0,
        ..ChainTrainingOptions::default()
    };
    let mut deriv = Array2::<f32>::zeros((4, 2));
    let result = compute_smbr_objf_and_deriv(
        &opts,
        &graph,
        &supervision,
        &x,
        Some(&mut deriv),
        None,
        None,
    )
    .unwrap();

    // With mmi_factor = 0 the MMI component is -log Z_den alone.
    let mut den = DenominatorComputation::new(&opts, &graph, 1, &x);
    let (log_z, ok) = den.forward();
    assert!(ok);
    assert_relative_eq!(result.mmi_objf, -log_z, epsilon = 1e-4);

    // objf is the expected frame accuracy under the numerator
    // posterior: bounded by the frame count and positive here.
    assert!(result.objf > 0.0);
    assert!(result.objf < 4.0 + 1e-4);

    // The expected accuracy is linear in the reference posterior, so
    // negating it flips the sign of the SMBR objective.
    let mut posterior = Array2::<f32>::zeros((4, 2));
    let mut numerator = cadena::NumeratorComputation::new(&supervision, &x);
    numerator.forward();
    numerator.backward(&mut posterior);
    let negated = posterior.mapv(|v| -v);
    let mut den_pos = DenominatorSmbrComputation::new(&opts, &graph, 1, &x, &posterior);
    let mut den_neg = DenominatorSmbrComputation::new(&opts, &graph, 1, &x, &negated);
    let f_pos = den_pos.forward_smbr();
    let f_neg = den_neg.forward_smbr();
    assert!(f_pos.ok && f_neg.ok);
    assert_relative_eq!(f_pos.smbr_objf, -f_neg.smbr_objf, epsilon = 1e-4);
    assert_relative_eq!(result.objf, f_pos.smbr_objf, epsilon = 1e-4);
}

#[test]
fn s5_kl_mode_is_stationary_at_matching_targets() {
    // Denominator posterior of a one-state graph with uniform
    // transitions is softmax(x); targets equal to it zero the gradient.
    let arcs = vec![
        GraphArc {
            src: 0,
            dst: 0,
            pdf: 0,
            log_prob: (1.0f32 / 3.0).ln(),
        },
        GraphArc {
            src: 0,
            dst: 0,
            pdf: 1,
            log_prob: (1.0f32 / 3.0).ln(),
        },
        GraphArc {
            src: 0,
            dst: 0,
            pdf: 2,
            log_prob: (1.0f32 / 3.0).ln(),
        },
    ];
    let graph = DenominatorGraph::new(&arcs, 1, 3).unwrap();
    let x = Array2::from_shape_fn((4, 3), |(r, c)| 0.35 * r as f32 - 0.6 * c as f32);
    let mut targets = Array2::<f32>::zeros((4, 3));
    for (mut t_row, x_row) in targets.rows_mut().into_iter().zip(x.rows()) {
        let max = x_row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = x_row.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        for (slot, e) in t_row.iter_mut().zip(exp.iter()) {
            *slot = e / sum;
        }
    }
    let supervision = Supervision::targets(targets, 1, 4, 1.0).unwrap();
    let mut deriv = Array2::<f32>::zeros((4, 3));
    let opts = ChainTrainingOptions::default();
    let result =
        compute_objf_and_deriv(&opts, &graph, &supervision, &x, Some(&mut deriv), None).unwrap();
    assert!(result.objf.is_finite());
    for v in &deriv {
        assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-4);
    }
}

#[test]
fn s6_unreachable_generic_numerator_fails_whole_minibatch() {
    let graph = complete_ring();
    // This FST accepts only odd path lengths; T = 4 is unreachable.
    let fst = SupervisionFst::new(
        2,
        &[
            FstArc {
                src: 0,
                dst: 1,
                pdf: 0,
                log_weight: 0.0,
            },
            FstArc {
                src: 1,
                dst: 0,
                pdf: 1,
                log_weight: 0.0,
            },
        ],
        &[(1, 0.0)],
    )
    .unwrap();
    let supervision = Supervision::generic(vec![fst], 4, 1.0).unwrap();
    let x = Array2::<f32>::zeros((4, 2));
    let mut deriv = Array2::<f32>::from_elem((4, 2), 1.0);
    let mut xent = Array2::<f32>::from_elem((4, 2), 1.0);
    let opts = ChainTrainingOptions::default();
    let result = compute_objf_and_deriv(
        &opts,
        &graph,
        &supervision,
        &x,
        Some(&mut deriv),
        Some(&mut xent),
    )
    .unwrap();
    assert_eq!(result.objf, -10.0 * result.weight);
    assert!(deriv.iter().all(|&v| v == 0.0));
    assert!(xent.iter().all(|&v| v == 0.0));
}
