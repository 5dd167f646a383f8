//! Integration tests: end-to-end runs of the iteration controller against a
//! synthetic sensitivity field.
//!
//! The FEM stand-in returns fixed positive sensitivities that grow toward
//! the right edge of the domain, which is enough to drive the primitives
//! and exercise every stage of the loop.

use ndarray::{Array1, ArrayView1};
use primtopo::config::{EngineConfig, EngineKind};
use primtopo::merge::{MergePhase, MergeSchedule};
use primtopo::optimizer::{Checkpoint, IterationController, StopReason};
use primtopo::pool::SlotId;
use primtopo::shape::{GaussianShape, SdfBatch, ShapeCodeKind, ShapeModel};
use primtopo::types::{Interval, Mesh, ParamGroup, TopOptError};
use primtopo::TopologyEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_mesh() -> Mesh {
    Mesh::rectangular_grid(60, 20, 0.6, 0.2).unwrap()
}

fn gaussian_config(max_iter: usize) -> EngineConfig {
    let mut config = EngineConfig::for_kind(EngineKind::GaussianSplatting);
    config.max_iter = max_iter;
    config.n_g = 24;
    config.n_g_x = 6;
    config.n_g_y = 3;
    config
}

fn build(config: EngineConfig, mesh: Mesh) -> TopologyEngine {
    let model = Arc::new(GaussianShape::new(config.ratio_bounds));
    TopologyEngine::with_models(config, mesh, model, None, None).unwrap()
}

/// Sensitivities `1 + 2x` at every element centroid.
fn synthetic_fem(mesh: &Mesh) -> impl FnMut(ArrayView1<f64>) -> Result<Array1<f64>, TopOptError> {
    let ce: Array1<f64> = mesh.centroids().column(0).mapv(|x| 1.0 + 2.0 * x);
    move |h: ArrayView1<f64>| {
        assert_eq!(h.len(), ce.len());
        Ok(ce.clone())
    }
}

/// Gaussian kernel whose `template_code` fails while `failing` is set.
#[derive(Debug)]
struct SwitchableTemplates {
    inner: GaussianShape,
    failing: Arc<AtomicBool>,
}

impl ShapeModel for SwitchableTemplates {
    fn latent_dim(&self) -> usize {
        self.inner.latent_dim()
    }

    fn code_bounds(&self) -> Vec<Interval> {
        self.inner.code_bounds()
    }

    fn support(&self) -> f64 {
        self.inner.support()
    }

    fn sdf_with_grad(&self, code: &[f64], points: &[[f64; 2]]) -> SdfBatch {
        self.inner.sdf_with_grad(code, points)
    }

    fn radius_latent_dim(&self) -> usize {
        self.inner.radius_latent_dim()
    }

    fn radius_sum(&self, prefix: &[f64]) -> f64 {
        self.inner.radius_sum(prefix)
    }

    fn radius_sum_grad(&self, prefix: &[f64]) -> Vec<f64> {
        self.inner.radius_sum_grad(prefix)
    }

    fn template_code(&self, ratio: f64) -> Result<Vec<f64>, TopOptError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TopOptError::InvalidConfig("template encoder unavailable".into()));
        }
        self.inner.template_code(ratio)
    }

    fn nominal_area(&self, code: &[f64], scale: f64) -> Option<f64> {
        self.inner.nominal_area(code, scale)
    }

    fn code_kind(&self) -> ShapeCodeKind {
        self.inner.code_kind()
    }
}

/// Two overlapping primitives merging at iteration 1.
fn overlapping_pair_config() -> EngineConfig {
    let mut config = gaussian_config(5);
    config.n_g = 4;
    config.n_g_x = 2;
    config.n_g_y = 1;
    config.seed_x = [0.25, 0.30];
    config.seed_y = [0.1, 0.1];
    config.merging = MergeSchedule { merging_markers: vec![1], merging_adaptation_length: 2 };
    config
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn run_reaches_max_iter_with_finite_objective() {
    init_tracing();
    let mesh = test_mesh();
    let mut fem = synthetic_fem(&mesh);
    let mut controller = IterationController::new(build(gaussian_config(8), mesh));

    let summary = controller.run(&mut fem).unwrap();

    assert_eq!(summary.stop, StopReason::MaxIterations);
    assert_eq!(summary.reports.len(), 8);
    assert!(controller.is_finished());
    for (t, report) in summary.reports.iter().enumerate() {
        assert_eq!(report.iteration, t);
        assert!(report.objective.minimized.is_finite());
        assert!(report.objective.true_sign.is_finite());
        assert_eq!(report.live, 18);
        assert_eq!(report.phase, MergePhase::Idle);
        assert!(report.merges.is_empty());
    }
    assert_eq!(summary.reports[0].change, 0.0);
    assert!(summary.reports[1..].iter().any(|r| r.change > 0.0), "primitives should move");
    assert_eq!(summary.design.len(), 18);

    eprintln!(
        "run_reaches_max_iter: J0 = {:.6e}  J7 = {:.6e}",
        summary.reports[0].objective.minimized, summary.reports[7].objective.minimized
    );
}

#[test]
fn overlapping_pair_merges_at_marker() {
    init_tracing();
    let config = overlapping_pair_config();
    let mesh = test_mesh();
    let mut fem = synthetic_fem(&mesh);
    let mut controller = IterationController::new(build(config, mesh));

    let summary = controller.run(&mut fem).unwrap();
    let phases: Vec<MergePhase> = summary.reports.iter().map(|r| r.phase).collect();
    assert_eq!(
        phases,
        vec![
            MergePhase::PreparingMerge,
            MergePhase::Merging,
            MergePhase::Adapting,
            MergePhase::Idle,
            MergePhase::Idle
        ]
    );

    let merged = &summary.reports[1].merges;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].consumed, [SlotId(0), SlotId(1)]);
    assert_eq!(merged[0].created, SlotId(2));
    assert!(merged[0].peak > 1.5);
    assert_eq!(summary.reports[1].live, 1);
    assert_eq!(summary.design.len(), 1);
    assert!(summary.design.scale[0] > 0.027 && summary.design.scale[0] < 0.06);
}

#[test]
fn interrupt_stops_between_iterations() {
    init_tracing();
    let mesh = test_mesh();
    let ce: Array1<f64> = Array1::from_elem(mesh.len(), 1.0);
    let flag = Arc::new(AtomicBool::new(false));
    let trip = Arc::clone(&flag);
    let mut calls = 0usize;
    let mut fem = move |_h: ArrayView1<f64>| -> Result<Array1<f64>, TopOptError> {
        calls += 1;
        if calls == 3 {
            trip.store(true, Ordering::Relaxed);
        }
        Ok(ce.clone())
    };

    let mut controller = IterationController::new(build(gaussian_config(50), mesh)).with_interrupt(flag);
    let summary = controller.run(&mut fem).unwrap();

    assert_eq!(summary.stop, StopReason::Interrupted);
    assert_eq!(summary.reports.len(), 3);
    assert_eq!(controller.iteration(), 3);
    assert_eq!(summary.design.len(), 18);
}

#[test]
fn sensitivity_length_mismatch_is_an_error() {
    let mesh = test_mesh();
    let mut fem = |_h: ArrayView1<f64>| -> Result<Array1<f64>, TopOptError> { Ok(Array1::zeros(7)) };
    let mut controller = IterationController::new(build(gaussian_config(3), mesh));
    assert!(matches!(controller.step(&mut fem), Err(TopOptError::Sensitivity(_))));
}

#[test]
fn fem_failure_propagates() {
    let mesh = test_mesh();
    let mut fem = |_h: ArrayView1<f64>| -> Result<Array1<f64>, TopOptError> {
        Err(TopOptError::Sensitivity("solver diverged".into()))
    };
    let mut controller = IterationController::new(build(gaussian_config(3), mesh));
    assert!(controller.run(&mut fem).is_err());
    assert_eq!(controller.iteration(), 0);
}

#[test]
fn checkpoint_resume_reproduces_the_run() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let mesh = test_mesh();
    let mut fem = synthetic_fem(&mesh);

    let mut first = IterationController::new(build(gaussian_config(10), mesh.clone()));
    for _ in 0..4 {
        first.step(&mut fem).unwrap();
    }
    first.checkpoint().save(&path).unwrap();
    let straight: Vec<f64> = (0..3).map(|_| first.step(&mut fem).unwrap().objective.minimized).collect();

    let mut second = IterationController::new(build(gaussian_config(10), mesh));
    second.restore(Checkpoint::load(&path).unwrap()).unwrap();
    assert_eq!(second.iteration(), 4);
    let resumed: Vec<f64> = (0..3).map(|_| second.step(&mut fem).unwrap().objective.minimized).collect();

    for (a, b) in straight.iter().zip(&resumed) {
        let rel = (a - b).abs() / a.abs().max(1e-12);
        assert!(rel < 1e-9, "straight {a:.12e} vs resumed {b:.12e}");
    }
}

#[test]
fn restore_rejects_mismatched_pool() {
    let mesh = test_mesh();
    let small = IterationController::new(build(gaussian_config(3), mesh.clone()));
    let mut config = gaussian_config(3);
    config.n_g = 30;
    let mut large = IterationController::new(build(config, mesh));
    assert!(matches!(large.restore(small.checkpoint()), Err(TopOptError::Shape(_))));
}

#[test]
fn non_finite_sensitivities_do_not_stop_the_run() {
    init_tracing();
    let mesh = test_mesh();
    let clean: Array1<f64> = mesh.centroids().column(0).mapv(|x| 1.0 + 2.0 * x);
    let mut calls = 0usize;
    let mut fem = move |_h: ArrayView1<f64>| -> Result<Array1<f64>, TopOptError> {
        calls += 1;
        let mut ce = clean.clone();
        if calls == 2 {
            ce.fill(f64::NAN);
        }
        Ok(ce)
    };
    let mut controller = IterationController::new(build(gaussian_config(4), mesh));

    let first = controller.step(&mut fem).unwrap();
    assert!(first.objective.minimized.is_finite());
    assert!(ParamGroup::ALL.iter().all(|&g| first.nan_replaced.get(g) == 0.0));

    let poisoned = controller.step(&mut fem).unwrap();
    assert!(poisoned.objective.minimized.is_nan());
    assert_eq!(poisoned.nan_replaced.get(ParamGroup::Offsets), 36.0);
    assert_eq!(poisoned.nan_replaced.get(ParamGroup::Scale), 18.0);
    assert_eq!(poisoned.nan_replaced.get(ParamGroup::Rotation), 18.0);
    assert_eq!(poisoned.nan_replaced.get(ParamGroup::ShapeCode), 18.0);
    let params = controller.engine().pool().params();
    assert!(params.iter().all(|(_, m)| m.iter().all(|v| v.is_finite())));

    let rest = controller.run(&mut fem).unwrap();
    assert_eq!(rest.stop, StopReason::MaxIterations);
    assert_eq!(rest.reports.len(), 2);
    assert!(rest.reports.iter().all(|r| r.objective.minimized.is_finite()));
    assert_eq!(controller.iteration(), 4);
}

#[test]
fn failed_merge_leaves_the_iteration_unapplied() {
    init_tracing();
    let mesh = test_mesh();
    let mut fem = synthetic_fem(&mesh);
    let failing = Arc::new(AtomicBool::new(false));
    let config = overlapping_pair_config();
    let model = Arc::new(SwitchableTemplates {
        inner: GaussianShape::new(config.ratio_bounds),
        failing: Arc::clone(&failing),
    });
    let engine = TopologyEngine::with_models(config.clone(), mesh.clone(), model, None, None).unwrap();
    let mut controller = IterationController::new(engine);
    let mut reference = IterationController::new(build(config, mesh));

    controller.step(&mut fem).unwrap();
    reference.step(&mut fem).unwrap();
    let params = controller.engine().pool().params().clone();

    failing.store(true, Ordering::Relaxed);
    assert!(matches!(controller.step(&mut fem), Err(TopOptError::InvalidConfig(_))));
    assert_eq!(controller.iteration(), 1);
    assert_eq!(controller.engine().pool().params(), &params);
    assert_eq!(controller.engine().pool().live_count(), 2);
    assert_eq!(controller.engine().merges().queue().len(), 1);

    failing.store(false, Ordering::Relaxed);
    let retried = controller.step(&mut fem).unwrap();
    let expected = reference.step(&mut fem).unwrap();
    assert_eq!(retried, expected);
    assert_eq!(retried.merges.len(), 1);
    assert_eq!(controller.engine().pool().params(), reference.engine().pool().params());
}
