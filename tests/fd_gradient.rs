//! Finite-difference gradient tests for every engine variant.
//!
//! Each test builds a small structured mesh with a cluster of overlapping
//! primitives, evaluates `forward` at a point and compares every component
//! of the analytic gradient (live rows of all four groups) against a
//! central-difference estimate:
//!
//!     dJ/dw_i  ≈  [ J(w + h eᵢ) − J(w − h eᵢ) ] / 2h
//!
//! Terms exercised: compliance, volume hinge (mean and area-weighted),
//! overlap, radius-sum and latent-distance shape terms, rasterisation.

use ndarray::Array1;
use primtopo::config::{EngineConfig, EngineKind};
use primtopo::engine::{DesignExport, ShapeExport, TopologyEngine};
use primtopo::pool::SlotId;
use primtopo::shape::{
    Activation, DenseLayerSpec, GaussianShape, LinearPredictor, LinearPredictorSpec, ManufacturabilityPredictor,
    MlpCheckpoint, MlpShapeModel, ShapeModel,
};
use primtopo::types::{Mesh, ParamGroup, PrimitiveParams};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Deterministic values in [−1, 1).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_mesh() -> Mesh {
    Mesh::rectangular_grid(24, 12, 0.6, 0.3).unwrap()
}

/// Smooth positive pseudo-sensitivities.
fn synthetic_ce(n: usize) -> Array1<f64> {
    Array1::from_iter((0..n).map(|e| 1.0 + 0.5 * (e as f64 * 0.37).sin()))
}

fn dense(rows: usize, cols: usize, rng: &mut Lcg, scale: f64, activation: Activation) -> DenseLayerSpec {
    DenseLayerSpec {
        weights: (0..rows).map(|_| (0..cols).map(|_| scale * rng.next()).collect()).collect(),
        bias: (0..rows).map(|_| 0.1 * rng.next()).collect(),
        activation,
        negative_slope: 0.2,
    }
}

/// Tiny decoder (latent 3) with encoder and latent statistics.
fn tiny_checkpoint() -> MlpCheckpoint {
    let mut rng = Lcg(7);
    MlpCheckpoint {
        sdf_layers: vec![
            dense(8, 5, &mut rng, 1.2, Activation::Tanh),
            dense(6, 8, &mut rng, 0.8, Activation::LeakyRelu),
            dense(1, 6, &mut rng, 1.0, Activation::Sigmoid),
        ],
        encoder_layers: vec![dense(4, 3, &mut rng, 0.5, Activation::Tanh), dense(3, 4, &mut rng, 0.5, Activation::Identity)],
        encoder_ratio_index: 1,
        radius_weights: vec![0.7, -0.4],
        radius_bias: 0.05,
        latent_mins: vec![-1.0, -1.0, -1.0],
        latent_maxs: vec![1.0, 1.0, 1.0],
        bounds_margin: 1.2,
        latent_mean: Some(vec![0.5, -0.5, 0.0]),
        latent_cov_inv: Some(vec![vec![2.0, 0.3, 0.0], vec![0.3, 1.0, 0.0], vec![0.0, 0.0, 0.5]]),
    }
}

/// Overwrite the first live slots with a tight cluster.
fn place_cluster(engine: &mut TopologyEngine, scale: f64, code_of: impl Fn(usize) -> Vec<f64>) {
    let centers = [[0.24, 0.15], [0.29, 0.15], [0.265, 0.19], [0.33, 0.12]];
    let live = engine.pool().live_slots();
    for (k, &slot) in live.iter().take(centers.len()).enumerate() {
        let params = PrimitiveParams {
            offset: centers[k],
            scale: scale * (1.0 + 0.1 * k as f64),
            rotation: 0.3 - 0.25 * k as f64,
            shape_code: code_of(k),
        };
        engine.pool_mut().encode_into(slot, &params);
    }
}

fn loss(engine: &mut TopologyEngine, ce: &Array1<f64>, iteration: usize) -> f64 {
    engine.get_x(iteration);
    engine.objective(ce.view(), iteration).unwrap().minimized
}

/// Compare analytic and central-difference gradients over all live rows.
fn fd_gradient_check(engine: &mut TopologyEngine, ce: &Array1<f64>, iteration: usize, h: f64, tol_abs: f64, tol_rel: f64) {
    engine.get_x(iteration);
    engine.forward(ce.view(), iteration).unwrap();
    let analytic = engine.gradients().unwrap().clone();
    let live: Vec<SlotId> = engine.pool().live_slots();

    let mut rows = Vec::new();
    for g in ParamGroup::ALL {
        let width = analytic[g].ncols();
        for &slot in &live {
            for col in 0..width {
                let w0 = engine.pool().params()[g][[slot.0, col]];

                engine.pool_mut().params_mut()[g][[slot.0, col]] = w0 + h;
                let f_plus = loss(engine, ce, iteration);
                engine.pool_mut().params_mut()[g][[slot.0, col]] = w0 - h;
                let f_minus = loss(engine, ce, iteration);
                engine.pool_mut().params_mut()[g][[slot.0, col]] = w0;

                let fd = (f_plus - f_minus) / (2.0 * h);
                rows.push((g, slot, col, analytic[g][[slot.0, col]], fd));
            }
        }
    }

    let mut max_abs = 0.0_f64;
    let mut max_rel = 0.0_f64;
    eprintln!("──────────────────────────────────────────────");
    eprintln!("FD gradient check  (h = {h:.1e}, {} components)", rows.len());
    for &(g, slot, col, a, fd) in &rows {
        let abs_err = (a - fd).abs();
        let rel_err = abs_err / fd.abs().max(a.abs()).max(1e-14);
        max_abs = max_abs.max(abs_err);
        max_rel = max_rel.max(rel_err);
        let flag = if abs_err > tol_abs && rel_err > tol_rel { " <<<" } else { "" };
        eprintln!(
            "  {:>10}{slot}[{col}]  analytic={a:+12.6e}  fd={fd:+12.6e}  abs={abs_err:.2e}  rel={rel_err:.2e}{flag}",
            g.name()
        );
    }
    eprintln!("  max abs = {max_abs:.3e}, max rel = {max_rel:.3e}");
    eprintln!("──────────────────────────────────────────────");

    for &(g, slot, col, a, fd) in &rows {
        let abs_err = (a - fd).abs();
        let rel_err = abs_err / fd.abs().max(a.abs()).max(1e-14);
        assert!(
            abs_err < tol_abs || rel_err < tol_rel,
            "{} {slot}[{col}]: analytic={a:.8e}, fd={fd:.8e}, abs_err={abs_err:.3e}, rel_err={rel_err:.3e}",
            g.name()
        );
    }
}

fn linear_predictor(grid_size: usize, seed: u64) -> Arc<dyn ManufacturabilityPredictor> {
    let mut rng = Lcg(seed);
    Arc::new(
        LinearPredictor::new(LinearPredictorSpec {
            grid_size,
            weights: (0..grid_size * grid_size).map(|_| rng.next()).collect(),
            bias: -0.2,
        })
        .unwrap(),
    )
}

// ─────────────────────────────────────────────────────────────
//  Gaussian splatting
// ─────────────────────────────────────────────────────────────

fn gaussian_config() -> EngineConfig {
    let mut config = EngineConfig::for_kind(EngineKind::GaussianSplatting);
    config.n_g = 8;
    config.n_g_x = 3;
    config.n_g_y = 2;
    config.seed_x = [0.1, 0.5];
    config.seed_y = [0.08, 0.22];
    config.volfrac = 0.5;
    config
}

#[test]
fn fd_gaussian_compliance_volume_overlap() {
    init_tracing();
    let mut config = gaussian_config();
    config.weights.gaussian_overlap_w = 2.0;
    let mesh = test_mesh();
    let ce = synthetic_ce(mesh.len());
    let model = Arc::new(GaussianShape::new(config.ratio_bounds));
    let mut engine = TopologyEngine::with_models(config, mesh, model, None, None).unwrap();
    place_cluster(&mut engine, 0.045, |k| vec![1.0 + 0.3 * k as f64]);

    engine.get_x(0);
    let terms = engine.objective(ce.view(), 0).unwrap();
    assert!(terms.volfrac_loss > 0.0, "volume hinge should be active: {terms:?}");
    assert!(terms.overlap > 0.0, "overlap should be active: {terms:?}");

    fd_gradient_check(&mut engine, &ce, 0, 1e-6, 1e-5, 1e-4);
}

#[test]
fn fd_gaussian_with_rasterisation() {
    init_tracing();
    let mut config = gaussian_config();
    config.rs_loss = true;
    config.rs_loss_start_iter = 0;
    config.weights.rs_loss_w = 3.0;
    let mesh = test_mesh();
    let ce = synthetic_ce(mesh.len());

    let model = Arc::new(GaussianShape::new(config.ratio_bounds));
    let mut engine = TopologyEngine::with_models(config, mesh, model, Some(linear_predictor(6, 99)), None).unwrap();
    place_cluster(&mut engine, 0.05, |_| vec![1.2]);

    engine.get_x(0);
    assert!(engine.field().unwrap().raster.is_some());
    let terms = engine.objective(ce.view(), 0).unwrap();
    assert!(terms.rs > 0.0);

    fd_gradient_check(&mut engine, &ce, 0, 1e-6, 1e-5, 1e-4);
}

#[test]
fn rasterisation_term_starts_at_its_start_iteration() {
    init_tracing();
    let mut config = gaussian_config();
    config.rs_loss = true;
    config.rs_loss_start_iter = 3;
    config.weights.rs_loss_w = 3.0;
    let mesh = test_mesh();
    let ce = synthetic_ce(mesh.len());
    let model = Arc::new(GaussianShape::new(config.ratio_bounds));
    let mut engine = TopologyEngine::with_models(config, mesh, model, Some(linear_predictor(6, 99)), None).unwrap();
    place_cluster(&mut engine, 0.05, |_| vec![1.2]);

    let mut grads = Vec::new();
    for t in 0..4 {
        engine.get_x(t);
        let terms = engine.forward(ce.view(), t).unwrap();
        if t < 3 {
            assert!(engine.field().unwrap().raster.is_none(), "t = {t}");
            assert_eq!(terms.rs, 0.0, "t = {t}");
        } else {
            assert!(engine.field().unwrap().raster.is_some());
            assert!(terms.rs != 0.0);
        }
        grads.push(engine.gradients().unwrap().clone());
    }

    // Nothing else in the Gaussian objective depends on t this early.
    assert_eq!(grads[0], grads[1]);
    assert_eq!(grads[1], grads[2]);
    assert_ne!(grads[2], grads[3]);
}

// ─────────────────────────────────────────────────────────────
//  Learned shapes
// ─────────────────────────────────────────────────────────────

#[test]
fn fd_combined_decoder_after_warmup() {
    init_tracing();
    let mut config = EngineConfig::for_kind(EngineKind::CombinedDecoderSdf);
    config.n_g = 6;
    config.n_g_x = 2;
    config.n_g_y = 2;
    config.seed_x = [0.15, 0.45];
    config.seed_y = [0.1, 0.2];
    config.ff_warmup_iter = 3;
    config.volfrac = 0.3;
    config.weights.ff_loss_w = 0.5;
    let mesh = test_mesh();
    let ce = synthetic_ce(mesh.len());
    let model = Arc::new(MlpShapeModel::from_checkpoint(&tiny_checkpoint()).unwrap());
    let mut engine = TopologyEngine::with_models(config, mesh, model, None, None).unwrap();
    place_cluster(&mut engine, 0.08, |k| vec![0.2 * k as f64, -0.3, 0.1]);

    engine.get_x(10);
    let terms = engine.objective(ce.view(), 10).unwrap();
    assert!(terms.shape != 0.0, "radius-sum term should be active after warm-up");

    fd_gradient_check(&mut engine, &ce, 10, 1e-6, 1e-5, 1e-4);
}

#[test]
fn fd_decoder_sdf_latent_distance() {
    init_tracing();
    let mut config = EngineConfig::for_kind(EngineKind::DecoderSdf);
    config.n_g = 4;
    config.ff_warmup_iter = 5;
    config.latent_distance_threshold = 0.1;
    config.weights.ff_loss_w = 0.7;
    let mesh = test_mesh();
    let ce = synthetic_ce(mesh.len());
    let model = Arc::new(MlpShapeModel::from_checkpoint(&tiny_checkpoint()).unwrap());
    let template = DesignExport {
        offsets: vec![[0.25, 0.15], [0.3, 0.16], [0.27, 0.2]],
        scale: vec![0.03, 0.035, 0.04],
        rotation: vec![0.1, -0.2, 0.4],
        shape: ShapeExport::ShapeCode(vec![vec![-0.6, 0.4, 0.2], vec![0.3, 0.2, -0.5], vec![0.9, -0.9, 0.0]]),
    };
    let mut engine = TopologyEngine::with_models(config, mesh, model, None, Some(template)).unwrap();
    assert_eq!(engine.pool().live_count(), 3);

    engine.get_x(0);
    let terms = engine.objective(ce.view(), 0).unwrap();
    assert!(terms.shape > 0.0, "latent-distance hinge should be active before warm-up");

    fd_gradient_check(&mut engine, &ce, 0, 1e-6, 1e-5, 1e-4);
}

#[test]
fn mlp_point_and_code_derivatives_match_fd() {
    let model = MlpShapeModel::from_checkpoint(&tiny_checkpoint()).unwrap();
    let code = [0.2, -0.4, 0.6];
    let points = [[0.1, -0.3], [0.5, 0.2], [-0.7, 0.8]];
    let batch = model.sdf_with_grad(&code, &points);
    let h = 1e-6;

    for (p, &[u, v]) in points.iter().enumerate() {
        let du = (model.sdf(&code, &[[u + h, v]])[0] - model.sdf(&code, &[[u - h, v]])[0]) / (2.0 * h);
        let dv = (model.sdf(&code, &[[u, v + h]])[0] - model.sdf(&code, &[[u, v - h]])[0]) / (2.0 * h);
        assert!((du - batch.d_point[p][0]).abs() < 1e-7, "du at {p}: {du} vs {}", batch.d_point[p][0]);
        assert!((dv - batch.d_point[p][1]).abs() < 1e-7, "dv at {p}: {dv} vs {}", batch.d_point[p][1]);

        for k in 0..code.len() {
            let mut plus = code;
            let mut minus = code;
            plus[k] += h;
            minus[k] -= h;
            let dk = (model.sdf(&plus, &[[u, v]])[0] - model.sdf(&minus, &[[u, v]])[0]) / (2.0 * h);
            assert!((dk - batch.d_code[[p, k]]).abs() < 1e-7, "dcode[{k}] at {p}");
        }
    }
}
