//! Density field evaluation.
//!
//! Every live primitive is evaluated independently (rayon), producing a
//! sparse [`PrimitiveFootprint`]: the elements inside its support window,
//! their local coordinates, kernel values and local derivatives.  The
//! per-element sums are then reduced sequentially in slot order, so the
//! result does not depend on thread scheduling.
//!
//!   K_e = Σ_i k_i(e) + 1e-8
//!   H_e = (Emax − Emin)·σ(−k·(K_e − 0.5)) + Emin
//!
//! A second evaluation with the scale enlarged by `overlap_scale` gives the
//! overlap-diagnostic sum `S_e`.

use crate::pool::{PrimitivePool, SlotId};
use crate::shape::ShapeModel;
use crate::types::{sigmoid, Mesh, PrimitiveParams, KERNEL_EPS, RASTER_HALF_SIDE};
use ndarray::{Array1, Array2};
use rayon::prelude::*;

// ─────────────────────────────────────────────────────────────
//  Local frame
// ─────────────────────────────────────────────────────────────

/// `(u, v) = R(θ)·(p − c) / (f·s + 1e-8)` with `R = [[cos, −sin], [sin, cos]]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    pub center: [f64; 2],
    pub cos: f64,
    pub sin: f64,
    /// Scale multiplier `f`.
    pub factor: f64,
    /// `f·s + 1e-8`.
    pub denom: f64,
}

impl LocalFrame {
    pub fn new(params: &PrimitiveParams, factor: f64) -> Self {
        Self {
            center: params.offset,
            cos: params.rotation.cos(),
            sin: params.rotation.sin(),
            factor,
            denom: factor * params.scale + KERNEL_EPS,
        }
    }

    #[inline]
    pub fn to_local(&self, p: [f64; 2]) -> [f64; 2] {
        let dx = p[0] - self.center[0];
        let dy = p[1] - self.center[1];
        [
            (self.cos * dx - self.sin * dy) / self.denom,
            (self.sin * dx + self.cos * dy) / self.denom,
        ]
    }

    /// Rows u, v; columns ∂/∂cx, ∂/∂cy, ∂/∂s, ∂/∂θ.
    #[inline]
    pub fn jacobian(&self, uv: [f64; 2]) -> [[f64; 4]; 2] {
        let [u, v] = uv;
        let inv = 1.0 / self.denom;
        [
            [-self.cos * inv, self.sin * inv, -u * self.factor * inv, -v],
            [-self.sin * inv, -self.cos * inv, -v * self.factor * inv, u],
        ]
    }
}

// ─────────────────────────────────────────────────────────────
//  Per-primitive contributions
// ─────────────────────────────────────────────────────────────

/// Sparse contribution of one primitive.
#[derive(Debug, Clone)]
pub struct PrimitiveFootprint {
    pub slot: SlotId,
    pub params: PrimitiveParams,
    pub frame: LocalFrame,
    /// Elements with `max(|u|, |v|) < support`.
    pub indices: Vec<usize>,
    pub local: Vec<[f64; 2]>,
    pub values: Vec<f64>,
    pub d_point: Vec<[f64; 2]>,
    /// `indices.len() × L`.
    pub d_code: Array2<f64>,
}

impl PrimitiveFootprint {
    pub fn evaluate(
        mesh: &Mesh,
        model: &dyn ShapeModel,
        slot: SlotId,
        params: &PrimitiveParams,
        factor: f64,
    ) -> Self {
        let frame = LocalFrame::new(params, factor);
        let support = model.support();
        let (indices, local) = window(mesh, &frame, support);
        let batch = model.sdf_with_grad(&params.shape_code, &local);
        Self {
            slot,
            params: params.clone(),
            frame,
            indices,
            local,
            values: batch.values,
            d_point: batch.d_point,
            d_code: batch.d_code,
        }
    }

    /// Zero-filled kernel over all elements.
    pub fn dense(&self, n_elements: usize) -> Array1<f64> {
        let mut out = Array1::zeros(n_elements);
        for (&e, &k) in self.indices.iter().zip(&self.values) {
            out[e] = k;
        }
        out
    }
}

/// Elements of the rasterisation window of one primitive, in its frame.
#[derive(Debug, Clone, Default)]
pub struct RasterSamples {
    pub indices: Vec<usize>,
    pub local: Vec<[f64; 2]>,
}

fn window(mesh: &Mesh, frame: &LocalFrame, half_side: f64) -> (Vec<usize>, Vec<[f64; 2]>) {
    let mut indices = Vec::new();
    let mut local = Vec::new();
    for e in 0..mesh.len() {
        let uv = frame.to_local(mesh.centroid(e));
        if uv[0].abs().max(uv[1].abs()) < half_side {
            indices.push(e);
            local.push(uv);
        }
    }
    (indices, local)
}

// ─────────────────────────────────────────────────────────────
//  Field state
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSettings {
    pub e_min: f64,
    pub e_max: f64,
    pub smooth_k: f64,
    pub overlap_scale: f64,
}

impl FieldSettings {
    #[inline]
    pub fn density(&self, kernel_sum: f64) -> f64 {
        (self.e_max - self.e_min) * sigmoid(-self.smooth_k * (kernel_sum - 0.5)) + self.e_min
    }

    /// dH/dK.
    #[inline]
    pub fn density_slope(&self, kernel_sum: f64) -> f64 {
        let s = sigmoid(-self.smooth_k * (kernel_sum - 0.5));
        -self.smooth_k * (self.e_max - self.e_min) * s * (1.0 - s)
    }
}

/// Everything `get_x` produces for one iteration.
#[derive(Debug, Clone)]
pub struct FieldState {
    pub iteration: usize,
    pub settings: FieldSettings,
    /// H.
    pub density: Array1<f64>,
    /// K (includes the epsilon).
    pub kernel_sum: Array1<f64>,
    /// S, the shifted-scale sum.
    pub overlap_sum: Array1<f64>,
    /// Live primitives in slot order.
    pub primary: Vec<PrimitiveFootprint>,
    pub shifted: Vec<PrimitiveFootprint>,
    /// Present when the rasterisation term was active at this iteration.
    pub raster: Option<Vec<RasterSamples>>,
}

impl FieldState {
    pub fn evaluate(
        mesh: &Mesh,
        pool: &PrimitivePool,
        model: &dyn ShapeModel,
        settings: FieldSettings,
        iteration: usize,
        with_raster: bool,
    ) -> Self {
        let live = pool.live_slots();
        let decoded: Vec<PrimitiveParams> = live.iter().map(|&s| pool.decode(s)).collect();

        let evaluated: Vec<(PrimitiveFootprint, PrimitiveFootprint, Option<RasterSamples>)> = live
            .par_iter()
            .zip(decoded.par_iter())
            .map(|(&slot, params)| {
                let primary = PrimitiveFootprint::evaluate(mesh, model, slot, params, 1.0);
                let shifted = PrimitiveFootprint::evaluate(mesh, model, slot, params, settings.overlap_scale);
                let raster = with_raster.then(|| {
                    let (indices, local) = window(mesh, &primary.frame, RASTER_HALF_SIDE);
                    RasterSamples { indices, local }
                });
                (primary, shifted, raster)
            })
            .collect();

        let n = mesh.len();
        let mut kernel_sum = Array1::from_elem(n, KERNEL_EPS);
        let mut overlap_sum = Array1::zeros(n);
        let mut primary = Vec::with_capacity(evaluated.len());
        let mut shifted = Vec::with_capacity(evaluated.len());
        let mut raster = with_raster.then(|| Vec::with_capacity(evaluated.len()));

        for (p, s, r) in evaluated {
            for (&e, &k) in p.indices.iter().zip(&p.values) {
                kernel_sum[e] += k;
            }
            for (&e, &k) in s.indices.iter().zip(&s.values) {
                overlap_sum[e] += k;
            }
            primary.push(p);
            shifted.push(s);
            if let (Some(all), Some(r)) = (raster.as_mut(), r) {
                all.push(r);
            }
        }

        let density = kernel_sum.mapv(|k| settings.density(k));

        tracing::debug!(
            iteration,
            live = primary.len(),
            h_min = density.iter().copied().fold(f64::INFINITY, f64::min),
            h_max = density.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            "density field evaluated"
        );

        Self { iteration, settings, density, kernel_sum, overlap_sum, primary, shifted, raster }
    }

    /// Inverted density `0.5·K` fed to the rasteriser.
    pub fn inverted(&self) -> Array1<f64> {
        &self.kernel_sum * 0.5
    }

    /// Dense `N × live` matrix of primary contributions (column = primitive
    /// in slot order).
    pub fn dense_contributions(&self) -> Array2<f64> {
        let n = self.density.len();
        let mut out = Array2::zeros((n, self.primary.len()));
        for (col, fp) in self.primary.iter().enumerate() {
            for (&e, &k) in fp.indices.iter().zip(&fp.values) {
                out[[e, col]] = k;
            }
        }
        out
    }

    pub fn position(&self, slot: SlotId) -> Option<usize> {
        self.primary.iter().position(|fp| fp.slot == slot)
    }
}
