//! Objective terms as pure functions of the field state.
//!
//! Each term is computed from the cached [`FieldState`] plus the
//! sensitivity vector.  The corresponding hand-coded gradients live in
//! `gradients.rs`.

use crate::config::{EngineConfig, EngineKind, ObjectiveWeights, VolumeRamp};
use crate::field::FieldState;
use crate::shape::{ManufacturabilityPredictor, ShapeModel};
use crate::types::{Mesh, ObjectiveBreakdown, TopOptError, RASTER_HALF_SIDE};
use ndarray::{Array1, Array2, Array4, ArrayView1};

// ─────────────────────────────────────────────────────────────
//  Policies
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMeasure {
    /// `mean(H)` against the goal fraction.
    Mean,
    /// `Σ H_e a_e` against `goal · total_area`.
    AreaWeighted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShapePenalty {
    Off,
    /// `Σ radius_sum(code prefix)` once `iteration > warmup`.
    RadiusSum { warmup: usize },
    /// Latent-distance hinge up to `warmup`, radius sum afterwards.
    LatentThenRadius { warmup: usize, threshold: f64 },
}

/// Which form the shape term takes at one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShapeTerm {
    Off,
    RadiusSum,
    LatentDistance { threshold: f64 },
}

impl ShapePenalty {
    pub fn at(&self, iteration: usize) -> ShapeTerm {
        match *self {
            Self::Off => ShapeTerm::Off,
            Self::RadiusSum { warmup } if iteration > warmup => ShapeTerm::RadiusSum,
            Self::RadiusSum { .. } => ShapeTerm::Off,
            Self::LatentThenRadius { warmup, .. } if iteration > warmup => ShapeTerm::RadiusSum,
            Self::LatentThenRadius { threshold, .. } => ShapeTerm::LatentDistance { threshold },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveSettings {
    pub weights: ObjectiveWeights,
    pub e_min: f64,
    pub e_max: f64,
    pub penal: f64,
    pub volfrac: f64,
    pub ramp: VolumeRamp,
    pub volume: VolumeMeasure,
    pub shape: ShapePenalty,
}

impl ObjectiveSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        let (volume, shape) = match config.kind {
            EngineKind::GaussianSplatting => (VolumeMeasure::Mean, ShapePenalty::Off),
            EngineKind::DecoderSdf => (
                VolumeMeasure::Mean,
                ShapePenalty::LatentThenRadius {
                    warmup: config.ff_warmup_iter,
                    threshold: config.latent_distance_threshold,
                },
            ),
            EngineKind::CombinedDecoderSdf => (
                VolumeMeasure::AreaWeighted,
                ShapePenalty::RadiusSum { warmup: config.ff_warmup_iter },
            ),
        };
        Self {
            weights: config.weights,
            e_min: config.e_min,
            e_max: config.e_max,
            penal: config.penal,
            volfrac: config.volfrac,
            ramp: config.volume_ramp,
            volume,
            shape,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Compliance
// ─────────────────────────────────────────────────────────────

/// `C = Σ_e ce_e · clamp(H_e, Emin, Emax)^p`
pub fn compliance(h: ArrayView1<f64>, ce: ArrayView1<f64>, e_min: f64, e_max: f64, penal: f64) -> f64 {
    h.iter()
        .zip(ce.iter())
        .map(|(&he, &c)| c * he.clamp(e_min, e_max).powf(penal))
        .sum()
}

/// dC/dH.  Zero where the clamp is active.
pub fn compliance_grad(h: ArrayView1<f64>, ce: ArrayView1<f64>, e_min: f64, e_max: f64, penal: f64) -> Array1<f64> {
    h.iter()
        .zip(ce.iter())
        .map(|(&he, &c)| {
            if he < e_min || he > e_max {
                0.0
            } else {
                c * penal * he.powf(penal - 1.0)
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Volume
// ─────────────────────────────────────────────────────────────

/// `volfrac − increment · clamp((i − marker)/duration, 0, 1)`
pub fn volume_goal_fraction(volfrac: f64, ramp: &VolumeRamp, iteration: usize) -> f64 {
    let t = (iteration as f64 - ramp.volfrac_increment_marker as f64)
        / ramp.volfrac_increment_duration.max(1) as f64;
    volfrac - ramp.volfrac_increment * t.clamp(0.0, 1.0)
}

pub fn volume(h: ArrayView1<f64>, areas: ArrayView1<f64>, measure: VolumeMeasure) -> f64 {
    match measure {
        VolumeMeasure::Mean => h.mean().unwrap_or(0.0),
        VolumeMeasure::AreaWeighted => h.dot(&areas),
    }
}

pub fn volume_target(goal_fraction: f64, total_area: f64, measure: VolumeMeasure) -> f64 {
    match measure {
        VolumeMeasure::Mean => goal_fraction,
        VolumeMeasure::AreaWeighted => goal_fraction * total_area,
    }
}

/// dV/dH.
pub fn volume_grad(n: usize, areas: ArrayView1<f64>, measure: VolumeMeasure) -> Array1<f64> {
    match measure {
        VolumeMeasure::Mean => Array1::from_elem(n, 1.0 / n.max(1) as f64),
        VolumeMeasure::AreaWeighted => areas.to_owned(),
    }
}

// ─────────────────────────────────────────────────────────────
//  Overlap
// ─────────────────────────────────────────────────────────────

/// `mean_e relu(S_e − 1)`
pub fn overlap_penalty(s: ArrayView1<f64>) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    s.iter().map(|&v| (v - 1.0).max(0.0)).sum::<f64>() / s.len() as f64
}

pub fn overlap_penalty_grad(s: ArrayView1<f64>) -> Array1<f64> {
    let inv = 1.0 / s.len().max(1) as f64;
    s.mapv(|v| if v > 1.0 { inv } else { 0.0 })
}

// ─────────────────────────────────────────────────────────────
//  Shape / manufacturability penalty
// ─────────────────────────────────────────────────────────────

/// Shape term over the live primitives' codes, plus ∂/∂code per primitive.
pub fn shape_penalty(model: &dyn ShapeModel, codes: &[&[f64]], term: ShapeTerm) -> (f64, Vec<Vec<f64>>) {
    let mut grads: Vec<Vec<f64>> = codes.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut total = 0.0;
    match term {
        ShapeTerm::Off => {}
        ShapeTerm::RadiusSum => {
            let rd = model.radius_latent_dim();
            for (code, g) in codes.iter().zip(grads.iter_mut()) {
                let prefix = &code[..rd.min(code.len())];
                total += model.radius_sum(prefix);
                for (gk, dk) in g.iter_mut().zip(model.radius_sum_grad(prefix)) {
                    *gk += dk;
                }
            }
        }
        ShapeTerm::LatentDistance { threshold } => {
            if let Some(reference) = model.latent_reference() {
                for (code, g) in codes.iter().zip(grads.iter_mut()) {
                    let (d2, dd2) = reference.distance_sq(code);
                    if d2 > threshold {
                        total += d2 - threshold;
                        for (gk, dk) in g.iter_mut().zip(dd2) {
                            *gk += dk;
                        }
                    }
                }
            }
        }
    }
    (total, grads)
}

// ─────────────────────────────────────────────────────────────
//  Rasterisation
// ─────────────────────────────────────────────────────────────

/// One primitive's local window rasterised onto a `G × G` grid.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    /// `grid[[iu, iv]]` = mean of the samples that fell in the cell.
    pub grid: Array2<f64>,
    pub counts: Array2<usize>,
    /// Cell of each input sample.
    pub cells: Vec<(usize, usize)>,
}

#[inline]
fn cell_index(x: f64, half_side: f64, grid_size: usize) -> usize {
    let t = (x + half_side) / (2.0 * half_side) * (grid_size as f64 - 1.0);
    (t.max(0.0) as usize).min(grid_size - 1)
}

/// Nearest-cell mapping `⌊(p + h)/(2h)·(G − 1)⌋`; samples sharing a cell are
/// averaged, empty cells stay zero.
pub fn rasterize(local: &[[f64; 2]], values: &[f64], half_side: f64, grid_size: usize) -> RasterGrid {
    let mut sums = Array2::<f64>::zeros((grid_size, grid_size));
    let mut counts = Array2::<usize>::zeros((grid_size, grid_size));
    let mut cells = Vec::with_capacity(local.len());
    for (&[u, v], &z) in local.iter().zip(values) {
        let cell = (cell_index(u, half_side, grid_size), cell_index(v, half_side, grid_size));
        sums[cell] += z;
        counts[cell] += 1;
        cells.push(cell);
    }
    let grid = ndarray::Zip::from(&sums)
        .and(&counts)
        .map_collect(|&s, &c| if c > 0 { s / c as f64 } else { 0.0 });
    RasterGrid { grid, counts, cells }
}

/// Rasterised windows of every live primitive and the predictor scores.
#[derive(Debug, Clone)]
pub struct RasterBatch {
    pub grids: Vec<RasterGrid>,
    pub batch: Array4<f64>,
    pub scores: Array1<f64>,
}

pub fn raster_batch(field: &FieldState, predictor: &dyn ManufacturabilityPredictor) -> Option<RasterBatch> {
    let samples = field.raster.as_ref()?;
    let g = predictor.grid_size();
    let inverted = field.inverted();
    let grids: Vec<RasterGrid> = samples
        .iter()
        .map(|s| {
            let values: Vec<f64> = s.indices.iter().map(|&e| inverted[e]).collect();
            rasterize(&s.local, &values, RASTER_HALF_SIDE, g)
        })
        .collect();
    let mut batch = Array4::zeros((grids.len(), 1, g, g));
    for (b, rg) in grids.iter().enumerate() {
        batch
            .index_axis_mut(ndarray::Axis(0), b)
            .index_axis_mut(ndarray::Axis(0), 0)
            .assign(&rg.grid);
    }
    let scores = predictor.predict(&batch);
    Some(RasterBatch { grids, batch, scores })
}

// ─────────────────────────────────────────────────────────────
//  Full objective
// ─────────────────────────────────────────────────────────────

/// Intermediate results shared by the loss and its gradient.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub breakdown: ObjectiveBreakdown,
    pub shape_term: ShapeTerm,
    pub raster: Option<RasterBatch>,
}

pub fn check_sensitivities(field: &FieldState, ce: ArrayView1<f64>) -> Result<(), TopOptError> {
    if ce.len() != field.density.len() {
        return Err(TopOptError::Shape(format!(
            "sensitivity vector has {} entries for {} elements",
            ce.len(),
            field.density.len()
        )));
    }
    Ok(())
}

pub fn evaluate(
    field: &FieldState,
    ce: ArrayView1<f64>,
    mesh: &Mesh,
    model: &dyn ShapeModel,
    predictor: Option<&dyn ManufacturabilityPredictor>,
    settings: &ObjectiveSettings,
) -> Result<Evaluation, TopOptError> {
    check_sensitivities(field, ce)?;
    let w = &settings.weights;
    let h = field.density.view();
    let iteration = field.iteration;

    let c = compliance(h, ce, settings.e_min, settings.e_max, settings.penal);

    let goal = volume_goal_fraction(settings.volfrac, &settings.ramp, iteration);
    let v = volume(h, mesh.areas(), settings.volume);
    let target = volume_target(goal, mesh.total_area(), settings.volume);
    let volfrac_loss = (v - target).max(0.0);

    let overlap = overlap_penalty(field.overlap_sum.view());

    let shape_term = settings.shape.at(iteration);
    let codes: Vec<&[f64]> = field.primary.iter().map(|fp| fp.params.shape_code.as_slice()).collect();
    let (shape, _) = shape_penalty(model, &codes, shape_term);

    let raster = predictor.and_then(|p| raster_batch(field, p));
    let rs = raster.as_ref().map_or(0.0, |r| r.scores.mean().unwrap_or(0.0));

    let rest = w.volfrac_w * volfrac_loss + w.gaussian_overlap_w * overlap + w.ff_loss_w * shape + w.rs_loss_w * rs;
    let breakdown = ObjectiveBreakdown {
        compliance: c,
        volume: v,
        volume_goal: target,
        volfrac_loss,
        overlap,
        shape,
        rs,
        minimized: -w.compliance_w * c + rest,
        true_sign: w.compliance_w * c + rest,
    };

    if !breakdown.minimized.is_finite() {
        tracing::warn!(iteration, ?breakdown, "objective is not finite");
    } else {
        tracing::debug!(
            iteration,
            compliance = c,
            volume = v,
            volume_goal = target,
            overlap,
            shape,
            rs,
            "objective terms"
        );
    }

    Ok(Evaluation { breakdown, shape_term, raster })
}
