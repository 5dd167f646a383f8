//! Hand-coded gradients of the objective w.r.t. the unconstrained
//! primitive parameters.
//!
//! The chain is evaluated backwards from the scalar loss:
//!   1. dJ/dH from compliance and volume
//!   2. dJ/dK = dJ/dH · dH/dK, plus the rasterisation term through the
//!      cell means of 0.5·K
//!   3. dJ/dS from the overlap term
//!   4. per primitive: kernel derivatives → local frame → (c, s, θ, code)
//!   5. logistic slopes → unconstrained rows
//!
//! Step 4 runs in parallel; every primitive owns its row.

use crate::field::{FieldState, PrimitiveFootprint};
use crate::objectives::{
    compliance_grad, evaluate, overlap_penalty_grad, shape_penalty, volume_grad, Evaluation, ObjectiveSettings,
};
use crate::pool::PrimitivePool;
use crate::shape::{ManufacturabilityPredictor, ShapeModel};
use crate::types::{Mesh, ParamBlock, ParamGroup, PerGroup, TopOptError};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;

const CLIP_EPS: f64 = 1e-6;

// ─────────────────────────────────────────────────────────────
//  Element-level adjoints
// ─────────────────────────────────────────────────────────────

/// dJ/dK for every element (minimised objective).
fn kernel_sum_adjoint(
    field: &FieldState,
    ce: ArrayView1<f64>,
    mesh: &Mesh,
    predictor: Option<&dyn ManufacturabilityPredictor>,
    settings: &ObjectiveSettings,
    eval: &Evaluation,
) -> Array1<f64> {
    let w = &settings.weights;
    let h = field.density.view();
    let n = h.len();

    let mut d_h = compliance_grad(h, ce, settings.e_min, settings.e_max, settings.penal) * (-w.compliance_w);
    if eval.breakdown.volfrac_loss > 0.0 {
        d_h.scaled_add(w.volfrac_w, &volume_grad(n, mesh.areas(), settings.volume));
    }

    let mut d_k = ndarray::Zip::from(&d_h)
        .and(&field.kernel_sum)
        .map_collect(|&g, &k| g * field.settings.density_slope(k));

    if let (Some(raster), Some(predictor), Some(samples)) = (&eval.raster, predictor, &field.raster) {
        let b = raster.scores.len();
        if b > 0 {
            let upstream = Array1::from_elem(b, w.rs_loss_w / b as f64);
            let d_batch = predictor.input_gradient(&raster.batch, &upstream);
            for (i, (grid, s)) in raster.grids.iter().zip(samples).enumerate() {
                for (&e, &cell) in s.indices.iter().zip(&grid.cells) {
                    let count = grid.counts[cell] as f64;
                    d_k[e] += d_batch[[i, 0, cell.0, cell.1]] * 0.5 / count;
                }
            }
        }
    }

    d_k
}

// ─────────────────────────────────────────────────────────────
//  Per-primitive chain rule
// ─────────────────────────────────────────────────────────────

/// Gradient w.r.t. the physical parameters of one primitive.
#[derive(Debug, Clone, Default)]
struct PhysicalGrad {
    center: [f64; 2],
    scale: f64,
    rotation: f64,
    code: Vec<f64>,
}

fn accumulate_footprint(fp: &PrimitiveFootprint, upstream: &Array1<f64>, out: &mut PhysicalGrad) {
    for (p, &e) in fp.indices.iter().enumerate() {
        let g = upstream[e];
        if g == 0.0 {
            continue;
        }
        for (ck, &dk) in out.code.iter_mut().zip(fp.d_code.row(p)) {
            *ck += g * dk;
        }
        let [du, dv] = fp.d_point[p];
        let jac = fp.frame.jacobian(fp.local[p]);
        let gu = g * du;
        let gv = g * dv;
        out.center[0] += gu * jac[0][0] + gv * jac[1][0];
        out.center[1] += gu * jac[0][1] + gv * jac[1][1];
        out.scale += gu * jac[0][2] + gv * jac[1][2];
        out.rotation += gu * jac[0][3] + gv * jac[1][3];
    }
}

// ─────────────────────────────────────────────────────────────
//  Public entry point
// ─────────────────────────────────────────────────────────────

/// Objective and its gradient w.r.t. every unconstrained parameter.
///
/// Rows of slots that are not live are zero.
pub fn value_and_gradient(
    field: &FieldState,
    ce: ArrayView1<f64>,
    mesh: &Mesh,
    pool: &PrimitivePool,
    model: &dyn ShapeModel,
    predictor: Option<&dyn ManufacturabilityPredictor>,
    settings: &ObjectiveSettings,
) -> Result<(Evaluation, ParamBlock), TopOptError> {
    let eval = evaluate(field, ce, mesh, model, predictor, settings)?;
    let w = settings.weights;

    let d_k = kernel_sum_adjoint(field, ce, mesh, predictor, settings, &eval);
    let d_s = overlap_penalty_grad(field.overlap_sum.view()) * w.gaussian_overlap_w;

    let codes: Vec<&[f64]> = field.primary.iter().map(|fp| fp.params.shape_code.as_slice()).collect();
    let (_, shape_grads) = shape_penalty(model, &codes, eval.shape_term);

    let bounds = pool.bounds();
    let rows: Vec<PhysicalGrad> = field
        .primary
        .par_iter()
        .zip(field.shifted.par_iter())
        .zip(shape_grads.par_iter())
        .map(|((primary, shifted), shape_grad)| {
            let mut g = PhysicalGrad {
                code: shape_grad.iter().map(|&v| w.ff_loss_w * v).collect(),
                ..PhysicalGrad::default()
            };
            accumulate_footprint(primary, &d_k, &mut g);
            accumulate_footprint(shifted, &d_s, &mut g);
            g
        })
        .collect();

    let params = pool.params();
    let mut grads = ParamBlock::zeros(pool.capacity(), pool.bounds().latent_dim());
    for (fp, g) in field.primary.iter().zip(rows) {
        let i = fp.slot.0;
        for d in 0..2 {
            let wv = params[ParamGroup::Offsets][[i, d]];
            grads[ParamGroup::Offsets][[i, d]] = g.center[d] * bounds.offset[d].slope(wv);
        }
        grads[ParamGroup::Scale][[i, 0]] = g.scale * bounds.scale.slope(params[ParamGroup::Scale][[i, 0]]);
        grads[ParamGroup::Rotation][[i, 0]] =
            g.rotation * bounds.rotation.slope(params[ParamGroup::Rotation][[i, 0]]);
        for (k, iv) in bounds.shape_code.iter().enumerate() {
            grads[ParamGroup::ShapeCode][[i, k]] = g.code[k] * iv.slope(params[ParamGroup::ShapeCode][[i, k]]);
        }
    }

    Ok((eval, grads))
}

// ─────────────────────────────────────────────────────────────
//  Gradient conditioning
// ─────────────────────────────────────────────────────────────

/// Replace NaN entries by zero.  Returns how many were replaced per group.
pub fn sanitize_nan(grads: &mut ParamBlock, iteration: usize) -> PerGroup {
    let mut replaced = PerGroup::new(0.0, 0.0, 0.0, 0.0);
    for g in ParamGroup::ALL {
        let mut count = 0usize;
        grads[g].mapv_inplace(|v| {
            if v.is_nan() {
                count += 1;
                0.0
            } else {
                v
            }
        });
        if count > 0 {
            tracing::warn!(iteration, group = g.name(), count, "NaN gradient entries replaced by zero");
        }
        replaced.set(g, count as f64);
    }
    replaced
}

/// Frobenius norm of every group.
pub fn group_norms(grads: &ParamBlock) -> PerGroup {
    let mut norms = PerGroup::new(0.0, 0.0, 0.0, 0.0);
    for (g, m) in grads.iter() {
        norms.set(g, m.iter().map(|v| v * v).sum::<f64>().sqrt());
    }
    norms
}

/// Rescale each group whose norm exceeds its limit:
/// `g ← g · max / (‖g‖ + 1e-6)`.  Returns the norms before clipping.
pub fn clip_group_norms(grads: &mut ParamBlock, limits: &PerGroup) -> PerGroup {
    let norms = group_norms(grads);
    for g in ParamGroup::ALL {
        let coef = limits.get(g) / (norms.get(g) + CLIP_EPS);
        if coef < 1.0 {
            grads[g].mapv_inplace(|v| v * coef);
        }
    }
    norms
}
