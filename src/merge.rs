//! Adaptive merging of overlapping primitives.
//!
//! Lifecycle around each marker `m`:
//!
//! ```text
//!   iteration m−1   PreparingMerge  detect candidate pairs on the field
//!   iteration m     Merging         after the optimiser step, replace pairs
//!   m < i < m+len   Adapting        only the new primitives evolve
//! ```

use crate::field::FieldState;
use crate::pool::{PrimitivePool, SlotId};
use crate::shape::ShapeModel;
use crate::types::{Interval, Mesh, PrimitiveParams, TopOptError, FOOTPRINT_LEVEL, MERGE_THRESHOLD};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::{FRAC_PI_2, PI};

// ─────────────────────────────────────────────────────────────
//  Schedule
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    Idle,
    PreparingMerge,
    Merging,
    Adapting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSchedule {
    pub merging_markers: Vec<usize>,
    pub merging_adaptation_length: usize,
}

impl Default for MergeSchedule {
    fn default() -> Self {
        Self { merging_markers: Vec::new(), merging_adaptation_length: 10 }
    }
}

impl MergeSchedule {
    pub fn prepares_at(&self, iteration: usize) -> bool {
        self.merging_markers.contains(&(iteration + 1))
    }

    pub fn merges_at(&self, iteration: usize) -> bool {
        self.merging_markers.contains(&iteration)
    }

    /// Strictly inside `(marker, marker + len)` for some marker.
    pub fn adapting_at(&self, iteration: usize) -> bool {
        self.merging_markers
            .iter()
            .any(|&m| iteration > m && iteration < m + self.merging_adaptation_length)
    }

    pub fn phase(&self, iteration: usize) -> MergePhase {
        if self.merges_at(iteration) {
            MergePhase::Merging
        } else if self.prepares_at(iteration) {
            MergePhase::PreparingMerge
        } else if self.adapting_at(iteration) {
            MergePhase::Adapting
        } else {
            MergePhase::Idle
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Candidate detection
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub first: SlotId,
    pub second: SlotId,
    /// `max_e (k_i(e) + k_j(e))`.
    pub peak: f64,
}

impl MergeCandidate {
    pub fn involves(&self, slot: SlotId) -> bool {
        self.first == slot || self.second == slot
    }
}

/// Elements where a primitive's kernel exceeds 0.5, and its area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFootprint {
    pub elements: Vec<usize>,
    pub area: f64,
}

/// Pairs whose peak exceeds `threshold`, sorted by descending peak; ties
/// keep discovery order `(i, j)` with `i < j`.
pub fn rank_candidates(mut candidates: Vec<MergeCandidate>, threshold: f64) -> Vec<MergeCandidate> {
    candidates.retain(|c| c.peak > threshold);
    candidates.sort_by(|a, b| b.peak.total_cmp(&a.peak));
    candidates
}

pub fn detect_candidates(field: &FieldState) -> Vec<MergeCandidate> {
    let dense = field.dense_contributions();
    let p = field.primary.len();

    let found: Vec<MergeCandidate> = (0..p)
        .into_par_iter()
        .flat_map_iter(|i| {
            let dense = &dense;
            (i + 1..p).filter_map(move |j| {
                let peak = dense
                    .column(i)
                    .iter()
                    .zip(dense.column(j))
                    .map(|(a, b)| a + b)
                    .fold(f64::NEG_INFINITY, f64::max);
                (peak > MERGE_THRESHOLD).then(|| MergeCandidate {
                    first: field.primary[i].slot,
                    second: field.primary[j].slot,
                    peak,
                })
            })
        })
        .collect();

    rank_candidates(found, MERGE_THRESHOLD)
}

pub fn candidate_footprint(field: &FieldState, index: usize, mesh: &Mesh, model: &dyn ShapeModel) -> CandidateFootprint {
    let fp = &field.primary[index];
    let elements: Vec<usize> = fp
        .indices
        .iter()
        .zip(&fp.values)
        .filter(|(_, &k)| k > FOOTPRINT_LEVEL)
        .map(|(&e, _)| e)
        .collect();
    let area = model
        .nominal_area(&fp.params.shape_code, fp.params.scale)
        .unwrap_or_else(|| elements.iter().map(|&e| mesh.areas()[e]).sum());
    CandidateFootprint { elements, area }
}

// ─────────────────────────────────────────────────────────────
//  Ellipse fit
// ─────────────────────────────────────────────────────────────

/// Ellipse with semi-axes `minor ≤ major`; `minor_angle` is the world
/// angle of the minor axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipseFit {
    pub center: [f64; 2],
    pub minor: f64,
    pub major: f64,
    pub minor_angle: f64,
}

impl EllipseFit {
    pub fn area(&self) -> f64 {
        PI * self.minor * self.major
    }

    /// Frame rotation whose local u axis lies along the minor axis,
    /// wrapped into `[−π/2, π/2]`.
    pub fn rotation(&self) -> f64 {
        wrap_half_turn(-self.minor_angle)
    }

    /// `major / minor`, or 1 for a collapsed fit.
    pub fn ratio(&self) -> f64 {
        if self.minor > 0.0 {
            self.major / self.minor
        } else {
            1.0
        }
    }
}

fn wrap_half_turn(mut angle: f64) -> f64 {
    while angle > FRAC_PI_2 {
        angle -= PI;
    }
    while angle < -FRAC_PI_2 {
        angle += PI;
    }
    angle
}

/// Second-moment ellipse of `points`, rescaled uniformly to `target_area`.
///
/// A uniform ellipse with semi-axis `a` has variance `a²/4` along that
/// axis.  Degenerate point sets fall back to a circle.
pub fn fit_ellipse(points: &[[f64; 2]], target_area: f64) -> EllipseFit {
    let n = points.len().max(1) as f64;
    let mut center = [0.0; 2];
    for p in points {
        center[0] += p[0] / n;
        center[1] += p[1] / n;
    }
    let (mut cxx, mut cyy, mut cxy) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p[0] - center[0];
        let dy = p[1] - center[1];
        cxx += dx * dx / n;
        cyy += dy * dy / n;
        cxy += dx * dy / n;
    }

    let half_tr = 0.5 * (cxx + cyy);
    let disc = (0.25 * (cxx - cyy).powi(2) + cxy * cxy).sqrt();
    let lambda_major = half_tr + disc;
    let lambda_minor = half_tr - disc;

    let circle_radius = (target_area.max(0.0) / PI).sqrt();
    if points.len() < 3 || lambda_minor <= 1e-14 || lambda_major <= 1e-14 {
        return EllipseFit { center, minor: circle_radius, major: circle_radius, minor_angle: 0.0 };
    }

    let major_angle = 0.5 * (2.0 * cxy).atan2(cxx - cyy);
    let minor = 2.0 * lambda_minor.sqrt();
    let major = 2.0 * lambda_major.sqrt();
    let rescale = (target_area / (PI * minor * major)).sqrt();
    EllipseFit {
        center,
        minor: minor * rescale,
        major: major * rescale,
        minor_angle: major_angle + FRAC_PI_2,
    }
}

// ─────────────────────────────────────────────────────────────
//  Manager
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeSettings {
    pub scale_bounds: Interval,
    pub ratio_bounds: Interval,
    pub clamp_inset: f64,
}

/// What a merge did, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub iteration: usize,
    pub consumed: [SlotId; 2],
    pub created: SlotId,
    pub peak: f64,
    pub target_area: f64,
    pub params: PrimitiveParams,
}

/// One pair and the primitive that will replace it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMerge {
    pub candidate: MergeCandidate,
    pub target_area: f64,
    pub params: PrimitiveParams,
}

/// Merges fitted for one batch, not yet applied to the pool.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergePlan {
    pub iteration: usize,
    pub merges: Vec<PlannedMerge>,
}

impl MergePlan {
    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeManager {
    queue: Vec<MergeCandidate>,
    footprints: BTreeMap<SlotId, CandidateFootprint>,
    history: Vec<MergeRecord>,
}

impl MergeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) -> &[MergeCandidate] {
        &self.queue
    }

    pub fn history(&self) -> &[MergeRecord] {
        &self.history
    }

    pub fn footprint(&self, slot: SlotId) -> Option<&CandidateFootprint> {
        self.footprints.get(&slot)
    }

    /// Detect candidates on `field` and cache the footprints they need.
    pub fn prepare(&mut self, field: &FieldState, mesh: &Mesh, model: &dyn ShapeModel) {
        self.queue = detect_candidates(field);
        self.footprints.clear();
        for c in &self.queue {
            for slot in [c.first, c.second] {
                if self.footprints.contains_key(&slot) {
                    continue;
                }
                if let Some(idx) = field.position(slot) {
                    self.footprints.insert(slot, candidate_footprint(field, idx, mesh, model));
                }
            }
        }
        tracing::info!(
            iteration = field.iteration,
            candidates = self.queue.len(),
            "merge candidates prepared"
        );
    }

    /// Queue candidates directly with footprints already known.
    pub fn set_queue(&mut self, queue: Vec<MergeCandidate>, footprints: BTreeMap<SlotId, CandidateFootprint>) {
        self.queue = rank_candidates(queue, MERGE_THRESHOLD);
        self.footprints = footprints;
    }

    /// Fit the replacement primitive of every still-valid queued pair.
    ///
    /// Nothing is mutated, so a failure leaves the queue and the pool as
    /// they were.
    pub fn plan(
        &self,
        iteration: usize,
        pool: &PrimitivePool,
        mesh: &Mesh,
        model: &dyn ShapeModel,
        settings: &MergeSettings,
    ) -> Result<MergePlan, TopOptError> {
        let latent_dim = pool.bounds().latent_dim();
        let mut consumed: BTreeSet<SlotId> = BTreeSet::new();
        let mut merges = Vec::new();

        for cand in &self.queue {
            if consumed.contains(&cand.first) || consumed.contains(&cand.second) {
                continue;
            }
            if !pool.is_live(cand.first) || !pool.is_live(cand.second) {
                tracing::debug!(first = %cand.first, second = %cand.second, "stale merge candidate skipped");
                continue;
            }
            let (Some(fa), Some(fb)) = (self.footprints.get(&cand.first), self.footprints.get(&cand.second)) else {
                continue;
            };

            let union: BTreeSet<usize> = fa.elements.iter().chain(&fb.elements).copied().collect();
            let points: Vec<[f64; 2]> = union.iter().map(|&e| mesh.centroid(e)).collect();
            let target_area = fa.area + fb.area;
            let fit = fit_ellipse(&points, target_area);

            let scale = settings.scale_bounds.clamp_inset(fit.minor, settings.clamp_inset);
            let ratio = settings.ratio_bounds.clamp_inset(fit.ratio(), settings.clamp_inset);
            let shape_code = model.template_code(ratio)?;
            if shape_code.len() != latent_dim {
                return Err(TopOptError::Shape(format!(
                    "merged shape code has {} entries, pool expects {latent_dim}",
                    shape_code.len()
                )));
            }

            consumed.insert(cand.first);
            consumed.insert(cand.second);
            merges.push(PlannedMerge {
                candidate: *cand,
                target_area,
                params: PrimitiveParams { offset: fit.center, scale, rotation: fit.rotation(), shape_code },
            });
        }

        Ok(MergePlan { iteration, merges })
    }

    /// Carry out `plan`: claim a slot for each merged primitive and retire
    /// its pair.  Consumes the queue and the cached footprints.
    ///
    /// The `recent` flags are reset first, so after the call they mark
    /// exactly the primitives created by this batch.
    pub fn apply(&mut self, plan: MergePlan, pool: &mut PrimitivePool) -> Result<Vec<MergeRecord>, TopOptError> {
        self.queue.clear();
        self.footprints.clear();
        pool.clear_recent();

        let iteration = plan.iteration;
        let mut records = Vec::with_capacity(plan.merges.len());
        for PlannedMerge { candidate: cand, target_area, params } in plan.merges {
            if !pool.is_live(cand.first) || !pool.is_live(cand.second) {
                continue;
            }
            let created = match pool.claim(&params) {
                Ok(slot) => slot,
                Err(TopOptError::PoolExhausted { capacity }) => {
                    tracing::warn!(iteration, capacity, "primitive pool exhausted; remaining merges skipped");
                    break;
                }
                Err(e) => {
                    self.history.extend(records.iter().cloned());
                    return Err(e);
                }
            };
            pool.mark_recent(created);
            pool.retire(cand.first);
            pool.retire(cand.second);

            tracing::info!(
                iteration,
                first = %cand.first,
                second = %cand.second,
                created = %created,
                peak = cand.peak,
                target_area,
                "primitives merged"
            );
            records.push(MergeRecord {
                iteration,
                consumed: [cand.first, cand.second],
                created,
                peak: cand.peak,
                target_area,
                params,
            });
        }

        self.history.extend(records.iter().cloned());
        Ok(records)
    }

    /// Merge every still-valid queued pair into a new slot.
    pub fn execute(
        &mut self,
        iteration: usize,
        pool: &mut PrimitivePool,
        mesh: &Mesh,
        model: &dyn ShapeModel,
        settings: &MergeSettings,
    ) -> Result<Vec<MergeRecord>, TopOptError> {
        let plan = self.plan(iteration, pool, mesh, model, settings)?;
        self.apply(plan, pool)
    }
}
