//! `TopologyEngine`: the per-run façade over pool, field, objective and
//! merging.
//!
//! The iteration counter is an explicit argument of every call.  A call
//! sequence for one iteration `t` is
//!
//! ```text
//!   get_x(t) → [FEM] → forward(ce, t) → prepare_grads(t) → step → update_shape_combination(t)
//! ```

use crate::config::{EngineConfig, EngineKind};
use crate::field::{FieldSettings, FieldState};
use crate::gradients::{clip_group_norms, value_and_gradient};
use crate::merge::{MergeManager, MergePhase, MergePlan, MergeRecord, MergeSettings};
use crate::objectives::{evaluate, ObjectiveSettings};
use crate::pool::PrimitivePool;
use crate::shape::{
    GaussianShape, LinearPredictor, ManufacturabilityPredictor, MlpShapeModel, ShapeCodeKind, ShapeModel,
};
use crate::types::{Mesh, ObjectiveBreakdown, ParamBlock, ParamBounds, PerGroup, PrimitiveParams, TopOptError};
use ndarray::{Array1, ArrayView1};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Design export
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeExport {
    /// Read from either `[r, ...]` or the one-column form `[[r], ...]`.
    #[serde(deserialize_with = "flat_or_column")]
    SigmasRatio(Vec<f64>),
    ShapeCode(Vec<Vec<f64>>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RatioList {
    Flat(Vec<f64>),
    Column(Vec<Vec<f64>>),
}

fn flat_or_column<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match RatioList::deserialize(deserializer)? {
        RatioList::Flat(v) => Ok(v),
        RatioList::Column(rows) => rows
            .iter()
            .map(|row| match row.as_slice() {
                [r] => Ok(*r),
                _ => Err(de::Error::custom(format!("sigmas_ratio rows hold one value, got {}", row.len()))),
            })
            .collect(),
    }
}

impl ShapeExport {
    pub fn len(&self) -> usize {
        match self {
            Self::SigmasRatio(v) => v.len(),
            Self::ShapeCode(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded parameters of every live primitive, in slot order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignExport {
    pub offsets: Vec<[f64; 2]>,
    pub scale: Vec<f64>,
    pub rotation: Vec<f64>,
    #[serde(flatten)]
    pub shape: ShapeExport,
}

impl DesignExport {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn validate(&self) -> Result<(), TopOptError> {
        let n = self.offsets.len();
        if self.scale.len() != n || self.rotation.len() != n || self.shape.len() != n {
            return Err(TopOptError::Shape(format!(
                "design lists disagree: {} offsets, {} scales, {} rotations, {} shapes",
                n,
                self.scale.len(),
                self.rotation.len(),
                self.shape.len()
            )));
        }
        Ok(())
    }
}

/// Mutable run state captured in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub pool: PrimitivePool,
    pub merges: MergeManager,
}

// ─────────────────────────────────────────────────────────────
//  Engine
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TopologyEngine {
    config: EngineConfig,
    mesh: Mesh,
    model: Arc<dyn ShapeModel>,
    predictor: Option<Arc<dyn ManufacturabilityPredictor>>,
    pool: PrimitivePool,
    merges: MergeManager,
    objective: ObjectiveSettings,
    field: Option<FieldState>,
    grads: Option<ParamBlock>,
}

impl TopologyEngine {
    /// Load the models named in `config` and seed the pool.
    ///
    /// `template` is required by the template-seeded variant and ignored
    /// by the grid-seeded ones.
    pub fn from_config(config: EngineConfig, mesh: Mesh, template: Option<DesignExport>) -> Result<Self, TopOptError> {
        config.validate()?;
        let model: Arc<dyn ShapeModel> = match config.kind {
            EngineKind::GaussianSplatting => Arc::new(GaussianShape::new(config.ratio_bounds)),
            EngineKind::DecoderSdf | EngineKind::CombinedDecoderSdf => {
                let path = config.shape_model_path.as_ref().ok_or_else(|| {
                    TopOptError::InvalidConfig(format!("{} needs shape_model_path", config.kind))
                })?;
                Arc::new(MlpShapeModel::from_json_file(path)?)
            }
        };
        let predictor: Option<Arc<dyn ManufacturabilityPredictor>> = if config.rs_loss {
            let path = config
                .predictor_path
                .as_ref()
                .ok_or_else(|| TopOptError::InvalidConfig("rs_loss needs predictor_path".into()))?;
            Some(Arc::new(LinearPredictor::from_json_file(path)?))
        } else {
            None
        };
        Self::with_models(config, mesh, model, predictor, template)
    }

    /// Construct with already-loaded models.
    pub fn with_models(
        config: EngineConfig,
        mesh: Mesh,
        model: Arc<dyn ShapeModel>,
        predictor: Option<Arc<dyn ManufacturabilityPredictor>>,
        template: Option<DesignExport>,
    ) -> Result<Self, TopOptError> {
        config.validate()?;
        if config.rs_loss && predictor.is_none() {
            return Err(TopOptError::InvalidConfig("rs_loss is enabled but no predictor was given".into()));
        }

        let bounds = ParamBounds {
            offset: mesh.offset_bounds(),
            scale: config.scale_bounds,
            rotation: config.rotation_bounds,
            shape_code: model.code_bounds(),
        };
        let mut pool = PrimitivePool::new(config.n_g, bounds);

        let seeds = match (config.kind, template) {
            (EngineKind::DecoderSdf, Some(t)) => template_seeds(&config, model.as_ref(), &t)?,
            (EngineKind::DecoderSdf, None) => {
                return Err(TopOptError::InvalidConfig("decoder_sdf is seeded from a design template".into()))
            }
            _ => grid_seeds(&config, model.as_ref())?,
        };
        for params in &seeds {
            pool.claim(params)?;
        }

        tracing::info!(
            kind = %config.kind,
            capacity = config.n_g,
            live = pool.live_count(),
            elements = mesh.len(),
            "topology engine initialised"
        );

        let objective = ObjectiveSettings::from_config(&config);
        Ok(Self {
            config,
            mesh,
            model,
            predictor,
            pool,
            merges: MergeManager::new(),
            objective,
            field: None,
            grads: None,
        })
    }

    pub fn kind(&self) -> EngineKind {
        self.config.kind
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn model(&self) -> &dyn ShapeModel {
        self.model.as_ref()
    }

    pub fn pool(&self) -> &PrimitivePool {
        &self.pool
    }

    /// Direct pool access; drops the cached field and gradients.
    pub fn pool_mut(&mut self) -> &mut PrimitivePool {
        self.field = None;
        self.grads = None;
        &mut self.pool
    }

    pub fn merges(&self) -> &MergeManager {
        &self.merges
    }

    pub fn field(&self) -> Option<&FieldState> {
        self.field.as_ref()
    }

    pub fn gradients(&self) -> Option<&ParamBlock> {
        self.grads.as_ref()
    }

    pub fn gradients_mut(&mut self) -> Option<&mut ParamBlock> {
        self.grads.as_mut()
    }

    /// Parameters and the gradients of the last `forward`, borrowed together.
    pub fn params_and_gradients(&mut self) -> Option<(&mut ParamBlock, &ParamBlock)> {
        let grads = self.grads.as_ref()?;
        Some((self.pool.params_mut(), grads))
    }

    pub fn merge_phase(&self, iteration: usize) -> MergePhase {
        if self.config.kind.supports_merging() {
            self.config.merging.phase(iteration)
        } else {
            MergePhase::Idle
        }
    }

    fn field_settings(&self) -> FieldSettings {
        FieldSettings {
            e_min: self.config.e_min,
            e_max: self.config.e_max,
            smooth_k: self.config.smooth_k,
            overlap_scale: self.config.gaussian_overlap_scale,
        }
    }

    fn raster_active(&self, iteration: usize) -> bool {
        self.config.rs_loss && self.predictor.is_some() && iteration >= self.config.rs_loss_start_iter
    }

    fn current_field(&self, iteration: usize) -> Result<&FieldState, TopOptError> {
        self.field
            .as_ref()
            .filter(|f| f.iteration == iteration)
            .ok_or(TopOptError::MissingField(iteration))
    }

    // ── operations ──────────────────────────────────────────

    /// Evaluate the density field H for `iteration`.
    pub fn get_x(&mut self, iteration: usize) -> &Array1<f64> {
        let field = FieldState::evaluate(
            &self.mesh,
            &self.pool,
            self.model.as_ref(),
            self.field_settings(),
            iteration,
            self.raster_active(iteration),
        );
        if self.preparing(iteration) {
            self.merges.prepare(&field, &self.mesh, self.model.as_ref());
        }
        self.grads = None;
        &self.field.insert(field).density
    }

    fn preparing(&self, iteration: usize) -> bool {
        self.config.kind.supports_merging() && self.config.merging.prepares_at(iteration)
    }

    /// Objective for the field of `iteration`, without gradients.
    pub fn objective(&self, ce: ArrayView1<f64>, iteration: usize) -> Result<ObjectiveBreakdown, TopOptError> {
        let field = self.current_field(iteration)?;
        let predictor = self.predictor.as_deref();
        Ok(evaluate(field, ce, &self.mesh, self.model.as_ref(), predictor, &self.objective)?.breakdown)
    }

    /// Objective and gradients for the field of `iteration`.  The gradients
    /// are kept for `prepare_grads` and the optimiser step.
    pub fn forward(&mut self, ce: ArrayView1<f64>, iteration: usize) -> Result<ObjectiveBreakdown, TopOptError> {
        let field = self.current_field(iteration)?;
        let (eval, grads) = value_and_gradient(
            field,
            ce,
            &self.mesh,
            &self.pool,
            self.model.as_ref(),
            self.predictor.as_deref(),
            &self.objective,
        )?;
        self.grads = Some(grads);
        Ok(eval.breakdown)
    }

    /// Whether the adaptation window after a merge is open and non-empty.
    pub fn adapting(&self, iteration: usize) -> bool {
        self.config.kind.supports_merging()
            && self.config.merging.adapting_at(iteration)
            && !self.pool.recent_slots().is_empty()
    }

    /// Slots whose gradients survive `prepare_grads`.
    pub fn evolving_mask(&self, iteration: usize) -> Vec<bool> {
        if self.adapting(iteration) {
            self.pool.recent_mask()
        } else {
            self.pool.live_mask()
        }
    }

    /// Zero non-evolving rows and clip each group.  Returns the group norms
    /// before clipping.
    pub fn prepare_grads(&mut self, iteration: usize) -> Result<PerGroup, TopOptError> {
        let mask = self.evolving_mask(iteration);
        let limits = self.config.clip.limits(iteration, self.adapting(iteration));
        let grads = self.grads.as_mut().ok_or(TopOptError::MissingField(iteration))?;
        grads.zero_rows_except(&mask);
        Ok(clip_group_norms(grads, &limits))
    }

    /// Fit the merge batch of `iteration` without touching the pool.
    /// Empty unless `iteration` is a merge marker.
    pub fn plan_shape_combination(&self, iteration: usize) -> Result<MergePlan, TopOptError> {
        if self.merge_phase(iteration) != MergePhase::Merging {
            return Ok(MergePlan { iteration, merges: Vec::new() });
        }
        let settings = MergeSettings {
            scale_bounds: self.config.scale_bounds,
            ratio_bounds: self.config.ratio_bounds,
            clamp_inset: self.config.merge_clamp_inset,
        };
        self.merges
            .plan(iteration, &self.pool, &self.mesh, self.model.as_ref(), &settings)
    }

    /// Apply a plan from [`plan_shape_combination`](Self::plan_shape_combination).
    pub fn apply_shape_combination(&mut self, plan: MergePlan) -> Result<Vec<MergeRecord>, TopOptError> {
        if self.merge_phase(plan.iteration) != MergePhase::Merging {
            return Ok(Vec::new());
        }
        let records = self.merges.apply(plan, &mut self.pool)?;
        if !records.is_empty() {
            self.field = None;
            self.grads = None;
        }
        Ok(records)
    }

    /// Run the merge batch if `iteration` is a merge marker.
    pub fn update_shape_combination(&mut self, iteration: usize) -> Result<Vec<MergeRecord>, TopOptError> {
        let plan = self.plan_shape_combination(iteration)?;
        self.apply_shape_combination(plan)
    }

    /// The design output.
    pub fn get_final_x(&self) -> DesignExport {
        let decoded: Vec<PrimitiveParams> = self.pool.live_slots().into_iter().map(|s| self.pool.decode(s)).collect();
        let shape = match self.model.code_kind() {
            ShapeCodeKind::SigmasRatio => ShapeExport::SigmasRatio(decoded.iter().map(|p| p.shape_code[0]).collect()),
            ShapeCodeKind::ShapeCode => ShapeExport::ShapeCode(decoded.iter().map(|p| p.shape_code.clone()).collect()),
        };
        DesignExport {
            offsets: decoded.iter().map(|p| p.offset).collect(),
            scale: decoded.iter().map(|p| p.scale).collect(),
            rotation: decoded.iter().map(|p| p.rotation).collect(),
            shape,
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState { pool: self.pool.clone(), merges: self.merges.clone() }
    }

    pub fn restore_state(&mut self, state: EngineState) -> Result<(), TopOptError> {
        let ours = self.pool.params();
        let theirs = state.pool.params();
        if ours.capacity() != theirs.capacity() || ours.latent_dim() != theirs.latent_dim() {
            return Err(TopOptError::Shape(format!(
                "checkpoint pool is {}×{}, engine pool is {}×{}",
                theirs.capacity(),
                theirs.latent_dim(),
                ours.capacity(),
                ours.latent_dim()
            )));
        }
        self.pool = state.pool;
        self.merges = state.merges;
        self.field = None;
        self.grads = None;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Seeding
// ─────────────────────────────────────────────────────────────

fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.5 * (lo + hi)],
        _ => (0..n).map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64).collect(),
    }
}

/// Regular `N_g_x × N_g_y` grid of round primitives (x outer, y inner).
fn grid_seeds(config: &EngineConfig, model: &dyn ShapeModel) -> Result<Vec<PrimitiveParams>, TopOptError> {
    let code = model.template_code(1.0)?;
    let xs = linspace(config.seed_x[0], config.seed_x[1], config.n_g_x);
    let ys = linspace(config.seed_y[0], config.seed_y[1], config.n_g_y);
    Ok(xs
        .iter()
        .flat_map(|&x| ys.iter().map(move |&y| (x, y)))
        .map(|(x, y)| PrimitiveParams {
            offset: [x, y],
            scale: config.scale_init,
            rotation: 0.0,
            shape_code: code.clone(),
        })
        .collect())
}

/// Primitives of a previous design, re-encoded through the shape model.
fn template_seeds(
    config: &EngineConfig,
    model: &dyn ShapeModel,
    template: &DesignExport,
) -> Result<Vec<PrimitiveParams>, TopOptError> {
    template.validate()?;
    let latent_dim = model.latent_dim();
    (0..template.len())
        .map(|i| {
            let shape_code = match &template.shape {
                ShapeExport::SigmasRatio(r) => model.template_code(r[i])?,
                ShapeExport::ShapeCode(c) if c[i].len() == latent_dim => c[i].clone(),
                ShapeExport::ShapeCode(c) => {
                    return Err(TopOptError::Shape(format!(
                        "template code has {} entries, model expects {latent_dim}",
                        c[i].len()
                    )))
                }
            };
            let scale = (template.scale[i] * config.template_scale_factor)
                .clamp(config.scale_bounds.min, config.scale_bounds.max);
            Ok(PrimitiveParams {
                offset: template.offsets[i],
                scale,
                rotation: template.rotation[i],
                shape_code,
            })
        })
        .collect()
}
