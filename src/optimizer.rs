//! Optimisation driver: Adam plus the per-iteration controller.
//!
//! One run is one controller; iterations are strictly sequential:
//!
//! ```text
//!   get_x(t) → ce = FEM(H) → forward(ce, t) → NaN sanitise → prepare_grads(t)
//!           → plan merges → Adam step → apply merges → report
//! ```
//!
//! Every fallible stage runs before the Adam step, so a failed iteration
//! leaves parameters and moments untouched and can be retried.
//!
//! The FEM solve is an external collaborator behind [`SensitivityAnalysis`].

use crate::config::AdamSettings;
use crate::engine::{DesignExport, EngineState, TopologyEngine};
use crate::gradients::sanitize_nan;
use crate::merge::{MergePhase, MergeRecord};
use crate::types::{ObjectiveBreakdown, ParamBlock, ParamGroup, PerGroup, TopOptError};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Sensitivity collaborator
// ─────────────────────────────────────────────────────────────

/// Element sensitivities `ce` of the structural response for a density
/// field.  Closures of the same shape implement it.
pub trait SensitivityAnalysis {
    fn sensitivities(&mut self, density: ArrayView1<f64>) -> Result<Array1<f64>, TopOptError>;
}

impl<F> SensitivityAnalysis for F
where
    F: FnMut(ArrayView1<f64>) -> Result<Array1<f64>, TopOptError>,
{
    fn sensitivities(&mut self, density: ArrayView1<f64>) -> Result<Array1<f64>, TopOptError> {
        self(density)
    }
}

// ─────────────────────────────────────────────────────────────
//  Adam
// ─────────────────────────────────────────────────────────────

/// Adam with one learning rate per parameter group.
///
/// Rows outside the active set are frozen: neither their moments nor their
/// parameters change, and each row keeps its own step count for the bias
/// correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    settings: AdamSettings,
    m: ParamBlock,
    v: ParamBlock,
    steps: Vec<u32>,
}

impl Adam {
    pub fn new(settings: AdamSettings, capacity: usize, latent_dim: usize) -> Self {
        Self {
            settings,
            m: ParamBlock::zeros(capacity, latent_dim),
            v: ParamBlock::zeros(capacity, latent_dim),
            steps: vec![0; capacity],
        }
    }

    pub fn steps(&self, row: usize) -> u32 {
        self.steps[row]
    }

    pub fn step(&mut self, params: &mut ParamBlock, grads: &ParamBlock, active: &[bool]) {
        let AdamSettings { learning_rates, beta1, beta2, eps } = self.settings;

        for (row, &on) in active.iter().enumerate() {
            if on {
                self.steps[row] += 1;
            }
        }

        for g in ParamGroup::ALL {
            let lr = learning_rates.get(g);
            let (m, v, w, grad) = (&mut self.m[g], &mut self.v[g], &mut params[g], &grads[g]);
            for (row, &on) in active.iter().enumerate() {
                if !on {
                    continue;
                }
                let t = self.steps[row] as i32;
                let bc1 = 1.0 - beta1.powi(t);
                let bc2 = 1.0 - beta2.powi(t);
                for col in 0..w.ncols() {
                    let gi = grad[[row, col]];
                    let mi = beta1 * m[[row, col]] + (1.0 - beta1) * gi;
                    let vi = beta2 * v[[row, col]] + (1.0 - beta2) * gi * gi;
                    m[[row, col]] = mi;
                    v[[row, col]] = vi;
                    w[[row, col]] -= lr * (mi / bc1) / ((vi / bc2).sqrt() + eps);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Reports and checkpoints
// ─────────────────────────────────────────────────────────────

/// Diagnostics of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub objective: ObjectiveBreakdown,
    /// Per-group gradient norms before clipping.
    pub grad_norms: PerGroup,
    /// NaN gradient entries replaced per group.
    pub nan_replaced: PerGroup,
    /// `‖H − H_prev‖∞`; zero on the first iteration.
    pub change: f64,
    pub live: usize,
    pub phase: MergePhase,
    pub merges: Vec<MergeRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub reports: Vec<IterationReport>,
    pub stop: StopReason,
    pub design: DesignExport,
}

/// Run state at an iteration boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub next_iteration: usize,
    pub engine: EngineState,
    pub adam: Adam,
    pub previous_density: Option<Array1<f64>>,
}

impl Checkpoint {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TopOptError> {
        let text = serde_json::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopOptError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ─────────────────────────────────────────────────────────────
//  Controller
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct IterationController {
    engine: TopologyEngine,
    adam: Adam,
    iteration: usize,
    previous_density: Option<Array1<f64>>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl IterationController {
    pub fn new(engine: TopologyEngine) -> Self {
        let params = engine.pool().params();
        let adam = Adam::new(engine.config().adam, params.capacity(), params.latent_dim());
        Self { engine, adam, iteration: 0, previous_density: None, interrupt: None }
    }

    /// Stop between iterations once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn engine(&self) -> &TopologyEngine {
        &self.engine
    }

    pub fn into_engine(self) -> TopologyEngine {
        self.engine
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn is_finished(&self) -> bool {
        self.iteration >= self.engine.config().max_iter
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Run one full iteration.
    pub fn step(&mut self, fem: &mut dyn SensitivityAnalysis) -> Result<IterationReport, TopOptError> {
        let t = self.iteration;
        let phase = self.engine.merge_phase(t);

        let density = self.engine.get_x(t).clone();
        let ce = fem.sensitivities(density.view())?;
        if ce.len() != density.len() {
            return Err(TopOptError::Sensitivity(format!(
                "expected {} sensitivities, got {}",
                density.len(),
                ce.len()
            )));
        }

        let objective = self.engine.forward(ce.view(), t)?;
        let nan_replaced = match self.engine.gradients_mut() {
            Some(grads) => sanitize_nan(grads, t),
            None => return Err(TopOptError::MissingField(t)),
        };
        let grad_norms = self.engine.prepare_grads(t)?;
        let plan = self.engine.plan_shape_combination(t)?;
        let active = self.engine.evolving_mask(t);
        let (params, grads) = self.engine.params_and_gradients().ok_or(TopOptError::MissingField(t))?;
        self.adam.step(params, grads, &active);

        let merges = self.engine.apply_shape_combination(plan)?;

        let change = match &self.previous_density {
            Some(prev) if prev.len() == density.len() => prev
                .iter()
                .zip(density.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
            _ => 0.0,
        };
        self.previous_density = Some(density);
        self.iteration += 1;

        let live = self.engine.pool().live_count();
        tracing::info!(
            iteration = t,
            objective = objective.minimized,
            true_objective = objective.true_sign,
            compliance = objective.compliance,
            volume = objective.volume,
            change,
            live,
            ?phase,
            merged = merges.len(),
            "iteration complete"
        );

        Ok(IterationReport {
            iteration: t,
            objective,
            grad_norms,
            nan_replaced,
            change,
            live,
            phase,
            merges,
        })
    }

    /// Iterate until `max_iter` or an interrupt.
    pub fn run(&mut self, fem: &mut dyn SensitivityAnalysis) -> Result<RunSummary, TopOptError> {
        let mut reports = Vec::new();
        let stop = loop {
            if self.is_finished() {
                break StopReason::MaxIterations;
            }
            if self.interrupted() {
                tracing::info!(iteration = self.iteration, "run interrupted");
                break StopReason::Interrupted;
            }
            reports.push(self.step(fem)?);
        };
        Ok(RunSummary { reports, stop, design: self.engine.get_final_x() })
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            next_iteration: self.iteration,
            engine: self.engine.state(),
            adam: self.adam.clone(),
            previous_density: self.previous_density.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<(), TopOptError> {
        self.engine.restore_state(checkpoint.engine)?;
        self.adam = checkpoint.adam;
        self.iteration = checkpoint.next_iteration;
        self.previous_density = checkpoint.previous_density;
        tracing::info!(iteration = self.iteration, "checkpoint restored");
        Ok(())
    }
}
