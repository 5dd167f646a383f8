//! Engine configuration: the recognised inputs of the optimisation core.
//!
//! Every field has a default; `EngineConfig::for_kind` applies the bound
//! constants each engine variant was tuned with.  Configs are plain serde
//! structs so they can be read from the same JSON files as the problem
//! catalog.

use crate::merge::MergeSchedule;
use crate::types::{Interval, PerGroup, TopOptError};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ─────────────────────────────────────────────────────────────
//  Engine variant
// ─────────────────────────────────────────────────────────────

/// Closed set of primitive-field variants, selected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Elliptical Gaussian kernels seeded on a grid, with merging.
    GaussianSplatting,
    /// Learned SDF shapes seeded from a catalog template, no merging.
    DecoderSdf,
    /// Learned SDF shapes seeded on a grid, area-weighted volume, merging.
    CombinedDecoderSdf,
}

impl EngineKind {
    pub fn uses_learned_shapes(self) -> bool {
        !matches!(self, Self::GaussianSplatting)
    }

    pub fn supports_merging(self) -> bool {
        !matches!(self, Self::DecoderSdf)
    }
}

impl FromStr for EngineKind {
    type Err = TopOptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gaussian_splatting" | "GaussianSplattingCompliance" => Ok(Self::GaussianSplatting),
            "decoder_sdf" | "FM_AE_DeepSDF" => Ok(Self::DecoderSdf),
            "combined_decoder_sdf" | "CombinedMappingDecoderSDF" => Ok(Self::CombinedDecoderSdf),
            other => Err(TopOptError::UnknownEngine(other.to_string())),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GaussianSplatting => "gaussian_splatting",
            Self::DecoderSdf => "decoder_sdf",
            Self::CombinedDecoderSdf => "combined_decoder_sdf",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────
//  Sub-structs
// ─────────────────────────────────────────────────────────────

/// Weights of the objective terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    pub compliance_w: f64,
    pub volfrac_w: f64,
    pub gaussian_overlap_w: f64,
    pub ff_loss_w: f64,
    pub rs_loss_w: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            compliance_w: 1.0,
            volfrac_w: 10.0,
            gaussian_overlap_w: 1.0,
            ff_loss_w: 0.1,
            rs_loss_w: 0.0,
        }
    }
}

/// Linear ramp of the volume-fraction goal.
///
/// goal(i) = volfrac − increment · clamp((i − marker) / duration, 0, 1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeRamp {
    pub volfrac_increment: f64,
    pub volfrac_increment_marker: usize,
    pub volfrac_increment_duration: usize,
}

impl Default for VolumeRamp {
    fn default() -> Self {
        Self {
            volfrac_increment: 0.0,
            volfrac_increment_marker: 20,
            volfrac_increment_duration: 20,
        }
    }
}

/// Gradient-norm clip limits per parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipSchedule {
    /// Iterations `< early_until` use `early`, later ones use `late`.
    pub early_until: usize,
    pub early: PerGroup,
    pub late: PerGroup,
    /// Used while a merge adaptation window is open.
    pub adaptation: PerGroup,
}

impl Default for ClipSchedule {
    fn default() -> Self {
        Self {
            early_until: 100,
            early: PerGroup::new(30.0, 20.0, 3.0, 5.0),
            late: PerGroup::new(10.0, 10.0, 3.0, 5.0),
            adaptation: PerGroup::new(0.001, 0.01, 0.01, 0.01),
        }
    }
}

impl ClipSchedule {
    pub fn limits(&self, iteration: usize, adapting: bool) -> PerGroup {
        if adapting {
            self.adaptation
        } else if iteration < self.early_until {
            self.early
        } else {
            self.late
        }
    }
}

/// Adam hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamSettings {
    pub learning_rates: PerGroup,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rates: PerGroup::new(1e-1, 5e-2, 1e-1, 5e-2),
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Engine configuration
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub max_iter: usize,
    pub volfrac: f64,
    #[serde(rename = "Emin")]
    pub e_min: f64,
    #[serde(rename = "Emax")]
    pub e_max: f64,
    pub penal: f64,
    /// Sharpness of the saturating density map.
    pub smooth_k: f64,

    /// Pool capacity.
    #[serde(rename = "N_g")]
    pub n_g: usize,
    #[serde(rename = "N_g_x")]
    pub n_g_x: usize,
    #[serde(rename = "N_g_y")]
    pub n_g_y: usize,
    /// Seed grid extents (grid variants).
    pub seed_x: [f64; 2],
    pub seed_y: [f64; 2],

    pub weights: ObjectiveWeights,
    /// Scale multiplier of the shifted (overlap-diagnostic) evaluation.
    pub gaussian_overlap_scale: f64,
    pub volume_ramp: VolumeRamp,

    pub rs_loss: bool,
    pub rs_loss_start_iter: usize,
    /// The shape penalty switches to `radius_sum` after this iteration.
    pub ff_warmup_iter: usize,
    /// Threshold on the squared Mahalanobis latent distance.
    pub latent_distance_threshold: f64,

    pub merging: MergeSchedule,
    pub clip: ClipSchedule,
    pub adam: AdamSettings,

    pub scale_bounds: Interval,
    pub scale_init: f64,
    /// Minor/major axis ratio bounds (Gaussian shape code, merge fits).
    pub ratio_bounds: Interval,
    pub rotation_bounds: Interval,
    /// Fraction of each interval kept clear when clamping merge fits.
    pub merge_clamp_inset: f64,
    /// Multiplier applied to template scales (template-seeded variant).
    pub template_scale_factor: f64,

    pub shape_model_path: Option<PathBuf>,
    pub predictor_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::for_kind(EngineKind::CombinedDecoderSdf)
    }
}

impl EngineConfig {
    /// Defaults plus the bound constants of `kind`.
    pub fn for_kind(kind: EngineKind) -> Self {
        let base = Self {
            kind,
            max_iter: 200,
            volfrac: 0.5,
            e_min: 1e-3,
            e_max: 1.0,
            penal: 3.0,
            smooth_k: 10.0,
            n_g: 64,
            n_g_x: 6,
            n_g_y: 3,
            seed_x: [0.05, 0.55],
            seed_y: [0.05, 0.15],
            weights: ObjectiveWeights::default(),
            gaussian_overlap_scale: 1.2,
            volume_ramp: VolumeRamp::default(),
            rs_loss: false,
            rs_loss_start_iter: 0,
            ff_warmup_iter: 40,
            latent_distance_threshold: 1.0,
            merging: MergeSchedule::default(),
            clip: ClipSchedule::default(),
            adam: AdamSettings::default(),
            scale_bounds: Interval { min: 0.05, max: 0.6 },
            scale_init: 0.06,
            ratio_bounds: Interval { min: 0.5, max: 2.5 },
            rotation_bounds: Interval { min: -FRAC_PI_2, max: FRAC_PI_2 },
            merge_clamp_inset: 0.1,
            template_scale_factor: 1.0,
            shape_model_path: None,
            predictor_path: None,
        };

        match kind {
            EngineKind::GaussianSplatting => Self {
                scale_bounds: Interval { min: 0.03 * 0.9, max: 0.03 * 2.0 },
                scale_init: 0.03,
                volume_ramp: VolumeRamp {
                    volfrac_increment: 0.1,
                    ..VolumeRamp::default()
                },
                weights: ObjectiveWeights { ff_loss_w: 0.0, ..ObjectiveWeights::default() },
                ..base
            },
            EngineKind::DecoderSdf => Self {
                scale_bounds: Interval { min: 0.06, max: 0.15 },
                scale_init: 0.06,
                ff_warmup_iter: 5,
                template_scale_factor: 3.0,
                volume_ramp: VolumeRamp {
                    volfrac_increment: 0.2,
                    ..VolumeRamp::default()
                },
                ..base
            },
            EngineKind::CombinedDecoderSdf => base,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TopOptError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), TopOptError> {
        let bad = |msg: String| Err(TopOptError::InvalidConfig(msg));

        if !(self.volfrac > 0.0 && self.volfrac <= 1.0) {
            return bad(format!("volfrac {} must be in (0, 1]", self.volfrac));
        }
        if !(self.e_min >= 0.0 && self.e_min < self.e_max) {
            return bad(format!("need 0 <= Emin < Emax, got {} / {}", self.e_min, self.e_max));
        }
        if self.penal < 1.0 {
            return bad(format!("penal {} must be >= 1", self.penal));
        }
        if self.smooth_k <= 0.0 {
            return bad("smooth_k must be positive".into());
        }
        if self.n_g == 0 {
            return bad("N_g must be positive".into());
        }
        if self.kind != EngineKind::DecoderSdf && self.n_g_x * self.n_g_y > self.n_g {
            return bad(format!(
                "seed grid {}x{} does not fit in N_g = {}",
                self.n_g_x, self.n_g_y, self.n_g
            ));
        }
        if self.gaussian_overlap_scale <= 0.0 {
            return bad("gaussian_overlap_scale must be positive".into());
        }
        if self.volume_ramp.volfrac_increment_duration == 0 {
            return bad("volfrac_increment_duration must be positive".into());
        }
        for interval in [self.scale_bounds, self.ratio_bounds, self.rotation_bounds] {
            Interval::new(interval.min, interval.max)?;
        }
        if self.scale_bounds.min <= 0.0 || self.ratio_bounds.min <= 0.0 {
            return bad("scale and ratio bounds must be positive".into());
        }
        if !(0.0..0.5).contains(&self.merge_clamp_inset) {
            return bad("merge_clamp_inset must be in [0, 0.5)".into());
        }
        for limits in [self.clip.early, self.clip.late, self.clip.adaptation, self.adam.learning_rates] {
            if [limits.offsets, limits.scale, limits.shape_code, limits.rotation]
                .iter()
                .any(|&v| !(v > 0.0))
            {
                return bad("clip limits and learning rates must be positive".into());
            }
        }
        if self.kind.uses_learned_shapes() && self.shape_model_path.is_none() {
            tracing::debug!(kind = %self.kind, "no shape_model_path; a shape model must be supplied directly");
        }
        Ok(())
    }
}
