use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, TopOptError>`
/// instead of panicking.  Numerical trouble inside an iteration (NaN loss,
/// NaN gradients) is *not* an error: it is logged and sanitised.
#[derive(Debug, Error)]
pub enum TopOptError {
    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Engine kind string did not match any known variant.
    #[error("unknown engine kind: {0}")]
    UnknownEngine(String),
    /// Shape mismatch in input data.
    #[error("shape error: {0}")]
    Shape(String),
    /// The frozen shape model could not be loaded.
    #[error("failed to load shape model from {path}: {reason}")]
    ShapeModelLoad { path: String, reason: String },
    /// The manufacturability predictor could not be loaded.
    #[error("failed to load predictor from {path}: {reason}")]
    PredictorLoad { path: String, reason: String },
    /// The external sensitivity analysis failed.
    #[error("sensitivity analysis failed: {0}")]
    Sensitivity(String),
    /// `forward` / gradient evaluation was called before `get_x`.
    #[error("density field not evaluated for iteration {0} (call get_x first)")]
    MissingField(usize),
    /// Every slot of the primitive arena has been used.
    #[error("primitive pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },
    /// A design template has no entry under the requested name.
    #[error("problem `{0}` not found in catalog")]
    MissingProblem(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Added to kernel sums and scale denominators.
pub const KERNEL_EPS: f64 = 1e-8;

/// Peak pairwise kernel sum above which two primitives are merge candidates.
pub const MERGE_THRESHOLD: f64 = 1.5;

/// Kernel level that defines a primitive's footprint.
pub const FOOTPRINT_LEVEL: f64 = 0.5;

/// Half side of the local window rasterised for the buildability predictor.
pub const RASTER_HALF_SIDE: f64 = 1.5;

// ─────────────────────────────────────────────────────────────
//  Logistic (bounded) parameterisation
// ─────────────────────────────────────────────────────────────

#[inline]
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Closed interval `[min, max]` reached through a scaled logistic map.
///
/// The optimiser only ever sees the unconstrained value `w`; the physical
/// value `min + (max - min)·σ(w)` is strictly inside the interval for every
/// finite `w`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Interval {
    pub fn new(min: f64, max: f64) -> Result<Self, TopOptError> {
        if !(min.is_finite() && max.is_finite()) || max <= min {
            return Err(TopOptError::InvalidConfig(format!(
                "interval [{min}, {max}] must be finite with min < max"
            )));
        }
        Ok(Self { min, max })
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Unconstrained → bounded.
    #[inline]
    pub fn decode(&self, w: f64) -> f64 {
        self.min + self.width() * sigmoid(w)
    }

    /// Bounded → unconstrained.  Values on or past the bounds are pulled
    /// inside by one ulp-scale fraction so the logit stays finite.
    #[inline]
    pub fn encode(&self, value: f64) -> f64 {
        let t = ((value - self.min) / self.width()).clamp(f64::EPSILON, 1.0 - f64::EPSILON);
        (t / (1.0 - t)).ln()
    }

    /// d(decode)/dw.
    #[inline]
    pub fn slope(&self, w: f64) -> f64 {
        let s = sigmoid(w);
        self.width() * s * (1.0 - s)
    }

    /// Clamp into the interval shrunk by `fraction` of its width at each end.
    #[inline]
    pub fn clamp_inset(&self, value: f64, fraction: f64) -> f64 {
        let pad = fraction * self.width();
        value.clamp(self.min + pad, self.max - pad)
    }

    #[inline]
    pub fn contains_strictly(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }
}

// ─────────────────────────────────────────────────────────────
//  Parameter groups
// ─────────────────────────────────────────────────────────────

/// The four optimiser parameter groups.  Each has its own learning rate,
/// its own clip limit and its own row width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    Offsets,
    Scale,
    ShapeCode,
    Rotation,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 4] = [
        ParamGroup::Offsets,
        ParamGroup::Scale,
        ParamGroup::ShapeCode,
        ParamGroup::Rotation,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Offsets => 0,
            Self::Scale => 1,
            Self::ShapeCode => 2,
            Self::Rotation => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Offsets => "offsets",
            Self::Scale => "scale",
            Self::ShapeCode => "shape_code",
            Self::Rotation => "rotation",
        }
    }
}

/// One dense `capacity × width` matrix per parameter group.
///
/// Used for the unconstrained parameters, their gradients and the Adam
/// moments, so all four share one row layout (row = slot index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBlock {
    groups: [Array2<f64>; 4],
}

impl ParamBlock {
    pub fn zeros(capacity: usize, latent_dim: usize) -> Self {
        Self {
            groups: [
                Array2::zeros((capacity, 2)),
                Array2::zeros((capacity, 1)),
                Array2::zeros((capacity, latent_dim)),
                Array2::zeros((capacity, 1)),
            ],
        }
    }

    pub fn capacity(&self) -> usize {
        self.groups[0].nrows()
    }

    pub fn latent_dim(&self) -> usize {
        self.groups[2].ncols()
    }

    pub fn fill(&mut self, value: f64) {
        for g in &mut self.groups {
            g.fill(value);
        }
    }

    /// Zero every row whose `keep` flag is false.
    pub fn zero_rows_except(&mut self, keep: &[bool]) {
        for g in &mut self.groups {
            for (row, &k) in keep.iter().enumerate() {
                if !k {
                    g.row_mut(row).fill(0.0);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamGroup, &Array2<f64>)> {
        ParamGroup::ALL.into_iter().map(move |g| (g, &self.groups[g.index()]))
    }
}

impl Index<ParamGroup> for ParamBlock {
    type Output = Array2<f64>;

    fn index(&self, g: ParamGroup) -> &Array2<f64> {
        &self.groups[g.index()]
    }
}

impl IndexMut<ParamGroup> for ParamBlock {
    fn index_mut(&mut self, g: ParamGroup) -> &mut Array2<f64> {
        &mut self.groups[g.index()]
    }
}

/// Per-group scalar, e.g. learning rates, clip limits, gradient norms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerGroup {
    pub offsets: f64,
    pub scale: f64,
    pub shape_code: f64,
    pub rotation: f64,
}

impl PerGroup {
    pub const fn new(offsets: f64, scale: f64, shape_code: f64, rotation: f64) -> Self {
        Self { offsets, scale, shape_code, rotation }
    }

    pub fn get(&self, g: ParamGroup) -> f64 {
        match g {
            ParamGroup::Offsets => self.offsets,
            ParamGroup::Scale => self.scale,
            ParamGroup::ShapeCode => self.shape_code,
            ParamGroup::Rotation => self.rotation,
        }
    }

    pub fn set(&mut self, g: ParamGroup, value: f64) {
        match g {
            ParamGroup::Offsets => self.offsets = value,
            ParamGroup::Scale => self.scale = value,
            ParamGroup::ShapeCode => self.shape_code = value,
            ParamGroup::Rotation => self.rotation = value,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Decoded primitive + bounds
// ─────────────────────────────────────────────────────────────

/// Physical (bounded) parameters of one primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveParams {
    pub offset: [f64; 2],
    pub scale: f64,
    pub rotation: f64,
    pub shape_code: Vec<f64>,
}

/// Bounds of every bounded quantity of a primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBounds {
    pub offset: [Interval; 2],
    pub scale: Interval,
    pub rotation: Interval,
    pub shape_code: Vec<Interval>,
}

impl ParamBounds {
    pub fn latent_dim(&self) -> usize {
        self.shape_code.len()
    }
}

// ─────────────────────────────────────────────────────────────
//  Mesh  (immutable after construction)
// ─────────────────────────────────────────────────────────────

/// Element centroids and areas of the analysis mesh.
#[derive(Debug, Clone)]
pub struct Mesh {
    centroids: Array2<f64>, // n × 2
    areas: Array1<f64>,
    total_area: f64,
    bbox_min: [f64; 2],
    bbox_max: [f64; 2],
}

impl Mesh {
    pub fn new(centroids: Array2<f64>, areas: Array1<f64>) -> Result<Self, TopOptError> {
        let n = centroids.nrows();
        if centroids.ncols() != 2 {
            return Err(TopOptError::Shape(format!(
                "centroids must be n × 2, got {} columns",
                centroids.ncols()
            )));
        }
        if areas.len() != n {
            return Err(TopOptError::Shape(format!(
                "{} areas for {n} elements",
                areas.len()
            )));
        }
        if n == 0 {
            return Err(TopOptError::Shape("mesh has no elements".into()));
        }
        if areas.iter().any(|&a| !(a.is_finite() && a > 0.0)) {
            return Err(TopOptError::Shape("element areas must be positive".into()));
        }

        let mut bbox_min = [f64::INFINITY; 2];
        let mut bbox_max = [f64::NEG_INFINITY; 2];
        for row in centroids.rows() {
            for d in 0..2 {
                bbox_min[d] = bbox_min[d].min(row[d]);
                bbox_max[d] = bbox_max[d].max(row[d]);
            }
        }
        if (0..2).any(|d| bbox_max[d] <= bbox_min[d]) {
            return Err(TopOptError::Shape("mesh bounding box is degenerate".into()));
        }

        let total_area = areas.sum();
        Ok(Self { centroids, areas, total_area, bbox_min, bbox_max })
    }

    /// Structured `nx × ny` grid of square elements covering
    /// `[0, width] × [0, height]`.  Element `e = i·ny + j`.
    pub fn rectangular_grid(nx: usize, ny: usize, width: f64, height: f64) -> Result<Self, TopOptError> {
        if nx == 0 || ny == 0 {
            return Err(TopOptError::Shape("grid needs at least one element per axis".into()));
        }
        let dx = width / nx as f64;
        let dy = height / ny as f64;
        let mut centroids = Array2::zeros((nx * ny, 2));
        for i in 0..nx {
            for j in 0..ny {
                let e = i * ny + j;
                centroids[[e, 0]] = (i as f64 + 0.5) * dx;
                centroids[[e, 1]] = (j as f64 + 0.5) * dy;
            }
        }
        Self::new(centroids, Array1::from_elem(nx * ny, dx * dy))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    #[inline]
    pub fn centroid(&self, e: usize) -> [f64; 2] {
        [self.centroids[[e, 0]], self.centroids[[e, 1]]]
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }

    pub fn areas(&self) -> ArrayView1<'_, f64> {
        self.areas.view()
    }

    pub fn total_area(&self) -> f64 {
        self.total_area
    }

    pub fn bbox_min(&self) -> [f64; 2] {
        self.bbox_min
    }

    pub fn bbox_max(&self) -> [f64; 2] {
        self.bbox_max
    }

    /// Logistic intervals of the two offset coordinates.
    pub fn offset_bounds(&self) -> [Interval; 2] {
        [
            Interval { min: self.bbox_min[0], max: self.bbox_max[0] },
            Interval { min: self.bbox_min[1], max: self.bbox_max[1] },
        ]
    }
}

// ─────────────────────────────────────────────────────────────
//  Objective breakdown  (returned from forward)
// ─────────────────────────────────────────────────────────────

/// Every sub-term of the objective, unweighted, plus both combined values.
///
/// `minimized` carries `−w_c·C` (what the optimiser descends on);
/// `true_sign` carries `+w_c·C`.  The other weighted terms enter both
/// identically.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectiveBreakdown {
    pub compliance: f64,
    pub volume: f64,
    pub volume_goal: f64,
    pub volfrac_loss: f64,
    pub overlap: f64,
    pub shape: f64,
    pub rs: f64,
    pub minimized: f64,
    pub true_sign: f64,
}
