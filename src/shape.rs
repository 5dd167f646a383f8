//! Frozen shape models and the manufacturability predictor.
//!
//! A shape model maps a shape code and a batch of points in a primitive's
//! local frame to kernel values in `[0, 1]` (1 = inside).  Nothing here is
//! ever trained: models are loaded once and only differentiated.
//!
//! Two models ship with the crate:
//! - [`GaussianShape`]: closed-form elliptical kernel, code = `[ratio]`.
//! - [`MlpShapeModel`]: feed-forward decoder loaded from a JSON checkpoint,
//!   with hand-written backprop for the point and code derivatives.

use crate::types::{sigmoid, Interval, TopOptError};
use ndarray::{Array1, Array2, Array4, ArrayView1};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::Debug;
use std::path::Path;

// ─────────────────────────────────────────────────────────────
//  Shape model trait
// ─────────────────────────────────────────────────────────────

/// Kernel values plus their local derivatives for one primitive.
#[derive(Debug, Clone)]
pub struct SdfBatch {
    pub values: Vec<f64>,
    /// ∂k/∂u, ∂k/∂v per point.
    pub d_point: Vec<[f64; 2]>,
    /// ∂k/∂code, one row per point.
    pub d_code: Array2<f64>,
}

/// Name under which the shape code is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeCodeKind {
    SigmasRatio,
    ShapeCode,
}

/// Reference point of the latent space (Mahalanobis distance).
#[derive(Debug, Clone, PartialEq)]
pub struct LatentReference {
    pub center: Array1<f64>,
    pub cov_inv: Array2<f64>,
}

impl LatentReference {
    /// Squared Mahalanobis distance and its gradient w.r.t. `code`.
    pub fn distance_sq(&self, code: &[f64]) -> (f64, Vec<f64>) {
        let d = ArrayView1::from(code).to_owned() - &self.center;
        let md = self.cov_inv.dot(&d);
        let sym = &md + &self.cov_inv.t().dot(&d);
        (d.dot(&md), sym.to_vec())
    }
}

pub trait ShapeModel: Debug + Send + Sync {
    fn latent_dim(&self) -> usize;

    /// Valid range of every code component.
    fn code_bounds(&self) -> Vec<Interval>;

    /// Half side of the local window outside which the kernel is treated
    /// as zero.
    fn support(&self) -> f64 {
        1.0
    }

    fn sdf(&self, code: &[f64], points: &[[f64; 2]]) -> Vec<f64> {
        self.sdf_with_grad(code, points).values
    }

    fn sdf_with_grad(&self, code: &[f64], points: &[[f64; 2]]) -> SdfBatch;

    /// Number of leading code components feeding `radius_sum`.
    fn radius_latent_dim(&self) -> usize;

    fn radius_sum(&self, prefix: &[f64]) -> f64;

    fn radius_sum_grad(&self, prefix: &[f64]) -> Vec<f64>;

    /// Code of a primitive with minor/major axis ratio `ratio`.
    fn template_code(&self, ratio: f64) -> Result<Vec<f64>, TopOptError>;

    /// Area of the primitive's footprint, if known in closed form.
    fn nominal_area(&self, _code: &[f64], _scale: f64) -> Option<f64> {
        None
    }

    fn latent_reference(&self) -> Option<&LatentReference> {
        None
    }

    fn code_kind(&self) -> ShapeCodeKind;
}

// ─────────────────────────────────────────────────────────────
//  Elliptical Gaussian kernel
// ─────────────────────────────────────────────────────────────

const GAUSS_SHARPNESS: f64 = 10.0;
const GAUSS_RATIO_EPS: f64 = 1e-6;
const GAUSS_Z_EPS: f64 = 1e-12;

/// `k = 1 / (1 + exp(10 (z − 1)))`, `z = sqrt(u² + v²/r²)`.
///
/// The half-level set `z = 1` is an ellipse with semi-axes `s` (along u)
/// and `s·r` (along v), so the footprint area is `π s² r`.
#[derive(Debug, Clone)]
pub struct GaussianShape {
    ratio_bounds: Interval,
    support: f64,
}

impl GaussianShape {
    pub fn new(ratio_bounds: Interval) -> Self {
        // k(z = 3) ≈ 2e-9
        let support = 3.0 * ratio_bounds.max.max(1.0);
        Self { ratio_bounds, support }
    }

    #[inline]
    fn eval(u: f64, v: f64, r: f64) -> (f64, [f64; 2], f64) {
        let r2 = r * r + GAUSS_RATIO_EPS;
        let z = (u * u + v * v / r2 + GAUSS_Z_EPS).sqrt();
        let k = sigmoid(-GAUSS_SHARPNESS * (z - 1.0));
        let dk_dz = -GAUSS_SHARPNESS * k * (1.0 - k);
        let du = dk_dz * u / z;
        let dv = dk_dz * v / (r2 * z);
        let dr = dk_dz * (-v * v * r / (r2 * r2 * z));
        (k, [du, dv], dr)
    }
}

impl ShapeModel for GaussianShape {
    fn latent_dim(&self) -> usize {
        1
    }

    fn code_bounds(&self) -> Vec<Interval> {
        vec![self.ratio_bounds]
    }

    fn support(&self) -> f64 {
        self.support
    }

    fn sdf_with_grad(&self, code: &[f64], points: &[[f64; 2]]) -> SdfBatch {
        let r = code[0];
        let mut values = Vec::with_capacity(points.len());
        let mut d_point = Vec::with_capacity(points.len());
        let mut d_code = Array2::zeros((points.len(), 1));
        for (p, &[u, v]) in points.iter().enumerate() {
            let (k, dp, dr) = Self::eval(u, v, r);
            values.push(k);
            d_point.push(dp);
            d_code[[p, 0]] = dr;
        }
        SdfBatch { values, d_point, d_code }
    }

    fn radius_latent_dim(&self) -> usize {
        0
    }

    fn radius_sum(&self, _prefix: &[f64]) -> f64 {
        0.0
    }

    fn radius_sum_grad(&self, prefix: &[f64]) -> Vec<f64> {
        vec![0.0; prefix.len()]
    }

    fn template_code(&self, ratio: f64) -> Result<Vec<f64>, TopOptError> {
        Ok(vec![ratio])
    }

    fn nominal_area(&self, code: &[f64], scale: f64) -> Option<f64> {
        Some(PI * scale * scale * code[0])
    }

    fn code_kind(&self) -> ShapeCodeKind {
        ShapeCodeKind::SigmasRatio
    }
}

// ─────────────────────────────────────────────────────────────
//  Dense network with input gradients
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu,
    Tanh,
    Sigmoid,
}

/// One affine layer as stored on disk.  Batch-norm layers of the trained
/// network are folded into `weights`/`bias` before export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayerSpec {
    /// `out × in`, row-major.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default = "default_activation")]
    pub activation: Activation,
    #[serde(default = "default_negative_slope")]
    pub negative_slope: f64,
}

fn default_activation() -> Activation {
    Activation::Identity
}

fn default_negative_slope() -> f64 {
    0.2
}

#[derive(Debug, Clone)]
struct Dense {
    w: Array2<f64>,
    b: Array1<f64>,
    act: Activation,
    slope: f64,
}

impl Dense {
    fn from_spec(spec: &DenseLayerSpec) -> Result<Self, String> {
        let rows = spec.weights.len();
        let cols = spec.weights.first().map_or(0, Vec::len);
        if rows == 0 || cols == 0 {
            return Err("empty layer".into());
        }
        if spec.weights.iter().any(|r| r.len() != cols) {
            return Err("ragged weight matrix".into());
        }
        if spec.bias.len() != rows {
            return Err(format!("bias has {} entries for {rows} outputs", spec.bias.len()));
        }
        let flat: Vec<f64> = spec.weights.iter().flatten().copied().collect();
        let w = Array2::from_shape_vec((rows, cols), flat).map_err(|e| e.to_string())?;
        Ok(Self {
            w,
            b: Array1::from(spec.bias.clone()),
            act: spec.activation,
            slope: spec.negative_slope,
        })
    }

    #[inline]
    fn activate(&self, z: f64) -> f64 {
        match self.act {
            Activation::Identity => z,
            Activation::Relu => z.max(0.0),
            Activation::LeakyRelu => if z >= 0.0 { z } else { self.slope * z },
            Activation::Tanh => z.tanh(),
            Activation::Sigmoid => sigmoid(z),
        }
    }

    /// Derivative given pre-activation `z` and output `a`.
    #[inline]
    fn activate_grad(&self, z: f64, a: f64) -> f64 {
        match self.act {
            Activation::Identity => 1.0,
            Activation::Relu => if z > 0.0 { 1.0 } else { 0.0 },
            Activation::LeakyRelu => if z >= 0.0 { 1.0 } else { self.slope },
            Activation::Tanh => 1.0 - a * a,
            Activation::Sigmoid => a * (1.0 - a),
        }
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    fn from_specs(specs: &[DenseLayerSpec]) -> Result<Self, String> {
        if specs.is_empty() {
            return Err("network has no layers".into());
        }
        let layers = specs.iter().map(Dense::from_spec).collect::<Result<Vec<_>, _>>()?;
        for pair in layers.windows(2) {
            if pair[0].w.nrows() != pair[1].w.ncols() {
                return Err(format!(
                    "layer output {} does not match next input {}",
                    pair[0].w.nrows(),
                    pair[1].w.ncols()
                ));
            }
        }
        Ok(Self { layers })
    }

    fn input_dim(&self) -> usize {
        self.layers[0].w.ncols()
    }

    fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].w.nrows()
    }

    fn forward(&self, x: Array1<f64>) -> Array1<f64> {
        self.layers.iter().fold(x, |a, layer| {
            (layer.w.dot(&a) + &layer.b).mapv(|z| layer.activate(z))
        })
    }

    /// Scalar output (first component) and its gradient w.r.t. the input.
    fn forward_with_input_grad(&self, x: Array1<f64>) -> (f64, Array1<f64>) {
        let mut pre = Vec::with_capacity(self.layers.len());
        let mut post = Vec::with_capacity(self.layers.len());
        let mut a = x;
        for layer in &self.layers {
            let z = layer.w.dot(&a) + &layer.b;
            a = z.mapv(|zi| layer.activate(zi));
            pre.push(z);
            post.push(a.clone());
        }

        let out = a[0];
        let mut g = Array1::zeros(a.len());
        g[0] = 1.0;
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let local = ndarray::Zip::from(&pre[l])
                .and(&post[l])
                .map_collect(|&z, &ai| layer.activate_grad(z, ai));
            let g_pre = g * local;
            g = layer.w.t().dot(&g_pre);
        }
        (out, g)
    }
}

// ─────────────────────────────────────────────────────────────
//  Learned SDF model
// ─────────────────────────────────────────────────────────────

/// On-disk form of [`MlpShapeModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpCheckpoint {
    /// Decoder: input `[code…, u, v]`, scalar kernel output.
    pub sdf_layers: Vec<DenseLayerSpec>,
    /// Encoder used for template codes; input is a shape descriptor.
    #[serde(default)]
    pub encoder_layers: Vec<DenseLayerSpec>,
    /// Descriptor slot that receives the axis ratio.
    #[serde(default = "default_ratio_slot")]
    pub encoder_ratio_index: usize,
    /// Linear radius head over the first `radius_weights.len()` code entries.
    pub radius_weights: Vec<f64>,
    #[serde(default)]
    pub radius_bias: f64,
    pub latent_mins: Vec<f64>,
    pub latent_maxs: Vec<f64>,
    /// Applied to the recorded latent extremes to form the code bounds.
    #[serde(default = "default_bounds_margin")]
    pub bounds_margin: f64,
    #[serde(default)]
    pub latent_mean: Option<Vec<f64>>,
    #[serde(default)]
    pub latent_cov_inv: Option<Vec<Vec<f64>>>,
}

fn default_ratio_slot() -> usize {
    1
}

fn default_bounds_margin() -> f64 {
    1.2
}

#[derive(Debug, Clone)]
pub struct MlpShapeModel {
    decoder: Mlp,
    encoder: Option<Mlp>,
    encoder_ratio_index: usize,
    radius_weights: Vec<f64>,
    radius_bias: f64,
    bounds: Vec<Interval>,
    reference: Option<LatentReference>,
}

impl MlpShapeModel {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TopOptError> {
        let path = path.as_ref();
        let load_err = |reason: String| TopOptError::ShapeModelLoad {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let ckpt: MlpCheckpoint = serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?;
        Self::from_checkpoint(&ckpt).map_err(|e| match e {
            TopOptError::ShapeModelLoad { reason, .. } => load_err(reason),
            other => other,
        })
    }

    pub fn from_checkpoint(ckpt: &MlpCheckpoint) -> Result<Self, TopOptError> {
        let fail = |reason: String| TopOptError::ShapeModelLoad { path: "<checkpoint>".into(), reason };

        let latent_dim = ckpt.latent_mins.len();
        if latent_dim == 0 || ckpt.latent_maxs.len() != latent_dim {
            return Err(fail("latent_mins / latent_maxs must be non-empty and equal length".into()));
        }
        let bounds = ckpt
            .latent_mins
            .iter()
            .zip(&ckpt.latent_maxs)
            .map(|(&lo, &hi)| Interval::new(lo * ckpt.bounds_margin, hi * ckpt.bounds_margin))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| fail(e.to_string()))?;

        let decoder = Mlp::from_specs(&ckpt.sdf_layers).map_err(|e| fail(format!("sdf head: {e}")))?;
        if decoder.input_dim() != latent_dim + 2 || decoder.output_dim() != 1 {
            return Err(fail(format!(
                "sdf head must map {} inputs to 1 output, got {} → {}",
                latent_dim + 2,
                decoder.input_dim(),
                decoder.output_dim()
            )));
        }

        let encoder = if ckpt.encoder_layers.is_empty() {
            None
        } else {
            let enc = Mlp::from_specs(&ckpt.encoder_layers).map_err(|e| fail(format!("encoder: {e}")))?;
            if enc.output_dim() != latent_dim || ckpt.encoder_ratio_index >= enc.input_dim() {
                return Err(fail("encoder does not produce the latent code".into()));
            }
            Some(enc)
        };

        if ckpt.radius_weights.len() > latent_dim {
            return Err(fail("radius head wider than the latent code".into()));
        }

        let reference = match (&ckpt.latent_mean, &ckpt.latent_cov_inv) {
            (Some(mean), Some(cov)) => {
                if mean.len() != latent_dim || cov.len() != latent_dim || cov.iter().any(|r| r.len() != latent_dim) {
                    return Err(fail("latent statistics have the wrong dimension".into()));
                }
                let flat: Vec<f64> = cov.iter().flatten().copied().collect();
                let cov_inv = Array2::from_shape_vec((latent_dim, latent_dim), flat)
                    .map_err(|e| fail(e.to_string()))?;
                Some(LatentReference { center: Array1::from(mean.clone()), cov_inv })
            }
            _ => None,
        };

        Ok(Self {
            decoder,
            encoder,
            encoder_ratio_index: ckpt.encoder_ratio_index,
            radius_weights: ckpt.radius_weights.clone(),
            radius_bias: ckpt.radius_bias,
            bounds,
            reference,
        })
    }

    fn decoder_input(code: &[f64], u: f64, v: f64) -> Array1<f64> {
        let mut x = Array1::zeros(code.len() + 2);
        for (k, &c) in code.iter().enumerate() {
            x[k] = c;
        }
        x[code.len()] = u;
        x[code.len() + 1] = v;
        x
    }
}

impl ShapeModel for MlpShapeModel {
    fn latent_dim(&self) -> usize {
        self.bounds.len()
    }

    fn code_bounds(&self) -> Vec<Interval> {
        self.bounds.clone()
    }

    fn sdf(&self, code: &[f64], points: &[[f64; 2]]) -> Vec<f64> {
        points
            .iter()
            .map(|&[u, v]| self.decoder.forward(Self::decoder_input(code, u, v))[0])
            .collect()
    }

    fn sdf_with_grad(&self, code: &[f64], points: &[[f64; 2]]) -> SdfBatch {
        let l = code.len();
        let mut values = Vec::with_capacity(points.len());
        let mut d_point = Vec::with_capacity(points.len());
        let mut d_code = Array2::zeros((points.len(), l));
        for (p, &[u, v]) in points.iter().enumerate() {
            let (k, g) = self.decoder.forward_with_input_grad(Self::decoder_input(code, u, v));
            values.push(k);
            d_point.push([g[l], g[l + 1]]);
            d_code.row_mut(p).assign(&g.slice(ndarray::s![..l]));
        }
        SdfBatch { values, d_point, d_code }
    }

    fn radius_latent_dim(&self) -> usize {
        self.radius_weights.len()
    }

    fn radius_sum(&self, prefix: &[f64]) -> f64 {
        self.radius_weights.iter().zip(prefix).map(|(w, z)| w * z).sum::<f64>() + self.radius_bias
    }

    fn radius_sum_grad(&self, prefix: &[f64]) -> Vec<f64> {
        self.radius_weights.iter().take(prefix.len()).copied().collect()
    }

    fn template_code(&self, ratio: f64) -> Result<Vec<f64>, TopOptError> {
        let encoder = self.encoder.as_ref().ok_or_else(|| {
            TopOptError::InvalidConfig("shape model has no encoder head for template codes".into())
        })?;
        let mut descriptor = Array1::zeros(encoder.input_dim());
        descriptor[self.encoder_ratio_index] = ratio;
        let z = encoder.forward(descriptor);
        Ok(z.iter()
            .zip(&self.bounds)
            .map(|(&zi, b)| zi.clamp(b.min, b.max))
            .collect())
    }

    fn latent_reference(&self) -> Option<&LatentReference> {
        self.reference.as_ref()
    }

    fn code_kind(&self) -> ShapeCodeKind {
        ShapeCodeKind::ShapeCode
    }
}

// ─────────────────────────────────────────────────────────────
//  Manufacturability predictor
// ─────────────────────────────────────────────────────────────

/// Frozen scorer of rasterised primitives; higher = harder to build.
pub trait ManufacturabilityPredictor: Debug + Send + Sync {
    fn grid_size(&self) -> usize;

    /// `B × 1 × G × G` → `B` scores.
    fn predict(&self, batch: &Array4<f64>) -> Array1<f64>;

    /// ∂(Σ_b upstream_b · score_b)/∂batch.
    fn input_gradient(&self, batch: &Array4<f64>, upstream: &Array1<f64>) -> Array4<f64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictorSpec {
    pub grid_size: usize,
    /// Row-major `G × G`.
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
}

/// Logistic scoring head: `σ(⟨W, grid⟩ + b)`.
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    weights: Array2<f64>,
    bias: f64,
}

impl LinearPredictor {
    pub fn new(spec: LinearPredictorSpec) -> Result<Self, TopOptError> {
        let g = spec.grid_size;
        if g == 0 {
            return Err(TopOptError::PredictorLoad { path: "<spec>".into(), reason: "grid_size must be positive".into() });
        }
        let weights = Array2::from_shape_vec((g, g), spec.weights).map_err(|e| TopOptError::PredictorLoad {
            path: "<spec>".into(),
            reason: e.to_string(),
        })?;
        Ok(Self { weights, bias: spec.bias })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TopOptError> {
        let path = path.as_ref();
        let load_err = |reason: String| TopOptError::PredictorLoad {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let spec: LinearPredictorSpec = serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?;
        Self::new(spec).map_err(|e| load_err(e.to_string()))
    }

    fn logits(&self, batch: &Array4<f64>) -> Array1<f64> {
        batch
            .outer_iter()
            .map(|item| (&item.index_axis(ndarray::Axis(0), 0) * &self.weights).sum() + self.bias)
            .collect()
    }
}

impl ManufacturabilityPredictor for LinearPredictor {
    fn grid_size(&self) -> usize {
        self.weights.nrows()
    }

    fn predict(&self, batch: &Array4<f64>) -> Array1<f64> {
        self.logits(batch).mapv(sigmoid)
    }

    fn input_gradient(&self, batch: &Array4<f64>, upstream: &Array1<f64>) -> Array4<f64> {
        let scores = self.predict(batch);
        let mut grad = Array4::zeros(batch.raw_dim());
        for (b, mut item) in grad.outer_iter_mut().enumerate() {
            let s = scores[b];
            let factor = upstream[b] * s * (1.0 - s);
            item.index_axis_mut(ndarray::Axis(0), 0).assign(&(&self.weights * factor));
        }
        grad
    }
}
