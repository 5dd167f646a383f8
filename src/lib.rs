//! # primtopo
//!
//! Structural topology optimisation where the density field is the union of
//! a fixed pool of parametric shape primitives (elliptical Gaussians or
//! learned signed-distance shapes).  Gradients are hand-coded; overlapping
//! primitives are merged during the run.
//!
//! ## Pipeline (one iteration)
//! 1. `TopologyEngine::get_x`: decode live primitives, evaluate H
//! 2. external FEM: element sensitivities `ce`
//! 3. `TopologyEngine::forward`: objective + analytic gradients
//! 4. `TopologyEngine::prepare_grads`: mask and clip per group
//! 5. Adam step
//! 6. `TopologyEngine::update_shape_combination`: merge at markers
//!
//! `IterationController` runs that loop.

pub mod types;
pub mod config;
pub mod shape;
pub mod pool;
pub mod field;
pub mod objectives;
pub mod gradients;
pub mod merge;
pub mod engine;
pub mod optimizer;
pub mod catalog;

pub use config::{EngineConfig, EngineKind};
pub use engine::{DesignExport, ShapeExport, TopologyEngine};
pub use optimizer::{IterationController, SensitivityAnalysis};
pub use types::{Mesh, ObjectiveBreakdown, TopOptError};
