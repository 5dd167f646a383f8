//! Problem catalog: a JSON object keyed by problem name.
//!
//! Each entry may carry arbitrary problem settings; exporting a design only
//! replaces the design keys (`offsets`, `scale`, `rotation`, and
//! `sigmas_ratio` or `shape_code`) and leaves the rest of the entry alone.

use crate::engine::DesignExport;
use crate::types::TopOptError;
use serde_json::{Map, Value};
use std::path::Path;

const SHAPE_KEYS: [&str; 2] = ["sigmas_ratio", "shape_code"];

fn read_catalog(path: &Path) -> Result<Map<String, Value>, TopOptError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(TopOptError::Shape(format!("catalog {} is not a JSON object", path.display()))),
    }
}

/// Merge `design` into entry `problem_name` of the catalog at `path`.
/// A missing file is treated as an empty catalog.
pub fn export_design(path: impl AsRef<Path>, problem_name: &str, design: &DesignExport) -> Result<(), TopOptError> {
    let path = path.as_ref();
    let mut catalog = read_catalog(path)?;

    let mut entry = match catalog.remove(problem_name) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for key in SHAPE_KEYS {
        entry.remove(key);
    }
    if let Value::Object(fields) = serde_json::to_value(design)? {
        entry.extend(fields);
    }
    catalog.insert(problem_name.to_string(), Value::Object(entry));

    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(catalog))?)?;
    tracing::info!(path = %path.display(), problem = problem_name, primitives = design.len(), "design exported");
    Ok(())
}

/// Read the design stored under `problem_name`.
pub fn load_template(path: impl AsRef<Path>, problem_name: &str) -> Result<DesignExport, TopOptError> {
    let path = path.as_ref();
    let mut catalog = read_catalog(path)?;
    let entry = catalog
        .remove(problem_name)
        .ok_or_else(|| TopOptError::MissingProblem(problem_name.to_string()))?;
    Ok(serde_json::from_value(entry)?)
}
