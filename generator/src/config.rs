// config.rs — Problem description (serde model of the input JSON)
//
// The problem description is read once, before any pass runs, and is never
// mutated afterwards. Field names follow camelCase in JSON.
//
// Preconditions: none.
// Postconditions: a `ProblemConfig` that is syntactically well-formed; all
//   semantic checks (shapes, divisibility, flag consistency) live in validate.rs.
// Failure modes: malformed JSON or unknown fields (`ConfigError`).
// Side effects: `load` reads one file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Dense matrix given row by row.
pub type Rows = Vec<Vec<f64>>;

// ── Top-level record ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProblemConfig {
    /// Prefix of every emitted symbol.
    #[serde(default = "default_module_name")]
    pub module_name: String,
    pub dims: Dimensions,
    #[serde(default)]
    pub flags: FeatureFlags,
    pub objective: ObjectiveSpec,
    #[serde(default)]
    pub bounds: BoundsSpec,
    #[serde(default)]
    pub path_constraint: Option<PathConstraintSpec>,
    /// Point constraints keyed by node index (0..=N).
    #[serde(default)]
    pub point_constraints: BTreeMap<usize, PointConstraintSpec>,
}

fn default_module_name() -> String {
    "rti".to_string()
}

/// `{N, NX, NU, NY, NYN, NOD}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimensions {
    pub n: usize,
    pub nx: usize,
    pub nu: usize,
    pub ny: usize,
    pub nyn: usize,
    #[serde(default)]
    pub nod: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityMode {
    #[default]
    Forward,
    Backward,
    Inexact,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FeatureFlags {
    pub use_arrival_cost: bool,
    pub variable_weighting: bool,
    pub hardcode_constraints: bool,
    pub initial_state_fixed: bool,
    pub sensitivity_mode: SensitivityMode,
    pub levenberg_marquardt: f64,
    pub lifted_gradient_update: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_arrival_cost: false,
            variable_weighting: false,
            hardcode_constraints: false,
            initial_state_fixed: true,
            sensitivity_mode: SensitivityMode::Forward,
            levenberg_marquardt: 0.0,
            lifted_gradient_update: false,
        }
    }
}

// ── Objective ───────────────────────────────────────────────────────────────

/// A weighting matrix known now, or supplied by the caller at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WeightSpec {
    Given(Rows),
    Runtime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinearTermSpec {
    #[default]
    None,
    Runtime,
    Given { x: Vec<f64>, u: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectiveSpec {
    pub weight: WeightSpec,
    pub terminal_weight: WeightSpec,
    /// Constant Jacobian of the stage residual w.r.t. the state (NY x NX).
    #[serde(default)]
    pub jacobian_x: Option<Rows>,
    /// Constant Jacobian of the stage residual w.r.t. the control (NY x NU).
    #[serde(default)]
    pub jacobian_u: Option<Rows>,
    /// Constant Jacobian of the terminal residual (NYN x NX).
    #[serde(default)]
    pub terminal_jacobian_x: Option<Rows>,
    #[serde(default = "default_true")]
    pub cross_term: bool,
    #[serde(default)]
    pub linear_terms: LinearTermSpec,
}

fn default_true() -> bool {
    true
}

// ── Constraints ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundsSpec {
    /// State bounds per node (1..=N are used).
    #[serde(default)]
    pub x: BTreeMap<usize, BoundPair>,
    /// Control bounds per node (0..N).
    #[serde(default)]
    pub u: BTreeMap<usize, BoundPair>,
}

/// Either side may be omitted; a missing side is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundPair {
    #[serde(default)]
    pub lower: Option<Vec<f64>>,
    #[serde(default)]
    pub upper: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PathConstraintSpec {
    /// Symbol of the external evaluation function.
    pub name: String,
    pub dim: usize,
    /// `dim` values shared by every node, or `N * dim` values.
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    #[serde(default)]
    pub jacobian_x: Option<Rows>,
    #[serde(default)]
    pub jacobian_u: Option<Rows>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PointConstraintSpec {
    /// Symbol of the external evaluation function.
    pub name: String,
    /// Total output width of the function: value plus Jacobian entries.
    pub output_width: usize,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

// ── Loading ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Json {
        path: Option<PathBuf>,
        source: serde_json::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Json {
                path: Some(path),
                source,
            } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Json { path: None, source } => write!(f, "{}", source),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
        }
    }
}

impl ProblemConfig {
    /// Parse a problem description from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Json {
            path: None,
            source: e,
        })
    }

    /// Read and parse a problem description file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Json {
            path: Some(path.to_path_buf()),
            source: e,
        })
    }

    /// Compact JSON with fixed field order; the provenance hash input.
    pub fn canonical_json(&self) -> String {
        // Struct fields serialize in declaration order and maps are BTreeMaps,
        // so the encoding depends only on the value.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "dims": { "n": 3, "nx": 2, "nu": 1, "ny": 3, "nyn": 2 },
        "objective": {
            "weight": { "given": [[1, 0, 0], [0, 1, 0], [0, 0, 1]] },
            "terminalWeight": "runtime"
        }
    }"#;

    #[test]
    fn minimal_description_uses_defaults() {
        let cfg = ProblemConfig::from_json(MINIMAL).unwrap();
        assert_eq!(cfg.module_name, "rti");
        assert_eq!(cfg.dims.nod, 0);
        assert!(cfg.flags.initial_state_fixed);
        assert!(!cfg.flags.use_arrival_cost);
        assert_eq!(cfg.flags.sensitivity_mode, SensitivityMode::Forward);
        assert_eq!(cfg.objective.terminal_weight, WeightSpec::Runtime);
        assert!(cfg.objective.cross_term);
        assert_eq!(cfg.objective.linear_terms, LinearTermSpec::None);
        assert!(cfg.point_constraints.is_empty());
    }

    #[test]
    fn point_constraints_keyed_by_node() {
        let text = r#"{
            "dims": { "n": 3, "nx": 2, "nu": 1, "ny": 3, "nyn": 2 },
            "objective": { "weight": "runtime", "terminalWeight": "runtime" },
            "pointConstraints": {
                "1": { "name": "pc1", "outputWidth": 8, "lower": [0, 0], "upper": [1, 1] }
            }
        }"#;
        let cfg = ProblemConfig::from_json(text).unwrap();
        let pc = &cfg.point_constraints[&1];
        assert_eq!(pc.name, "pc1");
        assert_eq!(pc.output_width, 8);
    }

    #[test]
    fn unknown_field_rejected() {
        let text = r#"{
            "dims": { "n": 3, "nx": 2, "nu": 1, "ny": 3, "nyn": 2, "nz": 4 },
            "objective": { "weight": "runtime", "terminalWeight": "runtime" }
        }"#;
        let err = ProblemConfig::from_json(text).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }

    #[test]
    fn canonical_json_round_trips_value() {
        let cfg = ProblemConfig::from_json(MINIMAL).unwrap();
        let again = ProblemConfig::from_json(&cfg.canonical_json()).unwrap();
        assert_eq!(cfg, again);
        assert_eq!(cfg.canonical_json(), again.canonical_json());
    }

    #[test]
    fn linear_terms_given_form() {
        let text = r#"{
            "dims": { "n": 2, "nx": 1, "nu": 1, "ny": 2, "nyn": 1 },
            "objective": {
                "weight": "runtime",
                "terminalWeight": "runtime",
                "linearTerms": { "given": { "x": [0.5], "u": [0.25] } }
            }
        }"#;
        let cfg = ProblemConfig::from_json(text).unwrap();
        assert_eq!(
            cfg.objective.linear_terms,
            LinearTermSpec::Given {
                x: vec![0.5],
                u: vec![0.25]
            }
        );
    }
}
