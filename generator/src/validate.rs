// validate.rs — Problem validation and normalization
//
// Turns the raw `ProblemConfig` into an immutable `Problem`: given matrices
// converted to nalgebra, bound sets stacked over the horizon, point-constraint
// dimensions derived from the declared output widths.
//
// Preconditions: a syntactically valid `ProblemConfig`.
// Postconditions: on success every shape in `Problem` agrees with the
//   dimension set; `box_bounds` has `N*NU + N*NX` entries, `affine_bounds`
//   has `dim_htot()` entries, `con_dim` has `N + 1` entries.
// Failure modes: shape mismatch, indivisible point-constraint width,
//   inconsistent flags (error diagnostics; no `Problem` is produced).
// Side effects: none.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::config::{
    BoundPair, Dimensions, FeatureFlags, LinearTermSpec, ProblemConfig, Rows, SensitivityMode,
    WeightSpec,
};
use crate::diag::{codes, DiagLevel, Diagnostic};

/// Magnitude emitted for an absent bound.
pub const INFTY: f64 = 1.0e12;

// ── Validated problem ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub module: String,
    pub dims: Dimensions,
    pub flags: FeatureFlags,
    /// Stage weighting `S`; `None` when supplied at run time.
    pub weight: Option<DMatrix<f64>>,
    /// Terminal weighting `SN`; `None` when supplied at run time.
    pub terminal_weight: Option<DMatrix<f64>>,
    pub jac_x: Option<DMatrix<f64>>,
    pub jac_u: Option<DMatrix<f64>>,
    pub jac_x_end: Option<DMatrix<f64>>,
    pub cross_term: bool,
    pub linear_terms: LinearTerms,
    /// Controls of nodes 0..N, then states of nodes 1..=N.
    pub box_bounds: BoundValues,
    pub path: Option<PathConstraint>,
    pub points: BTreeMap<usize, PointConstraint>,
    /// Path and point bounds interleaved per node, terminal point last.
    pub affine_bounds: BoundValues,
    /// Affine-constraint rows contributed by each node 0..=N.
    pub con_dim: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinearTerms {
    None,
    Given { x: DVector<f64>, u: DVector<f64> },
    Runtime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundValues {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl BoundValues {
    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathConstraint {
    pub name: String,
    pub dim: usize,
    /// `N * dim` stacked lower bounds.
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
    pub jac_x: Option<DMatrix<f64>>,
    pub jac_u: Option<DMatrix<f64>>,
}

impl PathConstraint {
    /// Width of the evaluation output: values, then Jacobians not given.
    pub fn output_width(&self, nx: usize, nu: usize) -> usize {
        let mut width = self.dim;
        if self.jac_x.is_none() {
            width += self.dim * nx;
        }
        if self.jac_u.is_none() {
            width += self.dim * nu;
        }
        width
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointConstraint {
    pub name: String,
    pub width: usize,
    pub dim: usize,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl Problem {
    /// Primal variables seen by the QP.
    pub fn num_qp_vars(&self) -> usize {
        let Dimensions { n, nx, nu, .. } = self.dims;
        if self.flags.initial_state_fixed {
            n * nx + n * nu
        } else {
            (n + 1) * nx + n * nu
        }
    }

    pub fn dim_pac(&self) -> usize {
        self.path.as_ref().map_or(0, |p| p.dim)
    }

    /// Total point-constraint rows over the horizon.
    pub fn dim_poc(&self) -> usize {
        self.points.values().map(|p| p.dim).sum()
    }

    /// Total affine-constraint rows: `N * dim(path) + sum(dim(point_i))`.
    pub fn dim_htot(&self) -> usize {
        self.con_dim.iter().sum()
    }

    pub fn dim_box(&self) -> usize {
        self.dims.n * (self.dims.nu + self.dims.nx)
    }

    /// First affine row owned by `node`.
    pub fn affine_offset(&self, node: usize) -> usize {
        self.con_dim[..node].iter().sum()
    }

    /// Sensitivities propagated backwards: linear terms become per node.
    pub fn adjoint(&self) -> bool {
        match self.flags.sensitivity_mode {
            SensitivityMode::Backward => true,
            SensitivityMode::Inexact => self.flags.lifted_gradient_update,
            SensitivityMode::Forward => false,
        }
    }

    pub fn has_constraints(&self) -> bool {
        self.path.is_some() || !self.points.is_empty()
    }

    /// Free initial state (MHE): arrival-cost terms enter the feedback step.
    pub fn estimates_initial_state(&self) -> bool {
        !self.flags.initial_state_fixed
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ValidateResult {
    pub problem: Option<Problem>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn validate(config: &ProblemConfig) -> ValidateResult {
    let mut v = Validator {
        diagnostics: Vec::new(),
    };
    let problem = v.run(config);
    let problem = if v.diagnostics.iter().any(Diagnostic::is_error) {
        None
    } else {
        problem
    };
    ValidateResult {
        problem,
        diagnostics: v.diagnostics,
    }
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Internal validator ──────────────────────────────────────────────────────

struct Validator {
    diagnostics: Vec<Diagnostic>,
}

impl Validator {
    fn error(&mut self, d: Diagnostic) {
        self.diagnostics.push(d);
    }

    fn run(&mut self, config: &ProblemConfig) -> Option<Problem> {
        let dims = config.dims;
        self.check_dims(&dims);
        if !is_c_identifier(&config.module_name) {
            self.error(
                Diagnostic::error(
                    codes::E0002,
                    format!("'{}' is not a valid C identifier", config.module_name),
                )
                .with_subject("moduleName"),
            );
        }
        self.check_flags(&config.flags);
        if self.diagnostics.iter().any(Diagnostic::is_error) {
            // Shapes below are meaningless without a consistent dimension set.
            return None;
        }

        let obj = &config.objective;
        let weight = match &obj.weight {
            WeightSpec::Given(rows) => {
                if config.flags.variable_weighting {
                    self.error(
                        Diagnostic::error(
                            codes::E0102,
                            "weighting matrix is given but variable weighting is requested",
                        )
                        .with_subject("objective.weight")
                        .with_hint("use \"runtime\" for per-node weighting"),
                    );
                    None
                } else {
                    self.matrix(rows, dims.ny, dims.ny, "objective.weight")
                }
            }
            WeightSpec::Runtime => None,
        };
        let terminal_weight = match &obj.terminal_weight {
            WeightSpec::Given(rows) => {
                self.matrix(rows, dims.nyn, dims.nyn, "objective.terminalWeight")
            }
            WeightSpec::Runtime => None,
        };
        let jac_x = obj
            .jacobian_x
            .as_ref()
            .and_then(|r| self.matrix(r, dims.ny, dims.nx, "objective.jacobianX"));
        let jac_u = obj
            .jacobian_u
            .as_ref()
            .and_then(|r| self.matrix(r, dims.ny, dims.nu, "objective.jacobianU"));
        let jac_x_end = obj
            .terminal_jacobian_x
            .as_ref()
            .and_then(|r| self.matrix(r, dims.nyn, dims.nx, "objective.terminalJacobianX"));

        let linear_terms = match &obj.linear_terms {
            LinearTermSpec::None => LinearTerms::None,
            LinearTermSpec::Runtime => LinearTerms::Runtime,
            LinearTermSpec::Given { x, u } => {
                let lx = self.vector(x, dims.nx, "objective.linearTerms.x");
                let lu = self.vector(u, dims.nu, "objective.linearTerms.u");
                match (lx, lu) {
                    (Some(x), Some(u)) => LinearTerms::Given { x, u },
                    _ => LinearTerms::None,
                }
            }
        };

        let box_bounds = self.stack_box_bounds(config);
        let path = config
            .path_constraint
            .as_ref()
            .and_then(|p| self.path_constraint(p, &dims));
        let points = self.point_constraints(config);

        let mut con_dim = vec![0usize; dims.n + 1];
        let dim_pac = path.as_ref().map_or(0, |p| p.dim);
        for d in con_dim.iter_mut().take(dims.n) {
            *d += dim_pac;
        }
        for (&node, pc) in &points {
            con_dim[node] += pc.dim;
        }
        let affine_bounds = stack_affine_bounds(dims.n, path.as_ref(), &points);

        Some(Problem {
            module: config.module_name.clone(),
            dims,
            flags: config.flags,
            weight,
            terminal_weight,
            jac_x,
            jac_u,
            jac_x_end,
            cross_term: obj.cross_term,
            linear_terms,
            box_bounds,
            path,
            points,
            affine_bounds,
            con_dim,
        })
    }

    fn check_dims(&mut self, dims: &Dimensions) {
        for (name, value) in [
            ("N", dims.n),
            ("NX", dims.nx),
            ("NU", dims.nu),
            ("NY", dims.ny),
            ("NYN", dims.nyn),
        ] {
            if value == 0 {
                self.error(
                    Diagnostic::error(codes::E0001, format!("{} must be positive", name))
                        .with_subject(format!("dims.{}", name.to_lowercase())),
                );
            }
        }
    }

    fn check_flags(&mut self, flags: &FeatureFlags) {
        let lm = flags.levenberg_marquardt;
        if !lm.is_finite() || lm < 0.0 {
            self.error(
                Diagnostic::error(
                    codes::E0004,
                    format!("Levenberg-Marquardt factor must be finite and >= 0, got {}", lm),
                )
                .with_subject("flags.levenbergMarquardt"),
            );
        }
        if flags.use_arrival_cost && flags.initial_state_fixed {
            self.error(
                Diagnostic::error(
                    codes::E0003,
                    "arrival cost requires a free initial state",
                )
                .with_subject("flags.useArrivalCost")
                .with_hint("set initialStateFixed to false for moving-horizon estimation"),
            );
        }
        if flags.lifted_gradient_update && flags.sensitivity_mode != SensitivityMode::Inexact {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagLevel::Warning,
                    "lifted gradient update has no effect unless sensitivityMode is inexact",
                )
                .with_code(codes::E0003)
                .with_subject("flags.liftedGradientUpdate"),
            );
        }
    }

    fn matrix(&mut self, rows: &Rows, nrows: usize, ncols: usize, subject: &str) -> Option<DMatrix<f64>> {
        let ragged = rows.iter().any(|r| r.len() != ncols);
        if rows.len() != nrows || ragged {
            let found_cols = rows.first().map_or(0, Vec::len);
            self.error(
                Diagnostic::error(
                    codes::E0100,
                    format!(
                        "expected a {}x{} matrix, found {} rows{}",
                        nrows,
                        ncols,
                        rows.len(),
                        if ragged {
                            " of unequal length".to_string()
                        } else {
                            format!(" of {} columns", found_cols)
                        }
                    ),
                )
                .with_subject(subject),
            );
            return None;
        }
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            self.error(
                Diagnostic::error(codes::E0100, "matrix entries must be finite")
                    .with_subject(subject),
            );
            return None;
        }
        Some(DMatrix::from_fn(nrows, ncols, |r, c| rows[r][c]))
    }

    fn vector(&mut self, values: &[f64], len: usize, subject: &str) -> Option<DVector<f64>> {
        if values.len() != len {
            self.error(
                Diagnostic::error(
                    codes::E0100,
                    format!("expected {} entries, found {}", len, values.len()),
                )
                .with_subject(subject),
            );
            return None;
        }
        Some(DVector::from_column_slice(values))
    }

    fn bound_side(
        &mut self,
        side: Option<&Vec<f64>>,
        len: usize,
        default: f64,
        subject: String,
    ) -> Vec<f64> {
        match side {
            None => vec![default; len],
            Some(values) if values.len() == len => values.clone(),
            Some(values) => {
                self.error(
                    Diagnostic::error(
                        codes::E0101,
                        format!("expected {} bound values, found {}", len, values.len()),
                    )
                    .with_subject(subject),
                );
                vec![default; len]
            }
        }
    }

    fn node_bounds(&mut self, pair: Option<&BoundPair>, len: usize, subject: &str) -> (Vec<f64>, Vec<f64>) {
        let Some(pair) = pair else {
            return (vec![-INFTY; len], vec![INFTY; len]);
        };
        let lb = self.bound_side(pair.lower.as_ref(), len, -INFTY, format!("{}.lower", subject));
        let ub = self.bound_side(pair.upper.as_ref(), len, INFTY, format!("{}.upper", subject));
        if lb.iter().zip(&ub).any(|(l, u)| l > u) {
            self.error(
                Diagnostic::error(codes::E0101, "lower bound exceeds upper bound")
                    .with_subject(subject.to_string()),
            );
        }
        (lb, ub)
    }

    fn stack_box_bounds(&mut self, config: &ProblemConfig) -> BoundValues {
        let Dimensions { n, nx, nu, .. } = config.dims;
        let bounds = &config.bounds;

        for &node in bounds.u.keys() {
            if node >= n {
                self.error(
                    Diagnostic::error(
                        codes::E0101,
                        format!("control bound on node {} outside 0..{}", node, n),
                    )
                    .with_subject(format!("bounds.u[{}]", node)),
                );
            }
        }
        for &node in bounds.x.keys() {
            if node > n {
                self.error(
                    Diagnostic::error(
                        codes::E0101,
                        format!("state bound on node {} outside 1..={}", node, n),
                    )
                    .with_subject(format!("bounds.x[{}]", node)),
                );
            } else if node == 0 {
                self.diagnostics.push(
                    Diagnostic::new(DiagLevel::Warning, "state bounds on node 0 are ignored")
                        .with_code(codes::E0101)
                        .with_subject("bounds.x[0]")
                        .with_hint("node 0 is fixed by the state feedback or the arrival cost"),
                );
            }
        }

        let mut lower = Vec::with_capacity(n * (nu + nx));
        let mut upper = Vec::with_capacity(n * (nu + nx));
        for node in 0..n {
            let (lb, ub) = self.node_bounds(bounds.u.get(&node), nu, &format!("bounds.u[{}]", node));
            lower.extend(lb);
            upper.extend(ub);
        }
        for node in 1..=n {
            let (lb, ub) = self.node_bounds(bounds.x.get(&node), nx, &format!("bounds.x[{}]", node));
            lower.extend(lb);
            upper.extend(ub);
        }
        BoundValues {
            lower: DVector::from_vec(lower),
            upper: DVector::from_vec(upper),
        }
    }

    fn path_constraint(
        &mut self,
        spec: &crate::config::PathConstraintSpec,
        dims: &Dimensions,
    ) -> Option<PathConstraint> {
        if !is_c_identifier(&spec.name) {
            self.error(
                Diagnostic::error(
                    codes::E0002,
                    format!("'{}' is not a valid C identifier", spec.name),
                )
                .with_subject("pathConstraint.name"),
            );
            return None;
        }
        if spec.dim == 0 {
            return None;
        }
        let n = dims.n;
        let stack = |values: &[f64]| -> Option<DVector<f64>> {
            if values.len() == spec.dim {
                Some(DVector::from_fn(n * spec.dim, |i, _| values[i % spec.dim]))
            } else if values.len() == n * spec.dim {
                Some(DVector::from_column_slice(values))
            } else {
                None
            }
        };
        let (Some(lower), Some(upper)) = (stack(&spec.lower), stack(&spec.upper)) else {
            self.error(
                Diagnostic::error(
                    codes::E0202,
                    format!(
                        "path bounds need {} or {} values, found {} lower and {} upper",
                        spec.dim,
                        n * spec.dim,
                        spec.lower.len(),
                        spec.upper.len()
                    ),
                )
                .with_subject("pathConstraint"),
            );
            return None;
        };
        if lower.iter().zip(upper.iter()).any(|(l, u)| l > u) {
            self.error(
                Diagnostic::error(codes::E0101, "lower bound exceeds upper bound")
                    .with_subject("pathConstraint"),
            );
        }
        let mut jacobian = |rows: &Option<Rows>, cols: usize, what: &str| -> Option<DMatrix<f64>> {
            let rows = rows.as_ref()?;
            let m = self.matrix(rows, spec.dim, cols, &format!("pathConstraint.{}", what));
            if m.is_none() {
                if let Some(last) = self.diagnostics.last_mut() {
                    last.code = Some(codes::E0202);
                }
            }
            m
        };
        let jac_x = jacobian(&spec.jacobian_x, dims.nx, "jacobianX");
        let jac_u = jacobian(&spec.jacobian_u, dims.nu, "jacobianU");
        Some(PathConstraint {
            name: spec.name.clone(),
            dim: spec.dim,
            lower,
            upper,
            jac_x,
            jac_u,
        })
    }

    fn point_constraints(&mut self, config: &ProblemConfig) -> BTreeMap<usize, PointConstraint> {
        let Dimensions { n, nx, nu, .. } = config.dims;
        let mut out = BTreeMap::new();
        for (&node, spec) in &config.point_constraints {
            let subject = format!("pointConstraints[{}]", node);
            if node > n {
                self.error(
                    Diagnostic::error(
                        codes::E0200,
                        format!("node {} is outside the horizon 0..={}", node, n),
                    )
                    .with_subject(subject),
                );
                continue;
            }
            if !is_c_identifier(&spec.name) {
                self.error(
                    Diagnostic::error(
                        codes::E0002,
                        format!("'{}' is not a valid C identifier", spec.name),
                    )
                    .with_subject(subject),
                );
                continue;
            }
            // Interior nodes output [h, dh/dx, dh/du]; the terminal node has no control.
            let per_row = if node < n { 1 + nx + nu } else { 1 + nx };
            if spec.output_width % per_row != 0 {
                self.error(
                    Diagnostic::error(
                        codes::E0201,
                        format!(
                            "output width {} is not a multiple of {}",
                            spec.output_width, per_row
                        ),
                    )
                    .with_subject(subject),
                );
                continue;
            }
            let dim = spec.output_width / per_row;
            if dim == 0 {
                continue;
            }
            let (lower, upper) = (
                self.bound_side(Some(&spec.lower), dim, -INFTY, format!("{}.lower", subject)),
                self.bound_side(Some(&spec.upper), dim, INFTY, format!("{}.upper", subject)),
            );
            if lower.iter().zip(&upper).any(|(l, u)| l > u) {
                self.error(
                    Diagnostic::error(codes::E0101, "lower bound exceeds upper bound")
                        .with_subject(subject),
                );
            }
            out.insert(
                node,
                PointConstraint {
                    name: spec.name.clone(),
                    width: spec.output_width,
                    dim,
                    lower: DVector::from_vec(lower),
                    upper: DVector::from_vec(upper),
                },
            );
        }
        out
    }
}

/// Interleave path bounds and point bounds per node, terminal point last.
fn stack_affine_bounds(
    n: usize,
    path: Option<&PathConstraint>,
    points: &BTreeMap<usize, PointConstraint>,
) -> BoundValues {
    let mut lower = Vec::new();
    let mut upper = Vec::new();
    for node in 0..=n {
        if let Some(p) = path.filter(|_| node < n) {
            let rows = node * p.dim..(node + 1) * p.dim;
            lower.extend(p.lower.as_slice()[rows.clone()].iter().copied());
            upper.extend(p.upper.as_slice()[rows].iter().copied());
        }
        if let Some(pc) = points.get(&node) {
            lower.extend(pc.lower.iter().copied());
            upper.extend(pc.upper.iter().copied());
        }
    }
    BoundValues {
        lower: DVector::from_vec(lower),
        upper: DVector::from_vec(upper),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ObjectiveSpec, PathConstraintSpec, PointConstraintSpec};

    /// NX=2, NU=1, N=3, NY=3, NYN=2, every weighting block derivable.
    pub(crate) fn base_config() -> ProblemConfig {
        ProblemConfig {
            module_name: "rti".to_string(),
            dims: Dimensions {
                n: 3,
                nx: 2,
                nu: 1,
                ny: 3,
                nyn: 2,
                nod: 0,
            },
            flags: FeatureFlags::default(),
            objective: ObjectiveSpec {
                weight: WeightSpec::Given(vec![
                    vec![2.0, 0.0, 0.0],
                    vec![0.0, 1.0, 0.0],
                    vec![0.0, 0.0, 0.5],
                ]),
                terminal_weight: WeightSpec::Given(vec![vec![4.0, 0.0], vec![0.0, 4.0]]),
                jacobian_x: Some(vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]]),
                jacobian_u: Some(vec![vec![0.0], vec![0.0], vec![1.0]]),
                terminal_jacobian_x: Some(vec![vec![1.0, 0.0], vec![0.0, 1.0]]),
                cross_term: true,
                linear_terms: LinearTermSpec::None,
            },
            bounds: Default::default(),
            path_constraint: None,
            point_constraints: BTreeMap::new(),
        }
    }

    fn codes_of(diags: &[Diagnostic]) -> Vec<&'static str> {
        diags
            .iter()
            .filter(|d| d.is_error())
            .filter_map(|d| d.code.map(|c| c.0))
            .collect()
    }

    #[test]
    fn base_config_validates() {
        let result = validate(&base_config());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let p = result.problem.unwrap();
        assert_eq!(p.num_qp_vars(), 9);
        assert_eq!(p.box_bounds.len(), 9);
        assert_eq!(p.dim_htot(), 0);
        assert_eq!(p.con_dim, vec![0, 0, 0, 0]);
        assert!(p.box_bounds.lower.iter().all(|&v| v == -INFTY));
    }

    #[test]
    fn free_initial_state_counts_extra_node() {
        let mut cfg = base_config();
        cfg.flags.initial_state_fixed = false;
        let p = validate(&cfg).problem.unwrap();
        assert_eq!(p.num_qp_vars(), 11);
        assert!(p.estimates_initial_state());
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut cfg = base_config();
        cfg.dims.nx = 0;
        let result = validate(&cfg);
        assert!(result.problem.is_none());
        assert_eq!(codes_of(&result.diagnostics), vec!["E0001"]);
    }

    #[test]
    fn arrival_cost_with_fixed_initial_state_rejected() {
        let mut cfg = base_config();
        cfg.flags.use_arrival_cost = true;
        let result = validate(&cfg);
        assert!(result.problem.is_none());
        assert_eq!(codes_of(&result.diagnostics), vec!["E0003"]);
    }

    #[test]
    fn negative_levenberg_marquardt_rejected() {
        let mut cfg = base_config();
        cfg.flags.levenberg_marquardt = -1.0;
        assert_eq!(codes_of(&validate(&cfg).diagnostics), vec!["E0004"]);
    }

    #[test]
    fn given_weight_with_variable_weighting_rejected() {
        let mut cfg = base_config();
        cfg.flags.variable_weighting = true;
        assert_eq!(codes_of(&validate(&cfg).diagnostics), vec!["E0102"]);
    }

    #[test]
    fn misshapen_jacobian_rejected() {
        let mut cfg = base_config();
        cfg.objective.jacobian_x = Some(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let result = validate(&cfg);
        assert_eq!(codes_of(&result.diagnostics), vec!["E0100"]);
        assert_eq!(
            result.diagnostics[0].subject.as_deref(),
            Some("objective.jacobianX")
        );
    }

    #[test]
    fn box_bounds_stack_controls_then_states() {
        let mut cfg = base_config();
        cfg.bounds.u.insert(
            1,
            BoundPair {
                lower: Some(vec![-1.0]),
                upper: Some(vec![1.0]),
            },
        );
        cfg.bounds.x.insert(
            3,
            BoundPair {
                lower: None,
                upper: Some(vec![5.0, 6.0]),
            },
        );
        let p = validate(&cfg).problem.unwrap();
        let lb = p.box_bounds.lower.as_slice();
        let ub = p.box_bounds.upper.as_slice();
        assert_eq!(lb[1], -1.0);
        assert_eq!(ub[1], 1.0);
        assert_eq!(lb[0], -INFTY);
        // states of node 3 occupy the last NX slots
        assert_eq!(&ub[7..9], &[5.0, 6.0]);
        assert_eq!(lb[7], -INFTY);
    }

    #[test]
    fn state_bound_on_node_zero_warns() {
        let mut cfg = base_config();
        cfg.bounds.x.insert(
            0,
            BoundPair {
                lower: Some(vec![0.0, 0.0]),
                upper: None,
            },
        );
        let result = validate(&cfg);
        assert!(result.problem.is_some());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].level, DiagLevel::Warning);
    }

    #[test]
    fn bound_length_mismatch_rejected() {
        let mut cfg = base_config();
        cfg.bounds.u.insert(
            0,
            BoundPair {
                lower: Some(vec![0.0, 1.0]),
                upper: None,
            },
        );
        assert_eq!(codes_of(&validate(&cfg).diagnostics), vec!["E0101"]);
    }

    #[test]
    fn point_constraint_dimension_derived_from_width() {
        let mut cfg = base_config();
        // (1 + NX + NU) * 2 = 8
        cfg.point_constraints.insert(
            1,
            PointConstraintSpec {
                name: "pc1".to_string(),
                output_width: 8,
                lower: vec![0.0, 0.0],
                upper: vec![1.0, 1.0],
            },
        );
        // terminal: (1 + NX) * 1 = 3
        cfg.point_constraints.insert(
            3,
            PointConstraintSpec {
                name: "pcN".to_string(),
                output_width: 3,
                lower: vec![-2.0],
                upper: vec![2.0],
            },
        );
        let p = validate(&cfg).problem.unwrap();
        assert_eq!(p.points[&1].dim, 2);
        assert_eq!(p.points[&3].dim, 1);
        assert_eq!(p.con_dim, vec![0, 2, 0, 1]);
        assert_eq!(p.dim_htot(), 3);
        assert_eq!(p.affine_offset(3), 2);
        assert_eq!(p.affine_bounds.lower.as_slice(), &[0.0, 0.0, -2.0]);
    }

    #[test]
    fn indivisible_point_constraint_width_rejected() {
        let mut cfg = base_config();
        cfg.point_constraints.insert(
            0,
            PointConstraintSpec {
                name: "pc0".to_string(),
                output_width: 7,
                lower: vec![],
                upper: vec![],
            },
        );
        let result = validate(&cfg);
        assert!(result.problem.is_none());
        assert_eq!(codes_of(&result.diagnostics), vec!["E0201"]);
    }

    #[test]
    fn point_constraint_beyond_horizon_rejected() {
        let mut cfg = base_config();
        cfg.point_constraints.insert(
            4,
            PointConstraintSpec {
                name: "pc4".to_string(),
                output_width: 3,
                lower: vec![0.0],
                upper: vec![1.0],
            },
        );
        assert_eq!(codes_of(&validate(&cfg).diagnostics), vec!["E0200"]);
    }

    #[test]
    fn zero_width_point_constraint_skipped() {
        let mut cfg = base_config();
        cfg.point_constraints.insert(
            2,
            PointConstraintSpec {
                name: "empty".to_string(),
                output_width: 0,
                lower: vec![],
                upper: vec![],
            },
        );
        let result = validate(&cfg);
        assert!(result.diagnostics.is_empty());
        assert!(result.problem.unwrap().points.is_empty());
    }

    #[test]
    fn path_bounds_interleave_with_points() {
        let mut cfg = base_config();
        cfg.path_constraint = Some(PathConstraintSpec {
            name: "pac".to_string(),
            dim: 1,
            lower: vec![-1.0],
            upper: vec![1.0],
            jacobian_x: None,
            jacobian_u: None,
        });
        cfg.point_constraints.insert(
            1,
            PointConstraintSpec {
                name: "pc1".to_string(),
                output_width: 4,
                lower: vec![-9.0],
                upper: vec![9.0],
            },
        );
        let p = validate(&cfg).problem.unwrap();
        assert_eq!(p.con_dim, vec![1, 2, 1, 0]);
        assert_eq!(
            p.affine_bounds.lower.as_slice(),
            &[-1.0, -1.0, -9.0, -1.0]
        );
        assert_eq!(p.path.as_ref().unwrap().output_width(2, 1), 4);
    }

    #[test]
    fn path_bounds_of_wrong_length_rejected() {
        let mut cfg = base_config();
        cfg.path_constraint = Some(PathConstraintSpec {
            name: "pac".to_string(),
            dim: 2,
            lower: vec![0.0; 3],
            upper: vec![1.0; 2],
            jacobian_x: None,
            jacobian_u: None,
        });
        assert_eq!(codes_of(&validate(&cfg).diagnostics), vec!["E0202"]);
    }

    #[test]
    fn adjoint_modes() {
        let mut cfg = base_config();
        cfg.flags.sensitivity_mode = SensitivityMode::Backward;
        assert!(validate(&cfg).problem.unwrap().adjoint());
        cfg.flags.sensitivity_mode = SensitivityMode::Inexact;
        assert!(!validate(&cfg).problem.unwrap().adjoint());
        cfg.flags.lifted_gradient_update = true;
        assert!(validate(&cfg).problem.unwrap().adjoint());
    }

    #[test]
    fn identifiers() {
        assert!(is_c_identifier("rti"));
        assert!(is_c_identifier("_pc_1"));
        assert!(!is_c_identifier("1pc"));
        assert!(!is_c_identifier("pc-1"));
        assert!(!is_c_identifier(""));
    }
}
