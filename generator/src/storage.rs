// storage.rs — Array/Storage Planner
//
// Decides the storage class and shape of every quantity of the generated
// solver before any routine is assembled. Also evaluates the Gauss-Newton
// Hessian blocks whose inputs are all known now, so that given blocks carry
// their numeric content and computed blocks own the QP Hessian storage.
//
// Preconditions: a validated `Problem`.
// Postconditions: every array is declared exactly once in `table`; given
//   blocks never own storage; `qpQ`/`qpR`/`qpS`/`qpQf` always exist.
// Failure modes: duplicate declaration, CONSTANT content or bound vector
//   not matching its declared shape (E0300).
// Side effects: none.

use std::fmt;

use nalgebra::DMatrix;

use crate::diag::{codes, Diagnostic};
use crate::ir::{Affine, Base, Window};
use crate::validate::{LinearTerms, Problem};

// ── Array model ─────────────────────────────────────────────────────────────

/// Index into an `ArrayTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    /// Supplied or read by the control loop every cycle.
    Variable,
    /// Survives across calls, owned by the solver.
    Workspace,
    /// Live for one call of its owning routine.
    Local,
    /// Known now; emitted as a file-scope constant.
    Constant,
}

impl StorageClass {
    pub fn label(self) -> &'static str {
        match self {
            StorageClass::Variable => "VARIABLE",
            StorageClass::Workspace => "WORKSPACE",
            StorageClass::Local => "LOCAL",
            StorageClass::Constant => "CONSTANT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    Real,
    Int,
    Bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedArray {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub kind: ElemKind,
    pub class: StorageClass,
    /// Numeric content of CONSTANT arrays.
    pub given: Option<DMatrix<f64>>,
    pub doc: Option<String>,
}

impl NamedArray {
    pub fn new(name: &str, rows: usize, cols: usize, class: StorageClass) -> Self {
        NamedArray {
            name: name.to_string(),
            rows,
            cols,
            kind: ElemKind::Real,
            class,
            given: None,
            doc: None,
        }
    }

    /// CONSTANT array shaped after its content.
    pub fn constant(name: &str, value: DMatrix<f64>) -> Self {
        NamedArray {
            rows: value.nrows(),
            cols: value.ncols(),
            given: Some(value),
            ..NamedArray::new(name, 0, 0, StorageClass::Constant)
        }
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All module-level arrays in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayTable {
    arrays: Vec<NamedArray>,
}

impl ArrayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an array. Names are unique; CONSTANT content must match the
    /// declared shape.
    pub fn declare(&mut self, array: NamedArray) -> Result<ArrayId, Diagnostic> {
        if self.find(&array.name).is_some() {
            return Err(
                Diagnostic::error(codes::E0300, "array declared twice").with_subject(array.name)
            );
        }
        if let Some(value) = &array.given {
            if value.shape() != (array.rows, array.cols) {
                return Err(Diagnostic::error(
                    codes::E0300,
                    format!(
                        "constant content is {}x{}, declared {}x{}",
                        value.nrows(),
                        value.ncols(),
                        array.rows,
                        array.cols
                    ),
                )
                .with_subject(array.name));
            }
        }
        self.arrays.push(array);
        Ok(ArrayId(self.arrays.len() as u32 - 1))
    }

    pub fn get(&self, id: ArrayId) -> &NamedArray {
        &self.arrays[id.0 as usize]
    }

    pub fn find(&self, name: &str) -> Option<ArrayId> {
        self.arrays
            .iter()
            .position(|a| a.name == name)
            .map(|i| ArrayId(i as u32))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArrayId, &NamedArray)> {
        self.arrays
            .iter()
            .enumerate()
            .map(|(i, a)| (ArrayId(i as u32), a))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn contains(&self, id: ArrayId) -> bool {
        (id.0 as usize) < self.arrays.len()
    }

    /// Fail unless the array holds exactly `expected` elements.
    pub fn expect_len(&self, id: ArrayId, expected: usize) -> Result<(), Diagnostic> {
        let a = self.get(id);
        if a.len() == expected {
            Ok(())
        } else {
            Err(Diagnostic::error(
                codes::E0300,
                format!("expected {} elements, found {}x{}", expected, a.rows, a.cols),
            )
            .with_subject(a.name.clone()))
        }
    }

    // ── Windows ──

    /// The whole array with its declared shape.
    pub fn whole(&self, id: ArrayId) -> Window {
        let a = self.get(id);
        Window::dense(Base::Global(id), Affine::lit(0), a.rows, a.cols)
    }

    /// `len` consecutive elements starting at flat `offset`, as a column.
    pub fn flat(&self, id: ArrayId, offset: Affine, len: usize) -> Window {
        Window::vector(Base::Global(id), offset, len)
    }

    /// Contiguous `rows x cols` view starting at flat `offset`.
    pub fn dense(&self, id: ArrayId, offset: Affine, rows: usize, cols: usize) -> Window {
        Window::dense(Base::Global(id), offset, rows, cols)
    }

    /// `rows` full rows starting at row `first`.
    pub fn rows(&self, id: ArrayId, first: Affine, rows: usize) -> Window {
        let cols = self.get(id).cols;
        Window::dense(Base::Global(id), first.scaled(cols), rows, cols)
    }

    /// Sub-block at `(row, col)` keeping the array's row stride.
    pub fn block(&self, id: ArrayId, row: Affine, col: usize, rows: usize, cols: usize) -> Window {
        let stride = self.get(id).cols;
        Window {
            base: Base::Global(id),
            offset: row.scaled(stride).plus(col),
            rows,
            cols,
            stride,
            transposed: false,
        }
    }
}

// ── Gauss-Newton blocks ─────────────────────────────────────────────────────

/// A Hessian/gradient block: numeric now, or an array written at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Given(DMatrix<f64>),
    Computed(ArrayId),
}

impl Block {
    pub fn given(&self) -> Option<&DMatrix<f64>> {
        match self {
            Block::Given(m) => Some(m),
            Block::Computed(_) => None,
        }
    }

    pub fn computed(&self) -> Option<ArrayId> {
        match self {
            Block::Given(_) => None,
            Block::Computed(id) => Some(*id),
        }
    }

    pub fn is_given(&self) -> bool {
        matches!(self, Block::Given(_))
    }
}

/// `Q1 = Fx'SFx + λI`, `Q2 = Fx'S`, `R1 = Fu'SFu + λI`, `R2 = Fu'S`,
/// `S1 = Fx'SFu`, `QN1 = FxN'SN FxN + λI`, `QN2 = FxN'SN`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussNewtonBlocks {
    pub q1: Block,
    pub q2: Block,
    pub r1: Block,
    pub r2: Block,
    pub s1: Block,
    pub qn1: Block,
    pub qn2: Block,
}

/// Given values of the blocks whose inputs are all known now.
#[derive(Debug, Clone, PartialEq)]
pub struct GivenBlocks {
    pub q: Option<(DMatrix<f64>, DMatrix<f64>)>,
    pub r: Option<(DMatrix<f64>, DMatrix<f64>)>,
    pub s1: Option<DMatrix<f64>>,
    pub qn: Option<(DMatrix<f64>, DMatrix<f64>)>,
}

/// Evaluate every block whose inputs are known, with the Levenberg-Marquardt
/// term folded into the diagonal blocks.
pub fn given_blocks(problem: &Problem) -> GivenBlocks {
    let lambda = problem.flags.levenberg_marquardt;
    let damp = |mut m: DMatrix<f64>| {
        // λ = 0 keeps the block bit-identical.
        if lambda != 0.0 {
            for i in 0..m.nrows().min(m.ncols()) {
                m[(i, i)] += lambda;
            }
        }
        m
    };
    let s = problem.weight.as_ref();
    let q = match (s, problem.jac_x.as_ref()) {
        (Some(s), Some(fx)) => {
            let q2 = fx.transpose() * s;
            let q1 = damp(&q2 * fx);
            Some((q1, q2))
        }
        _ => None,
    };
    let r = match (s, problem.jac_u.as_ref()) {
        (Some(s), Some(fu)) => {
            let r2 = fu.transpose() * s;
            let r1 = damp(&r2 * fu);
            Some((r1, r2))
        }
        _ => None,
    };
    let s1 = if !problem.cross_term {
        Some(DMatrix::zeros(problem.dims.nx, problem.dims.nu))
    } else {
        match (s, problem.jac_x.as_ref(), problem.jac_u.as_ref()) {
            (Some(s), Some(fx), Some(fu)) => Some(fx.transpose() * s * fu),
            _ => None,
        }
    };
    let qn = match (problem.terminal_weight.as_ref(), problem.jac_x_end.as_ref()) {
        (Some(sn), Some(fxn)) => {
            let qn2 = fxn.transpose() * sn;
            let qn1 = damp(&qn2 * fxn);
            Some((qn1, qn2))
        }
        _ => None,
    };
    GivenBlocks { q, r, s1, qn }
}

// ── Plan ────────────────────────────────────────────────────────────────────

/// Storage of the linear objective terms.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearStorage {
    None,
    Given {
        x: DMatrix<f64>,
        u: DMatrix<f64>,
    },
    /// One vector shared by every node.
    Shared { wlx: ArrayId, wlu: ArrayId },
    /// `Wlx` over nodes 0..=N, `Wlu` over 0..N.
    PerNode { wlx: ArrayId, wlu: ArrayId },
}

/// Where the stage/terminal evaluation output keeps each quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalLayout {
    /// Start of `Fx` (NY x NX, row-major) in the stage output, if evaluated.
    pub stage_fx: Option<usize>,
    pub stage_fu: Option<usize>,
    pub stage_width: usize,
    pub terminal_fx: Option<usize>,
    pub terminal_width: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanArrays {
    // variables
    pub x: ArrayId,
    pub u: ArrayId,
    pub od: Option<ArrayId>,
    pub y: ArrayId,
    pub y_n: ArrayId,
    pub w: Option<ArrayId>,
    pub w_n: Option<ArrayId>,
    pub x0: Option<ArrayId>,
    pub x_ac: Option<ArrayId>,
    pub s_ac: Option<ArrayId>,
    pub sigma_n: Option<ArrayId>,
    pub wl: Option<ArrayId>,
    pub lb_values: ArrayId,
    pub ub_values: ArrayId,
    pub lba_values: Option<ArrayId>,
    pub uba_values: Option<ArrayId>,
    // workspace
    pub d: ArrayId,
    pub state: ArrayId,
    pub obj_value_in: ArrayId,
    pub obj_value_out: ArrayId,
    pub dy: ArrayId,
    pub dy_n: ArrayId,
    pub qp_q: ArrayId,
    pub qp_r: ArrayId,
    pub qp_s: ArrayId,
    pub qp_qf: ArrayId,
    pub qpq: ArrayId,
    pub qpqf: ArrayId,
    pub qpr: ArrayId,
    pub qpx: ArrayId,
    pub qpu: ArrayId,
    pub qp_lb: ArrayId,
    pub qp_ub: ArrayId,
    pub qp_lba: ArrayId,
    pub qp_uba: ArrayId,
    pub qp_lambda: ArrayId,
    pub qp_mu: ArrayId,
    pub dx_ac: Option<ArrayId>,
    pub con_value_in: Option<ArrayId>,
    pub con_value_out: Option<ArrayId>,
    pub pac_ev_h: Option<ArrayId>,
    pub pac_ev_hx: Option<ArrayId>,
    pub pac_ev_hu: Option<ArrayId>,
    pub poc_ev_h: Option<ArrayId>,
    pub poc_ev_hx: Option<ArrayId>,
    pub poc_ev_hu: Option<ArrayId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoragePlan {
    pub table: ArrayTable,
    pub arrays: PlanArrays,
    pub blocks: GaussNewtonBlocks,
    pub linear: LinearStorage,
    pub layout: EvalLayout,
}

#[derive(Debug)]
pub struct PlanResult {
    pub plan: Option<StoragePlan>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn plan_storage(problem: &Problem) -> PlanResult {
    match Planner::new(problem).run() {
        Ok(plan) => PlanResult {
            plan: Some(plan),
            diagnostics: Vec::new(),
        },
        Err(d) => PlanResult {
            plan: None,
            diagnostics: vec![d],
        },
    }
}

struct Planner<'a> {
    problem: &'a Problem,
    table: ArrayTable,
}

impl<'a> Planner<'a> {
    fn new(problem: &'a Problem) -> Self {
        Planner {
            problem,
            table: ArrayTable::new(),
        }
    }

    fn var(&mut self, name: &str, rows: usize, cols: usize, doc: &str) -> Result<ArrayId, Diagnostic> {
        self.table
            .declare(NamedArray::new(name, rows, cols, StorageClass::Variable).with_doc(doc))
    }

    fn work(&mut self, name: &str, rows: usize, cols: usize, doc: &str) -> Result<ArrayId, Diagnostic> {
        self.table
            .declare(NamedArray::new(name, rows, cols, StorageClass::Workspace).with_doc(doc))
    }

    /// CONSTANT when hardcoded, otherwise a VARIABLE filled in `initialize`.
    fn bound_values(&mut self, name: &str, values: &nalgebra::DVector<f64>, doc: &str) -> Result<ArrayId, Diagnostic> {
        if self.problem.flags.hardcode_constraints {
            let m = DMatrix::from_column_slice(values.len(), 1, values.as_slice());
            self.table.declare(NamedArray::constant(name, m).with_doc(doc))
        } else {
            self.var(name, values.len(), 1, doc)
        }
    }

    fn run(mut self) -> Result<StoragePlan, Diagnostic> {
        let p = self.problem;
        let crate::config::Dimensions {
            n,
            nx,
            nu,
            ny,
            nyn,
            nod,
        } = p.dims;
        let free_x0 = p.estimates_initial_state();
        let dim_htot = p.dim_htot();

        // ── VARIABLE ──
        let x = self.var("x", n + 1, nx, "state trajectory")?;
        let u = self.var("u", n, nu, "control trajectory")?;
        let od = if nod > 0 {
            Some(self.var("od", n + 1, nod, "online data")?)
        } else {
            None
        };
        let y = self.var("y", n, ny, "stage references")?;
        let y_n = self.var("yN", nyn, 1, "terminal reference")?;
        let w = match &p.weight {
            Some(_) => None,
            None if p.flags.variable_weighting => {
                Some(self.var("W", n * ny, ny, "stage weighting, one block per node")?)
            }
            None => Some(self.var("W", ny, ny, "stage weighting")?),
        };
        let w_n = match &p.terminal_weight {
            Some(_) => None,
            None => Some(self.var("WN", nyn, nyn, "terminal weighting")?),
        };
        let linear = match &p.linear_terms {
            LinearTerms::None => LinearStorage::None,
            LinearTerms::Given { x, u } => LinearStorage::Given {
                x: DMatrix::from_column_slice(nx, 1, x.as_slice()),
                u: DMatrix::from_column_slice(nu, 1, u.as_slice()),
            },
            LinearTerms::Runtime if p.flags.variable_weighting || p.adjoint() => {
                LinearStorage::PerNode {
                    wlx: self.var("Wlx", (n + 1) * nx, 1, "state linear terms per node")?,
                    wlu: self.var("Wlu", n * nu, 1, "control linear terms per node")?,
                }
            }
            LinearTerms::Runtime => LinearStorage::Shared {
                wlx: self.var("Wlx", nx, 1, "state linear term")?,
                wlu: self.var("Wlu", nu, 1, "control linear term")?,
            },
        };
        let x0 = if free_x0 {
            None
        } else {
            Some(self.var("x0", nx, 1, "current state feedback")?)
        };
        let (x_ac, s_ac, sigma_n) = if free_x0 {
            (
                Some(self.var("xAC", nx, 1, "arrival-cost reference")?),
                Some(self.var("SAC", nx, nx, "arrival-cost weighting")?),
                Some(self.var("sigmaN", nx, nx, "arrival-cost covariance")?),
            )
        } else {
            (None, None, None)
        };
        let wl = if p.flags.use_arrival_cost {
            Some(self.var("WL", nx, nx, "arrival-cost weighting factor")?)
        } else {
            None
        };

        // ── Bound values (VARIABLE or CONSTANT) ──
        let lb_values = self.bound_values("lbValues", &p.box_bounds.lower, "box lower bounds")?;
        let ub_values = self.bound_values("ubValues", &p.box_bounds.upper, "box upper bounds")?;
        self.table.expect_len(lb_values, p.dim_box())?;
        self.table.expect_len(ub_values, p.dim_box())?;
        let (lba_values, uba_values) = if dim_htot > 0 {
            let lba = self.bound_values("lbAValues", &p.affine_bounds.lower, "affine lower bounds")?;
            let uba = self.bound_values("ubAValues", &p.affine_bounds.upper, "affine upper bounds")?;
            self.table.expect_len(lba, dim_htot)?;
            self.table.expect_len(uba, dim_htot)?;
            (Some(lba), Some(uba))
        } else {
            (None, None)
        };

        // ── WORKSPACE ──
        let layout = eval_layout(p);
        let d = self.work("d", n * nx, 1, "integration defects")?;
        let state = self.work("state", 1, nx + nu + nod, "single-node integration buffer")?;
        let obj_value_in = self.work("objValueIn", 1, nx + nu + nod, "objective evaluation input")?;
        let obj_value_out = self.work(
            "objValueOut",
            1,
            layout.stage_width.max(layout.terminal_width),
            "objective evaluation output",
        )?;
        let dy = self.work("Dy", n * ny, 1, "stage residuals")?;
        let dy_n = self.work("DyN", nyn, 1, "terminal residual")?;

        let given = given_blocks(p);
        let qp_q = self.work("qpQ", n * nx, nx, "QP Hessian, state blocks (Q1)")?;
        let qp_r = self.work("qpR", n * nu, nu, "QP Hessian, control blocks (R1)")?;
        let qp_s = self.work("qpS", n * nx, nu, "QP Hessian, cross blocks (S1)")?;
        let qp_qf = self.work("qpQf", nx, nx, "QP Hessian, terminal block (QN1)")?;
        let (q1, q2) = match given.q {
            Some((q1, q2)) => (Block::Given(q1), Block::Given(q2)),
            None => (
                Block::Computed(qp_q),
                Block::Computed(self.work("Q2", n * nx, ny, "gradient weighting Fx'S")?),
            ),
        };
        let (r1, r2) = match given.r {
            Some((r1, r2)) => (Block::Given(r1), Block::Given(r2)),
            None => (
                Block::Computed(qp_r),
                Block::Computed(self.work("R2", n * nu, ny, "gradient weighting Fu'S")?),
            ),
        };
        let s1 = match given.s1 {
            Some(s1) => Block::Given(s1),
            None => Block::Computed(qp_s),
        };
        let (qn1, qn2) = match given.qn {
            Some((qn1, qn2)) => (Block::Given(qn1), Block::Given(qn2)),
            None => (
                Block::Computed(qp_qf),
                Block::Computed(self.work("QN2", nx, nyn, "terminal gradient weighting FxN'SN")?),
            ),
        };

        let qpq = self.work("qpq", n * nx, 1, "QP gradient, states")?;
        let qpqf = self.work("qpqf", nx, 1, "QP gradient, terminal state")?;
        let qpr = self.work("qpr", n * nu, 1, "QP gradient, controls")?;
        let qpx = self.work("qpx", (n + 1) * nx, 1, "QP primal solution, states")?;
        let qpu = self.work("qpu", n * nu, 1, "QP primal solution, controls")?;
        let qp_lb = self.work("qpLb", n * (nu + nx), 1, "QP box lower bounds")?;
        let qp_ub = self.work("qpUb", n * (nu + nx), 1, "QP box upper bounds")?;
        let qp_lba = self.work("qpLbA", dim_htot.max(1), 1, "QP affine lower bounds")?;
        let qp_uba = self.work("qpUbA", dim_htot.max(1), 1, "QP affine upper bounds")?;
        let qp_lambda = self.work("qpLambda", n * nx, 1, "QP multipliers, dynamics")?;
        let qp_mu = self.work(
            "qpMu",
            2 * n * (nx + nu) + 2 * dim_htot,
            1,
            "QP multipliers, inequalities",
        )?;
        let dx_ac = if free_x0 {
            Some(self.work("DxAC", nx, 1, "arrival-cost residual")?)
        } else {
            None
        };

        let (con_value_in, con_value_out) = if p.has_constraints() {
            let width = p
                .path
                .iter()
                .map(|pc| pc.output_width(nx, nu))
                .chain(p.points.values().map(|pc| pc.width))
                .max()
                .unwrap_or(0);
            (
                Some(self.work("conValueIn", 1, nx + nu + nod, "constraint evaluation input")?),
                Some(self.work("conValueOut", 1, width, "constraint evaluation output")?),
            )
        } else {
            (None, None)
        };

        let (pac_ev_h, pac_ev_hx, pac_ev_hu) = match &p.path {
            Some(pc) => {
                let rows = n * pc.dim;
                let h = self.work("pacEvH", rows, 1, "path constraint values")?;
                let hx = if pc.jac_x.is_none() {
                    Some(self.work("pacEvHx", rows, nx, "path constraint state Jacobians")?)
                } else {
                    None
                };
                let hu = if pc.jac_u.is_none() {
                    Some(self.work("pacEvHu", rows, nu, "path constraint control Jacobians")?)
                } else {
                    None
                };
                (Some(h), hx, hu)
            }
            None => (None, None, None),
        };

        let dim_poc = p.dim_poc();
        let (poc_ev_h, poc_ev_hx, poc_ev_hu) = if dim_poc > 0 {
            (
                Some(self.work("pocEvH", dim_poc, 1, "point constraint values")?),
                Some(self.work("pocEvHx", dim_poc, nx, "point constraint state Jacobians")?),
                Some(self.work("pocEvHu", dim_poc, nu, "point constraint control Jacobians")?),
            )
        } else {
            (None, None, None)
        };

        Ok(StoragePlan {
            table: self.table,
            arrays: PlanArrays {
                x,
                u,
                od,
                y,
                y_n,
                w,
                w_n,
                x0,
                x_ac,
                s_ac,
                sigma_n,
                wl,
                lb_values,
                ub_values,
                lba_values,
                uba_values,
                d,
                state,
                obj_value_in,
                obj_value_out,
                dy,
                dy_n,
                qp_q,
                qp_r,
                qp_s,
                qp_qf,
                qpq,
                qpqf,
                qpr,
                qpx,
                qpu,
                qp_lb,
                qp_ub,
                qp_lba,
                qp_uba,
                qp_lambda,
                qp_mu,
                dx_ac,
                con_value_in,
                con_value_out,
                pac_ev_h,
                pac_ev_hx,
                pac_ev_hu,
                poc_ev_h,
                poc_ev_hx,
                poc_ev_hu,
            },
            blocks: GaussNewtonBlocks {
                q1,
                q2,
                r1,
                r2,
                s1,
                qn1,
                qn2,
            },
            linear,
            layout,
        })
    }
}

/// Stage output `[h, Fx?, Fu?]`, terminal output `[hN, FxN?]`; Jacobians
/// are only evaluated when not given.
pub fn eval_layout(problem: &Problem) -> EvalLayout {
    let crate::config::Dimensions { nx, nu, ny, nyn, .. } = problem.dims;
    let mut width = ny;
    let stage_fx = problem.jac_x.is_none().then(|| {
        let at = width;
        width += ny * nx;
        at
    });
    let stage_fu = problem.jac_u.is_none().then(|| {
        let at = width;
        width += ny * nu;
        at
    });
    let terminal_fx = problem.jac_x_end.is_none().then_some(nyn);
    EvalLayout {
        stage_fx,
        stage_fu,
        stage_width: width,
        terminal_fx,
        terminal_width: nyn + if terminal_fx.is_some() { nyn * nx } else { 0 },
    }
}

// ── Display (for `--emit plan`) ─────────────────────────────────────────────

impl fmt::Display for StoragePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for class in [
            StorageClass::Variable,
            StorageClass::Constant,
            StorageClass::Workspace,
        ] {
            writeln!(f, "{}", class.label())?;
            for (_, a) in self.table.iter().filter(|(_, a)| a.class == class) {
                write!(f, "  {:<12} {}x{}", a.name, a.rows, a.cols)?;
                if a.kind != ElemKind::Real {
                    write!(f, " {:?}", a.kind)?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "BLOCKS")?;
        let b = &self.blocks;
        for (name, block) in [
            ("Q1", &b.q1),
            ("Q2", &b.q2),
            ("R1", &b.r1),
            ("R2", &b.r2),
            ("S1", &b.s1),
            ("QN1", &b.qn1),
            ("QN2", &b.qn2),
        ] {
            match block {
                Block::Given(m) => writeln!(f, "  {:<4} given {}x{}", name, m.nrows(), m.ncols())?,
                Block::Computed(id) => {
                    writeln!(f, "  {:<4} computed in {}", name, self.table.get(*id).name)?
                }
            }
        }
        Ok(())
    }
}
