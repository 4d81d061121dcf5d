//! Routine IR – structured statements of the generated solver.
//!
//! A `Routine` is an ordered list of statements over *windows*: strided
//! rectangular views into arrays. Assemblers build routines once; codegen
//! renders them to C and the reference evaluator executes them.
//!
//! Addressing is flat and row-major, the way the emitted C sees memory:
//! element `(r, c)` of a window lives at `offset + r * stride + c` of its
//! base array, so row slices, sub-blocks and reshapes of vectors are all
//! windows without copies.

use std::fmt;

use nalgebra::DMatrix;

use crate::storage::{ArrayId, ElemKind, NamedArray, StorageClass};

// ── Index expressions ──────────────────────────────────────────────────────

/// Affine index `coeff * var + constant`. `var` is a loop index or an index
/// parameter of the enclosing routine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Affine {
    pub var: Option<(String, usize)>,
    pub constant: usize,
}

impl Affine {
    pub fn lit(constant: usize) -> Self {
        Affine {
            var: None,
            constant,
        }
    }

    pub fn var(name: &str) -> Self {
        Affine {
            var: Some((name.to_string(), 1)),
            constant: 0,
        }
    }

    /// Multiply the whole expression by `k`.
    pub fn scaled(&self, k: usize) -> Self {
        Affine {
            var: self.var.as_ref().map(|(v, c)| (v.clone(), c * k)),
            constant: self.constant * k,
        }
    }

    /// Add a constant.
    pub fn plus(&self, c: usize) -> Self {
        Affine {
            var: self.var.clone(),
            constant: self.constant + c,
        }
    }

    pub fn is_const(&self) -> bool {
        self.var.as_ref().map_or(true, |(_, c)| *c == 0)
    }

    /// Evaluate with the variable bound to `value`.
    pub fn eval_with(&self, value: usize) -> usize {
        match &self.var {
            Some((_, c)) => c * value + self.constant,
            None => self.constant,
        }
    }

    pub fn var_name(&self) -> Option<&str> {
        self.var.as_ref().map(|(v, _)| v.as_str())
    }
}

impl fmt::Display for Affine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.var {
            Some((v, c)) if *c != 0 => {
                if *c == 1 {
                    write!(f, "{}", v)?;
                } else {
                    write!(f, "{} * {}", v, c)?;
                }
                if self.constant != 0 {
                    write!(f, " + {}", self.constant)?;
                }
                Ok(())
            }
            _ => write!(f, "{}", self.constant),
        }
    }
}

// ── Windows ────────────────────────────────────────────────────────────────

/// What a window points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    /// A module-level array (VARIABLE, WORKSPACE or CONSTANT).
    Global(ArrayId),
    /// The n-th parameter of the enclosing routine.
    Param(usize),
    /// The n-th local array of the enclosing routine.
    Local(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub base: Base,
    pub offset: Affine,
    /// Stored shape (before transposition).
    pub rows: usize,
    pub cols: usize,
    /// Distance between consecutive stored rows.
    pub stride: usize,
    pub transposed: bool,
}

impl Window {
    /// Contiguous `rows x cols` window.
    pub fn dense(base: Base, offset: Affine, rows: usize, cols: usize) -> Self {
        Window {
            base,
            offset,
            rows,
            cols,
            stride: cols,
            transposed: false,
        }
    }

    /// Contiguous column vector of `len` elements.
    pub fn vector(base: Base, offset: Affine, len: usize) -> Self {
        Window::dense(base, offset, len, 1)
    }

    pub fn t(mut self) -> Self {
        self.transposed = !self.transposed;
        self
    }

    /// Logical (rows, cols) as read by expressions.
    pub fn shape(&self) -> (usize, usize) {
        if self.transposed {
            (self.cols, self.rows)
        } else {
            (self.rows, self.cols)
        }
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of base elements spanned from `offset`.
    pub fn extent(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            0
        } else {
            (self.rows - 1) * self.stride + self.cols
        }
    }

    /// Flat position (relative to `offset`) of logical element `(r, c)`.
    pub fn position(&self, r: usize, c: usize) -> usize {
        let (sr, sc) = if self.transposed { (c, r) } else { (r, c) };
        sr * self.stride + sc
    }

    /// Index expression of logical element `(r, c)`.
    pub fn element(&self, r: usize, c: usize) -> Affine {
        self.offset.plus(self.position(r, c))
    }
}

// ── Expressions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Read(Window),
    /// Generation-time numeric content, folded into the emitted code.
    Const(DMatrix<f64>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    /// Element-wise absolute value.
    Abs(Box<Expr>),
}

impl Expr {
    pub fn read(w: Window) -> Self {
        Expr::Read(w)
    }

    pub fn scalar(v: f64) -> Self {
        Expr::Const(DMatrix::from_element(1, 1, v))
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Expr::Add(Box::new(a), Box::new(b))
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Expr::Sub(Box::new(a), Box::new(b))
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Expr::Mul(Box::new(a), Box::new(b))
    }

    pub fn abs(a: Expr) -> Self {
        Expr::Abs(Box::new(a))
    }

    /// Transposed expression; products swap their operands.
    pub fn t(self) -> Self {
        match self {
            Expr::Read(w) => Expr::Read(w.t()),
            Expr::Const(m) => Expr::Const(m.transpose()),
            Expr::Add(a, b) => Expr::add(a.t(), b.t()),
            Expr::Sub(a, b) => Expr::sub(a.t(), b.t()),
            Expr::Mul(a, b) => Expr::mul(b.t(), a.t()),
            Expr::Abs(a) => Expr::abs(a.t()),
        }
    }

    /// Logical shape, or `None` if operand shapes are inconsistent.
    pub fn shape(&self) -> Option<(usize, usize)> {
        match self {
            Expr::Read(w) => Some(w.shape()),
            Expr::Const(m) => Some(m.shape()),
            Expr::Add(a, b) | Expr::Sub(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                (sa == sb).then_some(sa)
            }
            Expr::Mul(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                (sa.1 == sb.0).then_some((sa.0, sb.1))
            }
            Expr::Abs(a) => a.shape(),
        }
    }

    /// Visit every window read by this expression.
    pub fn windows<'a>(&'a self, out: &mut Vec<&'a Window>) {
        match self {
            Expr::Read(w) => out.push(w),
            Expr::Const(_) => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.windows(out);
                b.windows(out);
            }
            Expr::Abs(a) => a.windows(out),
        }
    }
}

// ── Statements ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
        }
    }
}

/// Functions the generated code calls but does not define.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum External {
    /// Integrates the whole horizon and its sensitivities. `() -> status`.
    ModelSimulation,
    /// One-node forward simulation. `(state, node) -> status`.
    Integrate,
    /// Stage residual and Jacobians. `(in, out)`.
    StageCost,
    /// Terminal residual and Jacobian. `(in, out)`.
    TerminalCost,
    /// User path/point constraint function. `(in, out)`.
    Constraint(String),
    /// QP solver backend. `() -> status`.
    QpSolve,
    /// Arrival-cost recursion. `(reset, WL, xAC, SAC) -> status`.
    ArrivalCostBackend,
}

impl External {
    /// C symbol of the external function.
    pub fn symbol(&self, module: &str) -> String {
        match self {
            External::ModelSimulation => format!("{}_modelSimulation", module),
            External::Integrate => format!("{}_integrate", module),
            External::StageCost => format!("{}_evaluateStageCost", module),
            External::TerminalCost => format!("{}_evaluateTerminalCost", module),
            External::Constraint(name) => name.clone(),
            External::QpSolve => format!("{}_solve", module),
            External::ArrivalCostBackend => format!("{}_updateArrivalCostBackend", module),
        }
    }

    /// Parameter signature: `true` for array pointers, `false` for ints.
    pub fn signature(&self) -> &'static [(&'static str, bool)] {
        match self {
            External::ModelSimulation | External::QpSolve => &[],
            External::Integrate => &[("state", true), ("node", false)],
            External::StageCost | External::TerminalCost | External::Constraint(_) => {
                &[("in", true), ("out", true)]
            }
            External::ArrivalCostBackend => &[
                ("reset", false),
                ("WL", true),
                ("xAC", true),
                ("SAC", true),
            ],
        }
    }

    pub fn returns_status(&self) -> bool {
        matches!(
            self,
            External::ModelSimulation
                | External::Integrate
                | External::QpSolve
                | External::ArrivalCostBackend
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Routine(String),
    External(External),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Pointer to the first element of the window.
    Ref(Window),
    /// Integer argument.
    Index(Affine),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        dst: Window,
        op: AssignOp,
        value: Expr,
    },
    /// Zero a whole module-level array.
    Clear(ArrayId),
    For {
        var: String,
        start: usize,
        end: usize,
        body: Vec<Stmt>,
    },
    Call {
        callee: Callee,
        args: Vec<Arg>,
        /// Scalar receiving the callee's status code.
        status: Option<Window>,
    },
    Comment(String),
}

impl Stmt {
    pub fn assign(dst: Window, value: Expr) -> Self {
        Stmt::Assign {
            dst,
            op: AssignOp::Set,
            value,
        }
    }

    pub fn add_assign(dst: Window, value: Expr) -> Self {
        Stmt::Assign {
            dst,
            op: AssignOp::Add,
            value,
        }
    }

    pub fn sub_assign(dst: Window, value: Expr) -> Self {
        Stmt::Assign {
            dst,
            op: AssignOp::Sub,
            value,
        }
    }

    pub fn call(name: &str, args: Vec<Arg>) -> Self {
        Stmt::Call {
            callee: Callee::Routine(name.to_string()),
            args,
            status: None,
        }
    }

    pub fn call_external(external: External, args: Vec<Arg>, status: Option<Window>) -> Self {
        Stmt::Call {
            callee: Callee::External(external),
            args,
            status,
        }
    }

    pub fn for_loop(var: &str, start: usize, end: usize, body: Vec<Stmt>) -> Self {
        Stmt::For {
            var: var.to_string(),
            start,
            end,
            body,
        }
    }
}

// ── Routines ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// Pointer to `rows x cols` contiguous reals.
    Array { rows: usize, cols: usize },
    /// Integer index; valid values are `0..bound`.
    Index { bound: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub name: String,
    pub doc: Option<String>,
    pub params: Vec<Param>,
    pub locals: Vec<NamedArray>,
    /// Local holding the return value.
    pub ret: Option<usize>,
    pub body: Vec<Stmt>,
}

impl Routine {
    pub fn new(name: &str) -> Self {
        Routine {
            name: name.to_string(),
            doc: None,
            params: Vec::new(),
            locals: Vec::new(),
            ret: None,
            body: Vec::new(),
        }
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    /// Add an array parameter and return a window over all of it.
    pub fn array_param(&mut self, name: &str, rows: usize, cols: usize) -> Window {
        self.params.push(Param {
            name: name.to_string(),
            kind: ParamKind::Array { rows, cols },
        });
        Window::dense(Base::Param(self.params.len() - 1), Affine::lit(0), rows, cols)
    }

    /// Add an integer parameter; use `Affine::var(name)` to address with it.
    pub fn index_param(&mut self, name: &str, bound: usize) {
        self.params.push(Param {
            name: name.to_string(),
            kind: ParamKind::Index { bound },
        });
    }

    /// Add a function-scope array and return a window over all of it.
    pub fn local(&mut self, name: &str, rows: usize, cols: usize, kind: ElemKind) -> Window {
        self.locals.push(NamedArray {
            name: name.to_string(),
            rows,
            cols,
            kind,
            class: StorageClass::Local,
            given: None,
            doc: None,
        });
        Window::dense(Base::Local(self.locals.len() - 1), Affine::lit(0), rows, cols)
    }

    /// Declare a local scalar as the return value.
    pub fn returns(&mut self, name: &str, kind: ElemKind) -> Window {
        let w = self.local(name, 1, 1, kind);
        self.ret = Some(self.locals.len() - 1);
        w
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.body.push(stmt);
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.body.push(Stmt::Comment(text.into()));
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Loop variables in first-use order.
    pub fn loop_vars(&self) -> Vec<&str> {
        fn walk<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a str>) {
            for s in stmts {
                if let Stmt::For { var, body, .. } = s {
                    if !out.contains(&var.as_str()) {
                        out.push(var);
                    }
                    walk(body, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.body, &mut out);
        out
    }

    /// Every routine or external this routine calls, in statement order.
    pub fn callees(&self) -> Vec<&Callee> {
        fn walk<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a Callee>) {
            for s in stmts {
                match s {
                    Stmt::Call { callee, .. } => out.push(callee),
                    Stmt::For { body, .. } => walk(body, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.body, &mut out);
        out
    }
}

/// Routines produced by one assembler, plus its share of `initialize`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    pub routines: Vec<Routine>,
    pub init: Vec<Stmt>,
}

// ── Display ─────────────────────────────────────────────────────────────────

/// Resolves base names for display; the program supplies global names.
pub struct RoutineDisplay<'a> {
    pub routine: &'a Routine,
    pub global_name: &'a dyn Fn(ArrayId) -> String,
}

impl RoutineDisplay<'_> {
    fn base_name(&self, base: Base) -> String {
        match base {
            Base::Global(id) => (self.global_name)(id),
            Base::Param(i) => self.routine.params[i].name.clone(),
            Base::Local(i) => self.routine.locals[i].name.clone(),
        }
    }

    fn fmt_window(&self, w: &Window) -> String {
        let t = if w.transposed { "^T" } else { "" };
        if w.stride == w.cols {
            format!(
                "{}[{}; {}x{}]{}",
                self.base_name(w.base),
                w.offset,
                w.rows,
                w.cols,
                t
            )
        } else {
            format!(
                "{}[{}; {}x{}/{}]{}",
                self.base_name(w.base),
                w.offset,
                w.rows,
                w.cols,
                w.stride,
                t
            )
        }
    }

    fn fmt_expr(&self, e: &Expr) -> String {
        match e {
            Expr::Read(w) => self.fmt_window(w),
            Expr::Const(m) => {
                if m.len() == 1 {
                    format!("{:?}", m[(0, 0)])
                } else {
                    format!("const<{}x{}>", m.nrows(), m.ncols())
                }
            }
            Expr::Add(a, b) => format!("({} + {})", self.fmt_expr(a), self.fmt_expr(b)),
            Expr::Sub(a, b) => format!("({} - {})", self.fmt_expr(a), self.fmt_expr(b)),
            Expr::Mul(a, b) => format!("{} * {}", self.fmt_expr(a), self.fmt_expr(b)),
            Expr::Abs(a) => format!("|{}|", self.fmt_expr(a)),
        }
    }

    fn fmt_stmts(&self, f: &mut fmt::Formatter<'_>, stmts: &[Stmt], indent: &str) -> fmt::Result {
        for s in stmts {
            match s {
                Stmt::Assign { dst, op, value } => writeln!(
                    f,
                    "{}{} {} {}",
                    indent,
                    self.fmt_window(dst),
                    op.symbol(),
                    self.fmt_expr(value)
                )?,
                Stmt::Clear(id) => writeln!(f, "{}clear {}", indent, (self.global_name)(*id))?,
                Stmt::For {
                    var,
                    start,
                    end,
                    body,
                } => {
                    writeln!(f, "{}for {} in {}..{}", indent, var, start, end)?;
                    self.fmt_stmts(f, body, &format!("{}  ", indent))?;
                }
                Stmt::Call {
                    callee,
                    args,
                    status,
                } => {
                    let name = match callee {
                        Callee::Routine(n) => n.clone(),
                        Callee::External(e) => format!("extern {:?}", e),
                    };
                    let args: Vec<String> = args
                        .iter()
                        .map(|a| match a {
                            Arg::Ref(w) => format!("&{}", self.fmt_window(w)),
                            Arg::Index(i) => i.to_string(),
                        })
                        .collect();
                    match status {
                        Some(w) => writeln!(
                            f,
                            "{}{} = call {}({})",
                            indent,
                            self.fmt_window(w),
                            name,
                            args.join(", ")
                        )?,
                        None => writeln!(f, "{}call {}({})", indent, name, args.join(", "))?,
                    }
                }
                Stmt::Comment(text) => writeln!(f, "{}// {}", indent, text)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for RoutineDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.routine;
        let params: Vec<String> = r
            .params
            .iter()
            .map(|p| match &p.kind {
                ParamKind::Array { rows, cols } => format!("{}: {}x{}", p.name, rows, cols),
                ParamKind::Index { bound } => format!("{}: idx<{}", p.name, bound),
            })
            .collect();
        let ret = match r.ret {
            Some(i) => format!(" -> {}", r.locals[i].name),
            None => String::new(),
        };
        writeln!(f, "routine {}({}){}", r.name, params.join(", "), ret)?;
        for l in &r.locals {
            writeln!(f, "  local {}: {}x{} {:?}", l.name, l.rows, l.cols, l.kind)?;
        }
        self.fmt_stmts(f, &r.body, "  ")
    }
}
