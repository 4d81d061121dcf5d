// codegen.rs — C code generation for assembled solver programs
//
// Renders a verified `Program` to a C header and source file. Every matrix
// statement is expanded element by element with generation-time constants
// folded and zero products dropped; explicit `for` loops appear only where
// the program has them.
//
// Preconditions: `program` passed verification (A1-A5), so every window is
//                in bounds and every assignment shape-consistent.
// Postconditions: returns `GeneratedCode`; output depends only on the program
//                 and the provenance string (byte-identical across runs).
// Failure modes: none.
// Side effects: none.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::ir::{Arg, AssignOp, Base, Callee, Expr, ParamKind, Routine, Stmt, Window};
use crate::program::Program;
use crate::storage::{ArrayId, ElemKind, StorageClass};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCode {
    /// File name the source includes, e.g. `rti_solver.h`.
    pub header_name: String,
    pub header: String,
    pub source: String,
}

impl GeneratedCode {
    /// Header followed by source, for printing to stdout.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.header, self.source)
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn codegen(program: &Program, provenance: &str) -> GeneratedCode {
    let mut ctx = CodegenCtx::new(program, provenance);
    ctx.emit_header();
    ctx.emit_source();
    ctx.build_result()
}

// ── Constant usage ──────────────────────────────────────────────────────────

/// CONSTANT arrays some statement still names after folding. Reads at a
/// fixed offset become literals; variable offsets and pointer arguments
/// need the array itself.
fn referenced_constants(program: &Program) -> HashSet<ArrayId> {
    fn note(program: &Program, w: &Window, folds: bool, out: &mut HashSet<ArrayId>) {
        if let Base::Global(id) = w.base {
            let a = program.table.get(id);
            if a.class == StorageClass::Constant
                && !(folds && a.given.is_some() && w.offset.is_const())
            {
                out.insert(id);
            }
        }
    }

    fn visit(program: &Program, stmts: &[Stmt], out: &mut HashSet<ArrayId>) {
        for s in stmts {
            match s {
                Stmt::Assign { dst, value, .. } => {
                    let mut reads = Vec::new();
                    value.windows(&mut reads);
                    note(program, dst, false, out);
                    for w in reads {
                        note(program, w, true, out);
                    }
                }
                Stmt::Call { args, status, .. } => {
                    for a in args {
                        if let Arg::Ref(w) = a {
                            note(program, w, false, out);
                        }
                    }
                    if let Some(w) = status {
                        note(program, w, false, out);
                    }
                }
                Stmt::For { body, .. } => visit(program, body, out),
                Stmt::Clear(id) => {
                    if program.table.get(*id).class == StorageClass::Constant {
                        out.insert(*id);
                    }
                }
                Stmt::Comment(_) => {}
            }
        }
    }
    let mut out = HashSet::new();
    for r in &program.routines {
        visit(program, &r.body, &mut out);
    }
    out
}

// ── Scalar values ───────────────────────────────────────────────────────────

/// One element of an expanded expression: a folded number or C text.
#[derive(Debug, Clone, PartialEq)]
enum Val {
    Num(f64),
    Code {
        text: String,
        /// Top-level `+`/`-`; needs parentheses inside a product.
        sum: bool,
    },
}

impl Val {
    fn atom(text: String) -> Val {
        Val::Code { text, sum: false }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Val::Num(v) if *v == 0.0)
    }

    fn term(&self) -> String {
        match self {
            Val::Num(v) => c_number(*v),
            Val::Code { text, .. } => text.clone(),
        }
    }

    fn factor(&self) -> String {
        match self {
            Val::Num(v) if *v < 0.0 => format!("({})", c_number(*v)),
            Val::Code { text, sum: true } => format!("({})", text),
            _ => self.term(),
        }
    }
}

fn add(a: Val, b: Val) -> Val {
    match (a, b) {
        (Val::Num(x), Val::Num(y)) => Val::Num(x + y),
        (a, b) if a.is_zero() => b,
        (a, b) if b.is_zero() => a,
        (a, Val::Num(y)) if y < 0.0 => Val::Code {
            text: format!("{} - {}", a.term(), c_number(-y)),
            sum: true,
        },
        (a, b) => Val::Code {
            text: format!("{} + {}", a.term(), b.term()),
            sum: true,
        },
    }
}

fn neg(a: Val) -> Val {
    match a {
        Val::Num(x) => Val::Num(-x),
        a => Val::Code {
            text: format!("-{}", a.factor()),
            sum: true,
        },
    }
}

fn sub(a: Val, b: Val) -> Val {
    match (a, b) {
        (Val::Num(x), Val::Num(y)) => Val::Num(x - y),
        (a, b) if b.is_zero() => a,
        (a, b) if a.is_zero() => neg(b),
        (a, Val::Num(y)) if y < 0.0 => add(a, Val::Num(-y)),
        (a, b) => Val::Code {
            text: format!("{} - {}", a.term(), b.factor()),
            sum: true,
        },
    }
}

fn mul(a: Val, b: Val) -> Val {
    match (a, b) {
        (a, b) if a.is_zero() || b.is_zero() => Val::Num(0.0),
        (Val::Num(x), Val::Num(y)) => Val::Num(x * y),
        (Val::Num(x), b) if x == 1.0 => b,
        (a, Val::Num(y)) if y == 1.0 => a,
        (Val::Num(x), b) if x == -1.0 => neg(b),
        (a, Val::Num(y)) if y == -1.0 => neg(a),
        (a, b) => Val::atom(format!("{} * {}", a.factor(), b.factor())),
    }
}

fn abs(a: Val) -> Val {
    match a {
        Val::Num(x) => Val::Num(x.abs()),
        a => Val::atom(format!("fabs({})", a.term())),
    }
}

/// Shortest round-trip representation; always carries a decimal point or
/// exponent so C reads it as a double.
fn c_number(v: f64) -> String {
    format!("{:?}", v)
}

fn c_type(kind: ElemKind) -> &'static str {
    match kind {
        ElemKind::Real => "real_t",
        ElemKind::Int | ElemKind::Bool => "int",
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct CodegenCtx<'a> {
    program: &'a Program,
    provenance: &'a str,
    header_name: String,
    header: String,
    out: String,
}

impl<'a> CodegenCtx<'a> {
    fn new(program: &'a Program, provenance: &'a str) -> Self {
        CodegenCtx {
            program,
            provenance,
            header_name: format!("{}_solver.h", program.module),
            header: String::with_capacity(4096),
            out: String::with_capacity(16384),
        }
    }

    fn build_result(self) -> GeneratedCode {
        GeneratedCode {
            header_name: self.header_name,
            header: self.header,
            source: self.out,
        }
    }

    fn module(&self) -> &str {
        &self.program.module
    }

    fn vars_instance(&self) -> String {
        format!("{}Vars", self.module())
    }

    fn work_instance(&self) -> String {
        format!("{}Work", self.module())
    }

    fn banner(&self) -> String {
        format!(
            "/* Generated by rtigen {} (Gauss-Newton RTI solver). Do not edit.\n * provenance: {}\n */\n",
            env!("CARGO_PKG_VERSION"),
            self.provenance
        )
    }

    // ── Header ──────────────────────────────────────────────────────────

    fn emit_header(&mut self) {
        let m = self.module().to_string();
        let guard = format!("{}_SOLVER_H", m.to_uppercase());
        let d = self.program.dims;
        let mut h = self.banner();

        let _ = writeln!(h, "#ifndef {}", guard);
        let _ = writeln!(h, "#define {}\n", guard);
        h.push_str("typedef double real_t;\n\n");

        let upper = m.to_uppercase();
        for (name, value) in [
            ("N", d.n),
            ("NX", d.nx),
            ("NU", d.nu),
            ("NY", d.ny),
            ("NYN", d.nyn),
            ("NOD", d.nod),
            ("QP_NV", self.program.num_qp_vars),
            ("QP_NCA", self.program.con_dim.iter().sum()),
        ] {
            let _ = writeln!(h, "#define {}_{} {}", upper, name, value);
        }
        let _ = writeln!(h, "#define {}_INFTY {}\n", upper, c_number(crate::validate::INFTY));

        for (class, ty, instance) in [
            (StorageClass::Variable, "Variables", self.vars_instance()),
            (StorageClass::Workspace, "Workspace", self.work_instance()),
        ] {
            let _ = writeln!(h, "typedef struct {}{}_\n{{", m, ty);
            for (_, a) in self.program.table.iter().filter(|(_, a)| a.class == class) {
                if let Some(doc) = &a.doc {
                    let _ = writeln!(h, "    /** {} ({} x {}) */", doc, a.rows, a.cols);
                }
                let _ = writeln!(h, "    {} {}[{}];", c_type(a.kind), a.name, a.len().max(1));
            }
            let _ = writeln!(h, "}} {}{};\n", m, ty);
            let _ = writeln!(h, "extern {}{} {};\n", m, ty, instance);
        }

        h.push_str("/* Functions supplied by the integrator, model and QP solver. */\n");
        for e in &self.program.externals {
            let params: Vec<String> = e
                .signature()
                .iter()
                .map(|(name, is_ptr)| {
                    if *is_ptr {
                        format!("real_t* const {}", name)
                    } else {
                        format!("int {}", name)
                    }
                })
                .collect();
            let ret = if e.returns_status() { "int" } else { "void" };
            let _ = writeln!(
                h,
                "{} {}({});",
                ret,
                e.symbol(&m),
                if params.is_empty() {
                    "void".to_string()
                } else {
                    params.join(", ")
                }
            );
        }
        h.push('\n');

        for r in &self.program.routines {
            if let Some(doc) = &r.doc {
                let _ = writeln!(h, "/** {} */", doc);
            }
            let _ = writeln!(h, "{};", self.signature(r));
        }
        let _ = writeln!(h, "\n#endif /* {} */", guard);
        self.header = h;
    }

    fn signature(&self, r: &Routine) -> String {
        let ret = match r.ret {
            Some(l) => c_type(r.locals[l].kind),
            None => "void",
        };
        let written = written_params(r);
        let params: Vec<String> = r
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| match p.kind {
                ParamKind::Array { .. } if written.contains(&i) => {
                    format!("real_t* const {}", p.name)
                }
                ParamKind::Array { .. } => format!("const real_t* const {}", p.name),
                ParamKind::Index { .. } => format!("int {}", p.name),
            })
            .collect();
        format!(
            "{} {}_{}({})",
            ret,
            self.module(),
            r.name,
            if params.is_empty() {
                "void".to_string()
            } else {
                params.join(", ")
            }
        )
    }

    // ── Source ──────────────────────────────────────────────────────────

    fn emit_source(&mut self) {
        let program = self.program;
        let m = self.module().to_string();
        let banner = self.banner();
        let (vars, work) = (self.vars_instance(), self.work_instance());
        self.out.push_str(&banner);
        let _ = writeln!(self.out, "#include \"{}\"\n", self.header_name);
        self.out.push_str("#include <math.h>\n#include <string.h>\n\n");
        let _ = writeln!(self.out, "{}Variables {};", m, vars);
        let _ = writeln!(self.out, "{}Workspace {};\n", m, work);

        let referenced = referenced_constants(program);
        let constants: Vec<_> = program
            .table
            .iter()
            .filter(|(id, a)| a.class == StorageClass::Constant && referenced.contains(id))
            .collect();
        for (_, a) in &constants {
            let values: Vec<String> = match &a.given {
                Some(g) => (0..a.rows)
                    .flat_map(|r| (0..a.cols).map(move |c| c_number(g[(r, c)])))
                    .collect(),
                None => vec![c_number(0.0); a.len()],
            };
            let _ = writeln!(
                self.out,
                "static const real_t {}_{}[{}] = {{ {} }};",
                m,
                a.name,
                a.len().max(1),
                values.join(", ")
            );
        }
        if !constants.is_empty() {
            self.out.push('\n');
        }

        for r in &program.routines {
            self.emit_routine(r);
        }
    }

    fn emit_routine(&mut self, r: &Routine) {
        if let Some(doc) = &r.doc {
            let _ = writeln!(self.out, "/** {} */", doc);
        }
        let signature = self.signature(r);
        let _ = writeln!(self.out, "{}\n{{", signature);
        for l in &r.locals {
            if l.len() == 1 {
                let _ = writeln!(self.out, "    {} {};", c_type(l.kind), l.name);
            } else {
                let _ = writeln!(self.out, "    {} {}[{}];", c_type(l.kind), l.name, l.len());
            }
        }
        for v in r.loop_vars() {
            let _ = writeln!(self.out, "    int {};", v);
        }
        if !r.locals.is_empty() || !r.loop_vars().is_empty() {
            self.out.push('\n');
        }
        self.emit_stmts(r, &r.body, "    ");
        if let Some(l) = r.ret {
            let _ = writeln!(self.out, "    return {};", r.locals[l].name);
        }
        self.out.push_str("}\n\n");
    }

    fn emit_stmts(&mut self, r: &Routine, stmts: &[Stmt], indent: &str) {
        for s in stmts {
            match s {
                Stmt::Assign { dst, op, value } => self.emit_assign(r, dst, *op, value, indent),
                Stmt::Clear(id) => {
                    let name = self.global(*id);
                    let _ = writeln!(self.out, "{}memset({}, 0, sizeof({}));", indent, name, name);
                }
                Stmt::For {
                    var,
                    start,
                    end,
                    body,
                } => {
                    if end <= start {
                        continue;
                    }
                    let _ = writeln!(
                        self.out,
                        "{}for ({} = {}; {} < {}; ++{})\n{}{{",
                        indent, var, start, var, end, var, indent
                    );
                    self.emit_stmts(r, body, &format!("{}    ", indent));
                    let _ = writeln!(self.out, "{}}}", indent);
                }
                Stmt::Call {
                    callee,
                    args,
                    status,
                } => {
                    let name = match callee {
                        Callee::Routine(n) => format!("{}_{}", self.module(), n),
                        Callee::External(e) => e.symbol(self.module()),
                    };
                    let args: Vec<String> = args
                        .iter()
                        .map(|a| match a {
                            Arg::Ref(w) => self.pointer(r, w),
                            Arg::Index(i) => i.to_string(),
                        })
                        .collect();
                    let call = format!("{}({})", name, args.join(", "));
                    match status {
                        Some(w) => {
                            let target = self.lvalue(r, w, 0, 0);
                            let _ = writeln!(self.out, "{}{} = {};", indent, target, call);
                        }
                        None => {
                            let _ = writeln!(self.out, "{}{};", indent, call);
                        }
                    }
                }
                Stmt::Comment(text) => {
                    let _ = writeln!(self.out, "{}/* {} */", indent, text);
                }
            }
        }
    }

    fn emit_assign(&mut self, r: &Routine, dst: &Window, op: AssignOp, value: &Expr, indent: &str) {
        let (rows, cols) = dst.shape();
        let int_dst = self.is_int(r, dst);
        let rhs = |v: &Val| match v {
            Val::Num(x) if int_dst => format!("{}", *x as i64),
            v => v.term(),
        };

        // A product reading its own destination is computed into a temporary.
        let mut reads = Vec::new();
        value.windows(&mut reads);
        let aliased = dst.len() > 1
            && contains_mul(value)
            && reads.iter().any(|w| w.base == dst.base);

        if aliased {
            let _ = writeln!(self.out, "{}{{", indent);
            let _ = writeln!(self.out, "{}    real_t tmp[{}];", indent, rows * cols);
            for i in 0..rows {
                for j in 0..cols {
                    let v = self.elem(r, value, i, j);
                    let _ = writeln!(self.out, "{}    tmp[{}] = {};", indent, i * cols + j, v.term());
                }
            }
            for i in 0..rows {
                for j in 0..cols {
                    let target = self.lvalue(r, dst, i, j);
                    let _ = writeln!(
                        self.out,
                        "{}    {} {} tmp[{}];",
                        indent,
                        target,
                        op.symbol(),
                        i * cols + j
                    );
                }
            }
            let _ = writeln!(self.out, "{}}}", indent);
            return;
        }

        for i in 0..rows {
            for j in 0..cols {
                let v = self.elem(r, value, i, j);
                if op != AssignOp::Set && v.is_zero() {
                    continue;
                }
                let target = self.lvalue(r, dst, i, j);
                let _ = writeln!(self.out, "{}{} {} {};", indent, target, op.symbol(), rhs(&v));
            }
        }
    }

    // ── Element access ──────────────────────────────────────────────────

    fn global(&self, id: ArrayId) -> String {
        let a = self.program.table.get(id);
        match a.class {
            StorageClass::Variable => format!("{}.{}", self.vars_instance(), a.name),
            StorageClass::Workspace => format!("{}.{}", self.work_instance(), a.name),
            StorageClass::Constant | StorageClass::Local => format!("{}_{}", self.module(), a.name),
        }
    }

    /// Base name and whether it is a scalar (a 1x1 local).
    fn base(&self, r: &Routine, base: Base) -> (String, bool) {
        match base {
            Base::Global(id) => (self.global(id), false),
            Base::Local(l) => (r.locals[l].name.clone(), r.locals[l].len() == 1),
            Base::Param(p) => (r.params[p].name.clone(), false),
        }
    }

    fn lvalue(&self, r: &Routine, w: &Window, i: usize, j: usize) -> String {
        let (name, scalar) = self.base(r, w.base);
        if scalar {
            name
        } else {
            format!("{}[{}]", name, w.element(i, j))
        }
    }

    fn pointer(&self, r: &Routine, w: &Window) -> String {
        let (name, scalar) = self.base(r, w.base);
        if scalar {
            format!("&{}", name)
        } else if w.offset.is_const() && w.offset.constant == 0 {
            name
        } else {
            format!("&{}[{}]", name, w.offset)
        }
    }

    fn read(&self, r: &Routine, w: &Window, i: usize, j: usize) -> Val {
        if let Base::Global(id) = w.base {
            let a = self.program.table.get(id);
            let at = w.element(i, j);
            if let (StorageClass::Constant, Some(g), true) = (a.class, &a.given, at.is_const()) {
                let k = at.constant;
                return Val::Num(g[(k / a.cols, k % a.cols)]);
            }
        }
        Val::atom(self.lvalue(r, w, i, j))
    }

    fn elem(&self, r: &Routine, e: &Expr, i: usize, j: usize) -> Val {
        match e {
            Expr::Read(w) => self.read(r, w, i, j),
            Expr::Const(m) => Val::Num(m[(i, j)]),
            Expr::Add(a, b) => add(self.elem(r, a, i, j), self.elem(r, b, i, j)),
            Expr::Sub(a, b) => sub(self.elem(r, a, i, j), self.elem(r, b, i, j)),
            Expr::Abs(a) => abs(self.elem(r, a, i, j)),
            Expr::Mul(a, b) => {
                let inner = a.shape().map_or(0, |(_, k)| k);
                (0..inner).fold(Val::Num(0.0), |acc, k| {
                    add(acc, mul(self.elem(r, a, i, k), self.elem(r, b, k, j)))
                })
            }
        }
    }

    fn is_int(&self, r: &Routine, w: &Window) -> bool {
        let kind = match w.base {
            Base::Global(id) => self.program.table.get(id).kind,
            Base::Local(l) => r.locals[l].kind,
            Base::Param(_) => ElemKind::Real,
        };
        kind != ElemKind::Real
    }
}

fn contains_mul(e: &Expr) -> bool {
    match e {
        Expr::Mul(..) => true,
        Expr::Read(_) | Expr::Const(_) => false,
        Expr::Add(a, b) | Expr::Sub(a, b) => contains_mul(a) || contains_mul(b),
        Expr::Abs(a) => contains_mul(a),
    }
}

/// Parameters the routine may write: assignment targets and anything passed
/// on by pointer.
fn written_params(r: &Routine) -> HashSet<usize> {
    fn walk(stmts: &[Stmt], out: &mut HashSet<usize>) {
        for s in stmts {
            match s {
                Stmt::Assign { dst, .. } => {
                    if let Base::Param(p) = dst.base {
                        out.insert(p);
                    }
                }
                Stmt::Call { args, status, .. } => {
                    for a in args {
                        if let Arg::Ref(w) = a {
                            if let Base::Param(p) = w.base {
                                out.insert(p);
                            }
                        }
                    }
                    if let Some(Window {
                        base: Base::Param(p),
                        ..
                    }) = status
                    {
                        out.insert(*p);
                    }
                }
                Stmt::For { body, .. } => walk(body, out),
                Stmt::Clear(_) | Stmt::Comment(_) => {}
            }
        }
    }
    let mut out = HashSet::new();
    walk(&r.body, &mut out);
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::assemble_constraints;
    use crate::objective::assemble_objective;
    use crate::program::assemble_program;
    use crate::rti::assemble_phases;
    use crate::storage::plan_storage;
    use crate::validate::tests::base_config;
    use crate::validate::validate;

    fn generate(cfg: &crate::config::ProblemConfig) -> GeneratedCode {
        let problem = validate(cfg).problem.unwrap();
        let plan = plan_storage(&problem).plan.unwrap();
        let program = assemble_program(
            &problem,
            &plan,
            assemble_objective(&problem, &plan),
            assemble_constraints(&problem, &plan),
            assemble_phases(&problem, &plan),
        );
        codegen(&program, "00ff")
    }

    #[test]
    fn value_folding() {
        let x = Val::atom("x".to_string());
        assert_eq!(mul(Val::Num(0.0), x.clone()), Val::Num(0.0));
        assert_eq!(mul(Val::Num(1.0), x.clone()), x);
        assert_eq!(add(Val::Num(0.0), x.clone()), x);
        assert_eq!(add(x.clone(), Val::Num(-2.0)).term(), "x - 2.0");
        assert_eq!(sub(Val::Num(0.0), x.clone()).term(), "-x");
        let s = add(x.clone(), Val::atom("y".to_string()));
        assert_eq!(mul(Val::Num(2.0), s).term(), "2.0 * (x + y)");
        assert_eq!(abs(Val::Num(-3.0)), Val::Num(3.0));
    }

    #[test]
    fn numbers_keep_a_decimal_point() {
        assert_eq!(c_number(4.0), "4.0");
        assert_eq!(c_number(0.5), "0.5");
        assert_eq!(c_number(-1.0), "-1.0");
    }

    #[test]
    fn header_declares_structs_and_prototypes() {
        let code = generate(&base_config());
        assert_eq!(code.header_name, "rti_solver.h");
        assert!(code.header.contains("typedef double real_t;"));
        assert!(code.header.contains("} rtiVariables;"));
        assert!(code.header.contains("} rtiWorkspace;"));
        assert!(code.header.contains("    real_t x[8];"));
        assert!(code.header.contains("#define RTI_QP_NV 9"));
        assert!(code.header.contains("int rti_modelSimulation(void);"));
        assert!(code.header.contains("void rti_evaluateStageCost(real_t* const in, real_t* const out);"));
        assert!(code.header.contains("int rti_preparation(void);"));
        assert!(code.header.contains("real_t rti_getKKT(void);"));
        assert!(code.header.contains("void rti_shiftStates(const real_t* const xEnd);"));
        assert!(!code.header.contains("updateArrivalCost"));
    }

    #[test]
    fn source_carries_provenance_and_routines() {
        let code = generate(&base_config());
        assert!(code.source.contains(" * provenance: 00ff\n"));
        assert!(code.source.contains("#include \"rti_solver.h\""));
        assert!(code.source.contains("int rti_feedback(void)\n{"));
        assert!(code.source.contains("retVal = rti_solve();"));
        assert!(code.source.contains("for (runObj = 0; runObj < 3; ++runObj)"));
    }

    #[test]
    fn given_terminal_gradient_is_folded() {
        // QN2 = FxN'SN = 4I: zero products vanish from the expansion.
        let code = generate(&base_config());
        assert!(code.source.contains("rtiWork.qpqf[0] = 4.0 * rtiWork.DyN[0];"));
        assert!(code.source.contains("rtiWork.qpqf[1] = 4.0 * rtiWork.DyN[1];"));
    }

    #[test]
    fn hardcoded_box_bounds_fold_into_literals() {
        let mut cfg = base_config();
        cfg.flags.hardcode_constraints = true;
        let code = generate(&cfg);
        assert!(code.source.contains("rtiWork.qpLb[0] = "));
        // Every read is at a fixed offset: no array left to emit.
        assert!(!code.source.contains("rti_lbValues"));
        assert!(!code.source.contains("rti_ubValues"));
        assert!(!code.header.contains(" lbValues["));
    }

    #[test]
    fn constants_passed_by_pointer_stay_emitted() {
        let mut cfg = base_config();
        cfg.flags.hardcode_constraints = true;
        cfg.path_constraint = Some(crate::config::PathConstraintSpec {
            name: "pac".to_string(),
            dim: 2,
            lower: vec![-1.0, -2.0],
            upper: vec![1.0, 2.0],
            jacobian_x: None,
            jacobian_u: None,
        });
        let code = generate(&cfg);
        assert!(code
            .source
            .contains("static const real_t rti_lbAValues[6] = { -1.0, -2.0, -1.0, -2.0, -1.0, -2.0 };"));
        assert!(code.source.contains("rti_setStagePac(2, 1, &rti_lbAValues[2], &rti_ubAValues[2]);"));
        assert!(!code.source.contains("static const real_t rti_lbValues"));
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(generate(&base_config()), generate(&base_config()));
    }
}
