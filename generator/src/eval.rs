// eval.rs — Reference evaluator for assembled programs
//
// Executes routines of a `Program` over in-memory arrays, with the external
// functions (integrator, model, QP solver) supplied by a `Host`. Matrix
// statements evaluate their whole right-hand side before storing, the same
// result the emitted C computes.
//
// Preconditions: `program` passed verification.
// Postconditions: globals keep their values across `run` calls, like the
//                 C structs; locals are fresh per call.
// Failure modes: unknown names, argument mismatches and out-of-range
//                accesses return `EvalError`.
// Side effects: none outside the machine and the host.

use std::collections::HashMap;
use std::fmt;

use nalgebra::DMatrix;

use crate::ir::{Affine, Arg, AssignOp, Base, Callee, Expr, External, ParamKind, Routine, Stmt, Window};
use crate::program::Program;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    UnknownArray(String),
    UnknownRoutine(String),
    Length {
        name: String,
        expected: usize,
        found: usize,
    },
    Arity(String),
    UnboundIndex(String),
    OutOfBounds {
        routine: String,
        index: usize,
        len: usize,
    },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnknownArray(n) => write!(f, "unknown array '{}'", n),
            EvalError::UnknownRoutine(n) => write!(f, "unknown routine '{}'", n),
            EvalError::Length {
                name,
                expected,
                found,
            } => write!(f, "'{}' expects {} values, got {}", name, expected, found),
            EvalError::Arity(n) => write!(f, "argument mismatch calling '{}'", n),
            EvalError::UnboundIndex(v) => write!(f, "index '{}' is not bound", v),
            EvalError::OutOfBounds {
                routine,
                index,
                len,
            } => write!(f, "{}: index {} outside array of {}", routine, index, len),
        }
    }
}

impl std::error::Error for EvalError {}

// ── Host interface ──────────────────────────────────────────────────────────

/// Argument handed to an external function.
#[derive(Debug, Clone, PartialEq)]
pub enum HostArg {
    /// Copy of the referenced window; written back after the call.
    Array(Vec<f64>),
    Index(usize),
}

/// Module-level arrays, by name.
#[derive(Debug, Clone)]
pub struct Memory {
    names: HashMap<String, usize>,
    bufs: Vec<Vec<f64>>,
}

impl Memory {
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.names.get(name).map(|&i| self.bufs[i].as_slice())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        match self.names.get(name) {
            Some(&i) => Some(self.bufs[i].as_mut_slice()),
            None => None,
        }
    }
}

/// Supplies the functions the generated code calls but does not define.
/// The QP solver reads and writes the workspace directly, as it does in C.
pub trait Host {
    fn call(&mut self, external: &External, args: &mut [HostArg], memory: &mut Memory) -> i64;
}

/// Argument of a top-level `run`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Array(Vec<f64>),
    Index(usize),
}

// ── Machine ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buf {
    Global(usize),
    Pool(usize),
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Array { buf: Buf, offset: usize },
    Index(usize),
}

struct Frame<'r> {
    routine: &'r Routine,
    locals: Vec<Buf>,
    params: Vec<Binding>,
    /// Loop variables and index parameters in scope.
    scope: Vec<(String, usize)>,
}

pub struct Machine<'p> {
    program: &'p Program,
    memory: Memory,
    pool: Vec<Vec<f64>>,
}

impl<'p> Machine<'p> {
    /// All globals zero, CONSTANT arrays filled with their values.
    pub fn new(program: &'p Program) -> Self {
        let mut names = HashMap::new();
        let mut bufs = Vec::new();
        for (id, a) in program.table.iter() {
            names.insert(a.name.clone(), id.0 as usize);
            let values = match &a.given {
                Some(g) => (0..a.rows)
                    .flat_map(|r| (0..a.cols).map(move |c| g[(r, c)]))
                    .collect(),
                None => vec![0.0; a.len()],
            };
            bufs.push(values);
        }
        Machine {
            program,
            memory: Memory { names, bufs },
            pool: Vec::new(),
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Overwrite a global array; `values` are row-major.
    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<(), EvalError> {
        let buf = self
            .memory
            .get_mut(name)
            .ok_or_else(|| EvalError::UnknownArray(name.to_string()))?;
        if buf.len() != values.len() {
            return Err(EvalError::Length {
                name: name.to_string(),
                expected: buf.len(),
                found: values.len(),
            });
        }
        buf.copy_from_slice(values);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&[f64], EvalError> {
        self.memory
            .get(name)
            .ok_or_else(|| EvalError::UnknownArray(name.to_string()))
    }

    /// Run a routine; returns its return value (0 when it has none).
    pub fn run(&mut self, routine: &str, args: &[CallArg], host: &mut dyn Host) -> Result<f64, EvalError> {
        let program = self.program;
        let r = program
            .routine(routine)
            .ok_or_else(|| EvalError::UnknownRoutine(routine.to_string()))?;
        if r.params.len() != args.len() {
            return Err(EvalError::Arity(routine.to_string()));
        }
        let base = self.pool.len();
        let mut bindings = Vec::new();
        for (p, a) in r.params.iter().zip(args) {
            bindings.push(match (&p.kind, a) {
                (ParamKind::Array { rows, cols }, CallArg::Array(v)) if v.len() == rows * cols => {
                    self.pool.push(v.clone());
                    Binding::Array {
                        buf: Buf::Pool(self.pool.len() - 1),
                        offset: 0,
                    }
                }
                (ParamKind::Index { .. }, CallArg::Index(i)) => Binding::Index(*i),
                _ => {
                    self.pool.truncate(base);
                    return Err(EvalError::Arity(routine.to_string()));
                }
            });
        }
        let result = self.invoke(r, bindings, host);
        self.pool.truncate(base);
        result
    }

    fn invoke(&mut self, r: &'p Routine, params: Vec<Binding>, host: &mut dyn Host) -> Result<f64, EvalError> {
        let base = self.pool.len();
        let locals = r
            .locals
            .iter()
            .map(|l| {
                self.pool.push(vec![0.0; l.len()]);
                Buf::Pool(self.pool.len() - 1)
            })
            .collect();
        let scope = r
            .params
            .iter()
            .zip(&params)
            .filter_map(|(p, b)| match b {
                Binding::Index(v) => Some((p.name.clone(), *v)),
                Binding::Array { .. } => None,
            })
            .collect();
        let mut frame = Frame {
            routine: r,
            locals,
            params,
            scope,
        };
        let result = self.exec(&mut frame, &r.body, host).and_then(|()| match r.ret {
            Some(l) => self.load(&frame, &Window::vector(Base::Local(l), Affine::lit(0), 1), 0, 0),
            None => Ok(0.0),
        });
        self.pool.truncate(base);
        result
    }

    fn exec(&mut self, frame: &mut Frame<'p>, stmts: &'p [Stmt], host: &mut dyn Host) -> Result<(), EvalError> {
        for s in stmts {
            match s {
                Stmt::Assign { dst, op, value } => {
                    let v = self.eval(frame, value)?;
                    let (rows, cols) = dst.shape();
                    for i in 0..rows {
                        for j in 0..cols {
                            let (buf, at) = self.locate(frame, dst, i, j)?;
                            let cell = &mut self.slot(buf)[at];
                            match op {
                                AssignOp::Set => *cell = v[(i, j)],
                                AssignOp::Add => *cell += v[(i, j)],
                                AssignOp::Sub => *cell -= v[(i, j)],
                            }
                        }
                    }
                }
                Stmt::Clear(id) => {
                    if let Some(b) = self.memory.bufs.get_mut(id.0 as usize) {
                        b.iter_mut().for_each(|v| *v = 0.0);
                    }
                }
                Stmt::For {
                    var,
                    start,
                    end,
                    body,
                } => {
                    for k in *start..*end {
                        frame.scope.push((var.clone(), k));
                        let res = self.exec(frame, body, host);
                        frame.scope.pop();
                        res?;
                    }
                }
                Stmt::Call {
                    callee,
                    args,
                    status,
                } => {
                    let ret = match callee {
                        Callee::Routine(name) => self.call_routine(frame, name, args, host)?,
                        Callee::External(e) => self.call_external(frame, e, args, host)?,
                    };
                    if let Some(w) = status {
                        let (buf, at) = self.locate(frame, w, 0, 0)?;
                        self.slot(buf)[at] = ret;
                    }
                }
                Stmt::Comment(_) => {}
            }
        }
        Ok(())
    }

    fn call_routine(
        &mut self,
        frame: &Frame<'p>,
        name: &str,
        args: &[Arg],
        host: &mut dyn Host,
    ) -> Result<f64, EvalError> {
        let program = self.program;
        let callee = program
            .routine(name)
            .ok_or_else(|| EvalError::UnknownRoutine(name.to_string()))?;
        if callee.params.len() != args.len() {
            return Err(EvalError::Arity(name.to_string()));
        }
        let mut bindings = Vec::with_capacity(args.len());
        for a in args {
            bindings.push(match a {
                Arg::Ref(w) => {
                    let (buf, offset) = self.locate(frame, w, 0, 0)?;
                    Binding::Array { buf, offset }
                }
                Arg::Index(i) => Binding::Index(self.index(frame, i)?),
            });
        }
        self.invoke(callee, bindings, host)
    }

    fn call_external(
        &mut self,
        frame: &Frame<'p>,
        external: &External,
        args: &[Arg],
        host: &mut dyn Host,
    ) -> Result<f64, EvalError> {
        let mut host_args = Vec::with_capacity(args.len());
        for a in args {
            host_args.push(match a {
                Arg::Ref(w) => {
                    let mut v = Vec::with_capacity(w.len());
                    for i in 0..w.rows {
                        for j in 0..w.cols {
                            let (buf, at) = self.locate_stored(frame, w, i, j)?;
                            v.push(self.buffer(buf)[at]);
                        }
                    }
                    HostArg::Array(v)
                }
                Arg::Index(i) => HostArg::Index(self.index(frame, i)?),
            });
        }
        let status = host.call(external, &mut host_args, &mut self.memory);
        for (a, h) in args.iter().zip(&host_args) {
            if let (Arg::Ref(w), HostArg::Array(v)) = (a, h) {
                for i in 0..w.rows {
                    for j in 0..w.cols {
                        let (buf, at) = self.locate_stored(frame, w, i, j)?;
                        if let Some(x) = v.get(i * w.cols + j) {
                            self.slot(buf)[at] = *x;
                        }
                    }
                }
            }
        }
        Ok(status as f64)
    }

    // ── Addressing ──────────────────────────────────────────────────────

    fn slot(&mut self, buf: Buf) -> &mut Vec<f64> {
        match buf {
            Buf::Global(i) => &mut self.memory.bufs[i],
            Buf::Pool(i) => &mut self.pool[i],
        }
    }

    fn buffer(&self, buf: Buf) -> &[f64] {
        match buf {
            Buf::Global(i) => &self.memory.bufs[i],
            Buf::Pool(i) => &self.pool[i],
        }
    }

    fn index(&self, frame: &Frame<'p>, a: &Affine) -> Result<usize, EvalError> {
        match &a.var {
            None => Ok(a.constant),
            Some((v, c)) => frame
                .scope
                .iter()
                .rev()
                .find(|(name, _)| name == v)
                .map(|(_, value)| c * value + a.constant)
                .ok_or_else(|| EvalError::UnboundIndex(v.clone())),
        }
    }

    /// Buffer and flat position of stored element `(r, c)`.
    fn locate_stored(&self, frame: &Frame<'p>, w: &Window, r: usize, c: usize) -> Result<(Buf, usize), EvalError> {
        let (buf, base) = match w.base {
            Base::Global(id) => (Buf::Global(id.0 as usize), 0),
            Base::Local(l) => (frame.locals[l], 0),
            Base::Param(p) => match frame.params.get(p) {
                Some(Binding::Array { buf, offset }) => (*buf, *offset),
                _ => return Err(EvalError::Arity(frame.routine.name.clone())),
            },
        };
        let at = base + self.index(frame, &w.offset)? + r * w.stride + c;
        let len = self.buffer(buf).len();
        if at >= len {
            return Err(EvalError::OutOfBounds {
                routine: frame.routine.name.clone(),
                index: at,
                len,
            });
        }
        Ok((buf, at))
    }

    /// Buffer and flat position of logical element `(i, j)`.
    fn locate(&self, frame: &Frame<'p>, w: &Window, i: usize, j: usize) -> Result<(Buf, usize), EvalError> {
        let (r, c) = if w.transposed { (j, i) } else { (i, j) };
        self.locate_stored(frame, w, r, c)
    }

    fn load(&self, frame: &Frame<'p>, w: &Window, i: usize, j: usize) -> Result<f64, EvalError> {
        let (buf, at) = self.locate(frame, w, i, j)?;
        Ok(self.buffer(buf)[at])
    }

    fn eval(&self, frame: &Frame<'p>, e: &Expr) -> Result<DMatrix<f64>, EvalError> {
        Ok(match e {
            Expr::Read(w) => {
                let (rows, cols) = w.shape();
                let mut m = DMatrix::zeros(rows, cols);
                for i in 0..rows {
                    for j in 0..cols {
                        m[(i, j)] = self.load(frame, w, i, j)?;
                    }
                }
                m
            }
            Expr::Const(m) => m.clone(),
            Expr::Add(a, b) => self.eval(frame, a)? + self.eval(frame, b)?,
            Expr::Sub(a, b) => self.eval(frame, a)? - self.eval(frame, b)?,
            Expr::Mul(a, b) => self.eval(frame, a)? * self.eval(frame, b)?,
            Expr::Abs(a) => self.eval(frame, a)?.abs(),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
