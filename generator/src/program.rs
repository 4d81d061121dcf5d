// program.rs — Declaration/Emission Aggregator
//
// Collects the planned arrays and the assembled routines into one program in
// emission order (callees before callers), lists the external functions the
// routines call, and verifies the result.
//
// Preconditions: sections assembled from the same `StoragePlan`.
// Postconditions: `verify_program` checks obligations A1-A5:
//   A1 every array and routine declared exactly once;
//   A2 every routine references only declared arrays, and locals/params of
//      its own routine;
//   A3 every window lies within its array, indices are bound, and every
//      assignment is shape-consistent;
//   A4 every call targets an earlier routine or a declared external, with
//      matching arguments;
//   A5 `updateArrivalCost` is present iff the arrival cost is used.
// Failure modes: a failed obligation (reported by the pipeline as E0600).
// Side effects: none.

use std::collections::HashSet;
use std::fmt;

use crate::auxiliary::initialize;
use crate::config::Dimensions;
use crate::ir::{Arg, Base, Callee, External, ParamKind, Routine, RoutineDisplay, Section, Stmt, Window};
use crate::rti::UPDATE_ARRIVAL_COST;
use crate::storage::{ArrayId, ArrayTable, StorageClass, StoragePlan};
use crate::validate::Problem;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub module: String,
    pub dims: Dimensions,
    pub table: ArrayTable,
    /// Externals in first-use order.
    pub externals: Vec<External>,
    /// Routines in emission order.
    pub routines: Vec<Routine>,
    pub num_qp_vars: usize,
    /// Affine-constraint rows per node 0..=N.
    pub con_dim: Vec<usize>,
}

impl Program {
    pub fn routine(&self, name: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| r.name == name)
    }

    pub fn has_routine(&self, name: &str) -> bool {
        self.routine(name).is_some()
    }

    pub fn array_name(&self, id: ArrayId) -> String {
        self.table.get(id).name.clone()
    }
}

pub fn assemble_program(
    problem: &Problem,
    plan: &StoragePlan,
    objective: Section,
    constraints: Section,
    phases: Section,
) -> Program {
    let mut init = objective.init;
    init.extend(constraints.init);
    init.extend(phases.init);

    let mut routines = objective.routines;
    routines.extend(constraints.routines);
    routines.push(initialize(plan, init));
    routines.extend(phases.routines);

    let mut externals: Vec<External> = Vec::new();
    for r in &routines {
        for callee in r.callees() {
            if let Callee::External(e) = callee {
                if !externals.contains(e) {
                    externals.push(e.clone());
                }
            }
        }
    }

    Program {
        module: problem.module.clone(),
        dims: problem.dims,
        table: plan.table.clone(),
        externals,
        routines,
        num_qp_vars: problem.num_qp_vars(),
        con_dim: problem.con_dim.clone(),
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for program postconditions (A1-A5).
#[derive(Debug, Clone)]
pub struct ProgramCert {
    /// A1: array and routine names are unique.
    pub a1_unique_declarations: bool,
    /// A2: every reference resolves to a declared array, local or parameter.
    pub a2_references_declared: bool,
    /// A3: every window lies within its array; assignments are shape-consistent.
    pub a3_windows_in_bounds: bool,
    /// A4: every call resolves, with matching arguments.
    pub a4_calls_resolved: bool,
    /// A5: `updateArrivalCost` present iff the arrival cost is used.
    pub a5_arrival_cost_consistent: bool,
}

impl crate::pass::StageCert for ProgramCert {
    fn all_pass(&self) -> bool {
        self.a1_unique_declarations
            && self.a2_references_declared
            && self.a3_windows_in_bounds
            && self.a4_calls_resolved
            && self.a5_arrival_cost_consistent
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("A1_unique_declarations", self.a1_unique_declarations),
            ("A2_references_declared", self.a2_references_declared),
            ("A3_windows_in_bounds", self.a3_windows_in_bounds),
            ("A4_calls_resolved", self.a4_calls_resolved),
            ("A5_arrival_cost_consistent", self.a5_arrival_cost_consistent),
        ]
    }
}

/// Verify program postconditions.
pub fn verify_program(program: &Program, use_arrival_cost: bool) -> ProgramCert {
    let a2 = verify_a2_references_declared(program);
    ProgramCert {
        a1_unique_declarations: verify_a1_unique_declarations(program),
        a2_references_declared: a2,
        // Bounds are only meaningful once every base resolves.
        a3_windows_in_bounds: a2 && verify_a3_windows_in_bounds(program),
        a4_calls_resolved: verify_a4_calls_resolved(program),
        a5_arrival_cost_consistent: program.has_routine(UPDATE_ARRIVAL_COST) == use_arrival_cost,
    }
}

/// A1: no two arrays, and no two routines, share a name.
fn verify_a1_unique_declarations(program: &Program) -> bool {
    let mut arrays = HashSet::new();
    let mut routines = HashSet::new();
    program.table.iter().all(|(_, a)| arrays.insert(a.name.as_str()))
        && program.routines.iter().all(|r| routines.insert(r.name.as_str()))
}

/// Visit every window of a statement list: destinations, reads, arguments.
fn for_each_window<'a>(stmts: &'a [Stmt], f: &mut impl FnMut(&'a Window) -> bool) -> bool {
    for s in stmts {
        let ok = match s {
            Stmt::Assign { dst, value, .. } => {
                let mut reads = Vec::new();
                value.windows(&mut reads);
                f(dst) && reads.into_iter().all(&mut *f)
            }
            Stmt::For { body, .. } => for_each_window(body, f),
            Stmt::Call { args, status, .. } => {
                args.iter().all(|a| match a {
                    Arg::Ref(w) => f(w),
                    Arg::Index(_) => true,
                }) && status.as_ref().map_or(true, &mut *f)
            }
            Stmt::Clear(_) | Stmt::Comment(_) => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// A2: globals exist, locals and array parameters belong to the routine.
fn verify_a2_references_declared(program: &Program) -> bool {
    program.routines.iter().all(|r| {
        let clears_ok = cleared(&r.body)
            .into_iter()
            .all(|id| program.table.contains(id));
        clears_ok
            && for_each_window(&r.body, &mut |w| match w.base {
                Base::Global(id) => program.table.contains(id),
                Base::Local(i) => i < r.locals.len(),
                Base::Param(i) => {
                    matches!(r.params.get(i).map(|p| &p.kind), Some(ParamKind::Array { .. }))
                }
            })
    })
}

fn cleared(stmts: &[Stmt]) -> Vec<ArrayId> {
    let mut out = Vec::new();
    for s in stmts {
        match s {
            Stmt::Clear(id) => out.push(*id),
            Stmt::For { body, .. } => out.extend(cleared(body)),
            _ => {}
        }
    }
    out
}

/// Number of elements behind a window base.
fn base_len(program: &Program, r: &Routine, base: Base) -> Option<usize> {
    match base {
        Base::Global(id) => Some(program.table.get(id).len()),
        Base::Local(i) => r.locals.get(i).map(|l| l.len()),
        Base::Param(i) => match r.params.get(i)?.kind {
            ParamKind::Array { rows, cols } => Some(rows * cols),
            ParamKind::Index { .. } => None,
        },
    }
}

/// A3: with every index at its largest value, each window still fits.
fn verify_a3_windows_in_bounds(program: &Program) -> bool {
    out_of_bounds_routines(program).is_empty()
}

/// Routines with a window that exceeds its array or mismatches its
/// destination shape.
pub fn out_of_bounds_routines(program: &Program) -> Vec<&str> {
    program
        .routines
        .iter()
        .filter(|r| {
            let mut scope: Vec<(String, usize)> = r
                .params
                .iter()
                .filter_map(|p| match p.kind {
                    ParamKind::Index { bound } if bound > 0 => Some((p.name.clone(), bound - 1)),
                    _ => None,
                })
                .collect();
            !check_scope(program, r, &r.body, &mut scope)
        })
        .map(|r| r.name.as_str())
        .collect()
}

fn check_scope(program: &Program, r: &Routine, stmts: &[Stmt], scope: &mut Vec<(String, usize)>) -> bool {
    let fits = |w: &Window, scope: &[(String, usize)]| -> bool {
        let Some(len) = base_len(program, r, w.base) else {
            return false;
        };
        let max_offset = match &w.offset.var {
            None => w.offset.constant,
            Some((v, c)) => match scope.iter().rev().find(|(name, _)| name == v) {
                Some((_, max)) => c * max + w.offset.constant,
                None => return false,
            },
        };
        max_offset + w.extent() <= len
    };
    for s in stmts {
        let ok = match s {
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                if end <= start {
                    true
                } else {
                    scope.push((var.clone(), end - 1));
                    let ok = check_scope(program, r, body, scope);
                    scope.pop();
                    ok
                }
            }
            Stmt::Assign { dst, value, .. } => {
                let mut reads = Vec::new();
                value.windows(&mut reads);
                value.shape() == Some(dst.shape())
                    && fits(dst, scope)
                    && reads.into_iter().all(|w| fits(w, scope))
            }
            Stmt::Call { args, status, .. } => {
                args.iter().all(|a| match a {
                    Arg::Ref(w) => fits(w, scope),
                    Arg::Index(i) => match i.var_name() {
                        Some(v) => scope.iter().any(|(name, _)| name == v),
                        None => true,
                    },
                }) && status.as_ref().map_or(true, |w| w.len() == 1 && fits(w, scope))
            }
            Stmt::Clear(_) | Stmt::Comment(_) => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// A4: routine calls go backwards in emission order; externals are declared.
fn verify_a4_calls_resolved(program: &Program) -> bool {
    program.routines.iter().enumerate().all(|(pos, r)| {
        calls(&r.body).into_iter().all(|(callee, args, status)| match callee {
            Callee::Routine(name) => {
                let Some(target) = program.routines[..pos].iter().find(|t| &t.name == name) else {
                    return false;
                };
                status.is_none()
                    && target.params.len() == args.len()
                    && target.params.iter().zip(args).all(|(p, a)| match (&p.kind, a) {
                        (ParamKind::Array { rows, cols }, Arg::Ref(w)) => w.len() == rows * cols,
                        (ParamKind::Index { .. }, Arg::Index(_)) => true,
                        _ => false,
                    })
            }
            Callee::External(e) => {
                let sig = e.signature();
                program.externals.contains(e)
                    && sig.len() == args.len()
                    && sig.iter().zip(args).all(|((_, is_ptr), a)| {
                        matches!((*is_ptr, a), (true, Arg::Ref(_)) | (false, Arg::Index(_)))
                    })
                    && (status.is_none() || e.returns_status())
            }
        })
    })
}

type CallRef<'a> = (&'a Callee, &'a [Arg], &'a Option<Window>);

fn calls(stmts: &[Stmt]) -> Vec<CallRef<'_>> {
    let mut out = Vec::new();
    for s in stmts {
        match s {
            Stmt::Call {
                callee,
                args,
                status,
            } => out.push((callee, args.as_slice(), status)),
            Stmt::For { body, .. } => out.extend(calls(body)),
            _ => {}
        }
    }
    out
}

// ── Display (for `--emit ir`) ──────────────────────────────────────────────

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.dims;
        writeln!(f, "module {}", self.module)?;
        writeln!(
            f,
            "dims N={} NX={} NU={} NY={} NYN={} NOD={}",
            d.n, d.nx, d.nu, d.ny, d.nyn, d.nod
        )?;
        writeln!(f, "numQPvars {}", self.num_qp_vars)?;
        writeln!(f, "qpConDim {:?}", self.con_dim)?;
        writeln!(f)?;
        for class in [
            StorageClass::Variable,
            StorageClass::Constant,
            StorageClass::Workspace,
        ] {
            for (_, a) in self.table.iter().filter(|(_, a)| a.class == class) {
                writeln!(f, "{} {} {}x{}", class.label(), a.name, a.rows, a.cols)?;
            }
        }
        writeln!(f)?;
        for e in &self.externals {
            writeln!(f, "extern {}", e.symbol(&self.module))?;
        }
        let name = |id: ArrayId| self.array_name(id);
        for r in &self.routines {
            writeln!(f)?;
            write!(
                f,
                "{}",
                RoutineDisplay {
                    routine: r,
                    global_name: &name,
                }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::assemble_constraints;
    use crate::ir::{Affine, Expr};
    use crate::objective::assemble_objective;
    use crate::pass::StageCert;
    use crate::rti::assemble_phases;
    use crate::storage::plan_storage;
    use crate::validate::tests::base_config;
    use crate::validate::validate;

    fn build(cfg: &crate::config::ProblemConfig) -> Program {
        let problem = validate(cfg).problem.unwrap();
        let plan = plan_storage(&problem).plan.unwrap();
        assemble_program(
            &problem,
            &plan,
            assemble_objective(&problem, &plan),
            assemble_constraints(&problem, &plan),
            assemble_phases(&problem, &plan),
        )
    }

    #[test]
    fn assembled_program_passes_verification() {
        let program = build(&base_config());
        let cert = verify_program(&program, false);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn emission_order_puts_callees_first() {
        let program = build(&base_config());
        let pos = |n: &str| program.routines.iter().position(|r| r.name == n).unwrap();
        assert!(pos("evaluateObjective") < pos("preparation"));
        assert!(pos("setStagef") < pos("feedback"));
        assert!(pos("initialize") < pos("initializeNodes"));
    }

    #[test]
    fn externals_listed_once() {
        let program = build(&base_config());
        assert_eq!(
            program.externals,
            vec![
                External::StageCost,
                External::TerminalCost,
                External::Integrate,
                External::ModelSimulation,
                External::QpSolve,
            ]
        );
    }

    #[test]
    fn out_of_bounds_window_fails_a3() {
        let mut program = build(&base_config());
        let x = program.table.find("x").unwrap();
        let r = program.routines.iter_mut().find(|r| r.name == "shiftStates").unwrap();
        r.push(Stmt::assign(
            program.table.flat(x, Affine::lit(7), 2),
            Expr::read(program.table.flat(x, Affine::lit(0), 2)),
        ));
        let cert = verify_program(&program, false);
        assert!(!cert.a3_windows_in_bounds);
        assert!(cert.a2_references_declared);
        assert_eq!(out_of_bounds_routines(&program), vec!["shiftStates"]);
    }

    #[test]
    fn forward_call_fails_a4() {
        let mut program = build(&base_config());
        program.routines[0].push(Stmt::call("getKKT", vec![]));
        assert!(!verify_program(&program, false).a4_calls_resolved);
    }

    #[test]
    fn arrival_cost_mismatch_fails_a5() {
        let program = build(&base_config());
        let cert = verify_program(&program, true);
        assert!(!cert.a5_arrival_cost_consistent);
        assert!(!cert.all_pass());
    }

    #[test]
    fn display_lists_arrays_and_routines() {
        let program = build(&base_config());
        let text = program.to_string();
        assert!(text.starts_with("module rti\n"));
        assert!(text.contains("numQPvars 9\n"));
        assert!(text.contains("VARIABLE x 4x2\n"));
        assert!(text.contains("extern rti_solve\n"));
        assert!(text.contains("routine feedback() -> retVal\n"));
    }
}
