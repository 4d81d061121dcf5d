// objective.rs — Objective Assembler
//
// Builds the routines that linearize the least-squares objective: stage and
// terminal residual evaluation, the Gauss-Newton Hessian blocks that could not
// be evaluated at generation time, and the per-node gradient routine.
//
// Preconditions: a `StoragePlan` produced for the same `Problem`.
// Postconditions: one `setObj*` routine per computed block, each called once
//   per node from `evaluateObjective`; given blocks appear only as constants.
// Failure modes: none (shapes are fixed by the plan).
// Side effects: none.

use nalgebra::DMatrix;

use crate::ir::{Affine, Arg, Expr, External, Routine, Section, Stmt, Window};
use crate::storage::{ArrayId, Block, LinearStorage, StoragePlan};
use crate::validate::Problem;

pub const EVALUATE_OBJECTIVE: &str = "evaluateObjective";
pub const SET_STAGE_F: &str = "setStagef";

const LOOP: &str = "runObj";

pub fn assemble_objective(problem: &Problem, plan: &StoragePlan) -> Section {
    let asm = ObjectiveAssembler { problem, plan };
    let mut routines = Vec::new();
    routines.extend(asm.set_obj_q1q2());
    routines.extend(asm.set_obj_r1r2());
    routines.extend(asm.set_obj_s1());
    routines.extend(asm.set_obj_qn1qn2());
    routines.push(asm.evaluate_objective());
    routines.push(asm.set_stage_f());
    Section {
        routines,
        init: asm.init(),
    }
}

/// Pack `[x_i, u_i, od_i]` (or `[x_N, od_N]` without control) into `buffer`.
pub(crate) fn load_node_input(
    plan: &StoragePlan,
    problem: &Problem,
    buffer: ArrayId,
    node: &Affine,
    with_control: bool,
) -> Vec<Stmt> {
    let (nx, nu, nod) = (problem.dims.nx, problem.dims.nu, problem.dims.nod);
    let t = &plan.table;
    let a = &plan.arrays;
    let mut out = vec![Stmt::assign(
        t.flat(buffer, Affine::lit(0), nx),
        Expr::read(t.flat(a.x, node.scaled(nx), nx)),
    )];
    let mut at = nx;
    if with_control {
        out.push(Stmt::assign(
            t.flat(buffer, Affine::lit(at), nu),
            Expr::read(t.flat(a.u, node.scaled(nu), nu)),
        ));
        at += nu;
    }
    if let Some(od) = a.od {
        out.push(Stmt::assign(
            t.flat(buffer, Affine::lit(at), nod),
            Expr::read(t.flat(od, node.scaled(nod), nod)),
        ));
    }
    out
}

/// `m + λI`, or `m` unchanged when λ is zero.
pub(crate) fn damped(m: Expr, size: usize, lambda: f64) -> Expr {
    if lambda == 0.0 {
        m
    } else {
        Expr::add(m, Expr::Const(DMatrix::identity(size, size) * lambda))
    }
}

/// Read `block` at node `node`; given blocks are the same for every node.
pub(crate) fn block_at(plan: &StoragePlan, block: &Block, node: &Affine, rows: usize) -> Expr {
    match block {
        Block::Given(m) => Expr::Const(m.clone()),
        Block::Computed(id) => Expr::read(plan.table.rows(*id, node.scaled(rows), rows)),
    }
}

struct ObjectiveAssembler<'a> {
    problem: &'a Problem,
    plan: &'a StoragePlan,
}

impl ObjectiveAssembler<'_> {
    fn lambda(&self) -> f64 {
        self.problem.flags.levenberg_marquardt
    }

    /// Matrix input of a `setObj*` routine: a constant, or a new parameter.
    fn input(&self, r: &mut Routine, name: &str, given: Option<&DMatrix<f64>>, rows: usize, cols: usize) -> Expr {
        match given {
            Some(m) => Expr::Const(m.clone()),
            None => Expr::read(r.array_param(name, rows, cols)),
        }
    }

    fn set_obj_q1q2(&self) -> Option<Routine> {
        if self.plan.blocks.q1.is_given() {
            return None;
        }
        let (nx, ny) = (self.problem.dims.nx, self.problem.dims.ny);
        let mut r = Routine::new("setObjQ1Q2").with_doc("Q2 = Fx'*S, Q1 = Q2*Fx (+ lambda*I)");
        let fx = self.input(&mut r, "Fx", self.problem.jac_x.as_ref(), ny, nx);
        let s = self.input(&mut r, "S", self.problem.weight.as_ref(), ny, ny);
        let q11 = r.array_param("Q11", nx, nx);
        let q22 = r.array_param("Q22", nx, ny);
        r.push(Stmt::assign(q22.clone(), Expr::mul(fx.clone().t(), s)));
        r.push(Stmt::assign(
            q11,
            damped(Expr::mul(Expr::read(q22), fx), nx, self.lambda()),
        ));
        Some(r)
    }

    fn set_obj_r1r2(&self) -> Option<Routine> {
        if self.plan.blocks.r1.is_given() {
            return None;
        }
        let (nu, ny) = (self.problem.dims.nu, self.problem.dims.ny);
        let mut r = Routine::new("setObjR1R2").with_doc("R2 = Fu'*S, R1 = R2*Fu (+ lambda*I)");
        let fu = self.input(&mut r, "Fu", self.problem.jac_u.as_ref(), ny, nu);
        let s = self.input(&mut r, "S", self.problem.weight.as_ref(), ny, ny);
        let r11 = r.array_param("R11", nu, nu);
        let r22 = r.array_param("R22", nu, ny);
        r.push(Stmt::assign(r22.clone(), Expr::mul(fu.clone().t(), s)));
        r.push(Stmt::assign(
            r11,
            damped(Expr::mul(Expr::read(r22), fu), nu, self.lambda()),
        ));
        Some(r)
    }

    fn set_obj_s1(&self) -> Option<Routine> {
        if self.plan.blocks.s1.is_given() {
            return None;
        }
        let (nx, nu, ny) = (self.problem.dims.nx, self.problem.dims.nu, self.problem.dims.ny);
        let mut r = Routine::new("setObjS1").with_doc("S1 = Fx'*S*Fu");
        let fx = self.input(&mut r, "Fx", self.problem.jac_x.as_ref(), ny, nx);
        let fu = self.input(&mut r, "Fu", self.problem.jac_u.as_ref(), ny, nu);
        let s = self.input(&mut r, "S", self.problem.weight.as_ref(), ny, ny);
        let s11 = r.array_param("S11", nx, nu);
        let tmp = r.local("tmpS2", nx, ny, crate::storage::ElemKind::Real);
        r.push(Stmt::assign(tmp.clone(), Expr::mul(fx.t(), s)));
        r.push(Stmt::assign(s11, Expr::mul(Expr::read(tmp), fu)));
        Some(r)
    }

    fn set_obj_qn1qn2(&self) -> Option<Routine> {
        if self.plan.blocks.qn1.is_given() {
            return None;
        }
        let (nx, nyn) = (self.problem.dims.nx, self.problem.dims.nyn);
        let mut r =
            Routine::new("setObjQN1QN2").with_doc("QN2 = FxN'*SN, QN1 = QN2*FxN (+ lambda*I)");
        let fx = self.input(&mut r, "FxN", self.problem.jac_x_end.as_ref(), nyn, nx);
        let s = self.input(&mut r, "SN", self.problem.terminal_weight.as_ref(), nyn, nyn);
        let qn1 = r.array_param("QN1", nx, nx);
        let qn2 = r.array_param("QN2", nx, nyn);
        r.push(Stmt::assign(qn2.clone(), Expr::mul(fx.clone().t(), s)));
        r.push(Stmt::assign(
            qn1,
            damped(Expr::mul(Expr::read(qn2), fx), nx, self.lambda()),
        ));
        Some(r)
    }

    /// Stage weighting argument for node `node`, if it is a parameter.
    fn weight_arg(&self, node: &Affine) -> Option<Arg> {
        weight_window(self.plan, self.problem, node).map(Arg::Ref)
    }

    fn evaluate_objective(&self) -> Routine {
        let p = self.problem;
        let (n, nx, nu, ny, nyn) = (p.dims.n, p.dims.nx, p.dims.nu, p.dims.ny, p.dims.nyn);
        let t = &self.plan.table;
        let a = &self.plan.arrays;
        let b = &self.plan.blocks;
        let layout = &self.plan.layout;
        let node = Affine::var(LOOP);

        let fx_arg = layout
            .stage_fx
            .map(|at| Arg::Ref(t.flat(a.obj_value_out, Affine::lit(at), ny * nx)));
        let fu_arg = layout
            .stage_fu
            .map(|at| Arg::Ref(t.flat(a.obj_value_out, Affine::lit(at), ny * nu)));
        let s_arg = self.weight_arg(&node);

        let mut body = load_node_input(self.plan, p, a.obj_value_in, &node, true);
        body.push(Stmt::call_external(
            External::StageCost,
            vec![
                Arg::Ref(t.whole(a.obj_value_in)),
                Arg::Ref(t.whole(a.obj_value_out)),
            ],
            None,
        ));
        body.push(Stmt::assign(
            t.flat(a.dy, node.scaled(ny), ny),
            Expr::read(t.flat(a.obj_value_out, Affine::lit(0), ny)),
        ));
        if let Some(q2) = b.q2.computed() {
            let mut args: Vec<Arg> = Vec::new();
            args.extend(fx_arg.clone());
            args.extend(s_arg.clone());
            args.push(Arg::Ref(t.rows(a.qp_q, node.scaled(nx), nx)));
            args.push(Arg::Ref(t.rows(q2, node.scaled(nx), nx)));
            body.push(Stmt::call("setObjQ1Q2", args));
        }
        if let Some(r2) = b.r2.computed() {
            let mut args: Vec<Arg> = Vec::new();
            args.extend(fu_arg.clone());
            args.extend(s_arg.clone());
            args.push(Arg::Ref(t.rows(a.qp_r, node.scaled(nu), nu)));
            args.push(Arg::Ref(t.rows(r2, node.scaled(nu), nu)));
            body.push(Stmt::call("setObjR1R2", args));
        }
        if !b.s1.is_given() {
            let mut args: Vec<Arg> = Vec::new();
            args.extend(fx_arg);
            args.extend(fu_arg);
            args.extend(s_arg);
            args.push(Arg::Ref(t.rows(a.qp_s, node.scaled(nx), nx)));
            body.push(Stmt::call("setObjS1", args));
        }

        let mut r = Routine::new(EVALUATE_OBJECTIVE)
            .with_doc("Evaluate residuals and the Gauss-Newton blocks over the horizon");
        r.push(Stmt::for_loop(LOOP, 0, n, body));

        let end = Affine::lit(n);
        for s in load_node_input(self.plan, p, a.obj_value_in, &end, false) {
            r.push(s);
        }
        r.push(Stmt::call_external(
            External::TerminalCost,
            vec![
                Arg::Ref(t.whole(a.obj_value_in)),
                Arg::Ref(t.whole(a.obj_value_out)),
            ],
            None,
        ));
        r.push(Stmt::assign(
            t.whole(a.dy_n),
            Expr::read(t.flat(a.obj_value_out, Affine::lit(0), nyn)),
        ));
        if let Some(qn2) = b.qn2.computed() {
            let mut args: Vec<Arg> = Vec::new();
            if let Some(at) = layout.terminal_fx {
                args.push(Arg::Ref(t.flat(a.obj_value_out, Affine::lit(at), nyn * nx)));
            }
            if let Some(wn) = a.w_n {
                args.push(Arg::Ref(t.whole(wn)));
            }
            args.push(Arg::Ref(t.whole(a.qp_qf)));
            args.push(Arg::Ref(t.whole(qn2)));
            r.push(Stmt::call("setObjQN1QN2", args));
        }
        r
    }

    fn set_stage_f(&self) -> Routine {
        let p = self.problem;
        let (n, nx, nu, ny) = (p.dims.n, p.dims.nx, p.dims.nu, p.dims.ny);
        let t = &self.plan.table;
        let a = &self.plan.arrays;
        let b = &self.plan.blocks;

        let mut r = Routine::new(SET_STAGE_F).with_doc("Gradient of node `index`: q = Q2*Dy, r = R2*Dy");
        let q = r.array_param("stageq", nx, 1);
        let rr = r.array_param("stager", nu, 1);
        let (slx, slu) = match &self.plan.linear {
            LinearStorage::None => (None, None),
            LinearStorage::Given { x, u } => (Some(Expr::Const(x.clone())), Some(Expr::Const(u.clone()))),
            LinearStorage::Shared { .. } | LinearStorage::PerNode { .. } => (
                Some(Expr::read(r.array_param("Slx", nx, 1))),
                Some(Expr::read(r.array_param("Slu", nu, 1))),
            ),
        };
        r.index_param("index", n);
        let index = Affine::var("index");
        let dy = Expr::read(t.flat(a.dy, index.scaled(ny), ny));

        let with_linear = |e: Expr, l: Option<Expr>| match l {
            Some(l) => Expr::add(e, l),
            None => e,
        };
        r.push(Stmt::assign(
            q,
            with_linear(Expr::mul(block_at(self.plan, &b.q2, &index, nx), dy.clone()), slx),
        ));
        r.push(Stmt::assign(
            rr,
            with_linear(Expr::mul(block_at(self.plan, &b.r2, &index, nu), dy), slu),
        ));
        r
    }

    /// Fill QP Hessian storage of the given blocks.
    fn init(&self) -> Vec<Stmt> {
        let (n, nx, nu) = (self.problem.dims.n, self.problem.dims.nx, self.problem.dims.nu);
        let t = &self.plan.table;
        let a = &self.plan.arrays;
        let b = &self.plan.blocks;
        let node = Affine::var(LOOP);
        let mut per_node = Vec::new();
        if let Some(q1) = b.q1.given() {
            per_node.push(Stmt::assign(
                t.rows(a.qp_q, node.scaled(nx), nx),
                Expr::Const(q1.clone()),
            ));
        }
        if let Some(r1) = b.r1.given() {
            per_node.push(Stmt::assign(
                t.rows(a.qp_r, node.scaled(nu), nu),
                Expr::Const(r1.clone()),
            ));
        }
        if let Some(s1) = b.s1.given().filter(|m| m.iter().any(|v| *v != 0.0)) {
            per_node.push(Stmt::assign(
                t.rows(a.qp_s, node.scaled(nx), nx),
                Expr::Const(s1.clone()),
            ));
        }
        let mut out = Vec::new();
        if !per_node.is_empty() {
            out.push(Stmt::for_loop(LOOP, 0, n, per_node));
        }
        if let Some(qn1) = b.qn1.given() {
            out.push(Stmt::assign(t.whole(a.qp_qf), Expr::Const(qn1.clone())));
        }
        out
    }
}

/// Read of the stage weighting `W` at `node` (runtime weighting only).
pub(crate) fn weight_window(plan: &StoragePlan, problem: &Problem, node: &Affine) -> Option<Window> {
    let w = plan.arrays.w?;
    let ny = problem.dims.ny;
    Some(if problem.flags.variable_weighting {
        plan.table.rows(w, node.scaled(ny), ny)
    } else {
        plan.table.whole(w)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinearTermSpec, WeightSpec};
    use crate::ir::Callee;
    use crate::storage::plan_storage;
    use crate::validate::tests::base_config;
    use crate::validate::validate;

    fn assemble(cfg: &crate::config::ProblemConfig) -> (Problem, StoragePlan, Section) {
        let problem = validate(cfg).problem.unwrap();
        let plan = plan_storage(&problem).plan.unwrap();
        let section = assemble_objective(&problem, &plan);
        (problem, plan, section)
    }

    fn names(section: &Section) -> Vec<&str> {
        section.routines.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn given_blocks_need_no_set_routines() {
        let (_, _, section) = assemble(&base_config());
        assert_eq!(names(&section), vec![EVALUATE_OBJECTIVE, SET_STAGE_F]);
        // qpQ, qpR filled per node, qpQf once; the cross block is zero
        assert_eq!(section.init.len(), 2);
        match &section.init[0] {
            Stmt::For { body, .. } => assert_eq!(body.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn runtime_weighting_emits_every_set_routine() {
        let mut cfg = base_config();
        cfg.objective.weight = WeightSpec::Runtime;
        cfg.objective.terminal_weight = WeightSpec::Runtime;
        let (_, _, section) = assemble(&cfg);
        assert_eq!(
            names(&section),
            vec![
                "setObjQ1Q2",
                "setObjR1R2",
                "setObjS1",
                "setObjQN1QN2",
                EVALUATE_OBJECTIVE,
                SET_STAGE_F
            ]
        );
        assert!(section.init.is_empty());
        let q = &section.routines[0];
        // Fx is given, so only the weighting is a parameter
        let params: Vec<&str> = q.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(params, vec!["S", "Q11", "Q22"]);
    }

    #[test]
    fn evaluate_objective_calls_blocks_inside_node_loop() {
        let mut cfg = base_config();
        cfg.objective.weight = WeightSpec::Runtime;
        let (_, _, section) = assemble(&cfg);
        let eval = section
            .routines
            .iter()
            .find(|r| r.name == EVALUATE_OBJECTIVE)
            .unwrap();
        let callees = eval.callees();
        assert_eq!(callees[0], &Callee::External(External::StageCost));
        assert_eq!(callees[1], &Callee::Routine("setObjQ1Q2".to_string()));
        assert_eq!(callees.last(), Some(&&Callee::External(External::TerminalCost)));
        assert_eq!(eval.loop_vars(), vec![LOOP]);
    }

    #[test]
    fn lambda_added_at_runtime_only_for_computed_blocks() {
        let mut cfg = base_config();
        cfg.objective.weight = WeightSpec::Runtime;
        cfg.flags.levenberg_marquardt = 1e-3;
        let (_, _, section) = assemble(&cfg);
        let q = &section.routines[0];
        match &q.body[1] {
            Stmt::Assign {
                value: Expr::Add(_, lm),
                ..
            } => assert_eq!(**lm, Expr::Const(DMatrix::identity(2, 2) * 1e-3)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn runtime_linear_terms_become_parameters() {
        let mut cfg = base_config();
        cfg.objective.linear_terms = LinearTermSpec::Runtime;
        let (_, _, section) = assemble(&cfg);
        let f = section.routines.iter().find(|r| r.name == SET_STAGE_F).unwrap();
        let params: Vec<&str> = f.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(params, vec!["stageq", "stager", "Slx", "Slu", "index"]);
    }

    #[test]
    fn weight_window_per_node() {
        let mut cfg = base_config();
        cfg.objective.weight = WeightSpec::Runtime;
        cfg.flags.variable_weighting = true;
        let (problem, plan, _) = assemble(&cfg);
        let w = weight_window(&plan, &problem, &Affine::var("i")).unwrap();
        assert_eq!(w.offset, Affine::var("i").scaled(9));
        assert_eq!((w.rows, w.cols), (3, 3));
    }
}
