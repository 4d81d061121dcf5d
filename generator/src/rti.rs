// rti.rs — RTI Phase Builder
//
// The two phases of one real-time iteration and the routines that inspect or
// update the iterate around them: `preparation` (linearize), `feedback`
// (build gradients, solve the QP, apply the full Newton step), `getKKT`, and
// `updateArrivalCost` when the arrival cost is maintained.
//
// Preconditions: objective and constraint sections assembled from the same
//   `StoragePlan`.
// Postconditions: `feedback` returns the QP status unchanged; `preparation`
//   returns the integrator status unchanged.
// Failure modes: none.
// Side effects: none.

use nalgebra::DMatrix;

use crate::auxiliary;
use crate::constraints::EVALUATE_CONSTRAINTS;
use crate::ir::{Affine, Arg, Expr, External, Routine, Section, Stmt, Window};
use crate::objective::{block_at, EVALUATE_OBJECTIVE, SET_STAGE_F};
use crate::storage::{ArrayId, ElemKind, LinearStorage, StoragePlan};
use crate::validate::Problem;

pub const PREPARATION: &str = "preparation";
pub const FEEDBACK: &str = "feedback";
pub const GET_KKT: &str = "getKKT";
pub const UPDATE_ARRIVAL_COST: &str = "updateArrivalCost";

/// RTI phase a routine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preparation,
    Feedback,
}

impl Phase {
    pub fn routine_name(self) -> &'static str {
        match self {
            Phase::Preparation => PREPARATION,
            Phase::Feedback => FEEDBACK,
        }
    }
}

/// Auxiliary routines, both phases, the KKT residual and the optional
/// arrival-cost update, callees first.
pub fn assemble_phases(problem: &Problem, plan: &StoragePlan) -> Section {
    let mut routines = vec![
        auxiliary::initialize_nodes(problem, plan),
        auxiliary::shift_states(problem, plan),
        auxiliary::shift_controls(problem, plan),
        auxiliary::get_objective(problem, plan),
        build_phase(Phase::Preparation, problem, plan),
        build_phase(Phase::Feedback, problem, plan),
        get_kkt(problem, plan),
    ];
    routines.extend(update_arrival_cost(problem, plan));
    Section {
        routines,
        init: Vec::new(),
    }
}

pub fn build_phase(phase: Phase, problem: &Problem, plan: &StoragePlan) -> Routine {
    match phase {
        Phase::Preparation => preparation(),
        Phase::Feedback => feedback(problem, plan),
    }
}

fn preparation() -> Routine {
    let mut r = Routine::new(PREPARATION).with_doc("Preparation step of the RTI scheme");
    let ret = r.returns("ret", ElemKind::Int);
    r.push(Stmt::call_external(External::ModelSimulation, vec![], Some(ret)));
    r.push(Stmt::call(EVALUATE_OBJECTIVE, vec![]));
    r.push(Stmt::call(EVALUATE_CONSTRAINTS, vec![]));
    r
}

fn feedback(problem: &Problem, plan: &StoragePlan) -> Routine {
    let (n, nx, nu, ny) = (problem.dims.n, problem.dims.nx, problem.dims.nu, problem.dims.ny);
    let t = &plan.table;
    let a = &plan.arrays;
    let b = &plan.blocks;

    let mut r = Routine::new(FEEDBACK).with_doc("Feedback/estimation step of the RTI scheme");
    let ret = r.returns("retVal", ElemKind::Int);

    if let Some(x0) = a.x0 {
        r.push(Stmt::assign(
            t.flat(a.qpx, Affine::lit(0), nx),
            Expr::sub(
                Expr::read(t.whole(x0)),
                Expr::read(t.flat(a.x, Affine::lit(0), nx)),
            ),
        ));
    }

    r.push(Stmt::sub_assign(t.whole(a.dy), Expr::read(t.flat(a.y, Affine::lit(0), n * ny))));
    r.push(Stmt::sub_assign(t.whole(a.dy_n), Expr::read(t.whole(a.y_n))));

    // Linear-term arguments: per-node slices, or the shared vector.
    let node = Affine::var("runObj");
    let mut args = vec![
        Arg::Ref(t.flat(a.qpq, node.scaled(nx), nx)),
        Arg::Ref(t.flat(a.qpr, node.scaled(nu), nu)),
    ];
    let terminal_linear = match &plan.linear {
        LinearStorage::None => None,
        LinearStorage::Given { x, .. } => Some(Expr::Const(x.clone())),
        LinearStorage::Shared { wlx, wlu } => {
            args.push(Arg::Ref(t.whole(*wlx)));
            args.push(Arg::Ref(t.whole(*wlu)));
            Some(Expr::read(t.whole(*wlx)))
        }
        LinearStorage::PerNode { wlx, wlu } => {
            args.push(Arg::Ref(t.flat(*wlx, node.scaled(nx), nx)));
            args.push(Arg::Ref(t.flat(*wlu, node.scaled(nu), nu)));
            Some(Expr::read(t.flat(*wlx, Affine::lit(n * nx), nx)))
        }
    };
    args.push(Arg::Index(node));
    r.push(Stmt::for_loop("runObj", 0, n, vec![Stmt::call(SET_STAGE_F, args)]));

    let qn2 = block_at(plan, &b.qn2, &Affine::lit(0), nx);
    let gradient = Expr::mul(qn2, Expr::read(t.whole(a.dy_n)));
    r.push(Stmt::assign(
        t.whole(a.qpqf),
        match terminal_linear {
            Some(l) => Expr::add(gradient, l),
            None => gradient,
        },
    ));

    if let (Some(dx_ac), Some(x_ac), Some(s_ac)) = (a.dx_ac, a.x_ac, a.s_ac) {
        r.comment("Arrival cost");
        r.push(Stmt::assign(
            t.whole(dx_ac),
            Expr::sub(
                Expr::read(t.flat(a.x, Affine::lit(0), nx)),
                Expr::read(t.whole(x_ac)),
            ),
        ));
        let first = t.rows(a.qp_q, Affine::lit(0), nx);
        match b.q1.given() {
            // qpQ holds the constant Q1; rebuild it so SAC is not accumulated.
            Some(q1) => r.push(Stmt::assign(
                first,
                Expr::add(Expr::Const(q1.clone()), Expr::read(t.whole(s_ac))),
            )),
            None => r.push(Stmt::add_assign(first, Expr::read(t.whole(s_ac)))),
        }
        r.push(Stmt::add_assign(
            t.flat(a.qpq, Affine::lit(0), nx),
            Expr::mul(Expr::read(t.whole(s_ac)), Expr::read(t.whole(dx_ac))),
        ));
    }

    r.push(Stmt::call_external(External::QpSolve, vec![], Some(ret)));

    r.push(Stmt::add_assign(
        t.flat(a.x, Affine::lit(0), (n + 1) * nx),
        Expr::read(t.whole(a.qpx)),
    ));
    r.push(Stmt::add_assign(
        t.flat(a.u, Affine::lit(0), n * nu),
        Expr::read(t.whole(a.qpu)),
    ));
    r
}

/// KKT tolerance of the current iterate.
pub fn get_kkt(problem: &Problem, plan: &StoragePlan) -> Routine {
    let (n, nx, nu) = (problem.dims.n, problem.dims.nx, problem.dims.nu);
    let dim_htot = problem.dim_htot();
    let t = &plan.table;
    let a = &plan.arrays;

    let mut r = Routine::new(GET_KKT).with_doc("Get the KKT tolerance of the current iterate");
    let kkt = r.returns("kkt", ElemKind::Real);
    let tmp = r.local("tmp", 1, 1, ElemKind::Real);
    r.push(Stmt::assign(kkt.clone(), Expr::Const(DMatrix::zeros(1, 1))));

    let dot = |v: Window, w: Window| Expr::mul(Expr::read(v).t(), Expr::read(w));
    for value in [
        dot(t.whole(a.qpq), t.flat(a.qpx, Affine::lit(0), n * nx)),
        dot(t.whole(a.qpqf), t.flat(a.qpx, Affine::lit(n * nx), nx)),
        dot(t.whole(a.qpr), t.whole(a.qpu)),
    ] {
        r.push(Stmt::assign(tmp.clone(), value));
        r.push(Stmt::add_assign(kkt.clone(), Expr::abs(Expr::read(tmp.clone()))));
    }

    let index = Affine::var("index");
    let product = |v: ArrayId, v_off: usize, w: ArrayId, w_off: usize| {
        Stmt::add_assign(
            kkt.clone(),
            Expr::abs(Expr::mul(
                Expr::read(t.flat(v, index.plus(v_off), 1)),
                Expr::read(t.flat(w, index.plus(w_off), 1)),
            )),
        )
    };
    r.push(Stmt::for_loop("index", 0, n * nx, vec![product(a.d, 0, a.qp_lambda, 0)]));

    // Inequality multipliers are only checked with a fixed initial state.
    // TODO: add the bound and affine terms for a free initial state, where qpMu
    // also covers the x_0 box rows.
    if problem.flags.initial_state_fixed {
        let nb = n * (nu + nx);
        r.push(Stmt::for_loop("index", 0, nb, vec![product(a.qp_lb, 0, a.qp_mu, 0)]));
        r.push(Stmt::for_loop("index", 0, nb, vec![product(a.qp_ub, 0, a.qp_mu, nb)]));
        if dim_htot > 0 {
            r.push(Stmt::for_loop(
                "index",
                0,
                dim_htot,
                vec![product(a.qp_lba, 0, a.qp_mu, 2 * nb)],
            ));
            r.push(Stmt::for_loop(
                "index",
                0,
                dim_htot,
                vec![product(a.qp_uba, 0, a.qp_mu, 2 * nb + dim_htot)],
            ));
        }
    }
    r
}

/// Arrival-cost recursion; present only when the arrival cost is used.
pub fn update_arrival_cost(problem: &Problem, plan: &StoragePlan) -> Option<Routine> {
    if !problem.flags.use_arrival_cost {
        return None;
    }
    let t = &plan.table;
    let a = &plan.arrays;
    let (wl, x_ac, s_ac) = (a.wl?, a.x_ac?, a.s_ac?);
    let mut r = Routine::new(UPDATE_ARRIVAL_COST)
        .with_doc("Update the arrival cost; reset = 1 restarts from the current weighting");
    r.index_param("reset", 2);
    let ret = r.returns("ret", ElemKind::Int);
    r.push(Stmt::call_external(
        External::ArrivalCostBackend,
        vec![
            Arg::Index(Affine::var("reset")),
            Arg::Ref(t.whole(wl)),
            Arg::Ref(t.whole(x_ac)),
            Arg::Ref(t.whole(s_ac)),
        ],
        Some(ret),
    ));
    Some(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Callee;
    use crate::storage::plan_storage;
    use crate::validate::tests::base_config;
    use crate::validate::validate;

    fn setup(cfg: &crate::config::ProblemConfig) -> (Problem, StoragePlan) {
        let problem = validate(cfg).problem.unwrap();
        let plan = plan_storage(&problem).plan.unwrap();
        (problem, plan)
    }

    #[test]
    fn preparation_calls_in_order() {
        let (problem, plan) = setup(&base_config());
        let r = build_phase(Phase::Preparation, &problem, &plan);
        assert_eq!(
            r.callees(),
            vec![
                &Callee::External(External::ModelSimulation),
                &Callee::Routine(EVALUATE_OBJECTIVE.to_string()),
                &Callee::Routine(EVALUATE_CONSTRAINTS.to_string()),
            ]
        );
        assert!(r.ret.is_some());
    }

    #[test]
    fn feedback_fixed_state_starts_with_state_feedback() {
        let (problem, plan) = setup(&base_config());
        let r = build_phase(Phase::Feedback, &problem, &plan);
        match &r.body[0] {
            Stmt::Assign { dst, .. } => assert_eq!(dst.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!r.body.iter().any(|s| matches!(s, Stmt::Comment(_))));
        assert_eq!(
            r.callees().last(),
            Some(&&Callee::External(External::QpSolve))
        );
    }

    #[test]
    fn feedback_free_state_adds_arrival_cost() {
        let mut cfg = base_config();
        cfg.flags.initial_state_fixed = false;
        let (problem, plan) = setup(&cfg);
        let r = build_phase(Phase::Feedback, &problem, &plan);
        let pos = r
            .body
            .iter()
            .position(|s| matches!(s, Stmt::Comment(c) if c == "Arrival cost"))
            .unwrap();
        // Q1 is given: the first block is rebuilt, not accumulated.
        match &r.body[pos + 2] {
            Stmt::Assign { op, .. } => assert_eq!(*op, crate::ir::AssignOp::Set),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn kkt_skips_inequalities_for_free_initial_state() {
        let (fixed, plan) = setup(&base_config());
        let loops = |r: &Routine| r.body.iter().filter(|s| matches!(s, Stmt::For { .. })).count();
        assert_eq!(loops(&get_kkt(&fixed, &plan)), 3);

        let mut cfg = base_config();
        cfg.flags.initial_state_fixed = false;
        let (free, plan) = setup(&cfg);
        assert_eq!(loops(&get_kkt(&free, &plan)), 1);
    }

    #[test]
    fn arrival_cost_routine_only_when_requested() {
        let mut cfg = base_config();
        cfg.flags.initial_state_fixed = false;
        let (problem, plan) = setup(&cfg);
        assert!(update_arrival_cost(&problem, &plan).is_none());

        cfg.flags.use_arrival_cost = true;
        let (problem, plan) = setup(&cfg);
        let r = update_arrival_cost(&problem, &plan).unwrap();
        assert_eq!(r.params[0].name, "reset");
        assert_eq!(
            r.callees(),
            vec![&Callee::External(External::ArrivalCostBackend)]
        );
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Preparation.routine_name(), PREPARATION);
        assert_eq!(Phase::Feedback.routine_name(), FEEDBACK);
    }
}
