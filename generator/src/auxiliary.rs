// auxiliary.rs — Auxiliary solver routines
//
// Routines around the RTI phases that the control loop calls directly:
// workspace initialization, trajectory initialization by forward simulation,
// horizon shifting and objective evaluation.
//
// Preconditions: a `StoragePlan` produced for the same `Problem`.
// Postconditions: `initialize` zeroes every WORKSPACE array before filling
//   given QP data and runtime bound values.
// Failure modes: none.
// Side effects: none.

use nalgebra::DMatrix;

use crate::ir::{Affine, Arg, Expr, External, Routine, Stmt};
use crate::objective::{load_node_input, weight_window};
use crate::storage::{ElemKind, StorageClass, StoragePlan};
use crate::validate::Problem;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZE_NODES: &str = "initializeNodes";
pub const SHIFT_STATES: &str = "shiftStates";
pub const SHIFT_CONTROLS: &str = "shiftControls";
pub const GET_OBJECTIVE: &str = "getObjective";

/// Zero the workspace, then run the assemblers' initialization statements.
pub fn initialize(plan: &StoragePlan, init: Vec<Stmt>) -> Routine {
    let mut r = Routine::new(INITIALIZE).with_doc("Initialize the solver workspace");
    let ret = r.returns("ret", ElemKind::Int);
    for (id, a) in plan.table.iter() {
        if a.class == StorageClass::Workspace {
            r.push(Stmt::Clear(id));
        }
    }
    for s in init {
        r.push(s);
    }
    r.push(Stmt::assign(ret, Expr::Const(DMatrix::zeros(1, 1))));
    r
}

/// Forward-simulate the current controls from `x_0` to fill `x_1..x_N`.
pub fn initialize_nodes(problem: &Problem, plan: &StoragePlan) -> Routine {
    let (n, nx) = (problem.dims.n, problem.dims.nx);
    let t = &plan.table;
    let a = &plan.arrays;
    let index = Affine::var("index");

    let mut body = load_node_input(plan, problem, a.state, &index, true);
    body.push(Stmt::call_external(
        External::Integrate,
        vec![Arg::Ref(t.whole(a.state)), Arg::Index(index.clone())],
        None,
    ));
    body.push(Stmt::assign(
        t.flat(a.x, index.scaled(nx).plus(nx), nx),
        Expr::read(t.flat(a.state, Affine::lit(0), nx)),
    ));

    let mut r = Routine::new(INITIALIZE_NODES)
        .with_doc("Initialize shooting nodes by forward simulation");
    r.push(Stmt::for_loop("index", 0, n, body));
    r
}

pub fn shift_states(problem: &Problem, plan: &StoragePlan) -> Routine {
    let (n, nx) = (problem.dims.n, problem.dims.nx);
    let t = &plan.table;
    let x = plan.arrays.x;
    let index = Affine::var("index");

    let mut r = Routine::new(SHIFT_STATES).with_doc("Shift states one node back; xEnd becomes x_N");
    let x_end = r.array_param("xEnd", nx, 1);
    r.push(Stmt::for_loop(
        "index",
        0,
        n,
        vec![Stmt::assign(
            t.flat(x, index.scaled(nx), nx),
            Expr::read(t.flat(x, index.scaled(nx).plus(nx), nx)),
        )],
    ));
    r.push(Stmt::assign(t.flat(x, Affine::lit(n * nx), nx), Expr::read(x_end)));
    r
}

pub fn shift_controls(problem: &Problem, plan: &StoragePlan) -> Routine {
    let (n, nu) = (problem.dims.n, problem.dims.nu);
    let t = &plan.table;
    let u = plan.arrays.u;
    let index = Affine::var("index");

    let mut r =
        Routine::new(SHIFT_CONTROLS).with_doc("Shift controls one node back; uEnd becomes u_{N-1}");
    let u_end = r.array_param("uEnd", nu, 1);
    if n > 1 {
        r.push(Stmt::for_loop(
            "index",
            0,
            n - 1,
            vec![Stmt::assign(
                t.flat(u, index.scaled(nu), nu),
                Expr::read(t.flat(u, index.scaled(nu).plus(nu), nu)),
            )],
        ));
    }
    r.push(Stmt::assign(
        t.flat(u, Affine::lit((n - 1) * nu), nu),
        Expr::read(u_end),
    ));
    r
}

/// `0.5 * (sum Dy_i' S_i Dy_i + DyN' SN DyN)` with freshly evaluated residuals.
pub fn get_objective(problem: &Problem, plan: &StoragePlan) -> Routine {
    let (n, ny, nyn) = (problem.dims.n, problem.dims.ny, problem.dims.nyn);
    let t = &plan.table;
    let a = &plan.arrays;
    let node = Affine::var("lRun1");

    let mut r = Routine::new(GET_OBJECTIVE)
        .with_doc("Objective value at the current iterate");
    let obj = r.returns("objVal", ElemKind::Real);
    let dy = r.local("tmpDy", ny, 1, ElemKind::Real);
    let dy_n = r.local("tmpDyN", nyn, 1, ElemKind::Real);
    r.push(Stmt::assign(obj.clone(), Expr::Const(DMatrix::zeros(1, 1))));

    let s = match &problem.weight {
        Some(m) => Expr::Const(m.clone()),
        None => match weight_window(plan, problem, &node) {
            Some(w) => Expr::read(w),
            None => Expr::Const(DMatrix::identity(ny, ny)),
        },
    };
    let mut body = load_node_input(plan, problem, a.obj_value_in, &node, true);
    body.push(Stmt::call_external(
        External::StageCost,
        vec![
            Arg::Ref(t.whole(a.obj_value_in)),
            Arg::Ref(t.whole(a.obj_value_out)),
        ],
        None,
    ));
    body.push(Stmt::assign(
        dy.clone(),
        Expr::sub(
            Expr::read(t.flat(a.obj_value_out, Affine::lit(0), ny)),
            Expr::read(t.flat(a.y, node.scaled(ny), ny)),
        ),
    ));
    body.push(Stmt::add_assign(
        obj.clone(),
        Expr::mul(Expr::mul(Expr::read(dy.clone()).t(), s), Expr::read(dy)),
    ));
    r.push(Stmt::for_loop("lRun1", 0, n, body));

    for stmt in load_node_input(plan, problem, a.obj_value_in, &Affine::lit(n), false) {
        r.push(stmt);
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
        dy_n.clone(),
        Expr::sub(
            Expr::read(t.flat(a.obj_value_out, Affine::lit(0), nyn)),
            Expr::read(t.whole(a.y_n)),
        ),
    ));
    let sn = match (&problem.terminal_weight, a.w_n) {
        (Some(m), _) => Expr::Const(m.clone()),
        (None, Some(wn)) => Expr::read(t.whole(wn)),
        (None, None) => Expr::Const(DMatrix::identity(nyn, nyn)),
    };
    r.push(Stmt::add_assign(
        obj.clone(),
        Expr::mul(Expr::mul(Expr::read(dy_n.clone()).t(), sn), Expr::read(dy_n)),
    ));
    r.push(Stmt::assign(
        obj.clone(),
        Expr::mul(Expr::scalar(0.5), Expr::read(obj)),
    ));
    r
}
