// constraints.rs — Constraint Assembler
//
// Builds `evaluateConstraints`: box bounds relative to the current
// trajectory, path constraints evaluated in one loop over the horizon, and
// point constraints evaluated on their declaring nodes. Affine bounds are
// written through the shared `setStagePac` subroutine.
//
// Preconditions: a `StoragePlan` produced for the same `Problem`.
// Postconditions: `qpLb/qpUb` cover all N*(NU+NX) box rows; `qpLbA/qpUbA`
//   cover dim_htot rows, path rows of a node before its point rows.
// Failure modes: none (shapes are fixed by the plan).
// Side effects: none.

use crate::ir::{Affine, Arg, Expr, External, Routine, Section, Stmt};
use crate::objective::load_node_input;
use crate::storage::{ArrayId, StorageClass, StoragePlan};
use crate::validate::Problem;

pub const EVALUATE_CONSTRAINTS: &str = "evaluateConstraints";
pub const SET_STAGE_PAC: &str = "setStagePac";

const LOOP: &str = "runPac";

pub fn assemble_constraints(problem: &Problem, plan: &StoragePlan) -> Section {
    let asm = ConstraintAssembler { problem, plan };
    let mut routines = Vec::new();
    routines.extend(asm.set_stage_pac());
    routines.push(asm.evaluate_constraints());
    Section {
        routines,
        init: asm.init(),
    }
}

struct ConstraintAssembler<'a> {
    problem: &'a Problem,
    plan: &'a StoragePlan,
}

impl ConstraintAssembler<'_> {
    /// `qpLbA[offset..] = lbA - pacEvH[ind*dim..]`, same for the upper side.
    fn set_stage_pac(&self) -> Option<Routine> {
        let pc = self.problem.path.as_ref()?;
        let h = self.plan.arrays.pac_ev_h?;
        let t = &self.plan.table;
        let a = &self.plan.arrays;
        let dim = pc.dim;

        let mut r = Routine::new(SET_STAGE_PAC).with_doc("Affine bounds of one node's path constraint");
        // Largest segment start is dim_htot - dim.
        r.index_param("offset", self.problem.dim_htot() - dim + 1);
        r.index_param("ind", self.problem.dims.n);
        let lb = r.array_param("lbA", dim, 1);
        let ub = r.array_param("ubA", dim, 1);
        let offset = Affine::var("offset");
        let value = Expr::read(t.flat(h, Affine::var("ind").scaled(dim), dim));
        r.push(Stmt::assign(
            t.flat(a.qp_lba, offset.clone(), dim),
            Expr::sub(Expr::read(lb), value.clone()),
        ));
        r.push(Stmt::assign(
            t.flat(a.qp_uba, offset, dim),
            Expr::sub(Expr::read(ub), value),
        ));
        Some(r)
    }

    fn evaluate_constraints(&self) -> Routine {
        let p = self.problem;
        let (n, nx, nu) = (p.dims.n, p.dims.nx, p.dims.nu);
        let t = &self.plan.table;
        let a = &self.plan.arrays;
        let mut r = Routine::new(EVALUATE_CONSTRAINTS)
            .with_doc("Box and affine constraint data of the QP");

        // Box bounds: controls of nodes 0..N, then states of nodes 1..=N.
        let (cu, cx) = (n * nu, n * nx);
        for (qp, values) in [(a.qp_lb, a.lb_values), (a.qp_ub, a.ub_values)] {
            r.push(Stmt::assign(
                t.flat(qp, Affine::lit(0), cu),
                Expr::sub(
                    Expr::read(t.flat(values, Affine::lit(0), cu)),
                    Expr::read(t.flat(a.u, Affine::lit(0), cu)),
                ),
            ));
            r.push(Stmt::assign(
                t.flat(qp, Affine::lit(cu), cx),
                Expr::sub(
                    Expr::read(t.flat(values, Affine::lit(cu), cx)),
                    Expr::read(t.flat(a.x, Affine::lit(nx), cx)),
                ),
            ));
        }

        let (Some(cin), Some(cout)) = (a.con_value_in, a.con_value_out) else {
            return r;
        };

        if let (Some(pc), Some(h)) = (&p.path, a.pac_ev_h) {
            let dim = pc.dim;
            let node = Affine::var(LOOP);
            let mut body = load_node_input(self.plan, p, cin, &node, true);
            body.push(Stmt::call_external(
                External::Constraint(pc.name.clone()),
                vec![Arg::Ref(t.whole(cin)), Arg::Ref(t.whole(cout))],
                None,
            ));
            body.push(Stmt::assign(
                t.flat(h, node.scaled(dim), dim),
                Expr::read(t.flat(cout, Affine::lit(0), dim)),
            ));
            let mut at = dim;
            if let Some(hx) = a.pac_ev_hx {
                body.push(Stmt::assign(
                    t.rows(hx, node.scaled(dim), dim),
                    Expr::read(t.dense(cout, Affine::lit(at), dim, nx)),
                ));
                at += dim * nx;
            }
            if let Some(hu) = a.pac_ev_hu {
                body.push(Stmt::assign(
                    t.rows(hu, node.scaled(dim), dim),
                    Expr::read(t.dense(cout, Affine::lit(at), dim, nu)),
                ));
            }
            r.push(Stmt::for_loop(LOOP, 0, n, body));

            if let (Some(lba), Some(uba)) = (a.lba_values, a.uba_values) {
                for i in 0..n {
                    let off = p.affine_offset(i);
                    r.push(Stmt::call(
                        SET_STAGE_PAC,
                        vec![
                            Arg::Index(Affine::lit(off)),
                            Arg::Index(Affine::lit(i)),
                            Arg::Ref(t.flat(lba, Affine::lit(off), dim)),
                            Arg::Ref(t.flat(uba, Affine::lit(off), dim)),
                        ],
                    ));
                }
            }
        }

        let mut row = 0;
        for (&i, pc) in &p.points {
            let dim = pc.dim;
            let interior = i < n;
            let node = Affine::lit(i);
            r.comment(format!("Evaluating constraint on node: #{}", i));
            for s in load_node_input(self.plan, p, cin, &node, interior) {
                r.push(s);
            }
            r.push(Stmt::call_external(
                External::Constraint(pc.name.clone()),
                vec![Arg::Ref(t.whole(cin)), Arg::Ref(t.whole(cout))],
                None,
            ));
            if let (Some(h), Some(hx), Some(hu)) = (a.poc_ev_h, a.poc_ev_hx, a.poc_ev_hu) {
                r.push(Stmt::assign(
                    t.flat(h, Affine::lit(row), dim),
                    Expr::read(t.flat(cout, Affine::lit(0), dim)),
                ));
                r.push(Stmt::assign(
                    t.rows(hx, Affine::lit(row), dim),
                    Expr::read(t.dense(cout, Affine::lit(dim), dim, nx)),
                ));
                if interior {
                    r.push(Stmt::assign(
                        t.rows(hu, Affine::lit(row), dim),
                        Expr::read(t.dense(cout, Affine::lit(dim + dim * nx), dim, nu)),
                    ));
                }
                if let (Some(lba), Some(uba)) = (a.lba_values, a.uba_values) {
                    let off = p.affine_offset(i) + if interior { p.dim_pac() } else { 0 };
                    let value = Expr::read(t.flat(h, Affine::lit(row), dim));
                    for (qp, bound) in [(a.qp_lba, lba), (a.qp_uba, uba)] {
                        r.push(Stmt::assign(
                            t.flat(qp, Affine::lit(off), dim),
                            Expr::sub(Expr::read(t.flat(bound, Affine::lit(off), dim)), value.clone()),
                        ));
                    }
                }
            }
            row += dim;
        }
        r
    }

    /// Fill runtime bound arrays from the configured values.
    fn init(&self) -> Vec<Stmt> {
        let t = &self.plan.table;
        let a = &self.plan.arrays;
        let p = self.problem;
        let mut out = Vec::new();
        let mut fill = |id: Option<ArrayId>, values: &nalgebra::DVector<f64>| {
            let Some(id) = id else { return };
            if t.get(id).class == StorageClass::Variable {
                out.push(Stmt::assign(
                    t.whole(id),
                    Expr::Const(nalgebra::DMatrix::from_column_slice(
                        values.len(),
                        1,
                        values.as_slice(),
                    )),
                ));
            }
        };
        fill(Some(a.lb_values), &p.box_bounds.lower);
        fill(Some(a.ub_values), &p.box_bounds.upper);
        fill(a.lba_values, &p.affine_bounds.lower);
        fill(a.uba_values, &p.affine_bounds.upper);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathConstraintSpec, PointConstraintSpec};
    use crate::ir::Callee;
    use crate::storage::plan_storage;
    use crate::validate::tests::base_config;
    use crate::validate::validate;

    fn assemble(cfg: &crate::config::ProblemConfig) -> Section {
        let problem = validate(cfg).problem.unwrap();
        let plan = plan_storage(&problem).plan.unwrap();
        assemble_constraints(&problem, &plan)
    }

    fn point(name: &str, width: usize, dim: usize) -> PointConstraintSpec {
        PointConstraintSpec {
            name: name.to_string(),
            output_width: width,
            lower: vec![-1.0; dim],
            upper: vec![1.0; dim],
        }
    }

    #[test]
    fn box_bounds_only() {
        let section = assemble(&base_config());
        assert_eq!(section.routines.len(), 1);
        let r = &section.routines[0];
        assert_eq!(r.name, EVALUATE_CONSTRAINTS);
        assert_eq!(r.body.len(), 4);
        assert!(r.callees().is_empty());
        // lbValues and ubValues filled at initialization
        assert_eq!(section.init.len(), 2);
    }

    #[test]
    fn hardcoded_bounds_need_no_initialization() {
        let mut cfg = base_config();
        cfg.flags.hardcode_constraints = true;
        cfg.point_constraints.insert(2, point("pc2", 4, 1));
        assert!(assemble(&cfg).init.is_empty());
    }

    #[test]
    fn point_constraints_in_node_order() {
        let mut cfg = base_config();
        cfg.point_constraints.insert(3, point("pcEnd", 3, 1));
        cfg.point_constraints.insert(1, point("pcMid", 8, 2));
        let section = assemble(&cfg);
        let r = &section.routines[0];
        let comments: Vec<&str> = r
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Comment(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            comments,
            vec!["Evaluating constraint on node: #1", "Evaluating constraint on node: #3"]
        );
        let callees = r.callees();
        assert_eq!(
            callees,
            vec![
                &Callee::External(External::Constraint("pcMid".to_string())),
                &Callee::External(External::Constraint("pcEnd".to_string())),
            ]
        );
        // box, 4 affine bound arrays: lbValues, ubValues, lbAValues, ubAValues
        assert_eq!(section.init.len(), 4);
    }

    #[test]
    fn path_constraint_uses_shared_subroutine() {
        let mut cfg = base_config();
        cfg.path_constraint = Some(PathConstraintSpec {
            name: "pac".to_string(),
            dim: 1,
            lower: vec![-1.0],
            upper: vec![1.0],
            jacobian_x: None,
            jacobian_u: Some(vec![vec![1.0]]),
        });
        let section = assemble(&cfg);
        assert_eq!(section.routines[0].name, SET_STAGE_PAC);
        let eval = &section.routines[1];
        let pac_calls = eval
            .callees()
            .into_iter()
            .filter(|c| **c == Callee::Routine(SET_STAGE_PAC.to_string()))
            .count();
        assert_eq!(pac_calls, 3);
        assert_eq!(eval.loop_vars(), vec![LOOP]);
    }

    #[test]
    fn multi_row_path_constraint_segments_fit() {
        use crate::pass::StageCert;
        use crate::pipeline::{run_pipeline, GenerationState};

        let mut cfg = base_config();
        cfg.dims.n = 4;
        cfg.path_constraint = Some(PathConstraintSpec {
            name: "pac".to_string(),
            dim: 2,
            lower: vec![-1.0, -2.0],
            upper: vec![1.0, 2.0],
            jacobian_x: None,
            jacobian_u: None,
        });
        cfg.point_constraints.insert(1, point("pcMid", 8, 2));
        cfg.point_constraints.insert(4, point("pcEnd", 3, 1));

        let mut state = GenerationState::new(cfg);
        let result = run_pipeline(&mut state, crate::pass::PassId::Assemble, false, |_, _| {});
        assert!(result.is_ok(), "{:?}", state.diagnostics);
        assert!(state.artifacts.cert.as_ref().unwrap().all_pass());

        let program = state.artifacts.program.as_ref().unwrap();
        assert_eq!(program.con_dim, vec![2, 4, 2, 2, 1]);
        let pac = program.routine(SET_STAGE_PAC).unwrap();
        assert_eq!(
            pac.params[0].kind,
            crate::ir::ParamKind::Index { bound: 10 }
        );

        // Segment starts: path rows of each node, then the node's point rows.
        let eval = program.routine(EVALUATE_CONSTRAINTS).unwrap();
        let offsets: Vec<usize> = eval
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Call {
                    callee: Callee::Routine(name),
                    args,
                    ..
                } if name == SET_STAGE_PAC => match &args[0] {
                    Arg::Index(a) => Some(a.constant),
                    Arg::Ref(_) => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 2, 6, 8]);
        let qp_lba = program.table.find("qpLbA").unwrap();
        assert_eq!(program.table.get(qp_lba).len(), 11);
    }
}
