// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the generator's passes, their dependency edges, and the artifacts
// they produce. Used by the pipeline runner to compute minimal pass subsets
// for each --emit target. Loading the problem description is outside the
// runner.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Validate,
    Plan,
    Objective,
    Constraints,
    Phases,
    Assemble,
    Codegen,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the generation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Problem,            // Problem
    Plan,               // StoragePlan
    ObjectiveSection,   // Section
    ConstraintSection,  // Section
    PhaseSection,       // Section
    Program,            // Program
    ProgramCert,        // ProgramCert
    Generated,          // GeneratedCode
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a generator pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            outputs: &[ArtifactId::Problem],
            invalidation_key: "problem description",
            invariants: "shapes agree with dimensions, bounds stacked",
        },
        PassId::Plan => PassDescriptor {
            name: "plan",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::Plan],
            invalidation_key: "problem",
            invariants: "every array declared once, given blocks own no storage",
        },
        PassId::Objective => PassDescriptor {
            name: "objective",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::ObjectiveSection],
            invalidation_key: "problem + plan",
            invariants: "one setObj routine per computed block",
        },
        PassId::Constraints => PassDescriptor {
            name: "constraints",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::ConstraintSection],
            invalidation_key: "problem + plan",
            invariants: "box and affine rows cover qpLb/qpUb and qpLbA/qpUbA",
        },
        PassId::Phases => PassDescriptor {
            name: "phases",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::PhaseSection],
            invalidation_key: "problem + plan",
            invariants: "updateArrivalCost iff arrival cost is used",
        },
        PassId::Assemble => PassDescriptor {
            name: "assemble",
            inputs: &[PassId::Objective, PassId::Constraints, PassId::Phases],
            outputs: &[ArtifactId::Program, ArtifactId::ProgramCert],
            invalidation_key: "plan + sections",
            invariants: "A1-A5 obligations verified",
        },
        PassId::Codegen => PassDescriptor {
            name: "codegen",
            inputs: &[PassId::Assemble],
            outputs: &[ArtifactId::Generated],
            invalidation_key: "program + provenance",
            invariants: "valid C emitted",
        },
    }
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable evidence that a stage met its postconditions.
pub trait StageCert {
    fn all_pass(&self) -> bool {
        self.obligations().iter().all(|(_, ok)| *ok)
    }

    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 7] = [
    PassId::Validate,
    PassId::Plan,
    PassId::Objective,
    PassId::Constraints,
    PassId::Phases,
    PassId::Assemble,
    PassId::Codegen,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_plan_is_minimal() {
        assert_eq!(
            required_passes(PassId::Plan),
            vec![PassId::Validate, PassId::Plan]
        );
    }

    #[test]
    fn required_passes_codegen_includes_all() {
        let passes = required_passes(PassId::Codegen);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn assemble_needs_every_section() {
        let passes = required_passes(PassId::Assemble);
        assert!(passes.contains(&PassId::Objective));
        assert!(passes.contains(&PassId::Constraints));
        assert!(passes.contains(&PassId::Phases));
        assert!(!passes.contains(&PassId::Codegen));
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let order = required_passes(*pass);
            let self_pos = order.iter().position(|p| p == pass).unwrap();
            for dep in descriptor(*pass).inputs {
                let dep_pos = order.iter().position(|p| p == dep).unwrap();
                assert!(
                    dep_pos < self_pos,
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }

    struct Fixed(bool, bool);

    impl StageCert for Fixed {
        fn obligations(&self) -> Vec<(&'static str, bool)> {
            vec![("first", self.0), ("second", self.1)]
        }
    }

    #[test]
    fn cert_passes_only_when_every_obligation_holds() {
        assert!(Fixed(true, true).all_pass());
        assert!(!Fixed(true, false).all_pass());
    }
}
