// pipeline.rs — Generation state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId.
//
// Preconditions: the problem description is loaded into the state.
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: any pass emitting error-level diagnostics; program
//   verification failure (E0600).
// Side effects: calls on_pass_complete callback after each pass for immediate display.

use std::time::Instant;

use crate::codegen::GeneratedCode;
use crate::config::ProblemConfig;
use crate::diag::codes;
use crate::diag::{DiagLevel, Diagnostic};
use crate::ir::Section;
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::program::{Program, ProgramCert};
use crate::storage::StoragePlan;
use crate::validate::Problem;

// ── Artifact storage ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Artifacts {
    pub problem: Option<Problem>,
    pub plan: Option<StoragePlan>,
    pub objective: Option<Section>,
    pub constraints: Option<Section>,
    pub phases: Option<Section>,
    pub program: Option<Program>,
    pub cert: Option<ProgramCert>,
    pub generated: Option<GeneratedCode>,
}

/// Provenance metadata stamped into the generated source.
///
/// `config_hash`: SHA-256 of `ProblemConfig::canonical_json()`.
/// `generator_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub config_hash: [u8; 32],
    pub generator_version: &'static str,
}

impl Provenance {
    /// Hex string of the configuration hash (64 characters).
    pub fn config_hash_hex(&self) -> String {
        bytes_to_hex(&self.config_hash)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        let value = serde_json::json!({
            "config_hash": self.config_hash_hex(),
            "manifest_schema_version": 1,
            "generator_version": self.generator_version,
        });
        let mut s = serde_json::to_string_pretty(&value).unwrap_or_default();
        s.push('\n');
        s
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Compute provenance from the parsed problem description.
///
/// Hashes the canonical compact JSON rather than the input text, so
/// formatting and key order of the input file do not matter.
pub fn compute_provenance(config: &ProblemConfig) -> Provenance {
    use sha2::{Digest, Sha256};

    let config_hash = {
        let mut hasher = Sha256::new();
        hasher.update(config.canonical_json().as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    };

    Provenance {
        config_hash,
        generator_version: env!("CARGO_PKG_VERSION"),
    }
}

/// Holds all generation artifacts and accumulated diagnostics.
pub struct GenerationState {
    pub config: ProblemConfig,
    pub artifacts: Artifacts,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl GenerationState {
    pub fn new(config: ProblemConfig) -> Self {
        Self {
            config,
            artifacts: Artifacts::default(),
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `GenerationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

// ── Helper: check diagnostics for errors ───────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
/// Returns Err if error diagnostics found.
fn finish_pass(
    state: &mut GenerationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "rtigen: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// An upstream artifact is absent: the pass cannot run.
fn missing(state: &mut GenerationState, pass_id: PassId) -> PipelineError {
    state.has_error = true;
    PipelineError {
        failing_pass: pass_id,
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose → error check.
///
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are populated,
///   or `state.has_error` is true.
/// Failure modes: any pass producing error-level diagnostics; program cert failure.
/// Side effects: calls `on_pass_complete` after each pass for immediate diagnostic display.
pub fn run_pipeline(
    state: &mut GenerationState,
    terminal: PassId,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    if state.provenance.is_none() {
        state.provenance = Some(compute_provenance(&state.config));
    }

    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Validate => {
                let result = crate::validate::validate(&state.config);
                state.artifacts.problem = result.problem;
                result.diagnostics
            }
            PassId::Plan => {
                let Some(problem) = state.artifacts.problem.as_ref() else {
                    return Err(missing(state, pass_id));
                };
                let result = crate::storage::plan_storage(problem);
                state.artifacts.plan = result.plan;
                result.diagnostics
            }
            PassId::Objective | PassId::Constraints | PassId::Phases => {
                let (Some(problem), Some(plan)) =
                    (state.artifacts.problem.as_ref(), state.artifacts.plan.as_ref())
                else {
                    return Err(missing(state, pass_id));
                };
                let section = match pass_id {
                    PassId::Objective => crate::objective::assemble_objective(problem, plan),
                    PassId::Constraints => crate::constraints::assemble_constraints(problem, plan),
                    _ => crate::rti::assemble_phases(problem, plan),
                };
                let slot = match pass_id {
                    PassId::Objective => &mut state.artifacts.objective,
                    PassId::Constraints => &mut state.artifacts.constraints,
                    _ => &mut state.artifacts.phases,
                };
                *slot = Some(section);
                Vec::new()
            }
            PassId::Assemble => {
                let a = &mut state.artifacts;
                let (Some(problem), Some(plan), Some(objective), Some(constraints), Some(phases)) = (
                    a.problem.as_ref(),
                    a.plan.as_ref(),
                    a.objective.take(),
                    a.constraints.take(),
                    a.phases.take(),
                ) else {
                    return Err(missing(state, pass_id));
                };
                let program =
                    crate::program::assemble_program(problem, plan, objective, constraints, phases);
                // Verify program postconditions (A1-A5)
                let cert = crate::program::verify_program(&program, problem.flags.use_arrival_cost);
                let mut diags = Vec::new();
                if cert.a2_references_declared && !cert.a3_windows_in_bounds {
                    for name in crate::program::out_of_bounds_routines(&program) {
                        diags.push(
                            Diagnostic::error(codes::E0301, "window outside its array")
                                .with_subject(format!("routine {}", name)),
                        );
                    }
                }
                if !cert.all_pass() {
                    let failed: Vec<_> = cert
                        .obligations()
                        .iter()
                        .filter(|(_, ok)| !ok)
                        .map(|(name, _)| *name)
                        .collect();
                    diags.push(Diagnostic::error(
                        codes::E0600,
                        format!("program verification failed: {}", failed.join(", ")),
                    ));
                }
                a.program = Some(program);
                a.cert = Some(cert);
                diags
            }
            PassId::Codegen => {
                let Some(program) = state.artifacts.program.as_ref() else {
                    return Err(missing(state, pass_id));
                };
                let provenance = state
                    .provenance
                    .as_ref()
                    .map(Provenance::config_hash_hex)
                    .unwrap_or_default();
                state.artifacts.generated = Some(crate::codegen::codegen(program, &provenance));
                Vec::new()
            }
        };
        let elapsed = t.elapsed();
        finish_pass(
            state,
            pass_id,
            diags,
            elapsed,
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::tests::base_config;

    fn run(config: ProblemConfig, terminal: PassId) -> (GenerationState, Result<(), PipelineError>, Vec<PassId>) {
        let mut state = GenerationState::new(config);
        let mut seen = Vec::new();
        let result = run_pipeline(&mut state, terminal, false, |pass, _| seen.push(pass));
        (state, result, seen)
    }

    #[test]
    fn full_pipeline_produces_code() {
        let (state, result, seen) = run(base_config(), PassId::Codegen);
        assert!(result.is_ok(), "{:?}", state.diagnostics);
        assert_eq!(seen, crate::pass::ALL_PASSES.to_vec());
        assert!(state.artifacts.cert.as_ref().unwrap().all_pass());
        let code = state.artifacts.generated.as_ref().unwrap();
        let hex = state.provenance.as_ref().unwrap().config_hash_hex();
        assert!(code.source.contains(&hex));
    }

    #[test]
    fn plan_terminal_skips_assembly() {
        let (state, result, seen) = run(base_config(), PassId::Plan);
        assert!(result.is_ok());
        assert_eq!(seen, vec![PassId::Validate, PassId::Plan]);
        assert!(state.artifacts.plan.is_some());
        assert!(state.artifacts.program.is_none());
    }

    #[test]
    fn validation_error_stops_pipeline() {
        let mut cfg = base_config();
        cfg.dims.nx = 0;
        let (state, result, seen) = run(cfg, PassId::Codegen);
        assert_eq!(result.unwrap_err().failing_pass, PassId::Validate);
        assert!(state.has_error);
        assert_eq!(seen, vec![PassId::Validate]);
        assert!(state.artifacts.generated.is_none());
    }

    #[test]
    fn provenance_is_stable_and_sensitive() {
        let a = compute_provenance(&base_config());
        let b = compute_provenance(&base_config());
        assert_eq!(a.config_hash, b.config_hash);
        assert_eq!(a.config_hash_hex().len(), 64);

        let mut cfg = base_config();
        cfg.dims.n = 4;
        assert_ne!(compute_provenance(&cfg).config_hash, a.config_hash);
    }

    #[test]
    fn build_info_is_json() {
        let p = compute_provenance(&base_config());
        let v: serde_json::Value = serde_json::from_str(&p.to_json()).unwrap();
        assert_eq!(v["config_hash"], p.config_hash_hex());
        assert_eq!(v["manifest_schema_version"], 1);
    }
}
