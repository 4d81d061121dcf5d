use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rtigen::*;
use std::path::Path;

// Generation latency on the demo problems and on growing horizons.

fn load_demo(name: &str) -> config::ProblemConfig {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("generator crate lives inside the workspace");
    config::ProblemConfig::load(&root.join("demos").join(name))
        .expect("benchmark demo must load")
}

fn scenarios() -> [(&'static str, config::ProblemConfig); 2] {
    [
        ("double_integrator", load_demo("double_integrator.json")),
        ("mhe_arrival_cost", load_demo("mhe_arrival_cost.json")),
    ]
}

fn generate_full(cfg: config::ProblemConfig) -> codegen::GeneratedCode {
    let mut state = pipeline::GenerationState::new(cfg);
    pipeline::run_pipeline(&mut state, pass::PassId::Codegen, false, |_, _| {})
        .expect("benchmark scenario must generate");
    state
        .artifacts
        .generated
        .expect("codegen artifact present")
}

// Full generation: validate -> plan -> assemble -> codegen.
fn bench_full_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_generation");

    for (name, cfg) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &cfg, |b, cfg| {
            b.iter_batched(
                || cfg.clone(),
                |cfg| black_box(generate_full(cfg)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// Phase-level latency on the MHE demo.
fn bench_phase_latency(c: &mut Criterion) {
    let cfg = load_demo("mhe_arrival_cost.json");
    let mut group = c.benchmark_group("kpi/phase_latency");

    group.bench_function("validate", |b| {
        b.iter(|| black_box(validate::validate(black_box(&cfg))));
    });

    let problem = validate::validate(&cfg)
        .problem
        .expect("benchmark demo must validate");
    group.bench_function("plan", |b| {
        b.iter(|| black_box(storage::plan_storage(black_box(&problem))));
    });

    let plan = storage::plan_storage(&problem)
        .plan
        .expect("benchmark demo must plan");
    group.bench_function("assemble", |b| {
        b.iter(|| {
            let objective = objective::assemble_objective(&problem, &plan);
            let constraints = constraints::assemble_constraints(&problem, &plan);
            let phases = rti::assemble_phases(&problem, &plan);
            black_box(program::assemble_program(
                &problem,
                &plan,
                objective,
                constraints,
                phases,
            ))
        });
    });

    let program = program::assemble_program(
        &problem,
        &plan,
        objective::assemble_objective(&problem, &plan),
        constraints::assemble_constraints(&problem, &plan),
        rti::assemble_phases(&problem, &plan),
    );
    group.bench_function("verify", |b| {
        b.iter(|| black_box(program::verify_program(black_box(&program), true)));
    });
    group.bench_function("codegen", |b| {
        b.iter(|| black_box(codegen::codegen(black_box(&program), "")));
    });

    group.finish();
}

// Generation time as the horizon grows; codegen unrolls per-node statements.
fn bench_horizon_scaling(c: &mut Criterion) {
    let base = load_demo("double_integrator.json");
    let mut group = c.benchmark_group("kpi/horizon_scaling");

    for n in [10usize, 50, 100] {
        let mut cfg = base.clone();
        cfg.dims.n = n;
        cfg.bounds = config::BoundsSpec::default();
        group.bench_with_input(BenchmarkId::from_parameter(n), &cfg, |b, cfg| {
            b.iter_batched(
                || cfg.clone(),
                |cfg| black_box(generate_full(cfg)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_full_generation,
    bench_phase_latency,
    bench_horizon_scaling,
);
criterion_main!(benches);
