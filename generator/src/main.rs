use clap::Parser;
use std::path::{Path, PathBuf};

use rtigen::config::ProblemConfig;
use rtigen::pass::PassId;
use rtigen::pipeline::{compute_provenance, run_pipeline, GenerationState};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    /// C header and source of the solver
    C,
    /// Storage plan: arrays by class and block decisions
    Plan,
    /// Assembled routines
    Ir,
    /// Provenance manifest (JSON)
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "rtigen",
    version,
    about = "RTI Gauss-Newton solver generator — emits NMPC/MHE solver routines in C"
)]
struct Cli {
    /// Problem description (JSON)
    problem: PathBuf,

    /// Output file; the C header is written next to it. Defaults to stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::C)]
    emit: EmitStage,

    /// Print generator passes and timing
    #[arg(long)]
    verbose: bool,
}

fn write_or_exit(path: &Path, text: &str) {
    if let Err(e) = std::fs::write(path, text) {
        eprintln!("rtigen: error: {}: {}", path.display(), e);
        std::process::exit(2);
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        eprintln!("rtigen: problem = {}", cli.problem.display());
        if let Some(out) = &cli.output {
            eprintln!("rtigen: output  = {}", out.display());
        }
        eprintln!("rtigen: emit    = {:?}", cli.emit);
    }

    // ── Load problem description ──
    let config = match ProblemConfig::load(&cli.problem) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rtigen: error: {}", e);
            std::process::exit(2);
        }
    };

    let terminal = match cli.emit {
        EmitStage::BuildInfo => {
            let text = compute_provenance(&config).to_json();
            match &cli.output {
                Some(path) => write_or_exit(path, &text),
                None => print!("{}", text),
            }
            return;
        }
        EmitStage::Plan => PassId::Plan,
        EmitStage::Ir => PassId::Assemble,
        EmitStage::C => PassId::Codegen,
    };

    // ── Run passes ──
    let mut state = GenerationState::new(config);
    let result = run_pipeline(&mut state, terminal, cli.verbose, |_, diags| {
        for d in diags {
            eprintln!("rtigen: {}", d);
        }
    });
    if let Err(e) = result {
        if cli.verbose {
            eprintln!("rtigen: stopped at pass {:?}", e.failing_pass);
        }
        std::process::exit(1);
    }

    let artifacts = &state.artifacts;
    let text = match cli.emit {
        EmitStage::Plan => artifacts.plan.as_ref().map(|p| p.to_string()),
        EmitStage::Ir => artifacts.program.as_ref().map(|p| p.to_string()),
        EmitStage::C => match (&artifacts.generated, &cli.output) {
            (Some(code), Some(path)) => {
                let header = path.with_file_name(&code.header_name);
                write_or_exit(&header, &code.header);
                write_or_exit(path, &code.source);
                if cli.verbose {
                    eprintln!("rtigen: wrote {} and {}", header.display(), path.display());
                }
                return;
            }
            (Some(code), None) => Some(code.combined()),
            (None, _) => None,
        },
        EmitStage::BuildInfo => None,
    };
    let Some(text) = text else {
        eprintln!("rtigen: error: no output produced");
        std::process::exit(1);
    };
    match &cli.output {
        Some(path) => write_or_exit(path, &text),
        None => print!("{}", text),
    }
}
