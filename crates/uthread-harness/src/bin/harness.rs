//! CLI entrypoint for the uthread stress harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use uthread_core::trace;
use uthread_harness::HarnessError;
use uthread_harness::scenarios::{self, Options, SCENARIOS};
use uthread_harness::structured_log::{ArtifactIndex, LogEmitter, LogLevel, validate_log_file};

#[derive(Debug, Parser)]
#[command(name = "uthread-harness")]
#[command(about = "Stress scenarios for the uthread runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run scenarios and report pass/fail.
    Run {
        /// Scenario to run; repeat for several. Runs all when omitted.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x5EED0001")]
        seed: String,
        /// Rounds for the randomized condvar scenario.
        #[arg(long, default_value_t = 10_000)]
        rounds: u64,
        /// Most yields injected at one scheduling point.
        #[arg(long, default_value_t = 3)]
        max_yields: u32,
        /// Largest contender count for the fairness sweep.
        #[arg(long, default_value_t = 16)]
        fairness_max: usize,
        /// JSONL log path. Scheduler trace events are included when set.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index path (requires --log).
        #[arg(long, requires = "log")]
        artifact_index: Option<PathBuf>,
    },
    /// Validate a JSONL log written by `run`.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// List scenario names.
    List,
}

fn parse_seed(raw: &str) -> Option<u64> {
    let raw = raw.trim().replace('_', "");
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn run(
    names: Vec<String>,
    opts: &Options,
    log: Option<PathBuf>,
    artifact_index: Option<PathBuf>,
) -> Result<bool, HarnessError> {
    let names = if names.is_empty() {
        SCENARIOS.iter().map(|s| (*s).to_string()).collect()
    } else {
        names
    };
    let run_id = format!("uthread-{:x}", opts.seed);
    let mut emitter = match &log {
        Some(path) => Some(LogEmitter::to_file(path, &run_id)?),
        None => None,
    };

    let mut all_passed = true;
    for name in &names {
        drop(trace::drain());
        let report = scenarios::run_named(name, opts)?;
        let verdict = if report.passed() { "PASS" } else { "FAIL" };
        println!(
            "{verdict} {:<14} rounds={:<6} failures={:<4} {}ms",
            report.name, report.rounds, report.failures, report.duration_ms
        );
        if let Some(first) = &report.first_failure {
            println!("    first failure: {first}");
        }
        all_passed &= report.passed();
        if let Some(emitter) = emitter.as_mut() {
            emitter.emit_trace(&trace::drain())?;
            emitter.emit_report(&report)?;
        }
    }

    if let Some(mut emitter) = emitter {
        let level = if all_passed { LogLevel::Info } else { LogLevel::Error };
        emitter.emit(level, "run_end")?;
        emitter.flush()?;
    }
    if let (Some(log), Some(index_path)) = (log, artifact_index) {
        let mut index = ArtifactIndex::new(run_id);
        index.add_file(&log, "log")?;
        std::fs::write(&index_path, index.to_json()?)?;
    }
    Ok(all_passed)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            scenarios,
            seed,
            rounds,
            max_yields,
            fairness_max,
            log,
            artifact_index,
        } => {
            let Some(seed) = parse_seed(&seed) else {
                eprintln!("invalid seed: {seed}");
                return ExitCode::from(2);
            };
            let opts = Options {
                seed,
                rounds,
                max_yields,
                fairness_max,
                trace: log.is_some(),
            };
            match run(scenarios, &opts, log, artifact_index) {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => {
                    eprintln!("harness error: {e}");
                    ExitCode::from(2)
                }
            }
        }
        Command::ValidateLog { log } => match validate_log_file(&log) {
            Ok((lines, errors)) if errors.is_empty() => {
                println!("{lines} lines valid");
                ExitCode::SUCCESS
            }
            Ok((lines, errors)) => {
                for e in &errors {
                    eprintln!("{e}");
                }
                eprintln!("{} errors in {lines} lines", errors.len());
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("cannot read {}: {e}", log.display());
                ExitCode::from(2)
            }
        },
        Command::List => {
            for name in SCENARIOS {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
    }
}
