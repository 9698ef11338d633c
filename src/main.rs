//! Sequencer CLI Entry Point
//!
//! Provides command-line interface for sequence execution against the
//! simulated control system.
//!
//! # Usage
//!
//! ```bash
//! # Execute a sequence
//! sequencer run beam_setup.yaml
//!
//! # Confirm every step before it runs
//! sequencer run beam_setup.yaml --mode step-by-step
//!
//! # Dry run mode (resolve steps without touching the control system)
//! sequencer run beam_setup.yaml --mode dry-run
//!
//! # Check a sequence file
//! sequencer validate beam_setup.yaml
//!
//! # Write the demo sequence
//! sequencer example beam_setup.yaml
//! ```

use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use sequencer::control::{SimulatedControl, SimulationConfig};
use sequencer::execution::{
    ExecutionEvent, ExecutionMode, ExecutionState, Executor, ExecutorConfig, Phase, StepOutcome,
};
use sequencer::sequence::{load_sequence, save_sequence, FailurePolicy, Sequence};
use sequencer::{APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "sequencer")]
#[command(version, about = "Control sequence execution engine")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a sequence against the simulated control system
    Run(RunArgs),
    /// Check a sequence file without running it
    Validate {
        file: PathBuf,
    },
    /// Write the beam setup demo sequence
    Example {
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Sequence file (.yaml, .yml or .json)
    file: PathBuf,

    #[arg(long, value_enum, default_value = "normal")]
    mode: ModeArg,

    /// Keep going after a failed step
    #[arg(long)]
    continue_on_failure: bool,

    /// YAML file with executor and simulation settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the execution timeline after the run
    #[arg(long)]
    timeline: bool,

    /// Write the final state as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Normal,
    StepByStep,
    DryRun,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Normal => ExecutionMode::Normal,
            ModeArg::StepByStep => ExecutionMode::StepByStep,
            ModeArg::DryRun => ExecutionMode::DryRun,
        }
    }
}

/// Settings file: executor tunables at the top level plus a
/// `simulation:` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    executor: ExecutorConfig,
    simulation: SimulationConfig,
}

/// JSON run report written with `--report`.
#[derive(Serialize)]
struct ReportFile<'a> {
    sequence: &'a str,
    state: &'a ExecutionState,
    step_durations_ms: BTreeMap<String, u128>,
}

/// Operator input while a step-by-step run is paused.
enum OperatorCommand {
    Resume,
    Stop,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Control Sequence Execution Engine");
    println!();
}

fn load_config(path: &Path) -> Result<FileConfig, Box<dyn Error>> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Could not read config '{}': {}", path.display(), e))?;
    let config = serde_yaml::from_str(&content)
        .map_err(|e| format!("Invalid config '{}': {}", path.display(), e))?;
    info!("Configuration: {}", path.display());
    Ok(config)
}

/// Reads operator commands from stdin on a dedicated thread.
///
/// An empty line resumes, `q` stops.
fn spawn_operator_input() -> UnboundedReceiver<OperatorCommand> {
    let (tx, rx) = unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let command = if line.trim().eq_ignore_ascii_case("q") {
                OperatorCommand::Stop
            } else {
                OperatorCommand::Resume
            };
            if tx.send(command).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_event(event: &ExecutionEvent, total: usize, step_by_step: bool) {
    match event {
        ExecutionEvent::RunStarted { total_steps, .. } => {
            println!("{} {} steps", "Running".bold(), total_steps);
            println!();
        }
        ExecutionEvent::StepStarted { index, step_id } => {
            println!("[{}/{}] {} ...", index + 1, total, step_id.cyan());
        }
        ExecutionEvent::StepRetrying {
            attempt, reason, ..
        } => {
            println!("      {} attempt {}: {}", "retry".yellow(), attempt, reason);
        }
        ExecutionEvent::StepFinished {
            index,
            step_id,
            outcome,
        } => match outcome {
            StepOutcome::Succeeded => println!("      {}", "ok".green()),
            StepOutcome::Failed(failure) => println!("      {} {}", "failed".red().bold(), failure),
            StepOutcome::Skipped => {
                println!("[{}/{}] {} {}", index + 1, total, step_id, "skipped".dimmed())
            }
            other => println!("      {}", other),
        },
        ExecutionEvent::Paused { index } => {
            println!("{} before step {}", "Paused".yellow().bold(), index + 1);
            if step_by_step {
                println!("Press Enter to continue or 'q' then Enter to stop");
            }
        }
        ExecutionEvent::Resumed { index } => {
            println!("{} at step {}", "Resumed".green(), index + 1);
        }
        ExecutionEvent::RunFinished { phase, stats } => {
            let label = match phase {
                Phase::Completed => phase.to_string().green().bold(),
                Phase::Stopped => phase.to_string().yellow().bold(),
                _ => phase.to_string().red().bold(),
            };
            println!();
            println!("Run {}: {}", label, stats);
        }
    }
}

fn write_report(
    path: &Path,
    sequence: &Sequence,
    state: &ExecutionState,
    durations: BTreeMap<String, u128>,
) -> Result<(), Box<dyn Error>> {
    let report = ReportFile {
        sequence: &sequence.metadata.name,
        state,
        step_durations_ms: durations,
    };
    fs::write(path, serde_json::to_string_pretty(&report)?)?;
    info!("Report written: {}", path.display());
    Ok(())
}

async fn run_sequence(args: RunArgs) -> Result<Phase, Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };

    info!("Loading sequence: {}", args.file.display());
    let mut sequence = load_sequence(&args.file)
        .map_err(|e| format!("Could not load sequence from '{}': {}", args.file.display(), e))?;

    if args.continue_on_failure {
        sequence.failure_policy = FailurePolicy::Continue;
    }

    let mode = ExecutionMode::from(args.mode);
    info!(
        "Sequence loaded: '{}' ({} steps, on failure: {:?}, mode: {})",
        sequence.metadata.name,
        sequence.len(),
        sequence.failure_policy,
        mode
    );
    if mode == ExecutionMode::DryRun {
        info!("Mode: DRY RUN (control system will not be touched)");
    }
    println!();

    let control = Arc::new(SimulatedControl::new(config.simulation));
    let (tx, mut events) = unbounded_channel();
    let mut executor = Executor::new(control, tx).with_config(config.executor);

    let step_by_step = mode == ExecutionMode::StepByStep;
    let mut operator = if step_by_step {
        spawn_operator_input()
    } else {
        unbounded_channel().1
    };

    executor.start(&sequence, mode)?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, sequence.len(), step_by_step);
                if event.is_terminal() {
                    break;
                }
            }
            Some(command) = operator.recv() => {
                let result = match command {
                    OperatorCommand::Resume => executor.resume(),
                    OperatorCommand::Stop => executor.stop(),
                };
                if let Err(e) = result {
                    warn!("{}", e);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Could not listen for Ctrl-C: {}", e);
                    continue;
                }
                warn!("Interrupted - stopping run");
                if let Err(e) = executor.stop() {
                    warn!("{}", e);
                }
            }
        }
    }

    let report = executor.wait().await?;

    if args.timeline {
        print!("{}", report.timeline.gantt_chart());
    }

    if let Some(path) = &args.report {
        let durations = report
            .timeline
            .durations()
            .into_iter()
            .map(|(id, duration)| (id, duration.as_millis()))
            .collect();
        write_report(path, &sequence, &report.state, durations)?;
    }

    Ok(report.state.phase)
}

fn validate(file: &Path) -> Result<(), Box<dyn Error>> {
    let sequence = load_sequence(file)?;
    println!(
        "{} '{}' ({} steps, {} enabled)",
        "Valid".green().bold(),
        sequence.metadata.name,
        sequence.len(),
        sequence.enabled_steps().len()
    );
    Ok(())
}

/// Main application entry point.
fn run() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Command::Run(args) => {
            print_banner();
            let runtime = tokio::runtime::Runtime::new()?;
            let phase = runtime.block_on(run_sequence(args))?;
            Ok(if phase == Phase::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Validate { file } => {
            validate(&file)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Example { output } => {
            save_sequence(&Sequence::example(), &output)?;
            println!("Example sequence written to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
