//! Command-line interface for the drift round-off error analyzer.

use clap::{Parser, Subcommand};
use drift_exec::{Config, Interpreter};
use drift_ir::{parse_module, Module, TripCounts};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] drift_ir::ParseError),

    #[error(transparent)]
    Exec(#[from] drift_exec::ExecError),
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "drift", version)]
#[command(about = "Round-off error analysis over a symbolic IR interpreter", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a program and print the error-bound report
    Run {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Entry function
        #[arg(long, default_value = "main")]
        entry: String,

        /// Enable the loop-breaking protocol
        #[arg(long)]
        loop_breaking: bool,

        /// Per-state step budget
        #[arg(long, default_value_t = 1 << 20)]
        max_steps: u64,
    },

    /// Show the constant-trip-count loops of a module
    Loops {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load(path: &Path) -> CliResult<Module> {
    let source = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_module(&source)?)
}

fn dispatch(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Commands::Run {
            file,
            entry,
            loop_breaking,
            max_steps,
        } => {
            let module = load(&file)?;
            let trips = TripCounts::analyze(&module);
            info!(
                functions = module.functions.len(),
                loops = trips.retained(),
                loop_breaking,
                "module loaded"
            );
            let mut interp = Interpreter::new(
                &module,
                trips,
                Config {
                    loop_breaking,
                    max_steps,
                },
            );
            let outcome = interp.run(&entry)?;
            for state in &outcome.completed {
                let report = state.errors.output();
                if !report.is_empty() {
                    println!("{report}");
                }
            }
            for (id, err) in &outcome.aborted {
                eprintln!("state {id} aborted: {err}");
            }
            if outcome.aborted.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Loops { file } => {
            let module = load(&file)?;
            let trips = TripCounts::analyze(&module);
            if trips.retained() == 0 {
                println!("no constant-trip loops");
                return Ok(ExitCode::SUCCESS);
            }
            for (header, entry) in trips.header_blocks() {
                if let Some(info) = trips.trip_count_of(entry) {
                    let func = &module.functions[header.func as usize];
                    let header_name = &func.blocks[header.block as usize].name;
                    let exit_name = &module.block(info.exit).name;
                    println!(
                        "{}: loop at `{}` runs {} time(s), exits to `{}`",
                        func.name, header_name, info.trip_count, exit_name
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
