use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod run;
mod workflow_file;

/// Exit codes: 0 success, 1 validation error, 2 run failure, 3 internal
/// error, 4 timeout/cancel.
pub(crate) const EXIT_OK: i32 = 0;
pub(crate) const EXIT_VALIDATION: i32 = 1;
pub(crate) const EXIT_RUN_FAILED: i32 = 2;
pub(crate) const EXIT_INTERNAL: i32 = 3;
pub(crate) const EXIT_CANCELED: i32 = 4;

#[derive(Parser)]
#[command(name = "stevedore", version, about = "Container workflow orchestrator")]
struct Cli {
    /// Path to stevedore.toml.
    #[arg(long, global = true, default_value = "stevedore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow file without running anything.
    Validate {
        /// Workflow TOML file.
        file: PathBuf,
    },
    /// Submit a workflow file and wait for the run to finish.
    Run {
        /// Workflow TOML file.
        file: PathBuf,

        /// Workflow parameters as `key=value`, repeatable.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Override the local artifact store base directory.
        #[arg(long)]
        store_base: Option<PathBuf>,

        /// Append run events to this JSONL file.
        #[arg(long)]
        events: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    stevedore_core::init_tracing();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Validate { file } => match workflow_file::load(&file) {
            Ok(loaded) => {
                println!(
                    "workflow '{}' is valid ({} nodes)",
                    loaded.workflow.workflow_id,
                    loaded.workflow.nodes.len()
                );
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_VALIDATION
            }
        },
        Command::Run { file, params, store_base, events } => {
            run::run(run::RunArgs {
                config: cli.config,
                file,
                params,
                store_base,
                events,
            })
            .await
        }
    };

    std::process::exit(code);
}
