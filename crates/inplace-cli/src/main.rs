mod completion;
mod dispatch;
mod render;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::dispatch::run_cli;
use crate::render::{print_output, OutputStyle};

#[derive(Parser, Debug)]
#[command(name = "inplace")]
#[command(version, about = "Staged in-place updater for self-hosted web applications", long_about = None)]
struct Cli {
    /// Root directory of the live installation.
    #[arg(long, global = true, env = "INPLACE_ROOT", default_value = ".")]
    root: PathBuf,
    /// Updater config file; defaults to `<root>/inplace.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print log lines with status badges instead of JSON.
    #[arg(long, global = true)]
    human: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Receive a package archive into the staging area.
    Stage {
        file: PathBuf,
        /// Size announced by the uploader; defaults to the file length.
        #[arg(long)]
        size: Option<u64>,
        #[arg(long, env = "INPLACE_TOKEN", hide_env_values = true, default_value = "")]
        token: String,
        #[arg(long, env = "INPLACE_SECRET", hide_env_values = true, default_value = "")]
        secret: String,
    },
    /// Unpack the staged package and locate its root.
    Extract(ContextArgs),
    /// Back up protected paths, overwrite the live tree, restore and migrate.
    Install(ContextArgs),
    /// Remove staged and scratch files for an update and release its lock.
    Cleanup(ContextArgs),
    /// Busy-wait to check that the host lets long operations finish.
    Probe {
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
    },
    /// Print the protected-path manifest.
    Policy,
    /// Remove staged packages and scratch directories older than a threshold.
    Sweep {
        #[arg(long, default_value_t = 86_400)]
        max_age_secs: u64,
    },
    /// Clear a stale update lock.
    Unlock {
        #[arg(long)]
        force: bool,
    },
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug)]
struct ContextArgs {
    /// Output of the previous step (or its `context`), as a file path or `-` for stdin.
    #[arg(long)]
    context: String,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        return match completion::write_completions_script(*shell, &mut io::stdout()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::from(1)
            }
        };
    }

    let human = cli.human;
    match run_cli(cli) {
        Ok(output) => {
            let style = if human {
                Some(OutputStyle::current())
            } else {
                None
            };
            if let Err(err) = print_output(&output, style) {
                eprintln!("error: {err:#}");
                return ExitCode::from(1);
            }
            ExitCode::from(output.exit.code())
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
