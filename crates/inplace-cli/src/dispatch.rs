use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use inplace_core::{PipelineContext, ProtectedPath, UpdaterConfig};
use inplace_installer::{
    force_release_update_lock, read_update_lock, sweep_stale_artifacts, AbandonFlag,
    UpdateLayout, UpdatePipeline, Upload,
};
use inplace_security::SharedSecretVerifier;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::render::ProbeProgress;
use crate::{Cli, Commands, ContextArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CliExit {
    Success,
    Failure,
    Critical,
}

impl CliExit {
    pub(crate) fn from_result(success: bool, critical: bool) -> Self {
        if critical {
            Self::Critical
        } else if success {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Critical => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) json: Value,
    pub(crate) log: Vec<String>,
    pub(crate) exit: CliExit,
}

impl CommandOutput {
    fn new<T: Serialize>(
        response: &T,
        log: Vec<String>,
        success: bool,
        critical: bool,
    ) -> Result<Self> {
        let json = serde_json::to_value(response).context("failed to encode command result")?;
        Ok(Self {
            json,
            log,
            exit: CliExit::from_result(success, critical),
        })
    }
}

#[derive(Debug, Serialize)]
struct PolicyResponse<'a> {
    success: bool,
    protected_paths: &'a [ProtectedPath],
}

#[derive(Debug, Serialize)]
struct SweepResponse {
    success: bool,
    log: Vec<String>,
    removed: Vec<std::path::PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped_for_lock: Option<String>,
}

#[derive(Debug, Serialize)]
struct UnlockResponse {
    success: bool,
    log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    holder: Option<String>,
}

pub(crate) fn run_cli(cli: Cli) -> Result<CommandOutput> {
    let config = load_config(cli.config.as_deref(), &cli.root)?;
    let no_proof = SharedSecretVerifier::new("");

    match cli.command {
        Commands::Stage {
            file,
            size,
            token,
            secret,
        } => {
            let verifier = SharedSecretVerifier::new(&secret);
            let pipeline = UpdatePipeline::new(&cli.root, config, &verifier)?;
            let handle = File::open(&file)
                .with_context(|| format!("failed to open package: {}", file.display()))?;
            let declared_size = match size {
                Some(size) => size,
                None => handle
                    .metadata()
                    .with_context(|| format!("failed to stat package: {}", file.display()))?
                    .len(),
            };
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            let response = pipeline.stage(Upload {
                file_name: &file_name,
                declared_size,
                proof: &token,
                reader: BufReader::new(handle),
            });
            CommandOutput::new(&response, response.log.clone(), response.success, false)
        }
        Commands::Extract(args) => {
            let pipeline = UpdatePipeline::new(&cli.root, config, &no_proof)?;
            let response = pipeline.extract(read_context(&args)?);
            CommandOutput::new(&response, response.log.clone(), response.success, false)
        }
        Commands::Install(args) => {
            let pipeline = UpdatePipeline::new(&cli.root, config, &no_proof)?;
            let response = pipeline.install(read_context(&args)?);
            CommandOutput::new(
                &response,
                response.log.clone(),
                response.success,
                response.critical,
            )
        }
        Commands::Cleanup(args) => {
            let pipeline = UpdatePipeline::new(&cli.root, config, &no_proof)?;
            let response = pipeline.cleanup(&read_context(&args)?);
            CommandOutput::new(&response, response.log.clone(), response.success, false)
        }
        Commands::Probe { seconds } => {
            let pipeline = UpdatePipeline::new(&cli.root, config, &no_proof)?;
            let flag = AbandonFlag::new();
            let handler_flag = flag.clone();
            if let Err(err) = ctrlc::set_handler(move || handler_flag.mark_abandoned()) {
                warn!(error = %err, "Ctrl-C handler unavailable; abandonment goes unnoticed");
            }

            let mut progress = ProbeProgress::start(seconds, cli.human);
            let response = pipeline.probe(seconds, &flag, |elapsed| progress.set(elapsed));
            progress.finish();

            let mut log = Vec::new();
            match &response.error {
                Some(error) => log.push(format!("error: {error}")),
                None => log.push(format!(
                    "probe ran {:.3}s of {:.3}s requested",
                    response.elapsed, response.requested
                )),
            }
            if response.abandoned {
                log.push("warning: caller went away during the probe; kept running".to_string());
            }
            CommandOutput::new(&response, log, response.success, false)
        }
        Commands::Policy => {
            let policy = config.policy()?;
            let log = policy
                .entries()
                .iter()
                .map(|entry| format!("{:<9} {}", entry.kind.as_str(), entry.relative_path))
                .collect::<Vec<_>>();
            let response = PolicyResponse {
                success: true,
                protected_paths: policy.entries(),
            };
            CommandOutput::new(&response, log, true, false)
        }
        Commands::Sweep { max_age_secs } => {
            let layout = UpdateLayout::resolve(&cli.root, &config)?;
            let report = sweep_stale_artifacts(
                &layout,
                Duration::from_secs(max_age_secs),
                SystemTime::now(),
            )?;
            let mut log = report.log;
            if report.removed.is_empty() && report.skipped_for_lock.is_none() {
                log.push("nothing to sweep".to_string());
            }
            let response = SweepResponse {
                success: true,
                log: log.clone(),
                removed: report.removed,
                skipped_for_lock: report.skipped_for_lock,
            };
            CommandOutput::new(&response, log, true, false)
        }
        Commands::Unlock { force } => {
            let layout = UpdateLayout::resolve(&cli.root, &config)?;
            let response = unlock(&layout, force)?;
            CommandOutput::new(&response, response.log.clone(), response.success, false)
        }
        Commands::Completions { .. } => {
            bail!("completions are written by the entry point, not the pipeline dispatcher")
        }
    }
}

fn unlock(layout: &UpdateLayout, force: bool) -> Result<UnlockResponse> {
    if !force {
        let holder = read_update_lock(layout)?;
        let (success, line) = match &holder {
            Some(holder) => (
                false,
                format!("error: update lock held by {holder}; rerun with --force to clear it"),
            ),
            None => (true, "no update lock present".to_string()),
        };
        return Ok(UnlockResponse {
            success,
            log: vec![line],
            holder,
        });
    }

    let holder = force_release_update_lock(layout)?;
    let line = match &holder {
        Some(holder) => format!("warning: cleared update lock held by {holder}"),
        None => "no update lock present".to_string(),
    };
    Ok(UnlockResponse {
        success: true,
        log: vec![line],
        holder,
    })
}

fn load_config(config_path: Option<&Path>, root: &Path) -> Result<UpdaterConfig> {
    match config_path {
        Some(path) => UpdaterConfig::load(path),
        None => UpdaterConfig::load_for_root(root),
    }
}

fn read_context(args: &ContextArgs) -> Result<PipelineContext> {
    let raw = if args.context == "-" {
        let mut raw = String::new();
        io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read context from stdin")?;
        raw
    } else {
        fs::read_to_string(&args.context)
            .with_context(|| format!("failed to read context file: {}", args.context))?
    };
    parse_context(&raw)
}

/// Accepts either a bare context or the full JSON result of the previous step.
pub(crate) fn parse_context(raw: &str) -> Result<PipelineContext> {
    let value: Value = serde_json::from_str(raw).context("context is not valid JSON")?;
    let value = match value.get("context") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ if value.get("success") == Some(&Value::Bool(false)) => {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("previous step failed and produced no context: {error}");
        }
        _ => value,
    };
    serde_json::from_value(value).context("JSON does not describe a pipeline context")
}
