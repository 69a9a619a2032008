//! The `stevedore run` command: build the store and runtime, execute the
//! workflow, report a JSON summary, map the outcome to an exit code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stevedore_core::config::{load_config, StevedoreConfig, StoreBackend};
use stevedore_core::engine::Engine;
use stevedore_core::model::{RunIds, RunResult};
use stevedore_core::runner::ContainerStepExecutor;
use stevedore_core::runtime::DockerRuntime;
use stevedore_core::store::{purge_expired, ArtifactStore, LocalStore, S3Store};
use stevedore_core::{Error, ErrorKind};

use crate::workflow_file;
use crate::{EXIT_CANCELED, EXIT_INTERNAL, EXIT_OK, EXIT_RUN_FAILED, EXIT_VALIDATION};

pub struct RunArgs {
    pub config: PathBuf,
    pub file: PathBuf,
    pub params: Vec<String>,
    pub store_base: Option<PathBuf>,
    pub events: Option<PathBuf>,
}

pub async fn run(args: RunArgs) -> i32 {
    match try_run(args).await {
        Ok(result) => {
            match serde_json::to_string_pretty(&summary(&result)) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to render summary: {e}"),
            }
            if result.success {
                EXIT_OK
            } else if result.canceled {
                EXIT_CANCELED
            } else {
                EXIT_RUN_FAILED
            }
        }
        Err(e) => {
            eprintln!("{e}");
            match e.kind() {
                ErrorKind::Validation | ErrorKind::Conditional => EXIT_VALIDATION,
                ErrorKind::Canceled => EXIT_CANCELED,
                _ => EXIT_INTERNAL,
            }
        }
    }
}

async fn try_run(args: RunArgs) -> Result<RunResult, Error> {
    let mut config = load_config(&args.config)?;
    if let Some(base) = args.store_base {
        config.store.backend = StoreBackend::Local;
        config.store.base_dir = base;
    }

    let loaded = workflow_file::load(&args.file)?;
    let params = merge_params(loaded.params, &args.params)?;

    let store = build_store(&config).await?;

    let runtime = DockerRuntime::connect()?;
    let executor = ContainerStepExecutor::new(Arc::new(runtime), config.runner_config());

    let mut engine = Engine::new(executor)
        .with_store(store)
        .with_config(config.engine_config());
    if let Some(path) = &args.events {
        engine = engine.with_event_log(path)?;
    }

    // Ctrl-C cancels the run; running containers drain and exit handlers
    // still fire.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, canceling run");
            signal_cancel.cancel();
        }
    });

    let ids = RunIds::generate(loaded.workflow.workflow_id.clone());
    info!(workflow_id = %ids.workflow_id, run_id = %ids.run_id, file = %args.file.display(), "submitting workflow");

    let result = engine
        .execute_run(&loaded.workflow, &params, ids, cancel)
        .await?;

    // Opportunistic retention sweep over the local store.
    if config.store.backend == StoreBackend::Local && config.run.artifact_retention_days > 0 {
        match purge_expired(&config.store.base_dir, config.run.artifact_retention_days) {
            Ok(removed) if removed > 0 => info!(removed, "expired run artifacts purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }

    Ok(result)
}

async fn build_store(config: &StevedoreConfig) -> Result<Arc<dyn ArtifactStore>, Error> {
    match config.store.backend {
        StoreBackend::Local => Ok(Arc::new(LocalStore::new(config.store.base_dir.clone()))),
        StoreBackend::S3 => Ok(Arc::new(S3Store::connect(&config.store.s3).await?)),
    }
}

fn merge_params(
    mut params: HashMap<String, String>,
    overrides: &[String],
) -> Result<HashMap<String, String>, Error> {
    for pair in overrides {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::Validation(format!(
                "parameter '{pair}' is not 'key=value'"
            )));
        };
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

fn summary(result: &RunResult) -> serde_json::Value {
    serde_json::json!({
        "workflow_id": result.workflow_id,
        "run_id": result.run_id,
        "success": result.success,
        "canceled": result.canceled,
        "succeeded": result.succeeded,
        "failed": result.failed,
        "skipped": result.skipped,
        "duration_ms": result.duration_ms,
        "nodes": result.node_results.iter().map(|r| serde_json::json!({
            "node": r.node,
            "status": r.status,
            "exit_code": r.exit_code,
            "error": r.error,
            "outputs": r.outputs,
        })).collect::<Vec<_>>(),
        "handlers": result.handler_results.iter().map(|r| serde_json::json!({
            "node": r.node,
            "success": r.success,
            "error": r.error,
        })).collect::<Vec<_>>(),
    })
}
