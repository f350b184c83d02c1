//! Subcommand implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use docloader::{EngineSettings, Exceptions, LoadTask, Request, StateStore};

use crate::plan::Plan;
use crate::summary::{render_result, render_summary};

/// Executes a plan's tasks in order inside one request.
pub async fn run(plan_path: PathBuf, store: PathBuf, threads: Option<usize>) -> Result<()> {
    let plan = Plan::load(&plan_path)?;
    eprintln!("Loaded plan from: {}", plan_path.display());

    let mut settings = plan.settings.clone().unwrap_or_default();
    settings.apply_env(|name| std::env::var(name).ok())?;
    if let Some(threads) = threads {
        settings.max_threads = threads;
    }
    settings.validate()?;

    let store = StateStore::open(&store)?;
    let request = Arc::new(Request::new(store, settings));
    cancel_on_ctrl_c(request.clone());

    for spec in plan.task_specs() {
        let operation = spec.operation;
        let task = LoadTask::configure(request.clone(), spec)
            .await
            .with_context(|| format!("Failed to configure '{operation}' task"))?;
        let summary = task
            .run()
            .await
            .with_context(|| format!("Task {} failed", task.result_seed()))?;
        println!("{}", render_summary(&summary));
        if summary.cancelled {
            break;
        }
    }

    println!();
    println!("request id: {}", request.id());
    Ok(())
}

/// Reruns one task of a saved request.
pub async fn rerun(store: PathBuf, request_id: String, result_seed: String) -> Result<()> {
    let request = load_request(store, &request_id)?;
    cancel_on_ctrl_c(request.clone());
    let summary = LoadTask::rerun(request, &result_seed)
        .await
        .with_context(|| format!("Rerun of {result_seed} failed"))?;
    println!("{}", render_summary(&summary));
    Ok(())
}

/// Applies an exception policy to one task of a saved request.
pub async fn retry(store: PathBuf, request_id: String, result_seed: String, exceptions: Exceptions) -> Result<()> {
    let request = load_request(store, &request_id)?;
    let task = LoadTask::resume(request, &result_seed).await?;
    let summary = task
        .retry_exceptions(Some(exceptions))
        .await
        .with_context(|| format!("Exception retry of {result_seed} failed"))?;
    println!("{}", render_summary(&summary));
    Ok(())
}

/// Prints a persisted result.
pub fn show(store: PathBuf, result_seed: String, limit: usize) -> Result<()> {
    let store = StateStore::open(&store)?;
    let result = store
        .load_result(&result_seed)?
        .with_context(|| format!("No result stored for {result_seed}"))?;
    println!("{}", render_result(&result, limit));
    Ok(())
}

fn load_request(store: PathBuf, request_id: &str) -> Result<Arc<Request>> {
    let store = StateStore::open(&store)?;
    let settings = EngineSettings::from_env()?;
    let request = Request::load(request_id, store, settings)
        .with_context(|| format!("Failed to load request {request_id}"))?;
    Ok(Arc::new(request))
}

fn cancel_on_ctrl_c(request: Arc<Request>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(request_id = %request.id(), "interrupt received, cancelling");
            request.cancel();
        }
    });
}
