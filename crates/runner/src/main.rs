use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use stylize_comfyui::api::ComfyUIApi;
use stylize_core::style::StylePreset;
use stylize_core::task::TaskStatus;
use stylize_core::types::TaskId;
use stylize_core::workflow::{JobParams, DEFAULT_STRENGTH};
use stylize_tasks::config::ServiceConfig;
use stylize_tasks::service::{CreateTask, TaskService};
use stylize_tasks::submission::InputArtifact;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Restyle local images through a ComfyUI server.
#[derive(Debug, Parser)]
#[command(name = "stylize-runner", version)]
struct Args {
    /// Owner recorded on every task.
    #[arg(long, default_value = "local")]
    owner: String,

    /// Job template name under `WORKFLOW_DIR`.
    #[arg(long)]
    template: Option<String>,

    /// Style preset: clay, anime, realistic, cartoon or oil_painting.
    #[arg(long, default_value = "clay")]
    style: StylePreset,

    /// Custom prompt; replaces the preset's.
    #[arg(long)]
    prompt: Option<String>,

    /// Denoise strength between 0.1 and 1.0.
    #[arg(long, default_value_t = DEFAULT_STRENGTH)]
    strength: f64,

    #[arg(long)]
    seed: Option<u64>,

    /// Where finished images are written.
    #[arg(long, default_value = "outputs")]
    output_dir: PathBuf,

    /// Input images.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stylize_runner=info,stylize_tasks=info,stylize_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // --- Configuration ---
    let config = ServiceConfig::from_env()?;
    tracing::info!(
        comfyui_url = %config.comfyui_url,
        workflow_dir = %config.workflow_dir.display(),
        "Loaded service configuration"
    );

    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("cannot create {}", args.output_dir.display()))?;

    // --- Service ---
    let api = ComfyUIApi::new(config.comfyui_url.clone());
    let service = TaskService::connect_comfyui(config);
    let mut updates = service.subscribe();

    let params = JobParams {
        style: args.style,
        prompt: args.prompt.clone(),
        strength: args.strength,
        seed: args.seed,
        overrides: Vec::new(),
    };

    // --- Submission ---
    let mut pending: HashMap<TaskId, PathBuf> = HashMap::new();
    let mut failed = 0usize;

    for image in &args.images {
        let bytes = match tokio::fs::read(image).await {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("{}: cannot read: {e}", image.display());
                failed += 1;
                continue;
            }
        };
        let filename = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input.png")
            .to_string();

        let request = CreateTask {
            input: InputArtifact::new(bytes, filename),
            template: args.template.clone(),
            params: params.clone(),
        };
        match service.create_task(&args.owner, request).await {
            Ok(task_id) => {
                println!("{task_id}  submitted  {}", image.display());
                pending.insert(task_id, image.clone());
            }
            Err(e) => {
                eprintln!("{}: {e}", image.display());
                failed += 1;
            }
        }
    }

    // --- Progress ---
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        let finished: Vec<TaskId> = tokio::select! {
            _ = &mut ctrl_c => {
                tracing::warn!(remaining = pending.len(), "Interrupted");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) if !pending.contains_key(&update.task_id) => continue,
                Ok(update) if !update.is_terminal() => {
                    println!("{}  {:>5.1}%", update.task_id, update.progress);
                    continue;
                }
                Ok(update) => vec![update.task_id],
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed task updates, re-reading pending tasks");
                    pending.keys().copied().collect()
                }
                Err(RecvError::Closed) => break,
            },
        };

        for task_id in finished {
            let record = service.get_task(task_id).await?;
            if !record.is_terminal() {
                continue;
            }
            let Some(source) = pending.remove(&task_id) else {
                continue;
            };

            match (record.status, record.output_reference) {
                (TaskStatus::Completed, Some(output)) => {
                    match save_output(&api, &output, &source, &args.output_dir, args.style).await {
                        Ok(path) => println!("{task_id}  completed  {}", path.display()),
                        Err(e) => {
                            eprintln!("{task_id}  download failed: {e:#}");
                            failed += 1;
                        }
                    }
                }
                _ => {
                    let detail = record.error_detail.unwrap_or_else(|| "unknown error".into());
                    eprintln!("{task_id}  failed  {}: {detail}", source.display());
                    failed += 1;
                }
            }
        }
    }

    let unfinished = pending.len();
    service.shutdown().await;

    let total = args.images.len();
    if failed + unfinished > 0 {
        anyhow::bail!("{} of {total} images did not complete", failed + unfinished);
    }
    tracing::info!(total, "All images completed");
    Ok(())
}

/// Download `output` into `output_dir` as `<stem>_<style>.png`.
async fn save_output(
    api: &ComfyUIApi,
    output: &str,
    source: &Path,
    output_dir: &Path,
    style: StylePreset,
) -> anyhow::Result<PathBuf> {
    let bytes = api.download_url(output).await?;

    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let path = output_dir.join(format!("{stem}_{style}.png"));

    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}
