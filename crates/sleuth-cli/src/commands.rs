use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use sleuth_client::{
    ClientConfig, HttpResearchApi, ReconnectPolicy, ResearchApi, TaskStatus, TaskUpdate,
    connect_controller, export_report,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::render::{UpdateRenderer, render_snapshot};

/// Submit a query and follow it until it finishes.
pub async fn run(
    mut config: ClientConfig,
    query: String,
    export_dir: Option<PathBuf>,
    no_reconnect: bool,
) -> anyhow::Result<()> {
    if no_reconnect {
        config.reconnect = ReconnectPolicy::disabled();
    }
    let mut controller = connect_controller(&config)?;
    let mut updates = controller.subscribe();
    let mut renderer = UpdateRenderer::new(std::io::stdout());

    let submitted = controller.submit(&query).await;
    flush_updates(&mut updates, &mut renderer)?;
    let task_id = submitted?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(task_id = %task_id, "interrupted, resetting task");
                controller.reset().await;
                flush_updates(&mut updates, &mut renderer)?;
                bail!("interrupted");
            }
            running = controller.pump() => {
                flush_updates(&mut updates, &mut renderer)?;
                if !running {
                    break;
                }
            }
        }
    }

    let state = controller.state();
    match state.status {
        TaskStatus::Completed => {
            if let Some(dir) = export_dir {
                let path = export_report(&dir, state.task_id.as_deref(), &state.report)
                    .context("failed to export report")?;
                println!("exported {}", path.display());
            }
            Ok(())
        }
        TaskStatus::Error => bail!("research failed: {}", state.error),
        other => bail!("task stopped in unexpected state {other:?}"),
    }
}

/// Print the server-side snapshot of a task.
pub async fn status(config: ClientConfig, task_id: String) -> anyhow::Result<()> {
    let api = HttpResearchApi::new(&config.backend_url, config.request_timeout)?;
    let snapshot = api
        .task_status(&task_id)
        .await
        .with_context(|| format!("failed to fetch status for {task_id}"))?;
    let mut stdout = std::io::stdout().lock();
    render_snapshot(&mut stdout, &snapshot)?;
    stdout.flush()?;
    Ok(())
}

/// Print the report of a finished task, or export it as a PDF.
pub async fn download(
    config: ClientConfig,
    task_id: String,
    pdf_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let api = HttpResearchApi::new(&config.backend_url, config.request_timeout)?;
    let report = api
        .download_report(&task_id)
        .await
        .with_context(|| format!("failed to download report for {task_id}"))?;
    match pdf_dir {
        Some(dir) => {
            let path = export_report(&dir, Some(&task_id), &report)
                .context("failed to export report")?;
            println!("exported {}", path.display());
        }
        None => println!("{}", report.trim_end()),
    }
    Ok(())
}

/// Render a local markdown file to PDF.
pub fn export(
    config: &ClientConfig,
    file: &Path,
    task_id: Option<String>,
    out_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let markdown = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let dir = out_dir.unwrap_or_else(|| config.export_dir.clone());
    let path = export_report(&dir, task_id.as_deref(), &markdown)
        .with_context(|| format!("failed to export {}", file.display()))?;
    println!("exported {}", path.display());
    Ok(())
}

fn flush_updates(
    updates: &mut UnboundedReceiver<TaskUpdate>,
    renderer: &mut UpdateRenderer<impl Write>,
) -> anyhow::Result<()> {
    while let Ok(update) = updates.try_recv() {
        renderer.render(&update)?;
    }
    Ok(())
}
