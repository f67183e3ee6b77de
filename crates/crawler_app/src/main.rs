use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crawler_app::config::{AppConfig, DEFAULT_CONFIG_FILE};
use crawler_app::{events, logging, persistence, plugin};
use crawler_core::TaskStatus;
use crawler_engine::{
    ensure_output_dir, unique_path, ChannelEventSink, EngineBuilder, EngineHandle,
    InMemoryCatalog,
};
use engine_logging::{engine_info, engine_warn};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "crawler", version, about = "Runs crawl tasks one at a time")]
struct Cli {
    /// Configuration file (RON).
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured task (the default).
    Run,
    /// Retry the failed images saved by an earlier run.
    Retry,
    /// Extract a local zip or cbz and copy its images into a directory.
    Import {
        archive: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found, using defaults",
            cli.config.display()
        );
        AppConfig::default()
    };
    logging::initialize(&config);

    let catalog = Arc::new(InMemoryCatalog::with_failed_images(
        persistence::load_failed_images(&config.failed_images_file),
    ));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = events::spawn_event_printer(event_rx);
    let engine = EngineBuilder::new(
        config.engine_config(),
        Arc::new(plugin::registry(&config.plugins)),
        catalog.clone(),
        Arc::new(ChannelEventSink::new(event_tx)),
    )
    .start();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_tasks(&engine, &config).await,
        Command::Retry => retry_failed(&engine, &config).await,
        Command::Import { archive, dest } => import(&engine, &archive, &dest).await,
    };

    engine.shutdown().await.context("engine shutdown")?;
    persistence::save_failed_images(&config.failed_images_file, &catalog.all_failed_images());
    drop(engine);
    if let Ok(Ok(summary)) = tokio::time::timeout(Duration::from_secs(2), printer).await {
        println!(
            "{} images downloaded, {} failed, {} tasks failed",
            summary.completed, summary.failed, summary.tasks_failed
        );
    }
    result
}

async fn run_tasks(engine: &EngineHandle, config: &AppConfig) -> anyhow::Result<()> {
    if config.tasks.is_empty() {
        engine_warn!("no tasks configured");
        return Ok(());
    }
    let mut handles = Vec::new();
    for task in &config.tasks {
        handles.push(engine.enqueue(task.to_request()).await?);
    }
    for mut handle in handles {
        match handle.wait().await {
            Some(task) if task.status == TaskStatus::Completed => {
                engine_info!("task {} completed", task.id)
            }
            Some(task) => engine_warn!(
                "task {} ended {}: {}",
                task.id,
                task.status.as_str(),
                task.error.unwrap_or_default()
            ),
            None => engine_warn!("task {} vanished", handle.task_id()),
        }
    }
    Ok(())
}

async fn retry_failed(engine: &EngineHandle, config: &AppConfig) -> anyhow::Result<()> {
    for task in &config.tasks {
        for record in engine.get_failed_images(&task.task_id)? {
            if let Err(err) = engine
                .retry_failed_image_with(record.id, task.to_request())
                .await
            {
                engine_warn!("retry of {} failed: {}", record.url, err);
            }
        }
    }
    Ok(())
}

async fn import(engine: &EngineHandle, archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let imported = engine
        .extract_for_import(archive)
        .await
        .with_context(|| format!("importing {}", archive.display()))?;
    ensure_output_dir(dest)?;
    for image in &imported.images {
        let Some(name) = image.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let target = unique_path(dest, name);
        fs::copy(image, &target)
            .with_context(|| format!("copying {}", image.display()))?;
    }
    println!(
        "imported {} images into {}",
        imported.images.len(),
        dest.display()
    );
    // The scratch directory goes away with the guard.
    drop(imported);
    Ok(())
}
