//! dirmon - directory change monitor
//!
//! Lists the compiled backends and runs a watch loop that prints each batch
//! of changes until Ctrl-C.

mod cli;
mod config;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dirmonitor::{EventBatch, FileEventKind, WatchMode, Watchlist, registry};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[derive(Debug, Serialize)]
struct BackendRow {
    name: &'static str,
    mode: WatchMode,
    default: bool,
}

fn backend_rows() -> Vec<BackendRow> {
    registry::descriptors()
        .iter()
        .enumerate()
        .map(|(index, descriptor)| BackendRow {
            name: descriptor.name,
            mode: descriptor.mode,
            default: index == 0,
        })
        .collect()
}

fn print_backends(json: bool) -> Result<()> {
    let rows = backend_rows();
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in rows {
        let marker = if row.default { " (default)" } else { "" };
        println!("{:<14}{}{marker}", row.name, row.mode);
    }
    Ok(())
}

fn print_batch(batch: &EventBatch, json: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for event in batch.iter() {
        if json {
            serde_json::to_writer(&mut stdout, event)?;
            writeln!(stdout)?;
        } else {
            let kind = match event.kind {
                FileEventKind::Changed => "changed",
                FileEventKind::Rescan => "rescan",
            };
            writeln!(stdout, "{kind:<8}{}", event.path.display())?;
        }
    }
    stdout.flush()?;
    Ok(())
}

async fn run_watch(
    paths: Vec<PathBuf>,
    backend: Option<String>,
    config_path: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let config = config::load(config_path.as_deref())?;
    let config = config::apply_overrides(config, backend, poll_interval_ms)?;
    let tick_every = config.poll_interval();

    let mut list = Watchlist::new(config).context("failed to open monitor")?;
    if list.mode() == WatchMode::Single && paths.len() > 1 {
        warn!(
            "{} backend keeps one watch; only the last path is monitored",
            list.backend_name()
        );
    }
    for path in &paths {
        list.watch(path)
            .with_context(|| format!("failed to watch {}", path.display()))?;
    }
    info!(
        "Watching {} path(s) with {} backend; press Ctrl-C to stop",
        paths.len(),
        list.backend_name()
    );

    let mut tick = tokio::time::interval(tick_every);
    loop {
        tokio::select! {
            _ = list.changed() => {}
            _ = tick.tick() => {}
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
        }

        match list.poll() {
            Some(batch) => print_batch(&batch, json)?,
            None => break,
        }
    }

    list.dispose();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backends { json } => print_backends(json)?,
        Commands::Watch {
            paths,
            backend,
            config,
            poll_interval_ms,
            json,
        } => run_watch(paths, backend, config, poll_interval_ms, json).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backend_rows_mark_default() {
        let rows = backend_rows();
        assert!(rows[0].default);
        assert_eq!(rows.iter().filter(|row| row.default).count(), 1);
        assert_eq!(rows.last().map(|row| row.name), Some("dummy"));
    }
}
