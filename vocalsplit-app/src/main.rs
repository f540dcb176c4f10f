//! vocalsplit host entry point.
//!
//! Builds the separation engine once (backend selection happens here), then
//! serves one CLI operation against it:
//!
//! ```text
//! vocalsplit [--settings <file>] separate <input> [--title <t>] [--sync]
//! vocalsplit [--settings <file>] batch <input>...
//! vocalsplit [--settings <file>] backend
//! vocalsplit [--settings <file>] settings [--write]
//! ```
//!
//! `RUST_LOG` controls logging (default `vocalsplit=info`).

mod commands;
mod settings;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Serialize;
use settings::{default_settings_path, load_effective_settings};
use state::AppState;
use tracing::{info, warn};
use vocalsplit_core::{JobRecord, JobStatus, Selection, SeparationEngine};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum Command {
    Separate {
        input: PathBuf,
        title: Option<String>,
        sync: bool,
    },
    Batch {
        inputs: Vec<PathBuf>,
    },
    Backend,
    Settings {
        write: bool,
    },
}

#[derive(Debug)]
struct Cli {
    settings_path: PathBuf,
    command: Command,
}

const USAGE: &str = "Usage: vocalsplit [--settings <file>] <command>

Commands:
  separate <input> [--title <t>] [--sync]   separate one file, printing progress
  batch <input>...                          run several separations concurrently
  backend                                   show the active backend and startup failures
  settings [--write]                        print effective settings (optionally save them)";

fn parse_cli() -> anyhow::Result<Cli> {
    let mut settings_path = None;
    let mut it = std::env::args().skip(1).peekable();

    while let Some(arg) = it.peek() {
        match arg.as_str() {
            "--settings" => {
                it.next();
                let v = it.next().ok_or_else(|| anyhow!("missing value for --settings"))?;
                settings_path = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => break,
        }
    }

    let command = match it.next().as_deref() {
        Some("separate") => {
            let mut input = None;
            let mut title = None;
            let mut sync = false;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--title" => {
                        title = Some(it.next().ok_or_else(|| anyhow!("missing value for --title"))?)
                    }
                    "--sync" => sync = true,
                    other if input.is_none() => input = Some(PathBuf::from(other)),
                    other => bail!("unexpected argument: {other}"),
                }
            }
            Command::Separate {
                input: input.ok_or_else(|| anyhow!("separate needs an input file"))?,
                title,
                sync,
            }
        }
        Some("batch") => {
            let inputs: Vec<PathBuf> = it.map(PathBuf::from).collect();
            if inputs.is_empty() {
                bail!("batch needs at least one input file");
            }
            Command::Batch { inputs }
        }
        Some("backend") => Command::Backend,
        Some("settings") => Command::Settings {
            write: it.any(|a| a == "--write"),
        },
        Some(other) => bail!("unknown command: {other}\n\n{USAGE}"),
        None => bail!("{USAGE}"),
    };

    Ok(Cli {
        settings_path: settings_path.unwrap_or_else(default_settings_path),
        command,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn title_for(input: &std::path::Path) -> String {
    input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}

/// Poll until every job in `ids` is terminal and its worker has returned.
/// Ctrl-C cancels whatever is still running.
async fn wait_for_jobs(state: &AppState, ids: &[String]) -> anyhow::Result<Vec<JobRecord>> {
    let mut last_progress = vec![None; ids.len()];
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupt received; cancelling running jobs");
                for id in ids {
                    if let Err(e) = commands::cancel_job(state, id).await {
                        info!(job_id = %id, error = %e, "job not cancellable");
                    }
                }
            }
            _ = interval.tick() => {}
        }

        let mut records = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let record = commands::job_status(state, id)
                .await
                .map_err(|e| anyhow!(e))?;
            if last_progress[i] != Some(record.progress) && record.status == JobStatus::Running {
                eprintln!("[{}] {:>3}%", record.label, record.progress);
                last_progress[i] = Some(record.progress);
            }
            records.push(record);
        }
        if records.iter().all(|r| r.status.is_terminal()) {
            // Cancelled workers are still between checkpoints; let them
            // remove their scratch files before the process exits.
            commands::wait_for_workers(state)
                .await
                .map_err(|e| anyhow!(e))?;
            return Ok(records);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = load_effective_settings(&cli.settings_path);

    if let Command::Settings { write } = cli.command {
        // No backend needed to inspect or persist settings.
        let engine = SeparationEngine::new(settings.engine.clone(), Selection::unavailable())?;
        let state = AppState::new(engine, settings, cli.settings_path);
        let current = commands::get_settings(&state).await.map_err(|e| anyhow!(e))?;
        if write {
            let saved = commands::update_settings(&state, current)
                .await
                .map_err(|e| anyhow!(e))?;
            info!(path = %state.settings_path.display(), "settings saved");
            return print_json(&saved);
        }
        return print_json(&current);
    }

    // Backend selection loads models; keep it off the async workers.
    let engine_config = settings.engine.clone();
    let backend_config = settings.backend.clone();
    let engine = tokio::task::spawn_blocking(move || {
        SeparationEngine::from_backend_config(engine_config, &backend_config)
    })
    .await??;
    let state = AppState::new(engine, settings, cli.settings_path);

    match cli.command {
        Command::Backend => {
            print_json(&commands::backend_info(&state).await.map_err(|e| anyhow!(e))?)
        }
        Command::Separate {
            input, sync: true, ..
        } => {
            let stems = commands::separate(&state, input)
                .await
                .map_err(|e| anyhow!(e))?;
            print_json(&stems)
        }
        Command::Separate { input, title, .. } => {
            let title = title.unwrap_or_else(|| title_for(&input));
            let id = commands::submit_job(&state, input, title)
                .await
                .map_err(|e| anyhow!(e))?;
            let records = wait_for_jobs(&state, std::slice::from_ref(&id)).await?;
            let record = records
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("job {id} vanished"))?;
            print_json(&record)?;
            match record.status {
                JobStatus::Completed => Ok(()),
                status => bail!("job {id} ended {status}"),
            }
        }
        Command::Batch { inputs } => {
            let mut ids = Vec::with_capacity(inputs.len());
            for input in inputs {
                let title = title_for(&input);
                match commands::submit_job(&state, input, title.clone()).await {
                    Ok(id) => ids.push(id),
                    Err(e) => warn!(%title, error = %e, "skipping input"),
                }
            }
            if ids.is_empty() {
                bail!("no job could be started");
            }
            wait_for_jobs(&state, &ids).await?;
            print_json(&commands::list_jobs(&state).await.map_err(|e| anyhow!(e))?)?;
            // Registry is ephemeral; clear finished records, keep the stems.
            for id in &ids {
                let _ = commands::delete_job(&state, id, false).await;
            }
            Ok(())
        }
        Command::Settings { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vocalsplit=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    info!(settings = %cli.settings_path.display(), "vocalsplit starting");

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
