use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use clap::Parser;

mod app;
mod backup;
mod cli;
mod config;
mod enrich;
mod extract;
mod items;
mod lock;
mod search;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use app::CaptureRequest;
use config::Config;
use inquire::error::InquireResult;
use search::SearchRequest;

// Logs go to stderr so json command output stays pipeable.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_app(base_path: &Path) -> anyhow::Result<app::App> {
    let config = Arc::new(RwLock::new(Config::load_with(base_path)));
    app::App::new(config, base_path)
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let base_path = config::base_path();

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => {
            println!("{}", clap_markdown::help_markdown::<cli::Args>());
            Ok(())
        }

        cli::Command::Daemon {} => {
            let _lock = lock::FileLock::try_acquire(&base_path)
                .context("cannot start daemon")?;

            let config = Arc::new(RwLock::new(Config::load_with(&base_path)));
            let mut app = app::App::new(config.clone(), &base_path)?;
            app.run_queue();

            // MNEMO_ADDR overrides the configured bind address.
            let addr = std::env::var("MNEMO_ADDR")
                .ok()
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| config.read().unwrap().listen_addr.clone());
            web::start_daemon(app, addr);
            Ok(())
        }

        cli::Command::Capture {
            url,
            title,
            content,
            no_fetch,
            owner,
        } => {
            let _lock = lock::FileLock::try_acquire(&base_path)?;
            let app = open_app(&base_path)?;

            let outcome = app.capture(CaptureRequest {
                owner,
                url,
                title,
                content,
                allow_server_extract: !no_fetch,
                ..Default::default()
            })?;
            app.shutdown();

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }

        cli::Command::Search {
            query,
            emotion,
            semantic,
            limit,
            owner,
            count,
        } => {
            let app = open_app(&base_path)?;
            let response = app.search(SearchRequest {
                owner,
                query: query.unwrap_or_default(),
                emotion,
                semantic,
                limit,
            })?;

            if count {
                println!("{} items found", response.results.len());
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        cli::Command::Timeline { limit, owner } => {
            let app = open_app(&base_path)?;
            let items = app.timeline(owner, limit)?;
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }

        cli::Command::Insights { owner } => {
            let app = open_app(&base_path)?;
            let insights = app.insights(owner)?;
            println!("{}", serde_json::to_string_pretty(&insights)?);
            Ok(())
        }

        cli::Command::Status {} => {
            let app = open_app(&base_path)?;
            let status = app.status()?;
            let total = app.total_items()?;

            println!("{total} items captured");
            if status.processing {
                println!("{} awaiting enrichment", status.count);
            } else {
                println!("enrichment queue is idle");
            }
            Ok(())
        }

        cli::Command::Delete { id, yes } => {
            let _lock = lock::FileLock::try_acquire(&base_path)?;
            let app = open_app(&base_path)?;
            let item = app.get_item(id)?;

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Delete item {} ({})?",
                    item.id, item.title
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            app.delete_item(id)?;
            println!("item {id} deleted");
            Ok(())
        }

        cli::Command::Backup { output } => backup::create_backup(output, &base_path),

        cli::Command::Import { archive, yes } => {
            let _lock = lock::FileLock::try_acquire(&base_path)?;
            backup::import_backup(archive.as_deref(), yes, &base_path)
        }
    }
}
