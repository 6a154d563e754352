use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use xkm_core::{Entry, SearchTerm};
use xkm_storage::{EntryStore, SqliteEntryStore};
use xkm_sync::{run_download, MirrorConfig};

#[derive(Debug, Parser)]
#[command(name = "xkm")]
#[command(about = "Mirror the xkcd archive into a local searchable database")]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// SQLite file to use instead of XKM_DATABASE_PATH / database.db
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print this usage
    Help,
    /// Download and index all missing entries
    Download,
    /// Print entries whose title, image, alt text or transcript contain TERM ("-" lists all)
    Search { term: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = MirrorConfig::from_env();
    if let Some(path) = cli.database {
        config.database_path = path;
    }

    match cli.command {
        None | Some(Commands::Help) => {
            Cli::command().print_help()?;
            Ok(ExitCode::FAILURE)
        }
        Some(Commands::Download) => {
            let summary = run_download(&config, ctrl_c()).await?;
            println!(
                "download complete: run_id={} latest={} planned={} inserted={} failed={}",
                summary.run_id,
                summary.cursor.latest_remote,
                summary.planned,
                summary.inserted(),
                summary.failed()
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Search { term }) => match search(&config, &term).await {
            Ok(entries) => {
                let mut out = std::io::stdout().lock();
                for entry in &entries {
                    writeln!(out, "{}", search_line(entry))?;
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                eprintln!("error: {err:#}");
                Ok(ExitCode::FAILURE)
            }
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit status used when a second interrupt aborts a download in progress.
const FORCED_EXIT_CODE: i32 = 130;

async fn ctrl_c() {
    graceful_then_forced(tokio::signal::ctrl_c, || {
        std::process::exit(FORCED_EXIT_CODE);
    })
    .await
}

/// Resolves on the first signal; a second signal runs `force`.
async fn graceful_then_forced<S, Fut, K>(mut next_signal: S, force: K)
where
    S: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<()>> + Send,
    K: FnOnce() + Send + 'static,
{
    if let Err(err) = next_signal().await {
        warn!(error = %err, "cannot listen for ctrl-c; download will run to completion");
        std::future::pending::<()>().await;
    }
    warn!("interrupted; finishing in-flight entries, press ctrl-c again to abort");
    tokio::spawn(async move {
        if next_signal().await.is_ok() {
            force();
        }
    });
}

async fn search(config: &MirrorConfig, raw_term: &str) -> Result<Vec<Entry>> {
    let store = SqliteEntryStore::open(&config.database_path)
        .await
        .context("opening entry store")?;
    let found = store.search(&SearchTerm::parse(raw_term)).await;
    let closed = store.close().await;

    let entries = found.context("searching entries")?;
    closed.context("closing entry store")?;
    Ok(entries)
}

fn search_line(entry: &Entry) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        entry.num, entry.title, entry.alt, entry.image
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_takes_a_single_term() {
        let cli = Cli::try_parse_from(["xkm", "search", "barrel"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Search { term }) if term == "barrel"));

        assert!(Cli::try_parse_from(["xkm", "search"]).is_err());
        assert!(Cli::try_parse_from(["xkm", "frobnicate"]).is_err());
    }

    #[test]
    fn help_is_a_plain_command() {
        let cli = Cli::try_parse_from(["xkm", "help"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Help)));

        let cli = Cli::try_parse_from(["xkm", "--database", "/tmp/x.db", "download"]).unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/x.db")));
    }

    #[tokio::test]
    async fn second_interrupt_forces_exit() {
        let (signal_tx, signal_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let signal_rx = std::sync::Arc::new(tokio::sync::Mutex::new(signal_rx));
        let next_signal = move || {
            let signal_rx = signal_rx.clone();
            async move {
                signal_rx
                    .lock()
                    .await
                    .recv()
                    .await
                    .ok_or_else(|| io::Error::other("signal stream closed"))
            }
        };
        let (forced_tx, mut forced_rx) = tokio::sync::oneshot::channel::<()>();

        signal_tx.send(()).unwrap();
        graceful_then_forced(next_signal, move || {
            let _ = forced_tx.send(());
        })
        .await;
        tokio::task::yield_now().await;
        assert!(forced_rx.try_recv().is_err());

        signal_tx.send(()).unwrap();
        forced_rx.await.expect("second signal forces exit");
    }

    #[test]
    fn search_lines_are_tab_separated() {
        let entry = Entry {
            num: 1,
            title: "Barrel - Part 1".into(),
            image: "https://imgs.xkcd.com/comics/barrel_cropped_(1).jpg".into(),
            alt: "Don't we all.".into(),
            transcript: "ignored".into(),
        };
        assert_eq!(
            search_line(&entry),
            "1\tBarrel - Part 1\tDon't we all.\thttps://imgs.xkcd.com/comics/barrel_cropped_(1).jpg"
        );
    }
}
