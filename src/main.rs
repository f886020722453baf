// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use rustls::crypto::{ring, CryptoProvider};
use tokio::time::sleep;

use link_collector::classifier::LinkClassifier;
use link_collector::collector::CollectorSettings;
use link_collector::config::Config;
use link_collector::controller::{CollectionController, RunState};
use link_collector::metrics::METRICS;
use link_collector::pool::SessionPool;
use link_collector::store::LinkStore;
use link_collector::transport::get_transport;

#[derive(Parser)]
#[command(name = "link-collector")]
#[command(about = "Collects group invite links seen by many messaging sessions", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "LINK_COLLECTOR_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register configured sessions and collect until Ctrl-C (default)
    Run,
    /// Validate a session string and store it
    Register {
        /// Session string issued by the platform
        session: String,
    },
    /// Re-validate every registered session
    Test,
    /// Write every stored link to a JSON file
    Export {
        /// Bare file names go to the configured exports directory
        file: PathBuf,
    },
    /// Per-account and per-class link counts
    Stats,
}

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls)
// - Load configuration and logging
// - Open the store and build pool / classifier / controller
// - Dispatch the requested command
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    let cli = Cli::parse();

    // --------------------------------------------------------
    // Load configuration from disk
    //
    // NOTE:
    // - The config file contains session strings.
    // - It must not be committed to version control.
    // --------------------------------------------------------
    let config = load_config(&cli.config)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if config.debug_log() { "debug" } else { "info" }),
    )
    .init();

    let store = Arc::new(
        LinkStore::open(&config.storage.database)
            .with_context(|| format!("opening {}", config.storage.database.display()))?,
    );

    let Some(transport) = get_transport(&config.transport, config.debug_raw()) else {
        bail!("transport '{}' is not supported", config.transport.kind);
    };

    let shutdown_timeout = Duration::from_secs(config.collector.shutdown_timeout_secs);
    let pool = Arc::new(SessionPool::new(
        transport,
        store.clone(),
        Duration::from_secs(config.transport.connect_timeout_secs),
        shutdown_timeout,
    ));
    let classifier = Arc::new(LinkClassifier::new(&config.classifier)?);
    let controller = CollectionController::new(
        pool.clone(),
        store.clone(),
        classifier,
        CollectorSettings::from_config(&config.collector),
        shutdown_timeout,
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, &controller).await,
        Commands::Register { session } => {
            let id = pool.register(&session).await?;
            println!("registered account {id}");
            Ok(())
        }
        Commands::Test => {
            let results = controller.test_all_sessions().await;
            if results.is_empty() {
                println!("no accounts registered");
            }
            for (id, valid) in results {
                println!("{id}: {}", if valid { "valid" } else { "INVALID" });
            }
            Ok(())
        }
        Commands::Export { file } => {
            let path = export_path(&config.storage.exports_dir, file);
            let count = store.export_json(&path, None)?;
            println!("exported {count} links to {}", path.display());
            Ok(())
        }
        Commands::Stats => {
            let per_account = store.link_counts_by_account()?;
            for account in pool.accounts()? {
                println!(
                    "{:<6} {:<14} {:<24} {} links",
                    account.id.to_string(),
                    account.status.as_str(),
                    account.identity.username.as_deref().unwrap_or("-"),
                    per_account.get(&account.id).copied().unwrap_or(0)
                );
            }
            for (class, count) in store.link_counts_by_class()? {
                println!("{:<24} {count}", class.as_str());
            }
            println!("{:<24} {}", "total", store.count_links(None)?);
            Ok(())
        }
    }
}

/// Registers configured sessions, starts collecting and runs until
/// Ctrl-C. Stop is always attempted before returning.
async fn run(config: &Config, controller: &CollectionController) -> anyhow::Result<()> {
    for session in &config.sessions {
        if let Err(e) = controller.pool().register(session).await {
            log::warn!("skipping configured session: {e}");
        }
    }

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    let reporter = tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(10)).await;
            log::info!("[METRICS] {}", METRICS.summary());
        }
    });

    let status = controller.start().await;
    if status.state != RunState::Running {
        reporter.abort();
        bail!(
            "collection did not start: {}",
            status.last_error.as_deref().unwrap_or("unknown reason")
        );
    }
    log::info!(
        "collecting from {} account(s); press Ctrl-C to stop",
        status.accounts.len()
    );

    let waited = tokio::signal::ctrl_c().await;
    log::info!("stopping collection");
    let status = controller.stop().await;
    reporter.abort();

    log::info!("{}", serde_json::to_string(&status)?);
    log::info!("[METRICS] {}", METRICS.summary());
    waited.context("waiting for Ctrl-C")
}

/// Bare file names land in the configured exports directory.
fn export_path(exports_dir: &Path, file: PathBuf) -> PathBuf {
    let bare = file.parent().is_none_or(|p| p.as_os_str().is_empty());
    if bare && !file.is_absolute() {
        exports_dir.join(file)
    } else {
        file
    }
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk and deserializes
// it into the strongly typed `Config` structure.
//
fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg = serde_json::from_str(&data)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["link-collector", "--config", "c.json"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("c.json"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli =
            Cli::try_parse_from(["link-collector", "-c", "prod.json", "register", "abc"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("prod.json"));
        assert!(matches!(cli.command, Some(Commands::Register { session }) if session == "abc"));

        let cli = Cli::try_parse_from(["link-collector", "export", "links.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Export { file }) if file == PathBuf::from("links.json")
        ));

        assert!(Cli::try_parse_from(["link-collector", "register"]).is_err());
        assert!(Cli::try_parse_from(["link-collector", "frobnicate"]).is_err());
    }

    #[test]
    fn bare_export_names_land_in_exports_dir() {
        let dir = Path::new("exports");
        assert_eq!(export_path(dir, PathBuf::from("a.json")), dir.join("a.json"));
        assert_eq!(export_path(dir, PathBuf::from("out/a.json")), PathBuf::from("out/a.json"));
    }
}
