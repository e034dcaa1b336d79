use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vault_sync::config::Config;
use vault_sync::coordinator::BatchCoordinator;
use vault_sync::error::CoordinatorError;
use vault_sync::filter::PathFilter;
use vault_sync::ledger::{LedgerStore, PgLedger};
use vault_sync::session::ClusterSession;
use vault_sync::syncer::ClusterSyncer;

#[derive(Parser, Debug)]
#[command(name = "vault-sync", about = "Replicate KV secrets from a main cluster to replicas")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml", env = "VAULT_SYNC_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Batch reconciliation against every configured mount.
    Sync {
        #[command(subcommand)]
        mode: SyncMode,
    },

    /// Evaluate the configured include/exclude patterns against paths.
    PathMatcher {
        /// Mount-relative paths to evaluate.
        paths: Vec<String>,
    },

    /// Print the effective configuration with secrets redacted.
    ConfigPrint {
        /// Print a single top-level section only.
        #[arg(long)]
        section: Option<String>,
    },

    /// Print version and build information.
    Version,
}

#[derive(Subcommand, Debug)]
enum SyncMode {
    /// One-shot sync; mutates replicas and the ledger.
    Once,
    /// Identical gather and decide, but only reports intended actions.
    DryRun,
}

/// Exit code for configuration problems (unparseable config, missing
/// mounts).
const EXIT_CONFIG: u8 = 2;
/// Exit code for fatal startup errors (database, main-cluster auth).
const EXIT_FATAL: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_tracing(&config.log_level);

    match cli.command {
        Command::Version => unreachable!("handled above"),
        Command::ConfigPrint { section } => match config.render(section.as_deref()) {
            Ok(rendered) => {
                print!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("configuration error: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        },
        Command::PathMatcher { paths } => match path_matcher(&config, &paths) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("configuration error: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        },
        Command::Sync { mode } => {
            let dry_run = matches!(mode, SyncMode::DryRun);
            run_sync(config, dry_run).await
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_version() {
    println!(
        "vault-sync {} (commit {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_COMMIT").unwrap_or("unknown"),
    );
}

fn path_matcher(config: &Config, paths: &[String]) -> Result<(), globset::Error> {
    let filter = PathFilter::new(
        &config.sync_rule.paths_to_replicate,
        &config.sync_rule.paths_to_ignore,
    )?;
    for path in paths {
        let verdict = if filter.matches(path) { "match" } else { "no-match" };
        println!("{verdict}\t{path}");
    }
    Ok(())
}

async fn run_sync(config: Config, dry_run: bool) -> ExitCode {
    info!(id = %config.id, dry_run, "vault-sync starting");

    let main = match ClusterSession::new(&config.vault.main_cluster) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "failed to build main cluster session");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let mut replicas = Vec::with_capacity(config.vault.replica_clusters.len());
    for cluster in &config.vault.replica_clusters {
        match ClusterSession::new(cluster) {
            Ok(session) => replicas.push(session),
            Err(e) => {
                error!(cluster = %cluster.name, error = %e, "failed to build replica session");
                return ExitCode::from(EXIT_FATAL);
            }
        }
    }

    let filter = match PathFilter::new(
        &config.sync_rule.paths_to_replicate,
        &config.sync_rule.paths_to_ignore,
    ) {
        Ok(filter) => filter,
        Err(e) => {
            error!(error = %e, "invalid path pattern");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let ledger = match PgLedger::connect(&config.postgres).await {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!(error = %e, "failed to connect to the sync ledger");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let syncer = Arc::new(ClusterSyncer::new(main, replicas, config.concurrency));
    // The rule interval doubles as the overall run deadline.
    let coordinator = BatchCoordinator::new(
        Arc::clone(&syncer),
        ledger.clone(),
        config.sync_rule.kv_mounts.clone(),
        filter,
        config.concurrency,
    )
    .with_deadline(config.sync_rule.interval);

    // Cooperative shutdown: first ctrl-c cancels in-flight jobs, which
    // record their partial results before the run returns.
    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling run");
            cancel.cancel();
        }
    });

    let result = coordinator.run(dry_run).await;
    ledger.close().await;

    match result {
        Ok(report) => {
            // Per-secret failures are reported in the summary; the run
            // itself completed.
            info!(
                jobs = report.jobs,
                errors = report.errors.len(),
                "run finished"
            );
            for (backend, path, message) in &report.errors {
                error!(backend = %backend, path = %path, "{message}");
            }
            ExitCode::SUCCESS
        }
        Err(e @ CoordinatorError::MissingMounts(_)) => {
            error!(error = %e, "mount verification failed");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            error!(error = %e, "run aborted");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
