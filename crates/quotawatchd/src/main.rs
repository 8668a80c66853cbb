use chrono::Utc;
use clap::{Parser, Subcommand};
use qw_agent::AgentSupervisor;
use qw_config::{ConfigPaths, DaemonConfig};
use qw_quota::{BroadcastResetSink, CycleTracker, QuotaStore, ResetSink};
use quotawatchd::{
    format_cycles, format_sessions, format_summary, open_store, remove_pid_file, running_daemon,
    write_pid_file, DAEMON_VERSION, DEFAULT_LOG_FILTER,
};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(
    name = "quotawatchd",
    version = quotawatchd::DAEMON_VERSION,
    about = "Quota cycle and session tracker"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the poll agents in the foreground
    Run,
    /// Show completed and active cycles for one quota
    Cycles {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        quota: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show recent sessions for a provider
    Sessions {
        #[arg(long)]
        provider: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Summarize usage across cycles for one quota
    Summary {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        quota: String,
        #[arg(long)]
        json: bool,
    },
    /// Close sessions left open by a crashed daemon
    Recover {
        #[arg(long)]
        provider: String,
    },
    /// Print version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    let paths = ConfigPaths::new()?;

    match cli.command {
        Commands::Run => run(&paths).await,

        Commands::Cycles {
            provider,
            quota,
            limit,
            json,
        } => {
            let config = DaemonConfig::load_from(&paths)?;
            let store = open_store(&config)?;
            let active = store.active_cycle(&provider, &quota)?;
            let history = store.cycle_history(&provider, &quota, limit)?;
            if json {
                let cycles: Vec<_> = active.iter().chain(history.iter()).collect();
                println!("{}", serde_json::to_string_pretty(&cycles)?);
            } else if active.is_none() && history.is_empty() {
                println!("No cycles recorded for {provider}/{quota}");
            } else {
                print!("{}", format_cycles(active.as_ref(), &history));
            }
            Ok(())
        }

        Commands::Sessions { provider, limit } => {
            let config = DaemonConfig::load_from(&paths)?;
            let store = open_store(&config)?;
            let sessions = store.session_history(&provider, limit)?;
            if sessions.is_empty() {
                println!("No sessions recorded for {provider}");
            } else {
                print!("{}", format_sessions(&sessions));
            }
            Ok(())
        }

        Commands::Summary {
            provider,
            quota,
            json,
        } => {
            let config = DaemonConfig::load_from(&paths)?;
            let store = open_store(&config)?;
            let tracker_config = match config.providers.iter().find(|p| p.name == provider) {
                Some(p) => config.tracker_config_for(p),
                None => config.tracking.tracker_config(config.tracking.poll_interval()),
            };
            let tracker = CycleTracker::new(provider, store, tracker_config);
            let summary = tracker.summary(&quota, Utc::now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", format_summary(&summary));
            }
            Ok(())
        }

        Commands::Recover { provider } => {
            let config = DaemonConfig::load_from(&paths)?;
            if let Some(pid) = running_daemon(&paths.pid_path()) {
                anyhow::bail!(
                    "Daemon is running (PID {}); it recovers its own sessions. Stop it first.",
                    pid
                );
            }
            let store = open_store(&config)?;
            let closed = store.close_orphaned_sessions(&provider, Utc::now())?;
            println!("Closed {closed} orphaned session(s) for {provider}");
            Ok(())
        }

        Commands::Version => {
            println!("quotawatchd {}", DAEMON_VERSION);
            Ok(())
        }
    }
}

async fn run(paths: &ConfigPaths) -> anyhow::Result<()> {
    let config = DaemonConfig::load_from(paths)?;

    if let Some(pid) = running_daemon(&paths.pid_path()) {
        anyhow::bail!("Daemon already running (PID {}).", pid);
    }
    paths.ensure_config_dir()?;
    write_pid_file(&paths.pid_path())?;

    let store: Arc<dyn QuotaStore> = open_store(&config)?;
    let sink = Arc::new(BroadcastResetSink::new(64));
    let notifier = tokio::spawn(log_resets(sink.subscribe()));
    let reset_sink: Arc<dyn ResetSink> = sink.clone();

    let supervisor = match AgentSupervisor::start_from_config(&config, store, reset_sink) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            remove_pid_file(&paths.pid_path());
            return Err(e);
        }
    };
    tracing::info!(
        agents = supervisor.len(),
        version = DAEMON_VERSION,
        "quotawatchd running"
    );

    wait_for_shutdown().await;
    tracing::info!("Shutting down...");

    for (provider, stats) in supervisor.shutdown().await {
        tracing::info!(
            provider = %provider,
            polls = stats.polls,
            fetch_failures = stats.fetch_failures,
            resets = stats.resets,
            store_warnings = stats.store_warnings,
            "agent finished"
        );
    }
    drop(sink);
    let _ = notifier.await;
    remove_pid_file(&paths.pid_path());
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Stand-in for a notifier: logs every reset delivered over the broadcast sink.
async fn log_resets(mut rx: broadcast::Receiver<qw_quota::ResetEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                tracing::info!(
                    provider = %event.provider,
                    quota = %event.quota_key,
                    peak = event.closed_cycle.peak_usage,
                    total_delta = event.closed_cycle.total_delta,
                    "cycle reset"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "reset listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
