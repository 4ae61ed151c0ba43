use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dbsentinel_backup::BackupExecutor;
use dbsentinel_core::{classify, NewStatusRecord};
use dbsentinel_daemon::config::{self, Config, Settings, StateBackend};
use dbsentinel_daemon::{build_router, AppState, MonitorLoop};
use dbsentinel_storage::{
    connect_lazy, HealthProbe, PostgresHealthSource, PostgresStateStore, SqliteStateStore,
    StateStore,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbsentinel", version)]
#[command(about = "Watches database health, rotates backups and keeps a lifecycle audit log")]
struct Cli {
    /// TOML config file; environment variables take precedence over it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor loop until interrupted (default)
    Run,
    /// Run a single monitor tick and print its report
    Check,
    /// Print the latest status record
    Status,
    /// Probe the database and print a fresh snapshot
    Health,
    /// Print recent status records, newest first
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Take a backup now and apply the retention policy
    Backup,
    /// Replay a backup artifact into the database
    Restore {
        /// Path to a `.sql.zst` artifact
        artifact: PathBuf,
    },
}

struct App {
    settings: Settings,
    store: Arc<dyn StateStore>,
    probe: HealthProbe,
    executor: Arc<BackupExecutor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(path)?
        }
        None => Config::default(),
    };
    let settings = Settings::from_env(&cfg).context("invalid configuration")?;
    let app = App::build(settings).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => app.run().await,
        Command::Check => app.check().await,
        Command::Status => print_json(&app.store.latest().await?),
        Command::Health => app.health().await,
        Command::History { limit } => print_json(&app.store.history(limit).await?),
        Command::Backup => app.backup().await,
        Command::Restore { artifact } => app.restore(artifact).await,
    }
}

impl App {
    async fn build(settings: Settings) -> Result<Self> {
        let pool = connect_lazy(&settings.connection, settings.probe_timeout);

        let store: Arc<dyn StateStore> = match &settings.state {
            StateBackend::Postgres { status_type } => {
                let store = PostgresStateStore::new(pool.clone(), status_type.clone());
                if let Err(e) = store.ensure_schema().await {
                    warn!(error = %format!("{e:#}"), "could not ensure audit table; will retry on write");
                }
                Arc::new(store)
            }
            StateBackend::Sqlite(path) => {
                info!(path = %path.display(), "using sqlite state store");
                Arc::new(SqliteStateStore::new(path.clone())?)
            }
        };

        let probe = HealthProbe::new(
            Arc::new(PostgresHealthSource::new(pool)),
            settings.probe_timeout,
        );
        let executor = Arc::new(BackupExecutor::new(settings.backup.clone()));

        Ok(Self {
            settings,
            store,
            probe,
            executor,
        })
    }

    fn monitor(&self) -> MonitorLoop {
        MonitorLoop::new(
            self.probe.clone(),
            self.executor.clone(),
            self.store.clone(),
            self.settings.monitor.clone(),
        )
    }

    async fn run(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        let server = match self.settings.listen {
            Some(addr) => {
                let app = build_router(AppState {
                    store: self.store.clone(),
                });
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("bind status API on {addr}"))?;
                info!(%addr, "serving status API");
                let mut stop = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    let shutdown = async move {
                        while !*stop.borrow_and_update() {
                            if stop.changed().await.is_err() {
                                break;
                            }
                        }
                    };
                    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                        error!(error = %e, "status API failed");
                    }
                }))
            }
            None => None,
        };

        self.monitor().run(shutdown_rx).await;

        if let Some(server) = server {
            let _ = server.await;
        }
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        let report = self.monitor().tick().await;
        print_json(&serde_json::json!({
            "snapshot": report.snapshot,
            "backupTrigger": report.trigger.map(|t| t.to_string()),
            "backup": report.backup,
            "record": report.record,
        }))?;
        if report.record.is_none() {
            bail!("status record could not be persisted");
        }
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let observed = self
            .probe
            .probe(&self.settings.monitor.critical_entities)
            .await?;
        let mut snapshot = classify(observed, None, self.settings.monitor.data_loss_threshold);
        match self.store.latest_backup_time().await {
            Ok(at) => snapshot.last_backup_at = at,
            Err(e) => warn!(error = %format!("{e:#}"), "could not read last backup time"),
        }
        print_json(&snapshot)
    }

    async fn backup(&self) -> Result<()> {
        match self.executor.backup().await {
            Ok(artifact) => {
                self.store.append(NewStatusRecord::backup(&artifact)).await?;
                print_json(&artifact)
            }
            Err(e) => {
                self.record_failure("backup", &e).await;
                Err(e.into())
            }
        }
    }

    async fn restore(&self, artifact: PathBuf) -> Result<()> {
        match self.executor.restore(&artifact).await {
            Ok(()) => {
                let record = self.store.append(NewStatusRecord::restore(&artifact)).await?;
                print_json(&record)
            }
            Err(e) => {
                self.record_failure("restore", &e).await;
                Err(e.into())
            }
        }
    }

    async fn record_failure(&self, operation: &str, e: &dyn std::error::Error) {
        if let Err(persist) = self
            .store
            .append(NewStatusRecord::failure(operation, e))
            .await
        {
            error!(error = %format!("{persist:#}"), operation, "failed to persist status record");
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested; finishing current tick");
}
