use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use dbsentinel_backup::retention::list_artifacts;
use dbsentinel_backup::{BackupExecutor, BackupSettings, CommandSpec};
use dbsentinel_core::{ConnectionParams, EntityName, HealthStatus, LifecycleStatus, NewStatusRecord};
use dbsentinel_daemon::{build_router, AppState, BackupTrigger, MonitorLoop, MonitorPolicy};
use dbsentinel_storage::{HealthProbe, HealthSource, SqliteStateStore, StateStore};
use tempfile::TempDir;
use tokio::sync::watch;

/// In-memory stand-in for the monitored database.
struct FakeDatabase {
    reachable: AtomicBool,
    counts: Mutex<HashMap<String, u64>>,
}

impl FakeDatabase {
    fn new(counts: &[(&str, u64)]) -> Arc<Self> {
        let db = Arc::new(Self {
            reachable: AtomicBool::new(true),
            counts: Mutex::new(HashMap::new()),
        });
        db.set_counts(counts);
        db
    }

    fn set_counts(&self, counts: &[(&str, u64)]) {
        let mut guard = self.counts.lock().unwrap();
        guard.clear();
        guard.extend(counts.iter().map(|(k, v)| ((*k).to_owned(), *v)));
    }

    fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl HealthSource for FakeDatabase {
    async fn ping(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            bail!("could not connect to server: Connection refused");
        }
        Ok(())
    }

    async fn count_rows(&self, entity: &EntityName) -> Result<u64> {
        match self.counts.lock().unwrap().get(entity.as_str()) {
            Some(count) => Ok(*count),
            None => bail!("relation \"{entity}\" does not exist"),
        }
    }
}

struct Harness {
    tmp: TempDir,
    db: Arc<FakeDatabase>,
    store: Arc<SqliteStateStore>,
}

impl Harness {
    fn new(counts: &[(&str, u64)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStateStore::new(tmp.path().join("state").join("status.db")).unwrap());
        Self {
            tmp,
            db: FakeDatabase::new(counts),
            store,
        }
    }

    fn backup_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("backups")
    }

    fn executor(&self, dump_script: &str) -> Arc<BackupExecutor> {
        let mut settings = BackupSettings::new(self.backup_dir(), ConnectionParams::default());
        settings.dump = CommandSpec::new("sh", ["-c", dump_script]);
        settings.timeout = Duration::from_secs(30);
        Arc::new(BackupExecutor::new(settings))
    }

    fn monitor(&self, tables: &[&str], dump_script: &str) -> MonitorLoop {
        MonitorLoop::new(
            HealthProbe::new(self.db.clone(), Duration::from_secs(5)),
            self.executor(dump_script),
            self.store.clone(),
            policy(tables, Duration::from_secs(300)),
        )
    }

    fn artifact_count(&self) -> usize {
        list_artifacts(&self.backup_dir()).unwrap().len()
    }
}

fn policy(tables: &[&str], check_interval: Duration) -> MonitorPolicy {
    MonitorPolicy {
        critical_entities: tables.iter().map(|t| EntityName::parse(t).unwrap()).collect(),
        check_interval,
        data_loss_threshold: 0.1,
        backup_max_age: chrono::Duration::hours(24),
    }
}

#[tokio::test]
async fn first_tick_without_prior_backup_takes_one() {
    let h = Harness::new(&[("tenants", 4), ("user_profiles", 100)]);
    let mut monitor = h.monitor(&["tenants", "user_profiles"], "printf 'dump'");

    let report = monitor.tick().await;
    assert_eq!(report.trigger, Some(BackupTrigger::NoPriorBackup));
    assert_eq!(report.snapshot.status, HealthStatus::Healthy);
    let artifact = report.backup.expect("backup taken");
    assert!(artifact.size_bytes > 0);
    assert_eq!(report.snapshot.last_backup_at, Some(artifact.created_at));

    let record = report.record.expect("record appended");
    assert_eq!(record.status, LifecycleStatus::Initialized);
    assert_eq!(record.error_count, 0);
    assert!(h.store.latest_backup_time().await.unwrap().is_some());
    assert_eq!(h.artifact_count(), 1);

    // A fresh backup on record: the next healthy tick does not take another.
    let second = monitor.tick().await;
    assert_eq!(second.trigger, None);
    assert!(second.backup.is_none());
    assert_eq!(h.artifact_count(), 1);
    assert_eq!(h.store.history(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn data_loss_is_reported_and_triggers_backup() {
    let h = Harness::new(&[("user_profiles", 100)]);
    let mut monitor = h.monitor(&["user_profiles"], "printf 'dump'");
    monitor.tick().await;

    h.db.set_counts(&[("user_profiles", 85)]);
    let report = monitor.tick().await;

    assert_eq!(report.snapshot.status, HealthStatus::Warning);
    assert_eq!(
        report.snapshot.warnings,
        vec!["Significant data loss detected in user_profiles: Previous=100, Current=85".to_owned()]
    );
    assert_eq!(report.trigger, Some(BackupTrigger::DataLoss));
    assert!(report.backup.is_some());

    let record = report.record.expect("record appended");
    assert_eq!(record.status, LifecycleStatus::Error);
    assert_eq!(record.error_count, 1);
    assert_eq!(record.last_known_state["snapshot"]["status"], "warning");
    assert_eq!(
        monitor.last_known_snapshot().unwrap().table_counts.get("user_profiles"),
        Some(&85)
    );
}

#[tokio::test]
async fn empty_backup_is_an_error_and_not_retained() {
    let h = Harness::new(&[("tenants", 1)]);
    let mut monitor = h.monitor(&["tenants"], "true");

    let report = monitor.tick().await;
    assert!(report.backup.is_none());
    assert_eq!(report.snapshot.status, HealthStatus::Error);
    assert!(report.snapshot.errors[0].starts_with("Backup failed: backup artifact"));
    assert!(report.snapshot.errors[0].ends_with("is empty"));
    assert_eq!(h.artifact_count(), 0);

    let record = report.record.expect("record appended");
    assert_eq!(record.status, LifecycleStatus::Error);
    assert!(h.store.latest_backup_time().await.unwrap().is_none());

    // No backup on record yet, so the next tick retries.
    let retry = monitor.tick().await;
    assert_eq!(retry.trigger, Some(BackupTrigger::NoPriorBackup));
}

#[tokio::test]
async fn unreachable_database_records_error_and_skips_backup() {
    let h = Harness::new(&[("tenants", 10)]);
    let mut monitor = h.monitor(&["tenants"], "printf 'dump'");
    h.db.set_reachable(false);

    let report = monitor.tick().await;
    assert_eq!(report.snapshot.status, HealthStatus::Error);
    assert!(report.snapshot.table_counts.is_empty());
    assert!(report.snapshot.errors[0].contains("Connection refused"));
    assert_eq!(report.trigger, None);
    assert_eq!(h.artifact_count(), 0);
    assert_eq!(report.record.expect("record").status, LifecycleStatus::Error);
}

#[tokio::test]
async fn baseline_is_replaced_even_after_errors() {
    let h = Harness::new(&[("tenants", 100)]);
    let mut monitor = h.monitor(&["tenants"], "printf 'dump'");
    monitor.tick().await;

    h.db.set_reachable(false);
    monitor.tick().await;
    assert!(monitor.last_known_snapshot().unwrap().table_counts.is_empty());

    // Compared against the empty error baseline, not the stale 100.
    h.db.set_reachable(true);
    h.db.set_counts(&[("tenants", 50)]);
    let report = monitor.tick().await;
    assert!(report.snapshot.warnings.is_empty());
    assert_eq!(report.snapshot.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn count_failure_is_partial_not_fatal() {
    let h = Harness::new(&[("tenants", 3)]);
    let mut monitor = h.monitor(&["tenants", "invoices"], "printf 'dump'");

    let report = monitor.tick().await;
    assert_eq!(report.snapshot.status, HealthStatus::Error);
    assert_eq!(report.snapshot.table_counts.get("tenants"), Some(&3));
    assert!(report.snapshot.errors[0].contains("invoices"));
    assert!(report.backup.is_some());
}

#[tokio::test]
async fn error_count_tracks_consecutive_error_ticks() {
    let h = Harness::new(&[("tenants", 1)]);
    h.store
        .append(NewStatusRecord::failure("bootstrap", "seed"))
        .await
        .unwrap();
    let before = h.store.latest().await.unwrap().unwrap().error_count;

    let mut monitor = h.monitor(&["tenants"], "printf 'dump'");
    h.db.set_reachable(false);
    for n in 1..=4 {
        let record = monitor.tick().await.record.expect("record");
        assert_eq!(record.error_count, before + n);
    }
}

#[tokio::test]
async fn loops_keep_independent_baselines() {
    let h = Harness::new(&[("tenants", 80)]);
    let baseline = {
        let mut warmup = h.monitor(&["tenants"], "printf 'dump'");
        h.db.set_counts(&[("tenants", 100)]);
        warmup.tick().await.snapshot
    };
    h.db.set_counts(&[("tenants", 80)]);

    let mut seeded = h.monitor(&["tenants"], "printf 'dump'").with_baseline(baseline);
    let mut fresh = h.monitor(&["tenants"], "printf 'dump'");

    assert_eq!(seeded.tick().await.snapshot.status, HealthStatus::Warning);
    assert_eq!(fresh.tick().await.snapshot.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn run_loop_ticks_until_shutdown() {
    let h = Harness::new(&[("tenants", 1)]);
    let monitor = MonitorLoop::new(
        HealthProbe::new(h.db.clone(), Duration::from_secs(5)),
        h.executor("printf 'dump'"),
        h.store.clone(),
        policy(&["tenants"], Duration::from_millis(50)),
    );

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(monitor.run(rx));
    tokio::time::sleep(Duration::from_millis(300)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("loop stops after shutdown")
        .unwrap();

    let ticks = h.store.history(100).await.unwrap().len();
    assert!(ticks >= 2, "expected several ticks, got {ticks}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.store.history(100).await.unwrap().len(), ticks);
}

#[tokio::test]
async fn shutdown_before_start_runs_no_ticks() {
    let h = Harness::new(&[("tenants", 1)]);
    let (tx, rx) = watch::channel(true);
    h.monitor(&["tenants"], "printf 'dump'").run(rx).await;
    drop(tx);
    assert!(h.store.latest().await.unwrap().is_none());
}

// --- status API ---

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    _handle: tokio::task::JoinHandle<()>,
}

async fn start_server(store: Arc<dyn StateStore>) -> TestServer {
    let app = build_router(AppState { store });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _handle: handle,
    }
}

fn sqlite_store(dir: &Path) -> Arc<SqliteStateStore> {
    Arc::new(SqliteStateStore::new(dir.join("status.db")).unwrap())
}

#[tokio::test]
async fn test_healthz() {
    let tmp = tempfile::tempdir().unwrap();
    let srv = start_server(sqlite_store(tmp.path())).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/healthz", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_status_is_404_when_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let srv = start_server(sqlite_store(tmp.path())).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/status", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_status_returns_latest_record() {
    let tmp = tempfile::tempdir().unwrap();
    let store = sqlite_store(tmp.path());
    store
        .append(NewStatusRecord::failure("probe", "down"))
        .await
        .unwrap();
    let latest = store
        .append(NewStatusRecord::restore(Path::new("/backups/a.sql.zst")))
        .await
        .unwrap();
    let srv = start_server(store).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/status", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], latest.id.to_string());
    assert_eq!(body["status"], "restore");
    assert_eq!(body["error_count"], 1);
}

#[tokio::test]
async fn test_history_honours_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let store = sqlite_store(tmp.path());
    for _ in 0..5 {
        store
            .append(NewStatusRecord::failure("probe", "down"))
            .await
            .unwrap();
    }
    let srv = start_server(store).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/history?limit=3", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(body.len(), 3);
    assert_eq!(body[0]["error_count"], 5);
    assert_eq!(body[2]["error_count"], 3);
}
