use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dbsentinel_backup::{BackupSettings, CommandSpec};
use dbsentinel_core::{ConnectionParams, EntityName, RetentionPolicy, DEFAULT_DATA_LOSS_THRESHOLD};
use dbsentinel_storage::DEFAULT_STATUS_TYPE;
use serde::Deserialize;

use crate::monitor::MonitorPolicy;

const DEFAULT_CRITICAL_TABLES: [&str; 3] = ["tenants", "user_profiles", "tenant_members"];
const MAX_CHECK_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// On-disk configuration. Every field is optional; environment variables
/// override it and built-in defaults fill the rest.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
    pub backup: BackupConfig,
    pub state: StateConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub critical_tables: Option<Vec<String>>,
    pub check_interval_secs: Option<u64>,
    pub data_loss_threshold: Option<f64>,
    pub backup_max_age_hours: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: Option<String>,
    pub max_count: Option<usize>,
    pub retention_days: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub compression_level: Option<i32>,
    pub dump: Option<CommandSpec>,
    pub restore: Option<CommandSpec>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StateConfig {
    pub backend: Option<String>,
    pub sqlite_path: Option<String>,
    pub status_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

/// Where the audit log lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackend {
    /// `status_type` is the enum type of the audit table's `status` column.
    Postgres { status_type: EntityName },
    Sqlite(PathBuf),
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionParams,
    pub monitor: MonitorPolicy,
    pub probe_timeout: Duration,
    pub backup: BackupSettings,
    pub state: StateBackend,
    pub listen: Option<SocketAddr>,
}

impl Settings {
    pub fn from_env(cfg: &Config) -> Result<Self> {
        Self::resolve(cfg, |key| env::var(key).ok())
    }

    /// Resolves settings with `lookup` taking precedence over `cfg`.
    pub fn resolve(cfg: &Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let text = |key: &str, file: &Option<String>, default: &str| {
            lookup(key)
                .or_else(|| file.clone())
                .unwrap_or_else(|| default.to_owned())
        };

        let connection = ConnectionParams {
            host: text("DB_HOST", &cfg.database.host, "localhost"),
            port: number(&lookup, "DB_PORT", cfg.database.port, 5432)?,
            user: text("DB_USER", &cfg.database.user, "postgres"),
            password: text("DB_PASSWORD", &cfg.database.password, "postgres"),
            database: text("DB_NAME", &cfg.database.name, "postgres"),
        };
        for (key, value) in [
            ("DB_HOST", &connection.host),
            ("DB_USER", &connection.user),
            ("DB_NAME", &connection.database),
        ] {
            if value.trim().is_empty() {
                bail!("{key} must not be empty");
            }
        }

        let critical_entities = critical_entities(
            lookup("CRITICAL_TABLES"),
            cfg.monitor.critical_tables.as_deref(),
        )?;

        let check_interval_secs =
            number(&lookup, "CHECK_INTERVAL_SECS", cfg.monitor.check_interval_secs, 300)?;
        if check_interval_secs == 0 || check_interval_secs > MAX_CHECK_INTERVAL_SECS {
            bail!("CHECK_INTERVAL_SECS must be between 1 and {MAX_CHECK_INTERVAL_SECS}, got {check_interval_secs}");
        }
        let data_loss_threshold = number(
            &lookup,
            "DATA_LOSS_THRESHOLD",
            cfg.monitor.data_loss_threshold,
            DEFAULT_DATA_LOSS_THRESHOLD,
        )?;
        if !(data_loss_threshold > 0.0 && data_loss_threshold < 1.0) {
            bail!("DATA_LOSS_THRESHOLD must be between 0 and 1 (exclusive), got {data_loss_threshold}");
        }
        let backup_max_age_hours =
            number(&lookup, "BACKUP_MAX_AGE_HOURS", cfg.monitor.backup_max_age_hours, 24)?;
        let probe_timeout_secs =
            number(&lookup, "PROBE_TIMEOUT_SECS", cfg.monitor.probe_timeout_secs, 30)?;
        if probe_timeout_secs == 0 {
            bail!("PROBE_TIMEOUT_SECS must be greater than zero");
        }

        let monitor = MonitorPolicy {
            critical_entities,
            check_interval: Duration::from_secs(check_interval_secs),
            data_loss_threshold,
            backup_max_age: i64::try_from(backup_max_age_hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .with_context(|| format!("BACKUP_MAX_AGE_HOURS is too large: {backup_max_age_hours}"))?,
        };

        let retention = RetentionPolicy {
            max_count: number(&lookup, "MAX_BACKUPS", cfg.backup.max_count, 5)?,
            max_age_days: number(&lookup, "BACKUP_RETENTION_DAYS", cfg.backup.retention_days, 7)?,
        };
        if retention.max_count == 0 {
            bail!("MAX_BACKUPS must be at least 1");
        }
        if retention.max_age_days == 0 {
            bail!("BACKUP_RETENTION_DAYS must be at least 1");
        }
        let backup_timeout_secs =
            number(&lookup, "BACKUP_TIMEOUT_SECS", cfg.backup.timeout_secs, 3600)?;
        if backup_timeout_secs == 0 {
            bail!("BACKUP_TIMEOUT_SECS must be greater than zero");
        }

        let mut dump = cfg.backup.dump.clone().unwrap_or_else(CommandSpec::pg_dump);
        if let Some(program) = lookup("BACKUP_DUMP_PROGRAM") {
            dump.program = program;
        }
        let mut restore = cfg.backup.restore.clone().unwrap_or_else(CommandSpec::psql);
        if let Some(program) = lookup("BACKUP_RESTORE_PROGRAM") {
            restore.program = program;
        }

        let mut backup = BackupSettings::new(
            text("BACKUP_DIR", &cfg.backup.dir, "./backups"),
            connection.clone(),
        );
        backup.dump = dump;
        backup.restore = restore;
        backup.retention = retention;
        backup.timeout = Duration::from_secs(backup_timeout_secs);
        backup.compression_level = cfg.backup.compression_level.unwrap_or(3);

        let state = match text("STATE_BACKEND", &cfg.state.backend, "postgres").as_str() {
            "postgres" => StateBackend::Postgres {
                status_type: EntityName::parse(&text(
                    "STATE_STATUS_TYPE",
                    &cfg.state.status_type,
                    DEFAULT_STATUS_TYPE,
                ))
                .context("STATE_STATUS_TYPE")?,
            },
            "sqlite" => StateBackend::Sqlite(PathBuf::from(text(
                "STATE_SQLITE_PATH",
                &cfg.state.sqlite_path,
                "./state/status.db",
            ))),
            other => bail!("STATE_BACKEND must be `postgres` or `sqlite`, got {other:?}"),
        };

        let listen = lookup("LISTEN_ADDR")
            .or_else(|| cfg.server.listen.clone())
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .with_context(|| format!("invalid listen address: {raw}"))
            })
            .transpose()?;

        Ok(Self {
            connection,
            monitor,
            probe_timeout: Duration::from_secs(probe_timeout_secs),
            backup,
            state,
            listen,
        })
    }
}

fn number<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, file: Option<T>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {raw:?} ({e})")),
        None => Ok(file.unwrap_or(default)),
    }
}

fn critical_entities(env: Option<String>, file: Option<&[String]>) -> Result<Vec<EntityName>> {
    let raw: Vec<String> = match (env, file) {
        (Some(list), _) => list.split(',').map(str::to_owned).collect(),
        (None, Some(list)) => list.to_vec(),
        (None, None) => DEFAULT_CRITICAL_TABLES.iter().map(|s| (*s).to_owned()).collect(),
    };

    let mut entities: Vec<EntityName> = Vec::new();
    for name in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let entity = EntityName::parse(name).context("CRITICAL_TABLES")?;
        if !entities.contains(&entity) {
            entities.push(entity);
        }
    }
    if entities.is_empty() {
        bail!("CRITICAL_TABLES must name at least one table");
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn resolve(cfg: &Config, vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Settings::resolve(cfg, |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_allow_local_operation() {
        let settings = resolve(&Config::default(), &[]).expect("defaults");
        assert_eq!(settings.connection, ConnectionParams::default());
        assert_eq!(settings.monitor.check_interval, Duration::from_secs(300));
        assert_eq!(settings.monitor.data_loss_threshold, 0.1);
        assert_eq!(settings.monitor.backup_max_age, chrono::Duration::hours(24));
        assert_eq!(settings.monitor.critical_entities.len(), 3);
        assert_eq!(settings.backup.retention, RetentionPolicy { max_count: 5, max_age_days: 7 });
        assert_eq!(settings.backup.dir, PathBuf::from("./backups"));
        assert_eq!(settings.backup.dump.program, "pg_dump");
        assert_eq!(
            settings.state,
            StateBackend::Postgres {
                status_type: EntityName::parse("system_status_type").expect("type name"),
            }
        );
        assert!(settings.listen.is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let cfg: Config = toml::from_str(
            r#"
            [database]
            host = "db.internal"
            port = 6543

            [backup]
            dir = "/var/backups/app"
            max_count = 10

            [state]
            backend = "sqlite"
            sqlite_path = "/var/lib/dbsentinel/status.db"
            "#,
        )
        .expect("toml");

        let settings = resolve(&cfg, &[("DB_PORT", "5433"), ("MAX_BACKUPS", "3")]).expect("resolve");
        assert_eq!(settings.connection.host, "db.internal");
        assert_eq!(settings.connection.port, 5433);
        assert_eq!(settings.backup.dir, PathBuf::from("/var/backups/app"));
        assert_eq!(settings.backup.retention.max_count, 3);
        assert_eq!(
            settings.state,
            StateBackend::Sqlite(PathBuf::from("/var/lib/dbsentinel/status.db"))
        );
    }

    #[test]
    fn critical_tables_from_env_are_validated_and_deduplicated() {
        let settings = resolve(
            &Config::default(),
            &[("CRITICAL_TABLES", "tenants, auth.users,tenants,")],
        )
        .expect("resolve");
        let names: Vec<&str> = settings
            .monitor
            .critical_entities
            .iter()
            .map(EntityName::as_str)
            .collect();
        assert_eq!(names, vec!["tenants", "auth.users"]);

        let err = resolve(&Config::default(), &[("CRITICAL_TABLES", "tenants;drop")]).unwrap_err();
        assert!(format!("{err:#}").contains("invalid table name"));
    }

    #[test]
    fn invalid_values_are_startup_errors() {
        for vars in [
            [("DB_PORT", "not-a-port")],
            [("CHECK_INTERVAL_SECS", "0")],
            [("DATA_LOSS_THRESHOLD", "1.5")],
            [("MAX_BACKUPS", "0")],
            [("BACKUP_RETENTION_DAYS", "0")],
            [("BACKUP_MAX_AGE_HOURS", "9999999999999")],
            [("BACKUP_MAX_AGE_HOURS", "18446744073709551615")],
            [("CHECK_INTERVAL_SECS", "9999999999999")],
            [("STATE_STATUS_TYPE", "status; drop table x")],
            [("STATE_BACKEND", "mysql")],
            [("LISTEN_ADDR", "nowhere")],
        ] {
            assert!(resolve(&Config::default(), &vars).is_err(), "{vars:?} should fail");
        }
    }

    #[test]
    fn oversized_durations_are_errors_not_panics() {
        let result = std::panic::catch_unwind(|| {
            resolve(&Config::default(), &[("BACKUP_MAX_AGE_HOURS", "9999999999999")])
                .map(|_| ())
                .map_err(|e| format!("{e:#}"))
        });
        let err = result.expect("resolve must not panic").unwrap_err();
        assert!(err.contains("BACKUP_MAX_AGE_HOURS"), "{err}");
    }

    #[test]
    fn status_type_can_name_a_schema_qualified_enum() {
        let settings = resolve(&Config::default(), &[("STATE_STATUS_TYPE", "audit.lifecycle_status")])
            .expect("resolve");
        assert_eq!(
            settings.state,
            StateBackend::Postgres {
                status_type: EntityName::parse("audit.lifecycle_status").expect("type name"),
            }
        );
    }

    #[test]
    fn dump_program_can_be_swapped() {
        let settings = resolve(&Config::default(), &[("BACKUP_DUMP_PROGRAM", "/opt/pg16/bin/pg_dump")])
            .expect("resolve");
        assert_eq!(settings.backup.dump.program, "/opt/pg16/bin/pg_dump");
        assert_eq!(settings.backup.dump.args, CommandSpec::pg_dump().args);
    }
}
