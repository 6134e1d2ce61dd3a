use bms_cloud_bridge::client::{CloudClient, SourceClient, SourceHeartbeat};
use bms_cloud_bridge::config::Config;
use bms_cloud_bridge::credentials::{CredentialProvider, PgCredentials};
use bms_cloud_bridge::db::store::{JobStore, PgJobStore, build_pool};
use bms_cloud_bridge::services::health::{HealthMonitor, HealthState};
use bms_cloud_bridge::services::jobs::{JobContext, Jobs};
use bms_cloud_bridge::services::rehydrate::rehydrate;
use bms_cloud_bridge::services::scheduler::Scheduler;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

fn apply_database_migrations(database_url: &str) -> Result<(), String> {
    let mut conn = PgConnection::establish(database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("Applying database migrations failed: {}", e))?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (cloud={}, heartbeat={}, probe_interval={}s, threshold={}, source_timeout={}s, dispatch_timeout={}s, insecure_tls={}, rehydrate={})",
        cfg.cloud_api_url,
        cfg.source_heartbeat_url,
        cfg.health_probe_interval.as_secs(),
        cfg.health_failure_threshold,
        cfg.source_timeout.as_secs(),
        cfg.dispatch_timeout.as_secs(),
        cfg.source_tls_insecure,
        cfg.rehydrate_enabled
    );

    // 2) Apply pending database migrations
    apply_database_migrations(&cfg.database_url)?;

    // 3) Connection pool shared by ticks, the monitor and credential lookups
    let pool = build_pool(&cfg.database_url, cfg.db_pool_size)?;
    info!("Connected to database (pool size {})", cfg.db_pool_size);
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let credentials: Arc<dyn CredentialProvider> = Arc::new(PgCredentials::new(pool));

    // 4) Clients and the job service
    let source = Arc::new(SourceClient::new(cfg.source_timeout, cfg.source_tls_insecure));
    let sink = Arc::new(CloudClient::new(cfg.cloud_api_url.clone(), cfg.dispatch_timeout));
    let jobs = Jobs::new(
        JobContext::new(Arc::clone(&store), source, sink, Arc::clone(&credentials)),
        Arc::new(Scheduler::new()),
    );

    // 5) Resume jobs whose flags survived the restart
    if cfg.rehydrate_enabled {
        rehydrate(&jobs);
    } else {
        info!("Rehydration disabled via REHYDRATE_ENABLED={}", cfg.rehydrate_enabled);
    }

    // 6) Health monitor runs for the life of the process
    let probe = SourceHeartbeat::new(
        cfg.source_heartbeat_url.clone(),
        cfg.health_probe_timeout,
        cfg.source_tls_insecure,
        credentials,
    );
    let monitor = HealthMonitor::new(
        HealthState::new(cfg.health_failure_threshold.get(), cfg.health_probe_interval),
        Arc::new(probe),
        store,
    )
    .spawn()
    .map_err(|e| format!("Starting health monitor failed: {}", e))?;

    info!(
        "Ready: {} fetch and {} send job(s) running",
        jobs.scheduler().fetch_count(),
        jobs.scheduler().send_count()
    );
    monitor.join();
    jobs.shutdown();
    Err("health monitor exited unexpectedly".to_string())
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let env_file = parse_cli_args(std::env::args_os().skip(1))?;

    match env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            load_env_file(&path)?;
            Ok(Some(LoadedEnvFile { path, explicit: true }))
        }
        None => {
            let path = Path::new(".env").to_path_buf();
            if !path.is_file() {
                return Ok(None);
            }
            load_env_file(&path)?;
            Ok(Some(LoadedEnvFile { path, explicit: false }))
        }
    }
}

/// `--env-file <path>` or `--env-file=<path>`, at most once; `--` ends parsing.
fn parse_cli_args(mut args: impl Iterator<Item = OsString>) -> Result<Option<PathBuf>, String> {
    let mut env_file: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let path = match arg.to_str() {
            Some("--env-file") => args
                .next()
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            Some("--") => break,
            Some(flag) => match flag.strip_prefix("--env-file=") {
                Some(p) => OsString::from(p),
                None => return Err(format!("unrecognised argument: {}", flag)),
            },
            None => return Err(format!("argument contains invalid UTF-8: {}", arg.to_string_lossy())),
        };
        if path.is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if env_file.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(env_file)
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let parsed = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        if let Some((key, value)) = parsed {
            // Values already in the process environment win.
            if std::env::var_os(&key).is_none() {
                // Updating process-level environment variables is unsafe on some targets.
                unsafe {
                    std::env::set_var(key, value);
                }
            }
        }
    }
    Ok(())
}

/// `KEY=value`, `export KEY=value`, quoted values and trailing `#` comments.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_env_value(raw.trim())?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        let unquoted = raw.split('#').next().unwrap_or_default();
        return Ok(unquoted.trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => {
                let escaped = chars.next().ok_or_else(|| "unterminated escape sequence".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = chars.as_str().trim();
                return if rest.is_empty() || rest.starts_with('#') {
                    Ok(value)
                } else {
                    Err("unexpected characters after closing quote".to_string())
                };
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "bms-cloud-bridge {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
