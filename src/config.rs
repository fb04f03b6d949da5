//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the store.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Ingester worker count.
    pub ingest_workers: usize,
    /// Historical-scan worker count.
    pub req_workers: usize,
    /// Live-monitor partition count.
    pub monitor_workers: usize,
    /// Negentropy worker count.
    pub neg_workers: usize,
    /// Maximum events per write batch.
    pub write_batch_max: usize,
    /// Maximum time a write batch stays open.
    pub write_batch_window_ms: u64,
    /// CPU budget per scan timeslice, microseconds.
    pub query_timeslice_us: u64,
    /// Maximum open subscriptions per connection.
    pub max_subs_per_conn: usize,
    /// Reject events older than this many seconds.
    pub reject_older_secs: i64,
    /// Reject events further in the future than this many seconds.
    pub reject_newer_secs: i64,
    /// How long ephemeral events stay deliverable, seconds.
    pub ephemeral_lifetime_secs: u64,
    /// Record cap for a single negentropy session.
    pub max_sync_events: usize,
    /// Store byte budget.
    pub store_map_bytes: u64,
    /// Maximum serialized event size.
    pub max_event_bytes: usize,
    /// Depth of the bounded inter-pool queues.
    pub queue_depth: usize,
    /// Transient commit retry count.
    pub commit_retries: usize,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        Ok(Self {
            store_root: PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT")?),
            bind_http: env::var("BIND_HTTP").context("BIND_HTTP")?,
            bind_ws: env::var("BIND_WS").context("BIND_WS")?,
            verify_sig: env::var("VERIFY_SIG").map(|v| v == "1").unwrap_or(true),
            ingest_workers: var_parsed("INGEST_WORKERS", 3)?,
            req_workers: var_parsed("REQ_WORKERS", 3)?,
            monitor_workers: var_parsed("MONITOR_WORKERS", 3)?,
            neg_workers: var_parsed("NEG_WORKERS", 2)?,
            write_batch_max: var_parsed("WRITE_BATCH_MAX", 100)?,
            write_batch_window_ms: var_parsed("WRITE_BATCH_WINDOW_MS", 10)?,
            query_timeslice_us: var_parsed("QUERY_TIMESLICE_US", 10_000)?,
            max_subs_per_conn: var_parsed("MAX_SUBS_PER_CONN", 20)?,
            reject_older_secs: var_parsed("REJECT_OLDER_SECS", 94_608_000)?,
            reject_newer_secs: var_parsed("REJECT_NEWER_SECS", 900)?,
            ephemeral_lifetime_secs: var_parsed("EPHEMERAL_LIFETIME_SECS", 300)?,
            max_sync_events: var_parsed("MAX_SYNC_EVENTS", 1_000_000)?,
            store_map_bytes: var_parsed("STORE_MAP_BYTES", 1 << 30)?,
            max_event_bytes: var_parsed("MAX_EVENT_BYTES", 128 * 1024)?,
            queue_depth: var_parsed("QUEUE_DEPTH", 1024)?,
            commit_retries: var_parsed("COMMIT_RETRIES", 3)?,
        })
    }
}

/// Serialises tests that mutate process environment variables.
#[cfg(test)]
pub static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
impl Settings {
    /// In-process defaults for module tests; signature checks stay off
    /// so fixtures can fabricate events freely.
    pub fn for_tests(root: &std::path::Path) -> Settings {
        Settings {
            store_root: root.to_path_buf(),
            bind_http: "127.0.0.1:0".into(),
            bind_ws: "127.0.0.1:0".into(),
            verify_sig: false,
            ingest_workers: 2,
            req_workers: 2,
            monitor_workers: 2,
            neg_workers: 1,
            write_batch_max: 100,
            write_batch_window_ms: 2,
            query_timeslice_us: 10_000,
            max_subs_per_conn: 20,
            reject_older_secs: i64::MAX / 4,
            reject_newer_secs: i64::MAX / 4,
            ephemeral_lifetime_secs: 300,
            max_sync_events: 100_000,
            store_map_bytes: 1 << 30,
            max_event_bytes: 128 * 1024,
            queue_depth: 1024,
            commit_retries: 3,
        }
    }
}

/// Read an optional variable, falling back to `default` when unset and
/// failing loudly when set to an unparseable value.
fn var_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().with_context(|| format!("parsing {name}"))
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    use super::ENV_LOCK as ENV_MUTEX;

    const ALL_VARS: &[&str] = &[
        "STORE_ROOT",
        "BIND_HTTP",
        "BIND_WS",
        "VERIFY_SIG",
        "INGEST_WORKERS",
        "REQ_WORKERS",
        "MONITOR_WORKERS",
        "NEG_WORKERS",
        "WRITE_BATCH_MAX",
        "WRITE_BATCH_WINDOW_MS",
        "QUERY_TIMESLICE_US",
        "MAX_SUBS_PER_CONN",
        "REJECT_OLDER_SECS",
        "REJECT_NEWER_SECS",
        "EPHEMERAL_LIFETIME_SECS",
        "MAX_SYNC_EVENTS",
        "STORE_MAP_BYTES",
        "MAX_EVENT_BYTES",
        "QUEUE_DEPTH",
        "COMMIT_RETRIES",
    ];

    fn clear_env() {
        for v in ALL_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env_with_defaults() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp/q\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp/q"));
        assert!(cfg.verify_sig);
        assert_eq!(cfg.ingest_workers, 3);
        assert_eq!(cfg.req_workers, 3);
        assert_eq!(cfg.monitor_workers, 3);
        assert_eq!(cfg.neg_workers, 2);
        assert_eq!(cfg.write_batch_max, 100);
        assert_eq!(cfg.write_batch_window_ms, 10);
        assert_eq!(cfg.query_timeslice_us, 10_000);
        assert_eq!(cfg.ephemeral_lifetime_secs, 300);
        assert_eq!(cfg.commit_retries, 3);
    }

    #[test]
    fn overrides_apply() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp/q\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "VERIFY_SIG=0\n",
                "INGEST_WORKERS=7\n",
                "WRITE_BATCH_MAX=5\n",
                "MAX_SUBS_PER_CONN=2\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(!cfg.verify_sig);
        assert_eq!(cfg.ingest_workers, 7);
        assert_eq!(cfg.write_batch_max, 5);
        assert_eq!(cfg.max_subs_per_conn, 2);
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND_HTTP=127.0.0.1:8080\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn unparseable_numeric_is_an_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp/q\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "QUEUE_DEPTH=lots\n"
            ),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }
}
