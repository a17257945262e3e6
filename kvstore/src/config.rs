//! Client configuration.
//!
//! [`ClientOptions`] are loaded from the environment and describe how to reach the store and how
//! hard the client may hit it. [`ExtraOptions`] are set by the embedding agent and tune the
//! behaviour of the lease, lock and status machinery. The optional YAML [`ConfigFile`] lists the
//! endpoints and the TLS material.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kvstore_throttling::LimiterConfig;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::metrics::KvStoreMetrics;

/// Key refreshed periodically by the heartbeat writer.
pub const HEARTBEAT_PATH: &str = "kvstore/.heartbeat";
/// Prefix of the locks taken by the connection handshake and the quorum check.
pub const INIT_LOCK_PATH: &str = "kvstore/.initlock";

pub const DEFAULT_QPS: f64 = 20.0;
pub const DEFAULT_LIST_BATCH_SIZE: usize = 256;
pub const DEFAULT_KEEPALIVE_HEARTBEAT: Duration = Duration::from_secs(15);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(25);

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_LOCK_LEASE_TTL: Duration = Duration::from_secs(25);
pub const DEFAULT_MAX_KEYS_PER_LEASE: usize = 1000;
pub const DEFAULT_MAX_CONSECUTIVE_QUORUM_ERRORS: u32 = 2;
pub const DEFAULT_STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_WRITE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll interval while waiting for the configuration files to show up.
pub const CONFIG_FILE_POLL_INTERVAL: Duration = Duration::from_secs(5);

const ENV_ETCD_ADDRESS: &str = "KVSTORE_ETCD_ADDRESS";
const ENV_ETCD_CONFIG: &str = "KVSTORE_ETCD_CONFIG";
const ENV_ETCD_QPS: &str = "KVSTORE_ETCD_QPS";
const ENV_ETCD_BOOTSTRAP_QPS: &str = "KVSTORE_ETCD_BOOTSTRAP_QPS";
const ENV_ETCD_MAX_INFLIGHT: &str = "KVSTORE_ETCD_MAX_INFLIGHT";
const ENV_ETCD_LIST_LIMIT: &str = "KVSTORE_ETCD_LIST_LIMIT";
const ENV_ETCD_KEEPALIVE_HEARTBEAT: &str = "KVSTORE_ETCD_KEEPALIVE_HEARTBEAT";
const ENV_ETCD_KEEPALIVE_TIMEOUT: &str = "KVSTORE_ETCD_KEEPALIVE_TIMEOUT";

/// How to reach the store and how much load the client may put on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Single endpoint, used when no config file is given.
    pub endpoint: Option<String>,
    pub config_path: Option<PathBuf>,
    pub qps: f64,
    /// Rate used until bootstrap completes. Only honoured together with a bootstrap signal.
    pub bootstrap_qps: Option<f64>,
    /// Defaults to `qps` when unset.
    pub max_inflight: Option<usize>,
    pub list_batch_size: usize,
    pub keep_alive_heartbeat: Duration,
    pub keep_alive_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            endpoint: None,
            config_path: None,
            qps: DEFAULT_QPS,
            bootstrap_qps: None,
            max_inflight: None,
            list_batch_size: DEFAULT_LIST_BATCH_SIZE,
            keep_alive_heartbeat: DEFAULT_KEEPALIVE_HEARTBEAT,
            keep_alive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

impl ClientOptions {
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| {
                [
                    ENV_ETCD_ADDRESS,
                    ENV_ETCD_CONFIG,
                    ENV_ETCD_QPS,
                    ENV_ETCD_BOOTSTRAP_QPS,
                    ENV_ETCD_MAX_INFLIGHT,
                    ENV_ETCD_LIST_LIMIT,
                    ENV_ETCD_KEEPALIVE_HEARTBEAT,
                    ENV_ETCD_KEEPALIVE_TIMEOUT,
                ]
                .contains(&key.as_str())
            })
            .collect();

        let get_var = |var: &str| -> Result<String> {
            Ok(env_vars
                .get(var)
                .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))?
                .to_string())
        };

        let defaults = ClientOptions::default();
        let options = ClientOptions {
            endpoint: get_var(ENV_ETCD_ADDRESS).ok().filter(|v| !v.is_empty()),
            config_path: get_var(ENV_ETCD_CONFIG)
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            qps: parse_opt(ENV_ETCD_QPS, get_var(ENV_ETCD_QPS).ok())?.unwrap_or(defaults.qps),
            bootstrap_qps: parse_opt(ENV_ETCD_BOOTSTRAP_QPS, get_var(ENV_ETCD_BOOTSTRAP_QPS).ok())?
                .filter(|qps: &f64| *qps > 0.0),
            max_inflight: parse_opt(ENV_ETCD_MAX_INFLIGHT, get_var(ENV_ETCD_MAX_INFLIGHT).ok())?
                .filter(|inflight: &usize| *inflight > 0),
            list_batch_size: parse_opt(ENV_ETCD_LIST_LIMIT, get_var(ENV_ETCD_LIST_LIMIT).ok())?
                .unwrap_or(defaults.list_batch_size),
            keep_alive_heartbeat: parse_duration(
                ENV_ETCD_KEEPALIVE_HEARTBEAT,
                get_var(ENV_ETCD_KEEPALIVE_HEARTBEAT).ok(),
            )?
            .unwrap_or(defaults.keep_alive_heartbeat),
            keep_alive_timeout: parse_duration(
                ENV_ETCD_KEEPALIVE_TIMEOUT,
                get_var(ENV_ETCD_KEEPALIVE_TIMEOUT).ok(),
            )?
            .unwrap_or(defaults.keep_alive_timeout),
        };
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_none() && self.config_path.is_none() {
            return Err(Error::Config(format!(
                "invalid kvstore configuration, {ENV_ETCD_CONFIG} or {ENV_ETCD_ADDRESS} must be specified"
            )));
        }
        Ok(())
    }

    /// Limiter settings. The bootstrap rate applies only when a bootstrap signal exists to end it.
    pub(crate) fn limiter_config(&self, has_bootstrap_signal: bool) -> LimiterConfig {
        LimiterConfig {
            qps: self.qps,
            bootstrap_qps: self.bootstrap_qps.filter(|_| has_bootstrap_signal),
            max_inflight: self
                .max_inflight
                .unwrap_or_else(|| self.qps.ceil().max(1.0) as usize),
        }
    }
}

fn parse_opt<T: FromStr>(var: &str, value: Option<String>) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("Invalid value for {var}: {v}")))
        })
        .transpose()
}

fn parse_duration(var: &str, value: Option<String>) -> Result<Option<Duration>> {
    value
        .map(|v| {
            humantime::parse_duration(v.trim())
                .map_err(|e| Error::Config(format!("Invalid duration for {var}: {v} ({e})")))
        })
        .transpose()
}

/// Knobs set by the embedding agent.
#[derive(Debug)]
pub struct ExtraOptions {
    /// Skip the lock based quorum check at connect time and in the status loop.
    pub no_lock_quorum_check: bool,
    pub no_endpoint_status_checks: bool,
    pub cluster_name: Option<String>,
    pub lease_ttl: Duration,
    pub lock_lease_ttl: Duration,
    pub max_keys_per_lease: usize,
    pub max_consecutive_quorum_errors: u32,
    pub status_check_interval: Duration,
    pub status_check_timeout: Duration,
    /// Expected heartbeat period, twice this without a heartbeat counts as a quorum error.
    pub heartbeat_write_interval: Duration,
    pub initial_connection_timeout: Duration,
    pub lock_timeout: Duration,
    /// Fired by the agent once its bootstrap is over, switching the limiter to the steady rate.
    pub bootstrap_complete: Option<oneshot::Receiver<()>>,
    pub metrics: Arc<KvStoreMetrics>,
}

impl Default for ExtraOptions {
    fn default() -> Self {
        ExtraOptions {
            no_lock_quorum_check: false,
            no_endpoint_status_checks: false,
            cluster_name: None,
            lease_ttl: DEFAULT_LEASE_TTL,
            lock_lease_ttl: DEFAULT_LOCK_LEASE_TTL,
            max_keys_per_lease: DEFAULT_MAX_KEYS_PER_LEASE,
            max_consecutive_quorum_errors: DEFAULT_MAX_CONSECUTIVE_QUORUM_ERRORS,
            status_check_interval: DEFAULT_STATUS_CHECK_INTERVAL,
            status_check_timeout: DEFAULT_STATUS_CHECK_TIMEOUT,
            heartbeat_write_interval: DEFAULT_HEARTBEAT_WRITE_INTERVAL,
            initial_connection_timeout: DEFAULT_INITIAL_CONNECTION_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            bootstrap_complete: None,
            metrics: Arc::new(KvStoreMetrics::default()),
        }
    }
}

impl ExtraOptions {
    /// The interval widens while some endpoints are unreachable.
    pub fn status_check_interval(&self, all_connected: bool) -> Duration {
        if all_connected {
            self.status_check_interval
        } else {
            self.status_check_interval.saturating_mul(2)
        }
    }

    pub(crate) fn session_name(&self) -> String {
        match &self.cluster_name {
            Some(cluster) => format!("kvstore-{cluster}"),
            None => "kvstore".to_string(),
        }
    }
}

/// YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub trusted_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

impl ConfigFile {
    pub fn parse(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    pub fn uses_tls(&self) -> bool {
        self.cert_file.is_some()
            || self.key_file.is_some()
            || self.trusted_ca_file.is_some()
            || self.insecure_skip_tls_verify
            || self.endpoints.iter().any(|ep| ep.starts_with("https://"))
    }

    fn referenced_files(&self) -> impl Iterator<Item = &Path> {
        [&self.cert_file, &self.key_file, &self.trusted_ca_file]
            .into_iter()
            .filter_map(|f| f.as_deref())
    }

    /// Waits until the file and everything it references exist, then loads it. Secrets are often
    /// mounted after the agent starts.
    pub(crate) async fn wait_and_load(
        path: &Path,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        loop {
            if path.exists() {
                let file = Self::load(path)?;
                if file.referenced_files().all(Path::exists) {
                    return Ok(file);
                }
            }
            info!(
                config = %path.display(),
                "Waiting for all kvstore configuration files to be available"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let env_vars = [(ENV_ETCD_ADDRESS, "http://10.0.0.1:2379")];
        let options = ClientOptions::load(env_vars).unwrap();
        assert_eq!(options.endpoint.as_deref(), Some("http://10.0.0.1:2379"));
        assert_eq!(options.qps, DEFAULT_QPS);
        assert_eq!(options.list_batch_size, DEFAULT_LIST_BATCH_SIZE);
        assert_eq!(options.keep_alive_heartbeat, DEFAULT_KEEPALIVE_HEARTBEAT);
        assert_eq!(options.max_inflight, None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_load_all_vars() {
        let env_vars = [
            (ENV_ETCD_CONFIG, "/var/lib/kvstore/config.yaml"),
            (ENV_ETCD_QPS, "50"),
            (ENV_ETCD_BOOTSTRAP_QPS, "200"),
            (ENV_ETCD_MAX_INFLIGHT, "10"),
            (ENV_ETCD_LIST_LIMIT, "1000"),
            (ENV_ETCD_KEEPALIVE_HEARTBEAT, "30s"),
            (ENV_ETCD_KEEPALIVE_TIMEOUT, "1m"),
            ("UNRELATED", "ignored"),
        ];
        let options = ClientOptions::load(env_vars).unwrap();
        assert_eq!(
            options.config_path,
            Some(PathBuf::from("/var/lib/kvstore/config.yaml"))
        );
        assert_eq!(options.qps, 50.0);
        assert_eq!(options.bootstrap_qps, Some(200.0));
        assert_eq!(options.max_inflight, Some(10));
        assert_eq!(options.list_batch_size, 1000);
        assert_eq!(options.keep_alive_heartbeat, Duration::from_secs(30));
        assert_eq!(options.keep_alive_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_load_invalid_values() {
        let err = ClientOptions::load([(ENV_ETCD_QPS, "fast")]).unwrap_err();
        assert!(err.to_string().contains(ENV_ETCD_QPS));

        let err = ClientOptions::load([(ENV_ETCD_KEEPALIVE_TIMEOUT, "soon")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_requires_endpoint_or_config() {
        let err = ClientOptions::default().validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config Error - invalid kvstore configuration, KVSTORE_ETCD_CONFIG or KVSTORE_ETCD_ADDRESS must be specified"
        );
    }

    #[test]
    fn test_limiter_config() {
        let options = ClientOptions {
            qps: 7.5,
            bootstrap_qps: Some(100.0),
            ..Default::default()
        };
        let config = options.limiter_config(false);
        assert_eq!(config.bootstrap_qps, None);
        assert_eq!(config.max_inflight, 8);

        let config = options.limiter_config(true);
        assert_eq!(config.bootstrap_qps, Some(100.0));
    }

    #[test]
    fn test_status_check_interval_widens() {
        let extra = ExtraOptions::default();
        assert_eq!(
            extra.status_check_interval(true),
            DEFAULT_STATUS_CHECK_INTERVAL
        );
        assert_eq!(
            extra.status_check_interval(false),
            DEFAULT_STATUS_CHECK_INTERVAL * 2
        );
    }

    #[test]
    fn test_parse_config_file() {
        let file = ConfigFile::parse(
            r#"
endpoints:
  - https://10.0.0.1:2379
  - https://10.0.0.2:2379
trusted-ca-file: /etc/kvstore/ca.crt
cert-file: /etc/kvstore/client.crt
key-file: /etc/kvstore/client.key
"#,
        )
        .unwrap();
        assert_eq!(file.endpoints.len(), 2);
        assert_eq!(file.key_file, Some(PathBuf::from("/etc/kvstore/client.key")));
        assert!(!file.insecure_skip_tls_verify);
        assert!(file.uses_tls());

        let plain = ConfigFile::parse("endpoints: [\"http://127.0.0.1:2379\"]").unwrap();
        assert!(!plain.uses_tls());
    }

    #[tokio::test]
    async fn test_wait_and_load_waits_for_referenced_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        let ca = dir.path().join("ca.crt");
        std::fs::write(
            &config,
            format!(
                "endpoints: [\"https://127.0.0.1:2379\"]\ntrusted-ca-file: {}\n",
                ca.display()
            ),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ConfigFile::wait_and_load(&config, Duration::from_millis(10), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        std::fs::write(&ca, "ca").unwrap();
        let file = waiter.await.unwrap().unwrap();
        assert_eq!(file.trusted_ca_file, Some(ca));
    }

    #[tokio::test]
    async fn test_wait_and_load_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ConfigFile::wait_and_load(
            &dir.path().join("missing.yaml"),
            Duration::from_millis(10),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
