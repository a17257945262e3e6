//! Establishing a client: configuration, transport and the initial handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::strategy::exponential::Exponential;
use kvstore_shared::store::RemoteStore;
use rand::seq::SliceRandom;
use rustls::ClientConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::Client;
use crate::config::{
    CONFIG_FILE_POLL_INTERVAL, ClientOptions, ConfigFile, ExtraOptions, INIT_LOCK_PATH,
};
use crate::error::{Error, Result};
use crate::heartbeat::spawn_heartbeat_watcher;
use crate::status::spawn_status_monitor;
use crate::tls;
use crate::types::ConnectionStatus;

const SESSION_RETRY_MIN: Duration = Duration::from_millis(100);
const SESSION_RETRY_MAX: Duration = Duration::from_secs(10);

/// Everything a transport needs to reach the store.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// In the order they should be tried.
    pub endpoints: Vec<String>,
    pub tls: Option<Arc<ClientConfig>>,
    pub keep_alive_heartbeat: Duration,
    pub keep_alive_timeout: Duration,
}

/// Opens the transport to the store, e.g. an etcd v3 gRPC channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: ConnectTarget) -> Result<Arc<dyn RemoteStore>>;
}

/// Builds a client and blocks until the store is usable: the init lock session is held (unless
/// disabled) and the heartbeat watcher has listed the heartbeat key. The status monitor is
/// running once this returns.
pub async fn connect(
    options: ClientOptions,
    extra: ExtraOptions,
    connector: &dyn Connector,
    cancel: &CancellationToken,
) -> Result<Client> {
    options.validate()?;

    let (mut endpoints, tls) = match &options.config_path {
        Some(path) => {
            let file = ConfigFile::wait_and_load(path, CONFIG_FILE_POLL_INTERVAL, cancel).await?;
            let tls = tls::client_config(&file)?;
            (file.endpoints, tls)
        }
        None => (options.endpoint.iter().cloned().collect(), None),
    };
    if endpoints.is_empty() {
        return Err(Error::Config("no kvstore endpoints configured".to_string()));
    }
    // spread agents over the cluster members
    endpoints.shuffle(&mut rand::rng());

    info!(?endpoints, tls = tls.is_some(), "Connecting to kvstore");
    let target = ConnectTarget {
        endpoints,
        tls,
        keep_alive_heartbeat: options.keep_alive_heartbeat,
        keep_alive_timeout: options.keep_alive_timeout,
    };
    let store = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        store = connector.connect(target) => store?,
    };

    let client = Client::build(store, options, extra)?;
    if let Err(err) = handshake(&client, cancel).await {
        client.inner.set_status(ConnectionStatus::failure(format!(
            "Failed to establish initial connection: {err}"
        )));
        warn!(%err, "Failed to establish initial connection");
        client.close().await;
        return Err(err);
    }

    spawn_status_monitor(&client.inner);
    info!(endpoints = ?client.endpoints(), "Connected to kvstore");
    Ok(client)
}

async fn handshake(client: &Client, cancel: &CancellationToken) -> Result<()> {
    let inner = &client.inner;
    let deadline = Instant::now() + inner.extra.initial_connection_timeout;
    let endpoints = inner.store.endpoints().join(", ");

    if !inner.extra.no_lock_quorum_check {
        match tokio::time::timeout_at(deadline, init_session(client, cancel)).await {
            Ok(session) => session?,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "timed out while waiting for kvstore connection. Ensure that the store is running on {endpoints}"
                )));
            }
        }
    }

    let synced = spawn_heartbeat_watcher(inner);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Error::Connection(format!(
            "timed out while starting the heartbeat watcher. Ensure that the store is running on {endpoints}"
        ))),
        synced = synced => synced.map_err(|_| Error::Cancelled),
    }
}

/// Holds a lock session for the lifetime of the client, retrying until it is granted.
async fn init_session(client: &Client, cancel: &CancellationToken) -> Result<()> {
    let leases = client.inner.locks.leases();
    let mut backoff = Exponential::bounded(SESSION_RETRY_MIN, SESSION_RETRY_MAX);
    loop {
        match leases.get_session(cancel, INIT_LOCK_PATH).await {
            Ok(_) => return Ok(()),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(%err, attempt = backoff.current_attempt(), "Unable to obtain initial kvstore session");
                if !backoff.wait(cancel).await {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}
