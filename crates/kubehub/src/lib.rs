//! Tether kubehub – client wiring, single-object ConfigMap watch and resync fetch

#![forbid(unsafe_code)]

mod watch;

use std::path::Path;
use std::time::Instant;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    error::ErrorResponse,
    runtime::{watcher, WatchStreamExt},
    Client, Config,
};
use metrics::histogram;
use tether_core::{ChangeNotification, Data, Fetcher, ResourceKey, SourceError, TetherError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use watch::{pump, Normalizer};

/// Build a kube client from an explicit kubeconfig path, or infer one
/// (the default kubeconfig first, then the in-cluster service account).
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client, TetherError> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .map_err(|e| TetherError::Configuration(format!("reading kubeconfig {}: {}", path.display(), e)))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| TetherError::Configuration(format!("loading kubeconfig {}: {}", path.display(), e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| TetherError::Configuration(format!("inferring kube config: {}", e)))?,
    };
    debug!(cluster_url = %config.cluster_url, "kube config loaded");
    Client::try_from(config).map_err(|e| TetherError::Configuration(format!("building kube client: {}", e)))
}

/// Server-side filter that scopes list/watch to exactly one object.
pub fn field_selector(key: &ResourceKey) -> String {
    format!("metadata.name={}", key.name)
}

/// Live subscription to one ConfigMap. Consumed by [`ChangeStream::spawn`].
pub struct ChangeStream {
    api: Api<ConfigMap>,
    key: ResourceKey,
}

/// Establish the change stream. A single-object list is issued first so that
/// RBAC or connectivity problems fail here, before any reconciliation starts.
pub async fn subscribe(client: Client, key: &ResourceKey) -> Result<ChangeStream, TetherError> {
    let api: Api<ConfigMap> = Api::namespaced(client, &key.namespace);
    let lp = ListParams::default().fields(&field_selector(key)).limit(1);
    let found = api
        .list(&lp)
        .await
        .map_err(|e| TetherError::SubscriptionSetup(format!("{}: {}", key, e)))?;
    info!(resource = %key, present = !found.items.is_empty(), "subscription preflight ok");
    Ok(ChangeStream { api, key: key.clone() })
}

impl ChangeStream {
    pub fn key(&self) -> &ResourceKey { &self.key }

    /// Spawn the adapter task pumping normalized notifications into `tx`.
    /// Reconnects are handled by the kube watcher with its default backoff.
    pub fn spawn(self, tx: mpsc::Sender<ChangeNotification>, cancel: CancellationToken) -> JoinHandle<()> {
        let cfg = watcher::Config::default().fields(&field_selector(&self.key));
        let stream = watcher::watcher(self.api, cfg).default_backoff();
        let key = self.key;
        tokio::spawn(async move {
            pump(stream, key, tx, cancel).await;
        })
    }
}

/// Resync fetcher: a direct GET of the ConfigMap.
#[derive(Clone)]
pub struct KubeFetcher {
    client: Client,
}

impl KubeFetcher {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl Fetcher for KubeFetcher {
    async fn fetch(&self, key: &ResourceKey) -> Result<Data, SourceError> {
        let started = Instant::now();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        let res = api.get(&key.name).await;
        histogram!("tether_fetch_ms", started.elapsed().as_secs_f64() * 1000.0);
        let cm = res.map_err(|e| classify(&e))?;
        Ok(cm.data.unwrap_or_default())
    }
}

/// Classify a kube client error for the retry policy.
pub fn classify(err: &kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => classify_status(resp),
        kube::Error::Auth(e) => SourceError::Permanent(format!("auth: {}", e)),
        kube::Error::SerdeError(e) => SourceError::Permanent(format!("decoding response: {}", e)),
        other => SourceError::Transient(other.to_string()),
    }
}

/// Client errors that will not go away by themselves are permanent;
/// conflicts, expired resource versions, throttling and server errors are not.
pub fn classify_status(resp: &ErrorResponse) -> SourceError {
    let msg = format!("{} ({}): {}", resp.code, resp.reason, resp.message);
    match resp.code {
        400 | 401 | 403 | 404 | 405 | 422 => SourceError::Permanent(msg),
        _ => SourceError::Transient(msg),
    }
}

pub fn classify_watch(err: &watcher::Error) -> SourceError {
    match err {
        watcher::Error::InitialListFailed(e) | watcher::Error::WatchStartFailed(e) | watcher::Error::WatchFailed(e) => {
            classify(e)
        }
        watcher::Error::WatchError(resp) => classify_status(resp),
        other => SourceError::Transient(other.to_string()),
    }
}
