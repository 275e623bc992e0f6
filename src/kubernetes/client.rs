//! Kubernetes API client
//!
//! Builds a `kube::Client` from the configured kubeconfig/context, or by
//! inference when neither is set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::KubeSettings;

type CacheKey = (Option<PathBuf>, Option<String>);

/// Global client cache - avoids recreating clients (expensive TLS handshake) for the same settings
static CLIENT_CACHE: OnceLock<RwLock<HashMap<CacheKey, Client>>> = OnceLock::new();

fn get_client_cache() -> &'static RwLock<HashMap<CacheKey, Client>> {
    CLIENT_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

#[derive(Debug, Error)]
pub enum KubeClientError {
    #[error("Failed to create client: {0}")]
    ClientError(#[from] kube::Error),
    #[error("Failed to load config: {0}")]
    ConfigError(#[from] kube::config::KubeconfigError),
    #[error("Failed to infer config: {0}")]
    InferError(#[from] kube::config::InferConfigError),
}

/// Kubernetes API client
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    context_name: String,
}

impl KubeClient {
    /// Connect using `settings` (cached per kubeconfig/context pair)
    pub async fn connect(settings: &KubeSettings) -> Result<Self, KubeClientError> {
        let key: CacheKey = (settings.kubeconfig.clone(), settings.context.clone());
        let context_name = describe(settings);
        let cache = get_client_cache();

        {
            let read_guard = cache.read().await;
            if let Some(client) = read_guard.get(&key) {
                tracing::debug!("K8s client cache HIT for {}", context_name);
                return Ok(Self {
                    client: client.clone(),
                    context_name,
                });
            }
        }

        tracing::info!("K8s client cache MISS for {} - creating new client", context_name);
        let start = std::time::Instant::now();

        let config = load_config(settings).await?;
        tracing::debug!("Config loaded in {:?}", start.elapsed());

        let client = Client::try_from(config)?;
        cache.write().await.insert(key, client.clone());

        tracing::info!("K8s client for {} created in {:?}", context_name, start.elapsed());
        Ok(Self { client, context_name })
    }

    /// Get the context name this client is connected to
    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Get the raw kube client for exec operations
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Query the API server version. Used as a startup reachability probe.
    pub async fn server_version(&self) -> Result<String, KubeClientError> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("context_name", &self.context_name)
            .finish_non_exhaustive()
    }
}

async fn load_config(settings: &KubeSettings) -> Result<Config, KubeClientError> {
    let options = KubeConfigOptions {
        context: settings.context.clone(),
        ..Default::default()
    };
    let config = match (&settings.kubeconfig, &settings.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options).await?,
        // In-cluster service account, then KUBECONFIG / ~/.kube/config
        (None, None) => Config::infer().await?,
    };
    Ok(config)
}

fn describe(settings: &KubeSettings) -> String {
    match (&settings.kubeconfig, &settings.context) {
        (Some(path), Some(context)) => format!("{}@{}", context, path.display()),
        (Some(path), None) => format!("current-context@{}", path.display()),
        (None, Some(context)) => context.clone(),
        (None, None) => "inferred".to_string(),
    }
}
