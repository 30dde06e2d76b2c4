//! The process-wide secret store.

use crate::native::NativeProvider;
use cinder_core::ports::SecretProvider;
use cinder_core::secrets::{SecretBundle, SecretMasker, SecretValue};
use cinder_core::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Configuration for the secret store.
#[derive(Debug, Clone)]
pub struct SecretStoreConfig {
    /// How long a resolved value is reused. `None` disables caching.
    pub cache_ttl: Option<Duration>,
    /// Whether [`SecretStore::masker`] masks anything at all.
    pub mask_in_logs: bool,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Some(Duration::from_secs(300)),
            mask_in_logs: true,
        }
    }
}

struct CachedSecret {
    value: SecretValue,
    cached_at: Instant,
}

/// Resolves secrets by name through an ordered provider chain.
///
/// Values set with [`SecretStore::insert`] live in a built-in encrypted
/// provider that is consulted first. Every value handed out is remembered
/// so that step output can be masked.
pub struct SecretStore {
    config: SecretStoreConfig,
    native: Arc<NativeProvider>,
    providers: Vec<Arc<dyn SecretProvider>>,
    cache: RwLock<HashMap<String, CachedSecret>>,
    revealed: RwLock<BTreeSet<String>>,
}

impl SecretStore {
    pub fn new(config: SecretStoreConfig) -> Self {
        Self {
            config,
            native: Arc::new(NativeProvider::ephemeral()),
            providers: Vec::new(),
            cache: RwLock::new(HashMap::new()),
            revealed: RwLock::new(BTreeSet::new()),
        }
    }

    /// Append a provider to the chain; earlier providers win.
    pub fn with_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.add_provider(provider);
        self
    }

    pub fn add_provider(&mut self, provider: Arc<dyn SecretProvider>) {
        info!(provider = %provider.name(), "registering secret provider");
        self.providers.push(provider);
    }

    pub fn provider_names(&self) -> Vec<String> {
        std::iter::once(self.native.name())
            .chain(self.providers.iter().map(|p| p.name()))
            .map(str::to_string)
            .collect()
    }

    /// Store a secret in the built-in provider.
    pub async fn insert(&self, name: &str, value: &str) -> Result<()> {
        self.native.store(name, value)?;
        self.cache.write().await.remove(name);
        Ok(())
    }

    /// Resolve one secret. Fails with `SecretNotFound` when no provider has it.
    pub async fn resolve(&self, name: &str) -> Result<SecretValue> {
        if let Some(ttl) = self.config.cache_ttl {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(name)
                && cached.cached_at.elapsed() < ttl
            {
                debug!(secret = %name, "secret cache hit");
                return Ok(cached.value.clone());
            }
        }

        let chain = std::iter::once(self.native.clone() as Arc<dyn SecretProvider>)
            .chain(self.providers.iter().cloned());
        for provider in chain {
            let Some(value) = provider.get(name).await? else {
                continue;
            };
            debug!(secret = %name, provider = %provider.name(), "secret resolved");
            self.remember(name, &value).await;
            return Ok(value);
        }

        Err(Error::SecretNotFound(name.to_string()))
    }

    /// Resolve every name, failing on the first missing one.
    pub async fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> Result<SecretBundle> {
        let mut bundle = SecretBundle::default();
        for name in names {
            let name = name.as_ref();
            if bundle.get(name).is_none() {
                bundle.insert(name, self.resolve(name).await?);
            }
        }
        Ok(bundle)
    }

    async fn remember(&self, name: &str, value: &SecretValue) {
        if self.config.cache_ttl.is_some() {
            self.cache.write().await.insert(
                name.to_string(),
                CachedSecret {
                    value: value.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        if !value.is_empty() {
            self.revealed
                .write()
                .await
                .insert(value.expose().to_string());
        }
    }

    /// A masker covering every value resolved so far.
    pub async fn masker(&self) -> SecretMasker {
        if !self.config.mask_in_logs {
            return SecretMasker::default();
        }
        let revealed = self.revealed.read().await;
        SecretMasker::new(revealed.iter().cloned())
    }

    /// Mask a string by replacing resolved secret values with `***`.
    pub async fn mask_string(&self, input: &str) -> String {
        self.masker().await.mask(input)
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        info!("secret cache cleared");
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new(SecretStoreConfig::default())
    }
}
