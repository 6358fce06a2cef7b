//! Module loader and per-bridge module cache
//!
//! A module path is normalized to a canonical location (absolute URL or base
//! URL joined with the path, always ending in `.wasm`). That location is the
//! cache key: concurrent loads of the same location share one fetch and one
//! instantiation, and a failed load leaves nothing behind.

use crate::error::{BridgeError, Result};
use crate::runtime::{ModuleInstance, ModuleRuntime};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OnceCell, OwnedMutexGuard};
use tracing::{debug, info};

/// Binary artifact suffix of a compiled module
pub const MODULE_SUFFIX: &str = ".wasm";

/// Retrieves module binaries by canonical location
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Fetches over HTTP(S) with reqwest, or from the local filesystem
#[derive(Clone)]
pub struct HttpFetcher {
    client: HttpClient,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(max_bytes: u64) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, max_bytes })
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BridgeError::module_load(url, e))?;

        if !response.status().is_success() {
            return Err(BridgeError::module_load(
                url,
                format!("HTTP request failed with status: {}", response.status()),
            ));
        }
        if let Some(size) = response.content_length() {
            debug!("Module size: {} bytes", size);
            self.check_size(url, size)?;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BridgeError::module_load(url, e))?
        {
            bytes.extend_from_slice(&chunk);
            self.check_size(url, bytes.len() as u64)?;
        }
        Ok(bytes)
    }

    async fn fetch_file(&self, location: &str) -> Result<Vec<u8>> {
        let path = location.strip_prefix("file://").unwrap_or(location);
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| BridgeError::module_load(location, e))?;
        self.check_size(location, metadata.len())?;
        tokio::fs::read(path)
            .await
            .map_err(|e| BridgeError::module_load(location, e))
    }

    fn check_size(&self, location: &str, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(BridgeError::module_load(
                location,
                format!("{} bytes exceeds the {} byte limit", size, self.max_bytes),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        if location.starts_with("http://") || location.starts_with("https://") {
            self.fetch_url(location).await
        } else {
            self.fetch_file(location).await
        }
    }
}

/// Resolve `path` against `base_url` and normalize the artifact suffix
pub fn canonical_location(path: &str, base_url: &str) -> String {
    let stem = path
        .strip_suffix(MODULE_SUFFIX)
        .or_else(|| path.strip_suffix(".js"))
        .unwrap_or(path);
    let absolute = ["http://", "https://", "file://", "/"]
        .iter()
        .any(|prefix| stem.starts_with(prefix));
    if absolute || base_url.is_empty() {
        format!("{stem}{MODULE_SUFFIX}")
    } else {
        format!(
            "{}/{}{MODULE_SUFFIX}",
            base_url.trim_end_matches('/'),
            stem.trim_start_matches("./")
        )
    }
}

/// Entry point name: the trailing path segment without its suffix
pub fn entry_name(location: &str) -> &str {
    let segment = location.rsplit('/').next().unwrap_or(location);
    segment.strip_suffix(MODULE_SUFFIX).unwrap_or(segment)
}

/// A loaded module; invocations on it are serialized by its lock
pub struct PipelineModule {
    name: String,
    location: String,
    instance: Arc<Mutex<Box<dyn ModuleInstance>>>,
}

impl PipelineModule {
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        instance: Box<dyn ModuleInstance>,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            instance: Arc::new(Mutex::new(instance)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Exclusive access to the instance for one write/invoke/read sequence
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn ModuleInstance>> {
        self.instance.lock().await
    }

    /// Like [`lock`](Self::lock), but the guard can move to a blocking thread
    pub async fn lock_owned(&self) -> OwnedMutexGuard<Box<dyn ModuleInstance>> {
        Arc::clone(&self.instance).lock_owned().await
    }
}

impl fmt::Debug for PipelineModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineModule")
            .field("name", &self.name)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Modules currently loaded
    pub modules: usize,

    /// Binary fetches performed (one per successful or failed load attempt)
    pub fetches: usize,
}

type Slot = Arc<OnceCell<Arc<PipelineModule>>>;

/// Loaded modules of one bridge, keyed by canonical location
pub struct ModuleCache {
    fetcher: Arc<dyn ModuleFetcher>,
    runtime: Arc<dyn ModuleRuntime>,
    entries: Mutex<HashMap<String, Slot>>,
    fetches: AtomicUsize,
}

impl ModuleCache {
    pub fn new(fetcher: Arc<dyn ModuleFetcher>, runtime: Arc<dyn ModuleRuntime>) -> Self {
        Self {
            fetcher,
            runtime,
            entries: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Load (or return the cached) module for `path` relative to `base_url`
    pub async fn load(&self, path: &str, base_url: &str) -> Result<Arc<PipelineModule>> {
        let location = canonical_location(path, base_url);
        let slot = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(location.clone()).or_default())
        };

        if let Some(module) = slot.get() {
            debug!("Module cache hit: {}", location);
            return Ok(Arc::clone(module));
        }

        match slot.get_or_try_init(|| self.fetch_and_instantiate(&location)).await {
            Ok(module) => Ok(Arc::clone(module)),
            Err(e) => {
                let mut entries = self.entries.lock().await;
                if entries
                    .get(&location)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    entries.remove(&location);
                }
                Err(e)
            }
        }
    }

    async fn fetch_and_instantiate(&self, location: &str) -> Result<Arc<PipelineModule>> {
        info!("Loading module: {}", location);
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let binary = self.fetcher.fetch(location).await?;

        let name = entry_name(location).to_string();
        let runtime = Arc::clone(&self.runtime);
        let entry = name.clone();
        let instance = tokio::task::spawn_blocking(move || runtime.instantiate(&entry, &binary))
            .await
            .map_err(|e| BridgeError::module_load(location, e))?
            .map_err(|e| match e {
                BridgeError::ModuleLoad { reason, .. } => BridgeError::module_load(location, reason),
                other => other,
            })?;

        info!("Loaded module {} from {}", name, location);
        Ok(Arc::new(PipelineModule::new(name, location, instance)))
    }

    /// True when a module for this canonical location is loaded
    pub async fn contains(&self, location: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(location)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn stats(&self) -> CacheStats {
        let modules = self
            .entries
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count();
        CacheStats {
            modules,
            fetches: self.fetches.load(Ordering::SeqCst),
        }
    }
}
