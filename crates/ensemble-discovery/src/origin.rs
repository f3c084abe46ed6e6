use crate::types::{CapabilityItem, CapabilityKind};
use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// A place capability data can be read from.
///
/// Origins are queried concurrently by the cache; an error from one origin
/// only drops that origin's contribution.
#[async_trait]
pub trait DiscoveryOrigin: Send + Sync {
    /// Short name used in logs and stamped on reported items.
    fn name(&self) -> &str;

    /// Report every item of `kind` this origin currently knows about.
    async fn discover(&self, kind: CapabilityKind) -> EnsembleResult<Vec<CapabilityItem>>;
}

// --- File system ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// One `*.toml` / `*.json` file per item.
    Flat,
    /// One sub-directory per plugin, each with a `plugin.toml` manifest.
    Plugins,
}

/// Scans a directory on disk.
pub struct DirectoryOrigin {
    name: String,
    root: PathBuf,
    layout: Layout,
}

/// `plugin.toml`: one array of tables per capability kind.
#[derive(Debug, Default, Deserialize)]
struct PluginManifest {
    #[serde(default)]
    agents: Vec<CapabilityItem>,
    #[serde(default)]
    skills: Vec<CapabilityItem>,
    #[serde(default)]
    commands: Vec<CapabilityItem>,
    #[serde(default)]
    services: Vec<CapabilityItem>,
}

impl PluginManifest {
    fn take(self, kind: CapabilityKind) -> Vec<CapabilityItem> {
        match kind {
            CapabilityKind::Agents => self.agents,
            CapabilityKind::Skills => self.skills,
            CapabilityKind::Commands => self.commands,
            CapabilityKind::Services => self.services,
        }
    }
}

impl DirectoryOrigin {
    /// Every `*.toml` or `*.json` file directly under `root` is one item of
    /// whatever kind is asked for. A missing `name` defaults to the file stem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: format!("fs:{}", root.display()),
            root,
            layout: Layout::Flat,
        }
    }

    /// Every sub-directory of `root` holding a `plugin.toml` contributes the
    /// items listed under the requested kind.
    pub fn plugins(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: format!("plugins:{}", root.display()),
            root,
            layout: Layout::Plugins,
        }
    }

    async fn scan_flat(&self) -> EnsembleResult<Vec<CapabilityItem>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if (ext == "toml" || ext == "json") && is_file(&path).await {
                paths.push(path);
            }
        }
        // read_dir order is platform-dependent.
        paths.sort();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            match load_item_file(&path).await {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable capability file");
                }
            }
        }
        Ok(items)
    }

    async fn scan_plugins(&self, kind: CapabilityKind) -> EnsembleResult<Vec<CapabilityItem>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let manifest = entry.path().join("plugin.toml");
            if is_file(&manifest).await {
                manifests.push(manifest);
            }
        }
        manifests.sort();

        let mut items = Vec::new();
        for path in manifests {
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable plugin manifest");
                    continue;
                }
            };
            match toml::from_str::<PluginManifest>(&text) {
                Ok(manifest) => items.extend(manifest.take(kind)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest");
                }
            }
        }
        Ok(items)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

async fn load_item_file(path: &Path) -> EnsembleResult<CapabilityItem> {
    let text = tokio::fs::read_to_string(path).await?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        let mut value: serde_json::Value = serde_json::from_str(&text)?;
        if let Some(obj) = value.as_object_mut() {
            obj.entry("name").or_insert(serde_json::Value::String(stem));
        }
        Ok(serde_json::from_value(value)?)
    } else {
        let mut table: toml::Table = toml::from_str(&text)
            .map_err(|e| EnsembleError::Discovery(format!("{}: {e}", path.display())))?;
        table.entry("name").or_insert(toml::Value::String(stem));
        toml::Value::Table(table)
            .try_into()
            .map_err(|e| EnsembleError::Discovery(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl DiscoveryOrigin for DirectoryOrigin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self, kind: CapabilityKind) -> EnsembleResult<Vec<CapabilityItem>> {
        let items = match self.layout {
            Layout::Flat => self.scan_flat().await?,
            Layout::Plugins => self.scan_plugins(kind).await?,
        };
        debug!(origin = %self.name, kind = %kind, count = items.len(), "Directory scan complete");
        Ok(items)
    }
}

// --- HTTP ---

/// Request deadline for [`HttpOrigin`]'s default client.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Queries `GET {base_url}/{kind}` on a capability registry service.
///
/// The body may be a bare JSON array of items or an object with an `items`
/// array.
pub struct HttpOrigin {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HttpPayload {
    Bare(Vec<CapabilityItem>),
    Wrapped { items: Vec<CapabilityItem> },
}

impl HttpOrigin {
    /// Uses a client with a [`HTTP_TIMEOUT`] request deadline.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            name: format!("http:{base_url}"),
            base_url,
            http,
        }
    }

    /// Use a pre-configured client (timeouts, proxies, headers).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }
}

#[async_trait]
impl DiscoveryOrigin for HttpOrigin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self, kind: CapabilityKind) -> EnsembleResult<Vec<CapabilityItem>> {
        let url = format!("{}/{kind}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EnsembleError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EnsembleError::Http(format!(
                "capability registry error {status} from {url}"
            )));
        }

        let payload: HttpPayload = resp
            .json()
            .await
            .map_err(|e| EnsembleError::Http(e.to_string()))?;
        Ok(match payload {
            HttpPayload::Bare(items) | HttpPayload::Wrapped { items } => items,
        })
    }
}

// --- Runtime ---

/// Items registered in-process while the system runs.
#[derive(Default)]
pub struct RuntimeOrigin {
    items: RwLock<HashMap<CapabilityKind, Vec<CapabilityItem>>>,
}

impl RuntimeOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace (by name) an item of `kind`.
    pub fn register(&self, kind: CapabilityKind, item: CapabilityItem) {
        let mut items = self.items.write();
        let list = items.entry(kind).or_default();
        match list.iter_mut().find(|existing| existing.name == item.name) {
            Some(existing) => *existing = item,
            None => list.push(item),
        }
    }

    /// Returns `true` if an item was removed.
    pub fn unregister(&self, kind: CapabilityKind, name: &str) -> bool {
        let mut items = self.items.write();
        let Some(list) = items.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|item| item.name != name);
        list.len() != before
    }
}

#[async_trait]
impl DiscoveryOrigin for RuntimeOrigin {
    fn name(&self) -> &str {
        "runtime"
    }

    async fn discover(&self, kind: CapabilityKind) -> EnsembleResult<Vec<CapabilityItem>> {
        Ok(self.items.read().get(&kind).cloned().unwrap_or_default())
    }
}
