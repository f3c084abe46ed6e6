use crate::origin::{DirectoryOrigin, DiscoveryOrigin, HttpOrigin};
use crate::types::{CapabilityItem, CapabilityKind};
use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A snapshot is served from cache for this share of the refresh interval.
pub const TTL_FRACTION: f64 = 0.8;

/// How long one origin may take to answer a refresh.
pub const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(15);

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_origin_timeout_secs() -> u64 {
    DEFAULT_ORIGIN_TIMEOUT.as_secs()
}

/// Declarative definition of a discovery source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: CapabilityKind,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Per-origin deadline for one refresh.
    #[serde(default = "default_origin_timeout_secs")]
    pub origin_timeout_secs: u64,
    /// Flat directories, one item per file.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// Plugin roots, one `plugin.toml` per sub-directory.
    #[serde(default)]
    pub plugin_directories: Vec<PathBuf>,
    /// Capability registry base URLs.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// A named group of origins reporting one capability kind on a schedule.
pub struct DiscoverySource {
    id: String,
    kind: CapabilityKind,
    refresh_interval: Duration,
    origin_timeout: Duration,
    origins: Vec<Arc<dyn DiscoveryOrigin>>,
}

impl DiscoverySource {
    pub fn new(id: impl Into<String>, kind: CapabilityKind, refresh_interval: Duration) -> Self {
        Self {
            id: id.into(),
            kind,
            refresh_interval,
            origin_timeout: DEFAULT_ORIGIN_TIMEOUT,
            origins: Vec::new(),
        }
    }

    /// Give up on an origin that has not answered within `timeout`; its
    /// items are left out of that refresh.
    pub fn with_origin_timeout(mut self, timeout: Duration) -> Self {
        self.origin_timeout = timeout;
        self
    }

    pub fn with_origin(self, origin: impl DiscoveryOrigin + 'static) -> Self {
        self.with_shared_origin(Arc::new(origin))
    }

    /// Attach an origin that is also held elsewhere, e.g. a
    /// [`RuntimeOrigin`](crate::RuntimeOrigin) the caller keeps registering into.
    pub fn with_shared_origin(mut self, origin: Arc<dyn DiscoveryOrigin>) -> Self {
        self.origins.push(origin);
        self
    }

    /// Build a source with one origin per configured directory, plugin root
    /// and endpoint.
    pub fn from_config(config: &SourceConfig) -> Self {
        let mut source = Self::new(
            config.id.clone(),
            config.kind,
            Duration::from_secs(config.refresh_interval_secs),
        )
        .with_origin_timeout(Duration::from_secs(config.origin_timeout_secs));
        for dir in &config.directories {
            source = source.with_origin(DirectoryOrigin::new(dir.clone()));
        }
        for dir in &config.plugin_directories {
            source = source.with_origin(DirectoryOrigin::plugins(dir.clone()));
        }
        for endpoint in &config.endpoints {
            source = source.with_origin(HttpOrigin::new(endpoint.clone()));
        }
        source
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// How long a snapshot is served without refreshing.
    pub fn ttl(&self) -> Duration {
        self.refresh_interval.mul_f64(TTL_FRACTION)
    }
}

struct Snapshot {
    items: Vec<CapabilityItem>,
    cached_at: Instant,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Refreshed within the last interval.
    Updated,
    /// Never refreshed, or the last refresh is older than the interval.
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub id: String,
    pub kind: CapabilityKind,
    pub state: SourceState,
    pub items: usize,
    pub origins: usize,
    pub refresh_interval_secs: u64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    pub sources: Vec<SourceStatus>,
    /// Total cached items across every source.
    pub cache_size: usize,
}

/// Refresh-interval + TTL cache over discovery sources.
///
/// Reads never block on a healthy cache: a snapshot younger than the source's
/// TTL is returned as-is, an older one is refreshed inline, and a refresh
/// that yields nothing keeps the previous snapshot.
#[derive(Default)]
pub struct DiscoveryCache {
    sources: RwLock<Vec<Arc<DiscoverySource>>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from source definitions.
    pub fn from_configs(configs: &[SourceConfig]) -> EnsembleResult<Self> {
        let cache = Self::new();
        for config in configs {
            cache.add_source(DiscoverySource::from_config(config))?;
        }
        Ok(cache)
    }

    pub fn add_source(&self, source: DiscoverySource) -> EnsembleResult<()> {
        let mut sources = self.sources.write();
        if sources.iter().any(|s| s.id == source.id) {
            return Err(EnsembleError::Discovery(format!(
                "duplicate discovery source '{}'",
                source.id
            )));
        }
        info!(
            source = %source.id,
            kind = %source.kind,
            origins = source.origins.len(),
            interval_secs = source.refresh_interval.as_secs(),
            "Registered discovery source"
        );
        sources.push(Arc::new(source));
        Ok(())
    }

    /// Drop a source and its snapshot.
    pub fn remove_source(&self, source_id: &str) -> bool {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|s| s.id != source_id);
        let removed = sources.len() != before;
        drop(sources);
        if removed {
            self.snapshots.write().remove(source_id);
        }
        removed
    }

    fn source(&self, source_id: &str) -> EnsembleResult<Arc<DiscoverySource>> {
        self.sources
            .read()
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
            .ok_or_else(|| {
                EnsembleError::Discovery(format!("unknown discovery source '{source_id}'"))
            })
    }

    fn sources_of(&self, kind: CapabilityKind) -> Vec<Arc<DiscoverySource>> {
        self.sources
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    fn is_fresh(&self, source: &DiscoverySource) -> bool {
        self.snapshots
            .read()
            .get(&source.id)
            .is_some_and(|snap| snap.cached_at.elapsed() < source.ttl())
    }

    /// Refresh one source now, regardless of its TTL. Returns the number of
    /// items in its snapshot afterwards.
    pub async fn refresh(&self, source_id: &str) -> EnsembleResult<usize> {
        let source = self.source(source_id)?;
        Ok(self.refresh_source(&source).await)
    }

    async fn refresh_source(&self, source: &DiscoverySource) -> usize {
        let kind = source.kind;
        let deadline = source.origin_timeout;
        let results = join_all(source.origins.iter().map(|origin| async move {
            let name = origin.name().to_string();
            let result = tokio::time::timeout(deadline, origin.discover(kind))
                .await
                .unwrap_or_else(|_| {
                    Err(EnsembleError::Timeout(format!(
                        "origin '{name}' did not answer within {deadline:?}"
                    )))
                });
            (name, result)
        }))
        .await;

        let mut merged = Vec::new();
        for (origin, result) in results {
            match result {
                Ok(items) => {
                    debug!(source = %source.id, origin = %origin, count = items.len(), "Origin reported");
                    merged.extend(items.into_iter().map(|mut item| {
                        if item.origin.is_empty() {
                            item.origin.clone_from(&origin);
                        }
                        item
                    }));
                }
                Err(e) => {
                    warn!(source = %source.id, origin = %origin, error = %e, "Discovery origin failed");
                }
            }
        }

        let mut snapshots = self.snapshots.write();
        if merged.is_empty() {
            if let Some(existing) = snapshots.get(&source.id) {
                debug!(source = %source.id, kept = existing.items.len(), "Refresh returned nothing, keeping last snapshot");
                return existing.items.len();
            }
        }
        let count = merged.len();
        snapshots.insert(
            source.id.clone(),
            Snapshot {
                items: merged,
                cached_at: Instant::now(),
                updated_at: Utc::now(),
            },
        );
        debug!(source = %source.id, count, "Discovery snapshot updated");
        count
    }

    /// Items of `kind` from every matching source, concatenated in
    /// registration order. Not de-duplicated; see
    /// [`dedupe_by_name`](crate::dedupe_by_name).
    pub async fn get_data(&self, kind: CapabilityKind, force_refresh: bool) -> Vec<CapabilityItem> {
        let sources = self.sources_of(kind);

        let due: Vec<&Arc<DiscoverySource>> = sources
            .iter()
            .filter(|s| force_refresh || !self.is_fresh(s))
            .collect();
        if !due.is_empty() {
            join_all(due.into_iter().map(|s| self.refresh_source(s))).await;
        }

        let snapshots = self.snapshots.read();
        sources
            .iter()
            .filter_map(|s| snapshots.get(&s.id))
            .flat_map(|snap| snap.items.iter().cloned())
            .collect()
    }

    pub fn status(&self) -> DiscoveryStatus {
        let sources = self.sources.read();
        let snapshots = self.snapshots.read();
        let statuses = sources
            .iter()
            .map(|source| {
                let snap = snapshots.get(&source.id);
                let state = match snap {
                    Some(s) if s.cached_at.elapsed() <= source.refresh_interval => {
                        SourceState::Updated
                    }
                    _ => SourceState::Stale,
                };
                SourceStatus {
                    id: source.id.clone(),
                    kind: source.kind,
                    state,
                    items: snap.map_or(0, |s| s.items.len()),
                    origins: source.origins.len(),
                    refresh_interval_secs: source.refresh_interval.as_secs(),
                    last_update: snap.map(|s| s.updated_at),
                }
            })
            .collect();
        DiscoveryStatus {
            sources: statuses,
            cache_size: snapshots.values().map(|s| s.items.len()).sum(),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.snapshots.read().values().map(|s| s.items.len()).sum()
    }

    /// Spawn one refresh timer per registered source. The first tick fires
    /// immediately; later ticks skip sources whose snapshot is still within
    /// its TTL. Sources with a zero interval only refresh on read.
    pub fn start_refresh_loops(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let sources: Vec<Arc<DiscoverySource>> = self.sources.read().clone();
        sources
            .into_iter()
            .filter(|source| {
                if source.refresh_interval.is_zero() {
                    warn!(source = %source.id, "Zero refresh interval, background refresh disabled");
                    return false;
                }
                true
            })
            .map(|source| {
                let cache = Arc::clone(&self);
                tokio::spawn(async move {
                    let mut timer = tokio::time::interval(source.refresh_interval);
                    loop {
                        timer.tick().await;
                        if cache.is_fresh(&source) {
                            continue;
                        }
                        let count = cache.refresh_source(&source).await;
                        debug!(source = %source.id, count, "Background discovery refresh");
                    }
                })
            })
            .collect()
    }
}
