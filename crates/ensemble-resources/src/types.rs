use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of capacity a pool accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    /// CPU time or cores.
    Compute,
    /// Working memory.
    Memory,
    /// Network bandwidth.
    Network,
    /// Disk or object storage.
    Storage,
    /// Outbound API rate budget.
    ApiRate,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Compute => write!(f, "compute"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::Storage => write!(f, "storage"),
            ResourceType::ApiRate => write!(f, "api-rate"),
        }
    }
}

/// Declarative definition of a pool, as it appears in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub total: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Lower numbers matter more; pools at priority 2 or below are
    /// candidates for underutilization clean-up.
    #[serde(default = "default_pool_priority")]
    pub priority: u8,
}

fn default_unit() -> String {
    "units".to_string()
}

fn default_pool_priority() -> u8 {
    3
}

impl PoolConfig {
    pub fn new(id: impl Into<String>, resource_type: ResourceType, total: f64) -> Self {
        Self {
            id: id.into(),
            resource_type,
            total,
            unit: default_unit(),
            priority: default_pool_priority(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// A named, typed capacity bucket.
///
/// `available` is always derived from `total - allocated`, so the two can
/// never drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: String,
    pub resource_type: ResourceType,
    pub total: f64,
    pub allocated: f64,
    pub unit: String,
    pub priority: u8,
}

impl ResourcePool {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            id: config.id.clone(),
            resource_type: config.resource_type,
            total: config.total,
            allocated: 0.0,
            unit: config.unit.clone(),
            priority: config.priority,
        }
    }

    pub fn available(&self) -> f64 {
        self.total - self.allocated
    }

    /// Allocated share of the pool as a percentage (0–100).
    pub fn utilization_rate(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        self.allocated / self.total * 100.0
    }

    pub(crate) fn take(&mut self, amount: f64) {
        self.allocated += amount;
    }

    pub(crate) fn give_back(&mut self, amount: f64) {
        self.allocated = (self.allocated - amount).max(0.0);
    }

    /// Pull `allocated` back into `[0, total]` after floating point transfers.
    pub(crate) fn clamp_allocated(&mut self) {
        self.allocated = self.allocated.clamp(0.0, self.total);
    }
}

fn default_request_priority() -> u8 {
    1
}

/// One line of an allocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Id of the pool to draw from.
    pub pool: String,
    pub amount: f64,
    #[serde(default = "default_request_priority")]
    pub priority: u8,
    /// Lease length in seconds; the manager default (1 hour) applies when unset.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl ResourceRequest {
    pub fn new(pool: impl Into<String>, amount: f64) -> Self {
        Self {
            pool: pool.into(),
            amount,
            priority: default_request_priority(),
            ttl_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }
}

/// Capacity held from one pool as part of an allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub pool: String,
    pub resource_type: ResourceType,
    pub amount: f64,
    pub priority: u8,
    pub expires_at: DateTime<Utc>,
}

/// Lifecycle of an allocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Active,
    Released,
    Expired,
}

/// A time-bounded grant of capacity to a task or agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: Uuid,
    /// Task or agent id the capacity was granted to.
    pub recipient: String,
    pub grants: Vec<ResourceGrant>,
    pub status: AllocationStatus,
    pub created_at: DateTime<Utc>,
}

impl ResourceAllocation {
    /// Earliest grant expiry; the allocation is reclaimed as a unit once it passes.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.grants.iter().map(|g| g.expires_at).min()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Total amount this allocation holds on `pool`.
    pub fn amount_on(&self, pool: &str) -> f64 {
        self.grants
            .iter()
            .filter(|g| g.pool == pool)
            .map(|g| g.amount)
            .sum()
    }
}

/// A request line that could not be satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRequest {
    pub pool: String,
    pub requested: f64,
    pub available: f64,
    pub reason: String,
}

/// Result of [`crate::ResourcePoolManager::allocate`].
///
/// On failure no pool has been touched and `allocation_id` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub success: bool,
    pub allocation_id: Option<Uuid>,
    pub allocations: Vec<ResourceGrant>,
    pub failed_requests: Vec<FailedRequest>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_available_tracks_allocated() {
        let mut pool = ResourcePool::from_config(&PoolConfig::new("cpu", ResourceType::Compute, 100.0));
        assert_eq!(pool.available(), 100.0);
        pool.take(35.0);
        assert_eq!(pool.available(), 65.0);
        assert_eq!(pool.utilization_rate(), 35.0);
        pool.give_back(50.0);
        assert_eq!(pool.allocated, 0.0);
        assert_eq!(pool.available(), 100.0);
    }

    #[test]
    fn test_zero_capacity_pool_reports_zero_rate() {
        let pool = ResourcePool::from_config(&PoolConfig::new("none", ResourceType::Storage, 0.0));
        assert_eq!(pool.utilization_rate(), 0.0);
    }

    #[test]
    fn test_resource_type_serialization() {
        let json = serde_json::to_string(&ResourceType::ApiRate).unwrap();
        assert_eq!(json, "\"api-rate\"");
        let parsed: ResourceType = serde_json::from_str("\"compute\"").unwrap();
        assert_eq!(parsed, ResourceType::Compute);
        assert_eq!(ResourceType::ApiRate.to_string(), "api-rate");
    }

    #[test]
    fn test_pool_config_defaults_from_toml() {
        let config: PoolConfig = toml::from_str(
            r#"
            id = "gpu"
            type = "compute"
            total = 8.0
            "#,
        )
        .unwrap();
        assert_eq!(config.unit, "units");
        assert_eq!(config.priority, 3);
        assert_eq!(config.resource_type, ResourceType::Compute);
    }

    #[test]
    fn test_allocation_expiry_uses_earliest_grant() {
        let now = Utc::now();
        let grant = |pool: &str, secs: i64| ResourceGrant {
            pool: pool.to_string(),
            resource_type: ResourceType::Compute,
            amount: 1.0,
            priority: 1,
            expires_at: now + chrono::Duration::seconds(secs),
        };
        let allocation = ResourceAllocation {
            id: Uuid::new_v4(),
            recipient: "task".into(),
            grants: vec![grant("a", 60), grant("b", 10)],
            status: AllocationStatus::Active,
            created_at: now,
        };
        assert_eq!(allocation.expires_at(), Some(now + chrono::Duration::seconds(10)));
        assert!(!allocation.is_expired(now));
        assert!(allocation.is_expired(now + chrono::Duration::seconds(11)));
        assert_eq!(allocation.amount_on("a"), 1.0);
        assert_eq!(allocation.amount_on("c"), 0.0);
    }
}
