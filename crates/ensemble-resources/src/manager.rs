use crate::optimizer::{OptimizationOptions, OptimizationResult};
use crate::types::{
    AllocationOutcome, AllocationStatus, FailedRequest, PoolConfig, ResourceAllocation,
    ResourceGrant, ResourcePool, ResourceRequest, ResourceType,
};
use crate::utilization::UtilizationSnapshot;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ensemble_core::{EnsembleError, EnsembleResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lease length applied when a request does not set `ttl_secs`.
pub const DEFAULT_ALLOCATION_TTL_SECS: i64 = 3600;

/// Tolerance for floating point bookkeeping checks.
pub(crate) const EPSILON: f64 = 1e-6;

/// Pools and live allocations. Cloned wholesale by the optimizer so a failed
/// pass can be thrown away.
#[derive(Debug, Clone, Default)]
pub(crate) struct PoolState {
    pub(crate) pools: BTreeMap<String, ResourcePool>,
    pub(crate) allocations: HashMap<Uuid, ResourceAllocation>,
}

impl PoolState {
    pub(crate) fn utilization(&self) -> UtilizationSnapshot {
        UtilizationSnapshot::from_pools(self.pools.values())
    }

    /// Remove an allocation and return its capacity to the pools.
    pub(crate) fn reclaim(
        &mut self,
        allocation_id: Uuid,
        status: AllocationStatus,
    ) -> Option<ResourceAllocation> {
        let mut allocation = self.allocations.remove(&allocation_id)?;
        for grant in &allocation.grants {
            if let Some(pool) = self.pools.get_mut(&grant.pool) {
                pool.give_back(grant.amount);
            }
        }
        allocation.status = status;
        Some(allocation)
    }

    /// Allocations ordered by creation time, oldest first.
    pub(crate) fn allocations_by_age(&self) -> Vec<&ResourceAllocation> {
        let mut allocations: Vec<&ResourceAllocation> = self.allocations.values().collect();
        allocations.sort_by_key(|a| a.created_at);
        allocations
    }

    /// Check `0 <= allocated <= total` and that active grants sum to `allocated`
    /// for every pool.
    pub(crate) fn check_invariants(&self) -> EnsembleResult<()> {
        let mut granted: HashMap<&str, f64> = HashMap::new();
        for allocation in self.allocations.values() {
            for grant in &allocation.grants {
                if !self.pools.contains_key(&grant.pool) {
                    return Err(EnsembleError::Resource(format!(
                        "allocation {} holds a grant on missing pool '{}'",
                        allocation.id, grant.pool
                    )));
                }
                *granted.entry(grant.pool.as_str()).or_default() += grant.amount;
            }
        }

        for pool in self.pools.values() {
            if pool.allocated < -EPSILON || pool.allocated > pool.total + EPSILON {
                return Err(EnsembleError::Resource(format!(
                    "pool '{}' allocated {} outside [0, {}]",
                    pool.id, pool.allocated, pool.total
                )));
            }
            let sum = granted.get(pool.id.as_str()).copied().unwrap_or(0.0);
            if (sum - pool.allocated).abs() > EPSILON {
                return Err(EnsembleError::Resource(format!(
                    "pool '{}' allocated {} but grants sum to {}",
                    pool.id, pool.allocated, sum
                )));
            }
        }
        Ok(())
    }
}

/// Tracks named resource pools and the allocations drawn from them.
///
/// All bookkeeping is synchronous and guarded by a single lock; nothing here
/// suspends.
pub struct ResourcePoolManager {
    state: RwLock<PoolState>,
    default_ttl: ChronoDuration,
}

impl ResourcePoolManager {
    /// Create a manager with no pools.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            default_ttl: ChronoDuration::seconds(DEFAULT_ALLOCATION_TTL_SECS),
        }
    }

    /// Create a manager with one pool per resource type.
    pub fn with_default_pools() -> Self {
        let manager = Self::new();
        {
            let mut state = manager.state.write();
            for config in default_pool_configs() {
                state
                    .pools
                    .insert(config.id.clone(), ResourcePool::from_config(&config));
            }
        }
        manager
    }

    /// Create a manager from pool definitions, rejecting duplicates and
    /// non-positive capacities.
    pub fn from_configs(configs: &[PoolConfig]) -> EnsembleResult<Self> {
        let manager = Self::new();
        for config in configs {
            manager.add_pool(config)?;
        }
        Ok(manager)
    }

    /// Override the lease length used when a request does not set one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ChronoDuration::from_std(ttl).unwrap_or(self.default_ttl);
        self
    }

    /// Register a pool. Fails on a duplicate id or a non-positive total.
    pub fn add_pool(&self, config: &PoolConfig) -> EnsembleResult<()> {
        if !(config.total > 0.0) {
            return Err(EnsembleError::Config(format!(
                "pool '{}' must have a positive total, got {}",
                config.id, config.total
            )));
        }
        let mut state = self.state.write();
        if state.pools.contains_key(&config.id) {
            return Err(EnsembleError::Config(format!(
                "duplicate pool id '{}'",
                config.id
            )));
        }
        state
            .pools
            .insert(config.id.clone(), ResourcePool::from_config(config));
        info!(pool = %config.id, resource_type = %config.resource_type, total = config.total, "Registered resource pool");
        Ok(())
    }

    /// Remove an idle pool. Pools with outstanding allocations are kept.
    pub fn remove_pool(&self, pool_id: &str) -> EnsembleResult<ResourcePool> {
        let mut state = self.state.write();
        let pool = state
            .pools
            .get(pool_id)
            .ok_or_else(|| EnsembleError::UnknownPool(pool_id.to_string()))?;
        if pool.allocated > EPSILON {
            return Err(EnsembleError::Resource(format!(
                "pool '{pool_id}' still has {} {} allocated",
                pool.allocated, pool.unit
            )));
        }
        state
            .pools
            .remove(pool_id)
            .ok_or_else(|| EnsembleError::UnknownPool(pool_id.to_string()))
    }

    /// A copy of one pool's current state.
    pub fn pool(&self, pool_id: &str) -> Option<ResourcePool> {
        self.state.read().pools.get(pool_id).cloned()
    }

    /// All pools, ordered by id.
    pub fn pools(&self) -> Vec<ResourcePool> {
        self.state.read().pools.values().cloned().collect()
    }

    /// Grant every request or none of them.
    ///
    /// Unknown pools and non-positive amounts are errors. Insufficient
    /// capacity is reported in the outcome with `success == false` and no pool
    /// is modified.
    pub fn allocate(
        &self,
        recipient: &str,
        requests: &[ResourceRequest],
    ) -> EnsembleResult<AllocationOutcome> {
        if requests.is_empty() {
            return Err(EnsembleError::Resource(
                "allocation request contains no resources".to_string(),
            ));
        }

        let now = Utc::now();
        let mut state = self.state.write();

        // Validate the whole batch before touching anything. Requests against
        // the same pool are checked cumulatively.
        let mut requested: HashMap<&str, f64> = HashMap::new();
        let mut expiries = Vec::with_capacity(requests.len());
        let mut failed_requests = Vec::new();
        for request in requests {
            if !(request.amount > 0.0) {
                return Err(EnsembleError::Resource(format!(
                    "requested amount for pool '{}' must be positive, got {}",
                    request.pool, request.amount
                )));
            }
            expiries.push(self.lease_expiry(now, request.ttl_secs)?);
            let pool = state
                .pools
                .get(&request.pool)
                .ok_or_else(|| EnsembleError::UnknownPool(request.pool.clone()))?;

            let total_for_pool = requested.entry(request.pool.as_str()).or_default();
            *total_for_pool += request.amount;
            if *total_for_pool > pool.available() + EPSILON {
                failed_requests.push(FailedRequest {
                    pool: request.pool.clone(),
                    requested: request.amount,
                    available: pool.available(),
                    reason: format!(
                        "insufficient capacity: {} {} requested, {} available",
                        total_for_pool,
                        pool.unit,
                        pool.available()
                    ),
                });
            }
        }

        if !failed_requests.is_empty() {
            warn!(
                recipient = %recipient,
                failed = failed_requests.len(),
                "Resource allocation rejected"
            );
            return Ok(AllocationOutcome {
                success: false,
                allocation_id: None,
                allocations: Vec::new(),
                failed_requests,
            });
        }

        let mut grants = Vec::with_capacity(requests.len());
        for (request, expires_at) in requests.iter().zip(expiries) {
            let Some(pool) = state.pools.get_mut(&request.pool) else {
                continue;
            };
            pool.take(request.amount);
            grants.push(ResourceGrant {
                pool: request.pool.clone(),
                resource_type: pool.resource_type,
                amount: request.amount,
                priority: request.priority,
                expires_at,
            });
        }

        let allocation = ResourceAllocation {
            id: Uuid::new_v4(),
            recipient: recipient.to_string(),
            grants: grants.clone(),
            status: AllocationStatus::Active,
            created_at: now,
        };
        let allocation_id = allocation.id;
        state.allocations.insert(allocation_id, allocation);

        debug!(allocation_id = %allocation_id, recipient = %recipient, grants = grants.len(), "Resources allocated");

        Ok(AllocationOutcome {
            success: true,
            allocation_id: Some(allocation_id),
            allocations: grants,
            failed_requests: Vec::new(),
        })
    }

    /// When a lease starting at `now` runs out. Leases past the end of the
    /// representable calendar are rejected.
    fn lease_expiry(
        &self,
        now: DateTime<Utc>,
        ttl_secs: Option<u64>,
    ) -> EnsembleResult<DateTime<Utc>> {
        let ttl = match ttl_secs {
            None => self.default_ttl,
            Some(secs) => i64::try_from(secs)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .ok_or_else(|| {
                    EnsembleError::Resource(format!("lease of {secs}s is out of range"))
                })?,
        };
        now.checked_add_signed(ttl).ok_or_else(|| {
            EnsembleError::Resource(format!(
                "lease of {}s runs past the supported date range",
                ttl.num_seconds()
            ))
        })
    }

    /// Return an allocation's capacity to its pools. `false` for unknown ids.
    pub fn release(&self, allocation_id: Uuid) -> bool {
        let released = self
            .state
            .write()
            .reclaim(allocation_id, AllocationStatus::Released);
        match released {
            Some(allocation) => {
                debug!(allocation_id = %allocation_id, recipient = %allocation.recipient, "Resources released");
                true
            }
            None => false,
        }
    }

    /// A live allocation. Released and reclaimed allocations are gone.
    pub fn allocation(&self, allocation_id: Uuid) -> Option<ResourceAllocation> {
        self.state.read().allocations.get(&allocation_id).cloned()
    }

    /// Live allocations, oldest first.
    pub fn active_allocations(&self) -> Vec<ResourceAllocation> {
        self.state
            .read()
            .allocations_by_age()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Per-pool utilization with the overall status and efficiency score.
    pub fn utilization(&self) -> UtilizationSnapshot {
        self.state.read().utilization()
    }

    /// Run one optimization pass. Never fails; problems are reported in the
    /// returned [`OptimizationResult`].
    pub fn optimize(&self, options: &OptimizationOptions) -> OptimizationResult {
        let now = options.now.unwrap_or_else(Utc::now);
        let mut state = self.state.write();
        crate::optimizer::optimize_state(&mut state, options, now)
    }

    /// Run [`optimize`](Self::optimize) on a fixed interval until the handle is aborted.
    pub fn start_optimization_loop(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                let result = self.optimize(&OptimizationOptions::default());
                if result.success {
                    info!(
                        opportunities = result.opportunities.len(),
                        rebalanced = result.rebalancing.len(),
                        efficiency_gain = result.impact.efficiency_gain,
                        "Periodic resource optimization complete"
                    );
                } else {
                    warn!(
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "Periodic resource optimization failed"
                    );
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        f(&mut self.state.write())
    }
}

impl Default for ResourcePoolManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The built-in pool set: one per resource type.
pub fn default_pool_configs() -> Vec<PoolConfig> {
    vec![
        PoolConfig::new("cpu", ResourceType::Compute, 100.0)
            .with_unit("percent")
            .with_priority(1),
        PoolConfig::new("memory", ResourceType::Memory, 16_384.0)
            .with_unit("MB")
            .with_priority(1),
        PoolConfig::new("network", ResourceType::Network, 1_000.0)
            .with_unit("Mbps")
            .with_priority(2),
        PoolConfig::new("storage", ResourceType::Storage, 1_048_576.0)
            .with_unit("MB")
            .with_priority(3),
        PoolConfig::new("api_rate", ResourceType::ApiRate, 1_000.0)
            .with_unit("requests/min")
            .with_priority(2),
    ]
}
