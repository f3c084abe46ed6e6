//! Typed resource pools for Ensemble.
//!
//! Pools account for capacity by type (compute, memory, network, storage,
//! API rate). Allocations are all-or-nothing and time-bounded, and an
//! optimizer periodically reclaims expired leases and shifts load between
//! pools of the same type.
//!
//! # Main types
//!
//! - [`ResourcePoolManager`] — Owns every pool and live allocation.
//! - [`UtilizationSnapshot`] — Per-pool rates plus system status and efficiency.
//! - [`OptimizationResult`] — What an optimization pass found, did, and changed.

/// Pool bookkeeping, allocation and release.
pub mod manager;
/// Opportunity detection, corrective actions and same-type rebalancing.
pub mod optimizer;
/// Pool, request and allocation types.
pub mod types;
/// Utilization snapshots and thresholds.
pub mod utilization;

pub use manager::{default_pool_configs, ResourcePoolManager, DEFAULT_ALLOCATION_TTL_SECS};
pub use optimizer::{
    ActionKind, Opportunity, OpportunityKind, OpportunityPriority, OptimizationAction,
    OptimizationImpact, OptimizationOptions, OptimizationResult, RebalanceChange,
};
pub use types::{
    AllocationOutcome, AllocationStatus, FailedRequest, PoolConfig, ResourceAllocation,
    ResourceGrant, ResourcePool, ResourceRequest, ResourceType,
};
pub use utilization::{PoolStatus, PoolUtilization, UtilizationSnapshot};
