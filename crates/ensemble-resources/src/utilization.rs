use crate::types::{ResourcePool, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pools below this utilization (percent) are considered underused.
pub const UNDERUTILIZED_THRESHOLD: f64 = 30.0;
/// Pools above this utilization (percent) are considered overloaded.
pub const OVERUTILIZED_THRESHOLD: f64 = 80.0;

/// Health classification for a single pool or the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Optimal,
    /// Underutilized.
    Warning,
    /// Overutilized.
    Critical,
}

impl PoolStatus {
    pub fn classify(utilization_rate: f64) -> Self {
        if utilization_rate > OVERUTILIZED_THRESHOLD {
            PoolStatus::Critical
        } else if utilization_rate < UNDERUTILIZED_THRESHOLD {
            PoolStatus::Warning
        } else {
            PoolStatus::Optimal
        }
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub pool_id: String,
    pub resource_type: ResourceType,
    pub total: f64,
    pub allocated: f64,
    pub available: f64,
    pub unit: String,
    pub utilization_rate: f64,
    pub status: PoolStatus,
}

/// Point-in-time view of every pool plus system-level rollups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationSnapshot {
    pub pools: Vec<PoolUtilization>,
    pub overall_status: PoolStatus,
    /// Share of pools in the optimal band, 0–100.
    pub efficiency_score: f64,
    pub taken_at: DateTime<Utc>,
}

impl UtilizationSnapshot {
    /// Build a snapshot from pools, in the order given.
    pub fn from_pools<'a>(pools: impl IntoIterator<Item = &'a ResourcePool>) -> Self {
        let pools: Vec<PoolUtilization> = pools
            .into_iter()
            .map(|p| {
                let rate = p.utilization_rate();
                PoolUtilization {
                    pool_id: p.id.clone(),
                    resource_type: p.resource_type,
                    total: p.total,
                    allocated: p.allocated,
                    available: p.available(),
                    unit: p.unit.clone(),
                    utilization_rate: rate,
                    status: PoolStatus::classify(rate),
                }
            })
            .collect();

        let count = |status: PoolStatus| pools.iter().filter(|p| p.status == status).count();
        let critical = count(PoolStatus::Critical);
        let warning = count(PoolStatus::Warning);
        let optimal = count(PoolStatus::Optimal);

        let overall_status = if critical > 0 {
            PoolStatus::Critical
        } else if warning * 2 > pools.len() {
            PoolStatus::Warning
        } else {
            PoolStatus::Optimal
        };

        let efficiency_score = if pools.is_empty() {
            0.0
        } else {
            optimal as f64 / pools.len() as f64 * 100.0
        };

        Self {
            pools,
            overall_status,
            efficiency_score,
            taken_at: Utc::now(),
        }
    }

    pub fn pool(&self, pool_id: &str) -> Option<&PoolUtilization> {
        self.pools.iter().find(|p| p.pool_id == pool_id)
    }
}
