use crate::manager::{PoolState, EPSILON};
use crate::types::{AllocationStatus, ResourceGrant, ResourceType};
use crate::utilization::{UtilizationSnapshot, OVERUTILIZED_THRESHOLD, UNDERUTILIZED_THRESHOLD};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest share of an overutilized pool's allocation moved in one pass.
pub const MAX_REBALANCE_FRACTION: f64 = 0.2;
/// Pools at or below this priority are eligible for underutilization clean-up.
pub const UNDERUTILIZED_MAX_POOL_PRIORITY: u8 = 2;

fn default_true() -> bool {
    true
}

fn default_grace_secs() -> u64 {
    300
}

/// Knobs for a single optimization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOptions {
    /// Compute everything but leave the pools untouched.
    #[serde(default)]
    pub dry_run: bool,
    /// Move capacity between same-type pools.
    #[serde(default = "default_true")]
    pub rebalance: bool,
    /// How long reprioritized grants are left to live, in seconds.
    #[serde(default = "default_grace_secs")]
    pub reprioritize_grace_secs: u64,
    /// Evaluation instant; defaults to now. Mostly useful in tests.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            rebalance: true,
            reprioritize_grace_secs: default_grace_secs(),
            now: None,
        }
    }
}

/// Urgency of an opportunity. Higher sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityPriority {
    Low,
    Medium,
    High,
}

/// Something the optimizer found worth acting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpportunityKind {
    Underutilized { pool_id: String },
    Overutilized { pool_id: String },
    ExpiredAllocation { allocation_id: Uuid },
}

/// A detected opportunity with its urgency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub priority: OpportunityPriority,
    pub description: String,
}

/// What was done about an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Fold split grants inside each allocation on an underused pool.
    Consolidate,
    /// Shorten the leases of the lowest-priority contenders on an overloaded pool.
    Reprioritize,
    /// Reclaim an allocation whose lease ran out.
    ReleaseExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationAction {
    pub action: ActionKind,
    pub target: OpportunityKind,
    /// `false` when there was nothing to change.
    pub applied: bool,
    pub affected_allocations: Vec<Uuid>,
    pub detail: String,
}

/// Capacity moved from one pool to a same-type sibling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceChange {
    pub resource_type: ResourceType,
    pub from_pool: String,
    pub to_pool: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationImpact {
    /// Change in efficiency score, in percentage points.
    pub efficiency_gain: f64,
    /// Per pool, how much allocated capacity the pass freed (negative when it grew).
    pub resource_savings: BTreeMap<String, f64>,
    pub performance_improvement: f64,
}

/// Outcome of [`crate::ResourcePoolManager::optimize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub success: bool,
    pub error: Option<String>,
    pub dry_run: bool,
    pub opportunities: Vec<Opportunity>,
    pub actions: Vec<OptimizationAction>,
    pub rebalancing: Vec<RebalanceChange>,
    pub before: UtilizationSnapshot,
    pub after: UtilizationSnapshot,
    pub impact: OptimizationImpact,
    pub completed_at: DateTime<Utc>,
}

/// Run a pass on a copy of `state` and commit it only if the copy still
/// satisfies the bookkeeping invariants (and this is not a dry run).
pub(crate) fn optimize_state(
    state: &mut PoolState,
    options: &OptimizationOptions,
    now: DateTime<Utc>,
) -> OptimizationResult {
    let before = state.utilization();
    let mut working = state.clone();

    match run_pass(&mut working, options, now) {
        Ok(pass) => {
            let after = working.utilization();
            let impact = compute_impact(&before, &after);
            if !options.dry_run {
                *state = working;
            }
            info!(
                opportunities = pass.opportunities.len(),
                actions = pass.actions.iter().filter(|a| a.applied).count(),
                rebalanced = pass.rebalancing.len(),
                dry_run = options.dry_run,
                "Resource optimization pass complete"
            );
            OptimizationResult {
                success: true,
                error: None,
                dry_run: options.dry_run,
                opportunities: pass.opportunities,
                actions: pass.actions,
                rebalancing: pass.rebalancing,
                before,
                after,
                impact,
                completed_at: Utc::now(),
            }
        }
        Err(e) => {
            warn!(error = %e, "Resource optimization pass failed, no changes committed");
            OptimizationResult {
                success: false,
                error: Some(e.to_string()),
                dry_run: options.dry_run,
                opportunities: Vec::new(),
                actions: Vec::new(),
                rebalancing: Vec::new(),
                after: before.clone(),
                before,
                impact: OptimizationImpact::default(),
                completed_at: Utc::now(),
            }
        }
    }
}

struct PassOutput {
    opportunities: Vec<Opportunity>,
    actions: Vec<OptimizationAction>,
    rebalancing: Vec<RebalanceChange>,
}

fn run_pass(
    state: &mut PoolState,
    options: &OptimizationOptions,
    now: DateTime<Utc>,
) -> EnsembleResult<PassOutput> {
    let opportunities = identify_opportunities(state, now);

    let grace_secs = options.reprioritize_grace_secs;
    let grace_deadline = i64::try_from(grace_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|grace| now.checked_add_signed(grace))
        .ok_or_else(|| {
            EnsembleError::Resource(format!(
                "reprioritize grace of {grace_secs}s runs past the supported date range"
            ))
        })?;

    let actions = opportunities
        .iter()
        .map(|opp| match &opp.kind {
            OpportunityKind::Overutilized { pool_id } => {
                reprioritize(state, pool_id, grace_deadline)
            }
            OpportunityKind::ExpiredAllocation { allocation_id } => {
                release_expired(state, *allocation_id)
            }
            OpportunityKind::Underutilized { pool_id } => consolidate(state, pool_id),
        })
        .collect();

    let rebalancing = if options.rebalance {
        rebalance(state)
    } else {
        Vec::new()
    };

    state.check_invariants()?;

    Ok(PassOutput {
        opportunities,
        actions,
        rebalancing,
    })
}

fn identify_opportunities(state: &PoolState, now: DateTime<Utc>) -> Vec<Opportunity> {
    let mut opportunities = Vec::new();

    for pool in state.pools.values() {
        let rate = pool.utilization_rate();
        if rate > OVERUTILIZED_THRESHOLD {
            opportunities.push(Opportunity {
                kind: OpportunityKind::Overutilized {
                    pool_id: pool.id.clone(),
                },
                priority: OpportunityPriority::High,
                description: format!("pool '{}' is {rate:.1}% utilized", pool.id),
            });
        } else if pool.priority <= UNDERUTILIZED_MAX_POOL_PRIORITY && rate < UNDERUTILIZED_THRESHOLD {
            opportunities.push(Opportunity {
                kind: OpportunityKind::Underutilized {
                    pool_id: pool.id.clone(),
                },
                priority: OpportunityPriority::Low,
                description: format!(
                    "priority-{} pool '{}' is only {rate:.1}% utilized",
                    pool.priority, pool.id
                ),
            });
        }
    }

    for allocation in state.allocations_by_age() {
        if allocation.is_expired(now) {
            opportunities.push(Opportunity {
                kind: OpportunityKind::ExpiredAllocation {
                    allocation_id: allocation.id,
                },
                priority: OpportunityPriority::Medium,
                description: format!(
                    "allocation {} for '{}' expired",
                    allocation.id, allocation.recipient
                ),
            });
        }
    }

    // Stable: equal priorities keep discovery order.
    opportunities.sort_by(|a, b| b.priority.cmp(&a.priority));
    opportunities
}

fn release_expired(state: &mut PoolState, allocation_id: Uuid) -> OptimizationAction {
    let target = OpportunityKind::ExpiredAllocation { allocation_id };
    match state.reclaim(allocation_id, AllocationStatus::Expired) {
        Some(allocation) => {
            debug!(allocation_id = %allocation_id, recipient = %allocation.recipient, "Reclaimed expired allocation");
            OptimizationAction {
                action: ActionKind::ReleaseExpired,
                target,
                applied: true,
                affected_allocations: vec![allocation_id],
                detail: format!(
                    "released {} grant(s) held by '{}'",
                    allocation.grants.len(),
                    allocation.recipient
                ),
            }
        }
        None => OptimizationAction {
            action: ActionKind::ReleaseExpired,
            target,
            applied: false,
            affected_allocations: Vec::new(),
            detail: "allocation already gone".to_string(),
        },
    }
}

/// Shorten the leases of the lowest-priority allocations on `pool_id` until
/// what remains would sit at or under the overutilization threshold.
fn reprioritize(
    state: &mut PoolState,
    pool_id: &str,
    deadline: DateTime<Utc>,
) -> OptimizationAction {
    let target = OpportunityKind::Overutilized {
        pool_id: pool_id.to_string(),
    };
    let Some(pool) = state.pools.get(pool_id) else {
        return OptimizationAction {
            action: ActionKind::Reprioritize,
            target,
            applied: false,
            affected_allocations: Vec::new(),
            detail: "pool no longer exists".to_string(),
        };
    };
    let total = pool.total;
    let mut projected = pool.allocated;

    // Contenders: lowest grant priority first, then oldest.
    let mut contenders: Vec<(u8, DateTime<Utc>, Uuid, f64)> = state
        .allocations
        .values()
        .filter_map(|a| {
            let amount = a.amount_on(pool_id);
            let priority = a
                .grants
                .iter()
                .filter(|g| g.pool == pool_id)
                .map(|g| g.priority)
                .max()?;
            Some((priority, a.created_at, a.id, amount))
        })
        .collect();
    contenders.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut affected = Vec::new();
    for (_, _, id, amount) in contenders {
        if projected / total * 100.0 <= OVERUTILIZED_THRESHOLD {
            break;
        }
        if let Some(allocation) = state.allocations.get_mut(&id) {
            for grant in &mut allocation.grants {
                if grant.expires_at > deadline {
                    grant.expires_at = deadline;
                }
            }
            affected.push(id);
            projected -= amount;
        }
    }

    OptimizationAction {
        action: ActionKind::Reprioritize,
        target,
        applied: !affected.is_empty(),
        detail: format!(
            "{} allocation(s) on '{pool_id}' now expire by {deadline}",
            affected.len()
        ),
        affected_allocations: affected,
    }
}

/// Merge the grants each allocation holds on `pool_id` into one grant per
/// lease. Allocation ids, amounts and expiries are unchanged, so a holder can
/// still release exactly what it was given.
fn consolidate(state: &mut PoolState, pool_id: &str) -> OptimizationAction {
    let target = OpportunityKind::Underutilized {
        pool_id: pool_id.to_string(),
    };

    let mut affected = Vec::new();
    let mut merged_grants = 0usize;
    for allocation in state.allocations.values_mut() {
        let (on_pool, mut others): (Vec<ResourceGrant>, Vec<ResourceGrant>) = allocation
            .grants
            .drain(..)
            .partition(|g| g.pool == pool_id);
        let before = on_pool.len();

        // Grants only merge when they would expire together at the same priority.
        let mut merged: Vec<ResourceGrant> = Vec::with_capacity(before);
        for grant in on_pool {
            match merged
                .iter_mut()
                .find(|m| m.expires_at == grant.expires_at && m.priority == grant.priority)
            {
                Some(existing) => existing.amount += grant.amount,
                None => merged.push(grant),
            }
        }

        if merged.len() < before {
            merged_grants += before - merged.len();
            affected.push(allocation.id);
        }
        others.extend(merged);
        allocation.grants = others;
    }
    affected.sort();

    OptimizationAction {
        action: ActionKind::Consolidate,
        target,
        applied: !affected.is_empty(),
        detail: format!(
            "folded {merged_grants} grant(s) across {} allocation(s) on '{pool_id}'",
            affected.len()
        ),
        affected_allocations: affected,
    }
}

/// Move up to [`MAX_REBALANCE_FRACTION`] of each overutilized pool's
/// allocation into underutilized pools of the same type.
fn rebalance(state: &mut PoolState) -> Vec<RebalanceChange> {
    let mut by_type: BTreeMap<ResourceType, Vec<String>> = BTreeMap::new();
    for pool in state.pools.values() {
        by_type
            .entry(pool.resource_type)
            .or_default()
            .push(pool.id.clone());
    }

    let mut changes = Vec::new();
    for (resource_type, ids) in by_type {
        if ids.len() < 2 {
            continue;
        }
        let rate = |state: &PoolState, id: &str| {
            state
                .pools
                .get(id)
                .map(|p| p.utilization_rate())
                .unwrap_or(0.0)
        };

        let mut over: Vec<String> = ids
            .iter()
            .filter(|id| rate(state, id) > OVERUTILIZED_THRESHOLD)
            .cloned()
            .collect();
        over.sort_by(|a, b| rate(state, b).total_cmp(&rate(state, a)));

        let mut under: Vec<String> = ids
            .iter()
            .filter(|id| rate(state, id) < UNDERUTILIZED_THRESHOLD)
            .cloned()
            .collect();
        under.sort_by(|a, b| rate(state, a).total_cmp(&rate(state, b)));

        for from in &over {
            let Some(from_pool) = state.pools.get(from) else {
                continue;
            };
            let mut budget = from_pool.allocated * MAX_REBALANCE_FRACTION;

            for to in &under {
                if budget <= EPSILON {
                    break;
                }
                let available = state.pools.get(to).map(|p| p.available()).unwrap_or(0.0);
                let amount = budget.min(available);
                if amount <= EPSILON {
                    continue;
                }
                let moved = transfer(state, from, to, amount);
                if moved > EPSILON {
                    budget -= moved;
                    debug!(from = %from, to = %to, amount = moved, "Rebalanced capacity");
                    changes.push(RebalanceChange {
                        resource_type,
                        from_pool: from.clone(),
                        to_pool: to.clone(),
                        amount: moved,
                    });
                }
            }
        }
    }
    changes
}

/// Re-point up to `amount` of grants from `from` to `to`, lowest priority
/// first, splitting the last grant if needed. Returns what actually moved.
fn transfer(state: &mut PoolState, from: &str, to: &str, amount: f64) -> f64 {
    let mut candidates: Vec<(u8, DateTime<Utc>, Uuid)> = state
        .allocations
        .values()
        .flat_map(move |a| {
            a.grants
                .iter()
                .filter(move |g| g.pool == from)
                .map(move |g| (g.priority, a.created_at, a.id))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    candidates.dedup_by_key(|c| c.2);

    // `moved` sums what was actually re-pointed so the pools track the grants
    // exactly, whatever rounding `remaining` picked up on the way.
    let mut moved = 0.0;
    for (_, _, id) in candidates {
        if amount - moved <= EPSILON {
            break;
        }
        let Some(allocation) = state.allocations.get_mut(&id) else {
            continue;
        };
        let mut split_off = Vec::new();
        for grant in allocation.grants.iter_mut().filter(|g| g.pool == from) {
            let remaining = amount - moved;
            if remaining <= EPSILON {
                break;
            }
            if grant.amount <= remaining + EPSILON {
                moved += grant.amount;
                grant.pool = to.to_string();
            } else {
                grant.amount -= remaining;
                split_off.push(ResourceGrant {
                    pool: to.to_string(),
                    amount: remaining,
                    ..grant.clone()
                });
                moved += remaining;
            }
        }
        allocation.grants.extend(split_off);
    }

    if let Some(pool) = state.pools.get_mut(from) {
        pool.give_back(moved);
        pool.clamp_allocated();
    }
    if let Some(pool) = state.pools.get_mut(to) {
        pool.take(moved);
        pool.clamp_allocated();
    }
    moved
}

fn compute_impact(before: &UtilizationSnapshot, after: &UtilizationSnapshot) -> OptimizationImpact {
    let efficiency_gain = after.efficiency_score - before.efficiency_score;
    let resource_savings = before
        .pools
        .iter()
        .filter_map(|b| {
            after
                .pool(&b.pool_id)
                .map(|a| (b.pool_id.clone(), b.allocated - a.allocated))
        })
        .collect();
    OptimizationImpact {
        efficiency_gain,
        resource_savings,
        performance_improvement: (efficiency_gain * 0.5).max(0.0),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::manager::ResourcePoolManager;
    use crate::types::{PoolConfig, ResourceRequest};

    fn compute_pair() -> ResourcePoolManager {
        ResourcePoolManager::from_configs(&[
            PoolConfig::new("cpu-a", ResourceType::Compute, 100.0).with_priority(1),
            PoolConfig::new("cpu-b", ResourceType::Compute, 100.0).with_priority(2),
        ])
        .unwrap()
    }

    #[test]
    fn test_opportunities_sorted_by_priority() {
        let manager = compute_pair();
        manager
            .allocate("hog", &[ResourceRequest::new("cpu-a", 90.0)])
            .unwrap();
        manager
            .allocate("old", &[ResourceRequest::new("cpu-b", 5.0).with_ttl_secs(1)])
            .unwrap();

        let later = Utc::now() + ChronoDuration::seconds(10);
        let opps = manager.with_state(|s| identify_opportunities(s, later));
        let priorities: Vec<OpportunityPriority> = opps.iter().map(|o| o.priority).collect();
        assert_eq!(
            priorities,
            vec![
                OpportunityPriority::High,
                OpportunityPriority::Medium,
                OpportunityPriority::Low
            ]
        );
        assert_eq!(
            opps[0].kind,
            OpportunityKind::Overutilized {
                pool_id: "cpu-a".into()
            }
        );
    }

    #[test]
    fn test_underutilized_requires_low_pool_priority() {
        let manager = ResourcePoolManager::from_configs(&[
            PoolConfig::new("bulk", ResourceType::Storage, 100.0).with_priority(5),
        ])
        .unwrap();
        let opps = manager.with_state(|s| identify_opportunities(s, Utc::now()));
        assert!(opps.is_empty());
    }

    #[test]
    fn test_expired_allocations_are_released() {
        let manager = compute_pair();
        let outcome = manager
            .allocate("task", &[ResourceRequest::new("cpu-a", 50.0).with_ttl_secs(1)])
            .unwrap();
        let id = outcome.allocation_id.unwrap();

        let options = OptimizationOptions {
            now: Some(Utc::now() + ChronoDuration::seconds(5)),
            ..Default::default()
        };
        let result = manager.optimize(&options);
        assert!(result.success);
        assert!(result
            .actions
            .iter()
            .any(|a| a.action == ActionKind::ReleaseExpired && a.applied));
        assert!(manager.allocation(id).is_none());
        assert_eq!(manager.pool("cpu-a").unwrap().allocated, 0.0);
        assert_eq!(result.impact.resource_savings.get("cpu-a"), Some(&50.0));
    }

    #[test]
    fn test_reprioritize_shortens_lowest_priority_leases() {
        let manager = ResourcePoolManager::from_configs(&[PoolConfig::new(
            "cpu",
            ResourceType::Compute,
            100.0,
        )])
        .unwrap();
        let low = manager
            .allocate("low", &[ResourceRequest::new("cpu", 20.0).with_priority(1)])
            .unwrap()
            .allocation_id
            .unwrap();
        let high = manager
            .allocate("high", &[ResourceRequest::new("cpu", 70.0).with_priority(5)])
            .unwrap()
            .allocation_id
            .unwrap();

        let result = manager.optimize(&OptimizationOptions::default());
        let action = result
            .actions
            .iter()
            .find(|a| a.action == ActionKind::Reprioritize)
            .unwrap();
        assert_eq!(action.affected_allocations, vec![low]);

        let grace_deadline = Utc::now() + ChronoDuration::seconds(301);
        assert!(manager.allocation(low).unwrap().expires_at().unwrap() <= grace_deadline);
        assert!(manager.allocation(high).unwrap().expires_at().unwrap() > grace_deadline);
        // Nothing was reclaimed yet.
        assert_eq!(manager.pool("cpu").unwrap().allocated, 90.0);
    }

    #[test]
    fn test_consolidate_folds_grants_within_an_allocation() {
        let manager = compute_pair();
        let split = manager
            .allocate(
                "agent-1",
                &[
                    ResourceRequest::new("cpu-b", 5.0),
                    ResourceRequest::new("cpu-b", 3.0),
                ],
            )
            .unwrap()
            .allocation_id
            .unwrap();

        let result = manager.optimize(&OptimizationOptions::default());
        assert!(result.success);
        let action = result
            .actions
            .iter()
            .find(|a| a.action == ActionKind::Consolidate)
            .unwrap();
        assert!(action.applied);
        assert_eq!(action.affected_allocations, vec![split]);

        let allocation = manager.allocation(split).unwrap();
        assert_eq!(allocation.grants.len(), 1);
        assert_eq!(allocation.amount_on("cpu-b"), 8.0);
        assert_eq!(manager.pool("cpu-b").unwrap().allocated, 8.0);
    }

    #[test]
    fn test_every_allocation_id_survives_optimization() {
        let manager = compute_pair();
        let first = manager
            .allocate("agent-1", &[ResourceRequest::new("cpu-b", 5.0)])
            .unwrap()
            .allocation_id
            .unwrap();
        let second = manager
            .allocate("agent-1", &[ResourceRequest::new("cpu-b", 3.0).with_ttl_secs(60)])
            .unwrap()
            .allocation_id
            .unwrap();
        let second_expiry = manager.allocation(second).unwrap().expires_at();

        let result = manager.optimize(&OptimizationOptions::default());
        assert!(result.success);
        assert_eq!(manager.active_allocations().len(), 2);
        assert_eq!(manager.allocation(second).unwrap().expires_at(), second_expiry);

        assert!(manager.release(second));
        assert_eq!(manager.pool("cpu-b").unwrap().allocated, 5.0);
        assert!(manager.release(first));
        assert_eq!(manager.pool("cpu-b").unwrap().allocated, 0.0);
    }

    #[test]
    fn test_oversized_grace_fails_the_pass_without_changes() {
        let manager = ResourcePoolManager::from_configs(&[PoolConfig::new(
            "cpu",
            ResourceType::Compute,
            100.0,
        )])
        .unwrap();
        let id = manager
            .allocate("hog", &[ResourceRequest::new("cpu", 95.0)])
            .unwrap()
            .allocation_id
            .unwrap();
        let expiry = manager.allocation(id).unwrap().expires_at();

        for grace in [1_000_000_000_000_000, u64::MAX] {
            let result = manager.optimize(&OptimizationOptions {
                reprioritize_grace_secs: grace,
                ..Default::default()
            });
            assert!(!result.success);
            assert!(result.error.unwrap().contains("grace"));
        }
        assert_eq!(manager.allocation(id).unwrap().expires_at(), expiry);
        assert_eq!(manager.pool("cpu").unwrap().allocated, 95.0);
    }

    #[test]
    fn test_transfer_keeps_pools_in_step_with_grants() {
        let manager = ResourcePoolManager::from_configs(&[
            PoolConfig::new("from", ResourceType::Compute, 10.0),
            PoolConfig::new("to", ResourceType::Compute, 0.3),
        ])
        .unwrap();
        manager
            .allocate("a", &[ResourceRequest::new("from", 0.1)])
            .unwrap();
        manager
            .allocate("b", &[ResourceRequest::new("from", 0.2)])
            .unwrap();

        let moved = manager.with_state(|s| transfer(s, "from", "to", 0.3));
        assert!((moved - 0.3).abs() < EPSILON);

        let from = manager.pool("from").unwrap();
        let to = manager.pool("to").unwrap();
        assert_eq!(from.allocated, 0.0);
        assert!(to.allocated <= to.total);
        assert!(to.available() >= 0.0);
        manager.with_state(|s| s.check_invariants()).unwrap();
    }

    #[test]
    fn test_rebalance_bounded_by_fraction_and_capacity() {
        let manager = compute_pair();
        manager
            .allocate("hog", &[ResourceRequest::new("cpu-a", 90.0)])
            .unwrap();
        manager
            .allocate("small", &[ResourceRequest::new("cpu-b", 20.0)])
            .unwrap();

        let result = manager.optimize(&OptimizationOptions::default());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.rebalancing.len(), 1);
        let change = &result.rebalancing[0];
        assert_eq!(change.from_pool, "cpu-a");
        assert_eq!(change.to_pool, "cpu-b");
        assert!(change.amount <= 90.0 * MAX_REBALANCE_FRACTION + EPSILON);
        assert!(change.amount <= 80.0 + EPSILON);
        assert!((change.amount - 18.0).abs() < EPSILON);

        assert!((manager.pool("cpu-a").unwrap().allocated - 72.0).abs() < EPSILON);
        assert!((manager.pool("cpu-b").unwrap().allocated - 38.0).abs() < EPSILON);
        manager.with_state(|s| s.check_invariants()).unwrap();
    }

    #[test]
    fn test_rebalance_respects_sibling_capacity() {
        let manager = ResourcePoolManager::from_configs(&[
            PoolConfig::new("big", ResourceType::Memory, 1000.0),
            PoolConfig::new("tiny", ResourceType::Memory, 10.0),
        ])
        .unwrap();
        manager
            .allocate("hog", &[ResourceRequest::new("big", 950.0)])
            .unwrap();

        let result = manager.optimize(&OptimizationOptions::default());
        let moved: f64 = result.rebalancing.iter().map(|c| c.amount).sum();
        assert!((moved - 10.0).abs() < EPSILON);
        assert_eq!(manager.pool("tiny").unwrap().available(), 0.0);
    }

    #[test]
    fn test_rebalance_never_crosses_types() {
        let manager = ResourcePoolManager::from_configs(&[
            PoolConfig::new("cpu", ResourceType::Compute, 100.0),
            PoolConfig::new("mem", ResourceType::Memory, 100.0),
        ])
        .unwrap();
        manager
            .allocate("hog", &[ResourceRequest::new("cpu", 95.0)])
            .unwrap();
        let result = manager.optimize(&OptimizationOptions::default());
        assert!(result.rebalancing.is_empty());
        assert_eq!(manager.pool("cpu").unwrap().allocated, 95.0);
    }

    #[test]
    fn test_dry_run_commits_nothing() {
        let manager = compute_pair();
        manager
            .allocate("hog", &[ResourceRequest::new("cpu-a", 90.0)])
            .unwrap();
        let options = OptimizationOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = manager.optimize(&options);
        assert!(result.success);
        assert!(result.dry_run);
        assert!(!result.rebalancing.is_empty());
        assert!(result.after.pool("cpu-a").unwrap().allocated < 90.0);
        assert_eq!(manager.pool("cpu-a").unwrap().allocated, 90.0);
    }

    #[test]
    fn test_broken_bookkeeping_yields_failed_result() {
        let manager = compute_pair();
        manager
            .allocate("task", &[ResourceRequest::new("cpu-a", 40.0)])
            .unwrap();
        // Corrupt the pool so grants no longer sum to `allocated`.
        manager.with_state(|s| {
            if let Some(pool) = s.pools.get_mut("cpu-a") {
                pool.allocated = 55.0;
            }
        });

        let result = manager.optimize(&OptimizationOptions::default());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("grants sum"));
        assert_eq!(
            result.before.pool("cpu-a").unwrap().allocated,
            result.after.pool("cpu-a").unwrap().allocated
        );
        assert_eq!(manager.pool("cpu-a").unwrap().allocated, 55.0);
    }

    #[test]
    fn test_performance_improvement_never_negative() {
        let before = UtilizationSnapshot::from_pools(std::iter::empty());
        let mut after = before.clone();
        after.efficiency_score = -20.0;
        let impact = compute_impact(&before, &after);
        assert_eq!(impact.efficiency_gain, -20.0);
        assert_eq!(impact.performance_improvement, 0.0);
    }
}
