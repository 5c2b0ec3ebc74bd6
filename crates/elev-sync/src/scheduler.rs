//! Staleness scheduler. Pure: everything it reads arrives in a [`TickContext`].

use chrono::{DateTime, Duration, Utc};
use elev_core::{
    DueReason, ScheduleSnapshot, ScopeState, SyncPolicy, SyncPolicyRow, SyncTarget, WorkItem,
};
use serde::Serialize;
use tracing::warn;

/// Inputs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub now: DateTime<Utc>,
    pub policies: &'a [SyncPolicyRow],
    pub snapshot: &'a ScheduleSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPolicy {
    pub target: String,
    pub reason: String,
}

/// A scope past its staleness threshold that is not due this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleScope {
    pub target: SyncTarget,
    pub scope_id: Option<i64>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Work for one policy, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyWave {
    pub policy: SyncPolicy,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickPlan {
    pub waves: Vec<PolicyWave>,
    pub stale: Vec<StaleScope>,
    pub skipped: Vec<SkippedPolicy>,
}

impl TickPlan {
    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.waves.iter().flat_map(|w| w.items.iter())
    }

    pub fn item_count(&self) -> usize {
        self.waves.iter().map(|w| w.items.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncScheduler;

impl SyncScheduler {
    pub fn tick(ctx: &TickContext<'_>) -> TickPlan {
        let mut plan = TickPlan::default();

        let mut policies = Vec::new();
        for row in ctx.policies {
            match row.validate() {
                Ok(policy) if policy.enabled => policies.push(policy),
                Ok(_) => {}
                Err(err) => {
                    warn!(policy = %row.target, error = %err, "policy misconfigured; skipped this tick");
                    plan.skipped.push(SkippedPolicy {
                        target: row.target.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        policies.sort_by_key(|p| (p.priority, p.target));

        for policy in policies {
            if let Some(dep) = policy.depends_on {
                if !ctx.snapshot.has_synced_instance(dep) {
                    plan.skipped.push(SkippedPolicy {
                        target: policy.target.as_str().to_string(),
                        reason: format!("waiting for a first successful {dep} sync"),
                    });
                    continue;
                }
            }

            let mut items = Vec::new();
            for scope in ctx.snapshot.scopes_for(policy.target) {
                let stale = is_stale(scope, policy.staleness_threshold, ctx.now);
                match due_reason(scope, policy.interval, ctx.now) {
                    Some(reason) => items.push(WorkItem {
                        target: policy.target,
                        scope_id: scope.scope_id,
                        priority: policy.priority,
                        reason,
                        stale,
                        last_synced_at: scope.last_synced_at,
                    }),
                    None if stale => plan.stale.push(StaleScope {
                        target: policy.target,
                        scope_id: scope.scope_id,
                        last_success_at: scope.last_success_at,
                    }),
                    None => {}
                }
            }
            // Stale scopes first, then the longest-waiting ones.
            items.sort_by(|a, b| {
                b.stale
                    .cmp(&a.stale)
                    .then(a.last_synced_at.cmp(&b.last_synced_at))
                    .then(a.scope_id.cmp(&b.scope_id))
            });
            if !items.is_empty() {
                plan.waves.push(PolicyWave { policy, items });
            }
        }
        plan
    }
}

fn due_reason(scope: &ScopeState, interval: Duration, now: DateTime<Utc>) -> Option<DueReason> {
    if scope.forced {
        return Some(DueReason::Cascade);
    }
    match scope.last_synced_at {
        None => Some(DueReason::NeverSynced),
        Some(last) if now - last >= interval => Some(DueReason::IntervalElapsed),
        Some(_) => None,
    }
}

fn is_stale(scope: &ScopeState, threshold: Duration, now: DateTime<Utc>) -> bool {
    match scope.last_success_at {
        None => true,
        Some(at) => now - at > threshold,
    }
}
