//! Budget & throttle controller.
//!
//! Gates every capability invocation against per-capability spend caps, the
//! run-wide spend cap, per-capability and global concurrency, and a minimum
//! interval between calls. All state sits behind one mutex so that
//! read-check-reserve is a single critical section: concurrent acquisitions
//! can never jointly overshoot a cap.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadgarage_shared::{AgentProfile, AppConfig, Capability};
use tracing::{debug, warn};

use crate::clock::Clock;

/// Tolerance for float comparisons against caps.
const COST_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Denial
// ---------------------------------------------------------------------------

/// Why an invocation was not allowed. Denials defer the record; they are never failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// No enabled profile for the capability.
    Disabled,
    /// This capability's spend cap would be exceeded.
    SpendCapExceeded,
    /// The run-wide spend cap would be exceeded.
    RunBudgetExceeded,
    /// Per-capability in-flight ceiling reached.
    ConcurrencyCeiling,
    /// `max_concurrent_agents` invocations already in flight.
    GlobalConcurrency,
    /// Called again before `min_interval_ms` elapsed.
    RateLimited { retry_after: Duration },
    /// The capability breached its cap earlier in this run.
    Exhausted,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SpendCapExceeded => "spend_cap_exceeded",
            Self::RunBudgetExceeded => "run_budget_exceeded",
            Self::ConcurrencyCeiling => "concurrency_ceiling",
            Self::GlobalConcurrency => "global_concurrency",
            Self::RateLimited { .. } => "rate_limited",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after } => {
                write!(f, "rate_limited (retry after {}ms)", retry_after.as_millis())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CapabilityState {
    profile: AgentProfile,
    spent: f64,
    reserved: f64,
    in_flight: u32,
    last_invocation: Option<DateTime<Utc>>,
    exhausted: bool,
}

#[derive(Debug, Default)]
struct BudgetState {
    capabilities: BTreeMap<Capability, CapabilityState>,
    run_spent: f64,
    run_reserved: f64,
    in_flight: u32,
}

/// Point-in-time view of one capability's budget.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilitySnapshot {
    pub capability: Capability,
    pub spent: f64,
    pub in_flight: u32,
    pub exhausted: bool,
}

/// Point-in-time view of the whole budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub run_spent: f64,
    pub in_flight: u32,
    pub capabilities: Vec<CapabilitySnapshot>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Shared gatekeeper for capability invocations. Lives for one process run.
pub struct BudgetController {
    state: Mutex<BudgetState>,
    max_run_spend: Option<f64>,
    max_in_flight: u32,
    clock: Arc<dyn Clock>,
}

impl BudgetController {
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let capabilities = config
            .agents
            .iter()
            .map(|p| {
                (
                    p.name,
                    CapabilityState {
                        profile: p.clone(),
                        spent: 0.0,
                        reserved: 0.0,
                        in_flight: 0,
                        last_invocation: None,
                        exhausted: false,
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(BudgetState {
                capabilities,
                ..BudgetState::default()
            }),
            max_run_spend: config.orchestrator.max_run_spend,
            max_in_flight: config.orchestrator.max_concurrent_agents,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve one invocation of `capability` at its declared cost.
    pub fn acquire(self: &Arc<Self>, capability: Capability) -> Result<BudgetPermit, Denial> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(cap) = state.capabilities.get_mut(&capability) else {
            return Err(Denial::Disabled);
        };
        if !cap.profile.enabled {
            return Err(Denial::Disabled);
        }
        if cap.exhausted {
            return Err(Denial::Exhausted);
        }

        let cost = cap.profile.cost_per_call;
        if let Some(limit) = cap.profile.spend_cap {
            if cap.spent + cap.reserved + cost > limit + COST_EPSILON {
                cap.exhausted = true;
                warn!(%capability, spent = cap.spent, limit, "spend cap reached, capability exhausted");
                return Err(Denial::SpendCapExceeded);
            }
        }
        if let Some(limit) = self.max_run_spend {
            if state.run_spent + state.run_reserved + cost > limit + COST_EPSILON {
                return Err(Denial::RunBudgetExceeded);
            }
        }
        if cap.in_flight >= cap.profile.concurrency_ceiling {
            return Err(Denial::ConcurrencyCeiling);
        }
        if state.in_flight >= self.max_in_flight {
            return Err(Denial::GlobalConcurrency);
        }
        if let Some(last) = cap.last_invocation {
            let min_interval = cap.profile.min_interval();
            let elapsed = (now - last).to_std().unwrap_or_default();
            if elapsed < min_interval {
                return Err(Denial::RateLimited {
                    retry_after: min_interval - elapsed,
                });
            }
        }

        cap.reserved += cost;
        cap.in_flight += 1;
        cap.last_invocation = Some(now);
        state.run_reserved += cost;
        state.in_flight += 1;
        debug!(%capability, cost, in_flight = cap.in_flight, "budget reserved");

        Ok(BudgetPermit {
            controller: Arc::clone(self),
            capability,
            reserved: cost,
            settled: false,
        })
    }

    /// Settle a permit, charging `cost` in place of the reservation.
    pub fn release(&self, mut permit: BudgetPermit, cost: f64) {
        self.settle(permit.capability, permit.reserved, Some(cost));
        permit.settled = true;
    }

    fn settle(&self, capability: Capability, reserved: f64, charge: Option<f64>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let charged = charge.unwrap_or(0.0);

        if let Some(cap) = state.capabilities.get_mut(&capability) {
            cap.reserved = (cap.reserved - reserved).max(0.0);
            cap.spent += charged;
            cap.in_flight = cap.in_flight.saturating_sub(1);
        }
        state.run_reserved = (state.run_reserved - reserved).max(0.0);
        state.run_spent += charged;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Current spend and in-flight counts.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.lock();
        BudgetSnapshot {
            run_spent: state.run_spent,
            in_flight: state.in_flight,
            capabilities: state
                .capabilities
                .iter()
                .map(|(capability, cap)| CapabilitySnapshot {
                    capability: *capability,
                    spent: cap.spent,
                    in_flight: cap.in_flight,
                    exhausted: cap.exhausted,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// A reserved invocation slot. Settle it with [`BudgetController::release`];
/// dropping it unsettled frees the slot and refunds the reservation.
pub struct BudgetPermit {
    controller: Arc<BudgetController>,
    capability: Capability,
    reserved: f64,
    settled: bool,
}

impl BudgetPermit {
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Declared cost reserved at acquire.
    pub fn reserved(&self) -> f64 {
        self.reserved
    }

    /// Settle this permit, charging `cost`.
    pub fn release(self, cost: f64) {
        let controller = Arc::clone(&self.controller);
        controller.release(self, cost);
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        if !self.settled {
            warn!(capability = %self.capability, reserved = self.reserved, "budget permit dropped unsettled, refunding");
            self.controller.settle(self.capability, self.reserved, None);
        }
    }
}
