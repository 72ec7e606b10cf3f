//! Action Policy Store
//!
//! Maps action identifiers to per-tier hourly quotas. The store publishes an
//! immutable [`PolicySnapshot`]; a reload builds a complete new snapshot and
//! swaps it in, so readers see either the old indices or the new ones.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::error::{RateLimitError, Result};
use super::quota::{Capacity, NO_LIMIT};
use crate::metrics;

/// One record of the policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPolicy {
    /// Tier this record applies to
    pub tier: u32,

    /// Hourly quota; `-1` means unlimited
    pub limit_per_hour: i64,

    /// Actions covered; empty means every action of the tier
    #[serde(default)]
    pub actions: BTreeSet<String>,
}

/// Policy document as stored in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub rate_limits: Vec<ActionPolicy>,
}

impl PolicyDocument {
    /// Parse a JSON policy document
    pub fn parse(json: &str) -> Result<Self> {
        let document: PolicyDocument = serde_json::from_str(json)?;
        for policy in &document.rate_limits {
            if Capacity::from_configured(policy.limit_per_hour).is_none() {
                return Err(RateLimitError::InvalidPolicy(format!(
                    "tier {} has negative limitPerHour {}",
                    policy.tier, policy.limit_per_hour
                )));
            }
        }
        Ok(document)
    }
}

/// Parse a comma separated tier capacity list such as `"30,60,120,-1"`
///
/// Blank input yields an empty list.
pub fn parse_capacity_tiers(csv: &str) -> Result<Vec<i64>> {
    if csv.trim().is_empty() {
        return Ok(Vec::new());
    }

    csv.split(',')
        .enumerate()
        .map(|(tier, raw)| {
            let value: i64 = raw.trim().parse().map_err(|_| {
                RateLimitError::InvalidConfig(format!(
                    "tier {} capacity {:?} is not an integer",
                    tier, raw
                ))
            })?;
            if value < 0 && value != NO_LIMIT {
                return Err(RateLimitError::InvalidConfig(format!(
                    "tier {} capacity {} is negative",
                    tier, value
                )));
            }
            Ok(value)
        })
        .collect()
}

/// Immutable indices derived from a policy document and tier overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicySnapshot {
    policies: Vec<ActionPolicy>,
    action_limits: HashMap<(String, u32), Capacity>,
    tier_defaults: HashMap<u32, Capacity>,
    tier_overrides: Vec<i64>,
}

impl PolicySnapshot {
    /// Build the indices; later records override earlier ones
    pub fn build(document: PolicyDocument, tier_overrides: Vec<i64>) -> Result<Self> {
        if let Some((tier, value)) = tier_overrides
            .iter()
            .enumerate()
            .find(|(_, v)| **v < 0 && **v != NO_LIMIT)
        {
            return Err(RateLimitError::InvalidConfig(format!(
                "tier {} capacity {} is negative",
                tier, value
            )));
        }

        let mut action_limits = HashMap::new();
        let mut tier_defaults = HashMap::new();

        for policy in &document.rate_limits {
            let capacity = Capacity::from_configured(policy.limit_per_hour).ok_or_else(|| {
                RateLimitError::InvalidPolicy(format!(
                    "tier {} has negative limitPerHour {}",
                    policy.tier, policy.limit_per_hour
                ))
            })?;

            if policy.actions.is_empty() {
                if let Some(previous) = tier_defaults.insert(policy.tier, capacity) {
                    debug!(tier = policy.tier, %previous, %capacity, "Tier default overridden");
                }
                continue;
            }

            for action in &policy.actions {
                if let Some(previous) = action_limits.insert((action.clone(), policy.tier), capacity) {
                    debug!(tier = policy.tier, action = %action, %previous, %capacity, "Action limit overridden");
                }
            }
        }

        Ok(Self {
            policies: document.rate_limits,
            action_limits,
            tier_defaults,
            tier_overrides,
        })
    }

    /// Resolve the capacity governing `action` for `tier`
    ///
    /// Order: configured tier capacity, then the action's policy entry, then
    /// the tier-wide policy entry. Anything unmatched is unlimited.
    pub fn effective_limit(&self, action: &str, tier: u32) -> Capacity {
        if let Some(capacity) = self.tier_override(tier) {
            return capacity;
        }

        if let Some(capacity) = self.action_limits.get(&(action.to_string(), tier)) {
            return *capacity;
        }

        self.tier_defaults
            .get(&tier)
            .copied()
            .unwrap_or(Capacity::Unlimited)
    }

    fn tier_override(&self, tier: u32) -> Option<Capacity> {
        self.tier_overrides
            .get(tier as usize)
            .and_then(|&value| Capacity::from_configured(value))
    }

    /// Records in load order
    pub fn policies(&self) -> &[ActionPolicy] {
        &self.policies
    }

    /// Configured tier capacities, indexed by tier
    pub fn tier_overrides(&self) -> &[i64] {
        &self.tier_overrides
    }
}

/// Shared, reloadable holder of the current policy snapshot
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    current: Arc<RwLock<Arc<PolicySnapshot>>>,
}

impl PolicyStore {
    /// Create an empty store; every action is unlimited until a load succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a policy document and tier overrides
    pub fn from_json(policy_json: &str, tier_overrides: Vec<i64>) -> Result<Self> {
        let store = Self::new();
        store.load(policy_json, tier_overrides)?;
        Ok(store)
    }

    /// Replace policy and tier overrides together
    ///
    /// On error the previous snapshot stays in effect.
    pub fn load(&self, policy_json: &str, tier_overrides: Vec<i64>) -> Result<()> {
        let document = Self::parse_logged(policy_json)?;
        self.update(|_| PolicySnapshot::build(document, tier_overrides))
    }

    /// Replace the policy document, keeping the current tier overrides
    pub fn reload(&self, policy_json: &str) -> Result<()> {
        let document = Self::parse_logged(policy_json)?;
        self.update(|current| PolicySnapshot::build(document, current.tier_overrides().to_vec()))
    }

    /// Replace the tier overrides, keeping the current policy document
    pub fn set_tier_overrides(&self, tier_overrides: Vec<i64>) -> Result<()> {
        self.update(|current| {
            let document = PolicyDocument {
                rate_limits: current.policies().to_vec(),
            };
            PolicySnapshot::build(document, tier_overrides)
        })
    }

    /// Current snapshot; cheap to clone and safe to hold across awaits
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Resolve a capacity against the current snapshot
    pub fn effective_limit(&self, action: &str, tier: u32) -> Capacity {
        self.snapshot().effective_limit(action, tier)
    }

    fn parse_logged(policy_json: &str) -> Result<PolicyDocument> {
        PolicyDocument::parse(policy_json)
            .inspect_err(|e| warn!("Rejected rate limit policy, keeping previous: {}", e))
    }

    /// Build the next snapshot from the current one and publish it
    ///
    /// The write lock is held from read to publish, so concurrent updates
    /// apply one after another instead of overwriting each other.
    fn update<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&PolicySnapshot) -> Result<PolicySnapshot>,
    {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let snapshot = build(&**guard)
            .inspect_err(|e| warn!("Rejected rate limit policy, keeping previous: {}", e))?;

        info!(
            records = snapshot.policies().len(),
            tiers = snapshot.tier_overrides().len(),
            "Published rate limit policy"
        );
        *guard = Arc::new(snapshot);
        drop(guard);

        metrics::POLICY_RELOADS_TOTAL.inc();
        Ok(())
    }
}
