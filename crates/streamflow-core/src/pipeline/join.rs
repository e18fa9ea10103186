//! Join policies: how a JOIN node aggregates branches of one trace.
//!
//! Arrivals are grouped by `trace_id`, which every fork of a run shares. The
//! policy decides when a group is released downstream and what happens to
//! the contexts that do not continue.
//!
//! Policy state lives in a `JoinRegistry` shared by every pipeline compiled
//! from the same services, keyed by definition and node. Dropping a compiled
//! pipeline from the cache therefore never forgets a half-full group; the
//! rebuilt pipeline picks up the same policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use streamflow_types::context::Context;
use streamflow_types::definition::JoinMode;
use uuid::Uuid;

/// Result of offering one arrival to a join.
#[derive(Debug)]
pub enum JoinOutcome {
    /// Held until more branches arrive.
    Pending,
    /// Continue downstream with `merged`. `absorbed` are the other arrivals
    /// of the group; they stop here.
    Release {
        merged: Context,
        absorbed: Vec<Context>,
    },
    /// This arrival stops here; its group was already released.
    Absorbed(Context),
}

/// Aggregation barrier for a JOIN node.
pub trait JoinPolicy: Send + Sync {
    fn offer(&self, context: Context, now: Instant) -> JoinOutcome;

    /// Drop groups that waited longer than the straggler timeout and return
    /// the contexts they held. Policies without a timeout return nothing.
    fn sweep(&self, now: Instant) -> Vec<Context>;

    /// Groups currently held.
    fn pending_groups(&self) -> usize;
}

/// The built-in policy for a join mode.
pub fn policy_for(mode: JoinMode, arity: usize, timeout: Option<Duration>) -> Box<dyn JoinPolicy> {
    match mode {
        JoinMode::AllOf => Box::new(AllOf::new(arity, timeout)),
        JoinMode::FirstOf => Box::new(FirstOf::new(timeout)),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Join policies by `(definition id, node id)`, outliving compiled pipelines.
#[derive(Default)]
pub struct JoinRegistry {
    policies: DashMap<(Uuid, String), Arc<dyn JoinPolicy>>,
}

impl JoinRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The policy of `node_id` in `definition_id`, created with `make` on
    /// first use.
    pub fn policy(
        &self,
        definition_id: Uuid,
        node_id: &str,
        make: impl FnOnce() -> Box<dyn JoinPolicy>,
    ) -> Arc<dyn JoinPolicy> {
        let entry = self
            .policies
            .entry((definition_id, node_id.to_string()))
            .or_insert_with(|| Arc::from(make()));
        Arc::clone(entry.value())
    }

    /// Partial groups held across every registered join.
    pub fn pending_groups(&self) -> usize {
        self.policies.iter().map(|p| p.pending_groups()).sum()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

// ---------------------------------------------------------------------------
// AllOf
// ---------------------------------------------------------------------------

struct Group {
    opened: Instant,
    arrivals: Vec<Context>,
}

/// Wait for `arity` arrivals of a trace, then release the first arrival with
/// the business and pass data of all arrivals merged in arrival order.
pub struct AllOf {
    arity: usize,
    timeout: Option<Duration>,
    groups: Mutex<HashMap<Uuid, Group>>,
}

impl AllOf {
    pub fn new(arity: usize, timeout: Option<Duration>) -> Self {
        Self {
            arity: arity.max(1),
            timeout,
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl JoinPolicy for AllOf {
    fn offer(&self, context: Context, now: Instant) -> JoinOutcome {
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let trace_id = context.trace_id;
        let group = groups.entry(trace_id).or_insert_with(|| Group {
            opened: now,
            arrivals: Vec::with_capacity(self.arity),
        });
        group.arrivals.push(context);
        if group.arrivals.len() < self.arity {
            return JoinOutcome::Pending;
        }

        let Some(group) = groups.remove(&trace_id) else {
            return JoinOutcome::Pending;
        };
        let mut arrivals = group.arrivals.into_iter();
        let Some(mut merged) = arrivals.next() else {
            return JoinOutcome::Pending;
        };
        let absorbed: Vec<Context> = arrivals.collect();
        for other in &absorbed {
            merged.merge_business_data(other.business_data.clone());
            merged.merge_pass_data(other.pass_data.clone());
        }
        JoinOutcome::Release { merged, absorbed }
    }

    fn sweep(&self, now: Instant) -> Vec<Context> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let expired: Vec<Uuid> = groups
            .iter()
            .filter(|(_, g)| now.saturating_duration_since(g.opened) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| groups.remove(&id))
            .flat_map(|g| g.arrivals)
            .collect()
    }

    fn pending_groups(&self) -> usize {
        self.groups
            .lock()
            .map(|g| g.len())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// FirstOf
// ---------------------------------------------------------------------------

/// Release the first arrival of each trace; absorb the later ones.
///
/// Released traces are remembered so stragglers can be recognized. With a
/// timeout, `sweep` forgets traces released longer ago than that.
pub struct FirstOf {
    timeout: Option<Duration>,
    released: Mutex<HashMap<Uuid, Instant>>,
}

impl FirstOf {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            released: Mutex::new(HashMap::new()),
        }
    }
}

impl JoinPolicy for FirstOf {
    fn offer(&self, context: Context, now: Instant) -> JoinOutcome {
        let mut released = self
            .released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if released.contains_key(&context.trace_id) {
            return JoinOutcome::Absorbed(context);
        }
        released.insert(context.trace_id, now);
        JoinOutcome::Release {
            merged: context,
            absorbed: Vec::new(),
        }
    }

    fn sweep(&self, now: Instant) -> Vec<Context> {
        if let Some(timeout) = self.timeout {
            if let Ok(mut released) = self.released.lock() {
                released.retain(|_, at| now.saturating_duration_since(*at) < timeout);
            }
        }
        Vec::new()
    }

    fn pending_groups(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use streamflow_types::DataMap;

    fn branch(root: &Context, data: serde_json::Value) -> Context {
        let mut ctx = root.fork();
        ctx.business_data = data.as_object().cloned().unwrap();
        ctx
    }

    fn root() -> Context {
        Context::new("s", Uuid::nil(), "start", DataMap::new())
    }

    #[test]
    fn all_of_waits_for_every_branch_and_merges() {
        let join = AllOf::new(2, None);
        let run = root();
        let now = Instant::now();

        let a = branch(&run, json!({"a": 1, "shared": "a"}));
        let b = branch(&run, json!({"b": 2, "shared": "b"}));
        let first_id = a.id;

        assert!(matches!(join.offer(a, now), JoinOutcome::Pending));
        assert_eq!(join.pending_groups(), 1);

        let JoinOutcome::Release { merged, absorbed } = join.offer(b, now) else {
            panic!("expected release");
        };
        assert_eq!(merged.id, first_id);
        assert_eq!(
            serde_json::Value::Object(merged.business_data),
            json!({"a": 1, "b": 2, "shared": "b"})
        );
        assert_eq!(absorbed.len(), 1);
        assert_eq!(join.pending_groups(), 0);
    }

    #[test]
    fn all_of_keeps_traces_apart() {
        let join = AllOf::new(2, None);
        let now = Instant::now();
        let one = root();
        let two = root();
        assert!(matches!(join.offer(branch(&one, json!({})), now), JoinOutcome::Pending));
        assert!(matches!(join.offer(branch(&two, json!({})), now), JoinOutcome::Pending));
        assert_eq!(join.pending_groups(), 2);
    }

    #[test]
    fn all_of_sweeps_stragglers_after_timeout() {
        let join = AllOf::new(3, Some(Duration::from_secs(30)));
        let start = Instant::now();
        let run = root();
        join.offer(branch(&run, json!({})), start);
        join.offer(branch(&run, json!({})), start);

        assert!(join.sweep(start + Duration::from_secs(10)).is_empty());
        let expired = join.sweep(start + Duration::from_secs(31));
        assert_eq!(expired.len(), 2);
        assert_eq!(join.pending_groups(), 0);
    }

    #[test]
    fn all_of_without_timeout_never_sweeps() {
        let join = AllOf::new(2, None);
        let start = Instant::now();
        join.offer(branch(&root(), json!({})), start);
        assert!(join.sweep(start + Duration::from_secs(86_400)).is_empty());
        assert_eq!(join.pending_groups(), 1);
    }

    #[test]
    fn registry_hands_out_one_policy_per_node() {
        let registry = JoinRegistry::new();
        let definition = Uuid::now_v7();
        let run = root();
        let now = Instant::now();

        let first = registry.policy(definition, "join", || Box::new(AllOf::new(2, None)));
        assert!(matches!(first.offer(branch(&run, json!({})), now), JoinOutcome::Pending));

        let again = registry.policy(definition, "join", || panic!("policy rebuilt"));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.pending_groups(), 1);
        assert!(matches!(
            again.offer(branch(&run, json!({})), now),
            JoinOutcome::Release { .. }
        ));

        registry.policy(Uuid::now_v7(), "join", || Box::new(FirstOf::new(None)));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pending_groups(), 0);
    }

    #[test]
    fn first_of_releases_once_per_trace() {
        let join = FirstOf::new(None);
        let run = root();
        let now = Instant::now();
        assert!(matches!(
            join.offer(branch(&run, json!({})), now),
            JoinOutcome::Release { .. }
        ));
        assert!(matches!(
            join.offer(branch(&run, json!({})), now),
            JoinOutcome::Absorbed(_)
        ));
        assert!(matches!(
            join.offer(branch(&root(), json!({})), now),
            JoinOutcome::Release { .. }
        ));
    }
}
