//! Plans and the shared changes container
//!
//! A plan is an ordered set of per-instance changes plus the prior and
//! planned state snapshots. During a walk, vertices append changes to the
//! shared container concurrently; the result is finalized into a sorted
//! sequence before the walk returns.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addrs::AbsResourceInstance;
use crate::planner::{ChangeAction, PlanMode};
use crate::state::{DeposedKey, State};
use crate::types::DynamicValue;

/// One proposed change to one resource instance object.
#[derive(Debug, Clone)]
pub struct ResourceInstanceChange {
    pub addr: AbsResourceInstance,
    /// `Some` when the change targets a deposed object rather than the
    /// current one.
    pub deposed_key: Option<DeposedKey>,
    pub provider: crate::addrs::AbsProviderConfig,
    pub action: ChangeAction,
    pub prior: Option<DynamicValue>,
    pub planned: Option<DynamicValue>,
    /// Provider-private bytes carried from plan to apply.
    pub private: Vec<u8>,
}

impl ResourceInstanceChange {
    fn key(addr: &AbsResourceInstance, deposed_key: Option<&DeposedKey>) -> String {
        match deposed_key {
            Some(k) => format!("{} (deposed {})", addr, k),
            None => addr.to_string(),
        }
    }
}

/// Concurrent append-only container the walk writes changes into, keyed by
/// instance address plus deposed key.
#[derive(Default)]
pub struct Changes {
    inner: Mutex<HashMap<String, ResourceInstanceChange>>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, change: ResourceInstanceChange) {
        let key = ResourceInstanceChange::key(&change.addr, change.deposed_key.as_ref());
        self.inner
            .lock()
            .expect("changes lock poisoned")
            .insert(key, change);
    }

    pub fn get(
        &self,
        addr: &AbsResourceInstance,
        deposed_key: Option<&DeposedKey>,
    ) -> Option<ResourceInstanceChange> {
        self.inner
            .lock()
            .expect("changes lock poisoned")
            .get(&ResourceInstanceChange::key(addr, deposed_key))
            .cloned()
    }

    /// Deposed-object changes recorded for one instance.
    pub fn deposed_for(&self, addr: &AbsResourceInstance) -> Vec<ResourceInstanceChange> {
        let mut out: Vec<ResourceInstanceChange> = self
            .inner
            .lock()
            .expect("changes lock poisoned")
            .values()
            .filter(|c| c.addr == *addr && c.deposed_key.is_some())
            .cloned()
            .collect();
        out.sort_by_key(|c| c.deposed_key.clone());
        out
    }

    /// The finalized, address-ordered change sequence.
    pub fn finalize(&self) -> Vec<ResourceInstanceChange> {
        let mut out: Vec<ResourceInstanceChange> = self
            .inner
            .lock()
            .expect("changes lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|c| ResourceInstanceChange::key(&c.addr, c.deposed_key.as_ref()));
        out
    }

    /// Seeds the container from a previously produced plan, for apply walks.
    pub fn seed(&self, changes: &[ResourceInstanceChange]) {
        let mut inner = self.inner.lock().expect("changes lock poisoned");
        for change in changes {
            inner.insert(
                ResourceInstanceChange::key(&change.addr, change.deposed_key.as_ref()),
                change.clone(),
            );
        }
    }
}

/// The emitted plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub mode: PlanMode,
    pub changes: Vec<ResourceInstanceChange>,
    pub prior_state: State,
    /// Best-effort projection of the state after the plan applies.
    pub planned_state: State,
}

impl Plan {
    /// Whether any change leaves an object behind instead of destroying it.
    pub fn leaves_objects_behind(&self) -> bool {
        self.changes.iter().any(|c| c.action.forgets())
    }

    /// Counts per action, for quick summaries.
    pub fn action_count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }
}
