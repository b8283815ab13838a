//! Persisted state of managed resource instances
//!
//! State is a tree keyed module instance → resource → instance key. Each
//! instance holds at most one current object plus any deposed objects left
//! behind by create-before-destroy replacements, addressed by opaque keys.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::addrs;
use crate::error::Result;
use crate::types::{DynamicValue, RawState};

/// Whether an object is usable or scheduled for replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    Ready,
    Tainted,
}

/// One stored object: the unit the planner and the state transformer work on.
#[derive(Debug, Clone)]
pub struct ResourceInstanceObject {
    /// Schema version the attributes were written under. Non-decreasing
    /// across runs.
    pub schema_version: u64,
    /// JSON attribute payload. Preferred form.
    pub attrs_json: Option<Vec<u8>>,
    /// Legacy flat-map payload, only populated when no JSON exists.
    pub attrs_flat: Option<HashMap<String, String>>,
    /// Provider-scoped opaque bytes.
    pub private: Vec<u8>,
    pub status: ObjectStatus,
    /// The state's recorded wish that this object outlive config removal.
    pub skip_destroy: bool,
    /// Addresses this object depended on when written. Advisory, used to
    /// order destroys.
    pub dependencies: Vec<addrs::ConfigResource>,
}

impl ResourceInstanceObject {
    pub fn from_value(value: &DynamicValue, schema_version: u64) -> Result<Self> {
        Ok(Self {
            schema_version,
            attrs_json: Some(value.encode_json()?),
            attrs_flat: None,
            private: Vec::new(),
            status: ObjectStatus::Ready,
            skip_destroy: false,
            dependencies: Vec::new(),
        })
    }

    pub fn with_private(mut self, private: Vec<u8>) -> Self {
        self.private = private;
        self
    }

    pub fn with_skip_destroy(mut self, skip_destroy: bool) -> Self {
        self.skip_destroy = skip_destroy;
        self
    }

    pub fn with_status(mut self, status: ObjectStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<addrs::ConfigResource>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// The payload as handed to provider upgrade/move entry points. JSON is
    /// preferred; the flatmap only rides along when JSON is absent.
    pub fn raw_state(&self) -> RawState {
        if self.attrs_json.is_some() {
            RawState {
                json: self.attrs_json.clone(),
                flatmap: None,
            }
        } else {
            RawState {
                json: None,
                flatmap: self.attrs_flat.clone(),
            }
        }
    }

    pub fn decoded_value(&self) -> Result<DynamicValue> {
        match &self.attrs_json {
            Some(json) => DynamicValue::decode_json(json),
            None => Ok(DynamicValue::null()),
        }
    }
}

/// Opaque key addressing a deposed object within one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeposedKey(String);

impl DeposedKey {
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(id[..8].to_string())
    }
}

impl Default for DeposedKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All objects of one resource instance.
#[derive(Debug, Clone, Default)]
pub struct ResourceInstanceState {
    pub current: Option<ResourceInstanceObject>,
    pub deposed: HashMap<DeposedKey, ResourceInstanceObject>,
}

impl ResourceInstanceState {
    pub fn has_objects(&self) -> bool {
        self.current.is_some() || !self.deposed.is_empty()
    }

    /// Moves the current object aside under a fresh deposed key, as done
    /// ahead of a create-before-destroy replacement.
    pub fn depose_current(&mut self) -> Option<DeposedKey> {
        let current = self.current.take()?;
        let key = DeposedKey::new();
        self.deposed.insert(key.clone(), current);
        Some(key)
    }
}

/// State of one resource declaration: its instances plus the provider
/// configuration recorded when the objects were written.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub addr: addrs::Resource,
    pub provider_config: addrs::AbsProviderConfig,
    pub instances: HashMap<addrs::InstanceKey, ResourceInstanceState>,
}

/// State of one module instance.
#[derive(Debug, Clone)]
pub struct ModuleState {
    pub addr: addrs::ModuleInstance,
    pub resources: HashMap<String, ResourceState>,
}

impl ModuleState {
    pub fn new(addr: addrs::ModuleInstance) -> Self {
        Self {
            addr,
            resources: HashMap::new(),
        }
    }

    pub fn resource(&self, resource: &addrs::Resource) -> Option<&ResourceState> {
        self.resources.get(&resource.to_string())
    }
}

/// The whole persisted state tree.
#[derive(Debug, Clone, Default)]
pub struct State {
    modules: HashMap<String, ModuleState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modules
            .values()
            .all(|m| m.resources.values().all(|r| {
                r.instances.values().all(|i| !i.has_objects())
            }))
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleState> {
        self.modules.values()
    }

    pub fn module(&self, addr: &addrs::ModuleInstance) -> Option<&ModuleState> {
        self.modules.get(&addr.to_string())
    }

    pub fn ensure_module(&mut self, addr: &addrs::ModuleInstance) -> &mut ModuleState {
        self.modules
            .entry(addr.to_string())
            .or_insert_with(|| ModuleState::new(addr.clone()))
    }

    pub fn resource(&self, addr: &addrs::AbsResource) -> Option<&ResourceState> {
        self.module(&addr.module)?.resource(&addr.resource)
    }

    pub fn instance(&self, addr: &addrs::AbsResourceInstance) -> Option<&ResourceInstanceState> {
        self.resource(&addr.abs_resource())?.instances.get(&addr.key)
    }

    pub fn instance_object(
        &self,
        addr: &addrs::AbsResourceInstance,
    ) -> Option<&ResourceInstanceObject> {
        self.instance(addr)?.current.as_ref()
    }

    /// Writes (or with `None`, removes) the current object for an instance,
    /// recording the serving provider configuration. Empty containers are
    /// pruned so removal of the last object empties the state.
    pub fn set_instance_current(
        &mut self,
        addr: &addrs::AbsResourceInstance,
        provider_config: &addrs::AbsProviderConfig,
        object: Option<ResourceInstanceObject>,
    ) {
        let module = self.ensure_module(&addr.module);
        let resource = module
            .resources
            .entry(addr.resource.to_string())
            .or_insert_with(|| ResourceState {
                addr: addr.resource.clone(),
                provider_config: provider_config.clone(),
                instances: HashMap::new(),
            });
        resource.provider_config = provider_config.clone();
        let instance = resource.instances.entry(addr.key.clone()).or_default();
        instance.current = object;
        self.prune();
    }

    pub fn set_instance_deposed(
        &mut self,
        addr: &addrs::AbsResourceInstance,
        provider_config: &addrs::AbsProviderConfig,
        key: DeposedKey,
        object: Option<ResourceInstanceObject>,
    ) {
        let module = self.ensure_module(&addr.module);
        let resource = module
            .resources
            .entry(addr.resource.to_string())
            .or_insert_with(|| ResourceState {
                addr: addr.resource.clone(),
                provider_config: provider_config.clone(),
                instances: HashMap::new(),
            });
        let instance = resource.instances.entry(addr.key.clone()).or_default();
        match object {
            Some(object) => {
                instance.deposed.insert(key, object);
            }
            None => {
                instance.deposed.remove(&key);
            }
        }
        self.prune();
    }

    /// Moves the current object of an instance aside under a fresh deposed
    /// key, returning the key.
    pub fn depose_instance(&mut self, addr: &addrs::AbsResourceInstance) -> Option<DeposedKey> {
        let module = self.modules.get_mut(&addr.module.to_string())?;
        let resource = module.resources.get_mut(&addr.resource.to_string())?;
        resource.instances.get_mut(&addr.key)?.depose_current()
    }

    /// Drops empty instances, resources and modules.
    fn prune(&mut self) {
        for module in self.modules.values_mut() {
            for resource in module.resources.values_mut() {
                resource.instances.retain(|_, i| i.has_objects());
            }
            module.resources.retain(|_, r| !r.instances.is_empty());
        }
        self.modules.retain(|_, m| !m.resources.is_empty());
    }

    /// Every instance address present in state, current objects and deposed
    /// alike.
    pub fn all_instance_addrs(&self) -> Vec<addrs::AbsResourceInstance> {
        let mut out = Vec::new();
        for module in self.modules.values() {
            for resource in module.resources.values() {
                for key in resource.instances.keys() {
                    out.push(addrs::AbsResourceInstance {
                        module: module.addr.clone(),
                        resource: resource.addr.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        out.sort_by_key(|a| a.to_string());
        out
    }

    /// Provider FQNs recorded anywhere in state; used for schema preload.
    pub fn provider_fqns(&self) -> Vec<addrs::Provider> {
        let mut out: Vec<addrs::Provider> = Vec::new();
        for module in self.modules.values() {
            for resource in module.resources.values() {
                let fqn = resource.provider_config.provider.clone();
                if !out.contains(&fqn) {
                    out.push(fqn);
                }
            }
        }
        out.sort();
        out
    }
}

/// Exclusive-lock wrapper around the mutable state tree shared by the walk.
/// Hooks and callers receive deep copies so they may retain them without
/// coordination.
#[derive(Clone)]
pub struct SyncState {
    inner: Arc<Mutex<State>>,
}

impl SyncState {
    pub fn new(state: State) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.inner.lock().expect("state lock poisoned");
        f(&mut guard)
    }

    pub fn snapshot(&self) -> State {
        self.inner.lock().expect("state lock poisoned").clone()
    }
}
