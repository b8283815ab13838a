//! Evaluation context and instance expansion
//!
//! Expression and type interpretation live outside the engine. The walk asks
//! an `EvaluationContext` for resolved values and expansion keys, and records
//! expansions in the `InstanceExpander` so resolvers see a consistent
//! snapshot once a vertex is runnable.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addrs;
use crate::config::Config;
use crate::types::DynamicValue;

/// Resolves expression values and expansion keys against a module-instance
/// scoped data store. Opaque to the engine.
pub trait EvaluationContext: Send + Sync {
    /// The evaluated configuration body of a resource in one module instance.
    fn resource_config_value(
        &self,
        module: &addrs::ModuleInstance,
        resource: &addrs::Resource,
    ) -> DynamicValue;

    /// The evaluated configuration body of a provider block.
    fn provider_config_value(&self, addr: &addrs::AbsProviderConfig) -> DynamicValue;

    /// Instance keys a module call expands into under one parent instance.
    fn expand_module_call(
        &self,
        parent: &addrs::ModuleInstance,
        call: &str,
    ) -> Vec<addrs::InstanceKey>;

    /// Instance keys a resource expands into within one module instance.
    fn expand_resource(
        &self,
        module: &addrs::ModuleInstance,
        resource: &addrs::Resource,
    ) -> Vec<addrs::InstanceKey>;
}

/// Evaluation context backed directly by the configuration tree: values are
/// taken literally, expansions default to a single instance unless
/// registered. Suits tests and callers whose expressions were already
/// resolved.
#[derive(Default)]
pub struct StaticEvaluationContext {
    config: Config,
    resource_expansions: HashMap<String, Vec<addrs::InstanceKey>>,
    module_expansions: HashMap<String, Vec<addrs::InstanceKey>>,
}

impl StaticEvaluationContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            resource_expansions: HashMap::new(),
            module_expansions: HashMap::new(),
        }
    }

    /// Fixes the expansion of a resource declaration, for every instance of
    /// its module.
    pub fn with_resource_expansion(
        mut self,
        resource: addrs::ConfigResource,
        keys: Vec<addrs::InstanceKey>,
    ) -> Self {
        self.resource_expansions.insert(resource.to_string(), keys);
        self
    }

    /// Fixes the expansion of a module call, for every parent instance.
    pub fn with_module_expansion(
        mut self,
        parent: addrs::ModulePath,
        call: &str,
        keys: Vec<addrs::InstanceKey>,
    ) -> Self {
        self.module_expansions
            .insert(format!("{}>{}", parent, call), keys);
        self
    }
}

impl EvaluationContext for StaticEvaluationContext {
    fn resource_config_value(
        &self,
        module: &addrs::ModuleInstance,
        resource: &addrs::Resource,
    ) -> DynamicValue {
        self.config
            .module(&module.module_path())
            .and_then(|m| m.resource(resource))
            .map(|r| r.config.clone())
            .unwrap_or_else(DynamicValue::null)
    }

    fn provider_config_value(&self, addr: &addrs::AbsProviderConfig) -> DynamicValue {
        let Some(module) = self.config.module(&addr.module) else {
            return DynamicValue::null();
        };
        module
            .provider_configs
            .iter()
            .find(|block| {
                block.alias == addr.alias
                    && self.config.provider_fqn(module, &block.local_name) == addr.provider
            })
            .map(|block| block.config.clone())
            .unwrap_or_else(DynamicValue::null)
    }

    fn expand_module_call(
        &self,
        parent: &addrs::ModuleInstance,
        call: &str,
    ) -> Vec<addrs::InstanceKey> {
        self.module_expansions
            .get(&format!("{}>{}", parent.module_path(), call))
            .cloned()
            .unwrap_or_else(|| vec![addrs::InstanceKey::None])
    }

    fn expand_resource(
        &self,
        module: &addrs::ModuleInstance,
        resource: &addrs::Resource,
    ) -> Vec<addrs::InstanceKey> {
        let config_resource = addrs::ConfigResource {
            module: module.module_path(),
            resource: resource.clone(),
        };
        self.resource_expansions
            .get(&config_resource.to_string())
            .cloned()
            .unwrap_or_else(|| vec![addrs::InstanceKey::None])
    }
}

/// Registered module and resource expansions. The walk coordinator is the
/// single writer; resolvers read a consistent snapshot once their vertex is
/// runnable.
#[derive(Default)]
pub struct InstanceExpander {
    inner: Mutex<ExpanderData>,
}

#[derive(Default)]
struct ExpanderData {
    /// parent module instance + call name → expansion keys
    module_keys: HashMap<String, Vec<addrs::InstanceKey>>,
    /// absolute resource → instance keys
    resource_keys: HashMap<String, Vec<addrs::InstanceKey>>,
}

impl InstanceExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module_call(
        &self,
        parent: &addrs::ModuleInstance,
        call: &str,
        keys: Vec<addrs::InstanceKey>,
    ) {
        let mut inner = self.inner.lock().expect("expander lock poisoned");
        inner
            .module_keys
            .insert(format!("{}>{}", parent, call), keys);
    }

    pub fn register_resource(&self, resource: &addrs::AbsResource, keys: Vec<addrs::InstanceKey>) {
        let mut inner = self.inner.lock().expect("expander lock poisoned");
        inner.resource_keys.insert(resource.to_string(), keys);
    }

    /// All module instances a static path expands into. A call with no
    /// registered expansion contributes a single unkeyed instance.
    pub fn expand_module_path(&self, path: &addrs::ModulePath) -> Vec<addrs::ModuleInstance> {
        let inner = self.inner.lock().expect("expander lock poisoned");
        let mut instances = vec![addrs::ModuleInstance::root()];
        for name in &path.0 {
            let mut next = Vec::new();
            for parent in &instances {
                let keys = inner
                    .module_keys
                    .get(&format!("{}>{}", parent, name))
                    .cloned()
                    .unwrap_or_else(|| vec![addrs::InstanceKey::None]);
                for key in keys {
                    next.push(parent.child(name.clone(), key));
                }
            }
            instances = next;
        }
        instances
    }

    /// All instances of one resource within one module instance.
    pub fn expand_resource(&self, resource: &addrs::AbsResource) -> Vec<addrs::AbsResourceInstance> {
        let inner = self.inner.lock().expect("expander lock poisoned");
        let keys = inner
            .resource_keys
            .get(&resource.to_string())
            .cloned()
            .unwrap_or_else(|| vec![addrs::InstanceKey::None]);
        keys.into_iter().map(|k| resource.instance(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, ModuleInstance, ModulePath, Resource};

    #[test]
    fn unregistered_expansions_default_to_single_instance() {
        let expander = InstanceExpander::new();
        let path = ModulePath::root().child("a");

        let instances = expander.expand_module_path(&path);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0], ModuleInstance::root().child("a", InstanceKey::None));
    }

    #[test]
    fn module_expansion_multiplies_across_levels() {
        let expander = InstanceExpander::new();
        let root = ModuleInstance::root();
        expander.register_module_call(
            &root,
            "a",
            vec![InstanceKey::Int(0), InstanceKey::Int(1)],
        );
        for i in 0..2 {
            expander.register_module_call(
                &root.child("a", InstanceKey::Int(i)),
                "b",
                vec![InstanceKey::Str("x".into())],
            );
        }

        let instances = expander.expand_module_path(&ModulePath::root().child("a").child("b"));
        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn resource_expansion_produces_keyed_instances() {
        let expander = InstanceExpander::new();
        let resource = addrs::AbsResource {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_instance", "web"),
        };
        expander.register_resource(&resource, vec![InstanceKey::Int(0), InstanceKey::Int(1)]);

        let instances = expander.expand_resource(&resource);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].key, InstanceKey::Int(1));
    }
}
