//! Configuration model consumed by the engine
//!
//! Loading and expression parsing happen outside the engine; what arrives
//! here is a static tree of modules with their provider blocks, resource
//! declarations, removed blocks and module calls. Expression values are
//! resolved later through the evaluation context.

use std::collections::HashMap;

use crate::addrs;
use crate::types::DynamicValue;

/// The whole configuration: a tree of modules rooted at the root module.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub root: ConfigModule,
}

impl Config {
    pub fn new(root: ConfigModule) -> Self {
        Self { root }
    }

    pub fn module(&self, path: &addrs::ModulePath) -> Option<&ConfigModule> {
        let mut current = &self.root;
        for step in &path.0 {
            current = current.children.get(step)?;
        }
        Some(current)
    }

    /// Visits every module in the tree, parents before children.
    pub fn walk_modules<'a>(&'a self, visit: &mut dyn FnMut(&'a ConfigModule)) {
        fn recurse<'a>(module: &'a ConfigModule, visit: &mut dyn FnMut(&'a ConfigModule)) {
            visit(module);
            for child in module.children.values() {
                recurse(child, visit);
            }
        }
        recurse(&self.root, visit);
    }

    /// Resolves a local provider name within a module to its FQN: the
    /// module's own `required_providers` wins, then the root's, then the
    /// default namespace.
    pub fn provider_fqn(&self, module: &ConfigModule, local_name: &str) -> addrs::Provider {
        if let Some(fqn) = module.required_providers.get(local_name) {
            return fqn.clone();
        }
        if let Some(fqn) = self.root.required_providers.get(local_name) {
            return fqn.clone();
        }
        addrs::Provider::default(local_name)
    }

    /// Every provider FQN the configuration can reach; input to schema
    /// preload.
    pub fn provider_fqns(&self) -> Vec<addrs::Provider> {
        let mut out: Vec<addrs::Provider> = Vec::new();
        let mut modules = Vec::new();
        self.walk_modules(&mut |m| modules.push(m));
        for module in modules {
            for block in &module.provider_configs {
                let fqn = self.provider_fqn(module, &block.local_name);
                if !out.contains(&fqn) {
                    out.push(fqn);
                }
            }
            for fqn in module.required_providers.values() {
                if !out.contains(fqn) {
                    out.push(fqn.clone());
                }
            }
            for resource in &module.resources {
                let fqn = self.provider_fqn(module, &resource.provider_local_name());
                if !out.contains(&fqn) {
                    out.push(fqn);
                }
            }
        }
        out.sort();
        out
    }
}

/// One module in the static configuration tree.
#[derive(Debug, Clone, Default)]
pub struct ConfigModule {
    pub path: addrs::ModulePath,
    pub provider_configs: Vec<ProviderConfigBlock>,
    /// Local provider name → FQN, from the module's `required_providers`.
    pub required_providers: HashMap<String, addrs::Provider>,
    pub resources: Vec<ResourceConfig>,
    pub removed: Vec<RemovedBlock>,
    pub module_calls: Vec<ModuleCall>,
    pub children: HashMap<String, ConfigModule>,
}

impl ConfigModule {
    pub fn new(path: addrs::ModulePath) -> Self {
        Self {
            path,
            ..Self::default()
        }
    }

    pub fn resource(&self, resource: &addrs::Resource) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| &r.resource == resource)
    }

    pub fn removed_block(&self, resource: &addrs::Resource) -> Option<&RemovedBlock> {
        self.removed.iter().find(|r| &r.from == resource)
    }

    pub fn add_child(&mut self, child: ConfigModule) {
        let name = child
            .path
            .last()
            .expect("child module must have a non-root path")
            .to_string();
        self.children.insert(name, child);
    }
}

/// A `provider` block as written in one module.
#[derive(Debug, Clone)]
pub struct ProviderConfigBlock {
    pub local_name: String,
    pub alias: Option<String>,
    pub config: DynamicValue,
    /// A syntactically empty block. In a non-root module this marks the
    /// block proxyable: it stands in for a configuration passed down from
    /// the parent.
    pub is_empty: bool,
}

impl ProviderConfigBlock {
    pub fn new(local_name: impl Into<String>, config: DynamicValue) -> Self {
        Self {
            local_name: local_name.into(),
            alias: None,
            config,
            is_empty: false,
        }
    }

    pub fn empty(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            alias: None,
            config: DynamicValue::null(),
            is_empty: true,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Lifecycle arguments of a managed resource.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    /// When false, removal of the declaration forgets the object instead of
    /// destroying it.
    pub destroy: bool,
    /// When false, existing instances are retired on the next plan.
    pub enabled: bool,
    pub create_before_destroy: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            destroy: true,
            enabled: true,
            create_before_destroy: false,
        }
    }
}

/// Reference to a provider configuration from a resource declaration.
#[derive(Debug, Clone)]
pub struct ProviderRef {
    pub local_name: String,
    pub alias: Option<String>,
}

/// One resource declaration.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub resource: addrs::Resource,
    pub config: DynamicValue,
    pub lifecycle: Lifecycle,
    /// Explicit `provider =` argument; `None` uses the type-implied name.
    pub provider: Option<ProviderRef>,
    /// Same-module resources this declaration refers to.
    pub references: Vec<addrs::Resource>,
    /// Local names of providers whose functions the declaration calls.
    pub provider_function_refs: Vec<String>,
    /// Previous address recorded by a `moved` block, if any.
    pub moved_from: Option<addrs::Resource>,
}

impl ResourceConfig {
    pub fn new(resource: addrs::Resource, config: DynamicValue) -> Self {
        Self {
            resource,
            config,
            lifecycle: Lifecycle::default(),
            provider: None,
            references: Vec::new(),
            provider_function_refs: Vec::new(),
            moved_from: None,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_provider(mut self, local_name: impl Into<String>, alias: Option<String>) -> Self {
        self.provider = Some(ProviderRef {
            local_name: local_name.into(),
            alias,
        });
        self
    }

    pub fn with_references(mut self, references: Vec<addrs::Resource>) -> Self {
        self.references = references;
        self
    }

    pub fn provider_local_name(&self) -> String {
        match &self.provider {
            Some(p) => p.local_name.clone(),
            None => self.resource.implied_provider(),
        }
    }

    pub fn provider_alias(&self) -> Option<String> {
        self.provider.as_ref().and_then(|p| p.alias.clone())
    }
}

/// A `removed {}` block: the operator's explicit instruction for objects
/// whose declaration is gone.
#[derive(Debug, Clone)]
pub struct RemovedBlock {
    pub from: addrs::Resource,
    /// Whether removal destroys the object or merely forgets it.
    pub destroy: bool,
}

/// A call to a child module.
#[derive(Debug, Clone)]
pub struct ModuleCall {
    pub name: String,
    pub passed_providers: Vec<PassedProvider>,
}

/// One provider handed from parent to child in a module call. `mappings`
/// carries one entry per instance key when the passing uses `for_each`;
/// a plain passing has a single entry under the none key.
#[derive(Debug, Clone)]
pub struct PassedProvider {
    pub child_name: String,
    pub child_alias: Option<String>,
    pub parent_name: String,
    pub mappings: Vec<ProviderKeyMapping>,
}

#[derive(Debug, Clone)]
pub struct ProviderKeyMapping {
    pub key: addrs::InstanceKey,
    pub parent_alias: Option<String>,
}

impl PassedProvider {
    pub fn plain(
        child_name: impl Into<String>,
        parent_name: impl Into<String>,
        parent_alias: Option<String>,
    ) -> Self {
        Self {
            child_name: child_name.into(),
            child_alias: None,
            parent_name: parent_name.into(),
            mappings: vec![ProviderKeyMapping {
                key: addrs::InstanceKey::None,
                parent_alias,
            }],
        }
    }

    pub fn keyed(
        child_name: impl Into<String>,
        parent_name: impl Into<String>,
        mappings: Vec<ProviderKeyMapping>,
    ) -> Self {
        Self {
            child_name: child_name.into(),
            child_alias: None,
            parent_name: parent_name.into(),
            mappings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{ModulePath, Provider, Resource};

    #[test]
    fn module_lookup_by_path() {
        let mut root = ConfigModule::new(ModulePath::root());
        let mut a = ConfigModule::new(ModulePath::root().child("a"));
        let b = ConfigModule::new(ModulePath::root().child("a").child("b"));
        a.add_child(b);
        root.add_child(a);
        let config = Config::new(root);

        assert!(config.module(&ModulePath::root()).is_some());
        assert!(config
            .module(&ModulePath::root().child("a").child("b"))
            .is_some());
        assert!(config.module(&ModulePath::root().child("missing")).is_none());
    }

    #[test]
    fn provider_fqn_resolution_prefers_module_then_root() {
        let mut root = ConfigModule::new(ModulePath::root());
        root.required_providers.insert(
            "aws".to_string(),
            Provider::new("example.com", "acme", "aws"),
        );
        let mut child = ConfigModule::new(ModulePath::root().child("child"));
        child.required_providers.insert(
            "aws".to_string(),
            Provider::new("example.com", "other", "aws"),
        );
        root.add_child(child);
        let config = Config::new(root);

        let child = config.module(&ModulePath::root().child("child")).unwrap();
        assert_eq!(config.provider_fqn(child, "aws").namespace, "other");
        assert_eq!(config.provider_fqn(&config.root, "aws").namespace, "acme");
        assert_eq!(
            config.provider_fqn(&config.root, "random"),
            Provider::default("random")
        );
    }

    #[test]
    fn provider_fqns_cover_resources_without_blocks() {
        let mut root = ConfigModule::new(ModulePath::root());
        root.resources.push(ResourceConfig::new(
            Resource::managed("aws_instance", "web"),
            DynamicValue::null(),
        ));
        let config = Config::new(root);

        assert_eq!(config.provider_fqns(), vec![Provider::default("aws")]);
    }
}
