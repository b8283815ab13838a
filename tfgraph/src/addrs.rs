//! Address types for configuration and state objects
//!
//! Addresses are small comparable value types naming providers, modules,
//! resources and their instances. Static addresses (`ModulePath`) name
//! positions in the configuration tree; dynamic addresses (`ModuleInstance`,
//! `AbsResourceInstance`) name expanded objects at runtime.

use std::fmt;

/// Default registry host for providers without an explicit source.
pub const DEFAULT_REGISTRY: &str = "registry.tfgraph.dev";

/// Default namespace for providers without an explicit source.
pub const DEFAULT_NAMESPACE: &str = "builtin";

/// Fully-qualified provider name: registry host, namespace and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Provider {
    pub registry: String,
    pub namespace: String,
    pub type_name: String,
}

impl Provider {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            type_name: type_name.into(),
        }
    }

    /// FQN for a bare local name, e.g. the implied provider of `aws_instance`.
    pub fn default(type_name: impl Into<String>) -> Self {
        Self::new(DEFAULT_REGISTRY, DEFAULT_NAMESPACE, type_name)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.registry, self.namespace, self.type_name)
    }
}

/// Static module path: the ordered call names leading to a module in the
/// configuration tree. The root module is the empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModulePath(pub Vec<String>);

impl ModulePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut steps = self.0.clone();
        steps.push(name.into());
        Self(steps)
    }

    /// The containing module's path, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// The final call name, or `None` at the root.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}", step)?;
        }
        Ok(())
    }
}

/// Key distinguishing instances produced by `count` or `for_each` expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceKey {
    /// The single instance of an unexpanded object.
    #[default]
    None,
    Int(i64),
    Str(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::None => Ok(()),
            InstanceKey::Int(i) => write!(f, "[{}]", i),
            InstanceKey::Str(s) => write!(f, "[{:?}]", s),
        }
    }
}

/// One step of a dynamic module path: a call name plus the instance key the
/// call was expanded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstanceStep {
    pub name: String,
    pub key: InstanceKey,
}

/// Dynamic module address: a concrete expansion of a `ModulePath`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstance(pub Vec<ModuleInstanceStep>);

impl ModuleInstance {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: impl Into<String>, key: InstanceKey) -> Self {
        let mut steps = self.0.clone();
        steps.push(ModuleInstanceStep {
            name: name.into(),
            key,
        });
        Self(steps)
    }

    /// The static module path this instance expands, with keys stripped.
    pub fn module_path(&self) -> ModulePath {
        ModulePath(self.0.iter().map(|s| s.name.clone()).collect())
    }
}

impl fmt::Display for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}{}", step.name, step.key)?;
        }
        Ok(())
    }
}

/// Address of one provider configuration block: which provider, in which
/// static module, under which alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbsProviderConfig {
    pub provider: Provider,
    pub module: ModulePath,
    pub alias: Option<String>,
}

impl AbsProviderConfig {
    pub fn new(provider: Provider, module: ModulePath, alias: Option<String>) -> Self {
        Self {
            provider,
            module,
            alias,
        }
    }

    /// The address this configuration would have in the parent module,
    /// used by the inheritance walk. `None` at the root.
    pub fn inherited_in_parent(&self) -> Option<Self> {
        let parent = self.module.parent()?;
        Some(Self {
            provider: self.provider.clone(),
            module: parent,
            alias: self.alias.clone(),
        })
    }
}

impl fmt::Display for AbsProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "provider[{}]", self.provider)?;
        if let Some(alias) = &self.alias {
            write!(f, ".{}", alias)?;
        }
        Ok(())
    }
}

/// How a resource participates in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceMode {
    Managed,
    Data,
    Ephemeral,
}

/// A resource declaration address within a single module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub mode: ResourceMode,
    pub type_name: String,
    pub name: String,
}

impl Resource {
    pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Managed,
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    pub fn data(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    pub fn ephemeral(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Ephemeral,
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// The local provider name implied by the type, e.g. `aws` for
    /// `aws_instance`. Used when the configuration names no provider.
    pub fn implied_provider(&self) -> String {
        match self.type_name.split_once('_') {
            Some((prefix, _)) => prefix.to_string(),
            None => self.type_name.clone(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.type_name, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.type_name, self.name),
            ResourceMode::Ephemeral => write!(f, "ephemeral.{}.{}", self.type_name, self.name),
        }
    }
}

/// A resource declaration within a static module: the address the reference
/// transformer operates on, uniform across plan and apply graphs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigResource {
    pub module: ModulePath,
    pub resource: Resource,
}

impl fmt::Display for ConfigResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}", self.resource)
    }
}

/// A resource within a concrete module instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbsResource {
    pub module: ModuleInstance,
    pub resource: Resource,
}

impl AbsResource {
    pub fn instance(&self, key: InstanceKey) -> AbsResourceInstance {
        AbsResourceInstance {
            module: self.module.clone(),
            resource: self.resource.clone(),
            key,
        }
    }

    pub fn config_resource(&self) -> ConfigResource {
        ConfigResource {
            module: self.module.module_path(),
            resource: self.resource.clone(),
        }
    }
}

impl fmt::Display for AbsResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}", self.resource)
    }
}

/// A single resource instance within a concrete module instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbsResourceInstance {
    pub module: ModuleInstance,
    pub resource: Resource,
    pub key: InstanceKey,
}

impl AbsResourceInstance {
    pub fn abs_resource(&self) -> AbsResource {
        AbsResource {
            module: self.module.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl fmt::Display for AbsResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}{}", self.resource, self.key)
    }
}
