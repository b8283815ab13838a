//! Provider resolution
//!
//! Maps each provider-consuming vertex to the concrete provider
//! configurations that can serve it: inheritance walk up the module tree,
//! proxy expansion across module boundaries, and a per-consumer resolver
//! table answering, at apply time, which configuration serves a concrete
//! resource instance. Expansion happens during the walk, so the transformer
//! cannot commit to a single provider per consumer; it carries this lazily
//! resolvable table instead.

use std::collections::HashMap;

use crate::addrs;
use crate::graph::{Graph, Node, NodeId};
use crate::transform::{GraphTransformer, TransformContext};
use crate::types::{Diagnostic, Diagnostics};

/// What a consumer vertex asks the resolver for.
#[derive(Debug, Clone)]
pub enum ProviderRequest {
    /// Resource-instance key → alias of a provider declared in the same
    /// module. Subject to the inheritance walk.
    Local(HashMap<addrs::InstanceKey, Option<String>>),
    /// Already-resolved references, sourced from prior state. No inheritance
    /// is attempted.
    Exact(Vec<ExactProviderEntry>),
}

/// One pre-resolved provider reference.
#[derive(Debug, Clone)]
pub struct ExactProviderEntry {
    pub instance: addrs::AbsResourceInstance,
    pub provider: addrs::AbsProviderConfig,
    pub optional: bool,
    /// Populated for an optional entry whose configuration was absent;
    /// surfaced only if the orphan is actually walked.
    pub deferred_error: Option<Diagnostic>,
}

/// One step of a module-path pattern. The key constrains matching only when
/// the proxy expansion fixed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStepPattern {
    pub name: String,
    pub key: Option<addrs::InstanceKey>,
}

/// A concrete provider a consumer may resolve to, qualified by the module
/// instance path pattern it serves. A `None` identifier is a wildcard.
#[derive(Debug, Clone)]
pub struct ModuleInstancePotentialProvider {
    pub module_identifier: Option<Vec<ModuleStepPattern>>,
    pub provider: addrs::AbsProviderConfig,
}

impl ModuleInstancePotentialProvider {
    /// Whether this candidate serves an instance in the given module path.
    /// Steps compare by name always, and by instance key only where the
    /// candidate fixed one.
    pub fn matches(&self, module: &addrs::ModuleInstance) -> bool {
        let Some(pattern) = &self.module_identifier else {
            return true;
        };
        if pattern.len() != module.0.len() {
            return false;
        }
        pattern.iter().zip(module.0.iter()).all(|(p, step)| {
            p.name == step.name && p.key.as_ref().map(|k| k == &step.key).unwrap_or(true)
        })
    }
}

/// The per-consumer resolution table: plain data, stored on the vertex
/// during transformation and queried as a pure function during the walk.
#[derive(Debug, Clone, Default)]
pub struct ResourceInstanceProviderResolver {
    pub absolute: Vec<ExactProviderEntry>,
    pub by_key: HashMap<addrs::InstanceKey, Vec<ModuleInstancePotentialProvider>>,
}

impl ResourceInstanceProviderResolver {
    /// Which provider configuration serves one concrete resource instance.
    pub fn resolve(
        &self,
        instance: &addrs::AbsResourceInstance,
    ) -> Result<addrs::AbsProviderConfig, Diagnostic> {
        for entry in &self.absolute {
            if !entry.optional && entry.instance == *instance {
                return Ok(entry.provider.clone());
            }
        }

        let candidates = self
            .by_key
            .get(&instance.key)
            .or_else(|| self.by_key.get(&addrs::InstanceKey::None));
        if let Some(candidates) = candidates {
            for candidate in candidates {
                if candidate.matches(&instance.module) {
                    return Ok(candidate.provider.clone());
                }
            }
        }

        for entry in &self.absolute {
            if entry.optional && entry.instance == *instance {
                if let Some(deferred) = &entry.deferred_error {
                    return Err(deferred.clone());
                }
                return Ok(entry.provider.clone());
            }
        }

        Err(Diagnostic::error(
            "Provider resolution failed",
            format!(
                "No provider configuration matched resource instance {}: \
                 {} exact entries and {} keyed candidate sets were considered. \
                 This is a bug in the engine, not in the configuration.",
                instance,
                self.absolute.len(),
                self.by_key.len(),
            ),
        )
        .with_address(instance.to_string()))
    }
}

/// Recursively expands a proxy vertex into the concrete providers behind it.
/// Each recursion level appends the proxy's own module step to the pattern
/// carried in the result; concrete leaves reached directly get their
/// ancestors as unconstrained steps.
pub(crate) fn expand_proxy(
    graph: &Graph,
    proxy_id: NodeId,
    diags: &mut Diagnostics,
) -> Vec<ModuleInstancePotentialProvider> {
    let Some(Node::ProxyProvider(proxy)) = graph.node(proxy_id) else {
        return Vec::new();
    };

    let own_name = proxy
        .addr
        .module
        .last()
        .unwrap_or_default()
        .to_string();
    let parent_prefix: Vec<ModuleStepPattern> = proxy.addr.module.0
        [..proxy.addr.module.0.len().saturating_sub(1)]
        .iter()
        .map(|name| ModuleStepPattern {
            name: name.clone(),
            key: None,
        })
        .collect();

    let mut out = Vec::new();
    for (key, target_id) in &proxy.targets {
        let step = ModuleStepPattern {
            name: own_name.clone(),
            key: match key {
                addrs::InstanceKey::None => None,
                fixed => Some(fixed.clone()),
            },
        };

        match graph.node(*target_id) {
            Some(Node::ProxyProvider(_)) => {
                for sub in expand_proxy(graph, *target_id, diags) {
                    let mut identifier = sub.module_identifier.clone().unwrap_or_default();
                    identifier.push(step.clone());
                    out.push(ModuleInstancePotentialProvider {
                        module_identifier: Some(identifier),
                        provider: sub.provider,
                    });
                }
            }
            Some(Node::ProviderConfig(concrete)) => {
                let mut identifier = parent_prefix.clone();
                identifier.push(step.clone());
                out.push(ModuleInstancePotentialProvider {
                    module_identifier: Some(identifier),
                    provider: concrete.addr.clone(),
                });
            }
            _ => {
                diags.push(Diagnostic::error(
                    "Invalid proxy provider target",
                    format!(
                        "Proxy provider {} targets a vertex that is not a provider. \
                         This is a bug in the engine.",
                        proxy.addr
                    ),
                ));
            }
        }
    }
    out
}

/// The resolution pass: computes and stores a resolver on every consumer
/// vertex and connects it to each concrete provider discovered.
pub struct ProviderResolutionTransformer;

impl GraphTransformer for ProviderResolutionTransformer {
    fn name(&self) -> &'static str {
        "ProviderResolution"
    }

    fn transform(&self, _ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        let mut diags = Diagnostics::new();

        for id in graph.node_ids() {
            let (request, fqn, module, display) = match graph.node(id) {
                Some(Node::Resource(n)) => {
                    if n.resolver.is_some() {
                        continue;
                    }
                    let mut by_key = HashMap::new();
                    by_key.insert(addrs::InstanceKey::None, n.config.provider_alias());
                    (
                        ProviderRequest::Local(by_key),
                        n.provider_fqn.clone(),
                        n.addr.module.clone(),
                        n.addr.to_string(),
                    )
                }
                Some(Node::OrphanResource(n)) => {
                    if n.resolver.is_some() {
                        continue;
                    }
                    let entry = ExactProviderEntry {
                        instance: n.addr.clone(),
                        provider: n.provider_config.clone(),
                        optional: false,
                        deferred_error: None,
                    };
                    (
                        ProviderRequest::Exact(vec![entry]),
                        n.provider_config.provider.clone(),
                        n.addr.module.module_path(),
                        n.addr.to_string(),
                    )
                }
                _ => continue,
            };

            let mut resolver = ResourceInstanceProviderResolver::default();

            match request {
                ProviderRequest::Exact(entries) => {
                    for mut entry in entries {
                        match graph.find_provider(&entry.provider) {
                            Some(pid) if graph.node(pid).map(Node::is_proxy_provider) == Some(true) => {
                                diags.push(Diagnostic::error(
                                    "Exact provider reference resolved to a proxy",
                                    format!(
                                        "The stored provider configuration {} for {} resolved to \
                                         a proxy vertex; exact entries must be concrete. This is \
                                         a bug in the engine.",
                                        entry.provider, display
                                    ),
                                ));
                            }
                            Some(pid) => {
                                graph.connect(pid, id);
                            }
                            None if entry.optional => {
                                entry.deferred_error = Some(
                                    Diagnostic::error(
                                        "Provider configuration not present",
                                        format!(
                                            "The provider configuration {} recorded in state for \
                                             {} is no longer present in the configuration.",
                                            entry.provider, display
                                        ),
                                    )
                                    .with_address(display.clone()),
                                );
                            }
                            None => {
                                diags.push(
                                    Diagnostic::error(
                                        "Provider configuration not present",
                                        format!(
                                            "The provider configuration {} is required by {} but \
                                             is not present in the configuration.",
                                            entry.provider, display
                                        ),
                                    )
                                    .with_address(display.clone()),
                                );
                            }
                        }
                        resolver.absolute.push(entry);
                    }
                }
                ProviderRequest::Local(by_key) => {
                    for (key, alias) in by_key {
                        let mut addr =
                            addrs::AbsProviderConfig::new(fqn.clone(), module.clone(), alias);

                        // Inheritance walk: retry the parent's equivalent
                        // address until a match or the root.
                        let found = loop {
                            if let Some(pid) = graph.find_provider(&addr) {
                                break Some((pid, addr.clone()));
                            }
                            match addr.inherited_in_parent() {
                                Some(parent) => addr = parent,
                                None => break None,
                            }
                        };

                        let Some((pid, found_addr)) = found else {
                            diags.push(
                                Diagnostic::error(
                                    "Provider configuration not present",
                                    format!(
                                        "No configuration for provider {} is available to {}, \
                                         in its module or any ancestor.",
                                        fqn, display
                                    ),
                                )
                                .with_address(display.clone()),
                            );
                            continue;
                        };

                        let candidates = if graph
                            .node(pid)
                            .map(Node::is_proxy_provider)
                            .unwrap_or(false)
                        {
                            expand_proxy(graph, pid, &mut diags)
                        } else {
                            vec![ModuleInstancePotentialProvider {
                                module_identifier: None,
                                provider: found_addr,
                            }]
                        };

                        for candidate in &candidates {
                            if let Some(cid) = graph.find_provider(&candidate.provider) {
                                graph.connect(cid, id);
                            }
                        }
                        resolver.by_key.insert(key, candidates);
                    }
                }
            }

            match graph.node_mut(id) {
                Some(Node::Resource(n)) => n.resolver = Some(resolver),
                Some(Node::OrphanResource(n)) => n.resolver = Some(resolver),
                _ => {}
            }
        }

        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{
        AbsProviderConfig, AbsResourceInstance, InstanceKey, ModuleInstance, ModulePath, Provider,
        Resource,
    };

    fn aws_config(module: ModulePath, alias: Option<&str>) -> AbsProviderConfig {
        AbsProviderConfig::new(Provider::default("aws"), module, alias.map(String::from))
    }

    fn instance_in(module: ModuleInstance) -> AbsResourceInstance {
        AbsResourceInstance {
            module,
            resource: Resource::managed("aws_instance", "web"),
            key: InstanceKey::None,
        }
    }

    #[test]
    fn wildcard_candidate_matches_any_module() {
        let candidate = ModuleInstancePotentialProvider {
            module_identifier: None,
            provider: aws_config(ModulePath::root(), None),
        };
        assert!(candidate.matches(&ModuleInstance::root()));
        assert!(candidate.matches(&ModuleInstance::root().child("a", InstanceKey::Int(3))));
    }

    #[test]
    fn keyed_candidate_matches_only_fixed_key() {
        let candidate = ModuleInstancePotentialProvider {
            module_identifier: Some(vec![ModuleStepPattern {
                name: "child".to_string(),
                key: Some(InstanceKey::Str("eu".into())),
            }]),
            provider: aws_config(ModulePath::root(), Some("eu")),
        };

        let eu = ModuleInstance::root().child("child", InstanceKey::Str("eu".into()));
        let us = ModuleInstance::root().child("child", InstanceKey::Str("us".into()));
        assert!(candidate.matches(&eu));
        assert!(!candidate.matches(&us));
    }

    #[test]
    fn unfixed_key_matches_every_instance_of_the_module() {
        let candidate = ModuleInstancePotentialProvider {
            module_identifier: Some(vec![ModuleStepPattern {
                name: "child".to_string(),
                key: None,
            }]),
            provider: aws_config(ModulePath::root(), None),
        };

        assert!(candidate.matches(&ModuleInstance::root().child("child", InstanceKey::Int(0))));
        assert!(candidate.matches(&ModuleInstance::root().child("child", InstanceKey::None)));
        assert!(!candidate.matches(&ModuleInstance::root().child("other", InstanceKey::None)));
    }

    #[test]
    fn resolve_prefers_exact_entries() {
        let instance = instance_in(ModuleInstance::root());
        let resolver = ResourceInstanceProviderResolver {
            absolute: vec![ExactProviderEntry {
                instance: instance.clone(),
                provider: aws_config(ModulePath::root(), Some("stored")),
                optional: false,
                deferred_error: None,
            }],
            by_key: HashMap::from([(
                InstanceKey::None,
                vec![ModuleInstancePotentialProvider {
                    module_identifier: None,
                    provider: aws_config(ModulePath::root(), None),
                }],
            )]),
        };

        let resolved = resolver.resolve(&instance).unwrap();
        assert_eq!(resolved.alias.as_deref(), Some("stored"));
    }

    #[test]
    fn resolve_falls_back_to_none_key() {
        let resolver = ResourceInstanceProviderResolver {
            absolute: vec![],
            by_key: HashMap::from([(
                InstanceKey::None,
                vec![ModuleInstancePotentialProvider {
                    module_identifier: None,
                    provider: aws_config(ModulePath::root(), None),
                }],
            )]),
        };

        let mut instance = instance_in(ModuleInstance::root());
        instance.key = InstanceKey::Int(7);
        assert!(resolver.resolve(&instance).is_ok());
    }

    #[test]
    fn resolve_surfaces_deferred_error_for_walked_orphan() {
        let instance = instance_in(ModuleInstance::root());
        let resolver = ResourceInstanceProviderResolver {
            absolute: vec![ExactProviderEntry {
                instance: instance.clone(),
                provider: aws_config(ModulePath::root(), None),
                optional: true,
                deferred_error: Some(Diagnostic::error(
                    "Provider configuration not present",
                    "deferred",
                )),
            }],
            by_key: HashMap::new(),
        };

        let err = resolver.resolve(&instance).unwrap_err();
        assert_eq!(err.summary, "Provider configuration not present");
    }

    #[test]
    fn unmatched_instance_is_an_engine_error_not_a_panic() {
        let resolver = ResourceInstanceProviderResolver::default();
        let err = resolver
            .resolve(&instance_in(ModuleInstance::root()))
            .unwrap_err();
        assert!(err.detail.contains("bug in the engine"));
    }
}
