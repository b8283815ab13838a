//! Provider placement passes
//!
//! `ProviderConfig` turns declared provider blocks into vertices and
//! synthesizes proxies where a module call passes configurations down.
//! `MissingProvider` adds implicit root-module defaults so inheritance is a
//! last-resort fallback rather than a same-module winner. `ProviderFunctions`
//! connects resources to the providers whose functions they call.

use crate::addrs;
use crate::config::{Config, ConfigModule};
use crate::graph::{Graph, Node, ProviderConfigNode, ProxyProviderNode};
use crate::resolver::expand_proxy;
use crate::transform::{GraphTransformer, TransformContext};
use crate::types::{Diagnostic, Diagnostics};

/// Creates provider vertices from configuration, plus proxies for passed
/// configurations in child modules.
pub struct ProviderConfigTransformer;

impl ProviderConfigTransformer {
    fn visit(
        &self,
        config: &Config,
        module: &ConfigModule,
        graph: &mut Graph,
        diags: &mut Diagnostics,
    ) {
        for block in &module.provider_configs {
            let fqn = config.provider_fqn(module, &block.local_name);
            let addr =
                addrs::AbsProviderConfig::new(fqn, module.path.clone(), block.alias.clone());
            if graph.find_provider(&addr).is_some() {
                continue;
            }
            graph.add(Node::ProviderConfig(ProviderConfigNode {
                addr,
                config: if block.is_empty {
                    None
                } else {
                    Some(block.config.clone())
                },
                proxyable: block.is_empty && !module.path.is_root(),
            }));
        }

        // Root required_providers entries get a vertex even without a block.
        if module.path.is_root() {
            for fqn in module.required_providers.values() {
                let addr =
                    addrs::AbsProviderConfig::new(fqn.clone(), addrs::ModulePath::root(), None);
                if graph.find_provider(&addr).is_none() {
                    graph.add(Node::ProviderConfig(ProviderConfigNode {
                        addr,
                        config: None,
                        proxyable: false,
                    }));
                }
            }
        }

        for call in &module.module_calls {
            let Some(child) = module.children.get(&call.name) else {
                diags.push(Diagnostic::error(
                    "Module call without module",
                    format!(
                        "Module call {:?} in {} has no corresponding child module.",
                        call.name,
                        if module.path.is_root() {
                            "the root module".to_string()
                        } else {
                            module.path.to_string()
                        },
                    ),
                ));
                continue;
            };

            for passed in &call.passed_providers {
                let child_fqn = config.provider_fqn(child, &passed.child_name);
                let proxy_addr = addrs::AbsProviderConfig::new(
                    child_fqn,
                    child.path.clone(),
                    passed.child_alias.clone(),
                );

                let mut targets = Vec::new();
                for mapping in &passed.mappings {
                    let parent_fqn = config.provider_fqn(module, &passed.parent_name);
                    let mut parent_addr = addrs::AbsProviderConfig::new(
                        parent_fqn,
                        module.path.clone(),
                        mapping.parent_alias.clone(),
                    );
                    // The calling module may itself inherit the passed
                    // configuration from above.
                    let found = loop {
                        if let Some(pid) = graph.find_provider(&parent_addr) {
                            break Some(pid);
                        }
                        match parent_addr.inherited_in_parent() {
                            Some(parent) => parent_addr = parent,
                            None => break None,
                        }
                    };
                    match found {
                        Some(pid) => targets.push((mapping.key.clone(), pid)),
                        None => diags.push(
                            Diagnostic::error(
                                "Provider configuration not present",
                                format!(
                                    "Module call {:?} passes provider configuration {}, which \
                                     is not configured in the calling module or any ancestor.",
                                    call.name, parent_addr
                                ),
                            )
                            .with_address(proxy_addr.to_string()),
                        ),
                    }
                }

                match graph.find_provider(&proxy_addr) {
                    Some(existing) => {
                        let replaces = matches!(
                            graph.node(existing),
                            Some(Node::ProviderConfig(n)) if n.proxyable
                        );
                        let concrete =
                            matches!(graph.node(existing), Some(Node::ProviderConfig(_)));
                        if replaces {
                            // The child's empty block stands in for the
                            // passed configuration: the proxy replaces it.
                            graph.remove(existing);
                            graph.add(Node::ProxyProvider(ProxyProviderNode {
                                addr: proxy_addr,
                                targets,
                            }));
                        } else if concrete {
                            tracing::debug!(
                                "child module declares its own configuration at {}, ignoring \
                                 passed provider",
                                proxy_addr
                            );
                        }
                    }
                    None => {
                        graph.add(Node::ProxyProvider(ProxyProviderNode {
                            addr: proxy_addr,
                            targets,
                        }));
                    }
                }
            }

            // Empty blocks in the child that no explicit passing covered
            // proxy the parent's equivalent configuration implicitly.
            for block in &child.provider_configs {
                if !block.is_empty {
                    continue;
                }
                let covered = call.passed_providers.iter().any(|p| {
                    p.child_name == block.local_name && p.child_alias == block.alias
                });
                if covered {
                    continue;
                }

                let fqn = config.provider_fqn(child, &block.local_name);
                let proxy_addr = addrs::AbsProviderConfig::new(
                    fqn.clone(),
                    child.path.clone(),
                    block.alias.clone(),
                );
                let mut target_addr = addrs::AbsProviderConfig::new(
                    fqn,
                    module.path.clone(),
                    block.alias.clone(),
                );
                let target = loop {
                    if let Some(pid) = graph.find_provider(&target_addr) {
                        break Some(pid);
                    }
                    match target_addr.inherited_in_parent() {
                        Some(parent) => target_addr = parent,
                        None => break None,
                    }
                };
                // Without an inherited target the empty block stays a
                // concrete unconfigured vertex.
                let Some(target) = target else { continue };

                match graph.find_provider(&proxy_addr) {
                    Some(existing) => {
                        let replaces = matches!(
                            graph.node(existing),
                            Some(Node::ProviderConfig(n)) if n.proxyable
                        );
                        if replaces {
                            graph.remove(existing);
                            graph.add(Node::ProxyProvider(ProxyProviderNode {
                                addr: proxy_addr,
                                targets: vec![(addrs::InstanceKey::None, target)],
                            }));
                        }
                    }
                    // The child module has not been visited yet; the proxy
                    // claims the address first and the child's empty block
                    // is skipped when it comes up.
                    None => {
                        graph.add(Node::ProxyProvider(ProxyProviderNode {
                            addr: proxy_addr,
                            targets: vec![(addrs::InstanceKey::None, target)],
                        }));
                    }
                }
            }
        }

        for child in module.children.values() {
            self.visit(config, child, graph, diags);
        }
    }
}

impl GraphTransformer for ProviderConfigTransformer {
    fn name(&self) -> &'static str {
        "ProviderConfig"
    }

    fn transform(&self, ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        let mut diags = Diagnostics::new();
        self.visit(ctx.config, &ctx.config.root, graph, &mut diags);
        diags
    }
}

/// Adds an implicit default provider vertex in the root module for every
/// resource whose required FQN has no explicit root configuration.
pub struct MissingProviderTransformer;

impl GraphTransformer for MissingProviderTransformer {
    fn name(&self) -> &'static str {
        "MissingProvider"
    }

    fn transform(&self, _ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        for id in graph.node_ids() {
            let fqn = match graph.node(id) {
                Some(Node::Resource(n)) => n.provider_fqn.clone(),
                Some(Node::OrphanResource(n)) => n.provider_config.provider.clone(),
                _ => continue,
            };
            let root_default =
                addrs::AbsProviderConfig::new(fqn, addrs::ModulePath::root(), None);
            if graph.find_provider(&root_default).is_none() {
                tracing::debug!("adding implicit default provider {}", root_default);
                graph.add(Node::ProviderConfig(ProviderConfigNode {
                    addr: root_default,
                    config: None,
                    proxyable: false,
                }));
            }
        }
        Diagnostics::new()
    }
}

/// Connects resources to the providers whose functions their expressions
/// call, so function-serving providers configure before evaluation needs
/// them.
pub struct ProviderFunctionsTransformer;

impl GraphTransformer for ProviderFunctionsTransformer {
    fn name(&self) -> &'static str {
        "ProviderFunctions"
    }

    fn transform(&self, ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        let mut diags = Diagnostics::new();

        for id in graph.node_ids() {
            let Some(Node::Resource(resource)) = graph.node(id) else {
                continue;
            };
            if resource.config.provider_function_refs.is_empty() {
                continue;
            }
            let module_path = resource.addr.module.clone();
            let refs = resource.config.provider_function_refs.clone();
            let resource_display = resource.addr.to_string();

            let Some(module) = ctx.config.module(&module_path) else {
                continue;
            };

            for local_name in refs {
                let fqn = ctx.config.provider_fqn(module, &local_name);
                let mut addr =
                    addrs::AbsProviderConfig::new(fqn.clone(), module_path.clone(), None);

                let found = loop {
                    if let Some(pid) = graph.find_provider(&addr) {
                        break Some(pid);
                    }
                    match addr.inherited_in_parent() {
                        Some(parent) => addr = parent,
                        None => break None,
                    }
                };

                match found {
                    Some(pid)
                        if graph
                            .node(pid)
                            .map(Node::is_proxy_provider)
                            .unwrap_or(false) =>
                    {
                        for candidate in expand_proxy(graph, pid, &mut diags) {
                            if let Some(cid) = graph.find_provider(&candidate.provider) {
                                graph.connect_ordered(cid, id);
                            }
                        }
                    }
                    Some(pid) => graph.connect_ordered(pid, id),
                    None => {
                        // Function references fall back to an implicit root
                        // default, the same placement MissingProvider uses.
                        let root_default = addrs::AbsProviderConfig::new(
                            fqn,
                            addrs::ModulePath::root(),
                            None,
                        );
                        tracing::debug!(
                            "adding implicit provider {} for functions used by {}",
                            root_default,
                            resource_display
                        );
                        let pid = graph.add(Node::ProviderConfig(ProviderConfigNode {
                            addr: root_default,
                            config: None,
                            proxyable: false,
                        }));
                        graph.connect(pid, id);
                    }
                }
            }
        }
        diags
    }
}
