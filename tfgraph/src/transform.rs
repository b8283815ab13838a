//! Graph transformer pipeline
//!
//! Each pass mutates the graph and leaves it well-typed; the pipeline runs
//! them in a fixed order and stops at the first error. Passes are idempotent:
//! transforming an already-finalized graph changes nothing.

use crate::addrs;
use crate::config::Config;
use crate::graph::{Graph, Node, NodeId, OrphanResourceNode, ResourceNode};
use crate::state::State;
use crate::types::{Diagnostic, Diagnostics};

/// Inputs shared by every pass.
pub struct TransformContext<'a> {
    pub config: &'a Config,
    pub state: &'a State,
}

/// One graph-rewriting pass.
pub trait GraphTransformer {
    fn name(&self) -> &'static str;
    fn transform(&self, ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics;
}

/// The standard pass order. Seeding passes first, then provider placement,
/// resolution, references, finalization and pruning.
pub fn standard_pipeline() -> Vec<Box<dyn GraphTransformer>> {
    vec![
        Box::new(ConfigResourceTransformer),
        Box::new(OrphanResourceTransformer),
        Box::new(crate::transform_provider::ProviderConfigTransformer),
        Box::new(crate::transform_provider::MissingProviderTransformer),
        Box::new(crate::resolver::ProviderResolutionTransformer),
        Box::new(crate::transform_provider::ProviderFunctionsTransformer),
        Box::new(crate::transform_reference::ReferenceTransformer),
        Box::new(crate::transform_close::CloseableResourceTransformer),
        Box::new(crate::transform_close::CloseProviderTransformer),
        Box::new(PruneTransformer),
    ]
}

/// Runs the standard pipeline over an existing graph.
pub fn run_pipeline(ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for transformer in standard_pipeline() {
        tracing::debug!("running graph transformer {}", transformer.name());
        diags.append(transformer.transform(ctx, graph));
        if diags.has_errors() {
            return diags;
        }
    }
    if graph.is_cyclic() {
        diags.push(Diagnostic::error(
            "Dependency cycle in graph",
            "The finalized graph contains a dependency cycle; no valid execution order exists.",
        ));
    }
    diags
}

/// Builds the finalized walk graph for a config+state pair.
pub fn build_graph(config: &Config, state: &State) -> (Graph, Diagnostics) {
    let ctx = TransformContext { config, state };
    let mut graph = Graph::new();
    let diags = run_pipeline(&ctx, &mut graph);
    (graph, diags)
}

pub(crate) fn find_resource_node(graph: &Graph, addr: &addrs::ConfigResource) -> Option<NodeId> {
    let wanted = addr.to_string();
    graph.node_ids().into_iter().find(|&id| {
        matches!(graph.node(id), Some(Node::Resource(n)) if n.addr.to_string() == wanted)
    })
}

fn find_orphan_node(graph: &Graph, addr: &addrs::AbsResourceInstance) -> Option<NodeId> {
    let wanted = addr.to_string();
    graph.node_ids().into_iter().find(|&id| {
        matches!(graph.node(id), Some(Node::OrphanResource(n)) if n.addr.to_string() == wanted)
    })
}

/// Seeds one resource vertex per declaration in the configuration tree.
pub struct ConfigResourceTransformer;

impl GraphTransformer for ConfigResourceTransformer {
    fn name(&self) -> &'static str {
        "ConfigResource"
    }

    fn transform(&self, ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        let mut modules = Vec::new();
        ctx.config.walk_modules(&mut |m| modules.push(m));

        for module in modules {
            for resource in &module.resources {
                let addr = addrs::ConfigResource {
                    module: module.path.clone(),
                    resource: resource.resource.clone(),
                };
                if find_resource_node(graph, &addr).is_some() {
                    continue;
                }
                let provider_fqn = ctx
                    .config
                    .provider_fqn(module, &resource.provider_local_name());
                graph.add(Node::Resource(ResourceNode {
                    addr,
                    config: resource.clone(),
                    provider_fqn,
                    resolver: None,
                }));
            }
        }
        Diagnostics::new()
    }
}

/// Seeds one vertex per state instance whose declaration no longer exists in
/// configuration, whether because the resource block is gone or because the
/// whole module is.
pub struct OrphanResourceTransformer;

impl GraphTransformer for OrphanResourceTransformer {
    fn name(&self) -> &'static str {
        "OrphanResource"
    }

    fn transform(&self, ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        for module_state in ctx.state.modules() {
            let module_path = module_state.addr.module_path();
            let config_module = ctx.config.module(&module_path);

            for resource_state in module_state.resources.values() {
                let declared = config_module
                    .map(|m| m.resource(&resource_state.addr).is_some())
                    .unwrap_or(false);
                if declared {
                    // Instances beyond the declaration's current expansion
                    // are handled by the resource vertex itself.
                    continue;
                }

                for (key, instance) in &resource_state.instances {
                    if !instance.has_objects() {
                        continue;
                    }
                    let addr = addrs::AbsResourceInstance {
                        module: module_state.addr.clone(),
                        resource: resource_state.addr.clone(),
                        key: key.clone(),
                    };
                    if find_orphan_node(graph, &addr).is_some() {
                        continue;
                    }
                    let dependencies = instance
                        .current
                        .as_ref()
                        .map(|o| o.dependencies.clone())
                        .unwrap_or_default();
                    graph.add(Node::OrphanResource(OrphanResourceNode {
                        addr,
                        provider_config: resource_state.provider_config.clone(),
                        dependencies,
                        resolver: None,
                    }));
                }
            }
        }
        Diagnostics::new()
    }
}

/// Final pass: drops proxy vertices that survived resolution and provider
/// vertices nothing consumes (together with their close vertices).
pub struct PruneTransformer;

impl GraphTransformer for PruneTransformer {
    fn name(&self) -> &'static str {
        "Prune"
    }

    fn transform(&self, _ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        for id in graph.node_ids() {
            if graph
                .node(id)
                .map(Node::is_proxy_provider)
                .unwrap_or(false)
            {
                graph.remove(id);
            }
        }

        for id in graph.node_ids() {
            let Some(Node::ProviderConfig(provider)) = graph.node(id) else {
                continue;
            };
            let addr = provider.addr.clone();

            let mut close_node = None;
            let mut has_consumer = false;
            for succ in graph.successors(id) {
                match graph.node(succ) {
                    Some(Node::CloseProvider(c)) if c.addr == addr => close_node = Some(succ),
                    Some(_) => has_consumer = true,
                    None => {}
                }
            }

            if !has_consumer {
                tracing::debug!("pruning unused provider {}", addr);
                graph.remove(id);
                if let Some(close) = close_node {
                    graph.remove(close);
                }
            }
        }
        Diagnostics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, ModuleInstance, ModulePath, Provider, Resource};
    use crate::config::{ConfigModule, ResourceConfig};
    use crate::state::{ResourceInstanceObject, State};
    use crate::types::{Dynamic, DynamicValue};

    fn config_with_root_resource() -> Config {
        let mut root = ConfigModule::new(ModulePath::root());
        root.resources.push(ResourceConfig::new(
            Resource::managed("aws_instance", "web"),
            DynamicValue::object([("ami".to_string(), Dynamic::String("ami-1".into()))]),
        ));
        Config::new(root)
    }

    fn state_with_orphan() -> State {
        let mut state = State::new();
        let addr = addrs::AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_instance", "gone"),
            key: InstanceKey::None,
        };
        let value = DynamicValue::object([("id".to_string(), Dynamic::String("i-9".into()))]);
        state.set_instance_current(
            &addr,
            &addrs::AbsProviderConfig::new(Provider::default("aws"), ModulePath::root(), None),
            Some(ResourceInstanceObject::from_value(&value, 0).unwrap()),
        );
        state
    }

    #[test]
    fn config_resources_become_vertices() {
        let config = config_with_root_resource();
        let state = State::new();
        let ctx = TransformContext {
            config: &config,
            state: &state,
        };
        let mut graph = Graph::new();
        let diags = ConfigResourceTransformer.transform(&ctx, &mut graph);

        assert!(!diags.has_errors());
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn state_only_resources_become_orphan_vertices() {
        let config = config_with_root_resource();
        let state = state_with_orphan();
        let ctx = TransformContext {
            config: &config,
            state: &state,
        };
        let mut graph = Graph::new();
        ConfigResourceTransformer.transform(&ctx, &mut graph);
        OrphanResourceTransformer.transform(&ctx, &mut graph);

        let orphans: Vec<_> = graph
            .node_ids()
            .into_iter()
            .filter(|&id| matches!(graph.node(id), Some(Node::OrphanResource(_))))
            .collect();
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn declared_resources_do_not_become_orphans() {
        let config = config_with_root_resource();
        let mut state = State::new();
        let addr = addrs::AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_instance", "web"),
            key: InstanceKey::None,
        };
        let value = DynamicValue::object([("id".to_string(), Dynamic::String("i-1".into()))]);
        state.set_instance_current(
            &addr,
            &addrs::AbsProviderConfig::new(Provider::default("aws"), ModulePath::root(), None),
            Some(ResourceInstanceObject::from_value(&value, 0).unwrap()),
        );
        let ctx = TransformContext {
            config: &config,
            state: &state,
        };
        let mut graph = Graph::new();
        ConfigResourceTransformer.transform(&ctx, &mut graph);
        OrphanResourceTransformer.transform(&ctx, &mut graph);

        assert!(graph
            .node_ids()
            .into_iter()
            .all(|id| !matches!(graph.node(id), Some(Node::OrphanResource(_)))));
    }

    #[test]
    fn full_pipeline_is_idempotent() {
        let config = config_with_root_resource();
        let state = state_with_orphan();
        let (mut graph, diags) = build_graph(&config, &state);
        assert!(!diags.has_errors(), "{:?}", diags);

        let nodes_before = graph.node_count();
        let edges_before = graph.edge_count();

        let ctx = TransformContext {
            config: &config,
            state: &state,
        };
        let diags = run_pipeline(&ctx, &mut graph);
        assert!(!diags.has_errors());
        assert_eq!(graph.node_count(), nodes_before);
        assert_eq!(graph.edge_count(), edges_before);
    }

    #[test]
    fn finalized_graph_is_acyclic_with_no_proxies() {
        let config = config_with_root_resource();
        let state = state_with_orphan();
        let (graph, diags) = build_graph(&config, &state);
        assert!(!diags.has_errors());
        assert!(!graph.is_cyclic());
        assert!(graph
            .node_ids()
            .into_iter()
            .all(|id| !graph.node(id).unwrap().is_proxy_provider()));
    }
}
