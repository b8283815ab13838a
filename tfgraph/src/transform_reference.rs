//! Reference edges
//!
//! Connects referencers to the vertices they refer to. References resolve
//! against unexpanded resource addresses, which keeps the pass uniform
//! across plan and apply graphs. Because vertices are per-declaration and
//! instances expand inside the vertex during the walk, references between
//! instances living in distinct instances of the same module never produce
//! cross-module-instance edges.

use std::collections::HashMap;

use crate::graph::{Graph, Node, NodeId};
use crate::transform::{GraphTransformer, TransformContext};
use crate::types::Diagnostics;

pub struct ReferenceTransformer;

impl GraphTransformer for ReferenceTransformer {
    fn name(&self) -> &'static str {
        "Reference"
    }

    fn transform(&self, _ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        let mut referenceable: HashMap<String, NodeId> = HashMap::new();
        let mut orphans_by_declaration: HashMap<String, Vec<NodeId>> = HashMap::new();

        for id in graph.node_ids() {
            match graph.node(id) {
                Some(node @ Node::Resource(_)) => {
                    if let Some(addr) = node.referenceable_addr() {
                        referenceable.insert(addr.to_string(), id);
                    }
                }
                Some(Node::OrphanResource(n)) => {
                    orphans_by_declaration
                        .entry(n.addr.abs_resource().config_resource().to_string())
                        .or_default()
                        .push(id);
                }
                _ => {}
            }
        }

        for id in graph.node_ids() {
            let Some(node) = graph.node(id) else { continue };
            let references = node.references();
            if references.is_empty() {
                continue;
            }
            let is_orphan = matches!(node, Node::OrphanResource(_));

            for referenced in references {
                let key = referenced.to_string();
                if is_orphan {
                    // A destroyed dependent goes before the objects it
                    // depended on; only orphan-to-orphan ordering is known
                    // from state alone.
                    if let Some(targets) = orphans_by_declaration.get(&key) {
                        for &target in targets {
                            graph.connect_ordered(id, target);
                        }
                    }
                } else if let Some(&target) = referenceable.get(&key) {
                    graph.connect_ordered(target, id);
                }
            }
        }
        Diagnostics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{
        AbsProviderConfig, AbsResourceInstance, ConfigResource, InstanceKey, ModuleInstance,
        ModulePath, Provider, Resource,
    };
    use crate::config::{Config, ConfigModule, ResourceConfig};
    use crate::state::{ResourceInstanceObject, State};
    use crate::types::DynamicValue;

    fn run(config: &Config, state: &State) -> Graph {
        let ctx = TransformContext { config, state };
        let mut graph = Graph::new();
        crate::transform::ConfigResourceTransformer.transform(&ctx, &mut graph);
        crate::transform::OrphanResourceTransformer.transform(&ctx, &mut graph);
        ReferenceTransformer.transform(&ctx, &mut graph);
        graph
    }

    #[test]
    fn referenced_resource_completes_before_referencer() {
        let mut root = ConfigModule::new(ModulePath::root());
        root.resources.push(ResourceConfig::new(
            Resource::managed("aws_vpc", "main"),
            DynamicValue::null(),
        ));
        root.resources.push(
            ResourceConfig::new(Resource::managed("aws_subnet", "a"), DynamicValue::null())
                .with_references(vec![Resource::managed("aws_vpc", "main")]),
        );
        let config = Config::new(root);
        let graph = run(&config, &State::new());

        let vpc = crate::transform::find_resource_node(
            &graph,
            &ConfigResource {
                module: ModulePath::root(),
                resource: Resource::managed("aws_vpc", "main"),
            },
        )
        .unwrap();
        let subnet = crate::transform::find_resource_node(
            &graph,
            &ConfigResource {
                module: ModulePath::root(),
                resource: Resource::managed("aws_subnet", "a"),
            },
        )
        .unwrap();

        assert!(graph.has_edge(vpc, subnet));
    }

    #[test]
    fn orphan_dependencies_order_destroys_among_orphans() {
        let provider =
            AbsProviderConfig::new(Provider::default("aws"), ModulePath::root(), None);
        let mut state = State::new();
        let vpc = AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_vpc", "main"),
            key: InstanceKey::None,
        };
        let subnet = AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_subnet", "a"),
            key: InstanceKey::None,
        };
        state.set_instance_current(
            &vpc,
            &provider,
            Some(ResourceInstanceObject::from_value(&DynamicValue::null(), 0).unwrap()),
        );
        state.set_instance_current(
            &subnet,
            &provider,
            Some(
                ResourceInstanceObject::from_value(&DynamicValue::null(), 0)
                    .unwrap()
                    .with_dependencies(vec![ConfigResource {
                        module: ModulePath::root(),
                        resource: Resource::managed("aws_vpc", "main"),
                    }]),
            ),
        );

        let config = Config::new(ConfigModule::new(ModulePath::root()));
        let graph = run(&config, &state);

        // The dependent subnet orphan must be walked before the vpc orphan.
        let mut subnet_id = None;
        let mut vpc_id = None;
        for id in graph.node_ids() {
            if let Some(Node::OrphanResource(n)) = graph.node(id) {
                if n.addr.resource.type_name == "aws_subnet" {
                    subnet_id = Some(id);
                } else {
                    vpc_id = Some(id);
                }
            }
        }
        assert!(graph.has_edge(subnet_id.unwrap(), vpc_id.unwrap()));
    }
}
