//! Finalization passes
//!
//! Ephemeral resources and providers acquire things that must be released on
//! every walk termination path. Close vertices fan in from everything that
//! uses the closed object, so release happens no earlier than the last use.

use crate::addrs::ResourceMode;
use crate::graph::{CloseEphemeralNode, CloseProviderNode, Graph, Node};
use crate::transform::{GraphTransformer, TransformContext};
use crate::types::Diagnostics;

/// Adds a close vertex per ephemeral resource, depending on the resource,
/// the providers behind it, and every referencer. Instances of one
/// declaration share the vertex, so their close callbacks are merged.
pub struct CloseableResourceTransformer;

impl GraphTransformer for CloseableResourceTransformer {
    fn name(&self) -> &'static str {
        "CloseableResource"
    }

    fn transform(&self, _ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        for id in graph.node_ids() {
            let Some(Node::Resource(resource)) = graph.node(id) else {
                continue;
            };
            if resource.addr.resource.mode != ResourceMode::Ephemeral {
                continue;
            }
            let addr = resource.addr.clone();

            let already_closed = graph.node_ids().into_iter().any(|cid| {
                matches!(graph.node(cid), Some(Node::CloseEphemeral(c)) if c.addr == addr)
            });
            if already_closed {
                continue;
            }

            let providers: Vec<_> = graph
                .predecessors(id)
                .into_iter()
                .filter(|&p| graph.node(p).map(Node::is_provider).unwrap_or(false))
                .collect();
            let referencers: Vec<_> = graph
                .successors(id)
                .into_iter()
                .filter(|&s| {
                    matches!(
                        graph.node(s),
                        Some(Node::Resource(_) | Node::OrphanResource(_))
                    )
                })
                .collect();

            let close = graph.add(Node::CloseEphemeral(CloseEphemeralNode { addr }));
            graph.connect(id, close);
            for provider in providers {
                graph.connect(provider, close);
            }
            for referencer in referencers {
                graph.connect(referencer, close);
            }
        }
        Diagnostics::new()
    }
}

/// Adds a close vertex per provider, depending on the provider and every
/// consumer of it, direct or through references. Transitive reduction then
/// drops the redundant edges.
pub struct CloseProviderTransformer;

impl GraphTransformer for CloseProviderTransformer {
    fn name(&self) -> &'static str {
        "CloseProvider"
    }

    fn transform(&self, _ctx: &TransformContext<'_>, graph: &mut Graph) -> Diagnostics {
        let mut added = false;
        for id in graph.node_ids() {
            let Some(Node::ProviderConfig(provider)) = graph.node(id) else {
                continue;
            };
            let addr = provider.addr.clone();

            let already_closed = graph.node_ids().into_iter().any(|cid| {
                matches!(graph.node(cid), Some(Node::CloseProvider(c)) if c.addr == addr)
            });
            if already_closed {
                continue;
            }

            let descendants = graph.descendants(id);
            let close = graph.add(Node::CloseProvider(CloseProviderNode { addr }));
            graph.connect(id, close);
            for descendant in descendants {
                graph.connect(descendant, close);
            }
            added = true;
        }

        if added {
            graph.transitive_reduce();
        }
        Diagnostics::new()
    }
}
