//! Typed dependency graph of walk vertices
//!
//! Vertices carry capability sets through accessor methods on the `Node`
//! enum rather than an inheritance hierarchy. Edges read `A → B` as "A must
//! complete before B". Storage is a stable-index digraph so transformers can
//! hold node ids across removals.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;

use crate::addrs;
use crate::config::ResourceConfig;
use crate::resolver::ResourceInstanceProviderResolver;
use crate::types::DynamicValue;

pub type NodeId = NodeIndex<u32>;

/// A provider configuration vertex, concrete.
#[derive(Debug, Clone)]
pub struct ProviderConfigNode {
    pub addr: addrs::AbsProviderConfig,
    /// Config block body; `None` for implicit defaults and empty blocks.
    pub config: Option<DynamicValue>,
    /// An empty block in a non-root module may be replaced by a proxy for a
    /// configuration passed from the parent.
    pub proxyable: bool,
}

/// A placeholder standing for provider configurations passed from a parent
/// module, keyed by instance key. Expanded and removed during resolution.
#[derive(Debug, Clone)]
pub struct ProxyProviderNode {
    pub addr: addrs::AbsProviderConfig,
    pub targets: Vec<(addrs::InstanceKey, NodeId)>,
}

/// A resource declaration from configuration. Instances are expanded during
/// the walk.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub addr: addrs::ConfigResource,
    pub config: ResourceConfig,
    pub provider_fqn: addrs::Provider,
    pub resolver: Option<ResourceInstanceProviderResolver>,
}

/// A resource instance present in state whose declaration is gone from
/// configuration.
#[derive(Debug, Clone)]
pub struct OrphanResourceNode {
    pub addr: addrs::AbsResourceInstance,
    /// Provider configuration recorded in state.
    pub provider_config: addrs::AbsProviderConfig,
    /// Stored dependency addresses, advisory for destroy ordering.
    pub dependencies: Vec<addrs::ConfigResource>,
    pub resolver: Option<ResourceInstanceProviderResolver>,
}

#[derive(Debug, Clone)]
pub struct CloseProviderNode {
    pub addr: addrs::AbsProviderConfig,
}

#[derive(Debug, Clone)]
pub struct CloseEphemeralNode {
    pub addr: addrs::ConfigResource,
}

/// One graph vertex. Capability accessors replace the interface probing the
/// transformers would otherwise do.
#[derive(Debug, Clone)]
pub enum Node {
    ProviderConfig(ProviderConfigNode),
    ProxyProvider(ProxyProviderNode),
    Resource(ResourceNode),
    OrphanResource(OrphanResourceNode),
    CloseProvider(CloseProviderNode),
    CloseEphemeral(CloseEphemeralNode),
}

impl Node {
    /// The provider configuration address this vertex configures, proxy or
    /// concrete.
    pub fn provided_provider(&self) -> Option<&addrs::AbsProviderConfig> {
        match self {
            Node::ProviderConfig(n) => Some(&n.addr),
            Node::ProxyProvider(n) => Some(&n.addr),
            _ => None,
        }
    }

    pub fn is_proxy_provider(&self) -> bool {
        matches!(self, Node::ProxyProvider(_))
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Node::ProviderConfig(_) | Node::ProxyProvider(_))
    }

    /// Address other vertices can reference this one by.
    pub fn referenceable_addr(&self) -> Option<addrs::ConfigResource> {
        match self {
            Node::Resource(n) => Some(n.addr.clone()),
            _ => None,
        }
    }

    /// Addresses this vertex declares references to.
    pub fn references(&self) -> Vec<addrs::ConfigResource> {
        match self {
            Node::Resource(n) => n
                .config
                .references
                .iter()
                .map(|r| addrs::ConfigResource {
                    module: n.addr.module.clone(),
                    resource: r.clone(),
                })
                .collect(),
            Node::OrphanResource(n) => n.dependencies.clone(),
            _ => Vec::new(),
        }
    }

    /// The static module path containing this vertex, if any.
    pub fn module_path(&self) -> Option<addrs::ModulePath> {
        match self {
            Node::ProviderConfig(n) => Some(n.addr.module.clone()),
            Node::ProxyProvider(n) => Some(n.addr.module.clone()),
            Node::Resource(n) => Some(n.addr.module.clone()),
            Node::OrphanResource(n) => Some(n.addr.module.module_path()),
            Node::CloseProvider(n) => Some(n.addr.module.clone()),
            Node::CloseEphemeral(n) => Some(n.addr.module.clone()),
        }
    }

    /// Whether the walk executor runs this vertex. Proxies never execute.
    pub fn is_executable(&self) -> bool {
        !self.is_proxy_provider()
    }

    /// Whether this vertex performs finalization and must run on every walk
    /// termination path.
    pub fn is_closer(&self) -> bool {
        matches!(self, Node::CloseProvider(_) | Node::CloseEphemeral(_))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::ProviderConfig(n) => write!(f, "{}", n.addr),
            Node::ProxyProvider(n) => write!(f, "{} (proxy)", n.addr),
            Node::Resource(n) => write!(f, "{}", n.addr),
            Node::OrphanResource(n) => write!(f, "{} (orphan)", n.addr),
            Node::CloseProvider(n) => write!(f, "{} (close)", n.addr),
            Node::CloseEphemeral(n) => write!(f, "{} (close)", n.addr),
        }
    }
}

/// The typed DAG the transformers build and the executor walks.
#[derive(Default)]
pub struct Graph {
    inner: StableDiGraph<Node, ()>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        self.inner.add_node(node)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.inner.remove_node(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.inner.node_weight(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.inner.node_weight_mut(id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.node_indices().collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Adds the edge "`before` must complete before `after`". Duplicate
    /// edges are not added.
    pub fn connect(&mut self, before: NodeId, after: NodeId) {
        if before == after {
            return;
        }
        if !self.has_edge(before, after) {
            self.inner.add_edge(before, after, ());
        }
    }

    /// Adds the edge only when `after` is not already ordered after
    /// `before` through some path. Passes that run again over a reduced
    /// graph use this so they do not resurrect removed edges.
    pub fn connect_ordered(&mut self, before: NodeId, after: NodeId) {
        if before == after {
            return;
        }
        if self.descendants(before).contains(&after) {
            return;
        }
        self.inner.add_edge(before, after, ());
    }

    pub fn has_edge(&self, before: NodeId, after: NodeId) -> bool {
        self.inner.find_edge(before, after).is_some()
    }

    /// Vertices that must complete before `id`.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .neighbors_directed(id, Direction::Incoming)
            .collect()
    }

    /// Vertices that wait for `id`.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .neighbors_directed(id, Direction::Outgoing)
            .collect()
    }

    /// Every vertex reachable from `id`, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = self.successors(id);
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.successors(next));
            }
        }
        seen
    }

    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.inner)
    }

    /// Removes every edge implied by a longer path, leaving ordering intact.
    pub fn transitive_reduce(&mut self) {
        let edges: Vec<(NodeId, NodeId)> = self
            .inner
            .edge_references()
            .map(|e| (e.source(), e.target()))
            .collect();

        for (a, b) in edges {
            let reachable_indirectly = self
                .successors(a)
                .into_iter()
                .filter(|&c| c != b)
                .any(|c| self.descendants(c).contains(&b));
            if reachable_indirectly {
                if let Some(edge) = self.inner.find_edge(a, b) {
                    self.inner.remove_edge(edge);
                }
            }
        }
    }

    /// Current provider vertices (concrete and proxy) keyed by their
    /// configuration address.
    pub fn provider_map(&self) -> HashMap<String, NodeId> {
        let mut out = HashMap::new();
        for id in self.inner.node_indices() {
            if let Some(addr) = self.inner[id].provided_provider() {
                out.insert(addr.to_string(), id);
            }
        }
        out
    }

    pub fn find_provider(&self, addr: &addrs::AbsProviderConfig) -> Option<NodeId> {
        let wanted = addr.to_string();
        self.inner.node_indices().find(|&id| {
            self.inner[id]
                .provided_provider()
                .map(|a| a.to_string() == wanted)
                .unwrap_or(false)
        })
    }
}
