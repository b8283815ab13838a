//! Walk executor and library entry points
//!
//! Runs every executable vertex of a finalized graph in dependency order
//! with bounded concurrency. A vertex failing suppresses its descendants
//! (close vertices excepted, which run on every termination path), while
//! independent sibling subgraphs continue. `plan` and `apply` assemble the
//! full pipeline: schema preload, graph build, expansion registration, walk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;

use crate::addrs;
use crate::config::{Config, ConfigModule};
use crate::context::Context;
use crate::eval::{EvaluationContext, InstanceExpander, StaticEvaluationContext};
use crate::graph::{Graph, Node, NodeId};
use crate::hook::{Hook, HookMux};
use crate::plan::{Changes, Plan, ResourceInstanceChange};
use crate::planner::PlanMode;
use crate::provider::{ProviderFactories, ProviderRegistry};
use crate::schema_cache::SchemaCache;
use crate::state::{ResourceInstanceObject, State, SyncState};
use crate::transform::build_graph;
use crate::types::{Diagnostic, Diagnostics};

pub const DEFAULT_CONCURRENCY: usize = 10;

/// What a walk does at each vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOperation {
    Validate,
    Plan,
    PlanDestroy,
    Apply,
    Destroy,
    Refresh,
    Import,
}

impl WalkOperation {
    pub fn plan_mode(&self) -> PlanMode {
        match self {
            WalkOperation::PlanDestroy | WalkOperation::Destroy => PlanMode::Destroy,
            _ => PlanMode::Normal,
        }
    }

    pub fn is_apply(&self) -> bool {
        matches!(self, WalkOperation::Apply | WalkOperation::Destroy)
    }
}

/// One resource instance to import, with its provider-side id.
#[derive(Debug, Clone)]
pub struct ImportTarget {
    pub addr: addrs::AbsResourceInstance,
    pub id: String,
}

/// An ephemeral instance opened during the walk, awaiting its close vertex.
pub struct OpenEphemeralInstance {
    pub addr: addrs::AbsResourceInstance,
    pub provider: addrs::AbsProviderConfig,
    pub private: Vec<u8>,
}

/// Open ephemeral instances, keyed by declaration. Close vertices drain one
/// declaration's instances together, which is what merges their close
/// callbacks.
#[derive(Default)]
pub struct EphemeralRegistry {
    inner: Mutex<HashMap<String, Vec<OpenEphemeralInstance>>>,
}

impl EphemeralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, declaration: &addrs::ConfigResource, open: OpenEphemeralInstance) {
        self.inner
            .lock()
            .expect("ephemeral registry lock poisoned")
            .entry(declaration.to_string())
            .or_default()
            .push(open);
    }

    pub fn drain(&self, declaration: &addrs::ConfigResource) -> Vec<OpenEphemeralInstance> {
        self.inner
            .lock()
            .expect("ephemeral registry lock poisoned")
            .remove(&declaration.to_string())
            .unwrap_or_default()
    }
}

/// Everything a vertex needs at execute time, threaded explicitly instead of
/// ambient globals.
#[derive(Clone)]
pub struct WalkContext {
    pub operation: WalkOperation,
    pub plan_mode: PlanMode,
    pub context: Context,
    pub config: Arc<Config>,
    pub eval: Arc<dyn EvaluationContext>,
    pub expander: Arc<InstanceExpander>,
    pub state: SyncState,
    pub hooks: Arc<HookMux>,
    pub providers: Arc<ProviderRegistry>,
    pub changes: Arc<Changes>,
    pub schemas: Arc<SchemaCache>,
    pub ephemerals: Arc<EphemeralRegistry>,
    pub imports: Arc<Vec<ImportTarget>>,
    stopping: Arc<AtomicBool>,
}

impl WalkContext {
    /// Signals a user-initiated stop: the `Stopping` hook fires exactly
    /// once, then the cancellation token flips. In-flight vertices return at
    /// their next checkpoint; nothing new is dispatched except closers.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.hooks.stopping().await {
            tracing::warn!("stopping hook failed: {}", err);
        }
        self.context.cancel();
    }
}

/// Executes every vertex in an order consistent with the graph's edges.
pub async fn walk(graph: &Graph, ctx: &WalkContext, concurrency: usize) -> Diagnostics {
    let concurrency = concurrency.max(1);
    let mut indegree: HashMap<NodeId, usize> = graph
        .node_ids()
        .into_iter()
        .map(|id| (id, graph.predecessors(id).len()))
        .collect();
    let mut ready: VecDeque<NodeId> = indegree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut skipped: HashSet<NodeId> = HashSet::new();
    let mut diags = Diagnostics::new();
    let mut tasks: JoinSet<(NodeId, Diagnostics)> = JoinSet::new();
    let mut in_flight = 0usize;

    loop {
        while in_flight < concurrency {
            let Some(id) = ready.pop_front() else { break };
            let Some(node) = graph.node(id).cloned() else {
                continue;
            };
            let suppressed = skipped.contains(&id)
                || !node.is_executable()
                || (ctx.context.is_cancelled() && !node.is_closer());

            if suppressed {
                // Counts as completed so successors unblock, but produces
                // no diagnostics and runs nothing.
                tasks.spawn(async move { (id, Diagnostics::new()) });
            } else {
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    tracing::debug!("executing {}", node);
                    let node_diags = crate::exec::execute_node(node, ctx).await;
                    (id, node_diags)
                });
            }
            in_flight += 1;
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        in_flight -= 1;
        let (id, node_diags) = joined.expect("walk task panicked");
        let failed = node_diags.has_errors();
        diags.append(node_diags);

        if failed && ctx.operation != WalkOperation::Validate {
            // Descendants are skipped without generating diagnostics of
            // their own; closers still run so acquired resources release.
            for descendant in graph.descendants(id) {
                let closer = graph
                    .node(descendant)
                    .map(Node::is_closer)
                    .unwrap_or(false);
                if !closer {
                    skipped.insert(descendant);
                }
            }
        }

        for successor in graph.successors(id) {
            if let Some(count) = indegree.get_mut(&successor) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(successor);
                }
            }
        }
    }
    diags
}

/// Walks the config tree and records every module and resource expansion,
/// as the single writer the expander expects.
fn register_expansions(
    config: &Config,
    eval: &dyn EvaluationContext,
    expander: &InstanceExpander,
) {
    fn visit(
        module: &ConfigModule,
        instances: &[addrs::ModuleInstance],
        eval: &dyn EvaluationContext,
        expander: &InstanceExpander,
    ) {
        for instance in instances {
            for resource in &module.resources {
                let abs = addrs::AbsResource {
                    module: instance.clone(),
                    resource: resource.resource.clone(),
                };
                expander.register_resource(&abs, eval.expand_resource(instance, &resource.resource));
            }
        }

        for (name, child) in &module.children {
            let mut child_instances = Vec::new();
            for instance in instances {
                let keys = eval.expand_module_call(instance, name);
                expander.register_module_call(instance, name, keys.clone());
                for key in keys {
                    child_instances.push(instance.child(name.clone(), key));
                }
            }
            visit(child, &child_instances, eval, expander);
        }
    }
    visit(&config.root, &[addrs::ModuleInstance::root()], eval, expander);
}

/// Projects the expected post-apply state from a change set, best-effort.
fn project_planned_state(prior: &State, changes: &[ResourceInstanceChange]) -> State {
    use crate::planner::ChangeAction;

    let mut state = prior.clone();
    for change in changes {
        if let Some(key) = &change.deposed_key {
            if change.action.destroys() || change.action.forgets() {
                state.set_instance_deposed(&change.addr, &change.provider, key.clone(), None);
            }
            continue;
        }
        match change.action {
            ChangeAction::Delete | ChangeAction::Forget => {
                state.set_instance_current(&change.addr, &change.provider, None);
            }
            ChangeAction::Create
            | ChangeAction::Update
            | ChangeAction::DeleteThenCreate
            | ChangeAction::ForgetThenCreate => {
                if let Some(planned) = &change.planned {
                    let version = state
                        .instance_object(&change.addr)
                        .map(|o| o.schema_version)
                        .unwrap_or(0);
                    if let Ok(object) = ResourceInstanceObject::from_value(planned, version) {
                        state.set_instance_current(&change.addr, &change.provider, Some(object));
                    }
                }
            }
            ChangeAction::NoOp | ChangeAction::Read => {}
        }
    }
    state
}

/// Inputs shared by every entry point.
pub struct WalkRequest {
    pub config: Config,
    pub prior_state: State,
    pub provider_factories: ProviderFactories,
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Defaults to a config-backed static context.
    pub eval: Option<Arc<dyn EvaluationContext>>,
    /// 0 selects the default.
    pub concurrency: usize,
}

impl WalkRequest {
    pub fn new(
        config: Config,
        prior_state: State,
        provider_factories: ProviderFactories,
    ) -> Self {
        Self {
            config,
            prior_state,
            provider_factories,
            hooks: Vec::new(),
            eval: None,
            concurrency: 0,
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn Hook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_eval(mut self, eval: Arc<dyn EvaluationContext>) -> Self {
        self.eval = Some(eval);
        self
    }
}

struct PreparedWalk {
    graph: Graph,
    ctx: WalkContext,
    concurrency: usize,
    diags: Diagnostics,
}

async fn prepare(
    request: WalkRequest,
    operation: WalkOperation,
    plan_mode: PlanMode,
    seed_changes: Option<&[ResourceInstanceChange]>,
    imports: Vec<ImportTarget>,
) -> PreparedWalk {
    let WalkRequest {
        config,
        prior_state,
        provider_factories,
        hooks,
        eval,
        concurrency,
    } = request;

    let context = Context::new();
    let schemas = Arc::new(SchemaCache::new(provider_factories));
    let mut diags = schemas.preload(&context, &config, &prior_state).await;

    let (graph, graph_diags) = build_graph(&config, &prior_state);
    diags.append(graph_diags);

    let config = Arc::new(config);
    let eval: Arc<dyn EvaluationContext> = eval
        .unwrap_or_else(|| Arc::new(StaticEvaluationContext::new((*config).clone())));
    let expander = Arc::new(InstanceExpander::new());
    register_expansions(&config, eval.as_ref(), &expander);

    let changes = Arc::new(Changes::new());
    if let Some(seed) = seed_changes {
        changes.seed(seed);
    }

    let ctx = WalkContext {
        operation,
        plan_mode,
        context,
        config,
        eval,
        expander,
        state: SyncState::new(prior_state),
        hooks: Arc::new(HookMux::new(hooks)),
        providers: Arc::new(ProviderRegistry::new()),
        changes,
        schemas,
        ephemerals: Arc::new(EphemeralRegistry::new()),
        imports: Arc::new(imports),
        stopping: Arc::new(AtomicBool::new(false)),
    };

    let concurrency = if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };

    PreparedWalk {
        graph,
        ctx,
        concurrency,
        diags,
    }
}

/// Produces a plan: the ordered set of proposed changes plus state
/// snapshots. A best-effort plan is returned even when diagnostics carry
/// errors.
pub async fn plan(request: WalkRequest, mode: PlanMode) -> (Plan, Diagnostics) {
    let prior_state = request.prior_state.clone();
    let operation = match mode {
        PlanMode::Destroy => WalkOperation::PlanDestroy,
        PlanMode::Normal | PlanMode::RefreshOnly => WalkOperation::Plan,
    };
    let mut prepared = prepare(request, operation, mode, None, Vec::new()).await;

    if !prepared.diags.has_errors() {
        let walk_diags = walk(&prepared.graph, &prepared.ctx, prepared.concurrency).await;
        prepared.diags.append(walk_diags);
    }

    let changes = prepared.ctx.changes.finalize();
    let planned_state = project_planned_state(&prior_state, &changes);
    (
        Plan {
            mode,
            changes,
            prior_state,
            planned_state,
        },
        prepared.diags,
    )
}

/// Applies a previously produced plan, returning the resulting state. The
/// state reflects whatever completed, even on error.
pub async fn apply(mut request: WalkRequest, plan: &Plan) -> (State, Diagnostics) {
    request.prior_state = plan.prior_state.clone();
    let operation = match plan.mode {
        PlanMode::Destroy => WalkOperation::Destroy,
        PlanMode::Normal | PlanMode::RefreshOnly => WalkOperation::Apply,
    };
    let mut prepared = prepare(
        request,
        operation,
        plan.mode,
        Some(&plan.changes),
        Vec::new(),
    )
    .await;

    if !prepared.diags.has_errors() {
        let walk_diags = walk(&prepared.graph, &prepared.ctx, prepared.concurrency).await;
        prepared.diags.append(walk_diags);
    }

    // A destroy that forgets objects leaves artifacts behind; the caller
    // asked for everything to be gone.
    if plan.mode == PlanMode::Destroy && plan.leaves_objects_behind() {
        let forgotten = plan
            .changes
            .iter()
            .filter(|c| c.action.forgets())
            .count();
        prepared.diags.push(Diagnostic::error(
            "Forgotten resources left behind",
            format!(
                "The destroy operation completed, but {} resource instance object(s) were \
                 forgotten rather than destroyed: they still exist but are no longer managed.",
                forgotten
            ),
        ));
    }

    (prepared.ctx.state.snapshot(), prepared.diags)
}

/// Validates providers against the configuration without planning changes.
pub async fn validate(request: WalkRequest) -> Diagnostics {
    let mut prepared = prepare(
        request,
        WalkOperation::Validate,
        PlanMode::Normal,
        None,
        Vec::new(),
    )
    .await;
    if prepared.diags.has_errors() {
        return prepared.diags;
    }
    let walk_diags = walk(&prepared.graph, &prepared.ctx, prepared.concurrency).await;
    prepared.diags.append(walk_diags);
    prepared.diags
}

/// Refreshes state from real infrastructure.
pub async fn refresh(request: WalkRequest) -> (State, Diagnostics) {
    let mut prepared = prepare(
        request,
        WalkOperation::Refresh,
        PlanMode::Normal,
        None,
        Vec::new(),
    )
    .await;
    if !prepared.diags.has_errors() {
        let walk_diags = walk(&prepared.graph, &prepared.ctx, prepared.concurrency).await;
        prepared.diags.append(walk_diags);
    }
    (prepared.ctx.state.snapshot(), prepared.diags)
}

/// Imports existing objects into state. Returns best-effort state.
pub async fn import(request: WalkRequest, targets: Vec<ImportTarget>) -> (State, Diagnostics) {
    let mut prepared = prepare(
        request,
        WalkOperation::Import,
        PlanMode::Normal,
        None,
        targets,
    )
    .await;
    if !prepared.diags.has_errors() {
        let walk_diags = walk(&prepared.graph, &prepared.ctx, prepared.concurrency).await;
        prepared.diags.append(walk_diags);
    }
    (prepared.ctx.state.snapshot(), prepared.diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CloseProviderNode, ProviderConfigNode};

    fn provider_node(alias: Option<&str>) -> Node {
        Node::ProviderConfig(ProviderConfigNode {
            addr: addrs::AbsProviderConfig::new(
                addrs::Provider::default("aws"),
                addrs::ModulePath::root(),
                alias.map(String::from),
            ),
            config: None,
            proxyable: false,
        })
    }

    fn bare_context(operation: WalkOperation) -> WalkContext {
        let config = Arc::new(Config::default());
        WalkContext {
            operation,
            plan_mode: operation.plan_mode(),
            context: Context::new(),
            config: config.clone(),
            eval: Arc::new(StaticEvaluationContext::new((*config).clone())),
            expander: Arc::new(InstanceExpander::new()),
            state: SyncState::new(State::new()),
            hooks: Arc::new(HookMux::new(Vec::new())),
            providers: Arc::new(ProviderRegistry::new()),
            changes: Arc::new(Changes::new()),
            schemas: Arc::new(SchemaCache::new(HashMap::new())),
            ephemerals: Arc::new(EphemeralRegistry::new()),
            imports: Arc::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn failed_vertex_suppresses_descendants_but_not_closers() {
        // No factories are registered, so the provider vertex fails. Its
        // successor provider must be skipped silently, while the close
        // vertex still runs.
        let mut graph = Graph::new();
        let failing = graph.add(provider_node(None));
        let dependent = graph.add(provider_node(Some("eu")));
        let closer = graph.add(Node::CloseProvider(CloseProviderNode {
            addr: addrs::AbsProviderConfig::new(
                addrs::Provider::default("aws"),
                addrs::ModulePath::root(),
                None,
            ),
        }));
        graph.connect(failing, dependent);
        graph.connect(failing, closer);

        let ctx = bare_context(WalkOperation::Plan);
        let diags = walk(&graph, &ctx, 2).await;

        // One error from the failing vertex; the skipped dependent
        // generated none of its own.
        let errors: Vec<_> = diags.iter().filter(|d| d.is_error()).collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn validate_walk_continues_past_errors() {
        let mut graph = Graph::new();
        let failing = graph.add(provider_node(None));
        let dependent = graph.add(provider_node(Some("eu")));
        graph.connect(failing, dependent);

        let ctx = bare_context(WalkOperation::Validate);
        let diags = walk(&graph, &ctx, 2).await;

        // Both vertices executed and both failed.
        let errors: Vec<_> = diags.iter().filter(|d| d.is_error()).collect();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_walk_dispatches_nothing_new() {
        let mut graph = Graph::new();
        graph.add(provider_node(None));
        graph.add(provider_node(Some("eu")));

        let ctx = bare_context(WalkOperation::Plan);
        ctx.context.cancel();
        let diags = walk(&graph, &ctx, 2).await;

        assert!(diags.is_empty());
    }

    #[tokio::test]
    async fn stop_notifies_hooks_exactly_once() {
        use crate::hook::{Hook, HookResult};
        use std::sync::atomic::AtomicUsize;

        struct StopCounter(AtomicUsize);

        #[async_trait::async_trait]
        impl Hook for StopCounter {
            async fn stopping(&self) -> HookResult {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(crate::hook::HookAction::Continue)
            }
        }

        let counter = Arc::new(StopCounter(AtomicUsize::new(0)));
        let mut ctx = bare_context(WalkOperation::Apply);
        ctx.hooks = Arc::new(HookMux::new(vec![counter.clone()]));

        ctx.stop().await;
        ctx.stop().await;

        assert!(ctx.context.is_cancelled());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
