//! Vertex execution
//!
//! What each vertex does under each walk operation. Resource vertices expand
//! into their instances here, during the walk, which is why provider
//! resolution carried a table instead of a single edge. All provider
//! traffic and hook fan-out for one instance happens on the worker that
//! picked the vertex up.

use std::collections::HashSet;
use std::sync::Arc;

use crate::addrs;
use crate::config::Lifecycle;
use crate::graph::{
    CloseEphemeralNode, CloseProviderNode, Node, OrphanResourceNode, ProviderConfigNode,
    ResourceNode,
};
use crate::hook::{Hook, HookAction};
use crate::plan::ResourceInstanceChange;
use crate::planner::{
    plan_current_action, plan_deposed_action, ChangeAction, CurrentInstanceInput, DeposedInput,
    PlanMode,
};
use crate::provider::{
    ApplyResourceChangeRequest, ConfigureProviderRequest, GetSchemaResponse, ImportResourceStateRequest,
    OpenEphemeralResourceRequest, PlanResourceChangeRequest, ProviderHandle, ReadDataSourceRequest,
    ReadResourceRequest, ValidateProviderConfigRequest, CloseEphemeralResourceRequest,
};
use crate::state::{DeposedKey, ResourceInstanceObject};
use crate::types::{Diagnostic, Diagnostics, DynamicValue};
use crate::upgrade::{move_resource_instance_object, upgrade_resource_instance_object};
use crate::walk::{OpenEphemeralInstance, WalkContext, WalkOperation};

pub(crate) async fn execute_node(node: Node, ctx: WalkContext) -> Diagnostics {
    match node {
        Node::ProviderConfig(n) => execute_provider(n, ctx).await,
        Node::Resource(n) => execute_resource(n, ctx).await,
        Node::OrphanResource(n) => execute_orphan(n, ctx).await,
        Node::CloseProvider(n) => execute_close_provider(n, ctx).await,
        Node::CloseEphemeral(n) => execute_close_ephemeral(n, ctx).await,
        Node::ProxyProvider(_) => Diagnostics::new(),
    }
}

async fn execute_provider(n: ProviderConfigNode, ctx: WalkContext) -> Diagnostics {
    let mut diags = Diagnostics::new();

    let Some(factory) = ctx.schemas.factories().get(&n.addr.provider).cloned() else {
        diags.push(
            Diagnostic::error(
                "Provider not available",
                format!("No provider factory is registered for {}.", n.addr.provider),
            )
            .with_address(n.addr.to_string()),
        );
        return diags;
    };

    let handle = match factory() {
        Ok(handle) => handle,
        Err(err) => {
            diags.push(
                Diagnostic::error(
                    "Provider failed to start",
                    format!("The factory for {} failed: {}", n.addr.provider, err),
                )
                .with_address(n.addr.to_string()),
            );
            return diags;
        }
    };

    let config_value = n
        .config
        .clone()
        .unwrap_or_else(|| ctx.eval.provider_config_value(&n.addr));

    let response = handle
        .validate_provider_config(
            ctx.context.clone(),
            ValidateProviderConfigRequest {
                config: config_value.clone(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if diags.has_errors() {
        return diags;
    }

    if ctx.operation != WalkOperation::Validate {
        let response = handle
            .configure_provider(
                ctx.context.clone(),
                ConfigureProviderRequest {
                    config: config_value,
                },
            )
            .await;
        diags.append(response.diagnostics);
        if diags.has_errors() {
            return diags;
        }
    }

    ctx.providers.insert(&n.addr, handle);
    diags
}

async fn execute_close_provider(n: CloseProviderNode, ctx: WalkContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    if let Some(handle) = ctx.providers.remove(&n.addr) {
        let response = handle.close(ctx.context.clone()).await;
        if let Some(err) = response.error {
            diags.push(
                Diagnostic::warning(
                    "Provider failed to close",
                    format!("Provider {} reported an error on close: {}", n.addr, err),
                )
                .with_address(n.addr.to_string()),
            );
        }
    }
    diags
}

async fn execute_close_ephemeral(n: CloseEphemeralNode, ctx: WalkContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for open in ctx.ephemerals.drain(&n.addr) {
        match ctx.providers.get(&open.provider) {
            Ok(handle) => {
                let response = handle
                    .close_ephemeral_resource(
                        ctx.context.clone(),
                        CloseEphemeralResourceRequest {
                            type_name: open.addr.resource.type_name.clone(),
                            private: open.private,
                        },
                    )
                    .await;
                diags.append(response.diagnostics);
            }
            Err(_) => {
                diags.push(
                    Diagnostic::warning(
                        "Ephemeral resource not closed",
                        format!(
                            "The provider behind {} was already gone when its close vertex ran.",
                            open.addr
                        ),
                    )
                    .with_address(open.addr.to_string()),
                );
            }
        }
    }
    diags
}

async fn execute_resource(n: ResourceNode, ctx: WalkContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    if ctx.operation == WalkOperation::Validate {
        return diags;
    }

    let Some(resolver) = n.resolver.clone() else {
        diags.push(Diagnostic::error(
            "Resource vertex missing resolver",
            format!(
                "Provider resolution never ran for {}. This is a bug in the engine.",
                n.addr
            ),
        ));
        return diags;
    };

    for module_instance in ctx.expander.expand_module_path(&n.addr.module) {
        let abs = addrs::AbsResource {
            module: module_instance.clone(),
            resource: n.addr.resource.clone(),
        };
        let expanded = ctx.expander.expand_resource(&abs);
        let expanded_keys: HashSet<addrs::InstanceKey> =
            expanded.iter().map(|i| i.key.clone()).collect();

        for instance in &expanded {
            let instance_diags =
                process_resource_instance(&n, &resolver, &ctx, instance, true).await;
            diags.append(instance_diags);
        }

        // Instances still in state but no longer produced by the expansion:
        // the declaration can no longer reach them, so they follow orphan
        // policy.
        let leftover_keys: Vec<addrs::InstanceKey> = ctx.state.with(|s| {
            s.resource(&abs)
                .map(|r| {
                    r.instances
                        .keys()
                        .filter(|k| !expanded_keys.contains(k))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        });
        for key in leftover_keys {
            let instance = abs.instance(key);
            let instance_diags =
                process_resource_instance(&n, &resolver, &ctx, &instance, false).await;
            diags.append(instance_diags);
        }
    }
    diags
}

async fn execute_orphan(n: OrphanResourceNode, ctx: WalkContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    if ctx.operation == WalkOperation::Validate || ctx.operation == WalkOperation::Import {
        return diags;
    }

    let Some(resolver) = n.resolver.clone() else {
        diags.push(Diagnostic::error(
            "Orphan vertex missing resolver",
            format!(
                "Provider resolution never ran for {}. This is a bug in the engine.",
                n.addr
            ),
        ));
        return diags;
    };

    let provider_addr = match resolver.resolve(&n.addr) {
        Ok(addr) => addr,
        Err(diag) => {
            diags.push(diag);
            return diags;
        }
    };
    let handle = match ctx.providers.get(&provider_addr) {
        Ok(handle) => handle,
        Err(err) => {
            diags.push(
                Diagnostic::error(
                    "Provider not configured",
                    format!("Provider for {} is unavailable: {}", n.addr, err),
                )
                .with_address(n.addr.to_string()),
            );
            return diags;
        }
    };
    let schemas = ctx.schemas.schema(&ctx.context, &provider_addr.provider).await;

    let removed_destroy = ctx
        .config
        .module(&n.addr.module.module_path())
        .and_then(|m| m.removed_block(&n.addr.resource))
        .map(|r| r.destroy);

    match ctx.operation {
        WalkOperation::Plan | WalkOperation::PlanDestroy => {
            let prior = match prepared_prior(&ctx, &n.addr, &provider_addr, &handle, &schemas).await
            {
                Ok(prior) => prior,
                Err(prior_diags) => {
                    diags.append(prior_diags);
                    return diags;
                }
            };
            let prior_value = decoded_or_null(&prior);

            let action = plan_current_action(&CurrentInstanceInput {
                prior: prior.as_ref(),
                in_config: false,
                lifecycle: Lifecycle::default(),
                removed_destroy,
                mode: ctx.plan_mode,
                needs_replace: false,
                has_changes: false,
            });

            if prior.is_some() {
                if hook_halted(
                    ctx.hooks
                        .post_diff(&n.addr, action)
                        .await,
                    &mut diags,
                ) {
                    return diags;
                }
                ctx.changes.append(ResourceInstanceChange {
                    addr: n.addr.clone(),
                    deposed_key: None,
                    provider: provider_addr.clone(),
                    action,
                    prior: Some(prior_value),
                    planned: None,
                    private: prior.map(|o| o.private).unwrap_or_default(),
                });
            }

            plan_deposed_objects(&ctx, &n.addr, &provider_addr, None, removed_destroy).await;
        }
        WalkOperation::Apply | WalkOperation::Destroy => {
            let apply_diags =
                apply_recorded_changes(&ctx, &n.addr, &provider_addr, &handle, &schemas, None)
                    .await;
            diags.append(apply_diags);
        }
        WalkOperation::Refresh => {
            let refresh_diags =
                refresh_instance(&ctx, &n.addr, &provider_addr, &handle, &schemas).await;
            diags.append(refresh_diags);
        }
        _ => {}
    }
    diags
}

/// Plans or applies one instance of a declared resource.
async fn process_resource_instance(
    n: &ResourceNode,
    resolver: &crate::resolver::ResourceInstanceProviderResolver,
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    in_expansion: bool,
) -> Diagnostics {
    let mut diags = Diagnostics::new();

    let provider_addr = match resolver.resolve(instance) {
        Ok(addr) => addr,
        Err(diag) => {
            diags.push(diag);
            return diags;
        }
    };
    let handle = match ctx.providers.get(&provider_addr) {
        Ok(handle) => handle,
        Err(err) => {
            diags.push(
                Diagnostic::error(
                    "Provider not configured",
                    format!("Provider for {} is unavailable: {}", instance, err),
                )
                .with_address(instance.to_string()),
            );
            return diags;
        }
    };
    let schemas = ctx.schemas.schema(&ctx.context, &provider_addr.provider).await;

    match instance.resource.mode {
        addrs::ResourceMode::Managed => match ctx.operation {
            WalkOperation::Plan | WalkOperation::PlanDestroy => {
                plan_managed_instance(
                    n,
                    ctx,
                    instance,
                    in_expansion,
                    &provider_addr,
                    &handle,
                    &schemas,
                    &mut diags,
                )
                .await;
            }
            WalkOperation::Apply | WalkOperation::Destroy => {
                let apply_diags = apply_recorded_changes(
                    ctx,
                    instance,
                    &provider_addr,
                    &handle,
                    &schemas,
                    Some(n),
                )
                .await;
                diags.append(apply_diags);
            }
            WalkOperation::Refresh => {
                let refresh_diags =
                    refresh_instance(ctx, instance, &provider_addr, &handle, &schemas).await;
                diags.append(refresh_diags);
            }
            WalkOperation::Import => {
                import_instance(ctx, instance, &provider_addr, &handle, &schemas, &mut diags)
                    .await;
            }
            WalkOperation::Validate => {}
        },
        addrs::ResourceMode::Data => {
            if matches!(ctx.operation, WalkOperation::Plan | WalkOperation::Apply) {
                let config_value = ctx
                    .eval
                    .resource_config_value(&instance.module, &instance.resource);
                let response = handle
                    .read_data_source(
                        ctx.context.clone(),
                        ReadDataSourceRequest {
                            type_name: instance.resource.type_name.clone(),
                            config: config_value,
                        },
                    )
                    .await;
                diags.append(response.diagnostics);
                if !diags.has_errors() && ctx.operation == WalkOperation::Plan {
                    ctx.changes.append(ResourceInstanceChange {
                        addr: instance.clone(),
                        deposed_key: None,
                        provider: provider_addr.clone(),
                        action: ChangeAction::Read,
                        prior: None,
                        planned: response.state,
                        private: Vec::new(),
                    });
                }
            }
        }
        addrs::ResourceMode::Ephemeral => {
            if !matches!(ctx.operation, WalkOperation::Refresh) {
                let config_value = ctx
                    .eval
                    .resource_config_value(&instance.module, &instance.resource);
                let response = handle
                    .open_ephemeral_resource(
                        ctx.context.clone(),
                        OpenEphemeralResourceRequest {
                            type_name: instance.resource.type_name.clone(),
                            config: config_value,
                        },
                    )
                    .await;
                diags.append(response.diagnostics);
                if !diags.has_errors() {
                    ctx.ephemerals.register(
                        &n.addr,
                        OpenEphemeralInstance {
                            addr: instance.clone(),
                            provider: provider_addr.clone(),
                            private: response.private,
                        },
                    );
                }
            }
        }
    }
    diags
}

/// Prior object for an instance, after move and upgrade.
async fn prepared_prior(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    schemas: &Arc<GetSchemaResponse>,
) -> Result<Option<ResourceInstanceObject>, Diagnostics> {
    let mut diags = Diagnostics::new();

    let (prior, stored_fqn) = ctx.state.with(|s| {
        (
            s.instance_object(instance).cloned(),
            s.resource(&instance.abs_resource())
                .map(|r| r.provider_config.provider.clone()),
        )
    });
    let Some(mut prior) = prior else {
        return Ok(None);
    };

    // The implied provider changed between runs: translate through the
    // provider's move entry point first.
    if let Some(stored_fqn) = stored_fqn {
        if stored_fqn != provider_addr.provider {
            let (moved, move_diags) = move_resource_instance_object(
                &ctx.context,
                handle,
                schemas,
                instance,
                &stored_fqn,
                &instance.resource.type_name,
                &prior,
            )
            .await;
            diags.append(move_diags);
            match moved {
                Some(moved) => prior = moved,
                None => return Err(diags),
            }
        }
    }

    let (upgraded, upgrade_diags) =
        upgrade_resource_instance_object(&ctx.context, handle, schemas, instance, &prior).await;
    diags.append(upgrade_diags);
    match upgraded {
        Some(upgraded) => {
            if diags.has_errors() {
                Err(diags)
            } else {
                Ok(Some(upgraded))
            }
        }
        None => Err(diags),
    }
}

fn decoded_or_null(object: &Option<ResourceInstanceObject>) -> DynamicValue {
    object
        .as_ref()
        .and_then(|o| o.decoded_value().ok())
        .unwrap_or_else(DynamicValue::null)
}

fn hook_halted(result: crate::hook::HookResult, diags: &mut Diagnostics) -> bool {
    match result {
        Ok(HookAction::Continue) => false,
        Ok(HookAction::Halt) => true,
        Err(err) => {
            diags.push(Diagnostic::error("Hook failed", err.to_string()));
            true
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn plan_managed_instance(
    n: &ResourceNode,
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    in_expansion: bool,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    schemas: &Arc<GetSchemaResponse>,
    diags: &mut Diagnostics,
) {
    let prior = match prepared_prior(ctx, instance, provider_addr, handle, schemas).await {
        Ok(prior) => prior,
        Err(prior_diags) => {
            diags.append(prior_diags);
            return;
        }
    };
    let prior_value = decoded_or_null(&prior);
    let lifecycle = n.config.lifecycle;

    // Only the live declared path needs a provider diff; destroy plans,
    // disabled declarations and expansion leftovers are policy-only.
    let active = ctx.plan_mode == PlanMode::Normal && in_expansion && lifecycle.enabled;

    let (action, planned, private) = if active {
        let config_value = ctx
            .eval
            .resource_config_value(&instance.module, &instance.resource);

        if hook_halted(
            ctx.hooks
                .pre_diff(instance, &prior_value, &config_value)
                .await,
            diags,
        ) {
            return;
        }

        let response = handle
            .plan_resource_change(
                ctx.context.clone(),
                PlanResourceChangeRequest {
                    type_name: instance.resource.type_name.clone(),
                    prior_state: prior_value.clone(),
                    proposed_new_state: config_value.clone(),
                    config: config_value,
                    prior_private: prior.as_ref().map(|o| o.private.clone()).unwrap_or_default(),
                },
            )
            .await;
        diags.append(response.diagnostics);
        if diags.has_errors() {
            return;
        }

        let needs_replace = !response.requires_replace.is_empty();
        let has_changes = prior.is_none() || response.planned_state != prior_value;
        let action = plan_current_action(&CurrentInstanceInput {
            prior: prior.as_ref(),
            in_config: true,
            lifecycle,
            removed_destroy: None,
            mode: ctx.plan_mode,
            needs_replace,
            has_changes,
        });

        let planned = match action {
            ChangeAction::Delete | ChangeAction::Forget => None,
            ChangeAction::NoOp => Some(prior_value.clone()),
            _ => Some(response.planned_state),
        };
        (action, planned, response.planned_private)
    } else {
        let action = plan_current_action(&CurrentInstanceInput {
            prior: prior.as_ref(),
            in_config: in_expansion,
            lifecycle,
            removed_destroy: None,
            mode: ctx.plan_mode,
            needs_replace: false,
            has_changes: false,
        });
        let private = prior.as_ref().map(|o| o.private.clone()).unwrap_or_default();
        (action, None, private)
    };

    if prior.is_some() || action != ChangeAction::NoOp {
        if hook_halted(ctx.hooks.post_diff(instance, action).await, diags) {
            return;
        }
        ctx.changes.append(ResourceInstanceChange {
            addr: instance.clone(),
            deposed_key: None,
            provider: provider_addr.clone(),
            action,
            prior: prior.as_ref().map(|_| prior_value),
            planned,
            private,
        });
    }

    plan_deposed_objects(ctx, instance, provider_addr, Some(lifecycle.destroy), None).await;
}

/// Records delete-or-forget changes for every deposed object of an instance.
async fn plan_deposed_objects(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    config_destroy: Option<bool>,
    removed_destroy: Option<bool>,
) {
    let deposed: Vec<(DeposedKey, bool, DynamicValue, Vec<u8>)> = ctx.state.with(|s| {
        s.instance(instance)
            .map(|i| {
                i.deposed
                    .iter()
                    .map(|(key, object)| {
                        (
                            key.clone(),
                            object.skip_destroy,
                            object.decoded_value().unwrap_or_else(|_| DynamicValue::null()),
                            object.private.clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    });

    for (key, skip_destroy, value, private) in deposed {
        let action = plan_deposed_action(&DeposedInput {
            skip_destroy,
            config_destroy,
            removed_destroy,
        });
        ctx.changes.append(ResourceInstanceChange {
            addr: instance.clone(),
            deposed_key: Some(key),
            provider: provider_addr.clone(),
            action,
            prior: Some(value),
            planned: None,
            private,
        });
    }
}

/// Applies the recorded changes for one instance: the current object's
/// change plus any deposed-object changes.
async fn apply_recorded_changes(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    schemas: &Arc<GetSchemaResponse>,
    n: Option<&ResourceNode>,
) -> Diagnostics {
    let mut diags = Diagnostics::new();

    if let Some(change) = ctx.changes.get(instance, None) {
        let change_diags =
            apply_current_change(ctx, instance, provider_addr, handle, schemas, n, change).await;
        diags.append(change_diags);
    }

    for change in ctx.changes.deposed_for(instance) {
        if diags.has_errors() {
            break;
        }
        let change_diags =
            apply_deposed_change(ctx, instance, provider_addr, handle, change).await;
        diags.append(change_diags);
    }
    diags
}

async fn apply_current_change(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    schemas: &Arc<GetSchemaResponse>,
    n: Option<&ResourceNode>,
    change: ResourceInstanceChange,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let schema_version = schemas
        .schema_for(&instance.resource)
        .map(|s| s.version)
        .unwrap_or(0);
    let lifecycle = n.map(|n| n.config.lifecycle).unwrap_or_default();
    let prior_value = change.prior.clone().unwrap_or_else(DynamicValue::null);
    let planned_value = change.planned.clone().unwrap_or_else(DynamicValue::null);

    match change.action {
        ChangeAction::NoOp | ChangeAction::Read => {}
        ChangeAction::Create | ChangeAction::Update => {
            if hook_halted(
                ctx.hooks
                    .pre_apply(instance, change.action, &prior_value, &planned_value)
                    .await,
                &mut diags,
            ) {
                return diags;
            }
            let created = create_or_update(
                ctx,
                instance,
                provider_addr,
                handle,
                n,
                &prior_value,
                &planned_value,
                &change.private,
                schema_version,
                lifecycle,
            )
            .await;
            diags.append(created);
        }
        ChangeAction::Delete => {
            if hook_halted(
                ctx.hooks
                    .pre_apply(instance, change.action, &prior_value, &DynamicValue::null())
                    .await,
                &mut diags,
            ) {
                return diags;
            }
            let destroyed = destroy_object(
                ctx,
                instance,
                handle,
                &prior_value,
                &change.private,
            )
            .await;
            diags.append(destroyed);
            if !diags.has_errors() {
                ctx.state
                    .with(|s| s.set_instance_current(instance, provider_addr, None));
                post_state_update(ctx, &mut diags).await;
            }
        }
        ChangeAction::Forget => {
            if hook_halted(ctx.hooks.pre_forget(instance).await, &mut diags) {
                return diags;
            }
            tracing::debug!("forgetting {} without destroying it", instance);
            ctx.state
                .with(|s| s.set_instance_current(instance, provider_addr, None));
            if hook_halted(ctx.hooks.post_forget(instance).await, &mut diags) {
                return diags;
            }
            post_state_update(ctx, &mut diags).await;
        }
        ChangeAction::DeleteThenCreate | ChangeAction::ForgetThenCreate => {
            if hook_halted(
                ctx.hooks
                    .pre_apply(instance, change.action, &prior_value, &planned_value)
                    .await,
                &mut diags,
            ) {
                return diags;
            }

            if change.action == ChangeAction::DeleteThenCreate && lifecycle.create_before_destroy {
                // Depose the current object, create its replacement, then
                // dispose of the deposed object.
                let deposed_key = ctx.state.with(|s| s.depose_instance(instance));
                let created = create_or_update(
                    ctx,
                    instance,
                    provider_addr,
                    handle,
                    n,
                    &DynamicValue::null(),
                    &planned_value,
                    &change.private,
                    schema_version,
                    lifecycle,
                )
                .await;
                diags.append(created);
                if let Some(key) = deposed_key {
                    if !diags.has_errors() {
                        let destroyed =
                            destroy_object(ctx, instance, handle, &prior_value, &change.private)
                                .await;
                        diags.append(destroyed);
                        if !diags.has_errors() {
                            ctx.state.with(|s| {
                                s.set_instance_deposed(instance, provider_addr, key, None)
                            });
                        }
                    }
                }
            } else {
                if change.action == ChangeAction::DeleteThenCreate {
                    let destroyed =
                        destroy_object(ctx, instance, handle, &prior_value, &change.private)
                            .await;
                    diags.append(destroyed);
                } else {
                    if hook_halted(ctx.hooks.pre_forget(instance).await, &mut diags) {
                        return diags;
                    }
                    if hook_halted(ctx.hooks.post_forget(instance).await, &mut diags) {
                        return diags;
                    }
                }
                if diags.has_errors() {
                    return diags;
                }
                ctx.state
                    .with(|s| s.set_instance_current(instance, provider_addr, None));
                let created = create_or_update(
                    ctx,
                    instance,
                    provider_addr,
                    handle,
                    n,
                    &DynamicValue::null(),
                    &planned_value,
                    &change.private,
                    schema_version,
                    lifecycle,
                )
                .await;
                diags.append(created);
            }
        }
    }
    diags
}

#[allow(clippy::too_many_arguments)]
async fn create_or_update(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    n: Option<&ResourceNode>,
    prior_value: &DynamicValue,
    planned_value: &DynamicValue,
    planned_private: &[u8],
    schema_version: u64,
    lifecycle: Lifecycle,
) -> Diagnostics {
    let mut diags = Diagnostics::new();

    let config_value = ctx
        .eval
        .resource_config_value(&instance.module, &instance.resource);
    let response = handle
        .apply_resource_change(
            ctx.context.clone(),
            ApplyResourceChangeRequest {
                type_name: instance.resource.type_name.clone(),
                prior_state: prior_value.clone(),
                planned_state: planned_value.clone(),
                config: config_value,
                planned_private: planned_private.to_vec(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if diags.has_errors() {
        if hook_halted(
            ctx.hooks
                .post_apply(instance, &DynamicValue::null(), Some("apply failed"))
                .await,
            &mut diags,
        ) {
            return diags;
        }
        return diags;
    }

    let dependencies = n
        .map(|n| {
            n.config
                .references
                .iter()
                .map(|r| addrs::ConfigResource {
                    module: n.addr.module.clone(),
                    resource: r.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    match ResourceInstanceObject::from_value(&response.new_state, schema_version) {
        Ok(object) => {
            let object = object
                .with_private(response.private)
                // The declaration's current wish is recorded so later
                // orphaned or deposed copies of this object keep it.
                .with_skip_destroy(!lifecycle.destroy)
                .with_dependencies(dependencies);
            ctx.state
                .with(|s| s.set_instance_current(instance, provider_addr, Some(object)));
        }
        Err(err) => {
            diags.push(
                Diagnostic::error(
                    "Invalid object from provider",
                    format!("The applied state of {} is not encodable: {}", instance, err),
                )
                .with_address(instance.to_string()),
            );
            return diags;
        }
    }

    if hook_halted(
        ctx.hooks
            .post_apply(instance, &response.new_state, None)
            .await,
        &mut diags,
    ) {
        return diags;
    }
    if hook_halted(
        ctx.hooks
            .state_value_change(instance, &response.new_state)
            .await,
        &mut diags,
    ) {
        return diags;
    }
    post_state_update(ctx, &mut diags).await;
    diags
}

async fn destroy_object(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    handle: &Arc<dyn ProviderHandle>,
    prior_value: &DynamicValue,
    private: &[u8],
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let response = handle
        .apply_resource_change(
            ctx.context.clone(),
            ApplyResourceChangeRequest {
                type_name: instance.resource.type_name.clone(),
                prior_state: prior_value.clone(),
                planned_state: DynamicValue::null(),
                config: DynamicValue::null(),
                planned_private: private.to_vec(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if !diags.has_errors() {
        if hook_halted(
            ctx.hooks
                .post_apply(instance, &DynamicValue::null(), None)
                .await,
            &mut diags,
        ) {
            return diags;
        }
    }
    diags
}

async fn apply_deposed_change(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    change: ResourceInstanceChange,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(key) = change.deposed_key.clone() else {
        return diags;
    };
    let prior_value = change.prior.clone().unwrap_or_else(DynamicValue::null);

    match change.action {
        ChangeAction::Delete => {
            if hook_halted(
                ctx.hooks
                    .pre_apply(instance, change.action, &prior_value, &DynamicValue::null())
                    .await,
                &mut diags,
            ) {
                return diags;
            }
            let destroyed =
                destroy_object(ctx, instance, handle, &prior_value, &change.private).await;
            diags.append(destroyed);
            if !diags.has_errors() {
                ctx.state
                    .with(|s| s.set_instance_deposed(instance, provider_addr, key, None));
                post_state_update(ctx, &mut diags).await;
            }
        }
        ChangeAction::Forget => {
            if hook_halted(ctx.hooks.pre_forget(instance).await, &mut diags) {
                return diags;
            }
            ctx.state
                .with(|s| s.set_instance_deposed(instance, provider_addr, key, None));
            if hook_halted(ctx.hooks.post_forget(instance).await, &mut diags) {
                return diags;
            }
            post_state_update(ctx, &mut diags).await;
        }
        _ => {}
    }
    diags
}

async fn refresh_instance(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    schemas: &Arc<GetSchemaResponse>,
) -> Diagnostics {
    let mut diags = Diagnostics::new();

    let prior = match prepared_prior(ctx, instance, provider_addr, handle, schemas).await {
        Ok(Some(prior)) => prior,
        Ok(None) => return diags,
        Err(prior_diags) => {
            diags.append(prior_diags);
            return diags;
        }
    };
    let prior_value = prior.decoded_value().unwrap_or_else(|_| DynamicValue::null());

    if hook_halted(ctx.hooks.pre_refresh(instance, &prior_value).await, &mut diags) {
        return diags;
    }

    let response = handle
        .read_resource(
            ctx.context.clone(),
            ReadResourceRequest {
                type_name: instance.resource.type_name.clone(),
                current_state: prior_value,
                private: prior.private.clone(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if diags.has_errors() {
        return diags;
    }

    match response.new_state {
        Some(new_value) => {
            match ResourceInstanceObject::from_value(&new_value, prior.schema_version) {
                Ok(object) => {
                    let object = object
                        .with_private(response.private)
                        .with_skip_destroy(prior.skip_destroy)
                        .with_status(prior.status)
                        .with_dependencies(prior.dependencies.clone());
                    ctx.state
                        .with(|s| s.set_instance_current(instance, provider_addr, Some(object)));
                }
                Err(err) => {
                    diags.push(
                        Diagnostic::error(
                            "Invalid object from provider",
                            format!("The refreshed state of {} is not encodable: {}", instance, err),
                        )
                        .with_address(instance.to_string()),
                    );
                    return diags;
                }
            }
            if hook_halted(ctx.hooks.post_refresh(instance, &new_value).await, &mut diags) {
                return diags;
            }
        }
        None => {
            // The remote object is gone.
            ctx.state
                .with(|s| s.set_instance_current(instance, provider_addr, None));
            if hook_halted(
                ctx.hooks
                    .post_refresh(instance, &DynamicValue::null())
                    .await,
                &mut diags,
            ) {
                return diags;
            }
        }
    }
    post_state_update(ctx, &mut diags).await;
    diags
}

async fn import_instance(
    ctx: &WalkContext,
    instance: &addrs::AbsResourceInstance,
    provider_addr: &addrs::AbsProviderConfig,
    handle: &Arc<dyn ProviderHandle>,
    schemas: &Arc<GetSchemaResponse>,
    diags: &mut Diagnostics,
) {
    let Some(target) = ctx.imports.iter().find(|t| t.addr == *instance) else {
        return;
    };

    if hook_halted(
        ctx.hooks.pre_import_state(instance, &target.id).await,
        diags,
    ) {
        return;
    }

    let response = handle
        .import_resource_state(
            ctx.context.clone(),
            ImportResourceStateRequest {
                type_name: instance.resource.type_name.clone(),
                id: target.id.clone(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if diags.has_errors() {
        return;
    }

    let schema_version = schemas
        .schema_for(&instance.resource)
        .map(|s| s.version)
        .unwrap_or(0);
    let imported_count = response.imported_resources.len();
    for imported in response.imported_resources {
        match ResourceInstanceObject::from_value(&imported.state, schema_version) {
            Ok(object) => {
                let object = object.with_private(imported.private);
                ctx.state
                    .with(|s| s.set_instance_current(instance, provider_addr, Some(object)));
            }
            Err(err) => {
                diags.push(
                    Diagnostic::error(
                        "Invalid imported object",
                        format!("The imported state of {} is not encodable: {}", instance, err),
                    )
                    .with_address(instance.to_string()),
                );
                return;
            }
        }
    }

    if hook_halted(
        ctx.hooks.post_import_state(instance, imported_count).await,
        diags,
    ) {
        return;
    }
    post_state_update(ctx, diags).await;
}

async fn post_state_update(ctx: &WalkContext, diags: &mut Diagnostics) {
    // Hooks get a deep copy; they may retain it freely.
    let snapshot = ctx.state.snapshot();
    if let Err(err) = ctx.hooks.post_state_update(&snapshot).await {
        diags.push(Diagnostic::error("Hook failed", err.to_string()));
    }
}
