//! State upgrade and move
//!
//! Stored objects pass through here before planning: a provider reporting a
//! newer schema version upgrades the raw payload, and a resource whose type
//! or provider changed between runs is moved. Both operations validate the
//! returned value against the current schema before it re-enters state.

use std::sync::Arc;

use crate::addrs;
use crate::context::Context;
use crate::provider::{
    GetSchemaResponse, MoveResourceStateRequest, ProviderHandle, UpgradeResourceStateRequest,
};
use crate::schema;
use crate::state::ResourceInstanceObject;
use crate::types::{Diagnostic, Diagnostics, DynamicValue};

/// Brings one stored object up to the provider's current schema version.
/// Returns the refreshed object, or `None` with diagnostics on failure.
pub async fn upgrade_resource_instance_object(
    ctx: &Context,
    provider: &Arc<dyn ProviderHandle>,
    schemas: &GetSchemaResponse,
    addr: &addrs::AbsResourceInstance,
    prior: &ResourceInstanceObject,
) -> (Option<ResourceInstanceObject>, Diagnostics) {
    let mut diags = Diagnostics::new();

    // Data sources and ephemeral resources never pass through upgrade.
    if addr.resource.mode != addrs::ResourceMode::Managed {
        tracing::warn!(
            "state upgrade requested for non-managed resource {}, returning input unchanged",
            addr
        );
        return (Some(prior.clone()), diags);
    }

    let Some(current_schema) = schemas.schema_for(&addr.resource) else {
        diags.push(
            Diagnostic::error(
                "Unsupported resource type",
                format!(
                    "The provider serving {} does not describe resource type {:?}.",
                    addr, addr.resource.type_name
                ),
            )
            .with_address(addr.to_string()),
        );
        return (None, diags);
    };

    let current_version = current_schema.version;
    if prior.schema_version > current_version {
        diags.push(
            Diagnostic::error(
                "Resource state was created by a newer provider version",
                format!(
                    "The state of {} was written at schema version {} but the current provider \
                     only supports version {}. Downgrades are not possible; upgrade the provider.",
                    addr, prior.schema_version, current_version
                ),
            )
            .with_address(addr.to_string()),
        );
        return (None, diags);
    }

    // At the current version, attributes the schema no longer declares are
    // stripped before the provider sees the payload. A real upgrade skips
    // the scrub: the provider needs the old fields.
    let mut raw = prior.raw_state();
    let mut scrub_input: Option<DynamicValue> = None;
    if prior.schema_version == current_version {
        if let Some(json) = &raw.json {
            match DynamicValue::decode_json(json) {
                Ok(mut decoded) => {
                    let changed =
                        schema::scrub_unknown_attributes(&current_schema.block, &mut decoded.value);
                    if changed {
                        match decoded.encode_json() {
                            Ok(encoded) => raw.json = Some(encoded),
                            Err(err) => {
                                diags.push(
                                    Diagnostic::error(
                                        "Invalid resource state",
                                        format!("Failed to re-encode state of {}: {}", addr, err),
                                    )
                                    .with_address(addr.to_string()),
                                );
                                return (None, diags);
                            }
                        }
                    }
                    scrub_input = Some(decoded);
                }
                Err(err) => {
                    diags.push(
                        Diagnostic::error(
                            "Invalid resource state",
                            format!("The stored state of {} is not decodable: {}", addr, err),
                        )
                        .with_address(addr.to_string()),
                    );
                    return (None, diags);
                }
            }
        }
    }

    let response = provider
        .upgrade_resource_state(
            ctx.clone(),
            UpgradeResourceStateRequest {
                type_name: addr.resource.type_name.clone(),
                version: prior.schema_version,
                raw_state: raw.clone(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if diags.has_errors() {
        return (None, diags);
    }

    let violations = schema::check_conformance(&current_schema.block, &response.upgraded_state.value);
    if !violations.is_empty() {
        diags.push(
            Diagnostic::error(
                "Invalid resource state upgrade",
                format!(
                    "The provider upgraded the state of {} to a value that does not conform to \
                     the current schema: {}. This is a bug in the provider.",
                    addr,
                    violations.join("; ")
                ),
            )
            .with_address(addr.to_string()),
        );
        return (None, diags);
    }

    // When nothing changed in a same-version pass-through, keep the original
    // serialized bytes so reruns are byte-stable.
    let attrs_json = if scrub_input.as_ref() == Some(&response.upgraded_state) {
        raw.json.clone()
    } else {
        match response.upgraded_state.encode_json() {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                diags.push(
                    Diagnostic::error(
                        "Invalid resource state upgrade",
                        format!("Failed to encode upgraded state of {}: {}", addr, err),
                    )
                    .with_address(addr.to_string()),
                );
                return (None, diags);
            }
        }
    };

    let upgraded = ResourceInstanceObject {
        schema_version: current_version,
        attrs_json,
        attrs_flat: None,
        private: prior.private.clone(),
        status: prior.status,
        skip_destroy: prior.skip_destroy,
        dependencies: prior.dependencies.clone(),
    };
    (Some(upgraded), diags)
}

/// Moves an object stored under a different resource type or provider into
/// the target type, via the provider's move entry point.
pub async fn move_resource_instance_object(
    ctx: &Context,
    provider: &Arc<dyn ProviderHandle>,
    schemas: &GetSchemaResponse,
    addr: &addrs::AbsResourceInstance,
    source_provider: &addrs::Provider,
    source_type_name: &str,
    prior: &ResourceInstanceObject,
) -> (Option<ResourceInstanceObject>, Diagnostics) {
    let mut diags = Diagnostics::new();

    if addr.resource.mode != addrs::ResourceMode::Managed {
        tracing::warn!(
            "state move requested for non-managed resource {}, returning input unchanged",
            addr
        );
        return (Some(prior.clone()), diags);
    }

    let Some(target_schema) = schemas.schema_for(&addr.resource) else {
        diags.push(
            Diagnostic::error(
                "Unsupported resource type",
                format!(
                    "The provider serving {} does not describe resource type {:?}.",
                    addr, addr.resource.type_name
                ),
            )
            .with_address(addr.to_string()),
        );
        return (None, diags);
    };

    let response = provider
        .move_resource_state(
            ctx.clone(),
            MoveResourceStateRequest {
                source_provider: source_provider.clone(),
                source_type_name: source_type_name.to_string(),
                source_schema_version: prior.schema_version,
                source_state: prior.raw_state(),
                source_private: prior.private.clone(),
                target_type_name: addr.resource.type_name.clone(),
            },
        )
        .await;
    diags.append(response.diagnostics);
    if diags.has_errors() {
        return (None, diags);
    }

    let violations = schema::check_conformance(&target_schema.block, &response.target_state.value);
    if !violations.is_empty() {
        diags.push(
            Diagnostic::error(
                "Invalid resource state move",
                format!(
                    "The provider moved the state of {} to a value that does not conform to the \
                     target schema: {}. This is a bug in the provider.",
                    addr,
                    violations.join("; ")
                ),
            )
            .with_address(addr.to_string()),
        );
        return (None, diags);
    }

    let attrs_json = match response.target_state.encode_json() {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            diags.push(
                Diagnostic::error(
                    "Invalid resource state move",
                    format!("Failed to encode moved state of {}: {}", addr, err),
                )
                .with_address(addr.to_string()),
            );
            return (None, diags);
        }
    };

    let moved = ResourceInstanceObject {
        schema_version: target_schema.version,
        attrs_json,
        attrs_flat: None,
        private: response.target_private,
        status: prior.status,
        skip_destroy: prior.skip_destroy,
        dependencies: prior.dependencies.clone(),
    };
    (Some(moved), diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{AbsResourceInstance, InstanceKey, ModuleInstance, Resource};
    use crate::mock::MockProvider;
    use crate::schema::{AttributeBuilder, AttributeType, SchemaBuilder};
    use crate::types::Dynamic;

    fn schemas(version: u64) -> GetSchemaResponse {
        MockProvider::schema_response_with(
            "aws_instance",
            SchemaBuilder::new()
                .version(version)
                .attribute(AttributeBuilder::new("a", AttributeType::String).optional().build())
                .attribute(AttributeBuilder::new("b", AttributeType::Number).optional().build())
                .build(),
        )
    }

    fn managed_addr() -> AbsResourceInstance {
        AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_instance", "foo"),
            key: InstanceKey::None,
        }
    }

    fn provider(schemas: GetSchemaResponse) -> Arc<dyn ProviderHandle> {
        Arc::new(MockProvider::new(schemas))
    }

    #[tokio::test]
    async fn downgrade_is_refused_without_calling_provider() {
        let mock = Arc::new(MockProvider::new(schemas(3)));
        let handle = mock.clone() as Arc<dyn ProviderHandle>;
        let prior = ResourceInstanceObject {
            schema_version: 7,
            attrs_json: Some(b"{}".to_vec()),
            attrs_flat: None,
            private: Vec::new(),
            status: crate::state::ObjectStatus::Ready,
            skip_destroy: false,
            dependencies: Vec::new(),
        };

        let (upgraded, diags) = upgrade_resource_instance_object(
            &Context::new(),
            &handle,
            &schemas(3),
            &managed_addr(),
            &prior,
        )
        .await;

        assert!(upgraded.is_none());
        assert!(diags.has_errors());
        assert!(mock.logged().is_empty());
    }

    #[tokio::test]
    async fn same_version_scrubs_removed_attributes() {
        let captured = Arc::new(std::sync::Mutex::new(None));
        let captured_clone = captured.clone();
        let mock = Arc::new(
            MockProvider::new(schemas(3)).with_upgrade(Box::new(move |req| {
                let value = DynamicValue::decode_json(req.raw_state.json.as_ref().unwrap())
                    .unwrap();
                *captured_clone.lock().unwrap() = Some(value.clone());
                crate::provider::UpgradeResourceStateResponse {
                    upgraded_state: value,
                    diagnostics: Diagnostics::new(),
                }
            })),
        );
        let handle = mock.clone() as Arc<dyn ProviderHandle>;

        let stored = DynamicValue::object([
            ("a".to_string(), Dynamic::String("x".into())),
            ("b".to_string(), Dynamic::Number(2.0)),
            ("gone".to_string(), Dynamic::Bool(true)),
        ]);
        let prior = ResourceInstanceObject::from_value(&stored, 3).unwrap();

        let (upgraded, diags) = upgrade_resource_instance_object(
            &Context::new(),
            &handle,
            &schemas(3),
            &managed_addr(),
            &prior,
        )
        .await;

        assert!(!diags.has_errors(), "{:?}", diags);
        let upgraded = upgraded.unwrap();

        // The provider saw only the declared attributes.
        let seen = captured.lock().unwrap().clone().unwrap();
        let Dynamic::Map(seen_map) = seen.value else {
            panic!("expected map");
        };
        assert_eq!(seen_map.len(), 2);
        assert!(!seen_map.contains_key("gone"));

        // And the new object contains exactly those.
        let new_value = upgraded.decoded_value().unwrap();
        let Dynamic::Map(new_map) = new_value.value else {
            panic!("expected map");
        };
        assert_eq!(new_map.len(), 2);
    }

    #[tokio::test]
    async fn same_version_without_removed_attributes_is_byte_stable() {
        let handle = provider(schemas(3));
        let stored = DynamicValue::object([
            ("a".to_string(), Dynamic::String("x".into())),
            ("b".to_string(), Dynamic::Number(2.0)),
        ]);
        let prior = ResourceInstanceObject::from_value(&stored, 3).unwrap();
        let original_bytes = prior.attrs_json.clone().unwrap();

        let (upgraded, diags) = upgrade_resource_instance_object(
            &Context::new(),
            &handle,
            &schemas(3),
            &managed_addr(),
            &prior,
        )
        .await;

        assert!(!diags.has_errors());
        assert_eq!(upgraded.unwrap().attrs_json.unwrap(), original_bytes);
    }

    #[tokio::test]
    async fn real_upgrade_skips_scrub_and_bumps_version() {
        let captured = Arc::new(std::sync::Mutex::new(None));
        let captured_clone = captured.clone();
        let mock = Arc::new(
            MockProvider::new(schemas(3)).with_upgrade(Box::new(move |req| {
                let value = DynamicValue::decode_json(req.raw_state.json.as_ref().unwrap())
                    .unwrap();
                *captured_clone.lock().unwrap() = Some(value);
                crate::provider::UpgradeResourceStateResponse {
                    upgraded_state: DynamicValue::object([(
                        "a".to_string(),
                        Dynamic::String("migrated".into()),
                    )]),
                    diagnostics: Diagnostics::new(),
                }
            })),
        );
        let handle = mock.clone() as Arc<dyn ProviderHandle>;

        let stored = DynamicValue::object([("legacy".to_string(), Dynamic::Bool(true))]);
        let prior = ResourceInstanceObject::from_value(&stored, 1).unwrap();

        let (upgraded, diags) = upgrade_resource_instance_object(
            &Context::new(),
            &handle,
            &schemas(3),
            &managed_addr(),
            &prior,
        )
        .await;

        assert!(!diags.has_errors());
        assert_eq!(upgraded.unwrap().schema_version, 3);

        // The old field reached the provider: a real upgrade must not scrub.
        let seen = captured.lock().unwrap().clone().unwrap();
        let Dynamic::Map(seen_map) = seen.value else {
            panic!("expected map");
        };
        assert!(seen_map.contains_key("legacy"));
    }

    #[tokio::test]
    async fn nonconforming_upgrade_result_is_fatal() {
        let mock = Arc::new(MockProvider::new(schemas(3)).with_upgrade(Box::new(|_| {
            crate::provider::UpgradeResourceStateResponse {
                upgraded_state: DynamicValue::object([(
                    "b".to_string(),
                    Dynamic::String("not a number".into()),
                )]),
                diagnostics: Diagnostics::new(),
            }
        })));
        let handle = mock.clone() as Arc<dyn ProviderHandle>;
        let prior = ResourceInstanceObject::from_value(
            &DynamicValue::new(Dynamic::Map(std::collections::HashMap::new())),
            1,
        )
        .unwrap();

        let (upgraded, diags) = upgrade_resource_instance_object(
            &Context::new(),
            &handle,
            &schemas(3),
            &managed_addr(),
            &prior,
        )
        .await;

        assert!(upgraded.is_none());
        assert!(diags.has_errors());
    }

    #[tokio::test]
    async fn data_sources_pass_through_unchanged() {
        let handle = provider(schemas(3));
        let addr = AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::data("aws_ami", "latest"),
            key: InstanceKey::None,
        };
        let prior = ResourceInstanceObject::from_value(
            &DynamicValue::object([("x".to_string(), Dynamic::Bool(true))]),
            9,
        )
        .unwrap();

        let (upgraded, diags) =
            upgrade_resource_instance_object(&Context::new(), &handle, &schemas(3), &addr, &prior)
                .await;

        assert!(!diags.has_errors());
        assert_eq!(upgraded.unwrap().schema_version, 9);
    }

    #[tokio::test]
    async fn move_translates_source_type_state() {
        let mock = Arc::new(MockProvider::new(schemas(3)));
        let handle = mock.clone() as Arc<dyn ProviderHandle>;
        let stored = DynamicValue::object([("a".to_string(), Dynamic::String("kept".into()))]);
        let prior = ResourceInstanceObject::from_value(&stored, 2).unwrap();

        let (moved, diags) = move_resource_instance_object(
            &Context::new(),
            &handle,
            &schemas(3),
            &managed_addr(),
            &addrs::Provider::default("aws_legacy"),
            "aws_legacy_instance",
            &prior,
        )
        .await;

        assert!(!diags.has_errors());
        let moved = moved.unwrap();
        assert_eq!(moved.schema_version, 3);
        assert_eq!(
            moved.decoded_value().unwrap().get_string(&crate::types::AttributePath::new("a")).unwrap(),
            "kept"
        );
        assert!(mock
            .logged()
            .contains(&"move_resource_state:aws_instance".to_string()));
    }
}
