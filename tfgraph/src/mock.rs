//! In-memory provider for tests
//!
//! A configurable `ProviderHandle` with echo semantics: plans return the
//! proposed value, applies return the planned value, reads return the prior
//! value. Tests override individual operations where a scenario needs more.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::context::Context;
use crate::provider::*;
use crate::schema::Schema;
use crate::types::{Diagnostic, Diagnostics, DynamicValue};

type UpgradeFn =
    Box<dyn Fn(&UpgradeResourceStateRequest) -> UpgradeResourceStateResponse + Send + Sync>;
type PlanFn =
    Box<dyn Fn(&PlanResourceChangeRequest) -> PlanResourceChangeResponse + Send + Sync>;

pub struct MockProvider {
    schema: GetSchemaResponse,
    configure_error: Option<String>,
    upgrade_fn: Option<UpgradeFn>,
    plan_fn: Option<PlanFn>,
    /// When set, `get_schema` suspends until a permit is released. Lets
    /// concurrency tests hold fetches in flight.
    schema_gate: Option<Arc<tokio::sync::Semaphore>>,
    /// Ordered log of operations, as `op:type_name` entries.
    pub log: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(schema: GetSchemaResponse) -> Self {
        Self {
            schema,
            configure_error: None,
            upgrade_fn: None,
            plan_fn: None,
            schema_gate: None,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Schema response with a single managed resource type.
    pub fn schema_response_with(type_name: &str, schema: Schema) -> GetSchemaResponse {
        let mut response = GetSchemaResponse::default();
        response
            .resource_schemas
            .insert(type_name.to_string(), schema);
        response
    }

    pub fn with_configure_error(mut self, error: impl Into<String>) -> Self {
        self.configure_error = Some(error.into());
        self
    }

    pub fn with_upgrade(mut self, f: UpgradeFn) -> Self {
        self.upgrade_fn = Some(f);
        self
    }

    pub fn with_plan(mut self, f: PlanFn) -> Self {
        self.plan_fn = Some(f);
        self
    }

    pub fn with_schema_gate(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        self.schema_gate = Some(gate);
        self
    }

    pub fn factory(self: &Arc<Self>) -> ProviderFactory {
        let this = self.clone();
        Arc::new(move || Ok(this.clone() as Arc<dyn ProviderHandle>))
    }

    pub fn logged(&self) -> Vec<String> {
        self.log.lock().expect("mock log lock poisoned").clone()
    }

    fn record(&self, op: &str, type_name: &str) {
        let entry = if type_name.is_empty() {
            op.to_string()
        } else {
            format!("{}:{}", op, type_name)
        };
        self.log.lock().expect("mock log lock poisoned").push(entry);
    }

    fn decode_raw(raw: &crate::types::RawState) -> DynamicValue {
        if let Some(json) = &raw.json {
            return DynamicValue::decode_json(json).unwrap_or_else(|_| DynamicValue::null());
        }
        if let Some(flat) = &raw.flatmap {
            return DynamicValue::object(
                flat.iter()
                    .map(|(k, v)| (k.clone(), crate::types::Dynamic::String(v.clone()))),
            );
        }
        DynamicValue::null()
    }
}

#[async_trait]
impl ProviderHandle for MockProvider {
    async fn get_schema(&self, _ctx: Context) -> GetSchemaResponse {
        self.record("get_schema", "");
        if let Some(gate) = &self.schema_gate {
            let _permit = gate.acquire().await.expect("schema gate closed");
        }
        self.schema.clone()
    }

    async fn validate_provider_config(
        &self,
        _ctx: Context,
        _request: ValidateProviderConfigRequest,
    ) -> ValidateProviderConfigResponse {
        self.record("validate_provider_config", "");
        ValidateProviderConfigResponse {
            diagnostics: Diagnostics::new(),
        }
    }

    async fn configure_provider(
        &self,
        _ctx: Context,
        _request: ConfigureProviderRequest,
    ) -> ConfigureProviderResponse {
        self.record("configure_provider", "");
        let mut diagnostics = Diagnostics::new();
        if let Some(error) = &self.configure_error {
            diagnostics.push(Diagnostic::error("Failed to configure provider", error));
        }
        ConfigureProviderResponse { diagnostics }
    }

    async fn upgrade_resource_state(
        &self,
        _ctx: Context,
        request: UpgradeResourceStateRequest,
    ) -> UpgradeResourceStateResponse {
        self.record("upgrade_resource_state", &request.type_name);
        if let Some(f) = &self.upgrade_fn {
            return f(&request);
        }
        UpgradeResourceStateResponse {
            upgraded_state: Self::decode_raw(&request.raw_state),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn move_resource_state(
        &self,
        _ctx: Context,
        request: MoveResourceStateRequest,
    ) -> MoveResourceStateResponse {
        self.record("move_resource_state", &request.target_type_name);
        MoveResourceStateResponse {
            target_state: Self::decode_raw(&request.source_state),
            target_private: request.source_private.clone(),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn read_resource(
        &self,
        _ctx: Context,
        request: ReadResourceRequest,
    ) -> ReadResourceResponse {
        self.record("read_resource", &request.type_name);
        ReadResourceResponse {
            new_state: Some(request.current_state.clone()),
            private: request.private.clone(),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn plan_resource_change(
        &self,
        _ctx: Context,
        request: PlanResourceChangeRequest,
    ) -> PlanResourceChangeResponse {
        self.record("plan_resource_change", &request.type_name);
        if let Some(f) = &self.plan_fn {
            return f(&request);
        }
        PlanResourceChangeResponse {
            planned_state: request.proposed_new_state.clone(),
            requires_replace: Vec::new(),
            planned_private: request.prior_private.clone(),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn apply_resource_change(
        &self,
        _ctx: Context,
        request: ApplyResourceChangeRequest,
    ) -> ApplyResourceChangeResponse {
        self.record("apply_resource_change", &request.type_name);
        ApplyResourceChangeResponse {
            new_state: request.planned_state.clone(),
            private: request.planned_private.clone(),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn import_resource_state(
        &self,
        _ctx: Context,
        request: ImportResourceStateRequest,
    ) -> ImportResourceStateResponse {
        self.record("import_resource_state", &request.type_name);
        ImportResourceStateResponse {
            imported_resources: vec![ImportedResource {
                type_name: request.type_name.clone(),
                state: DynamicValue::object([(
                    "id".to_string(),
                    crate::types::Dynamic::String(request.id.clone()),
                )]),
                private: Vec::new(),
            }],
            diagnostics: Diagnostics::new(),
        }
    }

    async fn read_data_source(
        &self,
        _ctx: Context,
        request: ReadDataSourceRequest,
    ) -> ReadDataSourceResponse {
        self.record("read_data_source", &request.type_name);
        ReadDataSourceResponse {
            state: Some(request.config.clone()),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn open_ephemeral_resource(
        &self,
        _ctx: Context,
        request: OpenEphemeralResourceRequest,
    ) -> OpenEphemeralResourceResponse {
        self.record("open_ephemeral_resource", &request.type_name);
        OpenEphemeralResourceResponse {
            result: request.config.clone(),
            private: b"ephemeral".to_vec(),
            diagnostics: Diagnostics::new(),
        }
    }

    async fn close_ephemeral_resource(
        &self,
        _ctx: Context,
        request: CloseEphemeralResourceRequest,
    ) -> CloseEphemeralResourceResponse {
        self.record("close_ephemeral_resource", &request.type_name);
        CloseEphemeralResourceResponse {
            diagnostics: Diagnostics::new(),
        }
    }

    async fn close(&self, _ctx: Context) -> CloseProviderResponse {
        self.record("close", "");
        CloseProviderResponse { error: None }
    }
}

/// Factories map with a single mock provider under the default FQN for a
/// local name.
pub fn single_provider_factories(
    local_name: &str,
    provider: &Arc<MockProvider>,
) -> ProviderFactories {
    let mut factories = HashMap::new();
    factories.insert(crate::addrs::Provider::default(local_name), provider.factory());
    factories
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;

    #[tokio::test]
    async fn mock_provider_echoes_plan() {
        let provider = MockProvider::new(MockProvider::schema_response_with(
            "test_thing",
            SchemaBuilder::new().build(),
        ));
        let proposed = DynamicValue::object([(
            "name".to_string(),
            crate::types::Dynamic::String("x".into()),
        )]);

        let response = provider
            .plan_resource_change(
                Context::new(),
                PlanResourceChangeRequest {
                    type_name: "test_thing".to_string(),
                    prior_state: DynamicValue::null(),
                    proposed_new_state: proposed.clone(),
                    config: proposed.clone(),
                    prior_private: Vec::new(),
                },
            )
            .await;

        assert_eq!(response.planned_state, proposed);
        assert_eq!(provider.logged(), vec!["plan_resource_change:test_thing"]);
    }
}
