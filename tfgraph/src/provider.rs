//! Provider plugin interface consumed by the engine
//!
//! The engine never talks to infrastructure directly; every operation goes
//! through a `ProviderHandle`. Handles come from per-FQN factories and live
//! until the walk's close vertex for that provider configuration runs.

use crate::addrs;
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::schema::Schema;
use crate::types::{AttributePath, Diagnostic, Diagnostics, DynamicValue, RawState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory producing a live provider handle. One registered per provider FQN.
pub type ProviderFactory =
    Arc<dyn Fn() -> Result<Arc<dyn ProviderHandle>> + Send + Sync>;

/// The set of factories the engine was invoked with.
pub type ProviderFactories = HashMap<addrs::Provider, ProviderFactory>;

/// A live provider plugin. All operations take a cancellation context and
/// return a response carrying diagnostics; none of them panic across the
/// boundary.
#[async_trait]
pub trait ProviderHandle: Send + Sync {
    /// Self-described schemas for the provider block and every object type.
    async fn get_schema(&self, ctx: Context) -> GetSchemaResponse;

    async fn validate_provider_config(
        &self,
        ctx: Context,
        request: ValidateProviderConfigRequest,
    ) -> ValidateProviderConfigResponse;

    async fn configure_provider(
        &self,
        ctx: Context,
        request: ConfigureProviderRequest,
    ) -> ConfigureProviderResponse;

    /// Bring a stored object up to the current schema version.
    async fn upgrade_resource_state(
        &self,
        ctx: Context,
        request: UpgradeResourceStateRequest,
    ) -> UpgradeResourceStateResponse;

    /// Translate state stored under a different resource type or provider.
    async fn move_resource_state(
        &self,
        ctx: Context,
        request: MoveResourceStateRequest,
    ) -> MoveResourceStateResponse;

    async fn read_resource(&self, ctx: Context, request: ReadResourceRequest)
        -> ReadResourceResponse;

    async fn plan_resource_change(
        &self,
        ctx: Context,
        request: PlanResourceChangeRequest,
    ) -> PlanResourceChangeResponse;

    async fn apply_resource_change(
        &self,
        ctx: Context,
        request: ApplyResourceChangeRequest,
    ) -> ApplyResourceChangeResponse;

    async fn import_resource_state(
        &self,
        ctx: Context,
        request: ImportResourceStateRequest,
    ) -> ImportResourceStateResponse;

    async fn read_data_source(
        &self,
        ctx: Context,
        request: ReadDataSourceRequest,
    ) -> ReadDataSourceResponse;

    /// Open an ephemeral resource for the duration of the walk.
    async fn open_ephemeral_resource(
        &self,
        ctx: Context,
        request: OpenEphemeralResourceRequest,
    ) -> OpenEphemeralResourceResponse;

    /// Close an ephemeral resource opened earlier in the walk.
    async fn close_ephemeral_resource(
        &self,
        ctx: Context,
        request: CloseEphemeralResourceRequest,
    ) -> CloseEphemeralResourceResponse;

    /// Called when the provider's close vertex runs. Releases the underlying
    /// plugin process or in-process resources.
    async fn close(&self, ctx: Context) -> CloseProviderResponse;
}

/// Response with every schema the provider serves.
#[derive(Debug, Clone, Default)]
pub struct GetSchemaResponse {
    pub provider: Option<Schema>,
    pub resource_schemas: HashMap<String, Schema>,
    pub data_source_schemas: HashMap<String, Schema>,
    pub ephemeral_schemas: HashMap<String, Schema>,
    pub diagnostics: Diagnostics,
}

impl GetSchemaResponse {
    /// Synthetic response for a provider that could not be loaded. Cached so
    /// later lookups do not retry, and so callers get diagnostics instead of
    /// a crash.
    pub fn synthetic_error(provider: &addrs::Provider, detail: impl Into<String>) -> Self {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(
            Diagnostic::error("Failed to load provider schema", detail)
                .with_address(provider.to_string()),
        );
        Self {
            diagnostics,
            ..Self::default()
        }
    }

    /// Schema for an object address, regardless of mode.
    pub fn schema_for(&self, resource: &addrs::Resource) -> Option<&Schema> {
        match resource.mode {
            addrs::ResourceMode::Managed => self.resource_schemas.get(&resource.type_name),
            addrs::ResourceMode::Data => self.data_source_schemas.get(&resource.type_name),
            addrs::ResourceMode::Ephemeral => self.ephemeral_schemas.get(&resource.type_name),
        }
    }
}

pub struct ValidateProviderConfigRequest {
    pub config: DynamicValue,
}

pub struct ValidateProviderConfigResponse {
    pub diagnostics: Diagnostics,
}

pub struct ConfigureProviderRequest {
    pub config: DynamicValue,
}

pub struct ConfigureProviderResponse {
    pub diagnostics: Diagnostics,
}

pub struct UpgradeResourceStateRequest {
    pub type_name: String,
    /// Schema version the payload was stored under.
    pub version: u64,
    pub raw_state: RawState,
}

pub struct UpgradeResourceStateResponse {
    pub upgraded_state: DynamicValue,
    pub diagnostics: Diagnostics,
}

pub struct MoveResourceStateRequest {
    pub source_provider: addrs::Provider,
    pub source_type_name: String,
    pub source_schema_version: u64,
    pub source_state: RawState,
    pub source_private: Vec<u8>,
    pub target_type_name: String,
}

pub struct MoveResourceStateResponse {
    pub target_state: DynamicValue,
    pub target_private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

pub struct ReadResourceRequest {
    pub type_name: String,
    pub current_state: DynamicValue,
    pub private: Vec<u8>,
}

pub struct ReadResourceResponse {
    /// `None` means the remote object no longer exists.
    pub new_state: Option<DynamicValue>,
    pub private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

pub struct PlanResourceChangeRequest {
    pub type_name: String,
    pub prior_state: DynamicValue,
    pub proposed_new_state: DynamicValue,
    pub config: DynamicValue,
    pub prior_private: Vec<u8>,
}

pub struct PlanResourceChangeResponse {
    pub planned_state: DynamicValue,
    pub requires_replace: Vec<AttributePath>,
    pub planned_private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

pub struct ApplyResourceChangeRequest {
    pub type_name: String,
    pub prior_state: DynamicValue,
    pub planned_state: DynamicValue,
    pub config: DynamicValue,
    pub planned_private: Vec<u8>,
}

pub struct ApplyResourceChangeResponse {
    pub new_state: DynamicValue,
    pub private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

pub struct ImportResourceStateRequest {
    pub type_name: String,
    pub id: String,
}

pub struct ImportedResource {
    pub type_name: String,
    pub state: DynamicValue,
    pub private: Vec<u8>,
}

pub struct ImportResourceStateResponse {
    pub imported_resources: Vec<ImportedResource>,
    pub diagnostics: Diagnostics,
}

pub struct ReadDataSourceRequest {
    pub type_name: String,
    pub config: DynamicValue,
}

pub struct ReadDataSourceResponse {
    pub state: Option<DynamicValue>,
    pub diagnostics: Diagnostics,
}

pub struct OpenEphemeralResourceRequest {
    pub type_name: String,
    pub config: DynamicValue,
}

pub struct OpenEphemeralResourceResponse {
    pub result: DynamicValue,
    pub private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

pub struct CloseEphemeralResourceRequest {
    pub type_name: String,
    pub private: Vec<u8>,
}

pub struct CloseEphemeralResourceResponse {
    pub diagnostics: Diagnostics,
}

pub struct CloseProviderResponse {
    pub error: Option<String>,
}

/// Configured handles live here during a walk, keyed by the provider
/// configuration address that configured them. Close vertices remove and
/// release them.
#[derive(Default)]
pub struct ProviderRegistry {
    handles: std::sync::Mutex<HashMap<String, Arc<dyn ProviderHandle>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: &addrs::AbsProviderConfig, handle: Arc<dyn ProviderHandle>) {
        self.handles
            .lock()
            .expect("provider registry lock poisoned")
            .insert(addr.to_string(), handle);
    }

    pub fn get(&self, addr: &addrs::AbsProviderConfig) -> Result<Arc<dyn ProviderHandle>> {
        self.handles
            .lock()
            .expect("provider registry lock poisoned")
            .get(&addr.to_string())
            .cloned()
            .ok_or_else(|| EngineError::ProviderNotFound(addr.to_string()))
    }

    pub fn remove(&self, addr: &addrs::AbsProviderConfig) -> Option<Arc<dyn ProviderHandle>> {
        self.handles
            .lock()
            .expect("provider registry lock poisoned")
            .remove(&addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_schema_response_carries_error() {
        let provider = addrs::Provider::default("nonexistent");
        let resp = GetSchemaResponse::synthetic_error(&provider, "no factory registered");

        assert!(resp.diagnostics.has_errors());
        assert!(resp.resource_schemas.is_empty());
    }

    #[test]
    fn schema_lookup_respects_resource_mode() {
        let mut resp = GetSchemaResponse::default();
        resp.resource_schemas.insert(
            "aws_instance".to_string(),
            crate::schema::SchemaBuilder::new().version(1).build(),
        );

        assert!(resp.schema_for(&addrs::Resource::managed("aws_instance", "x")).is_some());
        assert!(resp.schema_for(&addrs::Resource::data("aws_instance", "x")).is_none());
    }
}
