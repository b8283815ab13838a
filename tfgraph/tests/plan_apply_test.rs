//! End-to-end plan and apply walks against an in-memory provider: orphan
//! policy, destroy protection, replacement, and finalization ordering.

use std::collections::HashMap;
use std::sync::Arc;

use tfgraph::addrs::{
    AbsProviderConfig, AbsResourceInstance, ConfigResource, InstanceKey, ModuleInstance,
    ModulePath, Provider, Resource,
};
use tfgraph::config::{
    Config, ConfigModule, Lifecycle, ProviderConfigBlock, RemovedBlock, ResourceConfig,
};
use tfgraph::eval::StaticEvaluationContext;
use tfgraph::mock::MockProvider;
use tfgraph::planner::{ChangeAction, PlanMode};
use tfgraph::provider::{GetSchemaResponse, PlanResourceChangeResponse, ProviderFactories};
use tfgraph::schema::{AttributeBuilder, AttributeType, SchemaBuilder};
use tfgraph::state::{ResourceInstanceObject, State};
use tfgraph::types::{AttributePath, Diagnostics, Dynamic, DynamicValue};
use tfgraph::walk::{apply, import, plan, refresh, ImportTarget, WalkRequest};

const SCHEMA_VERSION: u64 = 3;

fn aws_schemas() -> GetSchemaResponse {
    let instance_schema = SchemaBuilder::new()
        .version(SCHEMA_VERSION)
        .attribute(AttributeBuilder::new("ami", AttributeType::String).optional().build())
        .attribute(AttributeBuilder::new("id", AttributeType::String).computed().build())
        .build();
    MockProvider::schema_response_with("aws_instance", instance_schema)
}

fn factories(mock: &Arc<MockProvider>) -> ProviderFactories {
    let mut factories = HashMap::new();
    factories.insert(Provider::default("aws"), mock.factory());
    factories
}

fn root_aws() -> AbsProviderConfig {
    AbsProviderConfig::new(Provider::default("aws"), ModulePath::root(), None)
}

fn instance_addr(name: &str, key: InstanceKey) -> AbsResourceInstance {
    AbsResourceInstance {
        module: ModuleInstance::root(),
        resource: Resource::managed("aws_instance", name),
        key,
    }
}

fn ami_value(ami: &str) -> DynamicValue {
    DynamicValue::object([("ami".to_string(), Dynamic::String(ami.into()))])
}

fn stored_object(ami: &str, skip_destroy: bool) -> ResourceInstanceObject {
    ResourceInstanceObject::from_value(&ami_value(ami), SCHEMA_VERSION)
        .unwrap()
        .with_skip_destroy(skip_destroy)
}

fn empty_config() -> Config {
    Config::new(ConfigModule::new(ModulePath::root()))
}

fn config_with_web(ami: &str, lifecycle: Lifecycle) -> Config {
    let mut root = ConfigModule::new(ModulePath::root());
    root.resources.push(
        ResourceConfig::new(Resource::managed("aws_instance", "web"), ami_value(ami))
            .with_lifecycle(lifecycle),
    );
    Config::new(root)
}

#[tokio::test]
async fn orphan_with_skip_destroy_plans_forget() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let mut state = State::new();
    state.set_instance_current(
        &instance_addr("foo", InstanceKey::None),
        &root_aws(),
        Some(stored_object("ami-1", true)),
    );

    let (plan_out, diags) = plan(
        WalkRequest::new(empty_config(), state, factories(&mock)),
        PlanMode::Normal,
    )
    .await;

    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(plan_out.changes.len(), 1);
    assert_eq!(plan_out.changes[0].action, ChangeAction::Forget);
}

#[tokio::test]
async fn destroying_a_protected_orphan_forgets_and_reports_leftovers() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let mut state = State::new();
    state.set_instance_current(
        &instance_addr("foo", InstanceKey::None),
        &root_aws(),
        Some(stored_object("ami-1", true)),
    );

    let (plan_out, diags) = plan(
        WalkRequest::new(empty_config(), state, factories(&mock)),
        PlanMode::Destroy,
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(plan_out.changes[0].action, ChangeAction::Forget);

    let (applied, apply_diags) = apply(
        WalkRequest::new(empty_config(), State::new(), factories(&mock)),
        &plan_out,
    )
    .await;

    // The walk forgot the object, so the destroy reports the leftover.
    assert!(apply_diags.has_errors());
    assert!(applied.is_empty());

    // Forget never touches the provider's delete path.
    assert!(!mock
        .logged()
        .contains(&"apply_resource_change:aws_instance".to_string()));
}

#[tokio::test]
async fn count_reduction_keeps_protected_instance() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let config = config_with_web("ami-1", Lifecycle::default());

    let mut state = State::new();
    for i in 0..2 {
        state.set_instance_current(
            &instance_addr("web", InstanceKey::Int(i)),
            &root_aws(),
            Some(stored_object("ami-1", false)),
        );
    }
    state.set_instance_current(
        &instance_addr("web", InstanceKey::Int(2)),
        &root_aws(),
        Some(stored_object("ami-1", true)),
    );

    let eval = StaticEvaluationContext::new(config.clone()).with_resource_expansion(
        ConfigResource {
            module: ModulePath::root(),
            resource: Resource::managed("aws_instance", "web"),
        },
        vec![InstanceKey::Int(0), InstanceKey::Int(1)],
    );

    let (plan_out, diags) = plan(
        WalkRequest::new(config, state, factories(&mock)).with_eval(Arc::new(eval)),
        PlanMode::Normal,
    )
    .await;

    assert!(!diags.has_errors(), "{:?}", diags);
    let actions: Vec<ChangeAction> = plan_out.changes.iter().map(|c| c.action).collect();
    assert_eq!(
        actions,
        vec![ChangeAction::NoOp, ChangeAction::NoOp, ChangeAction::Forget]
    );
}

#[tokio::test]
async fn removed_block_overrides_skip_destroy() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let mut root = ConfigModule::new(ModulePath::root());
    root.removed.push(RemovedBlock {
        from: Resource::managed("aws_instance", "foo"),
        destroy: true,
    });
    let config = Config::new(root);

    let mut state = State::new();
    state.set_instance_current(
        &instance_addr("foo", InstanceKey::None),
        &root_aws(),
        Some(stored_object("ami-1", true)),
    );

    let (plan_out, diags) = plan(
        WalkRequest::new(config, state, factories(&mock)),
        PlanMode::Normal,
    )
    .await;

    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(plan_out.changes[0].action, ChangeAction::Delete);
}

#[tokio::test]
async fn create_plan_and_apply_round_trip() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let config = config_with_web("ami-1", Lifecycle::default());

    let (plan_out, diags) = plan(
        WalkRequest::new(config.clone(), State::new(), factories(&mock)),
        PlanMode::Normal,
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(plan_out.changes.len(), 1);
    assert_eq!(plan_out.changes[0].action, ChangeAction::Create);

    let (applied, apply_diags) = apply(
        WalkRequest::new(config, State::new(), factories(&mock)),
        &plan_out,
    )
    .await;
    assert!(!apply_diags.has_errors(), "{:?}", apply_diags);

    let addr = instance_addr("web", InstanceKey::None);
    let object = applied.instance_object(&addr).expect("object in state");
    assert_eq!(object.schema_version, SCHEMA_VERSION);
    let value = object.decoded_value().unwrap();
    assert_eq!(value.get_string(&AttributePath::new("ami")).unwrap(), "ami-1");

    // The provider close vertex ran last.
    assert_eq!(mock.logged().last().map(String::as_str), Some("close"));
}

#[tokio::test]
async fn schema_version_is_monotone_across_cycles() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let config = config_with_web("ami-1", Lifecycle::default());
    let addr = instance_addr("web", InstanceKey::None);

    // Cycle 1: create from empty state.
    let (plan1, _) = plan(
        WalkRequest::new(config.clone(), State::new(), factories(&mock)),
        PlanMode::Normal,
    )
    .await;
    let (state1, _) = apply(
        WalkRequest::new(config.clone(), State::new(), factories(&mock)),
        &plan1,
    )
    .await;
    let v1 = state1.instance_object(&addr).unwrap().schema_version;

    // Cycle 2: steady state.
    let (plan2, diags2) = plan(
        WalkRequest::new(config.clone(), state1, factories(&mock)),
        PlanMode::Normal,
    )
    .await;
    assert!(!diags2.has_errors(), "{:?}", diags2);
    assert_eq!(plan2.changes[0].action, ChangeAction::NoOp);

    let (state2, _) = apply(
        WalkRequest::new(config, State::new(), factories(&mock)),
        &plan2,
    )
    .await;
    let v2 = state2.instance_object(&addr).unwrap().schema_version;

    assert_eq!(v1, SCHEMA_VERSION);
    assert!(v2 >= v1);
}

#[tokio::test]
async fn create_before_destroy_replacement_deposes_then_disposes() {
    let mock = Arc::new(
        MockProvider::new(aws_schemas()).with_plan(Box::new(|req| PlanResourceChangeResponse {
            planned_state: req.proposed_new_state.clone(),
            requires_replace: vec![AttributePath::new("ami")],
            planned_private: req.prior_private.clone(),
            diagnostics: Diagnostics::new(),
        })),
    );
    let lifecycle = Lifecycle {
        destroy: true,
        enabled: true,
        create_before_destroy: true,
    };
    let config = config_with_web("ami-2", lifecycle);
    let addr = instance_addr("web", InstanceKey::None);

    let mut state = State::new();
    state.set_instance_current(&addr, &root_aws(), Some(stored_object("ami-1", false)));

    let (plan_out, diags) = plan(
        WalkRequest::new(config.clone(), state, factories(&mock)),
        PlanMode::Normal,
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(plan_out.changes[0].action, ChangeAction::DeleteThenCreate);

    let (applied, apply_diags) = apply(
        WalkRequest::new(config, State::new(), factories(&mock)),
        &plan_out,
    )
    .await;
    assert!(!apply_diags.has_errors(), "{:?}", apply_diags);

    // Replacement created the new object and disposed of the deposed one.
    let instance = applied.instance(&addr).expect("instance in state");
    assert!(instance.deposed.is_empty());
    let value = instance.current.as_ref().unwrap().decoded_value().unwrap();
    assert_eq!(value.get_string(&AttributePath::new("ami")).unwrap(), "ami-2");

    let applies = mock
        .logged()
        .iter()
        .filter(|entry| entry.as_str() == "apply_resource_change:aws_instance")
        .count();
    assert_eq!(applies, 2);
}

#[tokio::test]
async fn ephemeral_resources_open_and_close_within_the_walk() {
    let mut schemas = aws_schemas();
    schemas.ephemeral_schemas.insert(
        "aws_token".to_string(),
        SchemaBuilder::new().version(1).build(),
    );
    let mock = Arc::new(MockProvider::new(schemas));

    let mut root = ConfigModule::new(ModulePath::root());
    root.provider_configs
        .push(ProviderConfigBlock::new("aws", DynamicValue::null()));
    root.resources.push(ResourceConfig::new(
        Resource::ephemeral("aws_token", "t"),
        DynamicValue::null(),
    ));
    root.resources.push(
        ResourceConfig::new(Resource::managed("aws_instance", "web"), ami_value("ami-1"))
            .with_references(vec![Resource::ephemeral("aws_token", "t")]),
    );
    let config = Config::new(root);

    let (_, diags) = plan(
        WalkRequest::new(config, State::new(), factories(&mock)),
        PlanMode::Normal,
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);

    let log = mock.logged();
    let open = log
        .iter()
        .position(|e| e == "open_ephemeral_resource:aws_token")
        .expect("ephemeral opened");
    let close = log
        .iter()
        .position(|e| e == "close_ephemeral_resource:aws_token")
        .expect("ephemeral closed");
    let provider_close = log
        .iter()
        .rposition(|e| e == "close")
        .expect("provider closed");

    assert!(open < close);
    assert!(close < provider_close);
}

#[tokio::test]
async fn import_brings_object_into_state() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let config = config_with_web("ami-1", Lifecycle::default());
    let addr = instance_addr("web", InstanceKey::None);

    let (state, diags) = import(
        WalkRequest::new(config, State::new(), factories(&mock)),
        vec![ImportTarget {
            addr: addr.clone(),
            id: "i-12345".to_string(),
        }],
    )
    .await;

    assert!(!diags.has_errors(), "{:?}", diags);
    let object = state.instance_object(&addr).expect("imported object");
    let value = object.decoded_value().unwrap();
    assert_eq!(value.get_string(&AttributePath::new("id")).unwrap(), "i-12345");
    assert!(mock
        .logged()
        .contains(&"import_resource_state:aws_instance".to_string()));
}

#[tokio::test]
async fn refresh_reads_every_stored_instance() {
    let mock = Arc::new(MockProvider::new(aws_schemas()));
    let config = config_with_web("ami-1", Lifecycle::default());
    let addr = instance_addr("web", InstanceKey::None);

    let mut state = State::new();
    state.set_instance_current(&addr, &root_aws(), Some(stored_object("ami-1", false)));

    let (refreshed, diags) = refresh(WalkRequest::new(config, state, factories(&mock))).await;

    assert!(!diags.has_errors(), "{:?}", diags);
    assert!(refreshed.instance_object(&addr).is_some());
    assert!(mock
        .logged()
        .contains(&"read_resource:aws_instance".to_string()));
}

#[tokio::test]
async fn data_source_plans_a_read() {
    let mut schemas = aws_schemas();
    schemas.data_source_schemas.insert(
        "aws_ami".to_string(),
        SchemaBuilder::new().version(1).build(),
    );
    let mock = Arc::new(MockProvider::new(schemas));

    let mut root = ConfigModule::new(ModulePath::root());
    root.resources.push(ResourceConfig::new(
        Resource::data("aws_ami", "latest"),
        DynamicValue::object([("owner".to_string(), Dynamic::String("self".into()))]),
    ));
    let config = Config::new(root);

    let (plan_out, diags) = plan(
        WalkRequest::new(config, State::new(), factories(&mock)),
        PlanMode::Normal,
    )
    .await;

    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(plan_out.changes.len(), 1);
    assert_eq!(plan_out.changes[0].action, ChangeAction::Read);
    assert!(plan_out.changes[0].planned.is_some());
}
