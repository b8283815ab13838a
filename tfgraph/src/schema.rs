//! Schema types for provider-described object shapes
//!
//! Providers describe the shape of their configuration and of every resource
//! type they serve. The engine uses these schemas two ways: scrubbing stored
//! attributes that no longer exist before a same-version upgrade, and
//! checking that values returned from upgrade/move conform structurally.

use std::collections::HashMap;

use crate::types::Dynamic;

/// The type system for attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeType {
    String,
    Number, // Always f64
    Bool,
    List(Box<AttributeType>),               // Ordered, allows duplicates
    Set(Box<AttributeType>),                // Unordered, no duplicates
    Map(Box<AttributeType>),                // String keys only
    Object(HashMap<String, AttributeType>), // Fixed structure
}

/// Schema returned by providers for one object type.
/// Version drives state migration.
#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u64,
    pub block: Block,
}

/// A configuration block: attributes plus nested blocks.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub attributes: Vec<Attribute>,
    pub block_types: Vec<NestedBlock>,
    pub description: String,
}

impl Block {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn nested_block(&self, name: &str) -> Option<&NestedBlock> {
        self.block_types.iter().find(|b| b.type_name == name)
    }
}

/// A single attribute within a block.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub r#type: AttributeType,
    pub description: String,
    pub required: bool,
    pub optional: bool,
    pub computed: bool,
    pub sensitive: bool,
}

/// A nested configuration block.
#[derive(Debug, Clone)]
pub struct NestedBlock {
    pub type_name: String,
    pub block: Block,
    pub nesting: NestingMode,
}

/// How a nested block is structured in values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NestingMode {
    Single,
    List,
    Set,
    Map,
}

/// Fluent builder for attributes.
pub struct AttributeBuilder {
    attribute: Attribute,
}

impl AttributeBuilder {
    pub fn new(name: &str, type_: AttributeType) -> Self {
        Self {
            attribute: Attribute {
                name: name.to_string(),
                r#type: type_,
                description: String::new(),
                required: false,
                optional: false,
                computed: false,
                sensitive: false,
            },
        }
    }

    pub fn description(mut self, desc: &str) -> Self {
        self.attribute.description = desc.to_string();
        self
    }

    pub fn required(mut self) -> Self {
        self.attribute.required = true;
        self.attribute.optional = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.attribute.optional = true;
        self.attribute.required = false;
        self
    }

    pub fn computed(mut self) -> Self {
        self.attribute.computed = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.attribute.sensitive = true;
        self
    }

    pub fn build(self) -> Attribute {
        self.attribute
    }
}

/// Fluent builder for schemas.
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            schema: Schema {
                version: 0,
                block: Block::default(),
            },
        }
    }

    pub fn version(mut self, version: u64) -> Self {
        self.schema.version = version;
        self
    }

    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.schema.block.attributes.push(attr);
        self
    }

    pub fn block(mut self, block: NestedBlock) -> Self {
        self.schema.block.block_types.push(block);
        self
    }

    pub fn description(mut self, desc: &str) -> Self {
        self.schema.block.description = desc.to_string();
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks whether a value structurally conforms to a block. Returns the list
/// of violations; empty means conformant. Null and unknown leaves conform to
/// any attribute type.
pub fn check_conformance(block: &Block, value: &Dynamic) -> Vec<String> {
    let mut violations = Vec::new();
    check_block(block, value, "", &mut violations);
    violations
}

fn check_block(block: &Block, value: &Dynamic, path: &str, out: &mut Vec<String>) {
    let map = match value {
        Dynamic::Map(m) => m,
        Dynamic::Null | Dynamic::Unknown => return,
        other => {
            out.push(format!(
                "{}: expected object, got {}",
                display_path(path),
                other.type_name()
            ));
            return;
        }
    };

    for (key, val) in map {
        let child_path = join_path(path, key);
        if let Some(attr) = block.attribute(key) {
            if !type_conforms(&attr.r#type, val) {
                out.push(format!(
                    "{}: value of type {} does not conform to attribute type",
                    child_path,
                    val.type_name()
                ));
            }
        } else if let Some(nested) = block.nested_block(key) {
            check_nested_block(nested, val, &child_path, out);
        } else {
            out.push(format!("{}: attribute is not defined in schema", child_path));
        }
    }
}

fn check_nested_block(nested: &NestedBlock, value: &Dynamic, path: &str, out: &mut Vec<String>) {
    match (nested.nesting, value) {
        (_, Dynamic::Null | Dynamic::Unknown) => {}
        (NestingMode::Single, v) => check_block(&nested.block, v, path, out),
        (NestingMode::List | NestingMode::Set, Dynamic::List(items)) => {
            for (i, item) in items.iter().enumerate() {
                check_block(&nested.block, item, &format!("{}[{}]", path, i), out);
            }
        }
        (NestingMode::Map, Dynamic::Map(entries)) => {
            for (k, item) in entries {
                check_block(&nested.block, item, &format!("{}[{:?}]", path, k), out);
            }
        }
        (_, other) => {
            out.push(format!(
                "{}: invalid value of type {} for nested block",
                path,
                other.type_name()
            ));
        }
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "(root)"
    } else {
        path
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// Whether a single value conforms to an attribute type. Null and unknown
/// conform to everything.
pub fn type_conforms(ty: &AttributeType, value: &Dynamic) -> bool {
    match (ty, value) {
        (_, Dynamic::Null | Dynamic::Unknown) => true,
        (AttributeType::String, Dynamic::String(_)) => true,
        (AttributeType::Number, Dynamic::Number(_)) => true,
        (AttributeType::Bool, Dynamic::Bool(_)) => true,
        (AttributeType::List(elem) | AttributeType::Set(elem), Dynamic::List(items)) => {
            items.iter().all(|i| type_conforms(elem, i))
        }
        (AttributeType::Map(elem), Dynamic::Map(entries)) => {
            entries.values().all(|v| type_conforms(elem, v))
        }
        (AttributeType::Object(fields), Dynamic::Map(entries)) => {
            entries.iter().all(|(k, v)| match fields.get(k) {
                Some(field_ty) => type_conforms(field_ty, v),
                None => false,
            })
        }
        _ => false,
    }
}

/// Removes attributes from a value that the block no longer declares,
/// recursing into nested blocks. Returns whether anything was removed.
pub fn scrub_unknown_attributes(block: &Block, value: &mut Dynamic) -> bool {
    let map = match value {
        Dynamic::Map(m) => m,
        _ => return false,
    };

    let mut changed = false;
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        if block.attribute(&key).is_some() {
            continue;
        }
        if let Some(nested) = block.nested_block(&key) {
            let nested = nested.clone();
            if let Some(val) = map.get_mut(&key) {
                changed |= scrub_nested_block(&nested, val);
            }
            continue;
        }
        map.remove(&key);
        changed = true;
    }
    changed
}

fn scrub_nested_block(nested: &NestedBlock, value: &mut Dynamic) -> bool {
    match (nested.nesting, value) {
        (NestingMode::Single, v) => scrub_unknown_attributes(&nested.block, v),
        (NestingMode::List | NestingMode::Set, Dynamic::List(items)) => {
            let mut changed = false;
            for item in items {
                changed |= scrub_unknown_attributes(&nested.block, item);
            }
            changed
        }
        (NestingMode::Map, Dynamic::Map(entries)) => {
            let mut changed = false;
            for item in entries.values_mut() {
                changed |= scrub_unknown_attributes(&nested.block, item);
            }
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_attr_schema() -> Schema {
        SchemaBuilder::new()
            .version(3)
            .attribute(AttributeBuilder::new("a", AttributeType::String).optional().build())
            .attribute(AttributeBuilder::new("b", AttributeType::Number).optional().build())
            .build()
    }

    #[test]
    fn conformant_value_has_no_violations() {
        let schema = two_attr_schema();
        let value = Dynamic::Map(HashMap::from([
            ("a".to_string(), Dynamic::String("x".to_string())),
            ("b".to_string(), Dynamic::Number(1.0)),
        ]));
        assert!(check_conformance(&schema.block, &value).is_empty());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let schema = two_attr_schema();
        let value = Dynamic::Map(HashMap::from([(
            "b".to_string(),
            Dynamic::String("not a number".to_string()),
        )]));
        let violations = check_conformance(&schema.block, &value);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("b"));
    }

    #[test]
    fn undeclared_attribute_is_reported() {
        let schema = two_attr_schema();
        let value = Dynamic::Map(HashMap::from([(
            "gone".to_string(),
            Dynamic::String("x".to_string()),
        )]));
        let violations = check_conformance(&schema.block, &value);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("gone"));
    }

    #[test]
    fn null_and_unknown_conform_to_any_type() {
        assert!(type_conforms(&AttributeType::String, &Dynamic::Null));
        assert!(type_conforms(&AttributeType::Number, &Dynamic::Unknown));
        assert!(type_conforms(
            &AttributeType::List(Box::new(AttributeType::Bool)),
            &Dynamic::Null
        ));
    }

    #[test]
    fn scrub_removes_only_unknown_attributes() {
        let schema = two_attr_schema();
        let mut value = Dynamic::Map(HashMap::from([
            ("a".to_string(), Dynamic::String("x".to_string())),
            ("b".to_string(), Dynamic::Number(1.0)),
            ("gone".to_string(), Dynamic::Bool(true)),
        ]));

        assert!(scrub_unknown_attributes(&schema.block, &mut value));

        let Dynamic::Map(map) = &value else {
            panic!("expected map");
        };
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("a"));
        assert!(map.contains_key("b"));
    }

    #[test]
    fn scrub_is_a_no_op_for_conformant_value() {
        let schema = two_attr_schema();
        let mut value = Dynamic::Map(HashMap::from([(
            "a".to_string(),
            Dynamic::String("x".to_string()),
        )]));
        assert!(!scrub_unknown_attributes(&schema.block, &mut value));
    }

    #[test]
    fn nested_block_conformance_recurses() {
        let schema = SchemaBuilder::new()
            .block(NestedBlock {
                type_name: "rule".to_string(),
                nesting: NestingMode::List,
                block: Block {
                    attributes: vec![AttributeBuilder::new("port", AttributeType::Number)
                        .required()
                        .build()],
                    block_types: vec![],
                    description: String::new(),
                },
            })
            .build();

        let value = Dynamic::Map(HashMap::from([(
            "rule".to_string(),
            Dynamic::List(vec![Dynamic::Map(HashMap::from([(
                "port".to_string(),
                Dynamic::String("not a number".to_string()),
            )]))]),
        )]));

        let violations = check_conformance(&schema.block, &value);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("rule[0]"));
    }
}
