//! Shared execution context for the normalizer, denormalizer, and
//! minimizer walks.
//!
//! All three traverse the same document against different backings (a
//! server response, the store, a satisfaction map). The context is
//! read-only during a walk: normalization never mutates variables.

pub mod denormalize;
pub mod normalize;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ast::{
    AstValue, Document, DocumentError, Field, FragmentDefinition, Operation, OperationKind,
};
use crate::config::{CacheConfig, PaginationWords};
use crate::schema::Schema;

pub use denormalize::{Denormalized, denormalize};
pub use normalize::normalize;

pub type JsonMap = serde_json::Map<String, Value>;
/// `typeName → idValue → entity body`.
pub type EntityMap = BTreeMap<String, BTreeMap<String, JsonMap>>;

/// Key under which a reference is stored: `{"__ref": "Type:id"}`.
pub const REF_KEY: &str = "__ref";
/// Key wrapping the direction buckets of a paginated field.
pub const PAGED_KEY: &str = "__paged";
pub const TYPENAME_KEY: &str = "__typename";
pub const FRONT_BUCKET: &str = "front";
pub const BACK_BUCKET: &str = "back";

/// Stable identity of a server object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub type_name: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.id)
    }
}

/// A reference string that is not `Type:id` shaped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed entity reference {raw:?}")]
pub struct MalformedRef {
    pub raw: String,
}

impl FromStr for EntityKey {
    type Err = MalformedRef;

    fn from_str(s: &str) -> Result<Self, MalformedRef> {
        let malformed = || MalformedRef { raw: s.to_string() };
        let (type_name, id) = s.split_once(':').ok_or_else(malformed)?;
        if type_name.is_empty() || id.is_empty() {
            return Err(malformed());
        }
        Ok(Self::new(type_name, id))
    }
}

/// A logical query consumer: `(caller_id, instance)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallerKey {
    pub id: String,
    #[serde(default)]
    pub instance: Option<String>,
}

impl CallerKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: None,
        }
    }

    pub fn keyed(id: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: Some(instance.into()),
        }
    }
}

/// A server-shaped response flattened against the store: entity bodies
/// plus the caller's result skeleton (refs in leaf positions).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub entities: EntityMap,
    pub result: Value,
}

impl NormalizedResponse {
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        entity_keys(&self.entities)
    }
}

pub fn entity_keys(entities: &EntityMap) -> Vec<EntityKey> {
    let mut keys = Vec::new();
    for (type_name, ids) in entities {
        for id in ids.keys() {
            keys.push(EntityKey::new(type_name.clone(), id.clone()));
        }
    }
    keys
}

/// Build a `{"__ref": "Type:id"}` leaf.
pub fn make_ref(key: &EntityKey) -> Value {
    let mut map = JsonMap::new();
    map.insert(REF_KEY.to_string(), Value::String(key.to_string()));
    Value::Object(map)
}

/// Read a leaf back as a reference, if it is one.
pub fn as_ref_key(value: &Value) -> Option<EntityKey> {
    value
        .as_object()?
        .get(REF_KEY)?
        .as_str()?
        .parse()
        .ok()
}

/// The direction buckets of a paginated field value, if it is one.
pub fn as_paged(value: &Value) -> Option<&JsonMap> {
    value.as_object()?.get(PAGED_KEY)?.as_object()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageDirection {
    /// `first` / `after`.
    Front,
    /// `last` / `before`.
    Back,
}

impl PageDirection {
    pub fn bucket(self) -> &'static str {
        match self {
            PageDirection::Front => FRONT_BUCKET,
            PageDirection::Back => BACK_BUCKET,
        }
    }
}

/// Resolved pagination arguments of one field occurrence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageArgs {
    pub direction: Option<PageDirection>,
    pub count: Option<u64>,
    pub cursor: Option<String>,
}

pub struct WalkContext<'a> {
    pub operation: &'a Operation,
    pub fragments: &'a BTreeMap<String, FragmentDefinition>,
    pub schema: &'a Schema,
    pub variables: JsonMap,
    pub pagination: &'a PaginationWords,
    pub id_field: &'a str,
}

impl<'a> WalkContext<'a> {
    pub fn new(
        document: &'a Document,
        schema: &'a Schema,
        config: &'a CacheConfig,
        variables: JsonMap,
    ) -> Result<Self, DocumentError> {
        Ok(Self {
            operation: document.operation()?,
            fragments: &document.fragments,
            schema,
            variables,
            pagination: &config.pagination,
            id_field: &config.id_field,
        })
    }

    /// Same context over a different operation (the minimized document
    /// shares variables and fragments with its original).
    pub fn with_operation(&self, operation: &'a Operation) -> Self {
        Self {
            operation,
            fragments: self.fragments,
            schema: self.schema,
            variables: self.variables.clone(),
            pagination: self.pagination,
            id_field: self.id_field,
        }
    }

    pub fn root_type_name(&self) -> &str {
        match self.operation.kind {
            OperationKind::Query => &self.schema.query_type,
            OperationKind::Mutation => self
                .schema
                .mutation_type
                .as_deref()
                .unwrap_or(&self.schema.query_type),
            OperationKind::Subscription => self
                .schema
                .subscription_type
                .as_deref()
                .unwrap_or(&self.schema.query_type),
        }
    }

    /// Evaluate a document value against the variable bag, falling back
    /// to the operation's declared defaults.
    pub fn resolve(&self, value: &AstValue) -> Value {
        match value {
            AstValue::Variable(name) => self.variable(name),
            AstValue::Int(n) => Value::from(*n),
            AstValue::Float(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            AstValue::String(s) => Value::String(s.clone()),
            AstValue::Boolean(b) => Value::Bool(*b),
            AstValue::Null => Value::Null,
            AstValue::Enum(name) => Value::String(name.clone()),
            AstValue::List(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            AstValue::Object(fields) => {
                let mut out = JsonMap::new();
                for (key, value) in fields {
                    out.insert(key.clone(), self.resolve(value));
                }
                Value::Object(out)
            }
        }
    }

    fn variable(&self, name: &str) -> Value {
        if let Some(value) = self.variables.get(name) {
            return value.clone();
        }
        self.operation
            .variable_definitions
            .iter()
            .find(|def| def.name == name)
            .and_then(|def| def.default_value.as_ref())
            .map(|default| self.resolve(default))
            .unwrap_or(Value::Null)
    }

    /// All of a field's arguments, resolved.
    pub fn field_args(&self, field: &Field) -> JsonMap {
        let mut out = JsonMap::new();
        for argument in &field.arguments {
            out.insert(argument.name.clone(), self.resolve(&argument.value));
        }
        out
    }

    pub fn is_paginated(&self, field: &Field) -> bool {
        field
            .arguments
            .iter()
            .any(|arg| self.pagination.is_pagination(&arg.name))
    }

    /// Classify a field's resolved pagination arguments.
    pub fn page_args(&self, field: &Field) -> PageArgs {
        let args = self.field_args(field);
        let words = self.pagination;
        let mut page = PageArgs::default();
        if args.contains_key(&words.first) || args.contains_key(&words.after) {
            page.direction = Some(PageDirection::Front);
            page.count = args.get(&words.first).and_then(Value::as_u64);
            page.cursor = args
                .get(&words.after)
                .and_then(Value::as_str)
                .map(str::to_string);
        } else if args.contains_key(&words.last) || args.contains_key(&words.before) {
            page.direction = Some(PageDirection::Back);
            page.count = args.get(&words.last).and_then(Value::as_u64);
            page.cursor = args
                .get(&words.before)
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        page
    }

    /// Match an inline-fragment or fragment-definition condition
    /// against the concrete type at the walk position.
    pub fn condition_matches(&self, condition: Option<&str>, concrete: &str) -> bool {
        match condition {
            None => true,
            Some(condition) => self.schema.condition_matches(condition, concrete),
        }
    }
}
