//! GraphQL document model.
//!
//! Parsing is an external collaborator: hosts hand the cache a
//! [`DocumentSource`] that turns query text into [`Document`]s. The
//! model itself is the tagged-variant walker vocabulary shared by the
//! normalizer, denormalizer, minimizer, and mutation engine.

mod print;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use print::{print_document, print_operation, print_type};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DocumentError {
    /// The source string was never registered with the document source.
    #[error("unknown query source; register it with the document source")]
    UnknownSource,

    #[error("document defines no executable operation")]
    NoOperation,

    #[error("document defines multiple operations; exactly one is required")]
    MultipleOperations,

    #[error("document spreads unknown fragment {0:?}")]
    UnknownFragment(String),
}

/// Factory seam for GraphQL parsing.
pub trait DocumentSource {
    fn document(&self, source: &str) -> Result<Rc<Document>, DocumentError>;
}

/// A `DocumentSource` over pre-parsed documents keyed by their source
/// text. Hosts that parse ahead of time (or tests that build documents
/// by hand) register each document under the exact string the
/// application will query with.
#[derive(Default)]
pub struct StaticSource {
    documents: BTreeMap<String, Rc<Document>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: impl Into<String>, document: Document) {
        self.documents.insert(source.into(), Rc::new(document));
    }
}

impl DocumentSource for StaticSource {
    fn document(&self, source: &str) -> Result<Rc<Document>, DocumentError> {
        self.documents
            .get(source)
            .cloned()
            .ok_or(DocumentError::UnknownSource)
    }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub fragments: BTreeMap<String, FragmentDefinition>,
}

impl Document {
    /// A document holding exactly one operation and no fragments.
    pub fn single(operation: Operation) -> Self {
        Self {
            operations: vec![operation],
            fragments: BTreeMap::new(),
        }
    }

    /// The one executable operation of this document.
    pub fn operation(&self) -> Result<&Operation, DocumentError> {
        match self.operations.as_slice() {
            [] => Err(DocumentError::NoOperation),
            [op] => Ok(op),
            _ => Err(DocumentError::MultipleOperations),
        }
    }

    pub fn fragment(&self, name: &str) -> Result<&FragmentDefinition, DocumentError> {
        self.fragments
            .get(name)
            .ok_or_else(|| DocumentError::UnknownFragment(name.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variable_definitions: Vec<VariableDefinition>,
    pub selection_set: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    pub var_type: TypeRef,
    #[serde(default)]
    pub default_value: Option<AstValue>,
}

/// Wrapped type reference (`[Post!]!` and friends).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeRef {
    Named(String),
    NonNull(Box<TypeRef>),
    List(Box<TypeRef>),
}

impl TypeRef {
    /// The innermost named type.
    pub fn named(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::NonNull(inner) | TypeRef::List(inner) => inner.named(),
        }
    }

    pub fn is_list(&self) -> bool {
        match self {
            TypeRef::Named(_) => false,
            TypeRef::List(_) => true,
            TypeRef::NonNull(inner) => inner.is_list(),
        }
    }
}

/// One visitor arm per node kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Field(Field),
    InlineFragment(InlineFragment),
    FragmentSpread(FragmentSpread),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    #[serde(default)]
    pub selection_set: Vec<Selection>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            selection_set: Vec::new(),
        }
    }

    /// The key this field occupies in a response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: AstValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InlineFragment {
    #[serde(default)]
    pub type_condition: Option<String>,
    pub selection_set: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpread {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    pub selection_set: Vec<Selection>,
}

/// Argument and default values as written in the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstValue {
    Variable(String),
    Int(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
    Enum(String),
    List(Vec<AstValue>),
    Object(BTreeMap<String, AstValue>),
}

impl AstValue {
    /// Record every `$variable` referenced from this value.
    pub fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            AstValue::Variable(name) => {
                out.insert(name.clone());
            }
            AstValue::List(items) => {
                for item in items {
                    item.collect_variables(out);
                }
            }
            AstValue::Object(fields) => {
                for value in fields.values() {
                    value.collect_variables(out);
                }
            }
            _ => {}
        }
    }
}

/// Every `$variable` referenced from a selection set's arguments.
pub fn selection_variables(selections: &[Selection], out: &mut BTreeSet<String>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                for argument in &field.arguments {
                    argument.value.collect_variables(out);
                }
                selection_variables(&field.selection_set, out);
            }
            Selection::InlineFragment(fragment) => {
                selection_variables(&fragment.selection_set, out);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

/// Every fragment spread reachable from a selection set.
pub fn selection_spreads(selections: &[Selection], out: &mut BTreeSet<String>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => selection_spreads(&field.selection_set, out),
            Selection::InlineFragment(fragment) => {
                selection_spreads(&fragment.selection_set, out)
            }
            Selection::FragmentSpread(spread) => {
                out.insert(spread.name.clone());
            }
        }
    }
}
