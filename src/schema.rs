//! Introspection-shaped schema model.
//!
//! Schema introspection itself is an external collaborator: the host
//! runs the introspection query (or loads a build artifact) and adapts
//! it into this shape once at startup. The cache only ever asks three
//! questions of it: what type does a field have, what mutation is this,
//! and does a concrete type satisfy a fragment condition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ast::TypeRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub query_type: String,
    #[serde(default)]
    pub mutation_type: Option<String>,
    #[serde(default)]
    pub subscription_type: Option<String>,
    pub types: BTreeMap<String, TypeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    /// Concrete member types of a union or implementors of an interface.
    #[serde(default)]
    pub possible_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    /// Composite types can carry selection sets and identity.
    pub fn is_composite(self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: TypeRef,
    #[serde(default)]
    pub args: BTreeMap<String, InputValueDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputValueDefinition {
    pub name: String,
    pub input_type: TypeRef,
}

impl Schema {
    pub fn type_def(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn field_def(&self, parent: &str, field: &str) -> Option<&FieldDefinition> {
        self.types.get(parent)?.fields.get(field)
    }

    /// The innermost named type of `parent.field`, `None` when the
    /// schema does not know the parent (tolerated: the walks degrade to
    /// inlining, never fail).
    pub fn field_named_type(&self, parent: &str, field: &str) -> Option<&str> {
        if field == "__typename" {
            return Some("String");
        }
        Some(self.field_def(parent, field)?.field_type.named())
    }

    /// The mutation root's field for `name`.
    pub fn mutation_field(&self, name: &str) -> Option<&FieldDefinition> {
        let root = self.mutation_type.as_deref()?;
        self.field_def(root, name)
    }

    /// Does concrete type `concrete` satisfy fragment condition
    /// `condition`? True for an exact match and for union/interface
    /// membership.
    pub fn condition_matches(&self, condition: &str, concrete: &str) -> bool {
        if condition == concrete {
            return true;
        }
        self.types
            .get(condition)
            .is_some_and(|def| def.possible_types.iter().any(|t| t == concrete))
    }

    /// Whether `name` is a type whose instances can be entities.
    pub fn is_composite(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(|def| def.kind.is_composite())
    }
}
