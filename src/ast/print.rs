//! Deterministic single-line printer.
//!
//! The printed form of a minimized query doubles as the pending-request
//! key, so output must be byte-stable for equal documents: one space
//! between tokens, arguments in document order, fragments in name order.

use std::fmt::Write;

use super::{
    AstValue, Document, Field, FragmentDefinition, InlineFragment, Operation, Selection, TypeRef,
};

pub fn print_document(document: &Document) -> String {
    let mut out = String::new();
    for operation in &document.operations {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&print_operation(operation));
    }
    for fragment in document.fragments.values() {
        if !out.is_empty() {
            out.push(' ');
        }
        print_fragment(&mut out, fragment);
    }
    out
}

pub fn print_operation(operation: &Operation) -> String {
    let mut out = String::new();
    out.push_str(operation.kind.keyword());
    if let Some(name) = &operation.name {
        out.push(' ');
        out.push_str(name);
    }
    if !operation.variable_definitions.is_empty() {
        out.push('(');
        for (i, def) in operation.variable_definitions.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "${}: {}", def.name, print_type(&def.var_type));
            if let Some(default) = &def.default_value {
                let _ = write!(out, " = {}", print_value(default));
            }
        }
        out.push(')');
    }
    out.push(' ');
    print_selection_set(&mut out, &operation.selection_set);
    out
}

pub fn print_type(type_ref: &TypeRef) -> String {
    match type_ref {
        TypeRef::Named(name) => name.clone(),
        TypeRef::NonNull(inner) => format!("{}!", print_type(inner)),
        TypeRef::List(inner) => format!("[{}]", print_type(inner)),
    }
}

fn print_fragment(out: &mut String, fragment: &FragmentDefinition) {
    let _ = write!(out, "fragment {} on {} ", fragment.name, fragment.type_condition);
    print_selection_set(out, &fragment.selection_set);
}

fn print_selection_set(out: &mut String, selections: &[Selection]) {
    out.push('{');
    for selection in selections {
        out.push(' ');
        match selection {
            Selection::Field(field) => print_field(out, field),
            Selection::InlineFragment(fragment) => print_inline_fragment(out, fragment),
            Selection::FragmentSpread(spread) => {
                let _ = write!(out, "...{}", spread.name);
            }
        }
    }
    out.push_str(" }");
}

fn print_field(out: &mut String, field: &Field) {
    if let Some(alias) = &field.alias {
        let _ = write!(out, "{alias}: ");
    }
    out.push_str(&field.name);
    if !field.arguments.is_empty() {
        out.push('(');
        for (i, argument) in field.arguments.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}: {}", argument.name, print_value(&argument.value));
        }
        out.push(')');
    }
    if !field.selection_set.is_empty() {
        out.push(' ');
        print_selection_set(out, &field.selection_set);
    }
}

fn print_inline_fragment(out: &mut String, fragment: &InlineFragment) {
    out.push_str("...");
    if let Some(condition) = &fragment.type_condition {
        let _ = write!(out, " on {condition}");
    }
    out.push(' ');
    print_selection_set(out, &fragment.selection_set);
}

fn print_value(value: &AstValue) -> String {
    match value {
        AstValue::Variable(name) => format!("${name}"),
        AstValue::Int(n) => n.to_string(),
        AstValue::Float(n) => n.to_string(),
        // serde_json handles the escaping rules GraphQL shares with JSON
        AstValue::String(s) => serde_json::Value::String(s.clone()).to_string(),
        AstValue::Boolean(b) => b.to_string(),
        AstValue::Null => "null".to_string(),
        AstValue::Enum(name) => name.clone(),
        AstValue::List(items) => {
            let inner: Vec<String> = items.iter().map(print_value).collect();
            format!("[{}]", inner.join(", "))
        }
        AstValue::Object(fields) => {
            let inner: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{k}: {}", print_value(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}
