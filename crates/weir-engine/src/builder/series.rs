//! Single-schema incremental columnar builder.
//!
//! Rows arrive as dynamic node trees; the builder resolves one column type
//! per field (first non-null value wins, int widens to double) and
//! materializes Arrow-backed batches at finish. Conflicting cells become
//! null with one warning per column; deferred cells parse with the resolved
//! column type.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use weir_types::array::build_array;
use weir_types::types::to_arrow_schema;
use weir_types::value::{parse_as, parse_scalar, Value};
use weir_types::{
    Batch, Diagnostic, DiagnosticHandler, EngineError, Field, SchemaRegistry, Type, TypeKind,
};

use super::record::{Node, RecordNode};

/// Incrementally resolved column type.
#[derive(Debug, Clone)]
enum TypeSlot {
    /// Only null or deferred cells seen so far.
    Unresolved,
    Scalar(TypeKind),
    List(Box<TypeSlot>),
    Record(Vec<(String, TypeSlot)>),
}

impl TypeSlot {
    fn from_type(ty: &Type) -> TypeSlot {
        match &ty.kind {
            TypeKind::List(elem) => TypeSlot::List(Box::new(TypeSlot::from_type(elem))),
            TypeKind::Record(fields) => TypeSlot::Record(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), TypeSlot::from_type(&f.ty)))
                    .collect(),
            ),
            other => TypeSlot::Scalar(other.clone()),
        }
    }

    fn resolve(&self) -> TypeKind {
        match self {
            // A column that never saw a typed value materializes as string.
            TypeSlot::Unresolved => TypeKind::String,
            TypeSlot::Scalar(kind) => kind.clone(),
            TypeSlot::List(elem) => TypeKind::List(Box::new(Type::new(elem.resolve()))),
            TypeSlot::Record(fields) => TypeKind::Record(
                fields
                    .iter()
                    .map(|(name, slot)| Field::new(name.clone(), Type::new(slot.resolve())))
                    .collect(),
            ),
        }
    }
}

pub(crate) struct SeriesBuilder {
    /// Schema name of the output batches; `None` falls back at finish.
    name: Option<String>,
    /// When set, only fields of the seeded schema are accepted.
    schema_only: bool,
    columns: Vec<(String, TypeSlot)>,
    rows: Vec<RecordNode>,
    /// Column paths that already produced a conflict warning.
    warned: BTreeSet<String>,
}

impl SeriesBuilder {
    pub(crate) fn new(seed: Option<&Type>, name: Option<String>, schema_only: bool) -> Self {
        let columns = seed
            .and_then(Type::record_fields)
            .map(|fields| {
                fields
                    .iter()
                    .map(|f| (f.name.clone(), TypeSlot::from_type(&f.ty)))
                    .collect()
            })
            .unwrap_or_default();
        let name = name.or_else(|| seed.and_then(|s| s.name.clone()));
        Self {
            name,
            schema_only: schema_only && seed.is_some(),
            columns,
            rows: Vec::new(),
            warned: BTreeSet::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn pop_row(&mut self) {
        self.rows.pop();
    }

    /// Commit one completed row, merging its structure into the column
    /// types.
    pub(crate) fn push_row(&mut self, row: RecordNode, dh: &dyn DiagnosticHandler) {
        merge_record(
            &mut self.columns,
            &row,
            "",
            self.schema_only,
            &mut self.warned,
            dh,
        );
        self.rows.push(row);
    }

    /// Materialize all committed rows as one batch. Returns `None` when no
    /// rows are pending. Column types stay resolved across batches, so
    /// subsequent batches share the schema fingerprint.
    pub(crate) fn finish(
        &mut self,
        registry: &SchemaRegistry,
        dh: &dyn DiagnosticHandler,
        fallback_name: &str,
    ) -> Result<Option<Batch>, EngineError> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        // Deferred cells of otherwise untyped columns decide the type now.
        for row in &self.rows {
            resolve_unparsed(&mut self.columns, row);
        }
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|(name, slot)| Field::new(name.clone(), Type::new(slot.resolve())))
            .collect();
        let name = self.name.as_deref().unwrap_or(fallback_name);
        let schema = registry.intern(Type::named(name, TypeKind::Record(fields.clone())));
        let mut arrays = Vec::with_capacity(fields.len());
        for field in &fields {
            let cells: Vec<Value> = self
                .rows
                .iter()
                .map(|row| {
                    let node = row.get(&field.name).unwrap_or(&Node::Unset);
                    node_to_value(node, &field.ty.kind, &field.name, dh)
                })
                .collect();
            arrays.push(build_array(&field.ty, &cells)?);
        }
        let arrow_schema = Arc::new(to_arrow_schema(&schema)?);
        // Rows without any field still count; Arrow needs the explicit row
        // count when there are no columns to infer it from.
        let options = arrow::array::RecordBatchOptions::new().with_row_count(Some(self.rows.len()));
        let record_batch =
            arrow::array::RecordBatch::try_new_with_options(arrow_schema, arrays, &options)?;
        self.rows.clear();
        Ok(Some(Batch::try_new(schema, record_batch, Some(Utc::now()))?))
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn slot_label(slot: &TypeSlot) -> String {
    match slot {
        TypeSlot::Unresolved => "null".to_string(),
        TypeSlot::Scalar(kind) => kind.to_string(),
        TypeSlot::List(_) => "list".to_string(),
        TypeSlot::Record(_) => "record".to_string(),
    }
}

fn conflict(
    path: &str,
    existing: &str,
    incoming: &str,
    warned: &mut BTreeSet<String>,
    dh: &dyn DiagnosticHandler,
) {
    if warned.insert(path.to_string()) {
        Diagnostic::warning(format!(
            "conflicting types in field `{path}`: {existing} vs {incoming}"
        ))
        .with_hint("conflicting values are nulled")
        .emit(dh);
    }
}

fn merge_record(
    columns: &mut Vec<(String, TypeSlot)>,
    record: &RecordNode,
    path: &str,
    schema_only: bool,
    warned: &mut BTreeSet<String>,
    dh: &dyn DiagnosticHandler,
) {
    for (name, node) in &record.fields {
        let field_path = join_path(path, name);
        let slot = match columns.iter().position(|(n, _)| n == name) {
            Some(index) => &mut columns[index].1,
            None if schema_only => {
                if warned.insert(field_path.clone()) {
                    Diagnostic::warning(format!(
                        "field `{field_path}` is not part of the schema and is dropped"
                    ))
                    .emit(dh);
                }
                continue;
            }
            None => {
                columns.push((name.clone(), TypeSlot::Unresolved));
                &mut columns.last_mut().expect("just pushed").1
            }
        };
        merge_node(slot, node, &field_path, schema_only, warned, dh);
    }
}

fn merge_node(
    slot: &mut TypeSlot,
    node: &Node,
    path: &str,
    schema_only: bool,
    warned: &mut BTreeSet<String>,
    dh: &dyn DiagnosticHandler,
) {
    match node {
        // Nulls and deferred cells do not constrain the type here.
        Node::Unset | Node::Null | Node::Unparsed(_) => {}
        Node::Scalar(value) => {
            let Some(kind) = TypeKind::of_scalar(value) else {
                return;
            };
            if matches!(slot, TypeSlot::Unresolved) {
                *slot = TypeSlot::Scalar(kind);
                return;
            }
            match slot {
                TypeSlot::Scalar(existing) => {
                    if *existing != kind {
                        match weir_types::types::unify_kinds(existing, &kind) {
                            Some(widened) => *existing = widened,
                            None => {
                                let current = existing.to_string();
                                conflict(path, &current, &kind.to_string(), warned, dh);
                            }
                        }
                    }
                }
                other => {
                    let current = slot_label(other);
                    conflict(path, &current, &kind.to_string(), warned, dh);
                }
            }
        }
        Node::Record(record) => {
            if matches!(slot, TypeSlot::Unresolved) {
                *slot = TypeSlot::Record(Vec::new());
            }
            match slot {
                TypeSlot::Record(fields) => {
                    merge_record(fields, record, path, schema_only, warned, dh);
                }
                other => {
                    let current = slot_label(other);
                    conflict(path, &current, "record", warned, dh);
                }
            }
        }
        Node::List(list) => {
            if matches!(slot, TypeSlot::Unresolved) {
                *slot = TypeSlot::List(Box::new(TypeSlot::Unresolved));
            }
            match slot {
                TypeSlot::List(elem) => {
                    for item in &list.items {
                        merge_node(elem, item, path, schema_only, warned, dh);
                    }
                }
                other => {
                    let current = slot_label(other);
                    conflict(path, &current, "list", warned, dh);
                }
            }
        }
    }
}

/// Resolve still-untyped slots from the first deferred cell that reaches
/// them, mirroring what an eager parse would have inferred.
fn resolve_unparsed(columns: &mut [(String, TypeSlot)], record: &RecordNode) {
    for (name, slot) in columns.iter_mut() {
        if let Some(node) = record.get(name) {
            resolve_unparsed_node(slot, node);
        }
    }
}

fn resolve_unparsed_node(slot: &mut TypeSlot, node: &Node) {
    match (slot, node) {
        (slot @ TypeSlot::Unresolved, Node::Unparsed(text)) => {
            if let Some(kind) = TypeKind::of_scalar(&parse_scalar(text)) {
                *slot = TypeSlot::Scalar(kind);
            }
        }
        (TypeSlot::List(elem), Node::List(list)) => {
            for item in &list.items {
                resolve_unparsed_node(elem, item);
            }
        }
        (TypeSlot::Record(fields), Node::Record(record)) => {
            for (name, slot) in fields.iter_mut() {
                if let Some(node) = record.get(name) {
                    resolve_unparsed_node(slot, node);
                }
            }
        }
        _ => {}
    }
}

fn node_to_value(node: &Node, kind: &TypeKind, path: &str, dh: &dyn DiagnosticHandler) -> Value {
    match node {
        Node::Unset | Node::Null => Value::Null,
        Node::Scalar(value) => value.clone(),
        Node::Unparsed(text) => match parse_as(text, kind) {
            Ok(value) => value,
            Err(_) => {
                Diagnostic::warning(format!(
                    "failed to parse `{text}` as {kind} for field `{path}`"
                ))
                .emit(dh);
                Value::Null
            }
        },
        Node::Record(record) => match kind {
            TypeKind::Record(fields) => Value::Record(
                fields
                    .iter()
                    .map(|f| {
                        let node = record.get(&f.name).unwrap_or(&Node::Unset);
                        let path = join_path(path, &f.name);
                        (f.name.clone(), node_to_value(node, &f.ty.kind, &path, dh))
                    })
                    .collect(),
            ),
            _ => Value::Null,
        },
        Node::List(list) => match kind {
            TypeKind::List(elem) => Value::List(
                list.items
                    .iter()
                    .map(|item| node_to_value(item, &elem.kind, path, dh))
                    .collect(),
            ),
            _ => Value::Null,
        },
    }
}
