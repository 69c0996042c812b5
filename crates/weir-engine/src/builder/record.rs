//! The dynamic row tree behind the push-style builder API.
//!
//! A row is assembled as a tree of nodes before it is routed to a
//! per-schema series builder. The guards returned by `record()`, `field()`,
//! and `list()` borrow into the tree; dropping them leaves the row pending
//! until the next row begins or the builder flushes.

use weir_types::value::{parse_scalar, Value};
use weir_types::TypeKind;

/// One node of an in-progress row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    /// Field created but never written. Treated as null.
    Unset,
    Null,
    Scalar(Value),
    /// A deferred scalar, parsed at finish with the resolved column type.
    Unparsed(String),
    Record(RecordNode),
    List(ListNode),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RecordNode {
    /// Fields in first-insertion order.
    pub(crate) fields: Vec<(String, Node)>,
}

impl RecordNode {
    pub(crate) fn field_mut(&mut self, name: &str) -> &mut Node {
        if let Some(index) = self.fields.iter().position(|(n, _)| n == name) {
            return &mut self.fields[index].1;
        }
        self.fields.push((name.to_string(), Node::Unset));
        &mut self.fields.last_mut().expect("just pushed").1
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Node> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, node)| node)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Node> {
        let index = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(index).1)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ListNode {
    pub(crate) items: Vec<Node>,
}

/// Settings shared by all guards of one builder.
#[derive(Debug, Default)]
pub(crate) struct BuildCtx {
    /// Separator that desugars `a.b.c` field names into nested records.
    pub(crate) unnest_separator: Option<String>,
    /// When set, deferred scalars stay plain strings instead of being
    /// re-parsed as richer types.
    pub(crate) raw: bool,
}

/// Guard for writing fields of a record.
pub struct RecordRef<'a> {
    node: &'a mut RecordNode,
    ctx: &'a BuildCtx,
}

impl<'a> RecordRef<'a> {
    pub(crate) fn new(node: &'a mut RecordNode, ctx: &'a BuildCtx) -> Self {
        Self { node, ctx }
    }

    /// Select a field, applying the configured unflatten separator: with
    /// separator `.`, `field("a.b")` is `exact_field("a").record().field("b")`.
    pub fn field(&mut self, name: &str) -> FieldRef<'_> {
        let ctx = self.ctx;
        match &ctx.unnest_separator {
            Some(separator) if name.contains(separator.as_str()) => {
                let mut current: &mut RecordNode = self.node;
                let mut parts = name.split(separator.as_str()).peekable();
                loop {
                    let part = parts.next().expect("split yields at least one part");
                    if parts.peek().is_none() {
                        return FieldRef { node: current.field_mut(part), ctx };
                    }
                    let node = current.field_mut(part);
                    if !matches!(node, Node::Record(_)) {
                        *node = Node::Record(RecordNode::default());
                    }
                    let Node::Record(next) = node else { unreachable!() };
                    current = next;
                }
            }
            _ => self.exact_field(name),
        }
    }

    /// Select a field by exact name, without unflattening.
    pub fn exact_field(&mut self, name: &str) -> FieldRef<'_> {
        FieldRef { node: self.node.field_mut(name), ctx: self.ctx }
    }
}

/// Guard for writing one field.
pub struct FieldRef<'a> {
    node: &'a mut Node,
    ctx: &'a BuildCtx,
}

impl<'a> FieldRef<'a> {
    /// Set the field to a scalar value.
    pub fn data(&mut self, value: impl Into<Value>) {
        let value = value.into();
        debug_assert!(
            !matches!(value, Value::List(_) | Value::Record(_)),
            "structured values must be written through list()/record()"
        );
        *self.node = Node::Scalar(value);
    }

    /// Set the field to a deferred scalar, parsed once the column type is
    /// resolved.
    pub fn data_unparsed(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.ctx.raw {
            *self.node = Node::Scalar(Value::String(text));
        } else {
            *self.node = Node::Unparsed(text);
        }
    }

    pub fn null(&mut self) {
        *self.node = Node::Null;
    }

    /// Set the field to a record, returning a guard for its fields. An
    /// existing record is extended rather than replaced.
    pub fn record(self) -> RecordRef<'a> {
        if !matches!(self.node, Node::Record(_)) {
            *self.node = Node::Record(RecordNode::default());
        }
        let Node::Record(record) = self.node else { unreachable!() };
        RecordRef::new(record, self.ctx)
    }

    /// Set the field to a list, returning a guard for its items.
    pub fn list(self) -> ListRef<'a> {
        if !matches!(self.node, Node::List(_)) {
            *self.node = Node::List(ListNode::default());
        }
        let Node::List(list) = self.node else { unreachable!() };
        ListRef { node: list, ctx: self.ctx }
    }
}

/// Guard for appending items to a list.
pub struct ListRef<'a> {
    node: &'a mut ListNode,
    ctx: &'a BuildCtx,
}

impl<'a> ListRef<'a> {
    pub fn data(&mut self, value: impl Into<Value>) {
        let value = value.into();
        debug_assert!(
            !matches!(value, Value::List(_) | Value::Record(_)),
            "structured values must be written through list()/record()"
        );
        self.node.items.push(Node::Scalar(value));
    }

    pub fn data_unparsed(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.ctx.raw {
            self.node.items.push(Node::Scalar(Value::String(text)));
        } else {
            self.node.items.push(Node::Unparsed(text));
        }
    }

    pub fn null(&mut self) {
        self.node.items.push(Node::Null);
    }

    pub fn record(&mut self) -> RecordRef<'_> {
        self.node.items.push(Node::Record(RecordNode::default()));
        let Some(Node::Record(record)) = self.node.items.last_mut() else {
            unreachable!()
        };
        RecordRef::new(record, self.ctx)
    }

    pub fn list(&mut self) -> ListRef<'_> {
        self.node.items.push(Node::List(ListNode::default()));
        let Some(Node::List(list)) = self.node.items.last_mut() else {
            unreachable!()
        };
        ListRef { node: list, ctx: self.ctx }
    }
}

// ── Signatures ──────────────────────────────────────────────────────

const SIG_UNKNOWN: u8 = 0x00;
const SIG_BOOL: u8 = 0x10;
const SIG_INT64: u8 = 0x11;
const SIG_UINT64: u8 = 0x12;
const SIG_DOUBLE: u8 = 0x13;
const SIG_STRING: u8 = 0x14;
const SIG_BLOB: u8 = 0x15;
const SIG_DURATION: u8 = 0x16;
const SIG_TIMESTAMP: u8 = 0x17;
const SIG_IP: u8 = 0x18;
const SIG_SUBNET: u8 = 0x19;
const SIG_LIST: u8 = 0x20;
const SIG_RECORD: u8 = 0x21;

fn scalar_tag(value: &Value) -> u8 {
    match TypeKind::of_scalar(value) {
        Some(TypeKind::Bool) => SIG_BOOL,
        Some(TypeKind::Int64) => SIG_INT64,
        Some(TypeKind::UInt64) => SIG_UINT64,
        Some(TypeKind::Double) => SIG_DOUBLE,
        Some(TypeKind::String) => SIG_STRING,
        Some(TypeKind::Blob) => SIG_BLOB,
        Some(TypeKind::Duration) => SIG_DURATION,
        Some(TypeKind::Timestamp) => SIG_TIMESTAMP,
        Some(TypeKind::Ip) => SIG_IP,
        Some(TypeKind::Subnet) => SIG_SUBNET,
        _ => SIG_UNKNOWN,
    }
}

fn node_signature(node: &Node, out: &mut Vec<u8>) {
    match node {
        Node::Unset | Node::Null => out.push(SIG_UNKNOWN),
        Node::Scalar(value) => out.push(scalar_tag(value)),
        // A deferred scalar signs with the type it would parse as, so that
        // rows land in the same builder whether parsed eagerly or lazily.
        Node::Unparsed(text) => out.push(scalar_tag(&parse_scalar(text))),
        Node::List(list) => {
            out.push(SIG_LIST);
            match list
                .items
                .iter()
                .find(|item| !matches!(item, Node::Null | Node::Unset))
            {
                Some(item) => node_signature(item, out),
                None => out.push(SIG_UNKNOWN),
            }
        }
        Node::Record(record) => record_signature(record, out),
    }
}

/// Compute the byte signature of a row in canonical order: field names
/// sorted, with null fields ordered after non-null fields. The signature is
/// the key into the schema → builder map of the `precise` policy.
pub(crate) fn record_signature(record: &RecordNode, out: &mut Vec<u8>) {
    out.push(SIG_RECORD);
    out.extend_from_slice(&(record.fields.len() as u64).to_le_bytes());
    let mut order: Vec<usize> = (0..record.fields.len()).collect();
    order.sort_by_key(|&i| {
        let (name, node) = &record.fields[i];
        (matches!(node, Node::Null | Node::Unset), name.clone())
    });
    for i in order {
        let (name, node) = &record.fields[i];
        out.extend_from_slice(&(name.len() as u64).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        node_signature(node, out);
    }
}
