//! Structural type model and schema fingerprinting.
//!
//! A [`Type`] is a kind plus an optional name and key/value attributes.
//! Schemas are named record types; their identity is the 128-bit structural
//! [`Fingerprint`], which is deterministic and independent of process
//! identity. The Arrow mapping at the bottom of this module is the single
//! place where logical types meet physical storage.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::{
    DataType, Field as ArrowField, Fields, Schema as ArrowSchema, TimeUnit,
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::errors::EngineError;
use crate::value::Value;

/// Field metadata key tagging logical types that overload an Arrow storage
/// type (`ip`, `subnet`, `enum`).
pub const TYPE_METADATA_KEY: &str = "weir.type";
/// Field metadata key carrying a type's own name.
pub const TYPE_NAME_KEY: &str = "weir.type_name";
/// Field metadata key carrying a type's key/value attributes as JSON.
pub const ATTRIBUTES_KEY: &str = "weir.attributes";
/// Field metadata key carrying enumeration variants as a JSON array.
pub const ENUM_METADATA_KEY: &str = "weir.enum";
/// Schema metadata key carrying the schema name.
pub const SCHEMA_NAME_KEY: &str = "weir.name";
/// Schema metadata key carrying the hex fingerprint.
pub const FINGERPRINT_KEY: &str = "weir.fingerprint";
/// Schema metadata key carrying the RFC 3339 import timestamp of a batch.
pub const IMPORT_TIME_KEY: &str = "weir.import_time";

/// A 128-bit structural schema identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi * 16 + lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| D::Error::custom("invalid fingerprint hex"))
    }
}

/// A named field of a record type. Field order is significant for schema
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self { name: name.into(), ty }
    }
}

/// The closed set of type kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Bool,
    Int64,
    UInt64,
    Double,
    String,
    Blob,
    Duration,
    Timestamp,
    Ip,
    Subnet,
    List(Box<Type>),
    Record(Vec<Field>),
    Enumeration(Vec<String>),
}

impl TypeKind {
    /// The kind a scalar value would infer, if any. Structured values and
    /// null do not infer a kind on their own.
    pub fn of_scalar(value: &Value) -> Option<TypeKind> {
        match value {
            Value::Null | Value::List(_) | Value::Record(_) => None,
            Value::Bool(_) => Some(TypeKind::Bool),
            Value::Int(_) => Some(TypeKind::Int64),
            Value::UInt(_) => Some(TypeKind::UInt64),
            Value::Double(_) => Some(TypeKind::Double),
            Value::String(_) => Some(TypeKind::String),
            Value::Blob(_) => Some(TypeKind::Blob),
            Value::Duration(_) => Some(TypeKind::Duration),
            Value::Timestamp(_) => Some(TypeKind::Timestamp),
            Value::Ip(_) => Some(TypeKind::Ip),
            Value::Subnet(_) => Some(TypeKind::Subnet),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeKind::Int64 | TypeKind::UInt64 | TypeKind::Double)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Bool => f.write_str("bool"),
            TypeKind::Int64 => f.write_str("int64"),
            TypeKind::UInt64 => f.write_str("uint64"),
            TypeKind::Double => f.write_str("double"),
            TypeKind::String => f.write_str("string"),
            TypeKind::Blob => f.write_str("blob"),
            TypeKind::Duration => f.write_str("duration"),
            TypeKind::Timestamp => f.write_str("timestamp"),
            TypeKind::Ip => f.write_str("ip"),
            TypeKind::Subnet => f.write_str("subnet"),
            TypeKind::List(elem) => write!(f, "list<{}>", elem.kind),
            TypeKind::Record(fields) => {
                f.write_str("record{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.ty.kind)?;
                }
                f.write_str("}")
            }
            TypeKind::Enumeration(variants) => {
                write!(f, "enum<{}>", variants.join(", "))
            }
        }
    }
}

/// A type: kind plus optional name and key/value attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub name: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub kind: TypeKind,
}

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Self { name: None, attributes: Vec::new(), kind }
    }

    pub fn named(name: impl Into<String>, kind: TypeKind) -> Self {
        Self { name: Some(name.into()), attributes: Vec::new(), kind }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// The record fields, if this is a record type.
    pub fn record_fields(&self) -> Option<&[Field]> {
        match &self.kind {
            TypeKind::Record(fields) => Some(fields),
            _ => None,
        }
    }

    /// Strip names and attributes recursively. Used for structural equality
    /// checks that should ignore naming.
    pub fn prune(&self) -> Type {
        let kind = match &self.kind {
            TypeKind::List(elem) => TypeKind::List(Box::new(elem.prune())),
            TypeKind::Record(fields) => TypeKind::Record(
                fields
                    .iter()
                    .map(|f| Field::new(f.name.clone(), f.ty.prune()))
                    .collect(),
            ),
            other => other.clone(),
        };
        Type::new(kind)
    }

    /// The deep structural fingerprint. Field order, names, kinds, and
    /// attributes all contribute; two types with equal fingerprints are
    /// interchangeable.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_type(self, &mut hasher);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint(bytes)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.kind),
        }
    }
}

fn hash_str(s: &str, hasher: &mut Sha256) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_type(ty: &Type, hasher: &mut Sha256) {
    match &ty.name {
        Some(name) => {
            hasher.update([1u8]);
            hash_str(name, hasher);
        }
        None => hasher.update([0u8]),
    }
    hasher.update((ty.attributes.len() as u64).to_le_bytes());
    for (key, value) in &ty.attributes {
        hash_str(key, hasher);
        hash_str(value, hasher);
    }
    match &ty.kind {
        TypeKind::Bool => hasher.update([0x10]),
        TypeKind::Int64 => hasher.update([0x11]),
        TypeKind::UInt64 => hasher.update([0x12]),
        TypeKind::Double => hasher.update([0x13]),
        TypeKind::String => hasher.update([0x14]),
        TypeKind::Blob => hasher.update([0x15]),
        TypeKind::Duration => hasher.update([0x16]),
        TypeKind::Timestamp => hasher.update([0x17]),
        TypeKind::Ip => hasher.update([0x18]),
        TypeKind::Subnet => hasher.update([0x19]),
        TypeKind::List(elem) => {
            hasher.update([0x20]);
            hash_type(elem, hasher);
        }
        TypeKind::Record(fields) => {
            hasher.update([0x21]);
            hasher.update((fields.len() as u64).to_le_bytes());
            for field in fields {
                hash_str(&field.name, hasher);
                hash_type(&field.ty, hasher);
            }
        }
        TypeKind::Enumeration(variants) => {
            hasher.update([0x22]);
            hasher.update((variants.len() as u64).to_le_bytes());
            for variant in variants {
                hash_str(variant, hasher);
            }
        }
    }
}

/// Unify two column kinds. `int64`/`uint64` widen to `double` when mixed
/// with another numeric kind; an enumeration degrades to `string`; lists and
/// records unify element-wise. `None` signals a conflict.
pub fn unify_kinds(a: &TypeKind, b: &TypeKind) -> Option<TypeKind> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (a, b) if a.is_numeric() && b.is_numeric() => Some(TypeKind::Double),
        (TypeKind::Enumeration(_), TypeKind::String)
        | (TypeKind::String, TypeKind::Enumeration(_)) => Some(TypeKind::String),
        (TypeKind::List(x), TypeKind::List(y)) => {
            let kind = unify_kinds(&x.kind, &y.kind)?;
            Some(TypeKind::List(Box::new(Type::new(kind))))
        }
        (TypeKind::Record(xs), TypeKind::Record(ys)) => {
            let mut fields: Vec<Field> = xs.to_vec();
            for y in ys {
                match fields.iter_mut().find(|f| f.name == y.name) {
                    Some(existing) => {
                        let kind = unify_kinds(&existing.ty.kind, &y.ty.kind)?;
                        existing.ty = Type::new(kind);
                    }
                    None => fields.push(y.clone()),
                }
            }
            Some(TypeKind::Record(fields))
        }
        _ => None,
    }
}

// ── Arrow mapping ───────────────────────────────────────────────────

fn tagged(field: ArrowField, tag: &str) -> ArrowField {
    let mut metadata = HashMap::new();
    metadata.insert(TYPE_METADATA_KEY.to_string(), tag.to_string());
    field.with_metadata(metadata)
}

/// Convert a type to an Arrow field. All columns are nullable; null
/// positions live solely in the validity bitmap.
pub fn to_arrow_field(name: &str, ty: &Type) -> Result<ArrowField, EngineError> {
    let field = match &ty.kind {
        TypeKind::Bool => ArrowField::new(name, DataType::Boolean, true),
        TypeKind::Int64 => ArrowField::new(name, DataType::Int64, true),
        TypeKind::UInt64 => ArrowField::new(name, DataType::UInt64, true),
        TypeKind::Double => ArrowField::new(name, DataType::Float64, true),
        TypeKind::String => ArrowField::new(name, DataType::Utf8, true),
        TypeKind::Blob => ArrowField::new(name, DataType::Binary, true),
        TypeKind::Duration => {
            ArrowField::new(name, DataType::Duration(TimeUnit::Nanosecond), true)
        }
        TypeKind::Timestamp => ArrowField::new(
            name,
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            true,
        ),
        TypeKind::Ip => tagged(
            ArrowField::new(name, DataType::FixedSizeBinary(16), true),
            "ip",
        ),
        TypeKind::Subnet => {
            let inner = Fields::from(vec![
                ArrowField::new("addr", DataType::FixedSizeBinary(16), true),
                ArrowField::new("prefix", DataType::UInt8, true),
            ]);
            tagged(ArrowField::new(name, DataType::Struct(inner), true), "subnet")
        }
        TypeKind::List(elem) => {
            let item = to_arrow_field("item", elem)?;
            ArrowField::new(name, DataType::List(Arc::new(item)), true)
        }
        TypeKind::Record(fields) => {
            let children = fields
                .iter()
                .map(|f| to_arrow_field(&f.name, &f.ty))
                .collect::<Result<Vec<_>, _>>()?;
            ArrowField::new(name, DataType::Struct(Fields::from(children)), true)
        }
        TypeKind::Enumeration(variants) => {
            let dict = DataType::Dictionary(Box::new(DataType::UInt8), Box::new(DataType::Utf8));
            let mut metadata = HashMap::new();
            metadata.insert(TYPE_METADATA_KEY.to_string(), "enum".to_string());
            metadata.insert(
                ENUM_METADATA_KEY.to_string(),
                serde_json::to_string(variants)
                    .map_err(|e| EngineError::format(format!("enum metadata: {e}")))?,
            );
            ArrowField::new(name, dict, true).with_metadata(metadata)
        }
    };
    // Names and attributes participate in the fingerprint, so the physical
    // form must carry them for the wire round-trip.
    let mut metadata = field.metadata().clone();
    if let Some(type_name) = &ty.name {
        metadata.insert(TYPE_NAME_KEY.to_string(), type_name.clone());
    }
    if !ty.attributes.is_empty() {
        metadata.insert(
            ATTRIBUTES_KEY.to_string(),
            serde_json::to_string(&ty.attributes)
                .map_err(|e| EngineError::format(format!("attribute metadata: {e}")))?,
        );
    }
    Ok(field.with_metadata(metadata))
}

/// Convert a record type to an Arrow schema carrying the schema name and
/// fingerprint in its metadata, which makes serialized batches
/// self-describing.
pub fn to_arrow_schema(ty: &Type) -> Result<ArrowSchema, EngineError> {
    let fields = ty.record_fields().ok_or_else(|| {
        EngineError::logic(format!("schema must be a record type, got {}", ty.kind))
    })?;
    let arrow_fields = fields
        .iter()
        .map(|f| to_arrow_field(&f.name, &f.ty))
        .collect::<Result<Vec<_>, _>>()?;
    let mut metadata = HashMap::new();
    if let Some(name) = &ty.name {
        metadata.insert(SCHEMA_NAME_KEY.to_string(), name.clone());
    }
    if !ty.attributes.is_empty() {
        metadata.insert(
            ATTRIBUTES_KEY.to_string(),
            serde_json::to_string(&ty.attributes)
                .map_err(|e| EngineError::format(format!("attribute metadata: {e}")))?,
        );
    }
    metadata.insert(FINGERPRINT_KEY.to_string(), ty.fingerprint().to_hex());
    Ok(ArrowSchema::new_with_metadata(arrow_fields, metadata))
}

/// Reconstruct a type from an Arrow field, honoring the `weir.type` tag.
pub fn from_arrow_field(field: &ArrowField) -> Result<Type, EngineError> {
    let tagged = match field.metadata().get(TYPE_METADATA_KEY).map(String::as_str) {
        Some("ip") => Some(TypeKind::Ip),
        Some("subnet") => Some(TypeKind::Subnet),
        Some("enum") => {
            let variants = field
                .metadata()
                .get(ENUM_METADATA_KEY)
                .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
                .ok_or_else(|| {
                    EngineError::format("enumeration field is missing its variant list")
                })?;
            Some(TypeKind::Enumeration(variants))
        }
        _ => None,
    };
    let kind = match tagged {
        Some(kind) => kind,
        None => match field.data_type() {
            DataType::Boolean => TypeKind::Bool,
            DataType::Int64 => TypeKind::Int64,
            DataType::UInt64 => TypeKind::UInt64,
            DataType::Float64 => TypeKind::Double,
            DataType::Utf8 => TypeKind::String,
            DataType::Binary => TypeKind::Blob,
            DataType::Duration(TimeUnit::Nanosecond) => TypeKind::Duration,
            DataType::Timestamp(TimeUnit::Nanosecond, _) => TypeKind::Timestamp,
            DataType::List(item) => TypeKind::List(Box::new(from_arrow_field(item)?)),
            DataType::Struct(children) => {
                let fields = children
                    .iter()
                    .map(|child| {
                        Ok(Field::new(child.name().clone(), from_arrow_field(child)?))
                    })
                    .collect::<Result<Vec<_>, EngineError>>()?;
                TypeKind::Record(fields)
            }
            other => {
                return Err(EngineError::format(format!(
                    "unsupported storage type `{other}` for field `{}`",
                    field.name()
                )))
            }
        },
    };
    let mut ty = Type::new(kind);
    ty.name = field.metadata().get(TYPE_NAME_KEY).cloned();
    if let Some(raw) = field.metadata().get(ATTRIBUTES_KEY) {
        ty.attributes = serde_json::from_str(raw)
            .map_err(|e| EngineError::format(format!("malformed attribute metadata: {e}")))?;
    }
    Ok(ty)
}

/// Reconstruct a schema type from an Arrow schema.
pub fn from_arrow_schema(schema: &ArrowSchema) -> Result<Type, EngineError> {
    let fields = schema
        .fields()
        .iter()
        .map(|f| Ok(Field::new(f.name().clone(), from_arrow_field(f)?)))
        .collect::<Result<Vec<_>, EngineError>>()?;
    let mut ty = Type::new(TypeKind::Record(fields));
    ty.name = schema.metadata().get(SCHEMA_NAME_KEY).cloned();
    if let Some(raw) = schema.metadata().get(ATTRIBUTES_KEY) {
        ty.attributes = serde_json::from_str(raw)
            .map_err(|e| EngineError::format(format!("malformed attribute metadata: {e}")))?;
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(name: &str, fields: Vec<(&str, TypeKind)>) -> Type {
        Type::named(
            name,
            TypeKind::Record(
                fields
                    .into_iter()
                    .map(|(n, k)| Field::new(n, Type::new(k)))
                    .collect(),
            ),
        )
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = schema("flow", vec![("src", TypeKind::Ip), ("bytes", TypeKind::UInt64)]);
        let b = schema("flow", vec![("src", TypeKind::Ip), ("bytes", TypeKind::UInt64)]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_field_order() {
        let a = schema("x", vec![("a", TypeKind::Int64), ("b", TypeKind::String)]);
        let b = schema("x", vec![("b", TypeKind::String), ("a", TypeKind::Int64)]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_added_field() {
        let a = schema("x", vec![("a", TypeKind::Int64)]);
        let b = schema("x", vec![("a", TypeKind::Int64), ("b", TypeKind::Bool)]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_type_change() {
        let a = schema("x", vec![("a", TypeKind::Int64)]);
        let b = schema("x", vec![("a", TypeKind::Double)]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_attributes() {
        let a = Type::new(TypeKind::String);
        let b = Type::new(TypeKind::String).with_attribute("index", "hash");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_prune_ignores_names_and_attributes() {
        let a = Type::named("x", TypeKind::Int64).with_attribute("k", "v");
        let b = Type::new(TypeKind::Int64);
        assert_ne!(a, b);
        assert_eq!(a.prune(), b.prune());
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = schema("x", vec![("a", TypeKind::Int64)]).fingerprint();
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
    }

    #[test]
    fn test_unify_widens_int_to_double() {
        assert_eq!(
            unify_kinds(&TypeKind::Int64, &TypeKind::Double),
            Some(TypeKind::Double)
        );
        assert_eq!(
            unify_kinds(&TypeKind::Int64, &TypeKind::UInt64),
            Some(TypeKind::Double)
        );
    }

    #[test]
    fn test_unify_conflict() {
        assert_eq!(unify_kinds(&TypeKind::String, &TypeKind::Int64), None);
        assert_eq!(unify_kinds(&TypeKind::Bool, &TypeKind::Timestamp), None);
    }

    #[test]
    fn test_unify_records_unions_fields() {
        let a = TypeKind::Record(vec![Field::new("a", Type::new(TypeKind::Int64))]);
        let b = TypeKind::Record(vec![
            Field::new("a", Type::new(TypeKind::Int64)),
            Field::new("b", Type::new(TypeKind::String)),
        ]);
        let unified = unify_kinds(&a, &b).unwrap();
        match unified {
            TypeKind::Record(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "a");
                assert_eq!(fields[1].name, "b");
            }
            other => panic!("expected record, got {other}"),
        }
    }

    #[test]
    fn test_arrow_schema_roundtrip() {
        let ty = Type::named(
            "conn",
            TypeKind::Record(vec![
                Field::new("src", Type::new(TypeKind::Ip)),
                Field::new("net", Type::new(TypeKind::Subnet)),
                Field::new("d", Type::new(TypeKind::Duration)),
                Field::new(
                    "tags",
                    Type::new(TypeKind::List(Box::new(Type::new(TypeKind::String)))),
                ),
                Field::new(
                    "nested",
                    Type::new(TypeKind::Record(vec![Field::new(
                        "x",
                        Type::new(TypeKind::Int64),
                    )])),
                ),
            ]),
        );
        let arrow_schema = to_arrow_schema(&ty).unwrap();
        let back = from_arrow_schema(&arrow_schema).unwrap();
        assert_eq!(back.name.as_deref(), Some("conn"));
        assert_eq!(back.prune(), ty.prune());
        assert_eq!(
            arrow_schema.metadata().get(FINGERPRINT_KEY).unwrap(),
            &ty.fingerprint().to_hex()
        );
    }
}
