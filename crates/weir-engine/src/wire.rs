//! Batch wire format: self-describing Arrow IPC framing.
//!
//! The Arrow schema metadata carries the schema name, the 128-bit
//! fingerprint, and the import timestamp, so a decoded batch restores its
//! identity without an external table. Used for the transport boundary
//! between nodes and for persistence.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use weir_types::types::{
    from_arrow_schema, to_arrow_schema, Fingerprint, FINGERPRINT_KEY, IMPORT_TIME_KEY,
};
use weir_types::value::{format_timestamp, parse_timestamp};
use weir_types::{Batch, EngineError, SchemaRegistry};

/// Serialize one batch to Arrow IPC stream bytes.
pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, EngineError> {
    let mut arrow_schema = to_arrow_schema(batch.schema())?;
    if let Some(import_time) = batch.import_time() {
        arrow_schema
            .metadata
            .insert(IMPORT_TIME_KEY.to_string(), format_timestamp(import_time));
    }
    let arrow_schema = Arc::new(arrow_schema);
    let rewrapped =
        RecordBatch::try_new(arrow_schema.clone(), batch.record_batch().columns().to_vec())?;
    let mut buf = Vec::with_capacity(batch.approx_bytes() as usize + 1024);
    let mut writer = StreamWriter::try_new(&mut buf, &arrow_schema)?;
    writer.write(&rewrapped)?;
    writer.finish()?;
    Ok(buf)
}

/// Decode Arrow IPC stream bytes into batches, re-interning the schema and
/// verifying its fingerprint.
pub fn decode_batches(bytes: &[u8], registry: &SchemaRegistry) -> Result<Vec<Batch>, EngineError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let arrow_schema = reader.schema();
    let ty = from_arrow_schema(&arrow_schema)?;
    if let Some(expected) = arrow_schema
        .metadata()
        .get(FINGERPRINT_KEY)
        .and_then(|hex| Fingerprint::from_hex(hex))
    {
        let actual = ty.fingerprint();
        if actual != expected {
            return Err(EngineError::format(format!(
                "schema fingerprint mismatch: descriptor says {expected}, structure hashes to {actual}"
            )));
        }
    }
    let import_time = arrow_schema
        .metadata()
        .get(IMPORT_TIME_KEY)
        .and_then(|raw| parse_timestamp(raw));
    let schema = registry.intern(ty);
    let mut batches = Vec::new();
    for maybe_batch in reader {
        let record_batch = maybe_batch?;
        batches.push(Batch::try_new(schema.clone(), record_batch, import_time)?);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weir_types::array::build_array;
    use weir_types::value::Value;
    use weir_types::{Field, Type, TypeKind};

    fn sample_batch(registry: &SchemaRegistry) -> Batch {
        let schema = registry.intern(Type::named(
            "conn",
            TypeKind::Record(vec![
                Field::new("src", Type::new(TypeKind::Ip)),
                Field::new("elapsed", Type::new(TypeKind::Duration)),
                Field::new("bytes", Type::new(TypeKind::UInt64)),
            ]),
        ));
        let fields = schema.record_fields().unwrap();
        let columns = vec![
            build_array(
                &fields[0].ty,
                &[Value::Ip("10.0.0.1".parse().unwrap()), Value::Null],
            )
            .unwrap(),
            build_array(
                &fields[1].ty,
                &[
                    Value::Duration(chrono::TimeDelta::seconds(3)),
                    Value::Duration(chrono::TimeDelta::milliseconds(250)),
                ],
            )
            .unwrap(),
            build_array(&fields[2].ty, &[Value::UInt(42), Value::UInt(7)]).unwrap(),
        ];
        let arrow_schema = Arc::new(to_arrow_schema(&schema).unwrap());
        let record_batch = RecordBatch::try_new(arrow_schema, columns).unwrap();
        Batch::try_new(schema, record_batch, Some(Utc::now())).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_fingerprint_and_rows() {
        let registry = SchemaRegistry::new();
        let batch = sample_batch(&registry);
        let bytes = encode_batch(&batch).unwrap();
        let decoded = decode_batches(&bytes, &registry).unwrap();
        assert_eq!(decoded.len(), 1);
        let back = &decoded[0];
        assert_eq!(back.rows(), 2);
        assert_eq!(back.schema().fingerprint(), batch.schema().fingerprint());
        assert_eq!(back.schema_name(), "conn");
        assert_eq!(
            back.value_at(0, 0).unwrap(),
            Value::Ip("10.0.0.1".parse().unwrap())
        );
        assert_eq!(back.value_at(0, 1).unwrap(), Value::Null);
        assert_eq!(
            back.value_at(1, 1).unwrap(),
            Value::Duration(chrono::TimeDelta::milliseconds(250))
        );
    }

    #[test]
    fn test_decoded_schema_is_interned() {
        let registry = SchemaRegistry::new();
        let batch = sample_batch(&registry);
        let bytes = encode_batch(&batch).unwrap();
        let decoded = decode_batches(&bytes, &registry).unwrap();
        assert!(Arc::ptr_eq(decoded[0].schema(), batch.schema()));
    }

    #[test]
    fn test_import_time_survives_the_wire() {
        let registry = SchemaRegistry::new();
        let batch = sample_batch(&registry);
        let bytes = encode_batch(&batch).unwrap();
        let decoded = decode_batches(&bytes, &registry).unwrap();
        assert_eq!(
            decoded[0].import_time().map(format_timestamp),
            batch.import_time().map(format_timestamp)
        );
    }

    #[test]
    fn test_garbage_is_a_format_error() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            decode_batches(b"not an ipc stream", &registry),
            Err(EngineError::Format(_))
        ));
    }
}
