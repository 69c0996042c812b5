//! The columnar batch: an immutable slice of events sharing one schema.
//!
//! A batch is a tuple of (interned schema, Arrow record batch, optional
//! import timestamp). Arrow guarantees that every column's length equals the
//! row count; slicing shares the underlying buffers.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use arrow::datatypes::{
    Float64Type, Int64Type, UInt64Type, UInt8Type,
};
use chrono::{DateTime, Utc};

use crate::array::ip_from_bytes;
use crate::errors::EngineError;
use crate::types::{to_arrow_schema, Type, TypeKind};
use crate::value::{Subnet, Value};

#[derive(Debug, Clone)]
pub struct Batch {
    schema: Arc<Type>,
    columns: RecordBatch,
    import_time: Option<DateTime<Utc>>,
}

impl Batch {
    /// Wrap a record batch with its schema handle. The column count must
    /// match the schema's field count; Arrow already enforces equal column
    /// lengths.
    pub fn try_new(
        schema: Arc<Type>,
        columns: RecordBatch,
        import_time: Option<DateTime<Utc>>,
    ) -> Result<Self, EngineError> {
        let fields = schema
            .record_fields()
            .ok_or_else(|| EngineError::logic("batch schema must be a record type"))?;
        if fields.len() != columns.num_columns() {
            return Err(EngineError::logic(format!(
                "schema has {} fields but batch has {} columns",
                fields.len(),
                columns.num_columns()
            )));
        }
        Ok(Self { schema, columns, import_time })
    }

    pub fn schema(&self) -> &Arc<Type> {
        &self.schema
    }

    pub fn schema_name(&self) -> &str {
        self.schema.name.as_deref().unwrap_or("weir.unknown")
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.columns
    }

    pub fn import_time(&self) -> Option<DateTime<Utc>> {
        self.import_time
    }

    pub fn rows(&self) -> usize {
        self.columns.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.num_columns()
    }

    /// Zero-copy slice sharing column storage.
    pub fn slice(&self, offset: usize, length: usize) -> Batch {
        Batch {
            schema: self.schema.clone(),
            columns: self.columns.slice(offset, length),
            import_time: self.import_time,
        }
    }

    /// Underestimate of the referenced buffer bytes.
    pub fn approx_bytes(&self) -> u64 {
        self.columns.get_array_memory_size() as u64
    }

    /// Decode one cell. Column indices follow schema field order.
    pub fn value_at(&self, column: usize, row: usize) -> Result<Value, EngineError> {
        let fields = self
            .schema
            .record_fields()
            .ok_or_else(|| EngineError::logic("batch schema must be a record type"))?;
        let field = fields.get(column).ok_or_else(|| {
            EngineError::logic(format!("column index {column} out of bounds"))
        })?;
        array_value(self.columns.column(column), &field.ty, row)
    }

    /// Decode a cell by top-level field name.
    pub fn value_by_name(&self, name: &str, row: usize) -> Option<Value> {
        let fields = self.schema.record_fields()?;
        let index = fields.iter().position(|f| f.name == name)?;
        self.value_at(index, row).ok()
    }

    /// Decode one row into field/value pairs.
    pub fn row(&self, row: usize) -> Result<Vec<(String, Value)>, EngineError> {
        let fields = self
            .schema
            .record_fields()
            .ok_or_else(|| EngineError::logic("batch schema must be a record type"))?;
        fields
            .iter()
            .enumerate()
            .map(|(i, f)| Ok((f.name.clone(), self.value_at(i, row)?)))
            .collect()
    }

    /// Concatenate batches sharing one schema into a single batch.
    pub fn concat(batches: &[Batch]) -> Result<Batch, EngineError> {
        let first = batches
            .first()
            .ok_or_else(|| EngineError::logic("cannot concatenate zero batches"))?;
        let fingerprint = first.schema.fingerprint();
        for other in &batches[1..] {
            if other.schema.fingerprint() != fingerprint {
                return Err(EngineError::type_error(format!(
                    "cannot concatenate batches of schemas `{}` and `{}`",
                    first.schema_name(),
                    other.schema_name()
                )));
            }
        }
        let arrow_schema = Arc::new(to_arrow_schema(&first.schema)?);
        let merged = arrow::compute::concat_batches(
            &arrow_schema,
            batches.iter().map(Batch::record_batch),
        )?;
        Batch::try_new(first.schema.clone(), merged, first.import_time)
    }
}

/// Decode one position of an array, guided by the logical type.
pub fn array_value(array: &ArrayRef, ty: &Type, row: usize) -> Result<Value, EngineError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match &ty.kind {
        TypeKind::Bool => Value::Bool(array.as_boolean().value(row)),
        TypeKind::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        TypeKind::UInt64 => Value::UInt(array.as_primitive::<UInt64Type>().value(row)),
        TypeKind::Double => Value::Double(array.as_primitive::<Float64Type>().value(row)),
        TypeKind::String => Value::String(array.as_string::<i32>().value(row).to_string()),
        TypeKind::Blob => Value::Blob(array.as_binary::<i32>().value(row).to_vec()),
        TypeKind::Duration => Value::Duration(chrono::TimeDelta::nanoseconds(
            array
                .as_primitive::<arrow::datatypes::DurationNanosecondType>()
                .value(row),
        )),
        TypeKind::Timestamp => Value::Timestamp(DateTime::from_timestamp_nanos(
            array
                .as_primitive::<arrow::datatypes::TimestampNanosecondType>()
                .value(row),
        )),
        TypeKind::Ip => {
            let bytes = array.as_fixed_size_binary().value(row);
            let bytes: [u8; 16] = bytes
                .try_into()
                .map_err(|_| EngineError::format("ip storage must be 16 bytes"))?;
            Value::Ip(ip_from_bytes(bytes))
        }
        TypeKind::Subnet => {
            let structs = array.as_struct();
            let addr_bytes = structs.column(0).as_fixed_size_binary().value(row);
            let addr_bytes: [u8; 16] = addr_bytes
                .try_into()
                .map_err(|_| EngineError::format("subnet storage must be 16 bytes"))?;
            let prefix = structs.column(1).as_primitive::<UInt8Type>().value(row);
            Value::Subnet(Subnet::new(ip_from_bytes(addr_bytes), prefix)?)
        }
        TypeKind::List(elem) => {
            let lists = array.as_list::<i32>();
            let items = lists.value(row);
            let mut out = Vec::with_capacity(items.len());
            for i in 0..items.len() {
                out.push(array_value(&items, elem, i)?);
            }
            Value::List(out)
        }
        TypeKind::Record(fields) => {
            let structs = array.as_struct();
            let mut out = Vec::with_capacity(fields.len());
            for (i, field) in fields.iter().enumerate() {
                out.push((field.name.clone(), array_value(structs.column(i), &field.ty, row)?));
            }
            Value::Record(out)
        }
        TypeKind::Enumeration(variants) => {
            let dict = array.as_dictionary::<UInt8Type>();
            let key = dict.keys().value(row) as usize;
            let variant = variants.get(key).cloned().ok_or_else(|| {
                EngineError::format(format!("enumeration key {key} out of range"))
            })?;
            Value::String(variant)
        }
    };
    Ok(value)
}
