//! Building Arrow arrays from value cells.
//!
//! The builders accumulate cells as [`Value`]s and materialize whole columns
//! here in one pass, bottom-up. Cells that do not fit the resolved column
//! type become null; numeric cells coerce into a widened double column.

use std::net::IpAddr;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, DictionaryArray, DurationNanosecondArray,
    FixedSizeBinaryArray, Float64Array, Int64Array, ListArray, StringArray, StructArray,
    TimestampNanosecondArray, UInt64Array, UInt8Array,
};
use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow::datatypes::{DataType, Field as ArrowField};

use crate::errors::EngineError;
use crate::types::{to_arrow_field, Type, TypeKind};
use crate::value::Value;

/// 16-byte storage form of an IP address (IPv4 stored v4-mapped).
pub fn ip_to_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Inverse of [`ip_to_bytes`]; v4-mapped addresses decode back to IPv4.
pub fn ip_from_bytes(bytes: [u8; 16]) -> IpAddr {
    let v6 = std::net::Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn duration_nanos(value: &Value) -> Option<i64> {
    match value {
        Value::Duration(d) => d.num_nanoseconds(),
        _ => None,
    }
}

/// Build one column of `ty` from its cells.
pub fn build_array(ty: &Type, cells: &[Value]) -> Result<ArrayRef, EngineError> {
    let field = to_arrow_field("item", ty)?;
    build_array_as(&field, ty, cells)
}

fn build_array_as(
    field: &ArrowField,
    ty: &Type,
    cells: &[Value],
) -> Result<ArrayRef, EngineError> {
    let array: ArrayRef = match &ty.kind {
        TypeKind::Bool => Arc::new(BooleanArray::from_iter(cells.iter().map(|c| match c {
            Value::Bool(b) => Some(*b),
            _ => None,
        }))),
        TypeKind::Int64 => Arc::new(Int64Array::from_iter(cells.iter().map(|c| match c {
            Value::Int(v) => Some(*v),
            _ => None,
        }))),
        TypeKind::UInt64 => Arc::new(UInt64Array::from_iter(cells.iter().map(|c| match c {
            Value::UInt(v) => Some(*v),
            _ => None,
        }))),
        TypeKind::Double => {
            // A widened column may still hold int/uint cells.
            Arc::new(Float64Array::from_iter(cells.iter().map(Value::as_f64)))
        }
        TypeKind::String => Arc::new(StringArray::from_iter(cells.iter().map(|c| match c {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }))),
        TypeKind::Blob => Arc::new(BinaryArray::from_iter(cells.iter().map(|c| match c {
            Value::Blob(b) => Some(b.as_slice()),
            _ => None,
        }))),
        TypeKind::Duration => {
            Arc::new(DurationNanosecondArray::from_iter(cells.iter().map(duration_nanos)))
        }
        TypeKind::Timestamp => Arc::new(
            TimestampNanosecondArray::from_iter(cells.iter().map(|c| match c {
                Value::Timestamp(ts) => ts.timestamp_nanos_opt(),
                _ => None,
            }))
            .with_timezone("UTC"),
        ),
        TypeKind::Ip => {
            let iter = cells.iter().map(|c| match c {
                Value::Ip(ip) => Some(ip_to_bytes(*ip)),
                _ => None,
            });
            Arc::new(
                FixedSizeBinaryArray::try_from_sparse_iter_with_size(iter, 16)
                    .map_err(EngineError::from)?,
            )
        }
        TypeKind::Subnet => {
            let DataType::Struct(inner) = field.data_type() else {
                return Err(EngineError::logic("subnet field must use struct storage"));
            };
            let addrs = FixedSizeBinaryArray::try_from_sparse_iter_with_size(
                cells.iter().map(|c| match c {
                    Value::Subnet(s) => Some(ip_to_bytes(s.addr())),
                    _ => None,
                }),
                16,
            )
            .map_err(EngineError::from)?;
            let prefixes = UInt8Array::from_iter(cells.iter().map(|c| match c {
                Value::Subnet(s) => Some(s.prefix()),
                _ => None,
            }));
            let validity = NullBuffer::from_iter(
                cells.iter().map(|c| matches!(c, Value::Subnet(_))),
            );
            Arc::new(StructArray::new(
                inner.clone(),
                vec![Arc::new(addrs) as ArrayRef, Arc::new(prefixes) as ArrayRef],
                Some(validity),
            ))
        }
        TypeKind::List(elem) => {
            let DataType::List(item_field) = field.data_type() else {
                return Err(EngineError::logic("list field must use list storage"));
            };
            let mut offsets: Vec<i32> = Vec::with_capacity(cells.len() + 1);
            offsets.push(0);
            let mut child_cells: Vec<Value> = Vec::new();
            let mut validity: Vec<bool> = Vec::with_capacity(cells.len());
            for cell in cells {
                match cell {
                    Value::List(items) => {
                        child_cells.extend(items.iter().cloned());
                        validity.push(true);
                    }
                    _ => validity.push(false),
                }
                let len = i32::try_from(child_cells.len()).map_err(|_| {
                    EngineError::format("list column exceeds offset capacity")
                })?;
                offsets.push(len);
            }
            let child = build_array_as(item_field, elem, &child_cells)?;
            Arc::new(ListArray::new(
                item_field.clone(),
                OffsetBuffer::new(offsets.into()),
                child,
                Some(NullBuffer::from_iter(validity)),
            ))
        }
        TypeKind::Record(fields) => {
            let DataType::Struct(inner) = field.data_type() else {
                return Err(EngineError::logic("record field must use struct storage"));
            };
            let mut children: Vec<ArrayRef> = Vec::with_capacity(fields.len());
            for (child_field, arrow_child) in fields.iter().zip(inner.iter()) {
                let child_cells: Vec<Value> = cells
                    .iter()
                    .map(|cell| match cell {
                        Value::Record(pairs) => pairs
                            .iter()
                            .find(|(name, _)| *name == child_field.name)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null),
                        _ => Value::Null,
                    })
                    .collect();
                children.push(build_array_as(arrow_child, &child_field.ty, &child_cells)?);
            }
            let validity = NullBuffer::from_iter(
                cells.iter().map(|c| matches!(c, Value::Record(_))),
            );
            Arc::new(StructArray::new(inner.clone(), children, Some(validity)))
        }
        TypeKind::Enumeration(variants) => {
            let keys = UInt8Array::from_iter(cells.iter().map(|c| match c {
                Value::String(s) => variants
                    .iter()
                    .position(|v| v == s)
                    .and_then(|i| u8::try_from(i).ok()),
                _ => None,
            }));
            let values = StringArray::from(variants.clone());
            Arc::new(
                DictionaryArray::try_new(keys, Arc::new(values)).map_err(EngineError::from)?,
            )
        }
    };
    debug_assert_eq!(array.len(), cells.len());
    Ok(array)
}
