//! Shared data model for the weir pipeline engine.
//!
//! This crate defines the closed set of value types events may carry, the
//! structural type model with its 128-bit fingerprint, the columnar batch
//! representation, and the diagnostic/metric records exchanged between the
//! engine and its host.

pub mod array;
pub mod batch;
pub mod diagnostic;
pub mod errors;
pub mod metric;
pub mod schema;
pub mod types;
pub mod value;

pub use batch::Batch;
pub use diagnostic::{Diagnostic, DiagnosticCollector, DiagnosticHandler, Severity, SourceSpan};
pub use errors::EngineError;
pub use metric::{Measurement, OperatorMetrics};
pub use schema::SchemaRegistry;
pub use types::{Field, Fingerprint, Type, TypeKind};
pub use value::{Subnet, Value};
