//! Adaptive event builders.
//!
//! [`MultiBuilder`] accepts rows whose schema is discovered per-row and
//! routes each to a per-schema series builder under one of three policies;
//! finished batches flush by size, by timeout, or on demand.

pub(crate) mod record;
pub(crate) mod series;

mod multi;

pub use multi::{MultiBuilder, Policy, Settings};
pub use record::{FieldRef, ListRef, RecordRef};
