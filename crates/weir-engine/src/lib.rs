//! Pipeline execution engine for security and observability telemetry.
//!
//! A pipeline string parses into a linear chain of operators; the engine
//! type-checks the chain, closes it with implicit sources and sinks, and
//! drives one execution node per operator to completion while collecting
//! diagnostics and per-operator metrics.

pub mod builder;
pub mod config;
pub mod element;
pub mod exec;
pub mod json;
pub mod op;
pub mod pipeline;
pub mod wire;

pub use config::EngineConfig;
pub use element::{Chunk, Element, ElementKind};
pub use exec::{Executor, RunOutcome};
pub use pipeline::{parse_pipeline, Pipeline, Registry};
