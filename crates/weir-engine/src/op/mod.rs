//! The operator contract.
//!
//! An operator is a source, transformation, or sink over element streams.
//! Instantiation yields a suspended state machine that the execution node
//! resumes; [`Signal::Pending`] is the universal cooperative-yield token
//! that returns control to the scheduler.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use weir_types::{Diagnostic, DiagnosticHandler, EngineError, SchemaRegistry};

use crate::config::EngineConfig;
use crate::element::{Element, ElementKind};

pub mod discard;
pub mod head;
pub mod load;
pub mod pass;
pub mod read_json;
pub mod save;
pub mod sort;
pub mod write_json;

/// Where an operator must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// At the local process.
    Local,
    /// At a remote node; this host rejects such operators at spawn time.
    Remote,
}

/// Whether downstream still depends on the input order being preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrder {
    Ordered,
    Unordered,
}

/// Result of asking an operator to optimize itself.
pub enum Optimized {
    /// Keep the operator; `order` is what it requires from upstream.
    Keep { order: EventOrder },
    /// The operator has no effect and removes itself.
    Remove,
    /// Substitute a different operator.
    Replace(Box<dyn Operator>, EventOrder),
}

/// What an operator resumption produced.
#[derive(Debug)]
pub enum Signal {
    /// One output element.
    Yield(Element),
    /// Nothing to produce right now; control returns to the scheduler.
    Pending,
    /// The operator is finished and has released its resources.
    Done,
}

/// What a pull from the inbound buffer produced.
#[derive(Debug)]
pub enum Pull {
    Element(Element),
    /// The buffer is empty but upstream is still alive.
    Pending,
    /// Upstream has terminated.
    Done,
}

/// Shared context handed to `instantiate`.
#[derive(Clone)]
pub struct OperatorEnv {
    pub diagnostics: Arc<dyn DiagnosticHandler>,
    pub registry: Arc<SchemaRegistry>,
    pub config: Arc<EngineConfig>,
}

/// Per-resumption view of the hosting execution node.
pub struct OperatorCtx<'a> {
    inbound: &'a mut VecDeque<Element>,
    input_done: bool,
    cancelled: bool,
    consumed: &'a mut bool,
    diagnostics: &'a Arc<dyn DiagnosticHandler>,
}

impl<'a> OperatorCtx<'a> {
    pub(crate) fn new(
        inbound: &'a mut VecDeque<Element>,
        input_done: bool,
        cancelled: bool,
        consumed: &'a mut bool,
        diagnostics: &'a Arc<dyn DiagnosticHandler>,
    ) -> Self {
        Self { inbound, input_done, cancelled, consumed, diagnostics }
    }

    /// Take the next buffered input element.
    pub fn pull(&mut self) -> Pull {
        match self.inbound.pop_front() {
            Some(element) => {
                *self.consumed = true;
                Pull::Element(element)
            }
            None if self.input_done => Pull::Done,
            None => Pull::Pending,
        }
    }

    /// Whether cancellation has been requested. A cancelled operator must
    /// finish at its current resumption without emitting further elements.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticHandler> {
        self.diagnostics
    }

    pub fn warn(&self, message: impl Into<String>) {
        Diagnostic::warning(message).emit(&**self.diagnostics);
    }

    pub fn error(&self, message: impl Into<String>) {
        Diagnostic::error(message).emit(&**self.diagnostics);
    }
}

/// A pipeline operator.
pub trait Operator: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// The output element kind for a given input kind, or a type error when
    /// the operator does not accept that input.
    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError>;

    /// Create the suspended state machine for one run.
    fn instantiate(&self, env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError>;

    /// Optimization hook; the default keeps the operator and demands
    /// ordered input.
    fn optimize(&self, order: EventOrder) -> Optimized {
        let _ = order;
        Optimized::Keep { order: EventOrder::Ordered }
    }

    fn location(&self) -> Location {
        Location::Local
    }

    /// Detached operators must not share a scheduler thread with their
    /// neighbors (blocking I/O).
    fn detached(&self) -> bool {
        false
    }

    /// Canonical textual form; parsing it back yields an equal operator.
    fn print(&self) -> String;
}

/// The suspended generator of an instantiated operator.
pub trait OperatorState: Send {
    /// Resume the operator. At most one element is yielded per resumption;
    /// long loops must return [`Signal::Pending`] at their natural
    /// boundaries.
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError>;
}

/// Type error helper shared by the built-in operators.
pub(crate) fn reject_input(name: &str, input: ElementKind, wanted: &str) -> EngineError {
    EngineError::type_error(format!(
        "operator `{name}` expects {wanted} as input, got {input}"
    ))
}
