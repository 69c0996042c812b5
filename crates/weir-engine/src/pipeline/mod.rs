//! Pipeline AST, type inference, and implicit closure.
//!
//! A pipeline is an ordered sequence of operators. Element kinds compose
//! left to right; a pipeline that does not start from `void` or end in
//! `void` is closed by inserting implicit sources (`load -`, `read json`)
//! and sinks (`write json`, `save -`).

use std::fmt;

use weir_types::EngineError;

use crate::element::ElementKind;
use crate::op::{EventOrder, Operator, Optimized};

pub mod parser;
pub mod registry;

pub use parser::parse_pipeline;
pub use registry::Registry;

/// An ordered, type-checked chain of operators.
pub struct Pipeline {
    ops: Vec<Box<dyn Operator>>,
}

impl Pipeline {
    pub fn new(ops: Vec<Box<dyn Operator>>) -> Self {
        Self { ops }
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.ops
    }

    pub fn into_operators(self) -> Vec<Box<dyn Operator>> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Compose element kinds left to right. The result has one more entry
    /// than there are operators; entry `i` is the input kind of operator
    /// `i`.
    pub fn infer_types(&self, input: ElementKind) -> Result<Vec<ElementKind>, EngineError> {
        let mut kinds = Vec::with_capacity(self.ops.len() + 1);
        kinds.push(input);
        for op in &self.ops {
            let last = *kinds.last().expect("seeded with the input kind");
            let next = op.infer_type(last).map_err(|e| {
                EngineError::type_error(format!("in operator `{}`: {e}", op.name()))
            })?;
            kinds.push(next);
        }
        Ok(kinds)
    }

    /// Close the pipeline: insert implicit sources and sinks so that it
    /// composes `void → … → void`, and return the operator chain together
    /// with the element kinds at every boundary.
    pub fn close(mut self) -> Result<ClosedPipeline, EngineError> {
        if self.ops.is_empty() {
            return Err(EngineError::syntax("pipeline is empty"));
        }
        let first = &self.ops[0];
        if first.infer_type(ElementKind::Void).is_err() {
            if first.infer_type(ElementKind::Bytes).is_ok() {
                self.ops.insert(0, Box::new(crate::op::load::LoadOperator::stdin()));
            } else if first.infer_type(ElementKind::Events).is_ok() {
                self.ops.insert(
                    0,
                    Box::new(crate::op::read_json::ReadJsonOperator::default()),
                );
                self.ops.insert(0, Box::new(crate::op::load::LoadOperator::stdin()));
            } else {
                return Err(EngineError::type_error(format!(
                    "operator `{}` accepts no pipeline input",
                    first.name()
                )));
            }
        }
        let kinds = self.infer_types(ElementKind::Void)?;
        match kinds.last().expect("non-empty") {
            ElementKind::Void => {}
            ElementKind::Bytes => {
                self.ops.push(Box::new(crate::op::save::SaveOperator::stdout()));
            }
            ElementKind::Events => {
                self.ops
                    .push(Box::new(crate::op::write_json::WriteJsonOperator));
                self.ops.push(Box::new(crate::op::save::SaveOperator::stdout()));
            }
        }
        let kinds = self.infer_types(ElementKind::Void)?;
        if *kinds.last().expect("non-empty") != ElementKind::Void {
            return Err(EngineError::type_error(
                "pipeline cannot be closed into a void → void chain",
            ));
        }
        Ok(ClosedPipeline { ops: self.ops, kinds })
    }

    /// Local optimization pass, right to left: operators may remove or
    /// replace themselves and relax the required event order upstream.
    pub fn optimize(&mut self) {
        let mut order = EventOrder::Ordered;
        let mut index = self.ops.len();
        while index > 0 {
            index -= 1;
            match self.ops[index].optimize(order) {
                Optimized::Keep { order: upstream } => order = upstream,
                Optimized::Remove => {
                    self.ops.remove(index);
                }
                Optimized::Replace(replacement, upstream) => {
                    self.ops[index] = replacement;
                    order = upstream;
                }
            }
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for op in &self.ops {
            if !first {
                f.write_str(" | ")?;
            }
            first = false;
            f.write_str(&op.print())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({self})")
    }
}

/// A closed pipeline ready for execution.
#[derive(Debug)]
pub struct ClosedPipeline {
    pub ops: Vec<Box<dyn Operator>>,
    /// Element kinds at each operator boundary; `kinds[i]` is the input of
    /// `ops[i]`, and both ends are `void`.
    pub kinds: Vec<ElementKind>,
}

impl fmt::Display for ClosedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for op in &self.ops {
            if !first {
                f.write_str(" | ")?;
            }
            first = false;
            f.write_str(&op.print())?;
        }
        Ok(())
    }
}
