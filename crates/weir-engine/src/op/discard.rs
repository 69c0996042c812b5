//! `discard`: consume and drop all input.

use weir_types::EngineError;

use crate::element::ElementKind;
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Pull, Signal};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardOperator;

impl Operator for DiscardOperator {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Bytes | ElementKind::Events => Ok(ElementKind::Void),
            ElementKind::Void => Err(super::reject_input(self.name(), input, "bytes or events")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(DiscardState))
    }

    fn print(&self) -> String {
        "discard".to_string()
    }
}

struct DiscardState;

impl OperatorState for DiscardState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            return Ok(Signal::Done);
        }
        match ctx.pull() {
            Pull::Element(_) => Ok(Signal::Pending),
            Pull::Pending => Ok(Signal::Pending),
            Pull::Done => Ok(Signal::Done),
        }
    }
}

pub struct DiscardFactory;

impl OperatorFactory for DiscardFactory {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        args.expect_end("discard")?;
        Ok((vec![Box::new(DiscardOperator)], args.rest()))
    }
}
