//! `pass`: the identity operator. Removed during optimization.

use weir_types::EngineError;

use crate::element::ElementKind;
use crate::op::{
    EventOrder, Operator, OperatorCtx, OperatorEnv, OperatorState, Optimized, Pull, Signal,
};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOperator;

impl Operator for PassOperator {
    fn name(&self) -> &'static str {
        "pass"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Bytes | ElementKind::Events => Ok(input),
            ElementKind::Void => Err(super::reject_input(self.name(), input, "bytes or events")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(PassState))
    }

    fn optimize(&self, _order: EventOrder) -> Optimized {
        Optimized::Remove
    }

    fn print(&self) -> String {
        "pass".to_string()
    }
}

struct PassState;

impl OperatorState for PassState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            return Ok(Signal::Done);
        }
        match ctx.pull() {
            Pull::Element(element) => Ok(Signal::Yield(element)),
            Pull::Pending => Ok(Signal::Pending),
            Pull::Done => Ok(Signal::Done),
        }
    }
}

pub struct PassFactory;

impl OperatorFactory for PassFactory {
    fn name(&self) -> &'static str {
        "pass"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        args.expect_end("pass")?;
        Ok((vec![Box::new(PassOperator)], args.rest()))
    }
}
