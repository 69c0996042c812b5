//! `head`: forward the first N events, then terminate.

use weir_types::EngineError;

use crate::element::{Element, ElementKind};
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Pull, Signal};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

const DEFAULT_COUNT: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadOperator {
    pub count: u64,
}

impl Operator for HeadOperator {
    fn name(&self) -> &'static str {
        "head"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Events => Ok(ElementKind::Events),
            other => Err(super::reject_input(self.name(), other, "events")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(HeadState { remaining: self.count }))
    }

    fn print(&self) -> String {
        format!("head {}", self.count)
    }
}

struct HeadState {
    remaining: u64,
}

impl OperatorState for HeadState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() || self.remaining == 0 {
            return Ok(Signal::Done);
        }
        match ctx.pull() {
            Pull::Element(Element::Events(batch)) => {
                let rows = batch.rows() as u64;
                if rows == 0 {
                    return Ok(Signal::Pending);
                }
                if rows <= self.remaining {
                    self.remaining -= rows;
                    Ok(Signal::Yield(Element::Events(batch)))
                } else {
                    let taken = batch.slice(0, self.remaining as usize);
                    self.remaining = 0;
                    Ok(Signal::Yield(Element::Events(taken)))
                }
            }
            Pull::Element(other) => Err(EngineError::logic(format!(
                "`head` received {} input",
                other.kind()
            ))),
            Pull::Pending => Ok(Signal::Pending),
            Pull::Done => Ok(Signal::Done),
        }
    }
}

pub struct HeadFactory;

impl OperatorFactory for HeadFactory {
    fn name(&self) -> &'static str {
        "head"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        let count = match args.peek_word() {
            Some(word) => {
                args.next_word();
                word.parse::<u64>().map_err(|_| {
                    EngineError::invalid_argument(format!(
                        "`{word}` is not a valid event count for `head`"
                    ))
                })?
            }
            None => DEFAULT_COUNT,
        };
        args.expect_end("head")?;
        Ok((vec![Box::new(HeadOperator { count })], args.rest()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_count() {
        let (ops, _) = HeadFactory.parse("").unwrap();
        assert_eq!(ops[0].print(), "head 10");
    }

    #[test]
    fn test_parse_explicit_count() {
        let (ops, rest) = HeadFactory.parse(" 3 | pass").unwrap();
        assert_eq!(ops[0].print(), "head 3");
        assert!(rest.starts_with('|'));
        assert!(HeadFactory.parse(" many").is_err());
    }

    #[test]
    fn test_infer_type_rejects_bytes() {
        let op = HeadOperator { count: 1 };
        assert!(op.infer_type(ElementKind::Bytes).is_err());
        assert_eq!(op.infer_type(ElementKind::Events).unwrap(), ElementKind::Events);
    }
}
