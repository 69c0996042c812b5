//! `sort`: order events by a field across schemas.
//!
//! Sorting is blocking: all input is collected before output begins. Output
//! rows are re-batched so that adjacent rows sharing a schema form one
//! batch.

use std::collections::VecDeque;

use weir_types::value::Value;
use weir_types::{Batch, EngineError};

use crate::element::{Element, ElementKind};
use crate::op::{
    EventOrder, Operator, OperatorCtx, OperatorEnv, OperatorState, Optimized, Pull, Signal,
};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOperator {
    pub field: String,
    pub ascending: bool,
}

impl Operator for SortOperator {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Events => Ok(ElementKind::Events),
            other => Err(super::reject_input(self.name(), other, "events")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(SortState {
            field: self.field.clone(),
            ascending: self.ascending,
            collected: Vec::new(),
            output: VecDeque::new(),
            sorted: false,
        }))
    }

    fn optimize(&self, _order: EventOrder) -> Optimized {
        // Sorting re-establishes order, so upstream may relax it.
        Optimized::Keep { order: EventOrder::Unordered }
    }

    fn print(&self) -> String {
        format!(
            "sort {} {}",
            self.field,
            if self.ascending { "asc" } else { "desc" }
        )
    }
}

struct SortState {
    field: String,
    ascending: bool,
    collected: Vec<Batch>,
    output: VecDeque<Batch>,
    sorted: bool,
}

impl OperatorState for SortState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            return Ok(Signal::Done);
        }
        if !self.sorted {
            match ctx.pull() {
                Pull::Element(Element::Events(batch)) => {
                    if batch.rows() > 0 {
                        self.collected.push(batch);
                    }
                    return Ok(Signal::Pending);
                }
                Pull::Element(other) => {
                    return Err(EngineError::logic(format!(
                        "`sort` received {} input",
                        other.kind()
                    )));
                }
                Pull::Pending => return Ok(Signal::Pending),
                Pull::Done => {
                    self.output = self.sort()?;
                    self.sorted = true;
                }
            }
        }
        match self.output.pop_front() {
            Some(batch) => Ok(Signal::Yield(Element::Events(batch))),
            None => Ok(Signal::Done),
        }
    }
}

impl SortState {
    fn sort(&mut self) -> Result<VecDeque<Batch>, EngineError> {
        let mut keyed: Vec<(Value, usize, usize)> = Vec::new();
        for (batch_index, batch) in self.collected.iter().enumerate() {
            for row in 0..batch.rows() {
                let key = batch.value_by_name(&self.field, row).unwrap_or(Value::Null);
                keyed.push((key, batch_index, row));
            }
        }
        if self.ascending {
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
        } else {
            keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
        }
        // Re-batch: adjacent rows of one schema coalesce into one batch.
        let mut output = VecDeque::new();
        let mut run: Vec<Batch> = Vec::new();
        for (_, batch_index, row) in keyed {
            let slice = self.collected[batch_index].slice(row, 1);
            match run.last() {
                Some(last) if last.schema().fingerprint() == slice.schema().fingerprint() => {
                    run.push(slice);
                }
                Some(_) => {
                    output.push_back(Batch::concat(&run)?);
                    run = vec![slice];
                }
                None => run.push(slice),
            }
        }
        if !run.is_empty() {
            output.push_back(Batch::concat(&run)?);
        }
        self.collected.clear();
        Ok(output)
    }
}

pub struct SortFactory;

impl OperatorFactory for SortFactory {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        let field = args.expect_word("a field name after `sort`")?.to_string();
        let ascending = match args.peek_word() {
            Some("asc") => {
                args.next_word();
                true
            }
            Some("desc") => {
                args.next_word();
                false
            }
            Some(other) => {
                return Err(EngineError::invalid_argument(format!(
                    "expected `asc` or `desc`, got `{other}`"
                )));
            }
            None => true,
        };
        args.expect_end("sort")?;
        Ok((vec![Box::new(SortOperator { field, ascending })], args.rest()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_ascending() {
        let (ops, _) = SortFactory.parse(" t").unwrap();
        assert_eq!(ops[0].print(), "sort t asc");
        let (ops, _) = SortFactory.parse(" t desc").unwrap();
        assert_eq!(ops[0].print(), "sort t desc");
        assert!(SortFactory.parse("").is_err());
        assert!(SortFactory.parse(" t sideways").is_err());
    }

    #[test]
    fn test_relaxes_upstream_order() {
        let op = SortOperator { field: "t".into(), ascending: true };
        assert!(matches!(
            op.optimize(EventOrder::Ordered),
            Optimized::Keep { order: EventOrder::Unordered }
        ));
    }
}
