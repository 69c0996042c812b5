//! `write json`: render event batches as NDJSON byte chunks.

use base64::Engine as _;
use serde_json::{Map, Number, Value as JsonValue};
use weir_types::value::{format_duration, format_timestamp, Value};
use weir_types::{Batch, EngineError};

use crate::element::{Chunk, Element, ElementKind};
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Pull, Signal};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteJsonOperator;

impl Operator for WriteJsonOperator {
    fn name(&self) -> &'static str {
        "write"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Events => Ok(ElementKind::Bytes),
            other => Err(super::reject_input(self.name(), other, "events")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(WriteJsonState))
    }

    fn print(&self) -> String {
        "write json".to_string()
    }
}

struct WriteJsonState;

impl OperatorState for WriteJsonState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            return Ok(Signal::Done);
        }
        match ctx.pull() {
            Pull::Element(Element::Events(batch)) => {
                let rendered = render_batch(&batch)?;
                if rendered.is_empty() {
                    return Ok(Signal::Pending);
                }
                Ok(Signal::Yield(Element::Bytes(Chunk::new(rendered))))
            }
            Pull::Element(other) => Err(EngineError::logic(format!(
                "`write json` received {} input",
                other.kind()
            ))),
            Pull::Pending => Ok(Signal::Pending),
            Pull::Done => Ok(Signal::Done),
        }
    }
}

fn render_batch(batch: &Batch) -> Result<Vec<u8>, EngineError> {
    let mut out = Vec::with_capacity(batch.approx_bytes() as usize);
    for row in 0..batch.rows() {
        let fields = batch.row(row)?;
        let mut object = Map::with_capacity(fields.len());
        for (name, value) in fields {
            object.insert(name, value_to_json(&value));
        }
        serde_json::to_writer(&mut out, &JsonValue::Object(object))
            .map_err(|e| EngineError::format(format!("failed to render JSON: {e}")))?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Scalars use their round-trippable textual forms; blobs are base64, and
/// non-finite doubles become null (JSON has no NaN).
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(v) => JsonValue::Number((*v).into()),
        Value::UInt(v) => JsonValue::Number((*v).into()),
        Value::Double(v) => match Number::from_f64(*v) {
            Some(n) => JsonValue::Number(n),
            None => JsonValue::Null,
        },
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Blob(bytes) => {
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        Value::Duration(d) => JsonValue::String(format_duration(*d)),
        Value::Timestamp(ts) => JsonValue::String(format_timestamp(*ts)),
        Value::Ip(ip) => JsonValue::String(ip.to_string()),
        Value::Subnet(subnet) => JsonValue::String(subnet.to_string()),
        Value::List(items) => JsonValue::Array(items.iter().map(value_to_json).collect()),
        Value::Record(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), value_to_json(value)))
                .collect(),
        ),
    }
}

pub struct WriteFactory;

impl OperatorFactory for WriteFactory {
    fn name(&self) -> &'static str {
        "write"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        match args.expect_word("a format after `write`")? {
            "json" => {}
            other => {
                return Err(EngineError::lookup(format!("unknown write format `{other}`")));
            }
        }
        args.expect_end("write")?;
        Ok((vec![Box::new(WriteJsonOperator)], args.rest()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_scalar_json_forms() {
        assert_eq!(
            value_to_json(&Value::Duration(TimeDelta::seconds(90))),
            JsonValue::String("90s".into())
        );
        assert_eq!(
            value_to_json(&Value::Ip("10.0.0.1".parse().unwrap())),
            JsonValue::String("10.0.0.1".into())
        );
        assert_eq!(
            value_to_json(&Value::Subnet("10.0.0.0/8".parse().unwrap())),
            JsonValue::String("10.0.0.0/8".into())
        );
        assert_eq!(value_to_json(&Value::Double(f64::NAN)), JsonValue::Null);
        assert_eq!(
            value_to_json(&Value::Blob(vec![1, 2, 3])),
            JsonValue::String("AQID".into())
        );
    }

    #[test]
    fn test_infer_type() {
        let op = WriteJsonOperator;
        assert_eq!(op.infer_type(ElementKind::Events).unwrap(), ElementKind::Bytes);
        assert!(op.infer_type(ElementKind::Bytes).is_err());
    }
}
