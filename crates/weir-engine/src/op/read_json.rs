//! `read json`: turn byte chunks into event batches.
//!
//! Two modes: NDJSON (one value per line, tolerant line splitting) and
//! streaming (concatenated or whitespace-separated values with a carry-over
//! buffer). Strings upgrade to richer scalars through the builder's deferred
//! parsing unless `--raw` is set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};
use weir_types::{Batch, Diagnostic, DiagnosticHandler, EngineError};

use crate::builder::{ListRef, MultiBuilder, Policy, RecordRef, Settings};
use crate::element::{Element, ElementKind};
use crate::json::LineSplitter;
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Pull, Signal};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

/// Documents nested deeper than this abort with a fatal diagnostic.
const MAX_RECURSION_DEPTH: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadJsonOperator {
    /// Newline-delimited mode; the default consumes concatenated values.
    pub ndjson: bool,
    /// Merge all rows into one growing schema instead of precise routing.
    pub merge: bool,
    /// Selector field (and optional name prefix) choosing the schema name.
    pub selector: Option<(String, Option<String>)>,
    /// Drop the selector field from output rows.
    pub unique_selector: bool,
    /// Seed schema name.
    pub schema: Option<String>,
    /// Accept only fields of the seeded/selected schema.
    pub schema_only: bool,
    /// Keep strings as strings instead of trying richer scalar forms.
    pub raw: bool,
    /// Unflatten separator for nested field names.
    pub unnest: Option<String>,
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
}

impl Operator for ReadJsonOperator {
    fn name(&self) -> &'static str {
        "read"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Bytes => Ok(ElementKind::Events),
            other => Err(super::reject_input(self.name(), other, "bytes")),
        }
    }

    fn instantiate(&self, env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        let policy = match (&self.selector, self.merge) {
            (Some((field, prefix)), _) => Policy::Selector {
                field: field.clone(),
                prefix: prefix.clone(),
                unique: self.unique_selector,
            },
            (None, true) => Policy::Merge {
                seed_schema: self.schema.clone(),
                reset_on_yield: false,
            },
            (None, false) => Policy::Precise { seed_schema: self.schema.clone() },
        };
        let settings = Settings {
            schema_only: self.schema_only,
            raw: self.raw,
            unnest_separator: self.unnest.clone(),
            timeout: self.batch_timeout.unwrap_or(env.config.import.batch_timeout),
            desired_batch_size: self.batch_size.unwrap_or(env.config.import.batch_size),
            ..Settings::default()
        };
        let msb = MultiBuilder::new(
            policy,
            settings,
            env.diagnostics.clone(),
            env.registry.clone(),
            Vec::new(),
        )?;
        let mode = if self.ndjson {
            Mode::Ndjson(LineSplitter::new())
        } else {
            Mode::Streaming { buffer: Vec::new() }
        };
        Ok(Box::new(ReadJsonState {
            mode,
            msb,
            ready: VecDeque::new(),
            finalized: false,
        }))
    }

    fn print(&self) -> String {
        let mut out = String::from("read json");
        if self.ndjson {
            out.push_str(" --ndjson");
        }
        if self.merge {
            out.push_str(" --merge");
        }
        if let Some((field, prefix)) = &self.selector {
            out.push_str(" --selector ");
            out.push_str(field);
            if let Some(prefix) = prefix {
                out.push(':');
                out.push_str(prefix);
            }
        }
        if self.unique_selector {
            out.push_str(" --unique-selector");
        }
        if let Some(schema) = &self.schema {
            out.push_str(" --schema ");
            out.push_str(schema);
        }
        if self.schema_only {
            out.push_str(" --schema-only");
        }
        if self.raw {
            out.push_str(" --raw");
        }
        if let Some(unnest) = &self.unnest {
            out.push_str(" --unnest ");
            out.push_str(unnest);
        }
        if let Some(size) = self.batch_size {
            out.push_str(&format!(" --batch-size {size}"));
        }
        if let Some(timeout) = self.batch_timeout {
            let delta = chrono::TimeDelta::from_std(timeout).unwrap_or_default();
            out.push_str(&format!(
                " --batch-timeout {}",
                weir_types::value::format_duration(delta)
            ));
        }
        out
    }
}

enum Mode {
    Ndjson(LineSplitter),
    Streaming { buffer: Vec<u8> },
}

struct ReadJsonState {
    mode: Mode,
    msb: MultiBuilder,
    ready: VecDeque<Batch>,
    finalized: bool,
}

impl OperatorState for ReadJsonState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            return Ok(Signal::Done);
        }
        if let Some(batch) = self.ready.pop_front() {
            return Ok(Signal::Yield(Element::Events(batch)));
        }
        if self.finalized {
            return Ok(Signal::Done);
        }
        match ctx.pull() {
            Pull::Element(Element::Bytes(chunk)) => {
                let dh = ctx.diagnostics().clone();
                self.feed(chunk.data(), &dh)?;
                self.ready.extend(self.msb.yield_ready());
                match self.ready.pop_front() {
                    Some(batch) => Ok(Signal::Yield(Element::Events(batch))),
                    None => Ok(Signal::Pending),
                }
            }
            Pull::Element(other) => Err(EngineError::logic(format!(
                "`read json` received {} input",
                other.kind()
            ))),
            Pull::Pending => {
                // Resumed without input: a chance for timeout-based flushes.
                self.ready.extend(self.msb.yield_ready());
                match self.ready.pop_front() {
                    Some(batch) => Ok(Signal::Yield(Element::Events(batch))),
                    None => Ok(Signal::Pending),
                }
            }
            Pull::Done => {
                let dh = ctx.diagnostics().clone();
                self.finish_input(&dh)?;
                self.ready.extend(self.msb.finalize());
                self.finalized = true;
                match self.ready.pop_front() {
                    Some(batch) => Ok(Signal::Yield(Element::Events(batch))),
                    None => Ok(Signal::Done),
                }
            }
        }
    }
}

impl ReadJsonState {
    fn feed(&mut self, data: &[u8], dh: &Arc<dyn DiagnosticHandler>) -> Result<(), EngineError> {
        match &mut self.mode {
            Mode::Ndjson(splitter) => {
                let msb = &mut self.msb;
                let mut fatal = None;
                splitter.push(data, &mut |line| {
                    if fatal.is_none() {
                        if let Err(e) = parse_line(line, msb, dh) {
                            fatal = Some(e);
                        }
                    }
                });
                match fatal {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Mode::Streaming { buffer } => {
                buffer.extend_from_slice(data);
                let pending = std::mem::take(buffer);
                let consumed = parse_stream(&pending, &mut self.msb, dh)?;
                buffer.extend_from_slice(&pending[consumed..]);
                Ok(())
            }
        }
    }

    fn finish_input(&mut self, dh: &Arc<dyn DiagnosticHandler>) -> Result<(), EngineError> {
        match &mut self.mode {
            Mode::Ndjson(splitter) => {
                let msb = &mut self.msb;
                let mut fatal = None;
                splitter.finish(&mut |line| {
                    if fatal.is_none() {
                        if let Err(e) = parse_line(line, msb, dh) {
                            fatal = Some(e);
                        }
                    }
                });
                match fatal {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Mode::Streaming { buffer } => {
                let pending = std::mem::take(buffer);
                let consumed = parse_stream(&pending, &mut self.msb, dh)?;
                let tail = &pending[consumed..];
                if tail.iter().any(|b| !b.is_ascii_whitespace()) {
                    Diagnostic::warning("truncated JSON value at end of input").emit(&**dh);
                }
                Ok(())
            }
        }
    }
}

/// Parse one NDJSON line. Extra top-level values on the line warn and are
/// dropped.
fn parse_line(
    line: &[u8],
    msb: &mut MultiBuilder,
    dh: &Arc<dyn DiagnosticHandler>,
) -> Result<(), EngineError> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(());
    }
    let mut values = serde_json::Deserializer::from_slice(line).into_iter::<JsonValue>();
    match values.next() {
        None => Ok(()),
        Some(Err(e)) => {
            Diagnostic::warning(format!("failed to parse JSON line: {e}"))
                .with_hint("the line is dropped")
                .emit(&**dh);
            Ok(())
        }
        Some(Ok(value)) => {
            add_event(value, msb, dh)?;
            if values.next().is_some() {
                Diagnostic::warning(
                    "more than one top-level value in NDJSON line; dropping the extra",
                )
                .emit(&**dh);
            }
            Ok(())
        }
    }
}

/// Parse as many complete values as the buffer holds; returns the number of
/// consumed bytes. A malformed (non-truncated) value warns and skips the
/// rest of the buffer.
fn parse_stream(
    buffer: &[u8],
    msb: &mut MultiBuilder,
    dh: &Arc<dyn DiagnosticHandler>,
) -> Result<usize, EngineError> {
    let mut values = serde_json::Deserializer::from_slice(buffer).into_iter::<JsonValue>();
    let mut consumed = 0;
    loop {
        match values.next() {
            Some(Ok(value)) => {
                consumed = values.byte_offset();
                add_event(value, msb, dh)?;
            }
            Some(Err(e)) if e.is_eof() => return Ok(consumed),
            Some(Err(e)) => {
                Diagnostic::warning(format!("failed to parse JSON value: {e}"))
                    .with_hint("skipping the rest of the chunk")
                    .emit(&**dh);
                return Ok(buffer.len());
            }
            None => return Ok(buffer.len()),
        }
    }
}

fn add_event(
    value: JsonValue,
    msb: &mut MultiBuilder,
    dh: &Arc<dyn DiagnosticHandler>,
) -> Result<(), EngineError> {
    let JsonValue::Object(map) = value else {
        Diagnostic::warning(format!(
            "expected a JSON object, got {}; the value is dropped",
            json_kind(&value)
        ))
        .emit(&**dh);
        return Ok(());
    };
    let mut record = msb.record();
    add_object(&mut record, map, 1, dh)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn depth_exceeded(dh: &Arc<dyn DiagnosticHandler>) -> EngineError {
    Diagnostic::error(format!(
        "JSON document exceeds the maximum recursion depth of {MAX_RECURSION_DEPTH}"
    ))
    .emit(&**dh);
    EngineError::Silent
}

fn add_object(
    record: &mut RecordRef<'_>,
    map: Map<String, JsonValue>,
    depth: usize,
    dh: &Arc<dyn DiagnosticHandler>,
) -> Result<(), EngineError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(depth_exceeded(dh));
    }
    for (key, value) in map {
        add_field(record.field(&key), value, depth, dh)?;
    }
    Ok(())
}

fn add_field(
    mut field: crate::builder::FieldRef<'_>,
    value: JsonValue,
    depth: usize,
    dh: &Arc<dyn DiagnosticHandler>,
) -> Result<(), EngineError> {
    match value {
        JsonValue::Null => field.null(),
        JsonValue::Bool(b) => field.data(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                field.data(i);
            } else if let Some(u) = n.as_u64() {
                field.data(u);
            } else {
                field.data(n.as_f64().unwrap_or(f64::NAN));
            }
        }
        // Strings defer: the builder upgrades them to timestamp, duration,
        // subnet, or IP once the column type resolves.
        JsonValue::String(s) => field.data_unparsed(s),
        JsonValue::Array(items) => {
            if depth >= MAX_RECURSION_DEPTH {
                return Err(depth_exceeded(dh));
            }
            let mut list = field.list();
            for item in items {
                add_item(&mut list, item, depth + 1, dh)?;
            }
        }
        JsonValue::Object(map) => {
            if depth >= MAX_RECURSION_DEPTH {
                return Err(depth_exceeded(dh));
            }
            let mut record = field.record();
            add_object(&mut record, map, depth + 1, dh)?;
        }
    }
    Ok(())
}

fn add_item(
    list: &mut ListRef<'_>,
    value: JsonValue,
    depth: usize,
    dh: &Arc<dyn DiagnosticHandler>,
) -> Result<(), EngineError> {
    match value {
        JsonValue::Null => list.null(),
        JsonValue::Bool(b) => list.data(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                list.data(i);
            } else if let Some(u) = n.as_u64() {
                list.data(u);
            } else {
                list.data(n.as_f64().unwrap_or(f64::NAN));
            }
        }
        JsonValue::String(s) => list.data_unparsed(s),
        JsonValue::Array(items) => {
            if depth >= MAX_RECURSION_DEPTH {
                return Err(depth_exceeded(dh));
            }
            let mut nested = list.list();
            for item in items {
                add_item(&mut nested, item, depth + 1, dh)?;
            }
        }
        JsonValue::Object(map) => {
            if depth >= MAX_RECURSION_DEPTH {
                return Err(depth_exceeded(dh));
            }
            let mut record = list.record();
            add_object(&mut record, map, depth + 1, dh)?;
        }
    }
    Ok(())
}

pub struct ReadFactory;

impl OperatorFactory for ReadFactory {
    fn name(&self) -> &'static str {
        "read"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        match args.expect_word("a format after `read`")? {
            "json" => {}
            other => {
                return Err(EngineError::lookup(format!("unknown read format `{other}`")));
            }
        }
        let mut op = ReadJsonOperator::default();
        let mut precise = false;
        while let Some(flag) = args.next_word() {
            match flag {
                "--ndjson" => op.ndjson = true,
                "--merge" => op.merge = true,
                "--precise" => precise = true,
                "--selector" => {
                    let selector = args.expect_word("a field[:prefix] after --selector")?;
                    let (field, prefix) = match selector.split_once(':') {
                        Some((field, prefix)) => (field.to_string(), Some(prefix.to_string())),
                        None => (selector.to_string(), None),
                    };
                    if field.is_empty() {
                        return Err(EngineError::invalid_argument(
                            "--selector requires a field name",
                        ));
                    }
                    op.selector = Some((field, prefix));
                }
                "--unique-selector" => op.unique_selector = true,
                "--schema" => op.schema = Some(args.expect_word("a name after --schema")?.into()),
                "--schema-only" => op.schema_only = true,
                "--raw" => op.raw = true,
                "--unnest" => op.unnest = Some(args.expect_word("a separator after --unnest")?.into()),
                "--batch-size" => {
                    let word = args.expect_word("a count after --batch-size")?;
                    op.batch_size = Some(word.parse().map_err(|_| {
                        EngineError::invalid_argument(format!("`{word}` is not a batch size"))
                    })?);
                }
                "--batch-timeout" => {
                    let word = args.expect_word("a duration after --batch-timeout")?;
                    let delta = weir_types::value::parse_duration(word).ok_or_else(|| {
                        EngineError::invalid_argument(format!("`{word}` is not a duration"))
                    })?;
                    op.batch_timeout = Some(delta.to_std().map_err(|_| {
                        EngineError::invalid_argument("batch timeout must not be negative")
                    })?);
                }
                other => {
                    return Err(EngineError::invalid_argument(format!(
                        "unknown argument `{other}` for `read json`"
                    )));
                }
            }
        }
        if op.merge && op.selector.is_some() {
            return Err(EngineError::invalid_argument(
                "--merge and --selector are mutually exclusive",
            ));
        }
        if op.merge && precise {
            return Err(EngineError::invalid_argument(
                "--merge and --precise are mutually exclusive",
            ));
        }
        if op.schema.is_some() && op.selector.is_some() {
            return Err(EngineError::invalid_argument(
                "--schema and --selector are mutually exclusive",
            ));
        }
        if op.unique_selector && op.selector.is_none() {
            return Err(EngineError::invalid_argument(
                "--unique-selector requires --selector",
            ));
        }
        if op.schema_only && op.schema.is_none() && op.selector.is_none() {
            return Err(EngineError::invalid_argument(
                "--schema-only requires --schema or --selector",
            ));
        }
        Ok((vec![Box::new(op)], args.rest()))
    }
}
