//! `save`: byte sink writing to a file or standard output.

use std::io::Write;
use std::path::PathBuf;

use weir_types::EngineError;

use crate::element::{Element, ElementKind};
use crate::op::write_json::WriteJsonOperator;
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Pull, Signal};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

/// Sink writing byte chunks to a file, or stdout for `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOperator {
    /// `None` writes standard output.
    pub path: Option<PathBuf>,
}

impl SaveOperator {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    fn display_path(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "-".to_string(),
        }
    }
}

impl Operator for SaveOperator {
    fn name(&self) -> &'static str {
        "save"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Bytes => Ok(ElementKind::Void),
            other => Err(super::reject_input(self.name(), other, "bytes")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(SaveState { path: self.path.clone(), sink: None }))
    }

    fn detached(&self) -> bool {
        true
    }

    fn print(&self) -> String {
        format!("save {}", self.display_path())
    }
}

enum ByteSink {
    File(std::io::BufWriter<std::fs::File>),
    Stdout(std::io::Stdout),
}

struct SaveState {
    path: Option<PathBuf>,
    sink: Option<ByteSink>,
}

impl SaveState {
    fn sink_name(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<stdout>".to_string())
    }
}

impl OperatorState for SaveState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            self.flush().ok();
            self.sink = None;
            return Ok(Signal::Done);
        }
        if self.sink.is_none() {
            let sink = match &self.path {
                Some(path) => ByteSink::File(std::io::BufWriter::new(
                    std::fs::File::create(path)
                        .map_err(|e| EngineError::filesystem(path.display().to_string(), e))?,
                )),
                None => ByteSink::Stdout(std::io::stdout()),
            };
            self.sink = Some(sink);
            return Ok(Signal::Pending);
        }
        match ctx.pull() {
            Pull::Element(Element::Bytes(chunk)) => {
                let result = match self.sink.as_mut().expect("sink opened above") {
                    ByteSink::File(file) => file.write_all(chunk.data()),
                    ByteSink::Stdout(stdout) => stdout.lock().write_all(chunk.data()),
                };
                result.map_err(|e| EngineError::filesystem(self.sink_name(), e))?;
                Ok(Signal::Pending)
            }
            Pull::Element(other) => Err(EngineError::logic(format!(
                "`save` received {} input",
                other.kind()
            ))),
            Pull::Pending => Ok(Signal::Pending),
            Pull::Done => {
                self.flush()
                    .map_err(|e| EngineError::filesystem(self.sink_name(), e))?;
                self.sink = None;
                Ok(Signal::Done)
            }
        }
    }
}

impl SaveState {
    fn flush(&mut self) -> std::io::Result<()> {
        match self.sink.as_mut() {
            Some(ByteSink::File(file)) => file.flush(),
            Some(ByteSink::Stdout(stdout)) => stdout.lock().flush(),
            None => Ok(()),
        }
    }
}

fn parse_path(word: &str) -> Option<PathBuf> {
    (word != "-").then(|| PathBuf::from(word))
}

pub struct SaveFactory;

impl OperatorFactory for SaveFactory {
    fn name(&self) -> &'static str {
        "save"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        let path = args.expect_word("a path (or `-` for stdout) after `save`")?;
        let op = SaveOperator { path: parse_path(path) };
        args.expect_end("save")?;
        Ok((vec![Box::new(op)], args.rest()))
    }
}

/// `to stdout` sugar, expanding to `write json | save -`.
pub struct ToFactory;

impl OperatorFactory for ToFactory {
    fn name(&self) -> &'static str {
        "to"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        match args.expect_word("a destination after `to`")? {
            "stdout" => {}
            other => {
                return Err(EngineError::lookup(format!("unknown destination `{other}`")));
            }
        }
        args.expect_end("to")?;
        Ok((
            vec![
                Box::new(WriteJsonOperator::default()),
                Box::new(SaveOperator::stdout()),
            ],
            args.rest(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_type() {
        let op = SaveOperator::stdout();
        assert_eq!(op.infer_type(ElementKind::Bytes).unwrap(), ElementKind::Void);
        assert!(op.infer_type(ElementKind::Events).is_err());
    }

    #[test]
    fn test_to_expands_to_write_and_save() {
        let (ops, _) = ToFactory.parse(" stdout").unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].name(), "write");
        assert_eq!(ops[1].print(), "save -");
        assert!(ToFactory.parse(" s3").is_err());
    }
}
