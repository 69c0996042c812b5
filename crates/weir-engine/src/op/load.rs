//! `load`: byte source reading a file or standard input.

use std::io::Read;
use std::path::PathBuf;

use weir_types::EngineError;

use crate::element::{Chunk, Element, ElementKind};
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Signal};
use crate::pipeline::registry::{ArgParser, OperatorFactory};

const CHUNK_SIZE: usize = 64 * 1024;

/// Source producing byte chunks from a file, or stdin for `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOperator {
    /// `None` reads standard input.
    pub path: Option<PathBuf>,
}

impl LoadOperator {
    pub fn stdin() -> Self {
        Self { path: None }
    }

    fn display_path(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "-".to_string(),
        }
    }
}

impl Operator for LoadOperator {
    fn name(&self) -> &'static str {
        "load"
    }

    fn infer_type(&self, input: ElementKind) -> Result<ElementKind, EngineError> {
        match input {
            ElementKind::Void => Ok(ElementKind::Bytes),
            other => Err(super::reject_input(self.name(), other, "void")),
        }
    }

    fn instantiate(&self, _env: &OperatorEnv) -> Result<Box<dyn OperatorState>, EngineError> {
        Ok(Box::new(LoadState {
            path: self.path.clone(),
            source: None,
            offset: 0,
        }))
    }

    fn detached(&self) -> bool {
        // Blocking file reads must not stall neighbor operators.
        true
    }

    fn print(&self) -> String {
        format!("load {}", self.display_path())
    }
}

enum ByteSource {
    File(std::fs::File),
    Stdin(std::io::Stdin),
}

struct LoadState {
    path: Option<PathBuf>,
    source: Option<ByteSource>,
    offset: u64,
}

impl OperatorState for LoadState {
    fn run(&mut self, ctx: &mut OperatorCtx<'_>) -> Result<Signal, EngineError> {
        if ctx.cancelled() {
            self.source = None;
            return Ok(Signal::Done);
        }
        if self.source.is_none() {
            let source = match &self.path {
                Some(path) => ByteSource::File(
                    std::fs::File::open(path)
                        .map_err(|e| EngineError::filesystem(path.display().to_string(), e))?,
                ),
                None => ByteSource::Stdin(std::io::stdin()),
            };
            self.source = Some(source);
            // Opening counts as this resumption's work.
            return Ok(Signal::Pending);
        }
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let read = match self.source.as_mut().expect("source opened above") {
            ByteSource::File(file) => file.read(&mut buffer),
            ByteSource::Stdin(stdin) => stdin.lock().read(&mut buffer),
        };
        let read = read.map_err(|e| {
            EngineError::filesystem(
                self.path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<stdin>".to_string()),
                e,
            )
        })?;
        if read == 0 {
            self.source = None;
            return Ok(Signal::Done);
        }
        buffer.truncate(read);
        let chunk = match &self.path {
            Some(path) => Chunk::with_origin(buffer, path.display().to_string(), self.offset),
            None => Chunk::new(buffer),
        };
        self.offset += read as u64;
        Ok(Signal::Yield(Element::Bytes(chunk)))
    }
}

fn parse_path(word: &str) -> Option<PathBuf> {
    (word != "-").then(|| PathBuf::from(word))
}

pub struct LoadFactory;

impl OperatorFactory for LoadFactory {
    fn name(&self) -> &'static str {
        "load"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        let path = args.expect_word("a path (or `-` for stdin) after `load`")?;
        let op = LoadOperator { path: parse_path(path) };
        args.expect_end("load")?;
        Ok((vec![Box::new(op)], args.rest()))
    }
}

/// `from stdin` sugar, expanding to `load -`.
pub struct FromFactory;

impl OperatorFactory for FromFactory {
    fn name(&self) -> &'static str {
        "from"
    }

    fn parse<'a>(
        &self,
        args: &'a str,
    ) -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError> {
        let mut args = ArgParser::new(args);
        match args.expect_word("a source after `from`")? {
            "stdin" => {}
            other => {
                return Err(EngineError::lookup(format!("unknown source `{other}`")));
            }
        }
        args.expect_end("from")?;
        Ok((vec![Box::new(LoadOperator::stdin())], args.rest()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_type() {
        let op = LoadOperator::stdin();
        assert_eq!(op.infer_type(ElementKind::Void).unwrap(), ElementKind::Bytes);
        assert!(op.infer_type(ElementKind::Bytes).is_err());
    }

    #[test]
    fn test_print_canonical() {
        assert_eq!(LoadOperator::stdin().print(), "load -");
        assert_eq!(
            LoadOperator { path: Some("eve.json".into()) }.print(),
            "load eve.json"
        );
    }

    #[test]
    fn test_factory_requires_path() {
        assert!(LoadFactory.parse("").is_err());
        let (ops, rest) = LoadFactory.parse(" input.json | head").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].print(), "load input.json");
        assert!(rest.starts_with('|'));
    }

    #[test]
    fn test_from_expands_to_load() {
        let (ops, _) = FromFactory.parse(" stdin").unwrap();
        assert_eq!(ops[0].print(), "load -");
        assert!(FromFactory.parse(" kafka").is_err());
    }
}
