//! The operator registry: name → factory.
//!
//! Factories own their argument grammar. The pipeline parser consumes one
//! identifier, resolves it here, and hands the remaining operator text to
//! the factory, which returns the operators it produced plus the tail it
//! did not consume. Sugar factories may expand into several operators.

use std::collections::HashMap;
use std::sync::Arc;

use weir_types::EngineError;

use crate::op::Operator;

/// Cursor over the argument text of one operator. Words never cross a `|`.
pub struct ArgParser<'a> {
    rest: &'a str,
}

impl<'a> ArgParser<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { rest: text }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t', '\n', '\r']);
    }

    /// The unconsumed tail, starting at `|` or end of input when the
    /// operator's arguments are exhausted.
    pub fn rest(&self) -> &'a str {
        self.rest
    }

    /// Peek the next word without consuming it.
    pub fn peek_word(&mut self) -> Option<&'a str> {
        self.skip_ws();
        if self.rest.is_empty() || self.rest.starts_with('|') {
            return None;
        }
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == '|')
            .unwrap_or(self.rest.len());
        Some(&self.rest[..end])
    }

    pub fn next_word(&mut self) -> Option<&'a str> {
        // peek_word trims leading whitespace, so the word is a prefix.
        let word = self.peek_word()?;
        self.rest = &self.rest[word.len()..];
        Some(word)
    }

    /// Consume the next word or fail with an `invalid_argument` error.
    pub fn expect_word(&mut self, what: &str) -> Result<&'a str, EngineError> {
        self.next_word()
            .ok_or_else(|| EngineError::invalid_argument(format!("expected {what}")))
    }

    /// Fail when arguments remain.
    pub fn expect_end(&mut self, operator: &str) -> Result<(), EngineError> {
        match self.peek_word() {
            Some(word) => Err(EngineError::invalid_argument(format!(
                "unexpected argument `{word}` for operator `{operator}`"
            ))),
            None => Ok(()),
        }
    }
}

/// A factory parses one operator invocation from pipeline text.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parse the argument tail. Returns the produced operators and the text
    /// that was not consumed (starting at `|` or end of input).
    fn parse<'a>(&self, args: &'a str)
        -> Result<(Vec<Box<dyn Operator>>, &'a str), EngineError>;
}

/// Name → factory map for operator resolution.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<&'static str, Arc<dyn OperatorFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry populated with the built-in operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::op::load::LoadFactory));
        registry.register(Arc::new(crate::op::load::FromFactory));
        registry.register(Arc::new(crate::op::save::SaveFactory));
        registry.register(Arc::new(crate::op::save::ToFactory));
        registry.register(Arc::new(crate::op::read_json::ReadFactory));
        registry.register(Arc::new(crate::op::write_json::WriteFactory));
        registry.register(Arc::new(crate::op::head::HeadFactory));
        registry.register(Arc::new(crate::op::pass::PassFactory));
        registry.register(Arc::new(crate::op::sort::SortFactory));
        registry.register(Arc::new(crate::op::discard::DiscardFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn OperatorFactory>) {
        self.factories.insert(factory.name(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OperatorFactory>> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parser_words_stop_at_pipe() {
        let mut args = ArgParser::new("  json --ndjson | head 3");
        assert_eq!(args.next_word(), Some("json"));
        assert_eq!(args.next_word(), Some("--ndjson"));
        assert_eq!(args.next_word(), None);
        assert!(args.rest().starts_with('|'));
    }

    #[test]
    fn test_arg_parser_expect_end() {
        let mut args = ArgParser::new(" stray | next");
        assert!(args.expect_end("head").is_err());
        args.next_word();
        assert!(args.expect_end("head").is_ok());
    }

    #[test]
    fn test_builtins_resolve() {
        let registry = Registry::with_builtins();
        for name in ["load", "from", "save", "to", "read", "write", "head", "pass", "sort", "discard"] {
            assert!(registry.contains(name), "missing builtin `{name}`");
        }
        assert!(!registry.contains("nope"));
    }
}
