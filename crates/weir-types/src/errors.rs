//! The engine error taxonomy.
//!
//! Every failure in the engine is one of these categories; the CLI maps the
//! highest severity seen to its exit code. `Silent` marks an error that has
//! already been reported as a diagnostic and must not produce a second
//! generic message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Input bytes could not be interpreted under the expected grammar.
    #[error("parse error: {0}")]
    Parse(String),
    /// Incompatible element types between operators, or a value failed to
    /// fit its column type.
    #[error("type error: {0}")]
    Type(String),
    /// The pipeline text is malformed.
    #[error("syntax error: {0}")]
    Syntax(String),
    /// Unknown operator, unknown schema, or recursive alias.
    #[error("lookup error: {0}")]
    Lookup(String),
    /// An operator argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A configuration entry is invalid or mutually exclusive with another.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// I/O failure at a file boundary.
    #[error("filesystem error for `{path}`: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// An on-wire or on-disk representation violated its contract.
    #[error("format error: {0}")]
    Format(String),
    /// An internal invariant was violated.
    #[error("logic error: {0}")]
    Logic(String),
    /// Propagated cancellation.
    #[error("cancelled")]
    Cancelled,
    /// Already reported through a diagnostic; carries no message of its own.
    #[error("error already reported")]
    Silent,
}

impl EngineError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Type(msg.into())
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn filesystem(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem { path: path.into(), source }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// An internal invariant violation. Aborts in debug builds; in release
    /// builds it surfaces as a fatal pipeline error.
    pub fn logic(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "logic error: {msg}");
        Self::Logic(msg)
    }

    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Silent)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error indicates a malformed pipeline or configuration,
    /// as opposed to a runtime failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Syntax(_)
                | Self::Lookup(_)
                | Self::InvalidArgument(_)
                | Self::InvalidConfiguration(_)
        )
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::Format(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_category() {
        assert_eq!(
            EngineError::parse("bad byte").to_string(),
            "parse error: bad byte"
        );
        assert_eq!(EngineError::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_configuration_classification() {
        assert!(EngineError::syntax("x").is_configuration());
        assert!(EngineError::lookup("x").is_configuration());
        assert!(EngineError::invalid_configuration("x").is_configuration());
        assert!(!EngineError::parse("x").is_configuration());
        assert!(!EngineError::Cancelled.is_configuration());
    }

    #[test]
    fn test_silent_detection() {
        assert!(EngineError::Silent.is_silent());
        assert!(!EngineError::parse("x").is_silent());
    }
}
