//! Structured diagnostics with source spans.
//!
//! Operators and the parser report through a [`DiagnosticHandler`]; the host
//! decides how to render the record stream (pretty text or JSON). Warnings
//! never stop execution; an `error` diagnostic marks the run as failed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Note => f.write_str("note"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// A byte range in a named input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub offset: u64,
    pub length: u64,
}

impl SourceSpan {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { file: None, offset, length }
    }

    pub fn in_file(file: impl Into<String>, offset: u64, length: u64) -> Self {
        Self { file: Some(file.into()), offset, length }
    }
}

/// A secondary span with an attached note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            span: None,
            notes: Vec::new(),
            hints: Vec::new(),
        }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(Severity::Note, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_note(mut self, message: impl Into<String>, span: Option<SourceSpan>) -> Self {
        self.notes.push(Annotation { message: message.into(), span });
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn emit(self, handler: &dyn DiagnosticHandler) {
        handler.emit(self);
    }
}

/// Sink for diagnostic records.
pub trait DiagnosticHandler: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Collects diagnostics for end-of-run reporting. Tracks whether an `error`
/// severity was seen.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    records: Mutex<Vec<Diagnostic>>,
    has_error: AtomicBool,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }

    /// Take all collected records, oldest first.
    pub fn drain(&self) -> Vec<Diagnostic> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *records)
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DiagnosticHandler for DiagnosticCollector {
    fn emit(&self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Error {
            self.has_error.store(true, Ordering::Relaxed);
        }
        tracing::debug!(
            severity = %diagnostic.severity,
            message = %diagnostic.message,
            "diagnostic"
        );
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_tracks_errors() {
        let collector = DiagnosticCollector::new();
        collector.emit(Diagnostic::warning("soft"));
        assert!(!collector.has_error());
        collector.emit(Diagnostic::error("hard"));
        assert!(collector.has_error());
        let records = collector.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].severity, Severity::Warning);
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn test_json_shape() {
        let diag = Diagnostic::warning("conflicting types")
            .with_span(SourceSpan::in_file("input.json", 10, 5))
            .with_note("first seen here", Some(SourceSpan::new(2, 3)))
            .with_hint("use --merge to widen");
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["span"]["file"], "input.json");
        assert_eq!(json["notes"][0]["message"], "first seen here");
        assert_eq!(json["hints"][0], "use --merge to widen");
        let back: Diagnostic = serde_json::from_value(json).unwrap();
        assert_eq!(back, diag);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Note < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }
}
