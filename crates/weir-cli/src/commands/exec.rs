//! The `exec` command: parse, type-check, and run one pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use weir_engine::pipeline::parse_pipeline;
use weir_engine::{EngineConfig, Executor, Registry, RunOutcome};
use weir_types::{Diagnostic, DiagnosticCollector, EngineError, OperatorMetrics, Severity};

/// Exit codes of the CLI host.
const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CANCELLED: u8 = 124;

pub struct ExecArgs {
    pub pipeline: Option<String>,
    pub file: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub dump_metrics: bool,
    pub diagnostics_json: bool,
}

pub async fn execute(args: ExecArgs) -> u8 {
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            if e.is_configuration() {
                EXIT_CONFIG
            } else {
                EXIT_ERROR
            }
        }
    }
}

async fn run(args: ExecArgs) -> Result<u8, EngineError> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let config = Arc::new(config);

    let text = match (&args.pipeline, &args.file) {
        (Some(text), None) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| EngineError::filesystem(path.display().to_string(), e))?,
        _ => {
            return Err(EngineError::invalid_argument(
                "exactly one of a pipeline string or --file is required",
            ));
        }
    };

    let registry = Registry::with_builtins();
    let mut pipeline = parse_pipeline(&text, &registry, &config)?;
    pipeline.optimize();
    let closed = pipeline.close()?;
    tracing::info!(pipeline = %closed, "executing");

    let collector = Arc::new(DiagnosticCollector::new());
    let executor = Executor::new(config, collector.clone());

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let outcome = executor.run(closed, cancel_rx).await?;
    report(&collector, &outcome, &args);

    if outcome.cancelled {
        return Ok(EXIT_CANCELLED);
    }
    if outcome.failed || collector.has_error() {
        return Ok(EXIT_ERROR);
    }
    Ok(EXIT_OK)
}

fn report(collector: &DiagnosticCollector, outcome: &RunOutcome, args: &ExecArgs) {
    for diagnostic in collector.drain() {
        if args.diagnostics_json {
            match serde_json::to_string(&diagnostic) {
                Ok(json) => eprintln!("{json}"),
                Err(e) => eprintln!("error: failed to render diagnostic: {e}"),
            }
        } else {
            print_diagnostic(&diagnostic);
        }
    }
    if args.dump_metrics {
        dump_metrics(&outcome.metrics);
    }
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let severity = match diagnostic.severity {
        Severity::Note => "note",
        Severity::Warning => "warning",
        Severity::Error => "error",
    };
    eprint!("{severity}: {}", diagnostic.message);
    if let Some(span) = &diagnostic.span {
        let file = span.file.as_deref().unwrap_or("<input>");
        eprint!(" [{file}:{}+{}]", span.offset, span.length);
    }
    eprintln!();
    for note in &diagnostic.notes {
        eprintln!("  note: {}", note.message);
    }
    for hint in &diagnostic.hints {
        eprintln!("  hint: {hint}");
    }
}

fn dump_metrics(metrics: &[OperatorMetrics]) {
    eprintln!(
        "{:<3} {:<10} {:>10} {:>10} {:>10} {:>8} {:>14} {:>14} {:>12}",
        "#", "operator", "total(s)", "sched(s)", "proc(s)", "runs", "in", "out", "rate"
    );
    for m in metrics {
        // Zero-duration runs are dropped from the rate column instead of
        // reporting an infinite rate.
        let rate = match m.outbound_rate() {
            Some(rate) => format!("{rate:.0}/s"),
            None => "-".to_string(),
        };
        eprintln!(
            "{:<3} {:<10} {:>10.3} {:>10.3} {:>10.3} {:>8} {:>14} {:>14} {:>12}",
            m.operator_index,
            m.operator_name,
            m.time_total.as_secs_f64(),
            m.time_scheduled.as_secs_f64(),
            m.time_processing.as_secs_f64(),
            m.num_runs,
            format!("{} {}", m.inbound.num_elements, m.inbound.unit),
            format!("{} {}", m.outbound.num_elements, m.outbound.unit),
            rate,
        );
    }
}
