//! The pipeline executor.
//!
//! Spawns one execution node per operator (right to left), starts them left
//! to right with a prime-to-first-yield handshake, and collects per-operator
//! metrics when the nodes shut down.

mod node;

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use weir_types::{Diagnostic, DiagnosticHandler, EngineError, OperatorMetrics, SchemaRegistry};

use crate::config::EngineConfig;
use crate::element::ElementKind;
use crate::op::Location;
use crate::pipeline::ClosedPipeline;

use node::{link, ExecNode};

/// Result of driving a pipeline to completion.
#[derive(Debug)]
pub struct RunOutcome {
    /// Per-operator metrics, ordered by operator index.
    pub metrics: Vec<OperatorMetrics>,
    /// Whether any operator failed fatally (an `error` diagnostic was
    /// emitted).
    pub failed: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

pub struct Executor {
    config: Arc<EngineConfig>,
    diagnostics: Arc<dyn DiagnosticHandler>,
}

impl Executor {
    pub fn new(config: Arc<EngineConfig>, diagnostics: Arc<dyn DiagnosticHandler>) -> Self {
        Self { config, diagnostics }
    }

    /// Run a closed pipeline to completion. `cancel` aborts the run when it
    /// turns true; operators observe cancellation at their next resumption.
    pub async fn run(
        &self,
        pipeline: ClosedPipeline,
        external_cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, EngineError> {
        for op in &pipeline.ops {
            if op.location() == Location::Remote {
                return Err(EngineError::invalid_configuration(format!(
                    "operator `{}` must run at a remote node, and this host has none",
                    op.name()
                )));
            }
        }
        let ClosedPipeline { ops, kinds } = pipeline;
        let count = ops.len();
        tracing::info!(operators = count, "starting pipeline");

        // The internal cancel signal fires on external cancellation and on
        // startup failure.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut external = external_cancel;
            let forward = cancel_tx.clone();
            tokio::spawn(async move {
                loop {
                    if *external.borrow() {
                        let _ = forward.send(true);
                        return;
                    }
                    if external.changed().await.is_err() {
                        return;
                    }
                }
            });
        }

        let registry = Arc::new(SchemaRegistry::new());

        // Wire the operator boundaries. A void boundary carries no data.
        let mut upstreams: Vec<Option<node::UpstreamLink>> = (0..count).map(|_| None).collect();
        let mut downstreams: Vec<Option<node::DownstreamLink>> =
            (0..count).map(|_| None).collect();
        for boundary in 0..count.saturating_sub(1) {
            if kinds[boundary + 1] == ElementKind::Void {
                continue;
            }
            let (down, up) = link();
            downstreams[boundary] = Some(down);
            upstreams[boundary + 1] = Some(up);
        }

        // Spawn right to left; start left to right.
        let mut join_set: JoinSet<(usize, OperatorMetrics, bool)> = JoinSet::new();
        let mut handshakes: Vec<Option<(oneshot::Sender<()>, oneshot::Receiver<Result<(), EngineError>>)>> =
            (0..count).map(|_| None).collect();
        for (index, op) in ops.into_iter().enumerate().rev() {
            let exec_node = ExecNode::new(
                index,
                op,
                kinds[index],
                kinds[index + 1],
                upstreams[index].take(),
                downstreams[index].take(),
                self.diagnostics.clone(),
                registry.clone(),
                self.config.clone(),
                cancel_rx.clone(),
            );
            let (start_tx, start_rx) = oneshot::channel();
            let (primed_tx, primed_rx) = oneshot::channel();
            join_set.spawn(exec_node.run(start_rx, primed_tx));
            handshakes[index] = Some((start_tx, primed_rx));
        }

        let mut startup_failed = false;
        for (index, handshake) in handshakes.into_iter().enumerate() {
            let (start_tx, primed_rx) = handshake.expect("every node has a handshake");
            if start_tx.send(()).is_err() || !matches!(primed_rx.await, Ok(Ok(()))) {
                tracing::warn!(index, "operator failed to start; aborting pipeline");
                startup_failed = true;
                let _ = cancel_tx.send(true);
                break;
            }
        }

        let mut metrics: Vec<OperatorMetrics> = Vec::with_capacity(count);
        let mut failed = startup_failed;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, node_metrics, node_failed)) => {
                    failed |= node_failed;
                    metrics.push(node_metrics);
                }
                Err(e) => {
                    Diagnostic::error(format!("execution node panicked: {e}"))
                        .emit(&*self.diagnostics);
                    failed = true;
                }
            }
        }
        metrics.sort_by_key(|m| m.operator_index);
        let cancelled = *cancel_tx.borrow() && !startup_failed;
        tracing::info!(failed, cancelled, "pipeline finished");
        Ok(RunOutcome { metrics, failed, cancelled })
    }
}
