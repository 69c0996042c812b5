//! The execution node: one tokio task hosting one operator.
//!
//! Demand requests flow upstream over a one-slot channel; elements flow
//! downstream over a bounded data channel. The node resumes its operator's
//! state machine only while the outbound buffer has capacity and either
//! downstream demand or the eager-fill prefetch calls for output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::RuntimeFlavor;
use tokio::sync::{mpsc, oneshot, watch};
use weir_types::{Diagnostic, DiagnosticHandler, EngineError, OperatorMetrics, Severity};

use crate::element::{Element, ElementKind};
use crate::op::{Operator, OperatorCtx, OperatorEnv, OperatorState, Signal};

const EVENTS_MAX_BUFFERED: u64 = 64 * 1024;
const EVENTS_MIN_DEMAND: u64 = 8 * 1024;
const BYTES_MAX_BUFFERED: u64 = 4 * 1024 * 1024;
const BYTES_MIN_DEMAND: u64 = 128 * 1024;
const DATA_CHANNEL_CAPACITY: usize = 4;
/// Operator resumptions per run-loop iteration before output is flushed
/// downstream again.
const ADVANCE_QUANTUM: usize = 64;
/// An idle node still wakes periodically so operators can run their
/// timeout-based flushes.
const IDLE_TICK: Duration = Duration::from_millis(100);

fn max_buffered(kind: ElementKind) -> u64 {
    match kind {
        ElementKind::Void => 0,
        ElementKind::Bytes => BYTES_MAX_BUFFERED,
        ElementKind::Events => EVENTS_MAX_BUFFERED,
    }
}

fn min_demand(kind: ElementKind) -> u64 {
    match kind {
        ElementKind::Void => 0,
        ElementKind::Bytes => BYTES_MIN_DEMAND,
        ElementKind::Events => EVENTS_MIN_DEMAND,
    }
}

/// Wraps the run-wide diagnostic sink and remembers whether this node's
/// operator emitted an error, which makes the failure fatal for the node.
pub(crate) struct NodeDiagnostics {
    inner: Arc<dyn DiagnosticHandler>,
    saw_error: AtomicBool,
}

impl NodeDiagnostics {
    pub(crate) fn new(inner: Arc<dyn DiagnosticHandler>) -> Self {
        Self { inner, saw_error: AtomicBool::new(false) }
    }

    pub(crate) fn saw_error(&self) -> bool {
        self.saw_error.load(Ordering::Relaxed)
    }
}

impl DiagnosticHandler for NodeDiagnostics {
    fn emit(&self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Error {
            self.saw_error.store(true, Ordering::Relaxed);
        }
        self.inner.emit(diagnostic);
    }
}

pub(crate) struct UpstreamLink {
    pub data_rx: mpsc::Receiver<Element>,
    pub demand_tx: mpsc::Sender<u64>,
}

pub(crate) struct DownstreamLink {
    pub data_tx: mpsc::Sender<Element>,
    pub demand_rx: mpsc::Receiver<u64>,
}

/// Create the channel pair for one operator boundary.
pub(crate) fn link() -> (DownstreamLink, UpstreamLink) {
    let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (demand_tx, demand_rx) = mpsc::channel(1);
    (
        DownstreamLink { data_tx, demand_rx },
        UpstreamLink { data_rx, demand_tx },
    )
}

enum Wake {
    Cancel,
    Demand(Option<u64>),
    Data(Option<Element>),
    Tick,
}

async fn recv_or_pending<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) struct ExecNode {
    index: usize,
    operator: Box<dyn Operator>,
    env: OperatorEnv,
    node_diag: Arc<NodeDiagnostics>,
    input_kind: ElementKind,
    output_kind: ElementKind,
    upstream: Option<UpstreamLink>,
    downstream: Option<DownstreamLink>,
    cancel: watch::Receiver<bool>,

    state: Option<Box<dyn OperatorState>>,
    inbound: VecDeque<Element>,
    inbound_size: u64,
    input_done: bool,
    outbound: VecDeque<Element>,
    outbound_size: u64,
    pending_demand: u64,
    op_cancelled: bool,
    done: bool,
    failed: bool,
    consumed_input: bool,
    produced_output: bool,
    detached: bool,
    metrics: OperatorMetrics,
}

impl ExecNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        operator: Box<dyn Operator>,
        input_kind: ElementKind,
        output_kind: ElementKind,
        upstream: Option<UpstreamLink>,
        downstream: Option<DownstreamLink>,
        run_diagnostics: Arc<dyn DiagnosticHandler>,
        registry: Arc<weir_types::SchemaRegistry>,
        config: Arc<crate::config::EngineConfig>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let node_diag = Arc::new(NodeDiagnostics::new(run_diagnostics));
        let env = OperatorEnv {
            diagnostics: node_diag.clone(),
            registry,
            config,
        };
        let mut metrics = OperatorMetrics {
            operator_index: index,
            operator_name: operator.name().to_string(),
            ..OperatorMetrics::default()
        };
        metrics.inbound.unit = input_kind.unit().to_string();
        metrics.outbound.unit = output_kind.unit().to_string();
        let detached = operator.detached();
        // A sink consumes without anyone demanding from it.
        let pending_demand = if output_kind == ElementKind::Void { u64::MAX } else { 0 };
        Self {
            index,
            operator,
            env,
            node_diag,
            input_kind,
            output_kind,
            upstream,
            downstream,
            cancel,
            state: None,
            inbound: VecDeque::new(),
            inbound_size: 0,
            input_done: false,
            outbound: VecDeque::new(),
            outbound_size: 0,
            pending_demand,
            op_cancelled: false,
            done: false,
            failed: false,
            consumed_input: false,
            produced_output: false,
            detached,
            metrics,
        }
    }

    /// Drive the node to completion. Returns the node's metrics and whether
    /// it failed fatally.
    pub(crate) async fn run(
        mut self,
        start: oneshot::Receiver<()>,
        primed: oneshot::Sender<Result<(), EngineError>>,
    ) -> (usize, OperatorMetrics, bool) {
        let total = Instant::now();
        if start.await.is_err() {
            self.metrics.time_total = total.elapsed();
            return (self.index, self.metrics, false);
        }
        tracing::debug!(index = self.index, operator = %self.operator.name(), "starting");

        // Instantiate and prime the operator up to its first yield.
        let work = Instant::now();
        match self.operator.instantiate(&self.env) {
            Ok(state) => self.state = Some(state),
            Err(e) => {
                self.fail(e);
                self.metrics.time_scheduled += work.elapsed();
                self.metrics.time_total = total.elapsed();
                let _ = primed.send(Err(EngineError::Silent));
                return (self.index, self.metrics, true);
            }
        }
        self.step_operator();
        self.metrics.time_scheduled += work.elapsed();
        self.bookkeep_run();
        if self.failed {
            self.metrics.time_total = total.elapsed();
            let _ = primed.send(Err(EngineError::Silent));
            return (self.index, self.metrics, true);
        }
        let _ = primed.send(Ok(()));

        while !self.failed && !(self.done && self.outbound.is_empty()) {
            let work = Instant::now();
            if *self.cancel.borrow() && !self.op_cancelled && !self.done {
                self.cancel_operator();
            }
            let mut progress = self.drain_channels();
            self.issue_demand();
            progress |= self.advance();
            progress |= self.flush_downstream().await;
            self.metrics.time_scheduled += work.elapsed();
            self.bookkeep_run();
            if self.failed || (self.done && self.outbound.is_empty()) {
                break;
            }
            if !progress {
                self.idle_wait().await;
            }
        }
        tracing::debug!(
            index = self.index,
            operator = %self.operator.name(),
            failed = self.failed,
            "shut down"
        );
        self.metrics.time_total = total.elapsed();
        (self.index, self.metrics, self.failed)
        // Dropping `self` closes both channel directions, which signals
        // done downstream and cancellation upstream.
    }

    fn bookkeep_run(&mut self) {
        self.metrics.num_runs += 1;
        if self.consumed_input || self.produced_output {
            self.metrics.num_runs_processing += 1;
        }
        if self.consumed_input {
            self.metrics.num_runs_processing_input += 1;
        }
        if self.produced_output {
            self.metrics.num_runs_processing_output += 1;
        }
        self.consumed_input = false;
        self.produced_output = false;
    }

    /// Non-blocking absorption of demand and data messages.
    fn drain_channels(&mut self) -> bool {
        let mut progress = false;
        let mut downstream_closed = false;
        if let Some(down) = &mut self.downstream {
            loop {
                match down.demand_rx.try_recv() {
                    Ok(rows) => {
                        self.pending_demand = rows;
                        progress = true;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        downstream_closed = true;
                        break;
                    }
                }
            }
        }
        if downstream_closed {
            self.on_downstream_closed();
            progress = true;
        }
        let max = max_buffered(self.input_kind);
        if let Some(up) = &mut self.upstream {
            while self.inbound_size < max {
                match up.data_rx.try_recv() {
                    Ok(element) => {
                        let size = element.size();
                        self.metrics.inbound.observe(size, element.approx_bytes());
                        self.inbound_size += size;
                        self.inbound.push_back(element);
                        progress = true;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.input_done = true;
                        self.upstream = None;
                        progress = true;
                        break;
                    }
                }
            }
        }
        progress
    }

    /// Eager fill: request more input whenever the free inbound capacity
    /// exceeds the minimum batch size.
    fn issue_demand(&mut self) {
        let Some(up) = &self.upstream else { return };
        let max = max_buffered(self.input_kind);
        let min = min_demand(self.input_kind);
        if self.inbound_size + min > max {
            return;
        }
        // A full one-slot channel means a request is already outstanding.
        let _ = up.demand_tx.try_send(max - self.inbound_size);
    }

    /// How many output elements the node wants buffered right now: open
    /// demand plus a small prefetch, capped by the outbound bound.
    fn outbound_target(&self) -> u64 {
        let cap = max_buffered(self.output_kind);
        self.pending_demand
            .max(min_demand(self.output_kind))
            .min(cap)
    }

    /// Resume the operator until it cooperatively yields, completes, or the
    /// outbound buffer holds enough.
    fn advance(&mut self) -> bool {
        let mut progress = false;
        let is_sink = self.output_kind == ElementKind::Void;
        let mut steps = 0;
        loop {
            if self.done || self.failed || self.state.is_none() {
                break;
            }
            if steps >= ADVANCE_QUANTUM {
                break;
            }
            steps += 1;
            if !is_sink && self.outbound_size >= self.outbound_target() {
                break;
            }
            let before_consumed = self.consumed_input;
            match self.step_operator() {
                Step::Yielded => progress = true,
                Step::Suspended => {
                    progress |= self.consumed_input && !before_consumed;
                    break;
                }
                Step::Finished => {
                    progress = true;
                    break;
                }
            }
        }
        progress
    }

    /// One resumption of the operator's generator.
    fn step_operator(&mut self) -> Step {
        let Some(state) = self.state.as_mut() else {
            return Step::Finished;
        };
        let mut ctx = OperatorCtx::new(
            &mut self.inbound,
            self.input_done,
            self.op_cancelled,
            &mut self.consumed_input,
            &self.env.diagnostics,
        );
        let processing = Instant::now();
        let result = if self.detached
            && tokio::runtime::Handle::current().runtime_flavor() == RuntimeFlavor::MultiThread
        {
            tokio::task::block_in_place(|| state.run(&mut ctx))
        } else {
            state.run(&mut ctx)
        };
        self.metrics.time_processing += processing.elapsed();
        self.inbound_size = self.inbound.iter().map(Element::size).sum();
        if self.node_diag.saw_error() && !self.failed {
            self.fail(EngineError::Silent);
            return Step::Finished;
        }
        match result {
            Ok(Signal::Yield(element)) => {
                let size = element.size();
                if size == 0 {
                    // An empty element is a cooperative yield.
                    return Step::Suspended;
                }
                self.metrics.outbound.observe(size, element.approx_bytes());
                self.outbound_size += size;
                self.outbound.push_back(element);
                self.produced_output = true;
                Step::Yielded
            }
            Ok(Signal::Pending) => Step::Suspended,
            Ok(Signal::Done) => {
                self.done = true;
                self.state = None;
                Step::Finished
            }
            Err(e) => {
                self.fail(e);
                Step::Finished
            }
        }
    }

    /// Push buffered output downstream: against open demand while running,
    /// unconditionally while draining after completion.
    async fn flush_downstream(&mut self) -> bool {
        if self.downstream.is_none() {
            return false;
        }
        let mut progress = false;
        while !self.outbound.is_empty() {
            if !self.done && self.pending_demand == 0 {
                break;
            }
            let element = self.outbound.pop_front().expect("checked non-empty");
            let size = element.size();
            let send = {
                let down = self.downstream.as_mut().expect("checked above");
                down.data_tx.send(element).await
            };
            match send {
                Ok(()) => {
                    self.outbound_size -= size;
                    self.pending_demand = self.pending_demand.saturating_sub(size);
                    progress = true;
                }
                Err(_) => {
                    self.on_downstream_closed();
                    return true;
                }
            }
        }
        progress
    }

    /// Downstream is gone: cancel the operator (it is resumed exactly once
    /// more to observe cancellation) and drop buffered output.
    fn on_downstream_closed(&mut self) {
        self.downstream = None;
        self.pending_demand = 0;
        if !self.done {
            self.cancel_operator();
        }
        self.outbound.clear();
        self.outbound_size = 0;
    }

    fn cancel_operator(&mut self) {
        if self.done || self.state.is_none() {
            self.done = true;
            return;
        }
        self.op_cancelled = true;
        match self.step_operator() {
            Step::Finished => {}
            Step::Yielded | Step::Suspended => {
                // The contract requires termination at the next yield.
                Diagnostic::warning(format!(
                    "operator `{}` did not terminate promptly after cancellation",
                    self.operator.name()
                ))
                .emit(&*self.node_diag.inner);
            }
        }
        self.done = true;
        self.state = None;
        self.outbound.clear();
        self.outbound_size = 0;
    }

    fn fail(&mut self, e: EngineError) {
        if e.is_cancelled() {
            self.done = true;
            self.state = None;
            return;
        }
        if !e.is_silent() {
            Diagnostic::error(format!("operator `{}` failed: {e}", self.operator.name()))
                .emit(&*self.node_diag.inner);
        }
        self.failed = true;
        self.done = true;
        self.state = None;
        self.inbound.clear();
        self.inbound_size = 0;
        self.outbound.clear();
        self.outbound_size = 0;
    }

    /// Park until demand, data, cancellation, or the periodic tick.
    async fn idle_wait(&mut self) {
        let inbound_full = self.inbound_size >= max_buffered(self.input_kind);
        let wake = {
            let cancel = &mut self.cancel;
            let demand_rx = self.downstream.as_mut().map(|d| &mut d.demand_rx);
            let data_rx = self.upstream.as_mut().map(|u| &mut u.data_rx);
            tokio::select! {
                _ = cancel.changed() => Wake::Cancel,
                demand = recv_or_pending(demand_rx) => Wake::Demand(demand),
                data = recv_or_pending(data_rx), if !inbound_full => Wake::Data(data),
                _ = tokio::time::sleep(IDLE_TICK) => Wake::Tick,
            }
        };
        match wake {
            Wake::Cancel => {
                if *self.cancel.borrow() {
                    self.cancel_operator();
                }
            }
            Wake::Demand(Some(rows)) => self.pending_demand = rows,
            Wake::Demand(None) => self.on_downstream_closed(),
            Wake::Data(Some(element)) => {
                let size = element.size();
                self.metrics.inbound.observe(size, element.approx_bytes());
                self.inbound_size += size;
                self.inbound.push_back(element);
            }
            Wake::Data(None) => {
                self.input_done = true;
                self.upstream = None;
            }
            Wake::Tick => {}
        }
    }
}

enum Step {
    Yielded,
    Suspended,
    Finished,
}
