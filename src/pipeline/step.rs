//! Step abstraction for the pipeline.
//!
//! A [`Step`] is the business logic of one pipeline stage. The executor
//! creates one instance per step copy and drives it on that copy's own
//! thread:
//!
//! ```text
//! init ──► process_row ──► process_row ──► … ──► dispose
//!                  (until Finished, an error, or stop)
//! ```
//!
//! Steps talk to their neighbours only through the [`StepContext`], which
//! wraps the copy's [`StepEndpoints`].

use crate::context::EngineContext;
use crate::error::Result;
use crate::pipeline::channel::{PopOutcome, PushOutcome, RowChannel, TryPop};
use crate::pipeline::endpoints::StepEndpoints;
use crate::pipeline::executor::PipelineControl;
use crate::pipeline::id::LogChannelId;
use crate::pipeline::row::Row;
use crate::registry::ActiveSubPipelines;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

/// Sleep between rounds when a multi-input step finds every input empty.
const INPUT_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Returned by [`Step::process_row`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Call `process_row` again.
    Continue,
    /// The step has no more work; its outputs will be marked done.
    Finished,
}

/// How a step copy spreads rows over several output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RowDistribution {
    /// Each row goes to the next output in turn.
    #[default]
    RoundRobin,
    /// Every output gets a copy of every row.
    CopyToAll,
}

/// Business logic of one step copy.
pub trait Step: Send {
    /// Called once on the step thread before the first row.
    fn init(&mut self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    /// Handle one unit of work, usually one row.
    fn process_row(&mut self, ctx: &StepContext) -> Result<StepStatus>;

    /// Called once when the copy stops, whatever the reason.
    fn dispose(&mut self) {}
}

/// Builds the step instance for a copy number.
pub type StepFactory = Arc<dyn Fn(u32) -> Box<dyn Step> + Send + Sync>;

/// Row counters of one step copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    pub rows_read: u64,
    pub rows_written: u64,
    pub error_rows: u64,
}

/// Everything a step copy can reach while it runs.
///
/// Owned by the step thread; counters and the round-robin cursors are plain
/// cells.
pub struct StepContext {
    step_name: String,
    copy: u32,
    distribution: RowDistribution,
    endpoints: Arc<StepEndpoints>,
    log_channel_id: LogChannelId,
    control: PipelineControl,
    engine: Arc<EngineContext>,
    next_input: Cell<usize>,
    next_output: Cell<usize>,
    counters: Cell<StepCounters>,
}

impl StepContext {
    pub(crate) fn new(
        step_name: String,
        copy: u32,
        distribution: RowDistribution,
        endpoints: Arc<StepEndpoints>,
        log_channel_id: LogChannelId,
        control: PipelineControl,
        engine: Arc<EngineContext>,
    ) -> Self {
        Self {
            step_name,
            copy,
            distribution,
            endpoints,
            log_channel_id,
            control,
            engine,
            next_input: Cell::new(0),
            next_output: Cell::new(0),
            counters: Cell::new(StepCounters::default()),
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn copy(&self) -> u32 {
        self.copy
    }

    pub fn distribution(&self) -> RowDistribution {
        self.distribution
    }

    pub fn endpoints(&self) -> &Arc<StepEndpoints> {
        &self.endpoints
    }

    pub fn log_channel_id(&self) -> LogChannelId {
        self.log_channel_id
    }

    pub fn sub_pipelines(&self) -> &Arc<ActiveSubPipelines> {
        self.control.sub_pipelines()
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    pub fn pipeline(&self) -> &PipelineControl {
        &self.control
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    pub fn counters(&self) -> StepCounters {
        self.counters.get()
    }

    /// Next input row, or `None` at end of stream (or when stopped).
    ///
    /// With one input this blocks in `pop`. With several, inputs are polled
    /// round-robin until one yields a row or all are exhausted.
    pub fn get_row(&self) -> Option<Row> {
        let inputs = self.endpoints.inputs();
        let row = match inputs.len() {
            0 => None,
            1 => match inputs[0].pop() {
                PopOutcome::Row(row) => Some(row),
                PopOutcome::EndOfStream => None,
            },
            _ => self.poll_inputs(&inputs),
        }?;

        self.endpoints.notify_row_read(&row);
        self.bump(|c| c.rows_read += 1);
        Some(row)
    }

    fn poll_inputs(&self, inputs: &[Arc<RowChannel>]) -> Option<Row> {
        let n = inputs.len();
        loop {
            if self.is_stopped() {
                return None;
            }
            let start = self.next_input.get();
            let mut exhausted = 0;
            for offset in 0..n {
                let idx = (start + offset) % n;
                match inputs[idx].try_pop() {
                    TryPop::Row(row) => {
                        self.next_input.set((idx + 1) % n);
                        return Some(row);
                    }
                    TryPop::Empty => {}
                    TryPop::EndOfStream => exhausted += 1,
                }
            }
            if exhausted == n {
                return None;
            }
            std::thread::sleep(INPUT_POLL_INTERVAL);
        }
    }

    /// Hand `row` to the outputs. Returns `false` if no output accepted it
    /// because the downstream channels are closed.
    ///
    /// A step without outputs is a sink: the row is counted and dropped.
    /// Listeners and `rows_written` only see rows that were accepted.
    pub fn put_row(&self, row: Row) -> bool {
        let listeners = self.endpoints.listeners();
        let notified = (!listeners.is_empty()).then(|| row.clone());

        let outputs = self.endpoints.outputs();
        let accepted = match (outputs.len(), self.distribution) {
            (0, _) => true,
            (1, _) => outputs[0].push(row) == PushOutcome::Accepted,
            (n, RowDistribution::RoundRobin) => {
                let idx = self.next_output.get() % n;
                self.next_output.set((idx + 1) % n);
                outputs[idx].push(row) == PushOutcome::Accepted
            }
            (n, RowDistribution::CopyToAll) => {
                let mut accepted = false;
                for channel in &outputs[..n - 1] {
                    accepted |= channel.push(row.clone()) == PushOutcome::Accepted;
                }
                accepted |= outputs[n - 1].push(row) == PushOutcome::Accepted;
                accepted
            }
        };

        if accepted {
            if let Some(row) = notified {
                for listener in listeners.iter() {
                    listener.row_written(&row);
                }
            }
            self.bump(|c| c.rows_written += 1);
        }
        accepted
    }

    /// Divert `row` to error handling.
    pub fn put_error_row(&self, row: &Row) {
        self.endpoints.notify_error_row_written(row);
        self.bump(|c| c.error_rows += 1);
    }

    fn bump(&self, f: impl FnOnce(&mut StepCounters)) {
        let mut counters = self.counters.get();
        f(&mut counters);
        self.counters.set(counters);
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step_name)
            .field("copy", &self.copy)
            .field("log_channel", &self.log_channel_id)
            .field("counters", &self.counters.get())
            .finish()
    }
}
