//! Mock construction helpers

use parking_lot::Mutex;
use rowflow::pipeline::{RowListener, Step, StepContext, StepStatus};
use rowflow::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Listener counting the rows it sees
#[derive(Default)]
pub struct CountingListener {
    pub read: AtomicU64,
    pub written: AtomicU64,
    pub errors: AtomicU64,
}

impl CountingListener {
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl RowListener for CountingListener {
    fn row_read(&self, _row: &Row) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    fn row_written(&self, _row: &Row) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    fn error_row_written(&self, _row: &Row) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Step emitting `rows`, then finishing
pub struct EmitStep {
    rows: std::vec::IntoIter<Row>,
}

impl EmitStep {
    pub fn boxed(rows: Vec<Row>) -> Box<dyn Step> {
        Box::new(Self {
            rows: rows.into_iter(),
        })
    }
}

impl Step for EmitStep {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        match self.rows.next() {
            Some(row) => Ok(if ctx.put_row(row) {
                StepStatus::Continue
            } else {
                StepStatus::Finished
            }),
            None => Ok(StepStatus::Finished),
        }
    }
}

/// Step forwarding every input row unchanged
pub struct PassThrough;

impl Step for PassThrough {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        match ctx.get_row() {
            Some(row) => {
                ctx.put_row(row);
                Ok(StepStatus::Continue)
            }
            None => Ok(StepStatus::Finished),
        }
    }
}

/// Step collecting every input row into a shared vector
pub struct CollectStep {
    sink: Arc<Mutex<Vec<Row>>>,
}

impl CollectStep {
    pub fn boxed(sink: &Arc<Mutex<Vec<Row>>>) -> Box<dyn Step> {
        Box::new(Self {
            sink: Arc::clone(sink),
        })
    }
}

impl Step for CollectStep {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        match ctx.get_row() {
            Some(row) => {
                self.sink.lock().push(row);
                Ok(StepStatus::Continue)
            }
            None => Ok(StepStatus::Finished),
        }
    }
}

/// Step emitting rows until the pipeline is stopped
pub struct EndlessStep;

impl Step for EndlessStep {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        if ctx.put_row(Row::default()) {
            Ok(StepStatus::Continue)
        } else {
            Ok(StepStatus::Finished)
        }
    }
}

/// Step failing after reading `after` rows
pub struct FailingStep {
    pub after: u64,
    seen: u64,
}

impl FailingStep {
    pub fn boxed(after: u64) -> Box<dyn Step> {
        Box::new(Self { after, seen: 0 })
    }
}

impl Step for FailingStep {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        if self.seen >= self.after {
            return Err(rowflow::EngineError::step(ctx.step_name(), "bad row"));
        }
        match ctx.get_row() {
            Some(_) => {
                self.seen += 1;
                Ok(StepStatus::Continue)
            }
            None => Ok(StepStatus::Finished),
        }
    }
}
