//! Per-step-copy registries of row listeners, input channels and output
//! channels.
//!
//! Wiring code adds to these lists rarely (pipeline setup, partition
//! rewiring), possibly from several setup threads at once, while the step
//! thread walks them once per row. Each list is a [`CowList`], so the hot path
//! iterates a loaded snapshot and never contends with, or observes, a
//! concurrent `add`.

use crate::cow_list::CowList;
use crate::pipeline::channel::RowChannel;
use crate::pipeline::id::ChannelId;
use crate::pipeline::row::Row;
use std::sync::Arc;

/// Observer of the rows a step copy reads and writes.
///
/// Callbacks run on the step thread, inside the row loop; keep them cheap.
#[cfg_attr(test, mockall::automock)]
pub trait RowListener: Send + Sync {
    /// A row was taken from one of the step's inputs.
    fn row_read(&self, row: &Row);

    /// A row was handed to the step's outputs.
    fn row_written(&self, row: &Row);

    /// A row was diverted to error handling.
    fn error_row_written(&self, _row: &Row) {}
}

/// The three endpoint lists owned by one step copy.
#[derive(Default)]
pub struct StepEndpoints {
    listeners: CowList<Arc<dyn RowListener>>,
    inputs: CowList<Arc<RowChannel>>,
    outputs: CowList<Arc<RowChannel>>,
}

impl StepEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Listeners ──

    pub fn add_listener(&self, listener: Arc<dyn RowListener>) {
        self.listeners.add(listener);
    }

    /// Remove `listener` (compared by pointer). Returns whether it was present.
    pub fn remove_listener(&self, listener: &Arc<dyn RowListener>) -> bool {
        self.listeners
            .remove_where(|l| Arc::ptr_eq(l, listener))
            > 0
    }

    pub fn for_each_listener(&self, visitor: impl FnMut(&Arc<dyn RowListener>)) {
        self.listeners.for_each(visitor);
    }

    pub fn listeners(&self) -> Arc<Vec<Arc<dyn RowListener>>> {
        self.listeners.snapshot()
    }

    pub fn notify_row_read(&self, row: &Row) {
        self.listeners.for_each(|l| l.row_read(row));
    }

    pub fn notify_row_written(&self, row: &Row) {
        self.listeners.for_each(|l| l.row_written(row));
    }

    pub fn notify_error_row_written(&self, row: &Row) {
        self.listeners.for_each(|l| l.error_row_written(row));
    }

    // ── Inputs ──

    pub fn add_input(&self, channel: Arc<RowChannel>) {
        self.inputs.add(channel);
    }

    pub fn remove_input(&self, id: ChannelId) -> bool {
        self.inputs.remove_where(|c| c.id() == id) > 0
    }

    pub fn for_each_input(&self, visitor: impl FnMut(&Arc<RowChannel>)) {
        self.inputs.for_each(visitor);
    }

    pub fn inputs(&self) -> Arc<Vec<Arc<RowChannel>>> {
        self.inputs.snapshot()
    }

    /// Input channel written by `origin_step` copy `origin_copy`.
    pub fn find_input(&self, origin_step: &str, origin_copy: u32) -> Option<Arc<RowChannel>> {
        self.inputs.find(|c| c.is_from(origin_step, origin_copy))
    }

    // ── Outputs ──

    pub fn add_output(&self, channel: Arc<RowChannel>) {
        self.outputs.add(channel);
    }

    pub fn remove_output(&self, id: ChannelId) -> bool {
        self.outputs.remove_where(|c| c.id() == id) > 0
    }

    pub fn for_each_output(&self, visitor: impl FnMut(&Arc<RowChannel>)) {
        self.outputs.for_each(visitor);
    }

    pub fn outputs(&self) -> Arc<Vec<Arc<RowChannel>>> {
        self.outputs.snapshot()
    }

    /// Output channel read by `destination_step` copy `destination_copy`.
    pub fn find_output(
        &self,
        destination_step: &str,
        destination_copy: u32,
    ) -> Option<Arc<RowChannel>> {
        self.outputs
            .find(|c| c.is_to(destination_step, destination_copy))
    }

    /// Mark every output channel done so downstream readers see end-of-stream.
    pub fn mark_outputs_done(&self) {
        self.outputs.for_each(|c| c.mark_done());
    }

    /// Drop every listener and channel reference (step disposal).
    pub fn clear(&self) {
        self.listeners.clear();
        self.inputs.clear();
        self.outputs.clear();
    }
}

impl std::fmt::Debug for StepEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEndpoints")
            .field("listeners", &self.listeners.len())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::ChannelEndpoints;
    use crate::pipeline::row::Value;
    use std::thread;

    fn channel(from: &str, from_copy: u32, to: &str, to_copy: u32) -> Arc<RowChannel> {
        Arc::new(
            RowChannel::new(4).with_endpoints(ChannelEndpoints::new(from, from_copy, to, to_copy)),
        )
    }

    #[test]
    fn test_listeners_are_notified() {
        let mut mock = MockRowListener::new();
        mock.expect_row_read().times(2).return_const(());
        mock.expect_row_written().times(1).return_const(());

        let endpoints = StepEndpoints::new();
        endpoints.add_listener(Arc::new(mock));

        let row = Row::new(vec![Value::Integer(7)]);
        endpoints.notify_row_read(&row);
        endpoints.notify_row_read(&row);
        endpoints.notify_row_written(&row);
    }

    #[test]
    fn test_removed_listener_is_not_notified() {
        let mut mock = MockRowListener::new();
        mock.expect_row_read().never();

        let endpoints = StepEndpoints::new();
        let listener: Arc<dyn RowListener> = Arc::new(mock);
        endpoints.add_listener(Arc::clone(&listener));
        assert!(endpoints.remove_listener(&listener));
        assert!(!endpoints.remove_listener(&listener));

        endpoints.notify_row_read(&Row::default());
    }

    #[test]
    fn test_find_channels_by_identity() {
        let endpoints = StepEndpoints::new();
        endpoints.add_input(channel("A", 0, "B", 1));
        endpoints.add_input(channel("C", 2, "B", 1));
        endpoints.add_output(channel("B", 1, "D", 0));

        assert!(endpoints.find_input("C", 2).is_some());
        assert!(endpoints.find_input("C", 0).is_none());
        assert!(endpoints.find_output("D", 0).is_some());
        assert_eq!(endpoints.inputs().len(), 2);
    }

    #[test]
    fn test_remove_channel_by_id() {
        let endpoints = StepEndpoints::new();
        let ch = channel("A", 0, "B", 0);
        endpoints.add_output(Arc::clone(&ch));
        assert!(endpoints.remove_output(ch.id()));
        assert!(endpoints.outputs().is_empty());
        assert!(!endpoints.remove_input(ch.id()));
    }

    #[test]
    fn test_mark_outputs_done() {
        let endpoints = StepEndpoints::new();
        let a = channel("S", 0, "T", 0);
        let b = channel("S", 0, "T", 1);
        endpoints.add_output(Arc::clone(&a));
        endpoints.add_output(Arc::clone(&b));
        endpoints.mark_outputs_done();
        assert!(a.is_done() && b.is_done());
    }

    #[test]
    fn test_iteration_during_parallel_wiring() {
        let endpoints = Arc::new(StepEndpoints::new());

        let wiring: Vec<_> = (0..4u32)
            .map(|copy| {
                let endpoints = Arc::clone(&endpoints);
                thread::spawn(move || {
                    for i in 0..50 {
                        endpoints.add_input(channel("Source", copy, "Sink", i));
                    }
                })
            })
            .collect();

        let hot_path = {
            let endpoints = Arc::clone(&endpoints);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    let mut count = 0;
                    endpoints.for_each_input(|c| {
                        assert!(!c.describe().is_empty());
                        count += 1;
                    });
                    assert!(count <= 200);
                }
            })
        };

        for w in wiring {
            w.join().unwrap();
        }
        hot_path.join().unwrap();
        assert_eq!(endpoints.inputs().len(), 200);
    }
}
