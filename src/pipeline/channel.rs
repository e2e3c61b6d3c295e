//! Bounded row transport between two step threads.
//!
//! A `RowChannel` connects exactly one producer step copy to one consumer step
//! copy. `push` blocks while the buffer is full, `pop` blocks while it is
//! empty, and `mark_done` releases both sides for good:
//!
//! ```text
//!   producer ──push──► [ r3 r2 r1 ] ──pop──► consumer
//!                       ▲ capacity
//! ```
//!
//! Once `done` is set a blocked or later `push` drops its row and reports
//! [`PushOutcome::Closed`]; `pop` keeps draining buffered rows and then
//! reports [`PopOutcome::EndOfStream`]. Neither is an error.
//!
//! The four identity fields (origin/destination step and copy) live behind
//! their own lock and are always replaced and rendered as one group, so a
//! rewiring thread can never produce a torn `describe()`.

use crate::pipeline::id::ChannelId;
use crate::pipeline::row::Row;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer size limit of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(usize),
    Unbounded,
}

impl Capacity {
    #[inline]
    fn admits(self, len: usize) -> bool {
        match self {
            Capacity::Bounded(max) => len < max,
            Capacity::Unbounded => true,
        }
    }
}

/// Result of a blocking `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The row was appended to the buffer.
    Accepted,
    /// The channel is done; the row was dropped.
    Closed,
}

/// Result of a blocking `pop`.
#[derive(Debug, Clone, PartialEq)]
pub enum PopOutcome {
    Row(Row),
    /// The channel is done and fully drained.
    EndOfStream,
}

impl PopOutcome {
    pub fn into_row(self) -> Option<Row> {
        match self {
            PopOutcome::Row(row) => Some(row),
            PopOutcome::EndOfStream => None,
        }
    }
}

/// Result of a non-blocking `try_push`.
#[derive(Debug, Clone, PartialEq)]
pub enum TryPush {
    Accepted,
    /// The buffer is full; the row is handed back to the caller.
    Full(Row),
    Closed,
}

/// Result of a non-blocking `try_pop`.
#[derive(Debug, Clone, PartialEq)]
pub enum TryPop {
    Row(Row),
    Empty,
    EndOfStream,
}

/// Identity metadata of a channel: which step copy writes, which one reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChannelEndpoints {
    pub origin_step: String,
    pub origin_copy: u32,
    pub destination_step: String,
    pub destination_copy: u32,
}

impl ChannelEndpoints {
    pub fn new(
        origin_step: impl Into<String>,
        origin_copy: u32,
        destination_step: impl Into<String>,
        destination_copy: u32,
    ) -> Self {
        Self {
            origin_step: origin_step.into(),
            origin_copy,
            destination_step: destination_step.into(),
            destination_copy,
        }
    }
}

impl fmt::Display for ChannelEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} - {}.{}",
            self.origin_step, self.origin_copy, self.destination_step, self.destination_copy
        )
    }
}

/// Point-in-time row counters of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    pub pushed: u64,
    pub popped: u64,
    /// Rows discarded because the channel was already done.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

struct Buffer {
    rows: VecDeque<Row>,
    done: bool,
}

/// Bounded FIFO queue between one producer and one consumer step thread.
pub struct RowChannel {
    id: ChannelId,
    capacity: Capacity,
    buffer: Mutex<Buffer>,
    not_full: Condvar,
    not_empty: Condvar,
    endpoints: RwLock<ChannelEndpoints>,
    counters: Counters,
}

impl RowChannel {
    /// Create a channel holding at most `capacity` rows.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "row channel capacity must be at least 1");
        Self::with_capacity(Capacity::Bounded(capacity))
    }

    /// Create a channel whose `push` never blocks.
    pub fn unbounded() -> Self {
        Self::with_capacity(Capacity::Unbounded)
    }

    fn with_capacity(capacity: Capacity) -> Self {
        let initial = match capacity {
            Capacity::Bounded(max) => max.min(1024),
            Capacity::Unbounded => 64,
        };
        Self {
            id: ChannelId::next(),
            capacity,
            buffer: Mutex::new(Buffer {
                rows: VecDeque::with_capacity(initial),
                done: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            endpoints: RwLock::new(ChannelEndpoints::default()),
            counters: Counters::default(),
        }
    }

    /// Builder-style variant of [`set_endpoints`](Self::set_endpoints).
    pub fn with_endpoints(self, endpoints: ChannelEndpoints) -> Self {
        *self.endpoints.write() = endpoints;
        self
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    // ── Row transport ──

    /// Append `row`, blocking while the buffer is full.
    ///
    /// Returns [`PushOutcome::Closed`] without enqueueing if the channel is
    /// (or becomes, while waiting) done.
    pub fn push(&self, row: Row) -> PushOutcome {
        let mut buf = self.buffer.lock();
        while !buf.done && !self.capacity.admits(buf.rows.len()) {
            self.not_full.wait(&mut buf);
        }
        if buf.done {
            drop(buf);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Closed;
        }
        buf.rows.push_back(row);
        drop(buf);
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        PushOutcome::Accepted
    }

    /// Remove and return the head row, blocking while the buffer is empty.
    pub fn pop(&self) -> PopOutcome {
        let mut buf = self.buffer.lock();
        loop {
            if let Some(row) = buf.rows.pop_front() {
                drop(buf);
                self.counters.popped.fetch_add(1, Ordering::Relaxed);
                self.not_full.notify_one();
                return PopOutcome::Row(row);
            }
            if buf.done {
                return PopOutcome::EndOfStream;
            }
            self.not_empty.wait(&mut buf);
        }
    }

    /// Append `row` only if there is room right now.
    pub fn try_push(&self, row: Row) -> TryPush {
        let mut buf = self.buffer.lock();
        if buf.done {
            drop(buf);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return TryPush::Closed;
        }
        if !self.capacity.admits(buf.rows.len()) {
            return TryPush::Full(row);
        }
        buf.rows.push_back(row);
        drop(buf);
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        TryPush::Accepted
    }

    /// Take the head row only if one is buffered right now.
    pub fn try_pop(&self) -> TryPop {
        let mut buf = self.buffer.lock();
        match buf.rows.pop_front() {
            Some(row) => {
                drop(buf);
                self.counters.popped.fetch_add(1, Ordering::Relaxed);
                self.not_full.notify_one();
                TryPop::Row(row)
            }
            None if buf.done => TryPop::EndOfStream,
            None => TryPop::Empty,
        }
    }

    /// Flag the channel as finished and wake every blocked thread.
    ///
    /// Idempotent; `done` never reverts.
    pub fn mark_done(&self) {
        let mut buf = self.buffer.lock();
        buf.done = true;
        drop(buf);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.buffer.lock().done
    }

    /// Rows currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            popped: self.counters.popped.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    // ── Identity ──

    /// Replace all four identity fields as one unit.
    pub fn set_endpoints(&self, endpoints: ChannelEndpoints) {
        *self.endpoints.write() = endpoints;
    }

    /// Consistent copy of the identity fields.
    pub fn endpoints(&self) -> ChannelEndpoints {
        self.endpoints.read().clone()
    }

    /// `"<origin>.<copy> - <destination>.<copy>"`, rendered under one read lock.
    pub fn describe(&self) -> String {
        self.endpoints.read().to_string()
    }

    /// Whether this channel is written by `step` copy `copy`.
    pub fn is_from(&self, step: &str, copy: u32) -> bool {
        let ep = self.endpoints.read();
        ep.origin_step == step && ep.origin_copy == copy
    }

    /// Whether this channel is read by `step` copy `copy`.
    pub fn is_to(&self, step: &str, copy: u32) -> bool {
        let ep = self.endpoints.read();
        ep.destination_step == step && ep.destination_copy == copy
    }
}

impl fmt::Display for RowChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for RowChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowChannel")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("endpoints", &self.describe())
            .field("len", &self.len())
            .field("done", &self.is_done())
            .finish()
    }
}
