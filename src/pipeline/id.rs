//! Identity types for the pipeline system.
//!
//! Both IDs are newtypes over `u64`. `ChannelId` values are drawn from a
//! process-wide counter so two channels never compare equal; `LogChannelId`
//! values are handed out by the owning `LogChannelRegistry`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a `RowChannel`, used to remove a channel from endpoint lists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Allocate a fresh, never reused id.
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Key into the hierarchical `LogChannelRegistry`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogChannelId(pub u64);

impl LogChannelId {
    pub const INVALID: LogChannelId = LogChannelId(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for LogChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "LogChannelId(INVALID)")
        } else {
            write!(f, "LogChannelId({})", self.0)
        }
    }
}

impl fmt::Display for LogChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log-{:08}", self.0)
    }
}
