//! Cooperative cancellation flag shared by every thread of one pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to a one-way stop signal.
///
/// Step threads poll it between rows; a stopping pipeline additionally marks
/// its channels done so threads blocked in `push`/`pop` wake up and observe it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` if this call was the one that raised it.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_shared_and_one_way() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_stopped());
        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(other.is_stopped());
    }
}
