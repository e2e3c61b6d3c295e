//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use rowflow::{EngineConfig, EngineContext};
use std::sync::Arc;
use std::time::Duration;

/// How long a test waits before deciding a thread is blocked
pub fn block_grace() -> Duration {
    Duration::from_millis(100)
}

/// Fresh, isolated engine with default config
pub fn test_engine() -> Arc<EngineContext> {
    Arc::new(EngineContext::new(&EngineConfig::default()))
}

/// Integer in the first column of a row
pub fn first_int(row: &rowflow::Row) -> i64 {
    row.get(0)
        .and_then(rowflow::Value::as_integer)
        .expect("row should start with an integer")
}
