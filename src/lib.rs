//! # rowflow: concurrent execution substrate for a thread-per-step ETL engine
//!
//! A pipeline is a directed graph of steps. Each step copy runs on its own
//! thread and exchanges rows with its neighbours through bounded row
//! channels. Many pipelines, and sub-pipelines started from inside steps, run
//! side by side in one process, while an execution server tracks hosted work
//! and hands out ports for clustered runs.
//!
//! ## Architecture
//!
//! - **Pipeline**: row channels, per-step endpoint lists and the thread-per-copy
//!   executor ([`pipeline`])
//! - **Registries**: plugin catalog, hierarchical log channels and active
//!   sub-pipelines on one keyed-registry pattern ([`registry`])
//! - **Server**: hosted pipelines/jobs, peers and the clustered port allocator
//!   ([`server`])
//! - **Config**: TOML engine config and atomically replaceable remote server
//!   descriptions ([`config`])
//!
//! ## Configuration
//!
//! The engine config lives in the platform config directory under
//! `dev.rowflow.engine`:
//!
//! - **Linux**: `~/.config/dev.rowflow.engine/rowflow.toml`
//! - **macOS**: `~/Library/Application Support/dev.rowflow.engine/rowflow.toml`
//! - **Windows**: `%APPDATA%\dev.rowflow.engine\rowflow.toml`
//!
//! ## Example
//!
//! ```no_run
//! use rowflow::{EngineConfig, EngineContext, PipelineBuilder, Row, Step, StepContext, StepStatus, Value};
//! use std::sync::Arc;
//!
//! struct Numbers(i64);
//!
//! impl Step for Numbers {
//!     fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
//!         if self.0 == 0 {
//!             return Ok(StepStatus::Finished);
//!         }
//!         ctx.put_row(Row::new(vec![Value::Integer(self.0)]));
//!         self.0 -= 1;
//!         Ok(StepStatus::Continue)
//!     }
//! }
//!
//! struct Drain;
//!
//! impl Step for Drain {
//!     fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
//!         Ok(match ctx.get_row() {
//!             Some(_) => StepStatus::Continue,
//!             None => StepStatus::Finished,
//!         })
//!     }
//! }
//!
//! fn main() -> rowflow::Result<()> {
//!     let engine = Arc::new(EngineContext::new(&EngineConfig::default()));
//!     let mut pipeline = PipelineBuilder::new("count-down", engine)
//!         .add_step("numbers", 1, |_| Box::new(Numbers(10)) as Box<dyn Step>)
//!         .add_step("drain", 2, |_| Box::new(Drain) as Box<dyn Step>)
//!         .add_hop("numbers", "drain")
//!         .build()?;
//!     let result = pipeline.run()?;
//!     assert_eq!(result.rows_read, 10);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod cow_list;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use config::{EngineConfig, RemoteServer, RemoteServerConfig};
pub use context::EngineContext;
pub use error::{EngineError, Result, ResultExt};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineControl, PipelineResult, Row, RowChannel, Step,
    StepContext, StepStatus, Value,
};
pub use registry::{KeyedRegistry, LogChannelRegistry, PluginCatalog, RegisterPolicy};
pub use server::{ExecutionServer, PortAllocator};
