//! Thread-per-step pipeline runtime.
//!
//! Rows flow between step copies through bounded [`RowChannel`]s. Every step
//! copy runs on its own OS thread and owns a [`StepEndpoints`] holding its
//! listeners, input channels and output channels.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──► [Sort.0] ──┐
//! [TableInput.0] ─┤               ├──► [Output.0]
//!                 └──► [Sort.1] ──┘
//!          RowChannel (bounded, one producer, one consumer)
//! ```
//!
//! # Design
//!
//! - **Backpressure**: `push` blocks while the channel is full.
//! - **Cooperative stop**: a shared [`StopFlag`] plus `mark_done` on every
//!   channel, so no thread stays blocked.
//! - **Lock-free hot path**: endpoint lists are copy-on-write snapshots.
//! - **No global lock**: each channel and list synchronizes on its own.

pub mod channel;
pub mod endpoints;
pub mod executor;
pub mod id;
pub mod row;
pub mod step;
pub mod stop;

pub use channel::{
    Capacity, ChannelEndpoints, ChannelStats, PopOutcome, PushOutcome, RowChannel, TryPop, TryPush,
};
pub use endpoints::{RowListener, StepEndpoints};
pub use executor::{
    Pipeline, PipelineBuilder, PipelineControl, PipelineResult, StepEvent, StepFailure,
};
pub use id::{ChannelId, LogChannelId};
pub use row::{Row, Value};
pub use step::{RowDistribution, Step, StepContext, StepCounters, StepFactory, StepStatus};
pub use stop::StopFlag;
