//! Pipeline executor: graph wiring and the thread-per-step-copy runtime.
//!
//! [`PipelineBuilder`] validates the step graph and wires one [`RowChannel`]
//! per connected pair of step copies. [`Pipeline::start`] then spawns one
//! named OS thread per step copy. Each thread:
//! 1. Builds its step instance from the step's factory.
//! 2. Calls `init`, then `process_row` until the step finishes, fails, or the
//!    pipeline is stopped.
//! 3. Calls `dispose` and marks its output channels done.
//! 4. Reports a [`StepEvent`] back to the pipeline.
//!
//! A failing step stops the whole pipeline.

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::pipeline::channel::{Capacity, ChannelEndpoints, RowChannel};
use crate::pipeline::endpoints::StepEndpoints;
use crate::pipeline::id::LogChannelId;
use crate::pipeline::step::{RowDistribution, Step, StepContext, StepCounters, StepFactory, StepStatus};
use crate::pipeline::stop::StopFlag;
use crate::registry::{ActiveSubPipelines, LoggingObjectType, LoggingSource, SubPipelineHandle};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// Lifecycle reports sent from step threads to their pipeline.
#[derive(Debug, Clone)]
pub enum StepEvent {
    Started {
        step: String,
        copy: u32,
    },
    Finished {
        step: String,
        copy: u32,
        counters: StepCounters,
    },
    Failed {
        step: String,
        copy: u32,
        message: String,
        counters: StepCounters,
    },
}

/// One failed step copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub copy: u32,
    pub message: String,
}

/// Totals reported by [`Pipeline::wait_until_finished`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub rows_read: u64,
    pub rows_written: u64,
    pub error_rows: u64,
    pub errors: u64,
    /// The pipeline was stopped before every step finished on its own.
    pub stopped: bool,
    pub failures: Vec<StepFailure>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.errors == 0 && !self.stopped
    }

    fn absorb(&mut self, counters: StepCounters) {
        self.rows_read += counters.rows_read;
        self.rows_written += counters.rows_written;
        self.error_rows += counters.error_rows;
    }
}

struct ControlInner {
    name: String,
    stop: StopFlag,
    channels: Vec<Arc<RowChannel>>,
    sub_pipelines: Arc<ActiveSubPipelines>,
}

/// Cloneable handle that can stop a running pipeline from any thread.
#[derive(Clone)]
pub struct PipelineControl {
    inner: Arc<ControlInner>,
}

impl PipelineControl {
    fn new(name: String, channels: Vec<Arc<RowChannel>>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                name,
                stop: StopFlag::new(),
                channels,
                sub_pipelines: Arc::new(ActiveSubPipelines::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Raise the stop flag, mark every channel done and stop the running
    /// sub-pipelines. Returns `false` if the pipeline was already stopping.
    pub fn stop(&self) -> bool {
        if !self.inner.stop.stop() {
            return false;
        }
        tracing::info!("Stopping pipeline '{}'", self.inner.name);
        for channel in &self.inner.channels {
            channel.mark_done();
        }
        self.inner.sub_pipelines.stop_all();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_stopped()
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.inner.stop
    }

    pub fn sub_pipelines(&self) -> &Arc<ActiveSubPipelines> {
        &self.inner.sub_pipelines
    }
}

impl std::fmt::Debug for PipelineControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineControl")
            .field("name", &self.inner.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct StepDef {
    name: String,
    copies: u32,
    distribution: RowDistribution,
    factory: StepFactory,
}

/// Describes a pipeline graph and turns it into a wired [`Pipeline`].
pub struct PipelineBuilder {
    name: String,
    engine: Arc<EngineContext>,
    capacity: Option<Capacity>,
    parent_log_channel: Option<LogChannelId>,
    steps: Vec<StepDef>,
    hops: Vec<(String, String)>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>, engine: Arc<EngineContext>) -> Self {
        Self {
            name: name.into(),
            engine,
            capacity: None,
            parent_log_channel: None,
            steps: Vec::new(),
            hops: Vec::new(),
        }
    }

    /// Row capacity of every channel (defaults to `channel.default_capacity`).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(Capacity::Bounded(capacity));
        self
    }

    pub fn unbounded_channels(mut self) -> Self {
        self.capacity = Some(Capacity::Unbounded);
        self
    }

    /// Log channel of the caller (a parent pipeline, job or server).
    pub fn parent_log_channel(mut self, parent: LogChannelId) -> Self {
        self.parent_log_channel = Some(parent);
        self
    }

    /// Add a step run as `copies` parallel copies, distributing rows
    /// round-robin over its outputs.
    pub fn add_step<F>(self, name: impl Into<String>, copies: u32, factory: F) -> Self
    where
        F: Fn(u32) -> Box<dyn Step> + Send + Sync + 'static,
    {
        self.add_step_with_distribution(name, copies, RowDistribution::default(), factory)
    }

    pub fn add_step_with_distribution<F>(
        mut self,
        name: impl Into<String>,
        copies: u32,
        distribution: RowDistribution,
        factory: F,
    ) -> Self
    where
        F: Fn(u32) -> Box<dyn Step> + Send + Sync + 'static,
    {
        self.steps.push(StepDef {
            name: name.into(),
            copies,
            distribution,
            factory: Arc::new(factory),
        });
        self
    }

    /// Send the rows of `from` to `to`.
    pub fn add_hop(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.hops.push((from.into(), to.into()));
        self
    }

    fn step_index(&self, name: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| EngineError::UnknownStep(name.to_string()))
    }

    fn validate(&self) -> Result<Vec<(usize, usize)>> {
        if self.name.is_empty() {
            return Err(EngineError::InvalidPipeline("pipeline needs a name".into()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::InvalidPipeline(format!("'{}' has no steps", self.name)));
        }
        if self.capacity == Some(Capacity::Bounded(0)) {
            return Err(EngineError::InvalidPipeline("channel capacity must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(EngineError::InvalidPipeline("step needs a name".into()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(EngineError::InvalidPipeline(format!("duplicate step '{}'", step.name)));
            }
            if step.copies == 0 {
                return Err(EngineError::InvalidPipeline(format!(
                    "step '{}' needs at least one copy",
                    step.name
                )));
            }
        }

        let mut hops = Vec::with_capacity(self.hops.len());
        for (from, to) in &self.hops {
            let edge = (self.step_index(from)?, self.step_index(to)?);
            if edge.0 == edge.1 {
                return Err(EngineError::InvalidPipeline(format!("step '{from}' hops to itself")));
            }
            if hops.contains(&edge) {
                return Err(EngineError::InvalidPipeline(format!("duplicate hop {from} -> {to}")));
            }
            hops.push(edge);
        }

        if let Some(step) = self.find_loop(&hops) {
            return Err(EngineError::InvalidPipeline(format!("hops form a loop through '{step}'")));
        }
        Ok(hops)
    }

    /// Kahn's algorithm; returns a step left unscheduled if the graph loops.
    fn find_loop(&self, hops: &[(usize, usize)]) -> Option<&str> {
        let n = self.steps.len();
        let mut in_degree = vec![0u32; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(from, to) in hops {
            adj[from].push(to);
            in_degree[to] += 1;
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut scheduled = 0;
        while let Some(step) = queue.pop() {
            scheduled += 1;
            for &next in &adj[step] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if scheduled == n {
            None
        } else {
            (0..n)
                .find(|&i| in_degree[i] > 0)
                .map(|i| self.steps[i].name.as_str())
        }
    }

    /// Validate the graph, register log channels and wire every hop.
    pub fn build(self) -> Result<Pipeline> {
        let hops = self.validate()?;
        let capacity = self
            .capacity
            .unwrap_or(Capacity::Bounded(self.engine.config().channel.default_capacity));
        let run_id = format!("run-{}", NEXT_RUN.fetch_add(1, Ordering::Relaxed));

        let log_registry = self.engine.log_channels();
        let mut pipeline_source =
            LoggingSource::new(LoggingObjectType::Pipeline, &self.name).with_container(&run_id);
        if let Some(parent) = self.parent_log_channel {
            pipeline_source = pipeline_source.with_parent(parent);
        }
        let log_channel_id = log_registry.register(pipeline_source);

        let endpoints: Vec<Vec<Arc<StepEndpoints>>> = self
            .steps
            .iter()
            .map(|s| (0..s.copies).map(|_| Arc::new(StepEndpoints::new())).collect())
            .collect();

        let mut channels = Vec::new();
        for (from, to) in hops {
            let (source, target) = (&self.steps[from], &self.steps[to]);
            let pairs: Vec<(u32, u32)> = if source.copies == target.copies {
                (0..source.copies).map(|c| (c, c)).collect()
            } else {
                (0..source.copies)
                    .flat_map(|s| (0..target.copies).map(move |t| (s, t)))
                    .collect()
            };
            for (s, t) in pairs {
                let channel = match capacity {
                    Capacity::Bounded(n) => RowChannel::new(n),
                    Capacity::Unbounded => RowChannel::unbounded(),
                }
                .with_endpoints(ChannelEndpoints::new(&source.name, s, &target.name, t));
                let channel = Arc::new(channel);
                endpoints[from][s as usize].add_output(Arc::clone(&channel));
                endpoints[to][t as usize].add_input(Arc::clone(&channel));
                channels.push(channel);
            }
            tracing::debug!(
                "Wired {} -> {} ({}x{} copies)",
                source.name,
                target.name,
                source.copies,
                target.copies
            );
        }

        let mut slots = Vec::new();
        for (step, copies) in self.steps.iter().zip(endpoints) {
            for (copy, endpoints) in (0..step.copies).zip(copies) {
                let log_channel_id = log_registry.register(
                    LoggingSource::new(LoggingObjectType::Step, &step.name)
                        .with_copy(copy)
                        .with_container(&run_id)
                        .with_parent(log_channel_id),
                );
                slots.push(CopySlot {
                    step: step.name.clone(),
                    copy,
                    distribution: step.distribution,
                    factory: Arc::clone(&step.factory),
                    endpoints,
                    log_channel_id,
                });
            }
        }

        tracing::debug!(
            "Built pipeline '{}' [{}]: {} step copies, {} channels",
            self.name,
            run_id,
            slots.len(),
            channels.len()
        );

        let (event_tx, events) = unbounded();
        Ok(Pipeline {
            control: PipelineControl::new(self.name.clone(), channels.clone()),
            name: self.name,
            run_id,
            engine: self.engine,
            log_channel_id,
            slots,
            channels,
            handles: Vec::new(),
            events,
            event_tx: Some(event_tx),
            started: false,
        })
    }
}

struct CopySlot {
    step: String,
    copy: u32,
    distribution: RowDistribution,
    factory: StepFactory,
    endpoints: Arc<StepEndpoints>,
    log_channel_id: LogChannelId,
}

/// A wired pipeline, ready to start.
pub struct Pipeline {
    name: String,
    run_id: String,
    engine: Arc<EngineContext>,
    log_channel_id: LogChannelId,
    slots: Vec<CopySlot>,
    channels: Vec<Arc<RowChannel>>,
    control: PipelineControl,
    handles: Vec<JoinHandle<()>>,
    events: Receiver<StepEvent>,
    event_tx: Option<Sender<StepEvent>>,
    started: bool,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique id of this run, also used as the log-channel container id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_channel_id(&self) -> LogChannelId {
        self.log_channel_id
    }

    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    pub fn sub_pipelines(&self) -> &Arc<ActiveSubPipelines> {
        self.control.sub_pipelines()
    }

    pub fn channels(&self) -> &[Arc<RowChannel>] {
        &self.channels
    }

    /// Endpoints of one step copy, e.g. to attach listeners before `start`.
    pub fn step_endpoints(&self, step: &str, copy: u32) -> Option<Arc<StepEndpoints>> {
        self.slots
            .iter()
            .find(|s| s.step == step && s.copy == copy)
            .map(|s| Arc::clone(&s.endpoints))
    }

    /// Handle for registering this pipeline in a parent's sub-pipeline table.
    pub fn sub_pipeline_handle(&self) -> Arc<SubPipelineHandle> {
        let control = self.control.clone();
        Arc::new(
            SubPipelineHandle::new(&self.name, self.control.stop_flag().clone())
                .with_stop_hook(move || control.stop()),
        )
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawn one thread per step copy.
    pub fn start(&mut self) -> Result<()> {
        let events = self
            .event_tx
            .take()
            .ok_or_else(|| EngineError::InvalidPipeline(format!("'{}' was already started", self.name)))?;
        self.started = true;

        tracing::info!(
            "Starting pipeline '{}' [{}] with {} step copies",
            self.name,
            self.run_id,
            self.slots.len()
        );

        for slot in &self.slots {
            let ctx = StepContext::new(
                slot.step.clone(),
                slot.copy,
                slot.distribution,
                Arc::clone(&slot.endpoints),
                slot.log_channel_id,
                self.control.clone(),
                Arc::clone(&self.engine),
            );
            let factory = Arc::clone(&slot.factory);
            let events = events.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("{}.{}", slot.step, slot.copy))
                .spawn(move || run_step_copy(factory, ctx, events));

            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    self.control.stop();
                    return Err(EngineError::Thread(format!(
                        "failed to spawn {}.{}: {}",
                        slot.step, slot.copy, e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Block until every step thread has exited and collect the totals.
    pub fn wait_until_finished(&mut self) -> Result<PipelineResult> {
        if !self.started {
            return Err(EngineError::InvalidPipeline(format!("'{}' was never started", self.name)));
        }

        let mut result = PipelineResult::default();
        // Ends once every step thread has dropped its sender.
        for event in self.events.iter() {
            match event {
                StepEvent::Started { step, copy } => {
                    tracing::trace!("Step copy {}.{} started", step, copy);
                }
                StepEvent::Finished { counters, .. } => result.absorb(counters),
                StepEvent::Failed {
                    step,
                    copy,
                    message,
                    counters,
                } => {
                    result.absorb(counters);
                    result.errors += 1;
                    result.failures.push(StepFailure { step, copy, message });
                }
            }
        }

        for (handle, slot) in self.handles.drain(..).zip(&self.slots) {
            if handle.join().is_err() {
                result.errors += 1;
                result.failures.push(StepFailure {
                    step: slot.step.clone(),
                    copy: slot.copy,
                    message: "step thread panicked".into(),
                });
            }
        }

        result.stopped = self.control.is_stopped();
        tracing::info!(
            "Pipeline '{}' [{}] finished: {} read, {} written, {} error(s){}",
            self.name,
            self.run_id,
            result.rows_read,
            result.rows_written,
            result.errors,
            if result.stopped { ", stopped" } else { "" }
        );
        Ok(result)
    }

    /// `start` followed by `wait_until_finished`.
    pub fn run(&mut self) -> Result<PipelineResult> {
        self.start()?;
        self.wait_until_finished()
    }

    pub fn stop(&self) -> bool {
        self.control.stop()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.control.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("run_id", &self.run_id)
            .field("log_channel", &self.log_channel_id)
            .field("step_copies", &self.slots.len())
            .field("channels", &self.channels.len())
            .field("started", &self.started)
            .finish()
    }
}

/// Marks outputs done however the copy exits; a panicking copy also stops
/// the pipeline so nothing upstream stays blocked.
struct ExitGuard<'a> {
    ctx: &'a StepContext,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(
                "Step copy {}.{} panicked",
                self.ctx.step_name(),
                self.ctx.copy()
            );
            self.ctx.pipeline().stop();
        }
        self.ctx.endpoints().mark_outputs_done();
    }
}

fn drive(step: &mut dyn Step, ctx: &StepContext) -> Result<()> {
    step.init(ctx)?;
    while !ctx.is_stopped() {
        if step.process_row(ctx)? == StepStatus::Finished {
            break;
        }
    }
    Ok(())
}

fn run_step_copy(factory: StepFactory, ctx: StepContext, events: Sender<StepEvent>) {
    let name = ctx.step_name().to_string();
    let copy = ctx.copy();
    let _ = events.send(StepEvent::Started {
        step: name.clone(),
        copy,
    });

    let outcome = {
        let _guard = ExitGuard { ctx: &ctx };
        // Built under the guard so a panicking factory still releases the graph.
        let mut step = factory(copy);
        let outcome = drive(step.as_mut(), &ctx);
        step.dispose();
        outcome
    };

    let counters = ctx.counters();
    let event = match outcome {
        Ok(()) => {
            tracing::debug!("Step copy {}.{} finished: {:?}", name, copy, counters);
            StepEvent::Finished {
                step: name,
                copy,
                counters,
            }
        }
        Err(e) => {
            tracing::error!("Step copy {}.{} failed: {}", name, copy, e);
            ctx.pipeline().stop();
            StepEvent::Failed {
                step: name,
                copy,
                message: e.to_string(),
                counters,
            }
        }
    };
    let _ = events.send(event);
}
