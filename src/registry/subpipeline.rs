//! Table of sub-pipelines currently running under a parent pipeline.
//!
//! A step that invokes another pipeline registers it here under the
//! sub-pipeline's name so the parent can stop it. Registering the same name
//! again replaces the entry; whoever still holds the old handle can keep
//! using it.

use crate::pipeline::stop::StopFlag;
use crate::registry::{KeyedRegistry, RegisterPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubPipelineState {
    Running,
    Finished,
    Stopped,
    Failed,
}

impl fmt::Display for SubPipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubPipelineState::Running => write!(f, "Running"),
            SubPipelineState::Finished => write!(f, "Finished"),
            SubPipelineState::Stopped => write!(f, "Stopped"),
            SubPipelineState::Failed => write!(f, "Failed"),
        }
    }
}

type StopHook = Box<dyn Fn() -> bool + Send + Sync>;

/// Handle to one running sub-pipeline.
pub struct SubPipelineHandle {
    name: String,
    stop: StopFlag,
    hook: Option<StopHook>,
    state: Mutex<SubPipelineState>,
    started_at: DateTime<Utc>,
}

impl SubPipelineHandle {
    /// Wrap the stop flag of a sub-pipeline that is already running.
    pub fn new(name: impl Into<String>, stop: StopFlag) -> Self {
        Self {
            name: name.into(),
            stop,
            hook: None,
            state: Mutex::new(SubPipelineState::Running),
            started_at: Utc::now(),
        }
    }

    /// Run `hook` instead of raising the flag directly on `stop`. The hook
    /// must raise the same flag and return whether it did.
    pub fn with_stop_hook(mut self, hook: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SubPipelineState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SubPipelineState::Running
    }

    /// Record how the sub-pipeline ended. Only a running handle changes state.
    pub fn finish(&self, outcome: SubPipelineState) {
        let mut state = self.state.lock();
        if *state == SubPipelineState::Running {
            *state = outcome;
        }
    }

    /// Ask the sub-pipeline to stop. Returns `false` if it was already asked.
    pub fn stop(&self) -> bool {
        let raised = match &self.hook {
            Some(hook) => hook(),
            None => self.stop.stop(),
        };
        if raised {
            self.finish(SubPipelineState::Stopped);
        }
        raised
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }
}

impl fmt::Debug for SubPipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubPipelineHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("started_at", &self.started_at)
            .finish()
    }
}

/// `name -> handle` table owned by one parent pipeline.
pub struct ActiveSubPipelines {
    handles: KeyedRegistry<String, Arc<SubPipelineHandle>>,
}

impl ActiveSubPipelines {
    pub fn new() -> Self {
        Self {
            handles: KeyedRegistry::new("active sub-pipelines", RegisterPolicy::ReplaceExisting),
        }
    }

    /// Register `handle` under its name, returning the handle it replaced.
    pub fn register(&self, handle: Arc<SubPipelineHandle>) -> Option<Arc<SubPipelineHandle>> {
        assert!(!handle.name().is_empty(), "sub-pipeline needs a name");
        tracing::debug!("Sub-pipeline '{}' registered", handle.name());
        // Replace policy never rejects.
        self.handles
            .register(handle.name().to_string(), handle)
            .unwrap_or(None)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SubPipelineHandle>> {
        self.handles.get(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<SubPipelineHandle>> {
        self.handles.remove(name)
    }

    /// Snapshot of all handles, in registration order.
    pub fn list(&self) -> Vec<Arc<SubPipelineHandle>> {
        self.handles.list()
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.list_keys()
    }

    /// Stop every registered sub-pipeline. Returns how many were newly stopped.
    pub fn stop_all(&self) -> usize {
        let stopped = self.list().iter().filter(|h| h.stop()).count();
        if stopped > 0 {
            tracing::info!("Stopped {} sub-pipeline(s)", stopped);
        }
        stopped
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for ActiveSubPipelines {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActiveSubPipelines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
