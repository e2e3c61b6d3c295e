//! Pipelines and jobs hosted by an execution server.
//!
//! Remote clients address hosted work by name, and by `(name, id)` once
//! several runs of the same definition are in flight. Registering an existing
//! key replaces the entry; clients that already looked up the old entry keep
//! a valid `Arc` to it.

use crate::pipeline::executor::PipelineControl;
use crate::pipeline::id::LogChannelId;
use crate::pipeline::stop::StopFlag;
use crate::registry::{KeyedRegistry, RegisterPolicy};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Key of a hosted pipeline or job: definition name plus run id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostedKey {
    pub name: String,
    pub id: String,
}

impl HostedKey {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for HostedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Waiting,
    Preparing,
    Running,
    Paused,
    Stopped,
    Finished,
    FinishedWithErrors,
}

impl ExecutionStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Preparing | ExecutionStatus::Running | ExecutionStatus::Paused
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExecutionStatus::Waiting => "Waiting",
            ExecutionStatus::Preparing => "Preparing executing",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Paused => "Paused",
            ExecutionStatus::Stopped => "Stopped",
            ExecutionStatus::Finished => "Finished",
            ExecutionStatus::FinishedWithErrors => "Finished (with errors)",
        };
        f.write_str(text)
    }
}

/// Serializable view of one hosted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedSummary {
    pub name: String,
    pub id: String,
    pub status: ExecutionStatus,
    pub log_channel_id: LogChannelId,
    pub registered_at: DateTime<Utc>,
}

/// A pipeline hosted by the server.
pub struct HostedPipeline {
    key: HostedKey,
    log_channel_id: LogChannelId,
    status: RwLock<ExecutionStatus>,
    control: Option<PipelineControl>,
    registered_at: DateTime<Utc>,
}

impl HostedPipeline {
    pub fn new(key: HostedKey, log_channel_id: LogChannelId) -> Self {
        Self {
            key,
            log_channel_id,
            status: RwLock::new(ExecutionStatus::Waiting),
            control: None,
            registered_at: Utc::now(),
        }
    }

    /// Attach the stop handle of the running pipeline.
    pub fn with_control(mut self, control: PipelineControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn key(&self) -> &HostedKey {
        &self.key
    }

    pub fn log_channel_id(&self) -> LogChannelId {
        self.log_channel_id
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        *self.status.write() = status;
    }

    /// Stop the running pipeline, if one is attached.
    pub fn stop(&self) -> bool {
        let stopped = self.control.as_ref().is_some_and(PipelineControl::stop);
        if stopped {
            self.set_status(ExecutionStatus::Stopped);
        }
        stopped
    }

    pub fn summary(&self) -> HostedSummary {
        HostedSummary {
            name: self.key.name.clone(),
            id: self.key.id.clone(),
            status: self.status(),
            log_channel_id: self.log_channel_id,
            registered_at: self.registered_at,
        }
    }
}

impl fmt::Debug for HostedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedPipeline")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

/// A job hosted by the server. Jobs run their entries one after another and
/// are stopped through a flag checked between entries.
pub struct HostedJob {
    key: HostedKey,
    log_channel_id: LogChannelId,
    status: RwLock<ExecutionStatus>,
    active_entry: RwLock<Option<String>>,
    stop: StopFlag,
    registered_at: DateTime<Utc>,
}

impl HostedJob {
    pub fn new(key: HostedKey, log_channel_id: LogChannelId) -> Self {
        Self {
            key,
            log_channel_id,
            status: RwLock::new(ExecutionStatus::Waiting),
            active_entry: RwLock::new(None),
            stop: StopFlag::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &HostedKey {
        &self.key
    }

    pub fn log_channel_id(&self) -> LogChannelId {
        self.log_channel_id
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        *self.status.write() = status;
    }

    pub fn active_entry(&self) -> Option<String> {
        self.active_entry.read().clone()
    }

    pub fn set_active_entry(&self, entry: Option<String>) {
        *self.active_entry.write() = entry;
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn stop(&self) -> bool {
        let raised = self.stop.stop();
        if raised {
            self.set_status(ExecutionStatus::Stopped);
        }
        raised
    }

    pub fn summary(&self) -> HostedSummary {
        HostedSummary {
            name: self.key.name.clone(),
            id: self.key.id.clone(),
            status: self.status(),
            log_channel_id: self.log_channel_id,
            registered_at: self.registered_at,
        }
    }
}

impl fmt::Debug for HostedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedJob")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("active_entry", &self.active_entry())
            .finish()
    }
}

/// `HostedKey -> V` map with replace semantics.
pub struct HostedObjectMap<V> {
    entries: KeyedRegistry<HostedKey, V>,
}

impl<V: Clone> HostedObjectMap<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            entries: KeyedRegistry::new(name, RegisterPolicy::ReplaceExisting),
        }
    }

    /// Add or replace; returns the replaced value.
    pub fn add(&self, key: HostedKey, value: V) -> Option<V> {
        assert!(!key.name.is_empty(), "hosted object needs a name");
        tracing::debug!("{}: hosting {}", self.entries.name(), key);
        // Replace policy never rejects.
        self.entries.register(key, value).unwrap_or(None)
    }

    pub fn get(&self, key: &HostedKey) -> Option<V> {
        self.entries.get(key)
    }

    /// First registered entry with this name.
    pub fn find_by_name(&self, name: &str) -> Option<(HostedKey, V)> {
        self.entries.find(|key, _| key.name == name)
    }

    pub fn find_by_id(&self, id: &str) -> Option<(HostedKey, V)> {
        self.entries.find(|key, _| key.id == id)
    }

    pub fn remove(&self, key: &HostedKey) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            tracing::debug!("{}: released {}", self.entries.name(), key);
        }
        removed
    }

    /// All keys, sorted by name then id.
    pub fn keys(&self) -> Vec<HostedKey> {
        let mut keys = self.entries.list_keys();
        keys.sort();
        keys
    }

    /// Snapshot in registration order.
    pub fn list(&self) -> Vec<V> {
        self.entries.list()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> fmt::Debug for HostedObjectMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.entries, f)
    }
}

pub type HostedPipelines = HostedObjectMap<Arc<HostedPipeline>>;
pub type HostedJobs = HostedObjectMap<Arc<HostedJob>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(name: &str, id: &str) -> Arc<HostedPipeline> {
        Arc::new(HostedPipeline::new(HostedKey::new(name, id), LogChannelId(1)))
    }

    #[test]
    fn test_lookup_by_name_and_id() {
        let map = HostedPipelines::new("pipelines");
        map.add(HostedKey::new("load", "b"), pipeline("load", "b"));
        map.add(HostedKey::new("load", "a"), pipeline("load", "a"));
        map.add(HostedKey::new("export", "c"), pipeline("export", "c"));

        let (key, _) = map.find_by_name("load").unwrap();
        assert_eq!(key.id, "b");
        assert_eq!(map.find_by_id("c").unwrap().0.name, "export");
        assert!(map.find_by_name("nope").is_none());

        let keys: Vec<String> = map.keys().iter().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["export [c]", "load [a]", "load [b]"]);
    }

    #[test]
    fn test_replace_keeps_old_reference() {
        let map = HostedPipelines::new("pipelines");
        let key = HostedKey::new("load", "1");
        let first = pipeline("load", "1");
        map.add(key.clone(), Arc::clone(&first));
        let held = map.get(&key).unwrap();

        let second = pipeline("load", "1");
        let replaced = map.add(key.clone(), Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&map.get(&key).unwrap(), &second));

        held.set_status(ExecutionStatus::Running);
        assert_eq!(first.status(), ExecutionStatus::Running);
        assert_eq!(second.status(), ExecutionStatus::Waiting);
    }

    #[test]
    fn test_job_stop() {
        let job = HostedJob::new(HostedKey::new("nightly", "7"), LogChannelId(3));
        job.set_status(ExecutionStatus::Running);
        job.set_active_entry(Some("load-sales".into()));
        assert!(job.stop());
        assert!(!job.stop());
        assert!(job.stop_flag().is_stopped());
        assert_eq!(job.summary().status, ExecutionStatus::Stopped);
    }

    #[test]
    fn test_pipeline_without_control_cannot_stop() {
        let hosted = HostedPipeline::new(HostedKey::new("p", "1"), LogChannelId(1));
        assert!(!hosted.stop());
        assert_eq!(hosted.status(), ExecutionStatus::Waiting);
    }
}
