//! Remote execution server state.
//!
//! The [`ExecutionServer`] owns everything a remote front end needs to look
//! at or change while pipelines run: the hosted pipeline and job maps, the
//! clustered port allocator, the server's own [`RemoteServer`] description
//! and the peer servers it knows about. Every part is synchronized on its
//! own; the server itself holds no lock.
//!
//! The wire protocol is not part of this crate. [`ExecutionServer::status`]
//! produces the serializable snapshot a front end would send.

pub mod hosted;
pub mod ports;

pub use hosted::{
    ExecutionStatus, HostedJob, HostedJobs, HostedKey, HostedObjectMap, HostedPipeline,
    HostedPipelines, HostedSummary,
};
pub use ports::{PortAllocationKey, PortAllocator, RunIdentifier};

use crate::config::{ClusterConfig, RemoteServer, RemoteServerConfig};
use crate::context::EngineContext;
use crate::error::Result;
use crate::pipeline::id::LogChannelId;
use crate::registry::{KeyedRegistry, LoggingObjectType, LoggingSource, RegisterPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Point-in-time status of an execution server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub base_url: String,
    pub master: bool,
    pub started_at: DateTime<Utc>,
    pub pipelines: Vec<HostedSummary>,
    pub jobs: Vec<HostedSummary>,
    pub allocated_ports: usize,
    pub peers: Vec<String>,
}

impl ServerStatus {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct ExecutionServer {
    engine: Arc<EngineContext>,
    identity: RemoteServer,
    log_channel_id: LogChannelId,
    pipelines: HostedPipelines,
    jobs: HostedJobs,
    ports: PortAllocator,
    port_range_start: u16,
    peers: KeyedRegistry<String, Arc<RemoteServer>>,
    started_at: DateTime<Utc>,
}

impl ExecutionServer {
    pub fn new(engine: Arc<EngineContext>, identity: RemoteServerConfig, cluster: &ClusterConfig) -> Self {
        let log_channel_id = engine
            .log_channels()
            .register(LoggingSource::new(LoggingObjectType::Server, &identity.name));
        tracing::info!(
            "Execution server '{}' ready on {} (ports {}+{})",
            identity.name,
            identity.base_url(),
            cluster.port_range_start,
            cluster.port_range_size
        );

        Self {
            engine,
            identity: RemoteServer::new(identity),
            log_channel_id,
            pipelines: HostedObjectMap::new("hosted pipelines"),
            jobs: HostedObjectMap::new("hosted jobs"),
            ports: PortAllocator::new(cluster.port_range_size),
            port_range_start: cluster.port_range_start,
            peers: KeyedRegistry::new("peer servers", RegisterPolicy::ReplaceExisting),
            started_at: Utc::now(),
        }
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    /// This server's own description; replace it to reconfigure live.
    pub fn identity(&self) -> &RemoteServer {
        &self.identity
    }

    pub fn log_channel_id(&self) -> LogChannelId {
        self.log_channel_id
    }

    // ── Pipelines ──

    pub fn add_pipeline(&self, pipeline: Arc<HostedPipeline>) -> Option<Arc<HostedPipeline>> {
        self.pipelines.add(pipeline.key().clone(), pipeline)
    }

    pub fn get_pipeline(&self, key: &HostedKey) -> Option<Arc<HostedPipeline>> {
        self.pipelines.get(key)
    }

    pub fn find_pipeline(&self, name: &str) -> Option<Arc<HostedPipeline>> {
        self.pipelines.find_by_name(name).map(|(_, p)| p)
    }

    /// Unhost a pipeline and release its log-channel subtree.
    pub fn remove_pipeline(&self, key: &HostedKey) -> Option<Arc<HostedPipeline>> {
        let removed = self.pipelines.remove(key)?;
        self.release_log_channels(removed.log_channel_id());
        Some(removed)
    }

    pub fn pipelines(&self) -> &HostedPipelines {
        &self.pipelines
    }

    // ── Jobs ──

    pub fn add_job(&self, job: Arc<HostedJob>) -> Option<Arc<HostedJob>> {
        self.jobs.add(job.key().clone(), job)
    }

    pub fn get_job(&self, key: &HostedKey) -> Option<Arc<HostedJob>> {
        self.jobs.get(key)
    }

    pub fn find_job(&self, name: &str) -> Option<Arc<HostedJob>> {
        self.jobs.find_by_name(name).map(|(_, j)| j)
    }

    /// Unhost a job and release its log-channel subtree.
    pub fn remove_job(&self, key: &HostedKey) -> Option<Arc<HostedJob>> {
        let removed = self.jobs.remove(key)?;
        self.release_log_channels(removed.log_channel_id());
        Some(removed)
    }

    pub fn jobs(&self) -> &HostedJobs {
        &self.jobs
    }

    fn release_log_channels(&self, id: LogChannelId) {
        // The server's own channel outlives any hosted entry.
        if id == self.log_channel_id {
            return;
        }
        let released = self.engine.log_channels().remove(id);
        if released > 0 {
            tracing::debug!("Released {} log channel(s) under {}", released, id);
        }
    }

    // ── Ports ──

    /// Port for a clustered hop, from the configured range.
    pub fn allocate_port(&self, key: &PortAllocationKey) -> Result<u16> {
        self.ports.allocate(key, self.port_range_start)
    }

    pub fn deallocate_port(&self, port: u16, host: &str) -> Option<PortAllocationKey> {
        self.ports.deallocate(port, host)
    }

    pub fn deallocate_run_ports(&self, run: &RunIdentifier) -> usize {
        self.ports.deallocate_all(run)
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    // ── Peers ──

    /// Remember a peer; a peer with the same name is replaced.
    pub fn register_peer(&self, config: RemoteServerConfig) -> Arc<RemoteServer> {
        assert!(!config.name.is_empty(), "peer server needs a name");
        let name = config.name.clone();
        let peer = Arc::new(RemoteServer::new(config));
        // Replace policy never rejects.
        if let Ok(Some(_)) = self.peers.register(name.clone(), Arc::clone(&peer)) {
            tracing::debug!("Peer '{}' replaced", name);
        }
        peer
    }

    pub fn peer(&self, name: &str) -> Option<Arc<RemoteServer>> {
        self.peers.get(name)
    }

    pub fn remove_peer(&self, name: &str) -> Option<Arc<RemoteServer>> {
        self.peers.remove(name)
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.list_keys()
    }

    /// Stop every hosted pipeline and job. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let pipelines = self.pipelines.list().iter().filter(|p| p.stop()).count();
        let jobs = self.jobs.list().iter().filter(|j| j.stop()).count();
        if pipelines + jobs > 0 {
            tracing::info!("Stopped {} pipeline(s) and {} job(s)", pipelines, jobs);
        }
        pipelines + jobs
    }

    pub fn status(&self) -> ServerStatus {
        let identity = self.identity.snapshot();
        let mut pipelines: Vec<_> = self.pipelines.list().iter().map(|p| p.summary()).collect();
        pipelines.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
        let mut jobs: Vec<_> = self.jobs.list().iter().map(|j| j.summary()).collect();
        jobs.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));

        ServerStatus {
            name: identity.name.clone(),
            base_url: identity.base_url(),
            master: identity.master,
            started_at: self.started_at,
            pipelines,
            jobs,
            allocated_ports: self.ports.len(),
            peers: self.peer_names(),
        }
    }
}

impl std::fmt::Debug for ExecutionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionServer")
            .field("identity", &self.identity)
            .field("pipelines", &self.pipelines.len())
            .field("jobs", &self.jobs.len())
            .field("ports", &self.ports)
            .finish()
    }
}
