//! Remote execution server descriptions.
//!
//! [`RemoteServerConfig`] is the plain, serializable record. [`RemoteServer`]
//! is the shared handle the engine passes around: its fields can be replaced
//! wholesale by any thread (e.g. a config reload) while other threads read
//! them, and every read sees exactly one generation of the record.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Connection details of one remote execution server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub name: String,
    pub hostname: String,
    pub port: u16,

    /// Path prefix of the server's web application
    #[serde(default)]
    pub web_app_name: Option<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub proxy_hostname: Option<String>,

    #[serde(default)]
    pub proxy_port: Option<u16>,

    /// `|`-separated hosts reached without the proxy; `*` matches a prefix
    #[serde(default)]
    pub non_proxy_hosts: Option<String>,

    /// This server coordinates clustered runs
    #[serde(default)]
    pub master: bool,

    #[serde(default)]
    pub ssl: bool,
}

impl RemoteServerConfig {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port,
            web_app_name: None,
            username: String::new(),
            password: String::new(),
            proxy_hostname: None,
            proxy_port: None,
            non_proxy_hosts: None,
            master: false,
            ssl: false,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_proxy(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.proxy_hostname = Some(hostname.into());
        self.proxy_port = Some(port);
        self
    }

    pub fn with_non_proxy_hosts(mut self, hosts: impl Into<String>) -> Self {
        self.non_proxy_hosts = Some(hosts.into());
        self
    }

    pub fn with_web_app_name(mut self, name: impl Into<String>) -> Self {
        self.web_app_name = Some(name.into());
        self
    }

    pub fn as_master(mut self) -> Self {
        self.master = true;
        self
    }

    pub fn with_ssl(mut self) -> Self {
        self.ssl = true;
        self
    }

    /// `http[s]://host:port[/webapp]`
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        match self.web_app_name.as_deref().map(|w| w.trim_matches('/')) {
            Some(app) if !app.is_empty() => {
                format!("{}://{}:{}/{}", scheme, self.hostname, self.port, app)
            }
            _ => format!("{}://{}:{}", scheme, self.hostname, self.port),
        }
    }

    pub fn service_url(&self, service: &str) -> String {
        format!("{}/{}", self.base_url(), service.trim_start_matches('/'))
    }

    /// Whether requests to `host` skip the proxy.
    pub fn bypasses_proxy(&self, host: &str) -> bool {
        if self.proxy_hostname.as_deref().map_or(true, str::is_empty) {
            return true;
        }
        let Some(patterns) = &self.non_proxy_hosts else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        patterns
            .split('|')
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .any(|pattern| match pattern.strip_prefix('*') {
                Some(suffix) => host.ends_with(suffix),
                None => host == pattern,
            })
    }
}

impl fmt::Display for RemoteServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.hostname, self.port)
    }
}

/// Shared, atomically replaceable view of a [`RemoteServerConfig`].
pub struct RemoteServer {
    current: ArcSwap<RemoteServerConfig>,
    generation: AtomicU64,
}

impl RemoteServer {
    pub fn new(config: RemoteServerConfig) -> Self {
        Self::from_snapshot(Arc::new(config))
    }

    fn from_snapshot(snapshot: Arc<RemoteServerConfig>) -> Self {
        Self {
            current: ArcSwap::new(snapshot),
            generation: AtomicU64::new(0),
        }
    }

    /// Swap in a whole new record.
    pub fn replace(&self, config: RemoteServerConfig) {
        self.current.store(Arc::new(config));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Change some fields, retrying if another thread replaced the record
    /// meanwhile.
    pub fn update(&self, mut f: impl FnMut(&mut RemoteServerConfig)) {
        self.current.rcu(|current| {
            let mut next = RemoteServerConfig::clone(current);
            f(&mut next);
            next
        });
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Current generation, shared.
    pub fn snapshot(&self) -> Arc<RemoteServerConfig> {
        self.current.load_full()
    }

    /// Current generation, owned.
    pub fn clone_config(&self) -> RemoteServerConfig {
        RemoteServerConfig::clone(&self.current.load())
    }

    /// Number of replacements so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn name(&self) -> String {
        self.current.load().name.clone()
    }

    pub fn hostname(&self) -> String {
        self.current.load().hostname.clone()
    }

    pub fn port(&self) -> u16 {
        self.current.load().port
    }

    pub fn web_app_name(&self) -> Option<String> {
        self.current.load().web_app_name.clone()
    }

    pub fn username(&self) -> String {
        self.current.load().username.clone()
    }

    pub fn password(&self) -> String {
        self.current.load().password.clone()
    }

    pub fn proxy_hostname(&self) -> Option<String> {
        self.current.load().proxy_hostname.clone()
    }

    pub fn proxy_port(&self) -> Option<u16> {
        self.current.load().proxy_port
    }

    pub fn non_proxy_hosts(&self) -> Option<String> {
        self.current.load().non_proxy_hosts.clone()
    }

    pub fn is_master(&self) -> bool {
        self.current.load().master
    }

    pub fn is_ssl(&self) -> bool {
        self.current.load().ssl
    }

    pub fn base_url(&self) -> String {
        self.current.load().base_url()
    }

    pub fn service_url(&self, service: &str) -> String {
        self.current.load().service_url(service)
    }

    pub fn bypasses_proxy(&self, host: &str) -> bool {
        self.current.load().bypasses_proxy(host)
    }
}

impl Clone for RemoteServer {
    /// Independent handle starting from the current generation.
    fn clone(&self) -> Self {
        Self::from_snapshot(self.snapshot())
    }
}

impl From<RemoteServerConfig> for RemoteServer {
    fn from(config: RemoteServerConfig) -> Self {
        Self::new(config)
    }
}

impl fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.load();
        f.debug_struct("RemoteServer")
            .field("name", &current.name)
            .field("hostname", &current.hostname)
            .field("port", &current.port)
            .field("generation", &self.generation())
            .finish()
    }
}

impl fmt::Display for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self.current.load(), f)
    }
}
