//! Test data builders for creating test objects

use rowflow::config::RemoteServerConfig;
use rowflow::server::PortAllocationKey;
use rowflow::{Row, Value};

/// Builder for creating test Rows
pub struct RowBuilder {
    values: Vec<Value>,
}

impl RowBuilder {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn int(mut self, v: i64) -> Self {
        self.values.push(Value::Integer(v));
        self
    }

    pub fn text(mut self, v: &str) -> Self {
        self.values.push(Value::String(v.to_string()));
        self
    }

    pub fn null(mut self) -> Self {
        self.values.push(Value::Null);
        self
    }

    pub fn build(self) -> Row {
        Row::new(self.values)
    }
}

/// Single-column integer row
pub fn int_row(v: i64) -> Row {
    RowBuilder::new().int(v).build()
}

/// Builder for port allocation keys of one clustered run
pub struct PortKeyBuilder {
    host: String,
    run_id: String,
    pipeline: String,
}

impl PortKeyBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            run_id: "run-1".to_string(),
            pipeline: "load-sales".to_string(),
        }
    }

    pub fn run(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    pub fn pipeline(mut self, name: &str) -> Self {
        self.pipeline = name.to_string();
        self
    }

    /// Key for the hop `Read.0 -> Write.<target_copy>`
    pub fn hop(&self, target_copy: u32) -> PortAllocationKey {
        PortAllocationKey::new(&self.host, &self.run_id, &self.pipeline)
            .source("master", "Read", 0)
            .target(&self.host, "Write", target_copy)
    }
}

/// Remote server whose every field carries the same tag
pub fn tagged_server(tag: u64) -> RemoteServerConfig {
    RemoteServerConfig::new(format!("server-{tag}"), format!("host-{tag}"), (tag % 60_000) as u16)
        .with_credentials(format!("user-{tag}"), format!("pass-{tag}"))
        .with_proxy(format!("proxy-{tag}"), (tag % 60_000) as u16)
        .with_web_app_name(format!("app-{tag}"))
        .with_non_proxy_hosts(format!("*.zone-{tag}"))
}

/// Tag shared by all fields, or `None` if fields disagree
pub fn tag_of(config: &RemoteServerConfig) -> Option<u64> {
    let tag: u64 = config.name.strip_prefix("server-")?.parse().ok()?;
    let consistent = config.hostname == format!("host-{tag}")
        && u64::from(config.port) == tag % 60_000
        && config.username == format!("user-{tag}")
        && config.password == format!("pass-{tag}")
        && config.proxy_hostname.as_deref() == Some(format!("proxy-{tag}").as_str())
        && config.proxy_port.map(u64::from) == Some(tag % 60_000)
        && config.web_app_name.as_deref() == Some(format!("app-{tag}").as_str())
        && config.non_proxy_hosts.as_deref() == Some(format!("*.zone-{tag}").as_str());
    consistent.then_some(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder() {
        let row = RowBuilder::new().int(1).text("a").null().build();
        assert_eq!(row.arity(), 3);
        assert_eq!(row.get(1).and_then(Value::as_str), Some("a"));
    }

    #[test]
    fn test_tagged_server_round_trips_tag() {
        assert_eq!(tag_of(&tagged_server(17)), Some(17));
        let mut mixed = tagged_server(17);
        mixed.hostname = "host-18".into();
        assert_eq!(tag_of(&mixed), None);
    }
}
