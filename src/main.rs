//! rowflow - demo entry point
//!
//! Loads the engine config, starts a local execution server, runs a small
//! pipeline through it and prints the server status as JSON.

use anyhow::Context;
use rowflow::{
    config::{self, EngineConfig},
    pipeline::{RowDistribution, Row, Step, StepContext, StepStatus, Value},
    registry::{PluginDescriptor, PluginType},
    server::{ExecutionStatus, HostedKey, HostedPipeline, PortAllocationKey},
    EngineContext, ExecutionServer, PipelineBuilder, RemoteServerConfig,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Emits the integers `0..count`.
struct Sequence {
    next: i64,
    count: i64,
}

impl Step for Sequence {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        if self.next >= self.count || !ctx.put_row(Row::new(vec![Value::Integer(self.next)])) {
            return Ok(StepStatus::Finished);
        }
        self.next += 1;
        Ok(StepStatus::Continue)
    }
}

/// Multiplies the first column by two.
struct Double;

impl Step for Double {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        let Some(row) = ctx.get_row() else {
            return Ok(StepStatus::Finished);
        };
        match row.get(0).and_then(Value::as_integer) {
            Some(v) => {
                ctx.put_row(Row::new(vec![Value::Integer(v * 2)]));
            }
            None => ctx.put_error_row(&row),
        }
        Ok(StepStatus::Continue)
    }
}

/// Sums the first column.
struct Total {
    sum: i64,
}

impl Step for Total {
    fn process_row(&mut self, ctx: &StepContext) -> rowflow::Result<StepStatus> {
        match ctx.get_row() {
            Some(row) => {
                self.sum += row.get(0).and_then(Value::as_integer).unwrap_or(0);
                Ok(StepStatus::Continue)
            }
            None => Ok(StepStatus::Finished),
        }
    }

    fn dispose(&mut self) {
        tracing::info!("Total: {}", self.sum);
    }
}

fn register_builtin_plugins(engine: &EngineContext) -> rowflow::Result<()> {
    let plugins = engine.plugins();
    plugins.register(
        PluginDescriptor::new(PluginType::Step, "Sequence", "Generate sequence").with_category("Input"),
    )?;
    plugins.register(
        PluginDescriptor::new(PluginType::Step, "Calculator", "Double values")
            .with_alias("Double")
            .with_category("Transform"),
    )?;
    plugins.register(
        PluginDescriptor::new(PluginType::Step, "GroupBy", "Total").with_category("Statistics"),
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config_path = config::config_path_from_env();
    let config = match &config_path {
        Some(path) => EngineConfig::load_or_default(path),
        None => EngineConfig::default(),
    };

    // Initialize logging
    let (file_layer, _file_guard) = match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rowflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    tracing::info!("Starting rowflow");
    if let Some(path) = &config_path {
        tracing::debug!("Config path: {}", path.display());
    }

    let engine = Arc::new(EngineContext::new(&config));
    register_builtin_plugins(&engine).context("registering built-in plugins")?;

    let server = ExecutionServer::new(
        Arc::clone(&engine),
        RemoteServerConfig::new("local", "localhost", 8080).as_master(),
        &config.cluster,
    );
    for peer in &config.remote_servers {
        server.register_peer(peer.clone());
    }

    let mut pipeline = PipelineBuilder::new("double-and-total", Arc::clone(&engine))
        .parent_log_channel(server.log_channel_id())
        .add_step("sequence", 1, |_| Box::new(Sequence { next: 0, count: 1_000 }) as Box<dyn Step>)
        .add_step_with_distribution("double", 2, RowDistribution::RoundRobin, |_| {
            Box::new(Double) as Box<dyn Step>
        })
        .add_step("total", 1, |_| Box::new(Total { sum: 0 }) as Box<dyn Step>)
        .add_hop("sequence", "double")
        .add_hop("double", "total")
        .build()
        .context("building demo pipeline")?;

    let key = HostedKey::new(pipeline.name(), pipeline.run_id());
    let hosted = Arc::new(
        HostedPipeline::new(key.clone(), pipeline.log_channel_id()).with_control(pipeline.control()),
    );
    server.add_pipeline(Arc::clone(&hosted));

    // Ports a clustered version of this run would use on each peer.
    for peer in server.peer_names() {
        let hop = PortAllocationKey::new(&peer, pipeline.run_id(), pipeline.name())
            .source("local", "sequence", 0)
            .target(&peer, "double", 0);
        let port = server.allocate_port(&hop)?;
        tracing::info!("Reserved port {} on {}", port, peer);
    }

    hosted.set_status(ExecutionStatus::Running);
    pipeline.start()?;
    let result = pipeline.wait_until_finished()?;
    hosted.set_status(if result.is_success() {
        ExecutionStatus::Finished
    } else {
        ExecutionStatus::FinishedWithErrors
    });

    println!("{}", server.status().to_json()?);

    server.deallocate_run_ports(&rowflow::server::RunIdentifier::new(pipeline.run_id(), pipeline.name()));
    server.remove_pipeline(&key);
    engine.shutdown();

    anyhow::ensure!(result.is_success(), "pipeline finished with {} error(s)", result.errors);
    Ok(())
}
