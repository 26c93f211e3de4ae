//! Bridge node: runtime plus dispatcher under one lifecycle

use crate::dispatcher::{create_sync_channel, LoggingSessionSink, SessionSink, SyncDispatcher};
use crate::runtime::BridgeRuntime;
use enginelink_core::{BridgeConfig, BridgeResult};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Full EngineLink bridge node
pub struct BridgeNode {
    runtime: Arc<BridgeRuntime>,
    dispatcher: Arc<SyncDispatcher>,
}

impl BridgeNode {
    /// Create a new node
    pub fn new(config: BridgeConfig, sink: Arc<dyn SessionSink>) -> BridgeResult<Self> {
        let runtime = Arc::new(BridgeRuntime::new(config)?);
        let dispatcher = Arc::new(SyncDispatcher::new(runtime.engine().clone(), sink));
        Ok(Self {
            runtime,
            dispatcher,
        })
    }

    /// Run until ctrl-c
    pub async fn start(&self) -> anyhow::Result<()> {
        self.run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received, stopping node..."),
                Err(e) => error!("Error waiting for shutdown signal: {}", e),
            }
        })
        .await
    }

    /// Run until `shutdown` completes, then stop all background work
    pub async fn run_until<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting EngineLink node '{}'...", self.runtime.config().name);

        let (tx, rx) = create_sync_channel();
        let forward = self.runtime.engine().events().forward_to(tx);
        let dispatch_handle = tokio::spawn(self.dispatcher.clone().run(rx));

        if let Err(e) = self.runtime.start() {
            self.runtime.engine().events().off(forward);
            dispatch_handle.abort();
            return Err(e.into());
        }
        info!("Node started successfully");

        shutdown.await;

        // Dropping the forwarder closes the channel and ends the dispatcher
        self.runtime.engine().events().off(forward);
        self.runtime.stop();
        if let Err(e) = dispatch_handle.await {
            error!("Dispatcher task failed: {}", e);
        }

        info!("Node stopped");
        Ok(())
    }

    /// Get runtime reference
    pub fn runtime(&self) -> &Arc<BridgeRuntime> {
        &self.runtime
    }

    /// Get dispatcher reference
    pub fn dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.dispatcher
    }
}

/// Node builder for easier configuration
pub struct NodeBuilder {
    config: BridgeConfig,
    sink: Option<Arc<dyn SessionSink>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            sink: None,
        }
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> BridgeResult<BridgeNode> {
        let sink: Arc<dyn SessionSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(LoggingSessionSink),
        };
        BridgeNode::new(self.config, sink)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
