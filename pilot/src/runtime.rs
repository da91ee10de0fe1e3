//! Startup wiring: builds the shared collaborators from configuration.
//!
//! Everything long-lived (event sink, fix registry, dispatcher, model router,
//! stop signal) is created once here and handed out as `Arc`s. Planners are
//! cheap to create from a [`Runtime`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cancel::StopSignal;
use crate::events::EventSink;
use crate::fix_registry::FixRegistry;
use crate::io::config::{PilotConfig, load_config};
use crate::llm::LlmBackend;
use crate::llm::router::ModelRouter;
use crate::planner::{Planner, PlannerDeps};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::{Handler, ToolId, ToolRegistry, handlers};

pub struct Runtime {
    pub config: PilotConfig,
    pub events: Arc<EventSink>,
    pub fixes: Arc<FixRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub llm: Arc<dyn LlmBackend>,
    pub stop: StopSignal,
}

impl Runtime {
    /// Load and validate `path`, then build the runtime with HTTP backends.
    pub fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Self::from_config(config)
    }

    pub fn from_config(config: PilotConfig) -> Result<Self> {
        let events = Arc::new(EventSink::new(config.events.history_capacity));
        let llm: Arc<dyn LlmBackend> = Arc::new(
            ModelRouter::from_config(&config.llm, events.clone())
                .context("configure model backends")?,
        );
        let handlers = handlers::builtin(&config, events.clone());
        Self::assemble(config, events, llm, handlers)
    }

    /// Build with an explicit backend and handler set (embedders, tests).
    ///
    /// Embedders add browser or mail handlers here; tools without a handler
    /// are not advertised.
    pub fn with_parts(
        config: PilotConfig,
        events: Arc<EventSink>,
        llm: Arc<dyn LlmBackend>,
        handlers: Vec<(ToolId, Arc<dyn Handler>)>,
    ) -> Result<Self> {
        Self::assemble(config, events, llm, handlers)
    }

    fn assemble(
        config: PilotConfig,
        events: Arc<EventSink>,
        llm: Arc<dyn LlmBackend>,
        handlers: Vec<(ToolId, Arc<dyn Handler>)>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = ToolRegistry::from_handlers(handlers).context("build tool registry")?;
        debug!(tools = ?registry.ids().collect::<Vec<_>>(), "tool registry ready");
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            events.clone(),
            Duration::from_secs(config.tools.handler_timeout_secs),
        ));
        let fixes = Arc::new(FixRegistry::open(
            &config.fixes.path,
            config.fixes.max_entries,
            events.clone(),
        ));
        info!(
            backend = llm.name(),
            fixes = fixes.len(),
            persistent = !fixes.is_degraded(),
            "runtime ready"
        );
        Ok(Self {
            config,
            events,
            fixes,
            dispatcher,
            llm,
            stop: StopSignal::new(),
        })
    }

    pub fn planner(&self) -> Result<Planner> {
        Planner::new(
            PlannerDeps {
                llm: self.llm.clone(),
                dispatcher: self.dispatcher.clone(),
                fixes: self.fixes.clone(),
                events: self.events.clone(),
                stop: self.stop.clone(),
            },
            &self.config,
        )
    }
}
