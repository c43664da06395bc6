//! # Component
//!
//! Entry point of the engine. A component wires together the code registry,
//! the hook and probe managers, the payload builder, the delivery worker and
//! the remote configuration processor, on top of a host runtime.

use std::sync::{Arc, Weak};

use anyhow::Result;
use log::{debug, info};

use crate::{
    capture::{Limits, Redactor, Serializer},
    config::Settings,
    core::{
        code::CodeRegistry,
        hook::{HookManager, HostRuntime},
        probe::ProbeManager,
    },
    notify::{AgentTransport, DeliveryWorker, EventSink, NotificationBuilder, Transport},
    remote::RemoteProcessor,
};

pub struct Component {
    runtime: Arc<dyn HostRuntime>,
    code_registry: Arc<CodeRegistry>,
    hooks: Arc<HookManager>,
    probes: Arc<ProbeManager>,
    processor: RemoteProcessor,
    worker: Arc<DeliveryWorker>,
}

impl Component {
    /// Build a component delivering to the agent described in the settings.
    /// Returns `None` if dynamic instrumentation is disabled.
    pub fn build(settings: &Settings, runtime: Arc<dyn HostRuntime>) -> Result<Option<Self>> {
        if !settings.enabled {
            debug!("Dynamic instrumentation disabled");
            return Ok(None);
        }

        let transport = AgentTransport::new(&settings.agent)?;
        info!("Sending payloads to {}", settings.agent.base_url());
        Ok(Some(Self::with_transport(
            settings,
            runtime,
            Box::new(transport),
        )?))
    }

    /// Build a component using a custom transport. The `enabled` setting is
    /// not looked at.
    pub fn with_transport(
        settings: &Settings,
        runtime: Arc<dyn HostRuntime>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let redactor = Redactor::new(settings)?;
        let serializer = Arc::new(Serializer::new(redactor, Limits::from(settings)));
        let builder = Arc::new(NotificationBuilder::new(
            settings.service.as_str(),
            serializer,
        ));

        let worker = Arc::new(DeliveryWorker::start(transport, &settings.delivery)?);
        let sink: Arc<dyn EventSink> = worker.clone();

        let code_registry = Arc::new(CodeRegistry::new());
        code_registry.start(runtime.as_ref());

        let hooks = Arc::new(HookManager::new(
            Arc::clone(&runtime),
            Some(Arc::clone(&code_registry)),
            settings.untargeted_trace_points,
        ));
        hooks.subscribe();

        let propagate = settings.propagate_all_exceptions;
        let probes = Arc::new(ProbeManager::new(
            Arc::clone(&hooks),
            Arc::clone(&builder),
            Arc::clone(&sink),
            propagate,
        ));
        hooks.set_install_observer(Arc::downgrade(&probes) as Weak<ProbeManager>);

        let processor = RemoteProcessor::new(Arc::clone(&probes), builder, sink, propagate);

        info!("Dynamic instrumentation started for {}", settings.service);
        Ok(Self {
            runtime,
            code_registry,
            hooks,
            probes,
            processor,
            worker,
        })
    }

    pub fn processor(&self) -> &RemoteProcessor {
        &self.processor
    }

    pub fn probes(&self) -> &Arc<ProbeManager> {
        &self.probes
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    pub fn code_registry(&self) -> &Arc<CodeRegistry> {
        &self.code_registry
    }

    /// Number of status and snapshot events dropped because a queue was full.
    pub fn dropped_events(&self) -> (u64, u64) {
        self.worker.dropped()
    }

    /// Remove all hooks, stop following the host events and stop delivering.
    /// Undelivered events are dropped.
    pub fn shutdown(&self) {
        self.probes.close();
        self.code_registry.stop(self.runtime.as_ref());
        self.worker.stop();
        info!("Dynamic instrumentation stopped");
    }
}
