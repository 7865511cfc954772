use crate::collab::{ParticipantDefaults, ProtocolEngine};
use crate::config::{CONFIG_URI_ENV, Config};
use crate::error::{Error, Result};
use crate::registry::{DomainRegistry, MAX_DOMAIN_ID};
use log::{debug, error, warn};

/// Name under which the liveliness monitor thread is started.
pub(crate) const MONITOR_THREAD_NAME: &str = "threadmon";

/// Start-up steps of a domain, in order. Each has a matching teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Config,
    EngineConfig,
    Monitor,
    EngineStarted,
    Builtins,
    Processing,
    MonitorStarted,
    Identification,
}

/// Resources held by a started (or partially started) domain.
///
/// `steps` records what completed; teardown pops it, so a failed start-up
/// and a regular stop share one unwind path and nothing is undone twice.
///
/// 已启动（或部分启动）的域所持有的资源。`steps` 记录已完成的步骤；
/// 拆除时逆序弹出，因此启动失败与正常停止共享同一条回滚路径，不会重复回滚。
pub(crate) struct DomainStack {
    id: u32,
    config: Config,
    engine: Option<Box<dyn ProtocolEngine>>,
    steps: Vec<Step>,
}

impl DomainStack {
    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn steps(&self) -> &[Step] {
        &self.steps
    }

    fn run(
        &mut self,
        registry: &DomainRegistry,
        requested: Option<u32>,
    ) -> Result<ParticipantDefaults> {
        let collab = registry.collaborators();

        self.id = reconcile(&mut self.config, requested)?;

        let engine = self.engine.insert(collab.engine.prepare(&self.config).map_err(|e| {
            warn!("[Lifecycle] failed to configure protocol engine: {}", e);
            e
        })?);
        self.steps.push(Step::EngineConfig);

        let monitoring = self.config.liveliness_monitoring;
        let mut created_monitor = false;
        if monitoring {
            created_monitor = registry.acquire_monitor(&self.config)?;
            self.steps.push(Step::Monitor);
        }

        engine.start().map_err(|e| {
            warn!("[Lifecycle] failed to start protocol engine: {}", e);
            e
        })?;
        self.steps.push(Step::EngineStarted);

        collab.builtins.init(self.id);
        self.steps.push(Step::Builtins);

        engine.begin_processing().map_err(|e| {
            warn!("[Lifecycle] protocol engine failed to begin processing: {}", e);
            e
        })?;
        self.steps.push(Step::Processing);

        if monitoring && created_monitor {
            registry.start_monitor(&self.config)?;
            self.steps.push(Step::MonitorStarted);
        }

        let defaults = ParticipantDefaults::collect();
        self.steps.push(Step::Identification);
        Ok(defaults)
    }

    /// Undo every completed step in reverse order.
    pub(crate) fn teardown(mut self, registry: &DomainRegistry) {
        let collab = registry.collaborators();
        while let Some(step) = self.steps.pop() {
            debug!("[Lifecycle] domain {}: undo {:?}", self.id, step);
            match step {
                Step::Identification => {}
                Step::MonitorStarted => registry.stop_monitor_if_last(),
                Step::Processing => {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.stop();
                    }
                }
                Step::Builtins => collab.builtins.fini(self.id),
                Step::EngineStarted => {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.shutdown();
                    }
                }
                Step::Monitor => registry.release_monitor(),
                Step::EngineConfig => self.engine = None,
                Step::Config => collab.config.release(std::mem::take(&mut self.config)),
            }
        }
    }
}

/// Run the start sequence for a domain.
///
/// `requested` is `None` for the default domain. On failure every completed
/// step is undone before the first error is returned.
///
/// 运行域的启动序列。默认域的 `requested` 为 `None`。
/// 失败时，在返回第一个错误之前撤销所有已完成的步骤。
pub(crate) fn start(
    registry: &DomainRegistry,
    requested: Option<u32>,
) -> Result<(DomainStack, ParticipantDefaults)> {
    let source = std::env::var(CONFIG_URI_ENV).ok();
    let config = registry
        .collaborators()
        .config
        .parse(source.as_deref())
        .map_err(|e| {
            warn!(
                "[Lifecycle] failed to parse configuration {:?}: {}",
                source, e
            );
            e
        })?;

    let mut stack = DomainStack {
        id: requested.unwrap_or(0),
        config,
        engine: None,
        steps: vec![Step::Config],
    };

    match stack.run(registry, requested) {
        Ok(defaults) => {
            debug!("[Lifecycle] domain {} started", stack.id);
            Ok((stack, defaults))
        }
        Err(e) => {
            stack.teardown(registry);
            Err(e)
        }
    }
}

/// Check the requested id against the configuration and fix the latter up.
pub(crate) fn reconcile(config: &mut Config, requested: Option<u32>) -> Result<u32> {
    let id = match (requested, config.domain_id) {
        (Some(id), _) if id > MAX_DOMAIN_ID => {
            error!("[Lifecycle] requested domain id {} is out of range", id);
            return Err(Error::BadParameter(format!(
                "domain id {} outside 0..={}",
                id, MAX_DOMAIN_ID
            )));
        }
        (Some(id), None) => id,
        (Some(id), Some(configured)) if id == configured => id,
        (Some(id), Some(configured)) => {
            error!(
                "[Lifecycle] requested domain id {} is inconsistent with configured value {}",
                id, configured
            );
            return Err(Error::PreconditionNotMet(format!(
                "requested domain id {} but configuration says {}",
                id, configured
            )));
        }
        (None, Some(configured)) if configured > MAX_DOMAIN_ID => {
            error!("[Lifecycle] configured domain id {} is out of range", configured);
            return Err(Error::BadParameter(format!(
                "configured domain id {} outside 0..={}",
                configured, MAX_DOMAIN_ID
            )));
        }
        (None, Some(configured)) => configured,
        (None, None) => 0,
    };
    config.domain_id = Some(id);
    Ok(id)
}
