//! Interfaces to the collaborators a domain is built from.
//!
//! The wire protocol, transports, discovery and builtin-topic publication live
//! behind these traits. The `Null*` implementations let a runtime run without
//! any of them.

use crate::config::{Config, ConfigLoader, StaticConfigLoader, ThreadProperties};
use crate::error::Result;
use crate::sync::Arc;
use std::time::Duration;

/// Creates protocol engine instances from a domain configuration.
pub trait EngineFactory: Send + Sync {
    fn prepare(&self, config: &Config) -> Result<Box<dyn ProtocolEngine>>;
}

/// The protocol stack of one domain (network transport, discovery, ...).
///
/// Call order is `start`, `begin_processing`, then on teardown `stop` and
/// `shutdown`, each teardown call only if its counterpart succeeded.
///
/// 单个域的协议栈。调用顺序为 `start`、`begin_processing`，拆除时依次为
/// `stop` 与 `shutdown`，且仅在对应的启动调用成功后才会调用。
pub trait ProtocolEngine: Send {
    fn start(&mut self) -> Result<()>;
    fn begin_processing(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn shutdown(&mut self);
}

/// Creates the process-wide liveliness monitor.
pub trait MonitorFactory: Send + Sync {
    fn create(
        &self,
        interval: Duration,
        log_stacktraces: bool,
    ) -> Result<Box<dyn LivelinessMonitor>>;
}

/// Watches internal threads for lack of progress.
pub trait LivelinessMonitor: Send {
    fn start(&mut self, name: &str, props: &ThreadProperties) -> Result<()>;
    fn stop(&mut self);
    fn destroy(self: Box<Self>) {}
}

/// Builtin-topic support attached to each domain.
pub trait BuiltinTopics: Send + Sync {
    fn init(&self, domain_id: u32);
    fn fini(&self, domain_id: u32);
}

/// Everything a domain lifecycle needs from the outside.
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn ConfigLoader>,
    pub engine: Arc<dyn EngineFactory>,
    pub monitor: Arc<dyn MonitorFactory>,
    pub builtins: Arc<dyn BuiltinTopics>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            config: Arc::new(StaticConfigLoader::default()),
            engine: Arc::new(NullEngine),
            monitor: Arc::new(NullMonitor),
            builtins: Arc::new(NullBuiltins),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Engine that does nothing and never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEngine;

impl EngineFactory for NullEngine {
    fn prepare(&self, _config: &Config) -> Result<Box<dyn ProtocolEngine>> {
        Ok(Box::new(NullEngine))
    }
}

impl ProtocolEngine for NullEngine {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_processing(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl MonitorFactory for NullMonitor {
    fn create(&self, _: Duration, _: bool) -> Result<Box<dyn LivelinessMonitor>> {
        Ok(Box::new(NullMonitor))
    }
}

impl LivelinessMonitor for NullMonitor {
    fn start(&mut self, _name: &str, _props: &ThreadProperties) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullBuiltins;

impl BuiltinTopics for NullBuiltins {
    fn init(&self, _domain_id: u32) {}

    fn fini(&self, _domain_id: u32) {}
}

/// Identification metadata advertised by participants of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantDefaults {
    pub process_id: u32,
    pub exec_name: String,
    pub node_name: Option<String>,
    pub entity_name: String,
}

impl ParticipantDefaults {
    /// Collect identification for the current process.
    pub fn collect() -> Self {
        let process_id = std::process::id();
        let program = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        Self {
            process_id,
            exec_name: format!("dds-lifecycle: {}", process_id),
            node_name: host_name(),
            entity_name: format!("{}<{}>", program, process_id),
        }
    }
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
