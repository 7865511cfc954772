/// 测试辅助：记录调用顺序的协作者替身和可观察的托管对象
use crate::collab::{
    BuiltinTopics, Collaborators, EngineFactory, LivelinessMonitor, MonitorFactory,
    ProtocolEngine,
};
use crate::config::{Config, ConfigLoader, ThreadProperties};
use crate::error::{Error, Result};
use crate::gc::GcQueue;
use crate::handle::{HandleTable, Managed};
use crate::vtime::ThreadStates;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 共享的调用日志
#[derive(Clone, Default)]
pub(crate) struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// 在指定步骤失败的协作者集合
#[derive(Clone, Default)]
pub(crate) struct Script {
    pub(crate) fail_at: Option<&'static str>,
    pub(crate) start_delay: Option<Duration>,
}

struct RecordingLoader {
    log: Recorder,
    config: Config,
    script: Script,
}

impl ConfigLoader for RecordingLoader {
    fn parse(&self, _source: Option<&str>) -> Result<Config> {
        self.log.push("config.parse");
        if self.script.fail_at == Some("config.parse") {
            return Err(Error::Collaborator("config.parse".into()));
        }
        Ok(self.config.clone())
    }

    fn release(&self, _config: Config) {
        self.log.push("config.release");
    }
}

struct RecordingEngineFactory {
    log: Recorder,
    script: Script,
}

impl EngineFactory for RecordingEngineFactory {
    fn prepare(&self, _config: &Config) -> Result<Box<dyn ProtocolEngine>> {
        self.log.push("engine.prepare");
        if self.script.fail_at == Some("engine.prepare") {
            return Err(Error::Collaborator("engine.prepare".into()));
        }
        Ok(Box::new(RecordingEngine {
            log: self.log.clone(),
            script: self.script.clone(),
        }))
    }
}

struct RecordingEngine {
    log: Recorder,
    script: Script,
}

impl ProtocolEngine for RecordingEngine {
    fn start(&mut self) -> Result<()> {
        if let Some(delay) = self.script.start_delay {
            std::thread::sleep(delay);
        }
        self.log.push("engine.start");
        if self.script.fail_at == Some("engine.start") {
            return Err(Error::Collaborator("engine.start".into()));
        }
        Ok(())
    }

    fn begin_processing(&mut self) -> Result<()> {
        self.log.push("engine.begin");
        if self.script.fail_at == Some("engine.begin") {
            return Err(Error::Collaborator("engine.begin".into()));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.log.push("engine.stop");
    }

    fn shutdown(&mut self) {
        self.log.push("engine.shutdown");
    }
}

struct RecordingMonitorFactory {
    log: Recorder,
    script: Script,
}

impl MonitorFactory for RecordingMonitorFactory {
    fn create(&self, _interval: Duration, _log_stacktraces: bool) -> Result<Box<dyn LivelinessMonitor>> {
        self.log.push("monitor.create");
        if self.script.fail_at == Some("monitor.create") {
            return Err(Error::Collaborator("monitor.create".into()));
        }
        Ok(Box::new(RecordingMonitor {
            log: self.log.clone(),
            script: self.script.clone(),
        }))
    }
}

struct RecordingMonitor {
    log: Recorder,
    script: Script,
}

impl LivelinessMonitor for RecordingMonitor {
    fn start(&mut self, name: &str, _props: &ThreadProperties) -> Result<()> {
        self.log.push(format!("monitor.start {}", name));
        if self.script.fail_at == Some("monitor.start") {
            return Err(Error::Collaborator("monitor.start".into()));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.log.push("monitor.stop");
    }

    fn destroy(self: Box<Self>) {
        self.log.push("monitor.destroy");
    }
}

struct RecordingBuiltins {
    log: Recorder,
}

impl BuiltinTopics for RecordingBuiltins {
    fn init(&self, domain_id: u32) {
        self.log.push(format!("builtins.init {}", domain_id));
    }

    fn fini(&self, domain_id: u32) {
        self.log.push(format!("builtins.fini {}", domain_id));
    }
}

/// 构造一组把每次调用写入 `log` 的协作者
pub(crate) fn recording(log: &Recorder, config: Config, script: Script) -> Collaborators {
    Collaborators {
        config: Arc::new(RecordingLoader {
            log: log.clone(),
            config,
            script: script.clone(),
        }),
        engine: Arc::new(RecordingEngineFactory {
            log: log.clone(),
            script: script.clone(),
        }),
        monitor: Arc::new(RecordingMonitorFactory {
            log: log.clone(),
            script,
        }),
        builtins: Arc::new(RecordingBuiltins { log: log.clone() }),
    }
}

/// 统计 close 与 drop 次数的托管对象
pub(crate) struct Probe {
    pub(crate) closes: Arc<AtomicUsize>,
    pub(crate) drops: Arc<AtomicUsize>,
    pub(crate) closed: AtomicBool,
    pub(crate) deferred: bool,
}

impl Probe {
    pub(crate) fn new(
        closes: &Arc<AtomicUsize>,
        drops: &Arc<AtomicUsize>,
        deferred: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            closes: Arc::clone(closes),
            drops: Arc::clone(drops),
            closed: AtomicBool::new(false),
            deferred,
        })
    }
}

impl Managed for Probe {
    fn close(&self) {
        assert!(!self.closed.swap(true, Ordering::SeqCst), "closed twice");
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn deferred_free(&self) -> bool {
        self.deferred
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// 新建一张带独立回收队列的句柄表
pub(crate) fn probe_table(max_threads: usize) -> (HandleTable<Probe>, Arc<GcQueue>) {
    let threads = Arc::new(ThreadStates::new(max_threads));
    let gc = Arc::new(GcQueue::new(threads));
    (HandleTable::new(Arc::clone(&gc)), gc)
}
