//! Domain registry.
//!
//! ```text
//! DomainRegistry (one per Runtime)
//! +-- state: Mutex<RegistryState>
//! |   +-- domains: BTreeMap<u32, Slot>      Starting | Ready { domain, refc }
//! |   +-- monitor: liveliness monitor + its refcount
//! +-- cond: Condvar                         wakes lookups waiting on Starting
//! ```
//!
//! The lock covers lookup/insert bookkeeping only. Domain start-up and
//! teardown run outside it; a `Starting` placeholder makes concurrent
//! creators of the same id wait for the single start sequence.

use crate::collab::{Collaborators, LivelinessMonitor, ParticipantDefaults};
use crate::config::Config;
use crate::entity::{Entity, InstanceId};
use crate::error::{Error, Result};
use crate::lifecycle::{self, DomainStack, MONITOR_THREAD_NAME};
use crate::sync::{Arc, AtomicBool, Condvar, Mutex, MutexGuard, Ordering};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::ops::{Bound, Deref};

/// Highest valid domain id.
pub const MAX_DOMAIN_ID: u32 = 230;

/// Which domain a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainRequest {
    /// Whatever domain already exists (the lowest id if several do).
    Default,
    Id(u32),
}

impl From<u32> for DomainRequest {
    fn from(id: u32) -> Self {
        DomainRequest::Id(id)
    }
}

/// One top-level runtime context bound to a domain id.
///
/// 绑定到某个域 id 的顶层运行时上下文。
pub struct Domain {
    id: u32,
    write_batch: AtomicBool,
    pub(crate) participants: Mutex<BTreeMap<InstanceId, Arc<Entity>>>,
    stack: Mutex<Option<DomainStack>>,
    defaults: ParticipantDefaults,
}

impl Domain {
    fn new(stack: DomainStack, defaults: ParticipantDefaults) -> Self {
        Self {
            id: stack.id(),
            write_batch: AtomicBool::new(stack.config().write_batch),
            participants: Mutex::new(BTreeMap::new()),
            stack: Mutex::new(Some(stack)),
            defaults,
        }
    }

    /// A domain with no protocol stack behind it.
    #[cfg(test)]
    pub(crate) fn detached(id: u32) -> Self {
        Self {
            id,
            write_batch: AtomicBool::new(false),
            participants: Mutex::new(BTreeMap::new()),
            stack: Mutex::new(None),
            defaults: ParticipantDefaults::collect(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn write_batch(&self) -> bool {
        self.write_batch.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_write_batch(&self, enable: bool) {
        self.write_batch.store(enable, Ordering::Release);
    }

    #[inline]
    pub fn defaults(&self) -> &ParticipantDefaults {
        &self.defaults
    }

    /// The configuration the domain was started with, until it is stopped.
    pub fn config(&self) -> Option<Config> {
        self.stack.lock().as_ref().map(|s| s.config().clone())
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().len()
    }

    fn stop(&self, registry: &DomainRegistry) {
        let stack = self.stack.lock().take();
        if let Some(stack) = stack {
            stack.teardown(registry);
        }
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("write_batch", &self.write_batch())
            .finish_non_exhaustive()
    }
}

enum Slot {
    Starting,
    Ready { domain: Arc<Domain>, refc: usize },
}

#[derive(Default)]
struct MonitorState {
    instance: Option<Box<dyn LivelinessMonitor>>,
    count: usize,
    running: bool,
}

struct RegistryState {
    domains: BTreeMap<u32, Slot>,
    default_starting: bool,
    monitor: MonitorState,
}

impl RegistryState {
    fn has_starting(&self) -> bool {
        self.default_starting || self.domains.values().any(|s| matches!(s, Slot::Starting))
    }

    fn acquire_first_ready(&mut self) -> Option<Arc<Domain>> {
        self.domains.values_mut().find_map(|slot| match slot {
            Slot::Ready { domain, refc } => {
                *refc += 1;
                Some(Arc::clone(domain))
            }
            Slot::Starting => None,
        })
    }
}

enum Lookup {
    Found(Arc<Domain>),
    Busy,
    Missing,
    Mismatch(u32),
}

/// Reference-counted index of live domains, keyed by domain id.
///
/// **Invariants**:
/// - at most one domain per id is registered at any time;
/// - a domain is visible to lookups from the end of its start sequence until
///   the moment its refcount drops to zero, never during teardown.
///
/// 按域 id 索引的、带引用计数的存活域表。
/// **不变量**：任意时刻每个 id 至多注册一个域；域从启动序列结束起可见，
/// 直到其引用计数降为零为止，拆除过程中绝不可见。
pub struct DomainRegistry {
    state: Mutex<RegistryState>,
    cond: Condvar,
    collab: Collaborators,
}

impl DomainRegistry {
    pub fn new(collab: Collaborators) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                domains: BTreeMap::new(),
                default_starting: false,
                monitor: MonitorState::default(),
            }),
            cond: Condvar::new(),
            collab,
        }
    }

    #[inline]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Look up a domain, starting it on a miss.
    ///
    /// - `Id(id)` found: refcount + 1.
    /// - `Id(id)` missing: runs the start sequence outside the lock and
    ///   registers the result with refcount 1; on failure nothing is left behind.
    /// - `Default`: the existing domain with the lowest id, or `NotFound` when
    ///   the registry is empty. Never creates.
    ///
    /// 查找域，未命中时启动它。`Default` 从不创建域，注册表为空时返回 `NotFound`。
    pub fn find_or_create(&self, request: DomainRequest) -> Result<Arc<Domain>> {
        let id = match request {
            DomainRequest::Default => return self.find_default(),
            DomainRequest::Id(id) if id > MAX_DOMAIN_ID => {
                return Err(Error::BadParameter(format!(
                    "domain id {} outside 0..={}",
                    id, MAX_DOMAIN_ID
                )));
            }
            DomainRequest::Id(id) => id,
        };

        let mut state = self.state.lock();
        loop {
            // A default start may settle on this very id; wait for it.
            let default_starting = state.default_starting;
            let lookup = match state.domains.get_mut(&id) {
                Some(Slot::Ready { domain, .. }) if domain.id() != id => {
                    Lookup::Mismatch(domain.id())
                }
                Some(Slot::Ready { domain, refc }) => {
                    *refc += 1;
                    Lookup::Found(Arc::clone(domain))
                }
                Some(Slot::Starting) => Lookup::Busy,
                None if default_starting => Lookup::Busy,
                None => Lookup::Missing,
            };
            match lookup {
                Lookup::Found(domain) => {
                    debug!("[DomainRegistry] domain {} found", id);
                    return Ok(domain);
                }
                Lookup::Mismatch(configured) => {
                    error!(
                        "[DomainRegistry] inconsistent domain configuration: configured {}, requested {}",
                        configured, id
                    );
                    return Err(Error::PreconditionNotMet(format!(
                        "domain registered under {} is configured as {}",
                        id, configured
                    )));
                }
                Lookup::Busy => state = self.cond.wait(state),
                Lookup::Missing => break,
            }
        }
        state.domains.insert(id, Slot::Starting);
        drop(state);

        debug!("[DomainRegistry] domain {} not found, starting", id);
        let started = lifecycle::start(self, Some(id));

        let mut state = self.state.lock();
        let result = match started {
            Ok((stack, defaults)) => {
                let domain = Arc::new(Domain::new(stack, defaults));
                state.domains.insert(
                    id,
                    Slot::Ready {
                        domain: Arc::clone(&domain),
                        refc: 1,
                    },
                );
                info!("[DomainRegistry] domain {} started", id);
                Ok(domain)
            }
            Err(e) => {
                state.domains.remove(&id);
                Err(e)
            }
        };
        drop(state);
        self.cond.notify_all();
        result
    }

    fn find_default(&self) -> Result<Arc<Domain>> {
        let mut state = self.state.lock();
        loop {
            if let Some(domain) = state.acquire_first_ready() {
                debug!("[DomainRegistry] default resolved to domain {}", domain.id());
                return Ok(domain);
            }
            if !state.has_starting() {
                return Err(Error::NotFound);
            }
            state = self.cond.wait(state);
        }
    }

    /// Resolve the default domain, creating it from the configured id when
    /// the registry is empty.
    pub(crate) fn create_default(&self) -> Result<Arc<Domain>> {
        let mut state = self.state.lock();
        loop {
            if let Some(domain) = state.acquire_first_ready() {
                return Ok(domain);
            }
            if !state.has_starting() {
                break;
            }
            state = self.cond.wait(state);
        }
        state.default_starting = true;
        drop(state);

        let started = lifecycle::start(self, None);

        let mut state = self.state.lock();
        state.default_starting = false;
        let outcome = match started {
            Err(e) => Err(e),
            Ok((stack, defaults)) => {
                let domain = Arc::new(Domain::new(stack, defaults));
                if state.domains.contains_key(&domain.id()) {
                    Ok(Err(domain))
                } else {
                    state.domains.insert(
                        domain.id(),
                        Slot::Ready {
                            domain: Arc::clone(&domain),
                            refc: 1,
                        },
                    );
                    info!("[DomainRegistry] default domain {} started", domain.id());
                    Ok(Ok(domain))
                }
            }
        };
        drop(state);
        self.cond.notify_all();

        match outcome {
            Err(e) => Err(e),
            Ok(Ok(domain)) => Ok(domain),
            Ok(Err(loser)) => {
                // The same id got registered while we were starting.
                debug!(
                    "[DomainRegistry] domain {} appeared concurrently, discarding ours",
                    loser.id()
                );
                loser.stop(self);
                self.find_or_create(DomainRequest::Id(loser.id()))
            }
        }
    }

    /// Drop one reference; the last one unregisters and stops the domain.
    ///
    /// 释放一个引用；最后一个引用会注销并停止该域。
    pub fn release(&self, domain: &Arc<Domain>) {
        let id = domain.id();
        let mut state = self.state.lock();
        let last = match state.domains.get_mut(&id) {
            Some(Slot::Ready { domain: d, refc }) if Arc::ptr_eq(d, domain) => {
                *refc -= 1;
                *refc == 0
            }
            _ => {
                warn!("[DomainRegistry] release of unregistered domain {}", id);
                return;
            }
        };
        if last {
            state.domains.remove(&id);
        }
        drop(state);

        if last {
            info!("[DomainRegistry] domain {} released, stopping", id);
            domain.stop(self);
            self.cond.notify_all();
        }
    }

    /// Current refcount of the domain registered under `id`.
    pub fn refcount(&self, id: u32) -> Option<usize> {
        match self.state.lock().domains.get(&id) {
            Some(Slot::Ready { refc, .. }) => Some(*refc),
            _ => None,
        }
    }

    /// Ids of all domains visible to lookups.
    pub fn domain_ids(&self) -> Vec<u32> {
        self.state
            .lock()
            .domains
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Take a reference on the first live domain with id greater than `after`.
    ///
    /// This is the registry level of the tree walk: the reference keeps the
    /// domain from being torn down while the caller works on it unlocked.
    ///
    /// 获取 id 大于 `after` 的第一个存活域的引用。
    pub fn pin_next(&self, after: Option<u32>) -> Option<DomainPin<'_>> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut state = self.state.lock();
        let domain = state
            .domains
            .range_mut((lower, Bound::Unbounded))
            .find_map(|(_, slot)| match slot {
                Slot::Ready { domain, refc } => {
                    *refc += 1;
                    Some(Arc::clone(domain))
                }
                Slot::Starting => None,
            })?;
        Some(DomainPin {
            registry: self,
            domain,
        })
    }

    #[cfg(test)]
    pub(crate) fn insert_ready(&self, key: u32, domain: Domain) -> Arc<Domain> {
        let domain = Arc::new(domain);
        self.state.lock().domains.insert(
            key,
            Slot::Ready {
                domain: Arc::clone(&domain),
                refc: 1,
            },
        );
        domain
    }

    // --- liveliness monitor, refcounted under the registry lock ---

    fn monitor_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Returns true if this call created the monitor.
    pub(crate) fn acquire_monitor(&self, config: &Config) -> Result<bool> {
        let mut state = self.monitor_state();
        let monitor = &mut state.monitor;
        if monitor.count == 0 {
            let instance = self
                .collab
                .monitor
                .create(
                    config.liveliness_monitoring_interval,
                    config.noprogress_log_stacktraces,
                )
                .map_err(|e| {
                    error!("[DomainRegistry] failed to create a thread liveliness monitor: {}", e);
                    Error::OutOfResources(format!("liveliness monitor: {}", e))
                })?;
            monitor.instance = Some(instance);
        }
        monitor.count += 1;
        Ok(monitor.count == 1)
    }

    pub(crate) fn start_monitor(&self, config: &Config) -> Result<()> {
        let mut state = self.monitor_state();
        let monitor = &mut state.monitor;
        if let Some(instance) = monitor.instance.as_mut() {
            instance
                .start(
                    MONITOR_THREAD_NAME,
                    &config.thread_properties(MONITOR_THREAD_NAME),
                )
                .map_err(|e| {
                    error!("[DomainRegistry] failed to start the thread liveliness monitor: {}", e);
                    e
                })?;
            monitor.running = true;
        }
        Ok(())
    }

    pub(crate) fn stop_monitor_if_last(&self) {
        let mut state = self.monitor_state();
        let monitor = &mut state.monitor;
        if monitor.count == 1 && monitor.running {
            if let Some(instance) = monitor.instance.as_mut() {
                instance.stop();
            }
            monitor.running = false;
        }
    }

    pub(crate) fn release_monitor(&self) {
        let mut state = self.monitor_state();
        let monitor = &mut state.monitor;
        monitor.count = monitor.count.saturating_sub(1);
        if monitor.count == 0 {
            if let Some(mut instance) = monitor.instance.take() {
                if monitor.running {
                    instance.stop();
                    monitor.running = false;
                }
                instance.destroy();
            }
        }
    }

    /// Number of domains currently holding the liveliness monitor.
    pub fn monitor_refcount(&self) -> usize {
        self.monitor_state().monitor.count
    }
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.domain_ids())
            .finish_non_exhaustive()
    }
}

/// A counted reference on a domain, released on drop.
#[must_use]
pub struct DomainPin<'a> {
    registry: &'a DomainRegistry,
    domain: Arc<Domain>,
}

impl DomainPin<'_> {
    #[inline]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }
}

impl Deref for DomainPin<'_> {
    type Target = Domain;

    fn deref(&self) -> &Domain {
        &self.domain
    }
}

impl Drop for DomainPin<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.domain);
    }
}
