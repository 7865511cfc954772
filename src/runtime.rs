use crate::collab::Collaborators;
use crate::entity::{DomainLease, Entity, EntityKind, InstanceIds, ParentLink};
use crate::error::{Error, Result};
use crate::gc::{DEFAULT_POLL_INTERVAL, GcQueue};
use crate::handle::{Handle, HandleTable, Pinned};
use crate::registry::{Domain, DomainRegistry, DomainRequest};
use crate::sync::{Arc, AtomicBool, Ordering};
use crate::vtime::{DEFAULT_MAX_THREADS, ThreadState, ThreadStates};
use crate::walk;
use log::{debug, info, warn};
use std::time::Duration;

/// Builder for configuring a [`Runtime`].
///
/// - `max_threads`: number of thread slots for the quiescence clock
/// - `gc_worker`: run a background thread that completes reclamation requests
/// - `gc_poll_interval`: how often that worker rechecks a blocked request
/// - `collaborators`: configuration loader, protocol engine, monitor, builtins
///
/// # Example
/// ```
/// use dds_lifecycle::Runtime;
///
/// let runtime = Runtime::builder()
///     .max_threads(32)
///     .gc_worker(false)
///     .build()
///     .unwrap();
/// assert_eq!(runtime.threads().capacity(), 32);
/// ```
///
/// 用于配置 [`Runtime`] 的构建器。
pub struct RuntimeBuilder {
    max_threads: usize,
    gc_worker: bool,
    gc_poll_interval: Duration,
    collaborators: Collaborators,
}

impl RuntimeBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            gc_worker: true,
            gc_poll_interval: DEFAULT_POLL_INTERVAL,
            collaborators: Collaborators::default(),
        }
    }

    /// Default: `128`
    #[inline]
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Default: `true`. Without a worker, reclamation progresses only through
    /// [`GcQueue::poll`] and [`GcQueue::drain`].
    #[inline]
    pub fn gc_worker(mut self, enabled: bool) -> Self {
        self.gc_worker = enabled;
        self
    }

    /// Default: 1ms
    #[inline]
    pub fn gc_poll_interval(mut self, interval: Duration) -> Self {
        self.gc_poll_interval = interval;
        self
    }

    #[inline]
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let threads = Arc::new(ThreadStates::new(self.max_threads));
        let gc = Arc::new(GcQueue::new(Arc::clone(&threads)));
        #[cfg(not(feature = "loom"))]
        if self.gc_worker {
            gc.start_worker(self.gc_poll_interval)?;
        }
        let core = Arc::new(Core {
            handles: HandleTable::new(Arc::clone(&gc)),
            registry: DomainRegistry::new(self.collaborators),
            gc,
            threads,
            iids: InstanceIds::new(),
        });
        Ok(Runtime {
            core,
            shut_down: AtomicBool::new(false),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state reachable from entities through a weak link.
pub(crate) struct Core {
    pub(crate) handles: HandleTable<Entity>,
    pub(crate) registry: DomainRegistry,
    pub(crate) gc: Arc<GcQueue>,
    pub(crate) threads: Arc<ThreadStates>,
    pub(crate) iids: InstanceIds,
}

/// The process context: handle table, domain registry, reclamation queue
/// and thread clock, passed explicitly to every operation.
///
/// Several runtimes can coexist, each fully independent. Dropping a runtime
/// deletes its remaining participants and drains reclamation.
///
/// **Typical Usage**:
/// ```
/// use dds_lifecycle::{DomainRequest, EntityKind, Runtime};
///
/// let runtime = Runtime::new().unwrap();
/// let participant = runtime.create_participant(DomainRequest::Id(0)).unwrap();
/// let publisher = runtime.create_entity(participant, EntityKind::Publisher).unwrap();
/// let writer = runtime.create_entity(publisher, EntityKind::Writer).unwrap();
///
/// runtime.set_write_batch(true);
/// assert!(runtime.pin(writer).unwrap().write_batch());
///
/// runtime.delete(participant).unwrap();
/// runtime.gc().drain();
/// assert!(runtime.pin(writer).is_err());
/// ```
///
/// 进程上下文：句柄表、域注册表、回收队列和线程时钟，显式传递给每个操作。
/// 多个运行时可以共存且完全独立。drop 运行时会删除其剩余的参与者并排空回收队列。
pub struct Runtime {
    core: Arc<Core>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// A runtime with default settings and no-op collaborators.
    #[inline]
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    #[inline]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    #[inline]
    pub fn handles(&self) -> &HandleTable<Entity> {
        &self.core.handles
    }

    #[inline]
    pub fn registry(&self) -> &DomainRegistry {
        &self.core.registry
    }

    #[inline]
    pub fn gc(&self) -> &Arc<GcQueue> {
        &self.core.gc
    }

    #[inline]
    pub fn threads(&self) -> &Arc<ThreadStates> {
        &self.core.threads
    }

    /// Register the calling thread with the quiescence clock.
    pub fn register_thread(&self) -> Result<ThreadState> {
        self.core.threads.register()
    }

    /// Create a participant in the requested domain.
    ///
    /// `Default` joins the existing domain if there is one, otherwise starts
    /// a domain under the configured id (0 if unconfigured).
    ///
    /// 在请求的域中创建参与者。`Default` 会加入已存在的域，
    /// 否则以配置的 id（未配置时为 0）启动一个域。
    pub fn create_participant(&self, request: DomainRequest) -> Result<Handle> {
        let registry = &self.core.registry;
        let domain = match request {
            DomainRequest::Default => match registry.find_or_create(request) {
                Err(Error::NotFound) => registry.create_default()?,
                other => other?,
            },
            DomainRequest::Id(_) => registry.find_or_create(request)?,
        };

        let iid = self.core.iids.next();
        let core = Arc::downgrade(&self.core);
        // Dropping the lease on any error path below gives the reference back.
        let lease = DomainLease::new(Arc::clone(&domain), core.clone());
        let (handle, participant) = self.core.handles.register_with(|handle| {
            Arc::new(Entity::new(
                handle,
                iid,
                EntityKind::Participant,
                ParentLink::Domain(Arc::downgrade(&domain)),
                Some(lease),
                false,
                core,
            ))
        })?;
        domain.participants.lock().insert(iid, participant);
        // A delete racing this call may have closed the participant before
        // it was listed.
        if self.core.handles.pin_count(handle).is_none() {
            domain.participants.lock().remove(&iid);
        }
        debug!(
            "[Runtime] participant {} created in domain {}",
            handle,
            domain.id()
        );
        Ok(handle)
    }

    /// Create a child of `parent`.
    ///
    /// Valid pairs: participant → topic/publisher/subscriber,
    /// publisher → writer, subscriber → reader.
    pub fn create_entity(&self, parent: Handle, kind: EntityKind) -> Result<Handle> {
        let parent = self.core.handles.pin(parent)?;
        if !parent.kind().accepts_child(kind) {
            return Err(Error::BadParameter(format!(
                "{:?} cannot own a {:?}",
                parent.kind(),
                kind
            )));
        }

        let write_batch =
            kind == EntityKind::Writer && parent.domain().is_some_and(|d| d.write_batch());
        let lease = parent.lease();
        let iid = self.core.iids.next();
        let core = Arc::downgrade(&self.core);
        let weak_parent = Arc::downgrade(parent.object());

        let (handle, child) = self.core.handles.register_with(|handle| {
            Arc::new(Entity::new(
                handle,
                iid,
                kind,
                ParentLink::Entity(weak_parent),
                lease,
                write_batch,
                core,
            ))
        })?;
        // Inserted while the parent is pinned: if its deletion is pending, the
        // unpin below closes it and takes this child down with it.
        parent.children.lock().insert(iid, child);
        if self.core.handles.pin_count(handle).is_none() {
            parent.children.lock().remove(&iid);
        }
        debug!("[Runtime] {:?} {} created under {}", kind, handle, parent.handle());
        Ok(handle)
    }

    /// Pin the entity named by `handle`.
    #[inline]
    pub fn pin(&self, handle: Handle) -> Result<Pinned<'_, Entity>> {
        self.core.handles.pin(handle)
    }

    /// Delete an entity and, with it, all of its descendants.
    ///
    /// See [`HandleTable::delete`] for the race semantics.
    #[inline]
    pub fn delete(&self, handle: Handle) -> Result<()> {
        self.core.handles.delete(handle)
    }

    pub fn kind(&self, handle: Handle) -> Result<EntityKind> {
        Ok(self.pin(handle)?.kind())
    }

    pub fn parent(&self, handle: Handle) -> Result<Option<Handle>> {
        Ok(self.pin(handle)?.parent_handle())
    }

    pub fn children(&self, handle: Handle) -> Result<Vec<Handle>> {
        Ok(self.pin(handle)?.child_handles())
    }

    pub fn domain_id(&self, handle: Handle) -> Result<u32> {
        self.pin(handle)?
            .domain()
            .map(|d| d.id())
            .ok_or(Error::NotFound)
    }

    /// Look up (or start) a domain directly. Pair with [`Runtime::release_domain`].
    #[inline]
    pub fn lookup_domain(&self, request: DomainRequest) -> Result<Arc<Domain>> {
        self.core.registry.find_or_create(request)
    }

    #[inline]
    pub fn release_domain(&self, domain: &Arc<Domain>) {
        self.core.registry.release(domain)
    }

    /// Ask a subscriber to notify its readers.
    pub fn notify_readers(&self, subscriber: Handle) -> Result<()> {
        match self.kind(subscriber)? {
            EntityKind::Subscriber => Err(Error::Unsupported),
            other => Err(Error::BadParameter(format!(
                "{:?} is not a subscriber",
                other
            ))),
        }
    }

    /// Call `op` on every live entity of every live domain whose kind
    /// satisfies `pred`. No lock is held while `op` runs.
    pub fn broadcast<P, F>(&self, pred: P, op: F)
    where
        P: Fn(EntityKind) -> bool,
        F: FnMut(&Entity),
    {
        walk::broadcast(&self.core.registry, &self.core.handles, pred, op)
    }

    /// Switch write batching on or off in every domain and every live writer.
    pub fn set_write_batch(&self, enable: bool) {
        let mut cursor = None;
        while let Some(domain) = self.core.registry.pin_next(cursor) {
            cursor = Some(domain.id());
            domain.set_write_batch(enable);
        }
        self.broadcast(
            |kind| kind == EntityKind::Writer,
            |writer| {
                if let Err(e) = writer.set_write_batch(enable) {
                    debug!("[Runtime] skipping {}: {}", writer.handle(), e);
                }
            },
        );
    }

    /// Delete every participant, then drain the reclamation queue and stop
    /// its worker. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut participants = Vec::new();
        let mut cursor = None;
        while let Some(domain) = self.core.registry.pin_next(cursor) {
            cursor = Some(domain.id());
            participants.extend(domain.participants.lock().values().map(|p| p.handle()));
        }
        for handle in participants {
            match self.core.handles.delete(handle) {
                Ok(()) | Err(Error::NotFound) | Err(Error::AlreadyDeleting) => {}
                Err(e) => warn!("[Runtime] failed to delete participant {}: {}", handle, e),
            }
        }
        self.core.gc.shutdown();
        info!("[Runtime] shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("handles", &self.core.handles)
            .field("registry", &self.core.registry)
            .field("gc", &self.core.gc)
            .finish()
    }
}
