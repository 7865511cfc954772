use crate::error::{Error, Result};
use crate::handle::{Handle, Managed};
use crate::registry::Domain;
use crate::runtime::Core;
use crate::sync::{Arc, AtomicBool, AtomicU64, Mutex, Ordering, Weak};
use log::{debug, warn};
use std::collections::BTreeMap;

/// Instance id: a process-unique, never-zero key that orders siblings.
pub type InstanceId = u64;

/// Monotonic instance id generator.
#[derive(Debug)]
pub(crate) struct InstanceIds {
    next: AtomicU64,
}

impl InstanceIds {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    #[inline]
    pub(crate) fn next(&self) -> InstanceId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Concrete variant of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Participant,
    Topic,
    Publisher,
    Subscriber,
    Writer,
    Reader,
}

impl EntityKind {
    /// Whether an entity of this kind may own a child of kind `child`.
    pub fn accepts_child(self, child: EntityKind) -> bool {
        use EntityKind::*;
        matches!(
            (self, child),
            (Participant, Topic | Publisher | Subscriber) | (Publisher, Writer) | (Subscriber, Reader)
        )
    }

    /// Kinds that packet receive paths dereference without pinning.
    #[inline]
    pub fn read_without_locks(self) -> bool {
        matches!(self, EntityKind::Writer | EntityKind::Reader)
    }
}

/// A registry reference on a domain shared by one participant's subtree.
///
/// The participant creates it and every descendant holds a clone until it
/// closes, so the domain is released only after the whole subtree is closed.
///
/// 一个参与者子树共享的域引用。子树中每个实体关闭时放下自己的那份，
/// 最后一份放下时才释放域。
pub(crate) struct DomainLease {
    domain: Arc<Domain>,
    core: Weak<Core>,
}

impl DomainLease {
    /// Wrap a reference already counted by the registry.
    pub(crate) fn new(domain: Arc<Domain>, core: Weak<Core>) -> Arc<Self> {
        Arc::new(Self { domain, core })
    }
}

impl Drop for DomainLease {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            debug!("[Entity] last lease on domain {} dropped", self.domain.id());
            core.registry.release(&self.domain);
        }
    }
}

/// Non-owning link to whatever owns an entity.
pub(crate) enum ParentLink {
    Domain(Weak<Domain>),
    Entity(Weak<Entity>),
}

/// A lifecycle-managed node of the entity tree.
///
/// Parents own children through `children` (ordered by instance id); the
/// way back up is weak and never extends a lifetime.
///
/// 实体树中受生命周期管理的节点。父节点通过 `children`（按实例 id 排序）
/// 拥有子节点；向上的链接是弱引用，从不延长生命周期。
pub struct Entity {
    handle: Handle,
    iid: InstanceId,
    kind: EntityKind,
    parent: ParentLink,
    domain: Weak<Domain>,
    lease: Mutex<Option<Arc<DomainLease>>>,
    pub(crate) children: Mutex<BTreeMap<InstanceId, Arc<Entity>>>,
    write_batch: AtomicBool,
    core: Weak<Core>,
}

impl Entity {
    pub(crate) fn new(
        handle: Handle,
        iid: InstanceId,
        kind: EntityKind,
        parent: ParentLink,
        lease: Option<Arc<DomainLease>>,
        write_batch: bool,
        core: Weak<Core>,
    ) -> Self {
        let domain = lease
            .as_ref()
            .map(|l| Arc::downgrade(&l.domain))
            .unwrap_or_default();
        Self {
            handle,
            iid,
            kind,
            parent,
            domain,
            lease: Mutex::new(lease),
            children: Mutex::new(BTreeMap::new()),
            write_batch: AtomicBool::new(write_batch),
            core,
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn instance_id(&self) -> InstanceId {
        self.iid
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.upgrade()
    }

    pub(crate) fn lease(&self) -> Option<Arc<DomainLease>> {
        self.lease.lock().clone()
    }

    /// Handle of the parent entity; `None` for participants.
    pub fn parent_handle(&self) -> Option<Handle> {
        match &self.parent {
            ParentLink::Domain(_) => None,
            ParentLink::Entity(parent) => parent.upgrade().map(|p| p.handle),
        }
    }

    /// Handles of the current children, in instance id order.
    pub fn child_handles(&self) -> Vec<Handle> {
        self.children.lock().values().map(|c| c.handle).collect()
    }

    /// Write-batching flag. Only meaningful for writers.
    #[inline]
    pub fn write_batch(&self) -> bool {
        self.write_batch.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_batch(&self, enable: bool) -> Result<()> {
        if self.kind != EntityKind::Writer {
            return Err(Error::Unsupported);
        }
        self.write_batch.store(enable, Ordering::Release);
        Ok(())
    }

    fn detach(&self) {
        match &self.parent {
            ParentLink::Domain(domain) => {
                if let Some(domain) = domain.upgrade() {
                    domain.participants.lock().remove(&self.iid);
                }
            }
            ParentLink::Entity(parent) => {
                if let Some(parent) = parent.upgrade() {
                    parent.children.lock().remove(&self.iid);
                }
            }
        }
    }
}

impl Managed for Entity {
    /// Delete the children, unhook from the parent and drop this entity's
    /// share of the domain lease.
    fn close(&self) {
        let children = std::mem::take(&mut *self.children.lock());
        if let Some(core) = self.core.upgrade() {
            for child in children.values() {
                match core.handles.delete(child.handle) {
                    Ok(()) | Err(Error::NotFound) | Err(Error::AlreadyDeleting) => {}
                    Err(e) => warn!(
                        "[Entity] failed to delete child {} of {}: {}",
                        child.handle, self.handle, e
                    ),
                }
            }
        }
        drop(children);

        self.detach();

        debug!("[Entity] {:?} {} closed", self.kind, self.handle);
        // Children still pinned keep their own clone.
        let lease = self.lease.lock().take();
        drop(lease);
    }

    fn deferred_free(&self) -> bool {
        self.kind.read_without_locks()
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("handle", &self.handle)
            .field("iid", &self.iid)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
