use crate::error::{Error, Result};
use crate::gc::GcQueue;
use crate::sync::{Arc, AtomicU32, Mutex, Ordering};
use log::{debug, trace};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ops::Deref;

/// Low bits of the link state: number of outstanding pins.
const PIN_MASK: u32 = 0x0fff_ffff;
/// Set by the single thread that wins the deletion race.
const DELETING: u32 = 1 << 28;
/// Set when finalization starts; a second attempt trips the poison check.
const FINALIZED: u32 = 1 << 29;

/// Largest handle value handed out. Handles are never reused.
const MAX_HANDLE: u32 = i32::MAX as u32;

/// Opaque, process-unique identifier of a managed object.
///
/// Handles are allocated monotonically and never reused, so a stale handle
/// can only ever resolve to `NotFound`.
///
/// 托管对象的不透明、进程内唯一的标识符。句柄单调分配且从不复用，
/// 因此过期句柄只会解析为 `NotFound`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Rebuild a handle from its raw value (0 is never a handle).
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Handle)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle hooks for objects indexed by a [`HandleTable`].
///
/// 由 [`HandleTable`] 索引的对象的生命周期钩子。
pub trait Managed: Send + Sync + 'static {
    /// Runs exactly once, on the thread that completes the deletion,
    /// after the last pin is gone and the handle no longer resolves.
    ///
    /// 在最后一个 pin 释放且句柄不再可解析之后，于完成删除的线程上恰好运行一次。
    fn close(&self) {}

    /// Whether threads that never pin (e.g. packet receive paths) may still
    /// hold a reference after [`Managed::close`]. If so, the table's last
    /// reference is released through the reclamation queue.
    ///
    /// 从不 pin 的线程（例如报文接收路径）在 close 之后是否仍可能持有引用。
    /// 如果是，表中的最后一个引用将通过回收队列释放。
    fn deferred_free(&self) -> bool {
        false
    }
}

struct Link<T> {
    handle: Handle,
    state: AtomicU32,
    object: Arc<T>,
}

struct Index<T> {
    links: HashMap<Handle, Arc<Link<T>>>,
    last: u32,
}

/// Maps handles to live objects with pin counts and single-winner deletion.
///
/// The table is a lookup/pin index only: it keeps objects alive while they
/// are registered but ownership lives in the entity tree.
///
/// **Invariants**:
/// - an object is never closed while it is pinned;
/// - exactly one `delete` per handle succeeds, and exactly one close follows.
///
/// 将句柄映射到存活对象，带有 pin 计数和单赢家删除。
/// 该表只是查找/pin 索引；所有权在实体树中。
/// **不变量**：对象被 pin 期间绝不会被关闭；每个句柄恰好有一次 `delete` 成功，
/// 随后恰好发生一次关闭。
pub struct HandleTable<T: Managed> {
    index: Mutex<Index<T>>,
    gc: Arc<GcQueue>,
}

impl<T: Managed> HandleTable<T> {
    pub fn new(gc: Arc<GcQueue>) -> Self {
        Self {
            index: Mutex::new(Index {
                links: HashMap::new(),
                last: 0,
            }),
            gc,
        }
    }

    /// Register `object` under the next handle value.
    pub fn register(&self, object: Arc<T>) -> Result<Handle> {
        self.register_with(|_| object).map(|(handle, _)| handle)
    }

    /// Allocate a handle and build the object that will live under it.
    ///
    /// `build` runs under the index lock, so it must be cheap and must not
    /// touch the table.
    ///
    /// 分配一个句柄并构建其下的对象。`build` 在索引锁内运行，必须廉价且不能访问此表。
    pub fn register_with<F>(&self, build: F) -> Result<(Handle, Arc<T>)>
    where
        F: FnOnce(Handle) -> Arc<T>,
    {
        let mut index = self.index.lock();
        let next = index.last + 1;
        let handle = match Handle::from_raw(next) {
            Some(h) if next <= MAX_HANDLE => h,
            _ => {
                return Err(Error::OutOfResources("handle space exhausted".into()));
            }
        };
        index.last = next;

        let object = build(handle);
        index.links.insert(
            handle,
            Arc::new(Link {
                handle,
                state: AtomicU32::new(0),
                object: Arc::clone(&object),
            }),
        );
        drop(index);

        trace!("[HandleTable] registered handle {}", handle);
        Ok((handle, object))
    }

    /// Resolve `handle` and pin the object it names.
    ///
    /// Fails with `NotFound` for unknown handles and for objects whose
    /// deletion has started.
    ///
    /// 解析 `handle` 并 pin 其对象。句柄未知或对象已开始删除时返回 `NotFound`。
    pub fn pin(&self, handle: Handle) -> Result<Pinned<'_, T>> {
        let link = self
            .index
            .lock()
            .links
            .get(&handle)
            .cloned()
            .ok_or(Error::NotFound)?;

        let mut current = link.state.load(Ordering::Acquire);
        loop {
            if current & (DELETING | FINALIZED) != 0 {
                return Err(Error::NotFound);
            }
            if current & PIN_MASK == PIN_MASK {
                return Err(Error::OutOfResources(format!(
                    "pin count overflow on handle {}",
                    handle
                )));
            }
            match link.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(Pinned { table: self, link })
    }

    /// Request deletion of `handle`.
    ///
    /// The caller whose request flips the deletion flag owns finalization:
    /// it happens here if nothing is pinned, otherwise in the unpin that
    /// drops the count to zero. Losers get `AlreadyDeleting`.
    ///
    /// 请求删除 `handle`。翻转删除标志的调用者负责终结：若无 pin 则在此处完成，
    /// 否则在使计数归零的 unpin 中完成。失败者得到 `AlreadyDeleting`。
    pub fn delete(&self, handle: Handle) -> Result<()> {
        let link = self
            .index
            .lock()
            .links
            .get(&handle)
            .cloned()
            .ok_or(Error::NotFound)?;
        self.mark_deleting(&link)
    }

    /// Number of objects currently registered.
    pub fn len(&self) -> usize {
        self.index.lock().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pins held on `handle`, or `None` if it does not resolve.
    pub fn pin_count(&self, handle: Handle) -> Option<u32> {
        let index = self.index.lock();
        index
            .links
            .get(&handle)
            .map(|link| link.state.load(Ordering::Acquire) & PIN_MASK)
    }

    fn mark_deleting(&self, link: &Arc<Link<T>>) -> Result<()> {
        let prev = link.state.fetch_or(DELETING, Ordering::AcqRel);
        if prev & DELETING != 0 {
            return Err(Error::AlreadyDeleting);
        }
        trace!("[HandleTable] deletion of handle {} requested", link.handle);
        if prev & PIN_MASK == 0 {
            self.finalize(link);
        }
        Ok(())
    }

    fn unpin(&self, link: &Arc<Link<T>>) {
        let prev = link.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & PIN_MASK > 0, "unpin without a matching pin");
        if prev & PIN_MASK == 1 && prev & DELETING != 0 {
            self.finalize(link);
        }
    }

    fn finalize(&self, link: &Arc<Link<T>>) {
        let prev = link.state.fetch_or(FINALIZED, Ordering::AcqRel);
        assert!(
            prev & FINALIZED == 0,
            "BUG: handle {} finalized twice",
            link.handle
        );

        self.index.lock().links.remove(&link.handle);
        link.object.close();

        let object = Arc::clone(&link.object);
        if object.deferred_free() {
            debug!(
                "[HandleTable] handle {} closed, free deferred to gc queue",
                link.handle
            );
            self.gc.submit_awake(move || drop(object));
        } else {
            debug!("[HandleTable] handle {} closed", link.handle);
            drop(object);
        }
    }
}

impl<T: Managed> std::fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("HandleTable")
            .field("registered", &index.links.len())
            .field("last", &index.last)
            .finish()
    }
}

/// A pinned object. Dropping it unpins.
///
/// While any `Pinned` exists the object cannot be closed. If deletion was
/// requested meanwhile, the drop that releases the last pin finalizes it.
///
/// 一个被 pin 的对象，drop 时解除 pin。只要存在 `Pinned`，对象就不会被关闭。
/// 若期间请求了删除，释放最后一个 pin 的 drop 将完成终结。
#[must_use]
pub struct Pinned<'a, T: Managed> {
    table: &'a HandleTable<T>,
    link: Arc<Link<T>>,
}

impl<'a, T: Managed> Pinned<'a, T> {
    #[inline]
    pub fn handle(&self) -> Handle {
        self.link.handle
    }

    /// A strong reference that outlives the pin, but not the object's close.
    #[inline]
    pub fn object(&self) -> &Arc<T> {
        &self.link.object
    }

    /// Request deletion of the pinned object, then unpin.
    ///
    /// Finalization runs here if this was the last pin.
    pub fn delete(self) -> Result<()> {
        let result = self.table.mark_deleting(&self.link);
        drop(self);
        result
    }
}

impl<T: Managed> Deref for Pinned<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.link.object
    }
}

impl<T: Managed> Drop for Pinned<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.table.unpin(&self.link);
    }
}

impl<T: Managed> std::fmt::Debug for Pinned<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinned")
            .field("handle", &self.link.handle)
            .finish()
    }
}
