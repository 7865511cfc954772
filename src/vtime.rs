use crate::error::{Error, Result};
use crate::sync::{Arc, AtomicBool, AtomicU32, Cell, Ordering};

/// Virtual time of one thread slot.
///
/// Odd values mean the thread is awake (inside a protected region), even values
/// mean it is asleep. Any change of value proves the thread passed a quiescent point.
///
/// 线程槽的虚拟时间。奇数表示线程处于受保护区域内，偶数表示休眠。
/// 数值的任何变化都证明线程经过了一个静止点。
pub type VTime = u32;

/// Default number of thread slots in a runtime.
/// 运行时中默认的线程槽数量。
pub(crate) const DEFAULT_MAX_THREADS: usize = 128;

#[inline]
pub(crate) fn vtime_awake(vtime: VTime) -> bool {
    vtime % 2 == 1
}

/// One entry of the process-wide thread table.
///
/// Cache-aligned so that threads advancing their own clock do not contend.
///
/// 进程级线程表中的一个条目。缓存对齐以避免伪共享。
#[derive(Debug)]
#[repr(align(64))]
struct ThreadSlot {
    vtime: AtomicU32,
    in_use: AtomicBool,
}

/// Fixed-capacity table of per-thread virtual clocks.
///
/// This is the quiescence signal used by the reclamation queue: a request
/// records `snapshot(slot)` for the threads that might still observe an object,
/// and completes once `is_past` holds for each of them.
///
/// 固定容量的线程虚拟时钟表。回收队列用它作为静止信号：请求记录可能仍在
/// 观察对象的线程的快照，当所有线程的 `is_past` 都成立时请求完成。
#[derive(Debug)]
pub struct ThreadStates {
    slots: Box<[ThreadSlot]>,
}

impl ThreadStates {
    /// Create a table with room for `max_threads` registered threads.
    /// 创建一个最多容纳 `max_threads` 个注册线程的表。
    pub fn new(max_threads: usize) -> Self {
        let slots = (0..max_threads)
            .map(|_| ThreadSlot {
                vtime: AtomicU32::new(0),
                in_use: AtomicBool::new(false),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot without RAII ownership.
    ///
    /// Used by code that drives the clock explicitly (schedulers, tests).
    /// Pair with [`ThreadStates::release`].
    ///
    /// 不带 RAII 所有权地占用一个空闲槽。需与 [`ThreadStates::release`] 配对使用。
    pub fn claim(&self) -> Result<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(idx);
            }
        }
        Err(Error::OutOfResources(format!(
            "all {} thread slots are in use",
            self.slots.len()
        )))
    }

    /// Return a slot to the free pool.
    ///
    /// The clock is moved forward (keeping it asleep) instead of being reset,
    /// so a later reuse of the slot is still seen as a change by old snapshots.
    ///
    /// 将槽归还到空闲池。时钟向前推进而不是重置，使旧快照仍能观察到变化。
    ///
    /// # Panics
    /// If `slot >= self.capacity()`.
    pub fn release(&self, slot: usize) {
        let s = &self.slots[slot];
        let vtime = s.vtime.load(Ordering::Acquire);
        let step = if vtime_awake(vtime) { 1 } else { 2 };
        s.vtime.fetch_add(step, Ordering::SeqCst);
        s.in_use.store(false, Ordering::Release);
    }

    /// Register the calling thread and return its RAII state.
    /// 注册调用线程并返回其 RAII 状态。
    pub fn register(self: &Arc<Self>) -> Result<ThreadState> {
        let slot = self.claim()?;
        Ok(ThreadState {
            states: Arc::clone(self),
            slot,
            depth: Cell::new(0),
        })
    }

    /// Atomically advance the clock of `slot` by one.
    ///
    /// # Panics
    /// If `slot >= self.capacity()`, as for every per-slot accessor below.
    #[inline]
    pub fn advance(&self, slot: usize) {
        self.slots[slot].vtime.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn snapshot(&self, slot: usize) -> VTime {
        self.slots[slot].vtime.load(Ordering::SeqCst)
    }

    /// True iff the slot's clock differs from `snapshot` or the slot is free.
    ///
    /// 当槽的时钟与 `snapshot` 不同或槽已空闲时返回 true。
    ///
    /// # Panics
    /// If `slot >= self.capacity()`.
    #[inline]
    pub fn is_past(&self, slot: usize, snapshot: VTime) -> bool {
        let s = &self.slots[slot];
        !s.in_use.load(Ordering::Acquire) || s.vtime.load(Ordering::SeqCst) != snapshot
    }

    #[inline]
    pub fn is_awake(&self, slot: usize) -> bool {
        let s = &self.slots[slot];
        s.in_use.load(Ordering::Acquire) && vtime_awake(s.vtime.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn in_use(&self, slot: usize) -> bool {
        self.slots[slot].in_use.load(Ordering::Acquire)
    }

    /// Snapshot every slot that is currently awake.
    ///
    /// Sleeping threads hold no references obtained before this call, so they
    /// need not be waited for.
    ///
    /// 为当前所有处于唤醒状态的槽拍摄快照。休眠线程不持有此前获得的引用，无需等待。
    pub(crate) fn awake_snapshot(&self) -> Vec<(usize, VTime)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use.load(Ordering::Acquire))
            .filter_map(|(idx, s)| {
                let vtime = s.vtime.load(Ordering::SeqCst);
                vtime_awake(vtime).then_some((idx, vtime))
            })
            .collect()
    }
}

/// A registered thread's handle on its clock slot.
///
/// `!Sync` (because of `Cell`); keep one per thread.
///
/// 已注册线程对其时钟槽的句柄。它是 `!Sync` 的，每个线程保留一个。
pub struct ThreadState {
    states: Arc<ThreadStates>,
    slot: usize,
    depth: Cell<usize>,
}

impl ThreadState {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Enter a protected region.
    ///
    /// **Reentrancy**: nested calls are allowed; only the outermost guard moves
    /// the clock, once on entry and once on drop.
    ///
    /// 进入受保护区域。可重入：只有最外层守卫推进时钟，进入时一次，drop 时一次。
    #[inline]
    pub fn awake(&self) -> AwakeGuard<'_> {
        let depth = self.depth.get();
        if depth == 0 {
            self.states.advance(self.slot);
        }
        self.depth.set(depth + 1);
        AwakeGuard { state: self }
    }

    #[inline]
    pub fn is_awake(&self) -> bool {
        self.depth.get() > 0
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.states.release(self.slot);
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("slot", &self.slot)
            .field("depth", &self.depth.get())
            .finish()
    }
}

/// Keeps the owning thread inside a protected region.
///
/// While any guard is alive the thread's clock stays odd, so reclamation
/// requests that snapshotted it cannot complete.
///
/// 使所属线程保持在受保护区域内。只要有守卫存在，线程时钟保持奇数，
/// 对其拍摄快照的回收请求就无法完成。
#[must_use]
pub struct AwakeGuard<'a> {
    state: &'a ThreadState,
}

impl Clone for AwakeGuard<'_> {
    fn clone(&self) -> Self {
        let depth = self.state.depth.get();
        assert!(
            depth > 0,
            "BUG: Cloning an AwakeGuard while asleep (depth = 0)."
        );
        self.state.depth.set(depth + 1);
        AwakeGuard { state: self.state }
    }
}

impl Drop for AwakeGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        let depth = self.state.depth.get();
        assert!(
            depth > 0,
            "BUG: Dropping an AwakeGuard while asleep (depth = 0)."
        );
        if depth == 1 {
            self.state.states.advance(self.state.slot);
        }
        self.state.depth.set(depth - 1);
    }
}
