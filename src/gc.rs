use crate::error::{Error, Result};
use crate::sync::{Arc, AtomicBool, Condvar, Mutex, Ordering, yield_now};
use crate::vtime::{ThreadStates, VTime};
use log::{debug, error, trace};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

/// Default interval at which the background worker rechecks a blocked head request.
/// 后台工作线程重新检查被阻塞的队首请求的默认间隔。
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Callback run when a request becomes safe.
///
/// It receives the queue and the spent request, which it may hand back to
/// [`GcQueue::requeue`] to chain another cleanup step.
///
/// 请求变为安全时运行的回调。它接收队列和已完成的请求，
/// 可以将请求交还给 [`GcQueue::requeue`] 以串联下一个清理步骤。
pub type GcCallback = Box<dyn FnOnce(&GcQueue, GcRequest) + Send>;

/// A deferred destruction request.
///
/// Holds the `(slot, vtime)` pairs captured at submission. The request is
/// eligible once every captured slot is past its snapshot.
///
/// 一个延迟销毁请求。持有提交时捕获的 `(槽, 虚拟时间)` 对，
/// 当所有捕获的槽都越过其快照时请求才有资格完成。
pub struct GcRequest {
    vtimes: Vec<(usize, VTime)>,
    callback: Option<GcCallback>,
    seq: u64,
}

impl GcRequest {
    #[inline]
    pub fn vtimes(&self) -> &[(usize, VTime)] {
        &self.vtimes
    }

    fn is_ready(&self, threads: &ThreadStates) -> bool {
        self.vtimes
            .iter()
            .all(|&(slot, vtime)| threads.is_past(slot, vtime))
    }
}

impl std::fmt::Debug for GcRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcRequest")
            .field("seq", &self.seq)
            .field("vtimes", &self.vtimes)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

struct QueueState {
    requests: VecDeque<GcRequest>,
    /// Sequence number handed to the next enqueued request (starts at 1).
    next_seq: u64,
    /// Sequence number of the last request whose callback has run.
    completed_seq: u64,
    /// One poller at a time keeps completion in submission order.
    polling: bool,
    terminate: bool,
}

/// FIFO queue of deferred destructions, released by quiescence.
///
/// The head request blocks everything behind it: requests complete strictly
/// in submission order, which bounds the queue's bookkeeping to a single scan
/// position.
///
/// 由静止状态释放的延迟销毁 FIFO 队列。队首请求会阻塞其后的所有请求：
/// 请求严格按提交顺序完成。
pub struct GcQueue {
    threads: Arc<ThreadStates>,
    state: Mutex<QueueState>,
    cond: Condvar,
    has_worker: AtomicBool,
    #[cfg(not(feature = "loom"))]
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl GcQueue {
    pub fn new(threads: Arc<ThreadStates>) -> Self {
        Self {
            threads,
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                next_seq: 1,
                completed_seq: 0,
                polling: false,
                terminate: false,
            }),
            cond: Condvar::new(),
            has_worker: AtomicBool::new(false),
            #[cfg(not(feature = "loom"))]
            worker: Mutex::new(None),
        }
    }

    #[inline]
    pub fn threads(&self) -> &Arc<ThreadStates> {
        &self.threads
    }

    /// Number of requests that have not completed yet.
    pub fn pending(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Enqueue `f` to run once every slot in `slots` is past its current vtime.
    ///
    /// Never blocks on other requests; safe to call while holding locks.
    ///
    /// 将 `f` 入队，待 `slots` 中的每个槽都越过其当前虚拟时间后运行。
    /// 不会阻塞，可在持有锁时调用。
    pub fn submit<F>(&self, slots: &[usize], f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with(slots, Box::new(move |_, _| f()))
    }

    /// Like [`GcQueue::submit`], with a callback that may requeue the request.
    pub fn submit_with(&self, slots: &[usize], callback: GcCallback) -> Result<()> {
        if let Some(&bad) = slots.iter().find(|&&s| s >= self.threads.capacity()) {
            return Err(Error::BadParameter(format!(
                "thread slot {} out of range (capacity {})",
                bad,
                self.threads.capacity()
            )));
        }
        let vtimes = slots
            .iter()
            .map(|&slot| (slot, self.threads.snapshot(slot)))
            .collect();
        self.enqueue(vtimes, callback);
        Ok(())
    }

    /// Enqueue `f` behind every thread that is awake right now.
    ///
    /// This is the path used for objects that receive threads read without locks.
    ///
    /// 将 `f` 排在当前所有唤醒线程之后。用于接收线程无锁读取的对象。
    pub fn submit_awake<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let vtimes = self.threads.awake_snapshot();
        self.enqueue(vtimes, Box::new(move |_, _| f()));
    }

    /// Put a spent request back at the tail with a new callback.
    ///
    /// The vtime snapshot is kept as-is.
    ///
    /// 以新的回调将已完成的请求放回队尾，保留原有的虚拟时间快照。
    pub fn requeue(&self, mut request: GcRequest, callback: GcCallback) {
        request.callback = Some(callback);
        let mut state = self.state.lock();
        request.seq = state.next_seq;
        state.next_seq += 1;
        trace!("[GcQueue] requeued request {}", request.seq);
        state.requests.push_back(request);
        drop(state);
        self.cond.notify_all();
    }

    fn enqueue(&self, vtimes: Vec<(usize, VTime)>, callback: GcCallback) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        trace!(
            "[GcQueue] enqueued request {} waiting on {} thread(s)",
            seq,
            vtimes.len()
        );
        state.requests.push_back(GcRequest {
            vtimes,
            callback: Some(callback),
            seq,
        });
        drop(state);
        self.cond.notify_all();
    }

    /// Complete every ready request at the head of the queue.
    ///
    /// Returns the number of callbacks run. If another thread is already
    /// polling this returns 0 immediately.
    ///
    /// 完成队首所有已就绪的请求，返回运行的回调数量。
    /// 如果另一个线程正在轮询，则立即返回 0。
    pub fn poll(&self) -> usize {
        let mut state = self.state.lock();
        if state.polling {
            return 0;
        }
        state.polling = true;

        let mut completed = 0;
        loop {
            let ready = state
                .requests
                .front()
                .is_some_and(|req| req.is_ready(&self.threads));
            if !ready {
                break;
            }
            let Some(mut request) = state.requests.pop_front() else {
                break;
            };
            drop(state);

            let seq = request.seq;
            if let Some(callback) = request.callback.take() {
                // A panicking callback still counts as completed; `polling`
                // must be cleared below or the queue stalls for good.
                if catch_unwind(AssertUnwindSafe(|| callback(self, request))).is_err() {
                    error!("[GcQueue] request {} callback panicked", seq);
                }
            }
            completed += 1;

            state = self.state.lock();
            state.completed_seq = seq;
        }

        state.polling = false;
        drop(state);
        if completed > 0 {
            debug!("[GcQueue] completed {} request(s)", completed);
        }
        self.cond.notify_all();
        completed
    }

    /// Block until every request enqueued before this call has run.
    ///
    /// Without a background worker the calling thread polls itself, yielding
    /// between rounds. Requests requeued by those callbacks are not waited for.
    ///
    /// 阻塞直到本次调用之前入队的所有请求都已运行。没有后台工作线程时，
    /// 调用线程自行轮询并在轮次之间让出 CPU。
    pub fn drain(&self) {
        let target = self.state.lock().next_seq - 1;

        if self.has_worker.load(Ordering::Acquire) {
            let mut state = self.state.lock();
            while state.completed_seq < target {
                state = self.cond.wait(state);
            }
            return;
        }

        loop {
            self.poll();
            if self.state.lock().completed_seq >= target {
                return;
            }
            yield_now();
        }
    }

    /// Spawn the background worker that keeps the queue moving.
    #[cfg(not(feature = "loom"))]
    pub fn start_worker(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Ok(());
        }
        let queue = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("gc".into())
            .spawn(move || queue.worker_loop(interval))
            .map_err(|e| Error::OutOfResources(format!("gc worker: {}", e)))?;
        *slot = Some(handle);
        self.has_worker.store(true, Ordering::Release);
        debug!("[GcQueue] worker started");
        Ok(())
    }

    #[cfg(not(feature = "loom"))]
    fn worker_loop(&self, interval: Duration) {
        let mut state = self.state.lock();
        loop {
            if state.terminate && state.requests.is_empty() {
                break;
            }
            if state.requests.is_empty() {
                state = self.cond.wait(state);
                continue;
            }
            drop(state);
            let completed = self.poll();
            state = self.state.lock();
            if completed == 0 && !state.requests.is_empty() {
                let (guard, _) = self.cond.wait_timeout(state, interval);
                state = guard;
            }
        }
    }

    /// Drain the queue, then stop and join the background worker if any.
    pub fn shutdown(&self) {
        self.drain();
        #[cfg(not(feature = "loom"))]
        {
            let handle = self.worker.lock().take();
            if let Some(handle) = handle {
                self.state.lock().terminate = true;
                self.cond.notify_all();
                if handle.join().is_err() {
                    error!("[GcQueue] worker panicked");
                }
                self.has_worker.store(false, Ordering::Release);
                debug!("[GcQueue] worker stopped");
            }
        }
    }
}

impl std::fmt::Debug for GcQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GcQueue")
            .field("pending", &state.requests.len())
            .field("completed_seq", &state.completed_seq)
            .field("has_worker", &self.has_worker.load(Ordering::Relaxed))
            .finish()
    }
}
