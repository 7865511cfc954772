/// 回收队列测试模块
/// 测试 FIFO 顺序、队首阻塞、requeue、drain 和后台工作线程
use crate::error::Error;
use crate::gc::{GcQueue, GcRequest};
use crate::vtime::ThreadStates;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn queue(max_threads: usize) -> (Arc<ThreadStates>, Arc<GcQueue>) {
    let threads = Arc::new(ThreadStates::new(max_threads));
    let gc = Arc::new(GcQueue::new(Arc::clone(&threads)));
    (threads, gc)
}

/// 测试1: 队首请求阻塞其后已就绪的请求
#[test]
fn test_head_blocks_queue() {
    let (threads, gc) = queue(4);
    let slot = threads.claim().unwrap();
    threads.advance(slot);

    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    gc.submit(&[slot], move || o.lock().unwrap().push(1)).unwrap();
    let o = Arc::clone(&order);
    gc.submit(&[], move || o.lock().unwrap().push(2)).unwrap();

    // 第二个请求本身已就绪，但被第一个挡住
    assert_eq!(gc.poll(), 0);
    assert_eq!(gc.pending(), 2);

    threads.advance(slot);
    assert_eq!(gc.poll(), 2);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

/// 测试2: 越界的槽被拒绝
#[test]
fn test_submit_rejects_bad_slot() {
    let (_threads, gc) = queue(2);
    let err = gc.submit(&[5], || {}).unwrap_err();
    assert!(matches!(err, Error::BadParameter(_)));
    assert_eq!(gc.pending(), 0);
}

/// 测试3: requeue 保留原始快照，串联的第二步在同一次轮询中完成
#[test]
fn test_requeue_keeps_snapshot() {
    let (threads, gc) = queue(4);
    let slot = threads.claim().unwrap();
    threads.advance(slot);
    let snapshot = threads.snapshot(slot);

    let seen: Arc<Mutex<Vec<Vec<(usize, u32)>>>> = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&seen);
    gc.submit_with(
        &[slot],
        Box::new(move |gc: &GcQueue, req: GcRequest| {
            first.lock().unwrap().push(req.vtimes().to_vec());
            let second = Arc::clone(&first);
            gc.requeue(
                req,
                Box::new(move |_: &GcQueue, req: GcRequest| {
                    second.lock().unwrap().push(req.vtimes().to_vec());
                }),
            );
        }),
    )
    .unwrap();

    assert_eq!(gc.poll(), 0);
    threads.advance(slot);
    assert_eq!(gc.poll(), 2);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], vec![(slot, snapshot)]);
    assert_eq!(seen[1], seen[0]);
}

/// 测试4: 无工作线程时 drain 在调用线程上轮询直到完成
#[test]
fn test_drain_without_worker() {
    let (threads, gc) = queue(4);
    let slot = threads.claim().unwrap();
    threads.advance(slot);

    let done = Arc::new(Mutex::new(false));
    let d = Arc::clone(&done);
    gc.submit(&[slot], move || *d.lock().unwrap() = true).unwrap();

    let mover = {
        let threads = Arc::clone(&threads);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            threads.advance(slot);
        })
    };
    gc.drain();
    assert!(*done.lock().unwrap());
    mover.join().unwrap();
}

/// 测试5: 后台工作线程推进队列，shutdown 可重复调用
#[test]
fn test_worker_completes_requests() {
    let (threads, gc) = queue(4);
    gc.start_worker(Duration::from_millis(1)).unwrap();
    let slot = threads.claim().unwrap();
    threads.advance(slot);

    let count = Arc::new(Mutex::new(0));
    for _ in 0..10 {
        let c = Arc::clone(&count);
        gc.submit(&[slot], move || *c.lock().unwrap() += 1).unwrap();
    }
    thread::sleep(Duration::from_millis(5));
    assert_eq!(*count.lock().unwrap(), 0);

    threads.release(slot);
    gc.drain();
    assert_eq!(*count.lock().unwrap(), 10);

    gc.shutdown();
    gc.shutdown();
    assert_eq!(gc.pending(), 0);
}

/// 测试6: 只有一个线程能同时轮询
#[test]
fn test_single_poller() {
    let (_threads, gc) = queue(4);
    let inner = Arc::new(Mutex::new(None));
    let i = Arc::clone(&inner);
    gc.submit_with(
        &[],
        Box::new(move |gc: &GcQueue, _req: GcRequest| {
            // 回调运行时本线程正持有轮询权
            *i.lock().unwrap() = Some(gc.poll());
        }),
    )
    .unwrap();
    assert_eq!(gc.poll(), 1);
    assert_eq!(*inner.lock().unwrap(), Some(0));
}

/// 测试7: 回调 panic 不会卡住队列，后续请求照常完成
#[test]
fn test_panicking_callback_does_not_stall_queue() {
    let (_threads, gc) = queue(4);
    let ran = Arc::new(Mutex::new(false));

    gc.submit(&[], || panic!("callback failure")).unwrap();
    let r = Arc::clone(&ran);
    gc.submit(&[], move || *r.lock().unwrap() = true).unwrap();

    assert_eq!(gc.poll(), 2);
    assert_eq!(gc.pending(), 0);
    assert!(*ran.lock().unwrap());

    let r = Arc::clone(&ran);
    *ran.lock().unwrap() = false;
    gc.submit(&[], move || *r.lock().unwrap() = true).unwrap();
    gc.drain();
    assert!(*ran.lock().unwrap());
}
