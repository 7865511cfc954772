/// 线程虚拟时间测试模块
/// 测试槽的占用与释放、可重入唤醒以及基于随机调度的回收正确性
use crate::error::Error;
use crate::gc::GcQueue;
use crate::vtime::ThreadStates;
use std::sync::{Arc, Mutex};

/// 测试1: 槽用尽后返回 OutOfResources，释放后可再次占用
#[test]
fn test_claim_until_exhausted() {
    let threads = ThreadStates::new(2);
    let a = threads.claim().unwrap();
    let b = threads.claim().unwrap();
    assert_ne!(a, b);
    assert!(matches!(threads.claim(), Err(Error::OutOfResources(_))));

    threads.release(a);
    assert!(!threads.in_use(a));
    assert_eq!(threads.claim().unwrap(), a);
}

/// 测试2: 唤醒守卫可重入，只有最外层推进时钟
#[test]
fn test_awake_guard_reentrant() {
    let threads = Arc::new(ThreadStates::new(4));
    let state = threads.register().unwrap();
    let slot = state.slot();
    let start = threads.snapshot(slot);

    {
        let outer = state.awake();
        let awake_at = threads.snapshot(slot);
        assert_eq!(awake_at, start + 1);
        assert!(threads.is_awake(slot));
        {
            let _inner = state.awake();
            let _copy = outer.clone();
            assert_eq!(threads.snapshot(slot), awake_at);
        }
        assert!(state.is_awake());
        assert_eq!(threads.snapshot(slot), awake_at);
    }
    assert!(!state.is_awake());
    assert!(!threads.is_awake(slot));
    assert_eq!(threads.snapshot(slot), start + 2);
}

/// 测试3: is_past 在时钟变化或槽空闲时成立
#[test]
fn test_is_past_semantics() {
    let threads = ThreadStates::new(4);
    let slot = threads.claim().unwrap();
    threads.advance(slot);
    let snap = threads.snapshot(slot);
    assert!(!threads.is_past(slot, snap));

    threads.advance(slot);
    assert!(threads.is_past(slot, snap));

    let snap = threads.snapshot(slot);
    threads.release(slot);
    assert!(threads.is_past(slot, snap));

    // 复用槽后，旧快照仍然视为已越过
    let again = threads.claim().unwrap();
    assert_eq!(again, slot);
    assert!(threads.is_past(slot, snap));
}

/// 测试4: 释放唤醒中的槽后时钟保持偶数且不回退
#[test]
fn test_release_keeps_clock_moving_forward() {
    let threads = ThreadStates::new(1);
    let slot = threads.claim().unwrap();
    threads.advance(slot);
    let awake = threads.snapshot(slot);
    threads.release(slot);
    let after = threads.snapshot(slot);
    assert!(after > awake);
    assert_eq!(after % 2, 0);
}

/// 测试5: ThreadState drop 时归还槽
#[test]
fn test_thread_state_drop_releases_slot() {
    let threads = Arc::new(ThreadStates::new(1));
    let state = threads.register().unwrap();
    assert!(threads.register().is_err());
    drop(state);
    assert!(threads.register().is_ok());
}

/// 测试6: 随机调度下的回收
///
/// 单线程模拟若干线程的唤醒/休眠切换，同时提交回收请求并轮询。
/// 检查：回调不会在任一被捕获线程经过静止点之前运行，回调按提交顺序运行，
/// 所有线程休眠后所有请求最终都会完成。
#[test]
fn test_synthetic_scheduler_no_early_firing_no_starvation() {
    const SLOTS: usize = 4;
    let threads = Arc::new(ThreadStates::new(SLOTS));
    let gc = GcQueue::new(Arc::clone(&threads));
    let slots: Vec<usize> = (0..SLOTS).map(|_| threads.claim().unwrap()).collect();

    let mut rng = fastrand::Rng::with_seed(0x5eed_cafe);
    let mut transitions = [0u64; SLOTS];
    let mut captured: Vec<Vec<(usize, u64)>> = Vec::new();
    let fired: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut checked = 0usize;

    for _ in 0..5_000 {
        match rng.u8(0..3) {
            0 => {
                let i = rng.usize(0..SLOTS);
                threads.advance(slots[i]);
                transitions[i] += 1;
            }
            1 => {
                let id = captured.len();
                captured.push(
                    (0..SLOTS)
                        .filter(|&i| threads.is_awake(slots[i]))
                        .map(|i| (i, transitions[i]))
                        .collect(),
                );
                let fired = Arc::clone(&fired);
                gc.submit_awake(move || fired.lock().unwrap().push(id));
            }
            _ => {
                gc.poll();
            }
        }

        let fired = fired.lock().unwrap();
        for (pos, &id) in fired.iter().enumerate().skip(checked) {
            assert_eq!(id, pos, "requests completed out of order");
            for &(i, at) in &captured[id] {
                assert!(
                    transitions[i] > at,
                    "request {} fired before slot {} left its protected region",
                    id,
                    i
                );
            }
        }
        checked = fired.len();
    }

    // 所有线程进入休眠
    for (i, &slot) in slots.iter().enumerate() {
        if threads.is_awake(slot) {
            threads.advance(slot);
            transitions[i] += 1;
        }
    }
    gc.poll();
    assert_eq!(fired.lock().unwrap().len(), captured.len());
    assert_eq!(gc.pending(), 0);
}

/// 测试7: 按槽访问的方法对越界槽 panic
#[test]
#[should_panic]
fn test_out_of_range_slot_panics() {
    let threads = ThreadStates::new(2);
    threads.advance(2);
}
