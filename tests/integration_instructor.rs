//! Instructor integration tests
//!
//! Loops started through one instructor, controlled and serviced from other
//! threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tickloop::{Instructor, Loop, LoopState, Resolved, Retain};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// A forever loop whose only step services the instructor
fn servicing_loop(instructor: &Instructor) -> Loop {
    let lp = Loop::forever();
    let inst = instructor.clone();
    lp.append(move |lp, _| {
        inst.tick(lp).unwrap();
        thread::sleep(Duration::from_millis(1));
    });
    lp
}

/// Empty forever loop stopped through the instructor
#[test]
fn test_instructor_notify_break_stops_empty_forever_loop() {
    init_logging();
    let instructor = Instructor::new();
    let lp = Loop::forever();
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || instructor.loop_count() == 1));

    instructor.notify(LoopState::Break);
    assert!(wait_until(Duration::from_secs(1), || !lp.is_alive()));
    handle.join().unwrap().unwrap();

    assert_eq!(instructor.loop_count(), 0);
    assert_eq!(instructor.state(), LoopState::Break);
}

/// Empty forever loop stopped directly
#[test]
fn test_loop_notify_break_stops_registered_loop() {
    let instructor = Instructor::new();
    let lp = Loop::forever();
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || lp.is_alive()));

    lp.notify(LoopState::Break);
    handle.join().unwrap().unwrap();
    assert!(!lp.is_alive());
    assert_eq!(instructor.loop_count(), 0);
}

/// Loops started later inherit the broadcast state
#[test]
fn test_notify_sets_default_for_new_loops() {
    let instructor = Instructor::new();
    instructor.notify(LoopState::Sleep);

    let lp = Loop::forever();
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || lp.is_alive()));
    assert_eq!(lp.state(), LoopState::Sleep);

    instructor.notify(LoopState::Break);
    handle.join().unwrap().unwrap();
}

/// join returns only once every registered loop has left
#[test]
fn test_join_waits_for_every_loop() {
    let instructor = Instructor::new();
    let first = Loop::forever();
    let second = Loop::forever();
    let handles = vec![instructor.thread(&first).unwrap(), instructor.thread(&second).unwrap()];
    assert!(wait_until(Duration::from_secs(2), || instructor.loop_count() == 2));

    let joined = Arc::new(AtomicBool::new(false));
    let (inst, flag) = (instructor.clone(), joined.clone());
    let joiner = thread::spawn(move || {
        inst.join().unwrap();
        flag.store(true, Ordering::SeqCst);
    });

    first.notify(LoopState::Break);
    assert!(wait_until(Duration::from_secs(2), || instructor.loop_count() == 1));
    thread::sleep(Duration::from_millis(30));
    assert!(!joined.load(Ordering::SeqCst));

    second.notify(LoopState::Break);
    joiner.join().unwrap();
    assert!(joined.load(Ordering::SeqCst));
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
}

/// A loop registered after join returned is not waited on by that join
#[test]
fn test_join_ignores_later_loops() {
    let instructor = Instructor::new();
    instructor.join().unwrap();

    let lp = Loop::forever();
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || instructor.loop_count() == 1));
    lp.notify(LoopState::Break);
    handle.join().unwrap().unwrap();
}

/// Timed post with no loop fires once through the timer, after about 50ms
#[test]
fn test_post_within_without_loops_times_out() {
    init_logging();
    let instructor = Instructor::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let started = Instant::now();

    instructor
        .post_within(50, move |_, lp, on_loop| {
            sink.lock().unwrap().push((lp.is_some(), on_loop, started.elapsed()));
            Retain::Drop
        })
        .unwrap();
    assert!(instructor.is_alive());

    assert!(wait_until(Duration::from_secs(2), || !calls.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(50));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (has_loop, on_loop, elapsed) = calls[0];
    assert!(!has_loop);
    assert!(!on_loop);
    assert!(elapsed >= Duration::from_millis(45));
    assert!(elapsed < Duration::from_secs(1));
    assert!(!instructor.is_alive());
}

/// Timed post serviced by a loop before the deadline
#[test]
fn test_post_within_serviced_by_loop() {
    let instructor = Instructor::new();
    let lp = servicing_loop(&instructor);
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || lp.is_alive()));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    instructor
        .post_within(5_000, move |_, lp, on_loop| {
            sink.lock().unwrap().push((lp.is_some(), on_loop));
            Retain::Drop
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !instructor.is_alive()));
    assert_eq!(*calls.lock().unwrap(), vec![(true, true)]);

    instructor.notify(LoopState::Break);
    handle.join().unwrap().unwrap();
}

/// join_within: zero and small positive timeouts are valid
#[test]
fn test_join_within_boundaries() {
    let instructor = Instructor::new();
    assert_eq!(instructor.join_within(0, || panic!("registry is empty")).unwrap(), Resolved::Action);
    assert_eq!(instructor.join_within(1, || panic!("registry is empty")).unwrap(), Resolved::Action);

    let lp = Loop::forever();
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || instructor.loop_count() == 1));

    let fallbacks = AtomicUsize::new(0);
    assert_eq!(
        instructor.join_within(0, || { fallbacks.fetch_add(1, Ordering::SeqCst); }).unwrap(),
        Resolved::Alternate
    );
    let started = Instant::now();
    assert_eq!(
        instructor.join_within(10, || { fallbacks.fetch_add(1, Ordering::SeqCst); }).unwrap(),
        Resolved::Alternate
    );
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(fallbacks.load(Ordering::SeqCst), 2);

    instructor.notify(LoopState::Break);
    assert_eq!(instructor.join_within(5_000, || panic!("loop should leave")).unwrap(), Resolved::Action);
    handle.join().unwrap().unwrap();
}

/// Posts are shared out among servicing loops, each delivered once
#[test]
fn test_posts_shared_between_loops() {
    init_logging();
    let instructor = Instructor::new();
    let loops: Vec<Loop> = (0..3).map(|_| servicing_loop(&instructor)).collect();
    let handles: Vec<_> = loops.iter().map(|lp| instructor.thread(lp).unwrap()).collect();
    assert!(wait_until(Duration::from_secs(2), || instructor.loop_count() == 3));

    let delivered = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = delivered.clone();
        instructor.post(move |_, lp, on_loop| {
            assert!(lp.is_some() && on_loop);
            counter.fetch_add(1, Ordering::SeqCst);
            Retain::Drop
        });
    }

    assert!(wait_until(Duration::from_secs(5), || !instructor.is_alive()));
    assert_eq!(delivered.load(Ordering::SeqCst), 100);

    instructor.notify(LoopState::Break);
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
}

/// synchronously_within falls back when loops never service the queue
#[test]
fn test_synchronously_within_with_idle_loop() {
    let instructor = Instructor::new();
    let lp = Loop::forever();
    let handle = instructor.thread(&lp).unwrap();
    assert!(wait_until(Duration::from_secs(2), || lp.is_alive()));

    let resolved = instructor
        .synchronously_within(20, |_, lp, on_loop| {
            assert!(lp.is_none() && !on_loop);
            Retain::Drop
        })
        .unwrap();
    assert_eq!(resolved, Resolved::Alternate);
    assert_eq!(instructor.pending_posts(), 0);

    instructor.notify(LoopState::Break);
    handle.join().unwrap().unwrap();
}
