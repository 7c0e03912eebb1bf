//! Functional tests for the bag surface.

use petek_bag::SBag;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn empty_bag_reports_empty() {
    init_logging();
    let bag: SBag<usize> = SBag::new(usize::MAX, 2);
    let handle = bag.init_thread(0);
    let mut out = 0usize;
    assert!(!handle.try_remove_any(&mut out));
    // Still empty on a second ask.
    assert!(!handle.try_remove_any(&mut out));
}

#[test]
fn add_remove_round_trip() {
    init_logging();
    let bag: SBag<usize> = SBag::new(usize::MAX, 2);
    let handle = bag.init_thread(0);
    for i in 0..500 {
        handle.add(i);
    }
    let mut seen = vec![false; 500];
    let mut out = 0usize;
    while handle.try_remove_any(&mut out) {
        assert!(!seen[out], "value {} returned twice", out);
        seen[out] = true;
    }
    assert!(seen.iter().all(|&s| s), "some values never came back");
}

#[test]
fn zero_round_trips_with_negative_sentinel() {
    init_logging();
    // Sentinel -1 leaves 0 a perfectly ordinary value.
    let bag: SBag<i64> = SBag::new(-1, 1);
    let handle = bag.init_thread(0);
    handle.add(0);
    handle.add(7);
    let mut out = 0i64;
    let mut got = Vec::new();
    while handle.try_remove_any(&mut out) {
        got.push(out);
    }
    got.sort_unstable();
    assert_eq!(got, vec![0, 7]);
}

#[test]
fn values_survive_thread_handoff() {
    init_logging();
    // Producer registers, adds, deregisters; a consumer under another
    // index steals everything it published.
    let bag: SBag<usize> = SBag::new(usize::MAX, 2);
    {
        let producer = bag.init_thread(0);
        for i in 0..100 {
            producer.add(i);
        }
    }
    let consumer = bag.init_thread(1);
    let mut out = 0usize;
    let mut count = 0;
    while consumer.try_remove_any(&mut out) {
        count += 1;
    }
    assert_eq!(count, 100);
}

#[test]
fn reregistration_resumes_the_same_list() {
    init_logging();
    let bag: SBag<usize> = SBag::new(usize::MAX, 1);
    {
        let handle = bag.init_thread(0);
        for i in 0..10 {
            handle.add(i);
        }
    }
    // Same index again: the published head is adopted.
    let handle = bag.init_thread(0);
    for i in 10..20 {
        handle.add(i);
    }
    let mut out = 0usize;
    let mut count = 0;
    while handle.try_remove_any(&mut out) {
        count += 1;
    }
    assert_eq!(count, 20);
}

#[test]
fn pointer_values_round_trip() {
    init_logging();
    let bag: SBag<*mut u32> = SBag::new(std::ptr::null_mut(), 1);
    let handle = bag.init_thread(0);
    let a = Box::into_raw(Box::new(5u32));
    let b = Box::into_raw(Box::new(6u32));
    handle.add(a);
    handle.add(b);
    let mut out = std::ptr::null_mut();
    let mut got = Vec::new();
    while handle.try_remove_any(&mut out) {
        got.push(out);
    }
    assert_eq!(got.len(), 2);
    assert!(got.contains(&a) && got.contains(&b));
    unsafe {
        drop(Box::from_raw(a));
        drop(Box::from_raw(b));
    }
}

#[test]
fn blocks_are_reclaimed_as_the_list_drains() {
    init_logging();
    let bag: SBag<usize> = SBag::new(usize::MAX, 1);
    let handle = bag.init_thread(0);
    // Fill and drain enough blocks that the consumer's block-advance path
    // retires the drained ones and forces scans of the retired buffer.
    for _ in 0..10 {
        for i in 0..128 {
            handle.add(i);
        }
        let mut out = 0usize;
        while handle.try_remove_any(&mut out) {}
    }
    drop(handle);
    let stats = bag.reclaim_stats();
    assert!(
        stats.disposed > 0,
        "drained blocks should flow through the reclaimer: {:?}",
        stats
    );
}
