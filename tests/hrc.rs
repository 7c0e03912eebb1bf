//! Correctness tests for the HRC engine, exercising the reference-count
//! license and the cooperative clean-up of chained deleted nodes.

use petek::{
    AtomicMarkedPtr, HrcConfig, HrcDomain, HrcHeader, HrcLocal, HrcManaged, HrcOps, MarkedPtr,
    Ordering,
};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A list node shaped like the bag's blocks: a 3-bit marked next link.
#[repr(C)]
struct Node {
    header: HrcHeader,
    next: AtomicMarkedPtr<Node, 3>,
    freed: Arc<AtomicUsize>,
}

unsafe impl HrcManaged for Node {}

impl Drop for Node {
    fn drop(&mut self) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe fn node_clean_up(node: *mut HrcHeader, local: &HrcLocal<'_>) {
    let node = node as *mut Node;
    let guard_next = local.guard();
    let guard_after = local.guard();
    loop {
        let next = local.deref_link(&guard_next, &(*node).next);
        if next.is_null() || !(*(next.ptr() as *mut HrcHeader)).is_deleted() {
            break;
        }
        let after = local.deref_link(&guard_after, &(*next.ptr()).next);
        local.cas_ref(&(*node).next, next, MarkedPtr::new(after.ptr(), next.tag()));
    }
}

unsafe fn node_terminate(node: *mut HrcHeader, local: &HrcLocal<'_>, concurrent: bool) {
    let node = node as *mut Node;
    let dead_end = MarkedPtr::new(std::ptr::null_mut(), 1);
    if concurrent {
        loop {
            let current = (*node).next.load(Ordering::Relaxed);
            if local.cas_ref(&(*node).next, current, dead_end) {
                break;
            }
        }
    } else {
        local.store_ref(&(*node).next, dead_end);
    }
}

unsafe fn node_dealloc(node: *mut HrcHeader) {
    drop(Box::from_raw(node as *mut Node));
}

static NODE_OPS: HrcOps = HrcOps {
    clean_up: node_clean_up,
    terminate: node_terminate,
    dealloc: node_dealloc,
};

fn node(freed: &Arc<AtomicUsize>) -> *mut Node {
    Box::into_raw(Box::new(Node {
        header: HrcHeader::new(&NODE_OPS),
        next: AtomicMarkedPtr::null(),
        freed: freed.clone(),
    }))
}

#[test]
fn deleted_chain_reclaims_with_terminate_cascade() {
    init_logging();
    let domain = HrcDomain::new(HrcConfig::default());
    let local = domain.attach();
    let freed = Arc::new(AtomicUsize::new(0));

    // head -> n1 -> n2 -> n3, all links counted.
    let n1 = node(&freed);
    let n2 = node(&freed);
    let n3 = node(&freed);
    let head: AtomicMarkedPtr<Node, 3> = AtomicMarkedPtr::null();
    unsafe {
        local.store_ref(&(*n2).next, MarkedPtr::new(n3, 0));
        local.store_ref(&(*n1).next, MarkedPtr::new(n2, 0));
        local.store_ref(&head, MarkedPtr::new(n1, 0));
    }

    // A guard pins n3 through the whole run.
    let guard = local.guard();
    let pinned = local.deref_link(&guard, unsafe { &(*n2).next });
    assert_eq!(pinned.ptr(), n3);

    // Logically delete the run and drop the external reference.
    unsafe {
        local.retire_node(n1);
        local.retire_node(n2);
        local.retire_node(n3);
        local.store_ref(&head, MarkedPtr::null());
    }

    // Each scan frees the current head of the dead chain; its terminate
    // releases the count on the next one.
    for _ in 0..4 {
        local.scan();
    }
    assert_eq!(
        freed.load(Ordering::SeqCst),
        2,
        "n1 and n2 reclaim; n3 stays guarded"
    );

    drop(guard);
    local.scan();
    assert_eq!(freed.load(Ordering::SeqCst), 3);
}

#[test]
fn clean_up_unlinks_deleted_successors() {
    init_logging();
    let domain = HrcDomain::new(HrcConfig::default());
    let local = domain.attach();
    let freed = Arc::new(AtomicUsize::new(0));

    // a -> d1 -> d2 -> tail, all retired except tail. Clean-up must swing
    // a.next across the deleted run so the chain cannot keep itself alive.
    let a = node(&freed);
    let d1 = node(&freed);
    let d2 = node(&freed);
    let tail = node(&freed);
    unsafe {
        local.store_ref(&(*d2).next, MarkedPtr::new(tail, 0));
        local.store_ref(&(*d1).next, MarkedPtr::new(d2, 0));
        local.store_ref(&(*a).next, MarkedPtr::new(d1, 0));

        local.retire_node(d1);
        local.retire_node(d2);
        local.retire_node(a);
    }

    local.clean_up_all();

    unsafe {
        let next = (*a).next.load(Ordering::Acquire);
        assert_eq!(next.ptr(), tail, "clean-up should skip the deleted run");
    }

    // With the chain short-circuited, every retired node reclaims.
    for _ in 0..4 {
        local.scan();
    }
    assert_eq!(freed.load(Ordering::SeqCst), 3);

    unsafe {
        // tail was never retired; manual teardown.
        drop(Box::from_raw(tail));
    }
}

#[test]
fn marked_links_count_like_plain_ones() {
    init_logging();
    let domain = HrcDomain::new(HrcConfig::default());
    let local = domain.attach();
    let freed = Arc::new(AtomicUsize::new(0));

    let a = node(&freed);
    let b = node(&freed);
    let link: AtomicMarkedPtr<Node, 3> = AtomicMarkedPtr::null();

    unsafe {
        local.store_ref(&link, MarkedPtr::new(a, 0));
        assert_eq!((*a).header.ref_count(), 1);

        // cas_ref with a tag change on the same pointer keeps one count.
        let swung = local.cas_ref(&link, MarkedPtr::new(a, 0), MarkedPtr::new(a, 1));
        assert!(swung);
        assert_eq!((*a).header.ref_count(), 1);

        // Swinging to b moves the count across.
        let swung = local.cas_ref(&link, MarkedPtr::new(a, 1), MarkedPtr::new(b, 2));
        assert!(swung);
        assert_eq!((*a).header.ref_count(), 0);
        assert_eq!((*b).header.ref_count(), 1);

        local.store_ref(&link, MarkedPtr::null());
        drop(Box::from_raw(a));
        drop(Box::from_raw(b));
    }
}

#[test]
fn detach_leaves_nodes_for_the_next_attach() {
    init_logging();
    let domain = HrcDomain::new(HrcConfig::default());
    let freed = Arc::new(AtomicUsize::new(0));

    {
        let local = domain.attach();
        let n = node(&freed);
        unsafe { local.retire_node(n) };
    }
    assert_eq!(freed.load(Ordering::SeqCst), 0);

    // Reattach: the parked node is scanned away.
    let _local = domain.attach();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[test]
fn domain_drop_returns_parked_memory() {
    init_logging();
    let freed = Arc::new(AtomicUsize::new(0));
    {
        let domain = HrcDomain::new(HrcConfig::default());
        let local = domain.attach();
        let keeper: AtomicMarkedPtr<Node, 3> = AtomicMarkedPtr::null();
        let n = node(&freed);
        unsafe {
            // Keep a count so no scan can free it early.
            local.store_ref(&keeper, MarkedPtr::new(n, 0));
            local.retire_node(n);
        }
        local.scan();
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(local);
    }
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}
