//! The hazard-pointer + reference-count (HRC) reclamation engine.
//!
//! Gidenstam's scheme: hazard pointers guarantee the safety of local
//! references, per-node reference counts guarantee the safety of links
//! *inside* the structure. A node is physically freed only once its
//! reference count is zero, its `trace` flag survived a full scan, and no
//! hazard slot publishes it.
//!
//! Managed nodes embed an [`HrcHeader`] as their first field (`#[repr(C)]`)
//! and supply a static [`HrcOps`] callback table:
//!
//! - `clean_up` lets the container swing the node's links past deleted
//!   successors, so chains of deleted nodes do not keep each other alive
//! - `terminate` is the last writer's chance to neuter the node's links
//!   (dropping the counts they hold) right before the free
//! - `dealloc` returns the memory

use crate::config::HrcConfig;
use crate::marked::{AtomicMarkedPtr, MarkedPtr};
use crate::registry::{current_thread_id, Record, RecordList, FREE_OWNER};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use core::{fmt, ptr};
use log::{debug, trace};

// ---------------------------------------------------------------------------
// Managed-node surface
// ---------------------------------------------------------------------------

/// Container-supplied callbacks of a managed node type.
///
/// One static table per node type; every header points at its table, which
/// is how the scan dispatches without knowing concrete types.
pub struct HrcOps {
    /// Swing the node's links past consecutive deleted successors.
    ///
    /// Invoked cooperatively (any thread, any time before the free), so it
    /// must only use [`HrcLocal::deref_link`] / [`HrcLocal::cas_ref`] on
    /// the node's own link fields.
    pub clean_up: unsafe fn(node: *mut HrcHeader, local: &HrcLocal<'_>),
    /// Neuter the node's links immediately before the free, releasing the
    /// counts they hold. `concurrent` is false when the scan already owns
    /// the node exclusively.
    pub terminate: unsafe fn(node: *mut HrcHeader, local: &HrcLocal<'_>, concurrent: bool),
    /// Free the node's memory. Runs exactly once.
    pub dealloc: unsafe fn(node: *mut HrcHeader),
}

/// Reclamation header embedded at the start of every managed node.
///
/// Free license: `ref_count == 0` and `trace` and no hazard slot publishes
/// the node.
#[repr(C)]
pub struct HrcHeader {
    rc: AtomicUsize,
    trace: AtomicBool,
    deleted: AtomicBool,
    ops: &'static HrcOps,
}

impl HrcHeader {
    /// Creates a header for a node dispatching through `ops`.
    pub fn new(ops: &'static HrcOps) -> Self {
        Self {
            rc: AtomicUsize::new(0),
            trace: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            ops,
        }
    }

    /// Number of counted links currently referencing the node.
    pub fn ref_count(&self) -> usize {
        self.rc.load(Ordering::Acquire)
    }

    /// True once the node has been logically removed via
    /// [`HrcLocal::retire_node`].
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl fmt::Debug for HrcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HrcHeader(rc={}, trace={}, deleted={})",
            self.rc.load(Ordering::Relaxed),
            self.trace.load(Ordering::Relaxed),
            self.deleted.load(Ordering::Relaxed),
        )
    }
}

/// Marker for node types managed by the HRC engine.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with an [`HrcHeader`] as the first
/// field, so a node pointer is also a valid header pointer. The header's
/// [`HrcOps`] must match the implementing type.
pub unsafe trait HrcManaged {}

#[inline]
fn hdr<N: HrcManaged>(node: *mut N) -> *mut HrcHeader {
    node.cast()
}

// ---------------------------------------------------------------------------
// Per-thread record
// ---------------------------------------------------------------------------

/// One parked retired node. `done` and `claim` coordinate the scan's free
/// with concurrent cooperative clean-up so a node is never destroyed while
/// someone still runs `clean_up` on it.
struct RetiredSlot {
    node: AtomicPtr<HrcHeader>,
    done: AtomicBool,
    claim: AtomicUsize,
}

impl RetiredSlot {
    fn empty() -> Self {
        Self {
            node: AtomicPtr::new(ptr::null_mut()),
            done: AtomicBool::new(false),
            claim: AtomicUsize::new(0),
        }
    }
}

pub(crate) struct HrcRecord {
    hazards: Box<[AtomicUsize]>,
    /// Bitmask of slots held by live guards. Owner-only.
    in_use: AtomicUsize,
    retired: Box<[RetiredSlot]>,
    /// Occupied retired slots. Owner-only bookkeeping.
    count: AtomicUsize,
}

impl HrcRecord {
    fn new(config: &HrcConfig) -> Self {
        let hazards = (0..config.hazard_pointers_per_thread)
            .map(|_| AtomicUsize::new(0))
            .collect();
        let retired = (0..config.retired_capacity())
            .map(|_| RetiredSlot::empty())
            .collect();
        Self {
            hazards,
            in_use: AtomicUsize::new(0),
            retired,
            count: AtomicUsize::new(0),
        }
    }

    fn is_full(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= self.retired.len()
    }
}

#[derive(Default)]
struct HrcEvents {
    records_allocated: AtomicUsize,
    records_reused: AtomicUsize,
    scans: AtomicUsize,
    help_scans: AtomicUsize,
    clean_up_alls: AtomicUsize,
    disposed: AtomicUsize,
    deferred: AtomicUsize,
}

/// Snapshot of a domain's event counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HrcDomainStats {
    /// Records allocated (first attach of a fresh slot in the list).
    pub records_allocated: usize,
    /// Attaches that reused a previously released record.
    pub records_reused: usize,
    /// Scan passes run.
    pub scans: usize,
    /// Help-scan passes run.
    pub help_scans: usize,
    /// Cooperative clean-up sweeps over all records.
    pub clean_up_alls: usize,
    /// Nodes terminated and freed.
    pub disposed: usize,
    /// Nodes kept by a scan (guarded, referenced, or claim-held).
    pub deferred: usize,
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// An HRC reclamation domain.
pub struct HrcDomain {
    records: RecordList<HrcRecord>,
    config: HrcConfig,
    events: HrcEvents,
}

impl HrcDomain {
    /// Creates a domain.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent.
    pub fn new(config: HrcConfig) -> Self {
        config.validate();
        Self {
            records: RecordList::new(),
            config,
            events: HrcEvents::default(),
        }
    }

    /// Attaches the calling thread and returns its engine handle.
    ///
    /// A reused record may hold retired nodes its previous owner left
    /// behind; those are scanned immediately.
    pub fn attach(&self) -> HrcLocal<'_> {
        let (rec, reused) = self.records.acquire(|| HrcRecord::new(&self.config));
        if reused {
            self.events.records_reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events.records_allocated.fetch_add(1, Ordering::Relaxed);
        }
        let local = HrcLocal { domain: self, rec };
        if reused && rec.payload.count.load(Ordering::Relaxed) != 0 {
            local.scan();
        }
        local
    }

    /// Number of hazard slots each attached thread owns.
    pub fn hazard_pointers_per_thread(&self) -> usize {
        self.config.hazard_pointers_per_thread
    }

    /// Snapshot of the domain's event counters.
    pub fn stats(&self) -> HrcDomainStats {
        HrcDomainStats {
            records_allocated: self.events.records_allocated.load(Ordering::Relaxed),
            records_reused: self.events.records_reused.load(Ordering::Relaxed),
            scans: self.events.scans.load(Ordering::Relaxed),
            help_scans: self.events.help_scans.load(Ordering::Relaxed),
            clean_up_alls: self.events.clean_up_alls.load(Ordering::Relaxed),
            disposed: self.events.disposed.load(Ordering::Relaxed),
            deferred: self.events.deferred.load(Ordering::Relaxed),
        }
    }

    fn collect_hazards(&self) -> Vec<usize> {
        let mut hazards =
            Vec::with_capacity(self.config.max_threads * self.config.hazard_pointers_per_thread);
        for rec in self.records.iter() {
            for slot in rec.payload.hazards.iter() {
                let hazard = slot.load(Ordering::Acquire);
                if hazard != 0 {
                    hazards.push(hazard);
                }
            }
        }
        hazards
    }
}

impl Drop for HrcDomain {
    fn drop(&mut self) {
        // No locals can borrow the domain here: every parked node is
        // unreachable, so the memory is returned without terminate (links
        // may dangle into other nodes freed by this same loop).
        for rec in self.records.iter() {
            for slot in rec.payload.retired.iter() {
                let node = slot.node.load(Ordering::Relaxed);
                if !node.is_null() {
                    slot.node.store(ptr::null_mut(), Ordering::Relaxed);
                    // SAFETY: exclusive access at domain teardown.
                    unsafe { ((*node).ops.dealloc)(node) };
                }
            }
        }
    }
}

impl fmt::Debug for HrcDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HrcDomain({:?})", self.stats())
    }
}

// ---------------------------------------------------------------------------
// Local handle
// ---------------------------------------------------------------------------

/// One thread's attachment to an [`HrcDomain`].
pub struct HrcLocal<'d> {
    domain: &'d HrcDomain,
    rec: &'d Record<HrcRecord>,
}

impl<'d> HrcLocal<'d> {
    /// Acquires a free hazard slot wrapped in an RAII guard.
    ///
    /// # Panics
    ///
    /// Panics when all configured slots are in use.
    pub fn guard(&self) -> HrcGuard<'_> {
        let mask = self.rec.payload.in_use.load(Ordering::Relaxed);
        let slots = self.rec.payload.hazards.len();
        let index = (0..slots)
            .find(|i| mask & (1 << i) == 0)
            .unwrap_or_else(|| {
                panic!("hazard pointer slots exhausted ({} per thread)", slots)
            });
        self.rec
            .payload
            .in_use
            .store(mask | (1 << index), Ordering::Relaxed);
        HrcGuard { rec: self.rec, index }
    }

    /// Dereferences a marked link: publishes the pointer into `guard`'s
    /// slot and retries until the link re-reads stable. The returned value
    /// (pointer and tag) stays safe to dereference while the guard holds
    /// it.
    pub fn deref_link<N: HrcManaged, const B: usize>(
        &self,
        guard: &HrcGuard<'_>,
        link: &AtomicMarkedPtr<N, B>,
    ) -> MarkedPtr<N, B> {
        debug_assert!(ptr::eq(guard.rec, self.rec), "guard from another thread");
        let mut current = link.load(Ordering::Relaxed);
        loop {
            guard.slot().store(current.ptr() as usize, Ordering::SeqCst);
            let reread = link.load(Ordering::Acquire);
            if reread == current {
                return current;
            }
            current = reread;
        }
    }

    /// Swings a link to `new`, adjusting reference counts: the new target
    /// gains a count, the old target loses one.
    ///
    /// # Safety
    ///
    /// The location must not be mutated concurrently (single-writer
    /// positions: a thread's own fields, or links of a node the caller
    /// created or exclusively owns). Both the old and new targets must be
    /// valid managed nodes or null.
    pub unsafe fn store_ref<N: HrcManaged, const B: usize>(
        &self,
        link: &AtomicMarkedPtr<N, B>,
        new: MarkedPtr<N, B>,
    ) {
        let old = link.swap(new, Ordering::Release);
        // SAFETY: targets are valid per the caller contract.
        unsafe {
            if !new.is_null() {
                (*hdr(new.ptr())).rc.fetch_add(1, Ordering::Relaxed);
            }
            if !old.is_null() {
                (*hdr(old.ptr())).rc.fetch_sub(1, Ordering::Release);
            }
        }
    }

    /// Compare-and-swing of a shared link. On success the counts move from
    /// `expected`'s target to `desired`'s, and `desired`'s trace flag is
    /// cleared so a concurrent scan re-examines it.
    ///
    /// # Safety
    ///
    /// `desired`'s target must be protected by the caller (hazard or
    /// counted reference) across the call; both targets must be valid
    /// managed nodes or null.
    pub unsafe fn cas_ref<N: HrcManaged, const B: usize>(
        &self,
        link: &AtomicMarkedPtr<N, B>,
        expected: MarkedPtr<N, B>,
        desired: MarkedPtr<N, B>,
    ) -> bool {
        if link
            .compare_exchange(expected, desired, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // SAFETY: targets are valid per the caller contract.
        unsafe {
            if !desired.is_null() {
                let header = hdr(desired.ptr());
                (*header).rc.fetch_add(1, Ordering::Relaxed);
                (*header).trace.store(false, Ordering::Release);
            }
            if !expected.is_null() {
                (*hdr(expected.ptr())).rc.fetch_sub(1, Ordering::Release);
            }
        }
        true
    }

    /// Logically deletes `node` and parks it for reclamation. The node is
    /// freed by a later scan once its count drops to zero, its trace flag
    /// survives, and no hazard publishes it.
    ///
    /// # Safety
    ///
    /// `node` must be a valid managed node that has just been unlinked
    /// from every shared location (its remaining counts come only from
    /// links inside other retired nodes), and must not be retired twice.
    pub unsafe fn retire_node<N: HrcManaged>(&self, node: *mut N) {
        let header = hdr(node);
        // SAFETY: node is valid per the caller contract.
        unsafe {
            (*header).deleted.store(true, Ordering::Release);
            (*header).trace.store(false, Ordering::Release);
        }
        trace!("retire_node {:p}", header);

        loop {
            if !self.rec.payload.is_full() {
                break;
            }
            // Full: try to make room before parking.
            self.clean_up_local();
            self.scan();
            if !self.rec.payload.is_full() {
                break;
            }
            self.clean_up_all();
            self.scan();
        }
        self.park(header);
    }

    /// Parks a header in the first empty retired slot. Owner-only.
    fn park(&self, header: *mut HrcHeader) {
        for slot in self.rec.payload.retired.iter() {
            if slot.node.load(Ordering::Relaxed).is_null() {
                slot.done.store(false, Ordering::Relaxed);
                slot.node.store(header, Ordering::Release);
                self.rec.payload.count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        unreachable!("retired buffer full after scan ladder");
    }

    /// Runs `clean_up` over this thread's own parked nodes, letting them
    /// drop references into other deleted nodes.
    pub fn clean_up_local(&self) {
        for slot in self.rec.payload.retired.iter() {
            let node = slot.node.load(Ordering::Acquire);
            if !node.is_null() && !slot.done.load(Ordering::Relaxed) {
                // SAFETY: parked nodes stay valid until their free, which
                // cannot happen during our own call (we are the owner and
                // not inside scan).
                unsafe { ((*node).ops.clean_up)(node, self) };
            }
        }
    }

    /// Runs `clean_up` over every thread's parked nodes under the per-slot
    /// claim counter, so a concurrent scan cannot free a node mid-cleanup.
    pub fn clean_up_all(&self) {
        self.domain.events.clean_up_alls.fetch_add(1, Ordering::Relaxed);
        for rec in self.domain.records.iter() {
            for slot in rec.payload.retired.iter() {
                let node = slot.node.load(Ordering::Acquire);
                if node.is_null() || slot.done.load(Ordering::Relaxed) {
                    continue;
                }
                slot.claim.fetch_add(1, Ordering::AcqRel);
                if !slot.done.load(Ordering::Acquire)
                    && slot.node.load(Ordering::Acquire) == node
                {
                    // SAFETY: the claim blocks the owning scan from
                    // freeing the node until we release it.
                    unsafe { ((*node).ops.clean_up)(node, self) };
                }
                slot.claim.fetch_sub(1, Ordering::Release);
            }
        }
    }

    /// Reclaims every parked node of this thread that satisfies the free
    /// license. Three stages: mark candidates, collect hazards, free.
    pub fn scan(&self) {
        self.domain.events.scans.fetch_add(1, Ordering::Relaxed);
        let payload = &self.rec.payload;

        // Stage 1: set trace on every candidate with a zero count, rolling
        // back when the count moved under us.
        for slot in payload.retired.iter() {
            let node = slot.node.load(Ordering::Acquire);
            if node.is_null() {
                continue;
            }
            // SAFETY: parked nodes are valid until freed by this thread.
            unsafe {
                if (*node).rc.load(Ordering::Acquire) == 0
                    && (*node)
                        .trace
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    && (*node).rc.load(Ordering::Acquire) != 0
                {
                    (*node).trace.store(false, Ordering::Release);
                }
            }
        }

        // Stage 2: all published hazards, sorted for the membership test.
        let mut hazards = self.domain.collect_hazards();
        hazards.sort_unstable();

        // Stage 3: free what the license allows, keep the rest.
        let mut disposed = 0usize;
        let mut deferred = 0usize;
        for slot in payload.retired.iter() {
            let node = slot.node.load(Ordering::Relaxed);
            if node.is_null() {
                continue;
            }
            // SAFETY: as above; all flag accesses target the live header.
            unsafe {
                let reclaimable = (*node).rc.load(Ordering::Acquire) == 0
                    && (*node).trace.load(Ordering::Acquire)
                    && hazards.binary_search(&(node as usize)).is_err();
                if reclaimable {
                    slot.node.store(ptr::null_mut(), Ordering::Relaxed);
                    if slot
                        .done
                        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        if slot.claim.load(Ordering::Acquire) == 0 {
                            ((*node).ops.terminate)(node, self, false);
                            ((*node).ops.dealloc)(node);
                            slot.done.store(false, Ordering::Release);
                            payload.count.fetch_sub(1, Ordering::Relaxed);
                            disposed += 1;
                            continue;
                        }
                        slot.done.store(false, Ordering::Release);
                    }
                    // A cleaner holds a claim: push the node back and let
                    // the next round retry.
                    (*node).trace.store(false, Ordering::Relaxed);
                    slot.node.store(node, Ordering::Release);
                    deferred += 1;
                } else {
                    (*node).trace.store(false, Ordering::Release);
                    deferred += 1;
                }
            }
        }
        debug!("hrc scan: disposed={} deferred={}", disposed, deferred);
        self.domain.events.disposed.fetch_add(disposed, Ordering::Relaxed);
        self.domain.events.deferred.fetch_add(deferred, Ordering::Relaxed);
    }

    /// Adopts parked nodes of detached threads into this thread's buffer,
    /// cleaning and scanning whenever it fills.
    pub fn help_scan(&self) {
        if self.rec.payload.is_full() {
            return;
        }
        self.domain.events.help_scans.fetch_add(1, Ordering::Relaxed);
        let me = current_thread_id();

        for other in self.domain.records.iter() {
            if other
                .owner
                .compare_exchange(FREE_OWNER, me, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            if !other.free.load(Ordering::Relaxed) {
                trace!("hrc help-scan adopting record {:p}", other);
                for slot in other.payload.retired.iter() {
                    let node = slot.node.load(Ordering::Relaxed);
                    if node.is_null() {
                        continue;
                    }
                    while self.rec.payload.is_full() {
                        self.clean_up_local();
                        self.scan();
                        if self.rec.payload.is_full() {
                            self.clean_up_all();
                            self.scan();
                        }
                    }
                    slot.node.store(ptr::null_mut(), Ordering::Relaxed);
                    slot.done.store(false, Ordering::Relaxed);
                    other.payload.count.fetch_sub(1, Ordering::Relaxed);
                    self.park(node);
                }
                other.free.store(true, Ordering::Relaxed);
            }
            other.owner.store(FREE_OWNER, Ordering::Release);
        }
    }

    /// Parked retired nodes of this thread.
    pub fn retired_len(&self) -> usize {
        self.rec.payload.count.load(Ordering::Relaxed)
    }
}

impl Drop for HrcLocal<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.rec.payload.in_use.load(Ordering::Relaxed),
            0,
            "detaching with live guards"
        );
        for slot in self.rec.payload.hazards.iter() {
            slot.store(0, Ordering::Release);
        }
        self.domain.records.release(self.rec);
    }
}

/// A scoped hazard slot of an HRC-attached thread.
pub struct HrcGuard<'l> {
    rec: &'l Record<HrcRecord>,
    index: usize,
}

impl HrcGuard<'_> {
    /// Publishes `node` without a validation loop. Only sound for nodes
    /// that cannot be retired concurrently.
    pub fn assign<N: HrcManaged>(&self, node: *mut N) {
        self.slot().store(node as usize, Ordering::SeqCst);
    }

    /// Clears the slot.
    pub fn clear(&self) {
        self.slot().store(0, Ordering::Release);
    }

    #[inline]
    fn slot(&self) -> &AtomicUsize {
        &self.rec.payload.hazards[self.index]
    }
}

impl Drop for HrcGuard<'_> {
    fn drop(&mut self) {
        self.slot().store(0, Ordering::Release);
        let mask = self.rec.payload.in_use.load(Ordering::Relaxed);
        self.rec
            .payload
            .in_use
            .store(mask & !(1 << self.index), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    /// Minimal managed node: header plus one marked link and a drop
    /// counter.
    #[repr(C)]
    struct Node {
        header: HrcHeader,
        next: AtomicMarkedPtr<Node, 2>,
        freed: Arc<StdAtomicUsize>,
    }

    unsafe impl HrcManaged for Node {}

    unsafe fn node_clean_up(node: *mut HrcHeader, local: &HrcLocal<'_>) {
        let node = node as *mut Node;
        let guard_a = local.guard();
        let guard_b = local.guard();
        loop {
            let next = local.deref_link(&guard_a, &(*node).next);
            if next.is_null() || !(*hdr(next.ptr())).is_deleted() {
                break;
            }
            let after = local.deref_link(&guard_b, &(*next.ptr()).next);
            let swung = local.cas_ref(
                &(*node).next,
                next,
                MarkedPtr::new(after.ptr(), next.tag()),
            );
            if !swung {
                break;
            }
        }
    }

    unsafe fn node_terminate(node: *mut HrcHeader, local: &HrcLocal<'_>, concurrent: bool) {
        let node = node as *mut Node;
        if concurrent {
            loop {
                let current = (*node).next.load(Ordering::Relaxed);
                if local.cas_ref(&(*node).next, current, MarkedPtr::null()) {
                    break;
                }
            }
        } else {
            local.store_ref(&(*node).next, MarkedPtr::null());
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

    fn new_node(freed: &Arc<StdAtomicUsize>) -> *mut Node {
        Box::into_raw(Box::new(Node {
            header: HrcHeader::new(&NODE_OPS),
            next: AtomicMarkedPtr::null(),
            freed: freed.clone(),
        }))
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.freed.fetch_add(1, Ordering::Release);
        }
    }

    #[test]
    fn store_ref_moves_counts() {
        let domain = HrcDomain::new(HrcConfig::default());
        let local = domain.attach();
        let freed = Arc::new(StdAtomicUsize::new(0));
        let a = new_node(&freed);
        let b = new_node(&freed);
        let link: AtomicMarkedPtr<Node, 2> = AtomicMarkedPtr::null();

        unsafe {
            local.store_ref(&link, MarkedPtr::new(a, 0));
            assert_eq!((*a).header.ref_count(), 1);

            local.store_ref(&link, MarkedPtr::new(b, 0));
            assert_eq!((*a).header.ref_count(), 0);
            assert_eq!((*b).header.ref_count(), 1);

            local.store_ref(&link, MarkedPtr::null());
            assert_eq!((*b).header.ref_count(), 0);

            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn retired_node_freed_once_count_drops() {
        let domain = HrcDomain::new(HrcConfig::default());
        let local = domain.attach();
        let freed = Arc::new(StdAtomicUsize::new(0));
        let node = new_node(&freed);
        let link: AtomicMarkedPtr<Node, 2> = AtomicMarkedPtr::null();

        unsafe {
            local.store_ref(&link, MarkedPtr::new(node, 0));
            // Unlink, then retire: rc back to zero.
            local.store_ref(&link, MarkedPtr::null());
            local.retire_node(node);
        }
        local.scan();
        assert_eq!(freed.load(Ordering::Acquire), 1);
        // Further scans must not double-free.
        local.scan();
        assert_eq!(freed.load(Ordering::Acquire), 1);
    }

    #[test]
    fn referenced_node_survives_scan() {
        let domain = HrcDomain::new(HrcConfig::default());
        let local = domain.attach();
        let freed = Arc::new(StdAtomicUsize::new(0));
        let node = new_node(&freed);
        let link: AtomicMarkedPtr<Node, 2> = AtomicMarkedPtr::null();

        unsafe {
            local.store_ref(&link, MarkedPtr::new(node, 0));
            local.retire_node(node);
        }
        local.scan();
        assert_eq!(freed.load(Ordering::Acquire), 0, "freed while rc == 1");

        unsafe { local.store_ref(&link, MarkedPtr::null()) };
        // First scan marks trace, second reclaims.
        local.scan();
        local.scan();
        assert_eq!(freed.load(Ordering::Acquire), 1);
    }
}
