//! Thread identity and the shared thread-record list.
//!
//! Both engines keep one record per attached thread on a prepend-only
//! lock-free list. Records are never freed while the domain lives; a
//! detaching thread clears its ownership and a later attach (from any
//! thread) reuses the record by CAS-ing the owner field.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use core::{fmt, ptr};
use log::trace;

/// Owner value of an unowned record.
pub(crate) const FREE_OWNER: usize = 0;

// ---------------------------------------------------------------------------
// Thread ids
// ---------------------------------------------------------------------------

// Dense nonzero ids, recycled at thread exit so owner tags and bag bit
// positions stay small regardless of how many threads the process ever ran.
//
// The pool has the same shape as the record list below: a prepend-only
// lock-free list of cells, each permanently bound to one id and claimed by
// CAS on its `free` flag. Cells are never deallocated, which keeps the pop
// path immune to ABA without needing reclamation of its own; the list is
// bounded by the peak number of concurrently retired ids.

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
static ID_POOL: AtomicPtr<IdCell> = AtomicPtr::new(ptr::null_mut());

struct IdCell {
    /// Set once before the cell is published, immutable afterwards.
    next: *mut IdCell,
    id: usize,
    free: AtomicBool,
}

fn acquire_thread_id() -> usize {
    // First try to reclaim a parked id.
    let mut cursor = ID_POOL.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: cells are never deallocated.
        let cell = unsafe { &*cursor };
        if cell
            .free
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            trace!("thread id {} reused", cell.id);
            return cell.id;
        }
        cursor = cell.next;
    }
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    trace!("thread id {} allocated", id);
    id
}

fn release_thread_id(id: usize) {
    trace!("thread id {} released", id);
    // An id released before already owns a cell; every cell published
    // for this id predates this walk, so a miss means first retirement.
    let mut cursor = ID_POOL.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: cells are never deallocated.
        let cell = unsafe { &*cursor };
        if cell.id == id {
            debug_assert!(!cell.free.load(Ordering::Relaxed));
            cell.free.store(true, Ordering::Release);
            return;
        }
        cursor = cell.next;
    }
    // First retirement of this id: park it in a fresh cell.
    let cell = Box::into_raw(Box::new(IdCell {
        next: ptr::null_mut(),
        id,
        free: AtomicBool::new(true),
    }));
    loop {
        let head = ID_POOL.load(Ordering::Acquire);
        // SAFETY: `cell` is ours until the CAS publishes it.
        unsafe { (*cell).next = head };
        if ID_POOL
            .compare_exchange_weak(head, cell, Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

struct ThreadIdGuard {
    id: usize,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        release_thread_id(self.id);
    }
}

thread_local! {
    static CURRENT: ThreadIdGuard = ThreadIdGuard {
        id: acquire_thread_id(),
    };
}

/// The calling thread's process-wide id (nonzero, dense, recycled).
pub(crate) fn current_thread_id() -> usize {
    CURRENT.with(|g| g.id)
}

// ---------------------------------------------------------------------------
// Record list
// ---------------------------------------------------------------------------

/// A per-thread record with engine-specific payload.
///
/// State machine: allocated -> attached(owner = T) -> free ->
/// attached(owner = T') -> ...
pub(crate) struct Record<P> {
    next: AtomicPtr<Record<P>>,
    /// Id of the owning thread, or [`FREE_OWNER`].
    pub(crate) owner: AtomicUsize,
    /// True once help-scan (or the destructor) has drained the record's
    /// retired entries; skipped by later help-scans until reattached.
    pub(crate) free: AtomicBool,
    pub(crate) payload: P,
}

impl<P> Record<P> {
    /// Next record in the list, null at the end.
    #[inline]
    pub(crate) fn next(&self) -> *mut Record<P> {
        self.next.load(Ordering::Acquire)
    }
}

/// Prepend-only lock-free list of [`Record`]s.
pub(crate) struct RecordList<P> {
    head: AtomicPtr<Record<P>>,
}

// SAFETY: records are reached only through atomic pointers and their
// payloads carry their own synchronization contracts.
unsafe impl<P: Send> Send for RecordList<P> {}
unsafe impl<P: Sync> Sync for RecordList<P> {}

impl<P> RecordList<P> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Attaches the calling thread: reuses a free record or allocates a
    /// new one. Returns true in the second tuple slot when the record was
    /// reused and may hold orphaned retired entries.
    pub(crate) fn acquire(&self, init: impl FnOnce() -> P) -> (&Record<P>, bool) {
        let me = current_thread_id();

        // First try to reuse a retired (non-active) record.
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: records live as long as the list.
            let rec = unsafe { &*cursor };
            if rec
                .owner
                .compare_exchange(FREE_OWNER, me, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                rec.free.store(false, Ordering::Release);
                trace!("thread {} reuses record {:p}", me, rec);
                return (rec, true);
            }
            cursor = rec.next();
        }

        // None available: allocate and push a new record.
        let new = Box::into_raw(Box::new(Record {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicUsize::new(me),
            free: AtomicBool::new(false),
            payload: init(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `new` is ours until the CAS publishes it.
            unsafe { (*new).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        trace!("thread {} allocated record {:p}", me, new);
        // SAFETY: published and never freed while the list lives.
        (unsafe { &*new }, false)
    }

    /// Detaches: the record goes back to the free pool for reuse. Retired
    /// entries left in the payload stay with the record.
    pub(crate) fn release(&self, rec: &Record<P>) {
        debug_assert_ne!(rec.owner.load(Ordering::Relaxed), FREE_OWNER);
        trace!("record {:p} released", rec);
        rec.owner.store(FREE_OWNER, Ordering::Release);
    }

    pub(crate) fn iter(&self) -> RecordIter<'_, P> {
        RecordIter {
            cursor: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }
}

impl<P> Drop for RecordList<P> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: exclusive access; every record was Box-allocated.
            let boxed = unsafe { Box::from_raw(cursor) };
            cursor = boxed.next.load(Ordering::Relaxed);
        }
    }
}

impl<P> fmt::Debug for RecordList<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordList({} records)", self.iter().count())
    }
}

pub(crate) struct RecordIter<'a, P> {
    cursor: *mut Record<P>,
    _marker: PhantomData<&'a RecordList<P>>,
}

impl<'a, P> Iterator for RecordIter<'a, P> {
    type Item = &'a Record<P>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        // SAFETY: records outlive the list borrow held by the iterator.
        let rec = unsafe { &*self.cursor };
        self.cursor = rec.next();
        Some(rec)
    }
}
