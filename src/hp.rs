//! The hazard-pointer reclamation engine.
//!
//! A thread attaches to an [`HpDomain`] and receives a record holding a
//! fixed array of hazard slots plus a bounded retired buffer. Guards
//! publish pointers into the slots; [`HpLocal::retire`] parks logically
//! deleted pointers, and a scan pass disposes every parked pointer absent
//! from all published hazards. A thread may detach with undrained retired
//! entries; they are adopted by the next attach or by help-scan.

use crate::config::{HpConfig, ScanType};
use crate::registry::{current_thread_id, Record, RecordList, FREE_OWNER};
use crate::retired::{Disposer, RetiredPtr, RetiredVec};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use log::{debug, trace};

/// Per-thread engine state hanging off a registry record.
pub(crate) struct HpRecord {
    /// Published hazards; null at rest. Single-writer (the owner),
    /// multi-reader (scanning threads).
    hazards: Box<[AtomicUsize]>,
    /// Bitmask of slots held by live guards. Owner-only.
    in_use: AtomicUsize,
    /// Owner-only; ownership moves wholesale through the owner CAS.
    retired: UnsafeCell<RetiredVec>,
}

// SAFETY: `retired` is only touched by the record's current owner, and
// ownership is transferred through acquire/release on the owner field.
unsafe impl Sync for HpRecord {}

impl HpRecord {
    fn new(config: &HpConfig) -> Self {
        let hazards = (0..config.hazard_pointers_per_thread)
            .map(|_| AtomicUsize::new(0))
            .collect();
        Self {
            hazards,
            in_use: AtomicUsize::new(0),
            retired: UnsafeCell::new(RetiredVec::with_capacity(config.retired_capacity())),
        }
    }
}

/// Event counters of a domain.
#[derive(Default)]
struct HpEvents {
    records_allocated: AtomicUsize,
    records_reused: AtomicUsize,
    scans: AtomicUsize,
    help_scans: AtomicUsize,
    disposed: AtomicUsize,
    deferred: AtomicUsize,
}

/// Snapshot of a domain's event counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HpDomainStats {
    /// Records allocated (first attach of a fresh slot in the list).
    pub records_allocated: usize,
    /// Attaches that reused a previously released record.
    pub records_reused: usize,
    /// Scan passes run.
    pub scans: usize,
    /// Help-scan passes run.
    pub help_scans: usize,
    /// Retired pointers disposed.
    pub disposed: usize,
    /// Retired pointers kept because a hazard still published them.
    pub deferred: usize,
}

/// A hazard-pointer reclamation domain.
///
/// Containers share one domain; each participating thread calls
/// [`attach`](HpDomain::attach) once and works through the returned
/// [`HpLocal`].
pub struct HpDomain {
    records: RecordList<HpRecord>,
    config: HpConfig,
    events: HpEvents,
}

impl HpDomain {
    /// Creates a domain.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent (zero hazard slots, or
    /// more slots than a machine word has bits).
    pub fn new(config: HpConfig) -> Self {
        config.validate();
        Self {
            records: RecordList::new(),
            config,
            events: HpEvents::default(),
        }
    }

    /// Attaches the calling thread and returns its engine handle.
    ///
    /// Reuses a released record when one exists. A reused record may still
    /// hold retired entries its previous owner left behind; those are
    /// scanned immediately so an attach/detach/attach cycle leaves nothing
    /// parked.
    pub fn attach(&self) -> HpLocal<'_> {
        let (rec, reused) = self.records.acquire(|| HpRecord::new(&self.config));
        if reused {
            self.events.records_reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events.records_allocated.fetch_add(1, Ordering::Relaxed);
        }
        let local = HpLocal { domain: self, rec };
        // SAFETY: we own the record.
        if reused && !unsafe { &*rec.payload.retired.get() }.is_empty() {
            self.scan(rec);
        }
        local
    }

    /// Number of hazard slots each attached thread owns.
    pub fn hazard_pointers_per_thread(&self) -> usize {
        self.config.hazard_pointers_per_thread
    }

    /// Snapshot of the domain's event counters.
    pub fn stats(&self) -> HpDomainStats {
        HpDomainStats {
            records_allocated: self.events.records_allocated.load(Ordering::Relaxed),
            records_reused: self.events.records_reused.load(Ordering::Relaxed),
            scans: self.events.scans.load(Ordering::Relaxed),
            help_scans: self.events.help_scans.load(Ordering::Relaxed),
            disposed: self.events.disposed.load(Ordering::Relaxed),
            deferred: self.events.deferred.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------

    /// Reclaims every pointer in `rec`'s retired buffer that no thread
    /// currently publishes. The caller must own `rec`.
    fn scan(&self, rec: &Record<HpRecord>) {
        self.events.scans.fetch_add(1, Ordering::Relaxed);
        match self.config.scan_type {
            ScanType::Classic => self.classic_scan(rec),
            ScanType::InPlace => self.inplace_scan(rec),
        }
    }

    /// Collects all published hazards into a sorted set, then walks the
    /// retired buffer disposing non-members.
    fn classic_scan(&self, rec: &Record<HpRecord>) {
        let mut hazards = self.collect_hazards();
        hazards.sort_unstable();

        // SAFETY: the caller owns `rec`.
        let retired = unsafe { &mut *rec.payload.retired.get() };
        let items = core::mem::replace(
            &mut retired.items,
            Vec::with_capacity(self.config.retired_capacity()),
        );
        let mut disposed = 0usize;
        let mut deferred = 0usize;
        for entry in items {
            if hazards.binary_search(&entry.raw_addr()).is_ok() {
                retired.items.push(entry);
                deferred += 1;
            } else {
                // SAFETY: no hazard slot publishes this address, so the
                // disposer can run exactly once.
                unsafe { entry.dispose() };
                disposed += 1;
            }
        }
        self.note_scan_result(disposed, deferred);
    }

    /// Sorts the retired buffer in place, marks hazarded entries through
    /// the address LSB while walking the hazard slots, then compacts the
    /// kept entries to the front.
    fn inplace_scan(&self, rec: &Record<HpRecord>) {
        // SAFETY: the caller owns `rec`.
        let retired = unsafe { &mut *rec.payload.retired.get() };
        if retired.is_empty() {
            return;
        }

        // The LSB is only usable as a mark if every retired address has it
        // clear; otherwise fall back to the classic algorithm.
        if retired.items.iter().any(|r| r.is_marked()) {
            return self.classic_scan(rec);
        }

        retired.items.sort_unstable_by_key(|r| r.addr());

        for other in self.records.iter() {
            for slot in other.payload.hazards.iter() {
                let hazard = slot.load(Ordering::Acquire);
                if hazard == 0 {
                    continue;
                }
                if let Ok(at) = retired.items.binary_search_by_key(&hazard, |r| r.addr()) {
                    retired.items[at].mark();
                }
            }
        }

        let mut kept = 0usize;
        let mut disposed = 0usize;
        for i in 0..retired.items.len() {
            let mut entry = retired.items[i];
            if entry.is_marked() {
                entry.unmark();
                retired.items[kept] = entry;
                kept += 1;
            } else {
                // SAFETY: unmarked entries were absent from every hazard
                // slot during the walk above.
                unsafe { entry.dispose() };
                disposed += 1;
            }
        }
        retired.items.truncate(kept);
        self.note_scan_result(disposed, kept);
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

    fn note_scan_result(&self, disposed: usize, deferred: usize) {
        debug!("hp scan: disposed={} deferred={}", disposed, deferred);
        self.events.disposed.fetch_add(disposed, Ordering::Relaxed);
        self.events.deferred.fetch_add(deferred, Ordering::Relaxed);
    }

    /// Adopts retired entries from records whose owner detached, moving
    /// them into `rec`'s buffer and scanning whenever it fills.
    fn help_scan(&self, rec: &Record<HpRecord>) {
        self.events.help_scans.fetch_add(1, Ordering::Relaxed);
        let me = current_thread_id();
        for other in self.records.iter() {
            // Records marked free were already drained.
            if other.free.load(Ordering::Relaxed) {
                continue;
            }
            // Own the orphan; concurrent helpers race on this CAS. Our own
            // record never matches since its owner is `me`, not FREE.
            if other
                .owner
                .compare_exchange(FREE_OWNER, me, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            trace!("help-scan adopting record {:p}", other);
            // SAFETY: we own the orphan now; move its entries out before
            // touching our own buffer so no two borrows overlap a scan.
            let orphaned: Vec<RetiredPtr> = {
                let src = unsafe { &mut *other.payload.retired.get() };
                src.items.drain(..).collect()
            };
            for entry in orphaned {
                let full = {
                    // SAFETY: we own `rec`.
                    let dest = unsafe { &mut *rec.payload.retired.get() };
                    dest.push(entry);
                    dest.is_full()
                };
                if full {
                    self.scan(rec);
                }
            }

            other.free.store(true, Ordering::Relaxed);
            other.owner.store(FREE_OWNER, Ordering::Release);
        }
    }
}

impl Drop for HpDomain {
    fn drop(&mut self) {
        // No local handles can exist here (they borrow the domain), so
        // every remaining retired pointer is unreachable and unguarded.
        for rec in self.records.iter() {
            let retired = unsafe { &mut *rec.payload.retired.get() };
            for entry in retired.items.drain(..) {
                // SAFETY: see above.
                unsafe { entry.dispose() };
            }
        }
    }
}

impl core::fmt::Debug for HpDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HpDomain({:?})", self.stats())
    }
}

/// One thread's attachment to an [`HpDomain`].
///
/// Dropping the handle detaches the thread: hazard slots are cleared and
/// the record returns to the reuse pool. Retired entries that have not
/// been scanned yet stay with the record for adoption.
pub struct HpLocal<'d> {
    domain: &'d HpDomain,
    rec: &'d Record<HpRecord>,
}

impl<'d> HpLocal<'d> {
    /// Acquires a free hazard slot wrapped in an RAII guard.
    ///
    /// # Panics
    ///
    /// Panics when all configured slots are in use, which indicates a
    /// container holding more simultaneous guards than it declared.
    pub fn guard(&self) -> HpGuard<'_> {
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
        HpGuard { rec: self.rec, index }
    }

    /// Retires `ptr`, to be freed as `Box<T>` once no hazard publishes it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`, be logically unreachable for
    /// new readers, and must not be retired twice.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        unsafe fn drop_boxed<T>(addr: *mut u8) {
            // SAFETY: `addr` was produced by `Box::into_raw::<T>`.
            unsafe { drop(Box::from_raw(addr as *mut T)) };
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.retire_with(ptr as *mut u8, drop_boxed::<T>) };
    }

    /// Retires an address with an explicit disposer.
    ///
    /// When the buffer reaches capacity a scan runs; if the scan could not
    /// free anything (every entry still hazarded) a help-scan follows.
    ///
    /// # Safety
    ///
    /// The address must be logically unreachable for new readers, retired
    /// only once, and valid until the disposer runs. The disposer must not
    /// unwind.
    pub unsafe fn retire_with(&self, addr: *mut u8, disposer: Disposer) {
        // The borrow of the retired buffer must end before scan re-borrows
        // it through the record.
        let full = {
            // SAFETY: we own the record.
            let retired = unsafe { &mut *self.rec.payload.retired.get() };
            retired.push(RetiredPtr::new(addr, disposer));
            retired.is_full()
        };
        if full {
            self.domain.scan(self.rec);
            // SAFETY: as above.
            let still_full = unsafe { &*self.rec.payload.retired.get() }.is_full();
            if still_full {
                self.domain.help_scan(self.rec);
            }
        }
    }

    /// Forces a scan of this thread's retired buffer.
    pub fn scan(&self) {
        self.domain.scan(self.rec);
    }

    /// Adopts retired entries of detached threads into this thread's
    /// buffer, scanning as it fills. Runs automatically when a scan makes
    /// no progress; exposed so callers can drain orphans eagerly.
    pub fn help_scan(&self) {
        self.domain.help_scan(self.rec);
    }

    /// Retired entries currently parked by this thread.
    pub fn retired_len(&self) -> usize {
        // SAFETY: we own the record.
        unsafe { &*self.rec.payload.retired.get() }.len()
    }
}

impl Drop for HpLocal<'_> {
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

/// A scoped hazard slot.
///
/// While the guard holds a pointer, no scan completing afterwards will
/// dispose of it. Dropping the guard clears the slot and returns it to
/// the owning thread.
pub struct HpGuard<'l> {
    rec: &'l Record<HpRecord>,
    index: usize,
}

impl HpGuard<'_> {
    /// Loads from `link` and publishes the result, retrying until the
    /// published value re-reads stable. Returns the protected pointer
    /// (possibly null).
    pub fn protect<T>(&self, link: &AtomicPtr<T>) -> *mut T {
        let mut ptr = link.load(Ordering::Relaxed);
        loop {
            self.slot().store(ptr as usize, Ordering::SeqCst);
            let reread = link.load(Ordering::Acquire);
            if reread == ptr {
                return ptr;
            }
            ptr = reread;
        }
    }

    /// Publishes `ptr` without a validation loop. Only sound for pointers
    /// that cannot be retired concurrently (e.g. freshly allocated ones).
    pub fn assign<T>(&self, ptr: *mut T) {
        self.slot().store(ptr as usize, Ordering::SeqCst);
    }

    /// Clears the slot; the previously protected pointer may be reclaimed
    /// by the next scan.
    pub fn clear(&self) {
        self.slot().store(0, Ordering::Release);
    }

    /// The currently published address, null when clear.
    pub fn get(&self) -> *mut u8 {
        self.slot().load(Ordering::Relaxed) as *mut u8
    }

    #[inline]
    fn slot(&self) -> &AtomicUsize {
        &self.rec.payload.hazards[self.index]
    }
}

impl Drop for HpGuard<'_> {
    fn drop(&mut self) {
        self.slot().store(0, Ordering::Release);
        let mask = self.rec.payload.in_use.load(Ordering::Relaxed);
        self.rec
            .payload
            .in_use
            .store(mask & !(1 << self.index), Ordering::Relaxed);
    }
}
