//! The Sundell concurrent bag.

use crate::layout::BlockLayout;
use crate::word::Word;
use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::Backoff;
use log::trace;
use petek::{AtomicMarkedPtr, HrcConfig, HrcDomain, HrcGuard, HrcHeader, HrcLocal, HrcManaged, HrcOps, MarkedPtr};

/// Tag bits on a block's `next` word.
const TAG_BITS: usize = 3;
/// This block is logically removed (head of the unlink cascade).
const TAG_REMOVED: usize = 1;
/// The successor block's removal is pending, set speculatively by a
/// stealing lap so a later walker completes the unlink.
const TAG_PENDING: usize = 2;

type BlockLink = AtomicMarkedPtr<Block, TAG_BITS>;

/// One cache-line-multiple of word slots, chained per producing thread.
///
/// HRC-managed: the header must stay the first field so a block pointer is
/// a valid header pointer.
#[repr(C)]
struct Block {
    header: HrcHeader,
    next: BlockLink,
    /// Sentinel means empty; anything else is a live value.
    slots: Box<[AtomicUsize]>,
    /// One bit per registered thread; consumers set their bit, producers
    /// clear the whole vector before publishing a value.
    notify_add: Box<[AtomicUsize]>,
}

unsafe impl HrcManaged for Block {}
// SAFETY: all fields are atomics (or boxes of atomics); cross-thread
// access follows the bag protocol.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn boxed(layout: BlockLayout, sentinel: usize) -> *mut Block {
        let block = Box::new(Block {
            header: HrcHeader::new(&BLOCK_OPS),
            next: BlockLink::null(),
            slots: (0..layout.slots_per_block)
                .map(|_| AtomicUsize::new(sentinel))
                .collect(),
            notify_add: (0..layout.notify_words)
                .map(|_| AtomicUsize::new(0))
                .collect(),
        });
        Box::into_raw(block)
    }

    /// Clears every thread's empty vote on this block.
    fn notify_all(&self) {
        for word in self.notify_add.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Records thread `id`'s empty vote.
    fn notify_start(&self, id: usize) {
        let bits = usize::BITS as usize;
        self.notify_add[id / bits].fetch_or(1 << (id % bits), Ordering::AcqRel);
    }

    /// True if thread `id`'s vote was cleared, i.e. a producer added to
    /// this block since the vote.
    fn notify_check(&self, id: usize) -> bool {
        let bits = usize::BITS as usize;
        self.notify_add[id / bits].load(Ordering::Acquire) & (1 << (id % bits)) == 0
    }
}

// HRC callbacks of a block.

unsafe fn block_clean_up(node: *mut HrcHeader, local: &HrcLocal<'_>) {
    let block = node as *mut Block;
    let guard_next = local.guard();
    let guard_after = local.guard();
    loop {
        // SAFETY: a node under clean-up stays valid, and its successors
        // are guarded below before use.
        unsafe {
            let next = local.deref_link(&guard_next, &(*block).next);
            if next.is_null() || !(*(next.ptr() as *mut HrcHeader)).is_deleted() {
                break;
            }
            let after = local.deref_link(&guard_after, &(*next.ptr()).next);
            // Swing past the deleted successor; our own tag bits travel
            // with the word, the successor's do not.
            local.cas_ref(&(*block).next, next, MarkedPtr::new(after.ptr(), next.tag()));
        }
    }
}

unsafe fn block_terminate(node: *mut HrcHeader, local: &HrcLocal<'_>, concurrent: bool) {
    let block = node as *mut Block;
    let dead_end = MarkedPtr::new(core::ptr::null_mut(), TAG_REMOVED);
    // SAFETY: terminate runs once, right before the free.
    unsafe {
        if concurrent {
            loop {
                let current = (*block).next.load(Ordering::Relaxed);
                if local.cas_ref(&(*block).next, current, dead_end) {
                    break;
                }
            }
        } else {
            local.store_ref(&(*block).next, dead_end);
        }
    }
}

unsafe fn block_dealloc(node: *mut HrcHeader) {
    // SAFETY: the engine frees each node exactly once.
    unsafe { drop(Box::from_raw(node as *mut Block)) };
}

static BLOCK_OPS: HrcOps = HrcOps {
    clean_up: block_clean_up,
    terminate: block_terminate,
    dealloc: block_dealloc,
};

/// One published head per registered thread. Each entry gets its own
/// cache line: index `t` is written by producer `t` on every block push,
/// while stealers hammer neighbouring indices.
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(target_arch = "aarch64", repr(align(128)))]
#[cfg_attr(
    not(any(target_arch = "s390x", target_arch = "aarch64")),
    repr(align(64))
)]
struct HeadSlot {
    link: BlockLink,
}

impl HeadSlot {
    fn empty() -> Self {
        Self {
            link: BlockLink::null(),
        }
    }
}

/// A lock-free unordered multiset of word-sized values.
///
/// Construction fixes the sentinel word and the number of registered
/// threads; each participating thread claims its index once through
/// [`init_thread`](SBag::init_thread) and works through the returned
/// handle. Values equal to the sentinel cannot be stored.
pub struct SBag<T: Word> {
    domain: HrcDomain,
    heads: Box<[HeadSlot]>,
    sentinel: usize,
    layout: BlockLayout,
    num_threads: usize,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Word> SBag<T> {
    /// Creates a bag for `num_threads` registered threads, with `sentinel`
    /// as the reserved empty-slot value and one cache line of slots per
    /// block.
    pub fn new(sentinel: T, num_threads: usize) -> Self {
        Self::with_block_multiplier(sentinel, num_threads, 1)
    }

    /// As [`new`](SBag::new), with blocks spanning `multiplier` cache
    /// lines of word slots.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` or `multiplier` is zero.
    pub fn with_block_multiplier(sentinel: T, num_threads: usize, multiplier: usize) -> Self {
        assert!(num_threads >= 1, "bag needs at least one registered thread");
        assert!(multiplier >= 1, "blocks need at least one cache line");
        Self {
            domain: HrcDomain::new(HrcConfig {
                max_threads: num_threads,
                ..HrcConfig::default()
            }),
            heads: (0..num_threads).map(|_| HeadSlot::empty()).collect(),
            sentinel: sentinel.into_word(),
            layout: BlockLayout::new(num_threads, multiplier),
            num_threads,
            _marker: PhantomData,
        }
    }

    /// Registers the calling thread under `index` and returns its handle.
    /// Must precede any bag operation by that thread; each index belongs
    /// to exactly one live handle at a time.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside `0..num_threads`.
    pub fn init_thread(&self, index: usize) -> BagThread<'_, T> {
        assert!(
            index < self.num_threads,
            "bag is configured for {} threads, got index {}",
            self.num_threads,
            index
        );
        let thread = BagThread {
            bag: self,
            local: self.domain.attach(),
            index,
            my_block: BlockLink::null(),
            my_head: Cell::new(self.layout.slots_per_block),
            steal_block: BlockLink::null(),
            steal_prev: BlockLink::null(),
            steal_head: Cell::new(self.layout.slots_per_block),
            steal_index: Cell::new(0),
            found_add: Cell::new(false),
        };
        // Adopt whatever this index published in an earlier registration.
        {
            let guard = thread.local.guard();
            let head = thread.local.deref_link(&guard, &self.heads[index].link);
            // SAFETY: `my_block` is a private single-writer link.
            unsafe { thread.local.store_ref(&thread.my_block, head.with_tag(0)) };
        }
        thread
    }

    /// The number of threads this bag was configured for.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Reclamation statistics of the embedded HRC domain.
    pub fn reclaim_stats(&self) -> petek::HrcDomainStats {
        self.domain.stats()
    }
}

impl<T: Word> Drop for SBag<T> {
    fn drop(&mut self) {
        // Exclusive access: free every block still linked from a head.
        // Retired blocks (deleted ones a chain may still reach) belong to
        // the domain, which disposes them when it drops right after.
        for head in self.heads.iter() {
            let mut cursor = head.link.load(Ordering::Relaxed).ptr();
            while !cursor.is_null() {
                // SAFETY: no threads are attached during drop.
                unsafe {
                    let next = (*cursor).next.load(Ordering::Relaxed).ptr();
                    if !(*cursor).header.is_deleted() {
                        drop(Box::from_raw(cursor));
                    }
                    cursor = next;
                }
            }
        }
    }
}

impl<T: Word> core::fmt::Debug for SBag<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SBag(threads={}, block_slots={})",
            self.num_threads, self.layout.slots_per_block
        )
    }
}

/// A thread's registration with an [`SBag`].
///
/// Holds the thread's block cursor and stealing state. Dropping the handle
/// releases the per-thread state; the thread's published values stay in
/// the bag for others to steal.
pub struct BagThread<'b, T: Word> {
    bag: &'b SBag<T>,
    local: HrcLocal<'b>,
    index: usize,
    /// Counted reference to the thread's newest block.
    my_block: BlockLink,
    my_head: Cell<usize>,
    /// Counted references into the current steal victim's list.
    steal_block: BlockLink,
    steal_prev: BlockLink,
    steal_head: Cell<usize>,
    steal_index: Cell<usize>,
    found_add: Cell<bool>,
}

impl<T: Word> BagThread<'_, T> {
    /// Adds `value` to the bag. Never fails; allocates a new block when
    /// the thread's current one is full.
    ///
    /// # Panics
    ///
    /// Panics if `value` equals the bag's sentinel.
    pub fn add(&self, value: T) {
        let word = value.into_word();
        assert_ne!(word, self.bag.sentinel, "value collides with the bag sentinel");

        let mut head = self.my_head.get();
        loop {
            let block = self.my_block.load(Ordering::Relaxed).ptr();
            if block.is_null() || head == self.bag.layout.slots_per_block {
                self.push_new_block();
                head = 0;
                continue;
            }
            // SAFETY: `my_block` holds a counted reference.
            let slot = unsafe { &(*block).slots[head] };
            if slot.load(Ordering::Acquire) == self.bag.sentinel {
                // Invalidate concurrent emptiness votes before the value
                // becomes visible.
                unsafe { (*block).notify_all() };
                slot.store(word, Ordering::Release);
                self.my_head.set(head + 1);
                return;
            }
            // A stealer restored a value here in the meantime; skip it.
            head += 1;
        }
    }

    /// Removes some value from the bag. Returns false only when the bag
    /// was provably empty at some moment between invocation and return.
    pub fn try_remove_any(&self, out: &mut T) -> bool {
        let backoff = Backoff::new();
        let mut head = self.my_head.get() as isize - 1;
        let mut round = 0usize;

        loop {
            let block = self.my_block.load(Ordering::Relaxed).ptr();
            // SAFETY: `my_block` holds a counted reference.
            let exhausted = block.is_null()
                || (head < 0 && unsafe { (*block).next.load(Ordering::Acquire).is_null() });

            if exhausted {
                // Local list is dry: steal. `round` counts whole passes
                // over every victim; round 1 places empty votes, later
                // rounds check them. A cleared vote means a producer got
                // in, so the count restarts.
                loop {
                    let mut visited = 0;
                    while visited < self.bag.num_threads {
                        if self.try_steal_block(round, out) {
                            return true;
                        }
                        if self.found_add.get() {
                            round = 0;
                            visited = 0;
                        } else if self.steal_block.load(Ordering::Relaxed).is_null() {
                            visited += 1;
                        }
                    }
                    round += 1;
                    if round > self.bag.num_threads {
                        return false;
                    }
                }
            }

            if head < 0 {
                // The local block is drained but has a successor: retire
                // it and move the cursor down the list.
                self.advance_my_block(block);
                head = self.bag.layout.slots_per_block as isize - 1;
                continue;
            }

            let at = head as usize;
            // SAFETY: as above.
            let slot = unsafe { &(*block).slots[at] };
            let word = slot.load(Ordering::Acquire);
            if word == self.bag.sentinel {
                head -= 1;
            } else if slot
                .compare_exchange(word, self.bag.sentinel, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.my_head.set(at);
                *out = T::from_word(word);
                return true;
            } else {
                backoff.spin();
            }
        }
    }

    /// Allocates a block, links it in front of the current one and
    /// publishes it as this thread's head.
    fn push_new_block(&self) {
        let block = Block::boxed(self.bag.layout, self.bag.sentinel);
        trace!("thread {} pushes block {:p}", self.index, block);
        let old = self.my_block.load(Ordering::Relaxed);
        // SAFETY: `block` is fresh and `my_block` is single-writer; the
        // head position accepts racing unlink CASes by design (the
        // overwritten unlink leaves an empty removed block linked, which
        // a later walk removes).
        unsafe {
            self.local.store_ref(&(*block).next, MarkedPtr::new(old.ptr(), 0));
            self.local
                .store_ref(&self.bag.heads[self.index].link, MarkedPtr::new(block, 0));
            self.local.store_ref(&self.my_block, MarkedPtr::new(block, 0));
        }
        self.my_head.set(0);
    }

    /// Retires the drained `block` (and any already-removed successors)
    /// and points `my_block` at the surviving successor.
    fn advance_my_block(&self, block: *mut Block) {
        let heads_link = &self.bag.heads[self.index].link;
        let guard_head = self.local.guard();
        let guard_next = self.local.guard();

        // SAFETY: the walk keeps each dereferenced block protected by a
        // counted reference (heads / my_block / predecessor link) or a
        // guard; see the per-step comments.
        unsafe {
            self.mark_removed(block);
            let mut cursor = block;
            loop {
                let next = self.local.deref_link(&guard_next, &(*cursor).next);
                if next.is_marked(TAG_PENDING) && !next.is_null() {
                    self.mark_removed(next.ptr());
                }
                if !next.is_marked(TAG_REMOVED) {
                    break;
                }
                // `cursor` is marked removed: unlink it from the head.
                if !next.is_null() {
                    (*next.ptr()).notify_all();
                }
                if self.local.cas_ref(
                    heads_link,
                    MarkedPtr::new(cursor, 0),
                    MarkedPtr::new(next.ptr(), 0),
                ) {
                    self.local.retire_node(cursor);
                    cursor = next.ptr();
                } else {
                    // A stealer moved the head; restart from its value.
                    cursor = self.local.deref_link(&guard_head, heads_link).ptr();
                }
                if cursor.is_null() {
                    break;
                }
            }
            self.local.store_ref(&self.my_block, MarkedPtr::new(cursor, 0));
        }
        self.my_head.set(self.bag.layout.slots_per_block);
    }

    /// One stealing step: scan the current steal block for a value,
    /// advancing through the victim's list and rotating victims as blocks
    /// run dry.
    fn try_steal_block(&self, round: usize, out: &mut T) -> bool {
        let mut head = self.steal_head.get();
        self.found_add.set(false);

        let guard_block = self.local.guard();
        let guard_next = self.local.guard();

        // SAFETY: `steal_block`/`steal_prev` are counted references and
        // every transient pointer is guarded before use.
        unsafe {
            let mut block = self.local.deref_link(&guard_block, &self.steal_block).ptr();

            if block.is_null() {
                let victim = &self.bag.heads[self.steal_index.get()].link;
                block = self.local.deref_link(&guard_block, victim).ptr();
                self.local.store_ref(&self.steal_block, MarkedPtr::new(block, 0));
                self.steal_head.set(0);
                head = 0;
            }

            if head == self.bag.layout.slots_per_block {
                block = self.next_steal_block(block, [&guard_block, &guard_next]);
                self.local.store_ref(&self.steal_block, MarkedPtr::new(block, 0));
                head = 0;
            }

            if block.is_null() {
                // Victim exhausted: rotate.
                self.steal_index
                    .set((self.steal_index.get() + 1) % self.bag.num_threads);
                self.steal_head.set(0);
                self.local.store_ref(&self.steal_block, MarkedPtr::null());
                self.local.store_ref(&self.steal_prev, MarkedPtr::null());
                return false;
            }

            if round == 1 {
                (*block).notify_start(self.index);
            } else if round > 1 && (*block).notify_check(self.index) {
                self.found_add.set(true);
            }

            let backoff = Backoff::new();
            loop {
                if head == self.bag.layout.slots_per_block {
                    self.steal_head.set(head);
                    return false;
                }
                let slot = &(*block).slots[head];
                let word = slot.load(Ordering::Acquire);
                if word == self.bag.sentinel {
                    head += 1;
                } else if slot
                    .compare_exchange(word, self.bag.sentinel, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    self.steal_head.set(head);
                    *out = T::from_word(word);
                    return true;
                } else {
                    backoff.spin();
                }
            }
        }
    }

    /// Walks the victim's list one step past `block`, helping complete
    /// pending unlinks along the way. Returns null at the end of the
    /// list, and stops early when the walk laps back to the current
    /// steal block.
    ///
    /// # Safety
    ///
    /// `block` must be protected by `guards[0]` or a counted reference.
    unsafe fn next_steal_block(&self, mut block: *mut Block, guards: [&HrcGuard<'_>; 2]) -> *mut Block {
        let victim = &self.bag.heads[self.steal_index.get()].link;
        // guards[covering] protects `block`; the other slot takes the
        // successor, and the roles swap as the walk advances.
        let mut covering = 0;

        // SAFETY: see the per-step comments; every dereference happens
        // under a guard or a counted reference.
        unsafe {
            loop {
                if block.is_null() {
                    return self.local.deref_link(guards[covering], victim).ptr();
                }

                let next = self.local.deref_link(guards[1 - covering], &(*block).next);
                if next.is_marked(TAG_PENDING) && !next.is_null() {
                    self.mark_removed(next.ptr());
                }

                let prev = self.steal_prev.load(Ordering::Relaxed).ptr();
                if prev.is_null() || next.is_null() {
                    if next.is_marked(TAG_REMOVED) {
                        // `block` should be the victim's head: unlink it there.
                        if !next.is_null() {
                            (*next.ptr()).notify_all();
                        }
                        if self.local.cas_ref(
                            victim,
                            MarkedPtr::new(block, 0),
                            MarkedPtr::new(next.ptr(), 0),
                        ) {
                            self.local.retire_node(block);
                        } else {
                            self.local.store_ref(&self.steal_prev, MarkedPtr::null());
                            block = self.local.deref_link(guards[covering], victim).ptr();
                            continue;
                        }
                    } else {
                        self.local.store_ref(&self.steal_prev, MarkedPtr::new(block, 0));
                    }
                } else if next.is_marked(TAG_REMOVED) {
                    // Unlink `block` through its predecessor. The expected
                    // word must be unmarked-removed (a removed predecessor
                    // fails the CAS and forces a restart); the pending bit
                    // describing the pointee travels to the new word.
                    let prev_pending = (*prev).next.load(Ordering::Relaxed).tag() & TAG_PENDING;
                    let swung = self.local.cas_ref(
                        &(*prev).next,
                        MarkedPtr::new(block, prev_pending),
                        MarkedPtr::new(next.ptr(), next.tag() & TAG_PENDING),
                    );
                    if swung {
                        self.local.retire_node(block);
                    } else {
                        self.local.store_ref(&self.steal_prev, MarkedPtr::null());
                        block = self.local.deref_link(guards[covering], victim).ptr();
                        continue;
                    }
                } else if core::ptr::eq(block, self.steal_block.load(Ordering::Relaxed).ptr()) {
                    // Lapped the list back to our own steal block: tag it
                    // as pending through the predecessor, then mark it so
                    // the next iteration unlinks it.
                    if self.local.cas_ref(
                        &(*prev).next,
                        MarkedPtr::new(block, 0),
                        MarkedPtr::new(block, TAG_PENDING),
                    ) {
                        self.mark_removed(block);
                        continue;
                    } else {
                        self.local.store_ref(&self.steal_prev, MarkedPtr::null());
                        block = self.local.deref_link(guards[covering], victim).ptr();
                        continue;
                    }
                } else {
                    self.local.store_ref(&self.steal_prev, MarkedPtr::new(block, 0));
                }

                let steal_block = self.steal_block.load(Ordering::Relaxed).ptr();
                if core::ptr::eq(block, steal_block) || core::ptr::eq(next.ptr(), steal_block) {
                    return next.ptr();
                }
                block = next.ptr();
                covering = 1 - covering;
            }
        }
    }

    /// Marks `block` as logically removed: sets the removed tag on its
    /// own `next` word, preserving a pending tag. Skipped for the last
    /// block of a list (null successor).
    ///
    /// The tag flip does not move the pointer, so reference counts are
    /// untouched and a plain CAS suffices.
    unsafe fn mark_removed(&self, block: *mut Block) {
        // SAFETY: the caller protects `block`.
        unsafe {
            loop {
                let next = (*block).next.load(Ordering::Relaxed);
                if next.is_null() || next.is_marked(TAG_REMOVED) {
                    break;
                }
                let marked = MarkedPtr::new(next.ptr(), TAG_REMOVED | (next.tag() & TAG_PENDING));
                if (*block)
                    .next
                    .compare_exchange(next, marked, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }
}

impl<T: Word> Drop for BagThread<'_, T> {
    fn drop(&mut self) {
        // SAFETY: private single-writer links; dropping the counted
        // references lets the blocks reach rc == 0 once unlinked.
        unsafe {
            self.local.store_ref(&self.my_block, MarkedPtr::null());
            self.local.store_ref(&self.steal_block, MarkedPtr::null());
            self.local.store_ref(&self.steal_prev, MarkedPtr::null());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_votes_round_trip() {
        let layout = BlockLayout::new(3, 1);
        let block = Block::boxed(layout, usize::MAX);
        // SAFETY: fresh block, single-threaded test.
        unsafe {
            assert!((*block).notify_check(3), "no vote placed yet");
            (*block).notify_start(3);
            assert!(!(*block).notify_check(3));
            (*block).notify_all();
            assert!((*block).notify_check(3), "vote cleared by a producer");
            drop(Box::from_raw(block));
        }
    }

    #[test]
    fn single_thread_round_trip() {
        let bag: SBag<usize> = SBag::new(usize::MAX, 1);
        let handle = bag.init_thread(0);
        for i in 0..100 {
            handle.add(i);
        }
        let mut seen = [false; 100];
        let mut out = 0usize;
        while handle.try_remove_any(&mut out) {
            assert!(!seen[out], "value {} returned twice", out);
            seen[out] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn removal_crosses_block_boundaries() {
        let bag: SBag<usize> = SBag::new(usize::MAX, 1);
        let handle = bag.init_thread(0);
        // Several blocks' worth of values.
        let total = bag.layout.slots_per_block * 5 + 3;
        for i in 0..total {
            handle.add(i);
        }
        let mut out = 0usize;
        let mut count = 0;
        while handle.try_remove_any(&mut out) {
            count += 1;
        }
        assert_eq!(count, total);
    }

    #[test]
    #[should_panic(expected = "collides with the bag sentinel")]
    fn adding_the_sentinel_is_rejected() {
        let bag: SBag<usize> = SBag::new(usize::MAX, 1);
        let handle = bag.init_thread(0);
        handle.add(usize::MAX);
    }

    #[test]
    #[should_panic(expected = "configured for 2 threads")]
    fn out_of_range_index_is_rejected() {
        let bag: SBag<usize> = SBag::new(usize::MAX, 2);
        let _ = bag.init_thread(2);
    }
}
