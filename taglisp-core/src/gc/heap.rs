//! Word arena with an in-place free list and a mark-and-sweep collector.

use std::collections::BTreeMap;

use super::types::{unpack_count, Block, BlockKind, HEADER_WORDS};
use crate::value::{Addr, LVal, Tag, Word, WORD_SIZE};

/// First allocatable address. The two words below it are permanently
/// reserved so that address 0 can terminate the free list and never names
/// an object.
const ARENA_BASE: Addr = 2 * WORD_SIZE;

/// The object arena.
///
/// Free blocks are threaded through the arena itself: word 0 of a free
/// block holds the untagged address of the next free block (0 terminates),
/// word 1 holds the block size in words, link words included. A side block
/// table records every live allocation, and a side bitmap holds the mark
/// bits; object payload is never touched by collector bookkeeping.
pub struct Heap {
    words: Vec<Word>,
    /// Address of the first free block, 0 when the list is empty.
    free_head: Addr,
    /// Live allocations: base address to size and kind.
    blocks: BTreeMap<Addr, Block>,
    /// One mark bit per arena word; only block base words are ever set.
    marks: Vec<u64>,
    collections: usize,
}

impl Heap {
    /// Create an arena of `arena_words` words holding a single free block.
    pub fn new(arena_words: usize) -> Self {
        let arena_words = arena_words & !1;
        assert!(
            arena_words >= 2 * (ARENA_BASE / WORD_SIZE),
            "arena of {} words is too small",
            arena_words
        );
        let mut heap = Heap {
            words: vec![0; arena_words],
            free_head: ARENA_BASE,
            blocks: BTreeMap::new(),
            marks: vec![0; arena_words.div_ceil(64)],
            collections: 0,
        };
        heap.set_word(ARENA_BASE, 0, 0);
        heap.set_word(ARENA_BASE, 1, (arena_words - ARENA_BASE / WORD_SIZE) as Word);
        heap
    }

    // -----------------------------------------------------------------------
    // Word and byte access
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn word(&self, addr: Addr, offset: usize) -> Word {
        self.words[addr / WORD_SIZE + offset]
    }

    #[inline]
    pub(crate) fn set_word(&mut self, addr: Addr, offset: usize, w: Word) {
        self.words[addr / WORD_SIZE + offset] = w;
    }

    /// Read the byte at absolute byte address `at`.
    #[inline]
    pub(crate) fn byte(&self, at: usize) -> u8 {
        let w = self.words[at / WORD_SIZE] as u64;
        (w >> ((at % WORD_SIZE) * 8)) as u8
    }

    /// Write the byte at absolute byte address `at`.
    #[inline]
    pub(crate) fn set_byte(&mut self, at: usize, b: u8) {
        let shift = (at % WORD_SIZE) * 8;
        let w = self.words[at / WORD_SIZE] as u64;
        self.words[at / WORD_SIZE] = ((w & !(0xffu64 << shift)) | ((b as u64) << shift)) as Word;
    }

    /// Assert that `addr` names a live block of the expected kind. Catches
    /// dereferences through stale or fabricated references.
    #[inline]
    pub(crate) fn expect_block(&self, addr: Addr, kind: BlockKind) {
        let block = self.blocks.get(&addr);
        assert!(
            block.is_some_and(|b| b.kind == kind),
            "invalid or stale heap address {:#x} (expected {:?})",
            addr,
            kind
        );
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Raw arena allocation of `n` words, recorded as an untyped block.
    /// Returns `None` when no free block fits; that is not an error.
    pub fn allocate(&mut self, n: usize) -> Option<Addr> {
        self.alloc_block(n, BlockKind::Raw)
    }

    /// First-fit allocation. Rounds `n` up to an even word count. An exact
    /// fit unlinks the free block; a larger block is shrunk in place and the
    /// upper `n` words of its tail are returned, so the block's own link and
    /// size words stay valid at their original address.
    pub(crate) fn alloc_block(&mut self, n: usize, kind: BlockKind) -> Option<Addr> {
        assert!(n > 0, "zero-size allocation");
        let n = (n + 1) & !1;
        let mut m = self.free_head;
        let mut prev: Addr = 0;
        while m != 0 {
            let next = self.word(m, 0) as Addr;
            let size = self.word(m, 1) as usize;
            if n <= size {
                let addr = if size == n {
                    if prev == 0 {
                        self.free_head = next;
                    } else {
                        self.set_word(prev, 0, next as Word);
                    }
                    m
                } else {
                    self.set_word(m, 1, (size - n) as Word);
                    m + (size - n) * WORD_SIZE
                };
                for i in 0..n {
                    self.set_word(addr, i, 0);
                }
                self.blocks.insert(addr, Block { words: n, kind });
                return Some(addr);
            }
            prev = m;
            m = next;
        }
        None
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Run one full collection cycle. `roots` must yield every value that
    /// has to survive; anything unreachable from them is returned to the
    /// free list. Collection itself cannot fail; reclaiming nothing is a
    /// legal outcome when every block is live.
    pub fn collect(&mut self, roots: impl Iterator<Item = LVal>) {
        log::debug!("gc: collecting, {} blocks live", self.blocks.len());

        // Reset free-list bookkeeping. Free blocks hold no live data, so
        // clearing their link and size words is safe.
        let mut m = self.free_head;
        while m != 0 {
            let next = self.word(m, 0) as Addr;
            self.set_word(m, 0, 0);
            self.set_word(m, 1, 0);
            m = next;
        }
        self.free_head = 0;

        for w in self.marks.iter_mut() {
            *w = 0;
        }

        for root in roots {
            self.mark_value(root);
        }

        self.sweep();
        self.collections += 1;
        log::debug!(
            "gc: done, {} blocks live, {} words free",
            self.blocks.len(),
            self.free_words()
        );
    }

    /// Conservative marking. A candidate is followed only when its stripped
    /// address names a live block of the kind its tag claims; anything else
    /// is ignored rather than dereferenced. The cdr chain is walked
    /// iteratively so long lists cannot overflow the native stack; the mark
    /// bit is tested before re-entry, which terminates cycles.
    fn mark_value(&mut self, v: LVal) {
        let mut v = v;
        loop {
            let Some((tag, addr)) = v.heap_candidate() else {
                return;
            };
            match self.blocks.get(&addr) {
                Some(block) if block.kind.matches(tag) => {}
                _ => return,
            }
            if self.is_marked(addr) {
                return;
            }
            self.set_mark(addr);
            match tag {
                Tag::Cons => {
                    let car = LVal::from_raw(self.word(addr, 0));
                    self.mark_value(car);
                    v = LVal::from_raw(self.word(addr, 1));
                }
                Tag::Iref => {
                    let slots = unpack_count(self.word(addr, 0));
                    for i in 0..slots {
                        let slot = LVal::from_raw(self.word(addr, HEADER_WORDS + i));
                        self.mark_value(slot);
                    }
                    return;
                }
                // Byte objects embed no references.
                Tag::Jref => return,
                Tag::Atom => unreachable!("atom survived heap_candidate"),
            }
        }
    }

    /// Sweep: walk the block table in address order, drop every unmarked
    /// block, clear the mark on every survivor, then rebuild the free list
    /// from the maximal gaps between survivors. Rebuilding from gaps merges
    /// adjacent free space, so the resulting list is address-ordered and
    /// coalesced.
    fn sweep(&mut self) {
        let dead: Vec<Addr> = self
            .blocks
            .keys()
            .copied()
            .filter(|&addr| !self.is_marked(addr))
            .collect();
        for addr in &dead {
            self.blocks.remove(addr);
        }
        for addr in self.blocks.keys().copied().collect::<Vec<_>>() {
            self.clear_mark(addr);
        }

        let arena_end = self.words.len() * WORD_SIZE;
        let mut gaps: Vec<(Addr, usize)> = Vec::new();
        let mut cursor = ARENA_BASE;
        for (&addr, block) in self.blocks.iter() {
            if addr > cursor {
                gaps.push((cursor, (addr - cursor) / WORD_SIZE));
            }
            cursor = addr + block.words * WORD_SIZE;
        }
        if arena_end > cursor {
            gaps.push((cursor, (arena_end - cursor) / WORD_SIZE));
        }

        self.free_head = 0;
        let mut prev: Addr = 0;
        for (addr, size) in gaps {
            self.set_word(addr, 0, 0);
            self.set_word(addr, 1, size as Word);
            if prev == 0 {
                self.free_head = addr;
            } else {
                self.set_word(prev, 0, addr as Word);
            }
            prev = addr;
        }
    }

    // -----------------------------------------------------------------------
    // Mark bitmap
    // -----------------------------------------------------------------------

    #[inline]
    fn mark_slot(addr: Addr) -> (usize, u64) {
        let w = addr / WORD_SIZE;
        (w / 64, 1u64 << (w % 64))
    }

    #[inline]
    fn is_marked(&self, addr: Addr) -> bool {
        let (i, bit) = Self::mark_slot(addr);
        self.marks[i] & bit != 0
    }

    #[inline]
    fn set_mark(&mut self, addr: Addr) {
        let (i, bit) = Self::mark_slot(addr);
        self.marks[i] |= bit;
    }

    #[inline]
    fn clear_mark(&mut self, addr: Addr) {
        let (i, bit) = Self::mark_slot(addr);
        self.marks[i] &= !bit;
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Words currently on the free list.
    pub fn free_words(&self) -> usize {
        let mut total = 0;
        let mut m = self.free_head;
        while m != 0 {
            total += self.word(m, 1) as usize;
            m = self.word(m, 0) as Addr;
        }
        total
    }

    /// Number of live allocations.
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Completed collection cycles.
    pub fn collections(&self) -> usize {
        self.collections
    }

    /// Total arena capacity in words.
    pub fn arena_words(&self) -> usize {
        self.words.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_heap_is_one_free_block() {
        let heap = Heap::new(64);
        assert_eq!(heap.free_words(), 62);
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn allocation_is_word_aligned() {
        let mut heap = Heap::new(256);
        for n in [2usize, 3, 4, 7, 10] {
            let addr = heap.allocate(n).unwrap();
            assert_eq!(addr % WORD_SIZE, 0);
            assert_eq!(addr & 3, 0);
        }
    }

    #[test]
    fn odd_sizes_round_up_to_even() {
        let mut heap = Heap::new(64);
        let before = heap.free_words();
        heap.allocate(3).unwrap();
        assert_eq!(heap.free_words(), before - 4);
    }

    #[test]
    fn split_returns_upper_tail() {
        let mut heap = Heap::new(16);
        // Single free block: 14 words at the arena base.
        let addr = heap.allocate(4).unwrap();
        // The free block stays at its original address with a reduced size;
        // the allocation is carved from the untouched tail.
        assert_eq!(addr, ARENA_BASE + 10 * WORD_SIZE);
        assert_eq!(heap.free_words(), 10);
        assert_eq!(heap.word(ARENA_BASE, 1), 10);
    }

    #[test]
    fn exact_fit_unlinks_block() {
        let mut heap = Heap::new(16);
        let addr = heap.allocate(14).unwrap();
        assert_eq!(addr, ARENA_BASE);
        assert_eq!(heap.free_words(), 0);
        // The list is empty now: the same request cannot be satisfied again.
        assert_eq!(heap.allocate(14), None);
        assert_eq!(heap.allocate(2), None);
    }

    #[test]
    fn no_space_is_not_an_error() {
        let mut heap = Heap::new(16);
        assert_eq!(heap.allocate(100), None);
        // The free block is untouched by the failed walk.
        assert_eq!(heap.free_words(), 14);
    }

    #[test]
    fn collect_reclaims_unreferenced_blocks() {
        let mut heap = Heap::new(64);
        let keep = heap.alloc_block(2, BlockKind::Cons).unwrap();
        heap.set_word(keep, 0, LVal::from_fixnum(7).raw());
        heap.set_word(keep, 1, LVal::NIL.raw());
        let _garbage = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let root = LVal::from_addr(keep, Tag::Cons);

        heap.collect([root].into_iter());

        assert_eq!(heap.live_blocks(), 1);
        assert_eq!(LVal::from_raw(heap.word(keep, 0)).as_fixnum(), 7);
    }

    #[test]
    fn collect_with_no_roots_frees_everything() {
        let mut heap = Heap::new(64);
        for _ in 0..8 {
            heap.allocate(2).unwrap();
        }
        heap.collect(std::iter::empty());
        assert_eq!(heap.live_blocks(), 0);
        // Gap rebuild coalesces the whole arena back into one block.
        assert_eq!(heap.free_words(), 62);
        assert_eq!(heap.collections(), 1);
    }

    #[test]
    fn raw_blocks_are_invisible_to_the_marker() {
        let mut heap = Heap::new(64);
        let raw = heap.allocate(4).unwrap();
        // Even a root that looks like a reference to the raw block is
        // rejected: the block kind does not match the tag.
        let fake = LVal::from_addr(raw, Tag::Cons);
        heap.collect([fake].into_iter());
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn junk_roots_are_ignored() {
        let mut heap = Heap::new(64);
        let keep = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let junk = [
            LVal::from_raw(0x0000_0101),          // aligned, but no such block
            LVal::from_raw(0x15),                 // unaligned reference
            LVal::from_raw(-9),                   // negative
            LVal::from_fixnum(keep as i64),       // atom, never a reference
        ];
        heap.collect(junk.into_iter());
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn marking_follows_cons_chains() {
        let mut heap = Heap::new(256);
        // Build a proper list of three cells by hand.
        let mut tail = LVal::NIL;
        let mut cells = Vec::new();
        for n in (1..=3).rev() {
            let addr = heap.alloc_block(2, BlockKind::Cons).unwrap();
            heap.set_word(addr, 0, LVal::from_fixnum(n).raw());
            heap.set_word(addr, 1, tail.raw());
            tail = LVal::from_addr(addr, Tag::Cons);
            cells.push(addr);
        }
        let _garbage = heap.alloc_block(2, BlockKind::Cons).unwrap();

        heap.collect([tail].into_iter());

        assert_eq!(heap.live_blocks(), 3);
        for addr in cells {
            assert!(heap.blocks.contains_key(&addr));
        }
    }

    #[test]
    fn marking_terminates_on_cycles() {
        let mut heap = Heap::new(64);
        let a = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let b = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let av = LVal::from_addr(a, Tag::Cons);
        let bv = LVal::from_addr(b, Tag::Cons);
        heap.set_word(a, 0, LVal::from_fixnum(1).raw());
        heap.set_word(a, 1, bv.raw());
        heap.set_word(b, 0, LVal::from_fixnum(2).raw());
        heap.set_word(b, 1, av.raw());

        heap.collect([av].into_iter());
        assert_eq!(heap.live_blocks(), 2);

        heap.collect(std::iter::empty());
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn sweep_gaps_are_reusable() {
        let mut heap = Heap::new(64);
        let a = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let keep = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let b = heap.alloc_block(2, BlockKind::Cons).unwrap();
        let _ = (a, b);
        let root = LVal::from_addr(keep, Tag::Cons);

        let before = heap.free_words();
        heap.collect([root].into_iter());
        assert!(heap.free_words() >= before + 4);

        // Freed space is allocatable again.
        assert!(heap.allocate(4).is_some());
    }

    proptest! {
        #[test]
        fn prop_allocations_stay_aligned(sizes in proptest::collection::vec(1usize..12, 1..32)) {
            let mut heap = Heap::new(2048);
            for n in sizes {
                if let Some(addr) = heap.allocate(n) {
                    prop_assert_eq!(addr % WORD_SIZE, 0);
                    prop_assert_eq!(addr & 3, 0);
                }
            }
        }

        #[test]
        fn prop_collect_empty_roots_restores_capacity(sizes in proptest::collection::vec(1usize..12, 1..32)) {
            let mut heap = Heap::new(2048);
            let initial = heap.free_words();
            for n in sizes {
                let _ = heap.allocate(n);
            }
            heap.collect(std::iter::empty());
            prop_assert_eq!(heap.free_words(), initial);
        }
    }
}
