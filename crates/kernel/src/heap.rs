//! Kernel heap.
//!
//! The heap hands out byte-granular blocks from a span of the direct map
//! carved off once at boot. Free space is tracked as a fixed array of ranges
//! ordered by base address; allocation is a first-fit scan and freed ranges
//! merge with their neighbours. There is no metadata next to the blocks, the
//! layout passed to `dealloc` is enough to reconstruct the block size.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

/// Free ranges the heap can track at once. A free that would need a new slot
/// when all are taken is leaked with a warning.
const MAX_FREE_RANGES: usize = 64;

/// Every block size is rounded up to this granule.
const GRANULE: usize = 8;

/// A contiguous range of free heap bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    base: usize,
    size: usize,
}

impl FreeRange {
    const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    const fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether the ranges touch or overlap and can be folded into one.
    const fn mergeable(&self, other: &FreeRange) -> bool {
        self.base <= other.end() && other.base <= self.end()
    }

    const fn merge(&self, other: &FreeRange) -> FreeRange {
        let base = if self.base < other.base { self.base } else { other.base };
        let end = if self.end() > other.end() { self.end() } else { other.end() };
        FreeRange::new(base, end - base)
    }
}

struct FreeList {
    ranges: [Option<FreeRange>; MAX_FREE_RANGES],
    count: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            ranges: [None; MAX_FREE_RANGES],
            count: 0,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &FreeRange> {
        self.ranges[..self.count].iter().filter_map(|r| r.as_ref())
    }

    /// Inserts a range at the given index, shifting subsequent ranges.
    /// Returns false when every slot is taken.
    fn insert(&mut self, index: usize, range: FreeRange) -> bool {
        if self.count == MAX_FREE_RANGES {
            return false;
        }

        for i in (index..self.count).rev() {
            self.ranges[i + 1] = self.ranges[i];
        }
        self.ranges[index] = Some(range);
        self.count += 1;
        true
    }

    /// Removes the range at the given index, shifting subsequent ranges.
    fn remove(&mut self, index: usize) -> FreeRange {
        let range = self.ranges[index].take().unwrap();
        for i in index..self.count - 1 {
            self.ranges[i] = self.ranges[i + 1];
        }
        self.ranges[self.count - 1] = None;
        self.count -= 1;
        range
    }

    /// Adds a range, keeping the array sorted by base address and folding the
    /// new range into any neighbour it touches.
    fn add(&mut self, range: FreeRange) -> bool {
        if range.size == 0 {
            return true;
        }

        let mut insert_pos = self.count;
        let mut merged = range;
        let mut merge_start = None;

        let mut i = 0;
        while i < self.count {
            let existing = self.ranges[i].unwrap();
            if merged.mergeable(&existing) {
                merged = merged.merge(&existing);
                self.remove(i);
                if merge_start.is_none() {
                    merge_start = Some(i);
                }
                continue;
            }
            if existing.base > merged.end() {
                insert_pos = i;
                break;
            }
            i += 1;
        }

        if let Some(start) = merge_start {
            insert_pos = start;
        }
        self.insert(insert_pos, merged)
    }

    /// First-fit scan for `size` bytes at `align`. Carves the block out of
    /// the first range that can hold it and returns the block's address.
    fn take(&mut self, size: usize, align: usize) -> Option<usize> {
        for i in 0..self.count {
            let range = self.ranges[i].unwrap();
            let aligned = range.base.next_multiple_of(align);
            if aligned + size > range.end() {
                continue;
            }

            self.remove(i);
            let before = FreeRange::new(range.base, aligned - range.base);
            let after = FreeRange::new(aligned + size, range.end() - (aligned + size));
            // One slot is guaranteed free after the removal above; a second
            // residual piece can still lose out to a full array.
            let kept_before = self.add(before);
            let kept_after = self.add(after);
            if !kept_before || !kept_after {
                log::warn!("heap free list full, leaking a residual range");
            }
            return Some(aligned);
        }
        None
    }

    fn free_bytes(&self) -> usize {
        self.iter().map(|r| r.size).sum()
    }
}

pub struct KernelHeap {
    free: Mutex<FreeList>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(FreeList::new()),
        }
    }

    /// Donates a span of memory to the heap.
    ///
    /// # Safety
    ///
    /// The span must be mapped, writable, and used by nothing else from this
    /// point on.
    pub unsafe fn add_region(&self, base: usize, size: usize) {
        if !self.free.lock().add(FreeRange::new(base, size)) {
            log::warn!("heap free list full, leaking {} bytes", size);
        }
    }

    pub fn allocate(&self, layout: Layout) -> Option<usize> {
        self.free.lock().take(block_size(&layout), layout.align())
    }

    pub fn free(&self, addr: usize, layout: Layout) {
        if !self.free.lock().add(FreeRange::new(addr, block_size(&layout))) {
            log::warn!("heap free list full, leaking a freed block");
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.free.lock().free_bytes()
    }
}

/// Bytes a block for this layout occupies.
fn block_size(layout: &Layout) -> usize {
    layout.size().max(1).next_multiple_of(GRANULE)
}

#[cfg_attr(all(target_arch = "arm", not(test)), global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate(layout) {
            Some(addr) => addr as *mut u8,
            None => {
                log::error!("kernel heap exhausted allocating {:?}", layout);
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        self.free(ptr as usize, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Backing([u8; 4096]);

    fn heap_over(backing: &mut Backing) -> KernelHeap {
        let heap = KernelHeap::new();
        // SAFETY: the backing array outlives every use in the test and is
        // used through the heap only.
        unsafe {
            heap.add_region(backing.0.as_mut_ptr() as usize, backing.0.len());
        }
        heap
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let mut backing = Backing([0; 4096]);
        let heap = heap_over(&mut backing);

        let a = heap.allocate(Layout::from_size_align(24, 8).unwrap()).unwrap();
        let b = heap.allocate(Layout::from_size_align(100, 64).unwrap()).unwrap();
        let c = heap.allocate(Layout::from_size_align(1, 1).unwrap()).unwrap();

        assert_eq!(a % 8, 0);
        assert_eq!(b % 64, 0);
        let blocks = [(a, 24), (b, 104), (c, 8)];
        for (i, &(base, size)) in blocks.iter().enumerate() {
            for &(other_base, other_size) in &blocks[i + 1..] {
                assert!(base + size <= other_base || other_base + other_size <= base);
            }
        }
    }

    #[test]
    fn an_empty_heap_refuses_everything() {
        let heap = KernelHeap::new();
        assert_eq!(heap.allocate(Layout::from_size_align(8, 8).unwrap()), None);
    }

    #[test]
    fn freed_blocks_are_reused() {
        let mut backing = Backing([0; 4096]);
        let heap = heap_over(&mut backing);

        let layout = Layout::from_size_align(128, 8).unwrap();
        let first = heap.allocate(layout).unwrap();
        heap.free(first, layout);
        assert_eq!(heap.allocate(layout), Some(first));
    }

    #[test]
    fn neighbouring_frees_merge() {
        let mut backing = Backing([0; 4096]);
        let heap = heap_over(&mut backing);
        let initial = heap.free_bytes();

        let layout = Layout::from_size_align(512, 8).unwrap();
        let a = heap.allocate(layout).unwrap();
        let b = heap.allocate(layout).unwrap();
        let c = heap.allocate(layout).unwrap();

        heap.free(a, layout);
        heap.free(c, layout);
        heap.free(b, layout);

        assert_eq!(heap.free_bytes(), initial);
        // A merged list can satisfy a request larger than any single freed block.
        let big = Layout::from_size_align(3 * 512, 8).unwrap();
        assert_eq!(heap.allocate(big), Some(a));
    }

    #[test]
    fn alignment_padding_stays_usable() {
        let mut backing = Backing([0; 4096]);
        let heap = heap_over(&mut backing);
        let initial = heap.free_bytes();

        let small = Layout::from_size_align(8, 8).unwrap();
        let padded = Layout::from_size_align(64, 64).unwrap();

        let a = heap.allocate(small).unwrap();
        let b = heap.allocate(padded).unwrap();
        heap.free(a, small);
        heap.free(b, padded);

        assert_eq!(heap.free_bytes(), initial);
    }

    #[test]
    fn exhaustion_reports_none_and_recovers() {
        let mut backing = Backing([0; 4096]);
        let heap = heap_over(&mut backing);

        let layout = Layout::from_size_align(4096, 8).unwrap();
        let all = heap.allocate(layout).unwrap();
        assert_eq!(heap.allocate(Layout::from_size_align(8, 8).unwrap()), None);

        heap.free(all, layout);
        assert!(heap.allocate(Layout::from_size_align(8, 8).unwrap()).is_some());
    }
}
