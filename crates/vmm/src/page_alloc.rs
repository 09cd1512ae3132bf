//! Page-granular range allocators.
//!
//! This module provides a span-based allocator inspired by Linux's memblock allocator.
//! It maintains static arrays of page spans to track free and allocated ranges, allowing
//! early kernel initialization without requiring dynamic allocation. The same core is
//! instantiated twice: once over physical frame numbers and once per address space over
//! virtual page numbers.

use core::fmt;

use crate::{FrameNumber, PAGE_SIZE, PageNumber, PhysicalAddress, VirtualAddress};

/// Maximum number of free spans that can be tracked per allocator.
const MAX_SPANS: usize = 128;

/// Maximum number of live allocation units that can be tracked per allocator.
const MAX_ALLOCATIONS: usize = 256;

/// Errors that can occur during page allocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No suitable free range available for the allocation.
    OutOfMemory,
    /// The requested alignment is invalid (e.g., not a power of two).
    InvalidAlignment,
    /// The span arrays are full and cannot track more ranges.
    RegionsFull,
    /// The freed range does not match a live allocation unit.
    InvalidFree,
    /// The requested range overlaps a range that is already in use.
    RangeInUse,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidAlignment => write!(f, "invalid alignment"),
            Self::RegionsFull => write!(f, "region tracking space exhausted"),
            Self::InvalidFree => write!(f, "freed range does not match a live allocation"),
            Self::RangeInUse => write!(f, "requested range is already in use"),
        }
    }
}

/// A contiguous range of pages, identified by page index.
///
/// The same type describes physical frame ranges and virtual page ranges;
/// the owning allocator fixes the interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    start: usize,
    count: usize,
}

impl PageSpan {
    /// Creates a new span of `count` pages starting at page index `start`.
    pub const fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    /// Returns the first page index of this span.
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Returns the number of pages in this span.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns the page index one past the end of this span.
    pub const fn end(&self) -> usize {
        self.start + self.count
    }

    /// Returns true if this span overlaps with another span.
    pub const fn overlaps(&self, other: &PageSpan) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Returns true if this span is adjacent to another span.
    pub const fn adjacent(&self, other: &PageSpan) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Returns true if this span can be merged with another span.
    pub const fn mergeable(&self, other: &PageSpan) -> bool {
        self.overlaps(other) || self.adjacent(other)
    }

    /// Merges this span with another, returning a new span covering both.
    /// The spans must be mergeable.
    pub const fn merge(&self, other: &PageSpan) -> PageSpan {
        let start = if self.start < other.start {
            self.start
        } else {
            other.start
        };
        let end = if self.end() > other.end() {
            self.end()
        } else {
            other.end()
        };
        PageSpan::new(start, end - start)
    }

    /// Returns true if this span fully contains another span.
    pub const fn contains(&self, other: &PageSpan) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

/// Fixed-size array of page spans with static allocation.
///
/// Spans are kept sorted by start index. Depending on use they are either
/// merged on insertion (free lists) or kept as distinct units (allocation
/// ledgers).
#[derive(Debug)]
struct SpanArray<const CAP: usize> {
    spans: [Option<PageSpan>; CAP],
    count: usize,
}

impl<const CAP: usize> SpanArray<CAP> {
    /// Creates a new empty span array.
    const fn new() -> Self {
        Self {
            spans: [None; CAP],
            count: 0,
        }
    }

    /// Returns the number of spans in the array.
    const fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the array is full.
    const fn is_full(&self) -> bool {
        self.count >= CAP
    }

    /// Returns an iterator over the spans.
    fn iter(&self) -> impl Iterator<Item = &PageSpan> {
        self.spans[..self.count].iter().filter_map(|s| s.as_ref())
    }

    /// Inserts a span at the specified index, shifting subsequent spans.
    fn insert(&mut self, index: usize, span: PageSpan) -> Result<(), AllocError> {
        if self.is_full() {
            return Err(AllocError::RegionsFull);
        }
        if index > self.count {
            return Err(AllocError::RegionsFull);
        }

        // Shift spans to make space
        for i in (index..self.count).rev() {
            self.spans[i + 1] = self.spans[i];
        }

        self.spans[index] = Some(span);
        self.count += 1;
        Ok(())
    }

    /// Removes the span at the specified index, shifting subsequent spans.
    fn remove(&mut self, index: usize) {
        if index >= self.count {
            return;
        }

        // Shift spans to fill the gap
        for i in index..self.count - 1 {
            self.spans[i] = self.spans[i + 1];
        }

        self.spans[self.count - 1] = None;
        self.count -= 1;
    }

    /// Adds a span to the array, maintaining sorted order by start index.
    /// Automatically merges with adjacent or overlapping spans.
    fn add(&mut self, span: PageSpan) -> Result<(), AllocError> {
        if span.count() == 0 {
            return Ok(());
        }

        // Find insertion point and check for merges
        let mut insert_pos = self.count;
        let mut merged_span = span;
        let mut merge_start = None;
        let mut merge_end = None;

        for (i, existing) in self.iter().enumerate() {
            if merged_span.start() > existing.end() {
                // New span comes after this one
                continue;
            } else if merged_span.end() < existing.start() {
                // New span comes before this one
                if insert_pos == self.count {
                    insert_pos = i;
                }
                break;
            } else {
                // Spans overlap or are adjacent - merge them
                merged_span = merged_span.merge(existing);
                if merge_start.is_none() {
                    merge_start = Some(i);
                }
                merge_end = Some(i);
            }
        }

        // Remove merged spans and insert the combined span
        if let Some(start) = merge_start {
            let end = merge_end.unwrap();
            for _ in start..=end {
                self.remove(start);
            }
            insert_pos = start;
        }

        self.insert(insert_pos, merged_span)
    }

    /// Records a span as a distinct unit, maintaining sorted order without merging.
    ///
    /// Used for allocation ledgers, where each unit must stay individually
    /// identifiable so it can be validated on free.
    fn record(&mut self, span: PageSpan) -> Result<(), AllocError> {
        if span.count() == 0 {
            return Ok(());
        }

        let mut insert_pos = self.count;
        for (i, existing) in self.iter().enumerate() {
            if span.overlaps(existing) {
                return Err(AllocError::RangeInUse);
            }
            if span.end() <= existing.start() {
                insert_pos = i;
                break;
            }
        }

        self.insert(insert_pos, span)
    }

    /// Removes a span that exactly matches a previously recorded unit.
    ///
    /// Returns false if no such unit exists.
    fn take_matching(&mut self, span: PageSpan) -> bool {
        for i in 0..self.count {
            if self.spans[i] == Some(span) {
                self.remove(i);
                return true;
            }
        }
        false
    }

    /// Removes the first recorded span, if any.
    fn take_first(&mut self) -> Option<PageSpan> {
        if self.count == 0 {
            return None;
        }
        let span = self.spans[0];
        self.remove(0);
        span
    }

    /// Removes a span from the array, potentially splitting existing spans.
    fn subtract(&mut self, span: PageSpan) -> Result<(), AllocError> {
        if span.count() == 0 {
            return Ok(());
        }

        let mut i = 0;
        while i < self.count {
            let existing = self.spans[i].unwrap();

            if !existing.overlaps(&span) {
                i += 1;
                continue;
            }

            // Span overlaps - need to handle it
            self.remove(i);

            // Add back the parts that don't overlap
            if existing.start() < span.start() {
                // Part before the removed span
                let before = PageSpan::new(existing.start(), span.start() - existing.start());
                self.insert(i, before)?;
                i += 1;
            }

            if existing.end() > span.end() {
                // Part after the removed span
                let after = PageSpan::new(span.end(), existing.end() - span.end());
                self.insert(i, after)?;
                i += 1;
            }
        }

        Ok(())
    }

    /// Returns true if some single span fully contains the given span.
    ///
    /// Spans in a merged array are maximal, so containment in one span is
    /// equivalent to the whole range being present.
    fn contains(&self, span: &PageSpan) -> bool {
        self.iter().any(|existing| existing.contains(span))
    }

    /// Calculates the total number of pages across all spans.
    fn total_pages(&self) -> usize {
        self.iter().map(|s| s.count()).sum()
    }
}

/// A page-range allocator with static accounting space.
///
/// This allocator maintains two lists of page spans:
/// - Free spans: ranges currently available, merged and sorted
/// - Allocations: the exact units handed out, used to validate frees
///
/// A range freed back must exactly match a live allocation unit; anything
/// else (never allocated, already freed, or a partial unit) is rejected
/// with [`AllocError::InvalidFree`].
#[derive(Debug)]
struct RangeAllocator {
    /// Ranges currently available for allocation.
    free: SpanArray<MAX_SPANS>,
    /// Exact units handed out and not yet freed.
    allocations: SpanArray<MAX_ALLOCATIONS>,
}

impl RangeAllocator {
    /// Creates a new empty range allocator.
    const fn new() -> Self {
        Self {
            free: SpanArray::new(),
            allocations: SpanArray::new(),
        }
    }

    /// Adds a span of pages to the free set.
    fn add_free(&mut self, span: PageSpan) -> Result<(), AllocError> {
        self.free.add(span)
    }

    /// Allocates `count` pages whose start index is a multiple of `align`.
    ///
    /// Uses a first-fit scan over the free list.
    fn allocate(&mut self, count: usize, align: usize) -> Result<usize, AllocError> {
        if count == 0 {
            return Err(AllocError::OutOfMemory);
        }
        if align == 0 || !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        let mut found = None;
        for span in self.free.iter() {
            let aligned_start = (span.start() + align - 1) & !(align - 1);
            if aligned_start + count <= span.end() {
                found = Some(PageSpan::new(aligned_start, count));
                break;
            }
        }

        let unit = found.ok_or(AllocError::OutOfMemory)?;
        self.free.subtract(unit)?;
        if let Err(err) = self.allocations.record(unit) {
            // Roll the free list back so a full ledger doesn't leak pages.
            self.free.add(unit)?;
            return Err(err);
        }

        Ok(unit.start())
    }

    /// Claims an exact span of pages, which must lie entirely in the free set.
    fn claim(&mut self, span: PageSpan) -> Result<(), AllocError> {
        if span.count() == 0 {
            return Err(AllocError::OutOfMemory);
        }
        if !self.free.contains(&span) {
            return Err(AllocError::RangeInUse);
        }

        self.free.subtract(span)?;
        if let Err(err) = self.allocations.record(span) {
            self.free.add(span)?;
            return Err(err);
        }

        Ok(())
    }

    /// Releases a span of pages back to the free set.
    ///
    /// The span must exactly match a previous [`allocate`](Self::allocate) or
    /// [`claim`](Self::claim) unit.
    fn release(&mut self, span: PageSpan) -> Result<(), AllocError> {
        if !self.allocations.take_matching(span) {
            return Err(AllocError::InvalidFree);
        }
        self.free.add(span)
    }

    /// Removes and returns the lowest live allocation unit, without freeing it.
    ///
    /// Used during address-space teardown to walk every mapped unit exactly once.
    fn take_first_allocation(&mut self) -> Option<PageSpan> {
        self.allocations.take_first()
    }

    /// Returns the number of live allocation units.
    fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Returns the total number of free pages.
    fn free_pages(&self) -> usize {
        self.free.total_pages()
    }
}

/// Physical page frame allocator.
///
/// Tracks free physical frames and hands out contiguous, aligned runs of
/// them. Frames freed back must match the unit they were allocated as.
#[derive(Debug)]
pub struct FrameAllocator {
    inner: RangeAllocator,
}

impl FrameAllocator {
    /// Creates a new empty frame allocator.
    pub const fn new() -> Self {
        Self {
            inner: RangeAllocator::new(),
        }
    }

    /// Adds a usable physical memory region to the allocator.
    ///
    /// The region's base address and size must be page aligned.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not page aligned.
    pub fn add_region(&mut self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        assert!(base.is_aligned(PAGE_SIZE), "region base must be page aligned");
        assert!(size % PAGE_SIZE == 0, "region size must be page aligned");

        let span = PageSpan::new(base.frame_number().as_usize(), size / PAGE_SIZE);
        log::debug!(
            "adding physical memory region {base} ({} pages)",
            span.count()
        );
        self.inner.add_free(span)
    }

    /// Reserves an exact physical range, marking it as allocated.
    ///
    /// This is used to claim the kernel image and boot-time structures so
    /// they are never handed out. The range must currently be free.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not page aligned.
    pub fn reserve(&mut self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        assert!(base.is_aligned(PAGE_SIZE), "reservation must be page aligned");
        assert!(size % PAGE_SIZE == 0, "reservation size must be page aligned");

        let span = PageSpan::new(base.frame_number().as_usize(), size / PAGE_SIZE);
        self.inner.claim(span)
    }

    /// Allocates `count` contiguous frames aligned to `align` frames.
    ///
    /// `align` must be a power of two; pass 1 for no alignment requirement.
    /// Returns the physical address of the first frame.
    pub fn alloc_pages(&mut self, count: usize, align: usize) -> Result<PhysicalAddress, AllocError> {
        match self.inner.allocate(count, align) {
            Ok(start) => Ok(FrameNumber::new(start).start()),
            Err(err) => {
                log::error!("failed to allocate {count} frames (align {align}): {err}");
                Err(err)
            }
        }
    }

    /// Frees a run of frames previously returned by [`alloc_pages`](Self::alloc_pages).
    ///
    /// The base and count must exactly match the original allocation unit;
    /// a partial, repeated, or never-allocated free fails with
    /// [`AllocError::InvalidFree`].
    pub fn free_pages(&mut self, base: PhysicalAddress, count: usize) -> Result<(), AllocError> {
        let span = PageSpan::new(base.frame_number().as_usize(), count);
        self.inner.release(span)
    }

    /// Returns the number of free frames.
    pub fn free_page_count(&self) -> usize {
        self.inner.free_pages()
    }

    /// Returns the number of live allocation units.
    pub fn allocation_count(&self) -> usize {
        self.inner.allocation_count()
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual address-range allocator for one address space.
///
/// Tracks which page-aligned virtual ranges are reserved. Every mapping in
/// an address space is backed by a reservation here, so overlapping
/// mappings are rejected before any descriptor is touched.
#[derive(Debug)]
pub struct VirtualRangeAllocator {
    inner: RangeAllocator,
}

impl VirtualRangeAllocator {
    /// Creates a new empty virtual range allocator.
    pub const fn new() -> Self {
        Self {
            inner: RangeAllocator::new(),
        }
    }

    /// Adds a usable virtual range to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not page aligned.
    pub fn add_range(&mut self, base: VirtualAddress, size: usize) -> Result<(), AllocError> {
        assert!(base.is_aligned(PAGE_SIZE), "range base must be page aligned");
        assert!(size % PAGE_SIZE == 0, "range size must be page aligned");

        let span = PageSpan::new(base.page_number().as_usize(), size / PAGE_SIZE);
        self.inner.add_free(span)
    }

    /// Reserves the exact range `[base, base + size)`.
    ///
    /// Fails with [`AllocError::RangeInUse`] if any page of the range is
    /// already reserved or lies outside the managed window.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not page aligned.
    pub fn reserve(&mut self, base: VirtualAddress, size: usize) -> Result<(), AllocError> {
        assert!(base.is_aligned(PAGE_SIZE), "reservation must be page aligned");
        assert!(size % PAGE_SIZE == 0, "reservation size must be page aligned");

        let span = PageSpan::new(base.page_number().as_usize(), size / PAGE_SIZE);
        self.inner.claim(span)
    }

    /// Reserves `count` pages anywhere in the managed window and returns
    /// the chosen base address.
    pub fn allocate(&mut self, count: usize) -> Result<VirtualAddress, AllocError> {
        let start = self.inner.allocate(count, 1)?;
        Ok(PageNumber::new(start).start())
    }

    /// Releases a reservation made by [`reserve`](Self::reserve) or
    /// [`allocate`](Self::allocate). The range must match exactly.
    pub fn release(&mut self, base: VirtualAddress, size: usize) -> Result<(), AllocError> {
        let span = PageSpan::new(base.page_number().as_usize(), size / PAGE_SIZE);
        self.inner.release(span)
    }

    /// Removes and returns the lowest live reservation as `(base, size)`,
    /// without touching the free list.
    ///
    /// Used during address-space teardown to visit every mapped range once.
    pub fn take_first_reservation(&mut self) -> Option<(VirtualAddress, usize)> {
        self.inner
            .take_first_allocation()
            .map(|span| (PageNumber::new(span.start()).start(), span.count() * PAGE_SIZE))
    }

    /// Returns the number of live reservations.
    pub fn reservation_count(&self) -> usize {
        self.inner.allocation_count()
    }

    /// Returns the number of free pages in the managed window.
    pub fn free_page_count(&self) -> usize {
        self.inner.free_pages()
    }
}

impl Default for VirtualRangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}
