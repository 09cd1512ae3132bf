//! In-memory layout of the hardware translation tables.
//!
//! Tables are never constructed on the stack: they live in physical frames
//! owned by an address space and are reached through the global address
//! translator. The types here fix the exact size and alignment the table
//! walk hardware requires.

use crate::{
    AddressTranslator, AllocError, FIRST_LEVEL_ENTRIES, FirstLevelDescriptor, FrameAllocator,
    FrameNumber, PAGE_SIZE, PhysicalAddress, SECOND_LEVEL_ENTRIES, SecondLevelDescriptor,
    descriptor::SECOND_LEVEL_TABLE_SIZE,
};

/// Number of second-level tables that fit in one physical frame.
const TABLES_PER_FRAME: usize = PAGE_SIZE / SECOND_LEVEL_TABLE_SIZE;

/// Maximum number of frames one pool will dedicate to second-level tables.
const MAX_TABLE_FRAMES: usize = 64;

/// A first-level translation table: 4096 word descriptors, 16 KiB aligned.
#[repr(C, align(16384))]
pub(crate) struct FirstLevelTable {
    entries: [FirstLevelDescriptor; FIRST_LEVEL_ENTRIES],
}

impl FirstLevelTable {
    /// Returns the descriptor at `index`.
    pub(crate) fn entry(&self, index: usize) -> FirstLevelDescriptor {
        self.entries[index]
    }

    /// Returns a mutable reference to the descriptor at `index`.
    pub(crate) fn entry_mut(&mut self, index: usize) -> &mut FirstLevelDescriptor {
        &mut self.entries[index]
    }

    /// Resets every descriptor to unmapped.
    pub(crate) fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

/// A second-level (coarse) translation table: 256 word descriptors, 1 KiB aligned.
#[repr(C, align(1024))]
pub(crate) struct SecondLevelTable {
    entries: [SecondLevelDescriptor; SECOND_LEVEL_ENTRIES],
}

impl SecondLevelTable {
    /// Returns the descriptor at `index`.
    pub(crate) fn entry(&self, index: usize) -> SecondLevelDescriptor {
        self.entries[index]
    }

    /// Returns a mutable reference to the descriptor at `index`.
    pub(crate) fn entry_mut(&mut self, index: usize) -> &mut SecondLevelDescriptor {
        &mut self.entries[index]
    }

    /// Resets every descriptor to unmapped.
    pub(crate) fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    /// Returns true if every descriptor is unmapped.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.is_unmapped())
    }
}

/// Arena of second-level tables for one address space.
///
/// Second-level tables are a quarter of a frame, so the pool carves four
/// tables out of each frame it takes from the physical allocator. Tables
/// are handed out zeroed and stay owned by the pool until the whole
/// address space is torn down; they are never returned individually.
#[derive(Debug)]
pub(crate) struct TablePool {
    frames: [FrameNumber; MAX_TABLE_FRAMES],
    frame_count: usize,
    /// Tables carved out of the newest frame.
    tables_used: usize,
}

impl TablePool {
    /// Creates an empty pool.
    pub(crate) const fn new() -> Self {
        Self {
            frames: [FrameNumber::new(0); MAX_TABLE_FRAMES],
            frame_count: 0,
            tables_used: 0,
        }
    }

    /// Allocates one zeroed second-level table, taking a fresh frame from
    /// `frames` when the current one is exhausted.
    pub(crate) fn allocate_table(
        &mut self,
        frames: &mut FrameAllocator,
    ) -> Result<PhysicalAddress, AllocError> {
        if self.frame_count == 0 || self.tables_used == TABLES_PER_FRAME {
            if self.frame_count == MAX_TABLE_FRAMES {
                return Err(AllocError::RegionsFull);
            }
            let base = frames.alloc_pages(1, 1)?;
            self.frames[self.frame_count] = base.frame_number();
            self.frame_count += 1;
            self.tables_used = 0;
        }

        let frame = self.frames[self.frame_count - 1];
        let table_phys = frame.start() + self.tables_used * SECOND_LEVEL_TABLE_SIZE;
        self.tables_used += 1;

        let translator = AddressTranslator::current();
        let table = translator.phys_to_ptr::<SecondLevelTable>(table_phys.as_usize());
        // SAFETY: the frame backing this table belongs exclusively to this
        // pool and the table slot has not been handed out before.
        unsafe { (*table).zero() };

        Ok(table_phys)
    }

    /// Returns the number of tables handed out so far.
    pub(crate) fn allocated_tables(&self) -> usize {
        if self.frame_count == 0 {
            0
        } else {
            (self.frame_count - 1) * TABLES_PER_FRAME + self.tables_used
        }
    }

    /// Returns every frame this pool owns to the physical allocator.
    ///
    /// The caller must ensure no descriptor still points into these tables.
    pub(crate) fn release_frames(
        &mut self,
        frames: &mut FrameAllocator,
    ) -> Result<(), AllocError> {
        for i in 0..self.frame_count {
            frames.free_pages(self.frames[i].start(), 1)?;
        }
        self.frame_count = 0;
        self.tables_used = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECTION_SIZE;

    #[test]
    fn table_layout_matches_hardware() {
        assert_eq!(core::mem::size_of::<FirstLevelTable>(), 16 * 1024);
        assert_eq!(core::mem::align_of::<FirstLevelTable>(), 16 * 1024);
        assert_eq!(core::mem::size_of::<SecondLevelTable>(), 1024);
        assert_eq!(core::mem::align_of::<SecondLevelTable>(), 1024);

        // One first-level entry per 1 MiB of the 4 GiB space
        assert_eq!(FIRST_LEVEL_ENTRIES * SECTION_SIZE, 1 << 32);
        // One second-level entry per page of a section
        assert_eq!(SECOND_LEVEL_ENTRIES * PAGE_SIZE, SECTION_SIZE);
    }

    mod pool {
        use super::*;

        fn setup() -> FrameAllocator {
            if AddressTranslator::try_current().is_none() {
                AddressTranslator::set_current(AddressTranslator::emulated(
                    0x4000_0000,
                    64 * PAGE_SIZE,
                ));
            }

            let translator = AddressTranslator::current();
            let phys = translator
                .allocate(16 * PAGE_SIZE, PAGE_SIZE)
                .expect("out of emulated memory");

            let mut frames = FrameAllocator::new();
            frames
                .add_region(PhysicalAddress::new(phys), 16 * PAGE_SIZE)
                .unwrap();
            frames
        }

        #[test]
        fn tables_are_carved_from_frames() {
            let mut frames = setup();
            let mut pool = TablePool::new();
            let free_before = frames.free_page_count();

            let first = pool.allocate_table(&mut frames).unwrap();
            let second = pool.allocate_table(&mut frames).unwrap();
            let third = pool.allocate_table(&mut frames).unwrap();
            let fourth = pool.allocate_table(&mut frames).unwrap();

            // Four tables share one frame at 1 KiB strides
            assert_eq!(second - first, SECOND_LEVEL_TABLE_SIZE);
            assert_eq!(third - first, 2 * SECOND_LEVEL_TABLE_SIZE);
            assert_eq!(fourth - first, 3 * SECOND_LEVEL_TABLE_SIZE);
            assert_eq!(frames.free_page_count(), free_before - 1);

            // A fifth table needs a new frame
            let fifth = pool.allocate_table(&mut frames).unwrap();
            assert!(fifth.is_aligned(PAGE_SIZE));
            assert_eq!(frames.free_page_count(), free_before - 2);
            assert_eq!(pool.allocated_tables(), 5);
        }

        #[test]
        fn allocated_tables_start_zeroed() {
            let mut frames = setup();
            let mut pool = TablePool::new();

            let table_phys = pool.allocate_table(&mut frames).unwrap();
            let translator = AddressTranslator::current();
            let table = translator.phys_to_ptr::<SecondLevelTable>(table_phys.as_usize());

            let table = unsafe { &*table };
            assert!(table.is_empty());
        }

        #[test]
        fn release_returns_all_frames() {
            let mut frames = setup();
            let mut pool = TablePool::new();
            let free_before = frames.free_page_count();

            for _ in 0..6 {
                pool.allocate_table(&mut frames).unwrap();
            }
            assert_eq!(frames.free_page_count(), free_before - 2);

            pool.release_frames(&mut frames).unwrap();
            assert_eq!(frames.free_page_count(), free_before);
            assert_eq!(pool.allocated_tables(), 0);
        }

        #[test]
        fn pool_exhaustion_reported() {
            let mut frames = FrameAllocator::new();
            let mut pool = TablePool::new();

            // No frames available at all
            assert_eq!(
                pool.allocate_table(&mut frames),
                Err(AllocError::OutOfMemory)
            );
        }
    }
}
