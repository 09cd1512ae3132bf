//! CP15-based MMU control for ARMv7-A.
//!
//! All translation-table maintenance funnels through these four operations:
//! installing a table root, invalidating the whole TLB, invalidating one
//! page's translations, and the data/instruction barrier pair that orders
//! table writes against the walker.

use core::arch::asm;

use super::TableRoot;
use crate::VirtualAddress;

/// Installs `root` as the active translation-table base.
///
/// Cached translations are NOT invalidated; the caller decides whether a
/// flush is needed.
pub fn set_table_root(root: TableRoot) {
    // SAFETY: writing TTBR0 redirects the table walker. The caller must
    // guarantee the new table maps the currently executing code.
    unsafe {
        asm!(
            "mcr p15, 0, {0}, c2, c0, 0",
            "isb",
            in(reg) root.raw(),
            options(nostack, preserves_flags)
        );
    }
}

/// Returns the active translation-table base register value.
pub fn current_table_root() -> Option<TableRoot> {
    let value: u32;
    // SAFETY: reading TTBR0 has no side effects.
    unsafe {
        asm!(
            "mrc p15, 0, {0}, c2, c0, 0",
            out(reg) value,
            options(nomem, nostack, preserves_flags)
        );
    }
    Some(TableRoot::from_raw(value))
}

/// Invalidates every cached translation.
pub fn invalidate_all() {
    // SAFETY: TLBIALL only discards cached translations.
    unsafe {
        asm!(
            "mcr p15, 0, {0}, c8, c7, 0",
            "dsb",
            "isb",
            in(reg) 0u32,
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidates any cached translation for the page containing `virt`,
/// across all address spaces.
pub fn invalidate_page(virt: VirtualAddress) {
    let mva = (virt.as_usize() as u32) & !0xFFF;
    // SAFETY: TLBIMVAA only discards cached translations.
    unsafe {
        asm!(
            "mcr p15, 0, {0}, c8, c7, 3",
            "dsb",
            "isb",
            in(reg) mva,
            options(nostack, preserves_flags)
        );
    }
}

/// Orders preceding table writes before any subsequent translation.
pub fn barrier() {
    // SAFETY: barriers have no architectural side effects beyond ordering.
    unsafe {
        asm!("dsb", "isb", options(nostack, preserves_flags));
    }
}
