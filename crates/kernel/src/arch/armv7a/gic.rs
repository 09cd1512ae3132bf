//! GICv2 driver.
//!
//! One distributor, one CPU interface, one CPU. Interrupt priorities stay at
//! their reset values; the priority mask is opened all the way so anything
//! enabled at the distributor can fire.

use spin::Once;
use vmm::VirtualAddress;

use super::InterruptVector;

const GICD_CTLR: usize = 0x000;
const GICD_ISENABLER: usize = 0x100;

const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_IAR: usize = 0x00c;
const GICC_EOIR: usize = 0x010;

/// IAR value meaning nothing is pending.
const SPURIOUS: u32 = 1023;

struct Gic {
    distributor: VirtualAddress,
    cpu: VirtualAddress,
}

impl Gic {
    fn write_distributor(&self, offset: usize, value: u32) {
        // SAFETY: device mapping established by init, offset from the
        // register constants above.
        unsafe {
            core::ptr::write_volatile(
                VirtualAddress::new(self.distributor.as_usize() + offset).as_mut_ptr(),
                value,
            );
        }
    }

    fn write_cpu(&self, offset: usize, value: u32) {
        // SAFETY: as for write_distributor.
        unsafe {
            core::ptr::write_volatile(
                VirtualAddress::new(self.cpu.as_usize() + offset).as_mut_ptr(),
                value,
            );
        }
    }

    fn read_cpu(&self, offset: usize) -> u32 {
        // SAFETY: as for write_distributor.
        unsafe {
            core::ptr::read_volatile(VirtualAddress::new(self.cpu.as_usize() + offset).as_ptr())
        }
    }
}

static GIC: Once<Gic> = Once::new();

fn gic() -> &'static Gic {
    GIC.get().expect("interrupt controller touched before init")
}

pub fn init(distributor: VirtualAddress, cpu: VirtualAddress) {
    let gic = GIC.call_once(|| Gic { distributor, cpu });
    gic.write_distributor(GICD_CTLR, 1);
    gic.write_cpu(GICC_PMR, 0xff);
    gic.write_cpu(GICC_CTLR, 1);
}

/// Unmasks an interrupt at the distributor.
pub fn enable(irq: InterruptVector) {
    let n = irq.value() as usize;
    gic().write_distributor(GICD_ISENABLER + (n / 32) * 4, 1 << (n % 32));
}

/// Claims the highest-priority pending interrupt, if there is one.
pub fn acknowledge() -> Option<InterruptVector> {
    let id = gic().read_cpu(GICC_IAR) & 0x3ff;
    if id == SPURIOUS {
        None
    } else {
        Some(InterruptVector::new(id))
    }
}

/// Signals end-of-interrupt for a claimed interrupt.
pub fn complete(irq: InterruptVector) {
    gic().write_cpu(GICC_EOIR, irq.value());
}
