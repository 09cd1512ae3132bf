//! PL011 UART driver backing the serial console.

use vmm::VirtualAddress;

use crate::console::Console;

const DR: usize = 0x00;
const FR: usize = 0x18;
const LCR_H: usize = 0x2c;
const CR: usize = 0x30;

/// Transmit FIFO full.
const FR_TXFF: u32 = 1 << 5;
/// Enable FIFOs, 8-bit words.
const LCR_H_FEN_WLEN8: u32 = 0x70;
/// UART enable plus both directions.
const CR_ENABLE: u32 = 0x301;

pub struct SerialWriter {
    base: VirtualAddress,
}

impl SerialWriter {
    /// # Safety
    ///
    /// `base` must be a device mapping of a PL011 register block.
    pub unsafe fn new(base: VirtualAddress) -> Self {
        Self { base }
    }

    fn register(&self, offset: usize) -> *mut u32 {
        VirtualAddress::new(self.base.as_usize() + offset).as_mut_ptr()
    }

    fn enable(&mut self) {
        // SAFETY: the constructor contract makes these PL011 registers.
        unsafe {
            core::ptr::write_volatile(self.register(LCR_H), LCR_H_FEN_WLEN8);
            core::ptr::write_volatile(self.register(CR), CR_ENABLE);
        }
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: the constructor contract makes these PL011 registers.
        unsafe {
            while core::ptr::read_volatile(self.register(FR)) & FR_TXFF != 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile(self.register(DR), byte as u32);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

pub fn init(console: &Console, base: VirtualAddress) {
    // SAFETY: callers pass the device mapping established for the board UART.
    let mut port = unsafe { SerialWriter::new(base) };
    port.enable();
    console.attach_serial(port);
}
