//! Built-in user programs.
//!
//! The programs are hand-assembled ARM flat binaries in the loader's image
//! format, linked into the kernel and registered at boot. Each one is a few
//! instructions exercising a different slice of the system call surface.

use task::Kernel;

/// write(1, "hello from user\n", 16), then exit(0).
#[rustfmt::skip]
static HELLO: [u8; 68] = [
    b'V', b'I', b'M', b'G',     // magic
    0x00, 0x00, 0x00, 0x00,     // entry offset
    0x30, 0x00, 0x00, 0x00,     // text size
    0x00, 0x00, 0x00, 0x00,     // data size
    0x00, 0x00, 0x00, 0x00,     // bss size
    0x01, 0x00, 0xa0, 0xe3,     // mov  r0, #1
    0x14, 0x10, 0x8f, 0xe2,     // add  r1, pc, #20   @ r1 = message
    0x10, 0x20, 0xa0, 0xe3,     // mov  r2, #16
    0x01, 0x70, 0xa0, 0xe3,     // mov  r7, #1        @ write
    0x00, 0x00, 0x00, 0xef,     // svc  #0
    0x00, 0x00, 0xa0, 0xe3,     // mov  r0, #0
    0x00, 0x70, 0xa0, 0xe3,     // mov  r7, #0        @ exit
    0x00, 0x00, 0x00, 0xef,     // svc  #0
    b'h', b'e', b'l', b'l',     // message
    b'o', b' ', b'f', b'r',
    b'o', b'm', b' ', b'u',
    b's', b'e', b'r', b'\n',
];

/// Yields the CPU eight times, then exit(0).
#[rustfmt::skip]
static YIELDER: [u8; 52] = [
    b'V', b'I', b'M', b'G',     // magic
    0x00, 0x00, 0x00, 0x00,     // entry offset
    0x20, 0x00, 0x00, 0x00,     // text size
    0x00, 0x00, 0x00, 0x00,     // data size
    0x00, 0x00, 0x00, 0x00,     // bss size
    0x08, 0x40, 0xa0, 0xe3,     // mov  r4, #8
    0x02, 0x70, 0xa0, 0xe3,     // mov  r7, #2        @ yield
    0x00, 0x00, 0x00, 0xef,     // svc  #0
    0x01, 0x40, 0x54, 0xe2,     // subs r4, r4, #1
    0xfb, 0xff, 0xff, 0x1a,     // bne  .-12
    0x00, 0x00, 0xa0, 0xe3,     // mov  r0, #0
    0x00, 0x70, 0xa0, 0xe3,     // mov  r7, #0        @ exit
    0x00, 0x00, 0x00, 0xef,     // svc  #0
];

/// spawn("hello", 5), wait for the child to exit, then exit(0).
#[rustfmt::skip]
static CHAIN: [u8; 61] = [
    b'V', b'I', b'M', b'G',     // magic
    0x00, 0x00, 0x00, 0x00,     // entry offset
    0x29, 0x00, 0x00, 0x00,     // text size
    0x00, 0x00, 0x00, 0x00,     // data size
    0x00, 0x00, 0x00, 0x00,     // bss size
    0x1c, 0x00, 0x8f, 0xe2,     // add  r0, pc, #28   @ r0 = name
    0x05, 0x10, 0xa0, 0xe3,     // mov  r1, #5
    0x04, 0x70, 0xa0, 0xe3,     // mov  r7, #4        @ spawn, pid into r0
    0x00, 0x00, 0x00, 0xef,     // svc  #0
    0x05, 0x70, 0xa0, 0xe3,     // mov  r7, #5        @ wait_for_exit
    0x00, 0x00, 0x00, 0xef,     // svc  #0
    0x00, 0x00, 0xa0, 0xe3,     // mov  r0, #0
    0x00, 0x70, 0xa0, 0xe3,     // mov  r7, #0        @ exit
    0x00, 0x00, 0x00, 0xef,     // svc  #0
    b'h', b'e', b'l', b'l',     // name
    b'o',
];

/// Registers every built-in image. The binaries above are fixed at build
/// time, so a registration failure is a kernel bug.
pub fn register_all(kernel: &mut Kernel) {
    for (name, bytes) in [
        ("hello", &HELLO[..]),
        ("yielder", &YIELDER[..]),
        ("chain", &CHAIN[..]),
    ] {
        kernel
            .images_mut()
            .register(name, bytes)
            .expect("built-in image must be valid");
    }
}
