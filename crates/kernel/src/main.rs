#![cfg_attr(all(target_arch = "arm", not(test)), no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(all(target_arch = "arm", not(test)))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    vega_kernel::handle_panic(info)
}

// Host builds only run the library's unit tests; the binary is an empty
// shell there.
#[cfg(not(target_arch = "arm"))]
fn main() {}
