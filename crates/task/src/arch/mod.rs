//! Interrupt masking.
//!
//! On the target this drives the CPSR I bit. Everywhere else (host builds
//! and unit tests) a software model tracks the nesting depth instead, so
//! tests can assert that critical sections are balanced.

#[cfg(target_arch = "arm")]
mod armv7a;
#[cfg(all(target_arch = "arm", not(test)))]
pub use armv7a::*;

#[cfg(any(not(target_arch = "arm"), test))]
mod software;
#[cfg(any(not(target_arch = "arm"), test))]
pub use software::*;
