//! Interrupt dispatch.
//!
//! The exception stubs deliver every IRQ here with the interrupted context's
//! trap frame. The handler claims the interrupt from the GIC, services it,
//! and completes it; a timer tick may rewrite the frame with another
//! process's context on the way through.

#[cfg(target_arch = "arm")]
pub fn handle_irq(frame: &mut task::Context) {
    use crate::arch::{self, InterruptVector};

    let Some(irq) = arch::gic::acknowledge() else {
        // Spurious claims must not be completed.
        return;
    };

    match irq {
        InterruptVector::TIMER => {
            arch::timer::rearm();
            crate::sched::with(|kernel| kernel.timer_tick(frame));
        }
        other => log::warn!("unexpected interrupt: {}", other),
    }

    arch::gic::complete(irq);
}

#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents an interrupt vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct InterruptVector($storage);

        impl InterruptVector {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a new interrupt vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the interrupt vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the interrupt vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "InterruptVector::{}({})", name, self.0)
                } else {
                    write!(f, "InterruptVector({})", self.0)
                }
            }
        }

        impl core::fmt::Display for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    }
}
