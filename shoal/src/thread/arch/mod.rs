//! Architecture-specific context switching.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::{SavedRegs, init_context, switch_context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::{SavedRegs, init_context, switch_context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("user-level threads are implemented for x86_64 and aarch64 only");
