//! The context primitive: one implementation per CPU architecture, all
//! exposing the same narrow surface — a fixed-layout [`RegisterFile`] plus
//! `capture`, `install`, `swap` and `initialize`. Everything above this
//! module is ordinary portable code.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(super) use x86_64::{capture, initialize, install, swap, RegisterFile};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(super) use aarch64::{capture, initialize, install, swap, RegisterFile};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("stackling only supports x86_64 and aarch64");
