//! FerriteOS kernel library
//!
//! This library provides the core functionality of the FerriteOS kernel:
//! physical and virtual memory management, the process table and
//! round-robin scheduler, POSIX-like signals, anonymous pipes, a FAT32
//! volume layer, and the system-call dispatcher.
//!
//! The crate builds for two targets. On `x86_64-unknown-none` it is the
//! kernel proper, with the hardware layer (`arch`, `drivers`) compiled in
//! and `linked_list_allocator` as the global allocator. On the host the
//! hardware layer is compiled out and the core subsystems run against
//! simulated physical memory and a RAM block device, so `cargo test`
//! exercises them as ordinary tests.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can allocate and print normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global kernel heap allocator.
#[cfg(target_os = "none")]
pub fn allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod drivers;
#[cfg(target_os = "none")]
pub mod logger;

pub mod elf;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod syscall;

/// Host-side simulated machine backing the test suite.
#[cfg(not(target_os = "none"))]
pub mod sim;

pub use kernel::{Kernel, KernelConfig};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
