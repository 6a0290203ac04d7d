#![no_std]

extern crate alloc;

pub mod block_device;
pub mod card;
pub mod command;
pub mod config;
pub mod error;
pub mod host_adapter;
pub mod init;
pub mod osa;
pub mod registers;
pub mod transfer_engine;

use alloc::{format, vec::Vec};
use log::error;

use core::time::Duration;

/// Host-supplied delay primitive, injected via [`set_impl`].
///
/// Mirrors the corpus's external-sleep-hook pattern: the core never links
/// against a concrete timer or scheduler, so the integrator implements
/// [`Kernel::sleep`] and wires it in once with `set_impl!`.
pub trait Kernel {
    /// Block the calling context for at least `duration`.
    fn sleep(duration: Duration);
}

pub(crate) fn mci_sleep(duration: Duration) {
    unsafe extern "Rust" {
        fn _phytium_mci_sleep(duration: Duration);
    }

    unsafe {
        _phytium_mci_sleep(duration);
    }
}

/// Wire a [`Kernel`] implementation into the core's sleep hook.
///
/// Call once, at the integration crate's root, with the concrete type that
/// implements [`Kernel`].
#[macro_export]
macro_rules! set_impl {
    ($t: ty) => {
        #[unsafe(no_mangle)]
        unsafe fn _phytium_mci_sleep(duration: core::time::Duration) {
            <$t as $crate::Kernel>::sleep(duration)
        }
    };
}

/// Dump a region of memory as 32-bit words, 8 per line, via `log::error!`.
///
/// Diagnostic passthrough for the coredump/ioctl facade; not used by any
/// control-flow path in the core itself.
pub unsafe fn dump_memory_region(addr: usize, size: usize) {
    let start_ptr: *const u32 = addr as *const u32;
    let word_count = size / 4;

    error!("Memory dump from 0x{addr:08x}:");

    for chunk_start in (0..word_count).step_by(8) {
        let mut values = Vec::new();
        let chunk_end = (chunk_start + 8).min(word_count);

        for i in chunk_start..chunk_end {
            let value = unsafe { *start_ptr.add(i) };
            values.push(format!("{value:08x}"));
        }

        error!("  0x{:08x}: [{}]", addr + chunk_start * 4, values.join(" "));
    }
}
