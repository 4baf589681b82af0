//! Instruction cache maintenance after writing code through a writable alias.

use core::sync::atomic::{fence, Ordering};

/// Makes `len` bytes written at `written` observable to instruction fetches from `executable`.
///
/// Both pointers refer to the same backing storage, possibly through different mappings.
pub(super) fn synchronize(written: *const u8, executable: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
            // x86 keeps the instruction cache coherent with stores, only the ordering of the
            // writes against the publication of the slot matters.
            let _ = (written, executable);
            fence(Ordering::SeqCst);
        } else if #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))] {
            extern "C" {
                fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
            }

            let _ = written;
            fence(Ordering::SeqCst);
            // Safety: the range is mapped and belongs to the caller
            unsafe { sys_icache_invalidate(executable.cast_mut().cast(), len) };
        } else if #[cfg(target_arch = "aarch64")] {
            fence(Ordering::SeqCst);
            // Safety: cache maintenance on a range mapped by the caller
            unsafe { aarch64::clean_and_invalidate(written, executable, len) };
        } else {
            let _ = (written, executable);
            fence(Ordering::SeqCst);
        }
    }
}

#[cfg(all(target_arch = "aarch64", not(target_vendor = "apple")))]
mod aarch64 {
    use core::arch::asm;

    /// Cleans the data cache for the written range to the point of unification, then invalidates
    /// the instruction cache for the executable range.
    pub(super) unsafe fn clean_and_invalidate(written: *const u8, executable: *const u8, len: usize) {
        let ctr: u64;
        asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));

        // CTR_EL0.DminLine and IminLine are log2 of the line size in words.
        let dline = 4_usize << ((ctr >> 16) & 0xf);
        let iline = 4_usize << (ctr & 0xf);

        let start = written as usize;
        let mut addr = start & !(dline - 1);
        while addr < start + len {
            asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += dline;
        }
        asm!("dsb ish", options(nostack, preserves_flags));

        let start = executable as usize;
        let mut addr = start & !(iline - 1);
        while addr < start + len {
            asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += iline;
        }
        asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }
}
