//! Allocation of executable closure trampolines on hosts that enforce write-xor-execute.
//!
//! Trampolines are handed out from *tables*. Every table owns one pair of pages that alias the
//! same slot layout: a writable configuration page, where callers store per-closure context,
//! and an executable page holding one code stub per slot. A stub finds its configuration at a
//! fixed distance of one page below itself, so no page ever has to be writable and executable
//! at the same time.
//!
//! ```text
//!  writable alias            executable window
//! +----------------+        +----------------+
//! | config page RW | <====> | config page R  |   <- stub reads `code - page_size`
//! +----------------+        +----------------+
//! |  code page RW  | <====> |  code page RX  |   <- `ClosureTrampoline::code`
//! +----------------+        +----------------+
//! ```
#![cfg_attr(feature = "no_std", no_std)]

extern crate alloc;
extern crate core;

mod allocator;
mod config;
mod errors;
pub mod page_mapper;
mod registry;
mod table;
pub mod template;

pub use allocator::{
    acquire_closure_trampoline, release_closure_trampoline, AllocatorStats, ClosureTrampoline,
    TrampolineAllocator,
};
pub use config::{Config, RetentionPolicy};
pub use errors::Error;
pub use page_mapper::{HeapPageMapper, MappingStrategy, OsPageMapper, PageMapper, PagePair};
pub use registry::{TableId, TableRegistry};
pub use table::{Slot, TrampolineTable};
pub use template::{HostTemplate, StubTemplate};

pub type Result<T> = core::result::Result<T, Error>;

/***************** Settings *******************************************/
/// Size in bytes of a slot for the built-in host templates. The configuration region of a slot
/// is the same size: a context word followed by the dispatcher address.
pub const HOST_SLOT_SIZE: usize = 16;
/// Upper bound for the number of slots a single table can track, slot indices are `u16`.
pub const MAX_SLOTS_PER_TABLE: usize = 0xffff;
/// Size of the scratch buffer stubs are emitted into before being copied into a table.
/// Templates with larger slots spill onto the heap.
pub const INLINE_STUB_SIZE: usize = 32;

/// Returns the host page size in bytes.
///
/// # Panics
///
/// Panics if the operating system reports a negative page size.
pub fn host_page_size() -> usize {
    // Safety: syscall
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).expect("host page size too big for usize")
}
