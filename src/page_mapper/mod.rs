//! Paired page mappings and the operating system primitives behind them.
//!
//! A [`PagePair`] spans two pages of backing storage. Backing page 0 holds the per-slot
//! configuration, backing page 1 the code stubs. The pair is reachable through two views:
//!
//! - the *writable alias*, both backing pages mapped read/write until the pair is made
//!   executable, after which only the configuration page stays writable,
//! - the *executable window*, backing page 0 mapped read-only directly followed by backing page
//!   1 mapped read/execute.
//!
//! All raw memory access of the crate happens in this module.

mod heap;
mod icache;
mod os;

pub use heap::HeapPageMapper;
pub use os::{MappingStrategy, OsPageMapper};

use core::ops::Range;
use core::ptr::NonNull;
use core::{fmt, ptr};

/// Operating system facing half of the trampoline allocator.
///
/// Implementations hand out [`PagePair`]s and tear them down again, everything above this trait
/// is ordinary data structure bookkeeping.
pub trait PageMapper: Send + Sync {
    /// Size of a single page of a pair. Always a power of two.
    fn page_size(&self) -> usize;

    /// Maps a fresh page pair with zeroed contents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`](crate::Error::Allocation) when the pages can't be reserved,
    /// aliased or protected. Mappings established during the failed attempt are released before
    /// returning.
    fn create_page_pair(&self) -> crate::Result<PagePair>;

    /// Unmaps both views of `pair`.
    ///
    /// Addresses previously derived from the pair dangle afterwards, callers must make sure none
    /// of them are still in use.
    fn destroy_page_pair(&self, pair: PagePair);

    /// Finishes a pair once all of its stubs have been written. No code is written into the pair
    /// afterward.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`](crate::Error::Allocation) when the code page can't be made
    /// executable.
    fn make_executable(&self, pair: &mut PagePair) -> crate::Result<()>;

    /// Makes code written to `range` of the code page visible to instruction fetches through the
    /// executable window.
    fn synchronize_code(&self, pair: &PagePair, range: Range<usize>) {
        icache::synchronize(
            pair.writable_code().as_ptr().wrapping_add(range.start),
            pair.code_base().as_ptr().wrapping_add(range.start),
            range.len(),
        );
    }

    /// Writes `bytes` at `offset` into the code page through the writable alias and synchronizes
    /// the instruction stream.
    ///
    /// # Panics
    ///
    /// Panics if the pair has already been made executable or the write is out of bounds.
    fn write_stub(&self, pair: &PagePair, offset: usize, bytes: &[u8]) {
        pair.write_code(offset, bytes);
        self.synchronize_code(pair, offset..offset + bytes.len());
    }
}

impl<M: PageMapper + ?Sized> PageMapper for &M {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn create_page_pair(&self) -> crate::Result<PagePair> {
        (**self).create_page_pair()
    }

    fn destroy_page_pair(&self, pair: PagePair) {
        (**self).destroy_page_pair(pair);
    }

    fn make_executable(&self, pair: &mut PagePair) -> crate::Result<()> {
        (**self).make_executable(pair)
    }

    fn synchronize_code(&self, pair: &PagePair, range: Range<usize>) {
        (**self).synchronize_code(pair, range);
    }

    fn write_stub(&self, pair: &PagePair, offset: usize, bytes: &[u8]) {
        (**self).write_stub(pair, offset, bytes);
    }
}

pub struct PagePair {
    /// Start of the writable alias, two pages long.
    writable: NonNull<u8>,
    /// Start of the executable window, two pages long.
    window: NonNull<u8>,
    page_size: usize,
    sealed: bool,
}

// Safety: the pair exclusively owns its mappings, the raw pointers are never shared with
// thread-local state.
unsafe impl Send for PagePair {}

impl PagePair {
    /// # Safety
    ///
    /// `writable` must be valid for reads and writes of `2 * page_size` bytes, and `window` valid
    /// for reads of `2 * page_size` bytes, both for as long as the returned pair is alive. Both
    /// views must present the same backing storage, which may be the very same mapping.
    pub unsafe fn from_raw_parts(
        writable: NonNull<u8>,
        window: NonNull<u8>,
        page_size: usize,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            writable,
            window,
            page_size,
            sealed: false,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start of the configuration page in the writable alias.
    #[inline]
    pub fn config_base(&self) -> NonNull<u8> {
        self.writable
    }

    /// Start of the executable code page.
    #[inline]
    pub fn code_base(&self) -> NonNull<u8> {
        // Safety: the window is two pages long
        unsafe { self.window.add(self.page_size) }
    }

    /// Start of the executable window, the read-only alias of the configuration page.
    #[inline]
    pub fn window_base(&self) -> NonNull<u8> {
        self.window
    }

    #[inline]
    pub fn writable_base(&self) -> NonNull<u8> {
        self.writable
    }

    /// Whether the writable and the executable view are separate mappings.
    #[inline]
    pub fn is_aliased(&self) -> bool {
        self.writable != self.window
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self) {
        debug_assert!(!self.sealed);
        self.sealed = true;
    }

    fn writable_code(&self) -> NonNull<u8> {
        // Safety: the writable alias is two pages long
        unsafe { self.writable.add(self.page_size) }
    }

    fn check_range(&self, offset: usize, len: usize) -> Range<usize> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.page_size)
            .unwrap_or_else(|| {
                panic!(
                    "access of {len} bytes at offset {offset:#x} exceeds page size {:#x}",
                    self.page_size
                )
            });
        offset..end
    }

    /// Copies `bytes` into the configuration page at `offset`.
    pub(crate) fn write_config(&self, offset: usize, bytes: &[u8]) {
        let range = self.check_range(offset, bytes.len());
        // Safety: range is within the writable configuration page
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.writable.as_ptr().add(range.start),
                range.len(),
            );
        }
    }

    /// Fills `range` of the configuration page with `byte`.
    pub(crate) fn fill_config(&self, range: Range<usize>, byte: u8) {
        let range = self.check_range(range.start, range.len());
        // Safety: range is within the writable configuration page
        unsafe {
            ptr::write_bytes(self.writable.as_ptr().add(range.start), byte, range.len());
        }
    }

    fn write_code(&self, offset: usize, bytes: &[u8]) {
        assert!(
            !self.sealed,
            "attempted to write code into a page pair that is already executable"
        );
        let range = self.check_range(offset, bytes.len());
        // Safety: range is within the code page of the writable alias, which is still writable
        // because the pair is not sealed
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.writable_code().as_ptr().add(range.start),
                range.len(),
            );
        }
    }

    /// Reads the configuration page at `offset` through the executable window, the way a stub
    /// sees it.
    pub fn read_config_alias(&self, offset: usize, out: &mut [u8]) {
        let range = self.check_range(offset, out.len());
        // Safety: range is within the readable window
        unsafe {
            ptr::copy_nonoverlapping(
                self.window.as_ptr().add(range.start),
                out.as_mut_ptr(),
                range.len(),
            );
        }
    }

    /// Reads code bytes at `offset` through the executable window.
    pub fn read_code(&self, offset: usize, out: &mut [u8]) {
        let range = self.check_range(offset, out.len());
        // Safety: range is within the readable code page of the window
        unsafe {
            ptr::copy_nonoverlapping(
                self.code_base().as_ptr().add(range.start),
                out.as_mut_ptr(),
                range.len(),
            );
        }
    }

    /// Whether `addr` lies within the executable code page.
    pub fn contains_code(&self, addr: usize) -> bool {
        let base = self.code_base().as_ptr() as usize;
        (base..base + self.page_size).contains(&addr)
    }

    /// Whether `addr` lies within the writable configuration page.
    pub fn contains_config(&self, addr: usize) -> bool {
        let base = self.config_base().as_ptr() as usize;
        (base..base + self.page_size).contains(&addr)
    }
}

impl fmt::Debug for PagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePair")
            .field("writable", &self.writable)
            .field("window", &self.window)
            .field("page_size", &self.page_size)
            .field("sealed", &self.sealed)
            .finish()
    }
}
