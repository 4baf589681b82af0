use crate::page_mapper::{PageMapper, PagePair};
use crate::Error;
use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use rustix::io::Errno;

/// A [`PageMapper`] backed by ordinary heap allocations.
///
/// Nothing it maps is executable, but the layout and the aliasing of the two views match the real
/// thing, so table and registry behavior can be exercised anywhere. The mapper also keeps count
/// of live pairs which makes leaks and premature teardowns observable.
#[derive(Debug)]
pub struct HeapPageMapper {
    page_size: usize,
    max_pairs: usize,
    live: AtomicUsize,
    created: AtomicUsize,
    refuse_executable: AtomicBool,
}

impl HeapPageMapper {
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn new(page_size: usize) -> Self {
        Self::with_limit(page_size, usize::MAX)
    }

    /// Creates a mapper that fails with `ENOMEM` once `max_pairs` pairs are live.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn with_limit(page_size: usize, max_pairs: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size {page_size} is not a power of two"
        );
        Self {
            page_size,
            max_pairs,
            live: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            refuse_executable: AtomicBool::new(false),
        }
    }

    /// Makes every following [`make_executable`](PageMapper::make_executable) fail with `EACCES`,
    /// the way a sandbox forbidding executable mappings would.
    pub fn refuse_executable(&self, refuse: bool) {
        self.refuse_executable.store(refuse, Ordering::Release);
    }

    /// Number of pairs created but not yet destroyed.
    pub fn live_pairs(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of pairs created over the lifetime of the mapper.
    pub fn pairs_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(2 * self.page_size, self.page_size)
            .expect("page pair layout overflows")
    }
}

impl PageMapper for HeapPageMapper {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn create_page_pair(&self) -> crate::Result<PagePair> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_pairs).then_some(live + 1)
            })
            .map_err(|_| Error::Allocation {
                op: "allocate",
                errno: Errno::NOMEM,
            })?;

        // Safety: the layout is non-zero sized
        let ptr = NonNull::new(unsafe { alloc_zeroed(self.layout()) });
        let Some(ptr) = ptr else {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Allocation {
                op: "allocate",
                errno: Errno::NOMEM,
            });
        };
        self.created.fetch_add(1, Ordering::AcqRel);

        // Safety: the allocation covers both pages and serves as both views
        Ok(unsafe { PagePair::from_raw_parts(ptr, ptr, self.page_size) })
    }

    fn destroy_page_pair(&self, pair: PagePair) {
        debug_assert_eq!(pair.page_size(), self.page_size);
        // Safety: the pair was allocated by `create_page_pair` with the same layout
        unsafe { dealloc(pair.writable_base().as_ptr(), self.layout()) };
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn make_executable(&self, pair: &mut PagePair) -> crate::Result<()> {
        if self.refuse_executable.load(Ordering::Acquire) {
            return Err(Error::Allocation {
                op: "seal",
                errno: Errno::ACCESS,
            });
        }
        pair.seal();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn counts_pairs() {
        let mapper = HeapPageMapper::new(128);
        let a = mapper.create_page_pair().unwrap();
        let b = mapper.create_page_pair().unwrap();
        assert_eq!(mapper.live_pairs(), 2);
        assert_eq!(a.config_base().as_ptr() as usize % 128, 0);
        assert_eq!(a.code_base().as_ptr() as usize % 128, 0);

        mapper.destroy_page_pair(a);
        mapper.destroy_page_pair(b);
        assert_eq!(mapper.live_pairs(), 0);
        assert_eq!(mapper.pairs_created(), 2);
    }

    #[test_log::test]
    fn limit_reports_allocation_error() {
        let mapper = HeapPageMapper::with_limit(128, 1);
        let pair = mapper.create_page_pair().unwrap();

        let err = mapper.create_page_pair().unwrap_err();
        assert!(matches!(err, Error::Allocation { errno, .. } if errno == Errno::NOMEM));

        mapper.destroy_page_pair(pair);
        mapper.create_page_pair().map(|p| mapper.destroy_page_pair(p)).unwrap();
    }

    #[test_log::test]
    fn refused_sealing_leaves_the_pair_writable() {
        let mapper = HeapPageMapper::new(128);
        let mut pair = mapper.create_page_pair().unwrap();

        mapper.refuse_executable(true);
        let err = mapper.make_executable(&mut pair).unwrap_err();
        assert!(matches!(err, Error::Allocation { errno, .. } if errno == Errno::ACCESS));
        assert!(!pair.is_sealed());

        mapper.refuse_executable(false);
        mapper.make_executable(&mut pair).unwrap();
        assert!(pair.is_sealed());
        mapper.destroy_page_pair(pair);
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn rejects_odd_page_sizes() {
        HeapPageMapper::new(100);
    }
}
