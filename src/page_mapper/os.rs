use crate::page_mapper::{PageMapper, PagePair};
use crate::Error;
use core::ffi::c_void;
use core::ptr;
use core::ptr::NonNull;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

/// How an [`OsPageMapper`] keeps the code page out of writable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStrategy {
    /// Both views are separate shared mappings of one memory file. The configuration half of
    /// the writable alias stays writable, its code half turns read-only once the pair is sealed.
    Aliased,
    /// A single anonymous mapping whose code page is written first and then flipped to
    /// read/execute. The configuration page doubles as the read-only window.
    Sealed,
}

impl MappingStrategy {
    /// The best strategy the host supports.
    pub fn host_default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
                Self::Aliased
            } else {
                Self::Sealed
            }
        }
    }
}

impl Default for MappingStrategy {
    fn default() -> Self {
        Self::host_default()
    }
}

/// Maps trampoline pages straight from the operating system.
#[derive(Debug, Clone)]
pub struct OsPageMapper {
    page_size: usize,
    strategy: MappingStrategy,
}

impl Default for OsPageMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl OsPageMapper {
    pub fn new() -> Self {
        Self::with_strategy(MappingStrategy::host_default())
    }

    pub fn with_strategy(strategy: MappingStrategy) -> Self {
        Self {
            page_size: crate::host_page_size(),
            strategy,
        }
    }

    pub fn strategy(&self) -> MappingStrategy {
        self.strategy
    }

    fn pair_len(&self) -> usize {
        2 * self.page_size
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn map_aliased(&self) -> crate::Result<PagePair> {
        use rustix::fs::MemfdFlags;

        let len = self.pair_len();
        let page_offset = u64::try_from(self.page_size).expect("page size too big for u64");

        let fd = rustix::fs::memfd_create(c"closure-trampolines", MemfdFlags::CLOEXEC)
            .map_err(Error::allocation("create backing for"))?;
        rustix::fs::ftruncate(&fd, 2 * page_offset).map_err(Error::allocation("size backing for"))?;

        // Safety: fresh shared mapping, the kernel picks the address
        let writable = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(Error::allocation("map writable alias of"))?;

        // Reserve the window first so both halves land next to each other.
        // Safety: fresh inaccessible mapping, the kernel picks the address
        let window = match unsafe {
            rustix::mm::mmap_anonymous(ptr::null_mut(), len, ProtFlags::empty(), MapFlags::PRIVATE)
        } {
            Ok(window) => window,
            Err(errno) => {
                // Safety: we just created this mapping and nothing refers to it
                unsafe { unmap_quietly(writable, len) };
                return Err(Error::Allocation {
                    op: "reserve executable window for",
                    errno,
                });
            }
        };

        // Safety: both fixed mappings replace parts of the reservation made above
        let res = unsafe {
            rustix::mm::mmap(
                window,
                self.page_size,
                ProtFlags::READ,
                MapFlags::SHARED | MapFlags::FIXED,
                &fd,
                0,
            )
            .and_then(|_| {
                rustix::mm::mmap(
                    window.cast::<u8>().add(self.page_size).cast(),
                    self.page_size,
                    ProtFlags::READ | ProtFlags::EXEC,
                    MapFlags::SHARED | MapFlags::FIXED,
                    &fd,
                    page_offset,
                )
            })
        };

        if let Err(errno) = res {
            // Safety: both mappings were created above and nothing refers to them
            unsafe {
                unmap_quietly(window, len);
                unmap_quietly(writable, len);
            }
            return Err(Error::Allocation {
                op: "map executable alias of",
                errno,
            });
        }

        // The mappings keep the memory file alive, the descriptor itself is closed here.
        drop(fd);

        // Safety: both views are valid for two pages and alias the same memory file
        Ok(unsafe { PagePair::from_raw_parts(non_null(writable), non_null(window), self.page_size) })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    fn map_aliased(&self) -> crate::Result<PagePair> {
        Err(Error::Allocation {
            op: "alias",
            errno: rustix::io::Errno::NOSYS,
        })
    }

    fn map_sealed(&self) -> crate::Result<PagePair> {
        let len = self.pair_len();

        // Safety: fresh private mapping, the kernel picks the address
        let region = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(Error::allocation("map"))?;

        let region = non_null(region);
        // Safety: the region is valid for two pages, the window is the region itself
        Ok(unsafe { PagePair::from_raw_parts(region, region, self.page_size) })
    }
}

impl PageMapper for OsPageMapper {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn create_page_pair(&self) -> crate::Result<PagePair> {
        let pair = match self.strategy {
            MappingStrategy::Aliased => self.map_aliased()?,
            MappingStrategy::Sealed => self.map_sealed()?,
        };

        tracing::trace!(
            "mapped trampoline pages, config {:p} code {:p} ({:?})",
            pair.config_base(),
            pair.code_base(),
            self.strategy
        );

        Ok(pair)
    }

    fn destroy_page_pair(&self, pair: PagePair) {
        let len = self.pair_len();

        // Safety: the pair owned these mappings and is consumed here
        unsafe {
            rustix::mm::munmap(pair.window_base().as_ptr().cast(), len).expect("munmap failed");
            if pair.is_aliased() {
                rustix::mm::munmap(pair.writable_base().as_ptr().cast(), len)
                    .expect("munmap failed");
            }
        }
    }

    fn make_executable(&self, pair: &mut PagePair) -> crate::Result<()> {
        let (code, flags) = if pair.is_aliased() {
            // The window is executable already, only the writable alias of the code needs to go.
            (pair.writable_base(), MprotectFlags::READ)
        } else {
            (pair.window_base(), MprotectFlags::READ | MprotectFlags::EXEC)
        };

        // Safety: the code page belongs to the pair and no stub has been handed out yet
        unsafe {
            rustix::mm::mprotect(
                code.as_ptr().add(self.page_size).cast(),
                self.page_size,
                flags,
            )
        }
        .map_err(Error::allocation("seal"))?;

        pair.seal();
        Ok(())
    }
}

fn non_null(ptr: *mut c_void) -> NonNull<u8> {
    NonNull::new(ptr.cast()).expect("mmap returned a null mapping")
}

unsafe fn unmap_quietly(ptr: *mut c_void, len: usize) {
    if let Err(errno) = rustix::mm::munmap(ptr, len) {
        tracing::warn!("failed to roll back partial trampoline mapping at {ptr:p}: {errno}");
    }
}
