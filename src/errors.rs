use rustix::io::Errno;
use target_lexicon::Architecture;

#[derive(onlyerror::Error, Debug, Clone)]
pub enum Error {
    /// The operating system refused to reserve, alias or protect trampoline pages.
    ///
    /// This is an environmental failure (resource exhaustion, sandbox policy) and is surfaced
    /// to the caller unchanged, nothing is retried.
    #[error("failed to {op} trampoline pages: {errno}")]
    Allocation {
        /// The mapping step that failed.
        op: &'static str,
        /// The error reported by the operating system.
        errno: Errno,
    },
    /// The requested number of slots per table does not fit into a single page.
    #[error("cannot carve {requested} trampoline slots out of a page holding at most {max}")]
    InvalidSlotCount { requested: usize, max: usize },
    /// A configuration blob is larger than the slot it is written into.
    #[error("configuration blob of {len} bytes does not fit into a {slot_size} byte slot")]
    ConfigTooLarge { len: usize, slot_size: usize },
    /// There is no built-in stub template for this architecture.
    #[error("no trampoline template is available for {arch}")]
    UnsupportedArchitecture { arch: Architecture },
}

impl Error {
    pub(crate) fn allocation(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| Self::Allocation { op, errno }
    }
}
