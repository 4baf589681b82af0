use crate::config::{Config, RetentionPolicy};
use crate::page_mapper::{OsPageMapper, PageMapper};
use crate::registry::{TableId, TableRegistry};
use crate::table::{Slot, TrampolineTable};
use crate::template::{HostTemplate, StubTemplate};
use crate::Error;
use alloc::vec::Vec;
use core::ptr::NonNull;
use spin::{Mutex, Once};

/// A claimed trampoline: where to write the closure's configuration, and the code address
/// native callers invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureTrampoline {
    config: NonNull<u8>,
    code: NonNull<u8>,
}

// Safety: a trampoline is a pair of addresses, dereferencing them is up to the owner who
// synchronizes access to the configuration
unsafe impl Send for ClosureTrampoline {}
// Safety: see above
unsafe impl Sync for ClosureTrampoline {}

impl ClosureTrampoline {
    fn from_slot(slot: Slot) -> Self {
        Self {
            config: slot.config,
            code: slot.code,
        }
    }

    /// Start of the writable configuration region.
    #[inline]
    pub fn config(&self) -> NonNull<u8> {
        self.config
    }

    /// Entry point of the trampoline.
    #[inline]
    pub fn code(&self) -> NonNull<u8> {
        self.code
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub tables: usize,
    pub issued_slots: usize,
    pub free_slots: usize,
}

/// Hands out closure trampolines from a growing set of [`TrampolineTable`]s.
///
/// A single lock serializes acquiring and releasing, including table creation and teardown.
/// Invoking a trampoline never takes the lock: all stubs of a table are written and made
/// executable before the table becomes reachable.
pub struct TrampolineAllocator<M: PageMapper = OsPageMapper, T: StubTemplate = HostTemplate> {
    mapper: M,
    template: T,
    slots_per_table: usize,
    retention: RetentionPolicy,
    registry: Mutex<TableRegistry>,
}

impl TrampolineAllocator<OsPageMapper, HostTemplate> {
    /// An allocator mapping real pages with the host's built-in template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedArchitecture`] if there is no built-in template for the host.
    pub fn host() -> crate::Result<Self> {
        Self::new(OsPageMapper::new(), HostTemplate::new()?)
    }
}

impl<M, T> TrampolineAllocator<M, T>
where
    M: PageMapper,
    T: StubTemplate,
{
    /// # Errors
    ///
    /// Returns [`Error::InvalidSlotCount`] if not even one slot of `template` fits into a page.
    pub fn new(mapper: M, template: T) -> crate::Result<Self> {
        Self::with_config(mapper, template, &Config::default())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidSlotCount`] if the configured number of slots per table is zero or
    /// doesn't fit into a page, or if the template's slots are empty.
    pub fn with_config(mapper: M, template: T, config: &Config) -> crate::Result<Self> {
        let max = TrampolineTable::max_slots(mapper.page_size(), &template);
        let requested = config.slots_per_table.unwrap_or(max);
        if requested == 0 || requested > max {
            return Err(Error::InvalidSlotCount { requested, max });
        }

        Ok(Self {
            registry: Mutex::new(TableRegistry::new(mapper.page_size())),
            mapper,
            template,
            slots_per_table: requested,
            retention: config.retention,
        })
    }

    /// Claims a trampoline, mapping a new table if every existing one is full.
    ///
    /// The configuration region of the returned trampoline is zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if a new table was needed but its pages could not be mapped.
    pub fn acquire_closure_trampoline(&self) -> crate::Result<ClosureTrampoline> {
        let mut registry = self.registry.lock();

        let id = match registry.find_table_with_free_slot() {
            Some(id) => id,
            None => {
                let table =
                    TrampolineTable::create(&self.mapper, &self.template, self.slots_per_table)?;
                registry.insert(table)
            }
        };
        registry.move_to_front(id);

        let slot = registry.get_mut(id).acquire_slot();
        Ok(ClosureTrampoline::from_slot(slot))
    }

    /// Returns the trampoline whose entry point is `code`.
    ///
    /// # Panics
    ///
    /// Panics if `code` is not a trampoline currently issued by this allocator. Releasing twice
    /// is a bug in the caller.
    pub fn release_closure_trampoline(&self, code: NonNull<u8>) {
        let mut registry = self.registry.lock();

        let addr = code.as_ptr() as usize;
        let (id, index) = registry
            .owner_of_code(addr)
            .and_then(|id| Some((id, registry.get(id).slot_of_code(addr)?)))
            .unwrap_or_else(|| panic!("{code:p} is not a trampoline issued by this allocator"));

        let table = registry.get_mut(id);
        table.release_slot(index);

        if table.is_unused() {
            self.retire(&mut registry, id);
        } else if table.free_count() == 1 {
            // The table just left the full state, make it the first candidate for new slots.
            let displaced = registry.head();
            registry.move_to_front(id);
            if let Some(displaced) = displaced {
                if registry.get(displaced).is_unused() {
                    self.retire(&mut registry, displaced);
                }
            }
        }
    }

    /// Applies the retention policy to the fully free table `id`.
    fn retire(&self, registry: &mut TableRegistry, id: TableId) {
        debug_assert!(registry.get(id).is_unused());

        let keep = match self.retention {
            RetentionPolicy::KeepMostRecent => registry.head() == Some(id),
            RetentionPolicy::ReleaseImmediately => false,
        };

        if keep {
            tracing::debug!("retaining unused trampoline table {id:?}");
        } else {
            registry.remove(id).destroy(&self.mapper);
        }
    }

    /// Copies `blob` into the configuration region of `trampoline`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigTooLarge`] if `blob` is larger than a slot.
    ///
    /// # Panics
    ///
    /// Panics if `trampoline` is not currently issued by this allocator.
    pub fn configure(&self, trampoline: &ClosureTrampoline, blob: &[u8]) -> crate::Result<()> {
        let slot_size = self.template.slot_size();
        if blob.len() > slot_size {
            return Err(Error::ConfigTooLarge {
                len: blob.len(),
                slot_size,
            });
        }

        let registry = self.registry.lock();
        let addr = trampoline.code.as_ptr() as usize;
        let Some((table, index)) = registry.owner_of_code(addr).and_then(|id| {
            let table = registry.get(id);
            Some((table, table.slot_of_code(addr)?))
        }) else {
            panic!(
                "{:p} is not a trampoline issued by this allocator",
                trampoline.code
            )
        };

        table.write_config(index, blob);
        Ok(())
    }

    /// The entry point belonging to the configuration region at `config`, if that slot is
    /// currently issued.
    pub fn code_for_config(&self, config: NonNull<u8>) -> Option<NonNull<u8>> {
        let registry = self.registry.lock();
        let addr = config.as_ptr() as usize;
        let table = registry.get(registry.owner_of_config(addr)?);
        let index = table.slot_of_config(addr)?;
        table.is_issued(index).then(|| table.slot(index).code)
    }

    /// The configuration region belonging to the entry point `code`, if that slot is currently
    /// issued.
    pub fn config_for_code(&self, code: NonNull<u8>) -> Option<NonNull<u8>> {
        let registry = self.registry.lock();
        let addr = code.as_ptr() as usize;
        let table = registry.get(registry.owner_of_code(addr)?);
        let index = table.slot_of_code(addr)?;
        table.is_issued(index).then(|| table.slot(index).config)
    }

    /// Unmaps every table without issued slots, including a retained one. Returns the number of
    /// tables destroyed.
    pub fn trim(&self) -> usize {
        let mut registry = self.registry.lock();
        let unused: Vec<TableId> = registry
            .iter()
            .filter(|(_, table)| table.is_unused())
            .map(|(id, _)| id)
            .collect();

        for id in &unused {
            registry.remove(*id).destroy(&self.mapper);
        }
        tracing::debug!("trimmed {} unused trampoline tables", unused.len());
        unused.len()
    }

    pub fn stats(&self) -> AllocatorStats {
        let registry = self.registry.lock();
        registry
            .iter()
            .fold(AllocatorStats::default(), |mut stats, (_, table)| {
                stats.tables += 1;
                stats.issued_slots += table.issued();
                stats.free_slots += table.free_count();
                stats
            })
    }

    #[inline]
    pub fn slots_per_table(&self) -> usize {
        self.slots_per_table
    }

    #[inline]
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    pub fn template(&self) -> &T {
        &self.template
    }
}

impl<M: PageMapper, T: StubTemplate> Drop for TrampolineAllocator<M, T> {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        while let Some(id) = registry.head() {
            let table = registry.remove(id);
            if table.is_unused() {
                table.destroy(&self.mapper);
            } else {
                // Issued stubs may still be called, leak the pages rather than unmapping code
                // that is in use.
                tracing::warn!(
                    "leaking trampoline table with {} issued slots at {:p}",
                    table.issued(),
                    table.pages().code_base()
                );
            }
        }
    }
}

static GLOBAL: Once<crate::Result<TrampolineAllocator>> = Once::new();

fn global() -> crate::Result<&'static TrampolineAllocator> {
    GLOBAL
        .call_once(TrampolineAllocator::host)
        .as_ref()
        .map_err(Clone::clone)
}

/// Claims a trampoline from the process-wide allocator.
///
/// # Errors
///
/// Returns [`Error::UnsupportedArchitecture`] on hosts without a built-in template and
/// [`Error::Allocation`] when no pages could be mapped.
pub fn acquire_closure_trampoline() -> crate::Result<ClosureTrampoline> {
    global()?.acquire_closure_trampoline()
}

/// Returns a trampoline to the process-wide allocator.
///
/// # Panics
///
/// Panics if `code` was not issued by [`acquire_closure_trampoline`] or was already released.
pub fn release_closure_trampoline(code: NonNull<u8>) {
    match GLOBAL.get() {
        Some(Ok(allocator)) => allocator.release_closure_trampoline(code),
        _ => panic!("{code:p} is not a trampoline issued by this allocator"),
    }
}
