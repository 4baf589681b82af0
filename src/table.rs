use crate::page_mapper::{PageMapper, PagePair};
use crate::registry::TableId;
use crate::template::StubTemplate;
use crate::{INLINE_STUB_SIZE, MAX_SLOTS_PER_TABLE};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::{fmt, iter};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Issued,
}

/// A slot claimed from a [`TrampolineTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub index: u16,
    /// Start of the slot's configuration region in the writable alias.
    pub config: NonNull<u8>,
    /// Start of the slot's stub in the executable page.
    pub code: NonNull<u8>,
}

/// One page pair carved into equally sized trampoline slots.
///
/// Free slots are tracked by a stack of slot indices whose capacity is reserved up front, so
/// neither claiming nor releasing a slot allocates. The stack makes reuse LIFO: the slot
/// released last is handed out next.
pub struct TrampolineTable {
    pages: PagePair,
    /// Offset of the first slot, both in the configuration and in the code page.
    segment_offset: usize,
    slot_size: usize,
    free_list: Vec<u16>,
    pool: Box<[SlotState]>,

    pub(crate) prev: Option<TableId>,
    pub(crate) next: Option<TableId>,
}

impl TrampolineTable {
    /// Offset of the first slot for pages filled from `template`.
    ///
    /// # Panics
    ///
    /// Panics if the template's slot size is zero.
    pub fn segment_offset_for<T: StubTemplate + ?Sized>(template: &T) -> usize {
        let slot_size = template.slot_size();
        assert_ne!(slot_size, 0, "trampoline slots must not be empty");
        template.preamble().len().div_ceil(slot_size) * slot_size
    }

    /// The largest number of slots a table built from `template` can hold. Zero if the template
    /// has empty slots.
    pub fn max_slots<T: StubTemplate + ?Sized>(page_size: usize, template: &T) -> usize {
        if template.slot_size() == 0 {
            return 0;
        }
        let usable = page_size.saturating_sub(Self::segment_offset_for(template));
        (usable / template.slot_size()).min(MAX_SLOTS_PER_TABLE)
    }

    /// Maps a page pair, fills all `slot_count` slots with stubs from `template` and makes the
    /// code executable. The returned table is fully free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`](crate::Error::Allocation) when the pages can't be mapped or
    /// made executable. No mapping outlives a failed call.
    ///
    /// # Panics
    ///
    /// Panics if `slot_count` is zero or exceeds [`Self::max_slots`].
    #[tracing::instrument(level = "debug", skip(mapper, template))]
    pub fn create<M, T>(mapper: &M, template: &T, slot_count: usize) -> crate::Result<Self>
    where
        M: PageMapper + ?Sized,
        T: StubTemplate + ?Sized,
    {
        let max = Self::max_slots(mapper.page_size(), template);
        assert!(
            slot_count > 0 && slot_count <= max,
            "cannot fit {slot_count} trampoline slots into a table holding at most {max}"
        );

        let slot_size = template.slot_size();
        let segment_offset = Self::segment_offset_for(template);

        let mut pages = mapper.create_page_pair()?;
        if let Err(err) = Self::write_stubs(mapper, template, &mut pages, segment_offset, slot_count)
        {
            mapper.destroy_page_pair(pages);
            return Err(err);
        }

        let mut free_list = Vec::with_capacity(slot_count);
        free_list.extend((0..slot_count).rev().map(|index| {
            u16::try_from(index).expect("slot count exceeds u16 slot indices")
        }));

        tracing::debug!(
            "created trampoline table with {slot_count} slots at {:p}",
            pages.code_base()
        );

        Ok(Self {
            pages,
            segment_offset,
            slot_size,
            free_list,
            pool: vec![SlotState::Free; slot_count].into_boxed_slice(),
            prev: None,
            next: None,
        })
    }

    fn write_stubs<M, T>(
        mapper: &M,
        template: &T,
        pages: &mut PagePair,
        segment_offset: usize,
        slot_count: usize,
    ) -> crate::Result<()>
    where
        M: PageMapper + ?Sized,
        T: StubTemplate + ?Sized,
    {
        let preamble = template.preamble();
        if !preamble.is_empty() {
            mapper.write_stub(pages, 0, preamble);
        }

        let slot_size = template.slot_size();
        let mut stub: SmallVec<[u8; INLINE_STUB_SIZE]> = iter::repeat(0).take(slot_size).collect();
        for index in 0..slot_count {
            let offset = segment_offset + index * slot_size;
            stub.fill(0);
            template.emit(&mut stub, offset, mapper.page_size());
            mapper.write_stub(pages, offset, &stub);
        }

        mapper.make_executable(pages)
    }

    /// Claims the most recently released slot and zeroes its configuration.
    ///
    /// # Panics
    ///
    /// Panics if the table has no free slots.
    pub fn acquire_slot(&mut self) -> Slot {
        let Some(index) = self.free_list.pop() else {
            panic!("acquired a slot from a trampoline table with no free slots")
        };

        let state = &mut self.pool[usize::from(index)];
        debug_assert_eq!(*state, SlotState::Free);
        *state = SlotState::Issued;

        let offset = self.slot_offset(index);
        self.pages.fill_config(offset..offset + self.slot_size, 0);

        let slot = self.slot(index);
        tracing::trace!("acquired trampoline slot {index} at {:p}", slot.code);
        slot
    }

    /// Returns `index` to the free list, wiping its configuration so late callers can't pick up
    /// a stale context.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or not currently issued.
    pub fn release_slot(&mut self, index: u16) {
        let state = self.pool.get_mut(usize::from(index));
        assert!(
            state.as_deref() == Some(&SlotState::Issued),
            "released trampoline slot {index} which is not issued"
        );
        if let Some(state) = state {
            *state = SlotState::Free;
        }

        let offset = self.slot_offset(index);
        self.pages.fill_config(offset..offset + self.slot_size, 0);

        debug_assert!(self.free_list.len() < self.free_list.capacity());
        self.free_list.push(index);
        tracing::trace!("released trampoline slot {index}");
    }

    /// Copies `blob` into the configuration region of an issued slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not issued or `blob` is larger than a slot.
    pub fn write_config(&self, index: u16, blob: &[u8]) {
        assert!(
            self.is_issued(index),
            "configured trampoline slot {index} which is not issued"
        );
        assert!(
            blob.len() <= self.slot_size,
            "configuration blob of {} bytes exceeds slot size {}",
            blob.len(),
            self.slot_size
        );
        self.pages.write_config(self.slot_offset(index), blob);
    }

    /// Unmaps the table's pages.
    ///
    /// # Panics
    ///
    /// Panics if any slot is still issued. The pages are left mapped in that case.
    pub fn destroy<M: PageMapper + ?Sized>(self, mapper: &M) {
        assert!(
            self.is_unused(),
            "destroyed a trampoline table with {} issued slots",
            self.issued()
        );
        debug_assert!(
            self.prev.is_none() && self.next.is_none(),
            "trampoline table destroyed while still linked"
        );

        tracing::debug!("destroying trampoline table at {:p}", self.pages.code_base());
        mapper.destroy_page_pair(self.pages);
    }

    /// Maps an address in the code page to the slot starting there.
    pub fn slot_of_code(&self, addr: usize) -> Option<u16> {
        self.slot_at(addr, self.pages.code_base())
    }

    /// Maps an address in the writable configuration page to the slot starting there.
    pub fn slot_of_config(&self, addr: usize) -> Option<u16> {
        self.slot_at(addr, self.pages.config_base())
    }

    fn slot_at(&self, addr: usize, base: NonNull<u8>) -> Option<u16> {
        let offset = addr.checked_sub(base.as_ptr() as usize)?;
        let rel = offset.checked_sub(self.segment_offset)?;
        if rel % self.slot_size != 0 {
            return None;
        }
        let index = rel / self.slot_size;
        if index >= self.capacity() {
            return None;
        }
        u16::try_from(index).ok()
    }

    /// Slot handle for `index`, regardless of whether it is issued.
    pub fn slot(&self, index: u16) -> Slot {
        let offset = self.slot_offset(index);
        // Safety: the slot offset lies within both pages
        unsafe {
            Slot {
                index,
                config: self.pages.config_base().add(offset),
                code: self.pages.code_base().add(offset),
            }
        }
    }

    fn slot_offset(&self, index: u16) -> usize {
        debug_assert!(usize::from(index) < self.capacity());
        self.segment_offset + usize::from(index) * self.slot_size
    }

    pub fn is_issued(&self, index: u16) -> bool {
        self.pool.get(usize::from(index)) == Some(&SlotState::Issued)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    #[inline]
    pub fn issued(&self) -> usize {
        self.capacity() - self.free_count()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_list.is_empty()
    }

    /// Whether every slot is free.
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.free_count() == self.capacity()
    }

    #[inline]
    pub fn segment_offset(&self) -> usize {
        self.segment_offset
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    pub fn pages(&self) -> &PagePair {
        &self.pages
    }
}

impl fmt::Debug for TrampolineTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineTable")
            .field("pages", &self.pages)
            .field("segment_offset", &self.segment_offset)
            .field("slot_size", &self.slot_size)
            .field("free_count", &self.free_count())
            .field("capacity", &self.capacity())
            .field("prev", &self.prev)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}
