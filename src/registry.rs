use crate::table::TrampolineTable;
use core::{fmt, iter};
use hashbrown::HashMap;
use wasmtime_slab::{Id, Slab};

/// Stable handle of a table inside a [`TableRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId(Id);

/// All live tables of an allocator, threaded onto a doubly linked list.
///
/// The head of the list is the most recently active table and the first place to look for a
/// free slot. Tables are additionally indexed by the page addresses they own, so the owner of a
/// trampoline is found without walking the list.
pub struct TableRegistry {
    tables: Slab<TrampolineTable>,
    head: Option<TableId>,
    page_size: usize,
    by_code_page: HashMap<usize, TableId>,
    by_config_page: HashMap<usize, TableId>,
}

impl TableRegistry {
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            tables: Slab::new(),
            head: None,
            page_size,
            by_code_page: HashMap::new(),
            by_config_page: HashMap::new(),
        }
    }

    /// Adds `table` at the head of the list.
    pub fn insert(&mut self, table: TrampolineTable) -> TableId {
        debug_assert!(table.prev.is_none() && table.next.is_none());
        let code = table.pages().code_base().as_ptr() as usize;
        let config = table.pages().config_base().as_ptr() as usize;

        let id = TableId(self.tables.alloc(table));
        self.link_front(id);
        self.by_code_page.insert(code, id);
        self.by_config_page.insert(config, id);

        tracing::trace!("registered trampoline table {id:?}, {} live", self.len());
        id
    }

    /// Unlinks the table `id` and hands it back.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn remove(&mut self, id: TableId) -> TrampolineTable {
        self.unlink(id);
        let table = self.tables.dealloc(id.0);
        self.by_code_page
            .remove(&(table.pages().code_base().as_ptr() as usize));
        self.by_config_page
            .remove(&(table.pages().config_base().as_ptr() as usize));

        tracing::trace!("unregistered trampoline table {id:?}, {} live", self.len());
        table
    }

    /// Makes `id` the head of the list.
    pub fn move_to_front(&mut self, id: TableId) {
        if self.head != Some(id) {
            self.unlink(id);
            self.link_front(id);
        }
    }

    /// A table with at least one free slot, preferring the head of the list.
    pub fn find_table_with_free_slot(&self) -> Option<TableId> {
        self.iter()
            .find(|(_, table)| !table.is_full())
            .map(|(id, _)| id)
    }

    /// The table owning the code page `addr` points into.
    pub fn owner_of_code(&self, addr: usize) -> Option<TableId> {
        self.by_code_page.get(&self.page_of(addr)).copied()
    }

    /// The table owning the writable configuration page `addr` points into.
    pub fn owner_of_config(&self, addr: usize) -> Option<TableId> {
        self.by_config_page.get(&self.page_of(addr)).copied()
    }

    fn page_of(&self, addr: usize) -> usize {
        addr & !(self.page_size - 1)
    }

    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn get(&self, id: TableId) -> &TrampolineTable {
        self.tables
            .get(id.0)
            .expect("trampoline table id is not registered")
    }

    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn get_mut(&mut self, id: TableId) -> &mut TrampolineTable {
        self.tables
            .get_mut(id.0)
            .expect("trampoline table id is not registered")
    }

    #[inline]
    pub fn head(&self) -> Option<TableId> {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Walks the list from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (TableId, &TrampolineTable)> + '_ {
        iter::successors(self.head, |id| self.get(*id).next).map(|id| (id, self.get(id)))
    }

    fn link_front(&mut self, id: TableId) {
        let old_head = self.head.replace(id);
        if let Some(old_head) = old_head {
            self.get_mut(old_head).prev = Some(id);
        }

        let table = self.get_mut(id);
        table.prev = None;
        table.next = old_head;
    }

    fn unlink(&mut self, id: TableId) {
        let table = self.get_mut(id);
        let (prev, next) = (table.prev.take(), table.next.take());

        match prev {
            Some(prev) => self.get_mut(prev).next = next,
            None => {
                debug_assert_eq!(self.head, Some(id));
                self.head = next;
            }
        }
        if let Some(next) = next {
            self.get_mut(next).prev = prev;
        }
    }
}

impl fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRegistry")
            .field("head", &self.head)
            .field("page_size", &self.page_size)
            .field("tables", &self.iter().map(|(_, table)| table).collect::<alloc::vec::Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_mapper::HeapPageMapper;
    use crate::template::testing::MarkerTemplate;

    const PAGE: usize = 256;

    fn registry_with(mapper: &HeapPageMapper, count: usize) -> (TableRegistry, Vec<TableId>) {
        let mut registry = TableRegistry::new(PAGE);
        let ids = (0..count)
            .map(|_| {
                let table = TrampolineTable::create(mapper, &MarkerTemplate::new(16), 2).unwrap();
                registry.insert(table)
            })
            .collect();
        (registry, ids)
    }

    fn order(registry: &TableRegistry) -> Vec<TableId> {
        registry.iter().map(|(id, _)| id).collect()
    }

    fn teardown(mapper: &HeapPageMapper, mut registry: TableRegistry) {
        while let Some(head) = registry.head() {
            registry.remove(head).destroy(mapper);
        }
        assert_eq!(mapper.live_pairs(), 0);
    }

    #[test_log::test]
    fn inserts_at_head() {
        let mapper = HeapPageMapper::new(PAGE);
        let (registry, ids) = registry_with(&mapper, 3);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.head(), Some(ids[2]));
        assert_eq!(order(&registry), [ids[2], ids[1], ids[0]]);
        teardown(&mapper, registry);
    }

    #[test_log::test]
    fn removes_from_the_middle() {
        let mapper = HeapPageMapper::new(PAGE);
        let (mut registry, ids) = registry_with(&mapper, 3);

        let table = registry.remove(ids[1]);
        assert!(table.prev.is_none() && table.next.is_none());
        table.destroy(&mapper);

        assert_eq!(order(&registry), [ids[2], ids[0]]);
        assert_eq!(registry.get(ids[2]).next, Some(ids[0]));
        assert_eq!(registry.get(ids[0]).prev, Some(ids[2]));
        teardown(&mapper, registry);
    }

    #[test_log::test]
    fn removes_head_and_tail() {
        let mapper = HeapPageMapper::new(PAGE);
        let (mut registry, ids) = registry_with(&mapper, 3);

        registry.remove(ids[2]).destroy(&mapper);
        assert_eq!(registry.head(), Some(ids[1]));
        registry.remove(ids[0]).destroy(&mapper);
        assert_eq!(order(&registry), [ids[1]]);
        registry.remove(ids[1]).destroy(&mapper);

        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert_eq!(mapper.live_pairs(), 0);
    }

    #[test_log::test]
    fn moves_to_front() {
        let mapper = HeapPageMapper::new(PAGE);
        let (mut registry, ids) = registry_with(&mapper, 3);

        registry.move_to_front(ids[0]);
        assert_eq!(order(&registry), [ids[0], ids[2], ids[1]]);
        registry.move_to_front(ids[0]);
        assert_eq!(order(&registry), [ids[0], ids[2], ids[1]]);
        registry.move_to_front(ids[1]);
        assert_eq!(order(&registry), [ids[1], ids[0], ids[2]]);
        teardown(&mapper, registry);
    }

    #[test_log::test]
    fn finds_free_slots_past_full_tables() {
        let mapper = HeapPageMapper::new(PAGE);
        let (mut registry, ids) = registry_with(&mapper, 2);

        assert_eq!(registry.find_table_with_free_slot(), Some(ids[1]));

        let head = registry.get_mut(ids[1]);
        let slots = [head.acquire_slot(), head.acquire_slot()];
        assert_eq!(registry.find_table_with_free_slot(), Some(ids[0]));

        let tail = registry.get_mut(ids[0]);
        let more = [tail.acquire_slot(), tail.acquire_slot()];
        assert_eq!(registry.find_table_with_free_slot(), None);

        for slot in slots {
            registry.get_mut(ids[1]).release_slot(slot.index);
        }
        for slot in more {
            registry.get_mut(ids[0]).release_slot(slot.index);
        }
        teardown(&mapper, registry);
    }

    #[test_log::test]
    fn finds_owners_by_address() {
        let mapper = HeapPageMapper::new(PAGE);
        let (mut registry, ids) = registry_with(&mapper, 2);

        for id in &ids {
            let slot = registry.get_mut(*id).acquire_slot();
            assert_eq!(registry.owner_of_code(slot.code.as_ptr() as usize), Some(*id));
            assert_eq!(registry.owner_of_config(slot.config.as_ptr() as usize), Some(*id));
            assert_eq!(registry.owner_of_code(slot.config.as_ptr() as usize), None);
            registry.get_mut(*id).release_slot(slot.index);
        }

        let code = registry.get(ids[0]).pages().code_base().as_ptr() as usize;
        registry.remove(ids[0]).destroy(&mapper);
        assert_eq!(registry.owner_of_code(code), None);
        teardown(&mapper, registry);
    }
}
