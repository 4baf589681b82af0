/// What happens to a table once all of its slots are free again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep a fully free table around if it is the most recently active one, destroy it
    /// otherwise. Bursts of create/destroy cycles then don't remap pages every time.
    #[default]
    KeepMostRecent,
    /// Unmap every table as soon as its last slot is released.
    ReleaseImmediately,
}

/// Tunables of a [`TrampolineAllocator`](crate::TrampolineAllocator).
#[derive(Debug, Default, Clone)]
pub struct Config {
    pub(crate) slots_per_table: Option<usize>,
    pub(crate) retention: RetentionPolicy,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots carved out of every page pair. Defaults to as many as fit into one page.
    pub fn slots_per_table(&mut self, slots: usize) -> &mut Self {
        self.slots_per_table = Some(slots);
        self
    }

    pub fn retention(&mut self, policy: RetentionPolicy) -> &mut Self {
        self.retention = policy;
        self
    }
}
