use crate::{
    OS_PAGE_SIZE,
    pointer_table::{MAX_ENTRIES, PointerTag},
    sandbox::DEFAULT_CAGE_SIZE_LOG2,
};

const ENTRY_SIZE: usize = size_of::<u64>();

#[derive(Debug, Clone)]
pub struct TableSettings {
    /// Growth and decommit unit in bytes. Must be a multiple of the OS page
    /// size (typ. 16KB).
    pub block_size: usize,
    /// Entries covered by the table's address reservation. At most 2^24.
    pub reservation_entries: u32,
    /// Tables smaller than this are never compacted (typ. 1MB).
    pub compaction_min_table_bytes: usize,
    /// Fraction (0.0 - 1.0) of free entries needed before compacting.
    pub compaction_min_free_ratio: f64,
    /// Tags whose content may still point into the cage while being migrated
    /// out of it.
    pub migration_allow_list: Vec<PointerTag>,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            block_size: 16_384,             // 16 KB = 2048 entries
            reservation_entries: MAX_ENTRIES, // 128 MB of address space
            compaction_min_table_bytes: 1 << 20, // 1 MB
            compaction_min_free_ratio: 0.10,
            migration_allow_list: Vec::new(),
        }
    }
}

impl TableSettings {
    #[inline]
    pub fn entries_per_block(&self) -> u32 {
        (self.block_size / ENTRY_SIZE) as u32
    }

    #[inline]
    pub fn reservation_bytes(&self) -> usize {
        self.reservation_entries as usize * ENTRY_SIZE
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.block_size == 0 || self.reservation_entries == 0 {
            return Err("Sizes must be > 0");
        }
        if !self.block_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("block_size must match OS page alignment");
        }
        if self.reservation_entries > MAX_ENTRIES {
            return Err("reservation_entries exceeds what a handle can address");
        }
        if !self.reservation_bytes().is_multiple_of(self.block_size) {
            return Err("reservation must be a multiple of block_size");
        }
        if !(0.0..=1.0).contains(&self.compaction_min_free_ratio) {
            return Err("Fractions must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// log2 of the cage reservation size.
    pub cage_size_log2: u32,
    pub external_table: TableSettings,
    pub trusted_table: TableSettings,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            cage_size_log2: DEFAULT_CAGE_SIZE_LOG2, // 4 GB
            external_table: TableSettings::default(),
            trusted_table: TableSettings::default(),
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.cage_size_log2 == 0 || self.cage_size_log2 > usize::BITS / 2 {
            return Err("cage size must fit within half the pointer width");
        }
        if (1usize << self.cage_size_log2) < OS_PAGE_SIZE {
            return Err("cage must span at least one page");
        }
        self.external_table.validate()?;
        self.trusted_table.validate()
    }
}

/// Optional overrides applied on top of [`HeapSettings::default`].
#[derive(Debug, Default, Clone)]
pub struct HeapCreateInfo {
    pub cage_size_log2: Option<u32>,
    pub table_block_size: Option<usize>,
    pub table_reservation_entries: Option<u32>,
    pub compaction_min_table_bytes: Option<usize>,
    pub compaction_min_free_ratio: Option<f64>,
    pub migration_allow_list: Option<Vec<PointerTag>>,
}

impl HeapCreateInfo {
    pub fn into_settings(self) -> Result<HeapSettings, &'static str> {
        let mut settings = HeapSettings::default();
        self.cage_size_log2
            .inspect(|&val| settings.cage_size_log2 = val);
        for table in [&mut settings.external_table, &mut settings.trusted_table] {
            self.table_block_size.inspect(|&val| table.block_size = val);
            self.table_reservation_entries
                .inspect(|&val| table.reservation_entries = val);
            self.compaction_min_table_bytes
                .inspect(|&val| table.compaction_min_table_bytes = val);
            self.compaction_min_free_ratio
                .inspect(|&val| table.compaction_min_free_ratio = val);
        }
        if let Some(list) = self.migration_allow_list {
            settings.external_table.migration_allow_list = list;
        }
        settings.validate()?;
        Ok(settings)
    }
}
