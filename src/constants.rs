use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Open the store read-only; write transactions are refused.
        const RDONLY = 0x20000;
        /// Skip flushing data pages at commit.
        const NOSYNC = 0x10000;
        /// Skip flushing the meta page at commit.
        const NOMETASYNC = 0x40000;
        /// The map is written through directly; there is no
        /// transaction-private shadow memory outside the map.
        const WRITEMAP = 0x80000;
        /// Transactions are not bound to the thread that began them.
        const NOTLS = 0x200000;
        /// Allow nested write transactions.
        const NESTED_TXN = 0x1000000;
    }
}

// Tree flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TreeFlags: u32 {
        /// Keys may carry multiple values, kept sorted by value bytes.
        const DUP_SORT = 0x04;
        /// Create the tree if it does not exist (write transactions only).
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        const NO_OVERWRITE = 0x10;
        const NO_DUP_DATA = 0x20;
        const CURRENT = 0x40;
        const ALL_DUPS = 0x80;
        const RESERVE = 0x10000;
        const APPEND = 0x20000;
        const APPEND_DUP = 0x40000;
        const MULTIPLE = 0x80000;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxnFlags: u32 {
        // Reuse the environment bit for read-only
        const RDONLY = EnvFlags::RDONLY.bits();

        // Transaction-specific flags
        const DIRTY = 0x01;
        const BLOCKED = 0x02;
        const HAS_CHILD = 0x04;
        const NESTED = 0x08;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const LEAF = 0x01;
        const OVERFLOW = 0x04;
        const META = 0x08;
    }
}

// Node flags: the storage shape of a key's on-page entry
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        /// Value lives in a run of overflow pages.
        const BIG_DATA = 0x01;
        /// The key carries multiple values.
        const DUP_DATA = 0x02;
        /// The values form a nested sub-tree rather than a sub-page.
        const SUB_DATA = 0x04;
    }
}

/// Size of one page in the map.
pub const PAGE_SIZE: usize = 4096;
/// Magic number identifying a store file
pub const STORE_MAGIC: u32 = 0xBEE7_5EED;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;
/// Pages reserved at the front of the map for committed meta state
pub const META_PAGES: usize = 2;
/// Distance between consecutive committed transaction ids
pub const TXNID_STEP: u64 = 1;
/// Identifier of the always-present unnamed tree
pub const MAIN_TREE: usize = 0;
/// Most duplicate values a single sub-page may hold before the entry
/// escalates to a nested sub-tree
pub const SUBPAGE_MAX_ITEMS: usize = 16;
/// Branching factor used to derive the stored height of a nested sub-tree
pub const SUBTREE_FANOUT: u64 = 16;

// Defaults applied by `Environment::new`
pub(crate) const DEFAULT_MAP_SIZE: usize = 4 << 20;
pub(crate) const DEFAULT_MAX_TREES: usize = 16;
pub(crate) const DEFAULT_MAX_READERS: u32 = 126;
pub(crate) const DEFAULT_MAX_KEY_SIZE: usize = 511;
