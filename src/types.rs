/// Outcome of a successful [`Transaction::commit`](crate::Transaction::commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Dirty state was persisted and a new snapshot published.
    Committed,
    /// There was nothing to persist: a pure reader, an empty write
    /// transaction, or a broken transaction that was finalized in place.
    NothingToCommit,
}

/// Reader staleness report from [`Transaction::lag`](crate::Transaction::lag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagInfo {
    /// Committed write transactions since this reader's snapshot was taken,
    /// clamped to `i64::MAX`. Always 0 for a write transaction.
    pub lag: i64,
    /// Rounded percentage of the map geometry in use at the head snapshot.
    pub percent: u32,
}

/// Per-tree statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStat {
    /// Number of data items, duplicates included
    pub entries: u64,
    /// Number of distinct keys
    pub keys: u64,
}
