use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::trace;

use crate::constants::{EnvFlags, TxnFlags, TXNID_STEP};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::lock;
use crate::meta::{Canary, Geometry, Meta};
use crate::page::PageNo;
use crate::pagelist::PageList;
use crate::tree::{TreeCatalog, TreeId};
use crate::types::{CommitOutcome, LagInfo};

/// Transaction lifecycle states. `Broken` is the poisoned overlay: the
/// transaction still holds its resources but every operation except the
/// finalizing commit/abort must fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TxnState {
    Running = 1,
    Committed = 2,
    Aborted = 3,
    Reset = 4,
    Broken = 5,
}

impl TxnState {
    fn from_u8(raw: u8) -> TxnState {
        match raw {
            1 => TxnState::Running,
            2 => TxnState::Committed,
            3 => TxnState::Aborted,
            4 => TxnState::Reset,
            _ => TxnState::Broken,
        }
    }
}

/// The transaction's view of the tree catalog: a shared committed
/// snapshot for readers, a private working copy for the writer.
pub(crate) enum TxnTrees {
    /// `None` once the snapshot has been released by `reset`.
    Reader(Option<Arc<TreeCatalog>>),
    Writer(TreeCatalog),
}

/// A snapshot (read) or exclusive mutation context (write) bound to one
/// environment.
///
/// All methods take `&self`; interior state is synchronized so that a
/// cross-thread call can be detected and refused (`ThreadMismatch`)
/// instead of corrupting anything. Unless the environment was opened
/// with `EnvFlags::NOTLS`, only the thread that began the transaction
/// may drive it.
pub struct Transaction<'env> {
    env: &'env Environment,
    owner: ThreadId,
    txnid: AtomicU64,
    state: AtomicU8,
    flags: AtomicU32,
    geo: Mutex<Geometry>,
    canary: Mutex<Canary>,
    trees: Mutex<TxnTrees>,
    /// Pages allocated (and therefore rewritable in place) by this
    /// transaction.
    dirty: Mutex<PageList>,
    /// Pages this transaction stopped referencing. Tracked, never reused.
    free: Mutex<PageList>,
    /// Active cursors per tree, registered for the span of mutating calls.
    tracked: Mutex<HashMap<TreeId, usize>>,
    slot_released: AtomicBool,
}

impl<'env> Transaction<'env> {
    pub(crate) fn begin(env: &'env Environment, read_only: bool) -> Result<Transaction<'env>> {
        if !env.is_initialized() {
            return Err(Error::Invalid);
        }
        if read_only {
            env.register_reader()?;
            let committed = env.committed();
            let txn = Transaction {
                env,
                owner: thread::current().id(),
                txnid: AtomicU64::new(committed.meta.txnid),
                state: AtomicU8::new(TxnState::Running as u8),
                flags: AtomicU32::new(TxnFlags::RDONLY.bits()),
                geo: Mutex::new(committed.meta.geo),
                canary: Mutex::new(committed.meta.canary),
                trees: Mutex::new(TxnTrees::Reader(Some(committed.catalog))),
                dirty: Mutex::new(PageList::new()),
                free: Mutex::new(PageList::new()),
                tracked: Mutex::new(HashMap::new()),
                slot_released: AtomicBool::new(false),
            };
            trace!("begin read txn at snapshot {}", txn.id());
            Ok(txn)
        } else {
            if env.flags().contains(EnvFlags::RDONLY) {
                return Err(Error::Access);
            }
            env.acquire_writer()?;
            let committed = env.committed();
            let working = (*committed.catalog).clone();
            let txn = Transaction {
                env,
                owner: thread::current().id(),
                txnid: AtomicU64::new(committed.meta.txnid + TXNID_STEP),
                state: AtomicU8::new(TxnState::Running as u8),
                flags: AtomicU32::new(0),
                geo: Mutex::new(committed.meta.geo),
                canary: Mutex::new(committed.meta.canary),
                trees: Mutex::new(TxnTrees::Writer(working)),
                dirty: Mutex::new(PageList::new()),
                free: Mutex::new(PageList::new()),
                tracked: Mutex::new(HashMap::new()),
                slot_released: AtomicBool::new(false),
            };
            trace!("begin write txn {}", txn.id());
            Ok(txn)
        }
    }

    /// This transaction's snapshot id (readers) or pending commit id
    /// (writers).
    pub fn id(&self) -> u64 {
        self.txnid.load(Ordering::Relaxed)
    }

    pub fn is_read_only(&self) -> bool {
        self.txn_flags().contains(TxnFlags::RDONLY)
    }

    pub(crate) fn env(&self) -> &'env Environment {
        self.env
    }

    fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn txn_flags(&self) -> TxnFlags {
        TxnFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn add_flags(&self, flags: TxnFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn remove_flags(&self, flags: TxnFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn check_thread(&self) -> Result<()> {
        if !self.env.flags().contains(EnvFlags::NOTLS) && thread::current().id() != self.owner {
            return Err(Error::ThreadMismatch);
        }
        Ok(())
    }

    /// Validity gate every data-accessing operation passes first: owning
    /// thread, `Running`, not blocked.
    pub(crate) fn check(&self) -> Result<()> {
        self.check_thread()?;
        if self.state() != TxnState::Running {
            return Err(Error::BadTransaction);
        }
        if self.txn_flags().contains(TxnFlags::BLOCKED) {
            return Err(Error::BadTransaction);
        }
        Ok(())
    }

    /// Validity gate for mutations: `check` plus write access.
    pub(crate) fn check_rw(&self) -> Result<()> {
        self.check()?;
        if self.is_read_only() {
            return Err(Error::Access);
        }
        Ok(())
    }

    /// Finalize the transaction.
    ///
    /// A writer with dirty state persists it and publishes a new
    /// snapshot. A pure reader, an empty writer, or a broken transaction
    /// has nothing to persist and reports `NothingToCommit`; a broken
    /// transaction is finalized (its work discarded) by this call, after
    /// which any further finalization fails `BadTransaction`.
    pub fn commit(&self) -> Result<CommitOutcome> {
        self.check_thread()?;
        match self.state() {
            TxnState::Broken => {
                trace!("commit on broken txn {}: finalizing as abort", self.id());
                self.release(TxnState::Aborted);
                Ok(CommitOutcome::NothingToCommit)
            }
            TxnState::Running => {
                let flags = self.txn_flags();
                if flags.intersects(TxnFlags::BLOCKED | TxnFlags::HAS_CHILD) {
                    return Err(Error::BadTransaction);
                }
                if flags.contains(TxnFlags::NESTED) {
                    // A nested transaction is folded into its parent via
                    // `merge`, never committed on its own.
                    return Err(Error::BadTransaction);
                }
                if self.is_read_only() || !flags.contains(TxnFlags::DIRTY) {
                    self.release(TxnState::Committed);
                    return Ok(CommitOutcome::NothingToCommit);
                }
                let meta = Meta {
                    txnid: self.id(),
                    geo: *lock(&self.geo),
                    canary: *lock(&self.canary),
                };
                let catalog = {
                    let mut trees = lock(&self.trees);
                    match std::mem::replace(&mut *trees, TxnTrees::Reader(None)) {
                        TxnTrees::Writer(catalog) => Arc::new(catalog),
                        reader => {
                            *trees = reader;
                            return Err(Error::BadTransaction);
                        }
                    }
                };
                self.env.publish(meta, catalog)?;
                trace!("commit txn {}", meta.txnid);
                self.release(TxnState::Committed);
                Ok(CommitOutcome::Committed)
            }
            _ => Err(Error::BadTransaction),
        }
    }

    /// Abandon the transaction, discarding all of its dirty pages. Valid
    /// from `Running` or `Broken`.
    pub fn abort(&self) -> Result<()> {
        self.check_thread()?;
        match self.state() {
            TxnState::Running | TxnState::Broken => {
                if self.txn_flags().contains(TxnFlags::HAS_CHILD) {
                    return Err(Error::BadTransaction);
                }
                trace!("abort txn {}", self.id());
                self.release(TxnState::Aborted);
                Ok(())
            }
            _ => Err(Error::BadTransaction),
        }
    }

    /// Release a reader's snapshot while keeping the handle for `renew`.
    /// Write transactions cannot be reset.
    pub fn reset(&self) -> Result<()> {
        self.check_thread()?;
        if !self.is_read_only() {
            return Err(Error::InvalidArgument);
        }
        if self.state() != TxnState::Running {
            return Err(Error::BadTransaction);
        }
        *lock(&self.trees) = TxnTrees::Reader(None);
        if !self.slot_released.swap(true, Ordering::AcqRel) {
            self.env.release_reader();
        }
        self.set_state(TxnState::Reset);
        Ok(())
    }

    /// Re-arm a reset reader with a freshly acquired snapshot.
    pub fn renew(&self) -> Result<()> {
        self.check_thread()?;
        if !self.is_read_only() {
            return Err(Error::InvalidArgument);
        }
        if self.state() != TxnState::Reset {
            return Err(Error::BadTransaction);
        }
        self.env.register_reader()?;
        self.slot_released.store(false, Ordering::Release);
        let committed = self.env.committed();
        self.txnid.store(committed.meta.txnid, Ordering::Relaxed);
        *lock(&self.geo) = committed.meta.geo;
        *lock(&self.canary) = committed.meta.canary;
        *lock(&self.trees) = TxnTrees::Reader(Some(committed.catalog));
        self.set_state(TxnState::Running);
        trace!("renew read txn at snapshot {}", self.id());
        Ok(())
    }

    /// Poison the transaction: every further operation through it fails,
    /// but its resources stay held until the finalizing commit/abort.
    /// Deliberately not thread-gated; this is the cross-context cancel.
    pub fn poison(&self) -> Result<()> {
        if self.state() != TxnState::Running {
            return Err(Error::BadTransaction);
        }
        trace!("poison txn {}", self.id());
        self.set_state(TxnState::Broken);
        Ok(())
    }

    /// Begin a nested write transaction. Requires `EnvFlags::NESTED_TXN`
    /// and the owning thread. The parent is blocked until the child is
    /// folded back with [`merge`](Self::merge) or dropped with
    /// [`discard`](Self::discard).
    pub fn begin_nested(&self) -> Result<Transaction<'env>> {
        self.check_rw()?;
        if !self.env.flags().contains(EnvFlags::NESTED_TXN) {
            return Err(Error::InvalidArgument);
        }
        let working = self.with_trees(|cat| Ok(cat.clone()))?;
        let child = Transaction {
            env: self.env,
            owner: self.owner,
            txnid: AtomicU64::new(self.id()),
            state: AtomicU8::new(TxnState::Running as u8),
            flags: AtomicU32::new(TxnFlags::NESTED.bits()),
            geo: Mutex::new(*lock(&self.geo)),
            canary: Mutex::new(*lock(&self.canary)),
            trees: Mutex::new(TxnTrees::Writer(working)),
            // The child owns no dirty pages yet: even the parent's dirty
            // pages must be copied before the child rewrites them, since
            // the parent survives a discarded child.
            dirty: Mutex::new(PageList::new()),
            free: Mutex::new(PageList::new()),
            tracked: Mutex::new(HashMap::new()),
            // Holds no environment slot; the parent keeps the writer slot.
            slot_released: AtomicBool::new(true),
        };
        self.add_flags(TxnFlags::BLOCKED | TxnFlags::HAS_CHILD);
        trace!("begin nested txn under {}", self.id());
        Ok(child)
    }

    /// Fold a nested transaction's work into this (parent) transaction.
    pub fn merge(&self, child: Transaction<'env>) -> Result<()> {
        self.check_thread()?;
        if !self.txn_flags().contains(TxnFlags::HAS_CHILD)
            || !child.txn_flags().contains(TxnFlags::NESTED)
        {
            return Err(Error::InvalidArgument);
        }
        if child.state() != TxnState::Running {
            return Err(Error::BadTransaction);
        }
        let working = {
            let mut trees = lock(&child.trees);
            match std::mem::replace(&mut *trees, TxnTrees::Reader(None)) {
                TxnTrees::Writer(catalog) => catalog,
                _ => return Err(Error::BadTransaction),
            }
        };
        *lock(&self.trees) = TxnTrees::Writer(working);
        lock(&self.dirty).merge(std::mem::take(&mut *lock(&child.dirty)));
        lock(&self.free).merge(std::mem::take(&mut *lock(&child.free)));
        *lock(&self.geo) = *lock(&child.geo);
        *lock(&self.canary) = *lock(&child.canary);
        if child.txn_flags().contains(TxnFlags::DIRTY) {
            self.add_flags(TxnFlags::DIRTY);
        }
        child.set_state(TxnState::Committed);
        self.remove_flags(TxnFlags::BLOCKED | TxnFlags::HAS_CHILD);
        trace!("merged nested txn into {}", self.id());
        Ok(())
    }

    /// Abandon a nested transaction, unblocking this (parent)
    /// transaction. The parent's state is exactly what it was before
    /// `begin_nested`.
    pub fn discard(&self, child: Transaction<'env>) -> Result<()> {
        self.check_thread()?;
        if !self.txn_flags().contains(TxnFlags::HAS_CHILD)
            || !child.txn_flags().contains(TxnFlags::NESTED)
        {
            return Err(Error::InvalidArgument);
        }
        child.release(TxnState::Aborted);
        self.remove_flags(TxnFlags::BLOCKED | TxnFlags::HAS_CHILD);
        Ok(())
    }

    /// The caller-defined canary as of this transaction's snapshot.
    pub fn canary(&self) -> Result<Canary> {
        self.check()?;
        Ok(*lock(&self.canary))
    }

    /// Update the canary. Unchanged `x`, `y`, `z` leave the stored canary
    /// (and its last-writer stamp) alone; otherwise `v` is stamped with
    /// this transaction's id and the change rides the next commit.
    pub fn set_canary(&self, canary: &Canary) -> Result<()> {
        self.check_rw()?;
        let mut current = lock(&self.canary);
        if current.x == canary.x && current.y == canary.y && current.z == canary.z {
            return Ok(());
        }
        current.x = canary.x;
        current.y = canary.y;
        current.z = canary.z;
        current.v = self.id();
        drop(current);
        self.add_flags(TxnFlags::DIRTY);
        Ok(())
    }

    /// Classify the page behind `ptr`.
    ///
    /// `Ok(true)`: the page is owned by this write transaction and may be
    /// rewritten at any time — its bytes must not be used as an input
    /// argument for further mutating calls. `Ok(false)`: the page is
    /// clean and will be copied before any mutation, so references into
    /// it stay valid. `InvalidArgument`: the address does not reference
    /// the start of a logical page's data (e.g. points into the middle of
    /// a multi-page overflow record) or is out of range for this
    /// transaction.
    pub fn is_dirty(&self, ptr: *const u8) -> Result<bool> {
        self.check()?;
        let env = self.env;
        let addr = ptr as usize;
        let base = env.map_base_addr();
        if addr >= base {
            let offset = addr - base;
            let pgno = (offset / env.page_size()) as PageNo;
            if pgno < lock(&self.geo).first_unallocated {
                let header = env.read_header(pgno);
                if header.pgno != pgno || !header.is_legal_kind() {
                    // Pointer into the middle of a multi-page record, not
                    // at the start of its data.
                    return Err(Error::InvalidArgument);
                }
                return Ok(!self.is_read_only() && lock(&self.dirty).contains(pgno));
            }
            if offset < env.map_limit() {
                // Inside the map but past the allocated bound. Possible
                // when a dirty page was handed back to the unallocated
                // range during this transaction.
                return if self.is_read_only() {
                    Err(Error::InvalidArgument)
                } else {
                    Ok(true)
                };
            }
        }
        // Outside the mapped range entirely: bogus for direct-write maps
        // and for readers, otherwise presumed to be transaction-private
        // shadow memory.
        if env.flags().contains(EnvFlags::WRITEMAP) || self.is_read_only() {
            Err(Error::InvalidArgument)
        } else {
            Ok(true)
        }
    }

    /// How far this reader trails the most recently committed snapshot,
    /// plus the head's geometry usage. For a writer the lag is 0 by
    /// definition; for a reader the head meta is read lock-free, retrying
    /// torn copies instead of ever blocking the writer.
    pub fn lag(&self) -> Result<LagInfo> {
        self.check()?;
        if !self.is_read_only() {
            let geo = *lock(&self.geo);
            return Ok(LagInfo {
                lag: 0,
                percent: percent_of(&geo),
            });
        }
        let slots = self.env.snapshot_slots();
        let mut token = slots.tap();
        loop {
            let head = slots.most_recent(&token);
            let percent = percent_of(&head.geo);
            let behind = head.txnid.saturating_sub(self.id()) / TXNID_STEP;
            if !slots.should_retry(&mut token) {
                return Ok(LagInfo {
                    lag: behind.min(i64::MAX as u64) as i64,
                    percent,
                });
            }
        }
    }

    // -- internals used by the cursor and tree layers --------------------

    pub(crate) fn with_trees<R>(&self, body: impl FnOnce(&TreeCatalog) -> Result<R>) -> Result<R> {
        let trees = lock(&self.trees);
        match &*trees {
            TxnTrees::Reader(Some(catalog)) => body(catalog),
            TxnTrees::Reader(None) => Err(Error::BadTransaction),
            TxnTrees::Writer(catalog) => body(catalog),
        }
    }

    pub(crate) fn with_trees_mut<R>(
        &self,
        body: impl FnOnce(&mut TreeCatalog) -> Result<R>,
    ) -> Result<R> {
        let mut trees = lock(&self.trees);
        match &mut *trees {
            TxnTrees::Writer(catalog) => body(catalog),
            TxnTrees::Reader(_) => Err(Error::Access),
        }
    }

    /// Hand out `count` fresh pages from the unallocated range and take
    /// ownership of them (they join the dirty set).
    pub(crate) fn alloc_pages(&self, count: u64) -> Result<PageNo> {
        let mut geo = lock(&self.geo);
        if geo.first_unallocated + count > geo.end_pgno {
            return Err(Error::MapFull);
        }
        let first = geo.first_unallocated;
        geo.first_unallocated += count;
        lock(&self.dirty).insert_run(first, count);
        Ok(first)
    }

    pub(crate) fn is_page_dirty(&self, pgno: PageNo) -> bool {
        !self.is_read_only() && lock(&self.dirty).contains(pgno)
    }

    pub(crate) fn mark_free(&self, pgno: PageNo) {
        lock(&self.free).insert(pgno);
    }

    pub(crate) fn mark_free_run(&self, first: PageNo, count: u64) {
        lock(&self.free).insert_run(first, count);
    }

    pub(crate) fn track_cursor(&self, tree: TreeId) {
        *lock(&self.tracked).entry(tree).or_insert(0) += 1;
    }

    pub(crate) fn untrack_cursor(&self, tree: TreeId) {
        let mut tracked = lock(&self.tracked);
        if let Some(count) = tracked.get_mut(&tree) {
            *count -= 1;
            if *count == 0 {
                tracked.remove(&tree);
            }
        }
    }

    /// Move to a terminal state and give back whatever environment slot
    /// this transaction still holds.
    fn release(&self, final_state: TxnState) {
        self.set_state(final_state);
        lock(&self.dirty).clear();
        lock(&self.free).clear();
        if !self.slot_released.swap(true, Ordering::AcqRel) {
            if self.is_read_only() {
                self.env.release_reader();
            } else {
                self.env.release_writer();
            }
        }
        // Drop the snapshot/working catalog, unless commit already took it.
        let mut trees = lock(&self.trees);
        if !matches!(&*trees, TxnTrees::Reader(None)) {
            *trees = TxnTrees::Reader(None);
        }
    }
}

fn percent_of(geo: &Geometry) -> u32 {
    ((geo.first_unallocated * 100 + geo.end_pgno / 2) / geo.end_pgno) as u32
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        match self.state() {
            TxnState::Running | TxnState::Broken => {
                trace!("dropping live txn {}; aborting", self.id());
                self.release(TxnState::Aborted);
            }
            _ => {}
        }
    }
}
