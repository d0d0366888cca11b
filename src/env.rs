use std::fs::OpenOptions;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::info;
use memmap2::MmapRaw;

use crate::constants::{
    EnvFlags, PageFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_READERS,
    DEFAULT_MAX_TREES, META_PAGES, PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::lock;
use crate::meta::{decode_meta, encode_meta, Canary, Geometry, Meta, SnapshotSlots, META_DISK_LEN};
use crate::page::{PageHeader, PageNo, PAGE_HDR};
use crate::transaction::Transaction;
use crate::tree::TreeCatalog;

lazy_static! {
    /// Flags that may still be toggled after the environment is open.
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
}

/// Environment information
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_pgno: u64,
    pub last_txnid: u64,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// The committed head: snapshot meta plus the catalog it published.
#[derive(Clone)]
pub(crate) struct Committed {
    pub meta: Meta,
    pub catalog: Arc<TreeCatalog>,
}

/// Process-wide handle to one mapped store file.
///
/// Owns the memory map, the set of open trees, and the committed
/// snapshot state; outlives every transaction it serves. Lifecycle is
/// open → serve → close.
pub struct Environment {
    path: PathBuf,
    flags: EnvFlags,
    page_size: usize,
    map_size: usize,
    max_trees: usize,
    max_readers: u32,
    max_key_size: usize,
    file: Option<File>,
    map: Option<MmapRaw>,
    committed: Mutex<Committed>,
    slots: SnapshotSlots,
    write_active: AtomicBool,
    num_readers: AtomicU32,
    initialized: AtomicBool,
}

impl Environment {
    /// Create an unopened environment with default limits.
    pub fn new() -> Result<Environment> {
        let geo = Geometry {
            first_unallocated: META_PAGES as u64,
            end_pgno: (DEFAULT_MAP_SIZE / PAGE_SIZE) as u64,
        };
        Ok(Environment {
            path: PathBuf::new(),
            flags: EnvFlags::empty(),
            page_size: PAGE_SIZE,
            map_size: DEFAULT_MAP_SIZE,
            max_trees: DEFAULT_MAX_TREES,
            max_readers: DEFAULT_MAX_READERS,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            file: None,
            map: None,
            committed: Mutex::new(Committed {
                meta: Meta {
                    txnid: 0,
                    geo,
                    canary: Canary::default(),
                },
                catalog: Arc::new(TreeCatalog::new()),
            }),
            slots: SnapshotSlots::new(),
            write_active: AtomicBool::new(false),
            num_readers: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
        })
    }

    /// Set the size of the memory map. Must be called before `open`;
    /// rounded up to a whole number of pages.
    pub fn set_map_size(&mut self, size: usize) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        if size < self.page_size * (META_PAGES + 1) {
            return Err(Error::InvalidArgument);
        }
        self.map_size = (size + self.page_size - 1) & !(self.page_size - 1);
        Ok(())
    }

    /// Set the maximum number of named trees. Must be called before `open`.
    pub fn set_max_trees(&mut self, trees: usize) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        if trees == 0 {
            return Err(Error::InvalidArgument);
        }
        self.max_trees = trees;
        Ok(())
    }

    /// Set the maximum number of concurrent readers. Must be called
    /// before `open`.
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        if readers == 0 {
            return Err(Error::InvalidArgument);
        }
        self.max_readers = readers;
        Ok(())
    }

    /// Open the store file at `path`, creating it if absent.
    pub fn open<P: AsRef<Path>>(mut self, path: P, flags: EnvFlags) -> Result<Environment> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        self.path = path.as_ref().to_path_buf();
        self.flags = flags;

        // The file and map stay writable even for RDONLY environments;
        // read-only access is enforced at the transaction layer while the
        // meta pages are still maintained through the map.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        let file_len = file.metadata()?.len();
        let fresh = file_len == 0;
        if (file_len as usize) < self.map_size {
            file.set_len(self.map_size as u64)?;
        } else {
            self.map_size = file_len as usize;
        }
        self.map = Some(MmapRaw::map_raw(&file)?);
        self.file = Some(file);

        let end_pgno = (self.map_size / self.page_size) as u64;
        let meta = if fresh {
            let meta = Meta {
                txnid: 0,
                geo: Geometry {
                    first_unallocated: META_PAGES as u64,
                    end_pgno,
                },
                canary: Canary::default(),
            };
            for slot in 0..META_PAGES as u64 {
                self.write_meta_page(slot, &meta);
            }
            meta
        } else {
            let mut best: Option<Meta> = None;
            let mut last_err = Error::Invalid;
            for slot in 0..META_PAGES as u64 {
                match self.read_meta_page(slot) {
                    Ok(meta) => {
                        if best.map_or(true, |prev| meta.txnid > prev.txnid) {
                            best = Some(meta);
                        }
                    }
                    Err(err) => last_err = err,
                }
            }
            let mut meta = best.ok_or(last_err)?;
            meta.geo.end_pgno = end_pgno;
            meta
        };

        *lock(&self.committed) = Committed {
            meta,
            catalog: Arc::new(TreeCatalog::new()),
        };
        self.slots.seed(&meta);
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "environment open at {:?}: {} pages, txnid {}",
            self.path, end_pgno, meta.txnid
        );
        Ok(self)
    }

    /// Begin a write transaction. Fails with `Busy` while another write
    /// transaction is active.
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self, false)
    }

    /// Begin a read-only transaction at the current committed snapshot.
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self, true)
    }

    /// Flush buffered writes to storage. With `force` the flush happens
    /// even under `NOSYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::Access);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Invalid);
        }
        if force || !self.flags.contains(EnvFlags::NOSYNC) {
            self.mmap().flush()?;
        }
        Ok(())
    }

    /// Toggle flags after open. Only the changeable subset is accepted.
    pub fn set_flags(&mut self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Invalid);
        }
        if !CHANGEABLE.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        if onoff {
            self.flags |= flags;
        } else {
            self.flags &= !flags;
        }
        Ok(())
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot-level information about the environment, read through the
    /// lock-free snapshot slots so it never contends with a committing
    /// writer.
    pub fn info(&self) -> Result<EnvInfo> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Invalid);
        }
        let meta = self.slots.recent_settled();
        Ok(EnvInfo {
            map_size: self.map_size,
            last_pgno: meta.geo.first_unallocated,
            last_txnid: meta.txnid,
            max_readers: self.max_readers,
            num_readers: self.num_readers.load(Ordering::Relaxed),
        })
    }

    /// Release the map and mark the environment closed. All transactions
    /// must already be finished.
    pub fn close(&mut self) {
        if self.initialized.swap(false, Ordering::SeqCst) {
            info!("environment closed at {:?}", self.path);
        }
        self.map = None;
        self.file = None;
    }

    // -- internals -------------------------------------------------------

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn committed(&self) -> Committed {
        lock(&self.committed).clone()
    }

    pub(crate) fn snapshot_slots(&self) -> &SnapshotSlots {
        &self.slots
    }

    pub(crate) fn acquire_writer(&self) -> Result<()> {
        self.write_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        self.write_active.store(false, Ordering::Release);
    }

    pub(crate) fn register_reader(&self) -> Result<()> {
        loop {
            let readers = self.num_readers.load(Ordering::Acquire);
            if readers >= self.max_readers {
                return Err(Error::ReadersFull);
            }
            if self
                .num_readers
                .compare_exchange(readers, readers + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub(crate) fn release_reader(&self) {
        self.num_readers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Persist and publish a committed snapshot: meta page on disk, the
    /// committed-head slot, then the lock-free snapshot slots.
    pub(crate) fn publish(&self, meta: Meta, catalog: Arc<TreeCatalog>) -> Result<()> {
        self.write_meta_page(meta.txnid & 1, &meta);
        if !self.flags.contains(EnvFlags::NOSYNC) {
            self.mmap().flush()?;
        } else if !self.flags.contains(EnvFlags::NOMETASYNC) {
            let offset = (meta.txnid & 1) as usize * self.page_size;
            self.mmap().flush_range(offset, self.page_size)?;
        }
        {
            let mut committed = lock(&self.committed);
            committed.meta = meta;
            committed.catalog = catalog;
        }
        self.slots.publish(&meta);
        Ok(())
    }

    pub(crate) fn max_trees(&self) -> usize {
        self.max_trees
    }

    pub(crate) fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn map_limit(&self) -> usize {
        self.map_size
    }

    fn mmap(&self) -> &MmapRaw {
        // Transactions only exist for an open environment.
        self.map.as_ref().unwrap()
    }

    pub(crate) fn map_base_addr(&self) -> usize {
        self.mmap().as_ptr() as usize
    }

    /// Raw address of `offset` within page `pgno`.
    pub(crate) fn page_addr(&self, pgno: PageNo, offset: usize) -> usize {
        self.map_base_addr() + pgno as usize * self.page_size + offset
    }

    pub(crate) fn write_header(&self, pgno: PageNo, flags: PageFlags, used: u32) {
        let header = PageHeader::new(pgno, flags, used);
        unsafe { std::ptr::write(self.page_addr(pgno, 0) as *mut PageHeader, header) }
    }

    pub(crate) fn read_header(&self, pgno: PageNo) -> PageHeader {
        unsafe { std::ptr::read(self.page_addr(pgno, 0) as *const PageHeader) }
    }

    /// Copy `bytes` into the map starting at `offset` within `pgno`.
    /// Overflow writes may run past the page into its continuation pages.
    pub(crate) fn write_bytes(&self, pgno: PageNo, offset: usize, bytes: &[u8]) {
        debug_assert!(pgno as usize * self.page_size + offset + bytes.len() <= self.map_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.page_addr(pgno, offset) as *mut u8,
                bytes.len(),
            )
        }
    }

    fn write_meta_page(&self, slot: u64, meta: &Meta) {
        self.write_header(slot, PageFlags::META, META_DISK_LEN as u32);
        self.write_bytes(slot, PAGE_HDR, &encode_meta(meta));
    }

    fn read_meta_page(&self, slot: u64) -> Result<Meta> {
        let bytes =
            unsafe { std::slice::from_raw_parts(self.page_addr(slot, PAGE_HDR) as *const u8, META_DISK_LEN) };
        decode_meta(bytes)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.close();
    }
}
