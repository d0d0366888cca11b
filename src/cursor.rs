use std::collections::BTreeMap;
use std::ops::Bound;

use log::{error, trace};

use crate::constants::{NodeFlags, PageFlags, TreeFlags, TxnFlags, WriteFlags, SUBPAGE_MAX_ITEMS};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::page::{overflow_pages, PageNo, PAGE_HDR};
use crate::transaction::Transaction;
use crate::tree::{shape, subtree_height, Entry, NodeShape, Payload, Tree, TreeId};

/// Positioning modes understood by `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeekOp {
    /// Exact key match.
    Set,
    /// First entry whose key is >= the given key.
    SetLowerBound,
    /// Exact (key, value) pair; positions the inner cursor on that
    /// duplicate.
    GetBoth,
}

/// What `del` removes at the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DelScope {
    /// Only the duplicate the inner cursor points at (or the single value).
    Current,
    /// The key and every one of its values.
    AllDups,
}

// Leaf page layout after the header: klen u32, vlen u32, key bytes, payload.
const LEAF_FIXED: usize = 8;

/// Registers a cursor on the transaction's per-tree active list for the
/// duration of a mutating call, so structural changes can account for
/// live positions. Unregistered on drop.
pub(crate) struct TrackGuard<'t, 'e> {
    txn: &'t Transaction<'e>,
    tree: TreeId,
}

impl<'t, 'e> TrackGuard<'t, 'e> {
    pub(crate) fn new(txn: &'t Transaction<'e>, tree: TreeId) -> Self {
        txn.track_cursor(tree);
        TrackGuard { txn, tree }
    }
}

impl Drop for TrackGuard<'_, '_> {
    fn drop(&mut self) {
        self.txn.untrack_cursor(self.tree);
    }
}

/// A transient pairing of an outer position in the requested tree and an
/// optional inner position in a dup-sort nested sub-tree. Owned by the
/// call that creates it and destroyed at call return.
pub(crate) struct CursorCouple<'t, 'e> {
    txn: &'t Transaction<'e>,
    tree: TreeId,
    pub(crate) tree_flags: TreeFlags,
    /// Outer position: the current key.
    key: Option<Box<[u8]>>,
    /// Inner position: the current duplicate value.
    dup: Option<Box<[u8]>>,
}

impl<'t, 'e> CursorCouple<'t, 'e> {
    /// Bind a cursor to a transaction + tree pair, validating the tree id
    /// against the transaction's view of the catalog.
    pub(crate) fn init(txn: &'t Transaction<'e>, tree: &Tree) -> Result<Self> {
        let tree_flags = txn.with_trees(|cat| {
            cat.trees
                .get(tree.id())
                .map(|snap| snap.flags)
                .ok_or(Error::InvalidArgument)
        })?;
        Ok(CursorCouple {
            txn,
            tree: tree.id(),
            tree_flags,
            key: None,
            dup: None,
        })
    }

    fn env(&self) -> &'e Environment {
        self.txn.env()
    }

    fn is_dupsort(&self) -> bool {
        self.tree_flags.contains(TreeFlags::DUP_SORT)
    }

    fn slice(&self, raw: (usize, usize)) -> &'t [u8] {
        // Pages a snapshot can reach are never rewritten by a concurrent
        // writer (copy-on-write goes to freshly allocated pages), so the
        // bytes stay stable for the transaction's lifetime.
        unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) }
    }

    /// Position the cursor and return the entry's key and value.
    pub(crate) fn seek(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
        op: SeekOp,
    ) -> Result<(&'t [u8], &'t [u8])> {
        let env = self.env();
        let tree = self.tree;
        let mut pos_key: Option<Box<[u8]>> = None;
        let mut pos_dup: Option<Box<[u8]>> = None;
        let (kref, vref) = self.txn.with_trees(|cat| {
            let snap = &cat.trees[tree];
            let (entry_key, entry) = match op {
                SeekOp::Set | SeekOp::GetBoth => {
                    snap.entries.get_key_value(key).ok_or(Error::NotFound)?
                }
                SeekOp::SetLowerBound => snap
                    .entries
                    .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                    .next()
                    .ok_or(Error::NotFound)?,
            };
            let kref = key_ref(env, entry_key.len(), entry);
            let (vref, dup) = match op {
                SeekOp::GetBoth => {
                    let want = value.ok_or(Error::InvalidArgument)?;
                    locate_value(env, entry_key.len(), entry, want)?
                }
                _ => first_value(env, entry_key.len(), entry)?,
            };
            pos_key = Some(entry_key.clone());
            pos_dup = dup;
            Ok((kref, vref))
        })?;
        self.key = pos_key;
        self.dup = pos_dup;
        Ok((self.slice(kref), self.slice(vref)))
    }

    /// Number of values carried by the entry at the current position.
    pub(crate) fn count(&self) -> Result<u64> {
        let key = self.key.as_deref().ok_or(Error::InvalidArgument)?;
        self.txn.with_trees(|cat| {
            let entry = cat.trees[self.tree]
                .entries
                .get(key)
                .ok_or(Error::NotFound)?;
            entry_items(entry)
        })
    }

    /// The page holding the bytes of the value at the current position;
    /// what the copy-before-mutate decision of `replace` is made from.
    pub(crate) fn current_value_page(&self) -> Result<PageNo> {
        let key = self.key.as_deref().ok_or(Error::InvalidArgument)?;
        let dup = self.dup.as_deref();
        self.txn.with_trees(|cat| {
            let entry = cat.trees[self.tree]
                .entries
                .get(key)
                .ok_or(Error::NotFound)?;
            match (&entry.payload, shape(entry)?) {
                (Payload::Big { head, .. }, NodeShape::Big) => Ok(*head),
                (Payload::SubTree { values, .. }, NodeShape::SubTree { .. }) => match dup {
                    Some(want) => values.get(want).copied().ok_or(Error::NotFound),
                    None => values.values().next().copied().ok_or(Error::NotFound),
                },
                _ => Ok(entry.leaf),
            }
        })
    }

    /// Checked insert at the cursor. Flag handling that needs the whole
    /// multi-value set (`CURRENT` disambiguation, delete-all-then-insert)
    /// happens in the facade before this is called.
    pub(crate) fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        let env = self.env();
        let txn = self.txn;
        let tree = self.tree;
        let dupsort = self.is_dupsort();
        let cur_dup = self.dup.clone();
        trace!(
            "put tree={} klen={} vlen={} flags={:?}",
            tree,
            key.len(),
            value.len(),
            flags
        );
        let reserve_store;
        let value: &[u8] = if flags.contains(WriteFlags::RESERVE) {
            // Reservations are zero-filled; callers overwrite them with a
            // later update.
            reserve_store = vec![0u8; value.len()];
            &reserve_store
        } else {
            value
        };
        txn.with_trees_mut(|cat| {
            let snap = &mut cat.trees[tree];
            let existing = snap.entries.get(key).cloned();
            match existing {
                None => {
                    if flags.contains(WriteFlags::CURRENT) {
                        return Err(Error::NotFound);
                    }
                    if flags.contains(WriteFlags::APPEND) {
                        if let Some((last, _)) = snap.entries.iter().next_back() {
                            if key <= &last[..] {
                                return Err(Error::KeyExist);
                            }
                        }
                    }
                    let entry = write_single(env, txn, None, key, value)?;
                    snap.entries.insert(key.into(), entry);
                    snap.items += 1;
                }
                Some(old) => {
                    // An explicit update may carry NO_OVERWRITE as a mode
                    // marker; only a plain insert treats it as a conflict.
                    if !flags.contains(WriteFlags::CURRENT)
                        && flags.contains(WriteFlags::NO_OVERWRITE)
                    {
                        return Err(Error::KeyExist);
                    }
                    if !dupsort {
                        let entry = write_single(env, txn, Some(&old), key, value)?;
                        snap.entries.insert(key.into(), entry);
                    } else {
                        let old_count = entry_items(&old)?;
                        let mut dups = collect_dups(env, key.len(), &old)?;
                        if flags.contains(WriteFlags::CURRENT) {
                            if flags.contains(WriteFlags::ALL_DUPS) {
                                // Replace the entire value set.
                                dups.clear();
                                dups.push(value.into());
                            } else {
                                // Replace the duplicate at the inner
                                // position (single-valued unless the
                                // facade seeked one out).
                                let target = match &cur_dup {
                                    Some(sel) => sel.clone(),
                                    None => dups.first().cloned().ok_or(Error::NotFound)?,
                                };
                                let at = dups
                                    .binary_search_by(|d| (&d[..]).cmp(&target[..]))
                                    .map_err(|_| Error::NotFound)?;
                                dups.remove(at);
                                if let Err(at) =
                                    dups.binary_search_by(|d| (&d[..]).cmp(value))
                                {
                                    dups.insert(at, value.into());
                                }
                            }
                        } else {
                            if flags.contains(WriteFlags::APPEND_DUP) {
                                if let Some(last) = dups.last() {
                                    if value <= &last[..] {
                                        return Err(Error::KeyExist);
                                    }
                                }
                            }
                            match dups.binary_search_by(|d| (&d[..]).cmp(value)) {
                                Ok(_) => {
                                    if flags.contains(WriteFlags::NO_DUP_DATA) {
                                        return Err(Error::KeyExist);
                                    }
                                    // Set semantics: the pair already exists.
                                    return Ok(());
                                }
                                Err(at) => dups.insert(at, value.into()),
                            }
                        }
                        let entry = rebuild_dups(env, txn, &old, key, &dups)?;
                        snap.items = snap.items - old_count + dups.len() as u64;
                        snap.entries.insert(key.into(), entry);
                    }
                }
            }
            txn.add_flags(TxnFlags::DIRTY);
            Ok(())
        })
    }

    /// Delete at the cursor.
    pub(crate) fn del(&mut self, scope: DelScope) -> Result<()> {
        let env = self.env();
        let txn = self.txn;
        let tree = self.tree;
        let dupsort = self.is_dupsort();
        let key = self.key.clone().ok_or(Error::InvalidArgument)?;
        let dup = self.dup.clone();
        trace!("del tree={} klen={} scope={:?}", tree, key.len(), scope);
        let result = txn.with_trees_mut(|cat| {
            let snap = &mut cat.trees[tree];
            let old = snap.entries.get(&key[..]).cloned().ok_or(Error::NotFound)?;
            let old_count = entry_items(&old)?;
            let whole = matches!(scope, DelScope::AllDups) || !dupsort || old_count <= 1;
            if whole {
                retire_entry(txn, &old);
                snap.entries.remove(&key[..]);
                snap.items -= old_count;
            } else {
                let target = dup.clone().ok_or(Error::InvalidArgument)?;
                let mut dups = collect_dups(env, key.len(), &old)?;
                let at = dups
                    .binary_search_by(|d| (&d[..]).cmp(&target[..]))
                    .map_err(|_| Error::NotFound)?;
                dups.remove(at);
                let entry = rebuild_dups(env, txn, &old, &key, &dups)?;
                snap.entries.insert(key.clone(), entry);
                snap.items -= 1;
            }
            txn.add_flags(TxnFlags::DIRTY);
            Ok(())
        });
        self.key = None;
        self.dup = None;
        result
    }

    /// Walk every distinct key and fold each entry's nesting depth into a
    /// bitmask: bit 0 for flat values, bit 1 for a single sub-page, bit
    /// `height` for a nested sub-tree. Not applicable without `DUP_SORT`.
    pub(crate) fn depth_scan(&mut self) -> Result<u32> {
        if !self.is_dupsort() {
            return Err(Error::ResultTrue);
        }
        let tree = self.tree;
        self.txn.with_trees(|cat| {
            let snap = &cat.trees[tree];
            let mut mask = 0u32;
            for entry in snap.entries.values() {
                match shape(entry) {
                    Ok(NodeShape::Inline) | Ok(NodeShape::Big) => mask |= 1 << 0,
                    Ok(NodeShape::SubPage) => mask |= 1 << 1,
                    Ok(NodeShape::SubTree { height }) => mask |= 1u32 << height.min(31),
                    Err(err) => {
                        error!("depth scan: invalid node shape in tree {}", tree);
                        return Err(err);
                    }
                }
            }
            Ok(mask)
        })
    }
}

// ---------------------------------------------------------------------------
// Page materialization: every reference handed to a caller points into the
// map, never into the catalog.

fn key_ref(env: &Environment, klen: usize, entry: &Entry) -> (usize, usize) {
    (env.page_addr(entry.leaf, PAGE_HDR + LEAF_FIXED), klen)
}

fn inline_ref(env: &Environment, klen: usize, entry: &Entry, len: u32) -> (usize, usize) {
    (
        env.page_addr(entry.leaf, PAGE_HDR + LEAF_FIXED + klen),
        len as usize,
    )
}

fn subpage_ref(env: &Environment, entry: &Entry, offset: u32, len: u32) -> (usize, usize) {
    (env.page_addr(entry.leaf, offset as usize), len as usize)
}

fn dup_page_ref(env: &Environment, pgno: PageNo, len: usize) -> (usize, usize) {
    (env.page_addr(pgno, PAGE_HDR), len)
}

/// First (lowest-sorting) value of an entry, plus the inner position it
/// implies for dup-sort shapes.
fn first_value(
    env: &Environment,
    klen: usize,
    entry: &Entry,
) -> Result<((usize, usize), Option<Box<[u8]>>)> {
    match (&entry.payload, shape(entry)?) {
        (Payload::Inline { len }, NodeShape::Inline) => Ok((inline_ref(env, klen, entry, *len), None)),
        (Payload::Big { head, len, .. }, NodeShape::Big) => {
            Ok((dup_page_ref(env, *head, *len as usize), None))
        }
        (Payload::SubPage { offsets }, NodeShape::SubPage) => {
            let &(offset, len) = offsets.first().ok_or(Error::Corrupted)?;
            let raw = subpage_ref(env, entry, offset, len);
            let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
            Ok((raw, Some(bytes.into())))
        }
        (Payload::SubTree { values, .. }, NodeShape::SubTree { .. }) => {
            let (val, &pgno) = values.iter().next().ok_or(Error::Corrupted)?;
            Ok((dup_page_ref(env, pgno, val.len()), Some(val.clone())))
        }
        _ => Err(Error::Corrupted),
    }
}

/// Locate an exact value among an entry's values (`GetBoth`).
fn locate_value(
    env: &Environment,
    klen: usize,
    entry: &Entry,
    want: &[u8],
) -> Result<((usize, usize), Option<Box<[u8]>>)> {
    match (&entry.payload, shape(entry)?) {
        (Payload::Inline { len }, NodeShape::Inline) => {
            let raw = inline_ref(env, klen, entry, *len);
            let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
            if bytes == want {
                Ok((raw, None))
            } else {
                Err(Error::NotFound)
            }
        }
        (Payload::Big { head, len, .. }, NodeShape::Big) => {
            let raw = dup_page_ref(env, *head, *len as usize);
            let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
            if bytes == want {
                Ok((raw, None))
            } else {
                Err(Error::NotFound)
            }
        }
        (Payload::SubPage { offsets }, NodeShape::SubPage) => {
            for &(offset, len) in offsets {
                let raw = subpage_ref(env, entry, offset, len);
                let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
                if bytes == want {
                    return Ok((raw, Some(want.into())));
                }
            }
            Err(Error::NotFound)
        }
        (Payload::SubTree { values, .. }, NodeShape::SubTree { .. }) => {
            let (val, &pgno) = values.get_key_value(want).ok_or(Error::NotFound)?;
            Ok((dup_page_ref(env, pgno, val.len()), Some(val.clone())))
        }
        _ => Err(Error::Corrupted),
    }
}

pub(crate) fn entry_items(entry: &Entry) -> Result<u64> {
    Ok(match (&entry.payload, shape(entry)?) {
        (Payload::SubPage { offsets }, NodeShape::SubPage) => offsets.len() as u64,
        (Payload::SubTree { values, .. }, NodeShape::SubTree { .. }) => values.len() as u64,
        _ => 1,
    })
}

/// Read every value of an entry into owned, sorted form for a rebuild.
fn collect_dups(env: &Environment, klen: usize, entry: &Entry) -> Result<Vec<Box<[u8]>>> {
    match (&entry.payload, shape(entry)?) {
        (Payload::Inline { len }, NodeShape::Inline) => {
            let raw = inline_ref(env, klen, entry, *len);
            let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
            Ok(vec![bytes.into()])
        }
        (Payload::Big { head, len, .. }, NodeShape::Big) => {
            let raw = dup_page_ref(env, *head, *len as usize);
            let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
            Ok(vec![bytes.into()])
        }
        (Payload::SubPage { offsets }, NodeShape::SubPage) => Ok(offsets
            .iter()
            .map(|&(offset, len)| {
                let raw = subpage_ref(env, entry, offset, len);
                let bytes = unsafe { std::slice::from_raw_parts(raw.0 as *const u8, raw.1) };
                bytes.into()
            })
            .collect()),
        (Payload::SubTree { values, .. }, NodeShape::SubTree { .. }) => {
            Ok(values.keys().cloned().collect())
        }
        _ => Err(Error::Corrupted),
    }
}

// ---------------------------------------------------------------------------
// Copy-on-write page builders.

/// Pick the leaf page a rewrite goes to: in place when the old leaf is
/// already owned by this transaction, a fresh page otherwise. A clean old
/// leaf stays untouched for older snapshots and is recorded as freed.
fn cow_leaf(txn: &Transaction<'_>, old: Option<&Entry>) -> Result<PageNo> {
    if let Some(entry) = old {
        if txn.is_page_dirty(entry.leaf) {
            return Ok(entry.leaf);
        }
        txn.mark_free(entry.leaf);
    }
    txn.alloc_pages(1)
}

fn write_leaf(env: &Environment, pgno: PageNo, key: &[u8], vlen_field: u32, payload: &[u8]) {
    let used = (LEAF_FIXED + key.len() + payload.len()) as u32;
    env.write_header(pgno, PageFlags::LEAF, used);
    env.write_bytes(pgno, PAGE_HDR, &(key.len() as u32).to_le_bytes());
    env.write_bytes(pgno, PAGE_HDR + 4, &vlen_field.to_le_bytes());
    env.write_bytes(pgno, PAGE_HDR + LEAF_FIXED, key);
    env.write_bytes(pgno, PAGE_HDR + LEAF_FIXED + key.len(), payload);
}

/// Store a single-valued entry: inline when the value fits the leaf,
/// otherwise a run of overflow pages.
fn write_single(
    env: &Environment,
    txn: &Transaction<'_>,
    old: Option<&Entry>,
    key: &[u8],
    value: &[u8],
) -> Result<Entry> {
    if let Some(entry) = old {
        retire_payload(txn, entry);
    }
    let capacity = env.page_size() - PAGE_HDR - LEAF_FIXED - key.len();
    let leaf = cow_leaf(txn, old)?;
    if value.len() <= capacity {
        write_leaf(env, leaf, key, value.len() as u32, value);
        Ok(Entry {
            leaf,
            node_flags: NodeFlags::empty(),
            payload: Payload::Inline {
                len: value.len() as u32,
            },
        })
    } else {
        write_leaf(env, leaf, key, value.len() as u32, &[]);
        let pages = overflow_pages(value.len(), env.page_size());
        let head = txn.alloc_pages(pages)?;
        env.write_header(head, PageFlags::OVERFLOW, pages as u32);
        env.write_bytes(head, PAGE_HDR, value);
        Ok(Entry {
            leaf,
            node_flags: NodeFlags::BIG_DATA,
            payload: Payload::Big {
                head,
                pages: pages as u32,
                len: value.len() as u32,
            },
        })
    }
}

/// Store a multi-valued entry in the shape its size dictates: back to a
/// single value, a packed sub-page, or a nested sub-tree with one page
/// per value.
fn rebuild_dups(
    env: &Environment,
    txn: &Transaction<'_>,
    old: &Entry,
    key: &[u8],
    dups: &[Box<[u8]>],
) -> Result<Entry> {
    if dups.len() == 1 {
        return write_single(env, txn, Some(old), key, &dups[0]);
    }
    let packed: usize = dups.iter().map(|d| 4 + d.len()).sum();
    let fits_subpage = dups.len() <= SUBPAGE_MAX_ITEMS
        && LEAF_FIXED + key.len() + packed <= env.page_size() - PAGE_HDR;
    if fits_subpage {
        retire_payload(txn, old);
        let leaf = cow_leaf(txn, Some(old))?;
        let mut payload = Vec::with_capacity(packed);
        let mut offsets = Vec::with_capacity(dups.len());
        let base = PAGE_HDR + LEAF_FIXED + key.len();
        for dup in dups {
            offsets.push(((base + payload.len() + 4) as u32, dup.len() as u32));
            payload.extend_from_slice(&(dup.len() as u32).to_le_bytes());
            payload.extend_from_slice(dup);
        }
        write_leaf(env, leaf, key, dups.len() as u32, &payload);
        return Ok(Entry {
            leaf,
            node_flags: NodeFlags::DUP_DATA,
            payload: Payload::SubPage { offsets },
        });
    }

    // Sub-tree: one page per value; pages of values that survive the
    // rebuild are kept as-is.
    let old_values = match &old.payload {
        Payload::SubTree { values, .. } => Some(values),
        _ => None,
    };
    let mut values = BTreeMap::new();
    for dup in dups {
        let pgno = match old_values.and_then(|ov| ov.get(dup)) {
            Some(&pgno) => pgno,
            None => {
                let pgno = txn.alloc_pages(1)?;
                env.write_header(pgno, PageFlags::LEAF, dup.len() as u32);
                env.write_bytes(pgno, PAGE_HDR, dup);
                pgno
            }
        };
        values.insert(dup.clone(), pgno);
    }
    let (leaf, was_subtree) = match old_values {
        Some(ov) => {
            for (val, &pgno) in ov {
                if !values.contains_key(val) {
                    txn.mark_free(pgno);
                }
            }
            // The leaf carries only the key for a sub-tree entry; it is
            // unchanged by value churn.
            (old.leaf, true)
        }
        None => {
            retire_payload(txn, old);
            (cow_leaf(txn, Some(old))?, false)
        }
    };
    if !was_subtree {
        write_leaf(env, leaf, key, 0, &[]);
    }
    Ok(Entry {
        leaf,
        node_flags: NodeFlags::DUP_DATA | NodeFlags::SUB_DATA,
        payload: Payload::SubTree {
            height: subtree_height(dups.len() as u64),
            values,
        },
    })
}

/// Record an entry's non-leaf pages as freed.
fn retire_payload(txn: &Transaction<'_>, entry: &Entry) {
    match &entry.payload {
        Payload::Inline { .. } | Payload::SubPage { .. } => {}
        Payload::Big { head, pages, .. } => txn.mark_free_run(*head, *pages as u64),
        Payload::SubTree { values, .. } => {
            for &pgno in values.values() {
                txn.mark_free(pgno);
            }
        }
    }
}

/// Record every page of an entry as freed (whole-entry delete).
fn retire_entry(txn: &Transaction<'_>, entry: &Entry) {
    retire_payload(txn, entry);
    txn.mark_free(entry.leaf);
}
