use std::collections::{BTreeMap, HashMap};

use log::trace;
use once_cell::sync::Lazy;

use crate::constants::{
    NodeFlags, TreeFlags, TxnFlags, WriteFlags, MAIN_TREE, SUBPAGE_MAX_ITEMS, SUBTREE_FANOUT,
};
use crate::cursor::{CursorCouple, DelScope, SeekOp, TrackGuard};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::page::PageNo;
use crate::transaction::Transaction;
use crate::types::TreeStat;
use crate::value::{default_preserver, Preserved, ValueBuf};

/// Tree identifier within an environment's catalog.
pub(crate) type TreeId = usize;

/// Flag bits a put call may carry.
static PUT_MASK: Lazy<WriteFlags> = Lazy::new(|| {
    WriteFlags::NO_OVERWRITE
        | WriteFlags::NO_DUP_DATA
        | WriteFlags::ALL_DUPS
        | WriteFlags::RESERVE
        | WriteFlags::APPEND
        | WriteFlags::APPEND_DUP
        | WriteFlags::CURRENT
        | WriteFlags::MULTIPLE
});

/// Flag bits a replace call may carry.
static REPLACE_MASK: Lazy<WriteFlags> = Lazy::new(|| {
    WriteFlags::NO_OVERWRITE
        | WriteFlags::NO_DUP_DATA
        | WriteFlags::ALL_DUPS
        | WriteFlags::RESERVE
        | WriteFlags::APPEND
        | WriteFlags::APPEND_DUP
        | WriteFlags::CURRENT
});

/// The storage shape of a key's entry, decoded once at the point of
/// access. Only these four shapes are legal; anything else is corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeShape {
    /// Single value stored in the leaf page.
    Inline,
    /// Single value stored in a run of overflow pages.
    Big,
    /// Multiple values packed into the leaf page.
    SubPage,
    /// Multiple values in a nested sub-tree of the given height.
    SubTree { height: u16 },
}

/// A key's record in the catalog: the leaf page holding its bytes plus
/// the shape tag and shape-specific payload.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub leaf: PageNo,
    pub node_flags: NodeFlags,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Inline {
        len: u32,
    },
    Big {
        head: PageNo,
        pages: u32,
        len: u32,
    },
    /// Absolute (page offset, length) of each packed value, sorted by
    /// value bytes.
    SubPage {
        offsets: Vec<(u32, u32)>,
    },
    /// One page per value, keyed by the value bytes.
    SubTree {
        height: u16,
        values: BTreeMap<Box<[u8]>, PageNo>,
    },
}

/// Decode an entry's shape tag, cross-checked against its payload.
pub(crate) fn shape(entry: &Entry) -> Result<NodeShape> {
    let flags = entry.node_flags;
    match &entry.payload {
        Payload::Inline { .. } if flags.is_empty() => Ok(NodeShape::Inline),
        Payload::Big { .. } if flags == NodeFlags::BIG_DATA => Ok(NodeShape::Big),
        Payload::SubPage { .. } if flags == NodeFlags::DUP_DATA => Ok(NodeShape::SubPage),
        Payload::SubTree { height, .. }
            if flags == NodeFlags::DUP_DATA | NodeFlags::SUB_DATA =>
        {
            Ok(NodeShape::SubTree { height: *height })
        }
        _ => Err(Error::Corrupted),
    }
}

/// Stored height of a nested sub-tree holding `items` values.
pub(crate) fn subtree_height(items: u64) -> u16 {
    let mut height = 2u16;
    let mut capacity = SUBPAGE_MAX_ITEMS as u64 * SUBTREE_FANOUT;
    while items > capacity {
        height += 1;
        capacity = capacity.saturating_mul(SUBTREE_FANOUT);
    }
    height
}

/// One tree's state within a committed (or in-progress) catalog.
#[derive(Debug, Clone)]
pub(crate) struct TreeSnapshot {
    pub flags: TreeFlags,
    pub entries: BTreeMap<Box<[u8]>, Entry>,
    /// Data items, duplicates included.
    pub items: u64,
}

impl TreeSnapshot {
    pub(crate) fn new(flags: TreeFlags) -> Self {
        TreeSnapshot {
            flags,
            entries: BTreeMap::new(),
            items: 0,
        }
    }
}

/// The set of trees visible at one snapshot. Immutable once published; a
/// write transaction works on a private clone.
#[derive(Debug, Clone)]
pub(crate) struct TreeCatalog {
    pub trees: Vec<TreeSnapshot>,
    pub names: HashMap<String, TreeId>,
}

impl TreeCatalog {
    pub(crate) fn new() -> Self {
        TreeCatalog {
            trees: vec![TreeSnapshot::new(TreeFlags::empty())],
            names: HashMap::new(),
        }
    }
}

/// Handle to a named key space. Cheap to copy; valid for any transaction
/// whose snapshot can see the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
    id: TreeId,
    flags: TreeFlags,
}

impl Tree {
    /// Open a tree by name; `None` names the always-present unnamed tree.
    /// With `TreeFlags::CREATE` a missing tree is created (write
    /// transactions only) and becomes visible to others at commit.
    pub fn open(txn: &Transaction<'_>, name: Option<&str>, flags: TreeFlags) -> Result<Tree> {
        txn.check()?;
        let want = flags & TreeFlags::DUP_SORT;
        let existing = match name {
            None => Some((MAIN_TREE, txn.with_trees(|cat| Ok(cat.trees[MAIN_TREE].flags))?)),
            Some(n) => {
                if n.is_empty() {
                    return Err(Error::InvalidArgument);
                }
                txn.with_trees(|cat| {
                    Ok(cat.names.get(n).map(|&id| (id, cat.trees[id].flags)))
                })?
            }
        };
        if let Some((id, actual)) = existing {
            if want != actual & TreeFlags::DUP_SORT {
                return Err(Error::InvalidArgument);
            }
            return Ok(Tree { id, flags: actual });
        }
        if !flags.contains(TreeFlags::CREATE) {
            return Err(Error::NotFound);
        }
        if txn.is_read_only() {
            return Err(Error::Access);
        }
        let name = name.ok_or(Error::InvalidArgument)?;
        let max_trees = txn.env().max_trees();
        let id = txn.with_trees_mut(|cat| {
            if cat.trees.len() >= max_trees {
                return Err(Error::TreesFull);
            }
            let id = cat.trees.len();
            cat.trees.push(TreeSnapshot::new(want));
            cat.names.insert(name.to_string(), id);
            Ok(id)
        })?;
        txn.add_flags(TxnFlags::DIRTY);
        trace!("created tree {:?} id={} flags={:?}", name, id, want);
        Ok(Tree { id, flags: want })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn flags(&self) -> TreeFlags {
        self.flags
    }

    /// Look up a key and return a reference to its value (the first
    /// duplicate for a multi-valued key), valid for the rest of the
    /// transaction.
    pub fn get<'t>(&self, txn: &'t Transaction<'_>, key: &[u8]) -> Result<&'t [u8]> {
        txn.check()?;
        validate_key(txn.env(), key)?;
        trace!("get tree={} klen={}", self.id, key.len());
        let mut cursor = CursorCouple::init(txn, self)?;
        let (_, value) = cursor.seek(key, None, SeekOp::Set)?;
        Ok(value)
    }

    /// Position at the first entry whose key is >= `key` (lower bound)
    /// and return that entry's key and value.
    pub fn get_equal_or_greater<'t>(
        &self,
        txn: &'t Transaction<'_>,
        key: &[u8],
    ) -> Result<(&'t [u8], &'t [u8])> {
        txn.check()?;
        validate_key(txn.env(), key)?;
        let mut cursor = CursorCouple::init(txn, self)?;
        cursor.seek(key, None, SeekOp::SetLowerBound)
    }

    /// Exact lookup that also reports how many values the key holds: 1
    /// for single-valued keys, the nested sub-tree's item count otherwise,
    /// saturating at `usize::MAX`.
    pub fn get_with_count<'t>(
        &self,
        txn: &'t Transaction<'_>,
        key: &[u8],
    ) -> Result<(&'t [u8], usize)> {
        txn.check()?;
        validate_key(txn.env(), key)?;
        let mut cursor = CursorCouple::init(txn, self)?;
        let (_, value) = cursor.seek(key, None, SeekOp::Set)?;
        let count = usize::try_from(cursor.count()?).unwrap_or(usize::MAX);
        Ok((value, count))
    }

    /// Insert or update a key/value pair.
    ///
    /// `CURRENT` updates an existing key in place; on a dup-sort tree it
    /// is refused with `MultiValue` when the key holds several values,
    /// unless `NO_OVERWRITE` is passed alongside as the "replace the whole
    /// value set with this one value" sentinel.
    pub fn put(
        &self,
        txn: &Transaction<'_>,
        key: &[u8],
        value: &[u8],
        mut flags: WriteFlags,
    ) -> Result<()> {
        txn.check_rw()?;
        validate_key(txn.env(), key)?;
        if !PUT_MASK.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        if flags.contains(WriteFlags::MULTIPLE) {
            // No fixed-size duplicate mode in this store.
            return Err(Error::InvalidArgument);
        }
        let mut cursor = CursorCouple::init(txn, self)?;
        let dupsort = cursor.tree_flags.contains(TreeFlags::DUP_SORT);
        if flags.contains(WriteFlags::RESERVE) && dupsort {
            return Err(Error::InvalidArgument);
        }
        let _tracked = TrackGuard::new(txn, self.id);

        // Explicit update: position first, and deal with multi-valued keys.
        if flags.contains(WriteFlags::CURRENT) {
            cursor.seek(key, None, SeekOp::Set)?;
            if dupsort && !flags.contains(WriteFlags::ALL_DUPS) && cursor.count()? > 1 {
                if !flags.contains(WriteFlags::NO_OVERWRITE) {
                    return Err(Error::MultiValue);
                }
                flags.remove(WriteFlags::CURRENT);
                cursor.del(DelScope::AllDups)?;
            }
        }

        cursor.put(key, value, flags)
    }

    /// Delete a key's value(s): every value when `value` is `None`, only
    /// the exact pair otherwise.
    pub fn delete(&self, txn: &Transaction<'_>, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        txn.check_rw()?;
        validate_key(txn.env(), key)?;
        let mut cursor = CursorCouple::init(txn, self)?;
        let _tracked = TrackGuard::new(txn, self.id);
        match value {
            Some(value) => {
                cursor.seek(key, Some(value), SeekOp::GetBoth)?;
                cursor.del(DelScope::Current)
            }
            None => {
                cursor.seek(key, None, SeekOp::Set)?;
                cursor.del(DelScope::AllDups)
            }
        }
    }

    /// Update or delete a record while capturing the value it held before
    /// the call, using the default byte-copy preserver. See
    /// [`Tree::replace_with`].
    pub fn replace<'t>(
        &self,
        txn: &'t Transaction<'_>,
        key: &[u8],
        new_value: Option<&[u8]>,
        old_value: &mut ValueBuf<'_>,
        flags: WriteFlags,
    ) -> Result<Preserved<'t>> {
        let mut preserver = default_preserver;
        self.replace_with(txn, key, new_value, old_value, flags, &mut preserver)
    }

    /// Read-modify-write with previous-value capture.
    ///
    /// Normal mode: `old_value` receives the existing value. If its page
    /// is already dirty the bytes are copied out through `preserver`
    /// before the mutation may overwrite them (`Preserved::Copied`); a
    /// clean page survives the copy-on-write, so the reference itself is
    /// returned (`Preserved::Stable`). With `new_value = None` the record
    /// is deleted instead (requires `CURRENT`). A `new_value` equal to the
    /// existing value is a no-op that still reports the old value.
    ///
    /// Duplicate-selection mode, chosen by passing `CURRENT` and
    /// `NO_OVERWRITE` together (a combination meaningless on its own):
    /// `old_value` is read as input naming which duplicate of a
    /// multi-valued key to replace or delete.
    pub fn replace_with<'t>(
        &self,
        txn: &'t Transaction<'_>,
        key: &[u8],
        new_value: Option<&[u8]>,
        old_value: &mut ValueBuf<'_>,
        mut flags: WriteFlags,
        preserver: &mut dyn FnMut(&mut ValueBuf<'_>, &[u8]) -> Result<()>,
    ) -> Result<Preserved<'t>> {
        txn.check_rw()?;
        validate_key(txn.env(), key)?;
        if !REPLACE_MASK.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        if new_value.is_none()
            && flags & (WriteFlags::CURRENT | WriteFlags::RESERVE) != WriteFlags::CURRENT
        {
            return Err(Error::InvalidArgument);
        }
        let mut cursor = CursorCouple::init(txn, self)?;
        let dupsort = cursor.tree_flags.contains(TreeFlags::DUP_SORT);
        if flags.contains(WriteFlags::RESERVE) && dupsort {
            return Err(Error::InvalidArgument);
        }
        let _tracked = TrackGuard::new(txn, self.id);

        if flags.contains(WriteFlags::CURRENT | WriteFlags::NO_OVERWRITE) {
            // old_value selects which duplicate to touch.
            if !dupsort {
                return Err(Error::InvalidArgument);
            }
            // Drop the marker bit; it only signaled this mode.
            flags.remove(WriteFlags::NO_OVERWRITE);
            let selection = old_value.filled().to_vec();
            cursor.seek(key, Some(selection.as_slice()), SeekOp::GetBoth)?;
            match new_value {
                Some(value) => cursor.put(key, value, flags)?,
                None => cursor.del(del_scope(flags))?,
            }
            return Ok(Preserved::Copied);
        }

        let preserved = match cursor.seek(key, None, SeekOp::Set) {
            Err(Error::NotFound) => {
                old_value.mark_absent();
                if flags.contains(WriteFlags::CURRENT) {
                    return Err(Error::NotFound);
                }
                Preserved::Absent
            }
            Err(err) => return Err(err),
            Ok((_, present)) => {
                if flags.contains(WriteFlags::NO_OVERWRITE) {
                    preserver(old_value, present)?;
                    return Err(Error::KeyExist);
                }
                if dupsort && flags.contains(WriteFlags::CURRENT) && cursor.count()? > 1 {
                    return Err(Error::MultiValue);
                }
                if let Some(value) = new_value {
                    if value == present {
                        // Nothing would change; the bytes stay put.
                        return Ok(Preserved::Stable(present));
                    }
                }
                let value_page = cursor.current_value_page()?;
                let preserved = if txn.is_page_dirty(value_page) {
                    preserver(old_value, present)?;
                    Preserved::Copied
                } else {
                    Preserved::Stable(present)
                };
                flags.insert(WriteFlags::CURRENT);
                preserved
            }
        };

        match new_value {
            Some(value) => cursor.put(key, value, flags)?,
            None => cursor.del(del_scope(flags))?,
        }
        Ok(preserved)
    }

    /// Enumerate the nesting depths present across a dup-sort tree as a
    /// bitmask: bit 0 for flat values, bit 1 for single sub-pages, bit
    /// `height` for each nested sub-tree height. `Err(ResultTrue)` means
    /// "not applicable" (the tree has no duplicates) — nothing is scanned.
    pub fn dupsort_depth_mask(&self, txn: &Transaction<'_>) -> Result<u32> {
        txn.check()?;
        let mut cursor = CursorCouple::init(txn, self)?;
        cursor.depth_scan()
    }

    /// Entry counts for this tree at the transaction's snapshot.
    pub fn stat(&self, txn: &Transaction<'_>) -> Result<TreeStat> {
        txn.check()?;
        let id = self.id;
        txn.with_trees(|cat| {
            let snap = cat.trees.get(id).ok_or(Error::InvalidArgument)?;
            Ok(TreeStat {
                entries: snap.items,
                keys: snap.entries.len() as u64,
            })
        })
    }
}

fn del_scope(flags: WriteFlags) -> DelScope {
    if flags.contains(WriteFlags::ALL_DUPS) {
        DelScope::AllDups
    } else {
        DelScope::Current
    }
}

fn validate_key(env: &Environment, key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > env.max_key_size() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}
