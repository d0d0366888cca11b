use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crate::constants::{STORE_MAGIC, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
use crate::error::{Error, Result};
use crate::page::PageNo;

/// Store format version packed into one word for the meta page.
pub(crate) const STORE_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

/// Caller-defined version counters replicated verbatim across commits.
///
/// `x`, `y`, `z` belong to the application; `v` is stamped with the id of
/// the write transaction that last changed them. The engine never
/// interprets any of the four.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Canary {
    pub x: u64,
    pub y: u64,
    pub z: u64,
    pub v: u64,
}

/// Allocated page range of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    /// First page not yet handed out
    pub first_unallocated: PageNo,
    /// One past the last mappable page
    pub end_pgno: PageNo,
}

/// Committed snapshot metadata; immutable once published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Meta {
    pub txnid: u64,
    pub geo: Geometry,
    pub canary: Canary,
}

struct MetaCells {
    txnid: AtomicU64,
    first_unallocated: AtomicU64,
    end_pgno: AtomicU64,
    canary_x: AtomicU64,
    canary_y: AtomicU64,
    canary_z: AtomicU64,
    canary_v: AtomicU64,
}

impl MetaCells {
    const fn new() -> Self {
        MetaCells {
            txnid: AtomicU64::new(0),
            first_unallocated: AtomicU64::new(0),
            end_pgno: AtomicU64::new(0),
            canary_x: AtomicU64::new(0),
            canary_y: AtomicU64::new(0),
            canary_z: AtomicU64::new(0),
            canary_v: AtomicU64::new(0),
        }
    }

    fn store(&self, meta: &Meta) {
        self.txnid.store(meta.txnid, Ordering::Relaxed);
        self.first_unallocated
            .store(meta.geo.first_unallocated, Ordering::Relaxed);
        self.end_pgno.store(meta.geo.end_pgno, Ordering::Relaxed);
        self.canary_x.store(meta.canary.x, Ordering::Relaxed);
        self.canary_y.store(meta.canary.y, Ordering::Relaxed);
        self.canary_z.store(meta.canary.z, Ordering::Relaxed);
        self.canary_v.store(meta.canary.v, Ordering::Relaxed);
    }

    fn load(&self) -> Meta {
        Meta {
            txnid: self.txnid.load(Ordering::Relaxed),
            geo: Geometry {
                first_unallocated: self.first_unallocated.load(Ordering::Relaxed),
                end_pgno: self.end_pgno.load(Ordering::Relaxed),
            },
            canary: Canary {
                x: self.canary_x.load(Ordering::Relaxed),
                y: self.canary_y.load(Ordering::Relaxed),
                z: self.canary_z.load(Ordering::Relaxed),
                v: self.canary_v.load(Ordering::Relaxed),
            },
        }
    }
}

/// Handle a reader holds across one tap of the snapshot slots.
pub(crate) struct SnapshotToken {
    seq: u64,
}

/// Lock-free publication of the most recently committed meta.
///
/// Two fixed slots selected by `txnid & 1`, guarded by a sequence counter
/// that is odd while the writer is publishing. Readers copy the recent
/// slot and re-check the sequence; a changed sequence means the copy may
/// be torn and must be discarded. Readers never block the writer.
pub(crate) struct SnapshotSlots {
    sequence: AtomicU64,
    recent: AtomicUsize,
    slots: [MetaCells; 2],
}

impl SnapshotSlots {
    pub(crate) fn new() -> Self {
        SnapshotSlots {
            sequence: AtomicU64::new(0),
            recent: AtomicUsize::new(0),
            slots: [MetaCells::new(), MetaCells::new()],
        }
    }

    /// Seed both slots before the environment starts serving.
    pub(crate) fn seed(&self, meta: &Meta) {
        self.slots[0].store(meta);
        self.slots[1].store(meta);
        self.recent
            .store((meta.txnid & 1) as usize, Ordering::Relaxed);
        self.sequence.store(0, Ordering::Release);
    }

    /// Publish a newly committed meta. Writer-side only; at most one
    /// publisher runs at a time (writer exclusivity).
    pub(crate) fn publish(&self, meta: &Meta) {
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        let slot = (meta.txnid & 1) as usize;
        self.slots[slot].store(meta);
        self.recent.store(slot, Ordering::Relaxed);
        fence(Ordering::Release);
        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Begin a read attempt: spin past any in-flight publish.
    pub(crate) fn tap(&self) -> SnapshotToken {
        loop {
            let seq = self.sequence.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return SnapshotToken { seq };
            }
            std::hint::spin_loop();
        }
    }

    /// Copy the most recent slot. The copy is only trustworthy once
    /// `should_retry` has reported false for the same token.
    pub(crate) fn most_recent(&self, _token: &SnapshotToken) -> Meta {
        let slot = self.recent.load(Ordering::Relaxed);
        let meta = self.slots[slot].load();
        fence(Ordering::Acquire);
        meta
    }

    /// Whether the last copy raced a concurrent publish. Refreshes the
    /// token so the caller can loop.
    pub(crate) fn should_retry(&self, token: &mut SnapshotToken) -> bool {
        let seq = self.sequence.load(Ordering::Acquire);
        if seq == token.seq {
            return false;
        }
        *token = self.tap();
        true
    }

    /// Read a settled copy of the most recent meta, retrying torn reads.
    pub(crate) fn recent_settled(&self) -> Meta {
        let mut token = self.tap();
        loop {
            let meta = self.most_recent(&token);
            if !self.should_retry(&mut token) {
                return meta;
            }
        }
    }
}

// On-disk meta page layout: magic, version, then seven little-endian u64
// fields. One copy per meta page; the slot written alternates by txnid.
pub(crate) const META_DISK_LEN: usize = 4 + 4 + 8 * 7;

pub(crate) fn encode_meta(meta: &Meta) -> [u8; META_DISK_LEN] {
    let mut buf = [0u8; META_DISK_LEN];
    buf[0..4].copy_from_slice(&STORE_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&STORE_VERSION.to_le_bytes());
    let fields = [
        meta.txnid,
        meta.geo.first_unallocated,
        meta.geo.end_pgno,
        meta.canary.x,
        meta.canary.y,
        meta.canary.z,
        meta.canary.v,
    ];
    for (i, field) in fields.iter().enumerate() {
        buf[8 + i * 8..16 + i * 8].copy_from_slice(&field.to_le_bytes());
    }
    buf
}

pub(crate) fn decode_meta(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_DISK_LEN {
        return Err(Error::Invalid);
    }
    let word32 = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
    let word64 = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
    if word32(0) != STORE_MAGIC {
        return Err(Error::Invalid);
    }
    if word32(4) != STORE_VERSION {
        return Err(Error::VersionMismatch);
    }
    Ok(Meta {
        txnid: word64(8),
        geo: Geometry {
            first_unallocated: word64(16),
            end_pgno: word64(24),
        },
        canary: Canary {
            x: word64(32),
            y: word64(40),
            z: word64(48),
            v: word64(56),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn sample(txnid: u64) -> Meta {
        Meta {
            txnid,
            geo: Geometry {
                first_unallocated: txnid + 2,
                end_pgno: 1024,
            },
            canary: Canary {
                x: txnid,
                y: txnid * 2,
                z: txnid * 3,
                v: txnid,
            },
        }
    }

    #[test]
    fn disk_roundtrip() {
        let meta = sample(42);
        let decoded = decode_meta(&encode_meta(&meta)).unwrap();
        assert_eq!(decoded.txnid, 42);
        assert_eq!(decoded.geo.first_unallocated, 44);
        assert_eq!(decoded.canary.y, 84);
    }

    #[test]
    fn decode_rejects_bad_magic_and_version() {
        let mut buf = encode_meta(&sample(1));
        buf[0] ^= 0xff;
        assert_eq!(decode_meta(&buf), Err(Error::Invalid));
        let mut buf = encode_meta(&sample(1));
        buf[4] ^= 0xff;
        assert_eq!(decode_meta(&buf), Err(Error::VersionMismatch));
    }

    #[test]
    fn tap_sees_published_meta() {
        let slots = SnapshotSlots::new();
        slots.seed(&sample(0));
        slots.publish(&sample(7));
        let meta = slots.recent_settled();
        assert_eq!(meta.txnid, 7);
        assert_eq!(meta.canary.z, 21);
    }

    #[test]
    fn concurrent_publish_never_yields_torn_meta() {
        let slots = Arc::new(SnapshotSlots::new());
        slots.seed(&sample(0));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let slots = Arc::clone(&slots);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for txnid in 1..=2000u64 {
                    slots.publish(&sample(txnid));
                }
                stop.store(true, Ordering::Release);
            })
        };

        // Every settled read must be internally consistent: all fields
        // derived from the same txnid.
        while !stop.load(Ordering::Acquire) {
            let meta = slots.recent_settled();
            assert_eq!(meta.geo.first_unallocated, meta.txnid + 2);
            assert_eq!(meta.canary.y, meta.txnid * 2);
            assert_eq!(meta.canary.z, meta.txnid * 3);
        }
        writer.join().unwrap();
    }
}
