use crate::error::{Error, Result};

/// In/out buffer for the previous-value capture of
/// [`Tree::replace`](crate::Tree::replace).
///
/// In normal mode the buffer receives a copy of the value that existed
/// before the call mutated the store. In duplicate-selection mode
/// (`CURRENT | NO_OVERWRITE`) the filled prefix is instead read as input:
/// it names which duplicate of a multi-valued key to replace or delete.
#[derive(Debug)]
pub struct ValueBuf<'b> {
    buf: &'b mut [u8],
    filled: usize,
    required: usize,
}

impl<'b> ValueBuf<'b> {
    /// Wrap an empty output buffer.
    pub fn new(buf: &'b mut [u8]) -> Self {
        ValueBuf {
            buf,
            filled: 0,
            required: 0,
        }
    }

    /// Wrap a buffer whose first `len` bytes are meaningful — used to pass
    /// the duplicate-selection bytes in.
    pub fn with_filled(buf: &'b mut [u8], len: usize) -> Self {
        let filled = len.min(buf.len());
        ValueBuf {
            buf,
            filled,
            required: filled,
        }
    }

    /// The meaningful prefix of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// After a `ResultTrue` failure of the default preserver: the size the
    /// caller's buffer would have needed.
    pub fn required(&self) -> usize {
        self.required
    }

    /// Copy `src` into the buffer. Reports `ResultTrue` and records the
    /// required size when the buffer is too small, leaving the store
    /// untouched (the caller retries with a larger buffer).
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        if self.buf.len() < src.len() {
            self.filled = 0;
            self.required = src.len();
            return Err(Error::ResultTrue);
        }
        self.buf[..src.len()].copy_from_slice(src);
        self.filled = src.len();
        self.required = src.len();
        Ok(())
    }

    pub(crate) fn mark_absent(&mut self) {
        self.filled = 0;
        self.required = 0;
    }
}

/// Where the previous value ended up after a `replace` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preserved<'txn> {
    /// The matched page was clean: copy-on-write leaves its bytes intact,
    /// so the reference stays valid for the rest of the transaction.
    Stable(&'txn [u8]),
    /// The matched page was already dirty and could be overwritten by the
    /// mutation; the bytes were copied out through the preserver first.
    Copied,
    /// No previous value existed.
    Absent,
}

impl<'txn> Preserved<'txn> {
    /// The previous value, reading copied bytes back out of `buf`.
    pub fn bytes<'a>(&self, buf: &'a ValueBuf<'_>) -> Option<&'a [u8]>
    where
        'txn: 'a,
    {
        match self {
            Preserved::Stable(bytes) => Some(bytes),
            Preserved::Copied => Some(buf.filled()),
            Preserved::Absent => None,
        }
    }
}

/// The preserver every `replace` without a custom callback uses: a plain
/// byte copy into the caller's buffer.
pub fn default_preserver(target: &mut ValueBuf<'_>, src: &[u8]) -> Result<()> {
    target.write(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_copies_and_records_length() {
        let mut backing = [0u8; 8];
        let mut buf = ValueBuf::new(&mut backing);
        buf.write(b"abc").unwrap();
        assert_eq!(buf.filled(), b"abc");
    }

    #[test]
    fn write_too_small_reports_required_size() {
        let mut backing = [0u8; 2];
        let mut buf = ValueBuf::new(&mut backing);
        assert_eq!(buf.write(b"abcdef"), Err(Error::ResultTrue));
        assert_eq!(buf.required(), 6);
        assert_eq!(buf.filled(), b"");
    }

    #[test]
    fn selection_prefix_is_readable() {
        let mut backing = *b"needle--";
        let buf = ValueBuf::with_filled(&mut backing, 6);
        assert_eq!(buf.filled(), b"needle");
    }
}
