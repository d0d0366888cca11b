use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Store error codes
///
/// Every failure of the public API is one of these variants; no panic
/// crosses the API boundary. `ResultTrue` is a non-error sentinel whose
/// meaning is documented per call: "not applicable" for
/// [`Tree::dupsort_depth_mask`](crate::Tree::dupsort_depth_mask) on a tree
/// without duplicates, "buffer too small, required size recorded" for the
/// default preserver of [`Tree::replace`](crate::Tree::replace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Null/zero key, unsupported flag bits, or a pointer that does not
    /// reference the start of a logical page's data
    #[error("invalid argument")]
    InvalidArgument,
    /// Transaction is in the wrong lifecycle state for this operation
    #[error("transaction is not in a usable state")]
    BadTransaction,
    /// Call issued from a thread that does not own the transaction
    #[error("transaction is owned by another thread")]
    ThreadMismatch,
    /// Write operation through a read-only transaction or environment
    #[error("write access denied")]
    Access,
    /// Key/value pair already exists
    #[error("key/value pair already exists")]
    KeyExist,
    /// No matching key/value pair found
    #[error("no matching key/value pair found")]
    NotFound,
    /// The key holds multiple values and the call did not select one
    #[error("key holds multiple values; explicit selection required")]
    MultiValue,
    /// A stored invariant was violated; the file is corrupted
    #[error("store is corrupted")]
    Corrupted,
    /// Non-error sentinel; meaning is documented per call
    #[error("result-true sentinel")]
    ResultTrue,
    /// Another write transaction is active on this environment
    #[error("writer slot is busy")]
    Busy,
    /// Environment mapsize limit reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// Environment max-trees limit reached
    #[error("environment maxtrees limit reached")]
    TreesFull,
    /// Environment max-readers limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// File is not a valid store file
    #[error("file is not a valid store file")]
    Invalid,
    /// Store version mismatch
    #[error("store version mismatch")]
    VersionMismatch,
    /// Underlying I/O failure
    #[error("i/o failure: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err.kind())
    }
}
