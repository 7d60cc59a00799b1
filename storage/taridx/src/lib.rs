#![warn(unused_crate_dependencies)]
//! Random-access, append-only storage of named byte objects inside a
//! standard tar archive, backed by a persistent external index.
//!
//! The archive stays a legal tar file at all times; next to it live two
//! sidecar files maintained by [`MemberIndex`]:
//! * `<name>.pytree` — a block-structured B-tree mapping member name to
//!   `(offset, size)`, served by [`BlockStore`] pages kept in duplicate
//!   so a torn write never loses the tree;
//! * `<name>.pylst` — an append-only tail log, one line per insertion,
//!   answering "what was written last" and feeding index rebuilds.
//!
//! [`IndexedTarFile`] ties the three files together for callers that just
//! want `write`/`read`/`exist`/`last` over an archive.

mod archive;
mod block;
mod escape;
mod index;
mod log;
mod store;
mod tar;
mod tree;

use std::path::PathBuf;

pub use archive::IndexedTarFile;
pub use block::{ChildRecord, MemberRecord, NodeItems, NodeRecord};
pub use index::MemberIndex;
pub use log::TailLog;
pub use store::{BlockStore, Geometry, MASTER_BLOCK_SIZE};
pub use tree::{BlockTree, IndexEntry, TreeOptions};

/// How an archive or index file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read-only; all files must already exist.
    Read,
    /// Read and append; missing files are created or rebuilt.
    ReadWrite,
}

impl Mode {
    pub(crate) fn is_read_only(self) -> bool {
        matches!(self, Mode::Read)
    }
}

/// Indexed tar handling errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Both physical slots of a logical block failed hash verification.
    /// The block — and with it the tree — is unrecoverable; rebuild the
    /// index from the archive.
    #[error("both copies of block {block} failed verification")]
    BlockInvalid { block: u64 },

    /// The master page could not be read or did not verify.
    #[error("master block of {} is invalid", path.display())]
    MasterInvalid { path: PathBuf },

    /// A slot carried a well-formed page whose recorded block number or
    /// sequence number disagrees with its position in the file.
    #[error("block {found} with sequence {seqno} read where block {expected} was expected")]
    BlockNumberMismatch { expected: u64, found: u64, seqno: u64 },

    /// The index file length is not a multiple of the block size.
    #[error("index file length {length} is not a multiple of the block size {block_size}")]
    UnalignedFile { length: u64, block_size: u64 },

    /// A record was asked to fit in a page it cannot fit in. The tree
    /// splits nodes before this can happen; seeing it means the headroom
    /// accounting was violated.
    #[error("record of {size} bytes does not fit in a block of {capacity} bytes")]
    RecordOverflow { size: usize, capacity: usize },

    /// A page verified but its payload did not parse as a record.
    #[error("malformed record in block {block}")]
    MalformedRecord { block: u64 },

    /// A cross-page invariant does not hold.
    #[error("corrupt tree structure: {reason}")]
    CorruptTree { reason: &'static str },

    /// Opening in read mode with one or both sidecar files missing. In
    /// read-append mode the same condition triggers a rebuild instead.
    #[error("index files for {} not found", path.display())]
    IndexNotFound { path: PathBuf },

    /// Inserting an existing name with overwrite disabled.
    #[error("member {name} is already present")]
    Duplicate { name: String },

    /// Lookup miss.
    #[error("member {name} not found")]
    NotFound { name: String },

    /// The name does not fit in the index record budget.
    #[error("name is {length} bytes, the limit is {limit}")]
    NameTooLong { length: usize, limit: usize },

    /// Names must not contain a raw newline; the record grammar escapes
    /// only commas and backslashes.
    #[error("member names may not contain newlines")]
    InvalidName,

    /// Attempted to write more than one block past the end of the file.
    #[error("writing block {block} past the end of the file (last block is {last})")]
    WriteOutOfRange { block: u64, last: u64 },

    /// A mutating operation on a read-only handle.
    #[error("{} is open in read-only mode", path.display())]
    ReadOnly { path: PathBuf },

    /// Neither of the last two tail-log lines parsed as a record.
    #[error("unreadable records at the tail of {}", path.display())]
    CorruptTailLog { path: PathBuf },

    /// See [`IoError`](tokio::io::Error) for more information.
    #[error(transparent)]
    IoError(#[from] tokio::io::Error),
}
