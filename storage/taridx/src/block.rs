//! Fixed-size, hash-framed pages and the records stored in them.
//!
//! Every page starts with a fixed frame:
//!
//! ```text
//! offset 0..7    the literal `hash = `
//! offset 7..71   64 hex digits: SHA-256 of the page with this field
//!                blanked to spaces
//! offset 71      `\n`
//! offset 72..    line-oriented payload, terminated by a line `end`
//! remainder      NUL padding up to the page size
//! ```
//!
//! The payload grammar is `key = <int>` lines plus at most one list block
//! (`key = {` … `}`), one comma-separated row per line with `,` and `\`
//! backslash-escaped. The grammar is deliberately not JSON: the insert
//! path budgets free space per record, so serialized size must be
//! predictable from the record alone.

use sha2::{Digest, Sha256};

use crate::{escape, Error};

/// Length of the hex-encoded SHA-256 digest.
const HASH_HEX_LEN: usize = 64;
/// Byte offset of the digest field, right after `hash = `.
const HASH_OFFSET: usize = 7;
/// Byte offset of the first payload byte.
pub(crate) const DATA_OFFSET: usize = HASH_OFFSET + HASH_HEX_LEN + 1;

const BLANK_HASH: [u8; HASH_HEX_LEN] = [b' '; HASH_HEX_LEN];

/// A fixed-size page with an embedded integrity digest.
#[derive(Debug, Clone)]
pub(crate) struct Page {
    bytes: Vec<u8>,
}

impl Page {
    /// Seal `text` into a page of `size` bytes, computing the digest.
    pub(crate) fn compose(text: &str, size: usize) -> Result<Self, Error> {
        if DATA_OFFSET + text.len() > size {
            return Err(Error::RecordOverflow {
                size: DATA_OFFSET + text.len(),
                capacity: size,
            });
        }
        let mut bytes = vec![0u8; size];
        bytes[..HASH_OFFSET].copy_from_slice(b"hash = ");
        bytes[HASH_OFFSET..HASH_OFFSET + HASH_HEX_LEN].copy_from_slice(&BLANK_HASH);
        bytes[HASH_OFFSET + HASH_HEX_LEN] = b'\n';
        bytes[DATA_OFFSET..DATA_OFFSET + text.len()].copy_from_slice(text.as_bytes());

        let digest = hex::encode(Sha256::digest(&bytes));
        bytes[HASH_OFFSET..HASH_OFFSET + HASH_HEX_LEN].copy_from_slice(digest.as_bytes());
        Ok(Self { bytes })
    }

    /// Wrap raw bytes read from disk. Verification is deferred to
    /// [`Page::is_valid`].
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Recompute the digest over the page with the digest field blanked
    /// and compare it against the stored one.
    pub(crate) fn is_valid(&self) -> bool {
        if self.bytes.len() < DATA_OFFSET {
            return false;
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes[..HASH_OFFSET]);
        hasher.update(BLANK_HASH);
        hasher.update(&self.bytes[HASH_OFFSET + HASH_HEX_LEN..]);
        let digest = hex::encode(hasher.finalize());
        digest.as_bytes() == &self.bytes[HASH_OFFSET..HASH_OFFSET + HASH_HEX_LEN]
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn payload(&self) -> &[u8] {
        &self.bytes[DATA_OFFSET..]
    }
}

/// One member as the index sees it: a name and where its payload lives
/// in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    /// Member name, at most `max_name_len` bytes, no raw newlines.
    pub name: String,
    /// Byte offset of the first payload byte in the archive.
    pub offset: u64,
    /// Payload length in bytes.
    pub size: u64,
}

impl MemberRecord {
    pub(crate) fn new(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
        }
    }
}

/// A separator and the logical block of the child subtree it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    /// Smallest key reachable through `child`.
    pub key: String,
    /// Logical block number of the child node.
    pub child: u64,
}

/// Items of a tree node, discriminated by node kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeItems {
    Leaf(Vec<MemberRecord>),
    Children(Vec<ChildRecord>),
}

impl NodeItems {
    pub(crate) fn len(&self) -> usize {
        match self {
            NodeItems::Leaf(items) => items.len(),
            NodeItems::Children(items) => items.len(),
        }
    }
}

/// The serialized form of a tree node. The sequence number is owned by
/// the block store, which stamps it at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub block_no: u64,
    pub items: NodeItems,
}

impl NodeRecord {
    pub(crate) fn empty_leaf(block_no: u64) -> Self {
        Self {
            block_no,
            items: NodeItems::Leaf(Vec::new()),
        }
    }

    /// Serialize; key order (`leaf`, `blockno`, `items`, `seqno`) is part
    /// of the file format.
    pub(crate) fn to_text(&self, seqno: Option<u64>) -> String {
        let mut out = String::new();
        let leaf = matches!(self.items, NodeItems::Leaf(_));
        out.push_str(&format!("leaf = {}\n", leaf as u8));
        out.push_str(&format!("blockno = {}\n", self.block_no));
        out.push_str("items = {\n");
        match &self.items {
            NodeItems::Leaf(items) => {
                for item in items {
                    out.push_str(&format!(
                        "{},{},{}\n",
                        escape::escape(&item.name),
                        item.offset,
                        item.size
                    ));
                }
            }
            NodeItems::Children(items) => {
                for item in items {
                    out.push_str(&format!("{},{}\n", escape::escape(&item.key), item.child));
                }
            }
        }
        out.push_str("}\n");
        if let Some(seqno) = seqno {
            out.push_str(&format!("seqno = {}\n", seqno));
        }
        out.push_str("end\n");
        out
    }

    /// On-disk footprint of the node, excluding the sequence number line
    /// (the free-space budget keeps headroom for it and one more record).
    pub(crate) fn store_size(&self) -> usize {
        DATA_OFFSET + self.to_text(None).len()
    }

    /// Decode a node and its sequence number from a verified page.
    pub(crate) fn decode(page: &Page) -> Option<(Self, u64)> {
        let raw = RawRecord::parse(page.payload())?;
        let leaf = raw.int("leaf")? != 0;
        let block_no = raw.int("blockno")?;
        let seqno = raw.int("seqno")?;
        let rows = raw.rows("items")?;
        let items = if leaf {
            let mut items = Vec::with_capacity(rows.len());
            for row in rows {
                let [name, offset, size] = row.as_slice() else {
                    return None;
                };
                items.push(MemberRecord {
                    name: name.clone(),
                    offset: offset.parse().ok()?,
                    size: size.parse().ok()?,
                });
            }
            NodeItems::Leaf(items)
        } else {
            let mut items = Vec::with_capacity(rows.len());
            for row in rows {
                let [key, child] = row.as_slice() else {
                    return None;
                };
                items.push(ChildRecord {
                    key: key.clone(),
                    child: child.parse().ok()?,
                });
            }
            NodeItems::Children(items)
        };
        Some((Self { block_no, items }, seqno))
    }
}

/// The master page: the immutable geometry every later decision is
/// bounded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MasterRecord {
    pub block_size: u64,
    pub max_items: u64,
    pub max_name_len: u64,
    pub max_rec_len: u64,
}

impl MasterRecord {
    pub(crate) fn to_text(&self) -> String {
        format!(
            "blocksize = {}\nmaxitems = {}\nmaxnamelen = {}\nmaxreclen = {}\nend\n",
            self.block_size, self.max_items, self.max_name_len, self.max_rec_len
        )
    }

    pub(crate) fn decode(page: &Page) -> Option<Self> {
        let raw = RawRecord::parse(page.payload())?;
        Some(Self {
            block_size: raw.int("blocksize")?,
            max_items: raw.int("maxitems")?,
            max_name_len: raw.int("maxnamelen")?,
            max_rec_len: raw.int("maxreclen")?,
        })
    }
}

/// Parsed payload before record-specific typing.
struct RawRecord {
    ints: Vec<(String, u64)>,
    lists: Vec<(String, Vec<Vec<String>>)>,
}

impl RawRecord {
    /// Scan payload lines up to the `end` terminator. Returns `None` on
    /// any malformed line; pages are digest-checked before parsing, so a
    /// parse failure here means a software bug, not disk corruption.
    fn parse(payload: &[u8]) -> Option<Self> {
        let mut record = Self {
            ints: Vec::new(),
            lists: Vec::new(),
        };
        let mut current: Option<(String, Vec<Vec<String>>)> = None;
        for line in payload.split(|byte| *byte == b'\n') {
            let line = std::str::from_utf8(line).ok()?;
            if let Some((_, rows)) = current.as_mut() {
                if line == "}" {
                    record.lists.extend(current.take());
                } else {
                    rows.push(escape::split_fields(line));
                }
                continue;
            }
            if line == "end" {
                return Some(record);
            }
            let (key, value) = line.split_once(" = ")?;
            if value == "{" {
                current = Some((key.to_owned(), Vec::new()));
            } else {
                record.ints.push((key.to_owned(), value.parse().ok()?));
            }
        }
        // Ran off the page without seeing `end`.
        None
    }

    fn int(&self, key: &str) -> Option<u64> {
        self.ints
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| *value)
    }

    fn rows(&self, key: &str) -> Option<&Vec<Vec<String>>> {
        self.lists
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, rows)| rows)
    }
}
