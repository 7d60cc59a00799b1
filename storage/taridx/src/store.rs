//! The paged file backing a tree.
//!
//! Layout: one master page of [`MASTER_BLOCK_SIZE`] bytes (padded to a
//! full block), then two physical slots per logical block. Logical block
//! `B ≥ 1` lives at block-units `2B − 1` and `2B`; each slot is an
//! independently hashed page carrying its own sequence number. Reads
//! serve whichever valid slot has the higher sequence number. Writes to
//! an existing block overwrite the *loser* slot, so the current winner
//! stays on disk until the new page is durable — a torn write costs one
//! update, never the block.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    block::{MasterRecord, NodeRecord, Page},
    Error, Mode,
};

/// Size of the master page. Smaller than a data block; the remainder of
/// block-unit 0 is NUL padding.
pub const MASTER_BLOCK_SIZE: usize = 512;

/// Immutable store parameters, fixed at creation and recorded in the
/// master page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Size of every data block (and of the file's block unit).
    pub block_size: usize,
    /// A node splits when it reaches this many items.
    pub max_items: usize,
    /// Longest accepted member name, in bytes.
    pub max_name_len: usize,
    /// Upper bound on one serialized record; nodes keep this much free
    /// space so the next insert always fits.
    pub max_rec_len: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        let max_name_len = 160;
        Self {
            block_size: 1024,
            max_items: 100,
            max_name_len,
            // name + two 15-digit integers + separators and newline
            max_rec_len: max_name_len + 2 * 15 + 3,
        }
    }
}

impl Geometry {
    fn to_master(self) -> MasterRecord {
        MasterRecord {
            block_size: self.block_size as u64,
            max_items: self.max_items as u64,
            max_name_len: self.max_name_len as u64,
            max_rec_len: self.max_rec_len as u64,
        }
    }

    fn from_master(master: MasterRecord) -> Self {
        Self {
            block_size: master.block_size as usize,
            max_items: master.max_items as usize,
            max_name_len: master.max_name_len as usize,
            max_rec_len: master.max_rec_len as usize,
        }
    }
}

/// Block-level access to a tree file.
pub struct BlockStore {
    file: File,
    path: PathBuf,
    geometry: Geometry,
    read_only: bool,
    write_back: bool,
    last_block: u64,
    free_block: u64,
    dirty: IndexMap<u64, NodeRecord>,
}

impl BlockStore {
    /// Create a fresh tree file: master page plus two identical copies of
    /// an empty leaf as logical block 1. Both slots must start identical
    /// so that a later torn write still leaves one valid page behind.
    pub async fn create(path: impl AsRef<Path>, geometry: Geometry) -> Result<(), Error> {
        if MASTER_BLOCK_SIZE > geometry.block_size {
            return Err(Error::RecordOverflow {
                size: MASTER_BLOCK_SIZE,
                capacity: geometry.block_size,
            });
        }
        let mut file = File::create(path.as_ref()).await?;
        let master = Page::compose(&geometry.to_master().to_text(), MASTER_BLOCK_SIZE)?;
        file.write_all(master.bytes()).await?;
        file.write_all(&vec![0u8; geometry.block_size - MASTER_BLOCK_SIZE])
            .await?;

        let root = NodeRecord::empty_leaf(1);
        let page = Page::compose(&root.to_text(Some(1)), geometry.block_size)?;
        file.write_all(page.bytes()).await?;
        file.write_all(page.bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Open an existing tree file and read its geometry off the master
    /// page.
    pub async fn open(
        path: impl AsRef<Path>,
        mode: Mode,
        write_back: bool,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!mode.is_read_only())
            .open(&path)
            .await?;

        let mut buffer = vec![0u8; MASTER_BLOCK_SIZE];
        if file.read_exact(&mut buffer).await.is_err() {
            return Err(Error::MasterInvalid { path });
        }
        let master_page = Page::from_bytes(buffer);
        if !master_page.is_valid() {
            return Err(Error::MasterInvalid { path });
        }
        let Some(master) = MasterRecord::decode(&master_page) else {
            return Err(Error::MasterInvalid { path });
        };
        let geometry = Geometry::from_master(master);

        let length = file.metadata().await?.len();
        let block_size = geometry.block_size as u64;
        if length % block_size != 0 {
            return Err(Error::UnalignedFile { length, block_size });
        }
        let last_block = (length / block_size - 1) / 2;

        Ok(Self {
            file,
            path,
            geometry,
            read_only: mode.is_read_only(),
            write_back,
            last_block,
            free_block: last_block + 1,
            dirty: IndexMap::new(),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Hand out the next logical block number. The block is not
    /// materialized until its first write.
    pub fn allocate_block(&mut self) -> u64 {
        let block = self.free_block;
        self.free_block = block + 1;
        block
    }

    #[cfg(test)]
    pub(crate) fn free_block(&self) -> u64 {
        self.free_block
    }

    /// Highest logical block that has been written to disk. Blocks above
    /// it are allocated but not yet materialized.
    pub(crate) fn last_block(&self) -> u64 {
        self.last_block
    }

    /// Read one physical slot; `None` when it is short or fails the
    /// digest check.
    async fn read_slot(&mut self, unit: u64) -> Result<Option<Page>, Error> {
        let block_size = self.geometry.block_size;
        self.file
            .seek(std::io::SeekFrom::Start(unit * block_size as u64))
            .await?;
        let mut buffer = vec![0u8; block_size];
        match self.file.read_exact(&mut buffer).await {
            Ok(_) => {
                let page = Page::from_bytes(buffer);
                Ok(page.is_valid().then_some(page))
            }
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Read both slots of a logical block. A slot that verifies but
    /// disagrees about its own block number is a hard error, not a
    /// fallback case.
    async fn read_slots(
        &mut self,
        block: u64,
    ) -> Result<(Option<(NodeRecord, u64)>, Option<(NodeRecord, u64)>), Error> {
        if block == 0 {
            // the master page is not a logical block; a child pointer of
            // zero can only come from a corrupt record
            return Err(Error::BlockInvalid { block });
        }
        let mut slots = [None, None];
        for (index, unit) in [2 * block - 1, 2 * block].into_iter().enumerate() {
            if let Some(page) = self.read_slot(unit).await? {
                let (record, seqno) =
                    NodeRecord::decode(&page).ok_or(Error::MalformedRecord { block })?;
                if record.block_no != block || seqno == 0 {
                    return Err(Error::BlockNumberMismatch {
                        expected: block,
                        found: record.block_no,
                        seqno,
                    });
                }
                slots[index] = Some((record, seqno));
            }
        }
        let [first, second] = slots;
        Ok((first, second))
    }

    /// Return the record of the higher-sequence valid slot.
    pub async fn read_block(&mut self, block: u64) -> Result<NodeRecord, Error> {
        match self.read_slots(block).await? {
            (Some((first, s1)), Some((second, s2))) => {
                Ok(if s1 > s2 { first } else { second })
            }
            (Some((record, _)), None) | (None, Some((record, _))) => {
                tracing::debug!(block, "one slot failed verification, serving its twin");
                Ok(record)
            }
            (None, None) => Err(Error::BlockInvalid { block }),
        }
    }

    /// Write a record to its logical block.
    ///
    /// Existing blocks get the new page in the loser slot with the
    /// winner's sequence plus one. Block `last_block + 1` extends the
    /// file with two identical copies at sequence 1. Anything further out
    /// is fatal.
    pub async fn write_block(&mut self, record: &NodeRecord) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly {
                path: self.path.clone(),
            });
        }
        let block = record.block_no;
        if block == 0 || block > self.last_block + 1 {
            return Err(Error::WriteOutOfRange {
                block,
                last: self.last_block,
            });
        }

        let (seqno, unit, extend) = if block <= self.last_block {
            match self.read_slots(block).await? {
                (Some((_, s1)), Some((_, s2))) if s1 > s2 => (s1 + 1, 2 * block, false),
                (_, Some((_, s2))) => (s2 + 1, 2 * block - 1, false),
                (Some((_, s1)), None) => (s1 + 1, 2 * block, false),
                (None, None) => return Err(Error::BlockInvalid { block }),
            }
        } else {
            (1, 2 * block - 1, true)
        };

        let block_size = self.geometry.block_size;
        let page = Page::compose(&record.to_text(Some(seqno)), block_size)?;
        self.file
            .seek(std::io::SeekFrom::Start(unit * block_size as u64))
            .await?;
        self.file.write_all(page.bytes()).await?;
        if extend {
            self.file.write_all(page.bytes()).await?;
            self.last_block = block;
        }
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Record a node as dirty: written through immediately, or parked
    /// until [`BlockStore::flush`] in write-back mode.
    pub async fn set_dirty(&mut self, record: NodeRecord) -> Result<(), Error> {
        if self.write_back {
            self.dirty.insert(record.block_no, record);
            Ok(())
        } else {
            self.write_block(&record).await
        }
    }

    /// Drop a pending dirty entry. Used when a split abandons a block
    /// number: the node lives on under its new number, and the stale
    /// pending page must not be written.
    pub(crate) fn forget(&mut self, block: u64) {
        self.dirty.shift_remove(&block);
    }

    /// Write out every parked page, oldest first.
    pub async fn flush(&mut self) -> Result<(), Error> {
        let pending: Vec<NodeRecord> = self.dirty.drain(..).map(|(_, record)| record).collect();
        for record in &pending {
            self.write_block(record).await?;
        }
        Ok(())
    }
}
