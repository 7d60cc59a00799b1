//! The archive-facing handle.
//!
//! Ties the tar file and its index pair together. The write protocol is
//! ordered for crash recovery: tar bytes are durable first, then the
//! tail-log line, then the tree pages. Whatever the crash point, either
//! the index already knows the member, the tail log alone knows it (a
//! rebuild promotes it into the tree), or the trailing tar bytes are
//! garbage the next reindex skips.

use std::path::{Path, PathBuf};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{block::MemberRecord, index::MemberIndex, tar, Error, Mode};

/// A tar archive with random member access through its sidecar index.
pub struct IndexedTarFile {
    file: File,
    path: PathBuf,
    index: MemberIndex,
    mode: Mode,
}

impl IndexedTarFile {
    /// Open an archive.
    ///
    /// In [`Mode::Read`] the archive and both sidecars must exist. In
    /// [`Mode::ReadWrite`] a missing archive is created empty and a
    /// missing index pair is rebuilt from whatever the archive holds.
    pub async fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = match mode {
            Mode::Read => OpenOptions::new().read(true).open(&path).await?,
            Mode::ReadWrite => {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)
                    .await?
            }
        };
        let index = match MemberIndex::open(&path, mode).await {
            Ok(index) => index,
            Err(Error::IndexNotFound { .. }) if !mode.is_read_only() => {
                tracing::debug!(path = %path.display(), "index missing, rebuilding");
                MemberIndex::rebuild_from_tar(&path).await?;
                MemberIndex::open(&path, mode).await?
            }
            Err(error) => return Err(error),
        };
        Ok(Self {
            file,
            path,
            index,
            mode,
        })
    }

    /// Append a member and index it. A later write with the same name
    /// shadows this one; the bytes stay in the archive either way.
    pub async fn write(&mut self, name: &str, data: &[u8]) -> Result<(), Error> {
        if self.mode.is_read_only() {
            return Err(Error::ReadOnly {
                path: self.path.clone(),
            });
        }
        let geometry = self.index.geometry();
        if name.len() > geometry.max_name_len {
            return Err(Error::NameTooLong {
                length: name.len(),
                limit: geometry.max_name_len,
            });
        }
        if name.contains('\n') {
            return Err(Error::InvalidName);
        }

        let end = self.file.seek(std::io::SeekFrom::End(0)).await?;
        let header = tar::encode_member_header(name, data.len() as u64, unix_now());
        let offset = end + header.len() as u64;

        self.file.write_all(&header).await?;
        self.file.write_all(data).await?;
        let remainder = data.len() % tar::BLOCK;
        if remainder > 0 {
            self.file.write_all(&vec![0u8; tar::BLOCK - remainder]).await?;
        }
        self.file.flush().await?;
        self.file.sync_data().await?;

        self.index.insert(name, offset, data.len() as u64).await
    }

    /// Read the latest indexed payload for `name`.
    pub async fn read(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let entry = self.index.lookup(name).await?;
        self.file
            .seek(std::io::SeekFrom::Start(entry.offset))
            .await?;
        let mut data = vec![0u8; entry.size as usize];
        self.file.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Membership test against the index alone.
    pub async fn exist(&mut self, name: &str) -> Result<bool, Error> {
        self.index.exist(name).await
    }

    /// The most recently written member, from the tail log alone.
    pub async fn last(&mut self) -> Result<Option<MemberRecord>, Error> {
        self.index.last().await
    }

    /// Read several members in order.
    pub async fn readlist(&mut self, names: &[&str]) -> Result<Vec<Vec<u8>>, Error> {
        let mut payloads = Vec::with_capacity(names.len());
        for name in names {
            payloads.push(self.read(name).await?);
        }
        Ok(payloads)
    }

    /// Write several members in order.
    pub async fn writelist(&mut self, members: &[(&str, &[u8])]) -> Result<(), Error> {
        for (name, data) in members {
            self.write(name, data).await?;
        }
        Ok(())
    }

    /// Verify the tree invariants of the live index.
    pub async fn check(&mut self, deep: bool) -> Result<(), Error> {
        self.index.check(deep).await
    }

    /// Rebuild this archive's index pair and switch to it.
    pub async fn reindex(&mut self) -> Result<u64, Error> {
        if !self.mode.is_read_only() {
            self.file.sync_data().await?;
        }
        let count = MemberIndex::rebuild_from_tar(&self.path).await?;
        // the rebuild renamed fresh files over the pair this handle had
        // open; reopen so lookups see the new index
        self.index = MemberIndex::open(&self.path, self.mode).await?;
        Ok(count)
    }

    /// Rebuild the index pair for an archive without holding a handle.
    pub async fn reindex_path(path: impl AsRef<Path>) -> Result<u64, Error> {
        MemberIndex::rebuild_from_tar(path).await
    }

    /// Flush and close the archive.
    pub async fn close(self) -> Result<(), Error> {
        if !self.mode.is_read_only() {
            self.file.sync_all().await?;
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use tempfile::tempdir;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    use super::IndexedTarFile;
    use crate::{tar, Error, Mode};

    #[tokio::test]
    async fn fresh_archive_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("new.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;

        assert!(archive.last().await?.is_none());
        assert!(!archive.exist("x").await?);
        assert!(dir.path().join("new.tar.pytree").exists());
        assert!(dir.path().join("new.tar.pylst").exists());
        archive.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn read_mode_requires_the_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.tar");
        std::fs::write(&path, []).unwrap();

        assert!(matches!(
            IndexedTarFile::open(&path, Mode::Read).await,
            Err(Error::IndexNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn write_and_read_back_in_random_order() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("objects.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;

        let mut rng = StdRng::seed_from_u64(7);
        let mut members = Vec::new();
        for i in 0..100usize {
            // sizes straddling the padding boundaries
            let size = [0, 1, 100, 511, 512, 513, 2000][i % 7];
            let mut data = vec![0u8; size];
            rng.fill(data.as_mut_slice());
            let name = format!("obj-{i}");
            archive.write(&name, &data).await?;
            members.push((name, data));
        }

        let mut order: Vec<usize> = (0..members.len()).collect();
        order.shuffle(&mut rng);
        for i in order {
            let (name, data) = &members[i];
            assert_eq!(&archive.read(name).await?, data);
        }
        archive.check(true).await?;
        archive.close().await?;

        // everything still there through a read-only reopen
        let mut archive = IndexedTarFile::open(&path, Mode::Read).await?;
        for (name, data) in &members {
            assert_eq!(&archive.read(name).await?, data);
        }
        assert_eq!(archive.last().await?.unwrap().name, "obj-99");
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_shadows_but_archive_keeps_growing() -> Result<()> {
        let dir = tempdir()?;
        let mut archive =
            IndexedTarFile::open(dir.path().join("shadow.tar"), Mode::ReadWrite).await?;

        for i in 0..10 {
            archive.write(&format!("obj-{i}"), b"original").await?;
        }
        archive.write("obj-5", b"replacement").await?;

        assert_eq!(archive.read("obj-5").await?, b"replacement");
        assert_eq!(archive.read("obj-4").await?, b"original");
        assert_eq!(archive.last().await?.unwrap().name, "obj-5");
        Ok(())
    }

    #[tokio::test]
    async fn batch_operations() -> Result<()> {
        let dir = tempdir()?;
        let mut archive =
            IndexedTarFile::open(dir.path().join("batch.tar"), Mode::ReadWrite).await?;

        archive
            .writelist(&[("a", b"one".as_slice()), ("b", b"two"), ("c", b"three")])
            .await?;
        let payloads = archive.readlist(&["c", "a"]).await?;
        assert_eq!(payloads, vec![b"three".to_vec(), b"one".to_vec()]);
        Ok(())
    }

    #[tokio::test]
    async fn long_names_survive_write_read_and_reindex() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("long.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;

        let long = "d".repeat(160);
        archive.write(&long, b"long-name payload").await?;
        archive.write("short", b"short-name payload").await?;
        assert_eq!(archive.read(&long).await?, b"long-name payload");

        archive.reindex().await?;
        assert_eq!(archive.read(&long).await?, b"long-name payload");
        assert_eq!(archive.read("short").await?, b"short-name payload");
        Ok(())
    }

    #[tokio::test]
    async fn torn_insert_recovers_through_reindex() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("torn.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;
        for i in 0..5 {
            archive.write(&format!("obj-{i}"), b"data").await?;
        }
        archive.close().await?;

        // replay a crash between the tail-log flush and the tree write:
        // the tar bytes and the log line exist, the tree never saw them
        let mut tar = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        let end = tar.seek(std::io::SeekFrom::End(0)).await?;
        let payload = b"late payload";
        tar.write_all(&tar::encode_member_header(
            "obj-100",
            payload.len() as u64,
            1_700_000_000,
        ))
        .await?;
        tar.write_all(payload).await?;
        tar.write_all(&vec![0u8; 512 - payload.len()]).await?;
        drop(tar);
        let mut log = tokio::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("torn.tar.pylst"))
            .await?;
        log.write_all(format!("obj-100,{},{}\n", end + 512, payload.len()).as_bytes())
            .await?;
        drop(log);

        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;
        assert_eq!(archive.last().await?.unwrap().name, "obj-100");
        assert!(!archive.exist("obj-100").await?);

        archive.reindex().await?;
        assert!(archive.exist("obj-100").await?);
        assert_eq!(archive.read("obj-100").await?, payload);
        assert_eq!(archive.last().await?.unwrap().name, "obj-100");
        Ok(())
    }

    #[tokio::test]
    async fn reindex_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stable.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;
        for i in 0..50 {
            archive
                .write(&format!("obj-{i:03}"), format!("payload {i}").as_bytes())
                .await?;
        }
        archive.close().await?;

        IndexedTarFile::reindex_path(&path).await?;
        let tree_once = std::fs::read(dir.path().join("stable.tar.pytree"))?;
        let list_once = std::fs::read(dir.path().join("stable.tar.pylst"))?;

        IndexedTarFile::reindex_path(&path).await?;
        let tree_twice = std::fs::read(dir.path().join("stable.tar.pytree"))?;
        let list_twice = std::fs::read(dir.path().join("stable.tar.pylst"))?;

        assert_eq!(tree_once, tree_twice);
        assert_eq!(list_once, list_twice);

        let mut archive = IndexedTarFile::open(&path, Mode::Read).await?;
        for i in 0..50 {
            assert_eq!(
                archive.read(&format!("obj-{i:03}")).await?,
                format!("payload {i}").as_bytes()
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn torn_tree_slot_is_recovered_from_its_twin() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("resilient.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;
        // enough ascending members to split the root; the left half lands
        // on block 2 and is never rewritten afterwards, so both its slots
        // hold the same page
        for i in 0..60 {
            archive.write(&format!("obj-{i:02}"), b"payload").await?;
        }
        archive.close().await?;

        // zero the digest of the first slot of block 2 (block-unit 3)
        let mut tree = tokio::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("resilient.tar.pytree"))
            .await?;
        tree.seek(std::io::SeekFrom::Start(3 * 1024 + 7)).await?;
        tree.write_all(&[0u8; 64]).await?;
        drop(tree);

        let mut archive = IndexedTarFile::open(&path, Mode::Read).await?;
        archive.check(true).await?;
        for i in 0..60 {
            assert_eq!(archive.read(&format!("obj-{i:02}")).await?, b"payload");
        }
        Ok(())
    }

    #[tokio::test]
    async fn read_only_rejects_writes() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("frozen.tar");
        let mut archive = IndexedTarFile::open(&path, Mode::ReadWrite).await?;
        archive.write("obj-0", b"data").await?;
        archive.close().await?;

        let mut archive = IndexedTarFile::open(&path, Mode::Read).await?;
        assert!(matches!(
            archive.write("obj-1", b"data").await,
            Err(Error::ReadOnly { .. })
        ));
        Ok(())
    }
}
