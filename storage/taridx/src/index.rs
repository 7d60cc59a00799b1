//! The member index: a B-tree for lookups plus the tail log for
//! commit-order queries, kept consistent by write ordering.
//!
//! On `insert` the tail-log line is flushed to disk *before* the tree is
//! touched. A crash after the log write leaves the tree one entry behind,
//! which a rebuild recovers; the reverse order could claim a member the
//! log (and possibly the archive) never saw.

use std::path::{Path, PathBuf};

use crate::{
    block::MemberRecord,
    log::TailLog,
    store::Geometry,
    tar::Scanner,
    tree::{BlockTree, IndexEntry, TreeOptions},
    Error, Mode,
};

/// Suffix of the tree sidecar, appended to the archive path.
pub(crate) const TREE_SUFFIX: &str = ".pytree";
/// Suffix of the tail-log sidecar.
pub(crate) const LIST_SUFFIX: &str = ".pylst";

/// `<archive path> + suffix`, keeping the archive's own extension.
pub(crate) fn sidecar(tar_path: &Path, suffix: &str) -> PathBuf {
    let mut name = tar_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// The index pair next to an archive.
pub struct MemberIndex {
    tree: BlockTree,
    log: TailLog,
    path: PathBuf,
    read_only: bool,
}

impl MemberIndex {
    /// Open `<tar_path>.pytree` and `<tar_path>.pylst`. Both must exist;
    /// a missing sidecar reports [`Error::IndexNotFound`], which
    /// read-append callers answer with a rebuild.
    pub async fn open(tar_path: impl AsRef<Path>, mode: Mode) -> Result<Self, Error> {
        let tar_path = tar_path.as_ref();
        let tree_path = sidecar(tar_path, TREE_SUFFIX);
        let list_path = sidecar(tar_path, LIST_SUFFIX);
        if !tokio::fs::try_exists(&tree_path).await?
            || !tokio::fs::try_exists(&list_path).await?
        {
            return Err(Error::IndexNotFound {
                path: tar_path.to_path_buf(),
            });
        }
        let tree = BlockTree::open(&tree_path, mode, TreeOptions::default()).await?;
        let log = TailLog::open(&list_path, mode, tree.geometry().max_rec_len).await?;
        Ok(Self {
            tree,
            log,
            path: tar_path.to_path_buf(),
            read_only: mode.is_read_only(),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.tree.geometry()
    }

    /// Record a member. The log line is durable before the tree changes;
    /// the name is validated before either file is touched.
    pub async fn insert(&mut self, name: &str, offset: u64, size: u64) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly {
                path: self.path.clone(),
            });
        }
        let geometry = self.tree.geometry();
        if name.len() > geometry.max_name_len {
            return Err(Error::NameTooLong {
                length: name.len(),
                limit: geometry.max_name_len,
            });
        }
        if name.contains('\n') {
            return Err(Error::InvalidName);
        }

        self.log
            .append(&MemberRecord::new(name, offset, size))
            .await?;
        self.log.sync().await?;
        self.tree.insert(name, offset, size).await
    }

    /// Find a member's payload location.
    pub async fn lookup(&mut self, name: &str) -> Result<IndexEntry, Error> {
        self.tree.lookup(name).await
    }

    /// Membership test; only a lookup miss maps to `false`.
    pub async fn exist(&mut self, name: &str) -> Result<bool, Error> {
        match self.tree.lookup(name).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// The most recently inserted member, straight from the tail log.
    pub async fn last(&mut self) -> Result<Option<MemberRecord>, Error> {
        self.log.last().await
    }

    /// Verify the tree invariants.
    pub async fn check(&mut self, deep: bool) -> Result<(), Error> {
        self.tree.check(deep).await
    }

    /// Rebuild both sidecars by scanning the archive sequentially.
    ///
    /// Writes land in `…pytree_` / `…pylst_` staging files that are
    /// renamed over the live pair only on success, so a crashed rebuild
    /// leaves the previous index untouched. Returns the member count.
    pub async fn rebuild_from_tar(tar_path: impl AsRef<Path>) -> Result<u64, Error> {
        let tar_path = tar_path.as_ref();
        let tree_staging = sidecar(tar_path, ".pytree_");
        let list_staging = sidecar(tar_path, ".pylst_");

        let geometry = Geometry::default();
        BlockTree::create(&tree_staging, geometry).await?;
        let mut tree =
            BlockTree::open(&tree_staging, Mode::ReadWrite, TreeOptions::default()).await?;
        let mut log = TailLog::create(&list_staging, geometry.max_rec_len).await?;

        let mut scanner = Scanner::new(tokio::fs::File::open(tar_path).await?);
        let mut count: u64 = 0;
        while let Some(member) = scanner.next_member().await? {
            tree.insert(&member.name, member.offset, member.size).await?;
            log.append(&member).await?;
            count += 1;
            if count % 10_000 == 0 {
                tree.flush().await?;
                tracing::debug!(count, tar = %tar_path.display(), "reindex in progress");
            }
        }
        log.sync().await?;
        tree.flush().await?;
        drop(log);
        drop(tree);

        tokio::fs::rename(&list_staging, sidecar(tar_path, LIST_SUFFIX)).await?;
        tokio::fs::rename(&tree_staging, sidecar(tar_path, TREE_SUFFIX)).await?;
        tracing::debug!(count, tar = %tar_path.display(), "index rebuilt");
        Ok(count)
    }
}
