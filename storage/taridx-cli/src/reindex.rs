use std::path::{Path, PathBuf};

use taridx::IndexedTarFile;

use crate::error::Error;

/// Expand the given paths and glob patterns, then drain the resulting
/// queue with `jobs` concurrent workers. Individual failures are logged
/// and skipped; the queue keeps moving.
pub(crate) async fn reindex_tarfiles(jobs: usize, patterns: &[String]) -> Result<(), Error> {
    let mut archives: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let path = PathBuf::from(pattern);
        if path.is_file() {
            archives.push(path);
            continue;
        }
        for entry in glob::glob(pattern)? {
            match entry {
                Ok(path) => archives.push(path),
                Err(error) => tracing::warn!(%error, "skipping unreadable glob match"),
            }
        }
    }
    tracing::info!(count = archives.len(), "reindexing archives");

    let (sender, receiver) = async_channel::unbounded();
    for archive in archives {
        // unbounded channel with the sender still open: cannot fail
        let _ = sender.send(archive).await;
    }
    drop(sender);

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..jobs.max(1) {
        let receiver = receiver.clone();
        workers.spawn(async move {
            while let Ok(path) = receiver.recv().await {
                tracing::info!(tar = %path.display(), "processing");
                match reindex_one(&path).await {
                    Ok(count) => {
                        tracing::info!(tar = %path.display(), members = count, "reindexed")
                    }
                    Err(error) => {
                        tracing::error!(tar = %path.display(), %error, "failed to reindex")
                    }
                }
            }
        });
    }
    while let Some(joined) = workers.join_next().await {
        joined?;
    }

    tracing::info!("finished");
    Ok(())
}

async fn reindex_one(path: &Path) -> Result<u64, Error> {
    Ok(IndexedTarFile::reindex_path(path).await?)
}

/// Failures inside taridx are covered by the library's own tests; these
/// exercise the queueing and glob plumbing.
#[cfg(test)]
mod tests {
    use anyhow::Result;
    use taridx::{IndexedTarFile, Mode};
    use tempfile::tempdir;

    use crate::reindex::reindex_tarfiles;

    async fn build_archive(path: &std::path::Path, members: usize) -> Result<()> {
        let mut archive = IndexedTarFile::open(path, Mode::ReadWrite).await?;
        for i in 0..members {
            archive
                .write(&format!("obj-{i}"), format!("data {i}").as_bytes())
                .await?;
        }
        archive.close().await?;
        Ok(())
    }

    fn sidecar(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        std::path::PathBuf::from(name)
    }

    #[tokio::test]
    async fn rebuilds_deleted_sidecars() -> Result<()> {
        let dir = tempdir()?;
        let tar = dir.path().join("data.tar");
        build_archive(&tar, 10).await?;
        std::fs::remove_file(sidecar(&tar, ".pytree"))?;
        std::fs::remove_file(sidecar(&tar, ".pylst"))?;

        reindex_tarfiles(1, &[tar.display().to_string()]).await.unwrap();

        let mut archive = IndexedTarFile::open(&tar, Mode::Read).await?;
        for i in 0..10 {
            assert_eq!(archive.read(&format!("obj-{i}")).await?, format!("data {i}").as_bytes());
        }
        Ok(())
    }

    #[tokio::test]
    async fn expands_glob_patterns_across_workers() -> Result<()> {
        let dir = tempdir()?;
        for name in ["one.tar", "two.tar", "three.tar"] {
            let tar = dir.path().join(name);
            build_archive(&tar, 5).await?;
            std::fs::remove_file(sidecar(&tar, ".pytree"))?;
        }

        let pattern = dir.path().join("*.tar").display().to_string();
        reindex_tarfiles(3, &[pattern]).await.unwrap();

        for name in ["one.tar", "two.tar", "three.tar"] {
            let mut archive = IndexedTarFile::open(dir.path().join(name), Mode::Read).await?;
            assert!(archive.exist("obj-4").await?);
        }
        Ok(())
    }
}
