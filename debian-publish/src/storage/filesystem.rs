// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Published storage backed by a local filesystem. */

use {
    crate::{
        error::{PublishError, Result},
        io::digest_path,
        path::PublishedPath,
        pool::{PackagePool, PoolEntry},
        publisher::PublishEvent,
        storage::{
            link_action, FailureCollector, LinkAction, LinkMethod, LinkOutcome, LinkedFile,
            ObjectRecord, ProgressCallback, PublishedStorage, SwitchStrategy,
        },
    },
    async_trait::async_trait,
    log::{debug, warn},
    std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicU64, Ordering},
    },
};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn io_path_error(path: &Path, e: std::io::Error) -> PublishError {
    PublishError::IoPath(format!("{}", path.display()), e)
}

/// Obtain a unique sibling path for writing content before renaming it into place.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    path.with_file_name(format!(
        ".{}.tmp-{}-{}",
        name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Run `install` while the directory at `path` is moved to `aside`.
///
/// The directory is moved back to `path` if `install` fails.
#[cfg(unix)]
fn with_directory_aside(
    path: &Path,
    aside: &Path,
    install: impl FnOnce() -> Result<()>,
) -> Result<()> {
    std::fs::rename(path, aside).map_err(|e| io_path_error(path, e))?;

    if let Err(e) = install() {
        warn!(
            "restoring {} from {} after failure: {}",
            path.display(),
            aside.display(),
            e
        );
        if let Err(restore) = std::fs::rename(aside, path) {
            warn!("unable to restore {}: {}", path.display(), restore);
        }

        return Err(e);
    }

    Ok(())
}

/// A published repository tree on a local filesystem.
///
/// Directories are real and renames are atomic. Pool files are hard linked into
/// the tree when possible. Files are always replaced by renaming a fully written
/// temporary file over them, so content shared with the pool through a hard link
/// is never modified in place.
#[derive(Clone, Debug)]
pub struct FilesystemPublishedStorage {
    root_dir: PathBuf,
    link_method: LinkMethod,
}

impl FilesystemPublishedStorage {
    /// Construct a new instance, bound to the root directory specified.
    ///
    /// No validation of the passed path is performed. The directory does not need to exist.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
            link_method: LinkMethod::default(),
        }
    }

    /// Set how pool files are materialized.
    pub fn with_link_method(mut self, method: LinkMethod) -> Self {
        self.link_method = method;
        self
    }

    /// The root directory of the published tree.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn fs_path(&self, path: &PublishedPath) -> PathBuf {
        path.to_fs_path(&self.root_dir)
    }

    fn ensure_parent(dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_path_error(parent, e))?;
        }

        Ok(())
    }

    /// Materialize `source` at `dest`, replacing whatever is there.
    fn materialize(&self, source: &Path, dest: &Path) -> Result<()> {
        Self::ensure_parent(dest)?;

        let temp = temp_sibling(dest);

        let linked = match self.link_method {
            LinkMethod::Hardlink => match std::fs::hard_link(source, &temp) {
                Ok(()) => true,
                Err(e) => {
                    debug!(
                        "unable to hard link {} ({}); copying instead",
                        source.display(),
                        e
                    );
                    false
                }
            },
            LinkMethod::Copy => false,
        };

        if !linked {
            std::fs::copy(source, &temp).map_err(|e| io_path_error(&temp, e))?;
        }

        std::fs::rename(&temp, dest).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            io_path_error(dest, e)
        })
    }

    fn relative_path(&self, path: &Path) -> Result<PublishedPath> {
        let rel = path
            .strip_prefix(&self.root_dir)
            .map_err(|_| {
                PublishError::InvalidPath(
                    format!("{}", path.display()),
                    "path outside of storage root",
                )
            })?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        PublishedPath::new(rel)
    }
}

impl std::fmt::Display for FilesystemPublishedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filesystem:{}", self.root_dir.display())
    }
}

#[async_trait]
impl PublishedStorage for FilesystemPublishedStorage {
    async fn mkdir(&self, path: &PublishedPath) -> Result<()> {
        let dest = self.fs_path(path);

        std::fs::create_dir_all(&dest).map_err(|e| io_path_error(&dest, e))
    }

    async fn put_file(&self, path: &PublishedPath, source: &Path) -> Result<()> {
        let dest = self.fs_path(path);
        Self::ensure_parent(&dest)?;

        let temp = temp_sibling(&dest);
        tokio::fs::copy(source, &temp)
            .await
            .map_err(|e| io_path_error(source, e))?;

        if let Err(e) = tokio::fs::rename(&temp, &dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_path_error(&dest, e));
        }

        Ok(())
    }

    async fn remove(&self, path: &PublishedPath) -> Result<()> {
        let dest = self.fs_path(path);

        match tokio::fs::remove_file(&dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_path_error(&dest, e)),
        }
    }

    async fn remove_dirs(
        &self,
        path: &PublishedPath,
        progress_cb: &ProgressCallback,
    ) -> Result<()> {
        let dest = self.fs_path(path);

        let metadata = match std::fs::symlink_metadata(&dest) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_path_error(&dest, e)),
        };

        if !metadata.is_dir() {
            self.remove(path).await?;
            if let Some(cb) = progress_cb {
                cb(PublishEvent::PathRemoved(path.to_string()));
            }
            return Ok(());
        }

        let mut failures = FailureCollector::default();

        // Children are visited before their parents so directories are empty by the
        // time we get to them.
        for entry in walkdir::WalkDir::new(&dest)
            .follow_links(false)
            .contents_first(true)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let failed = e
                        .path()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| dest.clone());
                    failures.record(
                        &self.relative_path(&failed).unwrap_or_else(|_| path.clone()),
                        Err(PublishError::IoPath(
                            format!("{}", failed.display()),
                            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                        )),
                    );
                    continue;
                }
            };

            let rel = self.relative_path(entry.path())?;

            let res = if entry.file_type().is_dir() {
                std::fs::remove_dir(entry.path())
            } else {
                std::fs::remove_file(entry.path())
            }
            .map_err(|e| io_path_error(entry.path(), e));

            if res.is_ok() && !entry.file_type().is_dir() {
                if let Some(cb) = progress_cb {
                    cb(PublishEvent::PathRemoved(rel.to_string()));
                }
            }

            failures.record(&rel, res);
        }

        failures.finish()
    }

    async fn link_from_pool(
        &self,
        published_directory: &PublishedPath,
        pool: &dyn PackagePool,
        entry: &PoolEntry,
        force: bool,
    ) -> Result<LinkedFile> {
        let (source_path, _) = pool.resolve(entry.checksum()).await?;
        let path = published_directory.join(&entry.filename)?;

        let existing = self.stat(&path).await?;

        match link_action(&path, existing.as_ref(), entry, force)? {
            LinkAction::Keep => Ok(LinkedFile {
                path,
                outcome: LinkOutcome::AlreadyPresent,
            }),
            LinkAction::Write(outcome) => {
                if outcome == LinkOutcome::Overwritten {
                    warn!("replacing {} with different content", path);
                }

                self.materialize(&source_path, &self.fs_path(&path))?;

                Ok(LinkedFile { path, outcome })
            }
        }
    }

    async fn filelist(&self, prefix: &PublishedPath) -> Result<Vec<PublishedPath>> {
        let dest = self.fs_path(prefix);

        match std::fs::symlink_metadata(&dest) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_path_error(&dest, e)),
        }

        let mut paths = vec![];

        for entry in walkdir::WalkDir::new(&dest).follow_links(false) {
            let entry = entry.map_err(|e| {
                PublishError::IoPath(
                    format!("{}", dest.display()),
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;

            if !entry.file_type().is_dir() {
                paths.push(self.relative_path(entry.path())?);
            }
        }

        paths.sort();

        Ok(paths)
    }

    async fn rename_file(&self, old: &PublishedPath, new: &PublishedPath) -> Result<()> {
        let source = self.fs_path(old);
        let dest = self.fs_path(new);

        if old == new {
            return tokio::fs::metadata(&source)
                .await
                .map(|_| ())
                .map_err(|e| io_path_error(&source, e));
        }

        Self::ensure_parent(&dest)?;

        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| io_path_error(&source, e))
    }

    async fn copy_file(&self, from: &PublishedPath, to: &PublishedPath) -> Result<()> {
        if from == to {
            return Ok(());
        }

        self.put_file(to, &self.fs_path(from)).await
    }

    async fn stat(&self, path: &PublishedPath) -> Result<Option<ObjectRecord>> {
        let dest = self.fs_path(path);

        let metadata = match tokio::fs::metadata(&dest).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_path_error(&dest, e)),
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        let (size, digests) = digest_path(&dest).await?;

        Ok(Some(ObjectRecord {
            path: path.clone(),
            size,
            digest: Some(digests.sha256),
        }))
    }

    fn switch_strategy(&self) -> SwitchStrategy {
        SwitchStrategy::AtomicLink
    }

    #[cfg(unix)]
    async fn switch_link(
        &self,
        link: &PublishedPath,
        target: &PublishedPath,
    ) -> Result<Option<PublishedPath>> {
        let parent = link.parent().ok_or_else(|| {
            PublishError::InvalidPath(link.to_string(), "cannot replace the storage root")
        })?;
        let link_path = self.fs_path(link);

        // Relative link targets keep the tree relocatable.
        let link_target = match target.strip_prefix(&parent) {
            Some(rel) => PathBuf::from(rel.as_str()),
            None => self.fs_path(target),
        };

        let install = || -> Result<()> {
            Self::ensure_parent(&link_path)?;

            let temp = temp_sibling(&link_path);
            std::os::unix::fs::symlink(&link_target, &temp).map_err(|e| io_path_error(&temp, e))?;
            std::fs::rename(&temp, &link_path).map_err(|e| {
                let _ = std::fs::remove_file(&temp);
                io_path_error(&link_path, e)
            })
        };

        let previous = match std::fs::symlink_metadata(&link_path) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                let prev = std::fs::read_link(&link_path).map_err(|e| io_path_error(&link_path, e))?;
                install()?;

                if prev.is_absolute() {
                    Some(self.relative_path(&prev)?)
                } else {
                    Some(parent.join(prev.to_string_lossy())?)
                }
            }
            Ok(_) => {
                // A real directory from a publish predating link switching. It has to
                // be moved aside before the link can take its name, so readers briefly
                // see no tree at all. This migration happens once per distribution.
                let aside = parent.join(format!(
                    ".{}.previous-{}",
                    link.file_name().unwrap_or_default(),
                    std::process::id()
                ))?;
                warn!("moving directory {} aside to {}", link, aside);
                with_directory_aside(&link_path, &self.fs_path(&aside), install)?;

                Some(aside)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                install()?;
                None
            }
            Err(e) => return Err(io_path_error(&link_path, e)),
        };

        debug!("{} now points to {}", link, target);

        Ok(previous)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{io::ContentDigest, pool::FilesystemPackagePool},
    };

    async fn pool_with(
        dir: &Path,
        files: &[(&str, &[u8])],
    ) -> Result<(FilesystemPackagePool, Vec<PoolEntry>)> {
        let pool = FilesystemPackagePool::new(dir.join("pool"));
        let incoming = dir.join("incoming");
        std::fs::create_dir_all(&incoming)?;

        let mut entries = vec![];
        for (i, (name, data)) in files.iter().enumerate() {
            let source = incoming.join(format!("{}-{}", i, name));
            std::fs::write(&source, data)?;
            entries.push(pool.import(&source, Some(name)).await?);
        }

        Ok((pool, entries))
    }

    #[tokio::test]
    async fn put_list_remove_round_trip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemPublishedStorage::new(td.path().join("public"));

        let source = td.path().join("source");
        std::fs::write(&source, b"content")?;

        let path = PublishedPath::new("dists/stable/main/Files")?;
        storage.put_file(&path, &source).await?;

        assert_eq!(storage.filelist(&PublishedPath::root()).await?, vec![path.clone()]);
        assert_eq!(
            storage.filelist(&PublishedPath::new("dists/stable")?).await?,
            vec![path.clone()]
        );
        assert!(storage.filelist(&PublishedPath::new("pool")?).await?.is_empty());

        let record = storage.stat(&path).await?.expect("file should exist");
        assert_eq!(record.size, 7);

        storage.remove(&path).await?;
        // Idempotent.
        storage.remove(&path).await?;
        assert!(storage.filelist(&PublishedPath::root()).await?.is_empty());
        assert!(storage.stat(&path).await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn link_from_pool_dedup() -> Result<()> {
        let td = tempfile::tempdir()?;
        let (pool, entries) = pool_with(
            td.path(),
            &[("hello_1.0_all.deb", b"first"), ("hello_1.0_all.deb", b"second")],
        )
        .await?;
        let storage = FilesystemPublishedStorage::new(td.path().join("public"));
        let dir = PublishedPath::new("pool/main/h/hello")?;

        let linked = storage.link_from_pool(&dir, &pool, &entries[0], false).await?;
        assert_eq!(linked.outcome, LinkOutcome::Created);
        assert_eq!(linked.path.as_str(), "pool/main/h/hello/hello_1.0_all.deb");

        let again = storage.link_from_pool(&dir, &pool, &entries[0], false).await?;
        assert_eq!(again.outcome, LinkOutcome::AlreadyPresent);
        assert_eq!(again.path, linked.path);

        let err = storage
            .link_from_pool(&dir, &pool, &entries[1], false)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains(&entries[1].digests.sha256.digest_hex()));
        assert_eq!(
            std::fs::read(storage.fs_path(&linked.path))?,
            b"first".to_vec()
        );

        let forced = storage.link_from_pool(&dir, &pool, &entries[1], true).await?;
        assert_eq!(forced.outcome, LinkOutcome::Overwritten);
        assert_eq!(
            std::fs::read(storage.fs_path(&linked.path))?,
            b"second".to_vec()
        );

        // Overwriting a hard link must not modify the pool.
        let (first_pool_path, _) = pool.resolve(entries[0].checksum()).await?;
        assert_eq!(std::fs::read(first_pool_path)?, b"first".to_vec());

        Ok(())
    }

    #[tokio::test]
    async fn put_file_does_not_write_through_hard_links() -> Result<()> {
        let td = tempfile::tempdir()?;
        let (pool, entries) = pool_with(td.path(), &[("a.deb", b"pool content")]).await?;
        let storage = FilesystemPublishedStorage::new(td.path().join("public"));

        let linked = storage
            .link_from_pool(&PublishedPath::new("pool")?, &pool, &entries[0], false)
            .await?;

        let replacement = td.path().join("replacement");
        std::fs::write(&replacement, b"other")?;
        storage.put_file(&linked.path, &replacement).await?;

        let (pool_path, _) = pool.resolve(entries[0].checksum()).await?;
        assert_eq!(std::fs::read(pool_path)?, b"pool content".to_vec());

        Ok(())
    }

    #[tokio::test]
    async fn copy_link_method() -> Result<()> {
        let td = tempfile::tempdir()?;
        let (pool, entries) = pool_with(td.path(), &[("a.deb", b"data")]).await?;
        let storage = FilesystemPublishedStorage::new(td.path().join("public"))
            .with_link_method(LinkMethod::Copy);

        let linked = storage
            .link_from_pool(&PublishedPath::root(), &pool, &entries[0], false)
            .await?;
        assert_eq!(linked.path.as_str(), "a.deb");

        let record = storage.stat(&linked.path).await?.unwrap();
        assert_eq!(
            record.digest,
            Some(ContentDigest::Sha256(entries[0].digests.sha256.digest_bytes().to_vec()))
        );

        Ok(())
    }

    #[tokio::test]
    async fn remove_dirs_recursive() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemPublishedStorage::new(td.path().join("public"));
        let source = td.path().join("source");
        std::fs::write(&source, b"x")?;

        for path in ["dists/a/1", "dists/a/sub/2", "dists/b/3"] {
            storage.put_file(&PublishedPath::new(path)?, &source).await?;
        }

        let removed = std::sync::Arc::new(std::sync::Mutex::new(vec![]));
        let removed_cb = removed.clone();
        let cb: ProgressCallback = Some(Box::new(move |event| {
            if let PublishEvent::PathRemoved(path) = event {
                removed_cb.lock().unwrap().push(path);
            }
        }));

        storage
            .remove_dirs(&PublishedPath::new("dists/a")?, &cb)
            .await?;

        let mut removed = removed.lock().unwrap().clone();
        removed.sort();
        assert_eq!(removed, vec!["dists/a/1", "dists/a/sub/2"]);
        assert_eq!(
            storage.filelist(&PublishedPath::root()).await?,
            vec![PublishedPath::new("dists/b/3")?]
        );
        assert!(!storage.root_dir().join("dists/a").exists());

        // Missing directories are fine.
        storage
            .remove_dirs(&PublishedPath::new("dists/missing")?, &None)
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn file_at_prefix_is_listed_and_removed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemPublishedStorage::new(td.path().join("public"));
        let source = td.path().join("source");
        std::fs::write(&source, b"release")?;

        let file = PublishedPath::new("dists/stable/Release")?;
        let sibling = PublishedPath::new("dists/stable/Release.gpg")?;
        storage.put_file(&file, &source).await?;
        storage.put_file(&sibling, &source).await?;

        assert_eq!(storage.filelist(&file).await?, vec![file.clone()]);

        storage.remove_dirs(&file, &None).await?;
        assert!(storage.stat(&file).await?.is_none());
        assert_eq!(storage.filelist(&PublishedPath::root()).await?, vec![sibling]);

        Ok(())
    }

    #[tokio::test]
    async fn rename_is_a_move() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemPublishedStorage::new(td.path());
        let source = td.path().join("source");
        std::fs::write(&source, b"x")?;

        let old = PublishedPath::new("public/old")?;
        let new = PublishedPath::new("public/nested/new")?;
        storage.put_file(&old, &source).await?;
        storage.rename_file(&old, &new).await?;

        assert!(storage.stat(&old).await?.is_none());
        assert_eq!(storage.stat(&new).await?.unwrap().size, 1);

        storage.rename_file(&new, &new).await?;
        assert_eq!(std::fs::read(storage.fs_path(&new))?, b"x".to_vec());
        assert!(storage.rename_file(&old, &old).await.is_err());

        storage.copy_file(&new, &old).await?;
        assert_eq!(std::fs::read(storage.fs_path(&old))?, b"x".to_vec());
        assert_eq!(std::fs::read(storage.fs_path(&new))?, b"x".to_vec());

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn switch_link_swaps_generations() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemPublishedStorage::new(td.path());
        let source = td.path().join("source");

        let link = PublishedPath::new("dists/stable")?;
        let gen1 = PublishedPath::new("dists/.stable.1")?;
        let gen2 = PublishedPath::new("dists/.stable.2")?;

        std::fs::write(&source, b"one")?;
        storage.put_file(&gen1.join("Release")?, &source).await?;
        std::fs::write(&source, b"two")?;
        storage.put_file(&gen2.join("Release")?, &source).await?;

        assert_eq!(storage.switch_link(&link, &gen1).await?, None);
        assert_eq!(
            std::fs::read(td.path().join("dists/stable/Release"))?,
            b"one".to_vec()
        );

        assert_eq!(storage.switch_link(&link, &gen2).await?, Some(gen1.clone()));
        assert_eq!(
            std::fs::read(td.path().join("dists/stable/Release"))?,
            b"two".to_vec()
        );
        assert_eq!(
            std::fs::read_link(td.path().join("dists/stable"))?,
            PathBuf::from(".stable.2")
        );

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn switch_link_moves_real_directory_aside() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemPublishedStorage::new(td.path());
        let source = td.path().join("source");
        std::fs::write(&source, b"legacy")?;

        let link = PublishedPath::new("dists/stable")?;
        storage.put_file(&link.join("Release")?, &source).await?;
        std::fs::write(&source, b"new")?;
        let gen = PublishedPath::new("dists/.stable.1")?;
        storage.put_file(&gen.join("Release")?, &source).await?;

        let previous = storage
            .switch_link(&link, &gen)
            .await?
            .expect("previous directory should be reported");
        assert!(previous.as_str().starts_with("dists/.stable.previous-"));
        assert_eq!(
            std::fs::read(storage.fs_path(&previous.join("Release")?))?,
            b"legacy".to_vec()
        );
        assert_eq!(
            std::fs::read(td.path().join("dists/stable/Release"))?,
            b"new".to_vec()
        );

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failed_install_restores_directory() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = td.path().join("stable");
        let aside = td.path().join(".stable.previous-1");
        std::fs::create_dir(&dir)?;
        std::fs::write(dir.join("Release"), b"legacy")?;

        let res = with_directory_aside(&dir, &aside, || {
            assert!(!dir.exists());
            assert!(aside.join("Release").exists());

            Err(PublishError::Unsupported("test".into(), "symlinks"))
        });
        assert!(matches!(res, Err(PublishError::Unsupported(..))));

        assert_eq!(std::fs::read(dir.join("Release"))?, b"legacy".to_vec());
        assert!(!aside.exists());

        with_directory_aside(&dir, &aside, || Ok(()))?;
        assert!(!dir.exists());
        assert_eq!(std::fs::read(aside.join("Release"))?, b"legacy".to_vec());

        Ok(())
    }
}
