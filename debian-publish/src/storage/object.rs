// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Published storage on flat object stores.

Object stores only know keys. [ObjectPublishedStorage] emulates a directory tree
on top of an [ObjectClient] by treating `/` in keys as a separator: listing a
directory is a prefix listing, removing a directory removes every key below the
prefix and moving a file is a copy followed by a delete.

Transports only need to implement the handful of primitive operations in
[ObjectClient].
*/

use {
    crate::{
        error::{PublishError, Result},
        io::{MultiContentDigest, MultiDigester},
        path::PublishedPath,
        pool::{PackagePool, PoolEntry},
        publisher::PublishEvent,
        storage::{
            link_action, FailureCollector, LinkAction, LinkOutcome, LinkedFile, ObjectRecord,
            ProgressCallback, PublishedStorage, SwitchStrategy,
        },
    },
    async_trait::async_trait,
    bytes::Bytes,
    futures::StreamExt,
    log::{debug, warn},
    std::{collections::BTreeSet, path::Path},
};

/// Number of concurrent deletes issued by [PublishedStorage::remove_dirs()].
const REMOVE_CONCURRENCY: usize = 16;

/// Characters escaped when a key is placed in a URL path or header.
///
/// Separators stay literal.
#[cfg(any(feature = "s3", feature = "swift"))]
pub(crate) const KEY_ESCAPE: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A page of keys from an object listing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjectListPage {
    /// Keys in this page.
    pub keys: Vec<String>,
    /// Marker to pass to obtain the next page. [None] when the listing is complete.
    pub next_marker: Option<String>,
}

/// Primitive operations of an object store.
///
/// Keys are full keys within the bucket or container.
#[async_trait]
pub trait ObjectClient: Send + Sync + std::fmt::Display {
    /// Obtain the size and digest of an object, if it exists.
    ///
    /// The `path` of the returned record is the full key.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectRecord>>;

    /// Store an object, replacing any existing one.
    ///
    /// `digests` are the digests of `data`. Stores record the SHA-256 as object
    /// metadata.
    async fn put_object(&self, key: &str, data: Bytes, digests: &MultiContentDigest)
        -> Result<()>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, starting after `marker`.
    async fn list_objects(&self, prefix: &str, marker: Option<&str>) -> Result<ObjectListPage>;

    /// Server-side copy of an object, metadata included.
    async fn copy_object(&self, from: &str, to: &str) -> Result<()>;
}

/// States of a rename on a store without a native move.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RenameState {
    Copied,
    Verified,
    SourceDeleted,
}

impl RenameState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Copied => "copied",
            Self::Verified => "verified",
            Self::SourceDeleted => "source-deleted",
        }
    }
}

/// [PublishedStorage] over an [ObjectClient].
pub struct ObjectPublishedStorage<C> {
    client: C,
    prefix: PublishedPath,
}

impl<C: ObjectClient> ObjectPublishedStorage<C> {
    /// Construct a new instance storing everything below an optional key prefix.
    pub fn new(client: C, prefix: Option<&str>) -> Result<Self> {
        Ok(Self {
            client,
            prefix: PublishedPath::new(prefix.unwrap_or(""))?,
        })
    }

    /// The underlying transport.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The key prefix all paths are stored under.
    pub fn prefix(&self) -> &PublishedPath {
        &self.prefix
    }

    /// Compute the object key for a path.
    pub fn path_to_key(&self, path: &PublishedPath) -> String {
        self.prefix.join_path(path).as_str().to_string()
    }

    fn key_to_path(&self, key: &str) -> Option<PublishedPath> {
        PublishedPath::new(key)
            .ok()
            .and_then(|path| path.strip_prefix(&self.prefix))
            .filter(|path| !path.is_root())
    }

    async fn put_data(
        &self,
        path: &PublishedPath,
        source: &Path,
        digests: Option<&MultiContentDigest>,
    ) -> Result<()> {
        // The transports want the full body. Pool files and indices are small enough to
        // buffer.
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| PublishError::IoPath(format!("{}", source.display()), e))?;

        let computed;
        let digests = match digests {
            Some(digests) => digests,
            None => {
                computed = MultiDigester::digest_data(&data);
                &computed
            }
        };

        self.client
            .put_object(&self.path_to_key(path), Bytes::from(data), digests)
            .await
    }

    /// Whether a copied object matches its source.
    ///
    /// Digests are compared when both records carry the same kind. Otherwise only the
    /// sizes can be compared.
    fn copy_matches(source: &ObjectRecord, dest: &ObjectRecord) -> bool {
        if source.size != dest.size {
            return false;
        }

        match (&source.digest, &dest.digest) {
            (Some(a), Some(b)) if a.checksum_type() == b.checksum_type() => a == b,
            (a, b) => {
                warn!(
                    "no comparable digests for {} ({:?}) and {} ({:?}); only sizes compared",
                    source.path,
                    a.as_ref().map(|d| d.checksum_type()),
                    dest.path,
                    b.as_ref().map(|d| d.checksum_type()),
                );
                true
            }
        }
    }

    fn interrupted(old: &PublishedPath, new: &PublishedPath, state: RenameState) -> PublishError {
        PublishError::RenameInterrupted {
            from: old.to_string(),
            to: new.to_string(),
            state: state.as_str(),
        }
    }
}

impl<C: ObjectClient> std::fmt::Display for ObjectPublishedStorage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.client, self.prefix.as_str())
    }
}

#[async_trait]
impl<C: ObjectClient> PublishedStorage for ObjectPublishedStorage<C> {
    async fn mkdir(&self, _path: &PublishedPath) -> Result<()> {
        Ok(())
    }

    async fn put_file(&self, path: &PublishedPath, source: &Path) -> Result<()> {
        self.put_data(path, source, None).await
    }

    async fn remove(&self, path: &PublishedPath) -> Result<()> {
        self.client.delete_object(&self.path_to_key(path)).await
    }

    async fn remove_dirs(
        &self,
        path: &PublishedPath,
        progress_cb: &ProgressCallback,
    ) -> Result<()> {
        let paths = self.filelist(path).await?;
        let mut failures = FailureCollector::default();

        let mut fs = futures::stream::iter(paths.into_iter().map(|path| async move {
            let res = self.remove(&path).await;
            (path, res)
        }))
        .buffer_unordered(REMOVE_CONCURRENCY);

        while let Some((path, res)) = fs.next().await {
            if res.is_ok() {
                if let Some(cb) = progress_cb {
                    cb(PublishEvent::PathRemoved(path.to_string()));
                }
            }

            failures.record(&path, res);
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
        let path = published_directory.join(&entry.filename)?;
        let existing = self.stat(&path).await?;

        match link_action(&path, existing.as_ref(), entry, force)? {
            LinkAction::Keep => {
                debug!("{} already present in {}", path, self);
                Ok(LinkedFile {
                    path,
                    outcome: LinkOutcome::AlreadyPresent,
                })
            }
            LinkAction::Write(outcome) => {
                if outcome == LinkOutcome::Overwritten {
                    warn!("replacing {} in {} with different content", path, self);
                }

                let (source, _) = pool.resolve(entry.checksum()).await?;
                self.put_data(&path, &source, Some(&entry.digests)).await?;

                Ok(LinkedFile { path, outcome })
            }
        }
    }

    async fn filelist(&self, prefix: &PublishedPath) -> Result<Vec<PublishedPath>> {
        let mut list_prefix = self.path_to_key(prefix);
        let mut paths = BTreeSet::new();

        // A key equal to the prefix is a file at that path. The listing below only sees
        // keys under it.
        if !prefix.is_root() && self.client.head_object(&list_prefix).await?.is_some() {
            paths.insert(prefix.clone());
        }
        if !list_prefix.is_empty() {
            list_prefix.push('/');
        }

        let mut marker = None;

        loop {
            let page = self
                .client
                .list_objects(&list_prefix, marker.as_deref())
                .await?;

            for key in page.keys {
                match self.key_to_path(&key) {
                    Some(path) => {
                        paths.insert(path);
                    }
                    None => {
                        debug!("ignoring unaddressable key {} in {}", key, self);
                    }
                }
            }

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(paths.into_iter().collect())
    }

    async fn rename_file(&self, old: &PublishedPath, new: &PublishedPath) -> Result<()> {
        let source = self
            .stat(old)
            .await?
            .ok_or_else(|| PublishError::NotFound(format!("{} in {}", old, self)))?;

        let old_key = self.path_to_key(old);
        let new_key = self.path_to_key(new);

        if old_key == new_key {
            debug!("rename of {} onto itself is a no-op", old);
            return Ok(());
        }

        self.client.copy_object(&old_key, &new_key).await?;
        let mut state = RenameState::Copied;
        debug!("rename {} -> {}: {}", old, new, state.as_str());

        let dest = self
            .client
            .head_object(&new_key)
            .await
            .map_err(|e| {
                warn!("unable to stat {} after copy: {}", new, e);
                Self::interrupted(old, new, state)
            })?
            .ok_or_else(|| Self::interrupted(old, new, state))?;

        if !Self::copy_matches(&source, &dest) {
            warn!("copy of {} to {} does not match its source", old, new);
            return Err(Self::interrupted(old, new, state));
        }
        state = RenameState::Verified;
        debug!("rename {} -> {}: {}", old, new, state.as_str());

        self.client.delete_object(&old_key).await.map_err(|e| {
            warn!("unable to delete {} after copy: {}", old, e);
            Self::interrupted(old, new, state)
        })?;
        state = RenameState::SourceDeleted;
        debug!("rename {} -> {}: {}", old, new, state.as_str());

        Ok(())
    }

    async fn copy_file(&self, from: &PublishedPath, to: &PublishedPath) -> Result<()> {
        let from_key = self.path_to_key(from);
        let to_key = self.path_to_key(to);

        if from_key != to_key {
            self.client.copy_object(&from_key, &to_key).await?;
        }

        Ok(())
    }

    async fn stat(&self, path: &PublishedPath) -> Result<Option<ObjectRecord>> {
        Ok(self
            .client
            .head_object(&self.path_to_key(path))
            .await?
            .map(|record| ObjectRecord {
                path: path.clone(),
                ..record
            }))
    }

    fn switch_strategy(&self) -> SwitchStrategy {
        SwitchStrategy::PointerLast
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            pool::FilesystemPackagePool,
            storage::memory::{InMemoryObjectClient, ObjectOperation},
        },
    };

    fn storage(
        page_size: usize,
        prefix: Option<&str>,
    ) -> Result<ObjectPublishedStorage<InMemoryObjectClient>> {
        ObjectPublishedStorage::new(InMemoryObjectClient::with_page_size(page_size), prefix)
    }

    async fn write(
        storage: &ObjectPublishedStorage<InMemoryObjectClient>,
        dir: &Path,
        path: &str,
        data: &[u8],
    ) -> Result<PublishedPath> {
        let source = dir.join("source");
        std::fs::write(&source, data)?;
        let path = PublishedPath::new(path)?;
        storage.put_file(&path, &source).await?;

        Ok(path)
    }

    #[tokio::test]
    async fn keys_are_prefixed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(1000, Some("/debian/"))?;

        let path = write(&storage, td.path(), "dists/stable/Release", b"release").await?;

        assert_eq!(storage.path_to_key(&path), "debian/dists/stable/Release");
        assert_eq!(
            storage.client().keys(),
            vec!["debian/dists/stable/Release".to_string()]
        );
        assert_eq!(storage.filelist(&PublishedPath::root()).await?, vec![path.clone()]);
        assert_eq!(storage.to_string(), "memory:///debian");

        let record = storage.stat(&path).await?.unwrap();
        assert_eq!(record.path, path);
        assert_eq!(record.size, 7);

        storage.remove(&path).await?;
        storage.remove(&path).await?;
        assert!(storage.filelist(&PublishedPath::root()).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn filelist_paginates() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(2, None)?;

        let mut expected = vec![];
        for i in 0..7 {
            expected.push(write(&storage, td.path(), &format!("dists/x/f{}", i), b"x").await?);
        }
        write(&storage, td.path(), "dists/xy/other", b"x").await?;

        assert_eq!(storage.filelist(&PublishedPath::new("dists/x")?).await?, expected);
        assert_eq!(storage.filelist(&PublishedPath::root()).await?.len(), 8);
        assert!(storage.client().list_calls() > 4);

        Ok(())
    }

    #[tokio::test]
    async fn link_from_pool_conflicts() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pool = FilesystemPackagePool::new(td.path().join("pool"));
        let one = td.path().join("one");
        let two = td.path().join("two");
        std::fs::write(&one, b"one")?;
        std::fs::write(&two, b"two")?;
        let first = pool.import(&one, Some("p_1_all.deb")).await?;
        let second = pool.import(&two, Some("p_1_all.deb")).await?;

        let storage = storage(1000, Some("prefix"))?;
        let dir = PublishedPath::new("pool/main/p/p")?;

        let linked = storage.link_from_pool(&dir, &pool, &first, false).await?;
        assert_eq!(linked.outcome, LinkOutcome::Created);
        assert_eq!(storage.client().put_calls(), 1);

        let again = storage.link_from_pool(&dir, &pool, &first, false).await?;
        assert_eq!(again.outcome, LinkOutcome::AlreadyPresent);
        assert_eq!(storage.client().put_calls(), 1);

        let err = storage
            .link_from_pool(&dir, &pool, &second, false)
            .await
            .unwrap_err();
        match err {
            PublishError::Conflict {
                path,
                existing,
                wanted,
            } => {
                assert_eq!(path, "pool/main/p/p/p_1_all.deb");
                assert_eq!(existing, first.digests.md5.to_string());
                assert_eq!(wanted, second.digests.md5.to_string());
            }
            e => panic!("unexpected error {:?}", e),
        }
        assert_eq!(
            storage.client().object_data("prefix/pool/main/p/p/p_1_all.deb"),
            Some(Bytes::from_static(b"one"))
        );

        let forced = storage.link_from_pool(&dir, &pool, &second, true).await?;
        assert_eq!(forced.outcome, LinkOutcome::Overwritten);
        assert_eq!(
            storage.client().object_data("prefix/pool/main/p/p/p_1_all.deb"),
            Some(Bytes::from_static(b"two"))
        );

        Ok(())
    }

    #[tokio::test]
    async fn foreign_objects_without_digest_conflict() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pool = FilesystemPackagePool::new(td.path().join("pool"));
        let source = td.path().join("a.deb");
        std::fs::write(&source, b"content")?;
        let entry = pool.import(&source, None).await?;

        let storage = storage(1000, None)?;
        storage
            .client()
            .insert_foreign("pool/a.deb", Bytes::from_static(b"content"));

        assert!(storage
            .link_from_pool(&PublishedPath::new("pool")?, &pool, &entry, false)
            .await
            .unwrap_err()
            .is_conflict());

        Ok(())
    }

    #[tokio::test]
    async fn head_failures_are_fatal() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pool = FilesystemPackagePool::new(td.path().join("pool"));
        let source = td.path().join("a.deb");
        std::fs::write(&source, b"content")?;
        let entry = pool.import(&source, None).await?;

        let storage = storage(1000, None)?;
        storage.client().fail_on(ObjectOperation::Head, "pool/a.deb");

        assert!(matches!(
            storage
                .link_from_pool(&PublishedPath::new("pool")?, &pool, &entry, false)
                .await,
            Err(PublishError::Backend { .. })
        ));
        assert_eq!(storage.client().put_calls(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn remove_dirs_continues_past_failures() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(3, None)?;

        for name in ["a", "b", "c", "d", "e"] {
            write(&storage, td.path(), &format!("dists/old/{}", name), b"x").await?;
        }
        write(&storage, td.path(), "dists/keep", b"x").await?;
        storage
            .client()
            .fail_on(ObjectOperation::Delete, "dists/old/b");

        match storage
            .remove_dirs(&PublishedPath::new("dists/old")?, &None)
            .await
        {
            Err(PublishError::PartialFailure {
                attempted, failed, ..
            }) => {
                assert_eq!(attempted, 5);
                assert_eq!(failed, vec!["dists/old/b".to_string()]);
            }
            res => panic!("expected partial failure; got {:?}", res),
        }

        assert_eq!(
            storage.filelist(&PublishedPath::root()).await?,
            vec![
                PublishedPath::new("dists/keep")?,
                PublishedPath::new("dists/old/b")?
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn rename_copies_then_deletes() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(1000, None)?;

        let old = write(&storage, td.path(), "a/old", b"payload").await?;
        let new = PublishedPath::new("b/new")?;

        storage.rename_file(&old, &new).await?;
        assert_eq!(storage.filelist(&PublishedPath::root()).await?, vec![new.clone()]);
        assert_eq!(
            storage.client().object_data("b/new"),
            Some(Bytes::from_static(b"payload"))
        );

        assert!(matches!(
            storage.rename_file(&old, &new).await,
            Err(PublishError::NotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn rename_onto_itself_keeps_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(1000, Some("prefix"))?;

        let path = write(&storage, td.path(), "a/file", b"payload").await?;

        storage.rename_file(&path, &path).await?;
        assert_eq!(storage.client().keys(), vec!["prefix/a/file".to_string()]);
        assert_eq!(
            storage.client().object_data("prefix/a/file"),
            Some(Bytes::from_static(b"payload"))
        );

        storage.copy_file(&path, &path).await?;
        assert_eq!(storage.client().keys(), vec!["prefix/a/file".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn rename_without_comparable_digests() -> Result<()> {
        let storage = storage(1000, None)?;
        storage
            .client()
            .insert_foreign("a/old", Bytes::from_static(b"foreign"));

        let old = PublishedPath::new("a/old")?;
        let new = PublishedPath::new("a/new")?;
        storage.rename_file(&old, &new).await?;
        assert_eq!(storage.client().keys(), vec!["a/new".to_string()]);

        let digests = MultiDigester::digest_data(b"one");
        let record = |path: &str, size, digest| -> Result<ObjectRecord> {
            Ok(ObjectRecord {
                path: PublishedPath::new(path)?,
                size,
                digest,
            })
        };

        let source = record("a", 3, Some(digests.md5.clone()))?;
        assert!(ObjectPublishedStorage::<InMemoryObjectClient>::copy_matches(
            &source,
            &record("b", 3, Some(digests.sha256.clone()))?
        ));
        assert!(ObjectPublishedStorage::<InMemoryObjectClient>::copy_matches(
            &source,
            &record("b", 3, None)?
        ));
        assert!(!ObjectPublishedStorage::<InMemoryObjectClient>::copy_matches(
            &source,
            &record("b", 4, None)?
        ));
        assert!(!ObjectPublishedStorage::<InMemoryObjectClient>::copy_matches(
            &source,
            &record("b", 3, Some(MultiDigester::digest_data(b"two").md5))?
        ));

        Ok(())
    }

    #[tokio::test]
    async fn file_at_prefix_is_listed_and_removed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(1000, Some("repo"))?;

        let file = write(&storage, td.path(), "dists/stable/Release", b"release").await?;
        write(&storage, td.path(), "dists/stable/Release.gpg", b"sig").await?;

        assert_eq!(storage.filelist(&file).await?, vec![file.clone()]);

        storage.remove_dirs(&file, &None).await?;
        assert!(storage.stat(&file).await?.is_none());
        assert_eq!(
            storage.client().keys(),
            vec!["repo/dists/stable/Release.gpg".to_string()]
        );
        assert!(storage.filelist(&file).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn interrupted_rename_keeps_source() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = storage(1000, None)?;

        let old = write(&storage, td.path(), "a/old", b"payload").await?;
        let new = PublishedPath::new("b/new")?;
        storage.client().fail_on(ObjectOperation::Delete, "a/old");

        match storage.rename_file(&old, &new).await {
            Err(PublishError::RenameInterrupted { from, to, state }) => {
                assert_eq!(from, "a/old");
                assert_eq!(to, "b/new");
                assert_eq!(state, "verified");
            }
            res => panic!("expected interrupted rename; got {:?}", res),
        }

        // Both copies exist. Nothing is lost.
        assert_eq!(
            storage.filelist(&PublishedPath::root()).await?,
            vec![old.clone(), new.clone()]
        );

        // A failed copy leaves only the source.
        let storage = self::storage(1000, None)?;
        let old = write(&storage, td.path(), "a/old", b"payload").await?;
        storage.client().fail_on(ObjectOperation::Copy, "b/new");
        assert!(storage.rename_file(&old, &new).await.is_err());
        assert_eq!(storage.filelist(&PublishedPath::root()).await?, vec![old]);

        Ok(())
    }

    #[tokio::test]
    async fn no_link_switching() -> Result<()> {
        let storage = storage(1000, None)?;

        assert_eq!(storage.switch_strategy(), SwitchStrategy::PointerLast);
        assert!(matches!(
            storage
                .switch_link(&PublishedPath::new("a")?, &PublishedPath::new("b")?)
                .await,
            Err(PublishError::Unsupported(..))
        ));

        Ok(())
    }
}
