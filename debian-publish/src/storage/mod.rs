// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Published storage.

A published repository is a tree of files addressed by [PublishedPath]. The
[PublishedStorage] trait abstracts the medium holding that tree. Implementations
exist for a local filesystem ([filesystem::FilesystemPublishedStorage]) and for
flat object stores ([object::ObjectPublishedStorage] over an
[object::ObjectClient] transport such as S3 or Swift).

[PublishedStorageBackend] is the closed set of backends that can be selected from
a [StorageLocation] configuration.
*/

use {
    crate::{
        error::{PublishError, Result},
        io::ContentDigest,
        path::PublishedPath,
        pool::{PackagePool, PoolEntry},
        publisher::PublishEvent,
    },
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
    url::Url,
};

pub mod filesystem;
pub mod memory;
pub mod object;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(feature = "swift")]
pub mod swift;

/// Progress callback type accepted by long running storage operations.
pub type ProgressCallback = Option<Box<dyn Fn(PublishEvent) + Send + Sync>>;

/// What a storage backend knows about a stored file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectRecord {
    /// Path of the file relative to the storage root.
    pub path: PublishedPath,
    /// Size in bytes.
    pub size: u64,
    /// Content digest as reported or recorded by the store.
    ///
    /// [None] if the store has no usable digest for this object.
    pub digest: Option<ContentDigest>,
}

/// How a [PublishedStorage::link_from_pool()] call resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkOutcome {
    /// The destination was missing and has been written.
    Created,
    /// The destination already had the wanted content.
    AlreadyPresent,
    /// The destination had different content and was replaced.
    Overwritten,
}

/// The result of linking a pool file into published storage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkedFile {
    /// Path to reference from repository indices, relative to the storage root.
    pub path: PublishedPath,
    pub outcome: LinkOutcome,
}

/// How a backend makes a new tree visible.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SwitchStrategy {
    /// A directory link can be replaced atomically.
    ///
    /// New trees are built in an isolated directory and swapped in with
    /// [PublishedStorage::switch_link()].
    AtomicLink,
    /// No atomic multi-file switch exists.
    ///
    /// New trees are written in place and the files readers fetch first (the
    /// pointer files) are written last.
    PointerLast,
}

/// Storage for a published repository tree.
///
/// All paths are relative to the root (or key prefix) the instance is bound to.
#[async_trait]
pub trait PublishedStorage: Send + Sync + std::fmt::Display {
    /// Ensure a directory exists.
    ///
    /// A no-op on backends without a directory concept.
    async fn mkdir(&self, path: &PublishedPath) -> Result<()>;

    /// Copy a local file to `path`, replacing any existing content.
    async fn put_file(&self, path: &PublishedPath, source: &Path) -> Result<()>;

    /// Remove a single file.
    ///
    /// Removing a missing file is not an error.
    async fn remove(&self, path: &PublishedPath) -> Result<()>;

    /// Remove everything at or below `path`.
    ///
    /// Removal continues past individual failures. If anything failed,
    /// [PublishError::PartialFailure] is returned holding the first error.
    async fn remove_dirs(&self, path: &PublishedPath, progress_cb: &ProgressCallback)
        -> Result<()>;

    /// Place a file from the package pool at `published_directory/<entry.filename>`.
    ///
    /// An existing file with identical content is left alone. An existing file with
    /// different content is a [PublishError::Conflict] unless `force` is set, in which
    /// case it is replaced.
    async fn link_from_pool(
        &self,
        published_directory: &PublishedPath,
        pool: &dyn PackagePool,
        entry: &PoolEntry,
        force: bool,
    ) -> Result<LinkedFile>;

    /// List every file at or below `prefix`.
    ///
    /// Paths are relative to the storage root and sorted.
    async fn filelist(&self, prefix: &PublishedPath) -> Result<Vec<PublishedPath>>;

    /// Move a single file.
    ///
    /// The source is only removed once the destination is confirmed written. Renaming
    /// a file onto itself leaves it in place.
    async fn rename_file(&self, old: &PublishedPath, new: &PublishedPath) -> Result<()>;

    /// Copy a single file, replacing any file at `to`.
    ///
    /// Copying a file onto itself does nothing.
    async fn copy_file(&self, from: &PublishedPath, to: &PublishedPath) -> Result<()>;

    /// Probe a single path.
    async fn stat(&self, path: &PublishedPath) -> Result<Option<ObjectRecord>>;

    /// How this backend switches between published trees.
    fn switch_strategy(&self) -> SwitchStrategy;

    /// Atomically point the directory link `link` at `target`.
    ///
    /// Returns the previous link target, if `link` existed.
    async fn switch_link(
        &self,
        link: &PublishedPath,
        target: &PublishedPath,
    ) -> Result<Option<PublishedPath>> {
        let _ = (link, target);

        Err(PublishError::Unsupported(
            self.to_string(),
            "atomic link switching",
        ))
    }
}

/// What to do about an existing destination when linking from the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LinkAction {
    /// Leave the destination alone.
    Keep,
    /// Write the pool file to the destination.
    Write(LinkOutcome),
}

/// Decide how to link a pool entry given the probed destination state.
///
/// This is the content-addressing guard shared by every backend: one published
/// name maps to one content unless overwriting was explicitly requested.
pub(crate) fn link_action(
    path: &PublishedPath,
    existing: Option<&ObjectRecord>,
    entry: &PoolEntry,
    force: bool,
) -> Result<LinkAction> {
    let existing = match existing {
        None => return Ok(LinkAction::Write(LinkOutcome::Created)),
        Some(record) => record,
    };

    let matches = match &existing.digest {
        Some(digest) => existing.size == entry.size && entry.digests.matches_digest(digest),
        None => false,
    };

    if matches {
        Ok(LinkAction::Keep)
    } else if force {
        Ok(LinkAction::Write(LinkOutcome::Overwritten))
    } else {
        let wanted = match &existing.digest {
            Some(digest) => entry.digests.digest_from_checksum(digest.checksum_type()),
            None => entry.checksum(),
        };

        Err(PublishError::Conflict {
            path: path.to_string(),
            existing: existing
                .digest
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| format!("unknown digest ({} bytes)", existing.size)),
            wanted: wanted.to_string(),
        })
    }
}

/// Collects per-path failures of a bulk operation.
#[derive(Default)]
pub(crate) struct FailureCollector {
    attempted: usize,
    failed: Vec<String>,
    first: Option<PublishError>,
}

impl FailureCollector {
    pub fn record(&mut self, path: &PublishedPath, result: Result<()>) {
        self.attempted += 1;

        if let Err(e) = result {
            log::warn!("{}: {}", path, e);
            self.failed.push(path.to_string());
            if self.first.is_none() {
                self.first = Some(e);
            }
        }
    }

    pub fn finish(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(first) => Err(PublishError::PartialFailure {
                attempted: self.attempted,
                failed: self.failed,
                first: Box::new(first),
            }),
        }
    }
}

/// How the filesystem backend materializes pool files.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    /// Hard link pool files, copying when the pool is on another filesystem.
    #[default]
    Hardlink,
    /// Always copy pool files.
    Copy,
}

/// Configuration of a storage destination.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Filesystem {
        /// Root directory of the published tree.
        root: PathBuf,
        #[serde(default)]
        link_method: LinkMethod,
    },
    /// An S3 bucket.
    S3 {
        bucket: String,
        /// Key prefix within the bucket.
        #[serde(default)]
        prefix: Option<String>,
        /// AWS region name. Defaults to the region resolved by the AWS client.
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint URL for S3-compatible services.
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// An OpenStack Swift container.
    Swift {
        /// URL of the v1 authentication endpoint.
        auth_url: String,
        username: String,
        api_key: String,
        container: String,
        /// Object name prefix within the container.
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem { root, .. } => write!(f, "filesystem:{}", root.display()),
            Self::S3 { bucket, prefix, .. } => {
                write!(f, "s3://{}/{}", bucket, prefix.as_deref().unwrap_or(""))
            }
            Self::Swift {
                container, prefix, ..
            } => write!(
                f,
                "swift://{}/{}",
                container,
                prefix.as_deref().unwrap_or("")
            ),
        }
    }
}

impl StorageLocation {
    /// Resolve a location from a URL or filesystem path.
    ///
    /// Values without `://` are filesystem paths. Recognized URL schemes are `file`,
    /// `s3` (`s3://bucket/prefix`; `AWS_REGION` and `AWS_ENDPOINT_URL` are honored)
    /// and `swift` (`swift://container/prefix`; credentials come from the `ST_AUTH`,
    /// `ST_USER` and `ST_KEY` environment variables used by the Swift CLI).
    pub fn from_url(s: &str) -> Result<Self> {
        if !s.contains("://") {
            return Ok(Self::Filesystem {
                root: PathBuf::from(s),
                link_method: LinkMethod::default(),
            });
        }

        let url = Url::parse(s)?;
        let prefix = Some(url.path().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string());
        let host = || {
            url.host_str()
                .map(|h| h.to_string())
                .ok_or_else(|| PublishError::StorageLocation(s.to_string(), "missing host".into()))
        };

        match url.scheme() {
            "file" => Ok(Self::Filesystem {
                root: url.to_file_path().map_err(|_| {
                    PublishError::StorageLocation(s.to_string(), "not a local path".into())
                })?,
                link_method: LinkMethod::default(),
            }),
            "s3" => Ok(Self::S3 {
                bucket: host()?,
                prefix,
                region: std::env::var("AWS_REGION").ok(),
                endpoint: std::env::var("AWS_ENDPOINT_URL").ok(),
            }),
            "swift" => {
                let env = |key: &str| {
                    std::env::var(key).map_err(|_| {
                        PublishError::StorageLocation(
                            s.to_string(),
                            format!("environment variable {} not set", key),
                        )
                    })
                };

                Ok(Self::Swift {
                    auth_url: env("ST_AUTH")?,
                    username: env("ST_USER")?,
                    api_key: env("ST_KEY")?,
                    container: host()?,
                    prefix,
                })
            }
            scheme => Err(PublishError::StorageLocation(
                s.to_string(),
                format!("unsupported URL scheme {}", scheme),
            )),
        }
    }
}

/// The closed set of storage backends.
pub enum PublishedStorageBackend {
    Filesystem(filesystem::FilesystemPublishedStorage),
    #[cfg(feature = "s3")]
    S3(object::ObjectPublishedStorage<s3::S3Client>),
    #[cfg(feature = "swift")]
    Swift(object::ObjectPublishedStorage<swift::SwiftClient>),
}

impl PublishedStorageBackend {
    /// Construct the backend described by a [StorageLocation].
    pub fn from_location(location: &StorageLocation) -> Result<Self> {
        match location {
            StorageLocation::Filesystem { root, link_method } => Ok(Self::Filesystem(
                filesystem::FilesystemPublishedStorage::new(root).with_link_method(*link_method),
            )),
            #[cfg(feature = "s3")]
            StorageLocation::S3 {
                bucket,
                prefix,
                region,
                endpoint,
            } => Ok(Self::S3(object::ObjectPublishedStorage::new(
                s3::S3Client::new(bucket, region.as_deref(), endpoint.as_deref())?,
                prefix.as_deref(),
            )?)),
            #[cfg(feature = "swift")]
            StorageLocation::Swift {
                auth_url,
                username,
                api_key,
                container,
                prefix,
            } => Ok(Self::Swift(object::ObjectPublishedStorage::new(
                swift::SwiftClient::new(auth_url, username, api_key, container)?,
                prefix.as_deref(),
            )?)),
            #[allow(unreachable_patterns)]
            location => Err(PublishError::StorageLocation(
                location.to_string(),
                "support for this backend was not compiled in".into(),
            )),
        }
    }
}

macro_rules! dispatch {
    ($slf:expr, $storage:ident => $call:expr) => {
        match $slf {
            Self::Filesystem($storage) => $call,
            #[cfg(feature = "s3")]
            Self::S3($storage) => $call,
            #[cfg(feature = "swift")]
            Self::Swift($storage) => $call,
        }
    };
}

impl std::fmt::Display for PublishedStorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        dispatch!(self, s => std::fmt::Display::fmt(s, f))
    }
}

#[async_trait]
impl PublishedStorage for PublishedStorageBackend {
    async fn mkdir(&self, path: &PublishedPath) -> Result<()> {
        dispatch!(self, s => s.mkdir(path).await)
    }

    async fn put_file(&self, path: &PublishedPath, source: &Path) -> Result<()> {
        dispatch!(self, s => s.put_file(path, source).await)
    }

    async fn remove(&self, path: &PublishedPath) -> Result<()> {
        dispatch!(self, s => s.remove(path).await)
    }

    async fn remove_dirs(
        &self,
        path: &PublishedPath,
        progress_cb: &ProgressCallback,
    ) -> Result<()> {
        dispatch!(self, s => s.remove_dirs(path, progress_cb).await)
    }

    async fn link_from_pool(
        &self,
        published_directory: &PublishedPath,
        pool: &dyn PackagePool,
        entry: &PoolEntry,
        force: bool,
    ) -> Result<LinkedFile> {
        dispatch!(self, s => s.link_from_pool(published_directory, pool, entry, force).await)
    }

    async fn filelist(&self, prefix: &PublishedPath) -> Result<Vec<PublishedPath>> {
        dispatch!(self, s => s.filelist(prefix).await)
    }

    async fn rename_file(&self, old: &PublishedPath, new: &PublishedPath) -> Result<()> {
        dispatch!(self, s => s.rename_file(old, new).await)
    }

    async fn copy_file(&self, from: &PublishedPath, to: &PublishedPath) -> Result<()> {
        dispatch!(self, s => s.copy_file(from, to).await)
    }

    async fn stat(&self, path: &PublishedPath) -> Result<Option<ObjectRecord>> {
        dispatch!(self, s => s.stat(path).await)
    }

    fn switch_strategy(&self) -> SwitchStrategy {
        dispatch!(self, s => s.switch_strategy())
    }

    async fn switch_link(
        &self,
        link: &PublishedPath,
        target: &PublishedPath,
    ) -> Result<Option<PublishedPath>> {
        dispatch!(self, s => s.switch_link(link, target).await)
    }
}
