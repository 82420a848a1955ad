// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content-addressed package pool.

The package pool holds every package file exactly once, keyed by the SHA-256 of
its content. Published repositories never reference pool files directly: storage
backends *link* pool files into published trees under human readable names.

Publishing only reads from the pool.
*/

use {
    crate::{
        error::{PublishError, Result},
        io::{digest_path, ChecksumType, ContentDigest, MultiContentDigest},
    },
    async_trait::async_trait,
    log::debug,
    std::path::{Path, PathBuf},
};

/// Describes a file in the package pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolEntry {
    /// The original filename of the package. e.g. `zstd_1.4.8+dfsg-2.1_amd64.deb`.
    ///
    /// This is the name the file is published under.
    pub filename: String,
    /// Path of the file relative to the pool root.
    pub pool_path: String,
    /// Size of the file in bytes.
    pub size: u64,
    /// Digests of the file content.
    pub digests: MultiContentDigest,
}

impl PoolEntry {
    /// The digest the pool is keyed by.
    pub fn checksum(&self) -> &ContentDigest {
        &self.digests.sha256
    }
}

/// Interface to a content-addressed store of package files.
#[async_trait]
pub trait PackagePool: Sync {
    /// Obtain the local filesystem path and size of the file having the given checksum.
    ///
    /// Fails with [PublishError::NotFound] if the checksum isn't known.
    async fn resolve(&self, checksum: &ContentDigest) -> Result<(PathBuf, u64)>;

    /// Whether the file at `path` has content matching `checksum`.
    async fn verify(&self, checksum: &ContentDigest, path: &Path) -> Result<bool>;

    /// Obtain the full [PoolEntry] for a checksum.
    async fn entry(&self, checksum: &ContentDigest) -> Result<PoolEntry>;
}

/// A [PackagePool] backed by a local directory.
///
/// Files are stored at `<aa>/<bb>/<sha256>_<filename>` where `aa` and `bb` are the
/// first two pairs of hex characters of the SHA-256 digest.
#[derive(Clone, Debug)]
pub struct FilesystemPackagePool {
    root_dir: PathBuf,
}

impl FilesystemPackagePool {
    /// Construct a new instance, bound to the root directory specified.
    ///
    /// The directory does not need to exist.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }

    /// The root directory of this pool.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Compute the pool relative path of a file.
    pub fn pool_path(checksum: &ContentDigest, filename: &str) -> String {
        let hex = checksum.digest_hex();

        format!("{}/{}/{}_{}", &hex[0..2], &hex[2..4], hex, filename)
    }

    fn sha256_hex(checksum: &ContentDigest) -> Result<String> {
        if checksum.checksum_type() != ChecksumType::Sha256 || checksum.digest_bytes().len() != 32
        {
            return Err(PublishError::NotFound(format!(
                "pool entries are keyed by SHA-256; got {}",
                checksum
            )));
        }

        Ok(checksum.digest_hex())
    }

    async fn find(&self, checksum: &ContentDigest) -> Result<(PathBuf, String)> {
        let hex = Self::sha256_hex(checksum)?;
        let dir = self.root_dir.join(&hex[0..2]).join(&hex[2..4]);
        let prefix = format!("{}_", hex);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PublishError::NotFound(format!("pool entry {}", checksum)));
            }
            Err(e) => return Err(PublishError::IoPath(format!("{}", dir.display()), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PublishError::IoPath(format!("{}", dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();

            if let Some(filename) = name.strip_prefix(&prefix) {
                return Ok((entry.path(), filename.to_string()));
            }
        }

        Err(PublishError::NotFound(format!("pool entry {}", checksum)))
    }

    /// Add a local file to the pool.
    ///
    /// `filename` overrides the name the file is published under. It defaults to the
    /// final component of `source`.
    ///
    /// Importing a file already in the pool is a no-op. Content is only ever held
    /// under one filename: importing known content under a different name fails
    /// with [PublishError::PoolFilename].
    pub async fn import(&self, source: &Path, filename: Option<&str>) -> Result<PoolEntry> {
        let filename = match filename {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .ok_or_else(|| {
                    PublishError::IoPath(
                        format!("{}", source.display()),
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
                    )
                })?,
        };

        if filename.contains('/') || filename.is_empty() {
            return Err(PublishError::InvalidPath(
                filename,
                "pool filenames cannot have directory components",
            ));
        }

        let (size, digests) = digest_path(source).await?;
        let pool_path = Self::pool_path(&digests.sha256, &filename);
        let dest_path = self.root_dir.join(&pool_path);

        match self.find(&digests.sha256).await {
            Ok((_, existing)) if existing != filename => {
                return Err(PublishError::PoolFilename {
                    checksum: digests.sha256.to_string(),
                    existing,
                    wanted: filename,
                });
            }
            Ok(_) | Err(PublishError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if tokio::fs::metadata(&dest_path).await.is_ok() {
            debug!("{} already in pool", pool_path);
        } else {
            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PublishError::IoPath(format!("{}", parent.display()), e))?;
            }

            // Dot names never match the `<sha256>_` prefix lookups scan for.
            let temp_path = dest_path.with_file_name(format!(
                ".import-{}-{}",
                std::process::id(),
                digests.sha256.digest_hex()
            ));
            tokio::fs::copy(source, &temp_path)
                .await
                .map_err(|e| PublishError::IoPath(format!("{}", temp_path.display()), e))?;
            if let Err(e) = tokio::fs::rename(&temp_path, &dest_path).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(PublishError::IoPath(format!("{}", dest_path.display()), e));
            }

            debug!("imported {} into pool as {}", source.display(), pool_path);
        }

        Ok(PoolEntry {
            filename,
            pool_path,
            size,
            digests,
        })
    }
}

#[async_trait]
impl PackagePool for FilesystemPackagePool {
    async fn resolve(&self, checksum: &ContentDigest) -> Result<(PathBuf, u64)> {
        let (path, _) = self.find(checksum).await?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PublishError::IoPath(format!("{}", path.display()), e))?;

        Ok((path, metadata.len()))
    }

    async fn verify(&self, checksum: &ContentDigest, path: &Path) -> Result<bool> {
        match digest_path(path).await {
            Ok((_, digests)) => Ok(digests.matches_digest(checksum)),
            Err(PublishError::IoPath(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn entry(&self, checksum: &ContentDigest) -> Result<PoolEntry> {
        let (path, filename) = self.find(checksum).await?;
        let (size, digests) = digest_path(&path).await?;

        if !digests.matches_digest(checksum) {
            return Err(PublishError::Conflict {
                path: format!("{}", path.display()),
                existing: digests.sha256.to_string(),
                wanted: checksum.to_string(),
            });
        }

        Ok(PoolEntry {
            pool_path: Self::pool_path(checksum, &filename),
            filename,
            size,
            digests,
        })
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::io::MultiDigester};

    #[tokio::test]
    async fn import_and_resolve() -> Result<()> {
        let td = tempfile::tempdir()?;
        let source = td.path().join("hello_1.0_amd64.deb");
        std::fs::write(&source, b"hello deb")?;

        let pool = FilesystemPackagePool::new(td.path().join("pool"));
        let entry = pool.import(&source, None).await?;

        let hex = entry.checksum().digest_hex();
        assert_eq!(entry.filename, "hello_1.0_amd64.deb");
        assert_eq!(
            entry.pool_path,
            format!("{}/{}/{}_hello_1.0_amd64.deb", &hex[0..2], &hex[2..4], hex)
        );
        assert_eq!(entry.size, 9);

        let (path, size) = pool.resolve(entry.checksum()).await?;
        assert_eq!(size, 9);
        assert_eq!(path, pool.root_dir().join(&entry.pool_path));
        assert!(pool.verify(entry.checksum(), &path).await?);
        assert!(!pool.verify(entry.checksum(), &source.with_extension("missing")).await?);

        assert_eq!(pool.entry(entry.checksum()).await?, entry);

        // Importing again is a no-op.
        assert_eq!(pool.import(&source, None).await?, entry);

        Ok(())
    }

    #[tokio::test]
    async fn content_keeps_one_filename() -> Result<()> {
        let td = tempfile::tempdir()?;
        let first = td.path().join("zzz_1_all.deb");
        let second = td.path().join("aaa_1_all.deb");
        std::fs::write(&first, b"same bytes")?;
        std::fs::write(&second, b"same bytes")?;

        let pool = FilesystemPackagePool::new(td.path().join("pool"));
        let entry = pool.import(&first, None).await?;

        assert!(matches!(
            pool.import(&second, None).await,
            Err(PublishError::PoolFilename { existing, wanted, .. })
                if existing == "zzz_1_all.deb" && wanted == "aaa_1_all.deb"
        ));
        assert!(matches!(
            pool.import(&first, Some("aaa_1_all.deb")).await,
            Err(PublishError::PoolFilename { .. })
        ));

        // The original name is still the one resolved.
        assert_eq!(pool.entry(entry.checksum()).await?.filename, "zzz_1_all.deb");
        assert_eq!(pool.import(&first, None).await?, entry);

        Ok(())
    }

    #[tokio::test]
    async fn leftover_import_temp_is_ignored() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pool = FilesystemPackagePool::new(td.path().join("pool"));

        let digests = MultiDigester::digest_data(b"interrupted");
        let hex = digests.sha256.digest_hex();
        let dir = pool.root_dir().join(&hex[0..2]).join(&hex[2..4]);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!(".import-1-{}", hex)), b"interr")?;

        assert!(matches!(
            pool.entry(&digests.sha256).await,
            Err(PublishError::NotFound(_))
        ));

        let source = td.path().join("partial_1_all.deb");
        std::fs::write(&source, b"interrupted")?;
        let entry = pool.import(&source, None).await?;
        assert_eq!(pool.entry(&digests.sha256).await?, entry);

        let names = std::fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<Vec<_>>>()?;
        assert!(names.contains(&format!("{}_partial_1_all.deb", hex)));

        Ok(())
    }

    #[tokio::test]
    async fn unknown_checksum() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pool = FilesystemPackagePool::new(td.path());

        let digests = MultiDigester::digest_data(b"missing");

        assert!(matches!(
            pool.resolve(&digests.sha256).await,
            Err(PublishError::NotFound(_))
        ));
        assert!(matches!(
            pool.entry(&digests.md5).await,
            Err(PublishError::NotFound(_))
        ));

        Ok(())
    }
}
