// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publish package sets to published storage.

A publish operation links a resolved set of pool files into a storage location,
writes index files describing them and then makes the new tree visible in one
step. Clients reading the repository see either the previous tree or the new
one.

How the new tree becomes visible depends on the backend's [SwitchStrategy]:

* [SwitchStrategy::AtomicLink] backends build indices in a fresh generation
  directory `dists/.<distribution>.<generation>` and then atomically repoint the
  `dists/<distribution>` link at it.
* [SwitchStrategy::PointerLast] backends stage changed indices in such a
  generation directory too, then copy them over the live files. The files
  clients fetch first ([IndexRole::Pointer]) are copied only after everything
  they reference. Live files are backed up before being replaced and restored
  if promotion fails.

Pool files are always written before any index file. Stale content of the
previous tree is removed only after the new tree is visible.

Index generation is delegated to a [MetadataGenerator].
*/

use {
    crate::{
        error::{PublishError, PublishFailure, Result},
        io::{ContentDigest, MultiContentDigest, MultiDigester},
        path::PublishedPath,
        pool::{PackagePool, PoolEntry},
        storage::{
            FailureCollector, LinkOutcome, LinkedFile, ProgressCallback, PublishedStorage,
            SwitchStrategy,
        },
    },
    futures::StreamExt,
    log::{debug, info, warn},
    std::{collections::BTreeSet, io::Write},
};

/// Timestamp format of generation directory names.
const GENERATION_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Whether `name` is a generation directory of `distribution`.
///
/// Generations are named `.<distribution>.<timestamp>`, optionally followed by
/// `-<attempt>`. Directories moved aside by a link switch are named
/// `.<distribution>.previous-<pid>`.
fn is_generation_name(name: &str, distribution: &str) -> bool {
    let rest = match name
        .strip_prefix('.')
        .and_then(|n| n.strip_prefix(distribution))
        .and_then(|n| n.strip_prefix('.'))
    {
        Some(rest) => rest,
        None => return false,
    };

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    if let Some(pid) = rest.strip_prefix("previous-") {
        return all_digits(pid);
    }

    let (stamp, attempt) = match rest.split_once('-') {
        Some((stamp, attempt)) => (stamp, Some(attempt)),
        None => (rest, None),
    };

    attempt.map(all_digits).unwrap_or(true)
        && chrono::NaiveDateTime::parse_from_str(stamp, GENERATION_STAMP_FORMAT).is_ok()
}

/// Stages of a publish operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishStage {
    /// Resolving pool entries and preparing the destination.
    Staging,
    /// Every package file has been linked into storage.
    Populated,
    /// Linked files were confirmed and index files written.
    Verified,
    /// The new tree is visible.
    Promoted,
    /// Removing the previous tree.
    Purging,
    /// Finished.
    Done,
    /// The operation failed. The previously published tree is unchanged.
    Failed,
}

impl std::fmt::Display for PublishStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Staging => "staging",
            Self::Populated => "populated",
            Self::Verified => "verified",
            Self::Promoted => "promoted",
            Self::Purging => "purging",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// Represents a publishing event.
pub enum PublishEvent {
    /// A publish stage was entered.
    StageEntered(PublishStage),

    /// Number of pool entries resolved for publishing.
    ResolvedPoolEntries(usize),

    /// A pool file was linked at the given path.
    PoolFileLinked(String, LinkOutcome),

    /// An index file with the given path and size was written.
    IndexFileWritten(String, u64),

    /// An index file already had the wanted content.
    IndexFileCurrent(String),

    /// A link was pointed at a new target.
    LinkSwitched(String, String),

    /// A path was removed.
    PathRemoved(String),
}

impl std::fmt::Display for PublishEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageEntered(stage) => write!(f, "entering stage {}", stage),
            Self::ResolvedPoolEntries(count) => {
                write!(f, "resolved {} pool entries", count)
            }
            Self::PoolFileLinked(path, outcome) => match outcome {
                LinkOutcome::Created => write!(f, "linked {}", path),
                LinkOutcome::AlreadyPresent => write!(f, "pool path {} is present", path),
                LinkOutcome::Overwritten => write!(f, "replaced {}", path),
            },
            Self::IndexFileWritten(path, size) => {
                write!(f, "wrote {} bytes to {}", size, path)
            }
            Self::IndexFileCurrent(path) => write!(f, "index file {} is current", path),
            Self::LinkSwitched(link, target) => write!(f, "{} now points to {}", link, target),
            Self::PathRemoved(path) => write!(f, "removed {}", path),
        }
    }
}

/// Describes the layout of the `pool` part of a published tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PoolLayout {
    /// Directories are `pool/<component>/<name_prefix>/<source>/`.
    ///
    /// This is the layout as used by the Debian distribution. For source packages
    /// beginning with `lib`, the name prefix is `lib` plus the next character. For
    /// everything else it is the first character. e.g. `libzstd` in `main` maps
    /// to `pool/main/libz/libzstd/` and `python3.9` maps to `pool/main/p/python3.9/`.
    #[default]
    ComponentThenNamePrefix,
}

impl PoolLayout {
    /// Compute the directory holding files of a source package.
    pub fn directory(&self, component: &str, source: &str) -> Result<PublishedPath> {
        match self {
            Self::ComponentThenNamePrefix => {
                let name_len = if source.starts_with("lib") && source.len() > 3 {
                    4
                } else {
                    1
                };
                let name_prefix = source.chars().take(name_len).collect::<String>();

                if component.contains('/') || source.contains('/') || name_prefix.is_empty() {
                    return Err(PublishError::InvalidPath(
                        format!("{}/{}", component, source),
                        "component and source must be single non-empty path segments",
                    ));
                }

                PublishedPath::new(format!(
                    "pool/{}/{}/{}",
                    component, name_prefix, source
                ))
            }
        }
    }
}

/// A package file to publish.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishedPackage {
    /// Repository component the package belongs to. e.g. `main`.
    pub component: String,
    /// Name of the source package. Determines the pool directory.
    pub source: String,
    /// SHA-256 of the file in the package pool.
    pub checksum: ContentDigest,
}

/// What an index file is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexRole {
    /// A file referenced from a pointer file.
    Index,
    /// A file clients fetch first, which references index files.
    ///
    /// Written after every index file.
    Pointer,
}

/// An index file produced by a [MetadataGenerator].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedIndex {
    /// Path relative to the distribution directory.
    pub path: PublishedPath,
    /// File content.
    pub data: Vec<u8>,
    pub role: IndexRole,
}

/// A published package file, as seen by a [MetadataGenerator].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeFile {
    pub component: String,
    /// Path relative to the publish prefix. This is the path clients fetch.
    pub path: PublishedPath,
    pub size: u64,
    pub digests: MultiContentDigest,
}

/// Describes the package content of a tree being published.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeDescriptor {
    pub distribution: String,
    pub components: BTreeSet<String>,
    /// Published files, sorted by path.
    pub files: Vec<TreeFile>,
}

/// Produces index files for a tree.
pub trait MetadataGenerator: Send + Sync {
    /// Generate index files for a tree.
    ///
    /// Output must only depend on the input for republishing to be a no-op.
    fn generate(&self, tree: &TreeDescriptor) -> Result<Vec<GeneratedIndex>>;
}

/// A simple [MetadataGenerator] listing published files.
///
/// Writes a `<component>/Files` index per component, holding a
/// `<sha256> <size> <path>` line per file, and a `Manifest` pointer listing the
/// digests of each index.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestGenerator;

impl MetadataGenerator for ManifestGenerator {
    fn generate(&self, tree: &TreeDescriptor) -> Result<Vec<GeneratedIndex>> {
        let mut indices = vec![];

        for component in &tree.components {
            let mut data = String::new();
            for file in tree.files.iter().filter(|f| &f.component == component) {
                data.push_str(&format!(
                    "{} {} {}\n",
                    file.digests.sha256.digest_hex(),
                    file.size,
                    file.path
                ));
            }

            indices.push(GeneratedIndex {
                path: PublishedPath::new(component)?.join("Files")?,
                data: data.into_bytes(),
                role: IndexRole::Index,
            });
        }

        let mut manifest = format!(
            "Distribution: {}\nComponents: {}\nSHA256:\n",
            tree.distribution,
            tree.components
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        for index in &indices {
            manifest.push_str(&format!(
                " {} {} {}\n",
                MultiDigester::digest_data(&index.data).sha256.digest_hex(),
                index.data.len(),
                index.path
            ));
        }

        indices.push(GeneratedIndex {
            path: PublishedPath::new("Manifest")?,
            data: manifest.into_bytes(),
            role: IndexRole::Pointer,
        });

        Ok(indices)
    }
}

/// What happens to the previous tree once a new one is visible.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Retention {
    /// Remove files of the previous tree no longer referenced.
    #[default]
    RemoveStale,
    /// Leave the previous tree in storage.
    KeepStale,
}

/// Describes a completed publish operation.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Path of the distribution directory clients use.
    pub distribution_path: PublishedPath,
    /// The generation directory now backing the distribution, if the backend uses them.
    pub generation: Option<PublishedPath>,
    /// Every linked package file, sorted by path.
    pub linked: Vec<LinkedFile>,
    /// Index files written.
    pub indices_written: Vec<PublishedPath>,
    /// Index files left alone because they already had the wanted content.
    pub indices_unchanged: Vec<PublishedPath>,
    /// Paths of the previous tree that were removed.
    pub removed: Vec<PublishedPath>,
    /// Paths of the previous tree left in place due to [Retention::KeepStale].
    pub retained: Vec<PublishedPath>,
    /// Failures removing the previous tree. These never undo the publish.
    pub purge_failures: Vec<(String, PublishError)>,
}

impl PublishReport {
    /// Number of linked files having the given outcome.
    pub fn count(&self, outcome: LinkOutcome) -> usize {
        self.linked.iter().filter(|l| l.outcome == outcome).count()
    }
}

fn emit(progress_cb: &ProgressCallback, event: PublishEvent) {
    if let Some(cb) = progress_cb {
        cb(event);
    }
}

/// Publishes package sets to [PublishedStorage].
///
/// Operations against the same storage location and prefix must not run
/// concurrently.
pub struct Publisher<'a> {
    pool: &'a dyn PackagePool,
    generator: &'a dyn MetadataGenerator,
    pool_layout: PoolLayout,
    max_parallel_io: usize,
    retention: Retention,
    force_overwrite: bool,
}

impl<'a> Publisher<'a> {
    /// Create a new instance reading from a package pool.
    pub fn new(pool: &'a dyn PackagePool, generator: &'a dyn MetadataGenerator) -> Self {
        Self {
            pool,
            generator,
            pool_layout: PoolLayout::default(),
            max_parallel_io: 8,
            retention: Retention::default(),
            force_overwrite: false,
        }
    }

    /// Set the layout of pool directories.
    pub fn set_pool_layout(&mut self, layout: PoolLayout) {
        self.pool_layout = layout;
    }

    /// Set the maximum number of concurrent storage operations.
    pub fn set_max_parallel_io(&mut self, value: usize) {
        self.max_parallel_io = value.max(1);
    }

    /// Set what happens to the previous tree.
    pub fn set_retention(&mut self, retention: Retention) {
        self.retention = retention;
    }

    /// Set whether published files with different content are replaced.
    ///
    /// When not set, a published file having different content than the pool file
    /// with the same name fails the publish.
    pub fn set_force_overwrite(&mut self, value: bool) {
        self.force_overwrite = value;
    }

    fn distribution_path(prefix: &PublishedPath, distribution: &str) -> Result<PublishedPath> {
        if distribution.is_empty() || distribution.contains('/') || distribution.starts_with('.')
        {
            return Err(PublishError::InvalidPath(
                distribution.to_string(),
                "distribution names must be a single path segment not starting with '.'",
            ));
        }

        prefix.join("dists")?.join(distribution)
    }

    /// Compute where a package is published below `prefix`.
    pub fn package_path(
        &self,
        prefix: &PublishedPath,
        package: &PublishedPackage,
        entry: &PoolEntry,
    ) -> Result<PublishedPath> {
        prefix
            .join_path(&self.pool_layout.directory(&package.component, &package.source)?)
            .join(&entry.filename)
    }

    /// Compute the published paths of a set of packages.
    ///
    /// The result is suitable for [Self::cleanup_pool()].
    pub async fn referenced_paths(
        &self,
        prefix: &PublishedPath,
        packages: &[PublishedPackage],
    ) -> Result<BTreeSet<PublishedPath>> {
        let mut paths = BTreeSet::new();

        for package in packages {
            let entry = self.pool.entry(&package.checksum).await?;
            paths.insert(self.package_path(prefix, package, &entry)?);
        }

        Ok(paths)
    }

    /// Pick a generation directory that isn't in use.
    async fn generation_dir(
        &self,
        storage: &impl PublishedStorage,
        prefix: &PublishedPath,
        distribution: &str,
    ) -> Result<PublishedPath> {
        let dists = prefix.join("dists")?;
        let stamp = chrono::Utc::now().format(GENERATION_STAMP_FORMAT).to_string();

        let mut candidate = dists.join(format!(".{}.{}", distribution, stamp))?;
        let mut attempt = 1;

        while !storage.filelist(&candidate).await?.is_empty() {
            candidate = dists.join(format!(".{}.{}-{}", distribution, stamp, attempt))?;
            attempt += 1;
        }

        Ok(candidate)
    }

    /// Write an index file into the staging directory.
    ///
    /// With `skip_unchanged`, nothing is written when the file at `live` already has
    /// the wanted content and [None] is returned.
    async fn stage_index(
        &self,
        storage: &impl PublishedStorage,
        staging: &PublishedPath,
        live: &PublishedPath,
        index: &GeneratedIndex,
        skip_unchanged: bool,
        progress_cb: &ProgressCallback,
    ) -> Result<Option<PublishedPath>> {
        if index.path.is_root() {
            return Err(PublishError::InvalidPath(
                index.path.to_string(),
                "index files need a file name",
            ));
        }

        if skip_unchanged {
            let path = live.join_path(&index.path);

            if let Some(record) = storage.stat(&path).await? {
                let digests = MultiDigester::digest_data(&index.data);

                if record.size == index.data.len() as u64
                    && record
                        .digest
                        .map(|d| digests.matches_digest(&d))
                        .unwrap_or(false)
                {
                    debug!("{} is current", path);
                    emit(progress_cb, PublishEvent::IndexFileCurrent(path.to_string()));
                    return Ok(None);
                }
            }
        }

        let path = staging.join_path(&index.path);

        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(&index.data)?;
        temp.flush()?;

        storage.put_file(&path, temp.path()).await?;
        emit(
            progress_cb,
            PublishEvent::IndexFileWritten(path.to_string(), index.data.len() as u64),
        );

        Ok(Some(path))
    }

    /// Copy staged index files over their live counterparts, in order.
    ///
    /// Live files about to be replaced are first copied below the staging directory.
    /// If promotion fails, every replaced file is restored from that copy (or removed
    /// if it did not exist) before the failures are returned, along with whether
    /// every restore succeeded.
    async fn promote(
        &self,
        storage: &impl PublishedStorage,
        live: &PublishedPath,
        staging: &PublishedPath,
        staged: &[(&GeneratedIndex, PublishedPath)],
    ) -> std::result::Result<(), (Vec<(String, PublishError)>, bool)> {
        let backup_dir = staging
            .join(".previous")
            .map_err(|e| (vec![(staging.to_string(), e)], true))?;

        let mut targets = vec![];

        for (index, _) in staged {
            let target = live.join_path(&index.path);

            let backup = match storage.stat(&target).await {
                Ok(Some(_)) => {
                    let backup = backup_dir.join_path(&index.path);
                    storage
                        .copy_file(&target, &backup)
                        .await
                        .map_err(|e| (vec![(target.to_string(), e)], true))?;
                    Some(backup)
                }
                Ok(None) => None,
                Err(e) => return Err((vec![(target.to_string(), e)], true)),
            };

            targets.push((target, backup));
        }

        for (i, (_, staged_path)) in staged.iter().enumerate() {
            let target = &targets[i].0;

            if let Err(e) = storage.copy_file(staged_path, target).await {
                warn!("unable to promote {} to {}: {}", staged_path, target, e);
                let mut failures = vec![(target.to_string(), e)];
                let mut restored = true;

                // A failed copy leaves its own target untouched.
                for (target, backup) in targets[..i].iter().rev() {
                    let res = match backup {
                        Some(backup) => storage.copy_file(backup, target).await,
                        None => storage.remove(target).await,
                    };

                    if let Err(e) = res {
                        warn!("unable to restore {}: {}", target, e);
                        failures.push((target.to_string(), e));
                        restored = false;
                    }
                }

                return Err((failures, restored));
            }

            debug!("promoted {} to {}", staged_path, target);
        }

        Ok(())
    }

    fn enter(&self, stage: PublishStage, destination: &str, progress_cb: &ProgressCallback) {
        info!("publish to {}: {}", destination, stage);
        emit(progress_cb, PublishEvent::StageEntered(stage));
    }

    /// Abandon a publish, discarding any staging directory.
    async fn fail(
        &self,
        storage: &impl PublishedStorage,
        staging: Option<&PublishedPath>,
        destination: String,
        stage: PublishStage,
        failures: Vec<(String, PublishError)>,
        progress_cb: &ProgressCallback,
    ) -> PublishError {
        self.enter(PublishStage::Failed, &destination, progress_cb);

        if let Some(staging) = staging {
            if let Err(e) = storage.remove_dirs(staging, &None).await {
                warn!("unable to remove staging directory {}: {}", staging, e);
            }
        }

        warn!(
            "publish to {} failed during {}; linked pool files are left in place",
            destination, stage
        );

        PublishError::Publish(Box::new(PublishFailure {
            destination,
            stage,
            failures,
        }))
    }

    /// Publish a set of packages as `distribution` below `prefix`.
    ///
    /// Package files are linked to `<prefix>/pool/...` per the [PoolLayout]. Index
    /// files from the [MetadataGenerator] are written below
    /// `<prefix>/dists/<distribution>`.
    ///
    /// On error, the previously published tree is unchanged. Package files already
    /// linked into the pool area are left in place.
    pub async fn publish(
        &self,
        storage: &impl PublishedStorage,
        prefix: &PublishedPath,
        distribution: &str,
        packages: &[PublishedPackage],
        progress_cb: &ProgressCallback,
    ) -> Result<PublishReport> {
        let live = Self::distribution_path(prefix, distribution)?;
        let destination = format!("{} {}", storage, live);
        let strategy = storage.switch_strategy();

        let mut report = PublishReport {
            distribution_path: live.clone(),
            ..Default::default()
        };

        // Staging.
        self.enter(PublishStage::Staging, &destination, progress_cb);

        let mut entries = vec![];
        let mut failures = vec![];

        for package in packages {
            match self.pool.entry(&package.checksum).await {
                Ok(entry) => entries.push((package, entry)),
                Err(e) => failures.push((package.checksum.to_string(), e)),
            }
        }

        if !failures.is_empty() {
            return Err(self
                .fail(
                    storage,
                    None,
                    destination,
                    PublishStage::Staging,
                    failures,
                    progress_cb,
                )
                .await);
        }

        emit(progress_cb, PublishEvent::ResolvedPoolEntries(entries.len()));

        let staging = self.generation_dir(storage, prefix, distribution).await?;
        let previous_files = match strategy {
            SwitchStrategy::AtomicLink => vec![],
            SwitchStrategy::PointerLast => storage.filelist(&live).await?,
        };
        debug!("staging indices for {} in {}", destination, staging);

        // Populated.
        let mut fs = futures::stream::iter(entries.iter().map(|(package, entry)| async move {
            let res: Result<LinkedFile> = async {
                let dir = prefix.join_path(
                    &self
                        .pool_layout
                        .directory(&package.component, &package.source)?,
                );
                storage.mkdir(&dir).await?;

                storage
                    .link_from_pool(&dir, self.pool, entry, self.force_overwrite)
                    .await
            }
            .await;

            (*package, entry, res)
        }))
        .buffer_unordered(self.max_parallel_io);

        let mut linked = vec![];

        while let Some((package, entry, res)) = fs.next().await {
            match res {
                Ok(file) => {
                    debug!("{}: {:?}", file.path, file.outcome);
                    emit(
                        progress_cb,
                        PublishEvent::PoolFileLinked(file.path.to_string(), file.outcome),
                    );
                    linked.push((package, entry, file));
                }
                Err(e) => {
                    let path = self
                        .package_path(prefix, package, entry)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|_| entry.filename.clone());
                    failures.push((path, e));
                }
            }
        }
        drop(fs);

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.0.cmp(&b.0));

            return Err(self
                .fail(
                    storage,
                    Some(&staging),
                    destination,
                    PublishStage::Populated,
                    failures,
                    progress_cb,
                )
                .await);
        }

        linked.sort_by(|a, b| a.2.path.cmp(&b.2.path));
        self.enter(PublishStage::Populated, &destination, progress_cb);

        // Verified. Confirm every linked file before any index references it.
        let mut fs = futures::stream::iter(linked.iter().map(|(_, entry, file)| async move {
            let res = match storage.stat(&file.path).await {
                Ok(Some(record))
                    if record.size == entry.size
                        && record
                            .digest
                            .as_ref()
                            .map(|d| entry.digests.matches_digest(d))
                            .unwrap_or(true) =>
                {
                    Ok(())
                }
                Ok(Some(record)) => Err(PublishError::Conflict {
                    path: file.path.to_string(),
                    existing: record
                        .digest
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| format!("{} bytes", record.size)),
                    wanted: entry.checksum().to_string(),
                }),
                Ok(None) => Err(PublishError::NotFound(format!(
                    "{} after it was written",
                    file.path
                ))),
                Err(e) => Err(e),
            };

            (file.path.to_string(), res)
        }))
        .buffer_unordered(self.max_parallel_io);

        while let Some((path, res)) = fs.next().await {
            if let Err(e) = res {
                failures.push((path, e));
            }
        }
        drop(fs);

        if !failures.is_empty() {
            return Err(self
                .fail(
                    storage,
                    Some(&staging),
                    destination,
                    PublishStage::Verified,
                    failures,
                    progress_cb,
                )
                .await);
        }

        let tree = TreeDescriptor {
            distribution: distribution.to_string(),
            components: packages.iter().map(|p| p.component.clone()).collect(),
            files: linked
                .iter()
                .map(|(package, entry, file)| TreeFile {
                    component: package.component.clone(),
                    path: file.path.strip_prefix(prefix).unwrap_or_else(|| file.path.clone()),
                    size: entry.size,
                    digests: entry.digests.clone(),
                })
                .collect(),
        };

        let indices = match self.generator.generate(&tree) {
            Ok(indices) => indices,
            Err(e) => {
                return Err(self
                    .fail(
                        storage,
                        Some(&staging),
                        destination,
                        PublishStage::Verified,
                        vec![(live.to_string(), e)],
                        progress_cb,
                    )
                    .await);
            }
        };

        // Verified. Every index is staged before anything clients see changes.
        let skip_unchanged = strategy == SwitchStrategy::PointerLast;
        let new_paths = indices
            .iter()
            .map(|index| live.join_path(&index.path))
            .collect::<BTreeSet<_>>();

        let (index_files, pointer_files): (Vec<_>, Vec<_>) =
            indices.iter().partition(|i| i.role == IndexRole::Index);

        let (staging_dir, live_dir) = (&staging, &live);
        let mut fs = futures::stream::iter(index_files.into_iter().map(|index| async move {
            let res = self
                .stage_index(storage, staging_dir, live_dir, index, skip_unchanged, progress_cb)
                .await;
            (index, res)
        }))
        .buffer_unordered(self.max_parallel_io);

        let mut staged = vec![];

        while let Some((index, res)) = fs.next().await {
            match res {
                Ok(Some(path)) => staged.push((index, path)),
                Ok(None) => report.indices_unchanged.push(live.join_path(&index.path)),
                Err(e) => failures.push((staging.join_path(&index.path).to_string(), e)),
            }
        }
        drop(fs);
        staged.sort_by(|a, b| a.1.cmp(&b.1));

        // Pointers go last and are written one at a time.
        if failures.is_empty() {
            for index in pointer_files {
                match self
                    .stage_index(storage, &staging, &live, index, skip_unchanged, progress_cb)
                    .await
                {
                    Ok(Some(path)) => staged.push((index, path)),
                    Ok(None) => report.indices_unchanged.push(live.join_path(&index.path)),
                    Err(e) => {
                        failures.push((staging.join_path(&index.path).to_string(), e));
                        break;
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(self
                .fail(
                    storage,
                    Some(&staging),
                    destination,
                    PublishStage::Verified,
                    failures,
                    progress_cb,
                )
                .await);
        }

        self.enter(PublishStage::Verified, &destination, progress_cb);

        // Promoted.
        let previous_generation = match strategy {
            SwitchStrategy::AtomicLink => match storage.switch_link(&live, &staging).await {
                Ok(previous) => {
                    emit(
                        progress_cb,
                        PublishEvent::LinkSwitched(live.to_string(), staging.to_string()),
                    );
                    report
                        .indices_written
                        .extend(staged.iter().map(|(_, path)| path.clone()));
                    report.generation = Some(staging.clone());
                    previous
                }
                Err(e) => {
                    return Err(self
                        .fail(
                            storage,
                            Some(&staging),
                            destination,
                            PublishStage::Promoted,
                            vec![(live.to_string(), e)],
                            progress_cb,
                        )
                        .await);
                }
            },
            SwitchStrategy::PointerLast => {
                if let Err((failures, restored)) =
                    self.promote(storage, &live, &staging, &staged).await
                {
                    // Backups of replaced files stay around if they could not be restored.
                    if !restored {
                        warn!("previous index files of {} remain in {}", live, staging);
                    }

                    return Err(self
                        .fail(
                            storage,
                            restored.then(|| &staging),
                            destination,
                            PublishStage::Promoted,
                            failures,
                            progress_cb,
                        )
                        .await);
                }

                report
                    .indices_written
                    .extend(staged.iter().map(|(index, _)| live.join_path(&index.path)));

                if let Err(e) = storage.remove_dirs(&staging, &None).await {
                    warn!("unable to remove staging directory {}: {}", staging, e);
                    report.purge_failures.push((staging.to_string(), e));
                }

                None
            }
        };

        self.enter(PublishStage::Promoted, &destination, progress_cb);

        // Purging.
        let stale = match strategy {
            SwitchStrategy::AtomicLink => previous_generation
                .into_iter()
                .filter(|p| p != &staging)
                .collect::<Vec<_>>(),
            SwitchStrategy::PointerLast => previous_files
                .into_iter()
                .filter(|p| !new_paths.contains(p))
                .collect::<Vec<_>>(),
        };

        match self.retention {
            Retention::KeepStale => {
                if !stale.is_empty() {
                    info!("keeping {} stale paths of {}", stale.len(), destination);
                }
                report.retained = stale;
            }
            Retention::RemoveStale => {
                self.enter(PublishStage::Purging, &destination, progress_cb);

                for path in stale {
                    let res = match strategy {
                        SwitchStrategy::AtomicLink => storage.remove_dirs(&path, progress_cb).await,
                        SwitchStrategy::PointerLast => {
                            let res = storage.remove(&path).await;
                            if res.is_ok() {
                                emit(progress_cb, PublishEvent::PathRemoved(path.to_string()));
                            }
                            res
                        }
                    };

                    match res {
                        Ok(()) => report.removed.push(path),
                        Err(e) => {
                            warn!("unable to remove stale {}: {}", path, e);
                            report.purge_failures.push((path.to_string(), e));
                        }
                    }
                }
            }
        }

        report.linked = linked.into_iter().map(|(_, _, file)| file).collect();
        report.indices_written.sort();
        report.indices_unchanged.sort();

        self.enter(PublishStage::Done, &destination, progress_cb);

        Ok(report)
    }

    /// Remove a published distribution.
    ///
    /// Removes `<prefix>/dists/<distribution>` along with any generation directories
    /// backing it. Other distributions whose names start with `<distribution>.` are
    /// not affected. Pool files are not touched: see [Self::cleanup_pool()].
    pub async fn drop_distribution(
        storage: &impl PublishedStorage,
        prefix: &PublishedPath,
        distribution: &str,
        progress_cb: &ProgressCallback,
    ) -> Result<Vec<PublishedPath>> {
        let live = Self::distribution_path(prefix, distribution)?;
        let dists = prefix.join("dists")?;

        let dirs = storage
            .filelist(&dists)
            .await?
            .into_iter()
            .filter_map(|path| {
                path.strip_prefix(&dists)
                    .and_then(|rel| rel.as_str().split('/').next().map(|s| s.to_string()))
            })
            .filter(|name| name == distribution || is_generation_name(name, distribution))
            .collect::<BTreeSet<_>>();

        if dirs.is_empty() {
            return Err(PublishError::NotFound(format!("{} in {}", live, storage)));
        }

        let mut failures = FailureCollector::default();
        let mut removed = vec![];

        for name in dirs {
            let path = dists.join(&name)?;
            info!("removing {} from {}", path, storage);

            let res = storage.remove_dirs(&path, progress_cb).await;
            if res.is_ok() {
                removed.push(path.clone());
            }
            failures.record(&path, res);
        }

        failures.finish()?;

        Ok(removed)
    }

    /// Remove pool files below `<prefix>/pool` not in `referenced`.
    ///
    /// `referenced` must hold the published paths of every package of every
    /// distribution sharing `prefix`. See [Self::referenced_paths()].
    pub async fn cleanup_pool(
        &self,
        storage: &impl PublishedStorage,
        prefix: &PublishedPath,
        referenced: &BTreeSet<PublishedPath>,
        progress_cb: &ProgressCallback,
    ) -> Result<Vec<PublishedPath>> {
        let pool_dir = prefix.join("pool")?;

        let orphans = storage
            .filelist(&pool_dir)
            .await?
            .into_iter()
            .filter(|p| !referenced.contains(p))
            .collect::<Vec<_>>();

        info!(
            "removing {} unreferenced pool files from {}",
            orphans.len(),
            storage
        );

        let mut failures = FailureCollector::default();
        let mut removed = vec![];

        let mut fs = futures::stream::iter(orphans.into_iter().map(|path| async move {
            let res = storage.remove(&path).await;
            (path, res)
        }))
        .buffer_unordered(self.max_parallel_io);

        while let Some((path, res)) = fs.next().await {
            if res.is_ok() {
                emit(progress_cb, PublishEvent::PathRemoved(path.to_string()));
                removed.push(path.clone());
            }
            failures.record(&path, res);
        }
        drop(fs);

        failures.finish()?;
        removed.sort();

        Ok(removed)
    }
}
