// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    debian_publish::{
        error::PublishError,
        path::PublishedPath,
        pool::FilesystemPackagePool,
        publisher::{
            ManifestGenerator, PublishEvent, PublishReport, PublishStage, PublishedPackage,
            Publisher, Retention,
        },
        storage::{
            LinkOutcome, ProgressCallback, PublishedStorage, PublishedStorageBackend,
            StorageLocation,
        },
    },
    log::{debug, warn, LevelFilter},
    serde::Deserialize,
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    },
    thiserror::Error,
};

const LOCATIONS_ABOUT: &str = "\
Storage Locations

Various commands accept a location describing where a repository is
published. Here is how they work.

If a value contains `://`, it will be parsed as a URL. Otherwise it will be
interpreted as a local filesystem path.

The following URL schemes are recognized:

file://
   A local filesystem path. The path component of the URL is interpreted as
   a filesystem path.

   Pool files are hard linked from the package pool when possible. Index
   files for a distribution are written to a new directory and
   `dists/<distribution>` is switched to it with a symlink.

s3://
   An S3 bucket.

   URLs of the form `s3://bucket` anchor the repository at the root of the S3
   bucket.

   URLs of the form `s3://bucket/path` anchor the repository under a key prefix
   in the bucket.

   The AWS client will be resolved using configuration files and environment
   variables as is typical for AWS clients. `AWS_REGION` selects the region.
   `AWS_ENDPOINT_URL` selects an S3-compatible service.

swift://
   An OpenStack Swift container.

   URLs of the form `swift://container/path` anchor the repository under an
   object name prefix in the container.

   Credentials come from the `ST_AUTH`, `ST_USER` and `ST_KEY` environment
   variables, as used by the `swift` command line client.

Object stores have no directories or links. Changed index files are uploaded
to a staging prefix first and then copied over the live ones, with the
`Manifest` file clients fetch first copied last.
";

const PUBLISH_ABOUT: &str = "\
Publish package sets to a repository.

Package files are imported into a local package pool, linked into the
`pool` area of the destination and described by index files written below
`dists/<distribution>`. Clients reading the repository see either the
previously published tree or the new one.

Publishing the same packages again is a no-op. Publishing a package file
whose name is already used by a file with different content fails unless
`force_overwrite` is set.

# YAML Configuration

destination (required) (string or object)
   The location to publish to. A string is a URL or path as described by
   `dpt locations`. An object has a `kind` key (`filesystem`, `s3` or
   `swift`) plus the settings of that kind of storage, for example:

      destination:
        kind: s3
        bucket: my-bucket
        prefix: debian
        region: us-west-2

pool_dir (required) (string)
   Directory of the local package pool. Relative paths are resolved against
   the directory holding the YAML file.

prefix (optional) (string)
   Path below the destination to publish to.

keep_stale (optional) (bool)
   Leave the content of the previously published tree in place.

force_overwrite (optional) (bool)
   Replace published files having different content.

distributions (required) (list[object])
   Distributions to publish. Each entry has a `name` and a list of
   `packages`. Each package has the following keys:

   path (required) (string)
      Path of the package file.
   component (optional) (string)
      Repository component. Defaults to `main`.
   source (optional) (string)
      Source package name. Defaults to the part of the filename before the
      first `_`.
   filename (optional) (string)
      Name to publish the file under. Defaults to the name of `path`.
";

#[derive(Debug, Error)]
pub enum DptError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Publish(#[from] PublishError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0:?}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("invalid package {0}: {1}")]
    InvalidPackage(String, &'static str),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, DptError>;

fn default_component() -> String {
    "main".to_string()
}

/// A package file to publish.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PackageConfig {
    pub path: PathBuf,
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl PackageConfig {
    /// Resolve the source package name.
    pub fn source_name(&self) -> Result<String> {
        if let Some(source) = &self.source {
            return Ok(source.clone());
        }

        let filename = self
            .filename
            .clone()
            .or_else(|| {
                self.path
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
            })
            .ok_or_else(|| {
                DptError::InvalidPackage(format!("{}", self.path.display()), "no file name")
            })?;

        match filename.split('_').next() {
            Some(name) if !name.is_empty() && name != filename => Ok(name.to_string()),
            _ => Err(DptError::InvalidPackage(
                filename,
                "unable to derive source name; specify `source`",
            )),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DistributionConfig {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<PackageConfig>,
}

/// Where to publish to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Destination {
    /// A URL or filesystem path. See [StorageLocation::from_url()].
    Url(String),
    Location(StorageLocation),
}

impl Destination {
    pub fn location(&self) -> Result<StorageLocation> {
        match self {
            Self::Url(url) => Ok(StorageLocation::from_url(url)?),
            Self::Location(location) => Ok(location.clone()),
        }
    }
}

/// Defines a publish operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    pub destination: Destination,
    pub pool_dir: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub keep_stale: bool,
    #[serde(default)]
    pub force_overwrite: bool,
    pub distributions: Vec<DistributionConfig>,
}

impl PublishConfig {
    /// Load a config from a YAML file.
    ///
    /// Relative paths in the config are resolved against the directory of the file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let mut config: Self = serde_yaml::from_reader(f)?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }

        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.pool_dir = base.join(&self.pool_dir);

        for dist in self.distributions.iter_mut() {
            for package in dist.packages.iter_mut() {
                package.path = base.join(&package.path);
            }
        }
    }

    pub fn prefix(&self) -> Result<PublishedPath> {
        Ok(match &self.prefix {
            Some(prefix) => PublishedPath::new(prefix)?,
            None => PublishedPath::root(),
        })
    }

    pub fn storage(&self) -> Result<PublishedStorageBackend> {
        Ok(PublishedStorageBackend::from_location(
            &self.destination.location()?,
        )?)
    }
}

/// Import the packages of a distribution into the pool.
async fn import_packages(
    pool: &FilesystemPackagePool,
    dist: &DistributionConfig,
) -> Result<Vec<PublishedPackage>> {
    let mut packages = vec![];

    for package in &dist.packages {
        let entry = pool
            .import(&package.path, package.filename.as_deref())
            .await?;
        debug!("{} is pool entry {}", package.path.display(), entry.pool_path);

        packages.push(PublishedPackage {
            component: package.component.clone(),
            source: package.source_name()?,
            checksum: entry.checksum().clone(),
        });
    }

    Ok(packages)
}

fn progress_callback() -> ProgressCallback {
    Some(Box::new(|event: PublishEvent| match event {
        PublishEvent::StageEntered(PublishStage::Failed) => {
            warn!("{}", event);
        }
        PublishEvent::StageEntered(_)
        | PublishEvent::ResolvedPoolEntries(_)
        | PublishEvent::LinkSwitched(_, _) => {
            println!("{}", event);
        }
        _ => {
            debug!("{}", event);
        }
    }))
}

fn print_report(report: &PublishReport) {
    println!(
        "{}: {} files linked, {} already present, {} replaced",
        report.distribution_path,
        report.count(LinkOutcome::Created),
        report.count(LinkOutcome::AlreadyPresent),
        report.count(LinkOutcome::Overwritten)
    );
    println!(
        "{}: {} index files written, {} unchanged",
        report.distribution_path,
        report.indices_written.len(),
        report.indices_unchanged.len()
    );
    if let Some(generation) = &report.generation {
        println!("{}: now backed by {}", report.distribution_path, generation);
    }
    for path in &report.retained {
        println!("kept stale {}", path);
    }
    for (path, err) in &report.purge_failures {
        warn!("failed to remove stale {}: {}", path, err);
    }
}

pub async fn run_cli() -> Result<()> {
    let default_threads = format!("{}", num_cpus::get());

    let app = Command::new("Debian Publish Tool")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Publish Debian repositories to local and remote storage")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.arg(
        Arg::new("max-parallel-io")
            .long("--max-parallel-io")
            .takes_value(true)
            .default_value(&default_threads)
            .global(true)
            .help("Maximum number of parallel I/O operations to perform"),
    );

    let app = app.subcommand(
        Command::new("publish")
            .about("Publish distributions defined by a YAML file")
            .long_about(PUBLISH_ABOUT)
            .arg(
                Arg::new("yaml-config")
                    .long("--yaml-config")
                    .takes_value(true)
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Path to a YAML file defining the publish configuration"),
            ),
    );

    let app = app.subcommand(
        Command::new("cleanup-pool")
            .about("Remove published pool files no distribution in a YAML file references")
            .arg(
                Arg::new("yaml-config")
                    .long("--yaml-config")
                    .takes_value(true)
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Path to a YAML file defining the publish configuration"),
            ),
    );

    let app = app.subcommand(
        Command::new("list")
            .about("List files in published storage")
            .arg(
                Arg::new("location")
                    .required(true)
                    .help("Location of published storage"),
            )
            .arg(Arg::new("path").help("Directory to list")),
    );

    let app = app.subcommand(
        Command::new("remove-dirs")
            .about("Recursively remove a directory from published storage")
            .arg(
                Arg::new("location")
                    .required(true)
                    .help("Location of published storage"),
            )
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Directory to remove"),
            ),
    );

    let app = app.subcommand(
        Command::new("drop")
            .about("Remove a published distribution, leaving pool files in place")
            .arg(
                Arg::new("prefix")
                    .long("--prefix")
                    .takes_value(true)
                    .help("Path the distribution was published below"),
            )
            .arg(
                Arg::new("location")
                    .required(true)
                    .help("Location of published storage"),
            )
            .arg(
                Arg::new("distribution")
                    .required(true)
                    .help("Name of the distribution to remove"),
            ),
    );

    let mut app = app.subcommand(
        Command::new("locations").about("Print documentation about storage locations"),
    );

    let matches = app.clone().get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    // The HTTP stacks are noisy at info level.
    if log_level == LevelFilter::Info {
        builder
            .filter_module("rustls", LevelFilter::Error)
            .filter_module("rusoto_core", LevelFilter::Warn)
            .filter_module("hyper", LevelFilter::Warn);
    }

    builder.init();

    match matches.subcommand() {
        Some(("publish", args)) => command_publish(args).await,
        Some(("cleanup-pool", args)) => command_cleanup_pool(args).await,
        Some(("list", args)) => command_list(args).await,
        Some(("remove-dirs", args)) => command_remove_dirs(args).await,
        Some(("drop", args)) => command_drop(args).await,
        Some(("locations", _)) => {
            println!("{}", LOCATIONS_ABOUT);
            Ok(())
        }
        Some((command, _)) => Err(DptError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

fn load_config(args: &ArgMatches) -> Result<PublishConfig> {
    let yaml_path = args
        .value_of_os("yaml-config")
        .expect("yaml-config argument is required");

    PublishConfig::from_path(Path::new(yaml_path))
}

fn storage_arg(args: &ArgMatches) -> Result<PublishedStorageBackend> {
    let location = args
        .value_of("location")
        .expect("location argument is required");

    Ok(PublishedStorageBackend::from_location(
        &StorageLocation::from_url(location)?,
    )?)
}

async fn command_publish(args: &ArgMatches) -> Result<()> {
    let max_parallel_io = args.value_of_t::<usize>("max-parallel-io")?;
    let config = load_config(args)?;

    let storage = config.storage()?;
    let prefix = config.prefix()?;
    let pool = FilesystemPackagePool::new(&config.pool_dir);
    let generator = ManifestGenerator;

    let mut publisher = Publisher::new(&pool, &generator);
    publisher.set_max_parallel_io(max_parallel_io);
    publisher.set_force_overwrite(config.force_overwrite);
    if config.keep_stale {
        publisher.set_retention(Retention::KeepStale);
    }

    let cb = progress_callback();

    for dist in &config.distributions {
        let packages = import_packages(&pool, dist).await?;

        let report = publisher
            .publish(&storage, &prefix, &dist.name, &packages, &cb)
            .await?;
        print_report(&report);
    }

    Ok(())
}

async fn command_cleanup_pool(args: &ArgMatches) -> Result<()> {
    let max_parallel_io = args.value_of_t::<usize>("max-parallel-io")?;
    let config = load_config(args)?;

    let storage = config.storage()?;
    let prefix = config.prefix()?;
    let pool = FilesystemPackagePool::new(&config.pool_dir);
    let generator = ManifestGenerator;

    let mut publisher = Publisher::new(&pool, &generator);
    publisher.set_max_parallel_io(max_parallel_io);

    let mut referenced = BTreeSet::new();
    for dist in &config.distributions {
        let packages = import_packages(&pool, dist).await?;
        referenced.extend(publisher.referenced_paths(&prefix, &packages).await?);
    }

    let removed = publisher
        .cleanup_pool(&storage, &prefix, &referenced, &progress_callback())
        .await?;

    for path in &removed {
        println!("removed {}", path);
    }
    println!("removed {} unreferenced pool files", removed.len());

    Ok(())
}

async fn command_list(args: &ArgMatches) -> Result<()> {
    let storage = storage_arg(args)?;
    let path = match args.value_of("path") {
        Some(path) => PublishedPath::new(path)?,
        None => PublishedPath::root(),
    };

    for path in storage.filelist(&path).await? {
        println!("{}", path);
    }

    Ok(())
}

async fn command_remove_dirs(args: &ArgMatches) -> Result<()> {
    let storage = storage_arg(args)?;
    let path = PublishedPath::new(args.value_of("path").expect("path argument is required"))?;

    storage.remove_dirs(&path, &progress_callback()).await?;
    println!("removed {} from {}", path, storage);

    Ok(())
}

async fn command_drop(args: &ArgMatches) -> Result<()> {
    let storage = storage_arg(args)?;
    let prefix = match args.value_of("prefix") {
        Some(prefix) => PublishedPath::new(prefix)?,
        None => PublishedPath::root(),
    };
    let distribution = args
        .value_of("distribution")
        .expect("distribution argument is required");

    for path in Publisher::drop_distribution(&storage, &prefix, distribution, &progress_callback())
        .await?
    {
        println!("removed {}", path);
    }

    Ok(())
}
