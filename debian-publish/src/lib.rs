// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publishing of Debian repositories to local and remote storage.

This crate writes Debian repository trees (a `pool` of package files plus
`dists/<distribution>` index files) to *published storage*: a local directory,
an Amazon S3 bucket or an OpenStack Swift container.

# A Tour of Functionality

Paths within published storage are [path::PublishedPath] instances. These are
always relative and never contain `.` or `..` segments.

Package files come from a content-addressed [pool::PackagePool]. The
[pool::FilesystemPackagePool] stores files in a local directory keyed by their
SHA-256.

The [storage::PublishedStorage] trait abstracts a storage backend. Every backend
supports writing, listing, renaming and removing files as well as
[storage::PublishedStorage::link_from_pool()], which places a pool file at its
published path while refusing to replace a file having different content.

Backends:

* [storage::filesystem::FilesystemPublishedStorage] writes to a local directory
  using hard links, copies or symlinks.
* [storage::object::ObjectPublishedStorage] writes to an object store through an
  [storage::object::ObjectClient]. Clients exist for S3
  ([storage::s3::S3Client], feature `s3`), Swift ([storage::swift::SwiftClient],
  feature `swift`) and process memory ([storage::memory::InMemoryObjectClient]).

[storage::PublishedStorageBackend] holds any of these and can be constructed
from a URL via [storage::StorageLocation].

[publisher::Publisher] drives a publish operation through a series of
[publisher::PublishStage] so clients never see a partially written tree.

# Crate Features

* `s3` (default) enables the S3 client via `rusoto`.
* `swift` (default) enables the Swift client via `reqwest`.
*/

pub mod error;
pub mod io;
pub mod path;
pub mod pool;
pub mod publisher;
pub mod storage;
