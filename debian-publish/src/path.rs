// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Logical paths within published storage.

Every storage backend addresses content with a [PublishedPath]: a forward slash
separated path relative to the root of a storage location. Object stores map it
to a key below their configured prefix. The local filesystem backend maps it
below its root directory.
*/

use {
    crate::error::{PublishError, Result},
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

/// A validated, normalized path relative to a storage root.
///
/// Normalization strips leading and trailing separators, collapses repeated
/// separators and drops `.` segments. Any `..` segment is rejected. The empty
/// path denotes the storage root.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublishedPath(String);

impl PublishedPath {
    /// Parse and normalize a path.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();

        if raw.contains('\0') {
            return Err(PublishError::InvalidPath(
                raw.to_string(),
                "contains NUL byte",
            ));
        }
        if raw.contains('\\') {
            return Err(PublishError::InvalidPath(
                raw.to_string(),
                "backslash separators are not allowed",
            ));
        }

        let mut segments = vec![];

        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(PublishError::InvalidPath(
                        raw.to_string(),
                        "parent directory segments are not allowed",
                    ));
                }
                s => segments.push(s),
            }
        }

        Ok(Self(segments.join("/")))
    }

    /// The storage root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Whether this is the storage root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The normalized string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a relative path, validating and normalizing it.
    pub fn join(&self, other: impl AsRef<str>) -> Result<Self> {
        let other = Self::new(other)?;

        Ok(if self.is_root() {
            other
        } else if other.is_root() {
            self.clone()
        } else {
            Self(format!("{}/{}", self.0, other.0))
        })
    }

    /// Append another already validated path.
    pub fn join_path(&self, other: &PublishedPath) -> Self {
        if self.is_root() {
            other.clone()
        } else if other.is_root() {
            self.clone()
        } else {
            Self(format!("{}/{}", self.0, other.0))
        }
    }

    /// The final segment, if any.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// The path without its final segment.
    ///
    /// Returns [None] for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(match self.0.rfind('/') {
                Some(pos) => Self(self.0[0..pos].to_string()),
                None => Self::root(),
            })
        }
    }

    /// Whether this path is `other` or lies below it.
    pub fn starts_with(&self, other: &PublishedPath) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0[other.0.len()..].starts_with('/'))
    }

    /// Strip a leading directory, returning the remainder.
    pub fn strip_prefix(&self, prefix: &PublishedPath) -> Option<Self> {
        if prefix.is_root() {
            Some(self.clone())
        } else if self.0 == prefix.0 {
            Some(Self::root())
        } else {
            self.0
                .strip_prefix(&prefix.0)
                .and_then(|rest| rest.strip_prefix('/'))
                .map(|rest| Self(rest.to_string()))
        }
    }

    /// Resolve this path against a filesystem directory.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        self.0
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(root.to_path_buf(), |acc, s| acc.join(s))
    }
}

impl std::fmt::Display for PublishedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl AsRef<str> for PublishedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PublishedPath {
    type Error = PublishError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for PublishedPath {
    type Error = PublishError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PublishedPath> for String {
    fn from(path: PublishedPath) -> Self {
        path.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalization() -> Result<()> {
        assert_eq!(PublishedPath::new("")?.as_str(), "");
        assert_eq!(PublishedPath::new("/")?.as_str(), "");
        assert_eq!(PublishedPath::new("//a//b/./c/")?.as_str(), "a/b/c");
        assert_eq!(PublishedPath::new("dists/bullseye")?.as_str(), "dists/bullseye");
        assert!(PublishedPath::new("a/../b").is_err());
        assert!(PublishedPath::new("..").is_err());
        assert!(PublishedPath::new("a\\b").is_err());
        // `..` is only special as a full segment.
        assert_eq!(PublishedPath::new("a/..b")?.as_str(), "a/..b");

        Ok(())
    }

    #[test]
    fn joining_and_components() -> Result<()> {
        let root = PublishedPath::root();
        let dists = root.join("dists")?;
        assert_eq!(dists.as_str(), "dists");

        let release = dists.join("bullseye/Release")?;
        assert_eq!(release.as_str(), "dists/bullseye/Release");
        assert_eq!(release.file_name(), Some("Release"));
        assert_eq!(release.parent(), Some(PublishedPath::new("dists/bullseye")?));
        assert_eq!(dists.parent(), Some(root.clone()));
        assert_eq!(root.parent(), None);
        assert!(dists.join("../etc").is_err());

        Ok(())
    }

    #[test]
    fn prefix_relations() -> Result<()> {
        let pool = PublishedPath::new("pool")?;
        let file = PublishedPath::new("pool/main/a/apt/apt.deb")?;
        let other = PublishedPath::new("poolside/x")?;

        assert!(file.starts_with(&pool));
        assert!(pool.starts_with(&pool));
        assert!(!other.starts_with(&pool));
        assert!(other.starts_with(&PublishedPath::root()));
        assert_eq!(
            file.strip_prefix(&pool),
            Some(PublishedPath::new("main/a/apt/apt.deb")?)
        );
        assert_eq!(other.strip_prefix(&pool), None);

        Ok(())
    }

    #[test]
    fn serde_validates() {
        let parsed: std::result::Result<PublishedPath, _> =
            serde_json::from_str("\"dists/../etc\"");
        assert!(parsed.is_err());
    }
}
