// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! An in-process object store.

[InMemoryObjectClient] behaves like a single-part-upload S3 bucket: the reported
digest of an object is the MD5 of its content. It supports injecting failures
for specific operations and keys, which makes it suitable for exercising error
paths of [super::object::ObjectPublishedStorage].
*/

use {
    crate::{
        error::{PublishError, Result},
        io::{ContentDigest, MultiContentDigest, MultiDigester},
        path::PublishedPath,
        storage::{
            object::{ObjectClient, ObjectListPage},
            ObjectRecord,
        },
    },
    async_trait::async_trait,
    bytes::Bytes,
    std::{
        collections::{BTreeMap, HashSet},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex, MutexGuard,
        },
    },
};

/// Default number of keys returned per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// An [ObjectClient] operation, for failure injection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectOperation {
    Head,
    Put,
    Delete,
    List,
    Copy,
}

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    /// Digest the store reports for the object.
    digest: Option<ContentDigest>,
}

/// An [ObjectClient] holding objects in memory.
pub struct InMemoryObjectClient {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failures: Mutex<HashSet<(ObjectOperation, String)>>,
    suffix_failures: Mutex<Vec<(ObjectOperation, String)>>,
    page_size: usize,
    write_log: Mutex<Vec<String>>,
    put_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Default for InMemoryObjectClient {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryObjectClient {
    /// Construct an empty store returning at most `page_size` keys per listing.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashSet::new()),
            suffix_failures: Mutex::new(vec![]),
            page_size: page_size.max(1),
            write_log: Mutex::new(vec![]),
            put_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Make every future `operation` on `key` fail.
    ///
    /// For [ObjectOperation::List], `key` is the listing prefix. For
    /// [ObjectOperation::Copy], it is the destination key.
    pub fn fail_on(&self, operation: ObjectOperation, key: impl ToString) {
        lock(&self.failures).insert((operation, key.to_string()));
    }

    /// Make every future `operation` on a key ending with `suffix` fail.
    pub fn fail_on_suffix(&self, operation: ObjectOperation, suffix: impl ToString) {
        lock(&self.suffix_failures).push((operation, suffix.to_string()));
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
        lock(&self.suffix_failures).clear();
    }

    /// Store an object the way a foreign tool would: without a usable digest.
    pub fn insert_foreign(&self, key: impl ToString, data: Bytes) {
        lock(&self.objects).insert(key.to_string(), StoredObject { data, digest: None });
    }

    /// All keys in the store.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Content of an object.
    pub fn object_data(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).map(|o| o.data.clone())
    }

    /// Number of [ObjectClient::put_object()] calls served.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Keys written by [ObjectClient::put_object()] or as the destination of
    /// [ObjectClient::copy_object()], in call order.
    pub fn write_keys(&self) -> Vec<String> {
        lock(&self.write_log).clone()
    }

    /// Number of [ObjectClient::list_objects()] calls served.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: ObjectOperation, key: &str) -> Result<()> {
        let injected = lock(&self.failures).contains(&(operation, key.to_string()))
            || lock(&self.suffix_failures)
                .iter()
                .any(|(op, suffix)| *op == operation && key.ends_with(suffix.as_str()));

        if injected {
            Err(PublishError::backend(
                self,
                key,
                format!("injected {:?} failure", operation),
            ))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Display for InMemoryObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("memory://")
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectRecord>> {
        self.check(ObjectOperation::Head, key)?;

        match lock(&self.objects).get(key) {
            Some(object) => Ok(Some(ObjectRecord {
                path: PublishedPath::new(key)?,
                size: object.data.len() as u64,
                digest: object.digest.clone(),
            })),
            None => Ok(None),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        _digests: &MultiContentDigest,
    ) -> Result<()> {
        self.check(ObjectOperation::Put, key)?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.write_log).push(key.to_string());

        // Like an S3 ETag, the reported digest comes from the stored bytes rather than
        // what the client claims.
        let digest = Some(MultiDigester::digest_data(&data).md5);

        lock(&self.objects).insert(key.to_string(), StoredObject { data, digest });

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check(ObjectOperation::Delete, key)?;

        lock(&self.objects).remove(key);

        Ok(())
    }

    async fn list_objects(&self, prefix: &str, marker: Option<&str>) -> Result<ObjectListPage> {
        self.check(ObjectOperation::List, prefix)?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let objects = lock(&self.objects);

        let mut keys = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| marker.map(|m| k.as_str() > m).unwrap_or(true))
            .take(self.page_size + 1)
            .cloned()
            .collect::<Vec<_>>();

        let next_marker = if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ObjectListPage { keys, next_marker })
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        self.check(ObjectOperation::Copy, to)?;

        let mut objects = lock(&self.objects);

        let object = objects
            .get(from)
            .cloned()
            .ok_or_else(|| PublishError::NotFound(format!("{} in {}", from, self)))?;
        objects.insert(to.to_string(), object);
        lock(&self.write_log).push(to.to_string());

        Ok(())
    }
}
