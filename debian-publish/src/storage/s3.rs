// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Amazon S3 transport. */

use {
    crate::{
        error::{PublishError, Result},
        io::{etag_md5, ContentDigest, MultiContentDigest},
        path::PublishedPath,
        storage::{
            object::{ObjectClient, ObjectListPage, KEY_ESCAPE},
            ObjectRecord,
        },
    },
    async_trait::async_trait,
    bytes::Bytes,
    percent_encoding::utf8_percent_encode,
    rusoto_core::{ByteStream, Client, Region, RusotoError},
    rusoto_s3::{
        CopyObjectRequest, DeleteObjectRequest, HeadObjectError, HeadObjectRequest,
        ListObjectsV2Request, PutObjectRequest, S3Client as RusotoS3Client, S3,
    },
    std::{collections::HashMap, str::FromStr},
};

/// User metadata key holding the hex SHA-256 of an object.
pub const SHA256_METADATA_KEY: &str = "sha256";

/// An [ObjectClient] talking to an S3 bucket.
pub struct S3Client {
    client: RusotoS3Client,
    bucket: String,
}

impl S3Client {
    /// Create a client bound to a named bucket.
    ///
    /// `region` defaults to the region resolved from the environment. `endpoint`
    /// selects an S3-compatible service other than AWS.
    pub fn new(
        bucket: impl ToString,
        region: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Self> {
        let bucket = bucket.to_string();

        let region = match (region, endpoint) {
            (region, Some(endpoint)) => Region::Custom {
                name: region.unwrap_or("us-east-1").to_string(),
                endpoint: endpoint.to_string(),
            },
            (Some(region), None) => Region::from_str(region).map_err(|e| {
                PublishError::StorageLocation(format!("s3://{}", bucket), e.to_string())
            })?,
            (None, None) => Region::default(),
        };

        Ok(Self {
            client: RusotoS3Client::new(region),
            bucket,
        })
    }

    /// Create a client bound to a named bucket with an existing AWS [Client].
    pub fn new_with_client(client: Client, region: Region, bucket: impl ToString) -> Self {
        Self {
            client: RusotoS3Client::new_with_client(client, region),
            bucket: bucket.to_string(),
        }
    }

    /// The bucket this client operates on.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn error<E: std::fmt::Debug>(&self, key: &str, e: RusotoError<E>) -> PublishError {
        PublishError::backend(self, key, e)
    }
}

/// Derive the content digest of an object from its ETag or metadata.
///
/// The ETag of a single part upload is the MD5 of the content. Multipart uploads
/// have opaque ETags, so the SHA-256 recorded at upload time is used instead.
fn object_digest(
    etag: Option<&str>,
    metadata: Option<&HashMap<String, String>>,
) -> Option<ContentDigest> {
    etag.and_then(etag_md5).or_else(|| {
        metadata
            .and_then(|m| m.get(SHA256_METADATA_KEY))
            .and_then(|hex| ContentDigest::sha256_hex(hex).ok())
    })
}

impl std::fmt::Display for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}", self.bucket)
    }
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectRecord>> {
        let req = HeadObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };

        match self.client.head_object(req).await {
            Ok(output) => Ok(Some(ObjectRecord {
                path: PublishedPath::new(key)?,
                size: output.content_length.unwrap_or(0) as u64,
                digest: object_digest(output.e_tag.as_deref(), output.metadata.as_ref()),
            })),
            Err(RusotoError::Service(HeadObjectError::NoSuchKey(_))) => Ok(None),
            // HEAD responses have no body, so a missing key often surfaces as a bare 404.
            Err(RusotoError::Unknown(res)) if res.status.as_u16() == 404 => Ok(None),
            Err(e) => Err(self.error(key, e)),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        digests: &MultiContentDigest,
    ) -> Result<()> {
        let content_length = data.len() as i64;
        let stream = futures::stream::once(async { Ok(data) });

        let req = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            body: Some(ByteStream::new(stream)),
            content_length: Some(content_length),
            metadata: Some(HashMap::from([(
                SHA256_METADATA_KEY.to_string(),
                digests.sha256.digest_hex(),
            )])),
            ..Default::default()
        };

        self.client
            .put_object(req)
            .await
            .map_err(|e| self.error(key, e))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let req = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };

        self.client
            .delete_object(req)
            .await
            .map_err(|e| self.error(key, e))?;

        Ok(())
    }

    async fn list_objects(&self, prefix: &str, marker: Option<&str>) -> Result<ObjectListPage> {
        let req = ListObjectsV2Request {
            bucket: self.bucket.clone(),
            prefix: Some(prefix.to_string()),
            continuation_token: marker.map(|m| m.to_string()),
            ..Default::default()
        };

        let output = self
            .client
            .list_objects_v2(req)
            .await
            .map_err(|e| self.error(prefix, e))?;

        let keys = output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|o| o.key)
            .collect::<Vec<_>>();

        let next_marker = if output.is_truncated.unwrap_or(false) {
            output.next_continuation_token
        } else {
            None
        };

        Ok(ObjectListPage { keys, next_marker })
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        let req = CopyObjectRequest {
            bucket: self.bucket.clone(),
            key: to.to_string(),
            copy_source: format!(
                "{}/{}",
                self.bucket,
                utf8_percent_encode(from, KEY_ESCAPE)
            ),
            ..Default::default()
        };

        self.client
            .copy_object(req)
            .await
            .map_err(|e| self.error(from, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_from_etag_or_metadata() -> Result<()> {
        let md5 = "5d41402abc4b2a76b9719d911017c592";
        let sha256 = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let metadata = HashMap::from([(SHA256_METADATA_KEY.to_string(), sha256.to_string())]);

        assert_eq!(
            object_digest(Some(&format!("\"{}\"", md5)), Some(&metadata)),
            Some(ContentDigest::md5_hex(md5)?)
        );
        assert_eq!(
            object_digest(Some("\"abc-2\""), Some(&metadata)),
            Some(ContentDigest::sha256_hex(sha256)?)
        );
        assert_eq!(object_digest(Some("\"abc-2\""), None), None);

        Ok(())
    }

    #[test]
    fn copy_source_escaping() {
        assert_eq!(
            utf8_percent_encode("pool/main/g/gcc/g++_1.0+b1_amd64.deb", KEY_ESCAPE)
                .to_string(),
            "pool/main/g/gcc/g%2B%2B_1.0%2Bb1_amd64.deb"
        );
    }

    #[tokio::test]
    async fn explicit_endpoint() -> Result<()> {
        let client = S3Client::new("bucket", None, Some("http://localhost:9000"))?;
        assert_eq!(client.to_string(), "s3://bucket");
        assert_eq!(client.bucket(), "bucket");

        assert!(S3Client::new("bucket", Some("not-a-region"), None).is_err());

        Ok(())
    }
}
