// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! OpenStack Swift transport.

Talks to the Swift v1 object API. Authentication uses the v1 (TempAuth style)
protocol: the credentials are exchanged for a storage URL and a token on first
use. The token is reused until the server rejects it.
*/

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
    log::debug,
    percent_encoding::utf8_percent_encode,
    reqwest::{header::HeaderMap, Method, RequestBuilder, Response, StatusCode},
    serde::Deserialize,
    tokio::sync::Mutex,
    url::Url,
};

/// Object metadata header holding the hex SHA-256 of the content.
pub const SHA256_METADATA_HEADER: &str = "X-Object-Meta-Sha256";

/// Maximum number of names requested per container listing.
const LIST_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
struct SwiftSession {
    storage_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ListingEntry {
    name: String,
}

/// An [ObjectClient] talking to a Swift container.
pub struct SwiftClient {
    client: reqwest::Client,
    auth_url: Url,
    username: String,
    api_key: String,
    container: String,
    session: Mutex<Option<SwiftSession>>,
}

impl SwiftClient {
    /// Create a client bound to a container.
    ///
    /// No network activity occurs until the first operation.
    pub fn new(
        auth_url: impl AsRef<str>,
        username: impl ToString,
        api_key: impl ToString,
        container: impl ToString,
    ) -> Result<Self> {
        let container = container.to_string();

        let client = reqwest::Client::builder()
            .user_agent(concat!("debian-publish/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PublishError::backend(format!("swift://{}", container), "", e))?;

        Ok(Self {
            client,
            auth_url: Url::parse(auth_url.as_ref())?,
            username: username.to_string(),
            api_key: api_key.to_string(),
            container,
            session: Mutex::new(None),
        })
    }

    /// The container this client operates on.
    pub fn container(&self) -> &str {
        &self.container
    }

    async fn authenticate(&self) -> Result<SwiftSession> {
        debug!("authenticating to {} as {}", self.auth_url, self.username);

        let res = self
            .client
            .get(self.auth_url.clone())
            .header("X-Auth-User", &self.username)
            .header("X-Auth-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| PublishError::backend(self, self.auth_url.as_str(), e))?;

        if !res.status().is_success() {
            return Err(PublishError::backend(
                self,
                self.auth_url.as_str(),
                format!("authentication failed: HTTP {}", res.status()),
            ));
        }

        let header = |name: &str| {
            res.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    PublishError::backend(
                        self,
                        self.auth_url.as_str(),
                        format!("authentication response lacks {}", name),
                    )
                })
        };

        Ok(SwiftSession {
            storage_url: header("X-Storage-Url")?,
            token: header("X-Auth-Token")?,
        })
    }

    async fn session(&self) -> Result<SwiftSession> {
        let mut session = self.session.lock().await;

        if let Some(session) = session.as_ref() {
            return Ok(session.clone());
        }

        let new = self.authenticate().await?;
        *session = Some(new.clone());

        Ok(new)
    }

    /// Send a request, authenticating again once if the token was rejected.
    async fn send<F>(&self, key: &str, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client, &SwiftSession) -> Result<RequestBuilder> + Send + Sync,
    {
        let mut retried = false;

        loop {
            let session = self.session().await?;

            let res = build(&self.client, &session)?
                .header("X-Auth-Token", &session.token)
                .send()
                .await
                .map_err(|e| PublishError::backend(self, key, e))?;

            if res.status() == StatusCode::UNAUTHORIZED && !retried {
                debug!("token for {} rejected; authenticating again", self);
                self.session.lock().await.take();
                retried = true;
                continue;
            }

            return Ok(res);
        }
    }

    async fn status_error(&self, key: &str, res: Response) -> PublishError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();

        PublishError::backend(self, key, format!("HTTP {}: {}", status, body.trim()))
    }
}

fn container_url(storage_url: &str, container: &str) -> Result<Url> {
    Ok(Url::parse(&format!(
        "{}/{}",
        storage_url.trim_end_matches('/'),
        utf8_percent_encode(container, KEY_ESCAPE)
    ))?)
}

fn object_url(storage_url: &str, container: &str, key: &str) -> Result<Url> {
    Ok(Url::parse(&format!(
        "{}/{}/{}",
        storage_url.trim_end_matches('/'),
        utf8_percent_encode(container, KEY_ESCAPE),
        utf8_percent_encode(key, KEY_ESCAPE)
    ))?)
}

/// Derive the content digest of an object from its response headers.
///
/// Segmented objects report a quoted ETag that isn't the content MD5. The
/// SHA-256 recorded at upload time is used for those.
fn object_digest(headers: &HeaderMap) -> Option<ContentDigest> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let large_object =
        headers.contains_key("X-Object-Manifest") || headers.contains_key("X-Static-Large-Object");

    header("ETag")
        .filter(|_| !large_object)
        .and_then(etag_md5)
        .or_else(|| header(SHA256_METADATA_HEADER).and_then(|h| ContentDigest::sha256_hex(h).ok()))
}

fn parse_listing(data: &[u8], limit: usize) -> Result<ObjectListPage> {
    let entries = serde_json::from_slice::<Vec<ListingEntry>>(data)?;

    let next_marker = if entries.len() >= limit {
        entries.last().map(|e| e.name.clone())
    } else {
        None
    };

    Ok(ObjectListPage {
        keys: entries.into_iter().map(|e| e.name).collect(),
        next_marker,
    })
}

impl std::fmt::Display for SwiftClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "swift://{}", self.container)
    }
}

#[async_trait]
impl ObjectClient for SwiftClient {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectRecord>> {
        let res = self
            .send(key, |client, session| {
                Ok(client.head(object_url(&session.storage_url, &self.container, key)?))
            })
            .await?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size = res
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);

                Ok(Some(ObjectRecord {
                    path: PublishedPath::new(key)?,
                    size,
                    digest: object_digest(res.headers()),
                }))
            }
            _ => Err(self.status_error(key, res).await),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        digests: &MultiContentDigest,
    ) -> Result<()> {
        let res = self
            .send(key, |client, session| {
                Ok(client
                    .request(
                        Method::PUT,
                        object_url(&session.storage_url, &self.container, key)?,
                    )
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    // Swift rejects the upload if the received content has a different MD5.
                    .header(reqwest::header::ETAG, digests.md5.digest_hex())
                    .header(SHA256_METADATA_HEADER, digests.sha256.digest_hex())
                    .body(data.clone()))
            })
            .await?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(self.status_error(key, res).await)
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let res = self
            .send(key, |client, session| {
                Ok(client.delete(object_url(&session.storage_url, &self.container, key)?))
            })
            .await?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(self.status_error(key, res).await),
        }
    }

    async fn list_objects(&self, prefix: &str, marker: Option<&str>) -> Result<ObjectListPage> {
        let limit = LIST_LIMIT.to_string();

        let res = self
            .send(prefix, |client, session| {
                let mut query = vec![
                    ("format", "json"),
                    ("prefix", prefix),
                    ("limit", limit.as_str()),
                ];
                if let Some(marker) = marker {
                    query.push(("marker", marker));
                }

                Ok(client
                    .get(container_url(&session.storage_url, &self.container)?)
                    .query(&query))
            })
            .await?;

        match res.status() {
            StatusCode::NO_CONTENT => Ok(ObjectListPage::default()),
            status if status.is_success() => {
                let data = res
                    .bytes()
                    .await
                    .map_err(|e| PublishError::backend(self, prefix, e))?;

                parse_listing(&data, LIST_LIMIT)
            }
            _ => Err(self.status_error(prefix, res).await),
        }
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        let copy_from = format!(
            "/{}/{}",
            utf8_percent_encode(&self.container, KEY_ESCAPE),
            utf8_percent_encode(from, KEY_ESCAPE)
        );

        let res = self
            .send(from, |client, session| {
                Ok(client
                    .request(
                        Method::PUT,
                        object_url(&session.storage_url, &self.container, to)?,
                    )
                    .header("X-Copy-From", &copy_from)
                    .header(reqwest::header::CONTENT_LENGTH, "0"))
            })
            .await?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(self.status_error(from, res).await)
        }
    }
}
