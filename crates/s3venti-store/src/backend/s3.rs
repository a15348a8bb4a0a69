//! S3-compatible durable backend
//!
//! Path-style requests (`{endpoint}/{bucket}/{key}`) signed with SigV4.
//! A 404 maps to [`BackendError::NotFound`]; every other failure, including
//! non-success statuses, maps to [`BackendError::Transport`].

use super::sigv4::{
    Credentials, EMPTY_PAYLOAD_SHA256, SigV4Signer, SigningRequest, canonical_query, hex_sha256,
    uri_encode,
};
use super::{BackendError, BackendResult, DurableBackend};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode, Url};
use s3venti_common::config::BackendConfig;
use s3venti_common::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Keys returned per ListObjectsV2 page
const LIST_PAGE_SIZE: &str = "1000";

/// S3 implementation of [`DurableBackend`]
pub struct S3Backend {
    client: reqwest::Client,
    endpoint: Url,
    bucket: String,
    signer: SigV4Signer,
}

impl S3Backend {
    /// Create a backend from configuration. Credentials not present in the
    /// configuration are read from `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY`.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let access_key_id = config
            .access_key
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| Error::Configuration("no S3 access key configured".into()))?;
        let secret_access_key = config
            .secret_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| Error::Configuration("no S3 secret key configured".into()))?;

        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| Error::Configuration(format!("invalid endpoint {}: {e}", config.endpoint)))?;
        if endpoint.host_str().is_none() {
            return Err(Error::Configuration(format!(
                "endpoint {} has no host",
                config.endpoint
            )));
        }

        let mut builder = reqwest::Client::builder();
        if config.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(config.timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            bucket: config.bucket.clone(),
            signer: SigV4Signer::new(
                Credentials {
                    access_key_id,
                    secret_access_key,
                },
                config.region.clone(),
            ),
        })
    }

    /// Encoded request path for `key`, or for the bucket itself when `None`
    fn path_for(&self, key: Option<&str>) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        let bucket = uri_encode(&self.bucket, false);
        match key {
            Some(key) => format!("{base}/{bucket}/{}", uri_encode(key, true)),
            None => format!("{base}/{bucket}"),
        }
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body: Bytes,
    ) -> BackendResult<reqwest::Response> {
        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            hex_sha256(&body)
        };
        let host = self.host();

        let mut url = self.endpoint.clone();
        url.set_path(path);
        url.set_query(if query.is_empty() { None } else { Some(query) });

        let signed = self.signer.sign(
            &SigningRequest {
                method: method.as_str(),
                host: &host,
                path,
                query,
                headers: &[],
                payload_hash: &payload_hash,
            },
            chrono::Utc::now(),
        );

        let mut request = self
            .client
            .request(method, url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", signed.authorization);
        if !body.is_empty() {
            request = request
                .header("content-type", "binary/octet-stream")
                .body(body);
        }

        request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))
    }
}

/// Turn a non-success response into a transport error
async fn status_error(what: &str, response: reqwest::Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    BackendError::Transport(format!("{what} returned status {status}: {body}"))
}

#[async_trait]
impl DurableBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        let response = self
            .send(Method::HEAD, &self.path_for(Some(key)), "", Bytes::new())
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error("HEAD", response).await),
        }
    }

    async fn get(&self, key: &str) -> BackendResult<Bytes> {
        let response = self
            .send(Method::GET, &self.path_for(Some(key)), "", Bytes::new())
            .await?;
        match response.status() {
            s if s.is_success() => response
                .bytes()
                .await
                .map_err(|e| BackendError::Transport(e.to_string())),
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            _ => Err(status_error("GET", response).await),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        let response = self
            .send(Method::PUT, &self.path_for(Some(key)), "", data)
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error("PUT", response).await)
        }
    }

    async fn list_all(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let path = self.path_for(None);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut params = vec![
                ("list-type", "2"),
                ("max-keys", LIST_PAGE_SIZE),
                ("prefix", prefix),
            ];
            if let Some(token) = token.as_deref() {
                params.push(("continuation-token", token));
            }
            let query = canonical_query(&params);

            let response = self.send(Method::GET, &path, &query, Bytes::new()).await?;
            if !response.status().is_success() {
                return Err(status_error("LIST", response).await);
            }
            let text = response
                .text()
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            let page = parse_list_page(&text)?;

            debug!(
                "Listed {} keys (total {})",
                page.contents.len(),
                keys.len() + page.contents.len()
            );
            keys.extend(page.contents.into_iter().map(|entry| entry.key));

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(next)) => token = Some(next),
                _ => break,
            }
        }

        Ok(keys)
    }
}

/// One page of a ListObjectsV2 response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPage {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

fn parse_list_page(text: &str) -> BackendResult<ListPage> {
    quick_xml::de::from_str(text)
        .map_err(|e| BackendError::Transport(format!("malformed list response: {e}")))
}
