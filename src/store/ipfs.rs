//! IPFS Kubo HTTP API client
//!
//! `POST {endpoint}/add` with a multipart `file` part; the reply is JSON with
//! the CID under `Hash`.

use super::{gateway_url, ContentId, ContentStore, StoreError, StoreFuture};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Longest response body echoed into an error
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Extract the CID from an `/add` response body. Kubo can stream one JSON
/// object per line; the last one describes the top-level object.
pub fn parse_add_response(body: &str) -> Result<ContentId, StoreError> {
    let line = body
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| StoreError::MalformedResponse("empty body".to_string()))?;

    let parsed: AddResponse = serde_json::from_str(line)
        .map_err(|e| StoreError::MalformedResponse(format!("{}: {}", e, truncate(line))))?;

    if parsed.hash.trim().is_empty() {
        return Err(StoreError::MalformedResponse("empty Hash".to_string()));
    }
    Ok(ContentId::new(parsed.hash))
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Clone)]
pub struct IpfsHttpStore {
    client: reqwest::Client,
    endpoint: String,
    gateway: String,
    timeout: Duration,
}

impl IpfsHttpStore {
    /// `endpoint` is the API base, e.g. `http://127.0.0.1:5001/api/v0`
    pub fn new(
        endpoint: impl Into<String>,
        gateway: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Http(e.to_string()))?;

        Ok(IpfsHttpStore {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            gateway: gateway.into(),
            timeout,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(self.timeout)
        } else if e.is_connect() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Http(e.to_string())
        }
    }
}

impl ContentStore for IpfsHttpStore {
    fn add<'a>(&'a self, name: &'a str, data: Bytes) -> StoreFuture<'a, ContentId> {
        Box::pin(async move {
            let url = format!("{}/add", self.endpoint);
            let size = data.len();
            let part = Part::bytes(data.to_vec())
                .file_name(name.to_string())
                .mime_str("application/octet-stream")
                .map_err(|e| StoreError::Http(e.to_string()))?;
            let form = Form::new().part("file", part);

            let response = self
                .client
                .post(&url)
                .multipart(form)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;

            let status = response.status();
            let body = response.text().await.map_err(|e| self.map_error(e))?;
            if !status.is_success() {
                return Err(StoreError::Status {
                    code: status.as_u16(),
                    body: truncate(&body).to_string(),
                });
            }

            let cid = parse_add_response(&body)?;
            debug!(url = %url, bytes = size, cid = %cid, "IPFS add complete");
            Ok(cid)
        })
    }

    fn access_url(&self, cid: &ContentId) -> String {
        gateway_url(&self.gateway, cid)
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}
