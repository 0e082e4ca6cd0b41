use crate::error::{ConnectionError, Error};
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Media host response to an upload.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub url: String,
    pub direct_path: String,
}

/// Moves encrypted blobs to and from media hosts.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    async fn put(&self, url: &str, data: Vec<u8>) -> Result<UploadResponse>;
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

fn http_err(e: impl std::fmt::Display) -> Error {
    Error::Connection(ConnectionError::Http(e.to_string()))
}

/// Path of a media URL without scheme, host or query.
fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let path = rest.find('/').map_or("/", |i| &rest[i..]);
    path.split_once('?').map_or(path, |(p, _)| p)
}

/// In-process blob host keyed by direct path.
#[derive(Default)]
pub struct MemoryBlobTransport {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modify a stored blob in place. Returns false if the path is unknown.
    pub fn tamper(&self, direct_path: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let Ok(mut blobs) = self.blobs.write() else {
            return false;
        };
        match blobs.get_mut(direct_path) {
            Some(data) => {
                f(data);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobTransport for MemoryBlobTransport {
    async fn put(&self, url: &str, data: Vec<u8>) -> Result<UploadResponse> {
        let token = url_path(url).rsplit('/').next().unwrap_or_default();
        let direct_path = format!("/v/t62.7118-24/{}", token.trim_end_matches('='));
        self.blobs
            .write()
            .map_err(|_| http_err("blob map poisoned"))?
            .insert(direct_path.clone(), data);
        Ok(UploadResponse {
            url: format!("https://mmg.whatsapp.net{}", direct_path),
            direct_path,
        })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .map_err(|_| http_err("blob map poisoned"))?
            .get(url_path(url))
            .cloned()
            .ok_or_else(|| http_err(format!("404 for {}", url_path(url))))
    }
}

/// HTTPS media hosts.
#[cfg(feature = "full")]
pub struct HttpBlobTransport {
    client: reqwest::Client,
}

#[cfg(feature = "full")]
impl HttpBlobTransport {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(http_err)?;
        Ok(Self { client })
    }
}

#[cfg(feature = "full")]
#[async_trait]
impl BlobTransport for HttpBlobTransport {
    async fn put(&self, url: &str, data: Vec<u8>) -> Result<UploadResponse> {
        let resp = self
            .client
            .post(url)
            .header("Origin", "https://web.whatsapp.com")
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        resp.json::<UploadResponse>().await.map_err(http_err)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .header("Origin", "https://web.whatsapp.com")
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(resp.bytes().await.map_err(http_err)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_extraction() {
        assert_eq!(url_path("https://mmg.test/mms/image/abc?auth=x"), "/mms/image/abc");
        assert_eq!(url_path("https://mmg.test"), "/");
        assert_eq!(url_path("/v/t62/x"), "/v/t62/x");
    }

    #[tokio::test]
    async fn memory_put_get() {
        let blobs = MemoryBlobTransport::new();
        let resp = blobs
            .put("https://h/mms/image/tok==?auth=a&token=tok==", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(resp.direct_path, "/v/t62.7118-24/tok");
        assert_eq!(blobs.get(&resp.url).await.unwrap(), vec![1, 2, 3]);
        assert!(blobs.get("https://h/v/missing").await.is_err());
        assert_eq!(blobs.len(), 1);
    }
}
