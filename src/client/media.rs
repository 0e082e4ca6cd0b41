//! Media upload and download through the configured blob transport.

use super::{server_jid, Client};
use crate::binary::Node;
use crate::error::Error;
use crate::media::{self, BlobTransport, MediaConn, MediaReference, MediaType};
use crate::Result;
use std::sync::Arc;
use tracing::debug;

impl Client {
    fn blob_transport(&self) -> Result<Arc<dyn BlobTransport>> {
        self.inner.blobs.clone().ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no blob transport configured; enable the `full` feature or supply one"
            ))
        })
    }

    /// Upload hosts and auth token, cached until the server-given TTL runs out.
    pub async fn media_conn(&self) -> Result<MediaConn> {
        let mut cached = self.inner.media_conn.lock().await;
        if let Some(conn) = cached.as_ref().filter(|c| !c.is_expired()) {
            return Ok(conn.clone());
        }
        let resp = self
            .query_idempotent("w:m", "set", &server_jid(), vec![Node::new("media_conn")])
            .await?;
        let mut conn = MediaConn::from_node(&resp)?;
        if let Some(host) = &self.inner.config.media_host_override {
            conn.hosts = vec![host.clone()];
        }
        debug!(hosts = conn.hosts.len(), ttl_secs = conn.ttl.as_secs(), "refreshed media_conn");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Encrypt and upload a blob. The returned reference is what a peer needs to download it.
    pub async fn upload(&self, plaintext: &[u8], media_type: MediaType, mimetype: &str) -> Result<MediaReference> {
        let transport = self.blob_transport()?;
        let conn = self.media_conn().await?;
        media::upload(transport.as_ref(), &conn, plaintext, media_type, mimetype).await
    }

    /// Download and verify a blob. Never returns bytes that failed an integrity check.
    pub async fn download(&self, reference: &MediaReference) -> Result<Vec<u8>> {
        let transport = self.blob_transport()?;
        let hosts = match &self.inner.config.media_host_override {
            Some(host) => vec![host.clone()],
            None => self
                .inner
                .media_conn
                .lock()
                .await
                .as_ref()
                .map(|c| c.hosts.clone())
                .unwrap_or_default(),
        };
        media::download(transport.as_ref(), &hosts, reference).await
    }

    /// Download from raw message fields instead of a stored reference.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_media_with_path(
        &self,
        direct_path: &str,
        enc_file_hash: &[u8],
        file_hash: &[u8],
        media_key: &[u8],
        file_length: u64,
        media_type: MediaType,
        mimetype: &str,
    ) -> Result<Vec<u8>> {
        let reference = media::reference_from_parts(
            direct_path,
            enc_file_hash,
            file_hash,
            media_key,
            file_length,
            media_type,
            mimetype,
        );
        self.download(&reference).await
    }
}
