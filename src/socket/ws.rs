//! WebSocket client connection (requires `full` feature).

use crate::error::{ConnectionError, Error};
use crate::transport::{Connector, FrameSource, Transport};
use crate::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tracing::debug;

use super::framed::{FramedRecv, FramedSend};

/// Dials WhatsApp's websocket endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn dial(&self, url: &str) -> Result<(Arc<dyn Transport>, Box<dyn FrameSource>)> {
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| Error::Connection(ConnectionError::WebSocket(e.to_string())))?;
        debug!(%url, status = %response.status(), "websocket connected");
        let (write_half, read_half) = ws_stream.split();
        Ok((
            Arc::new(FramedSend::new(write_half)),
            Box::new(FramedRecv::new(read_half)),
        ))
    }
}
