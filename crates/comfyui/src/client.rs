//! Opening the ComfyUI push channel.
//!
//! [`ComfyUIClient`] is only an address plus a client id;
//! [`ComfyUIClient::connect`] performs one handshake and hands back the
//! socket. Retrying is the listener's business.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw WebSocket stream to ComfyUI.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI push channel.
///
/// The client id is fixed for the lifetime of the handle: every
/// reconnect reuses it, and every submission must carry it, so that
/// ComfyUI keeps routing this process's prompt events to the socket.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// One open push-channel socket.
pub struct ComfyUIConnection {
    pub client_id: String,
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String, client_id: String) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
            client_id,
        }
    }

    /// Client with a fresh random client id.
    pub fn with_random_id(ws_url: String) -> Self {
        Self::new(ws_url, uuid::Uuid::new_v4().to_string())
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the ComfyUI WebSocket endpoint at `/ws?clientId=<id>`.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!("{}: {e}", self.ws_url))
        })?;

        tracing::info!(client_id = %self.client_id, ws_url = %self.ws_url, "Push channel open");

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Handshake failed (refused, DNS, TLS, HTTP upgrade).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket broke after the handshake.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
