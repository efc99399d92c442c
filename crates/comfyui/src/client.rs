//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket URL for one ComfyUI server.
//! Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`] scoped by a client id.

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Default bound on the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The raw WebSocket stream type produced by [`ComfyUIClient::connect`].
pub type ComfyUIStream =
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI instance's event stream.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    connect_timeout: Duration,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake. ComfyUI addresses
    /// execution events for prompts submitted with this id to this socket.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Generate a fresh client id (UUID v4).
    pub fn new_client_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// `client_id` is appended as a query parameter so that ComfyUI can
    /// address messages back to this specific client.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                ComfyUIClientError::Connection(format!(
                    "Timed out after {}s connecting to ComfyUI at {}",
                    self.connect_timeout.as_secs(),
                    self.ws_url
                ))
            })?
            .map_err(|e| {
                ComfyUIClientError::Connection(format!(
                    "Failed to connect to ComfyUI at {}: {e}",
                    self.ws_url
                ))
            })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(ComfyUIClient::new_client_id(), ComfyUIClient::new_client_id());
    }

    #[test]
    fn ws_url_trailing_slash_trimmed() {
        let client = ComfyUIClient::new("ws://127.0.0.1:8188/".into());
        assert_eq!(client.ws_url(), "ws://127.0.0.1:8188");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let client = ComfyUIClient::new("ws://127.0.0.1:1".into())
            .with_connect_timeout(Duration::from_secs(2));
        let result = client.connect("test-client").await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
