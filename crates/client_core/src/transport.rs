use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};

use crate::{
    channel::{Connection, Connector},
    error::ChannelError,
    session::Credential,
};

/// WebSocket transport for the event channel. Each text frame carries one
/// `{"event", "data"}` envelope.
pub struct WsConnector {
    ws_url: String,
}

impl WsConnector {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    /// `http(s)://host` becomes `ws(s)://host/ws`.
    pub fn from_server_url(server_url: &str) -> Result<Self, ChannelError> {
        let server_url = server_url.trim_end_matches('/');
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ChannelError::Transport(
                "server_url must start with http:// or https://".into(),
            ));
        };
        Ok(Self::new(format!("{ws_url}/ws")))
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, credential: &Credential) -> Result<Connection, ChannelError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        let bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| ChannelError::Rejected("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request).await.map_err(map_handshake_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("ws: send failed: {err}");
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("ws: receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("ws: reader finished");
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                ChannelError::Rejected(format!("handshake refused with {status}"))
            } else {
                ChannelError::Transport(format!("handshake failed with {status}"))
            }
        }
        other => ChannelError::Transport(other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
