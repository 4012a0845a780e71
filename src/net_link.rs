//! WebSocket transport for the realtime session.
//!
//! Sends the setup message on the raw stream and waits for `setupComplete`
//! before handing the stream out. The server may send JSON in Text or Binary
//! frames; both are parsed the same way.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::TransportError;
use crate::mode_config::SessionSetup;
use crate::protocol::{ClientMessage, ServerMessage, SetupPayload};
use crate::session::{Connector, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnector {
    ws_url: String,
    api_key: String,
    model: String,
}

impl WsConnector {
    pub fn new(
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, TransportError> {
        let url = Url::parse(&self.ws_url)
            .map_err(|e| TransportError::Connect(format!("invalid url {}: {}", self.ws_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::Connect(format!("no host in {}", self.ws_url)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.ws_url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            );
        if !self.api_key.is_empty() {
            builder = builder.header("x-goog-api-key", self.api_key.as_str());
        }
        builder
            .body(())
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<Box<dyn Transport>, TransportError> {
        let request = self.build_request()?;

        log::info!("Connecting to {}...", self.ws_url);
        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("Connected!");

        let setup_json = ClientMessage::Setup(SetupPayload::new(&self.model, setup))
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        log::debug!("Sending setup: {}", setup_json);
        ws.send(Message::Text(setup_json.into()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        wait_for_setup_complete(&mut ws).await?;
        log::info!("Setup complete");

        Ok(Box::new(WsTransport { ws }))
    }
}

async fn wait_for_setup_complete(ws: &mut WsStream) -> Result<(), TransportError> {
    loop {
        let parsed = match ws.next().await {
            Some(Ok(Message::Text(text))) => ServerMessage::parse(text.as_str()),
            Some(Ok(Message::Binary(data))) => ServerMessage::parse_bytes(&data),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_else(|| "no close frame".to_string());
                return Err(TransportError::Handshake(format!(
                    "closed before setup completed: {}",
                    reason
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
            None => {
                return Err(TransportError::Handshake(
                    "stream ended before setup completed".into(),
                ));
            }
        };

        match parsed {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(msg) => {
                if let Some(err) = msg.error {
                    return Err(TransportError::Handshake(
                        err.message.unwrap_or_else(|| "server error".into()),
                    ));
                }
                log::debug!("Ignoring pre-setup message");
            }
            Err(e) => log::warn!("Unparseable frame during setup: {}", e),
        }
    }
}

pub struct WsTransport {
    ws: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), TransportError> {
        let text = msg
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, TransportError>> {
        loop {
            let parsed = match self.ws.next().await? {
                Ok(Message::Text(text)) => ServerMessage::parse(text.as_str()),
                Ok(Message::Binary(data)) => ServerMessage::parse_bytes(&data),
                Ok(Message::Close(frame)) => {
                    log::info!("Server closed connection: {:?}", frame);
                    return match frame {
                        Some(f) if f.code != CloseCode::Normal => Some(Err(
                            TransportError::ClosedByServer(format!(
                                "{} {}",
                                u16::from(f.code),
                                f.reason.as_str()
                            )),
                        )),
                        _ => None,
                    };
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };

            match parsed {
                Ok(msg) => return Some(Ok(msg)),
                // A malformed frame is dropped; the session goes on
                Err(e) => log::warn!("Dropping unparseable server frame: {}", e),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("WebSocket close: {}", e);
        }
    }
}
