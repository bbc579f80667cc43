use crate::config::NetworkConfig;
use crate::protocol::ClientMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

pub const PROTOCOL_VERSION: u8 = 1;
const MAX_RETRY_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Text(String),
    Binary(Vec<u8>),
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetCommand {
    SendText(String),
}

pub struct NetLink {
    config: NetworkConfig,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
}

/// Exponential back-off, capped at one minute.
pub fn next_retry_delay(current: u64) -> u64 {
    std::cmp::min(current.saturating_mul(2), MAX_RETRY_DELAY_SECS)
}

impl NetLink {
    pub fn new(config: NetworkConfig, tx: mpsc::Sender<NetEvent>, rx_cmd: mpsc::Receiver<NetCommand>) -> Self {
        Self { config, tx, rx_cmd }
    }

    /// Runs until the command channel closes, reconnecting on every error.
    pub async fn run(mut self) {
        let mut retry_delay = 1;
        loop {
            match self.connect_and_loop().await {
                Ok(()) => {
                    log::info!("NetLink shutting down");
                    break;
                }
                Err(e) => {
                    log::warn!("Connection error: {}. Retrying in {}s...", e, retry_delay);
                    if self.tx.send(NetEvent::Disconnected).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay)).await;
                    retry_delay = next_retry_delay(retry_delay);
                }
            }
        }
    }

    fn build_request(&self) -> anyhow::Result<tokio_tungstenite::tungstenite::http::Request<()>> {
        let url = Url::parse(&self.config.ws_url)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("ws_url has no host: {}", self.config.ws_url),
        };

        let mut builder = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.config.ws_url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Client-Id", &self.config.client_id)
            .header("Protocol-Version", PROTOCOL_VERSION.to_string());
        if !self.config.ws_token.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.ws_token));
        }
        Ok(builder.body(())?)
    }

    async fn connect_and_loop(&mut self) -> anyhow::Result<()> {
        let request = self.build_request()?;

        log::info!("Connecting to {}...", self.config.ws_url);
        let (ws_stream, _) = connect_async(request).await?;
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        self.tx.send(NetEvent::Connected).await?;

        if self.config.send_hello {
            let hello = ClientMessage::Hello {
                client_id: self.config.client_id.clone(),
                version: PROTOCOL_VERSION,
            }
            .to_json()?;
            log::debug!("Sending Hello: {}", hello);
            write.send(Message::Text(hello.into())).await?;
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            log::trace!("Received Text: {}", text);
                            self.tx.send(NetEvent::Text(text.to_string())).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.tx.send(NetEvent::Binary(data.to_vec())).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            return Err(anyhow::anyhow!("Connection closed"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(anyhow::anyhow!("Connection closed")),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendText(text)) => {
                            log::debug!("Sending Text: {}", text);
                            write.send(Message::Text(text.into())).await?;
                        }
                        // controller gone: clean exit
                        None => break,
                    }
                }
            }
        }
        let _ = write.send(Message::Close(None)).await;
        Ok(())
    }
}
