use crate::config::GuiConfig;
use crate::protocol::ActivityState;
use crate::transcript::TranscriptEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// What the GUI process asks the core to do.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserAction {
    UserText { text: String },
    Interrupt,
    Page { page: u32 },
}

impl UserAction {
    pub fn parse(msg: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(msg)
    }
}

/// What the core reports to the GUI process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiSignal {
    Connection { connected: bool },
    Session { session_id: String, server_instance_id: String },
    Turn { turn: u64 },
    Activity { state: ActivityState },
    Transcript { entry: TranscriptEntry },
    Playing { playing: bool },
    Mouth { level: f32 },
    Error { msg: String, turn_id: Option<u64> },
    Trace { line: String },
}

impl UiSignal {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<UserAction>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &GuiConfig, tx: mpsc::Sender<UserAction>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("0.0.0.0:{}", config.local_port)).await?;
        let target_addr = format!("{}:{}", config.remote_ip, config.remote_port);
        log::info!(
            "GuiBridge listening on {}, sending to {}",
            config.local_port,
            target_addr
        );

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                log::warn!("GUI sent {} bytes of non-UTF-8", len);
                continue;
            };
            match UserAction::parse(msg) {
                Ok(action) => {
                    if let Err(e) = self.tx.send(action).await {
                        log::error!("Failed to forward GUI action: {}", e);
                        break;
                    }
                }
                Err(e) => log::warn!("Ignoring GUI message {}: {}", msg, e),
            }
        }
        Ok(())
    }

    pub async fn send_signal(&self, signal: &UiSignal) -> anyhow::Result<()> {
        let json = signal.to_json()?;
        self.socket.send_to(json.as_bytes(), &self.target_addr).await?;
        Ok(())
    }
}
