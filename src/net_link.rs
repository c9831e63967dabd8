//! Client link to the relay: framing, reconnection and the event channel the
//! controller consumes.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::protocol::{AudioEnvelope, ClientMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum NetEvent {
    Text(String),
    Binary(Bytes),
    Connected,
    Disconnected { clean: bool },
    Reconnecting { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
    Failed,
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Exponential backoff: `min(base * 2^attempt, cap)`, at most `max_attempts`
/// tries per outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base: config.reconnect_base(),
            cap: config.reconnect_cap(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

pub fn relay_url(config: &ClientConfig) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&config.relay_url)?;
    if !config.token.is_empty() {
        url.query_pairs_mut().append_pair(&config.token_param, &config.token);
    }
    Ok(url)
}

/// Handle held by the application; the socket itself lives in a background
/// `NetLink` task.
pub struct AgentLink {
    cmd_tx: mpsc::Sender<NetCommand>,
    state_rx: watch::Receiver<LinkState>,
    task: Option<JoinHandle<()>>,
}

impl AgentLink {
    /// Resolves once the transport is open. Connecting is the session start;
    /// no handshake message is sent.
    pub async fn connect(config: &ClientConfig) -> Result<(Self, mpsc::Receiver<NetEvent>), LinkError> {
        let url = relay_url(config)?;
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        info!("Connecting to {}...", config.relay_url);
        let (ws, _) = connect_async(url.as_str()).await?;
        info!("Connected!");

        let (event_tx, event_rx) = mpsc::channel::<NetEvent>(256);
        let (cmd_tx, cmd_rx) = mpsc::channel::<NetCommand>(256);

        state_tx.send_replace(LinkState::Connected);
        let _ = event_tx.send(NetEvent::Connected).await;

        let link = NetLink {
            url,
            policy: ReconnectPolicy::from_config(config),
            attempts: 0,
            event_tx,
            cmd_rx,
            state_tx,
        };
        let task = tokio::spawn(link.run(ws));

        Ok((
            Self {
                cmd_tx,
                state_rx,
                task: Some(task),
            },
            event_rx,
        ))
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Sends one PCM16 frame wrapped in the JSON audio envelope. Rejected
    /// while the link is not connected.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let json = serde_json::to_string(&AudioEnvelope::from_pcm(pcm))?;
        self.send(NetCommand::SendText(json)).await
    }

    pub async fn send_message(&self, msg: &ClientMessage) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let json = serde_json::to_string(msg)?;
        self.send(NetCommand::SendText(json)).await
    }

    /// Clean close. Cancels any pending reconnect and resets the attempt
    /// counter.
    pub async fn disconnect(&mut self) {
        info!("Disconnecting...");
        let _ = self.cmd_tx.send(NetCommand::Close).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        match self.state() {
            LinkState::Connected => Ok(()),
            state => {
                debug!("Rejecting send in state {:?}", state);
                Err(LinkError::NotConnected)
            }
        }
    }

    async fn send(&self, cmd: NetCommand) -> Result<(), LinkError> {
        self.cmd_tx.send(cmd).await.map_err(|_| LinkError::NotConnected)
    }
}

enum Closed {
    /// Closed by us, or the application dropped its side.
    Local,
    /// The far end completed the close handshake.
    Clean,
    Unclean(String),
}

enum Reconnect {
    Connected(WsStream),
    Cancelled,
    Exhausted,
}

struct NetLink {
    url: Url,
    policy: ReconnectPolicy,
    attempts: u32,
    event_tx: mpsc::Sender<NetEvent>,
    cmd_rx: mpsc::Receiver<NetCommand>,
    state_tx: watch::Sender<LinkState>,
}

impl NetLink {
    // 只有非正常断开才会触发重连，指数退避
    async fn run(mut self, mut ws: WsStream) {
        loop {
            match self.pump(ws).await {
                Closed::Local | Closed::Clean => {
                    self.finish_disconnected(true).await;
                    return;
                }
                Closed::Unclean(reason) => {
                    warn!("Connection dropped: {}", reason);
                    let _ = self.event_tx.send(NetEvent::Disconnected { clean: false }).await;
                    match self.reconnect().await {
                        Reconnect::Connected(new_ws) => ws = new_ws,
                        Reconnect::Cancelled => {
                            self.finish_disconnected(true).await;
                            return;
                        }
                        Reconnect::Exhausted => {
                            let attempts = self.attempts;
                            warn!("Max reconnect attempts reached ({})", attempts);
                            self.state_tx.send_replace(LinkState::Failed);
                            let _ = self.event_tx.send(NetEvent::Failed { attempts }).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn finish_disconnected(&mut self, clean: bool) {
        self.attempts = 0;
        self.state_tx.send_replace(LinkState::Disconnected);
        let _ = self.event_tx.send(NetEvent::Disconnected { clean }).await;
    }

    // 主循环，处理读取和写入
    async fn pump(&mut self, ws: WsStream) -> Closed {
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                msg = read.next() => {
                    let event = match msg {
                        Some(Ok(Message::Text(text))) => NetEvent::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(data))) => NetEvent::Binary(data),
                        Some(Ok(Message::Close(frame))) => {
                            info!("Server closed connection: {:?}", frame);
                            let _ = write.close().await;
                            return Closed::Clean;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Closed::Unclean(e.to_string()),
                        None => return Closed::Unclean("stream ended without close handshake".to_string()),
                    };
                    if self.event_tx.send(event).await.is_err() {
                        let _ = write.close().await;
                        return Closed::Local;
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    let result = match cmd {
                        Some(NetCommand::SendText(text)) => write.send(Message::Text(text.into())).await,
                        Some(NetCommand::Close) | None => {
                            let _ = write.close().await;
                            return Closed::Local;
                        }
                    };
                    if let Err(e) = result {
                        return Closed::Unclean(e.to_string());
                    }
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Reconnect {
        while self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay(self.attempts);
            self.attempts += 1;
            let attempt = self.attempts;

            self.state_tx.send_replace(LinkState::Reconnecting { attempt });
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, self.policy.max_attempts
            );
            let _ = self.event_tx.send(NetEvent::Reconnecting { attempt, delay }).await;

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.cmd_rx.recv() => {
                        if is_cancel(cmd) {
                            return Reconnect::Cancelled;
                        }
                    }
                }
            }

            let connect = connect_async(self.url.as_str());
            tokio::pin!(connect);
            let result = loop {
                tokio::select! {
                    res = &mut connect => break res,
                    cmd = self.cmd_rx.recv() => {
                        if is_cancel(cmd) {
                            return Reconnect::Cancelled;
                        }
                    }
                }
            };

            match result {
                Ok((ws, _)) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    self.attempts = 0;
                    self.state_tx.send_replace(LinkState::Connected);
                    let _ = self.event_tx.send(NetEvent::Connected).await;
                    return Reconnect::Connected(ws);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        Reconnect::Exhausted
    }
}

/// While reconnecting only `Close` matters; outbound data is dropped.
fn is_cancel(cmd: Option<NetCommand>) -> bool {
    match cmd {
        Some(NetCommand::Close) | None => true,
        Some(_) => {
            debug!("Dropping outbound message while reconnecting");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30000),
            max_attempts: 3,
        }
    }

    #[test]
    fn delay_doubles_until_cap() {
        let p = policy();
        let delays: Vec<u64> = (0..7).map(|n| p.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn delay_saturates_for_huge_attempts() {
        assert_eq!(policy().delay(64), Duration::from_millis(30000));
    }

    #[test]
    fn token_goes_into_query() {
        let config = ClientConfig {
            relay_url: "ws://relay.local/ws/agent".into(),
            token: "a b&c".into(),
            token_param: "access_token".into(),
            reconnect_base_ms: 10,
            reconnect_cap_ms: 100,
            max_reconnect_attempts: 3,
        };
        let url = relay_url(&config).unwrap();
        let token: Vec<_> = url.query_pairs().filter(|(k, _)| k == "access_token").collect();
        assert_eq!(token.len(), 1);
        assert_eq!(token[0].1, "a b&c");

        let anonymous = ClientConfig { token: String::new(), ..config };
        assert_eq!(relay_url(&anonymous).unwrap().query(), None);
    }
}
