use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};
use tracing::{debug, info, warn};

use super::session::{Action, Frame, RelaySession};
use crate::config::RelayConfig;
use crate::identity::{Identity, IdentityVerifier};
use crate::protocol::ContextMessage;

type AgentStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepts browser connections and pairs each with its own agent connection.
pub struct RelayServer {
    config: RelayConfig,
    verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl RelayServer {
    /// Without a verifier every session is anonymous.
    pub fn new(config: RelayConfig, verifier: Option<Arc<dyn IdentityVerifier>>) -> Self {
        Self { config, verifier }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind relay on {}", self.config.listen_addr))?;
        self.run(listener).await
    }

    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Relay listening on {} (path {}, agent {})",
            listener.local_addr()?,
            self.config.path,
            self.config.agent_url
        );
        let server = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = server.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut token = None;
        let path = self.config.path.as_str();
        let token_param = self.config.token_param.as_str();
        let callback = |req: &Request, resp: Response| {
            if req.uri().path() != path {
                return Err(not_found());
            }
            token = extract_token(req, token_param);
            Ok(resp)
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let identity = self.resolve_identity(token.as_deref()).await;
        let context = identity.as_ref().and_then(context_frame);
        match &identity {
            Some(id) => info!("Client {} connected as {} ({})", peer, id.display_name, id.id),
            None => info!("Client {} connected anonymously", peer),
        }

        relay_connection(ws, &self.config.agent_url, context).await;
        info!("Client {} session finished", peer);
    }

    /// Verification failures and timeouts degrade to an anonymous session.
    async fn resolve_identity(&self, token: Option<&str>) -> Option<Identity> {
        let token = token?;
        let verifier = self.verifier.as_ref()?;
        let limit = self.config.verify_timeout();
        match tokio::time::timeout(limit, verifier.verify(token)).await {
            Ok(Ok(identity)) => Some(identity),
            Ok(Err(e)) => {
                warn!("Identity verification failed, continuing anonymously: {}", e);
                None
            }
            Err(_) => {
                warn!("Identity verification timed out after {:?}, continuing anonymously", limit);
                None
            }
        }
    }
}

/// Drives one session until either leg closes.
pub async fn relay_connection<S>(client: WebSocketStream<S>, agent_url: &str, context: Option<Frame>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = RelaySession::new(context);
    let sid = session.id();
    let (mut client_tx, mut client_rx) = client.split();

    let connect = connect_async(agent_url.to_string());
    tokio::pin!(connect);
    let mut connecting = true;
    let mut agent_tx: Option<SplitSink<AgentStream, Message>> = None;
    let mut agent_rx: Option<SplitStream<AgentStream>> = None;

    debug!("[{}] awaiting agent leg {}", sid, agent_url);

    while !session.is_closed() {
        let actions = tokio::select! {
            res = &mut connect, if connecting => {
                connecting = false;
                match res {
                    Ok((ws, _)) => {
                        let (tx, rx) = ws.split();
                        agent_tx = Some(tx);
                        agent_rx = Some(rx);
                        let queued = session.pending_len();
                        info!("[{}] agent leg ready, flushing {} queued messages", sid, queued);
                        session.on_downstream_ready()
                    }
                    Err(e) => {
                        warn!("[{}] agent connect failed: {}", sid, e);
                        session.on_agent_error()
                    }
                }
            }
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => session.on_client_frame(Frame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => session.on_client_frame(Frame::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] client closed: {:?}", sid, frame);
                    session.on_client_closed()
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    debug!("[{}] client leg error: {}", sid, e);
                    session.on_client_closed()
                }
                None => session.on_client_closed(),
            },
            msg = next_agent_message(&mut agent_rx) => match msg {
                Some(Ok(Message::Text(text))) => session.on_agent_frame(Frame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => session.on_agent_frame(Frame::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] agent closed: {:?}", sid, frame);
                    session.on_agent_closed(frame.map(|f| u16::from(f.code)))
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    warn!("[{}] agent leg error: {}", sid, e);
                    session.on_agent_error()
                }
                None => session.on_agent_error(),
            },
        };

        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::ToAgent(frame) => {
                    if let Some(tx) = agent_tx.as_mut() {
                        if let Err(e) = tx.send(into_message(frame)).await {
                            warn!("[{}] send to agent failed: {}", sid, e);
                            queue.extend(session.on_agent_error());
                        }
                    }
                }
                Action::ToClient(frame) => {
                    if let Err(e) = client_tx.send(into_message(frame)).await {
                        debug!("[{}] send to client failed: {}", sid, e);
                        queue.extend(session.on_client_closed());
                    }
                }
                Action::CloseAgent => {
                    connecting = false;
                    if let Some(tx) = agent_tx.as_mut() {
                        let _ = tx.close().await;
                    }
                }
                Action::CloseClient(code) => {
                    info!("[{}] closing client leg with code {}", sid, code);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: String::new().into(),
                    };
                    let _ = client_tx.send(Message::Close(Some(frame))).await;
                }
            }
        }
    }

    // 已关闭的一侧再次关闭不会出错，只是刷新握手
    let _ = client_tx.close().await;
    if let Some(mut tx) = agent_tx {
        let _ = tx.close().await;
    }
    debug!("[{}] session closed", sid);
}

async fn next_agent_message(
    rx: &mut Option<SplitStream<AgentStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match rx {
        Some(rx) => rx.next().await,
        None => std::future::pending().await,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
    }
}

fn context_frame(identity: &Identity) -> Option<Frame> {
    match serde_json::to_string(&ContextMessage::for_identity(identity, Utc::now())) {
        Ok(json) => Some(Frame::Text(json)),
        Err(e) => {
            warn!("Failed to encode context message: {}", e);
            None
        }
    }
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("unknown path".to_string()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// Token from the query parameter, else from an `Authorization: Bearer` header.
pub fn extract_token(req: &Request, param: &str) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == param)
            .map(|(_, value)| value.into_owned())
    });

    from_query
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_from_query() {
        let req = request("/ws/agent?token=abc%2B1&x=y", None);
        assert_eq!(extract_token(&req, "token").as_deref(), Some("abc+1"));
    }

    #[test]
    fn query_wins_over_header() {
        let req = request("/ws/agent?token=q", Some("Bearer h"));
        assert_eq!(extract_token(&req, "token").as_deref(), Some("q"));
    }

    #[test]
    fn token_from_bearer_header() {
        let req = request("/ws/agent", Some("Bearer h1"));
        assert_eq!(extract_token(&req, "token").as_deref(), Some("h1"));
        let req = request("/ws/agent?token=", Some("Bearer h2"));
        assert_eq!(extract_token(&req, "token").as_deref(), Some("h2"));
    }

    #[test]
    fn no_token_is_anonymous() {
        assert_eq!(extract_token(&request("/ws/agent", None), "token"), None);
        assert_eq!(extract_token(&request("/ws/agent", Some("Basic x")), "token"), None);
    }
}
