//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info};

use tandem_core::{IdentityKey, SignalConfig};

use crate::error::SignalError;
use crate::hub::{Hub, HubSettings, Session};
use crate::identity::{ConnectionMeta, IdentityResolver};
use crate::messages::Outbound;

/// Request lines answered as plain HTTP
const MONITOR_PATHS: [&[u8]; 2] = [b"GET /health", b"GET /stats"];
const MONITOR_PEEK_TIMEOUT: Duration = Duration::from_secs(2);
const MONITOR_PEEK_RETRY: Duration = Duration::from_millis(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Signal server state
pub struct SignalServer {
    hub: Arc<Hub>,
    resolver: Arc<IdentityResolver>,
    started: Instant,
}

impl SignalServer {
    /// Build a server from configuration, with a fresh identity key
    pub fn new(config: &SignalConfig) -> Result<Self, SignalError> {
        config.validate()?;
        let rtc_config = config.load_rtc_config()?;
        let key = IdentityKey::try_generate()?;
        Ok(Self::with_parts(
            Hub::new(HubSettings::from_config(config, rtc_config)),
            IdentityResolver::new(key, config),
        ))
    }

    pub fn with_parts(hub: Arc<Hub>, resolver: IdentityResolver) -> Self {
        Self {
            hub,
            resolver: Arc::new(resolver),
            started: Instant::now(),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Bind and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), SignalError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), SignalError> {
        loop {
            let (stream, remote) = listener.accept().await?;
            let hub = self.hub.clone();
            let resolver = self.resolver.clone();
            let started = self.started;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, remote, hub, resolver, started).await {
                    debug!("Connection error from {}: {}", remote, e);
                }
            });
        }
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.hub.room_count()
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.hub.peer_count()
    }
}

/// Handle a single connection (HTTP probe or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    hub: Arc<Hub>,
    resolver: Arc<IdentityResolver>,
    started: Instant,
) -> Result<(), SignalError> {
    if is_monitoring_request(&stream).await? {
        return handle_http_request(&mut stream, &hub, started).await;
    }

    let meta_cell = Arc::new(OnceLock::new());
    let cell = meta_cell.clone();
    let ws_stream = accept_hdr_async(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = cell.set(ConnectionMeta::from_request(req, remote));
            Ok(resp)
        },
    )
    .await?;

    let meta = meta_cell
        .get()
        .cloned()
        .unwrap_or_else(|| ConnectionMeta::bare(remote));
    let identity = resolver.resolve(&meta);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = hub.connect(identity, tx);
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let result = run_session(&mut ws_tx, &mut ws_rx, &mut rx, &hub, &session).await;

    hub.disconnect(&session);
    debug!("Connection closed: {} ({})", session.peer_id, remote);
    result
}

/// Whether the connection opens with `GET /health` or `GET /stats`
///
/// Every other request, including a `GET /` upgrade, goes to the WebSocket
/// handshake. The request line may arrive split across segments, so peeking
/// continues while the bytes seen so far are still a prefix of a monitoring
/// path, up to `MONITOR_PEEK_TIMEOUT`.
async fn is_monitoring_request(stream: &TcpStream) -> Result<bool, SignalError> {
    let deadline = Instant::now() + MONITOR_PEEK_TIMEOUT;
    let mut peek_buf = [0u8; 12];
    loop {
        let n = stream.peek(&mut peek_buf).await?;
        let head = &peek_buf[..n];
        if MONITOR_PATHS.iter().any(|path| head.starts_with(path)) {
            return Ok(true);
        }
        let undecided = n > 0 && MONITOR_PATHS.iter().any(|path| path.starts_with(head));
        if !undecided || Instant::now() >= deadline {
            return Ok(false);
        }
        // peek returns at once while unread bytes are buffered
        tokio::time::sleep(MONITOR_PEEK_RETRY).await;
    }
}

/// Pump frames between the socket and the hub until either side closes
async fn run_session(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    hub: &Hub,
    session: &Session,
) -> Result<(), SignalError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => hub.handle_text(session, &text),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                        debug!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(SignalError::WebSocket(e)),
                Some(Ok(_)) => {}
            },
            item = rx.recv() => {
                let Some(item) = item else {
                    return Ok(());
                };
                match item.to_json()? {
                    Some(json) => ws_tx.send(Message::Text(json)).await?,
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    hub: &Hub,
    started: Instant,
) -> Result<(), SignalError> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|target| target.split('?').next().unwrap_or(target))
        .unwrap_or("/");

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            json!({
                "status": "healthy",
                "rooms": hub.room_count(),
                "peers": hub.peer_count(),
            }),
        ),
        "/stats" => (
            "200 OK",
            json!({
                "rooms": hub.room_count(),
                "peers": hub.peer_count(),
                "pairingCodes": hub.ticket_count(),
                "uptimeSecs": started.elapsed().as_secs(),
            }),
        ),
        _ => ("404 Not Found", json!({"error": "not found"})),
    };
    let body = body.to_string();

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio_test::assert_ok;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    type Client =
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start() -> (Arc<SignalServer>, SocketAddr) {
        let server = Arc::new(assert_ok!(SignalServer::new(&SignalConfig::default())));
        let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
        let addr = assert_ok!(listener.local_addr());
        let serving = server.clone();
        tokio::spawn(async move { serving.serve_listener(listener).await });
        (server, addr)
    }

    /// Next JSON message, skipping heartbeat probes
    async fn recv(ws: &mut Client) -> Value {
        loop {
            let msg = ws.next().await.expect("stream ended").expect("websocket error");
            if let WsMessage::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] != "ping" {
                    return value;
                }
            }
        }
    }

    async fn send(ws: &mut Client, value: Value) {
        assert_ok!(ws.send(WsMessage::Text(value.to_string())).await);
    }

    #[test]
    fn test_server_creation() {
        let server = SignalServer::new(&SignalConfig::default()).unwrap();
        assert_eq!(server.room_count(), 0);
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = SignalConfig {
            heartbeat_max_missed: 0,
            ..SignalConfig::default()
        };
        assert!(matches!(SignalServer::new(&config), Err(SignalError::Config(_))));
    }

    #[tokio::test]
    async fn test_two_peers_signal_end_to_end() {
        let (server, addr) = start().await;

        let (mut a, _) = assert_ok!(connect_async(format!("ws://{}/", addr)).await);
        let hello = recv(&mut a).await;
        assert_eq!(hello["type"], "identity-assigned");
        assert_eq!(hello["config"]["wsFallback"], false);
        let a_id = hello["peerId"].as_str().unwrap().to_string();
        let a_hash = hello["peerIdHash"].as_str().unwrap().to_string();
        let snapshot = recv(&mut a).await;
        assert_eq!(snapshot["type"], "peers");
        assert_eq!(snapshot["roomType"], "address");
        assert_eq!(snapshot["peers"], json!([]));

        let (mut b, _) = assert_ok!(connect_async(format!("ws://{}/", addr)).await);
        let b_id = recv(&mut b).await["peerId"].as_str().unwrap().to_string();
        let snapshot = recv(&mut b).await;
        assert_eq!(snapshot["peers"][0]["id"], a_id.as_str());

        let joined = recv(&mut a).await;
        assert_eq!(joined["type"], "peer-joined");
        assert_eq!(joined["peer"]["id"], b_id.as_str());

        send(
            &mut a,
            json!({"type": "signal", "to": b_id, "roomType": "address", "sdp": {"type": "offer", "sdp": "v=0"}}),
        )
        .await;
        let relayed = recv(&mut b).await;
        assert_eq!(relayed["type"], "signal");
        assert_eq!(relayed["sender"]["id"], a_id.as_str());
        assert_eq!(relayed["sdp"], json!({"type": "offer", "sdp": "v=0"}));
        assert!(relayed.get("to").is_none());

        // Resume the id on a fresh socket; the old one is closed
        let (mut a2, _) = assert_ok!(
            connect_async(format!("ws://{}/?peer_id={}&peer_id_hash={}", addr, a_id, a_hash)).await
        );
        assert_eq!(recv(&mut a2).await["peerId"], a_id.as_str());
        let left = recv(&mut b).await;
        assert_eq!(left["type"], "peer-left");
        assert_eq!(left["isDisconnect"], true);
        assert_eq!(recv(&mut b).await["type"], "peer-joined");
        assert_eq!(server.peer_count(), 2);

        let snapshot = recv(&mut a2).await;
        assert_eq!(snapshot["peers"][0]["id"], b_id.as_str());

        send(&mut b, json!({"type": "disconnect"})).await;
        let left = recv(&mut a2).await;
        assert_eq!(left["type"], "peer-left");
        assert_eq!(left["peerId"], b_id.as_str());
    }

    #[tokio::test]
    async fn test_health_request_split_across_segments() {
        let (_server, addr) = start().await;

        let mut stream = assert_ok!(TcpStream::connect(addr).await);
        stream.set_nodelay(true).unwrap();
        assert_ok!(stream.write_all(b"GET /hea").await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ok!(stream.write_all(b"lth HTTP/1.1\r\nHost: x\r\n\r\n").await);
        let mut response = String::new();
        assert_ok!(stream.read_to_string(&mut response).await);

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains(r#""status":"healthy""#));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_server, addr) = start().await;

        let mut stream = assert_ok!(TcpStream::connect(addr).await);
        assert_ok!(stream.write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n").await);
        let mut response = String::new();
        assert_ok!(stream.read_to_string(&mut response).await);

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["peers"], 0);
    }
}
