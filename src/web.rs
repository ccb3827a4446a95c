//! # Bridge Server
//!
//! Plain HTTP/1.1 over `tokio::net::TcpListener`, one request per connection,
//! plus the `/ws/telemetry` WebSocket upgrade.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /health` | snapshot summary, always 200 |
//! | `GET /blackboard` | `{content}` or offline payload |
//! | `GET /telemetry` | snapshot or offline payload |
//! | `GET /ws/telemetry` (upgrade) | one [`StreamSession`] per connection |
//! | `POST /execute` | authorize, then dispatch through [`CommandGateway`] |
//!
//! [`serve`] is the composition root: it builds the store and gateway from the
//! configuration, starts the push daemon once, and runs the accept loop.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::gateway::{CommandGateway, CommandName, CommandRequest, ProcessExecutor};
use crate::pacer::IntervalPacer;
use crate::push::{PushDaemon, PushStats};
use crate::session::StreamSession;
use crate::state::{offline_payload, snapshot_or_offline, FileStateStore, Snapshot, StateStore};

pub const MAX_HEADER_BYTES: usize = 16 * 1024;
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// A stream frame that cannot be written within this many stream periods ends
/// the session.
const SEND_TIMEOUT_PERIODS: u32 = 3;

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// A fully-read HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Bytes read past the end of this request, such as the first WebSocket
    /// frames a client pipelines behind its upgrade.
    pub trailing: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup (first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The peer closed before sending anything.
    #[error("connection closed before a request was received")]
    Closed,
    #[error("request exceeds size limit")]
    TooLarge,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("timed out reading request")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one request head and its `Content-Length` body.
pub async fn read_request<R>(stream: &mut R) -> Result<Request, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let (head_len, method, target, headers) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                RequestError::Closed
            } else {
                RequestError::Malformed("connection closed mid-request".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_buf);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let headers: Vec<(String, String)> = parsed
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                    .collect();
                break (
                    len,
                    parsed.method.unwrap_or("").to_string(),
                    parsed.path.unwrap_or("/").to_string(),
                    headers,
                );
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADER_BYTES {
                    return Err(RequestError::TooLarge);
                }
            }
            Err(e) => return Err(RequestError::Malformed(e.to_string())),
        }
    };

    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim().to_string())
    };
    if find("transfer-encoding").is_some() {
        return Err(RequestError::Malformed("chunked bodies are not supported".into()));
    }
    let content_length = match find("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(format!("invalid content-length: {v}")))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::TooLarge);
    }

    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestError::Malformed("body truncated".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    let trailing = body.split_off(content_length);

    let path = target.split('?').next().unwrap_or("/").to_string();
    Ok(Request {
        method,
        path,
        headers,
        body,
        trailing,
    })
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    content_type: Option<&'static str>,
    headers: Vec<(&'static str, String)>,
}

fn reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

impl Response {
    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                body,
                content_type: Some("application/json"),
                headers: Vec::new(),
            },
            Err(e) => {
                warn!(error = %e, "failed to serialize response body");
                Self {
                    status: 500,
                    body: br#"{"error":"internal error"}"#.to_vec(),
                    content_type: Some("application/json"),
                    headers: Vec::new(),
                }
            }
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: Vec::new(),
            content_type: None,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        if let Some(ct) = self.content_type {
            head.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str("Access-Control-Allow-Origin: *\r\n");
        for (k, v) in &self.headers {
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

// ---------------------------------------------------------------------------
// WebSocket handshake
// ---------------------------------------------------------------------------

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key` (RFC 6455 §4.2.2).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn is_websocket_upgrade(req: &Request) -> bool {
    let upgrade = req
        .header("upgrade")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = req.header("connection").is_some_and(|v| {
        v.split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    req.method == "GET" && upgrade && connection
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn node_count(snapshot: &Snapshot) -> u64 {
    match snapshot.get("nodes") {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::Array(a)) => a.len() as u64,
        _ => 0,
    }
}

fn organ_names(snapshot: &Snapshot) -> Vec<String> {
    match snapshot.get("organs") {
        Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// `{status, nodeCount, organNames}` summary of the current snapshot.
pub fn health_payload(store: &dyn StateStore) -> serde_json::Value {
    match store.read_snapshot() {
        Ok(snapshot) => serde_json::json!({
            "status": "online",
            "nodeCount": node_count(&snapshot),
            "organNames": organ_names(&snapshot),
        }),
        Err(_) => serde_json::json!({
            "status": "offline",
            "nodeCount": 0,
            "organNames": [],
        }),
    }
}

/// `{content}` for the status document, or the offline payload.
pub fn blackboard_payload(store: &dyn StateStore) -> serde_json::Value {
    match store.read_status_document() {
        Ok(doc) => serde_json::json!({ "content": doc.as_str() }),
        Err(e) => {
            debug!(error = %e, "status document unavailable");
            offline_payload()
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct BridgeServer {
    store: Arc<dyn StateStore>,
    gateway: Arc<CommandGateway>,
    stream_interval: Duration,
}

impl BridgeServer {
    pub fn new(store: Arc<dyn StateStore>, gateway: Arc<CommandGateway>, stream_interval: Duration) -> Self {
        Self {
            store,
            gateway,
            stream_interval,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Accept connections until `shutdown` flips to `true` or its sender is
    /// dropped. Every connection runs in its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!(peer = %peer, error = %e, "connection error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("accept loop stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), RequestError> {
        let request = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut stream)).await {
            Ok(Ok(req)) => req,
            Ok(Err(RequestError::Closed)) => return Ok(()),
            Ok(Err(e)) => {
                let resp = match &e {
                    RequestError::TooLarge => Response::error(413, "request too large"),
                    _ => Response::error(400, "malformed request"),
                };
                let _ = stream.write_all(&resp.to_bytes()).await;
                return Err(e);
            }
            Err(_) => {
                let _ = stream
                    .write_all(&Response::error(408, "request timeout").to_bytes())
                    .await;
                return Err(RequestError::Timeout);
            }
        };

        if request.path == "/ws/telemetry" && is_websocket_upgrade(&request) {
            return self.upgrade(stream, &request).await;
        }

        let response = self.route(&request).await;
        stream.write_all(&response.to_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn upgrade(&self, mut stream: TcpStream, request: &Request) -> Result<(), RequestError> {
        let Some(key) = request.header("sec-websocket-key") else {
            stream
                .write_all(&Response::error(400, "missing Sec-WebSocket-Key").to_bytes())
                .await?;
            return Ok(());
        };

        let handshake = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        stream.write_all(handshake.as_bytes()).await?;

        let ws = WebSocketStream::from_partially_read(stream, request.trailing.clone(), Role::Server, None).await;
        let session = StreamSession::new(Arc::clone(&self.store))
            .with_send_timeout(self.stream_interval.saturating_mul(SEND_TIMEOUT_PERIODS));
        session
            .run(ws, IntervalPacer::immediate(self.stream_interval))
            .await;
        Ok(())
    }

    /// Produce the response for a non-upgrade request.
    pub async fn route(&self, req: &Request) -> Response {
        const KNOWN: &[&str] = &["/health", "/blackboard", "/telemetry", "/execute", "/ws/telemetry"];

        match (req.method.as_str(), req.path.as_str()) {
            ("OPTIONS", path) if KNOWN.contains(&path) => Response::no_content()
                .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Authorization, Content-Type"),
            ("GET", "/health") => Response::json(200, &health_payload(self.store.as_ref())),
            ("GET", "/blackboard") => Response::json(200, &blackboard_payload(self.store.as_ref())),
            ("GET", "/telemetry") => Response::json(200, &snapshot_or_offline(self.store.as_ref())),
            ("POST", "/execute") => self.execute(req).await,
            ("GET", "/ws/telemetry") => Response::error(400, "websocket upgrade required"),
            (_, path) if KNOWN.contains(&path) => Response::error(405, "method not allowed"),
            _ => Response::error(404, "not found"),
        }
    }

    async fn execute(&self, req: &Request) -> Response {
        let Some(grant) = self.gateway.grant(req.header("authorization")) else {
            warn!("rejected /execute with missing or invalid token");
            return Response::error(401, "unauthorized").with_header("WWW-Authenticate", "Bearer");
        };

        let command: CommandRequest = match serde_json::from_slice(&req.body) {
            Ok(c) => c,
            Err(e) => return Response::error(400, &format!("invalid request body: {e}")),
        };

        let outcome = self.gateway.dispatch(&grant, &command).await;
        Response::json(200, &outcome)
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Build the command gateway with the configured validation executor.
pub fn build_gateway(config: &BridgeConfig) -> CommandGateway {
    let v = &config.validation;
    let executor = ProcessExecutor::new(v.program.clone(), v.args.clone(), v.timeout).workdir(v.workdir.clone());
    CommandGateway::new(config.secret.clone()).with_executor(CommandName::RunTests, Arc::new(executor))
}

/// Start the single push daemon for this process.
pub fn start_push_daemon(
    config: &BridgeConfig,
    store: Arc<dyn StateStore>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<PushStats> {
    let daemon = PushDaemon::builder(config.effective_collector_url())
        .store(store)
        .token(config.secret.clone())
        .interval(config.push_interval)
        .request_timeout(config.push_timeout)
        .build();
    match daemon {
        Ok(d) => d.spawn(shutdown),
        // `store` is always set above; keep the server up regardless.
        Err(e) => {
            warn!(error = e, "push daemon not started");
            tokio::spawn(async { PushStats::default() })
        }
    }
}

/// Bind, start the push daemon, and serve until shutdown.
pub async fn serve(config: Arc<BridgeConfig>, shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Bind { addr: addr.clone(), source: e })?;

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(
        config.snapshot_path.clone(),
        config.document_path.clone(),
    ));
    if config.secret.is_none() {
        warn!("no bridge token configured, every /execute request will be rejected");
    }

    let push = start_push_daemon(&config, Arc::clone(&store), shutdown.clone());

    let server = Arc::new(BridgeServer::new(
        store,
        Arc::new(build_gateway(&config)),
        config.stream_interval,
    ));
    info!(addr = %addr, "bridge listening");
    server.serve(listener, shutdown).await;

    if let Ok(stats) = push.await {
        debug!(?stats, "push daemon joined");
    }
    Ok(())
}
