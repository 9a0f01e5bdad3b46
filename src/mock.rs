//! Local stand-in for the query service.
//!
//! Serves `/health`, `/query-types`, `/query` (also `/api/query`),
//! `/query/stream` and the
//! `/ws/{client_id}` socket on one port, answering every question with a
//! canned [`MockReply`]. Used by `--mock` and by the integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::detect::detect_query_type;
use crate::message::now_ms;
use crate::protocol::{QueryType, ServerFrame, Sources, StreamEvent};

const MAX_REQUEST_BYTES: usize = 1 << 20;

/// What the mock answers with.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub answer: String,
    pub sources: Option<Sources>,
    pub healthy: bool,
    /// Reply to queries with this status and `detail` instead of answering.
    pub fail_with: Option<(u16, String)>,
    /// Characters per chunk on the streaming endpoints.
    pub chunk_chars: usize,
    /// Pause between chunks.
    pub chunk_delay: Duration,
    /// End `/query/stream` with this `error` event after the chunks.
    pub stream_error: Option<String>,
}

impl Default for MockReply {
    fn default() -> Self {
        let sources: Sources = serde_json::from_value(json!({
            "sql_data": [
                {"stock_code": "600519", "stock_name": "贵州茅台", "close": 1688.0},
                {"stock_code": "000001", "stock_name": "平安银行", "close": 11.2}
            ],
            "documents": [
                {"title": "贵州茅台2024年年度报告", "source": "annual_report", "score": 0.92,
                 "content": "公司实现营业总收入1741亿元，同比增长15.7%。"}
            ]
        }))
        .unwrap_or_default();
        Self {
            answer: "贵州茅台财务健康度评分 87/100。营收稳定增长，现金流充裕，负债率低。".to_string(),
            sources: Some(sources),
            healthy: true,
            fail_with: None,
            chunk_chars: 4,
            chunk_delay: Duration::from_millis(5),
            stream_error: None,
        }
    }
}

impl MockReply {
    fn chunks(&self) -> Vec<String> {
        let size = self.chunk_chars.max(1);
        let chars: Vec<char> = self.answer.chars().collect();
        chars.chunks(size).map(|c| c.iter().collect()).collect()
    }
}

/// Counters the tests assert on.
#[derive(Debug, Default)]
pub struct MockStats {
    pub connections: AtomicUsize,
    pub queries: AtomicUsize,
    pub sockets: AtomicUsize,
}

impl MockStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn sockets(&self) -> usize {
        self.sockets.load(Ordering::SeqCst)
    }
}

pub struct MockServer {
    listener: TcpListener,
    reply: Arc<MockReply>,
    stats: Arc<MockStats>,
}

impl MockServer {
    pub async fn bind(addr: &str, reply: MockReply) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            reply: Arc::new(reply),
            stats: Arc::new(MockStats::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until the task is dropped or accept fails.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            self.stats.connections.fetch_add(1, Ordering::SeqCst);
            let reply = Arc::clone(&self.reply);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, reply, stats).await {
                    debug!(error = %e, peer = %peer, "mock connection ended with error");
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<std::io::Result<()>> {
        tokio::spawn(self.run())
    }
}

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<HttpRequest>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request too large"));
        }

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let content_length = req
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                        .and_then(|h| std::str::from_utf8(h.value).ok())
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    Some((
                        head_len,
                        content_length,
                        req.method.unwrap_or("GET").to_string(),
                        req.path.unwrap_or("/").to_string(),
                    ))
                }
                Ok(httparse::Status::Partial) => None,
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()));
                }
            }
        };

        let Some((head_len, content_length, method, path)) = parsed else {
            continue;
        };
        while buf.len() < head_len + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let end = buf.len().min(head_len + content_length);
        return Ok(Some(HttpRequest {
            method,
            path,
            body: buf[head_len..end].to_vec(),
        }));
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

async fn write_json(stream: &mut TcpStream, status: u16, body: &Value) -> std::io::Result<()> {
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        reason(status),
        body.len(),
    );
    stream.write_all(response.as_bytes()).await
}

fn timestamp() -> String {
    now_ms().to_string()
}

/// Question and routing hint from a query body; the type is detected when absent.
fn parse_query_body(body: &[u8]) -> Option<(String, QueryType)> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let question = v.get("question")?.as_str()?.trim().to_string();
    if question.is_empty() {
        return None;
    }
    let query_type = v
        .get("query_type")
        .and_then(Value::as_str)
        .and_then(|s| QueryType::from_str_loose(s).ok())
        .unwrap_or_else(|| detect_query_type(&question));
    Some((question, query_type))
}

async fn handle_connection(
    mut stream: TcpStream,
    reply: Arc<MockReply>,
    stats: Arc<MockStats>,
) -> std::io::Result<()> {
    let mut peek_buf = [0u8; 1024];
    let peek_n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let peek_str = String::from_utf8_lossy(&peek_buf[..peek_n]);

    if peek_str.to_ascii_lowercase().contains("upgrade: websocket") {
        let path = peek_str
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();
        let Some(client_id) = path.strip_prefix("/ws/").map(str::to_string) else {
            return write_json(&mut stream, 404, &json!({"detail": "Not Found"})).await;
        };
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => {
                stats.sockets.fetch_add(1, Ordering::SeqCst);
                serve_socket(ws, client_id, reply, stats).await;
            }
            Err(e) => warn!(error = %e, "mock WebSocket handshake failed"),
        }
        return Ok(());
    }

    let Some(req) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let path = req.path.split('?').next().unwrap_or("/");
    debug!(method = %req.method, path = %path, "mock request");

    match (req.method.as_str(), path) {
        ("GET", "/health") => {
            let body = if reply.healthy {
                json!({"status": "healthy", "mysql": true, "milvus": true, "timestamp": timestamp()})
            } else {
                json!({"status": "unhealthy", "mysql": false, "milvus": false,
                       "error": "database unavailable", "timestamp": timestamp()})
            };
            write_json(&mut stream, 200, &body).await
        }
        ("GET", "/query-types") => {
            let types: Vec<&str> = QueryType::ALL.iter().map(QueryType::as_str).collect();
            write_json(&mut stream, 200, &json!({"query_types": types})).await
        }
        ("POST", "/query") | ("POST", "/api/query") => {
            stats.queries.fetch_add(1, Ordering::SeqCst);
            let Some((question, query_type)) = parse_query_body(&req.body) else {
                return write_json(&mut stream, 400, &json!({"detail": "question is required"})).await;
            };
            if let Some((status, detail)) = &reply.fail_with {
                return write_json(&mut stream, *status, &json!({"detail": detail})).await;
            }
            let body = json!({
                "success": true,
                "question": question,
                "answer": reply.answer,
                "query_type": query_type.as_str(),
                "sources": reply.sources,
                "query_id": uuid::Uuid::new_v4().to_string(),
                "timestamp": timestamp(),
            });
            write_json(&mut stream, 200, &body).await
        }
        ("POST", "/query/stream") => {
            stats.queries.fetch_add(1, Ordering::SeqCst);
            if parse_query_body(&req.body).is_none() {
                return write_json(&mut stream, 400, &json!({"detail": "question is required"})).await;
            }
            if let Some((status, detail)) = &reply.fail_with {
                return write_json(&mut stream, *status, &json!({"detail": detail})).await;
            }
            stream_ndjson(&mut stream, &reply).await
        }
        _ => write_json(&mut stream, 404, &json!({"detail": "Not Found"})).await,
    }
}

async fn stream_ndjson(stream: &mut TcpStream, reply: &MockReply) -> std::io::Result<()> {
    let headers = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
    stream.write_all(headers.as_bytes()).await?;

    let query_id = uuid::Uuid::new_v4().to_string();
    let mut events = vec![StreamEvent::Start {
        query_id: Some(query_id.clone()),
    }];
    events.extend(reply.chunks().into_iter().map(|content| StreamEvent::Chunk { content }));
    events.push(match &reply.stream_error {
        Some(error) => StreamEvent::Error {
            error: Some(error.clone()),
        },
        None => StreamEvent::Complete {
            query_id: Some(query_id),
            sources: reply.sources.clone(),
        },
    });

    for event in events {
        let Ok(line) = serde_json::to_string(&event) else {
            continue;
        };
        stream.write_all(format!("{line}\n").as_bytes()).await?;
        stream.flush().await?;
        if !reply.chunk_delay.is_zero() {
            tokio::time::sleep(reply.chunk_delay).await;
        }
    }
    stream.shutdown().await
}

async fn serve_socket(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    client_id: String,
    reply: Arc<MockReply>,
    stats: Arc<MockStats>,
) {
    let (mut sink, mut source) = ws.split();
    info!(client_id = %client_id, "mock socket opened");

    let send = |frame: &ServerFrame| serde_json::to_string(frame).ok().map(WsMessage::Text);

    let welcome = ServerFrame::Welcome {
        message: Some("connected to the stock analysis service".to_string()),
        client_id: Some(client_id.clone()),
    };
    if let Some(msg) = send(&welcome) {
        if sink.send(msg).await.is_err() {
            return;
        }
    }

    while let Some(Ok(msg)) = source.next().await {
        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(v) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let frames = match v.get("type").and_then(Value::as_str) {
            Some("ping") => vec![ServerFrame::Pong],
            Some("query") => {
                stats.queries.fetch_add(1, Ordering::SeqCst);
                socket_answer(&v, &reply)
            }
            other => {
                debug!(kind = ?other, "mock socket ignoring frame");
                continue;
            }
        };
        for frame in frames {
            let Some(msg) = send(&frame) else { continue };
            if sink.send(msg).await.is_err() {
                return;
            }
            if matches!(frame, ServerFrame::Stream { .. }) && !reply.chunk_delay.is_zero() {
                tokio::time::sleep(reply.chunk_delay).await;
            }
        }
    }
    info!(client_id = %client_id, "mock socket closed");
}

fn socket_answer(v: &Value, reply: &MockReply) -> Vec<ServerFrame> {
    let message_id = v.get("message_id").and_then(Value::as_str).map(str::to_string);
    let query_id = Some(uuid::Uuid::new_v4().to_string());
    let question = v.get("question").and_then(Value::as_str).unwrap_or_default();

    let mut frames = vec![ServerFrame::Processing {
        query_id: query_id.clone(),
        message_id: message_id.clone(),
        message: Some("processing".to_string()),
    }];
    if question.trim().is_empty() {
        frames.push(ServerFrame::Error {
            message_id,
            query_id,
            error: Some("question is required".to_string()),
            message: None,
        });
        return frames;
    }
    if let Some((_, detail)) = &reply.fail_with {
        frames.push(ServerFrame::Error {
            message_id,
            query_id,
            error: Some(detail.clone()),
            message: None,
        });
        return frames;
    }
    frames.extend(reply.chunks().into_iter().map(|content| ServerFrame::Stream {
        message_id: message_id.clone(),
        query_id: query_id.clone(),
        content,
    }));
    frames.push(ServerFrame::Complete {
        message_id,
        query_id,
        content: None,
        sources: reply.sources.clone(),
    });
    frames
}
