//! End-to-end tests for the HTTP transports against the local mock service.

use std::sync::Arc;
use std::time::Duration;

use stock_chat::config::{ApiConfig, ChatConfig};
use stock_chat::mock::{MockReply, MockServer, MockStats};
use stock_chat::session::{IgnoreReason, SendOutcome, SessionEvent, Transport};
use stock_chat::streaming::RevealConfig;
use stock_chat::transcript::INTERRUPTED_MARKER;
use stock_chat::{ChatSession, QueryClient, Role};
use tokio::sync::mpsc;

async fn start(reply: MockReply) -> (String, Arc<MockStats>) {
    let server = MockServer::bind("127.0.0.1:0", reply).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stats = server.stats();
    server.spawn();
    (format!("http://{addr}"), stats)
}

fn config(base_url: &str) -> ChatConfig {
    ChatConfig {
        api: ApiConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            ..ApiConfig::default()
        },
        streaming: RevealConfig {
            chars_per_tick: 8,
            tick_ms: 1,
        },
        ..ChatConfig::default()
    }
}

// ---------------------------------------------------------------------------
// POST /query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_http_answer_is_revealed_and_sourced() {
    let reply = MockReply::default();
    let (url, stats) = start(reply.clone()).await;
    let mut session = ChatSession::new(config(&url)).unwrap();

    let outcome = session.send("分析贵州茅台的财务健康度").await;
    let SendOutcome::Answered(id) = outcome else { panic!("got {outcome:?}") };

    let msgs = session.transcript().messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].role, Role::User);
    let answer = session.transcript().get(&id).unwrap();
    assert_eq!(answer.content, reply.answer);
    assert!(!answer.is_streaming);
    assert!(answer.has_sources());
    assert!(!session.transcript().is_busy());
    assert_eq!(stats.queries(), 1);
}

#[tokio::test]
async fn test_instant_mode_emits_no_partial_frames() {
    let (url, _) = start(MockReply::default()).await;
    let mut session = ChatSession::new(config(&url)).unwrap();
    session.instant = true;
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.events = Some(tx);

    assert!(matches!(session.send("A股市值排名前10").await, SendOutcome::Answered(_)));
    session.events = None;

    let mut updates = 0;
    let mut finished = 0;
    while let Some(ev) = rx.recv().await {
        match ev {
            SessionEvent::ContentUpdated { .. } => updates += 1,
            SessionEvent::MessageFinished(_) => finished += 1,
            _ => {}
        }
    }
    assert_eq!(updates, 0);
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn test_reveal_prefixes_grow_to_full_answer() {
    let reply = MockReply::default();
    let (url, _) = start(reply.clone()).await;
    let mut session = ChatSession::new(config(&url)).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.events = Some(tx);

    session.send("茅台最近的主力资金流向").await;
    session.events = None;

    let mut frames = Vec::new();
    while let Some(ev) = rx.recv().await {
        if let SessionEvent::ContentUpdated { content, .. } = ev {
            frames.push(content);
        }
    }
    assert!(frames.len() > 1);
    for pair in frames.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }
    assert_eq!(frames.last().unwrap(), &reply.answer);
}

#[tokio::test]
async fn test_stop_during_reveal_keeps_prefix_and_sources() {
    let (url, _) = start(MockReply::default()).await;
    let mut cfg = config(&url);
    cfg.streaming = RevealConfig {
        chars_per_tick: 1,
        tick_ms: 20,
    };
    let mut session = ChatSession::new(cfg).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.events = Some(tx);

    let stop = session.stop_handle();
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if matches!(ev, SessionEvent::ContentUpdated { .. }) {
                stop.stop();
                break;
            }
        }
    });

    let outcome = session.send("分析贵州茅台的财务健康度").await;
    let SendOutcome::Cancelled(id) = outcome else { panic!("got {outcome:?}") };
    let m = session.transcript().get(&id).unwrap();
    assert!(m.content.ends_with(INTERRUPTED_MARKER));
    assert!(!m.is_streaming);
    assert!(m.has_sources());
    assert!(!session.transcript().is_busy());
}

#[tokio::test]
async fn test_stop_pressed_before_send_cancels_it() {
    let (url, stats) = start(MockReply::default()).await;
    let mut session = ChatSession::new(config(&url)).unwrap();

    session.stop_handle().stop();
    let outcome = session.send("分析贵州茅台的财务健康度").await;
    let SendOutcome::Cancelled(id) = outcome else { panic!("got {outcome:?}") };
    assert!(!session.transcript().get(&id).unwrap().is_streaming);
    assert!(!session.transcript().is_busy());

    // The stop is spent; the next question runs to completion.
    let outcome = session.send("A股市值排名前10").await;
    assert!(matches!(outcome, SendOutcome::Answered(_)), "got {outcome:?}");
    assert!(stats.queries() >= 1);
}

#[tokio::test]
async fn test_backend_detail_becomes_error_bubble() {
    let reply = MockReply {
        fail_with: Some((500, "database offline".into())),
        ..MockReply::default()
    };
    let (url, _) = start(reply).await;
    let mut session = ChatSession::new(config(&url)).unwrap();

    let outcome = session.send("A股市值排名前10").await;
    let SendOutcome::Failed(id) = outcome else { panic!("got {outcome:?}") };
    let m = session.transcript().get(&id).unwrap();
    assert!(m.is_error);
    assert_eq!(m.content, "⚠️ database offline");
}

#[tokio::test]
async fn test_api_prefixed_query_path() {
    let (url, stats) = start(MockReply::default()).await;
    let mut cfg = config(&url);
    cfg.api.query_path = "/api/query".into();
    let mut session = ChatSession::new(cfg).unwrap();
    session.instant = true;
    assert!(matches!(session.send("A股市值排名前10").await, SendOutcome::Answered(_)));
    assert_eq!(stats.queries(), 1);
}

#[tokio::test]
async fn test_blank_input_never_reaches_backend() {
    let (url, stats) = start(MockReply::default()).await;
    let mut session = ChatSession::new(config(&url)).unwrap();
    assert_eq!(session.send(" \n ").await, SendOutcome::Ignored(IgnoreReason::Empty));
    assert!(session.transcript().is_empty());
    assert_eq!(stats.queries(), 0);
}

#[tokio::test]
async fn test_empty_answer_uses_fallback_text() {
    let reply = MockReply {
        answer: String::new(),
        sources: None,
        ..MockReply::default()
    };
    let (url, _) = start(reply).await;
    let mut session = ChatSession::new(config(&url)).unwrap();
    session.instant = true;
    let SendOutcome::Answered(id) = session.send("你好").await else { panic!() };
    let m = session.transcript().get(&id).unwrap();
    assert_eq!(m.content, "Sorry, no answer was returned.");
    assert!(!m.has_sources());
}

// ---------------------------------------------------------------------------
// POST /query/stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ndjson_stream_appends_chunks() {
    let reply = MockReply {
        chunk_delay: Duration::from_millis(1),
        ..MockReply::default()
    };
    let (url, _) = start(reply.clone()).await;
    let mut session = ChatSession::new(config(&url))
        .unwrap()
        .with_transport(Transport::HttpStream);
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.events = Some(tx);

    let outcome = session.send("贵州茅台2024年年报的主要内容").await;
    let SendOutcome::Answered(id) = outcome else { panic!("got {outcome:?}") };
    session.events = None;

    let m = session.transcript().get(&id).unwrap();
    assert_eq!(m.content, reply.answer);
    assert!(m.has_sources());

    let mut updates = 0;
    while let Some(ev) = rx.recv().await {
        if matches!(ev, SessionEvent::ContentUpdated { .. }) {
            updates += 1;
        }
    }
    assert!(updates > 1, "expected several chunks, got {updates}");
}

#[tokio::test]
async fn test_stream_error_event_after_chunks_fails_message() {
    let reply = MockReply {
        chunk_delay: Duration::from_millis(1),
        stream_error: Some("agent crashed".into()),
        ..MockReply::default()
    };
    let (url, _) = start(reply).await;
    let mut session = ChatSession::new(config(&url))
        .unwrap()
        .with_transport(Transport::HttpStream);
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.events = Some(tx);

    let outcome = session.send("贵州茅台2024年年报的主要内容").await;
    let SendOutcome::Failed(id) = outcome else { panic!("got {outcome:?}") };
    session.events = None;

    let m = session.transcript().get(&id).unwrap();
    assert!(m.is_error);
    assert!(!m.is_streaming);
    assert_eq!(m.content, "⚠️ agent crashed");
    assert!(!session.transcript().is_busy());

    let mut partial = 0;
    while let Some(ev) = rx.recv().await {
        if matches!(ev, SessionEvent::ContentUpdated { .. }) {
            partial += 1;
        }
    }
    assert!(partial > 0, "chunks should arrive before the error");
}

#[tokio::test]
async fn test_stream_error_status_fails_message() {
    let reply = MockReply {
        fail_with: Some((503, String::new())),
        ..MockReply::default()
    };
    let (url, _) = start(reply).await;
    let mut session = ChatSession::new(config(&url))
        .unwrap()
        .with_transport(Transport::HttpStream);
    let SendOutcome::Failed(id) = session.send("q").await else { panic!() };
    assert_eq!(
        session.transcript().get(&id).unwrap().content,
        "⚠️ Sorry, the query failed. Status: 503"
    );
}

// ---------------------------------------------------------------------------
// Health and metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_reports_status() {
    let (url, _) = start(MockReply::default()).await;
    let client = QueryClient::new(config(&url).api);
    let health = client.health().await.unwrap();
    assert!(health.is_healthy());
    assert_eq!(health.mysql, Some(true));

    let (url, _) = start(MockReply {
        healthy: false,
        ..MockReply::default()
    })
    .await;
    let mut session = ChatSession::new(config(&url)).unwrap();
    assert!(!session.check_health().await);
    assert!(session.transcript().messages()[0].is_error);
}

#[tokio::test]
async fn test_query_types_lists_every_type() {
    let (url, _) = start(MockReply::default()).await;
    let client = QueryClient::new(config(&url).api);
    let types = client.query_types().await.unwrap();
    let list = types["query_types"].as_array().unwrap();
    assert_eq!(list.len(), 5);
    assert!(list.iter().any(|t| t == "money_flow"));
}
