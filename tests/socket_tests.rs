//! WebSocket transport: connect, answer merging and the reconnect budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stock_chat::config::{ApiConfig, ChatConfig, SocketConfig};
use stock_chat::mock::{MockReply, MockServer, MockStats};
use stock_chat::protocol::{ClientFrame, ServerFrame};
use stock_chat::session::{SendOutcome, Transport};
use stock_chat::socket::{self, SocketEvent, SocketHandle};
use stock_chat::ChatSession;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start(reply: MockReply) -> (std::net::SocketAddr, Arc<MockStats>) {
    let server = MockServer::bind("127.0.0.1:0", reply).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stats = server.stats();
    server.spawn();
    (addr, stats)
}

fn socket_config(addr: std::net::SocketAddr, max: u32) -> SocketConfig {
    SocketConfig {
        url: format!("ws://{addr}/ws/{{client_id}}"),
        max_reconnect_attempts: max,
        reconnect_delay_ms: 10,
        heartbeat_secs: 0,
    }
}

async fn next(events: &mut UnboundedReceiver<SocketEvent>) -> Option<SocketEvent> {
    timeout(WAIT, events.recv()).await.expect("socket event timed out")
}

async fn connected(events: &mut UnboundedReceiver<SocketEvent>) -> String {
    match next(events).await {
        Some(SocketEvent::Connected { client_id }) => client_id,
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_gets_welcome_and_pong() {
    let (addr, stats) = start(MockReply::default()).await;
    let (handle, mut events) = socket::spawn(socket_config(addr, 1));

    let client_id = connected(&mut events).await;
    assert_eq!(client_id, handle.client_id());
    assert!(handle.is_connected());
    match next(&mut events).await {
        Some(SocketEvent::Frame(ServerFrame::Welcome { client_id: Some(id), .. })) => {
            assert_eq!(id, handle.client_id())
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    handle.send(ClientFrame::Ping).unwrap();
    assert_eq!(next(&mut events).await, Some(SocketEvent::Frame(ServerFrame::Pong)));
    assert_eq!(stats.sockets(), 1);
}

#[tokio::test]
async fn test_close_stops_reconnecting() {
    let (addr, stats) = start(MockReply::default()).await;
    let (handle, mut events) = socket::spawn(socket_config(addr, 5));
    connected(&mut events).await;

    handle.close();
    loop {
        match next(&mut events).await {
            Some(SocketEvent::Disconnected) => break,
            Some(SocketEvent::Frame(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(next(&mut events).await, None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stats.sockets(), 1);
    assert!(!handle.is_connected());
    assert!(handle.send(ClientFrame::Ping).is_err());
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    // Accepts TCP and hangs up at once, so every handshake fails.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let (_handle, mut events) = socket::spawn(socket_config(addr, 3));
    let mut delays = Vec::new();
    loop {
        match next(&mut events).await {
            Some(SocketEvent::Reconnecting { attempt, delay }) => delays.push((attempt, delay)),
            Some(SocketEvent::GaveUp { attempts }) => {
                assert_eq!(attempts, 3);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(10)),
            (2, Duration::from_millis(20)),
            (3, Duration::from_millis(30)),
        ]
    );
    assert_eq!(next(&mut events).await, None);
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_server_drop_after_open_restarts_attempt_count() {
    // Upgrades the first two connections and hangs up on each; keeps the third.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        }
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = futures_util::StreamExt::next(&mut ws).await {}
    });

    // A budget of one reconnect: a second drop only recovers if the count restarted.
    let (handle, mut events) = socket::spawn(socket_config(addr, 1));
    for _ in 0..2 {
        connected(&mut events).await;
        assert_eq!(next(&mut events).await, Some(SocketEvent::Disconnected));
        assert_eq!(
            next(&mut events).await,
            Some(SocketEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(10),
            })
        );
    }
    connected(&mut events).await;
    assert!(handle.is_connected());
    handle.close();
}

async fn socket_session(addr: std::net::SocketAddr) -> (ChatSession, SocketHandle, UnboundedReceiver<SocketEvent>) {
    let cfg = ChatConfig {
        api: ApiConfig {
            base_url: format!("http://{addr}"),
            ..ApiConfig::default()
        },
        socket: socket_config(addr, 1),
        ..ChatConfig::default()
    };
    let (handle, mut events) = socket::spawn(cfg.socket.clone());
    connected(&mut events).await;
    let session = ChatSession::new(cfg)
        .unwrap()
        .with_transport(Transport::Socket(handle.clone()));
    (session, handle, events)
}

async fn pump_until_idle(session: &mut ChatSession, events: &mut UnboundedReceiver<SocketEvent>) {
    while session.transcript().is_busy() {
        match next(events).await {
            Some(ev) => session.handle_socket_event(ev),
            None => break,
        }
    }
}

#[tokio::test]
async fn test_socket_answer_streams_into_transcript() {
    let reply = MockReply::default();
    let (addr, stats) = start(reply.clone()).await;
    let (mut session, _handle, mut events) = socket_session(addr).await;

    let outcome = session.send("分析贵州茅台的财务健康度").await;
    let SendOutcome::Dispatched(id) = outcome else { panic!("got {outcome:?}") };
    assert!(session.transcript().is_busy());

    pump_until_idle(&mut session, &mut events).await;
    let m = session.transcript().get(&id).unwrap();
    assert_eq!(m.content, reply.answer);
    assert!(m.has_sources());
    assert!(!m.is_streaming);
    assert_eq!(stats.queries(), 1);
}

#[tokio::test]
async fn test_socket_backend_error_fails_message() {
    let reply = MockReply {
        fail_with: Some((500, "agent unavailable".into())),
        ..MockReply::default()
    };
    let (addr, _) = start(reply).await;
    let (mut session, _handle, mut events) = socket_session(addr).await;

    let SendOutcome::Dispatched(id) = session.send("茅台").await else { panic!() };
    pump_until_idle(&mut session, &mut events).await;
    let m = session.transcript().get(&id).unwrap();
    assert!(m.is_error);
    assert_eq!(m.content, "⚠️ agent unavailable");
}

#[tokio::test]
async fn test_socket_busy_until_answered() {
    let (addr, _) = start(MockReply::default()).await;
    let (mut session, _handle, mut events) = socket_session(addr).await;

    assert!(matches!(session.send("第一个问题").await, SendOutcome::Dispatched(_)));
    assert!(matches!(session.send("第二个问题").await, SendOutcome::Ignored(_)));
    pump_until_idle(&mut session, &mut events).await;
    assert!(matches!(session.send("第二个问题").await, SendOutcome::Dispatched(_)));
}
