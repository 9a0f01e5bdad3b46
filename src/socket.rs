//! Reconnecting WebSocket client for the query service.
//!
//! ## Design
//! - One background task owns the connection and the reconnect loop.
//! - The [`SocketHandle`] talks to it over an unbounded command channel.
//! - Everything the task observes is reported as a [`SocketEvent`].
//!
//! ## Reconnect policy
//! After a dropped or failed connection the task waits `base_delay * n`
//! before reconnect attempt `n` (1-based). A successful open resets the
//! count. Once `max_attempts` reconnects have failed in a row it emits
//! [`SocketEvent::GaveUp`] and exits; the socket stays down for good.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::config::SocketConfig;
use crate::error::{ChatError, Result};
use crate::protocol::{ClientFrame, ServerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &SocketConfig) -> Self {
        Self {
            max_attempts: cfg.max_reconnect_attempts,
            base_delay: Duration::from_millis(cfg.reconnect_delay_ms),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// the attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(attempt))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected { client_id: String },
    Frame(ServerFrame),
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Permanent disconnect; no further events follow.
    GaveUp { attempts: u32 },
}

#[derive(Debug)]
enum Command {
    Send(ClientFrame),
    Close,
}

/// Handle to a running socket task. Dropping every handle closes the socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    client_id: String,
}

impl SocketHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue a frame. Fails with `NotConnected` unless the socket is open.
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| ChatError::NotConnected)
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Generate a random 8-character lowercase alphanumeric client id.
pub fn generate_client_id() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Start the socket task. Must be called inside a tokio runtime.
pub fn spawn(cfg: SocketConfig) -> (SocketHandle, mpsc::UnboundedReceiver<SocketEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    let client_id = generate_client_id();

    let handle = SocketHandle {
        commands: cmd_tx,
        connected: Arc::clone(&connected),
        client_id: client_id.clone(),
    };

    tokio::spawn(run(cfg, client_id, cmd_rx, event_tx, connected));
    (handle, event_rx)
}

async fn run(
    cfg: SocketConfig,
    client_id: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SocketEvent>,
    connected: Arc<AtomicBool>,
) {
    let url = cfg.url.replace("{client_id}", &client_id);
    let policy = ReconnectPolicy::from_config(&cfg);
    let heartbeat = Duration::from_secs(cfg.heartbeat_secs);
    let mut attempts: u32 = 0;

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                info!(url = %url, "WebSocket connected");
                attempts = 0;
                connected.store(true, Ordering::Release);
                let _ = events.send(SocketEvent::Connected {
                    client_id: client_id.clone(),
                });

                let closed_by_client = serve_connection(ws, &mut commands, &events, heartbeat).await;

                connected.store(false, Ordering::Release);
                let _ = events.send(SocketEvent::Disconnected);
                if closed_by_client {
                    info!(url = %url, "WebSocket closed by client");
                    return;
                }
                info!(url = %url, "WebSocket disconnected");
            }
            Err(e) => {
                warn!(error = %e, url = %url, attempt = attempts, "WebSocket connect failed");
            }
        }

        attempts = attempts.saturating_add(1);
        let Some(delay) = policy.delay_for(attempts) else {
            error!(url = %url, attempts = policy.max_attempts, "giving up on WebSocket");
            let _ = events.send(SocketEvent::GaveUp {
                attempts: policy.max_attempts,
            });
            return;
        };
        info!(attempt = attempts, max = policy.max_attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        let _ = events.send(SocketEvent::Reconnecting {
            attempt: attempts,
            delay,
        });
        if !wait_unless_closed(delay, &mut commands).await {
            return;
        }
    }
}

/// Sleep for `delay`, returning `false` early if the client closes.
async fn wait_unless_closed(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            cmd = commands.recv() => match cmd {
                Some(Command::Send(frame)) => {
                    warn!(?frame, "dropping frame sent while disconnected");
                }
                Some(Command::Close) | None => return false,
            }
        }
    }
}

/// Pump one open connection. Returns `true` when the client asked to close.
async fn serve_connection<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<SocketEvent>,
    heartbeat: Duration,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let heartbeat_on = !heartbeat.is_zero();
    let period = if heartbeat_on { heartbeat } else { Duration::from_secs(3600) };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            let _ = events.send(SocketEvent::Frame(frame));
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable server frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read failed");
                        return false;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Send(frame)) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(error = %e, "could not encode client frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            warn!(error = %e, "WebSocket write failed");
                            return false;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return true;
                    }
                }
            }
            _ = ticker.tick(), if heartbeat_on => {
                debug!("sending heartbeat");
                if let Ok(text) = serde_json::to_string(&ClientFrame::Ping) {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
