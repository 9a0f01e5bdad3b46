//! Chat session: transcript plus the transport that answers questions.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::QueryClient;
use crate::config::ChatConfig;
use crate::detect::detect_query_type;
use crate::error::{ChatError, Result};
use crate::message::{Message, MessageId};
use crate::protocol::{ClientFrame, QueryRequest, QueryType, Sources, StreamEvent};
use crate::socket::{SocketEvent, SocketHandle};
use crate::streaming::{reveal, stop_pair, RevealOutcome, StopHandle};
use crate::transcript::{FrameEffect, Transcript};

/// Canned questions offered as shortcuts: `(label, question)`.
pub const QUICK_ACTIONS: &[(&str, &str)] = &[
    ("Moutai financial health", "分析贵州茅台的财务健康度"),
    ("Moutai money flow", "茅台最近的主力资金流向"),
    ("Ping An technicals", "平安银行的技术走势分析"),
    ("Market cap top 10", "A股市值排名前10"),
];

pub const WELCOME: &str = "Hello! I am the stock analysis assistant. I can help with:

- **Financial analysis**: health scores, DuPont analysis, cash flow quality
- **Technical analysis**: trends, indicators, trading signals
- **Money flow**: main-force capital, extra-large orders, four-tier distribution

Ask about a stock, for example \"分析贵州茅台的财务健康度\".";

const NO_ANSWER: &str = "Sorry, no answer was returned.";

/// How questions reach the backend.
#[derive(Debug, Clone)]
pub enum Transport {
    /// `POST /query`, then a simulated reveal of the answer.
    Http,
    /// `POST /query/stream`, chunks shown as they arrive.
    HttpStream,
    /// Frames over a reconnecting WebSocket; answers arrive as [`SocketEvent`]s.
    Socket(SocketHandle),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::HttpStream => "stream",
            Transport::Socket(_) => "socket",
        }
    }
}

/// Changes a renderer needs to follow the transcript.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessageAdded(Message),
    ContentUpdated { id: MessageId, content: String },
    MessageFinished(Message),
    Status(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Empty,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was added to the transcript.
    Ignored(IgnoreReason),
    Answered(MessageId),
    Failed(MessageId),
    Cancelled(MessageId),
    /// Sent over the socket; the answer arrives later.
    Dispatched(MessageId),
}

fn emit(events: &Option<mpsc::UnboundedSender<SessionEvent>>, event: SessionEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

pub struct ChatSession {
    transcript: Transcript,
    client: QueryClient,
    transport: Transport,
    config: ChatConfig,
    fixed_type: Option<QueryType>,
    stop: StopHandle,
    /// Skip the simulated reveal and show answers at once.
    pub instant: bool,
    /// When set, session events are sent here for rendering.
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Result<Self> {
        config.validate()?;
        let fixed_type = config.query.fixed_type()?;
        let (stop, _signal) = stop_pair();
        Ok(Self {
            transcript: Transcript::new(),
            client: QueryClient::new(config.api.clone()),
            transport: Transport::Http,
            config,
            fixed_type,
            stop,
            instant: false,
            events: None,
        })
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Handle that stops the current request or reveal.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn set_query_type(&mut self, query_type: Option<QueryType>) {
        self.fixed_type = query_type;
    }

    pub fn query_type_for(&self, question: &str) -> QueryType {
        self.fixed_type.unwrap_or_else(|| detect_query_type(question))
    }

    fn add(&mut self, message: Message) -> Option<MessageId> {
        let snapshot = message.clone();
        let id = self.transcript.insert(message)?;
        emit(&self.events, SessionEvent::MessageAdded(snapshot));
        Some(id)
    }

    /// Announce a settled answer. Once nothing is pending the stop signal is
    /// re-armed, so a stop pressed before or during a request applies to it.
    fn finished(&self, id: &MessageId) {
        if let Some(msg) = self.transcript.get(id) {
            emit(&self.events, SessionEvent::MessageFinished(msg.clone()));
        }
        if !self.transcript.is_busy() {
            self.stop.reset();
        }
    }

    /// Add the assistant's greeting.
    pub fn push_welcome(&mut self) {
        self.add(Message::assistant(WELCOME));
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
    }

    /// Probe `/health` and add an error bubble when the backend is down.
    pub async fn check_health(&mut self) -> bool {
        let healthy = self.client.is_healthy().await;
        if !healthy {
            warn!(url = %self.client.base_url(), "query service is not healthy");
            self.add(Message::error(format!(
                "{} API service connection failed. Make sure the backend is running.",
                crate::error::WARNING_GLYPH
            )));
        }
        healthy
    }

    /// Ask a question. Empty input, or input while a request is pending,
    /// changes nothing.
    pub async fn send(&mut self, input: &str) -> SendOutcome {
        let question = input.trim();
        if question.is_empty() {
            return SendOutcome::Ignored(IgnoreReason::Empty);
        }
        if self.transcript.is_busy() {
            debug!("request in flight, ignoring input");
            return SendOutcome::Ignored(IgnoreReason::Busy);
        }

        if self.add(Message::user(question)).is_none() {
            return SendOutcome::Ignored(IgnoreReason::Empty);
        }
        let id = self.transcript.begin_assistant();
        if let Some(placeholder) = self.transcript.get(&id) {
            emit(&self.events, SessionEvent::MessageAdded(placeholder.clone()));
        }

        let request = QueryRequest {
            question: question.to_string(),
            query_type: self.query_type_for(question),
            top_k: self.config.query.top_k,
        };
        info!(query_type = %request.query_type, transport = self.transport.name(), "sending question");

        let outcome = match self.transport.clone() {
            Transport::Http => self.answer_http(&id, &request).await,
            Transport::HttpStream => self.answer_stream(&id, &request).await,
            Transport::Socket(handle) => self.dispatch_socket(&id, &request, &handle),
        };
        if !matches!(outcome, SendOutcome::Dispatched(_)) {
            self.finished(&id);
        }
        outcome
    }

    async fn answer_http(&mut self, id: &MessageId, request: &QueryRequest) -> SendOutcome {
        let mut signal = self.stop.signal();
        let result = tokio::select! {
            r = self.client.query(request) => Some(r),
            _ = signal.stopped() => None,
        };
        let response = match result {
            None => {
                self.transcript.cancel(id);
                return SendOutcome::Cancelled(id.clone());
            }
            Some(Err(e)) => return self.fail(id, &e),
            Some(Ok(resp)) => resp,
        };

        let answer = response
            .answer
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| NO_ANSWER.to_string());

        match self.reveal_into(id, &answer).await {
            RevealOutcome::Completed => {
                self.transcript.set_content(id, &answer);
                self.transcript.finish(id, response.sources);
                SendOutcome::Answered(id.clone())
            }
            RevealOutcome::Cancelled { shown } => {
                debug!(shown, total = answer.chars().count(), "reveal cancelled");
                self.transcript.attach_sources(id, response.sources);
                self.transcript.cancel(id);
                SendOutcome::Cancelled(id.clone())
            }
        }
    }

    async fn reveal_into(&mut self, id: &MessageId, answer: &str) -> RevealOutcome {
        if self.instant {
            return RevealOutcome::Completed;
        }
        let signal = self.stop.signal();
        let cfg = self.config.streaming;
        let transcript = &mut self.transcript;
        let events = &self.events;
        reveal(answer, cfg, signal, |frame| {
            if transcript.set_content(id, frame) {
                emit(
                    events,
                    SessionEvent::ContentUpdated {
                        id: id.clone(),
                        content: frame.to_string(),
                    },
                );
            }
        })
        .await
    }

    async fn answer_stream(&mut self, id: &MessageId, request: &QueryRequest) -> SendOutcome {
        let mut signal = self.stop.signal();
        let mut sources: Option<Sources> = None;
        let result = {
            let transcript = &mut self.transcript;
            let events = &self.events;
            let sources = &mut sources;
            let on_event = |event: StreamEvent| match event {
                StreamEvent::Chunk { content } => {
                    if transcript.append_delta(id, &content) {
                        if let Some(msg) = transcript.get(id) {
                            emit(
                                events,
                                SessionEvent::ContentUpdated {
                                    id: id.clone(),
                                    content: msg.content.clone(),
                                },
                            );
                        }
                    }
                }
                StreamEvent::Complete { sources: s, .. } => *sources = s,
                StreamEvent::Start { .. } | StreamEvent::Error { .. } | StreamEvent::Unknown => {}
            };
            tokio::select! {
                r = self.client.query_stream(request, on_event) => Some(r),
                _ = signal.stopped() => None,
            }
        };

        match result {
            None => {
                self.transcript.attach_sources(id, sources);
                self.transcript.cancel(id);
                SendOutcome::Cancelled(id.clone())
            }
            Some(Err(e)) => self.fail(id, &e),
            Some(Ok(())) => {
                let empty = self.transcript.get(id).map_or(true, |m| m.content.trim().is_empty());
                if empty {
                    self.transcript.set_content(id, NO_ANSWER);
                }
                self.transcript.finish(id, sources);
                SendOutcome::Answered(id.clone())
            }
        }
    }

    fn dispatch_socket(&mut self, id: &MessageId, request: &QueryRequest, handle: &SocketHandle) -> SendOutcome {
        let frame = ClientFrame::Query {
            question: request.question.clone(),
            message_id: id.to_string(),
            query_type: Some(request.query_type),
        };
        match handle.send(frame) {
            Ok(()) => SendOutcome::Dispatched(id.clone()),
            Err(e) => self.fail(id, &e),
        }
    }

    fn fail(&mut self, id: &MessageId, error: &ChatError) -> SendOutcome {
        warn!(error = %error, "query failed");
        self.transcript.fail(id, &error.user_message());
        SendOutcome::Failed(id.clone())
    }

    /// Stop every answer still awaited over the socket, keeping what arrived.
    pub fn cancel_pending(&mut self) -> Vec<MessageId> {
        let ids: Vec<MessageId> = self.transcript.pending().cloned().collect();
        for id in &ids {
            self.transcript.cancel(id);
            self.finished(id);
        }
        ids
    }

    /// Fail every pending answer with `error`.
    pub fn abandon_pending(&mut self, error: &ChatError) -> Vec<MessageId> {
        let ids = self.transcript.fail_all_pending(&error.user_message());
        for id in &ids {
            self.finished(id);
        }
        ids
    }

    /// Merge one socket event into the transcript.
    pub fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Frame(frame) => match self.transcript.apply_frame(&frame) {
                FrameEffect::Updated(id) => {
                    if let Some(msg) = self.transcript.get(&id) {
                        emit(
                            &self.events,
                            SessionEvent::ContentUpdated {
                                id: id.clone(),
                                content: msg.content.clone(),
                            },
                        );
                    }
                }
                FrameEffect::Finished(id) => self.finished(&id),
                FrameEffect::Ignored => {}
            },
            SocketEvent::Connected { client_id } => {
                emit(&self.events, SessionEvent::Status(format!("connected as {client_id}")));
            }
            SocketEvent::Disconnected => {
                emit(&self.events, SessionEvent::Status("disconnected".to_string()));
            }
            SocketEvent::Reconnecting { attempt, delay } => {
                let max = self.config.socket.max_reconnect_attempts;
                emit(
                    &self.events,
                    SessionEvent::Status(format!(
                        "reconnecting ({attempt}/{max}) in {} ms",
                        delay.as_millis()
                    )),
                );
            }
            SocketEvent::GaveUp { attempts } => {
                let error = ChatError::ReconnectExhausted { attempts };
                self.abandon_pending(&error);
                emit(&self.events, SessionEvent::Status(error.user_message()));
            }
        }
    }
}
