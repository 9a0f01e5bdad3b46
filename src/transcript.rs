//! Ordered chat transcript and the state machine that merges answers into it.
//!
//! ## Message lifecycle
//! 1. `push_user` appends the trimmed question (empty input changes nothing).
//! 2. `begin_assistant` appends an empty streaming placeholder and marks it pending.
//! 3. `set_content` / `append_delta` fill the placeholder while it streams.
//! 4. `finish`, `fail` or `cancel` end streaming and clear the pending mark.
//!
//! Socket frames are merged with `apply_frame`. A frame is routed to the
//! message named by its `message_id`, else to the message bound to its
//! `query_id` by an earlier `processing` frame, else to the oldest pending
//! message.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::message::{Message, MessageId, Role};
use crate::protocol::{ServerFrame, Sources};

/// Marker appended to an answer whose reveal was stopped early.
pub const INTERRUPTED_MARKER: &str = "\n\n*(interrupted)*";

/// What a call to [`Transcript::apply_frame`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEffect {
    /// Content of the message changed; it is still streaming.
    Updated(MessageId),
    /// The message reached a final state.
    Finished(MessageId),
    /// Nothing in the transcript changed.
    Ignored,
}

#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
    /// Assistant messages awaiting an answer, oldest first.
    pending: VecDeque<MessageId>,
    /// Backend query ids learned from `processing` frames.
    query_ids: HashMap<String, MessageId>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.messages[i]),
            None => None,
        }
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// Assistant messages that carry a source payload, in transcript order.
    pub fn with_sources(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.has_sources())
    }

    /// A request is in flight: new questions must wait.
    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &MessageId> {
        self.pending.iter()
    }

    /// Append a message, refusing ids already in the transcript.
    pub fn insert(&mut self, message: Message) -> Option<MessageId> {
        if self.index.contains_key(&message.id) {
            warn!(id = %message.id, "refusing duplicate message id");
            return None;
        }
        let id = message.id.clone();
        self.index.insert(id.clone(), self.messages.len());
        self.messages.push(message);
        Some(id)
    }

    /// Append the user's question. Whitespace-only input is a no-op.
    pub fn push_user(&mut self, input: &str) -> Option<MessageId> {
        let text = input.trim();
        if text.is_empty() {
            return None;
        }
        self.insert(Message::user(text))
    }

    /// Append an empty streaming assistant message and mark it pending.
    pub fn begin_assistant(&mut self) -> MessageId {
        loop {
            if let Some(id) = self.insert(Message::assistant_placeholder()) {
                self.pending.push_back(id.clone());
                return id;
            }
        }
    }

    fn streaming_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        match self.get_mut(id) {
            Some(msg) if msg.is_streaming => Some(msg),
            Some(_) => {
                debug!(id = %id, "update for finished message ignored");
                None
            }
            None => {
                debug!(id = %id, "update for unknown message ignored");
                None
            }
        }
    }

    /// Replace the visible content of a streaming message.
    pub fn set_content(&mut self, id: &MessageId, content: &str) -> bool {
        match self.streaming_mut(id) {
            Some(msg) => {
                msg.content.clear();
                msg.content.push_str(content);
                true
            }
            None => false,
        }
    }

    pub fn append_delta(&mut self, id: &MessageId, delta: &str) -> bool {
        match self.streaming_mut(id) {
            Some(msg) => {
                msg.content.push_str(delta);
                true
            }
            None => false,
        }
    }

    fn settle(&mut self, id: &MessageId) {
        self.pending.retain(|p| p != id);
        self.query_ids.retain(|_, m| m != id);
    }

    /// Mark a message complete and attach its sources.
    pub fn finish(&mut self, id: &MessageId, sources: Option<Sources>) -> bool {
        let Some(msg) = self.streaming_mut(id) else {
            return false;
        };
        msg.is_streaming = false;
        msg.sources = sources.filter(|s| !s.is_empty());
        self.settle(id);
        true
    }

    /// Replace the message with a failure bubble.
    pub fn fail(&mut self, id: &MessageId, text: &str) -> bool {
        let Some(msg) = self.streaming_mut(id) else {
            return false;
        };
        msg.content = text.to_string();
        msg.is_streaming = false;
        msg.is_error = true;
        self.settle(id);
        true
    }

    /// Attach sources to a message in any state.
    pub fn attach_sources(&mut self, id: &MessageId, sources: Option<Sources>) -> bool {
        match self.get_mut(id) {
            Some(msg) => {
                msg.sources = sources.filter(|s| !s.is_empty());
                true
            }
            None => false,
        }
    }

    /// Stop a message mid-stream, keeping what was shown so far.
    pub fn cancel(&mut self, id: &MessageId) -> bool {
        let Some(msg) = self.streaming_mut(id) else {
            return false;
        };
        msg.content.push_str(INTERRUPTED_MARKER);
        msg.is_streaming = false;
        self.settle(id);
        true
    }

    /// Fail every pending message, e.g. when the socket gives up.
    pub fn fail_all_pending(&mut self, text: &str) -> Vec<MessageId> {
        let ids: Vec<MessageId> = self.pending.iter().cloned().collect();
        for id in &ids {
            self.fail(id, text);
        }
        ids
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.pending.clear();
        self.query_ids.clear();
    }

    fn resolve(&self, frame: &ServerFrame) -> Option<MessageId> {
        if let Some(mid) = frame.message_id() {
            let id = MessageId::from(mid);
            return self.index.contains_key(&id).then_some(id);
        }
        if let Some(qid) = frame.query_id() {
            if let Some(id) = self.query_ids.get(qid) {
                return Some(id.clone());
            }
        }
        self.pending.front().cloned()
    }

    /// Merge one socket frame into the transcript.
    pub fn apply_frame(&mut self, frame: &ServerFrame) -> FrameEffect {
        let target = match frame {
            ServerFrame::Welcome { .. } | ServerFrame::Pong | ServerFrame::Unknown => {
                return FrameEffect::Ignored
            }
            _ => self.resolve(frame),
        };
        let Some(id) = target else {
            debug!(?frame, "frame matches no message");
            return FrameEffect::Ignored;
        };

        let changed = match frame {
            ServerFrame::Processing { query_id, .. } => {
                // Bind the query id to the oldest pending message without one.
                if let Some(qid) = query_id {
                    let unbound = self
                        .pending
                        .iter()
                        .find(|p| !self.query_ids.values().any(|m| m == *p))
                        .cloned();
                    let bind_to = if frame.message_id().is_some() { Some(id.clone()) } else { unbound };
                    if let Some(m) = bind_to {
                        self.query_ids.insert(qid.clone(), m);
                    }
                }
                return FrameEffect::Ignored;
            }
            ServerFrame::Stream { content, .. } => {
                return if self.append_delta(&id, content) {
                    FrameEffect::Updated(id)
                } else {
                    FrameEffect::Ignored
                };
            }
            ServerFrame::Complete { content, sources, .. } => {
                if let Some(full) = content {
                    self.set_content(&id, full);
                }
                self.finish(&id, sources.clone())
            }
            ServerFrame::Result {
                success,
                answer,
                sources,
                error,
                ..
            } => {
                if *success == Some(false) {
                    let text = crate::error::ChatError::Application(error.clone().unwrap_or_default())
                        .user_message();
                    self.fail(&id, &text)
                } else {
                    self.set_content(&id, answer.as_deref().unwrap_or_default());
                    self.finish(&id, sources.clone())
                }
            }
            ServerFrame::AnalysisResult {
                success,
                answer,
                report,
                data,
                analysis_type,
                error,
                ..
            } => {
                if *success == Some(false) {
                    let text = crate::error::ChatError::Application(error.clone().unwrap_or_default())
                        .user_message();
                    self.fail(&id, &text)
                } else {
                    let body = answer.as_deref().or(report.as_deref()).unwrap_or_default();
                    self.set_content(&id, body);
                    let sources = data.as_ref().map(|d| {
                        let mut s = Sources::default();
                        let key = analysis_type.clone().unwrap_or_else(|| "analysis".to_string());
                        s.extra.insert(key, d.clone());
                        s
                    });
                    self.finish(&id, sources)
                }
            }
            ServerFrame::Error { error, message, .. } => {
                let detail = error.clone().or_else(|| message.clone()).unwrap_or_default();
                self.fail(&id, &crate::error::ChatError::Application(detail).user_message())
            }
            ServerFrame::Welcome { .. } | ServerFrame::Pong | ServerFrame::Unknown => false,
        };

        if changed {
            FrameEffect::Finished(id)
        } else {
            FrameEffect::Ignored
        }
    }
}
