//! Client-facing stream consumer: owns one in-flight turn at a time, folds
//! normalized events into the active session, and reports exactly one
//! terminal outcome per turn.

use crate::client::ProviderClient;
use crate::constants::{CANCELLED_NOTICE, ERROR_NOTICE_PREFIX};
use crate::detector;
use crate::logging::TurnMetric;
use crate::normalizer;
use crate::session::Session;
use crate::types::{
    ChatError, ConversationId, FileAttachment, Result, StreamEvent, TurnRequest,
};
use futures_util::{Stream, StreamExt};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Complete { cancelled: bool },
    Error { message: String },
}

/// Turn-local accumulation. The accumulator snapshot always re-derives the
/// full visible string; nothing is appended piecemeal, so the authoritative
/// `complete` text can override it wholesale.
#[derive(Default)]
struct TurnState {
    accumulator: String,
    thinking: String,
    files: Vec<FileAttachment>,
    detected: Vec<FileAttachment>,
    metric: TurnMetric,
}

impl TurnState {
    fn file_urls(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|f| f.source.url().map(String::from))
            .collect()
    }

    fn merged_attachments(&self) -> Vec<FileAttachment> {
        let mut all = self.files.clone();
        all.extend(self.detected.iter().cloned());
        detector::dedup_by_url(all)
    }

    /// What the user sees while the turn is still streaming. Thinking text is
    /// shown, but it never enters the accumulator.
    fn visible(&self) -> String {
        let answer = detector::suppress_inline_images(&self.accumulator, &self.file_urls());
        if self.thinking.is_empty() {
            answer
        } else if answer.is_empty() {
            self.thinking.clone()
        } else {
            format!("{}\n\n{}", self.thinking, answer)
        }
    }
}

pub struct StreamConsumer {
    phase: TurnPhase,
    cancel: CancellationToken,
    tx_events: Option<mpsc::Sender<StreamEvent>>,
    pending_resend: Option<TurnRequest>,
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self {
            phase: TurnPhase::Idle,
            cancel: CancellationToken::new(),
            tx_events: None,
            pending_resend: None,
        }
    }

    /// Attaches the channel the surrounding UI consumes normalized events on.
    pub fn with_event_sink(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx_events: Some(tx),
            ..Self::new()
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Handle for cooperative cancellation of the current turn.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// One-shot resend buffer: after a failed turn, the original prompt and
    /// attachments are available for a user-initiated retry.
    pub fn take_resend(&mut self) -> Option<TurnRequest> {
        self.pending_resend.take()
    }

    /// Validates the send preconditions, appends the user message and the
    /// provisional assistant message, and builds the outbound request
    /// carrying the session's stored conversation identity.
    pub fn begin_turn(
        &mut self,
        session: &mut Session,
        prompt: impl Into<String>,
        files: Vec<FileAttachment>,
    ) -> Result<TurnRequest> {
        if matches!(self.phase, TurnPhase::Sending | TurnPhase::Streaming)
            || session.has_streaming_message()
        {
            return Err(ChatError::TurnInFlight.into());
        }
        let prompt: String = prompt.into();
        if prompt.trim().is_empty() && files.is_empty() {
            return Err(ChatError::EmptyTurn.into());
        }

        self.pending_resend = None;
        session
            .messages
            .push(crate::session::Message::user(prompt.clone(), files.clone()));
        session.messages.push(crate::session::Message::assistant_streaming());
        session.touch();
        self.phase = TurnPhase::Sending;

        Ok(TurnRequest::new(prompt)
            .with_conversation(session.conversation_id.clone())
            .with_files(files))
    }

    /// Runs one full turn against the upstream: request, stream, terminal
    /// outcome. Classified upstream failures end the turn, they do not error
    /// the call; `Err` is reserved for precondition violations.
    pub async fn send_turn(
        &mut self,
        client: &ProviderClient,
        session: &mut Session,
        prompt: impl Into<String>,
        files: Vec<FileAttachment>,
    ) -> Result<TurnOutcome> {
        let request = self.begin_turn(session, prompt, files)?;
        tracing::info!(
            "[CONSUMER] Sending turn (conversation: {})",
            request
                .conversation_id
                .as_ref()
                .map(|c| c.short().to_string())
                .unwrap_or_else(|| "new".to_string())
        );

        match client.send_chat(&request).await {
            Ok(bytes) => {
                let events = normalizer::event_stream(bytes, client.base_url());
                self.consume_events(session, request, events).await
            }
            Err(e) => {
                tracing::error!("[CONSUMER] Request pipeline failed: {}", e.inner);
                let message = e.inner.user_message();
                let mut state = TurnState::default();
                Ok(self
                    .finish_error(session, &request, &mut state, message, Instant::now(), true)
                    .await)
            }
        }
    }

    /// Drives an already-started turn from a stream of normalized events.
    /// Events are applied strictly in arrival order.
    pub async fn consume_events<S>(
        &mut self,
        session: &mut Session,
        request: TurnRequest,
        mut events: S,
    ) -> Result<TurnOutcome>
    where
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        if self.phase != TurnPhase::Sending {
            return Err(
                ChatError::Internal("consume_events called without begin_turn".to_string()).into(),
            );
        }

        let started = Instant::now();
        let mut state = TurnState::default();
        let cancel = self.cancel.clone();

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("[CONSUMER] Turn cancelled by user");
                    return Ok(self
                        .finish_complete(session, &mut state, String::new(), Vec::new(), None, true, true, started)
                        .await);
                }
                item = events.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    self.phase = TurnPhase::Streaming;
                    state.metric.record(&event);
                    self.emit(&event).await;
                    match event {
                        StreamEvent::Complete {
                            text,
                            attachments,
                            conversation_id,
                        } => {
                            return Ok(self
                                .finish_complete(
                                    session,
                                    &mut state,
                                    text,
                                    attachments,
                                    conversation_id,
                                    false,
                                    false,
                                    started,
                                )
                                .await);
                        }
                        StreamEvent::Error { message, .. } => {
                            return Ok(self
                                .finish_error(session, &request, &mut state, message, started, false)
                                .await);
                        }
                        other => self.apply_streaming_event(session, &mut state, other),
                    }
                }
                Some(Err(e)) => {
                    tracing::error!("[CONSUMER] Transport failure mid-turn: {}", e.inner);
                    let message = e.inner.user_message();
                    return Ok(self
                        .finish_error(session, &request, &mut state, message, started, true)
                        .await);
                }
                None => {
                    // Upstream closed without a terminal record; treat like a
                    // clean end of turn with whatever accumulated.
                    tracing::warn!("[CONSUMER] Upstream closed the stream without a terminal record");
                    return Ok(self
                        .finish_complete(session, &mut state, String::new(), Vec::new(), None, false, true, started)
                        .await);
                }
            }
        }
    }

    fn apply_streaming_event(
        &mut self,
        session: &mut Session,
        state: &mut TurnState,
        event: StreamEvent,
    ) {
        match event {
            StreamEvent::Content { delta, .. } => {
                state.accumulator.push_str(&delta);
                // Replace, never append: partial matches from earlier
                // snapshots must not linger as duplicates.
                state.detected = detector::detect_attachments(&state.accumulator);
            }
            StreamEvent::Thinking { delta, .. } => state.thinking.push_str(&delta),
            StreamEvent::File { attachment, .. } => {
                state.files.push(attachment);
                state.files = detector::dedup_by_url(std::mem::take(&mut state.files));
            }
            StreamEvent::Complete { .. } | StreamEvent::Error { .. } => {}
        }

        if let Some(message) = session.streaming_message_mut() {
            message.content = state.visible();
            message.attachments = state.merged_attachments();
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_complete(
        &mut self,
        session: &mut Session,
        state: &mut TurnState,
        text: String,
        event_attachments: Vec<FileAttachment>,
        conversation_id: Option<ConversationId>,
        cancelled: bool,
        synthesize_event: bool,
        started: Instant,
    ) -> TurnOutcome {
        let base_text = if text.is_empty() {
            state.accumulator.clone()
        } else {
            text
        };
        let mut final_text = detector::suppress_inline_images(&base_text, &state.file_urls());
        if cancelled {
            final_text.push_str(CANCELLED_NOTICE);
        }

        let mut attachments = state.files.clone();
        attachments.extend(event_attachments);
        attachments.extend(detector::detect_attachments(&final_text));
        let attachments = detector::dedup_by_url(attachments);

        if let Some(message) = session.streaming_message_mut() {
            message.content = final_text.clone();
            message.attachments = attachments.clone();
            message.streaming = false;
            message.error = false;
        }
        if let Some(id) = conversation_id.clone() {
            session.adopt_identity(id);
        }
        session.touch();

        if synthesize_event {
            self.emit(&StreamEvent::Complete {
                text: final_text,
                attachments,
                conversation_id: conversation_id.or_else(|| session.conversation_id.clone()),
            })
            .await;
        }

        state.metric.log_summary(started.elapsed());
        self.phase = TurnPhase::Complete;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        TurnOutcome::Complete { cancelled }
    }

    /// A failed turn keeps its partial content: whatever the model already
    /// produced stays visible, with the error notice appended.
    async fn finish_error(
        &mut self,
        session: &mut Session,
        request: &TurnRequest,
        state: &mut TurnState,
        message: String,
        started: Instant,
        synthesize_event: bool,
    ) -> TurnOutcome {
        let content = if state.accumulator.is_empty() {
            format!("[error] {}", message)
        } else {
            format!("{}{}{}", state.accumulator, ERROR_NOTICE_PREFIX, message)
        };

        if let Some(msg) = session.streaming_message_mut() {
            msg.content = content;
            msg.attachments = state.merged_attachments();
            msg.streaming = false;
            msg.error = true;
        }
        session.touch();
        self.pending_resend = Some(request.clone());

        if synthesize_event {
            self.emit(&StreamEvent::Error {
                message: message.clone(),
                conversation_id: session.conversation_id.clone(),
            })
            .await;
        }

        state.metric.log_summary(started.elapsed());
        self.phase = TurnPhase::Error;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        TurnOutcome::Error { message }
    }

    async fn emit(&self, event: &StreamEvent) {
        if let Some(tx) = &self.tx_events {
            if tx.send(event.clone()).await.is_err() {
                tracing::trace!("UI receiver dropped; continuing without event sink");
            }
        }
    }
}
