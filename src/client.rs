use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::domains::conversation::{Message, MessageRole, Transcript};
use crate::error::{Result, TutorRelayError};
use crate::services::relay::ChatStreamRequest;
use crate::stream::{parse_frame, ErrorBody, FrameDecoder, FrameOutcome, TurnAssembler};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Settled,
    Errored,
}

impl TurnState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

/// Published after every transcript mutation so views can re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Upserted(Message),
    StateChanged(TurnState),
    Banner(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub state: TurnState,
    /// Set when at least one delta arrived, even if the turn later failed.
    pub assistant_message_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSummary {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Deserialize)]
struct RolesResponse {
    roles: Vec<RoleSummary>,
}

#[derive(Debug)]
struct SessionState {
    transcript: Transcript,
    turn: TurnState,
    active_turn: Option<u64>,
    banner: Option<String>,
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the turn token however the turn future ends. A turn dropped
/// while still active is recorded as errored.
struct TurnGuard {
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<TranscriptEvent>,
    token: u64,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if state.active_turn != Some(self.token) {
            return;
        }
        state.active_turn = None;
        if state.turn.is_active() {
            tracing::info!(turn = self.token, "chat turn cancelled");
            state.turn = TurnState::Errored;
            state.banner = Some("Turn cancelled.".to_string());
            let _ = self.events.send(TranscriptEvent::StateChanged(TurnState::Errored));
        }
    }
}

/// One conversation against a relay server. The transcript lives here and
/// only here; each turn sends the whole history.
pub struct ChatSession {
    http: reqwest::Client,
    base_url: String,
    stream_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<TranscriptEvent>,
    turns: AtomicU64,
}

impl ChatSession {
    pub fn new(base_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            state: Arc::new(Mutex::new(SessionState {
                transcript: Transcript::new(),
                turn: TurnState::Idle,
                active_turn: None,
                banner: None,
            })),
            events,
            turns: AtomicU64::new(1),
        }
    }

    /// Longest wait for the next body chunk before the turn is abandoned.
    pub fn with_stream_timeout(mut self, stream_timeout: Duration) -> Self {
        self.stream_timeout = stream_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    pub fn transcript(&self) -> Transcript {
        lock(&self.state).transcript.clone()
    }

    pub fn state(&self) -> TurnState {
        lock(&self.state).turn
    }

    /// The error of the last turn, if it failed. Cleared when a turn starts.
    pub fn banner(&self) -> Option<String> {
        lock(&self.state).banner.clone()
    }

    pub async fn fetch_roles(&self) -> Result<Vec<RoleSummary>> {
        let url = format!("{}/roles", self.base_url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TutorRelayError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TutorRelayError::Http(format!("roles request failed ({status})")));
        }
        let body: RolesResponse = response
            .json()
            .await
            .map_err(|e| TutorRelayError::Serialization(e.to_string()))?;
        Ok(body.roles)
    }

    fn begin_turn(&self, text: &str) -> Result<(TurnGuard, ChatStreamRequest)> {
        let mut state = lock(&self.state);
        if state.active_turn.is_some() {
            return Err(TutorRelayError::TurnInProgress);
        }
        let token = self.turns.fetch_add(1, Ordering::Relaxed);
        state.active_turn = Some(token);
        state.turn = TurnState::Sending;
        state.banner = None;

        let user = Message::new(MessageRole::User, text);
        state.transcript.push(user.clone());
        let messages = state.transcript.history();
        drop(state);

        self.publish(TranscriptEvent::StateChanged(TurnState::Sending));
        self.publish(TranscriptEvent::Upserted(user));

        let guard = TurnGuard {
            state: self.state.clone(),
            events: self.events.clone(),
            token,
        };
        Ok((guard, ChatStreamRequest { messages, role: None }))
    }

    fn publish(&self, event: TranscriptEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, turn: TurnState) {
        lock(&self.state).turn = turn;
        self.publish(TranscriptEvent::StateChanged(turn));
    }

    fn finish(
        &self,
        guard: TurnGuard,
        assembler: Option<&TurnAssembler>,
        error: Option<String>,
    ) -> TurnReport {
        let turn = if error.is_some() {
            TurnState::Errored
        } else {
            TurnState::Settled
        };
        {
            let mut state = lock(&self.state);
            state.turn = turn;
            state.banner = error.clone();
        }
        if let Some(banner) = &error {
            tracing::warn!(turn = guard.token, error = %banner, "chat turn failed");
            self.publish(TranscriptEvent::Banner(banner.clone()));
        }
        self.publish(TranscriptEvent::StateChanged(turn));
        drop(guard);

        TurnReport {
            state: turn,
            assistant_message_id: assembler
                .filter(|assembler| assembler.has_content())
                .map(|assembler| assembler.message_id().to_string()),
            error,
        }
    }

    /// Appends `text` as a user message, streams the reply into the
    /// transcript, and reports how the turn ended. Only an overlapping turn
    /// is an `Err`; transport and upstream failures end as `Errored`.
    pub async fn send_turn(&self, text: &str, role: Option<&str>) -> Result<TurnReport> {
        let (guard, mut request) = self.begin_turn(text)?;
        request.role = role.map(str::to_string);
        tracing::debug!(
            turn = guard.token,
            messages = request.messages.len(),
            role = role.unwrap_or("general"),
            "sending chat turn"
        );

        let url = format!("{}/chat-stream", self.base_url);
        let response = match self.http.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(err) => {
                let banner = format!(
                    "Request failed: {err}. Relay unreachable at {}.",
                    self.base_url
                );
                return Ok(self.finish(guard, None, Some(banner)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let raw = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            let details = serde_json::from_str::<ErrorBody>(&raw)
                .map(|body| body.error.details)
                .unwrap_or(raw);
            let banner = format!("Request failed ({status}): {details}");
            return Ok(self.finish(guard, None, Some(banner)));
        }

        self.set_state(TurnState::Streaming);
        let mut assembler = TurnAssembler::new();
        let mut decoder = FrameDecoder::new();
        let mut upstream_error = None;
        let mut body = response.bytes_stream();

        loop {
            let chunk = match timeout(self.stream_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    let banner = format!("Stream error: {err}");
                    return Ok(self.finish(guard, Some(&assembler), Some(banner)));
                }
                Err(_) => {
                    let banner = "Stream timed out waiting for response.".to_string();
                    return Ok(self.finish(guard, Some(&assembler), Some(banner)));
                }
            };

            decoder.feed(&chunk);
            while let Some(frame) = decoder.next_frame() {
                let outcome = {
                    let mut state = lock(&self.state);
                    assembler.fold_into(parse_frame(&frame), &mut state.transcript)
                };
                match outcome {
                    FrameOutcome::Appended => {
                        self.publish(TranscriptEvent::Upserted(assembler.pending().clone()));
                    }
                    FrameOutcome::UpstreamError(details) => {
                        if upstream_error.is_none() {
                            upstream_error = Some(details);
                        }
                    }
                    FrameOutcome::Sentinel | FrameOutcome::Ignored | FrameOutcome::Malformed => {}
                }
            }
        }

        if let Some(partial) = decoder.finish() {
            tracing::debug!(bytes = partial.len(), "dropping incomplete trailing frame");
        }
        tracing::debug!(
            turn = guard.token,
            malformed = assembler.malformed_frames(),
            "chat stream ended"
        );

        let banner = upstream_error.map(|details| format!("Stream error: {details}"));
        Ok(self.finish(guard, Some(&assembler), banner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_idle_and_empty() {
        let session = ChatSession::new("http://127.0.0.1:7879/");
        assert_eq!(session.base_url(), "http://127.0.0.1:7879");
        assert_eq!(session.state(), TurnState::Idle);
        assert!(session.transcript().is_empty());
        assert!(session.banner().is_none());
    }

    #[test]
    fn overlapping_turn_is_rejected_until_guard_drops() {
        let session = ChatSession::new("http://127.0.0.1:1");
        let (guard, request) = session.begin_turn("Hi").unwrap();
        assert_eq!(request.messages.len(), 1);
        assert!(matches!(
            session.begin_turn("again"),
            Err(TutorRelayError::TurnInProgress)
        ));

        drop(guard);
        assert_eq!(session.state(), TurnState::Errored);
        assert!(session.begin_turn("again").is_ok());
    }

    #[test]
    fn each_turn_carries_full_history() {
        let session = ChatSession::new("http://127.0.0.1:1");
        let (guard, _) = session.begin_turn("first").unwrap();
        session.finish(guard, None, None);
        let (_guard, request) = session.begin_turn("second").unwrap();
        let contents: Vec<_> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
