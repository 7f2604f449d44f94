use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domains::conversation::ChatMessage;
use crate::domains::roles::{AssistantRole, RolePromptTable, UnknownRolePolicy};
use crate::error::{Result, TutorRelayError};
use crate::interfaces::providers::{ChatProvider, UpstreamMessage};
use crate::stream::frame::{encode_data, encode_error, StreamFrame, DONE_FRAME};

/// Body of `POST /chat-stream`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatStreamRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Encoded `data: ..\n\n` frames, always terminated by `data: [DONE]\n\n`.
pub type RelayStream = BoxStream<'static, Bytes>;

static TURN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Logs how a relayed turn ended. Dropped without `complete` means the
/// response body was dropped mid-stream, which also drops the upstream call.
struct TurnGuard {
    turn: u64,
    frames: usize,
    completed: bool,
}

impl TurnGuard {
    fn new(turn: u64) -> Self {
        Self {
            turn,
            frames: 0,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
        info!(turn = self.turn, frames = self.frames, "chat turn relayed");
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.completed {
            info!(
                turn = self.turn,
                frames = self.frames,
                "client went away mid-stream; upstream call cancelled"
            );
        }
    }
}

pub struct RelayService {
    provider: Arc<dyn ChatProvider>,
    prompts: Arc<RolePromptTable>,
    unknown_role: UnknownRolePolicy,
    turn_timeout: Duration,
}

impl RelayService {
    pub fn new(provider: Arc<dyn ChatProvider>, prompts: Arc<RolePromptTable>) -> Self {
        Self {
            provider,
            prompts,
            unknown_role: UnknownRolePolicy::default(),
            turn_timeout: Duration::from_secs(crate::config::DEFAULT_TURN_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &Config, provider: Arc<dyn ChatProvider>) -> Result<Self> {
        let prompts = Arc::new(config.role_prompts()?);
        Ok(Self::new(provider, prompts)
            .with_unknown_role_policy(config.unknown_role_policy())
            .with_turn_timeout(config.turn_timeout()))
    }

    pub fn with_unknown_role_policy(mut self, policy: UnknownRolePolicy) -> Self {
        self.unknown_role = policy;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn prompts(&self) -> &RolePromptTable {
        &self.prompts
    }

    pub fn resolve_role(&self, requested: Option<&str>) -> Result<AssistantRole> {
        self.unknown_role.resolve(requested)
    }

    /// `[system(prompt(role))] ++ history`.
    pub fn build_upstream_messages(
        &self,
        role: AssistantRole,
        history: &[ChatMessage],
    ) -> Result<Vec<UpstreamMessage>> {
        if history.is_empty() {
            return Err(TutorRelayError::Validation(
                "messages must contain at least one entry".to_string(),
            ));
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(UpstreamMessage::system(self.prompts.system_prompt(role)));
        for (index, message) in history.iter().enumerate() {
            let upstream = match message.role.trim().to_ascii_lowercase().as_str() {
                "user" => UpstreamMessage::user(message.content.clone()),
                "assistant" => UpstreamMessage::assistant(message.content.clone()),
                other => {
                    return Err(TutorRelayError::Validation(format!(
                        "messages[{index}] has unsupported role `{other}`"
                    )))
                }
            };
            messages.push(upstream);
        }
        Ok(messages)
    }

    /// Opens the upstream completion and waits for its first item. Failures
    /// up to that point come back as `Err` so the caller can still answer
    /// with a JSON error; later failures are reported in-band as an error
    /// frame followed by `[DONE]`.
    pub async fn handle_chat_stream(&self, request: ChatStreamRequest) -> Result<RelayStream> {
        let role = self.resolve_role(request.role.as_deref())?;
        let messages = self.build_upstream_messages(role, &request.messages)?;
        let turn = TURN_COUNTER.fetch_add(1, Ordering::Relaxed);
        info!(
            turn,
            role = %role,
            messages = messages.len(),
            provider = self.provider.name(),
            "relaying chat turn"
        );

        let timeout = self.turn_timeout;
        let deadline = Instant::now() + timeout;
        let mut upstream = self.provider.chat_stream(messages);

        let first = match timeout_at(deadline, upstream.next()).await {
            Err(_) => {
                warn!(turn, "upstream produced nothing before the turn deadline");
                return Err(TutorRelayError::Timeout(format!(
                    "no upstream response within {}s",
                    timeout.as_secs()
                )));
            }
            Ok(Some(Err(err))) => {
                warn!(turn, error = %err, "upstream failed before streaming began");
                return Err(err);
            }
            Ok(first) => first,
        };

        let frames = stream! {
            let mut guard = TurnGuard::new(turn);
            let mut exhausted = first.is_none();
            let mut buffered = first;

            while !exhausted {
                let item = match buffered.take() {
                    Some(item) => item,
                    None => match timeout_at(deadline, upstream.next()).await {
                        Ok(Some(item)) => item,
                        Ok(None) => break,
                        Err(_) => {
                            warn!(turn, "turn deadline hit mid-stream");
                            guard.frames += 1;
                            yield Bytes::from(encode_error(&format!(
                                "upstream response exceeded {}s",
                                timeout.as_secs()
                            )));
                            break;
                        }
                    },
                };

                match item {
                    Ok(delta) => {
                        let Some(content) = delta.content.filter(|text| !text.is_empty()) else {
                            if let Some(reason) = delta.finish_reason {
                                debug!(turn, finish_reason = %reason, "upstream finished");
                            }
                            continue;
                        };
                        match encode_data(&StreamFrame::content(content)) {
                            Ok(frame) => {
                                guard.frames += 1;
                                yield Bytes::from(frame);
                            }
                            Err(err) => warn!(turn, error = %err, "failed to encode frame"),
                        }
                    }
                    Err(err) => {
                        warn!(turn, error = %err, "upstream failed mid-stream");
                        guard.frames += 1;
                        yield Bytes::from(encode_error(&err.details()));
                        exhausted = true;
                    }
                }
            }

            yield Bytes::from_static(DONE_FRAME.as_bytes());
            guard.complete();
        };

        Ok(Box::pin(frames))
    }
}
