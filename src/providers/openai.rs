use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};

use crate::config::OpenAiConfig;
use crate::error::{Result, TutorRelayError};
use crate::interfaces::providers::{ChatDelta, ChatProvider, UpstreamMessage, UpstreamRole};
use crate::stream::frame::{parse_frame, FramePayload, StreamChoice};
use crate::stream::FrameDecoder;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Upstream chunk. `error` is kept loose because providers disagree on its shape.
#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Clone)]
pub struct OpenAiProvider {
    model: String,
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http: reqwest::Client::new(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn from_config(config: &OpenAiConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_message(message: UpstreamMessage) -> Result<ChatCompletionRequestMessage> {
        let built = match message.role {
            UpstreamRole::System => ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(message.content.as_str())
                    .build()
                    .map_err(|e| TutorRelayError::Runtime(e.to_string()))?,
            ),
            UpstreamRole::User => ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Text(
                        message.content,
                    ))
                    .build()
                    .map_err(|e| TutorRelayError::Runtime(e.to_string()))?,
            ),
            UpstreamRole::Assistant => ChatCompletionRequestMessage::Assistant(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(ChatCompletionRequestAssistantMessageContent::Text(
                        message.content,
                    ))
                    .build()
                    .map_err(|e| TutorRelayError::Runtime(e.to_string()))?,
            ),
        };
        Ok(built)
    }

    pub fn build_request(
        &self,
        messages: Vec<UpstreamMessage>,
    ) -> Result<CreateChatCompletionRequest> {
        let messages = messages
            .into_iter()
            .map(Self::build_message)
            .collect::<Result<Vec<_>>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(self.model.clone());
        builder.messages(messages);
        builder.stream(true);
        builder
            .build()
            .map_err(|e| TutorRelayError::Runtime(e.to_string()))
    }

    fn error_message(error: &Value) -> String {
        error
            .get("message")
            .or_else(|| error.get("details"))
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string())
    }
}

impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn chat_stream(
        &self,
        messages: Vec<UpstreamMessage>,
    ) -> BoxStream<'static, Result<ChatDelta>> {
        let provider = self.clone();

        Box::pin(try_stream! {
            let request = provider.build_request(messages)?;
            let url = provider.completions_url();
            debug!(model = %provider.model, url = %url, "opening upstream chat stream");

            let mut call = provider.http.post(url).json(&request);
            if let Some(key) = provider.api_key.as_deref() {
                call = call.bearer_auth(key);
            }
            let response = call.send().await.map_err(|e| {
                TutorRelayError::Upstream(format!("chat completion transport failed: {e}"))
            })?;

            let status = response.status();
            let response = if status.is_success() {
                Ok(response)
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(TutorRelayError::Upstream(format!(
                    "chat completion failed ({status}): {body}"
                )))
            }?;

            let mut body = response.bytes_stream();
            let mut decoder = FrameDecoder::new();
            let mut completed = false;
            'read: while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| {
                    TutorRelayError::Upstream(format!("chat completion read failed: {e}"))
                })?;
                decoder.feed(&chunk);

                while let Some(raw) = decoder.next_frame() {
                    let json = match parse_frame(&raw) {
                        FramePayload::Done => {
                            completed = true;
                            break 'read;
                        }
                        FramePayload::Ignored => continue,
                        FramePayload::Data(json) => json,
                    };
                    let parsed: UpstreamChunk = match serde_json::from_str(&json) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            warn!(error = %err, "skipping malformed upstream chunk");
                            continue;
                        }
                    };
                    if let Some(error) = parsed.error {
                        Err::<(), _>(TutorRelayError::Upstream(
                            OpenAiProvider::error_message(&error),
                        ))?;
                    }
                    if let Some(choice) = parsed.choices.into_iter().next() {
                        completed |= choice.finish_reason.is_some();
                        yield ChatDelta {
                            content: choice.delta.content,
                            finish_reason: choice.finish_reason,
                        };
                    }
                }
            }

            if let Some(leftover) = decoder.finish() {
                warn!(bytes = leftover.len(), "upstream body ended inside a frame");
            }
            if !completed {
                Err::<(), _>(TutorRelayError::Upstream(
                    "upstream stream ended before completion".to_string(),
                ))?;
            }
        })
    }
}
