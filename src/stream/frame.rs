use serde::{Deserialize, Serialize};

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub details: String,
}

/// `{ "error": { "details": .. } }`, used both as a JSON error response and
/// inside the error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetails,
}

impl ErrorBody {
    pub fn new(details: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                details: details.into(),
            },
        }
    }
}

/// JSON payload of one `data:` frame. Unknown fields (ids, model names,
/// usage blocks from upstream chunks) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl StreamFrame {
    pub fn content(delta: impl Into<String>) -> Self {
        Self {
            choices: vec![StreamChoice {
                delta: StreamDelta {
                    content: Some(delta.into()),
                },
                finish_reason: None,
            }],
            error: None,
        }
    }

    pub fn error(details: impl Into<String>) -> Self {
        Self {
            choices: Vec::new(),
            error: Some(ErrorDetails {
                details: details.into(),
            }),
        }
    }

    /// `choices[0].delta.content`, if present.
    pub fn delta_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// The `[DONE]` sentinel.
    Done,
    /// Trimmed payload of a `data:` frame, not yet parsed.
    Data(String),
    /// Comments, `event:` lines and anything else without the data marker.
    Ignored,
}

pub fn parse_frame(frame: &str) -> FramePayload {
    let Some(payload) = frame.strip_prefix(DATA_PREFIX) else {
        return FramePayload::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        FramePayload::Done
    } else {
        FramePayload::Data(payload.to_string())
    }
}

pub fn encode_data(frame: &StreamFrame) -> serde_json::Result<String> {
    Ok(format!("{DATA_PREFIX} {}\n\n", serde_json::to_string(frame)?))
}

pub fn encode_error(details: &str) -> String {
    // A struct of strings always serializes.
    let payload = serde_json::to_string(&StreamFrame::error(details)).unwrap_or_default();
    format!("{DATA_PREFIX} {payload}\n\n")
}
