use crate::domains::conversation::{Message, MessageRole, Transcript};
use crate::stream::frame::{FramePayload, StreamFrame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A delta was appended to the pending assistant message.
    Appended,
    /// `[DONE]`; never mutates and never ends the read loop by itself.
    Sentinel,
    /// Non-data frame, or a chunk without `delta.content`.
    Ignored,
    /// JSON that did not parse; logged and skipped.
    Malformed,
    /// The producer reported a failure after streaming began.
    UpstreamError(String),
}

/// Folds the frames of one turn into a single pending assistant message.
#[derive(Debug)]
pub struct TurnAssembler {
    pending: Message,
    started: bool,
    frames: usize,
    malformed: usize,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::with_message(Message::new(MessageRole::Assistant, String::new()))
    }

    pub fn with_message(pending: Message) -> Self {
        Self {
            pending,
            started: false,
            frames: 0,
            malformed: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.pending.id
    }

    pub fn pending(&self) -> &Message {
        &self.pending
    }

    /// True once at least one delta has been folded in.
    pub fn has_content(&self) -> bool {
        self.started
    }

    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    pub fn apply(&mut self, payload: FramePayload) -> FrameOutcome {
        self.frames += 1;
        let json = match payload {
            FramePayload::Done => return FrameOutcome::Sentinel,
            FramePayload::Ignored => return FrameOutcome::Ignored,
            FramePayload::Data(json) => json,
        };

        let frame: StreamFrame = match serde_json::from_str(&json) {
            Ok(frame) => frame,
            Err(err) => {
                self.malformed += 1;
                tracing::warn!(
                    frame = self.frames,
                    error = %err,
                    "skipping malformed stream frame"
                );
                return FrameOutcome::Malformed;
            }
        };

        if let Some(error) = frame.error {
            return FrameOutcome::UpstreamError(error.details);
        }

        match frame.delta_content() {
            Some(delta) => {
                self.pending.append_text(delta);
                self.started = true;
                FrameOutcome::Appended
            }
            None => FrameOutcome::Ignored,
        }
    }

    /// Applies one frame and, if content changed, upserts the pending
    /// message into `transcript`.
    pub fn fold_into(
        &mut self,
        payload: FramePayload,
        transcript: &mut Transcript,
    ) -> FrameOutcome {
        let outcome = self.apply(payload);
        if outcome == FrameOutcome::Appended {
            transcript.upsert(self.pending.clone());
        }
        outcome
    }

    pub fn into_message(self) -> Option<Message> {
        self.started.then_some(self.pending)
    }
}

impl Default for TurnAssembler {
    fn default() -> Self {
        Self::new()
    }
}
