use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorRelayError};

/// Persona selected by the learner; controls the system prompt sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssistantRole {
    General,
    Education,
    MentalSupport,
    Coding,
    Creative,
    Career,
}

impl AssistantRole {
    pub const ALL: [AssistantRole; 6] = [
        AssistantRole::General,
        AssistantRole::Education,
        AssistantRole::MentalSupport,
        AssistantRole::Coding,
        AssistantRole::Creative,
        AssistantRole::Career,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Education => "education",
            Self::MentalSupport => "mental-support",
            Self::Coding => "coding",
            Self::Creative => "creative",
            Self::Career => "career",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::General => "General",
            Self::Education => "Education",
            Self::MentalSupport => "Mental Support",
            Self::Coding => "Coding",
            Self::Creative => "Creative",
            Self::Career => "Career",
        }
    }

    fn default_instructions(self) -> &'static str {
        match self {
            Self::General => {
                "You are a friendly general assistant for an online learning platform. \
                 Answer questions clearly and point learners to relevant course material when it helps."
            }
            Self::Education => {
                "You are a patient tutor. Explain concepts step by step, check understanding \
                 with short questions, and adapt examples to the learner's level."
            }
            Self::MentalSupport => {
                "You are a supportive listener for students dealing with study stress. \
                 Respond with empathy, suggest practical coping strategies, and encourage \
                 reaching out to a qualified professional for anything serious."
            }
            Self::Coding => {
                "You are a programming mentor. Give correct, idiomatic code, explain the reasoning \
                 behind it, and call out common mistakes and edge cases."
            }
            Self::Creative => {
                "You are a creative writing and ideation partner. Offer original ideas, vivid \
                 language, and constructive feedback on the learner's drafts."
            }
            Self::Career => {
                "You are a career coach. Help with skills planning, resumes, interviews, and \
                 choosing courses that match the learner's goals."
            }
        }
    }
}

impl fmt::Display for AssistantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssistantRole {
    type Err = TutorRelayError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        AssistantRole::ALL
            .into_iter()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| TutorRelayError::Validation(format!("unknown assistant role `{value}`")))
    }
}

/// What the producer does with a role tag outside the declared set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownRolePolicy {
    #[default]
    Reject,
    Fallback,
}

impl UnknownRolePolicy {
    /// Absent roles are always `general`; unknown ones depend on the policy.
    pub fn resolve(self, requested: Option<&str>) -> Result<AssistantRole> {
        let Some(raw) = requested.filter(|value| !value.trim().is_empty()) else {
            return Ok(AssistantRole::General);
        };
        match (raw.parse::<AssistantRole>(), self) {
            (Ok(role), _) => Ok(role),
            (Err(_), UnknownRolePolicy::Fallback) => {
                tracing::debug!(role = raw, "unknown assistant role, using general");
                Ok(AssistantRole::General)
            }
            (Err(err), UnknownRolePolicy::Reject) => Err(err),
        }
    }
}

pub const RESPONSE_STYLE: &str = "Keep answers focused and encouraging, use plain language, \
and stay under 300 words unless the learner asks for more detail.";

#[derive(Debug, Clone, Serialize)]
pub struct RoleDescriptor {
    pub id: AssistantRole,
    pub label: &'static str,
}

/// Single source of truth for role prompts, shared by the relay and any role selector.
#[derive(Debug, Clone, Default)]
pub struct RolePromptTable {
    overrides: HashMap<AssistantRole, String>,
}

impl RolePromptTable {
    pub fn with_overrides(overrides: HashMap<AssistantRole, String>) -> Result<Self> {
        if let Some((role, _)) = overrides.iter().find(|(_, prompt)| prompt.trim().is_empty()) {
            return Err(TutorRelayError::Config(format!(
                "prompt override for role `{role}` is empty"
            )));
        }
        Ok(Self { overrides })
    }

    pub fn instructions(&self, role: AssistantRole) -> &str {
        self.overrides
            .get(&role)
            .map(String::as_str)
            .unwrap_or_else(|| role.default_instructions())
    }

    /// Instructions plus the shared response-style constraint.
    pub fn system_prompt(&self, role: AssistantRole) -> String {
        format!("{}\n\n{}", self.instructions(role), RESPONSE_STYLE)
    }

    pub fn descriptors(&self) -> Vec<RoleDescriptor> {
        AssistantRole::ALL
            .into_iter()
            .map(|id| RoleDescriptor {
                id,
                label: id.label(),
            })
            .collect()
    }
}
