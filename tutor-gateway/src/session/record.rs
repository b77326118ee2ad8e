//! Session record: the stored form of one tutoring conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speaker of a turn, as the model API names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The student (and the system prompt, which is sent as a user turn)
    User,
    /// The tutor model
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// One role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<String>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![text.into()],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![text.into()],
        }
    }

    /// All parts joined into one string.
    pub fn text(&self) -> String {
        self.parts.concat()
    }
}

/// Acknowledgment the model "gives" to the system prompt in every seed pair.
pub fn seed_acknowledgment(subject: &str) -> String {
    format!(
        "Understood. I will act as a {subject} teacher following the specified guidelines to help students learn effectively."
    )
}

/// Errors decoding a stored record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("malformed session record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid session history: {0}")]
    InvalidHistory(String),
}

/// Conversation history plus access time for one session id.
///
/// The history always starts with the seed pair and alternates
/// user/model, so its length is even and at least two. The only mutation
/// is [`SessionRecord::push_exchange`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    session_id: String,
    history: Vec<Turn>,
    last_accessed: DateTime<Utc>,
    /// Built while the stored copy could not be read; never written back.
    detached: bool,
}

/// Encoded shape; the session id lives in the key, not the value.
#[derive(Serialize)]
struct StoredRecordRef<'a> {
    history: &'a [Turn],
    last_accessed: DateTime<Utc>,
}

#[derive(Deserialize)]
struct StoredRecord {
    history: Vec<Turn>,
    last_accessed: DateTime<Utc>,
}

/// Projection read by the expiry sweep; the history is skipped over.
#[derive(Deserialize)]
struct AccessStamp {
    last_accessed: DateTime<Utc>,
}

impl SessionRecord {
    /// Start a conversation with the seed pair for `prompt` / `subject`.
    pub fn new(session_id: impl Into<String>, prompt: &str, subject: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            history: vec![Turn::user(prompt), Turn::model(seed_acknowledgment(subject))],
            last_accessed: now,
            detached: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Turns after the seed pair.
    pub fn exchanges(&self) -> &[Turn] {
        &self.history[2..]
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    /// Whether this copy must not replace what the store holds.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
    }

    /// Mark the record as used at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
    }

    /// Append one completed exchange.
    pub fn push_exchange(&mut self, user_message: &str, model_reply: &str, now: DateTime<Utc>) {
        self.history.push(Turn::user(user_message));
        self.history.push(Turn::model(model_reply));
        self.last_accessed = now;
    }

    /// Encode for the store.
    pub fn encode(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(&StoredRecordRef {
            history: &self.history,
            last_accessed: self.last_accessed,
        })?)
    }

    /// Decode a stored value, rejecting histories that break the pairing
    /// invariant.
    pub fn decode(session_id: impl Into<String>, raw: &str) -> Result<Self, RecordError> {
        let stored: StoredRecord = serde_json::from_str(raw)?;
        validate_history(&stored.history)?;

        Ok(Self {
            session_id: session_id.into(),
            history: stored.history,
            last_accessed: stored.last_accessed,
            detached: false,
        })
    }

    /// Read only the access time of a stored value.
    pub fn decode_last_accessed(raw: &str) -> Result<DateTime<Utc>, RecordError> {
        let stamp: AccessStamp = serde_json::from_str(raw)?;
        Ok(stamp.last_accessed)
    }
}

fn validate_history(history: &[Turn]) -> Result<(), RecordError> {
    if history.len() < 2 {
        return Err(RecordError::InvalidHistory(format!(
            "expected at least the seed pair, found {} turn(s)",
            history.len()
        )));
    }
    if history.len() % 2 != 0 {
        return Err(RecordError::InvalidHistory(format!(
            "odd number of turns ({})",
            history.len()
        )));
    }

    for (index, turn) in history.iter().enumerate() {
        let expected = if index % 2 == 0 { Role::User } else { Role::Model };
        if turn.role != expected {
            return Err(RecordError::InvalidHistory(format!(
                "turn {index} is {}, expected {}",
                turn.role.as_str(),
                expected.as_str()
            )));
        }
    }

    Ok(())
}
