use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Maximum characters kept in a derived session title
pub const TITLE_MAX_CHARS: usize = 50;

/// Maximum characters kept in a session preview
pub const PREVIEW_MAX_CHARS: usize = 100;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Metadata for a stored chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Unique identifier for the session
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Title derived from the first user message
    pub title: String,
    /// Snippet of the latest message
    pub preview: Option<String>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session last received a message
    pub updated_at: DateTime<Utc>,
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    /// Source/citation list attached to assistant answers
    #[serde(default)]
    pub references: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

/// A session together with its messages, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTranscript {
    #[serde(flatten)]
    pub chat: ChatSession,
    pub messages: Vec<StoredMessage>,
}

fn first_chars(text: &str, max: usize) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let kept: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}

/// Session title derived from a user message
pub fn derive_title(message: &str) -> String {
    let title = first_chars(message, TITLE_MAX_CHARS);
    if title.is_empty() {
        "New chat".to_string()
    } else {
        title
    }
}

/// Preview snippet derived from a message
pub fn derive_preview(content: &str) -> String {
    first_chars(content, PREVIEW_MAX_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_str() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_derive_title_short_message() {
        assert_eq!(derive_title("What is the holding?"), "What is the holding?");
    }

    #[test]
    fn test_derive_title_truncates() {
        let title = derive_title(&"word ".repeat(30));
        assert!(title.chars().count() <= TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_derive_title_uses_first_non_empty_line() {
        assert_eq!(derive_title("\n\n  Question one\nmore"), "Question one");
        assert_eq!(derive_title("   "), "New chat");
    }
}
