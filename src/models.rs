//! Core data models used throughout feedrag.
//!
//! These types represent the change-feed events, indexed chunks, chat
//! messages, and search hits that flow through the ingestion and retrieval
//! pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One entry from the CouchDB `_changes` feed.
///
/// Only `seq` is required in practice; every other field may be missing
/// depending on the feed options and the kind of change. Fields of an
/// unexpected JSON type read as absent, so any JSON object parses and its
/// `seq` can still advance the cursor.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    /// Opaque position token. CouchDB 1.x emits integers, 2.x+ emits strings.
    #[serde(default)]
    pub seq: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    /// Set by the feed itself when the document was deleted at the store level.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub deleted: bool,
    /// Present when the feed runs with `include_docs=true`.
    #[serde(default, deserialize_with = "lenient_doc")]
    pub doc: Option<FeedDocument>,
}

impl ChangeEvent {
    /// Renders the `seq` field as a cursor token.
    ///
    /// Strings are used verbatim; any other JSON value (usually an integer)
    /// is rendered as its JSON text so that it can be echoed back in `since=`.
    pub fn sequence_token(&self) -> Option<String> {
        match self.seq.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Document id from the embedded doc, falling back to the change row.
    pub fn document_id(&self) -> Option<&str> {
        self.doc
            .as_ref()
            .map(|d| d.id.as_str())
            .filter(|id| !id.is_empty())
            .or(self.id.as_deref())
    }
}

/// A content-store document as embedded in a change event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedDocument {
    #[serde(rename = "_id", default, deserialize_with = "lenient_id")]
    pub id: String,
    /// Document kind; only `"plain"` documents are indexed.
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub path: Option<String>,
    /// Soft-delete flag written by the sync client, or CouchDB's own `_deleted`.
    #[serde(default, alias = "_deleted", deserialize_with = "lenient_bool")]
    pub deleted: bool,
    /// Document content: either a single string or a list of string parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FeedDocument {
    /// Concatenates the `data` field into the document's text body.
    ///
    /// Returns `None` when the document carries no textual content.
    pub fn body_text(&self) -> Option<String> {
        match self.data.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Array(parts) => {
                let text: String = parts.iter().filter_map(Value::as_str).collect();
                if text.is_empty() && !parts.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            _ => None,
        }
    }

    /// The path if set, otherwise the document id.
    pub fn path_or_id(&self) -> &str {
        self.path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.id)
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(lenient_string(d)?.unwrap_or_default())
}

/// Only a literal `true` counts as set.
fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(matches!(Value::deserialize(d)?, Value::Bool(true)))
}

fn lenient_doc<'de, D: Deserializer<'de>>(d: D) -> Result<Option<FeedDocument>, D::Error> {
    Ok(match Value::deserialize(d)? {
        doc @ Value::Object(_) => serde_json::from_value(doc).ok(),
        _ => None,
    })
}

/// A content entry pushed through `POST /update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub slug: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The durable pointer into the change feed. Exactly one per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeCursor {
    pub sequence_token: String,
    pub updated_at: DateTime<Utc>,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

/// A single message in a prompt request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// A persisted chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub chat_id: Uuid,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub context_slugs: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// A ranked chunk returned from retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub document_id: String,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub content: String,
    pub similarity: f64,
}
