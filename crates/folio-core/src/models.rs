//! Core data models shared by the indexing, retrieval, personality, and
//! generation stages.

use serde::{Deserialize, Serialize};

/// Who may read a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("public") {
            Visibility::Public
        } else {
            Visibility::Private
        }
    }
}

/// A book record. The text is normalized plain text and is immutable once
/// ingestion completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Chunk ids in sequence order.
    #[serde(default)]
    pub chunk_ids: Vec<String>,
    /// Character ids (slugs) discovered during personality extraction.
    #[serde(default)]
    pub character_ids: Vec<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl Book {
    /// Public books are readable by anyone; private books only by their owner.
    pub fn is_readable_by(&self, requester: Option<&str>) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Private => match (&self.owner_id, requester) {
                (None, _) => true,
                (Some(owner), Some(who)) => owner == who,
                (Some(_), None) => false,
            },
        }
    }
}

/// A bounded, overlapping span of a book's text: the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// UUIDv5 of `"{book_id}:{position}"`.
    pub id: String,
    pub book_id: String,
    /// Zero-based sequence position within the book.
    pub position: i64,
    /// Byte offset of the first character in the book text.
    pub start: usize,
    /// Byte offset one past the last character in the book text.
    pub end: usize,
    pub text: String,
    pub char_len: usize,
    pub token_estimate: usize,
    /// SHA-256 of `text`, used to skip unchanged chunks on re-ingestion.
    pub hash: String,
}

/// Identity of an embedding model generation.
///
/// Vectors are only ever compared within one generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub name: String,
    pub dims: usize,
}

impl EmbeddingModel {
    pub fn new(name: impl Into<String>, dims: usize) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }
}

/// What a personality profile describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileTarget {
    Book { book_id: String },
    Character { book_id: String, name: String },
}

impl ProfileTarget {
    pub fn book(book_id: impl Into<String>) -> Self {
        ProfileTarget::Book {
            book_id: book_id.into(),
        }
    }

    pub fn character(book_id: impl Into<String>, name: impl Into<String>) -> Self {
        ProfileTarget::Character {
            book_id: book_id.into(),
            name: name.into(),
        }
    }

    pub fn book_id(&self) -> &str {
        match self {
            ProfileTarget::Book { book_id } | ProfileTarget::Character { book_id, .. } => book_id,
        }
    }

    /// Slug id for character targets, `None` for books.
    pub fn character_id(&self) -> Option<String> {
        match self {
            ProfileTarget::Book { .. } => None,
            ProfileTarget::Character { name, .. } => Some(slugify(name)),
        }
    }

    /// Human-readable label used in prompts and error messages.
    pub fn label(&self) -> String {
        match self {
            ProfileTarget::Book { book_id } => format!("book {}", book_id),
            ProfileTarget::Character { book_id, name } => {
                format!("character {} ({})", name, book_id)
            }
        }
    }
}

/// A weighted descriptor within one attribute category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub label: String,
    pub weight: f64,
}

impl Descriptor {
    pub fn new(label: impl Into<String>, weight: f64) -> Self {
        Self {
            label: label.into(),
            weight,
        }
    }
}

/// Structured voice attributes. Category vectors are ordered strongest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProfileAttributes {
    #[serde(default)]
    pub tone: Vec<Descriptor>,
    #[serde(default)]
    pub values: Vec<Descriptor>,
    #[serde(default)]
    pub speech_patterns: Vec<Descriptor>,
    #[serde(default)]
    pub writing_style: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Derived, recomputable personality/voice profile for a book or character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub target: ProfileTarget,
    pub attributes: ProfileAttributes,
    /// Evidence density in `[0, 1]`.
    pub confidence: f64,
    pub source_chunk_ids: Vec<String>,
}

/// A retrieved chunk supplied to generation and returned as a citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub chunk_id: String,
    pub book_id: String,
    pub position: i64,
    pub score: f64,
    /// 1-based rank in the evidence list.
    pub rank: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation. Assistant turns carry their citations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            evidence: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, evidence: Vec<EvidenceItem>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            evidence,
        }
    }
}

/// Pollable ingestion state of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Indexing,
    ExtractingPersonality,
    Ready,
    Failed { kind: String, message: String },
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Indexing => "indexing",
            IngestStatus::ExtractingPersonality => "extracting_personality",
            IngestStatus::Ready => "ready",
            IngestStatus::Failed { .. } => "failed",
        }
    }

    /// Rebuild a status from its stored columns.
    pub fn from_parts(state: &str, kind: Option<String>, message: Option<String>) -> Self {
        match state {
            "pending" => IngestStatus::Pending,
            "indexing" => IngestStatus::Indexing,
            "extracting_personality" => IngestStatus::ExtractingPersonality,
            "ready" => IngestStatus::Ready,
            _ => IngestStatus::Failed {
                kind: kind.unwrap_or_else(|| "unknown".to_string()),
                message: message.unwrap_or_default(),
            },
        }
    }

    pub fn failed(err: &crate::error::Error) -> Self {
        IngestStatus::Failed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Lowercase, hyphen-separated id for a character name.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(visibility: Visibility, owner: Option<&str>) -> Book {
        Book {
            id: "b1".into(),
            title: "T".into(),
            author: "A".into(),
            text: "x".into(),
            visibility,
            owner_id: owner.map(String::from),
            chunk_ids: vec![],
            character_ids: vec![],
            created_at: 0,
        }
    }

    #[test]
    fn test_visibility_access() {
        assert!(book(Visibility::Public, Some("u1")).is_readable_by(None));
        assert!(book(Visibility::Private, Some("u1")).is_readable_by(Some("u1")));
        assert!(!book(Visibility::Private, Some("u1")).is_readable_by(Some("u2")));
        assert!(!book(Visibility::Private, Some("u1")).is_readable_by(None));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Captain Ahab"), "captain-ahab");
        assert_eq!(slugify("  Queequeg! "), "queequeg");
    }

    #[test]
    fn test_status_roundtrip_parts() {
        let failed = IngestStatus::Failed {
            kind: "malformed_input".into(),
            message: "empty".into(),
        };
        let rebuilt = IngestStatus::from_parts(
            failed.as_str(),
            Some("malformed_input".into()),
            Some("empty".into()),
        );
        assert_eq!(rebuilt, failed);
        assert_eq!(
            IngestStatus::from_parts("extracting_personality", None, None),
            IngestStatus::ExtractingPersonality
        );
    }

    #[test]
    fn test_character_target_id() {
        let t = ProfileTarget::character("moby", "Captain Ahab");
        assert_eq!(t.character_id().as_deref(), Some("captain-ahab"));
        assert_eq!(t.book_id(), "moby");
        assert_eq!(ProfileTarget::book("moby").character_id(), None);
    }
}
