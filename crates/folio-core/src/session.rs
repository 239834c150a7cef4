//! Per-conversation state and turn cancellation.
//!
//! A [`ChatSession`] is passed by `&mut` through each turn. History only
//! grows when a turn completes; failed or cancelled turns leave it as it was.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationTurn, EvidenceItem, Role};

/// Conversation state for one chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    /// Selected books, in selection order. The last one is the most recent.
    pub book_ids: Vec<String>,
    /// Optional character slug the user is talking to.
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    /// Evidence items returned per book across this session's turns.
    #[serde(default)]
    pub hit_counts: HashMap<String, usize>,
    #[serde(default)]
    pub requester: Option<String>,
}

impl ChatSession {
    pub fn new(book_ids: Vec<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let book_ids = book_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            book_ids,
            character_id: None,
            history: Vec::new(),
            hit_counts: HashMap::new(),
            requester: None,
        }
    }

    pub fn with_character(mut self, character_id: impl Into<String>) -> Self {
        self.character_id = Some(character_id.into());
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    /// Text of the last `window` user turns, oldest first.
    pub fn recent_user_turns(&self, window: usize) -> Vec<&str> {
        let mut turns: Vec<&str> = self
            .history
            .iter()
            .rev()
            .filter(|t| t.role == Role::User)
            .take(window)
            .map(|t| t.text.as_str())
            .collect();
        turns.reverse();
        turns
    }

    /// Last `window` turns of either role, oldest first.
    pub fn recent_turns(&self, window: usize) -> &[ConversationTurn] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }

    /// Append a completed exchange and count its evidence per book.
    pub fn record_exchange(&mut self, query: &str, answer: &str, evidence: Vec<EvidenceItem>) {
        for item in &evidence {
            *self.hit_counts.entry(item.book_id.clone()).or_insert(0) += 1;
        }
        self.history.push(ConversationTurn::user(query));
        self.history.push(ConversationTurn::assistant(answer, evidence));
    }
}

/// Cooperative cancellation flag shared between a turn and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(book: &str) -> EvidenceItem {
        EvidenceItem {
            chunk_id: "c".into(),
            book_id: book.into(),
            position: 0,
            score: 0.9,
            rank: 1,
            text: "t".into(),
        }
    }

    #[test]
    fn test_new_dedups_selection() {
        let s = ChatSession::new(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(s.book_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_record_exchange_counts_hits() {
        let mut s = ChatSession::new(vec!["a".into(), "b".into()]);
        s.record_exchange("q1", "r1", vec![evidence("a"), evidence("a"), evidence("b")]);
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.hit_counts["a"], 2);
        assert_eq!(s.hit_counts["b"], 1);
    }

    #[test]
    fn test_recent_user_turns() {
        let mut s = ChatSession::new(vec!["a".into()]);
        s.record_exchange("one", "r", vec![]);
        s.record_exchange("two", "r", vec![]);
        s.record_exchange("three", "r", vec![]);
        assert_eq!(s.recent_user_turns(2), vec!["two", "three"]);
        assert_eq!(s.recent_turns(3).len(), 3);
        assert_eq!(s.recent_turns(10).len(), 6);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
