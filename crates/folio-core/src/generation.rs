//! Grounded generation: prompt assembly, citation validation, turn states.
//!
//! The orchestrator never lets the provider see a turn without evidence:
//! empty evidence short-circuits to [`REFUSAL_RESPONSE`]. With evidence, the
//! provider's reply is split into sentences and every claim-bearing sentence
//! must either cite a known `[Sx]` marker or share at least half of its
//! content words with one evidence chunk. Unknown markers are stripped and
//! unattributed claims are dropped.
//!
//! # Turn states
//!
//! ```text
//! AwaitingQuery → Retrieving ─┬→ NoEvidence → Refusing
//!                             ├→ HasEvidence → Generating → Validating ─┬→ Delivering
//!                             │                                         └→ Refusing
//!                             └→ Failed   (also from HasEvidence / Generating)
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

use crate::embedding::GenerationProvider;
use crate::error::{Error, Result};
use crate::fusion::FusedProfile;
use crate::models::{ConversationTurn, Descriptor, EvidenceItem, Role};
use crate::session::CancelToken;

/// Exact reply when the sources do not answer the question.
pub const REFUSAL_RESPONSE: &str = "Not found in the provided text.";

/// Reply when no book is selected.
pub const GUIDANCE_RESPONSE: &str =
    "Select at least one book to start a conversation. Answers come only from the books you choose.";

/// Sentences with fewer words carry no claim.
pub const MIN_CLAIM_WORDS: usize = 4;

/// Share of a sentence's content words that must appear in one chunk.
pub const MIN_CONTENT_OVERLAP: f64 = 0.5;

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\[S(\d+)\]").expect("static regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "of", "to", "in", "on", "at", "by", "for",
    "with", "from", "as", "is", "are", "was", "were", "be", "been", "being", "it", "its",
    "this", "that", "these", "those", "he", "she", "they", "them", "his", "her", "their",
    "him", "i", "you", "we", "our", "your", "my", "me", "us", "do", "does", "did", "has",
    "have", "had", "not", "no", "so", "than", "then", "there", "here", "what", "which", "who",
    "whom", "when", "where", "why", "how", "all", "any", "can", "could", "would", "should",
    "will", "shall", "may", "might", "must", "into", "out", "up", "down", "about", "also",
    "very", "just", "only", "said", "says", "text", "book", "source", "sources",
];

/// Per-turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    AwaitingQuery,
    Retrieving,
    NoEvidence,
    Refusing,
    HasEvidence,
    Generating,
    Validating,
    Delivering,
    Failed,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (AwaitingQuery, Retrieving)
                | (Retrieving, NoEvidence)
                | (Retrieving, HasEvidence)
                | (Retrieving, Failed)
                | (NoEvidence, Refusing)
                | (HasEvidence, Generating)
                | (HasEvidence, Failed)
                | (Generating, Validating)
                | (Generating, Failed)
                | (Validating, Delivering)
                | (Validating, Refusing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnState::Refusing | TurnState::Delivering | TurnState::Failed
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered record of the states a turn passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnTrace {
    states: Vec<TurnState>,
}

impl Default for TurnTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTrace {
    pub fn new() -> Self {
        Self {
            states: vec![TurnState::AwaitingQuery],
        }
    }

    pub fn current(&self) -> TurnState {
        self.states
            .last()
            .copied()
            .unwrap_or(TurnState::AwaitingQuery)
    }

    pub fn states(&self) -> &[TurnState] {
        &self.states
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn advance(&mut self, next: TurnState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.states.push(next);
        Ok(())
    }

    /// Record a failure if the turn has not already ended.
    pub fn fail(&mut self) {
        if self.current().can_transition_to(TurnState::Failed) {
            self.states.push(TurnState::Failed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Delivered,
    Refused,
}

/// Validated response and the evidence it rests on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundedAnswer {
    pub text: String,
    /// Cited or matched evidence, in rank order.
    pub evidence_used: Vec<EvidenceItem>,
    pub outcome: Outcome,
    pub trace: Vec<TurnState>,
    /// Claim sentences removed because no evidence supported them.
    pub dropped_sentences: usize,
}

/// Inputs for one grounded generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub history: &'a [ConversationTurn],
    pub evidence: &'a [EvidenceItem],
    pub profile: Option<&'a FusedProfile>,
    /// Character name the answer should be voiced as.
    pub character: Option<&'a str>,
}

/// Builds grounded prompts and validates replies.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    provider: Arc<dyn GenerationProvider>,
    history_window: usize,
}

impl GenerationOrchestrator {
    pub fn new(provider: Arc<dyn GenerationProvider>, history_window: usize) -> Self {
        Self {
            provider,
            history_window,
        }
    }

    /// Produce a grounded answer, advancing `trace` from `Retrieving`.
    ///
    /// A fresh trace (still `AwaitingQuery`) is first moved to `Retrieving`.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires before dispatch or while the
    ///   provider call is in flight.
    /// - Provider errors, with the trace ending in `Failed`.
    pub async fn generate(
        &self,
        req: &GenerationRequest<'_>,
        trace: &mut TurnTrace,
        cancel: &CancelToken,
    ) -> Result<GroundedAnswer> {
        if trace.current() == TurnState::AwaitingQuery {
            trace.advance(TurnState::Retrieving)?;
        }

        if req.evidence.is_empty() {
            trace.advance(TurnState::NoEvidence)?;
            trace.advance(TurnState::Refusing)?;
            return Ok(refusal(trace, 0));
        }

        trace.advance(TurnState::HasEvidence)?;
        if cancel.is_cancelled() {
            trace.fail();
            return Err(Error::Cancelled);
        }

        let prompt = self.build_prompt(req);
        trace.advance(TurnState::Generating)?;
        let reply = match self.provider.generate(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                trace.fail();
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            trace.fail();
            return Err(Error::Cancelled);
        }

        trace.advance(TurnState::Validating)?;
        let validated = validate_reply(&reply, req.evidence);
        if validated.refused || validated.attributed == 0 {
            trace.advance(TurnState::Refusing)?;
            return Ok(refusal(trace, validated.dropped));
        }

        trace.advance(TurnState::Delivering)?;
        let evidence_used = req
            .evidence
            .iter()
            .enumerate()
            .filter(|(i, _)| validated.cited.contains(i))
            .map(|(_, e)| e.clone())
            .collect();

        Ok(GroundedAnswer {
            text: validated.text,
            evidence_used,
            outcome: Outcome::Delivered,
            trace: trace.states().to_vec(),
            dropped_sentences: validated.dropped,
        })
    }

    /// Assemble the provider prompt.
    pub fn build_prompt(&self, req: &GenerationRequest<'_>) -> String {
        let mut prompt = String::new();

        match req.character {
            Some(name) => prompt.push_str(&format!(
                "You are {}, answering questions about the book you appear in. Speak in {}'s voice.\n",
                name, name
            )),
            None => prompt.push_str("You are answering questions about the selected books.\n"),
        }

        if let Some(profile) = req.profile {
            let attrs = &profile.attributes;
            prompt.push_str("Voice constraints:\n");
            push_descriptors(&mut prompt, "Tone", &attrs.tone);
            push_descriptors(&mut prompt, "Values", &attrs.values);
            push_descriptors(&mut prompt, "Speech patterns", &attrs.speech_patterns);
            if let Some(style) = &attrs.writing_style {
                prompt.push_str(&format!("- Writing style: {}\n", style));
            }
            if let Some(voice) = &attrs.voice {
                prompt.push_str(&format!("- Voice: {}\n", voice));
            }
        }

        prompt.push_str(&format!(
            "\nAnswer ONLY from the sources below. Cite every claim with its source marker, like [S1].\n\
             Do not use outside knowledge. If the sources do not contain the answer, reply exactly: {}\n\nSources:\n",
            REFUSAL_RESPONSE
        ));
        for (i, item) in req.evidence.iter().enumerate() {
            prompt.push_str(&format!(
                "[S{}] (book {}, chunk {})\n{}\n\n",
                i + 1,
                item.book_id,
                item.chunk_id,
                item.text
            ));
        }

        let start = req.history.len().saturating_sub(self.history_window);
        let recent = &req.history[start..];
        if !recent.is_empty() {
            prompt.push_str("Conversation so far:\n");
            for turn in recent {
                let who = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                prompt.push_str(&format!("{}: {}\n", who, turn.text));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!("Question: {}\nAnswer:", req.query));
        prompt
    }
}

fn push_descriptors(prompt: &mut String, name: &str, descriptors: &[Descriptor]) {
    if descriptors.is_empty() {
        return;
    }
    let labels: Vec<&str> = descriptors.iter().map(|d| d.label.as_str()).collect();
    prompt.push_str(&format!("- {}: {}\n", name, labels.join(", ")));
}

fn refusal(trace: &TurnTrace, dropped: usize) -> GroundedAnswer {
    GroundedAnswer {
        text: REFUSAL_RESPONSE.to_string(),
        evidence_used: Vec::new(),
        outcome: Outcome::Refused,
        trace: trace.states().to_vec(),
        dropped_sentences: dropped,
    }
}

/// Result of checking a reply against its evidence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Validation {
    pub text: String,
    /// Zero-based evidence indices cited or matched.
    pub cited: BTreeSet<usize>,
    pub attributed: usize,
    pub dropped: usize,
    /// The reply contained the refusal sentence.
    pub refused: bool,
}

/// Strip unknown markers and drop claim sentences no evidence supports.
pub fn validate_reply(reply: &str, evidence: &[EvidenceItem]) -> Validation {
    let evidence_words: Vec<HashSet<String>> = evidence
        .iter()
        .map(|e| content_words(&e.text).into_iter().collect())
        .collect();

    let mut out = Validation::default();
    let mut kept: Vec<String> = Vec::new();

    for sentence in split_sentences(reply) {
        let mut known = BTreeSet::new();
        let cleaned = MARKER.replace_all(&sentence, |caps: &regex::Captures| {
            match caps[1].parse::<usize>() {
                Ok(n) if n >= 1 && n <= evidence.len() => {
                    known.insert(n - 1);
                    caps[0].to_string()
                }
                _ => String::new(),
            }
        });
        let cleaned = cleaned.trim().to_string();
        let bare = MARKER.replace_all(&cleaned, "");
        let bare = bare.trim();

        if bare.is_empty() {
            continue;
        }
        if bare.eq_ignore_ascii_case(REFUSAL_RESPONSE) || bare.contains(REFUSAL_RESPONSE) {
            out.refused = true;
            continue;
        }
        if bare.split_whitespace().count() < MIN_CLAIM_WORDS {
            kept.push(cleaned);
            continue;
        }

        if !known.is_empty() {
            out.cited.extend(known);
            out.attributed += 1;
            kept.push(cleaned);
            continue;
        }

        match best_overlap(bare, &evidence_words) {
            Some(i) => {
                out.cited.insert(i);
                out.attributed += 1;
                kept.push(cleaned);
            }
            None => out.dropped += 1,
        }
    }

    out.text = kept.join(" ");
    out
}

/// Index of the evidence chunk sharing the largest share (≥ 50%) of the
/// sentence's content words. Earlier chunks win ties.
fn best_overlap(sentence: &str, evidence_words: &[HashSet<String>]) -> Option<usize> {
    let words = content_words(sentence);
    if words.is_empty() {
        return None;
    }
    let mut best: Option<(usize, f64)> = None;
    for (i, set) in evidence_words.iter().enumerate() {
        let shared = words.iter().filter(|w| set.contains(*w)).count();
        let ratio = shared as f64 / words.len() as f64;
        if ratio >= MIN_CONTENT_OVERLAP && best.map_or(true, |(_, r)| ratio > r) {
            best = Some((i, ratio));
        }
    }
    best.map(|(i, _)| i)
}

/// Lowercased, de-duplicated words of three or more letters, minus stopwords.
pub fn content_words(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Split on sentence-final punctuation (keeping trailing markers with their
/// sentence) and on line breaks.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            if !matches!(c, '.' | '!' | '?') {
                continue;
            }
            // Absorb closing quotes and any citation markers that follow.
            while let Some(&q) = chars.peek() {
                if matches!(q, '"' | '\'' | '”' | '’' | ')') {
                    current.push(q);
                    chars.next();
                } else {
                    break;
                }
            }
            let rest: String = chars.clone().collect();
            let trailing = leading_markers(&rest);
            if trailing > 0 {
                for _ in 0..rest[..trailing].chars().count() {
                    if let Some(m) = chars.next() {
                        current.push(m);
                    }
                }
            }
            match chars.peek() {
                None => {}
                Some(n) if n.is_whitespace() => {}
                _ => continue,
            }
            let s = current.trim();
            if !s.is_empty() {
                sentences.push(s.to_string());
            }
            current.clear();
        }
        let s = current.trim();
        if !s.is_empty() {
            sentences.push(s.to_string());
        }
    }
    sentences
}

/// Byte length of citation markers (with leading spaces) at the start of `s`.
fn leading_markers(s: &str) -> usize {
    let mut end = 0;
    while let Some(m) = MARKER.find(&s[end..]) {
        if m.start() != 0 {
            break;
        }
        end += m.end();
    }
    end
}
