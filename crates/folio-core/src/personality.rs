//! Personality extraction: book and character voice profiles.
//!
//! The extractor samples a book's chunks, asks the generation provider for a
//! structured voice description, and normalizes the reply into a
//! [`PersonalityProfile`]. Characters are found deterministically by dialogue
//! attribution (`"…," said Ahab`, `Ahab asked`) before any provider call.
//!
//! # Confidence
//!
//! `confidence = 0.6 × min(1, supporting / 12) + 0.4 × spread`, where
//! `spread` is the share of the book's ten narrative deciles that contain at
//! least one supporting chunk.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::embedding::GenerationProvider;
use crate::error::{Error, Result};
use crate::models::{Chunk, Descriptor, PersonalityProfile, ProfileAttributes, ProfileTarget};

/// Supporting chunks at which evidence density saturates.
pub const DENSITY_SATURATION: usize = 12;

/// Descriptors kept per attribute category.
pub const MAX_DESCRIPTORS: usize = 10;

/// Longest excerpt sent to the provider per chunk, in bytes.
const MAX_EXCERPT_BYTES: usize = 1200;

const ATTRIBUTION_VERBS: &str = "said|asked|cried|replied|shouted|whispered|answered|exclaimed|muttered";

/// `"…," said Ahab` / `”said Captain Ahab`
static QUOTE_THEN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"["”]\s*(?:{})\s+(\p{{Lu}}[\p{{L}}'-]*(?:\s+\p{{Lu}}[\p{{L}}'-]*)?)"#,
        ATTRIBUTION_VERBS
    ))
    .expect("static regex")
});

/// `Ahab asked` / `Captain Ahab replied`
static NAME_THEN_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b(\p{{Lu}}[\p{{L}}'-]*(?:\s+\p{{Lu}}[\p{{L}}'-]*)?)\s+(?:{})\b",
        ATTRIBUTION_VERBS
    ))
    .expect("static regex")
});

/// Pronouns and sentence starters that look like names after a capital.
const IGNORED_WORDS: &[&str] = &[
    "I", "He", "She", "It", "We", "They", "You", "Him", "Her", "Them", "Us", "Me", "His", "Hers",
    "Its", "Our", "Their", "Your", "My", "The", "A", "An", "And", "But", "Or", "So", "Then",
    "Now", "Yet", "This", "That", "These", "Those", "There", "Here", "When", "While", "As",
    "If", "What", "Who", "Why", "How", "Where", "One", "Someone", "Everyone", "Nobody", "All",
    "Some", "Still", "Again", "Thus",
];

/// Extraction tuning parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonalityParams {
    /// Books with more chunks than this are sampled down to this many.
    pub sample_threshold: usize,
    pub min_character_chunks: usize,
    pub max_characters: usize,
}

impl Default for PersonalityParams {
    fn default() -> Self {
        Self {
            sample_threshold: 24,
            min_character_chunks: 3,
            max_characters: 5,
        }
    }
}

/// A character name found by dialogue attribution, with its supporting chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterCandidate {
    pub name: String,
    /// Ids of distinct chunks that mention the character, in position order.
    pub chunk_ids: Vec<String>,
}

/// A character that was detected but not profiled.
#[derive(Debug, Clone, PartialEq)]
pub struct OmittedCharacter {
    pub name: String,
    pub reason: Error,
}

/// Result of [`PersonalityExtractor::extract_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub book_profile: PersonalityProfile,
    pub characters: Vec<PersonalityProfile>,
    pub omitted: Vec<OmittedCharacter>,
}

impl Extraction {
    /// Book profile followed by character profiles.
    pub fn profiles(&self) -> Vec<PersonalityProfile> {
        std::iter::once(self.book_profile.clone())
            .chain(self.characters.iter().cloned())
            .collect()
    }
}

/// Derives personality profiles with an injected generation provider.
#[derive(Clone)]
pub struct PersonalityExtractor {
    generator: Arc<dyn GenerationProvider>,
    params: PersonalityParams,
}

impl PersonalityExtractor {
    pub fn new(generator: Arc<dyn GenerationProvider>, params: PersonalityParams) -> Self {
        Self { generator, params }
    }

    /// Profile a book, or one character in it when `character_hint` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::InsufficientEvidence`] if the book has no chunks, or the
    ///   character appears in fewer than `min_character_chunks` chunks.
    /// - [`Error::ProviderUnavailable`] if the provider fails or its reply
    ///   cannot be parsed.
    pub async fn extract(
        &self,
        book_id: &str,
        chunks: &[Chunk],
        character_hint: Option<&str>,
    ) -> Result<PersonalityProfile> {
        let (target, supporting): (ProfileTarget, Vec<&Chunk>) = match character_hint {
            None => (ProfileTarget::book(book_id), chunks.iter().collect()),
            Some(name) => (
                ProfileTarget::character(book_id, name),
                chunks.iter().filter(|c| mentions(&c.text, name)).collect(),
            ),
        };

        let required = match target {
            ProfileTarget::Book { .. } => 1,
            ProfileTarget::Character { .. } => self.params.min_character_chunks.max(1),
        };
        if supporting.len() < required {
            return Err(Error::InsufficientEvidence {
                target: target.label(),
                found: supporting.len(),
                required,
            });
        }

        let sample = sample_evenly(&supporting, self.params.sample_threshold);
        let prompt = build_extraction_prompt(&target, &sample);
        let reply = self.generator.generate(&prompt).await?;
        let attributes = parse_attributes(&reply)?;

        let positions: Vec<i64> = supporting.iter().map(|c| c.position).collect();
        let confidence = compute_confidence(supporting.len(), &positions, chunks.len());

        tracing::debug!(
            profile = %target.label(),
            supporting = supporting.len(),
            sampled = sample.len(),
            confidence,
            "extracted personality profile"
        );

        Ok(PersonalityProfile {
            target,
            attributes,
            confidence,
            source_chunk_ids: sample.iter().map(|c| c.id.clone()).collect(),
        })
    }

    /// Profile a book and every qualifying character in it.
    ///
    /// Characters below the support threshold are listed in `omitted`
    /// without a provider call. A provider failure on a character omits that
    /// character; a failure on the book profile fails the whole extraction.
    pub async fn extract_all(&self, book_id: &str, chunks: &[Chunk]) -> Result<Extraction> {
        let book_profile = self.extract(book_id, chunks, None).await?;

        let mut characters = Vec::new();
        let mut omitted = Vec::new();
        for candidate in detect_characters(chunks) {
            if characters.len() >= self.params.max_characters {
                break;
            }
            if candidate.chunk_ids.len() < self.params.min_character_chunks {
                omitted.push(OmittedCharacter {
                    reason: Error::InsufficientEvidence {
                        target: ProfileTarget::character(book_id, &candidate.name).label(),
                        found: candidate.chunk_ids.len(),
                        required: self.params.min_character_chunks,
                    },
                    name: candidate.name,
                });
                continue;
            }
            match self.extract(book_id, chunks, Some(&candidate.name)).await {
                Ok(profile) => characters.push(profile),
                Err(e) => {
                    tracing::warn!(book_id, character = %candidate.name, error = %e, "character omitted");
                    omitted.push(OmittedCharacter {
                        name: candidate.name,
                        reason: e,
                    });
                }
            }
        }

        Ok(Extraction {
            book_profile,
            characters,
            omitted,
        })
    }
}

/// Find characters by dialogue attribution.
///
/// Candidates are ordered by support (distinct mentioning chunks)
/// descending, then name ascending.
pub fn detect_characters(chunks: &[Chunk]) -> Vec<CharacterCandidate> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for chunk in chunks {
        for re in [&*QUOTE_THEN_NAME, &*NAME_THEN_VERB] {
            for cap in re.captures_iter(&chunk.text) {
                if let Some(name) = cap.get(1).and_then(|m| clean_name(m.as_str())) {
                    names.insert(name);
                }
            }
        }
    }

    let mut candidates: Vec<CharacterCandidate> = names
        .into_iter()
        .map(|name| {
            let chunk_ids = chunks
                .iter()
                .filter(|c| mentions(&c.text, &name))
                .map(|c| c.id.clone())
                .collect();
            CharacterCandidate { name, chunk_ids }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.chunk_ids
            .len()
            .cmp(&a.chunk_ids.len())
            .then_with(|| a.name.cmp(&b.name))
    });
    candidates
}

fn clean_name(raw: &str) -> Option<String> {
    let words: Vec<&str> = raw
        .split_whitespace()
        .skip_while(|w| IGNORED_WORDS.contains(w))
        .collect();
    if words.is_empty() || words.iter().any(|w| IGNORED_WORDS.contains(w)) {
        return None;
    }
    Some(words.join(" "))
}

/// Whole-word, case-sensitive mention check.
fn mentions(text: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    text.match_indices(name).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + name.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Deterministic evenly spaced sample that keeps the first and last item.
pub fn sample_evenly<'a>(items: &[&'a Chunk], threshold: usize) -> Vec<&'a Chunk> {
    let n = items.len();
    let k = threshold.max(2);
    if n <= k {
        return items.to_vec();
    }
    let mut picked: Vec<usize> = (0..k).map(|i| i * (n - 1) / (k - 1)).collect();
    picked.dedup();
    picked.into_iter().map(|i| items[i]).collect()
}

/// `0.6 × density + 0.4 × spread`, clamped to `[0, 1]`.
pub fn compute_confidence(supporting: usize, positions: &[i64], total_chunks: usize) -> f64 {
    let density = (supporting as f64 / DENSITY_SATURATION as f64).min(1.0);
    let spread = if total_chunks == 0 {
        0.0
    } else {
        let deciles: BTreeSet<usize> = positions
            .iter()
            .map(|&p| ((p.max(0) as usize) * 10 / total_chunks).min(9))
            .collect();
        deciles.len() as f64 / 10.0
    };
    (0.6 * density + 0.4 * spread).clamp(0.0, 1.0)
}

fn build_extraction_prompt(target: &ProfileTarget, sample: &[&Chunk]) -> String {
    let subject = match target {
        ProfileTarget::Book { .. } => "the narrative voice of this book".to_string(),
        ProfileTarget::Character { name, .. } => format!("the character {}", name),
    };

    let mut prompt = format!(
        "Analyze the personality and voice of {}, using only the excerpts below.\n\
         Respond with a single JSON object and nothing else, with these keys:\n\
         \"tone\": array of short tone descriptors, strongest first\n\
         \"values\": array of values or beliefs expressed, strongest first\n\
         \"speech_patterns\": array of recurring speech or phrasing markers\n\
         \"writing_style\": one sentence describing the prose style\n\
         \"voice\": one sentence describing how this voice sounds\n\nExcerpts:\n",
        subject
    );
    for (i, chunk) in sample.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (position {}) {}\n\n",
            i + 1,
            chunk.position,
            excerpt(&chunk.text)
        ));
    }
    prompt
}

fn excerpt(text: &str) -> &str {
    if text.len() <= MAX_EXCERPT_BYTES {
        return text;
    }
    let mut end = MAX_EXCERPT_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Locate the first balanced `{...}` object in a reply.
pub fn first_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in reply[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&reply[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse and normalize a provider reply into attributes.
///
/// # Errors
///
/// [`Error::ProviderUnavailable`] when no JSON object is found, it does not
/// parse, or it carries no usable attribute.
pub fn parse_attributes(reply: &str) -> Result<ProfileAttributes> {
    let raw = first_json_object(reply).ok_or_else(|| {
        Error::ProviderUnavailable("personality reply contained no JSON object".to_string())
    })?;
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        Error::ProviderUnavailable(format!("personality reply was not valid JSON: {}", e))
    })?;

    let attributes = ProfileAttributes {
        tone: descriptors(value.get("tone")),
        values: descriptors(value.get("values")),
        speech_patterns: descriptors(value.get("speech_patterns")),
        writing_style: scalar(value.get("writing_style")),
        voice: scalar(value.get("voice")),
    };

    let empty = attributes.tone.is_empty()
        && attributes.values.is_empty()
        && attributes.speech_patterns.is_empty()
        && attributes.writing_style.is_none()
        && attributes.voice.is_none();
    if empty {
        return Err(Error::ProviderUnavailable(
            "personality reply carried no attributes".to_string(),
        ));
    }
    Ok(attributes)
}

/// Normalized descriptors with rank weight `max(0.1, 1 − 0.15·rank)`.
fn descriptors(value: Option<&Value>) -> Vec<Descriptor> {
    let labels: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for label in labels {
        let label = label
            .trim()
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .trim()
            .to_lowercase();
        if label.is_empty() || !seen.insert(label.clone()) {
            continue;
        }
        let rank = out.len();
        out.push(Descriptor::new(label, (1.0 - 0.15 * rank as f64).max(0.1)));
        if out.len() >= MAX_DESCRIPTORS {
            break;
        }
    }
    out
}

fn scalar(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
