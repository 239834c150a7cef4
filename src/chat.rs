//! One chat turn: access check → (retrieval ∥ profile fusion) → grounded
//! generation → history update.
//!
//! Retrieval and fusion run concurrently and are joined before generation.
//! A retrieval deadline degrades the turn to "no evidence" with a warning;
//! a generation deadline fails the turn. History is only appended when a
//! turn completes, so failed and cancelled turns leave the session as it was.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use folio_core::fusion::{fuse, session_weights, FusedProfile};
use folio_core::generation::{
    GenerationOrchestrator, GenerationRequest, Outcome, TurnTrace, GUIDANCE_RESPONSE,
};
use folio_core::models::{ConversationTurn, EvidenceItem, PersonalityProfile, ProfileTarget, Role};
use folio_core::retrieval::{Retrieval, Retriever, Warning};
use folio_core::session::{CancelToken, ChatSession};
use folio_core::store::BookStore;
use folio_core::{Error, Result};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatOutcome {
    Delivered,
    Refused,
    /// No book was selected; nothing was retrieved or generated.
    Guidance,
}

impl From<Outcome> for ChatOutcome {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Delivered => ChatOutcome::Delivered,
            Outcome::Refused => ChatOutcome::Refused,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response_text: String,
    pub evidence_used: Vec<EvidenceItem>,
    pub warnings: Vec<Warning>,
    pub outcome: ChatOutcome,
}

/// A self-contained turn: the caller supplies the conversation so far.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub book_ids: Vec<String>,
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    pub message: String,
    #[serde(default)]
    pub requester: Option<String>,
}

impl ChatRequest {
    /// Rebuild a session, counting prior evidence per book from the
    /// assistant turns in `history`.
    pub fn into_session(self) -> (ChatSession, String) {
        let mut session = ChatSession::new(self.book_ids);
        session.character_id = self.character_id;
        session.requester = self.requester;
        let mut hit_counts: HashMap<String, usize> = HashMap::new();
        for turn in self.history.iter().filter(|t| t.role == Role::Assistant) {
            for item in &turn.evidence {
                *hit_counts.entry(item.book_id.clone()).or_insert(0) += 1;
            }
        }
        session.hit_counts = hit_counts;
        session.history = self.history;
        (session, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub top_k: usize,
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            retrieval_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(60),
        }
    }
}

/// Profiles blended for a turn.
struct Voice {
    profile: Option<FusedProfile>,
    character: Option<String>,
    warnings: Vec<Warning>,
}

pub struct ChatService {
    store: Arc<dyn BookStore>,
    retriever: Retriever,
    generator: GenerationOrchestrator,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn BookStore>,
        retriever: Retriever,
        generator: GenerationOrchestrator,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            retriever,
            generator,
            settings,
        }
    }

    /// Run one turn against `session`, appending to its history on success.
    ///
    /// # Errors
    ///
    /// - [`Error::BookNotFound`] for unknown books or books the requester
    ///   may not read.
    /// - [`Error::IndexUnavailable`] if no selected book could be searched.
    /// - [`Error::Timeout`] if generation exceeds its deadline.
    /// - [`Error::Cancelled`] if `cancel` fires.
    /// - Provider errors after retries are exhausted.
    pub async fn chat(
        &self,
        session: &mut ChatSession,
        message: &str,
        cancel: &CancelToken,
    ) -> Result<ChatResponse> {
        if session.book_ids.is_empty() {
            return Ok(ChatResponse {
                response_text: GUIDANCE_RESPONSE.to_string(),
                evidence_used: Vec::new(),
                warnings: Vec::new(),
                outcome: ChatOutcome::Guidance,
            });
        }
        if message.trim().is_empty() {
            return Err(Error::MalformedInput("message is empty".to_string()));
        }
        self.check_access(session).await?;

        let (retrieval, voice) = tokio::join!(
            self.retrieve(session, message),
            self.blend_profiles(session)
        );
        let retrieval = retrieval?;
        let voice = voice?;

        let request = GenerationRequest {
            query: message,
            history: &session.history,
            evidence: &retrieval.evidence,
            profile: voice.profile.as_ref(),
            character: voice.character.as_deref(),
        };
        let mut trace = TurnTrace::new();
        let answer = match tokio::time::timeout(
            self.settings.generation_timeout,
            self.generator.generate(&request, &mut trace, cancel),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    session = %session.id,
                    timeout_ms = self.settings.generation_timeout.as_millis() as u64,
                    "generation timed out"
                );
                return Err(Error::Timeout("generation".to_string()));
            }
        };

        let mut warnings = retrieval.warnings;
        warnings.extend(voice.warnings);

        tracing::info!(
            session = %session.id,
            books = session.book_ids.len(),
            evidence = retrieval.evidence.len(),
            cited = answer.evidence_used.len(),
            dropped = answer.dropped_sentences,
            outcome = ?answer.outcome,
            "chat turn complete"
        );

        session.record_exchange(message, &answer.text, answer.evidence_used.clone());
        Ok(ChatResponse {
            response_text: answer.text,
            evidence_used: answer.evidence_used,
            warnings,
            outcome: answer.outcome.into(),
        })
    }

    /// Run a self-contained turn.
    pub async fn chat_once(&self, request: ChatRequest) -> Result<ChatResponse> {
        let (mut session, message) = request.into_session();
        self.chat(&mut session, &message, &CancelToken::new()).await
    }

    async fn check_access(&self, session: &ChatSession) -> Result<()> {
        for book_id in &session.book_ids {
            match self.store.get_book(book_id).await? {
                Some(book) if book.is_readable_by(session.requester.as_deref()) => {}
                _ => return Err(Error::BookNotFound(book_id.clone())),
            }
        }
        Ok(())
    }

    async fn retrieve(&self, session: &ChatSession, message: &str) -> Result<Retrieval> {
        let timeout = self.settings.retrieval_timeout;
        match tokio::time::timeout(
            timeout,
            self.retriever.retrieve(
                message,
                &session.book_ids,
                self.settings.top_k,
                &session.history,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let after_ms = timeout.as_millis() as u64;
                tracing::warn!(session = %session.id, after_ms, "retrieval timed out");
                Ok(Retrieval {
                    evidence: Vec::new(),
                    warnings: vec![Warning::RetrievalTimedOut { after_ms }],
                })
            }
        }
    }

    /// Fuse the selected books' profiles, with the requested character's
    /// profile as the most recent selection.
    async fn blend_profiles(&self, session: &ChatSession) -> Result<Voice> {
        let mut warnings = Vec::new();
        let mut selected: Vec<PersonalityProfile> = Vec::new();
        let mut character: Option<PersonalityProfile> = None;

        for book_id in &session.book_ids {
            let profiles = self.store.get_profiles(book_id).await?;
            match profiles
                .iter()
                .find(|p| matches!(p.target, ProfileTarget::Book { .. }))
            {
                Some(p) => selected.push(p.clone()),
                None => warnings.push(Warning::ProfileMissing {
                    book_id: book_id.clone(),
                }),
            }
            if let Some(wanted) = &session.character_id {
                if character.is_none() {
                    character = profiles
                        .into_iter()
                        .find(|p| p.target.character_id().as_deref() == Some(wanted.as_str()));
                }
            }
        }

        let mut character_name = None;
        if let Some(wanted) = &session.character_id {
            match character {
                Some(profile) => {
                    if let ProfileTarget::Character { name, .. } = &profile.target {
                        character_name = Some(name.clone());
                    }
                    selected.push(profile);
                }
                None => warnings.push(Warning::CharacterUnavailable {
                    character_id: wanted.clone(),
                }),
            }
        }

        if selected.is_empty() {
            return Ok(Voice {
                profile: None,
                character: character_name,
                warnings,
            });
        }

        let targets: Vec<ProfileTarget> = selected.iter().map(|p| p.target.clone()).collect();
        let weights = session_weights(&targets, &session.hit_counts);
        let pairs: Vec<(PersonalityProfile, f64)> = selected.into_iter().zip(weights).collect();
        let profile = fuse(&pairs)?;

        Ok(Voice {
            profile: Some(profile),
            character: character_name,
            warnings,
        })
    }
}
