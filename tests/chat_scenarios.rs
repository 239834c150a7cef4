//! End-to-end chat turns over in-memory backends and scripted providers.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use common::*;
use folio::chat::{ChatOutcome, ChatRequest, ChatService, ChatSettings};
use folio_core::embedding::{EmbeddingProvider, GenerationProvider};
use folio_core::generation::{GenerationOrchestrator, GUIDANCE_RESPONSE, REFUSAL_RESPONSE};
use folio_core::mock::{MockEmbedder, MockGenerator};
use folio_core::models::{ConversationTurn, EmbeddingModel, EvidenceItem, Visibility};
use folio_core::retrieval::{Retriever, Warning};
use folio_core::session::{CancelToken, ChatSession};
use folio_core::store::BookStore;
use folio_core::Error;

/// Embedder that sleeps `delay_ms` before every batch.
struct SlowEmbedder {
    inner: MockEmbedder,
    delay_ms: AtomicU64,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model(&self) -> EmbeddingModel {
        self.inner.model()
    }

    async fn embed_texts(&self, texts: &[String]) -> folio_core::Result<Vec<Vec<f32>>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.embed_texts(texts).await
    }
}

/// Generator that profiles normally but stalls or fails on answer prompts.
struct AnswerTrouble {
    inner: MockGenerator,
    stall: Option<Duration>,
}

#[async_trait]
impl GenerationProvider for AnswerTrouble {
    fn model_name(&self) -> &str {
        "answer-trouble"
    }

    async fn generate(&self, prompt: &str) -> folio_core::Result<String> {
        if prompt.contains("Question:") {
            match self.stall {
                Some(d) => tokio::time::sleep(d).await,
                None => return Err(Error::ProviderUnavailable("answer model offline".into())),
            }
        }
        self.inner.generate(prompt).await
    }
}

fn service(
    world: &World,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    settings: ChatSettings,
) -> ChatService {
    let config = &world.app.config;
    let retriever = Retriever::new(
        embedder,
        world.index.clone(),
        world.store.clone(),
        config.retrieval.params(),
    );
    ChatService::new(
        world.store.clone(),
        retriever,
        GenerationOrchestrator::new(generator, config.retrieval.history_window),
        settings,
    )
}

#[tokio::test]
async fn test_grounded_answer_cites_small_book() {
    let w = world();
    ingest_library(&w).await;

    let mut session = ChatSession::new(ids(&["whaling", "courtship"]));
    let response = w
        .app
        .chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Delivered);
    assert_eq!(response.response_text, ANSWER);
    assert_eq!(response.evidence_used.len(), 1);
    assert_eq!(response.evidence_used[0].book_id, "courtship");
    assert!(response.evidence_used[0].text.contains("Hunsford"));
    assert!(response.warnings.is_empty(), "{:?}", response.warnings);

    assert_eq!(session.history.len(), 2);
    assert_eq!(session.history[0].text, "Why does Elizabeth refuse Darcy's proposal?");
    assert_eq!(session.history[1].evidence, response.evidence_used);
    assert!(session.hit_counts["courtship"] >= 1);
    assert!(!session.hit_counts.contains_key("whaling"));
}

#[tokio::test]
async fn test_toy_moby_dick_answers_from_the_ahab_chunk() {
    const AHAB_ANSWER: &str = "Ahab wants revenge on the white whale [S1].";
    let w = world_with(
        MockGenerator::new(vec![COURTSHIP_PROFILE.to_string()])
            .with_rule("Question: What does Ahab want?", AHAB_ANSWER),
    );
    let moby = book(
        "moby",
        &[
            "Call me Ishmael. Some years ago I went to sea to see the watery part of the world."
                .to_string(),
            "Ahab will want nothing but the white whale, and revenge for his leg.".to_string(),
            "Queequeg sharpens his harpoon in the room they share at the Spouter Inn.".to_string(),
        ],
    );
    let report = w.app.ingest.ingest_now(&moby).await.unwrap();
    assert_eq!(report.chunks, 3);

    let mut session = ChatSession::new(ids(&["moby"]));
    let response = w
        .app
        .chat
        .chat(&mut session, "What does Ahab want?", &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Delivered);
    assert_eq!(response.response_text, AHAB_ANSWER);
    assert_eq!(response.evidence_used.len(), 1);
    assert_eq!(response.evidence_used[0].position, 1);
    assert!(response.evidence_used[0].text.starts_with("Ahab will want"));
    assert!(!response.response_text.contains("[S2]"));

    let prompt = w.generator.prompts().last().unwrap().clone();
    assert!(prompt.contains("Ahab will want"));
    assert!(!prompt.contains("Ishmael"));
    assert!(!prompt.contains("Queequeg"));
}

#[tokio::test]
async fn test_no_books_selected_returns_guidance() {
    let w = world();
    let mut session = ChatSession::new(Vec::new());

    let response = w
        .app
        .chat
        .chat(&mut session, "Who is Ahab?", &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Guidance);
    assert_eq!(response.response_text, GUIDANCE_RESPONSE);
    assert!(response.evidence_used.is_empty());
    assert_eq!(w.generator.calls(), 0);
    assert_eq!(w.embedder.texts_embedded(), 0);
    assert!(session.history.is_empty());
}

#[tokio::test]
async fn test_unrelated_question_is_refused_without_answer_call() {
    let w = world();
    ingest_library(&w).await;
    let calls = w.generator.calls();

    let mut session = ChatSession::new(ids(&["courtship"]));
    let response = w
        .app
        .chat
        .chat(
            &mut session,
            "Describe harpoon velocity calculations",
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Refused);
    assert_eq!(response.response_text, REFUSAL_RESPONSE);
    assert!(response.evidence_used.is_empty());
    assert_eq!(w.generator.calls(), calls);
    // A refusal is still a completed turn.
    assert_eq!(session.history.len(), 2);
}

#[tokio::test]
async fn test_character_voice_blends_book_and_character_profiles() {
    let w = world();
    ingest_library(&w).await;

    let book = w.app.store.get_book("courtship").await.unwrap().unwrap();
    assert_eq!(book.character_ids, vec!["elizabeth"]);

    let mut session = ChatSession::new(ids(&["whaling", "courtship"])).with_character("elizabeth");
    let response = w
        .app
        .chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.outcome, ChatOutcome::Delivered);
    assert!(response.warnings.is_empty(), "{:?}", response.warnings);

    let prompts = w.generator.prompts();
    let prompt = prompts.last().unwrap();
    assert!(prompt.starts_with("You are Elizabeth"));
    assert!(prompt.contains("Voice constraints:"));
    assert!(prompt.contains("witty"));
    assert!(prompt.contains("grand"));
    assert!(prompt.contains("playful"));
}

#[tokio::test]
async fn test_unknown_character_warns_and_answers_in_narrator_voice() {
    let w = world();
    ingest_library(&w).await;

    let mut session = ChatSession::new(ids(&["courtship"])).with_character("mr-collins");
    let response = w
        .app
        .chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Delivered);
    assert_eq!(
        response.warnings,
        vec![Warning::CharacterUnavailable {
            character_id: "mr-collins".into()
        }]
    );
    let prompts = w.generator.prompts();
    assert!(prompts
        .last()
        .unwrap()
        .starts_with("You are answering questions about the selected books."));
}

#[tokio::test]
async fn test_book_without_profile_warns() {
    let w = world();
    ingest_library(&w).await;
    w.app.store.save_profiles("courtship", &[]).await.unwrap();

    let mut session = ChatSession::new(ids(&["courtship"]));
    let response = w
        .app
        .chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Delivered);
    assert_eq!(
        response.warnings,
        vec![Warning::ProfileMissing {
            book_id: "courtship".into()
        }]
    );
    let prompts = w.generator.prompts();
    assert!(!prompts.last().unwrap().contains("Voice constraints:"));
}

#[tokio::test]
async fn test_retrieval_timeout_degrades_to_refusal() {
    let w = world();
    ingest_library(&w).await;
    let calls = w.generator.calls();

    let slow = Arc::new(SlowEmbedder {
        inner: MockEmbedder::new(),
        delay_ms: AtomicU64::new(500),
    });
    let chat = service(
        &w,
        slow,
        w.generator.clone(),
        ChatSettings {
            retrieval_timeout: Duration::from_millis(50),
            ..ChatSettings::default()
        },
    );

    let mut session = ChatSession::new(ids(&["courtship"]));
    let response = chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, ChatOutcome::Refused);
    assert_eq!(response.response_text, REFUSAL_RESPONSE);
    assert!(response
        .warnings
        .contains(&Warning::RetrievalTimedOut { after_ms: 50 }));
    assert_eq!(w.generator.calls(), calls);
}

#[tokio::test]
async fn test_generation_timeout_fails_turn_and_keeps_history() {
    let w = world();
    ingest_library(&w).await;

    let stalled = Arc::new(AnswerTrouble {
        inner: scripted_generator(),
        stall: Some(Duration::from_millis(500)),
    });
    let chat = service(
        &w,
        w.embedder.clone(),
        stalled,
        ChatSettings {
            generation_timeout: Duration::from_millis(50),
            ..ChatSettings::default()
        },
    );

    let mut session = ChatSession::new(ids(&["courtship"]));
    let before = session.clone();
    let err = chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(session, before);
}

#[tokio::test]
async fn test_provider_failure_fails_turn_and_keeps_history() {
    let w = world();
    ingest_library(&w).await;

    let failing = Arc::new(AnswerTrouble {
        inner: scripted_generator(),
        stall: None,
    });
    let chat = service(&w, w.embedder.clone(), failing, ChatSettings::default());

    let mut session = ChatSession::new(ids(&["courtship"]));
    session.record_exchange("Who hosts the ball?", "Mrs Bennet [S1].", Vec::new());
    let before = session.clone();

    let err = chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProviderUnavailable(_)));
    assert_eq!(session, before);
}

#[tokio::test]
async fn test_cancelled_turn_keeps_history() {
    let w = world();
    ingest_library(&w).await;
    let calls = w.generator.calls();

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut session = ChatSession::new(ids(&["courtship"]));
    let err = w
        .app
        .chat
        .chat(&mut session, "Why does Elizabeth refuse Darcy's proposal?", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(session.history.is_empty());
    assert_eq!(w.generator.calls(), calls);
}

#[tokio::test]
async fn test_blank_message_is_malformed() {
    let w = world();
    ingest_library(&w).await;

    let mut session = ChatSession::new(ids(&["courtship"]));
    let err = w
        .app
        .chat
        .chat(&mut session, "   ", &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedInput(_)));
}

#[tokio::test]
async fn test_private_book_is_hidden_from_other_readers() {
    let w = world();
    let mut private = book("diary", &courtship());
    private.visibility = Visibility::Private;
    private.owner_id = Some("alice".into());
    w.app.ingest.ingest_now(&private).await.unwrap();

    let question = "Why does Elizabeth refuse Darcy's proposal?";

    let mut as_bob = ChatSession::new(ids(&["diary"])).with_requester("bob");
    let err = w
        .app
        .chat
        .chat(&mut as_bob, question, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BookNotFound(ref id) if id == "diary"));

    let mut anonymous = ChatSession::new(ids(&["diary"]));
    assert!(w
        .app
        .chat
        .chat(&mut anonymous, question, &CancelToken::new())
        .await
        .is_err());

    let mut as_alice = ChatSession::new(ids(&["diary"])).with_requester("alice");
    let response = w
        .app
        .chat
        .chat(&mut as_alice, question, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(response.outcome, ChatOutcome::Delivered);
}

#[tokio::test]
async fn test_unknown_book_is_not_found() {
    let w = world();
    let mut session = ChatSession::new(ids(&["missing"]));
    let err = w
        .app
        .chat
        .chat(&mut session, "Anything?", &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BookNotFound(_)));
    assert_eq!(w.generator.calls(), 0);
}

#[tokio::test]
async fn test_reingesting_unchanged_book_is_noop() {
    let w = world();
    ingest_library(&w).await;
    let calls = w.generator.calls();
    let embedded = w.embedder.texts_embedded();

    let report = w
        .app
        .ingest
        .ingest_now(&book("courtship", &courtship()))
        .await
        .unwrap();

    assert_eq!(report.embedded, 0);
    assert_eq!(report.removed, 0);
    assert!(report.profiles_reused);
    assert_eq!(w.generator.calls(), calls);
    assert_eq!(w.embedder.texts_embedded(), embedded);
}

#[tokio::test]
async fn test_stateless_request_counts_history_hits() {
    let hit = |book: &str| EvidenceItem {
        chunk_id: format!("{}-0", book),
        book_id: book.into(),
        position: 0,
        score: 0.8,
        rank: 1,
        text: "t".into(),
    };
    let request = ChatRequest {
        book_ids: ids(&["whaling", "courtship"]),
        character_id: Some("elizabeth".into()),
        history: vec![
            ConversationTurn::user("first"),
            ConversationTurn::assistant("a [S1] [S2]", vec![hit("courtship"), hit("courtship")]),
            ConversationTurn::user("second"),
            ConversationTurn::assistant("b [S1]", vec![hit("whaling")]),
        ],
        message: "third".into(),
        requester: Some("alice".into()),
    };

    let (session, message) = request.into_session();
    assert_eq!(message, "third");
    assert_eq!(session.history.len(), 4);
    assert_eq!(session.hit_counts["courtship"], 2);
    assert_eq!(session.hit_counts["whaling"], 1);
    assert_eq!(session.character_id.as_deref(), Some("elizabeth"));
    assert_eq!(session.requester.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_chat_once_does_not_need_a_session() {
    let w = world();
    ingest_library(&w).await;

    let response = w
        .app
        .chat
        .chat_once(ChatRequest {
            book_ids: ids(&["courtship"]),
            character_id: None,
            history: Vec::new(),
            message: "Why does Elizabeth refuse Darcy's proposal?".into(),
            requester: None,
        })
        .await
        .unwrap();
    assert_eq!(response.outcome, ChatOutcome::Delivered);
    assert_eq!(response.evidence_used[0].rank, 1);
}
