//! Shared fixtures: two small books and a scripted generator that knows
//! how to profile them and answer one question about them.

#![allow(dead_code)]

use std::sync::Arc;

use folio::app::App;
use folio::config::{parse_config, Config};
use folio_core::embedding::EmbeddingProvider;
use folio_core::mock::{MockEmbedder, MockGenerator};
use folio_core::models::{Book, Visibility};
use folio_core::store::memory::{InMemoryIndex, InMemoryStore};

pub const ANSWER: &str = "Elizabeth refuses Darcy because of his pride [S1].";

pub const WHALING_PROFILE: &str = r#"{"tone": ["grand", "brooding"], "values": ["endurance"], "speech_patterns": ["nautical terms"], "writing_style": "long rolling sentences", "voice": "solemn"}"#;
pub const COURTSHIP_PROFILE: &str = r#"{"tone": ["playful", "ironic"], "values": ["good sense"], "speech_patterns": ["free indirect speech"], "writing_style": "balanced and precise", "voice": "amused"}"#;
pub const ELIZABETH_PROFILE: &str = r#"{"tone": ["witty", "defiant"], "values": ["independence"], "speech_patterns": ["teasing retorts"], "writing_style": "quick", "voice": "quick and teasing"}"#;

/// Config for small test books: short chunks, no overlap.
pub fn test_config(db_path: &str) -> Config {
    parse_config(&format!(
        r#"
[db]
path = "{}"

[chunking]
min_tokens = 5
max_tokens = 40
overlap_ratio = 0.0

[embedding]
batch_size = 8
"#,
        db_path
    ))
    .expect("test config")
}

/// Generator that answers chat prompts with [`ANSWER`] and profiles each
/// book and Elizabeth with a fixed JSON reply.
pub fn scripted_generator() -> MockGenerator {
    MockGenerator::new(vec![COURTSHIP_PROFILE.to_string()])
        .with_rule("Question:", ANSWER)
        .with_rule("the character Elizabeth", ELIZABETH_PROFILE)
        .with_rule("rigging", WHALING_PROFILE)
        .with_rule("Bennet", COURTSHIP_PROFILE)
}

pub struct World {
    pub app: Arc<App>,
    pub embedder: Arc<MockEmbedder>,
    pub generator: Arc<MockGenerator>,
    pub store: Arc<InMemoryStore>,
    pub index: Arc<InMemoryIndex>,
}

pub fn world_with(generator: MockGenerator) -> World {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(generator);
    let store = Arc::new(InMemoryStore::new());
    let index = Arc::new(InMemoryIndex::new(embedder.model()));
    let app = Arc::new(App::with_backends(
        test_config("unused.sqlite"),
        store.clone(),
        index.clone(),
        embedder.clone(),
        generator.clone(),
    ));
    World {
        app,
        embedder,
        generator,
        store,
        index,
    }
}

pub fn world() -> World {
    world_with(scripted_generator())
}

pub fn book(id: &str, paragraphs: &[String]) -> Book {
    Book {
        id: id.into(),
        title: id.into(),
        author: "Anon".into(),
        text: paragraphs.join("\n\n"),
        visibility: Visibility::Public,
        owner_id: None,
        chunk_ids: vec![],
        character_ids: vec![],
        created_at: 0,
    }
}

/// A long, unrelated book: `n` log entries about a whaling voyage.
pub fn whaling(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            format!(
                "Log entry {}: the crew hauled rigging while the proposal to turn home was ignored.",
                i
            )
        })
        .collect()
}

/// A short book where Elizabeth speaks in several passages.
pub fn courtship() -> Vec<String> {
    vec![
        "Mrs Bennet plans a ball for her daughters at Longbourn.".to_string(),
        "\"I could easily forgive his pride, if he had not mortified mine,\" said Elizabeth."
            .to_string(),
        "Elizabeth refuses Darcy's proposal at Hunsford, citing his pride.".to_string(),
        "\"You are too hasty, sir,\" said Elizabeth to Darcy.".to_string(),
        "\"Till this moment I never knew myself,\" said Elizabeth quietly.".to_string(),
        "Jane falls ill while visiting Netherfield.".to_string(),
        "Lydia elopes and the family despairs.".to_string(),
    ]
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Ingest both fixture books in the foreground.
pub async fn ingest_library(world: &World) {
    world
        .app
        .ingest
        .ingest_now(&book("whaling", &whaling(60)))
        .await
        .expect("ingest whaling");
    world
        .app
        .ingest
        .ingest_now(&book("courtship", &courtship()))
        .await
        .expect("ingest courtship");
}
