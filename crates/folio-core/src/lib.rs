//! # Folio Core
//!
//! The retrieval-augmented generation engine behind Folio: conversations
//! that can only be answered from the text of the selected books, with every
//! answer traceable to the passages it used.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Providers, storage backends, timeouts, and background execution are
//! supplied by the `folio` application crate through the traits defined
//! here.
//!
//! | Module | Role |
//! |--------|------|
//! | [`chunk`] | Overlapping, deterministic book chunker |
//! | [`store`] | [`VectorIndex`](store::VectorIndex) and [`BookStore`](store::BookStore) traits, in-memory backends |
//! | [`embedding`] | Embedding and generation provider traits, vector helpers |
//! | [`retrieval`] | Query → ranked, deduplicated evidence |
//! | [`personality`] | Book and character voice profiles |
//! | [`fusion`] | Weighted blend of profiles per chat turn |
//! | [`generation`] | Grounded prompt, citation validation, turn states |
//! | [`pipeline`] | Ingestion stages and status reporting |
//! | [`session`] | Conversation state and cancellation |
//! | [`mock`] | Deterministic test doubles |

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod mock;
pub mod models;
pub mod personality;
pub mod pipeline;
pub mod retrieval;
pub mod session;
pub mod store;

pub use error::{Error, Result};
