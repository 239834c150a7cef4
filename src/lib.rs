//! # Folio
//!
//! Chat with books, answered only from their text.
//!
//! This crate is the application around the [`folio_core`] engine: SQLite
//! persistence, HTTP embedding and generation providers, document
//! extraction, background ingestion, the chat service, an HTTP server, and
//! the `folio` CLI.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite vector index and book store |
//! | [`http`] | JSON POST with retry and backoff |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`generation`] | OpenAI and Ollama generation providers |
//! | [`extract`] | Text extraction from txt, md, pdf, and docx |
//! | [`ingest`] | Background ingestion with per-book serialization |
//! | [`chat`] | One grounded chat turn |
//! | [`app`] | Service wiring |
//! | [`server`] | HTTP API |

pub mod app;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
