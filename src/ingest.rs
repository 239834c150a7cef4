//! Background ingestion jobs.
//!
//! [`IngestService::submit`] acknowledges with `Pending` and runs the
//! pipeline on a tokio task. Jobs for the same book are serialized by a
//! per-book async mutex, which deletion also takes; different books run in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use folio_core::models::{Book, IngestStatus};
use folio_core::pipeline::{IngestReport, Pipeline};
use folio_core::{Error, Result};

pub struct IngestService {
    pipeline: Pipeline,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IngestService {
    pub fn new(pipeline: Pipeline) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn book_lock(&self, book_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(book_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Queue a book for ingestion and return at once.
    ///
    /// The returned handle resolves when the job finishes; callers that only
    /// poll status may drop it.
    pub async fn submit(
        self: &Arc<Self>,
        book: Book,
    ) -> Result<(IngestStatus, JoinHandle<Result<IngestReport>>)> {
        if book.text.trim().is_empty() {
            return Err(Error::MalformedInput("book text is empty".to_string()));
        }

        // A job already running on this book keeps reporting its own stage;
        // the queued job records `Pending` once it holds the lock.
        let lock = self.book_lock(&book.id);
        let held = lock.clone().try_lock_owned().ok();
        let store = self.pipeline.store();
        if held.is_some() || store.get_status(&book.id).await?.is_none() {
            store.set_status(&book.id, &IngestStatus::Pending).await?;
        }

        let book_id = book.id.clone();
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = match held {
                Some(guard) => guard,
                None => lock.lock_owned().await,
            };
            if let Err(e) = service.pipeline.register(&book).await {
                tracing::warn!(book_id = %book.id, error = %e, "could not register book");
                service
                    .pipeline
                    .store()
                    .set_status(&book.id, &IngestStatus::failed(&e))
                    .await?;
                return Err(e);
            }
            service.pipeline.run(&book.id).await
        });

        tracing::info!(book_id = %book_id, "ingestion queued");
        Ok((IngestStatus::Pending, handle))
    }

    /// Ingest in the foreground, waiting for any running job on the book.
    pub async fn ingest_now(&self, book: &Book) -> Result<IngestReport> {
        let lock = self.book_lock(&book.id);
        let _guard = lock.lock().await;
        self.pipeline.ingest(book).await
    }

    pub async fn status(&self, book_id: &str) -> Result<IngestStatus> {
        self.pipeline
            .store()
            .get_status(book_id)
            .await?
            .ok_or_else(|| Error::BookNotFound(book_id.to_string()))
    }

    /// Delete a book after any running job on it finishes.
    pub async fn delete(&self, book_id: &str) -> Result<bool> {
        let lock = self.book_lock(book_id);
        let existed = {
            let _guard = lock.lock().await;
            self.pipeline.delete(book_id).await?
        };
        self.release_lock(book_id, lock);
        Ok(existed)
    }

    /// Forget a book's lock unless a queued job still waits on it.
    fn release_lock(&self, book_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks
            .get(book_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(book_id);
        }
    }
}
