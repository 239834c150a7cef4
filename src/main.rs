//! # Folio CLI (`folio`)
//!
//! Ingest books, chat with them, and run the HTTP server.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `folio init` | Create the SQLite database and run schema migrations |
//! | `folio ingest <file> --id --title --author` | Extract, chunk, embed, and profile a book |
//! | `folio status <id>` | Show a book's ingestion status |
//! | `folio delete <id>` | Delete a book and its index entries |
//! | `folio chat --book <id>... "<message>"` | Ask a question grounded in the selected books |
//! | `folio stats` | Index statistics |
//! | `folio serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! folio --config ./config/folio.toml init
//! folio ingest ./books/pride.txt --id pride --title "Pride and Prejudice" --author "Jane Austen" --public
//! folio chat --book pride "Why does Elizabeth refuse Darcy's first proposal?"
//! folio chat --book pride --character elizabeth --session ./pride.session.json "What do you think of Mr Darcy?"
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use folio::app::App;
use folio::chat::ChatOutcome;
use folio::config;
use folio::extract::{content_type_for_path, extract_text};
use folio::migrate;
use folio::server;
use folio_core::models::{Book, Visibility};
use folio_core::session::{CancelToken, ChatSession};

/// Folio: chat with your books, answered only from their text.
#[derive(Parser)]
#[command(name = "folio", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/folio.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a book file (.txt, .md, .pdf, .docx) and wait for it to finish.
    Ingest {
        file: PathBuf,

        #[arg(long)]
        id: String,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        author: String,

        /// Make the book readable by everyone.
        #[arg(long)]
        public: bool,

        /// Owner of a private book.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show a book's ingestion status.
    Status { id: String },

    /// Delete a book and everything derived from it.
    Delete { id: String },

    /// Ask one question about the selected books.
    Chat {
        /// Book to chat with. Repeat for several; order is selection order.
        #[arg(long = "book")]
        books: Vec<String>,

        /// Answer in this character's voice (character id, e.g. `elizabeth-bennet`).
        #[arg(long)]
        character: Option<String>,

        /// Requesting user, checked against private books' owners.
        #[arg(long)]
        user: Option<String>,

        /// JSON file holding the conversation; created if missing.
        #[arg(long)]
        session: Option<PathBuf>,

        message: String,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest {
            file,
            id,
            title,
            author,
            public,
            owner,
        } => {
            let content_type = content_type_for_path(&file)
                .with_context(|| format!("Unsupported file type: {}", file.display()))?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let text = extract_text(&bytes, content_type)?;

            let book = Book {
                id,
                title,
                author,
                text,
                visibility: if public {
                    Visibility::Public
                } else {
                    Visibility::Private
                },
                owner_id: owner,
                chunk_ids: Vec::new(),
                character_ids: Vec::new(),
                created_at: chrono::Utc::now().timestamp(),
            };

            let app = App::open(cfg).await?;
            let report = app.ingest.ingest_now(&book).await?;
            println!("ingest {}", report.book_id);
            println!("  chunks:     {}", report.chunks);
            println!("  embedded:   {}", report.embedded);
            println!("  unchanged:  {}", report.skipped);
            println!("  removed:    {}", report.removed);
            println!(
                "  characters: {} ({} omitted{})",
                report.characters,
                report.omitted_characters,
                if report.profiles_reused {
                    ", profiles reused"
                } else {
                    ""
                }
            );
        }
        Commands::Status { id } => {
            let app = App::open(cfg).await?;
            let status = app.ingest.status(&id).await?;
            println!("{}: {}", id, serde_json::to_string(&status)?);
        }
        Commands::Delete { id } => {
            let app = App::open(cfg).await?;
            if !app.ingest.delete(&id).await? {
                bail!("Book not found: {}", id);
            }
            println!("Deleted {}", id);
        }
        Commands::Chat {
            books,
            character,
            user,
            session,
            message,
        } => {
            let mut chat_session = match &session {
                Some(path) if path.exists() => {
                    let raw = std::fs::read_to_string(path)?;
                    serde_json::from_str::<ChatSession>(&raw)
                        .with_context(|| format!("Invalid session file: {}", path.display()))?
                }
                _ => ChatSession::new(books.clone()),
            };
            if !books.is_empty() {
                chat_session.book_ids = ChatSession::new(books).book_ids;
            }
            if character.is_some() {
                chat_session.character_id = character;
            }
            if user.is_some() {
                chat_session.requester = user;
            }

            let app = App::open(cfg).await?;
            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let response = app.chat.chat(&mut chat_session, &message, &cancel).await?;
            println!("{}", response.response_text);
            if response.outcome == ChatOutcome::Delivered {
                println!();
                for item in &response.evidence_used {
                    println!(
                        "  [{}] {} #{} (score {:.3})",
                        item.rank, item.book_id, item.position, item.score
                    );
                }
            }
            for warning in &response.warnings {
                eprintln!("warning: {}", serde_json::to_string(warning)?);
            }

            if let Some(path) = session {
                std::fs::write(&path, serde_json::to_string_pretty(&chat_session)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
        }
        Commands::Stats => {
            let app = App::open(cfg).await?;
            let stats = app.stats().await?;
            println!("model:  {} ({} dims)", stats.model, stats.dims);
            println!("books:  {}", stats.books);
            println!("chunks: {}", stats.chunks);
        }
        Commands::Serve => {
            let app = App::open(cfg).await?;
            server::run_server(Arc::new(app)).await?;
        }
    }

    Ok(())
}
