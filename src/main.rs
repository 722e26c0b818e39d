//! # botmind CLI
//!
//! ## Usage
//!
//! ```bash
//! botmind --config ./config/botmind.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `botmind init` | Create the SQLite database and run schema migrations |
//! | `botmind serve` | Start the HTTP API |
//! | `botmind index <file>` | Chunk and index a plain-text file |
//! | `botmind sources` | List the sources visible to a scope |
//! | `botmind ask "<question>"` | Answer a question, streaming to stdout |
//!
//! Scoped commands take `--user` plus `--bot` or `--space`.
//!
//! ## Examples
//!
//! ```bash
//! botmind init
//! botmind index handbook.txt --user 1 --bot 7
//! botmind ask "What is the refund policy?" --user 1 --bot 7
//! botmind ask "Tell me a joke" --user 1 --bot 7 --open
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to adjust (default `info`).

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use botmind::config;
use botmind::context::BotProfile;
use botmind::ingest;
use botmind::migrate;
use botmind::pipeline::{self, TurnRequest};
use botmind::server;
use botmind::stream::{ChatEvent, StreamOutcome};
use botmind_core::models::Scope;

/// botmind: retrieval, evidence gating and streamed answers for persona bots.
#[derive(Parser)]
#[command(name = "botmind", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/botmind.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Chunk a UTF-8 text file and index it for a scope.
    ///
    /// Indexing the same source id again replaces its chunks.
    Index {
        file: PathBuf,

        /// Source id to index under (defaults to the file name).
        #[arg(long)]
        source_id: Option<String>,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// List the sources visible to a scope.
    Sources {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Ask a question and stream the answer.
    Ask {
        question: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Conversation to continue (a new one when omitted).
        #[arg(long)]
        conversation: Option<String>,

        /// Bot display name.
        #[arg(long, default_value = "Assistant")]
        name: String,

        /// Persona description.
        #[arg(long)]
        persona: Option<String>,

        /// Answer without the strict evidence contract.
        #[arg(long)]
        open: bool,

        /// Allow web search (only used with --open).
        #[arg(long)]
        web: bool,
    },
}

#[derive(Args)]
struct ScopeArgs {
    /// Owning user id.
    #[arg(long)]
    user: i64,

    /// Bot id.
    #[arg(long, conflicts_with = "space")]
    bot: Option<i64>,

    /// Study space id.
    #[arg(long)]
    space: Option<i64>,
}

impl ScopeArgs {
    fn scope(&self) -> Result<Scope> {
        match (self.bot, self.space) {
            (Some(bot), None) => Ok(Scope::bot(self.user, bot)),
            (None, Some(space)) => Ok(Scope::study_space(self.user, space)),
            _ => bail!("one of --bot or --space is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Index {
            file,
            source_id,
            scope,
        } => {
            let scope = scope.scope()?;
            let (pipeline, _) = open_without_memory(&cfg).await?;
            let report = ingest::index_file(
                pipeline.knowledge(),
                &scope,
                &file,
                source_id.as_deref(),
                cfg.chunking.max_tokens,
            )
            .await?;
            println!(
                "indexed {} ({}): {} chunks",
                report.source_name, report.source_id, report.chunks
            );
        }
        Commands::Sources { scope } => {
            let scope = scope.scope()?;
            let (pipeline, _) = open_without_memory(&cfg).await?;
            let sources = pipeline.knowledge().list_sources(&scope).await?;
            if sources.is_empty() {
                println!("No sources for {}.", scope);
            }
            for s in sources {
                println!("{}\t{}\t{} chunks", s.source_id, s.source_name, s.chunk_count);
            }
        }
        Commands::Ask {
            question,
            scope,
            conversation,
            name,
            persona,
            open,
            web,
        } => {
            let mut bot = if open {
                BotProfile::open(&name)
            } else {
                BotProfile::strict(&name)
            };
            bot.persona = persona.unwrap_or_default();
            bot.web_search_allowed = web;

            let req = TurnRequest {
                scope: scope.scope()?,
                conversation_id: conversation
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                question,
                turn_id: None,
            };
            ask(&cfg, &bot, req).await?;
        }
    }

    Ok(())
}

async fn open_without_memory(
    cfg: &config::Config,
) -> Result<(pipeline::ChatPipeline, Option<tokio::task::JoinHandle<()>>)> {
    let mut cfg = cfg.clone();
    cfg.memory.enabled = false;
    pipeline::open(&cfg).await
}

async fn ask(cfg: &config::Config, bot: &BotProfile, req: TurnRequest) -> Result<()> {
    let (pipeline, worker) = pipeline::open(cfg).await?;
    let (tx, mut rx) = mpsc::channel::<ChatEvent>(32);

    let printer = async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Start { .. } => {}
                ChatEvent::Chunk { content } => {
                    let _ = write!(stdout, "{}", content);
                    let _ = stdout.flush();
                }
                ChatEvent::End {
                    suggestions,
                    sources,
                    ..
                } => {
                    let _ = writeln!(stdout);
                    if !sources.is_empty() {
                        let _ = writeln!(stdout, "\nSources:");
                        for s in sources {
                            let _ = writeln!(stdout, "  [{}] {}", s.index, s.source);
                        }
                    }
                    if !suggestions.is_empty() {
                        let _ = writeln!(stdout, "\nYou could also ask:");
                        for s in suggestions {
                            let _ = writeln!(stdout, "  - {}", s);
                        }
                    }
                }
                ChatEvent::Error { message } => {
                    eprintln!("error: {}", message);
                }
            }
        }
    };

    let (outcome, ()) = tokio::join!(pipeline.respond_stream(bot, req, tx), printer);

    // Let the memory worker drain before exiting.
    drop(pipeline);
    if let Some(worker) = worker {
        let _ = worker.await;
    }

    if let StreamOutcome::Failed(message) = outcome {
        bail!("no answer: {}", message);
    }
    Ok(())
}
