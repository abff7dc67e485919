//! # Campus Copilot CLI (`copilot`)
//!
//! ## Usage
//!
//! ```bash
//! copilot --config ./config/copilot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `copilot ingest <dir>` | Chunk and embed a document directory, print counts |
//! | `copilot events` | List upcoming events from the campus calendar |
//! | `copilot search "<query>"` | Show the passages retrieval would use |
//! | `copilot ask "<query>"` | Answer one question, streaming to stdout |
//! | `copilot serve` | Start the HTTP server |
//!
//! The index lives in memory, so `search`, `ask` and `serve` ingest
//! `--docs` (or `[ingest].root`) and the `[ingest].events_url` calendar
//! at startup.
//!
//! Log verbosity is controlled by `COPILOT_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use campus_copilot::cache::{AnswerCache, MokaAnswerCache, NoopCache};
use campus_copilot::config::{self, Config};
use campus_copilot::embedding::{create_embedder, EmbeddingGateway};
use campus_copilot::ingest::{ingest_calendar, ingest_directory, upcoming_events, IngestStats};
use campus_copilot::llm::create_model;
use campus_copilot::maintenance::Maintenance;
use campus_copilot::orchestrator::{AnswerEvent, Collaborators, Orchestrator};
use campus_copilot::retriever::{RetrievalContext, Retriever};
use campus_copilot::retry::RetryPolicy;
use campus_copilot::server;
use campus_copilot::session::{InMemorySessionStore, SessionStore};
use campus_copilot_core::store::memory::InMemoryIndex;
use campus_copilot_core::store::VectorIndex;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Campus Copilot: retrieval-augmented, multi-turn campus Q&A.
#[derive(Parser)]
#[command(name = "copilot", version)]
struct Cli {
    /// Path to configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "./config/copilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a document directory and report what was indexed.
    Ingest {
        /// Directory of `.md` / `.txt` files.
        dir: PathBuf,
    },

    /// List upcoming events from the configured calendar feed.
    Events {
        /// Calendar URL or `.ics` path (overrides `[ingest].events_url`).
        #[arg(long)]
        source: Option<String>,

        /// Number of events (defaults to `[ingest].events_limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show the ranked passages for a query.
    Search {
        query: String,

        /// Document directory to index first (overrides `[ingest].root`).
        #[arg(long)]
        docs: Option<PathBuf>,

        /// Number of passages (defaults to `[retrieval].top_n`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a single question.
    Ask {
        query: String,

        #[arg(long)]
        docs: Option<PathBuf>,

        /// Session id; a fresh one is generated when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Start the HTTP server.
    Serve {
        #[arg(long)]
        docs: Option<PathBuf>,

        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("COPILOT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Everything a command needs, wired from config.
struct Runtime {
    index: Arc<dyn VectorIndex>,
    gateway: EmbeddingGateway,
    sessions: Arc<dyn SessionStore>,
    cache: Arc<dyn AnswerCache>,
}

impl Runtime {
    fn new(cfg: &Config) -> Result<Self> {
        let embedder = create_embedder(&cfg.embedding)?;
        let gateway =
            EmbeddingGateway::new(embedder, RetryPolicy::from_config(&cfg.retry), &cfg.embedding);
        info!(model = gateway.model_name(), dims = gateway.dims(), "embedding gateway ready");
        let cache: Arc<dyn AnswerCache> = if cfg.cache.enabled {
            Arc::new(MokaAnswerCache::new(&cfg.cache))
        } else {
            Arc::new(NoopCache)
        };
        Ok(Self {
            index: Arc::new(InMemoryIndex::new()),
            gateway,
            sessions: Arc::new(InMemorySessionStore::new(&cfg.session)),
            cache,
        })
    }

    async fn ingest(&self, cfg: &Config, docs: Option<&Path>) -> Result<()> {
        let root = docs.map(Path::to_path_buf).or_else(|| cfg.ingest.root.clone());
        match root {
            Some(root) => {
                ingest_directory(&root, &*self.index, &self.gateway, &*self.cache, cfg).await?;
            }
            None => info!("no document root configured, starting with an empty index"),
        }
        self.ingest_events(cfg).await;
        Ok(())
    }

    /// Index the events calendar when one is configured. The feed is an
    /// outside service, so a failure is logged and startup continues.
    async fn ingest_events(&self, cfg: &Config) -> Option<IngestStats> {
        let source = cfg.ingest.events_url.as_deref()?;
        match ingest_calendar(source, &*self.index, &self.gateway, &*self.cache, cfg).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(source, error = %e, "calendar ingest failed");
                None
            }
        }
    }

    fn orchestrator(&self, cfg: &Config) -> Result<Orchestrator> {
        Ok(Orchestrator::new(
            cfg,
            Collaborators {
                index: self.index.clone(),
                gateway: self.gateway.clone(),
                model: create_model(&cfg.llm)?,
                sessions: self.sessions.clone(),
                cache: self.cache.clone(),
            },
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg = load(&cli.config)?;

    match cli.command {
        Commands::Ingest { dir } => {
            let rt = Runtime::new(&cfg)?;
            println!("ingest {}", dir.display());
            let stats = ingest_directory(&dir, &*rt.index, &rt.gateway, &*rt.cache, &cfg).await?;
            println!("  files: {}", stats.files);
            println!("  passages: {}", stats.passages);
            println!("  skipped: {}", stats.skipped);
            if let Some(events) = rt.ingest_events(&cfg).await {
                println!("  events: {}", events.events);
            }
            println!("ok");
        }
        Commands::Events { source, limit } => {
            let Some(source) = source.or_else(|| cfg.ingest.events_url.clone()) else {
                anyhow::bail!("No calendar configured: set [ingest].events_url or pass --source");
            };
            if let Some(limit) = limit {
                cfg.ingest.events_limit = limit;
            }
            let events = upcoming_events(&source, &cfg).await?;
            if events.is_empty() {
                println!("No upcoming events.");
            }
            for event in events {
                match &event.location {
                    Some(location) => println!("{}  {}  ({})", event.start_label(), event.title, location),
                    None => println!("{}  {}", event.start_label(), event.title),
                }
            }
        }
        Commands::Search { query, docs, limit } => {
            let rt = Runtime::new(&cfg)?;
            rt.ingest(&cfg, docs.as_deref()).await?;
            let retriever = Retriever::new(
                rt.gateway.clone(),
                rt.index.clone(),
                RetryPolicy::from_config(&cfg.retry),
                &cfg.retrieval,
            );
            let limit = limit.unwrap_or(cfg.retrieval.top_n);
            let results = retriever
                .retrieve(&query, &RetrievalContext::default(), limit)
                .await?;
            if results.is_empty() {
                println!("No results.");
            }
            for c in results {
                println!("{}. [{:.3}] {} ({})", c.rank, c.relevance_score, c.source_uri, c.document_id);
                let preview: String = c.text.chars().take(160).collect();
                println!("    {}", preview.replace('\n', " "));
            }
        }
        Commands::Ask {
            query,
            docs,
            session,
        } => {
            let rt = Runtime::new(&cfg)?;
            rt.ingest(&cfg, docs.as_deref()).await?;
            let orchestrator = rt.orchestrator(&cfg)?;
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut stream = orchestrator.answer(session, query);
            let mut stdout = std::io::stdout();
            let mut citations = Vec::new();
            let mut failed = None;
            while let Some(event) = stream.next().await {
                match event {
                    AnswerEvent::Token { text } => {
                        print!("{}", text);
                        stdout.flush()?;
                    }
                    AnswerEvent::Citation(c) => citations.push(c),
                    AnswerEvent::Done { .. } => break,
                    AnswerEvent::Error { code, message } => {
                        failed = Some(format!("{}: {}", code.as_str(), message));
                        break;
                    }
                }
            }
            println!();
            for c in &citations {
                println!("[{}] {}", c.marker, c.source_uri);
            }
            if let Some(err) = failed {
                anyhow::bail!(err);
            }
        }
        Commands::Serve { docs, bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            let rt = Runtime::new(&cfg)?;
            rt.ingest(&cfg, docs.as_deref()).await?;
            let orchestrator = rt.orchestrator(&cfg)?;

            let shutdown = CancellationToken::new();
            let maintenance = Maintenance::new(
                rt.sessions.clone(),
                rt.index.clone(),
                cfg.index.rebuild_threshold,
                std::time::Duration::from_secs(cfg.maintenance.sweep_interval_secs),
            )
            .spawn(shutdown.clone());

            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                signal.cancel();
            });

            server::run_server(&cfg, orchestrator, shutdown.clone()).await?;
            shutdown.cancel();
            let _ = maintenance.await;
        }
    }

    Ok(())
}
