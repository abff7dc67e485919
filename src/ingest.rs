//! Ingestion: chunk → embed → upsert.
//!
//! Two sources feed the index:
//!
//! - Every `.md` / `.txt` file under a directory becomes one or more
//!   passages with ids `"{relative_path}#{n}"`.
//! - The campus events calendar becomes one passage per upcoming event,
//!   with ids `"calendar#{n}"` in start order and `topic = events`.
//!
//! Re-ingesting a source replaces its passages and deletes any left over
//! from a longer previous version. A passage whose content hash matches
//! the indexed copy keeps its embedding, and a source with no changes is
//! not written at all. Writes that hit a running index rebuild are retried
//! with the shared policy. When anything changed, cache entries keyed on
//! the previous index version are dropped.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use campus_copilot_core::calendar::{self, CalendarEvent};
use campus_copilot_core::chunk::{chunk_text, Passage};
use campus_copilot_core::models::Document;
use campus_copilot_core::store::VectorIndex;
use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{self, AnswerCache};
use crate::config::Config;
use crate::embedding::EmbeddingGateway;
use crate::retry::RetryPolicy;

/// Id prefix of calendar passages.
pub const CALENDAR_SOURCE: &str = "calendar";
const HASH_KEY: &str = "content_hash";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub files: usize,
    /// Calendar events indexed.
    pub events: usize,
    pub passages: usize,
    /// Sources whose passages all matched the indexed copies.
    pub unchanged: usize,
    /// Passages whose stored embedding was kept.
    pub reused: usize,
    /// Stale passages deleted after a source shrank.
    pub removed: usize,
    /// Files skipped because they were empty or failed to embed.
    pub skipped: usize,
}

pub async fn ingest_directory(
    root: &Path,
    index: &dyn VectorIndex,
    gateway: &EmbeddingGateway,
    cache: &dyn AnswerCache,
    config: &Config,
) -> Result<IngestStats> {
    if !root.is_dir() {
        bail!("Ingest root does not exist or is not a directory: {}", root.display());
    }

    let writer = PassageWriter::new(index, gateway, config);
    let version_before = index.version();
    let mut stats = IngestStats::default();

    for (path, relative) in scan(root, &config.ingest.extensions)? {
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let updated_at = modified_secs(&path);
        let passages = chunk_text(&relative, &body, config.ingest.chunk_max_tokens);
        if passages.is_empty() {
            stats.skipped += 1;
            continue;
        }

        let pending = passages
            .into_iter()
            .map(|passage| Pending {
                metadata: file_metadata(&relative, passage.index),
                source_uri: relative.clone(),
                updated_at,
                passage,
            })
            .collect();
        match writer.replace(&relative, pending).await? {
            Some(written) => {
                stats.files += 1;
                written.add_to(&mut stats);
            }
            None => stats.skipped += 1,
        }
    }

    finish(index, cache, version_before, &stats);
    Ok(stats)
}

/// Index the upcoming events of an iCalendar feed. `source` is an
/// `http(s)` URL or a local file path.
pub async fn ingest_calendar(
    source: &str,
    index: &dyn VectorIndex,
    gateway: &EmbeddingGateway,
    cache: &dyn AnswerCache,
    config: &Config,
) -> Result<IngestStats> {
    let events = upcoming_events(source, config).await?;
    let writer = PassageWriter::new(index, gateway, config);
    let version_before = index.version();
    let mut stats = IngestStats::default();

    let pending = events
        .iter()
        .enumerate()
        .map(|(n, event)| Pending {
            passage: Passage::new(CALENDAR_SOURCE, n, event.to_text()),
            source_uri: event.url.clone().unwrap_or_else(|| source.to_string()),
            metadata: event_metadata(event),
            updated_at: event.start.timestamp(),
        })
        .collect();
    match writer.replace(CALENDAR_SOURCE, pending).await? {
        Some(written) => {
            stats.events = events.len();
            written.add_to(&mut stats);
        }
        None => stats.skipped += 1,
    }

    finish(index, cache, version_before, &stats);
    Ok(stats)
}

/// Fetch the feed and keep its next `events_limit` events, earliest first.
pub async fn upcoming_events(source: &str, config: &Config) -> Result<Vec<CalendarEvent>> {
    let body = fetch_calendar(source, config.ingest.events_timeout()).await?;
    let events = calendar::upcoming(
        calendar::parse_calendar(&body),
        Utc::now(),
        config.ingest.events_limit,
    );
    debug!(source, events = events.len(), "calendar parsed");
    Ok(events)
}

async fn fetch_calendar(source: &str, timeout: Duration) -> Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let response = client
            .get(source)
            .send()
            .await
            .with_context(|| format!("Failed to fetch calendar {}", source))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Calendar {} returned HTTP {}", source, status.as_u16());
        }
        Ok(response.text().await?)
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read calendar {}", source))
    }
}

fn finish(index: &dyn VectorIndex, cache: &dyn AnswerCache, version_before: u64, stats: &IngestStats) {
    if index.version() != version_before {
        if let Err(e) = cache.invalidate_by_prefix(&cache::version_prefix(version_before)) {
            warn!(error = %e, "cache invalidation failed");
        }
    }

    info!(
        files = stats.files,
        events = stats.events,
        passages = stats.passages,
        unchanged = stats.unchanged,
        reused = stats.reused,
        removed = stats.removed,
        skipped = stats.skipped,
        version = index.version(),
        "ingest finished"
    );
}

// ============ Writing ============

/// One passage about to be written.
struct Pending {
    passage: Passage,
    source_uri: String,
    metadata: BTreeMap<String, String>,
    updated_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Written {
    passages: usize,
    reused: usize,
    removed: usize,
    unchanged: bool,
}

impl Written {
    fn add_to(self, stats: &mut IngestStats) {
        stats.passages += self.passages;
        stats.reused += self.reused;
        stats.removed += self.removed;
        if self.unchanged {
            stats.unchanged += 1;
        }
    }
}

struct PassageWriter<'a> {
    index: &'a dyn VectorIndex,
    gateway: &'a EmbeddingGateway,
    policy: RetryPolicy,
    write_timeout: Duration,
}

impl<'a> PassageWriter<'a> {
    fn new(index: &'a dyn VectorIndex, gateway: &'a EmbeddingGateway, config: &Config) -> Self {
        Self {
            index,
            gateway,
            policy: RetryPolicy::from_config(&config.retry),
            write_timeout: config.retrieval.timeout(),
        }
    }

    /// Replace every passage of `source` with `pending`. Returns `None`
    /// when an embedding failed; the indexed copy is then left as it was.
    async fn replace(&self, source: &str, pending: Vec<Pending>) -> Result<Option<Written>> {
        let mut docs = Vec::with_capacity(pending.len());
        let mut reused = 0;
        for item in pending {
            let embedding = match self.indexed_embedding(&item.passage).await {
                Some(embedding) => {
                    reused += 1;
                    embedding
                }
                None => match self.gateway.embed(&item.passage.text).await {
                    Ok(embedding) => embedding,
                    Err(e) => {
                        warn!(source, error = %e, "embedding failed, skipping source");
                        return Ok(None);
                    }
                },
            };
            let mut metadata = item.metadata;
            metadata.insert(HASH_KEY.to_string(), item.passage.hash.clone());
            docs.push(Document {
                id: item.passage.id,
                text: item.passage.text,
                source_uri: item.source_uri,
                embedding,
                metadata,
                updated_at: item.updated_at,
            });
        }

        let count = docs.len();
        let first_stale = format!("{}#{}", source, count);
        let has_stale = matches!(self.index.get(&first_stale).await, Ok(Some(_)));
        if reused == count && !has_stale {
            debug!(source, passages = count, "source unchanged");
            return Ok(Some(Written {
                passages: count,
                reused,
                removed: 0,
                unchanged: true,
            }));
        }

        if count > 0 {
            self.policy
                .run("vector_index", self.write_timeout, || {
                    let docs = docs.clone();
                    async move { self.index.upsert(docs).await }
                })
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to index {} after {} attempt(s): {}",
                        source,
                        e.attempts,
                        e.error
                    )
                })?;
        }

        let mut removed = 0;
        loop {
            let stale = format!("{}#{}", source, count + removed);
            let deleted = self
                .policy
                .run("vector_index", self.write_timeout, || self.index.delete(&stale))
                .await
                .map_err(|e| anyhow::anyhow!("Failed to prune {}: {}", stale, e.error))?;
            if !deleted {
                break;
            }
            removed += 1;
        }

        debug!(source, passages = count, reused, removed, "indexed source");
        Ok(Some(Written {
            passages: count,
            reused,
            removed,
            unchanged: false,
        }))
    }

    /// The stored embedding of `passage`, if the indexed copy has the same
    /// content hash.
    async fn indexed_embedding(&self, passage: &Passage) -> Option<Vec<f32>> {
        let doc = self.index.get(&passage.id).await.ok().flatten()?;
        (doc.metadata.get(HASH_KEY) == Some(&passage.hash)).then_some(doc.embedding)
    }
}

// ============ Sources ============

/// Matching files under `root` as `(path, relative path)`, sorted.
/// Hidden directories are not descended into.
fn scan(root: &Path, extensions: &[String]) -> Result<Vec<(std::path::PathBuf, String)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
    });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e.as_str())))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((path.to_path_buf(), relative));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

/// `topic` is the first path component, or `general` for top-level files.
fn file_metadata(relative: &str, chunk_index: usize) -> BTreeMap<String, String> {
    let topic = match relative.split_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => "general".to_string(),
    };
    let mut meta = BTreeMap::new();
    meta.insert("topic".to_string(), topic);
    meta.insert("path".to_string(), relative.to_string());
    meta.insert("chunk_index".to_string(), chunk_index.to_string());
    meta
}

fn event_metadata(event: &CalendarEvent) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    meta.insert("topic".to_string(), "events".to_string());
    meta.insert("title".to_string(), event.title.clone());
    meta.insert("start".to_string(), event.start.to_rfc3339());
    if let Some(location) = &event.location {
        meta.insert("location".to_string(), location.clone());
    }
    meta
}

fn modified_secs(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
