//! Document index mutations.
//!
//! Applies the two mutations a change can cause: delete every chunk of a
//! document, or replace every chunk of a document with freshly chunked text.
//! Both are idempotent, so replaying a change after a reconnect is harmless.
//!
//! The SQLite implementation keeps `documents`, `chunks`, and the
//! `chunks_fts` full-text table in step inside one transaction per mutation.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::chunk::{chunk_markdown, extract_title, parse_front_matter};
use crate::classify::{classify, ContentPrefixes, Decision};
use crate::config::Config;
use crate::listener::HttpChangeFeed;
use crate::models::{ChangeEvent, Chunk, ContentItem, FeedDocument};
use crate::{db, migrate};

/// The write side of the document index.
#[async_trait]
pub trait IndexMutator: Send + Sync {
    /// Removes every chunk belonging to `document_id`. Returns how many were removed.
    async fn delete_by_document_id(&self, document_id: &str) -> Result<u64>;

    /// Replaces all chunks of the document with chunks of its current body.
    ///
    /// Returns the resolved path the document is published under, which may
    /// differ from the stored path when the note renames itself.
    async fn ingest_document(&self, document: &FeedDocument) -> Result<Option<String>>;
}

/// Counters reported by [`SqliteIndex::reingest_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReingestStats {
    pub processed: u64,
    pub ingested: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Document ids of entries pushed through [`SqliteIndex::replace_content`].
pub const CONTENT_ID_PREFIX: &str = "content:";

/// Counters reported by [`SqliteIndex::replace_content`].
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UpdateStats {
    pub processed: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

/// [`IndexMutator`] over the SQLite schema created by [`crate::migrate`].
#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
    max_tokens: usize,
    prefixes: ContentPrefixes,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, max_tokens: usize, prefixes: ContentPrefixes) -> Self {
        Self {
            pool,
            max_tokens,
            prefixes,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of chunks currently indexed for `document_id`.
    pub async fn count_chunks(&self, document_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Wipes the feed-sourced part of the index and ingests every indexable
    /// document in `docs`. Entries pushed through [`Self::replace_content`]
    /// are left alone.
    ///
    /// Individual failures are counted and logged; they do not abort the run.
    pub async fn reingest_all(&self, docs: &[FeedDocument]) -> Result<ReingestStats> {
        let pushed = format!("{}%", CONTENT_ID_PREFIX);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id NOT LIKE ?")
            .bind(&pushed)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id NOT LIKE ?")
            .bind(&pushed)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id NOT LIKE ?")
            .bind(&pushed)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut stats = ReingestStats::default();
        for doc in docs {
            stats.processed += 1;
            let change = ChangeEvent {
                seq: None,
                id: None,
                deleted: false,
                doc: Some(doc.clone()),
            };
            match classify(&change, &self.prefixes) {
                Decision::Ingest { document, .. } => match self.ingest_document(&document).await {
                    Ok(_) => stats.ingested += 1,
                    Err(e) => {
                        warn!(document_id = %document.id, error = %e, "reingest failed for document");
                        stats.errors += 1;
                    }
                },
                _ => stats.skipped += 1,
            }
        }

        info!(
            processed = stats.processed,
            ingested = stats.ingested,
            skipped = stats.skipped,
            errors = stats.errors,
            "full reingest finished"
        );
        Ok(stats)
    }

    /// Makes `items` the complete set of pushed content entries.
    ///
    /// Entries whose slug, title, text and metadata are unchanged are skipped.
    /// Previously pushed entries missing from `items` are removed. Invalid
    /// entries are reported in `errors` and count as missing. Everything runs
    /// in one transaction.
    pub async fn replace_content(&self, items: &[ContentItem]) -> Result<UpdateStats> {
        let mut stats = UpdateStats::default();
        let mut keep: HashSet<String> = HashSet::new();
        let mut tx = self.pool.begin().await?;

        for (i, item) in items.iter().enumerate() {
            stats.processed += 1;
            let slug = item.slug.trim().trim_matches('/');
            if slug.is_empty() {
                stats.errors.push(format!("item {}: missing slug", i));
                continue;
            }
            if item.content.trim().is_empty() {
                stats.errors.push(format!("{}: empty content", slug));
                continue;
            }
            let document_id = format!("{}{}", CONTENT_ID_PREFIX, slug);
            if !keep.insert(document_id.clone()) {
                stats.errors.push(format!("{}: duplicate slug", slug));
                continue;
            }

            let raw_json = serde_json::to_string(item).context("Failed to encode content item")?;
            let mut hasher = Sha256::new();
            hasher.update(document_id.as_bytes());
            hasher.update(raw_json.as_bytes());
            let dedup_hash = format!("{:x}", hasher.finalize());

            let existing: Option<String> =
                sqlx::query_scalar("SELECT dedup_hash FROM documents WHERE id = ?")
                    .bind(&document_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if existing.as_deref() == Some(dedup_hash.as_str()) {
                stats.skipped += 1;
                continue;
            }

            let title = item
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .or_else(|| extract_title(&item.content));
            let chunks = chunk_markdown(&document_id, &item.content, self.max_tokens);
            upsert_document(
                &mut tx,
                &DocumentRow {
                    id: &document_id,
                    path: slug,
                    slug: Some(slug),
                    title: title.as_deref(),
                    body: &item.content,
                    raw_json: &raw_json,
                    dedup_hash: &dedup_hash,
                },
            )
            .await?;
            replace_chunks(&mut tx, &document_id, &chunks).await?;
            stats.updated += 1;
        }

        let pushed: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id LIKE ?")
            .bind(format!("{}%", CONTENT_ID_PREFIX))
            .fetch_all(&mut *tx)
            .await?;
        let mut removed = 0;
        for id in pushed.iter().filter(|id| !keep.contains(*id)) {
            replace_chunks(&mut tx, id, &[]).await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += 1;
        }

        tx.commit().await?;

        info!(
            processed = stats.processed,
            updated = stats.updated,
            skipped = stats.skipped,
            removed,
            errors = stats.errors.len(),
            "content update finished"
        );
        Ok(stats)
    }

    /// Strips whichever content prefix applies and a trailing `.md`.
    fn public_slug(&self, resolved: &str) -> Option<String> {
        let rest = resolved
            .strip_prefix(self.prefixes.blog.as_str())
            .or_else(|| resolved.strip_prefix(self.prefixes.kb.as_str()))
            .unwrap_or(resolved);
        let rest = rest.strip_suffix(".md").unwrap_or(rest).trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Applies a front-matter `slug` to the directory part of `path`.
fn resolve_path(path: &str, slug: Option<&str>) -> String {
    match slug {
        Some(slug) => match path.rfind('/') {
            Some(i) => format!("{}{}", &path[..=i], slug.trim_matches('/')),
            None => slug.trim_matches('/').to_string(),
        },
        None => path.to_string(),
    }
}

#[async_trait]
impl IndexMutator for SqliteIndex {
    async fn delete_by_document_id(&self, document_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted)
    }

    async fn ingest_document(&self, document: &FeedDocument) -> Result<Option<String>> {
        if document.id.is_empty() {
            bail!("document has no _id");
        }
        let Some(text) = document.body_text() else {
            bail!("document {} has no inline text content", document.id);
        };

        let (front, body) = parse_front_matter(&text);
        let path = document.path_or_id();
        let resolved = resolve_path(path, front.slug.as_deref());
        let title = front.title.or_else(|| extract_title(body));
        let slug = self.public_slug(&resolved);
        let chunks = chunk_markdown(&document.id, body, self.max_tokens);

        let mut hasher = Sha256::new();
        hasher.update(document.id.as_bytes());
        hasher.update(text.as_bytes());
        let dedup_hash = format!("{:x}", hasher.finalize());

        let raw_json = serde_json::to_string(document).context("Failed to encode document")?;

        let mut tx = self.pool.begin().await?;

        upsert_document(
            &mut tx,
            &DocumentRow {
                id: &document.id,
                path,
                slug: slug.as_deref(),
                title: title.as_deref(),
                body,
                raw_json: &raw_json,
                dedup_hash: &dedup_hash,
            },
        )
        .await?;

        replace_chunks(&mut tx, &document.id, &chunks).await?;

        tx.commit().await?;

        info!(
            document_id = %document.id,
            path = %path,
            chunks = chunks.len(),
            "ingested document"
        );
        Ok(Some(resolved))
    }
}

struct DocumentRow<'a> {
    id: &'a str,
    path: &'a str,
    slug: Option<&'a str>,
    title: Option<&'a str>,
    body: &'a str,
    raw_json: &'a str,
    dedup_hash: &'a str,
}

async fn upsert_document(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &DocumentRow<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, path, slug, title, body, raw_json, dedup_hash, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            path = excluded.path,
            slug = excluded.slug,
            title = excluded.title,
            body = excluded.body,
            raw_json = excluded.raw_json,
            dedup_hash = excluded.dedup_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(row.id)
    .bind(row.path)
    .bind(row.slug)
    .bind(row.title)
    .bind(row.body)
    .bind(row.raw_json)
    .bind(row.dedup_hash)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn replace_chunks(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut **tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

/// `feedrag reingest`: rebuilds the whole index from the feed's `_all_docs`.
pub async fn run_reingest(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let feed = HttpChangeFeed::from_config(&config.feed)?;
    let docs = feed.fetch_all_docs().await?;
    println!("Fetched {} documents from {}", docs.len(), config.feed.database);

    let index = SqliteIndex::new(
        pool.clone(),
        config.chunking.max_tokens,
        ContentPrefixes::from_config(&config.content),
    );
    let stats = index.reingest_all(&docs).await?;

    println!("Reingest complete");
    println!("  processed: {}", stats.processed);
    println!("  ingested: {}", stats.ingested);
    println!("  skipped: {}", stats.skipped);
    println!("  errors: {}", stats.errors);

    pool.close().await;
    Ok(())
}
