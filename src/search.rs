//! Keyword retrieval over indexed chunks.
//!
//! Queries the `chunks_fts` FTS5 table with BM25 ranking and joins each hit
//! with its chunk text and parent document. BM25 scores are unbounded, so
//! they are mapped onto `[0, 1)` as `|rank| / (1 + |rank|)`; the mapping is
//! monotonic, so more relevant chunks always have a higher similarity.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::SearchHit;

/// Turns free text into an FTS5 query: every word is quoted and the words
/// are OR-ed together, so user punctuation can never be a syntax error.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Maps a BM25 rank (negative, lower is better) onto a similarity in `[0, 1)`.
pub fn rank_to_similarity(rank: f64) -> f64 {
    let magnitude = rank.abs();
    magnitude / (1.0 + magnitude)
}

/// Returns up to `limit` chunks matching `query` whose similarity is at
/// least `threshold`, best first.
pub async fn search_chunks(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
    threshold: f64,
) -> Result<Vec<SearchHit>> {
    let Some(fts) = fts_query(query) else {
        return Ok(Vec::new());
    };
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id AS chunk_id,
               chunks_fts.document_id AS document_id,
               bm25(chunks_fts) AS score,
               c.text AS text,
               d.title AS title,
               d.slug AS slug
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        JOIN documents d ON d.id = chunks_fts.document_id
        WHERE chunks_fts MATCH ?
        ORDER BY score
        LIMIT ?
        "#,
    )
    .bind(&fts)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let hits = rows
        .iter()
        .map(|row| {
            let score: f64 = row.get("score");
            SearchHit {
                id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                title: row.get("title"),
                slug: row.get("slug"),
                content: row.get("text"),
                similarity: rank_to_similarity(score),
            }
        })
        .filter(|hit| hit.similarity >= threshold)
        .collect();

    Ok(hits)
}

/// `feedrag query`: prints the hits for `query`.
pub async fn run_query(
    config: &Config,
    query: &str,
    limit: Option<i64>,
    threshold: Option<f64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let limit = limit.unwrap_or(config.retrieval.default_limit);
    let threshold = threshold.unwrap_or(config.retrieval.default_threshold);

    let hits = search_chunks(&pool, query, limit, threshold).await?;
    pool.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            hit.similarity,
            hit.title.as_deref().unwrap_or("(untitled)")
        );
        if let Some(ref slug) = hit.slug {
            println!("    slug: {}", slug);
        }
        println!("    document: {}", hit.document_id);
        println!(
            "    excerpt: \"{}\"",
            excerpt(&hit.content, 160).replace('\n', " ").trim()
        );
        println!();
    }

    Ok(())
}

/// First `max_chars` characters of `text`, with `...` appended when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ContentPrefixes;
    use crate::index::{IndexMutator, SqliteIndex};
    use crate::migrate;
    use crate::models::FeedDocument;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seeded(tmp: &TempDir) -> SqliteIndex {
        let pool = db::connect_path(&tmp.path().join("search.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let index = SqliteIndex::new(pool, 400, ContentPrefixes::new("blog/", "kb/"));

        let docs = [
            ("blog/rust.md", "# Rust\n\nOwnership and borrowing keep memory safe. Ownership moves values."),
            ("blog/go.md", "# Go\n\nGoroutines and channels make concurrency simple."),
            ("kb/sql.md", "# SQL\n\nIndexes speed up queries on large tables."),
            ("kb/cooking.md", "# Bread\n\nFlour, water, salt and patience."),
        ];
        for (path, body) in docs {
            let doc: FeedDocument = serde_json::from_value(json!({
                "_id": path, "type": "plain", "path": path, "data": body
            }))
            .unwrap();
            index.ingest_document(&doc).await.unwrap();
        }
        index
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(
            fts_query("What's \"ownership\"?").as_deref(),
            Some("\"what\" OR \"s\" OR \"ownership\"")
        );
        assert_eq!(fts_query("  ?!  "), None);
    }

    #[test]
    fn test_similarity_is_monotonic_and_bounded() {
        let weak = rank_to_similarity(-0.1);
        let strong = rank_to_similarity(-5.0);
        assert!(strong > weak);
        assert!((0.0..1.0).contains(&weak));
        assert!((0.0..1.0).contains(&strong));
        assert_eq!(rank_to_similarity(0.0), 0.0);
    }

    #[test]
    fn test_excerpt_is_char_safe() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
        assert_eq!(excerpt("short", 10), "short");
    }

    #[tokio::test]
    async fn test_search_ranks_matching_document_first() {
        let tmp = TempDir::new().unwrap();
        let index = seeded(&tmp).await;

        let hits = search_chunks(index.pool(), "ownership borrowing", 10, 0.0)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].document_id, "blog/rust.md");
        assert_eq!(hits[0].title.as_deref(), Some("Rust"));
        assert_eq!(hits[0].slug.as_deref(), Some("rust"));
        assert!(hits[0].content.contains("Ownership"));
        assert!(hits
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_threshold_filters_weak_hits() {
        let tmp = TempDir::new().unwrap();
        let index = seeded(&tmp).await;

        let hits = search_chunks(index.pool(), "channels", 10, 0.999)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_with_no_terms_or_no_match() {
        let tmp = TempDir::new().unwrap();
        let index = seeded(&tmp).await;

        assert!(search_chunks(index.pool(), "???", 10, 0.0)
            .await
            .unwrap()
            .is_empty());
        assert!(search_chunks(index.pool(), "kubernetes", 10, 0.0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deleted_document_is_not_returned() {
        let tmp = TempDir::new().unwrap();
        let index = seeded(&tmp).await;

        index.delete_by_document_id("blog/go.md").await.unwrap();
        let hits = search_chunks(index.pool(), "goroutines", 10, 0.0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
