//! Change classification.
//!
//! Decides what a single change-feed event means for the index: nothing,
//! a delete of every chunk belonging to a document, or a (re)ingest of the
//! document. Also derives which published item, if any, the frontend should
//! revalidate. Everything here is pure; the listener applies the decision.

use std::fmt;

use crate::config::ContentConfig;
use crate::models::{ChangeEvent, FeedDocument};

/// The only document kind that carries indexable text.
pub const INDEXABLE_KIND: &str = "plain";

/// Path prefixes that select which documents are indexed and which ones
/// are published blog posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPrefixes {
    pub blog: String,
    pub kb: String,
}

impl ContentPrefixes {
    pub fn new(blog: impl Into<String>, kb: impl Into<String>) -> Self {
        Self {
            blog: blog.into(),
            kb: kb.into(),
        }
    }

    pub fn from_config(config: &ContentConfig) -> Self {
        Self::new(config.blog_prefix.clone(), config.kb_prefix.clone())
    }

    pub fn is_blog(&self, path: &str) -> bool {
        path.starts_with(&self.blog)
    }

    pub fn is_indexable(&self, path: &str) -> bool {
        path.starts_with(&self.blog) || path.starts_with(&self.kb)
    }
}

/// What the frontend should revalidate.
///
/// `slug == None` means only the listing; otherwise the listing and that post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The feed carried no document body.
    NoDocument,
    /// The document has no usable id.
    MissingId,
    /// The document's `type` is not [`INDEXABLE_KIND`].
    NotPlain,
    /// The path is under neither the blog nor the knowledge-base prefix.
    OutsidePrefixes,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnoreReason::NoDocument => "no document in change",
            IgnoreReason::MissingId => "document has no id",
            IgnoreReason::NotPlain => "document is not plain text",
            IgnoreReason::OutsidePrefixes => "path outside blog/kb prefixes",
        };
        f.write_str(s)
    }
}

/// Outcome of classifying one change.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ignore(IgnoreReason),
    /// Remove every indexed chunk whose `document_id` matches.
    DeleteAll {
        document_id: String,
        notify: Option<NotificationTarget>,
    },
    /// Replace all indexed chunks for `document_id` with chunks of `document`.
    ///
    /// The notification target depends on the slug returned by ingestion, so
    /// it is resolved afterwards with [`Decision::ingest_target`].
    Ingest {
        document_id: String,
        document: FeedDocument,
    },
}

impl Decision {
    /// Notification target for an `Ingest` decision once ingestion returned
    /// `ingested_slug`. Always `None` for other decisions.
    pub fn ingest_target(
        &self,
        ingested_slug: Option<&str>,
        prefixes: &ContentPrefixes,
    ) -> Option<NotificationTarget> {
        match self {
            Decision::Ingest {
                document_id,
                document,
            } => derive_target(
                ingested_slug,
                document.path.as_deref(),
                document_id,
                prefixes,
            ),
            _ => None,
        }
    }
}

/// Classifies a parsed change event.
pub fn classify(change: &ChangeEvent, prefixes: &ContentPrefixes) -> Decision {
    let Some(doc) = change.doc.as_ref() else {
        // A store-level delete without an embedded body still identifies the document
        if change.deleted {
            if let Some(id) = change.id.as_deref().filter(|id| !id.is_empty()) {
                return Decision::DeleteAll {
                    document_id: id.to_string(),
                    notify: delete_target(None, id, prefixes),
                };
            }
        }
        return Decision::Ignore(IgnoreReason::NoDocument);
    };

    let Some(document_id) = change.document_id().map(str::to_string) else {
        return Decision::Ignore(IgnoreReason::MissingId);
    };

    if doc.deleted || change.deleted {
        let notify = delete_target(doc.path.as_deref(), &document_id, prefixes);
        return Decision::DeleteAll {
            document_id,
            notify,
        };
    }

    if doc.kind.as_deref() != Some(INDEXABLE_KIND) {
        return Decision::Ignore(IgnoreReason::NotPlain);
    }

    let path = doc.path.as_deref().unwrap_or("");
    if !prefixes.is_indexable(path) {
        return Decision::Ignore(IgnoreReason::OutsidePrefixes);
    }

    Decision::Ingest {
        document_id,
        document: doc.clone(),
    }
}

fn delete_target(
    path: Option<&str>,
    document_id: &str,
    prefixes: &ContentPrefixes,
) -> Option<NotificationTarget> {
    derive_target(None, path, document_id, prefixes)
}

/// Derives the revalidation target for a changed document.
///
/// The candidate is the ingested slug if non-blank, else the path if
/// non-blank, else the document id. Candidates outside the blog prefix
/// produce no notification. Otherwise the prefix and a trailing `.md` are
/// stripped; an empty remainder still notifies, for the listing only.
pub fn derive_target(
    ingested_slug: Option<&str>,
    path: Option<&str>,
    document_id: &str,
    prefixes: &ContentPrefixes,
) -> Option<NotificationTarget> {
    let candidate = ingested_slug
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| path.filter(|p| !p.trim().is_empty()))
        .unwrap_or(document_id);

    let rest = candidate.strip_prefix(prefixes.blog.as_str())?;
    let rest = rest.strip_suffix(".md").unwrap_or(rest).trim();

    Some(NotificationTarget {
        slug: (!rest.is_empty()).then(|| rest.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prefixes() -> ContentPrefixes {
        ContentPrefixes::new("/blog/", "/kb/")
    }

    fn change(value: serde_json::Value) -> ChangeEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_slug_from_blog_path() {
        let target = derive_target(None, Some("/blog/my-post.md"), "x", &prefixes());
        assert_eq!(
            target,
            Some(NotificationTarget {
                slug: Some("my-post".to_string())
            })
        );
    }

    #[test]
    fn test_prefix_only_path_notifies_listing() {
        let target = derive_target(None, Some("/blog/"), "x", &prefixes());
        assert_eq!(target, Some(NotificationTarget { slug: None }));
    }

    #[test]
    fn test_kb_path_does_not_notify() {
        assert_eq!(derive_target(None, Some("/kb/article"), "x", &prefixes()), None);
    }

    #[test]
    fn test_ingested_slug_preferred_over_path() {
        let target = derive_target(
            Some(" /blog/renamed "),
            Some("/blog/original.md"),
            "x",
            &prefixes(),
        );
        assert_eq!(target.unwrap().slug.as_deref(), Some("renamed"));
    }

    #[test]
    fn test_blank_ingested_slug_falls_back_to_path_then_id() {
        let target = derive_target(Some("  "), None, "/blog/from-id.md", &prefixes());
        assert_eq!(target.unwrap().slug.as_deref(), Some("from-id"));
    }

    #[test]
    fn test_no_doc_is_ignored() {
        let c = change(json!({"seq": "1", "id": "/blog/a.md"}));
        assert_eq!(
            classify(&c, &prefixes()),
            Decision::Ignore(IgnoreReason::NoDocument)
        );
    }

    #[test]
    fn test_non_plain_is_ignored() {
        let c = change(json!({"seq": "1", "doc": {"_id": "h:1", "type": "leaf", "path": "/blog/a.md"}}));
        assert_eq!(
            classify(&c, &prefixes()),
            Decision::Ignore(IgnoreReason::NotPlain)
        );
    }

    #[test]
    fn test_outside_prefixes_is_ignored() {
        let c = change(json!({"seq": "1", "doc": {"_id": "d", "type": "plain", "path": "/drafts/a.md"}}));
        assert_eq!(
            classify(&c, &prefixes()),
            Decision::Ignore(IgnoreReason::OutsidePrefixes)
        );
    }

    #[test]
    fn test_blog_delete_notifies_with_slug() {
        let c = change(json!({"seq": "2", "doc": {"_id": "d1", "deleted": true, "path": "/blog/gone.md"}}));
        assert_eq!(
            classify(&c, &prefixes()),
            Decision::DeleteAll {
                document_id: "d1".to_string(),
                notify: Some(NotificationTarget {
                    slug: Some("gone".to_string())
                }),
            }
        );
    }

    #[test]
    fn test_kb_delete_does_not_notify() {
        let c = change(json!({"seq": "2", "doc": {"_id": "/kb/x.md", "deleted": true}}));
        assert_eq!(
            classify(&c, &prefixes()),
            Decision::DeleteAll {
                document_id: "/kb/x.md".to_string(),
                notify: None,
            }
        );
    }

    #[test]
    fn test_delete_ignores_type_check() {
        let c = change(json!({"seq": "2", "doc": {"_id": "/blog/x.md", "type": "leaf", "_deleted": true}}));
        assert!(matches!(
            classify(&c, &prefixes()),
            Decision::DeleteAll { .. }
        ));
    }

    #[test]
    fn test_store_level_delete_without_doc() {
        let c = change(json!({"seq": "3", "id": "/blog/purged.md", "deleted": true}));
        assert_eq!(
            classify(&c, &prefixes()),
            Decision::DeleteAll {
                document_id: "/blog/purged.md".to_string(),
                notify: Some(NotificationTarget {
                    slug: Some("purged".to_string())
                }),
            }
        );
    }

    #[test]
    fn test_plain_blog_doc_is_ingested() {
        let c = change(json!({"seq": "4", "doc": {"_id": "d4", "type": "plain", "path": "/blog/new.md", "data": "hi"}}));
        let decision = classify(&c, &prefixes());
        match &decision {
            Decision::Ingest {
                document_id,
                document,
            } => {
                assert_eq!(document_id, "d4");
                assert_eq!(document.path.as_deref(), Some("/blog/new.md"));
            }
            other => panic!("expected ingest, got {:?}", other),
        }
        assert_eq!(
            decision.ingest_target(None, &prefixes()).unwrap().slug.as_deref(),
            Some("new")
        );
        assert_eq!(
            decision
                .ingest_target(Some("/kb/moved"), &prefixes()),
            None
        );
    }

    #[test]
    fn test_kb_ingest_has_no_target() {
        let c = change(json!({"seq": "5", "doc": {"_id": "d5", "type": "plain", "path": "/kb/a.md"}}));
        let decision = classify(&c, &prefixes());
        assert!(matches!(decision, Decision::Ingest { .. }));
        assert_eq!(decision.ingest_target(None, &prefixes()), None);
    }
}
