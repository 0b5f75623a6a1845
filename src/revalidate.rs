//! Best-effort cache revalidation hook.
//!
//! After a blog post changes, the frontend's rendering cache is told to
//! rebuild the post listing (and the post itself, when its slug is known) by
//! `POST`ing to a revalidation endpoint with a shared secret header.
//!
//! Notifications never fail the caller: every transport error, timeout, or
//! non-2xx status is logged and reported as `false`. There is no retry; the
//! next change to the same content naturally sends a fresh notification.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RevalidationConfig;

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "x-revalidate-secret";

/// Something that can be told that published content changed.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Requests revalidation of the listing, plus `slug` when given.
    ///
    /// Returns `true` only when the downstream acknowledged the request.
    async fn notify(&self, slug: Option<&str>) -> bool;
}

/// HTTP [`Notifier`] for the frontend's revalidation endpoint.
pub struct RevalidationClient {
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl RevalidationClient {
    /// Builds a client whose requests are bounded by `timeout`.
    ///
    /// An empty `secret` is treated as absent, which turns every
    /// [`notify`](Notifier::notify) call into a no-op.
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            secret: secret.filter(|s| !s.trim().is_empty()),
            client,
        })
    }

    pub fn from_config(config: &RevalidationConfig) -> Result<Self> {
        Self::new(
            config.url.clone(),
            config.effective_secret().map(str::to_string),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, secret: &str, slug: Option<&str>) -> Result<reqwest::StatusCode> {
        let mut request = self.client.post(&self.url).header(SECRET_HEADER, secret);
        if let Some(slug) = slug {
            request = request.json(&serde_json::json!({ "slug": slug }));
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.status())
    }
}

#[async_trait]
impl Notifier for RevalidationClient {
    async fn notify(&self, slug: Option<&str>) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            debug!(slug = ?slug, "revalidation disabled, skipping");
            return false;
        };
        let slug = slug.filter(|s| !s.is_empty());

        info!(url = %self.url, slug = ?slug, "calling revalidation endpoint");
        match self.post(secret, slug).await {
            Ok(status) => {
                info!(url = %self.url, slug = ?slug, status = %status, "revalidation succeeded");
                true
            }
            Err(e) => {
                warn!(
                    url = %self.url,
                    has_slug = slug.is_some(),
                    error = %e,
                    "revalidation request failed"
                );
                false
            }
        }
    }
}
