//! Change-feed listener.
//!
//! Keeps the search index in step with the content store by following its
//! continuous `_changes` feed:
//!
//! ```text
//!  ┌─────────────┐  since=<cursor>  ┌──────────────┐
//!  │ CursorStore │─────────────────▶│  ChangeFeed  │  (long-lived GET)
//!  └──────▲──────┘                  └──────┬───────┘
//!         │ seq (before apply)             │ one JSON object per line
//!         │                                ▼
//!         │                         ┌──────────────┐   ┌──────────────┐
//!         └─────────────────────────│   classify   │──▶│ IndexMutator │
//!                                   └──────┬───────┘   └──────────────┘
//!                                          ▼
//!                                   ┌──────────────┐
//!                                   │   Notifier   │  (best effort)
//!                                   └──────────────┘
//! ```
//!
//! # Failure handling
//!
//! - Blank lines are heartbeats and are skipped.
//! - Unparseable lines are logged and skipped; the cursor does not move.
//! - The cursor is persisted *before* the change is applied, so a failing
//!   mutation never blocks progress. A crash between the two loses at most
//!   the in-flight change.
//! - Index and notification failures are contained to their change.
//! - Connection failures and server-side closes back off exponentially
//!   (1s doubling to 60s, reset on every successful connect) and reconnect
//!   from the persisted cursor.
//!
//! # Shutdown
//!
//! A [`CancellationToken`] is observed while waiting for the next line and
//! while sleeping between reconnects, so [`ListenerHandle::stop`] takes
//! effect immediately rather than after the current backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, ContentPrefixes, Decision, IgnoreReason, NotificationTarget};
use crate::config::{Config, FeedConfig};
use crate::cursor::{CursorStore, SqliteCursorStore};
use crate::error::FeedError;
use crate::index::{IndexMutator, SqliteIndex};
use crate::models::{ChangeEvent, FeedDocument};
use crate::revalidate::{Notifier, RevalidationClient};
use crate::{db, migrate};

/// `since` value used when no cursor has been stored yet.
pub const FEED_START: &str = "now";

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Longest slice of a bad line that is echoed into the log.
const LOG_LINE_LIMIT: usize = 200;

// ═══════════════════════════════════════════════════════════════════════
// Feed abstraction
// ═══════════════════════════════════════════════════════════════════════

/// An open streaming connection to the change feed.
#[async_trait]
pub trait FeedConnection: Send {
    /// Waits for the next line. `Ok(None)` means the server closed the stream.
    async fn next_line(&mut self) -> Result<Option<String>, FeedError>;
}

/// Something that can open the change feed at a given position.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a continuous feed starting after `since` (or at the head when `None`).
    async fn open(&self, since: Option<&str>) -> Result<Box<dyn FeedConnection>, FeedError>;
}

/// CouchDB `_changes` feed over HTTP.
///
/// The connect timeout is short so that an unreachable server surfaces
/// quickly; there is no read timeout because the server sends heartbeats.
pub struct HttpChangeFeed {
    database_url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl HttpChangeFeed {
    pub fn new(database_url: impl Into<String>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            database_url: database_url.into().trim_end_matches('/').to_string(),
            username: None,
            password: None,
            client,
        })
    }

    pub fn from_config(config: &FeedConfig) -> anyhow::Result<Self> {
        let mut feed = Self::new(
            config.database_url(),
            Duration::from_secs(config.connect_timeout_secs),
        )?;
        feed.username = config.username.clone();
        feed.password = config.password.clone();
        Ok(feed)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    /// Fetches every document currently in the database, skipping design docs.
    pub async fn fetch_all_docs(&self) -> anyhow::Result<Vec<FeedDocument>> {
        #[derive(Deserialize)]
        struct AllDocs {
            rows: Vec<AllDocsRow>,
        }
        #[derive(Deserialize)]
        struct AllDocsRow {
            #[serde(default)]
            doc: Option<FeedDocument>,
        }

        let response = self
            .request(format!("{}/_all_docs", self.database_url))
            .query(&[("include_docs", "true")])
            .timeout(Duration::from_secs(300))
            .send()
            .await
            .context("Failed to request _all_docs")?
            .error_for_status()?;

        let all: AllDocs = response
            .json()
            .await
            .context("Invalid _all_docs response")?;

        Ok(all
            .rows
            .into_iter()
            .filter_map(|row| row.doc)
            .filter(|doc| !doc.id.starts_with("_design/"))
            .collect())
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn open(&self, since: Option<&str>) -> Result<Box<dyn FeedConnection>, FeedError> {
        let response = self
            .request(format!("{}/_changes", self.database_url))
            .query(&[
                ("feed", "continuous"),
                ("include_docs", "true"),
                ("since", since.unwrap_or(FEED_START)),
                ("heartbeat", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::new(HttpFeedConnection {
            response,
            lines: LineSplitter::default(),
            closed: false,
        }))
    }
}

/// Reassembles newline-delimited lines from arbitrarily split byte chunks.
///
/// `\r\n` and `\n` both end a line. Bytes that are not UTF-8 are decoded
/// lossily so the line still reaches the JSON parser and is skipped there.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(decode_line(&line))
    }

    /// Whatever trails the last newline once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.buf);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Splits a streaming response body into lines.
struct HttpFeedConnection {
    response: reqwest::Response,
    lines: LineSplitter,
    closed: bool,
}

#[async_trait]
impl FeedConnection for HttpFeedConnection {
    async fn next_line(&mut self) -> Result<Option<String>, FeedError> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if self.closed {
                return Ok(self.lines.finish());
            }
            match self.response.chunk().await? {
                Some(bytes) => self.lines.push(&bytes),
                None => self.closed = true,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════

/// Exponential reconnect delay: doubles after every use, capped at `max`.
///
/// Jitter is disabled so the sequence is exactly 1s, 2s, 4s, ... for the
/// default bounds.
#[derive(Debug, Clone)]
pub struct Backoff {
    inner: ExponentialBackoff,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let inner = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        Self { inner }
    }

    /// The delay to wait now; the following call returns double this.
    pub fn next_delay(&mut self) -> Duration {
        // Never exhausted without a max elapsed time.
        self.inner
            .next_backoff()
            .unwrap_or(self.inner.max_interval)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    pub fn current(&self) -> Duration {
        self.inner.current_interval
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Listener
// ═══════════════════════════════════════════════════════════════════════

/// What happened to a single change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Ignored(IgnoreReason),
    Deleted {
        chunks: u64,
        notified: Option<bool>,
    },
    Ingested {
        resolved: Option<String>,
        notified: Option<bool>,
    },
    /// The index rejected the mutation; the change was skipped.
    Failed,
}

/// Counters accumulated over the listener's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    pub connections: u64,
    pub connection_errors: u64,
    pub reconnects: u64,
    pub heartbeats: u64,
    pub events: u64,
    pub parse_failures: u64,
    pub applied: u64,
    pub ignored: u64,
    pub mutation_failures: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

enum ConnectionEnd {
    Shutdown,
    Closed,
}

/// Follows the change feed and applies every change to the index.
pub struct ChangeFeedListener {
    feed: Arc<dyn ChangeFeed>,
    cursor: Arc<dyn CursorStore>,
    index: Arc<dyn IndexMutator>,
    notifier: Arc<dyn Notifier>,
    prefixes: ContentPrefixes,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ChangeFeedListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        cursor: Arc<dyn CursorStore>,
        index: Arc<dyn IndexMutator>,
        notifier: Arc<dyn Notifier>,
        prefixes: ContentPrefixes,
    ) -> Self {
        Self {
            feed,
            cursor,
            index,
            notifier,
            prefixes,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Runs until `shutdown` is cancelled. Never returns early on errors.
    pub async fn run(&self, shutdown: CancellationToken) -> ListenerStats {
        info!("change feed listener started");
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);
        let mut stats = ListenerStats::default();

        while !shutdown.is_cancelled() {
            match self.run_connection(&shutdown, &mut backoff, &mut stats).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Closed) => info!("change feed closed by server"),
                Err(e) => {
                    stats.connection_errors += 1;
                    error!(error = %e, "change feed connection error");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs_f64(), "reconnecting to change feed");
            stats.reconnects += 1;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(events = stats.events, "change feed listener stopped");
        stats
    }

    async fn run_connection(
        &self,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
        stats: &mut ListenerStats,
    ) -> Result<ConnectionEnd, FeedError> {
        let mut last_seq = self
            .cursor
            .get_last_position()
            .await
            .map_err(|e| FeedError::Cursor(format!("{:#}", e)))?;

        info!(
            since = last_seq.as_deref().unwrap_or(FEED_START),
            "connecting to change feed"
        );
        let mut connection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(ConnectionEnd::Shutdown),
            opened = self.feed.open(last_seq.as_deref()) => opened?,
        };

        backoff.reset();
        stats.connections += 1;
        info!("connected, waiting for changes");

        loop {
            let line = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("listener stopping");
                    return Ok(ConnectionEnd::Shutdown);
                }
                line = connection.next_line() => line?,
            };

            match line {
                Some(line) => self.handle_line(&line, &mut last_seq, stats).await,
                None => return Ok(ConnectionEnd::Closed),
            }
        }
    }

    async fn handle_line(&self, line: &str, last_seq: &mut Option<String>, stats: &mut ListenerStats) {
        let line = line.trim();
        if line.is_empty() {
            stats.heartbeats += 1;
            return;
        }

        let change: ChangeEvent = match serde_json::from_str(line) {
            Ok(change) => change,
            Err(e) => {
                stats.parse_failures += 1;
                warn!(error = %e, line = %truncate_for_log(line), "skipping invalid change line");
                return;
            }
        };
        stats.events += 1;

        if let Some(token) = change.sequence_token() {
            *last_seq = Some(token);
        }
        if let Some(token) = last_seq.as_deref() {
            if let Err(e) = self.cursor.set_last_position(token).await {
                error!(seq = token, error = %e, "failed to persist feed cursor");
            }
        }

        match self.process_change(&change).await {
            ChangeOutcome::Ignored(_) => stats.ignored += 1,
            ChangeOutcome::Failed => stats.mutation_failures += 1,
            ChangeOutcome::Deleted { notified, .. } | ChangeOutcome::Ingested { notified, .. } => {
                stats.applied += 1;
                match notified {
                    Some(true) => stats.notifications_sent += 1,
                    Some(false) => stats.notifications_failed += 1,
                    None => {}
                }
            }
        }
    }

    /// Classifies one change, applies it to the index, and sends the
    /// revalidation notification it calls for.
    pub async fn process_change(&self, change: &ChangeEvent) -> ChangeOutcome {
        let decision = classify(change, &self.prefixes);
        match &decision {
            Decision::Ignore(reason) => {
                debug!(id = ?change.document_id(), %reason, "skipping change");
                ChangeOutcome::Ignored(*reason)
            }
            Decision::DeleteAll {
                document_id,
                notify,
            } => match self.index.delete_by_document_id(document_id).await {
                Ok(chunks) => {
                    info!(document_id = %document_id, chunks, "deleted chunks for document");
                    let notified = match notify {
                        Some(target) => Some(self.notify(target).await),
                        None => None,
                    };
                    ChangeOutcome::Deleted { chunks, notified }
                }
                Err(e) => {
                    error!(document_id = %document_id, error = %e, "failed to delete document");
                    ChangeOutcome::Failed
                }
            },
            Decision::Ingest {
                document_id,
                document,
            } => match self.index.ingest_document(document).await {
                Ok(resolved) => {
                    let notified = match decision.ingest_target(resolved.as_deref(), &self.prefixes) {
                        Some(target) => Some(self.notify(&target).await),
                        None => None,
                    };
                    ChangeOutcome::Ingested { resolved, notified }
                }
                Err(e) => {
                    error!(document_id = %document_id, error = %e, "failed to ingest document");
                    ChangeOutcome::Failed
                }
            },
        }
    }

    async fn notify(&self, target: &NotificationTarget) -> bool {
        self.notifier.notify(target.slug.as_deref()).await
    }
}

fn truncate_for_log(line: &str) -> &str {
    if line.len() <= LOG_LINE_LIMIT {
        return line;
    }
    let mut end = LOG_LINE_LIMIT;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

// ═══════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════

/// A listener running on its own tokio task.
pub struct ListenerHandle {
    token: CancellationToken,
    task: JoinHandle<ListenerStats>,
}

impl ListenerHandle {
    /// Spawns `listener` in the background.
    pub fn start(listener: ChangeFeedListener) -> Self {
        Self::start_with_token(listener, CancellationToken::new())
    }

    /// Spawns `listener`, stopping it when `token` (or a parent of it) is cancelled.
    pub fn start_with_token(listener: ChangeFeedListener, token: CancellationToken) -> Self {
        let run_token = token.clone();
        let task = tokio::spawn(async move { listener.run(run_token).await });
        info!("change feed listener started in background task");
        Self { token, task }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals shutdown and waits up to `grace` for the task to finish.
    ///
    /// Returns the final counters, or `None` if the task had to be aborted
    /// or panicked.
    pub async fn stop(self, grace: Duration) -> Option<ListenerStats> {
        info!("change feed listener stopping");
        self.token.cancel();

        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                error!(error = %e, "listener task failed");
                None
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "listener did not stop in time, aborting");
                task.abort();
                None
            }
        }
    }
}

/// How long `feedrag listen` waits for the listener to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// `feedrag listen`: follows the change feed until ctrl-c or SIGTERM.
pub async fn run_listen(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let prefixes = ContentPrefixes::from_config(&config.content);
    let feed = HttpChangeFeed::from_config(&config.feed)?;
    let notifier = RevalidationClient::from_config(&config.revalidation)?;
    if !notifier.is_enabled() {
        warn!("no revalidation secret configured, frontend will not be notified");
    }

    let listener = ChangeFeedListener::new(
        Arc::new(feed),
        Arc::new(SqliteCursorStore::new(pool.clone())),
        Arc::new(SqliteIndex::new(
            pool.clone(),
            config.chunking.max_tokens,
            prefixes.clone(),
        )),
        Arc::new(notifier),
        prefixes,
    );

    let handle = ListenerHandle::start(listener);
    println!(
        "Following changes of {} (ctrl-c to stop)",
        config.feed.database
    );
    shutdown_signal().await;

    if let Some(stats) = handle.stop(SHUTDOWN_GRACE).await {
        println!(
            "Stopped. events: {}, applied: {}, ignored: {}, failed: {}, reconnects: {}",
            stats.events, stats.applied, stats.ignored, stats.mutation_failures, stats.reconnects
        );
    }
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursorStore;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use tokio::time::Instant;

    // ─── Test doubles ───────────────────────────────────────────────

    type Script = Result<Vec<Result<String, String>>, String>;

    /// Feed that replays one scripted connection per `open`, then hangs.
    #[derive(Default)]
    struct ScriptedFeed {
        connections: Mutex<VecDeque<Script>>,
        opens: Mutex<Vec<(Instant, Option<String>)>>,
    }

    impl ScriptedFeed {
        fn new(connections: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(connections.into()),
                opens: Mutex::new(Vec::new()),
            })
        }

        fn opens(&self) -> Vec<(Instant, Option<String>)> {
            self.opens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn open(&self, since: Option<&str>) -> Result<Box<dyn FeedConnection>, FeedError> {
            self.opens
                .lock()
                .unwrap()
                .push((Instant::now(), since.map(str::to_string)));
            let next = self.connections.lock().unwrap().pop_front();
            match next {
                Some(Ok(lines)) => Ok(Box::new(ScriptedConnection {
                    lines: lines.into(),
                })),
                Some(Err(e)) => Err(FeedError::Other(e)),
                None => Ok(Box::new(HangingConnection)),
            }
        }
    }

    struct ScriptedConnection {
        lines: VecDeque<Result<String, String>>,
    }

    #[async_trait]
    impl FeedConnection for ScriptedConnection {
        async fn next_line(&mut self) -> Result<Option<String>, FeedError> {
            match self.lines.pop_front() {
                Some(Ok(line)) => Ok(Some(line)),
                Some(Err(e)) => Err(FeedError::Other(e)),
                None => Ok(None),
            }
        }
    }

    struct HangingConnection;

    #[async_trait]
    impl FeedConnection for HangingConnection {
        async fn next_line(&mut self) -> Result<Option<String>, FeedError> {
            std::future::pending().await
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Mutation {
        Delete(String),
        Ingest(String),
    }

    #[derive(Default)]
    struct RecordingIndex {
        mutations: Mutex<Vec<Mutation>>,
        failing: HashSet<String>,
        rename_to: Option<String>,
    }

    #[async_trait]
    impl IndexMutator for RecordingIndex {
        async fn delete_by_document_id(&self, document_id: &str) -> anyhow::Result<u64> {
            self.mutations
                .lock()
                .unwrap()
                .push(Mutation::Delete(document_id.to_string()));
            if self.failing.contains(document_id) {
                anyhow::bail!("delete rejected");
            }
            Ok(3)
        }

        async fn ingest_document(&self, document: &FeedDocument) -> anyhow::Result<Option<String>> {
            self.mutations
                .lock()
                .unwrap()
                .push(Mutation::Ingest(document.id.clone()));
            if self.failing.contains(&document.id) {
                anyhow::bail!("ingest rejected");
            }
            Ok(self.rename_to.clone().or_else(|| document.path.clone()))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<Option<String>>>,
        succeed: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, slug: Option<&str>) -> bool {
            self.calls.lock().unwrap().push(slug.map(str::to_string));
            self.succeed
        }
    }

    fn listener(
        feed: Arc<ScriptedFeed>,
        cursor: Arc<MemoryCursorStore>,
        index: Arc<RecordingIndex>,
        notifier: Arc<RecordingNotifier>,
    ) -> ChangeFeedListener {
        ChangeFeedListener::new(
            feed,
            cursor,
            index,
            notifier,
            ContentPrefixes::new("blog/", "kb/"),
        )
    }

    fn lines(raw: &[&str]) -> Script {
        Ok(raw.iter().map(|l| Ok(l.to_string())).collect())
    }

    /// Runs the listener until the runtime goes idle for `settle`, then stops it.
    async fn run_for(listener: ChangeFeedListener, settle: Duration) -> ListenerStats {
        let handle = ListenerHandle::start(listener);
        tokio::time::sleep(settle).await;
        handle
            .stop(Duration::from_secs(5))
            .await
            .expect("listener should stop")
    }

    // ─── Backoff ────────────────────────────────────────────────────

    #[test]
    fn test_backoff_sequence_caps_and_resets() {
        let mut backoff = Backoff::default();
        let secs: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        let line = "ü".repeat(150);
        let cut = truncate_for_log(&line);
        assert!(cut.len() <= LOG_LINE_LIMIT);
        assert!(line.starts_with(cut));
    }

    // ─── Line splitting ─────────────────────────────────────────────

    fn drain(splitter: &mut LineSplitter) -> Vec<String> {
        std::iter::from_fn(|| splitter.next_line()).collect()
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut splitter = LineSplitter::default();
        splitter.push(br#"{"seq":"1","#);
        assert!(splitter.next_line().is_none());
        splitter.push(b"\"id\":\"a\"}\n{\"seq\"");
        assert_eq!(drain(&mut splitter), vec![r#"{"seq":"1","id":"a"}"#]);
        splitter.push(b":\"2\"}\n");
        assert_eq!(drain(&mut splitter), vec![r#"{"seq":"2"}"#]);
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut splitter = LineSplitter::default();
        splitter.push(b"first\r\n\r\nsecond\r");
        assert_eq!(drain(&mut splitter), vec!["first", ""]);
        splitter.push(b"\n");
        assert_eq!(drain(&mut splitter), vec!["second"]);
    }

    #[test]
    fn test_trailing_line_without_newline() {
        let mut splitter = LineSplitter::default();
        splitter.push(b"a\nlast\r");
        assert_eq!(drain(&mut splitter), vec!["a"]);
        assert_eq!(splitter.finish().as_deref(), Some("last"));
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement_chars() {
        let mut splitter = LineSplitter::default();
        splitter.push(b"\xff\xfe garbage\nok\n");
        let lines = drain(&mut splitter);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('\u{FFFD}'));
        assert!(serde_json::from_str::<serde_json::Value>(&lines[0]).is_err());
        assert_eq!(lines[1], "ok");
    }

    // ─── Per-line processing ────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_processes_lines_in_order() {
        let feed = ScriptedFeed::new(vec![lines(&[
            "",
            "   ",
            r#"{"seq":"1","id":"p","doc":{"_id":"p","type":"plain","path":"blog/post.md","data":"x"}}"#,
            "{not json",
            r#"{"seq":"2","id":"k","doc":{"_id":"k","deleted":true,"path":"kb/a.md"}}"#,
            r#"{"seq":"3","id":"h","doc":{"_id":"h","type":"leaf","path":"blog/post.md"}}"#,
            r#"{"seq":"4","id":"b","doc":{"_id":"b","deleted":true,"path":"blog/"}}"#,
        ])]);
        let cursor = Arc::new(MemoryCursorStore::new());
        let index = Arc::new(RecordingIndex::default());
        let notifier = Arc::new(RecordingNotifier {
            succeed: true,
            ..Default::default()
        });

        let stats = run_for(
            listener(feed.clone(), cursor.clone(), index.clone(), notifier.clone()),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(cursor.history(), vec!["1", "2", "3", "4"]);
        assert_eq!(
            *index.mutations.lock().unwrap(),
            vec![
                Mutation::Ingest("p".to_string()),
                Mutation::Delete("k".to_string()),
                Mutation::Delete("b".to_string()),
            ]
        );
        assert_eq!(
            *notifier.calls.lock().unwrap(),
            vec![Some("post".to_string()), None]
        );
        assert_eq!(stats.heartbeats, 2);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.events, 4);
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.notifications_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odd_field_types_still_advance_cursor() {
        let feed = ScriptedFeed::new(vec![lines(&[
            r#"{"seq":"5","id":"kb/x.md","deleted":null,"doc":{"_id":"kb/x.md","path":7}}"#,
            r#"{"seq":"6","id":"kb/y.md","deleted":true}"#,
        ])]);
        let cursor = Arc::new(MemoryCursorStore::new());
        let index = Arc::new(RecordingIndex::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let stats = run_for(
            listener(feed, cursor.clone(), index.clone(), notifier),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(cursor.history(), vec!["5", "6"]);
        assert_eq!(stats.parse_failures, 0);
        assert_eq!(stats.events, 2);
        assert_eq!(
            *index.mutations.lock().unwrap(),
            vec![Mutation::Delete("kb/y.md".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_failure_does_not_stop_stream() {
        let feed = ScriptedFeed::new(vec![lines(&[
            r#"{"seq":"10","doc":{"_id":"bad","type":"plain","path":"kb/bad.md","data":"x"}}"#,
            r#"{"seq":"11","doc":{"_id":"good","type":"plain","path":"kb/good.md","data":"y"}}"#,
        ])]);
        let cursor = Arc::new(MemoryCursorStore::new());
        let index = Arc::new(RecordingIndex {
            failing: HashSet::from(["bad".to_string()]),
            ..Default::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());

        let stats = run_for(
            listener(feed, cursor.clone(), index.clone(), notifier.clone()),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(cursor.history(), vec!["10", "11"]);
        assert_eq!(index.mutations.lock().unwrap().len(), 2);
        assert_eq!(stats.mutation_failures, 1);
        assert_eq!(stats.applied, 1);
        assert!(notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingested_slug_drives_notification() {
        let feed = ScriptedFeed::new(vec![lines(&[
            r#"{"seq":"1","doc":{"_id":"a","type":"plain","path":"blog/draft.md","data":"x"}}"#,
        ])]);
        let index = Arc::new(RecordingIndex {
            rename_to: Some("blog/final-name".to_string()),
            ..Default::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());

        let stats = run_for(
            listener(feed, Arc::new(MemoryCursorStore::new()), index, notifier.clone()),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(
            *notifier.calls.lock().unwrap(),
            vec![Some("final-name".to_string())]
        );
        // A refused notification is informational only
        assert_eq!(stats.notifications_failed, 1);
        assert_eq!(stats.applied, 1);
    }

    // ─── Cursor and reconnects ──────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_persisted_cursor() {
        let feed = ScriptedFeed::new(vec![
            lines(&[
                r#"{"seq":"8","id":"x"}"#,
                r#"{"id":"no-seq"}"#,
            ]),
            Err("connection reset".to_string()),
        ]);
        let cursor = Arc::new(MemoryCursorStore::with_position("7"));

        run_for(
            listener(
                feed.clone(),
                cursor.clone(),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            Duration::from_secs(10),
        )
        .await;

        let since: Vec<Option<String>> = feed.opens().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            since,
            vec![
                Some("7".to_string()),
                Some("8".to_string()),
                Some("8".to_string()),
            ]
        );
        // A change without seq re-persists the prior position
        assert_eq!(cursor.history(), vec!["8", "8"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_starts_from_feed_head() {
        let feed = ScriptedFeed::new(vec![]);
        run_for(
            listener(
                feed.clone(),
                Arc::new(MemoryCursorStore::new()),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(feed.opens()[0].1, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_on_repeated_failures() {
        let failures = (0..8).map(|i| Err(format!("refused {}", i))).collect();
        let feed = ScriptedFeed::new(failures);

        let stats = run_for(
            listener(
                feed.clone(),
                Arc::new(MemoryCursorStore::new()),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            Duration::from_secs(200),
        )
        .await;

        let opens = feed.opens();
        assert_eq!(opens.len(), 9);
        let gaps: Vec<u64> = opens
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(stats.connection_errors, 8);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_connect() {
        let feed = ScriptedFeed::new(vec![
            Err("down".to_string()),
            Err("down".to_string()),
            lines(&[]),
            Err("down".to_string()),
        ]);

        run_for(
            listener(
                feed.clone(),
                Arc::new(MemoryCursorStore::new()),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            Duration::from_secs(30),
        )
        .await;

        let opens = feed.opens();
        let start = opens[0].0;
        let offsets: Vec<u64> = opens.iter().map(|(t, _)| (*t - start).as_secs()).collect();
        assert_eq!(offsets, vec![0, 1, 3, 4, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_mid_connection_reconnects() {
        let feed = ScriptedFeed::new(vec![Ok(vec![
            Ok(r#"{"seq":"1","id":"a"}"#.to_string()),
            Err("reset by peer".to_string()),
        ])]);

        let stats = run_for(
            listener(
                feed.clone(),
                Arc::new(MemoryCursorStore::new()),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(stats.connection_errors, 1);
        assert_eq!(feed.opens()[1].1.as_deref(), Some("1"));
    }

    // ─── Shutdown ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff_wait() {
        let failures = (0..20).map(|_| Err("refused".to_string())).collect();
        let feed = ScriptedFeed::new(failures);
        let started = Instant::now();

        // Third attempt fails at t=3s and starts a 4s wait
        let stats = run_for(
            listener(
                feed.clone(),
                Arc::new(MemoryCursorStore::new()),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            Duration::from_millis(4500),
        )
        .await;

        assert_eq!(feed.opens().len(), 3);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.reconnects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_idle_stream() {
        let feed = ScriptedFeed::new(vec![]);
        let handle = ListenerHandle::start(listener(
            feed.clone(),
            Arc::new(MemoryCursorStore::new()),
            Arc::new(RecordingIndex::default()),
            Arc::new(RecordingNotifier::default()),
        ));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!handle.is_finished());

        let stats = handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(feed.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_parent_token_stops_listener() {
        let parent = CancellationToken::new();
        let handle = ListenerHandle::start_with_token(
            listener(
                ScriptedFeed::new(vec![]),
                Arc::new(MemoryCursorStore::new()),
                Arc::new(RecordingIndex::default()),
                Arc::new(RecordingNotifier::default()),
            ),
            parent.child_token(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }
}
