//! Feed objects and the update pipeline around them.
//!
//! A [`Feed`] is the canonical in-memory handle for one subscription. The
//! registry in [`crate::context`] hands out `Arc<Feed>` so that every
//! component (scheduler, aggregate views, UI adapters) observes the same
//! object. State changes are announced through synchronously-dispatched
//! [`FeedEvent`]s; subscribers hold a [`SubscriptionId`] and can detach
//! completely, which the aggregate views rely on.
//!
//! Submodules:
//!
//! - [`updater`] - the per-feed refresh state machine
//! - [`fetcher`] - HTTP transport with surfaced redirects and abort support
//! - [`parser`] - RSS/Atom parsing via `feed-rs`
//! - [`discovery`] - feed-URL discovery from HTML pages
//! - [`aggregate`] - fan-in views over dynamic feed sets
//! - [`opml`] - subscription list import/export

pub mod aggregate;
pub mod discovery;
pub mod fetcher;
pub mod opml;
pub mod parser;
pub mod updater;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::storage::{Article, FeedId, FeedRecord, PolicyMode, Storage};
use fetcher::Fetcher;
use updater::UpdateCycle;

// ============================================================================
// Status
// ============================================================================

/// Load status of a feed (or an aggregate view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Nothing in flight.
    Idle,
    /// Articles are being (re)loaded from storage.
    Loading,
    /// A refresh cycle is in flight.
    Updating,
    /// The last refresh failed; see [`Feed::error`].
    Error,
}

// ============================================================================
// Events
// ============================================================================

/// Events announced by a feed (and re-announced by aggregate views).
///
/// Dispatch is synchronous: by the time an emitting method returns, every
/// subscriber has seen the event. Handlers must not block.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Display name changed.
    NameChanged(String),
    /// Web-link URL changed.
    UrlChanged(Option<String>),
    /// Load status transitioned.
    StatusChanged(LoadStatus),
    /// Unread count moved by `delta` (never a recount).
    UnreadCountChanged { delta: i64 },
    /// A refresh cycle completed successfully at the given timestamp.
    LastUpdateChanged(i64),
    /// A new article was stored. Emitted exactly once per insert.
    ArticleAdded(Article),
    /// Update/expiry policy changed; schedulers reposition on this.
    PolicyChanged,
    /// Stored articles are no longer a superset of what subscribers have
    /// seen; a full resync is required.
    Reset,
    /// The feed is being removed; subscribers must detach.
    DeleteRequested,
}

/// Handle returned by [`Feed::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

/// Listener registry with snapshot-based dispatch.
///
/// `emit` clones the listener list out of the lock before invoking anything,
/// so a handler may subscribe/unsubscribe (even itself) without deadlocking.
pub(crate) struct Listeners {
    entries: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        SubscriptionId(id)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(entry_id, _)| *entry_id != id.0);
    }

    pub(crate) fn emit(&self, event: &FeedEvent) {
        let snapshot: Vec<Listener> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

// ============================================================================
// Engine Dependencies
// ============================================================================

/// Shared handles every feed's update pipeline needs.
pub struct EngineDeps {
    pub storage: Arc<dyn Storage>,
    pub fetcher: Fetcher,
    /// Shared ceiling for HTTP redirects and discovery retries in one cycle.
    pub max_hops: u32,
}

// ============================================================================
// Feed State
// ============================================================================

/// Mutable feed metadata. `update_interval_secs`, `update_enabled`, and
/// `expire_age_secs` hold *effective* values: for `Inherit`-mode feeds the
/// context overwrites them whenever the defaults change.
pub(crate) struct FeedState {
    pub(crate) name: String,
    pub(crate) category: Option<String>,
    pub(crate) source_url: String,
    pub(crate) link_url: Option<String>,
    pub(crate) icon_url: Option<String>,
    pub(crate) unread_count: i64,
    pub(crate) status: LoadStatus,
    pub(crate) error: Option<String>,
    pub(crate) update_mode: PolicyMode,
    pub(crate) update_interval_secs: i64,
    pub(crate) update_enabled: bool,
    pub(crate) expire_mode: PolicyMode,
    pub(crate) expire_age_secs: i64,
    pub(crate) last_update: Option<i64>,
}

// ============================================================================
// Feed
// ============================================================================

/// One subscription: metadata, unread bookkeeping, and the attached updater.
///
/// Cheap to share via `Arc`. All mutation goes through methods that release
/// internal locks before dispatching events, so handlers may call back into
/// the feed.
pub struct Feed {
    id: FeedId,
    pub(crate) state: Mutex<FeedState>,
    pub(crate) cycle: Mutex<UpdateCycle>,
    pub(crate) listeners: Listeners,
    pub(crate) deps: Arc<EngineDeps>,
}

impl Feed {
    /// Materialize a feed from its persisted record, resolving `Inherit`
    /// policies against the given defaults.
    pub fn from_record(
        record: FeedRecord,
        default_interval: i64,
        default_enabled: bool,
        default_expire_age: i64,
        deps: Arc<EngineDeps>,
    ) -> Arc<Feed> {
        let update_interval_secs = match record.update_mode {
            PolicyMode::Inherit => default_interval,
            _ => record.update_interval_secs,
        };
        let update_enabled = match record.update_mode {
            PolicyMode::Disabled => false,
            PolicyMode::Override => true,
            PolicyMode::Inherit => default_enabled,
        };
        let expire_age_secs = match record.expire_mode {
            PolicyMode::Disabled => 0,
            PolicyMode::Override => record.expire_age_secs,
            PolicyMode::Inherit => default_expire_age,
        };

        Arc::new(Feed {
            id: record.id,
            state: Mutex::new(FeedState {
                name: record.name,
                category: record.category,
                source_url: record.source_url,
                link_url: record.link_url,
                icon_url: record.icon_url,
                unread_count: record.unread_count,
                status: LoadStatus::Idle,
                error: None,
                update_mode: record.update_mode,
                update_interval_secs,
                update_enabled,
                expire_mode: record.expire_mode,
                expire_age_secs,
                last_update: record.last_update,
            }),
            cycle: Mutex::new(UpdateCycle::new()),
            listeners: Listeners::new(),
            deps,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> FeedId {
        self.id
    }

    pub fn name(&self) -> String {
        self.locked().name.clone()
    }

    pub fn category(&self) -> Option<String> {
        self.locked().category.clone()
    }

    pub fn source_url(&self) -> String {
        self.locked().source_url.clone()
    }

    pub fn link_url(&self) -> Option<String> {
        self.locked().link_url.clone()
    }

    pub fn icon_url(&self) -> Option<String> {
        self.locked().icon_url.clone()
    }

    pub fn unread_count(&self) -> i64 {
        self.locked().unread_count
    }

    pub fn status(&self) -> LoadStatus {
        self.locked().status
    }

    /// Human-readable message from the last failed cycle, if any.
    pub fn error(&self) -> Option<String> {
        self.locked().error.clone()
    }

    pub fn last_update(&self) -> Option<i64> {
        self.locked().last_update
    }

    pub fn update_mode(&self) -> PolicyMode {
        self.locked().update_mode
    }

    pub fn update_interval(&self) -> i64 {
        self.locked().update_interval_secs
    }

    pub fn update_enabled(&self) -> bool {
        self.locked().update_enabled
    }

    pub fn expire_mode(&self) -> PolicyMode {
        self.locked().expire_mode
    }

    pub fn expire_age(&self) -> i64 {
        self.locked().expire_age_secs
    }

    /// When this feed next becomes due: `last_update + interval`.
    /// A never-updated feed is due immediately.
    pub fn next_due(&self) -> i64 {
        let state = self.locked();
        state.last_update.unwrap_or(0) + state.update_interval_secs
    }

    /// Whether the scheduler should hold a queue entry for this feed.
    pub fn schedulable(&self) -> bool {
        let state = self.locked();
        state.update_enabled && state.update_interval_secs > 0
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register an event listener. Dispatch is synchronous; handlers must not
    /// block.
    pub fn subscribe(&self, listener: impl Fn(&FeedEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.listeners.subscribe(Arc::new(listener))
    }

    /// Detach a listener. After this returns the listener is never invoked
    /// again.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id);
    }

    // ------------------------------------------------------------------
    // Articles
    // ------------------------------------------------------------------

    /// Stored articles for this feed, newest first.
    ///
    /// Storage failures degrade to an empty list (logged, never propagated).
    pub async fn articles(&self) -> Vec<Article> {
        match self.deps.storage.articles_for_feed(self.id).await {
            Ok(articles) => articles,
            Err(e) => {
                tracing::warn!(feed_id = self.id, error = %e, "article query failed, returning empty");
                Vec::new()
            }
        }
    }

    /// Set an article's read flag, maintaining the unread count
    /// incrementally.
    pub async fn set_article_read(&self, article_id: i64, read: bool) {
        match self.deps.storage.set_article_read(article_id, read).await {
            Ok(true) => {
                let delta = if read { -1 } else { 1 };
                {
                    let mut state = self.locked();
                    state.unread_count += delta;
                }
                self.listeners.emit(&FeedEvent::UnreadCountChanged { delta });
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(feed_id = self.id, article_id, error = %e, "failed to persist read flag");
            }
        }
    }

    /// Set an article's starred flag.
    pub async fn set_article_starred(&self, article_id: i64, starred: bool) {
        if let Err(e) = self
            .deps
            .storage
            .set_article_starred(article_id, starred)
            .await
        {
            tracing::warn!(feed_id = self.id, article_id, error = %e, "failed to persist starred flag");
        }
    }

    /// Re-derive the unread count from storage after an event that
    /// invalidates incremental tracking (source URL replaced, import rewrote
    /// the feed). Emits `Reset` plus a correcting unread delta.
    pub async fn resync(&self) {
        {
            let mut state = self.locked();
            if state.status == LoadStatus::Updating {
                // An in-flight cycle will refresh counts itself.
                return;
            }
            state.status = LoadStatus::Loading;
        }
        self.listeners.emit(&FeedEvent::StatusChanged(LoadStatus::Loading));

        let unread = self
            .articles()
            .await
            .iter()
            .filter(|a| !a.read)
            .count() as i64;

        let delta = {
            let mut state = self.locked();
            let delta = unread - state.unread_count;
            state.unread_count = unread;
            state.status = LoadStatus::Idle;
            delta
        };

        self.listeners.emit(&FeedEvent::Reset);
        if delta != 0 {
            self.listeners.emit(&FeedEvent::UnreadCountChanged { delta });
        }
        self.listeners.emit(&FeedEvent::StatusChanged(LoadStatus::Idle));
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Announce deletion. Subscribers (scheduler, aggregates) detach in
    /// response; the context performs the storage delete.
    pub fn request_delete(&self) {
        self.listeners.emit(&FeedEvent::DeleteRequested);
    }

    // ------------------------------------------------------------------
    // Crate-internal mutation (context policy propagation, OPML import)
    // ------------------------------------------------------------------

    pub(crate) fn locked(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the effective update policy and announce the change.
    pub(crate) fn apply_update_policy(&self, mode: PolicyMode, interval_secs: i64, enabled: bool) {
        let changed = {
            let mut state = self.locked();
            let changed = state.update_mode != mode
                || state.update_interval_secs != interval_secs
                || state.update_enabled != enabled;
            state.update_mode = mode;
            state.update_interval_secs = interval_secs;
            state.update_enabled = enabled;
            changed
        };
        if changed {
            self.listeners.emit(&FeedEvent::PolicyChanged);
        }
    }

    /// Overwrite the effective expiry policy.
    pub(crate) fn apply_expire_policy(&self, mode: PolicyMode, age_secs: i64) {
        let mut state = self.locked();
        state.expire_mode = mode;
        state.expire_age_secs = if mode == PolicyMode::Disabled { 0 } else { age_secs };
    }

    /// Rename in memory and announce; persistence is the caller's concern.
    pub(crate) fn apply_name(&self, name: &str) {
        let changed = {
            let mut state = self.locked();
            if state.name == name {
                false
            } else {
                state.name = name.to_owned();
                true
            }
        };
        if changed {
            self.listeners.emit(&FeedEvent::NameChanged(name.to_owned()));
        }
    }

    pub(crate) fn apply_category(&self, category: Option<String>) {
        let mut state = self.locked();
        state.category = category;
    }

    pub(crate) fn apply_source_url(&self, source_url: &str) {
        let mut state = self.locked();
        state.source_url = source_url.to_owned();
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.locked();
        f.debug_struct("Feed")
            .field("id", &self.id)
            .field("name", &state.name)
            .field("status", &state.status)
            .field("unread", &state.unread_count)
            .finish()
    }
}
