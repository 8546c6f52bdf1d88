//! The feed registry: owns the feed set, the scheduler, and the default
//! update/expiry policy, and wires the aggregate views.
//!
//! The feed list loads asynchronously at construction; consumers call
//! [`Context::wait_until_populated`] before treating [`Context::feeds`] as
//! complete. A storage failure at startup degrades to an empty feed list —
//! the engine keeps running, it just has nothing to update.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::feed::aggregate::{AggregateFeed, AggregateKind};
use crate::feed::fetcher::Fetcher;
use crate::feed::opml::{self, OpmlFeed};
use crate::feed::{EngineDeps, Feed, FeedEvent};
use crate::storage::{
    Article, FeedDescriptor, FeedId, FeedPatch, PolicyMode, Storage,
};
use crate::scheduler::Scheduler;
use crate::util::validate_url;

// ============================================================================
// Context Events
// ============================================================================

/// Events announced by the context itself.
#[derive(Clone)]
pub enum ContextEvent {
    /// A feed was persisted and registered. Emitted exactly once per feed.
    FeedAdded(Arc<Feed>),
    /// The startup feed-list load finished (possibly with an empty list).
    FeedListPopulated,
}

type ContextListener = Arc<dyn Fn(&ContextEvent) + Send + Sync>;

/// Handle for detaching a context listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSubscription(u64);

// ============================================================================
// Defaults
// ============================================================================

struct Defaults {
    update_interval_secs: i64,
    update_enabled: bool,
    expire_age_secs: i64,
}

// ============================================================================
// Context
// ============================================================================

/// Composition root: storage + scheduler + feed set + aggregate views.
pub struct Context {
    deps: Arc<EngineDeps>,
    scheduler: Scheduler,
    feeds: Mutex<BTreeMap<FeedId, Arc<Feed>>>,
    defaults: Mutex<Defaults>,
    listeners: Mutex<Vec<(u64, ContextListener)>>,
    next_listener: std::sync::atomic::AtomicU64,
    populated_tx: watch::Sender<bool>,
    populated_rx: watch::Receiver<bool>,
    all_items: Arc<AggregateFeed>,
    starred: Arc<AggregateFeed>,
    highlights: Arc<AggregateFeed>,
    categories: Mutex<HashMap<String, Arc<AggregateFeed>>>,
    sweep_resolution: Duration,
}

impl Context {
    /// Build a context and start loading the persisted feed list in the
    /// background.
    ///
    /// # Errors
    ///
    /// Fails only if the HTTP transport cannot initialize. Storage failures
    /// during the load are logged and degrade to an empty feed list.
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Arc<Context>> {
        let fetcher = Fetcher::new(
            Duration::from_secs(config.fetch_timeout_secs),
            config.max_response_bytes,
        )?;
        let deps = Arc::new(EngineDeps {
            storage,
            fetcher,
            max_hops: config.max_hops,
        });

        let (populated_tx, populated_rx) = watch::channel(false);

        let context = Arc::new(Context {
            deps,
            scheduler: Scheduler::new(),
            feeds: Mutex::new(BTreeMap::new()),
            defaults: Mutex::new(Defaults {
                update_interval_secs: config.update_interval_secs,
                update_enabled: config.update_enabled,
                expire_age_secs: config.expire_age_secs,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: std::sync::atomic::AtomicU64::new(1),
            populated_tx,
            populated_rx,
            all_items: AggregateFeed::new(AggregateKind::All),
            starred: AggregateFeed::new(AggregateKind::Starred),
            highlights: AggregateFeed::new(AggregateKind::Highlights {
                limit: config.highlights_limit,
            }),
            categories: Mutex::new(HashMap::new()),
            sweep_resolution: Duration::from_secs(config.sweep_resolution_secs),
        });

        let startup = Arc::clone(&context);
        tokio::spawn(async move {
            startup.load_feed_list().await;
        });

        Ok(context)
    }

    async fn load_feed_list(self: &Arc<Self>) {
        let records = match self.deps.storage.load_feeds().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "failed to load feed list, continuing with empty state");
                Vec::new()
            }
        };

        let now = Utc::now().timestamp();
        for record in records {
            let feed = {
                let defaults = self.lock_defaults();
                Feed::from_record(
                    record,
                    defaults.update_interval_secs,
                    defaults.update_enabled,
                    defaults.expire_age_secs,
                    Arc::clone(&self.deps),
                )
            };
            self.register_feed(&feed, now);
        }

        let _ = self.populated_tx.send(true);
        self.emit(&ContextEvent::FeedListPopulated);
        tracing::info!(count = self.feeds().len(), "feed list populated");
    }

    /// Resolves once the startup feed-list load has finished.
    pub async fn wait_until_populated(&self) {
        let mut rx = self.populated_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Feed set
    // ------------------------------------------------------------------

    /// Snapshot of all registered feeds, in id order. Complete only after
    /// [`Self::wait_until_populated`].
    pub fn feeds(&self) -> Vec<Arc<Feed>> {
        self.lock_feeds().values().cloned().collect()
    }

    pub fn feed_by_id(&self, id: FeedId) -> Option<Arc<Feed>> {
        self.lock_feeds().get(&id).cloned()
    }

    pub fn feed_by_source_url(&self, url: &str) -> Option<Arc<Feed>> {
        self.lock_feeds()
            .values()
            .find(|f| f.source_url() == url)
            .cloned()
    }

    /// Persist a new feed and register it exactly as loaded feeds are
    /// registered. Emits [`ContextEvent::FeedAdded`] once.
    ///
    /// # Errors
    ///
    /// Fails on an invalid source URL (SSRF validation happens here, at the
    /// subscription boundary) or when storage rejects the insert (e.g. a
    /// duplicate source URL).
    pub async fn add_feed(self: &Arc<Self>, descriptor: FeedDescriptor) -> Result<Arc<Feed>> {
        validate_url(&descriptor.source_url)?;

        let record = self.deps.storage.store_feed(&descriptor).await?;
        let feed = {
            let defaults = self.lock_defaults();
            Feed::from_record(
                record,
                defaults.update_interval_secs,
                defaults.update_enabled,
                defaults.expire_age_secs,
                Arc::clone(&self.deps),
            )
        };

        self.register_feed(&feed, Utc::now().timestamp());
        self.emit(&ContextEvent::FeedAdded(Arc::clone(&feed)));
        tracing::info!(feed_id = feed.id(), url = %feed.source_url(), "feed added");
        Ok(feed)
    }

    /// Delete a feed: subscribers detach, the registry forgets it, and
    /// storage cascades to its articles.
    pub async fn remove_feed(self: &Arc<Self>, feed: &Arc<Feed>) {
        // Listeners (scheduler, aggregates, registry) detach synchronously.
        feed.request_delete();

        if let Err(e) = self.deps.storage.delete_feed(feed.id()).await {
            tracing::warn!(feed_id = feed.id(), error = %e, "failed to delete feed from storage");
        }
    }

    fn register_feed(self: &Arc<Self>, feed: &Arc<Feed>, now: i64) {
        self.lock_feeds().insert(feed.id(), Arc::clone(feed));

        // Registry cleanup on deletion; aggregates detach themselves.
        {
            let weak = Arc::downgrade(self);
            let feed_id = feed.id();
            feed.subscribe(move |event| {
                if matches!(event, FeedEvent::DeleteRequested) {
                    if let Some(context) = weak.upgrade() {
                        context.lock_feeds().remove(&feed_id);
                    }
                }
            });
        }

        self.all_items.add_member(feed);
        self.starred.add_member(feed);
        self.highlights.add_member(feed);
        if let Some(category) = feed.category() {
            self.category_view(&category).add_member(feed);
        }

        self.scheduler.schedule(feed, now);
    }

    // ------------------------------------------------------------------
    // Aggregate views
    // ------------------------------------------------------------------

    /// The all-items view over every registered feed.
    pub fn all_items(&self) -> Arc<AggregateFeed> {
        Arc::clone(&self.all_items)
    }

    /// The starred-only view.
    pub fn starred(&self) -> Arc<AggregateFeed> {
        Arc::clone(&self.starred)
    }

    /// The highlights view (newest unread, capped).
    pub fn highlights(&self) -> Arc<AggregateFeed> {
        Arc::clone(&self.highlights)
    }

    /// The view for one category, created on first use and seeded with the
    /// category's current members.
    pub fn category_view(&self, category: &str) -> Arc<AggregateFeed> {
        let existing = self.lock_categories().get(category).cloned();
        if let Some(view) = existing {
            return view;
        }

        let view = AggregateFeed::new(AggregateKind::Category(category.to_owned()));
        for feed in self.feeds() {
            if feed.category().as_deref() == Some(category) {
                view.add_member(&feed);
            }
        }
        self.lock_categories()
            .insert(category.to_owned(), Arc::clone(&view));
        view
    }

    // ------------------------------------------------------------------
    // Defaults and policy propagation
    // ------------------------------------------------------------------

    pub fn default_update_interval(&self) -> i64 {
        self.lock_defaults().update_interval_secs
    }

    pub fn default_update_enabled(&self) -> bool {
        self.lock_defaults().update_enabled
    }

    pub fn default_expire_age(&self) -> i64 {
        self.lock_defaults().expire_age_secs
    }

    /// Change the default update interval. Every `Inherit`-mode feed is
    /// reconfigured immediately; `Override` and `Disabled` feeds are
    /// untouched.
    pub fn set_default_update_interval(&self, secs: i64) {
        let enabled = {
            let mut defaults = self.lock_defaults();
            defaults.update_interval_secs = secs;
            defaults.update_enabled
        };
        for feed in self.feeds() {
            if feed.update_mode() == PolicyMode::Inherit {
                feed.apply_update_policy(PolicyMode::Inherit, secs, enabled);
            }
        }
    }

    /// Enable or disable automatic updates for `Inherit`-mode feeds.
    pub fn set_default_update_enabled(&self, enabled: bool) {
        let interval = {
            let mut defaults = self.lock_defaults();
            defaults.update_enabled = enabled;
            defaults.update_interval_secs
        };
        for feed in self.feeds() {
            if feed.update_mode() == PolicyMode::Inherit {
                feed.apply_update_policy(PolicyMode::Inherit, interval, enabled);
            }
        }
    }

    /// Change the default expiry age for `Inherit`-mode feeds.
    pub fn set_default_expire_age(&self, secs: i64) {
        self.lock_defaults().expire_age_secs = secs;
        for feed in self.feeds() {
            if feed.expire_mode() == PolicyMode::Inherit {
                feed.apply_expire_policy(PolicyMode::Inherit, secs);
            }
        }
    }

    /// Set one feed's update policy, persisting it and resolving `Inherit`
    /// against the current defaults.
    pub async fn set_feed_update_policy(&self, feed: &Arc<Feed>, mode: PolicyMode, interval: i64) {
        let patch = FeedPatch {
            update_mode: Some(mode),
            update_interval_secs: Some(interval),
            ..Default::default()
        };
        if let Err(e) = self.deps.storage.update_feed(feed.id(), &patch).await {
            tracing::warn!(feed_id = feed.id(), error = %e, "failed to persist update policy");
        }

        let (effective_interval, enabled) = {
            let defaults = self.lock_defaults();
            match mode {
                PolicyMode::Inherit => (defaults.update_interval_secs, defaults.update_enabled),
                PolicyMode::Override => (interval, true),
                PolicyMode::Disabled => (interval, false),
            }
        };
        feed.apply_update_policy(mode, effective_interval, enabled);
    }

    /// Set one feed's expiry policy, persisting it and resolving `Inherit`
    /// against the current defaults.
    pub async fn set_feed_expire_policy(&self, feed: &Arc<Feed>, mode: PolicyMode, age: i64) {
        let patch = FeedPatch {
            expire_mode: Some(mode),
            expire_age_secs: Some(age),
            ..Default::default()
        };
        if let Err(e) = self.deps.storage.update_feed(feed.id(), &patch).await {
            tracing::warn!(feed_id = feed.id(), error = %e, "failed to persist expire policy");
        }

        let effective_age = match mode {
            PolicyMode::Inherit => self.lock_defaults().expire_age_secs,
            PolicyMode::Override => age,
            PolicyMode::Disabled => 0,
        };
        feed.apply_expire_policy(mode, effective_age);
    }

    /// Rename a feed, persisting the change.
    pub async fn rename_feed(&self, feed: &Arc<Feed>, name: &str) {
        let patch = FeedPatch {
            name: Some(name.to_owned()),
            ..Default::default()
        };
        if let Err(e) = self.deps.storage.update_feed(feed.id(), &patch).await {
            tracing::warn!(feed_id = feed.id(), error = %e, "failed to persist feed name");
        }
        feed.apply_name(name);
    }

    /// Move a feed to a different category, re-homing it across category
    /// views.
    pub async fn set_feed_category(&self, feed: &Arc<Feed>, category: Option<String>) {
        let previous = feed.category();
        if previous == category {
            return;
        }

        let patch = FeedPatch {
            category: Some(category.clone()),
            ..Default::default()
        };
        if let Err(e) = self.deps.storage.update_feed(feed.id(), &patch).await {
            tracing::warn!(feed_id = feed.id(), error = %e, "failed to persist feed category");
        }

        feed.apply_category(category.clone());

        if let Some(old) = previous {
            if let Some(view) = self.lock_categories().get(&old).cloned() {
                view.remove_member(feed);
            }
        }
        if let Some(new) = category {
            self.category_view(&new).add_member(feed);
        }
    }

    // ------------------------------------------------------------------
    // Broadcast operations
    // ------------------------------------------------------------------

    /// Fire-and-forget refresh of every registered feed. Callers needing
    /// feedback observe feed status individually or via the all-items view.
    pub fn request_update(&self) {
        let now = Utc::now().timestamp();
        for feed in self.feeds() {
            feed.request_update(now);
        }
    }

    /// Fire-and-forget abort of every in-flight update.
    pub fn abort_updates(&self) {
        for feed in self.feeds() {
            feed.abort_update();
        }
    }

    /// Begin the periodic scheduler sweep (immediate first sweep included).
    pub fn start_scheduler(&self) {
        self.scheduler.start(self.sweep_resolution);
    }

    pub fn stop_scheduler(&self) {
        self.scheduler.stop();
    }

    /// One manual sweep; see [`Scheduler::update_stale`].
    pub fn update_stale(&self, now: i64) {
        self.scheduler.update_stale(now);
    }

    /// Restart every errored feed; driven by network-reachability signals.
    pub fn clear_errors(&self) {
        self.scheduler.clear_errors(Utc::now().timestamp());
    }

    // ------------------------------------------------------------------
    // Searches
    // ------------------------------------------------------------------

    /// Full-text-ish search across stored articles. Storage failures degrade
    /// to an empty result.
    pub async fn search(&self, query: &str) -> Vec<Article> {
        match self.deps.storage.search_articles(query).await {
            Ok(articles) => articles,
            Err(e) => {
                tracing::warn!(error = %e, "search failed, returning empty");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // OPML
    // ------------------------------------------------------------------

    /// Import subscriptions. Feeds whose source URL already exists are
    /// updated in place — with their scheduler entry detached for the length
    /// of the batch so each updated feed reschedules once, not once per
    /// field. New descriptors are added like any other feed.
    ///
    /// Returns `(added, updated)` counts.
    pub async fn import_opml(self: &Arc<Self>, entries: Vec<OpmlFeed>) -> (usize, usize) {
        let mut added = 0;
        let mut updated = Vec::new();

        for entry in entries {
            match self.feed_by_source_url(&entry.xml_url) {
                Some(existing) => {
                    // Detach while the batch rewrites fields.
                    self.scheduler.unschedule(&existing);

                    let patch = FeedPatch {
                        name: Some(entry.title.clone()),
                        link_url: Some(entry.html_url.clone()),
                        ..Default::default()
                    };
                    if let Err(e) = self.deps.storage.update_feed(existing.id(), &patch).await {
                        tracing::warn!(feed_id = existing.id(), error = %e, "OPML update failed to persist");
                    }
                    existing.apply_name(&entry.title);
                    self.set_feed_category(&existing, entry.category.clone()).await;

                    updated.push(existing);
                }
                None => {
                    let descriptor = FeedDescriptor::new(entry.title.clone(), entry.xml_url.clone())
                        .with_category(entry.category.clone())
                        .with_link(entry.html_url.clone());
                    match self.add_feed(descriptor).await {
                        Ok(_) => added += 1,
                        Err(e) => {
                            tracing::warn!(url = %entry.xml_url, error = %e, "skipping OPML feed");
                        }
                    }
                }
            }
        }

        // Reattach updated feeds once the whole import has completed.
        let now = Utc::now().timestamp();
        let updated_count = updated.len();
        for feed in updated {
            self.scheduler.schedule(&feed, now);
        }

        tracing::info!(added, updated = updated_count, "OPML import complete");
        (added, updated_count)
    }

    /// Export all feeds as an OPML document, grouped by category with
    /// uncategorized feeds first.
    pub fn export_opml(&self) -> Result<String> {
        let entries: Vec<OpmlFeed> = self
            .feeds()
            .iter()
            .map(|feed| OpmlFeed {
                title: feed.name(),
                xml_url: feed.source_url(),
                html_url: feed.link_url(),
                category: feed.category(),
            })
            .collect();
        opml::export_opml(&entries)
    }

    // ------------------------------------------------------------------
    // Context events
    // ------------------------------------------------------------------

    pub fn subscribe(
        &self,
        listener: impl Fn(&ContextEvent) + Send + Sync + 'static,
    ) -> ContextSubscription {
        let id = self
            .next_listener
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.lock_listeners().push((id, Arc::new(listener)));
        ContextSubscription(id)
    }

    pub fn unsubscribe(&self, id: ContextSubscription) {
        self.lock_listeners().retain(|(entry, _)| *entry != id.0);
    }

    fn emit(&self, event: &ContextEvent) {
        let snapshot: Vec<ContextListener> = self
            .lock_listeners()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    // ------------------------------------------------------------------
    // Lock helpers
    // ------------------------------------------------------------------

    fn lock_feeds(&self) -> std::sync::MutexGuard<'_, BTreeMap<FeedId, Arc<Feed>>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_defaults(&self) -> std::sync::MutexGuard<'_, Defaults> {
        self.defaults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_categories(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AggregateFeed>>> {
        self.categories.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(u64, ContextListener)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
