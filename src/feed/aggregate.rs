//! Fan-in aggregate views over a dynamic set of member feeds.
//!
//! An [`AggregateFeed`] is a virtual feed: it stores no articles of its own.
//! Its unread count is a running sum seeded from each member at registration
//! time and adjusted by member deltas (never recomputed by scanning members),
//! and its status is `Updating` while at least one member is updating,
//! falling back to an overridable idle status otherwise. Bulk article
//! listing is a join barrier over one concurrent query per member — a member
//! whose query fails contributes zero results instead of stalling or failing
//! the whole view.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;

use crate::feed::{Feed, FeedEvent, Listeners, LoadStatus, SubscriptionId};
use crate::storage::{Article, FeedId};

/// What a view selects from its members' articles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateKind {
    /// Every article of every member.
    All,
    /// Starred articles only.
    Starred,
    /// Every article; membership itself is the filter (one view per
    /// category, members maintained by the context).
    Category(String),
    /// The newest `limit` unread articles.
    Highlights { limit: usize },
}

struct MemberEntry {
    feed: Arc<Feed>,
    subscription: SubscriptionId,
}

struct AggregateInner {
    members: HashMap<FeedId, MemberEntry>,
    updating: HashSet<FeedId>,
    unread: i64,
    idle_status: LoadStatus,
}

/// A virtual feed composed from a dynamic member set.
pub struct AggregateFeed {
    kind: AggregateKind,
    inner: Mutex<AggregateInner>,
    listeners: Listeners,
}

impl AggregateFeed {
    pub fn new(kind: AggregateKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            inner: Mutex::new(AggregateInner {
                members: HashMap::new(),
                updating: HashSet::new(),
                unread: 0,
                idle_status: LoadStatus::Idle,
            }),
            listeners: Listeners::new(),
        })
    }

    pub fn kind(&self) -> &AggregateKind {
        &self.kind
    }

    /// `Updating` while any member updates, otherwise the idle status.
    pub fn status(&self) -> LoadStatus {
        let inner = self.locked();
        if inner.updating.is_empty() {
            inner.idle_status
        } else {
            LoadStatus::Updating
        }
    }

    /// Running unread sum across members.
    pub fn unread_count(&self) -> i64 {
        self.locked().unread
    }

    pub fn member_count(&self) -> usize {
        self.locked().members.len()
    }

    pub fn is_member(&self, feed_id: FeedId) -> bool {
        self.locked().members.contains_key(&feed_id)
    }

    /// Override the status reported while no member is updating. Lets an
    /// outer view reflect its own error state independent of members.
    pub fn set_idle_status(&self, status: LoadStatus) {
        let (before, after) = {
            let mut inner = self.locked();
            let before = composite(&inner);
            inner.idle_status = status;
            (before, composite(&inner))
        };
        if before != after {
            self.listeners.emit(&FeedEvent::StatusChanged(after));
        }
    }

    /// Register an event listener on the aggregate itself.
    pub fn subscribe(
        &self,
        listener: impl Fn(&FeedEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.listeners.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id);
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a member, applying its current unread count and status as if it
    /// had just emitted its initial events, and wiring up forwarding.
    pub fn add_member(self: &Arc<Self>, feed: &Arc<Feed>) {
        if self.is_member(feed.id()) {
            return;
        }

        let subscription = {
            let weak_self = Arc::downgrade(self);
            let weak_feed = Arc::downgrade(feed);
            feed.subscribe(move |event| {
                let (Some(aggregate), Some(feed)) = (weak_self.upgrade(), weak_feed.upgrade())
                else {
                    return;
                };
                aggregate.on_member_event(&feed, event);
            })
        };

        // Read the member's state before taking our lock.
        let member_unread = feed.unread_count();
        let member_updating = feed.status() == LoadStatus::Updating;

        let (status_before, status_after) = {
            let mut inner = self.locked();
            let before = composite(&inner);
            inner.members.insert(
                feed.id(),
                MemberEntry {
                    feed: Arc::clone(feed),
                    subscription,
                },
            );
            inner.unread += member_unread;
            if member_updating {
                inner.updating.insert(feed.id());
            }
            (before, composite(&inner))
        };

        if member_unread != 0 {
            self.listeners
                .emit(&FeedEvent::UnreadCountChanged { delta: member_unread });
        }
        if status_before != status_after {
            self.listeners.emit(&FeedEvent::StatusChanged(status_after));
        }
    }

    /// Remove a member, reversing its contribution and fully detaching the
    /// forwarding listener — a member transitioning after removal must not
    /// affect this view.
    pub fn remove_member(self: &Arc<Self>, feed: &Arc<Feed>) {
        let member_unread = feed.unread_count();

        let (removed, status_before, status_after) = {
            let mut inner = self.locked();
            let before = composite(&inner);
            let removed = inner.members.remove(&feed.id());
            if removed.is_some() {
                inner.updating.remove(&feed.id());
                inner.unread -= member_unread;
            }
            (removed, before, composite(&inner))
        };

        let Some(entry) = removed else { return };
        entry.feed.unsubscribe(entry.subscription);

        if member_unread != 0 {
            self.listeners
                .emit(&FeedEvent::UnreadCountChanged { delta: -member_unread });
        }
        if status_before != status_after {
            self.listeners.emit(&FeedEvent::StatusChanged(status_after));
        }
    }

    fn on_member_event(self: &Arc<Self>, feed: &Arc<Feed>, event: &FeedEvent) {
        match event {
            FeedEvent::UnreadCountChanged { delta } => {
                {
                    let mut inner = self.locked();
                    if !inner.members.contains_key(&feed.id()) {
                        return;
                    }
                    inner.unread += delta;
                }
                self.listeners
                    .emit(&FeedEvent::UnreadCountChanged { delta: *delta });
            }
            FeedEvent::StatusChanged(status) => {
                let (before, after) = {
                    let mut inner = self.locked();
                    if !inner.members.contains_key(&feed.id()) {
                        return;
                    }
                    let before = composite(&inner);
                    if *status == LoadStatus::Updating {
                        inner.updating.insert(feed.id());
                    } else {
                        inner.updating.remove(&feed.id());
                    }
                    (before, composite(&inner))
                };
                if before != after {
                    self.listeners.emit(&FeedEvent::StatusChanged(after));
                }
            }
            FeedEvent::ArticleAdded(article) => {
                self.listeners
                    .emit(&FeedEvent::ArticleAdded(article.clone()));
            }
            FeedEvent::DeleteRequested => {
                self.remove_member(feed);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Fan-out operations
    // ------------------------------------------------------------------

    /// Bulk listing: one concurrent query per member, joined, then filtered
    /// by this view's kind and sorted newest-first.
    ///
    /// Individual member failures already degrade to empty results inside
    /// [`Feed::articles`], so the barrier always resolves.
    pub async fn articles(&self) -> Vec<Article> {
        let members: Vec<Arc<Feed>> = {
            let inner = self.locked();
            inner.members.values().map(|m| Arc::clone(&m.feed)).collect()
        };

        let per_member = join_all(members.iter().map(|feed| feed.articles())).await;

        let mut articles: Vec<Article> = per_member
            .into_iter()
            .flatten()
            .filter(|a| match &self.kind {
                AggregateKind::All | AggregateKind::Category(_) => true,
                AggregateKind::Starred => a.starred,
                AggregateKind::Highlights { .. } => !a.read,
            })
            .collect();

        articles.sort_by(|a, b| b.date.cmp(&a.date).then(a.id.cmp(&b.id)));

        if let AggregateKind::Highlights { limit } = &self.kind {
            articles.truncate(*limit);
        }

        articles
    }

    /// Fan out a refresh to every member's updater. Fire-and-forget:
    /// re-entrant starts are no-ops on the member side.
    pub fn request_update(&self, now: i64) {
        let members: Vec<Arc<Feed>> = {
            let inner = self.locked();
            inner.members.values().map(|m| Arc::clone(&m.feed)).collect()
        };
        for feed in members {
            feed.request_update(now);
        }
    }

    /// Symmetric fan-out abort.
    pub fn abort_updates(&self) {
        let members: Vec<Arc<Feed>> = {
            let inner = self.locked();
            inner.members.values().map(|m| Arc::clone(&m.feed)).collect()
        };
        for feed in members {
            feed.abort_update();
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, AggregateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn composite(inner: &AggregateInner) -> LoadStatus {
    if inner.updating.is_empty() {
        inner.idle_status
    } else {
        LoadStatus::Updating
    }
}
