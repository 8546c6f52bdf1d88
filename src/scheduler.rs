//! Due-time scheduling across all registered feeds.
//!
//! The scheduler keeps one queue entry per schedulable feed, ordered by next
//! due time (`last_update + interval`, ascending; equal due times keep their
//! relative insertion order). A periodic sweep starts every feed whose due
//! time has passed. While a feed is `Updating` it has no queue entry — the
//! status listener removes it on the way in and reinserts it with a fresh due
//! time on every transition out — so a sweep can never start the same feed
//! twice.
//!
//! The queue is only ever mutated *after* the sweep has finished collecting
//! the due prefix: starting an update synchronously reorders the queue, so
//! the collect step and the start step are strictly separated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::feed::{Feed, FeedEvent, LoadStatus, SubscriptionId};
use crate::storage::FeedId;

struct QueueEntry {
    feed_id: FeedId,
    due: i64,
}

struct Registration {
    feed: Arc<Feed>,
    subscription: SubscriptionId,
}

#[derive(Default)]
struct SchedulerInner {
    /// Ascending by `due`; entries with equal due times keep insertion order.
    queue: Vec<QueueEntry>,
    registered: HashMap<FeedId, Registration>,
}

/// Drives automatic updates for a dynamic set of feeds.
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner::default())),
            timer: Mutex::new(None),
        }
    }

    /// Register a feed for automatic updates.
    ///
    /// If the feed is already due as of `now` it is started immediately (the
    /// status listener will queue it when the cycle completes); otherwise it
    /// is inserted in due-time order. The scheduler listens for policy
    /// changes, status transitions, and deletion, and keeps the entry
    /// positioned accordingly. Calling this for an already-registered feed
    /// just repositions its entry.
    pub fn schedule(&self, feed: &Arc<Feed>, now: i64) {
        {
            let guard = lock(&self.inner);
            if guard.registered.contains_key(&feed.id()) {
                drop(guard);
                reposition(&self.inner, feed);
                return;
            }
        }

        let subscription = {
            let inner = Arc::downgrade(&self.inner);
            let weak_feed = Arc::downgrade(feed);
            feed.subscribe(move |event| {
                let (Some(inner), Some(feed)) = (inner.upgrade(), weak_feed.upgrade()) else {
                    return;
                };
                handle_feed_event(&inner, &feed, event);
            })
        };

        {
            let mut guard = lock(&self.inner);
            guard.registered.insert(
                feed.id(),
                Registration {
                    feed: Arc::clone(feed),
                    subscription,
                },
            );
        }

        if !feed.schedulable() {
            return;
        }

        let due = feed.next_due();
        if due <= now {
            // Already overdue: start with `now` as the baseline instead of
            // inserting a stale entry.
            feed.request_update(now);
        } else {
            let mut guard = lock(&self.inner);
            insert_entry(&mut guard.queue, feed.id(), due);
        }
    }

    /// Remove a feed and detach its listener. Safe to call for a feed that
    /// was never scheduled.
    pub fn unschedule(&self, feed: &Arc<Feed>) {
        let registration = {
            let mut guard = lock(&self.inner);
            remove_entry(&mut guard.queue, feed.id());
            guard.registered.remove(&feed.id())
        };
        if let Some(registration) = registration {
            feed.unsubscribe(registration.subscription);
        }
    }

    /// Begin the periodic sweep. An immediate first sweep covers anything
    /// that became due while the scheduler was stopped.
    pub fn start(&self, resolution: Duration) {
        self.stop();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(resolution);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                // The first tick completes immediately.
                ticker.tick().await;
                sweep(&inner, Utc::now().timestamp());
            }
        });
        *lock_timer(&self.timer) = Some(handle);
    }

    /// Stop the periodic sweep. Queue state is preserved.
    pub fn stop(&self) {
        if let Some(handle) = lock_timer(&self.timer).take() {
            handle.abort();
        }
    }

    /// Start every feed whose due time has passed as of `now`.
    ///
    /// The due prefix is snapshotted before any updater starts, because each
    /// start synchronously removes that feed's queue entry.
    pub fn update_stale(&self, now: i64) {
        sweep(&self.inner, now);
    }

    /// Immediately restart every registered feed currently in `Error`.
    /// Driven by "network is reachable again" signals from outside the core.
    pub fn clear_errors(&self, now: i64) {
        let errored: Vec<Arc<Feed>> = {
            let guard = lock(&self.inner);
            guard
                .registered
                .values()
                .map(|r| Arc::clone(&r.feed))
                .collect()
        };
        for feed in errored {
            if feed.status() == LoadStatus::Error {
                feed.request_update(now);
            }
        }
    }

    /// Current queue as `(feed_id, due)` pairs, soonest first. Diagnostic.
    pub fn queued(&self) -> Vec<(FeedId, i64)> {
        lock(&self.inner)
            .queue
            .iter()
            .map(|e| (e.feed_id, e.due))
            .collect()
    }

    /// Number of registered feeds (queued or in flight).
    pub fn registered_count(&self) -> usize {
        lock(&self.inner).registered.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Internals
// ============================================================================

fn lock(inner: &Mutex<SchedulerInner>) -> std::sync::MutexGuard<'_, SchedulerInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_timer(
    timer: &Mutex<Option<tokio::task::JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
    timer.lock().unwrap_or_else(|e| e.into_inner())
}

/// Insert after any existing entry with the same due time, so equal due
/// times preserve their relative insertion order.
fn insert_entry(queue: &mut Vec<QueueEntry>, feed_id: FeedId, due: i64) {
    let pos = queue
        .iter()
        .position(|e| e.due > due)
        .unwrap_or(queue.len());
    queue.insert(pos, QueueEntry { feed_id, due });
}

fn remove_entry(queue: &mut Vec<QueueEntry>, feed_id: FeedId) {
    queue.retain(|e| e.feed_id != feed_id);
}

/// Atomically remove-then-reinsert a feed's entry from its current state.
fn reposition(inner: &Mutex<SchedulerInner>, feed: &Arc<Feed>) {
    let mut guard = lock(inner);
    remove_entry(&mut guard.queue, feed.id());
    if guard.registered.contains_key(&feed.id())
        && feed.schedulable()
        && feed.status() != LoadStatus::Updating
    {
        let due = feed.next_due();
        insert_entry(&mut guard.queue, feed.id(), due);
    }
}

fn handle_feed_event(inner: &Arc<Mutex<SchedulerInner>>, feed: &Arc<Feed>, event: &FeedEvent) {
    match event {
        FeedEvent::StatusChanged(LoadStatus::Updating) => {
            // In flight: absent from the queue so a sweep can't double-start.
            let mut guard = lock(inner);
            remove_entry(&mut guard.queue, feed.id());
        }
        FeedEvent::StatusChanged(_) => {
            // Out of flight (success, error, or abort): reinsert with the
            // feed's current due time. After an error last_update is
            // unchanged, so the feed stays due and retries next sweep.
            reposition(inner, feed);
        }
        FeedEvent::PolicyChanged => {
            reposition(inner, feed);
        }
        FeedEvent::DeleteRequested => {
            let registration = {
                let mut guard = lock(inner);
                remove_entry(&mut guard.queue, feed.id());
                guard.registered.remove(&feed.id())
            };
            if let Some(registration) = registration {
                feed.unsubscribe(registration.subscription);
            }
        }
        _ => {}
    }
}

/// One sweep: pure collect step over the ordered queue (early exit at the
/// first not-yet-due entry), then the mutation step of starting each updater.
fn sweep(inner: &Mutex<SchedulerInner>, now: i64) {
    let due: Vec<Arc<Feed>> = {
        let guard = lock(inner);
        guard
            .queue
            .iter()
            .take_while(|e| e.due <= now)
            .filter_map(|e| guard.registered.get(&e.feed_id))
            .map(|r| Arc::clone(&r.feed))
            .collect()
    };

    if !due.is_empty() {
        tracing::debug!(count = due.len(), "starting stale feed updates");
    }

    for feed in due {
        feed.request_update(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::{make_feed, test_deps};
    use crate::storage::PolicyMode;

    /// Pin a feed's last-update so its due time is deterministic.
    fn set_last_update(feed: &Arc<Feed>, ts: Option<i64>) {
        feed.locked().last_update = ts;
    }

    fn set_interval(feed: &Arc<Feed>, secs: i64) {
        feed.locked().update_interval_secs = secs;
    }

    #[tokio::test]
    async fn overdue_feed_starts_immediately_on_schedule() {
        let deps = test_deps().await;
        let feed = make_feed(&deps, "https://feeds.example.com/a").await;
        set_interval(&feed, 60);
        set_last_update(&feed, Some(1_000_000 - 70));

        let scheduler = Scheduler::new();
        scheduler.schedule(&feed, 1_000_000);

        // Already due: transitioned to Updating with `now` as the baseline,
        // no queue entry.
        assert_eq!(feed.status(), LoadStatus::Updating);
        assert_eq!(feed.update_started_at(), Some(1_000_000));
        assert!(scheduler.queued().is_empty());
    }

    #[tokio::test]
    async fn future_feed_is_queued_not_started() {
        let deps = test_deps().await;
        let feed = make_feed(&deps, "https://feeds.example.com/a").await;
        set_interval(&feed, 600);
        set_last_update(&feed, Some(1_000_000 - 10));

        let scheduler = Scheduler::new();
        scheduler.schedule(&feed, 1_000_000);

        assert_eq!(feed.status(), LoadStatus::Idle);
        assert_eq!(scheduler.queued(), vec![(feed.id(), 1_000_000 + 590)]);
    }

    #[tokio::test]
    async fn queue_is_ordered_by_due_time() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let now = 1_000_000;

        let mut expected = Vec::new();
        for (offset, interval) in [(300, 600), (100, 600), (200, 600)] {
            let feed = make_feed(&deps, &format!("https://feeds.example.com/{offset}")).await;
            set_interval(&feed, interval);
            set_last_update(&feed, Some(now + offset - interval));
            scheduler.schedule(&feed, now);
            expected.push((feed.id(), now + offset));
        }
        expected.sort_by_key(|(_, due)| *due);

        assert_eq!(scheduler.queued(), expected);
    }

    #[tokio::test]
    async fn disabled_or_nonpositive_interval_never_queued() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();

        let disabled = make_feed(&deps, "https://feeds.example.com/disabled").await;
        disabled.apply_update_policy(PolicyMode::Disabled, 600, false);
        set_last_update(&disabled, Some(2_000_000));

        let zero = make_feed(&deps, "https://feeds.example.com/zero").await;
        zero.apply_update_policy(PolicyMode::Override, 0, true);
        set_last_update(&zero, Some(2_000_000));

        scheduler.schedule(&disabled, 1_000_000);
        scheduler.schedule(&zero, 1_000_000);

        assert!(scheduler.queued().is_empty());
        assert_eq!(disabled.status(), LoadStatus::Idle, "never started either");
        // Both stay registered so a later policy change can requeue them.
        assert_eq!(scheduler.registered_count(), 2);
    }

    #[tokio::test]
    async fn sweep_starts_due_prefix_only() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let t = 1_000_000;

        let make = |offset: i64| {
            let deps = deps.clone();
            async move {
                let feed = make_feed(&deps, &format!("https://feeds.example.com/{offset}")).await;
                set_interval(&feed, 600);
                // due at t + offset
                set_last_update(&feed, Some(t + offset - 600));
                feed
            }
        };

        let overdue_a = make(-10).await;
        let overdue_b = make(-5).await;
        let future = make(100).await;

        // Register while nothing is due yet so everything lands in the queue.
        scheduler.schedule(&overdue_a, t - 600);
        scheduler.schedule(&overdue_b, t - 600);
        scheduler.schedule(&future, t - 600);
        assert_eq!(scheduler.queued().len(), 3);

        scheduler.update_stale(t);

        assert_eq!(overdue_a.status(), LoadStatus::Updating);
        assert_eq!(overdue_b.status(), LoadStatus::Updating);
        assert_eq!(future.status(), LoadStatus::Idle);
        // The not-yet-due entry is untouched and still queued at its slot.
        assert_eq!(scheduler.queued(), vec![(future.id(), t + 100)]);
    }

    #[tokio::test]
    async fn equal_due_times_start_in_insertion_order() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let t = 1_000_000;

        let first = make_feed(&deps, "https://feeds.example.com/first").await;
        let second = make_feed(&deps, "https://feeds.example.com/second").await;
        for feed in [&first, &second] {
            set_interval(feed, 600);
            set_last_update(feed, Some(t - 590));
        }

        scheduler.schedule(&first, t - 300);
        scheduler.schedule(&second, t - 300);
        assert_eq!(
            scheduler.queued(),
            vec![(first.id(), t + 10), (second.id(), t + 10)],
            "insertion order preserved among equal due times"
        );

        scheduler.update_stale(t + 10);
        assert_eq!(first.status(), LoadStatus::Updating);
        assert_eq!(second.status(), LoadStatus::Updating);
    }

    #[tokio::test]
    async fn policy_change_repositions_atomically() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let t = 1_000_000;

        let feed = make_feed(&deps, "https://feeds.example.com/a").await;
        set_interval(&feed, 600);
        set_last_update(&feed, Some(t));
        scheduler.schedule(&feed, t);
        assert_eq!(scheduler.queued(), vec![(feed.id(), t + 600)]);

        feed.apply_update_policy(PolicyMode::Override, 60, true);
        assert_eq!(scheduler.queued(), vec![(feed.id(), t + 60)], "one entry, new position");

        feed.apply_update_policy(PolicyMode::Disabled, 60, false);
        assert!(scheduler.queued().is_empty(), "disabling removes the entry");
    }

    #[tokio::test]
    async fn unschedule_is_idempotent_and_detaches() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let feed = make_feed(&deps, "https://feeds.example.com/a").await;
        set_interval(&feed, 600);
        set_last_update(&feed, Some(2_000_000));

        scheduler.unschedule(&feed); // never scheduled: no-op

        scheduler.schedule(&feed, 1_000_000);
        scheduler.unschedule(&feed);
        assert!(scheduler.queued().is_empty());
        assert_eq!(scheduler.registered_count(), 0);

        // Detached: policy changes no longer touch the queue.
        feed.apply_update_policy(PolicyMode::Override, 30, true);
        assert!(scheduler.queued().is_empty());
    }

    #[tokio::test]
    async fn delete_request_removes_registration() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let feed = make_feed(&deps, "https://feeds.example.com/a").await;
        set_interval(&feed, 600);
        set_last_update(&feed, Some(2_000_000));

        scheduler.schedule(&feed, 1_000_000);
        assert_eq!(scheduler.registered_count(), 1);

        feed.request_delete();
        assert_eq!(scheduler.registered_count(), 0);
        assert!(scheduler.queued().is_empty());
    }

    #[tokio::test]
    async fn clear_errors_restarts_only_errored_feeds() {
        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let t = 1_000_000;

        let healthy = make_feed(&deps, "https://feeds.example.com/ok").await;
        let broken = make_feed(&deps, "https://feeds.example.com/broken").await;
        for feed in [&healthy, &broken] {
            set_interval(feed, 600);
            set_last_update(feed, Some(t + 600));
            scheduler.schedule(feed, t);
        }
        broken.locked().status = LoadStatus::Error;

        scheduler.clear_errors(t);

        assert_eq!(broken.status(), LoadStatus::Updating);
        assert_eq!(broken.update_started_at(), Some(t));
        assert_eq!(healthy.status(), LoadStatus::Idle, "healthy feeds untouched");
    }

    #[tokio::test]
    async fn completed_update_requeues_with_fresh_due_time() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?><rss version="2.0"><channel><title>F</title></channel></rss>"#,
            ))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let scheduler = Scheduler::new();
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;
        set_interval(&feed, 600);
        set_last_update(&feed, None); // never updated: due immediately

        let t = 1_000_000;
        scheduler.schedule(&feed, t);
        assert_eq!(feed.status(), LoadStatus::Updating);

        for _ in 0..500 {
            if feed.status() != LoadStatus::Updating {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(feed.status(), LoadStatus::Idle);
        assert_eq!(feed.last_update(), Some(t));
        assert_eq!(
            scheduler.queued(),
            vec![(feed.id(), t + 600)],
            "reinserted using the just-recorded last-update"
        );
    }
}
