//! Remote pagination cursors for paged queries.
//!
//! Each query key owns a [`RemoteKey`] bounding what has been fetched so
//! far. Newer pages start at `until_id`, older pages end at `since_id`, and
//! only one fetch per key may be in flight at a time.
//!
//! Both boundaries are inclusive, so the tracker remembers which ids it
//! already handed out at each one. An older page that brings back only
//! those ids moves `since_id` one second further back.

use crate::error::{ClientError, Result};
use nostr::{Event, unix_now};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Kind of the caching-server event that reports page boundaries.
pub const PAGING_EVENT_KIND: u32 = 10_000_113;

/// Which end of a query to extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Items after everything fetched so far
    Newer,
    /// Items before everything fetched so far
    Older,
}

/// Cursor state for one paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteKey {
    /// Oldest boundary fetched
    pub since_id: u64,
    /// Newest boundary fetched
    pub until_id: u64,
    /// When the cursor last changed (unix seconds)
    pub cached_at: u64,
    /// An older page came back empty; nothing further back exists
    pub older_exhausted: bool,
}

/// Boundaries observed in one fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    pub since: u64,
    pub until: u64,
    /// Content events in the page, excluding the paging marker
    pub count: usize,
    /// `(id, created_at)` of the content events; empty for bounds-only pages
    pub items: Vec<(String, u64)>,
}

#[derive(Deserialize)]
struct PagingContent {
    since: u64,
    until: u64,
}

impl PageResult {
    /// A page with no items.
    pub fn empty() -> Self {
        Self {
            since: 0,
            until: 0,
            count: 0,
            items: Vec::new(),
        }
    }

    /// Page with explicit boundaries. Reversed bounds are swapped.
    pub fn new(since: u64, until: u64, count: usize) -> Self {
        Self {
            since: since.min(until),
            until: since.max(until),
            count,
            items: Vec::new(),
        }
    }

    /// Derive boundaries from a page's events.
    ///
    /// A paging marker event wins; otherwise the min and max `created_at`
    /// of the content events are used.
    pub fn from_events(events: &[Event]) -> Self {
        let items: Vec<(String, u64)> = events
            .iter()
            .filter(|e| e.kind != PAGING_EVENT_KIND)
            .map(|e| (e.id.clone(), e.created_at))
            .collect();

        let marker = events
            .iter()
            .filter(|e| e.kind == PAGING_EVENT_KIND)
            .find_map(|e| serde_json::from_str::<PagingContent>(&e.content).ok());
        let bounds = match marker {
            Some(paging) => Some((paging.since, paging.until)),
            None => items
                .iter()
                .map(|(_, at)| *at)
                .min()
                .zip(items.iter().map(|(_, at)| *at).max()),
        };

        match bounds {
            Some((since, until)) => {
                let count = items.len();
                Self {
                    items,
                    ..Self::new(since, until, count)
                }
            }
            None => Self::empty(),
        }
    }

    fn ids_at(&self, created_at: u64) -> impl Iterator<Item = String> + '_ {
        self.items
            .iter()
            .filter(move |(_, at)| *at == created_at)
            .map(|(id, _)| id.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Boundaries for the next page request. `None` leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageRequest {
    pub since: Option<u64>,
    pub until: Option<u64>,
}

impl PageRequest {
    /// Write the bounds into a query payload.
    ///
    /// Cache calls (`{"cache": [name, args]}`) take the bounds in `args`;
    /// plain filters take them at the top level.
    pub fn apply_to(&self, payload: &mut Value) {
        let in_cache_args = payload.pointer("/cache/1").is_some_and(Value::is_object);
        let target = if in_cache_args {
            payload.pointer_mut("/cache/1")
        } else {
            Some(payload)
        };
        let Some(fields) = target.and_then(Value::as_object_mut) else {
            return;
        };
        if let Some(since) = self.since {
            fields.insert("since".to_string(), since.into());
        }
        if let Some(until) = self.until {
            fields.insert("until".to_string(), until.into());
        }
    }
}

/// Cursor plus the ids already handed out at each inclusive boundary.
struct CursorEntry {
    key: RemoteKey,
    oldest_ids: HashSet<String>,
    newest_ids: HashSet<String>,
}

impl CursorEntry {
    fn first(page: &PageResult, now: u64) -> Self {
        Self {
            key: RemoteKey {
                since_id: page.since,
                until_id: page.until,
                cached_at: now,
                older_exhausted: false,
            },
            oldest_ids: page.ids_at(page.since).collect(),
            newest_ids: page.ids_at(page.until).collect(),
        }
    }

    /// Whether an item coming back in a `direction` page was handed out
    /// by an earlier page.
    fn delivered(&self, direction: Direction, id: &str, created_at: u64) -> bool {
        match direction {
            Direction::Older => {
                created_at > self.key.since_id
                    || (created_at == self.key.since_id && self.oldest_ids.contains(id))
            }
            Direction::Newer => {
                created_at < self.key.until_id
                    || (created_at == self.key.until_id && self.newest_ids.contains(id))
            }
        }
    }

    fn fresh_count(&self, page: &PageResult, direction: Direction) -> usize {
        if page.items.is_empty() {
            let moved = match direction {
                Direction::Older => page.since < self.key.since_id,
                Direction::Newer => page.until > self.key.until_id,
            };
            return if moved { page.count } else { 0 };
        }
        page.items
            .iter()
            .filter(|(id, at)| !self.delivered(direction, id, *at))
            .count()
    }

    fn apply(&mut self, page: &PageResult, direction: Direction, now: u64) {
        let fresh = self.fresh_count(page, direction);
        match direction {
            Direction::Newer if fresh == 0 => {}
            Direction::Newer if page.until > self.key.until_id => {
                self.key.until_id = page.until;
                self.newest_ids = page.ids_at(page.until).collect();
            }
            Direction::Newer => self.newest_ids.extend(page.ids_at(self.key.until_id)),
            Direction::Older if page.is_empty() => self.key.older_exhausted = true,
            // only already-delivered boundary items came back: step past
            // the tied timestamp
            Direction::Older if fresh == 0 => match self.key.since_id.checked_sub(1) {
                Some(boundary) => {
                    self.key.since_id = boundary;
                    self.oldest_ids.clear();
                }
                None => self.key.older_exhausted = true,
            },
            Direction::Older if page.since < self.key.since_id => {
                self.key.since_id = page.since;
                self.oldest_ids = page.ids_at(page.since).collect();
            }
            Direction::Older => self.oldest_ids.extend(page.ids_at(self.key.since_id)),
        }
        self.key.cached_at = now;
    }
}

#[derive(Default)]
struct TrackerState {
    cursors: HashMap<String, CursorEntry>,
    /// query key -> ticket holding the single-writer slot
    in_flight: HashMap<String, u64>,
}

impl TrackerState {
    fn next_request(&self, key: &str, direction: Direction) -> Option<PageRequest> {
        let Some(entry) = self.cursors.get(key) else {
            return Some(PageRequest::default());
        };
        let cursor = &entry.key;
        match direction {
            Direction::Newer => Some(PageRequest {
                since: Some(cursor.until_id),
                until: None,
            }),
            Direction::Older if cursor.older_exhausted => None,
            Direction::Older => Some(PageRequest {
                since: None,
                until: Some(cursor.since_id),
            }),
        }
    }

    /// Drop events an earlier page of `key` already handed out.
    fn undelivered(&self, key: &str, direction: Direction, mut events: Vec<Event>) -> Vec<Event> {
        if let Some(entry) = self.cursors.get(key) {
            events.retain(|e| {
                e.kind == PAGING_EVENT_KIND || !entry.delivered(direction, &e.id, e.created_at)
            });
        }
        events
    }

    fn apply(&mut self, key: &str, page: &PageResult, direction: Direction) -> Option<RemoteKey> {
        let now = unix_now();
        match self.cursors.get_mut(key) {
            None if page.is_empty() => None,
            None => {
                let entry = CursorEntry::first(page, now);
                let cursor = entry.key;
                self.cursors.insert(key.to_string(), entry);
                Some(cursor)
            }
            Some(entry) => {
                entry.apply(page, direction, now);
                Some(entry.key)
            }
        }
    }
}

/// Per-query cursor table with single-writer-per-key advances.
#[derive(Clone, Default)]
pub struct PaginationCursorTracker {
    state: Arc<Mutex<TrackerState>>,
    tickets: Arc<AtomicU64>,
}

impl PaginationCursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor for `key`, if a page has been fetched.
    pub fn cursor_for(&self, key: &str) -> Option<RemoteKey> {
        self.state.lock().cursors.get(key).map(|entry| entry.key)
    }

    /// Boundaries for the next page in `direction`.
    ///
    /// `None` when the older end is exhausted.
    pub fn page_request(&self, key: &str, direction: Direction) -> Option<PageRequest> {
        self.state.lock().next_request(key, direction)
    }

    /// Apply a fetched page to the cursor for `key`.
    ///
    /// Fails with `ConcurrentAdvance` while a [`PageFetch`] for the key is
    /// outstanding.
    pub fn advance(
        &self,
        key: &str,
        page: &PageResult,
        direction: Direction,
    ) -> Result<Option<RemoteKey>> {
        let mut state = self.state.lock();
        if state.in_flight.contains_key(key) {
            return Err(ClientError::ConcurrentAdvance(key.to_string()));
        }
        Ok(state.apply(key, page, direction))
    }

    /// Claim the single-writer slot for `key` and compute the request
    /// boundaries. The slot is released when the ticket completes or drops.
    pub fn begin(&self, key: &str, direction: Direction) -> Result<PageFetch> {
        let mut state = self.state.lock();
        if state.in_flight.contains_key(key) {
            debug!("Rejecting overlapping page fetch for {}", key);
            return Err(ClientError::ConcurrentAdvance(key.to_string()));
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        state.in_flight.insert(key.to_string(), ticket);
        let request = state.next_request(key, direction);

        Ok(PageFetch {
            state: Arc::clone(&self.state),
            key: key.to_string(),
            direction,
            ticket,
            request,
        })
    }

    /// Drop cursor state for `key`. An outstanding fetch for the old
    /// parameters is detached and its result discarded.
    pub fn reset(&self, key: &str) {
        let mut state = self.state.lock();
        state.cursors.remove(key);
        state.in_flight.remove(key);
    }

    /// Whether a fetch for `key` is outstanding.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }
}

/// Outstanding page fetch holding a key's single-writer slot.
pub struct PageFetch {
    state: Arc<Mutex<TrackerState>>,
    key: String,
    direction: Direction,
    ticket: u64,
    request: Option<PageRequest>,
}

impl PageFetch {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Boundaries to send, or `None` when there is nothing left to fetch.
    pub fn request(&self) -> Option<PageRequest> {
        self.request
    }

    /// Apply the fetched page and release the slot.
    ///
    /// Returns `None` if the key was reset meanwhile or no cursor exists yet.
    pub fn complete(self, page: &PageResult) -> Option<RemoteKey> {
        let mut state = self.state.lock();
        if state.in_flight.get(&self.key) != Some(&self.ticket) {
            debug!("Discarding page for reset query {}", self.key);
            return None;
        }
        state.in_flight.remove(&self.key);
        state.apply(&self.key, page, self.direction)
    }

    /// Apply a fetched page given as events and release the slot.
    ///
    /// Returns the events an earlier page of this query has not already
    /// handed out, plus the updated cursor.
    pub fn complete_events(self, events: Vec<Event>) -> (Vec<Event>, Option<RemoteKey>) {
        let page = PageResult::from_events(&events);
        let mut state = self.state.lock();
        if state.in_flight.get(&self.key) != Some(&self.ticket) {
            debug!("Discarding page for reset query {}", self.key);
            return (events, None);
        }
        state.in_flight.remove(&self.key);
        let fresh = state.undelivered(&self.key, self.direction, events);
        let cursor = state.apply(&self.key, &page, self.direction);
        (fresh, cursor)
    }
}

impl Drop for PageFetch {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.in_flight.get(&self.key) == Some(&self.ticket) {
            state.in_flight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u32, created_at: u64, content: &str) -> Event {
        Event {
            id: format!("{kind}-{created_at}"),
            pubkey: "pk".to_string(),
            created_at,
            kind,
            tags: vec![],
            content: content.to_string(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_page_request_applies_to_cache_args_and_filters() {
        let request = PageRequest {
            since: None,
            until: Some(500),
        };

        let mut cache = serde_json::json!({"cache": ["feed", {"pubkey": "pk", "limit": 20}]});
        request.apply_to(&mut cache);
        assert_eq!(cache["cache"][1]["until"], 500);
        assert!(cache["cache"][1].get("since").is_none());

        let mut filter = serde_json::json!({"kinds": [1]});
        PageRequest {
            since: Some(10),
            until: None,
        }
        .apply_to(&mut filter);
        assert_eq!(filter["since"], 10);
    }

    #[test]
    fn test_page_result_from_created_at() {
        let events = vec![event(1, 300, ""), event(1, 100, ""), event(1, 200, "")];
        let page = PageResult::from_events(&events);
        assert_eq!((page.since, page.until, page.count), (100, 300, 3));
        assert_eq!(page.items[0], ("1-300".to_string(), 300));
    }

    #[test]
    fn test_page_result_prefers_paging_marker() {
        let events = vec![
            event(1, 150, ""),
            event(PAGING_EVENT_KIND, 0, r#"{"since":90,"until":400,"order_by":"created_at"}"#),
        ];
        let page = PageResult::from_events(&events);
        assert_eq!((page.since, page.until, page.count), (90, 400, 1));
    }

    #[test]
    fn test_first_fetch_sets_both_bounds() {
        let tracker = PaginationCursorTracker::new();
        assert_eq!(tracker.cursor_for("feed"), None);
        assert_eq!(
            tracker.page_request("feed", Direction::Older),
            Some(PageRequest::default())
        );

        let cursor = tracker
            .advance("feed", &PageResult::new(100, 200, 20), Direction::Newer)
            .unwrap()
            .unwrap();
        assert_eq!((cursor.since_id, cursor.until_id), (100, 200));
        assert!(cursor.cached_at > 0);
    }

    #[test]
    fn test_empty_first_page_creates_no_cursor() {
        let tracker = PaginationCursorTracker::new();
        let cursor = tracker
            .advance("feed", &PageResult::empty(), Direction::Newer)
            .unwrap();
        assert_eq!(cursor, None);
        assert_eq!(tracker.cursor_for("feed"), None);
    }

    #[test]
    fn test_newer_and_older_requests_use_opposite_bounds() {
        let tracker = PaginationCursorTracker::new();
        tracker
            .advance("feed", &PageResult::new(100, 200, 20), Direction::Newer)
            .unwrap();

        assert_eq!(
            tracker.page_request("feed", Direction::Newer),
            Some(PageRequest {
                since: Some(200),
                until: None
            })
        );
        assert_eq!(
            tracker.page_request("feed", Direction::Older),
            Some(PageRequest {
                since: None,
                until: Some(100)
            })
        );
    }

    #[test]
    fn test_sequence_keeps_order_and_never_repeats_boundaries() {
        let tracker = PaginationCursorTracker::new();
        tracker
            .advance("feed", &PageResult::new(500, 600, 10), Direction::Newer)
            .unwrap();

        let mut requested = Vec::new();
        let pages = [
            (Direction::Older, PageResult::new(400, 500, 10)),
            (Direction::Newer, PageResult::new(600, 700, 10)),
            (Direction::Older, PageResult::new(300, 400, 10)),
            (Direction::Newer, PageResult::new(700, 720, 3)),
            (Direction::Older, PageResult::new(250, 300, 4)),
        ];
        for (direction, page) in pages {
            let request = tracker.page_request("feed", direction).unwrap();
            assert!(!requested.contains(&(direction, request)));
            requested.push((direction, request));

            let cursor = tracker.advance("feed", &page, direction).unwrap().unwrap();
            assert!(cursor.since_id <= cursor.until_id);
        }

        let cursor = tracker.cursor_for("feed").unwrap();
        assert_eq!((cursor.since_id, cursor.until_id), (250, 720));
    }

    #[test]
    fn test_empty_older_page_exhausts_older_end() {
        let tracker = PaginationCursorTracker::new();
        tracker
            .advance("thread", &PageResult::new(100, 200, 5), Direction::Newer)
            .unwrap();
        let cursor = tracker
            .advance("thread", &PageResult::empty(), Direction::Older)
            .unwrap()
            .unwrap();

        assert!(cursor.older_exhausted);
        assert_eq!(tracker.page_request("thread", Direction::Older), None);
        assert!(tracker.page_request("thread", Direction::Newer).is_some());
    }

    fn note(id: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            ..event(1, created_at, id)
        }
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    fn fetch(
        tracker: &PaginationCursorTracker,
        direction: Direction,
        events: Vec<Event>,
    ) -> (Vec<Event>, RemoteKey) {
        let (events, cursor) = tracker
            .begin("thread", direction)
            .unwrap()
            .complete_events(events);
        (events, cursor.unwrap())
    }

    #[test]
    fn test_older_page_repeating_boundary_steps_back() {
        let tracker = PaginationCursorTracker::new();
        fetch(&tracker, Direction::Newer, vec![note("a", 300)]);

        // the inclusive until returns the boundary event again
        let (events, cursor) = fetch(&tracker, Direction::Older, vec![note("a", 300)]);
        assert!(events.is_empty());
        assert!(!cursor.older_exhausted);
        assert_eq!(cursor.since_id, 299);
        assert_eq!(
            tracker.page_request("thread", Direction::Older),
            Some(PageRequest {
                since: None,
                until: Some(299),
            })
        );

        let (events, cursor) = fetch(&tracker, Direction::Older, vec![note("b", 200)]);
        assert_eq!(ids(&events), vec!["b"]);
        assert_eq!((cursor.since_id, cursor.until_id), (200, 300));
        assert!(!cursor.older_exhausted);
    }

    #[test]
    fn test_full_page_of_tied_timestamps_is_not_exhausted() {
        let tracker = PaginationCursorTracker::new();
        fetch(&tracker, Direction::Newer, vec![note("a", 100), note("b", 100)]);

        let (events, cursor) =
            fetch(&tracker, Direction::Older, vec![note("a", 100), note("b", 100)]);
        assert!(events.is_empty());
        assert!(!cursor.older_exhausted);
        assert_eq!(cursor.since_id, 99);

        let (events, cursor) = fetch(&tracker, Direction::Older, vec![note("c", 50)]);
        assert_eq!(ids(&events), vec!["c"]);
        assert_eq!(cursor.since_id, 50);
    }

    #[test]
    fn test_new_event_at_boundary_is_returned_once() {
        let tracker = PaginationCursorTracker::new();
        fetch(&tracker, Direction::Newer, vec![note("a", 100), note("b", 200)]);

        let (events, cursor) = fetch(
            &tracker,
            Direction::Older,
            vec![note("a", 100), note("z", 100), note("c", 90)],
        );
        assert_eq!(ids(&events), vec!["z", "c"]);
        assert_eq!(cursor.since_id, 90);

        let (events, cursor) = fetch(
            &tracker,
            Direction::Newer,
            vec![note("b", 200), note("d", 200)],
        );
        assert_eq!(ids(&events), vec!["d"]);
        assert_eq!(cursor.until_id, 200);

        let (events, _) = fetch(&tracker, Direction::Newer, vec![note("b", 200), note("d", 200)]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_repeated_boundary_at_zero_exhausts() {
        let tracker = PaginationCursorTracker::new();
        fetch(&tracker, Direction::Newer, vec![note("genesis", 0)]);

        let (_, cursor) = fetch(&tracker, Direction::Older, vec![note("genesis", 0)]);
        assert!(cursor.older_exhausted);
        assert_eq!(tracker.page_request("thread", Direction::Older), None);
    }

    #[test]
    fn test_bounds_only_page_without_progress_steps_back() {
        let tracker = PaginationCursorTracker::new();
        tracker
            .advance("thread", &PageResult::new(100, 200, 5), Direction::Newer)
            .unwrap();
        let cursor = tracker
            .advance("thread", &PageResult::new(100, 100, 2), Direction::Older)
            .unwrap()
            .unwrap();
        assert!(!cursor.older_exhausted);
        assert_eq!(cursor.since_id, 99);
    }

    #[test]
    fn test_concurrent_advance_rejected() {
        let tracker = PaginationCursorTracker::new();
        let fetch = tracker.begin("feed", Direction::Newer).unwrap();

        assert!(matches!(
            tracker.begin("feed", Direction::Older),
            Err(ClientError::ConcurrentAdvance(_))
        ));
        assert!(matches!(
            tracker.advance("feed", &PageResult::new(1, 2, 1), Direction::Newer),
            Err(ClientError::ConcurrentAdvance(_))
        ));
        // other keys are independent
        assert!(tracker.begin("other", Direction::Newer).is_ok());

        let cursor = fetch.complete(&PageResult::new(10, 20, 2)).unwrap();
        assert_eq!((cursor.since_id, cursor.until_id), (10, 20));
        assert!(!tracker.is_in_flight("feed"));
        assert!(tracker.begin("feed", Direction::Older).is_ok());
    }

    #[test]
    fn test_dropped_fetch_releases_slot() {
        let tracker = PaginationCursorTracker::new();
        {
            let _fetch = tracker.begin("feed", Direction::Newer).unwrap();
            assert!(tracker.is_in_flight("feed"));
        }
        assert!(!tracker.is_in_flight("feed"));
    }

    #[test]
    fn test_reset_discards_in_flight_result() {
        let tracker = PaginationCursorTracker::new();
        tracker
            .advance("feed", &PageResult::new(100, 200, 5), Direction::Newer)
            .unwrap();
        let fetch = tracker.begin("feed", Direction::Newer).unwrap();
        assert_eq!(
            fetch.request(),
            Some(PageRequest {
                since: Some(200),
                until: None
            })
        );

        tracker.reset("feed");
        let newer = tracker.begin("feed", Direction::Newer).unwrap();
        assert_eq!(newer.request(), Some(PageRequest::default()));

        assert_eq!(fetch.complete(&PageResult::new(200, 300, 5)), None);
        assert_eq!(tracker.cursor_for("feed"), None);
        assert!(tracker.is_in_flight("feed"));
        drop(newer);
        assert!(!tracker.is_in_flight("feed"));
    }
}
