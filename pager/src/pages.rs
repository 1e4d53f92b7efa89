use crate::{metrics::Metrics, page::Page, Config, Event, Fetched, Slot};
use futures::channel::mpsc;
use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};
use tracing::{debug, trace};

/// A fetch required to fill a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Request {
    /// The page to fill.
    pub page: u64,
    /// The id of the page object that issued the request.
    pub id: u64,
    /// The first index to fetch.
    pub start: u64,
    /// The number of records to fetch.
    pub length: u64,
}

/// The state shared by [crate::PageCache] and [crate::AsyncPageCache]: resident pages, the
/// total count, and the access algorithm.
///
/// [Pages] never performs I/O. Accesses return the [Request]s that must be fetched and
/// fetched records are handed back through [Pages::complete].
pub(crate) struct Pages<T> {
    page_size: u64,
    page_timeout: Duration,

    pages: BTreeMap<u64, Page<T>>,
    next_id: u64,

    /// The authoritative count (if resolved and not invalidated).
    count: Option<u64>,

    /// The last resolved count (survives invalidation).
    known: Option<u64>,

    /// Incremented on every reset.
    epoch: u64,

    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    metrics: Metrics,
}

impl<T: Clone> Pages<T> {
    pub fn new(cfg: &Config, metrics: Metrics) -> Self {
        Self {
            page_size: cfg.page_size.get(),
            page_timeout: cfg.page_timeout,
            pages: BTreeMap::new(),
            next_id: 0,
            count: None,
            known: None,
            epoch: 0,
            subscribers: Vec::new(),
            metrics,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Convert an index into its page and the offset within that page.
    pub fn locate(&self, index: u64) -> (u64, usize) {
        (index / self.page_size, (index % self.page_size) as usize)
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn known(&self) -> Option<u64> {
        self.known
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn invalidate(&mut self) {
        self.count = None;
    }

    /// Record a freshly observed total count.
    ///
    /// If it differs from the last known count, all pages are dropped and [Event::Reset] is
    /// emitted. Returns whether a reset occurred.
    pub fn resolve(&mut self, count: u64) -> bool {
        self.count = Some(count);
        let Some(previous) = self.known.replace(count) else {
            return false;
        };
        if previous == count {
            return false;
        }
        debug!(previous, current = count, "count changed: resetting");
        self.pages.clear();
        self.epoch += 1;
        self.metrics.resets.inc();
        self.metrics.resident.set(0);
        self.emit(Event::Reset {
            previous,
            current: count,
        });
        true
    }

    /// Access `index`: request its page, request the neighbor page closest to `index` (if any),
    /// and sweep idle pages.
    ///
    /// Returns the fetches required for any page created by this access.
    pub fn access(&mut self, index: u64, count: u64, now: SystemTime) -> Vec<Request> {
        let (page, offset) = self.locate(index);
        let offset = offset as u64;
        let half = self.page_size / 2;

        let mut requests = Vec::new();
        requests.extend(self.request(page, count, now));
        let next = (page + 1).saturating_mul(self.page_size);
        if offset > half && next < count {
            if let Some(request) = self.request(page + 1, count, now) {
                self.metrics.prefetches.inc();
                requests.push(request);
            }
        }
        if offset < half && page > 0 {
            if let Some(request) = self.request(page - 1, count, now) {
                self.metrics.prefetches.inc();
                requests.push(request);
            }
        }
        self.clean_up(now);
        requests
    }

    /// Touch `page` if it is resident, otherwise create it and return the fetch that fills it.
    pub fn request(&mut self, page: u64, count: u64, now: SystemTime) -> Option<Request> {
        if let Some(resident) = self.pages.get_mut(&page) {
            resident.touch(now);
            self.metrics.hits.inc();
            return None;
        }

        let start = page * self.page_size;
        let length = self.page_size.min(count.saturating_sub(start));
        let id = self.next_id;
        self.next_id += 1;
        self.pages
            .insert(page, Page::new(id, start, length as usize, now));
        self.metrics.misses.inc();
        self.metrics.resident.set(self.pages.len() as i64);
        trace!(page, start, length, "created page");
        Some(Request {
            page,
            id,
            start,
            length,
        })
    }

    /// Evict every page (other than page `0`) that has been idle for longer than the page
    /// timeout and has no observed slot. Returns the number of pages evicted.
    pub fn clean_up(&mut self, now: SystemTime) -> usize {
        let timeout = self.page_timeout;
        let before = self.pages.len();
        self.pages.retain(|&page, resident| {
            page == 0 || resident.idle(now) <= timeout || resident.is_in_use()
        });
        let evicted = before - self.pages.len();
        if evicted > 0 {
            debug!(evicted, resident = self.pages.len(), "evicted idle pages");
            self.metrics.evictions.inc_by(evicted as u64);
            self.metrics.resident.set(self.pages.len() as i64);
        }
        evicted
    }

    /// Return the fetch that reloads a resident page in place (touching it).
    pub fn refresh(&mut self, page: u64, now: SystemTime) -> Option<Request> {
        let count = self.count;
        let page_size = self.page_size;
        let resident = self.pages.get_mut(&page)?;
        resident.touch(now);
        let start = page * page_size;
        let length = match count {
            Some(count) => page_size.min(count.saturating_sub(start)),
            None => resident.len() as u64,
        };
        Some(Request {
            page,
            id: resident.id(),
            start,
            length,
        })
    }

    /// Whether the page object that issued `request` is still resident.
    pub fn is_live(&self, request: &Request) -> bool {
        self.pages
            .get(&request.page)
            .is_some_and(|page| page.id() == request.id)
    }

    /// Apply the result of a fetch.
    ///
    /// A completion for an evicted (or reset) page object is dropped without touching the
    /// cache: its count may predate the current one and it never re-creates the page.
    /// Otherwise the reported count is reconciled (which may reset the cache, dropping the
    /// page) and the records are stored in the page. Returns whether the records were stored.
    pub fn complete(&mut self, request: &Request, fetched: Fetched<T>) -> bool {
        if !self.is_live(request) {
            trace!(page = request.page, id = request.id, "dropping stale completion");
            self.metrics.stale.inc();
            return false;
        }
        if self.resolve(fetched.count) {
            return false;
        }
        let Some(page) = self.pages.get_mut(&request.page) else {
            return false;
        };
        page.populate(fetched.items);
        true
    }

    pub fn slot(&self, index: u64) -> Option<&Slot<T>> {
        let (page, offset) = self.locate(index);
        self.pages.get(&page)?.slot(offset)
    }

    pub fn slot_mut(&mut self, index: u64) -> Option<&mut Slot<T>> {
        let (page, offset) = self.locate(index);
        self.pages.get_mut(&page)?.slot_mut(offset)
    }

    /// The indices of all resident pages, in ascending order.
    pub fn resident(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Send `event` to every subscriber, dropping those that went away.
    pub fn emit(&mut self, event: Event) {
        self.subscribers
            .retain(|subscriber| subscriber.unbounded_send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn pages(page_size: u64) -> Pages<u64> {
        let cfg = Config {
            page_size: NonZeroU64::new(page_size).unwrap(),
            page_timeout: TIMEOUT,
        };
        Pages::new(&cfg, Metrics::default())
    }

    fn at(millis: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }

    fn fill(request: &Request, count: u64) -> Fetched<u64> {
        let end = (request.start + request.length).min(count);
        Fetched {
            items: (request.start..end).collect(),
            count,
        }
    }

    #[test]
    fn test_access_scenario() {
        let mut pages = pages(10);

        // Index 0 creates page 0 only
        let requests = pages.access(0, 25, at(0));
        assert_eq!(
            requests,
            vec![Request {
                page: 0,
                id: 0,
                start: 0,
                length: 10
            }]
        );

        // Index 24 creates the short final page (and its lower neighbor)
        let requests = pages.access(24, 25, at(1));
        assert_eq!(requests[0].page, 2);
        assert_eq!((requests[0].start, requests[0].length), (20, 5));
        assert_eq!(requests[1].page, 1);
        let slots: Vec<u64> = (20..25).map(|i| pages.slot(i).unwrap().index()).collect();
        assert_eq!(slots, vec![20, 21, 22, 23, 24]);
        assert!(pages.slot(25).is_none());

        // Index 9 requests page 1 as well (already resident, so only touched)
        assert!(pages.access(9, 25, at(2)).is_empty());
        assert_eq!(pages.resident(), vec![0, 1, 2]);
        assert_eq!(pages.metrics().hits.get(), 2);
    }

    #[test]
    fn test_access_prefetch_forward() {
        let mut pages = pages(10);
        let requests = pages.access(9, 20, at(0));
        let created: Vec<u64> = requests.iter().map(|request| request.page).collect();
        assert_eq!(created, vec![0, 1]);
        assert_eq!(pages.metrics().prefetches.get(), 1);
    }

    #[test]
    fn test_access_prefetch_forward_past_end() {
        let mut pages = pages(10);
        let requests = pages.access(9, 10, at(0));
        assert_eq!(requests.len(), 1);
        assert_eq!(pages.resident(), vec![0]);
    }

    #[test]
    fn test_access_prefetch_backward() {
        let mut pages = pages(10);
        let requests = pages.access(1, 100, at(0));
        assert_eq!(requests.len(), 1);
        assert_eq!(pages.resident(), vec![0]);

        let requests = pages.access(31, 100, at(0));
        let created: Vec<u64> = requests.iter().map(|request| request.page).collect();
        assert_eq!(created, vec![3, 2]);
    }

    #[test]
    fn test_access_middle_of_page_no_prefetch() {
        let mut pages = pages(10);
        let requests = pages.access(15, 100, at(0));
        assert_eq!(requests.len(), 1);
        assert_eq!(pages.resident(), vec![1]);
    }

    #[test]
    fn test_clean_up_evicts_idle() {
        let mut pages = pages(10);
        pages.access(15, 100, at(0));
        pages.access(0, 100, at(0));
        pages.access(55, 100, at(400));

        // Page 1 is past the timeout, page 5 is not, page 0 is exempt
        pages.access(0, 100, at(501));
        assert_eq!(pages.resident(), vec![0, 5]);
        assert_eq!(pages.metrics().evictions.get(), 1);

        // Exactly at the timeout is not idle enough
        pages.access(0, 100, at(900));
        assert_eq!(pages.resident(), vec![0, 5]);
        pages.access(0, 100, at(901));
        assert_eq!(pages.resident(), vec![0]);
    }

    #[test]
    fn test_clean_up_keeps_page_zero() {
        let mut pages = pages(10);
        pages.access(0, 100, at(0));
        assert_eq!(pages.clean_up(at(1_000_000)), 0);
        assert_eq!(pages.resident(), vec![0]);
    }

    #[test]
    fn test_clean_up_keeps_observed() {
        let mut pages = pages(10);
        pages.access(15, 100, at(0));
        let observer = pages.slot_mut(12).unwrap().observe();
        assert_eq!(pages.clean_up(at(10_000)), 0);
        drop(observer);
        assert_eq!(pages.clean_up(at(10_000)), 1);
        assert!(pages.resident().is_empty());
    }

    #[test]
    fn test_hit_refreshes_touch() {
        let mut pages = pages(10);
        pages.access(15, 100, at(0));
        pages.access(15, 100, at(400));
        pages.access(0, 100, at(800));
        assert_eq!(pages.resident(), vec![0, 1]);
    }

    #[test]
    fn test_resolve_resets_on_change() {
        let mut pages = pages(10);
        let mut events = pages.subscribe();

        assert!(!pages.resolve(25));
        pages.access(0, 25, at(0));
        pages.access(15, 25, at(0));
        assert!(!pages.resolve(25));
        assert_eq!(pages.resident(), vec![0, 1]);
        assert!(events.try_next().is_err());

        pages.invalidate();
        assert_eq!(pages.count(), None);
        assert_eq!(pages.known(), Some(25));
        assert!(pages.resolve(30));
        assert!(pages.resident().is_empty());
        assert_eq!(pages.epoch(), 1);
        assert_eq!(
            events.try_next().unwrap(),
            Some(Event::Reset {
                previous: 25,
                current: 30
            })
        );
        assert!(events.try_next().is_err());
    }

    #[test]
    fn test_complete_populates() {
        let mut pages = pages(10);
        pages.resolve(25);
        let requests = pages.access(24, 25, at(0));
        for request in &requests {
            assert!(pages.complete(request, fill(request, 25)));
        }
        for index in 10..25 {
            assert_eq!(pages.slot(index).unwrap().value(), Some(&index));
        }
    }

    #[test]
    fn test_complete_stale_never_reinserts() {
        let mut pages = pages(10);
        pages.resolve(100);
        let stale = pages.access(15, 100, at(0)).remove(0);

        // Evict the page while its fetch is in flight
        pages.access(0, 100, at(1_000));
        assert_eq!(pages.resident(), vec![0]);
        assert!(!pages.is_live(&stale));
        assert!(!pages.complete(&stale, fill(&stale, 100)));
        assert_eq!(pages.resident(), vec![0]);

        // A new page object for the same index ignores the old completion
        let fresh = pages.access(15, 100, at(1_001)).remove(0);
        assert_ne!(fresh.id, stale.id);
        assert!(!pages.complete(&stale, fill(&stale, 100)));
        assert!(pages.slot(15).unwrap().is_loading());
        assert!(pages.complete(&fresh, fill(&fresh, 100)));
        assert_eq!(pages.slot(15).unwrap().value(), Some(&15));
        assert_eq!(pages.metrics().stale.get(), 2);
    }

    #[test]
    fn test_complete_count_change_resets() {
        let mut pages = pages(10);
        let mut events = pages.subscribe();
        pages.resolve(25);
        let request = pages.access(0, 25, at(0)).remove(0);
        assert!(!pages.complete(&request, fill(&request, 40)));
        assert!(pages.resident().is_empty());
        assert_eq!(pages.count(), Some(40));
        assert_eq!(
            events.try_next().unwrap(),
            Some(Event::Reset {
                previous: 25,
                current: 40
            })
        );
    }

    #[test]
    fn test_complete_stale_keeps_count() {
        let mut pages = pages(10);
        let mut events = pages.subscribe();
        pages.resolve(25);
        let old = pages.access(15, 25, at(0)).remove(0);

        // The count changes while the old fetch is in flight
        pages.invalidate();
        assert!(pages.resolve(30));
        let fresh = pages.access(15, 30, at(1)).remove(0);

        // The old completion reports the old count but is dropped before reconciling it
        assert!(!pages.complete(&old, fill(&old, 25)));
        assert!(pages.is_live(&fresh));
        assert_eq!(pages.resident(), vec![1]);
        assert_eq!(pages.count(), Some(30));
        assert_eq!(pages.known(), Some(30));
        assert_eq!(pages.metrics().resets.get(), 1);
        assert_eq!(pages.metrics().stale.get(), 1);
        assert_eq!(
            events.try_next().unwrap(),
            Some(Event::Reset {
                previous: 25,
                current: 30
            })
        );
        assert!(events.try_next().is_err());

        // The fresh completion still lands
        assert!(pages.complete(&fresh, fill(&fresh, 30)));
        assert_eq!(pages.slot(15).unwrap().value(), Some(&15));
    }

    #[test]
    fn test_prefetch_at_end_of_index_space() {
        // The page after the last one would start beyond u64::MAX
        let mut pages = pages(8);
        let requests = pages.access(u64::MAX - 1, u64::MAX, at(0));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].page, u64::MAX / 8);
        assert_eq!(requests[0].length, 7);
        assert_eq!(pages.metrics().prefetches.get(), 0);
        assert_eq!(pages.slot(u64::MAX - 1).unwrap().index(), u64::MAX - 1);
    }

    #[test]
    fn test_refresh_reuses_page() {
        let mut pages = pages(10);
        pages.resolve(25);
        let created = pages.access(24, 25, at(0)).remove(0);
        let refreshed = pages.refresh(2, at(10)).unwrap();
        assert_eq!(created, refreshed);
        assert!(pages.refresh(7, at(10)).is_none());
        assert!(pages.refresh(u64::MAX, at(10)).is_none());
    }
}
