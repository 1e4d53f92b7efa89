use crate::{
    metrics::Metrics,
    pages::{Pages, Request},
    Config, Error, Event, Observer, Slot, Source,
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics};
use futures::channel::mpsc;
use tracing::{debug, warn};

/// Number of times an access is attempted while the count keeps changing underneath it.
const MAX_ATTEMPTS: usize = 4;

/// A paged cache that reads from its [Source] inline, on the caller.
///
/// Every method that may touch the [Source] returns its error. A page whose fetch failed stays
/// resident with empty [Slot]s until it is evicted; it is not fetched again on the next
/// access.
pub struct PageCache<E: Clock + RuntimeMetrics, S: Source> {
    context: E,
    source: S,
    pages: Pages<S::Item>,
}

impl<E: Clock + RuntimeMetrics, S: Source> PageCache<E, S> {
    /// Create an empty cache over `source`.
    pub fn new(context: E, source: S, cfg: Config) -> Self {
        let metrics = Metrics::init(context.clone());
        Self {
            pages: Pages::new(&cfg, metrics),
            context,
            source,
        }
    }

    /// The number of records per page.
    pub fn page_size(&self) -> u64 {
        self.pages.page_size()
    }

    /// The total number of records, resolving it from the [Source] if unknown.
    pub fn count(&mut self) -> Result<u64, Error<S::Error>> {
        if let Some(count) = self.pages.count() {
            return Ok(count);
        }
        let count = match self.source.count() {
            Ok(count) => count,
            Err(err) => {
                warn!(?err, "count failed");
                self.pages.metrics().failures.inc();
                return Err(Error::Source(err));
            }
        };
        debug!(count, "resolved count");
        self.pages.resolve(count);
        Ok(count)
    }

    /// Forget the resolved count so that the next access resolves it again.
    ///
    /// If the new count differs, every page is dropped and [Event::Reset] is emitted.
    pub fn invalidate(&mut self) {
        self.pages.invalidate();
    }

    /// Return the [Slot] for `index`, fetching its page (and possibly a neighbor) if needed.
    pub fn get(&mut self, index: u64) -> Result<&Slot<S::Item>, Error<S::Error>> {
        let count = self.access(index)?;
        self.pages
            .slot(index)
            .ok_or(Error::OutOfBounds { index, count })
    }

    /// Access `index` (like [PageCache::get]) and subscribe to its [Slot].
    pub fn observe(&mut self, index: u64) -> Result<Observer<S::Item>, Error<S::Error>> {
        let count = self.access(index)?;
        self.pages
            .slot_mut(index)
            .map(Slot::observe)
            .ok_or(Error::OutOfBounds { index, count })
    }

    /// Fetch a resident page again and store the result in its existing [Slot]s.
    ///
    /// Returns whether the page was resident (and is still resident after the fetch).
    pub fn refresh(&mut self, page: u64) -> Result<bool, Error<S::Error>> {
        let Some(request) = self.pages.refresh(page, self.context.current()) else {
            return Ok(false);
        };
        self.load(request)
    }

    /// Subscribe to [Event]s.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.pages.subscribe()
    }

    /// The indices of all resident pages, in ascending order.
    pub fn resident(&self) -> Vec<u64> {
        self.pages.resident()
    }

    /// Run the access algorithm for `index` until its slot is resident, returning the count
    /// it was resolved against.
    ///
    /// A fetch may report a new count, which resets the cache (dropping the page just
    /// created). When that happens the access starts over against the new count.
    fn access(&mut self, index: u64) -> Result<u64, Error<S::Error>> {
        for _ in 0..MAX_ATTEMPTS {
            let count = self.count()?;
            if index >= count {
                return Err(Error::OutOfBounds { index, count });
            }
            let epoch = self.pages.epoch();
            let requests = self.pages.access(index, count, self.context.current());

            // Every created page must see its fetch attempted, even after an earlier failure
            let mut failure = None;
            for request in requests {
                if let Err(err) = self.load(request) {
                    failure.get_or_insert(err);
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
            if self.pages.slot(index).is_some() {
                return Ok(count);
            }
            if self.pages.epoch() == epoch {
                // The source returned fewer records than it reported
                return Err(Error::OutOfBounds { index, count });
            }
            debug!(index, "count changed during access: restarting");
        }
        Err(Error::Unstable(MAX_ATTEMPTS))
    }

    /// Fetch `request` and apply it. Returns whether the records were stored.
    fn load(&mut self, request: Request) -> Result<bool, Error<S::Error>> {
        if !self.pages.is_live(&request) {
            // Dropped by a reset earlier in the same access
            return Ok(false);
        }
        debug!(
            page = request.page,
            start = request.start,
            length = request.length,
            "fetching page"
        );
        let fetched = match self.source.fetch(request.start, request.length) {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(?err, page = request.page, "fetch failed");
                self.pages.metrics().failures.inc();
                return Err(Error::Source(err));
            }
        };
        Ok(self.pages.complete(&request, fetched))
    }
}
