use crate::{
    metrics::Metrics,
    pages::{Pages, Request},
    Config, Error, Event, Fetched, Observer, Slot, Source,
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The result of a load, sent from the task that performed it back to the owner.
enum Completion<T, E> {
    Count(Result<u64, E>),
    Page {
        request: Request,
        result: Result<Fetched<T>, E>,
    },
}

/// A paged cache that reads from its [Source] on spawned tasks.
///
/// [AsyncPageCache::get] and [AsyncPageCache::count] never wait on the [Source]: they dispatch
/// any load they need and return immediately (a new page returns loading [Slot]s). Loads
/// send their result back over a channel and nothing is applied until the owner calls
/// [AsyncPageCache::ready] or [AsyncPageCache::drain]. All cache state is therefore only ever
/// mutated by the owner.
///
/// A failed load is reported by the call that applies it. Its page stays resident with empty
/// [Slot]s until evicted.
pub struct AsyncPageCache<E: Clock + Spawner + RuntimeMetrics, S: Source> {
    context: E,
    source: Arc<S>,
    pages: Pages<S::Item>,

    sender: mpsc::UnboundedSender<Completion<S::Item, S::Error>>,
    receiver: mpsc::UnboundedReceiver<Completion<S::Item, S::Error>>,

    /// Loads dispatched but not yet applied.
    pending: usize,

    /// Whether a count load is in flight.
    counting: bool,

    /// Whether the in-flight count load is the first one.
    initializing: bool,
}

impl<E: Clock + Spawner + RuntimeMetrics, S: Source> AsyncPageCache<E, S> {
    /// Create an empty cache over `source`.
    ///
    /// Loads are spawned from `context`.
    pub fn new(context: E, source: S, cfg: Config) -> Self {
        let metrics = Metrics::init(context.clone());
        let (sender, receiver) = mpsc::unbounded();
        Self {
            pages: Pages::new(&cfg, metrics),
            context,
            source: Arc::new(source),
            sender,
            receiver,
            pending: 0,
            counting: false,
            initializing: false,
        }
    }

    /// The number of records per page.
    pub fn page_size(&self) -> u64 {
        self.pages.page_size()
    }

    /// Whether any load has been dispatched and not yet applied.
    pub fn is_loading(&self) -> bool {
        self.pending > 0
    }

    /// Whether the first count load is in flight.
    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    /// The total number of records.
    ///
    /// If the count is unresolved, a count load is dispatched (unless one is already in
    /// flight) and the last known count (or `0`) is returned.
    pub fn count(&mut self) -> u64 {
        if let Some(count) = self.pages.count() {
            return count;
        }
        if !self.counting {
            self.load_count();
        }
        self.pages.known().unwrap_or(0)
    }

    /// Forget the resolved count so that the next access resolves it again.
    pub fn invalidate(&mut self) {
        self.pages.invalidate();
    }

    /// Return the [Slot] for `index`, dispatching loads for its page (and possibly a neighbor)
    /// if needed.
    pub fn get(&mut self, index: u64) -> Result<&Slot<S::Item>, Error<S::Error>> {
        let count = self.access(index)?;
        self.pages
            .slot(index)
            .ok_or(Error::OutOfBounds { index, count })
    }

    /// Access `index` (like [AsyncPageCache::get]) and subscribe to its [Slot].
    pub fn observe(&mut self, index: u64) -> Result<Observer<S::Item>, Error<S::Error>> {
        let count = self.access(index)?;
        self.pages
            .slot_mut(index)
            .map(Slot::observe)
            .ok_or(Error::OutOfBounds { index, count })
    }

    /// Dispatch a load that refills a resident page in place.
    ///
    /// Returns whether the page was resident.
    pub fn refresh(&mut self, page: u64) -> bool {
        let Some(request) = self.pages.refresh(page, self.context.current()) else {
            return false;
        };
        self.load_page(request);
        true
    }

    /// Subscribe to [Event]s.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.pages.subscribe()
    }

    /// The indices of all resident pages, in ascending order.
    pub fn resident(&self) -> Vec<u64> {
        self.pages.resident()
    }

    /// Wait for the next load to complete and apply it.
    ///
    /// Returns immediately if nothing is loading.
    pub async fn ready(&mut self) -> Result<(), Error<S::Error>> {
        if self.pending == 0 {
            return Ok(());
        }

        // The cache holds a sender, so the channel never closes
        let Some(completion) = self.receiver.next().await else {
            return Ok(());
        };
        self.apply(completion)
    }

    /// Apply every load that has already completed without waiting for more.
    ///
    /// All delivered completions are applied even if some of them failed; the first failure is
    /// returned. Otherwise, returns the number of completions applied.
    pub fn drain(&mut self) -> Result<usize, Error<S::Error>> {
        let mut applied = 0;
        let mut failure = None;
        while let Ok(Some(completion)) = self.receiver.try_next() {
            applied += 1;
            if let Err(err) = self.apply(completion) {
                failure.get_or_insert(err);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    }

    fn access(&mut self, index: u64) -> Result<u64, Error<S::Error>> {
        let count = self.count();
        if index >= count {
            return Err(Error::OutOfBounds { index, count });
        }
        let requests = self.pages.access(index, count, self.context.current());
        for request in requests {
            self.load_page(request);
        }
        Ok(count)
    }

    fn load_count(&mut self) {
        self.counting = true;
        if self.pages.known().is_none() {
            self.initializing = true;
            self.pages.emit(Event::Initializing(true));
        }
        self.dispatched();

        debug!("loading count");
        let source = self.source.clone();
        let sender = self.sender.clone();
        self.context
            .with_label("count")
            .spawn_blocking(false, move |_| {
                let result = source.count();
                let _ = sender.unbounded_send(Completion::Count(result));
            });
    }

    fn load_page(&mut self, request: Request) {
        self.dispatched();

        debug!(
            page = request.page,
            start = request.start,
            length = request.length,
            "loading page"
        );
        let source = self.source.clone();
        let sender = self.sender.clone();
        self.context
            .with_label("fetch")
            .spawn_blocking(false, move |_| {
                let result = source.fetch(request.start, request.length);
                let _ = sender.unbounded_send(Completion::Page { request, result });
            });
    }

    fn apply(&mut self, completion: Completion<S::Item, S::Error>) -> Result<(), Error<S::Error>> {
        let result = self.reconcile(completion);
        self.applied();
        result
    }

    fn reconcile(
        &mut self,
        completion: Completion<S::Item, S::Error>,
    ) -> Result<(), Error<S::Error>> {
        match completion {
            Completion::Count(result) => {
                self.counting = false;
                let result = match result {
                    Ok(count) => {
                        debug!(count, "resolved count");
                        self.pages.resolve(count);
                        Ok(())
                    }
                    Err(err) => {
                        warn!(?err, "count failed");
                        self.pages.metrics().failures.inc();
                        Err(Error::Source(err))
                    }
                };
                if self.initializing {
                    self.initializing = false;
                    self.pages.emit(Event::Initializing(false));
                }
                result
            }
            Completion::Page { request, result } => match result {
                Ok(fetched) => {
                    if self.pages.complete(&request, fetched) {
                        trace!(page = request.page, "applied page");
                    }
                    Ok(())
                }
                Err(err) => {
                    warn!(?err, page = request.page, "fetch failed");
                    self.pages.metrics().failures.inc();
                    Err(Error::Source(err))
                }
            },
        }
    }

    fn dispatched(&mut self) {
        self.pending += 1;
        self.pages.metrics().in_flight.inc();
        if self.pending == 1 {
            self.pages.emit(Event::Loading(true));
        }
    }

    fn applied(&mut self) {
        self.pending -= 1;
        self.pages.metrics().in_flight.dec();
        if self.pending == 0 {
            self.pages.emit(Event::Loading(false));
        }
    }
}
