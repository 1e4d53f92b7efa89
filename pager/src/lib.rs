//! Address a large external record sequence by index through a bounded, paged cache.
//!
//! A [Source] exposes an ordered sequence of records that is too large (or too slow) to
//! hold in memory. The caches in this crate split the index space into fixed-size pages,
//! keep only the pages that were touched recently (or are still observed) resident, fetch
//! missing pages on demand, and prefetch the neighboring page when an access lands close to
//! a page boundary.
//!
//! # Caches
//!
//! - [PageCache] calls the [Source] inline, on the caller.
//! - [AsyncPageCache] runs every [Source] call on a blocking task spawned from the runtime
//!   context it was created with and hands results back through a channel. Results are only
//!   applied when the owner calls [AsyncPageCache::ready] or [AsyncPageCache::drain], so all
//!   cache state is mutated from a single context without any lock.
//!
//! Both caches require `&mut self` for every mutating operation and must not be shared
//! between concurrently running owners.
//!
//! # Pages and Slots
//!
//! Every index is backed by a [Slot]. A [Slot] starts out empty (loading) and is filled when
//! its page's fetch completes. Reloading a page refills its existing [Slot]s in place, so
//! anyone observing a [Slot] (see [Slot::observe]) keeps receiving updates across reloads.
//!
//! # Eviction
//!
//! Each access sweeps the resident pages and evicts those that have not been touched for
//! longer than [Config::page_timeout], except page `0` and pages with an observed [Slot]. The
//! sweep costs `O(resident pages)` per access, which stays small as long as the working set
//! does.
//!
//! # Resets
//!
//! The total count is resolved lazily and remains authoritative until [PageCache::invalidate]
//! is called. Whenever a resolved count (or the count reported alongside a fetch) differs from
//! the previously known count, every page is dropped and [Event::Reset] is emitted to all
//! [PageCache::subscribe]rs.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use pager::{Config, Fetched, PageCache, Source};
//! use std::convert::Infallible;
//!
//! struct Squares(u64);
//!
//! impl Source for Squares {
//!     type Item = u64;
//!     type Error = Infallible;
//!
//!     fn count(&self) -> Result<u64, Self::Error> {
//!         Ok(self.0)
//!     }
//!
//!     fn fetch(&self, start: u64, length: u64) -> Result<Fetched<u64>, Self::Error> {
//!         let end = (start + length).min(self.0);
//!         Ok(Fetched {
//!             items: (start..end).map(|i| i * i).collect(),
//!             count: self.0,
//!         })
//!     }
//! }
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let mut cache = PageCache::new(context, Squares(1_000), Config::default());
//!     let slot = cache.get(12).unwrap();
//!     assert_eq!(slot.index(), 12);
//!     assert_eq!(slot.value(), Some(&144));
//! });
//! ```

use commonware_utils::NZU64;
use std::{num::NonZeroU64, time::Duration};
use thiserror::Error;

mod background;
pub use background::AsyncPageCache;
mod cache;
pub use cache::PageCache;
mod metrics;
mod page;
mod pages;
mod slot;
pub use slot::{Observer, Slot};

#[cfg(test)]
pub mod mocks;

/// The records returned by [Source::fetch].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched<T> {
    /// Up to `length` records starting at `start` (fewer at the tail).
    pub items: Vec<T>,

    /// The total number of records in the [Source] at the time of the fetch.
    pub count: u64,
}

/// An ordered, index-addressable collection of records stored outside of the cache.
///
/// Implementations may be backed by a remote service, a local file, or memory. The count is
/// allowed to change between calls.
pub trait Source: Send + Sync + 'static {
    /// The record type.
    type Item: Clone + Send + 'static;

    /// The error returned when the collection cannot be read.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Return the total number of records.
    fn count(&self) -> Result<u64, Self::Error>;

    /// Return up to `length` records beginning at `start`, along with the current total count.
    fn fetch(&self, start: u64, length: u64) -> Result<Fetched<Self::Item>, Self::Error>;
}

/// Configuration for [PageCache] and [AsyncPageCache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of records per page.
    pub page_size: NonZeroU64,

    /// How long a page may go untouched before it can be evicted.
    pub page_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: NZU64!(100),
            page_timeout: Duration::from_secs(10),
        }
    }
}

/// Notifications emitted by a cache to its subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The total count changed: every page was dropped and any index may now hold a
    /// different record.
    Reset { previous: u64, current: u64 },

    /// [AsyncPageCache::is_loading] changed.
    Loading(bool),

    /// [AsyncPageCache::is_initializing] changed.
    Initializing(bool),
}

/// Errors that can occur when interacting with a cache.
#[derive(Debug, Error)]
pub enum Error<E: std::error::Error + 'static> {
    #[error("source error: {0}")]
    Source(#[source] E),
    #[error("index {index} out of bounds (count: {count})")]
    OutOfBounds { index: u64, count: u64 },
    #[error("count still changing after {0} attempts")]
    Unstable(usize),
}
