//! A controllable in-memory [crate::Source] for tests.

use crate::Fetched;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Error returned by [Source] while it is failing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("source unavailable")]
pub struct Unavailable;

#[derive(Default)]
struct State {
    items: Vec<u64>,
    failing: bool,
    counts: usize,
    fetches: Vec<(u64, u64)>,
}

/// An in-memory [crate::Source] whose records can be changed while a cache reads from it.
///
/// Records default to their index. Clones share the same records.
#[derive(Clone, Default)]
pub struct Source {
    state: Arc<Mutex<State>>,
}

impl Source {
    /// Create a [Source] holding records `0..len`.
    pub fn new(len: u64) -> Self {
        let source = Self::default();
        source.resize(len);
        source
    }

    /// Grow or shrink the collection (new records default to their index).
    pub fn resize(&self, len: u64) {
        let mut state = self.state.lock().unwrap();
        let current = state.items.len() as u64;
        if len < current {
            state.items.truncate(len as usize);
        } else {
            state.items.extend(current..len);
        }
    }

    /// Overwrite the record at `index`.
    pub fn update(&self, index: u64, value: u64) {
        self.state.lock().unwrap().items[index as usize] = value;
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn fail(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// The number of calls to `count`.
    pub fn counts(&self) -> usize {
        self.state.lock().unwrap().counts
    }

    /// The `(start, length)` of every call to `fetch`, in order.
    pub fn fetches(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().fetches.clone()
    }
}

impl crate::Source for Source {
    type Item = u64;
    type Error = Unavailable;

    fn count(&self) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.counts += 1;
        if state.failing {
            return Err(Unavailable);
        }
        Ok(state.items.len() as u64)
    }

    fn fetch(&self, start: u64, length: u64) -> Result<Fetched<u64>, Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.fetches.push((start, length));
        if state.failing {
            return Err(Unavailable);
        }
        let count = state.items.len() as u64;
        let start = start.min(count) as usize;
        let end = (start + length as usize).min(count as usize);
        Ok(Fetched {
            items: state.items[start..end].to_vec(),
            count,
        })
    }
}
