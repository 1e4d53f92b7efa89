use futures::{channel::mpsc, Stream};
use std::{
    pin::Pin,
    task::{Context, Poll},
};

/// Holder for the record at a single index.
///
/// A [Slot] is empty while its page is loading. It is filled (and refilled on reload) in
/// place, so the same [Slot] backs an index for as long as its page stays resident.
pub struct Slot<T> {
    index: u64,
    value: Option<T>,

    /// Live (or not yet pruned) subscriptions created by [Slot::observe].
    observers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> Slot<T> {
    pub(crate) fn new(index: u64) -> Self {
        Self {
            index,
            value: None,
            observers: Vec::new(),
        }
    }

    /// The position of this [Slot] in the index space.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The record, if it has been loaded.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Whether the record has not been loaded yet.
    pub fn is_loading(&self) -> bool {
        self.value.is_none()
    }

    /// Whether any [Observer] of this [Slot] is still alive.
    pub fn is_in_use(&self) -> bool {
        self.observers.iter().any(|observer| !observer.is_closed())
    }

    /// Subscribe to every value subsequently stored in this [Slot].
    ///
    /// The [Slot] counts as in use (and its page cannot be evicted) until the returned
    /// [Observer] is dropped.
    pub fn observe(&mut self) -> Observer<T> {
        let (sender, receiver) = mpsc::unbounded();
        self.observers.push(sender);
        Observer {
            index: self.index,
            receiver,
        }
    }

    /// Replace the record and notify observers.
    pub(crate) fn set(&mut self, value: T) {
        self.observers
            .retain(|observer| observer.unbounded_send(value.clone()).is_ok());
        self.value = Some(value);
    }
}

/// A subscription to the values stored in a [Slot].
///
/// The stream yields each value stored after the subscription was created and ends once the
/// [Slot] is dropped (its page was evicted, truncated, or reset).
pub struct Observer<T> {
    index: u64,
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> Observer<T> {
    /// The index of the observed [Slot].
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl<T> Stream for Observer<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
