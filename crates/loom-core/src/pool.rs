//! Bounded concurrent execution with results re-emitted in submission order.

use async_stream::stream;
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;

/// Holds out-of-order completions until every earlier index has been released.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the completion for `index` and returns the run of items now in order.
    pub fn push(&mut self, index: usize, value: T) -> Vec<(usize, T)> {
        self.pending.insert(index, value);
        let mut ready = Vec::new();
        while let Some(value) = self.pending.remove(&self.next) {
            ready.push((self.next, value));
            self.next += 1;
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Runs `f` over `items` with at most `workers` futures in flight. Outputs are yielded as
/// `(index, output)` in submission order. Dropping the stream stops dispatch and drops
/// in-flight work.
pub fn run_ordered<I, T, F, Fut>(items: Vec<I>, workers: usize, mut f: F) -> impl Stream<Item = (usize, T)>
where
    F: FnMut(usize, I) -> Fut,
    Fut: Future<Output = T>,
{
    let completions = stream::iter(items.into_iter().enumerate())
        .map(move |(index, item)| {
            let fut = f(index, item);
            async move { (index, fut.await) }
        })
        .buffer_unordered(workers.max(1));

    stream! {
        let mut reorder = ReorderBuffer::new();
        futures_util::pin_mut!(completions);
        while let Some((index, output)) = completions.next().await {
            for ready in reorder.push(index, output) {
                yield ready;
            }
        }
    }
}
