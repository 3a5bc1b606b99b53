//! Core source/filter abstractions for lazy processing pipelines.
//!
//! A [`Source`] produces an iterable of records and a [`Filter`] transforms
//! one iterable into another. Composition via [`join`] (or [`SourceExt::then`])
//! yields a new `Source` whose `read()` lazily chains the calls: no filter
//! executes until the final consumer begins iterating.
//!
//! Joining is associative: `join(join(s, f1), f2)` reads the same stream as
//! `join(s, f1).then(f2)` built in any other grouping.

use std::sync::Arc;

/// A boxed, lazily-evaluated stream of items.
///
/// `Send` is required so streams can be driven inside worker tasks.
pub type Stream<T> = Box<dyn Iterator<Item = T> + Send>;

/// Produces an iterable of records.
///
/// `read` may be called any number of times; each call returns a fresh
/// traversal of the underlying data.
pub trait Source<T>: Send + Sync {
    fn read(&self) -> Stream<T>;
}

/// A pure transformation from one stream to another.
///
/// Filters must be referentially transparent (same input stream produces the
/// same output stream) since [`Cache`](super::Cache) assumes it can replay a
/// materialized upstream in place of re-running the filter chain.
pub trait Filter<T, U>: Send + Sync {
    fn filter(&self, items: Stream<T>) -> Stream<U>;
}

impl<T, S: Source<T> + ?Sized> Source<T> for Arc<S> {
    fn read(&self) -> Stream<T> {
        (**self).read()
    }
}

/// A source backed by an in-memory vector.
///
/// Each `read()` clones the items, so the source can be traversed repeatedly.
pub struct IterSource<T> {
    items: Vec<T>,
}

impl<T> IterSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T: Clone + Send + Sync + 'static> Source<T> for IterSource<T> {
    fn read(&self) -> Stream<T> {
        Box::new(self.items.clone().into_iter())
    }
}

/// The composition of a source with a single filter.
///
/// `read()` is lazy: the upstream source is not read and the filter is not
/// applied until the returned stream is iterated. Because `SourceFilter`
/// itself implements [`Source`], chains of any length can be built by
/// repeated joining, and the grouping of joins does not matter.
pub struct SourceFilter<T, U> {
    source: Arc<dyn Source<T>>,
    filter: Arc<dyn Filter<T, U>>,
}

impl<T: 'static, U: 'static> SourceFilter<T, U> {
    pub fn new(source: Arc<dyn Source<T>>, filter: Arc<dyn Filter<T, U>>) -> Self {
        Self { source, filter }
    }
}

impl<T: 'static, U: 'static> Source<U> for SourceFilter<T, U> {
    fn read(&self) -> Stream<U> {
        let source = Arc::clone(&self.source);
        let filter = Arc::clone(&self.filter);
        // Defer the whole chain, and hand the filter a stream that itself
        // defers `source.read()`. A filter that can answer from its own
        // state (a populated cache) then never touches the source at all.
        Box::new(Deferred::new(move || {
            let upstream: Stream<T> = Box::new(Deferred::new(move || source.read()));
            filter.filter(upstream)
        }))
    }
}

/// Joins a source and a filter into a new lazy source.
pub fn join<T: 'static, U: 'static>(
    source: impl Source<T> + 'static,
    filter: impl Filter<T, U> + 'static,
) -> SourceFilter<T, U> {
    SourceFilter::new(Arc::new(source), Arc::new(filter))
}

/// Fluent chaining for sources: `source.then(f1).then(f2)`.
pub trait SourceExt<T: 'static>: Source<T> + Sized + 'static {
    fn then<U: 'static>(self, filter: impl Filter<T, U> + 'static) -> SourceFilter<T, U> {
        join(self, filter)
    }
}

impl<T: 'static, S: Source<T> + Sized + 'static> SourceExt<T> for S {}

/// An iterator that builds its inner stream on the first `next()` call.
///
/// Used by filters whose construction would otherwise have to consume the
/// upstream eagerly (shuffle, cache replay).
pub struct Deferred<T, F> {
    make: Option<F>,
    inner: Option<Stream<T>>,
}

impl<T, F: FnOnce() -> Stream<T>> Deferred<T, F> {
    pub fn new(make: F) -> Self {
        Self {
            make: Some(make),
            inner: None,
        }
    }
}

impl<T, F: FnOnce() -> Stream<T> + Send> Iterator for Deferred<T, F> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.inner.is_none() {
            let make = self.make.take()?;
            self.inner = Some(make());
        }
        self.inner.as_mut().and_then(|it| it.next())
    }
}
