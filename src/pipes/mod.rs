//! Lazy, composable processing pipelines.
//!
//! Environments describe their data transformation chains as a source joined
//! with an ordered list of filters. The whole chain is lazy: building it does
//! no work, and nothing upstream executes until the final consumer iterates.
//!
//! - [`Source`] / [`Filter`]: the two trait seams
//! - [`join`] / [`SourceExt::then`]: associative composition
//! - [`Cache`]: a reference-counted memoization point for shared prefixes
//! - [`Identity`], [`Take`], [`Shuffle`], [`Reservoir`]: stock transformations

pub mod cache;
pub mod core;
pub mod filters;

pub use cache::Cache;
pub use core::{join, Deferred, Filter, IterSource, Source, SourceExt, SourceFilter, Stream};
pub use filters::{Identity, Reservoir, Shuffle, Take};
