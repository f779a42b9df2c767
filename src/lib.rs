//! `spillover` provides spill-to-disk collections, an external sort and sort-order aware set algebra
//! over streams that may not fit into memory.
//!
//! Data is accumulated in memory while small and spilled to a secondary medium (temporary files or
//! temporary tables of a pluggable database backend) once it grows past a threshold. Every backing store
//! is reference counted: it is destroyed as soon as the last collection or cursor over it goes away.
//!
//! # Overview
//!
//! * **Spillable collections:**
//!   [`AccumulatorSelector`] picks an in-memory or spilled accumulator by the expected number of items,
//!   completing an accumulator yields a re-iterable [`Collection`].
//! * **External sort:**
//!   [`ExternalSorter`] sorts batches in memory, spills them and merges them back
//!   (see [External Sorting](https://en.wikipedia.org/wiki/External_sorting)).
//! * **Sorted merge:**
//!   [`merge`] walks sorted inputs once to compute their union, difference or intersection.
//! * **Sort order tags:**
//!   streams carry the [`SortKey`] of their order, already sorted inputs are never sorted twice.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use spillover::{ExternalSorterBuilder, Natural, Operations, Stream};
//!
//! fn main() {
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_spill_threshold(100_000)
//!         .build()
//!         .unwrap();
//!     let ops = Operations::new(sorter);
//!
//!     let first = Stream::from_items(vec![5, 3, 1, 9]);
//!     let second = Stream::from_items(vec![3, 4, 9]);
//!
//!     let common: Vec<i32> = ops
//!         .intersection(first, second, Natural)
//!         .unwrap()
//!         .map(Result::unwrap)
//!         .collect();
//!     assert_eq!(common, vec![3, 9]);
//! }
//! ```

pub mod batching;
pub mod buffer;
pub mod chunk;
pub mod error;
pub mod merger;
pub mod meta;
pub mod ops;
pub mod resource;
pub mod sort;
pub mod storage;
pub mod stream;
pub mod table;

pub use batching::BatchingPolicy;
pub use buffer::{HybridAccumulator, MemoryAccumulator};
pub use chunk::{FileAccumulator, FileSpill};
pub use error::{BoxError, Error, Result};
pub use merger::{merge, Decision, Difference, DifferenceWithIntersection, Intersection, MergeSemantics, Union};
pub use meta::{by_fn, Comparer, FnComparer, Meta, Natural, Reverse, SortKey};
pub use ops::Operations;
pub use resource::{Resource, ResourceTracker, Token};
pub use sort::{ExternalSorter, ExternalSorterBuilder};
pub use storage::{Accumulator, AccumulatorSelector, Collection, Cursor, Item, Medium, SpillFactory};
pub use stream::{Stream, StreamId};
pub use table::{BulkWriter, Table, TableAccumulator, TableBackend, TableSpill};
