//! Sorted k-way merge.
//!
//! Live inputs are kept in an ordered worklist keyed by their current head item, the minimum always
//! first. Re-inserting an advanced input uses binary search, so advancing costs *log(k)* comparisons
//! where *k* is the number of inputs. What happens to the inputs sharing the minimum (a tie) is
//! decided by a [`MergeSemantics`] strategy.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use log;

use crate::error::{Error, Result};
use crate::meta::{Comparer, Meta};
use crate::storage::{Accumulator, AccumulatorSelector, Cursor, Item};
use crate::stream::Stream;

/// Action taken on a tie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Emit the first tied item only, the other tied inputs keep their heads.
    EmitEach,
    /// Emit the tied value once and advance every tied input.
    EmitOnce,
    /// Advance every tied input without emitting.
    Discard,
    /// Advance every tied input and keep the value aside, emitted after all the other output.
    Divert,
    /// Stop merging.
    Finish,
}

/// Stateless strategy defining the output of a k-way merge.
pub trait MergeSemantics: fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    /// Exact number of inputs the semantics is defined for.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// Whether adjacent duplicates of every input are collapsed before merging.
    fn collapse_duplicates(&self) -> bool;

    /// Whether the output keeps the merge ordering.
    fn preserves_order(&self) -> bool {
        false
    }

    /// Decides what to do with a tie.
    ///
    /// # Arguments
    /// * `tied` - Number of inputs sharing the minimal value
    /// * `live` - Number of inputs not exhausted yet
    /// * `total` - Number of inputs of the merge
    fn decide(&self, tied: usize, live: usize, total: usize) -> Decision;
}

/// Order-preserving union, duplicates are retained.
#[derive(Clone, Copy, Debug, Default)]
pub struct Union;

impl MergeSemantics for Union {
    fn name(&self) -> &'static str {
        "union"
    }

    fn collapse_duplicates(&self) -> bool {
        false
    }

    fn preserves_order(&self) -> bool {
        true
    }

    fn decide(&self, _tied: usize, _live: usize, _total: usize) -> Decision {
        Decision::EmitEach
    }
}

/// Values held by exactly one input.
#[derive(Clone, Copy, Debug, Default)]
pub struct Difference;

impl MergeSemantics for Difference {
    fn name(&self) -> &'static str {
        "difference"
    }

    fn collapse_duplicates(&self) -> bool {
        true
    }

    fn decide(&self, tied: usize, _live: usize, _total: usize) -> Decision {
        if tied == 1 {
            Decision::EmitOnce
        } else {
            Decision::Discard
        }
    }
}

/// Values held by every input.
#[derive(Clone, Copy, Debug, Default)]
pub struct Intersection;

impl MergeSemantics for Intersection {
    fn name(&self) -> &'static str {
        "intersection"
    }

    fn collapse_duplicates(&self) -> bool {
        true
    }

    fn decide(&self, tied: usize, live: usize, total: usize) -> Decision {
        if live < total {
            // an exhausted input holds nothing more
            Decision::Finish
        } else if tied == total {
            Decision::EmitOnce
        } else {
            Decision::Discard
        }
    }
}

/// Difference of two inputs followed by their intersection.
#[derive(Clone, Copy, Debug, Default)]
pub struct DifferenceWithIntersection;

impl MergeSemantics for DifferenceWithIntersection {
    fn name(&self) -> &'static str {
        "difference with intersection"
    }

    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn collapse_duplicates(&self) -> bool {
        true
    }

    fn decide(&self, tied: usize, _live: usize, _total: usize) -> Decision {
        if tied == 1 {
            Decision::EmitOnce
        } else {
            Decision::Divert
        }
    }
}

/// Merges sorted streams under the given semantics.
///
/// Every input must carry the sort key of `comparer`. Otherwise the merge fails before consuming any
/// item and every input is disposed.
///
/// # Arguments
/// * `inputs` - Streams to be merged
/// * `comparer` - Ordering of every input
/// * `semantics` - Tie handling
/// * `selector` - Accumulator source for the items diverted aside
pub fn merge<T, C, S>(
    inputs: Vec<Stream<T>>,
    comparer: C,
    semantics: S,
    selector: &AccumulatorSelector<T>,
) -> Result<Stream<T>>
where
    T: Item,
    C: Comparer<T>,
    S: MergeSemantics,
{
    if let Some(expected) = semantics.arity() {
        if inputs.len() != expected {
            return Err(Error::InvalidArity {
                semantics: semantics.name(),
                expected,
                found: inputs.len(),
            });
        }
    }

    let sort_key = comparer.sort_key();
    if let Some(input) = inputs.iter().find(|input| input.sort_key() != Some(&sort_key)) {
        return Err(Error::NotSorted {
            expected: sort_key.to_string(),
            found: input.sort_key().map(|key| key.to_string()),
        });
    }

    let meta = if semantics.preserves_order() {
        Meta {
            count: inputs
                .iter()
                .map(|input| input.known_count())
                .sum::<Option<usize>>(),
            sort_key: Some(sort_key),
        }
    } else {
        Meta::default()
    };

    log::debug!("merging {} inputs ({})", inputs.len(), semantics.name());
    let merger = SortedMerger::new(inputs, comparer, semantics, selector.clone());
    return Ok(Stream::new(merger, meta));
}

struct Head<T> {
    item: T,
    input: usize,
}

/// K-way merge iterator, see [`merge`].
pub struct SortedMerger<T, C, S> {
    inputs: Vec<Option<Stream<T>>>,
    worklist: VecDeque<Head<T>>,
    comparer: C,
    semantics: S,
    live: usize,
    initiated: bool,
    finished: bool,
    selector: AccumulatorSelector<T>,
    diverted: Option<Box<dyn Accumulator<T>>>,
    diverted_cursor: Option<Cursor<T>>,
}

impl<T, C, S> SortedMerger<T, C, S>
where
    T: Item,
    C: Comparer<T>,
    S: MergeSemantics,
{
    fn new(inputs: Vec<Stream<T>>, comparer: C, semantics: S, selector: AccumulatorSelector<T>) -> Self {
        let live = inputs.len();

        return SortedMerger {
            worklist: VecDeque::with_capacity(live),
            inputs: inputs.into_iter().map(Some).collect(),
            comparer,
            semantics,
            live,
            initiated: false,
            finished: false,
            selector,
            diverted: None,
            diverted_cursor: None,
        };
    }

    fn init(&mut self) -> Result<()> {
        self.initiated = true;
        for idx in 0..self.inputs.len() {
            self.advance(idx, None)?;
        }
        return Ok(());
    }

    /// Pulls the next item of an input, skipping duplicates of `previous` when collapsing.
    fn advance(&mut self, idx: usize, previous: Option<&T>) -> Result<()> {
        let collapse = self.semantics.collapse_duplicates();
        let input = match self.inputs[idx].as_mut() {
            Some(input) => input,
            None => return Ok(()),
        };

        loop {
            match input.next() {
                Some(Ok(item)) => {
                    if let (true, Some(previous)) = (collapse, previous) {
                        if self.comparer.compare(previous, &item) == Ordering::Equal {
                            continue;
                        }
                    }
                    self.insert(Head { item, input: idx });
                    return Ok(());
                }
                Some(Err(err)) => return Err(err),
                None => {
                    // exhausted inputs are disposed right away
                    self.inputs[idx] = None;
                    self.live -= 1;
                    return Ok(());
                }
            }
        }
    }

    fn insert(&mut self, head: Head<T>) {
        let comparer = &self.comparer;
        let position = self.worklist.partition_point(|other| {
            comparer
                .compare(&other.item, &head.item)
                .then(other.input.cmp(&head.input))
                == Ordering::Less
        });
        self.worklist.insert(position, head);
    }

    fn tied(&self) -> usize {
        let first = &self.worklist[0].item;
        self.worklist
            .iter()
            .take_while(|head| self.comparer.compare(first, &head.item) == Ordering::Equal)
            .count()
    }

    fn take_tie(&mut self, tied: usize) -> Result<T> {
        let heads: Vec<Head<T>> = self.worklist.drain(..tied).collect();
        for head in heads.iter() {
            self.advance(head.input, Some(&head.item))?;
        }

        let first = heads.into_iter().next().map(|head| head.item);
        Ok(first.expect("tie holds at least one item"))
    }

    fn divert(&mut self, item: T) -> Result<()> {
        if self.diverted.is_none() {
            self.diverted = Some(self.selector.get());
        }
        match self.diverted.as_mut() {
            Some(diverted) => diverted.add(item),
            None => Ok(()),
        }
    }

    /// Switches to the diverted items once every input is merged.
    fn start_diverted(&mut self) -> Result<bool> {
        let mut diverted = match self.diverted.take() {
            Some(diverted) => diverted,
            None => return Ok(false),
        };

        log::debug!("emitting {} diverted items", diverted.count());
        let collection = diverted.complete()?;
        self.diverted_cursor = Some(collection.iter()?);
        return Ok(true);
    }

    fn finish(&mut self) {
        self.finished = true;
        self.worklist.clear();
        self.inputs.clear();
        self.diverted = None;
        self.diverted_cursor = None;
    }

    fn next_merged(&mut self) -> Result<Option<T>> {
        if !self.initiated {
            self.init()?;
        }

        loop {
            if self.worklist.is_empty() {
                return Ok(None);
            }

            let tied = self.tied();
            match self.semantics.decide(tied, self.live, self.inputs.len()) {
                Decision::EmitEach => {
                    let head = match self.worklist.pop_front() {
                        Some(head) => head,
                        None => return Ok(None),
                    };
                    self.advance(head.input, Some(&head.item))?;
                    return Ok(Some(head.item));
                }
                Decision::EmitOnce => return self.take_tie(tied).map(Some),
                Decision::Discard => {
                    self.take_tie(tied)?;
                }
                Decision::Divert => {
                    let item = self.take_tie(tied)?;
                    self.divert(item)?;
                }
                Decision::Finish => {
                    self.worklist.clear();
                    return Ok(None);
                }
            }
        }
    }
}

impl<T, C, S> Iterator for SortedMerger<T, C, S>
where
    T: Item,
    C: Comparer<T>,
    S: MergeSemantics,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if let Some(cursor) = self.diverted_cursor.as_mut() {
            let item = cursor.next();
            if item.is_none() {
                self.finish();
            }
            return item;
        }

        let result = match self.next_merged() {
            Ok(Some(item)) => return Some(Ok(item)),
            Ok(None) => self.start_diverted(),
            Err(err) => Err(err),
        };

        match result {
            Ok(true) => {
                // inputs are done, only the diverted items remain
                self.inputs.clear();
                self.next()
            }
            Ok(false) => {
                self.finish();
                None
            }
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }
}
