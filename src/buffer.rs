//! In-memory and hybrid accumulators.

use std::sync::Arc;

use log;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceTracker, Token};
use crate::storage::{Accumulator, Backing, Collection, Item, Medium, SpillFactory};

struct MemoryBacking<T> {
    items: Arc<Vec<T>>,
}

impl<T: Item> Backing<T> for MemoryBacking<T> {
    fn open(&self) -> Result<Box<dyn Iterator<Item = Result<T>>>> {
        let items = self.items.clone();
        Ok(Box::new((0..items.len()).map(move |idx| Ok(items[idx].clone()))))
    }

    fn medium(&self) -> Medium {
        Medium::Memory
    }
}

/// Accumulator buffering items in a vector.
pub struct MemoryAccumulator<T> {
    items: Vec<T>,
    resource: Resource,
    token: Token,
    sealed: bool,
}

impl<T> MemoryAccumulator<T> {
    pub fn new(tracker: &ResourceTracker) -> Self {
        let resource = Resource::detached("memory buffer", tracker);
        let token = resource.acquire().expect("fresh resource can not be released");

        MemoryAccumulator {
            items: Vec::new(),
            resource,
            token,
            sealed: false,
        }
    }

    pub(crate) fn items(&self) -> &[T] {
        &self.items
    }

    /// Gives up the buffer, releasing the memory resource.
    pub(crate) fn discard(mut self) -> Result<()> {
        self.items.clear();
        self.sealed = true;
        self.token.release()
    }
}

impl<T: Item> Accumulator<T> for MemoryAccumulator<T> {
    fn add(&mut self, item: T) -> Result<()> {
        if self.sealed {
            return Err(Error::AlreadySealed);
        }
        self.items.push(item);
        return Ok(());
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    fn medium(&self) -> Medium {
        Medium::Memory
    }

    fn complete(&mut self) -> Result<Collection<T>> {
        if self.sealed {
            return Err(Error::AlreadySealed);
        }
        self.sealed = true;

        let items = std::mem::take(&mut self.items);
        let count = items.len();
        let backing = Arc::new(MemoryBacking { items: Arc::new(items) });

        Collection::new(backing, self.resource.clone(), count)
    }
}

enum Stage<T> {
    Memory(MemoryAccumulator<T>),
    Spilled(Box<dyn Accumulator<T>>),
}

/// Accumulator starting in memory and promoting to a spill medium once its count reaches the threshold.
///
/// Promotion happens at most once and preserves item order.
pub struct HybridAccumulator<T> {
    threshold: usize,
    spill: Arc<dyn SpillFactory<T>>,
    stage: Stage<T>,
}

impl<T: Item> HybridAccumulator<T> {
    pub fn new(threshold: usize, spill: Arc<dyn SpillFactory<T>>, tracker: &ResourceTracker) -> Self {
        HybridAccumulator {
            threshold,
            spill,
            stage: Stage::Memory(MemoryAccumulator::new(tracker)),
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.stage, Stage::Spilled(_))
    }

    fn promote(&mut self) -> Result<()> {
        let memory = match &self.stage {
            Stage::Memory(memory) => memory,
            Stage::Spilled(_) => return Ok(()),
        };

        log::debug!(
            "promoting {} buffered items to {}",
            memory.count(),
            self.spill.medium()
        );
        let mut spilled = self.spill.open()?;
        // buffer stays intact until the spill medium holds every item
        spilled.add_range(&mut memory.items().iter().cloned())?;

        if let Stage::Memory(memory) = std::mem::replace(&mut self.stage, Stage::Spilled(spilled)) {
            memory.discard()?;
        }
        return Ok(());
    }
}

impl<T: Item> Accumulator<T> for HybridAccumulator<T> {
    fn add(&mut self, item: T) -> Result<()> {
        match &mut self.stage {
            Stage::Memory(memory) => {
                memory.add(item)?;
                if memory.count() >= self.threshold {
                    self.promote()?;
                }
                Ok(())
            }
            Stage::Spilled(spilled) => spilled.add(item),
        }
    }

    fn count(&self) -> usize {
        match &self.stage {
            Stage::Memory(memory) => memory.count(),
            Stage::Spilled(spilled) => spilled.count(),
        }
    }

    fn medium(&self) -> Medium {
        match &self.stage {
            Stage::Memory(memory) => memory.medium(),
            Stage::Spilled(spilled) => spilled.medium(),
        }
    }

    fn complete(&mut self) -> Result<Collection<T>> {
        match &mut self.stage {
            Stage::Memory(memory) => memory.complete(),
            Stage::Spilled(spilled) => spilled.complete(),
        }
    }
}
