// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Linear (bump) allocation with scope-based reset.

Elements are addressed by index rather than by reference, so handing out an
[`ArenaIndex`] never borrows the allocator and the storage may grow freely.
There is no per-element free; the allocator is reset wholesale, either when it is
dropped or when a [`LinAllocScope`] ends.

Payloads must be `Copy`.  That is the capability check that guarantees nothing in an
arena owns a resource or needs its destructor run when the arena is reset.
*/

use std::ops::Range;

/// Index of an element inside a [`LinAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex(pub(crate) u32);

impl ArenaIndex {
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

/// Allocation counters, exposed for instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Elements allocated over the allocator's lifetime.
    pub allocated: u64,
    /// Elements released by scope resets.
    pub released: u64,
    /// The most elements that were ever live at once.
    pub high_water: usize,
}

/**
A bump allocator over `Copy` payloads.

```
use records_and_hooks::arena::LinAllocator;

let mut alloc = LinAllocator::<u32>::new();
let a = alloc.alloc(7);
{
    let mut scope = alloc.scope();
    scope.alloc(1);
    scope.alloc(2);
    assert_eq!(scope.len(), 2);
}
// the scope released its elements, but `a` is untouched
assert_eq!(alloc.len(), 1);
assert_eq!(*alloc.get(a), 7);
```
*/
#[derive(Debug, Clone)]
pub struct LinAllocator<T: Copy> {
    slots: Vec<T>,
    stats: AllocStats,
}

impl<T: Copy> LinAllocator<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        LinAllocator {
            slots: Vec::with_capacity(capacity),
            stats: AllocStats::default(),
        }
    }

    pub fn alloc(&mut self, value: T) -> ArenaIndex {
        let index = self.slots.len();
        assert!(index < u32::MAX as usize, "LinAllocator exhausted its index space");
        self.slots.push(value);
        self.stats.allocated += 1;
        self.stats.high_water = self.stats.high_water.max(self.slots.len());
        ArenaIndex(index as u32)
    }

    /// Allocates `count` contiguous copies of `fill`.
    pub fn alloc_n(&mut self, count: usize, fill: T) -> Range<usize> {
        let start = self.slots.len();
        self.slots.resize(start + count, fill);
        self.stats.allocated += count as u64;
        self.stats.high_water = self.stats.high_water.max(self.slots.len());
        start..start + count
    }

    pub fn get(&self, index: ArenaIndex) -> &T {
        &self.slots[index.get()]
    }

    /// Mutable access is for fixing up links while a structure is being built;
    /// callers own the invariant that published data is not rewritten.
    pub(crate) fn get_mut(&mut self, index: ArenaIndex) -> &mut T {
        &mut self.slots[index.get()]
    }

    pub fn slice(&self, range: Range<usize>) -> &[T] {
        &self.slots[range]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    /// Opens a scope; everything allocated through it is released when it drops.
    pub fn scope(&mut self) -> LinAllocScope<'_, T> {
        let mark = self.slots.len();
        LinAllocScope { alloc: self, mark }
    }

    fn reset_to(&mut self, mark: usize) {
        let released = self.slots.len().saturating_sub(mark);
        self.slots.truncate(mark);
        self.stats.released += released as u64;
    }
}

impl<T: Copy> Default for LinAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/**
A region of a [`LinAllocator`] that is released when the scope ends.

Scopes nest: [`LinAllocScope::nested`] borrows the parent mutably, so the parent's
elements cannot be touched until the nested scope has been dropped and its
elements released.  Indices returned by a scope are relative to the scope.
*/
#[derive(Debug)]
pub struct LinAllocScope<'a, T: Copy> {
    alloc: &'a mut LinAllocator<T>,
    mark: usize,
}

impl<'a, T: Copy> LinAllocScope<'a, T> {
    pub fn alloc(&mut self, value: T) -> usize {
        self.alloc.alloc(value).get() - self.mark
    }

    pub fn alloc_n(&mut self, count: usize, fill: T) -> Range<usize> {
        let range = self.alloc.alloc_n(count, fill);
        range.start - self.mark..range.end - self.mark
    }

    pub fn get(&self, index: usize) -> &T {
        &self.alloc.slots[self.mark + index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        &mut self.alloc.slots[self.mark + index]
    }

    /// Everything allocated in this scope so far.
    pub fn allocated(&self) -> &[T] {
        &self.alloc.slots[self.mark..]
    }

    pub fn allocated_mut(&mut self) -> &mut [T] {
        &mut self.alloc.slots[self.mark..]
    }

    pub fn len(&self) -> usize {
        self.alloc.slots.len() - self.mark
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nested(&mut self) -> LinAllocScope<'_, T> {
        let mark = self.alloc.slots.len();
        LinAllocScope {
            alloc: &mut *self.alloc,
            mark,
        }
    }
}

impl<T: Copy> Drop for LinAllocScope<'_, T> {
    fn drop(&mut self) {
        self.alloc.reset_to(self.mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_release_in_order() {
        let mut alloc = LinAllocator::<u64>::new();
        alloc.alloc(1);
        {
            let mut outer = alloc.scope();
            let a = outer.alloc(10);
            {
                let mut inner = outer.nested();
                inner.alloc_n(5, 0);
                assert_eq!(inner.len(), 5);
            }
            assert_eq!(outer.len(), 1);
            assert_eq!(*outer.get(a), 10);
            *outer.get_mut(a) = 11;
            assert_eq!(outer.allocated(), &[11]);
        }
        assert_eq!(alloc.len(), 1);
        let stats = alloc.stats();
        assert_eq!(stats.allocated, 7);
        assert_eq!(stats.released, 6);
        assert_eq!(stats.high_water, 7);
    }

    #[test]
    fn scope_indices_are_relative() {
        let mut alloc = LinAllocator::<u8>::new();
        alloc.alloc_n(3, 9);
        let mut scope = alloc.scope();
        assert_eq!(scope.alloc(4), 0);
        assert_eq!(scope.alloc_n(2, 5), 1..3);
        assert_eq!(scope.allocated(), &[4, 5, 5]);
    }
}
