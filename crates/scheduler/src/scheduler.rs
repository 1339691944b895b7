//! Position-ordered multi-map with live cursors

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

/// Items at this position always run before any other
pub const ALWAYS_FIRST_POSITION: i32 = i32::MIN;

/// Position used when a resource doesn't ask for one
pub const DEFAULT_POSITION: i32 = 0;

/// Items at this position always run after any other
pub const ALWAYS_LAST_POSITION: i32 = i32::MAX;

/// Traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Positions ascending, items of a position in insertion order
    Natural,
    /// Positions descending, items of a position in reverse insertion order
    Reverse,
}

/// Items grouped by integer position
///
/// Within a position items keep their insertion order. Both traversal
/// directions agree on which item of a position was added last: it is the
/// last one visited in natural order and the first one visited in reverse
/// order.
pub struct Scheduler<T> {
    positions: BTreeMap<i32, Vec<T>>,
    len: usize,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            positions: BTreeMap::new(),
            len: 0,
        }
    }

    /// Add an item at the given position, after the items already there
    pub fn add(&mut self, item: T, position: i32) {
        self.positions.entry(position).or_default().push(item);
        self.len += 1;
    }

    /// Remove the first item, in natural order, matching the predicate
    pub fn remove_by<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let (position, index) = self.positions.iter().find_map(|(position, items)| {
            items
                .iter()
                .position(&mut predicate)
                .map(|index| (*position, index))
        })?;

        let items = self.positions.get_mut(&position)?;
        let item = items.remove(index);
        if items.is_empty() {
            self.positions.remove(&position);
        }
        self.len -= 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.len = 0;
    }

    /// Distinct positions in the given direction
    pub fn positions(&self, order: Order) -> Vec<i32> {
        match order {
            Order::Natural => self.positions.keys().copied().collect(),
            Order::Reverse => self.positions.keys().rev().copied().collect(),
        }
    }

    /// Distinct positions, ascending
    pub fn natural_order_positions(&self) -> Vec<i32> {
        self.positions(Order::Natural)
    }

    /// Distinct positions, descending
    pub fn reverse_order_positions(&self) -> Vec<i32> {
        self.positions(Order::Reverse)
    }

    /// Items at one position in insertion order
    pub fn natural_order_for_position(&self, position: i32) -> std::slice::Iter<'_, T> {
        self.slice_at(position).iter()
    }

    /// Items at one position in reverse insertion order
    pub fn reverse_order_for_position(
        &self,
        position: i32,
    ) -> std::iter::Rev<std::slice::Iter<'_, T>> {
        self.slice_at(position).iter().rev()
    }

    /// Items at one position in the given direction
    pub fn at_position(&self, position: i32, order: Order) -> Vec<&T> {
        match order {
            Order::Natural => self.natural_order_for_position(position).collect(),
            Order::Reverse => self.reverse_order_for_position(position).collect(),
        }
    }

    /// All items in natural order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.positions.values().flat_map(|items| items.iter())
    }

    /// All items in reverse order
    pub fn iter_reverse(&self) -> impl Iterator<Item = &T> + '_ {
        self.positions
            .values()
            .rev()
            .flat_map(|items| items.iter().rev())
    }

    /// Cursor allowing removal of the current item while traversing
    pub fn cursor(&mut self, order: Order) -> Cursor<'_, T> {
        Cursor {
            scheduler: self,
            order,
            position: None,
            next_index: 0,
            current: None,
            exhausted: false,
        }
    }

    fn slice_at(&self, position: i32) -> &[T] {
        self.positions
            .get(&position)
            .map(|items| items.as_slice())
            .unwrap_or(&[])
    }
}

impl<T: PartialEq> Scheduler<T> {
    /// Remove an item; returns false if it wasn't scheduled
    pub fn remove(&mut self, item: &T) -> bool {
        self.remove_by(|candidate| candidate == item).is_some()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Display for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a Scheduler with {} object(s) in {} position(s)",
            self.len,
            self.positions.len()
        )
    }
}

impl<T: fmt::Debug> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.positions.iter()).finish()
    }
}

/// Live traversal over a `Scheduler`
///
/// Unlike a regular iterator the cursor can remove the item it last returned.
/// Removal never skips or repeats any other item.
pub struct Cursor<'a, T> {
    scheduler: &'a mut Scheduler<T>,
    order: Order,
    /// Position being traversed
    position: Option<i32>,
    /// Natural: index of the next item to visit.
    /// Reverse: number of items of the position not yet visited.
    next_index: usize,
    /// Index of the item last returned, within `position`
    current: Option<usize>,
    exhausted: bool,
}

impl<T> Cursor<'_, T> {
    /// Advance to the next item
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&T> {
        self.current = None;

        while !self.exhausted {
            if let Some(index) = self.step_within_position() {
                self.current = Some(index);
                let position = self.position?;
                return self.scheduler.positions.get(&position).map(|items| &items[index]);
            }
            self.move_to_next_position();
        }

        None
    }

    /// Remove the item last returned by `next`
    ///
    /// Returns `None` when `next` hasn't returned an item since the last removal.
    pub fn remove_current(&mut self) -> Option<T> {
        let index = self.current.take()?;
        let position = self.position?;
        let items = self.scheduler.positions.get_mut(&position)?;

        let item = items.remove(index);
        if self.order == Order::Natural {
            // Everything after the removed item shifted down by one
            self.next_index -= 1;
        }
        if items.is_empty() {
            self.scheduler.positions.remove(&position);
        }
        self.scheduler.len -= 1;
        Some(item)
    }

    fn step_within_position(&mut self) -> Option<usize> {
        let position = self.position?;
        let len = self.scheduler.positions.get(&position)?.len();

        match self.order {
            Order::Natural if self.next_index < len => {
                self.next_index += 1;
                Some(self.next_index - 1)
            }
            Order::Reverse if self.next_index > 0 => {
                self.next_index -= 1;
                Some(self.next_index)
            }
            _ => None,
        }
    }

    fn move_to_next_position(&mut self) {
        let positions = &self.scheduler.positions;
        let next = match (self.order, self.position) {
            (Order::Natural, None) => positions.iter().next(),
            (Order::Natural, Some(current)) => positions
                .range((Bound::Excluded(current), Bound::Unbounded))
                .next(),
            (Order::Reverse, None) => positions.iter().next_back(),
            (Order::Reverse, Some(current)) => positions.range(..current).next_back(),
        };

        match next {
            Some((position, items)) => {
                self.next_index = match self.order {
                    Order::Natural => 0,
                    Order::Reverse => items.len(),
                };
                self.position = Some(*position);
            }
            None => self.exhausted = true,
        }
    }
}
