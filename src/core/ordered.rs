//! Purpose: Insertion-ordered, string-keyed map with O(log n) reordering.
//! Exports: `OrderedMap`.
//! Role: Record store behind `Table` and the offset index behind `LiteTable`.
//! Invariants: A replaced key keeps its position; a removed key re-inserts at the back.
//! Invariants: `move_to_end` never renumbers other entries.
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug)]
pub struct OrderedMap<V> {
    slots: HashMap<String, i64>,
    entries: BTreeMap<i64, (String, V)>,
    next_back: i64,
    next_front: i64,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            entries: BTreeMap::new(),
            next_back: 0,
            next_front: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        let slot = self.slots.get(key)?;
        self.entries.get(slot).map(|(_, value)| value)
    }

    /// Inserts or replaces; a replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        if let Some(slot) = self.slots.get(&key) {
            if let Some(entry) = self.entries.get_mut(slot) {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        let slot = self.next_back;
        self.next_back += 1;
        self.slots.insert(key.clone(), slot);
        self.entries.insert(slot, (key, value));
        None
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.entries.remove(&slot).map(|(_, value)| value)
    }

    pub fn pop_first(&mut self) -> Option<(String, V)> {
        let (_, (key, value)) = self.entries.pop_first()?;
        self.slots.remove(&key);
        Some((key, value))
    }

    pub fn pop_last(&mut self) -> Option<(String, V)> {
        let (_, (key, value)) = self.entries.pop_last()?;
        self.slots.remove(&key);
        Some((key, value))
    }

    /// Moves `key` to the back (or the front when `last` is false).
    pub fn move_to_end(&mut self, key: &str, last: bool) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        let Some(entry) = self.entries.remove(slot) else {
            return false;
        };
        let new_slot = if last {
            self.next_back += 1;
            self.next_back - 1
        } else {
            self.next_front -= 1;
            self.next_front + 1
        };
        *slot = new_slot;
        self.entries.insert(new_slot, entry);
        true
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.entries.clear();
        self.next_back = 0;
        self.next_front = -1;
    }

    pub fn first(&self) -> Option<(&str, &V)> {
        self.entries
            .first_key_value()
            .map(|(_, (key, value))| (key.as_str(), value))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &V)> + '_ {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &str> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl DoubleEndedIterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }
}

impl<V: PartialEq> PartialEq for OrderedMap<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}
