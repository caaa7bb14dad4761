/// Provides a slotmap owning its elements.
///
/// A slotmap provides a `Vec`-like interface where each entry is associated with a stable
/// index-like key. Lookup with the key will detect if an entry has been removed but does not
/// require any lifetime relation. This is how sockets and control blocks refer to each other: each
/// side holds the other's [`Key`] instead of a pointer.
///
/// ## Usage
///
/// ```
/// # use netcore::managed::SlotMap;
/// let mut map = SlotMap::new();
/// let index = map.insert(42);
/// assert_eq!(map.get(index).cloned(), Some(42));
/// ```
///
/// [`Key`]: struct.Key.html
#[derive(Clone, Debug)]
pub struct SlotMap<T> {
    entries: Vec<Entry<T>>,
    generation: Generation,
    free_top: Option<usize>,
    len: usize,
}

/// An index into a slotmap.
///
/// The index remains valid until the entry is removed. If accessing the slotmap with the index
/// again after the entry was removed will fail, even if the index where the element was previously
/// stored has been reused for another element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    idx: usize,
    generation: Generation,
}

#[derive(Clone, Debug)]
enum Entry<T> {
    Occupied {
        generation: Generation,
        value: T,
    },
    /// Link to the next free slot, forming a stack.
    Vacant {
        next_free: Option<usize>,
    },
}

/// The generation counter.
///
/// Has strictly positive values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Generation(u32);

impl<T> SlotMap<T> {
    pub fn new() -> Self {
        SlotMap {
            entries: Vec::new(),
            generation: Generation::default(),
            free_top: None,
            len: 0,
        }
    }

    /// The number of occupied entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Retrieve a value by index.
    pub fn get(&self, index: Key) -> Option<&T> {
        match self.entries.get(index.idx)? {
            Entry::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Retrieve a mutable value by index.
    pub fn get_mut(&mut self, index: Key) -> Option<&mut T> {
        match self.entries.get_mut(index.idx)? {
            Entry::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Check if the key still refers to a live entry.
    pub fn contains(&self, index: Key) -> bool {
        self.get(index).is_some()
    }

    /// Insert a value, reusing the most recently freed slot.
    pub fn insert(&mut self, value: T) -> Key {
        let generation = self.generation;
        self.generation.advance();
        self.len += 1;

        let entry = Entry::Occupied { generation, value };
        let idx = match self.free_top {
            Some(idx) => {
                let old = core::mem::replace(&mut self.entries[idx], entry);
                self.free_top = match old {
                    Entry::Vacant { next_free } => next_free,
                    Entry::Occupied { .. } => unreachable!("free list points to occupied slot"),
                };
                idx
            },
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            },
        };

        Key { idx, generation }
    }

    /// Insert a value that needs to know its own key.
    pub fn insert_with(&mut self, value: impl FnOnce(Key) -> T) -> Key {
        let idx = self.free_top.unwrap_or(self.entries.len());
        let key = Key { idx, generation: self.generation };
        let inserted = self.insert(value(key));
        debug_assert_eq!(inserted, key);
        inserted
    }

    /// Remove an element.
    ///
    /// Returns the removed element or `None` if the provided index did not refer to an element
    /// that could be freed.
    pub fn remove(&mut self, index: Key) -> Option<T> {
        if !self.contains(index) {
            return None;
        }

        let vacant = Entry::Vacant { next_free: self.free_top };
        let old = core::mem::replace(&mut self.entries[index.idx], vacant);
        self.free_top = Some(index.idx);
        self.len -= 1;

        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Iterate over all keys in slot order.
    pub fn keys(&self) -> impl Iterator<Item=Key> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Iterate over all live entries.
    pub fn iter(&self) -> impl Iterator<Item=(Key, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(idx, entry)| match entry {
            Entry::Occupied { generation, value } => Some((Key { idx, generation: *generation }, value)),
            Entry::Vacant { .. } => None,
        })
    }
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        SlotMap::new()
    }
}

impl Key {
    /// The raw slot index, stable while the entry lives.
    pub fn index(self) -> usize {
        self.idx
    }
}

impl core::fmt::Display for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "#{}v{}", self.idx, self.generation.0)
    }
}

impl Generation {
    fn advance(&mut self) {
        assert!(self.0 > 0);
        self.0 = self.0.wrapping_add(1).max(1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple() {
        let mut map = SlotMap::new();
        let key42 = map.insert(42u32);
        let keylo = map.insert('K' as u32);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(key42).cloned(), Some(42));
        assert_eq!(map.get(keylo).cloned(), Some('K' as _));
    }

    #[test]
    fn retained() {
        let mut map = SlotMap::new();
        let key = map.insert(0xdeu32);
        assert_eq!(map.remove(key), Some(0xde));
        assert_eq!(map.get(key), None);

        let new_key = map.insert(0xad);
        assert_eq!(new_key.index(), key.index());

        assert_eq!(map.get(key), None);
        assert_eq!(map.get(new_key).cloned(), Some(0xad));

        assert_eq!(map.remove(key), None);
        map.remove(new_key).unwrap();

        assert_eq!(map.get(key), None);
        assert_eq!(map.get(new_key), None);
        assert!(map.is_empty());
    }

    #[test]
    fn iteration_skips_vacant() {
        let mut map = SlotMap::new();
        let a = map.insert('a');
        let b = map.insert('b');
        let c = map.insert('c');
        map.remove(b);

        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, vec![a, c]);
    }
}
