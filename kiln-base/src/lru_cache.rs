use crate::hashing::HashMap;
use std::hash::Hash;

const NONE: u32 = u32::MAX;

#[derive(Copy, Clone)]
struct LruLink {
    next: u32,
    previous: u32,
}

/// Fixed-capacity map that evicts the least recently used entry once it is full
pub struct LruCache<K, V> {
    // Doubly linked list over slot indices, most recently used at the head. Every slot is always
    // linked in, empty slots drift to the tail.
    head: u32,
    tail: u32,
    links: Vec<LruLink>,

    slots: Vec<Option<(K, V)>>,
    lookup: HashMap<K, u32>,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: u32) -> LruCache<K, V> {
        assert!(capacity >= 2 && capacity < NONE);
        let links = (0..capacity)
            .map(|i| LruLink {
                previous: if i == 0 { NONE } else { i - 1 },
                next: if i == capacity - 1 { NONE } else { i + 1 },
            })
            .collect();

        LruCache {
            head: 0,
            tail: capacity - 1,
            links,
            slots: (0..capacity).map(|_| None).collect(),
            lookup: HashMap::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn contains_key(
        &self,
        k: &K,
    ) -> bool {
        self.lookup.contains_key(k)
    }

    fn unlink(
        &mut self,
        index: u32,
    ) {
        let link = self.links[index as usize];
        match link.previous {
            NONE => self.head = link.next,
            previous => self.links[previous as usize].next = link.next,
        }
        match link.next {
            NONE => self.tail = link.previous,
            next => self.links[next as usize].previous = link.previous,
        }
    }

    fn move_to_front(
        &mut self,
        index: u32,
    ) {
        if index == self.head {
            return;
        }

        self.unlink(index);
        self.links[self.head as usize].previous = index;
        self.links[index as usize] = LruLink {
            previous: NONE,
            next: self.head,
        };
        self.head = index;
    }

    fn move_to_back(
        &mut self,
        index: u32,
    ) {
        if index == self.tail {
            return;
        }

        self.unlink(index);
        self.links[self.tail as usize].next = index;
        self.links[index as usize] = LruLink {
            previous: self.tail,
            next: NONE,
        };
        self.tail = index;
    }

    /// Marks the entry as recently used
    pub fn get(
        &mut self,
        k: &K,
    ) -> Option<&V> {
        let index = *self.lookup.get(k)?;
        self.move_to_front(index);
        self.slots[index as usize].as_ref().map(|(_, v)| v)
    }

    /// Returns the entry that was evicted to make room, if any
    pub fn insert(
        &mut self,
        k: K,
        v: V,
    ) -> Option<(K, V)> {
        if let Some(&index) = self.lookup.get(&k) {
            self.move_to_front(index);
            self.slots[index as usize] = Some((k, v));
            return None;
        }

        let index = self.tail;
        let evicted = self.slots[index as usize].take();
        if let Some((evicted_key, _)) = &evicted {
            self.lookup.remove(evicted_key);
        }

        self.move_to_front(index);
        self.lookup.insert(k.clone(), index);
        self.slots[index as usize] = Some((k, v));
        evicted
    }

    pub fn remove(
        &mut self,
        k: &K,
    ) -> Option<V> {
        let index = self.lookup.remove(k)?;
        self.move_to_back(index);
        self.slots[index as usize].take().map(|(_, v)| v)
    }
}
