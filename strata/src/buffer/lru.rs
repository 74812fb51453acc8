//! Recency order of evictable nodes

use std::collections::HashMap;
use std::hash::Hash;

struct LruEntry<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Intrusive doubly linked list over a slot vector; head is most recent
pub struct LruList<K> {
    map: HashMap<K, usize>,
    entries: Vec<Option<LruEntry<K>>>,
    free_list: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone> Default for LruList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> LruList<K> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            entries: Vec::new(),
            free_list: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Mark `key` most recently used, inserting it if absent
    pub fn touch(&mut self, key: K) {
        if let Some(&index) = self.map.get(&key) {
            self.move_to_front(index);
            return;
        }
        let index = self.allocate_entry(key.clone());
        self.map.insert(key, index);
        self.push_front(index);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.map.remove(key) {
            Some(index) => {
                self.unlink(index);
                self.entries[index] = None;
                self.free_list.push(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return the least recently used key
    pub fn pop_lru(&mut self) -> Option<K> {
        let tail = self.tail?;
        let key = self.entries[tail].as_ref().map(|e| e.key.clone())?;
        self.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keys from least to most recently used
    pub fn iter_lru(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            let entry = self.entries[cursor?].as_ref()?;
            cursor = entry.prev;
            Some(&entry.key)
        })
    }

    fn allocate_entry(&mut self, key: K) -> usize {
        let entry = Some(LruEntry { key, prev: None, next: None });
        if let Some(index) = self.free_list.pop() {
            self.entries[index] = entry;
            index
        } else {
            self.entries.push(entry);
            self.entries.len() - 1
        }
    }

    fn push_front(&mut self, index: usize) {
        if let Some(entry) = &mut self.entries[index] {
            entry.prev = None;
            entry.next = self.head;
        }
        if let Some(old_head) = self.head {
            if let Some(entry) = &mut self.entries[old_head] {
                entry.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match &self.entries[index] {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(entry) = &mut self.entries[p] {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(entry) = &mut self.entries[n] {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }
}
