//! O(1) LRU cache: doubly linked list (arena-indexed, no unsafe) plus a
//! key->node map. `get` unlinks and re-appends at the tail; insertion past
//! capacity evicts the head.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Vec<usize>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            free: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn append_tail(&mut self, idx: usize) {
        let node = self.nodes[idx].as_mut().unwrap();
        node.prev = self.tail;
        node.next = None;
        match self.tail {
            Some(t) => self.nodes[t].as_mut().unwrap().next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.detach(idx);
        self.append_tail(idx);
        Some(self.nodes[idx].as_ref().unwrap().value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        if let Some(&idx) = self.index.get(&key) {
            self.nodes[idx].as_mut().unwrap().value = value;
            self.detach(idx);
            self.append_tail(idx);
            return;
        }

        if self.index.len() >= self.capacity {
            if let Some(head) = self.head {
                let evicted_key = self.nodes[head].as_ref().unwrap().key.clone();
                self.detach(head);
                self.index.remove(&evicted_key);
                self.nodes[head] = None;
                self.free.push(head);
            }
        }

        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(Node { key: key.clone(), value, prev: None, next: None });
                i
            }
            None => {
                self.nodes.push(Some(Node { key: key.clone(), value, prev: None, next: None }));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.append_tail(idx);
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_on_overflow() {
        let mut cache: LruCache<&str, i32> = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.get(&"a");
        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn put_on_existing_key_updates_value_without_growing() {
        let mut cache: LruCache<&str, i32> = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }
}
