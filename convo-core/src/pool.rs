//! Integer id allocator with reuse of released ids.

use std::collections::BTreeSet;

/// Hands out the lowest released id first, otherwise the next fresh one.
#[derive(Debug, Default)]
pub struct IdPool {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_id(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Return an id. Ids never handed out, or already free, are ignored.
    pub fn release_id(&mut self, id: u32) {
        if id < self.next {
            self.free.insert(id);
        }
    }

    /// Ids currently handed out.
    pub fn in_use(&self) -> usize {
        self.next as usize - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_ids_are_reused() {
        let mut pool = IdPool::new();
        assert_eq!(pool.get_id(), 0);
        assert_eq!(pool.get_id(), 1);
        assert_eq!(pool.get_id(), 2);
        pool.release_id(1);
        pool.release_id(0);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.get_id(), 0);
        assert_eq!(pool.get_id(), 1);
        assert_eq!(pool.get_id(), 3);
    }

    #[test]
    fn bogus_release_ignored() {
        let mut pool = IdPool::new();
        pool.release_id(5);
        assert_eq!(pool.get_id(), 0);
        pool.release_id(0);
        pool.release_id(0);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.get_id(), 0);
        assert_eq!(pool.get_id(), 1);
    }
}
