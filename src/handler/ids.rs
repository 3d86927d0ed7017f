//! Correlation tables keyed by random ids.
//!
//! Ids are drawn from `rand::thread_rng` and retried until absent, under the
//! table lock, so two concurrent inserts can never collide. The two ends of a
//! connection draw from disjoint halves of the `i32` range: a client exported
//! by one side and a client opened by the other can share the inbound table
//! without clashing.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::Side;
use crate::error::{MuxwireError, Result};

/// Half of the id space a side allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdNamespace {
    /// Connecting side: top bit clear.
    Initiator,
    /// Accepting side: top bit set.
    Acceptor,
}

impl IdNamespace {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Client => IdNamespace::Initiator,
            Side::Server => IdNamespace::Acceptor,
        }
    }

    pub fn contains(self, id: i32) -> bool {
        match self {
            IdNamespace::Initiator => id >= 0,
            IdNamespace::Acceptor => id < 0,
        }
    }

    fn draw<R: Rng>(self, rng: &mut R) -> i32 {
        let raw: i32 = rng.gen();
        match self {
            IdNamespace::Initiator => raw & i32::MAX,
            IdNamespace::Acceptor => raw | i32::MIN,
        }
    }
}

struct Inner<T> {
    entries: HashMap<i32, T>,
    closed: bool,
}

/// Id-keyed table that refuses inserts once drained.
pub struct IdTable<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
}

impl<T> IdTable<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocate a fresh id in `namespace` and insert `make(id)` under it.
    pub fn insert_new<F>(&self, namespace: IdNamespace, make: F) -> Result<T>
    where
        F: FnOnce(i32) -> T,
        T: Clone,
    {
        let mut rng = rand::thread_rng();
        self.insert_new_with(namespace, &mut rng, make)
    }

    fn insert_new_with<R, F>(&self, namespace: IdNamespace, rng: &mut R, make: F) -> Result<T>
    where
        R: Rng,
        F: FnOnce(i32) -> T,
        T: Clone,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(MuxwireError::ConnectionClosed);
        }
        let id = loop {
            let candidate = namespace.draw(rng);
            if !inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let value = make(id);
        inner.entries.insert(id, value.clone());
        Ok(value)
    }

    /// Insert under a peer-chosen id.
    ///
    /// Returns `Ok(false)` without replacing anything if the id is taken.
    pub fn insert(&self, id: i32, value: T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(MuxwireError::ConnectionClosed);
        }
        if inner.entries.contains_key(&id) {
            return Ok(false);
        }
        inner.entries.insert(id, value);
        Ok(true)
    }

    pub fn get(&self, id: i32) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().entries.get(&id).cloned()
    }

    pub fn remove(&self, id: i32) -> Option<T> {
        self.inner.lock().entries.remove(&id)
    }

    /// Take every entry and refuse inserts from now on.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.entries.drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> std::fmt::Debug for IdTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("IdTable")
            .field("name", &self.name)
            .field("len", &inner.entries.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_namespaces_are_disjoint() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            assert!(IdNamespace::Initiator.contains(IdNamespace::Initiator.draw(&mut rng)));
            assert!(IdNamespace::Acceptor.contains(IdNamespace::Acceptor.draw(&mut rng)));
        }
        assert_eq!(IdNamespace::for_side(Side::Client), IdNamespace::Initiator);
        assert_eq!(IdNamespace::for_side(Side::Server), IdNamespace::Acceptor);
    }

    #[test]
    fn test_retry_until_absent() {
        let table: IdTable<i32> = IdTable::new("test");
        let mut rng = StepRng::new(7, 0);
        table
            .insert_new_with(IdNamespace::Initiator, &mut rng, |id| id)
            .unwrap();

        // Draws 7 (taken), then 8.
        let mut rng = StepRng::new(7, 1);
        let second = table
            .insert_new_with(IdNamespace::Initiator, &mut rng, |id| id)
            .unwrap();
        assert_eq!(second, 8);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_insert_refuses_duplicate() {
        let table = IdTable::new("test");
        assert!(table.insert(5, "a").unwrap());
        assert!(!table.insert(5, "b").unwrap());
        assert_eq!(table.get(5), Some("a"));
    }

    #[test]
    fn test_drain_closes_table() {
        let table = IdTable::new("test");
        table.insert(1, 10).unwrap();
        table.insert(2, 20).unwrap();

        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, [10, 20]);
        assert!(table.is_empty());
        assert!(table.is_closed());
        assert!(matches!(table.insert(3, 30), Err(MuxwireError::ConnectionClosed)));
        assert!(table
            .insert_new(IdNamespace::Acceptor, |_| 0)
            .is_err());
    }

    #[test]
    fn test_concurrent_inserts_unique() {
        let table = Arc::new(IdTable::new("test"));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| table.insert_new(IdNamespace::Acceptor, |id| id).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for id in thread.join().unwrap() {
                assert!(id < 0);
                assert!(seen.insert(id));
            }
        }
        assert_eq!(table.len(), 4000);
    }
}
