//! Mutex-protected keyed stores
//!
//! Every piece of state the deployment core tracks (images, containers,
//! tasks, snapshots, routes, allocated ports) lives in one of these. Each
//! instance owns exactly one lock; operations never perform I/O while it is
//! held, so callers copy out what they need, release, do the slow work and
//! come back to commit.
//!
//! When an operation has to touch more than one registry it acquires them in
//! the fixed order tasks, containers, images, snapshots, ports, routes.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

/// A keyed store with create / get / delete semantics.
///
/// Creating over an existing key fails with [`Error::AlreadyExists`] and
/// leaves the stored value untouched; lookups and deletes of an absent key
/// fail with [`Error::NotFound`].
pub struct Registry<K, V> {
    kind: &'static str,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    /// Create an empty registry; `kind` names the resource in error messages
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn create(&self, key: K, value: V) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{} '{}'", self.kind, key)));
        }
        entries.insert(key, value);
        Ok(())
    }

    pub fn get<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))
    }

    /// Run `f` against the stored value while the registry lock is held.
    ///
    /// Used where the caller must act on the value before a concurrent
    /// delete can observe it (e.g. entering an in-flight counter).
    pub fn with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Result<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(value) => Ok(f(value)),
            None => Err(self.not_found(key)),
        }
    }

    /// Remove the entry and hand its value back to the caller
    pub fn delete<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        self.entries
            .lock()
            .remove(key)
            .ok_or_else(|| self.not_found(key))
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().contains_key(key)
    }

    /// Insert `value` under the first candidate key not already present.
    ///
    /// The scan and the insert happen under one lock acquisition.
    pub fn claim_first<I>(&self, candidates: I, value: impl FnOnce() -> V) -> Option<K>
    where
        I: IntoIterator<Item = K>,
    {
        let mut entries = self.entries.lock();
        let key = candidates.into_iter().find(|k| !entries.contains_key(k))?;
        entries.insert(key.clone(), value());
        Some(key)
    }

    /// Whether any stored value satisfies `predicate`
    pub fn any(&self, predicate: impl Fn(&V) -> bool) -> bool {
        self.entries.lock().values().any(predicate)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Copy of every entry at this instant
    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(K, V)> {
        self.entries.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn not_found<Q: Display + ?Sized>(&self, key: &Q) -> Error {
        Error::NotFound(format!("{} '{}'", self.kind, key))
    }
}

/// A two-level store: outer key (e.g. container id) to inner key (e.g. task
/// name) to value. The inner map is created lazily on first insert and
/// dropped once it becomes empty; all inner-map operations run while the
/// single outer lock is held.
pub struct NestedRegistry<K1, K2, V> {
    kind: &'static str,
    entries: Mutex<HashMap<K1, HashMap<K2, V>>>,
}

impl<K1, K2, V> NestedRegistry<K1, K2, V>
where
    K1: Eq + Hash + Clone + Display,
    K2: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, outer: K1, inner: K2, value: V) -> Result<()> {
        let mut entries = self.entries.lock();
        let slot = entries.entry(outer.clone()).or_default();
        if slot.contains_key(&inner) {
            return Err(Error::AlreadyExists(format!(
                "{} '{}' of '{}'",
                self.kind, inner, outer
            )));
        }
        slot.insert(inner, value);
        Ok(())
    }

    pub fn get<Q1, Q2>(&self, outer: &Q1, inner: &Q2) -> Result<V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + Display + ?Sized,
        Q2: Hash + Eq + Display + ?Sized,
    {
        self.entries
            .lock()
            .get(outer)
            .and_then(|slot| slot.get(inner))
            .cloned()
            .ok_or_else(|| self.not_found(outer, inner))
    }

    pub fn delete<Q1, Q2>(&self, outer: &Q1, inner: &Q2) -> Result<V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + Display + ?Sized,
        Q2: Hash + Eq + Display + ?Sized,
    {
        let mut entries = self.entries.lock();
        let slot = entries
            .get_mut(outer)
            .ok_or_else(|| self.not_found(outer, inner))?;
        let value = slot
            .remove(inner)
            .ok_or_else(|| self.not_found(outer, inner))?;
        if slot.is_empty() {
            entries.remove(outer);
        }
        Ok(value)
    }

    pub fn contains<Q1, Q2>(&self, outer: &Q1, inner: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.entries
            .lock()
            .get(outer)
            .map(|slot| slot.contains_key(inner))
            .unwrap_or(false)
    }

    /// Copy of the inner entries under `outer` (empty when absent)
    pub fn list<Q1>(&self, outer: &Q1) -> Vec<(K2, V)>
    where
        K1: Borrow<Q1>,
        Q1: Hash + Eq + ?Sized,
    {
        self.entries
            .lock()
            .get(outer)
            .map(|slot| slot.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Remove and return every entry, flattened
    pub fn drain(&self) -> Vec<(K1, K2, V)> {
        self.entries
            .lock()
            .drain()
            .flat_map(|(outer, slot)| {
                slot.into_iter()
                    .map(move |(inner, value)| (outer.clone(), inner, value))
            })
            .collect()
    }

    /// Total number of inner entries
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn not_found<Q1, Q2>(&self, outer: &Q1, inner: &Q2) -> Error
    where
        Q1: Display + ?Sized,
        Q2: Display + ?Sized,
    {
        Error::NotFound(format!("{} '{}' of '{}'", self.kind, inner, outer))
    }
}
