//! Change-tracked sequence
//!
//! A [`TrackedList`] keeps the items last confirmed by the server (the
//! baseline) next to the items currently visible. Pending additions and
//! deletions are derived from the two on demand, so an item removed and then
//! re-added unchanged within one window produces no diff at all, and a key can
//! never be pending in both directions.

use super::properties::PropertyItem;
use crate::error::{DsmsError, Result};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedList<T: PropertyItem> {
    items: Vec<T>,
    baseline: Vec<T>,
}

impl<T: PropertyItem> Default for TrackedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PropertyItem> TrackedList<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            baseline: Vec::new(),
        }
    }

    /// List whose contents are already known to the server
    pub fn synced(items: Vec<T>) -> Self {
        Self {
            baseline: items.clone(),
            items,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.items.iter().find(|item| &item.key() == key)
    }

    pub fn contains_key(&self, key: &T::Key) -> bool {
        self.position(key).is_some()
    }

    fn position(&self, key: &T::Key) -> Option<usize> {
        self.items.iter().position(|item| &item.key() == key)
    }

    /// Shape checks, plus the addition checks unless the server already
    /// holds this exact item
    fn check(&self, item: &T) -> Result<()> {
        item.validate()?;
        if !self.baseline.contains(item) {
            item.validate_addition()?;
        }
        Ok(())
    }

    /// Append an item. Returns `false` without touching the list when an item
    /// with the same key is already present.
    pub fn push(&mut self, item: T) -> Result<bool> {
        self.check(&item)?;
        if self.contains_key(&item.key()) {
            return Ok(false);
        }
        check_conflicts(&item, &self.items)?;
        self.items.push(item);
        Ok(true)
    }

    /// Append an item or replace the one sharing its key in place
    pub fn upsert(&mut self, item: T) -> Result<()> {
        self.check(&item)?;
        check_conflicts(&item, &self.items)?;
        match self.position(&item.key()) {
            Some(index) => self.items[index] = item,
            None => self.items.push(item),
        }
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<T> {
        if index >= self.items.len() {
            return Err(DsmsError::NotFound(format!(
                "{} index {} out of range (len {})",
                T::SLOT,
                index,
                self.items.len()
            )));
        }
        Ok(self.items.remove(index))
    }

    pub fn remove_key(&mut self, key: &T::Key) -> Result<T> {
        self.discard(key)
            .ok_or_else(|| DsmsError::NotFound(format!("{} `{}`", T::SLOT, key)))
    }

    pub fn remove_item(&mut self, item: &T) -> Result<T> {
        self.remove_key(&item.key())
    }

    /// Remove by key, doing nothing when the key is absent
    pub fn discard(&mut self, key: &T::Key) -> Option<T> {
        self.position(key).map(|index| self.items.remove(index))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Replace the whole slot. Every item is validated before anything changes.
    pub fn assign(&mut self, items: impl IntoIterator<Item = T>) -> Result<()> {
        let items: Vec<T> = items.into_iter().collect();
        let mut seen = BTreeSet::new();
        for (index, item) in items.iter().enumerate() {
            self.check(item)?;
            if !seen.insert(item.key()) {
                return Err(DsmsError::validation(
                    T::SLOT,
                    format!("duplicate entry `{}`", item.key()),
                ));
            }
            check_conflicts(item, &items[..index])?;
        }
        self.items = items;
        Ok(())
    }

    /// Items that are new or changed since the last sync
    pub fn pending_additions(&self) -> Vec<T> {
        self.items
            .iter()
            .filter(|item| !self.baseline.contains(item))
            .cloned()
            .collect()
    }

    /// Baseline items whose key is no longer present
    pub fn pending_deletions(&self) -> Vec<T> {
        self.baseline
            .iter()
            .filter(|item| !self.contains_key(&item.key()))
            .cloned()
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending_additions().is_empty() || !self.pending_deletions().is_empty()
    }

    /// Adopt the visible contents as the new baseline
    pub fn mark_synced(&mut self) {
        self.baseline = self.items.clone();
    }

    /// Record that the server accepted the current item under `key`
    pub fn confirm_addition(&mut self, key: &T::Key) {
        let Some(item) = self.get(key).cloned() else {
            return;
        };
        match self.baseline.iter().position(|b| &b.key() == key) {
            Some(index) => self.baseline[index] = item,
            None => self.baseline.push(item),
        }
    }

    /// Record that the server dropped the item under `key`
    pub fn confirm_deletion(&mut self, key: &T::Key) {
        self.baseline.retain(|item| &item.key() != key);
    }

    /// Drop local changes and return to the baseline
    pub fn reset(&mut self) {
        self.items = self.baseline.clone();
    }
}

fn check_conflicts<T: PropertyItem>(item: &T, others: &[T]) -> Result<()> {
    let key = item.key();
    for other in others.iter().filter(|other| other.key() != key) {
        if let Some(reason) = item.conflict(other) {
            return Err(DsmsError::validation(T::SLOT, reason));
        }
    }
    Ok(())
}

impl<'a, T: PropertyItem> IntoIterator for &'a TrackedList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
