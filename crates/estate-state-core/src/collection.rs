use serde::Serialize;
use serde_json::Value;

use crate::records::{decode, Entity, Record};
use crate::{RecordId, StateError};

/// Insertion-ordered records of a single entity type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Collection<T> {
    items: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Entity> Collection<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn get_mut(&mut self, id: &RecordId) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    /// Append a new record at the end of the collection.
    ///
    /// # Errors
    /// Returns an error when the id is blank or already present in this collection.
    pub fn insert(&mut self, record: T) -> Result<(), StateError> {
        if record.id().is_blank() {
            return Err(StateError::Validation(format!(
                "record in {} must carry a non-empty id",
                T::COLLECTION
            )));
        }
        if self.contains(record.id()) {
            return Err(StateError::DuplicateId {
                collection: T::COLLECTION,
                id: record.id().clone(),
            });
        }
        self.items.push(record);
        Ok(())
    }

    /// Replace the record with the same id in place, or append it.
    ///
    /// # Errors
    /// Returns an error when the id is blank.
    pub fn upsert(&mut self, record: T) -> Result<(), StateError> {
        if record.id().is_blank() {
            return Err(StateError::Validation(format!(
                "record in {} must carry a non-empty id",
                T::COLLECTION
            )));
        }
        match self.items.iter_mut().find(|item| item.id() == record.id()) {
            Some(slot) => *slot = record,
            None => self.items.push(record),
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<T> {
        let position = self.items.iter().position(|item| item.id() == id)?;
        Some(self.items.remove(position))
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn last(&self) -> Option<&T> {
        self.items.last()
    }
}

impl<'a, T> IntoIterator for &'a Collection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Collection operations that do not depend on the record type.
pub(crate) trait ErasedCollection {
    fn count(&self) -> usize;

    fn ids(&self) -> Vec<&RecordId>;

    fn records(&self) -> Vec<Record>;

    fn to_values(&self) -> Result<Vec<Value>, StateError>;

    fn replace_from_values(&mut self, values: Vec<Value>) -> Result<(), StateError>;

    fn clear(&mut self);
}

impl<T: Entity> ErasedCollection for Collection<T> {
    fn count(&self) -> usize {
        self.items.len()
    }

    fn ids(&self) -> Vec<&RecordId> {
        self.items.iter().map(Entity::id).collect()
    }

    fn records(&self) -> Vec<Record> {
        self.items.iter().cloned().map(Entity::into_record).collect()
    }

    fn to_values(&self) -> Result<Vec<Value>, StateError> {
        self.items
            .iter()
            .map(|item| {
                serde_json::to_value(item).map_err(|err| StateError::Decode {
                    key: T::COLLECTION.as_str().to_string(),
                    message: err.to_string(),
                })
            })
            .collect()
    }

    fn replace_from_values(&mut self, values: Vec<Value>) -> Result<(), StateError> {
        let mut replacement = Self::new();
        for value in values {
            replacement.insert(decode::<T>(value)?)?;
        }
        *self = replacement;
        Ok(())
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}
