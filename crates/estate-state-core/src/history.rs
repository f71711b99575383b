use std::collections::VecDeque;

use crate::document::DocumentStore;
use crate::StateError;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Bounded linear stack of whole-store snapshots.
///
/// Each committed mutation records the state it produced, so the live store always equals
/// `entries[index]` until the next commit. Recording after an undo discards the redo branch;
/// once the stack is full the oldest snapshot is evicted.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<DocumentStore>,
    index: Option<usize>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl History {
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity), index: None, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the live snapshot, `None` before the first commit.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    #[must_use]
    pub fn entry(&self, position: usize) -> Option<&DocumentStore> {
        self.entries.get(position)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.index.is_some_and(|index| index > 0)
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.index.is_some_and(|index| index + 1 < self.entries.len())
    }

    /// Push a copy of `state` as the newest entry, dropping any redo tail and evicting the
    /// oldest entry past capacity.
    ///
    /// Callers record the state *after* each committed change rather than before it, so the
    /// live store always equals the current entry. The first recorded state is therefore
    /// the floor: undo never goes back past the first change made in this session.
    pub fn record(&mut self, state: &DocumentStore) {
        let keep = self.index.map_or(0, |index| index + 1);
        self.entries.truncate(keep);
        self.entries.push_back(state.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.index = Some(self.entries.len() - 1);
    }

    /// Step back one snapshot and return a copy of it.
    ///
    /// Returns `Ok(None)` when there is nothing to undo.
    ///
    /// # Errors
    /// Returns an error when the target snapshot fails validation; the stack and index are
    /// left unchanged.
    pub fn undo(&mut self) -> Result<Option<DocumentStore>, StateError> {
        match self.index {
            Some(index) if index > 0 => self.step_to(index - 1).map(Some),
            _ => Ok(None),
        }
    }

    /// Step forward one snapshot and return a copy of it.
    ///
    /// Returns `Ok(None)` when there is nothing to redo.
    ///
    /// # Errors
    /// Returns an error when the target snapshot fails validation; the stack and index are
    /// left unchanged.
    pub fn redo(&mut self) -> Result<Option<DocumentStore>, StateError> {
        match self.index {
            Some(index) if index + 1 < self.entries.len() => self.step_to(index + 1).map(Some),
            _ => Ok(None),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index = None;
    }

    fn step_to(&mut self, target: usize) -> Result<DocumentStore, StateError> {
        let snapshot = self
            .entries
            .get(target)
            .cloned()
            .ok_or_else(|| StateError::Validation(format!("history entry {target} is missing")))?;
        snapshot.validate()?;
        self.index = Some(target);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::records::{Customer, Unit};
    use crate::RecordId;

    fn mutate(store: &mut DocumentStore, step: usize) {
        if let Err(err) = store.insert(Customer::new(format!("customer {step}"))) {
            panic!("insert should succeed: {err}");
        }
    }

    fn committed(count: usize, capacity: usize) -> (DocumentStore, History) {
        let mut live = DocumentStore::initialize_default();
        let mut history = History::new(capacity);
        for step in 0..count {
            mutate(&mut live, step);
            history.record(&live);
        }
        (live, history)
    }

    #[test]
    fn empty_history_cannot_move() {
        let mut history = History::default();
        assert_eq!(history.index(), None);
        assert!(!history.can_undo());
        assert!(!history.can_redo());
        assert!(matches!(history.undo(), Ok(None)));
        assert!(matches!(history.redo(), Ok(None)));
    }

    #[test]
    fn first_recorded_state_is_the_undo_floor() -> Result<(), StateError> {
        let (_, mut history) = committed(1, DEFAULT_HISTORY_CAPACITY);
        assert!(!history.can_undo());
        assert_eq!(history.undo()?, None);

        let first = history.entry(0).cloned();
        let mut live = first.clone().unwrap_or_default();
        mutate(&mut live, 1);
        history.record(&live);
        assert_eq!(history.undo()?, first);
        assert!(!history.can_undo());
        Ok(())
    }

    #[test]
    fn sixty_commits_keep_the_newest_fifty() {
        let (live, mut history) = committed(60, DEFAULT_HISTORY_CAPACITY);
        assert_eq!(history.len(), 50);
        assert_eq!(history.index(), Some(49));
        assert_eq!(history.entry(49), Some(&live));
        assert_eq!(history.entry(0).map(DocumentStore::total_records), Some(11));

        let mut undone = 0;
        while let Ok(Some(_)) = history.undo() {
            undone += 1;
        }
        assert_eq!(undone, 49);
        assert_eq!(history.index(), Some(0));
    }

    #[test]
    fn commit_after_undo_prunes_redo_branch() {
        let (mut live, mut history) = committed(5, DEFAULT_HISTORY_CAPACITY);
        for _ in 0..2 {
            live = match history.undo() {
                Ok(Some(snapshot)) => snapshot,
                other => panic!("undo should move back: {other:?}"),
            };
        }
        assert!(history.can_redo());

        mutate(&mut live, 99);
        history.record(&live);
        assert_eq!(history.len(), 4);
        assert_eq!(history.index(), Some(3));
        assert!(!history.can_redo());
        assert!(matches!(history.redo(), Ok(None)));
    }

    #[test]
    fn malformed_entry_leaves_history_unchanged() {
        let (_, mut history) = committed(2, DEFAULT_HISTORY_CAPACITY);
        let mut broken = match history.entry(1) {
            Some(entry) => entry.clone(),
            None => panic!("entry 1 should exist"),
        };
        let shared = broken.collection::<Customer>().iter().map(|c| c.id.clone()).next();
        let mut clash = Unit::new("A-101");
        clash.id = shared.unwrap_or_else(|| RecordId::from("C1"));
        if let Err(err) = broken.collection_mut::<Unit>().upsert(clash) {
            panic!("raw upsert should succeed: {err}");
        }
        history.record(&broken);
        assert_eq!(history.index(), Some(2));

        assert!(matches!(history.undo(), Ok(Some(_))));
        assert_eq!(history.index(), Some(1));
        assert!(matches!(history.redo(), Err(StateError::DuplicateId { .. })));
        assert_eq!(history.index(), Some(1));
        assert_eq!(history.len(), 3);
        assert!(history.can_redo());
    }

    proptest! {
        #[test]
        fn property_undo_walks_back_through_recorded_states(n in 1usize..=50, k_seed in any::<usize>()) {
            let (_, mut history) = committed(n, DEFAULT_HISTORY_CAPACITY);
            prop_assert_eq!(history.len(), n);
            prop_assert_eq!(history.index(), Some(n - 1));

            let k = k_seed % n;
            let mut live = None;
            for _ in 0..k {
                live = history.undo().ok().flatten();
            }
            prop_assert_eq!(history.index(), Some(n - 1 - k));
            if let Some(live) = live {
                prop_assert_eq!(Some(&live), history.entry(n - 1 - k));
            }
        }

        #[test]
        fn property_undo_redo_round_trip_is_stable(n in 2usize..=20, rounds in 1usize..8) {
            let (_, mut history) = committed(n, DEFAULT_HISTORY_CAPACITY);
            let first = history.undo().ok().flatten();
            prop_assert!(first.is_some());
            for _ in 0..rounds {
                prop_assert!(history.redo().ok().flatten().is_some());
                let again = history.undo().ok().flatten();
                prop_assert_eq!(&again, &first);
            }
        }
    }
}
