//! Entry-level merge of two divergent copies of a database.
//!
//! There is no stored common ancestor, so the merge is decided by presence
//! and field equality alone:
//!
//! | local | remote | result |
//! |-------|--------|--------|
//! | present | absent | keep local |
//! | absent | present | adopt remote |
//! | equal | equal | keep local |
//! | differs | differs | [`EntryConflict`], needs an [`EntryChoice`] |
//!
//! Entries are matched by [`EntryKey`]. Database timestamps never decide
//! anything.

use crate::error::{SyncError, SyncResult};
use safesync_storage::{Entry, EntryKey};
use std::collections::{HashMap, VecDeque};

/// Which side of a conflicting entry to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryChoice {
    /// Keep the local version.
    KeepLocal,
    /// Keep the remote version.
    KeepRemote,
}

/// An entry present on both sides with different fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryConflict {
    /// Join key.
    pub key: EntryKey,
    /// Local version.
    pub local: Entry,
    /// Remote version.
    pub remote: Entry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Keep(Entry),
    Conflict(usize),
}

/// The outcome of comparing two entry lists, plus the user's choices.
#[derive(Debug, Clone)]
pub struct MergePlan {
    slots: Vec<Slot>,
    conflicts: Vec<EntryConflict>,
    choices: Vec<Option<EntryChoice>>,
    adopted: usize,
}

impl MergePlan {
    /// Compares local and remote entries.
    ///
    /// Entries with the same key are paired in order of appearance, so
    /// duplicate keys on one side never swallow entries of the other.
    pub fn new(local: &[Entry], remote: &[Entry]) -> Self {
        let mut remote_by_key: HashMap<EntryKey, VecDeque<usize>> = HashMap::new();
        for (i, entry) in remote.iter().enumerate() {
            remote_by_key.entry(entry.key()).or_default().push_back(i);
        }

        let mut matched = vec![false; remote.len()];
        let mut slots = Vec::with_capacity(local.len() + remote.len());
        let mut conflicts = Vec::new();

        for entry in local {
            let key = entry.key();
            let pair = remote_by_key.get_mut(&key).and_then(VecDeque::pop_front);
            match pair {
                Some(ri) => {
                    matched[ri] = true;
                    if remote[ri] == *entry {
                        slots.push(Slot::Keep(entry.clone()));
                    } else {
                        slots.push(Slot::Conflict(conflicts.len()));
                        conflicts.push(EntryConflict {
                            key,
                            local: entry.clone(),
                            remote: remote[ri].clone(),
                        });
                    }
                }
                None => slots.push(Slot::Keep(entry.clone())),
            }
        }

        let mut adopted = 0;
        for (entry, _) in remote.iter().zip(&matched).filter(|(_, m)| !**m) {
            slots.push(Slot::Keep(entry.clone()));
            adopted += 1;
        }

        let choices = vec![None; conflicts.len()];
        Self {
            slots,
            conflicts,
            choices,
            adopted,
        }
    }

    /// Returns true if `other` was computed from the same two entry lists,
    /// whatever choices either plan holds.
    pub fn same_basis(&self, other: &MergePlan) -> bool {
        self.adopted == other.adopted
            && self.slots == other.slots
            && self.conflicts == other.conflicts
    }

    /// Returns all conflicts, in local order.
    pub fn conflicts(&self) -> &[EntryConflict] {
        &self.conflicts
    }

    /// Returns the number of remote-only entries that will be adopted.
    pub fn adopted_count(&self) -> usize {
        self.adopted
    }

    /// Records the choice for a conflicting entry.
    ///
    /// Returns false if `key` is not in conflict.
    pub fn choose(&mut self, key: &EntryKey, choice: EntryChoice) -> bool {
        let mut found = false;
        for (conflict, slot) in self.conflicts.iter().zip(self.choices.iter_mut()) {
            if &conflict.key == key {
                *slot = Some(choice);
                found = true;
            }
        }
        found
    }

    /// Applies the same choice to every conflict.
    pub fn choose_all(&mut self, choice: EntryChoice) {
        for slot in &mut self.choices {
            *slot = Some(choice);
        }
    }

    /// Returns the keys of conflicts without a choice.
    pub fn unresolved(&self) -> Vec<EntryKey> {
        self.conflicts
            .iter()
            .zip(&self.choices)
            .filter(|(_, choice)| choice.is_none())
            .map(|(conflict, _)| conflict.key.clone())
            .collect()
    }

    /// Returns true if every conflict has a choice.
    pub fn is_complete(&self) -> bool {
        self.choices.iter().all(Option::is_some)
    }

    /// Produces the merged entry list: local order with chosen versions in
    /// place, then remote-only entries in remote order.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MergeIncomplete`] listing the unresolved keys.
    pub fn merged_entries(&self) -> SyncResult<Vec<Entry>> {
        let unresolved = self.unresolved();
        if !unresolved.is_empty() {
            return Err(SyncError::MergeIncomplete {
                unresolved: unresolved.iter().map(ToString::to_string).collect(),
            });
        }

        let mut merged = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let entry = match slot {
                Slot::Keep(entry) => entry,
                Slot::Conflict(i) => match self.choices[*i] {
                    Some(EntryChoice::KeepRemote) => &self.conflicts[*i].remote,
                    _ => &self.conflicts[*i].local,
                },
            };
            merged.push(entry.clone());
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn legacy(title: &str, user: &str, password: &str) -> Entry {
        Entry {
            title: title.into(),
            user: user.into(),
            password: password.into(),
            ..Entry::default()
        }
    }

    #[test]
    fn disjoint_additions_are_combined() {
        let local = vec![Entry::new("mail", "alice", "a")];
        let remote = vec![Entry::new("bank", "alice", "b")];

        let plan = MergePlan::new(&local, &remote);
        assert!(plan.is_complete());
        assert_eq!(plan.adopted_count(), 1);

        let merged = plan.merged_entries().unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], local[0]);
        assert_eq!(merged[1], remote[0]);
    }

    #[test]
    fn basis_ignores_choices_but_not_entries() {
        let local = vec![Entry::new("mail", "alice", "a")];
        let mut changed = local[0].clone();
        changed.password = "b".into();
        let remote = vec![changed];

        let plan = MergePlan::new(&local, &remote);
        let mut chosen = plan.clone();
        chosen.choose_all(EntryChoice::KeepRemote);
        assert!(plan.same_basis(&chosen));

        assert!(!plan.same_basis(&MergePlan::new(&[], &[])));
        assert!(!plan.same_basis(&MergePlan::new(&local, &local)));
    }

    #[test]
    fn identical_entries_kept_once() {
        let shared = Entry::new("mail", "alice", "a");
        let plan = MergePlan::new(&[shared.clone()], &[shared.clone()]);

        assert!(plan.conflicts().is_empty());
        assert_eq!(plan.merged_entries().unwrap(), vec![shared]);
    }

    #[test]
    fn differing_password_is_a_conflict() {
        let local = Entry::new("mail", "alice", "local-pw");
        let mut remote = local.clone();
        remote.password = "remote-pw".into();

        let mut plan = MergePlan::new(&[local.clone()], &[remote.clone()]);
        assert_eq!(plan.conflicts().len(), 1);
        assert_eq!(plan.unresolved(), vec![local.key()]);

        match plan.merged_entries() {
            Err(SyncError::MergeIncomplete { unresolved }) => {
                assert_eq!(unresolved, vec![local.key().to_string()]);
            }
            other => panic!("expected MergeIncomplete, got {other:?}"),
        }

        assert!(plan.choose(&local.key(), EntryChoice::KeepRemote));
        assert_eq!(plan.merged_entries().unwrap(), vec![remote]);
    }

    #[test]
    fn choose_unknown_key_is_rejected() {
        let mut plan = MergePlan::new(&[], &[]);
        assert!(!plan.choose(&Entry::new("x", "y", "z").key(), EntryChoice::KeepLocal));
    }

    #[test]
    fn chosen_version_stays_in_local_position() {
        let first = Entry::new("a", "u", "1");
        let second = Entry::new("b", "u", "2");
        let mut changed = second.clone();
        changed.notes = "remote note".into();
        let remote_only = Entry::new("c", "u", "3");

        let local = vec![first.clone(), second.clone()];
        let remote = vec![remote_only.clone(), changed.clone(), first.clone()];

        let mut plan = MergePlan::new(&local, &remote);
        plan.choose_all(EntryChoice::KeepRemote);

        assert_eq!(
            plan.merged_entries().unwrap(),
            vec![first, changed, remote_only]
        );
    }

    #[test]
    fn legacy_entries_match_by_title_and_user() {
        let local = vec![legacy("bank", "bob", "1")];
        let remote = vec![legacy("bank", "bob", "2"), legacy("bank", "carol", "3")];

        let plan = MergePlan::new(&local, &remote);
        assert_eq!(plan.conflicts().len(), 1);
        assert_eq!(plan.adopted_count(), 1);
    }

    #[test]
    fn duplicate_keys_pair_in_order() {
        let local = vec![legacy("bank", "bob", "1")];
        let remote = vec![legacy("bank", "bob", "1"), legacy("bank", "bob", "9")];

        let plan = MergePlan::new(&local, &remote);
        assert!(plan.conflicts().is_empty());
        assert_eq!(plan.merged_entries().unwrap().len(), 2);
    }

    fn entries(prefix: &'static str, n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| Entry::new(format!("{prefix}{i}"), "user", "pw"))
            .collect()
    }

    proptest! {
        #[test]
        fn disjoint_merge_has_no_duplicates(
            local_n in 0usize..20,
            remote_n in 0usize..20,
            shared_n in 0usize..10,
        ) {
            let shared = entries("shared", shared_n);
            let mut local = entries("local", local_n);
            let mut remote = entries("remote", remote_n);
            local.extend(shared.iter().cloned());
            remote.extend(shared.iter().cloned());

            let plan = MergePlan::new(&local, &remote);
            prop_assert!(plan.is_complete());

            let merged = plan.merged_entries().unwrap();
            prop_assert_eq!(merged.len(), local_n + remote_n + shared_n);

            let keys: HashSet<_> = merged.iter().map(Entry::key).collect();
            prop_assert_eq!(keys.len(), merged.len());
        }
    }
}
