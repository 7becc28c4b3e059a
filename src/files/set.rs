//! The multi-peer file index.
//!
//! Tracks what every peer (slot 0 being the local repository) claims to
//! hold, a derived newest-version-wins global view, and per-name peer
//! availability. Records are shared between slots through reference-counted
//! entries keyed by (name, version); an entry is dropped the instant no slot
//! references it.
//!
//! `set_local` synthesizes tombstones for names that disappear between
//! scans. `add_local` assigns versions to records carrying the zero
//! sentinel. The remote operations never rewrite the records they are given.

use std::collections::{HashMap, HashSet};

use crate::cid::{LOCAL_ID, MAX_SLOTS};
use crate::files::{FileFlags, FileRecord, Key};

struct Entry {
    usage: usize,
    file: FileRecord,
}

pub struct Set {
    files: HashMap<Key, Entry>,
    per_peer: [HashMap<String, Key>; MAX_SLOTS],
    global_key: HashMap<String, Key>,
    global_avail: HashMap<String, u64>,
    changes: u64,
}

fn assert_remote_slot(slot: u32) {
    assert!(
        (1..MAX_SLOTS as u32).contains(&slot),
        "connection ID must be in the range 1 - {} inclusive",
        MAX_SLOTS - 1
    );
}

impl Set {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            per_peer: std::array::from_fn(|_| HashMap::new()),
            global_key: HashMap::new(),
            global_avail: HashMap::new(),
            changes: 0,
        }
    }

    /// Installs `files` as the local index. Names previously present locally
    /// but missing from `files` are re-added as tombstones: deleted flag set,
    /// blocks cleared, size zero, version bumped by one.
    pub fn set_local(&mut self, mut files: Vec<FileRecord>) {
        let present: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();

        let mut tombstones = Vec::new();
        for key in self.per_peer[LOCAL_ID as usize].values() {
            if !present.contains(key.name.as_str()) {
                let mut record = self.files[key].file.clone();
                record.flags = FileFlags::DELETED;
                record.blocks = Vec::new();
                record.size = 0;
                record.version += 1;
                tombstones.push(record);
            }
        }
        files.extend(tombstones);

        self.set_local_no_delete(files);
    }

    /// Same as [`Set::set_local`] without tombstone synthesis. Used when
    /// seeding from a persisted index at startup.
    pub fn set_local_no_delete(&mut self, files: Vec<FileRecord>) {
        let files = self.assign_versions(files);
        self.set_slot(LOCAL_ID, files);
    }

    /// Incremental local update. Records carrying the version-zero sentinel
    /// are stored at the current local version for that name plus one.
    pub fn add_local(&mut self, files: Vec<FileRecord>) {
        let files = self.assign_versions(files);
        self.add_slot(LOCAL_ID, files);
    }

    pub fn add_remote(&mut self, slot: u32, files: Vec<FileRecord>) {
        assert_remote_slot(slot);
        self.add_slot(slot, files);
    }

    pub fn set_remote(&mut self, slot: u32, files: Vec<FileRecord>) {
        assert_remote_slot(slot);
        self.set_slot(slot, files);
    }

    /// Records of globally-newest keys that `slot` is missing or holds an
    /// older version of.
    pub fn need(&self, slot: u32) -> Vec<FileRecord> {
        let peer = &self.per_peer[slot as usize];
        let mut out = Vec::new();
        for (name, gk) in &self.global_key {
            let held = peer.get(name).map_or(0, |k| k.version);
            if gk.version > held {
                out.push(self.files[gk].file.clone());
            }
        }
        out
    }

    /// Records currently indexed under `slot`.
    pub fn have(&self, slot: u32) -> Vec<FileRecord> {
        self.per_peer[slot as usize]
            .values()
            .map(|k| self.files[k].file.clone())
            .collect()
    }

    /// Records of all globally-newest keys.
    pub fn global(&self) -> Vec<FileRecord> {
        self.global_key
            .values()
            .map(|k| self.files[k].file.clone())
            .collect()
    }

    /// The record `slot` holds for `name`, or the zero record.
    pub fn get(&self, slot: u32, name: &str) -> FileRecord {
        match self.per_peer[slot as usize].get(name) {
            Some(k) => self.files[k].file.clone(),
            None => FileRecord::default(),
        }
    }

    /// The globally-newest record for `name`, or the zero record.
    pub fn get_global(&self, name: &str) -> FileRecord {
        match self.global_key.get(name) {
            Some(k) => self.files[k].file.clone(),
            None => FileRecord::default(),
        }
    }

    /// Bitset of slots advertising the globally-newest key for `name`.
    pub fn availability(&self, name: &str) -> u64 {
        self.global_avail.get(name).copied().unwrap_or(0)
    }

    /// Monotonic counter bumped on every structural change; gates index
    /// broadcast.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Number of distinct (name, version) records currently resident.
    pub fn record_count(&self) -> usize {
        self.files.len()
    }

    /// Rewrites the version-zero sentinel to current-local-version + 1. A
    /// name the local slot has never seen starts at version 1.
    fn assign_versions(&self, mut files: Vec<FileRecord>) -> Vec<FileRecord> {
        for f in &mut files {
            if f.version == 0 {
                let current = self.per_peer[LOCAL_ID as usize]
                    .get(&f.name)
                    .map_or(0, |k| k.version);
                f.version = current + 1;
            }
        }
        files
    }

    fn add_slot(&mut self, slot: u32, files: Vec<FileRecord>) {
        if self.insert_records(slot, files) {
            self.changes += 1;
        }
    }

    fn set_slot(&mut self, slot: u32, files: Vec<FileRecord>) {
        let old = std::mem::take(&mut self.per_peer[slot as usize]);

        // Drop usage for everything the slot referenced; entries leave the
        // store the instant their usage hits zero.
        for key in old.values() {
            if let Some(entry) = self.files.get_mut(key) {
                if entry.usage <= 1 {
                    self.files.remove(key);
                } else {
                    entry.usage -= 1;
                }
            }
        }

        // Recompute the global winner for every tracked name over the
        // remaining slots.
        let names: Vec<String> = self.global_key.keys().cloned().collect();
        for name in names {
            let mut newest = Key::default();
            let mut avail: u64 = 0;

            for (i, peer) in self.per_peer.iter().enumerate() {
                if let Some(k) = peer.get(&name) {
                    if *k == newest {
                        avail |= 1 << i;
                    } else if k.newer_than(&newest) {
                        newest = k.clone();
                        avail = 1 << i;
                    }
                }
            }

            if avail != 0 {
                self.global_key.insert(name.clone(), newest);
                self.global_avail.insert(name, avail);
            } else {
                self.global_key.remove(&name);
                self.global_avail.remove(&name);
            }
        }

        self.insert_records(slot, files);

        if self.per_peer[slot as usize] != old {
            self.changes += 1;
        }
    }

    /// Installs `files` under `slot` and folds each one into the global
    /// view. Returns whether anything actually changed.
    fn insert_records(&mut self, slot: u32, files: Vec<FileRecord>) -> bool {
        let mut changed = false;

        for f in files {
            let fk = Key::of(&f);
            let name = f.name.clone();

            if self.per_peer[slot as usize].get(&name) == Some(&fk) {
                // The slot already has exactly this version.
                continue;
            }
            changed = true;

            if let Some(ck) = self.per_peer[slot as usize].insert(name.clone(), fk.clone()) {
                if let Some(entry) = self.files.get_mut(&ck) {
                    if entry.usage <= 1 {
                        self.files.remove(&ck);
                    } else {
                        entry.usage -= 1;
                    }
                }
            }

            match self.files.get_mut(&fk) {
                Some(entry) => entry.usage += 1,
                None => {
                    self.files.insert(fk.clone(), Entry { usage: 1, file: f });
                }
            }

            match self.global_key.get(&name) {
                Some(gk) if *gk == fk => {
                    *self.global_avail.entry(name).or_insert(0) |= 1 << slot;
                }
                Some(gk) if fk.newer_than(gk) => {
                    self.global_key.insert(name.clone(), fk);
                    self.global_avail.insert(name, 1 << slot);
                }
                None => {
                    self.global_key.insert(name.clone(), fk);
                    self.global_avail.insert(name, 1 << slot);
                }
                _ => {}
            }
        }

        changed
    }
}

impl Default for Set {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: u32) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            version,
            ..Default::default()
        }
    }

    fn sorted(mut files: Vec<FileRecord>) -> Vec<FileRecord> {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    #[test]
    fn test_global_merge() {
        let mut m = Set::new();

        let local = vec![
            record("a", 1000),
            record("b", 1000),
            record("c", 1000),
            record("d", 1000),
        ];
        let remote = vec![
            record("a", 1000),
            record("b", 1001),
            record("c", 1002),
            record("e", 1000),
        ];

        m.set_local(local);
        m.set_remote(1, remote);

        let expected = vec![
            record("a", 1000),
            record("b", 1001),
            record("c", 1002),
            record("d", 1000),
            record("e", 1000),
        ];
        assert_eq!(sorted(m.global()), expected);
        assert_eq!(m.record_count(), 7);
    }

    #[test]
    fn test_local_deleted() {
        let mut m = Set::new();

        let local1 = vec![
            record("a", 1000),
            record("b", 1000),
            record("c", 1000),
            record("d", 1000),
        ];
        let local2 = vec![local1[1].clone(), local1[3].clone()];

        m.set_local(local1.clone());
        m.set_local(local2);

        let tombstone = |name: &str| FileRecord {
            name: name.to_string(),
            version: 1001,
            flags: FileFlags::DELETED,
            ..Default::default()
        };
        let expected = vec![
            tombstone("a"),
            record("b", 1000),
            tombstone("c"),
            record("d", 1000),
        ];
        assert_eq!(sorted(m.global()), expected);

        // Reintroducing a deleted name lands strictly above the tombstone.
        m.set_local(vec![
            record("a", 1002),
            record("b", 1000),
            record("d", 1000),
        ]);
        assert_eq!(m.get(LOCAL_ID, "a"), record("a", 1002));
        assert!(m.get(LOCAL_ID, "c").is_deleted());
    }

    #[test]
    fn test_remote_reset() {
        let mut m = Set::new();

        let local = vec![
            record("a", 1000),
            record("b", 1000),
            record("c", 1000),
            record("d", 1000),
        ];
        let remote = vec![
            record("a", 1000),
            record("b", 1001),
            record("c", 1002),
            record("e", 1000),
        ];

        m.set_local(local.clone());
        m.set_remote(1, remote);
        m.set_remote(1, Vec::new());

        assert_eq!(sorted(m.global()), local);
        assert_eq!(m.record_count(), 4);
        for f in &local {
            assert_eq!(m.availability(&f.name), 1 << LOCAL_ID);
        }
        assert_eq!(m.availability("e"), 0);
    }

    #[test]
    fn test_need() {
        let mut m = Set::new();

        m.set_local(vec![
            record("a", 1000),
            record("b", 1000),
            record("c", 1000),
            record("d", 1000),
        ]);
        m.set_remote(
            1,
            vec![
                record("a", 1000),
                record("b", 1001),
                record("c", 1002),
                record("e", 1000),
            ],
        );

        let expected = vec![record("b", 1001), record("c", 1002), record("e", 1000)];
        assert_eq!(sorted(m.need(LOCAL_ID)), expected);
        assert!(m.need(1).is_empty());
    }

    #[test]
    fn test_availability_tracks_holders() {
        let mut m = Set::new();

        m.set_remote(1, vec![record("a", 1000)]);
        assert_eq!(m.availability("a"), 1 << 1);

        // A second slot at the same key adds its bit.
        m.set_remote(2, vec![record("a", 1000)]);
        assert_eq!(m.availability("a"), (1 << 1) | (1 << 2));

        // A newer key resets availability to the single new holder.
        m.add_remote(2, vec![record("a", 1001)]);
        assert_eq!(m.availability("a"), 1 << 2);
        assert_eq!(m.get_global("a"), record("a", 1001));

        // The first slot catching up joins the set again.
        m.add_remote(1, vec![record("a", 1001)]);
        assert_eq!(m.availability("a"), (1 << 1) | (1 << 2));
    }

    #[test]
    fn test_usage_accounting_drops_unreferenced_records() {
        let mut m = Set::new();

        m.set_remote(1, vec![record("a", 1000), record("b", 1000)]);
        m.set_remote(2, vec![record("a", 1000)]);
        assert_eq!(m.record_count(), 2);

        // Slot 2 moving on releases its reference but "a@1000" survives via
        // slot 1.
        m.set_remote(2, vec![record("a", 1001)]);
        assert_eq!(m.record_count(), 3);

        // Slot 1 leaving drops both of its records.
        m.set_remote(1, Vec::new());
        assert_eq!(m.record_count(), 1);
        assert_eq!(m.get_global("a"), record("a", 1001));
        assert_eq!(m.availability("b"), 0);
    }

    #[test]
    fn test_incremental_update_replaces_held_version() {
        let mut m = Set::new();

        m.set_remote(1, vec![record("a", 1000)]);
        m.add_remote(1, vec![record("a", 1001)]);

        // The slot holds exactly one version and the old record is gone.
        assert_eq!(m.get(1, "a"), record("a", 1001));
        assert_eq!(m.record_count(), 1);
    }

    #[test]
    fn test_add_local_versioning() {
        let mut m = Set::new();

        // Zero-version records get current + 1; a fresh name starts at 1.
        m.add_local(vec![record("new", 0)]);
        assert_eq!(m.get(LOCAL_ID, "new").version, 1);

        m.set_local(vec![record("a", 1000)]);
        m.add_local(vec![record("a", 0)]);
        assert_eq!(m.get(LOCAL_ID, "a").version, 1001);

        // Nonzero versions are preserved verbatim.
        m.add_local(vec![record("a", 2000)]);
        assert_eq!(m.get(LOCAL_ID, "a").version, 2000);
    }

    #[test]
    fn test_changes_counter_gates_on_real_change() {
        let mut m = Set::new();

        let c0 = m.changes();
        m.set_local(vec![record("a", 1000)]);
        let c1 = m.changes();
        assert!(c1 > c0);

        // Replacing the local index with identical content is not a change.
        m.set_local(vec![record("a", 1000)]);
        assert_eq!(m.changes(), c1);

        // Neither is re-adding the version a slot already holds.
        m.add_remote(1, vec![record("a", 1000)]);
        let c2 = m.changes();
        m.add_remote(1, vec![record("a", 1000)]);
        assert_eq!(m.changes(), c2);
    }

    #[test]
    #[should_panic(expected = "connection ID must be in the range")]
    fn test_remote_slot_zero_panics() {
        let mut m = Set::new();
        m.set_remote(0, Vec::new());
    }

    #[test]
    #[should_panic(expected = "connection ID must be in the range")]
    fn test_remote_slot_out_of_range_panics() {
        let mut m = Set::new();
        m.add_remote(64, Vec::new());
    }
}
