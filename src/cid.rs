//! Mapping between stable node names and dense connection IDs.
//!
//! Connection IDs index into the 64-bit availability bitset, so they must be
//! small integers and must be reused after a peer disconnects.

use std::collections::HashMap;

/// Connection ID reserved for the local repository.
pub const LOCAL_ID: u32 = 0;

/// Node name reserved for the local repository.
pub const LOCAL_NAME: &str = "<local>";

/// Hard cap on slots; one bit per slot in the availability bitset.
pub const MAX_SLOTS: usize = 64;

/// Bidirectional name <-> connection ID map.
pub struct Map {
    to_id: HashMap<String, u32>,
    to_name: Vec<String>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            to_id: HashMap::from([(LOCAL_NAME.to_string(), LOCAL_ID)]),
            to_name: vec![LOCAL_NAME.to_string()],
        }
    }

    /// Returns the connection ID for `name`, allocating one on first use.
    /// Freed slots are reused before the ID space grows.
    ///
    /// Panics when all [`MAX_SLOTS`] slots are occupied; connecting that many
    /// peers at once is a caller bug.
    pub fn get(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.to_id.get(name) {
            return id;
        }

        for (i, n) in self.to_name.iter().enumerate() {
            if n.is_empty() {
                self.to_name[i] = name.to_string();
                self.to_id.insert(name.to_string(), i as u32);
                return i as u32;
            }
        }

        if self.to_name.len() >= MAX_SLOTS {
            panic!("connection ID space exhausted ({} slots)", MAX_SLOTS);
        }

        let id = self.to_name.len() as u32;
        self.to_name.push(name.to_string());
        self.to_id.insert(name.to_string(), id);
        id
    }

    /// The ID for `name` if one is currently allocated. Never allocates.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.to_id.get(name).copied()
    }

    /// The name occupying `id`. Empty for freed slots.
    pub fn name(&self, id: u32) -> &str {
        &self.to_name[id as usize]
    }

    /// Frees the slot held by `name`, leaving a hole for reuse.
    pub fn clear(&mut self, name: &str) {
        if let Some(id) = self.to_id.remove(name) {
            self.to_name[id as usize] = String::new();
        }
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_preloaded() {
        let mut m = Map::new();
        assert_eq!(m.get(LOCAL_NAME), LOCAL_ID);
        assert_eq!(m.name(LOCAL_ID), LOCAL_NAME);
    }

    #[test]
    fn test_allocation_is_dense_and_idempotent() {
        let mut m = Map::new();
        assert_eq!(m.get("node-a"), 1);
        assert_eq!(m.get("node-b"), 2);
        assert_eq!(m.get("node-a"), 1);
        assert_eq!(m.name(2), "node-b");
    }

    #[test]
    fn test_slot_reuse_after_clear() {
        let mut m = Map::new();
        m.get("node-a");
        m.get("node-b");
        m.clear("node-a");
        assert_eq!(m.lookup("node-a"), None);
        assert_eq!(m.name(1), "");

        // The freed slot is handed out before the space grows.
        assert_eq!(m.get("node-c"), 1);
        assert_eq!(m.get("node-d"), 3);
    }

    #[test]
    #[should_panic(expected = "connection ID space exhausted")]
    fn test_panics_when_full() {
        let mut m = Map::new();
        for i in 1..MAX_SLOTS {
            m.get(&format!("node-{}", i));
        }
        m.get("one-too-many");
    }
}
