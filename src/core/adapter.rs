//! In-process bidirectional room membership index
//!
//! Pure data structure with no I/O. Callers serialize access; the adapter
//! itself holds no locks.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct LocalAdapter {
    /// room name -> member connection ids
    rooms: HashMap<String, HashSet<String>>,
    /// connection id -> room names it belongs to
    connection_rooms: HashMap<String, HashSet<String>>,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member to both indices. Returns false if already a member.
    pub fn add(&mut self, room: &str, connection_id: &str) -> bool {
        let inserted = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        if inserted {
            self.connection_rooms
                .entry(connection_id.to_string())
                .or_default()
                .insert(room.to_string());
        }
        inserted
    }

    /// Removes a member from both indices. Returns false if not a member.
    pub fn remove(&mut self, room: &str, connection_id: &str) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(connection_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(rooms) = self.connection_rooms.get_mut(connection_id) {
                rooms.remove(room);
                if rooms.is_empty() {
                    self.connection_rooms.remove(connection_id);
                }
            }
        }
        removed
    }

    pub fn has_member(&self, room: &str, connection_id: &str) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(HashSet::len).unwrap_or(0)
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection belongs to
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<String> {
        self.connection_rooms
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of members across the named rooms, deduplicated
    pub fn members_union(&self, rooms: &[String]) -> HashSet<String> {
        let mut union = HashSet::new();
        for room in rooms {
            if let Some(members) = self.rooms.get(room) {
                union.extend(members.iter().cloned());
            }
        }
        union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut adapter = LocalAdapter::new();
        assert!(adapter.add("general", "c1"));
        assert!(!adapter.add("general", "c1"));
        assert_eq!(adapter.room_size("general"), 1);
        assert_eq!(adapter.connection_rooms("c1"), vec!["general".to_string()]);
    }

    #[test]
    fn test_remove_cleans_both_indices() {
        let mut adapter = LocalAdapter::new();
        adapter.add("general", "c1");
        adapter.add("general", "c2");

        assert!(adapter.remove("general", "c1"));
        assert!(!adapter.remove("general", "c1"));
        assert_eq!(adapter.room_size("general"), 1);
        assert!(adapter.connection_rooms("c1").is_empty());

        // Last member out drops the room key entirely
        adapter.remove("general", "c2");
        assert_eq!(adapter.room_size("general"), 0);
        assert!(!adapter.has_member("general", "c2"));
    }

    #[test]
    fn test_union_deduplicates_overlapping_membership() {
        let mut adapter = LocalAdapter::new();
        adapter.add("a", "c1");
        adapter.add("b", "c1");
        adapter.add("b", "c2");

        let union = adapter.members_union(&["a".to_string(), "b".to_string()]);
        assert_eq!(union.len(), 2);
        assert!(union.contains("c1"));
        assert!(union.contains("c2"));
    }

    #[test]
    fn test_join_leave_count_invariant() {
        let mut adapter = LocalAdapter::new();
        for i in 0..5 {
            adapter.add("general", &format!("c{}", i));
        }
        for i in 0..3 {
            adapter.remove("general", &format!("c{}", i));
        }
        assert_eq!(adapter.room_size("general"), 2);
    }
}
