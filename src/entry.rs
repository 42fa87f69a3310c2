//! The client-local mirror of the server's entry namespace: id/name
//! arbitration, sequence-number ordering, flag semantics, and clear-all.

use std::collections::HashMap;

use crate::value::{EntryType, EntryValue};

/// Sentinel id meaning "not yet assigned by the server".
pub const UNASSIGNED_ID: u16 = 0xFFFF;

/// Single reserved bit today: whether the entry should be persisted by the
/// server across restarts. All other bits are reserved and must round-trip
/// as zero.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryFlags {
    pub persistent: bool,
}

impl EntryFlags {
    pub fn from_byte(byte: u8) -> Self {
        EntryFlags {
            persistent: byte & 0x01 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        if self.persistent {
            0x01
        } else {
            0x00
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub name: String,
    pub entry_type: EntryType,
    pub id: u16,
    pub seq: u16,
    pub flags: EntryFlags,
    pub value: EntryValue,
}

/// `true` iff `incoming` is a newer sequence number than `stored`, per the
/// 16-bit wrap-around rule: `(incoming - stored) mod 2^16 in [1, 2^15]`.
pub fn seq_is_newer(stored: u16, incoming: u16) -> bool {
    let delta = incoming.wrapping_sub(stored);
    delta != 0 && delta <= 0x8000
}

/// What changed as a result of applying a server message, so the caller
/// (the session state machine) can translate it into the right
/// `ClientEvent`.
#[derive(Debug)]
pub enum TableChange {
    Assigned,
    Updated { previous: EntryValue },
    FlagsUpdated,
    Deleted { name: String },
    Cleared,
    /// The change was dropped per protocol rules (stale update, unknown id
    /// for an update/flags-update/delete). Not an error.
    Ignored,
}

/// Authoritative mirror of the server's entry table, keyed by id with a
/// secondary name index, plus a side table of not-yet-acknowledged
/// client-origin proposals keyed by name (they have no id yet).
#[derive(Debug, Default)]
pub struct EntryTable {
    by_id: HashMap<u16, Entry>,
    id_by_name: HashMap<String, u16>,
    pending: HashMap<String, Entry>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_id(&self, id: u16) -> Option<&Entry> {
        self.by_id.get(&id)
    }

    /// Looks up an acknowledged entry by name. Does not see pending
    /// client-origin placeholders; use [`EntryTable::pending_by_name`] for
    /// those.
    pub fn get_by_name(&self, name: &str) -> Option<&Entry> {
        self.id_by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn pending_by_name(&self, name: &str) -> Option<&Entry> {
        self.pending.get(name)
    }

    /// Returns a snapshot copy of every acknowledged entry, for embedder
    /// consumption. The table itself lives behind the session's event loop,
    /// so a copy (not a borrow) is the only safe thing to hand out.
    pub fn entries(&self) -> Vec<Entry> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Applies an ENTRY_ASSIGNMENT received from the server. Returns
    /// `Err(())` if `id == UNASSIGNED_ID`, which clients must never receive
    /// from a conformant server (see spec §4.5, §9 open question).
    pub fn apply_assignment(
        &mut self,
        name: String,
        entry_type: EntryType,
        id: u16,
        seq: u16,
        flags: EntryFlags,
        value: EntryValue,
    ) -> Result<TableChange, ()> {
        if id == UNASSIGNED_ID {
            return Err(());
        }
        self.pending.remove(&name);
        if let Some(existing_id) = self.id_by_name.get(&name).copied() {
            if existing_id != id {
                self.by_id.remove(&existing_id);
            }
        }
        if let Some(existing) = self.by_id.get(&id) {
            if existing.name != name {
                self.id_by_name.remove(&existing.name);
            }
        }
        self.id_by_name.insert(name.clone(), id);
        self.by_id.insert(
            id,
            Entry {
                name,
                entry_type,
                id,
                seq,
                flags,
                value,
            },
        );
        Ok(TableChange::Assigned)
    }

    /// Applies an ENTRY_UPDATE. Silently ignores updates to unknown ids and
    /// stale (or duplicate/out-of-window) sequence numbers.
    pub fn apply_update(
        &mut self,
        id: u16,
        seq: u16,
        entry_type: EntryType,
        value: EntryValue,
    ) -> TableChange {
        let Some(entry) = self.by_id.get_mut(&id) else {
            return TableChange::Ignored;
        };
        if !seq_is_newer(entry.seq, seq) {
            return TableChange::Ignored;
        }
        let previous = std::mem::replace(&mut entry.value, value);
        entry.entry_type = entry_type;
        entry.seq = seq;
        TableChange::Updated { previous }
    }

    pub fn apply_flags_update(&mut self, id: u16, flags: EntryFlags) -> TableChange {
        let Some(entry) = self.by_id.get_mut(&id) else {
            return TableChange::Ignored;
        };
        entry.flags = flags;
        TableChange::FlagsUpdated
    }

    /// Idempotent: deleting an unknown id is a no-op.
    pub fn apply_delete(&mut self, id: u16) -> TableChange {
        let Some(entry) = self.by_id.remove(&id) else {
            return TableChange::Ignored;
        };
        self.id_by_name.remove(&entry.name);
        TableChange::Deleted { name: entry.name }
    }

    pub fn apply_clear_all(&mut self) -> TableChange {
        self.by_id.clear();
        self.id_by_name.clear();
        self.pending.clear();
        TableChange::Cleared
    }

    /// Records a client-origin proposal for a brand-new name, pending the
    /// server's authoritative ENTRY_ASSIGNMENT echo. Per spec §9, client
    /// writes to *new* names are authoritative-only: the name is reserved
    /// locally but carries no real id until the server assigns one.
    pub fn insert_placeholder(
        &mut self,
        name: String,
        entry_type: EntryType,
        seq: u16,
        flags: EntryFlags,
        value: EntryValue,
    ) {
        self.pending.insert(
            name.clone(),
            Entry {
                name,
                entry_type,
                id: UNASSIGNED_ID,
                seq,
                flags,
                value,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bool_entry(
        name: &str,
        id: u16,
        seq: u16,
    ) -> (String, EntryType, u16, u16, EntryFlags, EntryValue) {
        (
            name.to_string(),
            EntryType::Boolean,
            id,
            seq,
            EntryFlags::default(),
            EntryValue::Boolean(true),
        )
    }

    #[test]
    fn assignment_inserts_and_replaces() {
        let mut table = EntryTable::new();
        let (name, ty, id, seq, flags, value) = bool_entry("a", 1, 1);
        table
            .apply_assignment(name, ty, id, seq, flags, value)
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_by_name("a").unwrap().id, 1);

        // re-assignment at same id replaces in place
        table
            .apply_assignment(
                "a".to_string(),
                EntryType::Boolean,
                1,
                2,
                EntryFlags::default(),
                EntryValue::Boolean(false),
            )
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_by_id(1).unwrap().seq, 2);
    }

    #[test]
    fn assignment_rebinds_name_to_new_id() {
        let mut table = EntryTable::new();
        let (name, ty, id, seq, flags, value) = bool_entry("a", 1, 1);
        table
            .apply_assignment(name, ty, id, seq, flags, value)
            .unwrap();
        // server reassigns "a" to id 2 (e.g. after a race)
        table
            .apply_assignment(
                "a".to_string(),
                EntryType::Boolean,
                2,
                1,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get_by_id(1).is_none());
        assert_eq!(table.get_by_name("a").unwrap().id, 2);
    }

    #[test]
    fn assignment_rebinds_id_away_from_old_name() {
        let mut table = EntryTable::new();
        let (name, ty, id, seq, flags, value) = bool_entry("a", 5, 1);
        table
            .apply_assignment(name, ty, id, seq, flags, value)
            .unwrap();
        // server reassigns id 5 to a different name entirely.
        table
            .apply_assignment(
                "b".to_string(),
                EntryType::Boolean,
                5,
                1,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get_by_name("a").is_none());
        assert_eq!(table.get_by_name("b").unwrap().id, 5);

        // deleting id 5 must not leave "a" dangling in the name index.
        table.apply_delete(5);
        assert!(table.get_by_name("a").is_none());
        assert!(table.get_by_name("b").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn assignment_rejects_unassigned_sentinel() {
        let mut table = EntryTable::new();
        let (name, ty, _id, seq, flags, value) = bool_entry("a", UNASSIGNED_ID, 1);
        assert!(table
            .apply_assignment(name, ty, UNASSIGNED_ID, seq, flags, value)
            .is_err());
    }

    #[test]
    fn seq_wraparound_boundaries() {
        assert!(seq_is_newer(65535, 0));
        assert!(!seq_is_newer(0, 65535));
        assert!(!seq_is_newer(100, 100));
        assert!(seq_is_newer(100, 100u16.wrapping_add(0x8000)));
    }

    #[test]
    fn stale_update_is_rejected() {
        let mut table = EntryTable::new();
        table
            .apply_assignment(
                "x".to_string(),
                EntryType::Double,
                7,
                1000,
                EntryFlags::default(),
                EntryValue::Double(1.0),
            )
            .unwrap();
        let change = table.apply_update(7, 500, EntryType::Double, EntryValue::Double(2.0));
        assert!(matches!(change, TableChange::Ignored));
        assert_eq!(table.get_by_id(7).unwrap().value, EntryValue::Double(1.0));
    }

    #[test]
    fn update_to_unknown_id_is_ignored() {
        let mut table = EntryTable::new();
        let change = table.apply_update(42, 1, EntryType::Boolean, EntryValue::Boolean(true));
        assert!(matches!(change, TableChange::Ignored));
    }

    #[test]
    fn flags_update_preserves_seq() {
        let mut table = EntryTable::new();
        table
            .apply_assignment(
                "x".to_string(),
                EntryType::Boolean,
                1,
                5,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        table.apply_flags_update(1, EntryFlags { persistent: true });
        let entry = table.get_by_id(1).unwrap();
        assert!(entry.flags.persistent);
        assert_eq!(entry.seq, 5);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut table = EntryTable::new();
        table
            .apply_assignment(
                "x".to_string(),
                EntryType::Boolean,
                1,
                1,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        let first = table.apply_delete(1);
        assert!(matches!(first, TableChange::Deleted { .. }));
        let second = table.apply_delete(1);
        assert!(matches!(second, TableChange::Ignored));
        assert!(table.is_empty());
    }

    #[test]
    fn clear_all_empties_table() {
        let mut table = EntryTable::new();
        table
            .apply_assignment(
                "x".to_string(),
                EntryType::Boolean,
                1,
                1,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        table
            .apply_assignment(
                "y".to_string(),
                EntryType::Boolean,
                2,
                1,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        table.apply_clear_all();
        assert!(table.is_empty());
    }

    #[test]
    fn placeholder_is_replaced_by_server_assignment() {
        let mut table = EntryTable::new();
        table.insert_placeholder(
            "x".to_string(),
            EntryType::Boolean,
            1,
            EntryFlags::default(),
            EntryValue::Boolean(true),
        );
        assert!(table.get_by_name("x").is_none());
        assert!(table.pending_by_name("x").is_some());
        table
            .apply_assignment(
                "x".to_string(),
                EntryType::Boolean,
                9,
                1,
                EntryFlags::default(),
                EntryValue::Boolean(true),
            )
            .unwrap();
        assert_eq!(table.get_by_name("x").unwrap().id, 9);
        assert!(table.pending_by_name("x").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn clear_all_discards_pending_placeholders() {
        let mut table = EntryTable::new();
        table.insert_placeholder(
            "x".to_string(),
            EntryType::Boolean,
            1,
            EntryFlags::default(),
            EntryValue::Boolean(true),
        );
        table.apply_clear_all();
        assert!(table.pending_by_name("x").is_none());
    }
}
