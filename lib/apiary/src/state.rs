// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Program entry-point bookkeeping.
//!
//! Guests register the addresses of their request handlers through the
//! `REGISTER_FUNC` trap-out. The table is racy-readable from dispatchers and
//! serializes byte-exactly into the snapshot user area so a cold-started VM
//! keeps its handler registrations.

use std::sync::atomic::{AtomicU32, Ordering};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Indices into the program entry-point table. The values are guest ABI and
/// must not be renumbered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgramEntryIndex {
    Unused = 0,
    OnGet = 1,
    OnPost = 2,
    OnMethod = 3,
    OnStreamPost = 4,
    OnError = 5,
    LiveupdSerialize = 6,
    LiveupdDeserialize = 7,

    SocketPauseResumeApi = 12,
}

pub const TOTAL_ENTRIES: usize = 13;

impl ProgramEntryIndex {
    pub fn from_raw(raw: u64) -> Option<Self> {
        use ProgramEntryIndex::*;
        match raw {
            0 => Some(Unused),
            1 => Some(OnGet),
            2 => Some(OnPost),
            3 => Some(OnMethod),
            4 => Some(OnStreamPost),
            5 => Some(OnError),
            6 => Some(LiveupdSerialize),
            7 => Some(LiveupdDeserialize),
            12 => Some(SocketPauseResumeApi),
            _ => None,
        }
    }
}

/// Byte-exact image of the entry table, stored in the snapshot user area.
/// Entries are limited to the lower 32 bits of the guest address space.
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Default)]
#[repr(C)]
pub struct SerializedState {
    pub entry_address: [u32; TOTAL_ENTRIES],
}

/// The live entry table. Writes happen from the guest's boot phase (through
/// `REGISTER_FUNC`), reads from every dispatch; both sides tolerate racy
/// visibility, so relaxed atomics suffice.
#[derive(Default)]
pub struct EntryTable {
    entries: [AtomicU32; TOTAL_ENTRIES],
}

impl EntryTable {
    pub fn get(&self, idx: ProgramEntryIndex) -> u64 {
        self.entries[idx as usize].load(Ordering::Relaxed) as u64
    }

    pub fn set(&self, idx: ProgramEntryIndex, addr: u64) {
        self.entries[idx as usize].store(addr as u32, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SerializedState {
        let mut state = SerializedState::default();
        for (i, e) in self.entries.iter().enumerate() {
            state.entry_address[i] = e.load(Ordering::Relaxed);
        }
        state
    }

    pub fn restore(&self, state: &SerializedState) {
        for (i, e) in self.entries.iter().enumerate() {
            e.store(state.entry_address[i], Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn entry_roundtrip_through_snapshot() {
        let table = EntryTable::default();
        table.set(ProgramEntryIndex::OnGet, 0x5000);
        table.set(ProgramEntryIndex::LiveupdSerialize, 0x7700);

        let snap = table.snapshot();
        let restored = EntryTable::default();
        restored.restore(&snap);
        assert_eq!(restored.get(ProgramEntryIndex::OnGet), 0x5000);
        assert_eq!(restored.get(ProgramEntryIndex::LiveupdSerialize), 0x7700);
        assert_eq!(restored.get(ProgramEntryIndex::OnPost), 0);
    }

    #[test]
    fn serialized_state_is_packed() {
        assert_eq!(
            SerializedState::default().as_bytes().len(),
            TOTAL_ENTRIES * 4
        );
    }

    #[test]
    fn raw_index_mapping() {
        assert_eq!(
            ProgramEntryIndex::from_raw(12),
            Some(ProgramEntryIndex::SocketPauseResumeApi)
        );
        assert_eq!(ProgramEntryIndex::from_raw(8), None);
        assert_eq!(ProgramEntryIndex::from_raw(13), None);
    }
}
