//! String interning.
//!
//! Every string that exists at runtime is registered here exactly once, so
//! string equality anywhere in the VM is identity equality on [`HeapId`]s.
//! The table stores only ids; probes compare bytes through the arena, and
//! the stored FNV-1a hash on each string keeps rehashing cheap.
//!
//! The table holds its entries weakly: before the GC sweeps a generation it
//! calls [`InternTable::remove_unmarked`] so dead strings drop out and the
//! sweep can free them.

use hashbrown::HashTable;

use crate::{
    heap::{Generation, HeapId, Obj},
    object::ObjData,
};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a over a byte slice. This is the hash stored on every string and
/// the hashing contract dictionary keys rely on.
#[must_use]
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn string_of<'a>(slots: &'a [Option<Obj>], id: HeapId) -> &'a crate::object::EmberStr {
    match slots[id.index()].as_ref().map(|obj| &obj.data) {
        Some(ObjData::String(s)) => s,
        _ => panic!("intern table entry is not a live string"),
    }
}

/// The VM-wide intern table.
#[derive(Debug, Default)]
pub(crate) struct InternTable {
    table: HashTable<HeapId>,
}

impl InternTable {
    /// Looks up an already-interned string by content.
    pub fn find(&self, slots: &[Option<Obj>], hash: u32, chars: &str) -> Option<HeapId> {
        self.table
            .find(u64::from(hash), |&id| string_of(slots, id).as_str() == chars)
            .copied()
    }

    /// Registers a freshly allocated string. The caller guarantees no equal
    /// string is already present.
    pub fn insert(&mut self, slots: &[Option<Obj>], id: HeapId) {
        let hash = u64::from(string_of(slots, id).hash);
        self.table
            .insert_unique(hash, id, |&entry| u64::from(string_of(slots, entry).hash));
    }

    /// Drops entries whose string is unmarked and about to be swept from a
    /// generation at or below `generation`. Permanent strings always stay.
    pub fn remove_unmarked(&mut self, slots: &[Option<Obj>], generation: Generation) {
        self.table.retain(|&mut id| {
            let Some(obj) = slots[id.index()].as_ref() else {
                return false;
            };
            obj.header.generation == Generation::Permanent
                || obj.header.generation > generation
                || obj.header.is_marked
        });
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }
}
