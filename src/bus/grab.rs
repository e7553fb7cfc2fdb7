use std::collections::BTreeMap;

use crate::symbol::SymbolString;
use crate::util::to_hex;

/// One grabbed telegram, keyed by source, destination, PB/SB and first
/// identifier byte.
#[derive(Debug, Clone)]
pub struct GrabEntry {
    pub master: SymbolString,
    pub slave: Option<SymbolString>,
    pub count: u64,
    pub known: bool,
}

/// Accumulator of observed telegrams for the `grab` client command, most
/// useful for the ones no message definition matched.
#[derive(Debug, Default)]
pub struct GrabStore {
    entries: BTreeMap<Vec<u8>, GrabEntry>,
}

impl GrabStore {
    pub fn new() -> GrabStore {
        GrabStore::default()
    }

    /// Records an observed exchange. `known` marks telegrams a message
    /// definition matched.
    pub fn store(&mut self, master: SymbolString, slave: Option<SymbolString>, known: bool) {
        let mut key: Vec<u8> = master.iter().copied().take(4).collect();
        if let Some(first_id) = master.payload().first() {
            key.push(*first_id);
        }
        let entry = self.entries.entry(key).or_insert_with(|| GrabEntry {
            master: master.clone(),
            slave: slave.clone(),
            count: 0,
            known,
        });
        entry.master = master;
        entry.slave = slave;
        entry.count += 1;
        entry.known = known;
    }

    /// Dump of the accumulator, one line per distinct telegram:
    /// `master / slave = count`. With `only_unknown`, matched telegrams
    /// are left out.
    pub fn dump(&self, only_unknown: bool) -> String {
        let mut out = String::new();
        for entry in self.entries.values() {
            if only_unknown && entry.known {
                continue;
            }
            out.push_str(&to_hex(&entry.master));
            if let Some(slave) = &entry.slave {
                out.push_str(" / ");
                out.push_str(&to_hex(slave));
            }
            out.push_str(&format!(" = {}\n", entry.count));
        }
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Part;

    #[test]
    fn counts_repeated_telegrams() {
        let mut store = GrabStore::new();
        let master = SymbolString::parse_hex(Part::Master, "10feb505020103", false).unwrap();
        store.store(master.clone(), None, false);
        store.store(master, None, false);
        assert_eq!(store.len(), 1);
        let dump = store.dump(true);
        assert!(dump.contains("10feb505020103 = 2"));
    }

    #[test]
    fn known_telegrams_filtered() {
        let mut store = GrabStore::new();
        let known = SymbolString::parse_hex(Part::Master, "10feb505020103", false).unwrap();
        let unknown = SymbolString::parse_hex(Part::Master, "1008b512020104", false).unwrap();
        store.store(known, None, true);
        store.store(unknown, None, false);
        assert_eq!(store.dump(true).lines().count(), 1);
        assert_eq!(store.dump(false).lines().count(), 2);
    }
}
