//! Cheat code application.
//!
//! The table is consulted on every mapped cartridge-region read, so the representation matters:
//! a sorted vector with binary search beats a hash map at the typical table sizes (~10 entries)
//! for both hits and misses.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CheatCode {
    pub address: u32,
    /// If set, the cheat only applies when the real value at the address equals this.
    #[cfg_attr(feature = "serde", serde(default))]
    pub compare: Option<u8>,
    pub value: u8,
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct CheatTable {
    // Sorted by address
    codes: Vec<CheatCode>,
}

impl CheatTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_codes(&mut self, mut codes: Vec<CheatCode>) {
        codes.sort_unstable_by_key(|code| code.address);
        self.codes = codes;
    }

    pub fn clear(&mut self) {
        self.codes.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Apply any matching cheat to a value read from the given address.
    #[inline]
    #[must_use]
    pub fn apply(&self, address: u32, value: u8) -> u8 {
        let Ok(idx) = self.codes.binary_search_by_key(&address, |code| code.address) else {
            return value;
        };

        let code = self.codes[idx];
        match code.compare {
            Some(compare) if compare != value => value,
            _ => code.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CheatTable {
        let mut table = CheatTable::new();
        table.set_codes(vec![
            CheatCode { address: 0x07FF, compare: None, value: 0x63 },
            CheatCode { address: 0x0100, compare: Some(0x02), value: 0x09 },
            CheatCode { address: 0xC000, compare: None, value: 0xFF },
        ]);
        table
    }

    #[test]
    fn miss_returns_original_value() {
        assert_eq!(table().apply(0x0200, 0x55), 0x55);
    }

    #[test]
    fn hit_returns_replacement() {
        assert_eq!(table().apply(0x07FF, 0x00), 0x63);
        assert_eq!(table().apply(0xC000, 0x12), 0xFF);
    }

    #[test]
    fn compare_gates_replacement() {
        assert_eq!(table().apply(0x0100, 0x02), 0x09);
        assert_eq!(table().apply(0x0100, 0x03), 0x03);
    }
}
