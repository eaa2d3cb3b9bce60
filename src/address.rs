//! C1: 64-bit program addresses.
//!
//! Mirrors `Vector35-idb-rs`'s `Address<K>` newtype (ordering/hashing by the
//! inner value, `Display`/`LowerHex`/`UpperHex` impls), simplified to a
//! concrete 64-bit integer: unlike an IDA database, a binary-export artifact
//! never carries a 32-bit/64-bit kind distinction that the rest of the
//! program needs to track (spec §3: "Address: 64-bit unsigned integer").

use serde::{Deserialize, Serialize};

/// A 64-bit address. `0` is a legal address, conventionally a sentinel only
/// where explicitly documented (spec §3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    pub const ZERO: Address = Address(0);

    pub fn new(value: u64) -> Self {
        Address(value)
    }

    pub fn checked_add(self, len: u64) -> Option<Address> {
        self.0.checked_add(len).map(Address)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::LowerHex for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::fmt::UpperHex for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::UpperHex::fmt(&self.0, f)
    }
}

impl std::ops::Add for Address {
    type Output = Address;
    fn add(self, rhs: Address) -> Address {
        Address(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Address {
    type Output = Address;
    fn sub(self, rhs: Address) -> Address {
        Address(self.0 - rhs.0)
    }
}

/// Lower-bound binary search over an ascending-sorted slice of addresses,
/// returning the matching index or `None` on miss.
///
/// Models `original_source/reader/graph_utility.h`'s `GetVertex`: the
/// teacher's `FindVertex`-style sorted-vector lookup, generalized from flow
/// graph vertices to any ascending `Address` slice (flow graph vertices,
/// call graph vertices).
pub fn binary_search_address(addresses: &[Address], address: Address) -> Option<usize> {
    match addresses.binary_search(&address) {
        Ok(idx) => Some(idx),
        Err(_) => None,
    }
}

/// Sentinel return value for vertex lookups, matching
/// `original_source/reader/graph_utility.h`'s `VertexTypeTraits::kInvalidVertex`.
pub const INVALID_VERTEX: u32 = u32::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_hex() {
        assert_eq!(Address::new(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn binary_search_hits_and_misses() {
        let addrs = [Address::new(0x10), Address::new(0x20), Address::new(0x30)];
        assert_eq!(binary_search_address(&addrs, Address::new(0x20)), Some(1));
        assert_eq!(binary_search_address(&addrs, Address::new(0x25)), None);
    }
}
