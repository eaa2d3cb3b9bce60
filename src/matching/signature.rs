//! Canonical byte-vector encoding for step signatures.
//!
//! Spec §4.5 only requires that a step's signature type `Σ` be
//! "hash-comparable and order-comparable". A flat, totally-ordered byte
//! vector satisfies both without needing a different `Σ` per step, and
//! keeps bucket partitioning (`BTreeMap<Signature, _>`) uniform across the
//! whole catalogue in [`super::function_steps`] and
//! [`super::basicblock_steps`].

pub type Signature = Vec<u8>;

pub fn from_u64(value: u64) -> Signature {
    value.to_be_bytes().to_vec()
}

pub fn from_u32(value: u32) -> Signature {
    value.to_be_bytes().to_vec()
}

pub fn from_bool(value: bool) -> Signature {
    vec![value as u8]
}

/// Floating-point values bucketed to `precision` decimal digits before
/// encoding, so near-equal MD-index values compare equal the way spec
/// §4.5's "MD index matching" steps intend.
pub fn from_f64_bucketed(value: f64, precision: i32) -> Signature {
    let scale = 10f64.powi(precision);
    let bucketed = (value * scale).round() as i64;
    bucketed.to_be_bytes().to_vec()
}

/// Order-independent multiset signature: sort the encoded elements before
/// concatenating (same determinism discipline as the MD-index sort-before-
/// sum rule, spec §4.2/§9) so two equal multisets in different orders
/// produce the same signature.
pub fn from_multiset(mut elements: Vec<u64>) -> Signature {
    elements.sort_unstable();
    let mut out = Vec::with_capacity(elements.len() * 8);
    for e in elements {
        out.extend_from_slice(&e.to_be_bytes());
    }
    out
}

/// Order-preserving sequence signature, for steps where element order is
/// itself part of the key (e.g. jump-sequence, call-sequence exact match).
pub fn from_sequence(elements: &[u64]) -> Signature {
    let mut out = Vec::with_capacity(elements.len() * 8);
    for e in elements {
        out.extend_from_slice(&e.to_be_bytes());
    }
    out
}
