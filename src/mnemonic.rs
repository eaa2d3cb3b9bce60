//! C1: mnemonic identity (32-bit ids) and modular exponentiation ("primes").
//!
//! Grounded on `original_source/prime_signature.h`: `IPow32` is implemented
//! as the textbook binary-exponentiation-by-squaring algorithm operating on
//! wrapping 32-bit arithmetic (the original computes in `uint32_t`, whose
//! overflow behavior is exactly Rust's `wrapping_mul`). `GetPrime`'s exact
//! historical encoding isn't part of the contract (spec §8 only pins down
//! distinctness, not literal values), so the mnemonic id here is a
//! from-scratch FNV-1a-style hash with a non-zero guarantee.

/// Computes `base.pow(exp)` over wrapping 32-bit unsigned arithmetic.
///
/// `ipow32(_, 0) == 1` and `ipow32(1, _) == 1` fall out of the algorithm
/// itself (spec §8 property 2).
pub fn ipow32(base: u32, exp: u32) -> u32 {
    let mut result: u32 = 1;
    let mut base = base;
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        exp >>= 1;
        base = base.wrapping_mul(base);
    }
    result
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Returns a 32-bit id for a mnemonic string (the per-instruction "prime",
/// historical naming; not a prime number in general — spec §4.1).
///
/// Non-zero for any non-empty input, stable for a given byte string, and
/// case-sensitive (callers are expected to normalize case upstream per
/// spec §4.1, matching "regardless of capitalization handled upstream").
pub fn mnemonic_id(mnemonic: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in mnemonic.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if mnemonic.is_empty() {
        return 0;
    }
    if hash == 0 {
        hash = FNV_PRIME;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    #[case(953)]
    #[case(u32::MAX)]
    fn ipow32_any_base_to_the_zero_is_one(#[case] base: u32) {
        assert_eq!(ipow32(base, 0), 1);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(7)]
    #[case(48)]
    #[case(3600)]
    fn ipow32_one_to_any_exponent_is_one(#[case] exp: u32) {
        assert_eq!(ipow32(1, exp), 1);
    }

    #[rstest]
    #[case(2, 4, 16)]
    #[case(12, 2, 144)]
    #[case(953, 3, 865_523_177)]
    #[case(953, 48, 1_629_949_057)]
    #[case(1_296_829, 3600, 454_359_873)]
    fn ipow32_matches_known_values(#[case] base: u32, #[case] exp: u32, #[case] expected: u32) {
        assert_eq!(ipow32(base, exp), expected);
    }

    #[test]
    fn mnemonic_ids_are_pairwise_distinct() {
        let mnemonics = [
            "add",
            "sub",
            "xor",
            "mov",
            "aeskeygenassist",
            "vfnmsubss",
        ];
        let ids: Vec<u32> = mnemonics.iter().map(|m| mnemonic_id(m)).collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                assert_ne!(ids[i], ids[j], "{} vs {}", mnemonics[i], mnemonics[j]);
            }
        }
    }

    #[test]
    fn mnemonic_ids_nonzero_for_nonempty() {
        assert_ne!(mnemonic_id("nop"), 0);
    }

    #[test]
    fn anagram_like_strings_hash_distinct() {
        let a = mnemonic_id("ITTEE NETEE NE");
        let b = mnemonic_id("ITETT LSETT LS");
        assert_ne!(a, b);
    }

    #[test]
    fn mnemonic_id_is_stable() {
        assert_eq!(mnemonic_id("mov"), mnemonic_id("mov"));
    }
}
