//! Population-count fitness.
//!
//! The score is a pure function of the observed word: the number of bits
//! set once the word is masked to the declared width.

use crate::config::types::WordWidth;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Non-negative score bounded by the word width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FitnessScore(u32);

impl FitnessScore {
    /// Worst possible score, used for candidates that did not return.
    pub const ZERO: FitnessScore = FitnessScore(0);

    /// Score `raw` as a `width`-bit word.
    pub fn of(raw: u64, width: WordWidth, method: PopcountMethod) -> Self {
        Self(method.count(width.truncate(raw)))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FitnessScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interchangeable popcount algorithms. All agree bit-for-bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopcountMethod {
    ShiftAndTest,
    ByteTable,
    #[default]
    Hardware,
}

impl PopcountMethod {
    pub fn count(self, word: u64) -> u32 {
        match self {
            Self::ShiftAndTest => shift_and_test(word),
            Self::ByteTable => byte_table(word),
            Self::Hardware => word.count_ones(),
        }
    }
}

fn shift_and_test(mut word: u64) -> u32 {
    let mut n = 0;
    while word != 0 {
        n += (word & 1) as u32;
        word >>= 1;
    }
    n
}

const BYTE_POPCOUNT: [u8; 256] = build_byte_table();

const fn build_byte_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        table[i] = (i & 1) as u8 + table[i >> 1];
        i += 1;
    }
    table
}

fn byte_table(word: u64) -> u32 {
    word.to_le_bytes()
        .iter()
        .map(|b| BYTE_POPCOUNT[*b as usize] as u32)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: [PopcountMethod; 3] = [
        PopcountMethod::ShiftAndTest,
        PopcountMethod::ByteTable,
        PopcountMethod::Hardware,
    ];

    #[test]
    fn scores_the_reference_words() {
        for method in METHODS {
            assert_eq!(FitnessScore::of(0, WordWidth::W32, method).value(), 0);
            assert_eq!(FitnessScore::of(0xFFFF_FFFF, WordWidth::W32, method).value(), 32);
            assert_eq!(FitnessScore::of(0b101, WordWidth::W32, method).value(), 2);
            assert_eq!(FitnessScore::of(u64::MAX, WordWidth::W64, method).value(), 64);
        }
    }

    #[test]
    fn ignores_bits_above_declared_width() {
        for method in METHODS {
            let score = FitnessScore::of(0xFFFF_FFFF_0000_0001, WordWidth::W32, method);
            assert_eq!(score.value(), 1);
        }
    }

    #[test]
    fn methods_agree_on_varied_words() {
        // xorshift walk gives dense and sparse words without a fixed grid
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..2000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            for word in [x, x & (x >> 3), x | (x << 5), !x] {
                let expected = word.count_ones();
                for method in METHODS {
                    assert_eq!(method.count(word), expected, "{:?} on {:#x}", method, word);
                }
            }
        }
    }

    #[test]
    fn setting_one_more_bit_adds_exactly_one() {
        let base: u64 = 0x0F0F_0000_1234_0000;
        for bit in 0..64 {
            let mask = 1u64 << bit;
            if base & mask != 0 {
                continue;
            }
            let before = FitnessScore::of(base, WordWidth::W64, PopcountMethod::ByteTable);
            let after = FitnessScore::of(base | mask, WordWidth::W64, PopcountMethod::ByteTable);
            assert_eq!(after.value(), before.value() + 1);
        }
    }

    #[test]
    fn score_never_exceeds_width() {
        for width in [WordWidth::W32, WordWidth::W64] {
            assert!(FitnessScore::of(u64::MAX, width, PopcountMethod::Hardware).value() <= width.bits());
        }
    }
}
