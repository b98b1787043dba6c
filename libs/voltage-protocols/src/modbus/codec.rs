//! Digital output register codec
//!
//! Request framing lives in `voltage_modbus`; this module only knows what the
//! registers mean: the PAC3220 command word, the status bitmask and IEEE-754
//! values whose byte/word order is not known up front.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::trace;

// ============================================================================
// Digital output command word
// ============================================================================

/// Action byte for switching an output on
pub const DO_ACTION_ON: u8 = 1;
/// Action byte for switching an output off
pub const DO_ACTION_OFF: u8 = 0;

/// Encode a digital-output command word for the PAC3220 family.
///
/// The action occupies the high byte and the output id the low byte, so
/// switching output 0 on yields `0x0100`.
#[inline]
pub fn encode_do_command(output_id: u8, action: u8) -> u16 {
    (u16::from(action) << 8) | u16::from(output_id)
}

/// Interpret a status register through a bitmask
#[inline]
pub fn decode_do_status(raw: u16, bitmask: u16) -> bool {
    raw & bitmask != 0
}

// ============================================================================
// Float decoding with ordering fallback
// ============================================================================

/// Byte/word arrangement of a multi-register value.
///
/// Letters name the bytes of the big-endian value; `ABCD` is the value as it
/// appears on the wire with no swapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordOrdering {
    /// Big-endian bytes, big-endian words
    ABCD,
    /// Little-endian bytes, big-endian words (byte swap within each register)
    BADC,
    /// Big-endian bytes, little-endian words (register swap)
    CDAB,
    /// Little-endian bytes, little-endian words (full reversal)
    DCBA,
}

impl WordOrdering {
    fn swaps_bytes(self) -> bool {
        matches!(self, Self::BADC | Self::DCBA)
    }

    fn swaps_words(self) -> bool {
        matches!(self, Self::CDAB | Self::DCBA)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ABCD => "ABCD",
            Self::BADC => "BADC",
            Self::CDAB => "CDAB",
            Self::DCBA => "DCBA",
        }
    }
}

impl fmt::Display for WordOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering name outside ABCD/BADC/CDAB/DCBA
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown word ordering: {0}")]
pub struct UnknownOrdering(pub String);

impl FromStr for WordOrdering {
    type Err = UnknownOrdering;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABCD" => Ok(Self::ABCD),
            "BADC" => Ok(Self::BADC),
            "CDAB" => Ok(Self::CDAB),
            "DCBA" => Ok(Self::DCBA),
            other => Err(UnknownOrdering(other.to_string())),
        }
    }
}

/// Decode priority observed to work across the deployed meter fleet.
///
/// Little-endian bytes with big-endian words is tried first; some devices
/// only produce a plausible value under a later ordering.
pub const DEFAULT_ORDERINGS: [WordOrdering; 4] = [
    WordOrdering::BADC,
    WordOrdering::ABCD,
    WordOrdering::DCBA,
    WordOrdering::CDAB,
];

/// Largest magnitude accepted for a 32-bit reading
pub const FLOAT32_PLAUSIBLE_MAX: f32 = 1e9;
/// Largest magnitude accepted for a 64-bit reading
pub const FLOAT64_PLAUSIBLE_MAX: f64 = 1e15;

/// Unprogrammed/unavailable register pattern
const SENTINEL_WORD: u16 = 0xFFFF;

fn ordered_bytes<const N: usize>(words: &[u16], ordering: WordOrdering) -> [u8; N] {
    let mut out = [0u8; N];
    let count = N / 2;
    for i in 0..count {
        let word = if ordering.swaps_words() {
            words[count - 1 - i]
        } else {
            words[i]
        };
        let [hi, lo] = word.to_be_bytes();
        let (first, second) = if ordering.swaps_bytes() {
            (lo, hi)
        } else {
            (hi, lo)
        };
        out[i * 2] = first;
        out[i * 2 + 1] = second;
    }
    out
}

/// Decode a 32-bit float from two registers.
///
/// Each ordering is tried in turn; the first finite value with
/// `|v| <= 1e9` wins. Both registers at `0xFFFF` is rejected outright.
pub fn decode_float32(words: &[u16; 2], orderings: &[WordOrdering]) -> Option<f32> {
    if words.iter().all(|&w| w == SENTINEL_WORD) {
        return None;
    }
    orderings.iter().find_map(|&ordering| {
        let value = f32::from_be_bytes(ordered_bytes::<4>(words, ordering));
        if value.is_finite() && value.abs() <= FLOAT32_PLAUSIBLE_MAX {
            trace!("float32 {:04X?} decoded as {} via {}", words, value, ordering);
            Some(value)
        } else {
            None
        }
    })
}

/// Decode a 64-bit float from four registers, bound `1e15`
pub fn decode_float64(words: &[u16; 4], orderings: &[WordOrdering]) -> Option<f64> {
    if words.iter().all(|&w| w == SENTINEL_WORD) {
        return None;
    }
    orderings.iter().find_map(|&ordering| {
        let value = f64::from_be_bytes(ordered_bytes::<8>(words, ordering));
        if value.is_finite() && value.abs() <= FLOAT64_PLAUSIBLE_MAX {
            trace!("float64 {:04X?} decoded as {} via {}", words, value, ordering);
            Some(value)
        } else {
            None
        }
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_do_command() {
        assert_eq!(encode_do_command(0, DO_ACTION_ON), 256);
        assert_eq!(encode_do_command(0, DO_ACTION_OFF), 0);
        assert_eq!(encode_do_command(1, DO_ACTION_ON), 0x0101);
        assert_eq!(encode_do_command(3, DO_ACTION_OFF), 0x0003);
    }

    #[test]
    fn test_decode_do_status() {
        assert!(decode_do_status(0x0001, 0x0001));
        assert!(!decode_do_status(0x0002, 0x0001));
        assert!(decode_do_status(0x0102, 0x0100));
    }

    #[test]
    fn test_decode_float32_zero() {
        assert_eq!(decode_float32(&[0x0000, 0x0000], &DEFAULT_ORDERINGS), Some(0.0));
    }

    #[test]
    fn test_decode_float32_sentinel_rejected() {
        assert_eq!(decode_float32(&[0xFFFF, 0xFFFF], &DEFAULT_ORDERINGS), None);
    }

    #[test]
    fn test_decode_float32_falls_through_to_plausible_ordering() {
        // BADC gives ~ -9.8e32, so ABCD is the first plausible reading
        let value = decode_float32(&[0x42F6, 0xE979], &DEFAULT_ORDERINGS).unwrap();
        assert!((value - 123.456).abs() < 1e-3);
    }

    #[test]
    fn test_decode_float32_priority_wins_when_plausible() {
        // 1.0 is 0x3F800000; BADC sees bytes 80 3F 00 00, which is a tiny
        // negative denormal and therefore plausible, so it wins
        let value = decode_float32(&[0x3F80, 0x0000], &DEFAULT_ORDERINGS).unwrap();
        assert!(value.abs() < 1e-30);

        let value = decode_float32(&[0x3F80, 0x0000], &[WordOrdering::ABCD]).unwrap();
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_decode_float32_orderings() {
        // 123.456 = 0x42F6E979
        let expected = 123.456_f32;
        let cases = [
            (WordOrdering::ABCD, [0x42F6, 0xE979]),
            (WordOrdering::BADC, [0xF642, 0x79E9]),
            (WordOrdering::CDAB, [0xE979, 0x42F6]),
            (WordOrdering::DCBA, [0x79E9, 0xF642]),
        ];
        for (ordering, words) in cases {
            let value = decode_float32(&words, &[ordering]).unwrap();
            assert!((value - expected).abs() < 1e-3, "{ordering}: {value}");
        }
    }

    #[test]
    fn test_decode_float32_nothing_plausible() {
        // NaN under three orderings, ~1.7e38 under DCBA
        assert_eq!(decode_float32(&[0xFFFF, 0xFFFE], &DEFAULT_ORDERINGS), None);
        assert_eq!(decode_float32(&[0x42F6, 0xE979], &[]), None);
    }

    #[test]
    fn test_decode_float64() {
        // 123.456789012346 = 0x405EDD3C07FB4CAF
        let words = [0x405E, 0xDD3C, 0x07FB, 0x4CAF];
        let value = decode_float64(&words, &[WordOrdering::ABCD]).unwrap();
        assert!((value - 123.456789012346).abs() < 1e-9);

        let swapped = [0x4CAF, 0x07FB, 0xDD3C, 0x405E];
        let value = decode_float64(&swapped, &[WordOrdering::CDAB]).unwrap();
        assert!((value - 123.456789012346).abs() < 1e-9);

        assert_eq!(decode_float64(&[0xFFFF; 4], &DEFAULT_ORDERINGS), None);
        assert_eq!(decode_float64(&[0; 4], &DEFAULT_ORDERINGS), Some(0.0));
    }

    #[test]
    fn test_word_ordering_parse() {
        assert_eq!("badc".parse::<WordOrdering>().unwrap(), WordOrdering::BADC);
        assert_eq!(" CDAB ".parse::<WordOrdering>().unwrap(), WordOrdering::CDAB);
        assert_eq!(
            "ABDC".parse::<WordOrdering>(),
            Err(UnknownOrdering("ABDC".to_string()))
        );
        assert_eq!(WordOrdering::DCBA.to_string(), "DCBA");
    }
}
