// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Nucleotide letters with IUPAC wildcards.
//!
//! Letters are stored as upper case ASCII bytes. Every letter maps to a four bit
//! mask over the basic letters `A=1, C=2, G=4, T=8`; a wildcard is any letter whose
//! mask has more than one bit set.

/// Basic letters in mask order.
pub const BASIC_LETTERS: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// The fully ambiguous letter, used for synthetic junction placeholders.
pub const N: u8 = b'N';

/// Basic letter mask of a nucleotide, or `None` if the byte is not a nucleotide.
pub fn mask(letter: u8) -> Option<u8> {
    let m = match letter.to_ascii_uppercase() {
        b'A' => 0b0001,
        b'C' => 0b0010,
        b'G' => 0b0100,
        b'T' => 0b1000,
        b'R' => 0b0101,
        b'Y' => 0b1010,
        b'S' => 0b0110,
        b'W' => 0b1001,
        b'K' => 0b1100,
        b'M' => 0b0011,
        b'B' => 0b1110,
        b'D' => 0b1101,
        b'H' => 0b1011,
        b'V' => 0b0111,
        b'N' => 0b1111,
        _ => return None,
    };
    Some(m)
}

/// Letter for a non-empty basic letter mask.
pub fn from_mask(mask: u8) -> u8 {
    const BY_MASK: [u8; 16] = *b"-ACMGRSVTWYHKDBN";
    BY_MASK[(mask & 0b1111) as usize]
}

/// True if the byte is a nucleotide letter or wildcard.
pub fn is_nucleotide(letter: u8) -> bool {
    mask(letter).is_some()
}

fn mask_or_empty(letter: u8) -> u8 {
    mask(letter).unwrap_or(0)
}

/// True if the letter stands for more than one basic letter.
pub fn is_wildcard(letter: u8) -> bool {
    mask_or_empty(letter).count_ones() > 1
}

/// Number of basic letters the letter stands for.
pub fn basic_size(letter: u8) -> u32 {
    mask_or_empty(letter).count_ones()
}

/// True if the two letters share at least one basic letter.
pub fn matches(first: u8, second: u8) -> bool {
    mask_or_empty(first) & mask_or_empty(second) != 0
}

/// True if every basic letter of `symbol` is covered by `wildcard`.
pub fn matches_strictly(wildcard: u8, symbol: u8) -> bool {
    let w = mask_or_empty(wildcard);
    let s = mask_or_empty(symbol);
    s != 0 && (w ^ s) & s == 0
}

/// The wildcard covering both letters.
pub fn union(first: u8, second: u8) -> u8 {
    from_mask(mask_or_empty(first) | mask_or_empty(second))
}

/// Iterate over the basic letters covered by a letter.
pub fn basic_letters(letter: u8) -> impl Iterator<Item = u8> {
    let m = mask_or_empty(letter);
    BASIC_LETTERS
        .into_iter()
        .enumerate()
        .filter(move |(i, _)| m & (1 << i) != 0)
        .map(|(_, l)| l)
}

/// Letter of a wildcard-aware common ancestor of two letters observed at the same
/// position: equal letters are kept, a wildcard that strictly contains the other
/// letter narrows to it, otherwise the union is taken.
pub fn combine(first: u8, second: u8) -> u8 {
    if first == second {
        first
    } else if is_wildcard(first) && matches_strictly(first, second) {
        second
    } else if is_wildcard(second) && matches_strictly(second, first) {
        first
    } else {
        union(first, second)
    }
}

/// Letter of a child given the parent letter at the same position. A wildcard
/// child that is covered by the parent takes the parent letter.
pub fn concrete_child(parent: u8, child: u8) -> u8 {
    if parent == child {
        child
    } else if is_wildcard(child) {
        if matches_strictly(child, parent) {
            parent
        } else {
            union(parent, child)
        }
    } else {
        child
    }
}

/// True if the sequence consists only of nucleotide letters.
pub fn is_valid_sequence(seq: &[u8]) -> bool {
    seq.iter().all(|&c| is_nucleotide(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_round_trip() {
        for letter in b"ACGTRYSWKMBDHVN" {
            assert_eq!(from_mask(mask(*letter).unwrap()), *letter);
        }
        assert_eq!(mask(b'x'), None);
        assert_eq!(mask(b'a'), Some(1));
    }

    #[test]
    fn test_wildcards() {
        assert!(is_wildcard(b'N'));
        assert!(is_wildcard(b'R'));
        assert!(!is_wildcard(b'A'));
        assert!(matches(b'R', b'A'));
        assert!(!matches(b'R', b'C'));
        assert!(matches_strictly(b'N', b'R'));
        assert!(!matches_strictly(b'R', b'N'));
        assert_eq!(union(b'A', b'G'), b'R');
        assert_eq!(basic_letters(b'R').collect::<Vec<_>>(), b"AG".to_vec());
    }

    #[test]
    fn test_combine_and_concrete_child() {
        assert_eq!(combine(b'A', b'A'), b'A');
        assert_eq!(combine(b'N', b'A'), b'A');
        assert_eq!(combine(b'A', b'R'), b'A');
        assert_eq!(combine(b'A', b'C'), b'M');
        assert_eq!(concrete_child(b'A', b'R'), b'A');
        assert_eq!(concrete_child(b'C', b'R'), b'V');
        assert_eq!(concrete_child(b'R', b'T'), b'T');
    }
}
