// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Multi-word page bitmasks. Bit 0 of word 0 is page 0.

use cantrip_ml_shared::{OcmWord, OCM_WORD_BITS};

pub type Word = OcmWord;
pub const WORD_BITS: usize = OCM_WORD_BITS;

#[inline]
fn locate(bit: usize) -> (usize, Word) { (bit / WORD_BITS, 1 << (bit % WORD_BITS)) }

pub fn total_bits(mask: &[Word]) -> usize { mask.len() * WORD_BITS }

pub fn set(mask: &mut [Word], bit: usize) {
    let (w, b) = locate(bit);
    mask[w] |= b;
}

pub fn clear(mask: &mut [Word], bit: usize) {
    let (w, b) = locate(bit);
    mask[w] &= !b;
}

pub fn test(mask: &[Word], bit: usize) -> bool {
    let (w, b) = locate(bit);
    mask[w] & b != 0
}

/// Shifts the whole mask one bit towards the most significant end. The
/// carry out of each word moves into bit 0 of the next; the top bit of the
/// last word is dropped.
pub fn shift_left_one(mask: &mut [Word]) {
    let mut carry = 0;
    for word in mask.iter_mut() {
        let next = *word >> (WORD_BITS - 1);
        *word = (*word << 1) | carry;
        carry = next;
    }
}

pub fn set_range(mask: &mut [Word], start: usize, len: usize) {
    for bit in start..start + len {
        set(mask, bit);
    }
}

pub fn clear_range(mask: &mut [Word], start: usize, len: usize) {
    for bit in start..start + len {
        clear(mask, bit);
    }
}

pub fn overlaps(a: &[Word], b: &[Word]) -> bool { a.iter().zip(b).any(|(x, y)| x & y != 0) }

pub fn or_into(dst: &mut [Word], src: &[Word]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d |= s;
    }
}

pub fn count_ones(mask: &[Word]) -> usize { mask.iter().map(|w| w.count_ones() as usize).sum() }

#[cfg(test)]
mod test {
    use super::*;
    use assert_hex::assert_eq_hex;

    /// A single bit walks up the mask one position per shift and falls off
    /// the top.
    #[test]
    fn shift_walks_single_bit() {
        const WORDS: usize = 3;
        let total = WORDS * WORD_BITS;
        for start in [0, 5, WORD_BITS - 1, WORD_BITS, total - 3] {
            let mut mask = [0 as Word; WORDS];
            set(&mut mask, start);
            for k in 1..=(total - start) {
                shift_left_one(&mut mask);
                if start + k < total {
                    assert_eq!(count_ones(&mask), 1);
                    assert!(test(&mask, start + k), "start {} k {}", start, k);
                } else {
                    assert_eq!(count_ones(&mask), 0);
                }
            }
        }
    }

    #[test]
    fn shift_carries_between_words() {
        let mut mask: [Word; 2] = [0x8000_0001, 0];
        shift_left_one(&mut mask);
        assert_eq_hex!(mask[0], 0x2);
        assert_eq_hex!(mask[1], 0x1);
    }

    #[test]
    fn ranges() {
        let mut mask = [0 as Word; 2];
        set_range(&mut mask, 30, 4);
        assert_eq_hex!(mask[0], 0xc000_0000);
        assert_eq_hex!(mask[1], 0x3);
        clear_range(&mut mask, 31, 2);
        assert_eq_hex!(mask[0], 0x4000_0000);
        assert_eq_hex!(mask[1], 0x2);
        assert_eq!(count_ones(&mask), 2);
    }

    #[test]
    fn overlap_and_union() {
        let mut a: [Word; 2] = [0x0f, 0];
        let b: [Word; 2] = [0xf0, 0x1];
        assert!(!overlaps(&a, &b));
        or_into(&mut a, &b);
        assert_eq_hex!(a[0], 0xff);
        assert!(overlaps(&a, &b));
        clear(&mut a, 32);
        assert!(!test(&a, 32));
    }
}
