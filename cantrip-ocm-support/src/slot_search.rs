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

// Free-run search over a page bitmask. A window mask with the requested
// number of bits set is slid up the used mask one page at a time until it
// no longer overlaps any used page.

use crate::bitset::{self, Word};
use alloc::vec::Vec;
use core::cmp;

/// Search state. Holds the sliding window so repeated searches under the
/// allocator lock do not reallocate.
#[derive(Default)]
pub struct SlotSearch {
    window: Vec<Word>,
}

impl SlotSearch {
    pub fn new() -> Self { Self::default() }

    /// Returns the lowest position >= |start| at which |len| free pages
    /// begin. A zero-length request is satisfied one past the end.
    pub fn find_first_fit(&mut self, used: &[Word], len: usize, start: usize) -> Option<usize> {
        let total = bitset::total_bits(used);
        if len == 0 {
            return Some(total);
        }
        if start + len > total {
            return None;
        }

        self.window.clear();
        self.window.resize(used.len(), 0);
        bitset::set_range(&mut self.window, start, len);

        let mut pos = start;
        loop {
            if !bitset::overlaps(&self.window, used) {
                return Some(pos);
            }
            if pos + len == total {
                return None;
            }
            bitset::shift_left_one(&mut self.window);
            pos += 1;
        }
    }

    /// Finds the longest free run of at least |min_len| pages, returning
    /// (position, length). The window starts as large as the free page count
    /// allows and shrinks by one page per failed slide, so the first hit is
    /// the longest run and, among equals, the lowest one.
    pub fn find_largest(&mut self, used: &[Word], min_len: usize) -> Option<(usize, usize)> {
        let total = bitset::total_bits(used);
        let free = total - bitset::count_ones(used);
        let floor = cmp::max(min_len, 1);

        let mut len = free;
        while len >= floor {
            if let Some(pos) = self.find_first_fit(used, len, 0) {
                return Some((pos, len));
            }
            len -= 1;
        }
        if min_len == 0 {
            Some((total, 0))
        } else {
            None
        }
    }
}

pub fn find_first_fit(used: &[Word], len: usize, start: usize) -> Option<usize> {
    SlotSearch::new().find_first_fit(used, len, start)
}

pub fn find_largest(used: &[Word], min_len: usize) -> Option<(usize, usize)> {
    SlotSearch::new().find_largest(used, min_len)
}
