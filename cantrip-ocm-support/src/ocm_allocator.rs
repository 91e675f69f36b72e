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

// The OCM is split into equal tiles, each with its own page bitmask. A
// layer runs on a group of adjacent tiles; groups are aligned to their own
// size, so a 2-tile layer may use tiles {0,1}, {2,3}, ... but never {1,2}.
//
// Within a group the tiles' pages form one address space: composite page g
// lives on tile (start + g / pages_per_tile). A layer's WB pages are a single
// run anywhere in that space. Scratch pages sit at the top of the group and
// are shared by every layer that runs on it:
//
//   composite page 0                                         n * P
//   +----------+------+-------------+------+---------+--------+
//   | WB layer | free | WB layer    | free | ...     | scratch|
//   +----------+------+-------------+------+---------+--------+
//
// Each tile records how many of its own top pages are scratch and the
// highest WB page it holds, so a new scratch request can tell whether the
// top of a group is still clear of WB data.

use crate::bitset::{self, Word};
use crate::slot_search::SlotSearch;
use alloc::vec;
use alloc::vec::Vec;
use cantrip_ml_shared::{tilemask, OcmConfig};
use core::cmp;
use log::{debug, error, info, trace};
use spin::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// No tile group has room for the WB pages next to its scratch area.
    NoSpace,
    InvalidTileCount,
    /// Release of a range that no live reservation matches.
    NotReserved,
}

/// A committed placement: the tile group and the WB run inside it.
/// wb_page_start is a composite page number relative to the group.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OcmReservation {
    pub tile_start: usize,
    pub num_tiles: usize,
    pub wb_page_start: usize,
    pub wb_pages: u16,
    pub scratch_pages: u16,
}

impl OcmReservation {
    pub fn tilemask(&self) -> u64 { tilemask(self.tile_start, self.num_tiles) }

    // One past the last WB page.
    pub fn wb_page_end(&self) -> usize { self.wb_page_start + self.wb_pages as usize }

    fn same_range(&self, tile_start: usize, num_tiles: usize, wb_start: usize, wb_pages: u16) -> bool {
        self.tile_start == tile_start
            && self.num_tiles == num_tiles
            && self.wb_page_start == wb_start
            && self.wb_pages == wb_pages
    }

    fn covers_tile(&self, tile: usize) -> bool {
        tile >= self.tile_start && tile < self.tile_start + self.num_tiles
    }

    // Scratch pages this reservation needs at the top of group tile |k|.
    fn local_scratch(&self, k: usize, pages_per_tile: usize) -> usize {
        let above = (self.num_tiles - 1 - k) * pages_per_tile;
        cmp::min((self.scratch_pages as usize).saturating_sub(above), pages_per_tile)
    }

    // Local page range of the WB run that falls on group tile |k|.
    fn local_wb(&self, k: usize, pages_per_tile: usize) -> Option<(usize, usize)> {
        let lo = k * pages_per_tile;
        let start = cmp::max(self.wb_page_start, lo);
        let end = cmp::min(self.wb_page_end(), lo + pages_per_tile);
        (start < end).then(|| (start - lo, end - start))
    }
}

struct TileInfo {
    used_pages: Vec<Word>,
    // Highest local page holding WB data; -1 if none.
    last_wb_page: isize,
    // Pages at the top of this tile reserved as scratch.
    scratch_pages: u16,
}

impl TileInfo {
    fn new(words: usize) -> Self {
        TileInfo {
            used_pages: vec![0; words],
            last_wb_page: -1,
            scratch_pages: 0,
        }
    }
}

struct OcmState {
    tiles: Vec<TileInfo>,
    live: Vec<OcmReservation>,
    search: SlotSearch,
    // Composite mask of the group being examined.
    union: Vec<Word>,
}

/// Page allocator for the on-chip memory. All state sits behind one lock;
/// reserve and release each run as a single critical section.
pub struct OcmAllocator {
    config: OcmConfig,
    state: Mutex<OcmState>,
}

impl OcmAllocator {
    pub fn new(config: OcmConfig) -> Self {
        let words = config.words_per_tile();
        OcmAllocator {
            config,
            state: Mutex::new(OcmState {
                tiles: (0..config.num_tiles).map(|_| TileInfo::new(words)).collect(),
                live: Vec::new(),
                search: SlotSearch::new(),
                union: Vec::with_capacity(words * config.num_tiles),
            }),
        }
    }

    pub fn config(&self) -> &OcmConfig { &self.config }

    /// Reserves |wb_pages| contiguous pages and |scratch_pages| of top-of-group
    /// scratch on some group of |num_tiles| adjacent tiles. Every candidate
    /// group is examined and the one offering the longest free run wins; ties
    /// go to the lowest group. Nothing is modified on failure.
    pub fn reserve(
        &self,
        num_tiles: usize,
        wb_pages: u16,
        scratch_pages: u16,
    ) -> Result<OcmReservation, AllocError> {
        if num_tiles == 0 || num_tiles > self.config.num_tiles {
            return Err(AllocError::InvalidTileCount);
        }
        let pages_per_tile = self.config.pages_per_tile();
        let group_pages = num_tiles * pages_per_tile;
        let wb = wb_pages as usize;
        let scratch = scratch_pages as usize;
        if wb + scratch > group_pages {
            return Err(AllocError::NoSpace);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // (group start, position, free run length)
        let mut best: Option<(usize, usize, usize)> = None;
        let mut start = 0;
        while start + num_tiles <= self.config.num_tiles {
            let group = &state.tiles[start..start + num_tiles];
            let committed = committed_scratch(group, pages_per_tile);
            let last_wb = last_wb_page(group, pages_per_tile);
            if scratch > committed && last_wb >= (group_pages - scratch) as isize {
                trace!("OCM: group {} WB data reaches page {}, no room for scratch", start, last_wb);
                start += num_tiles;
                continue;
            }

            state.union.clear();
            for tile in group {
                state.union.extend_from_slice(&tile.used_pages);
            }
            if scratch > committed {
                bitset::set_range(&mut state.union, group_pages - scratch, scratch);
            }

            if let Some((pos, len)) = state.search.find_largest(&state.union, wb) {
                trace!("OCM: group {} free run {} at page {}", start, len, pos);
                if best.map_or(true, |(_, _, best_len)| len > best_len) {
                    best = Some((start, pos, len));
                }
            }
            start += num_tiles;
        }

        let (tile_start, wb_page_start, _) = best.ok_or_else(|| {
            debug!("OCM: no space for {} tiles, {} WB + {} scratch pages", num_tiles, wb, scratch);
            AllocError::NoSpace
        })?;

        let reservation = OcmReservation {
            tile_start,
            num_tiles,
            wb_page_start,
            wb_pages,
            scratch_pages,
        };
        for k in 0..num_tiles {
            let tile = &mut state.tiles[tile_start + k];
            if let Some((first, count)) = reservation.local_wb(k, pages_per_tile) {
                bitset::set_range(&mut tile.used_pages, first, count);
                tile.last_wb_page = cmp::max(tile.last_wb_page, (first + count - 1) as isize);
            }
            let local = reservation.local_scratch(k, pages_per_tile);
            let held = tile.scratch_pages as usize;
            if local > held {
                bitset::set_range(&mut tile.used_pages, pages_per_tile - local, local - held);
                tile.scratch_pages = local as u16;
            }
        }
        state.live.push(reservation);
        debug!(
            "OCM: reserved tiles {:#x} WB pages [{}, {}) scratch {}",
            reservation.tilemask(),
            reservation.wb_page_start,
            reservation.wb_page_end(),
            scratch
        );
        Ok(reservation)
    }

    /// Reserves like reserve() but returns a guard that releases the pages
    /// when dropped unless committed.
    pub fn reserve_scoped(
        &self,
        num_tiles: usize,
        wb_pages: u16,
        scratch_pages: u16,
    ) -> Result<ReservationGuard, AllocError> {
        let reservation = self.reserve(num_tiles, wb_pages, scratch_pages)?;
        Ok(ReservationGuard {
            allocator: self,
            reservation,
            committed: false,
        })
    }

    /// Undoes the reserve() that produced this range. Scratch pages stay
    /// reserved while another live reservation on the same tiles needs them.
    pub fn release(
        &self,
        tile_start: usize,
        num_tiles: usize,
        wb_page_start: usize,
        wb_pages: u16,
    ) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        let index = state
            .live
            .iter()
            .position(|r| r.same_range(tile_start, num_tiles, wb_page_start, wb_pages))
            .ok_or(AllocError::NotReserved)?;
        self.release_locked(&mut state, index);
        Ok(())
    }

    pub fn release_reservation(&self, reservation: &OcmReservation) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        let index = state
            .live
            .iter()
            .position(|r| r == reservation)
            .ok_or(AllocError::NotReserved)?;
        self.release_locked(&mut state, index);
        Ok(())
    }

    fn release_locked(&self, state: &mut OcmState, index: usize) {
        let pages_per_tile = self.config.pages_per_tile();
        let reservation = state.live.swap_remove(index);
        for k in 0..reservation.num_tiles {
            let tile_index = reservation.tile_start + k;
            if let Some((first, count)) = reservation.local_wb(k, pages_per_tile) {
                bitset::clear_range(&mut state.tiles[tile_index].used_pages, first, count);
            }

            // Rebuild this tile's bookkeeping from what is still live.
            let mut scratch = 0;
            let mut last_wb = -1;
            for other in state.live.iter().filter(|r| r.covers_tile(tile_index)) {
                let j = tile_index - other.tile_start;
                scratch = cmp::max(scratch, other.local_scratch(j, pages_per_tile));
                if let Some((first, count)) = other.local_wb(j, pages_per_tile) {
                    last_wb = cmp::max(last_wb, (first + count - 1) as isize);
                }
            }
            let tile = &mut state.tiles[tile_index];
            let held = tile.scratch_pages as usize;
            if scratch < held {
                bitset::clear_range(&mut tile.used_pages, pages_per_tile - held, held - scratch);
            }
            tile.scratch_pages = scratch as u16;
            tile.last_wb_page = last_wb;
        }
        debug!(
            "OCM: released tiles {:#x} WB pages [{}, {})",
            reservation.tilemask(),
            reservation.wb_page_start,
            reservation.wb_page_end()
        );
    }

    /// Returns (first tile, tile count) of a tilemask. The set bits must
    /// form a single run inside the OCM.
    pub fn tile_range(&self, tilemask: u64) -> (usize, usize) {
        assert!(tilemask != 0, "empty tilemask");
        let start = tilemask.trailing_zeros();
        let run = tilemask >> start;
        let count = run.trailing_ones();
        assert!(count == 64 || run >> count == 0, "tilemask {:#x} is not contiguous", tilemask);
        let (start, count) = (start as usize, count as usize);
        assert!(start + count <= self.config.num_tiles, "tilemask {:#x} out of range", tilemask);
        (start, count)
    }

    pub fn pages_in_use(&self) -> usize {
        self.state.lock().tiles.iter().map(|t| bitset::count_ones(&t.used_pages)).sum()
    }

    pub fn tile_used_pages(&self, tile: usize) -> Vec<Word> {
        self.state.lock().tiles[tile].used_pages.clone()
    }

    pub fn tile_scratch_pages(&self, tile: usize) -> u16 { self.state.lock().tiles[tile].scratch_pages }

    pub fn tile_last_wb_page(&self, tile: usize) -> isize { self.state.lock().tiles[tile].last_wb_page }

    pub fn live_reservations(&self) -> usize { self.state.lock().live.len() }

    pub fn debug_state(&self) {
        let state = self.state.lock();
        info!(
            target: "",
            "OCM: {} tiles x {} pages of {:#x} bytes",
            self.config.num_tiles,
            self.config.pages_per_tile(),
            self.config.page_size
        );
        for (i, tile) in state.tiles.iter().enumerate() {
            info!(
                target: "",
                "  tile {}: {:>3} used, last WB {:>3}, scratch {:>3} {:08x?}",
                i,
                bitset::count_ones(&tile.used_pages),
                tile.last_wb_page,
                tile.scratch_pages,
                tile.used_pages
            );
        }
        for r in state.live.iter() {
            info!(
                target: "",
                "  reservation: tiles {:#x} WB [{}, {}) scratch {}",
                r.tilemask(),
                r.wb_page_start,
                r.wb_page_end(),
                r.scratch_pages
            );
        }
    }
}

// Scratch already reserved at the top of the group: the last tile's scratch,
// extended downwards through tiles that are entirely scratch.
fn committed_scratch(group: &[TileInfo], pages_per_tile: usize) -> usize {
    let mut total = 0;
    for tile in group.iter().rev() {
        let scratch = tile.scratch_pages as usize;
        total += scratch;
        if scratch < pages_per_tile {
            break;
        }
    }
    total
}

// Highest composite page of the group holding WB data; -1 if none.
fn last_wb_page(group: &[TileInfo], pages_per_tile: usize) -> isize {
    group
        .iter()
        .enumerate()
        .filter(|(_, tile)| tile.last_wb_page >= 0)
        .map(|(k, tile)| (k * pages_per_tile) as isize + tile.last_wb_page)
        .max()
        .unwrap_or(-1)
}

/// Scoped reservation. Dropping it without commit() returns the pages.
pub struct ReservationGuard<'a> {
    allocator: &'a OcmAllocator,
    reservation: OcmReservation,
    committed: bool,
}

impl<'a> ReservationGuard<'a> {
    pub fn reservation(&self) -> &OcmReservation { &self.reservation }

    /// Keeps the pages reserved past the guard's lifetime.
    pub fn commit(mut self) -> OcmReservation {
        self.committed = true;
        self.reservation
    }
}

impl<'a> Drop for ReservationGuard<'a> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match self.allocator.release_reservation(&self.reservation) {
            Ok(()) => debug!("OCM: rolled back tiles {:#x}", self.reservation.tilemask()),
            Err(e) => error!("OCM: rollback of {:?} failed: {:?}", self.reservation, e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::sync::Arc;
    use assert_hex::assert_eq_hex;
    use std::thread;

    fn hardware() -> OcmAllocator { OcmAllocator::new(OcmConfig::hardware()) }

    fn with_tiles(num_tiles: usize) -> OcmAllocator {
        OcmAllocator::new(OcmConfig {
            num_tiles,
            ..OcmConfig::hardware()
        })
    }

    fn assert_all_clear(ocm: &OcmAllocator) {
        assert_eq!(ocm.pages_in_use(), 0);
        assert_eq!(ocm.live_reservations(), 0);
        for tile in 0..ocm.config().num_tiles {
            assert_eq!(ocm.tile_scratch_pages(tile), 0);
            assert_eq!(ocm.tile_last_wb_page(tile), -1);
        }
    }

    /// 100 WB pages span both tiles of a 2-tile group; scratch takes the
    /// top 10 pages of the second tile.
    #[test]
    fn wb_spans_two_tiles() {
        let ocm = hardware();
        let r = ocm.reserve(2, 100, 10).unwrap();
        assert_eq!(r.tile_start, 0);
        assert_eq!(r.wb_page_start, 0);
        assert_eq_hex!(r.tilemask(), 0x3);
        assert_eq!(ocm.pages_in_use(), 110);

        assert_eq_hex!(ocm.tile_used_pages(0)[0], 0xffff_ffff);
        assert_eq_hex!(ocm.tile_used_pages(0)[1], 0xffff_ffff);
        assert_eq_hex!(ocm.tile_used_pages(1)[0], 0xffff_ffff);
        assert_eq_hex!(ocm.tile_used_pages(1)[1], 0xffc0_000f);
        assert_eq!(ocm.tile_last_wb_page(0), 63);
        assert_eq!(ocm.tile_last_wb_page(1), 35);
        assert_eq!(ocm.tile_scratch_pages(0), 0);
        assert_eq!(ocm.tile_scratch_pages(1), 10);
    }

    /// A second 40-page request cannot share the first group (18 pages are
    /// left between WB and scratch) and lands on the next one.
    #[test]
    fn second_request_moves_to_next_group() {
        let ocm = hardware();
        ocm.reserve(2, 100, 10).unwrap();
        let r = ocm.reserve(2, 40, 10).unwrap();
        assert_eq!(r.tile_start, 2);
        assert_eq!(r.wb_page_start, 0);
        assert_eq!(ocm.pages_in_use(), 160);

        // With only one group the same request deterministically fails.
        let ocm = with_tiles(2);
        ocm.reserve(2, 100, 10).unwrap();
        assert_eq!(ocm.reserve(2, 40, 10), Err(AllocError::NoSpace));
        assert_eq!(ocm.reserve(2, 18, 10).unwrap().wb_page_start, 100);
    }

    #[test]
    fn invalid_tile_count() {
        let ocm = hardware();
        assert_eq!(ocm.reserve(0, 1, 0), Err(AllocError::InvalidTileCount));
        assert_eq!(ocm.reserve(9, 1, 0), Err(AllocError::InvalidTileCount));
        assert_eq!(ocm.reserve(1, 60, 5), Err(AllocError::NoSpace));
    }

    /// Layers on the same group share its scratch pages.
    #[test]
    fn scratch_is_shared() {
        let ocm = with_tiles(1);
        let a = ocm.reserve(1, 20, 10).unwrap();
        let b = ocm.reserve(1, 20, 6).unwrap();
        assert_eq!(b.wb_page_start, 20);
        assert_eq!(ocm.pages_in_use(), 50);
        assert_eq!(ocm.tile_scratch_pages(0), 10);

        ocm.release_reservation(&a).unwrap();
        assert_eq!(ocm.tile_scratch_pages(0), 6);
        assert_eq!(ocm.pages_in_use(), 26);
        assert_eq!(ocm.tile_last_wb_page(0), 39);

        ocm.release_reservation(&b).unwrap();
        assert_all_clear(&ocm);
    }

    /// Growing the scratch area is refused when WB data already occupies
    /// the top of the group.
    #[test]
    fn scratch_cannot_grow_into_wb() {
        let ocm = with_tiles(1);
        ocm.reserve(1, 50, 4).unwrap();
        let before = ocm.tile_used_pages(0);
        assert_eq!(ocm.reserve(1, 5, 20), Err(AllocError::NoSpace));
        assert_eq!(ocm.tile_used_pages(0), before);
        assert_eq!(ocm.reserve(1, 5, 4).unwrap().wb_page_start, 50);
    }

    /// A whole-group scratch claim keeps other layers off the group.
    #[test]
    fn exclusive_group() {
        let ocm = hardware();
        let exclusive = ocm.reserve(1, 10, 54).unwrap();
        assert_eq!(exclusive.tile_start, 0);
        assert_eq_hex!(ocm.tile_used_pages(0)[0], 0xffff_ffff);
        assert_eq_hex!(ocm.tile_used_pages(0)[1], 0xffff_ffff);
        assert_eq!(ocm.reserve(1, 1, 0).unwrap().tile_start, 1);

        // And an exclusive layer skips a tile that is already shared.
        let ocm = hardware();
        ocm.reserve(1, 5, 10).unwrap();
        assert_eq!(ocm.reserve(1, 10, 54).unwrap().tile_start, 1);
    }

    /// The longest free run wins across groups; ties go to the lowest.
    #[test]
    fn best_group_wins() {
        let ocm = with_tiles(2);
        let a = ocm.reserve(1, 30, 0).unwrap();
        let b = ocm.reserve(1, 10, 0).unwrap();
        assert_eq!(a.tile_start, 0);
        assert_eq!(b.tile_start, 1);
        // Tile 0 has 34 free pages, tile 1 has 54.
        assert_eq!(ocm.reserve(1, 20, 0).unwrap().tile_start, 1);
    }

    #[test]
    fn failed_reserve_does_not_mutate() {
        let ocm = with_tiles(2);
        ocm.reserve(2, 120, 0).unwrap();
        let before: Vec<_> = (0..2).map(|t| ocm.tile_used_pages(t)).collect();
        assert_eq!(ocm.reserve(2, 9, 0), Err(AllocError::NoSpace));
        assert_eq!(ocm.reserve(1, 9, 0), Err(AllocError::NoSpace));
        let after: Vec<_> = (0..2).map(|t| ocm.tile_used_pages(t)).collect();
        assert_eq!(before, after);
        assert_eq!(ocm.live_reservations(), 1);
    }

    /// Matched reserve/release pairs in any order leave every tile clear.
    #[test]
    fn release_restores_empty_state() {
        let ocm = hardware();
        let requests = [(1, 12, 4), (2, 70, 8), (1, 40, 0), (4, 200, 30), (1, 3, 2), (2, 5, 20)];
        let mut held: Vec<_> = requests
            .iter()
            .map(|(n, wb, s)| ocm.reserve(*n, *wb, *s).unwrap())
            .collect();

        // No two WB runs on a tile overlap.
        for (i, a) in held.iter().enumerate() {
            for b in held.iter().skip(i + 1) {
                for tile in 0..8 {
                    if !(a.covers_tile(tile) && b.covers_tile(tile)) {
                        continue;
                    }
                    let p = ocm.config().pages_per_tile();
                    let ra = a.local_wb(tile - a.tile_start, p);
                    let rb = b.local_wb(tile - b.tile_start, p);
                    if let (Some((sa, ca)), Some((sb, cb))) = (ra, rb) {
                        assert!(sa + ca <= sb || sb + cb <= sa, "{:?} overlaps {:?}", a, b);
                    }
                }
            }
        }

        for i in [3, 0, 5, 1, 4, 2] {
            let r = held[i];
            ocm.release(r.tile_start, r.num_tiles, r.wb_page_start, r.wb_pages).unwrap();
        }
        held.clear();
        assert_all_clear(&ocm);
    }

    #[test]
    fn release_unknown_range() {
        let ocm = hardware();
        assert_eq!(ocm.release(0, 1, 0, 5), Err(AllocError::NotReserved));
        let r = ocm.reserve(1, 5, 0).unwrap();
        assert_eq!(ocm.release(0, 1, 0, 4), Err(AllocError::NotReserved));
        ocm.release_reservation(&r).unwrap();
        assert_eq!(ocm.release_reservation(&r), Err(AllocError::NotReserved));
        assert_all_clear(&ocm);
    }

    #[test]
    fn guard_rolls_back_unless_committed() {
        let ocm = hardware();
        {
            let guard = ocm.reserve_scoped(2, 64, 8).unwrap();
            assert_eq!(guard.reservation().num_tiles, 2);
            assert_eq!(ocm.pages_in_use(), 72);
        }
        assert_all_clear(&ocm);

        let r = ocm.reserve_scoped(1, 4, 0).unwrap().commit();
        assert_eq!(ocm.pages_in_use(), 4);
        ocm.release_reservation(&r).unwrap();
        assert_all_clear(&ocm);
    }

    #[test]
    fn tile_ranges() {
        let ocm = hardware();
        assert_eq!(ocm.tile_range(0x1), (0, 1));
        assert_eq!(ocm.tile_range(0x6), (1, 2));
        assert_eq!(ocm.tile_range(0xf0), (4, 4));
        assert_eq!(ocm.tile_range(0xff), (0, 8));
    }

    #[test]
    #[should_panic]
    fn tile_range_not_contiguous() { hardware().tile_range(0x5); }

    #[test]
    #[should_panic]
    fn tile_range_outside_ocm() { hardware().tile_range(0x300); }

    #[test]
    fn concurrent_reserve_release() {
        let ocm = Arc::new(hardware());
        let workers: Vec<_> = (0..4)
            .map(|w| {
                let ocm = Arc::clone(&ocm);
                thread::spawn(move || {
                    for i in 0..100 {
                        let tiles = 1 << ((w + i) % 3);
                        match ocm.reserve(tiles, 8 + (i % 16) as u16, (w * 2) as u16) {
                            Ok(r) => ocm.release_reservation(&r).unwrap(),
                            Err(e) => assert_eq!(e, AllocError::NoSpace),
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_all_clear(&ocm);
    }
}
