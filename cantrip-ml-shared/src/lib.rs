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

#![cfg_attr(not(test), no_std)]

// Data structures and hardware constants shared by the OCM allocator,
// the layer coordinator and the firmware double.

extern crate alloc;

use alloc::fmt;
use alloc::string::String;
use core::time::Duration;
use static_assertions::const_assert;

/// Number of OCM tiles on the ML accelerator.
pub const ML_OCM_NUMTILES: usize = 8;

/// Size of a single OCM tile in bytes.
pub const ML_OCM_TILESIZE: usize = 0x10_0000;

/// OCM allocation granule.
pub const ML_OCM_PAGESIZE: usize = 0x4000;

/// Maximum number of layers a device can be configured for.
pub const ML_MAX_LAYERS: usize = 64;

/// Alignment of DMA buffers handed to the firmware.
pub const ML_ALIGN_SIZE: usize = 128;

/// Batch size used when the layer metadata does not specify one.
pub const ML_DEFAULT_BATCH_SIZE: u32 = 256;

/// Slow-path job timeout.
pub const ML_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Word type of the OCM page bitmasks.
pub type OcmWord = u32;
pub const OCM_WORD_BITS: usize = OcmWord::BITS as usize;

// The tilemask handed to the firmware is a u64.
const_assert!(ML_OCM_NUMTILES <= 64);
const_assert!(ML_OCM_TILESIZE % ML_OCM_PAGESIZE == 0);
const_assert!((ML_OCM_TILESIZE / ML_OCM_PAGESIZE) % OCM_WORD_BITS == 0);

/// Index of a layer in the coordinator's layer table.
pub type LayerId = u16;

/// Geometry of the on-chip memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OcmConfig {
    pub num_tiles: usize,
    pub tile_size: usize,
    pub page_size: usize,
}

impl OcmConfig {
    /// The geometry fixed by the hardware.
    pub const fn hardware() -> Self {
        OcmConfig {
            num_tiles: ML_OCM_NUMTILES,
            tile_size: ML_OCM_TILESIZE,
            page_size: ML_OCM_PAGESIZE,
        }
    }

    pub fn pages_per_tile(&self) -> usize { self.tile_size / self.page_size }

    pub fn words_per_tile(&self) -> usize { self.pages_per_tile() / OCM_WORD_BITS }

    // A geometry is usable if pages tile each bank exactly, every bank's
    // bitmask is a whole number of words, and a tilemask can name every tile.
    pub fn is_valid(&self) -> bool {
        self.num_tiles != 0
            && self.num_tiles <= 64
            && self.page_size != 0
            && self.tile_size % self.page_size == 0
            && self.pages_per_tile() != 0
            && self.pages_per_tile() % OCM_WORD_BITS == 0
    }
}

impl Default for OcmConfig {
    fn default() -> Self { Self::hardware() }
}

/// Device-level configuration applied when the coordinator is created.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    /// Number of layer slots.
    pub nb_layers: usize,
    pub ocm: OcmConfig,
    /// Deadline for each start/stop job.
    pub job_timeout: Duration,
}

impl DeviceConfig {
    pub fn is_valid(&self) -> bool {
        self.nb_layers != 0 && self.nb_layers <= ML_MAX_LAYERS && self.ocm.is_valid()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            nb_layers: ML_MAX_LAYERS,
            ocm: OcmConfig::hardware(),
            job_timeout: ML_CMD_TIMEOUT,
        }
    }
}

/// The subset of a validated model file header the coordinator needs.
/// Sizes are in bytes.
#[derive(Clone, Debug, Default)]
pub struct LayerMetadata {
    pub name: String,
    pub init_size: usize,
    pub main_size: usize,
    pub finish_size: usize,
    pub wb_size: usize,
    /// Number of adjacent OCM tiles the layer runs on.
    pub num_tiles: usize,
    /// False if the WB region may not share its tiles.
    pub ocm_relocatable: bool,
    /// Offset in the tile group where scratch space starts.
    pub scratch_floor_offset: usize,
    pub batch_size: u32,
    pub num_inputs: u8,
    pub num_outputs: u8,
    pub input_size_q: usize,
    pub input_size_d: usize,
    pub output_size_q: usize,
    pub output_size_d: usize,
}

impl LayerMetadata {
    // Sum of the sections copied to device memory as one block.
    pub fn model_data_size(&self) -> usize {
        self.init_size + self.main_size + self.finish_size + self.wb_size
    }

    // Offset of the WB section from the start of the model data.
    pub fn wb_offset(&self) -> usize { self.init_size + self.main_size + self.finish_size }

    // A layer needs code to run and at least one tile to run on.
    pub fn is_valid(&self) -> bool {
        self.main_size != 0 && self.num_tiles != 0 && self.num_inputs != 0 && self.num_outputs != 0
    }
}

/// Device addresses of a placed layer. Each section exists twice: the
/// "load" copy written by the host and the "run" copy used by the firmware.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SectionAddrs {
    pub init_load: u64,
    pub init_run: u64,
    pub main_load: u64,
    pub main_run: u64,
    pub finish_load: u64,
    pub finish_run: u64,
    pub wb_load: u64,
    pub wb_run: u64,
}

impl fmt::Display for SectionAddrs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "init {:#x}/{:#x} main {:#x}/{:#x} finish {:#x}/{:#x} wb {:#x}/{:#x}",
            self.init_load,
            self.init_run,
            self.main_load,
            self.main_run,
            self.finish_load,
            self.finish_run,
            self.wb_load,
            self.wb_run
        )
    }
}

pub fn round_up(a: usize, b: usize) -> usize {
    if (a % b) == 0 {
        a
    } else {
        a + (b - (a % b))
    }
}

pub fn div_ceil(a: usize, b: usize) -> usize { (a + b - 1) / b }

/// Mask with |count| bits set starting at bit |start|; one bit per tile.
pub fn tilemask(start: usize, count: usize) -> u64 {
    if count == 0 {
        0
    } else if count >= 64 {
        u64::MAX << start
    } else {
        ((1u64 << count) - 1) << start
    }
}
