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

// Per-layer bookkeeping: OCM page needs derived from the metadata and the
// job descriptors sent to the firmware.

use alloc::string::String;
use cantrip_ml_interface::{JobRequest, MlLayerError, SpFlags, StartJob};
use cantrip_ml_shared::{div_ceil, LayerId, LayerMetadata, OcmConfig, SectionAddrs};
use cantrip_ocm_support::OcmReservation;
use spin::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LayerState {
    Loaded,
    /// A start or stop job is in flight.
    JobActive,
    Started,
    /// A start or stop failed; the layer must be unloaded.
    Unknown,
}

/// OCM pages a layer needs while started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OcmPages {
    pub num_tiles: usize,
    pub wb_pages: u16,
    pub scratch_pages: u16,
    pub relocatable: bool,
}

impl OcmPages {
    // WB pages cover the weights file; scratch pages cover the part of the
    // tile group above the scratch floor. A non-relocatable layer takes
    // every page of its group.
    pub fn compute(metadata: &LayerMetadata, ocm: &OcmConfig) -> Result<Self, MlLayerError> {
        let num_tiles = metadata.num_tiles;
        if num_tiles == 0 || num_tiles > ocm.num_tiles {
            return Err(MlLayerError::InvalidTileCount);
        }
        let group_bytes = num_tiles * ocm.tile_size;
        let group_pages = num_tiles * ocm.pages_per_tile();
        if metadata.scratch_floor_offset > group_bytes {
            return Err(MlLayerError::InvalidArgs);
        }

        let wb_pages = div_ceil(metadata.wb_size, ocm.page_size);
        let mut scratch_pages = div_ceil(group_bytes - metadata.scratch_floor_offset, ocm.page_size);
        if wb_pages + scratch_pages > group_pages {
            return Err(MlLayerError::LayerTooLarge);
        }
        if !metadata.ocm_relocatable {
            scratch_pages = group_pages - wb_pages;
        }

        Ok(OcmPages {
            num_tiles,
            wb_pages: u16::try_from(wb_pages).or(Err(MlLayerError::LayerTooLarge))?,
            scratch_pages: u16::try_from(scratch_pages).or(Err(MlLayerError::LayerTooLarge))?,
            relocatable: metadata.ocm_relocatable,
        })
    }

    pub fn sp_flags(&self) -> SpFlags {
        if self.relocatable {
            SpFlags::empty()
        } else {
            SpFlags::OCM_NONRELOCATABLE
        }
    }
}

/// Snapshot of a layer returned by MlCoordinator::layer_info.
#[derive(Clone, Debug)]
pub struct LayerInfo {
    pub id: LayerId,
    pub name: String,
    pub num_inputs: u8,
    pub num_outputs: u8,
    pub batch_size: u32,
    pub pages: OcmPages,
    pub addrs: SectionAddrs,
    pub state: LayerState,
    pub reservation: Option<OcmReservation>,
}

pub(crate) struct LayerInner {
    pub state: LayerState,
    pub reservation: Option<OcmReservation>,
}

pub(crate) struct Layer {
    pub id: LayerId,
    pub metadata: LayerMetadata,
    pub pages: OcmPages,
    pub batch_size: u32,
    pub addrs: SectionAddrs,
    pub inner: Mutex<LayerInner>,
}

impl Layer {
    pub fn new(
        id: LayerId,
        metadata: LayerMetadata,
        pages: OcmPages,
        batch_size: u32,
        addrs: SectionAddrs,
    ) -> Self {
        Layer {
            id,
            metadata,
            pages,
            batch_size,
            addrs,
            inner: Mutex::new(LayerInner {
                state: LayerState::Loaded,
                reservation: None,
            }),
        }
    }

    pub fn state(&self) -> LayerState { self.inner.lock().state }

    pub fn set_state(&self, state: LayerState) { self.inner.lock().state = state; }

    pub fn info(&self) -> LayerInfo {
        let inner = self.inner.lock();
        LayerInfo {
            id: self.id,
            name: self.metadata.name.clone(),
            num_inputs: self.metadata.num_inputs,
            num_outputs: self.metadata.num_outputs,
            batch_size: self.batch_size,
            pages: self.pages,
            addrs: self.addrs,
            state: inner.state,
            reservation: inner.reservation,
        }
    }

    /// Builds the start job for a layer placed at |reservation|. Section
    /// offsets are relative to the run copy of the model data.
    pub fn start_job(&self, reservation: &OcmReservation, page_size: usize) -> JobRequest {
        let base = self.addrs.init_run;
        let wb_start = (reservation.wb_page_start * page_size) as u64;
        let wb_end = (reservation.wb_page_end() * page_size) as u64;
        let start = StartJob {
            model_src_ddr_addr: self.addrs.init_load,
            model_dst_ddr_addr: self.addrs.init_run,
            model_init_offset: 0,
            model_main_offset: self.addrs.main_run - base,
            model_finish_offset: self.addrs.finish_run - base,
            model_init_size: self.metadata.init_size as u64,
            model_main_size: self.metadata.main_size as u64,
            model_finish_size: self.metadata.finish_size as u64,
            model_wb_offset: self.addrs.wb_run - base,
            tilemask: reservation.tilemask(),
            batch_size: self.batch_size,
            ocm_wb_base_address: wb_start,
            ocm_wb_range_start: wb_start,
            ocm_wb_range_end: if wb_end > wb_start { wb_end - 1 } else { wb_start },
            ddr_wb_base_address: self.addrs.wb_load,
        };
        JobRequest::start(self.id, self.pages.sp_flags(), start)
    }

    pub fn stop_job(&self) -> JobRequest { JobRequest::stop(self.id) }

    // Buffers for |nb_batches| are sized in whole firmware batches.
    fn batches(&self, nb_batches: u32) -> usize {
        div_ceil(nb_batches as usize, self.batch_size as usize)
    }

    /// (quantized, dequantized) input buffer sizes in bytes.
    pub fn input_size(&self, nb_batches: u32) -> (usize, usize) {
        let batches = self.batches(nb_batches);
        (self.metadata.input_size_q * batches, self.metadata.input_size_d * batches)
    }

    /// (quantized, dequantized) output buffer sizes in bytes.
    pub fn output_size(&self, nb_batches: u32) -> (usize, usize) {
        let batches = self.batches(nb_batches);
        (self.metadata.output_size_q * batches, self.metadata.output_size_d * batches)
    }
}
