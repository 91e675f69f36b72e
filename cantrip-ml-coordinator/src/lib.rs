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

//! ML layer coordinator: loads layers, places their WB data in OCM when
//! started and drives the firmware start/stop jobs.
//!
//! Locking: the layer table lock is taken before a layer's own lock and
//! both are dropped before the OCM allocator is touched. No lock is held
//! while a job is in flight; the JobActive state keeps other callers off
//! the layer meanwhile.

extern crate alloc;

pub mod api;
mod job_queue;
mod layer;

pub use job_queue::{JobHandle, ScratchJobChannel};
pub use layer::{LayerInfo, LayerState, OcmPages};

use alloc::sync::Arc;
use alloc::vec::Vec;
use cantrip_ml_interface::*;
use cantrip_ml_shared::*;
use cantrip_ocm_support::{AllocError, OcmAllocator};
use layer::Layer;
use log::{debug, error, info, trace, warn};
use spin::Mutex;

/// Statistics on non-happy-path events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub start_failures: u32,
    pub stop_failures: u32,
    pub no_space: u32,
    pub timeouts: u32,
    pub firmware_errors: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Configured,
    Started,
    Closed,
}

pub struct MlCoordinator<C, P> {
    config: DeviceConfig,
    /// Firmware job queue and device controls.
    channel: C,
    /// Writes model data into device memory.
    placement: P,
    ocm: OcmAllocator,
    device: Mutex<DeviceState>,
    layers: Mutex<Vec<Option<Arc<Layer>>>>,
    statistics: Mutex<Statistics>,
}

impl<C, P> MlCoordinator<C, P>
where
    C: JobChannel + DeviceControl,
    P: SectionPlacement,
{
    pub fn new(config: DeviceConfig, channel: C, placement: P) -> Result<Self, MlLayerError> {
        if !config.is_valid() {
            error!("Invalid device config {:?}", config);
            return Err(MlLayerError::InvalidArgs);
        }
        Ok(MlCoordinator {
            config,
            channel,
            placement,
            ocm: OcmAllocator::new(config.ocm),
            device: Mutex::new(DeviceState::Configured),
            layers: Mutex::new((0..config.nb_layers).map(|_| None).collect()),
            statistics: Mutex::new(Statistics::default()),
        })
    }

    pub fn config(&self) -> &DeviceConfig { &self.config }

    pub fn ocm(&self) -> &OcmAllocator { &self.ocm }

    pub fn channel(&self) -> &C { &self.channel }

    pub fn device_state(&self) -> DeviceState { *self.device.lock() }

    fn check_open(&self) -> Result<(), MlLayerError> {
        if *self.device.lock() == DeviceState::Closed {
            return Err(MlLayerError::InvalidState);
        }
        Ok(())
    }

    /// Enables the ML block.
    pub fn start_device(&self) -> Result<(), MlLayerError> {
        let mut device = self.device.lock();
        if *device == DeviceState::Closed {
            return Err(MlLayerError::InvalidState);
        }
        self.channel.set_enabled(true);
        if !self.channel.is_enabled() {
            error!("ML_CFG enable did not take");
            return Err(MlLayerError::FirmwareError);
        }
        *device = DeviceState::Started;
        debug!("Device started");
        Ok(())
    }

    pub fn stop_device(&self) -> Result<(), MlLayerError> {
        let mut device = self.device.lock();
        if *device == DeviceState::Closed {
            return Err(MlLayerError::InvalidState);
        }
        self.channel.set_enabled(false);
        *device = DeviceState::Configured;
        debug!("Device stopped");
        Ok(())
    }

    /// Stops and unloads every layer, then returns the job queue and the
    /// scratch registers to their reset state. Failures are logged and do
    /// not stop the teardown.
    pub fn close(&self) {
        let ids: Vec<LayerId> = self.layers.lock().iter().flatten().map(|layer| layer.id).collect();
        for id in ids {
            let state = self.layer(id).map(|layer| layer.state());
            if state == Ok(LayerState::Started) {
                if let Err(e) = self.stop(id) {
                    warn!("Layer {}: stop on close failed: {:?}", id, e);
                }
            }
            if let Err(e) = self.unload(id) {
                warn!("Layer {}: unload on close failed: {:?}", id, e);
            }
        }
        self.channel.reset();
        self.channel.clear_scratch();
        self.channel.set_enabled(false);
        *self.device.lock() = DeviceState::Closed;
        info!("Device closed");
    }

    fn layer(&self, id: LayerId) -> Result<Arc<Layer>, MlLayerError> {
        lookup(&self.layers.lock(), id).map(Arc::clone)
    }

    /// Registers a layer whose model data is placed at |dma_base|. Returns
    /// the layer's id.
    pub fn load(&self, metadata: LayerMetadata, dma_base: u64) -> Result<LayerId, MlLayerError> {
        self.check_open()?;
        if !metadata.is_valid() {
            error!("{}: invalid metadata", metadata.name);
            return Err(MlLayerError::InvalidArgs);
        }
        let pages = OcmPages::compute(&metadata, &self.config.ocm).map_err(|e| {
            error!("{}: cannot fit OCM: {:?}", metadata.name, e);
            e
        })?;
        let batch_size = if metadata.batch_size == 0 {
            ML_DEFAULT_BATCH_SIZE
        } else {
            metadata.batch_size
        };
        let addrs = self.placement.place(dma_base, &metadata);

        let mut layers = self.layers.lock();
        let index = layers
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(MlLayerError::NoLayerSlotsLeft)?;
        let id = index as LayerId;
        debug!(
            "Layer {} ({}): loaded, {} tiles, {} WB + {} scratch pages, {}",
            id, metadata.name, pages.num_tiles, pages.wb_pages, pages.scratch_pages, addrs
        );
        layers[index] = Some(Arc::new(Layer::new(id, metadata, pages, batch_size, addrs)));
        Ok(id)
    }

    /// Drops a layer that is not started and has no job in flight.
    pub fn unload(&self, id: LayerId) -> Result<(), MlLayerError> {
        let mut layers = self.layers.lock();
        let layer = lookup(&layers, id)?;
        match layer.state() {
            LayerState::Loaded | LayerState::Unknown => {}
            state => {
                debug!("Layer {}: unload refused in {:?}", id, state);
                return Err(MlLayerError::Busy);
            }
        }
        layers[id as usize] = None;
        debug!("Layer {}: unloaded", id);
        Ok(())
    }

    /// Reserves OCM for the layer and runs the firmware start job. The
    /// reservation is returned if the job fails.
    pub fn start(&self, id: LayerId) -> Result<(), MlLayerError> {
        self.check_open()?;
        let layer = {
            let layers = self.layers.lock();
            let layer = lookup(&layers, id)?;
            let mut inner = layer.inner.lock();
            match inner.state {
                LayerState::Started => {
                    debug!("Layer {}: already started", id);
                    return Ok(());
                }
                LayerState::JobActive => return Err(MlLayerError::Busy),
                LayerState::Unknown => return Err(MlLayerError::InvalidState),
                LayerState::Loaded => inner.state = LayerState::JobActive,
            }
            Arc::clone(layer)
        };

        let pages = &layer.pages;
        let guard = match self.ocm.reserve_scoped(pages.num_tiles, pages.wb_pages, pages.scratch_pages) {
            Ok(guard) => guard,
            Err(e) => {
                error!("Layer {} ({}): OCM reserve failed: {:?}", id, layer.metadata.name, e);
                self.statistics.lock().no_space += 1;
                layer.set_state(LayerState::Unknown);
                return Err(match e {
                    AllocError::InvalidTileCount => MlLayerError::InvalidTileCount,
                    _ => MlLayerError::NoSpace,
                });
            }
        };

        let request = layer.start_job(guard.reservation(), self.config.ocm.page_size);
        if let Err(e) = self.run_job(&layer, &request) {
            drop(guard);
            self.statistics.lock().start_failures += 1;
            layer.set_state(LayerState::Unknown);
            return Err(e);
        }

        let reservation = guard.commit();
        let mut inner = layer.inner.lock();
        inner.reservation = Some(reservation);
        inner.state = LayerState::Started;
        debug!("Layer {}: started on tiles {:#x}", id, reservation.tilemask());
        Ok(())
    }

    /// Returns the layer's OCM pages and runs the firmware stop job.
    pub fn stop(&self, id: LayerId) -> Result<(), MlLayerError> {
        self.check_open()?;
        let (layer, reservation) = {
            let layers = self.layers.lock();
            let layer = lookup(&layers, id)?;
            let mut inner = layer.inner.lock();
            match inner.state {
                LayerState::Loaded => {
                    debug!("Layer {}: not started", id);
                    return Ok(());
                }
                LayerState::JobActive => return Err(MlLayerError::Busy),
                LayerState::Unknown => return Err(MlLayerError::InvalidState),
                LayerState::Started => inner.state = LayerState::JobActive,
            }
            (Arc::clone(layer), inner.reservation.take())
        };

        // The pages go back even if the stop job fails.
        if let Some(reservation) = reservation {
            if let Err(e) = self.ocm.release_reservation(&reservation) {
                error!("Layer {}: OCM release failed: {:?}", id, e);
            }
        }

        match self.run_job(&layer, &layer.stop_job()) {
            Ok(()) => {
                layer.set_state(LayerState::Loaded);
                debug!("Layer {}: stopped", id);
                Ok(())
            }
            Err(e) => {
                self.statistics.lock().stop_failures += 1;
                layer.set_state(LayerState::Unknown);
                Err(e)
            }
        }
    }

    fn run_job(&self, layer: &Layer, request: &JobRequest) -> Result<(), MlLayerError> {
        trace!("Layer {}: {:?} job", layer.id, request.job_type);
        match self.channel.run(request, self.config.job_timeout) {
            Ok(result) if result.is_success() => Ok(()),
            Ok(result) => {
                error!(
                    "Layer {} ({}): {:?} job failed with {:#x}",
                    layer.id, layer.metadata.name, request.job_type, result.error_code
                );
                self.statistics.lock().firmware_errors += 1;
                Err(MlLayerError::FirmwareError)
            }
            Err(JobError::Timeout) => {
                error!("Layer {} ({}): {:?} job timed out", layer.id, layer.metadata.name, request.job_type);
                self.statistics.lock().timeouts += 1;
                Err(MlLayerError::Timeout)
            }
            Err(e) => {
                error!("Layer {}: {:?} job error {:?}", layer.id, request.job_type, e);
                Err(e.into())
            }
        }
    }

    pub fn layer_info(&self, id: LayerId) -> Result<LayerInfo, MlLayerError> {
        Ok(self.layer(id)?.info())
    }

    /// Replaces the weights and bias of a loaded layer.
    pub fn params_update(&self, id: LayerId, wb: &[u8]) -> Result<(), MlLayerError> {
        self.check_open()?;
        let layer = self.layer(id)?;
        if wb.len() != layer.metadata.wb_size {
            error!("Layer {}: {} WB bytes, expected {}", id, wb.len(), layer.metadata.wb_size);
            return Err(MlLayerError::InvalidArgs);
        }
        // Hold the layer lock so a start cannot begin mid-copy.
        let inner = layer.inner.lock();
        match inner.state {
            LayerState::Loaded => self.placement.update_weights(&layer.addrs, wb),
            LayerState::Unknown => Err(MlLayerError::InvalidState),
            _ => Err(MlLayerError::Busy),
        }
    }

    /// (quantized, dequantized) input buffer sizes for |nb_batches|.
    pub fn io_input_size(&self, id: LayerId, nb_batches: u32) -> Result<(usize, usize), MlLayerError> {
        Ok(self.layer(id)?.input_size(nb_batches))
    }

    /// (quantized, dequantized) output buffer sizes for |nb_batches|.
    pub fn io_output_size(&self, id: LayerId, nb_batches: u32) -> Result<(usize, usize), MlLayerError> {
        Ok(self.layer(id)?.output_size(nb_batches))
    }

    pub fn statistics(&self) -> Statistics { *self.statistics.lock() }

    pub fn debug_state(&self) {
        info!(target: "", "Device: {:?}", self.device_state());
        info!(target: "", "Layers:");
        for layer in self.layers.lock().iter().flatten() {
            let info = layer.info();
            info!(
                target: "",
                "  {}: {} {:?} batch {} {:?}",
                info.id,
                info.name,
                info.state,
                info.batch_size,
                info.reservation
            );
        }
        info!(target: "", "{:?}", self.statistics());
        self.ocm.debug_state();
    }
}

fn lookup(layers: &[Option<Arc<Layer>>], id: LayerId) -> Result<&Arc<Layer>, MlLayerError> {
    layers
        .get(id as usize)
        .and_then(|slot| slot.as_ref())
        .ok_or(MlLayerError::NoSuchLayer)
}
