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

// Integer-status layer calls for the device driver glue: 0 on success,
// otherwise a positive errno.

use crate::MlCoordinator;
use cantrip_ml_interface::{DeviceControl, JobChannel, MlLayerError, SectionPlacement};
use cantrip_ml_shared::{LayerId, LayerMetadata};

fn status(result: Result<(), MlLayerError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

/// Loads a layer; on success its id is written to |id|.
pub fn layer_load<C, P>(
    coord: &MlCoordinator<C, P>,
    metadata: LayerMetadata,
    dma_base: u64,
    id: &mut LayerId,
) -> i32
where
    C: JobChannel + DeviceControl,
    P: SectionPlacement,
{
    status(coord.load(metadata, dma_base).map(|loaded| *id = loaded))
}

pub fn layer_start<C, P>(coord: &MlCoordinator<C, P>, id: LayerId) -> i32
where
    C: JobChannel + DeviceControl,
    P: SectionPlacement,
{
    status(coord.start(id))
}

pub fn layer_stop<C, P>(coord: &MlCoordinator<C, P>, id: LayerId) -> i32
where
    C: JobChannel + DeviceControl,
    P: SectionPlacement,
{
    status(coord.stop(id))
}

pub fn layer_unload<C, P>(coord: &MlCoordinator<C, P>, id: LayerId) -> i32
where
    C: JobChannel + DeviceControl,
    P: SectionPlacement,
{
    status(coord.unload(id))
}
