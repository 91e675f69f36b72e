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

use crate::MlLayerError;
use cantrip_ml_shared::{round_up, LayerMetadata, SectionAddrs, ML_ALIGN_SIZE};

/// DMA placement of a layer's model data in device memory.
///
/// The model data (init, main, finish and WB sections, back to back) is
/// kept twice: a load copy written by the host and a run copy the firmware
/// executes from. The run copy follows the load copy, aligned to
/// ML_ALIGN_SIZE.
pub trait SectionPlacement {
    /// Copies |data| to device address |addr|.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), MlLayerError>;

    fn place(&self, base: u64, metadata: &LayerMetadata) -> SectionAddrs {
        let run_base = base + round_up(metadata.model_data_size(), ML_ALIGN_SIZE) as u64;
        let init = 0u64;
        let main = init + metadata.init_size as u64;
        let finish = main + metadata.main_size as u64;
        let wb = finish + metadata.finish_size as u64;
        SectionAddrs {
            init_load: base + init,
            init_run: run_base + init,
            main_load: base + main,
            main_run: run_base + main,
            finish_load: base + finish,
            finish_run: run_base + finish,
            wb_load: base + wb,
            wb_run: run_base + wb,
        }
    }

    /// Replaces the weights and bias in both copies.
    fn update_weights(&self, addrs: &SectionAddrs, wb: &[u8]) -> Result<(), MlLayerError> {
        self.write(addrs.wb_load, wb)?;
        self.write(addrs.wb_run, wb)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_hex::assert_eq_hex;
    use core::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        writes: RefCell<Vec<(u64, usize)>>,
    }

    impl SectionPlacement for Recorder {
        fn write(&self, addr: u64, data: &[u8]) -> Result<(), MlLayerError> {
            self.writes.borrow_mut().push((addr, data.len()));
            Ok(())
        }
    }

    #[test]
    fn run_copy_follows_aligned_load_copy() {
        let metadata = LayerMetadata {
            init_size: 0x10,
            main_size: 0x100,
            finish_size: 0x8,
            wb_size: 0x20,
            ..Default::default()
        };
        let addrs = Recorder::default().place(0x8000_0000, &metadata);
        assert_eq_hex!(addrs.init_load, 0x8000_0000);
        assert_eq_hex!(addrs.main_load, 0x8000_0010);
        assert_eq_hex!(addrs.finish_load, 0x8000_0110);
        assert_eq_hex!(addrs.wb_load, 0x8000_0118);
        // 0x138 bytes of model data round up to 0x180.
        assert_eq_hex!(addrs.init_run, 0x8000_0180);
        assert_eq_hex!(addrs.wb_run, 0x8000_0298);
    }

    #[test]
    fn weights_written_to_both_copies() {
        let recorder = Recorder::default();
        let addrs = SectionAddrs {
            wb_load: 0x100,
            wb_run: 0x200,
            ..Default::default()
        };
        recorder.update_weights(&addrs, &[0u8; 16]).unwrap();
        assert_eq!(*recorder.writes.borrow(), vec![(0x100, 16), (0x200, 16)]);
    }
}
