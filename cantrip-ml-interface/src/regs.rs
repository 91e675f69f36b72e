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

// Scratch register window shared between the host and the ML firmware.

use crate::job::{Ticks, JOB_DESC_SIZE, JOB_RESULT_SIZE};
use core::time::Duration;
use modular_bitfield::prelude::*;

/// Offsets of the 64-bit registers in the device window.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScratchReg {
    MlCfg = 0x1_0000,
    MlrBase = 0x1_0008,
    WorkPtr = 0x0c00,
    FwCtrl = 0x0c08,
    DbgBufferHeadC0 = 0x0c10,
    DbgBufferTailC0 = 0x0c18,
    DbgBufferHeadC1 = 0x0c20,
    DbgBufferTailC1 = 0x0c28,
}

impl ScratchReg {
    /// Registers zeroed when the device is closed.
    pub const SCRATCH: [ScratchReg; 6] = [
        ScratchReg::WorkPtr,
        ScratchReg::FwCtrl,
        ScratchReg::DbgBufferHeadC0,
        ScratchReg::DbgBufferTailC0,
        ScratchReg::DbgBufferHeadC1,
        ScratchReg::DbgBufferTailC1,
    ];

    pub fn offset(self) -> usize { self as usize }
}

#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct FwCtrl {
    /// Host has published a job at WORK_PTR.
    pub valid: bool,
    pub done: bool,
    #[skip]
    _unused: B62,
}

#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct MlCfg {
    pub ena: bool,
    #[skip]
    _unused: B63,
}

/// Accessors for the device's scratch registers and job memory.
pub trait ScratchRegisters {
    fn read64(&mut self, reg: ScratchReg) -> u64;
    fn write64(&mut self, reg: ScratchReg, value: u64);

    /// Device address of the job descriptor window, written to WORK_PTR.
    fn job_window_addr(&self) -> u64;
    fn write_job(&mut self, desc: &[u8; JOB_DESC_SIZE]);

    /// Completion word; POLL_JOB_START until the firmware finishes.
    fn read_status(&mut self) -> u64;
    fn write_status(&mut self, status: u64);
    fn read_result(&mut self) -> [u8; JOB_RESULT_SIZE];

    fn fw_ctrl(&mut self) -> FwCtrl {
        FwCtrl::from_bytes(self.read64(ScratchReg::FwCtrl).to_ne_bytes())
    }
    fn set_fw_ctrl(&mut self, ctrl: FwCtrl) {
        self.write64(ScratchReg::FwCtrl, u64::from_ne_bytes(ctrl.into_bytes()));
    }
    fn ml_cfg(&mut self) -> MlCfg { MlCfg::from_bytes(self.read64(ScratchReg::MlCfg).to_ne_bytes()) }
    fn set_ml_cfg(&mut self, cfg: MlCfg) {
        self.write64(ScratchReg::MlCfg, u64::from_ne_bytes(cfg.into_bytes()));
    }
}

/// Monotonic tick source used for job deadlines.
pub trait Timebase {
    fn now(&self) -> Ticks;
    // Returns the tick at which |duration| will have elapsed.
    fn deadline(&self, duration: Duration) -> Ticks;
}

/// Device-wide controls used by start/stop/close.
pub trait DeviceControl {
    fn set_enabled(&self, enable: bool);
    fn is_enabled(&self) -> bool;
    /// Zeroes the job and debug-buffer scratch registers.
    fn clear_scratch(&self);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fw_ctrl_bits() {
        let ctrl = FwCtrl::new().with_valid(true);
        assert_eq!(u64::from_ne_bytes(ctrl.into_bytes()), 1);
        let ctrl = FwCtrl::from_bytes(2u64.to_ne_bytes());
        assert!(ctrl.done());
        assert!(!ctrl.valid());
    }

    #[test]
    fn ml_cfg_bits() {
        let cfg = MlCfg::from_bytes(0xffu64.to_ne_bytes());
        assert!(cfg.ena());
        assert_eq!(u64::from_ne_bytes(cfg.with_ena(false).into_bytes()), 0xfe);
    }
}
