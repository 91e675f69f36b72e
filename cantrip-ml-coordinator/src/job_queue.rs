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

// Slow-path job queue over the scratch registers. A single job slot is
// shared by all layers: the host publishes a descriptor, points WORK_PTR at
// it and sets FW_CTRL.valid; the firmware writes the result and flips the
// completion word to POLL_JOB_FINISH.

use cantrip_ml_interface::*;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use log::{error, trace};
use spin::Mutex;

pub struct JobHandle {
    tag: u64,
}

impl JobHandle {
    pub fn tag(&self) -> u64 { self.tag }
}

pub struct ScratchJobChannel<R, T> {
    regs: Mutex<R>,
    timebase: T,
    next_tag: AtomicU64,
}

impl<R: ScratchRegisters, T: Timebase> ScratchJobChannel<R, T> {
    pub fn new(regs: R, timebase: T) -> Self {
        ScratchJobChannel {
            regs: Mutex::new(regs),
            timebase,
            next_tag: AtomicU64::new(1),
        }
    }
}

impl<R: ScratchRegisters, T: Timebase> JobChannel for ScratchJobChannel<R, T> {
    type Handle = JobHandle;

    fn submit(&self, request: &JobRequest) -> Result<JobHandle, JobError> {
        let mut regs = self.regs.lock();
        if regs.fw_ctrl().valid() {
            return Err(JobError::QueueBusy);
        }

        let mut request = request.clone();
        request.tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut desc = [0u8; JOB_DESC_SIZE];
        let len = request.encode(&mut desc)?;

        regs.write_status(POLL_JOB_START);
        regs.write_job(&desc);
        let work_ptr = regs.job_window_addr();
        regs.write64(ScratchReg::WorkPtr, work_ptr);
        regs.set_fw_ctrl(FwCtrl::new().with_valid(true));
        trace!("job {}: {} byte descriptor at {:#x}", request.tag, len, work_ptr);
        Ok(JobHandle { tag: request.tag })
    }

    fn poll(&self, handle: &JobHandle, deadline: Ticks) -> Result<JobResult, JobError> {
        loop {
            {
                let mut regs = self.regs.lock();
                if regs.read_status() == POLL_JOB_FINISH {
                    let result = JobResult::decode(&regs.read_result());
                    match result {
                        Ok(result) if result.tag == handle.tag => {
                            regs.set_fw_ctrl(FwCtrl::new());
                            regs.write_status(POLL_JOB_START);
                            trace!("job {}: finished, code {:#x}", handle.tag, result.error_code);
                            return Ok(result);
                        }
                        Ok(result) => {
                            trace!("job {}: ignoring result for job {}", handle.tag, result.tag);
                        }
                        Err(e) => {
                            error!("job {}: unreadable result", handle.tag);
                            regs.set_fw_ctrl(FwCtrl::new());
                            regs.write_status(POLL_JOB_START);
                            return Err(e);
                        }
                    }
                }
            }
            if self.expired(deadline) {
                return Err(JobError::Timeout);
            }
            spin_loop();
        }
    }

    fn reset(&self) {
        let mut regs = self.regs.lock();
        regs.write64(ScratchReg::WorkPtr, 0);
        regs.set_fw_ctrl(FwCtrl::new());
        regs.write_status(POLL_JOB_START);
    }

    fn deadline(&self, timeout: Duration) -> Ticks { self.timebase.deadline(timeout) }

    fn expired(&self, deadline: Ticks) -> bool { self.timebase.now() >= deadline }
}

impl<R: ScratchRegisters, T: Timebase> DeviceControl for ScratchJobChannel<R, T> {
    fn set_enabled(&self, enable: bool) {
        let mut regs = self.regs.lock();
        let cfg = regs.ml_cfg().with_ena(enable);
        regs.set_ml_cfg(cfg);
    }

    fn is_enabled(&self) -> bool { self.regs.lock().ml_cfg().ena() }

    fn clear_scratch(&self) {
        let mut regs = self.regs.lock();
        for reg in ScratchReg::SCRATCH {
            regs.write64(reg, 0);
        }
    }
}
