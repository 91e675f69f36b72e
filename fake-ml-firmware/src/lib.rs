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

// Fake ML firmware, register window and device memory for running the
// coordinator without hardware. Handles are cheap clones sharing state so a
// test can keep one while the coordinator owns another.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use cantrip_ml_interface::*;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use log::trace;
use spin::Mutex;

/// Device address of the fake job descriptor window.
pub const FAKE_JOB_WINDOW: u64 = 0x4000_0000;

/// Error code reported for a descriptor that does not decode.
pub const FAKE_BAD_DESCRIPTOR: u64 = 0xbad;

/// How the firmware answers the next job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Behavior {
    Complete,
    Fail(u64),
    /// Never answers.
    Hang,
    /// Answers success once the status word has been read this many times.
    CompleteAfterPolls(usize),
}

struct Pending {
    result: JobResult,
    polls_left: usize,
}

#[derive(Default)]
struct FirmwareState {
    regs: BTreeMap<usize, u64>,
    desc: Vec<u8>,
    result: [u8; JOB_RESULT_SIZE],
    status: u64,
    script: VecDeque<Behavior>,
    pending: Option<Pending>,
    jobs: Vec<JobRequest>,
}

impl FirmwareState {
    // The host set FW_CTRL.valid: pick up the descriptor at WORK_PTR.
    fn accept_job(&mut self) {
        let work_ptr = self.regs.get(&ScratchReg::WorkPtr.offset()).copied().unwrap_or(0);
        let request = match JobRequest::decode(&self.desc) {
            Ok(request) if work_ptr == FAKE_JOB_WINDOW => request,
            _ => {
                self.pending = Some(Pending {
                    result: JobResult {
                        tag: 0,
                        error_code: FAKE_BAD_DESCRIPTOR,
                    },
                    polls_left: 0,
                });
                return;
            }
        };
        let behavior = self.script.pop_front().unwrap_or(Behavior::Complete);
        trace!("fake firmware: {:?} job for layer {} -> {:?}", request.job_type, request.layer_id, behavior);
        let (error_code, polls_left) = match behavior {
            Behavior::Complete => (0, 0),
            Behavior::Fail(code) => (code, 0),
            Behavior::CompleteAfterPolls(polls) => (0, polls),
            Behavior::Hang => {
                self.pending = None;
                self.jobs.push(request);
                return;
            }
        };
        self.pending = Some(Pending {
            result: JobResult {
                tag: request.tag,
                error_code,
            },
            polls_left,
        });
        self.jobs.push(request);
    }

    fn step(&mut self) {
        let finished = match self.pending.as_mut() {
            Some(pending) if pending.polls_left == 0 => true,
            Some(pending) => {
                pending.polls_left -= 1;
                false
            }
            None => false,
        };
        if finished {
            if let Some(pending) = self.pending.take() {
                // The window always fits a result.
                let _ = pending.result.encode(&mut self.result);
                self.status = POLL_JOB_FINISH;
            }
        }
    }
}

/// Register window backed by a scripted firmware.
#[derive(Clone, Default)]
pub struct FakeRegisters {
    state: Arc<Mutex<FirmwareState>>,
}

impl FakeRegisters {
    pub fn new() -> Self { Self::default() }

    /// Queues the firmware's answer for an upcoming job. Unscripted jobs
    /// complete successfully.
    pub fn script(&self, behavior: Behavior) { self.state.lock().script.push_back(behavior); }

    /// Jobs the firmware has picked up, oldest first.
    pub fn jobs(&self) -> Vec<JobRequest> { self.state.lock().jobs.clone() }

    pub fn last_job(&self) -> Option<JobRequest> { self.state.lock().jobs.last().cloned() }

    pub fn reg(&self, reg: ScratchReg) -> u64 {
        self.state.lock().regs.get(&reg.offset()).copied().unwrap_or(0)
    }

    /// Sets a register without firmware side effects, e.g. to make the
    /// queue look occupied by another host.
    pub fn poke(&self, reg: ScratchReg, value: u64) { self.state.lock().regs.insert(reg.offset(), value); }

    pub fn status(&self) -> u64 { self.state.lock().status }
}

impl ScratchRegisters for FakeRegisters {
    fn read64(&mut self, reg: ScratchReg) -> u64 { self.reg(reg) }

    fn write64(&mut self, reg: ScratchReg, value: u64) {
        let mut state = self.state.lock();
        state.regs.insert(reg.offset(), value);
        if reg == ScratchReg::FwCtrl {
            if FwCtrl::from_bytes(value.to_ne_bytes()).valid() {
                state.accept_job();
            } else {
                state.pending = None;
            }
        }
    }

    fn job_window_addr(&self) -> u64 { FAKE_JOB_WINDOW }

    fn write_job(&mut self, desc: &[u8; JOB_DESC_SIZE]) {
        let mut state = self.state.lock();
        state.desc.clear();
        state.desc.extend_from_slice(desc);
    }

    fn read_status(&mut self) -> u64 {
        let mut state = self.state.lock();
        state.step();
        state.status
    }

    fn write_status(&mut self, status: u64) { self.state.lock().status = status; }

    fn read_result(&mut self) -> [u8; JOB_RESULT_SIZE] { self.state.lock().result }
}

/// Microsecond clock that moves forward by |step| on every read so polling
/// loops reach their deadline without real time passing.
#[derive(Clone)]
pub struct FakeTimebase {
    now: Arc<AtomicU64>,
    step: u64,
}

impl FakeTimebase {
    pub fn new(step: u64) -> Self {
        FakeTimebase {
            now: Arc::new(AtomicU64::new(0)),
            step,
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Default for FakeTimebase {
    fn default() -> Self { Self::new(1) }
}

impl Timebase for FakeTimebase {
    fn now(&self) -> Ticks { self.now.fetch_add(self.step, Ordering::SeqCst) }

    fn deadline(&self, duration: Duration) -> Ticks {
        self.now.load(Ordering::SeqCst) + duration.as_micros() as u64
    }
}

/// Device memory that records every DMA write.
#[derive(Clone, Default)]
pub struct FakeDeviceMemory {
    writes: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
}

impl FakeDeviceMemory {
    pub fn new() -> Self { Self::default() }

    pub fn read(&self, addr: u64) -> Option<Vec<u8>> { self.writes.lock().get(&addr).cloned() }

    pub fn write_count(&self) -> usize { self.writes.lock().len() }
}

impl SectionPlacement for FakeDeviceMemory {
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), MlLayerError> {
        self.writes.lock().insert(addr, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ring(regs: &mut FakeRegisters, request: &JobRequest) {
        let mut desc = [0u8; JOB_DESC_SIZE];
        request.encode(&mut desc).unwrap();
        regs.write_status(POLL_JOB_START);
        regs.write_job(&desc);
        regs.write64(ScratchReg::WorkPtr, FAKE_JOB_WINDOW);
        regs.set_fw_ctrl(FwCtrl::new().with_valid(true));
    }

    #[test]
    fn completes_job() {
        let mut regs = FakeRegisters::new();
        let mut request = JobRequest::stop(2);
        request.tag = 7;
        ring(&mut regs, &request);
        assert_eq!(regs.read_status(), POLL_JOB_FINISH);
        let result = JobResult::decode(&regs.read_result()).unwrap();
        assert_eq!(result, JobResult { tag: 7, error_code: 0 });
        assert_eq!(regs.jobs(), vec![request]);
    }

    #[test]
    fn scripted_answers() {
        let mut regs = FakeRegisters::new();
        regs.script(Behavior::CompleteAfterPolls(2));
        regs.script(Behavior::Fail(3));
        regs.script(Behavior::Hang);

        ring(&mut regs, &JobRequest::stop(0));
        assert_eq!(regs.read_status(), POLL_JOB_START);
        assert_eq!(regs.read_status(), POLL_JOB_START);
        assert_eq!(regs.read_status(), POLL_JOB_FINISH);

        ring(&mut regs, &JobRequest::stop(0));
        assert_eq!(regs.read_status(), POLL_JOB_FINISH);
        assert_eq!(JobResult::decode(&regs.read_result()).unwrap().error_code, 3);

        ring(&mut regs, &JobRequest::stop(0));
        for _ in 0..100 {
            assert_eq!(regs.read_status(), POLL_JOB_START);
        }
        assert_eq!(regs.jobs().len(), 3);
    }

    #[test]
    fn wrong_work_ptr_is_rejected() {
        let mut regs = FakeRegisters::new();
        ring(&mut regs, &JobRequest::stop(0));
        regs.write64(ScratchReg::WorkPtr, 0);
        regs.write_status(POLL_JOB_START);
        regs.set_fw_ctrl(FwCtrl::new().with_valid(true));
        assert_eq!(regs.read_status(), POLL_JOB_FINISH);
        assert_eq!(JobResult::decode(&regs.read_result()).unwrap().error_code, FAKE_BAD_DESCRIPTOR);
    }

    #[test]
    fn clock_steps_on_read() {
        let clock = FakeTimebase::new(5);
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.now(), 5);
        clock.advance(Duration::from_millis(1));
        assert_eq!(clock.deadline(Duration::from_micros(10)), 1020);
    }
}
