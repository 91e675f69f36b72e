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

// Slow-path job descriptors exchanged with the firmware.

use cantrip_ml_shared::LayerId;
use core::time::Duration;
use log::{error, trace};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Size of the descriptor window read by the firmware.
pub const JOB_DESC_SIZE: usize = 256;

/// Size of the result window written by the firmware.
pub const JOB_RESULT_SIZE: usize = 32;

// Values of the completion word.
pub const POLL_JOB_START: u64 = 0;
pub const POLL_JOB_FINISH: u64 = 1;

// Worst-case postcard encodings must fit their windows.
const_assert!(JOB_DESC_SIZE >= 16 * 10 + 4);
const_assert!(JOB_RESULT_SIZE >= 2 * 10);

pub type Ticks = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobType {
    Stop,
    Start,
}

bitflags::bitflags! {
    pub struct SpFlags: u8 {
        const OCM_NONRELOCATABLE = 0b00000001;
    }
}

/// Model-start parameters. Offsets are relative to the run copy of the
/// model data; OCM fields are filled in once pages are reserved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartJob {
    pub model_src_ddr_addr: u64,
    pub model_dst_ddr_addr: u64,
    pub model_init_offset: u64,
    pub model_main_offset: u64,
    pub model_finish_offset: u64,
    pub model_init_size: u64,
    pub model_main_size: u64,
    pub model_finish_size: u64,
    pub model_wb_offset: u64,
    pub tilemask: u64,
    pub batch_size: u32,
    pub ocm_wb_base_address: u64,
    pub ocm_wb_range_start: u64,
    pub ocm_wb_range_end: u64,
    pub ddr_wb_base_address: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Assigned by the channel on submit; echoed back in the result.
    pub tag: u64,
    pub layer_id: LayerId,
    pub job_type: JobType,
    pub sp_flags: u8,
    pub start: Option<StartJob>,
}

impl JobRequest {
    pub fn start(layer_id: LayerId, flags: SpFlags, start: StartJob) -> Self {
        JobRequest {
            tag: 0,
            layer_id,
            job_type: JobType::Start,
            sp_flags: flags.bits(),
            start: Some(start),
        }
    }

    pub fn stop(layer_id: LayerId) -> Self {
        JobRequest {
            tag: 0,
            layer_id,
            job_type: JobType::Stop,
            sp_flags: 0,
            start: None,
        }
    }

    pub fn flags(&self) -> SpFlags { SpFlags::from_bits_truncate(self.sp_flags) }

    /// Serializes the request into a descriptor window. Unused bytes are
    /// zeroed.
    pub fn encode(&self, desc: &mut [u8; JOB_DESC_SIZE]) -> Result<usize, JobError> {
        desc.fill(0);
        let used = postcard::to_slice(self, &mut desc[..]).or(Err(JobError::SerializeFailed))?;
        Ok(used.len())
    }

    pub fn decode(desc: &[u8]) -> Result<Self, JobError> {
        postcard::from_bytes(desc).or(Err(JobError::DeserializeFailed))
    }
}

/// Firmware answer to a JobRequest; error_code 0 means success.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub tag: u64,
    pub error_code: u64,
}

impl JobResult {
    pub fn encode(&self, window: &mut [u8; JOB_RESULT_SIZE]) -> Result<usize, JobError> {
        window.fill(0);
        let used =
            postcard::to_slice(self, &mut window[..]).or(Err(JobError::SerializeFailed))?;
        Ok(used.len())
    }

    pub fn decode(window: &[u8]) -> Result<Self, JobError> {
        postcard::from_bytes(window).or(Err(JobError::DeserializeFailed))
    }

    pub fn is_success(&self) -> bool { self.error_code == 0 }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobError {
    /// Another job occupies the queue.
    QueueBusy,
    Timeout,
    SerializeFailed,
    DeserializeFailed,
}

/// Request/response channel to the firmware. One job occupies the channel
/// at a time; completion is found by polling.
pub trait JobChannel {
    type Handle;

    /// Writes |request| into the job window and rings the firmware. Never
    /// blocks; returns QueueBusy if another job is outstanding.
    fn submit(&self, request: &JobRequest) -> Result<Self::Handle, JobError>;

    /// Spins until the job identified by |handle| completes or |deadline|
    /// passes. After a Timeout the channel must be reset before reuse.
    fn poll(&self, handle: &Self::Handle, deadline: Ticks) -> Result<JobResult, JobError>;

    /// Returns the channel and the shared registers to the idle state.
    fn reset(&self);

    fn deadline(&self, timeout: Duration) -> Ticks;

    fn expired(&self, deadline: Ticks) -> bool;

    /// Submits |request| and waits for its result, retrying the submit while
    /// the queue is busy. Both phases share one deadline. A job that was
    /// accepted but never answered resets the channel.
    fn run(&self, request: &JobRequest, timeout: Duration) -> Result<JobResult, JobError> {
        let deadline = self.deadline(timeout);
        let handle = loop {
            match self.submit(request) {
                Ok(handle) => break handle,
                Err(JobError::QueueBusy) if !self.expired(deadline) => continue,
                Err(JobError::QueueBusy) => {
                    error!("Layer {}: job queue busy until deadline", request.layer_id);
                    return Err(JobError::Timeout);
                }
                Err(e) => return Err(e),
            }
        };
        trace!("Layer {}: {:?} job enqueued", request.layer_id, request.job_type);
        match self.poll(&handle, deadline) {
            Err(JobError::Timeout) => {
                error!("Layer {}: {:?} job timed out", request.layer_id, request.job_type);
                self.reset();
                Err(JobError::Timeout)
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn max_start() -> StartJob {
        StartJob {
            model_src_ddr_addr: u64::MAX,
            model_dst_ddr_addr: u64::MAX,
            model_init_offset: u64::MAX,
            model_main_offset: u64::MAX,
            model_finish_offset: u64::MAX,
            model_init_size: u64::MAX,
            model_main_size: u64::MAX,
            model_finish_size: u64::MAX,
            model_wb_offset: u64::MAX,
            tilemask: u64::MAX,
            batch_size: u32::MAX,
            ocm_wb_base_address: u64::MAX,
            ocm_wb_range_start: u64::MAX,
            ocm_wb_range_end: u64::MAX,
            ddr_wb_base_address: u64::MAX,
        }
    }

    /// The largest possible start descriptor fits the window.
    #[test]
    fn start_descriptor_fits() {
        let mut request = JobRequest::start(LayerId::MAX, SpFlags::all(), max_start());
        request.tag = u64::MAX;
        let mut desc = [0xffu8; JOB_DESC_SIZE];
        let len = request.encode(&mut desc).unwrap();
        assert!(len <= JOB_DESC_SIZE);
        assert!(desc[len..].iter().all(|b| *b == 0));
        assert_eq!(JobRequest::decode(&desc).unwrap(), request);
    }

    #[test]
    fn stop_descriptor_carries_no_start_block() {
        let mut desc = [0u8; JOB_DESC_SIZE];
        JobRequest::stop(3).encode(&mut desc).unwrap();
        let decoded = JobRequest::decode(&desc).unwrap();
        assert_eq!(decoded.job_type, JobType::Stop);
        assert_eq!(decoded.start, None);
        assert!(decoded.flags().is_empty());
    }

    #[test]
    fn result_window() {
        let mut window = [0u8; JOB_RESULT_SIZE];
        let result = JobResult {
            tag: u64::MAX,
            error_code: u64::MAX,
        };
        result.encode(&mut window).unwrap();
        let decoded = JobResult::decode(&window).unwrap();
        assert_eq!(decoded, result);
        assert!(!decoded.is_success());
    }

    #[test]
    fn garbage_descriptor() {
        assert_eq!(JobRequest::decode(&[0xff; 4]), Err(JobError::DeserializeFailed));
    }
}
