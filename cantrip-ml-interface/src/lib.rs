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

//! Interfaces between the layer coordinator, the firmware job channel, the
//! hardware register window and device memory placement.

extern crate alloc;

mod job;
mod placement;
mod regs;

pub use job::*;
pub use placement::*;
pub use regs::*;

use num_enum::{FromPrimitive, IntoPrimitive};

/// POSIX error numbers surfaced by the integer layer API.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ETIME: i32 = 62;
}

/// Errors that can occur when driving a layer.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum MlLayerError {
    Success = 0,
    NoSpace,
    InvalidTileCount,
    Busy,
    Timeout,
    FirmwareError,
    InvalidArgs,
    InvalidState,
    NoSuchLayer,
    NoLayerSlotsLeft,
    LayerTooLarge,
    SerializeFailed,
    DeserializeFailed,
    #[default]
    UnknownError,
}

impl MlLayerError {
    /// Returns the positive POSIX error number for this error; 0 for Success.
    pub fn errno(&self) -> i32 {
        match self {
            MlLayerError::Success => 0,
            MlLayerError::NoSpace | MlLayerError::NoLayerSlotsLeft | MlLayerError::LayerTooLarge => {
                errno::ENOMEM
            }
            MlLayerError::Busy => errno::EBUSY,
            MlLayerError::Timeout => errno::ETIME,
            MlLayerError::InvalidTileCount
            | MlLayerError::InvalidArgs
            | MlLayerError::InvalidState
            | MlLayerError::NoSuchLayer => errno::EINVAL,
            MlLayerError::FirmwareError
            | MlLayerError::SerializeFailed
            | MlLayerError::DeserializeFailed
            | MlLayerError::UnknownError => errno::EIO,
        }
    }
}

impl From<MlLayerError> for Result<(), MlLayerError> {
    fn from(err: MlLayerError) -> Result<(), MlLayerError> {
        if err == MlLayerError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl From<JobError> for MlLayerError {
    fn from(err: JobError) -> MlLayerError {
        match err {
            JobError::QueueBusy => MlLayerError::Busy,
            JobError::Timeout => MlLayerError::Timeout,
            JobError::SerializeFailed => MlLayerError::SerializeFailed,
            JobError::DeserializeFailed => MlLayerError::DeserializeFailed,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(MlLayerError::Success.errno(), 0);
        assert_eq!(MlLayerError::NoSpace.errno(), errno::ENOMEM);
        assert_eq!(MlLayerError::NoLayerSlotsLeft.errno(), errno::ENOMEM);
        assert_eq!(MlLayerError::Busy.errno(), errno::EBUSY);
        assert_eq!(MlLayerError::Timeout.errno(), errno::ETIME);
        assert_eq!(MlLayerError::InvalidTileCount.errno(), errno::EINVAL);
        assert_eq!(MlLayerError::InvalidState.errno(), errno::EINVAL);
        assert_eq!(MlLayerError::FirmwareError.errno(), errno::EIO);
    }

    /// Status codes round-trip through their integer representation.
    #[test]
    fn status_codes() {
        let code: usize = MlLayerError::Busy.into();
        assert_eq!(MlLayerError::from(code), MlLayerError::Busy);
        assert_eq!(MlLayerError::from(9999usize), MlLayerError::UnknownError);
        assert_eq!(Result::<(), MlLayerError>::from(MlLayerError::Success), Ok(()));
        assert_eq!(
            Result::<(), MlLayerError>::from(MlLayerError::NoSpace),
            Err(MlLayerError::NoSpace)
        );
    }

    #[test]
    fn job_errors() {
        assert_eq!(MlLayerError::from(JobError::Timeout), MlLayerError::Timeout);
        assert_eq!(MlLayerError::from(JobError::QueueBusy), MlLayerError::Busy);
    }
}
