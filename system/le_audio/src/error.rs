// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Error type shared by the registries, the configuration loader and the client entry points.

use crate::types::{AseState, RawAddress};
use thiserror::Error;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported to callers. Contract violations inside the state machine are not errors, they
/// are asserted.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("unknown device {0}")]
    UnknownDevice(RawAddress),
    #[error("unknown group {0}")]
    UnknownGroup(i32),
    #[error("device {0} already exists")]
    DeviceAlreadyExists(RawAddress),
    #[error("group {0} already exists")]
    GroupAlreadyExists(i32),
    #[error("no free CIS id for device {0}")]
    NoFreeCisId(RawAddress),
    #[error("no configuration supported for group {0}")]
    NoConfiguration(i32),
    #[error("group {group_id} can't be driven from {state:?}")]
    InvalidState { group_id: i32, state: AseState },
    #[error("group {0} is not connected")]
    NotConnected(i32),
    #[error("local audio {0} session refused")]
    AudioSession(&'static str),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}
