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


//! LE Audio unicast client.
//!
//! Orchestrates groups of LE Audio devices (typically a pair of earbuds) through the Audio Stream
//! Control Service procedures: codec and QoS configuration, CIG/CIS establishment, data path
//! setup, suspend and release. The GATT transport, the ISO/HCI transport, the local audio HAL and
//! the LC3 codec are provided by the embedder through the traits in [`interfaces`].
//!
//! Every entry point runs on a single thread. Deferred work (watchdog timers, keep-alive timers,
//! state machine reports) is posted as a [`Message`] to the client's queue and handled in order.

#[macro_use]
extern crate num_derive;

pub mod client;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod group;
pub mod interfaces;
pub mod set_configurations;
pub mod state_machine;
pub mod timer;
pub mod types;
pub mod utils;
pub mod wire;

#[cfg(test)]
mod tests;

use crate::types::{Direction, GroupStreamStatus};

pub use crate::client::LeAudioClient;
pub use crate::config::LeAudioConfig;
pub use crate::error::{Error, Result};

/// Messages handled on the client's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// The watchdog of the group expired before the target state was reached.
    StateTransitionTimeout(i32),
    /// The state machine gave up on the transition of the group.
    StateTransitionTimedOut(i32),
    /// Stream status of the group changed.
    StatusReport { group_id: i32, status: GroupStreamStatus },
    /// CIS set of the group changed in the given direction.
    UpdateCisConfiguration { group_id: i32, direction: Direction },
    /// The remote refused the ASE to CIS mapping, pending audio requests are dropped.
    CancelStreamingRequest(i32),
    /// Both local audio directions stayed suspended past the keep-alive period.
    SuspendTimeout(i32),
}
