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


//! Runtime tunables of the client.

use crate::error::{Error, Result};
use crate::types::{AudioContexts, CodecLocation, LeAudioContextType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration. Every field has a default, so an empty JSON object is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeAudioConfig {
    /// Watchdog armed whenever a group is given a new target state.
    pub state_transition_timeout_ms: u64,
    /// How long the stream is kept alive once both local directions are suspended.
    pub suspend_timeout_ms: u64,
    /// Extra time given to the remote to disable ASEs before the stream is stopped.
    pub disable_timeout_ms: u64,
    /// Disable ASEs before releasing them when the keep-alive timer expires.
    pub disable_before_stopping: bool,
    pub codec_location: CodecLocation,
    /// Metadata-only contexts which never trigger a reconfiguration of an already configured
    /// sink direction.
    pub reconfiguration_suppressed_contexts: Vec<LeAudioContextType>,
    /// CIG id used for the first group, the group id is added to it.
    pub cig_id_base: u8,
}

impl Default for LeAudioConfig {
    fn default() -> Self {
        Self {
            state_transition_timeout_ms: 3500,
            suspend_timeout_ms: 5000,
            disable_timeout_ms: 3000,
            disable_before_stopping: false,
            codec_location: CodecLocation::Host,
            reconfiguration_suppressed_contexts: vec![
                LeAudioContextType::Notifications,
                LeAudioContextType::SoundEffects,
                LeAudioContextType::Instructional,
                LeAudioContextType::Alerts,
                LeAudioContextType::EmergencyAlarm,
            ],
            cig_id_base: 1,
        }
    }
}

impl LeAudioConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LeAudioConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        if config.state_transition_timeout_ms == 0 {
            return Err(Error::Config("state_transition_timeout_ms must not be 0".into()));
        }
        Ok(config)
    }

    /// Loads the configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&json)?)
    }

    pub fn state_transition_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transition_timeout_ms)
    }

    pub fn suspend_timeout(&self) -> Duration {
        let extra = if self.disable_before_stopping { self.disable_timeout_ms } else { 0 };
        Duration::from_millis(self.suspend_timeout_ms.saturating_add(extra))
    }

    pub fn suppressed_contexts(&self) -> AudioContexts {
        self.reconfiguration_suppressed_contexts.iter().copied().collect()
    }
}
