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


//! Audio set configurations: which codec setting, how many devices and how many ASEs a group
//! uses for a given context type, and the policy choosing the configuration context.

use crate::error::{Error, Result};
use crate::types::{AudioContexts, AudioLocations, CodecId, Direction, LeAudioContextType};
use crate::wire::pacs::CodecCapabilities;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const TARGET_LATENCY_LOWER: u8 = 0x01;
pub const TARGET_LATENCY_BALANCED_RELIABILITY: u8 = 0x02;
pub const TARGET_LATENCY_HIGHER_RELIABILITY: u8 = 0x03;

/// How the channels of a direction are spread over devices and CISes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationStrategy {
    /// One mono CIS per device, e.g. a pair of earbuds.
    MonoOneCisPerDevice,
    /// A single device with one CIS per channel.
    StereoTwoCisesPerDevice,
    /// A single device with both channels multiplexed on one CIS.
    StereoOneCisPerDevice,
}

fn default_blocks_per_sdu() -> u8 {
    1
}

fn default_channel_count() -> u8 {
    1
}

fn default_target_latency() -> u8 {
    TARGET_LATENCY_BALANCED_RELIABILITY
}

/// Codec setting of one ASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfigSetting {
    #[serde(default = "lc3")]
    pub codec_id: CodecId,
    pub sampling_frequency_hz: u32,
    pub frame_duration_us: u32,
    pub octets_per_codec_frame: u16,
    #[serde(default = "default_blocks_per_sdu")]
    pub codec_frames_blocks_per_sdu: u8,
    #[serde(default = "default_channel_count")]
    pub channel_count_per_ase: u8,
}

fn lc3() -> CodecId {
    CodecId::LC3
}

impl CodecConfigSetting {
    pub fn is_supported_by(&self, capabilities: &CodecCapabilities) -> bool {
        capabilities.supports_sampling_frequency(self.sampling_frequency_hz)
            && capabilities.supports_frame_duration(self.frame_duration_us)
            && capabilities.supports_channel_count(self.channel_count_per_ase)
            && capabilities.supports_octets_per_frame(self.octets_per_codec_frame)
            && self.codec_frames_blocks_per_sdu <= capabilities.max_codec_frames_per_sdu.max(1)
    }

    pub fn max_sdu_size(&self) -> u16 {
        self.octets_per_codec_frame
            * self.channel_count_per_ase as u16
            * self.codec_frames_blocks_per_sdu as u16
    }

    pub fn sdu_interval_us(&self) -> u32 {
        self.frame_duration_us * self.codec_frames_blocks_per_sdu as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosConfigSetting {
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
}

/// Requirements of one direction of an audio set configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfiguration {
    pub direction: Direction,
    pub device_cnt: u8,
    pub ase_cnt: u8,
    #[serde(default = "default_target_latency")]
    pub target_latency: u8,
    pub codec: CodecConfigSetting,
    pub qos: QosConfigSetting,
    pub strategy: ConfigurationStrategy,
}

/// A named audio set configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSetConfiguration {
    pub name: String,
    pub confs: Vec<SetConfiguration>,
}

impl AudioSetConfiguration {
    pub fn get(&self, direction: Direction) -> impl Iterator<Item = &SetConfiguration> {
        self.confs.iter().filter(move |c| c.direction == direction)
    }

    pub fn has_direction(&self, direction: Direction) -> bool {
        self.get(direction).next().is_some()
    }

    pub fn ase_count(&self, direction: Direction) -> u8 {
        self.get(direction).map(|c| c.ase_cnt).sum()
    }
}

/// Source of candidate configurations, in preference order, for each context type.
pub trait AudioSetConfigurationProvider {
    fn get_configurations(&self, context_type: LeAudioContextType) -> &[AudioSetConfiguration];
}

#[derive(Debug, Deserialize)]
struct Scenario {
    contexts: Vec<LeAudioContextType>,
    configurations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigurationFile {
    configurations: Vec<AudioSetConfiguration>,
    scenarios: Vec<Scenario>,
}

/// Configurations by context type.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationTable {
    by_context: HashMap<LeAudioContextType, Vec<AudioSetConfiguration>>,
}

impl ConfigurationTable {
    /// Loads a table from its JSON description: named configurations, and scenarios listing
    /// configuration names per context type.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: ConfigurationFile =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        let mut table = Self::default();
        for scenario in file.scenarios {
            let mut confs = Vec::new();
            for name in &scenario.configurations {
                let conf = file
                    .configurations
                    .iter()
                    .find(|c| &c.name == name)
                    .ok_or_else(|| Error::Config(format!("unknown configuration {}", name)))?;
                confs.push(conf.clone());
            }
            for context in scenario.contexts {
                table.by_context.entry(context).or_default().extend(confs.iter().cloned());
            }
        }
        Ok(table)
    }

    pub fn insert(&mut self, context_type: LeAudioContextType, confs: Vec<AudioSetConfiguration>) {
        self.by_context.insert(context_type, confs);
    }

    /// Built-in table, LC3 only.
    pub fn builtin() -> Self {
        let media = media_configurations();
        let conversational = conversational_configurations();
        let mut live = recording_configurations();
        live.extend(conversational.iter().cloned());
        let mut game = conversational.clone();
        game.extend(media.iter().cloned());

        let mut table = Self::default();
        for context in LeAudioContextType::ALL {
            let confs = match context {
                LeAudioContextType::Conversational | LeAudioContextType::VoiceAssistants => {
                    conversational.clone()
                }
                LeAudioContextType::Live => live.clone(),
                LeAudioContextType::Game => game.clone(),
                _ => media.clone(),
            };
            table.insert(context, confs);
        }
        table
    }
}

impl AudioSetConfigurationProvider for ConfigurationTable {
    fn get_configurations(&self, context_type: LeAudioContextType) -> &[AudioSetConfiguration] {
        self.by_context.get(&context_type).map(Vec::as_slice).unwrap_or(&[])
    }
}

const LC3_16_2: CodecConfigSetting = CodecConfigSetting {
    codec_id: CodecId::LC3,
    sampling_frequency_hz: 16_000,
    frame_duration_us: 10_000,
    octets_per_codec_frame: 40,
    codec_frames_blocks_per_sdu: 1,
    channel_count_per_ase: 1,
};

const LC3_48_4: CodecConfigSetting = CodecConfigSetting {
    codec_id: CodecId::LC3,
    sampling_frequency_hz: 48_000,
    frame_duration_us: 10_000,
    octets_per_codec_frame: 120,
    codec_frames_blocks_per_sdu: 1,
    channel_count_per_ase: 1,
};

const QOS_HIGH_RELIABILITY: QosConfigSetting =
    QosConfigSetting { retransmission_number: 13, max_transport_latency: 100 };
const QOS_LOW_LATENCY: QosConfigSetting =
    QosConfigSetting { retransmission_number: 2, max_transport_latency: 10 };

fn set_conf(
    direction: Direction,
    device_cnt: u8,
    ase_cnt: u8,
    codec: CodecConfigSetting,
    strategy: ConfigurationStrategy,
) -> SetConfiguration {
    let (target_latency, qos) = if codec.sampling_frequency_hz >= 48_000 {
        (TARGET_LATENCY_HIGHER_RELIABILITY, QOS_HIGH_RELIABILITY)
    } else {
        (TARGET_LATENCY_BALANCED_RELIABILITY, QOS_LOW_LATENCY)
    };
    SetConfiguration { direction, device_cnt, ase_cnt, target_latency, codec, qos, strategy }
}

fn stereo_channel(codec: CodecConfigSetting) -> CodecConfigSetting {
    CodecConfigSetting { channel_count_per_ase: 2, ..codec }
}

fn sink_configurations(codec: CodecConfigSetting, suffix: &str) -> Vec<AudioSetConfiguration> {
    use ConfigurationStrategy::*;
    use Direction::Sink;
    vec![
        AudioSetConfiguration {
            name: format!("DualDev_OneChanStereoSnk_{}", suffix),
            confs: vec![set_conf(Sink, 2, 2, codec, MonoOneCisPerDevice)],
        },
        AudioSetConfiguration {
            name: format!("SingleDev_TwoChanStereoSnk_{}", suffix),
            confs: vec![set_conf(Sink, 1, 2, codec, StereoTwoCisesPerDevice)],
        },
        AudioSetConfiguration {
            name: format!("SingleDev_OneChanStereoSnk_{}", suffix),
            confs: vec![set_conf(Sink, 1, 1, stereo_channel(codec), StereoOneCisPerDevice)],
        },
        AudioSetConfiguration {
            name: format!("SingleDev_OneChanMonoSnk_{}", suffix),
            confs: vec![set_conf(Sink, 1, 1, codec, MonoOneCisPerDevice)],
        },
    ]
}

fn media_configurations() -> Vec<AudioSetConfiguration> {
    let mut confs = sink_configurations(LC3_48_4, "48_4");
    confs.extend(sink_configurations(LC3_16_2, "16_2"));
    confs
}

fn conversational_configurations() -> Vec<AudioSetConfiguration> {
    use ConfigurationStrategy::*;
    use Direction::{Sink, Source};
    let codec = LC3_16_2;
    let mut confs = vec![
        AudioSetConfiguration {
            name: "DualDev_OneChanStereoSnk_OneChanStereoSrc_16_2".into(),
            confs: vec![
                set_conf(Sink, 2, 2, codec, MonoOneCisPerDevice),
                set_conf(Source, 2, 2, codec, MonoOneCisPerDevice),
            ],
        },
        AudioSetConfiguration {
            name: "DualDev_OneChanStereoSnk_OneChanMonoSrc_16_2".into(),
            confs: vec![
                set_conf(Sink, 2, 2, codec, MonoOneCisPerDevice),
                set_conf(Source, 1, 1, codec, MonoOneCisPerDevice),
            ],
        },
        AudioSetConfiguration {
            name: "SingleDev_TwoChanStereoSnk_OneChanMonoSrc_16_2".into(),
            confs: vec![
                set_conf(Sink, 1, 2, codec, StereoTwoCisesPerDevice),
                set_conf(Source, 1, 1, codec, MonoOneCisPerDevice),
            ],
        },
        AudioSetConfiguration {
            name: "SingleDev_OneChanStereoSnk_OneChanMonoSrc_16_2".into(),
            confs: vec![
                set_conf(Sink, 1, 1, stereo_channel(codec), StereoOneCisPerDevice),
                set_conf(Source, 1, 1, codec, MonoOneCisPerDevice),
            ],
        },
        AudioSetConfiguration {
            name: "SingleDev_OneChanMonoSnk_OneChanMonoSrc_16_2".into(),
            confs: vec![
                set_conf(Sink, 1, 1, codec, MonoOneCisPerDevice),
                set_conf(Source, 1, 1, codec, MonoOneCisPerDevice),
            ],
        },
    ];
    confs.extend(sink_configurations(codec, "16_2"));
    confs
}

fn recording_configurations() -> Vec<AudioSetConfiguration> {
    use ConfigurationStrategy::*;
    use Direction::Source;
    vec![
        AudioSetConfiguration {
            name: "DualDev_OneChanStereoSrc_16_2".into(),
            confs: vec![set_conf(Source, 2, 2, LC3_16_2, MonoOneCisPerDevice)],
        },
        AudioSetConfiguration {
            name: "SingleDev_OneChanMonoSrc_16_2".into(),
            confs: vec![set_conf(Source, 1, 1, LC3_16_2, MonoOneCisPerDevice)],
        },
    ]
}

/// Context types by decreasing configuration priority.
const CONTEXT_PRIORITY: [LeAudioContextType; 11] = [
    LeAudioContextType::Conversational,
    LeAudioContextType::Ringtone,
    LeAudioContextType::Live,
    LeAudioContextType::VoiceAssistants,
    LeAudioContextType::Game,
    LeAudioContextType::Media,
    LeAudioContextType::EmergencyAlarm,
    LeAudioContextType::Alerts,
    LeAudioContextType::Instructional,
    LeAudioContextType::Notifications,
    LeAudioContextType::SoundEffects,
];

/// Picks the context type the group is configured for, out of the contexts requested by the
/// local audio metadata.
pub fn choose_configuration_context_type(
    contexts: AudioContexts,
    in_call: bool,
) -> LeAudioContextType {
    if in_call {
        debug!("In call, forcing Conversational");
        return LeAudioContextType::Conversational;
    }
    CONTEXT_PRIORITY
        .into_iter()
        .find(|c| contexts.test(*c))
        .unwrap_or(LeAudioContextType::Unspecified)
}

/// Strategy a group needs in one direction, from the expected number of devices, the audio
/// locations of the direction and the channel count the first device supports.
pub fn group_strategy(
    expected_group_size: usize,
    locations: AudioLocations,
    max_channel_count: u8,
) -> ConfigurationStrategy {
    if expected_group_size > 1 {
        return ConfigurationStrategy::MonoOneCisPerDevice;
    }
    if !locations.is_left() || !locations.is_right() {
        return ConfigurationStrategy::MonoOneCisPerDevice;
    }
    if max_channel_count == 1 {
        return ConfigurationStrategy::StereoTwoCisesPerDevice;
    }
    ConfigurationStrategy::StereoOneCisPerDevice
}
