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


//! Length-Type-Value structures, used by codec configurations, codec capabilities and
//! metadata, plus the codec specific configuration carried by an ASE.

use super::reader::Reader;
use crate::types::{AudioContexts, AudioLocations, CodecSpecificConfig, StreamMetadata};
use std::collections::BTreeMap;

/// Codec specific configuration types.
pub mod config_type {
    pub const SAMPLING_FREQUENCY: u8 = 0x01;
    pub const FRAME_DURATION: u8 = 0x02;
    pub const AUDIO_CHANNEL_ALLOCATION: u8 = 0x03;
    pub const OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const CODEC_FRAME_BLOCKS_PER_SDU: u8 = 0x05;
}

/// Codec specific capabilities types.
pub mod capability_type {
    pub const SUPPORTED_SAMPLING_FREQUENCIES: u8 = 0x01;
    pub const SUPPORTED_FRAME_DURATIONS: u8 = 0x02;
    pub const SUPPORTED_AUDIO_CHANNEL_COUNTS: u8 = 0x03;
    pub const SUPPORTED_OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const SUPPORTED_MAX_CODEC_FRAMES_PER_SDU: u8 = 0x05;
}

/// Metadata types.
pub mod metadata_type {
    pub const PREFERRED_AUDIO_CONTEXTS: u8 = 0x01;
    pub const STREAMING_AUDIO_CONTEXTS: u8 = 0x02;
    pub const CCID_LIST: u8 = 0x05;
}

const SAMPLING_FREQUENCIES: [(u8, u32); 13] = [
    (0x01, 8000),
    (0x02, 11025),
    (0x03, 16000),
    (0x04, 22050),
    (0x05, 24000),
    (0x06, 32000),
    (0x07, 44100),
    (0x08, 48000),
    (0x09, 88200),
    (0x0a, 96000),
    (0x0b, 176400),
    (0x0c, 192000),
    (0x0d, 384000),
];

const FRAME_DURATIONS: [(u8, u32); 2] = [(0x00, 7500), (0x01, 10000)];

pub fn sampling_frequency_hz(code: u8) -> Option<u32> {
    SAMPLING_FREQUENCIES.iter().find(|(c, _)| *c == code).map(|(_, hz)| *hz)
}

pub fn sampling_frequency_code(hz: u32) -> Option<u8> {
    SAMPLING_FREQUENCIES.iter().find(|(_, f)| *f == hz).map(|(c, _)| *c)
}

pub fn frame_duration_us(code: u8) -> Option<u32> {
    FRAME_DURATIONS.iter().find(|(c, _)| *c == code).map(|(_, us)| *us)
}

pub fn frame_duration_code(us: u32) -> Option<u8> {
    FRAME_DURATIONS.iter().find(|(_, d)| *d == us).map(|(c, _)| *c)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LtvMap {
    values: BTreeMap<u8, Vec<u8>>,
}

impl LtvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = Reader::new(data);
        let mut values = BTreeMap::new();
        while !r.is_empty() {
            let len = r.read_u8()? as usize;
            if len == 0 {
                continue;
            }
            let ltv_type = r.read_u8()?;
            values.insert(ltv_type, r.get(len - 1)?.to_vec());
        }
        Some(Self { values })
    }

    pub fn insert(&mut self, ltv_type: u8, value: Vec<u8>) {
        self.values.insert(ltv_type, value);
    }

    pub fn get(&self, ltv_type: u8) -> Option<&[u8]> {
        self.values.get(&ltv_type).map(Vec::as_slice)
    }

    pub fn get_u8(&self, ltv_type: u8) -> Option<u8> {
        self.get_le(ltv_type, 1).map(|v| v as u8)
    }

    pub fn get_u16(&self, ltv_type: u8) -> Option<u16> {
        self.get_le(ltv_type, 2).map(|v| v as u16)
    }

    pub fn get_u32(&self, ltv_type: u8) -> Option<u32> {
        self.get_le(ltv_type, 4)
    }

    fn get_le(&self, ltv_type: u8, len: usize) -> Option<u32> {
        let value = self.get(ltv_type)?;
        if value.len() != len {
            return None;
        }
        Some(value.iter().rev().fold(0u32, |v, b| (v << 8) | *b as u32))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (ltv_type, value) in &self.values {
            out.push((value.len() + 1) as u8);
            out.push(*ltv_type);
            out.extend_from_slice(value);
        }
        out
    }
}

impl CodecSpecificConfig {
    pub fn to_ltv(&self) -> LtvMap {
        let mut ltv = LtvMap::new();
        if let Some(code) = sampling_frequency_code(self.sampling_frequency_hz) {
            ltv.insert(config_type::SAMPLING_FREQUENCY, vec![code]);
        }
        if let Some(code) = frame_duration_code(self.frame_duration_us) {
            ltv.insert(config_type::FRAME_DURATION, vec![code]);
        }
        ltv.insert(
            config_type::AUDIO_CHANNEL_ALLOCATION,
            self.audio_channel_allocation.bits().to_le_bytes().to_vec(),
        );
        ltv.insert(
            config_type::OCTETS_PER_CODEC_FRAME,
            self.octets_per_codec_frame.to_le_bytes().to_vec(),
        );
        ltv.insert(config_type::CODEC_FRAME_BLOCKS_PER_SDU, vec![self.codec_frames_blocks_per_sdu]);
        ltv
    }

    /// Decodes a codec specific configuration. Sampling frequency, frame duration and octets per
    /// frame are mandatory, allocation defaults to mono and blocks per SDU to one.
    pub fn from_ltv(ltv: &LtvMap) -> Option<Self> {
        Some(Self {
            sampling_frequency_hz: sampling_frequency_hz(
                ltv.get_u8(config_type::SAMPLING_FREQUENCY)?,
            )?,
            frame_duration_us: frame_duration_us(ltv.get_u8(config_type::FRAME_DURATION)?)?,
            audio_channel_allocation: ltv
                .get_u32(config_type::AUDIO_CHANNEL_ALLOCATION)
                .map(AudioLocations::from_bits_retain)
                .unwrap_or_default(),
            octets_per_codec_frame: ltv.get_u16(config_type::OCTETS_PER_CODEC_FRAME)?,
            codec_frames_blocks_per_sdu: ltv
                .get_u8(config_type::CODEC_FRAME_BLOCKS_PER_SDU)
                .unwrap_or(1),
        })
    }
}

impl StreamMetadata {
    pub fn to_ltv(&self) -> LtvMap {
        let mut ltv = LtvMap::new();
        ltv.insert(metadata_type::STREAMING_AUDIO_CONTEXTS, self.contexts.bits().to_le_bytes().to_vec());
        if !self.ccids.is_empty() {
            ltv.insert(metadata_type::CCID_LIST, self.ccids.clone());
        }
        ltv
    }

    pub fn from_ltv(ltv: &LtvMap) -> Self {
        Self {
            contexts: ltv
                .get_u16(metadata_type::STREAMING_AUDIO_CONTEXTS)
                .map(AudioContexts::from_bits_truncate)
                .unwrap_or_default(),
            ccids: ltv.get(metadata_type::CCID_LIST).map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}
