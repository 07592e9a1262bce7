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


//! Published Audio Capabilities Service: PAC records, audio locations and contexts.

use super::ltv::{capability_type, sampling_frequency_code, LtvMap};
use super::reader::{Read, Reader};
use crate::types::{AudioContexts, AudioLocations, BidirectionalContexts, CodecId};

/// LC3 codec specific capabilities of a PAC record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecCapabilities {
    /// Bit n set for sampling frequency code n + 1.
    pub supported_sampling_frequencies: u16,
    pub supported_frame_durations: u8,
    /// Bit n set for n + 1 channels. Absent from the record means mono only.
    pub supported_channel_counts: u8,
    pub octets_per_codec_frame_min: u16,
    pub octets_per_codec_frame_max: u16,
    pub max_codec_frames_per_sdu: u8,
}

const FRAME_DURATION_7_5MS: u8 = 0x01;
const FRAME_DURATION_10MS: u8 = 0x02;

impl CodecCapabilities {
    pub fn from_ltv(ltv: &LtvMap) -> Option<Self> {
        let octets = ltv.get_u32(capability_type::SUPPORTED_OCTETS_PER_CODEC_FRAME)?;
        Some(Self {
            supported_sampling_frequencies: ltv
                .get_u16(capability_type::SUPPORTED_SAMPLING_FREQUENCIES)?,
            supported_frame_durations: ltv.get_u8(capability_type::SUPPORTED_FRAME_DURATIONS)?,
            supported_channel_counts: ltv
                .get_u8(capability_type::SUPPORTED_AUDIO_CHANNEL_COUNTS)
                .unwrap_or(0x01),
            octets_per_codec_frame_min: (octets & 0xffff) as u16,
            octets_per_codec_frame_max: (octets >> 16) as u16,
            max_codec_frames_per_sdu: ltv
                .get_u8(capability_type::SUPPORTED_MAX_CODEC_FRAMES_PER_SDU)
                .unwrap_or(1),
        })
    }

    pub fn supports_sampling_frequency(&self, hz: u32) -> bool {
        match sampling_frequency_code(hz) {
            Some(code) => self.supported_sampling_frequencies & (1 << (code - 1)) != 0,
            None => false,
        }
    }

    pub fn supports_frame_duration(&self, us: u32) -> bool {
        match us {
            7500 => self.supported_frame_durations & FRAME_DURATION_7_5MS != 0,
            10000 => self.supported_frame_durations & FRAME_DURATION_10MS != 0,
            _ => false,
        }
    }

    pub fn supports_channel_count(&self, count: u8) -> bool {
        (1..=8).contains(&count) && self.supported_channel_counts & (1 << (count - 1)) != 0
    }

    pub fn max_channel_count(&self) -> u8 {
        (1..=8u8).rev().find(|c| self.supports_channel_count(*c)).unwrap_or(1)
    }

    pub fn supports_octets_per_frame(&self, octets: u16) -> bool {
        (self.octets_per_codec_frame_min..=self.octets_per_codec_frame_max).contains(&octets)
    }
}

/// A single PAC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacRecord {
    pub codec_id: CodecId,
    /// Capabilities of the LC3 codec, not decoded for other codecs.
    pub capabilities: Option<CodecCapabilities>,
    pub metadata: Vec<u8>,
}

impl Read for PacRecord {
    fn read(r: &mut Reader) -> Option<Self> {
        let codec_id: CodecId = r.read()?;
        let capabilities = r.read::<Vec<u8>>()?;
        let metadata = r.read::<Vec<u8>>()?;
        let capabilities = if codec_id == CodecId::LC3 {
            CodecCapabilities::from_ltv(&LtvMap::parse(&capabilities)?)
        } else {
            None
        };
        Some(Self { codec_id, capabilities, metadata })
    }
}

/// Decodes a Sink or Source PAC characteristic value.
pub fn parse_pacs(value: &[u8]) -> Option<Vec<PacRecord>> {
    let mut r = Reader::new(value);
    let num_records = r.read_u8()? as usize;
    let records: Vec<PacRecord> = (0..num_records).map_while(|_| r.read()).collect();
    if records.len() != num_records {
        return None;
    }
    Some(records)
}

pub fn parse_audio_locations(value: &[u8]) -> Option<AudioLocations> {
    let mut r = Reader::new(value);
    Some(AudioLocations::from_bits_retain(r.read_u32::<4>()?))
}

/// Decodes the Available or Supported Audio Contexts value, sink first.
pub fn parse_contexts(value: &[u8]) -> Option<BidirectionalContexts> {
    let mut r = Reader::new(value);
    Some(BidirectionalContexts {
        sink: AudioContexts::from_bits_truncate(r.read_u16()?),
        source: AudioContexts::from_bits_truncate(r.read_u16()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // 48 kHz / 16 kHz, 10 ms, 1 or 2 channels, 40..120 octets
    const LC3_RECORD: [u8; 27] = [
        0x06, 0x00, 0x00, 0x00, 0x00, // LC3
        0x10, // capabilities
        0x03, 0x01, 0x84, 0x00, //
        0x02, 0x02, 0x02, //
        0x02, 0x03, 0x03, //
        0x05, 0x04, 0x28, 0x00, 0x78, 0x00, //
        0x04, 0x03, 0x02, 0x04, 0x00,
    ];

    #[test]
    fn lc3_record() {
        let mut value = vec![0x01];
        value.extend_from_slice(&LC3_RECORD);
        let records = parse_pacs(&value).unwrap();
        assert_eq!(records.len(), 1);
        let caps = records[0].capabilities.unwrap();
        assert!(caps.supports_sampling_frequency(48_000));
        assert!(caps.supports_sampling_frequency(16_000));
        assert!(!caps.supports_sampling_frequency(24_000));
        assert!(caps.supports_frame_duration(10_000));
        assert!(!caps.supports_frame_duration(7_500));
        assert_eq!(caps.max_channel_count(), 2);
        assert!(caps.supports_octets_per_frame(100));
        assert!(!caps.supports_octets_per_frame(155));
        assert_eq!(records[0].metadata, vec![0x03, 0x02, 0x04, 0x00]);
    }

    #[test]
    fn vendor_record_keeps_raw() {
        let value = [0x01, 0xff, 0x0f, 0x00, 0x01, 0x00, 0x01, 0xaa, 0x00];
        let records = parse_pacs(&value).unwrap();
        assert_eq!(records[0].codec_id.coding_format, 0xff);
        assert_eq!(records[0].capabilities, None);
    }

    #[test]
    fn truncated_records() {
        assert_eq!(parse_pacs(&[0x02, 0x06, 0x00]), None);
        assert_eq!(parse_pacs(&[]), None);
    }

    #[test]
    fn locations_and_contexts() {
        assert_eq!(
            parse_audio_locations(&[0x03, 0x00, 0x00, 0x00]),
            Some(AudioLocations::STEREO)
        );
        assert_eq!(parse_audio_locations(&[0x03]), None);
        let contexts = parse_contexts(&[0x06, 0x00, 0x02, 0x00]).unwrap();
        assert_eq!(contexts.sink, AudioContexts::MEDIA | AudioContexts::CONVERSATIONAL);
        assert_eq!(contexts.source, AudioContexts::CONVERSATIONAL);
    }
}
