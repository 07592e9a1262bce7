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


//! Core LE Audio types: addresses, directions, context and location bitmaps, the ASE and
//! group level state enums and the negotiated codec/QoS parameters of an ASE.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Group id of devices which are not part of any group.
pub const GROUP_UNKNOWN: i32 = -1;
/// GATT connection id of a device without a GATT connection.
pub const CONN_ID_INVALID: u16 = 0xffff;
/// CIS id of an ASE not mapped to a CIS.
pub const CIS_ID_INVALID: u8 = 0xff;
/// Connection handle of a CIS not created by the controller yet.
pub const CIS_CONN_HANDLE_INVALID: u16 = 0;

/// A Bluetooth device address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress {
    pub address: [u8; 6],
}

impl RawAddress {
    pub const fn new(address: [u8; 6]) -> Self {
        Self { address }
    }

    pub const fn empty() -> Self {
        Self { address: [0; 6] }
    }

    pub fn is_empty(&self) -> bool {
        self.address == [0; 6]
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.address;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a[0], a[1], a[2], a[3], a[4], a[5])
    }
}

impl fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Direction of audio, seen from the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
#[derive(Serialize, Deserialize)]
pub enum Direction {
    /// Remote renders audio (local playback).
    Sink = 1,
    /// Remote captures audio (local recording).
    Source = 2,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Sink, Direction::Source];

    pub fn opposite(self) -> Self {
        match self {
            Direction::Sink => Direction::Source,
            Direction::Source => Direction::Sink,
        }
    }
}

bitflags! {
    /// Set of audio directions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AudioDirections: u8 {
        const SINK = 0x01;
        const SOURCE = 0x02;
    }
}

impl From<Direction> for AudioDirections {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Sink => AudioDirections::SINK,
            Direction::Source => AudioDirections::SOURCE,
        }
    }
}

/// A single audio context type, as carried in the Context Type bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum LeAudioContextType {
    Unspecified = 0x0001,
    Conversational = 0x0002,
    Media = 0x0004,
    Game = 0x0008,
    Instructional = 0x0010,
    VoiceAssistants = 0x0020,
    Live = 0x0040,
    SoundEffects = 0x0080,
    Notifications = 0x0100,
    Ringtone = 0x0200,
    Alerts = 0x0400,
    EmergencyAlarm = 0x0800,
}

impl LeAudioContextType {
    pub const ALL: [LeAudioContextType; 12] = [
        LeAudioContextType::Unspecified,
        LeAudioContextType::Conversational,
        LeAudioContextType::Media,
        LeAudioContextType::Game,
        LeAudioContextType::Instructional,
        LeAudioContextType::VoiceAssistants,
        LeAudioContextType::Live,
        LeAudioContextType::SoundEffects,
        LeAudioContextType::Notifications,
        LeAudioContextType::Ringtone,
        LeAudioContextType::Alerts,
        LeAudioContextType::EmergencyAlarm,
    ];
}

impl fmt::Display for LeAudioContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Context Type bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AudioContexts: u16 {
        const UNSPECIFIED = 0x0001;
        const CONVERSATIONAL = 0x0002;
        const MEDIA = 0x0004;
        const GAME = 0x0008;
        const INSTRUCTIONAL = 0x0010;
        const VOICE_ASSISTANTS = 0x0020;
        const LIVE = 0x0040;
        const SOUND_EFFECTS = 0x0080;
        const NOTIFICATIONS = 0x0100;
        const RINGTONE = 0x0200;
        const ALERTS = 0x0400;
        const EMERGENCY_ALARM = 0x0800;
    }
}

impl AudioContexts {
    pub fn test(&self, context: LeAudioContextType) -> bool {
        self.contains(context.into())
    }

    /// Context types present in the set, in bit order.
    pub fn types(&self) -> impl Iterator<Item = LeAudioContextType> + '_ {
        LeAudioContextType::ALL.into_iter().filter(|c| self.test(*c))
    }
}

impl From<LeAudioContextType> for AudioContexts {
    fn from(context: LeAudioContextType) -> Self {
        AudioContexts::from_bits_truncate(context as u16)
    }
}

impl FromIterator<LeAudioContextType> for AudioContexts {
    fn from_iter<I: IntoIterator<Item = LeAudioContextType>>(iter: I) -> Self {
        iter.into_iter().fold(AudioContexts::empty(), |acc, c| acc | c.into())
    }
}

/// A pair of context sets, one per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BidirectionalContexts {
    pub sink: AudioContexts,
    pub source: AudioContexts,
}

impl BidirectionalContexts {
    pub fn new(sink: AudioContexts, source: AudioContexts) -> Self {
        Self { sink, source }
    }

    pub fn get(&self, direction: Direction) -> AudioContexts {
        match direction {
            Direction::Sink => self.sink,
            Direction::Source => self.source,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut AudioContexts {
        match direction {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
        }
    }

    pub fn union(&self) -> AudioContexts {
        self.sink | self.source
    }

    pub fn is_empty(&self) -> bool {
        self.sink.is_empty() && self.source.is_empty()
    }
}

bitflags! {
    /// Audio Location bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AudioLocations: u32 {
        const FRONT_LEFT = 0x0000_0001;
        const FRONT_RIGHT = 0x0000_0002;
        const FRONT_CENTER = 0x0000_0004;
        const LOW_FREQ_EFFECTS_1 = 0x0000_0008;
        const BACK_LEFT = 0x0000_0010;
        const BACK_RIGHT = 0x0000_0020;
        const FRONT_LEFT_OF_CENTER = 0x0000_0040;
        const FRONT_RIGHT_OF_CENTER = 0x0000_0080;
        const BACK_CENTER = 0x0000_0100;
        const LOW_FREQ_EFFECTS_2 = 0x0000_0200;
        const SIDE_LEFT = 0x0000_0400;
        const SIDE_RIGHT = 0x0000_0800;
        const TOP_FRONT_LEFT = 0x0000_1000;
        const TOP_FRONT_RIGHT = 0x0000_2000;
        const TOP_FRONT_CENTER = 0x0000_4000;
        const TOP_CENTER = 0x0000_8000;
        const TOP_BACK_LEFT = 0x0001_0000;
        const TOP_BACK_RIGHT = 0x0002_0000;
        const TOP_SIDE_LEFT = 0x0004_0000;
        const TOP_SIDE_RIGHT = 0x0008_0000;
        const TOP_BACK_CENTER = 0x0010_0000;
        const BOTTOM_FRONT_CENTER = 0x0020_0000;
        const BOTTOM_FRONT_LEFT = 0x0040_0000;
        const BOTTOM_FRONT_RIGHT = 0x0080_0000;
        const FRONT_LEFT_WIDE = 0x0100_0000;
        const FRONT_RIGHT_WIDE = 0x0200_0000;
        const LEFT_SURROUND = 0x0400_0000;
        const RIGHT_SURROUND = 0x0800_0000;

        const ANY_LEFT = Self::FRONT_LEFT.bits() | Self::BACK_LEFT.bits()
            | Self::FRONT_LEFT_OF_CENTER.bits() | Self::SIDE_LEFT.bits()
            | Self::TOP_FRONT_LEFT.bits() | Self::TOP_BACK_LEFT.bits()
            | Self::TOP_SIDE_LEFT.bits() | Self::BOTTOM_FRONT_LEFT.bits()
            | Self::FRONT_LEFT_WIDE.bits() | Self::LEFT_SURROUND.bits();
        const ANY_RIGHT = Self::FRONT_RIGHT.bits() | Self::BACK_RIGHT.bits()
            | Self::FRONT_RIGHT_OF_CENTER.bits() | Self::SIDE_RIGHT.bits()
            | Self::TOP_FRONT_RIGHT.bits() | Self::TOP_BACK_RIGHT.bits()
            | Self::TOP_SIDE_RIGHT.bits() | Self::BOTTOM_FRONT_RIGHT.bits()
            | Self::FRONT_RIGHT_WIDE.bits() | Self::RIGHT_SURROUND.bits();
        const STEREO = Self::FRONT_LEFT.bits() | Self::FRONT_RIGHT.bits();
    }
}

impl AudioLocations {
    /// Number of channels carried by a stream with this allocation, a mono stream has none set.
    pub fn channel_count(&self) -> u8 {
        self.bits().count_ones().max(1) as u8
    }

    pub fn is_left(&self) -> bool {
        self.intersects(AudioLocations::ANY_LEFT)
    }

    pub fn is_right(&self) -> bool {
        self.intersects(AudioLocations::ANY_RIGHT)
    }
}

/// ASE state, as reported in the ASE characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
pub enum AseState {
    #[default]
    Idle = 0x00,
    CodecConfigured = 0x01,
    QosConfigured = 0x02,
    Enabling = 0x03,
    Streaming = 0x04,
    Disabling = 0x05,
    Releasing = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CisType {
    Bidirectional,
    UnidirectionalSink,
    UnidirectionalSource,
}

/// Per ASE progress of the isochronous channel and its data path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataPathState {
    #[default]
    Idle,
    CisAssigned,
    CisPending,
    CisEstablished,
    DataPathEstablished,
    CisDisconnecting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CigState {
    #[default]
    None,
    Creating,
    Created,
    Removing,
}

/// Connection lifecycle of a device, as tracked by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceConnectState {
    #[default]
    Disconnected,
    ConnectingByUser,
    ConnectingAutoconnect,
    ConnectedGettingReady,
    Connected,
    Disconnecting,
    /// Removal requested while connected, the record goes away on disconnection.
    PendingRemoval,
}

/// Stream status of a group, as reported by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStreamStatus {
    Idle,
    Streaming,
    Releasing,
    Suspending,
    Suspended,
    ConfiguredAutonomous,
    ConfiguredByUser,
    Destroyed,
}

/// Activation status of a group, as reported to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Inactive,
    Active,
    TurnedIdleDuringCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupNodeStatus {
    Added,
    Removed,
}

/// Profile connection state, as reported to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Codec identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecId {
    pub coding_format: u8,
    #[serde(default)]
    pub vendor_company_id: u16,
    #[serde(default)]
    pub vendor_codec_id: u16,
}

impl CodecId {
    pub const LC3: CodecId = CodecId { coding_format: 0x06, vendor_company_id: 0, vendor_codec_id: 0 };
}

/// Where the LC3 codec runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecLocation {
    /// Encoding and decoding is done by this stack.
    #[default]
    Host,
    /// Encoding and decoding is done by the audio DSP, fed with the CIS allocation.
    Adsp,
}

/// Codec specific configuration negotiated for an ASE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecSpecificConfig {
    pub sampling_frequency_hz: u32,
    pub frame_duration_us: u32,
    pub audio_channel_allocation: AudioLocations,
    pub octets_per_codec_frame: u16,
    pub codec_frames_blocks_per_sdu: u8,
}

impl CodecSpecificConfig {
    pub fn channel_count(&self) -> u8 {
        self.audio_channel_allocation.channel_count()
    }

    pub fn max_sdu_size(&self) -> u16 {
        self.octets_per_codec_frame
            * self.channel_count() as u16
            * self.codec_frames_blocks_per_sdu.max(1) as u16
    }

    pub fn sdu_interval_us(&self) -> u32 {
        self.frame_duration_us * self.codec_frames_blocks_per_sdu.max(1) as u32
    }
}

/// QoS preferences reported by the server in the Codec Configured state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AseQosPreferences {
    pub supported_framing: u8,
    pub preferred_phy: u8,
    pub preferred_retrans_nb: u8,
    pub max_transport_latency: u16,
    pub pres_delay_min: u32,
    pub pres_delay_max: u32,
    pub preferred_pres_delay_min: u32,
    pub preferred_pres_delay_max: u32,
}

/// QoS configuration written to an ASE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AseQosConfig {
    pub cig_id: u8,
    pub cis_id: u8,
    pub sdu_interval_us: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu_size: u16,
    pub retrans_nb: u8,
    pub max_transport_latency: u16,
    pub presentation_delay_us: u32,
}

/// Streaming metadata of an ASE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub contexts: AudioContexts,
    pub ccids: Vec<u8>,
}
