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


//! Collaborators of the client: GATT, ISO manager, local audio HAL, LC3 codec and the upper
//! layer callbacks.

use crate::device::DeviceHandles;
use crate::types::{
    AudioContexts, AudioDirections, AudioLocations, CodecId, CodecLocation, ConnectionState,
    Direction, GroupNodeStatus, GroupStatus, GroupStreamStatus, RawAddress,
};

/// Per CIS parameters of a CIG.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CisConfig {
    pub cis_id: u8,
    pub max_sdu_c_to_p: u16,
    pub max_sdu_p_to_c: u16,
    pub phy_c_to_p: u8,
    pub phy_p_to_c: u8,
    pub rtn_c_to_p: u8,
    pub rtn_p_to_c: u8,
}

/// Parameters of the LE Set CIG Parameters command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CigParameters {
    pub cig_id: u8,
    pub sdu_interval_c_to_p: u32,
    pub sdu_interval_p_to_c: u32,
    pub worst_case_sca: u8,
    pub packing: u8,
    pub framing: u8,
    pub max_transport_latency_c_to_p: u16,
    pub max_transport_latency_p_to_c: u16,
    pub cis: Vec<CisConfig>,
}

/// Parameters of the LE Setup ISO Data Path command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPathParameters {
    /// Sink for host to controller, source for controller to host.
    pub direction: Direction,
    pub codec_id: CodecId,
    pub codec_location: CodecLocation,
    pub controller_delay_us: u32,
    pub codec_config: Vec<u8>,
}

/// Completion of a CIS establishment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CisEstablishedEvent {
    pub status: u8,
    pub cig_id: u8,
    pub cis_conn_hdl: u16,
    pub transport_latency_c_to_p_us: u32,
    pub transport_latency_p_to_c_us: u32,
}

/// Result of the LE Read ISO Link Quality command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkQualityReport {
    pub cis_conn_hdl: u16,
    pub tx_unacked_packets: u32,
    pub tx_flushed_packets: u32,
    pub tx_last_subevent_packets: u32,
    pub retransmitted_packets: u32,
    pub crc_error_packets: u32,
    pub rx_unreceived_packets: u32,
    pub duplicate_packets: u32,
}

/// GATT client transport. Results come back through the client entry points.
pub trait GattInterface {
    fn open(&self, address: RawAddress, direct: bool);
    fn cancel_open(&self, address: RawAddress);
    fn close(&self, conn_id: u16);
    /// Drops the ACL link, for peers which do not answer any more.
    fn disconnect_acl(&self, address: RawAddress);
    fn discover_services(&self, conn_id: u16);
    fn read_characteristic(&self, conn_id: u16, handle: u16);
    fn write_descriptor(&self, conn_id: u16, handle: u16, value: Vec<u8>);
    /// Write without response to the ASE control point.
    fn write_characteristic(&self, conn_id: u16, handle: u16, value: Vec<u8>);
    /// Drops the queued operations of the connection.
    fn clean_pending(&self, conn_id: u16);
}

/// Isochronous channels of the controller. Results come back through the client entry points.
pub trait IsoManager {
    fn create_cig(&self, params: CigParameters);
    fn remove_cig(&self, cig_id: u8, force: bool);
    /// Establishes the CISes, given as (CIS connection handle, ACL handle) pairs.
    fn establish_cis(&self, pairs: Vec<(u16, u16)>);
    fn disconnect_cis(&self, cis_conn_hdl: u16, reason: u8);
    fn setup_iso_data_path(&self, cis_conn_hdl: u16, params: DataPathParameters);
    fn remove_iso_data_path(&self, cis_conn_hdl: u16, directions: AudioDirections);
    fn read_iso_link_quality(&self, cis_conn_hdl: u16);
    fn send_iso_data(&self, cis_conn_hdl: u16, data: &[u8]);
}

/// PCM format exchanged with the local audio HAL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcmConfiguration {
    pub num_channels: u8,
    pub sample_rate_hz: u32,
    pub bits_per_sample: u8,
    pub data_interval_us: u32,
}

/// Stream description handed to the audio DSP when the codec runs there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadConfiguration {
    pub streams: Vec<(u16, AudioLocations)>,
    pub bits_per_sample: u8,
    pub sample_rate_hz: u32,
    pub frame_duration_us: u32,
    pub octets_per_codec_frame: u16,
    pub codec_frames_blocks_per_sdu: u8,
    pub peer_delay_ms: u16,
}

/// One direction of the local audio HAL. The sink instance feeds audio to the remote sinks, the
/// source instance receives audio captured by the remote sources.
pub trait AudioHalClient {
    fn start(&self, config: &PcmConfiguration) -> bool;
    fn stop(&self);
    /// Hands decoded PCM to the HAL, returns the number of bytes consumed.
    fn send_data(&self, data: &[u8]) -> usize;
    fn confirm_streaming_request(&self);
    fn cancel_streaming_request(&self);
    fn update_remote_delay(&self, delay_ms: u16);
    fn update_audio_config_to_hal(&self, config: &OffloadConfiguration);
}

pub trait Lc3Encoder {
    /// Encodes one frame of the channel starting at `pcm[0]`, samples `stride` apart.
    fn encode(&mut self, pcm: &[i16], stride: usize, output_len: usize) -> Vec<u8>;
}

pub trait Lc3Decoder {
    /// Decodes one frame into `samples` PCM samples.
    fn decode(&mut self, frame: &[u8], samples: usize) -> Vec<i16>;
}

/// Creates codec instances for a frame duration and sampling rate.
pub trait Lc3Factory {
    fn encoder(&self, frame_duration_us: u32, sample_rate_hz: u32) -> Box<dyn Lc3Encoder>;
    fn decoder(&self, frame_duration_us: u32, sample_rate_hz: u32) -> Box<dyn Lc3Decoder>;
}

/// Upper layer notifications.
pub trait LeAudioCallbacks {
    fn on_connection_state(&self, state: ConnectionState, address: RawAddress);
    fn on_group_status(&self, group_id: i32, status: GroupStatus);
    fn on_group_stream_status(&self, group_id: i32, status: GroupStreamStatus);
    fn on_group_node_status(&self, address: RawAddress, group_id: i32, status: GroupNodeStatus);
    fn on_audio_conf(
        &self,
        directions: AudioDirections,
        group_id: i32,
        sink_locations: AudioLocations,
        source_locations: AudioLocations,
        available_contexts: AudioContexts,
    );
    fn on_sink_audio_location_available(&self, address: RawAddress, locations: AudioLocations);
}

/// Reports of the group state machine to its owner.
pub trait StateMachineCallbacks {
    fn status_report(&self, group_id: i32, status: GroupStreamStatus);
    fn on_state_transition_timeout(&self, group_id: i32);
    fn on_update_cis_configuration(&self, group_id: i32, direction: Direction);
    fn cancel_streaming_request(&self, group_id: i32);
}

/// Result of the service discovery of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSearchResult {
    Found(DeviceHandles),
    /// No ASCS or PACS instance on the device.
    NotFound,
    Failed,
}
