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


//! LE Audio devices: per-device ASEs, capabilities and the device registry.

use crate::error::{Error, Result};
use crate::set_configurations::CodecConfigSetting;
use crate::types::{
    AseQosConfig, AseQosPreferences, AseState, AudioLocations, BidirectionalContexts, CodecId,
    CodecSpecificConfig, DataPathState, DeviceConnectState, Direction, LeAudioContextType,
    RawAddress, StreamMetadata, CIS_CONN_HANDLE_INVALID, CIS_ID_INVALID, CONN_ID_INVALID,
};
use crate::wire::pacs::PacRecord;
use log::{info, warn};
use std::collections::BTreeSet;

/// Value and client configuration descriptor handles of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharHandles {
    pub val_hdl: u16,
    pub ccc_hdl: u16,
}

/// Characteristic handles of the ASCS and PACS services of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceHandles {
    pub ctp: CharHandles,
    pub sink_pacs: Vec<CharHandles>,
    pub source_pacs: Vec<CharHandles>,
    pub sink_audio_locations: Option<CharHandles>,
    pub source_audio_locations: Option<CharHandles>,
    pub available_contexts: CharHandles,
    pub supported_contexts: CharHandles,
    pub sink_ases: Vec<CharHandles>,
    pub source_ases: Vec<CharHandles>,
}

impl DeviceHandles {
    /// Every characteristic read when the device connects.
    pub fn readable(&self) -> Vec<CharHandles> {
        let mut handles: Vec<CharHandles> =
            self.sink_pacs.iter().chain(self.source_pacs.iter()).copied().collect();
        handles.extend(self.sink_audio_locations);
        handles.extend(self.source_audio_locations);
        handles.push(self.available_contexts);
        handles.push(self.supported_contexts);
        handles.extend(self.sink_ases.iter().chain(self.source_ases.iter()));
        handles
    }

    /// Every characteristic the client subscribes to.
    pub fn notifiable(&self) -> Vec<CharHandles> {
        let mut handles = self.readable();
        handles.push(self.ctp);
        handles.retain(|h| h.ccc_hdl != 0);
        handles
    }
}

/// Audio Stream Endpoint.
#[derive(Debug, Clone)]
pub struct Ase {
    /// Assigned by the server, learned from the characteristic value.
    pub id: u8,
    pub handles: CharHandles,
    pub direction: Direction,
    pub state: AseState,
    /// Part of the current group configuration.
    pub active: bool,
    pub cis_id: u8,
    pub cis_conn_hdl: u16,
    pub data_path_state: DataPathState,
    pub target_latency: u8,
    pub codec_id: CodecId,
    pub codec_config: CodecSpecificConfig,
    pub qos_preferences: AseQosPreferences,
    pub qos_config: AseQosConfig,
    pub metadata: StreamMetadata,
    pub configured_for_context_type: Option<LeAudioContextType>,
}

impl Ase {
    pub fn new(handles: CharHandles, direction: Direction) -> Self {
        Self {
            id: 0,
            handles,
            direction,
            state: AseState::Idle,
            active: false,
            cis_id: CIS_ID_INVALID,
            cis_conn_hdl: CIS_CONN_HANDLE_INVALID,
            data_path_state: DataPathState::Idle,
            target_latency: 0,
            codec_id: CodecId::default(),
            codec_config: CodecSpecificConfig::default(),
            qos_preferences: AseQosPreferences::default(),
            qos_config: AseQosConfig::default(),
            metadata: StreamMetadata::default(),
            configured_for_context_type: None,
        }
    }

    /// Drops everything tied to the link, the ASE is back to its initial state.
    pub fn reset(&mut self) {
        *self = Ase { id: self.id, ..Ase::new(self.handles, self.direction) };
    }
}

/// A single LE Audio device.
#[derive(Debug, Clone)]
pub struct LeAudioDevice {
    pub address: RawAddress,
    pub connection_state: DeviceConnectState,
    pub conn_id: u16,
    pub acl_handle: u16,
    pub mtu: u16,
    pub encrypted: bool,
    pub group_id: i32,
    pub autoconnect: bool,
    pub handles: DeviceHandles,
    pub ases: Vec<Ase>,
    /// PAC records per characteristic value handle.
    pub sink_pacs: Vec<(u16, Vec<PacRecord>)>,
    pub source_pacs: Vec<(u16, Vec<PacRecord>)>,
    pub sink_locations: AudioLocations,
    pub source_locations: AudioLocations,
    pub supported_contexts: BidirectionalContexts,
    pub available_contexts: BidirectionalContexts,
    /// Characteristics whose initial read did not complete yet.
    pub pending_reads: BTreeSet<u16>,
    /// The stream is being released only because this device disconnects.
    pub closing_stream_for_disconnection: bool,
}

impl LeAudioDevice {
    pub fn new(address: RawAddress, connection_state: DeviceConnectState, group_id: i32) -> Self {
        Self {
            address,
            connection_state,
            conn_id: CONN_ID_INVALID,
            acl_handle: 0,
            mtu: 23,
            encrypted: false,
            group_id,
            autoconnect: false,
            handles: DeviceHandles::default(),
            ases: Vec::new(),
            sink_pacs: Vec::new(),
            source_pacs: Vec::new(),
            sink_locations: AudioLocations::empty(),
            source_locations: AudioLocations::empty(),
            supported_contexts: BidirectionalContexts::default(),
            available_contexts: BidirectionalContexts::default(),
            pending_reads: BTreeSet::new(),
            closing_stream_for_disconnection: false,
        }
    }

    /// Installs the discovered handles and creates one ASE per ASE characteristic.
    pub fn set_handles(&mut self, handles: DeviceHandles) {
        self.ases = handles
            .sink_ases
            .iter()
            .map(|h| Ase::new(*h, Direction::Sink))
            .chain(handles.source_ases.iter().map(|h| Ase::new(*h, Direction::Source)))
            .collect();
        self.handles = handles;
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == DeviceConnectState::Connected
    }

    pub fn ase_index_by_val_hdl(&self, val_hdl: u16) -> Option<usize> {
        self.ases.iter().position(|a| a.handles.val_hdl == val_hdl)
    }

    pub fn ase_by_id(&self, id: u8) -> Option<&Ase> {
        self.ases.iter().find(|a| a.id == id)
    }

    pub fn active_ases(&self) -> impl Iterator<Item = &Ase> {
        self.ases.iter().filter(|a| a.active)
    }

    pub fn active_ases_mut(&mut self) -> impl Iterator<Item = &mut Ase> {
        self.ases.iter_mut().filter(|a| a.active)
    }

    pub fn active_ases_by_direction(&self, direction: Direction) -> impl Iterator<Item = &Ase> {
        self.active_ases().filter(move |a| a.direction == direction)
    }

    pub fn have_active_ase(&self) -> bool {
        self.active_ases().next().is_some()
    }

    /// True when every active ASE is in `state`, vacuously true without active ASEs.
    pub fn have_all_active_ases_same_state(&self, state: AseState) -> bool {
        self.active_ases().all(|a| a.state == state)
    }

    /// Sink ASEs stream on their own once the CIS is up, source ASEs wait for Receiver Start
    /// Ready, so both directions are ready once enabling.
    pub fn is_ready_to_create_stream(&self) -> bool {
        self.have_active_ase()
            && self
                .active_ases()
                .all(|a| matches!(a.state, AseState::Enabling | AseState::Streaming))
    }

    pub fn is_ready_to_suspend_stream(&self) -> bool {
        self.active_ases().all(|a| a.state == AseState::QosConfigured)
    }

    pub fn have_all_data_paths_established(&self) -> bool {
        self.active_ases().all(|a| a.data_path_state == DataPathState::DataPathEstablished)
    }

    /// Indices of the active sink and source ASEs carried by the given CIS.
    pub fn ases_by_cis_conn_hdl(&self, cis_conn_hdl: u16) -> (Option<usize>, Option<usize>) {
        let find = |direction| {
            self.ases.iter().position(|a| {
                a.active && a.direction == direction && a.cis_conn_hdl == cis_conn_hdl
            })
        };
        (find(Direction::Sink), find(Direction::Source))
    }

    pub fn ases_by_cis_id(&self, cis_id: u8) -> (Option<usize>, Option<usize>) {
        let find = |direction| {
            self.ases
                .iter()
                .position(|a| a.active && a.direction == direction && a.cis_id == cis_id)
        };
        (find(Direction::Sink), find(Direction::Source))
    }

    pub fn pac_records(&self, direction: Direction) -> impl Iterator<Item = &PacRecord> {
        let pacs = match direction {
            Direction::Sink => &self.sink_pacs,
            Direction::Source => &self.source_pacs,
        };
        pacs.iter().flat_map(|(_, records)| records.iter())
    }

    pub fn set_pac_records(&mut self, direction: Direction, val_hdl: u16, records: Vec<PacRecord>) {
        let pacs = match direction {
            Direction::Sink => &mut self.sink_pacs,
            Direction::Source => &mut self.source_pacs,
        };
        match pacs.iter_mut().find(|(hdl, _)| *hdl == val_hdl) {
            Some(entry) => entry.1 = records,
            None => pacs.push((val_hdl, records)),
        }
    }

    pub fn audio_locations(&self, direction: Direction) -> AudioLocations {
        match direction {
            Direction::Sink => self.sink_locations,
            Direction::Source => self.source_locations,
        }
    }

    /// Highest channel count any LC3 record of the direction supports, one without records.
    pub fn max_channel_count(&self, direction: Direction) -> u8 {
        self.pac_records(direction)
            .filter_map(|r| r.capabilities)
            .map(|c| c.max_channel_count())
            .max()
            .unwrap_or(1)
    }

    pub fn is_codec_config_supported(
        &self,
        direction: Direction,
        setting: &CodecConfigSetting,
    ) -> bool {
        self.pac_records(direction).any(|r| {
            r.codec_id == setting.codec_id
                && r.capabilities.map_or(false, |c| setting.is_supported_by(&c))
        })
    }

    /// ASEs of the direction which are not part of the current configuration.
    pub fn free_ase_count(&self, direction: Direction) -> usize {
        self.ases.iter().filter(|a| a.direction == direction && !a.active).count()
    }

    pub fn ase_count(&self, direction: Direction) -> usize {
        self.ases.iter().filter(|a| a.direction == direction).count()
    }

    /// Updates the available contexts, returns whether they changed.
    pub fn set_available_contexts(&mut self, contexts: BidirectionalContexts) -> bool {
        if self.available_contexts == contexts {
            return false;
        }
        info!(
            "{}: available contexts sink: {:?} -> {:?}, source: {:?} -> {:?}",
            self.address,
            self.available_contexts.sink,
            contexts.sink,
            self.available_contexts.source,
            contexts.source
        );
        self.available_contexts = contexts;
        true
    }

    pub fn deactivate_all_ases(&mut self) {
        for ase in self.ases.iter_mut() {
            ase.active = false;
            ase.cis_id = CIS_ID_INVALID;
            ase.cis_conn_hdl = CIS_CONN_HANDLE_INVALID;
            ase.data_path_state = DataPathState::Idle;
        }
    }

    /// Forces every ASE back to Idle, as seen after the link is gone.
    pub fn reset_ases(&mut self) {
        for ase in self.ases.iter_mut() {
            ase.reset();
        }
    }

    /// Handles of the connected CISes of the device, deduplicated.
    pub fn cis_conn_handles(&self) -> Vec<u16> {
        let mut handles: Vec<u16> = self
            .active_ases()
            .filter(|a| a.cis_conn_hdl != CIS_CONN_HANDLE_INVALID)
            .map(|a| a.cis_conn_hdl)
            .collect();
        handles.sort_unstable();
        handles.dedup();
        handles
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "  device {} state {:?} conn_id {:#06x} group {}\n",
            self.address, self.connection_state, self.conn_id, self.group_id
        );
        for ase in &self.ases {
            out += &format!(
                "    ase {} {:?} {:?} active {} cis {} hdl {:#06x} data path {:?}\n",
                ase.id,
                ase.direction,
                ase.state,
                ase.active,
                ase.cis_id,
                ase.cis_conn_hdl,
                ase.data_path_state
            );
        }
        out
    }
}

/// Registry of the known devices.
#[derive(Debug, Default)]
pub struct LeAudioDevices {
    devices: Vec<LeAudioDevice>,
}

impl LeAudioDevices {
    pub fn add(
        &mut self,
        address: RawAddress,
        state: DeviceConnectState,
        group_id: i32,
    ) -> Result<()> {
        if self.find_by_address(&address).is_some() {
            warn!("Device {} already exists", address);
            return Err(Error::DeviceAlreadyExists(address));
        }
        self.devices.push(LeAudioDevice::new(address, state, group_id));
        Ok(())
    }

    /// Drops the record, an existing connection is left to the caller.
    pub fn remove(&mut self, address: &RawAddress) -> Option<LeAudioDevice> {
        let index = self.devices.iter().position(|d| d.address == *address)?;
        Some(self.devices.remove(index))
    }

    pub fn find_by_address(&self, address: &RawAddress) -> Option<&LeAudioDevice> {
        self.devices.iter().find(|d| d.address == *address)
    }

    pub fn find_by_address_mut(&mut self, address: &RawAddress) -> Option<&mut LeAudioDevice> {
        self.devices.iter_mut().find(|d| d.address == *address)
    }

    pub fn find_by_conn_id(&self, conn_id: u16) -> Option<&LeAudioDevice> {
        if conn_id == CONN_ID_INVALID {
            return None;
        }
        self.devices.iter().find(|d| d.conn_id == conn_id)
    }

    /// Device streaming on the given CIS. Connection handles are unique across CIGs.
    pub fn find_by_cis_conn_hdl(&self, cis_conn_hdl: u16) -> Option<&LeAudioDevice> {
        if cis_conn_hdl == CIS_CONN_HANDLE_INVALID {
            return None;
        }
        self.devices.iter().find(|d| d.ases.iter().any(|a| a.cis_conn_hdl == cis_conn_hdl))
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LeAudioDevice> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LeAudioDevice> {
        self.devices.iter_mut()
    }

    pub fn cleanup(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GROUP_UNKNOWN;
    use crate::wire::pacs::CodecCapabilities;

    fn address(last: u8) -> RawAddress {
        RawAddress::new([0xc0, 0xde, 0xc0, 0xde, 0x00, last])
    }

    fn handles() -> DeviceHandles {
        DeviceHandles {
            ctp: CharHandles { val_hdl: 0x20, ccc_hdl: 0x21 },
            sink_pacs: vec![CharHandles { val_hdl: 0x30, ccc_hdl: 0x31 }],
            source_pacs: vec![],
            sink_audio_locations: Some(CharHandles { val_hdl: 0x32, ccc_hdl: 0 }),
            source_audio_locations: None,
            available_contexts: CharHandles { val_hdl: 0x34, ccc_hdl: 0x35 },
            supported_contexts: CharHandles { val_hdl: 0x36, ccc_hdl: 0 },
            sink_ases: vec![
                CharHandles { val_hdl: 0x10, ccc_hdl: 0x11 },
                CharHandles { val_hdl: 0x12, ccc_hdl: 0x13 },
            ],
            source_ases: vec![CharHandles { val_hdl: 0x14, ccc_hdl: 0x15 }],
        }
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut devices = LeAudioDevices::default();
        assert_eq!(devices.add(address(1), DeviceConnectState::ConnectingByUser, 1), Ok(()));
        assert_eq!(
            devices.add(address(1), DeviceConnectState::Disconnected, GROUP_UNKNOWN),
            Err(Error::DeviceAlreadyExists(address(1)))
        );
        assert_eq!(devices.size(), 1);
        assert_eq!(devices.find_by_address(&address(1)).unwrap().group_id, 1);
    }

    #[test]
    fn registry_lookups() {
        let mut devices = LeAudioDevices::default();
        devices.add(address(1), DeviceConnectState::Connected, 1).unwrap();
        devices.add(address(2), DeviceConnectState::Connected, 1).unwrap();
        let dev = devices.find_by_address_mut(&address(2)).unwrap();
        dev.conn_id = 5;
        dev.set_handles(handles());
        dev.ases[0].active = true;
        dev.ases[0].cis_conn_hdl = 0x60;

        assert_eq!(devices.find_by_conn_id(5).unwrap().address, address(2));
        assert!(devices.find_by_conn_id(CONN_ID_INVALID).is_none());
        assert_eq!(devices.find_by_cis_conn_hdl(0x60).unwrap().address, address(2));
        assert!(devices.find_by_cis_conn_hdl(CIS_CONN_HANDLE_INVALID).is_none());

        assert!(devices.remove(&address(2)).is_some());
        assert!(devices.remove(&address(2)).is_none());
        assert!(devices.find_by_conn_id(5).is_none());
    }

    #[test]
    fn ases_from_handles() {
        let mut dev = LeAudioDevice::new(address(1), DeviceConnectState::Connected, 1);
        dev.set_handles(handles());
        assert_eq!(dev.ase_count(Direction::Sink), 2);
        assert_eq!(dev.ase_count(Direction::Source), 1);
        assert_eq!(dev.ase_index_by_val_hdl(0x14), Some(2));
        assert_eq!(dev.handles.readable().len(), 7);
        assert_eq!(dev.handles.notifiable().len(), 6);
    }

    #[test]
    fn active_ase_helpers() {
        let mut dev = LeAudioDevice::new(address(1), DeviceConnectState::Connected, 1);
        dev.set_handles(handles());
        assert!(!dev.have_active_ase());
        assert!(!dev.is_ready_to_create_stream());

        dev.ases[0].active = true;
        dev.ases[0].cis_id = 0;
        dev.ases[0].cis_conn_hdl = 0x60;
        dev.ases[0].state = AseState::Enabling;
        dev.ases[2].active = true;
        dev.ases[2].cis_id = 0;
        dev.ases[2].cis_conn_hdl = 0x60;
        dev.ases[2].state = AseState::Enabling;

        assert!(dev.is_ready_to_create_stream());
        assert!(!dev.have_all_active_ases_same_state(AseState::Streaming));
        assert_eq!(dev.ases_by_cis_conn_hdl(0x60), (Some(0), Some(2)));
        assert_eq!(dev.ases_by_cis_id(0), (Some(0), Some(2)));
        assert_eq!(dev.cis_conn_handles(), vec![0x60]);
        assert_eq!(dev.free_ase_count(Direction::Sink), 1);

        dev.deactivate_all_ases();
        assert!(!dev.have_active_ase());
        assert_eq!(dev.ases[0].cis_id, CIS_ID_INVALID);
    }

    #[test]
    fn codec_support_from_pacs() {
        let mut dev = LeAudioDevice::new(address(1), DeviceConnectState::Connected, 1);
        let caps = CodecCapabilities {
            supported_sampling_frequencies: 0x0084,
            supported_frame_durations: 0x02,
            supported_channel_counts: 0x01,
            octets_per_codec_frame_min: 40,
            octets_per_codec_frame_max: 120,
            max_codec_frames_per_sdu: 1,
        };
        let record = PacRecord { codec_id: CodecId::LC3, capabilities: Some(caps), metadata: vec![] };
        dev.set_pac_records(Direction::Sink, 0x30, vec![record.clone()]);
        dev.set_pac_records(Direction::Sink, 0x30, vec![record]);
        assert_eq!(dev.pac_records(Direction::Sink).count(), 1);
        assert_eq!(dev.max_channel_count(Direction::Sink), 1);

        let mut setting = CodecConfigSetting {
            codec_id: CodecId::LC3,
            sampling_frequency_hz: 48_000,
            frame_duration_us: 10_000,
            octets_per_codec_frame: 120,
            codec_frames_blocks_per_sdu: 1,
            channel_count_per_ase: 1,
        };
        assert!(dev.is_codec_config_supported(Direction::Sink, &setting));
        assert!(!dev.is_codec_config_supported(Direction::Source, &setting));
        setting.channel_count_per_ase = 2;
        assert!(!dev.is_codec_config_supported(Direction::Sink, &setting));
    }
}
