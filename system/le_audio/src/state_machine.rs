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


//! Group level ASE state machine.
//!
//! A group reaches a state once every active ASE of every active device reported it. The
//! machine drives the control point procedures, the CIG and the CISes toward the group's target
//! state, and reports stream status changes through [`StateMachineCallbacks`].

use crate::config::LeAudioConfig;
use crate::device::{LeAudioDevice, LeAudioDevices};
use crate::group::LeAudioDeviceGroup;
use crate::interfaces::{
    CisEstablishedEvent, DataPathParameters, GattInterface, IsoManager, StateMachineCallbacks,
};
use crate::set_configurations::AudioSetConfigurationProvider;
use crate::timer::Alarm;
use crate::types::{
    AseState, BidirectionalContexts, CigState, CodecLocation, DataPathState, Direction,
    GroupStreamStatus, LeAudioContextType, RawAddress, StreamMetadata, CIS_CONN_HANDLE_INVALID,
};
use crate::wire::ascs::{
    self, AseStatus, AseStatusParams, CodecConfigRequest, CtpNotification, CtpOpcode,
    CtpResponseCode, MetadataRequest, QosConfigRequest, CTP_REASON_INVALID_ASE_CIS_MAPPING,
    TARGET_PHY_2M,
};
use crate::Message;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Duration;

/// Remote User Terminated Connection.
const HCI_ERR_PEER_USER: u8 = 0x13;

const FRAMING_UNFRAMED: u8 = 0x00;
const FRAMING_FRAMED: u8 = 0x01;
/// Supported_Framing value of servers which can't do unframed PDUs.
const UNFRAMED_NOT_SUPPORTED: u8 = 0x01;

fn device_released(device: &LeAudioDevice) -> bool {
    device.active_ases().all(|a| {
        matches!(a.state, AseState::Idle | AseState::CodecConfigured)
            && matches!(a.data_path_state, DataPathState::Idle | DataPathState::CisAssigned)
    })
}

pub struct LeAudioGroupStateMachine {
    gatt: Rc<dyn GattInterface>,
    iso: Rc<dyn IsoManager>,
    callbacks: Rc<dyn StateMachineCallbacks>,
    tx: UnboundedSender<Message>,
    watchdogs: HashMap<i32, Alarm>,
    transition_timeout: Duration,
    codec_location: CodecLocation,
}

impl LeAudioGroupStateMachine {
    pub fn new(
        gatt: Rc<dyn GattInterface>,
        iso: Rc<dyn IsoManager>,
        callbacks: Rc<dyn StateMachineCallbacks>,
        tx: UnboundedSender<Message>,
        config: &LeAudioConfig,
    ) -> Self {
        Self {
            gatt,
            iso,
            callbacks,
            tx,
            watchdogs: HashMap::new(),
            transition_timeout: config.state_transition_timeout(),
            codec_location: config.codec_location,
        }
    }

    pub fn is_watchdog_armed(&self, group_id: i32) -> bool {
        self.watchdogs.get(&group_id).map_or(false, Alarm::is_scheduled)
    }

    fn arm_watchdog(&mut self, group_id: i32) {
        let tx = self.tx.clone();
        self.watchdogs.entry(group_id).or_default().schedule(
            self.transition_timeout,
            tx,
            Message::StateTransitionTimeout(group_id),
        );
    }

    fn cancel_watchdog(&mut self, group_id: i32) {
        if let Some(mut alarm) = self.watchdogs.remove(&group_id) {
            alarm.cancel();
        }
    }

    fn set_target_state(&mut self, group: &mut LeAudioDeviceGroup, state: AseState) {
        group.set_target_state(state);
        if group.state() == state {
            self.cancel_watchdog(group.group_id);
        } else {
            self.arm_watchdog(group.group_id);
        }
    }

    fn reach_state(&mut self, group: &mut LeAudioDeviceGroup, state: AseState) {
        group.set_state(state);
        if group.target_state() == state {
            self.cancel_watchdog(group.group_id);
        }
    }

    fn write_ctp(&self, device: &LeAudioDevice, value: Vec<u8>) {
        debug!("{}: control point {:02x?}", device.address, value);
        self.gatt.write_characteristic(device.conn_id, device.handles.ctp.val_hdl, value);
    }

    /// Selects and activates the configuration of the context type. CIS ids left from a torn
    /// down CIG are dropped first.
    fn configure_group(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
        context_type: LeAudioContextType,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
    ) -> bool {
        match group.cig.state {
            CigState::None => group.cig_clear_cis(),
            CigState::Removing => {
                warn!("group {}: CIG still being removed", group.group_id);
                return false;
            }
            CigState::Creating | CigState::Created => {}
        }
        if !group.cig_generate_cis_ids(context_type, devices, provider) {
            return false;
        }
        group.configure(context_type, metadata_contexts, ccids, devices, provider)
    }

    /// Configures the group codec for the context type without starting the stream.
    pub fn configure_stream(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
        context_type: LeAudioContextType,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
    ) -> bool {
        if group.state() > AseState::CodecConfigured || group.is_in_transition() {
            error!(
                "group {}: can't configure in {:?} -> {:?}",
                group.group_id,
                group.state(),
                group.target_state()
            );
            return false;
        }
        info!("group {}: configure stream for {}", group.group_id, context_type);
        if !self.configure_group(group, devices, provider, context_type, metadata_contexts, ccids)
        {
            return false;
        }
        self.set_target_state(group, AseState::CodecConfigured);
        self.send_codec_config_to_group(group, devices)
    }

    pub fn start_stream(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
        context_type: LeAudioContextType,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
    ) -> bool {
        info!(
            "group {}: start stream for {} in {:?} -> {:?}",
            group.group_id,
            context_type,
            group.state(),
            group.target_state()
        );
        if group.is_in_transition() {
            warn!("group {}: in transition, start ignored", group.group_id);
            return false;
        }
        match group.state() {
            AseState::Streaming => {
                self.update_metadata(group, devices, metadata_contexts, ccids);
                true
            }
            AseState::Idle => {
                if !self.configure_group(
                    group,
                    devices,
                    provider,
                    context_type,
                    metadata_contexts,
                    ccids,
                ) {
                    return false;
                }
                self.set_target_state(group, AseState::Streaming);
                self.send_codec_config_to_group(group, devices)
            }
            AseState::CodecConfigured => {
                let same_context = group.configuration_context_type == context_type
                    && group.cig_generate_cis_ids(context_type, devices, provider);
                if same_context && group.activate(context_type, metadata_contexts, ccids.clone(), devices)
                {
                    self.set_target_state(group, AseState::Streaming);
                    self.create_cig_or_send_qos(group, devices);
                    return true;
                }
                if !self.configure_group(
                    group,
                    devices,
                    provider,
                    context_type,
                    metadata_contexts,
                    ccids,
                ) {
                    return false;
                }
                self.set_target_state(group, AseState::Streaming);
                self.send_codec_config_to_group(group, devices)
            }
            AseState::QosConfigured => {
                if group.configuration_context_type != context_type {
                    warn!(
                        "group {}: suspended for {}, can't resume for {}",
                        group.group_id, group.configuration_context_type, context_type
                    );
                    return false;
                }
                for address in group.active_device_addresses(devices) {
                    let Some(device) = devices.find_by_address_mut(&address) else {
                        continue;
                    };
                    for ase in device.active_ases_mut() {
                        ase.metadata = StreamMetadata {
                            contexts: metadata_contexts.get(ase.direction),
                            ccids: ccids.clone(),
                        };
                    }
                }
                group.metadata_contexts = metadata_contexts;
                group.ccids = ccids;
                self.set_target_state(group, AseState::Streaming);
                self.send_enable_to_group(group, devices)
            }
            state => {
                error!("group {}: can't start from {:?}", group.group_id, state);
                false
            }
        }
    }

    /// Disables the ASEs, keeping the CIG and the codec configuration.
    pub fn suspend_stream(&mut self, group: &mut LeAudioDeviceGroup, devices: &mut LeAudioDevices) {
        info!("group {}: suspend stream in {:?}", group.group_id, group.state());
        if group.target_state() == AseState::QosConfigured {
            return;
        }
        if !matches!(group.state(), AseState::Enabling | AseState::Streaming) {
            warn!("group {}: nothing to suspend in {:?}", group.group_id, group.state());
            return;
        }
        self.set_target_state(group, AseState::QosConfigured);
        for address in group.active_device_addresses(devices) {
            let Some(device) = devices.find_by_address(&address) else {
                continue;
            };
            let ids: Vec<u8> = device
                .active_ases()
                .filter(|a| matches!(a.state, AseState::Enabling | AseState::Streaming))
                .map(|a| a.id)
                .collect();
            if !ids.is_empty() {
                self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::Disable, &ids));
            }
        }
        self.callbacks.status_report(group.group_id, GroupStreamStatus::Suspending);
    }

    /// Releases every active ASE. The CIG is removed once all of them are released.
    pub fn stop_stream(&mut self, group: &mut LeAudioDeviceGroup, devices: &mut LeAudioDevices) {
        if group.is_releasing_or_idle() {
            info!("group {}: already releasing", group.group_id);
            return;
        }
        info!("group {}: stop stream in {:?}", group.group_id, group.state());
        if !group.have_any_active_device(devices) {
            // Codec configuration cached on the remotes with nothing active.
            for device in group.connected_devices(devices) {
                let ids: Vec<u8> = device
                    .ases
                    .iter()
                    .filter(|a| !matches!(a.state, AseState::Idle | AseState::Releasing))
                    .map(|a| a.id)
                    .collect();
                if !ids.is_empty() {
                    self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::Release, &ids));
                }
            }
            group.set_target_state(AseState::Idle);
            self.finish_release(group, devices);
            return;
        }
        self.set_target_state(group, AseState::Idle);
        let mut released = false;
        for address in group.active_device_addresses(devices) {
            let Some(device) = devices.find_by_address(&address) else {
                continue;
            };
            let ids: Vec<u8> = device
                .active_ases()
                .filter(|a| !matches!(a.state, AseState::Idle | AseState::Releasing))
                .map(|a| a.id)
                .collect();
            if !ids.is_empty() {
                self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::Release, &ids));
                released = true;
            }
        }
        if !released {
            self.finish_release(group, devices);
            return;
        }
        self.callbacks.status_report(group.group_id, GroupStreamStatus::Releasing);
    }

    /// Gives up a stream start the controller failed. The pending streaming request is
    /// cancelled so the release does not restart the stream.
    fn abort_stream(&mut self, group: &mut LeAudioDeviceGroup, devices: &mut LeAudioDevices) {
        self.callbacks.cancel_streaming_request(group.group_id);
        self.stop_stream(group, devices);
    }

    /// Joins a device to the group's running stream.
    pub fn attach_to_stream(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
    ) -> bool {
        if group.state() != AseState::Streaming || group.target_state() != AseState::Streaming {
            warn!("group {}: not streaming, {} not attached", group.group_id, address);
            return false;
        }
        if !group.attach_device(&address, devices) {
            return false;
        }
        info!("group {}: attaching {}", group.group_id, address);
        match devices.find_by_address(&address) {
            Some(device) => self.send_codec_config_to_device(device),
            None => false,
        }
    }

    fn update_metadata(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
    ) {
        if !group.is_metadata_changed(metadata_contexts, &ccids, devices) {
            return;
        }
        info!("group {}: metadata {:?}", group.group_id, metadata_contexts);
        for address in group.active_device_addresses(devices) {
            let Some(device) = devices.find_by_address_mut(&address) else {
                continue;
            };
            let mut requests = Vec::new();
            for ase in device.active_ases_mut() {
                ase.metadata = StreamMetadata {
                    contexts: metadata_contexts.get(ase.direction),
                    ccids: ccids.clone(),
                };
                requests.push(MetadataRequest { ase_id: ase.id, metadata: ase.metadata.clone() });
            }
            self.write_ctp(device, ascs::prepare_update_metadata(requests));
        }
        group.metadata_contexts = metadata_contexts;
        group.ccids = ccids;
    }

    fn send_codec_config_to_device(&self, device: &LeAudioDevice) -> bool {
        let requests: Vec<CodecConfigRequest> = device
            .active_ases()
            .map(|ase| CodecConfigRequest {
                ase_id: ase.id,
                target_latency: ase.target_latency,
                target_phy: TARGET_PHY_2M,
                codec_id: ase.codec_id,
                codec_config: ase.codec_config,
            })
            .collect();
        if requests.is_empty() {
            return false;
        }
        self.write_ctp(device, ascs::prepare_codec_config(requests));
        true
    }

    fn send_codec_config_to_group(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &LeAudioDevices,
    ) -> bool {
        let mut sent = false;
        for device in group.active_devices(devices) {
            sent |= self.send_codec_config_to_device(device);
        }
        if !sent {
            error!("group {}: no active ASE to configure", group.group_id);
            let state = group.state();
            self.set_target_state(group, state);
        }
        sent
    }

    fn send_qos_to_device(
        &self,
        group: &LeAudioDeviceGroup,
        devices: &LeAudioDevices,
        device: &LeAudioDevice,
    ) {
        let requests: Vec<QosConfigRequest> = device
            .active_ases()
            .map(|ase| QosConfigRequest {
                ase_id: ase.id,
                qos: crate::types::AseQosConfig {
                    cig_id: group.cig_id,
                    cis_id: ase.cis_id,
                    sdu_interval_us: ase.codec_config.sdu_interval_us(),
                    framing: if ase.qos_preferences.supported_framing == UNFRAMED_NOT_SUPPORTED {
                        FRAMING_FRAMED
                    } else {
                        FRAMING_UNFRAMED
                    },
                    phy: TARGET_PHY_2M,
                    max_sdu_size: ase.codec_config.max_sdu_size(),
                    retrans_nb: group.retransmission_number(ase.direction),
                    max_transport_latency: group.max_transport_latency(ase.direction),
                    presentation_delay_us: group.presentation_delay(ase.direction, devices),
                },
            })
            .collect();
        if !requests.is_empty() {
            self.write_ctp(device, ascs::prepare_qos_config(requests));
        }
    }

    fn send_qos_to_group(&self, group: &LeAudioDeviceGroup, devices: &LeAudioDevices) {
        for device in group.active_devices(devices) {
            self.send_qos_to_device(group, devices, device);
        }
    }

    fn send_enable_to_device(&self, device: &LeAudioDevice) -> bool {
        let requests: Vec<MetadataRequest> = device
            .active_ases()
            .map(|ase| MetadataRequest { ase_id: ase.id, metadata: ase.metadata.clone() })
            .collect();
        if requests.is_empty() {
            return false;
        }
        self.write_ctp(device, ascs::prepare_enable(requests));
        true
    }

    fn send_enable_to_group(&self, group: &LeAudioDeviceGroup, devices: &LeAudioDevices) -> bool {
        let mut sent = false;
        for device in group.active_devices(devices) {
            sent |= self.send_enable_to_device(device);
        }
        sent
    }

    fn create_cig_or_send_qos(&mut self, group: &mut LeAudioDeviceGroup, devices: &LeAudioDevices) {
        match group.cig.state {
            CigState::None => {
                group.cig.state = CigState::Creating;
                let params = group.cig_parameters(devices);
                info!(
                    "group {}: creating CIG {} with {} CISes",
                    group.group_id,
                    params.cig_id,
                    params.cis.len()
                );
                self.iso.create_cig(params);
            }
            CigState::Created => self.send_qos_to_group(group, devices),
            state => debug!("group {}: CIG {:?}, QoS deferred", group.group_id, state),
        }
    }

    fn remove_cig(&self, group: &mut LeAudioDeviceGroup) {
        info!("group {}: removing CIG {}", group.group_id, group.cig_id);
        group.cig.state = CigState::Removing;
        self.iso.remove_cig(group.cig_id, false);
    }

    /// Establishes the assigned CISes of the given devices.
    fn establish_cises(&self, devices: &mut LeAudioDevices, addresses: &[RawAddress]) {
        let mut pairs = Vec::new();
        for address in addresses {
            let Some(device) = devices.find_by_address_mut(address) else {
                continue;
            };
            let acl_handle = device.acl_handle;
            for ase in device.active_ases_mut() {
                if ase.data_path_state != DataPathState::CisAssigned {
                    continue;
                }
                ase.data_path_state = DataPathState::CisPending;
                if !pairs.iter().any(|(hdl, _)| *hdl == ase.cis_conn_hdl) {
                    pairs.push((ase.cis_conn_hdl, acl_handle));
                }
            }
        }
        if pairs.is_empty() {
            warn!("No CIS to establish for {:?}", addresses);
            return;
        }
        info!("Establishing CISes {:04x?}", pairs);
        self.iso.establish_cis(pairs);
    }

    /// Tears down the CIS carrying the ASE, once for a bidirectional CIS.
    fn disconnect_cis(&self, device: &mut LeAudioDevice, cis_conn_hdl: u16) {
        if cis_conn_hdl == CIS_CONN_HANDLE_INVALID {
            return;
        }
        let mut connected = false;
        for ase in device.ases.iter_mut().filter(|a| a.active && a.cis_conn_hdl == cis_conn_hdl) {
            match ase.data_path_state {
                DataPathState::DataPathEstablished => {
                    self.iso.remove_iso_data_path(cis_conn_hdl, ase.direction.into());
                    connected = true;
                }
                DataPathState::CisEstablished => connected = true,
                _ => continue,
            }
            ase.data_path_state = DataPathState::CisDisconnecting;
        }
        if connected {
            info!("{}: disconnecting CIS {:#06x}", device.address, cis_conn_hdl);
            self.iso.disconnect_cis(cis_conn_hdl, HCI_ERR_PEER_USER);
        }
    }

    fn disconnect_device_cises(&self, devices: &mut LeAudioDevices, address: &RawAddress) {
        let Some(device) = devices.find_by_address_mut(address) else {
            return;
        };
        for hdl in device.cis_conn_handles() {
            self.disconnect_cis(device, hdl);
        }
    }

    /// Sets up the next missing data path of the CIS, sink first.
    fn setup_next_data_path(&self, device: &LeAudioDevice, cis_conn_hdl: u16) -> bool {
        let Some(ase) = device.active_ases().find(|a| {
            a.cis_conn_hdl == cis_conn_hdl && a.data_path_state == DataPathState::CisEstablished
        }) else {
            return false;
        };
        let codec_config = match self.codec_location {
            CodecLocation::Adsp => ase.codec_config.to_ltv().to_bytes(),
            CodecLocation::Host => Vec::new(),
        };
        debug!("{}: data path {:?} on CIS {:#06x}", device.address, ase.direction, cis_conn_hdl);
        self.iso.setup_iso_data_path(
            cis_conn_hdl,
            DataPathParameters {
                direction: ase.direction,
                codec_id: ase.codec_id,
                codec_location: self.codec_location,
                controller_delay_us: 0,
                codec_config,
            },
        );
        true
    }

    fn update_cis_configuration(
        &self,
        group: &mut LeAudioDeviceGroup,
        devices: &LeAudioDevices,
    ) {
        group.update_stream_configuration(devices);
        for direction in Direction::BOTH {
            self.callbacks.on_update_cis_configuration(group.group_id, direction);
        }
    }

    /// Completes a release once every active ASE is released with its CIS down. The CIG is
    /// removed, the released status is reported after that.
    fn finish_release(&mut self, group: &mut LeAudioDeviceGroup, devices: &mut LeAudioDevices) {
        let cached = group
            .active_devices(devices)
            .flat_map(|d| d.active_ases())
            .any(|a| a.state == AseState::CodecConfigured);
        group.deactivate(devices);
        let state = if cached { AseState::CodecConfigured } else { AseState::Idle };
        group.set_state(state);
        group.set_target_state(state);
        self.cancel_watchdog(group.group_id);
        match group.cig.state {
            CigState::Created => self.remove_cig(group),
            CigState::None => {
                group.cig_clear_cis();
                self.report_released(group);
            }
            CigState::Creating | CigState::Removing => {}
        }
    }

    fn report_released(&self, group: &LeAudioDeviceGroup) {
        let status = if group.state() == AseState::CodecConfigured {
            GroupStreamStatus::ConfiguredAutonomous
        } else {
            GroupStreamStatus::Idle
        };
        self.callbacks.status_report(group.group_id, status);
    }

    fn check_release_progress(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
    ) {
        let Some(device) = devices.find_by_address(&address) else {
            return;
        };
        if !device.have_active_ase() || !device_released(device) {
            return;
        }
        if group.target_state() != AseState::Idle {
            let others = group.active_devices(devices).any(|d| d.address != address);
            if others {
                info!("{}: released on its own, group {} keeps going", address, group.group_id);
                if let Some(device) = devices.find_by_address_mut(&address) {
                    device.deactivate_all_ases();
                }
                group.cig_unassign_cis(&address);
                if group.state() == AseState::Streaming {
                    self.update_cis_configuration(group, devices);
                }
                return;
            }
            info!("group {}: released on its own", group.group_id);
            self.finish_release(group, devices);
            return;
        }
        if group.active_devices(devices).all(device_released) {
            self.finish_release(group, devices);
        }
    }

    fn check_suspended(&mut self, group: &mut LeAudioDeviceGroup, devices: &LeAudioDevices) {
        if group.target_state() != AseState::QosConfigured
            || !group.have_all_active_devices_ases_the_same_state(AseState::QosConfigured, devices)
            || !group.have_all_cises_disconnected(devices)
        {
            return;
        }
        self.reach_state(group, AseState::QosConfigured);
        self.callbacks.status_report(group.group_id, GroupStreamStatus::Suspended);
    }

    fn check_streaming(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &LeAudioDevices,
        address: RawAddress,
    ) {
        if group.target_state() != AseState::Streaming {
            return;
        }
        if group.state() == AseState::Streaming {
            let joined = devices.find_by_address(&address).map_or(false, |d| {
                d.have_all_active_ases_same_state(AseState::Streaming)
                    && d.have_all_data_paths_established()
            });
            if joined {
                info!("group {}: {} joined the stream", group.group_id, address);
                self.update_cis_configuration(group, devices);
            }
            return;
        }
        if !group.is_group_stream_ready(devices) {
            return;
        }
        self.reach_state(group, AseState::Streaming);
        group.update_stream_configuration(devices);
        self.callbacks.status_report(group.group_id, GroupStreamStatus::Streaming);
    }

    /// Applies an ASE characteristic value of a device of the group.
    pub fn process_ase_status(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
        ase_index: usize,
        status: AseStatus,
    ) {
        let Some(device) = devices.find_by_address_mut(&address) else {
            return;
        };
        let Some(ase) = device.ases.get_mut(ase_index) else {
            warn!("{}: no ASE at {}", address, ase_index);
            return;
        };
        let prev = ase.state;
        ase.id = status.ase_id;
        ase.state = status.state;
        match status.params {
            AseStatusParams::CodecConfigured { qos_preferences, codec_id, codec_config } => {
                ase.qos_preferences = qos_preferences;
                ase.codec_id = codec_id;
                if let Some(codec_config) = codec_config {
                    ase.codec_config = codec_config;
                }
            }
            AseStatusParams::QosConfigured(qos) => ase.qos_config = qos,
            AseStatusParams::Transient { metadata, .. } => ase.metadata = metadata,
            AseStatusParams::None => {}
        }
        if status.state == AseState::Idle {
            ase.configured_for_context_type = None;
        }
        let active = ase.active;
        let (ase_id, direction, cis_conn_hdl) = (ase.id, ase.direction, ase.cis_conn_hdl);
        info!(
            "{}: ase {} {:?} {:?} -> {:?}{}",
            address,
            ase_id,
            direction,
            prev,
            status.state,
            if active { "" } else { " (inactive)" }
        );
        if !active {
            return;
        }

        match status.state {
            AseState::Idle => self.check_release_progress(group, devices, address),
            AseState::CodecConfigured => {
                self.on_ase_codec_configured(group, devices, address, ase_id, prev)
            }
            AseState::QosConfigured => self.on_ase_qos_configured(group, devices, address, prev),
            AseState::Enabling => self.on_ase_enabling(group, devices, address),
            AseState::Streaming => self.check_streaming(group, devices, address),
            AseState::Disabling => {
                if direction == Direction::Source {
                    if let Some(device) = devices.find_by_address(&address) {
                        self.write_ctp(
                            device,
                            ascs::prepare_ase_ids(CtpOpcode::ReceiverStopReady, &[ase_id]),
                        );
                    }
                }
                if group.have_all_active_devices_ases_in(
                    &[AseState::Disabling, AseState::QosConfigured],
                    devices,
                ) {
                    group.set_state(AseState::Disabling);
                }
            }
            AseState::Releasing => {
                if let Some(device) = devices.find_by_address_mut(&address) {
                    self.disconnect_cis(device, cis_conn_hdl);
                }
                let releasing = group.have_all_active_devices_ases_in(
                    &[AseState::Releasing, AseState::Idle, AseState::CodecConfigured],
                    devices,
                );
                if !releasing {
                    return;
                }
                if group.target_state() != AseState::Idle {
                    warn!("group {}: released by the remote", group.group_id);
                    self.set_target_state(group, AseState::Idle);
                    self.callbacks.status_report(group.group_id, GroupStreamStatus::Releasing);
                }
                group.set_state(AseState::Releasing);
            }
        }
    }

    fn on_ase_codec_configured(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
        ase_id: u8,
        prev: AseState,
    ) {
        if prev == AseState::Releasing {
            // Released, the remote keeps the codec configuration cached.
            self.check_release_progress(group, devices, address);
            return;
        }
        match group.target_state() {
            AseState::Idle => {
                if let Some(device) = devices.find_by_address(&address) {
                    self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::Release, &[ase_id]));
                }
            }
            AseState::Streaming if group.state() == AseState::Streaming => {
                let Some(device) = devices.find_by_address(&address) else {
                    return;
                };
                if device.have_all_active_ases_same_state(AseState::CodecConfigured)
                    && group.cig.state == CigState::Created
                {
                    self.send_qos_to_device(group, devices, device);
                }
            }
            target => {
                if !group.have_all_active_devices_ases_the_same_state(
                    AseState::CodecConfigured,
                    devices,
                ) {
                    return;
                }
                self.reach_state(group, AseState::CodecConfigured);
                match target {
                    AseState::CodecConfigured => self
                        .callbacks
                        .status_report(group.group_id, GroupStreamStatus::ConfiguredByUser),
                    AseState::Streaming => self.create_cig_or_send_qos(group, devices),
                    _ => warn!("group {}: codec configured, target {:?}", group.group_id, target),
                }
            }
        }
    }

    fn on_ase_qos_configured(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
        prev: AseState,
    ) {
        match prev {
            AseState::CodecConfigured | AseState::QosConfigured => {
                if group.target_state() != AseState::Streaming {
                    warn!("group {}: QoS configured, target {:?}", group.group_id, group.target_state());
                    return;
                }
                if group.state() == AseState::Streaming {
                    if let Some(device) = devices.find_by_address(&address) {
                        if device.have_all_active_ases_same_state(AseState::QosConfigured) {
                            self.send_enable_to_device(device);
                        }
                    }
                    return;
                }
                if !group.have_all_active_devices_ases_the_same_state(
                    AseState::QosConfigured,
                    devices,
                ) {
                    return;
                }
                self.reach_state(group, AseState::QosConfigured);
                self.send_enable_to_group(group, devices);
            }
            AseState::Enabling | AseState::Streaming | AseState::Disabling => {
                let device_disabled = devices
                    .find_by_address(&address)
                    .map_or(false, |d| d.have_all_active_ases_same_state(AseState::QosConfigured));
                if device_disabled {
                    self.disconnect_device_cises(devices, &address);
                }
                if group.target_state() == AseState::Streaming
                    && group.have_all_active_devices_ases_the_same_state(
                        AseState::QosConfigured,
                        devices,
                    )
                {
                    warn!("group {}: disabled by the remote", group.group_id);
                    self.set_target_state(group, AseState::QosConfigured);
                    self.callbacks.status_report(group.group_id, GroupStreamStatus::Suspending);
                }
                self.check_suspended(group, devices);
            }
            _ => warn!("{}: unexpected QoS configured from {:?}", address, prev),
        }
    }

    fn on_ase_enabling(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
    ) {
        if group.target_state() != AseState::Streaming {
            return;
        }
        if group.state() == AseState::Streaming {
            let ready = devices.find_by_address(&address).map_or(false, |d| d.is_ready_to_create_stream());
            if ready {
                self.establish_cises(devices, &[address]);
            }
            return;
        }
        if !group.have_all_active_devices_ases_the_same_state(AseState::Enabling, devices) {
            return;
        }
        group.set_state(AseState::Enabling);
        let addresses = group.active_device_addresses(devices);
        self.establish_cises(devices, &addresses);
    }

    /// Handles a control point notification of a device of the group.
    pub fn process_ctp_notification(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        address: RawAddress,
        notification: &CtpNotification,
    ) {
        for entry in &notification.entries {
            if entry.response_code == CtpResponseCode::Success {
                continue;
            }
            error!(
                "{}: opcode {:#04x} rejected for ase {}: {:?}, reason {:#04x}",
                address, notification.opcode, entry.ase_id, entry.response_code, entry.reason
            );
            if entry.response_code == CtpResponseCode::InvalidConfigurationParameterValue
                && entry.reason == CTP_REASON_INVALID_ASE_CIS_MAPPING
            {
                self.callbacks.cancel_streaming_request(group.group_id);
            }
        }
    }

    pub fn process_cig_created(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        status: u8,
        conn_handles: &[u16],
    ) {
        if group.cig.state != CigState::Creating {
            warn!("group {}: unexpected CIG created in {:?}", group.group_id, group.cig.state);
        }
        if status != 0 {
            error!("group {}: CIG creation failed {:#04x}", group.group_id, status);
            group.cig.state = CigState::None;
            self.abort_stream(group, devices);
            return;
        }
        group.cig.state = CigState::Created;
        group.cig_assign_cis_conn_handles(conn_handles);
        for address in group.active_device_addresses(devices) {
            if let Some(device) = devices.find_by_address_mut(&address) {
                group.cig_assign_cis_conn_handles_to_ases(device);
            }
        }
        info!("group {}: CIG created, handles {:04x?}", group.group_id, conn_handles);
        if group.target_state() != AseState::Streaming {
            if !group.is_in_transition() {
                self.remove_cig(group);
            }
            return;
        }
        if group.have_all_active_devices_ases_the_same_state(AseState::CodecConfigured, devices) {
            self.send_qos_to_group(group, devices);
        }
    }

    pub fn process_cig_removed(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        status: u8,
    ) {
        if status != 0 {
            error!("group {}: CIG removal failed {:#04x}", group.group_id, status);
        }
        info!("group {}: CIG removed", group.group_id);
        group.cig.state = CigState::None;
        group.cig_clear_cis();
        for address in group.addresses().to_vec() {
            if let Some(device) = devices.find_by_address_mut(&address) {
                for ase in device.ases.iter_mut() {
                    ase.cis_conn_hdl = CIS_CONN_HANDLE_INVALID;
                }
            }
        }
        if !group.is_in_transition() {
            self.report_released(group);
        }
    }

    fn device_by_cis_conn_hdl(
        group: &LeAudioDeviceGroup,
        devices: &LeAudioDevices,
        cis_conn_hdl: u16,
    ) -> Option<RawAddress> {
        group
            .devices(devices)
            .find(|d| d.ases.iter().any(|a| a.active && a.cis_conn_hdl == cis_conn_hdl))
            .map(|d| d.address)
    }

    pub fn process_cis_established(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        event: &CisEstablishedEvent,
    ) {
        let Some(address) = Self::device_by_cis_conn_hdl(group, devices, event.cis_conn_hdl) else {
            warn!("group {}: CIS {:#06x} has no ASE", group.group_id, event.cis_conn_hdl);
            return;
        };
        let Some(device) = devices.find_by_address_mut(&address) else {
            return;
        };
        let next = if event.status == 0 {
            DataPathState::CisEstablished
        } else {
            DataPathState::CisAssigned
        };
        for ase in device.active_ases_mut().filter(|a| a.cis_conn_hdl == event.cis_conn_hdl) {
            ase.data_path_state = next;
        }
        if event.status != 0 {
            error!("{}: CIS {:#06x} failed {:#04x}", address, event.cis_conn_hdl, event.status);
            if group.state() == AseState::Streaming {
                let ids: Vec<u8> = device.active_ases().map(|a| a.id).collect();
                self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::Release, &ids));
            } else {
                self.abort_stream(group, devices);
            }
            return;
        }
        info!("{}: CIS {:#06x} established", address, event.cis_conn_hdl);
        group.transport_latency_c_to_p_us = event.transport_latency_c_to_p_us;
        group.transport_latency_p_to_c_us = event.transport_latency_p_to_c_us;
        if group.target_state() != AseState::Streaming {
            self.disconnect_cis(device, event.cis_conn_hdl);
            return;
        }
        self.setup_next_data_path(device, event.cis_conn_hdl);
    }

    pub fn process_cis_disconnected(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        cis_conn_hdl: u16,
        reason: u8,
    ) {
        let Some(address) = Self::device_by_cis_conn_hdl(group, devices, cis_conn_hdl) else {
            debug!("group {}: CIS {:#06x} not in use", group.group_id, cis_conn_hdl);
            return;
        };
        info!("{}: CIS {:#06x} disconnected, reason {:#04x}", address, cis_conn_hdl, reason);
        if let Some(device) = devices.find_by_address_mut(&address) {
            for ase in device.active_ases_mut().filter(|a| a.cis_conn_hdl == cis_conn_hdl) {
                ase.data_path_state = DataPathState::CisAssigned;
            }
        }
        match group.target_state() {
            AseState::Idle => self.check_release_progress(group, devices, address),
            AseState::QosConfigured => self.check_suspended(group, devices),
            AseState::Streaming => {
                if group.state() == AseState::Streaming {
                    self.update_cis_configuration(group, devices);
                }
                self.check_release_progress(group, devices, address);
            }
            _ => {}
        }
    }

    pub fn process_data_path_setup(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        status: u8,
        cis_conn_hdl: u16,
    ) {
        let Some(address) = Self::device_by_cis_conn_hdl(group, devices, cis_conn_hdl) else {
            return;
        };
        if status != 0 {
            error!("{}: data path on {:#06x} failed {:#04x}", address, cis_conn_hdl, status);
            self.abort_stream(group, devices);
            return;
        }
        let Some(device) = devices.find_by_address_mut(&address) else {
            return;
        };
        let Some(ase) = device.active_ases_mut().find(|a| {
            a.cis_conn_hdl == cis_conn_hdl && a.data_path_state == DataPathState::CisEstablished
        }) else {
            warn!("{}: no data path pending on {:#06x}", address, cis_conn_hdl);
            return;
        };
        ase.data_path_state = DataPathState::DataPathEstablished;
        let start_ready = (ase.direction == Direction::Source && ase.state == AseState::Enabling)
            .then_some(ase.id);
        if let Some(ase_id) = start_ready {
            self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::ReceiverStartReady, &[ase_id]));
        }
        if self.setup_next_data_path(device, cis_conn_hdl) {
            return;
        }
        self.check_streaming(group, devices, address);
    }

    pub fn process_data_path_removed(&self, cis_conn_hdl: u16, status: u8) {
        if status != 0 {
            warn!("Data path removal on {:#06x} failed {:#04x}", cis_conn_hdl, status);
        } else {
            debug!("Data path removed on {:#06x}", cis_conn_hdl);
        }
    }

    /// The ACL of a device of the group is gone: its ASEs are back to Idle and the group either
    /// continues without it or is released.
    pub fn process_acl_disconnected(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
    ) {
        let was_active = match devices.find_by_address_mut(&address) {
            Some(device) => {
                let active = device.have_active_ase();
                device.reset_ases();
                active
            }
            None => false,
        };
        group.cig_unassign_cis(&address);
        if !was_active {
            return;
        }
        info!(
            "group {}: {} lost in {:?} -> {:?}",
            group.group_id,
            address,
            group.state(),
            group.target_state()
        );
        if !group.have_any_active_device(devices) {
            self.finish_release(group, devices);
            return;
        }
        match group.target_state() {
            AseState::Streaming if group.state() == AseState::Streaming => {
                self.update_cis_configuration(group, devices)
            }
            AseState::Streaming => self.stop_stream(group, devices),
            AseState::Idle => {
                if group.active_devices(devices).all(device_released) {
                    self.finish_release(group, devices);
                }
            }
            AseState::QosConfigured => self.check_suspended(group, devices),
            AseState::CodecConfigured => {
                if group.have_all_active_devices_ases_the_same_state(
                    AseState::CodecConfigured,
                    devices,
                ) {
                    self.reach_state(group, AseState::CodecConfigured);
                    self.callbacks
                        .status_report(group.group_id, GroupStreamStatus::ConfiguredByUser);
                }
            }
            _ => {}
        }
    }

    /// Takes a device out of the group's stream while its link stays up. Its CISes are torn
    /// down, its ASEs released, then the group goes on as after a lost link.
    pub fn detach_device(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &mut LeAudioDevices,
        address: RawAddress,
    ) {
        let Some(device) = devices.find_by_address_mut(&address) else {
            return;
        };
        if !device.have_active_ase() {
            return;
        }
        info!("group {}: {} leaves the stream", group.group_id, address);
        for hdl in device.cis_conn_handles() {
            self.disconnect_cis(device, hdl);
        }
        let ids: Vec<u8> = device
            .active_ases()
            .filter(|a| !matches!(a.state, AseState::Idle | AseState::Releasing))
            .map(|a| a.id)
            .collect();
        if !ids.is_empty() {
            self.write_ctp(device, ascs::prepare_ase_ids(CtpOpcode::Release, &ids));
        }
        self.process_acl_disconnected(group, devices, address);
    }

    /// The watchdog of the group fired: the peers are disconnected and the group goes back to
    /// Idle.
    pub fn on_state_transition_timeout(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        devices: &LeAudioDevices,
    ) {
        self.watchdogs.remove(&group.group_id);
        error!(
            "group {}: state transition timeout in {:?} -> {:?}\n{}",
            group.group_id,
            group.state(),
            group.target_state(),
            group.dump(devices)
        );
        for address in group.active_device_addresses(devices) {
            self.gatt.disconnect_acl(address);
        }
        group.set_target_state(AseState::Idle);
        self.callbacks.on_state_transition_timeout(group.group_id);
    }

    /// Drops the watchdog of a removed group.
    pub fn forget_group(&mut self, group_id: i32) {
        self.cancel_watchdog(group_id);
    }
}
