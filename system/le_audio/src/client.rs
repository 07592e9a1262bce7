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


//! LE Audio client: owns the device and group registries, binds one group at a time to the
//! local audio HAL and follows the HAL's resume/suspend requests.

use crate::codec::{LeAudioDecoder, LeAudioEncoder};
use crate::config::LeAudioConfig;
use crate::device::LeAudioDevices;
use crate::error::{Error, Result};
use crate::group::LeAudioDeviceGroups;
use crate::interfaces::{
    AudioHalClient, CisEstablishedEvent, GattInterface, IsoManager, Lc3Factory,
    LeAudioCallbacks, LinkQualityReport, OffloadConfiguration, PcmConfiguration,
    ServiceSearchResult, StateMachineCallbacks,
};
use crate::set_configurations::{choose_configuration_context_type, AudioSetConfigurationProvider};
use crate::state_machine::LeAudioGroupStateMachine;
use crate::timer::Alarm;
use crate::types::{
    AseState, AudioContexts, BidirectionalContexts, CigState, CodecLocation, ConnectionState,
    DeviceConnectState, Direction, GroupNodeStatus, GroupStatus, GroupStreamStatus,
    LeAudioContextType, RawAddress, CONN_ID_INVALID, GROUP_UNKNOWN,
};
use crate::utils::{bytes_to_samples, samples_to_bytes};
use crate::wire::{ascs, pacs};
use crate::Message;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

const CCC_NOTIFY: [u8; 2] = [0x01, 0x00];
const BITS_PER_SAMPLE: u8 = 16;
const DEFAULT_DATA_INTERVAL_US: u32 = 10000;
const DEFAULT_SINK_SAMPLE_RATE_HZ: u32 = 48000;
const DEFAULT_SOURCE_SAMPLE_RATE_HZ: u32 = 16000;

/// Local audio HAL session state of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    Idle,
    /// Resume requested, waiting for the group to stream.
    ReadyToStart,
    Started,
    /// Suspended by the HAL, the group keeps streaming until the keep-alive timer expires.
    ReadyToRelease,
    Releasing,
}

/// Collaborators of the client.
#[derive(Clone)]
pub struct LeAudioInterfaces {
    pub gatt: Rc<dyn GattInterface>,
    pub iso: Rc<dyn IsoManager>,
    pub callbacks: Rc<dyn LeAudioCallbacks>,
    /// Local audio source session, its audio goes to the remote sinks.
    pub sink_hal: Rc<dyn AudioHalClient>,
    /// Local audio sink session, fed by the remote sources.
    pub source_hal: Rc<dyn AudioHalClient>,
    pub lc3: Rc<dyn Lc3Factory>,
}

/// Posts the state machine reports to the client queue.
struct StateMachineReports {
    tx: UnboundedSender<Message>,
}

impl StateMachineCallbacks for StateMachineReports {
    fn status_report(&self, group_id: i32, status: GroupStreamStatus) {
        let _ = self.tx.send(Message::StatusReport { group_id, status });
    }

    fn on_state_transition_timeout(&self, group_id: i32) {
        let _ = self.tx.send(Message::StateTransitionTimedOut(group_id));
    }

    fn on_update_cis_configuration(&self, group_id: i32, direction: Direction) {
        let _ = self.tx.send(Message::UpdateCisConfiguration { group_id, direction });
    }

    fn cancel_streaming_request(&self, group_id: i32) {
        let _ = self.tx.send(Message::CancelStreamingRequest(group_id));
    }
}

pub struct LeAudioClient {
    config: LeAudioConfig,
    interfaces: LeAudioInterfaces,
    provider: Box<dyn AudioSetConfigurationProvider>,
    devices: LeAudioDevices,
    groups: LeAudioDeviceGroups,
    state_machine: LeAudioGroupStateMachine,
    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,

    active_group_id: i32,
    configuration_context_type: LeAudioContextType,
    /// Contexts of the local metadata, sink for the playback side, source for capture.
    local_metadata_contexts: BidirectionalContexts,
    in_call: bool,
    ccids: HashMap<LeAudioContextType, u8>,

    /// Local source, audio sent to the remote sinks.
    sender_state: AudioState,
    /// Local sink, audio received from the remote sources.
    receiver_state: AudioState,
    suspend_timeout: Alarm,
    encoder: Option<LeAudioEncoder>,
    decoder: Option<LeAudioDecoder>,
}

impl LeAudioClient {
    pub fn new(
        config: LeAudioConfig,
        interfaces: LeAudioInterfaces,
        provider: Box<dyn AudioSetConfigurationProvider>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state_machine = LeAudioGroupStateMachine::new(
            interfaces.gatt.clone(),
            interfaces.iso.clone(),
            Rc::new(StateMachineReports { tx: tx.clone() }),
            tx.clone(),
            &config,
        );
        Self {
            config,
            interfaces,
            provider,
            devices: LeAudioDevices::default(),
            groups: LeAudioDeviceGroups::default(),
            state_machine,
            tx,
            rx,
            active_group_id: GROUP_UNKNOWN,
            configuration_context_type: LeAudioContextType::Media,
            local_metadata_contexts: BidirectionalContexts::default(),
            in_call: false,
            ccids: HashMap::new(),
            sender_state: AudioState::Idle,
            receiver_state: AudioState::Idle,
            suspend_timeout: Alarm::new(),
            encoder: None,
            decoder: None,
        }
    }

    pub fn devices(&self) -> &LeAudioDevices {
        &self.devices
    }

    pub fn groups(&self) -> &LeAudioDeviceGroups {
        &self.groups
    }

    pub fn state_machine(&self) -> &LeAudioGroupStateMachine {
        &self.state_machine
    }

    pub fn active_group_id(&self) -> i32 {
        self.active_group_id
    }

    pub fn configuration_context_type(&self) -> LeAudioContextType {
        self.configuration_context_type
    }

    pub fn sender_state(&self) -> AudioState {
        self.sender_state
    }

    pub fn receiver_state(&self) -> AudioState {
        self.receiver_state
    }

    pub fn dump_group(&self, group_id: i32) -> Option<String> {
        self.groups.find_by_id(group_id).map(|g| g.dump(&self.devices))
    }

    /// Handles the queued messages.
    pub fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.handle_message(msg);
        }
    }

    /// Handles messages as they come, timers included. Runs until the task is dropped.
    pub async fn run(&mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle_message(msg);
            self.drain();
        }
    }

    fn handle_message(&mut self, msg: Message) {
        debug!("Handling {:?}", msg);
        match msg {
            Message::StateTransitionTimeout(group_id) => {
                if let Some(group) = self.groups.find_by_id_mut(group_id) {
                    self.state_machine.on_state_transition_timeout(group, &self.devices);
                }
            }
            Message::StateTransitionTimedOut(group_id) => {
                if group_id == self.active_group_id {
                    self.reset_local_audio();
                }
            }
            Message::StatusReport { group_id, status } => self.on_status_report(group_id, status),
            Message::UpdateCisConfiguration { group_id, direction } => {
                self.on_update_cis_configuration(group_id, direction)
            }
            Message::CancelStreamingRequest(group_id) => {
                if group_id == self.active_group_id {
                    self.cancel_pending_requests();
                }
            }
            Message::SuspendTimeout(group_id) => self.on_suspend_timeout(group_id),
        }
    }

    // Connection lifecycle

    pub fn connect(&mut self, address: RawAddress) {
        match self.devices.find_by_address_mut(&address) {
            Some(device) => {
                if device.connection_state != DeviceConnectState::Disconnected {
                    warn!("{}: connect while {:?}", address, device.connection_state);
                    return;
                }
                device.connection_state = DeviceConnectState::ConnectingByUser;
            }
            None => {
                if let Err(e) =
                    self.devices.add(address, DeviceConnectState::ConnectingByUser, GROUP_UNKNOWN)
                {
                    error!("{}", e);
                    return;
                }
            }
        }
        info!("{}: connecting", address);
        self.interfaces.gatt.open(address, true);
        self.interfaces.callbacks.on_connection_state(ConnectionState::Connecting, address);
    }

    /// Adds a device known from a previous session, with its group.
    pub fn add_from_storage(
        &mut self,
        address: RawAddress,
        group_id: i32,
        autoconnect: bool,
    ) -> Result<()> {
        self.devices.add(address, DeviceConnectState::Disconnected, GROUP_UNKNOWN)?;
        if group_id != GROUP_UNKNOWN {
            self.group_add_node(group_id, address)?;
        }
        if autoconnect {
            let device =
                self.devices.find_by_address_mut(&address).ok_or(Error::UnknownDevice(address))?;
            device.autoconnect = true;
            device.connection_state = DeviceConnectState::ConnectingAutoconnect;
            self.interfaces.gatt.open(address, false);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, address: RawAddress) {
        self.disconnect_device(address, DeviceConnectState::Disconnecting);
        self.drain();
    }

    /// Forgets the device. A connected device is disconnected first and removed once the link
    /// is gone.
    pub fn remove_device(&mut self, address: RawAddress) -> Result<()> {
        let device = self.devices.find_by_address(&address).ok_or(Error::UnknownDevice(address))?;
        match device.connection_state {
            DeviceConnectState::ConnectedGettingReady
            | DeviceConnectState::Connected
            | DeviceConnectState::Disconnecting => {
                info!("{}: removal pending on disconnection", address);
                self.disconnect_device(address, DeviceConnectState::PendingRemoval);
            }
            state => {
                if matches!(
                    state,
                    DeviceConnectState::ConnectingByUser | DeviceConnectState::ConnectingAutoconnect
                ) {
                    self.interfaces.gatt.cancel_open(address);
                }
                self.forget_device(address);
            }
        }
        self.drain();
        Ok(())
    }

    fn disconnect_device(&mut self, address: RawAddress, next_state: DeviceConnectState) {
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            warn!("{}: unknown device", address);
            return;
        };
        device.autoconnect = false;
        match device.connection_state {
            DeviceConnectState::ConnectingByUser | DeviceConnectState::ConnectingAutoconnect => {
                self.interfaces.gatt.cancel_open(address);
                device.connection_state = DeviceConnectState::Disconnected;
                self.interfaces.callbacks.on_connection_state(ConnectionState::Disconnected, address);
            }
            DeviceConnectState::ConnectedGettingReady | DeviceConnectState::Connected => {
                let (conn_id, group_id) = (device.conn_id, device.group_id);
                device.connection_state = next_state;
                self.interfaces.callbacks.on_connection_state(ConnectionState::Disconnecting, address);
                let streaming = device.have_active_ase();
                let others_active = self.groups.find_by_id(group_id).map_or(false, |g| {
                    g.active_devices(&self.devices).any(|d| d.address != address)
                });
                if streaming && !others_active {
                    // The last streaming device releases its ASEs before the link goes down.
                    if let Some(device) = self.devices.find_by_address_mut(&address) {
                        device.closing_stream_for_disconnection = true;
                    }
                    if let Some(group) = self.groups.find_by_id_mut(group_id) {
                        self.state_machine.stop_stream(group, &mut self.devices);
                    }
                } else {
                    info!("{}: closing connection {:#06x}", address, conn_id);
                    self.interfaces.gatt.close(conn_id);
                }
            }
            DeviceConnectState::Disconnecting => device.connection_state = next_state,
            state => debug!("{}: nothing to disconnect in {:?}", address, state),
        }
    }

    fn forget_device(&mut self, address: RawAddress) {
        let group_id = self.devices.find_by_address(&address).map_or(GROUP_UNKNOWN, |d| d.group_id);
        if group_id != GROUP_UNKNOWN {
            if let Err(e) = self.group_remove_node(group_id, address) {
                warn!("{}: {}", address, e);
            }
        }
        info!("{}: removed", address);
        self.devices.remove(&address);
    }

    pub fn on_gatt_connected(
        &mut self,
        address: RawAddress,
        status: u8,
        conn_id: u16,
        mtu: u16,
        acl_handle: u16,
    ) {
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            warn!("{}: connected but unknown", address);
            return;
        };
        if status != 0 {
            warn!("{}: connection failed {:#04x}", address, status);
            let by_user = device.connection_state == DeviceConnectState::ConnectingByUser;
            if device.autoconnect {
                device.connection_state = DeviceConnectState::ConnectingAutoconnect;
                self.interfaces.gatt.open(address, false);
            } else {
                device.connection_state = DeviceConnectState::Disconnected;
            }
            if by_user {
                self.interfaces.callbacks.on_connection_state(ConnectionState::Disconnected, address);
            }
            return;
        }
        info!("{}: connected, conn_id {:#06x} mtu {}", address, conn_id, mtu);
        device.conn_id = conn_id;
        device.mtu = mtu;
        device.acl_handle = acl_handle;
        device.connection_state = DeviceConnectState::ConnectedGettingReady;
        self.interfaces.gatt.discover_services(conn_id);
    }

    pub fn on_encryption_complete(&mut self, address: RawAddress, success: bool) {
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            return;
        };
        device.encrypted = success;
        if !success {
            error!("{}: encryption failed", address);
            self.disconnect_device(address, DeviceConnectState::Disconnecting);
            self.drain();
        }
    }

    pub fn on_service_search_complete(&mut self, conn_id: u16, result: ServiceSearchResult) {
        let Some(address) = self.devices.find_by_conn_id(conn_id).map(|d| d.address) else {
            return;
        };
        let handles = match result {
            ServiceSearchResult::Found(handles) => handles,
            ServiceSearchResult::NotFound => {
                warn!("{}: no audio stream control service", address);
                self.disconnect_device(address, DeviceConnectState::Disconnecting);
                self.drain();
                return;
            }
            ServiceSearchResult::Failed => {
                error!("{}: service search failed", address);
                self.disconnect_device(address, DeviceConnectState::Disconnecting);
                self.drain();
                return;
            }
        };
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            return;
        };
        device.set_handles(handles);
        for handles in device.handles.notifiable() {
            self.interfaces.gatt.write_descriptor(conn_id, handles.ccc_hdl, CCC_NOTIFY.to_vec());
        }
        let readable = device.handles.readable();
        device.pending_reads = readable.iter().map(|h| h.val_hdl).collect();
        debug!("{}: reading {} characteristics", address, readable.len());
        for handles in &readable {
            self.interfaces.gatt.read_characteristic(conn_id, handles.val_hdl);
        }
        if readable.is_empty() {
            self.on_device_ready(address);
        }
        self.drain();
    }

    pub fn on_gatt_read_response(&mut self, conn_id: u16, status: u8, handle: u16, value: &[u8]) {
        let Some(address) = self.devices.find_by_conn_id(conn_id).map(|d| d.address) else {
            return;
        };
        if status != 0 {
            error!("{}: read of {:#06x} failed {:#04x}", address, handle, status);
            self.disconnect_device(address, DeviceConnectState::Disconnecting);
            self.drain();
            return;
        }
        if let Err(e) = self.process_characteristic_value(address, handle, value) {
            error!("{}: {}", address, e);
        }
        let ready = match self.devices.find_by_address_mut(&address) {
            Some(device) => {
                device.pending_reads.remove(&handle);
                device.pending_reads.is_empty()
                    && device.connection_state == DeviceConnectState::ConnectedGettingReady
            }
            None => false,
        };
        if ready {
            self.on_device_ready(address);
        }
        self.drain();
    }

    pub fn on_gatt_notification(&mut self, conn_id: u16, handle: u16, value: &[u8]) {
        let Some(address) = self.devices.find_by_conn_id(conn_id).map(|d| d.address) else {
            debug!("Notification on unknown connection {:#06x}", conn_id);
            return;
        };
        if let Err(e) = self.process_characteristic_value(address, handle, value) {
            error!("{}: {}", address, e);
        }
        self.drain();
    }

    pub fn on_gatt_disconnected(&mut self, conn_id: u16, reason: u8) {
        let Some(device) = self.devices.iter_mut().find(|d| d.conn_id == conn_id) else {
            return;
        };
        let address = device.address;
        info!("{}: disconnected, reason {:#04x}", address, reason);
        self.interfaces.gatt.clean_pending(conn_id);
        device.conn_id = CONN_ID_INVALID;
        device.closing_stream_for_disconnection = false;
        device.pending_reads.clear();
        let pending_removal = device.connection_state == DeviceConnectState::PendingRemoval;
        let reconnect = device.autoconnect && !pending_removal;
        device.connection_state = if reconnect {
            DeviceConnectState::ConnectingAutoconnect
        } else {
            DeviceConnectState::Disconnected
        };
        let group_id = device.group_id;

        if let Some(group) = self.groups.find_by_id_mut(group_id) {
            self.state_machine.process_acl_disconnected(group, &mut self.devices, address);
        }
        self.interfaces.callbacks.on_connection_state(ConnectionState::Disconnected, address);
        if pending_removal {
            self.forget_device(address);
        } else {
            if reconnect {
                self.interfaces.gatt.open(address, false);
            }
            if group_id != GROUP_UNKNOWN {
                self.update_audio_conf(group_id);
            }
        }
        self.drain();
    }

    fn on_device_ready(&mut self, address: RawAddress) {
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            return;
        };
        device.connection_state = DeviceConnectState::Connected;
        let group_id = device.group_id;
        info!("{}: ready", address);
        self.interfaces.callbacks.on_connection_state(ConnectionState::Connected, address);
        if group_id == GROUP_UNKNOWN {
            return;
        }
        self.update_audio_conf(group_id);
        if group_id == self.active_group_id {
            self.attach_or_reconfigure(group_id, address);
        }
    }

    /// Joins a device to the running stream of its group. A device unable to use the codec
    /// configuration of the stream makes the whole group reconfigure.
    fn attach_or_reconfigure(&mut self, group_id: i32, address: RawAddress) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return;
        };
        if group.state() != AseState::Streaming || group.target_state() != AseState::Streaming {
            return;
        }
        if self.state_machine.attach_to_stream(group, &mut self.devices, address) {
            return;
        }
        let compatible = match (group.get_active_configuration(), self.devices.find_by_address(&address)) {
            (Some(conf), Some(device)) => conf.confs.iter().all(|c| {
                device.ase_count(c.direction) == 0
                    || device.is_codec_config_supported(c.direction, &c.codec)
            }),
            _ => true,
        };
        if compatible {
            debug!("group {}: {} not needed in the stream", group_id, address);
            return;
        }
        info!("group {}: {} needs another configuration, restarting", group_id, address);
        group.set_pending_configuration();
        self.state_machine.stop_stream(group, &mut self.devices);
    }

    /// Dispatches a characteristic value, read or notified.
    fn process_characteristic_value(
        &mut self,
        address: RawAddress,
        handle: u16,
        value: &[u8],
    ) -> Result<()> {
        let device =
            self.devices.find_by_address_mut(&address).ok_or(Error::UnknownDevice(address))?;
        let group_id = device.group_id;
        let connected = device.is_connected();
        let handles = device.handles.clone();

        if let Some(ase_index) = device.ase_index_by_val_hdl(handle) {
            let status = ascs::parse_ase_status(value).ok_or(Error::Malformed("ASE"))?;
            match self.groups.find_by_id_mut(group_id) {
                Some(group) => self.state_machine.process_ase_status(
                    group,
                    &mut self.devices,
                    address,
                    ase_index,
                    status,
                ),
                None => {
                    let ase = &mut device.ases[ase_index];
                    ase.id = status.ase_id;
                    ase.state = status.state;
                }
            }
            return Ok(());
        }

        if handle == handles.ctp.val_hdl {
            let notification =
                ascs::parse_ctp_notification(value).ok_or(Error::Malformed("control point"))?;
            if let Some(group) = self.groups.find_by_id_mut(group_id) {
                self.state_machine.process_ctp_notification(group, address, &notification);
            }
            return Ok(());
        }

        for (direction, pacs) in
            [(Direction::Sink, &handles.sink_pacs), (Direction::Source, &handles.source_pacs)]
        {
            if pacs.iter().any(|h| h.val_hdl == handle) {
                let records = pacs::parse_pacs(value).ok_or(Error::Malformed("PAC"))?;
                debug!("{}: {} {:?} PAC records", address, records.len(), direction);
                device.set_pac_records(direction, handle, records);
                if connected {
                    self.update_audio_conf(group_id);
                }
                return Ok(());
            }
        }

        if handles.sink_audio_locations.map_or(false, |h| h.val_hdl == handle) {
            let locations =
                pacs::parse_audio_locations(value).ok_or(Error::Malformed("audio locations"))?;
            device.sink_locations = locations;
            self.interfaces.callbacks.on_sink_audio_location_available(address, locations);
        } else if handles.source_audio_locations.map_or(false, |h| h.val_hdl == handle) {
            device.source_locations =
                pacs::parse_audio_locations(value).ok_or(Error::Malformed("audio locations"))?;
        } else if handle == handles.available_contexts.val_hdl {
            let contexts = pacs::parse_contexts(value).ok_or(Error::Malformed("contexts"))?;
            if !device.set_available_contexts(contexts) {
                return Ok(());
            }
        } else if handle == handles.supported_contexts.val_hdl {
            device.supported_contexts =
                pacs::parse_contexts(value).ok_or(Error::Malformed("contexts"))?;
            return Ok(());
        } else {
            debug!("{}: value on unknown handle {:#06x}", address, handle);
            return Ok(());
        }
        if connected {
            self.update_audio_conf(group_id);
        }
        Ok(())
    }

    /// Refreshes the locations and contexts of the group and reports them when they changed.
    /// Groups in transition evaluate the change once they settle.
    fn update_audio_conf(&mut self, group_id: i32) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return;
        };
        group.update_available_contexts(&self.devices);
        if group.is_in_transition() {
            debug!("group {}: contexts change deferred", group_id);
            group.pending_available_contexts_change = Some(group.available_contexts);
            return;
        }
        group.pending_available_contexts_change = None;
        let locations_changed = group.reload_audio_locations(&self.devices);
        let contexts = group.available_contexts.union();
        let contexts_changed = group.update_audio_context_type_availability(
            contexts,
            &self.devices,
            self.provider.as_ref(),
        );
        if !locations_changed && !contexts_changed {
            return;
        }
        info!(
            "group {}: directions {:?} sink {:?} source {:?} contexts {:?}",
            group_id,
            group.audio_directions,
            group.snk_audio_locations,
            group.src_audio_locations,
            group.supported_contexts()
        );
        self.interfaces.callbacks.on_audio_conf(
            group.audio_directions,
            group_id,
            group.snk_audio_locations,
            group.src_audio_locations,
            group.supported_contexts(),
        );
    }

    // Groups

    /// Puts the device in the group, moving it out of its previous group.
    pub fn group_add_node(&mut self, group_id: i32, address: RawAddress) -> Result<()> {
        let device = self.devices.find_by_address(&address).ok_or(Error::UnknownDevice(address))?;
        let old_group_id = device.group_id;
        if old_group_id == group_id {
            return Ok(());
        }
        let connected = device.is_connected();
        if let Some(group) = self.groups.find_by_id_mut(old_group_id) {
            self.state_machine.detach_device(group, &mut self.devices, address);
        }
        let device =
            self.devices.find_by_address_mut(&address).ok_or(Error::UnknownDevice(address))?;
        let destroyed = self.groups.assign_device(device, group_id, self.config.cig_id_base)?;
        info!("{}: group {} -> {}", address, old_group_id, group_id);
        if old_group_id != GROUP_UNKNOWN {
            self.interfaces.callbacks.on_group_node_status(
                address,
                old_group_id,
                GroupNodeStatus::Removed,
            );
            match destroyed {
                Some(id) => self.on_group_destroyed(id),
                None => self.update_audio_conf(old_group_id),
            }
        }
        self.interfaces.callbacks.on_group_node_status(address, group_id, GroupNodeStatus::Added);
        self.update_audio_conf(group_id);
        if connected && group_id == self.active_group_id {
            self.attach_or_reconfigure(group_id, address);
        }
        self.drain();
        Ok(())
    }

    pub fn group_remove_node(&mut self, group_id: i32, address: RawAddress) -> Result<()> {
        let device = self.devices.find_by_address(&address).ok_or(Error::UnknownDevice(address))?;
        if device.group_id != group_id {
            return Err(Error::UnknownDevice(address));
        }
        let group = self.groups.find_by_id_mut(group_id).ok_or(Error::UnknownGroup(group_id))?;
        self.state_machine.detach_device(group, &mut self.devices, address);
        if let Some(device) = self.devices.find_by_address_mut(&address) {
            group.remove_node(device);
        }
        self.interfaces.callbacks.on_group_node_status(address, group_id, GroupNodeStatus::Removed);
        if group.is_empty() && group.cig.state == CigState::None {
            self.groups.remove(group_id);
            self.on_group_destroyed(group_id);
        } else {
            self.update_audio_conf(group_id);
        }
        self.drain();
        Ok(())
    }

    fn on_group_destroyed(&mut self, group_id: i32) {
        self.state_machine.forget_group(group_id);
        self.interfaces.callbacks.on_group_stream_status(group_id, GroupStreamStatus::Destroyed);
        if group_id == self.active_group_id {
            self.stop_local_audio();
            self.active_group_id = GROUP_UNKNOWN;
            self.interfaces.callbacks.on_group_status(group_id, GroupStatus::Inactive);
        }
    }

    /// Sets the number of devices the coordinated set announces.
    pub fn set_csis_group_size(&mut self, group_id: i32, size: usize) -> Result<()> {
        let group = self.groups.find_by_id_mut(group_id).ok_or(Error::UnknownGroup(group_id))?;
        group.csis_desired_size = Some(size);
        self.update_audio_conf(group_id);
        Ok(())
    }

    /// Binds the group to the local audio sessions, the previously active group is stopped and
    /// released first. `GROUP_UNKNOWN` only deactivates.
    pub fn group_set_active(&mut self, group_id: i32) -> Result<()> {
        if group_id == self.active_group_id {
            return Ok(());
        }
        if group_id != GROUP_UNKNOWN {
            let group = self.groups.find_by_id(group_id).ok_or(Error::UnknownGroup(group_id))?;
            if !group.is_any_device_connected(&self.devices) {
                return Err(Error::NotConnected(group_id));
            }
        }

        let previous = self.active_group_id;
        if previous != GROUP_UNKNOWN {
            info!("group {}: deactivating", previous);
            if let Some(group) = self.groups.find_by_id_mut(previous) {
                self.state_machine.stop_stream(group, &mut self.devices);
            }
            self.stop_local_audio();
            self.active_group_id = GROUP_UNKNOWN;
            self.interfaces.callbacks.on_group_status(previous, GroupStatus::Inactive);
        }

        if group_id != GROUP_UNKNOWN {
            let sink = self.pcm_configuration(group_id, Direction::Sink);
            if !self.interfaces.sink_hal.start(&sink) {
                error!("group {}: local audio source refused {:?}", group_id, sink);
                self.drain();
                return Err(Error::AudioSession("source"));
            }
            let source = self.pcm_configuration(group_id, Direction::Source);
            if !self.interfaces.source_hal.start(&source) {
                error!("group {}: local audio sink refused {:?}", group_id, source);
                self.interfaces.sink_hal.stop();
                self.drain();
                return Err(Error::AudioSession("sink"));
            }
            info!("group {}: active", group_id);
            self.active_group_id = group_id;
            self.interfaces.callbacks.on_group_status(group_id, GroupStatus::Active);
        }
        self.drain();
        Ok(())
    }

    fn pcm_configuration(&self, group_id: i32, direction: Direction) -> PcmConfiguration {
        let setting = self
            .groups
            .find_by_id(group_id)
            .and_then(|g| g.get_codec_configuration_by_direction(self.configuration_context_type, direction));
        let (default_rate, channels) = match direction {
            Direction::Sink => (DEFAULT_SINK_SAMPLE_RATE_HZ, 2),
            Direction::Source => (
                DEFAULT_SOURCE_SAMPLE_RATE_HZ,
                setting.map_or(1, |s| (s.device_cnt * s.codec.channel_count_per_ase).clamp(1, 2)),
            ),
        };
        PcmConfiguration {
            num_channels: channels,
            sample_rate_hz: setting.map_or(default_rate, |s| s.codec.sampling_frequency_hz),
            bits_per_sample: BITS_PER_SAMPLE,
            data_interval_us: setting.map_or(DEFAULT_DATA_INTERVAL_US, |s| s.codec.frame_duration_us),
        }
    }

    // Local audio

    fn hal(&self, direction: Direction) -> &Rc<dyn AudioHalClient> {
        match direction {
            Direction::Sink => &self.interfaces.sink_hal,
            Direction::Source => &self.interfaces.source_hal,
        }
    }

    fn audio_state(&self, direction: Direction) -> AudioState {
        match direction {
            Direction::Sink => self.sender_state,
            Direction::Source => self.receiver_state,
        }
    }

    fn set_audio_state(&mut self, direction: Direction, state: AudioState) {
        let current = match direction {
            Direction::Sink => &mut self.sender_state,
            Direction::Source => &mut self.receiver_state,
        };
        if *current != state {
            info!("{:?} local audio {:?} -> {:?}", direction, *current, state);
        }
        *current = state;
    }

    pub fn on_local_audio_source_resume(&mut self) {
        self.resume(Direction::Sink);
        self.drain();
    }

    pub fn on_local_audio_sink_resume(&mut self) {
        self.resume(Direction::Source);
        self.drain();
    }

    /// The returned receiver completes once the suspend is handled.
    pub fn on_local_audio_source_suspend(&mut self) -> oneshot::Receiver<()> {
        self.suspend(Direction::Sink)
    }

    pub fn on_local_audio_sink_suspend(&mut self) -> oneshot::Receiver<()> {
        self.suspend(Direction::Source)
    }

    pub fn on_local_audio_source_metadata_update(&mut self, contexts: AudioContexts) {
        debug!("Local source metadata {:?}", contexts);
        self.local_metadata_contexts.sink = contexts;
        self.reconfigure_or_update_metadata();
        self.drain();
    }

    pub fn on_local_audio_sink_metadata_update(&mut self, contexts: AudioContexts) {
        debug!("Local sink metadata {:?}", contexts);
        self.local_metadata_contexts.source = contexts;
        self.reconfigure_or_update_metadata();
        self.drain();
    }

    fn resume(&mut self, direction: Direction) {
        let group_id = self.active_group_id;
        let Some(group) = self.groups.find_by_id(group_id) else {
            warn!("{:?} resume without active group", direction);
            self.hal(direction).cancel_streaming_request();
            return;
        };
        let streaming =
            group.state() == AseState::Streaming && group.target_state() == AseState::Streaming;
        let has_streams = !group.stream_conf.get(direction).streams.is_empty();
        let releasing = group.is_releasing_or_idle() && group.is_in_transition();
        let starting = group.target_state() == AseState::Streaming && group.is_in_transition();
        let pending_configuration = group.is_pending_configuration();

        match self.audio_state(direction) {
            AudioState::ReadyToStart | AudioState::Started => {
                debug!("{:?} resume ignored in {:?}", direction, self.audio_state(direction));
                return;
            }
            AudioState::Releasing => {
                self.set_audio_state(direction, AudioState::ReadyToStart);
                return;
            }
            AudioState::Idle | AudioState::ReadyToRelease => {}
        }
        self.suspend_timeout.cancel();

        if streaming && has_streams {
            self.set_audio_state(direction, AudioState::Started);
            self.start_local_stream(direction);
            self.hal(direction).confirm_streaming_request();
            return;
        }
        self.set_audio_state(direction, AudioState::ReadyToStart);
        if releasing || starting || pending_configuration {
            debug!("group {}: {:?} resume waits for the group", group_id, direction);
            return;
        }
        if streaming {
            // The stream does not carry this direction.
            let context_type = self.choose_context_type(group_id);
            self.reconfigure(group_id, context_type);
            return;
        }
        let other = self.audio_state(direction.opposite());
        if !matches!(other, AudioState::Started | AudioState::ReadyToStart) {
            self.configuration_context_type = self.choose_context_type(group_id);
        }
        if !self.group_stream(group_id, self.configuration_context_type) {
            self.hal(direction).cancel_streaming_request();
            self.set_audio_state(direction, AudioState::Idle);
        }
    }

    fn suspend(&mut self, direction: Direction) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let _done = scopeguard::guard(done, |done| {
            let _ = done.send(());
        });
        match self.audio_state(direction) {
            AudioState::Started => self.set_audio_state(direction, AudioState::ReadyToRelease),
            AudioState::ReadyToStart => self.set_audio_state(direction, AudioState::Idle),
            state => debug!("{:?} suspend in {:?}", direction, state),
        }
        let released = |s: AudioState| matches!(s, AudioState::Idle | AudioState::ReadyToRelease);
        if released(self.sender_state) && released(self.receiver_state) {
            let group_id = self.active_group_id;
            let in_use = self.groups.find_by_id(group_id).map_or(false, |g| !g.is_releasing_or_idle());
            if in_use {
                debug!("group {}: keep-alive for {:?}", group_id, self.config.suspend_timeout());
                self.suspend_timeout.schedule(
                    self.config.suspend_timeout(),
                    self.tx.clone(),
                    Message::SuspendTimeout(group_id),
                );
            }
        }
        self.drain();
        rx
    }

    fn on_suspend_timeout(&mut self, group_id: i32) {
        if group_id != self.active_group_id {
            return;
        }
        let released = |s: AudioState| matches!(s, AudioState::Idle | AudioState::ReadyToRelease);
        if !released(self.sender_state) || !released(self.receiver_state) {
            return;
        }
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return;
        };
        info!("group {}: local audio suspended, stopping the stream", group_id);
        if self.config.disable_before_stopping && group.state() == AseState::Streaming {
            self.state_machine.suspend_stream(group, &mut self.devices);
        } else {
            self.state_machine.stop_stream(group, &mut self.devices);
        }
    }

    /// Context type for the local metadata, restricted to what the group can do.
    fn choose_context_type(&self, group_id: i32) -> LeAudioContextType {
        let Some(group) = self.groups.find_by_id(group_id) else {
            return self.configuration_context_type;
        };
        let available = group.available_contexts;
        let mut contexts = (self.local_metadata_contexts.sink & available.sink)
            | (self.local_metadata_contexts.source & available.source);
        contexts &= group.supported_contexts();
        if contexts.is_empty() && !self.in_call {
            return if group.is_context_supported(LeAudioContextType::Media) {
                LeAudioContextType::Media
            } else {
                LeAudioContextType::Unspecified
            };
        }
        choose_configuration_context_type(contexts, self.in_call)
    }

    /// Metadata of the ASEs streaming for `context_type`, with the CCIDs of its contexts.
    fn stream_metadata(&self, group_id: i32, context_type: LeAudioContextType) -> (BidirectionalContexts, Vec<u8>) {
        let available =
            self.groups.find_by_id(group_id).map(|g| g.available_contexts).unwrap_or_default();
        let metadata = if self.in_call {
            let conversational = AudioContexts::from(LeAudioContextType::Conversational);
            BidirectionalContexts::new(conversational, conversational)
        } else {
            let pick = |local: AudioContexts, available: AudioContexts| {
                let contexts = local & available;
                if contexts.is_empty() {
                    AudioContexts::from(context_type)
                } else {
                    contexts
                }
            };
            BidirectionalContexts::new(
                pick(self.local_metadata_contexts.sink, available.sink),
                pick(self.local_metadata_contexts.source, available.source),
            )
        };
        let mut ccids: Vec<u8> =
            metadata.union().types().filter_map(|c| self.ccids.get(&c).copied()).collect();
        ccids.sort_unstable();
        ccids.dedup();
        (metadata, ccids)
    }

    fn group_stream(&mut self, group_id: i32, context_type: LeAudioContextType) -> bool {
        let (metadata, ccids) = self.stream_metadata(group_id, context_type);
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return false;
        };
        if !group.is_any_device_connected(&self.devices) {
            warn!("group {}: nothing connected", group_id);
            return false;
        }
        self.state_machine.start_stream(
            group,
            &mut self.devices,
            self.provider.as_ref(),
            context_type,
            metadata,
            ccids,
        )
    }

    fn reconfigure(&mut self, group_id: i32, context_type: LeAudioContextType) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return;
        };
        info!(
            "group {}: reconfiguring {} -> {}",
            group_id, self.configuration_context_type, context_type
        );
        self.configuration_context_type = context_type;
        group.set_pending_configuration();
        self.state_machine.stop_stream(group, &mut self.devices);
    }

    /// Follows a change of the local metadata: a new codec configuration restarts the stream,
    /// anything else only updates the metadata of the streaming ASEs.
    fn reconfigure_or_update_metadata(&mut self) {
        let group_id = self.active_group_id;
        let mut context_type = self.choose_context_type(group_id);
        let Some(group) = self.groups.find_by_id(group_id) else {
            return;
        };
        let current = self.configuration_context_type;
        let sink_configured =
            group.get_active_configuration().map_or(false, |c| c.has_direction(Direction::Sink));
        if context_type != current
            && sink_configured
            && self.config.suppressed_contexts().test(context_type)
        {
            debug!("{} keeps the {} configuration", context_type, current);
            context_type = current;
        }
        let streaming = group.state() == AseState::Streaming && !group.is_in_transition();
        if !streaming {
            self.configuration_context_type = context_type;
            return;
        }
        let active_name = group.get_active_configuration().map(|c| c.name.as_str());
        let new_name = group.get_cached_configuration(context_type).map(|c| c.name.as_str());
        if context_type != current && active_name != new_name {
            self.reconfigure(group_id, context_type);
            return;
        }
        self.configuration_context_type = context_type;
        self.group_stream(group_id, context_type);
    }

    pub fn set_in_call(&mut self, in_call: bool) {
        if self.in_call == in_call {
            return;
        }
        info!("In call: {}", in_call);
        self.in_call = in_call;
        self.reconfigure_or_update_metadata();
        self.drain();
    }

    /// Content control id of the service driving the contexts.
    pub fn set_ccid_information(&mut self, ccid: u8, contexts: AudioContexts) {
        self.ccids.retain(|_, c| *c != ccid);
        for context_type in contexts.types() {
            self.ccids.insert(context_type, ccid);
        }
    }

    fn start_local_stream(&mut self, direction: Direction) {
        let group_id = self.active_group_id;
        if self.config.codec_location == CodecLocation::Adsp {
            self.update_offloader(group_id, direction);
            return;
        }
        let Some(group) = self.groups.find_by_id(group_id) else {
            return;
        };
        let params = group.stream_conf.get(direction);
        if params.streams.is_empty() {
            return;
        }
        let lc3 = self.interfaces.lc3.as_ref();
        match direction {
            Direction::Sink => self.encoder = Some(LeAudioEncoder::new(lc3, params)),
            Direction::Source => {
                let channels = self.pcm_configuration(group_id, Direction::Source).num_channels;
                self.decoder = Some(LeAudioDecoder::new(lc3, params, channels as usize));
            }
        }
    }

    fn update_offloader(&mut self, group_id: i32, direction: Direction) {
        let hal = self.hal(direction).clone();
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return;
        };
        group.create_stream_vector_for_offloader(direction, &self.devices);
        let params = group.stream_conf.get(direction);
        if !params.offloader_changed {
            return;
        }
        let config = OffloadConfiguration {
            streams: params
                .offloader_current
                .iter()
                .map(|s| (s.stream_handle, s.audio_channel_allocation))
                .collect(),
            bits_per_sample: BITS_PER_SAMPLE,
            sample_rate_hz: params.sample_frequency_hz,
            frame_duration_us: params.frame_duration_us,
            octets_per_codec_frame: params.octets_per_codec_frame,
            codec_frames_blocks_per_sdu: params.codec_frames_blocks_per_sdu,
            peer_delay_ms: group.remote_delay_ms(direction, &self.devices),
        };
        hal.update_audio_config_to_hal(&config);
        group.clear_offloader_changed(direction);
    }

    fn stop_local_audio(&mut self) {
        self.suspend_timeout.cancel();
        self.interfaces.sink_hal.stop();
        self.interfaces.source_hal.stop();
        self.set_audio_state(Direction::Sink, AudioState::Idle);
        self.set_audio_state(Direction::Source, AudioState::Idle);
        self.encoder = None;
        self.decoder = None;
    }

    fn cancel_pending_requests(&mut self) {
        for direction in Direction::BOTH {
            if self.audio_state(direction) == AudioState::ReadyToStart {
                self.hal(direction).cancel_streaming_request();
                self.set_audio_state(direction, AudioState::Idle);
            }
        }
    }

    /// Local sessions go back to Idle after the group failed a transition.
    fn reset_local_audio(&mut self) {
        self.cancel_pending_requests();
        for direction in Direction::BOTH {
            self.set_audio_state(direction, AudioState::Idle);
        }
        self.encoder = None;
        self.decoder = None;
    }

    fn on_status_report(&mut self, group_id: i32, status: GroupStreamStatus) {
        info!("group {}: stream status {:?}", group_id, status);
        self.interfaces.callbacks.on_group_stream_status(group_id, status);
        if matches!(status, GroupStreamStatus::Idle | GroupStreamStatus::ConfiguredAutonomous) {
            self.close_pending_disconnections(group_id);
        }
        let pending_contexts = match self.groups.find_by_id_mut(group_id) {
            Some(group) if !group.is_in_transition() => {
                group.pending_available_contexts_change.take().is_some()
            }
            _ => false,
        };
        if pending_contexts {
            self.update_audio_conf(group_id);
        }
        if group_id != self.active_group_id {
            return;
        }

        match status {
            GroupStreamStatus::Streaming => self.on_group_streaming(group_id),
            GroupStreamStatus::Suspended => {
                let released =
                    |s: AudioState| matches!(s, AudioState::Idle | AudioState::ReadyToRelease);
                if released(self.sender_state) && released(self.receiver_state) {
                    if let Some(group) = self.groups.find_by_id_mut(group_id) {
                        self.state_machine.stop_stream(group, &mut self.devices);
                    }
                }
            }
            GroupStreamStatus::Releasing => {
                for direction in Direction::BOTH {
                    if self.audio_state(direction) == AudioState::ReadyToRelease {
                        self.set_audio_state(direction, AudioState::Releasing);
                    }
                }
            }
            GroupStreamStatus::Idle | GroupStreamStatus::ConfiguredAutonomous => {
                self.on_group_released(group_id, status)
            }
            GroupStreamStatus::Suspending
            | GroupStreamStatus::ConfiguredByUser
            | GroupStreamStatus::Destroyed => {}
        }
    }

    fn on_group_streaming(&mut self, group_id: i32) {
        let Some(group) = self.groups.find_by_id(group_id) else {
            return;
        };
        let delays = Direction::BOTH.map(|d| (d, group.remote_delay_ms(d, &self.devices)));
        let has_streams = Direction::BOTH.map(|d| !group.stream_conf.get(d).streams.is_empty());
        for (direction, delay_ms) in delays {
            self.hal(direction).update_remote_delay(delay_ms);
        }
        for (direction, has_streams) in Direction::BOTH.into_iter().zip(has_streams) {
            match self.audio_state(direction) {
                AudioState::ReadyToStart if has_streams => {
                    self.start_local_stream(direction);
                    self.hal(direction).confirm_streaming_request();
                    self.set_audio_state(direction, AudioState::Started);
                }
                AudioState::ReadyToStart => {
                    warn!("group {}: {:?} not part of the stream", group_id, direction);
                    self.hal(direction).cancel_streaming_request();
                    self.set_audio_state(direction, AudioState::Idle);
                }
                // Restarted after a reconfiguration.
                AudioState::Started => self.start_local_stream(direction),
                _ => {}
            }
        }
    }

    fn on_group_released(&mut self, group_id: i32, status: GroupStreamStatus) {
        self.encoder = None;
        self.decoder = None;
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            return;
        };
        let pending_configuration = group.is_pending_configuration();
        group.clear_pending_configuration();
        let wanted = Direction::BOTH
            .into_iter()
            .any(|d| matches!(self.audio_state(d), AudioState::ReadyToStart | AudioState::Started));
        if pending_configuration || wanted {
            info!("group {}: restarting for {}", group_id, self.configuration_context_type);
            if self.group_stream(group_id, self.configuration_context_type) {
                return;
            }
            self.cancel_pending_requests();
        }
        for direction in Direction::BOTH {
            if self.audio_state(direction) != AudioState::ReadyToStart {
                self.set_audio_state(direction, AudioState::Idle);
            }
        }
        if self.in_call && status == GroupStreamStatus::Idle {
            self.interfaces.callbacks.on_group_status(group_id, GroupStatus::TurnedIdleDuringCall);
        }
    }

    fn close_pending_disconnections(&mut self, group_id: i32) {
        let Some(group) = self.groups.find_by_id(group_id) else {
            return;
        };
        for address in group.addresses() {
            let Some(device) = self.devices.find_by_address_mut(address) else {
                continue;
            };
            if device.closing_stream_for_disconnection {
                device.closing_stream_for_disconnection = false;
                info!("{}: stream released, closing {:#06x}", address, device.conn_id);
                self.interfaces.gatt.close(device.conn_id);
            }
        }
    }

    fn on_update_cis_configuration(&mut self, group_id: i32, direction: Direction) {
        if group_id != self.active_group_id {
            return;
        }
        match self.config.codec_location {
            CodecLocation::Adsp => self.update_offloader(group_id, direction),
            CodecLocation::Host => {
                if self.audio_state(direction) == AudioState::Started {
                    self.start_local_stream(direction);
                }
            }
        }
    }

    // Audio data

    /// PCM from the local source, 16 bit interleaved stereo. Returns the bytes consumed.
    pub fn on_local_audio_source_data(&mut self, data: &[u8]) -> usize {
        if self.sender_state != AudioState::Started {
            return 0;
        }
        let (Some(encoder), Some(group)) =
            (self.encoder.as_mut(), self.groups.find_by_id(self.active_group_id))
        else {
            return 0;
        };
        let pcm = bytes_to_samples(data);
        for (cis_conn_hdl, payload) in encoder.encode(&pcm, 2, &group.stream_conf.sink) {
            self.interfaces.iso.send_iso_data(cis_conn_hdl, &payload);
        }
        data.len()
    }

    /// Payload received on a CIS.
    pub fn on_iso_data(&mut self, cis_conn_hdl: u16, payload: &[u8], timestamp: u32) {
        if self.receiver_state != AudioState::Started {
            return;
        }
        let (Some(decoder), Some(group)) =
            (self.decoder.as_mut(), self.groups.find_by_id(self.active_group_id))
        else {
            return;
        };
        for frame in decoder.decode(cis_conn_hdl, payload, timestamp, &group.stream_conf.source) {
            self.interfaces.source_hal.send_data(&samples_to_bytes(&frame));
        }
    }

    // ISO events

    pub fn on_cig_create_complete(&mut self, cig_id: u8, status: u8, conn_handles: Vec<u16>) {
        if let Some(group) = self.groups.find_by_cig_id_mut(cig_id) {
            self.state_machine.process_cig_created(group, &mut self.devices, status, &conn_handles);
        } else {
            warn!("CIG {} created for no group", cig_id);
        }
        self.drain();
    }

    pub fn on_cig_remove_complete(&mut self, cig_id: u8, status: u8) {
        let Some(group) = self.groups.find_by_cig_id_mut(cig_id) else {
            warn!("CIG {} removed for no group", cig_id);
            return;
        };
        self.state_machine.process_cig_removed(group, &mut self.devices, status);
        let group_id = group.group_id;
        if group.is_empty() {
            self.groups.remove(group_id);
            self.on_group_destroyed(group_id);
        }
        self.drain();
    }

    pub fn on_cis_established(&mut self, event: CisEstablishedEvent) {
        if let Some(group) = self.groups.find_by_cig_id_mut(event.cig_id) {
            self.state_machine.process_cis_established(group, &mut self.devices, &event);
        }
        self.drain();
    }

    pub fn on_cis_disconnected(&mut self, cig_id: u8, cis_conn_hdl: u16, reason: u8) {
        if let Some(group) = self.groups.find_by_cig_id_mut(cig_id) {
            self.state_machine.process_cis_disconnected(
                group,
                &mut self.devices,
                cis_conn_hdl,
                reason,
            );
        }
        self.drain();
    }

    pub fn on_data_path_setup(&mut self, cig_id: u8, cis_conn_hdl: u16, status: u8) {
        if let Some(group) = self.groups.find_by_cig_id_mut(cig_id) {
            self.state_machine.process_data_path_setup(
                group,
                &mut self.devices,
                status,
                cis_conn_hdl,
            );
        }
        self.drain();
    }

    pub fn on_data_path_removed(&mut self, cis_conn_hdl: u16, status: u8) {
        self.state_machine.process_data_path_removed(cis_conn_hdl, status);
    }

    pub fn on_link_quality_report(&self, report: &LinkQualityReport) {
        info!(
            "CIS {:#06x}: tx unacked {} flushed {} last subevent {} retransmitted {} crc errors {} \
             rx unreceived {} duplicates {}",
            report.cis_conn_hdl,
            report.tx_unacked_packets,
            report.tx_flushed_packets,
            report.tx_last_subevent_packets,
            report.retransmitted_packets,
            report.crc_error_packets,
            report.rx_unreceived_packets,
            report.duplicate_packets
        );
    }

    /// Requests a link quality report on every connected CIS of the active group.
    pub fn read_link_quality(&self) {
        let Some(group) = self.groups.find_by_id(self.active_group_id) else {
            return;
        };
        for device in group.active_devices(&self.devices) {
            for cis_conn_hdl in device.cis_conn_handles() {
                self.interfaces.iso.read_iso_link_quality(cis_conn_hdl);
            }
        }
    }

    /// Deactivates the active group and drops every connection and record.
    pub fn cleanup(&mut self) {
        if let Err(e) = self.group_set_active(GROUP_UNKNOWN) {
            warn!("{}", e);
        }
        for device in self.devices.iter() {
            if device.conn_id != CONN_ID_INVALID {
                self.interfaces.gatt.close(device.conn_id);
            }
        }
        for group in self.groups.iter() {
            self.state_machine.forget_group(group.group_id);
        }
        self.devices.cleanup();
        self.groups.cleanup();
    }
}
