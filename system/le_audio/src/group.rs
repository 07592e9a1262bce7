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


//! Device groups: membership, configuration matching, CIG/CIS bookkeeping and the stream
//! configuration derived from the active ASEs.

use crate::device::{LeAudioDevice, LeAudioDevices};
use crate::error::{Error, Result};
use crate::interfaces::{CigParameters, CisConfig};
use crate::set_configurations::{
    group_strategy, AudioSetConfiguration, AudioSetConfigurationProvider, ConfigurationStrategy,
    SetConfiguration,
};
use crate::types::{
    AseState, AudioContexts, AudioDirections, AudioLocations, BidirectionalContexts, CigState,
    CisType, CodecSpecificConfig, DataPathState, Direction, LeAudioContextType, RawAddress,
    StreamMetadata, CIS_CONN_HANDLE_INVALID, CIS_ID_INVALID, GROUP_UNKNOWN,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;

/// PHY used for every CIS, LE 2M.
const PHY_2M: u8 = 0x02;

/// A CIS of the group's CIG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cis {
    pub id: u8,
    pub cis_type: CisType,
    pub conn_handle: u16,
    /// Device the CIS is assigned to, empty when free.
    pub addr: RawAddress,
}

#[derive(Debug, Default)]
pub struct Cig {
    pub state: CigState,
    pub cises: Vec<Cis>,
}

/// Offloader view of one CIS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMapInfo {
    pub stream_handle: u16,
    pub audio_channel_allocation: AudioLocations,
    pub is_stream_active: bool,
}

/// Streams of one direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamParameters {
    /// Connected CISes carrying this direction, with their channel allocation.
    pub streams: Vec<(u16, AudioLocations)>,
    pub sample_frequency_hz: u32,
    pub frame_duration_us: u32,
    pub octets_per_codec_frame: u16,
    pub codec_frames_blocks_per_sdu: u8,
    pub num_of_devices: u8,
    pub num_of_channels: u8,
    /// Allocation expected once every CIS is connected.
    pub offloader_target: Vec<StreamMapInfo>,
    /// Allocation to use with the CISes connected now.
    pub offloader_current: Vec<StreamMapInfo>,
    pub offloader_changed: bool,
}

impl StreamParameters {
    fn clear_streams(&mut self) {
        self.streams.clear();
        self.num_of_devices = 0;
        self.num_of_channels = 0;
    }
}

/// Stream configuration of the group, derived from the active ASEs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamConfiguration {
    pub conf: Option<AudioSetConfiguration>,
    pub context_type: Option<LeAudioContextType>,
    pub sink: StreamParameters,
    pub source: StreamParameters,
}

impl StreamConfiguration {
    pub fn get(&self, direction: Direction) -> &StreamParameters {
        match direction {
            Direction::Sink => &self.sink,
            Direction::Source => &self.source,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut StreamParameters {
        match direction {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
        }
    }
}

fn lowest_bit(locations: AudioLocations) -> AudioLocations {
    AudioLocations::from_bits_retain(locations.bits() & locations.bits().wrapping_neg())
}

/// Channel allocation of each of the `ase_cnt` ASEs a device contributes to `conf`.
fn ase_allocations(
    locations: AudioLocations,
    conf: &SetConfiguration,
    ase_cnt: usize,
) -> Vec<AudioLocations> {
    let left = lowest_bit(locations & AudioLocations::ANY_LEFT);
    let right = lowest_bit(locations & AudioLocations::ANY_RIGHT);
    match conf.strategy {
        ConfigurationStrategy::StereoOneCisPerDevice => vec![left | right; ase_cnt],
        ConfigurationStrategy::StereoTwoCisesPerDevice => {
            [left, right].into_iter().cycle().take(ase_cnt).collect()
        }
        ConfigurationStrategy::MonoOneCisPerDevice if conf.codec.channel_count_per_ase > 1 => {
            vec![left | right; ase_cnt]
        }
        ConfigurationStrategy::MonoOneCisPerDevice => {
            let mono = if !left.is_empty() {
                left
            } else if !right.is_empty() {
                right
            } else {
                lowest_bit(locations)
            };
            vec![mono; ase_cnt]
        }
    }
}

fn ases_per_device(conf: &SetConfiguration) -> usize {
    let device_cnt = conf.device_cnt.max(1) as usize;
    (conf.ase_cnt as usize).div_ceil(device_cnt)
}

/// Activates `count` free ASEs of the device with the codec setting of `conf`.
fn configure_device_ases(
    device: &mut LeAudioDevice,
    conf: &SetConfiguration,
    count: usize,
    context_type: LeAudioContextType,
    metadata: &StreamMetadata,
) {
    let direction = conf.direction;
    let allocations = ase_allocations(device.audio_locations(direction), conf, count);
    for allocation in allocations {
        let Some(ase) = device.ases.iter_mut().find(|a| a.direction == direction && !a.active)
        else {
            break;
        };
        ase.active = true;
        ase.target_latency = conf.target_latency;
        ase.codec_id = conf.codec.codec_id;
        ase.codec_config = CodecSpecificConfig {
            sampling_frequency_hz: conf.codec.sampling_frequency_hz,
            frame_duration_us: conf.codec.frame_duration_us,
            audio_channel_allocation: allocation,
            octets_per_codec_frame: conf.codec.octets_per_codec_frame,
            codec_frames_blocks_per_sdu: conf.codec.codec_frames_blocks_per_sdu,
        };
        ase.metadata = metadata.clone();
        ase.configured_for_context_type = Some(context_type);
        debug!("{}: ase {} {:?} allocation {:?}", device.address, ase.id, direction, allocation);
    }
}

/// A coordinated set of devices, streaming together.
#[derive(Debug)]
pub struct LeAudioDeviceGroup {
    pub group_id: i32,
    pub cig_id: u8,
    devices: Vec<RawAddress>,
    state: AseState,
    target_state: AseState,
    pub cig: Cig,
    /// Set size reported by the coordinated set service.
    pub csis_desired_size: Option<usize>,
    pub configuration_context_type: LeAudioContextType,
    pub metadata_contexts: BidirectionalContexts,
    pub ccids: Vec<u8>,
    pub stream_conf: StreamConfiguration,
    config_cache: HashMap<LeAudioContextType, Option<AudioSetConfiguration>>,
    supported_config_contexts: AudioContexts,
    pub available_contexts: BidirectionalContexts,
    pub snk_audio_locations: AudioLocations,
    pub src_audio_locations: AudioLocations,
    pub audio_directions: AudioDirections,
    pending_configuration: bool,
    /// Available contexts notified while the group was in transition.
    pub pending_available_contexts_change: Option<BidirectionalContexts>,
    pub transport_latency_c_to_p_us: u32,
    pub transport_latency_p_to_c_us: u32,
}

impl LeAudioDeviceGroup {
    pub fn new(group_id: i32, cig_id: u8) -> Self {
        Self {
            group_id,
            cig_id,
            devices: Vec::new(),
            state: AseState::Idle,
            target_state: AseState::Idle,
            cig: Cig::default(),
            csis_desired_size: None,
            configuration_context_type: LeAudioContextType::Unspecified,
            metadata_contexts: BidirectionalContexts::default(),
            ccids: Vec::new(),
            stream_conf: StreamConfiguration::default(),
            config_cache: HashMap::new(),
            supported_config_contexts: AudioContexts::empty(),
            available_contexts: BidirectionalContexts::default(),
            snk_audio_locations: AudioLocations::empty(),
            src_audio_locations: AudioLocations::empty(),
            audio_directions: AudioDirections::empty(),
            pending_configuration: false,
            pending_available_contexts_change: None,
            transport_latency_c_to_p_us: 0,
            transport_latency_p_to_c_us: 0,
        }
    }

    pub fn add_node(&mut self, device: &mut LeAudioDevice) {
        if !self.devices.contains(&device.address) {
            self.devices.push(device.address);
        }
        device.group_id = self.group_id;
    }

    pub fn remove_node(&mut self, device: &mut LeAudioDevice) {
        self.devices.retain(|a| *a != device.address);
        self.cig_unassign_cis(&device.address);
        device.group_id = GROUP_UNKNOWN;
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn addresses(&self) -> &[RawAddress] {
        &self.devices
    }

    /// Number of devices the group is expected to have.
    pub fn expected_size(&self) -> usize {
        self.csis_desired_size.unwrap_or(self.devices.len()).max(1)
    }

    pub fn devices<'a>(
        &'a self,
        devices: &'a LeAudioDevices,
    ) -> impl Iterator<Item = &'a LeAudioDevice> + 'a {
        self.devices.iter().filter_map(move |a| devices.find_by_address(a))
    }

    pub fn connected_devices<'a>(
        &'a self,
        devices: &'a LeAudioDevices,
    ) -> impl Iterator<Item = &'a LeAudioDevice> + 'a {
        self.devices(devices).filter(|d| d.is_connected())
    }

    pub fn active_devices<'a>(
        &'a self,
        devices: &'a LeAudioDevices,
    ) -> impl Iterator<Item = &'a LeAudioDevice> + 'a {
        self.devices(devices).filter(|d| d.have_active_ase())
    }

    pub fn active_device_addresses(&self, devices: &LeAudioDevices) -> Vec<RawAddress> {
        self.active_devices(devices).map(|d| d.address).collect()
    }

    pub fn first_active_device<'a>(
        &'a self,
        devices: &'a LeAudioDevices,
    ) -> Option<&'a LeAudioDevice> {
        self.active_devices(devices).next()
    }

    pub fn is_any_device_connected(&self, devices: &LeAudioDevices) -> bool {
        self.connected_devices(devices).next().is_some()
    }

    pub fn num_of_connected(&self, devices: &LeAudioDevices) -> usize {
        self.connected_devices(devices).count()
    }

    pub fn state(&self) -> AseState {
        self.state
    }

    pub fn set_state(&mut self, state: AseState) {
        if self.state != state {
            info!("group {}: state {:?} -> {:?}", self.group_id, self.state, state);
        }
        self.state = state;
    }

    pub fn target_state(&self) -> AseState {
        self.target_state
    }

    pub fn set_target_state(&mut self, state: AseState) {
        if self.target_state != state {
            info!("group {}: target state {:?} -> {:?}", self.group_id, self.target_state, state);
        }
        self.target_state = state;
    }

    pub fn is_in_transition(&self) -> bool {
        self.state != self.target_state
    }

    pub fn is_releasing_or_idle(&self) -> bool {
        self.target_state == AseState::Idle
    }

    pub fn is_pending_configuration(&self) -> bool {
        self.pending_configuration
    }

    pub fn set_pending_configuration(&mut self) {
        self.pending_configuration = true;
    }

    pub fn clear_pending_configuration(&mut self) {
        self.pending_configuration = false;
    }

    pub fn audio_locations(&self, direction: Direction) -> AudioLocations {
        match direction {
            Direction::Sink => self.snk_audio_locations,
            Direction::Source => self.src_audio_locations,
        }
    }

    /// Strategy the group needs for the direction.
    pub fn strategy(&self, direction: Direction, devices: &LeAudioDevices) -> ConfigurationStrategy {
        let max_channel_count =
            self.devices(devices).next().map_or(1, |d| d.max_channel_count(direction));
        group_strategy(self.expected_size(), self.audio_locations(direction), max_channel_count)
    }

    /// Recomputes the aggregate locations and directions of the connected devices, returns
    /// whether they changed.
    pub fn reload_audio_locations(&mut self, devices: &LeAudioDevices) -> bool {
        let (mut sink, mut source) = (AudioLocations::empty(), AudioLocations::empty());
        let mut directions = AudioDirections::empty();
        for device in self.connected_devices(devices) {
            sink |= device.sink_locations;
            source |= device.source_locations;
            if device.ase_count(Direction::Sink) > 0 {
                directions |= AudioDirections::SINK;
            }
            if device.ase_count(Direction::Source) > 0 {
                directions |= AudioDirections::SOURCE;
            }
        }
        let changed = sink != self.snk_audio_locations
            || source != self.src_audio_locations
            || directions != self.audio_directions;
        self.snk_audio_locations = sink;
        self.src_audio_locations = source;
        self.audio_directions = directions;
        changed
    }

    /// Recomputes the contexts available on the connected devices, returns whether they
    /// changed.
    pub fn update_available_contexts(&mut self, devices: &LeAudioDevices) -> bool {
        let mut contexts = BidirectionalContexts::default();
        for device in self.connected_devices(devices) {
            contexts.sink |= device.available_contexts.sink;
            contexts.source |= device.available_contexts.source;
        }
        let changed = contexts != self.available_contexts;
        self.available_contexts = contexts;
        changed
    }

    /// Re-evaluates every context type of `contexts` against the capabilities of the connected
    /// devices and refreshes the per context configuration cache. Context types outside of
    /// `contexts` are not satisfiable. Returns whether the satisfiable set changed.
    pub fn update_audio_context_type_availability(
        &mut self,
        contexts: AudioContexts,
        devices: &LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
    ) -> bool {
        let mut supported = AudioContexts::empty();
        self.config_cache.clear();
        for context_type in contexts.types() {
            let conf = self.find_first_supported_configuration(context_type, devices, provider);
            debug!(
                "group {}: {} -> {}",
                self.group_id,
                context_type,
                conf.as_ref().map_or("none", |c| c.name.as_str())
            );
            if conf.is_some() {
                supported |= AudioContexts::from(context_type);
            }
            self.config_cache.insert(context_type, conf);
        }
        let changed = supported != self.supported_config_contexts;
        self.supported_config_contexts = supported;
        changed
    }

    /// Context types a configuration was found for.
    pub fn supported_contexts(&self) -> AudioContexts {
        self.supported_config_contexts
    }

    pub fn is_context_supported(&self, context_type: LeAudioContextType) -> bool {
        self.get_cached_configuration(context_type).is_some()
    }

    pub fn get_cached_configuration(
        &self,
        context_type: LeAudioContextType,
    ) -> Option<&AudioSetConfiguration> {
        self.config_cache.get(&context_type).and_then(Option::as_ref)
    }

    pub fn get_active_configuration(&self) -> Option<&AudioSetConfiguration> {
        self.stream_conf.conf.as_ref()
    }

    /// Codec configuration the group uses in the direction for the context type.
    pub fn get_codec_configuration_by_direction(
        &self,
        context_type: LeAudioContextType,
        direction: Direction,
    ) -> Option<&SetConfiguration> {
        self.get_cached_configuration(context_type)?.get(direction).next()
    }

    pub fn find_first_supported_configuration(
        &self,
        context_type: LeAudioContextType,
        devices: &LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
    ) -> Option<AudioSetConfiguration> {
        provider
            .get_configurations(context_type)
            .iter()
            .find(|conf| self.is_audio_set_configuration_supported(conf, devices))
            .cloned()
    }

    /// A configuration is usable when its strategy matches the group in every direction and
    /// enough connected devices support its codec setting with enough ASEs.
    pub fn is_audio_set_configuration_supported(
        &self,
        conf: &AudioSetConfiguration,
        devices: &LeAudioDevices,
    ) -> bool {
        if conf.confs.is_empty() {
            return false;
        }
        for direction in Direction::BOTH {
            let strategy = self.strategy(direction, devices);
            for ent in conf.get(direction) {
                if ent.strategy != strategy {
                    debug!(
                        "{}: {:?} strategy {:?} does not match {:?}",
                        conf.name, direction, ent.strategy, strategy
                    );
                    return false;
                }
                let per_device = ases_per_device(ent);
                let mut required_devices = ent.device_cnt as usize;
                let mut required_ases = ent.ase_cnt as usize;
                for device in self.connected_devices(devices) {
                    if required_devices == 0 {
                        break;
                    }
                    if !device.is_codec_config_supported(direction, &ent.codec)
                        || device.ase_count(direction) < per_device.min(required_ases)
                    {
                        continue;
                    }
                    required_devices -= 1;
                    required_ases -= per_device.min(required_ases);
                }
                if required_devices > 0 || required_ases > 0 {
                    return false;
                }
            }
        }
        true
    }

    /// Selects the configuration for the context type and activates the ASEs.
    pub fn configure(
        &mut self,
        context_type: LeAudioContextType,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
        devices: &mut LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
    ) -> bool {
        let conf = match self.get_cached_configuration(context_type) {
            Some(conf) => conf.clone(),
            None => match self.find_first_supported_configuration(context_type, devices, provider)
            {
                Some(conf) => conf,
                None => {
                    error!("group {}: no configuration for {}", self.group_id, context_type);
                    return false;
                }
            },
        };
        self.deactivate(devices);
        self.configure_ases(&conf, context_type, metadata_contexts, ccids, devices)
    }

    /// Activates and configures ASEs of the connected devices according to `conf`.
    pub fn configure_ases(
        &mut self,
        conf: &AudioSetConfiguration,
        context_type: LeAudioContextType,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
        devices: &mut LeAudioDevices,
    ) -> bool {
        info!("group {}: configuring {} for {}", self.group_id, conf.name, context_type);
        let addresses = self.devices.clone();
        for direction in Direction::BOTH {
            for ent in conf.get(direction) {
                let per_device = ases_per_device(ent);
                let mut required_devices = ent.device_cnt as usize;
                let mut required_ases = ent.ase_cnt as usize;
                for address in &addresses {
                    if required_devices == 0 {
                        break;
                    }
                    let Some(device) = devices.find_by_address_mut(address) else {
                        continue;
                    };
                    let count = per_device.min(required_ases);
                    if !device.is_connected()
                        || !device.is_codec_config_supported(direction, &ent.codec)
                        || device.free_ase_count(direction) < count
                    {
                        continue;
                    }
                    let metadata = StreamMetadata {
                        contexts: metadata_contexts.get(direction),
                        ccids: ccids.clone(),
                    };
                    configure_device_ases(device, ent, count, context_type, &metadata);
                    required_devices -= 1;
                    required_ases -= count;
                }
                if required_devices > 0 || required_ases > 0 {
                    error!(
                        "group {}: {} needs {} more devices, {} more ASEs",
                        self.group_id, conf.name, required_devices, required_ases
                    );
                    self.deactivate(devices);
                    return false;
                }
            }
        }

        for address in &addresses {
            let Some(device) = devices.find_by_address_mut(address) else {
                continue;
            };
            if !device.have_active_ase() {
                continue;
            }
            if !self.cig_assign_cis_ids(device) {
                self.deactivate(devices);
                return false;
            }
            self.cig_assign_cis_conn_handles_to_ases(device);
        }

        self.stream_conf.conf = Some(conf.clone());
        self.stream_conf.context_type = Some(context_type);
        self.configuration_context_type = context_type;
        self.metadata_contexts = metadata_contexts;
        self.ccids = ccids;
        true
    }

    /// Adds a device to the running stream, on the ASEs the active configuration leaves to it.
    pub fn attach_device(&mut self, address: &RawAddress, devices: &mut LeAudioDevices) -> bool {
        let (Some(conf), Some(context_type)) =
            (self.stream_conf.conf.clone(), self.stream_conf.context_type)
        else {
            warn!("group {}: no stream to attach {} to", self.group_id, address);
            return false;
        };
        let used = |direction| {
            self.devices(devices)
                .filter(|d| d.address != *address)
                .flat_map(|d| d.active_ases_by_direction(direction))
                .count()
        };
        let used_ases = [used(Direction::Sink), used(Direction::Source)];
        let Some(device) = devices.find_by_address_mut(address) else {
            return false;
        };
        if !device.is_connected() {
            return false;
        }
        device.deactivate_all_ases();
        for (direction, used) in Direction::BOTH.into_iter().zip(used_ases) {
            let Some(ent) = conf.get(direction).next() else {
                continue;
            };
            let count = ases_per_device(ent).min((ent.ase_cnt as usize).saturating_sub(used));
            if count == 0 {
                continue;
            }
            if !device.is_codec_config_supported(direction, &ent.codec)
                || device.free_ase_count(direction) < count
            {
                warn!("{}: can't join {} of group {}", address, conf.name, self.group_id);
                device.deactivate_all_ases();
                return false;
            }
            let metadata = StreamMetadata {
                contexts: self.metadata_contexts.get(direction),
                ccids: self.ccids.clone(),
            };
            configure_device_ases(device, ent, count, context_type, &metadata);
        }
        if !device.have_active_ase() || !self.cig_assign_cis_ids(device) {
            device.deactivate_all_ases();
            return false;
        }
        self.cig_assign_cis_conn_handles_to_ases(device);
        true
    }

    /// Re-activates the ASEs already configured for the context type.
    pub fn activate(
        &mut self,
        context_type: LeAudioContextType,
        metadata_contexts: BidirectionalContexts,
        ccids: Vec<u8>,
        devices: &mut LeAudioDevices,
    ) -> bool {
        let mut is_activate = false;
        for address in self.devices.clone() {
            let Some(device) = devices.find_by_address_mut(&address) else {
                continue;
            };
            if !device.is_connected() {
                continue;
            }
            for ase in device.ases.iter_mut() {
                if ase.state != AseState::CodecConfigured
                    || ase.configured_for_context_type != Some(context_type)
                {
                    continue;
                }
                ase.active = true;
                ase.metadata = StreamMetadata {
                    contexts: metadata_contexts.get(ase.direction),
                    ccids: ccids.clone(),
                };
                is_activate = true;
            }
            if device.have_active_ase() {
                if !self.cig_assign_cis_ids(device) {
                    return false;
                }
                self.cig_assign_cis_conn_handles_to_ases(device);
            }
        }
        self.metadata_contexts = metadata_contexts;
        self.ccids = ccids;
        is_activate
    }

    /// Takes every ASE out of the configuration and frees their CISes.
    pub fn deactivate(&mut self, devices: &mut LeAudioDevices) {
        for address in self.devices.clone() {
            if let Some(device) = devices.find_by_address_mut(&address) {
                device.deactivate_all_ases();
            }
            self.cig_unassign_cis(&address);
        }
    }

    /// Whether the metadata differs from the one set on the active ASEs.
    pub fn is_metadata_changed(
        &self,
        metadata_contexts: BidirectionalContexts,
        ccids: &[u8],
        devices: &LeAudioDevices,
    ) -> bool {
        self.active_devices(devices).flat_map(|d| d.active_ases()).any(|ase| {
            ase.metadata.contexts != metadata_contexts.get(ase.direction) || ase.metadata.ccids != ccids
        })
    }

    /// True when at least one device is active and all of its active ASEs are in `state`.
    pub fn have_all_active_devices_ases_the_same_state(
        &self,
        state: AseState,
        devices: &LeAudioDevices,
    ) -> bool {
        self.have_all_active_devices_ases_in(&[state], devices)
    }

    pub fn have_all_active_devices_ases_in(
        &self,
        states: &[AseState],
        devices: &LeAudioDevices,
    ) -> bool {
        let mut any = false;
        for device in self.active_devices(devices) {
            any = true;
            if !device.active_ases().all(|a| states.contains(&a.state)) {
                return false;
            }
        }
        any
    }

    pub fn have_any_active_device(&self, devices: &LeAudioDevices) -> bool {
        self.active_devices(devices).next().is_some()
    }

    /// Every active ASE is streaming with its data path up.
    pub fn is_group_stream_ready(&self, devices: &LeAudioDevices) -> bool {
        self.have_all_active_devices_ases_the_same_state(AseState::Streaming, devices)
            && self.active_devices(devices).all(|d| d.have_all_data_paths_established())
    }

    pub fn have_all_cises_disconnected(&self, devices: &LeAudioDevices) -> bool {
        self.devices(devices).flat_map(|d| d.ases.iter()).all(|a| {
            matches!(a.data_path_state, DataPathState::Idle | DataPathState::CisAssigned)
        })
    }

    /// Creates the CIS records of the CIG, sized for the largest configuration of the context
    /// type matching the group. Does nothing when CISes exist already.
    pub fn cig_generate_cis_ids(
        &mut self,
        context_type: LeAudioContextType,
        devices: &LeAudioDevices,
        provider: &dyn AudioSetConfigurationProvider,
    ) -> bool {
        if !self.cig.cises.is_empty() {
            debug!("group {}: CIS ids already generated", self.group_id);
            return true;
        }
        let sink_strategy = self.strategy(Direction::Sink, devices);
        let source_strategy = self.strategy(Direction::Source, devices);
        let group_sink_ases: usize = self.devices(devices).map(|d| d.ase_count(Direction::Sink)).sum();
        let group_source_ases: usize =
            self.devices(devices).map(|d| d.ase_count(Direction::Source)).sum();

        let (mut bidir, mut sink, mut source) = (0usize, 0usize, 0usize);
        for conf in provider.get_configurations(context_type) {
            let mismatch = conf.confs.iter().any(|c| {
                c.strategy
                    != match c.direction {
                        Direction::Sink => sink_strategy,
                        Direction::Source => source_strategy,
                    }
            });
            if mismatch {
                continue;
            }
            let sink_ases = conf.ase_count(Direction::Sink) as usize;
            let source_ases = conf.ase_count(Direction::Source) as usize;
            if sink_ases > group_sink_ases || source_ases > group_source_ases {
                continue;
            }
            let conf_bidir = sink_ases.min(source_ases);
            bidir = bidir.max(conf_bidir);
            sink = sink.max(sink_ases - conf_bidir);
            source = source.max(source_ases - conf_bidir);
        }
        if bidir + sink + source == 0 {
            warn!("group {}: no CIS needed for {}", self.group_id, context_type);
            return false;
        }

        let types = std::iter::repeat(CisType::Bidirectional)
            .take(bidir)
            .chain(std::iter::repeat(CisType::UnidirectionalSink).take(sink))
            .chain(std::iter::repeat(CisType::UnidirectionalSource).take(source));
        self.cig.cises = types
            .enumerate()
            .map(|(id, cis_type)| Cis {
                id: id as u8,
                cis_type,
                conn_handle: CIS_CONN_HANDLE_INVALID,
                addr: RawAddress::empty(),
            })
            .collect();
        info!(
            "group {}: generated {} bidirectional, {} sink, {} source CISes",
            self.group_id, bidir, sink, source
        );
        true
    }

    fn cig_get_first_free_cis_id(&self, cis_type: CisType) -> Option<u8> {
        self.cig.cises.iter().find(|c| c.cis_type == cis_type && c.addr.is_empty()).map(|c| c.id)
    }

    fn set_cis_addr(&mut self, cis_id: u8, address: RawAddress) {
        if let Some(cis) = self.cig.cises.iter_mut().find(|c| c.id == cis_id) {
            cis.addr = address;
        }
    }

    pub fn cis(&self, cis_id: u8) -> Option<&Cis> {
        self.cig.cises.iter().find(|c| c.id == cis_id)
    }

    pub fn cis_count(&self, cis_type: CisType) -> usize {
        self.cig.cises.iter().filter(|c| c.cis_type == cis_type).count()
    }

    /// Maps the active ASEs of the device onto free CISes. A sink and a source ASE share a
    /// bidirectional CIS when one is free.
    pub fn cig_assign_cis_ids(&mut self, device: &mut LeAudioDevice) -> bool {
        assert!(
            device.have_active_ase(),
            "{}: CIS assignment without an active ASE",
            device.address
        );
        for i in 0..device.ases.len() {
            let ase = &device.ases[i];
            if !ase.active {
                continue;
            }
            let mut cis_id = CIS_ID_INVALID;
            if ase.cis_id != CIS_ID_INVALID {
                if self.cis(ase.cis_id).map_or(false, |c| !c.addr.is_empty()) {
                    debug!("{}: ase {} already on CIS {}", device.address, ase.id, ase.cis_id);
                    continue;
                }
                cis_id = ase.cis_id;
            }
            let direction = ase.direction;
            let pair = (0..device.ases.len()).find(|&j| {
                let other = &device.ases[j];
                j != i && other.active && other.direction != direction && other.cis_id == CIS_ID_INVALID
            });
            if let Some(j) = pair {
                if cis_id == CIS_ID_INVALID {
                    cis_id = self
                        .cig_get_first_free_cis_id(CisType::Bidirectional)
                        .unwrap_or(CIS_ID_INVALID);
                }
                if cis_id != CIS_ID_INVALID {
                    device.ases[i].cis_id = cis_id;
                    device.ases[j].cis_id = cis_id;
                    self.set_cis_addr(cis_id, device.address);
                    info!(
                        "{}: ases {} and {} on bidirectional CIS {}",
                        device.address, device.ases[i].id, device.ases[j].id, cis_id
                    );
                    continue;
                }
                warn!("{}: no free bidirectional CIS, trying unidirectional", device.address);
            }
            let cis_type = match direction {
                Direction::Sink => CisType::UnidirectionalSink,
                Direction::Source => CisType::UnidirectionalSource,
            };
            if cis_id == CIS_ID_INVALID {
                cis_id = self
                    .cig_get_first_free_cis_id(cis_type)
                    .or_else(|| self.cig_get_first_free_cis_id(CisType::Bidirectional))
                    .unwrap_or(CIS_ID_INVALID);
            }
            if cis_id == CIS_ID_INVALID {
                error!("{}: no free CIS for ase {}", device.address, device.ases[i].id);
                return false;
            }
            device.ases[i].cis_id = cis_id;
            self.set_cis_addr(cis_id, device.address);
            info!("{}: ase {} on CIS {}", device.address, device.ases[i].id, cis_id);
        }
        true
    }

    /// Stores the connection handles returned for the CIG, in CIS declaration order.
    pub fn cig_assign_cis_conn_handles(&mut self, conn_handles: &[u16]) {
        if conn_handles.len() != self.cig.cises.len() {
            warn!(
                "group {}: {} handles for {} CISes",
                self.group_id,
                conn_handles.len(),
                self.cig.cises.len()
            );
        }
        for (cis, handle) in self.cig.cises.iter_mut().zip(conn_handles) {
            cis.conn_handle = *handle;
        }
    }

    pub fn cig_assign_cis_conn_handles_to_ases(&self, device: &mut LeAudioDevice) {
        for ase in device.active_ases_mut() {
            let Some(cis) = self.cig.cises.iter().find(|c| c.id == ase.cis_id) else {
                continue;
            };
            if cis.conn_handle == CIS_CONN_HANDLE_INVALID {
                continue;
            }
            ase.cis_conn_hdl = cis.conn_handle;
            if ase.data_path_state == DataPathState::Idle {
                ase.data_path_state = DataPathState::CisAssigned;
            }
        }
    }

    /// Frees the CISes assigned to the device, connection handles are kept.
    pub fn cig_unassign_cis(&mut self, address: &RawAddress) {
        for cis in self.cig.cises.iter_mut().filter(|c| c.addr == *address) {
            debug!("group {}: CIS {} released by {}", self.group_id, cis.id, address);
            cis.addr = RawAddress::empty();
        }
    }

    /// Drops the CIS records, once the CIG is removed.
    pub fn cig_clear_cis(&mut self) {
        self.cig.cises.clear();
    }

    fn conf_entry(&self, direction: Direction) -> Option<&SetConfiguration> {
        self.stream_conf.conf.as_ref()?.get(direction).next()
    }

    pub fn sdu_interval(&self, direction: Direction) -> u32 {
        self.conf_entry(direction).map_or(0, |c| c.codec.sdu_interval_us())
    }

    pub fn max_transport_latency(&self, direction: Direction) -> u16 {
        self.conf_entry(direction).map_or(0, |c| c.qos.max_transport_latency)
    }

    pub fn retransmission_number(&self, direction: Direction) -> u8 {
        self.conf_entry(direction).map_or(0, |c| c.qos.retransmission_number)
    }

    /// Presentation delay every active ASE of the direction accepts, preferring the servers'
    /// preferred range when they agree on one.
    pub fn presentation_delay(&self, direction: Direction, devices: &LeAudioDevices) -> u32 {
        let (mut min, mut max) = (0u32, u32::MAX);
        let (mut preferred_min, mut preferred_max) = (0u32, u32::MAX);
        for ase in self.active_devices(devices).flat_map(|d| d.active_ases_by_direction(direction)) {
            let prefs = &ase.qos_preferences;
            min = min.max(prefs.pres_delay_min);
            if prefs.pres_delay_max != 0 {
                max = max.min(prefs.pres_delay_max);
            }
            if prefs.preferred_pres_delay_min != 0 {
                preferred_min = preferred_min.max(prefs.preferred_pres_delay_min);
            }
            if prefs.preferred_pres_delay_max != 0 {
                preferred_max = preferred_max.min(prefs.preferred_pres_delay_max);
            }
        }
        if min > max {
            warn!("group {}: no common presentation delay {}..{}", self.group_id, min, max);
            return min;
        }
        if preferred_min != 0 && preferred_min <= preferred_max && (min..=max).contains(&preferred_min)
        {
            return preferred_min;
        }
        min
    }

    /// Delay between audio handed to the stack and audio rendered (sink) or captured (source),
    /// in milliseconds.
    pub fn remote_delay_ms(&self, direction: Direction, devices: &LeAudioDevices) -> u16 {
        let transport_latency_us = match direction {
            Direction::Sink => self.transport_latency_c_to_p_us,
            Direction::Source => self.transport_latency_p_to_c_us,
        };
        ((self.presentation_delay(direction, devices) + transport_latency_us) / 1000) as u16
    }

    /// CIG parameters, one CIS configuration per CIS record in declaration order. CISes with no
    /// ASE mapped yet are sized from the active configuration.
    pub fn cig_parameters(&self, devices: &LeAudioDevices) -> CigParameters {
        let sink_conf = self.conf_entry(Direction::Sink);
        let source_conf = self.conf_entry(Direction::Source);
        let cis = self
            .cig
            .cises
            .iter()
            .map(|cis| {
                let mut sink_sdu = None;
                let mut source_sdu = None;
                for ase in self.devices(devices).flat_map(|d| d.active_ases()) {
                    if ase.cis_id != cis.id {
                        continue;
                    }
                    match ase.direction {
                        Direction::Sink => sink_sdu = Some(ase.codec_config.max_sdu_size()),
                        Direction::Source => source_sdu = Some(ase.codec_config.max_sdu_size()),
                    }
                }
                let carries_sink = cis.cis_type != CisType::UnidirectionalSource;
                let carries_source = cis.cis_type != CisType::UnidirectionalSink;
                let max_sdu_c_to_p = sink_sdu.unwrap_or_else(|| match sink_conf {
                    Some(c) if carries_sink => c.codec.max_sdu_size(),
                    _ => 0,
                });
                let max_sdu_p_to_c = source_sdu.unwrap_or_else(|| match source_conf {
                    Some(c) if carries_source => c.codec.max_sdu_size(),
                    _ => 0,
                });
                CisConfig {
                    cis_id: cis.id,
                    max_sdu_c_to_p,
                    max_sdu_p_to_c,
                    phy_c_to_p: PHY_2M,
                    phy_p_to_c: PHY_2M,
                    rtn_c_to_p: self.retransmission_number(Direction::Sink),
                    rtn_p_to_c: self.retransmission_number(Direction::Source),
                }
            })
            .collect();
        CigParameters {
            cig_id: self.cig_id,
            sdu_interval_c_to_p: self.sdu_interval(Direction::Sink),
            sdu_interval_p_to_c: self.sdu_interval(Direction::Source),
            worst_case_sca: 0,
            packing: 0,
            framing: 0,
            max_transport_latency_c_to_p: self.max_transport_latency(Direction::Sink),
            max_transport_latency_p_to_c: self.max_transport_latency(Direction::Source),
            cis,
        }
    }

    /// Rebuilds the per direction streams from the active ASEs with a data path.
    pub fn update_stream_configuration(&mut self, devices: &LeAudioDevices) {
        let mut sink = std::mem::take(&mut self.stream_conf.sink);
        let mut source = std::mem::take(&mut self.stream_conf.source);
        sink.clear_streams();
        source.clear_streams();
        for device in self.active_devices(devices) {
            let mut device_directions = AudioDirections::empty();
            for ase in device.active_ases() {
                if ase.data_path_state != DataPathState::DataPathEstablished {
                    continue;
                }
                let params = match ase.direction {
                    Direction::Sink => &mut sink,
                    Direction::Source => &mut source,
                };
                let allocation = ase.codec_config.audio_channel_allocation;
                params.streams.push((ase.cis_conn_hdl, allocation));
                params.num_of_channels += ase.codec_config.channel_count();
                params.sample_frequency_hz = ase.codec_config.sampling_frequency_hz;
                params.frame_duration_us = ase.codec_config.frame_duration_us;
                params.octets_per_codec_frame = ase.codec_config.octets_per_codec_frame;
                params.codec_frames_blocks_per_sdu = ase.codec_config.codec_frames_blocks_per_sdu;
                if !device_directions.contains(ase.direction.into()) {
                    device_directions |= AudioDirections::from(ase.direction);
                    params.num_of_devices += 1;
                }
            }
        }
        self.stream_conf.sink = sink;
        self.stream_conf.source = source;
    }

    /// Rebuilds the offloader allocation vectors of the direction. The changed flag is raised
    /// only when a vector differs from the previous one, and is cleared by the consumer.
    pub fn create_stream_vector_for_offloader(
        &mut self,
        direction: Direction,
        devices: &LeAudioDevices,
    ) -> bool {
        let expected = self
            .active_devices(devices)
            .flat_map(|d| d.active_ases_by_direction(direction))
            .filter(|a| a.cis_id != CIS_ID_INVALID)
            .count();
        let params = self.stream_conf.get_mut(direction);
        let all_connected = params.streams.len() >= expected;
        let target: Vec<StreamMapInfo> = params
            .streams
            .iter()
            .map(|(handle, allocation)| StreamMapInfo {
                stream_handle: *handle,
                audio_channel_allocation: *allocation,
                is_stream_active: true,
            })
            .collect();
        let current: Vec<StreamMapInfo> = if all_connected {
            target.clone()
        } else {
            target
                .iter()
                .map(|s| StreamMapInfo { audio_channel_allocation: AudioLocations::STEREO, ..*s })
                .collect()
        };
        if target == params.offloader_target && current == params.offloader_current {
            return false;
        }
        debug!("{:?} offloader streams {:?}, current {:?}", direction, target, current);
        params.offloader_target = target;
        params.offloader_current = current;
        params.offloader_changed = true;
        true
    }

    pub fn clear_offloader_changed(&mut self, direction: Direction) {
        self.stream_conf.get_mut(direction).offloader_changed = false;
    }

    pub fn dump(&self, devices: &LeAudioDevices) -> String {
        let mut out = format!(
            "group {} state {:?} target {:?} cig {} {:?} context {} pending configuration {}\n",
            self.group_id,
            self.state,
            self.target_state,
            self.cig_id,
            self.cig.state,
            self.configuration_context_type,
            self.pending_configuration
        );
        if let Some(conf) = &self.stream_conf.conf {
            out += &format!("  configuration {}\n", conf.name);
        }
        for cis in &self.cig.cises {
            out += &format!(
                "  cis {} {:?} hdl {:#06x} {}\n",
                cis.id, cis.cis_type, cis.conn_handle, cis.addr
            );
        }
        for device in self.devices(devices) {
            out += &device.dump();
        }
        out
    }
}

/// Registry of the groups.
#[derive(Debug, Default)]
pub struct LeAudioDeviceGroups {
    groups: Vec<LeAudioDeviceGroup>,
}

impl LeAudioDeviceGroups {
    /// Creates the group, with the first CIG id from `cig_id_base` not used by another group.
    pub fn add(&mut self, group_id: i32, cig_id_base: u8) -> Result<&mut LeAudioDeviceGroup> {
        if self.find_by_id(group_id).is_some() {
            return Err(Error::GroupAlreadyExists(group_id));
        }
        let cig_id = (cig_id_base..=0xef)
            .find(|id| self.groups.iter().all(|g| g.cig_id != *id))
            .ok_or(Error::UnknownGroup(group_id))?;
        info!("group {}: created with CIG {}", group_id, cig_id);
        self.groups.push(LeAudioDeviceGroup::new(group_id, cig_id));
        self.find_by_id_mut(group_id).ok_or(Error::UnknownGroup(group_id))
    }

    pub fn remove(&mut self, group_id: i32) -> Option<LeAudioDeviceGroup> {
        let index = self.groups.iter().position(|g| g.group_id == group_id)?;
        info!("group {}: removed", group_id);
        Some(self.groups.remove(index))
    }

    pub fn find_by_id(&self, group_id: i32) -> Option<&LeAudioDeviceGroup> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    pub fn find_by_id_mut(&mut self, group_id: i32) -> Option<&mut LeAudioDeviceGroup> {
        self.groups.iter_mut().find(|g| g.group_id == group_id)
    }

    pub fn find_by_cig_id_mut(&mut self, cig_id: u8) -> Option<&mut LeAudioDeviceGroup> {
        self.groups.iter_mut().find(|g| g.cig_id == cig_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LeAudioDeviceGroup> {
        self.groups.iter()
    }

    pub fn size(&self) -> usize {
        self.groups.len()
    }

    pub fn is_any_in_transition(&self) -> bool {
        self.groups.iter().any(|g| g.is_in_transition())
    }

    pub fn cleanup(&mut self) {
        self.groups.clear();
    }

    /// Moves the device into `group_id`, creating the group when needed. The previous group is
    /// destroyed when it ends up empty without a CIG, its id is returned in that case.
    pub fn assign_device(
        &mut self,
        device: &mut LeAudioDevice,
        group_id: i32,
        cig_id_base: u8,
    ) -> Result<Option<i32>> {
        let old_group_id = device.group_id;
        if old_group_id == group_id {
            return Ok(None);
        }
        if self.find_by_id(group_id).is_none() {
            self.add(group_id, cig_id_base)?;
        }
        let mut destroyed = None;
        if let Some(old) = self.find_by_id_mut(old_group_id) {
            old.remove_node(device);
            if old.is_empty() && old.cig.state == CigState::None {
                self.remove(old_group_id);
                destroyed = Some(old_group_id);
            }
        }
        if let Some(group) = self.find_by_id_mut(group_id) {
            group.add_node(device);
        }
        Ok(destroyed)
    }
}
