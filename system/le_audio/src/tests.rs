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


//! Client scenarios driven through the GATT, ISO and local audio entry points.

use crate::client::{AudioState, LeAudioClient, LeAudioInterfaces};
use crate::config::LeAudioConfig;
use crate::device::{CharHandles, DeviceHandles};
use crate::error::Error;
use crate::interfaces::{
    AudioHalClient, CigParameters, CisEstablishedEvent, DataPathParameters, GattInterface,
    IsoManager, Lc3Decoder, Lc3Encoder, Lc3Factory, LeAudioCallbacks, OffloadConfiguration,
    PcmConfiguration, ServiceSearchResult,
};
use crate::set_configurations::ConfigurationTable;
use crate::types::{
    AseState, AudioContexts, AudioDirections, AudioLocations, CigState, CodecLocation,
    ConnectionState, Direction, GroupNodeStatus, GroupStatus, GroupStreamStatus,
    LeAudioContextType, RawAddress, GROUP_UNKNOWN,
};
use crate::utils::init_logging;
use crate::wire::ltv::LtvMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

const GROUP: i32 = 1;
const CIG: u8 = 1;

const SINK_ASE: u16 = 0x10;
const SINK_ASE_2: u16 = 0x12;
const SOURCE_ASE: u16 = 0x14;
const CTP: u16 = 0x20;
const SINK_PAC: u16 = 0x30;
const SINK_LOCATIONS: u16 = 0x32;
const AVAILABLE_CONTEXTS: u16 = 0x34;
const SUPPORTED_CONTEXTS: u16 = 0x36;
const SOURCE_PAC: u16 = 0x40;
const SOURCE_LOCATIONS: u16 = 0x42;

const OP_CONFIG_CODEC: u8 = 0x01;
const OP_CONFIG_QOS: u8 = 0x02;
const OP_ENABLE: u8 = 0x03;
const OP_UPDATE_METADATA: u8 = 0x07;
const OP_RELEASE: u8 = 0x08;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Open(RawAddress),
    CancelOpen(RawAddress),
    Close(u16),
    DisconnectAcl(RawAddress),
    DiscoverServices(u16),
    Read(u16, u16),
    WriteDescriptor(u16, u16),
    WriteCtp(u16, Vec<u8>),
    CleanPending(u16),
    CreateCig(u8, usize),
    RemoveCig(u8),
    EstablishCis(Vec<(u16, u16)>),
    DisconnectCis(u16),
    SetupDataPath(u16, Direction),
    RemoveDataPath(u16),
    ReadLinkQuality(u16),
    IsoData(u16, Vec<u8>),
    HalStart(Direction, PcmConfiguration),
    HalStop(Direction),
    HalData(Direction, usize),
    Confirm(Direction),
    Cancel(Direction),
    RemoteDelay(Direction),
    Offload(Direction, OffloadConfiguration),
    ConnectionState(RawAddress, ConnectionState),
    GroupStatus(i32, GroupStatus),
    StreamStatus(i32, GroupStreamStatus),
    NodeStatus(RawAddress, i32, GroupNodeStatus),
    AudioConf(i32, AudioDirections, AudioContexts),
    SinkLocations(RawAddress, AudioLocations),
}

#[derive(Default)]
struct Log {
    calls: RefCell<Vec<Call>>,
}

impl Log {
    fn push(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    fn has(&self, call: &Call) -> bool {
        self.calls.borrow().contains(call)
    }

    fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| f(c)).count()
    }

    fn position(&self, call: &Call) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c == call)
    }

    /// Control point writes to the connection.
    fn ctp_writes(&self, conn_id: u16) -> Vec<Vec<u8>> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::WriteCtp(id, value) if *id == conn_id => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn ctp_opcode_count(&self, conn_id: u16, opcode: u8) -> usize {
        self.ctp_writes(conn_id).iter().filter(|v| v.first() == Some(&opcode)).count()
    }
}

struct MockGatt(Rc<Log>);

impl GattInterface for MockGatt {
    fn open(&self, address: RawAddress, _direct: bool) {
        self.0.push(Call::Open(address));
    }
    fn cancel_open(&self, address: RawAddress) {
        self.0.push(Call::CancelOpen(address));
    }
    fn close(&self, conn_id: u16) {
        self.0.push(Call::Close(conn_id));
    }
    fn disconnect_acl(&self, address: RawAddress) {
        self.0.push(Call::DisconnectAcl(address));
    }
    fn discover_services(&self, conn_id: u16) {
        self.0.push(Call::DiscoverServices(conn_id));
    }
    fn read_characteristic(&self, conn_id: u16, handle: u16) {
        self.0.push(Call::Read(conn_id, handle));
    }
    fn write_descriptor(&self, conn_id: u16, handle: u16, _value: Vec<u8>) {
        self.0.push(Call::WriteDescriptor(conn_id, handle));
    }
    fn write_characteristic(&self, conn_id: u16, handle: u16, value: Vec<u8>) {
        assert_eq!(handle, CTP);
        self.0.push(Call::WriteCtp(conn_id, value));
    }
    fn clean_pending(&self, conn_id: u16) {
        self.0.push(Call::CleanPending(conn_id));
    }
}

struct MockIso(Rc<Log>);

impl IsoManager for MockIso {
    fn create_cig(&self, params: CigParameters) {
        self.0.push(Call::CreateCig(params.cig_id, params.cis.len()));
    }
    fn remove_cig(&self, cig_id: u8, _force: bool) {
        self.0.push(Call::RemoveCig(cig_id));
    }
    fn establish_cis(&self, pairs: Vec<(u16, u16)>) {
        self.0.push(Call::EstablishCis(pairs));
    }
    fn disconnect_cis(&self, cis_conn_hdl: u16, _reason: u8) {
        self.0.push(Call::DisconnectCis(cis_conn_hdl));
    }
    fn setup_iso_data_path(&self, cis_conn_hdl: u16, params: DataPathParameters) {
        self.0.push(Call::SetupDataPath(cis_conn_hdl, params.direction));
    }
    fn remove_iso_data_path(&self, cis_conn_hdl: u16, _directions: AudioDirections) {
        self.0.push(Call::RemoveDataPath(cis_conn_hdl));
    }
    fn read_iso_link_quality(&self, cis_conn_hdl: u16) {
        self.0.push(Call::ReadLinkQuality(cis_conn_hdl));
    }
    fn send_iso_data(&self, cis_conn_hdl: u16, data: &[u8]) {
        self.0.push(Call::IsoData(cis_conn_hdl, data.to_vec()));
    }
}

struct MockHal {
    log: Rc<Log>,
    direction: Direction,
    accept: Cell<bool>,
}

impl MockHal {
    fn new(log: Rc<Log>, direction: Direction) -> Self {
        Self { log, direction, accept: Cell::new(true) }
    }
}

impl AudioHalClient for MockHal {
    fn start(&self, config: &PcmConfiguration) -> bool {
        self.log.push(Call::HalStart(self.direction, *config));
        self.accept.get()
    }
    fn stop(&self) {
        self.log.push(Call::HalStop(self.direction));
    }
    fn send_data(&self, data: &[u8]) -> usize {
        self.log.push(Call::HalData(self.direction, data.len()));
        data.len()
    }
    fn confirm_streaming_request(&self) {
        self.log.push(Call::Confirm(self.direction));
    }
    fn cancel_streaming_request(&self) {
        self.log.push(Call::Cancel(self.direction));
    }
    fn update_remote_delay(&self, _delay_ms: u16) {
        self.log.push(Call::RemoteDelay(self.direction));
    }
    fn update_audio_config_to_hal(&self, config: &OffloadConfiguration) {
        self.log.push(Call::Offload(self.direction, config.clone()));
    }
}

struct MockCallbacks(Rc<Log>);

impl LeAudioCallbacks for MockCallbacks {
    fn on_connection_state(&self, state: ConnectionState, address: RawAddress) {
        self.0.push(Call::ConnectionState(address, state));
    }
    fn on_group_status(&self, group_id: i32, status: GroupStatus) {
        self.0.push(Call::GroupStatus(group_id, status));
    }
    fn on_group_stream_status(&self, group_id: i32, status: GroupStreamStatus) {
        self.0.push(Call::StreamStatus(group_id, status));
    }
    fn on_group_node_status(&self, address: RawAddress, group_id: i32, status: GroupNodeStatus) {
        self.0.push(Call::NodeStatus(address, group_id, status));
    }
    fn on_audio_conf(
        &self,
        directions: AudioDirections,
        group_id: i32,
        _sink_locations: AudioLocations,
        _source_locations: AudioLocations,
        available_contexts: AudioContexts,
    ) {
        self.0.push(Call::AudioConf(group_id, directions, available_contexts));
    }
    fn on_sink_audio_location_available(&self, address: RawAddress, locations: AudioLocations) {
        self.0.push(Call::SinkLocations(address, locations));
    }
}

/// Frames filled with the first sample of the channel.
struct FirstSampleEncoder;

impl Lc3Encoder for FirstSampleEncoder {
    fn encode(&mut self, pcm: &[i16], _stride: usize, output_len: usize) -> Vec<u8> {
        vec![pcm[0] as u8; output_len]
    }
}

struct FirstByteDecoder;

impl Lc3Decoder for FirstByteDecoder {
    fn decode(&mut self, frame: &[u8], samples: usize) -> Vec<i16> {
        vec![frame[0] as i16; samples]
    }
}

struct FakeLc3;

impl Lc3Factory for FakeLc3 {
    fn encoder(&self, _frame_duration_us: u32, _sample_rate_hz: u32) -> Box<dyn Lc3Encoder> {
        Box::new(FirstSampleEncoder)
    }
    fn decoder(&self, _frame_duration_us: u32, _sample_rate_hz: u32) -> Box<dyn Lc3Decoder> {
        Box::new(FirstByteDecoder)
    }
}

struct Harness {
    client: LeAudioClient,
    log: Rc<Log>,
    sink_hal: Rc<MockHal>,
}

fn harness_with(config: LeAudioConfig) -> Harness {
    init_logging();
    let log = Rc::new(Log::default());
    let sink_hal = Rc::new(MockHal::new(log.clone(), Direction::Sink));
    let interfaces = LeAudioInterfaces {
        gatt: Rc::new(MockGatt(log.clone())),
        iso: Rc::new(MockIso(log.clone())),
        callbacks: Rc::new(MockCallbacks(log.clone())),
        sink_hal: sink_hal.clone(),
        source_hal: Rc::new(MockHal::new(log.clone(), Direction::Source)),
        lc3: Rc::new(FakeLc3),
    };
    let client =
        LeAudioClient::new(config, interfaces, Box::new(ConfigurationTable::builtin()));
    Harness { client, log, sink_hal }
}

fn harness() -> Harness {
    harness_with(LeAudioConfig::default())
}

fn address(n: u8) -> RawAddress {
    RawAddress::new([0xc0, 0xde, 0xc0, 0xde, 0x00, n])
}

fn conn_id(n: u8) -> u16 {
    n as u16
}

fn handles() -> DeviceHandles {
    let hdl = |val_hdl| CharHandles { val_hdl, ccc_hdl: val_hdl + 1 };
    DeviceHandles {
        ctp: hdl(CTP),
        sink_pacs: vec![hdl(SINK_PAC)],
        source_pacs: vec![hdl(SOURCE_PAC)],
        sink_audio_locations: Some(hdl(SINK_LOCATIONS)),
        source_audio_locations: Some(hdl(SOURCE_LOCATIONS)),
        available_contexts: hdl(AVAILABLE_CONTEXTS),
        supported_contexts: hdl(SUPPORTED_CONTEXTS),
        sink_ases: vec![hdl(SINK_ASE), hdl(SINK_ASE_2)],
        source_ases: vec![hdl(SOURCE_ASE)],
    }
}

/// One LC3 record, 10 ms frames, mono, 40 to 120 octets.
fn pac_value(frequencies: u16) -> Vec<u8> {
    let mut caps = LtvMap::new();
    caps.insert(0x01, frequencies.to_le_bytes().to_vec());
    caps.insert(0x02, vec![0x02]);
    caps.insert(0x03, vec![0x01]);
    caps.insert(0x04, [40u16.to_le_bytes(), 120u16.to_le_bytes()].concat());
    caps.insert(0x05, vec![0x01]);
    let caps = caps.to_bytes();
    let mut value = vec![1, 0x06, 0x00, 0x00, 0x00, 0x00, caps.len() as u8];
    value.extend(caps);
    value.push(0);
    value
}

fn contexts() -> AudioContexts {
    AudioContexts::MEDIA
        | AudioContexts::CONVERSATIONAL
        | AudioContexts::NOTIFICATIONS
        | AudioContexts::SOUND_EFFECTS
}

fn contexts_value(contexts: AudioContexts) -> Vec<u8> {
    [contexts.bits().to_le_bytes(), contexts.bits().to_le_bytes()].concat()
}

/// Connects device `n` and answers every read of the connection setup.
fn connect_device(h: &mut Harness, n: u8, locations: AudioLocations) {
    connect_device_with(h, n, locations, 0x0084);
}

/// Same as [`connect_device`], with the sampling frequencies of the sink PAC record.
fn connect_device_with(h: &mut Harness, n: u8, locations: AudioLocations, sink_frequencies: u16) {
    let addr = address(n);
    h.client.connect(addr);
    h.client.on_gatt_connected(addr, 0, conn_id(n), 256, 0x0100 + n as u16);
    h.client.on_service_search_complete(conn_id(n), ServiceSearchResult::Found(handles()));
    let reads = [
        (SINK_PAC, pac_value(sink_frequencies)),
        (SOURCE_PAC, pac_value(0x0004)),
        (SINK_LOCATIONS, locations.bits().to_le_bytes().to_vec()),
        (SOURCE_LOCATIONS, locations.bits().to_le_bytes().to_vec()),
        (AVAILABLE_CONTEXTS, contexts_value(contexts())),
        (SUPPORTED_CONTEXTS, contexts_value(contexts())),
        (SINK_ASE, vec![1, 0]),
        (SINK_ASE_2, vec![2, 0]),
        (SOURCE_ASE, vec![3, 0]),
    ];
    for (handle, value) in reads {
        h.client.on_gatt_read_response(conn_id(n), 0, handle, &value);
    }
}

/// Two connected earbuds in `GROUP`, left first.
fn earbuds() -> Harness {
    earbuds_with(LeAudioConfig::default())
}

fn earbuds_with(config: LeAudioConfig) -> Harness {
    let mut h = harness_with(config);
    connect_device(&mut h, 1, AudioLocations::FRONT_LEFT);
    connect_device(&mut h, 2, AudioLocations::FRONT_RIGHT);
    h.client.group_add_node(GROUP, address(1)).unwrap();
    h.client.group_add_node(GROUP, address(2)).unwrap();
    h
}

fn notify(h: &mut Harness, n: u8, handle: u16, value: Vec<u8>) {
    h.client.on_gatt_notification(conn_id(n), handle, &value);
}

fn codec_configured(ase_id: u8) -> Vec<u8> {
    vec![
        ase_id, 0x01, // state
        0x00, 0x02, 0x02, 0x0a, 0x00, // framing, phy, retransmissions, latency
        0x40, 0x9c, 0x00, 0x40, 0x9c, 0x00, // presentation delay range
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // preferred range
        0x06, 0x00, 0x00, 0x00, 0x00, // LC3
        0x00, // codec configuration kept from the request
    ]
}

fn qos_configured(ase_id: u8) -> Vec<u8> {
    vec![
        ase_id, 0x02, CIG, 0x00, 0x10, 0x27, 0x00, 0x00, 0x02, 0x78, 0x00, 0x0d, 0x64, 0x00, 0x40,
        0x9c, 0x00,
    ]
}

fn transient(ase_id: u8, state: AseState) -> Vec<u8> {
    vec![ase_id, state as u8, CIG, 0x00, 0x00]
}

fn established(cis_conn_hdl: u16) -> CisEstablishedEvent {
    CisEstablishedEvent {
        status: 0,
        cig_id: CIG,
        cis_conn_hdl,
        transport_latency_c_to_p_us: 20000,
        transport_latency_p_to_c_us: 20000,
    }
}

fn cis_handles(members: &[u8]) -> Vec<u16> {
    (0..members.len() as u16).map(|i| 0x60 + i).collect()
}

/// Answers the remote and controller side of a sink stream start on the first sink ASE.
fn complete_sink_start(h: &mut Harness, members: &[u8]) {
    for n in members {
        notify(h, *n, SINK_ASE, codec_configured(1));
    }
    let cises = cis_handles(members);
    h.client.on_cig_create_complete(CIG, 0, cises.clone());
    for n in members {
        notify(h, *n, SINK_ASE, qos_configured(1));
    }
    for n in members {
        notify(h, *n, SINK_ASE, transient(1, AseState::Enabling));
    }
    for hdl in &cises {
        h.client.on_cis_established(established(*hdl));
        h.client.on_data_path_setup(CIG, *hdl, 0);
    }
    for n in members {
        notify(h, *n, SINK_ASE, transient(1, AseState::Streaming));
    }
}

/// Answers the remote side of a sink stream start up to Enabling, with the CIG created.
fn enable_sink(h: &mut Harness, members: &[u8]) {
    for n in members {
        notify(h, *n, SINK_ASE, codec_configured(1));
    }
    h.client.on_cig_create_complete(CIG, 0, cis_handles(members));
    for n in members {
        notify(h, *n, SINK_ASE, qos_configured(1));
    }
    for n in members {
        notify(h, *n, SINK_ASE, transient(1, AseState::Enabling));
    }
}

/// Answers the release of the first sink ASE down to the CIG removal.
fn complete_sink_release(h: &mut Harness, members: &[u8]) {
    for n in members {
        notify(h, *n, SINK_ASE, vec![1, AseState::Releasing as u8]);
    }
    for hdl in cis_handles(members) {
        h.client.on_cis_disconnected(CIG, hdl, 0x16);
    }
    for n in members {
        notify(h, *n, SINK_ASE, vec![1, AseState::Idle as u8]);
    }
    h.client.on_cig_remove_complete(CIG, 0);
}

fn group_state(h: &Harness) -> (AseState, AseState) {
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    (group.state(), group.target_state())
}

/// Active earbuds streaming media to the remote sinks.
fn streaming_earbuds_with(config: LeAudioConfig) -> Harness {
    let mut h = earbuds_with(config);
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    complete_sink_start(&mut h, &[1, 2]);
    assert_eq!(h.client.sender_state(), AudioState::Started);
    h.log.clear();
    h
}

fn streaming_earbuds() -> Harness {
    streaming_earbuds_with(LeAudioConfig::default())
}

#[tokio::test]
async fn connection_setup_reads_and_subscribes() {
    let mut h = harness();
    connect_device(&mut h, 1, AudioLocations::FRONT_LEFT);

    assert!(h.log.has(&Call::Open(address(1))));
    assert!(h.log.has(&Call::ConnectionState(address(1), ConnectionState::Connecting)));
    assert!(h.log.has(&Call::DiscoverServices(conn_id(1))));
    assert!(h.log.has(&Call::WriteDescriptor(conn_id(1), CTP + 1)));
    assert!(h.log.has(&Call::WriteDescriptor(conn_id(1), SINK_ASE + 1)));
    assert_eq!(h.log.count(|c| matches!(c, Call::Read(..))), 9);
    assert!(h.log.has(&Call::SinkLocations(address(1), AudioLocations::FRONT_LEFT)));
    assert!(h.log.has(&Call::ConnectionState(address(1), ConnectionState::Connected)));

    let device = h.client.devices().find_by_address(&address(1)).unwrap();
    assert!(device.is_connected());
    assert!(device.pending_reads.is_empty());
    assert_eq!(device.available_contexts.sink, contexts());
    assert_eq!(device.ases.iter().map(|a| a.id).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_connection_is_reported() {
    let mut h = harness();
    h.client.connect(address(1));
    h.client.on_gatt_connected(address(1), 0x3e, 0, 0, 0);

    assert!(h.log.has(&Call::ConnectionState(address(1), ConnectionState::Disconnected)));
    assert!(!h.client.devices().find_by_address(&address(1)).unwrap().is_connected());
}

#[tokio::test]
async fn service_without_ascs_is_dropped() {
    let mut h = harness();
    h.client.connect(address(1));
    h.client.on_gatt_connected(address(1), 0, conn_id(1), 256, 0x0101);
    h.client.on_service_search_complete(conn_id(1), ServiceSearchResult::NotFound);

    assert!(h.log.has(&Call::Close(conn_id(1))));
}

#[tokio::test]
async fn group_reports_audio_configuration() {
    let h = earbuds();

    assert!(h.log.has(&Call::NodeStatus(address(1), GROUP, GroupNodeStatus::Added)));
    assert!(h.log.has(&Call::NodeStatus(address(2), GROUP, GroupNodeStatus::Added)));
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert!(group.supported_contexts().contains(AudioContexts::MEDIA | AudioContexts::CONVERSATIONAL));
    assert!(h.log.has(&Call::AudioConf(GROUP, group.audio_directions, group.supported_contexts())));
}

#[tokio::test]
async fn stream_converges_only_when_every_device_reports() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();

    assert_eq!(h.client.sender_state(), AudioState::ReadyToStart);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_CONFIG_CODEC), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_CONFIG_CODEC), 1);
    assert_eq!(group_state(&h), (AseState::Idle, AseState::Streaming));
    assert!(h.client.state_machine().is_watchdog_armed(GROUP));

    notify(&mut h, 1, SINK_ASE, codec_configured(1));
    assert_eq!(group_state(&h).0, AseState::Idle);
    assert_eq!(h.log.count(|c| matches!(c, Call::CreateCig(..))), 0);

    notify(&mut h, 2, SINK_ASE, codec_configured(1));
    assert_eq!(group_state(&h).0, AseState::CodecConfigured);
    assert!(h.log.has(&Call::CreateCig(CIG, 2)));

    h.client.on_cig_create_complete(CIG, 0, vec![0x60, 0x61]);
    notify(&mut h, 1, SINK_ASE, qos_configured(1));
    assert_eq!(group_state(&h).0, AseState::CodecConfigured);
    notify(&mut h, 2, SINK_ASE, qos_configured(1));
    assert_eq!(group_state(&h).0, AseState::QosConfigured);

    notify(&mut h, 1, SINK_ASE, transient(1, AseState::Enabling));
    assert_eq!(h.log.count(|c| matches!(c, Call::EstablishCis(..))), 0);
    notify(&mut h, 2, SINK_ASE, transient(1, AseState::Enabling));
    assert_eq!(group_state(&h).0, AseState::Enabling);
    assert!(h.log.has(&Call::EstablishCis(vec![(0x60, 0x0101), (0x61, 0x0102)])));

    for hdl in [0x60, 0x61] {
        h.client.on_cis_established(established(hdl));
        assert!(h.log.has(&Call::SetupDataPath(hdl, Direction::Sink)));
        h.client.on_data_path_setup(CIG, hdl, 0);
    }
    notify(&mut h, 1, SINK_ASE, transient(1, AseState::Streaming));
    assert_eq!(group_state(&h).0, AseState::Enabling);
    assert!(!h.log.has(&Call::Confirm(Direction::Sink)));

    notify(&mut h, 2, SINK_ASE, transient(1, AseState::Streaming));
    assert_eq!(group_state(&h), (AseState::Streaming, AseState::Streaming));
    assert!(!h.client.state_machine().is_watchdog_armed(GROUP));
    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Streaming)));
    assert!(h.log.has(&Call::Confirm(Direction::Sink)));
    assert!(h.log.has(&Call::RemoteDelay(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::Started);
    assert_eq!(h.client.configuration_context_type(), LeAudioContextType::Media);
}

#[tokio::test]
async fn disconnection_mid_transition_releases_the_group() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    notify(&mut h, 1, SINK_ASE, codec_configured(1));

    h.client.on_gatt_disconnected(conn_id(2), 0x08);

    assert_eq!(group_state(&h).1, AseState::Idle);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert!(h.log.has(&Call::CleanPending(conn_id(2))));
    assert!(h.log.has(&Call::ConnectionState(address(2), ConnectionState::Disconnected)));
    assert!(!h.log.has(&Call::CreateCig(CIG, 2)));
}

#[tokio::test]
async fn source_data_is_encoded_per_cis() {
    let mut h = streaming_earbuds();
    // 10 ms of 48 kHz stereo, left samples 1 and right samples 2.
    let pcm: Vec<i16> = (0..960).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();
    let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();

    assert_eq!(h.client.on_local_audio_source_data(&bytes), bytes.len());
    assert!(h.log.has(&Call::IsoData(0x60, vec![1; 120])));
    assert!(h.log.has(&Call::IsoData(0x61, vec![2; 120])));
}

#[tokio::test]
async fn resume_while_streaming_skips_the_state_machine() {
    let mut h = streaming_earbuds();
    let _ = h.client.on_local_audio_source_suspend();
    assert_eq!(h.client.sender_state(), AudioState::ReadyToRelease);

    h.client.on_local_audio_source_resume();

    assert_eq!(h.client.sender_state(), AudioState::Started);
    assert!(h.log.has(&Call::Confirm(Direction::Sink)));
    assert!(h.log.ctp_writes(conn_id(1)).is_empty());
    assert!(h.log.ctp_writes(conn_id(2)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn suspend_keeps_the_stream_alive_then_releases() {
    let config = LeAudioConfig::default();
    let keep_alive = config.suspend_timeout();
    let mut h = streaming_earbuds_with(config);

    let done = h.client.on_local_audio_source_suspend();
    done.await.unwrap();

    tokio::time::sleep(keep_alive - Duration::from_millis(1)).await;
    h.client.drain();
    assert!(h.log.ctp_writes(conn_id(1)).is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    h.client.drain();
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);
    assert_eq!(h.client.sender_state(), AudioState::Releasing);

    complete_sink_release(&mut h, &[1, 2]);
    assert!(h.log.has(&Call::RemoveCig(CIG)));
    assert!(h.log.has(&Call::DisconnectCis(0x60)));
    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Idle)));
    assert_eq!(group_state(&h), (AseState::Idle, AseState::Idle));
    assert_eq!(h.client.sender_state(), AudioState::Idle);
}

#[tokio::test(start_paused = true)]
async fn restart_after_release_selects_the_same_configuration() {
    let config = LeAudioConfig::default();
    let keep_alive = config.suspend_timeout();
    let mut h = earbuds_with(config);
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    let first = h.log.ctp_writes(conn_id(1));
    let first_name = h.client.groups().find_by_id(GROUP).unwrap().get_active_configuration().unwrap().name.clone();
    complete_sink_start(&mut h, &[1, 2]);

    let _ = h.client.on_local_audio_source_suspend();
    tokio::time::sleep(keep_alive + Duration::from_millis(1)).await;
    h.client.drain();
    complete_sink_release(&mut h, &[1, 2]);
    assert_eq!(group_state(&h).0, AseState::Idle);

    h.log.clear();
    h.client.on_local_audio_source_resume();
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert_eq!(group.get_active_configuration().unwrap().name, first_name);
    assert_eq!(h.log.ctp_writes(conn_id(1)), first);
}

#[tokio::test(start_paused = true)]
async fn transition_timeout_drops_the_links() {
    let config = LeAudioConfig::default();
    let timeout = config.state_transition_timeout();
    let mut h = earbuds_with(config);
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();

    tokio::time::sleep(timeout + Duration::from_millis(1)).await;
    h.client.drain();

    assert!(h.log.has(&Call::DisconnectAcl(address(1))));
    assert!(h.log.has(&Call::DisconnectAcl(address(2))));
    assert!(h.log.has(&Call::Cancel(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::Idle);
    assert_eq!(group_state(&h).1, AseState::Idle);
}

#[tokio::test]
async fn invalid_cis_mapping_cancels_the_request() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();

    notify(&mut h, 1, CTP, vec![0x02, 0x01, 0x01, 0x09, 0x0a]);

    assert!(h.log.has(&Call::Cancel(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::Idle);
}

#[tokio::test]
async fn other_rejections_keep_the_request() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();

    notify(&mut h, 1, CTP, vec![0x02, 0x01, 0x01, 0x09, 0x01]);

    assert!(!h.log.has(&Call::Cancel(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::ReadyToStart);
}

#[tokio::test]
async fn only_one_group_is_active() {
    let mut h = streaming_earbuds();
    connect_device(&mut h, 3, AudioLocations::FRONT_LEFT);
    h.client.group_add_node(2, address(3)).unwrap();

    h.client.group_set_active(2).unwrap();

    assert_eq!(h.client.active_group_id(), 2);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);
    let inactive = h.log.position(&Call::GroupStatus(GROUP, GroupStatus::Inactive)).unwrap();
    let active = h.log.position(&Call::GroupStatus(2, GroupStatus::Active)).unwrap();
    assert!(inactive < active);
    let stopped = h.log.position(&Call::HalStop(Direction::Sink)).unwrap();
    let started = h
        .log
        .calls
        .borrow()
        .iter()
        .rposition(|c| matches!(c, Call::HalStart(Direction::Sink, _)))
        .unwrap();
    assert!(stopped < started);
    assert_eq!(h.client.sender_state(), AudioState::Idle);
    assert_eq!(group_state(&h).1, AseState::Idle);
}

#[tokio::test]
async fn refused_audio_session_keeps_the_group_inactive() {
    let mut h = earbuds();
    h.sink_hal.accept.set(false);

    assert!(matches!(h.client.group_set_active(GROUP), Err(Error::AudioSession(_))));
    assert_eq!(h.client.active_group_id(), GROUP_UNKNOWN);
    assert!(!h.log.has(&Call::GroupStatus(GROUP, GroupStatus::Active)));
}

#[tokio::test]
async fn disconnected_group_can_not_be_activated() {
    let mut h = harness();
    h.client.add_from_storage(address(1), GROUP, false).unwrap();

    assert!(matches!(h.client.group_set_active(GROUP), Err(Error::NotConnected(GROUP))));
    assert!(matches!(h.client.group_set_active(7), Err(Error::UnknownGroup(7))));
}

#[tokio::test]
async fn moving_the_last_member_destroys_the_group() {
    let mut h = earbuds();

    h.client.group_add_node(2, address(2)).unwrap();
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert_eq!(group.addresses(), &[address(1)]);
    assert_eq!(h.client.groups().find_by_id(2).unwrap().addresses(), &[address(2)]);
    assert_eq!(h.client.devices().find_by_address(&address(2)).unwrap().group_id, 2);
    assert!(h.log.has(&Call::NodeStatus(address(2), GROUP, GroupNodeStatus::Removed)));

    assert!(!h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Destroyed)));
    h.client.group_add_node(2, address(1)).unwrap();
    assert!(h.client.groups().find_by_id(GROUP).is_none());
    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Destroyed)));
    assert_eq!(h.client.groups().find_by_id(2).unwrap().addresses(), &[address(2), address(1)]);
}

#[tokio::test]
async fn removing_a_streaming_member_keeps_the_others() {
    let mut h = streaming_earbuds();

    h.client.group_remove_node(GROUP, address(2)).unwrap();

    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);
    assert!(h.log.has(&Call::NodeStatus(address(2), GROUP, GroupNodeStatus::Removed)));
    assert_eq!(h.client.devices().find_by_address(&address(2)).unwrap().group_id, GROUP_UNKNOWN);
    assert_eq!(group_state(&h), (AseState::Streaming, AseState::Streaming));
}

#[tokio::test]
async fn moving_a_streaming_member_releases_it() {
    let mut h = streaming_earbuds();

    h.client.group_add_node(2, address(2)).unwrap();

    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 0);
    let removed = h.log.position(&Call::RemoveDataPath(0x61)).unwrap();
    let disconnected = h.log.position(&Call::DisconnectCis(0x61)).unwrap();
    assert!(removed < disconnected);
    let device = h.client.devices().find_by_address(&address(2)).unwrap();
    assert_eq!(device.group_id, 2);
    assert_eq!(device.active_ases().count(), 0);
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert_eq!(group.addresses(), &[address(1)]);
    assert!(group.cig.cises.iter().all(|c| c.addr != address(2)));
    assert_eq!(group.stream_conf.sink.streams, vec![(0x60, AudioLocations::FRONT_LEFT)]);
    assert_eq!(group_state(&h), (AseState::Streaming, AseState::Streaming));
    assert!(h.log.has(&Call::NodeStatus(address(2), 2, GroupNodeStatus::Added)));
}

#[tokio::test]
async fn cig_creation_failure_releases_the_group() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    notify(&mut h, 1, SINK_ASE, codec_configured(1));
    notify(&mut h, 2, SINK_ASE, codec_configured(1));
    assert!(h.log.has(&Call::CreateCig(CIG, 2)));
    h.log.clear();

    h.client.on_cig_create_complete(CIG, 0x1f, Vec::new());

    assert_eq!(h.client.groups().find_by_id(GROUP).unwrap().cig.state, CigState::None);
    assert!(h.log.has(&Call::Cancel(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::Idle);
    assert_eq!(group_state(&h).1, AseState::Idle);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);
    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Releasing)));

    for n in [1, 2] {
        notify(&mut h, n, SINK_ASE, vec![1, AseState::Releasing as u8]);
    }
    for n in [1, 2] {
        notify(&mut h, n, SINK_ASE, vec![1, AseState::Idle as u8]);
    }

    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Idle)));
    assert_eq!(group_state(&h), (AseState::Idle, AseState::Idle));
    assert!(!h.client.state_machine().is_watchdog_armed(GROUP));
    assert!(!h.log.has(&Call::RemoveCig(CIG)));
    assert_eq!(h.log.count(|c| matches!(c, Call::EstablishCis(..))), 0);
    // Not restarted.
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_CONFIG_CODEC), 0);
    assert_eq!(h.client.sender_state(), AudioState::Idle);
}

#[tokio::test]
async fn cis_failure_releases_the_group() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    enable_sink(&mut h, &[1, 2]);
    assert!(h.log.has(&Call::EstablishCis(vec![(0x60, 0x0101), (0x61, 0x0102)])));
    h.log.clear();

    h.client.on_cis_established(CisEstablishedEvent { status: 0x3e, ..established(0x60) });

    assert!(h.log.has(&Call::Cancel(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::Idle);
    assert_eq!(group_state(&h).1, AseState::Idle);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);
    assert!(!h.log.has(&Call::SetupDataPath(0x60, Direction::Sink)));

    // The other CIS still comes up and is torn down right away.
    h.client.on_cis_established(established(0x61));
    assert!(h.log.has(&Call::DisconnectCis(0x61)));
    assert!(!h.log.has(&Call::SetupDataPath(0x61, Direction::Sink)));

    complete_sink_release(&mut h, &[1, 2]);

    assert!(h.log.has(&Call::RemoveCig(CIG)));
    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Idle)));
    assert_eq!(group_state(&h), (AseState::Idle, AseState::Idle));
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_CONFIG_CODEC), 0);
}

#[tokio::test]
async fn data_path_failure_releases_the_group() {
    let mut h = earbuds();
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    enable_sink(&mut h, &[1, 2]);
    for hdl in [0x60, 0x61] {
        h.client.on_cis_established(established(hdl));
        assert!(h.log.has(&Call::SetupDataPath(hdl, Direction::Sink)));
    }
    h.log.clear();

    h.client.on_data_path_setup(CIG, 0x60, 0x01);

    assert!(h.log.has(&Call::Cancel(Direction::Sink)));
    assert_eq!(h.client.sender_state(), AudioState::Idle);
    assert_eq!(group_state(&h).1, AseState::Idle);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_RELEASE), 1);

    complete_sink_release(&mut h, &[1, 2]);

    assert!(h.log.has(&Call::DisconnectCis(0x60)));
    assert!(h.log.has(&Call::DisconnectCis(0x61)));
    assert!(h.log.has(&Call::RemoveCig(CIG)));
    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Idle)));
    assert_eq!(group_state(&h), (AseState::Idle, AseState::Idle));
    assert!(!h.log.has(&Call::Confirm(Direction::Sink)));
}

#[tokio::test]
async fn reconnected_member_joins_the_stream() {
    let mut h = streaming_earbuds();
    h.client.on_gatt_disconnected(conn_id(2), 0x08);
    assert_eq!(group_state(&h), (AseState::Streaming, AseState::Streaming));
    h.log.clear();

    connect_device(&mut h, 2, AudioLocations::FRONT_RIGHT);

    assert!(h.log.ctp_writes(conn_id(1)).is_empty());
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_CONFIG_CODEC), 1);
    let device = h.client.devices().find_by_address(&address(2)).unwrap();
    let active: Vec<_> = device.active_ases().map(|a| (a.id, a.cis_conn_hdl)).collect();
    assert_eq!(active, vec![(1, 0x61)]);

    notify(&mut h, 2, SINK_ASE, codec_configured(1));
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_CONFIG_QOS), 1);
    notify(&mut h, 2, SINK_ASE, qos_configured(1));
    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_ENABLE), 1);
    notify(&mut h, 2, SINK_ASE, transient(1, AseState::Enabling));
    assert!(h.log.has(&Call::EstablishCis(vec![(0x61, 0x0102)])));

    h.client.on_cis_established(established(0x61));
    assert!(h.log.has(&Call::SetupDataPath(0x61, Direction::Sink)));
    h.client.on_data_path_setup(CIG, 0x61, 0);
    notify(&mut h, 2, SINK_ASE, transient(1, AseState::Streaming));

    assert!(h.log.ctp_writes(conn_id(1)).is_empty());
    assert_eq!(group_state(&h), (AseState::Streaming, AseState::Streaming));
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert_eq!(
        group.stream_conf.sink.streams,
        vec![(0x60, AudioLocations::FRONT_LEFT), (0x61, AudioLocations::FRONT_RIGHT)]
    );
}

#[tokio::test]
async fn incompatible_member_reconfigures_the_group() {
    let mut h = streaming_earbuds();
    h.client.on_gatt_disconnected(conn_id(2), 0x08);
    h.log.clear();

    // 16 kHz only sink.
    connect_device_with(&mut h, 2, AudioLocations::FRONT_RIGHT, 0x0004);

    assert_eq!(h.log.ctp_opcode_count(conn_id(2), OP_CONFIG_CODEC), 0);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert!(h.client.groups().find_by_id(GROUP).unwrap().is_pending_configuration());
    assert_eq!(group_state(&h).1, AseState::Idle);

    complete_sink_release(&mut h, &[1]);

    assert!(h.log.has(&Call::StreamStatus(GROUP, GroupStreamStatus::Idle)));
    assert!(!h.client.groups().find_by_id(GROUP).unwrap().is_pending_configuration());
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_CONFIG_CODEC), 1);
    assert_eq!(group_state(&h).1, AseState::Streaming);
}

#[tokio::test]
async fn disconnecting_one_earbud_keeps_the_stream() {
    let mut h = streaming_earbuds();

    h.client.disconnect(address(2));
    assert!(h.log.has(&Call::ConnectionState(address(2), ConnectionState::Disconnecting)));
    assert!(h.log.has(&Call::Close(conn_id(2))));
    h.client.on_gatt_disconnected(conn_id(2), 0x16);

    assert_eq!(group_state(&h), (AseState::Streaming, AseState::Streaming));
    assert_eq!(h.client.sender_state(), AudioState::Started);
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert_eq!(group.stream_conf.sink.streams, vec![(0x60, AudioLocations::FRONT_LEFT)]);
}

#[tokio::test]
async fn removed_device_is_forgotten_once_disconnected() {
    let mut h = earbuds();

    h.client.remove_device(address(2)).unwrap();
    assert!(h.log.has(&Call::Close(conn_id(2))));
    assert!(h.client.devices().find_by_address(&address(2)).is_some());

    h.client.on_gatt_disconnected(conn_id(2), 0x16);
    assert!(h.client.devices().find_by_address(&address(2)).is_none());
    assert_eq!(h.client.groups().find_by_id(GROUP).unwrap().addresses(), &[address(1)]);
    assert!(matches!(h.client.remove_device(address(2)), Err(Error::UnknownDevice(_))));
}

#[tokio::test]
async fn autoconnect_reopens_after_link_loss() {
    let mut h = harness();
    h.client.add_from_storage(address(1), GROUP, true).unwrap();
    assert!(h.log.has(&Call::Open(address(1))));
    h.client.on_gatt_connected(address(1), 0, conn_id(1), 256, 0x0101);
    h.log.clear();

    h.client.on_gatt_disconnected(conn_id(1), 0x08);

    assert!(h.log.has(&Call::Open(address(1))));
}

#[tokio::test]
async fn metadata_update_keeps_the_configuration() {
    let mut h = streaming_earbuds();

    h.client.on_local_audio_source_metadata_update(AudioContexts::MEDIA | AudioContexts::NOTIFICATIONS);

    assert_eq!(h.client.configuration_context_type(), LeAudioContextType::Media);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_UPDATE_METADATA), 1);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 0);
}

#[tokio::test]
async fn suppressed_context_does_not_reconfigure() {
    let mut h = streaming_earbuds();

    h.client.on_local_audio_source_metadata_update(AudioContexts::SOUND_EFFECTS);

    assert_eq!(h.client.configuration_context_type(), LeAudioContextType::Media);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 0);
}

#[tokio::test]
async fn call_reconfigures_the_stream() {
    let mut h = streaming_earbuds();

    h.client.set_in_call(true);

    assert_eq!(h.client.configuration_context_type(), LeAudioContextType::Conversational);
    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_RELEASE), 1);
    assert!(h.client.groups().find_by_id(GROUP).unwrap().is_pending_configuration());

    complete_sink_release(&mut h, &[1, 2]);

    assert_eq!(h.log.ctp_opcode_count(conn_id(1), OP_CONFIG_CODEC), 1);
    assert_eq!(group_state(&h), (AseState::Idle, AseState::Streaming));
    assert_eq!(h.client.sender_state(), AudioState::Started);
    let group = h.client.groups().find_by_id(GROUP).unwrap();
    assert!(!group.is_pending_configuration());
    assert!(group.get_active_configuration().unwrap().has_direction(Direction::Source));
}

#[tokio::test]
async fn offloaded_codec_gets_the_cis_allocation() {
    let config = LeAudioConfig { codec_location: CodecLocation::Adsp, ..Default::default() };
    let mut h = earbuds_with(config);
    h.client.group_set_active(GROUP).unwrap();
    h.client.on_local_audio_source_resume();
    complete_sink_start(&mut h, &[1, 2]);

    let offloads: Vec<OffloadConfiguration> = h
        .log
        .calls
        .borrow()
        .iter()
        .filter_map(|c| match c {
            Call::Offload(Direction::Sink, config) => Some(config.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(offloads.len(), 1);
    assert_eq!(
        offloads[0].streams,
        vec![(0x60, AudioLocations::FRONT_LEFT), (0x61, AudioLocations::FRONT_RIGHT)]
    );
    assert_eq!(offloads[0].sample_rate_hz, 48000);
    assert_eq!(offloads[0].octets_per_codec_frame, 120);
    assert_eq!(h.client.on_local_audio_source_data(&[0; 1920]), 0);
}

#[tokio::test]
async fn link_quality_is_read_on_every_cis() {
    let h = streaming_earbuds();

    h.client.read_link_quality();

    assert!(h.log.has(&Call::ReadLinkQuality(0x60)));
    assert!(h.log.has(&Call::ReadLinkQuality(0x61)));
}

#[tokio::test]
async fn cleanup_releases_everything() {
    let mut h = streaming_earbuds();

    h.client.cleanup();

    assert!(h.log.has(&Call::GroupStatus(GROUP, GroupStatus::Inactive)));
    assert!(h.log.has(&Call::Close(conn_id(1))));
    assert!(h.log.has(&Call::Close(conn_id(2))));
    assert_eq!(h.client.devices().size(), 0);
    assert!(h.client.groups().find_by_id(GROUP).is_none());
}
