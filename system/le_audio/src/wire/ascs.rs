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


//! Audio Stream Control Service: ASE characteristic values and the ASE Control Point.

use super::ltv::LtvMap;
use super::reader::{Read, Reader};
use super::writer::{Write, Writer};
use crate::types::{
    AseQosConfig, AseQosPreferences, AseState, CodecId, CodecSpecificConfig, StreamMetadata,
};
use num_traits::FromPrimitive;

/// ASE Control Point opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum CtpOpcode {
    ConfigCodec = 0x01,
    ConfigQos = 0x02,
    Enable = 0x03,
    ReceiverStartReady = 0x04,
    Disable = 0x05,
    ReceiverStopReady = 0x06,
    UpdateMetadata = 0x07,
    Release = 0x08,
}

/// ASE Control Point response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum CtpResponseCode {
    Success = 0x00,
    UnsupportedOpcode = 0x01,
    InvalidLength = 0x02,
    InvalidAseId = 0x03,
    InvalidAseStateMachineTransition = 0x04,
    InvalidAseDirection = 0x05,
    UnsupportedAudioCapabilities = 0x06,
    UnsupportedConfigurationParameterValue = 0x07,
    RejectedConfigurationParameterValue = 0x08,
    InvalidConfigurationParameterValue = 0x09,
    UnsupportedMetadata = 0x0a,
    RejectedMetadata = 0x0b,
    InvalidMetadata = 0x0c,
    InsufficientResources = 0x0d,
    UnspecifiedError = 0x0e,
}

/// Reason of a configuration parameter rejection
pub const CTP_REASON_INVALID_ASE_CIS_MAPPING: u8 = 0x0a;

/// Target PHY written in Codec Configuration requests, LE 2M
pub const TARGET_PHY_2M: u8 = 0x02;

impl Read for CodecId {
    fn read(r: &mut Reader) -> Option<Self> {
        Some(Self {
            coding_format: r.read_u8()?,
            vendor_company_id: r.read_u16()?,
            vendor_codec_id: r.read_u16()?,
        })
    }
}

impl Write for CodecId {
    fn write(&self, w: &mut Writer) {
        w.write_u8(self.coding_format);
        w.write_u16(self.vendor_company_id);
        w.write_u16(self.vendor_codec_id);
    }
}

/// State specific parameters of an ASE characteristic value
#[derive(Debug, Clone, PartialEq)]
pub enum AseStatusParams {
    None,
    CodecConfigured {
        qos_preferences: AseQosPreferences,
        codec_id: CodecId,
        codec_config: Option<CodecSpecificConfig>,
    },
    QosConfigured(AseQosConfig),
    /// Enabling, Streaming and Disabling states
    Transient { cig_id: u8, cis_id: u8, metadata: StreamMetadata },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AseStatus {
    pub ase_id: u8,
    pub state: AseState,
    pub params: AseStatusParams,
}

impl Read for AseStatus {
    fn read(r: &mut Reader) -> Option<Self> {
        let ase_id = r.read_u8()?;
        let state = AseState::from_u8(r.read_u8()?)?;
        let params = match state {
            AseState::Idle | AseState::Releasing => AseStatusParams::None,
            AseState::CodecConfigured => {
                let qos_preferences = AseQosPreferences {
                    supported_framing: r.read_u8()?,
                    preferred_phy: r.read_u8()?,
                    preferred_retrans_nb: r.read_u8()?,
                    max_transport_latency: r.read_u16()?,
                    pres_delay_min: r.read_u32::<3>()?,
                    pres_delay_max: r.read_u32::<3>()?,
                    preferred_pres_delay_min: r.read_u32::<3>()?,
                    preferred_pres_delay_max: r.read_u32::<3>()?,
                };
                let codec_id = r.read()?;
                let codec_config = CodecSpecificConfig::from_ltv(&LtvMap::parse(
                    &r.read::<Vec<u8>>()?,
                )?);
                AseStatusParams::CodecConfigured { qos_preferences, codec_id, codec_config }
            }
            AseState::QosConfigured => AseStatusParams::QosConfigured(AseQosConfig {
                cig_id: r.read_u8()?,
                cis_id: r.read_u8()?,
                sdu_interval_us: r.read_u32::<3>()?,
                framing: r.read_u8()?,
                phy: r.read_u8()?,
                max_sdu_size: r.read_u16()?,
                retrans_nb: r.read_u8()?,
                max_transport_latency: r.read_u16()?,
                presentation_delay_us: r.read_u32::<3>()?,
            }),
            AseState::Enabling | AseState::Streaming | AseState::Disabling => {
                AseStatusParams::Transient {
                    cig_id: r.read_u8()?,
                    cis_id: r.read_u8()?,
                    metadata: StreamMetadata::from_ltv(&LtvMap::parse(&r.read::<Vec<u8>>()?)?),
                }
            }
        };
        Some(Self { ase_id, state, params })
    }
}

/// Decodes the value of an ASE characteristic.
pub fn parse_ase_status(value: &[u8]) -> Option<AseStatus> {
    Reader::new(value).read()
}

/// Per ASE entry of a Control Point notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtpAseResponse {
    pub ase_id: u8,
    pub response_code: CtpResponseCode,
    pub reason: u8,
}

impl Read for CtpAseResponse {
    fn read(r: &mut Reader) -> Option<Self> {
        Some(Self {
            ase_id: r.read_u8()?,
            response_code: CtpResponseCode::from_u8(r.read_u8()?)?,
            reason: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtpNotification {
    pub opcode: u8,
    pub entries: Vec<CtpAseResponse>,
}

/// Decodes an ASE Control Point notification. A count of 0xff is sent by servers rejecting the
/// whole operation, it is followed by a single entry.
pub fn parse_ctp_notification(value: &[u8]) -> Option<CtpNotification> {
    let mut r = Reader::new(value);
    let opcode = r.read_u8()?;
    let num_ases = match r.read_u8()? {
        0xff => 1,
        n => n,
    };
    let entries: Vec<CtpAseResponse> = (0..num_ases).map_while(|_| r.read()).collect();
    if entries.len() != num_ases as usize {
        return None;
    }
    Some(CtpNotification { opcode, entries })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfigRequest {
    pub ase_id: u8,
    pub target_latency: u8,
    pub target_phy: u8,
    pub codec_id: CodecId,
    pub codec_config: CodecSpecificConfig,
}

impl Write for CodecConfigRequest {
    fn write(&self, w: &mut Writer) {
        w.write_u8(self.ase_id);
        w.write_u8(self.target_latency);
        w.write_u8(self.target_phy);
        w.write(&self.codec_id);
        w.write(&self.codec_config.to_ltv().to_bytes());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QosConfigRequest {
    pub ase_id: u8,
    pub qos: AseQosConfig,
}

impl Write for QosConfigRequest {
    fn write(&self, w: &mut Writer) {
        w.write_u8(self.ase_id);
        w.write_u8(self.qos.cig_id);
        w.write_u8(self.qos.cis_id);
        w.write_u32::<3>(self.qos.sdu_interval_us);
        w.write_u8(self.qos.framing);
        w.write_u8(self.qos.phy);
        w.write_u16(self.qos.max_sdu_size);
        w.write_u8(self.qos.retrans_nb);
        w.write_u16(self.qos.max_transport_latency);
        w.write_u32::<3>(self.qos.presentation_delay_us);
    }
}

/// Enable and Update Metadata entry
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRequest {
    pub ase_id: u8,
    pub metadata: StreamMetadata,
}

impl Write for MetadataRequest {
    fn write(&self, w: &mut Writer) {
        w.write_u8(self.ase_id);
        w.write(&self.metadata.to_ltv().to_bytes());
    }
}

struct AseId(u8);

impl Write for AseId {
    fn write(&self, w: &mut Writer) {
        w.write_u8(self.0);
    }
}

fn prepare<T: Write>(opcode: CtpOpcode, entries: Vec<T>) -> Vec<u8> {
    let mut w = Writer::new(vec![opcode as u8]);
    w.write(&entries);
    w.into_vec()
}

pub fn prepare_codec_config(requests: Vec<CodecConfigRequest>) -> Vec<u8> {
    prepare(CtpOpcode::ConfigCodec, requests)
}

pub fn prepare_qos_config(requests: Vec<QosConfigRequest>) -> Vec<u8> {
    prepare(CtpOpcode::ConfigQos, requests)
}

pub fn prepare_enable(requests: Vec<MetadataRequest>) -> Vec<u8> {
    prepare(CtpOpcode::Enable, requests)
}

pub fn prepare_update_metadata(requests: Vec<MetadataRequest>) -> Vec<u8> {
    prepare(CtpOpcode::UpdateMetadata, requests)
}

/// Builds the operations which only carry ASE ids: Receiver Start Ready, Disable, Receiver Stop
/// Ready and Release.
pub fn prepare_ase_ids(opcode: CtpOpcode, ase_ids: &[u8]) -> Vec<u8> {
    debug_assert!(matches!(
        opcode,
        CtpOpcode::ReceiverStartReady
            | CtpOpcode::Disable
            | CtpOpcode::ReceiverStopReady
            | CtpOpcode::Release
    ));
    prepare(opcode, ase_ids.iter().map(|id| AseId(*id)).collect())
}
