//! Common External Message Interface (cEMI) codec.
//!
//! cEMI is the neutral Layer-2 frame format carried inside every KNXnet/IP
//! service and every USB transfer frame:
//!
//! ```text
//! msg code (1) | add info len (1) | add info (n) | service information
//! ```
//!
//! For `L_Data` frames the service information is:
//!
//! ```text
//! CTRL1 | [CTRL2] | source (2) | destination (2) | length | TPCI/APCI + data
//! ```
//!
//! Standard frames (CTRL1 top bit set) merge CTRL2's upper nibble with the
//! 4-bit length field into one octet; extended frames carry a separate CTRL2
//! octet and a full-width length. All accessors read the merged octet for
//! standard frames so hop count, group bit and length always agree.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::addr::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};

/// cEMI message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum MessageCode {
    LRawReq = 0x10,
    LDataReq = 0x11,
    LPollDataReq = 0x13,
    LPollDataCon = 0x25,
    LDataInd = 0x29,
    LBusmonInd = 0x2B,
    LRawInd = 0x2D,
    LDataCon = 0x2E,
    LRawCon = 0x2F,
    MPropWriteCon = 0xF5,
    MPropWriteReq = 0xF6,
    MPropInfoInd = 0xF7,
    MResetInd = 0xF0,
    MResetReq = 0xF1,
    MPropReadCon = 0xFB,
    MPropReadReq = 0xFC,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl MessageCode {
    /// Standard notation, e.g. `L_Data.ind`.
    pub fn name(self) -> &'static str {
        match self {
            Self::LRawReq => "L_Raw.req",
            Self::LDataReq => "L_Data.req",
            Self::LPollDataReq => "L_PollData.req",
            Self::LPollDataCon => "L_PollData.con",
            Self::LDataInd => "L_Data.ind",
            Self::LBusmonInd => "L_Busmon.ind",
            Self::LRawInd => "L_Raw.ind",
            Self::LDataCon => "L_Data.con",
            Self::LRawCon => "L_Raw.con",
            Self::MPropWriteCon => "M_PropWrite.con",
            Self::MPropWriteReq => "M_PropWrite.req",
            Self::MPropInfoInd => "M_PropInfo.ind",
            Self::MResetInd => "M_Reset.ind",
            Self::MResetReq => "M_Reset.req",
            Self::MPropReadCon => "M_PropRead.con",
            Self::MPropReadReq => "M_PropRead.req",
            Self::Unknown(_) => "unknown",
        }
    }

    pub fn is_ldata(self) -> bool {
        matches!(self, Self::LDataReq | Self::LDataInd | Self::LDataCon)
    }

    pub fn is_property(self) -> bool {
        matches!(
            self,
            Self::MPropReadReq
                | Self::MPropReadCon
                | Self::MPropWriteReq
                | Self::MPropWriteCon
                | Self::MPropInfoInd
        )
    }
}

/// KNX transmission priority, two bits inside CTRL1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    System = 0b00,
    #[default]
    Normal = 0b01,
    Urgent = 0b10,
    Low = 0b11,
}

impl Priority {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::Normal => "normal",
            Self::Urgent => "urgent",
            Self::Low => "low",
        };
        f.write_str(name)
    }
}

/// Control field 1 of an `L_Data` frame.
///
/// Bit 7 is the frame-type flag: set for standard frames, clear for
/// extended frames.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control1 {
    pub confirm_error: bool,
    pub ack_requested: bool,
    pub priority: B2,
    pub broadcast: bool,
    pub repeat_suppressed: bool,
    #[skip]
    unused: bool,
    pub standard_frame: bool,
}

/// Control field 2 of an `L_Data` frame: group bit, hop count, extended
/// frame format. In standard frames only the upper nibble exists on the
/// wire.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control2 {
    pub format: B4,
    pub hop_count: B3,
    pub group_address: bool,
}

/// One entry of the additional-information block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalInfo {
    pub kind: u8,
    pub data: Vec<u8>,
}

/// Parse the additional-information block into its `{type, len, data}`
/// entries. A malformed block (entry overrunning the declared length) is
/// reported as empty rather than failing the whole frame; the service
/// information that follows it stays addressable either way.
fn parse_additional_info(block: &[u8]) -> Vec<AdditionalInfo> {
    let mut entries = Vec::new();
    let mut at = 0;
    while at < block.len() {
        if at + 2 > block.len() {
            return Vec::new();
        }
        let kind = block[at];
        let len = block[at + 1] as usize;
        if at + 2 + len > block.len() {
            return Vec::new();
        }
        entries.push(AdditionalInfo {
            kind,
            data: block[at + 2..at + 2 + len].to_vec(),
        });
        at += 2 + len;
    }
    entries
}

/// `L_Data` service information.
#[derive(Debug, Clone, PartialEq)]
pub struct LData {
    pub ctrl1: Control1,
    pub ctrl2: Control2,
    pub source: IndividualAddress,
    /// Raw destination; interpretation depends on the CTRL2 group bit.
    pub destination: u16,
    /// Value of the wire length field (application payload octet count).
    pub data_len: u8,
    /// TPCI/APCI octets followed by the application payload, verbatim.
    pub transport: Bytes,
}

impl LData {
    pub fn new(
        priority: Priority,
        hop_count: u8,
        source: IndividualAddress,
        destination: u16,
        group: bool,
        transport: impl Into<Bytes>,
    ) -> Self {
        let transport = transport.into();
        Self {
            ctrl1: Control1::new()
                .with_standard_frame(true)
                .with_broadcast(true)
                .with_priority(priority.bits()),
            ctrl2: Control2::new()
                .with_group_address(group)
                .with_hop_count(hop_count & 0x07)
                .with_format(0),
            source,
            destination,
            data_len: transport.len() as u8,
            transport,
        }
    }

    fn parse(service: &[u8]) -> Result<Self> {
        if service.len() < 6 {
            return Err(KnxError::BadCemi("L_Data service information too short"));
        }
        let ctrl1 = Control1::from_bytes([service[0]]);
        if ctrl1.standard_frame() {
            let merged = service[5];
            Ok(Self {
                ctrl1,
                ctrl2: Control2::from_bytes([merged & 0xF0]),
                source: IndividualAddress::from(u16::from_be_bytes([service[1], service[2]])),
                destination: u16::from_be_bytes([service[3], service[4]]),
                data_len: merged & 0x0F,
                transport: Bytes::copy_from_slice(&service[6..]),
            })
        } else {
            if service.len() < 7 {
                return Err(KnxError::BadCemi("extended L_Data service information too short"));
            }
            Ok(Self {
                ctrl1,
                ctrl2: Control2::from_bytes([service[1]]),
                source: IndividualAddress::from(u16::from_be_bytes([service[2], service[3]])),
                destination: u16::from_be_bytes([service[4], service[5]]),
                data_len: service[6],
                transport: Bytes::copy_from_slice(&service[7..]),
            })
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ctrl1.into_bytes()[0]);
        if self.ctrl1.standard_frame() {
            buf.put_u16(self.source.raw());
            buf.put_u16(self.destination);
            buf.put_u8((self.ctrl2.into_bytes()[0] & 0xF0) | (self.data_len & 0x0F));
        } else {
            buf.put_u8(self.ctrl2.into_bytes()[0]);
            buf.put_u16(self.source.raw());
            buf.put_u16(self.destination);
            buf.put_u8(self.data_len);
        }
        buf.put_slice(&self.transport);
    }

    pub fn priority_level(&self) -> Priority {
        Priority::from_bits(self.ctrl1.priority())
    }

    pub fn hop_count(&self) -> u8 {
        self.ctrl2.hop_count()
    }

    pub fn is_group_address(&self) -> bool {
        self.ctrl2.group_address()
    }

    pub fn destination_group(&self) -> Option<GroupAddress> {
        self.is_group_address()
            .then(|| GroupAddress::from(self.destination))
    }

    pub fn destination_individual(&self) -> Option<IndividualAddress> {
        (!self.is_group_address()).then(|| IndividualAddress::from(self.destination))
    }

    /// TPCI: top six bits of the first transport octet.
    pub fn tpci(&self) -> u8 {
        self.transport.first().map_or(0, |b| b & 0xFC)
    }

    /// Ten-bit APCI: low two bits of the first transport octet followed by
    /// the second octet. Zero when the frame carries fewer than two
    /// transport octets.
    pub fn apci(&self) -> u16 {
        if self.transport.len() >= 2 {
            (u16::from(self.transport[0] & 0x03) << 8) | u16::from(self.transport[1])
        } else {
            0
        }
    }

    /// Application payload after the TPCI/APCI octets.
    pub fn application_data(&self) -> &[u8] {
        if self.transport.len() > 2 {
            &self.transport[2..]
        } else {
            &[]
        }
    }
}

/// Interface-object property service (`M_PropRead`/`M_PropWrite` bodies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyFrame {
    pub object_type: u16,
    pub object_instance: u8,
    pub property_id: u8,
    /// Number of elements, four bits. Zero in a `.con` marks an error
    /// response whose first data byte is the return code.
    pub count: u8,
    /// Start index, twelve bits.
    pub start_index: u16,
    pub data: Vec<u8>,
}

impl PropertyFrame {
    pub fn new(
        object_type: u16,
        object_instance: u8,
        property_id: u8,
        count: u8,
        start_index: u16,
        data: Vec<u8>,
    ) -> Self {
        Self {
            object_type,
            object_instance,
            property_id,
            count: count & 0x0F,
            start_index: start_index & 0x0FFF,
            data,
        }
    }

    fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 6 {
            return Err(KnxError::BadCemi("property frame too short"));
        }
        let packed = u16::from_be_bytes([body[4], body[5]]);
        Ok(Self {
            object_type: u16::from_be_bytes([body[0], body[1]]),
            object_instance: body[2],
            property_id: body[3],
            count: (packed >> 12) as u8,
            start_index: packed & 0x0FFF,
            data: body[6..].to_vec(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.object_type);
        buf.put_u8(self.object_instance);
        buf.put_u8(self.property_id);
        buf.put_u16((u16::from(self.count & 0x0F) << 12) | (self.start_index & 0x0FFF));
        buf.put_slice(&self.data);
    }

    /// Correlation key for matching a `.con` against its request.
    pub fn key(&self) -> (u16, u8, u8, u16) {
        (
            self.object_type,
            self.object_instance,
            self.property_id,
            self.start_index,
        )
    }

    pub fn is_error_response(&self) -> bool {
        self.count == 0
    }

    pub fn return_code(&self) -> Option<u8> {
        self.is_error_response()
            .then(|| self.data.first().copied())
            .flatten()
    }
}

/// Service information variants carried by a cEMI frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CemiService {
    LData(LData),
    Property(PropertyFrame),
    /// Busmonitor, raw and poll services: payload kept verbatim.
    Raw(Bytes),
    Empty,
}

/// A parsed cEMI frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CemiFrame {
    pub code: MessageCode,
    pub additional_info: Vec<AdditionalInfo>,
    pub service: CemiService,
}

impl CemiFrame {
    /// Message code plus additional-info length octet.
    pub const MIN_SIZE: usize = 2;

    /// Parse a frame. Only buffers shorter than two octets are rejected
    /// outright; everything else parses and is graded by [`is_valid`].
    ///
    /// An additional-info length that overruns the buffer is treated as an
    /// empty info block with no service information, not as a hard error.
    ///
    /// [`is_valid`]: CemiFrame::is_valid
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(KnxError::BadCemi("frame shorter than two octets"));
        }
        let code = MessageCode::from_primitive(data[0]);
        let info_len = data[1] as usize;
        let (additional_info, service_bytes) = if 2 + info_len <= data.len() {
            (
                parse_additional_info(&data[2..2 + info_len]),
                &data[2 + info_len..],
            )
        } else {
            (Vec::new(), &[][..])
        };

        let service = match code {
            MessageCode::LDataReq | MessageCode::LDataInd | MessageCode::LDataCon => {
                LData::parse(service_bytes)
                    .map(CemiService::LData)
                    .unwrap_or(CemiService::Empty)
            }
            c if c.is_property() => PropertyFrame::parse(service_bytes)
                .map(CemiService::Property)
                .unwrap_or(CemiService::Empty),
            MessageCode::MResetReq | MessageCode::MResetInd => CemiService::Empty,
            _ if !service_bytes.is_empty() => {
                CemiService::Raw(Bytes::copy_from_slice(service_bytes))
            }
            _ => CemiService::Empty,
        };

        Ok(Self {
            code,
            additional_info,
            service,
        })
    }

    /// Serialize back to wire form. Exact inverse of [`parse`] for
    /// well-formed frames.
    ///
    /// [`parse`]: CemiFrame::parse
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.code.into());
        let info_len: usize = self
            .additional_info
            .iter()
            .map(|e| 2 + e.data.len())
            .sum();
        buf.put_u8(info_len as u8);
        for entry in &self.additional_info {
            buf.put_u8(entry.kind);
            buf.put_u8(entry.data.len() as u8);
            buf.put_slice(&entry.data);
        }
        match &self.service {
            CemiService::LData(ldata) => ldata.write(&mut buf),
            CemiService::Property(prop) => prop.write(&mut buf),
            CemiService::Raw(raw) => buf.put_slice(raw),
            CemiService::Empty => {}
        }
        buf.freeze()
    }

    /// A frame is valid when its message code is known and, for `L_Data`
    /// variants, the service information was complete.
    pub fn is_valid(&self) -> bool {
        match self.code {
            MessageCode::Unknown(_) => false,
            c if c.is_ldata() => matches!(self.service, CemiService::LData(_)),
            _ => true,
        }
    }

    pub fn ldata(&self) -> Option<&LData> {
        match &self.service {
            CemiService::LData(ldata) => Some(ldata),
            _ => None,
        }
    }

    pub fn property(&self) -> Option<&PropertyFrame> {
        match &self.service {
            CemiService::Property(prop) => Some(prop),
            _ => None,
        }
    }

    pub fn new_ldata(code: MessageCode, ldata: LData) -> Self {
        Self {
            code,
            additional_info: Vec::new(),
            service: CemiService::LData(ldata),
        }
    }

    pub fn new_property(code: MessageCode, prop: PropertyFrame) -> Self {
        Self {
            code,
            additional_info: Vec::new(),
            service: CemiService::Property(prop),
        }
    }

    pub fn reset_request() -> Self {
        Self {
            code: MessageCode::MResetReq,
            additional_info: Vec::new(),
            service: CemiService::Empty,
        }
    }
}

impl fmt::Display for CemiFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            CemiService::LData(l) => {
                write!(
                    f,
                    "{} {} hop={} {} -> ",
                    self.code.name(),
                    l.priority_level(),
                    l.hop_count(),
                    l.source,
                )?;
                if l.is_group_address() {
                    write!(f, "{}", GroupAddress::from(l.destination))?;
                } else {
                    write!(f, "{}", IndividualAddress::from(l.destination))?;
                }
                write!(f, " len={} data=", l.data_len)?;
                for b in l.application_data() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            CemiService::Property(p) => write!(
                f,
                "{} obj={:#06x}.{} pid={} count={} start={}",
                self.code.name(),
                p.object_type,
                p.object_instance,
                p.property_id,
                p.count,
                p.start_index,
            ),
            CemiService::Raw(raw) => {
                write!(f, "{} raw=", self.code.name())?;
                for b in raw.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            CemiService::Empty => f.write_str(self.code.name()),
        }
    }
}
