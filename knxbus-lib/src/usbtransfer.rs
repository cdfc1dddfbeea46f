//! KNX USB framing: HID reports wrapping the KNX USB Transfer Protocol,
//! which in turn carries EMI/cEMI frames.
//!
//! Outbound, a transfer frame is chopped into fixed 64-byte HID reports:
//!
//! ```text
//! report id (0x01) | seq:4 pkt-type:4 | body len | body ... zero padding
//! ```
//!
//! Inbound, reports are reassembled until the end bit is seen, yielding one
//! transfer frame:
//!
//! ```text
//! version (0x00) | header len (0x08) | body len (2) | protocol id |
//! EMI id / service id | manufacturer (2) | EMI message code + payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::error::{KnxError, Result};

/// Fixed HID report size.
pub const REPORT_SIZE: usize = 64;

/// The only report id KNX USB interfaces use; others are ignored.
pub const REPORT_ID: u8 = 0x01;

/// Report body capacity: 64 minus report id, info and length octets.
pub const MAX_REPORT_BODY: usize = 61;

/// Packet-type bit: first report of a packet.
pub const PACKET_START: u8 = 0x01;
/// Packet-type bit: last report of a packet.
pub const PACKET_END: u8 = 0x02;
/// Packet-type bit: continuation report.
pub const PACKET_PARTIAL: u8 = 0x04;

/// Sequence counter and packet-type bits packed into one octet.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportInfo {
    pub packet_type: B4,
    pub sequence: B4,
}

/// One HID report.
#[derive(Debug, Clone, PartialEq)]
pub struct HidReport {
    pub info: ReportInfo,
    pub body: Bytes,
}

impl HidReport {
    pub fn new(sequence: u8, packet_type: u8, body: Bytes) -> Self {
        debug_assert!(body.len() <= MAX_REPORT_BODY);
        Self {
            info: ReportInfo::new()
                .with_sequence(sequence & 0x0F)
                .with_packet_type(packet_type & 0x0F),
            body,
        }
    }

    /// Parse a report, returning `None` for foreign report ids or truncated
    /// data. HID gives us fixed-size reports; anything that does not look
    /// like a KNX report is simply not ours.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 3 || raw[0] != REPORT_ID {
            return None;
        }
        let info = ReportInfo::from_bytes([raw[1]]);
        let len = (raw[2] as usize).min(raw.len() - 3).min(MAX_REPORT_BODY);
        Some(Self {
            info,
            body: Bytes::copy_from_slice(&raw[3..3 + len]),
        })
    }

    /// Serialize to the fixed 64-byte outbound report.
    pub fn to_bytes(&self) -> [u8; REPORT_SIZE] {
        let mut out = [0u8; REPORT_SIZE];
        out[0] = REPORT_ID;
        out[1] = self.info.into_bytes()[0];
        out[2] = self.body.len() as u8;
        out[3..3 + self.body.len()].copy_from_slice(&self.body);
        out
    }
}

/// Reassembles HID report bodies into transfer-frame packets.
///
/// A start report replaces any partial buffer; continuation reports append;
/// the end report delivers the assembled packet.
#[derive(Debug, Default)]
pub struct ReportAssembler {
    buffer: Vec<u8>,
}

impl ReportAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw report bytes; returns an assembled packet when complete.
    pub fn feed(&mut self, raw: &[u8]) -> Option<Bytes> {
        let report = HidReport::parse(raw)?;
        self.push(&report)
    }

    pub fn push(&mut self, report: &HidReport) -> Option<Bytes> {
        let packet_type = report.info.packet_type();
        if packet_type & PACKET_START != 0 {
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(&report.body);
        if packet_type & PACKET_END != 0 {
            return Some(Bytes::from(std::mem::take(&mut self.buffer)));
        }
        None
    }
}

/// Protocol identifiers of the USB Transfer Protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ProtocolId {
    /// EMI frames tunnelled to the bus.
    KnxTunnel = 0x01,
    /// Bus-access-server feature service.
    BusAccessServer = 0x0F,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// EMI format identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum EmiId {
    Emi1 = 0x01,
    Emi2 = 0x02,
    Cemi = 0x03,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Bus-access-server feature identifiers and service codes.
pub mod feature {
    pub const SUPPORTED_EMI: u8 = 0x01;
    pub const HOST_DEVICE_DESCRIPTOR: u8 = 0x02;
    pub const BUS_CONNECTION_STATUS: u8 = 0x03;
    pub const KNX_MANUFACTURER: u8 = 0x04;
    pub const ACTIVE_EMI: u8 = 0x05;

    pub const SERVICE_GET: u8 = 0x01;
    pub const SERVICE_RESPONSE: u8 = 0x02;
    pub const SERVICE_SET: u8 = 0x03;
    pub const SERVICE_INFO: u8 = 0x04;
}

/// KNX USB Transfer Protocol frame.
///
/// For `BusAccessServer` frames the `emi_id` octet carries the feature
/// service code instead of an EMI format.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFrame {
    pub protocol: ProtocolId,
    pub emi_id: u8,
    pub manufacturer: u16,
    pub body: Bytes,
}

impl TransferFrame {
    pub const HEADER_SIZE: usize = 8;
    const VERSION: u8 = 0x00;

    /// Wrap cEMI bytes for transmission to the bus.
    pub fn cemi(cemi: &[u8]) -> Self {
        Self {
            protocol: ProtocolId::KnxTunnel,
            emi_id: EmiId::Cemi.into(),
            manufacturer: 0,
            body: Bytes::copy_from_slice(cemi),
        }
    }

    /// Feature-service set request, e.g. selecting the active EMI.
    pub fn feature_set(feature_id: u8, value: u8) -> Self {
        Self {
            protocol: ProtocolId::BusAccessServer,
            emi_id: feature::SERVICE_SET,
            manufacturer: 0,
            body: Bytes::copy_from_slice(&[feature_id, value]),
        }
    }

    /// Feature-service get request.
    pub fn feature_get(feature_id: u8) -> Self {
        Self {
            protocol: ProtocolId::BusAccessServer,
            emi_id: feature::SERVICE_GET,
            manufacturer: 0,
            body: Bytes::copy_from_slice(&[feature_id]),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(KnxError::BadCemi("transfer frame header truncated"));
        }
        if data[0] != Self::VERSION || data[1] != Self::HEADER_SIZE as u8 {
            return Err(KnxError::BadCemi("unsupported transfer protocol header"));
        }
        let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < Self::HEADER_SIZE + body_len {
            return Err(KnxError::BadCemi("transfer frame body truncated"));
        }
        Ok(Self {
            protocol: ProtocolId::from_primitive(data[4]),
            emi_id: data[5],
            manufacturer: u16::from_be_bytes([data[6], data[7]]),
            body: Bytes::copy_from_slice(&data[8..8 + body_len]),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.body.len());
        buf.put_u8(Self::VERSION);
        buf.put_u8(Self::HEADER_SIZE as u8);
        buf.put_u16(self.body.len() as u16);
        buf.put_u8(self.protocol.into());
        buf.put_u8(self.emi_id);
        buf.put_u16(self.manufacturer);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// First body octet: the EMI message code of a tunnelled frame.
    pub fn emi_message_code(&self) -> Option<u8> {
        self.body.first().copied()
    }

    /// Chop the serialized frame into HID reports ready for transmission.
    pub fn to_reports(&self) -> Vec<HidReport> {
        let packet = self.to_bytes();
        let chunks: Vec<&[u8]> = packet.chunks(MAX_REPORT_BODY).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut packet_type = if i == 0 { PACKET_START } else { PACKET_PARTIAL };
                if i == last {
                    packet_type |= PACKET_END;
                }
                HidReport::new(((i + 1) & 0x0F) as u8, packet_type, Bytes::copy_from_slice(chunk))
            })
            .collect()
    }
}
