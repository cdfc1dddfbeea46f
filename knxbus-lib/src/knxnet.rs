//! KNXnet/IP wire layer: the six-byte envelope shared by every UDP service
//! and the connection-management structures built on top of it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::bus::Layer;
use crate::error::{KnxError, Result};

/// KNXnet/IP protocol version 1.0.
pub const PROTOCOL_VERSION: u8 = 0x10;

/// Envelope header length.
pub const HEADER_SIZE: usize = 6;

/// Default KNXnet/IP UDP port.
pub const DEFAULT_PORT: u16 = 3671;

/// System setup multicast group used for discovery and routing.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

/// KNXnet/IP service type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum ServiceType {
    SearchRequest = 0x0201,
    SearchResponse = 0x0202,
    DescriptionRequest = 0x0203,
    DescriptionResponse = 0x0204,
    ConnectRequest = 0x0205,
    ConnectResponse = 0x0206,
    ConnectionstateRequest = 0x0207,
    ConnectionstateResponse = 0x0208,
    DisconnectRequest = 0x0209,
    DisconnectResponse = 0x020A,
    DeviceConfigurationRequest = 0x0310,
    DeviceConfigurationAck = 0x0311,
    TunnellingRequest = 0x0420,
    TunnellingAck = 0x0421,
    RoutingIndication = 0x0530,
    RoutingLostMessage = 0x0531,
    RoutingBusy = 0x0532,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Connection error codes carried in CONNECT/CONNECTIONSTATE status octets.
pub mod status {
    pub const NO_ERROR: u8 = 0x00;
    pub const CONNECTION_ID: u8 = 0x21;
    pub const CONNECTION_TYPE: u8 = 0x22;
    pub const CONNECTION_OPTION: u8 = 0x23;
    pub const NO_MORE_CONNECTIONS: u8 = 0x24;
    pub const DATA_CONNECTION: u8 = 0x26;
    pub const KNX_CONNECTION: u8 = 0x27;
    pub const TUNNELLING_LAYER: u8 = 0x29;

    /// Human-readable description for CLI diagnostics.
    pub fn text(code: u8) -> &'static str {
        match code {
            NO_ERROR => "no error",
            CONNECTION_ID => "connection id not found",
            CONNECTION_TYPE => "connection type not supported",
            CONNECTION_OPTION => "connection option not supported",
            NO_MORE_CONNECTIONS => "no more connections available",
            DATA_CONNECTION => "data connection error",
            KNX_CONNECTION => "KNX connection error",
            TUNNELLING_LAYER => "tunnelling layer not supported",
            _ => "unknown error",
        }
    }
}

/// Split a datagram into service type and body, validating the envelope.
pub fn parse_frame(datagram: &[u8]) -> Result<(ServiceType, &[u8])> {
    if datagram.len() < HEADER_SIZE || datagram[0] != HEADER_SIZE as u8 {
        return Err(KnxError::BadHeader);
    }
    if datagram[1] != PROTOCOL_VERSION {
        return Err(KnxError::BadVersion(datagram[1]));
    }
    let service = ServiceType::from_primitive(u16::from_be_bytes([datagram[2], datagram[3]]));
    let total = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
    if total < HEADER_SIZE || datagram.len() < total {
        return Err(KnxError::LengthMismatch {
            expected: total,
            actual: datagram.len(),
        });
    }
    Ok((service, &datagram[HEADER_SIZE..total]))
}

/// Wrap a service body in the six-byte envelope.
pub fn build_frame(service: ServiceType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u8(HEADER_SIZE as u8);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(service.into());
    buf.put_u16((HEADER_SIZE + body.len()) as u16);
    buf.put_slice(body);
    buf.freeze()
}

/// Host Protocol Address Information: an eight-byte IPv4/UDP endpoint
/// descriptor. The unspecified form `0.0.0.0:0` asks the peer to use the
/// observed datagram source instead (NAT mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    pub addr: SocketAddrV4,
}

impl Hpai {
    pub const SIZE: usize = 8;
    const IPV4_UDP: u8 = 0x01;

    pub fn new(addr: SocketAddrV4) -> Self {
        Self { addr }
    }

    pub fn unspecified() -> Self {
        Self {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.ip().is_unspecified() || self.addr.port() == 0
    }

    /// Resolve the NAT form against the datagram source that carried it.
    pub fn or_observed(self, from: SocketAddr) -> SocketAddrV4 {
        match from {
            SocketAddr::V4(observed) if self.is_unspecified() => observed,
            _ => self.addr,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || data[0] != Self::SIZE as u8 {
            return Err(KnxError::BadHeader);
        }
        if data[1] != Self::IPV4_UDP {
            return Err(KnxError::BadHeader);
        }
        let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
        let port = u16::from_be_bytes([data[6], data[7]]);
        Ok(Self {
            addr: SocketAddrV4::new(ip, port),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::SIZE as u8);
        buf.put_u8(Self::IPV4_UDP);
        buf.put_slice(&self.addr.ip().octets());
        buf.put_u16(self.addr.port());
    }
}

/// Four-byte connection header carried by TUNNELLING and
/// DEVICE_CONFIGURATION frames. The last octet is the sequence status in
/// ACKs and reserved in requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub channel: u8,
    pub seq: u8,
    pub status: u8,
}

impl ConnectionHeader {
    pub const SIZE: usize = 4;

    /// Parse the header and return the remaining payload.
    pub fn parse(body: &[u8]) -> Result<(Self, &[u8])> {
        if body.len() < Self::SIZE || (body[0] as usize) < Self::SIZE {
            return Err(KnxError::BadHeader);
        }
        let skip = body[0] as usize;
        if body.len() < skip {
            return Err(KnxError::BadHeader);
        }
        Ok((
            Self {
                channel: body[1],
                seq: body[2],
                status: body[3],
            },
            &body[skip..],
        ))
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::SIZE as u8);
        buf.put_u8(self.channel);
        buf.put_u8(self.seq);
        buf.put_u8(self.status);
    }
}

/// Connection request information block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cri {
    /// Tunnelling connection (type 0x04) on the given layer.
    Tunnel { layer: Layer },
    /// Device management connection (type 0x03).
    DeviceManagement,
}

impl Cri {
    const TUNNEL_CONNECTION: u8 = 0x04;
    const DEVICE_MGMT_CONNECTION: u8 = 0x03;

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Cri::Tunnel { layer } => {
                buf.put_u8(4);
                buf.put_u8(Self::TUNNEL_CONNECTION);
                buf.put_u8(*layer as u8);
                buf.put_u8(0);
            }
            Cri::DeviceManagement => {
                buf.put_u8(2);
                buf.put_u8(Self::DEVICE_MGMT_CONNECTION);
            }
        }
    }
}

/// Build a CONNECT_REQUEST datagram with control and data endpoints.
pub fn connect_request(control: Hpai, data: Hpai, cri: Cri) -> Bytes {
    let mut body = BytesMut::with_capacity(2 * Hpai::SIZE + 4);
    control.write(&mut body);
    data.write(&mut body);
    cri.write(&mut body);
    build_frame(ServiceType::ConnectRequest, &body)
}

/// Parsed CONNECT_RESPONSE body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub channel: u8,
    pub status: u8,
    pub data_endpoint: Hpai,
}

impl ConnectResponse {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(KnxError::BadHeader);
        }
        let (channel, status) = (body[0], body[1]);
        // Error responses may omit the data endpoint and CRD.
        let data_endpoint = if status == status::NO_ERROR && body.len() >= 2 + Hpai::SIZE {
            Hpai::parse(&body[2..])?
        } else {
            Hpai::unspecified()
        };
        Ok(Self {
            channel,
            status,
            data_endpoint,
        })
    }
}

/// CONNECTIONSTATE_REQUEST (heartbeat) datagram.
pub fn connectionstate_request(channel: u8, control: Hpai) -> Bytes {
    let mut body = BytesMut::with_capacity(2 + Hpai::SIZE);
    body.put_u8(channel);
    body.put_u8(0);
    control.write(&mut body);
    build_frame(ServiceType::ConnectionstateRequest, &body)
}

/// CONNECTIONSTATE_RESPONSE datagram (also sent to answer a
/// server-initiated heartbeat).
pub fn connectionstate_response(channel: u8, status_code: u8) -> Bytes {
    build_frame(ServiceType::ConnectionstateResponse, &[channel, status_code])
}

/// Parse a `{channel, status}` body (CONNECTIONSTATE_RESPONSE and
/// DISCONNECT_RESPONSE share the shape).
pub fn parse_channel_status(body: &[u8]) -> Result<(u8, u8)> {
    if body.len() < 2 {
        return Err(KnxError::BadHeader);
    }
    Ok((body[0], body[1]))
}

/// Parse a `{channel, reserved, control HPAI}` body (CONNECTIONSTATE_REQUEST
/// and DISCONNECT_REQUEST share the shape). The HPAI is tolerated missing.
pub fn parse_channel_request(body: &[u8]) -> Result<u8> {
    if body.is_empty() {
        return Err(KnxError::BadHeader);
    }
    Ok(body[0])
}

/// DISCONNECT_REQUEST datagram.
pub fn disconnect_request(channel: u8, control: Hpai) -> Bytes {
    let mut body = BytesMut::with_capacity(2 + Hpai::SIZE);
    body.put_u8(channel);
    body.put_u8(0);
    control.write(&mut body);
    build_frame(ServiceType::DisconnectRequest, &body)
}

/// DISCONNECT_RESPONSE datagram.
pub fn disconnect_response(channel: u8, status_code: u8) -> Bytes {
    build_frame(ServiceType::DisconnectResponse, &[channel, status_code])
}

/// TUNNELLING_REQUEST datagram carrying a cEMI frame.
pub fn tunnelling_request(channel: u8, seq: u8, cemi: &[u8]) -> Bytes {
    data_request(ServiceType::TunnellingRequest, channel, seq, cemi)
}

/// TUNNELLING_ACK datagram.
pub fn tunnelling_ack(channel: u8, seq: u8, status_code: u8) -> Bytes {
    data_ack(ServiceType::TunnellingAck, channel, seq, status_code)
}

/// DEVICE_CONFIGURATION_REQUEST datagram carrying a cEMI property frame.
pub fn device_configuration_request(channel: u8, seq: u8, cemi: &[u8]) -> Bytes {
    data_request(ServiceType::DeviceConfigurationRequest, channel, seq, cemi)
}

/// DEVICE_CONFIGURATION_ACK datagram.
pub fn device_configuration_ack(channel: u8, seq: u8, status_code: u8) -> Bytes {
    data_ack(ServiceType::DeviceConfigurationAck, channel, seq, status_code)
}

fn data_request(service: ServiceType, channel: u8, seq: u8, cemi: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(ConnectionHeader::SIZE + cemi.len());
    ConnectionHeader {
        channel,
        seq,
        status: 0,
    }
    .write(&mut body);
    body.put_slice(cemi);
    build_frame(service, &body)
}

fn data_ack(service: ServiceType, channel: u8, seq: u8, status_code: u8) -> Bytes {
    let mut body = BytesMut::with_capacity(ConnectionHeader::SIZE);
    ConnectionHeader {
        channel,
        seq,
        status: status_code,
    }
    .write(&mut body);
    build_frame(service, &body)
}

/// ROUTING_INDICATION datagram carrying a cEMI frame.
pub fn routing_indication(cemi: &[u8]) -> Bytes {
    build_frame(ServiceType::RoutingIndication, cemi)
}

/// Parsed ROUTING_LOST_MESSAGE body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingLost {
    pub device_state: u8,
    pub lost: u16,
}

impl RoutingLost {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(KnxError::BadHeader);
        }
        Ok(Self {
            device_state: body[1],
            lost: u16::from_be_bytes([body[2], body[3]]),
        })
    }

    pub fn to_frame(self) -> Bytes {
        let mut body = BytesMut::with_capacity(4);
        body.put_u8(4);
        body.put_u8(self.device_state);
        body.put_u16(self.lost);
        build_frame(ServiceType::RoutingLostMessage, &body)
    }
}

/// Parsed ROUTING_BUSY body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingBusy {
    pub device_state: u8,
    /// Requested pause before resuming transmission, in milliseconds.
    pub wait_time: u16,
    pub control: u16,
}

impl RoutingBusy {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 6 {
            return Err(KnxError::BadHeader);
        }
        Ok(Self {
            device_state: body[1],
            wait_time: u16::from_be_bytes([body[2], body[3]]),
            control: u16::from_be_bytes([body[4], body[5]]),
        })
    }

    pub fn to_frame(self) -> Bytes {
        let mut body = BytesMut::with_capacity(6);
        body.put_u8(6);
        body.put_u8(self.device_state);
        body.put_u16(self.wait_time);
        body.put_u16(self.control);
        build_frame(ServiceType::RoutingBusy, &body)
    }
}
