//! KNXnet/IP server discovery via SEARCH_REQUEST / SEARCH_RESPONSE.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::addr::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::knxnet::{self, Hpai, ServiceType, DEFAULT_PORT, MULTICAST_GROUP};

/// DIB type code: device information.
const DIB_DEVICE_INFO: u8 = 0x01;
/// DIB type code: supported service families.
const DIB_SERVICE_FAMILIES: u8 = 0x02;

bitflags! {
    /// Capabilities derived from the supported-service-families DIB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const CORE = 1 << 0;
        const DEVICE_MANAGEMENT = 1 << 1;
        const TUNNELLING = 1 << 2;
        const ROUTING = 1 << 3;
        const REMOTE_LOGGING = 1 << 4;
        const REMOTE_CONFIG = 1 << 5;
        const OBJECT_SERVER = 1 << 6;
    }
}

impl Capabilities {
    /// Map a service-family id (core tables) onto a capability flag.
    fn from_family(family: u8) -> Self {
        match family {
            0x02 => Self::CORE,
            0x03 => Self::DEVICE_MANAGEMENT,
            0x04 => Self::TUNNELLING,
            0x05 => Self::ROUTING,
            0x06 => Self::REMOTE_LOGGING,
            0x07 => Self::REMOTE_CONFIG,
            0x08 => Self::OBJECT_SERVER,
            _ => Self::empty(),
        }
    }
}

/// One discovered KNXnet/IP server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Control endpoint the server answers on.
    pub addr: SocketAddrV4,
    pub capabilities: Capabilities,
    pub device_state: u8,
    pub knx_medium: u8,
    pub knx_address: IndividualAddress,
    pub project_installation_id: u16,
    pub serial_number: [u8; 6],
    pub mac_address: [u8; 6],
    /// Friendly name from the device-info DIB, NUL padding stripped.
    pub friendly_name: String,
    /// Raw `{family, version}` pairs as advertised.
    pub service_families: Vec<(u8, u8)>,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.friendly_name
    }

    /// Parse a SEARCH_RESPONSE body: control HPAI followed by DIBs.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let hpai = Hpai::parse(body)?;
        let mut endpoint = Self {
            addr: hpai.addr,
            capabilities: Capabilities::empty(),
            device_state: 0,
            knx_medium: 0,
            knx_address: IndividualAddress::from(0),
            project_installation_id: 0,
            serial_number: [0; 6],
            mac_address: [0; 6],
            friendly_name: String::new(),
            service_families: Vec::new(),
        };

        let mut at = Hpai::SIZE;
        while at + 2 <= body.len() {
            let len = body[at] as usize;
            if len < 2 || at + len > body.len() {
                break;
            }
            let dib = &body[at..at + len];
            match dib[1] {
                DIB_DEVICE_INFO if len >= 54 => {
                    endpoint.knx_medium = dib[2];
                    endpoint.device_state = dib[3];
                    endpoint.knx_address =
                        IndividualAddress::from(u16::from_be_bytes([dib[4], dib[5]]));
                    endpoint.project_installation_id = u16::from_be_bytes([dib[6], dib[7]]);
                    endpoint.serial_number.copy_from_slice(&dib[8..14]);
                    // routing multicast address at 14..18 is not retained
                    endpoint.mac_address.copy_from_slice(&dib[18..24]);
                    let name = &dib[24..54];
                    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                    endpoint.friendly_name =
                        String::from_utf8_lossy(&name[..end]).into_owned();
                }
                DIB_SERVICE_FAMILIES => {
                    for pair in dib[2..].chunks_exact(2) {
                        endpoint.service_families.push((pair[0], pair[1]));
                        endpoint.capabilities |= Capabilities::from_family(pair[0]);
                    }
                }
                other => debug!(dib = other, "skipping unknown DIB"),
            }
            at += len;
        }
        Ok(endpoint)
    }
}

/// Build a SEARCH_REQUEST whose response endpoint is the NAT form with the
/// given local port.
pub fn search_request(local_port: u16) -> Bytes {
    let mut body = BytesMut::with_capacity(Hpai::SIZE);
    Hpai::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port)).write(&mut body);
    knxnet::build_frame(ServiceType::SearchRequest, &body)
}

/// Discovery parameters.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long to collect responses after the request is sent.
    pub search_timeout: Duration,
    /// Local port to bind; 0 for ephemeral.
    pub local_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(3),
            local_port: 0,
        }
    }
}

/// Multicast a SEARCH_REQUEST and collect all answering endpoints,
/// deduplicated by control-endpoint address.
pub async fn discover(config: DiscoveryConfig) -> Result<Vec<Endpoint>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.local_port)).await?;
    let local_port = socket.local_addr()?.port();
    let request = search_request(local_port);
    socket
        .send_to(&request, (MULTICAST_GROUP, DEFAULT_PORT))
        .await?;
    debug!(local_port, "search request sent");

    let deadline = Instant::now() + config.search_timeout;
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => return Err(KnxError::Io(e)),
            Ok(Ok(received)) => received,
        };
        match knxnet::parse_frame(&buf[..len]) {
            Ok((ServiceType::SearchResponse, body)) => match Endpoint::parse(body) {
                Ok(endpoint) => {
                    if seen.insert(endpoint.addr) {
                        debug!(%from, name = endpoint.name(), "endpoint discovered");
                        endpoints.push(endpoint);
                    }
                }
                Err(e) => warn!(%from, "unparseable search response: {e}"),
            },
            Ok((service, _)) => debug!(?service, "ignoring unrelated service"),
            Err(e) => debug!(%from, "dropping invalid datagram: {e}"),
        }
    }
    Ok(endpoints)
}
