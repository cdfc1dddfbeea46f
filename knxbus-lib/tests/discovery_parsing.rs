//! SEARCH_RESPONSE parsing and capability derivation tests.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};

use common::*;
use knxbus_lib::discovery::{search_request, Capabilities, Endpoint};
use knxbus_lib::knxnet::{self, ServiceType};

/// Assemble a SEARCH_RESPONSE body: control HPAI, device-info DIB,
/// service-families DIB.
fn search_response_body(families: &[(u8, u8)]) -> Vec<u8> {
    let mut body = Vec::new();
    // control endpoint 192.168.200.12:3671
    body.extend_from_slice(&[0x08, 0x01, 192, 168, 200, 12, 0x0E, 0x57]);
    // device info DIB (54 bytes)
    body.extend_from_slice(&[54, 0x01]);
    body.push(0x02); // medium TP1
    body.push(0x01); // status: programming mode
    body.extend_from_slice(&[0x11, 0x00]); // individual address 1.1.0
    body.extend_from_slice(&[0x00, 0x11]); // project installation id
    body.extend_from_slice(&[0x00, 0x01, 0x11, 0x11, 0x11, 0x11]); // serial
    body.extend_from_slice(&[224, 0, 23, 12]); // routing multicast
    body.extend_from_slice(&[0x45, 0x49, 0x42, 0x6E, 0x65, 0x74]); // MAC
    body.extend_from_slice(b"MYHOME\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0");
    // service families DIB
    body.push(2 + 2 * families.len() as u8);
    body.push(0x02);
    for (family, version) in families {
        body.push(*family);
        body.push(*version);
    }
    body
}

#[test]
fn parse_search_response() {
    let body = search_response_body(&[(0x02, 1), (0x03, 2), (0x04, 1), (0x05, 1)]);
    let endpoint = Endpoint::parse(&body).unwrap();

    assert_eq!(
        endpoint.addr,
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 200, 12), 3671)
    );
    assert_eq!(endpoint.knx_medium, 0x02);
    assert_eq!(endpoint.device_state, 0x01);
    assert_eq!(endpoint.knx_address, IndividualAddress::new(1, 1, 0));
    assert_eq!(endpoint.project_installation_id, 0x0011);
    assert_eq!(endpoint.serial_number, [0x00, 0x01, 0x11, 0x11, 0x11, 0x11]);
    assert_eq!(endpoint.mac_address, [0x45, 0x49, 0x42, 0x6E, 0x65, 0x74]);
    assert_eq!(endpoint.name(), "MYHOME");
    assert_eq!(endpoint.service_families.len(), 4);
    assert!(endpoint.capabilities.contains(
        Capabilities::CORE
            | Capabilities::DEVICE_MANAGEMENT
            | Capabilities::TUNNELLING
            | Capabilities::ROUTING
    ));
}

#[test]
fn capabilities_follow_the_family_list() {
    // Core + tunnelling + routing: management stays clear.
    let body = search_response_body(&[(0x02, 1), (0x04, 1), (0x05, 1)]);
    let endpoint = Endpoint::parse(&body).unwrap();
    assert!(endpoint.capabilities.contains(Capabilities::CORE));
    assert!(endpoint.capabilities.contains(Capabilities::TUNNELLING));
    assert!(endpoint.capabilities.contains(Capabilities::ROUTING));
    assert!(!endpoint.capabilities.contains(Capabilities::DEVICE_MANAGEMENT));
    assert!(!endpoint.capabilities.contains(Capabilities::OBJECT_SERVER));
}

#[test]
fn unknown_dibs_are_skipped() {
    let mut body = search_response_body(&[(0x04, 1)]);
    // Append a manufacturer-data DIB; it must not break parsing.
    body.extend_from_slice(&[0x06, 0xFE, 0x00, 0x01, 0xAA, 0xBB]);
    let endpoint = Endpoint::parse(&body).unwrap();
    assert!(endpoint.capabilities.contains(Capabilities::TUNNELLING));
}

#[test]
fn truncated_response_is_an_error() {
    assert!(Endpoint::parse(&[0x08, 0x01, 192, 168]).is_err());
}

#[test]
fn search_request_layout() {
    let datagram = search_request(50123);
    let (service, body) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::SearchRequest);
    assert_eq!(datagram.len(), 14);
    // NAT form: unspecified address, concrete port.
    assert_eq!(&body[..6], &[0x08, 0x01, 0, 0, 0, 0]);
    assert_eq!(u16::from_be_bytes([body[6], body[7]]), 50123);
}
