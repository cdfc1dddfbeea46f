//! KNXnet/IP envelope and service-structure tests.

mod common;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use common::*;
use knxbus_lib::bus::Layer;
use knxbus_lib::knxnet::{
    self, ConnectResponse, ConnectionHeader, Cri, Hpai, RoutingBusy, RoutingLost, ServiceType,
};

#[test]
fn envelope_round_trip() {
    let body = hex_to_bytes(LDATA_IND_STANDARD);
    let datagram = knxnet::build_frame(ServiceType::RoutingIndication, &body);
    assert_eq!(datagram[0], 0x06);
    assert_eq!(datagram[1], 0x10);
    assert_eq!(&datagram[2..4], &[0x05, 0x30]);
    assert_eq!(
        u16::from_be_bytes([datagram[4], datagram[5]]) as usize,
        datagram.len()
    );

    let (service, parsed_body) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::RoutingIndication);
    assert_eq!(parsed_body, &body[..]);
}

#[test]
fn service_type_values_are_normative() {
    assert_eq!(u16::from(ServiceType::SearchRequest), 0x0201);
    assert_eq!(u16::from(ServiceType::SearchResponse), 0x0202);
    assert_eq!(u16::from(ServiceType::ConnectRequest), 0x0205);
    assert_eq!(u16::from(ServiceType::ConnectResponse), 0x0206);
    assert_eq!(u16::from(ServiceType::ConnectionstateRequest), 0x0207);
    assert_eq!(u16::from(ServiceType::ConnectionstateResponse), 0x0208);
    assert_eq!(u16::from(ServiceType::DisconnectRequest), 0x0209);
    assert_eq!(u16::from(ServiceType::DeviceConfigurationRequest), 0x0310);
    assert_eq!(u16::from(ServiceType::DeviceConfigurationAck), 0x0311);
    assert_eq!(u16::from(ServiceType::TunnellingRequest), 0x0420);
    assert_eq!(u16::from(ServiceType::TunnellingAck), 0x0421);
    assert_eq!(u16::from(ServiceType::RoutingIndication), 0x0530);
    assert_eq!(u16::from(ServiceType::RoutingLostMessage), 0x0531);
    assert_eq!(u16::from(ServiceType::RoutingBusy), 0x0532);
}

#[test]
fn bad_envelopes_are_rejected() {
    // Wrong header size octet.
    assert!(matches!(
        knxnet::parse_frame(&[0x05, 0x10, 0x02, 0x01, 0x00, 0x06]),
        Err(KnxError::BadHeader)
    ));
    // Wrong protocol version.
    assert!(matches!(
        knxnet::parse_frame(&[0x06, 0x20, 0x02, 0x01, 0x00, 0x06]),
        Err(KnxError::BadVersion(0x20))
    ));
    // Declared length exceeds the datagram.
    assert!(matches!(
        knxnet::parse_frame(&[0x06, 0x10, 0x02, 0x01, 0x00, 0x10]),
        Err(KnxError::LengthMismatch { .. })
    ));
    // Truncated header.
    assert!(knxnet::parse_frame(&[0x06, 0x10]).is_err());
}

#[test]
fn unknown_service_types_are_carried_through() {
    let datagram = knxnet::build_frame(ServiceType::Unknown(0x0999), &[]);
    let (service, _) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::Unknown(0x0999));
}

#[test]
fn hpai_round_trip_and_nat_rewrite() {
    let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671);
    let hpai = Hpai::new(addr);
    let mut buf = bytes::BytesMut::new();
    hpai.write(&mut buf);
    assert_eq!(
        buf.as_ref(),
        &[0x08, 0x01, 192, 168, 1, 10, 0x0E, 0x57]
    );
    assert_eq!(Hpai::parse(&buf).unwrap(), hpai);

    // The NAT form resolves to the observed source address.
    let observed = SocketAddr::from(([10, 0, 0, 7], 50123));
    assert_eq!(
        Hpai::unspecified().or_observed(observed),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 50123)
    );
    // A concrete endpoint is kept as-is.
    assert_eq!(hpai.or_observed(observed), addr);
}

#[test]
fn connect_request_layout() {
    let local = Hpai::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 50000));
    let datagram = knxnet::connect_request(
        local,
        local,
        Cri::Tunnel {
            layer: Layer::LinkLayer,
        },
    );
    // header + two HPAIs + CRI
    assert_eq!(datagram.len(), 6 + 8 + 8 + 4);
    assert_eq!(&datagram[2..4], &[0x02, 0x05]);
    assert_eq!(&datagram[22..26], &[0x04, 0x04, 0x02, 0x00]);

    let datagram = knxnet::connect_request(local, local, Cri::DeviceManagement);
    assert_eq!(datagram.len(), 6 + 8 + 8 + 2);
    assert_eq!(&datagram[22..24], &[0x02, 0x03]);

    let datagram = knxnet::connect_request(
        local,
        local,
        Cri::Tunnel {
            layer: Layer::Busmonitor,
        },
    );
    assert_eq!(&datagram[22..26], &[0x04, 0x04, 0x80, 0x00]);
}

#[test]
fn connect_response_parse() {
    // channel 7, ok, data endpoint 0.0.0.0:0, CRD {4, 4, 0x11, 0x01}
    let body = [
        0x07, 0x00, 0x08, 0x01, 0, 0, 0, 0, 0x00, 0x00, 0x04, 0x04, 0x11, 0x01,
    ];
    let response = ConnectResponse::parse(&body).unwrap();
    assert_eq!(response.channel, 0x07);
    assert_eq!(response.status, 0x00);
    assert!(response.data_endpoint.is_unspecified());

    // Refused responses can be short.
    let response = ConnectResponse::parse(&[0x00, 0x24]).unwrap();
    assert_eq!(response.status, 0x24);
}

#[test]
fn tunnelling_frames_share_the_connection_header() {
    let cemi = hex_to_bytes(LDATA_IND_STANDARD);
    let datagram = knxnet::tunnelling_request(0x07, 0x2A, &cemi);
    let (service, body) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::TunnellingRequest);
    let (header, payload) = ConnectionHeader::parse(body).unwrap();
    assert_eq!(header.channel, 0x07);
    assert_eq!(header.seq, 0x2A);
    assert_eq!(payload, &cemi[..]);

    let ack = knxnet::tunnelling_ack(0x07, 0x2A, 0x00);
    assert_eq!(
        ack.as_ref(),
        &[0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x07, 0x2A, 0x00]
    );

    let datagram = knxnet::device_configuration_request(0x03, 0x01, &cemi);
    let (service, body) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::DeviceConfigurationRequest);
    let (header, payload) = ConnectionHeader::parse(body).unwrap();
    assert_eq!((header.channel, header.seq), (0x03, 0x01));
    assert_eq!(payload, &cemi[..]);
}

#[test]
fn routing_notification_bodies() {
    let lost = RoutingLost {
        device_state: 0x01,
        lost: 5,
    };
    let datagram = lost.to_frame();
    let (service, body) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::RoutingLostMessage);
    assert_eq!(RoutingLost::parse(body).unwrap(), lost);

    let busy = RoutingBusy {
        device_state: 0x00,
        wait_time: 100,
        control: 0x0000,
    };
    let datagram = busy.to_frame();
    let (service, body) = knxnet::parse_frame(&datagram).unwrap();
    assert_eq!(service, ServiceType::RoutingBusy);
    assert_eq!(RoutingBusy::parse(body).unwrap(), busy);
}

#[test]
fn status_codes_have_descriptions() {
    assert_eq!(knxnet::status::text(0x00), "no error");
    assert_eq!(knxnet::status::text(0x24), "no more connections available");
    assert_eq!(knxnet::status::text(0x29), "tunnelling layer not supported");
}
