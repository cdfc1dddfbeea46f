//! Device-management connection tests: property read/write correlation.

mod common;

use std::time::Duration;

use common::*;
use knxbus_lib::bus::BusEvent;
use knxbus_lib::cemi::PropertyFrame;
use knxbus_lib::knxnet::{self, ConnectionHeader, ServiceType};
use knxbus_lib::mgmt::{MgmtConfig, MgmtConnection};

async fn open_mgmt() -> (MgmtConnection, MockGateway) {
    let gw = MockGateway::bind().await;
    let addr = gw.addr();
    let accept = tokio::spawn(async move {
        let mut gw = gw;
        let request = gw.accept(0x00).await;
        // control HPAI + data HPAI, then the device-management CRI
        assert_eq!(&request[16..18], &[0x02, 0x03]);
        gw
    });
    let config = MgmtConfig::new(addr).with_response_timeout(Duration::from_secs(2));
    let conn = MgmtConnection::open(config).await.unwrap();
    (conn, accept.await.unwrap())
}

/// Gateway half of one property exchange: ACK the request and reply with
/// the given `.con` frames (each in its own configuration request).
async fn serve_property(gw: &mut MockGateway, responses: &[CemiFrame]) {
    let (service, body) = gw.recv().await;
    assert_eq!(service, ServiceType::DeviceConfigurationRequest);
    let (header, _) = ConnectionHeader::parse(&body).unwrap();
    gw.send(&knxnet::device_configuration_ack(0x07, header.seq, 0x00))
        .await;
    for (seq, response) in responses.iter().enumerate() {
        gw.send(&knxnet::device_configuration_request(
            0x07,
            seq as u8,
            &response.to_bytes(),
        ))
        .await;
        let (service, _) = gw.recv().await;
        assert_eq!(service, ServiceType::DeviceConfigurationAck);
    }
}

#[tokio::test]
async fn read_property_resolves_with_correlated_con() {
    let (mut conn, mut gw) = open_mgmt().await;

    let gateway = async {
        let (service, body) = gw.recv().await;
        assert_eq!(service, ServiceType::DeviceConfigurationRequest);
        let (header, cemi) = ConnectionHeader::parse(&body).unwrap();
        assert_eq!(header.seq, 0);
        let request = CemiFrame::parse(cemi).unwrap();
        assert_eq!(request.code, MessageCode::MPropReadReq);
        let prop = request.property().unwrap();
        assert_eq!(prop.object_type, 0x0008);
        assert_eq!(prop.property_id, 52);
        let con = CemiFrame::new_property(
            MessageCode::MPropReadCon,
            PropertyFrame::new(0x0008, 1, 52, 1, 1, vec![0xAB, 0xCD]),
        );
        gw.send(&knxnet::device_configuration_ack(0x07, 0, 0x00)).await;
        gw.send(&knxnet::device_configuration_request(0x07, 0, &con.to_bytes()))
            .await;
        let (service, _) = gw.recv().await;
        assert_eq!(service, ServiceType::DeviceConfigurationAck);
    };

    let (data, ()) = tokio::join!(conn.read_property(0x0008, 1, 52, 1, 1), gateway);
    assert_eq!(data.unwrap(), vec![0xAB, 0xCD]);
}

#[tokio::test]
async fn read_property_reports_error_return_code() {
    let (mut conn, mut gw) = open_mgmt().await;

    let con = CemiFrame::new_property(
        MessageCode::MPropReadCon,
        PropertyFrame::new(0x0008, 1, 52, 0, 1, vec![0x07]),
    );
    let gateway = serve_property(&mut gw, std::slice::from_ref(&con));
    let (result, ()) = tokio::join!(conn.read_property(0x0008, 1, 52, 1, 1), gateway);
    assert!(matches!(result.unwrap_err(), KnxError::PropertyError(0x07)));
}

#[tokio::test]
async fn correlation_skips_unrelated_confirmations() {
    let (mut conn, mut gw) = open_mgmt().await;

    // A .con for a different property arrives first; it must not resolve
    // the outstanding read and surfaces as an ordinary event instead.
    let unrelated = CemiFrame::new_property(
        MessageCode::MPropReadCon,
        PropertyFrame::new(0x0008, 1, 53, 1, 1, vec![0xFF]),
    );
    let matching = CemiFrame::new_property(
        MessageCode::MPropReadCon,
        PropertyFrame::new(0x0008, 1, 52, 1, 1, vec![0x01]),
    );
    let frames = [unrelated.clone(), matching];
    let gateway = serve_property(&mut gw, &frames);
    let (result, ()) = tokio::join!(conn.read_property(0x0008, 1, 52, 1, 1), gateway);
    assert_eq!(result.unwrap(), vec![0x01]);

    match conn.recv().await {
        Some(BusEvent::Frame(frame)) => assert_eq!(frame, unrelated),
        other => panic!("expected the unrelated confirmation, got {other:?}"),
    }
}

#[tokio::test]
async fn write_property_resolves_on_matching_con() {
    let (mut conn, mut gw) = open_mgmt().await;

    let con = CemiFrame::new_property(
        MessageCode::MPropWriteCon,
        PropertyFrame::new(0x000B, 1, 76, 1, 1, Vec::new()),
    );
    let gateway = serve_property(&mut gw, std::slice::from_ref(&con));
    let (result, ()) = tokio::join!(
        conn.write_property(0x000B, 1, 76, 1, 1, vec![0x10]),
        gateway
    );
    result.unwrap();
}

#[tokio::test]
async fn property_times_out_without_a_con() {
    let gw = MockGateway::bind().await;
    let addr = gw.addr();
    let accept = tokio::spawn(async move {
        let mut gw = gw;
        gw.accept(0x00).await;
        // ACK the request but never send the confirmation.
        let (_, body) = gw.recv().await;
        let (header, _) = ConnectionHeader::parse(&body).unwrap();
        gw.send(&knxnet::device_configuration_ack(0x07, header.seq, 0x00))
            .await;
        gw
    });
    let config = MgmtConfig::new(addr).with_response_timeout(Duration::from_millis(300));
    let mut conn = MgmtConnection::open(config).await.unwrap();

    let err = conn.read_property(0x0008, 1, 52, 1, 1).await.unwrap_err();
    assert!(matches!(err, KnxError::ConnectionTimeout));
    accept.await.unwrap();
}
